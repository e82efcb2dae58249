use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

macro_rules! node_id {
    ($(#[$meta:meta])* $name:ident, $counter:ident) => {
        static $counter: AtomicUsize = AtomicUsize::new(1);

        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            pub(crate) fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            pub fn get(&self) -> usize {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

node_id!(
    /// Identity of a symbolic tensor. Equality of tensors is equality of ids.
    TensorId,
    NEXT_TENSOR_ID
);
node_id!(
    /// Identity of a layer, shared by every tensor that applies it.
    LayerId,
    NEXT_LAYER_ID
);
node_id!(ModelId, NEXT_MODEL_ID);
node_id!(
    /// Identity of a compiled execution node.
    NodeId,
    NEXT_NODE_ID
);
node_id!(DeviceId, NEXT_DEVICE_ID);

/// Picks the given label, or `<kind><id>` when none was supplied.
pub(crate) fn label_or_default(label: Option<String>, kind: &str, id: usize) -> String {
    match label {
        Some(l) if !l.trim().is_empty() => l,
        _ => format!("{kind}{id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = TensorId::next();
        let b = TensorId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn default_labels() {
        assert_eq!(label_or_default(None, "Input", 3), "Input3");
        assert_eq!(label_or_default(Some(" ".into()), "Dense", 9), "Dense9");
        assert_eq!(label_or_default(Some("x".into()), "Input", 3), "x");
    }
}
