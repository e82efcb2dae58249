use std::{convert::Infallible, fmt::Display};

use crate::Shape;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid static construction: bad hyperparameters, missing loss,
    /// untracked trainability.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Shape mismatch found while building a graph.
    #[error("shape error in `{layer}`: {reason} ({lhs} vs {rhs})")]
    Shape {
        layer: String,
        lhs: Shape,
        rhs: Shape,
        reason: String,
    },

    /// The backend failed to allocate, compile or execute.
    #[error("device error: {0}")]
    Device(String),

    /// A resource was used after its backing store was released.
    #[error("resource error: {0}")]
    Resource(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Message: {0}")]
    Msg(String),

    #[error("{inner}\n{backtrace}")]
    WithBacktrace {
        inner: Box<Self>,
        backtrace: Box<std::backtrace::Backtrace>,
    },

    /// An error with a context string, see [`Context`].
    #[error("{context}: {wrapped}")]
    WrappedContext {
        wrapped: Box<dyn std::error::Error + Send + Sync>,
        context: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::IoError(value.to_string())
    }
}

impl Error {
    pub fn msg<M: Display>(msg: M) -> Self {
        Self::Msg(msg.to_string()).bt()
    }

    pub fn config<M: Display>(msg: M) -> Self {
        Self::Configuration(msg.to_string()).bt()
    }

    pub fn shape<L: Display, R: Display>(layer: L, lhs: &Shape, rhs: &Shape, reason: R) -> Self {
        Self::Shape {
            layer: layer.to_string(),
            lhs: lhs.clone(),
            rhs: rhs.clone(),
            reason: reason.to_string(),
        }
        .bt()
    }

    pub fn device<M: Display>(msg: M) -> Self {
        Self::Device(msg.to_string()).bt()
    }

    pub fn resource<M: Display>(msg: M) -> Self {
        Self::Resource(msg.to_string()).bt()
    }

    pub fn bt(self) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        match backtrace.status() {
            std::backtrace::BacktraceStatus::Disabled
            | std::backtrace::BacktraceStatus::Unsupported => self,
            _ => Self::WithBacktrace {
                inner: Box::new(self),
                backtrace: Box::new(backtrace),
            },
        }
    }

    /// The innermost error of this crate, with backtraces and context
    /// wrappers peeled off.
    pub fn root(&self) -> &Error {
        match self {
            Self::WithBacktrace { inner, .. } => inner.root(),
            Self::WrappedContext { wrapped, .. } => {
                match wrapped.downcast_ref::<Error>() {
                    Some(inner) => inner.root(),
                    None => self,
                }
            }
            _ => self,
        }
    }

    /// Context strings attached on the way out, outermost first.
    pub fn contexts(&self) -> Vec<&str> {
        let mut out = Vec::new();
        let mut current = self;
        loop {
            match current {
                Self::WithBacktrace { inner, .. } => current = inner,
                Self::WrappedContext { wrapped, context } => {
                    out.push(context.as_str());
                    match wrapped.downcast_ref::<Error>() {
                        Some(inner) => current = inner,
                        None => break,
                    }
                }
                _ => break,
            }
        }
        out
    }

    /// Labels of the models this error passed through, outermost first.
    pub fn model_chain(&self) -> Vec<&str> {
        self.contexts()
            .into_iter()
            .filter_map(|c| c.strip_prefix("in model `"))
            .filter_map(|c| c.strip_suffix('`'))
            .collect()
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self.root(), Self::Configuration(_))
    }

    pub fn is_shape(&self) -> bool {
        matches!(self.root(), Self::Shape { .. })
    }

    pub fn is_device(&self) -> bool {
        matches!(self.root(), Self::Device(_))
    }

    pub fn is_resource(&self) -> bool {
        matches!(self.root(), Self::Resource(_))
    }
}

/// Return early with an [`Error::Configuration`] built from a format string.
#[macro_export]
macro_rules! bail_config {
    ($($arg:tt)*) => {
        return Err($crate::Error::config(format!($($arg)*)))
    };
}

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for std::result::Result<T, E> where E: std::error::Error {}
    impl<T> Sealed for Option<T> {}
}

/// Wrap errors with a context string, such as the label of the model being
/// built. [`Error::contexts`] reads them back.
pub trait Context<T, E>: private::Sealed {
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static;

    /// Like [`Context::context`], building the string only on error.
    fn with_context<C, F>(self, f: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Ok(ok) => Ok(ok),
            Err(error) => Err(Error::WrappedContext {
                wrapped: Box::new(error),
                context: context.to_string(),
            }),
        }
    }

    fn with_context<C, F>(self, context: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        match self {
            Ok(ok) => Ok(ok),
            Err(error) => Err(Error::WrappedContext {
                wrapped: Box::new(error),
                context: context().to_string(),
            }),
        }
    }
}

impl<T> Context<T, Infallible> for Option<T> {
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Some(ok) => Ok(ok),
            None => Err(Error::msg(context)),
        }
    }

    fn with_context<C, F>(self, f: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        match self {
            Some(ok) => Ok(ok),
            None => Err(Error::msg(f())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_peels_context() {
        let inner: Result<()> = Err(Error::config("bad channels"));
        let err = inner
            .context("in model `inner`")
            .context("in model `outer`")
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(err.model_chain(), vec!["outer", "inner"]);
        assert!(err.to_string().contains("outer"));
    }
}
