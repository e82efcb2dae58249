use std::fmt;
use std::sync::Arc;

use crate::{
    handle::{DeviceId, LayerId, NodeId, TensorId},
    layer::{LayerKind, WeightDataSource},
    Shape,
};

/// What a compiled node computes.
#[derive(Debug, Clone)]
pub enum NodeOp {
    /// Fed per batch from the model inputs.
    Input { tensor: TensorId },
    /// Fed per batch from the data set outputs.
    Labels {
        tensor: TensorId,
        output: Option<TensorId>,
    },
    Constant(f32),
    Array(Arc<[f32]>),
    Layer { layer: LayerId, kind: LayerKind },
}

/// A backend-neutral node of an executable graph, bound to one device.
///
/// Nodes are memoized: source tensors cache theirs per device, layers cache
/// theirs per device and upstream node ids.
pub struct ExecNode {
    id: NodeId,
    device: DeviceId,
    label: String,
    op: NodeOp,
    shape: Shape,
    inputs: Vec<Arc<ExecNode>>,
    weights: Option<Arc<dyn WeightDataSource>>,
}

impl ExecNode {
    pub(crate) fn new(
        device: DeviceId,
        label: String,
        op: NodeOp,
        shape: Shape,
        inputs: Vec<Arc<ExecNode>>,
        weights: Option<Arc<dyn WeightDataSource>>,
    ) -> Self {
        Self {
            id: NodeId::next(),
            device,
            label,
            op,
            shape,
            inputs,
            weights,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn op(&self) -> &NodeOp {
        &self.op
    }

    /// Shape of one row; batches add an implicit leading dimension.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn inputs(&self) -> &[Arc<ExecNode>] {
        &self.inputs
    }

    pub fn weights(&self) -> Option<&Arc<dyn WeightDataSource>> {
        self.weights.as_ref()
    }

    pub fn layer_kind(&self) -> Option<&LayerKind> {
        match &self.op {
            NodeOp::Layer { kind, .. } => Some(kind),
            _ => None,
        }
    }

    pub fn layer_id(&self) -> Option<LayerId> {
        match &self.op {
            NodeOp::Layer { layer, .. } => Some(*layer),
            _ => None,
        }
    }

    /// Whether the node reads a per-batch buffer.
    pub fn is_fed(&self) -> bool {
        matches!(self.op, NodeOp::Input { .. } | NodeOp::Labels { .. })
    }
}

impl fmt::Debug for ExecNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecNode")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("op", &self.op)
            .field("shape", &self.shape)
            .field(
                "inputs",
                &self.inputs.iter().map(|i| i.id).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Collect every node reachable from `outputs`, inputs before consumers.
pub(crate) fn collect_nodes(outputs: &[Arc<ExecNode>]) -> Vec<Arc<ExecNode>> {
    use std::collections::HashSet;

    let mut seen = HashSet::new();
    let mut order = Vec::new();
    let mut stack: Vec<(Arc<ExecNode>, bool)> =
        outputs.iter().rev().map(|n| (n.clone(), false)).collect();
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !seen.insert(node.id) {
            continue;
        }
        stack.push((node.clone(), true));
        for input in node.inputs.iter().rev() {
            if !seen.contains(&input.id) {
                stack.push((input.clone(), false));
            }
        }
    }
    order
}
