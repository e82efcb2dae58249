use std::sync::Arc;

use crate::{
    layer::{WeightBuffer, WeightDataSource},
    node::ExecNode,
    pool::PooledBuffer,
    Result,
};

/// Source buffers of one batch, grouped by source slot.
///
/// Each buffer is batch-major: row `r` of slot `s` occupies
/// `sources[s][r * len..(r + 1) * len]`.
#[derive(Debug)]
pub struct BatchData {
    pub batch_size: usize,
    pub sources: Vec<PooledBuffer>,
}

/// Invoked once by the backend when a batch finishes, from a backend thread.
/// Receives the batch back so its buffers can be recycled, and one
/// batch-major buffer per executable output.
pub type Completion = Box<dyn FnOnce(BatchData, Result<Vec<Vec<f32>>>) + Send + 'static>;

/// A compiled graph ready to run batches.
pub trait Executable: Send + Sync {
    fn label(&self) -> &str;

    /// Nodes fed per batch, in slot order of [`BatchData::sources`].
    fn sources(&self) -> &[Arc<ExecNode>];

    /// Nodes whose values are returned on completion, in order.
    fn outputs(&self) -> &[Arc<ExecNode>];

    /// Whether running a batch also updates weights.
    fn is_training(&self) -> bool;

    /// Encode and run one batch asynchronously. `done` is always called
    /// exactly once.
    fn execute(&self, batch: BatchData, done: Completion);
}

/// The numeric collaborator: owns kernels, weights storage and execution.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Allocate learnable state for one layer on this backend.
    fn create_weight_data_source(
        &self,
        label: &str,
        buffers: &[WeightBuffer],
        seed: u64,
    ) -> Result<Arc<dyn WeightDataSource>>;

    /// Compile a forward graph producing `outputs`.
    fn compile(&self, label: &str, outputs: &[Arc<ExecNode>]) -> Result<Arc<dyn Executable>>;

    /// Compile the forward graph of `outputs` together with the backward
    /// graph of `loss`. `visit` is called once for every forward node that
    /// receives a gradient node.
    fn compile_gradients(
        &self,
        label: &str,
        loss: &Arc<ExecNode>,
        outputs: &[Arc<ExecNode>],
        visit: &mut dyn FnMut(&ExecNode) -> Result<()>,
    ) -> Result<Arc<dyn Executable>>;
}
