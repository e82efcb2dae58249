use super::{batch_count, compile_nodes, ExecutableGraph, Export, Role, SourceBindings};
use crate::{BatchHistory, DataSet, Device, ExecutorConfig, Model, Result, Tensor, TrainingHistory};

/// Forward pass through the outputs and their losses.
pub struct EvaluationGraph {
    graph: ExecutableGraph,
}

impl EvaluationGraph {
    pub(crate) fn new(
        label: &str,
        model: &Model,
        exports: &[(Role, Tensor)],
        device: &Device,
    ) -> Result<Self> {
        let tensors = exports.iter().map(|(_, t)| t.clone()).collect::<Vec<_>>();
        let outputs = compile_nodes(device, &tensors)?;
        let executable = device.backend().compile(label, &outputs)?;
        log::debug!("compiled evaluation graph `{label}` with {} outputs", outputs.len());
        let exports = exports.iter().map(|(role, t)| Export::new(*role, t)).collect();
        let graph = ExecutableGraph::new(
            label,
            executable,
            exports,
            &SourceBindings::for_model(model),
            false,
        )?;
        Ok(Self { graph })
    }

    pub fn graph(&self) -> &ExecutableGraph {
        &self.graph
    }

    /// One pass over `data`.
    pub(crate) fn evaluate(
        &self,
        data: &dyn DataSet,
        batch_size: usize,
        config: &ExecutorConfig,
        callback: &mut dyn FnMut(&BatchHistory),
    ) -> Result<TrainingHistory> {
        let batches = batch_count(data.count(), batch_size, 1.0);
        self.graph.run(data, batch_size, batches, config, callback)
    }
}
