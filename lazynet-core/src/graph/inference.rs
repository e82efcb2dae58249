use super::{
    batch_count, compile_nodes, EvaluationGraph, ExecutableGraph, Export, Role, SourceBindings,
};
use crate::{
    BatchHistory, DataSet, Device, Error, ExecutorConfig, HostTensor, Model, Result,
    TrainingHistory,
};

/// Forward pass to the model outputs only. Labels missing from the data
/// are fed as zeros.
pub struct InferenceGraph {
    graph: ExecutableGraph,
}

impl InferenceGraph {
    /// Compile a dedicated executable for the outputs of `model`.
    pub fn new(model: &Model, device: &Device) -> Result<Self> {
        let label = format!("{} Inference", model.label());
        let outputs = compile_nodes(device, model.outputs())?;
        let executable = device.backend().compile(&label, &outputs)?;
        log::debug!("compiled inference graph `{label}`");
        let exports = model
            .outputs()
            .iter()
            .map(|t| Export::new(Role::Result, t))
            .collect();
        let graph = ExecutableGraph::new(
            label,
            executable,
            exports,
            &SourceBindings::for_model(model),
            true,
        )?;
        Ok(Self { graph })
    }

    /// Share the executable of `evaluation`, recording only its results.
    pub(crate) fn from_evaluation(label: &str, evaluation: &EvaluationGraph) -> Result<Self> {
        let exports = evaluation
            .graph()
            .exports()
            .iter()
            .map(|e| Export {
                role: if e.role == Role::Result {
                    Role::Result
                } else {
                    Role::Ignored
                },
                ..e.clone()
            })
            .collect();
        let graph = evaluation.graph().reuse(label, exports, true)?;
        Ok(Self { graph })
    }

    pub fn graph(&self) -> &ExecutableGraph {
        &self.graph
    }

    pub fn predict(
        &self,
        data: &dyn DataSet,
        batch_size: usize,
        config: &ExecutorConfig,
        callback: &mut dyn FnMut(&BatchHistory),
    ) -> Result<TrainingHistory> {
        let batches = batch_count(data.count(), batch_size, 1.0);
        self.graph.run(data, batch_size, batches, config, callback)
    }

    /// Every row of `data` once, as one list of outputs per row.
    pub fn predict_rows(&self, data: &dyn DataSet, config: &ExecutorConfig) -> Result<Vec<Vec<HostTensor>>> {
        let count = data.count();
        let batch_size = count.clamp(1, config.default_batch_size);
        let history = self.predict(data, batch_size, config, &mut |_| {})?;
        if let Some(&failed) = history.failed_batches.first() {
            return Err(Error::device(format!(
                "batch {failed} of `{}` failed",
                self.graph.label()
            )));
        }
        let mut rows = Vec::with_capacity(count);
        for batch in history.in_submission_order() {
            let outputs = batch
                .results
                .iter()
                .map(|r| r.rows())
                .collect::<Result<Vec<_>>>()?;
            let first = batch.batch_index * batch_size;
            let len = batch_size.min(count.saturating_sub(first));
            for row in 0..len {
                rows.push(outputs.iter().map(|o| o[row].clone()).collect());
            }
        }
        Ok(rows)
    }
}
