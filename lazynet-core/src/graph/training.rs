use std::collections::HashSet;
use std::sync::Arc;

use super::{batch_count, ExecutableGraph, Export, Role, SourceBindings};
use crate::{
    layer::WeightDataSource, model::TrainableMap, BatchHistory, DataSet, Device, Error,
    ExecutorConfig, Model, Optimizer, Result, Tensor, TrainingHistory,
};

/// Forward and backward pass; every batch updates the trainable weights.
pub struct TrainingGraph {
    graph: ExecutableGraph,
    weights: Vec<(Arc<dyn WeightDataSource>, bool)>,
}

impl TrainingGraph {
    /// Compile the gradient graph of `loss`. `exports` are the tensors
    /// recorded per batch, `model` supplies the data set bindings.
    pub(crate) fn new(
        label: &str,
        model: &Model,
        trainable: &TrainableMap,
        exports: &[(Role, Tensor)],
        loss: &Tensor,
        device: &Device,
    ) -> Result<Self> {
        let mut memo = Default::default();
        let outputs = exports
            .iter()
            .map(|(_, t)| t.execution_node(device, &mut memo))
            .collect::<Result<Vec<_>>>()?;
        let loss = loss.execution_node(device, &mut memo)?;

        let mut weights = Vec::new();
        let mut seen = HashSet::new();
        let executable = device
            .backend()
            .compile_gradients(label, &loss, &outputs, &mut |node| {
                let Some(ws) = node.weights() else {
                    return Ok(());
                };
                let layer = node.layer_id().ok_or_else(|| {
                    Error::config(format!("`{}` holds weights but is not a layer", node.label()))
                })?;
                let is_trainable = trainable.get(layer).ok_or_else(|| {
                    Error::config(format!(
                        "trainability of `{}` is unknown to the flattened model",
                        node.label()
                    ))
                })?;
                if seen.insert(Arc::as_ptr(ws) as *const () as usize) {
                    weights.push((ws.clone(), is_trainable));
                }
                Ok(())
            })?;
        log::debug!(
            "compiled training graph `{label}` with {} weight sources",
            weights.len()
        );

        let exports = exports.iter().map(|(role, t)| Export::new(*role, t)).collect();
        let graph = ExecutableGraph::new(
            label,
            executable,
            exports,
            &SourceBindings::for_model(model),
            false,
        )?;
        Ok(Self { graph, weights })
    }

    pub fn graph(&self) -> &ExecutableGraph {
        &self.graph
    }

    /// Collected weight sources with their trainability.
    pub fn weights(&self) -> &[(Arc<dyn WeightDataSource>, bool)] {
        &self.weights
    }

    pub(crate) fn fit(
        &self,
        data: &dyn DataSet,
        batch_size: usize,
        epochs: f32,
        optimizer: &Optimizer,
        config: &ExecutorConfig,
        callback: &mut dyn FnMut(&BatchHistory),
    ) -> Result<TrainingHistory> {
        if !(epochs > 0.0) {
            return Err(Error::config(format!("epochs must be positive, got {epochs}")));
        }
        for (ws, trainable) in &self.weights {
            ws.set_optimizer(optimizer);
            ws.set_trainable(*trainable);
        }
        let batches = batch_count(data.count(), batch_size, epochs);
        self.graph.run(data, batch_size, batches, config, callback)
    }
}
