use std::fmt;
use std::sync::RwLock;

use crate::{
    graph::{EvaluationGraph, InferenceGraph, Role, TrainingGraph},
    model::Flattened,
    BatchHistory, DataSet, Device, Error, ExecutorConfig, HostTensor, Layer, LayerKind, Model,
    Optimizer, Result, Tensor, TensorKind, TrainingHistory,
};

/// Label of the summed objective when a model has several losses.
pub const TOTAL_LOSS_LABEL: &str = "Total Loss";

/// A model bound to one device and optimizer, with its evaluation,
/// inference and training graphs.
pub struct CompiledModel {
    label: String,
    flattened: Flattened,
    device: Device,
    losses: Vec<Tensor>,
    total_loss: Tensor,
    evaluation: EvaluationGraph,
    inference: InferenceGraph,
    training: TrainingGraph,
    settings: RwLock<(Optimizer, ExecutorConfig)>,
}

impl CompiledModel {
    pub(crate) fn new(
        model: &Model,
        optimizer: Optimizer,
        config: ExecutorConfig,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let flattened = model.flatten()?;
        let flat = &flattened.model;
        let label = model.label().to_string();

        let mut losses = flat
            .tensors()
            .iter()
            .filter(|t| t.layer_kind().is_some_and(|k| k.is_loss()))
            .cloned()
            .collect::<Vec<_>>();
        if losses.is_empty() {
            losses = auto_losses(flat, &config)?;
        }
        if losses.is_empty() {
            return Err(Error::config("Loss is required in order to train"));
        }
        let total_loss = total_loss(&losses)?;

        let mut exports = flat
            .outputs()
            .iter()
            .map(|t| (Role::Result, t.clone()))
            .collect::<Vec<_>>();
        exports.extend(losses.iter().map(|t| (Role::Loss, t.clone())));
        if losses.len() > 1 {
            exports.push((Role::Intermediate, total_loss.clone()));
        }
        let loss_model = Model::builder(exports.iter().map(|(_, t)| t.clone()).collect())
            .inputs(flat.inputs().to_vec())
            .label(label.clone())
            .build()?;

        let evaluation_exports = if flat.keep_dropout_during_inference() {
            exports.clone()
        } else {
            exports
                .iter()
                .map(|(role, t)| {
                    let kept = t.remove_layers(|l| matches!(l.kind(), LayerKind::Dropout { .. }))?;
                    Ok((*role, kept))
                })
                .collect::<Result<Vec<_>>>()?
        };
        let evaluation = EvaluationGraph::new(
            &format!("{label} Evaluation"),
            &loss_model,
            &evaluation_exports,
            device,
        )?;
        let inference = InferenceGraph::from_evaluation(&format!("{label} Inference"), &evaluation)?;
        let training = TrainingGraph::new(
            &format!("{label} Training"),
            &loss_model,
            &flattened.trainable,
            &exports,
            &total_loss,
            device,
        )?;
        log::debug!(
            "compiled `{label}` for {device:?}: {} losses, {} weight sources",
            losses.len(),
            training.weights().len()
        );

        Ok(Self {
            label,
            flattened,
            device: device.clone(),
            losses,
            total_loss,
            evaluation,
            inference,
            training,
            settings: RwLock::new((optimizer, config)),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn flattened(&self) -> &Flattened {
        &self.flattened
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Loss tensors, explicit or synthesized.
    pub fn losses(&self) -> &[Tensor] {
        &self.losses
    }

    pub fn total_loss(&self) -> &Tensor {
        &self.total_loss
    }

    pub fn evaluation_graph(&self) -> &EvaluationGraph {
        &self.evaluation
    }

    pub fn inference_graph(&self) -> &InferenceGraph {
        &self.inference
    }

    pub fn training_graph(&self) -> &TrainingGraph {
        &self.training
    }

    pub fn optimizer(&self) -> Optimizer {
        self.settings().0
    }

    pub fn config(&self) -> ExecutorConfig {
        self.settings().1
    }

    fn settings(&self) -> (Optimizer, ExecutorConfig) {
        match self.settings.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the optimizer and executor settings for later runs.
    pub fn configure(&self, optimizer: Optimizer, config: ExecutorConfig) -> Result<()> {
        config.validate()?;
        let mut settings = self
            .settings
            .write()
            .map_err(|_| Error::msg("compiled model settings poisoned"))?;
        *settings = (optimizer, config);
        Ok(())
    }

    pub fn fit(
        &self,
        data: &dyn DataSet,
        batch_size: usize,
        epochs: f32,
        callback: &mut dyn FnMut(&BatchHistory),
    ) -> Result<TrainingHistory> {
        let (optimizer, config) = self.settings();
        self.training
            .fit(data, batch_size, epochs, &optimizer, &config, callback)
    }

    /// [`Self::fit`] with the batch size and epochs of the attached
    /// [`ExecutorConfig`].
    pub fn fit_with_defaults(
        &self,
        data: &dyn DataSet,
        callback: &mut dyn FnMut(&BatchHistory),
    ) -> Result<TrainingHistory> {
        let (optimizer, config) = self.settings();
        self.training.fit(
            data,
            config.default_batch_size,
            config.default_epochs,
            &optimizer,
            &config,
            callback,
        )
    }

    pub fn evaluate(
        &self,
        data: &dyn DataSet,
        batch_size: usize,
        callback: &mut dyn FnMut(&BatchHistory),
    ) -> Result<TrainingHistory> {
        self.evaluation.evaluate(data, batch_size, &self.config(), callback)
    }

    pub fn predict(
        &self,
        data: &dyn DataSet,
        batch_size: usize,
        callback: &mut dyn FnMut(&BatchHistory),
    ) -> Result<TrainingHistory> {
        self.inference.predict(data, batch_size, &self.config(), callback)
    }

    pub fn predict_rows(&self, data: &dyn DataSet) -> Result<Vec<Vec<HostTensor>>> {
        self.inference.predict_rows(data, &self.config())
    }
}

impl fmt::Debug for CompiledModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModel")
            .field("label", &self.label)
            .field("device", &self.device)
            .field("losses", &self.losses)
            .finish()
    }
}

/// One loss per eligible output. Sigmoid and softmax outputs fuse the
/// activation into a cross-entropy loss on its input.
fn auto_losses(flat: &Model, config: &ExecutorConfig) -> Result<Vec<Tensor>> {
    let mut losses = Vec::new();
    for output in flat.outputs() {
        let layer = match output.kind() {
            TensorKind::Layer(layer) => layer,
            _ => continue,
        };
        if matches!(layer.kind(), LayerKind::ArgMax | LayerKind::ArgMin) {
            continue;
        }
        let labels = Tensor::labels_for(output);
        let loss = match output.fusable_activation() {
            Some(fused) => output.inputs()[0].loss(&labels, fused)?,
            None => output.loss(&labels, config.default_loss)?,
        };
        losses.push(loss);
    }
    Ok(losses)
}

fn total_loss(losses: &[Tensor]) -> Result<Tensor> {
    match losses {
        [] => Err(Error::config("Loss is required in order to train")),
        [single] => Ok(single.clone()),
        [init @ .., last] => {
            let partial = Tensor::sum_all(init)?;
            Layer::named(TOTAL_LOSS_LABEL, LayerKind::Add)?.call(&[partial, last.clone()])
        }
    }
}
