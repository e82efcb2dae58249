use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{self, Write as _};
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, OnceLock, RwLock};
use std::{env, fs};

use petgraph::dot::{Config, Dot};
use petgraph::graph::NodeIndex;
use petgraph::Graph as PetGraph;

use crate::{
    compiled::CompiledModel,
    handle::{label_or_default, DeviceId, LayerId, ModelId, TensorId},
    layer::HasBuffers,
    BatchHistory, Context, DataSet, Device, Error, ExecutorConfig, HostTensor, Layer, Optimizer,
    Result, Tensor, TensorKind, TensorMap, TrainingHistory,
};

/// Per-layer trainability after [`Model::flatten`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainableMap(HashMap<LayerId, bool>);

impl TrainableMap {
    pub fn get(&self, layer: LayerId) -> Option<bool> {
        self.0.get(&layer).copied()
    }

    pub fn is_trainable(&self, layer: &Layer) -> Option<bool> {
        self.get(layer.id())
    }

    /// OR `trainable` into the current value of `layer`.
    fn merge(&mut self, layer: LayerId, trainable: bool) {
        let entry = self.0.entry(layer).or_insert(false);
        *entry = *entry || trainable;
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The result of [`Model::flatten`]: a model without submodels and the
/// merged trainability of every layer in it.
#[derive(Debug, Clone)]
pub struct Flattened {
    pub model: Model,
    pub trainable: TrainableMap,
}

/// Everything reachable from a model's outputs, in first-discovered order.
#[derive(Default)]
struct Discovery {
    tensors: Vec<Tensor>,
    sources: Vec<Tensor>,
    inputs: Vec<Tensor>,
    labels: Vec<Tensor>,
    layers: Vec<Layer>,
    submodels: Vec<Model>,
}

impl Discovery {
    /// Breadth-first from `outputs`; each tensor is visited once however
    /// many consumers share it.
    fn run(outputs: &[Tensor]) -> Self {
        let mut found = Discovery::default();
        let mut visited = HashSet::new();
        let mut seen_layers = HashSet::new();
        let mut seen_models = HashSet::new();
        let mut queue = outputs.iter().cloned().collect::<VecDeque<_>>();
        while let Some(t) = queue.pop_front() {
            if !visited.insert(t.id()) {
                continue;
            }
            if t.is_source() {
                found.sources.push(t.clone());
            } else {
                queue.extend(t.inputs().iter().cloned());
            }
            match t.kind() {
                TensorKind::Input => found.inputs.push(t.clone()),
                TensorKind::Labels { .. } => found.labels.push(t.clone()),
                TensorKind::Layer(layer) => {
                    if seen_layers.insert(layer.id()) {
                        found.layers.push(layer.clone());
                    }
                }
                TensorKind::Model { model, .. } => {
                    if seen_models.insert(model.id()) {
                        found.submodels.push(model.clone());
                    }
                }
                TensorKind::Constant(_) | TensorKind::Array(_) => {}
            }
            found.tensors.push(t);
        }
        found
    }
}

struct ModelInner {
    id: ModelId,
    label: String,
    trainable: bool,
    keep_dropout: bool,
    inputs: Vec<Tensor>,
    outputs: Vec<Tensor>,
    discovered: Discovery,
    flattened: OnceLock<Flattened>,
    compiled: RwLock<HashMap<DeviceId, Arc<CompiledModel>>>,
}

/// A named view over the tensor graph reachable from a set of outputs.
///
/// Models never change; [`Model::lock`], [`Model::map_inputs`],
/// [`Model::flatten`] and friends return new models.
#[derive(Clone)]
pub struct Model(Arc<ModelInner>);

/// Options for building a [`Model`].
pub struct ModelBuilder {
    outputs: Vec<Tensor>,
    inputs: Option<Vec<Tensor>>,
    label: Option<String>,
    trainable: bool,
    keep_dropout: bool,
}

impl ModelBuilder {
    /// Explicit formal inputs, in application order. Defaults to the free
    /// inputs in discovery order.
    pub fn inputs(mut self, inputs: Vec<Tensor>) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    pub fn keep_dropout_during_inference(mut self, keep: bool) -> Self {
        self.keep_dropout = keep;
        self
    }

    pub fn build(self) -> Result<Model> {
        if self.outputs.is_empty() {
            return Err(Error::config("a model needs at least one output"));
        }
        let discovered = Discovery::run(&self.outputs);
        let inputs = match self.inputs {
            Some(inputs) => {
                if let Some(bad) = inputs.iter().find(|t| !t.is_source()) {
                    return Err(Error::config(format!(
                        "model input `{}` must be a source tensor",
                        bad.label()
                    )));
                }
                inputs
            }
            None => discovered.inputs.clone(),
        };
        let id = ModelId::next();
        Ok(Model(Arc::new(ModelInner {
            id,
            label: label_or_default(self.label, "Model", id.get()),
            trainable: self.trainable,
            keep_dropout: self.keep_dropout,
            inputs,
            outputs: self.outputs,
            discovered,
            flattened: OnceLock::new(),
            compiled: RwLock::new(HashMap::new()),
        })))
    }
}

impl Model {
    pub fn new(outputs: Vec<Tensor>) -> Result<Model> {
        Self::builder(outputs).build()
    }

    pub fn builder(outputs: Vec<Tensor>) -> ModelBuilder {
        ModelBuilder {
            outputs,
            inputs: None,
            label: None,
            trainable: true,
            keep_dropout: false,
        }
    }

    /// A builder starting from this model's settings.
    fn derive(&self, outputs: Vec<Tensor>) -> ModelBuilder {
        Model::builder(outputs)
            .label(self.0.label.clone())
            .trainable(self.0.trainable)
            .keep_dropout_during_inference(self.0.keep_dropout)
    }

    pub fn id(&self) -> ModelId {
        self.0.id
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }

    pub fn is_trainable(&self) -> bool {
        self.0.trainable
    }

    pub fn keep_dropout_during_inference(&self) -> bool {
        self.0.keep_dropout
    }

    pub fn inputs(&self) -> &[Tensor] {
        &self.0.inputs
    }

    pub fn outputs(&self) -> &[Tensor] {
        &self.0.outputs
    }

    pub fn labels(&self) -> &[Tensor] {
        &self.0.discovered.labels
    }

    pub fn layers(&self) -> &[Layer] {
        &self.0.discovered.layers
    }

    pub fn submodels(&self) -> &[Model] {
        &self.0.discovered.submodels
    }

    pub fn sources(&self) -> &[Tensor] {
        &self.0.discovered.sources
    }

    /// Every reachable tensor, in discovery order.
    pub fn tensors(&self) -> &[Tensor] {
        &self.0.discovered.tensors
    }

    /// The same graph with every layer frozen.
    pub fn lock(&self) -> Result<Model> {
        self.with_trainable(false)
    }

    pub fn unlock(&self) -> Result<Model> {
        self.with_trainable(true)
    }

    fn with_trainable(&self, trainable: bool) -> Result<Model> {
        self.derive(self.0.outputs.clone())
            .inputs(self.0.inputs.clone())
            .trainable(trainable)
            .build()
    }

    /// Replace tensors found in `map` throughout the graph. Replaced formal
    /// inputs stay inputs only when their replacement is itself an input.
    pub fn map_inputs(&self, map: &mut TensorMap) -> Result<Model> {
        let outputs = self
            .0
            .outputs
            .iter()
            .map(|o| match map.get(o) {
                Some(replacement) => Ok(replacement.clone()),
                None => o.map_inputs(map),
            })
            .collect::<Result<Vec<_>>>()?;
        let inputs = self
            .0
            .inputs
            .iter()
            .filter_map(|i| match map.get(i) {
                None => Some(i.clone()),
                Some(r) if matches!(r.kind(), TensorKind::Input) => Some(r.clone()),
                Some(_) => None,
            })
            .collect();
        self.derive(outputs).inputs(inputs).build()
    }

    /// Rewrite every tensor with `f`, see [`Tensor::map`].
    pub fn map_inputs_with(&self, f: &mut dyn FnMut(&Tensor) -> Result<Tensor>) -> Result<Model> {
        let mut map = TensorMap::new();
        for t in self.tensors().iter().rev() {
            if t.is_source() {
                let mapped = f(t)?;
                if !mapped.ptr_eq(t) {
                    map.insert(t, mapped);
                }
            }
        }
        let mapped = self.map_inputs(&mut map)?;
        let outputs = mapped
            .outputs()
            .iter()
            .map(|o| o.map(f))
            .collect::<Result<Vec<_>>>()?;
        mapped.derive(outputs).inputs(mapped.0.inputs.clone()).build()
    }

    /// This model with its formal inputs replaced by `inputs`.
    pub fn rebuild_with_inputs(&self, inputs: &[Tensor]) -> Result<Model> {
        self.check_inputs(inputs)?;
        let mut map = self
            .0
            .inputs
            .iter()
            .cloned()
            .zip(inputs.iter().cloned())
            .filter(|(formal, actual)| !formal.ptr_eq(actual))
            .collect::<TensorMap>();
        if map.is_empty() {
            return Ok(self.clone());
        }
        let outputs = self
            .0
            .outputs
            .iter()
            .map(|o| match map.get(o) {
                Some(replacement) => Ok(replacement.clone()),
                None => o.map_inputs(&mut map),
            })
            .collect::<Result<Vec<_>>>()?;
        let sources = inputs.iter().filter(|t| t.is_source()).cloned().collect();
        self.derive(outputs).inputs(sources).build()
    }

    fn check_inputs(&self, inputs: &[Tensor]) -> Result<()> {
        if inputs.len() != self.0.inputs.len() {
            return Err(Error::config(format!(
                "model `{}` takes {} inputs, got {}",
                self.0.label,
                self.0.inputs.len(),
                inputs.len()
            )));
        }
        for (formal, actual) in self.0.inputs.iter().zip(inputs) {
            if formal.shape() != actual.shape() {
                return Err(Error::shape(
                    &self.0.label,
                    formal.shape(),
                    actual.shape(),
                    format!("input `{}` applied to `{}`", actual.label(), formal.label()),
                ));
            }
        }
        Ok(())
    }

    /// Apply this model as a sub-expression. The model must have exactly
    /// one output.
    pub fn apply(&self, inputs: &[Tensor]) -> Result<Tensor> {
        if self.0.outputs.len() != 1 {
            return Err(Error::config(format!(
                "model `{}` has {} outputs; use apply_all",
                self.0.label,
                self.0.outputs.len()
            )));
        }
        self.check_inputs(inputs)?;
        Tensor::model_output(self, 0, inputs.to_vec())
    }

    /// Apply this model, one tensor per output.
    pub fn apply_all(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        self.check_inputs(inputs)?;
        (0..self.0.outputs.len())
            .map(|i| Tensor::model_output(self, i, inputs.to_vec()))
            .collect()
    }

    /// Compose: `self` applied to the outputs of `inner`.
    pub fn apply_model(&self, inner: &Model) -> Result<Model> {
        let outputs = self.apply_all(inner.outputs())?;
        Model::builder(outputs)
            .inputs(inner.inputs().to_vec())
            .label(format!("{}({})", self.0.label, inner.label()))
            .trainable(true)
            .build()
    }

    /// Inline every submodel into one flat graph. A layer is trainable in
    /// the result if it is trainable in any model that uses it.
    pub fn flatten(&self) -> Result<Flattened> {
        if let Some(done) = self.0.flattened.get() {
            return Ok(done.clone());
        }
        let flattened = self
            .flatten_uncached()
            .with_context(|| format!("in model `{}`", self.0.label))?;
        Ok(self.0.flattened.get_or_init(|| flattened).clone())
    }

    fn flatten_uncached(&self) -> Result<Flattened> {
        let mut trainable = TrainableMap::default();
        for layer in self.layers() {
            trainable.merge(layer.id(), self.0.trainable && layer.is_trainable());
        }
        let mut memo = FlattenMemo::default();
        let outputs = self
            .0
            .outputs
            .iter()
            .map(|o| flatten_tensor(o, &mut memo, &mut trainable))
            .collect::<Result<Vec<_>>>()?;
        let inputs = self
            .0
            .inputs
            .iter()
            .map(|i| flatten_tensor(i, &mut memo, &mut trainable))
            .collect::<Result<Vec<_>>>()?;
        let model = self.derive(outputs).inputs(inputs).build()?;
        log::debug!(
            "flattened `{}`: {} layers, {} submodels inlined",
            self.0.label,
            model.layers().len(),
            self.submodels().len()
        );
        Ok(Flattened { model, trainable })
    }

    /// A Keras-style table of layers, output shapes and parameter counts.
    pub fn summary(&self) -> Result<String> {
        let Flattened { model, trainable } = self.flatten()?;
        let mut out = String::new();
        let rule = "=".repeat(78);
        let _ = writeln!(out, "Model: \"{}\"", self.0.label);
        let _ = writeln!(
            out,
            "{:<34}{:<22}{:>10}  {:>9}",
            "Layer (type)", "Output Shape", "Param #", "Trainable"
        );
        let _ = writeln!(out, "{rule}");
        let mut total = 0;
        let mut trainable_total = 0;
        let mut shown = HashSet::new();
        for t in model.tensors().iter().rev() {
            let Some(layer) = t.layer() else { continue };
            if !shown.insert(layer.id()) {
                continue;
            }
            let params = layer.parameter_count();
            let is_trainable = trainable.is_trainable(layer).unwrap_or(false);
            total += params;
            if is_trainable {
                trainable_total += params;
            }
            let _ = writeln!(
                out,
                "{:<34}{:<22}{:>10}  {:>9}",
                format!("{} ({})", layer.name(), layer.kind().name()),
                t.shape().to_string(),
                params,
                is_trainable
            );
        }
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "Total params: {total}");
        let _ = writeln!(out, "Trainable params: {trainable_total}");
        let _ = writeln!(out, "Non-trainable params: {}", total - trainable_total);
        Ok(out)
    }

    pub fn to_petgraph(&self) -> PetGraph<String, ()> {
        let mut g = PetGraph::<String, ()>::new();
        let mut idx_map: HashMap<TensorId, NodeIndex> = HashMap::new();
        for t in self.tensors().iter().rev() {
            let label = match t.kind() {
                TensorKind::Layer(layer) => format!("{} ({})\n{}", t.label(), layer.kind(), t.shape()),
                _ => format!("{}\n{}", t.label(), t.shape()),
            };
            idx_map.insert(t.id(), g.add_node(label));
        }
        for t in self.tensors() {
            for input in t.inputs() {
                if let (Some(&from), Some(&to)) = (idx_map.get(&input.id()), idx_map.get(&t.id())) {
                    g.add_edge(from, to, ());
                }
            }
        }
        g
    }

    /// Graphviz source of the reachable graph.
    pub fn to_dot(&self) -> String {
        let g = self.to_petgraph();
        format!("{:?}", Dot::with_config(&g, &[Config::EdgeNoLabel]))
    }

    /// Render the graph to a PNG with the `dot` tool.
    ///
    /// Install graphviz:
    /// - brew install graphviz
    /// - apt install graphviz
    pub fn visualize<P: AsRef<Path>>(&self, filename: P) -> Result<()> {
        let dot_path = env::temp_dir().join(format!("model-{}.dot", self.0.id));
        fs::write(&dot_path, self.to_dot())?;
        let status = Command::new("dot")
            .args([
                "-Tpng",
                &dot_path.display().to_string(),
                "-o",
                &filename.as_ref().display().to_string(),
            ])
            .status()?;
        if !status.success() {
            return Err(Error::msg(format!("graphviz exited with {status}")));
        }
        Ok(())
    }

    /// Compile for `device` with the default optimizer and executor config.
    pub fn compile(&self, device: &Device) -> Result<Arc<CompiledModel>> {
        self.compile_with(Optimizer::default(), ExecutorConfig::default(), device)
    }

    /// Compile for `device`. The compiled model is cached per device; a
    /// cache hit adopts the given optimizer and config.
    pub fn compile_with(
        &self,
        optimizer: Optimizer,
        config: ExecutorConfig,
        device: &Device,
    ) -> Result<Arc<CompiledModel>> {
        let poisoned = || Error::msg("compiled model cache poisoned");
        if let Some(compiled) = self.0.compiled.read().map_err(|_| poisoned())?.get(&device.id()) {
            compiled.configure(optimizer, config)?;
            return Ok(compiled.clone());
        }
        let fresh = Arc::new(
            CompiledModel::new(self, optimizer, config, device)
                .with_context(|| format!("in model `{}`", self.0.label))?,
        );
        let mut cache = self.0.compiled.write().map_err(|_| poisoned())?;
        Ok(cache.entry(device.id()).or_insert(fresh).clone())
    }

    pub fn fit(
        &self,
        data: &dyn DataSet,
        batch_size: usize,
        epochs: f32,
        device: &Device,
    ) -> Result<TrainingHistory> {
        self.compile(device)?.fit(data, batch_size, epochs, &mut |_| {})
    }

    pub fn fit_with_callback(
        &self,
        data: &dyn DataSet,
        batch_size: usize,
        epochs: f32,
        device: &Device,
        callback: &mut dyn FnMut(&BatchHistory),
    ) -> Result<TrainingHistory> {
        self.compile(device)?.fit(data, batch_size, epochs, callback)
    }

    pub fn predict(&self, data: &dyn DataSet, batch_size: usize, device: &Device) -> Result<TrainingHistory> {
        self.compile(device)?.predict(data, batch_size, &mut |_| {})
    }

    /// Predict every row of `data` once; one list of outputs per row.
    pub fn predict_rows(&self, data: &dyn DataSet, device: &Device) -> Result<Vec<Vec<HostTensor>>> {
        self.compile(device)?.predict_rows(data)
    }

    pub fn evaluate(&self, data: &dyn DataSet, batch_size: usize, device: &Device) -> Result<TrainingHistory> {
        self.compile(device)?.evaluate(data, batch_size, &mut |_| {})
    }
}

/// State of one [`Model::flatten`] call.
#[derive(Default)]
struct FlattenMemo {
    tensors: HashMap<TensorId, Tensor>,
    /// Rebuilt instances keyed by submodel and flattened call-site inputs,
    /// so repeated applications inline one shared subgraph.
    calls: HashMap<(ModelId, Vec<TensorId>), Model>,
}

fn flatten_tensor(
    t: &Tensor,
    memo: &mut FlattenMemo,
    trainable: &mut TrainableMap,
) -> Result<Tensor> {
    if let Some(done) = memo.tensors.get(&t.id()) {
        return Ok(done.clone());
    }
    let flat = match t.kind() {
        TensorKind::Model { model, output } => {
            let actual = t
                .inputs()
                .iter()
                .map(|i| flatten_tensor(i, memo, trainable))
                .collect::<Result<Vec<_>>>()?;
            let key = (model.id(), actual.iter().map(|a| a.id()).collect::<Vec<_>>());
            let instance = match memo.calls.get(&key) {
                Some(instance) => instance.clone(),
                None => {
                    let instance = model
                        .rebuild_with_inputs(&actual)
                        .with_context(|| format!("in model `{}`", model.label()))?;
                    memo.calls.insert(key, instance.clone());
                    instance
                }
            };
            let out = flatten_tensor(&instance.outputs()[*output], memo, trainable)
                .with_context(|| format!("in model `{}`", model.label()))?;
            let boundary = actual.iter().map(|a| a.id()).collect::<HashSet<_>>();
            for layer in layers_under(&out, &boundary) {
                trainable.merge(layer.id(), model.is_trainable() && layer.is_trainable());
            }
            out
        }
        TensorKind::Layer(_) => {
            let inputs = t
                .inputs()
                .iter()
                .map(|i| flatten_tensor(i, memo, trainable))
                .collect::<Result<Vec<_>>>()?;
            t.with_inputs(inputs)?
        }
        _ => t.clone(),
    };
    memo.tensors.insert(t.id(), flat.clone());
    Ok(flat)
}

/// Layers reachable from `t` without crossing `boundary`.
fn layers_under(t: &Tensor, boundary: &HashSet<TensorId>) -> Vec<Layer> {
    let mut layers = Vec::new();
    let mut seen_layers = HashSet::new();
    let mut visited = HashSet::new();
    let mut stack = vec![t.clone()];
    while let Some(t) = stack.pop() {
        if boundary.contains(&t.id()) || !visited.insert(t.id()) {
            continue;
        }
        if let Some(layer) = t.layer() {
            if seen_layers.insert(layer.id()) {
                layers.push(layer.clone());
            }
        }
        stack.extend(t.inputs().iter().cloned());
    }
    layers
}

impl HasBuffers for Model {
    /// Buffers are named `<layer>/<buffer>`.
    fn read_buffers(&self, reader: &mut dyn FnMut(&str, &mut [f32]) -> Result<()>) -> Result<()> {
        let flat = self.flatten()?;
        for layer in flat.model.layers() {
            let prefix = layer.name().to_string();
            layer.read_buffers(&mut |name, data| reader(&format!("{prefix}/{name}"), data))?;
        }
        Ok(())
    }

    fn write_buffers(&self, writer: &mut dyn FnMut(&str, &[f32]) -> Result<()>) -> Result<()> {
        let flat = self.flatten()?;
        for layer in flat.model.layers() {
            let prefix = layer.name().to_string();
            layer.write_buffers(&mut |name, data| writer(&format!("{prefix}/{name}"), data))?;
        }
        Ok(())
    }
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Model {}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("label", &self.0.label)
            .field("trainable", &self.0.trainable)
            .field("inputs", &self.0.inputs)
            .field("outputs", &self.0.outputs)
            .finish()
    }
}
