use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

mod host;
mod ops;

pub use host::HostTensor;

use crate::{
    graph::InferenceGraph,
    handle::{DeviceId, TensorId},
    node::{ExecNode, NodeOp},
    Device, Error, ExecutorConfig, Layer, LayerKind, Model, Result, Shape, SingleDataSet,
};

/// Which kind of node a tensor is.
#[derive(Debug, Clone)]
pub enum TensorKind {
    /// A free variable, fed from the data set inputs.
    Input,
    /// A supervision placeholder, fed from the data set outputs. `output`
    /// links it to the model output it supervises.
    Labels { output: Option<TensorId> },
    Constant(f32),
    Array(Arc<[f32]>),
    Layer(Layer),
    /// Output `output` of `model` applied to this tensor's inputs.
    Model { model: Model, output: usize },
}

struct TensorInner {
    id: TensorId,
    label: Option<String>,
    kind: TensorKind,
    inputs: Vec<Tensor>,
    shape: Shape,
    /// Compiled source nodes, per device. Layers cache their own nodes.
    nodes: RwLock<HashMap<DeviceId, Arc<ExecNode>>>,
}

/// A symbolic, shape-typed node of the computation graph.
///
/// Building tensors never computes anything; it records shape and
/// provenance. Tensors are immutable and compare by identity: two tensors
/// are equal only if they are the same node.
#[derive(Clone)]
pub struct Tensor(Arc<TensorInner>);

/// Replacements consulted by [`Tensor::map_inputs`]. Every rebuilt ancestor
/// is recorded, so later rewrites through the same map share it.
#[derive(Debug, Clone, Default)]
pub struct TensorMap {
    replacements: HashMap<TensorId, Tensor>,
}

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: &Tensor, to: Tensor) {
        self.replacements.insert(from.id(), to);
    }

    pub fn get(&self, from: &Tensor) -> Option<&Tensor> {
        self.replacements.get(&from.id())
    }

    pub fn len(&self) -> usize {
        self.replacements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replacements.is_empty()
    }
}

impl FromIterator<(Tensor, Tensor)> for TensorMap {
    fn from_iter<I: IntoIterator<Item = (Tensor, Tensor)>>(iter: I) -> Self {
        let mut map = TensorMap::new();
        for (from, to) in iter {
            map.insert(&from, to);
        }
        map
    }
}

impl Tensor {
    fn from_parts(label: Option<String>, kind: TensorKind, inputs: Vec<Tensor>, shape: Shape) -> Self {
        Tensor(Arc::new(TensorInner {
            id: TensorId::next(),
            label,
            kind,
            inputs,
            shape,
            nodes: RwLock::new(HashMap::new()),
        }))
    }

    pub fn input(label: impl Into<String>, shape: impl Into<Shape>) -> Self {
        Self::from_parts(Some(label.into()), TensorKind::Input, Vec::new(), shape.into())
    }

    pub fn labels(label: impl Into<String>, shape: impl Into<Shape>) -> Self {
        Self::from_parts(
            Some(label.into()),
            TensorKind::Labels { output: None },
            Vec::new(),
            shape.into(),
        )
    }

    /// Labels supervising `output`, with the same shape.
    pub fn labels_for(output: &Tensor) -> Self {
        Self::from_parts(
            Some(format!("{} Labels", output.label())),
            TensorKind::Labels {
                output: Some(output.id()),
            },
            Vec::new(),
            output.shape().clone(),
        )
    }

    pub fn constant(value: f32, shape: impl Into<Shape>) -> Self {
        Self::from_parts(None, TensorKind::Constant(value), Vec::new(), shape.into())
    }

    pub fn zeros(shape: impl Into<Shape>) -> Self {
        Self::constant(0.0, shape)
    }

    pub fn ones(shape: impl Into<Shape>) -> Self {
        Self::constant(1.0, shape)
    }

    pub fn array(shape: impl Into<Shape>, data: Vec<f32>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.element_count() {
            return Err(Error::shape(
                "Array",
                &shape,
                &Shape::new(vec![data.len()]),
                "data length does not match the element count",
            ));
        }
        Ok(Self::from_parts(
            None,
            TensorKind::Array(data.into()),
            Vec::new(),
            shape,
        ))
    }

    pub fn from_host(host: &HostTensor) -> Self {
        Self::from_parts(
            None,
            TensorKind::Array(host.data().into()),
            Vec::new(),
            host.shape().clone(),
        )
    }

    /// Apply `layer` to `inputs`. Shapes are validated here, once.
    pub fn layer_output(layer: &Layer, inputs: Vec<Tensor>) -> Result<Self> {
        let shapes = inputs.iter().map(|t| t.shape().clone()).collect::<Vec<_>>();
        let shape = layer.output_shape(&shapes)?;
        Ok(Self::from_parts(
            None,
            TensorKind::Layer(layer.clone()),
            inputs,
            shape,
        ))
    }

    pub(crate) fn model_output(model: &Model, output: usize, inputs: Vec<Tensor>) -> Result<Self> {
        let shape = model
            .outputs()
            .get(output)
            .map(|o| o.shape().clone())
            .ok_or_else(|| {
                Error::config(format!(
                    "model `{}` has no output {output}",
                    model.label()
                ))
            })?;
        Ok(Self::from_parts(
            None,
            TensorKind::Model {
                model: model.clone(),
                output,
            },
            inputs,
            shape,
        ))
    }

    pub fn id(&self) -> TensorId {
        self.0.id
    }

    pub fn label(&self) -> String {
        if let Some(label) = &self.0.label {
            return label.clone();
        }
        match &self.0.kind {
            TensorKind::Input => format!("Input{}", self.0.id),
            TensorKind::Labels { .. } => format!("Labels{}", self.0.id),
            TensorKind::Constant(v) => format!("Constant{}={v}", self.0.id),
            TensorKind::Array(_) => format!("Array{}", self.0.id),
            TensorKind::Layer(layer) => layer.name().to_string(),
            TensorKind::Model { model, output } => format!("{}[{output}]", model.label()),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.0.shape
    }

    pub fn inputs(&self) -> &[Tensor] {
        &self.0.inputs
    }

    pub fn kind(&self) -> &TensorKind {
        &self.0.kind
    }

    pub fn layer(&self) -> Option<&Layer> {
        match &self.0.kind {
            TensorKind::Layer(layer) => Some(layer),
            _ => None,
        }
    }

    pub fn constant_value(&self) -> Option<f32> {
        match self.0.kind {
            TensorKind::Constant(v) => Some(v),
            _ => None,
        }
    }

    /// Inputs, labels, constants and arrays: nodes with no upstream.
    pub fn is_source(&self) -> bool {
        !matches!(self.0.kind, TensorKind::Layer(_) | TensorKind::Model { .. })
    }

    /// Whether `self` and `other` are the same node.
    pub fn ptr_eq(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Rebuild this node over `inputs`, keeping its layer or model. Returns
    /// `self` when every input is unchanged.
    pub fn with_inputs(&self, inputs: Vec<Tensor>) -> Result<Tensor> {
        let unchanged = inputs.len() == self.0.inputs.len()
            && inputs.iter().zip(&self.0.inputs).all(|(a, b)| a.ptr_eq(b));
        if unchanged {
            return Ok(self.clone());
        }
        match &self.0.kind {
            TensorKind::Layer(layer) => Tensor::layer_output(layer, inputs),
            TensorKind::Model { model, output } => Tensor::model_output(model, *output, inputs),
            _ => Err(Error::config(format!(
                "`{}` is a source and takes no inputs",
                self.label()
            ))),
        }
    }

    /// Replace upstream tensors found in `map`, rebuilding only the
    /// ancestors that changed. Returns `self` itself when nothing in its
    /// closure is replaced.
    pub fn map_inputs(&self, map: &mut TensorMap) -> Result<Tensor> {
        let mut unchanged = HashSet::new();
        self.map_inputs_inner(map, &mut unchanged)
    }

    fn map_inputs_inner(&self, map: &mut TensorMap, unchanged: &mut HashSet<TensorId>) -> Result<Tensor> {
        if self.is_source() {
            return Ok(self.clone());
        }
        let mut inputs = Vec::with_capacity(self.0.inputs.len());
        for input in &self.0.inputs {
            let mapped = if let Some(replacement) = map.get(input) {
                replacement.clone()
            } else if unchanged.contains(&input.id()) {
                input.clone()
            } else {
                let mapped = input.map_inputs_inner(map, unchanged)?;
                if mapped.ptr_eq(input) {
                    unchanged.insert(input.id());
                }
                mapped
            };
            inputs.push(mapped);
        }
        let rebuilt = self.with_inputs(inputs)?;
        if !rebuilt.ptr_eq(self) {
            map.insert(self, rebuilt.clone());
        }
        Ok(rebuilt)
    }

    /// Rewrite every node bottom-up with `f`: each node's inputs are mapped
    /// first, then `f` sees the (possibly rebuilt) node. Shared nodes are
    /// visited once.
    pub fn map(&self, f: &mut dyn FnMut(&Tensor) -> Result<Tensor>) -> Result<Tensor> {
        let mut memo = HashMap::new();
        self.map_memo(f, &mut memo)
    }

    /// Like [`Tensor::map`], but `f` is not applied to `self`.
    pub fn map_inputs_with(&self, f: &mut dyn FnMut(&Tensor) -> Result<Tensor>) -> Result<Tensor> {
        let mut memo = HashMap::new();
        self.map_inputs_memo(f, &mut memo)
    }

    fn map_memo(
        &self,
        f: &mut dyn FnMut(&Tensor) -> Result<Tensor>,
        memo: &mut HashMap<TensorId, Tensor>,
    ) -> Result<Tensor> {
        if let Some(done) = memo.get(&self.id()) {
            return Ok(done.clone());
        }
        let inner = self.map_inputs_memo(f, memo)?;
        let mapped = f(&inner)?;
        memo.insert(self.id(), mapped.clone());
        Ok(mapped)
    }

    fn map_inputs_memo(
        &self,
        f: &mut dyn FnMut(&Tensor) -> Result<Tensor>,
        memo: &mut HashMap<TensorId, Tensor>,
    ) -> Result<Tensor> {
        if self.is_source() {
            return Ok(self.clone());
        }
        let inputs = self
            .0
            .inputs
            .iter()
            .map(|i| i.map_memo(f, memo))
            .collect::<Result<Vec<_>>>()?;
        self.with_inputs(inputs)
    }

    /// Replace every output of a layer matching `predicate` by the sum of
    /// that layer's inputs.
    pub fn remove_layers(&self, predicate: impl Fn(&Layer) -> bool) -> Result<Tensor> {
        self.map(&mut |t| match t.layer() {
            Some(layer) if predicate(layer) => Tensor::sum_all(t.inputs()),
            _ => Ok(t.clone()),
        })
    }

    /// Elementwise sum of `tensors`; a single tensor is returned as is.
    pub fn sum_all(tensors: &[Tensor]) -> Result<Tensor> {
        let (first, rest) = tensors
            .split_first()
            .ok_or_else(|| Error::config("cannot sum an empty list of tensors"))?;
        let mut total = first.clone();
        for t in rest {
            total = total.add(t)?;
        }
        Ok(total)
    }

    /// The compiled node of this tensor on `device`. `memo` dedupes shared
    /// subgraphs within one build.
    pub(crate) fn execution_node(
        &self,
        device: &Device,
        memo: &mut HashMap<TensorId, Arc<ExecNode>>,
    ) -> Result<Arc<ExecNode>> {
        if let Some(node) = memo.get(&self.id()) {
            return Ok(node.clone());
        }
        let node = match &self.0.kind {
            TensorKind::Layer(layer) => {
                let inputs = self
                    .0
                    .inputs
                    .iter()
                    .map(|i| i.execution_node(device, memo))
                    .collect::<Result<Vec<_>>>()?;
                layer.execution_node(&inputs, device)?
            }
            TensorKind::Model { model, output } => {
                let instance = model.rebuild_with_inputs(&self.0.inputs)?;
                instance.outputs()[*output].execution_node(device, memo)?
            }
            _ => self.source_node(device)?,
        };
        memo.insert(self.id(), node.clone());
        Ok(node)
    }

    fn source_node(&self, device: &Device) -> Result<Arc<ExecNode>> {
        let poisoned = || Error::msg("source node cache poisoned");
        if let Some(node) = self.0.nodes.read().map_err(|_| poisoned())?.get(&device.id()) {
            return Ok(node.clone());
        }
        let op = match &self.0.kind {
            TensorKind::Input => NodeOp::Input { tensor: self.id() },
            TensorKind::Labels { output } => NodeOp::Labels {
                tensor: self.id(),
                output: *output,
            },
            TensorKind::Constant(v) => NodeOp::Constant(*v),
            TensorKind::Array(data) => NodeOp::Array(data.clone()),
            TensorKind::Layer(_) | TensorKind::Model { .. } => {
                return Err(Error::msg(format!("`{}` is not a source", self.label())))
            }
        };
        let fresh = Arc::new(ExecNode::new(
            device.id(),
            self.label(),
            op,
            self.shape().clone(),
            Vec::new(),
            None,
        ));
        let mut nodes = self.0.nodes.write().map_err(|_| poisoned())?;
        Ok(nodes.entry(device.id()).or_insert(fresh).clone())
    }

    /// Evaluate this tensor on `device`. The tensor must not depend on
    /// inputs or labels.
    pub fn eval(&self, device: &Device) -> Result<HostTensor> {
        let model = Model::new(vec![self.clone()])?;
        if !model.inputs().is_empty() || !model.labels().is_empty() {
            return Err(Error::config(format!(
                "`{}` depends on inputs; evaluate it through a model instead",
                self.label()
            )));
        }
        let flat = model.flatten()?;
        let graph = InferenceGraph::new(&flat.model, device)?;
        let mut rows = graph.predict_rows(&SingleDataSet::empty(), &ExecutorConfig::default())?;
        rows.pop()
            .and_then(|mut outputs| outputs.pop())
            .ok_or_else(|| Error::device("evaluation produced no result"))
    }

    pub(crate) fn layer_kind(&self) -> Option<&LayerKind> {
        self.layer().map(|l| l.kind())
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Tensor {}

impl std::hash::Hash for Tensor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({}: {})", self.label(), self.0.shape)
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
