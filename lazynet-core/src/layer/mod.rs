use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

mod kind;
mod weights;

pub use kind::{
    BatchNormParams, ConvParams, DenseParams, LayerKind, LossParams, LossType, PoolParams,
    ReductionType, WeightBuffer, WeightsInit,
};
pub use weights::{HasBuffers, HostWeights, OptimizableVector, WeightDataSource, WeightGradients};

use crate::{
    handle::{label_or_default, DeviceId, LayerId, NodeId},
    node::{ExecNode, NodeOp},
    Device, Error, Result, Shape, Tensor,
};

/// Construction options for a [`Layer`].
#[derive(Debug, Clone)]
pub struct LayerOptions {
    pub name: Option<String>,
    /// Whether an optimizer may update this layer's weights.
    pub trainable: bool,
    /// Seed for weight initialization; defaults to the layer id.
    pub seed: Option<u64>,
}

impl Default for LayerOptions {
    fn default() -> Self {
        Self {
            name: None,
            trainable: true,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NodeKey {
    device: DeviceId,
    inputs: Vec<NodeId>,
}

struct LayerInner {
    id: LayerId,
    name: String,
    kind: LayerKind,
    trainable: bool,
    seed: u64,
    nodes: RwLock<HashMap<NodeKey, Arc<ExecNode>>>,
    weights: RwLock<HashMap<DeviceId, Arc<dyn WeightDataSource>>>,
    /// Buffers loaded before any device held this layer's weights.
    restored: RwLock<Option<HashMap<String, Vec<f32>>>>,
}

/// A named operation. Computes output shapes from input shapes and, for
/// weight-bearing kinds, owns one weight data source per device.
///
/// Cloning a `Layer` shares it: every tensor built from the same layer
/// shares its weights.
#[derive(Clone)]
pub struct Layer(Arc<LayerInner>);

fn poisoned(what: &str) -> Error {
    Error::msg(format!("{what} lock poisoned"))
}

impl Layer {
    pub fn new(kind: LayerKind) -> Result<Self> {
        Self::with_options(kind, LayerOptions::default())
    }

    pub fn named(name: impl Into<String>, kind: LayerKind) -> Result<Self> {
        Self::with_options(
            kind,
            LayerOptions {
                name: Some(name.into()),
                ..Default::default()
            },
        )
    }

    pub fn with_options(kind: LayerKind, options: LayerOptions) -> Result<Self> {
        kind.validate()?;
        let id = LayerId::next();
        let name = label_or_default(options.name, kind.name(), id.get());
        Ok(Layer(Arc::new(LayerInner {
            id,
            name,
            seed: options.seed.unwrap_or(id.get() as u64),
            kind,
            trainable: options.trainable,
            nodes: RwLock::new(HashMap::new()),
            weights: RwLock::new(HashMap::new()),
            restored: RwLock::new(None),
        })))
    }

    pub fn id(&self) -> LayerId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> &LayerKind {
        &self.0.kind
    }

    pub fn is_trainable(&self) -> bool {
        self.0.trainable
    }

    pub fn has_weights(&self) -> bool {
        self.0.kind.has_weights()
    }

    pub fn parameter_count(&self) -> usize {
        self.0.kind.parameter_count()
    }

    pub fn output_shape(&self, inputs: &[Shape]) -> Result<Shape> {
        self.0.kind.output_shape(&self.0.name, inputs)
    }

    /// Apply this layer to `inputs`, producing a new symbolic tensor.
    pub fn call(&self, inputs: &[Tensor]) -> Result<Tensor> {
        Tensor::layer_output(self, inputs.to_vec())
    }

    /// The compiled node of this layer over `inputs` on `device`. Repeated
    /// calls with the same device and upstream nodes return the same node.
    pub fn execution_node(&self, inputs: &[Arc<ExecNode>], device: &Device) -> Result<Arc<ExecNode>> {
        let key = NodeKey {
            device: device.id(),
            inputs: inputs.iter().map(|n| n.id()).collect(),
        };
        if let Some(node) = self.0.nodes.read().map_err(|_| poisoned("node cache"))?.get(&key) {
            return Ok(node.clone());
        }

        let shapes = inputs.iter().map(|n| n.shape().clone()).collect::<Vec<_>>();
        let shape = self.output_shape(&shapes)?;
        let weights = self.weight_data_source(device)?;
        let fresh = Arc::new(ExecNode::new(
            device.id(),
            self.0.name.clone(),
            NodeOp::Layer {
                layer: self.0.id,
                kind: self.0.kind.clone(),
            },
            shape,
            inputs.to_vec(),
            weights,
        ));

        let mut nodes = self.0.nodes.write().map_err(|_| poisoned("node cache"))?;
        Ok(nodes.entry(key).or_insert(fresh).clone())
    }

    /// Learnable state of this layer on `device`, created on first use.
    /// `None` for layers without weights.
    pub fn weight_data_source(&self, device: &Device) -> Result<Option<Arc<dyn WeightDataSource>>> {
        if !self.has_weights() {
            return Ok(None);
        }
        if let Some(ws) = self
            .0
            .weights
            .read()
            .map_err(|_| poisoned("weights cache"))?
            .get(&device.id())
        {
            return Ok(Some(ws.clone()));
        }

        let fresh = device.backend().create_weight_data_source(
            &self.0.name,
            &self.0.kind.weight_buffers(),
            self.0.seed,
        )?;
        if let Some(restored) = self.0.restored.read().map_err(|_| poisoned("restore"))?.as_ref() {
            fresh.read_buffers(&mut |name, data| copy_restored(restored, name, data))?;
        }

        let mut weights = self.0.weights.write().map_err(|_| poisoned("weights cache"))?;
        let winner = weights
            .entry(device.id())
            .or_insert_with(|| {
                log::debug!("created weights for `{}` on {:?}", self.0.name, device);
                fresh
            })
            .clone();
        Ok(Some(winner))
    }

    /// Every weight data source created so far, ordered by device.
    pub fn weight_data_sources(&self) -> Vec<Arc<dyn WeightDataSource>> {
        let Ok(weights) = self.0.weights.read() else {
            return Vec::new();
        };
        let mut sources = weights.iter().collect::<Vec<_>>();
        sources.sort_by_key(|(device, _)| **device);
        sources.into_iter().map(|(_, ws)| ws.clone()).collect()
    }
}

fn copy_restored(restored: &HashMap<String, Vec<f32>>, name: &str, data: &mut [f32]) -> Result<()> {
    match restored.get(name) {
        Some(values) if values.len() == data.len() => {
            data.copy_from_slice(values);
            Ok(())
        }
        Some(values) => Err(Error::config(format!(
            "buffer `{name}` holds {} values, expected {}",
            values.len(),
            data.len()
        ))),
        None => Ok(()),
    }
}

impl HasBuffers for Layer {
    fn read_buffers(&self, reader: &mut dyn FnMut(&str, &mut [f32]) -> Result<()>) -> Result<()> {
        if !self.has_weights() {
            return Ok(());
        }
        let mut loaded = HashMap::new();
        for buffer in self.0.kind.weight_buffers() {
            let mut data = vec![0.0; buffer.len];
            reader(buffer.name, &mut data)?;
            loaded.insert(buffer.name.to_string(), data);
        }
        for ws in self.weight_data_sources() {
            ws.read_buffers(&mut |name, data| copy_restored(&loaded, name, data))?;
        }
        *self.0.restored.write().map_err(|_| poisoned("restore"))? = Some(loaded);
        Ok(())
    }

    fn write_buffers(&self, writer: &mut dyn FnMut(&str, &[f32]) -> Result<()>) -> Result<()> {
        if !self.has_weights() {
            return Ok(());
        }
        if let Some(ws) = self.weight_data_sources().first() {
            return ws.write_buffers(writer);
        }
        let restored = self.0.restored.read().map_err(|_| poisoned("restore"))?;
        match restored.as_ref() {
            Some(buffers) => {
                for buffer in self.0.kind.weight_buffers() {
                    if let Some(data) = buffers.get(buffer.name) {
                        writer(buffer.name, data)?;
                    }
                }
                Ok(())
            }
            None => Err(Error::resource(format!(
                "`{}` has no weights on any device yet",
                self.0.name
            ))),
        }
    }
}

impl PartialEq for Layer {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Layer {}

impl std::hash::Hash for Layer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state)
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Layer({} = {})", self.0.name, self.0.kind)
    }
}
