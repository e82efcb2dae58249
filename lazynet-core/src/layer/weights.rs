use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};

use crate::{
    layer::{WeightBuffer, WeightsInit},
    pool::PooledBuffer,
    Error, Optimizer, Result,
};

/// Read and write named parameter buffers.
///
/// Archive formats live outside this crate; they drive these callbacks to
/// load or save learned parameters.
pub trait HasBuffers {
    /// Fill every named buffer from `reader`.
    fn read_buffers(&self, reader: &mut dyn FnMut(&str, &mut [f32]) -> Result<()>) -> Result<()>;

    /// Hand every named buffer to `writer`.
    fn write_buffers(&self, writer: &mut dyn FnMut(&str, &[f32]) -> Result<()>) -> Result<()>;
}

/// Per-device learnable state of one weight-bearing layer.
pub trait WeightDataSource: HasBuffers + Send + Sync {
    fn label(&self) -> &str;

    fn parameter_count(&self) -> usize;

    fn set_optimizer(&self, optimizer: &Optimizer);

    fn set_trainable(&self, trainable: bool);

    fn is_trainable(&self) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// A learnable vector with its optimizer state.
#[derive(Debug, Clone)]
pub struct OptimizableVector {
    pub name: String,
    pub value: Vec<f32>,
    pub momentum: Vec<f32>,
    pub velocity: Vec<f32>,
}

impl OptimizableVector {
    pub fn new(name: impl Into<String>, value: Vec<f32>) -> Self {
        let len = value.len();
        Self {
            name: name.into(),
            value,
            momentum: vec![0.0; len],
            velocity: vec![0.0; len],
        }
    }
}

/// Gradients for every vector of a [`HostWeights`], in buffer order.
///
/// The buffers go back to their pool when this is dropped, whether or not
/// an update was applied.
pub struct WeightGradients {
    pub(crate) buffers: Vec<PooledBuffer>,
}

impl WeightGradients {
    pub fn new(buffers: Vec<PooledBuffer>) -> Self {
        Self { buffers }
    }

    /// Release the gradient buffers without applying them.
    pub fn discard(self) {
        drop(self)
    }
}

/// Host-memory weight data source, used by the CPU backend.
pub struct HostWeights {
    label: String,
    vectors: RwLock<Vec<OptimizableVector>>,
    optimizer: Mutex<Optimizer>,
    trainable: AtomicBool,
    step: AtomicU64,
}

impl HostWeights {
    pub fn new(label: impl Into<String>, buffers: &[WeightBuffer], seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut vectors = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            let value = init_values(&buffer.init, buffer.len, &mut rng)?;
            vectors.push(OptimizableVector::new(buffer.name, value));
        }
        Ok(Self {
            label: label.into(),
            vectors: RwLock::new(vectors),
            optimizer: Mutex::new(Optimizer::default()),
            trainable: AtomicBool::new(true),
            step: AtomicU64::new(0),
        })
    }

    /// Run `f` with the current values, in buffer order.
    pub fn with_values<R>(&self, f: impl FnOnce(&[OptimizableVector]) -> R) -> Result<R> {
        let vectors = self
            .vectors
            .read()
            .map_err(|_| Error::device(format!("weights of `{}` are poisoned", self.label)))?;
        Ok(f(&vectors))
    }

    pub fn values(&self, name: &str) -> Result<Vec<f32>> {
        self.with_values(|vs| vs.iter().find(|v| v.name == name).map(|v| v.value.clone()))?
            .ok_or_else(|| Error::msg(format!("`{}` has no buffer named `{name}`", self.label)))
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u64 {
        self.step.load(Ordering::Acquire)
    }

    /// Apply one optimizer step, or release the gradients when locked.
    /// Returns whether the weights changed.
    pub fn apply_gradients(&self, gradients: WeightGradients) -> Result<bool> {
        if !self.is_trainable() {
            log::trace!("skipping update of locked `{}`", self.label);
            gradients.discard();
            return Ok(false);
        }
        let optimizer = *self
            .optimizer
            .lock()
            .map_err(|_| Error::device("optimizer state poisoned"))?;
        let mut vectors = self
            .vectors
            .write()
            .map_err(|_| Error::device(format!("weights of `{}` are poisoned", self.label)))?;
        if vectors.len() != gradients.buffers.len() {
            return Err(Error::device(format!(
                "`{}` expects {} gradient buffers, got {}",
                self.label,
                vectors.len(),
                gradients.buffers.len()
            )));
        }
        let step = self.step.fetch_add(1, Ordering::AcqRel) + 1;
        for (v, g) in vectors.iter_mut().zip(gradients.buffers.iter()) {
            let OptimizableVector {
                value,
                momentum,
                velocity,
                ..
            } = v;
            optimizer.update(step, value, momentum, velocity, g);
        }
        Ok(true)
    }
}

fn init_values(init: &WeightsInit, len: usize, rng: &mut StdRng) -> Result<Vec<f32>> {
    let values = match *init {
        WeightsInit::Gaussian { mean, std } => {
            let normal = Normal::new(mean, std).map_err(|e| Error::config(e.to_string()))?;
            (0..len).map(|_| normal.sample(rng)).collect()
        }
        WeightsInit::Uniform { min, max } => {
            let uniform = Uniform::new(min, max);
            (0..len).map(|_| uniform.sample(rng)).collect()
        }
        WeightsInit::Constant(v) => vec![v; len],
    };
    Ok(values)
}

impl HasBuffers for HostWeights {
    fn read_buffers(&self, reader: &mut dyn FnMut(&str, &mut [f32]) -> Result<()>) -> Result<()> {
        let mut vectors = self
            .vectors
            .write()
            .map_err(|_| Error::device(format!("weights of `{}` are poisoned", self.label)))?;
        for v in vectors.iter_mut() {
            reader(&v.name, &mut v.value)?;
        }
        Ok(())
    }

    fn write_buffers(&self, writer: &mut dyn FnMut(&str, &[f32]) -> Result<()>) -> Result<()> {
        let vectors = self
            .vectors
            .read()
            .map_err(|_| Error::device(format!("weights of `{}` are poisoned", self.label)))?;
        for v in vectors.iter() {
            writer(&v.name, &v.value)?;
        }
        Ok(())
    }
}

impl WeightDataSource for HostWeights {
    fn label(&self) -> &str {
        &self.label
    }

    fn parameter_count(&self) -> usize {
        self.with_values(|vs| vs.iter().map(|v| v.value.len()).sum())
            .unwrap_or(0)
    }

    fn set_optimizer(&self, optimizer: &Optimizer) {
        if let Ok(mut current) = self.optimizer.lock() {
            *current = *optimizer;
        }
    }

    fn set_trainable(&self, trainable: bool) {
        self.trainable.store(trainable, Ordering::Release);
    }

    fn is_trainable(&self) -> bool {
        self.trainable.load(Ordering::Acquire)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SharedPool;

    fn buffers() -> Vec<WeightBuffer> {
        vec![
            WeightBuffer {
                name: "weights",
                len: 4,
                init: WeightsInit::default(),
            },
            WeightBuffer {
                name: "biases",
                len: 2,
                init: WeightsInit::Constant(0.5),
            },
        ]
    }

    #[test]
    fn seeded_init_is_deterministic() {
        let a = HostWeights::new("a", &buffers(), 7).unwrap();
        let b = HostWeights::new("b", &buffers(), 7).unwrap();
        assert_eq!(a.values("weights").unwrap(), b.values("weights").unwrap());
        assert_eq!(a.values("biases").unwrap(), vec![0.5, 0.5]);
        assert_eq!(a.parameter_count(), 6);
    }

    #[test]
    fn locked_weights_release_gradients() {
        let pool = SharedPool::default();
        let w = HostWeights::new("w", &buffers(), 1).unwrap();
        w.set_trainable(false);
        let before = w.values("weights").unwrap();
        let grads = WeightGradients::new(vec![
            pool.filled(4, 1.0),
            pool.filled(2, 1.0),
        ]);
        assert!(!w.apply_gradients(grads).unwrap());
        assert_eq!(w.values("weights").unwrap(), before);
        assert_eq!(pool.metrics().pooled, 2);
    }

    #[test]
    fn buffers_round_trip_through_callbacks() {
        let w = HostWeights::new("w", &buffers(), 1).unwrap();
        w.read_buffers(&mut |name, data| {
            data.fill(if name == "weights" { 2.0 } else { 3.0 });
            Ok(())
        })
        .unwrap();
        let mut seen = Vec::new();
        w.write_buffers(&mut |name, data| {
            seen.push((name.to_string(), data.to_vec()));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen[0], ("weights".to_string(), vec![2.0; 4]));
        assert_eq!(seen[1], ("biases".to_string(), vec![3.0; 2]));
    }
}
