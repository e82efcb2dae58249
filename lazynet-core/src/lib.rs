//! Lazynet is a neural-network graph engine built around lazy, structurally shared tensors.
//!
//! Building a graph never computes anything: every operator records a new immutable
//! [`Tensor`] that remembers its inputs and its inferred [`Shape`]. Graphs are grouped into
//! [`Model`]s, which can be applied to other tensors like layers, nested arbitrarily deep and
//! flattened back into one graph with a [`TrainableMap`] describing which layers may learn.
//!
//! Compiling a model for a [`Device`] produces a [`CompiledModel`] holding three executable
//! forms (evaluation, inference and training). Every one of them runs through a pipelined
//! executor that keeps at most [`ExecutorConfig::max_in_flight`] batches on the device and
//! records one [`BatchHistory`] per batch in submission order.
//!
//! ## A quick guide
//! - Create sources with [`Tensor::input`], [`Tensor::labels`] or [`Tensor::constant`].
//! - Chain operators such as [`Tensor::dense`], [`Tensor::relu`] or `+ - * /`. Each returns a
//!   `Result` because shapes are checked as the graph is built.
//! - Wrap the outputs in a [`Model`] with [`Model::new`] or [`Model::builder`].
//! - Train with [`Model::fit`] and run with [`Model::predict_rows`]. Both compile on first use
//!   and cache the compiled form per device.
//!
//! ## What can you do with it?
//! ```
//! use lazynet_core::{Device, InMemoryDataSet, HostTensor, Model, Tensor};
//!
//! let device = Device::cpu();
//!
//! // Constant expressions fold while the graph is built.
//! let three = (Tensor::zeros([1]) + Tensor::ones([1]))?.linear(3.0, 0.0)?;
//! assert_eq!(three.eval(&device)?.to_vec(), vec![3.0]);
//!
//! // y = 2x, learned by a single dense unit.
//! let x = Tensor::input("x", [1]);
//! let model = Model::new(vec![x.dense(1)?])?;
//! let rows = (0..16)
//!     .map(|i| {
//!         let v = i as f32 / 16.0;
//!         (vec![HostTensor::scalar(v)], vec![HostTensor::scalar(2.0 * v)])
//!     })
//!     .collect();
//! let history = model.fit(&InMemoryDataSet::new(rows), 4, 2.0, &device)?;
//! assert_eq!(history.len(), 8);
//! # Ok::<(), lazynet_core::Error>(())
//! ```

mod backend;
mod compiled;
mod config;
mod cpu;
mod dataset;
mod device;
mod error;
mod graph;
mod handle;
mod history;
mod layer;
mod model;
mod node;
mod optimizer;
mod pool;
mod shape;
mod tensor;

pub use backend::{Backend, BatchData, Completion, Executable};
pub use compiled::{CompiledModel, TOTAL_LOSS_LABEL};
pub use config::{
    ExecutorConfig, BATCH_SIZE_VAR, EPOCHS_VAR, MAX_DEVICE_ERRORS_VAR, MAX_IN_FLIGHT_VAR,
};
pub use cpu::CpuBackend;
pub use dataset::{DataSet, GeneratedDataSet, InMemoryDataSet, Row, SingleDataSet};
pub use device::Device;
pub use error::{Context, Error, Result};
pub use graph::{
    batch_count, EvaluationGraph, ExecutableGraph, InferenceGraph, Permit, Semaphore,
    TrainingGraph,
};
pub use handle::{DeviceId, LayerId, ModelId, NodeId, TensorId};
pub use history::{BatchHistory, ResultBuffer, TrainingHistory};
pub use layer::{
    BatchNormParams, ConvParams, DenseParams, HasBuffers, HostWeights, Layer, LayerKind,
    LayerOptions, LossParams, LossType, OptimizableVector, PoolParams, ReductionType,
    WeightBuffer, WeightDataSource, WeightGradients, WeightsInit,
};
pub use model::{Flattened, Model, ModelBuilder, TrainableMap};
pub use node::{ExecNode, NodeOp};
pub use optimizer::{AdamParams, Optimizer};
pub use pool::{PoolMetrics, PooledBuffer, SharedPool};
pub use shape::{conv_output_length, conv_transpose_output_length, ConvPadding, Shape};
pub use tensor::{HostTensor, Tensor, TensorKind, TensorMap};
