//! Executable graphs and the pipelined batch executor.
//!
//! A graph owns one backend [`Executable`] plus the bookkeeping needed to
//! feed it rows of a [`DataSet`] and to turn its outputs back into
//! [`BatchHistory`] entries. Batches are submitted in order from the
//! caller's thread; at most `max_in_flight` of them have device work
//! outstanding, and completions come back over a bounded channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;

mod evaluation;
mod inference;
mod semaphore;
mod training;

pub use evaluation::EvaluationGraph;
pub use inference::InferenceGraph;
pub use semaphore::{Permit, Semaphore};
pub use training::TrainingGraph;

use crate::{
    backend::{BatchData, Executable},
    dataset::Row,
    handle::TensorId,
    node::{ExecNode, NodeOp},
    pool::SharedPool,
    BatchHistory, DataSet, Device, Error, ExecutorConfig, HostTensor, Model, Result,
    ResultBuffer, Shape, Tensor, TrainingHistory,
};

/// What an executable output is recorded as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// A model output, recorded per row in [`BatchHistory::results`].
    Result,
    /// A loss, recorded as its batch mean in [`BatchHistory::losses`].
    Loss,
    Intermediate,
    /// Computed but not recorded.
    Ignored,
}

#[derive(Debug, Clone)]
pub(crate) struct Export {
    pub role: Role,
    pub label: String,
    pub shape: Shape,
}

impl Export {
    pub fn new(role: Role, tensor: &Tensor) -> Self {
        Self {
            role,
            label: tensor.label(),
            shape: tensor.shape().clone(),
        }
    }
}

/// Where a source slot reads its per-row data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feed {
    Input(usize),
    Labels(usize),
}

/// Positions of a model's inputs, outputs and labels, used to bind fed
/// nodes to data set columns.
#[derive(Debug, Clone)]
pub(crate) struct SourceBindings {
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    labels: Vec<TensorId>,
}

impl SourceBindings {
    pub fn for_model(model: &Model) -> Self {
        Self {
            inputs: model.inputs().iter().map(|t| t.id()).collect(),
            outputs: model.outputs().iter().map(|t| t.id()).collect(),
            labels: model.labels().iter().map(|t| t.id()).collect(),
        }
    }

    /// Labels linked to an output read that output's column; others read
    /// their position among the model labels.
    fn bind(&self, node: &ExecNode) -> Result<Feed> {
        let position = |ids: &[TensorId], id: TensorId| ids.iter().position(|&i| i == id);
        match node.op() {
            NodeOp::Input { tensor } => position(&self.inputs, *tensor)
                .map(Feed::Input)
                .ok_or_else(|| {
                    Error::config(format!("input `{}` is not an input of the model", node.label()))
                }),
            NodeOp::Labels { tensor, output } => output
                .and_then(|o| position(&self.outputs, o))
                .or_else(|| position(&self.labels, *tensor))
                .map(Feed::Labels)
                .ok_or_else(|| {
                    Error::config(format!("labels `{}` are not bound to the model", node.label()))
                }),
            _ => Err(Error::msg(format!("`{}` is not a fed node", node.label()))),
        }
    }
}

/// Compile `tensors` to nodes on `device`, sharing common subgraphs.
pub(crate) fn compile_nodes(device: &Device, tensors: &[Tensor]) -> Result<Vec<Arc<ExecNode>>> {
    let mut memo = HashMap::new();
    tensors
        .iter()
        .map(|t| t.execution_node(device, &mut memo))
        .collect()
}

struct Completed {
    index: usize,
    result: Result<Vec<Vec<f32>>>,
}

/// Bookkeeping of one run while batches are in flight.
struct RunState<'a> {
    history: TrainingHistory,
    consecutive_errors: usize,
    abort: Option<Error>,
    batch_size: usize,
    config: &'a ExecutorConfig,
    callback: &'a mut dyn FnMut(&BatchHistory),
}

/// One backend executable bound to data set columns and history roles.
pub struct ExecutableGraph {
    label: String,
    executable: Arc<dyn Executable>,
    feeds: Vec<Feed>,
    exports: Vec<Export>,
    zero_missing_labels: bool,
    pool: SharedPool,
}

impl ExecutableGraph {
    pub(crate) fn new(
        label: impl Into<String>,
        executable: Arc<dyn Executable>,
        exports: Vec<Export>,
        bindings: &SourceBindings,
        zero_missing_labels: bool,
    ) -> Result<Self> {
        let label = label.into();
        if exports.len() != executable.outputs().len() {
            return Err(Error::msg(format!(
                "`{label}` exports {} tensors but computes {}",
                exports.len(),
                executable.outputs().len()
            )));
        }
        let feeds = executable
            .sources()
            .iter()
            .map(|node| bindings.bind(node))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            label,
            executable,
            feeds,
            exports,
            zero_missing_labels,
            pool: SharedPool::default(),
        })
    }

    /// The same executable recorded under different roles.
    pub(crate) fn reuse(&self, label: impl Into<String>, exports: Vec<Export>, zero_missing_labels: bool) -> Result<Self> {
        if exports.len() != self.exports.len() {
            return Err(Error::msg("reused executable must keep its outputs"));
        }
        Ok(Self {
            label: label.into(),
            executable: self.executable.clone(),
            feeds: self.feeds.clone(),
            exports,
            zero_missing_labels,
            pool: self.pool.clone(),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn executable(&self) -> &Arc<dyn Executable> {
        &self.executable
    }

    pub(crate) fn exports(&self) -> &[Export] {
        &self.exports
    }

    /// Pool the batch buffers are drawn from.
    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }

    /// Group the rows' tensors by source slot into batch-major buffers.
    fn marshal(&self, rows: &[Row]) -> Result<BatchData> {
        let sources = self.executable.sources();
        let mut buffers = Vec::with_capacity(sources.len());
        for (node, feed) in sources.iter().zip(&self.feeds) {
            let len = node.shape().element_count();
            let mut buffer = self.pool.zeroed(rows.len() * len);
            for (r, (inputs, outputs)) in rows.iter().enumerate() {
                let value = match *feed {
                    Feed::Input(i) => inputs.get(i),
                    Feed::Labels(i) => outputs.get(i),
                };
                let value = match value {
                    Some(value) => value,
                    None if self.zero_missing_labels && matches!(feed, Feed::Labels(_)) => continue,
                    None => {
                        return Err(Error::config(format!(
                            "data row has no value for `{}` of `{}`",
                            node.label(),
                            self.label
                        )))
                    }
                };
                if value.shape() != node.shape() {
                    return Err(Error::shape(
                        node.label(),
                        node.shape(),
                        value.shape(),
                        "data does not match the source shape",
                    ));
                }
                buffer[r * len..(r + 1) * len].copy_from_slice(value.data());
            }
            buffers.push(buffer);
        }
        Ok(BatchData {
            batch_size: rows.len(),
            sources: buffers,
        })
    }

    /// Run `batches` batches of `batch_size` rows, reading `data` in order
    /// and wrapping around its end.
    pub(crate) fn run(
        &self,
        data: &dyn DataSet,
        batch_size: usize,
        batches: usize,
        config: &ExecutorConfig,
        callback: &mut dyn FnMut(&BatchHistory),
    ) -> Result<TrainingHistory> {
        if batch_size == 0 {
            return Err(Error::config("batch size must be at least 1"));
        }
        let count = data.count();
        if count == 0 {
            return Err(Error::config(format!("`{}` was given an empty data set", self.label)));
        }
        config.validate()?;
        let needed = self
            .feeds
            .iter()
            .filter_map(|f| match f {
                Feed::Input(i) => Some(i + 1),
                Feed::Labels(_) => None,
            })
            .max()
            .unwrap_or(0);
        let available = data.input_count()?;
        if available < needed {
            return Err(Error::config(format!(
                "`{}` reads {needed} inputs per row, the data set has {available}",
                self.label
            )));
        }

        let semaphore = Semaphore::new(config.max_in_flight);
        let (tx, rx) = mpsc::sync_channel::<Completed>(config.max_in_flight);
        let mut state = RunState {
            history: TrainingHistory::default(),
            consecutive_errors: 0,
            abort: None,
            batch_size,
            config,
            callback,
        };
        log::info!(
            "running `{}`: {batches} batches of {batch_size} over {count} rows",
            self.label
        );

        let mut failure = None;
        for index in 0..batches {
            let start = (index * batch_size) % count;
            let batch = match data
                .get_batch(start, batch_size)
                .and_then(|rows| self.marshal(&rows))
            {
                Ok(batch) => batch,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            let permit = semaphore.acquire();
            let tx = tx.clone();
            self.executable.execute(
                batch,
                Box::new(move |batch, result| {
                    // Buffers go back to the pool before the slot frees up.
                    drop(batch);
                    drop(permit);
                    let _ = tx.send(Completed { index, result });
                }),
            );
            self.drain(&rx, &mut state, false);
            if state.abort.is_some() {
                break;
            }
        }
        drop(tx);
        self.drain(&rx, &mut state, true);

        if let Some(e) = failure.or(state.abort) {
            return Err(e);
        }
        log::info!(
            "`{}` finished: {} batches recorded, {} failed",
            self.label,
            state.history.len(),
            state.history.failed_batches.len()
        );
        Ok(state.history)
    }

    /// Record completions. Blocks until every sender is gone when `all`.
    fn drain(&self, rx: &Receiver<Completed>, state: &mut RunState<'_>, all: bool) {
        loop {
            let completed = if all {
                match rx.recv() {
                    Ok(c) => c,
                    Err(_) => return,
                }
            } else {
                match rx.try_recv() {
                    Ok(c) => c,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
                }
            };
            self.complete(completed, state);
        }
    }

    fn complete(&self, completed: Completed, state: &mut RunState<'_>) {
        let Completed { index, result } = completed;
        let record_intermediates = state.config.record_intermediates;
        match result.and_then(|outputs| self.record(index, outputs, state.batch_size, record_intermediates)) {
            Ok(batch) => {
                state.consecutive_errors = 0;
                log::trace!("`{}` batch {index} loss {}", self.label, batch.loss());
                (state.callback)(&batch);
                state.history.batches.push(batch);
            }
            Err(e) => {
                log::error!("`{}` batch {index} failed: {e}", self.label);
                state.history.failed_batches.push(index);
                state.consecutive_errors += 1;
                if let Some(limit) = state.config.max_consecutive_device_errors {
                    if state.consecutive_errors >= limit && state.abort.is_none() {
                        state.abort = Some(Error::device(format!(
                            "`{}` aborted after {} consecutive failed batches, last: {e}",
                            self.label, state.consecutive_errors
                        )));
                    }
                }
            }
        }
    }

    /// Split the executable outputs of one batch into history entries.
    fn record(
        &self,
        index: usize,
        outputs: Vec<Vec<f32>>,
        batch_size: usize,
        record_intermediates: bool,
    ) -> Result<BatchHistory> {
        if outputs.len() != self.exports.len() {
            return Err(Error::device(format!(
                "`{}` returned {} outputs, expected {}",
                self.label,
                outputs.len(),
                self.exports.len()
            )));
        }
        let mut batch = BatchHistory {
            batch_index: index,
            results: Vec::new(),
            losses: BTreeMap::new(),
            intermediates: BTreeMap::new(),
        };
        for (export, values) in self.exports.iter().zip(outputs) {
            let len = export.shape.element_count();
            if values.len() != len * batch_size {
                return Err(Error::device(format!(
                    "`{}` produced {} values, expected {}",
                    export.label,
                    values.len(),
                    len * batch_size
                )));
            }
            match export.role {
                Role::Result => batch.results.push(self.rows(export, &values)?),
                Role::Loss => {
                    let mean = values.iter().sum::<f32>() / values.len().max(1) as f32;
                    batch.losses.insert(export.label.clone(), mean);
                }
                Role::Intermediate if record_intermediates => {
                    batch
                        .intermediates
                        .insert(export.label.clone(), self.rows(export, &values)?);
                }
                Role::Intermediate | Role::Ignored => {}
            }
        }
        Ok(batch)
    }

    fn rows(&self, export: &Export, values: &[f32]) -> Result<ResultBuffer> {
        let rows = values
            .chunks(export.shape.element_count())
            .map(|chunk| HostTensor::new(export.shape.clone(), chunk.to_vec()))
            .collect::<Result<Vec<_>>>()?;
        Ok(ResultBuffer::new(export.label.clone(), rows))
    }
}

/// Batches needed to cover `count` rows `epochs` times.
pub fn batch_count(count: usize, batch_size: usize, epochs: f32) -> usize {
    let per_epoch = count.div_ceil(batch_size.max(1));
    (per_epoch as f64 * epochs as f64).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_counts() {
        assert_eq!(batch_count(10, 4, 1.0), 3);
        assert_eq!(batch_count(10, 4, 2.5), 8);
        assert_eq!(batch_count(8, 4, 0.5), 1);
        assert_eq!(batch_count(1, 32, 1.0), 1);
    }
}
