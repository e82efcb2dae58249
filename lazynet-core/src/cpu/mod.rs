//! Reference backend running every graph on the host.
//!
//! Batches are queued on a single command thread per backend, which plays
//! the part of a device command queue: work is executed in submission order
//! and completions fire from that thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use petgraph::{algo::toposort, prelude::DiGraphMap};

use crate::{
    backend::{Backend, BatchData, Completion, Executable},
    handle::NodeId,
    layer::{HostWeights, WeightBuffer, WeightDataSource, WeightGradients},
    node::{collect_nodes, ExecNode, NodeOp},
    pool::SharedPool,
    Error, Result,
};

mod kernels;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct CommandQueue {
    sender: Mutex<mpsc::Sender<Job>>,
    latency: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    executed: AtomicUsize,
}

impl CommandQueue {
    fn new(latency: Duration) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let spawned = thread::Builder::new()
            .name("lazynet-cpu-queue".into())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            });
        if let Err(e) = spawned {
            log::warn!("could not start the cpu command thread, running batches inline: {e}");
        }
        Arc::new(Self {
            sender: Mutex::new(sender),
            latency,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            executed: AtomicUsize::new(0),
        })
    }

    /// Queue `run` on the command thread. The batch stops counting as in
    /// flight once `run` returns, before `complete` sees its output.
    fn submit<T: 'static>(
        self: &Arc<Self>,
        run: impl FnOnce() -> T + Send + 'static,
        complete: impl FnOnce(T) + Send + 'static,
    ) {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        let queue = self.clone();
        let job: Job = Box::new(move || {
            if !queue.latency.is_zero() {
                thread::sleep(queue.latency);
            }
            let output = run();
            queue.executed.fetch_add(1, Ordering::AcqRel);
            queue.in_flight.fetch_sub(1, Ordering::AcqRel);
            complete(output);
        });
        let rejected = match self.sender.lock() {
            Ok(sender) => sender.send(job).err().map(|e| e.0),
            Err(_) => Some(job),
        };
        if let Some(job) = rejected {
            log::warn!("cpu command thread is gone, running batch inline");
            job();
        }
    }
}

/// The host backend. Cloning shares the command queue and its counters.
#[derive(Clone)]
pub struct CpuBackend {
    queue: Arc<CommandQueue>,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// Every batch waits `latency` on the command thread before running,
    /// which makes pipelining observable in tests and benchmarks.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            queue: CommandQueue::new(latency),
        }
    }

    /// Batches submitted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.queue.in_flight.load(Ordering::Acquire)
    }

    /// Highest [`Self::in_flight`] seen so far.
    pub fn peak_in_flight(&self) -> usize {
        self.queue.peak.load(Ordering::Acquire)
    }

    /// Batches executed so far.
    pub fn executed(&self) -> usize {
        self.queue.executed.load(Ordering::Acquire)
    }

    fn program(
        &self,
        label: &str,
        outputs: &[Arc<ExecNode>],
        loss: Option<&Arc<ExecNode>>,
    ) -> Result<Program> {
        let mut roots = outputs.to_vec();
        roots.extend(loss.cloned());
        let nodes = collect_nodes(&roots);
        let index: HashMap<NodeId, usize> =
            nodes.iter().enumerate().map(|(i, n)| (n.id(), i)).collect();

        let mut dag = DiGraphMap::<usize, ()>::new();
        for (i, node) in nodes.iter().enumerate() {
            dag.add_node(i);
            if let Some(kind) = node.layer_kind() {
                if !kernels::supports_forward(kind) {
                    return Err(Error::device(format!(
                        "`{label}`: the cpu backend cannot run {} (`{}`)",
                        kind.name(),
                        node.label()
                    )));
                }
            }
            for input in node.inputs() {
                dag.add_edge(index[&input.id()], i, ());
            }
        }
        let order = toposort(&dag, None)
            .map_err(|_| Error::device(format!("`{label}` contains a cycle")))?
            .into_iter()
            .map(|i| nodes[i].clone())
            .collect::<Vec<_>>();
        let positions = order
            .iter()
            .enumerate()
            .map(|(pos, n)| (n.id(), pos))
            .collect::<HashMap<_, _>>();
        let sources = order
            .iter()
            .filter(|n| n.is_fed())
            .cloned()
            .collect::<Vec<_>>();
        let slots = sources
            .iter()
            .enumerate()
            .map(|(slot, n)| (n.id(), slot))
            .collect();

        Ok(Program {
            label: label.to_string(),
            sources,
            outputs: outputs.to_vec(),
            order,
            positions,
            slots,
            backward: None,
            pool: SharedPool::default(),
            batches: AtomicU64::new(0),
        })
    }
}

struct Backward {
    /// Position of the objective in the execution order.
    loss: usize,
    /// Whether each node, by position, receives a gradient.
    needs_grad: Vec<bool>,
}

struct Program {
    label: String,
    sources: Vec<Arc<ExecNode>>,
    outputs: Vec<Arc<ExecNode>>,
    order: Vec<Arc<ExecNode>>,
    positions: HashMap<NodeId, usize>,
    slots: HashMap<NodeId, usize>,
    backward: Option<Backward>,
    pool: SharedPool,
    batches: AtomicU64,
}

impl Program {
    fn value<'a>(&self, values: &'a [Option<Vec<f32>>], node: &ExecNode) -> Result<&'a [f32]> {
        values[self.positions[&node.id()]]
            .as_deref()
            .ok_or_else(|| Error::device(format!("`{}` was read before it ran", node.label())))
    }

    fn forward(&self, batch: &BatchData, scratch: &mut kernels::Scratch) -> Result<Vec<Option<Vec<f32>>>> {
        let rows = batch.batch_size;
        let mut values: Vec<Option<Vec<f32>>> = vec![None; self.order.len()];
        for (pos, node) in self.order.iter().enumerate() {
            let len = rows * node.shape().element_count();
            let value = match node.op() {
                NodeOp::Input { .. } | NodeOp::Labels { .. } => {
                    let slot = self.slots[&node.id()];
                    let fed = batch.sources.get(slot).ok_or_else(|| {
                        Error::device(format!("`{}`: no buffer for slot {slot}", self.label))
                    })?;
                    if fed.len() != len {
                        return Err(Error::device(format!(
                            "`{}`: expected {len} values, got {}",
                            node.label(),
                            fed.len()
                        )));
                    }
                    fed.to_vec()
                }
                NodeOp::Constant(v) => vec![*v; len],
                NodeOp::Array(data) => data.repeat(rows),
                NodeOp::Layer { .. } => {
                    let inputs = node
                        .inputs()
                        .iter()
                        .map(|i| self.value(&values, i))
                        .collect::<Result<Vec<_>>>()?;
                    kernels::forward(node, &inputs, rows, scratch)?
                }
            };
            values[pos] = Some(value);
        }
        Ok(values)
    }

    fn backward(
        &self,
        backward: &Backward,
        values: &[Option<Vec<f32>>],
        rows: usize,
        scratch: &kernels::Scratch,
    ) -> Result<()> {
        let mut grads: Vec<Option<Vec<f32>>> = vec![None; self.order.len()];
        // The objective is the mean of the per-row losses.
        grads[backward.loss] = Some(vec![1.0 / rows.max(1) as f32; rows]);

        let mut weight_index: HashMap<usize, usize> = HashMap::new();
        let mut weight_grads: Vec<(Arc<dyn WeightDataSource>, Vec<Vec<f32>>)> = Vec::new();
        for pos in (0..self.order.len()).rev() {
            let Some(grad) = grads[pos].take() else {
                continue;
            };
            let node = &self.order[pos];
            if node.layer_kind().is_none() {
                continue;
            }
            let inputs = node
                .inputs()
                .iter()
                .map(|i| self.value(values, i))
                .collect::<Result<Vec<_>>>()?;
            let needs = node
                .inputs()
                .iter()
                .map(|i| backward.needs_grad[self.positions[&i.id()]])
                .collect::<Vec<_>>();
            let output = self.value(values, node)?;
            let computed = kernels::backward(node, &inputs, output, &grad, &needs, scratch)?;

            for (input, dx) in node.inputs().iter().zip(computed.inputs) {
                let Some(dx) = dx else {
                    continue;
                };
                let slot = &mut grads[self.positions[&input.id()]];
                match slot {
                    Some(acc) => acc.iter_mut().zip(dx).for_each(|(a, d)| *a += d),
                    None => *slot = Some(dx),
                }
            }
            if let (Some(ws), false) = (node.weights(), computed.weights.is_empty()) {
                let key = Arc::as_ptr(ws) as *const () as usize;
                match weight_index.get(&key) {
                    Some(&i) => {
                        for (acc, g) in weight_grads[i].1.iter_mut().zip(computed.weights) {
                            acc.iter_mut().zip(g).for_each(|(a, g)| *a += g);
                        }
                    }
                    None => {
                        weight_index.insert(key, weight_grads.len());
                        weight_grads.push((ws.clone(), computed.weights));
                    }
                }
            }
        }

        for (ws, grads) in weight_grads {
            let host = ws.as_any().downcast_ref::<HostWeights>().ok_or_else(|| {
                Error::device(format!("`{}` is not backed by host memory", ws.label()))
            })?;
            let buffers = grads.into_iter().map(|g| self.pool.adopt(g)).collect();
            host.apply_gradients(WeightGradients::new(buffers))?;
        }
        Ok(())
    }

    fn run(&self, batch: &BatchData) -> Result<Vec<Vec<f32>>> {
        let seed = self.batches.fetch_add(1, Ordering::AcqRel);
        let mut scratch = kernels::Scratch::new(seed);
        let values = self.forward(batch, &mut scratch)?;
        let outputs = self
            .outputs
            .iter()
            .map(|o| self.value(&values, o).map(<[f32]>::to_vec))
            .collect::<Result<Vec<_>>>()?;
        if let Some(backward) = &self.backward {
            self.backward(backward, &values, batch.batch_size, &scratch)?;
        }
        Ok(outputs)
    }
}

struct CpuExecutable {
    program: Arc<Program>,
    queue: Arc<CommandQueue>,
}

impl Executable for CpuExecutable {
    fn label(&self) -> &str {
        &self.program.label
    }

    fn sources(&self) -> &[Arc<ExecNode>] {
        &self.program.sources
    }

    fn outputs(&self) -> &[Arc<ExecNode>] {
        &self.program.outputs
    }

    fn is_training(&self) -> bool {
        self.program.backward.is_some()
    }

    fn execute(&self, batch: BatchData, done: Completion) {
        let program = self.program.clone();
        self.queue.submit(
            move || {
                let result = program.run(&batch);
                if let Err(e) = &result {
                    log::debug!("batch of `{}` failed: {e}", program.label);
                }
                (batch, result)
            },
            move |(batch, result)| done(batch, result),
        );
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn create_weight_data_source(
        &self,
        label: &str,
        buffers: &[WeightBuffer],
        seed: u64,
    ) -> Result<Arc<dyn WeightDataSource>> {
        Ok(Arc::new(HostWeights::new(label, buffers, seed)?))
    }

    fn compile(&self, label: &str, outputs: &[Arc<ExecNode>]) -> Result<Arc<dyn Executable>> {
        let program = self.program(label, outputs, None)?;
        log::trace!("compiled `{label}`: {} nodes", program.order.len());
        Ok(Arc::new(CpuExecutable {
            program: Arc::new(program),
            queue: self.queue.clone(),
        }))
    }

    fn compile_gradients(
        &self,
        label: &str,
        loss: &Arc<ExecNode>,
        outputs: &[Arc<ExecNode>],
        visit: &mut dyn FnMut(&ExecNode) -> Result<()>,
    ) -> Result<Arc<dyn Executable>> {
        let mut program = self.program(label, outputs, Some(loss))?;
        let order = &program.order;
        let loss_pos = program.positions[&loss.id()];

        // Only ancestors of the objective get gradients.
        let mut upstream = vec![false; order.len()];
        upstream[loss_pos] = true;
        for pos in (0..order.len()).rev() {
            if upstream[pos] {
                for input in order[pos].inputs() {
                    upstream[program.positions[&input.id()]] = true;
                }
            }
        }

        let mut needs_grad = vec![false; order.len()];
        for (pos, node) in order.iter().enumerate() {
            let Some(kind) = node.layer_kind() else {
                continue;
            };
            if !upstream[pos] || !kind.is_differentiable() {
                continue;
            }
            needs_grad[pos] = node.weights().is_some()
                || node
                    .inputs()
                    .iter()
                    .any(|i| needs_grad[program.positions[&i.id()]]);
        }
        // The objective itself always seeds the pass.
        needs_grad[loss_pos] = loss.layer_kind().is_some();

        for (pos, node) in order.iter().enumerate() {
            if !needs_grad[pos] {
                continue;
            }
            if let Some(kind) = node.layer_kind() {
                if !kernels::supports_backward(kind) {
                    return Err(Error::device(format!(
                        "`{label}`: the cpu backend has no gradient for {} (`{}`)",
                        kind.name(),
                        node.label()
                    )));
                }
            }
            visit(node)?;
        }
        log::trace!(
            "compiled `{label}` with gradients: {} nodes, {} differentiated",
            order.len(),
            needs_grad.iter().filter(|n| **n).count()
        );

        program.backward = Some(Backward {
            loss: loss_pos,
            needs_grad,
        });
        Ok(Arc::new(CpuExecutable {
            program: Arc::new(program),
            queue: self.queue.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn queue_runs_jobs_in_order() {
        let backend = CpuBackend::new();
        let (tx, rx) = channel();
        for i in 0..4 {
            let tx = tx.clone();
            backend.queue.submit(move || i, move |i| {
                let _ = tx.send(i);
            });
        }
        drop(tx);
        let seen = rx.iter().collect::<Vec<_>>();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(backend.executed(), 4);
        assert_eq!(backend.in_flight(), 0);
    }

    #[test]
    fn latency_makes_submissions_overlap() {
        let backend = CpuBackend::with_latency(Duration::from_millis(20));
        let (tx, rx) = channel();
        for _ in 0..3 {
            let tx = tx.clone();
            backend.queue.submit(|| (), move |()| {
                let _ = tx.send(());
            });
        }
        drop(tx);
        assert_eq!(rx.iter().count(), 3);
        assert_eq!(backend.peak_in_flight(), 3);
    }

    #[test]
    fn running_work_counts_as_in_flight() {
        let backend = CpuBackend::new();
        let (tx, rx) = channel();
        let observer = backend.clone();
        backend.queue.submit(
            move || observer.in_flight(),
            move |during| {
                let _ = tx.send(during);
            },
        );
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(backend.in_flight(), 0);
    }
}
