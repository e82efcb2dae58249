//! Reference kernels of the CPU backend.
//!
//! Every buffer is batch-major: row `r` of a node with per-row length `n`
//! is `buf[r * n..(r + 1) * n]`, and within a row the last dimension is the
//! fastest moving one.

use std::collections::HashMap;

use gemm::{gemm, Parallelism};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::{
    handle::NodeId,
    layer::{
        ConvParams, DenseParams, HostWeights, LayerKind, LossParams, LossType, PoolParams,
        ReductionType,
    },
    node::ExecNode,
    shape::same_padding_before,
    ConvPadding, Error, Result, Shape,
};

const EPS: f32 = 1e-7;

/// Per-batch state shared by the forward and backward passes.
pub(crate) struct Scratch {
    rng: StdRng,
    masks: HashMap<NodeId, Vec<f32>>,
}

impl Scratch {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            masks: HashMap::new(),
        }
    }
}

/// Gradients produced by one node.
pub(crate) struct Gradients {
    /// One entry per input; `None` where no gradient was requested.
    pub inputs: Vec<Option<Vec<f32>>>,
    /// Weight gradients in buffer order, empty for stateless layers.
    pub weights: Vec<Vec<f32>>,
}

/// Whether [`backward`] implements `kind`.
pub(crate) fn supports_backward(kind: &LayerKind) -> bool {
    !matches!(
        kind,
        LayerKind::ConvTranspose(_) | LayerKind::ArgMax | LayerKind::ArgMin
    )
}

/// Whether [`forward`] implements `kind`.
pub(crate) fn supports_forward(kind: &LayerKind) -> bool {
    !matches!(kind, LayerKind::ConvTranspose(_))
}

fn parallelism() -> Parallelism {
    let num_threads = num_cpus::get();
    if num_threads > 1 {
        Parallelism::Rayon(num_threads)
    } else {
        Parallelism::None
    }
}

/// `dst[m x n] = lhs[m x k] * rhs[k x n]`, with `dst` row-major and the
/// operands read through the given column and row strides.
#[allow(clippy::too_many_arguments)]
fn matmul(
    m: usize,
    n: usize,
    k: usize,
    dst: &mut [f32],
    lhs: &[f32],
    lhs_cs: usize,
    lhs_rs: usize,
    rhs: &[f32],
    rhs_cs: usize,
    rhs_rs: usize,
) {
    debug_assert!(dst.len() >= m * n);
    debug_assert!(lhs.len() >= m * k);
    debug_assert!(rhs.len() >= k * n);
    if m == 0 || n == 0 {
        return;
    }
    if k == 0 {
        dst.fill(0.0);
        return;
    }
    // SAFETY: the operand lengths cover every index the strides reach.
    unsafe {
        gemm(
            /* m: usize = */ m,
            /* n: usize = */ n,
            /* k: usize = */ k,
            /* dst: *mut T = */ dst.as_mut_ptr(),
            /* dst_cs: isize = */ 1,
            /* dst_rs: isize = */ n as isize,
            /* read_dst: bool = */ false,
            /* lhs: *const T = */ lhs.as_ptr(),
            /* lhs_cs: isize = */ lhs_cs as isize,
            /* lhs_rs: isize = */ lhs_rs as isize,
            /* rhs: *const T = */ rhs.as_ptr(),
            /* rhs_cs: isize = */ rhs_cs as isize,
            /* rhs_rs: isize = */ rhs_rs as isize,
            /* alpha: T = */ 0.0,
            /* beta: T = */ 1.0,
            /* conj_dst: bool = */ false,
            /* conj_lhs: bool = */ false,
            /* conj_rhs: bool = */ false,
            parallelism(),
        )
    }
}

fn host_weights(node: &ExecNode) -> Result<&HostWeights> {
    node.weights()
        .and_then(|ws| ws.as_any().downcast_ref::<HostWeights>())
        .ok_or_else(|| Error::device(format!("`{}` has no host weights", node.label())))
}

fn unary(x: &[f32], f: impl Fn(f32) -> f32 + Sync) -> Vec<f32> {
    x.par_iter().map(|&v| f(v)).collect()
}

fn binary(a: &[f32], b: &[f32], f: impl Fn(f32, f32) -> f32 + Sync) -> Vec<f32> {
    a.par_iter().zip(b.par_iter()).map(|(&a, &b)| f(a, b)).collect()
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

fn softmax_into(x: &[f32], out: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut total = 0.0;
    for (o, &v) in out.iter_mut().zip(x) {
        *o = (v - max).exp();
        total += *o;
    }
    for o in out.iter_mut() {
        *o /= total;
    }
}

fn reduce_channels(
    x: &[f32],
    channels: usize,
    f: impl Fn(&[f32]) -> f32 + Send + Sync,
) -> Vec<f32> {
    x.par_chunks(channels).map(f).collect()
}

fn arg_best(group: &[f32], better: impl Fn(f32, f32) -> bool) -> f32 {
    let mut best = 0;
    for (i, &v) in group.iter().enumerate() {
        if better(v, group[best]) {
            best = i;
        }
    }
    best as f32
}

fn input_shape(node: &ExecNode, i: usize) -> &Shape {
    node.inputs()[i].shape()
}

/// Compute the output of a layer node for the whole batch.
pub(crate) fn forward(
    node: &ExecNode,
    inputs: &[&[f32]],
    batch: usize,
    scratch: &mut Scratch,
) -> Result<Vec<f32>> {
    let kind = node
        .layer_kind()
        .ok_or_else(|| Error::device(format!("`{}` is not a layer", node.label())))?;
    let x = inputs[0];
    let out = match kind {
        LayerKind::Linear { scale, offset } => {
            let (scale, offset) = (*scale, *offset);
            unary(x, move |v| scale * v + offset)
        }
        LayerKind::Add => binary(x, inputs[1], |a, b| a + b),
        LayerKind::Subtract => binary(x, inputs[1], |a, b| a - b),
        LayerKind::Multiply => binary(x, inputs[1], |a, b| a * b),
        LayerKind::Divide => binary(x, inputs[1], |a, b| a / b),
        LayerKind::Abs => unary(x, f32::abs),
        LayerKind::ReLU { leak } => {
            let leak = *leak;
            unary(x, move |v| if v > 0.0 { v } else { leak * v })
        }
        LayerKind::Tanh => unary(x, f32::tanh),
        LayerKind::Sigmoid => unary(x, sigmoid),
        LayerKind::SoftMax => {
            let channels = input_shape(node, 0).channels();
            let mut out = vec![0.0; x.len()];
            out.par_chunks_mut(channels)
                .zip(x.par_chunks(channels))
                .for_each(|(o, x)| softmax_into(x, o));
            out
        }
        LayerKind::Dense(p) => dense_forward(node, x, p)?,
        LayerKind::Conv(p) => conv_forward(node, x, p, batch)?,
        LayerKind::ConvTranspose(_) => {
            return Err(Error::device(format!(
                "`{}`: transposed convolution has no CPU kernel",
                node.label()
            )))
        }
        LayerKind::MaxPool(p) => pool_forward(node, x, p, batch, true),
        LayerKind::AvgPool(p) => pool_forward(node, x, p, batch, false),
        LayerKind::Upsample { scale_x, scale_y } => upsample_forward(node, x, *scale_x, *scale_y, batch),
        LayerKind::Concat => concat_forward(node, inputs, batch),
        LayerKind::Dropout { drop_probability } => {
            let keep = 1.0 - drop_probability;
            let mask = (0..x.len())
                .map(|_| {
                    if scratch.rng.gen::<f32>() < keep {
                        1.0 / keep
                    } else {
                        0.0
                    }
                })
                .collect::<Vec<f32>>();
            let out = binary(x, &mask, |a, m| a * m);
            scratch.masks.insert(node.id(), mask);
            out
        }
        LayerKind::BatchNorm(p) => batch_norm_forward(node, x, p.channels, p.epsilon)?,
        LayerKind::Mean => {
            let c = input_shape(node, 0).channels();
            reduce_channels(x, c, |g| g.iter().sum::<f32>() / g.len() as f32)
        }
        LayerKind::Sum => reduce_channels(x, input_shape(node, 0).channels(), |g| g.iter().sum()),
        LayerKind::Max => reduce_channels(x, input_shape(node, 0).channels(), |g| {
            g.iter().copied().fold(f32::NEG_INFINITY, f32::max)
        }),
        LayerKind::Min => reduce_channels(x, input_shape(node, 0).channels(), |g| {
            g.iter().copied().fold(f32::INFINITY, f32::min)
        }),
        LayerKind::ArgMax => reduce_channels(x, input_shape(node, 0).channels(), |g| {
            arg_best(g, |a, b| a > b)
        }),
        LayerKind::ArgMin => reduce_channels(x, input_shape(node, 0).channels(), |g| {
            arg_best(g, |a, b| a < b)
        }),
        LayerKind::SpatialMean => {
            let shape = input_shape(node, 0);
            let (positions, channels) = (shape.positions(), shape.channels());
            let mut out = vec![0.0; batch * channels];
            out.par_chunks_mut(channels)
                .zip(x.par_chunks(shape.element_count()))
                .for_each(|(o, row)| {
                    for pos in row.chunks(channels) {
                        for (o, v) in o.iter_mut().zip(pos) {
                            *o += v;
                        }
                    }
                    for o in o.iter_mut() {
                        *o /= positions as f32;
                    }
                });
            out
        }
        LayerKind::Loss(p) => loss_forward(node, x, inputs[1], p, batch),
    };
    Ok(out)
}

fn dense_forward(node: &ExecNode, x: &[f32], p: &DenseParams) -> Result<Vec<f32>> {
    let (cin, cout) = (p.in_channels, p.out_channels);
    let rows = x.len() / cin;
    let mut out = vec![0.0; rows * cout];
    host_weights(node)?.with_values(|vs| {
        matmul(rows, cout, cin, &mut out, x, 1, cin, &vs[0].value, 1, cout);
        if let Some(bias) = vs.get(1) {
            out.par_chunks_mut(cout).for_each(|row| {
                for (o, b) in row.iter_mut().zip(&bias.value) {
                    *o += b;
                }
            });
        }
    })?;
    Ok(out)
}

/// Sliding-window geometry shared by convolution and pooling.
struct Window {
    h: usize,
    w: usize,
    oh: usize,
    ow: usize,
    top: usize,
    left: usize,
    size_x: usize,
    size_y: usize,
    stride_x: usize,
    stride_y: usize,
}

impl Window {
    #[allow(clippy::too_many_arguments)]
    fn new(
        input: &Shape,
        output: &Shape,
        size_x: usize,
        size_y: usize,
        stride_x: usize,
        stride_y: usize,
        padding: ConvPadding,
    ) -> Self {
        let (h, w, _) = input.hwc();
        let (oh, ow, _) = output.hwc();
        let (top, left) = match padding {
            ConvPadding::Same => (
                same_padding_before(h, oh, size_y, stride_y),
                same_padding_before(w, ow, size_x, stride_x),
            ),
            ConvPadding::Valid => (0, 0),
        };
        Self {
            h,
            w,
            oh,
            ow,
            top,
            left,
            size_x,
            size_y,
            stride_x,
            stride_y,
        }
    }

    fn conv(node: &ExecNode, p: &ConvParams) -> Self {
        Self::new(
            input_shape(node, 0),
            node.shape(),
            p.size_x,
            p.size_y,
            p.stride_x,
            p.stride_y,
            p.padding,
        )
    }

    fn pool(node: &ExecNode, p: &PoolParams) -> Self {
        Self::new(
            input_shape(node, 0),
            node.shape(),
            p.size_x,
            p.size_y,
            p.stride_x,
            p.stride_y,
            p.padding,
        )
    }

    /// Calls `f(tap, input_position)` for every in-bounds tap of the window
    /// at output position `(oy, ox)`. `tap` is `ky * size_x + kx`.
    fn taps(&self, oy: usize, ox: usize, mut f: impl FnMut(usize, usize)) {
        for ky in 0..self.size_y {
            let Some(iy) = (oy * self.stride_y + ky)
                .checked_sub(self.top)
                .filter(|&iy| iy < self.h)
            else {
                continue;
            };
            for kx in 0..self.size_x {
                let Some(ix) = (ox * self.stride_x + kx)
                    .checked_sub(self.left)
                    .filter(|&ix| ix < self.w)
                else {
                    continue;
                };
                f(ky * self.size_x + kx, iy * self.w + ix);
            }
        }
    }
}

fn conv_forward(node: &ExecNode, x: &[f32], p: &ConvParams, batch: usize) -> Result<Vec<f32>> {
    let win = Window::conv(node, p);
    let (ci, co) = (p.in_channels, p.out_channels);
    let (in_len, out_len) = (win.h * win.w * ci, win.oh * win.ow * co);
    let mut out = vec![0.0; batch * out_len];
    host_weights(node)?.with_values(|vs| {
        let kernel = &vs[0].value;
        let bias = vs.get(1).map(|b| b.value.as_slice());
        out.par_chunks_mut(out_len)
            .zip(x.par_chunks(in_len))
            .for_each(|(o, xr)| {
                for oy in 0..win.oh {
                    for ox in 0..win.ow {
                        let dst = &mut o[(oy * win.ow + ox) * co..][..co];
                        if let Some(b) = bias {
                            dst.copy_from_slice(b);
                        }
                        win.taps(oy, ox, |tap, pos| {
                            for (ic, &v) in xr[pos * ci..][..ci].iter().enumerate() {
                                let taps = &kernel[(tap * ci + ic) * co..][..co];
                                for (d, &k) in dst.iter_mut().zip(taps) {
                                    *d += v * k;
                                }
                            }
                        });
                    }
                }
            });
    })?;
    Ok(out)
}

type ConvGradients = (Option<Vec<f32>>, Vec<Vec<f32>>);

fn conv_backward(
    node: &ExecNode,
    x: &[f32],
    dy: &[f32],
    p: &ConvParams,
    want_dx: bool,
) -> Result<ConvGradients> {
    let win = Window::conv(node, p);
    let (ci, co) = (p.in_channels, p.out_channels);
    let (in_len, out_len) = (win.h * win.w * ci, win.oh * win.ow * co);
    let kernel_len = p.size_x * p.size_y * ci * co;

    let dx = if want_dx {
        let mut dx = vec![0.0; x.len()];
        host_weights(node)?.with_values(|vs| {
            let kernel = &vs[0].value;
            dx.par_chunks_mut(in_len)
                .zip(dy.par_chunks(out_len))
                .for_each(|(dx, g)| {
                    for oy in 0..win.oh {
                        for ox in 0..win.ow {
                            let g = &g[(oy * win.ow + ox) * co..][..co];
                            win.taps(oy, ox, |tap, pos| {
                                for (ic, d) in dx[pos * ci..][..ci].iter_mut().enumerate() {
                                    let taps = &kernel[(tap * ci + ic) * co..][..co];
                                    *d += taps.iter().zip(g).map(|(k, g)| k * g).sum::<f32>();
                                }
                            });
                        }
                    }
                });
        })?;
        Some(dx)
    } else {
        None
    };

    let dw = x
        .par_chunks(in_len)
        .zip(dy.par_chunks(out_len))
        .fold(
            || vec![0.0; kernel_len],
            |mut dw, (xr, g)| {
                for oy in 0..win.oh {
                    for ox in 0..win.ow {
                        let g = &g[(oy * win.ow + ox) * co..][..co];
                        win.taps(oy, ox, |tap, pos| {
                            for (ic, &v) in xr[pos * ci..][..ci].iter().enumerate() {
                                let dst = &mut dw[(tap * ci + ic) * co..][..co];
                                for (d, g) in dst.iter_mut().zip(g) {
                                    *d += v * g;
                                }
                            }
                        });
                    }
                }
                dw
            },
        )
        .reduce(|| vec![0.0; kernel_len], add_into);
    let mut weights = vec![dw];
    if p.bias {
        weights.push(column_sums(dy, co));
    }
    Ok((dx, weights))
}

fn add_into(mut a: Vec<f32>, b: Vec<f32>) -> Vec<f32> {
    for (a, b) in a.iter_mut().zip(b) {
        *a += b;
    }
    a
}

/// Sum of every `width`-wide group, elementwise.
fn column_sums(x: &[f32], width: usize) -> Vec<f32> {
    let mut sums = vec![0.0; width];
    for group in x.chunks(width) {
        for (s, v) in sums.iter_mut().zip(group) {
            *s += v;
        }
    }
    sums
}

fn pool_forward(node: &ExecNode, x: &[f32], p: &PoolParams, batch: usize, max: bool) -> Vec<f32> {
    let win = Window::pool(node, p);
    let c = node.shape().channels();
    let (in_len, out_len) = (win.h * win.w * c, win.oh * win.ow * c);
    let mut out = vec![0.0; batch * out_len];
    out.par_chunks_mut(out_len)
        .zip(x.par_chunks(in_len))
        .for_each(|(o, xr)| {
            for oy in 0..win.oh {
                for ox in 0..win.ow {
                    for ch in 0..c {
                        let mut acc = if max { f32::NEG_INFINITY } else { 0.0 };
                        let mut count = 0;
                        win.taps(oy, ox, |_, pos| {
                            let v = xr[pos * c + ch];
                            acc = if max { acc.max(v) } else { acc + v };
                            count += 1;
                        });
                        o[(oy * win.ow + ox) * c + ch] = match (max, count) {
                            (_, 0) => 0.0,
                            (true, _) => acc,
                            (false, n) => acc / n as f32,
                        };
                    }
                }
            }
        });
    out
}

/// Max pooling routes each gradient to the first maximal tap, average
/// pooling spreads it evenly.
fn pool_backward(node: &ExecNode, x: &[f32], dy: &[f32], p: &PoolParams, max: bool) -> Vec<f32> {
    let win = Window::pool(node, p);
    let c = node.shape().channels();
    let (in_len, out_len) = (win.h * win.w * c, win.oh * win.ow * c);
    let mut dx = vec![0.0; x.len()];
    dx.par_chunks_mut(in_len)
        .zip(x.par_chunks(in_len).zip(dy.par_chunks(out_len)))
        .for_each(|(dx, (xr, g))| {
            for oy in 0..win.oh {
                for ox in 0..win.ow {
                    for ch in 0..c {
                        let g = g[(oy * win.ow + ox) * c + ch];
                        let mut taps = Vec::with_capacity(win.size_x * win.size_y);
                        win.taps(oy, ox, |_, pos| taps.push(pos * c + ch));
                        if max {
                            let best = taps.iter().copied().reduce(|best, i| {
                                if xr[i] > xr[best] {
                                    i
                                } else {
                                    best
                                }
                            });
                            if let Some(best) = best {
                                dx[best] += g;
                            }
                        } else {
                            let share = g / taps.len().max(1) as f32;
                            for i in taps {
                                dx[i] += share;
                            }
                        }
                    }
                }
            }
        });
    dx
}

fn upsample_forward(node: &ExecNode, x: &[f32], sx: usize, sy: usize, batch: usize) -> Vec<f32> {
    let (h, w, c) = input_shape(node, 0).hwc();
    let (oh, ow) = (h * sy, w * sx);
    let mut out = vec![0.0; batch * oh * ow * c];
    out.par_chunks_mut(oh * ow * c)
        .zip(x.par_chunks(h * w * c))
        .for_each(|(o, xr)| {
            for oy in 0..oh {
                for ox in 0..ow {
                    let src = &xr[((oy / sy) * w + ox / sx) * c..][..c];
                    o[(oy * ow + ox) * c..][..c].copy_from_slice(src);
                }
            }
        });
    out
}

fn concat_forward(node: &ExecNode, inputs: &[&[f32]], batch: usize) -> Vec<f32> {
    let positions = node.shape().positions();
    let out_channels = node.shape().channels();
    let widths = node.inputs().iter().map(|n| n.shape().channels()).collect::<Vec<_>>();
    let mut out = vec![0.0; batch * positions * out_channels];
    out.par_chunks_mut(out_channels)
        .enumerate()
        .for_each(|(group, o)| {
            let mut offset = 0;
            for (x, &width) in inputs.iter().zip(&widths) {
                o[offset..offset + width].copy_from_slice(&x[group * width..(group + 1) * width]);
                offset += width;
            }
        });
    out
}

/// Per-channel mean and variance over every row and position.
fn channel_stats(x: &[f32], channels: usize) -> (Vec<f32>, Vec<f32>) {
    let groups = (x.len() / channels).max(1) as f32;
    let mut mean = column_sums(x, channels);
    mean.iter_mut().for_each(|m| *m /= groups);
    let mut var = vec![0.0; channels];
    for g in x.chunks(channels) {
        for ((s, v), m) in var.iter_mut().zip(g).zip(&mean) {
            *s += (v - m) * (v - m);
        }
    }
    var.iter_mut().for_each(|s| *s /= groups);
    (mean, var)
}

/// Normalizes with the statistics of the batch.
fn batch_norm_forward(node: &ExecNode, x: &[f32], channels: usize, epsilon: f32) -> Result<Vec<f32>> {
    let (mean, var) = channel_stats(x, channels);
    let mut out = vec![0.0; x.len()];
    host_weights(node)?.with_values(|vs| {
        let (gamma, beta) = (&vs[0].value, &vs[1].value);
        out.par_chunks_mut(channels)
            .zip(x.par_chunks(channels))
            .for_each(|(o, g)| {
                for ch in 0..channels {
                    let norm = (g[ch] - mean[ch]) / (var[ch] + epsilon).sqrt();
                    o[ch] = gamma[ch] * norm + beta[ch];
                }
            });
    })?;
    Ok(out)
}

fn batch_norm_backward(
    node: &ExecNode,
    x: &[f32],
    dy: &[f32],
    channels: usize,
    epsilon: f32,
) -> Result<(Vec<f32>, Vec<Vec<f32>>)> {
    let (mean, var) = channel_stats(x, channels);
    let inv_std = var.iter().map(|v| 1.0 / (v + epsilon).sqrt()).collect::<Vec<_>>();
    let (mean, scale) = (&mean, &inv_std);
    let normalized = x
        .chunks(channels)
        .flat_map(|g| (0..channels).map(move |ch| (g[ch] - mean[ch]) * scale[ch]))
        .collect::<Vec<_>>();
    let dbeta = column_sums(dy, channels);
    let mut dgamma = vec![0.0; channels];
    for (g, n) in dy.chunks(channels).zip(normalized.chunks(channels)) {
        for ch in 0..channels {
            dgamma[ch] += g[ch] * n[ch];
        }
    }
    let groups = (x.len() / channels).max(1) as f32;
    let mut dx = vec![0.0; x.len()];
    host_weights(node)?.with_values(|vs| {
        let gamma = &vs[0].value;
        dx.par_chunks_mut(channels)
            .zip(dy.par_chunks(channels).zip(normalized.par_chunks(channels)))
            .for_each(|(dx, (g, n))| {
                for ch in 0..channels {
                    dx[ch] = gamma[ch] * inv_std[ch] / groups
                        * (groups * g[ch] - dbeta[ch] - n[ch] * dgamma[ch]);
                }
            });
    })?;
    Ok((dx, vec![dgamma, dbeta]))
}

/// Loss of one element, or of one channel group for softmax cross-entropy.
fn loss_terms(loss: LossType, p: &[f32], y: &[f32], channels: usize) -> (f32, usize) {
    match loss {
        LossType::SoftMaxCrossEntropy => {
            let mut total = 0.0;
            for (p, y) in p.chunks(channels).zip(y.chunks(channels)) {
                let max = p.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let lse = max + p.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
                total -= p.iter().zip(y).map(|(p, y)| y * (p - lse)).sum::<f32>();
            }
            (total, p.len() / channels)
        }
        _ => {
            let total = p
                .iter()
                .zip(y)
                .map(|(&p, &y)| match loss {
                    LossType::MeanAbsoluteError => (p - y).abs(),
                    LossType::MeanSquaredError => (p - y) * (p - y),
                    LossType::SigmoidCrossEntropy => {
                        p.max(0.0) - p * y + (1.0 + (-p.abs()).exp()).ln()
                    }
                    LossType::CategoricalCrossEntropy => -y * p.max(EPS).ln(),
                    LossType::Hinge => (1.0 - y * p).max(0.0),
                    LossType::Log => -(y * (p + EPS).ln() + (1.0 - y) * (1.0 - p + EPS).ln()),
                    LossType::KLDivergence => {
                        if y > 0.0 {
                            y * (y.ln() - p.max(EPS).ln())
                        } else {
                            0.0
                        }
                    }
                    LossType::SoftMaxCrossEntropy => 0.0,
                })
                .sum();
            (total, p.len())
        }
    }
}

/// Gradient of the summed loss terms with respect to the predictions.
fn loss_gradient(loss: LossType, p: &[f32], y: &[f32], channels: usize, out: &mut [f32]) {
    match loss {
        LossType::SoftMaxCrossEntropy => {
            for ((p, y), o) in p
                .chunks(channels)
                .zip(y.chunks(channels))
                .zip(out.chunks_mut(channels))
            {
                softmax_into(p, o);
                let total = y.iter().sum::<f32>();
                for (o, y) in o.iter_mut().zip(y) {
                    *o = *o * total - y;
                }
            }
        }
        _ => {
            for ((o, &p), &y) in out.iter_mut().zip(p).zip(y) {
                *o = match loss {
                    LossType::MeanAbsoluteError => {
                        if p > y {
                            1.0
                        } else if p < y {
                            -1.0
                        } else {
                            0.0
                        }
                    }
                    LossType::MeanSquaredError => 2.0 * (p - y),
                    LossType::SigmoidCrossEntropy => sigmoid(p) - y,
                    LossType::CategoricalCrossEntropy | LossType::KLDivergence => -y / p.max(EPS),
                    LossType::Hinge => {
                        if 1.0 - y * p > 0.0 {
                            -y
                        } else {
                            0.0
                        }
                    }
                    LossType::Log => -y / (p + EPS) + (1.0 - y) / (1.0 - p + EPS),
                    LossType::SoftMaxCrossEntropy => 0.0,
                };
            }
        }
    }
}

fn loss_scale(p: &LossParams, count: usize) -> f32 {
    match p.reduction {
        ReductionType::Mean => p.weight / count.max(1) as f32,
        ReductionType::Sum => p.weight,
    }
}

fn loss_forward(node: &ExecNode, pred: &[f32], labels: &[f32], p: &LossParams, batch: usize) -> Vec<f32> {
    let shape = input_shape(node, 0);
    let (len, channels) = (shape.element_count(), shape.channels());
    (0..batch)
        .into_par_iter()
        .map(|r| {
            let rows = r * len..(r + 1) * len;
            let (total, count) = loss_terms(p.loss_type, &pred[rows.clone()], &labels[rows], channels);
            total * loss_scale(p, count)
        })
        .collect()
}

/// Propagate `grad`, the gradient of the objective with respect to this
/// node's output, to its inputs and weights.
pub(crate) fn backward(
    node: &ExecNode,
    inputs: &[&[f32]],
    output: &[f32],
    grad: &[f32],
    needs: &[bool],
    scratch: &Scratch,
) -> Result<Gradients> {
    let kind = node
        .layer_kind()
        .ok_or_else(|| Error::device(format!("`{}` is not a layer", node.label())))?;
    let x = inputs[0];
    let want = |i: usize| needs.get(i).copied().unwrap_or(false);
    let mut weights = Vec::new();
    let grads: Vec<Option<Vec<f32>>> = match kind {
        LayerKind::Linear { scale, .. } => {
            let scale = *scale;
            vec![Some(unary(grad, move |g| g * scale))]
        }
        LayerKind::Add => vec![Some(grad.to_vec()), Some(grad.to_vec())],
        LayerKind::Subtract => vec![Some(grad.to_vec()), Some(unary(grad, |g| -g))],
        LayerKind::Multiply => {
            let b = inputs[1];
            vec![
                want(0).then(|| binary(grad, b, |g, b| g * b)),
                want(1).then(|| binary(grad, x, |g, a| g * a)),
            ]
        }
        LayerKind::Divide => {
            let b = inputs[1];
            let db = want(1).then(|| {
                grad.par_iter()
                    .zip(x.par_iter().zip(b.par_iter()))
                    .map(|(&g, (&a, &b))| -g * a / (b * b))
                    .collect()
            });
            vec![want(0).then(|| binary(grad, b, |g, b| g / b)), db]
        }
        LayerKind::Abs => vec![Some(binary(grad, x, |g, v| {
            if v > 0.0 {
                g
            } else if v < 0.0 {
                -g
            } else {
                0.0
            }
        }))],
        LayerKind::ReLU { leak } => {
            let leak = *leak;
            vec![Some(binary(grad, x, move |g, v| if v > 0.0 { g } else { leak * g }))]
        }
        LayerKind::Tanh => vec![Some(binary(grad, output, |g, y| g * (1.0 - y * y)))],
        LayerKind::Sigmoid => vec![Some(binary(grad, output, |g, y| g * y * (1.0 - y)))],
        LayerKind::SoftMax => {
            let channels = node.shape().channels();
            let mut dx = vec![0.0; grad.len()];
            dx.par_chunks_mut(channels)
                .zip(grad.par_chunks(channels).zip(output.par_chunks(channels)))
                .for_each(|(dx, (g, y))| {
                    let dot = g.iter().zip(y).map(|(g, y)| g * y).sum::<f32>();
                    for ((d, g), y) in dx.iter_mut().zip(g).zip(y) {
                        *d = y * (g - dot);
                    }
                });
            vec![Some(dx)]
        }
        LayerKind::Dense(p) => {
            let (dx, dw) = dense_backward(node, x, grad, p, want(0))?;
            weights = dw;
            vec![dx]
        }
        LayerKind::Conv(p) => {
            let (dx, dw) = conv_backward(node, x, grad, p, want(0))?;
            weights = dw;
            vec![dx]
        }
        LayerKind::MaxPool(p) => vec![Some(pool_backward(node, x, grad, p, true))],
        LayerKind::AvgPool(p) => vec![Some(pool_backward(node, x, grad, p, false))],
        LayerKind::BatchNorm(p) => {
            let (dx, dw) = batch_norm_backward(node, x, grad, p.channels, p.epsilon)?;
            weights = dw;
            vec![Some(dx)]
        }
        LayerKind::Max | LayerKind::Min => {
            let channels = input_shape(node, 0).channels();
            let max = matches!(kind, LayerKind::Max);
            let mut dx = vec![0.0; x.len()];
            dx.par_chunks_mut(channels)
                .zip(x.par_chunks(channels).zip(grad.par_iter()))
                .for_each(|(dx, (group, &g))| {
                    let best = if max {
                        arg_best(group, |a, b| a > b)
                    } else {
                        arg_best(group, |a, b| a < b)
                    };
                    dx[best as usize] = g;
                });
            vec![Some(dx)]
        }
        LayerKind::Concat => {
            let out_channels = node.shape().channels();
            let groups = grad.len() / out_channels;
            let mut offset = 0;
            node.inputs()
                .iter()
                .enumerate()
                .map(|(i, input)| {
                    let width = input.shape().channels();
                    let start = offset;
                    offset += width;
                    want(i).then(|| {
                        let mut dx = Vec::with_capacity(groups * width);
                        for g in grad.chunks(out_channels) {
                            dx.extend_from_slice(&g[start..start + width]);
                        }
                        dx
                    })
                })
                .collect()
        }
        LayerKind::Upsample { scale_x, scale_y } => {
            let (h, w, c) = input_shape(node, 0).hwc();
            let (sx, sy) = (*scale_x, *scale_y);
            let (oh, ow) = (h * sy, w * sx);
            let mut dx = vec![0.0; x.len()];
            dx.par_chunks_mut(h * w * c)
                .zip(grad.par_chunks(oh * ow * c))
                .for_each(|(dx, g)| {
                    for oy in 0..oh {
                        for ox in 0..ow {
                            let dst = &mut dx[((oy / sy) * w + ox / sx) * c..][..c];
                            for (d, v) in dst.iter_mut().zip(&g[(oy * ow + ox) * c..][..c]) {
                                *d += v;
                            }
                        }
                    }
                });
            vec![Some(dx)]
        }
        LayerKind::Dropout { .. } => {
            let mask = scratch.masks.get(&node.id()).ok_or_else(|| {
                Error::device(format!("`{}` has no dropout mask for this batch", node.label()))
            })?;
            vec![Some(binary(grad, mask, |g, m| g * m))]
        }
        LayerKind::Mean | LayerKind::Sum => {
            let channels = input_shape(node, 0).channels();
            let scale = if matches!(kind, LayerKind::Mean) {
                1.0 / channels as f32
            } else {
                1.0
            };
            let mut dx = vec![0.0; x.len()];
            dx.par_chunks_mut(channels)
                .zip(grad.par_iter())
                .for_each(|(dx, &g)| dx.fill(g * scale));
            vec![Some(dx)]
        }
        LayerKind::SpatialMean => {
            let shape = input_shape(node, 0);
            let (positions, channels) = (shape.positions(), shape.channels());
            let mut dx = vec![0.0; x.len()];
            dx.par_chunks_mut(shape.element_count())
                .zip(grad.par_chunks(channels))
                .for_each(|(dx, g)| {
                    for pos in dx.chunks_mut(channels) {
                        for (d, g) in pos.iter_mut().zip(g) {
                            *d = g / positions as f32;
                        }
                    }
                });
            vec![Some(dx)]
        }
        LayerKind::Loss(p) => {
            let shape = input_shape(node, 0);
            let (len, channels) = (shape.element_count(), shape.channels());
            let labels = inputs[1];
            let mut dx = vec![0.0; x.len()];
            dx.par_chunks_mut(len)
                .zip(x.par_chunks(len).zip(labels.par_chunks(len)))
                .zip(grad.par_iter())
                .for_each(|((dx, (pred, y)), &g)| {
                    loss_gradient(p.loss_type, pred, y, channels, dx);
                    let count = match p.loss_type {
                        LossType::SoftMaxCrossEntropy => len / channels,
                        _ => len,
                    };
                    let scale = loss_scale(p, count) * g;
                    dx.iter_mut().for_each(|d| *d *= scale);
                });
            vec![want(0).then_some(dx), None]
        }
        other => {
            return Err(Error::device(format!(
                "`{}`: no CPU gradient for {}",
                node.label(),
                other.name()
            )))
        }
    };
    let inputs = grads
        .into_iter()
        .enumerate()
        .map(|(i, g)| g.filter(|_| want(i)))
        .collect();
    Ok(Gradients { inputs, weights })
}

type DenseGradients = (Option<Vec<f32>>, Vec<Vec<f32>>);

fn dense_backward(
    node: &ExecNode,
    x: &[f32],
    dy: &[f32],
    p: &DenseParams,
    want_dx: bool,
) -> Result<DenseGradients> {
    let (cin, cout) = (p.in_channels, p.out_channels);
    let rows = x.len() / cin;
    let host = host_weights(node)?;
    let dx = if want_dx {
        let mut dx = vec![0.0; rows * cin];
        host.with_values(|vs| matmul(rows, cin, cout, &mut dx, dy, 1, cout, &vs[0].value, cout, 1))?;
        Some(dx)
    } else {
        None
    };
    let mut dw = vec![0.0; cin * cout];
    matmul(cin, cout, rows, &mut dw, x, cin, 1, dy, 1, cout);
    let mut weights = vec![dw];
    if p.bias {
        weights.push(column_sums(dy, cout));
    }
    Ok((dx, weights))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_with_transposed_operands() {
        // a: 2x3, b: 3x2
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let mut c = [0.0; 4];
        matmul(2, 2, 3, &mut c, &a, 1, 3, &b, 1, 2);
        assert_eq!(c, [58.0, 64.0, 139.0, 154.0]);

        // a^T * a: 3x3 through strides only
        let mut ata = [0.0; 9];
        matmul(3, 3, 2, &mut ata, &a, 3, 1, &a, 1, 3);
        assert_eq!(ata, [17.0, 22.0, 27.0, 22.0, 29.0, 36.0, 27.0, 36.0, 45.0]);
    }

    #[test]
    fn loss_values() {
        let (mse, n) = loss_terms(LossType::MeanSquaredError, &[1.0, 3.0], &[0.0, 1.0], 2);
        assert_eq!((mse, n), (5.0, 2));
        let (sce, _) = loss_terms(LossType::SigmoidCrossEntropy, &[0.0], &[1.0], 1);
        assert!((sce - std::f32::consts::LN_2).abs() < 1e-6);
        let (smce, groups) =
            loss_terms(LossType::SoftMaxCrossEntropy, &[0.0, 0.0], &[1.0, 0.0], 2);
        assert_eq!(groups, 1);
        assert!((smce - std::f32::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn loss_gradients_match_finite_differences() {
        let losses = [
            LossType::MeanSquaredError,
            LossType::SigmoidCrossEntropy,
            LossType::SoftMaxCrossEntropy,
            LossType::Hinge,
        ];
        let p = [0.3, -0.7, 1.2];
        let y = [0.0, 1.0, 0.0];
        for loss in losses {
            let mut analytic = [0.0; 3];
            loss_gradient(loss, &p, &y, 3, &mut analytic);
            for i in 0..3 {
                let h = 1e-3;
                let mut up = p;
                up[i] += h;
                let mut down = p;
                down[i] -= h;
                let numeric =
                    (loss_terms(loss, &up, &y, 3).0 - loss_terms(loss, &down, &y, 3).0) / (2.0 * h);
                assert!(
                    (numeric - analytic[i]).abs() < 1e-2,
                    "{loss:?}[{i}]: {numeric} vs {}",
                    analytic[i]
                );
            }
        }
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut out = [0.0; 3];
        softmax_into(&[1.0, 2.0, 3.0], &mut out);
        assert!((out.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(out[2] > out[1] && out[1] > out[0]);
    }
}
