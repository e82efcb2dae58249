use std::fmt;

use crate::{
    bail_config,
    shape::{conv_output_length, conv_transpose_output_length, ConvPadding},
    Error, Result, Shape,
};

/// Initial values for a weight buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WeightsInit {
    Gaussian { mean: f32, std: f32 },
    Uniform { min: f32, max: f32 },
    Constant(f32),
}

impl Default for WeightsInit {
    fn default() -> Self {
        WeightsInit::Gaussian {
            mean: 0.0,
            std: 0.1,
        }
    }
}

impl WeightsInit {
    fn validate(&self) -> Result<()> {
        match *self {
            WeightsInit::Gaussian { std, .. } if !(std >= 0.0) => {
                bail_config!("gaussian weights need a non-negative std, got {std}")
            }
            WeightsInit::Uniform { min, max } if !(min < max) => {
                bail_config!("uniform weights need min < max, got [{min}, {max})")
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LossType {
    MeanAbsoluteError,
    MeanSquaredError,
    SoftMaxCrossEntropy,
    SigmoidCrossEntropy,
    CategoricalCrossEntropy,
    Hinge,
    Log,
    KLDivergence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReductionType {
    #[default]
    Mean,
    Sum,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossParams {
    pub loss_type: LossType,
    pub reduction: ReductionType,
    pub weight: f32,
}

impl LossParams {
    pub fn new(loss_type: LossType) -> Self {
        Self {
            loss_type,
            reduction: ReductionType::Mean,
            weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenseParams {
    pub in_channels: usize,
    pub out_channels: usize,
    pub bias: bool,
    pub weights_init: WeightsInit,
    pub bias_init: f32,
}

impl DenseParams {
    pub fn new(in_channels: usize, out_channels: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            bias: true,
            weights_init: WeightsInit::default(),
            bias_init: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvParams {
    pub in_channels: usize,
    pub out_channels: usize,
    pub size_x: usize,
    pub size_y: usize,
    pub stride_x: usize,
    pub stride_y: usize,
    pub padding: ConvPadding,
    pub bias: bool,
    pub weights_init: WeightsInit,
    pub bias_init: f32,
}

impl ConvParams {
    pub fn new(in_channels: usize, out_channels: usize, size: usize, stride: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            size_x: size,
            size_y: size,
            stride_x: stride,
            stride_y: stride,
            padding: ConvPadding::Same,
            bias: true,
            weights_init: WeightsInit::default(),
            bias_init: 0.0,
        }
    }

    pub fn with_padding(mut self, padding: ConvPadding) -> Self {
        self.padding = padding;
        self
    }

    fn kernel_len(&self) -> usize {
        self.size_x * self.size_y * self.in_channels * self.out_channels
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolParams {
    pub size_x: usize,
    pub size_y: usize,
    pub stride_x: usize,
    pub stride_y: usize,
    pub padding: ConvPadding,
}

impl PoolParams {
    pub fn new(size: usize, stride: usize) -> Self {
        Self {
            size_x: size,
            size_y: size,
            stride_x: stride,
            stride_y: stride,
            padding: ConvPadding::Valid,
        }
    }
}

impl Default for PoolParams {
    fn default() -> Self {
        Self::new(2, 2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormParams {
    pub channels: usize,
    pub epsilon: f32,
}

impl BatchNormParams {
    pub const DEFAULT_EPSILON: f32 = 1e-3;
}

/// Every operation a [`crate::Layer`] can perform, with its hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    /// `scale * x + offset`.
    Linear { scale: f32, offset: f32 },
    Add,
    Subtract,
    Multiply,
    Divide,
    Abs,
    /// Leaky when `leak != 0`.
    ReLU { leak: f32 },
    Tanh,
    Sigmoid,
    SoftMax,
    Dense(DenseParams),
    Conv(ConvParams),
    ConvTranspose(ConvParams),
    MaxPool(PoolParams),
    AvgPool(PoolParams),
    Upsample { scale_x: usize, scale_y: usize },
    Concat,
    Dropout { drop_probability: f32 },
    BatchNorm(BatchNormParams),
    /// Reductions over the feature channels.
    Mean,
    Sum,
    Max,
    Min,
    ArgMax,
    ArgMin,
    /// Mean over every spatial position, per channel.
    SpatialMean,
    /// Inputs are `[prediction, labels]`.
    Loss(LossParams),
}

/// A named learnable buffer of a layer.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightBuffer {
    pub name: &'static str,
    pub len: usize,
    pub init: WeightsInit,
}

impl LayerKind {
    pub const DEFAULT_LEAK: f32 = 0.2;

    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Linear { .. } => "Linear",
            LayerKind::Add => "Add",
            LayerKind::Subtract => "Subtract",
            LayerKind::Multiply => "Multiply",
            LayerKind::Divide => "Divide",
            LayerKind::Abs => "Abs",
            LayerKind::ReLU { .. } => "ReLU",
            LayerKind::Tanh => "Tanh",
            LayerKind::Sigmoid => "Sigmoid",
            LayerKind::SoftMax => "SoftMax",
            LayerKind::Dense(_) => "Dense",
            LayerKind::Conv(_) => "Conv",
            LayerKind::ConvTranspose(_) => "ConvTranspose",
            LayerKind::MaxPool(_) => "MaxPool",
            LayerKind::AvgPool(_) => "AvgPool",
            LayerKind::Upsample { .. } => "Upsample",
            LayerKind::Concat => "Concat",
            LayerKind::Dropout { .. } => "Dropout",
            LayerKind::BatchNorm(_) => "BatchNorm",
            LayerKind::Mean => "Mean",
            LayerKind::Sum => "Sum",
            LayerKind::Max => "Max",
            LayerKind::Min => "Min",
            LayerKind::ArgMax => "ArgMax",
            LayerKind::ArgMin => "ArgMin",
            LayerKind::SpatialMean => "SpatialMean",
            LayerKind::Loss(_) => "Loss",
        }
    }

    pub fn min_input_count(&self) -> usize {
        match self {
            LayerKind::Add
            | LayerKind::Subtract
            | LayerKind::Multiply
            | LayerKind::Divide
            | LayerKind::Concat
            | LayerKind::Loss(_) => 2,
            _ => 1,
        }
    }

    pub fn max_input_count(&self) -> Option<usize> {
        match self {
            LayerKind::Concat => None,
            _ => Some(self.min_input_count()),
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            LayerKind::Add | LayerKind::Subtract | LayerKind::Multiply | LayerKind::Divide
        )
    }

    pub fn is_loss(&self) -> bool {
        matches!(self, LayerKind::Loss(_))
    }

    /// Whether a gradient can flow from this layer's output to its inputs.
    pub fn is_differentiable(&self) -> bool {
        !matches!(self, LayerKind::ArgMax | LayerKind::ArgMin)
    }

    /// Check static hyperparameters.
    pub fn validate(&self) -> Result<()> {
        match self {
            LayerKind::Linear { scale, offset } => {
                if !scale.is_finite() || !offset.is_finite() {
                    bail_config!("linear layer needs finite scale and offset, got {scale} and {offset}")
                }
            }
            LayerKind::ReLU { leak } if !leak.is_finite() => {
                bail_config!("relu leak must be finite, got {leak}")
            }
            LayerKind::Dense(p) => {
                if p.in_channels == 0 || p.out_channels == 0 {
                    bail_config!(
                        "dense layer needs positive channel counts, got {} -> {}",
                        p.in_channels,
                        p.out_channels
                    )
                }
                p.weights_init.validate()?;
            }
            LayerKind::Conv(p) | LayerKind::ConvTranspose(p) => {
                if p.in_channels == 0 || p.out_channels == 0 {
                    bail_config!(
                        "convolution needs positive channel counts, got {} -> {}",
                        p.in_channels,
                        p.out_channels
                    )
                }
                if p.size_x == 0 || p.size_y == 0 || p.stride_x == 0 || p.stride_y == 0 {
                    bail_config!(
                        "convolution window and stride must be at least 1, got {}x{} / {}x{}",
                        p.size_x,
                        p.size_y,
                        p.stride_x,
                        p.stride_y
                    )
                }
                p.weights_init.validate()?;
            }
            LayerKind::MaxPool(p) | LayerKind::AvgPool(p) => {
                if p.size_x == 0 || p.size_y == 0 || p.stride_x == 0 || p.stride_y == 0 {
                    bail_config!(
                        "pooling window and stride must be at least 1, got {}x{} / {}x{}",
                        p.size_x,
                        p.size_y,
                        p.stride_x,
                        p.stride_y
                    )
                }
            }
            LayerKind::Upsample { scale_x, scale_y } => {
                if *scale_x == 0 || *scale_y == 0 {
                    bail_config!("upsample scale must be at least 1, got {scale_x}x{scale_y}")
                }
            }
            LayerKind::Dropout { drop_probability } => {
                if !(0.0..1.0).contains(drop_probability) {
                    bail_config!("dropout probability must be in [0, 1), got {drop_probability}")
                }
            }
            LayerKind::BatchNorm(p) => {
                if p.channels == 0 {
                    bail_config!("batch norm needs a positive channel count")
                }
                if !(p.epsilon > 0.0) {
                    bail_config!("batch norm epsilon must be positive, got {}", p.epsilon)
                }
            }
            LayerKind::Loss(p) if !p.weight.is_finite() => {
                bail_config!("loss weight must be finite, got {}", p.weight)
            }
            _ => {}
        }
        Ok(())
    }

    /// Infer the output shape. Pure: depends only on `self` and `inputs`.
    pub fn output_shape(&self, layer: &str, inputs: &[Shape]) -> Result<Shape> {
        let count = inputs.len();
        if count < self.min_input_count() || self.max_input_count().is_some_and(|m| count > m) {
            return Err(Error::config(format!(
                "`{layer}` takes {}{} inputs, got {count}",
                self.min_input_count(),
                if self.max_input_count().is_none() { "+" } else { "" },
            )));
        }
        let x = &inputs[0];
        let shape = match self {
            LayerKind::Add | LayerKind::Subtract | LayerKind::Multiply | LayerKind::Divide => {
                if inputs[1] != *x {
                    return Err(Error::shape(layer, x, &inputs[1], "operands must have equal shapes"));
                }
                x.clone()
            }
            LayerKind::Loss(_) => {
                if inputs[1] != *x {
                    return Err(Error::shape(
                        layer,
                        x,
                        &inputs[1],
                        "predictions and labels must have equal shapes",
                    ));
                }
                Shape::scalar()
            }
            LayerKind::Linear { .. }
            | LayerKind::Abs
            | LayerKind::ReLU { .. }
            | LayerKind::Tanh
            | LayerKind::Sigmoid
            | LayerKind::SoftMax
            | LayerKind::Dropout { .. } => x.clone(),
            LayerKind::BatchNorm(p) => {
                expect_channels(layer, x, p.channels)?;
                x.clone()
            }
            LayerKind::Dense(p) => {
                expect_channels(layer, x, p.in_channels)?;
                x.with_channels(p.out_channels)
            }
            LayerKind::Conv(p) => {
                expect_channels(layer, x, p.in_channels)?;
                let (h, w, _) = x.hwc();
                Shape::new(vec![
                    conv_output_length(h, p.size_y, p.stride_y, 1, p.padding),
                    conv_output_length(w, p.size_x, p.stride_x, 1, p.padding),
                    p.out_channels,
                ])
            }
            LayerKind::ConvTranspose(p) => {
                expect_channels(layer, x, p.in_channels)?;
                let (h, w, _) = x.hwc();
                Shape::new(vec![
                    conv_transpose_output_length(h, p.size_y, p.stride_y, p.padding),
                    conv_transpose_output_length(w, p.size_x, p.stride_x, p.padding),
                    p.out_channels,
                ])
            }
            LayerKind::MaxPool(p) | LayerKind::AvgPool(p) => {
                let (h, w, c) = x.hwc();
                Shape::new(vec![
                    conv_output_length(h, p.size_y, p.stride_y, 1, p.padding),
                    conv_output_length(w, p.size_x, p.stride_x, 1, p.padding),
                    c,
                ])
            }
            LayerKind::Upsample { scale_x, scale_y } => {
                if x.rank() != 3 {
                    return Err(Error::shape(
                        layer,
                        x,
                        &Shape::new(vec![1, 1, 1]),
                        "upsample needs a rank 3 (height, width, channels) input",
                    ));
                }
                let (h, w, c) = x.hwc();
                Shape::new(vec![h * scale_y, w * scale_x, c])
            }
            LayerKind::Concat => {
                let lead = &x.dims()[..x.rank() - 1];
                let mut channels = 0;
                for other in inputs {
                    if other.rank() != x.rank() || &other.dims()[..other.rank() - 1] != lead {
                        return Err(Error::shape(
                            layer,
                            x,
                            other,
                            "concatenated inputs must agree on all but the last dimension",
                        ));
                    }
                    channels += other.channels();
                }
                x.with_channels(channels)
            }
            LayerKind::Mean
            | LayerKind::Sum
            | LayerKind::Max
            | LayerKind::Min
            | LayerKind::ArgMax
            | LayerKind::ArgMin => x.with_channels(1),
            LayerKind::SpatialMean => Shape::new(vec![1, 1, x.channels()]),
        };
        Ok(shape)
    }

    /// Learnable buffers, empty for stateless layers.
    pub fn weight_buffers(&self) -> Vec<WeightBuffer> {
        match self {
            LayerKind::Dense(p) => {
                let mut buffers = vec![WeightBuffer {
                    name: "weights",
                    len: p.in_channels * p.out_channels,
                    init: p.weights_init,
                }];
                if p.bias {
                    buffers.push(WeightBuffer {
                        name: "biases",
                        len: p.out_channels,
                        init: WeightsInit::Constant(p.bias_init),
                    });
                }
                buffers
            }
            LayerKind::Conv(p) | LayerKind::ConvTranspose(p) => {
                let mut buffers = vec![WeightBuffer {
                    name: "weights",
                    len: p.kernel_len(),
                    init: p.weights_init,
                }];
                if p.bias {
                    buffers.push(WeightBuffer {
                        name: "biases",
                        len: p.out_channels,
                        init: WeightsInit::Constant(p.bias_init),
                    });
                }
                buffers
            }
            LayerKind::BatchNorm(p) => vec![
                WeightBuffer {
                    name: "gamma",
                    len: p.channels,
                    init: WeightsInit::Constant(1.0),
                },
                WeightBuffer {
                    name: "beta",
                    len: p.channels,
                    init: WeightsInit::Constant(0.0),
                },
            ],
            _ => Vec::new(),
        }
    }

    pub fn has_weights(&self) -> bool {
        matches!(
            self,
            LayerKind::Dense(_)
                | LayerKind::Conv(_)
                | LayerKind::ConvTranspose(_)
                | LayerKind::BatchNorm(_)
        )
    }

    pub fn parameter_count(&self) -> usize {
        self.weight_buffers().iter().map(|b| b.len).sum()
    }
}

fn expect_channels(layer: &str, x: &Shape, channels: usize) -> Result<()> {
    if x.channels() != channels {
        return Err(Error::shape(
            layer,
            x,
            &x.with_channels(channels),
            format!("expected {channels} input channels"),
        ));
    }
    Ok(())
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerKind::Linear { scale, offset } => write!(f, "Linear({scale}, {offset})"),
            LayerKind::ReLU { leak } if *leak != 0.0 => write!(f, "LeakyReLU({leak})"),
            LayerKind::Dense(p) => write!(f, "Dense({} -> {})", p.in_channels, p.out_channels),
            LayerKind::Conv(p) | LayerKind::ConvTranspose(p) => write!(
                f,
                "{}({} -> {}, {}x{}/{})",
                self.name(),
                p.in_channels,
                p.out_channels,
                p.size_x,
                p.size_y,
                p.stride_x
            ),
            LayerKind::Loss(p) => write!(f, "Loss({:?})", p.loss_type),
            other => write!(f, "{}", other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_window_must_be_positive() {
        let err = LayerKind::MaxPool(PoolParams::new(0, 2)).validate().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn concat_sums_channels() {
        let shape = LayerKind::Concat
            .output_shape(
                "concat",
                &[Shape::from([4, 4, 3]), Shape::from([4, 4, 5])],
            )
            .unwrap();
        assert_eq!(shape, Shape::from([4, 4, 8]));
    }

    #[test]
    fn dense_params_count() {
        let kind = LayerKind::Dense(DenseParams::new(3, 8));
        assert_eq!(kind.parameter_count(), 3 * 8 + 8);
    }
}
