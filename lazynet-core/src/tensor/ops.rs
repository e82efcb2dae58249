use crate::{
    layer::{
        BatchNormParams, ConvParams, DenseParams, Layer, LayerKind, LossParams, LossType,
        PoolParams,
    },
    Model, Result, Tensor, TensorKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl BinaryOp {
    fn apply(&self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Subtract => a - b,
            BinaryOp::Multiply => a * b,
            BinaryOp::Divide => a / b,
        }
    }

    fn kind(&self) -> LayerKind {
        match self {
            BinaryOp::Add => LayerKind::Add,
            BinaryOp::Subtract => LayerKind::Subtract,
            BinaryOp::Multiply => LayerKind::Multiply,
            BinaryOp::Divide => LayerKind::Divide,
        }
    }
}

impl Tensor {
    fn unary(&self, kind: LayerKind) -> Result<Tensor> {
        Layer::new(kind)?.call(&[self.clone()])
    }

    /// Binary op with constant folding: two constants fold to a constant, a
    /// constant and a non-constant fold to one [`LayerKind::Linear`].
    fn binary(&self, other: &Tensor, op: BinaryOp) -> Result<Tensor> {
        match (self.constant_value(), other.constant_value()) {
            (Some(a), Some(b)) => {
                if self.shape() != other.shape() {
                    return Err(crate::Error::shape(
                        op.kind().name(),
                        self.shape(),
                        other.shape(),
                        "constant operands must have equal shapes",
                    ));
                }
                Ok(Tensor::constant(op.apply(a, b), self.shape().clone()))
            }
            (None, Some(b)) => match op {
                BinaryOp::Add => self.linear(1.0, b),
                BinaryOp::Subtract => self.linear(1.0, -b),
                BinaryOp::Multiply => self.linear(b, 0.0),
                BinaryOp::Divide => self.linear(1.0 / b, 0.0),
            },
            (Some(a), None) => match op {
                BinaryOp::Add => other.linear(1.0, a),
                BinaryOp::Subtract => other.linear(-1.0, a),
                BinaryOp::Multiply => other.linear(a, 0.0),
                BinaryOp::Divide => Layer::new(op.kind())?.call(&[
                    Tensor::constant(a, other.shape().clone()),
                    other.clone(),
                ]),
            },
            (None, None) => Layer::new(op.kind())?.call(&[self.clone(), other.clone()]),
        }
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryOp::Add)
    }

    pub fn subtract(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryOp::Subtract)
    }

    pub fn multiply(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryOp::Multiply)
    }

    pub fn divide(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryOp::Divide)
    }

    /// `scale * self + offset`. Folds into constants and into an upstream
    /// linear layer; the identity transform returns `self`.
    pub fn linear(&self, scale: f32, offset: f32) -> Result<Tensor> {
        if let Some(c) = self.constant_value() {
            return Ok(Tensor::constant(scale * c + offset, self.shape().clone()));
        }
        if scale == 1.0 && offset == 0.0 {
            return Ok(self.clone());
        }
        if let Some(&LayerKind::Linear {
            scale: inner_scale,
            offset: inner_offset,
        }) = self.layer_kind()
        {
            return self.inputs()[0].linear(scale * inner_scale, scale * inner_offset + offset);
        }
        self.unary(LayerKind::Linear { scale, offset })
    }

    pub fn abs(&self) -> Result<Tensor> {
        self.unary(LayerKind::Abs)
    }

    pub fn relu(&self) -> Result<Tensor> {
        self.unary(LayerKind::ReLU { leak: 0.0 })
    }

    pub fn leaky_relu(&self, leak: f32) -> Result<Tensor> {
        self.unary(LayerKind::ReLU { leak })
    }

    pub fn tanh(&self) -> Result<Tensor> {
        self.unary(LayerKind::Tanh)
    }

    pub fn sigmoid(&self) -> Result<Tensor> {
        self.unary(LayerKind::Sigmoid)
    }

    pub fn softmax(&self) -> Result<Tensor> {
        self.unary(LayerKind::SoftMax)
    }

    /// Fully connected over the last dimension.
    pub fn dense(&self, out_channels: usize) -> Result<Tensor> {
        self.dense_with(DenseParams::new(self.shape().channels(), out_channels))
    }

    pub fn dense_with(&self, params: DenseParams) -> Result<Tensor> {
        self.unary(LayerKind::Dense(params))
    }

    pub fn conv(&self, out_channels: usize, size: usize, stride: usize) -> Result<Tensor> {
        self.conv_with(ConvParams::new(
            self.shape().channels(),
            out_channels,
            size,
            stride,
        ))
    }

    pub fn conv_with(&self, params: ConvParams) -> Result<Tensor> {
        self.unary(LayerKind::Conv(params))
    }

    pub fn conv_transpose(&self, out_channels: usize, size: usize, stride: usize) -> Result<Tensor> {
        self.conv_transpose_with(ConvParams::new(
            self.shape().channels(),
            out_channels,
            size,
            stride,
        ))
    }

    pub fn conv_transpose_with(&self, params: ConvParams) -> Result<Tensor> {
        self.unary(LayerKind::ConvTranspose(params))
    }

    pub fn max_pool(&self, size: usize, stride: usize) -> Result<Tensor> {
        self.unary(LayerKind::MaxPool(PoolParams::new(size, stride)))
    }

    pub fn avg_pool(&self, size: usize, stride: usize) -> Result<Tensor> {
        self.unary(LayerKind::AvgPool(PoolParams::new(size, stride)))
    }

    pub fn pool_with(&self, params: PoolParams, max: bool) -> Result<Tensor> {
        if max {
            self.unary(LayerKind::MaxPool(params))
        } else {
            self.unary(LayerKind::AvgPool(params))
        }
    }

    pub fn upsample(&self, scale_x: usize, scale_y: usize) -> Result<Tensor> {
        self.unary(LayerKind::Upsample { scale_x, scale_y })
    }

    /// Concatenate along the last dimension.
    pub fn concat(&self, others: &[Tensor]) -> Result<Tensor> {
        let mut inputs = Vec::with_capacity(others.len() + 1);
        inputs.push(self.clone());
        inputs.extend(others.iter().cloned());
        Layer::new(LayerKind::Concat)?.call(&inputs)
    }

    pub fn dropout(&self, drop_probability: f32) -> Result<Tensor> {
        self.unary(LayerKind::Dropout { drop_probability })
    }

    pub fn batch_norm(&self) -> Result<Tensor> {
        self.unary(LayerKind::BatchNorm(BatchNormParams {
            channels: self.shape().channels(),
            epsilon: BatchNormParams::DEFAULT_EPSILON,
        }))
    }

    pub fn mean(&self) -> Result<Tensor> {
        self.unary(LayerKind::Mean)
    }

    pub fn sum(&self) -> Result<Tensor> {
        self.unary(LayerKind::Sum)
    }

    pub fn max(&self) -> Result<Tensor> {
        self.unary(LayerKind::Max)
    }

    pub fn min(&self) -> Result<Tensor> {
        self.unary(LayerKind::Min)
    }

    pub fn argmax(&self) -> Result<Tensor> {
        self.unary(LayerKind::ArgMax)
    }

    pub fn argmin(&self) -> Result<Tensor> {
        self.unary(LayerKind::ArgMin)
    }

    pub fn spatial_mean(&self) -> Result<Tensor> {
        self.unary(LayerKind::SpatialMean)
    }

    pub fn loss(&self, labels: &Tensor, loss_type: LossType) -> Result<Tensor> {
        self.loss_with(labels, LossParams::new(loss_type))
    }

    pub fn loss_with(&self, labels: &Tensor, params: LossParams) -> Result<Tensor> {
        Layer::new(LayerKind::Loss(params))?.call(&[self.clone(), labels.clone()])
    }

    /// Apply `model` with `self` as its only input.
    pub fn apply(&self, model: &Model) -> Result<Tensor> {
        model.apply(&[self.clone()])
    }

    /// Whether this is an activation a loss can fuse with.
    pub(crate) fn fusable_activation(&self) -> Option<LossType> {
        match self.kind() {
            TensorKind::Layer(layer) => match layer.kind() {
                LayerKind::Sigmoid => Some(LossType::SigmoidCrossEntropy),
                LayerKind::SoftMax => Some(LossType::SoftMaxCrossEntropy),
                _ => None,
            },
            _ => None,
        }
    }
}

macro_rules! tensor_binop {
    ($trait:ident, $fn:ident, $method:ident) => {
        impl std::ops::$trait<&Tensor> for &Tensor {
            type Output = Result<Tensor>;

            fn $fn(self, rhs: &Tensor) -> Self::Output {
                Tensor::$method(self, rhs)
            }
        }

        impl std::ops::$trait<Tensor> for Tensor {
            type Output = Result<Tensor>;

            fn $fn(self, rhs: Tensor) -> Self::Output {
                Tensor::$method(&self, &rhs)
            }
        }

        impl std::ops::$trait<f32> for &Tensor {
            type Output = Result<Tensor>;

            fn $fn(self, rhs: f32) -> Self::Output {
                Tensor::$method(self, &Tensor::constant(rhs, self.shape().clone()))
            }
        }

        impl std::ops::$trait<f32> for Tensor {
            type Output = Result<Tensor>;

            fn $fn(self, rhs: f32) -> Self::Output {
                Tensor::$method(&self, &Tensor::constant(rhs, self.shape().clone()))
            }
        }

        impl std::ops::$trait<&Tensor> for f32 {
            type Output = Result<Tensor>;

            fn $fn(self, rhs: &Tensor) -> Self::Output {
                Tensor::$method(&Tensor::constant(self, rhs.shape().clone()), rhs)
            }
        }

        impl std::ops::$trait<Tensor> for f32 {
            type Output = Result<Tensor>;

            fn $fn(self, rhs: Tensor) -> Self::Output {
                Tensor::$method(&Tensor::constant(self, rhs.shape().clone()), &rhs)
            }
        }
    };
}

tensor_binop!(Add, add, add);
tensor_binop!(Sub, sub, subtract);
tensor_binop!(Mul, mul, multiply);
tensor_binop!(Div, div, divide);

impl std::ops::Neg for &Tensor {
    type Output = Result<Tensor>;

    fn neg(self) -> Self::Output {
        self.linear(-1.0, 0.0)
    }
}

impl std::ops::Neg for Tensor {
    type Output = Result<Tensor>;

    fn neg(self) -> Self::Output {
        self.linear(-1.0, 0.0)
    }
}
