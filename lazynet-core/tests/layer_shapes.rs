use lazynet_core::{
    conv_output_length, conv_transpose_output_length, BatchNormParams, ConvPadding, ConvParams,
    DenseParams, Layer, LayerKind, LayerOptions, PoolParams, Shape, Tensor,
};

fn shape(dims: &[usize]) -> Shape {
    Shape::new(dims.to_vec())
}

#[test]
fn dense_replaces_last_dimension() {
    let x = Tensor::input("x", [5, 7]);
    assert_eq!(x.dense(3).unwrap().shape(), &shape(&[5, 3]));
}

#[test]
fn conv_same_and_valid() {
    let x = Tensor::input("img", [28, 28, 1]);
    assert_eq!(x.conv(8, 3, 1).unwrap().shape(), &shape(&[28, 28, 8]));
    assert_eq!(x.conv(8, 3, 2).unwrap().shape(), &shape(&[14, 14, 8]));
    let valid = x
        .conv_with(ConvParams::new(1, 4, 5, 1).with_padding(ConvPadding::Valid))
        .unwrap();
    assert_eq!(valid.shape(), &shape(&[24, 24, 4]));
}

#[test]
fn conv_transpose_grows() {
    let x = Tensor::input("z", [7, 7, 16]);
    assert_eq!(x.conv_transpose(8, 3, 2).unwrap().shape(), &shape(&[14, 14, 8]));
}

#[test]
fn length_arithmetic() {
    assert_eq!(conv_output_length(28, 3, 1, 1, ConvPadding::Same), 28);
    assert_eq!(conv_output_length(28, 3, 2, 1, ConvPadding::Same), 14);
    assert_eq!(conv_output_length(28, 5, 1, 1, ConvPadding::Valid), 24);
    assert_eq!(conv_output_length(7, 3, 2, 1, ConvPadding::Valid), 3);
    assert_eq!(conv_transpose_output_length(7, 3, 2, ConvPadding::Same), 14);
    assert_eq!(conv_transpose_output_length(7, 3, 2, ConvPadding::Valid), 15);
}

#[test]
fn pooling() {
    let x = Tensor::input("x", [8, 8, 3]);
    assert_eq!(x.max_pool(2, 2).unwrap().shape(), &shape(&[4, 4, 3]));
    assert_eq!(x.avg_pool(3, 1).unwrap().shape(), &shape(&[6, 6, 3]));
}

#[test]
fn upsample_needs_rank_three() {
    let x = Tensor::input("x", [4, 4, 2]);
    assert_eq!(x.upsample(2, 3).unwrap().shape(), &shape(&[12, 8, 2]));
    let flat = Tensor::input("flat", [4]);
    assert!(flat.upsample(2, 2).unwrap_err().is_shape());
}

#[test]
fn concat_sums_channels() {
    let a = Tensor::input("a", [4, 4, 2]);
    let b = Tensor::input("b", [4, 4, 3]);
    assert_eq!(a.concat(&[b]).unwrap().shape(), &shape(&[4, 4, 5]));
    let c = Tensor::input("c", [4, 5, 3]);
    assert!(a.concat(&[c]).unwrap_err().is_shape());
}

#[test]
fn reductions() {
    let x = Tensor::input("x", [6, 6, 4]);
    assert_eq!(x.mean().unwrap().shape(), &shape(&[6, 6, 1]));
    assert_eq!(x.argmax().unwrap().shape(), &shape(&[6, 6, 1]));
    assert_eq!(x.spatial_mean().unwrap().shape(), &shape(&[1, 1, 4]));
}

#[test]
fn loss_is_scalar() {
    let p = Tensor::input("p", [10]);
    let y = Tensor::labels("y", [10]);
    let loss = p.loss(&y, lazynet_core::LossType::SoftMaxCrossEntropy).unwrap();
    assert_eq!(loss.shape(), &Shape::scalar());
    let bad = Tensor::labels("bad", [9]);
    assert!(p.loss(&bad, lazynet_core::LossType::MeanSquaredError).unwrap_err().is_shape());
}

#[test]
fn invalid_hyperparameters_are_configuration_errors() {
    let bad = [
        LayerKind::Dense(DenseParams::new(0, 3)),
        LayerKind::Conv(ConvParams::new(3, 8, 0, 1)),
        LayerKind::MaxPool(PoolParams::new(0, 1)),
        LayerKind::Upsample {
            scale_x: 0,
            scale_y: 1,
        },
        LayerKind::Dropout {
            drop_probability: 1.0,
        },
        LayerKind::BatchNorm(BatchNormParams {
            channels: 4,
            epsilon: 0.0,
        }),
    ];
    for kind in bad {
        let err = Layer::new(kind.clone()).unwrap_err();
        assert!(err.is_configuration(), "{kind:?}: {err}");
    }
}

#[test]
fn wrong_input_count() {
    let layer = Layer::new(LayerKind::Add).unwrap();
    let x = Tensor::input("x", [2]);
    assert!(layer.call(&[x]).unwrap_err().is_configuration());
}

#[test]
fn dense_channel_mismatch() {
    let layer = Layer::new(LayerKind::Dense(DenseParams::new(4, 2))).unwrap();
    let x = Tensor::input("x", [3]);
    assert!(layer.call(&[x]).unwrap_err().is_shape());
}

#[test]
fn parameter_counts() {
    let dense = Layer::new(LayerKind::Dense(DenseParams::new(4, 3))).unwrap();
    assert_eq!(dense.parameter_count(), 15);
    let conv = Layer::new(LayerKind::Conv(ConvParams::new(2, 8, 3, 1))).unwrap();
    assert_eq!(conv.parameter_count(), 3 * 3 * 2 * 8 + 8);
    assert_eq!(Layer::new(LayerKind::Tanh).unwrap().parameter_count(), 0);
}

#[test]
fn layer_options() {
    let layer = Layer::with_options(
        LayerKind::Dense(DenseParams::new(2, 2)),
        LayerOptions {
            name: Some("encoder".into()),
            trainable: false,
            seed: Some(7),
        },
    )
    .unwrap();
    assert_eq!(layer.name(), "encoder");
    assert!(!layer.is_trainable());
    assert!(layer.has_weights());
}

#[test]
fn default_layer_labels() {
    let layer = Layer::new(LayerKind::Sigmoid).unwrap();
    assert!(layer.name().starts_with("Sigmoid"));
}
