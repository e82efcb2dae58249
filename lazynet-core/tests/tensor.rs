use lazynet_core::{Device, HostTensor, LayerKind, Model, Shape, Tensor, TensorKind, TensorMap};

#[test]
fn constants_fold() {
    let a = Tensor::constant(2.0, [1]);
    let b = Tensor::constant(5.0, [1]);
    let c = (&a + &b).unwrap();
    assert_eq!(c.constant_value(), Some(7.0));
    assert!(c.layer().is_none());
}

#[test]
fn scalars_fold_into_constants_of_any_shape() {
    let c = (Tensor::ones([3]) + 1.0).unwrap();
    assert_eq!(c.constant_value(), Some(2.0));
    assert_eq!(c.shape().dims(), &[3]);
    let d = (10.0 / Tensor::constant(4.0, [2, 2])).unwrap();
    assert_eq!(d.constant_value(), Some(2.5));
    assert_eq!(d.shape().dims(), &[2, 2]);
    let e = ((Tensor::ones([3]) * 3.0).unwrap() - 1.0).unwrap();
    assert_eq!(e.eval(&Device::cpu()).unwrap().to_vec(), vec![2.0; 3]);
}

#[test]
fn zeros_plus_ones_evaluates() {
    let sum = (Tensor::zeros([1]) + Tensor::ones([1])).unwrap();
    let value = sum.eval(&Device::cpu()).unwrap();
    assert_eq!(value.to_vec(), vec![1.0]);
}

#[test]
fn constant_and_input_fold_to_one_linear_layer() {
    let x = Tensor::input("x", [3]);
    let y = ((&x * 2.0).unwrap() + 1.0).unwrap();
    match y.layer().map(|l| l.kind()) {
        Some(LayerKind::Linear { scale, offset }) => {
            assert_eq!(*scale, 2.0);
            assert_eq!(*offset, 1.0);
        }
        other => panic!("expected a linear layer, got {other:?}"),
    }
    assert!(y.inputs()[0].ptr_eq(&x));
}

#[test]
fn identity_arithmetic_returns_self() {
    let x = Tensor::input("x", [2]);
    assert!((&x * 1.0).unwrap().ptr_eq(&x));
    assert!((&x + 0.0).unwrap().ptr_eq(&x));
}

#[test]
fn negation_and_scalar_on_the_left() {
    let x = Tensor::input("x", [2]);
    let y = (3.0 - &x).unwrap();
    match y.layer().map(|l| l.kind()) {
        Some(LayerKind::Linear { scale, offset }) => assert_eq!((*scale, *offset), (-1.0, 3.0)),
        other => panic!("expected a linear layer, got {other:?}"),
    }
    let z = (-&x).unwrap();
    assert!(matches!(
        z.layer().map(|l| l.kind()),
        Some(LayerKind::Linear { .. })
    ));
}

#[test]
fn building_does_not_compute() {
    let x = Tensor::input("x", [4]);
    let y = x.dense(8).unwrap().relu().unwrap().dense(2).unwrap();
    assert_eq!(y.shape(), &Shape::new(vec![2]));
    assert!(matches!(y.kind(), TensorKind::Layer(_)));
}

#[test]
fn array_length_must_match_shape() {
    let err = Tensor::array([2, 2], vec![1.0, 2.0, 3.0]).unwrap_err();
    assert!(err.is_shape(), "{err}");
    let ok = Tensor::array([3], vec![1.0, 2.0, 3.0]).unwrap();
    assert_eq!(ok.eval(&Device::cpu()).unwrap().to_vec(), vec![1.0, 2.0, 3.0]);
}

#[test]
fn eval_runs_layers_on_constants() {
    let a = Tensor::array([3], vec![-1.0, 0.5, 2.0]).unwrap();
    let r = a.relu().unwrap().eval(&Device::cpu()).unwrap();
    assert_eq!(r.to_vec(), vec![0.0, 0.5, 2.0]);
}

#[test]
fn eval_rejects_inputs() {
    let x = Tensor::input("x", [1]);
    let err = x.relu().unwrap().eval(&Device::cpu()).unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn shape_mismatch_names_layer_and_shapes() {
    let a = Tensor::input("a", [3]);
    let b = Tensor::input("b", [4]);
    let err = (&a + &b).unwrap_err();
    assert!(err.is_shape());
    let msg = err.to_string();
    assert!(msg.contains("Add"), "{msg}");
    assert!(msg.contains("(3)") && msg.contains("(4)"), "{msg}");
}

#[test]
fn map_inputs_preserves_untouched_subgraphs() {
    let x = Tensor::input("x", [2]);
    let w = Tensor::input("w", [2]);
    let unrelated = w.tanh().unwrap();
    let y = (&x.relu().unwrap() + &unrelated).unwrap();

    let replacement = Tensor::input("x2", [2]);
    let mut map = TensorMap::new();
    map.insert(&x, replacement.clone());
    let mapped = y.map_inputs(&mut map).unwrap();

    assert!(!mapped.ptr_eq(&y));
    assert!(mapped.inputs()[1].ptr_eq(&unrelated));
    assert!(mapped.inputs()[0].inputs()[0].ptr_eq(&replacement));
    // The relu layer itself is shared, only the tensor is new.
    assert_eq!(
        mapped.inputs()[0].layer().unwrap(),
        y.inputs()[0].layer().unwrap()
    );
}

#[test]
fn map_inputs_without_matches_is_identity() {
    let x = Tensor::input("x", [2]);
    let y = x.sigmoid().unwrap();
    let mut map = TensorMap::new();
    assert!(y.map_inputs(&mut map).unwrap().ptr_eq(&y));
}

#[test]
fn remove_layers_excises_dropout() {
    let x = Tensor::input("x", [4]);
    let y = x.dropout(0.5).unwrap().relu().unwrap();
    let kept = y
        .remove_layers(|l| matches!(l.kind(), LayerKind::Dropout { .. }))
        .unwrap();
    assert!(kept.inputs()[0].ptr_eq(&x));
}

#[test]
fn host_tensor_indexing() {
    let t = HostTensor::new([2, 3], (0..6).map(|v| v as f32).collect()).unwrap();
    assert_eq!(t.get(&[1, 2]).unwrap(), 5.0);
    assert!(t.get(&[2, 0]).is_err());
}

#[test]
fn labels_for_links_to_output() {
    let x = Tensor::input("x", [2]);
    let y = x.dense(3).unwrap();
    let labels = Tensor::labels_for(&y);
    assert_eq!(labels.shape(), y.shape());
    match labels.kind() {
        TensorKind::Labels { output } => assert_eq!(*output, Some(y.id())),
        other => panic!("expected labels, got {other:?}"),
    }
    let model = Model::new(vec![y.loss(&labels, lazynet_core::LossType::MeanSquaredError).unwrap()]).unwrap();
    assert_eq!(model.labels().len(), 1);
}
