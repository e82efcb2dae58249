use lazynet_core::{
    DenseParams, Device, ExecutorConfig, HasBuffers, HostTensor, HostWeights, InMemoryDataSet,
    Layer, LayerKind, LayerOptions, Model, Optimizer, Tensor, TrainingHistory,
};

fn line_data(n: usize) -> InMemoryDataSet {
    InMemoryDataSet::new(
        (0..n)
            .map(|i| {
                let x = i as f32 / n as f32;
                (vec![HostTensor::scalar(x)], vec![HostTensor::scalar(2.0 * x - 1.0)])
            })
            .collect(),
    )
}

fn mean(values: &[f32]) -> f32 {
    values.iter().sum::<f32>() / values.len() as f32
}

fn assert_converges(history: &TrainingHistory) {
    let curve = history.loss_curve();
    assert!(curve.iter().all(|l| l.is_finite()), "{curve:?}");
    let first = mean(&curve[..8]);
    let last = mean(&curve[curve.len() - 8..]);
    assert!(last < first * 0.5, "loss went from {first} to {last}");
}

fn host_values(layer: &Layer, name: &str) -> Vec<f32> {
    let sources = layer.weight_data_sources();
    let weights = sources[0]
        .as_any()
        .downcast_ref::<HostWeights>()
        .expect("cpu weights");
    weights.values(name).unwrap()
}

#[test]
fn adam_fits_a_line() {
    let x = Tensor::input("x", [1]);
    let model = Model::new(vec![x.dense(1).unwrap()]).unwrap();
    let compiled = model
        .compile_with(Optimizer::adam(0.05), ExecutorConfig::default(), &Device::cpu())
        .unwrap();
    let history = compiled.fit(&line_data(64), 8, 20.0, &mut |_| {}).unwrap();
    assert_eq!(history.len(), 160);
    assert!(history.failed_batches.is_empty());
    assert_converges(&history);
}

#[test]
fn sgd_with_momentum_fits_a_line() {
    let x = Tensor::input("x", [1]);
    let model = Model::new(vec![x.dense(1).unwrap()]).unwrap();
    let compiled = model
        .compile_with(Optimizer::sgd(0.1, 0.9), ExecutorConfig::default(), &Device::cpu())
        .unwrap();
    let history = compiled.fit(&line_data(64), 8, 20.0, &mut |_| {}).unwrap();
    assert_converges(&history);
}

#[test]
fn locked_layers_keep_their_weights() {
    let frozen = Layer::with_options(
        LayerKind::Dense(DenseParams::new(1, 4)),
        LayerOptions {
            trainable: false,
            ..Default::default()
        },
    )
    .unwrap();
    let x = Tensor::input("x", [1]);
    let head = Layer::new(LayerKind::Dense(DenseParams::new(4, 1))).unwrap();
    let hidden = frozen.call(&[x]).unwrap().tanh().unwrap();
    let model = Model::new(vec![head.call(&[hidden]).unwrap()]).unwrap();

    let device = Device::cpu();
    let compiled = model
        .compile_with(Optimizer::adam(0.05), ExecutorConfig::default(), &device)
        .unwrap();
    let trainable = compiled
        .training_graph()
        .weights()
        .iter()
        .map(|(_, t)| *t)
        .collect::<Vec<_>>();
    assert_eq!(trainable.len(), 2);
    assert_eq!(trainable.iter().filter(|t| **t).count(), 1);

    let frozen_before = host_values(&frozen, "weights");
    let head_before = host_values(&head, "weights");
    compiled.fit(&line_data(16), 4, 3.0, &mut |_| {}).unwrap();
    assert_eq!(host_values(&frozen, "weights"), frozen_before);
    assert_ne!(host_values(&head, "weights"), head_before);
}

#[test]
fn locked_submodels_keep_their_weights() {
    let z = Tensor::input("z", [1]);
    let encoder = Model::new(vec![z.dense(3).unwrap()]).unwrap();
    let inner = encoder.layers()[0].clone();
    let x = Tensor::input("x", [1]);
    let encoded = encoder.lock().unwrap().apply(&[x]).unwrap();
    let model = Model::new(vec![encoded.relu().unwrap().dense(1).unwrap()]).unwrap();

    let compiled = model
        .compile_with(Optimizer::adam(0.05), ExecutorConfig::default(), &Device::cpu())
        .unwrap();
    let before = host_values(&inner, "weights");
    compiled.fit(&line_data(16), 4, 2.0, &mut |_| {}).unwrap();
    assert_eq!(host_values(&inner, "weights"), before);
}

#[test]
fn shared_layers_share_weights_on_a_device() {
    let shared = Layer::new(LayerKind::Dense(DenseParams::new(1, 1))).unwrap();
    let a = Model::new(vec![shared.call(&[Tensor::input("a", [1])]).unwrap()]).unwrap();
    let b = Model::new(vec![shared
        .call(&[Tensor::input("b", [1])])
        .unwrap()
        .tanh()
        .unwrap()])
    .unwrap();
    let device = Device::cpu();
    a.compile(&device).unwrap();
    b.compile(&device).unwrap();
    assert_eq!(shared.weight_data_sources().len(), 1);

    let before = host_values(&shared, "weights");
    a.fit(&line_data(8), 4, 1.0, &device).unwrap();
    let after = host_values(&shared, "weights");
    assert_ne!(after, before);
    let via_b = b.compile(&device).unwrap().training_graph().weights()[0]
        .0
        .as_any()
        .downcast_ref::<HostWeights>()
        .expect("cpu weights")
        .values("weights")
        .unwrap();
    assert_eq!(via_b, after);
}

#[test]
fn convolutional_pipeline_trains() {
    let img = Tensor::input("img", [6, 6, 1]);
    let features = img.conv(4, 3, 1).unwrap().relu().unwrap().batch_norm().unwrap();
    let context = img.avg_pool(2, 2).unwrap().upsample(2, 2).unwrap();
    let joined = features.concat(&[context]).unwrap();
    let pooled = joined.max_pool(2, 2).unwrap().spatial_mean().unwrap();
    let probs = pooled.dense(2).unwrap().softmax().unwrap();
    assert_eq!(probs.shape().dims(), &[1, 1, 2]);
    let model = Model::new(vec![probs]).unwrap();

    let rows = (0..8)
        .map(|i| {
            let bright = i % 2 == 0;
            let pixels = (0..36)
                .map(|p| if bright { 0.5 + (p % 5) as f32 * 0.1 } else { -((p % 3) as f32) * 0.2 })
                .collect();
            let target = if bright { vec![1.0, 0.0] } else { vec![0.0, 1.0] };
            (
                vec![HostTensor::new([6, 6, 1], pixels).unwrap()],
                vec![HostTensor::new([1, 1, 2], target).unwrap()],
            )
        })
        .collect();
    let data = InMemoryDataSet::new(rows);
    let history = model.fit(&data, 4, 2.0, &Device::cpu()).unwrap();
    assert_eq!(history.len(), 4);
    assert!(history.loss_curve().iter().all(|l| l.is_finite()));

    let predictions = model.predict_rows(&data, &Device::cpu()).unwrap();
    assert_eq!(predictions.len(), 8);
    let sum: f32 = predictions[0][0].data().iter().sum();
    assert!((sum - 1.0).abs() < 1e-4);
}

#[test]
fn dropout_trains() {
    let x = Tensor::input("x", [1]);
    let y = x
        .dense(8)
        .unwrap()
        .relu()
        .unwrap()
        .dropout(0.25)
        .unwrap()
        .dense(1)
        .unwrap();
    let model = Model::new(vec![y]).unwrap();
    let history = model.fit(&line_data(16), 4, 2.0, &Device::cpu()).unwrap();
    assert_eq!(history.len(), 8);
    assert!(history.loss_curve().iter().all(|l| l.is_finite()));
}

#[test]
fn transposed_convolutions_cannot_run_on_the_cpu() {
    let z = Tensor::input("z", [3, 3, 2]);
    let model = Model::new(vec![z.conv_transpose(1, 3, 2).unwrap()]).unwrap();
    let err = model.compile(&Device::cpu()).unwrap_err();
    assert!(err.is_device(), "{err}");
}

#[test]
fn fractional_epochs_round_up_to_whole_batches() {
    let x = Tensor::input("x", [1]);
    let model = Model::new(vec![x.dense(1).unwrap()]).unwrap();
    let mut calls = 0;
    let history = model
        .fit_with_callback(&line_data(10), 4, 1.5, &Device::cpu(), &mut |_| calls += 1)
        .unwrap();
    assert_eq!(calls, 5);
    assert_eq!(history.len(), 5);
}

#[test]
fn configured_defaults_drive_training() {
    let x = Tensor::input("x", [1]);
    let model = Model::new(vec![x.dense(1).unwrap()]).unwrap();
    let config = ExecutorConfig {
        default_batch_size: 4,
        default_epochs: 2.0,
        ..Default::default()
    };
    let compiled = model
        .compile_with(Optimizer::default(), config, &Device::cpu())
        .unwrap();
    let mut sizes = Vec::new();
    let history = compiled
        .fit_with_defaults(&line_data(8), &mut |batch| {
            sizes.push(batch.results[0].rows().unwrap().len())
        })
        .unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(sizes, vec![4; 4]);
}

#[test]
fn epochs_must_be_positive() {
    let x = Tensor::input("x", [1]);
    let model = Model::new(vec![x.dense(1).unwrap()]).unwrap();
    let err = model.fit(&line_data(4), 2, 0.0, &Device::cpu()).unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn trained_buffers_restore_into_a_fresh_model() {
    let build = || {
        let x = Tensor::input("x", [1]);
        Model::new(vec![x.dense(4).unwrap().tanh().unwrap().dense(1).unwrap()]).unwrap()
    };
    let trained = build();
    let device = Device::cpu();
    trained
        .compile_with(Optimizer::adam(0.05), ExecutorConfig::default(), &device)
        .unwrap();
    trained.fit(&line_data(16), 4, 4.0, &device).unwrap();

    let mut saved = Vec::new();
    trained
        .write_buffers(&mut |_, data| {
            saved.push(data.to_vec());
            Ok(())
        })
        .unwrap();
    assert_eq!(saved.len(), 4);

    let restored = build();
    let mut next = saved.iter();
    restored
        .read_buffers(&mut |_, data| {
            let values = next.next().expect("one saved buffer per buffer");
            data.copy_from_slice(values);
            Ok(())
        })
        .unwrap();

    let data = line_data(5);
    let a = trained.predict_rows(&data, &device).unwrap();
    let b = restored.predict_rows(&data, &Device::cpu()).unwrap();
    for (ra, rb) in a.iter().zip(&b) {
        assert_eq!(ra[0].to_vec(), rb[0].to_vec());
    }
}
