use std::sync::Arc;

use lazynet_core::{
    Device, ExecutorConfig, HostTensor, InMemoryDataSet, LayerKind, LossType, Model, Optimizer,
    Tensor, TOTAL_LOSS_LABEL,
};

fn loss_type(t: &Tensor) -> Option<LossType> {
    match t.layer()?.kind() {
        LayerKind::Loss(p) => Some(p.loss_type),
        _ => None,
    }
}

fn rows(n: usize, outputs: impl Fn(f32) -> Vec<HostTensor>) -> InMemoryDataSet {
    InMemoryDataSet::new(
        (0..n)
            .map(|i| {
                let v = i as f32 / n as f32;
                (vec![HostTensor::filled([2], v)], outputs(v))
            })
            .collect(),
    )
}

#[test]
fn model_without_eligible_outputs_needs_a_loss() {
    let x = Tensor::input("x", [2]);
    let model = Model::builder(vec![x.dense(3).unwrap().argmax().unwrap()])
        .label("classifier")
        .build()
        .unwrap();
    let err = model.compile(&Device::cpu()).unwrap_err();
    assert!(err.is_configuration(), "{err}");
    assert_eq!(err.model_chain(), vec!["classifier"]);
}

#[test]
fn sigmoid_output_fuses_into_cross_entropy() {
    let x = Tensor::input("x", [2]);
    let logits = x.dense(1).unwrap();
    let model = Model::new(vec![logits.sigmoid().unwrap()]).unwrap();
    let compiled = model.compile(&Device::cpu()).unwrap();
    assert_eq!(compiled.losses().len(), 1);
    let loss = &compiled.losses()[0];
    assert_eq!(loss_type(loss), Some(LossType::SigmoidCrossEntropy));
    assert!(loss.inputs()[0].ptr_eq(&logits));
    assert!(compiled.total_loss().ptr_eq(loss));
}

#[test]
fn other_outputs_use_the_default_loss() {
    let x = Tensor::input("x", [2]);
    let model = Model::new(vec![x.dense(1).unwrap().tanh().unwrap()]).unwrap();
    let config = ExecutorConfig {
        default_loss: LossType::MeanAbsoluteError,
        ..Default::default()
    };
    let compiled = model
        .compile_with(Optimizer::default(), config, &Device::cpu())
        .unwrap();
    assert_eq!(loss_type(&compiled.losses()[0]), Some(LossType::MeanAbsoluteError));
}

#[test]
fn explicit_losses_are_kept() {
    let x = Tensor::input("x", [2]);
    let y = x.dense(2).unwrap();
    let target = Tensor::labels("target", [2]);
    let loss = y.loss(&target, LossType::MeanAbsoluteError).unwrap();
    let model = Model::new(vec![y, loss.clone()]).unwrap();
    let compiled = model.compile(&Device::cpu()).unwrap();
    assert_eq!(compiled.losses().len(), 1);
    assert!(compiled.losses()[0].ptr_eq(&loss));

    let data = rows(6, |v| vec![HostTensor::filled([2], v)]);
    let history = compiled.evaluate(&data, 3, &mut |_| {}).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.batches[0].losses.contains_key(&loss.label()));
}

#[test]
fn several_losses_are_summed() {
    let x = Tensor::input("x", [2]);
    let h = x.dense(4).unwrap().relu().unwrap();
    let regression = h.dense(1).unwrap().tanh().unwrap();
    let classes = h.dense(3).unwrap().softmax().unwrap();
    let model = Model::new(vec![regression, classes]).unwrap();
    let compiled = model.compile(&Device::cpu()).unwrap();
    assert_eq!(compiled.losses().len(), 2);
    assert_eq!(compiled.total_loss().label(), TOTAL_LOSS_LABEL);
    assert_eq!(loss_type(&compiled.losses()[1]), Some(LossType::SoftMaxCrossEntropy));

    let data = rows(4, |v| {
        vec![
            HostTensor::scalar(v),
            HostTensor::new([3], vec![1.0, 0.0, 0.0]).unwrap(),
        ]
    });
    let history = compiled.evaluate(&data, 2, &mut |_| {}).unwrap();
    let batch = &history.batches[0];
    assert_eq!(batch.losses.len(), 2);
    assert_eq!(batch.results.len(), 2);
    assert!(batch.intermediates.contains_key(TOTAL_LOSS_LABEL));
    let total = batch.intermediates[TOTAL_LOSS_LABEL].rows().unwrap();
    assert_eq!(total.len(), 2);
}

#[test]
fn compiled_models_are_cached_per_device() {
    let x = Tensor::input("x", [2]);
    let model = Model::new(vec![x.dense(1).unwrap()]).unwrap();
    let cpu = Device::cpu();
    let first = model.compile(&cpu).unwrap();
    let again = model.compile(&cpu).unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    let other = model.compile(&Device::cpu()).unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
}

#[test]
fn cache_hits_adopt_new_settings() {
    let x = Tensor::input("x", [2]);
    let model = Model::new(vec![x.dense(1).unwrap()]).unwrap();
    let cpu = Device::cpu();
    let compiled = model.compile(&cpu).unwrap();
    assert_eq!(compiled.optimizer(), Optimizer::default());

    let config = ExecutorConfig {
        max_in_flight: 4,
        ..Default::default()
    };
    let again = model
        .compile_with(Optimizer::sgd(0.1, 0.9), config, &cpu)
        .unwrap();
    assert!(Arc::ptr_eq(&compiled, &again));
    assert_eq!(compiled.optimizer(), Optimizer::sgd(0.1, 0.9));
    assert_eq!(compiled.config().max_in_flight, 4);

    let invalid = ExecutorConfig {
        max_in_flight: 0,
        ..Default::default()
    };
    let err = model
        .compile_with(Optimizer::default(), invalid, &cpu)
        .unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(compiled.config().max_in_flight, 4);
}

#[test]
fn inference_reuses_the_evaluation_executable() {
    let x = Tensor::input("x", [2]);
    let model = Model::new(vec![x.dense(1).unwrap().sigmoid().unwrap()]).unwrap();
    let compiled = model.compile(&Device::cpu()).unwrap();
    let evaluation = compiled.evaluation_graph().graph().executable();
    let inference = compiled.inference_graph().graph().executable();
    assert_eq!(
        Arc::as_ptr(evaluation) as *const (),
        Arc::as_ptr(inference) as *const ()
    );
    assert!(compiled.training_graph().graph().executable().is_training());
    assert!(!evaluation.is_training());
}

#[test]
fn inference_records_results_only() {
    let x = Tensor::input("x", [2]);
    let model = Model::new(vec![x.dense(1).unwrap().sigmoid().unwrap()]).unwrap();
    let data = InMemoryDataSet::from_inputs((0..5).map(|_| vec![HostTensor::filled([2], 0.5)]).collect());
    let history = model.predict(&data, 2, &Device::cpu()).unwrap();
    assert_eq!(history.len(), 3);
    for batch in &history.batches {
        assert!(batch.losses.is_empty());
        assert_eq!(batch.results.len(), 1);
        for row in batch.results[0].rows().unwrap() {
            let p = row.data()[0];
            assert!(p > 0.0 && p < 1.0);
        }
    }
}

#[test]
fn evaluation_drops_dropout() {
    let x = Tensor::input("x", [4]);
    let model = Model::new(vec![x.dropout(0.5).unwrap().relu().unwrap()]).unwrap();
    let data = InMemoryDataSet::from_inputs(vec![vec![
        HostTensor::new([4], vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
    ]]);
    let rows = model.predict_rows(&data, &Device::cpu()).unwrap();
    assert_eq!(rows[0][0].to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn dropout_can_be_kept_for_inference() {
    let x = Tensor::input("x", [64]);
    let model = Model::builder(vec![x.dropout(0.5).unwrap()])
        .keep_dropout_during_inference(true)
        .build()
        .unwrap();
    let data = InMemoryDataSet::from_inputs(vec![vec![HostTensor::filled([64], 1.0)]]);
    let rows = model.predict_rows(&data, &Device::cpu()).unwrap();
    // Kept units are scaled by 1 / (1 - p).
    assert!(rows[0][0].data().iter().all(|v| *v == 0.0 || *v == 2.0));
}

#[test]
fn training_graph_collects_every_weight_source() {
    let x = Tensor::input("x", [2]);
    let model = Model::new(vec![x.dense(3).unwrap().relu().unwrap().dense(1).unwrap()]).unwrap();
    let compiled = model.compile(&Device::cpu()).unwrap();
    let weights = compiled.training_graph().weights();
    assert_eq!(weights.len(), 2);
    assert!(weights.iter().all(|(_, trainable)| *trainable));
}
