use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use lazynet_core::{
    CpuBackend, Device, ExecutorConfig, HostTensor, InMemoryDataSet, Model, Optimizer, Tensor,
};

fn dense_chain(width: usize) -> Model {
    let x = Tensor::input("x", [width]);
    let y = x
        .dense(width)
        .unwrap()
        .relu()
        .unwrap()
        .dense(width)
        .unwrap()
        .relu()
        .unwrap()
        .dense(1)
        .unwrap();
    Model::new(vec![y]).unwrap()
}

fn rows(width: usize, n: usize) -> InMemoryDataSet {
    InMemoryDataSet::new(
        (0..n)
            .map(|i| {
                let v = (i % 7) as f32 / 7.0;
                (
                    vec![HostTensor::filled([width], v)],
                    vec![HostTensor::scalar(v)],
                )
            })
            .collect(),
    )
}

fn bench_inference(c: &mut Criterion, width: usize) {
    let model = dense_chain(width);
    let device = Device::cpu();
    let compiled = model.compile(&device).unwrap();
    let data = rows(width, 256);
    c.bench_function(&format!("cpu_predict_dense_{width}"), |bencher| {
        bencher.iter(|| compiled.predict(&data, 32, &mut |_| {}).unwrap());
    });
}

fn bench_inference_64(c: &mut Criterion) {
    bench_inference(c, 64);
}

fn bench_inference_256(c: &mut Criterion) {
    bench_inference(c, 256);
}

fn bench_training_64(c: &mut Criterion) {
    let model = dense_chain(64);
    let compiled = model.compile(&Device::cpu()).unwrap();
    let data = rows(64, 256);
    c.bench_function("cpu_fit_dense_64", |bencher| {
        bencher.iter(|| compiled.fit(&data, 32, 1.0, &mut |_| {}).unwrap());
    });
}

/// Executor overhead under simulated device latency.
fn bench_in_flight(c: &mut Criterion) {
    for max_in_flight in [1, 4] {
        let device = Device::new(CpuBackend::with_latency(Duration::from_micros(200)));
        let config = ExecutorConfig {
            max_in_flight,
            ..Default::default()
        };
        let compiled = dense_chain(64)
            .compile_with(Optimizer::default(), config, &device)
            .unwrap();
        let data = rows(64, 128);
        c.bench_function(&format!("cpu_predict_in_flight_{max_in_flight}"), |bencher| {
            bencher.iter(|| compiled.predict(&data, 16, &mut |_| {}).unwrap());
        });
    }
}

criterion_group!(
    benches,
    bench_inference_64,
    bench_inference_256,
    bench_training_64,
    bench_in_flight
);
criterion_main!(benches);
