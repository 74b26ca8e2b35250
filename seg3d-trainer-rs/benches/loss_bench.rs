use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use seg3d_trainer_rs::config::ModelConfig;
use seg3d_trainer_rs::{build_model, GradientFlow, Mode, WeightedLoss};

fn inputs(size: usize) -> (Tensor, Tensor) {
    let device = Device::Cpu;
    let shape = (2, 3, size, size, size);
    let predictions = Tensor::rand(0f32, 1f32, shape, &device).unwrap();
    let targets = Tensor::rand(0f32, 1f32, shape, &device)
        .unwrap()
        .ge(0.5)
        .unwrap()
        .to_dtype(candle_core::DType::F32)
        .unwrap();
    (predictions, targets)
}

fn bench_weighted_loss(c: &mut Criterion) {
    let mut group = c.benchmark_group("weighted_loss");
    for per_channel in [true, false] {
        let loss = WeightedLoss::new(vec![1.0, 5.0, 3.0], per_channel).unwrap();
        for size in [16, 24, 32] {
            let (predictions, targets) = inputs(size);
            let id = format!("{}/{size}", if per_channel { "per_channel" } else { "pooled" });
            group.bench_function(BenchmarkId::from_parameter(id), |b| {
                b.iter(|| black_box(loss.compute(&predictions, &targets, None).unwrap()));
            });
        }
    }
    group.finish();
}

fn bench_train_step(c: &mut Criterion) {
    let config = ModelConfig {
        out_channels: 3,
        head_channels: None,
        features: 16,
        dropout: 0.0,
        ..ModelConfig::default()
    };
    let model = build_model(&config, &Device::Cpu, 0).unwrap();
    let loss = WeightedLoss::new(vec![1.0, 5.0, 3.0], true).unwrap();
    let input = Tensor::rand(0f32, 1f32, (2, 1, 24, 24, 24), &Device::Cpu).unwrap();
    let (_, targets) = inputs(24);
    let flow = GradientFlow::with_frozen(["encoder.conv1.weight", "encoder.conv1.bias"]);

    c.bench_function("forward_backward_24", |b| {
        b.iter(|| {
            let out = model.forward(&input, Mode::Train, &flow).unwrap();
            let value = loss.compute(&out, &targets, None).unwrap();
            black_box(value.backward().unwrap())
        });
    });
}

criterion_group!(benches, bench_weighted_loss, bench_train_step);
criterion_main!(benches);
