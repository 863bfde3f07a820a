// End-to-end behaviour of models, losses, the optimizer and checkpoints.

use std::sync::Arc;

use forkgrad_core::nn::{
    Adam, AdamConfig, Conv2d, KlDivStandardNormal, Layer, Linear, MaxPool2d, Model, MseLoss,
    ReLU, Reduction, Reparameterize, Reshape, Sigmoid, Upsample,
};
use forkgrad_core::train::{TrainConfig, Trainer};
use forkgrad_core::{CpuBackend, Float, PoolConfig, Tensor, TensorError, ThreadPool};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn backend() -> CpuBackend {
    CpuBackend::new(Arc::new(ThreadPool::new(&PoolConfig::with_workers(4))))
}

fn mlp(backend: &CpuBackend, sizes: &[usize], rng: &mut StdRng) -> Model {
    let mut model = Model::default();
    for (i, pair) in sizes.windows(2).enumerate() {
        if i > 0 {
            model.push(ReLU::new().unwrap());
        }
        model.push(Linear::with_rng(backend.clone(), pair[0], pair[1], rng).unwrap());
    }
    model
}

/// Two well separated blobs in the plane, labelled 0 and 1.
fn blobs(n: usize, rng: &mut StdRng) -> (Tensor, Tensor) {
    let mut points = Vec::with_capacity(2 * n);
    let mut labels = Vec::with_capacity(n);
    for i in 0..n {
        let class = i % 2;
        let centre = if class == 0 { -2.0 } else { 2.0 };
        points.push(centre + rng.gen_range(-1.0..1.0));
        points.push(centre + rng.gen_range(-1.0..1.0));
        labels.push(class as Float);
    }
    (
        Tensor::from_data(points, &[n, 2]).unwrap(),
        Tensor::from_data(labels, &[n]).unwrap(),
    )
}

fn parameter_grads(model: &Model) -> Vec<Vec<Float>> {
    model
        .parameter_tensors()
        .iter()
        .map(|p| p.grad().to_vec())
        .collect()
}

#[test]
fn identical_steps_produce_identical_gradients() {
    let mut rng = StdRng::seed_from_u64(17);
    let mut model = mlp(&backend(), &[3, 4, 1], &mut rng);
    let mut input = Tensor::from_data((0..12).map(|_| rng.gen_range(-1.0..1.0)).collect(), &[4, 3]).unwrap();
    let target = Tensor::from_data(vec![0.5, -1.0, 2.0, 0.0], &[4, 1]).unwrap();
    let mut loss = MseLoss::new(Reduction::Mean);

    let mut steps = Vec::new();
    for _ in 0..3 {
        let out = model.forward(&input).unwrap();
        loss.forward(out, &target).unwrap();
        model.zero_grad();
        input.zero_grad();
        loss.backward(model.output_mut().unwrap()).unwrap();
        model.backward(&mut input).unwrap();
        steps.push((parameter_grads(&model), input.grad().to_vec()));
    }
    assert!(steps[0].0[0].iter().any(|&g| g != 0.0));
    assert_eq!(steps[0], steps[1]);
    assert_eq!(steps[0], steps[2]);
}

#[test]
fn trainer_steps_without_updates_repeat_their_gradients() {
    let mut rng = StdRng::seed_from_u64(23);
    let backend = backend();
    let mut model = Model::default();
    model
        .push(Conv2d::with_rng(backend.clone(), 1, 2, 3, 1, 1, &mut rng).unwrap())
        .push(ReLU::new().unwrap())
        .push(MaxPool2d::new(backend.clone(), 2).unwrap())
        .push(Upsample::new(backend.clone(), 2).unwrap())
        .push(Sigmoid::new().unwrap())
        .push(Reshape::new(&[1, 32], Some(0)).unwrap())
        .push(Linear::with_rng(backend.clone(), 32, 3, &mut rng).unwrap());
    let mut inputs = Tensor::from_data((0..32).map(|_| rng.gen_range(-1.0..1.0)).collect(), &[2, 1, 4, 4]).unwrap();
    let labels = Tensor::from_data(vec![0.0, 2.0], &[2]).unwrap();

    // A zero learning rate keeps the parameters fixed between steps.
    let adam = AdamConfig {
        learning_rate: 0.0,
        ..AdamConfig::default()
    };
    let mut trainer = Trainer::new(&model, TrainConfig::default(), adam).unwrap();
    let mut steps = Vec::new();
    for _ in 0..3 {
        trainer.train_step(&mut model, &mut inputs, &labels).unwrap();
        steps.push(parameter_grads(&model));
    }
    assert_eq!(steps[0], steps[1]);
    assert_eq!(steps[0], steps[2]);
}

#[test]
fn mlp_separates_two_blobs() {
    let mut rng = StdRng::seed_from_u64(7);
    let backend = backend();
    let mut model = mlp(&backend, &[2, 8, 2], &mut rng);
    let (train_x, train_y) = blobs(256, &mut rng);
    let (test_x, test_y) = blobs(64, &mut rng);

    let config = TrainConfig {
        epochs: 20,
        batch_size: 16,
        eval_batch_size: 32,
        ..TrainConfig::default()
    };
    let adam = AdamConfig {
        learning_rate: 1e-2,
        ..AdamConfig::default()
    };
    let mut trainer = Trainer::new(&model, config, adam).unwrap();
    let history = trainer
        .fit(&mut model, (&train_x, &train_y), (&test_x, &test_y), &mut rng, &mut ())
        .unwrap();

    let last = history.last().unwrap();
    assert!(last.accuracy > 0.95, "accuracy {}", last.accuracy);
    assert!(last.loss < history[0].loss);
    assert!(trainer.optimizer().steps() > 0);
}

#[test]
fn adam_drives_mse_down() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut layer = Linear::with_rng(backend(), 3, 1, &mut rng).unwrap();
    let mut input = Tensor::from_data((0..24).map(|_| rng.gen_range(-1.0..1.0)).collect(), &[8, 3]).unwrap();
    let target_values: Vec<Float> = input
        .data()
        .chunks(3)
        .map(|r| 0.5 * r[0] - r[1] + 2.0 * r[2] + 0.25)
        .collect();
    let target = Tensor::from_data(target_values, &[8, 1]).unwrap();

    let mut loss = MseLoss::new(Reduction::Mean);
    let mut adam = Adam::new(
        &layer.parameter_tensors(),
        AdamConfig {
            learning_rate: 5e-2,
            ..AdamConfig::default()
        },
    );
    let mut losses = Vec::new();
    for _ in 0..200 {
        let out = layer.forward(&input).unwrap();
        losses.push(loss.forward(out, &target).unwrap());
        layer.zero_grad();
        loss.backward(layer.output_mut()).unwrap();
        layer.backward(&mut input).unwrap();
        adam.step(layer.parameter_tensors_mut()).unwrap();
    }
    assert!(losses[199] < 1e-2, "final loss {}", losses[199]);
    assert!(losses[199] < losses[0]);
}

#[test]
fn vae_step_trains_encoder_and_decoder() {
    let mut rng = StdRng::seed_from_u64(21);
    let backend = backend();
    let mut encoder = mlp(&backend, &[4, 8, 4], &mut rng);
    let mut decoder = mlp(&backend, &[2, 8, 4], &mut rng);
    let mut reparam = Reparameterize::with_seed(21).unwrap();
    let mut mse = MseLoss::new(Reduction::Sum);
    let mut kl = KlDivStandardNormal::new();

    // Points on a 2-d subspace of R^4.
    let data: Vec<Float> = (0..32)
        .flat_map(|_| {
            let (a, b): (Float, Float) = (rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));
            [a, b, a + b, a - b]
        })
        .collect();
    let mut inputs = Tensor::from_data(data, &[32, 4]).unwrap();

    let mut parameters = encoder.parameter_tensors();
    parameters.extend(decoder.parameter_tensors());
    let mut adam = Adam::new(
        &parameters,
        AdamConfig {
            learning_rate: 1e-2,
            ..AdamConfig::default()
        },
    );

    let mut losses = Vec::new();
    for _ in 0..300 {
        let distribution = encoder.forward(&inputs).unwrap();
        let encoding = reparam.forward(distribution).unwrap();
        let outputs = decoder.forward(encoding).unwrap();
        let reconstruction = mse.forward(outputs, &inputs).unwrap();
        let divergence = kl.forward(encoder.output().unwrap(), 0.1).unwrap();
        assert!(divergence >= 0.0);
        losses.push(reconstruction + divergence);

        encoder.zero_grad();
        reparam.zero_grad();
        decoder.zero_grad();
        mse.backward(decoder.output_mut().unwrap()).unwrap();
        kl.backward(encoder.output_mut().unwrap()).unwrap();
        decoder.backward(reparam.output_mut()).unwrap();
        reparam.backward(encoder.output_mut().unwrap()).unwrap();
        encoder.backward(&mut inputs).unwrap();

        let mut params = encoder.parameter_tensors_mut();
        params.extend(decoder.parameter_tensors_mut());
        adam.step(params).unwrap();
    }

    let mean = |xs: &[Float]| xs.iter().sum::<Float>() / xs.len() as Float;
    assert!(losses.iter().all(|l| l.is_finite()));
    assert!(mean(&losses[280..]) < 0.75 * mean(&losses[..20]));
}

#[test]
fn checkpoint_round_trips_through_a_file() {
    let backend = backend();
    let mut rng = StdRng::seed_from_u64(11);
    let mut saved = mlp(&backend, &[3, 5, 2], &mut rng);
    let mut input = Tensor::from_data(vec![0.1, -0.2, 0.3], &[1, 3]).unwrap();
    saved.forward(&input).unwrap();
    saved.output_mut().unwrap().grad_mut().fill(1.0);
    saved.backward(&mut input).unwrap();

    let path = std::env::temp_dir().join(format!("forkgrad-checkpoint-{}.bin", std::process::id()));
    saved.save(&path).unwrap();

    let mut loaded = mlp(&backend, &[3, 5, 2], &mut rng);
    loaded.load(&path).unwrap();
    for (a, b) in saved.parameter_tensors().iter().zip(loaded.parameter_tensors()) {
        assert_eq!(a.data(), b.data());
        assert_eq!(a.grad(), b.grad());
    }
    assert_eq!(
        saved.forward(&input).unwrap().data(),
        loaded.forward(&input).unwrap().data()
    );

    let mut smaller = mlp(&backend, &[3, 4, 2], &mut rng);
    let before: Vec<Float> = smaller.parameter_tensors()[0].data().to_vec();
    assert!(matches!(smaller.load(&path), Err(TensorError::CheckpointSize { .. })));
    assert_eq!(smaller.parameter_tensors()[0].data(), &before[..]);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn model_backward_requires_forward() {
    let mut rng = StdRng::seed_from_u64(2);
    let mut model = mlp(&backend(), &[2, 3, 1], &mut rng);
    let mut input = Tensor::zeros(&[1, 2]).unwrap();
    assert!(matches!(
        model.backward(&mut input),
        Err(TensorError::BackwardWithoutForward { .. })
    ));

    model.forward(&input).unwrap();
    let mut other = Tensor::zeros(&[1, 2]).unwrap();
    assert!(matches!(
        model.backward(&mut other),
        Err(TensorError::InputMismatch { .. })
    ));
}
