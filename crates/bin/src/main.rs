use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

use forkgrad_core::{
    data::{batch_from_data, shuffled_indices, sliced_indices, MnistDataset},
    nn::{
        Adam, AdamConfig, ConvAlgorithm, Conv2d, KlDivStandardNormal, Layer, Linear, MaxPool2d,
        Model, MseLoss, ReLU, Reduction, Reparameterize, Reshape, Sigmoid,
    },
    train::{LogProgress, TrainConfig, Trainer},
    CpuBackend, Float, PoolConfig, Tensor, ThreadPool,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Worker threads; defaults to the available parallelism
    #[arg(long, global = true, env = "FORKGRAD_THREADS")]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a small MLP on a synthetic separable dataset
    Sanity {
        #[arg(long, default_value_t = 256)]
        samples: usize,
        #[arg(long, default_value_t = 200)]
        steps: usize,
        #[arg(long, default_value_t = 0.01)]
        lr: Float,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Compare direct and im2col convolutions, forward and backward
    Parity {
        #[arg(long, default_value_t = 4)]
        batch: usize,
        #[arg(long, default_value_t = 3)]
        channels: usize,
        #[arg(long, default_value_t = 11)]
        size: usize,
        #[arg(long, default_value_t = 3)]
        kernel: usize,
        #[arg(long, default_value_t = 2)]
        stride: usize,
        #[arg(long, default_value_t = 1)]
        padding: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Train the convolutional classifier on MNIST IDX files
    TrainMnist {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        #[arg(long, default_value_t = 5)]
        epochs: usize,
        #[arg(long, default_value_t = 64)]
        batch: usize,
        #[arg(long, default_value_t = 1e-3)]
        lr: Float,
        #[arg(long)]
        im2col: bool,
        #[arg(long, default_value = "mnist.model")]
        ckpt: PathBuf,
    },
    /// Evaluate a saved classifier checkpoint on the MNIST test split
    EvalMnist {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        #[arg(long)]
        ckpt: PathBuf,
        #[arg(long)]
        im2col: bool,
    },
    /// Train a small VAE on synthetic stripe images
    Vae {
        #[arg(long, default_value_t = 512)]
        samples: usize,
        #[arg(long, default_value_t = 20)]
        epochs: usize,
        #[arg(long, default_value_t = 32)]
        batch: usize,
        #[arg(long, default_value_t = 4)]
        latent: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let pool = Arc::new(ThreadPool::new(&PoolConfig {
        workers: args.threads,
    }));
    pool.start().context("failed to start worker threads")?;
    let backend = CpuBackend::new(Arc::clone(&pool));

    match args.command {
        Commands::Sanity {
            samples,
            steps,
            lr,
            seed,
        } => run_sanity(backend, samples, steps, lr, seed)?,
        Commands::Parity {
            batch,
            channels,
            size,
            kernel,
            stride,
            padding,
            seed,
        } => run_parity(backend, [batch, channels, size, size], kernel, stride, padding, seed)?,
        Commands::TrainMnist {
            data_dir,
            epochs,
            batch,
            lr,
            im2col,
            ckpt,
        } => train_mnist(backend, &data_dir, epochs, batch, lr, im2col, &ckpt)?,
        Commands::EvalMnist {
            data_dir,
            ckpt,
            im2col,
        } => eval_mnist(backend, &data_dir, &ckpt, im2col)?,
        Commands::Vae {
            samples,
            epochs,
            batch,
            latent,
            seed,
        } => run_vae(backend, samples, epochs, batch, latent, seed)?,
    }

    pool.stop();
    Ok(())
}

fn mlp(backend: &CpuBackend, sizes: &[usize], rng: &mut StdRng) -> Result<Model> {
    let mut model = Model::default();
    for (i, pair) in sizes.windows(2).enumerate() {
        model.push(Linear::with_rng(backend.clone(), pair[0], pair[1], rng)?);
        if i + 2 < sizes.len() {
            model.push(ReLU::new()?);
        }
    }
    Ok(model)
}

/// conv(1->8) relu pool conv(8->16) relu pool flatten linear(784->10)
fn mnist_cnn(backend: &CpuBackend, im2col: bool) -> Result<Model> {
    let algorithm = if im2col {
        ConvAlgorithm::Im2Col
    } else {
        ConvAlgorithm::Direct
    };
    let mut model = Model::default();
    model
        .push(Conv2d::new(backend.clone(), 1, 8, 3, 1, 1)?.with_algorithm(algorithm))
        .push(ReLU::new()?)
        .push(MaxPool2d::new(backend.clone(), 2)?)
        .push(Conv2d::new(backend.clone(), 8, 16, 3, 1, 1)?.with_algorithm(algorithm))
        .push(ReLU::new()?)
        .push(MaxPool2d::new(backend.clone(), 2)?)
        .push(Reshape::new(&[1, 16 * 7 * 7], Some(0))?)
        .push(Linear::new(backend.clone(), 16 * 7 * 7, 10)?);
    Ok(model)
}

fn run_sanity(backend: CpuBackend, samples: usize, steps: usize, lr: Float, seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut features = Vec::with_capacity(samples * 2);
    let mut labels = Vec::with_capacity(samples);
    for _ in 0..samples {
        let (x, y): (Float, Float) = (rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));
        features.extend([x, y]);
        labels.push(if x + 0.5 * y > 0.0 { 1.0 } else { 0.0 });
    }
    let mut inputs = Tensor::from_data(features, &[samples, 2])?;
    let labels = Tensor::from_data(labels, &[samples])?;

    let mut model = mlp(&backend, &[2, 16, 2], &mut rng)?;
    let config = TrainConfig {
        batch_size: samples.max(1),
        ..TrainConfig::default()
    };
    let adam = AdamConfig {
        learning_rate: lr,
        ..AdamConfig::default()
    };
    let mut trainer = Trainer::new(&model, config, adam)?;
    info!(layers = ?model.layer_names(), parameters = model.parameter_count(), "sanity model");

    let mut last = (Float::NAN, 0.0);
    for step in 0..steps {
        last = trainer.train_step(&mut model, &mut inputs, &labels)?;
        if step % 20 == 0 || step + 1 == steps {
            info!(step, loss = last.0, accuracy = last.1, "sanity");
        }
    }
    if !last.0.is_finite() {
        bail!("loss diverged");
    }
    info!(loss = last.0, accuracy = last.1, "sanity check complete");
    Ok(())
}

fn copy_of(t: &Tensor) -> Result<Tensor> {
    Ok(Tensor::from_data(t.data().to_vec(), t.dims())?)
}

fn max_abs_diff(a: &[Float], b: &[Float]) -> Float {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, Float::max)
}

fn run_parity(
    backend: CpuBackend,
    dims: [usize; 4],
    kernel: usize,
    stride: usize,
    padding: usize,
    seed: u64,
) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let [_, channels, _, _] = dims;
    let direct_conv = Conv2d::with_rng(backend.clone(), channels, 5, kernel, stride, padding, &mut rng)?;
    let mut gemm = Conv2d::from_parameters(
        backend,
        copy_of(direct_conv.kernel())?,
        copy_of(direct_conv.bias())?,
        stride,
        padding,
    )?
    .with_algorithm(ConvAlgorithm::Im2Col);
    let mut direct = direct_conv;

    let values: Vec<Float> = (0..dims.iter().product::<usize>())
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect();
    let mut input_a = Tensor::from_data(values.clone(), &dims)?;
    let mut input_b = Tensor::from_data(values, &dims)?;

    let out_a = direct.forward(&input_a)?.data().to_vec();
    let out_b = gemm.forward(&input_b)?.data().to_vec();
    let forward_diff = max_abs_diff(&out_a, &out_b);

    let seed_grad: Vec<Float> = (0..out_a.len()).map(|_| rng.gen_range(-1.0..1.0)).collect();
    direct.output_mut().grad_mut().copy_from_slice(&seed_grad);
    gemm.output_mut().grad_mut().copy_from_slice(&seed_grad);
    direct.backward(&mut input_a)?;
    gemm.backward(&mut input_b)?;

    let input_diff = max_abs_diff(input_a.grad(), input_b.grad());
    let kernel_diff = max_abs_diff(direct.kernel().grad(), gemm.kernel().grad());
    let bias_diff = max_abs_diff(direct.bias().grad(), gemm.bias().grad());
    info!(?dims, kernel, stride, padding, forward_diff, input_diff, kernel_diff, bias_diff, "conv parity");

    let worst = forward_diff.max(input_diff).max(kernel_diff).max(bias_diff);
    if worst > 1e-9 {
        bail!("direct and im2col convolutions differ by {worst:e}");
    }
    info!("parity: PASS");
    Ok(())
}

fn train_mnist(
    backend: CpuBackend,
    data_dir: &std::path::Path,
    epochs: usize,
    batch: usize,
    lr: Float,
    im2col: bool,
    ckpt: &std::path::Path,
) -> Result<()> {
    let train = MnistDataset::load_train(data_dir)
        .with_context(|| format!("loading training split from {}", data_dir.display()))?;
    let test = MnistDataset::load_test(data_dir)
        .with_context(|| format!("loading test split from {}", data_dir.display()))?;

    let mut model = mnist_cnn(&backend, im2col)?;
    let config = TrainConfig {
        epochs,
        batch_size: batch,
        ..TrainConfig::default()
    };
    let adam = AdamConfig {
        learning_rate: lr,
        ..AdamConfig::default()
    };
    let mut trainer = Trainer::new(&model, config, adam)?;
    info!(layers = ?model.layer_names(), parameters = model.parameter_count(), "training classifier");

    let history = trainer.fit(
        &mut model,
        (&train.images, &train.labels),
        (&test.images, &test.labels),
        &mut rand::thread_rng(),
        &mut LogProgress { every: 100 },
    )?;
    model
        .save(ckpt)
        .with_context(|| format!("saving checkpoint to {}", ckpt.display()))?;
    if let Some(last) = history.last() {
        info!(loss = last.loss, accuracy = last.accuracy, "training finished");
    }
    Ok(())
}

fn eval_mnist(backend: CpuBackend, data_dir: &std::path::Path, ckpt: &std::path::Path, im2col: bool) -> Result<()> {
    let test = MnistDataset::load_test(data_dir)
        .with_context(|| format!("loading test split from {}", data_dir.display()))?;
    let mut model = mnist_cnn(&backend, im2col)?;
    model
        .load(ckpt)
        .with_context(|| format!("loading checkpoint {}", ckpt.display()))?;
    let mut trainer = Trainer::new(&model, TrainConfig::default(), AdamConfig::default())?;
    let metrics = trainer.evaluate(&mut model, &test.images, &test.labels)?;
    info!(loss = metrics.loss, accuracy = metrics.accuracy, "evaluation");
    Ok(())
}

/// 8x8 images with one bright horizontal or vertical stripe.
fn stripe_images(samples: usize, rng: &mut StdRng) -> Result<Tensor> {
    let mut data = vec![0.0; samples * 64];
    for image in data.chunks_mut(64) {
        let at = rng.gen_range(0..8);
        let vertical = rng.gen_bool(0.5);
        for i in 0..8 {
            let cell = if vertical { i * 8 + at } else { at * 8 + i };
            image[cell] = 1.0;
        }
    }
    Ok(Tensor::from_data(data, &[samples, 1, 8, 8])?)
}

fn run_vae(
    backend: CpuBackend,
    samples: usize,
    epochs: usize,
    batch_size: usize,
    latent: usize,
    seed: u64,
) -> Result<()> {
    if batch_size == 0 {
        bail!("batch size must be positive");
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let images = stripe_images(samples, &mut rng)?;

    let mut encoder = Model::default();
    encoder
        .push(Reshape::new(&[1, 64], Some(0))?)
        .push(Linear::with_rng(backend.clone(), 64, 32, &mut rng)?)
        .push(ReLU::new()?)
        .push(Linear::with_rng(backend.clone(), 32, 2 * latent, &mut rng)?);
    let mut decoder = Model::default();
    decoder
        .push(Linear::with_rng(backend.clone(), latent, 32, &mut rng)?)
        .push(ReLU::new()?)
        .push(Linear::with_rng(backend.clone(), 32, 64, &mut rng)?)
        .push(Sigmoid::new()?)
        .push(Reshape::new(&[1, 1, 8, 8], Some(0))?);

    let mut reparam = Reparameterize::with_seed(seed)?;
    let mut mse = MseLoss::new(Reduction::Sum);
    let mut kl = KlDivStandardNormal::new();
    let mut parameters = encoder.parameter_tensors();
    parameters.extend(decoder.parameter_tensors());
    let mut adam = Adam::new(&parameters, AdamConfig::default());

    for epoch in 0..epochs {
        let beta = (epoch as Float / 20.0).min(1.0);
        let indices = shuffled_indices(samples, &mut rng);
        let (mut mse_total, mut kl_total) = (0.0, 0.0);
        let batches = samples / batch_size;
        for b in 0..batches {
            let mut inputs = batch_from_data(&images, sliced_indices(&indices, b * batch_size, batch_size))?;

            let distribution = encoder.forward(&inputs)?;
            let encoding = reparam.forward(distribution)?;
            let outputs = decoder.forward(encoding)?;
            let mse_part = mse.forward(outputs, &inputs)?;
            let kl_part = kl.forward(encoder.output()?, beta)?;

            encoder.zero_grad();
            reparam.zero_grad();
            decoder.zero_grad();
            mse.backward(decoder.output_mut()?)?;
            kl.backward(encoder.output_mut()?)?;
            decoder.backward(reparam.output_mut())?;
            reparam.backward(encoder.output_mut()?)?;
            encoder.backward(&mut inputs)?;

            let mut params = encoder.parameter_tensors_mut();
            params.extend(decoder.parameter_tensors_mut());
            adam.step(params)?;

            mse_total += mse_part;
            kl_total += kl_part;
        }
        let n = batches.max(1) as Float;
        info!(epoch, beta, mse = mse_total / n, kldiv = kl_total / n, "vae epoch");
    }
    Ok(())
}
