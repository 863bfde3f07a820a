// Finite-difference checks of the hand-written backward passes.

use std::sync::Arc;

use forkgrad_core::nn::{Conv2d, ConvAlgorithm, Layer, Linear, Sigmoid};
use forkgrad_core::{CpuBackend, Float, PoolConfig, Tensor, ThreadPool};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const STEP: Float = 1e-6;
const TOLERANCE: Float = 1e-4;

fn backend() -> CpuBackend {
    CpuBackend::new(Arc::new(ThreadPool::new(&PoolConfig::with_workers(4))))
}

fn random(dims: &[usize], rng: &mut StdRng) -> Tensor {
    let n = dims.iter().product();
    Tensor::from_data((0..n).map(|_| rng.gen_range(-1.0..1.0)).collect(), dims).unwrap()
}

fn assert_approx_vec(actual: &[Float], expected: &[Float], tol: Float) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < tol, "index {i}: {a} != {e} (tol={tol})");
    }
}

/// `Σ output * weights`, so that d(sum)/d(output) = weights.
fn weighted_sum<L: Layer>(layer: &mut L, input: &Tensor, weights: &[Float]) -> Float {
    let out = layer.forward(input).unwrap();
    out.data().iter().zip(weights).map(|(o, w)| o * w).sum()
}

fn numeric_input_grad<L: Layer>(layer: &mut L, input: &mut Tensor, weights: &[Float]) -> Vec<Float> {
    (0..input.len())
        .map(|i| {
            let orig = input.data()[i];
            input.data_mut()[i] = orig + STEP;
            let up = weighted_sum(layer, input, weights);
            input.data_mut()[i] = orig - STEP;
            let down = weighted_sum(layer, input, weights);
            input.data_mut()[i] = orig;
            (up - down) / (2.0 * STEP)
        })
        .collect()
}

fn numeric_param_grad<L: Layer>(layer: &mut L, param: usize, input: &Tensor, weights: &[Float]) -> Vec<Float> {
    let len = layer.parameter_tensors()[param].len();
    (0..len)
        .map(|i| {
            let orig = layer.parameter_tensors()[param].data()[i];
            layer.parameter_tensors_mut()[param].data_mut()[i] = orig + STEP;
            let up = weighted_sum(layer, input, weights);
            layer.parameter_tensors_mut()[param].data_mut()[i] = orig - STEP;
            let down = weighted_sum(layer, input, weights);
            layer.parameter_tensors_mut()[param].data_mut()[i] = orig;
            (up - down) / (2.0 * STEP)
        })
        .collect()
}

/// Runs the analytic backward with `weights` as the output gradient, then
/// compares every input and parameter gradient against central differences.
fn check_layer<L: Layer>(layer: &mut L, mut input: Tensor, rng: &mut StdRng) {
    let out_len = layer.forward(&input).unwrap().len();
    let weights: Vec<Float> = (0..out_len).map(|_| rng.gen_range(-1.0..1.0)).collect();

    layer.zero_grad();
    input.zero_grad();
    layer.forward(&input).unwrap();
    layer.output_mut().grad_mut().copy_from_slice(&weights);
    layer.backward(&mut input).unwrap();
    let input_grad = input.grad().to_vec();
    let param_grads: Vec<Vec<Float>> = layer
        .parameter_tensors()
        .iter()
        .map(|p| p.grad().to_vec())
        .collect();

    let numeric = numeric_input_grad(layer, &mut input, &weights);
    assert_approx_vec(&input_grad, &numeric, TOLERANCE);
    for (p, analytic) in param_grads.iter().enumerate() {
        let numeric = numeric_param_grad(layer, p, &input, &weights);
        assert_approx_vec(analytic, &numeric, TOLERANCE);
    }
}

#[test]
fn linear_matches_finite_differences() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut layer = Linear::with_rng(backend(), 5, 3, &mut rng).unwrap();
    let input = random(&[4, 5], &mut rng);
    check_layer(&mut layer, input, &mut rng);
}

#[test]
fn linear_worked_example() {
    let weight = Tensor::from_data(
        vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0],
        &[2, 4],
    )
    .unwrap();
    let bias = Tensor::zeros(&[2]).unwrap();
    let mut layer = Linear::from_parameters(backend(), weight, bias).unwrap();
    let mut input = Tensor::from_data(vec![1.0, 2.0, 3.0, 4.0], &[1, 4]).unwrap();

    assert_eq!(layer.forward(&input).unwrap().data(), &[1.0, 2.0]);
    layer.output_mut().grad_mut().copy_from_slice(&[1.0, 1.0]);
    layer.backward(&mut input).unwrap();

    assert_eq!(layer.weight().grad(), &[1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0]);
    assert_eq!(layer.bias().grad(), &[1.0, 1.0]);
    assert_eq!(input.grad(), &[1.0, 1.0, 0.0, 0.0]);
}

#[test]
fn gradients_accumulate_until_zeroed() {
    let mut rng = StdRng::seed_from_u64(5);
    let mut layer = Linear::with_rng(backend(), 3, 2, &mut rng).unwrap();
    let mut input = random(&[2, 3], &mut rng);

    for _ in 0..2 {
        layer.forward(&input).unwrap();
        layer.output_mut().grad_mut().fill(1.0);
        layer.backward(&mut input).unwrap();
    }
    assert_eq!(layer.bias().grad(), &[4.0, 4.0]);
    layer.zero_grad();
    assert_eq!(layer.bias().grad(), &[0.0, 0.0]);
}

#[test]
fn conv_matches_finite_differences_on_both_paths() {
    for algorithm in [ConvAlgorithm::Direct, ConvAlgorithm::Im2Col] {
        let mut rng = StdRng::seed_from_u64(9);
        let mut layer = Conv2d::with_rng(backend(), 2, 3, 3, 2, 1, &mut rng)
            .unwrap()
            .with_algorithm(algorithm);
        let input = random(&[2, 2, 5, 5], &mut rng);
        check_layer(&mut layer, input, &mut rng);
    }
}

#[test]
fn sigmoid_matches_finite_differences() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut layer = Sigmoid::new().unwrap();
    let input = random(&[3, 4], &mut rng);
    check_layer(&mut layer, input, &mut rng);
}
