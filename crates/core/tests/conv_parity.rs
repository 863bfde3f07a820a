// The direct and im2col convolution paths must agree, and results must not
// depend on how many workers share the work.

use std::sync::Arc;

use forkgrad_core::nn::{Conv2d, ConvAlgorithm, Layer, MaxPool2d};
use forkgrad_core::{CpuBackend, Float, PoolConfig, Tensor, ThreadPool};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn backend(workers: usize) -> CpuBackend {
    CpuBackend::new(Arc::new(ThreadPool::new(&PoolConfig::with_workers(workers))))
}

fn random(dims: &[usize], rng: &mut StdRng) -> Tensor {
    let n = dims.iter().product();
    Tensor::from_data((0..n).map(|_| rng.gen_range(-1.0..1.0)).collect(), dims).unwrap()
}

fn copy_of(t: &Tensor) -> Tensor {
    Tensor::from_data(t.data().to_vec(), t.dims()).unwrap()
}

fn assert_approx_vec(actual: &[Float], expected: &[Float], tol: Float) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < tol, "index {i}: {a} != {e} (tol={tol})");
    }
}

#[derive(Debug, Clone, Copy)]
struct Case {
    batch: usize,
    in_channels: usize,
    out_channels: usize,
    size: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
}

const CASES: &[Case] = &[
    Case { batch: 1, in_channels: 1, out_channels: 1, size: 4, kernel: 3, stride: 1, padding: 0 },
    Case { batch: 2, in_channels: 3, out_channels: 4, size: 7, kernel: 3, stride: 1, padding: 1 },
    Case { batch: 3, in_channels: 2, out_channels: 5, size: 8, kernel: 3, stride: 2, padding: 1 },
    Case { batch: 2, in_channels: 4, out_channels: 2, size: 9, kernel: 5, stride: 2, padding: 2 },
    Case { batch: 5, in_channels: 1, out_channels: 3, size: 6, kernel: 1, stride: 3, padding: 0 },
];

struct Outcome {
    output: Vec<Float>,
    input_grad: Vec<Float>,
    kernel_grad: Vec<Float>,
    bias_grad: Vec<Float>,
}

/// One forward and backward pass with a fixed seed, so runs differ only in
/// algorithm and worker count.
fn run(case: Case, algorithm: ConvAlgorithm, workers: usize) -> Outcome {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let mut conv = Conv2d::with_rng(
        backend(workers),
        case.in_channels,
        case.out_channels,
        case.kernel,
        case.stride,
        case.padding,
        &mut rng,
    )
    .unwrap()
    .with_algorithm(algorithm);
    let mut input = random(&[case.batch, case.in_channels, case.size, case.size], &mut rng);

    let output = conv.forward(&input).unwrap().data().to_vec();
    let upstream: Vec<Float> = (0..output.len()).map(|_| rng.gen_range(-1.0..1.0)).collect();
    conv.output_mut().grad_mut().copy_from_slice(&upstream);
    conv.backward(&mut input).unwrap();

    Outcome {
        output,
        input_grad: input.grad().to_vec(),
        kernel_grad: conv.kernel().grad().to_vec(),
        bias_grad: conv.bias().grad().to_vec(),
    }
}

#[test]
fn direct_and_im2col_agree() {
    for &case in CASES {
        let direct = run(case, ConvAlgorithm::Direct, 4);
        let gemm = run(case, ConvAlgorithm::Im2Col, 4);
        assert_approx_vec(&direct.output, &gemm.output, 1e-9);
        assert_approx_vec(&direct.input_grad, &gemm.input_grad, 1e-9);
        assert_approx_vec(&direct.kernel_grad, &gemm.kernel_grad, 1e-9);
        assert_approx_vec(&direct.bias_grad, &gemm.bias_grad, 1e-9);
    }
}

#[test]
fn worker_count_does_not_change_results() {
    for &case in CASES {
        for algorithm in [ConvAlgorithm::Direct, ConvAlgorithm::Im2Col] {
            let single = run(case, algorithm, 1);
            let many = run(case, algorithm, 7);
            assert_eq!(single.output, many.output, "{case:?} {algorithm:?}");
            assert_eq!(single.input_grad, many.input_grad, "{case:?} {algorithm:?}");
            assert_eq!(single.kernel_grad, many.kernel_grad, "{case:?} {algorithm:?}");
            assert_eq!(single.bias_grad, many.bias_grad, "{case:?} {algorithm:?}");
        }
    }
}

#[test]
fn conv_output_is_reused_across_calls() {
    let mut rng = StdRng::seed_from_u64(1);
    let mut conv = Conv2d::with_rng(backend(2), 1, 2, 3, 1, 1, &mut rng).unwrap();
    let a = random(&[2, 1, 5, 5], &mut rng);
    let b = copy_of(&a);

    let first_id = conv.forward(&a).unwrap().id();
    let first = conv.output().data().to_vec();
    let second_id = conv.forward(&b).unwrap().id();
    assert_eq!(first_id, second_id);
    assert_eq!(first, conv.output().data());
}

#[test]
fn maxpool_routes_each_gradient_to_its_window_maximum() {
    let mut pool = MaxPool2d::new(backend(3), 2).unwrap();
    #[rustfmt::skip]
    let mut input = Tensor::from_data(
        vec![
            1.0, 5.0, 2.0, 0.0,
            3.0, 4.0, 9.0, 9.0,
            0.0, 0.0, 7.0, 6.0,
            8.0, 0.0, 6.0, 7.0,
        ],
        &[1, 1, 4, 4],
    )
    .unwrap();

    assert_eq!(pool.forward(&input).unwrap().data(), &[5.0, 9.0, 8.0, 7.0]);
    pool.output_mut().grad_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
    pool.backward(&mut input).unwrap();

    #[rustfmt::skip]
    let expected = [
        0.0, 1.0, 0.0, 0.0,
        0.0, 0.0, 2.0, 0.0,
        0.0, 0.0, 4.0, 0.0,
        3.0, 0.0, 0.0, 0.0,
    ];
    assert_eq!(input.grad(), &expected);
}
