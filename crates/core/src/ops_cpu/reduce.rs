use crate::error::Result;
use crate::tensor::{Float, Tensor};

/// `(outer, size, inner)` for iterating one dimension of a row-major buffer.
fn split_around(tensor: &Tensor, dim: usize) -> (usize, usize, usize) {
    let dims = tensor.dims();
    let outer = dims[..dim].iter().product();
    (outer, dims[dim], tensor.strides()[dim])
}

impl Tensor {
    /// Folds along `dim`, collapsing it to size 1. `step` sees the running
    /// accumulator, the position along `dim` and the value.
    fn fold_dim<A: Copy>(
        &self,
        dim: isize,
        init: A,
        step: impl Fn(A, usize, Float) -> A,
        finish: impl Fn(A) -> Float,
    ) -> Result<Tensor> {
        let dim = self.normalize_dim(dim)?;
        let (outer, size, inner) = split_around(self, dim);
        let mut reduced = Vec::with_capacity(outer * inner);
        for o in 0..outer {
            for i in 0..inner {
                let mut acc = init;
                for k in 0..size {
                    acc = step(acc, k, self.data()[(o * size + k) * inner + i]);
                }
                reduced.push(finish(acc));
            }
        }
        let mut dims = self.dims().to_vec();
        dims[dim] = 1;
        Tensor::from_data(reduced, &dims)
    }

    pub fn sum(&self, dim: isize) -> Result<Tensor> {
        self.fold_dim(dim, 0.0, |acc, _, v| acc + v, |acc| acc)
    }

    pub fn max(&self, dim: isize) -> Result<Tensor> {
        self.fold_dim(
            dim,
            Float::NEG_INFINITY,
            |acc, _, v| if v > acc { v } else { acc },
            |acc| acc,
        )
    }

    /// Position of the maximum along `dim`, stored as a float. The first
    /// strictly greater value in scan order wins.
    pub fn argmax(&self, dim: isize) -> Result<Tensor> {
        self.fold_dim(
            dim,
            (Float::NEG_INFINITY, 0usize),
            |(best, at), k, v| if v > best { (v, k) } else { (best, at) },
            |(_, at)| at as Float,
        )
    }

    /// NaN for an empty tensor.
    pub fn mean(&self) -> Float {
        self.data().iter().sum::<Float>() / self.len() as Float
    }

    /// Sample standard deviation (divisor `len - 1`); NaN below two elements.
    pub fn std(&self) -> Float {
        if self.len() < 2 {
            return Float::NAN;
        }
        let mean = self.mean();
        let sq: Float = self.data().iter().map(|v| (v - mean) * (v - mean)).sum();
        (sq / (self.len() - 1) as Float).sqrt()
    }
}
