use crate::tensor::Float;

pub fn dot(a: &[Float], b: &[Float]) -> Float {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `y += alpha * x`
pub fn axpy(alpha: Float, x: &[Float], y: &mut [Float]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

/// C = A * B^T, with A stored `m x k`, B stored `n x k` and C `m x n`.
///
/// Both operands are read row by row, which is why weights and kernels are
/// kept with the reduced dimension last.
pub fn gemm_nt(a: &[Float], b: &[Float], c: &mut [Float], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let a_row = &a[i * k..(i + 1) * k];
        for j in 0..n {
            c[i * n + j] = dot(a_row, &b[j * k..(j + 1) * k]);
        }
    }
}

/// Adds `bias[j]` to every column `j` of an `m x n` matrix.
pub fn add_column_bias(output: &mut [Float], bias: &[Float], m: usize, n: usize) {
    for i in 0..m {
        for j in 0..n {
            output[i * n + j] += bias[j];
        }
    }
}

/// Adds `bias[i]` to every element of row `i` of an `m x n` matrix.
pub fn add_row_bias(output: &mut [Float], bias: &[Float], m: usize, n: usize) {
    for i in 0..m {
        for value in &mut output[i * n..(i + 1) * n] {
            *value += bias[i];
        }
    }
}
