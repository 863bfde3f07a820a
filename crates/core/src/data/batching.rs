use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{Result, TensorError};
use crate::tensor::{Dims, Tensor};

/// Gathers the leading-dimension slices `indices` of `data` into a new
/// tensor of dims `[indices.len(), ...]`.
pub fn batch_from_data(data: &Tensor, indices: &[usize]) -> Result<Tensor> {
    let Some((&count, rest)) = data.dims().split_first() else {
        return Err(TensorError::InvalidInput {
            layer: "batch_from_data",
            dims: Dims::new(),
            reason: "cannot batch a rank-0 tensor",
        });
    };
    let item: usize = rest.iter().product();
    let mut values = Vec::with_capacity(indices.len() * item);
    for &i in indices {
        if i >= count {
            return Err(TensorError::IndexOutOfBounds {
                indices: vec![i],
                dims: Dims::from_slice(data.dims()),
            });
        }
        values.extend_from_slice(&data.data()[i * item..(i + 1) * item]);
    }
    let mut dims = Dims::from_slice(data.dims());
    dims[0] = indices.len();
    Tensor::from_data(values, &dims)
}

/// Same as [`batch_from_data`] for a `[N]` label tensor.
pub fn batch_from_labels(labels: &Tensor, indices: &[usize]) -> Result<Tensor> {
    if labels.rank() != 1 {
        return Err(TensorError::RankMismatch {
            expected: 1,
            got: labels.rank(),
        });
    }
    batch_from_data(labels, indices)
}

/// Shifts and scales all values in place to zero mean and unit sample
/// standard deviation. Constant tensors are only centred.
pub fn standardize(t: &mut Tensor) {
    let mean = t.mean();
    let std = t.std();
    let scale = if std.is_finite() && std > 0.0 { 1.0 / std } else { 1.0 };
    for v in t.data_mut() {
        *v = (*v - mean) * scale;
    }
}

pub fn shuffled_indices<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);
    indices
}

/// `indices[start..start + len]`, clamped to the end of `indices`.
pub fn sliced_indices(indices: &[usize], start: usize, len: usize) -> &[usize] {
    let start = start.min(indices.len());
    let end = start.saturating_add(len).min(indices.len());
    &indices[start..end]
}
