use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;
use tracing::error;

use crate::error::{Result, TensorError};

pub type Float = f64;

/// Tensors of higher rank are rejected at construction and on reshape.
pub const MAX_RANK: usize = 10;

pub type Dims = SmallVec<[usize; 4]>;

/// Process-unique identity of a tensor, stable across moves and reshapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(u64);

impl TensorId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        TensorId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Dense row-major array of values with an equally shaped gradient buffer.
///
/// A tensor owns both buffers and is deliberately not `Clone`: a parameter's
/// accumulated gradient must have exactly one home.
#[derive(Debug)]
pub struct Tensor {
    id: TensorId,
    dims: Dims,
    strides: Dims,
    data: Vec<Float>,
    grad: Vec<Float>,
}

pub fn length_of(dims: &[usize]) -> usize {
    dims.iter().product()
}

pub fn strides_of(dims: &[usize]) -> Dims {
    let mut strides: Dims = SmallVec::from_elem(1, dims.len());
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

fn check_rank(dims: &[usize]) -> Result<()> {
    if dims.len() > MAX_RANK {
        return Err(TensorError::RankTooLarge {
            rank: dims.len(),
            max: MAX_RANK,
        });
    }
    Ok(())
}

fn zeroed_buffer(dims: &[usize]) -> Result<Vec<Float>> {
    let fail = || {
        error!(?dims, "tensor allocation failed");
        TensorError::Allocation {
            dims: Dims::from_slice(dims),
        }
    };
    let len = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(fail)?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| fail())?;
    buf.resize(len, 0.0);
    Ok(buf)
}

impl Tensor {
    pub fn zeros(dims: &[usize]) -> Result<Self> {
        check_rank(dims)?;
        let data = zeroed_buffer(dims)?;
        let grad = zeroed_buffer(dims)?;
        Ok(Self {
            id: TensorId::next(),
            dims: Dims::from_slice(dims),
            strides: strides_of(dims),
            data,
            grad,
        })
    }

    pub fn from_data(data: Vec<Float>, dims: &[usize]) -> Result<Self> {
        check_rank(dims)?;
        let expected = length_of(dims);
        if data.len() != expected {
            return Err(TensorError::SizeMismatch {
                dims: Dims::from_slice(dims),
                expected,
                got: data.len(),
            });
        }
        let grad = zeroed_buffer(dims)?;
        Ok(Self {
            id: TensorId::next(),
            dims: Dims::from_slice(dims),
            strides: strides_of(dims),
            data,
            grad,
        })
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[Float] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [Float] {
        &mut self.data
    }

    pub fn grad(&self) -> &[Float] {
        &self.grad
    }

    pub fn grad_mut(&mut self) -> &mut [Float] {
        &mut self.grad
    }

    /// Borrows both buffers at once: values mutably alongside the gradient.
    pub fn split_mut(&mut self) -> (&mut [Float], &mut [Float]) {
        (&mut self.data, &mut self.grad)
    }

    /// Flat offset of `indices`, computed as `Σ indices[i] * strides[i]`.
    pub fn offset(&self, indices: &[usize]) -> Result<usize> {
        if indices.len() != self.dims.len() {
            return Err(TensorError::RankMismatch {
                expected: self.dims.len(),
                got: indices.len(),
            });
        }
        let offset = indices
            .iter()
            .zip(self.strides.iter())
            .try_fold(0usize, |acc, (i, s)| i.checked_mul(*s)?.checked_add(acc));
        match offset {
            Some(offset) if offset < self.data.len() => Ok(offset),
            _ => Err(TensorError::IndexOutOfBounds {
                indices: indices.to_vec(),
                dims: self.dims.clone(),
            }),
        }
    }

    /// Inverse of [`Tensor::offset`] for every valid flat offset.
    pub fn indices_of(&self, offset: usize) -> Result<Vec<usize>> {
        if offset >= self.data.len() {
            return Err(TensorError::OffsetOutOfBounds {
                offset,
                len: self.data.len(),
            });
        }
        let mut rest = offset;
        Ok(self
            .strides
            .iter()
            .map(|&stride| {
                let index = rest / stride;
                rest %= stride;
                index
            })
            .collect())
    }

    pub fn at(&self, indices: &[usize]) -> Result<Float> {
        Ok(self.data[self.offset(indices)?])
    }

    pub fn at_mut(&mut self, indices: &[usize]) -> Result<&mut Float> {
        let offset = self.offset(indices)?;
        Ok(&mut self.data[offset])
    }

    pub fn grad_at(&self, indices: &[usize]) -> Result<Float> {
        Ok(self.grad[self.offset(indices)?])
    }

    pub fn grad_at_mut(&mut self, indices: &[usize]) -> Result<&mut Float> {
        let offset = self.offset(indices)?;
        Ok(&mut self.grad[offset])
    }

    /// Replaces dims and strides; the buffers are untouched.
    pub fn reshape(&mut self, new_dims: &[usize]) -> Result<()> {
        check_rank(new_dims)?;
        if length_of(new_dims) != self.data.len() {
            return Err(TensorError::ReshapeMismatch {
                from: self.dims.clone(),
                to: Dims::from_slice(new_dims),
            });
        }
        self.dims = Dims::from_slice(new_dims);
        self.strides = strides_of(new_dims);
        Ok(())
    }

    /// Reallocates zero-filled buffers when `dims` differ from the current
    /// ones. Returns whether a reallocation happened.
    pub fn resize_zeroed(&mut self, dims: &[usize]) -> Result<bool> {
        if self.dims.as_slice() == dims {
            return Ok(false);
        }
        check_rank(dims)?;
        let data = zeroed_buffer(dims)?;
        let grad = zeroed_buffer(dims)?;
        self.data = data;
        self.grad = grad;
        self.dims = Dims::from_slice(dims);
        self.strides = strides_of(dims);
        Ok(true)
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    /// Resolves a possibly negative dimension index (`-1` is the last one).
    pub fn normalize_dim(&self, dim: isize) -> Result<usize> {
        let rank = self.dims.len() as isize;
        let resolved = if dim < 0 { rank + dim } else { dim };
        if resolved < 0 || resolved >= rank {
            return Err(TensorError::DimOutOfRange {
                dim,
                rank: self.dims.len(),
            });
        }
        Ok(resolved as usize)
    }

    pub fn same_dims(&self, other: &Tensor) -> Result<()> {
        if self.dims != other.dims {
            return Err(TensorError::ShapeMismatch {
                left: self.dims.clone(),
                right: other.dims.clone(),
            });
        }
        Ok(())
    }

    /// Displays the gradient buffer with the same layout as the values.
    pub fn grad_view(&self) -> GradView<'_> {
        GradView(self)
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, values: &[Float]) -> fmt::Result {
        if self.dims.is_empty() {
            return match values.first() {
                Some(v) => write!(f, "{v}"),
                None => write!(f, "[]"),
            };
        }
        let by_blocks = self.dims.len() > 2;
        self.render_dim(f, values, 0, 0, by_blocks)
    }

    fn render_dim(
        &self,
        f: &mut fmt::Formatter<'_>,
        values: &[Float],
        start: usize,
        dim: usize,
        by_blocks: bool,
    ) -> fmt::Result {
        let size = self.dims[dim];
        let stride = self.strides[dim];
        write!(f, "[")?;
        for i in 0..size {
            if dim + 1 == self.dims.len() {
                write!(f, "{}", values[start + i])?;
            } else {
                self.render_dim(f, values, start + i * stride, dim + 1, false)?;
            }
            if i + 1 < size {
                write!(f, ", ")?;
                if by_blocks {
                    write!(f, "\n\n ")?;
                }
            }
        }
        write!(f, "]")
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, &self.data)
    }
}

pub struct GradView<'a>(&'a Tensor);

impl fmt::Display for GradView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.render(f, &self.0.grad)
    }
}
