use std::ops::{Add, Sub};

use crate::error::{Result, TensorError};
use crate::tensor::{Float, Tensor};

impl Tensor {
    fn zip_with(&self, other: &Tensor, op: impl Fn(Float, Float) -> Float) -> Result<Tensor> {
        self.same_dims(other)?;
        let data = self
            .data()
            .iter()
            .zip(other.data())
            .map(|(&a, &b)| op(a, b))
            .collect();
        Tensor::from_data(data, self.dims())
    }

    fn map(&self, op: impl Fn(Float) -> Float) -> Result<Tensor> {
        Tensor::from_data(self.data().iter().map(|&v| op(v)).collect(), self.dims())
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn exp(&self) -> Result<Tensor> {
        self.map(Float::exp)
    }

    pub fn log(&self) -> Result<Tensor> {
        self.map(Float::ln)
    }

    /// Subtracts `column[r, 0]` from every element of row `r` of a matrix.
    pub fn sub_column(&self, column: &Tensor) -> Result<Tensor> {
        self.with_column(column, |a, c| a - c)
    }

    /// Adds `column[r, 0]` to every element of row `r` of a matrix.
    pub fn add_column(&self, column: &Tensor) -> Result<Tensor> {
        self.with_column(column, |a, c| a + c)
    }

    fn with_column(&self, column: &Tensor, op: impl Fn(Float, Float) -> Float) -> Result<Tensor> {
        let dims = self.dims();
        if dims.len() != 2 || column.dims() != [dims[0], 1] {
            return Err(TensorError::ShapeMismatch {
                left: dims.into(),
                right: column.dims().into(),
            });
        }
        let cols = dims[1];
        let data = self
            .data()
            .iter()
            .enumerate()
            .map(|(i, &a)| op(a, column.data()[i / cols]))
            .collect();
        Tensor::from_data(data, dims)
    }
}

impl Add for &Tensor {
    type Output = Result<Tensor>;

    fn add(self, rhs: &Tensor) -> Result<Tensor> {
        Tensor::add(self, rhs)
    }
}

impl Sub for &Tensor {
    type Output = Result<Tensor>;

    fn sub(self, rhs: &Tensor) -> Result<Tensor> {
        Tensor::sub(self, rhs)
    }
}
