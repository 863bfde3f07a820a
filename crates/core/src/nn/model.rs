use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use tracing::info;

use crate::checkpoint::{read_parameters, write_parameters};
use crate::error::{Result, TensorError};
use crate::nn::layers::Layer;
use crate::tensor::Tensor;

/// An ordered chain of layers, each consuming the previous one's output.
#[derive(Default)]
pub struct Model {
    layers: Vec<Box<dyn Layer>>,
}

impl Model {
    pub fn new(layers: Vec<Box<dyn Layer>>) -> Self {
        Self { layers }
    }

    pub fn push(&mut self, layer: impl Layer + 'static) -> &mut Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    pub fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        let (first, rest) = self.layers.split_first_mut().ok_or(TensorError::EmptyModel)?;
        let mut current = first.forward(input)?;
        for layer in rest {
            current = layer.forward(current)?;
        }
        Ok(current)
    }

    /// Walks the layers in reverse. The last layer's output gradient must be
    /// seeded beforehand (usually by a loss); `input` is the tensor given to
    /// the matching `forward`.
    pub fn backward(&mut self, input: &mut Tensor) -> Result<()> {
        if self.layers.is_empty() {
            return Err(TensorError::EmptyModel);
        }
        for i in (1..self.layers.len()).rev() {
            let (before, after) = self.layers.split_at_mut(i);
            after[0].backward(before[i - 1].output_mut())?;
        }
        self.layers[0].backward(input)
    }

    pub fn output(&self) -> Result<&Tensor> {
        self.layers
            .last()
            .map(|l| l.output())
            .ok_or(TensorError::EmptyModel)
    }

    pub fn output_mut(&mut self) -> Result<&mut Tensor> {
        self.layers
            .last_mut()
            .map(|l| l.output_mut())
            .ok_or(TensorError::EmptyModel)
    }

    pub fn zero_grad(&mut self) {
        for layer in &mut self.layers {
            layer.zero_grad();
        }
    }

    pub fn parameter_tensors(&self) -> Vec<&Tensor> {
        self.layers
            .iter()
            .flat_map(|l| l.parameter_tensors())
            .collect()
    }

    pub fn parameter_tensors_mut(&mut self) -> Vec<&mut Tensor> {
        self.layers
            .iter_mut()
            .flat_map(|l| l.parameter_tensors_mut())
            .collect()
    }

    pub fn parameter_count(&self) -> usize {
        self.parameter_tensors().iter().map(|p| p.len()).sum()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = BufWriter::new(File::create(path)?);
        write_parameters(file, &self.parameter_tensors())?;
        info!(path = %path.display(), values = self.parameter_count(), "model saved");
        Ok(())
    }

    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = BufReader::new(File::open(path)?);
        read_parameters(file, self.parameter_tensors_mut())?;
        info!(path = %path.display(), "model loaded");
        Ok(())
    }
}
