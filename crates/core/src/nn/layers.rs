use rand::Rng;
use tracing::debug;

use crate::backend::CpuBackend;
use crate::error::{Result, TensorError};
use crate::nn::init::kaiming_normal;
use crate::ops_cpu::{relu_backward, relu_forward, sigmoid_backward, sigmoid_forward};
use crate::tensor::{Dims, Tensor, TensorId};

/// A differentiable computation with its own output buffer.
///
/// `forward` writes into the layer's output tensor and remembers which tensor
/// it read. `backward` must then be handed that same tensor: it reads the
/// output gradient and accumulates into the input gradient and into the
/// layer's parameter gradients. Gradients are only ever reset by `zero_grad`.
pub trait Layer: Send {
    fn name(&self) -> &'static str;

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor>;

    fn backward(&mut self, input: &mut Tensor) -> Result<()>;

    fn output(&self) -> &Tensor;

    fn output_mut(&mut self) -> &mut Tensor;

    /// Tensors an optimizer updates, in a fixed order.
    fn parameter_tensors(&self) -> Vec<&Tensor> {
        Vec::new()
    }

    fn parameter_tensors_mut(&mut self) -> Vec<&mut Tensor> {
        Vec::new()
    }

    /// Buffers that carry gradients but are not trained. The output is one
    /// of them: backward passes accumulate into its gradient.
    fn non_parameter_tensors_mut(&mut self) -> Vec<&mut Tensor> {
        vec![self.output_mut()]
    }

    fn zero_grad(&mut self) {
        for t in self.parameter_tensors_mut() {
            t.zero_grad();
        }
        for t in self.non_parameter_tensors_mut() {
            t.zero_grad();
        }
    }
}

#[derive(Debug, Clone)]
struct ForwardRecord {
    id: TensorId,
    dims: Dims,
}

/// Which tensor the last `forward` read, until `backward` consumes it.
#[derive(Debug, Clone, Default)]
pub struct InputSlot(Option<ForwardRecord>);

impl InputSlot {
    pub fn remember(&mut self, input: &Tensor) {
        self.0 = Some(ForwardRecord {
            id: input.id(),
            dims: Dims::from_slice(input.dims()),
        });
    }

    /// Fails unless `input` is the tensor seen by the pending forward.
    pub fn check(&self, layer: &'static str, input: &Tensor) -> Result<()> {
        match &self.0 {
            None => Err(TensorError::BackwardWithoutForward { layer }),
            Some(r) if r.id != input.id() || r.dims.as_slice() != input.dims() => {
                Err(TensorError::InputMismatch { layer })
            }
            Some(_) => Ok(()),
        }
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }

    pub fn is_pending(&self) -> bool {
        self.0.is_some()
    }
}

/// Resizes a layer's output to `dims`, logging reallocations.
pub(crate) fn fit_output(layer: &'static str, output: &mut Tensor, dims: &[usize]) -> Result<()> {
    if output.resize_zeroed(dims)? {
        debug!(layer, ?dims, "output reallocated");
    }
    Ok(())
}

/// Checks the input is `[batch, features]` and returns the batch size.
fn expect_rows(layer: &'static str, input: &Tensor, features: usize) -> Result<usize> {
    if input.rank() != 2 {
        return Err(TensorError::InvalidInput {
            layer,
            dims: Dims::from_slice(input.dims()),
            reason: "expected [batch, features]",
        });
    }
    if input.dims()[1] != features {
        return Err(TensorError::FeatureMismatch {
            layer,
            expected: features,
            got: input.dims()[1],
        });
    }
    Ok(input.dims()[0])
}

/// Fully connected layer; the weight is stored `[out, in]`.
pub struct Linear {
    weight: Tensor,
    bias: Tensor,
    output: Tensor,
    input: InputSlot,
    backend: CpuBackend,
}

impl Linear {
    pub fn new(backend: CpuBackend, in_features: usize, out_features: usize) -> Result<Self> {
        Self::with_rng(backend, in_features, out_features, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(
        backend: CpuBackend,
        in_features: usize,
        out_features: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let weight = kaiming_normal(&[out_features, in_features], in_features, rng)?;
        let bias = Tensor::zeros(&[out_features])?;
        Self::from_parameters(backend, weight, bias)
    }

    /// Builds the layer around given parameters: `weight [out, in]`, `bias [out]`.
    pub fn from_parameters(backend: CpuBackend, weight: Tensor, bias: Tensor) -> Result<Self> {
        if weight.rank() != 2 || bias.dims() != [weight.dims()[0]] {
            return Err(TensorError::ShapeMismatch {
                left: Dims::from_slice(weight.dims()),
                right: Dims::from_slice(bias.dims()),
            });
        }
        Ok(Self {
            weight,
            bias,
            output: Tensor::zeros(&[0])?,
            input: InputSlot::default(),
            backend,
        })
    }

    pub fn in_features(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }
}

impl Layer for Linear {
    fn name(&self) -> &'static str {
        "Linear"
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        let (in_f, out_f) = (self.in_features(), self.out_features());
        let batch = expect_rows(self.name(), input, in_f)?;
        fit_output(self.name(), &mut self.output, &[batch, out_f])?;
        self.backend.linear_forward(
            input.data(),
            self.weight.data(),
            self.bias.data(),
            self.output.data_mut(),
            in_f,
            out_f,
        );
        self.input.remember(input);
        Ok(&self.output)
    }

    fn backward(&mut self, input: &mut Tensor) -> Result<()> {
        self.input.check(self.name(), input)?;
        let (in_f, out_f) = (self.in_features(), self.out_features());
        let (x, dx) = input.split_mut();
        let (w, dw) = self.weight.split_mut();
        self.backend.linear_backward(
            x,
            dx,
            w,
            dw,
            self.bias.grad_mut(),
            self.output.grad(),
            in_f,
            out_f,
        );
        self.input.clear();
        Ok(())
    }

    fn output(&self) -> &Tensor {
        &self.output
    }

    fn output_mut(&mut self) -> &mut Tensor {
        &mut self.output
    }

    fn parameter_tensors(&self) -> Vec<&Tensor> {
        vec![&self.weight, &self.bias]
    }

    fn parameter_tensors_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weight, &mut self.bias]
    }
}

pub struct ReLU {
    output: Tensor,
    input: InputSlot,
}

impl ReLU {
    pub fn new() -> Result<Self> {
        Ok(Self {
            output: Tensor::zeros(&[0])?,
            input: InputSlot::default(),
        })
    }
}

impl Layer for ReLU {
    fn name(&self) -> &'static str {
        "ReLU"
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        fit_output(self.name(), &mut self.output, input.dims())?;
        relu_forward(input.data(), self.output.data_mut());
        self.input.remember(input);
        Ok(&self.output)
    }

    fn backward(&mut self, input: &mut Tensor) -> Result<()> {
        self.input.check(self.name(), input)?;
        let (x, dx) = input.split_mut();
        relu_backward(self.output.grad(), x, dx);
        self.input.clear();
        Ok(())
    }

    fn output(&self) -> &Tensor {
        &self.output
    }

    fn output_mut(&mut self) -> &mut Tensor {
        &mut self.output
    }
}

pub struct Sigmoid {
    output: Tensor,
    input: InputSlot,
}

impl Sigmoid {
    pub fn new() -> Result<Self> {
        Ok(Self {
            output: Tensor::zeros(&[0])?,
            input: InputSlot::default(),
        })
    }
}

impl Layer for Sigmoid {
    fn name(&self) -> &'static str {
        "Sigmoid"
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        fit_output(self.name(), &mut self.output, input.dims())?;
        sigmoid_forward(input.data(), self.output.data_mut());
        self.input.remember(input);
        Ok(&self.output)
    }

    fn backward(&mut self, input: &mut Tensor) -> Result<()> {
        self.input.check(self.name(), input)?;
        sigmoid_backward(self.output.grad(), self.output.data(), input.grad_mut());
        self.input.clear();
        Ok(())
    }

    fn output(&self) -> &Tensor {
        &self.output
    }

    fn output_mut(&mut self) -> &mut Tensor {
        &mut self.output
    }
}

/// Copies values into a differently shaped output of equal length.
///
/// `free_dim` marks one entry of `dims` that is inferred on every forward as
/// `input.len() / product(other dims)`, typically the batch dimension.
pub struct Reshape {
    dims: Dims,
    free_dim: Option<usize>,
    output: Tensor,
    input: InputSlot,
}

impl Reshape {
    pub fn new(dims: &[usize], free_dim: Option<usize>) -> Result<Self> {
        if let Some(free) = free_dim {
            if free >= dims.len() {
                return Err(TensorError::InvalidConfig(format!(
                    "free dimension {free} out of range for {} dims",
                    dims.len()
                )));
            }
        }
        Ok(Self {
            dims: Dims::from_slice(dims),
            free_dim,
            output: Tensor::zeros(&[0])?,
            input: InputSlot::default(),
        })
    }

    fn target_dims(&self, input: &Tensor) -> Result<Dims> {
        let len = input.len();
        let mut dims = self.dims.clone();
        if let Some(free) = self.free_dim {
            let fixed: usize = dims
                .iter()
                .enumerate()
                .filter(|&(i, _)| i != free)
                .map(|(_, &d)| d)
                .product();
            dims[free] = if fixed == 0 { 0 } else { len / fixed };
        }
        if dims.iter().product::<usize>() != len {
            return Err(TensorError::ReshapeMismatch {
                from: Dims::from_slice(input.dims()),
                to: dims,
            });
        }
        Ok(dims)
    }
}

impl Layer for Reshape {
    fn name(&self) -> &'static str {
        "Reshape"
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        let dims = self.target_dims(input)?;
        fit_output(self.name(), &mut self.output, &dims)?;
        self.output.data_mut().copy_from_slice(input.data());
        self.input.remember(input);
        Ok(&self.output)
    }

    fn backward(&mut self, input: &mut Tensor) -> Result<()> {
        self.input.check(self.name(), input)?;
        for (dx, g) in input.grad_mut().iter_mut().zip(self.output.grad()) {
            *dx += g;
        }
        self.input.clear();
        Ok(())
    }

    fn output(&self) -> &Tensor {
        &self.output
    }

    fn output_mut(&mut self) -> &mut Tensor {
        &mut self.output
    }
}
