use rand::Rng;

use crate::backend::{ConvGeometry, CpuBackend, WindowGeometry};
use crate::error::{Result, TensorError};
use crate::nn::init::kaiming_normal;
use crate::nn::layers::{fit_output, InputSlot, Layer};
use crate::tensor::{Dims, Tensor};

/// How [`Conv2d`] evaluates the convolution. Both produce the same numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConvAlgorithm {
    /// Loops over receptive fields in place.
    #[default]
    Direct,
    /// Unfolds receptive fields into a matrix and multiplies by the kernel.
    Im2Col,
}

/// `[B, C, H, W]` of a 4-D input, or an error naming the layer.
fn image_dims(layer: &'static str, input: &Tensor) -> Result<[usize; 4]> {
    match *input.dims() {
        [b, c, h, w] => Ok([b, c, h, w]),
        _ => Err(TensorError::InvalidInput {
            layer,
            dims: Dims::from_slice(input.dims()),
            reason: "expected [batch, channels, height, width]",
        }),
    }
}

fn positive(what: &str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(TensorError::InvalidConfig(format!("{what} must be positive")));
    }
    Ok(value)
}

pub struct Conv2d {
    kernel: Tensor,
    bias: Tensor,
    stride: usize,
    padding: usize,
    algorithm: ConvAlgorithm,
    columns: Tensor,
    geometry: Option<ConvGeometry>,
    output: Tensor,
    input: InputSlot,
    backend: CpuBackend,
}

impl Conv2d {
    pub fn new(
        backend: CpuBackend,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
    ) -> Result<Self> {
        Self::with_rng(
            backend,
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            &mut rand::thread_rng(),
        )
    }

    pub fn with_rng<R: Rng + ?Sized>(
        backend: CpuBackend,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Result<Self> {
        positive("kernel size", kernel_size)?;
        let fan_in = in_channels * kernel_size * kernel_size;
        let kernel = kaiming_normal(
            &[out_channels, in_channels, kernel_size, kernel_size],
            fan_in,
            rng,
        )?;
        let bias = Tensor::zeros(&[out_channels])?;
        Self::from_parameters(backend, kernel, bias, stride, padding)
    }

    /// `kernel` is `[out, in, k, k]`, `bias` is `[out]`.
    pub fn from_parameters(
        backend: CpuBackend,
        kernel: Tensor,
        bias: Tensor,
        stride: usize,
        padding: usize,
    ) -> Result<Self> {
        let square = matches!(*kernel.dims(), [_, _, kh, kw] if kh == kw && kh > 0);
        if !square || bias.dims() != [kernel.dims()[0]] {
            return Err(TensorError::ShapeMismatch {
                left: Dims::from_slice(kernel.dims()),
                right: Dims::from_slice(bias.dims()),
            });
        }
        Ok(Self {
            kernel,
            bias,
            stride: positive("stride", stride)?,
            padding,
            algorithm: ConvAlgorithm::default(),
            columns: Tensor::zeros(&[0, 0])?,
            geometry: None,
            output: Tensor::zeros(&[0])?,
            input: InputSlot::default(),
            backend,
        })
    }

    pub fn with_algorithm(mut self, algorithm: ConvAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn algorithm(&self) -> ConvAlgorithm {
        self.algorithm
    }

    pub fn in_channels(&self) -> usize {
        self.kernel.dims()[1]
    }

    pub fn out_channels(&self) -> usize {
        self.kernel.dims()[0]
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel.dims()[2]
    }

    pub fn kernel(&self) -> &Tensor {
        &self.kernel
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// `⌊(n + 2p - k) / s⌋ + 1`, or `None` when the kernel does not fit.
    pub fn convolved_size(&self, n: usize) -> Option<usize> {
        (n + 2 * self.padding)
            .checked_sub(self.kernel_size())
            .map(|span| span / self.stride + 1)
    }

    fn geometry_for(&self, input: &Tensor) -> Result<ConvGeometry> {
        let [batch, channels, in_h, in_w] = image_dims(self.name(), input)?;
        if channels != self.in_channels() {
            return Err(TensorError::FeatureMismatch {
                layer: self.name(),
                expected: self.in_channels(),
                got: channels,
            });
        }
        let too_small = || TensorError::InvalidInput {
            layer: "Conv2d",
            dims: Dims::from_slice(input.dims()),
            reason: "kernel is larger than the padded input",
        };
        Ok(ConvGeometry {
            batch,
            in_channels: channels,
            out_channels: self.out_channels(),
            in_h,
            in_w,
            kernel: self.kernel_size(),
            stride: self.stride,
            padding: self.padding,
            out_h: self.convolved_size(in_h).ok_or_else(too_small)?,
            out_w: self.convolved_size(in_w).ok_or_else(too_small)?,
        })
    }
}

impl Layer for Conv2d {
    fn name(&self) -> &'static str {
        "Conv2d"
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        let geom = self.geometry_for(input)?;
        fit_output(
            self.name(),
            &mut self.output,
            &[geom.batch, geom.out_channels, geom.out_h, geom.out_w],
        )?;
        match self.algorithm {
            ConvAlgorithm::Direct => self.backend.conv_direct_forward(
                &geom,
                input.data(),
                self.kernel.data(),
                self.bias.data(),
                self.output.data_mut(),
            ),
            ConvAlgorithm::Im2Col => {
                self.columns
                    .resize_zeroed(&[geom.batch * geom.positions(), geom.patch_len()])?;
                self.backend
                    .im2col(&geom, input.data(), self.columns.data_mut());
                self.backend.conv_gemm_forward(
                    &geom,
                    self.columns.data(),
                    self.kernel.data(),
                    self.bias.data(),
                    self.output.data_mut(),
                );
            }
        }
        self.geometry = Some(geom);
        self.input.remember(input);
        Ok(&self.output)
    }

    fn backward(&mut self, input: &mut Tensor) -> Result<()> {
        self.input.check(self.name(), input)?;
        let geom = self
            .geometry
            .ok_or(TensorError::BackwardWithoutForward { layer: "Conv2d" })?;
        let (x, dx) = input.split_mut();
        let (k, dk) = self.kernel.split_mut();
        match self.algorithm {
            ConvAlgorithm::Direct => self.backend.conv_direct_backward(
                &geom,
                x,
                dx,
                k,
                dk,
                self.bias.grad_mut(),
                self.output.grad(),
            ),
            ConvAlgorithm::Im2Col => self.backend.conv_gemm_backward(
                &geom,
                self.columns.data(),
                dx,
                k,
                dk,
                self.bias.grad_mut(),
                self.output.grad(),
            ),
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

    fn parameter_tensors(&self) -> Vec<&Tensor> {
        vec![&self.kernel, &self.bias]
    }

    fn parameter_tensors_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.kernel, &mut self.bias]
    }
}

/// Max over non-overlapping `size x size` windows; trailing rows and
/// columns that do not fill a window are dropped.
pub struct MaxPool2d {
    size: usize,
    argmax: Vec<usize>,
    geometry: Option<WindowGeometry>,
    output: Tensor,
    input: InputSlot,
    backend: CpuBackend,
}

impl MaxPool2d {
    pub fn new(backend: CpuBackend, size: usize) -> Result<Self> {
        Ok(Self {
            size: positive("pool size", size)?,
            argmax: Vec::new(),
            geometry: None,
            output: Tensor::zeros(&[0])?,
            input: InputSlot::default(),
            backend,
        })
    }
}

impl Layer for MaxPool2d {
    fn name(&self) -> &'static str {
        "MaxPool2d"
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        let [batch, channels, in_h, in_w] = image_dims(self.name(), input)?;
        let geom = WindowGeometry {
            batch,
            channels,
            in_h,
            in_w,
            out_h: in_h / self.size,
            out_w: in_w / self.size,
            size: self.size,
        };
        fit_output(self.name(), &mut self.output, &[batch, channels, geom.out_h, geom.out_w])?;
        self.argmax.resize(self.output.len(), 0);
        self.backend
            .maxpool_forward(&geom, input.data(), self.output.data_mut(), &mut self.argmax);
        self.geometry = Some(geom);
        self.input.remember(input);
        Ok(&self.output)
    }

    fn backward(&mut self, input: &mut Tensor) -> Result<()> {
        self.input.check(self.name(), input)?;
        let geom = self
            .geometry
            .ok_or(TensorError::BackwardWithoutForward { layer: "MaxPool2d" })?;
        self.backend
            .maxpool_backward(&geom, input.grad_mut(), self.output.grad(), &self.argmax);
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

/// Nearest-neighbour upsampling: each cell becomes a `factor x factor` block.
pub struct Upsample {
    factor: usize,
    geometry: Option<WindowGeometry>,
    output: Tensor,
    input: InputSlot,
    backend: CpuBackend,
}

impl Upsample {
    pub fn new(backend: CpuBackend, factor: usize) -> Result<Self> {
        Ok(Self {
            factor: positive("upsample factor", factor)?,
            geometry: None,
            output: Tensor::zeros(&[0])?,
            input: InputSlot::default(),
            backend,
        })
    }
}

impl Layer for Upsample {
    fn name(&self) -> &'static str {
        "Upsample"
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        let [batch, channels, in_h, in_w] = image_dims(self.name(), input)?;
        let geom = WindowGeometry {
            batch,
            channels,
            in_h,
            in_w,
            out_h: in_h * self.factor,
            out_w: in_w * self.factor,
            size: self.factor,
        };
        fit_output(self.name(), &mut self.output, &[batch, channels, geom.out_h, geom.out_w])?;
        self.backend
            .upsample_forward(&geom, input.data(), self.output.data_mut());
        self.geometry = Some(geom);
        self.input.remember(input);
        Ok(&self.output)
    }

    fn backward(&mut self, input: &mut Tensor) -> Result<()> {
        self.input.check(self.name(), input)?;
        let geom = self
            .geometry
            .ok_or(TensorError::BackwardWithoutForward { layer: "Upsample" })?;
        self.backend
            .upsample_backward(&geom, input.grad_mut(), self.output.grad());
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
