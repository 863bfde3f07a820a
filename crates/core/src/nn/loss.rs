//! Scalar losses. Each one follows the layer contract: `forward` remembers
//! the tensor it scored and `backward` accumulates into that tensor's
//! gradient exactly once.

use std::str::FromStr;

use crate::error::{Result, TensorError};
use crate::nn::layers::InputSlot;
use crate::nn::vae::latent_dims;
use crate::tensor::{Dims, Float, Tensor};

fn shape_mismatch(left: &Tensor, right: &Tensor) -> TensorError {
    TensorError::ShapeMismatch {
        left: Dims::from_slice(left.dims()),
        right: Dims::from_slice(right.dims()),
    }
}

/// Mean negative log-likelihood of integer class labels under
/// `softmax(logits)`.
#[derive(Default)]
pub struct CrossEntropyLoss {
    softmax: Option<Tensor>,
    labels: Vec<usize>,
    input: InputSlot,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    /// `logits` is `[batch, classes]`; `labels` holds `batch` class indices.
    pub fn forward(&mut self, logits: &Tensor, labels: &Tensor) -> Result<Float> {
        let (batch, classes) = match *logits.dims() {
            [b, c] if b > 0 && c > 0 => (b, c),
            _ => {
                return Err(TensorError::InvalidInput {
                    layer: "CrossEntropyLoss",
                    dims: Dims::from_slice(logits.dims()),
                    reason: "expected non-empty [batch, classes]",
                })
            }
        };
        if labels.len() != batch {
            return Err(shape_mismatch(logits, labels));
        }
        self.labels.clear();
        for &label in labels.data() {
            if label < 0.0 || label.fract() != 0.0 || label as usize >= classes {
                return Err(TensorError::LabelOutOfRange { label, classes });
            }
            self.labels.push(label as usize);
        }

        // log_softmax = logits - (max + log Σ exp(logits - max))
        let shifted = logits.sub_column(&logits.max(1)?)?;
        let log_norm = shifted.exp()?.sum(1)?.log()?;
        let log_probs = shifted.sub_column(&log_norm)?;

        let nll: Float = self
            .labels
            .iter()
            .enumerate()
            .map(|(b, &label)| -log_probs.data()[b * classes + label])
            .sum();
        self.softmax = Some(log_probs.exp()?);
        self.input.remember(logits);
        Ok(nll / batch as Float)
    }

    /// Accumulates `(softmax - onehot) / batch` into `logits.grad`.
    pub fn backward(&mut self, logits: &mut Tensor) -> Result<()> {
        self.input.check("CrossEntropyLoss", logits)?;
        let softmax = self
            .softmax
            .as_ref()
            .ok_or(TensorError::BackwardWithoutForward {
                layer: "CrossEntropyLoss",
            })?;
        let (batch, classes) = (logits.dims()[0], logits.dims()[1]);
        let scale = 1.0 / batch as Float;
        for (b, (g, p)) in logits
            .grad_mut()
            .chunks_mut(classes)
            .zip(softmax.data().chunks(classes))
            .enumerate()
        {
            for (c, (gc, &pc)) in g.iter_mut().zip(p).enumerate() {
                let target = if c == self.labels[b] { 1.0 } else { 0.0 };
                *gc += (pc - target) * scale;
            }
        }
        self.input.clear();
        Ok(())
    }
}

/// How [`MseLoss`] normalizes the summed squared error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reduction {
    /// Divide by the batch size.
    #[default]
    Sum,
    /// Divide by the number of elements.
    Mean,
}

impl FromStr for Reduction {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sum" => Ok(Reduction::Sum),
            "mean" => Ok(Reduction::Mean),
            other => Err(TensorError::InvalidConfig(format!(
                "unknown reduction {other:?}, expected \"sum\" or \"mean\""
            ))),
        }
    }
}

pub struct MseLoss {
    reduction: Reduction,
    residual: Vec<Float>,
    divisor: Float,
    input: InputSlot,
}

impl MseLoss {
    pub fn new(reduction: Reduction) -> Self {
        Self {
            reduction,
            residual: Vec::new(),
            divisor: 1.0,
            input: InputSlot::default(),
        }
    }

    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    /// `Σ (target - output)^2` over the batch size or the element count.
    pub fn forward(&mut self, output: &Tensor, target: &Tensor) -> Result<Float> {
        if output.dims() != target.dims() {
            return Err(shape_mismatch(output, target));
        }
        let count = match self.reduction {
            Reduction::Sum => output.dims().first().copied().unwrap_or(1),
            Reduction::Mean => output.len(),
        };
        self.divisor = count.max(1) as Float;
        self.residual.clear();
        self.residual
            .extend(target.data().iter().zip(output.data()).map(|(t, o)| t - o));
        let loss: Float = self.residual.iter().map(|r| r * r).sum();
        self.input.remember(output);
        Ok(loss / self.divisor)
    }

    pub fn backward(&mut self, output: &mut Tensor) -> Result<()> {
        self.input.check("MseLoss", output)?;
        let scale = -2.0 / self.divisor;
        for (g, r) in output.grad_mut().iter_mut().zip(&self.residual) {
            *g += scale * r;
        }
        self.input.clear();
        Ok(())
    }
}

/// KL divergence of diagonal Gaussians `N(mean, exp(logvar))` from the
/// standard normal, averaged over the batch and weighted by `beta`.
#[derive(Default)]
pub struct KlDivStandardNormal {
    beta: Float,
    input: InputSlot,
}

impl KlDivStandardNormal {
    pub fn new() -> Self {
        Self::default()
    }

    /// `distribution` is `[batch, 2 * latent]` with interleaved
    /// `(mean, logvar)` pairs, the layout [`super::Reparameterize`] reads.
    pub fn forward(&mut self, distribution: &Tensor, beta: Float) -> Result<Float> {
        let (batch, _) = latent_dims("KlDivStandardNormal", distribution)?;
        let kl: Float = distribution
            .data()
            .chunks_exact(2)
            .map(|p| -0.5 * (1.0 + p[1] - p[0] * p[0] - p[1].exp()))
            .sum();
        self.beta = beta;
        self.input.remember(distribution);
        Ok(beta * kl / batch.max(1) as Float)
    }

    pub fn backward(&mut self, distribution: &mut Tensor) -> Result<()> {
        self.input.check("KlDivStandardNormal", distribution)?;
        let scale = self.beta / distribution.dims()[0].max(1) as Float;
        let (values, grads) = distribution.split_mut();
        for (p, g) in values.chunks_exact(2).zip(grads.chunks_exact_mut(2)) {
            g[0] += scale * p[0];
            g[1] += scale * 0.5 * (p[1].exp() - 1.0);
        }
        self.input.clear();
        Ok(())
    }
}
