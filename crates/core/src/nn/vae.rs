use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::{Result, TensorError};
use crate::nn::layers::{fit_output, InputSlot, Layer};
use crate::tensor::{Dims, Float, Tensor};

/// Checks a `[batch, 2 * latent]` distribution tensor and returns
/// `(batch, latent)`. Rows hold interleaved `(mean, log-variance)` pairs.
pub(crate) fn latent_dims(layer: &'static str, distribution: &Tensor) -> Result<(usize, usize)> {
    match *distribution.dims() {
        [batch, width] if width % 2 == 0 => Ok((batch, width / 2)),
        _ => Err(TensorError::InvalidInput {
            layer,
            dims: Dims::from_slice(distribution.dims()),
            reason: "expected [batch, 2 * latent] of (mean, logvar) pairs",
        }),
    }
}

/// Samples `mean + ε * exp(logvar / 2)` with `ε ~ N(0, 1)` per latent unit.
///
/// The drawn noise is kept in a non-parameter tensor for the backward pass.
pub struct Reparameterize {
    noise: Tensor,
    rng: StdRng,
    output: Tensor,
    input: InputSlot,
}

impl Reparameterize {
    pub fn new() -> Result<Self> {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_seed(seed: u64) -> Result<Self> {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Result<Self> {
        Ok(Self {
            noise: Tensor::zeros(&[0])?,
            rng,
            output: Tensor::zeros(&[0])?,
            input: InputSlot::default(),
        })
    }

    pub fn noise(&self) -> &Tensor {
        &self.noise
    }
}

impl Layer for Reparameterize {
    fn name(&self) -> &'static str {
        "Reparameterize"
    }

    fn forward(&mut self, input: &Tensor) -> Result<&Tensor> {
        let (batch, latent) = latent_dims(self.name(), input)?;
        fit_output(self.name(), &mut self.output, &[batch, latent])?;
        self.noise.resize_zeroed(&[batch, latent])?;

        let pairs = input.data().chunks_exact(2);
        let cells = self.output.data_mut().iter_mut().zip(self.noise.data_mut());
        for (pair, (out, eps)) in pairs.zip(cells) {
            *eps = self.rng.sample::<Float, _>(StandardNormal);
            *out = pair[0] + *eps * (pair[1] / 2.0).exp();
        }
        self.input.remember(input);
        Ok(&self.output)
    }

    fn backward(&mut self, input: &mut Tensor) -> Result<()> {
        self.input.check(self.name(), input)?;
        let (values, grads) = input.split_mut();
        let cells = self.output.grad().iter().zip(self.noise.data());
        for ((pair, d), (&g, &eps)) in values
            .chunks_exact(2)
            .zip(grads.chunks_exact_mut(2))
            .zip(cells)
        {
            d[0] += g;
            d[1] += 0.5 * (pair[1] / 2.0).exp() * eps * g;
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

    fn non_parameter_tensors_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.noise, &mut self.output]
    }
}
