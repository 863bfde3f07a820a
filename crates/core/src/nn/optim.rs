use tracing::trace;

use crate::error::{Result, TensorError};
use crate::tensor::{Float, Tensor};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub learning_rate: Float,
    pub beta1: Float,
    pub beta2: Float,
    pub epsilon: Float,
    pub weight_decay: Float,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Moments {
    first: Float,
    second: Float,
}

/// Adam with bias correction and optional L2 weight decay.
///
/// Moment estimates live in one flat buffer covering every scalar of every
/// registered parameter, in registration order. `step` must be given the same
/// tensors in the same order each time.
pub struct Adam {
    pub learning_rate: Float,
    config: AdamConfig,
    lengths: Vec<usize>,
    moments: Vec<Moments>,
    t: u64,
}

impl Adam {
    pub fn new(parameters: &[&Tensor], config: AdamConfig) -> Self {
        let lengths: Vec<usize> = parameters.iter().map(|p| p.len()).collect();
        let total = lengths.iter().sum();
        Self {
            learning_rate: config.learning_rate,
            config,
            lengths,
            moments: vec![Moments::default(); total],
            t: 0,
        }
    }

    pub fn steps(&self) -> u64 {
        self.t
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    fn check_layout(&self, parameters: &[&mut Tensor]) -> Result<()> {
        let matches = parameters.len() == self.lengths.len()
            && parameters
                .iter()
                .zip(&self.lengths)
                .all(|(p, &len)| p.len() == len);
        if !matches {
            return Err(TensorError::ParameterLayout {
                expected: self.moments.len(),
                got: parameters.iter().map(|p| p.len()).sum(),
            });
        }
        Ok(())
    }

    /// Applies one update from the gradients currently held by `parameters`.
    /// Weight decay is folded into those gradients.
    pub fn step(&mut self, mut parameters: Vec<&mut Tensor>) -> Result<()> {
        self.check_layout(&parameters)?;
        self.t += 1;

        let AdamConfig {
            beta1,
            beta2,
            epsilon,
            weight_decay,
            ..
        } = self.config;
        let lr = self.learning_rate;
        let exponent = i32::try_from(self.t).unwrap_or(i32::MAX);
        let correction1 = 1.0 - beta1.powi(exponent);
        let correction2 = 1.0 - beta2.powi(exponent);

        let mut moments = self.moments.iter_mut();
        for param in parameters.iter_mut() {
            let (data, grad) = param.split_mut();
            for ((value, g), m) in data.iter_mut().zip(grad.iter_mut()).zip(&mut moments) {
                *g += weight_decay * *value;
                m.first = beta1 * m.first + (1.0 - beta1) * *g;
                m.second = beta2 * m.second + (1.0 - beta2) * *g * *g;
                let m_hat = m.first / correction1;
                let v_hat = m.second / correction2;
                *value -= lr * m_hat / (v_hat.sqrt() + epsilon);
            }
        }
        trace!(step = self.t, lr, "adam step");
        Ok(())
    }
}
