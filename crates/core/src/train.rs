use rand::Rng;
use tracing::info;

use crate::data::{batch_from_data, batch_from_labels, shuffled_indices, sliced_indices};
use crate::error::{Result, TensorError};
use crate::nn::{Adam, AdamConfig, CrossEntropyLoss, Model};
use crate::tensor::{Float, Tensor};

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub eval_batch_size: usize,
    /// Epochs without improvement before the learning rate is divided by 10.
    pub lr_patience: usize,
    /// Epochs without improvement before training stops.
    pub stop_patience: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 64,
            eval_batch_size: 512,
            lr_patience: 5,
            stop_patience: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    pub loss: Float,
    pub accuracy: Float,
    pub epoch: usize,
    pub batch: usize,
}

pub trait Callbacks {
    fn on_epoch_begin(&mut self, _epoch: usize) {}
    fn on_batch_end(&mut self, _epoch: usize, _batch: usize, _metrics: &Metrics) {}
    fn on_epoch_end(&mut self, _epoch: usize, _metrics: &Metrics) {}
}

/// Callbacks that do nothing.
impl Callbacks for () {}

/// Logs every `every`-th batch at info level.
pub struct LogProgress {
    pub every: usize,
}

impl Callbacks for LogProgress {
    fn on_batch_end(&mut self, epoch: usize, batch: usize, metrics: &Metrics) {
        if self.every > 0 && batch % self.every == 0 {
            info!(epoch, batch, loss = metrics.loss, accuracy = metrics.accuracy, "batch");
        }
    }
}

/// Fraction of rows of `logits` whose argmax equals the label.
pub fn accuracy(logits: &Tensor, labels: &Tensor) -> Result<Float> {
    let predicted = logits.argmax(-1)?;
    if predicted.len() != labels.len() {
        return Err(TensorError::ShapeMismatch {
            left: predicted.dims().into(),
            right: labels.dims().into(),
        });
    }
    if labels.is_empty() {
        return Ok(0.0);
    }
    let correct = predicted
        .data()
        .iter()
        .zip(labels.data())
        .filter(|(p, l)| p == l)
        .count();
    Ok(correct as Float / labels.len() as Float)
}

/// Mini-batch classifier training with cross-entropy and Adam.
pub struct Trainer {
    config: TrainConfig,
    optimizer: Adam,
    loss: CrossEntropyLoss,
}

impl Trainer {
    pub fn new(model: &Model, config: TrainConfig, adam: AdamConfig) -> Result<Self> {
        if config.batch_size == 0 || config.eval_batch_size == 0 {
            return Err(TensorError::InvalidConfig(
                "batch sizes must be positive".to_string(),
            ));
        }
        Ok(Self {
            optimizer: Adam::new(&model.parameter_tensors(), adam),
            config,
            loss: CrossEntropyLoss::new(),
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    /// One forward, backward and update. Returns `(loss, accuracy)`.
    pub fn train_step(
        &mut self,
        model: &mut Model,
        inputs: &mut Tensor,
        labels: &Tensor,
    ) -> Result<(Float, Float)> {
        let logits = model.forward(inputs)?;
        let loss = self.loss.forward(logits, labels)?;
        let acc = accuracy(logits, labels)?;

        model.zero_grad();
        self.loss.backward(model.output_mut()?)?;
        model.backward(inputs)?;
        self.optimizer.step(model.parameter_tensors_mut())?;
        Ok((loss, acc))
    }

    /// Runs over `data` in shuffled full batches; a trailing partial batch
    /// is skipped.
    pub fn train_epoch<R, C>(
        &mut self,
        model: &mut Model,
        data: &Tensor,
        labels: &Tensor,
        epoch: usize,
        rng: &mut R,
        callbacks: &mut C,
    ) -> Result<Metrics>
    where
        R: Rng + ?Sized,
        C: Callbacks + ?Sized,
    {
        callbacks.on_epoch_begin(epoch);
        let n = labels.len();
        let batch_size = self.config.batch_size;
        let batches = n / batch_size;
        let indices = shuffled_indices(n, rng);

        let (mut total_loss, mut total_acc) = (0.0, 0.0);
        for batch in 0..batches {
            let picked = sliced_indices(&indices, batch * batch_size, batch_size);
            let mut inputs = batch_from_data(data, picked)?;
            let targets = batch_from_labels(labels, picked)?;
            let (loss, acc) = self.train_step(model, &mut inputs, &targets)?;
            total_loss += loss;
            total_acc += acc;
            callbacks.on_batch_end(
                epoch,
                batch,
                &Metrics {
                    loss,
                    accuracy: acc,
                    epoch,
                    batch,
                },
            );
        }

        let divisor = batches.max(1) as Float;
        let metrics = Metrics {
            loss: total_loss / divisor,
            accuracy: total_acc / divisor,
            epoch,
            batch: batches.saturating_sub(1),
        };
        callbacks.on_epoch_end(epoch, &metrics);
        Ok(metrics)
    }

    /// Average loss and accuracy over `data`, weighted by batch length.
    pub fn evaluate(&mut self, model: &mut Model, data: &Tensor, labels: &Tensor) -> Result<Metrics> {
        let n = labels.len();
        let indices: Vec<usize> = (0..n).collect();
        let (mut total_loss, mut total_acc) = (0.0, 0.0);
        let mut batches = 0;
        for picked in indices.chunks(self.config.eval_batch_size) {
            let inputs = batch_from_data(data, picked)?;
            let targets = batch_from_labels(labels, picked)?;
            let logits = model.forward(&inputs)?;
            let weight = picked.len() as Float;
            total_loss += self.loss.forward(logits, &targets)? * weight;
            total_acc += accuracy(logits, &targets)? * weight;
            batches += 1;
        }
        let divisor = n.max(1) as Float;
        Ok(Metrics {
            loss: total_loss / divisor,
            accuracy: total_acc / divisor,
            epoch: 0,
            batch: batches,
        })
    }

    /// Trains for up to `config.epochs`, dividing the learning rate by 10
    /// after `lr_patience` epochs without a lower evaluation loss and
    /// stopping after `stop_patience`. Returns the evaluation metrics of
    /// every completed epoch.
    pub fn fit<R, C>(
        &mut self,
        model: &mut Model,
        train: (&Tensor, &Tensor),
        eval: (&Tensor, &Tensor),
        rng: &mut R,
        callbacks: &mut C,
    ) -> Result<Vec<Metrics>>
    where
        R: Rng + ?Sized,
        C: Callbacks + ?Sized,
    {
        let mut history = Vec::new();
        let mut previous = Float::INFINITY;
        let mut stale = 0;
        for epoch in 0..self.config.epochs {
            if stale > self.config.stop_patience {
                info!(epoch, "stopping early");
                break;
            } else if stale > self.config.lr_patience {
                self.optimizer.learning_rate /= 10.0;
                info!(epoch, lr = self.optimizer.learning_rate, "learning rate decayed");
            }

            let trained = self.train_epoch(model, train.0, train.1, epoch, rng, callbacks)?;
            let mut evaluated = self.evaluate(model, eval.0, eval.1)?;
            evaluated.epoch = epoch;

            stale = if evaluated.loss >= previous { stale + 1 } else { 0 };
            previous = evaluated.loss;
            info!(
                epoch,
                train_loss = trained.loss,
                train_accuracy = trained.accuracy,
                eval_loss = evaluated.loss,
                eval_accuracy = evaluated.accuracy,
                "epoch completed"
            );
            history.push(evaluated);
        }
        Ok(history)
    }
}
