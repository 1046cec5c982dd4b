//! Loss functions

use thiserror::Error;

use crate::ops;
use crate::var::Var;

/// Errors for loss computation
#[derive(Debug, Error)]
pub enum LossError {
    #[error("batch size mismatch: {predictions} predictions but {targets} targets")]
    BatchSizeMismatch { predictions: usize, targets: usize },
    #[error("cannot reduce a loss over an empty batch")]
    EmptyBatch,
    #[error("class index {index} out of range for {classes} classes")]
    ClassOutOfRange { index: usize, classes: usize },
}

/// Negative log-likelihood over a batch of log-probability vectors and
/// integer class labels: the negative mean of each sample's log-probability
/// at its target index. Pairs with a log-softmax output head to form
/// cross-entropy.
pub struct NllLoss;

impl NllLoss {
    pub fn call(log_probs: &[Vec<Var>], targets: &[usize]) -> Result<Var, LossError> {
        if log_probs.len() != targets.len() {
            return Err(LossError::BatchSizeMismatch {
                predictions: log_probs.len(),
                targets: targets.len(),
            });
        }
        if log_probs.is_empty() {
            return Err(LossError::EmptyBatch);
        }
        let mut picked = Vec::with_capacity(targets.len());
        for (sample, &target) in log_probs.iter().zip(targets) {
            if target >= sample.len() {
                return Err(LossError::ClassOutOfRange {
                    index: target,
                    classes: sample.len(),
                });
            }
            picked.push(sample[target].clone());
        }
        let total = picked.into_iter().sum::<Var>();
        let n = Var::constant(targets.len() as f32);
        Ok(ops::neg(&ops::div(&total, &n)))
    }
}

/// Mean Squared Error Loss between two vectors of values
pub struct MseLoss;

impl MseLoss {
    pub fn call<T, U>(y_pred: &[T], y_true: &[U]) -> Var
    where
        T: AsRef<Var>,
        U: AsRef<Var>,
    {
        let two = Var::constant(2.0);
        let loss = y_pred
            .iter()
            .zip(y_true.iter())
            .map(|(a, b)| ops::sub(a.as_ref(), b.as_ref()).pow(&two))
            .sum::<Var>();
        ops::div(&loss, &Var::constant(y_pred.len() as f32))
    }
}
