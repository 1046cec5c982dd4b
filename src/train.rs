//! Epoch-level training and evaluation drivers.
//!
//! One training step runs strictly in sequence: reset gradients, forward the
//! batch, reduce to a scalar loss, backward, optimizer step. Nothing overlaps
//! the parameter update. Cancellation is cooperative and coarse: a stop flag
//! is honored between batches and between epochs, never mid-batch.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use thiserror::Error;

use crate::{
    dataloader::DataLoader,
    loss::{LossError, NllLoss},
    nn::{Module, NnError},
    ops::argmax,
    optim::Optim,
    var::Var,
};

/// Errors for the training drivers
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("dataset is empty, nothing to iterate over")]
    EmptyDataset,
    #[error(transparent)]
    Nn(#[from] NnError),
    #[error(transparent)]
    Loss(#[from] LossError),
}

/// Aggregate results of one pass over the dataset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    /// Sum of per-batch losses divided by the number of batches processed.
    pub avg_loss: f32,
    /// Fraction of samples whose arg-max prediction matched the label.
    pub accuracy: f32,
    pub n_batches: usize,
}

/// Options for [`fit`].
pub struct FitOptions {
    pub epochs: usize,
    /// Log every n-th epoch via `log::info!`; 0 disables logging.
    pub log_every: usize,
    /// Cooperative cancellation, checked at batch and epoch boundaries.
    pub stop: Option<Arc<AtomicBool>>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: 10,
            log_every: 1,
            stop: None,
        }
    }
}

/// Runs one training epoch: per batch, reset gradients, forward every sample,
/// compute the batch NLL loss, backward, and step the optimizer.
pub fn train_epoch(
    model: &mut impl Module,
    loader: &DataLoader,
    optim: &mut dyn Optim,
) -> Result<EpochStats, TrainError> {
    model.set_training(true);
    epoch_pass(model, loader, Some(optim), None)
}

/// Runs a forward-only pass in evaluation mode: dropout off and no graph
/// construction. Training mode is restored before returning.
pub fn evaluate(model: &mut impl Module, loader: &DataLoader) -> Result<EpochStats, TrainError> {
    model.set_training(false);
    let stats = epoch_pass(model, loader, None, None);
    model.set_training(true);
    stats
}

/// Trains for up to `opts.epochs` epochs, returning per-epoch statistics.
/// A raised stop flag ends the run at the next batch or epoch boundary; the
/// history gathered so far is still returned.
pub fn fit(
    model: &mut impl Module,
    loader: &DataLoader,
    optim: &mut dyn Optim,
    opts: &FitOptions,
) -> Result<Vec<EpochStats>, TrainError> {
    let mut history = Vec::with_capacity(opts.epochs);
    for epoch in 0..opts.epochs {
        if let Some(flag) = &opts.stop {
            if flag.load(Ordering::Relaxed) {
                log::info!("stop requested, ending training after {} epochs", epoch);
                break;
            }
        }
        model.set_training(true);
        let stats = epoch_pass(model, loader, Some(&mut *optim), opts.stop.as_deref())?;
        if opts.log_every > 0 && (epoch % opts.log_every == 0 || epoch + 1 == opts.epochs) {
            log::info!(
                "epoch {}: avg_loss {:.4}, accuracy {:.3}",
                epoch + 1,
                stats.avg_loss,
                stats.accuracy
            );
        }
        history.push(stats);
    }
    Ok(history)
}

fn epoch_pass(
    model: &impl Module,
    loader: &DataLoader,
    mut optim: Option<&mut dyn Optim>,
    stop: Option<&AtomicBool>,
) -> Result<EpochStats, TrainError> {
    if loader.is_empty() {
        return Err(TrainError::EmptyDataset);
    }

    let mut total_loss = 0.0;
    let mut n_batches = 0;
    let mut correct = 0;
    let mut seen = 0;

    for (batch, targets) in loader.iter() {
        if let Some(flag) = stop {
            if flag.load(Ordering::Relaxed) {
                break;
            }
        }
        if let Some(optim) = optim.as_deref_mut() {
            optim.zero_grad();
        }

        let mut log_probs: Vec<Vec<Var>> = Vec::with_capacity(batch.len());
        for sample in &batch {
            log_probs.push(model.forward(sample)?);
        }
        correct += log_probs
            .iter()
            .zip(targets.iter())
            .filter(|(sample, target)| argmax(sample.as_slice()) == **target)
            .count();
        seen += targets.len();

        let loss = NllLoss::call(&log_probs, &targets)?;
        if let Some(optim) = optim.as_deref_mut() {
            loss.backward();
            optim.step();
        }

        total_loss += loss.data();
        n_batches += 1;
    }

    // average over batches actually processed; an early stop before the
    // first batch reports zeros rather than dividing by zero
    let avg_loss = if n_batches > 0 {
        total_loss / n_batches as f32
    } else {
        0.0
    };
    let accuracy = if seen > 0 {
        correct as f32 / seen as f32
    } else {
        0.0
    };
    Ok(EpochStats {
        avg_loss,
        accuracy,
        n_batches,
    })
}
