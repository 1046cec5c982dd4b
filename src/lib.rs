//! A minimal scalar reverse-mode autodiff engine and feed-forward network
//! trainer with a PyTorch-like API.
//!
//! Forward evaluation through the [`ops`] registry implicitly builds a
//! computation graph of [`var::Var`] nodes; [`var::Var::backward`] walks it
//! in reverse topological order, accumulating gradients that optimizers in
//! [`optim`] then consume. The [`nn`], [`loss`], [`train`] and [`checkpoint`]
//! modules build a small multiclass-classification stack on top.

pub mod checkpoint;
pub mod dataloader;
pub mod datasets;
pub mod loss;
pub mod nn;
pub mod ops;
pub mod optim;
pub mod train;
pub mod var;
