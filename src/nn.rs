//! Components to build a feed-forward classifier.

use std::sync::atomic::{self, AtomicUsize};

use rand::Rng;
use rand_distr::{Distribution, Uniform};
use thiserror::Error;

use crate::checkpoint::ArchSpec;
use crate::ops::{self, OpError};
use crate::var::Var;

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NnError {
    #[error("input size mismatch: layer expects {expected} features, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error("dropout probability must lie in [0, 1], got {p}")]
    InvalidDropout { p: f32 },
    #[error("layer widths must be nonzero")]
    ZeroWidth,
    #[error(transparent)]
    Op(#[from] OpError),
}

/// Common interface for networks and layers. Mirrors the role of
/// torch.nn.Module.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Module {
    fn forward(&self, inputs: &[Var]) -> Result<Vec<Var>, NnError>;

    fn parameters(&self) -> Vec<Var>;

    fn zero_grad(&mut self) {
        for mut p in self.parameters() {
            p.zero_grad();
        }
    }

    /// Training-mode toggle, held per instance rather than as process-wide
    /// state. Implementations that distinguish the modes (dropout, gradient
    /// tracking) override both methods.
    fn set_training(&mut self, _training: bool) {}

    fn training(&self) -> bool {
        true
    }
}

/// A fully-connected layer computing `W x + b`.
///
/// Weights are stored row-major as `[out_features][in_features]`: one row of
/// input-width weights per output unit.
pub struct Linear {
    weights: Vec<Vec<Var>>,
    bias: Vec<Var>,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Creates a layer with weights drawn uniformly from ±1/sqrt(in_features)
    /// and a zero bias. The bounded, input-width-scaled draw keeps activation
    /// magnitudes stable through deep stacks.
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self::with_rng(in_features, out_features, &mut rand::rng())
    }

    /// Same as [`Linear::new`] with a caller-supplied generator, for
    /// reproducible initialization.
    pub fn with_rng<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        let uniform = Uniform::new(-bound, bound).unwrap();
        let weights = (0..out_features)
            .map(|_| {
                (0..in_features)
                    .map(|_| Var::parameter(uniform.sample(rng)))
                    .collect()
            })
            .collect();
        let bias = (0..out_features).map(|_| Var::parameter(0.0)).collect();
        Self {
            weights,
            bias,
            in_features,
            out_features,
        }
    }

    /// Rebuilds a layer from raw payloads. The caller has already validated
    /// the shapes against the architecture.
    pub(crate) fn from_parts(weights: Vec<Vec<f32>>, bias: Vec<f32>) -> Self {
        let in_features = weights.first().map_or(0, |row| row.len());
        let out_features = bias.len();
        Self {
            weights: weights
                .into_iter()
                .map(|row| row.into_iter().map(Var::parameter).collect())
                .collect(),
            bias: bias.into_iter().map(Var::parameter).collect(),
            in_features,
            out_features,
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Row-major flattened weight payloads.
    pub(crate) fn weight_data(&self) -> Vec<f32> {
        self.weights
            .iter()
            .flat_map(|row| row.iter().map(Var::data))
            .collect()
    }

    pub(crate) fn bias_data(&self) -> Vec<f32> {
        self.bias.iter().map(Var::data).collect()
    }

    /// Overwrites parameter payloads in place, keeping node identities (and
    /// thus any optimizer's handles) intact.
    pub(crate) fn load_values(&mut self, weight: &[f32], bias: &[f32]) {
        debug_assert_eq!(weight.len(), self.in_features * self.out_features);
        debug_assert_eq!(bias.len(), self.out_features);
        for (row_idx, row) in self.weights.iter_mut().enumerate() {
            for (col_idx, w) in row.iter_mut().enumerate() {
                w.set_data(weight[row_idx * self.in_features + col_idx]);
            }
        }
        for (b, &value) in self.bias.iter_mut().zip(bias) {
            b.set_data(value);
        }
    }

    pub fn parameters(&self) -> Vec<Var> {
        self.weights
            .iter()
            .flatten()
            .chain(self.bias.iter())
            .cloned()
            .collect()
    }

    /// Computes the forward pass for one sample.
    pub fn forward(&self, inputs: &[Var]) -> Result<Vec<Var>, NnError> {
        if inputs.len() != self.in_features {
            return Err(NnError::InputSizeMismatch {
                expected: self.in_features,
                got: inputs.len(),
            });
        }
        let pre = ops::matvec(&self.weights, inputs)?;
        let outputs: Vec<Var> = pre
            .iter()
            .zip(self.bias.iter())
            .map(|(p, b)| ops::add(p, b))
            .collect();
        let n_nonfinite = outputs.iter().filter(|v| !v.data().is_finite()).count();
        if n_nonfinite > 0 {
            log::warn!(
                "linear {}x{} produced {} non-finite activations",
                self.in_features,
                self.out_features,
                n_nonfinite
            );
        }
        Ok(outputs)
    }
}

/// Applies ReLU to a set of values, works for arbitrary number of inputs
#[derive(Default)]
pub struct ReLU {
    n_dead_units: AtomicUsize,
}

impl ReLU {
    pub fn new() -> Self {
        Self {
            n_dead_units: AtomicUsize::new(0),
        }
    }

    /// Takes the element-wise ReLU of the input values
    pub fn forward(&self, inputs: &[Var]) -> Vec<Var> {
        let n_dead = inputs.iter().filter(|v| v.data() <= 0.0).count();
        self.n_dead_units.store(n_dead, atomic::Ordering::Relaxed);
        inputs.iter().map(|v| v.relu()).collect()
    }

    /// Returns the number of dead units in the layer (used for debugging)
    pub fn n_dead_units(&self) -> usize {
        self.n_dead_units.load(atomic::Ordering::Relaxed)
    }
}

/// Inverted dropout: in training mode each activation is independently
/// zeroed with probability `p` and survivors are rescaled by 1/(1-p) so the
/// expected magnitude is unchanged; in evaluation mode inputs pass through.
pub struct Dropout {
    p: f32,
    training: bool,
}

impl Dropout {
    pub fn new(p: f32) -> Result<Self, NnError> {
        if !(0.0..=1.0).contains(&p) {
            return Err(NnError::InvalidDropout { p });
        }
        Ok(Self { p, training: true })
    }

    pub fn p(&self) -> f32 {
        self.p
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn forward(&self, inputs: &[Var]) -> Vec<Var> {
        if !self.training || self.p == 0.0 {
            return inputs.to_vec();
        }
        if self.p == 1.0 {
            return inputs.iter().map(|_| Var::constant(0.0)).collect();
        }
        let scale = Var::constant(1.0 / (1.0 - self.p));
        let mut rng = rand::rng();
        inputs
            .iter()
            .map(|v| {
                if rng.random::<f32>() < self.p {
                    Var::constant(0.0)
                } else {
                    ops::mul(v, &scale)
                }
            })
            .collect()
    }
}

struct Block {
    linear: Linear,
    relu: ReLU,
    dropout: Dropout,
}

/// A feed-forward classifier: hidden Linear -> ReLU -> Dropout blocks and a
/// final linear layer whose outputs pass through log-softmax, so the forward
/// pass yields log-probabilities.
pub struct Mlp {
    blocks: Vec<Block>,
    head: Linear,
    arch: ArchSpec,
    training: bool,
}

impl Mlp {
    pub fn new(
        input: usize,
        hidden: &[usize],
        output: usize,
        dropout: f32,
    ) -> Result<Self, NnError> {
        Self::with_rng(input, hidden, output, dropout, &mut rand::rng())
    }

    /// Builds the model with a caller-supplied generator so initialization is
    /// reproducible under a fixed seed.
    pub fn with_rng<R: Rng + ?Sized>(
        input: usize,
        hidden: &[usize],
        output: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Result<Self, NnError> {
        if input == 0 || output == 0 || hidden.contains(&0) {
            return Err(NnError::ZeroWidth);
        }
        let mut blocks = Vec::with_capacity(hidden.len());
        let mut width = input;
        for &units in hidden {
            blocks.push(Block {
                linear: Linear::with_rng(width, units, rng),
                relu: ReLU::new(),
                dropout: Dropout::new(dropout)?,
            });
            width = units;
        }
        let head = Linear::with_rng(width, output, rng);
        Ok(Self {
            blocks,
            head,
            arch: ArchSpec {
                input,
                hidden: hidden.to_vec(),
                output,
                dropout,
            },
            training: true,
        })
    }

    /// The model's shape signature.
    pub fn arch(&self) -> &ArchSpec {
        &self.arch
    }

    /// All linear layers in forward order, the output head last.
    pub(crate) fn layers(&self) -> impl Iterator<Item = &Linear> {
        self.blocks
            .iter()
            .map(|b| &b.linear)
            .chain(std::iter::once(&self.head))
    }

    pub(crate) fn layers_mut(&mut self) -> impl Iterator<Item = &mut Linear> {
        self.blocks
            .iter_mut()
            .map(|b| &mut b.linear)
            .chain(std::iter::once(&mut self.head))
    }

    /// Total dead ReLU units seen in the most recent forward pass.
    pub fn n_dead_units(&self) -> usize {
        self.blocks.iter().map(|b| b.relu.n_dead_units()).sum()
    }
}

impl Module for Mlp {
    fn forward(&self, inputs: &[Var]) -> Result<Vec<Var>, NnError> {
        let mut activations = inputs.to_vec();
        for block in &self.blocks {
            activations = block
                .dropout
                .forward(&block.relu.forward(&block.linear.forward(&activations)?));
        }
        Ok(ops::log_softmax(&self.head.forward(&activations)?))
    }

    fn parameters(&self) -> Vec<Var> {
        self.layers().flat_map(Linear::parameters).collect()
    }

    /// Besides toggling dropout, leaving training mode untracks every
    /// parameter so evaluation forward passes fold to constants and build no
    /// graph. Re-entering training mode restores tracking.
    fn set_training(&mut self, training: bool) {
        self.training = training;
        for block in &mut self.blocks {
            block.dropout.set_training(training);
        }
        for mut param in self.parameters() {
            param.set_requires_grad(training);
        }
    }

    fn training(&self) -> bool {
        self.training
    }
}
