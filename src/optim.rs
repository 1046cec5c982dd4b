//! Optimizers

use crate::var::Var;

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
///
/// Calling [`Optim::step`] before any backward pass has populated gradients
/// is a no-op: with all-zero gradients neither update rule moves a parameter.
pub trait Optim {
    /// Performs a single optimization step with accumulated gradients
    fn step(&mut self);
    /// Zeros gradients for all parameters
    fn zero_grad(&mut self);
}

/// SGD with momentum
pub struct Sgd {
    params: Vec<Var>,
    // currently does not change the learning rate based on the iteration
    // ideally lr would decay over time
    lr: f32,
    momentum: f32,
    // velocity per parameter
    velocity: Vec<f32>,
}

impl Sgd {
    pub fn new(params: Vec<Var>, lr: f32, momentum: f32) -> Self {
        let velocity = vec![0.0; params.len()];
        Self {
            params,
            lr,
            momentum,
            velocity,
        }
    }

    #[cfg(test)]
    fn velocities(&self) -> &[f32] {
        &self.velocity
    }
}

impl Optim for Sgd {
    fn step(&mut self) {
        for (idx, param) in self.params.iter_mut().enumerate() {
            // SGD with momentum
            let velocity = self.momentum * self.velocity[idx] - self.lr * param.grad();
            let new_val = param.data() + velocity;
            self.velocity[idx] = velocity;
            param.set_data(new_val);
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }
}

/// Adam with bias-corrected first and second moment estimates
pub struct Adam {
    params: Vec<Var>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    first_moment: Vec<f32>,
    second_moment: Vec<f32>,
    step_count: u32,
}

impl Adam {
    pub fn new(params: Vec<Var>, lr: f32, beta1: f32, beta2: f32, eps: f32) -> Self {
        let n = params.len();
        Self {
            params,
            lr,
            beta1,
            beta2,
            eps,
            first_moment: vec![0.0; n],
            second_moment: vec![0.0; n],
            step_count: 0,
        }
    }

    /// Standard defaults: beta1 = 0.9, beta2 = 0.999, eps = 1e-8.
    pub fn with_defaults(params: Vec<Var>, lr: f32) -> Self {
        Self::new(params, lr, 0.9, 0.999, 1e-8)
    }
}

impl Optim for Adam {
    fn step(&mut self) {
        self.step_count += 1;
        let correction1 = 1.0 - self.beta1.powi(self.step_count as i32);
        let correction2 = 1.0 - self.beta2.powi(self.step_count as i32);
        for (idx, param) in self.params.iter_mut().enumerate() {
            let grad = param.grad();
            let m = self.beta1 * self.first_moment[idx] + (1.0 - self.beta1) * grad;
            let v = self.beta2 * self.second_moment[idx] + (1.0 - self.beta2) * grad * grad;
            self.first_moment[idx] = m;
            self.second_moment[idx] = v;
            let m_hat = m / correction1;
            let v_hat = v / correction2;
            let new_val = param.data() - self.lr * m_hat / (v_hat.sqrt() + self.eps);
            param.set_data(new_val);
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }
}
