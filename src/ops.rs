//! Operation registry: differentiable primitives and the composites built
//! from them.
//!
//! Each primitive carries its forward evaluation and a pure local-gradient
//! rule mapping the upstream gradient to per-operand contributions. Graph
//! construction goes through the explicit registry functions ([`add`],
//! [`mul`], ...); the `std::ops` impls on [`Var`] are thin sugar over the
//! same entry point.

use std::iter::Sum;
use std::ops::{Add, Div, Mul, Neg, Sub};

use thiserror::Error;

use crate::var::Var;

/// Errors raised by shape-checked composite operations.
#[derive(Debug, Error)]
pub enum OpError {
    #[error("{op}: length mismatch, lhs has {lhs} elements, rhs has {rhs}")]
    LengthMismatch {
        op: &'static str,
        lhs: usize,
        rhs: usize,
    },
    #[error("{op}: cannot multiply {lhs_rows}x{lhs_cols} by {rhs_rows}x{rhs_cols}")]
    DimMismatch {
        op: &'static str,
        lhs_rows: usize,
        lhs_cols: usize,
        rhs_rows: usize,
        rhs_cols: usize,
    },
    #[error("{op}: matrix rows have differing widths {widths:?}")]
    RaggedMatrix { op: &'static str, widths: Vec<usize> },
}

/// A differentiable primitive in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Pow,
    Exp,
    Ln,
    Relu,
    Sigmoid,
}

impl Op {
    pub fn n_operands(&self) -> usize {
        match self {
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Pow => 2,
            Op::Neg | Op::Exp | Op::Ln | Op::Relu | Op::Sigmoid => 1,
        }
    }

    /// Forward evaluation over raw payloads.
    pub(crate) fn eval(&self, x: &[f32]) -> f32 {
        match self {
            Op::Add => x[0] + x[1],
            Op::Sub => x[0] - x[1],
            Op::Mul => x[0] * x[1],
            Op::Div => x[0] / x[1],
            Op::Neg => -x[0],
            Op::Pow => x[0].powf(x[1]),
            Op::Exp => x[0].exp(),
            Op::Ln => x[0].ln(),
            Op::Relu => x[0].max(0.0),
            Op::Sigmoid => 1.0 / (1.0 + (-x[0]).exp()),
        }
    }

    /// Local-gradient rule: contribution to each operand given the operand
    /// payloads `x`, the output payload `y` and the upstream gradient `g`.
    /// Unary rules leave the second slot at zero.
    ///
    /// Conventions: ReLU uses subgradient 0 at the kink. Pow propagates to
    /// the base only, since d(a^b)/db needs ln(a) which is undefined for a
    /// non-positive base.
    pub(crate) fn local_grads(&self, x: &[f32], y: f32, g: f32) -> [f32; 2] {
        match self {
            Op::Add => [g, g],
            Op::Sub => [g, -g],
            Op::Mul => [x[1] * g, x[0] * g],
            Op::Div => [g / x[1], -x[0] * g / (x[1] * x[1])],
            Op::Neg => [-g, 0.0],
            Op::Pow => [x[1] * x[0].powf(x[1] - 1.0) * g, 0.0],
            Op::Exp => [y * g, 0.0],
            Op::Ln => [g / x[0], 0.0],
            Op::Relu => [if x[0] > 0.0 { g } else { 0.0 }, 0.0],
            Op::Sigmoid => [y * (1.0 - y) * g, 0.0],
        }
    }
}

/// Applies a primitive to its operands, extending the graph when any operand
/// is tracked. With only untracked operands the result folds to a fresh
/// constant, which is how evaluation-mode forward passes avoid building a
/// graph at all.
fn apply(op: Op, operands: &[&Var]) -> Var {
    debug_assert_eq!(operands.len(), op.n_operands());
    let inputs: Vec<f32> = operands.iter().map(|v| v.data()).collect();
    let data = op.eval(&inputs);
    if operands.iter().any(|v| v.requires_grad()) {
        Var::from_op(data, op, operands)
    } else {
        Var::constant(data)
    }
}

pub fn add(a: &Var, b: &Var) -> Var {
    apply(Op::Add, &[a, b])
}

pub fn sub(a: &Var, b: &Var) -> Var {
    apply(Op::Sub, &[a, b])
}

pub fn mul(a: &Var, b: &Var) -> Var {
    apply(Op::Mul, &[a, b])
}

pub fn div(a: &Var, b: &Var) -> Var {
    apply(Op::Div, &[a, b])
}

pub fn neg(a: &Var) -> Var {
    apply(Op::Neg, &[a])
}

pub fn pow(base: &Var, exponent: &Var) -> Var {
    apply(Op::Pow, &[base, exponent])
}

pub fn exp(x: &Var) -> Var {
    apply(Op::Exp, &[x])
}

pub fn ln(x: &Var) -> Var {
    apply(Op::Ln, &[x])
}

pub fn relu(x: &Var) -> Var {
    apply(Op::Relu, &[x])
}

pub fn sigmoid(x: &Var) -> Var {
    apply(Op::Sigmoid, &[x])
}

// Method sugar mirroring the registry
impl Var {
    pub fn pow(&self, exponent: &Var) -> Var {
        pow(self, exponent)
    }

    pub fn exp(&self) -> Var {
        exp(self)
    }

    pub fn ln(&self) -> Var {
        ln(self)
    }

    pub fn relu(&self) -> Var {
        relu(self)
    }

    pub fn sigmoid(&self) -> Var {
        sigmoid(self)
    }
}

impl Add for &Var {
    type Output = Var;

    fn add(self, other: &Var) -> Var {
        apply(Op::Add, &[self, other])
    }
}

impl Sub for &Var {
    type Output = Var;

    fn sub(self, other: &Var) -> Var {
        apply(Op::Sub, &[self, other])
    }
}

impl Mul for &Var {
    type Output = Var;

    fn mul(self, other: &Var) -> Var {
        apply(Op::Mul, &[self, other])
    }
}

impl Div for &Var {
    type Output = Var;

    fn div(self, other: &Var) -> Var {
        apply(Op::Div, &[self, other])
    }
}

impl Neg for &Var {
    type Output = Var;

    fn neg(self) -> Var {
        apply(Op::Neg, &[self])
    }
}

/// Convenience macro to implement operations on owned [`Var`]s
macro_rules! impl_arithmetic(
    ($trait:ident, $trait_method:ident, $operator:tt) => {
        impl $trait for Var {
            type Output = Self;

            fn $trait_method(self, other: Self) -> Self {
                &self $operator &other
            }
        }
    }
);
impl_arithmetic!(Add, add, +);
impl_arithmetic!(Sub, sub, -);
impl_arithmetic!(Mul, mul, *);
impl_arithmetic!(Div, div, /);

impl Sum for Var {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        // the fold seed must be untracked or every sum would pin a graph
        iter.fold(Var::constant(0.0), |acc, v| add(&acc, &v))
    }
}

/// Length-checked inner product.
pub fn dot(a: &[Var], b: &[Var]) -> Result<Var, OpError> {
    if a.len() != b.len() {
        return Err(OpError::LengthMismatch {
            op: "dot",
            lhs: a.len(),
            rhs: b.len(),
        });
    }
    Ok(a.iter().zip(b.iter()).map(|(x, y)| mul(x, y)).sum())
}

/// Matrix-vector product. `m` is row-major, every row must match `x`'s length.
pub fn matvec(m: &[Vec<Var>], x: &[Var]) -> Result<Vec<Var>, OpError> {
    if let Some(row) = m.iter().find(|row| row.len() != x.len()) {
        return Err(OpError::DimMismatch {
            op: "matvec",
            lhs_rows: m.len(),
            lhs_cols: row.len(),
            rhs_rows: x.len(),
            rhs_cols: 1,
        });
    }
    m.iter().map(|row| dot(row, x)).collect()
}

/// Matrix product of row-major matrices. Fails on ragged inputs or an inner
/// dimension mismatch, never silently broadcasts or truncates.
pub fn matmul(a: &[Vec<Var>], b: &[Vec<Var>]) -> Result<Vec<Vec<Var>>, OpError> {
    let a_cols = uniform_width("matmul", a)?;
    let b_cols = uniform_width("matmul", b)?;
    if a_cols != b.len() {
        return Err(OpError::DimMismatch {
            op: "matmul",
            lhs_rows: a.len(),
            lhs_cols: a_cols,
            rhs_rows: b.len(),
            rhs_cols: b_cols,
        });
    }
    let mut out = Vec::with_capacity(a.len());
    for row in a {
        let mut out_row = Vec::with_capacity(b_cols);
        for j in 0..b_cols {
            out_row.push(
                row.iter()
                    .zip(b.iter())
                    .map(|(a_it, b_row)| mul(a_it, &b_row[j]))
                    .sum(),
            );
        }
        out.push(out_row);
    }
    Ok(out)
}

fn uniform_width(op: &'static str, m: &[Vec<Var>]) -> Result<usize, OpError> {
    let width = m.first().map_or(0, |row| row.len());
    if m.iter().any(|row| row.len() != width) {
        return Err(OpError::RaggedMatrix {
            op,
            widths: m.iter().map(|row| row.len()).collect(),
        });
    }
    Ok(width)
}

/// Numerically stable log-softmax over a slice of logits.
///
/// Uses the shifted formulation `x_i - m - ln(sum_j exp(x_j - m))` with `m`
/// the row max, so large logits cannot overflow the exponential. The shift is
/// an untracked constant; log-softmax is shift-invariant, so the gradient is
/// unaffected.
pub fn log_softmax(xs: &[Var]) -> Vec<Var> {
    if xs.is_empty() {
        return Vec::new();
    }
    let max = xs.iter().map(Var::data).fold(f32::NEG_INFINITY, f32::max);
    let shift = Var::constant(max);
    let shifted: Vec<Var> = xs.iter().map(|x| sub(x, &shift)).collect();
    let norm = ln(&shifted.iter().map(Var::exp).sum::<Var>());
    shifted.iter().map(|s| sub(s, &norm)).collect()
}

/// Index of the largest payload; ties resolve to the first occurrence.
pub fn argmax(values: &[Var]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if v.data() > values[best].data() {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::assert_eq_float;

    #[test]
    fn test_add() {
        let a = Var::new(2.0);
        let b = Var::new(3.0);

        let c = &a + &b;
        assert_eq!(c.data(), 5.0);
        c.backward();

        // dc/da = 1
        // dc/db = 1
        assert_eq!(a.grad(), 1.0);
        assert_eq!(b.grad(), 1.0);
    }

    #[test]
    fn test_mul() {
        let a = Var::new(2.0);
        let b = Var::new(3.0);

        let c = &a * &b;
        assert_eq!(c.data(), 6.0);

        c.backward();

        // dc/da = b
        // dc/db = a
        assert_eq!(a.grad(), 3.0);
        assert_eq!(b.grad(), 2.0);
    }

    #[test]
    fn test_neg() {
        let a = Var::new(2.0);
        let b = -&a;
        assert_eq!(b.data(), -2.0);

        b.backward();

        assert_eq!(a.grad(), -1.0);
    }

    #[test]
    fn test_sub() {
        let a = Var::new(2.0);
        let b = Var::new(3.0);

        let c = &a - &b;
        assert_eq!(c.data(), -1.0);

        c.backward();

        // dc/da = 1
        // dc/db = -1
        assert_eq!(a.grad(), 1.0);
        assert_eq!(b.grad(), -1.0);
    }

    #[test]
    fn test_div() {
        let a = Var::new(2.0);
        let b = Var::new(3.0);

        let c = &a / &b;
        assert_eq_float!(c.data(), 2.0 / 3.0);

        c.backward();

        // dc/da = 1/b
        // dc/db = -a/b^2
        assert_eq_float!(a.grad(), 1.0 / 3.0);
        assert_eq_float!(b.grad(), -2.0 / 9.0);
    }

    #[test]
    fn test_pow() {
        let a = Var::new(2.0);
        let b = Var::new(3.0);
        let c = a.pow(&b);
        assert_eq_float!(c.data(), 8.0);

        c.backward();

        // dc/da = b * a^(b-1); the exponent gets no gradient by convention
        assert_eq_float!(a.grad(), 12.0);
        assert_eq!(b.grad(), 0.0);
    }

    #[test]
    fn test_relu() {
        let a = Var::new(1.0);
        let b = Var::new(2.0);
        let c = &a * &b;
        let z = c.relu();
        assert_eq_float!(z.data(), 2.0);

        z.backward();

        // dz/dc = 1
        // dc/da = b
        // dc/db = a
        assert_eq_float!(a.grad(), 2.0);
        assert_eq_float!(b.grad(), 1.0);
        assert_eq_float!(c.grad(), 1.0);
    }

    #[test]
    fn test_relu_subgradient_at_kink() {
        let a = Var::new(0.0);
        let z = a.relu();
        z.backward();
        assert_eq!(z.data(), 0.0);
        assert_eq!(a.grad(), 0.0);
    }

    #[test]
    fn test_exp_ln_sigmoid() {
        let a = Var::new(0.5);
        let b = a.exp();
        b.backward();
        assert_eq_float!(b.data(), 0.5f32.exp());
        assert_eq_float!(a.grad(), 0.5f32.exp());

        let c = Var::new(2.0);
        let d = c.ln();
        d.backward();
        assert_eq_float!(d.data(), 2.0f32.ln());
        assert_eq_float!(c.grad(), 0.5);

        let e = Var::new(0.0);
        let s = e.sigmoid();
        s.backward();
        assert_eq_float!(s.data(), 0.5);
        assert_eq_float!(e.grad(), 0.25);
    }

    /// Centered finite difference of a scalar function at `x`.
    fn numeric_grad(f: impl Fn(f32) -> f32, x: f32) -> f32 {
        let h = 1e-2;
        (f(x + h) - f(x - h)) / (2.0 * h)
    }

    fn gradcheck(op: Op, point: &[f32]) {
        let analytic = {
            let vars: Vec<Var> = point.iter().map(|&p| Var::new(p)).collect();
            let refs: Vec<&Var> = vars.iter().collect();
            let out = apply(op, &refs);
            out.backward();
            vars.iter().map(Var::grad).collect::<Vec<_>>()
        };
        for (idx, &analytic_grad) in analytic.iter().enumerate() {
            // Pow's exponent slot intentionally reports zero, skip it
            if op == Op::Pow && idx == 1 {
                continue;
            }
            let numeric = numeric_grad(
                |x| {
                    let mut shifted = point.to_vec();
                    shifted[idx] = x;
                    op.eval(&shifted)
                },
                point[idx],
            );
            assert_eq_float!(
                analytic_grad,
                numeric,
                5e-3 * (1.0 + numeric.abs())
            );
        }
    }

    #[test]
    fn test_gradcheck_primitives() {
        let mut rng = Pcg64Mcg::seed_from_u64(31);
        for _ in 0..8 {
            let a = rng.random_range(0.2..2.0f32);
            let b = rng.random_range(0.2..2.0f32);
            gradcheck(Op::Add, &[a, b]);
            gradcheck(Op::Sub, &[a, b]);
            gradcheck(Op::Mul, &[a, b]);
            gradcheck(Op::Div, &[a, b]);
            gradcheck(Op::Pow, &[a, b]);
            gradcheck(Op::Neg, &[a]);
            gradcheck(Op::Exp, &[a]);
            gradcheck(Op::Ln, &[a]);
            gradcheck(Op::Sigmoid, &[a]);
            // keep clear of the kink where the subgradient convention kicks in
            gradcheck(Op::Relu, &[a + 0.1]);
            gradcheck(Op::Relu, &[-a - 0.1]);
        }
    }

    #[test]
    fn test_log_softmax_values() {
        let xs = vec![Var::new(2.0), Var::new(1.0)];
        let lp = log_softmax(&xs);
        assert_eq!(lp.len(), 2);

        // probabilities recovered from log space sum to one
        let total: f32 = lp.iter().map(|v| v.data().exp()).sum();
        assert_eq_float!(total, 1.0);
        assert_eq_float!(lp[0].data().exp(), 0.7310586, 1e-5);
        assert_eq_float!(lp[1].data().exp(), 0.26894143, 1e-5);
    }

    #[test]
    fn test_log_softmax_is_overflow_safe() {
        let xs = vec![Var::new(1000.0), Var::new(999.0)];
        let lp = log_softmax(&xs);
        assert!(lp.iter().all(|v| v.data().is_finite()));
        assert_eq_float!(lp[0].data().exp() + lp[1].data().exp(), 1.0, 1e-5);
    }

    #[test]
    fn test_log_softmax_gradient() {
        // d lp_i / d x_k = delta_ik - softmax_k
        let xs = vec![Var::new(0.5), Var::new(-0.3), Var::new(1.2)];
        let lp = log_softmax(&xs);
        lp[0].backward();

        let softmax: Vec<f32> = lp.iter().map(|v| v.data().exp()).collect();
        assert_eq_float!(xs[0].grad(), 1.0 - softmax[0], 1e-5);
        assert_eq_float!(xs[1].grad(), -softmax[1], 1e-5);
        assert_eq_float!(xs[2].grad(), -softmax[2], 1e-5);
    }

    #[test]
    fn test_dot() {
        let a = vec![Var::new(1.0), Var::new(2.0)];
        let b = vec![Var::new(3.0), Var::new(4.0)];
        let d = dot(&a, &b).unwrap();
        assert_eq!(d.data(), 11.0);

        d.backward();
        assert_eq!(a[0].grad(), 3.0);
        assert_eq!(a[1].grad(), 4.0);
        assert_eq!(b[0].grad(), 1.0);
        assert_eq!(b[1].grad(), 2.0);
    }

    #[test]
    fn test_dot_length_mismatch() {
        let a = vec![Var::new(1.0)];
        let b = vec![Var::new(3.0), Var::new(4.0)];
        let err = dot(&a, &b).unwrap_err();
        assert!(matches!(
            err,
            OpError::LengthMismatch {
                op: "dot",
                lhs: 1,
                rhs: 2
            }
        ));
    }

    #[test]
    fn test_matmul() {
        let a = vec![
            vec![Var::new(1.0), Var::new(2.0)],
            vec![Var::new(3.0), Var::new(4.0)],
        ];
        let b = vec![
            vec![Var::new(5.0), Var::new(6.0)],
            vec![Var::new(7.0), Var::new(8.0)],
        ];
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c[0][0].data(), 19.0);
        assert_eq!(c[0][1].data(), 22.0);
        assert_eq!(c[1][0].data(), 43.0);
        assert_eq!(c[1][1].data(), 50.0);

        // d c[0][0] / d a[0][0] = b[0][0], and so on per the matmul rule
        c[0][0].backward();
        assert_eq!(a[0][0].grad(), 5.0);
        assert_eq!(a[0][1].grad(), 7.0);
        assert_eq!(b[0][0].grad(), 1.0);
        assert_eq!(b[1][0].grad(), 2.0);
    }

    #[test]
    fn test_matmul_inner_dim_mismatch() {
        let a = vec![vec![Var::new(1.0), Var::new(2.0)]];
        let b = vec![vec![Var::new(5.0)]];
        let err = matmul(&a, &b).unwrap_err();
        assert!(matches!(
            err,
            OpError::DimMismatch {
                op: "matmul",
                lhs_cols: 2,
                rhs_rows: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_matmul_rejects_ragged() {
        let a = vec![
            vec![Var::new(1.0), Var::new(2.0)],
            vec![Var::new(3.0)],
        ];
        let b = vec![vec![Var::new(5.0)], vec![Var::new(6.0)]];
        let err = matmul(&a, &b).unwrap_err();
        assert!(matches!(err, OpError::RaggedMatrix { op: "matmul", .. }));
    }

    #[test]
    fn test_argmax() {
        let xs = vec![Var::new(0.1), Var::new(2.0), Var::new(-1.0)];
        assert_eq!(argmax(&xs), 1);
    }
}
