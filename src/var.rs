//! Scalar graph nodes and the backward traversal engine.
//!
//! Every intermediate result of a forward pass is a [`Var`]: a cheaply
//! clonable handle to a node holding the payload, a gradient accumulator and
//! references to the operation inputs that produced it. Backward traversal
//! walks the node's ancestors in reverse topological order and folds this
//! pass's gradient flow into each node's accumulator.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    fmt::{self, Display},
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::ops::Op;

pub(crate) type SharedNode = Rc<RefCell<Node>>;

/// Newtype representing a shared scalar node in a computation graph.
#[derive(Debug, Clone)]
pub struct Var(pub(crate) SharedNode);

impl Var {
    /// Creates a tracked leaf. Gradients flow into it on backward traversal.
    pub fn new(data: f32) -> Self {
        Self(Rc::new(RefCell::new(Node::new(data, true, None))))
    }

    /// Creates an untracked leaf. It never accumulates gradient, and
    /// operations whose inputs are all untracked fold to fresh constants
    /// instead of extending the graph.
    pub fn constant(data: f32) -> Self {
        Self(Rc::new(RefCell::new(Node::new(data, false, None))))
    }

    /// Creates a learnable leaf. Same tracking behavior as [`Var::new`];
    /// layers use this to mark the values an optimizer will mutate.
    pub fn parameter(data: f32) -> Self {
        Self::new(data)
    }

    /// Creates a node derived from `operands` through `op`.
    pub(crate) fn from_op(data: f32, op: Op, operands: &[&Var]) -> Self {
        let node = Node {
            data,
            grad: 0.0,
            requires_grad: true,
            parents: operands.iter().map(|v| v.0.clone()).collect(),
            op: Some(op),
            id: next_id(),
        };
        Self(Rc::new(RefCell::new(node)))
    }

    pub fn data(&self) -> f32 {
        self.0.borrow().data
    }

    pub fn grad(&self) -> f32 {
        self.0.borrow().grad
    }

    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    pub(crate) fn id(&self) -> u64 {
        self.0.borrow().id
    }

    // Strictly, &mut isn't needed since the node is behind a shared mutable
    // type, but it indicates that the value should be exclusively mutable
    pub fn set_data(&mut self, data: f32) {
        self.0.borrow_mut().data = data;
    }

    /// Toggles gradient tracking for this node. Models untrack their
    /// parameters in evaluation mode so forward passes fold to constants.
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.0.borrow_mut().requires_grad = requires_grad;
    }

    /// Resets this node's gradient accumulator to zero. Optimizers call this
    /// on every managed parameter between steps.
    pub fn zero_grad(&mut self) {
        self.0.borrow_mut().grad = 0.0;
    }

    /// Backward traversal seeded with `d self / d self = 1`.
    ///
    /// Gradients accumulate additively: a second call without an intervening
    /// reset leaves every ancestor holding exactly double the single-call
    /// value. Use [`Var::zero_grad`] (or the optimizer's `zero_grad`) to
    /// start fresh.
    pub fn backward(&self) {
        self.backward_with(1.0);
    }

    /// Backward traversal from this node with an explicit seed gradient.
    ///
    /// A node with no tracked ancestors (e.g. any output computed in
    /// evaluation mode) has nothing to propagate to, so this is a no-op.
    pub fn backward_with(&self, seed: f32) {
        if !self.requires_grad() {
            return;
        }

        // post-order DFS over the tracked subgraph
        let mut order: Vec<SharedNode> = Vec::new();
        let mut visited: HashSet<u64> = HashSet::new();
        topo_visit(&self.0, &mut order, &mut visited);

        // The flow of this particular pass is kept separate from the
        // persistent accumulators. Propagating from the accumulators directly
        // would re-send gradient already delivered by earlier passes and break
        // the additive-accumulation contract for interior nodes.
        let mut flows: HashMap<u64, f32> = HashMap::new();
        flows.insert(self.id(), seed);

        for node in order.iter().rev() {
            let flow = {
                let id = node.borrow().id;
                match flows.get(&id) {
                    Some(flow) => *flow,
                    None => continue,
                }
            };
            node.borrow_mut().grad += flow;

            let (op, parents) = {
                let inner = node.borrow();
                (inner.op, inner.parents.clone())
            };
            let Some(op) = op else { continue };

            let inputs: Vec<f32> = parents.iter().map(|p| p.borrow().data).collect();
            let local = op.local_grads(&inputs, node.borrow().data, flow);
            for (parent, contribution) in parents.iter().zip(local) {
                let parent = parent.borrow();
                if parent.requires_grad {
                    *flows.entry(parent.id).or_insert(0.0) += contribution;
                }
            }
        }
    }
}

fn topo_visit(node: &SharedNode, order: &mut Vec<SharedNode>, visited: &mut HashSet<u64>) {
    if !visited.insert(node.borrow().id) {
        return;
    }
    for parent in node.borrow().parents.iter() {
        // untracked parents accumulate nothing and prune the walk
        if parent.borrow().requires_grad {
            topo_visit(parent, order, visited);
        }
    }
    order.push(node.clone());
}

// pretty print a node and its ancestors recursively in a JSON-like format
impl Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn fmt_node(var: &Var, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let inner = var.0.borrow();
            let pad = " ".repeat(indent);
            let pad_inner = " ".repeat(indent + 2);
            writeln!(f, "{}{{", pad)?;
            writeln!(f, "{}\"data\": {},", pad_inner, inner.data)?;
            writeln!(f, "{}\"grad\": {},", pad_inner, inner.grad)?;
            writeln!(f, "{}\"op\": {:?},", pad_inner, inner.op)?;
            writeln!(f, "{}\"inputs\": [", pad_inner)?;
            for (i, parent) in inner.parents.iter().enumerate() {
                fmt_node(&Var(parent.clone()), indent + 4, f)?;
                if i < inner.parents.len() - 1 {
                    writeln!(f, ",")?;
                } else {
                    writeln!(f)?;
                }
            }
            writeln!(f, "{}]", pad_inner)?;
            write!(f, "{}}}", pad)
        }
        fmt_node(self, 0, f)
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.0.borrow().data == other.0.borrow().data
    }
}

impl Eq for Var {}

// unfortunate that there isn't a blanket impl for AsRef<T> for T
// <https://doc.rust-lang.org/std/convert/trait.AsRef.html#reflexivity>
impl AsRef<Var> for Var {
    fn as_ref(&self) -> &Var {
        self
    }
}

#[derive(Debug)]
pub(crate) struct Node {
    // the network uses 32 bit precision floats (roughly 7 decimal digits)
    pub(crate) data: f32,
    /// Gradient of some downstream root with respect to this node,
    /// accumulated across backward passes until explicitly reset.
    pub(crate) grad: f32,
    /// Whether backward traversal accumulates into and descends through
    /// this node.
    pub(crate) requires_grad: bool,
    /// Inputs of the operation that produced this node.
    pub(crate) parents: Vec<SharedNode>,
    /// The operation that produced this node, `None` for leaves.
    pub(crate) op: Option<Op>,
    pub(crate) id: u64,
}

impl Node {
    fn new(data: f32, requires_grad: bool, op: Option<Op>) -> Self {
        Self {
            data,
            grad: 0.0,
            requires_grad,
            parents: vec![],
            op,
            id: next_id(),
        }
    }
}

fn next_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::ops;

    #[macro_export]
    macro_rules! assert_eq_float {
        ($a:expr, $b:expr) => {
            assert!(
                (($a) - ($b)).abs() < 1e-6,
                "{} != {} within 1e-6",
                $a,
                $b
            );
        };
        ($a:expr, $b:expr, $tol:expr) => {
            assert!(
                (($a) - ($b)).abs() < $tol,
                "{} != {} within {}",
                $a,
                $b,
                $tol
            );
        };
    }

    #[test]
    fn test_constant_inputs_fold() {
        let a = Var::constant(2.0);
        let b = Var::constant(3.0);
        let c = ops::mul(&a, &b);
        assert_eq!(c.data(), 6.0);
        // no graph was built
        assert!(!c.requires_grad());
        assert!(c.0.borrow().parents.is_empty());
    }

    #[test]
    fn test_tracked_input_extends_graph() {
        let a = Var::new(2.0);
        let b = Var::constant(3.0);
        let c = ops::mul(&a, &b);
        assert!(c.requires_grad());

        c.backward();
        assert_eq!(a.grad(), 3.0);
        // constants are pruned from the traversal
        assert_eq!(b.grad(), 0.0);
    }

    #[test]
    fn test_backward_on_untracked_root_is_noop() {
        let a = Var::constant(2.0);
        let b = Var::constant(3.0);
        let c = ops::add(&a, &b);
        c.backward();
        assert_eq!(a.grad(), 0.0);
        assert_eq!(b.grad(), 0.0);
        assert_eq!(c.grad(), 0.0);
    }

    #[test]
    fn test_seeded_backward_scales_flow() {
        let a = Var::new(2.0);
        let b = Var::new(3.0);
        let c = ops::mul(&a, &b);
        c.backward_with(2.0);
        assert_eq!(a.grad(), 6.0);
        assert_eq!(b.grad(), 4.0);
        assert_eq!(c.grad(), 2.0);
    }

    #[test]
    fn test_gradients_accumulate_additively() {
        // z = (x * w)^2 exercises a diamond: the mul result feeds both
        // operand slots of the square.
        let x = Var::new(3.0);
        let w = Var::new(2.0);
        let y = ops::mul(&x, &w);
        let z = ops::mul(&y, &y);

        z.backward();
        assert_eq_float!(z.grad(), 1.0);
        assert_eq_float!(y.grad(), 12.0); // 2 * y
        assert_eq_float!(x.grad(), 24.0); // 2 * y * w
        assert_eq_float!(w.grad(), 36.0); // 2 * y * x

        // second pass without reset doubles every accumulator exactly,
        // interior nodes included
        z.backward();
        assert_eq_float!(z.grad(), 2.0);
        assert_eq_float!(y.grad(), 24.0);
        assert_eq_float!(x.grad(), 48.0);
        assert_eq_float!(w.grad(), 72.0);
    }

    #[test]
    fn test_zero_grad_resets_accumulator() {
        let mut a = Var::new(2.0);
        let b = Var::new(3.0);
        let c = ops::mul(&a, &b);
        c.backward();
        c.backward();
        assert!(a.grad() != 0.0);

        a.zero_grad();
        assert_eq!(a.grad(), 0.0);

        // a fresh pass starts from a clean slate for the reset node
        c.backward();
        assert_eq_float!(a.grad(), 3.0);
    }

    #[test]
    fn test_shared_subexpression_accumulates_once_per_path() {
        // u = x + x should deliver gradient 2 to x in a single pass
        let x = Var::new(5.0);
        let u = ops::add(&x, &x);
        u.backward();
        assert_eq_float!(x.grad(), 2.0);
    }
}
