//! Reshape rewrites.
//!
//! The backend prefers 4D tensors. Attention code often flattens
//! `(n, c, h, w)` into `(n * c, h, w)` around an op and unflattens right
//! after; [`reorder`] pushes the flattening reshape past the op so that
//! the pair meets and cancels.

use qlower_core::{Graph, NodeId, Op, OpKind};

use super::{defined_by, single_use, sole_user, splice_after};

/// `(n, c, h, w) -> (n * c, h, w)`.
fn flattens_leading(from: &[i64], to: &[i64]) -> bool {
    from.len() == 4 && to.len() == 3 && to[0] == from[0] * from[1] && to[1] == from[2] && to[2] == from[3]
}

/// Pushes a flattening reshape past its single consumer, or cancels it
/// against an inverse reshape.
pub(super) fn reorder(graph: &mut Graph, reshape: NodeId) -> bool {
    let Some(next) = sole_user(graph, reshape) else {
        return false;
    };
    match graph.kind(next) {
        OpKind::MatMul => reorder_matmul(graph, reshape, next),
        OpKind::MulConst | OpKind::Cast | OpKind::Softmax => reorder_unary(graph, reshape, next),
        OpKind::Reshape => cancel_inverse(graph, reshape, next),
        _ => false,
    }
}

/// Both matmul operands are flattening reshapes of matching batch axes.
fn reorder_matmul(graph: &mut Graph, reshape: NodeId, mm: NodeId) -> bool {
    let inputs = graph.inputs(mm);
    if inputs.len() < 2 || inputs[0] != graph.output(reshape, 0) {
        return false;
    }
    let Some(right) = defined_by(graph, inputs[1], OpKind::Reshape) else {
        return false;
    };
    if right == reshape || !single_use(graph, right) {
        return false;
    }
    let l_in = graph.input(reshape, 0);
    let r_in = graph.input(right, 0);
    let l_from = graph.shape(l_in).to_vec();
    let r_from = graph.shape(r_in).to_vec();
    if !flattens_leading(&l_from, graph.shape(graph.output(reshape, 0)))
        || !flattens_leading(&r_from, graph.shape(graph.output(right, 0)))
        || l_from[..2] != r_from[..2]
    {
        return false;
    }
    let out = graph.output(mm, 0);
    let o_shape = graph.shape(out).to_vec();
    if o_shape.len() != 3 {
        return false;
    }

    let original = graph.ty(out).clone();
    graph.set_operand(mm, 0, l_in);
    graph.set_operand(mm, 1, r_in);
    graph.erase(reshape);
    graph.erase(right);
    graph.set_shape(out, vec![l_from[0], l_from[1], o_shape[1], o_shape[2]]);
    let name = format!("{}_reshape", graph.node_name(mm));
    splice_after(graph, out, &name, Op::Reshape, original);
    true
}

/// Flattening reshape into an elementwise op; a softmax over `h` keeps its
/// axis by moving from 2 to 3.
fn reorder_unary(graph: &mut Graph, reshape: NodeId, next: NodeId) -> bool {
    let input = graph.input(reshape, 0);
    let from = graph.shape(input).to_vec();
    if !flattens_leading(&from, graph.shape(graph.output(reshape, 0))) {
        return false;
    }
    if let Op::Softmax { axis } = graph.node(next).op
        && axis != 2
    {
        return false;
    }
    if graph.inputs(next).len() != 1 {
        return false;
    }

    let out = graph.output(next, 0);
    let original = graph.ty(out).clone();
    graph.set_operand(next, 0, input);
    graph.erase(reshape);
    graph.set_shape(out, from);
    if let Op::Softmax { axis } = &mut graph.node_mut(next).op {
        *axis = 3;
    }
    let name = format!("{}_reshape", graph.node_name(next));
    splice_after(graph, out, &name, Op::Reshape, original);
    true
}

/// `reshape -> reshape` that lands back on the original shape.
fn cancel_inverse(graph: &mut Graph, reshape: NodeId, next: NodeId) -> bool {
    let input = graph.input(reshape, 0);
    let out = graph.output(next, 0);
    if graph.shape(input) != graph.shape(out) {
        return false;
    }
    graph.replace_all_uses(out, input);
    graph.erase(next);
    graph.erase(reshape);
    true
}

/// `reshape(reshape(x))` reads `x` directly.
pub(super) fn fuse_repeat(graph: &mut Graph, reshape: NodeId) -> bool {
    let Some(inner) = defined_by(graph, graph.input(reshape, 0), OpKind::Reshape) else {
        return false;
    };
    if !single_use(graph, inner) {
        return false;
    }
    let source = graph.input(inner, 0);
    graph.set_operand(reshape, 0, source);
    graph.erase(inner);
    true
}

/// Reshape to the shape it already has.
pub(super) fn remove_identity(graph: &mut Graph, reshape: NodeId) -> bool {
    let input = graph.input(reshape, 0);
    let out = graph.output(reshape, 0);
    if graph.shape(input) != graph.shape(out) {
        return false;
    }
    graph.replace_all_uses(out, input);
    graph.erase(reshape);
    true
}

/// Two reshapes with equal input shapes and equal output shapes feeding an
/// Add move after it.
pub(super) fn move_after_add(graph: &mut Graph, add: NodeId) -> bool {
    let &[lhs, rhs] = graph.inputs(add) else {
        return false;
    };
    let (Some(left), Some(right)) = (
        defined_by(graph, lhs, OpKind::Reshape),
        defined_by(graph, rhs, OpKind::Reshape),
    ) else {
        return false;
    };
    let l_in = graph.input(left, 0);
    let r_in = graph.input(right, 0);
    if graph.shape(l_in) != graph.shape(r_in) || graph.shape(lhs) != graph.shape(rhs) {
        return false;
    }

    let out = graph.output(add, 0);
    let original = graph.ty(out).clone();
    let shape = graph.shape(l_in).to_vec();
    graph.set_operand(add, 0, l_in);
    graph.set_operand(add, 1, r_in);
    graph.set_shape(out, shape);
    graph.erase_if_dead(left);
    graph.erase_if_dead(right);

    let name = format!("{}_reshape", graph.node_name(add));
    splice_after(graph, out, &name, Op::Reshape, original);
    true
}

#[cfg(test)]
mod tests {
    use super::flattens_leading;

    #[test]
    fn flattening_detection() {
        assert!(flattens_leading(&[2, 3, 4, 5], &[6, 4, 5]));
        assert!(!flattens_leading(&[2, 3, 4, 5], &[2, 12, 5]));
        assert!(!flattens_leading(&[6, 4, 5], &[6, 4, 5]));
    }
}
