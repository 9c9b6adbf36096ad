//! Permute rewrites.

use qlower_core::{Graph, NodeId, Op, OpKind, TensorType, permute};

use super::{
    SWAP_HEADS, adopt, defined_by, order_of, replace_weight, single_use, sole_user, splice_after,
};

/// Axis counts tried when normalizing two permutes to a common rank.
const FUSE_RANKS: std::ops::RangeInclusive<usize> = 2..=5;

/// A permute that only relocates unit axes is a reshape.
pub(super) fn to_reshape(graph: &mut Graph, node: NodeId) -> bool {
    let Some(order) = order_of(graph, node) else {
        return false;
    };
    let shape = graph.shape(graph.input(node, 0));
    if shape.len() != order.len() || !permute::moves_only_unit_axes(shape, &order) {
        return false;
    }
    graph.node_mut(node).op = Op::Reshape;
    true
}

/// `permute -> [reshape ->] permute` whose composition is the identity
/// order becomes nothing, or a single reshape when the shapes differ.
pub(super) fn fuse_chain(graph: &mut Graph, node: NodeId) -> bool {
    let Some(second_order) = order_of(graph, node) else {
        return false;
    };
    let mid = graph.input(node, 0);
    if !graph.has_one_use(mid) {
        return false;
    }
    let mut between = None;
    let mut source = mid;
    if let Some(reshape) = defined_by(graph, mid, OpKind::Reshape) {
        source = graph.input(reshape, 0);
        if !graph.has_one_use(source) {
            return false;
        }
        between = Some(reshape);
    }
    let Some(first) = defined_by(graph, source, OpKind::Permute) else {
        return false;
    };
    let Some(first_order) = order_of(graph, first) else {
        return false;
    };

    let origin = graph.input(first, 0);
    let in0_shape = graph.shape(origin).to_vec();
    let in1_shape = graph.shape(mid).to_vec();
    if in0_shape.len() != first_order.len() || in1_shape.len() != second_order.len() {
        return false;
    }
    let Some((in0_fix, order0_fix, in1_fix, order1_fix)) = FUSE_RANKS.clone().find_map(|rank| {
        let (s0, o0) = permute::reset(&in0_shape, &first_order, rank)?;
        let (s1, o1) = permute::reset(&in1_shape, &second_order, rank)?;
        Some((s0, o0, s1, o1))
    }) else {
        return false;
    };
    if permute::apply_order(&in0_fix, &order0_fix) != in1_fix {
        return false;
    }
    let rank = order0_fix.len();
    if !permute::is_identity(&permute::simulate(rank, &[&order0_fix, &order1_fix])) {
        return false;
    }

    let out = graph.output(node, 0);
    if graph.shape(out) == in0_shape.as_slice() {
        graph.replace_all_uses(out, origin);
    } else {
        let ty = graph.ty(out).clone();
        let name = format!("{}_reshape", graph.node_name(first));
        let id = graph.insert_before(node, name, Op::Reshape, &[origin], vec![ty]);
        adopt(graph, id, node);
        let reshaped = graph.output(id, 0);
        graph.replace_all_uses(out, reshaped);
    }
    graph.erase(node);
    if let Some(reshape) = between {
        graph.erase_if_dead(reshape);
    }
    graph.erase_if_dead(first);
    true
}

/// `[0,2,1,3]` permute of a `[1, 1, ..]` tensor feeding a reshape moves no
/// data, so the reshape can read the permute's input directly.
pub(super) fn fuse_into_reshape(graph: &mut Graph, node: NodeId) -> bool {
    if order_of(graph, node).as_deref() != Some(&SWAP_HEADS[..]) {
        return false;
    }
    let input = graph.input(node, 0);
    if !graph.has_one_use(input) {
        return false;
    }
    let Some(reshape) = sole_user(graph, node) else {
        return false;
    };
    if graph.kind(reshape) != OpKind::Reshape {
        return false;
    }
    if !graph.shape(input).starts_with(&[1, 1]) {
        return false;
    }
    graph.set_operand(reshape, 0, input);
    graph.erase(node);
    true
}

/// Two identically ordered permutes feeding an Add move after it.
pub(super) fn move_after_add(graph: &mut Graph, add: NodeId) -> bool {
    let &[lhs, rhs] = graph.inputs(add) else {
        return false;
    };
    let (Some(left), Some(right)) = (
        defined_by(graph, lhs, OpKind::Permute),
        defined_by(graph, rhs, OpKind::Permute),
    ) else {
        return false;
    };
    let (Some(order), Some(right_order)) = (order_of(graph, left), order_of(graph, right)) else {
        return false;
    };
    let l_in = graph.input(left, 0);
    let r_in = graph.input(right, 0);
    let l_shape = graph.shape(l_in).to_vec();
    let r_shape = graph.shape(r_in).to_vec();
    if l_shape.len() != r_shape.len() || order != right_order {
        return false;
    }

    let out = graph.output(add, 0);
    let original = graph.ty(out).clone();
    graph.set_operand(add, 0, l_in);
    graph.set_operand(add, 1, r_in);
    let shape: Vec<i64> = l_shape.iter().zip(&r_shape).map(|(&l, &r)| l.max(r)).collect();
    graph.set_shape(out, shape);
    graph.erase_if_dead(left);
    graph.erase_if_dead(right);

    let name = format!("{}_permute", graph.node_name(add));
    splice_after(graph, out, &name, Op::Permute { order }, original);
    true
}

/// `[0,2,1,3]` permute feeding an Add or Mul with a constant operand moves
/// after that op. The constant is permuted physically instead.
pub(super) fn reorder_weight(graph: &mut Graph, node: NodeId) -> bool {
    if order_of(graph, node).as_deref() != Some(&SWAP_HEADS[..]) {
        return false;
    }
    let Some(next) = sole_user(graph, node) else {
        return false;
    };
    if !single_use(graph, next) {
        return false;
    }
    let kind = graph.kind(next);
    if !matches!(kind, OpKind::Add | OpKind::Mul) {
        return false;
    }
    let &[lhs, weight] = graph.inputs(next) else {
        return false;
    };
    if lhs != graph.output(node, 0) || !graph.is_weight(weight) {
        return false;
    }
    let w_shape = graph.shape(weight).to_vec();
    if w_shape.len() != 4 {
        return false;
    }
    let swapped = permute::apply_order(&w_shape, &SWAP_HEADS);

    if kind == OpKind::Add {
        let Some(data) = graph.weight_data(weight) else {
            return false;
        };
        if data.len() != permute::num_elements(&w_shape) {
            return false;
        }
        let data = permute::permute_data(data, &w_shape, &SWAP_HEADS);
        replace_weight(graph, next, 1, "trans", swapped, data);
    } else {
        // a unit axis 1 swaps without moving data
        if w_shape[1] != 1 || !graph.has_one_use(weight) {
            return false;
        }
        graph.set_shape(weight, swapped);
    }

    let input = graph.input(node, 0);
    let out = graph.output(next, 0);
    let original: TensorType = graph.ty(out).clone();
    let unpermuted = graph.shape(input).to_vec();
    graph.set_shape(out, unpermuted);
    graph.set_operand(next, 0, input);
    graph.erase(node);

    let name = format!("{}_permute", graph.node_name(next));
    splice_after(
        graph,
        out,
        &name,
        Op::Permute {
            order: SWAP_HEADS.to_vec(),
        },
        original,
    );
    true
}
