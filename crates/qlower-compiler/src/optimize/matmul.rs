//! MatMul rewrites.
//!
//! The backend has a batched matmul variant that treats the head axis as
//! batch (`hdim_is_batch`). Attention blocks usually wrap their matmuls in
//! `[0,2,1,3]` permutes to get the heads in front, and those permutes can
//! be absorbed into the variant instead. The transposed-left, plain-right
//! combination is not supported by the kernel, so rewrites that would
//! produce it are declined.

use qlower_core::{ElementKind, Graph, NodeId, Op, OpKind, TensorType, ValueId, permute};

use super::{SWAP_HEADS, adopt, defined_by, order_of, single_use, splice_after, weight_like};

/// Permute order that also transposes the last two axes.
const SWAP_AND_TRANSPOSE_TAIL: [i64; 2] = [3, 1];

#[derive(Debug, Clone, Copy)]
struct Flags {
    left_transpose: bool,
    right_transpose: bool,
    hdim_is_batch: bool,
}

fn flags(graph: &Graph, mm: NodeId) -> Option<Flags> {
    match graph.node(mm).op {
        Op::MatMul {
            left_transpose,
            right_transpose,
            hdim_is_batch,
            ..
        } => Some(Flags {
            left_transpose,
            right_transpose,
            hdim_is_batch,
        }),
        _ => None,
    }
}

fn set_flags(graph: &mut Graph, mm: NodeId, flags: Flags) {
    if let Op::MatMul {
        left_transpose,
        right_transpose,
        hdim_is_batch,
        ..
    } = &mut graph.node_mut(mm).op
    {
        *left_transpose = flags.left_transpose;
        *right_transpose = flags.right_transpose;
        *hdim_is_batch = flags.hdim_is_batch;
    }
}

/// `[0, 2, ..]` order of rank 4, the only kind of permute the head-batch
/// variant can absorb.
fn heads_first(order: &[i64]) -> bool {
    order.len() == 4 && order[0] == 0 && order[1] == 2
}

fn transposes_tail(order: &[i64]) -> bool {
    order[2..] == SWAP_AND_TRANSPOSE_TAIL
}

/// Folds permutes feeding a matmul into its head-batch form, then restores
/// the original output layout with a trailing `[0,2,1,3]` permute.
pub(super) fn absorb_permutes(graph: &mut Graph, mm: NodeId) -> bool {
    let Some(flags) = flags(graph, mm) else {
        return false;
    };
    let inputs = graph.inputs(mm);
    if inputs.len() < 2 || flags.hdim_is_batch {
        return false;
    }
    let (left, right) = (inputs[0], inputs[1]);
    if graph.repr(left).storage() == ElementKind::F32 {
        return false;
    }
    let out = graph.output(mm, 0);
    if graph.shape(out).len() != 4 {
        return false;
    }

    let l_weight = graph.is_weight(left);
    let r_weight = graph.is_weight(right);
    let l_permute = defined_by(graph, left, OpKind::Permute);
    let r_permute = defined_by(graph, right, OpKind::Permute);
    if (l_weight && r_weight) || (l_permute.is_none() && r_permute.is_none()) {
        return false;
    }

    let l_reshape = defined_by(graph, left, OpKind::Reshape);
    let absorbed = if l_weight || r_weight {
        absorb_with_weight(graph, mm, flags, l_weight)
    } else {
        match (l_permute, r_permute, l_reshape) {
            (Some(lp), Some(rp), _) => absorb_both(graph, mm, flags, lp, rp),
            (None, Some(rp), Some(reshape)) => absorb_reshaped_left(graph, mm, flags, reshape, rp),
            (None, Some(rp), None) => absorb_right(graph, mm, flags, left, rp),
            _ => false,
        }
    };
    if !absorbed {
        return false;
    }

    let original = graph.ty(out).clone();
    let swapped = permute::apply_order(&original.shape, &SWAP_HEADS);
    graph.set_shape(out, swapped);
    let name = format!("{}_permute", graph.node_name(mm));
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

/// Both operands are permutes.
fn absorb_both(graph: &mut Graph, mm: NodeId, flags: Flags, lp: NodeId, rp: NodeId) -> bool {
    if !single_use(graph, lp) || !single_use(graph, rp) {
        return false;
    }
    let (Some(l_order), Some(r_order)) = (order_of(graph, lp), order_of(graph, rp)) else {
        return false;
    };
    if !heads_first(&l_order) || !heads_first(&r_order) {
        return false;
    }
    let left_transpose = flags.left_transpose ^ transposes_tail(&l_order);
    let right_transpose = flags.right_transpose ^ transposes_tail(&r_order);
    if left_transpose && !right_transpose {
        return false;
    }

    set_flags(
        graph,
        mm,
        Flags {
            left_transpose,
            right_transpose,
            hdim_is_batch: true,
        },
    );
    let l_in = graph.input(lp, 0);
    let r_in = graph.input(rp, 0);
    graph.set_operand(mm, 0, l_in);
    graph.set_operand(mm, 1, r_in);
    graph.erase(lp);
    graph.erase(rp);
    true
}

/// Left operand is a reshape, right operand a permute. The reshape is
/// dropped when it keeps the rank, and otherwise kept (with its unit head
/// axis moved) when the contraction axes would not line up.
fn absorb_reshaped_left(
    graph: &mut Graph,
    mm: NodeId,
    flags: Flags,
    reshape: NodeId,
    rp: NodeId,
) -> bool {
    if !single_use(graph, reshape) || !single_use(graph, rp) {
        return false;
    }
    let Some(r_order) = order_of(graph, rp) else {
        return false;
    };
    let l_in = graph.input(reshape, 0);
    let r_in = graph.input(rp, 0);
    let l_in_shape = graph.shape(l_in).to_vec();
    let mut l_out_shape = graph.shape(graph.output(reshape, 0)).to_vec();
    let r_in_shape = graph.shape(r_in).to_vec();
    let r_shape = graph.shape(graph.output(rp, 0)).to_vec();
    if !heads_first(&r_order)
        || r_shape.len() != 4
        || l_out_shape.len() < 3
        || l_in_shape.len() < 2
        || r_in_shape.len() < 2
        || l_out_shape[1] != r_shape[1]
        || l_in_shape[1] != l_out_shape[2]
    {
        return false;
    }
    let right_transpose = flags.right_transpose ^ transposes_tail(&r_order);

    let mut remove_reshape = l_in_shape.len() == l_out_shape.len();
    let mut reshaped_to = None;
    let l_k = l_in_shape.len() - 1 - usize::from(flags.left_transpose);
    let r_k = r_in_shape.len() - 2 + usize::from(right_transpose);
    if l_in_shape[l_k] != r_in_shape[r_k] {
        if l_out_shape.len() != 4 || l_out_shape[2] != 1 {
            return false;
        }
        l_out_shape = vec![l_out_shape[0], 1, l_out_shape[1], l_out_shape[3]];
        reshaped_to = Some(l_out_shape.clone());
        remove_reshape = false;
    }

    // remaining batch axes must still broadcast
    let l_batch = if remove_reshape { &l_in_shape } else { &l_out_shape };
    if l_in_shape.len() > 2 && r_in_shape.len() > 2 {
        let batch_axes = l_batch.len().min(r_in_shape.len()) - 2;
        for i in 0..batch_axes {
            let ls = l_batch[l_batch.len() - 3 - i];
            let rs = r_in_shape[r_in_shape.len() - 3 - i];
            if !(ls == rs || ls == 1 || rs == 1) {
                return false;
            }
        }
    }

    set_flags(
        graph,
        mm,
        Flags {
            left_transpose: false,
            right_transpose,
            hdim_is_batch: true,
        },
    );
    if remove_reshape {
        graph.set_operand(mm, 0, l_in);
        graph.erase(reshape);
    } else if let Some(shape) = reshaped_to {
        let reshaped = graph.output(reshape, 0);
        graph.set_shape(reshaped, shape);
    }
    graph.set_operand(mm, 1, r_in);
    graph.erase(rp);
    true
}

/// Only the right operand is a permute; the left one gets an explicit
/// `[0,2,1,3]` permute so both sides agree on the head-batch layout.
fn absorb_right(graph: &mut Graph, mm: NodeId, flags: Flags, left: ValueId, rp: NodeId) -> bool {
    if !graph.has_one_use(left) || !single_use(graph, rp) {
        return false;
    }
    let Some(r_order) = order_of(graph, rp) else {
        return false;
    };
    let l_shape = graph.shape(left).to_vec();
    let r_shape = graph.shape(graph.output(rp, 0)).to_vec();
    if !heads_first(&r_order) || l_shape.len() != 4 || r_shape.len() != 4 || l_shape[1] != r_shape[1]
    {
        return false;
    }
    let right_transpose = flags.right_transpose ^ transposes_tail(&r_order);

    let ty = TensorType::new(
        permute::apply_order(&l_shape, &SWAP_HEADS),
        graph.repr(left),
    );
    let name = format!("{}_permute", graph.node_name(graph.producer(left)));
    let id = graph.insert_before(
        mm,
        name,
        Op::Permute {
            order: SWAP_HEADS.to_vec(),
        },
        &[left],
        vec![ty],
    );
    adopt(graph, id, mm);
    let permuted = graph.output(id, 0);

    set_flags(
        graph,
        mm,
        Flags {
            left_transpose: false,
            right_transpose,
            hdim_is_batch: true,
        },
    );
    let r_in = graph.input(rp, 0);
    graph.set_operand(mm, 0, permuted);
    graph.set_operand(mm, 1, r_in);
    graph.erase(rp);
    true
}

/// One operand is a constant, the other a permute. The constant is
/// permuted physically.
fn absorb_with_weight(graph: &mut Graph, mm: NodeId, flags: Flags, weight_left: bool) -> bool {
    let (w_slot, t_slot) = if weight_left { (0, 1) } else { (1, 0) };
    let weight = graph.input(mm, w_slot);
    let Some(trans) = defined_by(graph, graph.input(mm, t_slot), OpKind::Permute) else {
        return false;
    };
    if !graph.has_one_use(weight) || !single_use(graph, trans) {
        return false;
    }
    let Some(order) = order_of(graph, trans) else {
        return false;
    };
    if !heads_first(&order) {
        return false;
    }
    let mut left_transpose = flags.left_transpose;
    let mut right_transpose = flags.right_transpose;
    if transposes_tail(&order) {
        if weight_left {
            right_transpose = !right_transpose;
        } else {
            left_transpose = !left_transpose;
        }
    }
    if left_transpose && !right_transpose {
        return false;
    }

    let w_repr = graph.repr(weight);
    if !matches!(
        w_repr.storage(),
        ElementKind::I8 | ElementKind::U8 | ElementKind::F16 | ElementKind::Bf16
    ) {
        return false;
    }
    let w_shape = graph.shape(weight).to_vec();
    let Some(data) = graph.weight_data(weight) else {
        return false;
    };
    if w_shape.len() != 4 || data.len() != permute::num_elements(&w_shape) {
        return false;
    }
    let data = permute::permute_data(data, &w_shape, &SWAP_HEADS);

    let name = format!("{}_trans", graph.node_name(graph.producer(weight)));
    let fresh = weight_like(
        graph,
        mm,
        &name,
        permute::apply_order(&w_shape, &SWAP_HEADS),
        w_repr,
        data,
    );
    let t_in = graph.input(trans, 0);
    let old_weight = graph.producer(weight);
    graph.set_operand(mm, w_slot, fresh);
    graph.set_operand(mm, t_slot, t_in);
    set_flags(
        graph,
        mm,
        Flags {
            left_transpose,
            right_transpose,
            hdim_is_batch: true,
        },
    );
    graph.erase(trans);
    graph.erase(old_weight);
    true
}

/// Reshape that only inserts unit axes, e.g. `(1,N,K) -> (1,1,N,K)`.
fn is_unsqueeze(graph: &Graph, reshape: NodeId) -> bool {
    let input = graph.shape(graph.input(reshape, 0));
    let output = graph.shape(graph.output(reshape, 0));
    let non_unit = |shape: &[i64]| shape.iter().copied().filter(|&d| d != 1).collect::<Vec<_>>();
    output.len() > input.len() && non_unit(input) == non_unit(output)
}

/// Both operands come from unsqueeze-like reshapes of rank > 2 tensors;
/// the matmul reads the originals instead.
pub(super) fn remove_unsqueeze_reshapes(graph: &mut Graph, mm: NodeId) -> bool {
    let inputs = graph.inputs(mm);
    if inputs.len() < 2 {
        return false;
    }
    let (Some(left), Some(right)) = (
        defined_by(graph, inputs[0], OpKind::Reshape),
        defined_by(graph, inputs[1], OpKind::Reshape),
    ) else {
        return false;
    };
    if left == right || !single_use(graph, left) || !single_use(graph, right) {
        return false;
    }
    let l_in = graph.input(left, 0);
    let r_in = graph.input(right, 0);
    let rank = graph.shape(l_in).len();
    if rank != graph.shape(r_in).len() || rank <= 2 {
        return false;
    }
    if !is_unsqueeze(graph, left) || !is_unsqueeze(graph, right) {
        return false;
    }
    graph.set_operand(mm, 0, l_in);
    graph.set_operand(mm, 1, r_in);
    graph.erase(left);
    graph.erase(right);
    true
}

/// Sets `left_reuse` on every matmul: off when nothing else reads the
/// producer of the left operand. Returns how many matmuls were visited.
pub(super) fn annotate_left_reuse(graph: &mut Graph) -> usize {
    let matmuls: Vec<NodeId> = graph
        .order()
        .iter()
        .copied()
        .filter(|&id| graph.kind(id) == OpKind::MatMul)
        .collect();
    for &mm in &matmuls {
        let Some(&left) = graph.inputs(mm).first() else {
            continue;
        };
        let producer = graph.producer(left);
        let reads: usize = graph
            .outputs(producer)
            .iter()
            .map(|&out| graph.use_count(out))
            .sum();
        if let Op::MatMul { left_reuse, .. } = &mut graph.node_mut(mm).op {
            *left_reuse = reads != 1;
        }
    }
    matmuls.len()
}
