//! Index coefficients for gather/scatter by index.
//!
//! The backend kernel only walks the innermost axis by itself. For any
//! other axis it needs, per index element, the linear input offset of that
//! element with the indexed axis zeroed out. That table is computed here
//! and attached as an extra constant operand.

use qlower_core::{Graph, NodeId, Op, Representation, permute};

use super::weight_like;

/// Index ranks the kernel supports.
const MAX_INDEX_RANK: usize = 8;

pub(super) fn attach_index_coeff(graph: &mut Graph, node: NodeId) -> bool {
    // coefficients go after every regular operand
    let (axis, coeff_slot) = match graph.node(node).op {
        Op::GatherElements { axis } => (axis, 2),
        Op::ScatterElements { axis } => (axis, 3),
        _ => return false,
    };
    let inputs = graph.inputs(node);
    if inputs.len() < coeff_slot {
        return false;
    }
    if let Some(&coeff) = inputs.get(coeff_slot)
        && !graph.is_none(coeff)
    {
        return false;
    }
    let (input, indices) = (inputs[0], inputs[1]);
    let idx_shape = graph.shape(indices).to_vec();
    let in_shape = graph.shape(input).to_vec();
    let rank = idx_shape.len();
    let axis = if axis < 0 { axis + rank as i64 } else { axis };
    if rank == 0 || rank > MAX_INDEX_RANK || in_shape.len() != rank || axis == rank as i64 - 1 {
        return false;
    }
    let Ok(axis) = usize::try_from(axis) else {
        return false;
    };

    let coeff = index_coeff(&idx_shape, &in_shape, axis);
    let repr = Representation::plain(graph.repr(indices).storage());
    let name = format!("{}_indices_coeff", graph.node_name(node));
    let table = weight_like(graph, node, &name, idx_shape, repr, coeff);
    match graph.inputs(node).get(coeff_slot).copied() {
        Some(placeholder) => {
            let none = graph.producer(placeholder);
            graph.set_operand(node, coeff_slot, table);
            graph.erase_if_dead(none);
        }
        None => graph.push_operand(node, table),
    }
    true
}

/// Linear input offset of every index element, in row-major index order,
/// with the `axis` component left out.
pub(super) fn index_coeff(idx_shape: &[i64], in_shape: &[i64], axis: usize) -> Vec<f64> {
    let strides = permute::strides(in_shape);
    let total = permute::num_elements(idx_shape);
    let mut coeff = Vec::with_capacity(total);
    let mut index = vec![0i64; idx_shape.len()];
    for _ in 0..total {
        let offset: i64 = index
            .iter()
            .zip(&strides)
            .enumerate()
            .filter(|&(d, _)| d != axis)
            .map(|(_, (&i, &s))| i * s)
            .sum();
        coeff.push(offset as f64);
        for d in (0..index.len()).rev() {
            index[d] += 1;
            if index[d] < idx_shape[d] {
                break;
            }
            index[d] = 0;
        }
    }
    coeff
}
