//! Grouped convolution rewrite.

use qlower_core::{ElementKind, Graph, NodeId, Op, permute};

use super::replace_weight;
use crate::LoweringContext;

/// Rewrites a grouped convolution into an ungrouped one when all input
/// channels fit into one parallel channel pass.
///
/// The filter `[oc, ic / groups, kh, kw]` is scattered into a
/// `[oc, ic, kh, kw]` filter: output channel `o` of group `g` keeps its
/// weights at input channels `g * ic / groups ..`, everything else is the
/// kernel zero point.
pub(super) fn ungroup(graph: &mut Graph, conv: NodeId, ctx: &LoweringContext) -> bool {
    let Op::Conv2d {
        groups, kernel_zp, ..
    } = graph.node(conv).op
    else {
        return false;
    };
    let inputs = graph.inputs(conv);
    if groups <= 1 || inputs.len() < 2 {
        return false;
    }
    let (input, filter) = (inputs[0], inputs[1]);
    if !graph.is_weight(filter) {
        return false;
    }
    let storage = graph.repr(filter).storage();
    if !matches!(
        storage,
        ElementKind::Bf16 | ElementKind::F16 | ElementKind::I8 | ElementKind::U8
    ) {
        return false;
    }

    let in_shape = graph.shape(input);
    let f_shape = graph.shape(filter).to_vec();
    if in_shape.len() != 4 || f_shape.len() != 4 {
        return false;
    }
    let ic = in_shape[1];
    let ic_parallel = i64::from(ctx.config.ic_parallel_bytes / storage.byte_width());
    if ic > ic_parallel || ic % groups != 0 {
        return false;
    }
    let [oc, group_ic, kh, kw] = [f_shape[0], f_shape[1], f_shape[2], f_shape[3]];
    if group_ic * groups != ic || oc % groups != 0 {
        return false;
    }
    let Some(data) = graph.weight_data(filter) else {
        return false;
    };
    if data.len() != permute::num_elements(&f_shape) {
        return false;
    }

    let group_oc = oc / groups;
    let old_row = (group_ic * kh * kw) as usize;
    let new_row = (ic * kh * kw) as usize;
    let mut scattered = vec![kernel_zp; oc as usize * new_row];
    for o in 0..oc as usize {
        let group = o / group_oc as usize;
        let from = &data[o * old_row..(o + 1) * old_row];
        let at = o * new_row + group * old_row;
        scattered[at..at + old_row].copy_from_slice(from);
    }

    replace_weight(graph, conv, 1, "ungrouped", vec![oc, ic, kh, kw], scattered);
    if let Op::Conv2d { groups, .. } = &mut graph.node_mut(conv).op {
        *groups = 1;
    }
    true
}
