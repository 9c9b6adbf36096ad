//! BERT encoder motifs: feed-forward blocks, multi-head attention blocks
//! and fused attention ops.

use qlower_core::{Graph, Mode, NodeId, Op, OpKind};
use tracing::debug;

use super::{MatchReport, def_of, has_one_use, input_def, is_siso, pin};
use crate::PrecisionOverrideMap;

const SCORE_SCALE: f64 = 0.125;
const MASK_FILL: f64 = -10000.0;

pub(super) fn apply(
    graph: &Graph,
    overrides: &mut PrecisionOverrideMap,
    ffn_depth_threshold: usize,
    partial_ffn: bool,
    report: &mut MatchReport,
) {
    let layer_norms: Vec<NodeId> = graph
        .order()
        .iter()
        .copied()
        .filter(|&id| graph.kind(id) == OpKind::LayerNorm)
        .collect();

    let ffn: Vec<NodeId> = layer_norms
        .iter()
        .filter_map(|&ln| match_ffn(graph, ln))
        .collect();
    let mha: Vec<NodeId> = layer_norms
        .iter()
        .filter_map(|&ln| match_mha(graph, ln))
        .collect();
    let attention: Vec<NodeId> = graph
        .order()
        .iter()
        .copied()
        .filter(|&id| graph.kind(id) == OpKind::Attention)
        .collect();

    report.bert_ffn = ffn.len();
    report.bert_mha = mha.len();
    report.attention = attention.len();
    debug!(
        ffn = ffn.len(),
        mha = mha.len(),
        attention = attention.len(),
        "bert scan"
    );

    if ffn.is_empty() || (mha.is_empty() && attention.is_empty()) {
        return;
    }
    report.bert_applied = true;

    for &add in &mha {
        pin(overrides, graph, add, Mode::F16);
    }

    for (index, &add) in ffn.iter().enumerate() {
        let depth = index + 1;
        pin(overrides, graph, add, Mode::F16);
        if partial_ffn && depth >= ffn_depth_threshold {
            continue;
        }
        for &value in graph.inputs(add) {
            if let Some(mm) = def_of(graph, value, OpKind::MatMul) {
                pin(overrides, graph, mm, Mode::F16);
            }
        }
    }

    for &att in &attention {
        let Some(ln) = input_def(graph, att, OpKind::LayerNorm) else {
            continue;
        };
        for &out in graph.outputs(ln) {
            for user in graph.users(out) {
                if graph.kind(user) == OpKind::Add {
                    pin(overrides, graph, user, Mode::F16);
                }
            }
        }
    }
}

/// `LayerNorm(Add(LayerNorm, MatMul(Gelu(MatMul(LayerNorm)))))`.
///
/// Returns the residual Add.
pub(super) fn match_ffn(graph: &Graph, ln: NodeId) -> Option<NodeId> {
    let add = input_def(graph, ln, OpKind::Add)?;
    if !has_one_use(graph, add) {
        return None;
    }

    let mut top_ln = None;
    let mut mm = None;
    for &value in graph.inputs(add) {
        let producer = graph.producer(value);
        match graph.kind(producer) {
            OpKind::LayerNorm => top_ln = Some(producer),
            OpKind::MatMul => mm = Some(producer),
            _ => return None,
        }
    }
    let (top_ln, mm) = (top_ln?, mm?);
    if !is_siso(graph, mm) {
        return None;
    }

    let gelu = input_def(graph, mm, OpKind::Gelu)?;
    if !is_siso(graph, gelu) {
        return None;
    }
    let mm1 = input_def(graph, gelu, OpKind::MatMul)?;
    if graph.producer(graph.input(mm1, 0)) != top_ln || !is_siso(graph, mm1) {
        return None;
    }

    [mm, gelu, mm1]
        .iter()
        .all(|&n| has_one_use(graph, n))
        .then_some(add)
}

/// `LayerNorm(Add(LayerNorm, MatMul(Reshape(Permute(attention)))))` where
/// the attention is `MatMul(Softmax(scores + mask), values)`.
///
/// Returns the residual Add.
pub(super) fn match_mha(graph: &Graph, ln: NodeId) -> Option<NodeId> {
    let add = input_def(graph, ln, OpKind::Add)?;
    if !has_one_use(graph, add) {
        return None;
    }

    let mut top_ln = None;
    let mut mm = None;
    for &value in graph.inputs(add) {
        let producer = graph.producer(value);
        match graph.kind(producer) {
            OpKind::MatMul => mm = Some(producer),
            OpKind::LayerNorm => top_ln = Some(producer),
            _ => return None,
        }
    }
    let (top_ln, mm) = (top_ln?, mm?);
    if !is_siso(graph, mm) {
        return None;
    }

    let reshape = input_def(graph, mm, OpKind::Reshape)?;
    if !is_siso(graph, reshape) {
        return None;
    }
    let permute = input_def(graph, reshape, OpKind::Permute)?;
    if !is_siso(graph, permute) {
        return None;
    }
    let context = input_def(graph, permute, OpKind::MatMul)?;

    let mut values = None;
    let mut softmax = None;
    for &value in graph.inputs(context) {
        let producer = graph.producer(value);
        match graph.kind(producer) {
            OpKind::Permute => values = Some(producer),
            OpKind::Softmax => softmax = Some(producer),
            OpKind::None => {}
            _ => return None,
        }
    }
    let (values, softmax) = (values?, softmax?);

    let values_reshape = input_def(graph, values, OpKind::Reshape)?;
    if !is_siso(graph, values_reshape) {
        return None;
    }
    if let Some(projection) = input_def(graph, values_reshape, OpKind::MatMul)
        && (!is_siso(graph, projection)
            || graph.producer(graph.input(projection, 0)) != top_ln)
    {
        return None;
    }

    let masked = input_def(graph, softmax, OpKind::Add)?;
    if !has_one_use(graph, masked) {
        return None;
    }
    let mut scale = None;
    for &value in graph.inputs(masked) {
        let producer = graph.producer(value);
        let Op::MulConst { const_val, .. } = graph.node(producer).op else {
            return None;
        };
        if const_val == SCORE_SCALE {
            scale = Some(producer);
        } else if const_val != MASK_FILL {
            return None;
        }
    }
    let scale = scale?;
    if !is_siso(graph, scale) {
        return None;
    }

    let scores = input_def(graph, scale, OpKind::MatMul)?;
    let mut heads = 0;
    for &value in graph.inputs(scores) {
        let producer = graph.producer(value);
        match graph.kind(producer) {
            OpKind::Weight => {}
            OpKind::Permute => {
                if !is_projection_head(graph, producer, top_ln) {
                    return None;
                }
                heads += 1;
            }
            _ => {}
        }
    }

    (heads == 2).then_some(add)
}

/// `Permute(Reshape(MatMul(top_ln)))`, each link single-in single-out.
fn is_projection_head(graph: &Graph, permute: NodeId, top_ln: NodeId) -> bool {
    if !is_siso(graph, permute) {
        return false;
    }
    let Some(reshape) = input_def(graph, permute, OpKind::Reshape) else {
        return false;
    };
    if !is_siso(graph, reshape) {
        return false;
    }
    let Some(mm) = input_def(graph, reshape, OpKind::MatMul) else {
        return false;
    };
    is_siso(graph, mm) && graph.producer(graph.input(mm, 0)) == top_ln
}
