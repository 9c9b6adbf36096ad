//! Vision-transformer motifs: MLP blocks and attention blocks.

use std::collections::HashSet;

use qlower_core::{Graph, Mode, NodeId, Op, OpKind};
use tracing::debug;

use super::{MatchReport, def_of, first_user, first_user_of, has_one_use, input_def, is_siso, pin};
use crate::PrecisionOverrideMap;

/// Models with more blocks than this also pin the MLP matmuls of their
/// last blocks.
const DEEP_MODEL_BLOCKS: usize = 18;
const PINNED_TAIL_BLOCKS: usize = 3;

pub(super) fn apply(graph: &Graph, overrides: &mut PrecisionOverrideMap, report: &mut MatchReport) {
    let adds: Vec<NodeId> = graph
        .order()
        .iter()
        .copied()
        .filter(|&id| graph.kind(id) == OpKind::Add)
        .collect();

    let mlp: Vec<NodeId> = adds.iter().copied().filter(|&a| match_mlp(graph, a)).collect();
    let mut mha: Vec<NodeId> = adds.iter().copied().filter(|&a| match_mha(graph, a)).collect();
    if mha.is_empty() {
        mha = adds
            .iter()
            .copied()
            .filter(|&a| match_mha_relaxed(graph, a))
            .collect();
    }

    report.vit_mlp = mlp.len();
    report.vit_mha = mha.len();
    debug!(mlp = mlp.len(), mha = mha.len(), "vit scan");

    if mlp.is_empty() || mlp.len() != mha.len() {
        return;
    }
    report.vit_applied = true;

    for &add in &mha {
        pin(overrides, graph, add, Mode::F16);
        for user in graph.users(graph.output(add, 0)) {
            if graph.kind(user) == OpKind::Add {
                pin(overrides, graph, user, Mode::F16);
            }
        }
    }

    let total = mlp.len();
    for (index, &add) in mlp.iter().enumerate() {
        pin(overrides, graph, add, Mode::F16);
        let in_tail = index + PINNED_TAIL_BLOCKS >= total;
        if !(in_tail && total > DEEP_MODEL_BLOCKS) {
            continue;
        }
        for &value in graph.inputs(add) {
            if let Some(mm) = def_of(graph, value, OpKind::MatMul) {
                pin(overrides, graph, mm, Mode::F16);
            }
        }
    }
}

/// `Add(Add, MatMul(Gelu(MatMul(LayerNorm(Add)))))` anchored at the outer
/// residual Add.
pub(super) fn match_mlp(graph: &Graph, add: NodeId) -> bool {
    let mut residual = None;
    let mut mm = None;
    for &value in graph.inputs(add) {
        let producer = graph.producer(value);
        match graph.kind(producer) {
            OpKind::MatMul => mm = Some(producer),
            OpKind::Add => residual = Some(producer),
            _ => return false,
        }
    }
    let (Some(residual), Some(mm)) = (residual, mm) else {
        return false;
    };
    if !is_siso(graph, mm) {
        return false;
    }
    let Some(gelu) = input_def(graph, mm, OpKind::Gelu) else {
        return false;
    };
    if !is_siso(graph, gelu) {
        return false;
    }
    let Some(mm1) = input_def(graph, gelu, OpKind::MatMul) else {
        return false;
    };
    if let Some(ln) = input_def(graph, mm1, OpKind::LayerNorm)
        && (graph.producer(graph.input(ln, 0)) != residual || !is_siso(graph, ln))
    {
        return false;
    }
    [mm, gelu, mm1].iter().all(|&n| has_one_use(graph, n))
}

/// Attention block hanging off a residual Add: a LayerNorm feeding a fused
/// qkv projection that is sliced into three heads and rejoins the residual
/// stream at a later Add.
pub(super) fn match_mha(graph: &Graph, add: NodeId) -> bool {
    matches_strict(graph, add).is_some()
}

fn matches_strict(graph: &Graph, add: NodeId) -> Option<()> {
    let (ln, residual) = residual_split(graph, add)?;
    if !is_siso(graph, ln) || !converges(graph, ln, residual) {
        return None;
    }

    let qkv = first_user_of(graph, ln, OpKind::MatMul)?;
    let reshape = first_user_of(graph, qkv, OpKind::Reshape)?;
    let permute = first_user_of(graph, reshape, OpKind::Permute)?;
    let permute_out = graph.output(permute, 0);
    if graph.use_count(permute_out) != 3 {
        return None;
    }

    let mut slices = [None; 3];
    for user in graph.users(permute_out) {
        let Op::Slice { offset, .. } = &graph.node(user).op else {
            return None;
        };
        let head = usize::try_from(*offset.first()?).ok()?;
        *slices.get_mut(head)? = Some(user);
    }
    let mut heads = [NodeId::from_raw(0); 3];
    for (head, slice) in heads.iter_mut().zip(slices) {
        *head = first_user_of(graph, slice?, OpKind::Reshape)?;
    }

    let context = first_user_of(graph, heads[2], OpKind::MatMul)?;
    let scores = first_user_of(graph, heads[0], OpKind::MatMul)?;
    if first_user_of(graph, heads[1], OpKind::MatMul)? != scores {
        return None;
    }
    let scale = first_user_of(graph, scores, OpKind::MulConst)?;
    let softmax = first_user_of(graph, scale, OpKind::Softmax)?;
    if first_user(graph, softmax)? != context {
        return None;
    }

    rejoins(graph, context, residual)
}

/// Looser attention shape with separate q, k and v projections, tried only
/// when the strict form matched nowhere.
pub(super) fn match_mha_relaxed(graph: &Graph, add: NodeId) -> bool {
    matches_relaxed(graph, add).is_some()
}

fn matches_relaxed(graph: &Graph, add: NodeId) -> Option<()> {
    let (ln, residual) = residual_split(graph, add)?;
    if !converges(graph, ln, residual) {
        return None;
    }
    let ln_out = graph.output(ln, 0);
    if !matches!(graph.use_count(ln_out), 3 | 4) {
        return None;
    }

    let mut permutes: [Option<NodeId>; 3] = [None; 3];
    let mut scale = None;
    for projection in graph.users(ln_out) {
        if graph.kind(projection) != OpKind::MatMul || !is_siso(graph, projection) {
            return None;
        }
        let reshape = first_user_of(graph, projection, OpKind::Reshape)?;
        if graph.use_count(graph.output(reshape, 0)) == 0 {
            continue;
        }
        if !is_siso(graph, reshape) {
            return None;
        }
        let permute = first_user_of(graph, reshape, OpKind::Permute)?;
        if !is_siso(graph, permute) {
            return None;
        }

        let next = first_user(graph, permute)?;
        let head = match graph.kind(next) {
            OpKind::MulConst => {
                if !is_siso(graph, next) {
                    return None;
                }
                scale = Some(next);
                0
            }
            OpKind::MatMul => match graph.kind(first_user(graph, next)?) {
                OpKind::Softmax => 1,
                OpKind::Permute => 2,
                OpKind::MulConst if permutes[0].is_none() => 0,
                OpKind::MulConst if permutes[1].is_some() => return None,
                OpKind::MulConst => 1,
                _ => return None,
            },
            _ => return None,
        };
        permutes[head] = Some(permute);
    }
    let [Some(query), Some(key), Some(value)] = permutes else {
        return None;
    };

    let scores = first_user_of(graph, key, OpKind::MatMul)?;
    let partner = match scale {
        Some(scale) => first_user_of(graph, scale, OpKind::MatMul)?,
        None => first_user_of(graph, query, OpKind::MatMul)?,
    };
    if partner != scores {
        return None;
    }

    let softmax = match first_user_of(graph, scores, OpKind::MulConst) {
        Some(scale_after) if scale.is_none() => {
            if !is_siso(graph, scale_after) {
                return None;
            }
            first_user_of(graph, scale_after, OpKind::Softmax)?
        }
        _ => first_user_of(graph, scores, OpKind::Softmax)?,
    };
    let context = first_user_of(graph, softmax, OpKind::MatMul)?;
    if first_user(graph, value)? != context {
        return None;
    }

    rejoins(graph, context, residual)
}

/// Splits the consumers of a residual Add into the LayerNorm that opens
/// the block and the Add that closes it.
fn residual_split(graph: &Graph, add: NodeId) -> Option<(NodeId, NodeId)> {
    let mut ln = None;
    let mut residual = None;
    for user in graph.users(graph.output(add, 0)) {
        match graph.kind(user) {
            OpKind::LayerNorm => ln = Some(user),
            OpKind::Add => residual = Some(user),
            _ => {}
        }
    }
    Some((ln?, residual?))
}

/// `context -> Permute -> Reshape -> MatMul -> residual`.
fn rejoins(graph: &Graph, context: NodeId, residual: NodeId) -> Option<()> {
    let permute = first_user_of(graph, context, OpKind::Permute)?;
    let reshape = first_user_of(graph, permute, OpKind::Reshape)?;
    let out_proj = first_user_of(graph, reshape, OpKind::MatMul)?;
    (first_user(graph, out_proj)? == residual).then_some(())
}

/// Every path leaving `from` reaches `to` without ending at the graph
/// result or a None placeholder.
pub(super) fn converges(graph: &Graph, from: NodeId, to: NodeId) -> bool {
    let mut stack = vec![from];
    let mut seen = HashSet::new();
    while let Some(node) = stack.pop() {
        if !seen.insert(node) {
            continue;
        }
        let Some(&out) = graph.outputs(node).first() else {
            return false;
        };
        for user in graph.users(out) {
            if user == to {
                continue;
            }
            match graph.kind(user) {
                OpKind::Return | OpKind::None => return false,
                _ => stack.push(user),
            }
        }
    }
    true
}
