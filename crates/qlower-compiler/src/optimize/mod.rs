//! Structural rewrites over the typed graph.
//!
//! Every rewrite is anchored at one node and looks at a small neighborhood
//! around it. It either rewrites that neighborhood completely and returns
//! `true`, or returns `false` without touching the graph. The driver sweeps
//! the catalog over program order until a whole sweep changes nothing, so
//! one rewrite can unlock another (e.g. a transpose absorbed into a matmul
//! leaves a trailing permute that later fuses with its consumer).
//!
//! Rewrites only run for the BM1684X and SG2260 families.

mod conv;
mod gather;
mod matmul;
mod permute;
mod reshape;

#[cfg(test)]
mod optimize_tests;

use indexmap::IndexMap;
use qlower_core::{Graph, NodeId, Op, OpKind, Representation, TensorType, ValueId};
use tracing::{debug, info, warn};

use crate::LoweringContext;

/// The order used to swap heads and sequence in attention blocks.
const SWAP_HEADS: [i64; 4] = [0, 2, 1, 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rewrite {
    MatMulHdimBatch,
    MatMulRemoveReshape,
    UngroupConv,
    MovePermuteAfterAdd,
    MoveReshapeAfterAdd,
    ReshapeReorder,
    PermuteWeightReorder,
    PermuteFuse,
    ReshapeFuse,
    ReshapeIdentity,
    PermuteReshapeFuse,
    IndexCoeff,
    PermuteToReshape,
}

const CATALOG: &[Rewrite] = &[
    Rewrite::MatMulHdimBatch,
    Rewrite::MatMulRemoveReshape,
    Rewrite::UngroupConv,
    Rewrite::MovePermuteAfterAdd,
    Rewrite::MoveReshapeAfterAdd,
    Rewrite::ReshapeReorder,
    Rewrite::PermuteWeightReorder,
    Rewrite::PermuteFuse,
    Rewrite::ReshapeFuse,
    Rewrite::ReshapeIdentity,
    Rewrite::PermuteReshapeFuse,
    Rewrite::IndexCoeff,
    Rewrite::PermuteToReshape,
];

impl Rewrite {
    pub fn name(self) -> &'static str {
        match self {
            Rewrite::MatMulHdimBatch => "matmul-hdim-batch",
            Rewrite::MatMulRemoveReshape => "matmul-remove-reshape",
            Rewrite::UngroupConv => "ungroup-conv",
            Rewrite::MovePermuteAfterAdd => "move-permute-after-add",
            Rewrite::MoveReshapeAfterAdd => "move-reshape-after-add",
            Rewrite::ReshapeReorder => "reshape-reorder",
            Rewrite::PermuteWeightReorder => "permute-weight-reorder",
            Rewrite::PermuteFuse => "permute-fuse",
            Rewrite::ReshapeFuse => "reshape-fuse",
            Rewrite::ReshapeIdentity => "reshape-identity",
            Rewrite::PermuteReshapeFuse => "permute-reshape-fuse",
            Rewrite::IndexCoeff => "index-coeff",
            Rewrite::PermuteToReshape => "permute-to-reshape",
        }
    }

    pub fn apply(self, graph: &mut Graph, node: NodeId, ctx: &LoweringContext) -> bool {
        let kind = graph.kind(node);
        match self {
            Rewrite::MatMulHdimBatch => kind == OpKind::MatMul && matmul::absorb_permutes(graph, node),
            Rewrite::MatMulRemoveReshape => {
                kind == OpKind::MatMul && matmul::remove_unsqueeze_reshapes(graph, node)
            }
            Rewrite::UngroupConv => kind == OpKind::Conv2d && conv::ungroup(graph, node, ctx),
            Rewrite::MovePermuteAfterAdd => kind == OpKind::Add && permute::move_after_add(graph, node),
            Rewrite::MoveReshapeAfterAdd => kind == OpKind::Add && reshape::move_after_add(graph, node),
            Rewrite::ReshapeReorder => kind == OpKind::Reshape && reshape::reorder(graph, node),
            Rewrite::PermuteWeightReorder => {
                kind == OpKind::Permute && permute::reorder_weight(graph, node)
            }
            Rewrite::PermuteFuse => kind == OpKind::Permute && permute::fuse_chain(graph, node),
            Rewrite::ReshapeFuse => kind == OpKind::Reshape && reshape::fuse_repeat(graph, node),
            Rewrite::ReshapeIdentity => kind == OpKind::Reshape && reshape::remove_identity(graph, node),
            Rewrite::PermuteReshapeFuse => {
                kind == OpKind::Permute && permute::fuse_into_reshape(graph, node)
            }
            Rewrite::IndexCoeff => {
                matches!(kind, OpKind::GatherElements | OpKind::ScatterElements)
                    && gather::attach_index_coeff(graph, node)
            }
            Rewrite::PermuteToReshape => kind == OpKind::Permute && permute::to_reshape(graph, node),
        }
    }
}

/// What a rewrite run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteStats {
    /// Sweeps performed, including the last one that changed nothing.
    pub iterations: usize,
    pub rewrites_applied: usize,
    pub erased_nodes: usize,
    pub by_rule: IndexMap<&'static str, usize>,
}

/// Drives the rewrite catalog to a fixpoint.
pub fn run(graph: &mut Graph, ctx: &LoweringContext) -> RewriteStats {
    let mut stats = RewriteStats::default();
    if !ctx.config.is_bm1684x_or_sg2260() {
        debug!(chip = %ctx.config.chip, "structural rewrites not enabled for chip");
        return stats;
    }

    let erased_before = graph.erased_count();
    let cap = ctx.config.max_rewrite_iterations;
    loop {
        if stats.iterations >= cap {
            warn!(
                iterations = stats.iterations,
                "structural rewrites did not settle, stopping"
            );
            break;
        }
        stats.iterations += 1;
        if sweep(graph, ctx, &mut stats) == 0 {
            break;
        }
    }
    stats.erased_nodes = graph.erased_count() - erased_before;

    let annotated = matmul::annotate_left_reuse(graph);
    info!(
        iterations = stats.iterations,
        applied = stats.rewrites_applied,
        erased = stats.erased_nodes,
        annotated,
        "structural rewrites done"
    );
    stats
}

fn sweep(graph: &mut Graph, ctx: &LoweringContext, stats: &mut RewriteStats) -> usize {
    let snapshot: Vec<NodeId> = graph.order().to_vec();
    let mut applied = 0;
    for id in snapshot {
        if !graph.is_live(id) {
            continue;
        }
        let name = graph.node_name(id).to_owned();
        for &rewrite in CATALOG {
            if !graph.is_live(id) {
                break;
            }
            if !rewrite.apply(graph, id, ctx) {
                continue;
            }
            debug!(rule = rewrite.name(), node = %name, "rewrite applied");
            crate::invariants::ensure_structure(graph, rewrite.name());
            applied += 1;
            stats.rewrites_applied += 1;
            *stats.by_rule.entry(rewrite.name()).or_default() += 1;
        }
    }
    applied
}

/// Producer of `value` when it has the given kind.
fn defined_by(graph: &Graph, value: ValueId, kind: OpKind) -> Option<NodeId> {
    let producer = graph.producer(value);
    (graph.kind(producer) == kind).then_some(producer)
}

fn order_of(graph: &Graph, node: NodeId) -> Option<Vec<i64>> {
    match &graph.node(node).op {
        Op::Permute { order } => Some(order.clone()),
        _ => None,
    }
}

/// The first output of `node` is read exactly once.
fn single_use(graph: &Graph, node: NodeId) -> bool {
    graph
        .outputs(node)
        .first()
        .is_some_and(|&out| graph.has_one_use(out))
}

/// The only consumer of the first output of `node`.
fn sole_user(graph: &Graph, node: NodeId) -> Option<NodeId> {
    let out = *graph.outputs(node).first()?;
    if !graph.has_one_use(out) {
        return None;
    }
    graph.first_user(out)
}

/// Marks a node created by a rewrite as lowered in the mode of `like`.
fn adopt(graph: &mut Graph, id: NodeId, like: NodeId) {
    let mode = graph.node(like).mode;
    let node = graph.node_mut(id);
    node.mode = mode;
    node.lowered = true;
}

/// Splices a shape-only node right after the producer of `value` and moves
/// every other reader of `value` onto it. Returns the new output.
fn splice_after(
    graph: &mut Graph,
    value: ValueId,
    name: &str,
    op: Op,
    ty: TensorType,
) -> ValueId {
    let anchor = graph.producer(value);
    let id = graph.insert_after(anchor, name, op, &[value], vec![ty]);
    adopt(graph, id, anchor);
    let out = graph.output(id, 0);
    graph.replace_all_uses_except(value, out, id);
    out
}

/// Replaces weight operand `operand` of `consumer` with fresh constant data.
/// The old weight is erased once nothing reads it.
fn replace_weight(
    graph: &mut Graph,
    consumer: NodeId,
    operand: usize,
    suffix: &str,
    shape: Vec<i64>,
    data: Vec<f64>,
) {
    let old = graph.input(consumer, operand);
    let old_node = graph.producer(old);
    let name = format!("{}_{suffix}", graph.node_name(old_node));
    let repr = graph.repr(old);
    let fresh = weight_like(graph, consumer, &name, shape, repr, data);
    graph.set_operand(consumer, operand, fresh);
    graph.erase_if_dead(old_node);
}

/// New constant spliced right before `consumer`.
fn weight_like(
    graph: &mut Graph,
    consumer: NodeId,
    name: &str,
    shape: Vec<i64>,
    repr: Representation,
    data: Vec<f64>,
) -> ValueId {
    let id = graph.insert_before(
        consumer,
        name,
        Op::Weight { data },
        &[],
        vec![TensorType::new(shape, repr)],
    );
    graph.output(id, 0)
}
