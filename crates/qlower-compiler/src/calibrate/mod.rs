//! Calibration range propagation.
//!
//! Runs a fixed sequence of phases. Each phase drives its rule set to a
//! fixpoint with a worklist: every node starts queued, and whenever a rule
//! changes something the node plus the producers and consumers of every
//! retyped value are queued again.
//!
//! Phase order:
//! 1. forward through reshape/permute
//! 2. pooling, subtract-by-constant and add sign consistency
//! 3. multiply sign consistency (not on CV18xx, not in F8 modes)
//! 4. multi-input unification
//! 5. activation backward
//! 6. compare unification
//! 7. selective threshold (not in F8 modes)
//! 8. extended forward
//! 9. sign consistency again
//! 10. selective threshold again

mod rules;
mod walk;


use std::collections::{HashSet, VecDeque};

use indexmap::IndexMap;
use qlower_core::{Graph, GraphState, NodeId, OpKind};
use tracing::{debug, info, warn};

use crate::{LoweringContext, Result};

use rules::Rule;
use walk::Propagator;

/// Visits per node before a phase gives up on reaching a fixpoint.
const MAX_VISITS_PER_NODE: usize = 64;

const SHAPE: &[OpKind] = &[OpKind::Reshape, OpKind::Permute];
const POOLS: &[OpKind] = &[OpKind::AvgPool, OpKind::MaxPool];
const MULTI_INPUT: &[OpKind] = &[OpKind::Concat, OpKind::Min, OpKind::Max];
const BACKWARD: &[OpKind] = &[
    OpKind::Relu,
    OpKind::MaxPool,
    OpKind::MaxPoolWithMask,
    OpKind::Depth2Space,
    OpKind::Abs,
];
const BACKWARD_KEEP_MIN: &[OpKind] = &[OpKind::PRelu, OpKind::LeakyRelu];
const BACKWARD_CV18XX: &[OpKind] = &[OpKind::LeakyRelu, OpKind::ScatterNd];
const FORWARD_EXTENDED: &[OpKind] = &[
    OpKind::Relu,
    OpKind::MaxPool,
    OpKind::MinConst,
    OpKind::MaxConst,
    OpKind::MaxPoolWithMask,
    OpKind::MaxUnpool,
    OpKind::Reshape,
    OpKind::Unsqueeze,
    OpKind::Squeeze,
    OpKind::Slice,
    OpKind::Tile,
    OpKind::Pad,
    OpKind::Permute,
    OpKind::Reverse,
    OpKind::Upsample,
    OpKind::LeakyRelu,
    OpKind::Abs,
];

#[derive(Debug, Clone)]
pub(crate) struct Phase {
    pub name: &'static str,
    pub rules: Vec<Rule>,
}

/// What a propagation run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationStats {
    pub phases: usize,
    pub applied: usize,
    pub by_rule: IndexMap<&'static str, usize>,
}

pub(crate) fn phases(ctx: &LoweringContext) -> Vec<Phase> {
    let chip = ctx.config.chip;
    let f8 = ctx.config.mode.is_f8();
    let sign = || Phase {
        name: "sign",
        rules: vec![Rule::KeepSign(POOLS), Rule::SubConstSign, Rule::AddSign],
    };
    let selective = || Phase {
        name: "selective",
        rules: vec![Rule::WhereThreshold, Rule::MaskedFillThreshold],
    };

    let mut phases = vec![
        Phase {
            name: "forward-shape",
            rules: vec![Rule::ForwardCopy(SHAPE)],
        },
        sign(),
    ];
    if !chip.is_cv18xx() && !f8 {
        phases.push(Phase {
            name: "mul-sign",
            rules: vec![Rule::MulSign, Rule::SubConstSign],
        });
    }
    phases.push(Phase {
        name: "multi-input",
        rules: vec![Rule::MultiInput(MULTI_INPUT)],
    });

    let mut backward = vec![Rule::Backward(BACKWARD)];
    if chip.is_cv18xx() {
        backward.push(Rule::Backward(BACKWARD_CV18XX));
    } else {
        backward.push(Rule::BackwardKeepMin(BACKWARD_KEEP_MIN));
    }
    phases.push(Phase {
        name: "backward",
        rules: backward,
    });
    phases.push(Phase {
        name: "compare",
        rules: vec![Rule::Compare],
    });
    if !f8 {
        phases.push(selective());
    }

    let mut forward = vec![
        Rule::ForwardCopy(FORWARD_EXTENDED),
        Rule::ForwardMulConst,
        Rule::ForwardArg,
    ];
    if chip.is_cv18xx() {
        forward.push(Rule::ForwardCopy(&[OpKind::Reduce]));
    } else {
        forward.push(Rule::ForwardCopy(&[OpKind::PRelu]));
    }
    if chip.is_bm1684_family() {
        forward.push(Rule::ForwardCopy(&[OpKind::AvgPool]));
    }
    phases.push(Phase {
        name: "forward",
        rules: forward,
    });
    phases.push(sign());
    phases.push(selective());
    phases
}

/// Propagates calibration ranges over a calibrated graph.
pub fn run(graph: &mut Graph, ctx: &LoweringContext) -> Result<CalibrationStats> {
    let mut stats = CalibrationStats::default();
    if graph.state != GraphState::Calibrated {
        debug!(state = ?graph.state, "graph carries no calibration, skipping propagation");
        return Ok(stats);
    }

    for phase in phases(ctx) {
        let applied = run_phase(graph, ctx, &phase, &mut stats)?;
        debug!(phase = phase.name, applied, "calibration phase done");
        stats.phases += 1;
    }
    info!(
        phases = stats.phases,
        applied = stats.applied,
        "calibration propagated"
    );
    Ok(stats)
}

fn run_phase(
    graph: &mut Graph,
    ctx: &LoweringContext,
    phase: &Phase,
    stats: &mut CalibrationStats,
) -> Result<usize> {
    let mut queue: VecDeque<NodeId> = graph.order().iter().copied().collect();
    let mut queued: HashSet<NodeId> = queue.iter().copied().collect();
    let budget = (graph.node_count() + 1) * MAX_VISITS_PER_NODE;
    let mut visits = 0usize;
    let mut applied = 0usize;

    let mut p = Propagator::new(graph, ctx);
    while let Some(id) = queue.pop_front() {
        queued.remove(&id);
        if !p.graph.is_live(id) {
            continue;
        }
        visits += 1;
        if visits > budget {
            warn!(
                phase = phase.name,
                visits, "calibration phase did not settle, stopping"
            );
            break;
        }

        for &rule in &phase.rules {
            if !rule.apply(&mut p, id)? {
                continue;
            }
            debug!(rule = rule.name(), node = p.graph.node_name(id), "rule applied");
            applied += 1;
            stats.applied += 1;
            *stats.by_rule.entry(rule.name()).or_default() += 1;

            let mut requeue = vec![id];
            for value in p.take_touched() {
                requeue.push(p.graph.producer(value));
                requeue.extend(p.graph.users(value));
            }
            for n in requeue {
                if queued.insert(n) {
                    queue.push_back(n);
                }
            }
            break;
        }
    }
    Ok(applied)
}
