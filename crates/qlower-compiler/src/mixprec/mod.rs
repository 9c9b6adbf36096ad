//! Mixed-precision subgraph matchers.
//!
//! Read-only topology scans that recognize known transformer motifs and
//! pin their numerically fragile nodes to a higher precision through the
//! override map. A scan that hits anything unexpected simply abandons that
//! anchor. Entries are only ever added when absent, so running the matchers
//! again changes nothing.

mod bert;
mod vit;

#[cfg(test)]
mod mixprec_tests;

use qlower_core::{Graph, GraphState, Mode, NodeId, OpKind, ValueId};
use tracing::{debug, info};

use crate::{LoweringContext, PrecisionOverrideMap};

/// Operand magnitude ratio above which an Add is pinned to F32.
const ADD_RATIO_LIMIT: f64 = 64.0;
const ADD_RATIO_EPSILON: f64 = 1e-8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchReport {
    pub bert_ffn: usize,
    pub bert_mha: usize,
    pub attention: usize,
    pub vit_mlp: usize,
    pub vit_mha: usize,
    pub bert_applied: bool,
    pub vit_applied: bool,
    pub ratio_pins: usize,
}

/// Runs every matcher when the configuration calls for them.
pub fn run(graph: &Graph, ctx: &mut LoweringContext) -> MatchReport {
    let config = &ctx.config;
    if !config.is_bm1684x_or_sg2260()
        || !matches!(config.mode, Mode::Int8 | Mode::Uint8)
        || graph.state == GraphState::Quantized
    {
        debug!("mixed-precision matchers not applicable");
        return MatchReport::default();
    }
    let threshold = config.ffn_depth_threshold;
    let partial_ffn = config.partial_ffn;
    let overrides = &mut ctx.overrides;

    let mut report = MatchReport::default();
    bert::apply(graph, overrides, threshold, partial_ffn, &mut report);
    vit::apply(graph, overrides, &mut report);
    report.ratio_pins = pin_high_ratio_adds(graph, overrides);

    info!(
        bert = report.bert_applied,
        vit = report.vit_applied,
        ratio_pins = report.ratio_pins,
        overrides = overrides.len(),
        "mixed-precision matching done"
    );
    report
}

pub(crate) fn pin(overrides: &mut PrecisionOverrideMap, graph: &Graph, node: NodeId, mode: Mode) {
    let name = graph.node_name(node);
    if overrides.insert_if_absent(name, mode) {
        debug!(node = name, %mode, "precision pinned");
    }
}

/// One real data input and one consumer. Inputs, weights and None
/// placeholders do not count as data inputs.
pub(crate) fn is_siso(graph: &Graph, node: NodeId) -> bool {
    let mut data_inputs = 0;
    for &value in graph.inputs(node) {
        if matches!(
            graph.producer_kind(value),
            OpKind::Input | OpKind::Weight | OpKind::None
        ) {
            continue;
        }
        data_inputs += 1;
        if data_inputs > 1 {
            return false;
        }
    }
    data_inputs == 1
        && graph
            .outputs(node)
            .first()
            .is_some_and(|&out| graph.has_one_use(out))
}

/// Producer of `value` when it has the given kind.
pub(crate) fn def_of(graph: &Graph, value: ValueId, kind: OpKind) -> Option<NodeId> {
    let producer = graph.producer(value);
    (graph.kind(producer) == kind).then_some(producer)
}

/// Producer of the first operand of `node` when it has the given kind.
pub(crate) fn input_def(graph: &Graph, node: NodeId, kind: OpKind) -> Option<NodeId> {
    let value = *graph.inputs(node).first()?;
    def_of(graph, value, kind)
}

pub(crate) fn first_user(graph: &Graph, node: NodeId) -> Option<NodeId> {
    let out = *graph.outputs(node).first()?;
    graph.first_user(out)
}

/// First consumer of the first output of `node` when it has the given kind.
pub(crate) fn first_user_of(graph: &Graph, node: NodeId, kind: OpKind) -> Option<NodeId> {
    first_user(graph, node).filter(|&user| graph.kind(user) == kind)
}

pub(crate) fn has_one_use(graph: &Graph, node: NodeId) -> bool {
    graph
        .outputs(node)
        .first()
        .is_some_and(|&out| graph.has_one_use(out))
}

/// Pins Add nodes whose two operands differ in magnitude by more than
/// [`ADD_RATIO_LIMIT`].
fn pin_high_ratio_adds(graph: &Graph, overrides: &mut PrecisionOverrideMap) -> usize {
    let mut pinned = 0;
    for &id in graph.order() {
        if graph.kind(id) != OpKind::Add || overrides.contains(graph.node_name(id)) {
            continue;
        }
        let inputs = graph.inputs(id);
        if inputs.len() != 2 {
            continue;
        }
        let Some(thresholds) = inputs
            .iter()
            .map(|&v| magnitude(graph, v))
            .collect::<Option<Vec<f64>>>()
        else {
            continue;
        };
        let (a, b) = (thresholds[0], thresholds[1]);
        if a < ADD_RATIO_EPSILON || b < ADD_RATIO_EPSILON {
            continue;
        }
        if a / b > ADD_RATIO_LIMIT || b / a > ADD_RATIO_LIMIT {
            pin(overrides, graph, id, Mode::F32);
            pinned += 1;
        }
    }
    pinned
}

fn magnitude(graph: &Graph, value: ValueId) -> Option<f64> {
    if let Some(data) = graph.weight_data(value) {
        return Some(data.iter().fold(0.0f64, |acc, v| acc.max(v.abs())));
    }
    graph.repr(value).range().map(|r| r.abs_max())
}
