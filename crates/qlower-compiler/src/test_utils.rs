//! Test helpers for building small graphs.

use qlower_core::{Chip, ElementKind, Graph, GraphState, Mode, Range, Representation, ValueId};

use crate::{LowerConfig, LoweringContext};

pub fn cal(min: f64, max: f64) -> Representation {
    Representation::calibrated(ElementKind::F32, min, max)
}

pub fn f32() -> Representation {
    Representation::plain(ElementKind::F32)
}

/// Calibrated graph with no nodes yet.
pub fn calibrated_graph() -> Graph {
    let mut g = Graph::new("test");
    g.state = GraphState::Calibrated;
    g
}

pub fn ctx(chip: Chip, mode: Mode) -> LoweringContext {
    LoweringContext::new(LowerConfig::builder(chip, mode).build())
}

pub fn int8_ctx() -> LoweringContext {
    ctx(Chip::Bm1684x, Mode::Int8)
}

pub fn range_of(g: &Graph, value: ValueId) -> (f64, f64) {
    let range: Range = g
        .repr(value)
        .range()
        .unwrap_or_else(|| panic!("{} is not calibrated", g.value_ref(value)));
    (range.min(), range.max())
}

/// Name of the node producing `value`.
pub fn producer_name(g: &Graph, value: ValueId) -> String {
    g.node_name(g.producer(value)).to_owned()
}
