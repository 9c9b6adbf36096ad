//! Invariant checks excluded from coverage reports.

#![cfg_attr(coverage_nightly, coverage(off))]

use qlower_core::Graph;

pub(crate) fn ensure_not_frozen(frozen: bool, action: &str) {
    if frozen {
        panic!("PrecisionOverrideMap: {action} after the map was frozen");
    }
}

/// Use lists must mirror operand lists after every structural edit.
pub(crate) fn ensure_structure(graph: &Graph, after: &str) {
    if cfg!(debug_assertions)
        && let Err(problem) = graph.verify_structure()
    {
        panic!("Graph: inconsistent arena after {after}: {problem}");
    }
}
