//! Invariant checks excluded from coverage reports.

#![cfg_attr(coverage_nightly, coverage(off))]

use crate::NodeId;

pub(crate) fn ensure_live<T>(slot: Option<T>, id: NodeId) -> T {
    slot.unwrap_or_else(|| panic!("Graph: node {id} was erased or never existed"))
}

pub(crate) fn ensure_unused(uses: usize, id: NodeId) {
    if uses != 0 {
        panic!("Graph: erasing node {id} whose outputs still have {uses} reader(s)");
    }
}

pub(crate) fn ensure_ordered_range(min: f64, max: f64) {
    if !(min <= max) {
        panic!("Range: min {min} exceeds max {max}");
    }
}
