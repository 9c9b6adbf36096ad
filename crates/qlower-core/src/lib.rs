#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Graph model for quantized lowering.
//!
//! - [`Graph`]: arena of nodes and values with def-use bookkeeping
//! - [`Representation`]: plain, calibrated or quantized view of a value
//! - [`Op`]: operation kind plus attributes
//! - [`Mode`] and [`Chip`]: execution precision and hardware family
//! - [`GraphDoc`]: the JSON document format

mod doc;
mod dump;
mod element;
mod graph;
mod invariants;
mod mode;
mod op;
pub mod permute;
mod repr;

pub use doc::{GraphDoc, GraphError, NodeDoc};
pub use element::ElementKind;
pub use graph::{Graph, GraphState, Node, NodeId, TensorType, Use, Value, ValueId};
pub use mode::{Chip, Mode, UnknownChip, UnknownMode};
pub use op::{CompareMode, Op, OpKind, ReduceMode};
pub use repr::{Range, Representation};

#[cfg(test)]
mod graph_tests;
