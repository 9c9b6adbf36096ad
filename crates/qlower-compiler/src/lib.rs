//! qlower compiler: turns a calibrated graph into a hardware-typed one.
//!
//! Stages run in a fixed sequence on one mutable [`Graph`](qlower_core::Graph):
//! - `tile` - explicit broadcast tiling for shapes the backend cannot fold
//! - `qtable` - precision-override table loading
//! - `calibrate` - calibration range propagation to a fixpoint
//! - `mixprec` - subgraph matchers that pin known motifs to higher precision
//! - `lower` - per-op mode resolution and output representations
//! - `insert` - precision-boundary conversion insertion and fixups
//! - `optimize` - structural rewrites over the typed graph
//! - `verify` - post-pipeline checks
//! - `pipeline` - the driver tying it all together

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod calibrate;
pub mod config;
pub mod context;
pub mod insert;
mod invariants;
pub mod lower;
pub mod mixprec;
pub mod optimize;
pub mod pipeline;
pub mod qtable;
pub mod tile;
pub mod verify;

#[cfg(test)]
mod pipeline_tests;
#[cfg(test)]
pub mod test_utils;

pub use config::{LowerConfig, LowerConfigBuilder};
pub use context::{LoweringContext, PrecisionOverrideMap};
pub use lower::{DefaultLowering, Lowering, LoweringStats};
pub use pipeline::{Pipeline, PipelineReport};

use qlower_core::{GraphError, OpKind, UnknownMode};

/// Which side of the boundary an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input handed to the compiler. Nothing was mutated.
    Configuration,
    /// The graph cannot be lowered consistently.
    Modeling,
}

/// Errors that abort a compilation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("cannot read override table `{path}`: {reason}")]
    UnreadableTable { path: String, reason: String },

    #[error("override table line {line}: {source}")]
    UnknownMode {
        line: usize,
        #[source]
        source: UnknownMode,
    },

    #[error("override table line {line}: `{text}` is not `<op-name> <mode>`")]
    MalformedTableLine { line: usize, text: String },

    #[error("override `{op}` uses {mode}, which cannot be combined with global mode {global}")]
    IncompatibleOverride {
        op: String,
        mode: qlower_core::Mode,
        global: qlower_core::Mode,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("`{node}`: non-negative inputs cannot produce a signed output")]
    SignContradiction { node: String },

    #[error("`{node}`: cannot quantize a value without calibration")]
    QuantizeUncalibrated { node: String },

    #[error("`{node}` ({kind}) was not lowered")]
    UnloweredOp { node: String, kind: OpKind },

    #[error("edge `{producer}` -> `{consumer}` still has mismatched representations")]
    MismatchedEdge { producer: String, consumer: String },
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::UnreadableTable { .. }
            | Error::UnknownMode { .. }
            | Error::MalformedTableLine { .. }
            | Error::IncompatibleOverride { .. }
            | Error::Graph(_) => ErrorClass::Configuration,
            Error::SignContradiction { .. }
            | Error::QuantizeUncalibrated { .. }
            | Error::UnloweredOp { .. }
            | Error::MismatchedEdge { .. } => ErrorClass::Modeling,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
