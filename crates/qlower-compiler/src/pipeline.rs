//! The lowering driver.

use qlower_core::{Graph, GraphState};
use tracing::info;

use crate::calibrate::{self, CalibrationStats};
use crate::insert::{self, InsertStats};
use crate::lower::{DefaultLowering, Lowering, LoweringStats};
use crate::mixprec::{self, MatchReport};
use crate::optimize::{self, RewriteStats};
use crate::{LowerConfig, LoweringContext, PrecisionOverrideMap, Result, qtable, tile, verify};

/// Everything a pipeline run did, stage by stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    pub table_entries: usize,
    pub tiles: usize,
    pub calibration: CalibrationStats,
    pub matches: MatchReport,
    /// The override map as lowering saw it.
    pub overrides: PrecisionOverrideMap,
    pub lowering: LoweringStats,
    pub reshape_fixups: usize,
    pub insertion: InsertStats,
    pub relu_limits: usize,
    pub elided_casts: usize,
    /// `None` when structural rewrites were switched off.
    pub rewrites: Option<RewriteStats>,
}

/// Runs every stage in order on one graph.
///
/// A configuration error (bad override table) is reported before the graph
/// is touched. A modeling error can leave the graph half lowered; it must
/// not be used afterwards.
#[derive(Debug, Clone)]
pub struct Pipeline<L = DefaultLowering> {
    config: LowerConfig,
    lowering: L,
    optimize: bool,
}

impl Pipeline {
    pub fn new(config: LowerConfig) -> Self {
        Self::with_lowering(config, DefaultLowering)
    }
}

impl<L: Lowering> Pipeline<L> {
    /// Pipeline with a custom per-op lowering.
    pub fn with_lowering(config: LowerConfig, lowering: L) -> Self {
        Self {
            config,
            lowering,
            optimize: true,
        }
    }

    /// Turns the structural rewrites on or off.
    pub fn optimize(mut self, enabled: bool) -> Self {
        self.optimize = enabled;
        self
    }

    pub fn config(&self) -> &LowerConfig {
        &self.config
    }

    pub fn run(&mut self, graph: &mut Graph) -> Result<PipelineReport> {
        let mut ctx = LoweringContext::new(self.config.clone());
        let mut report = PipelineReport {
            table_entries: qtable::load(graph, &mut ctx)?,
            ..PipelineReport::default()
        };

        report.tiles = tile::run(graph);
        report.calibration = calibrate::run(graph, &ctx)?;
        report.matches = mixprec::run(graph, &mut ctx);
        ctx.overrides.freeze();

        report.lowering = self.lowering.lower(graph, &ctx)?;
        report.reshape_fixups = insert::forward_reshape_types(graph, &ctx);
        report.insertion = insert::run(graph, &ctx)?;
        report.relu_limits = insert::set_relu_limits(graph);
        report.elided_casts = insert::elide_input_casts(graph, &ctx);
        graph.state = GraphState::Quantized;
        verify::run(graph)?;

        if self.optimize {
            report.rewrites = Some(optimize::run(graph, &ctx));
            verify::run(graph)?;
        }

        info!(
            graph = graph.name(),
            chip = %ctx.config.chip,
            mode = %ctx.config.mode,
            nodes = graph.node_count(),
            "lowering pipeline done"
        );
        report.overrides = ctx.overrides;
        Ok(report)
    }
}
