//! Lowering configuration.

use qlower_core::{Chip, Mode};

/// Options the pipeline reads. Build with [`LowerConfig::builder`].
#[derive(Debug, Clone, PartialEq)]
pub struct LowerConfig {
    pub chip: Chip,
    pub mode: Mode,
    pub asymmetric: bool,
    /// Grouped weight quantization size, 0 for per-channel.
    pub quant_group_size: u32,
    pub ignore_f16_overflow: bool,
    /// Override table text, one `<op-name> <mode>` per line.
    pub qtable: Option<String>,
    /// Leave deep feed-forward matmuls at the global mode.
    pub partial_ffn: bool,
    pub ffn_depth_threshold: usize,
    /// Parallel channel width of the backend, in bytes.
    pub ic_parallel_bytes: u32,
    pub max_rewrite_iterations: usize,
}

impl LowerConfig {
    pub fn builder(chip: Chip, mode: Mode) -> LowerConfigBuilder {
        LowerConfigBuilder::new(chip, mode)
    }

    /// Matchers and structural rewrites target these families only.
    pub fn is_bm1684x_or_sg2260(&self) -> bool {
        self.chip.is_bm1684x_family() || self.chip.is_sg2260_family()
    }
}

/// Builder for [`LowerConfig`].
#[derive(Debug, Clone)]
pub struct LowerConfigBuilder {
    config: LowerConfig,
}

impl LowerConfigBuilder {
    pub fn new(chip: Chip, mode: Mode) -> Self {
        Self {
            config: LowerConfig {
                chip,
                mode,
                asymmetric: false,
                quant_group_size: 0,
                ignore_f16_overflow: false,
                qtable: None,
                partial_ffn: false,
                ffn_depth_threshold: 5,
                ic_parallel_bytes: 64,
                max_rewrite_iterations: 64,
            },
        }
    }

    pub fn asymmetric(mut self, asymmetric: bool) -> Self {
        self.config.asymmetric = asymmetric;
        self
    }

    pub fn quant_group_size(mut self, size: u32) -> Self {
        self.config.quant_group_size = size;
        self
    }

    pub fn ignore_f16_overflow(mut self, ignore: bool) -> Self {
        self.config.ignore_f16_overflow = ignore;
        self
    }

    pub fn qtable(mut self, text: impl Into<String>) -> Self {
        self.config.qtable = Some(text.into());
        self
    }

    pub fn partial_ffn(mut self, partial: bool) -> Self {
        self.config.partial_ffn = partial;
        self
    }

    pub fn ffn_depth_threshold(mut self, depth: usize) -> Self {
        self.config.ffn_depth_threshold = depth;
        self
    }

    pub fn ic_parallel_bytes(mut self, bytes: u32) -> Self {
        self.config.ic_parallel_bytes = bytes;
        self
    }

    pub fn max_rewrite_iterations(mut self, limit: usize) -> Self {
        self.config.max_rewrite_iterations = limit;
        self
    }

    pub fn build(self) -> LowerConfig {
        self.config
    }
}
