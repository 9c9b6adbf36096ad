//! Lowering context and the precision override map.
//!
//! The override map has a three-step lifecycle:
//! 1. cleared when a compilation starts,
//! 2. populated by table loading and the subgraph matchers,
//! 3. frozen before lowering reads it.
//!
//! After freezing, any mutation is a programming error.

use indexmap::IndexMap;
use qlower_core::Mode;

use crate::LowerConfig;

/// Node name to forced execution mode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrecisionOverrideMap {
    entries: IndexMap<String, Mode>,
    frozen: bool,
}

impl PrecisionOverrideMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        crate::invariants::ensure_not_frozen(self.frozen, "clear");
        self.entries.clear();
    }

    /// First writer wins. Returns whether the entry was added.
    pub fn insert_if_absent(&mut self, name: &str, mode: Mode) -> bool {
        crate::invariants::ensure_not_frozen(self.frozen, "insert");
        if self.entries.contains_key(name) {
            return false;
        }
        self.entries.insert(name.to_owned(), mode);
        true
    }

    /// Table assignment, overwriting an earlier entry.
    pub fn assign(&mut self, name: &str, mode: Mode) {
        crate::invariants::ensure_not_frozen(self.frozen, "assign");
        self.entries.insert(name.to_owned(), mode);
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn get(&self, name: &str) -> Option<Mode> {
        self.entries.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Mode)> {
        self.entries.iter().map(|(name, &mode)| (name.as_str(), mode))
    }
}

/// State threaded through every stage.
#[derive(Debug, Clone)]
pub struct LoweringContext {
    pub config: LowerConfig,
    pub overrides: PrecisionOverrideMap,
}

impl LoweringContext {
    pub fn new(config: LowerConfig) -> Self {
        Self {
            config,
            overrides: PrecisionOverrideMap::new(),
        }
    }

    /// Override for `name`, else the global mode.
    pub fn mode_of(&self, name: &str) -> Mode {
        self.overrides.get(name).unwrap_or(self.config.mode)
    }

    /// Pinned to F32 or F16 through the override map.
    pub fn is_float_pinned(&self, name: &str) -> bool {
        matches!(self.overrides.get(name), Some(Mode::F32 | Mode::F16))
    }
}
