//! Precision-override table.
//!
//! One override per line: `<op-name><whitespace><mode-keyword>`. Blank lines
//! and lines starting with `#` are skipped. A line holding a single token is
//! tolerated and ignored with a warning. Anything else is malformed.

use qlower_core::{Graph, Mode, OpKind};
use tracing::{debug, info, warn};

use crate::{Error, LoweringContext, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    /// 1-based line number.
    pub line: usize,
    pub name: String,
    pub mode: Mode,
}

#[derive(Debug, PartialEq, Eq)]
enum Line<'a> {
    Blank,
    Comment,
    Bare(&'a str),
    Entry(&'a str, &'a str),
    Malformed,
}

fn classify(line: &str) -> Line<'_> {
    if line.trim().is_empty() {
        return Line::Blank;
    }
    if line.starts_with('#') {
        return Line::Comment;
    }
    if line.starts_with(char::is_whitespace) || line.ends_with(char::is_whitespace) {
        return Line::Malformed;
    }
    let mut tokens = line.split_whitespace();
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(name), None, None) => Line::Bare(name),
        (Some(name), Some(mode), None) => Line::Entry(name, mode),
        _ => Line::Malformed,
    }
}

/// Parses table text and validates modes against the configuration.
pub fn parse(text: &str, ctx: &LoweringContext) -> Result<Vec<TableEntry>> {
    let global = ctx.config.mode;
    let mut entries = Vec::new();

    for (idx, raw) in text.split('\n').enumerate() {
        let line = idx + 1;
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        let (name, keyword) = match classify(raw) {
            Line::Blank | Line::Comment => continue,
            Line::Bare(token) => {
                warn!(line, token, "override table line has no mode, ignored");
                continue;
            }
            Line::Malformed => {
                return Err(Error::MalformedTableLine {
                    line,
                    text: raw.to_owned(),
                });
            }
            Line::Entry(name, keyword) => (name, keyword),
        };

        let mut mode = keyword
            .parse::<Mode>()
            .map_err(|source| Error::UnknownMode { line, source })?;
        if ctx.config.chip.is_cv18xx() && matches!(mode, Mode::F32 | Mode::F16) {
            mode = Mode::Bf16;
        }
        check_compatible(name, mode, global)?;

        entries.push(TableEntry {
            line,
            name: name.to_owned(),
            mode,
        });
    }
    Ok(entries)
}

fn check_compatible(name: &str, mode: Mode, global: Mode) -> Result<()> {
    let weight_f16 = matches!(mode, Mode::W8f16 | Mode::W4f16);
    let weight_bf16 = matches!(mode, Mode::W8bf16 | Mode::W4bf16);
    if (weight_f16 && global.is_bf16_family()) || (weight_bf16 && global.is_f16_family()) {
        return Err(Error::IncompatibleOverride {
            op: name.to_owned(),
            mode,
            global,
        });
    }
    Ok(())
}

/// Resets the override map and fills it from the configured table.
///
/// Average pools are pinned to F32 first in F16-family modes unless
/// overflow is explicitly ignored. Table lines may overwrite that pin.
pub fn load(graph: &Graph, ctx: &mut LoweringContext) -> Result<usize> {
    ctx.overrides.clear();

    if !ctx.config.ignore_f16_overflow && ctx.config.mode.is_f16_family() {
        for &id in graph.order() {
            if graph.kind(id) == OpKind::AvgPool {
                let name = graph.node_name(id);
                debug!(node = name, "avg pool pinned to F32");
                ctx.overrides.assign(name, Mode::F32);
            }
        }
    }

    let entries = match &ctx.config.qtable {
        Some(text) => parse(text, ctx)?,
        None => Vec::new(),
    };
    for entry in &entries {
        ctx.overrides.assign(&entry.name, entry.mode);
    }

    info!(
        table_entries = entries.len(),
        overrides = ctx.overrides.len(),
        "override table loaded"
    );
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_classes() {
        assert_eq!(classify(""), Line::Blank);
        assert_eq!(classify("   \t"), Line::Blank);
        assert_eq!(classify("# a comment"), Line::Comment);
        assert_eq!(classify("conv1"), Line::Bare("conv1"));
        assert_eq!(classify("conv1  F16"), Line::Entry("conv1", "F16"));
        assert_eq!(classify("conv1\tF16"), Line::Entry("conv1", "F16"));
        assert_eq!(classify("a b c"), Line::Malformed);
        assert_eq!(classify(" conv1 F16"), Line::Malformed);
        assert_eq!(classify("conv1 F16 "), Line::Malformed);
    }
}
