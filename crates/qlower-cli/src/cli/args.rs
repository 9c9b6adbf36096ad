//! Shared argument builders for CLI commands.
//!
//! Each function returns a `clap::Arg` that can be composed into commands.

use std::path::PathBuf;

use clap::{Arg, ArgAction, value_parser};
use qlower_core::{Chip, Mode};

/// Graph document (positional).
pub fn graph_path_arg() -> Arg {
    Arg::new("graph_path")
        .value_name("GRAPH")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Graph document (JSON)")
}

/// Override table (positional).
pub fn table_path_arg() -> Arg {
    Arg::new("table_path")
        .value_name("FILE")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Precision override table")
}

/// Target hardware family (--chip).
pub fn chip_arg() -> Arg {
    Arg::new("chip")
        .long("chip")
        .value_name("CHIP")
        .value_parser(|s: &str| s.parse::<Chip>())
        .help("Target chip (bm1684x, bm1688, bm1684, cv183x, cv182x, cv181x, cv180x, sg2260)")
}

/// Global quantization mode (--mode).
pub fn mode_arg() -> Arg {
    Arg::new("mode")
        .long("mode")
        .value_name("MODE")
        .required(true)
        .value_parser(|s: &str| s.parse::<Mode>())
        .help("Global mode (f32, f16, bf16, int8, uint8, int4, f8e4m3, f8e5m2, w8f16, ...)")
}

/// Override table for `lower` (--qtable).
pub fn qtable_arg() -> Arg {
    Arg::new("qtable")
        .long("qtable")
        .value_name("FILE")
        .value_parser(value_parser!(PathBuf))
        .help("Precision override table, one `<op-name> <mode>` per line")
}

/// Asymmetric quantization (--asymmetric).
pub fn asymmetric_arg() -> Arg {
    Arg::new("asymmetric")
        .long("asymmetric")
        .action(ArgAction::SetTrue)
        .help("Use asymmetric quantization")
}

/// Grouped weight quantization (--group-size).
pub fn group_size_arg() -> Arg {
    Arg::new("group_size")
        .long("group-size")
        .value_name("N")
        .default_value("0")
        .value_parser(value_parser!(u32))
        .help("Weight quantization group size (0 = per-channel)")
}

/// Keep average pools in the 16-bit float mode (--ignore-f16-overflow).
pub fn ignore_f16_overflow_arg() -> Arg {
    Arg::new("ignore_f16_overflow")
        .long("ignore-f16-overflow")
        .action(ArgAction::SetTrue)
        .help("Do not pin average pools to F32 in 16-bit float modes")
}

/// Skip structural rewrites (--no-optimize).
pub fn no_optimize_arg() -> Arg {
    Arg::new("no_optimize")
        .long("no-optimize")
        .action(ArgAction::SetTrue)
        .help("Skip structural rewrites after lowering")
}

/// Write output to file (-o/--output).
pub fn output_file_arg() -> Arg {
    Arg::new("output")
        .short('o')
        .long("output")
        .value_name("FILE")
        .value_parser(value_parser!(PathBuf))
        .help("Write output to file")
}

/// Output compact JSON (--compact).
pub fn compact_arg() -> Arg {
    Arg::new("compact")
        .long("compact")
        .action(ArgAction::SetTrue)
        .help("Output compact JSON (default: pretty)")
}

/// Print table entries as JSON (--json).
pub fn json_arg() -> Arg {
    Arg::new("json")
        .long("json")
        .action(ArgAction::SetTrue)
        .help("Print entries as a JSON array")
}

/// Verbosity level (-v, -vv).
pub fn verbose_arg() -> Arg {
    Arg::new("verbose")
        .short('v')
        .long("verbose")
        .action(ArgAction::Count)
        .global(true)
        .help("Log stage summaries (-v) or every rule application (-vv)")
}
