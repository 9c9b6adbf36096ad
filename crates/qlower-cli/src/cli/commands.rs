//! Command builders for the CLI.

use clap::Command;

use super::args::*;

/// Build the complete CLI with all subcommands.
pub fn build_cli() -> Command {
    Command::new("qlower")
        .about("Lowers calibrated tensor graphs to accelerator precision")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(verbose_arg())
        .subcommand(lower_command())
        .subcommand(check_table_command())
        .subcommand(dump_command())
}

/// Run the lowering pipeline on a graph document.
pub fn lower_command() -> Command {
    Command::new("lower")
        .about("Lower a calibrated graph")
        .override_usage("  qlower lower <GRAPH> --chip <CHIP> --mode <MODE> [OPTIONS]")
        .after_help(
            r#"EXAMPLES:
  qlower lower model.json --chip bm1684x --mode int8
  qlower lower model.json --chip bm1684x --mode int8 --qtable model.qtable
  qlower lower model.json --chip cv183x --mode bf16 -o lowered.json --compact
  qlower lower model.json --chip bm1684x --mode f16 --no-optimize -vv"#,
        )
        .arg(graph_path_arg())
        .arg(chip_arg().required(true))
        .arg(mode_arg())
        .arg(qtable_arg())
        .arg(asymmetric_arg())
        .arg(group_size_arg())
        .arg(ignore_f16_overflow_arg())
        .arg(no_optimize_arg())
        .arg(output_file_arg())
        .arg(compact_arg())
}

/// Validate a precision override table.
pub fn check_table_command() -> Command {
    Command::new("check-table")
        .about("Validate a precision override table")
        .after_help(
            r#"EXAMPLES:
  qlower check-table model.qtable --mode int8
  qlower check-table model.qtable --mode bf16 --chip cv183x
  qlower check-table model.qtable --mode f16 --json"#,
        )
        .arg(table_path_arg())
        .arg(mode_arg())
        .arg(chip_arg().default_value("bm1684x"))
        .arg(json_arg())
}

/// Print a readable listing of a graph document.
pub fn dump_command() -> Command {
    Command::new("dump")
        .about("Print a graph document as text")
        .arg(graph_path_arg())
}
