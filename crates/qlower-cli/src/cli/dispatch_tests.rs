//! Tests for CLI dispatch logic.

use std::path::PathBuf;

use qlower_core::{Chip, Mode};

use super::*;
use crate::cli::commands::{check_table_command, dump_command, lower_command};
use crate::commands::lower::LowerArgs;

#[test]
fn lower_extracts_all_fields() {
    let m = lower_command()
        .try_get_matches_from([
            "lower",
            "model.json",
            "--chip",
            "BM1684X",
            "--mode",
            "int8",
            "--qtable",
            "model.qtable",
            "--asymmetric",
            "--group-size",
            "64",
            "--ignore-f16-overflow",
            "--no-optimize",
            "-o",
            "out.json",
            "--compact",
        ])
        .unwrap();

    let params = LowerParams::from_matches(&m);

    assert_eq!(params.graph_path, PathBuf::from("model.json"));
    assert_eq!(params.chip, Chip::Bm1684x);
    assert_eq!(params.mode, Mode::Int8);
    assert_eq!(params.qtable, Some(PathBuf::from("model.qtable")));
    assert!(params.asymmetric);
    assert_eq!(params.group_size, 64);
    assert!(params.ignore_f16_overflow);
    assert_eq!(params.output, Some(PathBuf::from("out.json")));

    let args: LowerArgs = params.into();
    assert!(!args.optimize);
    assert!(!args.pretty);
}

#[test]
fn lower_defaults() {
    let m = lower_command()
        .try_get_matches_from(["lower", "model.json", "--chip", "sg2260", "--mode", "f16"])
        .unwrap();

    let args: LowerArgs = LowerParams::from_matches(&m).into();

    assert_eq!(args.chip, Chip::Sg2260);
    assert_eq!(args.qtable_path, None);
    assert_eq!(args.group_size, 0);
    assert!(args.optimize);
    assert!(args.pretty);
    assert_eq!(args.output, None);
}

#[test]
fn lower_requires_chip_and_mode() {
    let missing_chip = lower_command().try_get_matches_from(["lower", "model.json", "--mode", "int8"]);
    assert!(missing_chip.is_err());

    let missing_mode =
        lower_command().try_get_matches_from(["lower", "model.json", "--chip", "bm1684x"]);
    assert!(missing_mode.is_err());
}

#[test]
fn unknown_mode_keyword_rejected_by_parser() {
    let err = lower_command()
        .try_get_matches_from(["lower", "model.json", "--chip", "bm1684x", "--mode", "int16"])
        .unwrap_err();

    assert!(err.to_string().contains("unknown mode keyword `int16`"));
}

#[test]
fn unknown_chip_rejected_by_parser() {
    let err = lower_command()
        .try_get_matches_from(["lower", "model.json", "--chip", "tpu9", "--mode", "int8"])
        .unwrap_err();

    assert!(err.to_string().contains("unknown chip `tpu9`"));
}

#[test]
fn check_table_chip_defaults_to_bm1684x() {
    let m = check_table_command()
        .try_get_matches_from(["check-table", "model.qtable", "--mode", "bf16"])
        .unwrap();

    let params = CheckTableParams::from_matches(&m);

    assert_eq!(params.table_path, PathBuf::from("model.qtable"));
    assert_eq!(params.chip, Chip::Bm1684x);
    assert_eq!(params.mode, Mode::Bf16);
    assert!(!params.json);
}

#[test]
fn check_table_accepts_json_flag() {
    let m = check_table_command()
        .try_get_matches_from([
            "check-table",
            "model.qtable",
            "--mode",
            "int8",
            "--chip",
            "cv183x",
            "--json",
        ])
        .unwrap();

    let params = CheckTableParams::from_matches(&m);

    assert_eq!(params.chip, Chip::Cv183x);
    assert!(params.json);
}

#[test]
fn dump_takes_a_graph() {
    let m = dump_command()
        .try_get_matches_from(["dump", "model.json"])
        .unwrap();

    let params = DumpParams::from_matches(&m);

    assert_eq!(params.graph_path, PathBuf::from("model.json"));
    assert!(dump_command().try_get_matches_from(["dump"]).is_err());
}

#[test]
fn verbosity_is_global() {
    let m = build_cli()
        .try_get_matches_from(["qlower", "dump", "model.json", "-vv"])
        .unwrap();
    let (_, sub) = m.subcommand().unwrap();

    assert_eq!(verbosity(sub).max(verbosity(&m)), 2);
}

#[test]
fn subcommand_required() {
    assert!(build_cli().try_get_matches_from(["qlower"]).is_err());
}

#[test]
fn help_lists_commands() {
    let mut cmd = build_cli();
    let help = cmd.render_help().to_string();

    assert!(help.contains("lower"));
    assert!(help.contains("check-table"));
    assert!(help.contains("dump"));
}
