//! Dispatch logic: extract params from ArgMatches and convert to command args.

use std::path::PathBuf;

use clap::ArgMatches;
use qlower_core::{Chip, Mode};

use crate::commands::check_table::CheckTableArgs;
use crate::commands::dump::DumpArgs;
use crate::commands::lower::LowerArgs;

pub struct LowerParams {
    pub graph_path: PathBuf,
    pub chip: Chip,
    pub mode: Mode,
    pub qtable: Option<PathBuf>,
    pub asymmetric: bool,
    pub group_size: u32,
    pub ignore_f16_overflow: bool,
    pub no_optimize: bool,
    pub output: Option<PathBuf>,
    pub compact: bool,
}

impl LowerParams {
    pub fn from_matches(m: &ArgMatches) -> Self {
        Self {
            graph_path: graph_path(m),
            chip: chip(m),
            mode: mode(m),
            qtable: m.get_one::<PathBuf>("qtable").cloned(),
            asymmetric: m.get_flag("asymmetric"),
            group_size: m.get_one::<u32>("group_size").copied().unwrap_or(0),
            ignore_f16_overflow: m.get_flag("ignore_f16_overflow"),
            no_optimize: m.get_flag("no_optimize"),
            output: m.get_one::<PathBuf>("output").cloned(),
            compact: m.get_flag("compact"),
        }
    }
}

impl From<LowerParams> for LowerArgs {
    fn from(p: LowerParams) -> Self {
        Self {
            graph_path: p.graph_path,
            chip: p.chip,
            mode: p.mode,
            qtable_path: p.qtable,
            asymmetric: p.asymmetric,
            group_size: p.group_size,
            ignore_f16_overflow: p.ignore_f16_overflow,
            optimize: !p.no_optimize,
            output: p.output,
            pretty: !p.compact,
        }
    }
}

pub struct CheckTableParams {
    pub table_path: PathBuf,
    pub chip: Chip,
    pub mode: Mode,
    pub json: bool,
}

impl CheckTableParams {
    pub fn from_matches(m: &ArgMatches) -> Self {
        Self {
            table_path: m.get_one::<PathBuf>("table_path").cloned().unwrap_or_default(),
            chip: chip(m),
            mode: mode(m),
            json: m.get_flag("json"),
        }
    }
}

impl From<CheckTableParams> for CheckTableArgs {
    fn from(p: CheckTableParams) -> Self {
        Self {
            table_path: p.table_path,
            chip: p.chip,
            mode: p.mode,
            json: p.json,
        }
    }
}

pub struct DumpParams {
    pub graph_path: PathBuf,
}

impl DumpParams {
    pub fn from_matches(m: &ArgMatches) -> Self {
        Self {
            graph_path: graph_path(m),
        }
    }
}

impl From<DumpParams> for DumpArgs {
    fn from(p: DumpParams) -> Self {
        Self {
            graph_path: p.graph_path,
        }
    }
}

/// Verbosity count from `-v` flags; global, so any subcommand carries it.
pub fn verbosity(m: &ArgMatches) -> u8 {
    m.get_count("verbose")
}

// Required args are enforced by clap; the fallbacks only keep extraction total.

fn graph_path(m: &ArgMatches) -> PathBuf {
    m.get_one::<PathBuf>("graph_path").cloned().unwrap_or_default()
}

fn chip(m: &ArgMatches) -> Chip {
    m.get_one::<Chip>("chip").copied().unwrap_or(Chip::Bm1684x)
}

fn mode(m: &ArgMatches) -> Mode {
    m.get_one::<Mode>("mode").copied().unwrap_or(Mode::F32)
}
