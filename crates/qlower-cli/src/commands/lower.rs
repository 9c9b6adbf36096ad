use std::path::{Path, PathBuf};

use qlower_compiler::{LowerConfig, Pipeline};
use qlower_core::{Chip, Mode};
use tracing::info;

use super::{CliError, emit, load_graph, read_text};

pub struct LowerArgs {
    pub graph_path: PathBuf,
    pub chip: Chip,
    pub mode: Mode,
    pub qtable_path: Option<PathBuf>,
    pub asymmetric: bool,
    pub group_size: u32,
    pub ignore_f16_overflow: bool,
    pub optimize: bool,
    pub output: Option<PathBuf>,
    pub pretty: bool,
}

pub fn run(args: LowerArgs) -> Result<(), CliError> {
    let mut builder = LowerConfig::builder(args.chip, args.mode)
        .asymmetric(args.asymmetric)
        .quant_group_size(args.group_size)
        .ignore_f16_overflow(args.ignore_f16_overflow);
    if let Some(path) = &args.qtable_path {
        let text = read_table(path)?;
        builder = builder.qtable(text);
    }

    let mut graph = load_graph(&args.graph_path)?;
    let report = Pipeline::new(builder.build())
        .optimize(args.optimize)
        .run(&mut graph)?;
    info!(
        lowered = report.lowering.lowered,
        conversions = report.insertion.inserted,
        rewrites = report.rewrites.as_ref().map_or(0, |r| r.rewrites_applied),
        "graph lowered"
    );

    let mut json = graph.to_doc().to_json(args.pretty);
    json.push('\n');
    emit(args.output.as_deref(), &json)
}

/// An unreadable table is a configuration error, not plain I/O.
fn read_table(path: &Path) -> Result<String, CliError> {
    read_text(path).map_err(|e| match e {
        CliError::Read { path, source } => CliError::Compile(qlower_compiler::Error::UnreadableTable {
            path: path.display().to_string(),
            reason: source.to_string(),
        }),
        other => other,
    })
}
