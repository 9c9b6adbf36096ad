use std::path::PathBuf;

use super::{CliError, load_graph};

pub struct DumpArgs {
    pub graph_path: PathBuf,
}

pub fn run(args: DumpArgs) -> Result<(), CliError> {
    let graph = load_graph(&args.graph_path)?;
    print!("{}", graph.dump());
    Ok(())
}
