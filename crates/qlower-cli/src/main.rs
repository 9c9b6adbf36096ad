mod cli;
mod commands;

use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use cli::{CheckTableParams, DumpParams, LowerParams, build_cli, verbosity};
use commands::CliError;

fn main() -> ExitCode {
    let matches = build_cli().get_matches();
    let Some((name, m)) = matches.subcommand() else {
        return ExitCode::from(1);
    };
    init_tracing(verbosity(m).max(verbosity(&matches)));

    let result = match name {
        "lower" => commands::lower::run(LowerParams::from_matches(m).into()),
        "check-table" => commands::check_table::run(CheckTableParams::from_matches(m).into()),
        "dump" => commands::dump::run(DumpParams::from_matches(m).into()),
        other => {
            eprintln!("error: unknown command `{other}`");
            return ExitCode::from(1);
        }
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(&e),
    }
}

fn report(e: &CliError) -> ExitCode {
    eprintln!("error: {e}");
    ExitCode::from(e.exit_code())
}

/// `RUST_LOG` wins when set; otherwise `-v` picks the level.
fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
