use std::path::PathBuf;

use qlower_compiler::{LowerConfig, LoweringContext, qtable};
use qlower_core::{Chip, Mode};

use super::{CliError, read_text};

pub struct CheckTableArgs {
    pub table_path: PathBuf,
    pub chip: Chip,
    pub mode: Mode,
    pub json: bool,
}

pub fn run(args: CheckTableArgs) -> Result<(), CliError> {
    let text = read_text(&args.table_path)?;
    let ctx = LoweringContext::new(LowerConfig::builder(args.chip, args.mode).build());
    let entries = qtable::parse(&text, &ctx)?;
    print!("{}", render(&entries, args.json));
    Ok(())
}

fn render(entries: &[qtable::TableEntry], json: bool) -> String {
    if json {
        let list: Vec<serde_json::Value> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "line": e.line,
                    "name": e.name,
                    "mode": e.mode.to_string(),
                })
            })
            .collect();
        let mut out = serde_json::Value::Array(list).to_string();
        out.push('\n');
        return out;
    }
    entries
        .iter()
        .map(|e| format!("{} {}\n", e.name, e.mode))
        .collect()
}
