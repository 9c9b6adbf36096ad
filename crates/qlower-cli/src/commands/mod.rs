pub mod check_table;
pub mod dump;
pub mod lower;

use std::fs;
use std::path::{Path, PathBuf};

use qlower_compiler::ErrorClass;
use qlower_core::{Graph, GraphDoc, GraphError};

/// Why a command failed, and which exit status that maps to.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("cannot read `{}`: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write `{}`: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Compile(#[from] qlower_compiler::Error),
}

impl From<GraphError> for CliError {
    fn from(e: GraphError) -> Self {
        CliError::Compile(e.into())
    }
}

impl CliError {
    /// 1 for I/O, 2 for configuration, 3 for fatal modeling errors.
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Read { .. } | CliError::Write { .. } => 1,
            CliError::Compile(e) => match e.class() {
                ErrorClass::Configuration => 2,
                ErrorClass::Modeling => 3,
            },
        }
    }
}

pub(crate) fn read_text(path: &Path) -> Result<String, CliError> {
    fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_owned(),
        source,
    })
}

pub(crate) fn load_graph(path: &Path) -> Result<Graph, CliError> {
    let text = read_text(path)?;
    let doc = GraphDoc::from_json(&text)?;
    Ok(Graph::from_doc(&doc)?)
}

/// Writes `text` to `path`, or to stdout when no path is given.
pub(crate) fn emit(path: Option<&Path>, text: &str) -> Result<(), CliError> {
    match path {
        Some(path) => fs::write(path, text).map_err(|source| CliError::Write {
            path: path.to_owned(),
            source,
        }),
        None => {
            print!("{text}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_class() {
        let io = CliError::Read {
            path: PathBuf::from("missing.json"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(io.exit_code(), 1);

        let table = CliError::from(qlower_compiler::Error::MalformedTableLine {
            line: 3,
            text: "a b c".into(),
        });
        assert_eq!(table.exit_code(), 2);
        assert_eq!(
            table.to_string(),
            "override table line 3: `a b c` is not `<op-name> <mode>`"
        );

        let graph = CliError::from(GraphError::DuplicateName("x".into()));
        assert_eq!(graph.exit_code(), 2);

        let modeling = CliError::from(qlower_compiler::Error::SignContradiction {
            node: "mul".into(),
        });
        assert_eq!(modeling.exit_code(), 3);
    }

    #[test]
    fn unreadable_file_names_the_path() {
        let err = load_graph(Path::new("/nonexistent/qlower/graph.json")).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().starts_with("cannot read `/nonexistent/qlower/graph.json`"));
    }
}
