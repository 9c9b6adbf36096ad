//! Post-pipeline checks.

use qlower_core::{Graph, NodeId, OpKind};
use tracing::debug;

use crate::insert::{expectation, is_exempt, needs_conversion};
use crate::{Error, Result};

/// Every computational node is lowered and no edge still needs a
/// conversion.
pub fn run(graph: &Graph) -> Result<()> {
    for &id in graph.order() {
        let node = graph.node(id);
        if !node.kind().is_leaf() && !node.lowered {
            return Err(Error::UnloweredOp {
                node: node.name().to_owned(),
                kind: node.kind(),
            });
        }
    }

    for &id in graph.order() {
        check_operands(graph, id)?;
    }
    debug!(nodes = graph.node_count(), "graph verified");
    Ok(())
}

fn check_operands(graph: &Graph, id: NodeId) -> Result<()> {
    let node = graph.node(id);
    let kind = node.kind();
    if (kind.is_leaf() && kind != OpKind::Return) || node.conversion || node.inner_requant {
        return Ok(());
    }
    for (operand, &value) in node.inputs().iter().enumerate() {
        if is_exempt(graph, value) {
            continue;
        }
        let src = graph.repr(value);
        let Some(expect) = expectation(graph, id, operand) else {
            continue;
        };
        if needs_conversion(&src, expect) {
            return Err(Error::MismatchedEdge {
                producer: graph.node_name(graph.producer(value)).to_owned(),
                consumer: node.name().to_owned(),
            });
        }
    }
    Ok(())
}
