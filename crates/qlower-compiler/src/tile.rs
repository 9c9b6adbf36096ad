//! Broadcast tiling pre-pass.
//!
//! The backend folds broadcasting binary ops into at most four axes. When
//! two operand shapes cannot be merged down that far, the broadcast on the
//! leading axes is made explicit with Tile nodes. Batched matmuls get the
//! same treatment on mismatched batch axes.

use qlower_core::{Graph, NodeId, Op, OpKind, TensorType, permute};
use tracing::{debug, info};

const BACKEND_MAX_RANK: usize = 4;

/// Inserts Tile nodes where needed. Returns how many were inserted.
pub fn run(graph: &mut Graph) -> usize {
    let snapshot: Vec<NodeId> = graph.order().to_vec();
    let mut inserted = 0;
    for id in snapshot {
        if !graph.is_live(id) {
            continue;
        }
        inserted += match graph.kind(id) {
            OpKind::Add
            | OpKind::Sub
            | OpKind::Mul
            | OpKind::Max
            | OpKind::Min
            | OpKind::Compare => tile_binary(graph, id),
            OpKind::MatMul => tile_matmul(graph, id),
            _ => 0,
        };
    }
    if inserted > 0 {
        info!(tiles = inserted, "broadcast tiling");
    }
    inserted
}

fn tile_binary(graph: &mut Graph, id: NodeId) -> usize {
    let &[lhs, rhs] = graph.inputs(id) else {
        return 0;
    };
    let a = graph.shape(lhs).to_vec();
    let b = graph.shape(rhs).to_vec();
    if a.len() != b.len() || a == b || permute::can_merge_to_4d(&a, &b) {
        return 0;
    }

    let mut inserted = 0;
    for axis in 0..a.len() - BACKEND_MAX_RANK {
        if a[axis] == b[axis] {
            continue;
        }
        if a[axis] == 1 {
            insert_tile(graph, id, 0, axis, b[axis]);
            inserted += 1;
        } else if b[axis] == 1 {
            insert_tile(graph, id, 1, axis, a[axis]);
            inserted += 1;
        }
    }
    inserted
}

fn tile_matmul(graph: &mut Graph, id: NodeId) -> usize {
    let inputs = graph.inputs(id);
    if inputs.len() < 2 {
        return 0;
    }
    let a = graph.shape(inputs[0]).to_vec();
    let b = graph.shape(inputs[1]).to_vec();
    if a.len() <= 2 || a.len() != b.len() {
        return 0;
    }

    let batch = a.len() - 2;
    // leading unit axes of the right operand fold into M
    let merged = b[..batch].iter().rev().take_while(|&&d| d == 1).count();

    let mut inserted = 0;
    for axis in (0..batch - merged).rev() {
        if a[axis] == b[axis] {
            continue;
        }
        if a[axis] == 1 {
            insert_tile(graph, id, 0, axis, b[axis]);
            inserted += 1;
        } else if b[axis] == 1 {
            insert_tile(graph, id, 1, axis, a[axis]);
            inserted += 1;
        }
    }
    inserted
}

fn insert_tile(graph: &mut Graph, id: NodeId, operand: usize, axis: usize, factor: i64) {
    let value = graph.input(id, operand);
    let mut shape = graph.shape(value).to_vec();
    let mut tile = vec![1; shape.len()];
    tile[axis] = factor;
    shape[axis] = factor;

    let name = format!(
        "{}_{}_tile",
        graph.node_name(graph.producer(value)),
        graph.node_name(id)
    );
    let ty = TensorType::new(shape, graph.repr(value));
    let tile_node = graph.insert_before(id, name, Op::Tile { tile }, &[value], vec![ty]);
    let tiled = graph.output(tile_node, 0);
    graph.set_operand(id, operand, tiled);
    debug!(node = graph.node_name(id), operand, axis, factor, "tile inserted");
}
