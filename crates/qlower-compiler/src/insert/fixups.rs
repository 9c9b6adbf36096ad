//! Small type fixups around insertion.

use qlower_core::{ElementKind, Graph, NodeId, OpKind};
use tracing::debug;

use crate::LoweringContext;

/// Reshape outputs take their input's representation. On CV18xx a reshape
/// reading a graph input is left alone.
pub fn forward_reshape_types(graph: &mut Graph, ctx: &LoweringContext) -> usize {
    let reshapes: Vec<NodeId> = graph
        .order()
        .iter()
        .copied()
        .filter(|&id| graph.kind(id) == OpKind::Reshape)
        .collect();

    let mut changed = 0;
    for id in reshapes {
        let input = graph.input(id, 0);
        if ctx.config.chip.is_cv18xx() && graph.producer_kind(input) == OpKind::Input {
            continue;
        }
        let out = graph.output(id, 0);
        let repr = graph.repr(input);
        if graph.repr(out) != repr {
            graph.set_repr(out, repr);
            changed += 1;
        }
    }
    changed
}

/// Ops running with a fused relu on quantized data get an unbounded relu
/// limit.
pub fn set_relu_limits(graph: &mut Graph) -> usize {
    let candidates: Vec<NodeId> = graph
        .order()
        .iter()
        .copied()
        .filter(|&id| {
            let node = graph.node(id);
            let fusable = matches!(
                node.kind(),
                OpKind::Conv2d
                    | OpKind::MatMul
                    | OpKind::Add
                    | OpKind::Sub
                    | OpKind::Mul
                    | OpKind::MulConst
                    | OpKind::AddConst
                    | OpKind::Relu
            );
            fusable && node.op.does_relu()
        })
        .collect();

    let mut set = 0;
    for id in candidates {
        let quantized = graph
            .outputs(id)
            .first()
            .is_some_and(|&v| graph.repr(v).is_quantized())
            || graph
                .inputs(id)
                .first()
                .is_some_and(|&v| graph.repr(v).is_quantized());
        if quantized {
            graph.node_mut(id).relu_limit = Some(-1.0);
            set += 1;
        }
    }
    set
}

/// CV18xx only: a 16-bit integer conversion right after a graph input
/// (optionally through one reshape) is folded into the input itself.
pub fn elide_input_casts(graph: &mut Graph, ctx: &LoweringContext) -> usize {
    if !ctx.config.chip.is_cv18xx() {
        return 0;
    }
    let casts: Vec<NodeId> = graph
        .order()
        .iter()
        .copied()
        .filter(|&id| graph.kind(id) == OpKind::Cast)
        .collect();

    let mut elided = 0;
    for id in casts {
        let out = graph.output(id, 0);
        let target = graph.repr(out);
        if !matches!(target.storage(), ElementKind::I16 | ElementKind::U16) {
            continue;
        }
        let source = graph.input(id, 0);
        let mut chain = vec![source];
        let mut producer = graph.producer(source);
        if graph.kind(producer) == OpKind::Reshape {
            let input = graph.input(producer, 0);
            chain.push(input);
            producer = graph.producer(input);
        }
        if graph.kind(producer) != OpKind::Input {
            continue;
        }

        for value in chain {
            graph.set_repr(value, target);
        }
        graph.replace_all_uses(out, source);
        debug!(cast = graph.node_name(id), "input conversion elided");
        graph.erase(id);
        elided += 1;
    }
    elided
}
