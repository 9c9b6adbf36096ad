//! Human-readable graph listing.

use std::fmt::Write;

use crate::{Graph, Op, OpKind};

impl Graph {
    /// One line per node in program order:
    /// `name = kind(operands) -> [shape] repr {mode}`.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for &id in self.order() {
            let node = self.node(id);
            if node.kind() == OpKind::Return {
                let operands: Vec<String> =
                    node.inputs().iter().map(|&v| self.value_ref(v)).collect();
                let _ = writeln!(out, "return({})", operands.join(", "));
                continue;
            }

            let operands: Vec<String> = node.inputs().iter().map(|&v| self.value_ref(v)).collect();
            let _ = write!(out, "{} = {}", node.name(), node.kind());
            if let Some(attrs) = attrs(&node.op) {
                let _ = write!(out, "<{attrs}>");
            }
            let _ = write!(out, "({})", operands.join(", "));

            let results: Vec<String> = node
                .outputs()
                .iter()
                .map(|&v| {
                    let ty = self.ty(v);
                    let dims: Vec<String> = ty.shape.iter().map(i64::to_string).collect();
                    format!("[{}] {}", dims.join(", "), ty.repr)
                })
                .collect();
            let _ = write!(out, " -> {}", results.join(", "));
            if let Some(mode) = node.mode {
                let _ = write!(out, " {{{mode}}}");
            }
            out.push('\n');
        }
        out
    }
}

fn join(values: &[i64]) -> String {
    values
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn attrs(op: &Op) -> Option<String> {
    match op {
        Op::Permute { order } => Some(join(order)),
        Op::Tile { tile } => Some(join(tile)),
        Op::Softmax { axis } => Some(format!("axis={axis}")),
        Op::MulConst { const_val, .. }
        | Op::AddConst { const_val, .. }
        | Op::SubConst { const_val, .. }
        | Op::MaskedFill { const_val, .. } => Some(const_val.to_string()),
        Op::RequantFp { scale } | Op::CpuQuant { scale } => Some(format!("scale={scale}")),
        Op::Conv2d { groups, .. } => Some(format!("groups={groups}")),
        Op::MatMul {
            left_transpose,
            right_transpose,
            hdim_is_batch,
            ..
        } => {
            let flags: Vec<&str> = [
                (*left_transpose, "lt"),
                (*right_transpose, "rt"),
                (*hdim_is_batch, "hdim"),
            ]
            .into_iter()
            .filter_map(|(on, flag)| on.then_some(flag))
            .collect();
            (!flags.is_empty()).then(|| flags.join(","))
        }
        _ => None,
    }
}
