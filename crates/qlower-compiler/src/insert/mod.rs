//! Precision-boundary insertion.
//!
//! One walk over program order once every node has its final mode. Each
//! operand edge is compared against what its consumer expects and, when
//! the two disagree, an explicit conversion node is spliced in right after
//! the producer. Conversions already hanging off the same value are reused
//! when they produce exactly the needed representation.

mod fixups;


pub use fixups::{elide_input_casts, forward_reshape_types, set_relu_limits};

use qlower_core::{
    ElementKind, Graph, Mode, NodeId, Op, OpKind, Representation, TensorType, ValueId,
};
use tracing::{debug, info};

use crate::lower::{implied_range, quantize_int4, quantize_range};
use crate::{Error, LoweringContext, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertStats {
    pub inserted: usize,
    pub reused: usize,
    pub inputs_retyped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// Float to float of another width.
    Cast,
    Quantize,
    Dequantize,
}

/// What a consumer expects on one operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    /// Any quantized representation; `f8` selects the narrow-float domain.
    Quantized { f8: bool },
    Float(ElementKind),
}

pub fn run(graph: &mut Graph, ctx: &LoweringContext) -> Result<InsertStats> {
    let mut stats = InsertStats::default();
    if !ctx.config.chip.is_cv18xx() {
        stats.inputs_retyped = retype_inputs(graph);
    }

    let snapshot: Vec<NodeId> = graph.order().to_vec();
    for id in snapshot {
        if !graph.is_live(id) {
            continue;
        }
        let kind = graph.kind(id);
        let node = graph.node(id);
        if (kind.is_leaf() && kind != OpKind::Return) || node.conversion || node.inner_requant {
            continue;
        }

        for operand in 0..graph.inputs(id).len() {
            let value = graph.input(id, operand);
            if is_exempt(graph, value) {
                continue;
            }
            let Some(expect) = expectation(graph, id, operand) else {
                continue;
            };
            let Some((conversion, target)) = plan(graph, ctx, value, expect)? else {
                continue;
            };
            let converted = materialize(graph, ctx, value, id, conversion, target, &mut stats);
            graph.set_operand(id, operand, converted);
        }
    }

    info!(
        inserted = stats.inserted,
        reused = stats.reused,
        inputs = stats.inputs_retyped,
        "conversions inserted"
    );
    Ok(stats)
}

/// Operands traced back to weights (through reshapes) or None placeholders.
pub(crate) fn is_exempt(graph: &Graph, value: ValueId) -> bool {
    let mut current = value;
    loop {
        match graph.producer_kind(current) {
            OpKind::None | OpKind::Weight => return true,
            OpKind::Reshape => current = graph.input(graph.producer(current), 0),
            _ => return false,
        }
    }
}

/// Expected representation class for `operand` of `node`, or `None` when
/// the operand is never converted.
pub(crate) fn expectation(graph: &Graph, node: NodeId, operand: usize) -> Option<Expect> {
    let kind = graph.kind(node);
    let skip = match kind {
        OpKind::Where | OpKind::MaskedFill => operand == 0,
        OpKind::GatherElements => operand >= 1,
        OpKind::ScatterElements => operand == 1 || operand == 3,
        OpKind::ScatterNd => operand == 1,
        _ => false,
    };
    if skip {
        return None;
    }

    if kind == OpKind::Return {
        let value = graph.input(node, operand);
        let src = graph.repr(value);
        let storage = src.storage();
        let eligible = src.is_quantized()
            || matches!(storage, ElementKind::F16 | ElementKind::Bf16)
            || storage.is_f8()
            || (storage == ElementKind::F32 && src.is_calibrated());
        if !eligible {
            return None;
        }
        let declared = *graph.result_kinds().get(operand)?;
        return Some(if declared.is_float() {
            Expect::Float(declared)
        } else {
            Expect::Quantized { f8: false }
        });
    }

    // Arg indices carry no precision; the values output does.
    let reference = match kind {
        OpKind::Arg => *graph.outputs(node).get(1)?,
        _ => *graph.outputs(node).first()?,
    };
    let repr = graph.repr(reference);
    if repr.is_quantized() {
        Some(Expect::Quantized {
            f8: repr.storage() == ElementKind::F8e4m3,
        })
    } else if repr.storage().is_float() {
        Some(Expect::Float(repr.storage()))
    } else {
        None
    }
}

/// Whether `src` must be converted to satisfy `expect`. Quantized values
/// feeding quantized consumers of the same domain are rescaled inside the
/// consumer; crossing between integer and narrow-float storage is not.
pub(crate) fn needs_conversion(src: &Representation, expect: Expect) -> bool {
    let storage = src.storage();
    match expect {
        Expect::Float(elem) => src.is_quantized() || (storage.is_float() && storage != elem),
        Expect::Quantized { f8 } if src.is_quantized() => (storage == ElementKind::F8e4m3) != f8,
        Expect::Quantized { .. } => storage.is_float(),
    }
}

fn plan(
    graph: &Graph,
    ctx: &LoweringContext,
    value: ValueId,
    expect: Expect,
) -> Result<Option<(Conversion, Representation)>> {
    let src = graph.repr(value);
    if !needs_conversion(&src, expect) {
        return Ok(None);
    }
    let planned = match expect {
        Expect::Float(elem) if src.is_quantized() => {
            (Conversion::Dequantize, Representation::plain(elem))
        }
        Expect::Float(elem) => (Conversion::Cast, src.retyped(elem)),
        Expect::Quantized { f8 } => {
            let Some(range) = src.range().or_else(|| implied_range(&src)) else {
                return Err(Error::QuantizeUncalibrated {
                    node: graph.node_name(graph.producer(value)).to_owned(),
                });
            };
            let asymmetric = ctx.config.asymmetric;
            let target = if f8 {
                quantize_range(range, Mode::F8e4m3, false)
            } else if feeds_only_int4(graph, ctx, value) {
                quantize_int4(range, asymmetric)
            } else {
                let mode = match ctx.config.mode {
                    Mode::Uint8 => Mode::Uint8,
                    _ => Mode::Int8,
                };
                quantize_range(range, mode, asymmetric)
            };
            (Conversion::Quantize, target)
        }
    };
    Ok(Some(planned))
}

/// Global INT4 and every consumer is a matmul or a non-depthwise conv.
fn feeds_only_int4(graph: &Graph, ctx: &LoweringContext, value: ValueId) -> bool {
    if ctx.config.mode != Mode::Int4 {
        return false;
    }
    let users = graph.users(value);
    !users.is_empty()
        && users.iter().all(|&user| match graph.kind(user) {
            OpKind::MatMul => true,
            OpKind::Conv2d => !is_depthwise(graph, user),
            _ => false,
        })
}

pub(crate) fn is_depthwise(graph: &Graph, conv: NodeId) -> bool {
    let Op::Conv2d { groups, .. } = graph.node(conv).op else {
        return false;
    };
    let Some(&filter) = graph.inputs(conv).get(1) else {
        return false;
    };
    let shape = graph.shape(filter);
    groups > 1 && shape.len() >= 2 && shape[0] == groups && shape[1] == 1
}

fn materialize(
    graph: &mut Graph,
    ctx: &LoweringContext,
    value: ValueId,
    consumer: NodeId,
    conversion: Conversion,
    target: Representation,
    stats: &mut InsertStats,
) -> ValueId {
    let existing = graph.users(value).into_iter().find(|&user| {
        graph.node(user).conversion && graph.repr(graph.output(user, 0)) == target
    });
    if let Some(user) = existing {
        stats.reused += 1;
        return graph.output(user, 0);
    }

    let producer = graph.producer(value);
    let src = graph.repr(value);
    let mut base = graph.node_name(producer).to_owned();
    if graph.kind(consumer) != OpKind::Return {
        base = format!("{base}_{}", graph.node_name(consumer));
    }

    let (name, op) = match (conversion, &src, &target) {
        (
            Conversion::Dequantize,
            Representation::Quantized {
                storage: ElementKind::F8e4m3,
                scale,
                ..
            },
            _,
        ) => (
            format!("{base}_{}_dequant", target.storage()),
            Op::MulConst {
                const_val: *scale,
                do_relu: false,
            },
        ),
        (
            Conversion::Quantize,
            _,
            Representation::Quantized {
                storage: ElementKind::F8e4m3,
                scale,
                ..
            },
        ) => {
            (
                format!("{base}_requant"),
                Op::RequantFp {
                    scale: 1.0 / scale,
                },
            )
        }
        (Conversion::Quantize, _, Representation::Quantized { scale, .. })
            if ctx.config.chip.is_cv18xx() && graph.kind(producer) == OpKind::Input =>
        {
            (
                format!("{base}_{}", target.storage()),
                Op::CpuQuant {
                    scale: 1.0 / scale,
                },
            )
        }
        _ => (format!("{base}_{}", target.storage()), Op::Cast),
    };

    let shape = graph.shape(value).to_vec();
    let id = graph.insert_after(producer, name, op, &[value], vec![TensorType::new(shape, target)]);
    let mode = graph.node(consumer).mode;
    let node = graph.node_mut(id);
    node.conversion = true;
    node.lowered = true;
    node.mode = mode;
    stats.inserted += 1;
    debug!(
        conversion = ?conversion,
        node = graph.node_name(id),
        %target,
        "conversion inserted"
    );
    graph.output(id, 0)
}

/// Inputs whose lowered storage differs from the host kind are handed the
/// host kind back, with a conversion to the old representation for their
/// former readers.
fn retype_inputs(graph: &mut Graph) -> usize {
    let inputs: Vec<NodeId> = graph
        .order()
        .iter()
        .copied()
        .filter(|&id| graph.kind(id) == OpKind::Input)
        .collect();

    let mut retyped = 0;
    for id in inputs {
        let Op::Input { host } = graph.node(id).op else {
            continue;
        };
        let out = graph.output(id, 0);
        let old = graph.repr(out);
        if old.storage() == host {
            continue;
        }
        graph.set_repr(out, Representation::plain(host));
        let name = format!("{}_{}", graph.node_name(id), old.storage());
        let shape = graph.shape(out).to_vec();
        let cast = graph.insert_after(id, name, Op::Cast, &[out], vec![TensorType::new(shape, old)]);
        let node = graph.node_mut(cast);
        node.conversion = true;
        node.lowered = true;
        let converted = graph.output(cast, 0);
        graph.replace_all_uses_except(out, converted, cast);
        debug!(input = graph.node_name(id), %host, "input retyped to host kind");
        retyped += 1;
    }
    retyped
}
