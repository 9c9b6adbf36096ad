//! Lowering seam.
//!
//! Per-op translation into backend ops lives outside this crate. What the
//! rest of the pipeline needs from it is captured by [`Lowering`]: every
//! computational node ends up with a resolved execution mode, output
//! representations that match that mode, and the `lowered` flag set.
//! [`DefaultLowering`] provides exactly that and nothing more.

use indexmap::IndexMap;
use qlower_core::{ElementKind, Graph, GraphState, Mode, NodeId, OpKind, Range, Representation, ValueId};
use tracing::{debug, info};

use crate::{LoweringContext, Result};

/// Largest finite F8E4M3 magnitude.
pub const F8E4M3_MAX: f64 = 448.0;

/// Resolves modes and output representations for a whole graph.
pub trait Lowering {
    fn lower(&mut self, graph: &mut Graph, ctx: &LoweringContext) -> Result<LoweringStats>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoweringStats {
    pub lowered: usize,
    pub weights: usize,
    pub by_mode: IndexMap<Mode, usize>,
}

/// Mode resolution through the override map, then the global mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLowering;

impl Lowering for DefaultLowering {
    fn lower(&mut self, graph: &mut Graph, ctx: &LoweringContext) -> Result<LoweringStats> {
        let mut stats = LoweringStats::default();
        let snapshot: Vec<NodeId> = graph.order().to_vec();
        let asymmetric = ctx.config.asymmetric;
        let prequantized = graph.state == GraphState::Quantized;

        for id in snapshot {
            let kind = graph.kind(id);
            if kind.is_leaf() || graph.node(id).lowered {
                continue;
            }
            let mode = ctx.mode_of(graph.node_name(id));

            if !prequantized {
                if kind.is_shape_only() {
                    let source = graph.repr(graph.input(id, 0));
                    for out in graph.outputs(id).to_vec() {
                        graph.set_repr(out, source);
                    }
                } else {
                    for out in graph.outputs(id).to_vec() {
                        let repr = output_repr(graph.repr(out), mode, asymmetric);
                        graph.set_repr(out, repr);
                    }
                }
                if matches!(kind, OpKind::MatMul | OpKind::Conv2d) {
                    stats.weights += usize::from(lower_weight(graph, id, mode));
                }
            }

            let node = graph.node_mut(id);
            node.mode = Some(mode);
            node.lowered = true;
            *stats.by_mode.entry(mode).or_default() += 1;
            stats.lowered += 1;
            debug!(node = graph.node_name(id), %mode, "lowered");
        }

        info!(
            lowered = stats.lowered,
            weights = stats.weights,
            prequantized,
            "lowering done"
        );
        Ok(stats)
    }
}

/// Output representation of a computational op running in `mode`.
pub fn output_repr(current: Representation, mode: Mode, asymmetric: bool) -> Representation {
    let storage = current.storage();
    if storage.is_integer() && !current.is_quantized() {
        return current;
    }
    if mode.is_integer() || mode == Mode::F8e4m3 {
        return match current.range() {
            Some(range) => quantize_range(range, mode, asymmetric),
            None => Representation::plain(ElementKind::F32),
        };
    }
    match mode.activation_kind() {
        Some(elem) => current.retyped(elem),
        None => current,
    }
}

/// Quantized representation covering `range`.
///
/// INT4 activations are carried at 8 bits; only conversions feeding
/// INT4-capable consumers narrow further, through [`quantize_int4`].
pub fn quantize_range(range: Range, mode: Mode, asymmetric: bool) -> Representation {
    match mode {
        Mode::F8e4m3 => quantized(ElementKind::F8e4m3, range.max() / F8E4M3_MAX, 0, false),
        Mode::Uint8 => affine(range, ElementKind::U8, 255.0, 0),
        _ if asymmetric => affine(range, ElementKind::I8, 255.0, -128),
        _ if range.min() >= 0.0 => quantized(ElementKind::U8, range.max() / 255.0, 0, false),
        _ => quantized(ElementKind::I8, range.abs_max() / 127.0, 0, false),
    }
}

pub fn quantize_int4(range: Range, asymmetric: bool) -> Representation {
    if asymmetric {
        affine(range, ElementKind::I4, 15.0, -8)
    } else {
        quantized(ElementKind::I4, range.abs_max() / 7.0, 0, false)
    }
}

fn affine(range: Range, storage: ElementKind, levels: f64, offset: i64) -> Representation {
    let scale = nonzero_scale((range.max() - range.min()) / levels);
    let zero_point = (-range.min() / scale).round() as i64 + offset;
    quantized(storage, scale, zero_point, true)
}

fn quantized(storage: ElementKind, scale: f64, zero_point: i64, asymmetric: bool) -> Representation {
    Representation::Quantized {
        storage,
        scale: nonzero_scale(scale),
        zero_point,
        asymmetric,
    }
}

fn nonzero_scale(scale: f64) -> f64 {
    if scale > 0.0 && scale.is_finite() {
        scale
    } else {
        1.0
    }
}

/// Range a quantized representation can express.
pub fn implied_range(repr: &Representation) -> Option<Range> {
    match *repr {
        Representation::Calibrated { range, .. } => Some(range),
        Representation::Quantized {
            storage,
            scale,
            zero_point,
            ..
        } => {
            let (lo, hi) = match storage {
                ElementKind::F8e4m3 => (-F8E4M3_MAX, F8E4M3_MAX),
                ElementKind::I8 => (-128.0, 127.0),
                ElementKind::U8 => (0.0, 255.0),
                ElementKind::I4 => (-8.0, 7.0),
                _ => return None,
            };
            let zp = zero_point as f64;
            Range::try_new((lo - zp) * scale, (hi - zp) * scale)
        }
        Representation::Plain { .. } => None,
    }
}

/// Retypes the filter/right-hand weight of a MatMul or Conv2d for `mode`.
/// Returns whether the weight changed.
fn lower_weight(graph: &mut Graph, id: NodeId, mode: Mode) -> bool {
    let Some(&value) = graph.inputs(id).get(1) else {
        return false;
    };
    let Some(data) = graph.weight_data(value) else {
        return false;
    };
    let current = graph.repr(value);
    if current.storage() != ElementKind::F32 {
        return false;
    }

    let abs_max = data.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    let repr = match mode {
        Mode::Int8 | Mode::Uint8 | Mode::W8f16 | Mode::W8bf16 => {
            quantized(ElementKind::I8, abs_max / 127.0, 0, false)
        }
        Mode::Int4 | Mode::W4f16 | Mode::W4bf16 => quantized(ElementKind::I4, abs_max / 7.0, 0, false),
        Mode::F16 => Representation::plain(ElementKind::F16),
        Mode::Bf16 => Representation::plain(ElementKind::Bf16),
        Mode::F32 | Mode::F8e4m3 | Mode::F8e5m2 => return false,
    };
    set_weight_repr(graph, value, repr);
    true
}

fn set_weight_repr(graph: &mut Graph, value: ValueId, repr: Representation) {
    debug!(weight = %graph.value_ref(value), %repr, "weight retyped");
    graph.set_repr(value, repr);
}
