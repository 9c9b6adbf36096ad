//! Local calibration rules.
//!
//! Every rule inspects one node and either edits the graph and returns
//! `true`, or declines with `false`. Only a sign contradiction is an error.

use qlower_core::{NodeId, Op, OpKind, Range, ReduceMode, Representation};

use super::walk::Propagator;
use crate::{Error, Result};

/// Synthetic negative lower bound as a fraction of the upper bound.
const NEGATIVE_FRACTION: f64 = -0.1;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Rule {
    /// Output range copied from input range.
    ForwardCopy(&'static [OpKind]),
    ForwardMulConst,
    ForwardArg,
    /// Pool output sign follows input sign.
    KeepSign(&'static [OpKind]),
    SubConstSign,
    MulSign,
    AddSign,
    /// Concat/Min/Max unification.
    MultiInput(&'static [OpKind]),
    Backward(&'static [OpKind]),
    BackwardKeepMin(&'static [OpKind]),
    Compare,
    WhereThreshold,
    MaskedFillThreshold,
}

impl Rule {
    pub fn name(self) -> &'static str {
        match self {
            Rule::ForwardCopy(_) => "forward",
            Rule::ForwardMulConst => "forward-mulconst",
            Rule::ForwardArg => "forward-arg",
            Rule::KeepSign(_) => "keep-sign",
            Rule::SubConstSign => "subconst-sign",
            Rule::MulSign => "mul-sign",
            Rule::AddSign => "add-sign",
            Rule::MultiInput(_) => "multi-input",
            Rule::Backward(_) => "backward",
            Rule::BackwardKeepMin(_) => "backward-keep-min",
            Rule::Compare => "compare",
            Rule::WhereThreshold => "where-threshold",
            Rule::MaskedFillThreshold => "maskedfill-threshold",
        }
    }

    pub fn apply(self, p: &mut Propagator<'_>, node: NodeId) -> Result<bool> {
        let kind = p.graph.kind(node);
        let changed = match self {
            Rule::ForwardCopy(kinds) => kinds.contains(&kind) && forward_copy(p, node),
            Rule::ForwardMulConst => kind == OpKind::MulConst && forward_mul_const(p, node),
            Rule::ForwardArg => kind == OpKind::Arg && forward_arg(p, node),
            Rule::KeepSign(kinds) => kinds.contains(&kind) && keep_sign(p, node),
            Rule::SubConstSign => kind == OpKind::SubConst && sub_const_sign(p, node),
            Rule::MulSign => kind == OpKind::Mul && mul_sign(p, node)?,
            Rule::AddSign => kind == OpKind::Add && add_sign(p, node),
            Rule::MultiInput(kinds) => kinds.contains(&kind) && multi_input(p, node, kind),
            Rule::Backward(kinds) => kinds.contains(&kind) && backward(p, node, false),
            Rule::BackwardKeepMin(kinds) => kinds.contains(&kind) && backward(p, node, true),
            Rule::Compare => kind == OpKind::Compare && compare(p, node),
            Rule::WhereThreshold => kind == OpKind::Where && where_threshold(p, node),
            Rule::MaskedFillThreshold => {
                kind == OpKind::MaskedFill && masked_fill_threshold(p, node)
            }
        };
        Ok(changed)
    }
}

fn forward_copy(p: &mut Propagator<'_>, node: NodeId) -> bool {
    if let Op::Reduce { mode, .. } = &p.graph.node(node).op
        && !matches!(mode, ReduceMode::Max | ReduceMode::Min)
    {
        return false;
    }
    let Some(&input) = p.graph.inputs(node).first() else {
        return false;
    };
    let out = p.graph.output(node, 0);
    let in_repr = p.graph.repr(input);
    if !in_repr.is_calibrated() || p.range(out) == in_repr.range() {
        return false;
    }
    p.set_repr(out, in_repr);
    p.forward_walk(out);
    true
}

fn forward_mul_const(p: &mut Propagator<'_>, node: NodeId) -> bool {
    let Op::MulConst { const_val, .. } = p.graph.node(node).op else {
        return false;
    };
    let input = p.graph.input(node, 0);
    let out = p.graph.output(node, 0);
    let Some(in_range) = p.range(input) else {
        return false;
    };
    let range = if const_val > 0.0 {
        Range::new(in_range.min() * const_val, in_range.max() * const_val)
    } else if const_val < 0.0 {
        Range::new(in_range.max() * const_val, in_range.min() * const_val)
    } else {
        in_range
    };
    if !p.set_range(out, range) {
        return false;
    }
    p.forward_walk(out);
    true
}

fn forward_arg(p: &mut Propagator<'_>, node: NodeId) -> bool {
    let outputs = p.graph.outputs(node);
    let Some(&values) = outputs.get(1) else {
        return false;
    };
    let in_repr = p.graph.repr(p.graph.input(node, 0));
    if !in_repr.is_calibrated() || p.range(values) == in_repr.range() {
        return false;
    }
    if !p.set_repr(values, in_repr) {
        return false;
    }
    p.forward_walk(values);
    true
}

fn keep_sign(p: &mut Propagator<'_>, node: NodeId) -> bool {
    let input = p.graph.input(node, 0);
    let out = p.graph.output(node, 0);
    let (Some(in_range), Some(out_range)) = (p.range(input), p.range(out)) else {
        return false;
    };
    let min = match (in_range.is_signed(), out_range.is_signed()) {
        (true, false) => NEGATIVE_FRACTION * out_range.max(),
        (false, true) => 0.0,
        _ => return false,
    };
    let Some(range) = out_range.with_min(min) else {
        return false;
    };
    if !p.set_range(out, range) {
        return false;
    }
    p.forward_walk(out);
    true
}

fn sub_const_sign(p: &mut Propagator<'_>, node: NodeId) -> bool {
    let input = p.graph.input(node, 0);
    let out = p.graph.output(node, 0);
    let (Some(in_range), Some(out_range)) = (p.range(input), p.range(out)) else {
        return false;
    };
    if in_range.is_signed() || out_range.is_signed() {
        return false;
    }
    let Some(range) = out_range.with_min(NEGATIVE_FRACTION * out_range.max()) else {
        return false;
    };
    if !p.set_range(out, range) {
        return false;
    }
    p.forward_walk(out);
    true
}

/// Two-operand multiply: operand signs must explain the output sign.
fn mul_sign(p: &mut Propagator<'_>, node: NodeId) -> Result<bool> {
    let inputs = p.graph.inputs(node).to_vec();
    if inputs.len() != 2 {
        return Ok(false);
    }
    let out = p.graph.output(node, 0);
    let Some(out_range) = p.range(out) else {
        return Ok(false);
    };

    let mut signed = [false; 2];
    for (slot, &value) in inputs.iter().enumerate() {
        signed[slot] = match p.graph.weight_data(value) {
            Some([single]) => *single < 0.0,
            Some(_) => return Ok(false),
            None => match p.range(value) {
                Some(range) => range.is_signed(),
                None => return Ok(false),
            },
        };
    }

    let out_signed = out_range.is_signed();
    if signed[0] == out_signed {
        return Ok(false);
    }
    if signed[1] == out_signed {
        p.graph.swap_operands(node, 0, 1);
        return Ok(true);
    }
    if !signed[0] {
        return Err(Error::SignContradiction {
            node: p.graph.node_name(node).to_owned(),
        });
    }
    let Some(range) = out_range.with_min(NEGATIVE_FRACTION * out_range.max()) else {
        return Ok(false);
    };
    if !p.set_range(out, range) {
        return Ok(false);
    }
    p.forward_walk(out);
    Ok(true)
}

fn add_sign(p: &mut Propagator<'_>, node: NodeId) -> bool {
    let Op::Add { coeff, .. } = &p.graph.node(node).op else {
        return false;
    };
    let coeff = coeff.clone();
    let out = p.graph.output(node, 0);
    let Some(out_range) = p.range(out) else {
        return false;
    };

    let mut is_sign = false;
    for (slot, &value) in p.graph.inputs(node).iter().enumerate() {
        let Some(range) = p.range(value) else {
            return false;
        };
        let c = coeff.get(slot).copied().unwrap_or(1.0);
        if range.min() * c < 0.0 || range.max() * c < 0.0 {
            is_sign = true;
        }
    }

    let min = match (is_sign, out_range.is_signed()) {
        (true, false) => NEGATIVE_FRACTION * out_range.max(),
        (false, true) => 0.0,
        _ => return false,
    };
    let Some(range) = out_range.with_min(min) else {
        return false;
    };
    if !p.set_range(out, range) {
        return false;
    }
    p.forward_walk(out);
    true
}

fn multi_input(p: &mut Propagator<'_>, node: NodeId, kind: OpKind) -> bool {
    let inputs = p.graph.inputs(node).to_vec();
    let mut ranges = Vec::with_capacity(inputs.len());
    for &value in &inputs {
        let Some(range) = p.range(value) else {
            return false;
        };
        if !p.graph.has_one_use(value) {
            let shared_with_pool = p
                .graph
                .users(value)
                .into_iter()
                .all(|user| user == node || p.graph.kind(user) == OpKind::MaxPool);
            if !shared_with_pool {
                return false;
            }
        }
        ranges.push(range);
    }
    let out = p.graph.output(node, 0);
    let out_repr = p.graph.repr(out);
    let (Some(first), Some(out_range)) = (ranges.first().copied(), out_repr.range()) else {
        return false;
    };

    if kind == OpKind::Concat && ranges.iter().any(|r| r.is_signed() != first.is_signed()) {
        return false;
    }

    if ranges.iter().all(|r| *r == first) {
        if out_range == first {
            return false;
        }
        let in_repr = p.graph.repr(inputs[0]);
        return p.set_repr(out, in_repr);
    }

    for &value in &inputs {
        if p.set_repr(value, out_repr) {
            p.backward_walk(value);
        }
    }
    true
}

fn backward(p: &mut Propagator<'_>, node: NodeId, keep_min: bool) -> bool {
    let input = p.graph.input(node, 0);
    let out = p.graph.output(node, 0);
    let out_repr = p.graph.repr(out);
    let Some(out_range) = out_repr.range() else {
        return false;
    };
    if !p.graph.has_one_use(input) {
        return false;
    }
    let Some(in_range) = p.range(input) else {
        return false;
    };
    if in_range.max() == out_range.max() && (keep_min || in_range.min() == out_range.min()) {
        return false;
    }
    let range = if keep_min {
        match Range::try_new(in_range.min(), out_range.max()) {
            Some(range) => range,
            None => return false,
        }
    } else {
        out_range
    };
    if !p.set_repr(input, Representation::with_range(out_repr.storage(), range)) {
        return false;
    }
    p.backward_walk(input);
    true
}

fn compare(p: &mut Propagator<'_>, node: NodeId) -> bool {
    let inputs = p.graph.inputs(node).to_vec();
    let &[lhs, rhs] = inputs.as_slice() else {
        return false;
    };
    let (Some(l), Some(r)) = (p.range(lhs), p.range(rhs)) else {
        return false;
    };
    if l == r {
        return false;
    }
    let joined = Representation::with_range(p.graph.repr(lhs).storage(), l.union(&r));
    let left = p.set_repr(lhs, joined);
    let right = p.set_repr(rhs, joined);
    left || right
}

/// Widens `out_range` to cover a constant of magnitude `const_v`.
/// Returns the resulting range and whether it grew.
fn widen_to_const(out_range: Range, const_v: f64, const_signed: bool) -> (Range, bool) {
    if out_range.max() >= const_v {
        return (out_range, false);
    }
    let min = if const_signed || out_range.is_signed() {
        NEGATIVE_FRACTION * const_v
    } else {
        0.0
    };
    (Range::new(min, const_v), true)
}

fn where_threshold(p: &mut Propagator<'_>, node: NodeId) -> bool {
    let Op::Where { x_const, y_const } = p.graph.node(node).op else {
        return false;
    };
    let out = p.graph.output(node, 0);
    let Some(out_range) = p.range(out) else {
        return false;
    };

    let mut const_v = 0.0f64;
    let mut const_signed = false;
    for c in [y_const, x_const].into_iter().flatten() {
        const_v = const_v.max(c.abs());
        const_signed |= c < 0.0;
    }

    let (range, widen) = widen_to_const(out_range, const_v, const_signed);
    let mut changed = widen && p.set_range(out, range);

    if p.ctx.is_float_pinned(p.graph.node_name(node)) {
        return changed;
    }
    let inputs = p.graph.inputs(node).to_vec();
    let mut branches = Vec::with_capacity(2);
    for (slot, is_const) in [(1, x_const.is_some()), (2, y_const.is_some())] {
        let Some(&value) = inputs.get(slot) else {
            continue;
        };
        if is_const || p.graph.is_none(value) {
            continue;
        }
        if !p.graph.repr(value).is_calibrated() {
            return changed;
        }
        branches.push(value);
    }
    for value in branches {
        changed |= p.set_range(value, range);
    }
    changed
}

fn masked_fill_threshold(p: &mut Propagator<'_>, node: NodeId) -> bool {
    let Op::MaskedFill { const_val, .. } = p.graph.node(node).op else {
        return false;
    };
    let inputs = p.graph.inputs(node).to_vec();
    if inputs.len() < 2
        || inputs
            .iter()
            .any(|&v| !p.graph.repr(v).is_calibrated() || !p.graph.has_one_use(v))
    {
        return false;
    }
    let out = p.graph.output(node, 0);
    let Some(out_range) = p.range(out) else {
        return false;
    };

    let (range, widen) = widen_to_const(out_range, const_val.abs(), const_val < 0.0);
    let mut changed = widen && p.set_range(out, range);

    if !p.ctx.is_float_pinned(p.graph.node_name(node)) {
        changed |= p.set_range(inputs[1], range);
    }
    changed
}
