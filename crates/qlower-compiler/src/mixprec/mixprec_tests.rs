use qlower_core::{Chip, ElementKind, Graph, Mode, Op, OpKind, ValueId};

use crate::LowerConfig;
use crate::LoweringContext;
use crate::test_utils::{cal, calibrated_graph, ctx, int8_ctx};

use super::{MatchReport, run};
use super::vit::converges;

fn op(g: &mut Graph, name: &str, op: Op, inputs: &[ValueId]) -> ValueId {
    g.add_op(name, op, inputs, [1, 4], cal(-1.0, 1.0))
}

fn weight(g: &mut Graph, name: &str) -> ValueId {
    g.add_weight(name, [4, 4], ElementKind::F32, vec![0.1; 16])
}

fn permute(g: &mut Graph, name: &str, input: ValueId) -> ValueId {
    op(g, name, Op::Permute { order: vec![0, 2, 1, 3] }, &[input])
}

fn mul_const(g: &mut Graph, name: &str, input: ValueId, const_val: f64) -> ValueId {
    op(
        g,
        name,
        Op::MulConst {
            const_val,
            do_relu: false,
        },
        &[input],
    )
}

fn layer_norm(g: &mut Graph, name: &str, input: ValueId) -> ValueId {
    op(g, name, Op::LayerNorm { axis: -1 }, &[input])
}

fn softmax(g: &mut Graph, name: &str, input: ValueId) -> ValueId {
    op(g, name, Op::Softmax { axis: -1 }, &[input])
}

/// `MatMul(input, weight) -> Reshape -> Permute`
fn head(g: &mut Graph, name: &str, input: ValueId) -> ValueId {
    let w = weight(g, &format!("{name}_w"));
    let mm = op(g, name, Op::matmul(), &[input, w]);
    let r = op(g, &format!("{name}_reshape"), Op::Reshape, &[mm]);
    permute(g, &format!("{name}_permute"), r)
}

/// One attention block followed by one feed-forward block.
fn bert_encoder(g: &mut Graph) {
    let x = g.add_input("x", [1, 4], cal(-1.0, 1.0));
    let mask_in = g.add_input("mask_in", [1, 4], cal(0.0, 1.0));
    let ln0 = layer_norm(g, "ln0", x);

    let q = head(g, "q", ln0);
    let k = head(g, "k", ln0);
    let scores = op(g, "scores", Op::matmul(), &[q, k]);
    let scaled = mul_const(g, "scaled", scores, 0.125);
    let mask = g.add_op(
        "mask",
        Op::MulConst {
            const_val: -10000.0,
            do_relu: false,
        },
        &[mask_in],
        [1, 4],
        cal(-10000.0, 0.0),
    );
    let masked = op(g, "masked", Op::add(), &[scaled, mask]);
    let sm = softmax(g, "softmax", masked);
    let v = head(g, "v", ln0);
    let context = op(g, "context", Op::matmul(), &[sm, v]);
    let cp = permute(g, "context_permute", context);
    let cr = op(g, "context_reshape", Op::Reshape, &[cp]);
    let wo = weight(g, "out_w");
    let out = op(g, "out", Op::matmul(), &[cr, wo]);
    let add1 = op(g, "add1", Op::add(), &[out, ln0]);
    let ln1 = layer_norm(g, "ln1", add1);

    let w1 = weight(g, "ffn1_w");
    let f1 = op(g, "ffn1", Op::matmul(), &[ln1, w1]);
    let gelu = op(g, "gelu", Op::Gelu, &[f1]);
    let w2 = weight(g, "ffn2_w");
    let f2 = op(g, "ffn2", Op::matmul(), &[gelu, w2]);
    let add2 = op(g, "add2", Op::add(), &[ln1, f2]);
    let ln2 = layer_norm(g, "ln2", add2);
    g.add_return(&[ln2]);
}

fn pinned(ctx: &LoweringContext) -> Vec<(String, Mode)> {
    ctx.overrides
        .iter()
        .map(|(name, mode)| (name.to_owned(), mode))
        .collect()
}

#[test]
fn bert_encoder_pins_residual_adds() {
    let mut g = calibrated_graph();
    bert_encoder(&mut g);
    let mut ctx = int8_ctx();

    let report = run(&g, &mut ctx);

    assert_eq!(report.bert_ffn, 1);
    assert_eq!(report.bert_mha, 1);
    assert!(report.bert_applied);
    assert!(!report.vit_applied);
    assert_eq!(ctx.overrides.get("add1"), Some(Mode::F16));
    assert_eq!(ctx.overrides.get("add2"), Some(Mode::F16));
    assert_eq!(ctx.overrides.get("ffn2"), Some(Mode::F16));
    assert_eq!(ctx.overrides.get("ffn1"), None);
    // mask addend dwarfs the scaled scores
    assert_eq!(ctx.overrides.get("masked"), Some(Mode::F32));
    assert_eq!(report.ratio_pins, 1);
}

#[test]
fn partial_ffn_leaves_deep_matmuls_alone() {
    let mut g = calibrated_graph();
    bert_encoder(&mut g);
    let config = LowerConfig::builder(Chip::Bm1684x, Mode::Int8)
        .partial_ffn(true)
        .ffn_depth_threshold(1)
        .build();
    let mut ctx = LoweringContext::new(config);

    run(&g, &mut ctx);

    assert_eq!(ctx.overrides.get("add2"), Some(Mode::F16));
    assert_eq!(ctx.overrides.get("ffn2"), None);
}

#[test]
fn matching_twice_changes_nothing() {
    let mut g = calibrated_graph();
    bert_encoder(&mut g);
    let mut ctx = int8_ctx();

    run(&g, &mut ctx);
    let first = pinned(&ctx);
    run(&g, &mut ctx);

    assert_eq!(pinned(&ctx), first);
}

#[test]
fn table_entries_win_over_matchers() {
    let mut g = calibrated_graph();
    bert_encoder(&mut g);
    let mut ctx = int8_ctx();
    ctx.overrides.assign("add1", Mode::Bf16);

    run(&g, &mut ctx);

    assert_eq!(ctx.overrides.get("add1"), Some(Mode::Bf16));
}

#[test]
fn feed_forward_alone_is_not_enough() {
    let mut g = calibrated_graph();
    let x = g.add_input("x", [1, 4], cal(-1.0, 1.0));
    let ln0 = layer_norm(&mut g, "ln0", x);
    let w1 = weight(&mut g, "w1");
    let f1 = op(&mut g, "ffn1", Op::matmul(), &[ln0, w1]);
    let gelu = op(&mut g, "gelu", Op::Gelu, &[f1]);
    let w2 = weight(&mut g, "w2");
    let f2 = op(&mut g, "ffn2", Op::matmul(), &[gelu, w2]);
    let add = op(&mut g, "add", Op::add(), &[ln0, f2]);
    let ln1 = layer_norm(&mut g, "ln1", add);
    g.add_return(&[ln1]);
    let mut ctx = int8_ctx();

    let report = run(&g, &mut ctx);

    assert_eq!(report.bert_ffn, 1);
    assert!(!report.bert_applied);
    assert!(ctx.overrides.is_empty());
}

#[test]
fn matchers_skip_float_modes_and_other_chips() {
    let mut g = calibrated_graph();
    bert_encoder(&mut g);

    let mut f16 = ctx(Chip::Bm1684x, Mode::F16);
    assert_eq!(run(&g, &mut f16), MatchReport::default());
    assert!(f16.overrides.is_empty());

    let mut cv = ctx(Chip::Cv183x, Mode::Int8);
    assert_eq!(run(&g, &mut cv), MatchReport::default());
    assert!(cv.overrides.is_empty());
}

#[test]
fn unbalanced_add_pinned_to_f32() {
    let mut g = calibrated_graph();
    let a = g.add_input("a", [4], cal(-1.0, 1.0));
    let b = g.add_input("b", [4], cal(-200.0, 200.0));
    let c = g.add_input("c", [4], cal(-2.0, 2.0));
    let wide = g.add_op("wide", Op::add(), &[a, b], [4], cal(-201.0, 201.0));
    let narrow = g.add_op("narrow", Op::add(), &[a, c], [4], cal(-3.0, 3.0));
    g.add_return(&[wide, narrow]);
    let mut ctx = int8_ctx();

    let report = run(&g, &mut ctx);

    assert_eq!(report.ratio_pins, 1);
    assert_eq!(ctx.overrides.get("wide"), Some(Mode::F32));
    assert_eq!(ctx.overrides.get("narrow"), None);
}

#[test]
fn add_ratio_reads_weight_magnitude() {
    let mut g = calibrated_graph();
    let a = g.add_input("a", [4], cal(-0.5, 0.5));
    let bias = g.add_weight("bias", [4], ElementKind::F32, vec![1.0, -100.0, 3.0, 4.0]);
    let zero = g.add_weight("zero", [4], ElementKind::F32, vec![0.0; 4]);
    let biased = g.add_op("biased", Op::add(), &[a, bias], [4], cal(-101.0, 5.0));
    let flat = g.add_op("flat", Op::add(), &[a, zero], [4], cal(-0.5, 0.5));
    g.add_return(&[biased, flat]);
    let mut ctx = int8_ctx();

    run(&g, &mut ctx);

    assert_eq!(ctx.overrides.get("biased"), Some(Mode::F32));
    assert_eq!(ctx.overrides.get("flat"), None);
}

#[test]
fn add_ratio_needs_calibrated_operands() {
    let mut g = calibrated_graph();
    let a = g.add_input("a", [4], cal(-0.01, 0.01));
    let b = g.add_input("b", [4], crate::test_utils::f32());
    let sum = g.add_op("sum", Op::add(), &[a, b], [4], cal(-1.0, 1.0));
    g.add_return(&[sum]);
    let mut ctx = int8_ctx();

    assert_eq!(run(&g, &mut ctx).ratio_pins, 0);
}

/// Patch-embedding residual, one attention block with a fused qkv
/// projection, one MLP block.
fn vit_encoder(g: &mut Graph) {
    let x = g.add_input("x", [1, 4], cal(-1.0, 1.0));
    let pos = g.add_weight("pos", [1, 4], ElementKind::F32, vec![0.5; 4]);
    let r0 = op(g, "r0", Op::add(), &[x, pos]);
    let ln = layer_norm(g, "ln", r0);
    let w = weight(g, "qkv_w");
    let qkv = op(g, "qkv", Op::matmul(), &[ln, w]);
    let rs = op(g, "qkv_reshape", Op::Reshape, &[qkv]);
    let p = permute(g, "qkv_permute", rs);
    let mut heads = Vec::new();
    for i in 0..3 {
        let slice = op(
            g,
            &format!("slice{i}"),
            Op::Slice {
                offset: vec![i, 0, 0],
                steps: Vec::new(),
            },
            &[p],
        );
        heads.push(op(g, &format!("head{i}"), Op::Reshape, &[slice]));
    }
    let scores = op(g, "scores", Op::matmul(), &[heads[0], heads[1]]);
    let scaled = mul_const(g, "scaled", scores, 0.125);
    let sm = softmax(g, "softmax", scaled);
    let context = op(g, "context", Op::matmul(), &[sm, heads[2]]);
    let cp = permute(g, "context_permute", context);
    let cr = op(g, "context_reshape", Op::Reshape, &[cp]);
    let wo = weight(g, "proj_w");
    let proj = op(g, "proj", Op::matmul(), &[cr, wo]);
    let r1 = op(g, "r1", Op::add(), &[proj, r0]);

    let ln2 = layer_norm(g, "ln2", r1);
    let w1 = weight(g, "fc1_w");
    let f1 = op(g, "fc1", Op::matmul(), &[ln2, w1]);
    let gelu = op(g, "gelu", Op::Gelu, &[f1]);
    let w2 = weight(g, "fc2_w");
    let f2 = op(g, "fc2", Op::matmul(), &[gelu, w2]);
    let r2 = op(g, "r2", Op::add(), &[f2, r1]);
    g.add_return(&[r2]);
}

#[test]
fn vit_block_pins_residual_stream() {
    let mut g = calibrated_graph();
    vit_encoder(&mut g);
    let mut ctx = int8_ctx();

    let report = run(&g, &mut ctx);

    assert_eq!(report.vit_mha, 1);
    assert_eq!(report.vit_mlp, 1);
    assert!(report.vit_applied);
    assert!(!report.bert_applied);
    for add in ["r0", "r1", "r2"] {
        assert_eq!(ctx.overrides.get(add), Some(Mode::F16), "{add}");
    }
    assert_eq!(ctx.overrides.get("fc2"), None);
}

#[test]
fn convergence_fails_when_a_branch_escapes() {
    let mut g = calibrated_graph();
    let x = g.add_input("x", [4], cal(-1.0, 1.0));
    let a = op(&mut g, "a", Op::Relu, &[x]);
    let b = op(&mut g, "b", Op::Gelu, &[a]);
    let c = op(&mut g, "c", Op::Abs, &[a]);
    let join = op(&mut g, "join", Op::add(), &[b, c]);
    g.add_return(&[join, c]);

    let a_node = g.producer(a);
    let b_node = g.producer(b);
    let join_node = g.producer(join);
    assert_eq!(g.kind(join_node), OpKind::Add);
    assert!(converges(&g, b_node, join_node));
    assert!(!converges(&g, a_node, join_node));
}
