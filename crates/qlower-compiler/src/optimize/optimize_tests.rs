use qlower_core::{Chip, ElementKind, Graph, Mode, Op, OpKind, Representation, ValueId};

use crate::test_utils::{ctx, f32};
use crate::{LowerConfig, LoweringContext};

use super::{RewriteStats, run};

fn f16() -> Representation {
    Representation::plain(ElementKind::F16)
}

fn permute(g: &mut Graph, name: &str, x: ValueId, order: [i64; 4], shape: [i64; 4]) -> ValueId {
    g.add_op(
        name,
        Op::Permute {
            order: order.to_vec(),
        },
        &[x],
        shape,
        g.repr(x),
    )
}

fn optimize(g: &mut Graph) -> RewriteStats {
    run(g, &ctx(Chip::Bm1684x, Mode::F16))
}

fn applied(stats: &RewriteStats, rule: &str) -> usize {
    stats.by_rule.get(rule).copied().unwrap_or(0)
}

#[test]
fn swapping_heads_twice_is_a_no_op() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [1, 4, 8, 16], f16());
    let p1 = permute(&mut g, "p1", x, [0, 2, 1, 3], [1, 8, 4, 16]);
    let p2 = permute(&mut g, "p2", p1, [0, 2, 1, 3], [1, 4, 8, 16]);
    let ret = g.add_return(&[p2]);

    let stats = optimize(&mut g);

    assert_eq!(g.input(ret, 0), x);
    assert_eq!(g.find("p1"), None);
    assert_eq!(g.find("p2"), None);
    assert_eq!(stats.erased_nodes, 2);
    assert_eq!(applied(&stats, "permute-fuse"), 1);
    assert_eq!(stats.iterations, 2);
}

#[test]
fn permutes_around_reshape_become_one_reshape() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [2, 3, 4], f16());
    let p1 = g.add_op("p1", Op::Permute { order: vec![1, 0, 2] }, &[x], [3, 2, 4], f16());
    let r = g.add_op("r", Op::Reshape, &[p1], [3, 2, 2, 2], f16());
    let p2 = permute(&mut g, "p2", r, [1, 0, 2, 3], [2, 3, 2, 2]);
    let ret = g.add_return(&[p2]);

    optimize(&mut g);

    let out = g.input(ret, 0);
    let reshape = g.producer(out);
    assert_eq!(g.kind(reshape), OpKind::Reshape);
    assert_eq!(g.input(reshape, 0), x);
    assert_eq!(g.shape(out), &[2, 3, 2, 2]);
    assert_eq!(g.node_count(), 3);
}

#[test]
fn moving_only_unit_axes_is_a_reshape() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [4, 1, 8], f16());
    let p = g.add_op("p", Op::Permute { order: vec![1, 0, 2] }, &[x], [1, 4, 8], f16());
    g.add_return(&[p]);

    optimize(&mut g);

    assert_eq!(g.producer_kind(p), OpKind::Reshape);
}

#[test]
fn matmul_absorbs_head_permutes() {
    let mut g = Graph::new("g");
    let q = g.add_input("q", [1, 8, 4, 16], f16());
    let k = g.add_input("k", [1, 8, 4, 16], f16());
    let pq = permute(&mut g, "pq", q, [0, 2, 1, 3], [1, 4, 8, 16]);
    let pk = permute(&mut g, "pk", k, [0, 2, 3, 1], [1, 4, 16, 8]);
    let mm = g.add_op("mm", Op::matmul(), &[pq, pk], [1, 4, 8, 8], f16());
    g.add_return(&[mm]);

    let stats = optimize(&mut g);

    assert_eq!(applied(&stats, "matmul-hdim-batch"), 1);
    insta::assert_snapshot!(g.dump(), @r"
    q = input() -> [1, 8, 4, 16] f16
    k = input() -> [1, 8, 4, 16] f16
    mm = matmul<rt,hdim>(q, k) -> [1, 8, 4, 8] f16
    mm_permute = permute<0,2,1,3>(mm) -> [1, 4, 8, 8] f16
    return(mm_permute)
    ");
}

#[test]
fn transposed_left_with_plain_right_declined() {
    let mut g = Graph::new("g");
    let q = g.add_input("q", [1, 8, 4, 16], f16());
    let k = g.add_input("k", [1, 8, 4, 16], f16());
    let pq = permute(&mut g, "pq", q, [0, 2, 3, 1], [1, 4, 16, 8]);
    let pk = permute(&mut g, "pk", k, [0, 2, 1, 3], [1, 4, 8, 16]);
    let mm = g.add_op("mm", Op::matmul(), &[pq, pk], [1, 4, 16, 16], f16());
    g.add_return(&[mm]);
    let before = g.dump();

    let stats = optimize(&mut g);

    assert_eq!(stats.rewrites_applied, 0);
    assert_eq!(g.dump(), before);
}

#[test]
fn f32_matmul_keeps_its_permutes() {
    let mut g = Graph::new("g");
    let q = g.add_input("q", [1, 8, 4, 16], f32());
    let k = g.add_input("k", [1, 8, 4, 16], f32());
    let pq = permute(&mut g, "pq", q, [0, 2, 1, 3], [1, 4, 8, 16]);
    let pk = permute(&mut g, "pk", k, [0, 2, 3, 1], [1, 4, 16, 8]);
    let mm = g.add_op("mm", Op::matmul(), &[pq, pk], [1, 4, 8, 8], f32());
    g.add_return(&[mm]);

    let stats = optimize(&mut g);

    assert_eq!(applied(&stats, "matmul-hdim-batch"), 0);
    assert_eq!(g.input(g.producer(mm), 0), pq);
}

#[test]
fn matmul_weight_permuted_in_place() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [1, 2, 2, 2], f16());
    let px = permute(&mut g, "px", x, [0, 2, 1, 3], [1, 2, 2, 2]);
    let w = g.add_weight("w", [1, 2, 2, 2], ElementKind::F16, (0..8).map(f64::from).collect());
    let mm = g.add_op("mm", Op::matmul(), &[px, w], [1, 2, 2, 2], f16());
    g.add_return(&[mm]);

    optimize(&mut g);

    let mm_node = g.producer(mm);
    assert_eq!(g.input(mm_node, 0), x);
    let weight = g.input(mm_node, 1);
    assert_eq!(g.node_name(g.producer(weight)), "w_trans");
    assert_eq!(
        g.weight_data(weight),
        Some(&[0.0, 1.0, 4.0, 5.0, 2.0, 3.0, 6.0, 7.0][..])
    );
    assert_eq!(g.find("w"), None);
    assert!(matches!(
        g.node(mm_node).op,
        Op::MatMul {
            hdim_is_batch: true,
            left_transpose: false,
            right_transpose: false,
            ..
        }
    ));
}

#[test]
fn unsqueezed_matmul_operands_read_directly() {
    let mut g = Graph::new("g");
    let a = g.add_input("a", [1, 8, 16], f32());
    let b = g.add_input("b", [1, 16, 8], f32());
    let ra = g.add_op("ra", Op::Reshape, &[a], [1, 1, 8, 16], f32());
    let rb = g.add_op("rb", Op::Reshape, &[b], [1, 1, 16, 8], f32());
    let mm = g.add_op("mm", Op::matmul(), &[ra, rb], [1, 1, 8, 8], f32());
    g.add_return(&[mm]);

    let stats = optimize(&mut g);

    assert_eq!(applied(&stats, "matmul-remove-reshape"), 1);
    assert_eq!(g.inputs(g.producer(mm)), &[a, b]);
}

#[test]
fn flattened_softmax_loses_its_reshapes() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [1, 2, 4, 4], f16());
    let r1 = g.add_op("r1", Op::Reshape, &[x], [2, 4, 4], f16());
    let sm = g.add_op("sm", Op::Softmax { axis: 2 }, &[r1], [2, 4, 4], f16());
    let r2 = g.add_op("r2", Op::Reshape, &[sm], [1, 2, 4, 4], f16());
    g.add_return(&[r2]);

    optimize(&mut g);

    insta::assert_snapshot!(g.dump(), @r"
    x = input() -> [1, 2, 4, 4] f16
    sm = softmax<axis=3>(x) -> [1, 2, 4, 4] f16
    return(sm)
    ");
}

#[test]
fn flattened_matmul_operands_unflattened() {
    let mut g = Graph::new("g");
    let a = g.add_input("a", [1, 2, 4, 8], f16());
    let b = g.add_input("b", [1, 2, 8, 4], f16());
    let ra = g.add_op("ra", Op::Reshape, &[a], [2, 4, 8], f16());
    let rb = g.add_op("rb", Op::Reshape, &[b], [2, 8, 4], f16());
    let mm = g.add_op("mm", Op::matmul(), &[ra, rb], [2, 4, 4], f16());
    let relu = g.add_op("relu", Op::Relu, &[mm], [2, 4, 4], f16());
    g.add_return(&[relu]);

    optimize(&mut g);

    let mm_node = g.producer(mm);
    assert_eq!(g.inputs(mm_node), &[a, b]);
    assert_eq!(g.shape(mm), &[1, 2, 4, 4]);
    let back = g.input(g.producer(relu), 0);
    assert_eq!(g.producer_kind(back), OpKind::Reshape);
    assert_eq!(g.shape(back), &[2, 4, 4]);
}

#[test]
fn matching_permutes_move_after_add() {
    let mut g = Graph::new("g");
    let a = g.add_input("a", [1, 2, 3, 4], f16());
    let b = g.add_input("b", [1, 2, 3, 4], f16());
    let pa = permute(&mut g, "pa", a, [0, 2, 1, 3], [1, 3, 2, 4]);
    let pb = permute(&mut g, "pb", b, [0, 2, 1, 3], [1, 3, 2, 4]);
    let sum = g.add_op("sum", Op::add(), &[pa, pb], [1, 3, 2, 4], f16());
    let ret = g.add_return(&[sum]);

    let stats = optimize(&mut g);

    assert_eq!(applied(&stats, "move-permute-after-add"), 1);
    assert_eq!(g.inputs(g.producer(sum)), &[a, b]);
    assert_eq!(g.shape(sum), &[1, 2, 3, 4]);
    let out = g.input(ret, 0);
    assert_eq!(g.producer_kind(out), OpKind::Permute);
    assert_eq!(g.shape(out), &[1, 3, 2, 4]);
}

#[test]
fn matching_reshapes_move_after_add() {
    let mut g = Graph::new("g");
    let a = g.add_input("a", [2, 6], f16());
    let b = g.add_input("b", [2, 6], f16());
    let ra = g.add_op("ra", Op::Reshape, &[a], [2, 2, 3], f16());
    let rb = g.add_op("rb", Op::Reshape, &[b], [2, 2, 3], f16());
    let sum = g.add_op("sum", Op::add(), &[ra, rb], [2, 2, 3], f16());
    let ret = g.add_return(&[sum]);

    optimize(&mut g);

    assert_eq!(g.inputs(g.producer(sum)), &[a, b]);
    assert_eq!(g.shape(sum), &[2, 6]);
    assert_eq!(g.shape(g.input(ret, 0)), &[2, 2, 3]);
}

#[test]
fn add_weight_permuted_instead_of_activation() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [1, 2, 2, 1], f16());
    let px = permute(&mut g, "px", x, [0, 2, 1, 3], [1, 2, 2, 1]);
    let w = g.add_weight("w", [1, 2, 2, 1], ElementKind::F16, vec![1.0, 2.0, 3.0, 4.0]);
    let sum = g.add_op("sum", Op::add(), &[px, w], [1, 2, 2, 1], f16());
    let relu = g.add_op("relu", Op::Relu, &[sum], [1, 2, 2, 1], f16());
    g.add_return(&[relu]);

    let stats = optimize(&mut g);

    assert_eq!(applied(&stats, "permute-weight-reorder"), 1);
    let sum_node = g.producer(sum);
    assert_eq!(g.input(sum_node, 0), x);
    assert_eq!(
        g.weight_data(g.input(sum_node, 1)),
        Some(&[1.0, 3.0, 2.0, 4.0][..])
    );
    let moved = g.input(g.producer(relu), 0);
    assert_eq!(g.producer_kind(moved), OpKind::Permute);
}

#[test]
fn grouped_conv_gets_scattered_filter() {
    let mut g = Graph::new("g");
    let int8 = Representation::plain(ElementKind::I8);
    let x = g.add_input("x", [1, 4, 8, 8], int8);
    let w = g.add_weight("w", [4, 2, 1, 1], ElementKind::I8, (1..=8).map(f64::from).collect());
    let conv = g.add_op(
        "conv",
        Op::Conv2d {
            groups: 2,
            kernel_zp: 0.0,
            do_relu: false,
        },
        &[x, w],
        [1, 4, 8, 8],
        int8,
    );
    g.add_return(&[conv]);

    optimize(&mut g);

    let conv_node = g.producer(conv);
    assert!(matches!(g.node(conv_node).op, Op::Conv2d { groups: 1, .. }));
    let filter = g.input(conv_node, 1);
    assert_eq!(g.shape(filter), &[4, 4, 1, 1]);
    #[rustfmt::skip]
    let expected = [
        1.0, 2.0, 0.0, 0.0,
        3.0, 4.0, 0.0, 0.0,
        0.0, 0.0, 5.0, 6.0,
        0.0, 0.0, 7.0, 8.0,
    ];
    assert_eq!(g.weight_data(filter), Some(&expected[..]));
}

#[test]
fn wide_grouped_conv_kept() {
    let mut g = Graph::new("g");
    let int8 = Representation::plain(ElementKind::I8);
    let x = g.add_input("x", [1, 4, 8, 8], int8);
    let w = g.add_weight("w", [4, 2, 1, 1], ElementKind::I8, vec![1.0; 8]);
    let conv = g.add_op(
        "conv",
        Op::Conv2d {
            groups: 2,
            kernel_zp: 0.0,
            do_relu: false,
        },
        &[x, w],
        [1, 4, 8, 8],
        int8,
    );
    g.add_return(&[conv]);
    let narrow = LoweringContext::new(
        LowerConfig::builder(Chip::Bm1684x, Mode::Int8)
            .ic_parallel_bytes(2)
            .build(),
    );

    let stats = run(&mut g, &narrow);

    assert_eq!(stats.rewrites_applied, 0);
    assert!(matches!(g.node(g.producer(conv)).op, Op::Conv2d { groups: 2, .. }));
}

#[test]
fn gather_on_outer_axis_gets_coefficients_once() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [2, 3], f32());
    let idx = g.add_input("idx", [2, 2], Representation::plain(ElementKind::I32));
    let gather = g.add_op("gather", Op::GatherElements { axis: 0 }, &[x, idx], [2, 2], f32());
    g.add_return(&[gather]);

    let stats = optimize(&mut g);

    assert_eq!(applied(&stats, "index-coeff"), 1);
    let node = g.producer(gather);
    assert_eq!(g.inputs(node).len(), 3);
    let coeff = g.input(node, 2);
    assert_eq!(g.node_name(g.producer(coeff)), "gather_indices_coeff");
    assert_eq!(g.repr(coeff).storage(), ElementKind::I32);
    assert_eq!(g.weight_data(coeff), Some(&[0.0, 1.0, 0.0, 1.0][..]));
}

#[test]
fn gather_on_inner_axis_untouched() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [2, 3], f32());
    let idx = g.add_input("idx", [2, 2], Representation::plain(ElementKind::I32));
    let gather = g.add_op("gather", Op::GatherElements { axis: -1 }, &[x, idx], [2, 2], f32());
    g.add_return(&[gather]);

    optimize(&mut g);

    assert_eq!(g.inputs(g.producer(gather)).len(), 2);
}

#[test]
fn left_reuse_follows_producer_fanout() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [4, 8], f16());
    let y = g.add_input("y", [4, 8], f16());
    let w = g.add_weight("w", [8, 4], ElementKind::F16, vec![0.0; 32]);
    let shared = g.add_op("shared", Op::matmul(), &[x, w], [4, 4], f16());
    let w2 = g.add_weight("w2", [8, 4], ElementKind::F16, vec![0.0; 32]);
    let alone = g.add_op("alone", Op::matmul(), &[y, w2], [4, 4], f16());
    let relu = g.add_op("relu", Op::Relu, &[x], [4, 8], f16());
    g.add_return(&[shared, alone, relu]);

    optimize(&mut g);

    let reuse = |value| match g.node(g.producer(value)).op {
        Op::MatMul { left_reuse, .. } => left_reuse,
        _ => panic!("expected matmul"),
    };
    assert!(reuse(shared));
    assert!(!reuse(alone));
}

#[test]
fn other_chips_skip_rewrites() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [1, 4, 8, 16], f16());
    let p1 = permute(&mut g, "p1", x, [0, 2, 1, 3], [1, 8, 4, 16]);
    let p2 = permute(&mut g, "p2", p1, [0, 2, 1, 3], [1, 4, 8, 16]);
    g.add_return(&[p2]);

    let stats = run(&mut g, &ctx(Chip::Cv183x, Mode::Int8));

    assert_eq!(stats, RewriteStats::default());
    assert_eq!(g.node_count(), 4);
}

#[test]
fn iteration_cap_stops_the_driver() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [1, 4, 8, 16], f16());
    let p1 = permute(&mut g, "p1", x, [0, 2, 1, 3], [1, 8, 4, 16]);
    let p2 = permute(&mut g, "p2", p1, [0, 2, 1, 3], [1, 4, 8, 16]);
    g.add_return(&[p2]);
    let capped = LoweringContext::new(
        LowerConfig::builder(Chip::Bm1684x, Mode::F16)
            .max_rewrite_iterations(1)
            .build(),
    );

    let stats = run(&mut g, &capped);

    assert_eq!(stats.iterations, 1);
    assert_eq!(stats.rewrites_applied, 1);
}
