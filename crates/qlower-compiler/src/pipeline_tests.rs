use indoc::indoc;
use qlower_core::{Chip, Graph, GraphState, Mode, Op, OpKind};

use crate::test_utils::{cal, calibrated_graph};
use crate::{Error, ErrorClass, LowerConfig, Pipeline};

fn relu_graph() -> Graph {
    let mut g = calibrated_graph();
    let x = g.add_input("x", [1, 4], cal(-1.0, 1.0));
    let a = g.add_op("a", Op::Relu, &[x], [1, 4], cal(0.0, 1.0));
    g.add_return(&[a]);
    g
}

#[test]
fn int8_graph_comes_out_quantized() {
    let mut g = relu_graph();
    let mut pipeline = Pipeline::new(LowerConfig::builder(Chip::Bm1684x, Mode::Int8).build());

    let report = pipeline.run(&mut g).unwrap();

    assert_eq!(g.state, GraphState::Quantized);
    assert_eq!(report.lowering.lowered, 1);
    assert_eq!(report.insertion.inserted, 2);
    assert!(report.calibration.phases > 0);
    let a = g.find("a").unwrap();
    assert_eq!(g.node(a).mode, Some(Mode::Int8));
    assert!(g.repr(g.input(a, 0)).is_quantized());
    let out = g.input(g.return_node().unwrap(), 0);
    assert!(!g.repr(out).is_quantized());
}

#[test]
fn table_pins_node_to_float() {
    let mut g = relu_graph();
    let table = indoc! {"
        # keep the activation in float
        a f32
    "};
    let config = LowerConfig::builder(Chip::Bm1684x, Mode::Int8)
        .qtable(table)
        .build();

    let report = Pipeline::new(config).run(&mut g).unwrap();

    assert_eq!(report.table_entries, 1);
    assert_eq!(report.overrides.get("a"), Some(Mode::F32));
    assert_eq!(report.insertion.inserted, 0);
    let a = g.find("a").unwrap();
    assert_eq!(g.node(a).mode, Some(Mode::F32));
}

#[test]
fn bad_table_rejected_before_any_change() {
    let mut g = relu_graph();
    let before = g.dump();
    let table = indoc! {"
        a f32
        b f17
    "};
    let config = LowerConfig::builder(Chip::Bm1684x, Mode::Int8)
        .qtable(table)
        .build();

    let err = Pipeline::new(config).run(&mut g).unwrap_err();

    assert!(matches!(err, Error::UnknownMode { line: 2, .. }));
    assert_eq!(err.class(), ErrorClass::Configuration);
    assert_eq!(g.dump(), before);
    assert_eq!(g.state, GraphState::Calibrated);
}

#[test]
fn sign_contradiction_aborts_as_modeling_error() {
    let mut g = calibrated_graph();
    let a = g.add_input("a", [4], cal(0.0, 5.0));
    let b = g.add_input("b", [4], cal(0.0, 3.0));
    let m = g.add_op("mul", Op::Mul { do_relu: false }, &[a, b], [4], cal(-1.0, 15.0));
    g.add_return(&[m]);

    let err = Pipeline::new(LowerConfig::builder(Chip::Bm1684x, Mode::Int8).build())
        .run(&mut g)
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::Modeling);
    assert_eq!(err, Error::SignContradiction { node: "mul".into() });
}

fn permute_pair() -> Graph {
    let mut g = calibrated_graph();
    let x = g.add_input("x", [1, 4, 8, 16], cal(-1.0, 1.0));
    let p1 = g.add_op(
        "p1",
        Op::Permute {
            order: vec![0, 2, 1, 3],
        },
        &[x],
        [1, 8, 4, 16],
        cal(-1.0, 1.0),
    );
    let p2 = g.add_op(
        "p2",
        Op::Permute {
            order: vec![0, 2, 1, 3],
        },
        &[p1],
        [1, 4, 8, 16],
        cal(-1.0, 1.0),
    );
    g.add_return(&[p2]);
    g
}

#[test]
fn rewrites_run_last() {
    let mut g = permute_pair();
    let config = LowerConfig::builder(Chip::Bm1684x, Mode::F16).build();

    let report = Pipeline::new(config).run(&mut g).unwrap();

    let rewrites = report.rewrites.unwrap();
    assert_eq!(rewrites.rewrites_applied, 1);
    assert_eq!(g.node_count(), 2);
}

#[test]
fn rewrites_can_be_switched_off() {
    let mut g = permute_pair();
    let config = LowerConfig::builder(Chip::Bm1684x, Mode::F16).build();

    let report = Pipeline::new(config).optimize(false).run(&mut g).unwrap();

    assert_eq!(report.rewrites, None);
    let permutes = g
        .order()
        .iter()
        .filter(|&&id| g.kind(id) == OpKind::Permute)
        .count();
    assert_eq!(permutes, 2);
}

#[test]
fn pipeline_can_run_twice() {
    let mut first = relu_graph();
    let mut second = relu_graph();
    let mut pipeline = Pipeline::new(LowerConfig::builder(Chip::Bm1684x, Mode::Int8).build());

    let a = pipeline.run(&mut first).unwrap();
    let b = pipeline.run(&mut second).unwrap();

    assert_eq!(a, b);
    assert_eq!(first.dump(), second.dump());
}
