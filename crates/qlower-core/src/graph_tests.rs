use crate::{ElementKind, Graph, Op, OpKind, Representation, Use};

fn f32() -> Representation {
    Representation::plain(ElementKind::F32)
}

#[test]
fn uses_track_operands() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [1, 4], f32());
    let a = g.add_op("a", Op::Relu, &[x], [1, 4], f32());
    let b = g.add_op("b", Op::add(), &[x, a], [1, 4], f32());
    g.add_return(&[b]);

    assert_eq!(g.use_count(x), 2);
    assert_eq!(
        g.uses(x),
        &[
            Use {
                node: g.producer(a),
                operand: 0
            },
            Use {
                node: g.producer(b),
                operand: 0
            },
        ]
    );
    assert!(g.has_one_use(a));
    assert_eq!(g.verify_structure(), Ok(()));
}

#[test]
fn replace_all_uses_moves_readers() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [4], f32());
    let r = g.add_op("r", Op::Relu, &[x], [4], f32());
    let s = g.add_op("s", Op::Abs, &[r], [4], f32());
    let t = g.add_op("t", Op::Abs, &[r], [4], f32());

    g.replace_all_uses(r, x);

    assert_eq!(g.use_count(r), 0);
    assert_eq!(g.input(g.producer(s), 0), x);
    assert_eq!(g.input(g.producer(t), 0), x);
    assert_eq!(g.use_count(x), 3);
    assert_eq!(g.verify_structure(), Ok(()));
}

#[test]
fn replace_all_uses_except_keeps_one_reader() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [4], f32());
    let c = g.add_op("c", Op::Cast, &[x], [4], f32());
    let s = g.add_op("s", Op::Abs, &[x], [4], f32());

    g.replace_all_uses_except(x, c, g.producer(c));

    assert_eq!(g.input(g.producer(c), 0), x);
    assert_eq!(g.input(g.producer(s), 0), c);
    assert_eq!(g.verify_structure(), Ok(()));
}

#[test]
fn erase_leaves_tombstone() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [4], f32());
    let r = g.add_op("r", Op::Relu, &[x], [4], f32());
    let id = g.producer(r);

    g.erase(id);

    assert!(!g.is_live(id));
    assert_eq!(g.use_count(x), 0);
    assert_eq!(g.node_count(), 1);
    assert_eq!(g.find("r"), None);
    assert_eq!(g.erased_count(), 1);

    // new node does not reuse the erased id
    let again = g.add_op("r", Op::Relu, &[x], [4], f32());
    assert_ne!(g.producer(again), id);
}

#[test]
#[should_panic(expected = "still have 1 reader")]
fn erase_with_readers_panics() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [4], f32());
    g.add_op("r", Op::Relu, &[x], [4], f32());
    let id = g.producer(x);
    g.erase(id);
}

#[test]
fn insert_after_keeps_program_order() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [4], f32());
    let r = g.add_op("r", Op::Relu, &[x], [4], f32());
    let anchor = g.producer(x);

    let cast = g.insert_after(
        anchor,
        "x_cast",
        Op::Cast,
        &[x],
        vec![g.ty(x).clone()],
    );

    let names: Vec<&str> = g.order().iter().map(|&n| g.node_name(n)).collect();
    assert_eq!(names, ["x", "x_cast", "r"]);
    assert_eq!(g.kind(cast), OpKind::Cast);
    assert_eq!(g.producer(r), g.order()[2]);
}

#[test]
fn fresh_names_are_unique() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [4], f32());
    let a = g.add_op("x", Op::Relu, &[x], [4], f32());
    let b = g.add_op("x", Op::Relu, &[a], [4], f32());

    assert_eq!(g.node_name(g.producer(a)), "x_1");
    assert_eq!(g.node_name(g.producer(b)), "x_2");
}

#[test]
fn swap_operands_updates_uses() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [4], f32());
    let y = g.add_input("y", [4], f32());
    let m = g.add_op("m", Op::Mul { do_relu: false }, &[x, y], [4], f32());
    let mul = g.producer(m);

    g.swap_operands(mul, 0, 1);

    assert_eq!(g.inputs(mul), &[y, x]);
    assert_eq!(g.uses(x), &[Use { node: mul, operand: 1 }]);
    assert_eq!(g.uses(y), &[Use { node: mul, operand: 0 }]);
    assert_eq!(g.verify_structure(), Ok(()));
}

#[test]
fn same_value_read_twice() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [4], f32());
    let y = g.add_input("y", [4], f32());
    let m = g.add_op("m", Op::Mul { do_relu: false }, &[x, x], [4], f32());
    let mul = g.producer(m);
    assert_eq!(g.use_count(x), 2);

    g.set_operand(mul, 1, y);

    assert_eq!(g.uses(x), &[Use { node: mul, operand: 0 }]);
    assert_eq!(g.uses(y), &[Use { node: mul, operand: 1 }]);
    assert_eq!(g.verify_structure(), Ok(()));
}

#[test]
fn return_records_result_kinds() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [4], Representation::calibrated(ElementKind::F32, -1.0, 1.0));
    g.add_return(&[x]);

    assert_eq!(g.result_kinds(), &[ElementKind::F32]);
    assert_eq!(g.return_node().map(|r| g.kind(r)), Some(OpKind::Return));
}

#[test]
fn dump_lists_nodes() {
    let mut g = Graph::new("g");
    let x = g.add_input("x", [1, 4], Representation::calibrated(ElementKind::F32, -1.0, 2.5));
    let p = g.add_op(
        "p",
        Op::Permute { order: vec![1, 0] },
        &[x],
        [4, 1],
        Representation::plain(ElementKind::F16),
    );
    g.add_return(&[p]);

    insta::assert_snapshot!(g.dump(), @r"
    x = input() -> [1, 4] f32[-1, 2.5]
    p = permute<1,0>(x) -> [4, 1] f16
    return(p)
    ");
}
