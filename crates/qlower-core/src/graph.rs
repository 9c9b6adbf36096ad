//! Arena-backed dataflow graph.
//!
//! Nodes and values live in flat arenas addressed by stable ids. Erasing a
//! node leaves a tombstone so ids handed out earlier never get reused. Each
//! value records its producer and the ordered list of operand slots that read
//! it; every structural edit keeps those use lists in sync with the operand
//! lists of the consuming nodes.
//!
//! Program order is kept separately in `order`. New nodes are spliced in
//! next to an anchor so that producers always precede their consumers.

use std::collections::HashSet;
use std::fmt;

use crate::{ElementKind, Mode, Op, OpKind, Representation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(u32);

impl ValueId {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// One operand slot reading a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Use {
    pub node: NodeId,
    pub operand: usize,
}

/// Shape plus representation of a value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TensorType {
    pub shape: Vec<i64>,
    pub repr: Representation,
}

impl TensorType {
    pub fn new(shape: impl Into<Vec<i64>>, repr: Representation) -> Self {
        Self {
            shape: shape.into(),
            repr,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Value {
    producer: NodeId,
    slot: usize,
    ty: TensorType,
    uses: Vec<Use>,
}

impl Value {
    pub fn producer(&self) -> NodeId {
        self.producer
    }

    /// Output index on the producer.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn ty(&self) -> &TensorType {
        &self.ty
    }

    pub fn uses(&self) -> &[Use] {
        &self.uses
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    pub op: Op,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    /// Resolved execution mode, set by lowering.
    pub mode: Option<Mode>,
    pub lowered: bool,
    pub relu_limit: Option<f64>,
    /// Operands were already re-quantized by an earlier lowering step.
    pub inner_requant: bool,
    /// Inserted by the precision-boundary pass.
    pub conversion: bool,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }
}

/// Where the graph sits in the lowering flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphState {
    #[default]
    Float,
    Calibrated,
    Quantized,
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    name: String,
    pub state: GraphState,
    nodes: Vec<Option<Node>>,
    values: Vec<Value>,
    order: Vec<NodeId>,
    names: HashSet<String>,
    result_kinds: Vec<ElementKind>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn node(&self, id: NodeId) -> &Node {
        crate::invariants::ensure_live(self.get(id), id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        let slot = self.nodes.get_mut(id.index()).and_then(Option::as_mut);
        crate::invariants::ensure_live(slot, id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn is_live(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn kind(&self, id: NodeId) -> OpKind {
        self.node(id).kind()
    }

    pub fn node_name(&self, id: NodeId) -> &str {
        self.node(id).name()
    }

    /// Live nodes in program order.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn node_count(&self) -> usize {
        self.order.len()
    }

    /// Nodes erased over the lifetime of the graph.
    pub fn erased_count(&self) -> usize {
        self.nodes.len() - self.order.len()
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.order
            .iter()
            .copied()
            .find(|&id| self.node(id).name == name)
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.index()]
    }

    pub fn input(&self, node: NodeId, index: usize) -> ValueId {
        self.node(node).inputs[index]
    }

    pub fn inputs(&self, node: NodeId) -> &[ValueId] {
        &self.node(node).inputs
    }

    pub fn output(&self, node: NodeId, index: usize) -> ValueId {
        self.node(node).outputs[index]
    }

    pub fn outputs(&self, node: NodeId) -> &[ValueId] {
        &self.node(node).outputs
    }

    pub fn producer(&self, value: ValueId) -> NodeId {
        self.value(value).producer
    }

    pub fn producer_kind(&self, value: ValueId) -> OpKind {
        self.kind(self.producer(value))
    }

    pub fn shape(&self, value: ValueId) -> &[i64] {
        &self.value(value).ty.shape
    }

    pub fn repr(&self, value: ValueId) -> Representation {
        self.value(value).ty.repr
    }

    pub fn ty(&self, value: ValueId) -> &TensorType {
        &self.value(value).ty
    }

    pub fn uses(&self, value: ValueId) -> &[Use] {
        &self.value(value).uses
    }

    /// Consuming nodes in use order. A node reading the value twice appears twice.
    pub fn users(&self, value: ValueId) -> Vec<NodeId> {
        self.value(value).uses.iter().map(|u| u.node).collect()
    }

    pub fn first_user(&self, value: ValueId) -> Option<NodeId> {
        self.value(value).uses.first().map(|u| u.node)
    }

    pub fn use_count(&self, value: ValueId) -> usize {
        self.value(value).uses.len()
    }

    pub fn has_one_use(&self, value: ValueId) -> bool {
        self.use_count(value) == 1
    }

    /// Constant data when the value is produced by a weight node.
    pub fn weight_data(&self, value: ValueId) -> Option<&[f64]> {
        match &self.node(self.producer(value)).op {
            Op::Weight { data } => Some(data),
            _ => None,
        }
    }

    pub fn is_weight(&self, value: ValueId) -> bool {
        self.producer_kind(value) == OpKind::Weight
    }

    pub fn is_none(&self, value: ValueId) -> bool {
        self.producer_kind(value) == OpKind::None
    }

    pub fn result_kinds(&self) -> &[ElementKind] {
        &self.result_kinds
    }

    pub fn set_result_kinds(&mut self, kinds: Vec<ElementKind>) {
        self.result_kinds = kinds;
    }

    pub fn return_node(&self) -> Option<NodeId> {
        self.order
            .iter()
            .rev()
            .copied()
            .find(|&id| self.kind(id) == OpKind::Return)
    }

    // ------------------------------------------------------------------
    // Type edits
    // ------------------------------------------------------------------

    pub fn set_repr(&mut self, value: ValueId, repr: Representation) {
        self.values[value.index()].ty.repr = repr;
    }

    pub fn set_shape(&mut self, value: ValueId, shape: Vec<i64>) {
        self.values[value.index()].ty.shape = shape;
    }

    pub fn set_type(&mut self, value: ValueId, ty: TensorType) {
        self.values[value.index()].ty = ty;
    }

    // ------------------------------------------------------------------
    // Structural edits
    // ------------------------------------------------------------------

    /// Appends a node at the end of program order.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: Op,
        inputs: &[ValueId],
        outputs: Vec<TensorType>,
    ) -> NodeId {
        let pos = self.order.len();
        self.insert_at(pos, name.into(), op, inputs, outputs)
    }

    /// Splices a node right after `anchor` in program order.
    pub fn insert_after(
        &mut self,
        anchor: NodeId,
        name: impl Into<String>,
        op: Op,
        inputs: &[ValueId],
        outputs: Vec<TensorType>,
    ) -> NodeId {
        let pos = self.position(anchor) + 1;
        self.insert_at(pos, name.into(), op, inputs, outputs)
    }

    /// Splices a node right before `anchor` in program order.
    pub fn insert_before(
        &mut self,
        anchor: NodeId,
        name: impl Into<String>,
        op: Op,
        inputs: &[ValueId],
        outputs: Vec<TensorType>,
    ) -> NodeId {
        let pos = self.position(anchor);
        self.insert_at(pos, name.into(), op, inputs, outputs)
    }

    fn position(&self, anchor: NodeId) -> usize {
        let pos = self.order.iter().position(|&id| id == anchor);
        crate::invariants::ensure_live(pos, anchor)
    }

    fn insert_at(
        &mut self,
        pos: usize,
        name: String,
        op: Op,
        inputs: &[ValueId],
        outputs: Vec<TensorType>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let name = self.fresh_name(&name);
        self.names.insert(name.clone());

        let mut output_ids = Vec::with_capacity(outputs.len());
        for (slot, ty) in outputs.into_iter().enumerate() {
            let value = ValueId(self.values.len() as u32);
            self.values.push(Value {
                producer: id,
                slot,
                ty,
                uses: Vec::new(),
            });
            output_ids.push(value);
        }
        for (operand, &value) in inputs.iter().enumerate() {
            self.values[value.index()].uses.push(Use { node: id, operand });
        }

        self.nodes.push(Some(Node {
            name,
            op,
            inputs: inputs.to_vec(),
            outputs: output_ids,
            mode: None,
            lowered: false,
            relu_limit: None,
            inner_requant: false,
            conversion: false,
        }));
        self.order.insert(pos, id);
        id
    }

    /// `base` if unused, otherwise `base_1`, `base_2`, ...
    pub fn fresh_name(&self, base: &str) -> String {
        if !self.names.contains(base) {
            return base.to_owned();
        }
        (1..)
            .map(|n| format!("{base}_{n}"))
            .find(|candidate| !self.names.contains(candidate))
            .unwrap_or_else(|| base.to_owned())
    }

    pub fn set_operand(&mut self, node: NodeId, operand: usize, value: ValueId) {
        let old = self.node(node).inputs[operand];
        if old == value {
            return;
        }
        self.remove_use(old, Use { node, operand });
        self.values[value.index()].uses.push(Use { node, operand });
        self.node_mut(node).inputs[operand] = value;
    }

    pub fn push_operand(&mut self, node: NodeId, value: ValueId) {
        let operand = self.node(node).inputs.len();
        self.values[value.index()].uses.push(Use { node, operand });
        self.node_mut(node).inputs.push(value);
    }

    /// Exchanges two operand slots of `node`.
    pub fn swap_operands(&mut self, node: NodeId, a: usize, b: usize) {
        let va = self.input(node, a);
        let vb = self.input(node, b);
        for u in &mut self.values[va.index()].uses {
            if u.node == node && u.operand == a {
                u.operand = usize::MAX;
            }
        }
        for u in &mut self.values[vb.index()].uses {
            if u.node == node && u.operand == b {
                u.operand = a;
            }
        }
        for u in &mut self.values[va.index()].uses {
            if u.node == node && u.operand == usize::MAX {
                u.operand = b;
            }
        }
        self.node_mut(node).inputs.swap(a, b);
    }

    /// Redirects every reader of `from` to `to`.
    pub fn replace_all_uses(&mut self, from: ValueId, to: ValueId) {
        self.replace_uses_where(from, to, |_| true);
    }

    pub fn replace_all_uses_except(&mut self, from: ValueId, to: ValueId, except: NodeId) {
        self.replace_uses_where(from, to, |u| u.node != except);
    }

    fn replace_uses_where(&mut self, from: ValueId, to: ValueId, keep: impl Fn(&Use) -> bool) {
        if from == to {
            return;
        }
        let moved: Vec<Use> = self.values[from.index()]
            .uses
            .iter()
            .copied()
            .filter(|u| keep(u))
            .collect();
        self.values[from.index()].uses.retain(|u| !keep(u));
        for u in &moved {
            self.node_mut(u.node).inputs[u.operand] = to;
        }
        self.values[to.index()].uses.extend(moved);
    }

    /// Removes a node whose outputs have no readers.
    pub fn erase(&mut self, id: NodeId) {
        for &out in &self.node(id).outputs {
            crate::invariants::ensure_unused(self.values[out.index()].uses.len(), id);
        }
        let Some(node) = self.nodes[id.index()].take() else {
            return;
        };
        for (operand, &value) in node.inputs.iter().enumerate() {
            self.remove_use(value, Use { node: id, operand });
        }
        self.order.retain(|&n| n != id);
        self.names.remove(&node.name);
    }

    /// Erases `id` if none of its outputs are read. Returns whether it did.
    pub fn erase_if_dead(&mut self, id: NodeId) -> bool {
        if !self.is_live(id) || self.kind(id) == OpKind::Return {
            return false;
        }
        let dead = self
            .node(id)
            .outputs
            .iter()
            .all(|&out| self.values[out.index()].uses.is_empty());
        if dead {
            self.erase(id);
        }
        dead
    }

    fn remove_use(&mut self, value: ValueId, target: Use) {
        let uses = &mut self.values[value.index()].uses;
        if let Some(pos) = uses.iter().position(|u| *u == target) {
            uses.remove(pos);
        }
    }

    // ------------------------------------------------------------------
    // Builders
    // ------------------------------------------------------------------

    pub fn add_input(
        &mut self,
        name: impl Into<String>,
        shape: impl Into<Vec<i64>>,
        repr: Representation,
    ) -> ValueId {
        let host = repr.storage();
        let id = self.add_node(
            name,
            Op::Input { host },
            &[],
            vec![TensorType::new(shape, repr)],
        );
        self.output(id, 0)
    }

    pub fn add_weight(
        &mut self,
        name: impl Into<String>,
        shape: impl Into<Vec<i64>>,
        elem: ElementKind,
        data: Vec<f64>,
    ) -> ValueId {
        let id = self.add_node(
            name,
            Op::Weight { data },
            &[],
            vec![TensorType::new(shape, Representation::plain(elem))],
        );
        self.output(id, 0)
    }

    pub fn add_none(&mut self, name: impl Into<String>) -> ValueId {
        let id = self.add_node(
            name,
            Op::None,
            &[],
            vec![TensorType::new(
                Vec::new(),
                Representation::plain(ElementKind::F32),
            )],
        );
        self.output(id, 0)
    }

    /// Single-output op appended at the end.
    pub fn add_op(
        &mut self,
        name: impl Into<String>,
        op: Op,
        inputs: &[ValueId],
        shape: impl Into<Vec<i64>>,
        repr: Representation,
    ) -> ValueId {
        let id = self.add_node(name, op, inputs, vec![TensorType::new(shape, repr)]);
        self.output(id, 0)
    }

    pub fn add_return(&mut self, inputs: &[ValueId]) -> NodeId {
        if self.result_kinds.len() != inputs.len() {
            self.result_kinds = inputs
                .iter()
                .map(|&v| self.repr(v).storage())
                .collect();
        }
        self.add_node("return", Op::Return, inputs, Vec::new())
    }

    /// Checks that use lists mirror operand lists exactly.
    pub fn verify_structure(&self) -> Result<(), String> {
        let mut seen = 0usize;
        for &id in &self.order {
            let node = self.node(id);
            for (operand, &value) in node.inputs.iter().enumerate() {
                let target = Use { node: id, operand };
                if !self.values[value.index()].uses.contains(&target) {
                    return Err(format!(
                        "`{}` operand {operand} reads {value} but is missing from its uses",
                        node.name
                    ));
                }
                if !self.is_live(self.values[value.index()].producer) {
                    return Err(format!("`{}` reads {value} of an erased node", node.name));
                }
                seen += 1;
            }
        }
        let recorded: usize = self
            .order
            .iter()
            .flat_map(|&id| self.node(id).outputs.iter())
            .map(|&v| self.values[v.index()].uses.len())
            .sum();
        if recorded != seen {
            return Err(format!(
                "use lists record {recorded} reads but operand lists hold {seen}"
            ));
        }
        Ok(())
    }
}
