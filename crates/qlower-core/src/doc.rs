//! Serialized graph document.
//!
//! Nodes are listed in program order and refer to earlier values by name:
//! `producer` for the first output, `producer#k` for output `k`. Forward
//! references are rejected, which keeps every loaded graph acyclic.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::{
    ElementKind, Graph, GraphState, Mode, NodeId, Op, OpKind, TensorType, ValueId, permute,
};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GraphDoc {
    pub name: String,
    #[serde(default)]
    pub state: GraphState,
    pub nodes: Vec<NodeDoc>,
    /// Declared element kinds of the graph results.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ElementKind>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodeDoc {
    pub name: String,
    pub op: Op,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<TensorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub lowered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relu_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub inner_requant: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub conversion: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate node name `{0}`")]
    DuplicateName(String),
    #[error("node `{node}` reads unknown value `{reference}`")]
    UnknownValue { node: String, reference: String },
    #[error("node `{node}` reads output {index} of `{producer}`, which has {count} output(s)")]
    BadOutputIndex {
        node: String,
        producer: String,
        index: usize,
        count: usize,
    },
    #[error("node `{node}` ({kind}) expects {expected} output(s), found {found}")]
    Arity {
        node: String,
        kind: OpKind,
        expected: &'static str,
        found: usize,
    },
    #[error("node `{node}` ({kind}) expects {expected} operand(s), found {found}")]
    Operands {
        node: String,
        kind: OpKind,
        expected: String,
        found: usize,
    },
    #[error("node `{node}` has permute order {order:?}, which is not a permutation of {rank} axes")]
    BadPermuteOrder {
        node: String,
        order: Vec<i64>,
        rank: usize,
    },
    #[error("node `{node}` has an inverted calibrated range")]
    InvertedRange { node: String },
    #[error("invalid graph document: {0}")]
    Json(String),
}

impl GraphDoc {
    pub fn from_json(text: &str) -> Result<Self, GraphError> {
        serde_json::from_str(text).map_err(|e| GraphError::Json(e.to_string()))
    }

    pub fn to_json(&self, pretty: bool) -> String {
        let result = if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        };
        result.unwrap_or_default()
    }
}

impl Graph {
    pub fn from_doc(doc: &GraphDoc) -> Result<Graph, GraphError> {
        let mut graph = Graph::new(doc.name.clone());
        graph.state = doc.state;
        let mut by_name: HashMap<&str, NodeId> = HashMap::new();

        for node in &doc.nodes {
            if by_name.contains_key(node.name.as_str()) {
                return Err(GraphError::DuplicateName(node.name.clone()));
            }
            check_arity(node)?;
            for out in &node.outputs {
                if let Some(range) = out.repr.range()
                    && !(range.min() <= range.max())
                {
                    return Err(GraphError::InvertedRange {
                        node: node.name.clone(),
                    });
                }
            }

            let inputs = node
                .inputs
                .iter()
                .map(|reference| resolve(&graph, &by_name, &node.name, reference))
                .collect::<Result<Vec<ValueId>, GraphError>>()?;
            check_operands(&graph, node, &inputs)?;

            let id = graph.add_node(
                node.name.clone(),
                node.op.clone(),
                &inputs,
                node.outputs.clone(),
            );
            let n = graph.node_mut(id);
            n.mode = node.mode;
            n.lowered = node.lowered;
            n.relu_limit = node.relu_limit;
            n.inner_requant = node.inner_requant;
            n.conversion = node.conversion;
            by_name.insert(node.name.as_str(), id);
        }

        if !doc.results.is_empty() {
            graph.set_result_kinds(doc.results.clone());
        } else if let Some(ret) = graph.return_node() {
            let kinds = graph
                .inputs(ret)
                .iter()
                .map(|&v| graph.repr(v).storage())
                .collect();
            graph.set_result_kinds(kinds);
        }
        Ok(graph)
    }

    pub fn to_doc(&self) -> GraphDoc {
        let nodes = self
            .order()
            .iter()
            .map(|&id| {
                let node = self.node(id);
                NodeDoc {
                    name: node.name().to_owned(),
                    op: node.op.clone(),
                    inputs: node.inputs().iter().map(|&v| self.value_ref(v)).collect(),
                    outputs: node.outputs().iter().map(|&v| self.ty(v).clone()).collect(),
                    mode: node.mode,
                    lowered: node.lowered,
                    relu_limit: node.relu_limit,
                    inner_requant: node.inner_requant,
                    conversion: node.conversion,
                }
            })
            .collect();
        GraphDoc {
            name: self.name().to_owned(),
            state: self.state,
            nodes,
            results: self.result_kinds().to_vec(),
        }
    }

    /// Reference string for a value as used in documents and dumps.
    pub fn value_ref(&self, value: ValueId) -> String {
        let v = self.value(value);
        let name = self.node_name(v.producer());
        match v.slot() {
            0 => name.to_owned(),
            slot => format!("{name}#{slot}"),
        }
    }
}

fn check_arity(node: &NodeDoc) -> Result<(), GraphError> {
    let kind = node.op.kind();
    let found = node.outputs.len();
    let expected = match kind {
        OpKind::Return => (found == 0).then_some(()).ok_or("0"),
        OpKind::Arg => (1..=2).contains(&found).then_some(()).ok_or("1 or 2"),
        _ => (found == 1).then_some(()).ok_or("1"),
    };
    expected.map_err(|expected| GraphError::Arity {
        node: node.name.clone(),
        kind,
        expected,
        found,
    })
}

fn check_operands(graph: &Graph, node: &NodeDoc, inputs: &[ValueId]) -> Result<(), GraphError> {
    let kind = node.op.kind();
    let found = inputs.len();
    let min = kind.min_operands();
    let expected = match kind {
        OpKind::Input | OpKind::Weight | OpKind::None => {
            (found == 0).then_some(()).ok_or_else(|| "0".to_owned())
        }
        _ => (found >= min).then_some(()).ok_or_else(|| format!("at least {min}")),
    };
    expected.map_err(|expected| GraphError::Operands {
        node: node.name.clone(),
        kind,
        expected,
        found,
    })?;

    if let Op::Permute { order } = &node.op {
        let rank = graph.shape(inputs[0]).len();
        if order.len() != rank || !permute::is_permutation(order) {
            return Err(GraphError::BadPermuteOrder {
                node: node.name.clone(),
                order: order.clone(),
                rank,
            });
        }
    }
    Ok(())
}

fn resolve(
    graph: &Graph,
    by_name: &HashMap<&str, NodeId>,
    node: &str,
    reference: &str,
) -> Result<ValueId, GraphError> {
    let (producer, index) = match reference.rsplit_once('#') {
        Some((producer, index)) => match index.parse::<usize>() {
            Ok(index) => (producer, index),
            Err(_) => (reference, 0),
        },
        None => (reference, 0),
    };
    let Some(&id) = by_name.get(producer) else {
        return Err(GraphError::UnknownValue {
            node: node.to_owned(),
            reference: reference.to_owned(),
        });
    };
    let outputs = graph.outputs(id);
    outputs
        .get(index)
        .copied()
        .ok_or_else(|| GraphError::BadOutputIndex {
            node: node.to_owned(),
            producer: producer.to_owned(),
            index,
            count: outputs.len(),
        })
}
