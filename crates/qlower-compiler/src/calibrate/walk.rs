//! Propagation cursor: typed edits plus neighbourhood walks.

use std::collections::HashSet;

use qlower_core::{Graph, OpKind, Range, Representation, ValueId};

use crate::LoweringContext;

/// Mutable view handed to every rule. Records each value it retypes so the
/// driver can requeue the affected neighbourhood.
pub(crate) struct Propagator<'a> {
    pub graph: &'a mut Graph,
    pub ctx: &'a LoweringContext,
    touched: Vec<ValueId>,
}

impl<'a> Propagator<'a> {
    pub fn new(graph: &'a mut Graph, ctx: &'a LoweringContext) -> Self {
        Self {
            graph,
            ctx,
            touched: Vec::new(),
        }
    }

    pub fn take_touched(&mut self) -> Vec<ValueId> {
        std::mem::take(&mut self.touched)
    }

    pub fn range(&self, value: ValueId) -> Option<Range> {
        self.graph.repr(value).range()
    }

    pub fn set_repr(&mut self, value: ValueId, repr: Representation) -> bool {
        if self.graph.repr(value) == repr {
            return false;
        }
        self.graph.set_repr(value, repr);
        self.touched.push(value);
        true
    }

    /// Calibrates `value` to `range`, keeping its element kind.
    pub fn set_range(&mut self, value: ValueId, range: Range) -> bool {
        let elem = self.graph.repr(value).storage();
        self.set_repr(value, Representation::with_range(elem, range))
    }

    /// Copies the representation of `value` onto reshape and permute
    /// consumers, following chains of them.
    pub fn forward_walk(&mut self, value: ValueId) {
        let repr = self.graph.repr(value);
        let mut visited = HashSet::new();
        let mut work = vec![value];
        while let Some(current) = work.pop() {
            for user in self.graph.users(current) {
                let kind = self.graph.kind(user);
                if !matches!(kind, OpKind::Reshape | OpKind::Permute) || !visited.insert(user) {
                    continue;
                }
                let out = self.graph.output(user, 0);
                self.set_repr(out, repr);
                work.push(out);
            }
        }
    }

    /// Copies the representation of `value` back through reshape, permute
    /// and depth-to-space producers while each link has a single consumer.
    pub fn backward_walk(&mut self, value: ValueId) {
        let repr = self.graph.repr(value);
        let mut visited = HashSet::new();
        let mut current = value;
        loop {
            let producer = self.graph.producer(current);
            let kind = self.graph.kind(producer);
            if !matches!(
                kind,
                OpKind::Reshape | OpKind::Permute | OpKind::Depth2Space
            ) || !visited.insert(producer)
            {
                break;
            }
            let input = self.graph.input(producer, 0);
            if matches!(
                self.graph.producer_kind(input),
                OpKind::Weight | OpKind::None
            ) {
                break;
            }
            self.set_repr(input, repr);
            if !self.graph.has_one_use(input) {
                break;
            }
            current = input;
        }
    }
}
