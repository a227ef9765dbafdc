//! Read-only snapshot of a factor graph for diagnostic tooling.

use crate::context::GroupBy;
use crate::error::FactorError;
use crate::node::{Factor, Kernel, NodeKind, Operand};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputView {
    Factor(usize),
    Scalar(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    pub id: usize,
    /// `column`, `classifier`, `datetime`, `op` or `custom`.
    pub kind: &'static str,
    pub name: String,
    pub win: usize,
    pub groupby: GroupBy,
    pub inputs: Vec<InputView>,
    pub mask: Option<usize>,
    pub delay: bool,
}

/// Nodes reachable from the roots, each listed once, upstreams before consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphView {
    pub nodes: Vec<NodeView>,
}

impl GraphView {
    pub fn from_roots(roots: &[Factor]) -> Self {
        let mut view = Self::default();
        let mut seen = HashSet::new();
        for root in roots {
            view.visit(root, &mut seen);
        }
        view
    }

    fn visit(&mut self, factor: &Factor, seen: &mut HashSet<usize>) {
        if !seen.insert(factor.id()) {
            return;
        }
        let mask = factor.mask();
        if let Some(mask) = &mask {
            self.visit(mask, seen);
        }
        let inputs = factor
            .inputs()
            .iter()
            .map(|input| match input {
                Operand::Factor(upstream) => {
                    self.visit(upstream, seen);
                    InputView::Factor(upstream.id())
                }
                Operand::Scalar(value) => InputView::Scalar(*value),
            })
            .collect();
        self.nodes.push(NodeView {
            id: factor.id(),
            kind: kind_name(factor.kind()),
            name: factor.name().to_string(),
            win: factor.win(),
            groupby: factor.groupby().clone(),
            inputs,
            mask: mask.map(|mask| mask.id()),
            delay: factor.should_delay(),
        });
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn to_json(&self) -> Result<String, FactorError> {
        serde_json::to_string_pretty(self).map_err(|err| FactorError::Config {
            reason: format!("graph serialization failed: {err}"),
        })
    }
}

fn kind_name(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::Column { .. } => "column",
        NodeKind::Classifier { .. } => "classifier",
        NodeKind::Datetime { .. } => "datetime",
        NodeKind::Compute {
            kernel: Kernel::Op { .. },
        } => "op",
        NodeKind::Compute {
            kernel: Kernel::Custom { .. },
        } => "custom",
    }
}
