//! Execution traces
//!
//! A trace mirrors the pipeline node for node. `expected` and `judgment`
//! are either both present or both absent on every node.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::Conversation;

/// Recorded execution of one pipeline node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TraceNode {
    Atomic {
        name: String,
        model: String,
        input: Value,
        prompt: Conversation,
        completion: String,
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        judgment: Option<Value>,
    },
    Sequence {
        input: Value,
        left: Box<TraceNode>,
        right: Box<TraceNode>,
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        judgment: Option<Value>,
    },
    Mux {
        input: Value,
        children: Vec<MuxBranchTrace>,
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        judgment: Option<Value>,
    },
}

/// One dispatched mux task and the child it ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuxBranchTrace {
    /// Index of the child in the mux
    pub child: usize,
    pub trace: TraceNode,
}

impl TraceNode {
    pub fn kind(&self) -> &'static str {
        match self {
            TraceNode::Atomic { .. } => "atomic",
            TraceNode::Sequence { .. } => "sequence",
            TraceNode::Mux { .. } => "mux",
        }
    }

    pub fn input(&self) -> &Value {
        match self {
            TraceNode::Atomic { input, .. }
            | TraceNode::Sequence { input, .. }
            | TraceNode::Mux { input, .. } => input,
        }
    }

    pub fn output(&self) -> &Value {
        match self {
            TraceNode::Atomic { output, .. }
            | TraceNode::Sequence { output, .. }
            | TraceNode::Mux { output, .. } => output,
        }
    }

    pub fn expected(&self) -> Option<&Value> {
        match self {
            TraceNode::Atomic { expected, .. }
            | TraceNode::Sequence { expected, .. }
            | TraceNode::Mux { expected, .. } => expected.as_ref(),
        }
    }

    pub fn judgment(&self) -> Option<&Value> {
        match self {
            TraceNode::Atomic { judgment, .. }
            | TraceNode::Sequence { judgment, .. }
            | TraceNode::Mux { judgment, .. } => judgment.as_ref(),
        }
    }

    /// Nesting depth, an atomic node being 1
    pub fn depth(&self) -> usize {
        match self {
            TraceNode::Atomic { .. } => 1,
            TraceNode::Sequence { left, right, .. } => 1 + left.depth().max(right.depth()),
            TraceNode::Mux { children, .. } => {
                1 + children.iter().map(|c| c.trace.depth()).max().unwrap_or(0)
            }
        }
    }

    /// Every judgment in the tree, depth first
    pub fn judgments(&self) -> Vec<&Value> {
        let mut found = Vec::new();
        self.collect_judgments(&mut found);
        found
    }

    fn collect_judgments<'a>(&'a self, found: &mut Vec<&'a Value>) {
        match self {
            TraceNode::Atomic { .. } => {}
            TraceNode::Sequence { left, right, .. } => {
                left.collect_judgments(found);
                right.collect_judgments(found);
            }
            TraceNode::Mux { children, .. } => {
                for child in children {
                    child.trace.collect_judgments(found);
                }
            }
        }
        if let Some(judgment) = self.judgment() {
            found.push(judgment);
        }
    }
}
