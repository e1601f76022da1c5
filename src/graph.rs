//! Operation graph
//!
//! Nodes are stored in insertion order and may only reference earlier
//! nodes, so the node list is always a valid topological order.

use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::error::{CompileError, CompileResult};
use crate::ops::Operator;
use crate::symbols::VarId;
use crate::types::{DType, Shape};

/// Handle of a node in its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub usize);

/// Scalar constant embedded in a node's operands
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Constant {
    pub value: f64,
    pub dtype: DType,
    /// Untyped literal (or folded from untyped literals only)
    pub weak: bool,
}

impl Constant {
    pub fn new(value: f64, dtype: DType, weak: bool) -> Self {
        Self {
            value: dtype.normalize(value),
            dtype,
            weak,
        }
    }
}

// Bitwise equality so constants can key the deduplication cache
impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        self.value.to_bits() == other.value.to_bits()
            && self.dtype == other.dtype
            && self.weak == other.weak
    }
}

impl Eq for Constant {}

impl Hash for Constant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.to_bits().hash(state);
        self.dtype.hash(state);
        self.weak.hash(state);
    }
}

/// Input of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Operand {
    Var(VarId),
    Node(NodeId),
    Const(Constant),
}

#[derive(Debug, Clone, Serialize)]
pub struct OpNode {
    pub name: String,
    pub op: Operator,
    pub args: Vec<Operand>,
    pub dtype: DType,
    pub shape: Shape,
    pub weak: bool,
}

impl OpNode {
    /// Nodes this node reads
    pub fn dependencies(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.args.iter().filter_map(|arg| match arg {
            Operand::Node(id) => Some(*id),
            _ => None,
        })
    }

    /// Variable written by an update node
    pub fn target(&self) -> Option<VarId> {
        match (self.op.is_update(), self.args.first()) {
            (true, Some(Operand::Var(var))) => Some(*var),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Graph {
    nodes: Vec<OpNode>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node; every node operand must already exist
    pub fn push(
        &mut self,
        op: Operator,
        args: Vec<Operand>,
        dtype: DType,
        shape: Shape,
        weak: bool,
    ) -> CompileResult<NodeId> {
        let id = NodeId(self.nodes.len());
        if let Some(later) = args.iter().find_map(|arg| match arg {
            Operand::Node(dep) if dep.0 >= id.0 => Some(*dep),
            _ => None,
        }) {
            return Err(CompileError::value(format!(
                "node {} cannot read node {} before it exists",
                id.0, later.0
            )));
        }

        let name = format!("{}_{}", op.code().mnemonic(), id.0);
        self.nodes.push(OpNode {
            name,
            op,
            args,
            dtype,
            shape,
            weak,
        });
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> &OpNode {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> &[OpNode] {
        &self.nodes
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &OpNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop every node pushed after the graph had `len` nodes
    pub fn truncate(&mut self, len: usize) {
        self.nodes.truncate(len);
    }

    /// Update nodes in insertion (equation) order
    pub fn updates(&self) -> impl Iterator<Item = (NodeId, &OpNode)> {
        self.iter().filter(|(_, n)| n.op.is_update())
    }
}
