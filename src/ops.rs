//! Operators of the operation graph and per-backend operator tables

use std::collections::HashMap;

use serde::Serialize;

use crate::ast::{BinaryOp, Function};
use crate::error::{CompileError, CompileResult};
use crate::types::DType;

/// How one axis of an index operation is addressed
///
/// The operands of an index node are the indexed value followed by the
/// operands each axis consumes, in axis order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AxisIndex {
    /// `:`, consumes nothing
    Full,
    /// Single integer position, consumes one operand and drops the axis
    At,
    /// `start:stop:step`, consumes one operand per present part
    Slice {
        has_start: bool,
        has_stop: bool,
        has_step: bool,
    },
    /// Boolean mask, consumes one operand
    Mask,
    /// Rank-1 integer array of positions, consumes one operand
    Gather,
}

impl AxisIndex {
    pub fn operand_count(&self) -> usize {
        match self {
            AxisIndex::Full => 0,
            AxisIndex::At | AxisIndex::Mask | AxisIndex::Gather => 1,
            AxisIndex::Slice {
                has_start,
                has_stop,
                has_step,
            } => [*has_start, *has_stop, *has_step].iter().filter(|&&b| b).count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct IndexLayout {
    pub axes: Vec<AxisIndex>,
}

impl IndexLayout {
    pub fn operand_count(&self) -> usize {
        self.axes.iter().map(AxisIndex::operand_count).sum()
    }

    pub fn has_mask(&self) -> bool {
        self.axes.contains(&AxisIndex::Mask)
    }
}

/// Operator of a graph node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Operator {
    Binary(BinaryOp),
    Neg,
    Call(Function),
    Index(IndexLayout),
    /// `target := value`; operands are `[target, value]`
    Assign,
    /// `target := target + rhs * dt`; operands are `[target, rhs, dt]`
    Integrate,
}

impl Operator {
    /// Key used to look the operator up in a backend table
    pub fn code(&self) -> OpCode {
        match self {
            Operator::Binary(op) => OpCode::Binary(*op),
            Operator::Neg => OpCode::Neg,
            Operator::Call(f) => OpCode::Call(*f),
            Operator::Index(layout) if layout.has_mask() => OpCode::Mask,
            Operator::Index(_) => OpCode::Index,
            Operator::Assign => OpCode::Assign,
            Operator::Integrate => OpCode::Integrate,
        }
    }

    /// Whether the node writes a variable rather than producing a value
    pub fn is_update(&self) -> bool {
        matches!(self, Operator::Assign | Operator::Integrate)
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Flat operator key of a backend [`OperatorTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OpCode {
    Binary(BinaryOp),
    Neg,
    Call(Function),
    Index,
    Mask,
    Assign,
    Integrate,
}

impl OpCode {
    /// Every operator code of the expression language
    pub fn all() -> Vec<OpCode> {
        use BinaryOp::*;
        let mut codes: Vec<OpCode> = [Eq, Ne, Lt, Gt, Le, Ge, Add, Sub, Mul, Div, Mod, Pow]
            .into_iter()
            .map(OpCode::Binary)
            .collect();
        codes.push(OpCode::Neg);
        codes.extend(
            [
                Function::Sin,
                Function::Cos,
                Function::Tan,
                Function::Atan,
                Function::Tanh,
                Function::Exp,
                Function::Log,
                Function::Sqrt,
                Function::Abs,
                Function::Round,
                Function::Sigmoid,
                Function::Sum,
                Function::Mean,
                Function::Max,
                Function::Min,
            ]
            .into_iter()
            .map(OpCode::Call),
        );
        codes.extend(
            [DType::Bool, DType::Int32, DType::Int64, DType::Float32, DType::Float64]
                .into_iter()
                .map(|d| OpCode::Call(Function::Cast(d))),
        );
        codes.extend([OpCode::Index, OpCode::Mask, OpCode::Assign, OpCode::Integrate]);
        codes
    }

    /// Short name used for node names and error messages
    pub fn mnemonic(&self) -> &'static str {
        match self {
            OpCode::Binary(op) => match op {
                BinaryOp::Eq => "eq",
                BinaryOp::Ne => "ne",
                BinaryOp::Lt => "lt",
                BinaryOp::Gt => "gt",
                BinaryOp::Le => "le",
                BinaryOp::Ge => "ge",
                BinaryOp::Add => "add",
                BinaryOp::Sub => "sub",
                BinaryOp::Mul => "mul",
                BinaryOp::Div => "div",
                BinaryOp::Mod => "mod",
                BinaryOp::Pow => "pow",
            },
            OpCode::Neg => "neg",
            OpCode::Call(f) => f.name(),
            OpCode::Index => "index",
            OpCode::Mask => "mask",
            OpCode::Assign => "assign",
            OpCode::Integrate => "integrate",
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpCode::Binary(op) => write!(f, "{}", op.symbol()),
            other => write!(f, "{}", other.mnemonic()),
        }
    }
}

/// Which operators a backend implements
///
/// The graph builder checks every node against this before creating it.
pub trait OperatorSupport {
    fn backend_name(&self) -> &'static str;

    fn supports(&self, code: OpCode) -> bool;

    fn require(&self, code: OpCode) -> CompileResult<()> {
        if self.supports(code) {
            Ok(())
        } else {
            Err(CompileError::not_implemented(code.to_string(), self.backend_name()))
        }
    }
}

impl<I> OperatorSupport for OperatorTable<I> {
    fn backend_name(&self) -> &'static str {
        self.backend
    }

    fn supports(&self, code: OpCode) -> bool {
        self.entries.contains_key(&code)
    }
}

/// Mapping from operator codes to a backend's implementations
#[derive(Debug, Clone)]
pub struct OperatorTable<I> {
    backend: &'static str,
    entries: HashMap<OpCode, I>,
}

impl<I> OperatorTable<I> {
    pub fn new(backend: &'static str) -> Self {
        Self {
            backend,
            entries: HashMap::new(),
        }
    }

    /// Register an implementation, returning the one it replaces
    pub fn add(&mut self, code: OpCode, implementation: I) -> Option<I> {
        self.entries.insert(code, implementation)
    }

    pub fn remove(&mut self, code: OpCode) -> Option<I> {
        self.entries.remove(&code)
    }

    pub fn get(&self, code: OpCode) -> Option<&I> {
        self.entries.get(&code)
    }

    /// Like [`get`](Self::get), failing with `NotImplemented`
    pub fn lookup(&self, code: OpCode) -> CompileResult<&I> {
        self.entries
            .get(&code)
            .ok_or_else(|| CompileError::not_implemented(code.to_string(), self.backend))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
