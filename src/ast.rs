//! Abstract syntax tree for expressions and equations

use serde::{Deserialize, Serialize};

use crate::types::DType;

/// Numeric literal as written in the source
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    Float(f64),
}

impl Literal {
    pub fn value(&self) -> f64 {
        match self {
            Literal::Int(n) => *n as f64,
            Literal::Float(x) => *x,
        }
    }
}

/// Binary operators, in the order of the precedence table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "^",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge
        )
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
}

/// Functions of the fixed registry; every one takes a single argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Atan,
    Tanh,
    Exp,
    Log,
    Sqrt,
    Abs,
    Round,
    Sigmoid,
    Sum,
    Mean,
    Max,
    Min,
    Cast(DType),
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        let function = match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "atan" => Function::Atan,
            "tanh" => Function::Tanh,
            "exp" => Function::Exp,
            "log" => Function::Log,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            "round" => Function::Round,
            "sigmoid" => Function::Sigmoid,
            "sum" => Function::Sum,
            "mean" => Function::Mean,
            "max" => Function::Max,
            "min" => Function::Min,
            other => return DType::from_name(other).map(Function::Cast),
        };
        Some(function)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
            Function::Atan => "atan",
            Function::Tanh => "tanh",
            Function::Exp => "exp",
            Function::Log => "log",
            Function::Sqrt => "sqrt",
            Function::Abs => "abs",
            Function::Round => "round",
            Function::Sigmoid => "sigmoid",
            Function::Sum => "sum",
            Function::Mean => "mean",
            Function::Max => "max",
            Function::Min => "min",
            Function::Cast(dtype) => dtype.name(),
        }
    }

    pub fn arity(&self) -> usize {
        1
    }

    pub fn is_reduction(&self) -> bool {
        matches!(
            self,
            Function::Sum | Function::Mean | Function::Max | Function::Min
        )
    }
}

/// One comma-separated entry inside `[...]`
#[derive(Debug, Clone, PartialEq)]
pub enum IndexArg {
    /// `:`
    Full,
    /// A single index, mask or index array
    Single(Expr),
    /// `start:stop` or `start:stop:step`, each part optional
    Slice {
        start: Option<Box<Expr>>,
        stop: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
}

/// Expression types
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal
    Literal(Literal),

    /// Variable reference
    Variable(String),

    /// Binary operation: `a + b`, `a >= b`, `a ^ b`
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },

    /// Unary operation: `-a`
    Unary { op: UnaryOp, operand: Box<Expr> },

    /// Indexing: `A[0:5]`, `A[A > 0]`, `A[4, 5]`
    Index { target: Box<Expr>, args: Vec<IndexArg> },

    /// Registered function call: `abs(x)`, `int64(x)`
    Call { function: Function, args: Vec<Expr> },
}

/// Update mode of an equation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// `x = rhs`
    Assign,
    /// `d/dt * x = rhs`
    Differential,
}

/// A parsed equation: the assignment node of the tree
#[derive(Debug, Clone, PartialEq)]
pub struct EquationAst {
    pub target: String,
    pub mode: UpdateMode,
    pub rhs: Expr,
}
