//! Fortran source backend
//!
//! Emits one fixed-form subroutine evaluating the right-hand sides of all
//! equations:
//!
//! ```text
//!       subroutine func(ndim,t,y,args,y_delta)
//! ```
//!
//! Targets of differential equations travel in the state vector `y`
//! (packed column-major in symbol order); their derivatives come back in
//! `y_delta`. Every other non-raw variable lives in the flat parameter
//! array `args`, and assignment targets are written back into it. Raw
//! variables become `parameter` constants.
//!
//! Indices are rewritten from 0-based to 1-based. Computed positions that
//! fall outside their axis raise a flag stored after the parameters in
//! `args`, which the caller turns into an index error. Boolean masks and
//! `mean` have no implementation here.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};
use serde::Serialize;

use crate::ast::{BinaryOp, Function};
use crate::codegen::{CodeGenerator, EmitContext};
use crate::config::FortranOptions;
use crate::error::{CompileError, CompileResult};
use crate::graph::{Graph, NodeId, OpNode, Operand};
use crate::linewrap::wrap_fixed_form;
use crate::ops::{AxisIndex, IndexLayout, OpCode, Operator, OperatorSupport, OperatorTable};
use crate::symbols::{SymbolTable, VarId, Variable};
use crate::tensor::{normalize_index, slice_indices, Tensor};
use crate::types::{DType, Shape, VarRole};

pub const BACKEND: &str = "fortran";

/// Names the generated code uses for itself
const RESERVED: &[&str] = &[
    "func", "ndim", "t", "y", "args", "y_delta", "icp", "ijac", "dfdu", "dfdp", "stpnt", "bcnd",
    "icnd", "fopt", "pvls", "sin", "cos", "tan", "atan", "tanh", "exp", "log", "sqrt", "abs",
    "anint", "sum", "maxval", "minval", "count", "any", "all", "merge", "modulo", "dble", "real",
    "int", "nint", "reshape",
];

/// Fortran rendering of an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FortranImpl {
    /// `a <op> b`
    Infix(&'static str),
    /// `<op>a`
    Prefix(&'static str),
    /// `NAME(a)` or `NAME(a, b)`
    Intrinsic(&'static str),
    /// Text with `{0}` standing for the argument
    Template(&'static str),
    /// Array reduction; scalars reduce to themselves
    Reduce(&'static str),
    /// Type conversion to the node dtype
    Convert,
    Index,
    Assign,
    Integrate,
}

/// Operator table of the Fortran backend
pub fn default_table() -> OperatorTable<FortranImpl> {
    use FortranImpl::*;
    let mut table = OperatorTable::new(BACKEND);

    table.add(OpCode::Binary(BinaryOp::Eq), Infix("=="));
    table.add(OpCode::Binary(BinaryOp::Ne), Infix("/="));
    table.add(OpCode::Binary(BinaryOp::Lt), Infix("<"));
    table.add(OpCode::Binary(BinaryOp::Gt), Infix(">"));
    table.add(OpCode::Binary(BinaryOp::Le), Infix("<="));
    table.add(OpCode::Binary(BinaryOp::Ge), Infix(">="));
    table.add(OpCode::Binary(BinaryOp::Add), Infix("+"));
    table.add(OpCode::Binary(BinaryOp::Sub), Infix("-"));
    table.add(OpCode::Binary(BinaryOp::Mul), Infix("*"));
    table.add(OpCode::Binary(BinaryOp::Div), Infix("/"));
    table.add(OpCode::Binary(BinaryOp::Mod), Intrinsic("MODULO"));
    table.add(OpCode::Binary(BinaryOp::Pow), Infix("**"));
    table.add(OpCode::Neg, Prefix("-"));

    table.add(OpCode::Call(Function::Sin), Intrinsic("SIN"));
    table.add(OpCode::Call(Function::Cos), Intrinsic("COS"));
    table.add(OpCode::Call(Function::Tan), Intrinsic("TAN"));
    table.add(OpCode::Call(Function::Atan), Intrinsic("ATAN"));
    table.add(OpCode::Call(Function::Tanh), Intrinsic("TANH"));
    table.add(OpCode::Call(Function::Exp), Intrinsic("EXP"));
    table.add(OpCode::Call(Function::Log), Intrinsic("LOG"));
    table.add(OpCode::Call(Function::Sqrt), Intrinsic("SQRT"));
    table.add(OpCode::Call(Function::Abs), Intrinsic("ABS"));
    table.add(OpCode::Call(Function::Round), Intrinsic("ANINT"));
    table.add(OpCode::Call(Function::Sigmoid), Template("1d0/(1d0+EXP(-{0}))"));
    table.add(OpCode::Call(Function::Sum), Reduce("SUM"));
    table.add(OpCode::Call(Function::Max), Reduce("MAXVAL"));
    table.add(OpCode::Call(Function::Min), Reduce("MINVAL"));
    for dtype in [DType::Bool, DType::Int32, DType::Int64, DType::Float32, DType::Float64] {
        table.add(OpCode::Call(Function::Cast(dtype)), Convert);
    }

    table.add(OpCode::Index, Index);
    table.add(OpCode::Assign, Assign);
    table.add(OpCode::Integrate, Integrate);
    table
}

/// Placement of one variable in `y` or `args`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slot {
    pub var: VarId,
    pub name: String,
    /// Identifier in the generated source
    pub fortran_name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// 0-based offset into the packed vector
    pub offset: usize,
}

impl Slot {
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 1-based section of the packed vector, `3` or `3:5`
    fn section(&self) -> String {
        if self.shape.is_empty() {
            format!("{}", self.offset + 1)
        } else {
            format!("{}:{}", self.offset + 1, self.offset + self.len())
        }
    }

    fn unpack(&self, values: &[f64]) -> CompileResult<Tensor> {
        let end = self.offset + self.len();
        let values = values.get(self.offset..end).ok_or_else(|| {
            CompileError::shape_mismatch(format!("at least {} values", end), format!("{} values", values.len()))
        })?;
        let values: Vec<f64> = values.iter().map(|&v| self.dtype.normalize(v)).collect();
        Tensor::from_column_major(self.dtype, self.shape.clone(), &values)
    }
}

/// Generated source and the layout of its arguments
#[derive(Debug, Clone, Serialize)]
pub struct FortranProcedure {
    pub source: String,
    /// Contents of `y`, in order
    pub states: Vec<Slot>,
    /// Contents of `args`, in order
    pub args: Vec<Slot>,
    /// Variables whose `args` slots the routine overwrites
    pub written_args: Vec<VarId>,
    pub auto_compat: bool,
    /// `c.ivp` constants file in AUTO compatibility mode
    pub auto_constants: Option<String>,
    /// Offset in `args` of the out-of-range index flag
    pub fault_slot: Option<usize>,
}

impl FortranProcedure {
    pub fn ndim(&self) -> usize {
        self.states.iter().map(Slot::len).sum()
    }

    pub fn nargs(&self) -> usize {
        self.args.iter().map(Slot::len).sum::<usize>() + usize::from(self.fault_slot.is_some())
    }

    /// Current state vector, column-major per variable
    pub fn pack_states(&self, symbols: &SymbolTable) -> Vec<f64> {
        pack(&self.states, symbols)
    }

    pub fn pack_args(&self, symbols: &SymbolTable) -> Vec<f64> {
        let mut args = pack(&self.args, symbols);
        if self.fault_slot.is_some() {
            args.push(0.0);
        }
        args
    }

    /// Error if the routine flagged an out-of-range index in `args`
    pub fn check_fault(&self, args: &[f64]) -> CompileResult<()> {
        match self.fault_slot.and_then(|slot| args.get(slot)) {
            Some(&flag) if flag != 0.0 => Err(CompileError::index(
                "computed index is out of bounds in the generated routine",
            )),
            _ => Ok(()),
        }
    }

    /// Write a state vector back into the symbol table
    pub fn unpack_states(&self, symbols: &mut SymbolTable, y: &[f64]) -> CompileResult<()> {
        for slot in &self.states {
            symbols.write(slot.var, &slot.unpack(y)?)?;
        }
        Ok(())
    }

    /// Write back the parameters the routine assigned
    pub fn unpack_args(&self, symbols: &mut SymbolTable, args: &[f64]) -> CompileResult<()> {
        for slot in self.args.iter().filter(|s| self.written_args.contains(&s.var)) {
            symbols.write(slot.var, &slot.unpack(args)?)?;
        }
        Ok(())
    }
}

fn pack(slots: &[Slot], symbols: &SymbolTable) -> Vec<f64> {
    let mut out = Vec::with_capacity(slots.iter().map(Slot::len).sum());
    for slot in slots {
        out.extend(symbols.variable(slot.var).value.column_major());
    }
    out
}

/// Unique, case-insensitive Fortran identifiers
#[derive(Debug, Clone)]
struct NameAllocator {
    used: HashSet<String>,
}

impl NameAllocator {
    fn new() -> Self {
        Self {
            used: RESERVED.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn allocate(&mut self, base: &str) -> String {
        let mut base: String = base
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        if !base.starts_with(|c: char| c.is_ascii_alphabetic()) {
            base.insert_str(0, "v_");
        }
        base.truncate(56);

        if self.used.insert(base.clone()) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{}_{}", base, n);
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

fn type_name(dtype: DType) -> &'static str {
    match dtype {
        DType::Bool => "logical",
        DType::Int32 => "integer",
        DType::Int64 => "integer(kind=8)",
        DType::Float32 => "real",
        DType::Float64 => "double precision",
    }
}

fn declaration(dtype: DType, dims: &[usize], name: &str) -> String {
    if dims.is_empty() {
        format!("{} :: {}", type_name(dtype), name)
    } else {
        format!("{}, dimension({}) :: {}", type_name(dtype), join(dims), name)
    }
}

fn join(dims: &[usize]) -> String {
    dims.iter().map(usize::to_string).collect::<Vec<_>>().join(",")
}

fn static_dims(shape: &Shape, what: &str) -> CompileResult<Vec<usize>> {
    shape
        .concrete()
        .ok_or_else(|| CompileError::not_implemented(format!("data-dependent shape {} of {}", shape, what), BACKEND))
}

/// Source literal of `value` as `dtype`
pub fn literal(value: f64, dtype: DType) -> CompileResult<String> {
    if !value.is_finite() {
        return Err(CompileError::not_implemented(format!("non-finite constant {}", value), BACKEND));
    }
    let text = match dtype {
        DType::Bool => return Ok(if value != 0.0 { ".TRUE." } else { ".FALSE." }.to_string()),
        DType::Int32 => format!("{}", value as i64),
        DType::Int64 => format!("{}_8", value as i64),
        DType::Float32 => format!("{:e}", value as f32),
        DType::Float64 => format!("{:e}", value).replace('e', "d"),
    };
    if value < 0.0 {
        Ok(format!("({})", text))
    } else {
        Ok(text)
    }
}

fn unit_literals(dtype: DType) -> (&'static str, &'static str) {
    match dtype {
        DType::Bool => (".TRUE.", ".FALSE."),
        DType::Int32 => ("1", "0"),
        DType::Int64 => ("1_8", "0_8"),
        DType::Float32 => ("1e0", "0e0"),
        DType::Float64 => ("1d0", "0d0"),
    }
}

/// Convert an expression of dtype `from` to `to`
fn convert(text: &str, from: DType, to: DType) -> String {
    if from == to {
        return text.to_string();
    }
    match (from, to) {
        (DType::Bool, _) => {
            let (one, zero) = unit_literals(to);
            format!("MERGE({}, {}, {})", one, zero, text)
        }
        (_, DType::Bool) => format!("({} /= 0)", text),
        (_, DType::Float64) => format!("DBLE({})", text),
        (_, DType::Float32) => format!("REAL({})", text),
        (_, DType::Int32) => format!("INT({})", text),
        (_, DType::Int64) => format!("INT({}, 8)", text),
    }
}

/// Convert a double precision expression read from `y` or `args`
fn from_double(text: &str, to: DType) -> String {
    match to {
        DType::Float64 => text.to_string(),
        DType::Float32 => format!("REAL({})", text),
        DType::Int32 => format!("NINT({})", text),
        DType::Int64 => format!("NINT({}, 8)", text),
        DType::Bool => format!("({} /= 0d0)", text),
    }
}

/// Static type of an operand
fn operand_type(ctx: &EmitContext<'_>, operand: &Operand) -> (DType, Shape) {
    match operand {
        Operand::Var(id) => {
            let variable = ctx.symbols.variable(*id);
            (variable.dtype, variable.shape.clone())
        }
        Operand::Node(id) => {
            let node = ctx.graph.node(*id);
            (node.dtype, node.shape.clone())
        }
        Operand::Const(c) => (c.dtype, Shape::scalar()),
    }
}

/// Elementwise operands must agree in shape unless one is a scalar
fn check_conformable(a: &Shape, b: &Shape) -> CompileResult<()> {
    if a.is_scalar() || b.is_scalar() || a == b {
        Ok(())
    } else {
        Err(CompileError::not_implemented(
            format!("broadcasting {} against {}", a, b),
            BACKEND,
        ))
    }
}

/// Code generator producing a [`FortranProcedure`]
pub struct FortranGenerator {
    table: OperatorTable<FortranImpl>,
    options: FortranOptions,
    names: NameAllocator,
    var_names: HashMap<VarId, String>,
    node_names: HashMap<NodeId, String>,
    integrated: Option<HashSet<VarId>>,
    states: Vec<Slot>,
    args: Vec<Slot>,
    declarations: Vec<String>,
    parameters: Vec<String>,
    state_loads: Vec<String>,
    arg_loads: Vec<String>,
    body: Vec<String>,
    staged: Vec<String>,
    deltas: Vec<String>,
    assigns: Vec<String>,
    written: Vec<VarId>,
    /// Local flag set by out-of-range computed indices
    fault: Option<String>,
}

impl FortranGenerator {
    pub fn new(options: FortranOptions) -> Self {
        Self::with_table(default_table(), options)
    }

    pub fn with_table(table: OperatorTable<FortranImpl>, options: FortranOptions) -> Self {
        Self {
            table,
            options,
            names: NameAllocator::new(),
            var_names: HashMap::new(),
            node_names: HashMap::new(),
            integrated: None,
            states: Vec::new(),
            args: Vec::new(),
            declarations: Vec::new(),
            parameters: Vec::new(),
            state_loads: Vec::new(),
            arg_loads: Vec::new(),
            body: Vec::new(),
            staged: Vec::new(),
            deltas: Vec::new(),
            assigns: Vec::new(),
            written: Vec::new(),
            fault: None,
        }
    }

    /// Targets of differential equations
    fn integrated(&mut self, graph: &Graph) -> &HashSet<VarId> {
        self.integrated.get_or_insert_with(|| {
            graph
                .updates()
                .filter(|(_, node)| node.op == Operator::Integrate)
                .filter_map(|(_, node)| node.target())
                .collect()
        })
    }

    fn operand(&self, operand: &Operand) -> CompileResult<String> {
        match operand {
            Operand::Var(id) => self
                .var_names
                .get(id)
                .cloned()
                .ok_or_else(|| CompileError::value(format!("variable {} was not declared", id.0))),
            Operand::Node(id) => self
                .node_names
                .get(id)
                .cloned()
                .ok_or_else(|| CompileError::value(format!("node {} was not emitted", id.0))),
            Operand::Const(c) => literal(c.value, c.dtype),
        }
    }

    /// Operand text converted to `dtype`
    fn operand_as(&self, ctx: &EmitContext<'_>, operand: &Operand, dtype: DType) -> CompileResult<String> {
        if let Operand::Const(c) = operand {
            return literal(c.value, dtype);
        }
        let (from, _) = operand_type(ctx, operand);
        Ok(convert(&self.operand(operand)?, from, dtype))
    }

    fn slot(&self, id: VarId, variable: &Variable, dims: Vec<usize>, offset: usize) -> CompileResult<Slot> {
        Ok(Slot {
            var: id,
            name: variable.name.clone(),
            fortran_name: self
                .var_names
                .get(&id)
                .cloned()
                .ok_or_else(|| CompileError::value(format!("variable {} was not named", variable.name)))?,
            dtype: variable.dtype,
            shape: dims,
            offset,
        })
    }

    /// Expression text of `node`; `checks` collects index bound conditions
    fn expression(
        &self,
        ctx: &EmitContext<'_>,
        implementation: FortranImpl,
        node: &OpNode,
        checks: &mut Vec<String>,
    ) -> CompileResult<String> {
        let arg = |i: usize| {
            node.args
                .get(i)
                .ok_or_else(|| CompileError::value(format!("{} is missing operand {}", node.name, i)))
        };

        match (implementation, &node.op) {
            (FortranImpl::Infix(symbol), Operator::Binary(op)) => {
                let (a, b) = (arg(0)?, arg(1)?);
                let (operand_dtype, a_shape) = operand_type(ctx, a);
                check_conformable(&a_shape, &operand_type(ctx, b).1)?;

                let symbol = if operand_dtype.is_bool() {
                    match op {
                        BinaryOp::Eq => ".EQV.",
                        BinaryOp::Ne => ".NEQV.",
                        _ => {
                            return Err(CompileError::not_implemented(
                                format!("{} on logical operands", op.symbol()),
                                BACKEND,
                            ))
                        }
                    }
                } else {
                    symbol
                };
                // integer division and the like compute in the result dtype
                let dtype = if op.is_comparison() { operand_dtype } else { node.dtype };
                Ok(format!(
                    "{} {} {}",
                    self.operand_as(ctx, a, dtype)?,
                    symbol,
                    self.operand_as(ctx, b, dtype)?
                ))
            }
            (FortranImpl::Intrinsic(name), Operator::Binary(_)) => {
                let (a, b) = (arg(0)?, arg(1)?);
                check_conformable(&operand_type(ctx, a).1, &operand_type(ctx, b).1)?;
                Ok(format!(
                    "{}({}, {})",
                    name,
                    self.operand_as(ctx, a, node.dtype)?,
                    self.operand_as(ctx, b, node.dtype)?
                ))
            }
            (FortranImpl::Prefix(symbol), Operator::Neg) => {
                Ok(format!("{}{}", symbol, self.operand_as(ctx, arg(0)?, node.dtype)?))
            }
            (FortranImpl::Intrinsic(name), Operator::Call(function)) => {
                let a = arg(0)?;
                let (from, _) = operand_type(ctx, a);
                if *function == Function::Round && !from.is_float() {
                    return self.operand_as(ctx, a, node.dtype);
                }
                Ok(format!("{}({})", name, self.operand_as(ctx, a, node.dtype)?))
            }
            (FortranImpl::Template(template), Operator::Call(_)) => {
                let a = self.operand_as(ctx, arg(0)?, node.dtype)?;
                Ok(template.replace("{0}", &a))
            }
            (FortranImpl::Reduce(name), Operator::Call(function)) => {
                let a = arg(0)?;
                let (from, shape) = operand_type(ctx, a);
                if shape.is_scalar() {
                    return self.operand_as(ctx, a, node.dtype);
                }
                let text = self.operand(a)?;
                let reduced = match (function, from) {
                    (Function::Sum, DType::Bool) => format!("COUNT({})", text),
                    (Function::Max, DType::Bool) => format!("ANY({})", text),
                    (Function::Min, DType::Bool) => format!("ALL({})", text),
                    _ => format!("{}({})", name, text),
                };
                let from = match (function, from) {
                    (Function::Sum, DType::Bool) => DType::Int32,
                    _ => from,
                };
                Ok(convert(&reduced, from, node.dtype))
            }
            (FortranImpl::Convert, Operator::Call(Function::Cast(to))) => self.operand_as(ctx, arg(0)?, *to),
            (FortranImpl::Index, Operator::Index(layout)) => self.index_expression(ctx, layout, node, checks),
            (implementation, op) => Err(CompileError::value(format!(
                "{:?} cannot implement operator {}",
                implementation, op
            ))),
        }
    }

    /// `target(i, lo:hi:step, ...)` with 1-based subscripts
    fn index_expression(
        &self,
        ctx: &EmitContext<'_>,
        layout: &IndexLayout,
        node: &OpNode,
        checks: &mut Vec<String>,
    ) -> CompileResult<String> {
        let (target, operands) = node
            .args
            .split_first()
            .ok_or_else(|| CompileError::value(format!("{} has no target", node.name)))?;
        let dims = static_dims(&operand_type(ctx, target).1, &node.name)?;
        if layout.axes.len() > dims.len() {
            return Err(CompileError::index(format!(
                "{} indices for a value of rank {}",
                layout.axes.len(),
                dims.len()
            )));
        }

        let mut operands = operands.iter();
        let mut next = || {
            operands
                .next()
                .ok_or_else(|| CompileError::index(format!("{} is missing an index operand", node.name)))
        };
        let constant = |operand: &Operand| match operand {
            Operand::Const(c) => Ok(c.value as i64),
            _ => Err(CompileError::not_implemented("computed slice bounds", BACKEND)),
        };

        let mut subscripts = Vec::with_capacity(dims.len());
        for (axis, &len) in layout.axes.iter().zip(&dims) {
            let subscript = match axis {
                AxisIndex::Full => ":".to_string(),
                AxisIndex::At => match next()? {
                    Operand::Const(c) => format!("{}", normalize_index(c.value as i64, len)? + 1),
                    computed => self.wrapped_position(ctx, computed, len, checks)?,
                },
                AxisIndex::Gather => self.wrapped_position(ctx, next()?, len, checks)?,
                AxisIndex::Slice {
                    has_start,
                    has_stop,
                    has_step,
                } => {
                    let start = if *has_start { Some(constant(next()?)?) } else { None };
                    let stop = if *has_stop { Some(constant(next()?)?) } else { None };
                    let step = if *has_step { constant(next()?)? } else { 1 };
                    if step == 0 {
                        return Err(CompileError::value("slice step cannot be zero"));
                    }
                    section(&slice_indices(len, start, stop, step), step)
                }
                AxisIndex::Mask => return Err(CompileError::not_implemented("boolean mask", BACKEND)),
            };
            subscripts.push(subscript);
        }
        for _ in layout.axes.len()..dims.len() {
            subscripts.push(":".to_string());
        }

        Ok(format!("{}({})", self.operand(target)?, subscripts.join(", ")))
    }

    /// 1-based subscript of a computed, possibly negative, position.
    ///
    /// Positions outside `-len..len` add a condition to `checks`; the
    /// subscript itself always stays inside the axis.
    fn wrapped_position(
        &self,
        ctx: &EmitContext<'_>,
        operand: &Operand,
        len: usize,
        checks: &mut Vec<String>,
    ) -> CompileResult<String> {
        let (dtype, shape) = operand_type(ctx, operand);
        let len = if dtype == DType::Int64 {
            format!("{}_8", len)
        } else {
            len.to_string()
        };
        let text = self.operand(operand)?;
        let outside = format!("{} < -{} .OR. {} >= {}", text, len, text, len);
        checks.push(if shape.is_scalar() {
            outside
        } else {
            format!("ANY({})", outside)
        });
        Ok(format!("MODULO({}, {})+1", text, len))
    }

    fn fault_name(&mut self) -> String {
        let names = &mut self.names;
        self.fault
            .get_or_insert_with(|| names.allocate("index_fault"))
            .clone()
    }

    fn emit_value(&mut self, ctx: &EmitContext<'_>, id: NodeId, node: &OpNode, implementation: FortranImpl) -> CompileResult<()> {
        let dims = static_dims(&node.shape, &node.name)?;
        let mut checks = Vec::new();
        let expression = self.expression(ctx, implementation, node, &mut checks)?;
        if !checks.is_empty() {
            let fault = self.fault_name();
            self.body
                .extend(checks.iter().map(|check| format!("IF ({}) {} = 1", check, fault)));
        }
        let name = self.names.allocate(&node.name);
        self.declarations.push(declaration(node.dtype, &dims, &name));
        self.body.push(format!("{} = {}", name, expression));
        self.node_names.insert(id, name);
        Ok(())
    }

    fn emit_assign(&mut self, ctx: &EmitContext<'_>, node: &OpNode) -> CompileResult<()> {
        let target = node
            .target()
            .ok_or_else(|| CompileError::value(format!("{} has no target", node.name)))?;
        if self.integrated(ctx.graph).contains(&target) {
            return Err(CompileError::not_implemented("assignment to an integrated state", BACKEND));
        }
        let variable = ctx.symbols.variable(target);
        let dims = static_dims(&variable.shape, &variable.name)?;
        let value = node
            .args
            .get(1)
            .ok_or_else(|| CompileError::value(format!("{} has no value", node.name)))?;
        check_conformable(&variable.shape, &operand_type(ctx, value).1)?;

        let target_name = self.operand(&Operand::Var(target))?;
        let mut text = self.operand_as(ctx, value, variable.dtype)?;
        // Variables are read before any assignment of this step lands
        if let Operand::Var(_) = value {
            let staged = self.names.allocate(&format!("{}_next", target_name));
            self.declarations.push(declaration(variable.dtype, &dims, &staged));
            self.staged.push(format!("{} = {}", staged, text));
            text = staged;
        }
        self.assigns.push(format!("{} = {}", target_name, text));
        if !self.written.contains(&target) {
            self.written.push(target);
        }
        Ok(())
    }

    fn emit_integrate(&mut self, ctx: &EmitContext<'_>, node: &OpNode) -> CompileResult<()> {
        let target = node
            .target()
            .ok_or_else(|| CompileError::value(format!("{} has no target", node.name)))?;
        let slot = self
            .states
            .iter()
            .find(|s| s.var == target)
            .cloned()
            .ok_or_else(|| CompileError::value(format!("{} integrates a variable outside the state vector", node.name)))?;
        let rhs = node
            .args
            .get(1)
            .ok_or_else(|| CompileError::value(format!("{} has no right-hand side", node.name)))?;
        let (_, rhs_shape) = operand_type(ctx, rhs);
        check_conformable(&Shape::fixed(&slot.shape), &rhs_shape)?;

        let mut text = self.operand_as(ctx, rhs, slot.dtype)?;
        if rhs_shape.rank() > 1 {
            text = format!("RESHAPE({}, (/{}/))", text, slot.len());
        }
        self.deltas.push(format!("y_delta({}) = {}", slot.section(), text));
        Ok(())
    }

    fn load(slot: &Slot, array: &str) -> String {
        let mut source = format!("{}({})", array, slot.section());
        if slot.shape.len() > 1 {
            source = format!("RESHAPE({}, (/{}/))", source, join(&slot.shape));
        }
        format!("{} = {}", slot.fortran_name, from_double(&source, slot.dtype))
    }

    fn store(slot: &Slot) -> String {
        let mut value = convert(&slot.fortran_name, slot.dtype, DType::Float64);
        if slot.shape.len() > 1 {
            value = format!("RESHAPE({}, (/{}/))", value, slot.len());
        }
        format!("args({}) = {}", slot.section(), value)
    }

    fn parameter(variable: &Variable, name: &str, dims: &[usize]) -> CompileResult<String> {
        let values = variable.value.column_major();
        let value = if dims.is_empty() {
            literal(values.first().copied().unwrap_or(0.0), variable.dtype)?
        } else {
            if values.is_empty() {
                return Err(CompileError::not_implemented(
                    format!("empty raw array `{}`", variable.name),
                    BACKEND,
                ));
            }
            let items = values
                .iter()
                .map(|&v| literal(v, variable.dtype))
                .collect::<CompileResult<Vec<_>>>()?;
            let constructor = format!("(/{}/)", items.join(","));
            if dims.len() > 1 {
                format!("RESHAPE({}, (/{}/))", constructor, join(dims))
            } else {
                constructor
            }
        };
        let attributes = if dims.is_empty() {
            format!("{}, parameter", type_name(variable.dtype))
        } else {
            format!("{}, dimension({}), parameter", type_name(variable.dtype), join(dims))
        };
        Ok(format!("{} :: {} = {}", attributes, name, value))
    }

    fn start_point(&self, symbols: &SymbolTable) -> CompileResult<Vec<String>> {
        let mut lines = vec![
            "subroutine stpnt(ndim, y, args, t)".to_string(),
            "implicit none".to_string(),
            "integer, intent(in) :: ndim".to_string(),
            "double precision, intent(inout) :: y(ndim), args(*)".to_string(),
            "double precision, intent(in) :: t".to_string(),
        ];
        for (array, slots) in [("args", &self.args), ("y", &self.states)] {
            for slot in slots {
                let values = symbols.variable(slot.var).value.column_major();
                for (i, value) in values.into_iter().enumerate() {
                    lines.push(format!(
                        "{}({}) = {}",
                        array,
                        slot.offset + i + 1,
                        literal(value, DType::Float64)?
                    ));
                }
            }
        }
        lines.push("end subroutine stpnt".to_string());
        for routine in ["bcnd", "icnd", "fopt", "pvls"] {
            lines.push(format!("subroutine {}", routine));
            lines.push(format!("end subroutine {}", routine));
        }
        Ok(lines)
    }
}

/// `c.ivp` constants for an AUTO-07p run of the generated routine
pub fn auto_constants(ndim: usize, npar: usize) -> String {
    let (ndim, npar) = (ndim.to_string(), npar.to_string());
    let entries: [(&str, &str); 25] = [
        ("NDIM", &ndim),
        ("NPAR", &npar),
        ("IPS", "-2"),
        ("ILP", "0"),
        ("ICP", "14"),
        ("NTST", "1"),
        ("NCOL", "4"),
        ("IAD", "3"),
        ("ISP", "0"),
        ("ISW", "1"),
        ("IPLT", "0"),
        ("NBC", "0"),
        ("NINT", "0"),
        ("NMX", "10000"),
        ("NPR", "10"),
        ("MXBF", "10"),
        ("IID", "2"),
        ("ITMX", "8"),
        ("ITNW", "5"),
        ("NWTN", "3"),
        ("JAC", "0"),
        ("EPSL", "1e-7"),
        ("EPSU", "1e-7"),
        ("EPSS", "1e-5"),
        ("IRS", "0"),
    ];
    entries
        .iter()
        .map(|(key, value)| format!("{} = {}\n", key, value))
        .collect()
}

/// Fortran section of the 0-based positions `indices`
fn section(indices: &[usize], step: i64) -> String {
    match (indices.first(), indices.last()) {
        (Some(&first), Some(&last)) if step == 1 || first == last => format!("{}:{}", first + 1, last + 1),
        (Some(&first), Some(&last)) => format!("{}:{}:{}", first + 1, last + 1, step),
        _ => "1:0".to_string(),
    }
}

impl OperatorSupport for FortranGenerator {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn supports(&self, code: OpCode) -> bool {
        self.table.supports(code)
    }
}

impl CodeGenerator for FortranGenerator {
    type Output = FortranProcedure;

    fn declare_variable(&mut self, ctx: &EmitContext<'_>, id: VarId, variable: &Variable) -> CompileResult<()> {
        let dims = static_dims(&variable.shape, &variable.name)?;
        let name = self.names.allocate(&variable.name);
        self.var_names.insert(id, name.clone());

        if variable.role == VarRole::Raw {
            self.parameters.push(Self::parameter(variable, &name, &dims)?);
            return Ok(());
        }

        self.declarations.push(declaration(variable.dtype, &dims, &name));
        if self.integrated(ctx.graph).contains(&id) {
            let offset = self.states.iter().map(Slot::len).sum();
            let slot = self.slot(id, variable, dims, offset)?;
            self.state_loads.push(Self::load(&slot, "y"));
            self.states.push(slot);
        } else {
            let offset = self.args.iter().map(Slot::len).sum();
            let slot = self.slot(id, variable, dims, offset)?;
            self.arg_loads.push(Self::load(&slot, "args"));
            self.args.push(slot);
        }
        Ok(())
    }

    fn emit_operation(&mut self, ctx: &EmitContext<'_>, id: NodeId, node: &OpNode) -> CompileResult<()> {
        let implementation = *self.table.lookup(node.op.code())?;
        match implementation {
            FortranImpl::Assign => self.emit_assign(ctx, node),
            FortranImpl::Integrate => self.emit_integrate(ctx, node),
            _ => self.emit_value(ctx, id, node, implementation),
        }
    }

    fn finalize_procedure(self, ctx: &EmitContext<'_>) -> CompileResult<FortranProcedure> {
        let auto = self.options.auto_compat;
        let signature: &[&str] = if auto {
            &[
                "subroutine func(ndim,y,icp,args,ijac,y_delta,dfdu,dfdp)",
                "implicit none",
                "integer, intent(in) :: ndim, icp(*), ijac",
                "double precision, intent(in) :: y(ndim), args(*)",
                "double precision, intent(out) :: y_delta(ndim)",
                "double precision, intent(inout) :: dfdu(ndim,ndim), dfdp(ndim,*)",
            ]
        } else {
            &[
                "subroutine func(ndim,t,y,args,y_delta)",
                "implicit none",
                "integer, intent(in) :: ndim",
                "double precision, intent(in) :: t, y(ndim)",
                "double precision, intent(inout) :: args(*)",
                "double precision, intent(out) :: y_delta(ndim)",
            ]
        };

        let fault_declaration = self.fault.as_ref().map(|name| format!("integer :: {}", name));
        let mut code: Vec<String> = self
            .declarations
            .iter()
            .chain(&fault_declaration)
            .chain(&self.parameters)
            .map(|l| format!("      {}", l))
            .collect();
        let mut section = |comment: &str, statements: &[&[String]]| {
            if statements.iter().all(|s| s.is_empty()) {
                return;
            }
            code.push(String::new());
            code.push(format!("! {}", comment));
            for group in statements {
                code.extend(group.iter().map(|s| format!("      {}", s)));
            }
        };

        section("declare constants", &[self.arg_loads.as_slice()]);
        section("extract state variables from input vector", &[self.state_loads.as_slice()]);
        let fault_reset: Vec<String> = self.fault.iter().map(|name| format!("{} = 0", name)).collect();
        section(
            "calculate right-hand side update of equation system",
            &[
                fault_reset.as_slice(),
                self.body.as_slice(),
                self.staged.as_slice(),
                self.deltas.as_slice(),
            ],
        );

        let written = if auto {
            if !self.written.is_empty() {
                warn!("AUTO-compatible routines cannot write parameters back; assignments stay local");
            }
            Vec::new()
        } else {
            self.written.clone()
        };
        let mut stores: Vec<String> = self
            .args
            .iter()
            .filter(|slot| written.contains(&slot.var))
            .map(Self::store)
            .collect();
        let fault_slot = match &self.fault {
            Some(_) if auto => {
                warn!("AUTO-compatible routines cannot report out-of-range indices");
                None
            }
            Some(name) => {
                let slot: usize = self.args.iter().map(Slot::len).sum();
                stores.push(format!("args({}) = DBLE({})", slot + 1, name));
                Some(slot)
            }
            None => None,
        };
        section("update system parameters", &[self.assigns.as_slice(), stores.as_slice()]);

        code.push("      end subroutine func".to_string());

        if auto {
            code.push(String::new());
            code.extend(self.start_point(ctx.symbols)?.into_iter().map(|l| format!("      {}", l)));
        }

        // the fixed signature lines stay within 72 columns unwrapped
        let mut source: String = signature.iter().map(|l| format!("      {}\n", l)).collect();
        source.push_str(&wrap_fixed_form(&code.join("\n"), self.options.line_width));
        let ndim: usize = self.states.iter().map(Slot::len).sum();
        let nargs: usize = self.args.iter().map(Slot::len).sum();
        debug!(
            "fortran routine: {} state value(s), {} parameter value(s), {} line(s)",
            ndim,
            nargs,
            source.lines().count()
        );

        Ok(FortranProcedure {
            source,
            states: self.states,
            args: self.args,
            written_args: written,
            auto_compat: auto,
            auto_constants: auto.then(|| auto_constants(ndim, nargs)),
            fault_slot,
        })
    }
}

/// Generate the Fortran routine of `graph`
pub fn compile_graph(symbols: &SymbolTable, graph: &Graph, options: &FortranOptions) -> CompileResult<FortranProcedure> {
    crate::codegen::generate(FortranGenerator::new(options.clone()), symbols, graph)
}
