//! In-process array backend
//!
//! Every graph node becomes a kernel closure over [`Tensor`]s. The program
//! evaluates one layer at a time, optionally spreading a layer over the
//! rayon pool, and applies the collected variable writes at the end in
//! equation order.

use log::{debug, trace};
use rayon::prelude::*;

use crate::ast::{BinaryOp, Function};
use crate::codegen::{CodeGenerator, EmitContext};
use crate::error::{CompileError, CompileResult};
use crate::graph::{Graph, NodeId, OpNode, Operand};
use crate::ops::{AxisIndex, IndexLayout, OpCode, Operator, OperatorSupport, OperatorTable};
use crate::scalar;
use crate::symbols::{SymbolTable, VarId, Variable};
use crate::tensor::{Selector, Tensor};
use crate::types::DType;

pub const BACKEND: &str = "array";

/// Evaluates one node given its operand values in order
pub type Kernel = Box<dyn Fn(&[&Tensor]) -> CompileResult<Tensor> + Send + Sync>;

/// Array implementation of an operator
#[derive(Clone, Copy)]
pub enum ArrayImpl {
    Binary(fn(f64, f64) -> f64),
    Unary(fn(f64) -> f64),
    Reduce(fn(&[f64]) -> f64),
    Cast,
    Index,
    Assign,
    Integrate,
}

impl std::fmt::Debug for ArrayImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            ArrayImpl::Binary(_) => "Binary",
            ArrayImpl::Unary(_) => "Unary",
            ArrayImpl::Reduce(_) => "Reduce",
            ArrayImpl::Cast => "Cast",
            ArrayImpl::Index => "Index",
            ArrayImpl::Assign => "Assign",
            ArrayImpl::Integrate => "Integrate",
        };
        write!(f, "ArrayImpl::{}", kind)
    }
}

macro_rules! binary_impl {
    ($op:expr) => {
        ArrayImpl::Binary(|a, b| scalar::binary($op, a, b))
    };
}

macro_rules! unary_impl {
    ($function:expr) => {
        ArrayImpl::Unary(|x| scalar::elementwise($function, x).unwrap_or(f64::NAN))
    };
}

macro_rules! reduce_impl {
    ($function:expr) => {
        ArrayImpl::Reduce(|values| scalar::reduce($function, values).unwrap_or(f64::NAN))
    };
}

/// Operator table with every operator of the expression language
pub fn default_table() -> OperatorTable<ArrayImpl> {
    let mut table = OperatorTable::new(BACKEND);

    table.add(OpCode::Binary(BinaryOp::Eq), binary_impl!(BinaryOp::Eq));
    table.add(OpCode::Binary(BinaryOp::Ne), binary_impl!(BinaryOp::Ne));
    table.add(OpCode::Binary(BinaryOp::Lt), binary_impl!(BinaryOp::Lt));
    table.add(OpCode::Binary(BinaryOp::Gt), binary_impl!(BinaryOp::Gt));
    table.add(OpCode::Binary(BinaryOp::Le), binary_impl!(BinaryOp::Le));
    table.add(OpCode::Binary(BinaryOp::Ge), binary_impl!(BinaryOp::Ge));
    table.add(OpCode::Binary(BinaryOp::Add), binary_impl!(BinaryOp::Add));
    table.add(OpCode::Binary(BinaryOp::Sub), binary_impl!(BinaryOp::Sub));
    table.add(OpCode::Binary(BinaryOp::Mul), binary_impl!(BinaryOp::Mul));
    table.add(OpCode::Binary(BinaryOp::Div), binary_impl!(BinaryOp::Div));
    table.add(OpCode::Binary(BinaryOp::Mod), binary_impl!(BinaryOp::Mod));
    table.add(OpCode::Binary(BinaryOp::Pow), binary_impl!(BinaryOp::Pow));
    table.add(OpCode::Neg, ArrayImpl::Unary(|x| -x));

    table.add(OpCode::Call(Function::Sin), unary_impl!(Function::Sin));
    table.add(OpCode::Call(Function::Cos), unary_impl!(Function::Cos));
    table.add(OpCode::Call(Function::Tan), unary_impl!(Function::Tan));
    table.add(OpCode::Call(Function::Atan), unary_impl!(Function::Atan));
    table.add(OpCode::Call(Function::Tanh), unary_impl!(Function::Tanh));
    table.add(OpCode::Call(Function::Exp), unary_impl!(Function::Exp));
    table.add(OpCode::Call(Function::Log), unary_impl!(Function::Log));
    table.add(OpCode::Call(Function::Sqrt), unary_impl!(Function::Sqrt));
    table.add(OpCode::Call(Function::Abs), unary_impl!(Function::Abs));
    table.add(OpCode::Call(Function::Round), unary_impl!(Function::Round));
    table.add(OpCode::Call(Function::Sigmoid), unary_impl!(Function::Sigmoid));
    table.add(OpCode::Call(Function::Sum), reduce_impl!(Function::Sum));
    table.add(OpCode::Call(Function::Mean), reduce_impl!(Function::Mean));
    table.add(OpCode::Call(Function::Max), reduce_impl!(Function::Max));
    table.add(OpCode::Call(Function::Min), reduce_impl!(Function::Min));
    for dtype in [DType::Bool, DType::Int32, DType::Int64, DType::Float32, DType::Float64] {
        table.add(OpCode::Call(Function::Cast(dtype)), ArrayImpl::Cast);
    }

    table.add(OpCode::Index, ArrayImpl::Index);
    table.add(OpCode::Mask, ArrayImpl::Index);
    table.add(OpCode::Assign, ArrayImpl::Assign);
    table.add(OpCode::Integrate, ArrayImpl::Integrate);
    table
}

/// Where a kernel argument is read from
#[derive(Debug, Clone)]
enum Input {
    Var(VarId),
    Node(NodeId),
    Const(Tensor),
}

/// One compiled node
pub struct ArrayOp {
    pub node: NodeId,
    pub name: String,
    inputs: Vec<Input>,
    /// Variable written by an update node
    pub writes: Option<VarId>,
    kernel: Kernel,
}

impl ArrayOp {
    fn evaluate(&self, symbols: &SymbolTable, values: &[Option<Tensor>]) -> CompileResult<Tensor> {
        let args = self
            .inputs
            .iter()
            .map(|input| match input {
                Input::Var(id) => Ok(&symbols.variable(*id).value),
                Input::Node(id) => values[id.0].as_ref().ok_or_else(|| {
                    CompileError::value(format!("{} read node {} before it was evaluated", self.name, id.0))
                }),
                Input::Const(value) => Ok(value),
            })
            .collect::<CompileResult<Vec<&Tensor>>>()?;
        (self.kernel)(&args)
    }
}

/// Node values and pending writes of one evaluation
#[derive(Debug, Clone)]
pub struct Execution {
    values: Vec<Option<Tensor>>,
    writes: Vec<(VarId, Tensor)>,
}

impl Execution {
    /// Value of an operand after evaluation
    pub fn value(&self, operand: &Operand, symbols: &SymbolTable) -> CompileResult<Tensor> {
        match operand {
            Operand::Var(id) => Ok(symbols.variable(*id).value.clone()),
            Operand::Const(c) => Ok(Tensor::scalar(c.value, c.dtype)),
            Operand::Node(id) => self
                .values
                .get(id.0)
                .and_then(Option::clone)
                .ok_or_else(|| CompileError::value(format!("node {} has no value", id.0))),
        }
    }

    pub fn writes(&self) -> &[(VarId, Tensor)] {
        &self.writes
    }

    /// Write every update into the symbol table, in equation order
    pub fn apply(self, symbols: &mut SymbolTable) -> CompileResult<()> {
        for (var, value) in &self.writes {
            symbols.write(*var, value)?;
        }
        Ok(())
    }
}

/// Layered kernel program produced by [`ArrayGenerator`]
pub struct ArrayProgram {
    layers: Vec<Vec<ArrayOp>>,
    node_count: usize,
    parallel: bool,
}

impl ArrayProgram {
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn op_count(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

    /// Evaluate every layer without touching variable storage
    pub fn execute(&self, symbols: &SymbolTable) -> CompileResult<Execution> {
        let mut values: Vec<Option<Tensor>> = vec![None; self.node_count];
        let mut writes = Vec::new();

        for layer in &self.layers {
            let results: Vec<CompileResult<Tensor>> = if self.parallel && layer.len() > 1 {
                layer
                    .par_iter()
                    .map(|op| op.evaluate(symbols, &values))
                    .collect()
            } else {
                layer.iter().map(|op| op.evaluate(symbols, &values)).collect()
            };

            // Store sequentially so the outcome does not depend on the pool
            for (op, result) in layer.iter().zip(results) {
                let value = result?;
                trace!("{} -> {:?}", op.name, value.shape());
                match op.writes {
                    Some(var) => writes.push((var, value)),
                    None => values[op.node.0] = Some(value),
                }
            }
        }

        Ok(Execution { values, writes })
    }

    /// Evaluate and apply all updates
    pub fn run(&self, symbols: &mut SymbolTable) -> CompileResult<()> {
        self.execute(symbols)?.apply(symbols)
    }
}

/// Code generator producing an [`ArrayProgram`]
pub struct ArrayGenerator {
    table: OperatorTable<ArrayImpl>,
    parallel: bool,
    layers: Vec<Vec<ArrayOp>>,
}

impl ArrayGenerator {
    pub fn new(parallel: bool) -> Self {
        Self::with_table(default_table(), parallel)
    }

    pub fn with_table(table: OperatorTable<ArrayImpl>, parallel: bool) -> Self {
        Self {
            table,
            parallel,
            layers: Vec::new(),
        }
    }
}

impl OperatorSupport for ArrayGenerator {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn supports(&self, code: OpCode) -> bool {
        self.table.supports(code)
    }
}

impl CodeGenerator for ArrayGenerator {
    type Output = ArrayProgram;

    fn declare_variable(&mut self, _ctx: &EmitContext<'_>, _id: VarId, variable: &Variable) -> CompileResult<()> {
        // storage stays in the symbol table
        trace!("array variable {} {} {}", variable.name, variable.dtype, variable.shape);
        Ok(())
    }

    fn begin_layer(&mut self, _ctx: &EmitContext<'_>, _index: usize) -> CompileResult<()> {
        self.layers.push(Vec::new());
        Ok(())
    }

    fn emit_operation(&mut self, _ctx: &EmitContext<'_>, id: NodeId, node: &OpNode) -> CompileResult<()> {
        let implementation = *self.table.lookup(node.op.code())?;
        let kernel = build_kernel(implementation, node)?;
        let inputs = node
            .args
            .iter()
            .map(|arg| match arg {
                Operand::Var(var) => Input::Var(*var),
                Operand::Node(dep) => Input::Node(*dep),
                Operand::Const(c) => Input::Const(Tensor::scalar(c.value, c.dtype)),
            })
            .collect();

        let op = ArrayOp {
            node: id,
            name: node.name.clone(),
            inputs,
            writes: node.target(),
            kernel,
        };
        match self.layers.last_mut() {
            Some(layer) => layer.push(op),
            None => self.layers.push(vec![op]),
        }
        Ok(())
    }

    fn finalize_procedure(self, ctx: &EmitContext<'_>) -> CompileResult<ArrayProgram> {
        let program = ArrayProgram {
            layers: self.layers,
            node_count: ctx.graph.len(),
            parallel: self.parallel,
        };
        debug!(
            "array program: {} op(s) in {} layer(s)",
            program.op_count(),
            program.layer_count()
        );
        Ok(program)
    }
}

fn build_kernel(implementation: ArrayImpl, node: &OpNode) -> CompileResult<Kernel> {
    let dtype = node.dtype;
    let kernel: Kernel = match (implementation, &node.op) {
        (ArrayImpl::Binary(f), Operator::Binary(_)) => {
            Box::new(move |args: &[&Tensor]| args[0].zip_with(args[1], dtype, f))
        }
        (ArrayImpl::Unary(f), Operator::Neg | Operator::Call(_)) => {
            Box::new(move |args: &[&Tensor]| Ok(args[0].map(dtype, f)))
        }
        (ArrayImpl::Reduce(f), Operator::Call(_)) => {
            Box::new(move |args: &[&Tensor]| Ok(args[0].reduce(dtype, f)))
        }
        (ArrayImpl::Cast, Operator::Call(_)) => Box::new(move |args: &[&Tensor]| Ok(args[0].cast(dtype))),
        (ArrayImpl::Index, Operator::Index(layout)) => {
            let layout = layout.clone();
            Box::new(move |args: &[&Tensor]| {
                let selectors = selectors(&layout, &args[1..])?;
                args[0].select(&selectors)
            })
        }
        (ArrayImpl::Assign, Operator::Assign) => Box::new(|args: &[&Tensor]| Ok(args[1].clone())),
        (ArrayImpl::Integrate, Operator::Integrate) => Box::new(move |args: &[&Tensor]| {
            let step = args[1].zip_with(args[2], DType::Float64, |r, dt| r * dt)?;
            args[0].zip_with(&step, dtype, |x, d| x + d)
        }),
        (implementation, op) => {
            return Err(CompileError::value(format!(
                "{:?} cannot implement operator {}",
                implementation, op
            )))
        }
    };
    Ok(kernel)
}

fn scalar_index(value: &Tensor) -> CompileResult<i64> {
    value
        .item()
        .map(|v| v as i64)
        .ok_or_else(|| CompileError::index(format!("expected a scalar index, got shape {:?}", value.shape())))
}

/// Runtime selectors of an index node from its axis operands
fn selectors(layout: &IndexLayout, operands: &[&Tensor]) -> CompileResult<Vec<Selector>> {
    let mut operands = operands.iter().copied();
    let mut next = move || {
        operands
            .next()
            .ok_or_else(|| CompileError::index("index node is missing an operand"))
    };

    let mut selectors = Vec::with_capacity(layout.axes.len());
    for axis in &layout.axes {
        let selector = match axis {
            AxisIndex::Full => Selector::Full,
            AxisIndex::At => Selector::At(scalar_index(next()?)?),
            AxisIndex::Slice {
                has_start,
                has_stop,
                has_step,
            } => {
                let start = if *has_start { Some(scalar_index(next()?)?) } else { None };
                let stop = if *has_stop { Some(scalar_index(next()?)?) } else { None };
                let step = if *has_step { scalar_index(next()?)? } else { 1 };
                Selector::Slice { start, stop, step }
            }
            AxisIndex::Mask => {
                let mask = next()?;
                if mask.shape().len() > 1 {
                    Selector::FlatMask(mask.as_bools())
                } else {
                    Selector::Mask(mask.as_bools())
                }
            }
            AxisIndex::Gather => {
                Selector::Positions(next()?.data().iter().map(|&v| v as i64).collect())
            }
        };
        selectors.push(selector);
    }
    Ok(selectors)
}

/// Compile `graph` for the array backend with the default operator table
pub fn compile_graph(symbols: &SymbolTable, graph: &Graph, parallel: bool) -> CompileResult<ArrayProgram> {
    crate::codegen::generate(ArrayGenerator::new(parallel), symbols, graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::builder::{BuildOptions, GraphBuilder};
    use crate::parser::Parser;
    use crate::types::VarRole;
    use pretty_assertions::assert_eq;

    fn symbols() -> SymbolTable {
        let mut symbols = SymbolTable::new();
        symbols
            .define("A", Tensor::vector(&[-1.0, 2.0, -3.0, 4.0, 5.0, 6.0]), VarRole::Constant)
            .unwrap();
        symbols
            .define(
                "M",
                Tensor::matrix(&[vec![1.0, -2.0, 3.0], vec![-4.0, 5.0, -6.0]]).unwrap(),
                VarRole::Constant,
            )
            .unwrap();
        symbols
            .define("n", Tensor::scalar(3.0, DType::Int64), VarRole::Constant)
            .unwrap();
        symbols
    }

    fn eval_with(source: &str, options: BuildOptions, parallel: bool) -> CompileResult<Tensor> {
        let symbols = symbols();
        let table = default_table();
        let analyzer = Analyzer::default();
        let mut graph = Graph::new();
        let expr = Parser::new(source)
            .with_known_identifiers(symbols.known_identifiers())
            .parse_expression()?;
        let result = GraphBuilder::new(&symbols, &mut graph, &table, &analyzer, options).lower(&expr)?;
        let program = compile_graph(&symbols, &graph, parallel)?;
        program.execute(&symbols)?.value(&result.operand, &symbols)
    }

    fn eval(source: &str) -> Tensor {
        let unfolded = BuildOptions {
            fold_constants: false,
            deduplicate: true,
        };
        eval_with(source, unfolded, false).unwrap()
    }

    #[test]
    fn test_arithmetic_without_folding() {
        assert_eq!(eval("4 * 5^2").item(), Some(100.0));
        assert_eq!(eval("(4 + 5) * 2").item(), Some(18.0));
        assert_eq!(eval("5 >= 6").dtype(), DType::Bool);
        assert_eq!(eval("5 >= 6").item(), Some(0.0));
        assert_eq!(eval("-7 % 3").item(), Some(2.0));
    }

    #[test]
    fn test_slicing() {
        assert_eq!(eval("A[0:5]").data(), &[-1.0, 2.0, -3.0, 4.0, 5.0]);
        assert_eq!(eval("A[-2]").item(), Some(5.0));
        assert_eq!(eval("A[::-2]").data(), &[6.0, 4.0, 2.0]);
        assert_eq!(eval("A[1:n]").data(), &[2.0, -3.0]);
        assert_eq!(eval("M[1, 0:-1]").data(), &[-4.0, 5.0]);
        assert_eq!(eval("M[:, 2]").data(), &[3.0, -6.0]);
    }

    #[test]
    fn test_masks() {
        assert_eq!(eval("A[A > 0]").data(), &[2.0, 4.0, 5.0, 6.0]);
        assert_eq!(eval("M[M < 0]").data(), &[-2.0, -4.0, -6.0]);
        assert_eq!(eval("sum(A > 0)").dtype(), DType::Int64);
        assert_eq!(eval("sum(A > 0)").item(), Some(4.0));
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval("abs(A)").data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(eval("max(M)").item(), Some(5.0));
        assert_eq!(eval("mean(A)").item(), Some(13.0 / 6.0));
        assert_eq!(eval("int32(A / 2)").data(), &[0.0, 1.0, -1.0, 2.0, 2.0, 3.0]);
        assert!((eval("sigmoid(0.)").item().unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let source = "sin(A) * cos(A) + exp(A / 10) - sqrt(abs(A))";
        let options = BuildOptions::default();
        let sequential = eval_with(source, options, false).unwrap();
        let parallel = eval_with(source, options, true).unwrap();
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_writes_are_applied_in_order() {
        let mut symbols = symbols();
        let x = symbols
            .define("x", Tensor::scalar(0.0, DType::Float64), VarRole::StateVar)
            .unwrap();
        let mut graph = Graph::new();
        for value in [1.0, 2.0] {
            graph
                .push(
                    Operator::Assign,
                    vec![
                        Operand::Var(x),
                        Operand::Const(crate::graph::Constant::new(value, DType::Float64, false)),
                    ],
                    DType::Float64,
                    crate::types::Shape::scalar(),
                    false,
                )
                .unwrap();
        }
        let program = compile_graph(&symbols, &graph, false).unwrap();
        program.run(&mut symbols).unwrap();
        assert_eq!(symbols.value("x").unwrap().item(), Some(2.0));
    }

    #[test]
    fn test_replaced_implementation() {
        let mut table = default_table();
        table.add(OpCode::Call(Function::Abs), ArrayImpl::Unary(|x| x * 10.0));
        let symbols = symbols();
        let mut graph = Graph::new();
        let a = symbols.resolve("A").unwrap();
        let node = graph
            .push(
                Operator::Call(Function::Abs),
                vec![Operand::Var(a)],
                DType::Float64,
                crate::types::Shape::fixed(&[6]),
                false,
            )
            .unwrap();
        let program = crate::codegen::generate(ArrayGenerator::with_table(table, false), &symbols, &graph).unwrap();
        let value = program
            .execute(&symbols)
            .unwrap()
            .value(&Operand::Node(node), &symbols)
            .unwrap();
        assert_eq!(value.data()[0], -10.0);
    }

    #[test]
    fn test_runtime_shape_mismatch() {
        let mut symbols = symbols();
        symbols
            .define("P", Tensor::zeros(DType::Float64, &[3, 3]), VarRole::Constant)
            .unwrap();
        symbols
            .define("Q", Tensor::zeros(DType::Float64, &[4, 4]), VarRole::Constant)
            .unwrap();
        let analyzer = Analyzer::new(true, DType::Float64);
        let table = default_table();
        let mut graph = Graph::new();
        let expr = Parser::new("P + Q")
            .with_known_identifiers(symbols.known_identifiers())
            .parse_expression()
            .unwrap();
        GraphBuilder::new(&symbols, &mut graph, &table, &analyzer, BuildOptions::default())
            .lower(&expr)
            .unwrap();
        let program = compile_graph(&symbols, &graph, false).unwrap();
        let err = program.execute(&symbols).unwrap_err();
        assert!(matches!(err, CompileError::ShapeMismatch { .. }));
    }
}
