//! Lowering of expression trees into the operation graph
//!
//! Leaves become operands directly (variables, constants); every other
//! expression becomes a node after the [`Analyzer`] has checked shapes and
//! dtypes and the backend has confirmed it implements the operator.

use std::collections::HashMap;

use log::trace;

use crate::analyzer::{Analyzer, AxisSpec, ValueType};
use crate::ast::{Expr, Function, IndexArg, UnaryOp};
use crate::error::{CompileError, CompileResult};
use crate::graph::{Constant, Graph, NodeId, Operand};
use crate::ops::{AxisIndex, IndexLayout, Operator, OperatorSupport};
use crate::scalar;
use crate::symbols::SymbolTable;
use crate::types::{DType, Shape};

/// Graph-construction switches
#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub fold_constants: bool,
    pub deduplicate: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            fold_constants: true,
            deduplicate: true,
        }
    }
}

/// A lowered value: where it comes from and its static type
#[derive(Debug, Clone, PartialEq)]
pub struct Lowered {
    pub operand: Operand,
    pub ty: ValueType,
}

impl Lowered {
    fn constant(&self) -> Option<Constant> {
        match self.operand {
            Operand::Const(c) => Some(c),
            _ => None,
        }
    }
}

/// Builds the nodes of one equation
pub struct GraphBuilder<'a> {
    symbols: &'a SymbolTable,
    graph: &'a mut Graph,
    support: &'a dyn OperatorSupport,
    analyzer: &'a Analyzer,
    options: BuildOptions,
    cache: HashMap<(Operator, Vec<Operand>), NodeId>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(
        symbols: &'a SymbolTable,
        graph: &'a mut Graph,
        support: &'a dyn OperatorSupport,
        analyzer: &'a Analyzer,
        options: BuildOptions,
    ) -> Self {
        Self {
            symbols,
            graph,
            support,
            analyzer,
            options,
            cache: HashMap::new(),
        }
    }

    /// Lower an expression into an operand of the graph
    pub fn lower(&mut self, expr: &Expr) -> CompileResult<Lowered> {
        match expr {
            Expr::Literal(literal) => {
                let dtype = self.analyzer.literal_dtype(literal);
                Ok(Lowered {
                    operand: Operand::Const(Constant::new(literal.value(), dtype, true)),
                    ty: ValueType::new(dtype, Shape::scalar(), true),
                })
            }

            Expr::Variable(name) => {
                let id = self.symbols.resolve(name)?;
                let variable = self.symbols.variable(id);
                Ok(Lowered {
                    operand: Operand::Var(id),
                    ty: ValueType::new(variable.dtype, variable.shape.clone(), false),
                })
            }

            Expr::Unary {
                op: UnaryOp::Neg,
                operand,
            } => {
                let inner = self.lower(operand)?;
                let dtype = self.analyzer.neg_dtype(inner.ty.dtype)?;
                let ty = ValueType::new(dtype, inner.ty.shape.clone(), inner.ty.weak);
                self.emit(Operator::Neg, vec![inner], ty)
            }

            Expr::Binary { op, lhs, rhs } => {
                let left = self.lower(lhs)?;
                let right = self.lower(rhs)?;
                let operand_dtype = self.analyzer.unify(&left.ty, &right.ty)?;
                let shape = self.analyzer.broadcast(&left.ty.shape, &right.ty.shape)?;
                let dtype = self.analyzer.binary_dtype(*op, operand_dtype)?;
                let weak = left.ty.weak && right.ty.weak;
                let left = self.coerce(left, operand_dtype)?;
                let right = self.coerce(right, operand_dtype)?;
                self.emit(Operator::Binary(*op), vec![left, right], ValueType::new(dtype, shape, weak))
            }

            Expr::Call { function, args } => {
                let arg = match args.as_slice() {
                    [arg] => self.lower(arg)?,
                    _ => {
                        return Err(CompileError::type_error(format!(
                            "{}() takes {} argument(s), got {}",
                            function.name(),
                            function.arity(),
                            args.len()
                        )))
                    }
                };
                let ty = self.analyzer.call_type(*function, &arg.ty)?;
                self.emit(Operator::Call(*function), vec![arg], ty)
            }

            Expr::Index { target, args } => self.lower_index(target, args),
        }
    }

    fn lower_index(&mut self, target: &Expr, args: &[IndexArg]) -> CompileResult<Lowered> {
        let target = self.lower(target)?;
        let mut axes = Vec::with_capacity(args.len());
        let mut specs = Vec::with_capacity(args.len());
        let mut operands = vec![target.clone()];

        for arg in args {
            match arg {
                IndexArg::Full => {
                    axes.push(AxisIndex::Full);
                    specs.push(AxisSpec::Full);
                }

                IndexArg::Single(expr) => {
                    let index = self.lower(expr)?;
                    let (axis, spec) = match index.ty.dtype {
                        DType::Bool => (AxisIndex::Mask, AxisSpec::Mask(index.ty.shape.clone())),
                        dtype if dtype.is_int() && index.ty.shape.is_scalar() => (
                            AxisIndex::At,
                            AxisSpec::At(index.constant().map(|c| c.value as i64)),
                        ),
                        dtype if dtype.is_int() => {
                            (AxisIndex::Gather, AxisSpec::Gather(index.ty.shape.clone()))
                        }
                        dtype => {
                            return Err(CompileError::type_error(format!(
                                "indices must be integers or booleans, got {}",
                                dtype
                            )))
                        }
                    };
                    axes.push(axis);
                    specs.push(spec);
                    operands.push(index);
                }

                IndexArg::Slice { start, stop, step } => {
                    let mut known = true;
                    let mut parts = [None, None, None];
                    let mut present = [false; 3];
                    for (k, part) in [start, stop, step].into_iter().enumerate() {
                        if let Some(expr) = part {
                            let bound = self.lower_slice_bound(expr)?;
                            present[k] = true;
                            match bound.constant() {
                                Some(c) => parts[k] = Some(c.value as i64),
                                None => known = false,
                            }
                            operands.push(bound);
                        }
                    }
                    axes.push(AxisIndex::Slice {
                        has_start: present[0],
                        has_stop: present[1],
                        has_step: present[2],
                    });
                    specs.push(AxisSpec::Slice(
                        known.then(|| (parts[0], parts[1], parts[2].unwrap_or(1))),
                    ));
                    if parts[2] == Some(0) {
                        return Err(CompileError::value("slice step cannot be zero"));
                    }
                }
            }
        }

        let shape = self.analyzer.index_shape(&target.ty.shape, &specs)?;
        let ty = ValueType::new(target.ty.dtype, shape, target.ty.weak);
        self.emit(Operator::Index(IndexLayout { axes }), operands, ty)
    }

    fn lower_slice_bound(&mut self, expr: &Expr) -> CompileResult<Lowered> {
        let bound = self.lower(expr)?;
        if !bound.ty.dtype.is_int() {
            return Err(CompileError::type_error(format!(
                "slice bounds must be integers, got {}",
                bound.ty.dtype
            )));
        }
        if !bound.ty.shape.is_scalar() {
            return Err(CompileError::index(format!(
                "slice bounds must be scalars, got shape {}",
                bound.ty.shape
            )));
        }
        Ok(bound)
    }

    /// Bring a value to `dtype`: constants are retyped, anything else gets a cast node
    pub fn coerce(&mut self, value: Lowered, dtype: DType) -> CompileResult<Lowered> {
        if value.ty.dtype == dtype {
            return Ok(value);
        }
        if let Some(c) = value.constant() {
            return Ok(Lowered {
                operand: Operand::Const(Constant::new(c.value, dtype, c.weak)),
                ty: ValueType::new(dtype, value.ty.shape, value.ty.weak),
            });
        }
        let ty = ValueType::new(dtype, value.ty.shape.clone(), value.ty.weak);
        self.emit(Operator::Call(Function::Cast(dtype)), vec![value], ty)
    }

    /// Append an update node writing `target`
    pub fn update(&mut self, op: Operator, args: Vec<Operand>, ty: ValueType) -> CompileResult<NodeId> {
        self.support.require(op.code())?;
        let id = self.graph.push(op, args, ty.dtype, ty.shape, false)?;
        trace!("update node {}", self.graph.node(id).name);
        Ok(id)
    }

    fn emit(&mut self, op: Operator, args: Vec<Lowered>, ty: ValueType) -> CompileResult<Lowered> {
        self.support.require(op.code())?;

        let operands: Vec<Operand> = args.iter().map(|a| a.operand).collect();

        if self.options.fold_constants {
            let constants: Option<Vec<Constant>> = args.iter().map(Lowered::constant).collect();
            if let Some(value) = constants.and_then(|c| fold(&op, &c)) {
                trace!("folded {} into {}", op, value);
                return Ok(Lowered {
                    operand: Operand::Const(Constant::new(value, ty.dtype, ty.weak)),
                    ty,
                });
            }
        }

        let key = (op, operands);
        if self.options.deduplicate {
            if let Some(&id) = self.cache.get(&key) {
                trace!("reusing node {}", self.graph.node(id).name);
                return Ok(Lowered {
                    operand: Operand::Node(id),
                    ty,
                });
            }
        }

        let (op, operands) = key;
        let id = self
            .graph
            .push(op.clone(), operands.clone(), ty.dtype, ty.shape.clone(), ty.weak)?;
        trace!("node {}: {} {}", self.graph.node(id).name, ty.dtype, ty.shape);
        if self.options.deduplicate {
            self.cache.insert((op, operands), id);
        }
        Ok(Lowered {
            operand: Operand::Node(id),
            ty,
        })
    }
}

/// Evaluate an operation on scalar constants
fn fold(op: &Operator, args: &[Constant]) -> Option<f64> {
    match (op, args) {
        (Operator::Binary(op), [a, b]) => Some(scalar::binary(*op, a.value, b.value)),
        (Operator::Neg, [a]) => Some(-a.value),
        (Operator::Call(f), [a]) => {
            scalar::elementwise(*f, a.value).or_else(|| scalar::reduce(*f, &[a.value]))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::BinaryOp;
    use crate::ops::{OpCode, OperatorTable};
    use crate::parser::Parser;
    use crate::tensor::Tensor;
    use crate::types::VarRole;
    use pretty_assertions::assert_eq;

    fn full_support() -> OperatorTable<()> {
        let mut table = OperatorTable::new("test");
        for code in OpCode::all() {
            table.add(code, ());
        }
        table
    }

    fn symbols() -> SymbolTable {
        let mut symbols = SymbolTable::new();
        symbols
            .define("a", Tensor::scalar(1.5, DType::Float64), VarRole::StateVar)
            .unwrap();
        symbols
            .define("A", Tensor::vector(&[-1.0, 2.0, -3.0, 4.0, 5.0]), VarRole::Constant)
            .unwrap();
        symbols
            .define("n", Tensor::scalar(2.0, DType::Int64), VarRole::Constant)
            .unwrap();
        symbols
    }

    fn lower_with(source: &str, options: BuildOptions) -> (CompileResult<Lowered>, Graph) {
        let symbols = symbols();
        let table = full_support();
        let analyzer = Analyzer::default();
        let mut graph = Graph::new();
        let result = Parser::new(source)
            .with_known_identifiers(symbols.known_identifiers())
            .parse_expression()
            .and_then(|expr| {
                GraphBuilder::new(&symbols, &mut graph, &table, &analyzer, options).lower(&expr)
            });
        (result, graph)
    }

    fn lower(source: &str) -> (CompileResult<Lowered>, Graph) {
        lower_with(source, BuildOptions::default())
    }

    #[test]
    fn test_literals_fold() {
        let (result, graph) = lower("4 * 5^2");
        let lowered = result.unwrap();
        assert!(graph.is_empty());
        assert!(matches!(lowered.operand, Operand::Const(c) if c.value == 100.0));
        assert_eq!(lowered.ty.dtype, DType::Int64);
        assert!(lowered.ty.weak);

        let (result, _) = lower("5 >= 6");
        let lowered = result.unwrap();
        assert_eq!(lowered.ty.dtype, DType::Bool);
        assert!(matches!(lowered.operand, Operand::Const(c) if c.value == 0.0));
    }

    #[test]
    fn test_weak_literal_adopts_variable_dtype() {
        let (result, graph) = lower("n + 1");
        let lowered = result.unwrap();
        assert_eq!(lowered.ty.dtype, DType::Int64);
        assert!(!lowered.ty.weak);
        assert_eq!(graph.len(), 1);

        // a float literal promotes an integer operand
        let (result, graph) = lower("n * 0.5");
        assert_eq!(result.unwrap().ty.dtype, DType::Float64);
        assert_eq!(graph.node(NodeId(0)).op, Operator::Call(Function::Cast(DType::Float64)));
    }

    #[test]
    fn test_strong_dtypes_must_match() {
        let (result, _) = lower("a + n");
        assert!(matches!(result, Err(CompileError::TypeError { .. })));

        let (result, _) = lower("a + float64(n)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_integer_division_is_float() {
        let (result, _) = lower("n / 2");
        assert_eq!(result.unwrap().ty.dtype, DType::Float64);
    }

    #[test]
    fn test_deduplication() {
        let (result, graph) = lower("sin(a) + sin(a)");
        result.unwrap();
        assert_eq!(graph.len(), 2);

        let options = BuildOptions {
            fold_constants: true,
            deduplicate: false,
        };
        let (result, graph) = lower_with("sin(a) + sin(a)", options);
        result.unwrap();
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_without_folding_literals_become_nodes() {
        let options = BuildOptions {
            fold_constants: false,
            deduplicate: true,
        };
        let (result, graph) = lower_with("4 * 5^2", options);
        assert!(matches!(result.unwrap().operand, Operand::Node(_)));
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.node(NodeId(1)).op, Operator::Binary(BinaryOp::Mul));
    }

    #[test]
    fn test_index_lowering() {
        let (result, graph) = lower("A[0:5]");
        let lowered = result.unwrap();
        assert_eq!(lowered.ty.shape, Shape::fixed(&[5]));
        assert_eq!(graph.len(), 1);

        let (result, _) = lower("A[-2]");
        assert!(result.unwrap().ty.shape.is_scalar());

        let (result, graph) = lower("A[A > 0]");
        let lowered = result.unwrap();
        assert_eq!(lowered.ty.shape, Shape::from_dims(vec![None]));
        assert_eq!(graph.nodes().last().unwrap().op.code(), OpCode::Mask);

        let (result, _) = lower("A[int64(2 * 2):8 - 1]");
        assert_eq!(result.unwrap().ty.shape, Shape::fixed(&[1]));
    }

    #[test]
    fn test_index_errors() {
        assert!(matches!(lower("A[5]").0, Err(CompileError::IndexError { .. })));
        assert!(matches!(lower("A[1.]").0, Err(CompileError::TypeError { .. })));
        assert!(matches!(lower("A[0:2.]").0, Err(CompileError::TypeError { .. })));
        assert!(matches!(lower("A[::0]").0, Err(CompileError::Value { .. })));
        assert!(matches!(lower("A[1, 2]").0, Err(CompileError::IndexError { .. })));
        assert!(matches!(lower("a[0]").0, Err(CompileError::IndexError { .. })));
    }

    #[test]
    fn test_unsupported_operator() {
        let symbols = symbols();
        let mut table = full_support();
        table.remove(OpCode::Call(Function::Mean));
        let analyzer = Analyzer::default();
        let mut graph = Graph::new();
        let expr = Parser::new("mean(A)")
            .with_known_identifiers(symbols.known_identifiers())
            .parse_expression()
            .unwrap();
        let err = GraphBuilder::new(&symbols, &mut graph, &table, &analyzer, BuildOptions::default())
            .lower(&expr)
            .unwrap_err();
        assert!(matches!(err, CompileError::NotImplemented { .. }));
    }

    #[test]
    fn test_undefined_variable() {
        let (result, _) = lower("a + b");
        assert!(matches!(result, Err(CompileError::UndefinedVariable { ref name }) if name == "b"));
    }
}
