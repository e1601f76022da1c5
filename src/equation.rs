//! Compilation of single equations into update nodes
//!
//! `x = rhs` becomes an assign node, `d/dt * x = rhs` an integrate node
//! reading the `dt` variable. Targets that do not exist yet are created
//! from the type of the right-hand side.

use log::debug;
use serde::Serialize;

use crate::analyzer::{Analyzer, ValueType};
use crate::ast::UpdateMode;
use crate::builder::{BuildOptions, GraphBuilder};
use crate::error::{CompileError, CompileResult};
use crate::graph::{Graph, NodeId, Operand};
use crate::ops::{Operator, OperatorSupport};
use crate::parser::Parser;
use crate::symbols::{SymbolTable, VarId};
use crate::types::{Shape, VarRole};

/// Name of the step-size variable read by differential equations
pub const DT: &str = "dt";

/// A compiled equation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Equation {
    pub source: String,
    pub target: VarId,
    pub mode: UpdateMode,
    /// Right-hand side value
    pub rhs: Operand,
    /// The update node
    pub node: NodeId,
}

/// Compiles equation text against a symbol table into a graph
pub struct EquationCompiler<'a> {
    support: &'a dyn OperatorSupport,
    analyzer: &'a Analyzer,
    options: BuildOptions,
}

impl<'a> EquationCompiler<'a> {
    pub fn new(support: &'a dyn OperatorSupport, analyzer: &'a Analyzer, options: BuildOptions) -> Self {
        Self {
            support,
            analyzer,
            options,
        }
    }

    /// Compile `source`, binding its target if needed.
    ///
    /// On error the symbol table and graph are rolled back to their state
    /// before the call.
    pub fn compile(&self, source: &str, symbols: &mut SymbolTable, graph: &mut Graph) -> CompileResult<Equation> {
        let checkpoint = symbols.checkpoint();
        let graph_len = graph.len();
        match self.compile_into(source, symbols, graph) {
            Ok(equation) => Ok(equation),
            Err(err) => {
                symbols.rollback(checkpoint);
                graph.truncate(graph_len);
                Err(err)
            }
        }
    }

    fn compile_into(&self, source: &str, symbols: &mut SymbolTable, graph: &mut Graph) -> CompileResult<Equation> {
        let ast = Parser::new(source)
            .with_known_identifiers(symbols.known_identifiers())
            .parse_equation()?;

        let dt = match ast.mode {
            UpdateMode::Differential => Some(self.step_variable(symbols)?),
            UpdateMode::Assign => None,
        };

        let rhs = GraphBuilder::new(symbols, graph, self.support, self.analyzer, self.options).lower(&ast.rhs)?;

        let (target, created) = match symbols.resolve(&ast.target) {
            Ok(id) => (id, false),
            Err(_) => {
                let dtype = match ast.mode {
                    UpdateMode::Differential if !rhs.ty.dtype.is_float() => self.analyzer.float_dtype(),
                    _ => rhs.ty.dtype,
                };
                let id = symbols.bind(&ast.target, dtype, rhs.ty.shape.clone(), VarRole::StateVar)?;
                (id, true)
            }
        };

        let variable = symbols.variable(target);
        let (dtype, shape) = (variable.dtype, variable.shape.clone());
        if variable.role == VarRole::Raw {
            return Err(CompileError::value(format!(
                "raw variable `{}` cannot be the target of an equation",
                ast.target
            )));
        }
        if ast.mode == UpdateMode::Differential && !dtype.is_float() {
            return Err(CompileError::type_error(format!(
                "differential equation target `{}` must be a float, found {}",
                ast.target, dtype
            )));
        }
        self.analyzer.check_update(&shape, &rhs.ty.shape)?;

        let mut builder = GraphBuilder::new(symbols, graph, self.support, self.analyzer, self.options);
        let rhs = if rhs.ty.dtype == dtype {
            rhs
        } else if rhs.ty.weak || created {
            builder.coerce(rhs, dtype)?
        } else {
            return Err(CompileError::TypeConflict {
                name: ast.target.clone(),
                existing: dtype.to_string(),
                requested: rhs.ty.dtype.to_string(),
            });
        };

        let ty = ValueType::new(dtype, shape, false);
        let node = match dt {
            None => builder.update(Operator::Assign, vec![Operand::Var(target), rhs.operand], ty)?,
            Some(dt) => builder.update(
                Operator::Integrate,
                vec![Operand::Var(target), rhs.operand, Operand::Var(dt)],
                ty,
            )?,
        };

        debug!("compiled `{}` into {}", source.trim(), graph.node(node).name);
        Ok(Equation {
            source: source.to_string(),
            target,
            mode: ast.mode,
            rhs: rhs.operand,
            node,
        })
    }

    fn step_variable(&self, symbols: &SymbolTable) -> CompileResult<VarId> {
        let id = symbols.resolve(DT).map_err(|_| {
            CompileError::value(format!(
                "differential equations need a `{}` variable in the symbol table",
                DT
            ))
        })?;
        let variable = symbols.variable(id);
        if variable.shape != Shape::scalar() {
            return Err(CompileError::shape_mismatch("()", variable.shape.to_string()));
        }
        if !variable.dtype.is_float() {
            return Err(CompileError::type_error(format!(
                "`{}` must be a float, found {}",
                DT, variable.dtype
            )));
        }
        Ok(id)
    }
}
