//! Equation Graph Compiler
//!
//! This library compiles neural-mass model equations written in a small
//! array expression language into layered operation graphs. A graph can be
//! evaluated directly on the array backend or turned into a Fortran routine
//! that is compiled into a native library.
//!
//! # Example
//!
//! ```rust
//! use neural_eqc::{Network, Tensor, DType, VarRole};
//!
//! let mut network = Network::default();
//! network.define("dt", Tensor::scalar(0.1, DType::Float64), VarRole::Constant).unwrap();
//! network.compile_equation("d/dt * a = 5. + 2.").unwrap();
//!
//! let mut simulation = network.compile().unwrap();
//! simulation.step(0.1).unwrap();
//! let a = simulation.value("a").unwrap().item().unwrap();
//! assert!((a - 0.7).abs() < 1e-12);
//! ```

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod types;
pub mod tensor;
pub mod symbols;
pub mod ops;
pub mod graph;
pub mod analyzer;
pub mod scalar;
pub mod builder;
pub mod scheduler;
pub mod codegen;
pub mod array;
pub mod linewrap;
pub mod fortran;
pub mod native;
pub mod equation;
pub mod config;
pub mod network;
pub mod error;

pub use ast::{EquationAst, Expr, UpdateMode};
pub use parser::Parser;
pub use types::{DType, Shape, VarRole};
pub use tensor::Tensor;
pub use symbols::{SymbolTable, VarId};
pub use graph::{Graph, NodeId, Operand};
pub use analyzer::Analyzer;
pub use scheduler::{schedule, Layer};
pub use codegen::CodeGenerator;
pub use fortran::FortranProcedure;
pub use native::{BuildSession, NativeRhs, NativeSimulation};
pub use equation::Equation;
pub use config::{BackendKind, CompilerConfig, FortranOptions};
pub use network::{Network, NetworkSummary, Simulation};
pub use error::{CompileError, CompileResult};

use builder::BuildOptions;
use equation::EquationCompiler;

/// Parse a free expression
pub fn parse(source: &str) -> CompileResult<Expr> {
    Parser::new(source).parse_expression()
}

/// Evaluate an expression that only uses literals
pub fn evaluate(source: &str) -> CompileResult<Tensor> {
    Network::default().evaluate(source)
}

/// Compile one equation against `symbols` into `graph` for the array backend.
///
/// A failed compilation leaves `symbols` and `graph` as they were.
pub fn compile_equation(source: &str, symbols: &mut SymbolTable, graph: &mut Graph) -> CompileResult<Equation> {
    let table = array::default_table();
    let analyzer = Analyzer::default();
    EquationCompiler::new(&table, &analyzer, BuildOptions::default()).compile(source, symbols, graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_failed_equation_leaves_graph_runnable() {
        let mut symbols = SymbolTable::new();
        symbols.define("A", Tensor::vector(&[1.0, 2.0, 3.0]), VarRole::Constant).unwrap();
        symbols.define("k", Tensor::scalar(0.0, DType::Int64), VarRole::StateVar).unwrap();
        let mut graph = Graph::new();
        let len = symbols.len();

        let err = compile_equation("x = A[k] + zz", &mut symbols, &mut graph).unwrap_err();
        assert!(matches!(err, CompileError::UndefinedVariable { .. }));
        assert_eq!(graph.len(), 0);
        assert_eq!(symbols.len(), len);

        compile_equation("k = k + 5", &mut symbols, &mut graph).unwrap();
        let program = array::compile_graph(&symbols, &graph, false).unwrap();
        program.run(&mut symbols).unwrap();
        program.run(&mut symbols).unwrap();
        let k = symbols.resolve("k").unwrap();
        assert_eq!(symbols.variable(k).value.item().unwrap(), 10.0);
    }
}
