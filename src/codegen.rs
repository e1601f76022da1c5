//! Backend code generation
//!
//! A [`CodeGenerator`] turns a scheduled operation graph into something
//! that runs: a kernel program for the array backend or source text for
//! the Fortran backend. The [`generate`] driver declares every variable,
//! emits the nodes layer by layer and finally closes the procedure.

use log::debug;

use crate::error::{CompileError, CompileResult};
use crate::graph::{Graph, NodeId, OpNode};
use crate::ops::OperatorSupport;
use crate::scheduler::{schedule, Layer};
use crate::symbols::{SymbolTable, VarId, Variable};

/// Everything a generator may consult while emitting
pub struct EmitContext<'a> {
    pub symbols: &'a SymbolTable,
    pub graph: &'a Graph,
    pub layers: &'a [Layer],
}

/// A code-generation backend
pub trait CodeGenerator: OperatorSupport {
    type Output;

    fn declare_variable(&mut self, ctx: &EmitContext<'_>, id: VarId, variable: &Variable) -> CompileResult<()>;

    /// Called before the nodes of each layer are emitted
    fn begin_layer(&mut self, _ctx: &EmitContext<'_>, _index: usize) -> CompileResult<()> {
        Ok(())
    }

    fn emit_operation(&mut self, ctx: &EmitContext<'_>, id: NodeId, node: &OpNode) -> CompileResult<()>;

    fn finalize_procedure(self, ctx: &EmitContext<'_>) -> CompileResult<Self::Output>
    where
        Self: Sized;
}

/// Drive `generator` over the scheduled graph
pub fn generate<G: CodeGenerator>(mut generator: G, symbols: &SymbolTable, graph: &Graph) -> CompileResult<G::Output> {
    let layers = schedule(graph);
    let ctx = EmitContext {
        symbols,
        graph,
        layers: &layers,
    };
    debug!(
        "generating {} backend code for {} variable(s), {} node(s)",
        generator.backend_name(),
        symbols.len(),
        graph.len()
    );

    for (id, variable) in symbols.iter() {
        generator.declare_variable(&ctx, id, variable)?;
    }

    for (k, layer) in layers.iter().enumerate() {
        generator.begin_layer(&ctx, k)?;
        for &id in &layer.nodes {
            let node = graph.node(id);
            let code = node.op.code();
            if !generator.supports(code) {
                return Err(CompileError::not_implemented(code.to_string(), generator.backend_name()));
            }
            generator.emit_operation(&ctx, id, node)?;
        }
    }

    generator.finalize_procedure(&ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Operand;
    use crate::ops::{OpCode, Operator};
    use crate::tensor::Tensor;
    use crate::types::{DType, Shape, VarRole};
    use pretty_assertions::assert_eq;

    /// Records the driver's calls
    struct Recorder {
        supported: Vec<OpCode>,
        events: Vec<String>,
    }

    impl OperatorSupport for Recorder {
        fn backend_name(&self) -> &'static str {
            "recorder"
        }

        fn supports(&self, code: OpCode) -> bool {
            self.supported.contains(&code)
        }
    }

    impl CodeGenerator for Recorder {
        type Output = Vec<String>;

        fn declare_variable(&mut self, _ctx: &EmitContext<'_>, _id: VarId, variable: &Variable) -> CompileResult<()> {
            self.events.push(format!("declare {}", variable.name));
            Ok(())
        }

        fn begin_layer(&mut self, _ctx: &EmitContext<'_>, index: usize) -> CompileResult<()> {
            self.events.push(format!("layer {}", index));
            Ok(())
        }

        fn emit_operation(&mut self, _ctx: &EmitContext<'_>, _id: NodeId, node: &OpNode) -> CompileResult<()> {
            self.events.push(format!("emit {}", node.name));
            Ok(())
        }

        fn finalize_procedure(mut self, _ctx: &EmitContext<'_>) -> CompileResult<Self::Output> {
            self.events.push("finalize".to_string());
            Ok(self.events)
        }
    }

    fn fixture() -> (SymbolTable, Graph) {
        let mut symbols = SymbolTable::new();
        let x = symbols
            .define("x", Tensor::scalar(1.0, DType::Float64), VarRole::StateVar)
            .unwrap();
        let mut graph = Graph::new();
        let neg = graph
            .push(Operator::Neg, vec![Operand::Var(x)], DType::Float64, Shape::scalar(), false)
            .unwrap();
        graph
            .push(
                Operator::Assign,
                vec![Operand::Var(x), Operand::Node(neg)],
                DType::Float64,
                Shape::scalar(),
                false,
            )
            .unwrap();
        (symbols, graph)
    }

    #[test]
    fn test_driver_order() {
        let (symbols, graph) = fixture();
        let recorder = Recorder {
            supported: vec![OpCode::Neg, OpCode::Assign],
            events: Vec::new(),
        };
        let events = generate(recorder, &symbols, &graph).unwrap();
        assert_eq!(
            events,
            vec![
                "declare x",
                "layer 0",
                "emit neg_0",
                "layer 1",
                "emit assign_1",
                "finalize"
            ]
        );
    }

    #[test]
    fn test_driver_rejects_unsupported_nodes() {
        let (symbols, graph) = fixture();
        let recorder = Recorder {
            supported: vec![OpCode::Assign],
            events: Vec::new(),
        };
        let err = generate(recorder, &symbols, &graph).unwrap_err();
        assert!(matches!(err, CompileError::NotImplemented { ref operator, .. } if operator == "neg"));
    }
}
