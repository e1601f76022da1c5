//! Networks of equations
//!
//! A [`Network`] owns a symbol table, the operation graph of every equation
//! compiled so far and the configuration they were compiled with. It hands
//! out a [`Simulation`] that advances all equations together, one step at
//! a time.

use log::{debug, info, warn};
use serde::Serialize;

use crate::analyzer::Analyzer;
use crate::array::{self, ArrayImpl, ArrayProgram};
use crate::ast::UpdateMode;
use crate::builder::{BuildOptions, GraphBuilder};
use crate::config::{BackendKind, CompilerConfig};
use crate::equation::{Equation, EquationCompiler, DT};
use crate::error::{CompileError, CompileResult};
use crate::fortran::{self, FortranImpl, FortranProcedure};
use crate::graph::Graph;
use crate::native::{BuildSession, NativeSimulation};
use crate::ops::{OperatorSupport, OperatorTable};
use crate::parser::Parser;
use crate::scheduler::schedule;
use crate::symbols::{SymbolTable, VarId};
use crate::tensor::Tensor;
use crate::types::{DType, Shape, VarRole};

/// Operator table of the configured backend
enum BackendTable {
    Array(OperatorTable<ArrayImpl>),
    Fortran(OperatorTable<FortranImpl>),
}

impl BackendTable {
    fn new(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Array => BackendTable::Array(array::default_table()),
            BackendKind::Fortran => BackendTable::Fortran(fortran::default_table()),
        }
    }

    fn support(&self) -> &dyn OperatorSupport {
        match self {
            BackendTable::Array(table) => table,
            BackendTable::Fortran(table) => table,
        }
    }
}

pub struct Network {
    config: CompilerConfig,
    analyzer: Analyzer,
    table: BackendTable,
    symbols: SymbolTable,
    graph: Graph,
    equations: Vec<Equation>,
}

impl Network {
    pub fn new(config: CompilerConfig) -> CompileResult<Self> {
        config.validate()?;
        debug!("new network for the {} backend", config.backend.name());
        Ok(Self {
            analyzer: Analyzer::new(config.permissive_broadcast, config.float_dtype),
            table: BackendTable::new(config.backend),
            config,
            symbols: SymbolTable::new(),
            graph: Graph::new(),
            equations: Vec::new(),
        })
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn equations(&self) -> &[Equation] {
        &self.equations
    }

    /// Bind `name` to an initial value
    pub fn define(&mut self, name: &str, value: Tensor, role: VarRole) -> CompileResult<VarId> {
        self.symbols.define(name, value, role)
    }

    /// Bind `name` to a zero-filled variable
    pub fn bind(&mut self, name: &str, dtype: DType, shape: Shape, role: VarRole) -> CompileResult<VarId> {
        self.symbols.bind(name, dtype, shape, role)
    }

    pub fn value(&self, name: &str) -> CompileResult<&Tensor> {
        self.symbols.value(name)
    }

    /// Overwrite the current value of a variable
    pub fn set(&mut self, name: &str, value: &Tensor) -> CompileResult<()> {
        let id = self.symbols.resolve(name)?;
        self.symbols.write(id, value)
    }

    fn build_options(&self) -> BuildOptions {
        BuildOptions {
            fold_constants: self.config.fold_constants,
            deduplicate: self.config.deduplicate,
        }
    }

    /// Compile one equation into the network.
    ///
    /// On failure the network is left exactly as it was.
    pub fn compile_equation(&mut self, source: &str) -> CompileResult<&Equation> {
        let options = self.build_options();
        let compiler = EquationCompiler::new(self.table.support(), &self.analyzer, options);
        match compiler.compile(source, &mut self.symbols, &mut self.graph) {
            Ok(equation) => {
                self.equations.push(equation);
                Ok(&self.equations[self.equations.len() - 1])
            }
            Err(err) => {
                warn!("`{}` failed to compile: {}", source.trim(), err);
                Err(err)
            }
        }
    }

    /// Compile several equations, stopping at the first failure
    pub fn compile_equations<'s>(&mut self, sources: impl IntoIterator<Item = &'s str>) -> CompileResult<usize> {
        let mut count = 0;
        for source in sources {
            self.compile_equation(source)?;
            count += 1;
        }
        Ok(count)
    }

    /// Evaluate a free expression against the current values.
    ///
    /// The expression is built into a scratch graph and run on the array
    /// backend; the network itself is not modified.
    pub fn evaluate(&self, source: &str) -> CompileResult<Tensor> {
        let expr = Parser::new(source)
            .with_known_identifiers(self.symbols.known_identifiers())
            .parse_expression()?;

        let table = array::default_table();
        let mut scratch = Graph::new();
        let result =
            GraphBuilder::new(&self.symbols, &mut scratch, &table, &self.analyzer, self.build_options()).lower(&expr)?;
        let program = array::compile_graph(&self.symbols, &scratch, self.config.parallel_layers)?;
        program.execute(&self.symbols)?.value(&result.operand, &self.symbols)
    }

    /// Generate the Fortran routine of the compiled equations
    pub fn emit_fortran(&self) -> CompileResult<FortranProcedure> {
        fortran::compile_graph(&self.symbols, &self.graph, &self.config.fortran)
    }

    /// Compile the network for its backend
    pub fn compile(&mut self) -> CompileResult<Simulation<'_>> {
        let runner = match self.config.backend {
            BackendKind::Array => {
                Runner::Array(array::compile_graph(&self.symbols, &self.graph, self.config.parallel_layers)?)
            }
            BackendKind::Fortran => {
                let procedure = self.emit_fortran()?;
                let mut session = BuildSession::new(&self.config.fortran)?;
                let rhs = session.build(&procedure)?;
                Runner::Native {
                    simulation: NativeSimulation::new(procedure, rhs),
                    _session: session,
                }
            }
        };
        info!(
            "compiled {} equation(s) into {} node(s) for the {} backend",
            self.equations.len(),
            self.graph.len(),
            self.config.backend.name()
        );
        Ok(Simulation {
            network: self,
            runner,
            time: 0.0,
            steps: 0,
        })
    }

    /// Serializable description of the network
    pub fn summary(&self) -> NetworkSummary {
        let variables: Vec<VariableSummary> = self
            .symbols
            .iter()
            .map(|(_, v)| VariableSummary {
                name: v.name.clone(),
                dtype: v.dtype,
                shape: v.shape.to_string(),
                role: v.role,
            })
            .collect();
        let equations: Vec<EquationSummary> = self
            .equations
            .iter()
            .map(|eq| EquationSummary {
                source: eq.source.trim().to_string(),
                target: self.symbols.variable(eq.target).name.clone(),
                mode: eq.mode,
                node: self.graph.node(eq.node).name.clone(),
            })
            .collect();
        let layers: Vec<Vec<String>> = schedule(&self.graph)
            .iter()
            .map(|layer| {
                layer
                    .nodes
                    .iter()
                    .map(|&id| self.graph.node(id).name.clone())
                    .collect()
            })
            .collect();
        NetworkSummary {
            backend: self.config.backend,
            variables,
            equations,
            node_count: self.graph.len(),
            layers,
        }
    }
}

impl Default for Network {
    fn default() -> Self {
        Self {
            config: CompilerConfig::default(),
            analyzer: Analyzer::default(),
            table: BackendTable::new(BackendKind::Array),
            symbols: SymbolTable::new(),
            graph: Graph::new(),
            equations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VariableSummary {
    pub name: String,
    pub dtype: DType,
    pub shape: String,
    pub role: VarRole,
}

#[derive(Debug, Clone, Serialize)]
pub struct EquationSummary {
    pub source: String,
    pub target: String,
    pub mode: UpdateMode,
    pub node: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkSummary {
    pub backend: BackendKind,
    pub variables: Vec<VariableSummary>,
    pub equations: Vec<EquationSummary>,
    pub node_count: usize,
    /// Node names per layer
    pub layers: Vec<Vec<String>>,
}

impl NetworkSummary {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

enum Runner {
    Array(ArrayProgram),
    Native {
        simulation: NativeSimulation,
        // owns the directory the library was built in
        _session: BuildSession,
    },
}

/// A compiled network advancing all of its equations together
pub struct Simulation<'n> {
    network: &'n mut Network,
    runner: Runner,
    time: f64,
    steps: usize,
}

impl<'n> Simulation<'n> {
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn value(&self, name: &str) -> CompileResult<&Tensor> {
        self.network.value(name)
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.network.symbols
    }

    /// Evaluate every equation once and apply all updates.
    ///
    /// Right-hand sides see the values from before the step; updates land
    /// in equation order.
    pub fn step(&mut self, dt: f64) -> CompileResult<()> {
        if !dt.is_finite() {
            return Err(CompileError::value(format!("step size must be finite, got {}", dt)));
        }
        let symbols = &mut self.network.symbols;
        if let Ok(id) = symbols.resolve(DT) {
            let dtype = symbols.variable(id).dtype;
            symbols.write(id, &Tensor::scalar(dt, dtype))?;
        }

        match &mut self.runner {
            Runner::Array(program) => program.run(symbols)?,
            Runner::Native { simulation, .. } => simulation.step(symbols, dt)?,
        }
        self.time += dt;
        self.steps += 1;
        Ok(())
    }

    pub fn run(&mut self, steps: usize, dt: f64) -> CompileResult<()> {
        for _ in 0..steps {
            self.step(dt)?;
        }
        debug!("ran {} step(s), t = {}", steps, self.time);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn network() -> Network {
        let mut network = Network::default();
        network
            .define(DT, Tensor::scalar(0.1, DType::Float64), VarRole::Constant)
            .unwrap();
        network
            .define(
                "A",
                Tensor::vector(&[-3.0, -2.0, -1.0, 0.0, 1.0, 2.0, 3.0, 4.0]),
                VarRole::Constant,
            )
            .unwrap();
        network
    }

    #[test]
    fn test_literal_expressions() {
        let network = Network::default();
        assert_eq!(network.evaluate("4 * 5^2").unwrap().item(), Some(100.0));
        assert_eq!(network.evaluate("(4 + 5) * 2").unwrap().item(), Some(18.0));
        let cmp = network.evaluate("5 >= 6").unwrap();
        assert_eq!(cmp.dtype(), DType::Bool);
        assert_eq!(cmp.item(), Some(0.0));
    }

    #[test]
    fn test_indexing() {
        let network = network();
        assert_eq!(network.evaluate("A[0:5]").unwrap().data(), &[-3.0, -2.0, -1.0, 0.0, 1.0]);
        assert_eq!(network.evaluate("A[-2]").unwrap().item(), Some(3.0));
        assert_eq!(network.evaluate("A[A > 0]").unwrap().data(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(network.evaluate("A[2 + 1]").unwrap().item(), Some(0.0));
    }

    #[test]
    fn test_mask_against_integer_literal() {
        let network = network();
        let never = network.evaluate("(A > 0) == 2").unwrap();
        assert_eq!(never.dtype(), DType::Bool);
        assert_eq!(never.data(), &[0.0; 8]);
        let same = network.evaluate("(A > 0) == 1").unwrap();
        assert_eq!(same.data(), &[0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);

        let shifted = network.evaluate("(A > 0) + 2").unwrap();
        assert_eq!(shifted.dtype(), DType::Int64);
        assert_eq!(shifted.data(), &[2.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_slice_step_beyond_axis() {
        let network = network();
        assert_eq!(network.evaluate("A[1::9223372036854775807]").unwrap().data(), &[-2.0]);
        assert_eq!(network.evaluate("A[::-9223372036854775807]").unwrap().data(), &[4.0]);
    }

    #[test]
    fn test_evaluate_leaves_no_state() {
        let network = network();
        network.evaluate("sum(A) * 2.").unwrap();
        assert!(network.graph().is_empty());
        assert_eq!(network.symbols().len(), 2);
    }

    #[test]
    fn test_assignment_step() {
        let mut network = network();
        network.compile_equation("a = 5. + 2.").unwrap();
        let mut simulation = network.compile().unwrap();
        simulation.step(0.1).unwrap();
        assert_eq!(simulation.value("a").unwrap().item(), Some(7.0));
    }

    #[test]
    fn test_differential_step() {
        let mut network = network();
        let equation = network.compile_equation("d/dt * a = 5. + 2.").unwrap();
        assert_eq!(equation.mode, UpdateMode::Differential);
        let mut simulation = network.compile().unwrap();
        simulation.step(0.1).unwrap();
        let a = simulation.value("a").unwrap().item().unwrap();
        assert!((a - 0.7).abs() < 1e-12, "a = {}", a);
        assert_eq!(simulation.steps(), 1);
    }

    #[test]
    fn test_zero_step_is_idempotent() {
        let mut network = network();
        network
            .define("v", Tensor::vector(&[1.0, -1.0]), VarRole::StateVar)
            .unwrap();
        network.compile_equation("d/dt * v = -v * 3. + sin(v)").unwrap();
        let mut simulation = network.compile().unwrap();
        simulation.run(5, 0.0).unwrap();
        assert_eq!(simulation.value("v").unwrap().data(), &[1.0, -1.0]);
    }

    #[test]
    fn test_updates_read_pre_step_values() {
        let mut network = network();
        network.define("a", Tensor::scalar(1.0, DType::Float64), VarRole::StateVar).unwrap();
        network.define("b", Tensor::scalar(2.0, DType::Float64), VarRole::StateVar).unwrap();
        network.compile_equations(["a = b", "b = a"]).unwrap();
        let mut simulation = network.compile().unwrap();
        simulation.step(0.1).unwrap();
        assert_eq!(simulation.value("a").unwrap().item(), Some(2.0));
        assert_eq!(simulation.value("b").unwrap().item(), Some(1.0));
    }

    fn run_model(parallel: bool) -> Tensor {
        let config = CompilerConfig {
            parallel_layers: parallel,
            ..CompilerConfig::default()
        };
        let mut network = Network::new(config).unwrap();
        network
            .define(DT, Tensor::scalar(0.01, DType::Float64), VarRole::Constant)
            .unwrap();
        network
            .define("r", Tensor::vector(&[0.1, 0.2, 0.3, 0.4]), VarRole::StateVar)
            .unwrap();
        network
            .define("v", Tensor::vector(&[-1.0, 0.0, 1.0, 2.0]), VarRole::StateVar)
            .unwrap();
        network
            .compile_equations([
                "d/dt * r = 2. * r * v + 0.1 / 3.14159",
                "d/dt * v = v^2 + 5. - (3.14159 * r)^2 + tanh(v)",
            ])
            .unwrap();
        let mut simulation = network.compile().unwrap();
        simulation.run(20, 0.01).unwrap();
        simulation.value("v").unwrap().clone()
    }

    #[test]
    fn test_deterministic_evaluation() {
        let sequential = run_model(false);
        assert_eq!(sequential, run_model(false));
        assert_eq!(sequential, run_model(true));
    }

    #[test]
    fn test_rollback_after_failure() {
        let mut network = network();
        let symbols_before = network.symbols().len();

        let err = network.compile_equation("b = A * c").unwrap_err();
        assert!(matches!(err, CompileError::UndefinedVariable { ref name } if name == "c"));
        let err = network.compile_equation("b = A[0:5:2:1]").unwrap_err();
        assert!(matches!(err, CompileError::Syntax { .. }));
        let err = network.compile_equation("b = sum(A) + A[9]").unwrap_err();
        assert!(matches!(err, CompileError::IndexError { .. }));

        assert_eq!(network.symbols().len(), symbols_before);
        assert!(network.graph().is_empty());
        assert!(network.equations().is_empty());

        network.compile_equation("b = sum(A)").unwrap();
        assert_eq!(network.equations().len(), 1);
    }

    #[test]
    fn test_error_cases() {
        let mut network = network();
        network
            .define("P", Tensor::zeros(DType::Float64, &[3, 3]), VarRole::Constant)
            .unwrap();
        network
            .define("Q", Tensor::zeros(DType::Float64, &[4, 4]), VarRole::Constant)
            .unwrap();

        assert!(matches!(network.evaluate("A $ A"), Err(CompileError::Syntax { .. })));
        assert!(matches!(network.evaluate("b"), Err(CompileError::UndefinedVariable { .. })));
        assert!(matches!(network.evaluate("foo(A)"), Err(CompileError::UnknownFunction { .. })));
        assert!(matches!(network.evaluate("P + Q"), Err(CompileError::ShapeMismatch { .. })));
        assert!(matches!(network.evaluate("A[2.]"), Err(CompileError::TypeError { .. })));
    }

    #[test]
    fn test_permissive_broadcast_defers_to_runtime() {
        let config = CompilerConfig {
            permissive_broadcast: true,
            ..CompilerConfig::default()
        };
        let mut network = Network::new(config).unwrap();
        network
            .define("P", Tensor::zeros(DType::Float64, &[3, 3]), VarRole::Constant)
            .unwrap();
        network
            .define("Q", Tensor::zeros(DType::Float64, &[4, 4]), VarRole::Constant)
            .unwrap();
        assert!(matches!(network.evaluate("P + Q"), Err(CompileError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_independent_networks_on_threads() {
        let results: Vec<Tensor> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    scope.spawn(move || {
                        let mut network = network();
                        network
                            .define("x", Tensor::scalar(i as f64, DType::Float64), VarRole::StateVar)
                            .unwrap();
                        network.compile_equation("d/dt * x = -x + 1.").unwrap();
                        let mut simulation = network.compile().unwrap();
                        simulation.run(10, 0.1).unwrap();
                        simulation.value("x").unwrap().clone()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for (i, x) in results.iter().enumerate() {
            let expected = 1.0 + (i as f64 - 1.0) * 0.9f64.powi(10);
            assert!((x.item().unwrap() - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_fortran_backend_checks_operators() {
        let config = CompilerConfig {
            backend: BackendKind::Fortran,
            ..CompilerConfig::default()
        };
        let mut network = Network::new(config).unwrap();
        network
            .define("A", Tensor::vector(&[1.0, -1.0]), VarRole::Constant)
            .unwrap();
        let err = network.compile_equation("b = A[A > 0.]").unwrap_err();
        assert!(matches!(err, CompileError::NotImplemented { ref backend, .. } if backend == "fortran"));
        assert_eq!(network.symbols().len(), 1);

        network.compile_equation("b = A * 2.").unwrap();
        let procedure = network.emit_fortran().unwrap();
        assert!(procedure.source.contains("      b = mul_0\n"));
    }

    #[test]
    fn test_summary() {
        let mut network = network();
        network.compile_equation("d/dt * x = -A[0]").unwrap();
        let summary = network.summary();
        assert_eq!(summary.node_count, 3);
        assert_eq!(summary.layers, vec![vec!["index_0"], vec!["neg_1"], vec!["integrate_2"]]);
        assert_eq!(summary.equations[0].target, "x");
        let json = summary.to_json().unwrap();
        assert!(json.contains("\"backend\": \"array\""));
        assert!(json.contains("\"role\": \"state_var\""));
    }
}
