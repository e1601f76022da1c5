//! Native toolchain for generated Fortran
//!
//! A [`BuildSession`] writes each generated routine into its build
//! directory, runs the Fortran compiler on it and loads the resulting
//! shared library. Compilation blocks until the compiler exits.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use libloading::Library;
use log::{debug, info};
use tempfile::TempDir;

use crate::config::FortranOptions;
use crate::error::{CompileError, CompileResult};
use crate::fortran::FortranProcedure;
use crate::symbols::SymbolTable;

/// `subroutine func(ndim,t,y,args,y_delta)`; Fortran passes everything by reference
type RhsFn = unsafe extern "C" fn(*const i32, *const f64, *const f64, *mut f64, *mut f64);

enum BuildDir {
    Temporary(TempDir),
    Fixed(PathBuf),
}

impl BuildDir {
    fn path(&self) -> &Path {
        match self {
            BuildDir::Temporary(dir) => dir.path(),
            BuildDir::Fixed(path) => path,
        }
    }
}

/// Compiles generated routines into uniquely named libraries
pub struct BuildSession {
    options: FortranOptions,
    dir: BuildDir,
    counter: usize,
}

impl BuildSession {
    pub fn new(options: &FortranOptions) -> CompileResult<Self> {
        let dir = match &options.build_dir {
            Some(path) => {
                fs::create_dir_all(path).map_err(|e| {
                    CompileError::value(format!("cannot create build directory {}: {}", path.display(), e))
                })?;
                BuildDir::Fixed(path.clone())
            }
            None => BuildDir::Temporary(
                tempfile::Builder::new()
                    .prefix("neural_eqc")
                    .tempdir()
                    .map_err(|e| CompileError::value(format!("cannot create build directory: {}", e)))?,
            ),
        };
        debug!("build session in {}", dir.path().display());
        Ok(Self {
            options: options.clone(),
            dir,
            counter: 0,
        })
    }

    pub fn build_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Name for the next module; unique within this session
    pub fn next_module(&mut self) -> String {
        self.counter += 1;
        format!("rhs_func_{}", self.counter)
    }

    /// Compile and load `procedure`
    pub fn build(&mut self, procedure: &FortranProcedure) -> CompileResult<NativeRhs> {
        if procedure.auto_compat {
            return Err(CompileError::value(
                "routines generated in AUTO compatibility mode cannot be loaded directly",
            ));
        }

        let module = self.next_module();
        let source_path = self.dir.path().join(format!("{}.f", module));
        let library_path = self.dir.path().join(format!(
            "{}{}.{}",
            std::env::consts::DLL_PREFIX,
            module,
            std::env::consts::DLL_EXTENSION
        ));
        let failed = |diagnostic: String| CompileError::build(procedure.source.clone(), diagnostic);

        fs::write(&source_path, &procedure.source)
            .map_err(|e| failed(format!("cannot write {}: {}", source_path.display(), e)))?;

        info!("compiling {} with {}", source_path.display(), self.options.compiler);
        let output = Command::new(&self.options.compiler)
            .args(&self.options.flags)
            .arg("-o")
            .arg(&library_path)
            .arg(&source_path)
            .output()
            .map_err(|e| failed(format!("cannot run `{}`: {}", self.options.compiler, e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(format!(
                "`{}` exited with {}: {}",
                self.options.compiler,
                output.status,
                stderr.trim()
            )));
        }

        let library = unsafe { Library::new(&library_path) }
            .map_err(|e| failed(format!("cannot load {}: {}", library_path.display(), e)))?;
        let function: RhsFn = unsafe {
            *library
                .get::<RhsFn>(self.options.symbol.as_bytes())
                .map_err(|e| failed(format!("symbol `{}` not found: {}", self.options.symbol, e)))?
        };
        debug!("loaded {} from {}", self.options.symbol, library_path.display());

        Ok(NativeRhs {
            function,
            ndim: procedure.ndim(),
            nargs: procedure.nargs(),
            path: library_path,
            _library: library,
        })
    }
}

/// A loaded right-hand-side routine
pub struct NativeRhs {
    function: RhsFn,
    ndim: usize,
    nargs: usize,
    path: PathBuf,
    // keeps `function` valid
    _library: Library,
}

impl NativeRhs {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Derivatives of the state vector `y` at time `t`.
    ///
    /// `args` may be overwritten by assignments inside the routine.
    pub fn evaluate(&self, t: f64, y: &[f64], args: &mut [f64]) -> CompileResult<Vec<f64>> {
        if y.len() != self.ndim {
            return Err(CompileError::shape_mismatch(
                format!("{} state values", self.ndim),
                format!("{}", y.len()),
            ));
        }
        if args.len() != self.nargs {
            return Err(CompileError::shape_mismatch(
                format!("{} parameter values", self.nargs),
                format!("{}", args.len()),
            ));
        }
        let ndim = i32::try_from(self.ndim)
            .map_err(|_| CompileError::value(format!("state vector of {} values is too large", self.ndim)))?;

        let mut y_delta = vec![0.0; self.ndim];
        // SAFETY: the buffers match the sizes the routine was generated for
        unsafe {
            (self.function)(&ndim, &t, y.as_ptr(), args.as_mut_ptr(), y_delta.as_mut_ptr());
        }
        Ok(y_delta)
    }
}

/// Forward-Euler driver over a native routine
pub struct NativeSimulation {
    procedure: FortranProcedure,
    rhs: NativeRhs,
    time: f64,
}

impl NativeSimulation {
    pub fn new(procedure: FortranProcedure, rhs: NativeRhs) -> Self {
        Self {
            procedure,
            rhs,
            time: 0.0,
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn procedure(&self) -> &FortranProcedure {
        &self.procedure
    }

    /// Advance the states by one step and write every result back.
    ///
    /// Nothing is written if the routine flagged an out-of-range index.
    pub fn step(&mut self, symbols: &mut SymbolTable, dt: f64) -> CompileResult<()> {
        let y = self.procedure.pack_states(symbols);
        let mut args = self.procedure.pack_args(symbols);
        let y_delta = self.rhs.evaluate(self.time, &y, &mut args)?;
        self.procedure.check_fault(&args)?;

        let next: Vec<f64> = y.iter().zip(&y_delta).map(|(x, d)| x + d * dt).collect();
        self.procedure.unpack_states(symbols, &next)?;
        self.procedure.unpack_args(symbols, &args)?;
        self.time += dt;
        Ok(())
    }

    pub fn run(&mut self, symbols: &mut SymbolTable, steps: usize, dt: f64) -> CompileResult<()> {
        for _ in 0..steps {
            self.step(symbols, dt)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::builder::BuildOptions;
    use crate::equation::{EquationCompiler, DT};
    use crate::fortran::{compile_graph, default_table};
    use crate::graph::Graph;
    use crate::tensor::Tensor;
    use crate::types::{DType, VarRole};
    use pretty_assertions::assert_eq;

    fn procedure(symbols: &mut SymbolTable, equations: &[&str], options: &FortranOptions) -> FortranProcedure {
        let table = default_table();
        let analyzer = Analyzer::default();
        let compiler = EquationCompiler::new(&table, &analyzer, BuildOptions::default());
        let mut graph = Graph::new();
        for equation in equations {
            compiler.compile(equation, symbols, &mut graph).unwrap();
        }
        compile_graph(symbols, &graph, options).unwrap()
    }

    fn symbols() -> SymbolTable {
        let mut symbols = SymbolTable::new();
        symbols
            .define(DT, Tensor::scalar(0.1, DType::Float64), VarRole::Constant)
            .unwrap();
        symbols
            .define("v", Tensor::vector(&[1.0, 2.0]), VarRole::StateVar)
            .unwrap();
        symbols
    }

    fn compiler_available(compiler: &str) -> bool {
        Command::new(compiler).arg("--version").output().is_ok()
    }

    #[test]
    fn test_module_names_are_per_session() {
        let options = FortranOptions::default();
        let mut first = BuildSession::new(&options).unwrap();
        let mut second = BuildSession::new(&options).unwrap();
        assert_eq!(first.next_module(), "rhs_func_1");
        assert_eq!(first.next_module(), "rhs_func_2");
        assert_eq!(second.next_module(), "rhs_func_1");
        assert_ne!(first.build_dir(), second.build_dir());
    }

    #[test]
    fn test_missing_compiler() {
        let dir = tempfile::tempdir().unwrap();
        let options = FortranOptions {
            compiler: "no-such-fortran-compiler".to_string(),
            build_dir: Some(dir.path().to_path_buf()),
            ..FortranOptions::default()
        };
        let mut symbols = symbols();
        let procedure = procedure(&mut symbols, &["d/dt * v = -v"], &options);

        let err = BuildSession::new(&options)
            .unwrap()
            .build(&procedure)
            .err()
            .unwrap();
        match err {
            CompileError::Build { generated, diagnostic } => {
                assert_eq!(generated, procedure.source);
                assert!(diagnostic.contains("no-such-fortran-compiler"));
            }
            other => panic!("expected a build error, got {:?}", other),
        }
        assert!(dir.path().join("rhs_func_1.f").exists());
    }

    #[test]
    fn test_auto_compat_routines_are_not_loaded() {
        let options = FortranOptions {
            auto_compat: true,
            ..FortranOptions::default()
        };
        let mut symbols = symbols();
        let procedure = procedure(&mut symbols, &["d/dt * v = -v"], &options);
        let err = BuildSession::new(&options)
            .unwrap()
            .build(&procedure)
            .err()
            .unwrap();
        assert!(matches!(err, CompileError::Value { .. }));
    }

    #[test]
    fn test_native_euler_steps() {
        let options = FortranOptions::default();
        if !compiler_available(&options.compiler) {
            eprintln!("{} not found, skipping test", options.compiler);
            return;
        }
        let mut symbols = symbols();
        symbols
            .define("k", Tensor::scalar(0.0, DType::Float64), VarRole::Constant)
            .unwrap();
        let procedure = procedure(&mut symbols, &["d/dt * v = -v", "k = k + 1."], &options);
        let rhs = BuildSession::new(&options).unwrap().build(&procedure).unwrap();

        let mut args = procedure.pack_args(&symbols);
        let delta = rhs.evaluate(0.0, &[1.0, 2.0], &mut args).unwrap();
        assert_eq!(delta, vec![-1.0, -2.0]);
        assert!(rhs.evaluate(0.0, &[1.0], &mut args).is_err());

        let mut simulation = NativeSimulation::new(procedure, rhs);
        simulation.run(&mut symbols, 2, 0.5).unwrap();
        assert_eq!(symbols.value("v").unwrap().data(), &[0.25, 0.5]);
        assert_eq!(symbols.value("k").unwrap().item(), Some(2.0));
        assert_eq!(simulation.time(), 1.0);
    }

    #[test]
    fn test_native_index_bounds_match_array_backend() {
        let options = FortranOptions::default();
        if !compiler_available(&options.compiler) {
            eprintln!("{} not found, skipping test", options.compiler);
            return;
        }
        let mut symbols = symbols();
        symbols
            .define("A", Tensor::vector(&[1.0, 2.0, 3.0, 4.0, 5.0]), VarRole::Constant)
            .unwrap();
        symbols
            .define("n", Tensor::scalar(-2.0, DType::Int64), VarRole::Constant)
            .unwrap();
        let table = default_table();
        let analyzer = Analyzer::default();
        let mut graph = Graph::new();
        EquationCompiler::new(&table, &analyzer, BuildOptions::default())
            .compile("b = A[n]", &mut symbols, &mut graph)
            .unwrap();
        let procedure = compile_graph(&symbols, &graph, &options).unwrap();
        let rhs = BuildSession::new(&options).unwrap().build(&procedure).unwrap();
        let program = crate::array::compile_graph(&symbols, &graph, false).unwrap();
        let mut simulation = NativeSimulation::new(procedure, rhs);

        let mut expected = symbols.clone();
        program.run(&mut expected).unwrap();
        simulation.step(&mut symbols, 0.1).unwrap();
        assert_eq!(symbols.value("b").unwrap(), expected.value("b").unwrap());
        assert_eq!(symbols.value("b").unwrap().item(), Some(4.0));

        let n = symbols.resolve("n").unwrap();
        symbols.write(n, &Tensor::scalar(7.0, DType::Int64)).unwrap();
        assert!(matches!(program.execute(&symbols), Err(CompileError::IndexError { .. })));
        let err = simulation.step(&mut symbols, 0.1).unwrap_err();
        assert!(matches!(err, CompileError::IndexError { .. }));
        assert_eq!(symbols.value("b").unwrap().item(), Some(4.0));
    }
}
