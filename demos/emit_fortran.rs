//! Example: Fortran Code Generation
//!
//! Generates the right-hand-side routine of a small equation system, once
//! with the plain calling convention and once for AUTO-07p continuation.
//! If gfortran is installed the plain routine is also built and stepped.
//!
//! Run with: cargo run --example emit_fortran

use neural_eqc::fortran::auto_constants;
use neural_eqc::{BackendKind, CompilerConfig, DType, Network, Tensor, VarRole};

fn build_network(auto_compat: bool) -> Network {
    let mut config = CompilerConfig {
        backend: BackendKind::Fortran,
        ..CompilerConfig::default()
    };
    config.fortran.auto_compat = auto_compat;

    let mut network = Network::new(config).unwrap();
    network.define("dt", Tensor::scalar(1e-2, DType::Float64), VarRole::Constant).unwrap();
    network.define("k", Tensor::scalar(0.5, DType::Float64), VarRole::Constant).unwrap();
    network.define("W", Tensor::matrix(&[vec![0.0, 1.0], vec![-1.0, 0.0]]).unwrap(), VarRole::Raw).unwrap();
    network.define("x", Tensor::vector(&[1.0, 0.0]), VarRole::StateVar).unwrap();
    network.define("m", Tensor::vector(&[1.0, -1.0]), VarRole::StateVar).unwrap();

    network.compile_equation("d/dt * x = -k * x + tanh(W[:, 0] * x[1])").unwrap();
    network.compile_equation("m = x * 2. - 1.").unwrap();
    network
}

fn main() {
    println!("=== Fortran Code Generation Example ===\n");

    // Example 1: plain calling convention
    println!("Example 1: subroutine func(ndim,t,y,args,y_delta)\n");
    let mut network = build_network(false);
    let procedure = network.emit_fortran().unwrap();
    println!("{}", procedure.source);
    println!(
        "State vector: {} value(s), parameter vector: {} value(s)\n",
        procedure.ndim(),
        procedure.nargs()
    );

    // Example 2: AUTO-07p compatibility
    println!("\nExample 2: AUTO-07p routines\n");
    let auto = build_network(true).emit_fortran().unwrap();
    println!("{}", auto.source);
    println!("Constants file:\n");
    println!("{}", auto_constants(auto.ndim(), auto.nargs()));

    // Example 3: native build, when a compiler is around
    println!("\nExample 3: native build");
    match network.compile() {
        Ok(mut simulation) => {
            simulation.run(100, 1e-2).unwrap();
            println!("  x after {} steps: {:?}", simulation.steps(), simulation.value("x").unwrap().data());
            println!("  m after {} steps: {:?}", simulation.steps(), simulation.value("m").unwrap().data());
        }
        Err(e) => println!("  skipped: {}", e),
    }
}
