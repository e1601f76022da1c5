//! Example: Forward-Euler Simulation of a Neural Mass Model
//!
//! Compiles the firing-rate equations of a population of quadratic
//! integrate-and-fire neurons and integrates them on the array backend.
//!
//! Run with: cargo run --example euler_step

use neural_eqc::{CompilerConfig, DType, Network, Tensor, VarRole};

fn main() {
    println!("=== Forward-Euler Neural Mass Model Example ===\n");

    let config = CompilerConfig {
        parallel_layers: true,
        ..CompilerConfig::default()
    };
    let mut network = Network::new(config).unwrap();

    // Three uncoupled populations with different inputs
    network.define("dt", Tensor::scalar(1e-3, DType::Float64), VarRole::Constant).unwrap();
    network.define("tau", Tensor::scalar(1.0, DType::Float64), VarRole::Constant).unwrap();
    network.define("delta", Tensor::scalar(2.0, DType::Float64), VarRole::Constant).unwrap();
    network.define("eta", Tensor::scalar(-5.0, DType::Float64), VarRole::Constant).unwrap();
    network.define("J", Tensor::scalar(15.0, DType::Float64), VarRole::Constant).unwrap();
    network.define("I", Tensor::vector(&[0.0, 3.0, 6.0]), VarRole::Constant).unwrap();
    network.define("r", Tensor::vector(&[0.1, 0.1, 0.1]), VarRole::StateVar).unwrap();
    network.define("v", Tensor::vector(&[-2.0, -2.0, -2.0]), VarRole::StateVar).unwrap();

    let equations = [
        "d/dt * r = delta / (3.14159265 * tau^2) + 2. * r * v / tau",
        "d/dt * v = (v^2 + eta + I) / tau + J * r - tau * (3.14159265 * r)^2",
        "r_max = max(r)",
    ];
    for equation in equations {
        network.compile_equation(equation).unwrap();
        println!("  {}", equation);
    }
    println!();

    let summary = network.summary();
    println!(
        "Compiled into {} node(s) over {} layer(s)",
        summary.node_count,
        summary.layers.len()
    );
    for (i, layer) in summary.layers.iter().enumerate() {
        println!("  Layer {}: {}", i, layer.join(", "));
    }
    println!();

    let mut simulation = network.compile().unwrap();
    println!("{:>8}  {:>30}  {:>8}", "t", "r", "max(r)");
    for _ in 0..10 {
        simulation.run(500, 1e-3).unwrap();
        let r = simulation.value("r").unwrap().data().to_vec();
        let r_max = simulation.value("r_max").unwrap().item().unwrap();
        println!(
            "{:>8.3}  {:>30}  {:>8.4}",
            simulation.time(),
            format!("{:.4?}", r),
            r_max
        );
    }
}
