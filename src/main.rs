//! Equation Graph Compiler CLI
//!
//! Usage:
//!   eqc "d/dt * v = -v + I" --var v=0,0.5 --param I=1.5 --steps 100 --dt 0.01
//!   eqc -f model.eq --backend fortran --emit
//!   eqc "a = 5. + 2." --steps 1 --json

use clap::Parser as ClapParser;
use colored::Colorize;
use env_logger::Env;
use log::{debug, info};
use std::fs;
use std::io::{self, Read};

use neural_eqc::{BackendKind, CompilerConfig, DType, Network, Tensor, VarRole};

#[derive(ClapParser, Debug)]
#[command(name = "eqc")]
#[command(author = "Simulation Team")]
#[command(version = "0.1.0")]
#[command(about = "Compiles and simulates systems of array equations")]
struct Args {
    /// Equations to compile (e.g., "d/dt * v = -v")
    #[arg(value_name = "EQUATION")]
    equations: Vec<String>,

    /// Read equations from file, one per line
    #[arg(short = 'f', long = "file")]
    input_file: Option<String>,

    /// Define a state variable (e.g., "v=0,0.5" or "n=3:int64")
    #[arg(long = "var", value_parser = parse_binding)]
    vars: Vec<(String, Tensor)>,

    /// Define a constant parameter (e.g., "tau=10")
    #[arg(short = 'p', long = "param", value_parser = parse_binding)]
    params: Vec<(String, Tensor)>,

    /// Integration step size
    #[arg(long = "dt", default_value = "0.01")]
    dt: f64,

    /// Number of steps to simulate
    #[arg(short = 'n', long = "steps", default_value = "0")]
    steps: usize,

    /// Backend to compile for (array or fortran)
    #[arg(short = 'b', long = "backend", value_parser = parse_backend)]
    backend: Option<BackendKind>,

    /// Print the generated Fortran routine
    #[arg(short = 'e', long = "emit")]
    emit: bool,

    /// JSON configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// Output as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn parse_binding(s: &str) -> Result<(String, Tensor), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid binding format: {}", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("Missing variable name: {}", s));
    }

    let (value, dtype) = match value.rsplit_once(':') {
        Some((value, dtype)) => (
            value,
            DType::from_name(dtype.trim()).ok_or_else(|| format!("Unknown dtype: {}", dtype))?,
        ),
        None => (value, DType::Float64),
    };

    let values = value
        .split(',')
        .map(|v| {
            v.trim()
                .parse::<f64>()
                .map_err(|_| format!("Invalid value: {}", v))
        })
        .collect::<Result<Vec<f64>, String>>()?;

    let tensor = if values.len() == 1 && !value.contains(',') {
        Tensor::scalar(values[0], dtype)
    } else {
        Tensor::vector(&values).cast(dtype)
    };
    Ok((name.to_string(), tensor))
}

fn parse_backend(s: &str) -> Result<BackendKind, String> {
    s.parse::<BackendKind>().map_err(|e| e.to_string())
}

fn fail(context: &str, message: impl std::fmt::Display) -> ! {
    eprintln!("{}: {}", context.red(), message);
    std::process::exit(1);
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .filter_level(level)
        .init();

    let mut config = match &args.config {
        Some(path) => CompilerConfig::load(path).unwrap_or_else(|e| fail("Configuration error", e)),
        None => CompilerConfig::default(),
    };
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    debug!("configuration: {:?}", config);

    // Get equations from arguments, file, or stdin
    let mut equations = args.equations.clone();
    if let Some(file) = &args.input_file {
        let text = fs::read_to_string(file)
            .unwrap_or_else(|e| fail("Error", format!("Failed to read file '{}': {}", file, e)));
        equations.extend(equation_lines(&text));
    }
    if equations.is_empty() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .unwrap_or_else(|e| fail("Error", format!("Failed to read stdin: {}", e)));
        equations.extend(equation_lines(&buffer));
    }

    if args.verbose {
        println!("{}", "Equation Graph Compiler".bold().blue());
        println!("{}", "=".repeat(35));
        println!();
        for equation in &equations {
            println!("{}: {}", "Input".green(), equation);
        }
        println!("{}: {}", "Backend".green(), config.backend.name());
        println!();
    }

    let mut network = Network::new(config).unwrap_or_else(|e| fail("Configuration error", e));
    if !args.params.iter().any(|(name, _)| name == "dt") {
        network
            .define("dt", Tensor::scalar(args.dt, DType::Float64), VarRole::Constant)
            .unwrap_or_else(|e| fail("Binding error", e));
    }
    for (name, value) in &args.params {
        network
            .define(name, value.clone(), VarRole::Constant)
            .unwrap_or_else(|e| fail("Binding error", e));
    }
    for (name, value) in &args.vars {
        network
            .define(name, value.clone(), VarRole::StateVar)
            .unwrap_or_else(|e| fail("Binding error", e));
    }

    for equation in &equations {
        if let Err(e) = network.compile_equation(equation) {
            fail("Compilation error", format!("{}\n  in `{}`", e, equation));
        }
    }
    info!("compiled {} equation(s)", equations.len());

    if args.emit {
        let procedure = network
            .emit_fortran()
            .unwrap_or_else(|e| fail("Code generation error", e));
        if !args.json_output {
            print!("{}", procedure.source);
        }
    }

    if args.steps > 0 {
        let mut simulation = network.compile().unwrap_or_else(|e| fail("Compilation error", e));
        simulation
            .run(args.steps, args.dt)
            .unwrap_or_else(|e| fail("Evaluation error", e));
    }

    // Output
    if args.json_output {
        let summary = network.summary();
        let values: serde_json::Map<String, serde_json::Value> = network
            .symbols()
            .iter()
            .map(|(_, v)| (v.name.clone(), serde_json::json!(v.value)))
            .collect();
        let output = serde_json::json!({
            "summary": summary,
            "steps": args.steps,
            "values": values,
        });
        match serde_json::to_string_pretty(&output) {
            Ok(json) => println!("{}", json),
            Err(e) => fail("Error", format!("Failed to serialize to JSON: {}", e)),
        }
    } else if !args.emit || args.steps > 0 {
        print_network(&network, args.steps, args.verbose);
    }
}

/// Non-empty lines that are not `#` comments
fn equation_lines(text: &str) -> impl Iterator<Item = String> + '_ {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
}

fn print_network(network: &Network, steps: usize, verbose: bool) {
    let summary = network.summary();

    println!("{}", "Compilation Results".bold().green());
    println!("{}", "=".repeat(50));
    println!();

    println!("{}: {}", "Backend".cyan(), network.config().backend.name());
    println!("{}: {}", "Equations".cyan(), summary.equations.len());
    println!("{}: {}", "Nodes".cyan(), summary.node_count);
    println!("{}: {}", "Layers".cyan(), summary.layers.len());
    println!();

    if verbose {
        println!("{}", "Layer Details".bold().yellow());
        println!("{}", "-".repeat(50));
        for (i, layer) in summary.layers.iter().enumerate() {
            println!("  {} {}: {}", "Layer".bold(), i, layer.join(", "));
        }
        println!();
    }

    println!("{}", format!("Values after {} step(s)", steps).bold().yellow());
    println!("{}", "-".repeat(50));
    for variable in &summary.variables {
        if let Ok(value) = network.value(&variable.name) {
            let data = match value.item() {
                Some(x) => format!("{}", x),
                None => format!("{:?}", value.data()),
            };
            println!(
                "  {} {} {}: {}",
                variable.name.bold(),
                variable.dtype.name().cyan(),
                variable.shape,
                data
            );
        }
    }
}
