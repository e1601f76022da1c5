//! Element semantics of the operators
//!
//! Shared by constant folding and the array backend so that a folded
//! constant always equals what evaluation would have produced. Results are
//! raw `f64`; callers normalise them to the result dtype.

use crate::ast::{BinaryOp, Function};

fn truth(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

pub fn binary(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Eq => truth(a == b),
        BinaryOp::Ne => truth(a != b),
        BinaryOp::Lt => truth(a < b),
        BinaryOp::Gt => truth(a > b),
        BinaryOp::Le => truth(a <= b),
        BinaryOp::Ge => truth(a >= b),
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        // Floored modulo: the result takes the sign of the divisor
        BinaryOp::Mod => a - b * (a / b).floor(),
        BinaryOp::Pow => a.powf(b),
    }
}

/// Element-wise functions; `None` for reductions
pub fn elementwise(function: Function, x: f64) -> Option<f64> {
    let value = match function {
        Function::Sin => x.sin(),
        Function::Cos => x.cos(),
        Function::Tan => x.tan(),
        Function::Atan => x.atan(),
        Function::Tanh => x.tanh(),
        Function::Exp => x.exp(),
        Function::Log => x.ln(),
        Function::Sqrt => x.sqrt(),
        Function::Abs => x.abs(),
        // Round half to even
        Function::Round => {
            let rounded = x.round();
            if (x - x.trunc()).abs() == 0.5 {
                2.0 * (x / 2.0).round()
            } else {
                rounded
            }
        }
        Function::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        Function::Cast(_) => x,
        Function::Sum | Function::Mean | Function::Max | Function::Min => return None,
    };
    Some(value)
}

/// Reductions over all elements; `None` for element-wise functions
pub fn reduce(function: Function, values: &[f64]) -> Option<f64> {
    let value = match function {
        Function::Sum => values.iter().sum(),
        Function::Mean => values.iter().sum::<f64>() / values.len() as f64,
        Function::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Function::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        _ => return None,
    };
    Some(value)
}
