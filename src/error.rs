//! Error types for the equation compiler

use thiserror::Error;

/// Result type for compilation and evaluation
pub type CompileResult<T> = Result<T, CompileError>;

/// Compilation errors
///
/// Every variant aborts the equation being compiled. The network that
/// raised it rolls its symbol table and graph back before returning.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("Undefined variable: {name}")]
    UndefinedVariable { name: String },

    #[error("Unknown function: {name}")]
    UnknownFunction { name: String },

    #[error("Type conflict for `{name}`: bound as {existing}, requested {requested}")]
    TypeConflict {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("Type error: {message}")]
    TypeError { message: String },

    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    #[error("Index error: {message}")]
    IndexError { message: String },

    #[error("Operator `{operator}` is not implemented for the {backend} backend")]
    NotImplemented { operator: String, backend: String },

    #[error("Invalid value: {message}")]
    Value { message: String },

    #[error("Build failed: {diagnostic}")]
    Build { generated: String, diagnostic: String },
}

impl CompileError {
    pub fn syntax(position: usize, msg: impl Into<String>) -> Self {
        CompileError::Syntax {
            position,
            message: msg.into(),
        }
    }

    pub fn undefined(name: impl Into<String>) -> Self {
        CompileError::UndefinedVariable { name: name.into() }
    }

    pub fn unknown_function(name: impl Into<String>) -> Self {
        CompileError::UnknownFunction { name: name.into() }
    }

    pub fn type_error(msg: impl Into<String>) -> Self {
        CompileError::TypeError { message: msg.into() }
    }

    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        CompileError::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    pub fn index(msg: impl Into<String>) -> Self {
        CompileError::IndexError { message: msg.into() }
    }

    pub fn not_implemented(operator: impl Into<String>, backend: impl Into<String>) -> Self {
        CompileError::NotImplemented {
            operator: operator.into(),
            backend: backend.into(),
        }
    }

    pub fn value(msg: impl Into<String>) -> Self {
        CompileError::Value { message: msg.into() }
    }

    pub fn build(generated: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        CompileError::Build {
            generated: generated.into(),
            diagnostic: diagnostic.into(),
        }
    }
}
