//! Element types, shapes and variable roles

use serde::{Deserialize, Serialize};

/// Element type of a variable or operation result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl DType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "bool" => Some(DType::Bool),
            "int32" => Some(DType::Int32),
            "int64" => Some(DType::Int64),
            "float32" => Some(DType::Float32),
            "float64" => Some(DType::Float64),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::Float32 | DType::Float64)
    }

    pub fn is_int(&self) -> bool {
        matches!(self, DType::Int32 | DType::Int64)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, DType::Bool)
    }

    /// Round a raw value into the representable set of this dtype.
    ///
    /// Values of every dtype are stored as `f64`; this keeps stored data
    /// consistent with what the native type would hold.
    pub fn normalize(&self, value: f64) -> f64 {
        match self {
            DType::Bool => {
                if value != 0.0 && !value.is_nan() {
                    1.0
                } else {
                    0.0
                }
            }
            DType::Int32 => (value.trunc() as i32) as f64,
            DType::Int64 => (value.trunc() as i64) as f64,
            DType::Float32 => (value as f32) as f64,
            DType::Float64 => value,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Static shape of a value.
///
/// A `None` dimension is data dependent (boolean mask selection) and is
/// only known at evaluation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Option<usize>>,
}

impl Shape {
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn fixed(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().map(|&d| Some(d)).collect(),
        }
    }

    pub fn from_dims(dims: Vec<Option<usize>>) -> Self {
        Self { dims }
    }

    pub fn dims(&self) -> &[Option<usize>] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn is_dynamic(&self) -> bool {
        self.dims.iter().any(Option::is_none)
    }

    /// Concrete dimensions, if none of them is data dependent
    pub fn concrete(&self) -> Option<Vec<usize>> {
        self.dims.iter().copied().collect()
    }

    /// Number of elements, if known
    pub fn numel(&self) -> Option<usize> {
        self.concrete().map(|dims| dims.iter().product())
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.dims.is_empty() {
            return write!(f, "scalar");
        }
        write!(f, "(")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match dim {
                Some(d) => write!(f, "{}", d)?,
                None => write!(f, "?")?,
            }
        }
        if self.dims.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

/// How a variable is stored across simulation steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarRole {
    /// Persists across steps and is updated by equations
    StateVar,
    /// Fixed parameter; may still be rewritten by an assignment
    Constant,
    /// Embedded literal data, never written
    Raw,
}

impl std::fmt::Display for VarRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VarRole::StateVar => write!(f, "state_var"),
            VarRole::Constant => write!(f, "constant"),
            VarRole::Raw => write!(f, "raw"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(DType::Bool.normalize(3.0), 1.0);
        assert_eq!(DType::Int64.normalize(-2.7), -2.0);
        assert_eq!(DType::Float32.normalize(0.1), 0.1f32 as f64);
        assert_eq!(DType::Float64.normalize(0.1), 0.1);
    }

    #[test]
    fn test_shape_display() {
        assert_eq!(Shape::scalar().to_string(), "scalar");
        assert_eq!(Shape::fixed(&[3]).to_string(), "(3,)");
        assert_eq!(Shape::from_dims(vec![Some(3), None]).to_string(), "(3, ?)");
    }

    #[test]
    fn test_dynamic_shape() {
        let shape = Shape::from_dims(vec![None]);
        assert!(shape.is_dynamic());
        assert_eq!(shape.numel(), None);
        assert_eq!(Shape::fixed(&[2, 3]).numel(), Some(6));
    }
}
