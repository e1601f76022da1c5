//! Symbol table of a network
//!
//! Maps identifiers to typed variables and holds their current values.
//! Insertion order is preserved so generated layouts are deterministic.

use std::collections::HashSet;

use indexmap::IndexMap;
use log::debug;
use serde::Serialize;

use crate::error::{CompileError, CompileResult};
use crate::tensor::Tensor;
use crate::types::{DType, Shape, VarRole};

/// Handle of a variable in its symbol table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VarId(pub usize);

/// A bound variable and its current value
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub dtype: DType,
    pub shape: Shape,
    pub role: VarRole,
    pub value: Tensor,
}

/// Opaque marker returned by [`SymbolTable::checkpoint`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    index: IndexMap<String, VarId>,
    variables: Vec<Variable>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Look up a variable by name
    pub fn resolve(&self, name: &str) -> CompileResult<VarId> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::undefined(name))
    }

    /// Register a binding, or return the existing one if it agrees.
    ///
    /// New variables start out zero-filled.
    pub fn bind(&mut self, name: &str, dtype: DType, shape: Shape, role: VarRole) -> CompileResult<VarId> {
        if let Some(&id) = self.index.get(name) {
            let existing = &self.variables[id.0];
            if existing.dtype != dtype {
                return Err(CompileError::TypeConflict {
                    name: name.to_string(),
                    existing: existing.dtype.to_string(),
                    requested: dtype.to_string(),
                });
            }
            if existing.shape != shape {
                return Err(CompileError::shape_mismatch(
                    existing.shape.to_string(),
                    shape.to_string(),
                ));
            }
            return Ok(id);
        }

        let dims = shape.concrete().ok_or_else(|| {
            CompileError::value(format!(
                "variable `{}` cannot have a data-dependent shape {}",
                name, shape
            ))
        })?;
        let id = VarId(self.variables.len());
        debug!("bind {} as {} {} ({})", name, dtype, shape, role);
        self.variables.push(Variable {
            name: name.to_string(),
            dtype,
            shape,
            role,
            value: Tensor::zeros(dtype, &dims),
        });
        self.index.insert(name.to_string(), id);
        Ok(id)
    }

    /// Bind `name` to an initial value.
    ///
    /// Redefining an existing variable replaces its value; dtype and shape
    /// must agree with the existing binding.
    pub fn define(&mut self, name: &str, value: Tensor, role: VarRole) -> CompileResult<VarId> {
        let shape = Shape::fixed(value.shape());
        let id = self.bind(name, value.dtype(), shape, role)?;
        let variable = &mut self.variables[id.0];
        variable.value = value;
        variable.role = role;
        Ok(id)
    }

    pub fn variable(&self, id: VarId) -> &Variable {
        &self.variables[id.0]
    }

    /// Current value of a variable by name
    pub fn value(&self, name: &str) -> CompileResult<&Tensor> {
        let id = self.resolve(name)?;
        Ok(&self.variables[id.0].value)
    }

    /// Overwrite a variable in place, broadcasting and casting to its binding
    pub fn write(&mut self, id: VarId, value: &Tensor) -> CompileResult<()> {
        let variable = &mut self.variables[id.0];
        let dims = variable.value.shape().to_vec();
        let value = value.broadcast_to(&dims).map_err(|_| {
            CompileError::shape_mismatch(
                format!("{} for `{}`", variable.shape, variable.name),
                format!("{:?}", value.shape()),
            )
        })?;
        variable.value = value.cast(variable.dtype);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (VarId, &Variable)> {
        self.variables
            .iter()
            .enumerate()
            .map(|(i, v)| (VarId(i), v))
    }

    /// Names currently bound, used to keep them from being parsed as calls
    pub fn known_identifiers(&self) -> HashSet<String> {
        self.index.keys().cloned().collect()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.variables.len())
    }

    /// Drop every binding created after `checkpoint`
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        if checkpoint.0 < self.variables.len() {
            debug!(
                "rolling back {} binding(s)",
                self.variables.len() - checkpoint.0
            );
        }
        self.variables.truncate(checkpoint.0);
        self.index.truncate(checkpoint.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_resolve_undefined() {
        let table = SymbolTable::new();
        let err = table.resolve("b").unwrap_err();
        assert!(matches!(err, CompileError::UndefinedVariable { ref name } if name == "b"));
    }

    #[test]
    fn test_bind_returns_existing() {
        let mut table = SymbolTable::new();
        let a = table
            .bind("a", DType::Float64, Shape::fixed(&[3]), VarRole::StateVar)
            .unwrap();
        let again = table
            .bind("a", DType::Float64, Shape::fixed(&[3]), VarRole::StateVar)
            .unwrap();
        assert_eq!(a, again);
        assert_eq!(table.len(), 1);
        assert_eq!(table.variable(a).value.data(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_bind_conflicts() {
        let mut table = SymbolTable::new();
        table
            .bind("a", DType::Float64, Shape::scalar(), VarRole::StateVar)
            .unwrap();
        let err = table
            .bind("a", DType::Int64, Shape::scalar(), VarRole::StateVar)
            .unwrap_err();
        assert!(matches!(err, CompileError::TypeConflict { .. }));
        let err = table
            .bind("a", DType::Float64, Shape::fixed(&[2]), VarRole::StateVar)
            .unwrap_err();
        assert!(matches!(err, CompileError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_dynamic_shape_rejected() {
        let mut table = SymbolTable::new();
        let err = table
            .bind("m", DType::Float64, Shape::from_dims(vec![None]), VarRole::StateVar)
            .unwrap_err();
        assert!(matches!(err, CompileError::Value { .. }));
    }

    #[test]
    fn test_write_broadcasts_and_casts() {
        let mut table = SymbolTable::new();
        let id = table
            .define("n", Tensor::zeros(DType::Int64, &[2]), VarRole::StateVar)
            .unwrap();
        table.write(id, &Tensor::scalar(2.7, DType::Float64)).unwrap();
        let value = table.value("n").unwrap();
        assert_eq!(value.dtype(), DType::Int64);
        assert_eq!(value.data(), &[2.0, 2.0]);

        let err = table.write(id, &Tensor::vector(&[1.0, 2.0, 3.0])).unwrap_err();
        assert!(matches!(err, CompileError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_rollback_drops_new_bindings() {
        let mut table = SymbolTable::new();
        table
            .define("a", Tensor::scalar(1.0, DType::Float64), VarRole::Constant)
            .unwrap();
        let checkpoint = table.checkpoint();
        table
            .bind("b", DType::Float64, Shape::scalar(), VarRole::StateVar)
            .unwrap();
        table.rollback(checkpoint);
        assert!(table.contains("a"));
        assert!(!table.contains("b"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_insertion_order() {
        let mut table = SymbolTable::new();
        for name in ["z", "a", "m"] {
            table
                .bind(name, DType::Float64, Shape::scalar(), VarRole::StateVar)
                .unwrap();
        }
        let names: Vec<&str> = table.iter().map(|(_, v)| v.name.as_str()).collect();
        assert_eq!(names, vec!["z", "a", "m"]);
    }
}
