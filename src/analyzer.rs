//! Static shape and dtype rules
//!
//! The graph builder consults the [`Analyzer`] before every node it
//! creates: binary operands must have compatible shapes and a common
//! dtype, function arguments must have a dtype the function accepts, and
//! index operands must address axes that exist.

use crate::ast::{BinaryOp, Function, Literal};
use crate::error::{CompileError, CompileResult};
use crate::tensor::{normalize_index, slice_indices};
use crate::types::{DType, Shape};

/// Static type of a value during lowering
#[derive(Debug, Clone, PartialEq)]
pub struct ValueType {
    pub dtype: DType,
    pub shape: Shape,
    /// Derived only from untyped literals; adopts the dtype of its partner
    pub weak: bool,
}

impl ValueType {
    pub fn new(dtype: DType, shape: Shape, weak: bool) -> Self {
        Self { dtype, shape, weak }
    }
}

/// Static description of one index axis, as far as it is known at build time
#[derive(Debug, Clone, PartialEq)]
pub enum AxisSpec {
    Full,
    /// Single position; the value when it is a constant
    At(Option<i64>),
    /// `(start, stop, step)` when every present part is constant
    Slice(Option<(Option<i64>, Option<i64>, i64)>),
    Mask(Shape),
    Gather(Shape),
}

/// Shape and dtype checker
#[derive(Debug, Clone)]
pub struct Analyzer {
    permissive_broadcast: bool,
    float_dtype: DType,
}

impl Analyzer {
    pub fn new(permissive_broadcast: bool, float_dtype: DType) -> Self {
        Self {
            permissive_broadcast,
            float_dtype,
        }
    }

    /// Dtype of untyped float literals and of promoted integer math
    pub fn float_dtype(&self) -> DType {
        self.float_dtype
    }

    /// Provisional dtype of an untyped literal
    pub fn literal_dtype(&self, literal: &Literal) -> DType {
        match literal {
            Literal::Int(_) => DType::Int64,
            Literal::Float(_) => self.float_dtype,
        }
    }

    /// Result shape of an element-wise binary operation
    pub fn broadcast(&self, left: &Shape, right: &Shape) -> CompileResult<Shape> {
        if left.is_scalar() {
            return Ok(right.clone());
        }
        if right.is_scalar() {
            return Ok(left.clone());
        }
        if let Some(merged) = merge_equal(left, right) {
            return Ok(merged);
        }
        if left.rank() > 1 && right.rank() > 1 {
            if let Some(shape) = broadcast_static(left, right) {
                return Ok(shape);
            }
            if self.permissive_broadcast {
                return Ok(deferred(left, right));
            }
        }
        Err(CompileError::shape_mismatch(
            format!("a shape compatible with {}", left),
            right.to_string(),
        ))
    }

    /// Check that `value` can be written into a variable of shape `target`
    pub fn check_update(&self, target: &Shape, value: &Shape) -> CompileResult<()> {
        if value.is_scalar() || merge_equal(target, value).is_some() {
            return Ok(());
        }
        if target.rank() > 1 && value.rank() > 1 {
            if let Some(shape) = broadcast_static(target, value) {
                if merge_equal(&shape, target).is_some() {
                    return Ok(());
                }
            } else if self.permissive_broadcast {
                return Ok(());
            }
        }
        Err(CompileError::shape_mismatch(target.to_string(), value.to_string()))
    }

    /// Dtype both operands of a binary operation are brought to
    pub fn unify(&self, left: &ValueType, right: &ValueType) -> CompileResult<DType> {
        match (left.weak, right.weak) {
            (false, false) if left.dtype == right.dtype => Ok(left.dtype),
            (false, false) => Err(CompileError::type_error(format!(
                "operands have different dtypes {} and {}; cast one side explicitly",
                left.dtype, right.dtype
            ))),
            (true, false) => Ok(self.adopt(left.dtype, right.dtype)),
            (false, true) => Ok(self.adopt(right.dtype, left.dtype)),
            (true, true) => Ok(self.weak_join(left.dtype, right.dtype)),
        }
    }

    // A weak float never truncates to an integer partner and a weak number
    // never collapses to bool; the pair is promoted instead
    fn adopt(&self, weak: DType, strong: DType) -> DType {
        if strong.is_bool() && !weak.is_bool() {
            weak
        } else if weak.is_float() && !strong.is_float() {
            self.float_dtype
        } else {
            strong
        }
    }

    fn weak_join(&self, a: DType, b: DType) -> DType {
        if a == b {
            a
        } else if a.is_float() || b.is_float() {
            self.float_dtype
        } else {
            DType::Int64
        }
    }

    /// Result dtype of a binary operation on operands of `operand` dtype
    pub fn binary_dtype(&self, op: BinaryOp, operand: DType) -> CompileResult<DType> {
        if op.is_comparison() {
            return Ok(DType::Bool);
        }
        if operand.is_bool() {
            return Err(CompileError::type_error(format!(
                "operator `{}` is not defined for bool operands",
                op.symbol()
            )));
        }
        if op == BinaryOp::Div && operand.is_int() {
            return Ok(DType::Float64);
        }
        Ok(operand)
    }

    pub fn neg_dtype(&self, operand: DType) -> CompileResult<DType> {
        if operand.is_bool() {
            return Err(CompileError::type_error("negation is not defined for bool"));
        }
        Ok(operand)
    }

    /// Result type of calling `function` on a value of type `arg`
    pub fn call_type(&self, function: Function, arg: &ValueType) -> CompileResult<ValueType> {
        let reject_bool = || {
            if arg.dtype.is_bool() {
                Err(CompileError::type_error(format!(
                    "{}() is not defined for bool",
                    function.name()
                )))
            } else {
                Ok(())
            }
        };
        let float_of = |dtype: DType| if dtype.is_float() { dtype } else { DType::Float64 };

        let dtype = match function {
            Function::Sin
            | Function::Cos
            | Function::Tan
            | Function::Atan
            | Function::Tanh
            | Function::Exp
            | Function::Log
            | Function::Sqrt
            | Function::Sigmoid => {
                reject_bool()?;
                float_of(arg.dtype)
            }
            Function::Abs | Function::Round => {
                reject_bool()?;
                arg.dtype
            }
            Function::Sum if arg.dtype.is_bool() => DType::Int64,
            Function::Sum | Function::Max | Function::Min => arg.dtype,
            Function::Mean => float_of(arg.dtype),
            Function::Cast(target) => target,
        };

        let shape = if function.is_reduction() {
            Shape::scalar()
        } else {
            arg.shape.clone()
        };
        let weak = arg.weak && !matches!(function, Function::Cast(_));
        Ok(ValueType::new(dtype, shape, weak))
    }

    /// Result shape of indexing a value of shape `target`
    pub fn index_shape(&self, target: &Shape, axes: &[AxisSpec]) -> CompileResult<Shape> {
        let dims = target.dims();
        let consumed: usize = axes
            .iter()
            .map(|spec| match spec {
                AxisSpec::Mask(mask) => mask.rank().max(1),
                _ => 1,
            })
            .sum();
        if consumed > dims.len() {
            return Err(CompileError::index(format!(
                "too many indices: {} for a value of shape {}",
                consumed, target
            )));
        }

        let mut out = Vec::with_capacity(dims.len());
        let mut axis = 0;
        for spec in axes {
            let dim = dims[axis];
            match spec {
                AxisSpec::Full => out.push(dim),
                AxisSpec::At(position) => {
                    if let (Some(position), Some(dim)) = (position, dim) {
                        normalize_index(*position, dim)?;
                    }
                }
                AxisSpec::Slice(Some((start, stop, step))) => {
                    if *step == 0 {
                        return Err(CompileError::value("slice step cannot be zero"));
                    }
                    out.push(dim.map(|d| slice_indices(d, *start, *stop, *step).len()));
                }
                AxisSpec::Slice(None) => out.push(None),
                AxisSpec::Gather(positions) => {
                    if positions.rank() != 1 {
                        return Err(CompileError::index(format!(
                            "index arrays must be one-dimensional, got shape {}",
                            positions
                        )));
                    }
                    out.push(positions.dims()[0]);
                }
                AxisSpec::Mask(mask) if mask.rank() > 1 => {
                    if axes.len() != 1 {
                        return Err(CompileError::index(
                            "a multi-dimensional boolean mask must be the only index",
                        ));
                    }
                    if merge_equal(mask, target).is_none() {
                        return Err(CompileError::index(format!(
                            "boolean mask of shape {} does not match shape {}",
                            mask, target
                        )));
                    }
                    out.push(None);
                    axis += mask.rank();
                    continue;
                }
                AxisSpec::Mask(mask) => {
                    let length = mask.dims().first().copied().ok_or_else(|| {
                        CompileError::index("a boolean index must have at least one dimension")
                    })?;
                    if let (Some(length), Some(dim)) = (length, dim) {
                        if length != dim {
                            return Err(CompileError::index(format!(
                                "boolean mask of length {} for axis {} of size {}",
                                length, axis, dim
                            )));
                        }
                    }
                    out.push(None);
                }
            }
            axis += 1;
        }
        out.extend_from_slice(&dims[axis..]);
        Ok(Shape::from_dims(out))
    }
}

/// Equal-rank shapes whose dims agree, treating data-dependent dims as wildcards
fn merge_equal(a: &Shape, b: &Shape) -> Option<Shape> {
    if a.rank() != b.rank() {
        return None;
    }
    a.dims()
        .iter()
        .zip(b.dims())
        .map(|(x, y)| match (x, y) {
            (Some(x), Some(y)) if x == y => Some(Some(*x)),
            (Some(_), Some(_)) => None,
            (Some(d), None) | (None, Some(d)) => Some(Some(*d)),
            (None, None) => Some(None),
        })
        .collect::<Option<Vec<_>>>()
        .map(Shape::from_dims)
}

/// Trailing-dimension broadcast of two static shapes
fn broadcast_static(a: &Shape, b: &Shape) -> Option<Shape> {
    let rank = a.rank().max(b.rank());
    let pad = |s: &Shape, i: usize| {
        let offset = rank - s.rank();
        if i < offset {
            Some(1)
        } else {
            s.dims()[i - offset]
        }
    };
    (0..rank)
        .map(|i| match (pad(a, i), pad(b, i)) {
            (Some(x), Some(y)) if x == y => Some(Some(x)),
            (Some(1), y) | (y, Some(1)) => Some(y),
            (Some(_), Some(_)) => None,
            (Some(d), None) | (None, Some(d)) => Some(Some(d)),
            (None, None) => Some(None),
        })
        .collect::<Option<Vec<_>>>()
        .map(Shape::from_dims)
}

/// Result shape when the compatibility check is left to evaluation time
fn deferred(a: &Shape, b: &Shape) -> Shape {
    let rank = a.rank().max(b.rank());
    let pad = |s: &Shape, i: usize| {
        let offset = rank - s.rank();
        if i < offset {
            Some(1)
        } else {
            s.dims()[i - offset]
        }
    };
    Shape::from_dims(
        (0..rank)
            .map(|i| match (pad(a, i), pad(b, i)) {
                (Some(x), Some(y)) if x == y => Some(x),
                _ => None,
            })
            .collect(),
    )
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new(false, DType::Float64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fixed(dims: &[usize]) -> Shape {
        Shape::fixed(dims)
    }

    fn strong(dtype: DType) -> ValueType {
        ValueType::new(dtype, Shape::scalar(), false)
    }

    fn weak(dtype: DType) -> ValueType {
        ValueType::new(dtype, Shape::scalar(), true)
    }

    #[test]
    fn test_broadcast_rules() {
        let analyzer = Analyzer::default();
        assert_eq!(analyzer.broadcast(&fixed(&[3]), &fixed(&[3])).unwrap(), fixed(&[3]));
        assert_eq!(analyzer.broadcast(&Shape::scalar(), &fixed(&[2, 2])).unwrap(), fixed(&[2, 2]));
        assert_eq!(analyzer.broadcast(&fixed(&[3, 1]), &fixed(&[1, 4])).unwrap(), fixed(&[3, 4]));
        assert!(analyzer.broadcast(&fixed(&[3]), &fixed(&[4])).is_err());
        assert!(analyzer.broadcast(&fixed(&[3]), &fixed(&[2, 3])).is_err());
    }

    #[test]
    fn test_incompatible_matrices() {
        let analyzer = Analyzer::default();
        let err = analyzer.broadcast(&fixed(&[3, 3]), &fixed(&[4, 4])).unwrap_err();
        assert!(matches!(err, CompileError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_permissive_broadcast_defers() {
        let analyzer = Analyzer::new(true, DType::Float64);
        let shape = analyzer.broadcast(&fixed(&[3, 3]), &fixed(&[4, 4])).unwrap();
        assert_eq!(shape, Shape::from_dims(vec![None, None]));
        // rank-1 operands are still checked
        assert!(analyzer.broadcast(&fixed(&[3]), &fixed(&[4])).is_err());
    }

    #[test]
    fn test_dynamic_dims_match() {
        let analyzer = Analyzer::default();
        let masked = Shape::from_dims(vec![None]);
        assert_eq!(analyzer.broadcast(&masked, &fixed(&[5])).unwrap(), fixed(&[5]));
        assert_eq!(analyzer.broadcast(&masked, &masked).unwrap(), masked);
    }

    #[test]
    fn test_check_update() {
        let analyzer = Analyzer::default();
        assert!(analyzer.check_update(&fixed(&[3]), &Shape::scalar()).is_ok());
        assert!(analyzer.check_update(&fixed(&[2, 3]), &fixed(&[1, 3])).is_ok());
        assert!(analyzer.check_update(&fixed(&[1, 3]), &fixed(&[2, 3])).is_err());
        assert!(analyzer.check_update(&Shape::scalar(), &fixed(&[3])).is_err());
    }

    #[test]
    fn test_unify() {
        let analyzer = Analyzer::default();
        assert_eq!(analyzer.unify(&strong(DType::Float32), &weak(DType::Float64)).unwrap(), DType::Float32);
        assert_eq!(analyzer.unify(&weak(DType::Int64), &strong(DType::Int32)).unwrap(), DType::Int32);
        assert_eq!(analyzer.unify(&weak(DType::Float64), &strong(DType::Int32)).unwrap(), DType::Float64);
        assert_eq!(analyzer.unify(&weak(DType::Int64), &weak(DType::Float64)).unwrap(), DType::Float64);
        assert_eq!(analyzer.unify(&strong(DType::Bool), &weak(DType::Int64)).unwrap(), DType::Int64);
        assert_eq!(analyzer.unify(&weak(DType::Float64), &strong(DType::Bool)).unwrap(), DType::Float64);
        assert_eq!(analyzer.unify(&strong(DType::Bool), &weak(DType::Bool)).unwrap(), DType::Bool);
        let err = analyzer
            .unify(&strong(DType::Float64), &strong(DType::Int64))
            .unwrap_err();
        assert!(matches!(err, CompileError::TypeError { .. }));
    }

    #[test]
    fn test_binary_dtype() {
        let analyzer = Analyzer::default();
        assert_eq!(analyzer.binary_dtype(BinaryOp::Ge, DType::Float64).unwrap(), DType::Bool);
        assert_eq!(analyzer.binary_dtype(BinaryOp::Div, DType::Int32).unwrap(), DType::Float64);
        assert_eq!(analyzer.binary_dtype(BinaryOp::Mod, DType::Int64).unwrap(), DType::Int64);
        assert!(analyzer.binary_dtype(BinaryOp::Add, DType::Bool).is_err());
        assert!(analyzer.neg_dtype(DType::Bool).is_err());
    }

    #[test]
    fn test_call_type() {
        let analyzer = Analyzer::default();
        let ints = ValueType::new(DType::Int64, fixed(&[4]), false);
        let sin = analyzer.call_type(Function::Sin, &ints).unwrap();
        assert_eq!(sin.dtype, DType::Float64);
        assert_eq!(sin.shape, fixed(&[4]));

        let bools = ValueType::new(DType::Bool, fixed(&[4]), false);
        let total = analyzer.call_type(Function::Sum, &bools).unwrap();
        assert_eq!(total.dtype, DType::Int64);
        assert!(total.shape.is_scalar());
        assert!(analyzer.call_type(Function::Exp, &bools).is_err());

        let cast = analyzer
            .call_type(Function::Cast(DType::Int32), &weak(DType::Float64))
            .unwrap();
        assert_eq!(cast.dtype, DType::Int32);
        assert!(!cast.weak);
    }

    #[test]
    fn test_index_shape() {
        let analyzer = Analyzer::default();
        let grid = fixed(&[10, 4]);

        let row = analyzer.index_shape(&grid, &[AxisSpec::At(Some(-1))]).unwrap();
        assert_eq!(row, fixed(&[4]));

        let part = analyzer
            .index_shape(&grid, &[AxisSpec::Slice(Some((Some(0), Some(5), 1))), AxisSpec::Full])
            .unwrap();
        assert_eq!(part, fixed(&[5, 4]));

        let gathered = analyzer
            .index_shape(&grid, &[AxisSpec::Full, AxisSpec::Gather(fixed(&[3]))])
            .unwrap();
        assert_eq!(gathered, fixed(&[10, 3]));

        let masked = analyzer.index_shape(&grid, &[AxisSpec::Mask(grid.clone())]).unwrap();
        assert_eq!(masked, Shape::from_dims(vec![None]));
    }

    #[test]
    fn test_index_errors() {
        let analyzer = Analyzer::default();
        let v = fixed(&[10]);
        assert!(matches!(
            analyzer.index_shape(&v, &[AxisSpec::At(Some(10))]),
            Err(CompileError::IndexError { .. })
        ));
        assert!(matches!(
            analyzer.index_shape(&v, &[AxisSpec::At(None), AxisSpec::At(None)]),
            Err(CompileError::IndexError { .. })
        ));
        assert!(matches!(
            analyzer.index_shape(&v, &[AxisSpec::Slice(Some((None, None, 0)))]),
            Err(CompileError::Value { .. })
        ));
        assert!(matches!(
            analyzer.index_shape(&v, &[AxisSpec::Mask(fixed(&[4]))]),
            Err(CompileError::IndexError { .. })
        ));
    }
}
