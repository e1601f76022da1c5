//! Runtime array values for the in-process backend
//!
//! A [`Tensor`] stores its elements row-major as `f64`, normalised to its
//! dtype on every write. Broadcasting follows the usual trailing-dimension
//! rule; indexing follows Python slice semantics.

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};
use crate::types::DType;

/// A dense n-dimensional value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<f64>,
}

/// Selection applied to one axis (or the whole tensor for `FlatMask`)
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    Full,
    At(i64),
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: i64,
    },
    Positions(Vec<i64>),
    Mask(Vec<bool>),
    FlatMask(Vec<bool>),
}

impl Tensor {
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<f64>) -> CompileResult<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(CompileError::shape_mismatch(
                format!("{} elements for shape {:?}", numel, shape),
                format!("{} elements", data.len()),
            ));
        }
        Ok(Self::from_parts(dtype, shape, data))
    }

    fn from_parts(dtype: DType, shape: Vec<usize>, mut data: Vec<f64>) -> Self {
        for value in &mut data {
            *value = dtype.normalize(*value);
        }
        Self { dtype, shape, data }
    }

    pub fn scalar(value: f64, dtype: DType) -> Self {
        Self::from_parts(dtype, Vec::new(), vec![value])
    }

    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        let numel = shape.iter().product();
        Self {
            dtype,
            shape: shape.to_vec(),
            data: vec![0.0; numel],
        }
    }

    /// Rank-1 `float64` tensor
    pub fn vector(values: &[f64]) -> Self {
        Self::from_parts(DType::Float64, vec![values.len()], values.to_vec())
    }

    /// Rank-2 `float64` tensor from rows
    pub fn matrix(rows: &[Vec<f64>]) -> CompileResult<Self> {
        let m = rows.len();
        let n = rows.first().map(Vec::len).unwrap_or(0);
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != n) {
            return Err(CompileError::shape_mismatch(
                format!("{} elements in every row", n),
                format!("{} elements in row {}", row.len(), i),
            ));
        }
        Ok(Self::from_parts(
            DType::Float64,
            vec![m, n],
            rows.iter().flatten().copied().collect(),
        ))
    }

    pub fn from_bools(shape: Vec<usize>, values: &[bool]) -> CompileResult<Self> {
        let data = values.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect();
        Self::new(DType::Bool, shape, data)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    /// The single element of a one-element tensor
    pub fn item(&self) -> Option<f64> {
        match self.data.as_slice() {
            [value] => Some(*value),
            _ => None,
        }
    }

    pub fn as_bools(&self) -> Vec<bool> {
        self.data.iter().map(|&v| v != 0.0).collect()
    }

    pub fn cast(&self, dtype: DType) -> Self {
        Self::from_parts(dtype, self.shape.clone(), self.data.clone())
    }

    pub fn map(&self, dtype: DType, f: impl Fn(f64) -> f64) -> Self {
        Self::from_parts(
            dtype,
            self.shape.clone(),
            self.data.iter().map(|&v| f(v)).collect(),
        )
    }

    /// Reduce all elements into a scalar
    pub fn reduce(&self, dtype: DType, f: impl Fn(&[f64]) -> f64) -> Self {
        Self::scalar(f(&self.data), dtype)
    }

    /// Element-wise combination with broadcasting
    pub fn zip_with(
        &self,
        other: &Tensor,
        dtype: DType,
        f: impl Fn(f64, f64) -> f64,
    ) -> CompileResult<Self> {
        if self.shape == other.shape {
            let data = self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Ok(Self::from_parts(dtype, self.shape.clone(), data));
        }

        let out_shape = broadcast_shapes(&self.shape, &other.shape).ok_or_else(|| {
            CompileError::shape_mismatch(
                format!("shapes broadcastable with {:?}", self.shape),
                format!("{:?}", other.shape),
            )
        })?;
        let numel: usize = out_shape.iter().product();
        let mut data = Vec::with_capacity(numel);
        let mut index = vec![0usize; out_shape.len()];
        for _ in 0..numel {
            let a = self.data[broadcast_offset(&index, &self.shape)];
            let b = other.data[broadcast_offset(&index, &other.shape)];
            data.push(f(a, b));
            advance(&mut index, &out_shape);
        }
        Ok(Self::from_parts(dtype, out_shape, data))
    }

    /// Expand to `shape` following broadcasting rules
    pub fn broadcast_to(&self, shape: &[usize]) -> CompileResult<Self> {
        if self.shape == shape {
            return Ok(self.clone());
        }
        match broadcast_shapes(&self.shape, shape) {
            Some(out) if out == shape => {}
            _ => {
                return Err(CompileError::shape_mismatch(
                    format!("{:?}", shape),
                    format!("{:?}", self.shape),
                ))
            }
        }
        let numel: usize = shape.iter().product();
        let mut data = Vec::with_capacity(numel);
        let mut index = vec![0usize; shape.len()];
        for _ in 0..numel {
            data.push(self.data[broadcast_offset(&index, &self.shape)]);
            advance(&mut index, shape);
        }
        Ok(Self {
            dtype: self.dtype,
            shape: shape.to_vec(),
            data,
        })
    }

    /// Apply one selector per leading axis; missing trailing axes are kept whole
    pub fn select(&self, selectors: &[Selector]) -> CompileResult<Self> {
        if let [Selector::FlatMask(mask)] = selectors {
            if mask.len() != self.data.len() {
                return Err(CompileError::index(format!(
                    "boolean mask of {} elements does not match {} elements",
                    mask.len(),
                    self.data.len()
                )));
            }
            let data: Vec<f64> = self
                .data
                .iter()
                .zip(mask)
                .filter(|(_, &keep)| keep)
                .map(|(&v, _)| v)
                .collect();
            return Ok(Self {
                dtype: self.dtype,
                shape: vec![data.len()],
                data,
            });
        }

        if selectors.len() > self.shape.len() {
            return Err(CompileError::index(format!(
                "too many indices: {} for a value of rank {}",
                selectors.len(),
                self.shape.len()
            )));
        }

        let mut picks: Vec<Vec<usize>> = Vec::with_capacity(self.shape.len());
        let mut out_shape = Vec::new();
        for (axis, &dim) in self.shape.iter().enumerate() {
            let (pick, keep) = match selectors.get(axis).unwrap_or(&Selector::Full) {
                Selector::Full => ((0..dim).collect(), true),
                Selector::At(i) => (vec![normalize_index(*i, dim)?], false),
                Selector::Slice { start, stop, step } => {
                    if *step == 0 {
                        return Err(CompileError::value("slice step cannot be zero"));
                    }
                    (slice_indices(dim, *start, *stop, *step), true)
                }
                Selector::Positions(positions) => (
                    positions
                        .iter()
                        .map(|&p| normalize_index(p, dim))
                        .collect::<CompileResult<Vec<_>>>()?,
                    true,
                ),
                Selector::Mask(mask) => {
                    if mask.len() != dim {
                        return Err(CompileError::index(format!(
                            "boolean mask of length {} for axis {} of size {}",
                            mask.len(),
                            axis,
                            dim
                        )));
                    }
                    (
                        mask.iter()
                            .enumerate()
                            .filter(|(_, &keep)| keep)
                            .map(|(i, _)| i)
                            .collect(),
                        true,
                    )
                }
                Selector::FlatMask(_) => {
                    return Err(CompileError::index(
                        "a full-shape boolean mask must be the only index",
                    ))
                }
            };
            if keep {
                out_shape.push(pick.len());
            }
            picks.push(pick);
        }

        let strides = row_major_strides(&self.shape);
        let numel: usize = picks.iter().map(Vec::len).product();
        let pick_shape: Vec<usize> = picks.iter().map(Vec::len).collect();
        let mut data = Vec::with_capacity(numel);
        let mut index = vec![0usize; picks.len()];
        for _ in 0..numel {
            let offset: usize = index
                .iter()
                .enumerate()
                .map(|(axis, &i)| picks[axis][i] * strides[axis])
                .sum();
            data.push(self.data[offset]);
            advance(&mut index, &pick_shape);
        }

        Ok(Self {
            dtype: self.dtype,
            shape: out_shape,
            data,
        })
    }

    /// Elements in column-major (Fortran) order
    pub fn column_major(&self) -> Vec<f64> {
        if self.shape.len() < 2 {
            return self.data.clone();
        }
        let strides = row_major_strides(&self.shape);
        let mut index = vec![0usize; self.shape.len()];
        let mut out = Vec::with_capacity(self.data.len());
        for _ in 0..self.data.len() {
            let offset: usize = index.iter().zip(&strides).map(|(i, s)| i * s).sum();
            out.push(self.data[offset]);
            advance_column_major(&mut index, &self.shape);
        }
        out
    }

    pub fn from_column_major(dtype: DType, shape: Vec<usize>, values: &[f64]) -> CompileResult<Self> {
        let numel: usize = shape.iter().product();
        if numel != values.len() {
            return Err(CompileError::shape_mismatch(
                format!("{} elements", numel),
                format!("{} elements", values.len()),
            ));
        }
        if shape.len() < 2 {
            return Self::new(dtype, shape, values.to_vec());
        }
        let strides = row_major_strides(&shape);
        let mut data = vec![0.0; numel];
        let mut index = vec![0usize; shape.len()];
        for &value in values {
            let offset: usize = index.iter().zip(&strides).map(|(i, s)| i * s).sum();
            data[offset] = value;
            advance_column_major(&mut index, &shape);
        }
        Ok(Self::from_parts(dtype, shape, data))
    }

    /// Element-wise comparison within an absolute tolerance
    pub fn approx_eq(&self, other: &Tensor, tolerance: f64) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}

impl std::fmt::Display for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fmt_value = |v: f64| match self.dtype {
            DType::Bool => (v != 0.0).to_string(),
            DType::Int32 | DType::Int64 => format!("{}", v as i64),
            DType::Float32 | DType::Float64 => format!("{}", v),
        };
        if self.shape.is_empty() {
            return write!(f, "{}", fmt_value(self.data[0]));
        }
        let values: Vec<String> = self.data.iter().map(|&v| fmt_value(v)).collect();
        write!(f, "[{}] {:?}", values.join(", "), self.shape)
    }
}

/// Result shape of broadcasting `a` against `b`, if they are compatible
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

/// Indices selected by `start:stop:step` on an axis of length `len`
pub fn slice_indices(len: usize, start: Option<i64>, stop: Option<i64>, step: i64) -> Vec<usize> {
    let len = len as i64;
    let (lower, upper) = if step > 0 { (0, len) } else { (-1, len - 1) };
    let clamp = |v: i64| {
        if v < 0 {
            (v + len).max(lower)
        } else {
            v.min(upper)
        }
    };
    let start = start.map(clamp).unwrap_or(if step > 0 { lower } else { upper });
    let stop = stop.map(clamp).unwrap_or(if step > 0 { upper } else { lower });

    let mut out = Vec::new();
    let mut next = Some(start);
    while let Some(i) = next {
        if (step > 0 && i >= stop) || (step < 0 && i <= stop) {
            break;
        }
        out.push(i as usize);
        // steps past the i64 range end the slice
        next = i.checked_add(step);
    }
    out
}

/// Resolve a possibly negative index against an axis length
pub fn normalize_index(index: i64, len: usize) -> CompileResult<usize> {
    let n = len as i64;
    let resolved = if index < 0 { index + n } else { index };
    if resolved < 0 || resolved >= n {
        return Err(CompileError::index(format!(
            "index {} is out of bounds for axis with size {}",
            index, len
        )));
    }
    Ok(resolved as usize)
}

fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

fn broadcast_offset(index: &[usize], shape: &[usize]) -> usize {
    let skip = index.len() - shape.len();
    shape.iter().enumerate().fold(0, |offset, (k, &dim)| {
        let i = if dim == 1 { 0 } else { index[skip + k] };
        offset * dim + i
    })
}

fn advance(index: &mut [usize], shape: &[usize]) {
    for axis in (0..shape.len()).rev() {
        index[axis] += 1;
        if index[axis] < shape[axis] {
            return;
        }
        index[axis] = 0;
    }
}

fn advance_column_major(index: &mut [usize], shape: &[usize]) {
    for axis in 0..shape.len() {
        index[axis] += 1;
        if index[axis] < shape[axis] {
            return;
        }
        index[axis] = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn grid() -> Tensor {
        Tensor::new(DType::Float64, vec![3, 4], (0..12).map(|v| v as f64).collect()).unwrap()
    }

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(broadcast_shapes(&[3, 1], &[1, 4]), Some(vec![3, 4]));
        assert_eq!(broadcast_shapes(&[], &[2, 2]), Some(vec![2, 2]));
        assert_eq!(broadcast_shapes(&[3, 3], &[4, 4]), None);
    }

    #[test]
    fn test_zip_with_scalar() {
        let a = Tensor::vector(&[1.0, 2.0, 3.0]);
        let b = Tensor::scalar(2.0, DType::Float64);
        let c = a.zip_with(&b, DType::Float64, |x, y| x * y).unwrap();
        assert_eq!(c.data(), &[2.0, 4.0, 6.0]);
        assert_eq!(c.shape(), &[3]);
    }

    #[test]
    fn test_zip_with_outer_broadcast() {
        let col = Tensor::new(DType::Float64, vec![2, 1], vec![1.0, 2.0]).unwrap();
        let row = Tensor::new(DType::Float64, vec![1, 3], vec![10.0, 20.0, 30.0]).unwrap();
        let sum = col.zip_with(&row, DType::Float64, |x, y| x + y).unwrap();
        assert_eq!(sum.shape(), &[2, 3]);
        assert_eq!(sum.data(), &[11.0, 21.0, 31.0, 12.0, 22.0, 32.0]);
    }

    #[test]
    fn test_slice_indices_python_semantics() {
        assert_eq!(slice_indices(10, Some(0), Some(5), 1), vec![0, 1, 2, 3, 4]);
        assert_eq!(slice_indices(10, Some(-1), Some(0), -1), vec![9, 8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(slice_indices(10, None, None, -3), vec![9, 6, 3, 0]);
        assert_eq!(slice_indices(4, Some(10), None, 1), Vec::<usize>::new());
    }

    #[test]
    fn test_slice_indices_extreme_steps() {
        assert_eq!(slice_indices(5, Some(1), None, i64::MAX), vec![1]);
        assert_eq!(slice_indices(5, None, None, i64::MAX), vec![0]);
        assert_eq!(slice_indices(5, Some(3), None, i64::MIN), vec![3]);
        assert_eq!(slice_indices(5, None, None, i64::MIN + 1), vec![4]);
    }

    #[test]
    fn test_select_row_and_element() {
        let a = grid();
        let row = a.select(&[Selector::At(-1)]).unwrap();
        assert_eq!(row.shape(), &[4]);
        assert_eq!(row.data(), &[8.0, 9.0, 10.0, 11.0]);

        let element = a.select(&[Selector::At(1), Selector::At(2)]).unwrap();
        assert!(element.is_scalar());
        assert_eq!(element.item(), Some(6.0));
    }

    #[test]
    fn test_select_slice_on_second_axis() {
        let a = grid();
        let part = a
            .select(&[
                Selector::At(2),
                Selector::Slice {
                    start: Some(0),
                    stop: Some(-2),
                    step: 1,
                },
            ])
            .unwrap();
        assert_eq!(part.data(), &[8.0, 9.0]);
    }

    #[test]
    fn test_select_masks() {
        let v = Tensor::vector(&[-1.0, 2.0, -3.0, 4.0]);
        let positive = v
            .select(&[Selector::Mask(vec![false, true, false, true])])
            .unwrap();
        assert_eq!(positive.data(), &[2.0, 4.0]);

        let a = grid();
        let mask: Vec<bool> = a.data().iter().map(|&x| x > 8.0).collect();
        let flat = a.select(&[Selector::FlatMask(mask)]).unwrap();
        assert_eq!(flat.data(), &[9.0, 10.0, 11.0]);
    }

    #[test]
    fn test_select_out_of_bounds() {
        let v = Tensor::vector(&[1.0, 2.0]);
        let err = v.select(&[Selector::At(-3)]).unwrap_err();
        assert!(matches!(err, CompileError::IndexError { .. }));
    }

    #[test]
    fn test_column_major_round_trip() {
        let a = grid();
        let cm = a.column_major();
        assert_eq!(&cm[..4], &[0.0, 4.0, 8.0, 1.0]);
        let back = Tensor::from_column_major(DType::Float64, vec![3, 4], &cm).unwrap();
        assert_eq!(back, a);
    }
}
