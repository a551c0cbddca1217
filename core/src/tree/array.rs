//! Dense `f64` arrays stored as leaves of a variable tree.
//!
//! Arrays are row-major with an explicit shape. A scalar has shape `[]` and
//! one element. On the wire a scalar is a bare JSON number and everything
//! else is `{"shape": [...], "data": [...]}`.

use serde::ser::Error as _;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::TreeError;

/// A row-major `f64` buffer with a shape.
///
/// Arrays built from external data must be finite. JSON has no encoding for
/// NaN or infinity, so serializing a non-finite array is an error rather
/// than a silent `null`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "ArrayRepr")]
pub struct Array {
    shape: Vec<usize>,
    data: Vec<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ArrayRepr {
    Scalar(f64),
    Tensor(TensorRepr),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TensorRepr {
    shape: Vec<usize>,
    data: Vec<f64>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ArrayReprRef<'a> {
    Scalar(f64),
    Tensor { shape: &'a [usize], data: &'a [f64] },
}

impl TryFrom<ArrayRepr> for Array {
    type Error = TreeError;

    fn try_from(repr: ArrayRepr) -> Result<Self, Self::Error> {
        match repr {
            ArrayRepr::Scalar(v) => Array::new(Vec::new(), vec![v]),
            ArrayRepr::Tensor(t) => Array::new(t.shape, t.data),
        }
    }
}

impl Serialize for Array {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !self.is_finite() {
            return Err(S::Error::custom(format!(
                "array of shape {:?} holds non-finite values",
                self.shape
            )));
        }
        let repr = if self.shape.is_empty() {
            ArrayReprRef::Scalar(self.data[0])
        } else {
            ArrayReprRef::Tensor {
                shape: &self.shape,
                data: &self.data,
            }
        };
        repr.serialize(serializer)
    }
}

impl Array {
    /// Build an array, checking that the data length matches the shape and
    /// that every element is finite.
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, TreeError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TreeError::InvalidArray(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        if let Some(bad) = data.iter().find(|x| !x.is_finite()) {
            return Err(TreeError::InvalidArray(format!(
                "non-finite element {} in array of shape {:?}",
                bad, shape
            )));
        }
        Ok(Array { shape, data })
    }

    /// Build an array whose length is known to match its shape.
    pub(crate) fn from_parts(shape: Vec<usize>, data: Vec<f64>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Array { shape, data }
    }

    pub fn scalar(value: f64) -> Self {
        Array {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    /// An array of the given shape filled with `value`.
    pub fn full(shape: &[usize], value: f64) -> Self {
        let n: usize = shape.iter().product();
        Array {
            shape: shape.to_vec(),
            data: vec![value; n],
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    /// Build a rank-2 array from equal-length rows.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, TreeError> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if let Some(bad) = rows.iter().find(|r| r.len() != cols) {
            return Err(TreeError::InvalidArray(format!(
                "ragged rows: expected {} columns, found {}",
                cols,
                bad.len()
            )));
        }
        let data = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Array::new(vec![rows.len(), cols], data)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The value of a scalar array, or `None` for any other shape.
    pub fn as_scalar(&self) -> Option<f64> {
        if self.shape.is_empty() {
            Some(self.data[0])
        } else {
            None
        }
    }

    /// Apply `f` to every element.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Array {
        Array {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    /// Combine two arrays of identical shape element by element.
    pub fn zip_map(&self, other: &Array, f: impl Fn(f64, f64) -> f64) -> Result<Array, TreeError> {
        self.expect_shape(other.shape())?;
        Ok(Array {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect(),
        })
    }

    /// Fail with `ShapeMismatch` unless this array has shape `expected`.
    pub fn expect_shape(&self, expected: &[usize]) -> Result<(), TreeError> {
        if self.shape != expected {
            return Err(TreeError::ShapeMismatch {
                expected: expected.to_vec(),
                found: self.shape.clone(),
            });
        }
        Ok(())
    }

    /// Largest absolute element-wise difference.
    pub fn max_abs_diff(&self, other: &Array) -> Result<f64, TreeError> {
        self.expect_shape(other.shape())?;
        Ok(self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max))
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Whether every element is finite.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    pub fn sum_squares(&self) -> f64 {
        self.data.iter().map(|x| x * x).sum()
    }

    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.sum() / self.data.len() as f64
    }

    // -------------------------------------------------------------------
    // Rank-2 helpers
    // -------------------------------------------------------------------

    /// `(rows, cols)` of a rank-2 array.
    pub fn dims2(&self) -> Result<(usize, usize), TreeError> {
        match self.shape.as_slice() {
            [r, c] => Ok((*r, *c)),
            _ => Err(TreeError::InvalidArray(format!(
                "expected a rank-2 array, found shape {:?}",
                self.shape
            ))),
        }
    }

    /// Column sums of a `[n, f]` array, shape `[f]`.
    pub fn sum_rows(&self) -> Result<Array, TreeError> {
        let (rows, cols) = self.dims2()?;
        let mut out = vec![0.0; cols];
        for r in 0..rows {
            for (c, acc) in out.iter_mut().enumerate() {
                *acc += self.data[r * cols + c];
            }
        }
        Ok(Array {
            shape: vec![cols],
            data: out,
        })
    }

    /// Column means of a `[n, f]` array, shape `[f]`.
    pub fn mean_rows(&self) -> Result<Array, TreeError> {
        let (rows, _) = self.dims2()?;
        let sums = self.sum_rows()?;
        let n = rows.max(1) as f64;
        Ok(sums.map(|s| s / n))
    }

    /// Biased column variances of a `[n, f]` array around `mean`.
    pub fn var_rows(&self, mean: &Array) -> Result<Array, TreeError> {
        let (rows, cols) = self.dims2()?;
        let centered = self.zip_rows(mean, |x, m| (x - m) * (x - m))?;
        let sums = centered.sum_rows()?;
        debug_assert_eq!(sums.len(), cols);
        let n = rows.max(1) as f64;
        Ok(sums.map(|s| s / n))
    }

    /// Combine every row of a `[n, f]` array with a `[f]` vector.
    pub fn zip_rows(&self, row: &Array, f: impl Fn(f64, f64) -> f64) -> Result<Array, TreeError> {
        let (_, cols) = self.dims2()?;
        row.expect_shape(&[cols])?;
        let data = self
            .data
            .iter()
            .enumerate()
            .map(|(i, &x)| f(x, row.data[i % cols]))
            .collect();
        Ok(Array {
            shape: self.shape.clone(),
            data,
        })
    }

    /// Matrix product of `[n, k]` and `[k, m]`.
    pub fn matmul(&self, other: &Array) -> Result<Array, TreeError> {
        let (n, k) = self.dims2()?;
        let (k2, m) = other.dims2()?;
        if k != k2 {
            return Err(TreeError::ShapeMismatch {
                expected: vec![k, m],
                found: other.shape.clone(),
            });
        }
        let mut out = vec![0.0; n * m];
        for i in 0..n {
            for p in 0..k {
                let a = self.data[i * k + p];
                if a == 0.0 {
                    continue;
                }
                for j in 0..m {
                    out[i * m + j] += a * other.data[p * m + j];
                }
            }
        }
        Ok(Array {
            shape: vec![n, m],
            data: out,
        })
    }

    pub fn transpose(&self) -> Result<Array, TreeError> {
        let (rows, cols) = self.dims2()?;
        let mut out = vec![0.0; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                out[c * rows + r] = self.data[r * cols + c];
            }
        }
        Ok(Array {
            shape: vec![cols, rows],
            data: out,
        })
    }
}

impl From<f64> for Array {
    fn from(value: f64) -> Self {
        Array::scalar(value)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
