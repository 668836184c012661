// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pure Rust tensor primitives with only lightweight external dependencies.
//!
//! A [`Tensor`] is a row-major matrix. Layers treat each row as one sample and
//! lay feature maps out plane by plane inside the row, so a batch of
//! `channels x height x width` activations has shape
//! `(batch, channels * height * width)`. Joining feature maps along the
//! channel axis is then a per-row column append ([`Tensor::cat_cols`]).

use core::fmt;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use sc_config::determinism;
use std::error::Error;
use std::sync::Arc;

/// Result alias used throughout the pure module.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor utilities and the layers built on them.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor or operator does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Branches merged at a junction disagree on their spatial extent.
    JunctionMismatch {
        junction: String,
        expected: (usize, usize),
        got: (usize, usize),
    },
    /// Computation received an empty input which would otherwise trigger a panic.
    EmptyInput(&'static str),
    /// Attempted to load or update a parameter that was missing from the state dict.
    MissingParameter { name: String },
    /// Wrapper around I/O failures when persisting or restoring tensors.
    IoError { message: String },
    /// Wrapper around serde failures when deserialising tensors.
    SerializationError { message: String },
    /// Numeric guard detected a non-finite value that would otherwise propagate NaNs.
    NonFiniteValue { label: &'static str, value: f32 },
    /// Generic configuration violation.
    InvalidValue { label: &'static str },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { rows, cols } => {
                write!(
                    f,
                    "invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={:?}, right={:?} cannot be combined",
                    left, right
                )
            }
            TensorError::JunctionMismatch {
                junction,
                expected,
                got,
            } => {
                write!(
                    f,
                    "junction '{junction}' expects every branch at {expected:?} but a branch produced {got:?}"
                )
            }
            TensorError::EmptyInput(label) => {
                write!(f, "{label} must not be empty for this computation")
            }
            TensorError::MissingParameter { name } => {
                write!(f, "missing parameter '{name}' while loading module state")
            }
            TensorError::IoError { message } => {
                write!(f, "i/o error while handling tensor data: {message}")
            }
            TensorError::SerializationError { message } => {
                write!(
                    f,
                    "serialization error while handling tensor data: {message}"
                )
            }
            TensorError::NonFiniteValue { label, value } => {
                write!(f, "non-finite value detected for {label}: {value}")
            }
            TensorError::InvalidValue { label } => {
                write!(f, "invalid value: {label}")
            }
        }
    }
}

impl Error for TensorError {}

/// A simple 2D tensor backed by a reference-counted row-major buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: Arc<Vec<f32>>,
    rows: usize,
    cols: usize,
}

impl Tensor {
    fn from_parts(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let expected = rows * cols;
        if expected != data.len() {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            data: Arc::new(data),
            rows,
            cols,
        })
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        Self::from_parts(rows, cols, vec![0.0; rows * cols])
    }

    /// Create a tensor from raw data. The provided vector must match
    /// `rows * cols` elements.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        Self::from_parts(rows, cols, data)
    }

    /// Construct a tensor by sampling a uniform distribution in `[min, max)`.
    ///
    /// When `seed` is provided the RNG becomes deterministic which makes tests
    /// and benchmarks reproducible. Otherwise the process-wide determinism
    /// settings decide between a derived seed and host entropy.
    pub fn random_uniform(
        rows: usize,
        cols: usize,
        min: f32,
        max: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let mut rng = determinism::rng_from_optional(seed, "sc-tensor/tensor/uniform");
        Self::random_uniform_with(rows, cols, min, max, &mut rng)
    }

    /// Samples a uniform distribution in `[min, max)` from a caller-owned RNG.
    pub fn random_uniform_with(
        rows: usize,
        cols: usize,
        min: f32,
        max: f32,
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if !(min < max) {
            return Err(TensorError::InvalidValue {
                label: "random_uniform_bounds",
            });
        }
        let distribution = Uniform::new(min, max);
        let data = (0..rows * cols)
            .map(|_| distribution.sample(rng))
            .collect::<Vec<f32>>();
        Self::from_parts(rows, cols, data)
    }

    /// Construct a tensor by sampling a normal distribution with the provided
    /// mean and standard deviation.
    pub fn random_normal(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if std <= 0.0 {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let mut rng = determinism::rng_from_optional(seed, "sc-tensor/tensor/normal");
        let mut data = Vec::with_capacity(rows * cols);
        for _ in 0..rows * cols {
            let sample: f64 = StandardNormal.sample(&mut rng);
            data.push(mean + std * sample as f32);
        }
        Self::from_parts(rows, cols, data)
    }

    /// Construct a tensor by applying a generator function to each coordinate.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self::from_parts(rows, cols, data)
    }

    /// Returns the `(rows, cols)` pair of the tensor.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Total number of elements stored in the tensor.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Tensors always hold at least one element; kept for API symmetry with `len`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a read-only view of the underlying buffer.
    pub fn data(&self) -> &[f32] {
        self.data.as_slice()
    }

    /// Returns a mutable view of the underlying buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Returns row `index` as a slice.
    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }

    /// Matrix multiplication (`self @ other`). Output rows are computed in parallel.
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let (inner, cols) = (self.cols, other.cols);
        let lhs = self.data();
        let rhs = other.data();
        let mut out = vec![0.0f32; self.rows * cols];
        let kernel = |(r, out_row): (usize, &mut [f32])| {
            let lhs_row = &lhs[r * inner..(r + 1) * inner];
            for (k, &a) in lhs_row.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                let rhs_row = &rhs[k * cols..(k + 1) * cols];
                for (o, &b) in out_row.iter_mut().zip(rhs_row.iter()) {
                    *o += a * b;
                }
            }
        };
        if determinism::lock_reduction_order() {
            out.chunks_mut(cols).enumerate().for_each(kernel);
        } else {
            out.par_chunks_mut(cols).enumerate().for_each(kernel);
        }
        Tensor::from_parts(self.rows, cols, out)
    }

    /// Add a scaled tensor to this tensor (`self += scale * other`).
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let data = Arc::make_mut(&mut self.data);
        for (a, b) in data.iter_mut().zip(other.data.iter()) {
            *a += scale * b;
        }
        Ok(())
    }

    /// Add the provided row vector to every row (`self[row] += bias`).
    pub fn add_row_inplace(&mut self, bias: &[f32]) -> PureResult<()> {
        if bias.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: bias.len(),
            });
        }
        let cols = self.cols;
        let data = Arc::make_mut(&mut self.data);
        for row in data.chunks_mut(cols) {
            for (value, b) in row.iter_mut().zip(bias.iter()) {
                *value += b;
            }
        }
        Ok(())
    }

    /// Apply the ReLU activation in-place (`self[i] = max(self[i], 0)`).
    pub fn relu_inplace(&mut self) {
        let data = Arc::make_mut(&mut self.data);
        for value in data.iter_mut() {
            if *value < 0.0 {
                *value = 0.0;
            }
        }
    }

    /// Returns the transpose of the tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0f32; self.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            data: Arc::new(data),
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Returns a tensor sharing the buffer under a new `(rows, cols)` view.
    pub fn reshape(&self, rows: usize, cols: usize) -> PureResult<Tensor> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if rows * cols != self.len() {
            return Err(TensorError::DataLength {
                expected: rows * cols,
                got: self.len(),
            });
        }
        Ok(Tensor {
            data: Arc::clone(&self.data),
            rows,
            cols,
        })
    }

    /// Returns the sum over rows for each column.
    pub fn sum_axis0(&self) -> Vec<f32> {
        let mut sums = vec![0.0; self.cols];
        for row in self.data.chunks(self.cols) {
            for (sum, value) in sums.iter_mut().zip(row.iter()) {
                *sum += value;
            }
        }
        sums
    }

    /// Concatenates tensors column-wise: row `r` of the result is row `r` of every
    /// input, in order. All inputs must share the row count.
    pub fn cat_cols(tensors: &[Tensor]) -> PureResult<Tensor> {
        if tensors.is_empty() {
            return Err(TensorError::EmptyInput("Tensor::cat_cols"));
        }
        let rows = tensors[0].rows;
        let mut total_cols = 0usize;
        for tensor in tensors {
            if tensor.rows != rows {
                return Err(TensorError::ShapeMismatch {
                    left: tensor.shape(),
                    right: (rows, tensor.cols),
                });
            }
            total_cols += tensor.cols;
        }
        let mut data = Vec::with_capacity(rows * total_cols);
        for r in 0..rows {
            for tensor in tensors {
                data.extend_from_slice(tensor.row(r));
            }
        }
        Tensor::from_parts(rows, total_cols, data)
    }

    /// Splits the columns into consecutive blocks of the given widths. Inverse of
    /// [`Tensor::cat_cols`].
    pub fn split_cols(&self, widths: &[usize]) -> PureResult<Vec<Tensor>> {
        if widths.is_empty() {
            return Err(TensorError::EmptyInput("Tensor::split_cols"));
        }
        let total: usize = widths.iter().sum();
        if total != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: total,
            });
        }
        let mut parts = Vec::with_capacity(widths.len());
        let mut start = 0usize;
        for &width in widths {
            parts.push(self.slice_cols(start, start + width)?);
            start += width;
        }
        Ok(parts)
    }

    /// Copies the column range `start..end` of every row.
    pub fn slice_cols(&self, start: usize, end: usize) -> PureResult<Tensor> {
        if start >= end || end > self.cols {
            return Err(TensorError::InvalidDimensions {
                rows: start,
                cols: end,
            });
        }
        let width = end - start;
        let mut data = Vec::with_capacity(self.rows * width);
        for r in 0..self.rows {
            data.extend_from_slice(&self.row(r)[start..end]);
        }
        Tensor::from_parts(self.rows, width, data)
    }

    /// Computes the squared L2 norm of the tensor.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_matches_manual_product() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::from_vec(3, 2, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), (2, 2));
        assert_eq!(c.data(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn matmul_rejects_inner_mismatch() {
        let a = Tensor::zeros(2, 3).unwrap();
        let b = Tensor::zeros(2, 2).unwrap();
        assert!(matches!(
            a.matmul(&b),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn cat_cols_interleaves_rows_and_split_recovers_parts() {
        let left = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let right = Tensor::from_vec(2, 1, vec![9.0, 8.0]).unwrap();
        let joined = Tensor::cat_cols(&[left.clone(), right.clone()]).unwrap();
        assert_eq!(joined.shape(), (2, 3));
        assert_eq!(joined.data(), &[1.0, 2.0, 9.0, 3.0, 4.0, 8.0]);
        let parts = joined.split_cols(&[2, 1]).unwrap();
        assert_eq!(parts[0], left);
        assert_eq!(parts[1], right);
    }

    #[test]
    fn cat_cols_requires_matching_rows() {
        let a = Tensor::zeros(2, 2).unwrap();
        let b = Tensor::zeros(3, 2).unwrap();
        assert!(Tensor::cat_cols(&[a, b]).is_err());
    }

    #[test]
    fn reshape_preserves_data_and_rejects_bad_volume() {
        let t = Tensor::from_fn(2, 6, |r, c| (r * 6 + c) as f32).unwrap();
        let r = t.reshape(4, 3).unwrap();
        assert_eq!(r.data(), t.data());
        assert!(t.reshape(5, 3).is_err());
    }

    #[test]
    fn seeded_uniform_is_reproducible_and_bounded() {
        let a = Tensor::random_uniform(4, 4, -0.5, 0.5, Some(3)).unwrap();
        let b = Tensor::random_uniform(4, 4, -0.5, 0.5, Some(3)).unwrap();
        assert_eq!(a, b);
        assert!(a.data().iter().all(|v| (-0.5..0.5).contains(v)));
    }

    #[test]
    fn zero_sized_tensors_are_rejected() {
        assert_eq!(
            Tensor::zeros(0, 3),
            Err(TensorError::InvalidDimensions { rows: 0, cols: 3 })
        );
    }
}
