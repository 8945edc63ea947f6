//! Tensor shapes and indices.

use crate::error::{LowerError, Result};

/// An ordered sequence of positive dimension sizes. Shapes are immutable once
/// built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Shape(Vec<u32>);

impl Shape {
    /// Build a shape, rejecting zero-sized dimensions.
    pub fn new(dims: Vec<u32>) -> Result<Self> {
        if dims.iter().any(|&d| d == 0) {
            return Err(LowerError::numeric(
                "shape dimension size",
                "every dimension size must be positive",
            ));
        }
        Ok(Shape(dims))
    }

    /// The per-dimension sizes, outermost first.
    pub fn dims(&self) -> &[u32] {
        &self.0
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of scalar values this shape describes (product of sizes).
    pub fn value_count(&self) -> u64 {
        self.0.iter().map(|&d| d as u64).product()
    }

    /// `ceil(log2(dim_size))` for dimension `dim`.
    pub fn bits_for_dim(&self, dim: usize) -> u32 {
        let size = self.0[dim];
        bits_to_represent(size)
    }

    /// Total bits needed to address every dimension independently:
    /// `sum(ceil(log2(dim_size)))`.
    pub fn total_index_bits(&self) -> u32 {
        (0..self.rank()).map(|d| self.bits_for_dim(d)).sum()
    }
}

/// Smallest `b` such that `2^b >= n` (for `n >= 1`; `n == 1` needs zero bits).
pub fn bits_to_represent(n: u32) -> u32 {
    if n <= 1 {
        0
    } else {
        32 - (n - 1).leading_zeros()
    }
}

/// A shape together with per-dimension coordinates in range. Supports a
/// bijective flat (row-major) encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorIndex {
    shape: Shape,
    coords: Vec<u32>,
}

impl TensorIndex {
    /// Build a tensor index, validating rank match and per-dimension bounds.
    pub fn new(shape: Shape, coords: Vec<u32>) -> Result<Self> {
        if coords.len() != shape.rank() {
            return Err(LowerError::numeric(
                "tensor index rank",
                format!("expected {} coordinates, got {}", shape.rank(), coords.len()),
            ));
        }
        for (d, (&c, &size)) in coords.iter().zip(shape.dims()).enumerate() {
            if c >= size {
                return Err(LowerError::numeric(
                    "tensor index bound",
                    format!("coordinate {c} out of range for dimension {d} of size {size}"),
                ));
            }
        }
        Ok(TensorIndex { shape, coords })
    }

    /// The shape this index is valid within.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Per-dimension coordinates.
    pub fn coords(&self) -> &[u32] {
        &self.coords
    }

    /// Row-major flat encoding: `sum(coord[d] * stride[d])` where
    /// `stride[d] = product(size[d+1..])`.
    pub fn flat(&self) -> u64 {
        let mut acc: u64 = 0;
        for (&c, &size) in self.coords.iter().zip(self.shape.dims()) {
            acc = acc * size as u64 + c as u64;
        }
        acc
    }

    /// Inverse of [`TensorIndex::flat`].
    pub fn from_flat(shape: Shape, mut flat: u64) -> Result<Self> {
        if flat >= shape.value_count() {
            return Err(LowerError::numeric(
                "tensor index flat bound",
                format!("flat index {flat} out of range for shape with {} values", shape.value_count()),
            ));
        }
        let mut coords = vec![0u32; shape.rank()];
        for d in (0..shape.rank()).rev() {
            let size = shape.dims()[d] as u64;
            coords[d] = (flat % size) as u32;
            flat /= size;
        }
        TensorIndex::new(shape, coords)
    }
}

/// A signed per-dimension offset with cyclic-add (wraparound) semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffTensorIndex {
    shape: Shape,
    deltas: Vec<i64>,
}

impl DiffTensorIndex {
    /// Build a diff index for `shape`.
    pub fn new(shape: Shape, deltas: Vec<i64>) -> Result<Self> {
        if deltas.len() != shape.rank() {
            return Err(LowerError::numeric(
                "diff tensor index rank",
                format!("expected {} deltas, got {}", shape.rank(), deltas.len()),
            ));
        }
        Ok(DiffTensorIndex { shape, deltas })
    }

    /// Apply this offset to `idx`, wrapping each coordinate modulo its
    /// dimension size.
    pub fn apply(&self, idx: &TensorIndex) -> Result<TensorIndex> {
        if idx.shape() != &self.shape {
            return Err(LowerError::numeric(
                "diff tensor index shape",
                "diff index shape does not match target index shape",
            ));
        }
        let mut coords = Vec::with_capacity(self.shape.rank());
        for ((&c, &delta), &size) in idx.coords().iter().zip(&self.deltas).zip(self.shape.dims()) {
            let size = size as i64;
            let wrapped = ((c as i64 + delta) % size + size) % size;
            coords.push(wrapped as u32);
        }
        TensorIndex::new(self.shape.clone(), coords)
    }
}
