//! # Distance Capability Set
//!
//! The graph engine is generic over [`DistanceInterface`]: a metric plus the
//! two facts the node layout needs from it — how many bytes a stored vector
//! occupies and how a caller-supplied vector is transformed before storage.
//! Both concrete metrics store the raw `f32` buffer verbatim; the transform
//! hook exists so a preprocessing metric (e.g. a normalizing cosine) can be
//! added without touching the engine.

use crate::simd;
use serde::{Deserialize, Serialize};

/// Metric identifier, used where a runtime tag is needed (the product
/// quantizer builds its lookup tables per metric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    /// Squared Euclidean distance.
    L2,
    /// One minus inner product. Callers unit-normalize their vectors when
    /// cosine semantics are wanted.
    Angular,
}

/// Capability set the engine requires of a metric.
pub trait DistanceInterface: Send + Sync + Clone + 'static {
    /// Distance between two stored vectors. Nonnegative for well-formed
    /// inputs; NaN propagates.
    fn distance(&self, x: &[f32], y: &[f32]) -> f32;

    /// Bytes one stored data region occupies.
    fn data_size(&self) -> usize;

    /// Write the storable form of `src` into `dst` (`data_size` bytes).
    fn transform_data(&self, dst: &mut [u8], src: &[f32]);

    /// Vector dimensionality.
    fn dim(&self) -> usize;
}

/// Squared-L2 metric over `dim`-dimensional vectors.
#[derive(Clone, Copy, Debug)]
pub struct SquaredL2 {
    dim: usize,
}

impl SquaredL2 {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl DistanceInterface for SquaredL2 {
    #[inline]
    fn distance(&self, x: &[f32], y: &[f32]) -> f32 {
        simd::l2_squared(x, y)
    }

    fn data_size(&self) -> usize {
        self.dim * std::mem::size_of::<f32>()
    }

    fn transform_data(&self, dst: &mut [u8], src: &[f32]) {
        debug_assert_eq!(src.len(), self.dim);
        dst.copy_from_slice(bytemuck::cast_slice(src));
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Angular metric: `1 - <x, y>` over `dim`-dimensional vectors.
#[derive(Clone, Copy, Debug)]
pub struct InnerProduct {
    dim: usize,
}

impl InnerProduct {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl DistanceInterface for InnerProduct {
    #[inline]
    fn distance(&self, x: &[f32], y: &[f32]) -> f32 {
        1.0 - simd::dot_product(x, y)
    }

    fn data_size(&self) -> usize {
        self.dim * std::mem::size_of::<f32>()
    }

    fn transform_data(&self, dst: &mut [u8], src: &[f32]) {
        debug_assert_eq!(src.len(), self.dim);
        dst.copy_from_slice(bytemuck::cast_slice(src));
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_semantics() {
        let d = SquaredL2::new(3);
        let x = [1.0, 2.0, 3.0];
        let y = [2.0, 4.0, 6.0];
        assert!((d.distance(&x, &y) - 14.0).abs() < 1e-5);
        assert_eq!(d.data_size(), 12);
        assert_eq!(d.dim(), 3);
    }

    #[test]
    fn test_angular_semantics() {
        let d = InnerProduct::new(2);
        // Identical unit vectors: distance 0.
        let x = [1.0, 0.0];
        assert!(d.distance(&x, &x).abs() < 1e-6);
        // Orthogonal unit vectors: distance 1.
        let y = [0.0, 1.0];
        assert!((d.distance(&x, &y) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_transform_roundtrip() {
        let d = SquaredL2::new(4);
        let src = [0.25f32, -1.5, 3.0, 0.0];
        let mut dst = vec![0u8; d.data_size()];
        d.transform_data(&mut dst, &src);
        let back: Vec<f32> = dst
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(back, src);
    }
}
