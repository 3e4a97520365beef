//! # Centroid Trainer
//!
//! Lloyd's algorithm over flat `n x dim` buffers, used by the product
//! quantizer to fit each sub-codebook. Two initialization strategies:
//!
//! - `Uniform`: k distinct points sampled without replacement
//! - `PlusPlus`: D²-weighted seeding — each next centroid is drawn with
//!   probability proportional to a point's squared distance to its nearest
//!   already-chosen centroid
//!
//! The iteration count is fixed; there is no convergence test. Assignment
//! ties break toward the lowest-indexed centroid, and a centroid that
//! receives no points is zeroed.

use crate::simd;
use crate::FlatGraphError;
use rand::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Centroid initialization strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitStrategy {
    /// k distinct indices sampled uniformly without replacement.
    Uniform,
    /// D²-weighted seeding (k-means++).
    PlusPlus,
}

/// Configured k-means run. `train` returns a flat `k x dim` centroid buffer.
#[derive(Clone, Copy, Debug)]
pub struct CentroidTrainer {
    pub num_centroids: usize,
    pub iterations: usize,
    pub init: InitStrategy,
    pub seed: u64,
}

impl CentroidTrainer {
    pub fn new(num_centroids: usize, iterations: usize, init: InitStrategy, seed: u64) -> Self {
        Self {
            num_centroids,
            iterations,
            init,
            seed,
        }
    }

    /// Fit `num_centroids` centroids to `data` (row-major, `dim` floats per
    /// point). Rejects fewer points than centroids.
    pub fn train(&self, data: &[f32], dim: usize) -> Result<Vec<f32>, FlatGraphError> {
        if dim == 0 || data.len() % dim != 0 {
            return Err(FlatGraphError::Config(format!(
                "training data length {} is not a multiple of dimension {}",
                data.len(),
                dim
            )));
        }
        let n = data.len() / dim;
        let k = self.num_centroids;
        if n < k {
            return Err(FlatGraphError::Config(format!(
                "cannot fit {k} centroids to {n} points"
            )));
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut centroids = match self.init {
            InitStrategy::Uniform => init_uniform(data, dim, n, k, &mut rng),
            InitStrategy::PlusPlus => init_plus_plus(data, dim, n, k, &mut rng),
        };

        for _ in 0..self.iterations {
            // Assignment step, parallel across points.
            let assignment: Vec<u32> = data
                .par_chunks_exact(dim)
                .map(|point| nearest_centroid(point, &centroids, dim))
                .collect();

            // Update step: mean of assigned points, zeros for empty clusters.
            let mut sums = vec![0.0f64; k * dim];
            let mut counts = vec![0u64; k];
            for (point, &c) in data.chunks_exact(dim).zip(assignment.iter()) {
                let c = c as usize;
                counts[c] += 1;
                for (j, &v) in point.iter().enumerate() {
                    sums[c * dim + j] += v as f64;
                }
            }
            for c in 0..k {
                if counts[c] > 0 {
                    for j in 0..dim {
                        centroids[c * dim + j] = (sums[c * dim + j] / counts[c] as f64) as f32;
                    }
                } else {
                    centroids[c * dim..(c + 1) * dim].fill(0.0);
                }
            }
        }

        Ok(centroids)
    }
}

/// Index of the nearest centroid by squared-L2, lowest index on ties.
#[inline]
fn nearest_centroid(point: &[f32], centroids: &[f32], dim: usize) -> u32 {
    let mut best = 0u32;
    let mut best_dist = f32::MAX;
    for (c, centroid) in centroids.chunks_exact(dim).enumerate() {
        let d = simd::l2_squared(point, centroid);
        if d < best_dist {
            best_dist = d;
            best = c as u32;
        }
    }
    best
}

fn init_uniform(data: &[f32], dim: usize, n: usize, k: usize, rng: &mut StdRng) -> Vec<f32> {
    let mut centroids = Vec::with_capacity(k * dim);
    for picked in rand::seq::index::sample(rng, n, k).into_iter() {
        centroids.extend_from_slice(&data[picked * dim..(picked + 1) * dim]);
    }
    centroids
}

fn init_plus_plus(data: &[f32], dim: usize, n: usize, k: usize, rng: &mut StdRng) -> Vec<f32> {
    let mut centroids = Vec::with_capacity(k * dim);

    let first = rng.gen_range(0..n);
    centroids.extend_from_slice(&data[first * dim..(first + 1) * dim]);

    // Squared distance from each point to its nearest chosen centroid,
    // maintained incrementally as centroids are added.
    let mut min_sq_dist: Vec<f64> = data
        .chunks_exact(dim)
        .map(|point| simd::l2_squared(point, &centroids[..dim]) as f64)
        .collect();

    for _ in 1..k {
        let total: f64 = min_sq_dist.iter().sum();
        let next = if total > 0.0 {
            let threshold = rng.gen::<f64>() * total;
            let mut cumsum = 0.0;
            let mut picked = n - 1;
            for (i, &w) in min_sq_dist.iter().enumerate() {
                cumsum += w;
                if cumsum >= threshold {
                    picked = i;
                    break;
                }
            }
            picked
        } else {
            // Every point sits on a chosen centroid already.
            rng.gen_range(0..n)
        };

        let start = centroids.len();
        centroids.extend_from_slice(&data[next * dim..(next + 1) * dim]);
        let newest = &centroids[start..start + dim];
        for (i, point) in data.chunks_exact(dim).enumerate() {
            let d = simd::l2_squared(point, newest) as f64;
            if d < min_sq_dist[i] {
                min_sq_dist[i] = d;
            }
        }
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_data(n: usize, dim: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * dim).map(|_| rng.gen::<f32>()).collect()
    }

    fn sse(data: &[f32], centroids: &[f32], dim: usize) -> f64 {
        data.chunks_exact(dim)
            .map(|point| {
                centroids
                    .chunks_exact(dim)
                    .map(|c| simd::l2_squared(point, c) as f64)
                    .fold(f64::MAX, f64::min)
            })
            .sum()
    }

    #[test]
    fn test_rejects_too_few_points() {
        let data = random_data(5, 4, 1);
        let trainer = CentroidTrainer::new(8, 5, InitStrategy::Uniform, 1);
        assert!(trainer.train(&data, 4).is_err());
    }

    #[test]
    fn test_rejects_ragged_data() {
        let data = vec![0.0f32; 10];
        let trainer = CentroidTrainer::new(2, 5, InitStrategy::Uniform, 1);
        assert!(trainer.train(&data, 3).is_err());
    }

    #[test]
    fn test_output_shape() {
        let data = random_data(200, 8, 7);
        let trainer = CentroidTrainer::new(16, 10, InitStrategy::Uniform, 7);
        let centroids = trainer.train(&data, 8).unwrap();
        assert_eq!(centroids.len(), 16 * 8);
    }

    #[test]
    fn test_seeded_determinism() {
        let data = random_data(300, 6, 11);
        let trainer = CentroidTrainer::new(8, 10, InitStrategy::PlusPlus, 42);
        let a = trainer.train(&data, 6).unwrap();
        let b = trainer.train(&data, 6).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_lloyd_iteration_does_not_increase_sse() {
        let data = random_data(500, 4, 3);
        // Compare error after i vs i+1 iterations from identical init.
        for iters in [1usize, 3, 7] {
            let before = CentroidTrainer::new(10, iters, InitStrategy::Uniform, 9)
                .train(&data, 4)
                .unwrap();
            let after = CentroidTrainer::new(10, iters + 1, InitStrategy::Uniform, 9)
                .train(&data, 4)
                .unwrap();
            let err_before = sse(&data, &before, 4);
            let err_after = sse(&data, &after, 4);
            assert!(
                err_after <= err_before * (1.0 + 1e-5),
                "SSE rose from {err_before} to {err_after} at iteration {iters}"
            );
        }
    }

    #[test]
    fn test_separated_clusters_recovered() {
        // Three well-separated blobs; after training, each blob center should
        // be close to some centroid.
        let mut data = Vec::new();
        let mut rng = StdRng::seed_from_u64(17);
        let centers = [[0.0f32, 0.0], [10.0, 10.0], [-10.0, 5.0]];
        for center in &centers {
            for _ in 0..50 {
                data.push(center[0] + rng.gen::<f32>() * 0.1);
                data.push(center[1] + rng.gen::<f32>() * 0.1);
            }
        }

        let trainer = CentroidTrainer::new(3, 15, InitStrategy::PlusPlus, 5);
        let centroids = trainer.train(&data, 2).unwrap();

        for center in &centers {
            let closest = centroids
                .chunks_exact(2)
                .map(|c| simd::l2_squared(center, c))
                .fold(f32::MAX, f32::min);
            assert!(closest < 1.0, "no centroid near {center:?} (d²={closest})");
        }
    }

    #[test]
    fn test_uniform_init_distinct_points() {
        // k == n forces every point to be chosen exactly once.
        let data: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let trainer = CentroidTrainer::new(6, 0, InitStrategy::Uniform, 23);
        let centroids = trainer.train(&data, 2).unwrap();
        // Compare as multisets of points.
        let mut got: Vec<(u32, u32)> = centroids
            .chunks_exact(2)
            .map(|c| (c[0].to_bits(), c[1].to_bits()))
            .collect();
        let mut want: Vec<(u32, u32)> = data
            .chunks_exact(2)
            .map(|c| (c[0].to_bits(), c[1].to_bits()))
            .collect();
        got.sort_unstable();
        want.sort_unstable();
        assert_eq!(got, want);
    }
}
