//! # Product Quantization
//!
//! Compresses a D-dimensional vector by slicing it into M subvectors and
//! replacing each slice with the index of its nearest entry in a per-slice
//! codebook. With 8-bit codes a 128-dim float vector (512 bytes) shrinks to
//! 8 bytes.
//!
//! Two distance modes back graph traversal:
//!
//! - **Asymmetric** (query → code): a per-query table of query-slice to
//!   centroid distances is built once, after which each code costs M table
//!   lookups.
//! - **Symmetric** (code → code): per-codebook pairwise tables are computed
//!   at training time; a code pair costs M lookups with no float math.
//!
//! ## Usage
//!
//! ```no_run
//! use flatgraph::{Metric, PqConfig, ProductQuantizer};
//!
//! let vectors: Vec<f32> = vec![0.0; 1000 * 64];
//! let mut pq = ProductQuantizer::new(PqConfig::default(), 64, Metric::L2).unwrap();
//! pq.train(&vectors).unwrap();
//!
//! let code = pq.encode(&vectors[..64]).unwrap();
//! let table = pq.query_table(&vectors[..64]).unwrap();
//! let dist = table.distance(&code);
//! # let _ = dist;
//! ```

use crate::distance::Metric;
use crate::kmeans::{CentroidTrainer, InitStrategy};
use crate::simd;
use crate::FlatGraphError;
use rand::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Training knobs for a [`ProductQuantizer`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PqConfig {
    /// Number of subquantizers M; the vector dimension must be divisible by it.
    pub num_subquantizers: usize,
    /// Bits per code symbol (alphabet size 2^bits, at most 8).
    pub bits: u32,
    /// Lloyd iterations per sub-codebook.
    pub train_iterations: usize,
    /// Centroid initialization strategy.
    pub init: InitStrategy,
    /// Cap on the number of vectors used for training (0 = use all).
    pub training_sample_size: usize,
    /// RNG seed for sampling and initialization.
    pub seed: u64,
}

impl Default for PqConfig {
    fn default() -> Self {
        Self {
            num_subquantizers: 8,
            bits: 8,
            train_iterations: 20,
            init: InitStrategy::Uniform,
            training_sample_size: 50_000,
            seed: 3333,
        }
    }
}

/// Product quantizer: M sub-codebooks over slices of a D-dimensional vector.
///
/// Construct with [`ProductQuantizer::new`], then [`train`](Self::train)
/// before encoding; encoding or table construction on an untrained quantizer
/// is a configuration error.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProductQuantizer {
    dim: usize,
    subdim: usize,
    metric: Metric,
    config: PqConfig,
    /// Flattened `[M][K][subdim]` codebooks.
    codebooks: Vec<f32>,
    /// Flattened `[M][K][K]` code-to-code slice distances.
    pair_tables: Vec<f32>,
    trained: bool,
}

/// Per-query lookup table: slice distances from one query to every codebook
/// entry. `distance` is M lookups per code.
pub struct QueryTable {
    entries: Vec<f32>,
    num_centroids: usize,
    /// 1.0 for the angular metric (distance is one minus the summed products),
    /// 0.0 for L2.
    offset: f32,
}

impl QueryTable {
    /// Asymmetric distance from the table's query to `code`.
    #[inline]
    pub fn distance(&self, code: &[u8]) -> f32 {
        let mut sum = 0.0f32;
        for (m, &symbol) in code.iter().enumerate() {
            sum += self.entries[m * self.num_centroids + symbol as usize];
        }
        self.offset + sum
    }
}

impl ProductQuantizer {
    /// Create an untrained quantizer for `dim`-dimensional vectors.
    pub fn new(config: PqConfig, dim: usize, metric: Metric) -> Result<Self, FlatGraphError> {
        if config.num_subquantizers == 0 || dim % config.num_subquantizers != 0 {
            return Err(FlatGraphError::Config(format!(
                "dimension {} is not divisible by {} subquantizers",
                dim, config.num_subquantizers
            )));
        }
        if config.bits == 0 || config.bits > 8 {
            return Err(FlatGraphError::Config(format!(
                "bits per code symbol must be in 1..=8, got {}",
                config.bits
            )));
        }
        Ok(Self {
            dim,
            subdim: dim / config.num_subquantizers,
            metric,
            config,
            codebooks: Vec::new(),
            pair_tables: Vec::new(),
            trained: false,
        })
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Code size in bytes (one byte per subquantizer).
    pub fn code_size(&self) -> usize {
        self.config.num_subquantizers
    }

    fn num_centroids(&self) -> usize {
        1usize << self.config.bits
    }

    /// Fit the sub-codebooks to `vectors` (row-major, `dim` floats per row)
    /// and precompute the symmetric pair tables.
    pub fn train(&mut self, vectors: &[f32]) -> Result<(), FlatGraphError> {
        if vectors.is_empty() || vectors.len() % self.dim != 0 {
            return Err(FlatGraphError::Config(format!(
                "training data length {} is not a multiple of dimension {}",
                vectors.len(),
                self.dim
            )));
        }
        let n = vectors.len() / self.dim;
        let k = self.num_centroids();

        // Optional subsample before slicing.
        let sample_size = self.config.training_sample_size;
        let sampled: Vec<f32>;
        let (training, n_train) = if sample_size > 0 && n > sample_size {
            let mut rng = StdRng::seed_from_u64(self.config.seed);
            let mut picked = rand::seq::index::sample(&mut rng, n, sample_size).into_vec();
            picked.sort_unstable();
            sampled = picked
                .iter()
                .flat_map(|&i| vectors[i * self.dim..(i + 1) * self.dim].iter().copied())
                .collect();
            (sampled.as_slice(), sample_size)
        } else {
            (vectors, n)
        };

        let m_count = self.config.num_subquantizers;
        let subdim = self.subdim;
        let started = std::time::Instant::now();

        let codebooks_per_sub: Vec<Vec<f32>> = (0..m_count)
            .into_par_iter()
            .map(|m| {
                let start = m * subdim;
                let mut slice_data = Vec::with_capacity(n_train * subdim);
                for row in training.chunks_exact(self.dim) {
                    slice_data.extend_from_slice(&row[start..start + subdim]);
                }
                let trainer = CentroidTrainer::new(
                    k,
                    self.config.train_iterations,
                    self.config.init,
                    self.config.seed.wrapping_add(m as u64),
                );
                trainer.train(&slice_data, subdim)
            })
            .collect::<Result<_, _>>()?;

        let mut codebooks = Vec::with_capacity(m_count * k * subdim);
        for cb in &codebooks_per_sub {
            codebooks.extend_from_slice(cb);
        }
        self.codebooks = codebooks;
        self.pair_tables = self.build_pair_tables();
        self.trained = true;

        tracing::debug!(
            subquantizers = m_count,
            centroids = k,
            points = n_train,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "trained product quantizer"
        );
        Ok(())
    }

    /// Pairwise slice distances between all codebook entries, per subquantizer.
    fn build_pair_tables(&self) -> Vec<f32> {
        let k = self.num_centroids();
        let m_count = self.config.num_subquantizers;
        (0..m_count)
            .into_par_iter()
            .flat_map_iter(|m| {
                let mut table = Vec::with_capacity(k * k);
                for a in 0..k {
                    let ca = self.centroid(m, a);
                    for b in 0..k {
                        let cb = self.centroid(m, b);
                        let d = match self.metric {
                            Metric::L2 => simd::l2_squared(ca, cb),
                            Metric::Angular => -simd::dot_product(ca, cb),
                        };
                        table.push(d);
                    }
                }
                table
            })
            .collect()
    }

    #[inline]
    fn centroid(&self, m: usize, c: usize) -> &[f32] {
        let k = self.num_centroids();
        let offset = (m * k + c) * self.subdim;
        &self.codebooks[offset..offset + self.subdim]
    }

    fn check_trained(&self) -> Result<(), FlatGraphError> {
        if self.trained {
            Ok(())
        } else {
            Err(FlatGraphError::Config(
                "product quantizer must be trained first".into(),
            ))
        }
    }

    fn check_dim(&self, len: usize) -> Result<(), FlatGraphError> {
        if len == self.dim {
            Ok(())
        } else {
            Err(FlatGraphError::Config(format!(
                "vector has dimension {len}, quantizer expects {}",
                self.dim
            )))
        }
    }

    /// Encode `vector` into `dst` (`code_size` bytes): per slice, the index
    /// of the nearest codebook entry by squared-L2.
    pub fn encode_into(&self, vector: &[f32], dst: &mut [u8]) -> Result<(), FlatGraphError> {
        self.check_trained()?;
        self.check_dim(vector.len())?;
        debug_assert_eq!(dst.len(), self.code_size());

        let k = self.num_centroids();
        for (m, slice) in vector.chunks_exact(self.subdim).enumerate() {
            let mut best = 0u8;
            let mut best_dist = f32::MAX;
            for c in 0..k {
                let d = simd::l2_squared(slice, self.centroid(m, c));
                if d < best_dist {
                    best_dist = d;
                    best = c as u8;
                }
            }
            dst[m] = best;
        }
        Ok(())
    }

    /// Encode `vector`, returning the code.
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>, FlatGraphError> {
        let mut code = vec![0u8; self.code_size()];
        self.encode_into(vector, &mut code)?;
        Ok(code)
    }

    /// Encode many vectors in parallel (row-major input).
    pub fn encode_batch(&self, vectors: &[f32]) -> Result<Vec<Vec<u8>>, FlatGraphError> {
        self.check_trained()?;
        if vectors.len() % self.dim != 0 {
            return Err(FlatGraphError::Config(format!(
                "batch length {} is not a multiple of dimension {}",
                vectors.len(),
                self.dim
            )));
        }
        vectors
            .par_chunks_exact(self.dim)
            .map(|v| self.encode(v))
            .collect()
    }

    /// Build the per-query lookup table used for asymmetric distances.
    pub fn query_table(&self, query: &[f32]) -> Result<QueryTable, FlatGraphError> {
        self.check_trained()?;
        self.check_dim(query.len())?;

        let k = self.num_centroids();
        let mut entries = Vec::with_capacity(self.config.num_subquantizers * k);
        for (m, slice) in query.chunks_exact(self.subdim).enumerate() {
            for c in 0..k {
                let centroid = self.centroid(m, c);
                let d = match self.metric {
                    Metric::L2 => simd::l2_squared(slice, centroid),
                    Metric::Angular => -simd::dot_product(slice, centroid),
                };
                entries.push(d);
            }
        }
        Ok(QueryTable {
            entries,
            num_centroids: k,
            offset: match self.metric {
                Metric::L2 => 0.0,
                Metric::Angular => 1.0,
            },
        })
    }

    /// Asymmetric distance computed directly, without a table. Matches
    /// [`QueryTable::distance`] for the same inputs.
    pub fn asymmetric_distance(&self, query: &[f32], code: &[u8]) -> Result<f32, FlatGraphError> {
        self.check_trained()?;
        self.check_dim(query.len())?;

        let mut sum = 0.0f32;
        for (m, slice) in query.chunks_exact(self.subdim).enumerate() {
            let centroid = self.centroid(m, code[m] as usize);
            sum += match self.metric {
                Metric::L2 => simd::l2_squared(slice, centroid),
                Metric::Angular => -simd::dot_product(slice, centroid),
            };
        }
        Ok(match self.metric {
            Metric::L2 => sum,
            Metric::Angular => 1.0 + sum,
        })
    }

    /// Symmetric code-to-code distance from the precomputed pair tables.
    #[inline]
    pub fn symmetric_distance(&self, code1: &[u8], code2: &[u8]) -> f32 {
        debug_assert!(self.trained);
        let k = self.num_centroids();
        let mut sum = 0.0f32;
        for m in 0..code1.len() {
            sum += self.pair_tables[m * k * k + code1[m] as usize * k + code2[m] as usize];
        }
        sum
    }

    /// Reconstruct the approximate vector a code stands for.
    pub fn decode(&self, code: &[u8]) -> Result<Vec<f32>, FlatGraphError> {
        self.check_trained()?;
        let mut vector = Vec::with_capacity(self.dim);
        for (m, &symbol) in code.iter().enumerate() {
            vector.extend_from_slice(self.centroid(m, symbol as usize));
        }
        Ok(vector)
    }

    /// Persist the quantizer (codebooks and pair tables included).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), FlatGraphError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| FlatGraphError::Io {
            path: path.display().to_string(),
            source,
        })?;
        bincode::serialize_into(BufWriter::new(file), self)?;
        tracing::debug!(path = %path.display(), "saved product quantizer");
        Ok(())
    }

    /// Load a quantizer previously written by [`save`](Self::save).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FlatGraphError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| FlatGraphError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let pq: Self = bincode::deserialize_from(BufReader::new(file))?;
        Ok(pq)
    }

    pub fn stats(&self) -> PqStats {
        PqStats {
            dim: self.dim,
            num_subquantizers: self.config.num_subquantizers,
            num_centroids: self.num_centroids(),
            subdim: self.subdim,
            code_size_bytes: self.code_size(),
            codebook_size_bytes: self.codebooks.len() * std::mem::size_of::<f32>(),
            pair_table_size_bytes: self.pair_tables.len() * std::mem::size_of::<f32>(),
            compression_ratio: (self.dim * std::mem::size_of::<f32>()) as f32
                / self.code_size() as f32,
        }
    }
}

/// Size and shape summary for a trained quantizer.
#[derive(Debug, Clone)]
pub struct PqStats {
    pub dim: usize,
    pub num_subquantizers: usize,
    pub num_centroids: usize,
    pub subdim: usize,
    pub code_size_bytes: usize,
    pub codebook_size_bytes: usize,
    pub pair_table_size_bytes: usize,
    pub compression_ratio: f32,
}

impl std::fmt::Display for PqStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Product Quantizer")?;
        writeln!(f, "  dimension: {}", self.dim)?;
        writeln!(f, "  subquantizers (M): {}", self.num_subquantizers)?;
        writeln!(f, "  centroids per subquantizer: {}", self.num_centroids)?;
        writeln!(f, "  subvector dimension: {}", self.subdim)?;
        writeln!(f, "  code size: {} bytes", self.code_size_bytes)?;
        writeln!(f, "  codebooks: {} bytes", self.codebook_size_bytes)?;
        writeln!(f, "  pair tables: {} bytes", self.pair_table_size_bytes)?;
        write!(f, "  compression: {:.1}x", self.compression_ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * dim).map(|_| rng.gen::<f32>()).collect()
    }

    fn small_config() -> PqConfig {
        PqConfig {
            num_subquantizers: 4,
            bits: 6,
            train_iterations: 10,
            init: InitStrategy::Uniform,
            training_sample_size: 0,
            seed: 42,
        }
    }

    #[test]
    fn test_rejects_indivisible_dim() {
        let config = PqConfig {
            num_subquantizers: 5,
            ..small_config()
        };
        assert!(ProductQuantizer::new(config, 32, Metric::L2).is_err());
    }

    #[test]
    fn test_rejects_encode_before_training() {
        let pq = ProductQuantizer::new(small_config(), 32, Metric::L2).unwrap();
        assert!(!pq.is_trained());
        assert!(pq.encode(&vec![0.0; 32]).is_err());
        assert!(pq.query_table(&vec![0.0; 32]).is_err());
    }

    #[test]
    fn test_rejects_dimension_mismatch() {
        let vectors = random_vectors(400, 32, 1);
        let mut pq = ProductQuantizer::new(small_config(), 32, Metric::L2).unwrap();
        pq.train(&vectors).unwrap();
        assert!(pq.encode(&vec![0.0; 16]).is_err());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let vectors = random_vectors(1000, 32, 7);
        let mut pq = ProductQuantizer::new(small_config(), 32, Metric::L2).unwrap();
        pq.train(&vectors).unwrap();

        let original = &vectors[..32];
        let code = pq.encode(original).unwrap();
        assert_eq!(code.len(), 4);
        let decoded = pq.decode(&code).unwrap();
        assert_eq!(decoded.len(), 32);

        let err = simd::l2_squared(original, &decoded);
        assert!(err < 32.0 * 0.1, "reconstruction error too high: {err}");
    }

    #[test]
    fn test_table_matches_direct_asymmetric() {
        let vectors = random_vectors(500, 32, 123);
        let mut pq = ProductQuantizer::new(small_config(), 32, Metric::L2).unwrap();
        pq.train(&vectors).unwrap();

        let query = &vectors[..32];
        let table = pq.query_table(query).unwrap();

        for row in vectors.chunks_exact(32).take(20) {
            let code = pq.encode(row).unwrap();
            let direct = pq.asymmetric_distance(query, &code).unwrap();
            let via_table = table.distance(&code);
            assert!(
                (direct - via_table).abs() < 1e-5,
                "direct={direct}, table={via_table}"
            );
        }
    }

    #[test]
    fn test_asymmetric_matches_per_slice_sums() {
        // The table value must equal the sum of per-slice squared distances
        // between the query and the decoded centroids.
        let vectors = random_vectors(500, 16, 99);
        let mut pq = ProductQuantizer::new(
            PqConfig {
                num_subquantizers: 4,
                ..small_config()
            },
            16,
            Metric::L2,
        )
        .unwrap();
        pq.train(&vectors).unwrap();

        let query = &vectors[..16];
        for row in vectors.chunks_exact(16).skip(1).take(10) {
            let code = pq.encode(row).unwrap();
            let decoded = pq.decode(&code).unwrap();
            let expected: f32 = query
                .chunks_exact(4)
                .zip(decoded.chunks_exact(4))
                .map(|(q, c)| simd::l2_squared(q, c))
                .sum();
            let got = pq.asymmetric_distance(query, &code).unwrap();
            assert!((got - expected).abs() < 1e-4, "got={got}, want={expected}");
        }
    }

    #[test]
    fn test_symmetric_distance_consistency() {
        // Symmetric distance must equal the distance between decoded vectors.
        let vectors = random_vectors(600, 32, 31);
        let mut pq = ProductQuantizer::new(small_config(), 32, Metric::L2).unwrap();
        pq.train(&vectors).unwrap();

        let code1 = pq.encode(&vectors[..32]).unwrap();
        let code2 = pq.encode(&vectors[32..64]).unwrap();
        let d1 = pq.decode(&code1).unwrap();
        let d2 = pq.decode(&code2).unwrap();

        let expected = simd::l2_squared(&d1, &d2);
        let got = pq.symmetric_distance(&code1, &code2);
        assert!((got - expected).abs() < 1e-4, "got={got}, want={expected}");
    }

    #[test]
    fn test_angular_tables() {
        let mut rng = StdRng::seed_from_u64(8);
        // Unit-normalized rows.
        let vectors: Vec<f32> = (0..400)
            .flat_map(|_| {
                let v: Vec<f32> = (0..16).map(|_| rng.gen::<f32>() - 0.5).collect();
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                v.into_iter().map(move |x| x / norm).collect::<Vec<_>>()
            })
            .collect();

        let mut pq = ProductQuantizer::new(
            PqConfig {
                num_subquantizers: 4,
                ..small_config()
            },
            16,
            Metric::Angular,
        )
        .unwrap();
        pq.train(&vectors).unwrap();

        let query = &vectors[..16];
        let code = pq.encode(&vectors[16..32]).unwrap();
        let decoded = pq.decode(&code).unwrap();

        let expected = 1.0 - simd::dot_product(query, &decoded);
        let got = pq.asymmetric_distance(query, &code).unwrap();
        assert!((got - expected).abs() < 1e-4, "got={got}, want={expected}");
    }

    #[test]
    fn test_mean_relative_error_bounded() {
        // Gaussian-ish data; the asymmetric estimate should track the true
        // squared-L2 within a 20% mean relative error.
        let mut rng = StdRng::seed_from_u64(55);
        let n = 2000;
        let dim = 16;
        let vectors: Vec<f32> = (0..n * dim)
            .map(|_| {
                let (a, b) = (rng.gen::<f32>(), rng.gen::<f32>());
                // Box-Muller
                (-2.0 * a.max(1e-7).ln()).sqrt() * (2.0 * std::f32::consts::PI * b).cos()
            })
            .collect();

        let mut pq = ProductQuantizer::new(
            PqConfig {
                num_subquantizers: 4,
                bits: 8,
                train_iterations: 15,
                init: InitStrategy::Uniform,
                training_sample_size: 0,
                seed: 4,
            },
            dim,
            Metric::L2,
        )
        .unwrap();
        pq.train(&vectors).unwrap();

        let query = &vectors[..dim];
        let mut err_sum = 0.0f64;
        let mut true_sum = 0.0f64;
        for row in vectors.chunks_exact(dim).skip(1) {
            let code = pq.encode(row).unwrap();
            let estimate = pq.asymmetric_distance(query, &code).unwrap();
            let truth = simd::l2_squared(query, row);
            err_sum += (estimate - truth).abs() as f64;
            true_sum += truth as f64;
        }
        let ratio = err_sum / true_sum;
        assert!(ratio <= 0.2, "mean relative ADC error {ratio} exceeds 0.2");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let vectors = random_vectors(400, 32, 111);
        let mut pq = ProductQuantizer::new(small_config(), 32, Metric::L2).unwrap();
        pq.train(&vectors).unwrap();
        let code_before = pq.encode(&vectors[..32]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pq.bin");
        pq.save(&path).unwrap();

        let loaded = ProductQuantizer::load(&path).unwrap();
        assert!(loaded.is_trained());
        let code_after = loaded.encode(&vectors[..32]).unwrap();
        assert_eq!(code_before, code_after);
        assert_eq!(
            pq.symmetric_distance(&code_before, &code_after),
            loaded.symmetric_distance(&code_before, &code_after)
        );
    }

    #[test]
    fn test_stats() {
        let vectors = random_vectors(300, 64, 2);
        let mut pq = ProductQuantizer::new(
            PqConfig {
                num_subquantizers: 8,
                bits: 8,
                ..small_config()
            },
            64,
            Metric::L2,
        )
        .unwrap();
        pq.train(&vectors).unwrap();

        let stats = pq.stats();
        assert_eq!(stats.dim, 64);
        assert_eq!(stats.num_subquantizers, 8);
        assert_eq!(stats.num_centroids, 256);
        assert_eq!(stats.subdim, 8);
        assert_eq!(stats.code_size_bytes, 8);
        assert!((stats.compression_ratio - 32.0).abs() < 1e-3);
        assert!(!stats.to_string().is_empty());
    }
}
