//! # flatgraph (single-layer navigable proximity graph)
//!
//! An in-memory approximate-nearest-neighbor index that:
//! - Stores every node (vector or PQ code, fixed-degree links, label) in one
//!   contiguous pre-allocated block
//! - Inserts points with a greedy entry search, beam search, and the
//!   relative-neighborhood pruning heuristic, back-linking symmetrically
//! - Answers top-K queries with the same beam search
//! - Relabels nodes in place (RCM or windowed Gorder) to improve locality
//! - Is **generic over any [`DistanceInterface`]** (squared-L2, angular), with
//!   an optional trained [`ProductQuantizer`] replacing raw vectors
//!
//! ## Example
//! ```no_run
//! use flatgraph::{FlatGraph, ReorderStrategy, SquaredL2};
//!
//! let vectors = vec![vec![0.0f32; 128]; 1000];
//! let mut index = FlatGraph::new(SquaredL2::new(128), 1000, 32).unwrap();
//! for (i, v) in vectors.iter().enumerate() {
//!     index.insert(v, i as u64, 128).unwrap();
//! }
//!
//! // Top-10 labels with distances, nearest first.
//! let hits = index.search(&vectors[0], 10, 64).unwrap();
//!
//! // Permute node ids for cache locality, then persist.
//! index.reorder(ReorderStrategy::Rcm);
//! index.save("index.bin").unwrap();
//! let reopened = FlatGraph::load_with("index.bin", SquaredL2::new(128)).unwrap();
//! # let _ = (hits, reopened);
//! ```
//!
//! ## File Layout
//! ```text
//! [ magic:u64 ][ max_degree:u64 ][ data_size:u64 ][ record_size:u64 ]
//! [ max_nodes:u64 ][ cur_nodes:u64 ][ dim:u64 ][ visited_capacity:u64 ]
//! [ node block: max_nodes * record_size bytes ][ query scratch: data_size ]
//! ```
//! Little-endian throughout; the 64-byte header leaves the node block
//! 64-byte aligned from the start of the file. The active metric and any
//! quantizer are *not* part of the file and must be re-supplied on load.

mod distance;
mod kmeans;
mod pq;
mod reorder;
pub mod simd;
mod visited;

pub use distance::{DistanceInterface, InnerProduct, Metric, SquaredL2};
pub use kmeans::{CentroidTrainer, InitStrategy};
pub use pq::{PqConfig, PqStats, ProductQuantizer, QueryTable};
pub use simd::{active_level, SimdLevel};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;
use visited::VisitedPool;

/// `"FLATGRPH"` as a little-endian u64.
const INDEX_MAGIC: u64 = 0x4850_5247_5441_4C46;

/// Default entry-initialization count: how many strided nodes are probed to
/// pick the entry point of a traversal.
pub const DEFAULT_NUM_INITIALIZATIONS: usize = 100;

/// Crate error type.
#[derive(Debug, Error)]
pub enum FlatGraphError {
    /// File-system failure, with the path it happened on.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Quantizer (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Invalid parameters or misuse (untrained quantizer, dimension
    /// mismatch, too few training points).
    #[error("configuration error: {0}")]
    Config(String),

    /// A file that is not a flatgraph index, or disagrees with the supplied
    /// distance/quantizer.
    #[error("format error: {0}")]
    Format(String),
}

/// Node-id permutation strategy for [`FlatGraph::reorder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReorderStrategy {
    /// Reverse Cuthill–McKee bandwidth reduction.
    Rcm,
    /// Greedy window-based layout; `window` is the number of recently placed
    /// nodes scored against.
    Gorder { window: usize },
}

/// Entry in the search/frontier heaps.
#[derive(Clone, Copy)]
struct Candidate {
    dist: f32,
    node: u32,
}
impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist && self.node == other.node
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.dist.partial_cmp(&other.dist)
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.partial_cmp(other).unwrap_or(Ordering::Equal)
    }
}

/// Query-side distance evaluator: the raw metric, or a per-query PQ table.
enum QueryEval<'q, D> {
    Raw { distance: D, query: &'q [f32] },
    Quantized { table: QueryTable },
}

impl<D: DistanceInterface> QueryEval<'_, D> {
    #[inline]
    fn score(&self, data: &[u8]) -> f32 {
        match self {
            QueryEval::Raw { distance, query } => {
                distance.distance(query, bytemuck::cast_slice(data))
            }
            QueryEval::Quantized { table } => table.distance(data),
        }
    }
}

/// Single-layer navigable proximity graph over a contiguous node arena.
///
/// Every node record is `[data][max_degree x u32 links][u64 label]`; unused
/// link slots hold the node's own id (a self-loop) and are skipped during
/// traversal. Out-degree is saturated at all times, so record addressing is
/// plain arithmetic on the node id.
pub struct FlatGraph<D: DistanceInterface> {
    distance: D,
    quantizer: Option<ProductQuantizer>,
    max_degree: usize,
    data_size: usize,
    record_size: usize,
    max_nodes: usize,
    cur_nodes: usize,
    mem_len: usize,
    /// Node block, u64-backed so raw `f32` data regions stay 4-byte aligned.
    memory: Vec<u64>,
    /// Transformed-query staging buffer; serialized with the index.
    query_scratch: Vec<u8>,
    visited_pool: VisitedPool,
}

impl<D: DistanceInterface> FlatGraph<D> {
    /// Create an empty index over raw vectors.
    pub fn new(distance: D, max_nodes: usize, max_degree: usize) -> Result<Self, FlatGraphError> {
        Self::build(distance, max_nodes, max_degree, None)
    }

    /// Create an empty index whose data regions hold PQ codes. The quantizer
    /// must already be trained and agree with the distance on dimension.
    pub fn with_quantizer(
        distance: D,
        max_nodes: usize,
        max_degree: usize,
        quantizer: ProductQuantizer,
    ) -> Result<Self, FlatGraphError> {
        if !quantizer.is_trained() {
            return Err(FlatGraphError::Config(
                "product quantizer must be trained before indexing".into(),
            ));
        }
        if quantizer.dim() != distance.dim() {
            return Err(FlatGraphError::Config(format!(
                "quantizer dimension {} does not match distance dimension {}",
                quantizer.dim(),
                distance.dim()
            )));
        }
        Self::build(distance, max_nodes, max_degree, Some(quantizer))
    }

    fn build(
        distance: D,
        max_nodes: usize,
        max_degree: usize,
        quantizer: Option<ProductQuantizer>,
    ) -> Result<Self, FlatGraphError> {
        if max_nodes == 0 || max_nodes > u32::MAX as usize {
            return Err(FlatGraphError::Config(format!(
                "max_nodes must be in 1..=u32::MAX, got {max_nodes}"
            )));
        }
        if max_degree == 0 {
            return Err(FlatGraphError::Config("max_degree must be nonzero".into()));
        }

        let data_size = match &quantizer {
            Some(pq) => pq.code_size(),
            None => distance.data_size(),
        };
        let record_size =
            data_size + max_degree * std::mem::size_of::<u32>() + std::mem::size_of::<u64>();
        let mem_len = max_nodes * record_size;

        Ok(Self {
            distance,
            quantizer,
            max_degree,
            data_size,
            record_size,
            max_nodes,
            cur_nodes: 0,
            mem_len,
            memory: vec![0u64; mem_len.div_ceil(8)],
            query_scratch: vec![0u8; data_size],
            visited_pool: VisitedPool::new(max_nodes + 1),
        })
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Number of inserted nodes.
    pub fn len(&self) -> usize {
        self.cur_nodes
    }

    pub fn is_empty(&self) -> bool {
        self.cur_nodes == 0
    }

    /// Capacity fixed at construction.
    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    /// Out-degree of every node.
    pub fn max_degree(&self) -> usize {
        self.max_degree
    }

    /// Bytes per stored data region (vector bytes, or PQ code size).
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Bytes per node record.
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn dim(&self) -> usize {
        self.distance.dim()
    }

    pub fn is_quantized(&self) -> bool {
        self.quantizer.is_some()
    }

    // ------------------------------------------------------------------
    // Node accessors
    // ------------------------------------------------------------------

    #[inline]
    fn record_offset(&self, node: u32) -> usize {
        node as usize * self.record_size
    }

    #[inline]
    fn memory_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.memory)[..self.mem_len]
    }

    #[inline]
    fn node_data(&self, node: u32) -> &[u8] {
        let offset = self.record_offset(node);
        &self.memory_bytes()[offset..offset + self.data_size]
    }

    /// Raw-vector view of a data region. Only valid without a quantizer,
    /// where the record size keeps every data region 4-byte aligned.
    #[inline]
    fn node_vector(&self, node: u32) -> &[f32] {
        bytemuck::cast_slice(self.node_data(node))
    }

    #[inline]
    fn link(&self, node: u32, slot: usize) -> u32 {
        let offset = self.record_offset(node) + self.data_size + slot * 4;
        let bytes = &self.memory_bytes()[offset..offset + 4];
        u32::from_le_bytes(bytes.try_into().expect("link slot is 4 bytes"))
    }

    #[inline]
    fn set_link(&mut self, node: u32, slot: usize, value: u32) {
        let offset = self.record_offset(node) + self.data_size + slot * 4;
        let mem: &mut [u8] = bytemuck::cast_slice_mut(&mut self.memory);
        mem[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    fn node_label(&self, node: u32) -> u64 {
        let offset = self.record_offset(node) + self.data_size + self.max_degree * 4;
        let bytes = &self.memory_bytes()[offset..offset + 8];
        u64::from_le_bytes(bytes.try_into().expect("label is 8 bytes"))
    }

    #[inline]
    fn set_node_label(&mut self, node: u32, label: u64) {
        let offset = self.record_offset(node) + self.data_size + self.max_degree * 4;
        let mem: &mut [u8] = bytemuck::cast_slice_mut(&mut self.memory);
        mem[offset..offset + 8].copy_from_slice(&label.to_le_bytes());
    }

    /// Symmetric distance between two stored nodes: the configured metric on
    /// raw vectors, or the PQ code-to-code tables when quantized. This is the
    /// distance the pruning heuristic runs on.
    #[inline]
    fn stored_distance(&self, a: u32, b: u32) -> f32 {
        match &self.quantizer {
            Some(pq) => pq.symmetric_distance(self.node_data(a), self.node_data(b)),
            None => self.distance.distance(self.node_vector(a), self.node_vector(b)),
        }
    }

    fn make_eval<'q>(&self, query: &'q [f32]) -> Result<QueryEval<'q, D>, FlatGraphError> {
        if query.len() != self.distance.dim() {
            return Err(FlatGraphError::Config(format!(
                "query has dimension {}, index expects {}",
                query.len(),
                self.distance.dim()
            )));
        }
        match &self.quantizer {
            Some(pq) => Ok(QueryEval::Quantized {
                table: pq.query_table(query)?,
            }),
            None => Ok(QueryEval::Raw {
                distance: self.distance.clone(),
                query,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Insert a vector under `label`. Returns `Ok(false)` without touching
    /// the index when capacity is exhausted.
    pub fn insert(
        &mut self,
        vector: &[f32],
        label: u64,
        ef_construction: usize,
    ) -> Result<bool, FlatGraphError> {
        self.insert_with_inits(vector, label, ef_construction, DEFAULT_NUM_INITIALIZATIONS)
    }

    /// [`insert`](Self::insert) with an explicit entry-initialization count.
    pub fn insert_with_inits(
        &mut self,
        vector: &[f32],
        label: u64,
        ef_construction: usize,
        num_initializations: usize,
    ) -> Result<bool, FlatGraphError> {
        if self.cur_nodes >= self.max_nodes {
            return Ok(false);
        }
        let eval = self.make_eval(vector)?;

        // Entry selection runs before allocation so the search cannot pick
        // the new node itself (distance zero, no links yet).
        let entry = if self.cur_nodes > 0 {
            Some(self.select_entry(&eval, num_initializations.max(1)))
        } else {
            None
        };

        let new_node = self.allocate(vector, label)?;
        let entry = match entry {
            Some(node) => node,
            None => return Ok(true),
        };

        let beam = self.beam_search(&eval, entry, ef_construction.max(1));
        let candidates: Vec<Candidate> = beam.into_sorted_vec();
        let selected = self.select_neighbors(&candidates, self.max_degree);
        self.connect_neighbors(&selected, new_node);
        Ok(true)
    }

    /// Write the next record: transformed vector (or PQ code), label, and a
    /// link region of self-loops.
    fn allocate(&mut self, vector: &[f32], label: u64) -> Result<u32, FlatGraphError> {
        let new_node = self.cur_nodes as u32;
        let offset = self.record_offset(new_node);
        let data_size = self.data_size;

        match &self.quantizer {
            Some(pq) => {
                let mem: &mut [u8] = bytemuck::cast_slice_mut(&mut self.memory);
                pq.encode_into(vector, &mut mem[offset..offset + data_size])?;
            }
            None => {
                let mem: &mut [u8] = bytemuck::cast_slice_mut(&mut self.memory);
                self.distance
                    .transform_data(&mut mem[offset..offset + data_size], vector);
            }
        }
        self.set_node_label(new_node, label);
        for slot in 0..self.max_degree {
            self.set_link(new_node, slot, new_node);
        }

        self.cur_nodes += 1;
        Ok(new_node)
    }

    /// Probe nodes at a fixed stride and return the one nearest the query.
    fn select_entry(&self, eval: &QueryEval<'_, D>, num_initializations: usize) -> u32 {
        debug_assert!(self.cur_nodes > 0);
        let step = (self.cur_nodes / num_initializations).max(1);

        let mut best = 0u32;
        let mut best_dist = f32::MAX;
        let mut node = 0usize;
        while node < self.cur_nodes {
            let d = eval.score(self.node_data(node as u32));
            if d < best_dist {
                best_dist = d;
                best = node as u32;
            }
            node += step;
        }
        best
    }

    /// Best-first beam search from `entry`. Returns up to `beam_width`
    /// candidates as a max-heap keyed on distance.
    fn beam_search(
        &self,
        eval: &QueryEval<'_, D>,
        entry: u32,
        beam_width: usize,
    ) -> BinaryHeap<Candidate> {
        let mut visited = self.visited_pool.take();
        let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        let entry_dist = eval.score(self.node_data(entry));
        let start = Candidate {
            dist: entry_dist,
            node: entry,
        };
        frontier.push(Reverse(start));
        results.push(start);
        visited.insert(entry);
        // Worst distance currently held in the result beam.
        let mut worst = entry_dist;

        while let Some(&Reverse(current)) = frontier.peek() {
            if current.dist > worst {
                break;
            }
            frontier.pop();

            for slot in 0..self.max_degree {
                let link = self.link(current.node, slot);
                if link == current.node {
                    // Self-loop: unused slot.
                    continue;
                }
                if !visited.insert(link) {
                    continue;
                }
                let d = eval.score(self.node_data(link));
                if results.len() < beam_width || d < worst {
                    let candidate = Candidate {
                        dist: d,
                        node: link,
                    };
                    frontier.push(Reverse(candidate));
                    results.push(candidate);
                    if results.len() > beam_width {
                        results.pop();
                    }
                    if let Some(top) = results.peek() {
                        worst = top.dist;
                    }
                }
            }
        }

        self.visited_pool.put_back(visited);
        results
    }

    /// Relative-neighborhood pruning: walk candidates nearest-first, keeping
    /// one only if it is closer to the query than to everything already kept.
    /// Remaining slots are then backfilled nearest-first, so the result has
    /// exactly `min(m, candidates.len())` entries.
    fn select_neighbors(&self, candidates: &[Candidate], m: usize) -> Vec<Candidate> {
        if candidates.len() <= m {
            return candidates.to_vec();
        }

        let mut accepted: Vec<Candidate> = Vec::with_capacity(m);
        let mut skipped: Vec<Candidate> = Vec::new();
        for &candidate in candidates {
            if accepted.len() == m {
                break;
            }
            let keep = accepted
                .iter()
                .all(|kept| self.stored_distance(kept.node, candidate.node) >= candidate.dist);
            if keep {
                accepted.push(candidate);
            } else {
                skipped.push(candidate);
            }
        }
        for &candidate in &skipped {
            if accepted.len() == m {
                break;
            }
            accepted.push(candidate);
        }
        accepted
    }

    /// Install links between the new node and its selected neighbors. A
    /// neighbor with a free (self-loop) slot is back-linked directly; a
    /// saturated neighbor has its link region re-pruned over its current
    /// neighbors plus the new node.
    fn connect_neighbors(&mut self, selected: &[Candidate], new_node: u32) {
        for (slot, candidate) in selected.iter().enumerate() {
            self.set_link(new_node, slot, candidate.node);
        }

        for candidate in selected {
            let neighbor = candidate.node;

            let free_slot =
                (0..self.max_degree).find(|&slot| self.link(neighbor, slot) == neighbor);
            if let Some(slot) = free_slot {
                self.set_link(neighbor, slot, new_node);
                continue;
            }

            // Saturated: rebuild the neighbor's link region from its current
            // out-neighbors plus the new node, under the symmetric distance.
            let mut pool: Vec<Candidate> = Vec::with_capacity(self.max_degree + 1);
            pool.push(Candidate {
                dist: self.stored_distance(neighbor, new_node),
                node: new_node,
            });
            for slot in 0..self.max_degree {
                let link = self.link(neighbor, slot);
                if link != neighbor {
                    pool.push(Candidate {
                        dist: self.stored_distance(neighbor, link),
                        node: link,
                    });
                }
            }
            pool.sort_unstable();

            let kept = self.select_neighbors(&pool, self.max_degree);
            for (slot, k) in kept.iter().enumerate() {
                self.set_link(neighbor, slot, k.node);
            }
            for slot in kept.len()..self.max_degree {
                self.set_link(neighbor, slot, neighbor);
            }
        }
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Top-`k` labels with distances, nearest first. `ef_search` is clamped
    /// up to `k`.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
    ) -> Result<Vec<(f32, u64)>, FlatGraphError> {
        self.search_with_inits(query, k, ef_search, DEFAULT_NUM_INITIALIZATIONS)
    }

    /// [`search`](Self::search) with an explicit entry-initialization count.
    pub fn search_with_inits(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
        num_initializations: usize,
    ) -> Result<Vec<(f32, u64)>, FlatGraphError> {
        let eval = self.make_eval(query)?;
        if self.cur_nodes == 0 || k == 0 {
            return Ok(Vec::new());
        }

        let entry = self.select_entry(&eval, num_initializations.max(1));
        let beam = self.beam_search(&eval, entry, ef_search.max(k));
        let mut hits: Vec<Candidate> = beam.into_sorted_vec();
        hits.truncate(k);
        Ok(hits
            .into_iter()
            .map(|c| (c.dist, self.node_label(c.node)))
            .collect())
    }

    // ------------------------------------------------------------------
    // Relabeling
    // ------------------------------------------------------------------

    /// Permute node ids for locality using the given strategy.
    pub fn reorder(&mut self, strategy: ReorderStrategy) {
        let table = self.outdegree_table();
        let permutation = match strategy {
            ReorderStrategy::Rcm => reorder::rcm_order(&table),
            ReorderStrategy::Gorder { window } => reorder::gorder_order(&table, window),
        };
        tracing::debug!(?strategy, nodes = self.cur_nodes, "relabeling index");
        self.relabel(&permutation);
    }

    /// Per-node out-neighbors with self-loops removed.
    fn outdegree_table(&self) -> Vec<Vec<u32>> {
        (0..self.cur_nodes as u32)
            .map(|node| {
                (0..self.max_degree)
                    .map(|slot| self.link(node, slot))
                    .filter(|&link| link != node)
                    .collect()
            })
            .collect()
    }

    /// Apply `permutation` (old id -> new id) to link contents, then move
    /// records to their new positions by following permutation cycles with a
    /// single scratch record.
    fn relabel(&mut self, permutation: &[u32]) {
        assert_eq!(
            permutation.len(),
            self.cur_nodes,
            "permutation must cover every allocated node"
        );
        debug_assert!(
            {
                let mut seen = vec![false; permutation.len()];
                permutation.iter().all(|&p| {
                    (p as usize) < permutation.len()
                        && !std::mem::replace(&mut seen[p as usize], true)
                })
            },
            "permutation must be a bijection over allocated node ids"
        );

        // 1. Rewire every link slot, self-loops included: a self-loop at n
        // maps to P[n], which is where the node itself lands.
        for node in 0..self.cur_nodes as u32 {
            for slot in 0..self.max_degree {
                let link = self.link(node, slot);
                self.set_link(node, slot, permutation[link as usize]);
            }
        }

        // 2. Cycle-following relocation.
        let mut relocated = self.visited_pool.take();
        let mut scratch = vec![0u8; self.record_size];
        for node in 0..self.cur_nodes as u32 {
            if relocated.contains(node) {
                continue;
            }
            let src = node;
            let mut dest = permutation[src as usize];
            self.swap_records(src, dest, &mut scratch);
            relocated.insert(src);
            while !relocated.contains(dest) {
                relocated.insert(dest);
                dest = permutation[dest as usize];
                self.swap_records(src, dest, &mut scratch);
            }
        }
        self.visited_pool.put_back(relocated);
    }

    fn swap_records(&mut self, a: u32, b: u32, scratch: &mut [u8]) {
        if a == b {
            return;
        }
        let offset_a = self.record_offset(a);
        let offset_b = self.record_offset(b);
        let record_size = self.record_size;
        let mem: &mut [u8] = bytemuck::cast_slice_mut(&mut self.memory);
        scratch.copy_from_slice(&mem[offset_b..offset_b + record_size]);
        mem.copy_within(offset_a..offset_a + record_size, offset_b);
        mem[offset_a..offset_a + record_size].copy_from_slice(scratch);
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Write the index to `path` in the little-endian layout documented at
    /// the crate root. Quantizer state is not included; persist it with
    /// [`ProductQuantizer::save`].
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), FlatGraphError> {
        let path = path.as_ref();
        let io_err = |source| FlatGraphError::Io {
            path: path.display().to_string(),
            source,
        };

        let file = File::create(path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        for value in [
            INDEX_MAGIC,
            self.max_degree as u64,
            self.data_size as u64,
            self.record_size as u64,
            self.max_nodes as u64,
            self.cur_nodes as u64,
            self.distance.dim() as u64,
            self.visited_pool.capacity() as u64,
        ] {
            writer.write_u64::<LittleEndian>(value).map_err(io_err)?;
        }
        writer.write_all(self.memory_bytes()).map_err(io_err)?;
        writer.write_all(&self.query_scratch).map_err(io_err)?;
        writer.flush().map_err(io_err)?;

        tracing::debug!(
            path = %path.display(),
            nodes = self.cur_nodes,
            bytes = 64 + self.mem_len + self.data_size,
            "saved index"
        );
        Ok(())
    }

    /// Load a raw-vector index, re-supplying the distance the index was
    /// built with (the format does not record it).
    pub fn load_with<P: AsRef<Path>>(path: P, distance: D) -> Result<Self, FlatGraphError> {
        Self::load_inner(path.as_ref(), distance, None)
    }

    /// Load a quantized index, re-supplying both the distance and the
    /// trained quantizer it was built with.
    pub fn load_quantized<P: AsRef<Path>>(
        path: P,
        distance: D,
        quantizer: ProductQuantizer,
    ) -> Result<Self, FlatGraphError> {
        if !quantizer.is_trained() {
            return Err(FlatGraphError::Config(
                "product quantizer must be trained before indexing".into(),
            ));
        }
        Self::load_inner(path.as_ref(), distance, Some(quantizer))
    }

    fn load_inner(
        path: &Path,
        distance: D,
        quantizer: Option<ProductQuantizer>,
    ) -> Result<Self, FlatGraphError> {
        let io_err = |source| FlatGraphError::Io {
            path: path.display().to_string(),
            source,
        };

        let file = File::open(path).map_err(io_err)?;
        let mut reader = BufReader::new(file);

        let magic = reader.read_u64::<LittleEndian>().map_err(io_err)?;
        if magic != INDEX_MAGIC {
            return Err(FlatGraphError::Format(format!(
                "{} is not a flatgraph index (bad magic)",
                path.display()
            )));
        }
        let max_degree = reader.read_u64::<LittleEndian>().map_err(io_err)? as usize;
        let data_size = reader.read_u64::<LittleEndian>().map_err(io_err)? as usize;
        let record_size = reader.read_u64::<LittleEndian>().map_err(io_err)? as usize;
        let max_nodes = reader.read_u64::<LittleEndian>().map_err(io_err)? as usize;
        let cur_nodes = reader.read_u64::<LittleEndian>().map_err(io_err)? as usize;
        let dim = reader.read_u64::<LittleEndian>().map_err(io_err)? as usize;
        let visited_capacity = reader.read_u64::<LittleEndian>().map_err(io_err)? as usize;

        if dim != distance.dim() {
            return Err(FlatGraphError::Format(format!(
                "index stores {dim}-dimensional data, supplied distance expects {}",
                distance.dim()
            )));
        }
        let expected_data_size = match &quantizer {
            Some(pq) => pq.code_size(),
            None => distance.data_size(),
        };
        if data_size != expected_data_size {
            return Err(FlatGraphError::Format(format!(
                "index stores {data_size}-byte data regions, expected {expected_data_size} \
                 (was the index built with the same quantizer setting?)"
            )));
        }
        let expected_record = data_size + max_degree * 4 + 8;
        if record_size != expected_record
            || max_degree == 0
            || max_nodes == 0
            || max_nodes > u32::MAX as usize
            || cur_nodes > max_nodes
        {
            return Err(FlatGraphError::Format(format!(
                "inconsistent header in {}",
                path.display()
            )));
        }

        let mem_len = max_nodes * record_size;
        let mut memory = vec![0u64; mem_len.div_ceil(8)];
        {
            let mem: &mut [u8] = bytemuck::cast_slice_mut(&mut memory);
            reader.read_exact(&mut mem[..mem_len]).map_err(io_err)?;
        }
        let mut query_scratch = vec![0u8; data_size];
        reader.read_exact(&mut query_scratch).map_err(io_err)?;

        tracing::debug!(path = %path.display(), nodes = cur_nodes, "loaded index");
        Ok(Self {
            distance,
            quantizer,
            max_degree,
            data_size,
            record_size,
            max_nodes,
            cur_nodes,
            mem_len,
            memory,
            query_scratch,
            visited_pool: VisitedPool::new(visited_capacity.max(max_nodes + 1)),
        })
    }
}
