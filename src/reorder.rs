//! # Graph Relabeling Permutations
//!
//! Two generators for node permutations that improve the cache locality of
//! graph traversal. Both consume an out-degree table (per-node neighbor
//! lists with self-loops already removed) and return `P` mapping old node id
//! to new node id; the engine applies `P` to link contents and node storage.
//!
//! - **RCM** (reverse Cuthill–McKee) reduces adjacency bandwidth: BFS from a
//!   minimum-degree node, visiting each level's neighbors in ascending degree
//!   order, then reverse the whole order.
//! - **Gorder** (windowed) greedily appends the candidate sharing the most
//!   edges with the last `window` placed nodes.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

/// Reverse Cuthill–McKee over the undirected closure of `outdegree_table`.
/// Components are processed in descending size order.
pub(crate) fn rcm_order(outdegree_table: &[Vec<u32>]) -> Vec<u32> {
    let n = outdegree_table.len();
    let adjacency = undirected_adjacency(outdegree_table);
    let degree: Vec<usize> = adjacency.iter().map(Vec::len).collect();

    // Discover weakly connected components.
    let mut component_of = vec![usize::MAX; n];
    let mut components: Vec<Vec<u32>> = Vec::new();
    for start in 0..n {
        if component_of[start] != usize::MAX {
            continue;
        }
        let id = components.len();
        let mut members = vec![start as u32];
        component_of[start] = id;
        let mut queue = VecDeque::from([start as u32]);
        while let Some(node) = queue.pop_front() {
            for &next in &adjacency[node as usize] {
                if component_of[next as usize] == usize::MAX {
                    component_of[next as usize] = id;
                    members.push(next);
                    queue.push_back(next);
                }
            }
        }
        components.push(members);
    }
    components.sort_by_key(|members| Reverse(members.len()));

    // Cuthill–McKee per component, then reverse the concatenation.
    let mut order = Vec::with_capacity(n);
    let mut placed = vec![false; n];
    for members in &components {
        let &start = members
            .iter()
            .min_by_key(|&&v| (degree[v as usize], v))
            .expect("component is nonempty");

        placed[start as usize] = true;
        order.push(start);
        let mut head = order.len() - 1;
        while head < order.len() {
            let node = order[head];
            head += 1;
            let mut frontier: Vec<u32> = adjacency[node as usize]
                .iter()
                .copied()
                .filter(|&v| !placed[v as usize])
                .collect();
            frontier.sort_by_key(|&v| (degree[v as usize], v));
            for v in frontier {
                placed[v as usize] = true;
                order.push(v);
            }
        }
    }
    order.reverse();

    permutation_from_order(&order)
}

/// Windowed Gorder: start from the highest-degree node; at each step append
/// the unplaced candidate with the most edges (either direction) to the last
/// `window` placed nodes, lower id on ties.
pub(crate) fn gorder_order(outdegree_table: &[Vec<u32>], window: usize) -> Vec<u32> {
    let n = outdegree_table.len();
    if n == 0 {
        return Vec::new();
    }
    let window = window.max(1);

    let mut in_table: Vec<Vec<u32>> = vec![Vec::new(); n];
    for (u, links) in outdegree_table.iter().enumerate() {
        for &v in links {
            in_table[v as usize].push(u as u32);
        }
    }

    let start = (0..n as u32)
        .max_by_key(|&v| {
            (
                outdegree_table[v as usize].len() + in_table[v as usize].len(),
                Reverse(v),
            )
        })
        .expect("graph is nonempty");

    let mut state = GorderState {
        placed: vec![false; n],
        score: vec![0u32; n],
        order: Vec::with_capacity(n),
        recent: VecDeque::with_capacity(window + 1),
        // Lazy max-heap of (score, node); stale entries are skipped on pop.
        heap: BinaryHeap::with_capacity(2 * n),
    };
    for v in 0..n as u32 {
        if v != start {
            state.heap.push((0, Reverse(v)));
        }
    }

    state.place(start, window, outdegree_table, &in_table);
    while state.order.len() < n {
        let next = loop {
            match state.heap.pop() {
                Some((s, Reverse(v))) => {
                    if !state.placed[v as usize] && s == state.score[v as usize] {
                        break v;
                    }
                }
                // Heap exhausted: the remaining nodes had their entries
                // consumed while stale; take the lowest unplaced id.
                None => {
                    break (0..n as u32)
                        .find(|&v| !state.placed[v as usize])
                        .expect("an unplaced node remains");
                }
            }
        };
        state.place(next, window, outdegree_table, &in_table);
    }

    permutation_from_order(&state.order)
}

struct GorderState {
    placed: Vec<bool>,
    score: Vec<u32>,
    order: Vec<u32>,
    recent: VecDeque<u32>,
    heap: BinaryHeap<(u32, Reverse<u32>)>,
}

impl GorderState {
    fn place(&mut self, v: u32, window: usize, out: &[Vec<u32>], inn: &[Vec<u32>]) {
        self.placed[v as usize] = true;
        self.order.push(v);
        self.recent.push_back(v);
        self.adjust(v, true, out, inn);
        if self.recent.len() > window {
            let evicted = self.recent.pop_front().expect("window is nonempty");
            self.adjust(evicted, false, out, inn);
        }
    }

    /// Bump the window-overlap score of `node`'s neighbors (either edge
    /// direction) as it enters or leaves the window.
    fn adjust(&mut self, node: u32, entering: bool, out: &[Vec<u32>], inn: &[Vec<u32>]) {
        for table in [&out[node as usize], &inn[node as usize]] {
            for &nb in table.iter() {
                if self.placed[nb as usize] {
                    continue;
                }
                let s = &mut self.score[nb as usize];
                if entering {
                    *s += 1;
                } else {
                    *s -= 1;
                }
                self.heap.push((*s, Reverse(nb)));
            }
        }
    }
}

/// Symmetrized, deduplicated adjacency.
fn undirected_adjacency(outdegree_table: &[Vec<u32>]) -> Vec<Vec<u32>> {
    let n = outdegree_table.len();
    let mut adjacency: Vec<Vec<u32>> = vec![Vec::new(); n];
    for (u, links) in outdegree_table.iter().enumerate() {
        for &v in links {
            adjacency[u].push(v);
            adjacency[v as usize].push(u as u32);
        }
    }
    for list in &mut adjacency {
        list.sort_unstable();
        list.dedup();
    }
    adjacency
}

/// `order[k]` is the old id placed at new position `k`; invert into
/// `P[old] = new`.
fn permutation_from_order(order: &[u32]) -> Vec<u32> {
    let mut p = vec![0u32; order.len()];
    for (new_id, &old_id) in order.iter().enumerate() {
        p[old_id as usize] = new_id as u32;
    }
    p
}
