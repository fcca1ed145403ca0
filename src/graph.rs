//! Undirected graph over list indices, used to keep triangle generation local.
//!
//! Node `i` always stands for element `i` of the point list the graph was
//! built from; the node count is fixed for the lifetime of the graph.

use std::collections::{BTreeSet, VecDeque};

use crate::geom::point::Point;

/// Symmetric adjacency over `node_count` nodes.
#[derive(Debug, Clone)]
pub struct Graph {
    adjacency: Vec<BTreeSet<usize>>,
}

impl Graph {
    pub fn new(node_count: usize) -> Self {
        Self {
            adjacency: vec![BTreeSet::new(); node_count],
        }
    }

    /// Build the minimum-weight spanning tree over `points`.
    ///
    /// Candidate edges are taken in order of increasing Euclidean length
    /// (ties broken by node pair). An edge is placed only when its two ends
    /// are not yet reachable from one another; once placed, every remaining
    /// edge inside the merged component is unusable. Stops after `n - 1`
    /// edges, so the result is connected and acyclic.
    pub fn minimum_spanning_tree(points: &[Point]) -> Self {
        let n = points.len();
        let mut graph = Graph::new(n);
        if n < 2 {
            return graph;
        }

        let mut edges: Vec<(f64, usize, usize)> = Vec::with_capacity(n * (n - 1) / 2);
        for i in 0..n {
            for j in (i + 1)..n {
                edges.push((points[i].distance_sq(&points[j]), i, j));
            }
        }
        edges.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        // component[i] = id of the connected component holding node i.
        let mut component: Vec<usize> = (0..n).collect();
        let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
        let mut placed = 0;

        for &(_, i, j) in &edges {
            if placed == n - 1 {
                break;
            }
            let (ci, cj) = (component[i], component[j]);
            if ci == cj {
                continue;
            }
            graph.connect(i, j);
            placed += 1;

            let (keep, absorb) = if members[ci].len() >= members[cj].len() {
                (ci, cj)
            } else {
                (cj, ci)
            };
            let moved = std::mem::take(&mut members[absorb]);
            for &node in &moved {
                component[node] = keep;
            }
            members[keep].extend(moved);
        }

        graph
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.iter().map(BTreeSet::len).sum::<usize>() / 2
    }

    /// Connect `i` and `j`. Self-loops are ignored.
    pub fn connect(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        self.adjacency[i].insert(j);
        self.adjacency[j].insert(i);
    }

    pub fn disconnect(&mut self, i: usize, j: usize) {
        self.adjacency[i].remove(&j);
        self.adjacency[j].remove(&i);
    }

    pub fn is_connected(&self, i: usize, j: usize) -> bool {
        self.adjacency[i].contains(&j)
    }

    /// Direct neighbours of `i` in ascending order.
    pub fn neighbors(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.adjacency[i].iter().copied()
    }

    /// All nodes reachable from `start` in at most `max_steps` hops,
    /// `start` included, in ascending order. `None` means unbounded.
    pub fn reachable_within_steps(&self, start: usize, max_steps: Option<usize>) -> Vec<usize> {
        let mut seen = vec![false; self.adjacency.len()];
        let mut queue = VecDeque::new();
        seen[start] = true;
        queue.push_back((start, 0usize));

        while let Some((node, depth)) = queue.pop_front() {
            if max_steps.is_some_and(|limit| depth >= limit) {
                continue;
            }
            for &next in &self.adjacency[node] {
                if !seen[next] {
                    seen[next] = true;
                    queue.push_back((next, depth + 1));
                }
            }
        }

        seen.iter()
            .enumerate()
            .filter_map(|(i, &s)| s.then_some(i))
            .collect()
    }
}
