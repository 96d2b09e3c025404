//! Proximity graphs over point sets
//!
//! The graph is the backbone of normal orientation: consistent signs are
//! propagated along its edges, and degenerate local fits are repaired from
//! graph neighbors.

use crate::nearest_neighbor::SpatialIndex;
use psrecon_core::{Error, NearestNeighborSearch, Point3f, Result, Stage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Graph construction strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphType {
    /// Mutual k-nearest neighbors united with a spanning tree of the candidate graph
    Riemann,
    /// Symmetric k-nearest neighbor graph
    Knn,
}

/// Half of an undirected edge, stored in the adjacency list of its source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphEdge {
    pub target: usize,
    pub distance: f32,
}

/// Undirected proximity graph in compressed adjacency form
#[derive(Debug, Clone)]
pub struct NeighborGraph {
    offsets: Vec<usize>,
    edges: Vec<GraphEdge>,
}

impl NeighborGraph {
    /// Build from an undirected edge list; self loops and duplicates are dropped
    pub fn from_edges(node_count: usize, edges: impl IntoIterator<Item = (usize, usize, f32)>) -> Self {
        let mut directed: Vec<(usize, usize, f32)> = Vec::new();
        for (a, b, distance) in edges {
            if a == b || a >= node_count || b >= node_count {
                continue;
            }
            directed.push((a, b, distance));
            directed.push((b, a, distance));
        }
        directed.sort_by(|x, y| x.0.cmp(&y.0).then(x.1.cmp(&y.1)));
        directed.dedup_by(|x, y| x.0 == y.0 && x.1 == y.1);

        let mut offsets = vec![0usize; node_count + 1];
        for &(source, _, _) in &directed {
            offsets[source + 1] += 1;
        }
        for i in 0..node_count {
            offsets[i + 1] += offsets[i];
        }

        let edges = directed
            .into_iter()
            .map(|(_, target, distance)| GraphEdge { target, distance })
            .collect();

        Self { offsets, edges }
    }

    pub fn node_count(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Number of undirected edges
    pub fn edge_count(&self) -> usize {
        self.edges.len() / 2
    }

    pub fn neighbors(&self, node: usize) -> &[GraphEdge] {
        &self.edges[self.offsets[node]..self.offsets[node + 1]]
    }

    pub fn degree(&self, node: usize) -> usize {
        self.offsets[node + 1] - self.offsets[node]
    }

    pub fn contains_edge(&self, a: usize, b: usize) -> bool {
        self.neighbors(a).iter().any(|edge| edge.target == b)
    }

    /// Iterate every undirected edge once as `(a, b, distance)` with `a < b`
    pub fn undirected_edges(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        (0..self.node_count()).flat_map(move |a| {
            self.neighbors(a)
                .iter()
                .filter(move |edge| edge.target > a)
                .map(move |edge| (a, edge.target, edge.distance))
        })
    }

    /// Connected component label per node, numbered by lowest member index
    pub fn components(&self) -> Vec<usize> {
        let mut sets = DisjointSets::new(self.node_count());
        for (a, b, _) in self.undirected_edges() {
            sets.union(a, b);
        }

        let mut labels = vec![usize::MAX; self.node_count()];
        let mut root_label = vec![usize::MAX; self.node_count()];
        let mut next = 0;
        for node in 0..self.node_count() {
            let root = sets.find(node);
            if root_label[root] == usize::MAX {
                root_label[root] = next;
                next += 1;
            }
            labels[node] = root_label[root];
        }
        labels
    }

    pub fn component_count(&self) -> usize {
        self.components().into_iter().max().map_or(0, |max| max + 1)
    }
}

/// Union-find with path halving and union by size
pub(crate) struct DisjointSets {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl DisjointSets {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            parent: (0..count).collect(),
            size: vec![1; count],
        }
    }

    pub(crate) fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    /// Returns false when both nodes were already connected
    pub(crate) fn union(&mut self, a: usize, b: usize) -> bool {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
        true
    }
}

/// Builds a [`NeighborGraph`] over a point set
#[derive(Debug, Clone)]
pub struct NeighborGraphBuilder {
    graph_type: GraphType,
    /// Neighbors per point in KNN mode
    k: usize,
    /// Candidate neighborhood size in Riemann mode
    riemann_neighbors: usize,
}

impl NeighborGraphBuilder {
    pub fn new(graph_type: GraphType) -> Self {
        Self {
            graph_type,
            k: 5,
            riemann_neighbors: 8,
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_riemann_neighbors(mut self, riemann_neighbors: usize) -> Self {
        self.riemann_neighbors = riemann_neighbors;
        self
    }

    /// Build the graph, creating a spatial index for the points
    pub fn build(&self, points: &[Point3f]) -> Result<NeighborGraph> {
        if points.len() < 2 {
            return Err(insufficient(points.len()));
        }
        let index = SpatialIndex::new(points);
        self.build_with_search(points, &index)
    }

    /// Build the graph reusing an existing search structure over `points`
    pub fn build_with_search<S>(&self, points: &[Point3f], search: &S) -> Result<NeighborGraph>
    where
        S: NearestNeighborSearch + Sync,
    {
        if points.len() < 2 {
            return Err(insufficient(points.len()));
        }
        if self.k == 0 || self.riemann_neighbors == 0 {
            return Err(Error::InvalidData("graph neighborhood size must be at least 1".to_string()));
        }

        let graph = match self.graph_type {
            GraphType::Knn => {
                let lists = k_nearest_lists(points, search, self.k);
                NeighborGraph::from_edges(points.len(), flatten(&lists))
            }
            GraphType::Riemann => riemann_graph(points, search, self.riemann_neighbors),
        };

        debug!(
            graph_type = ?self.graph_type,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "neighbor graph built"
        );
        Ok(graph)
    }
}

fn insufficient(count: usize) -> Error {
    Error::insufficient_input(
        Stage::NeighborGraph,
        format!("a neighbor graph needs at least 2 points, got {}", count),
    )
}

/// k nearest neighbors of every point, excluding the point itself
fn k_nearest_lists<S>(points: &[Point3f], search: &S, k: usize) -> Vec<Vec<(usize, f32)>>
where
    S: NearestNeighborSearch + Sync,
{
    let k = k.min(points.len() - 1);
    points
        .par_iter()
        .enumerate()
        .map(|(i, point)| {
            let mut neighbors = search.find_k_nearest(point, k + 1);
            neighbors.retain(|&(j, _)| j != i);
            neighbors.truncate(k);
            neighbors
        })
        .collect()
}

fn flatten(lists: &[Vec<(usize, f32)>]) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
    lists
        .iter()
        .enumerate()
        .flat_map(|(i, list)| list.iter().map(move |&(j, distance)| (i, j, distance)))
}

/// Mutual k-nearest edges plus a minimum spanning forest of the candidate graph
fn riemann_graph<S>(points: &[Point3f], search: &S, k: usize) -> NeighborGraph
where
    S: NearestNeighborSearch + Sync,
{
    let lists = k_nearest_lists(points, search, k);
    let candidates = NeighborGraph::from_edges(points.len(), flatten(&lists));

    let mutual = flatten(&lists).filter(|&(i, j, _)| lists[j].iter().any(|&(back, _)| back == i));

    let mut by_length: Vec<(usize, usize, f32)> = candidates.undirected_edges().collect();
    by_length.sort_by(|x, y| x.2.total_cmp(&y.2).then(x.0.cmp(&y.0)).then(x.1.cmp(&y.1)));

    let mut sets = DisjointSets::new(points.len());
    let spanning: Vec<(usize, usize, f32)> = by_length
        .into_iter()
        .filter(|&(a, b, _)| sets.union(a, b))
        .collect();

    NeighborGraph::from_edges(points.len(), mutual.chain(spanning))
}
