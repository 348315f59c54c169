// floodroute/src/graph.rs
//
// Road Graph (C1) — directed multigraph of junctions and segments.
// Topology (nodes, edges, influence weights) is loaded once from an opaque
// external artifact and frozen; only per-edge risk mutates afterward, through
// a single atomic cell per edge so concurrent readers never observe a torn
// value (spec §4.1 invariant).
//
// The mutable graph is built on petgraph::Graph; GraphView snapshots are
// produced via `Graph::map`, which preserves NodeIndex/EdgeIndex 1:1 while
// reading each edge's risk exactly once — a single O(V+E) pass, not a lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use petgraph::graph::{EdgeIndex, Graph, NodeIndex};
use petgraph::Directed;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::events::{LocationKey, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoadClass {
    Motorway,
    Primary,
    Secondary,
    Residential,
    Service,
}

impl RoadClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Motorway => "motorway",
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Residential => "residential",
            Self::Service => "service",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeData {
    pub node_id: NodeId,
    pub lon: f64,
    pub lat: f64,
}

/// (u, v, k) disambiguates parallel edges between the same pair of junctions.
pub type EdgeKey = (NodeId, NodeId, u32);

/// A single atomic cell for one edge's risk value, stored as f32 bits.
/// Readers never see a torn update (spec §4.1); writers serialize per edge
/// but cross-edge writes need not be atomic as a set.
#[derive(Debug)]
pub struct RiskCell(AtomicU32);

impl RiskCell {
    fn new(v: f64) -> Self {
        Self(AtomicU32::new((v as f32).to_bits()))
    }

    pub fn load(&self) -> f64 {
        f32::from_bits(self.0.load(Ordering::Acquire)) as f64
    }

    fn store(&self, v: f64) {
        self.0.store((v as f32).to_bits(), Ordering::Release);
    }
}

pub struct EdgeData {
    pub u: NodeId,
    pub v: NodeId,
    pub k: u32,
    pub length_m: f64,
    pub road_class: RoadClass,
    pub geometry: Vec<(f64, f64)>,
    pub risk: RiskCell,
    /// Influencing locations and their distance in meters, from the topology
    /// artifact (spec §4.3 propagation, Open Question resolved in DESIGN.md).
    pub influences: Vec<(LocationKey, f64)>,
}

/// A plain, immutable copy of one edge's attributes plus the risk value read
/// at snapshot time — what `GraphView` actually iterates over.
#[derive(Debug, Clone)]
pub struct EdgeSnapshot {
    pub u: NodeId,
    pub v: NodeId,
    pub k: u32,
    pub length_m: f64,
    pub road_class: RoadClass,
    pub risk: f64,
}

/// Raw node/edge description as it would arrive from the external topology
/// artifact (spec §6 `graph_source_uri`). The exact artifact shape is an
/// Open Question (spec §9); this is the core's minimal required shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyNode {
    pub node_id: NodeId,
    pub lon: f64,
    pub lat: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyEdge {
    pub u: NodeId,
    pub v: NodeId,
    pub k: u32,
    pub length_m: f64,
    pub road_class: RoadClass,
    pub geometry: Vec<(f64, f64)>,
    pub influences: Vec<(LocationKey, f64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyArtifact {
    pub nodes: Vec<TopologyNode>,
    pub edges: Vec<TopologyEdge>,
}

/// Fixed-resolution histogram backing `graph_status().edges_above(thresh)`
/// in constant time — counts are maintained incrementally on every
/// `update_risk`, never recomputed by a full edge scan.
struct RiskHistogram {
    buckets: Vec<AtomicU64>, // 101 buckets, index i covers risk == i/100
}

impl RiskHistogram {
    fn new() -> Self {
        Self {
            buckets: (0..=100).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn bucket_of(v: f64) -> usize {
        ((v * 100.0).round() as i64).clamp(0, 100) as usize
    }

    fn record_initial(&self, v: f64) {
        self.buckets[Self::bucket_of(v)].fetch_add(1, Ordering::Relaxed);
    }

    fn move_bucket(&self, old: f64, new: f64) {
        let (ob, nb) = (Self::bucket_of(old), Self::bucket_of(new));
        if ob == nb {
            return;
        }
        self.buckets[ob].fetch_sub(1, Ordering::Relaxed);
        self.buckets[nb].fetch_add(1, Ordering::Relaxed);
    }

    fn above(&self, thresh: f64) -> usize {
        let start = ((thresh * 100.0).ceil() as i64).clamp(0, 101) as usize;
        self.buckets[start.min(100)..]
            .iter()
            .map(|b| b.load(Ordering::Relaxed) as usize)
            .sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphStatus {
    pub total_edges: usize,
}

/// Opaque token returned by `update_risk`, useful for tests/ordering assertions.
pub type ChangeToken = u64;

pub struct RoadGraph {
    graph: Graph<NodeData, EdgeData, Directed>,
    node_index: HashMap<NodeId, NodeIndex>,
    edge_index: HashMap<EdgeKey, EdgeIndex>,
    histogram: RiskHistogram,
    change_token: AtomicU64,
}

impl RoadGraph {
    /// Load topology once at startup. Malformed or inconsistent topology is a
    /// `fatal` error — the host process is expected to exit (spec §7).
    pub fn load(artifact: TopologyArtifact) -> CoreResult<Self> {
        if artifact.nodes.is_empty() {
            return Err(CoreError::Fatal("topology has no nodes".into()));
        }

        let mut graph = Graph::<NodeData, EdgeData, Directed>::new();
        let mut node_index = HashMap::with_capacity(artifact.nodes.len());

        for n in &artifact.nodes {
            let idx = graph.add_node(NodeData {
                node_id: n.node_id,
                lon: n.lon,
                lat: n.lat,
            });
            if node_index.insert(n.node_id, idx).is_some() {
                return Err(CoreError::Fatal(format!("duplicate node_id {}", n.node_id)));
            }
        }

        let mut edge_index = HashMap::with_capacity(artifact.edges.len());
        let histogram = RiskHistogram::new();

        for e in &artifact.edges {
            if e.length_m <= 0.0 {
                return Err(CoreError::Fatal(format!(
                    "edge ({}, {}, {}) has non-positive length",
                    e.u, e.v, e.k
                )));
            }
            let &u_idx = node_index
                .get(&e.u)
                .ok_or_else(|| CoreError::Fatal(format!("edge references unknown node {}", e.u)))?;
            let &v_idx = node_index
                .get(&e.v)
                .ok_or_else(|| CoreError::Fatal(format!("edge references unknown node {}", e.v)))?;

            let data = EdgeData {
                u: e.u,
                v: e.v,
                k: e.k,
                length_m: e.length_m,
                road_class: e.road_class,
                geometry: e.geometry.clone(),
                risk: RiskCell::new(0.0),
                influences: e.influences.clone(),
            };
            histogram.record_initial(0.0);
            let eidx = graph.add_edge(u_idx, v_idx, data);
            edge_index.insert((e.u, e.v, e.k), eidx);
        }

        Ok(Self {
            graph,
            node_index,
            edge_index,
            histogram,
            change_token: AtomicU64::new(0),
        })
    }

    pub fn total_edges(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn neighbors(&self, u: NodeId) -> Vec<(NodeId, u32, f64)> {
        let Some(&idx) = self.node_index.get(&u) else {
            return Vec::new();
        };
        self.graph
            .edges(idx)
            .map(|e| {
                let data = e.weight();
                (data.v, data.k, data.risk.load())
            })
            .collect()
    }

    /// Stable-order edge keys, for reproducible snapshots / iteration.
    pub fn edge_keys(&self) -> Vec<EdgeKey> {
        self.graph
            .edge_indices()
            .map(|idx| {
                let d = &self.graph[idx];
                (d.u, d.v, d.k)
            })
            .collect()
    }

    /// Clamp to [0,1], round to 3 decimals (spec §9 floating-point determinism),
    /// atomically store, and bump the maintained histogram + change token.
    pub fn update_risk(&self, key: EdgeKey, new_risk: f64) -> CoreResult<ChangeToken> {
        let &idx = self
            .edge_index
            .get(&key)
            .ok_or_else(|| CoreError::NotFound(format!("edge {:?}", key)))?;
        let clamped = (new_risk.clamp(0.0, 1.0) * 1000.0).round() / 1000.0;
        let data = &self.graph[idx];
        let old = data.risk.load();
        data.risk.store(clamped);
        self.histogram.move_bucket(old, clamped);
        Ok(self.change_token.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn status(&self) -> GraphStatus {
        GraphStatus {
            total_edges: self.total_edges(),
        }
    }

    pub fn edges_above(&self, thresh: f64) -> usize {
        self.histogram.above(thresh)
    }

    /// Edges plus their influencing locations and current risk, for the
    /// Fusion Engine's propagation pass (spec §4.3). Influences are cloned —
    /// the list per edge is small and this runs once per cycle, not per
    /// request.
    pub fn edges_snapshot_for_fusion(&self) -> Vec<(EdgeKey, Vec<(LocationKey, f64)>, f64)> {
        self.graph
            .edge_indices()
            .map(|idx| {
                let d = &self.graph[idx];
                ((d.u, d.v, d.k), d.influences.clone(), d.risk.load())
            })
            .collect()
    }

    /// Nearest node by straight-line distance; ties broken by smaller node_id
    /// (spec §4.1). Linear scan — acceptable for the graph sizes this core
    /// targets; a spatial index is a Non-goal here.
    pub fn nearest_node(&self, lon: f64, lat: f64) -> Option<NodeId> {
        self.graph
            .node_weights()
            .map(|n| {
                let d = haversine_m(lat, lon, n.lat, n.lon);
                (d, n.node_id)
            })
            .min_by(|a, b| match a.0.partial_cmp(&b.0).unwrap() {
                std::cmp::Ordering::Equal => a.1.cmp(&b.1),
                other => other,
            })
            .map(|(_, id)| id)
    }

    pub fn node_lonlat(&self, id: NodeId) -> Option<(f64, f64)> {
        self.node_index
            .get(&id)
            .map(|&idx| (self.graph[idx].lon, self.graph[idx].lat))
    }

    /// Scenario reset (spec §4.6): drives every edge back to 0.0 through the
    /// existing single-edge `update_risk` path — there is no separate bulk
    /// primitive, topology stays frozen and risk stays single-writer-per-edge.
    pub fn reset_all_risk(&self) {
        for key in self.edge_keys() {
            let _ = self.update_risk(key, 0.0);
        }
    }

    /// Cheap, read-only handle whose edge iteration reflects risk values at
    /// snapshot time (spec §4.1). `Graph::map` preserves NodeIndex/EdgeIndex
    /// while reading each `RiskCell` exactly once.
    pub fn snapshot(&self) -> GraphView {
        let g = self.graph.map(
            |_, n| n.clone(),
            |_, e| EdgeSnapshot {
                u: e.u,
                v: e.v,
                k: e.k,
                length_m: e.length_m,
                road_class: e.road_class,
                risk: e.risk.load(),
            },
        );
        GraphView {
            graph: Arc::new(g),
            node_index: Arc::new(self.node_index.clone()),
            taken_at: chrono::Utc::now(),
        }
    }
}

/// Immutable read handle sufficient for one Router request (spec GLOSSARY).
/// Risk updates made after the snapshot is taken never affect a request
/// holding this view.
#[derive(Clone)]
pub struct GraphView {
    graph: Arc<Graph<NodeData, EdgeSnapshot, Directed>>,
    node_index: Arc<HashMap<NodeId, NodeIndex>>,
    pub taken_at: chrono::DateTime<chrono::Utc>,
}

impl GraphView {
    pub fn inner(&self) -> &Graph<NodeData, EdgeSnapshot, Directed> {
        &self.graph
    }

    pub fn node_idx(&self, id: NodeId) -> Option<NodeIndex> {
        self.node_index.get(&id).copied()
    }

    pub fn node_id_of(&self, idx: NodeIndex) -> NodeId {
        self.graph[idx].node_id
    }

    pub fn node_lonlat(&self, idx: NodeIndex) -> (f64, f64) {
        let n = &self.graph[idx];
        (n.lon, n.lat)
    }

    pub fn has_edge_between(&self, a: NodeId, b: NodeId) -> bool {
        let (Some(ai), Some(bi)) = (self.node_idx(a), self.node_idx(b)) else {
            return false;
        };
        self.graph.find_edge(ai, bi).is_some()
    }

    pub fn edge_data(&self, idx: EdgeIndex) -> &EdgeSnapshot {
        &self.graph[idx]
    }

    /// Nearest node by straight-line distance within this view; ties broken
    /// by smaller node_id (spec §4.1), same rule as `RoadGraph::nearest_node`.
    pub fn nearest_node(&self, lon: f64, lat: f64) -> Option<NodeId> {
        self.graph
            .node_weights()
            .map(|n| (haversine_m(lat, lon, n.lat, n.lon), n.node_id))
            .min_by(|a, b| match a.0.partial_cmp(&b.0).unwrap() {
                std::cmp::Ordering::Equal => a.1.cmp(&b.1),
                other => other,
            })
            .map(|(_, id)| id)
    }
}

/// Great-circle distance in meters (haversine).
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const R: f64 = 6_371_000.0;
    let (lat1, lat2) = (lat1.to_radians(), lat2.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * R * a.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_graph(n: usize) -> RoadGraph {
        let nodes = (0..n)
            .map(|i| TopologyNode {
                node_id: i as u64,
                lon: i as f64 * 0.001,
                lat: 0.0,
            })
            .collect();
        let edges = (0..n - 1)
            .map(|i| TopologyEdge {
                u: i as u64,
                v: (i + 1) as u64,
                k: 0,
                length_m: 100.0,
                road_class: RoadClass::Residential,
                geometry: vec![],
                influences: vec![],
            })
            .collect();
        RoadGraph::load(TopologyArtifact { nodes, edges }).unwrap()
    }

    #[test]
    fn update_risk_clamps_and_rounds() {
        let g = line_graph(3);
        g.update_risk((0, 1, 0), 1.5).unwrap();
        assert_eq!(g.snapshot().inner().edge_weights().next().unwrap().risk, 1.0);
        g.update_risk((0, 1, 0), 0.12345).unwrap();
        assert_eq!(g.snapshot().inner().edge_weights().next().unwrap().risk, 0.123);
    }

    #[test]
    fn snapshot_does_not_see_later_updates() {
        let g = line_graph(3);
        let view = g.snapshot();
        g.update_risk((0, 1, 0), 0.9).unwrap();
        let snapped_risk = view.inner().edge_weights().next().unwrap().risk;
        assert_eq!(snapped_risk, 0.0);
    }

    #[test]
    fn edges_above_tracks_incremental_updates() {
        let g = line_graph(5);
        assert_eq!(g.edges_above(0.1), 0);
        g.update_risk((0, 1, 0), 0.5).unwrap();
        g.update_risk((1, 2, 0), 0.7).unwrap();
        assert_eq!(g.edges_above(0.5), 2);
        assert_eq!(g.edges_above(0.6), 1);
    }

    #[test]
    fn nearest_node_breaks_ties_by_smaller_id() {
        let nodes = vec![
            TopologyNode { node_id: 5, lon: 0.0, lat: 0.0 },
            TopologyNode { node_id: 2, lon: 0.0, lat: 0.0 },
        ];
        let g = RoadGraph::load(TopologyArtifact { nodes, edges: vec![] }).unwrap();
        assert_eq!(g.nearest_node(0.0, 0.0), Some(2));
    }

    #[test]
    fn reset_all_risk_returns_every_edge_to_zero() {
        let g = line_graph(5);
        g.update_risk((0, 1, 0), 0.6).unwrap();
        g.update_risk((2, 3, 0), 0.9).unwrap();
        g.reset_all_risk();
        assert!(g.snapshot().inner().edge_weights().all(|e| e.risk == 0.0));
    }

    #[test]
    fn load_rejects_duplicate_node_ids() {
        let nodes = vec![
            TopologyNode { node_id: 1, lon: 0.0, lat: 0.0 },
            TopologyNode { node_id: 1, lon: 1.0, lat: 1.0 },
        ];
        let err = RoadGraph::load(TopologyArtifact { nodes, edges: vec![] }).unwrap_err();
        assert!(err.is_fatal());
    }
}
