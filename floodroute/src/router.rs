// floodroute/src/router.rs
//
// Router (C7) — risk-aware shortest path with three cost policies and the
// impassability contract (spec §4.7). Hand-rolled A* over a BinaryHeap
// rather than the pack's `pathfinding` crate (see dzautner-megacity's
// road_graph_csr/pathfinding.rs for the analogous successors/heuristic
// shape): the spec requires deterministic smaller-node_id tie-breaking,
// which `pathfinding::astar` does not expose. Costs are non-negative and
// finite, so IEEE-754 bit order doubles as numeric order in the priority
// queue key — no NaN-safe float wrapper needed.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::Direction;

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::events::{NodeId, Policy, RiskLevel, RouteResult, RouteStatus};
use crate::graph::{haversine_m, EdgeSnapshot, GraphView};

const SAFEST_THRESHOLD: f64 = 0.6;
const BALANCED_THRESHOLD: f64 = 0.8;
const FASTEST_THRESHOLD: f64 = 0.95;

fn threshold_for(policy: Policy) -> f64 {
    match policy {
        Policy::Safest => SAFEST_THRESHOLD,
        Policy::Balanced => BALANCED_THRESHOLD,
        Policy::Fastest => FASTEST_THRESHOLD,
    }
}

fn risk_multiplier(policy: Policy) -> f64 {
    match policy {
        Policy::Safest => 4.0,
        Policy::Balanced => 1.5,
        Policy::Fastest => 0.0,
    }
}

fn speed_ms(config: &Config, road_class: &str) -> f64 {
    (config.speed_for(road_class) * 1000.0 / 3600.0).max(0.1)
}

fn edge_time_s(e: &EdgeSnapshot, config: &Config) -> f64 {
    e.length_m / speed_ms(config, e.road_class.as_str())
}

fn edge_cost(e: &EdgeSnapshot, policy: Policy, config: &Config) -> f64 {
    edge_time_s(e, config) * (1.0 + risk_multiplier(policy) * e.risk)
}

fn max_speed_ms(config: &Config) -> f64 {
    config
        .speed_table
        .values()
        .copied()
        .fold(1.0f64, f64::max)
        * 1000.0
        / 3600.0
}

/// Monotonic priority key for a non-negative, finite cost: IEEE-754 bit
/// pattern order matches numeric order for this domain.
fn cost_key(v: f64) -> u64 {
    debug_assert!(v.is_finite() && v >= 0.0, "non-negative finite cost expected, got {v}");
    v.max(0.0).to_bits()
}

struct SearchOutcome {
    nodes: Vec<NodeIndex>,
    edges: Vec<EdgeIndex>,
}

/// A* search (spec §4.7): f = g + h, open set is a binary heap keyed by
/// (f, node_id) so ties resolve to the smaller node_id; a closed set
/// prevents revisits. `risk_ceiling`, when set, excludes edges at or above
/// it from the search entirely (the policy's rejection rule). Returns
/// `Err(())` if `max_expansions` is exceeded before the goal is reached.
#[allow(clippy::too_many_arguments)]
fn astar_search(
    view: &GraphView,
    start: NodeIndex,
    goal: NodeIndex,
    policy: Policy,
    risk_ceiling: Option<f64>,
    config: &Config,
    max_expansions: usize,
) -> Result<Option<SearchOutcome>, ()> {
    let goal_lonlat = view.node_lonlat(goal);
    let max_speed = max_speed_ms(config);
    let h = |idx: NodeIndex| -> f64 {
        let (lon, lat) = view.node_lonlat(idx);
        haversine_m(lat, lon, goal_lonlat.1, goal_lonlat.0) / max_speed
    };

    let mut open: BinaryHeap<Reverse<(u64, NodeId, NodeIndex)>> = BinaryHeap::new();
    let mut g_score: HashMap<NodeIndex, f64> = HashMap::new();
    let mut came_from: HashMap<NodeIndex, (NodeIndex, EdgeIndex)> = HashMap::new();
    let mut closed: HashSet<NodeIndex> = HashSet::new();

    g_score.insert(start, 0.0);
    open.push(Reverse((cost_key(h(start)), view.node_id_of(start), start)));

    let mut expansions = 0usize;

    while let Some(Reverse((_, _, current))) = open.pop() {
        if current == goal {
            let mut nodes = vec![current];
            let mut edges = Vec::new();
            let mut cur = current;
            while let Some(&(prev, edge)) = came_from.get(&cur) {
                nodes.push(prev);
                edges.push(edge);
                cur = prev;
            }
            nodes.reverse();
            edges.reverse();
            return Ok(Some(SearchOutcome { nodes, edges }));
        }
        if !closed.insert(current) {
            continue;
        }

        expansions += 1;
        if expansions > max_expansions {
            return Err(());
        }

        let cur_g = g_score[&current];
        for edge_ref in view.inner().edges_directed(current, Direction::Outgoing) {
            let next = edge_ref.target();
            if closed.contains(&next) {
                continue;
            }
            let e = edge_ref.weight();
            if let Some(ceiling) = risk_ceiling {
                if e.risk >= ceiling {
                    continue;
                }
            }
            let tentative = cur_g + edge_cost(e, policy, config);
            let improves = g_score.get(&next).map(|&g| tentative < g).unwrap_or(true);
            if improves {
                g_score.insert(next, tentative);
                came_from.insert(next, (current, edge_ref.id()));
                open.push(Reverse((cost_key(tentative + h(next)), view.node_id_of(next), next)));
            }
        }
    }

    Ok(None)
}

fn path_node_ids(view: &GraphView, outcome: &SearchOutcome) -> Vec<NodeId> {
    outcome.nodes.iter().map(|&idx| view.node_id_of(idx)).collect()
}

fn path_distance_m(view: &GraphView, outcome: &SearchOutcome) -> f64 {
    outcome.edges.iter().map(|&e| view.edge_data(e).length_m).sum()
}

fn path_time_s(view: &GraphView, outcome: &SearchOutcome, config: &Config) -> f64 {
    outcome.edges.iter().map(|&e| edge_time_s(view.edge_data(e), config)).sum()
}

fn path_max_risk(view: &GraphView, outcome: &SearchOutcome) -> f64 {
    outcome.edges.iter().map(|&e| view.edge_data(e).risk).fold(0.0, f64::max)
}

fn path_mean_risk(view: &GraphView, outcome: &SearchOutcome) -> f64 {
    if outcome.edges.is_empty() {
        return 0.0;
    }
    let sum: f64 = outcome.edges.iter().map(|&e| view.edge_data(e).risk).sum();
    sum / outcome.edges.len() as f64
}

fn risk_level_for(max_risk: f64) -> RiskLevel {
    if max_risk < 0.3 {
        RiskLevel::Low
    } else if max_risk < 0.7 {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    }
}

fn edges_over_threshold(view: &GraphView, outcome: &SearchOutcome, threshold: f64) -> Vec<String> {
    outcome
        .edges
        .iter()
        .filter_map(|&e| {
            let d = view.edge_data(e);
            (d.risk >= threshold).then(|| format!("edge {}-{} risk={:.3} exceeds threshold {:.2}", d.u, d.v, d.risk, threshold))
        })
        .collect()
}

fn critical_cut(view: &GraphView, outcome: &SearchOutcome) -> Vec<String> {
    let cut: Vec<String> = outcome
        .edges
        .iter()
        .filter_map(|&e| {
            let d = view.edge_data(e);
            (d.risk >= FASTEST_THRESHOLD).then(|| format!("edge {}-{} risk={:.3}", d.u, d.v, d.risk))
        })
        .collect();
    if cut.is_empty() {
        vec!["no edge on the best-effort path reached the critical threshold".to_string()]
    } else {
        cut
    }
}

fn bound_exceeded() -> RouteResult {
    RouteResult {
        path: vec![],
        distance_m: 0.0,
        estimated_time_s: 0.0,
        max_edge_risk: 0.0,
        mean_edge_risk: 0.0,
        risk_level: RiskLevel::Low,
        warnings: vec!["search_bound_exceeded".to_string()],
        status: RouteStatus::Impassable,
    }
}

fn build_result(view: &GraphView, outcome: &SearchOutcome, status: RouteStatus, config: &Config, warnings: Vec<String>) -> RouteResult {
    let max_risk = path_max_risk(view, outcome);
    RouteResult {
        path: path_node_ids(view, outcome),
        distance_m: path_distance_m(view, outcome),
        estimated_time_s: path_time_s(view, outcome, config),
        max_edge_risk: max_risk,
        mean_edge_risk: path_mean_risk(view, outcome),
        risk_level: risk_level_for(max_risk),
        warnings,
        status,
    }
}

/// Compute a route between two coordinates, both snapped via `nearest_node`
/// on the same `GraphView` (spec §4.7 snapshot discipline — risk updates
/// made after the view was taken never affect this call).
pub fn route(
    view: &GraphView,
    start_lonlat: (f64, f64),
    end_lonlat: (f64, f64),
    policy: Policy,
    config: &Config,
    max_expansions: usize,
) -> CoreResult<RouteResult> {
    let start_id = view
        .nearest_node(start_lonlat.0, start_lonlat.1)
        .ok_or_else(|| CoreError::NotFound("no node near start coordinate".into()))?;
    let end_id = view
        .nearest_node(end_lonlat.0, end_lonlat.1)
        .ok_or_else(|| CoreError::NotFound("no node near end coordinate".into()))?;
    let start_idx = view.node_idx(start_id).expect("snapped start node must exist in view");
    let end_idx = view.node_idx(end_id).expect("snapped end node must exist in view");

    if start_idx == end_idx {
        return Ok(RouteResult {
            path: vec![start_id],
            distance_m: 0.0,
            estimated_time_s: 0.0,
            max_edge_risk: 0.0,
            mean_edge_risk: 0.0,
            risk_level: RiskLevel::Low,
            warnings: vec![],
            status: RouteStatus::Ok,
        });
    }

    let own_threshold = threshold_for(policy);

    match astar_search(view, start_idx, end_idx, policy, Some(own_threshold), config, max_expansions) {
        Err(()) => return Ok(bound_exceeded()),
        Ok(Some(outcome)) => return Ok(build_result(view, &outcome, RouteStatus::Ok, config, vec![])),
        Ok(None) => {}
    }

    // Impassability contract retry: relax the rejection threshold toward
    // fastest's (spec §4.7). A policy already searched at 0.95 has nothing
    // left to relax to.
    if policy != Policy::Fastest {
        match astar_search(view, start_idx, end_idx, policy, Some(FASTEST_THRESHOLD), config, max_expansions) {
            Err(()) => return Ok(bound_exceeded()),
            Ok(Some(outcome)) => {
                let warnings = edges_over_threshold(view, &outcome, own_threshold);
                return Ok(build_result(view, &outcome, RouteStatus::NoSafeRoute, config, warnings));
            }
            Ok(None) => {}
        }
    }

    // Final, unconstrained connectivity check: any path at all, ignoring
    // risk, establishes whether this is truly impassable or just blocked at
    // every threshold we tried.
    match astar_search(view, start_idx, end_idx, policy, None, config, max_expansions) {
        Err(()) => Ok(bound_exceeded()),
        Ok(Some(outcome)) => {
            let warnings = critical_cut(view, &outcome);
            Ok(build_result(view, &outcome, RouteStatus::Impassable, config, warnings))
        }
        Ok(None) => Ok(RouteResult {
            path: vec![],
            distance_m: 0.0,
            estimated_time_s: 0.0,
            max_edge_risk: 0.0,
            mean_edge_risk: 0.0,
            risk_level: RiskLevel::Low,
            warnings: vec!["no path exists between start and end in this topology".to_string()],
            status: RouteStatus::Impassable,
        }),
    }
}
