//! Peer reachability analysis and network partition detection.
//!
//! Every peer relationship reported by any node becomes an undirected edge.
//! A node's score is the size of its reachable set, weighted by the number of
//! volumes it reports as soon as any node reports volumes at all.

use std::collections::{BTreeMap, BTreeSet};

use crate::node_status::NodeStatus;
use crate::types::Node;

/// Undirected peer graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerGraph {
    edges: BTreeMap<Node, BTreeSet<Node>>,
}

impl PeerGraph {
    /// Builds the graph over `nodes` from the peers each of them reports.
    ///
    /// Peers outside `nodes` still become vertices. Nodes without status or
    /// whose peer listing failed contribute no edges of their own.
    pub fn build(nodes: &BTreeSet<Node>, statuses: &BTreeMap<Node, NodeStatus>) -> Self {
        let mut graph = PeerGraph::default();
        for host in nodes {
            graph.edges.entry(host.clone()).or_default();
            let Some(peers) = statuses.get(host).and_then(|s| s.all_peers(host).ok()) else {
                continue;
            };
            for peer in peers.into_iter().filter(|p| !p.is_localhost() && p != host) {
                graph.add_edge(host, &peer);
            }
        }
        graph
    }

    fn add_edge(&mut self, a: &Node, b: &Node) {
        self.edges.entry(a.clone()).or_default().insert(b.clone());
        self.edges.entry(b.clone()).or_default().insert(a.clone());
    }

    /// Direct neighbours of `host`.
    pub fn peers(&self, host: &Node) -> Option<&BTreeSet<Node>> {
        self.edges.get(host)
    }

    /// Every node reachable from `host`, `host` included.
    pub fn reachable(&self, host: &Node) -> BTreeSet<Node> {
        let mut visited = BTreeSet::new();
        visited.insert(host.clone());
        let mut stack = vec![host.clone()];
        while let Some(current) = stack.pop() {
            if let Some(peers) = self.edges.get(&current) {
                for peer in peers {
                    if visited.insert(peer.clone()) {
                        stack.push(peer.clone());
                    }
                }
            }
        }
        visited
    }
}

fn volume_count(host: &Node, statuses: &BTreeMap<Node, NodeStatus>) -> usize {
    statuses
        .get(host)
        .and_then(|s| s.all_volumes(host).ok())
        .map(|v| v.len())
        .unwrap_or(0)
}

/// Reachability score of every node in `nodes`.
pub fn peer_times_volume_counters(
    nodes: &BTreeSet<Node>,
    graph: &PeerGraph,
    statuses: &BTreeMap<Node, NodeStatus>,
) -> BTreeMap<Node, usize> {
    let account_volumes = statuses.keys().any(|n| volume_count(n, statuses) > 0);

    nodes
        .iter()
        .map(|host| {
            let reachable = graph.reachable(host).len();
            let score = if account_volumes {
                reachable * volume_count(host, statuses)
            } else {
                reachable
            };
            (host.clone(), score)
        })
        .collect()
}

/// Nodes that should be flagged partitioned.
///
/// Empty when every node reaches every other node. When all scores are equal
/// but below the theoretical maximum every node is returned, otherwise the
/// nodes scoring below the best one.
pub fn detect_partitions(
    nodes: &BTreeSet<Node>,
    statuses: &BTreeMap<Node, NodeStatus>,
) -> BTreeSet<Node> {
    if nodes.is_empty() {
        return BTreeSet::new();
    }

    let graph = PeerGraph::build(nodes, statuses);
    let counters = peer_times_volume_counters(nodes, &graph, statuses);

    let max_volumes = statuses
        .keys()
        .map(|n| volume_count(n, statuses))
        .max()
        .unwrap_or(0)
        .max(1);
    let full_score = nodes.len() * max_volumes;

    if counters.values().all(|&c| c == full_score) {
        return BTreeSet::new();
    }

    let highest = counters.values().copied().max().unwrap_or(0);
    let smallest = counters.values().copied().min().unwrap_or(0);

    if highest == smallest {
        nodes.clone()
    } else {
        counters
            .into_iter()
            .filter(|(_, c)| *c != highest)
            .map(|(n, _)| n)
            .collect()
    }
}

/// Nodes that answered and could list their peer pool.
pub fn active_nodes(statuses: &BTreeMap<Node, NodeStatus>) -> BTreeSet<Node> {
    statuses
        .iter()
        .filter(|(_, s)| !s.is_pool_status_error())
        .map(|(n, _)| n.clone())
        .collect()
}

/// Active nodes belonging to the best-connected peer group.
pub fn active_connected_nodes(statuses: &BTreeMap<Node, NodeStatus>) -> BTreeSet<Node> {
    let active = active_nodes(statuses);
    if active.is_empty() {
        return BTreeSet::new();
    }

    let graph = PeerGraph::build(&active, statuses);
    let counters = peer_times_volume_counters(&active, &graph, statuses);

    let mut best: Option<(&Node, usize)> = None;
    for (node, &count) in &counters {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((node, count));
        }
    }

    match best {
        Some((host, _)) => graph
            .reachable(host)
            .into_iter()
            .filter(|n| active.contains(n))
            .collect(),
        None => BTreeSet::new(),
    }
}
