//! Brick placement planning.
//!
//! Pure functions over the current placement of a volume's bricks. The same
//! input always yields the same plan, so a cycle retried after a partial
//! failure proposes the same bricks again.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::Resolution;
use crate::layout::RuntimeLayout;
use crate::node_status::{sort_by_number, BrickInformation};
use crate::types::{BrickId, Node, Volume};

/// Path of the brick of `volume` under the brick root `volume_path`.
pub fn brick_path(volume_path: &str, volume: &Volume) -> String {
    let sep = if volume_path.ends_with('/') { "" } else { "/" };
    format!("{}{}{}", volume_path, sep, volume)
}

/// Orders nodes by ascending brick count, then by address.
pub fn sort_nodes_by_brick_count(brick_counts: &BTreeMap<Node, usize>) -> Vec<Node> {
    let mut nodes: Vec<(&Node, usize)> = brick_counts.iter().map(|(n, c)| (n, *c)).collect();
    nodes.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    nodes.into_iter().map(|(n, _)| n.clone()).collect()
}

fn volume_nodes(bricks: &BTreeMap<BrickId, BrickInformation>) -> BTreeSet<Node> {
    bricks.keys().map(|b| b.node.clone()).collect()
}

/// Bricks for a brand new volume: `shards × replicas` bricks taken from the
/// least loaded nodes, replicas of a shard kept consecutive.
pub fn build_new_volume_brick_allocation(
    volume: &Volume,
    volume_path: &str,
    brick_counts: &BTreeMap<Node, usize>,
    layout: &RuntimeLayout,
) -> Result<Vec<BrickId>, Resolution> {
    let sorted = sort_nodes_by_brick_count(brick_counts);
    let wanted = layout.shards * layout.replicas;
    if wanted == 0 {
        return Err(Resolution::Skip(format!("no brick to allocate for {}", volume)));
    }
    if sorted.len() < wanted {
        return Err(Resolution::Skip(format!(
            "{} bricks needed for {} but only {} nodes available",
            wanted,
            volume,
            sorted.len()
        )));
    }

    let path = brick_path(volume_path, volume);
    Ok(sorted
        .into_iter()
        .take(wanted)
        .map(|node| BrickId::new(node, path.clone()))
        .collect())
}

/// One new brick per existing shard, raising the replica count by one.
///
/// Each shard gets a node not hosting the volume yet, or failing that a node
/// outside that shard's replica set. Raises a stop signal when a shard has
/// no eligible node.
pub fn build_new_replicas_brick_allocation(
    volume: &Volume,
    bricks: &BTreeMap<BrickId, BrickInformation>,
    current_replicas: usize,
    current_shards: usize,
    volume_path: &str,
    sorted_nodes: &[Node],
) -> Result<Vec<BrickId>, Resolution> {
    let replicas = current_replicas.max(1);
    let mut shard_nodes: BTreeMap<usize, BTreeSet<Node>> = BTreeMap::new();
    for (index, brick) in sort_by_number(bricks).into_iter().enumerate() {
        shard_nodes.entry(index / replicas).or_default().insert(brick.node);
    }

    let used = volume_nodes(bricks);
    let mut chosen: Vec<Node> = Vec::new();
    for shard in 0..current_shards {
        let in_shard = shard_nodes.get(&shard).cloned().unwrap_or_default();

        let free = sorted_nodes
            .iter()
            .find(|n| !used.contains(*n) && !chosen.contains(*n));
        let target = match free {
            Some(node) => node.clone(),
            None => sorted_nodes
                .iter()
                .find(|n| !in_shard.contains(*n) && !chosen.contains(*n))
                .cloned()
                .ok_or_else(|| {
                    Resolution::Stop(format!(
                        "impossible to find a node not running shard {} replicas",
                        shard
                    ))
                })?,
        };
        chosen.push(target);
    }

    let path = brick_path(volume_path, volume);
    Ok(chosen
        .into_iter()
        .map(|node| BrickId::new(node, path.clone()))
        .collect())
}

/// Bricks for one additional shard: `current_replicas` nodes not hosting the
/// volume yet.
pub fn build_new_shard_brick_allocation(
    volume: &Volume,
    bricks: &BTreeMap<BrickId, BrickInformation>,
    current_replicas: usize,
    volume_path: &str,
    sorted_nodes: &[Node],
) -> Result<Vec<BrickId>, Resolution> {
    let used = volume_nodes(bricks);
    let free: Vec<&Node> = sorted_nodes.iter().filter(|n| !used.contains(*n)).collect();
    if free.len() < current_replicas {
        return Err(Resolution::Skip(format!(
            "{} free nodes needed for a new shard of {}, found {}",
            current_replicas,
            volume,
            free.len()
        )));
    }

    let path = brick_path(volume_path, volume);
    Ok(free
        .into_iter()
        .take(current_replicas)
        .map(|node| BrickId::new(node.clone(), path.clone()))
        .collect())
}

/// Bricks to remove when `vanished` is gone and the replica count shrinks.
///
/// With a single shard or a single replica only the vanished node's bricks
/// go. Otherwise the whole replica column of the vanished brick is dropped
/// from every shard.
pub fn build_replica_unallocation(
    bricks: &BTreeMap<BrickId, BrickInformation>,
    vanished: &Node,
    current_replicas: usize,
    current_shards: usize,
) -> Vec<BrickId> {
    let sorted = sort_by_number(bricks);
    if sorted.is_empty() {
        return Vec::new();
    }

    if current_shards == 1 || current_replicas <= 1 {
        return sorted.into_iter().filter(|b| &b.node == vanished).collect();
    }

    let column = |id: &BrickId| bricks[id].number.map(|n| n as usize % current_replicas);
    let vanished_column = sorted
        .iter()
        .filter(|b| &b.node == vanished)
        .filter_map(|b| column(b))
        .last();

    match vanished_column {
        Some(col) => sorted
            .into_iter()
            .filter(|b| column(b) == Some(col))
            .collect(),
        None => Vec::new(),
    }
}
