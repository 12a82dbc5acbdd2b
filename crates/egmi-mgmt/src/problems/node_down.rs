use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::CommandContext;
use crate::allocation::{brick_path, build_replica_unallocation};
use crate::error::{Resolution, SolveResult};
use crate::node_status::{BrickInformation, NodeStatus, VolumeInformation};
use crate::partition::active_connected_nodes;
use crate::remote::Operation;
use crate::settings::DISCOVERED_NODES;
use crate::system_status::{NodeState, SystemStatus};
use crate::types::{BrickId, Node, Volume};

/// A KO node hosts bricks of a volume.
///
/// Past the grace period the lost bricks are relocated. Replicated volumes
/// get the brick moved to a free node, or to a node outside the brick's
/// replica set, or as a last resort lose one replica column. Bricks of
/// non-replicated volumes are left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDown {
    pub volume: Volume,
    pub host: Node,
}

impl NodeDown {
    pub fn new(volume: Volume, host: Node) -> Self {
        Self { volume, host }
    }

    pub fn id(&self) -> String {
        format!("NODE_DOWN-{}-{}", self.volume, self.host)
    }

    pub fn recognize(&self, status: &SystemStatus) -> bool {
        match status.node_state(&self.host) {
            None => true,
            Some(NodeState::Ko) => status
                .volume(&self.volume)
                .map_or(false, |v| v.bricks.iter().any(|b| b.node == self.host)),
            Some(_) => false,
        }
    }

    pub async fn solve(&self, ctx: &CommandContext, age: Duration) -> SolveResult {
        ctx.info(format!("- Solving {} (age ms = {})", self.id(), age.as_millis()));
        if age < Duration::from_secs(ctx.timeouts.node_down_secs) {
            return Ok(false);
        }

        let statuses = ctx.fetch_statuses().await;
        let active = active_connected_nodes(&statuses);
        if active.contains(&self.host) {
            ctx.info(format!("  + Node {} is back up", self.host));
            return Ok(true);
        }
        let Some(first) = active.iter().next() else {
            ctx.info("  !! All nodes are down.");
            return Ok(false);
        };

        let node_bricks = statuses[first].node_bricks_and_volumes(first, &self.host)?;
        if node_bricks.is_empty() {
            if ctx.configured_nodes.contains(&self.host) {
                ctx.info(format!(
                    "  + Node {} doesn't contain any volume but is a managed node. skipping.",
                    self.host
                ));
                return Ok(false);
            }
            ctx.info(format!(
                "  + Node {} doesn't contain any volume and is not a managed node. removing from tracked nodes.",
                self.host
            ));
            ctx.settings.remove_from_list(DISCOVERED_NODES, self.host.address())?;
            return Ok(true);
        }

        handle_node_down_bricks(ctx, &self.volume, &self.host, &statuses, &active, &node_bricks).await
    }
}

/// Relocates the bricks of `volume` hosted on the lost node `host`.
///
/// Returns `Ok(false)` when a brick cannot be handled automatically.
pub(crate) async fn handle_node_down_bricks(
    ctx: &CommandContext,
    volume: &Volume,
    host: &Node,
    statuses: &BTreeMap<Node, NodeStatus>,
    active: &BTreeSet<Node>,
    node_bricks: &BTreeMap<BrickId, Volume>,
) -> SolveResult {
    let Some(first) = active.iter().next() else {
        return Ok(false);
    };
    let reporter = &statuses[first];

    for (brick, brick_volume) in node_bricks {
        if brick_volume != volume || &brick.node != host {
            continue;
        }
        ctx.info(format!("  + Handling Brick {}", brick));

        let info = reporter
            .volume_information(first, volume)?
            .ok_or_else(|| Resolution::Skip(format!("no information on volume {}", volume)))?;
        if info.nb_replicas.unwrap_or(1) <= 1 {
            ctx.info(format!("    - {} is NOT replicated. Skipping for now", brick));
            ctx.info(format!("    - {} PROBLEM WON'T BE SOLVED!", brick));
            return Ok(false);
        }
        ctx.info(format!("    - Brick {} is replicated. Can proceed further", brick));

        let bricks = reporter.volume_bricks_information(first, volume)?;
        let brick_nodes: BTreeSet<Node> = bricks.keys().map(|b| b.node.clone()).collect();
        let replica_nodes = brick_replica_nodes(ctx, volume, brick, &info, &bricks)?;
        let execution_node = find_execution_node(brick, &bricks, &replica_nodes, active)?;
        let path = brick_path(&ctx.volume_path, volume);

        let free: Vec<&Node> = active.iter().filter(|n| !brick_nodes.contains(*n)).collect();
        if let Some(target) = free.first() {
            let to = BrickId::new((*target).clone(), path);
            ctx.info(format!("      + Replacing Brick on FREE node {} with {}", brick, to));
            replace_brick(ctx, volume, brick, to, &execution_node).await?;
            continue;
        }

        let outside_replica_set = active.iter().find(|n| !replica_nodes.contains(*n));
        if let Some(target) = outside_replica_set {
            let counter = bricks.keys().filter(|b| &b.node == target).count() + 1;
            let to = BrickId::new(target.clone(), format!("{}_{}", path, counter));
            ctx.info(format!("      + Replacing Brick on BUSY node {} with {}", brick, to));
            replace_brick(ctx, volume, brick, to, &execution_node).await?;
            continue;
        }

        let replicas = info.nb_replicas.unwrap_or(1) as usize;
        let shards = info.nb_shards.unwrap_or(1) as usize;
        let removed = build_replica_unallocation(&bricks, host, replicas, shards);
        ctx.info(format!(
            "      !!! Removing Bricks {}",
            removed.iter().map(BrickId::to_string).collect::<Vec<_>>().join(", ")
        ));
        ctx.execute_simple_operation(
            &Operation::VolumeRemoveBrick {
                volume: volume.clone(),
                replicas: replicas - 1,
                bricks: removed,
            },
            &execution_node,
        )
        .await?;
    }
    Ok(true)
}

async fn replace_brick(
    ctx: &CommandContext,
    volume: &Volume,
    from: &BrickId,
    to: BrickId,
    execution_node: &Node,
) -> Result<(), Resolution> {
    ctx.execute_simple_operation(
        &Operation::VolumeReplaceBrick {
            volume: volume.clone(),
            from: from.clone(),
            to,
        },
        execution_node,
    )
    .await
}

/// Number of the first brick of the replica set containing brick `number`.
pub(crate) fn replica_set_first(number: u32, replicas: u32) -> u32 {
    let offset = match number % replicas {
        0 => replicas,
        r => r,
    };
    (number + 1).saturating_sub(offset).max(1)
}

fn brick_replica_nodes(
    ctx: &CommandContext,
    volume: &Volume,
    brick: &BrickId,
    info: &VolumeInformation,
    bricks: &BTreeMap<BrickId, BrickInformation>,
) -> Result<BTreeSet<Node>, Resolution> {
    let replicas = info
        .nb_replicas
        .ok_or_else(|| Resolution::Stop(format!("Cannot get volume {} number of replicas", volume)))?
        + info.nb_arbiters.unwrap_or(0);
    let replicas = replicas.max(1);
    let number = bricks
        .get(brick)
        .and_then(|b| b.number)
        .ok_or_else(|| Resolution::Stop(format!("Cannot get brick {} number", brick)))?;

    let first = replica_set_first(number, replicas);
    let last = first + replicas - 1;
    ctx.info(format!(
        "      + Brick {} is among replica set [{}-{}]",
        brick, first, last
    ));

    let mut nodes = BTreeSet::new();
    for (other, other_info) in bricks {
        let other_number = other_info
            .number
            .ok_or_else(|| Resolution::Skip(format!("Couldn't get brick number of brick {}", other)))?;
        if (first..=last).contains(&other_number) {
            nodes.insert(other.node.clone());
        }
    }
    Ok(nodes)
}

/// A live node holding a replica of `brick`; volume commands must run there.
fn find_execution_node(
    brick: &BrickId,
    bricks: &BTreeMap<BrickId, BrickInformation>,
    replica_nodes: &BTreeSet<Node>,
    active: &BTreeSet<Node>,
) -> Result<Node, Resolution> {
    bricks
        .keys()
        .map(|b| &b.node)
        .find(|n| replica_nodes.contains(*n) && active.contains(*n))
        .cloned()
        .ok_or_else(|| {
            Resolution::Skip(format!(
                "Impossible to find a node running a replica of brick {}",
                brick
            ))
        })
}
