use std::collections::BTreeMap;
use tracing::error;

use super::CommandContext;
use crate::allocation::{
    build_new_replicas_brick_allocation, build_new_shard_brick_allocation, sort_nodes_by_brick_count,
};
use crate::error::{NodeStatusError, Resolution, SolveResult};
use crate::partition::active_nodes;
use crate::remote::Operation;
use crate::system_status::SystemStatus;
use crate::types::{BrickId, Node, Volume};

/// A managed volume with fewer bricks than its target layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingBrick {
    pub volume: Volume,
    pub target: usize,
    pub actual: usize,
}

impl MissingBrick {
    pub fn new(volume: Volume, target: usize, actual: usize) -> Self {
        Self { volume, target, actual }
    }

    pub fn id(&self) -> String {
        format!(
            "MISSING_BRICK-{}-{}",
            self.volume,
            self.target.saturating_sub(self.actual)
        )
    }

    pub fn recognize(&self, status: &SystemStatus) -> bool {
        status
            .volume(&self.volume)
            .map_or(false, |v| v.bricks.len() < self.target)
    }

    /// Grows the volume one step: one more replica on every shard while the
    /// replica target is not met, otherwise one more shard on free nodes.
    pub async fn solve(&self, ctx: &CommandContext) -> SolveResult {
        ctx.info(format!("- Solving {}", self.id()));
        match self.grow(ctx).await {
            Err(Grow::Status(e)) => {
                error!("{}", e);
                Ok(false)
            }
            Err(Grow::Resolution(r)) => Err(r),
            Ok(solved) => Ok(solved),
        }
    }

    async fn grow(&self, ctx: &CommandContext) -> Result<bool, Grow> {
        let volume = &self.volume;
        let statuses = ctx.fetch_statuses().await;
        let active = active_nodes(&statuses);
        let Some(first) = active.iter().next() else {
            ctx.info("  !! no active node. skipping");
            return Ok(false);
        };
        let status = &statuses[first];

        let info = status.volume_information(first, volume)?;
        let volume_status = info.as_ref().and_then(|i| i.status.as_deref()).unwrap_or("");
        if volume_status.trim().is_empty() {
            ctx.info("  !! Cannot get volume information");
            return Err(Resolution::Skip(format!("no information on {}", volume)).into());
        }
        if volume_status != "OK" {
            ctx.info("  !! Volume status is not OK ");
            return Err(Resolution::Skip(format!("{} is {}", volume, volume_status)).into());
        }
        let info = info.unwrap_or_default();

        let volume_nodes = status.volume_nodes(first, volume)?;
        let bricks = status.volume_bricks_information(first, volume)?;
        let current_replicas = info.nb_replicas.map_or(1, |r| r.max(1) as usize);
        let current_shards = match info.nb_shards {
            Some(s) if s > 0 => s as usize,
            _ => return Err(Resolution::Skip(format!("unknown shard count for {}", volume)).into()),
        };
        let current_bricks = current_shards * current_replicas;

        let layout = ctx.layout(active.len());
        let target_replicas = layout.replicas.max(current_replicas);
        let target_shards = layout.shards.max(current_shards);
        if current_bricks >= target_replicas * target_shards {
            ctx.info("  + Already have maximum allocatable Nb Bricks. Skipping");
            return Ok(false);
        }

        if current_replicas >= active.len() / current_shards
            && current_shards >= active.len() / current_replicas
        {
            ctx.info(format!(
                "  + Cannot add any new brick (already {} replicas / {} shards - on {} nodes). Skipping",
                current_replicas,
                current_shards,
                active.len()
            ));
            return Ok(false);
        }

        let mut brick_counts: BTreeMap<Node, usize> = BTreeMap::new();
        for node in &active {
            brick_counts.insert(node.clone(), status.node_information(node)?.brick_count);
        }
        let sorted = sort_nodes_by_brick_count(&brick_counts);

        let replicas_to_create = active.len().saturating_sub(current_bricks) / current_shards;
        if replicas_to_create > 0 && current_replicas < target_replicas {
            ctx.info("  + Adding one replica to every shard");
            let new_bricks = build_new_replicas_brick_allocation(
                volume,
                &bricks,
                current_replicas,
                current_shards,
                &ctx.volume_path,
                &sorted,
            )?;
            self.add_bricks(ctx, current_replicas + 1, new_bricks).await?;
            return Ok(true);
        }

        let free_nodes = sorted.iter().filter(|n| !volume_nodes.contains(*n)).count();
        if free_nodes >= current_replicas && current_shards < target_shards {
            ctx.info("  + Adding one shard with replicas");
            let new_bricks =
                build_new_shard_brick_allocation(volume, &bricks, current_replicas, &ctx.volume_path, &sorted)?;
            self.add_bricks(ctx, current_replicas, new_bricks).await?;
            return Ok(true);
        }

        ctx.info(format!(
            "  + Cannot add anything new with [current {} replicas / {} shards ] on [target {} replicas / {} shards] with {} active nodes",
            current_replicas,
            current_shards,
            target_replicas,
            target_shards,
            active.len()
        ));
        Ok(false)
    }

    async fn add_bricks(
        &self,
        ctx: &CommandContext,
        replicas: usize,
        bricks: Vec<BrickId>,
    ) -> Result<(), Resolution> {
        let Some(exec) = bricks.first().map(|b| b.node.clone()) else {
            return Err(Resolution::Skip(format!("no brick allocated for {}", self.volume)));
        };
        ctx.info(format!(
            "    - Bricks are {}",
            bricks.iter().map(|b| b.to_string()).collect::<Vec<_>>().join(", ")
        ));
        ctx.execute_simple_operation(
            &Operation::VolumeAddBrick {
                volume: self.volume.clone(),
                replicas,
                bricks,
            },
            &exec,
        )
        .await
    }
}

/// Failure while growing: unreadable node reports end the attempt quietly,
/// resolution signals propagate.
enum Grow {
    Status(NodeStatusError),
    Resolution(Resolution),
}

impl From<NodeStatusError> for Grow {
    fn from(e: NodeStatusError) -> Self {
        Grow::Status(e)
    }
}

impl From<Resolution> for Grow {
    fn from(r: Resolution) -> Self {
        Grow::Resolution(r)
    }
}
