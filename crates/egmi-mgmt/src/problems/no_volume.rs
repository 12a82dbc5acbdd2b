use std::collections::BTreeMap;
use std::time::Duration;

use super::CommandContext;
use crate::allocation::build_new_volume_brick_allocation;
use crate::error::{Resolution, SolveResult};
use crate::partition::active_connected_nodes;
use crate::remote::Operation;
use crate::settings::DISCOVERED_VOLUMES;
use crate::system_status::SystemStatus;
use crate::types::{Node, Volume};

/// A volume the cluster should have but no node knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoVolume {
    pub volume: Volume,
}

impl NoVolume {
    pub fn new(volume: Volume) -> Self {
        Self { volume }
    }

    pub fn id(&self) -> String {
        format!("NO_VOLUME-{}", self.volume)
    }

    pub fn recognize(&self, status: &SystemStatus) -> bool {
        status
            .volume(&self.volume)
            .map_or(true, |v| v.status.contains("NO VOLUME"))
    }

    /// Creates a configured volume. A volume that was only discovered is
    /// forgotten once it has been missing long enough.
    pub async fn solve(&self, ctx: &CommandContext, age: Duration) -> SolveResult {
        if !ctx.configured_volumes.contains(&self.volume) {
            if age < Duration::from_secs(ctx.timeouts.no_volume_secs) {
                return Ok(false);
            }
            ctx.info(format!("- Forgetting volume {}", self.volume));
            ctx.settings.remove_from_list(DISCOVERED_VOLUMES, self.volume.name())?;
            return Ok(true);
        }

        ctx.info(format!("- Solving {}", self.id()));
        create_volume(ctx, &self.volume).await
    }
}

/// Creates and starts `volume` on the least loaded active nodes, with the
/// layout targeted for the active node count.
pub async fn create_volume(ctx: &CommandContext, volume: &Volume) -> SolveResult {
    let statuses = ctx.fetch_statuses().await;
    let active = active_connected_nodes(&statuses);
    if active.is_empty() {
        ctx.info(format!("  !! No active node to create {}", volume));
        return Ok(false);
    }

    let layout = ctx.layout(active.len());
    let mut brick_counts: BTreeMap<Node, usize> = BTreeMap::new();
    for node in &active {
        let info = statuses[node].node_information(node)?;
        brick_counts.insert(node.clone(), info.brick_count);
    }

    let bricks = build_new_volume_brick_allocation(volume, &ctx.volume_path, &brick_counts, &layout)?;
    let Some(exec) = bricks.first().map(|b| b.node.clone()) else {
        return Err(Resolution::Skip(format!("no brick allocated for {}", volume)));
    };

    ctx.info(format!(
        "  + Creating volume {} with {} bricks and {} replicas",
        volume,
        bricks.len(),
        layout.replicas
    ));
    ctx.execute_simple_operation(
        &Operation::VolumeCreate {
            volume: volume.clone(),
            replicas: layout.replicas,
            bricks,
        },
        &exec,
    )
    .await?;

    ctx.info(format!("  + Starting volume {}", volume));
    ctx.execute_simple_operation(
        &Operation::VolumeStart {
            volume: volume.clone(),
            force: false,
        },
        &exec,
    )
    .await?;
    Ok(true)
}
