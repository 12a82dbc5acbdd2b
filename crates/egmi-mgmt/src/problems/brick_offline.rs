use std::time::Duration;

use super::CommandContext;
use crate::error::SolveResult;
use crate::partition::active_nodes;
use crate::remote::Operation;
use crate::system_status::SystemStatus;
use crate::types::{BrickId, Volume};

/// A brick the cluster reports OFFLINE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrickOffline {
    pub volume: Volume,
    pub brick: BrickId,
}

impl BrickOffline {
    pub fn new(volume: Volume, brick: BrickId) -> Self {
        Self { volume, brick }
    }

    pub fn id(&self) -> String {
        format!("BRICK_OFFLINE-{}-{}", self.volume, self.brick)
    }

    pub fn recognize(&self, status: &SystemStatus) -> bool {
        status
            .brick(&self.volume, &self.brick)
            .and_then(|b| b.status.as_deref())
            .map_or(false, |s| s.trim() == "OFFLINE")
    }

    /// Force-starts the volume from the brick's node once the grace period
    /// is over. Volumes in a transient state are left alone.
    pub async fn solve(&self, ctx: &CommandContext, age: Duration) -> SolveResult {
        if age < Duration::from_secs(ctx.timeouts.brick_offline_secs) {
            return Ok(false);
        }
        let node = &self.brick.node;
        ctx.info(format!("- Solving {}", self.id()));

        let statuses = ctx.fetch_statuses().await;
        if !active_nodes(&statuses).contains(node) {
            ctx.info(format!("  !! Node {} is not active", node));
            return Ok(false);
        }
        let status = &statuses[node];

        let Some(info) = status.volume_information(node, &self.volume)? else {
            ctx.info(format!("  !! Volume {} is unknown to {}", self.volume, node));
            return Ok(false);
        };
        if info.status.as_deref().map_or(false, |s| s.contains("TEMP")) {
            ctx.info(format!("  !! Volume {} is in a transient state", self.volume));
            return Ok(false);
        }

        let still_offline = status
            .volume_bricks_information(node, &self.volume)?
            .get(&self.brick)
            .and_then(|b| b.status.as_deref())
            .map_or(false, |s| s.trim() == "OFFLINE");
        if !still_offline {
            return Ok(false);
        }

        ctx.info(format!("  + Force starting {} on {}", self.volume, node));
        ctx.execute_simple_operation(
            &Operation::VolumeStart {
                volume: self.volume.clone(),
                force: true,
            },
            node,
        )
        .await?;
        Ok(true)
    }
}
