use std::time::Duration;

use super::CommandContext;
use crate::error::SolveResult;
use crate::partition::active_connected_nodes;
use crate::remote::Operation;
use crate::settings::{DISCOVERED_NODES, STATIC_NODES};
use crate::system_status::{NodeState, SystemStatus};
use crate::types::Node;

/// A node down long enough to be dropped from the peer pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDownRemoval {
    pub host: Node,
}

impl NodeDownRemoval {
    pub fn new(host: Node) -> Self {
        Self { host }
    }

    pub fn id(&self) -> String {
        format!("NODE_DOWN-REMOVAL-{}", self.host)
    }

    /// Holds while the host is down and no volume still places a brick on it.
    pub fn recognize(&self, status: &SystemStatus) -> bool {
        let owns_bricks = status
            .volumes
            .iter()
            .any(|v| v.bricks.iter().any(|b| b.node == self.host));
        !owns_bricks && matches!(status.node_state(&self.host), None | Some(NodeState::Ko))
    }

    /// Detaches the host from the pool and forgets it unless it is part of
    /// the configured nodes. A host still owning bricks is left to the
    /// brick relocation remedies.
    pub async fn solve(&self, ctx: &CommandContext, age: Duration) -> SolveResult {
        if age < Duration::from_secs(ctx.timeouts.node_down_removal_secs) {
            return Ok(false);
        }
        let host = &self.host;
        ctx.info(format!("- Solving {}", self.id()));

        let statuses = ctx.fetch_statuses().await;
        let active = active_connected_nodes(&statuses);
        if active.contains(host) {
            ctx.info(format!("  + Node {} is back", host));
            return Ok(true);
        }
        let Some(other) = active.iter().next() else {
            return Ok(false);
        };

        let Some(reporter) = statuses.get(other) else {
            return Ok(false);
        };
        let bricks = reporter.node_bricks_and_volumes(other, host)?;
        if !bricks.is_empty() {
            ctx.info(format!("  + Node {} still hosts {} brick(s), not detaching", host, bricks.len()));
            return Ok(false);
        }

        if reporter.all_peers(other)?.contains(host) {
            ctx.info(format!("  + Detaching {} from {}", host, other));
            ctx.execute_simple_operation(&Operation::PeerDetach { host: host.clone() }, other)
                .await?;
        }

        if ctx.configured_nodes.contains(host) {
            return Ok(false);
        }
        ctx.info(format!("  + Forgetting node {}", host));
        ctx.settings.remove_from_list(DISCOVERED_NODES, host.address())?;
        ctx.settings.remove_from_list(STATIC_NODES, host.address())?;
        Ok(true)
    }
}
