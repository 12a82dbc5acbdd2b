use std::collections::BTreeSet;

use super::node_down::handle_node_down_bricks;
use super::CommandContext;
use crate::error::{Resolution, SolveResult};
use crate::partition::active_nodes;
use crate::remote::Operation;
use crate::system_status::{NodeState, SystemStatus};
use crate::types::{Node, Volume};

/// `other` lists `host` as peer but `host` does not list `other`.
///
/// The bricks of `host` are relocated first, then `host` is detached from
/// `other`'s pool and probed again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInconsistent {
    pub host: Node,
    pub other: Node,
}

impl NodeInconsistent {
    pub fn new(host: Node, other: Node) -> Self {
        Self { host, other }
    }

    pub fn id(&self) -> String {
        format!("NODE_INCONSISTENT-{}-{}", self.host, self.other)
    }

    pub fn recognize(&self, status: &SystemStatus) -> bool {
        matches!(status.node_state(&self.host), None | Some(NodeState::Inconsistent))
    }

    pub async fn solve(&self, ctx: &CommandContext) -> SolveResult {
        let host = &self.host;
        ctx.info(format!("- Solving {}", self.id()));

        let statuses = ctx.fetch_statuses().await;
        let mut active = active_nodes(&statuses);
        if !active.remove(host) {
            ctx.info(format!("  !! Node {} is not active", host));
            return Ok(false);
        }
        let Some(reporter) = active.iter().next() else {
            return Err(Resolution::Skip(format!("no active node besides {}", host)));
        };

        let node_bricks = statuses[reporter].node_bricks_and_volumes(reporter, host)?;
        let volumes: BTreeSet<&Volume> = node_bricks.values().collect();
        for volume in volumes {
            if !handle_node_down_bricks(ctx, volume, host, &statuses, &active, &node_bricks).await? {
                return Ok(false);
            }
        }

        ctx.info(format!(
            "  + Force detaching {} from {} peer pool.",
            host, self.other
        ));
        ctx.execute_simple_operation(&Operation::PeerDetach { host: host.clone() }, &self.other)
            .await?;

        ctx.info(format!("  + Re-adding {} to {} peer pool.", host, self.other));
        ctx.execute_simple_operation(&Operation::PeerProbe { host: host.clone() }, &self.other)
            .await?;

        ctx.check_host_in_peer_pool(&self.other, host).await
    }
}
