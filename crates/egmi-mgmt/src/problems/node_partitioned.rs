use std::collections::BTreeSet;
use tracing::error;

use super::{force_delete_volume, CommandContext};
use crate::error::{Resolution, SolveResult};
use crate::node_status::NodeStatus;
use crate::partition::{active_nodes, peer_times_volume_counters, PeerGraph};
use crate::remote::Operation;
use crate::system_status::{NodeState, SystemStatus};
use crate::types::{Node, Volume};

/// A node outside the best-connected peer group.
///
/// The remedy moves the node into the best isolated group: it drops the
/// volumes it holds, leaves its current peers and gets probed from a node of
/// the target group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePartitioned {
    pub host: Node,
}

impl NodePartitioned {
    pub fn new(host: Node) -> Self {
        Self { host }
    }

    pub fn id(&self) -> String {
        format!("NODE_PARTITIONED-{}", self.host)
    }

    pub fn recognize(&self, status: &SystemStatus) -> bool {
        matches!(status.node_state(&self.host), None | Some(NodeState::Partitioned))
    }

    pub async fn solve(&self, ctx: &CommandContext) -> SolveResult {
        let host = &self.host;
        ctx.info(format!("- Solving {}", self.id()));

        let statuses = ctx.fetch_statuses().await;
        let active = active_nodes(&statuses);
        if !active.contains(host) {
            ctx.info(format!("  !! Node {} is not active", host));
            return Ok(false);
        }

        let graph = PeerGraph::build(&active, &statuses);
        let counters = peer_times_volume_counters(&active, &graph, &statuses);
        let highest = counters.values().copied().max().unwrap_or(0);
        let host_peers = graph.reachable(host);

        let candidates: BTreeSet<Node> = counters
            .iter()
            .filter(|(n, c)| **c == highest && !host_peers.contains(*n))
            .map(|(n, _)| n.clone())
            .collect();
        ctx.info(format!("  + Candidates {}", join(&candidates)));
        if candidates.is_empty() {
            return Ok(false);
        }

        let isolated: BTreeSet<Node> = candidates
            .into_iter()
            .filter(|c| graph.reachable(c).is_disjoint(&host_peers))
            .collect();
        ctx.info(format!("  + Isolated Candidates {}", join(&isolated)));
        if isolated.is_empty() {
            return Ok(false);
        }

        if host_peers.len() > 1 {
            ctx.info(format!(
                "  + Need to disconnect {} from {} peers",
                host,
                host_peers.len() - 1
            ));
            self.drop_volumes(ctx, &statuses[host]).await?;
            self.detach_from(ctx, &host_peers).await?;
        }

        ctx.info("  + Attaching to new cluster");
        for candidate in &isolated {
            ctx.info(format!("    - Trying to attach to candidate {}", candidate));
            let result = ctx
                .remote
                .execute(&Operation::PeerProbe { host: host.clone() }, candidate)
                .await?;
            if !result.success {
                ctx.error(format!(
                    "      ! Attaching {} to {} failed. Trying next candidate if available.",
                    host, candidate
                ));
                error!("{}", result.message);
                continue;
            }
            ctx.info(format!("        + peer probe {} on {} succeeded", host, candidate));
            return ctx.check_host_in_peer_pool(candidate, host).await;
        }

        ctx.error("  + Failed to attach to any candidate.");
        Err(Resolution::Stop("Failed to attach to any candidate.".to_string()))
    }

    async fn drop_volumes(&self, ctx: &CommandContext, status: &NodeStatus) -> Result<(), Resolution> {
        let host = &self.host;
        let volumes: BTreeSet<Volume> = status
            .node_bricks_and_volumes(host, host)?
            .into_values()
            .collect();

        for volume in &volumes {
            ctx.info(format!("    - Forcing removal of volume {} !", volume));
            let started = status
                .volume_information(host, volume)?
                .and_then(|info| info.status)
                .map_or(false, |s| s == "OK");
            let brick_nodes = status.volume_nodes(host, volume)?;
            force_delete_volume(ctx, volume, host, &brick_nodes, started).await?;
        }
        Ok(())
    }

    async fn detach_from(&self, ctx: &CommandContext, peers: &BTreeSet<Node>) -> Result<(), Resolution> {
        let host = &self.host;
        for peer in peers.iter().filter(|p| *p != host) {
            ctx.info(format!("    - Detaching peer {}", peer));
            let result = ctx
                .remote
                .execute(&Operation::PeerDetach { host: host.clone() }, peer)
                .await?;
            if result.success {
                return Ok(());
            }
            ctx.error(format!(
                "        ! Detaching {} from {} failed. Trying next.",
                host, peer
            ));
            error!("{}", result.message);
        }
        ctx.error("    - Detaching host failed! ");
        Err(Resolution::Stop(format!("{} could not be detached", host)))
    }
}

fn join(nodes: &BTreeSet<Node>) -> String {
    nodes.iter().map(Node::address).collect::<Vec<_>>().join(", ")
}
