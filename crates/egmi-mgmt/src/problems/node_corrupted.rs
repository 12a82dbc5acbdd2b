use std::time::Duration;

use super::CommandContext;
use crate::error::SolveResult;
use crate::partition::active_nodes;
use crate::remote::Operation;
use crate::system_status::{NodeState, SystemStatus};
use crate::types::Node;

/// A reachable node whose volume listing fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCorrupted {
    pub host: Node,
}

impl NodeCorrupted {
    pub fn new(host: Node) -> Self {
        Self { host }
    }

    pub fn id(&self) -> String {
        format!("NODE_CORRUPTED-{}", self.host)
    }

    pub fn recognize(&self, status: &SystemStatus) -> bool {
        matches!(status.node_state(&self.host), None | Some(NodeState::Corrupted))
    }

    /// Resets the storage state of the host once its volume listing has
    /// failed for the whole grace period. It comes back without peers and is
    /// re-attached by the partition remedy on a later cycle.
    pub async fn solve(&self, ctx: &CommandContext, age: Duration) -> SolveResult {
        if age < Duration::from_secs(ctx.timeouts.node_corrupted_secs) {
            return Ok(false);
        }
        let host = &self.host;
        ctx.info(format!("- Solving {}", self.id()));

        let statuses = ctx.fetch_statuses().await;
        let Some(status) = statuses.get(host).filter(|_| active_nodes(&statuses).contains(host)) else {
            ctx.info(format!("  !! Node {} is not active", host));
            return Ok(false);
        };
        if !status.volume_status_error {
            ctx.info(format!("  + Node {} lists its volumes again", host));
            return Ok(true);
        }

        ctx.info(format!("  + Force resetting {}", host));
        ctx.execute_simple_operation(&Operation::ForceResetHost { host: host.clone() }, host)
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problems::tests::context;
    use crate::remote_sim::SimulatedCluster;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reset_corrupted_host() {
        let sim = Arc::new(SimulatedCluster::new());
        for n in ["n1", "n2"] {
            sim.add_node(n);
        }
        sim.connect_all(&["n1", "n2"]);
        sim.set_volume_error("n2", true);
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(&sim, dir.path(), &["n1", "n2"]);

        let res = NodeCorrupted::new(Node::new("n2")).solve(&ctx, Duration::ZERO).await;
        assert_eq!(res, Ok(true));
        assert!(sim.peers("n2").is_empty());
        assert_eq!(
            sim.executed(),
            vec![(Node::new("n2"), Operation::ForceResetHost { host: Node::new("n2") })]
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_is_left_alone() {
        let sim = Arc::new(SimulatedCluster::new());
        sim.add_node("n1");
        sim.add_node("n2");
        sim.set_node_up("n2", false);
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(&sim, dir.path(), &["n1", "n2"]);

        assert_eq!(NodeCorrupted::new(Node::new("n2")).solve(&ctx, Duration::ZERO).await, Ok(false));
        assert!(sim.executed().is_empty());
    }

    #[tokio::test]
    async fn test_waits_before_reset() {
        let sim = Arc::new(SimulatedCluster::new());
        for n in ["n1", "n2"] {
            sim.add_node(n);
        }
        sim.connect_all(&["n1", "n2"]);
        sim.set_volume_error("n2", true);
        let dir = tempfile::TempDir::new().unwrap();
        let mut ctx = context(&sim, dir.path(), &["n1", "n2"]);
        ctx.timeouts.node_corrupted_secs = 300;

        let problem = NodeCorrupted::new(Node::new("n2"));
        assert_eq!(problem.solve(&ctx, Duration::from_secs(10)).await, Ok(false));
        assert!(sim.executed().is_empty());

        assert_eq!(problem.solve(&ctx, Duration::from_secs(300)).await, Ok(true));
        assert_eq!(sim.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_recovered_host_is_not_reset() {
        let sim = Arc::new(SimulatedCluster::new());
        for n in ["n1", "n2"] {
            sim.add_node(n);
        }
        sim.connect_all(&["n1", "n2"]);
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(&sim, dir.path(), &["n1", "n2"]);

        let res = NodeCorrupted::new(Node::new("n2")).solve(&ctx, Duration::ZERO).await;
        assert_eq!(res, Ok(true));
        assert!(sim.executed().is_empty());
        assert!(sim.peers("n2").contains(&Node::new("n1")));
    }
}
