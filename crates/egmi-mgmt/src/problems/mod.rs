//! Problem catalogue.
//!
//! A problem is a persistent fact about the cluster. It is registered when a
//! cycle first detects it, re-validated against every new [`SystemStatus`]
//! and dropped once it is no longer recognized or has been solved.
//!
//! Solving always works from freshly fetched node statuses, never from the
//! status the problem was detected on.

mod brick_offline;
mod missing_brick;
mod no_volume;
mod node_corrupted;
mod node_down;
mod node_down_removal;
mod node_inconsistent;
mod node_partitioned;
mod registry;
mod volume_not_started;
mod wrong_option;

pub use brick_offline::BrickOffline;
pub use missing_brick::MissingBrick;
pub use no_volume::{create_volume, NoVolume};
pub use node_corrupted::NodeCorrupted;
pub use node_down::NodeDown;
pub use node_down_removal::NodeDownRemoval;
pub use node_inconsistent::NodeInconsistent;
pub use node_partitioned::NodePartitioned;
pub use registry::{ProblemRecord, ProblemRegistry, ResolutionOutcome};
pub use volume_not_started::VolumeNotStarted;
pub use wrong_option::WrongOption;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use crate::config::{EgmiConfig, ProblemTimeouts};
use crate::election::LeadershipState;
use crate::error::{Resolution, SolveResult};
use crate::layout::{BrickPolicy, RuntimeLayout};
use crate::messages::MessageLog;
use crate::node_status::NodeStatus;
use crate::remote::{collect_all, Operation, RemoteManager};
use crate::settings::RuntimeSettings;
use crate::system_status::SystemStatus;
use crate::types::{Node, Volume};

/// Number of peer pool polls before a probe is declared failed.
pub const PEER_POOL_CHECK_ATTEMPTS: usize = 5;

/// Everything a problem needs to act on the cluster.
#[derive(Clone)]
pub struct CommandContext {
    pub remote: Arc<dyn RemoteManager>,
    pub settings: Arc<RuntimeSettings>,
    pub messages: Arc<MessageLog>,
    pub leadership: Arc<LeadershipState>,
    /// Nodes known to the current cycle; solves refresh their status.
    pub nodes: BTreeSet<Node>,
    pub configured_nodes: BTreeSet<Node>,
    pub configured_volumes: BTreeSet<Volume>,
    pub volume_path: String,
    pub timeouts: ProblemTimeouts,
    pub policy: BrickPolicy,
    pub default_replicas: usize,
    pub peer_poll_interval: Duration,
}

impl CommandContext {
    pub fn new(
        config: &EgmiConfig,
        remote: Arc<dyn RemoteManager>,
        settings: Arc<RuntimeSettings>,
        messages: Arc<MessageLog>,
        leadership: Arc<LeadershipState>,
    ) -> Self {
        Self {
            remote,
            settings,
            messages,
            leadership,
            nodes: BTreeSet::new(),
            configured_nodes: config.configured_nodes(),
            configured_volumes: config.configured_volumes(),
            volume_path: config.volume_path.clone(),
            timeouts: config.problem_timeouts.clone(),
            policy: config.target_number_of_bricks,
            default_replicas: config.default_number_replica,
            peer_poll_interval: Duration::from_millis(500),
        }
    }

    /// Same context scoped to the node set of one cycle.
    pub fn with_nodes(&self, nodes: BTreeSet<Node>) -> Self {
        Self {
            nodes,
            ..self.clone()
        }
    }

    pub fn info(&self, text: impl AsRef<str>) {
        self.messages.info(text);
    }

    pub fn error(&self, text: impl AsRef<str>) {
        self.messages.error(text);
    }

    pub fn is_leader(&self) -> bool {
        self.leadership.is_master()
    }

    /// Fresh status of every known node.
    pub async fn fetch_statuses(&self) -> BTreeMap<Node, NodeStatus> {
        collect_all(self.remote.as_ref(), &self.nodes).await
    }

    /// Target layout for `node_count` nodes.
    pub fn layout(&self, node_count: usize) -> RuntimeLayout {
        RuntimeLayout::compute(node_count, self.policy, self.default_replicas)
    }

    /// Runs `operation` on `host`; anything but a success stops the pass.
    pub async fn execute_simple_operation(
        &self,
        operation: &Operation,
        host: &Node,
    ) -> Result<(), Resolution> {
        if !self.is_leader() {
            return Err(Resolution::Stop(format!("leadership lost before {}", operation)));
        }
        let result = self.remote.execute(operation, host).await.map_err(|e| {
            error!("{} on {}: {}", operation, host, e);
            Resolution::from(e)
        })?;
        if !result.success {
            let (command, subcommand, _) = operation.command();
            self.error(format!(
                "      !! {} {} failed. See backend logs for details",
                command, subcommand
            ));
            error!("{}", result.message);
            return Err(Resolution::Stop(result.message));
        }
        Ok(())
    }

    /// Waits until `peer` lists `host` in its pool.
    pub async fn check_host_in_peer_pool(&self, peer: &Node, host: &Node) -> SolveResult {
        for attempt in 1..=PEER_POOL_CHECK_ATTEMPTS {
            let status = self.remote.fetch_node_status(peer).await.map_err(|e| {
                self.error(format!("      ! Failed checking pool on {} - {}", peer, e));
                Resolution::from(e)
            })?;
            if status.all_peers(peer)?.contains(host) {
                self.info(format!("        + found {} in pool on {}", host, peer));
                return Ok(true);
            }
            if attempt < PEER_POOL_CHECK_ATTEMPTS {
                tokio::time::sleep(self.peer_poll_interval).await;
            }
        }
        self.error(format!(
            "      ! Failed to confirm peer addition in {} attempts.",
            PEER_POOL_CHECK_ATTEMPTS
        ));
        Err(Resolution::Stop(format!(
            "{} not in pool of {} after {} attempts",
            host, peer, PEER_POOL_CHECK_ATTEMPTS
        )))
    }
}

/// Stops `volume` if running, wipes its bricks on every node hosting them and
/// deletes it, all driven from `host`.
///
/// Once bricks are wiped a failed delete leaves the volume unrecoverable, so
/// it stops the pass.
pub(crate) async fn force_delete_volume(
    ctx: &CommandContext,
    volume: &Volume,
    host: &Node,
    brick_nodes: &BTreeSet<Node>,
    started: bool,
) -> Result<(), Resolution> {
    if started {
        ctx.execute_simple_operation(
            &Operation::VolumeStop {
                volume: volume.clone(),
                force: true,
            },
            host,
        )
        .await?;
    }

    for node in brick_nodes {
        ctx.execute_simple_operation(
            &Operation::ForceRemoveVolumeBricks {
                volume: volume.clone(),
            },
            node,
        )
        .await?;
    }

    if let Err(e) = ctx
        .execute_simple_operation(
            &Operation::VolumeDelete {
                volume: volume.clone(),
            },
            host,
        )
        .await
    {
        ctx.error(
            "!!! This is a big deal. The volume bricks have been deleted already and the volume is not recoverable",
        );
        return Err(e);
    }
    Ok(())
}

/// A tracked problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    NodePartitioned(NodePartitioned),
    NodeInconsistent(NodeInconsistent),
    NodeCorrupted(NodeCorrupted),
    NodeDown(NodeDown),
    BrickOffline(BrickOffline),
    VolumeNotStarted(VolumeNotStarted),
    NodeDownRemoval(NodeDownRemoval),
    NoVolume(NoVolume),
    MissingBrick(MissingBrick),
    WrongOption(WrongOption),
}

macro_rules! dispatch {
    ($self:ident, $p:ident => $e:expr) => {
        match $self {
            Problem::NodePartitioned($p) => $e,
            Problem::NodeInconsistent($p) => $e,
            Problem::NodeCorrupted($p) => $e,
            Problem::NodeDown($p) => $e,
            Problem::BrickOffline($p) => $e,
            Problem::VolumeNotStarted($p) => $e,
            Problem::NodeDownRemoval($p) => $e,
            Problem::NoVolume($p) => $e,
            Problem::MissingBrick($p) => $e,
            Problem::WrongOption($p) => $e,
        }
    };
}

impl Problem {
    /// Stable identity; two problems with the same id are the same problem.
    pub fn id(&self) -> String {
        dispatch!(self, p => p.id())
    }

    /// Human label, used in summaries.
    pub fn label(&self) -> &'static str {
        match self {
            Problem::NodePartitioned(_) => "Node Partitioned",
            Problem::NodeInconsistent(_) => "Node Inconsistent",
            Problem::NodeCorrupted(_) => "Node Corrupted",
            Problem::NodeDown(_) => "Vol. Node Down",
            Problem::BrickOffline(_) => "Brick Offline",
            Problem::VolumeNotStarted(_) => "Volume Down",
            Problem::NodeDownRemoval(_) => "Vol. Node Down Removal",
            Problem::NoVolume(_) => "No Volume",
            Problem::MissingBrick(_) => "Missing Brick",
            Problem::WrongOption(_) => "Wrong Option",
        }
    }

    /// 0 is the most urgent.
    pub fn priority(&self) -> u8 {
        match self {
            Problem::NodePartitioned(_) => 0,
            Problem::NodeInconsistent(_) | Problem::NodeCorrupted(_) => 1,
            Problem::NodeDown(_) => 3,
            Problem::BrickOffline(_) | Problem::VolumeNotStarted(_) | Problem::NodeDownRemoval(_) => 4,
            Problem::NoVolume(_) => 5,
            Problem::MissingBrick(_) => 7,
            Problem::WrongOption(_) => 8,
        }
    }

    /// Whether the problem still shows in `status`.
    pub fn recognize(&self, status: &SystemStatus) -> bool {
        dispatch!(self, p => p.recognize(status))
    }

    /// Attempts a remedy. `age` is the time since first detection.
    pub async fn solve(&self, ctx: &CommandContext, age: Duration) -> SolveResult {
        match self {
            Problem::NodePartitioned(p) => p.solve(ctx).await,
            Problem::NodeInconsistent(p) => p.solve(ctx).await,
            Problem::NodeCorrupted(p) => p.solve(ctx, age).await,
            Problem::NodeDown(p) => p.solve(ctx, age).await,
            Problem::BrickOffline(p) => p.solve(ctx, age).await,
            Problem::VolumeNotStarted(p) => p.solve(ctx).await,
            Problem::NodeDownRemoval(p) => p.solve(ctx, age).await,
            Problem::NoVolume(p) => p.solve(ctx, age).await,
            Problem::MissingBrick(p) => p.solve(ctx).await,
            Problem::WrongOption(p) => p.solve(ctx).await,
        }
    }
}

macro_rules! impl_from_kind {
    ($($kind:ident),* $(,)?) => {
        $(
            impl From<$kind> for Problem {
                fn from(p: $kind) -> Self {
                    Problem::$kind(p)
                }
            }
        )*
    };
}

impl_from_kind!(
    NodePartitioned,
    NodeInconsistent,
    NodeCorrupted,
    NodeDown,
    BrickOffline,
    VolumeNotStarted,
    NodeDownRemoval,
    NoVolume,
    MissingBrick,
    WrongOption,
);

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::remote_sim::SimulatedCluster;
    use crate::types::BrickId;
    use std::path::Path;

    pub(crate) const BRICKS: &str = "/var/lib/gluster/volume_bricks";

    /// Context over `sim` where this process is leader and nothing waits.
    pub(crate) fn context(sim: &Arc<SimulatedCluster>, dir: &Path, nodes: &[&str]) -> CommandContext {
        let mut config = EgmiConfig::default();
        config.config_storage_path = dir.to_path_buf();
        config.problem_timeouts = ProblemTimeouts {
            node_down_secs: 0,
            node_down_removal_secs: 0,
            brick_offline_secs: 0,
            node_corrupted_secs: 0,
            no_volume_secs: 0,
        };
        let leadership = Arc::new(LeadershipState::default());
        leadership.set_master(true);

        let mut ctx = CommandContext::new(
            &config,
            sim.clone(),
            Arc::new(RuntimeSettings::new(dir)),
            Arc::new(MessageLog::default()),
            leadership,
        );
        ctx.peer_poll_interval = Duration::from_millis(1);
        ctx.with_nodes(nodes.iter().map(|n| Node::new(n)).collect())
    }

    pub(crate) fn brick(node: &str, volume: &str) -> BrickId {
        BrickId::new(Node::new(node), format!("{}/{}", BRICKS, volume))
    }

    #[test]
    fn test_priorities_and_labels() {
        let p: Problem = NodePartitioned::new(Node::new("n1")).into();
        assert_eq!(p.priority(), 0);
        assert_eq!(p.id(), "NODE_PARTITIONED-n1");
        let p: Problem = MissingBrick::new(Volume::new("logs"), 4, 2).into();
        assert_eq!(p.priority(), 7);
        assert_eq!(p.id(), "MISSING_BRICK-logs-2");
        assert_eq!(p.label(), "Missing Brick");
        let p: Problem = VolumeNotStarted::new(Volume::new("logs")).into();
        assert_eq!(p.id(), "VOLUME_DOWN-logs");
    }

    #[tokio::test]
    async fn test_simple_operation_failure_stops() {
        let sim = Arc::new(SimulatedCluster::new());
        sim.add_node("n1");
        sim.fail_operation("volume start");
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(&sim, dir.path(), &["n1"]);

        let res = ctx
            .execute_simple_operation(
                &Operation::VolumeStart {
                    volume: Volume::new("logs"),
                    force: false,
                },
                &Node::new("n1"),
            )
            .await;
        assert!(matches!(res, Err(Resolution::Stop(_))));
        let (lines, _) = ctx.messages.lines_since(0);
        assert!(lines.iter().any(|l| l.contains("volume start failed")));
    }

    #[tokio::test]
    async fn test_simple_operation_requires_leadership() {
        let sim = Arc::new(SimulatedCluster::new());
        sim.add_node("n1");
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(&sim, dir.path(), &["n1"]);
        ctx.leadership.set_master(false);

        let res = ctx
            .execute_simple_operation(&Operation::PeerProbe { host: Node::new("n2") }, &Node::new("n1"))
            .await;
        assert!(matches!(res, Err(Resolution::Stop(_))));
        assert!(sim.executed().is_empty());
    }

    #[tokio::test]
    async fn test_check_host_in_peer_pool() {
        let sim = Arc::new(SimulatedCluster::new());
        sim.add_node("n1");
        sim.add_node("n2");
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(&sim, dir.path(), &["n1", "n2"]);

        let res = ctx.check_host_in_peer_pool(&Node::new("n1"), &Node::new("n2")).await;
        assert!(matches!(res, Err(Resolution::Stop(_))));

        sim.link("n1", "n2");
        let res = ctx.check_host_in_peer_pool(&Node::new("n1"), &Node::new("n2")).await;
        assert_eq!(res, Ok(true));
    }

    #[tokio::test]
    async fn test_force_delete_volume() {
        let sim = Arc::new(SimulatedCluster::new());
        for n in ["n1", "n2"] {
            sim.add_node(n);
        }
        sim.connect_all(&["n1", "n2"]);
        sim.add_volume("logs", 2, &[brick("n1", "logs"), brick("n2", "logs")]);
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(&sim, dir.path(), &["n1", "n2"]);

        let nodes: BTreeSet<Node> = [Node::new("n1"), Node::new("n2")].into();
        force_delete_volume(&ctx, &Volume::new("logs"), &Node::new("n1"), &nodes, true)
            .await
            .unwrap();
        assert!(sim.volume_bricks("logs").is_none());
        let ops: Vec<String> = sim.executed().iter().map(|(_, op)| op.command().1).collect();
        assert_eq!(ops, vec!["stop", "logs", "logs", "delete"]);
    }

    #[tokio::test]
    async fn test_force_delete_volume_failure_is_a_big_deal() {
        let sim = Arc::new(SimulatedCluster::new());
        sim.add_node("n1");
        sim.add_volume("logs", 1, &[brick("n1", "logs")]);
        sim.fail_operation("volume delete");
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(&sim, dir.path(), &["n1"]);

        let nodes: BTreeSet<Node> = [Node::new("n1")].into();
        let res = force_delete_volume(&ctx, &Volume::new("logs"), &Node::new("n1"), &nodes, false).await;
        assert!(matches!(res, Err(Resolution::Stop(_))));
        let (lines, _) = ctx.messages.lines_since(0);
        assert!(lines.iter().any(|l| l.contains("big deal")));
    }
}
