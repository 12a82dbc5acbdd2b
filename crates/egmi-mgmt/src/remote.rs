//! Access to the agents running on every storage node.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, warn};

use crate::error::RemoteError;
use crate::node_status::NodeStatus;
use crate::types::{BrickId, Node, Volume};

/// A single mutating operation run by a node agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Add `host` to the executing node's peer pool.
    PeerProbe {
        /// Host to probe.
        host: Node,
    },
    /// Remove `host` from the executing node's peer pool.
    PeerDetach {
        /// Host to detach.
        host: Node,
    },
    /// Create a volume over the given bricks.
    VolumeCreate {
        /// Volume to create.
        volume: Volume,
        /// Replica count.
        replicas: usize,
        /// Bricks, replicas of a shard consecutive.
        bricks: Vec<BrickId>,
    },
    /// Start a volume.
    VolumeStart {
        /// Volume to start.
        volume: Volume,
        /// Also restart bricks that are down.
        force: bool,
    },
    /// Stop a volume.
    VolumeStop {
        /// Volume to stop.
        volume: Volume,
        /// Stop even when clients are connected.
        force: bool,
    },
    /// Delete a stopped volume.
    VolumeDelete {
        /// Volume to delete.
        volume: Volume,
    },
    /// Add bricks, possibly raising the replica count.
    VolumeAddBrick {
        /// Target volume.
        volume: Volume,
        /// Replica count after the change.
        replicas: usize,
        /// New bricks.
        bricks: Vec<BrickId>,
    },
    /// Remove bricks, possibly lowering the replica count.
    VolumeRemoveBrick {
        /// Target volume.
        volume: Volume,
        /// Replica count after the change.
        replicas: usize,
        /// Bricks to drop.
        bricks: Vec<BrickId>,
    },
    /// Move a brick to another place.
    VolumeReplaceBrick {
        /// Target volume.
        volume: Volume,
        /// Brick being replaced.
        from: BrickId,
        /// Replacement brick.
        to: BrickId,
    },
    /// Set a volume option.
    VolumeSet {
        /// Target volume.
        volume: Volume,
        /// Option key.
        key: String,
        /// Option value.
        value: String,
    },
    /// Wipe the executing node's brick directories of `volume`.
    ForceRemoveVolumeBricks {
        /// Volume whose bricks go.
        volume: Volume,
    },
    /// Reset the peer state of `host`.
    ForceResetHost {
        /// Host to reset.
        host: Node,
    },
}

fn with_replicas(volume: &Volume, replicas: usize, bricks: &[BrickId]) -> Vec<String> {
    let mut options = vec![volume.to_string()];
    if replicas > 1 {
        options.push("replica".to_string());
        options.push(replicas.to_string());
    }
    options.extend(bricks.iter().map(BrickId::to_string));
    options.push("force".to_string());
    options
}

impl Operation {
    /// Command, sub-command and options understood by the node agent.
    pub fn command(&self) -> (&'static str, String, Vec<String>) {
        match self {
            Operation::PeerProbe { host } => ("peer", "probe".into(), vec![host.to_string()]),
            Operation::PeerDetach { host } => ("peer", "detach".into(), vec![host.to_string()]),
            Operation::VolumeCreate {
                volume,
                replicas,
                bricks,
            } => ("volume", "create".into(), with_replicas(volume, *replicas, bricks)),
            Operation::VolumeStart { volume, force } => {
                let mut options = vec![volume.to_string()];
                if *force {
                    options.push("force".into());
                }
                ("volume", "start".into(), options)
            }
            Operation::VolumeStop { volume, force } => {
                let mut options = vec![volume.to_string()];
                if *force {
                    options.push("force".into());
                }
                ("volume", "stop".into(), options)
            }
            Operation::VolumeDelete { volume } => ("volume", "delete".into(), vec![volume.to_string()]),
            Operation::VolumeAddBrick {
                volume,
                replicas,
                bricks,
            } => ("volume", "add-brick".into(), with_replicas(volume, *replicas, bricks)),
            Operation::VolumeRemoveBrick {
                volume,
                replicas,
                bricks,
            } => ("volume", "remove-brick".into(), with_replicas(volume, *replicas, bricks)),
            Operation::VolumeReplaceBrick { volume, from, to } => (
                "volume",
                "replace-brick".into(),
                vec![
                    volume.to_string(),
                    from.to_string(),
                    to.to_string(),
                    "commit".into(),
                    "force".into(),
                ],
            ),
            Operation::VolumeSet { volume, key, value } => (
                "volume",
                "set".into(),
                vec![volume.to_string(), key.clone(), value.clone()],
            ),
            Operation::ForceRemoveVolumeBricks { volume } => {
                ("force-remove-brick", volume.to_string(), Vec::new())
            }
            Operation::ForceResetHost { host } => {
                ("force-remove-peer", String::new(), vec![host.to_string()])
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (command, subcommand, options) = self.command();
        write!(f, "{} {}", command, subcommand)?;
        for option in options {
            write!(f, " {}", option)?;
        }
        Ok(())
    }
}

/// Reply of a node agent to an [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    /// Whether the agent reported success.
    pub success: bool,
    /// Raw reply text.
    pub message: String,
}

impl OperationResult {
    /// Interprets a raw agent reply; success is signalled by the `success` marker.
    pub fn from_reply(http_ok: bool, body: &str) -> Self {
        Self {
            success: http_ok && body.contains("success"),
            message: body.trim().to_string(),
        }
    }
}

/// Collaborator issuing read queries and mutating operations to node agents.
#[async_trait]
pub trait RemoteManager: Send + Sync + 'static {
    /// Reads the peers, volumes and bricks `node` observes.
    async fn fetch_node_status(&self, node: &Node) -> Result<NodeStatus, RemoteError>;

    /// Runs `operation` on `node`.
    async fn execute(&self, operation: &Operation, node: &Node) -> Result<OperationResult, RemoteError>;
}

/// Fetches the status of every node concurrently.
///
/// Nodes that cannot be reached are logged and left out of the map.
pub async fn collect_all(
    remote: &dyn RemoteManager,
    nodes: &BTreeSet<Node>,
) -> BTreeMap<Node, NodeStatus> {
    let futures: Vec<_> = nodes
        .iter()
        .map(|node| async move { (node.clone(), remote.fetch_node_status(node).await) })
        .collect();

    let results = futures::future::join_all(futures).await;

    let mut statuses = BTreeMap::new();
    for (node, result) in results {
        match result {
            Ok(status) => {
                debug!("fetched status of {}", node);
                statuses.insert(node, status);
            }
            Err(e) => warn!("could not fetch status of {}: {}", node, e),
        }
    }
    statuses
}
