//! Snapshot of what a single node reports about the cluster.
//!
//! A [`NodeStatus`] is decoded once per cycle from the node agent's reply and
//! never mutated afterwards. Sub-queries that failed on the node are carried
//! as flags so callers can tell "node unreachable" (no status at all) from
//! "node reachable but one listing failed".

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::NodeStatusError;
use crate::types::{BrickId, Node, Volume};

/// Volume status reported by a node when the volume exists but is stopped.
pub const VOL_NOT_STARTED: &str = "VOL_NOT_STARTED";

/// One entry of the node's peer pool listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer UUID.
    #[serde(default)]
    pub uid: String,
    /// Peer hostname or address; the node itself shows up as `localhost`.
    pub hostname: Node,
    /// Connection state, e.g. `Connected` or `Disconnected`.
    #[serde(default)]
    pub state: String,
}

/// Brick detail as reported by one node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BrickInformation {
    /// Position of the brick in the volume, starting at 1.
    #[serde(default)]
    pub number: Option<u32>,
    /// `ONLINE` or `OFFLINE`.
    #[serde(default)]
    pub status: Option<String>,
    /// Filesystem type.
    #[serde(default, rename = "fsType")]
    pub fs_type: Option<String>,
    /// Backing device.
    #[serde(default)]
    pub device: Option<String>,
    /// Free space, human readable.
    #[serde(default)]
    pub free: Option<String>,
    /// Total space, human readable.
    #[serde(default)]
    pub total: Option<String>,
}

/// A brick of a volume in a node report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBrick {
    /// Node hosting the brick.
    pub node: Node,
    /// Brick path on that node.
    pub path: String,
    /// Operational detail.
    #[serde(flatten)]
    pub info: BrickInformation,
}

impl NodeBrick {
    /// Identity of this brick.
    pub fn id(&self) -> BrickId {
        BrickId::new(self.node.clone(), self.path.clone())
    }
}

/// Volume attributes as reported by one node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VolumeInformation {
    /// Volume status, e.g. `OK`, `VOL_NOT_STARTED` or a `TEMP_*` transient flag.
    #[serde(default)]
    pub status: Option<String>,
    /// Volume type, e.g. `Replicate` or `Distributed-Replicate`.
    #[serde(default, rename = "type")]
    pub volume_type: Option<String>,
    /// Owner of the volume.
    #[serde(default)]
    pub owner: Option<String>,
    /// Number of shards.
    #[serde(default)]
    pub nb_shards: Option<u32>,
    /// Number of replicas per shard.
    #[serde(default)]
    pub nb_replicas: Option<u32>,
    /// Number of arbiters per shard.
    #[serde(default)]
    pub nb_arbiters: Option<u32>,
    /// Total number of bricks.
    #[serde(default)]
    pub nb_bricks: Option<u32>,
}

/// A volume in a node report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeVolume {
    /// Volume name.
    pub name: Volume,
    /// Volume attributes.
    #[serde(flatten)]
    pub info: VolumeInformation,
    /// Reconfigured options.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Bricks of the volume.
    #[serde(default)]
    pub bricks: Vec<NodeBrick>,
}

/// Per-node summary used to build the cluster node table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeInformation {
    /// Connection state the node reports for itself, when listed.
    pub state: Option<String>,
    /// Volumes with at least one brick on the node.
    pub volumes: BTreeSet<Volume>,
    /// Number of bricks hosted by the node.
    pub brick_count: usize,
}

/// Everything one node reports in a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Peer pool as seen by the node.
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
    /// Volumes known to the node.
    #[serde(default)]
    pub volumes: Vec<NodeVolume>,
    /// Peer listing failed.
    #[serde(default, rename = "pool-status-error")]
    pub pool_status_error: bool,
    /// Volume listing failed.
    #[serde(default, rename = "volume-status-error")]
    pub volume_status_error: bool,
    /// Brick status listing failed.
    #[serde(default, rename = "brick-status-error")]
    pub brick_status_error: bool,
}

impl NodeStatus {
    /// Whether the peer pool listing failed.
    pub fn is_pool_status_error(&self) -> bool {
        self.pool_status_error
    }

    /// All peers listed by the node, `localhost` included.
    pub fn all_peers(&self, reporter: &Node) -> Result<BTreeSet<Node>, NodeStatusError> {
        if self.pool_status_error {
            return Err(NodeStatusError::PeerListing(reporter.clone()));
        }
        Ok(self.peers.iter().map(|p| p.hostname.clone()).collect())
    }

    /// Summary of `node` from this report: its own connection state, the
    /// volumes it holds bricks for and its brick count.
    pub fn node_information(&self, node: &Node) -> Result<NodeInformation, NodeStatusError> {
        if self.pool_status_error {
            return Err(NodeStatusError::PeerListing(node.clone()));
        }

        let state = self
            .peers
            .iter()
            .filter(|p| p.hostname.is_localhost() || &p.hostname == node)
            .map(|p| p.state.clone())
            .last();

        let mut info = NodeInformation {
            state,
            ..Default::default()
        };
        for volume in &self.volumes {
            let on_node = volume.bricks.iter().filter(|b| &b.node == node).count();
            if on_node > 0 {
                info.volumes.insert(volume.name.clone());
                info.brick_count += on_node;
            }
        }
        Ok(info)
    }

    /// Names of all volumes known to the node.
    pub fn all_volumes(&self, reporter: &Node) -> Result<BTreeSet<Volume>, NodeStatusError> {
        if self.volume_status_error {
            return Err(NodeStatusError::VolumeListing(reporter.clone()));
        }
        Ok(self.volumes.iter().map(|v| v.name.clone()).collect())
    }

    fn volume(&self, volume: &Volume) -> Option<&NodeVolume> {
        self.volumes.iter().find(|v| &v.name == volume)
    }

    /// Bricks of `volume` known to the node.
    pub fn volume_brick_ids(
        &self,
        reporter: &Node,
        volume: &Volume,
    ) -> Result<BTreeSet<BrickId>, NodeStatusError> {
        if self.volume_status_error {
            return Err(NodeStatusError::VolumeListing(reporter.clone()));
        }
        Ok(self
            .volume(volume)
            .map(|v| v.bricks.iter().map(NodeBrick::id).collect())
            .unwrap_or_default())
    }

    /// Nodes hosting at least one brick of `volume`.
    pub fn volume_nodes(
        &self,
        reporter: &Node,
        volume: &Volume,
    ) -> Result<BTreeSet<Node>, NodeStatusError> {
        Ok(self
            .volume_brick_ids(reporter, volume)?
            .into_iter()
            .map(|b| b.node)
            .collect())
    }

    /// Every brick hosted on `host`, with the volume it belongs to.
    pub fn node_bricks_and_volumes(
        &self,
        reporter: &Node,
        host: &Node,
    ) -> Result<BTreeMap<BrickId, Volume>, NodeStatusError> {
        if self.volume_status_error {
            return Err(NodeStatusError::VolumeListing(reporter.clone()));
        }
        let mut bricks = BTreeMap::new();
        for volume in &self.volumes {
            for brick in volume.bricks.iter().filter(|b| &b.node == host) {
                bricks.insert(brick.id(), volume.name.clone());
            }
        }
        Ok(bricks)
    }

    /// Attributes of `volume`, `None` when the node does not know it.
    pub fn volume_information(
        &self,
        reporter: &Node,
        volume: &Volume,
    ) -> Result<Option<VolumeInformation>, NodeStatusError> {
        if self.volume_status_error {
            return Err(NodeStatusError::VolumeListing(reporter.clone()));
        }
        Ok(self.volume(volume).map(|v| v.info.clone()))
    }

    /// Reconfigured options of `volume`.
    pub fn reconfigured_options(
        &self,
        reporter: &Node,
        volume: &Volume,
    ) -> Result<BTreeMap<String, String>, NodeStatusError> {
        if self.brick_status_error {
            return Err(NodeStatusError::BrickListing(reporter.clone()));
        }
        Ok(self.volume(volume).map(|v| v.options.clone()).unwrap_or_default())
    }

    /// Brick detail of `volume`, keyed by brick.
    pub fn volume_bricks_information(
        &self,
        reporter: &Node,
        volume: &Volume,
    ) -> Result<BTreeMap<BrickId, BrickInformation>, NodeStatusError> {
        if self.brick_status_error {
            return Err(NodeStatusError::BrickListing(reporter.clone()));
        }
        Ok(self
            .volume(volume)
            .map(|v| {
                v.bricks
                    .iter()
                    .filter(|b| !b.path.is_empty())
                    .map(|b| (b.id(), b.info.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Orders bricks by their number; bricks without a number sort last.
pub fn sort_by_number(bricks: &BTreeMap<BrickId, BrickInformation>) -> Vec<BrickId> {
    let mut ids: Vec<&BrickId> = bricks.keys().collect();
    ids.sort_by_key(|id| (bricks[*id].number.unwrap_or(u32::MAX), (*id).clone()));
    ids.into_iter().cloned().collect()
}
