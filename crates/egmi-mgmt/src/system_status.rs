//! Cluster-wide view built once per reconciliation cycle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{BrickId, Node, Volume};

/// Health of a node as classified by the aggregator and detectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    /// Reachable with a consistent peer view.
    Ok,
    /// Unreachable.
    Ko,
    /// Not part of the best-connected peer group.
    Partitioned,
    /// Does not list a peer that lists it.
    Inconsistent,
    /// Reachable but its volumes cannot be listed.
    Corrupted,
}

impl NodeState {
    /// States a detector must not overwrite.
    pub fn is_sticky(self) -> bool {
        matches!(self, NodeState::Ko | NodeState::Corrupted)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Ok => "OK",
            NodeState::Ko => "KO",
            NodeState::Partitioned => "PARTITIONED",
            NodeState::Inconsistent => "INCONSISTENT",
            NodeState::Corrupted => "CORRUPTED",
        };
        f.write_str(s)
    }
}

/// One row of the node table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Node address.
    pub host: Node,
    /// Classification.
    pub status: NodeState,
    /// Volumes with bricks on the node, `", "` joined. Absent for KO nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<String>,
    /// Brick count. Absent for KO nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbr_bricks: Option<usize>,
}

/// One brick of a volume row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrickEntry {
    /// Brick identity.
    pub id: BrickId,
    /// Brick number, `None` when no node reported it.
    pub number: Option<u32>,
    /// Hosting node.
    pub node: Node,
    /// Brick path.
    pub path: String,
    /// `ONLINE` / `OFFLINE`; `None` when no node could report it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Backing device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Free space.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free: Option<String>,
    /// Total space.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tot: Option<String>,
}

/// One row of the volume table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeEntry {
    /// Volume name.
    pub volume: Volume,
    /// `OK` or the detected errors joined by ` / `.
    pub status: String,
    /// Volume type; `None` when no node knows the volume.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
    /// Owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// `actual / target` shards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nb_shards: Option<String>,
    /// `actual / target` replicas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nb_replicas: Option<String>,
    /// `actual / target` bricks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nb_bricks: Option<String>,
    /// Bricks ordered by number.
    pub bricks: Vec<BrickEntry>,
    /// Reconfigured options.
    pub options: BTreeMap<String, String>,
}

impl VolumeEntry {
    /// Looks up a brick of this volume.
    pub fn brick(&self, id: &BrickId) -> Option<&BrickEntry> {
        self.bricks.iter().find(|b| &b.id == id)
    }
}

/// The merged view every problem recognizes against.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Host that computed the view.
    pub hostname: String,
    /// Node table.
    pub nodes: Vec<NodeEntry>,
    /// Volume table.
    pub volumes: Vec<VolumeEntry>,
}

impl SystemStatus {
    /// Node row for `host`.
    pub fn node(&self, host: &Node) -> Option<&NodeEntry> {
        self.nodes.iter().find(|n| &n.host == host)
    }

    /// Classification of `host`, `None` if unknown.
    pub fn node_state(&self, host: &Node) -> Option<NodeState> {
        self.node(host).map(|n| n.status)
    }

    /// Volume row for `volume`.
    pub fn volume(&self, volume: &Volume) -> Option<&VolumeEntry> {
        self.volumes.iter().find(|v| &v.volume == volume)
    }

    /// Brick row of `volume`.
    pub fn brick(&self, volume: &Volume, brick: &BrickId) -> Option<&BrickEntry> {
        self.volume(volume).and_then(|v| v.brick(brick))
    }

    /// Hosts in table order.
    pub fn node_list(&self) -> Vec<Node> {
        self.nodes.iter().map(|n| n.host.clone()).collect()
    }

    /// Hosts currently classified OK.
    pub fn healthy_nodes(&self) -> Vec<Node> {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeState::Ok)
            .map(|n| n.host.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> SystemStatus {
        SystemStatus {
            hostname: "egmi-1".into(),
            nodes: vec![
                NodeEntry {
                    host: Node::new("n1"),
                    status: NodeState::Ok,
                    volumes: Some("logs".into()),
                    nbr_bricks: Some(1),
                },
                NodeEntry {
                    host: Node::new("n2"),
                    status: NodeState::Ko,
                    volumes: None,
                    nbr_bricks: None,
                },
            ],
            volumes: vec![VolumeEntry {
                volume: Volume::new("logs"),
                status: "OK".into(),
                volume_type: Some("Replicate".into()),
                owner: None,
                nb_shards: Some("1 / 1".into()),
                nb_replicas: Some("2 / 2".into()),
                nb_bricks: Some("2 / 2".into()),
                bricks: vec![BrickEntry {
                    id: BrickId::new(Node::new("n1"), "/data/logs"),
                    number: Some(1),
                    node: Node::new("n1"),
                    path: "/data/logs".into(),
                    status: Some("ONLINE".into()),
                    device: None,
                    free: None,
                    tot: None,
                }],
                options: BTreeMap::new(),
            }],
        }
    }

    #[test]
    fn test_node_state_display() {
        assert_eq!(NodeState::Partitioned.to_string(), "PARTITIONED");
        assert_eq!(NodeState::Ko.to_string(), "KO");
    }

    #[test]
    fn test_sticky_states() {
        assert!(NodeState::Ko.is_sticky());
        assert!(NodeState::Corrupted.is_sticky());
        assert!(!NodeState::Ok.is_sticky());
        assert!(!NodeState::Inconsistent.is_sticky());
    }

    #[test]
    fn test_lookups() {
        let s = status();
        assert_eq!(s.node_state(&Node::new("N2")), Some(NodeState::Ko));
        assert_eq!(s.node_state(&Node::new("n3")), None);
        assert!(s.volume(&Volume::new("logs")).is_some());
        let brick = BrickId::new(Node::new("n1"), "/data/logs");
        assert_eq!(s.brick(&Volume::new("logs"), &brick).unwrap().number, Some(1));
        assert_eq!(s.healthy_nodes(), vec![Node::new("n1")]);
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(status()).unwrap();
        assert_eq!(json["nodes"][0]["status"], "OK");
        assert_eq!(json["nodes"][1]["status"], "KO");
        assert!(json["nodes"][1].get("volumes").is_none());
        assert_eq!(json["volumes"][0]["type"], "Replicate");
        assert_eq!(json["volumes"][0]["bricks"][0]["id"], "n1:/data/logs");
    }
}
