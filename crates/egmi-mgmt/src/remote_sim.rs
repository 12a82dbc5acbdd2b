//! In-process simulation of a storage cluster.
//!
//! This module provides a software model of peer pools, volumes and bricks
//! implementing [`RemoteManager`], so the reconciliation engine can be
//! exercised without real storage nodes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::RemoteError;
use crate::node_status::{
    BrickInformation, NodeBrick, NodeStatus, NodeVolume, PeerInfo, VolumeInformation, VOL_NOT_STARTED,
};
use crate::remote::{Operation, OperationResult, RemoteManager};
use crate::types::{BrickId, Node, Volume};

#[derive(Debug, Clone, Default)]
struct SimNode {
    up: bool,
    pool_error: bool,
    volume_error: bool,
    peers: BTreeSet<Node>,
}

#[derive(Debug, Clone)]
struct SimBrick {
    id: BrickId,
    online: bool,
}

#[derive(Debug, Clone)]
struct SimVolume {
    status: String,
    owner: String,
    replicas: usize,
    bricks: Vec<SimBrick>,
    options: BTreeMap<String, String>,
}

impl SimVolume {
    fn volume_type(&self) -> &'static str {
        let shards = self.bricks.len() / self.replicas.max(1);
        match (self.replicas > 1, shards > 1) {
            (true, true) => "Distributed-Replicate",
            (true, false) => "Replicate",
            _ => "Distribute",
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    nodes: BTreeMap<Node, SimNode>,
    volumes: BTreeMap<Volume, SimVolume>,
    executed: Vec<(Node, Operation)>,
    failing: BTreeSet<String>,
}

/// Simulated cluster answering status queries and applying operations.
#[derive(Debug, Default)]
pub struct SimulatedCluster {
    state: Mutex<SimState>,
}

fn reply(op: &Operation, ok: bool, detail: &str) -> OperationResult {
    let (command, subcommand, _) = op.command();
    let outcome = if ok { "success" } else { "failed" };
    let message = if detail.is_empty() {
        format!("{} {}: {}", command, subcommand, outcome)
    } else {
        format!("{} {}: {}: {}", command, subcommand, outcome, detail)
    };
    OperationResult { success: ok, message }
}

impl SimulatedCluster {
    /// Creates an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a running node without peers.
    pub fn add_node(&self, node: &str) {
        self.state.lock().nodes.insert(
            Node::new(node),
            SimNode {
                up: true,
                ..Default::default()
            },
        );
    }

    /// Peers every pair of `nodes` with each other.
    pub fn connect_all(&self, nodes: &[&str]) {
        for a in nodes {
            for b in nodes {
                if a != b {
                    self.link(a, b);
                }
            }
        }
    }

    /// Makes `from` list `to` as peer, one direction only.
    pub fn link(&self, from: &str, to: &str) {
        let mut state = self.state.lock();
        if let Some(n) = state.nodes.get_mut(&Node::new(from)) {
            n.peers.insert(Node::new(to));
        }
    }

    /// Removes `to` from the peers of `from`, one direction only.
    pub fn unlink(&self, from: &str, to: &str) {
        let mut state = self.state.lock();
        if let Some(n) = state.nodes.get_mut(&Node::new(from)) {
            n.peers.remove(&Node::new(to));
        }
    }

    /// Powers a node on or off.
    pub fn set_node_up(&self, node: &str, up: bool) {
        let mut state = self.state.lock();
        if let Some(n) = state.nodes.get_mut(&Node::new(node)) {
            n.up = up;
        }
    }

    /// Makes the peer listing of `node` fail.
    pub fn set_pool_error(&self, node: &str, failing: bool) {
        let mut state = self.state.lock();
        if let Some(n) = state.nodes.get_mut(&Node::new(node)) {
            n.pool_error = failing;
        }
    }

    /// Makes the volume listing of `node` fail.
    pub fn set_volume_error(&self, node: &str, failing: bool) {
        let mut state = self.state.lock();
        if let Some(n) = state.nodes.get_mut(&Node::new(node)) {
            n.volume_error = failing;
        }
    }

    /// Adds a started volume over `bricks`, replicas of a shard consecutive.
    pub fn add_volume(&self, volume: &str, replicas: usize, bricks: &[BrickId]) {
        self.state.lock().volumes.insert(
            Volume::new(volume),
            SimVolume {
                status: "OK".to_string(),
                owner: "egmi".to_string(),
                replicas: replicas.max(1),
                bricks: bricks
                    .iter()
                    .map(|id| SimBrick {
                        id: id.clone(),
                        online: true,
                    })
                    .collect(),
                options: BTreeMap::new(),
            },
        );
    }

    /// Overrides the status string of a volume.
    pub fn set_volume_status(&self, volume: &str, status: &str) {
        let mut state = self.state.lock();
        if let Some(v) = state.volumes.get_mut(&Volume::new(volume)) {
            v.status = status.to_string();
        }
    }

    /// Marks one brick online or offline.
    pub fn set_brick_online(&self, volume: &str, brick: &BrickId, online: bool) {
        let mut state = self.state.lock();
        if let Some(v) = state.volumes.get_mut(&Volume::new(volume)) {
            for b in v.bricks.iter_mut().filter(|b| &b.id == brick) {
                b.online = online;
            }
        }
    }

    /// Sets a volume option directly.
    pub fn set_option(&self, volume: &str, key: &str, value: &str) {
        let mut state = self.state.lock();
        if let Some(v) = state.volumes.get_mut(&Volume::new(volume)) {
            v.options.insert(key.to_string(), value.to_string());
        }
    }

    /// Makes every operation rendered as `command subcommand` fail.
    pub fn fail_operation(&self, command_and_subcommand: &str) {
        self.state.lock().failing.insert(command_and_subcommand.to_string());
    }

    /// Every operation executed so far with the node it ran on.
    pub fn executed(&self) -> Vec<(Node, Operation)> {
        self.state.lock().executed.clone()
    }

    /// Peers of `node`.
    pub fn peers(&self, node: &str) -> BTreeSet<Node> {
        self.state
            .lock()
            .nodes
            .get(&Node::new(node))
            .map(|n| n.peers.clone())
            .unwrap_or_default()
    }

    /// Bricks of `volume` in order, `None` when the volume does not exist.
    pub fn volume_bricks(&self, volume: &str) -> Option<Vec<BrickId>> {
        self.state
            .lock()
            .volumes
            .get(&Volume::new(volume))
            .map(|v| v.bricks.iter().map(|b| b.id.clone()).collect())
    }

    /// Status string of `volume`.
    pub fn volume_status(&self, volume: &str) -> Option<String> {
        self.state.lock().volumes.get(&Volume::new(volume)).map(|v| v.status.clone())
    }

    /// Replica count of `volume`.
    pub fn volume_replicas(&self, volume: &str) -> Option<usize> {
        self.state.lock().volumes.get(&Volume::new(volume)).map(|v| v.replicas)
    }

    /// Option value of `volume`.
    pub fn option(&self, volume: &str, key: &str) -> Option<String> {
        self.state
            .lock()
            .volumes
            .get(&Volume::new(volume))
            .and_then(|v| v.options.get(key).cloned())
    }

    fn node_view(state: &SimState, node: &Node, sim: &SimNode) -> NodeStatus {
        let mut peers = vec![PeerInfo {
            uid: format!("uid-{}", node),
            hostname: Node::new("localhost"),
            state: "Connected".to_string(),
        }];
        if !sim.pool_error {
            peers.extend(sim.peers.iter().map(|p| PeerInfo {
                uid: format!("uid-{}", p),
                hostname: p.clone(),
                state: match state.nodes.get(p) {
                    Some(n) if n.up => "Connected".to_string(),
                    _ => "Disconnected".to_string(),
                },
            }));
        }

        let mut pool: BTreeSet<&Node> = sim.peers.iter().collect();
        pool.insert(node);

        if sim.volume_error {
            return NodeStatus {
                peers,
                pool_status_error: sim.pool_error,
                volume_status_error: true,
                ..Default::default()
            };
        }

        let volumes = state
            .volumes
            .iter()
            .filter(|(_, v)| v.bricks.is_empty() || v.bricks.iter().any(|b| pool.contains(&b.id.node)))
            .map(|(name, v)| {
                let replicas = v.replicas.max(1);
                NodeVolume {
                    name: name.clone(),
                    info: VolumeInformation {
                        status: Some(v.status.clone()),
                        volume_type: Some(v.volume_type().to_string()),
                        owner: Some(v.owner.clone()),
                        nb_shards: Some((v.bricks.len() / replicas) as u32),
                        nb_replicas: if replicas > 1 { Some(replicas as u32) } else { None },
                        nb_arbiters: None,
                        nb_bricks: Some(v.bricks.len() as u32),
                    },
                    options: v.options.clone(),
                    bricks: v
                        .bricks
                        .iter()
                        .enumerate()
                        .map(|(i, b)| {
                            let host_up = state.nodes.get(&b.id.node).map_or(false, |n| n.up);
                            let status = if !host_up {
                                None
                            } else if b.online && v.status != VOL_NOT_STARTED {
                                Some("ONLINE".to_string())
                            } else {
                                Some("OFFLINE".to_string())
                            };
                            NodeBrick {
                                node: b.id.node.clone(),
                                path: b.id.path.clone(),
                                info: BrickInformation {
                                    number: Some(i as u32 + 1),
                                    status,
                                    fs_type: Some("xfs".to_string()),
                                    device: Some("/dev/vdb".to_string()),
                                    free: Some("9.5GB".to_string()),
                                    total: Some("10.0GB".to_string()),
                                },
                            }
                        })
                        .collect(),
                }
            })
            .collect();

        NodeStatus {
            peers,
            volumes,
            pool_status_error: sim.pool_error,
            ..Default::default()
        }
    }

    fn apply(state: &mut SimState, op: &Operation, node: &Node) -> OperationResult {
        match op {
            Operation::PeerProbe { host } => {
                let reachable = state.nodes.get(host).map_or(false, |n| n.up);
                if !reachable {
                    return reply(op, false, "Probe returned with Transport endpoint is not connected");
                }
                if let Some(n) = state.nodes.get_mut(node) {
                    n.peers.insert(host.clone());
                }
                if let Some(n) = state.nodes.get_mut(host) {
                    n.peers.insert(node.clone());
                }
                reply(op, true, "")
            }
            Operation::PeerDetach { host } => {
                if let Some(n) = state.nodes.get_mut(node) {
                    n.peers.remove(host);
                }
                if let Some(n) = state.nodes.get_mut(host) {
                    n.peers.remove(node);
                }
                reply(op, true, "")
            }
            Operation::ForceResetHost { host } => {
                // the host forgets its pool and restarts with a clean state
                for other in state.nodes.values_mut() {
                    other.peers.remove(host);
                }
                if let Some(n) = state.nodes.get_mut(host) {
                    n.peers.clear();
                    n.pool_error = false;
                    n.volume_error = false;
                }
                reply(op, true, "")
            }
            Operation::VolumeCreate {
                volume,
                replicas,
                bricks,
            } => {
                if state.volumes.contains_key(volume) {
                    return reply(op, false, "volume already exists");
                }
                state.volumes.insert(
                    volume.clone(),
                    SimVolume {
                        status: VOL_NOT_STARTED.to_string(),
                        owner: "egmi".to_string(),
                        replicas: (*replicas).max(1),
                        bricks: bricks
                            .iter()
                            .map(|id| SimBrick {
                                id: id.clone(),
                                online: true,
                            })
                            .collect(),
                        options: BTreeMap::new(),
                    },
                );
                reply(op, true, "")
            }
            Operation::VolumeStart { volume, force } => {
                let up_nodes: BTreeSet<Node> = state
                    .nodes
                    .iter()
                    .filter(|(_, n)| n.up)
                    .map(|(k, _)| k.clone())
                    .collect();
                match state.volumes.get_mut(volume) {
                    Some(v) => {
                        v.status = "OK".to_string();
                        if *force {
                            for b in v.bricks.iter_mut().filter(|b| up_nodes.contains(&b.id.node)) {
                                b.online = true;
                            }
                        }
                        reply(op, true, "")
                    }
                    None => reply(op, false, "volume does not exist"),
                }
            }
            Operation::VolumeStop { volume, .. } => match state.volumes.get_mut(volume) {
                Some(v) => {
                    v.status = VOL_NOT_STARTED.to_string();
                    reply(op, true, "")
                }
                None => reply(op, false, "volume does not exist"),
            },
            Operation::VolumeDelete { volume } => match state.volumes.remove(volume) {
                Some(_) => reply(op, true, ""),
                None => reply(op, false, "volume does not exist"),
            },
            Operation::VolumeAddBrick {
                volume,
                replicas,
                bricks,
            } => match state.volumes.get_mut(volume) {
                Some(v) => {
                    let new_bricks = bricks.iter().map(|id| SimBrick {
                        id: id.clone(),
                        online: true,
                    });
                    if *replicas > v.replicas {
                        // one new brick closes every shard
                        let mut merged = Vec::new();
                        let mut added = new_bricks;
                        for shard in v.bricks.chunks(v.replicas.max(1)) {
                            merged.extend_from_slice(shard);
                            if let Some(b) = added.next() {
                                merged.push(b);
                            }
                        }
                        v.bricks = merged;
                        v.replicas = *replicas;
                    } else {
                        v.bricks.extend(new_bricks);
                    }
                    reply(op, true, "")
                }
                None => reply(op, false, "volume does not exist"),
            },
            Operation::VolumeRemoveBrick {
                volume,
                replicas,
                bricks,
            } => match state.volumes.get_mut(volume) {
                Some(v) => {
                    v.bricks.retain(|b| !bricks.contains(&b.id));
                    v.replicas = (*replicas).max(1);
                    reply(op, true, "")
                }
                None => reply(op, false, "volume does not exist"),
            },
            Operation::VolumeReplaceBrick { volume, from, to } => match state.volumes.get_mut(volume) {
                Some(v) => match v.bricks.iter_mut().find(|b| &b.id == from) {
                    Some(b) => {
                        b.id = to.clone();
                        b.online = true;
                        reply(op, true, "")
                    }
                    None => reply(op, false, "brick not part of volume"),
                },
                None => reply(op, false, "volume does not exist"),
            },
            Operation::VolumeSet { volume, key, value } => match state.volumes.get_mut(volume) {
                Some(v) => {
                    v.options.insert(key.clone(), value.clone());
                    reply(op, true, "")
                }
                None => reply(op, false, "volume does not exist"),
            },
            Operation::ForceRemoveVolumeBricks { .. } => reply(op, true, ""),
        }
    }
}

#[async_trait]
impl RemoteManager for SimulatedCluster {
    async fn fetch_node_status(&self, node: &Node) -> Result<NodeStatus, RemoteError> {
        let state = self.state.lock();
        match state.nodes.get(node) {
            Some(sim) if sim.up => Ok(Self::node_view(&state, node, sim)),
            _ => Err(RemoteError::Unreachable { node: node.clone() }),
        }
    }

    async fn execute(&self, operation: &Operation, node: &Node) -> Result<OperationResult, RemoteError> {
        let mut state = self.state.lock();
        if !state.nodes.get(node).map_or(false, |n| n.up) {
            return Err(RemoteError::Unreachable { node: node.clone() });
        }
        state.executed.push((node.clone(), operation.clone()));

        let (command, subcommand, _) = operation.command();
        if state.failing.contains(&format!("{} {}", command, subcommand)) {
            return Ok(reply(operation, false, "injected failure"));
        }
        Ok(Self::apply(&mut state, operation, node))
    }
}
