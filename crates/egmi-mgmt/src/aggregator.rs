//! Builds the cluster-wide [`SystemStatus`] from per-node reports.
//!
//! Aggregation runs once per cycle on the leader. Besides merging what every
//! node says about nodes, volumes and bricks, it is the detection phase of
//! the engine: every anomaly found while merging registers a problem.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::EgmiConfig;
use crate::election::LeadershipState;
use crate::error::{MgmtError, NodeStatusError, SettingsError};
use crate::layout::{BrickPolicy, RuntimeLayout};
use crate::messages::MessageLog;
use crate::node_status::{sort_by_number, NodeStatus, VOL_NOT_STARTED};
use crate::partition::detect_partitions;
use crate::problems::{
    BrickOffline, MissingBrick, NoVolume, NodeCorrupted, NodeDown, NodeDownRemoval, NodeInconsistent,
    NodePartitioned, ProblemRegistry, VolumeNotStarted, WrongOption,
};
use crate::settings::{RuntimeSettings, DISCOVERED_NODES, DISCOVERED_VOLUMES, STATIC_NODES};
use crate::system_status::{BrickEntry, NodeEntry, NodeState, SystemStatus, VolumeEntry};
use crate::types::{Node, Volume};

/// Merges node reports into a [`SystemStatus`] and registers problems.
pub struct StatusAggregator {
    settings: Arc<RuntimeSettings>,
    messages: Arc<MessageLog>,
    configured_nodes: BTreeSet<Node>,
    configured_volumes: BTreeSet<Volume>,
    performance_off_volumes: BTreeSet<Volume>,
    performance_off_options: BTreeSet<String>,
    policy: BrickPolicy,
    default_replicas: usize,
    /// Source of registered data nodes when no node is configured.
    data_nodes: Option<Arc<LeadershipState>>,
}

impl StatusAggregator {
    pub fn new(config: &EgmiConfig, settings: Arc<RuntimeSettings>, messages: Arc<MessageLog>) -> Self {
        Self {
            settings,
            messages,
            configured_nodes: config.configured_nodes(),
            configured_volumes: config.configured_volumes(),
            performance_off_volumes: config.volumes_performance_off(),
            performance_off_options: config.performance_off_options(),
            policy: config.target_number_of_bricks,
            default_replicas: config.default_number_replica,
            data_nodes: None,
        }
    }

    /// Falls back to the data nodes registered through `leadership` when
    /// no node is configured.
    pub fn with_data_nodes(mut self, leadership: Arc<LeadershipState>) -> Self {
        self.data_nodes = Some(leadership);
        self
    }

    /// Configured nodes, or the registered data nodes without any.
    pub fn managed_nodes(&self) -> BTreeSet<Node> {
        if !self.configured_nodes.is_empty() {
            return self.configured_nodes.clone();
        }
        self.data_nodes
            .as_ref()
            .map(|l| l.data_nodes())
            .unwrap_or_default()
    }

    /// Managed, discovered and statically added nodes.
    pub fn known_nodes(&self) -> Result<BTreeSet<Node>, SettingsError> {
        let mut nodes = self.managed_nodes();
        nodes.extend(self.settings.nodes(DISCOVERED_NODES)?);
        nodes.extend(self.settings.nodes(STATIC_NODES)?);
        Ok(nodes)
    }

    /// Every node the cluster should know about; persisted when it changed.
    pub fn runtime_nodes(&self, statuses: &BTreeMap<Node, NodeStatus>) -> Result<BTreeSet<Node>, SettingsError> {
        let mut nodes = self.known_nodes()?;
        for (reporter, status) in statuses {
            if let Ok(peers) = status.all_peers(reporter) {
                nodes.extend(peers.into_iter().filter(|p| !p.is_localhost()));
            }
        }

        if self
            .settings
            .replace_list(DISCOVERED_NODES, nodes.iter().map(Node::address))?
        {
            debug!(count = nodes.len(), "runtime node set changed");
        }
        Ok(nodes)
    }

    /// Every volume the cluster should know about; persisted when it changed.
    pub fn runtime_volumes(
        &self,
        statuses: &BTreeMap<Node, NodeStatus>,
    ) -> Result<BTreeSet<Volume>, SettingsError> {
        let mut volumes = self.configured_volumes.clone();
        volumes.extend(self.settings.volumes(DISCOVERED_VOLUMES)?);
        for (reporter, status) in statuses {
            if let Ok(known) = status.all_volumes(reporter) {
                volumes.extend(known);
            }
        }

        if self
            .settings
            .replace_list(DISCOVERED_VOLUMES, volumes.iter().map(Volume::name))?
        {
            debug!(count = volumes.len(), "runtime volume set changed");
        }
        Ok(volumes)
    }

    /// Target layout; sized on the configured nodes when there are some.
    pub fn target_layout(&self, runtime_nodes: usize) -> RuntimeLayout {
        let managed = self.managed_nodes();
        let count = if managed.is_empty() { runtime_nodes } else { managed.len() };
        RuntimeLayout::compute(count, self.policy, self.default_replicas)
    }

    /// Runs the whole detection phase over one cycle's reports.
    pub fn build_system_status(
        &self,
        hostname: &str,
        statuses: &BTreeMap<Node, NodeStatus>,
        registry: &mut ProblemRegistry,
    ) -> Result<SystemStatus, MgmtError> {
        let nodes = self.runtime_nodes(statuses)?;
        let volumes = self.runtime_volumes(statuses)?;

        let mut status = SystemStatus {
            hostname: hostname.to_string(),
            nodes: build_node_entries(statuses, &nodes, registry),
            volumes: Vec::new(),
        };
        status.volumes = self.build_volume_entries(statuses, &nodes, &volumes, &status.nodes, registry)?;

        flag_partitions(&nodes, statuses, &mut status.nodes, registry);
        detect_connection_inconsistencies(&nodes, statuses, &mut status.nodes, registry);
        detect_brickless_down_nodes(&status, registry);
        Ok(status)
    }

    fn inconsistency(&self, text: String) {
        warn!("{}", text);
        self.messages.warn(text);
    }

    fn build_volume_entries(
        &self,
        statuses: &BTreeMap<Node, NodeStatus>,
        nodes: &BTreeSet<Node>,
        volumes: &BTreeSet<Volume>,
        node_entries: &[NodeEntry],
        registry: &mut ProblemRegistry,
    ) -> Result<Vec<VolumeEntry>, NodeStatusError> {
        let layout = self.target_layout(nodes.len());
        volumes
            .iter()
            .map(|volume| self.build_volume_entry(statuses, nodes, volume, &layout, node_entries, registry))
            .collect()
    }

    fn build_volume_entry(
        &self,
        statuses: &BTreeMap<Node, NodeStatus>,
        nodes: &BTreeSet<Node>,
        volume: &Volume,
        layout: &RuntimeLayout,
        node_entries: &[NodeEntry],
        registry: &mut ProblemRegistry,
    ) -> Result<VolumeEntry, NodeStatusError> {
        let mut merged = MergedVolume::default();
        let mut errors: BTreeSet<String> = BTreeSet::new();
        let mut options: BTreeMap<String, String> = BTreeMap::new();
        let mut bricks: Vec<BrickEntry> = Vec::new();

        for node in nodes {
            let Some(node_status) = statuses.get(node) else {
                continue;
            };
            if node_status.volume_status_error {
                continue;
            }
            let info = node_status.volume_information(node, volume)?.unwrap_or_default();
            let vol_status = info.status.clone().unwrap_or_default();

            let nb_replicas = info.nb_replicas.map(|r| match info.nb_arbiters {
                Some(a) => format!("({} + {}) / {}", r, a, layout.replicas),
                None => format!("{} / {}", r, layout.replicas),
            });
            let nb_shards = info.nb_shards.map(|s| format!("{} / {}", s, layout.shards));
            let nb_bricks = info.nb_bricks.map(|b| format!("{} / {}", b, layout.bricks));

            merged.set(Attr::Type, info.volume_type, &mut errors);
            merged.set(Attr::Owner, info.owner, &mut errors);
            for (attr, value) in [
                (Attr::Shards, nb_shards),
                (Attr::Replicas, nb_replicas),
                (Attr::Bricks, nb_bricks),
            ] {
                if let Some(clash) = merged.set(attr, value, &mut errors) {
                    self.inconsistency(format!(" - for volume {} - got {}", volume, clash));
                }
            }

            if !node_status.brick_status_error {
                for (key, value) in node_status.reconfigured_options(node, volume)? {
                    match options.get(&key) {
                        Some(prev) if !prev.trim().is_empty() => {
                            if prev != &value {
                                errors.insert("DIFB. OPTIONS".to_string());
                                self.inconsistency(format!(
                                    " - got option value {} while previous node had value {}",
                                    value, prev
                                ));
                            }
                        }
                        _ => {
                            options.insert(key, value);
                        }
                    }
                }
            }

            let bricks_info = if node_status.brick_status_error {
                BTreeMap::new()
            } else {
                node_status.volume_bricks_information(node, volume)?
            };
            for id in sort_by_number(&bricks_info) {
                let brick_info = &bricks_info[&id];
                let index = match bricks.iter().position(|b| b.id == id) {
                    Some(i) => i,
                    None => {
                        bricks.push(BrickEntry {
                            id: id.clone(),
                            number: brick_info.number,
                            node: id.node.clone(),
                            path: id.path.clone(),
                            status: None,
                            device: None,
                            free: None,
                            tot: None,
                        });
                        bricks.len() - 1
                    }
                };
                let entry = &mut bricks[index];
                if entry.number.is_none() {
                    entry.number = brick_info.number;
                } else if brick_info.number.is_some() && entry.number != brick_info.number {
                    errors.insert("DIFB. NBR".to_string());
                }

                if vol_status == VOL_NOT_STARTED {
                    // applies to the whole volume
                    errors.clear();
                    errors.insert("NOT STARTED".to_string());
                    registry.add(VolumeNotStarted::new(volume.clone()).into());
                    continue;
                }
                if vol_status.contains("TEMP") {
                    continue;
                }

                if brick_info.status.as_deref().map(str::trim) == Some("OFFLINE") {
                    errors.insert("BRICK OFFLINE".to_string());
                    registry.add(BrickOffline::new(volume.clone(), id.clone()).into());
                }
                merge_brick_field(&mut entry.status, &brick_info.status, "STATUS", &mut errors);
                merge_brick_field(&mut entry.device, &brick_info.device, "DEV", &mut errors);
                entry.free = brick_info.free.clone();
                entry.tot = brick_info.total.clone();
            }
        }

        if merged.volume_type.is_none() {
            errors.insert("NO VOLUME".to_string());
            registry.add(NoVolume::new(volume.clone()).into());
        } else {
            if bricks.len() < layout.bricks {
                errors.insert(format!("MISSING {} BRICKS", layout.bricks - bricks.len()));
                registry.add(MissingBrick::new(volume.clone(), layout.bricks, bricks.len()).into());
            }

            if self.performance_off_volumes.contains(volume) {
                for key in &self.performance_off_options {
                    let value = options.get(key).cloned();
                    if value.as_deref().map(str::trim) != Some("off") {
                        errors.insert(format!(
                            "{} WRONG OPTION {}/{}",
                            volume,
                            key,
                            value.as_deref().unwrap_or("null")
                        ));
                        registry.add(WrongOption::new(volume.clone(), key.clone(), value, "off").into());
                    }
                }
            }
        }

        for brick in bricks.iter().filter(|b| b.status.is_none()) {
            let down = node_entries
                .iter()
                .find(|n| n.host == brick.node)
                .map_or(true, |n| n.status == NodeState::Ko);
            if down {
                errors.insert(format!("{} DOWN", brick.node));
                registry.add(NodeDown::new(volume.clone(), brick.node.clone()).into());
            }
        }

        Ok(VolumeEntry {
            volume: volume.clone(),
            status: if errors.is_empty() {
                "OK".to_string()
            } else {
                errors.into_iter().collect::<Vec<_>>().join(" / ")
            },
            volume_type: merged.volume_type,
            owner: merged.owner,
            nb_shards: merged.nb_shards,
            nb_replicas: merged.nb_replicas,
            nb_bricks: merged.nb_bricks,
            bricks,
            options,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Attr {
    Type,
    Owner,
    Shards,
    Replicas,
    Bricks,
}

impl Attr {
    fn tag(self) -> &'static str {
        match self {
            Attr::Type => "TYPES",
            Attr::Owner => "OWNER",
            Attr::Shards => "NB. SHARDS",
            Attr::Replicas => "NB. REPL.",
            Attr::Bricks => "NB. BRICKS",
        }
    }

    fn appendable(self) -> bool {
        matches!(self, Attr::Type | Attr::Owner)
    }
}

#[derive(Debug, Default)]
struct MergedVolume {
    volume_type: Option<String>,
    owner: Option<String>,
    nb_shards: Option<String>,
    nb_replicas: Option<String>,
    nb_bricks: Option<String>,
}

impl MergedVolume {
    fn slot(&mut self, attr: Attr) -> &mut Option<String> {
        match attr {
            Attr::Type => &mut self.volume_type,
            Attr::Owner => &mut self.owner,
            Attr::Shards => &mut self.nb_shards,
            Attr::Replicas => &mut self.nb_replicas,
            Attr::Bricks => &mut self.nb_bricks,
        }
    }

    /// First value wins. A differing value raises `DIF <tag>`; appendable
    /// attributes keep both. Returns the clash description for the others.
    fn set(&mut self, attr: Attr, value: Option<String>, errors: &mut BTreeSet<String>) -> Option<String> {
        let value = value.filter(|v| !v.trim().is_empty())?;
        let slot = self.slot(attr);
        let Some(prev) = slot.clone() else {
            *slot = Some(value);
            return None;
        };
        if prev == value {
            return None;
        }
        errors.insert(format!("DIF {}", attr.tag()));
        if attr.appendable() {
            *slot = Some(format!("{},{}", prev, value));
            None
        } else {
            Some(format!("{} while previous node had {}", value, prev))
        }
    }
}

fn merge_brick_field(
    slot: &mut Option<String>,
    value: &Option<String>,
    tag: &str,
    errors: &mut BTreeSet<String>,
) {
    let known = slot.as_deref().map_or(false, |prev| !prev.trim().is_empty());
    if !known {
        *slot = value.clone();
    } else if *value != *slot {
        errors.insert(format!("DIFB. {}", tag));
    }
}

/// One entry per node: KO when unreachable or its peer listing failed,
/// CORRUPTED when its volume listing failed.
pub fn build_node_entries(
    statuses: &BTreeMap<Node, NodeStatus>,
    nodes: &BTreeSet<Node>,
    registry: &mut ProblemRegistry,
) -> Vec<NodeEntry> {
    nodes
        .iter()
        .map(|node| {
            let info = statuses
                .get(node)
                .and_then(|s| s.node_information(node).ok().map(|info| (s, info)));
            match info {
                None => NodeEntry {
                    host: node.clone(),
                    status: NodeState::Ko,
                    volumes: None,
                    nbr_bricks: None,
                },
                Some((status, _)) if status.volume_status_error => {
                    registry.add(NodeCorrupted::new(node.clone()).into());
                    NodeEntry {
                        host: node.clone(),
                        status: NodeState::Corrupted,
                        volumes: Some("?".to_string()),
                        nbr_bricks: None,
                    }
                }
                Some((_, info)) => NodeEntry {
                    host: node.clone(),
                    status: NodeState::Ok,
                    volumes: Some(
                        info.volumes
                            .iter()
                            .map(Volume::name)
                            .collect::<Vec<_>>()
                            .join(", "),
                    ),
                    nbr_bricks: Some(info.brick_count),
                },
            }
        })
        .collect()
}

fn set_state(entries: &mut [NodeEntry], host: &Node, state: NodeState) -> bool {
    match entries.iter_mut().find(|e| &e.host == host) {
        Some(entry) if !entry.status.is_sticky() => {
            entry.status = state;
            true
        }
        _ => false,
    }
}

/// Flags nodes outside the best-connected group PARTITIONED.
pub fn flag_partitions(
    nodes: &BTreeSet<Node>,
    statuses: &BTreeMap<Node, NodeStatus>,
    entries: &mut [NodeEntry],
    registry: &mut ProblemRegistry,
) {
    for host in detect_partitions(nodes, statuses) {
        if set_state(entries, &host, NodeState::Partitioned) {
            registry.add(NodePartitioned::new(host).into());
        }
    }
}

/// Flags a node INCONSISTENT when another node lists it as peer but it does
/// not list that node back. One flag per node.
pub fn detect_connection_inconsistencies(
    nodes: &BTreeSet<Node>,
    statuses: &BTreeMap<Node, NodeStatus>,
    entries: &mut [NodeEntry],
    registry: &mut ProblemRegistry,
) {
    let peers: BTreeMap<&Node, BTreeSet<Node>> = nodes
        .iter()
        .filter_map(|n| {
            let listed = statuses.get(n)?.all_peers(n).ok()?;
            Some((n, listed))
        })
        .collect();

    for (node, node_peers) in &peers {
        for (other, other_peers) in &peers {
            if node == other {
                continue;
            }
            if other_peers.contains(*node) && !node_peers.contains(*other) {
                if set_state(entries, node, NodeState::Inconsistent) {
                    registry.add(NodeInconsistent::new((*node).clone(), (*other).clone()).into());
                    break;
                }
            }
        }
    }
}

/// KO nodes holding no brick of any volume are candidates for eviction.
pub fn detect_brickless_down_nodes(status: &SystemStatus, registry: &mut ProblemRegistry) {
    let brick_nodes: BTreeSet<&Node> = status
        .volumes
        .iter()
        .flat_map(|v| v.bricks.iter().map(|b| &b.node))
        .collect();
    for entry in status.nodes.iter().filter(|n| n.status == NodeState::Ko) {
        if !brick_nodes.contains(&entry.host) {
            registry.add(NodeDownRemoval::new(entry.host.clone()).into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{collect_all, RemoteManager};
    use crate::remote_sim::SimulatedCluster;
    use crate::types::BrickId;

    const ROOT: &str = "/var/lib/gluster/volume_bricks";

    fn brick(node: &str, volume: &str) -> BrickId {
        BrickId::new(Node::new(node), format!("{}/{}", ROOT, volume))
    }

    fn setup(nodes: &[&str], volumes: &[&str]) -> (SimulatedCluster, tempfile::TempDir, StatusAggregator) {
        let sim = SimulatedCluster::new();
        for n in nodes {
            sim.add_node(n);
        }
        sim.connect_all(nodes);
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = EgmiConfig::default();
        config.predefined_nodes = nodes.iter().map(|n| n.to_string()).collect();
        config.target_volumes = volumes.iter().map(|v| v.to_string()).collect();
        let aggregator = StatusAggregator::new(
            &config,
            Arc::new(RuntimeSettings::new(dir.path())),
            Arc::new(MessageLog::default()),
        );
        (sim, dir, aggregator)
    }

    #[test]
    fn test_data_nodes_stand_in_for_configured_nodes() {
        let (_sim, _dir, aggregator) = setup(&[], &[]);
        let leadership = Arc::new(LeadershipState::default());
        let aggregator = aggregator.with_data_nodes(leadership.clone());
        assert!(aggregator.known_nodes().unwrap().is_empty());

        leadership.set_data_nodes(["n1", "n2", "n3", "n4"]);
        assert_eq!(aggregator.known_nodes().unwrap().len(), 4);
        assert_eq!(aggregator.target_layout(1).bricks, 3);

        let (_sim, _dir, configured) = setup(&["n1", "n2"], &[]);
        let configured = configured.with_data_nodes(leadership);
        assert_eq!(
            configured.managed_nodes(),
            [Node::new("n1"), Node::new("n2")].into_iter().collect()
        );
    }

    async fn statuses(sim: &SimulatedCluster, nodes: &[&str]) -> BTreeMap<Node, NodeStatus> {
        let set: BTreeSet<Node> = nodes.iter().map(|n| Node::new(n)).collect();
        collect_all(sim as &dyn RemoteManager, &set).await
    }

    #[tokio::test]
    async fn test_healthy_cluster() {
        let nodes = ["n1", "n2", "n3"];
        let (sim, _dir, aggregator) = setup(&nodes, &["logs"]);
        sim.add_volume(
            "logs",
            3,
            &[brick("n1", "logs"), brick("n2", "logs"), brick("n3", "logs")],
        );
        let mut registry = ProblemRegistry::new();
        let status = aggregator
            .build_system_status("n1", &statuses(&sim, &nodes).await, &mut registry)
            .unwrap();

        assert!(registry.is_empty(), "{:?}", registry.ids());
        assert_eq!(status.healthy_nodes().len(), 3);
        let volume = status.volume(&Volume::new("logs")).unwrap();
        assert_eq!(volume.status, "OK");
        assert_eq!(volume.nb_replicas.as_deref(), Some("3 / 3"));
        assert_eq!(volume.nb_shards.as_deref(), Some("1 / 1"));
        assert_eq!(volume.bricks.len(), 3);
        assert_eq!(volume.bricks[0].number, Some(1));
        assert_eq!(status.node(&Node::new("n1")).unwrap().volumes.as_deref(), Some("logs"));
    }

    #[tokio::test]
    async fn test_missing_volume_and_bricks() {
        let nodes = ["n1", "n2", "n3"];
        let (sim, _dir, aggregator) = setup(&nodes, &["logs", "data"]);
        sim.add_volume("data", 1, &[brick("n1", "data")]);
        let mut registry = ProblemRegistry::new();
        let status = aggregator
            .build_system_status("n1", &statuses(&sim, &nodes).await, &mut registry)
            .unwrap();

        assert_eq!(status.volume(&Volume::new("logs")).unwrap().status, "NO VOLUME");
        assert_eq!(
            status.volume(&Volume::new("data")).unwrap().status,
            "MISSING 2 BRICKS"
        );
        assert!(registry.contains("NO_VOLUME-logs"));
        assert!(registry.contains("MISSING_BRICK-data-2"));
    }

    #[tokio::test]
    async fn test_down_node() {
        let nodes = ["n1", "n2", "n3"];
        let (sim, _dir, aggregator) = setup(&nodes, &["logs"]);
        sim.add_volume(
            "logs",
            3,
            &[brick("n1", "logs"), brick("n2", "logs"), brick("n3", "logs")],
        );
        sim.set_node_up("n3", false);
        let mut registry = ProblemRegistry::new();
        let status = aggregator
            .build_system_status("n1", &statuses(&sim, &nodes).await, &mut registry)
            .unwrap();

        assert_eq!(status.node_state(&Node::new("n3")), Some(NodeState::Ko));
        assert_eq!(status.volume(&Volume::new("logs")).unwrap().status, "n3 DOWN");
        assert!(registry.contains("NODE_DOWN-logs-n3"));
        assert!(!registry.contains("NODE_DOWN-REMOVAL-n3"));
        assert!(!registry.contains("NODE_PARTITIONED-n3"));
    }

    #[tokio::test]
    async fn test_offline_brick_and_stopped_volume() {
        let nodes = ["n1", "n2"];
        let (sim, _dir, aggregator) = setup(&nodes, &["logs", "data"]);
        sim.add_volume("logs", 2, &[brick("n1", "logs"), brick("n2", "logs")]);
        sim.add_volume("data", 2, &[brick("n1", "data"), brick("n2", "data")]);
        sim.set_brick_online("logs", &brick("n2", "logs"), false);
        sim.set_volume_status("data", VOL_NOT_STARTED);
        let mut registry = ProblemRegistry::new();
        let status = aggregator
            .build_system_status("n1", &statuses(&sim, &nodes).await, &mut registry)
            .unwrap();

        assert_eq!(status.volume(&Volume::new("logs")).unwrap().status, "BRICK OFFLINE");
        assert_eq!(status.volume(&Volume::new("data")).unwrap().status, "NOT STARTED");
        assert!(registry.contains(&format!("BRICK_OFFLINE-logs-{}", brick("n2", "logs"))));
        assert!(registry.contains("VOLUME_DOWN-data"));
    }

    #[tokio::test]
    async fn test_wrong_option() {
        let nodes = ["n1"];
        let sim = SimulatedCluster::new();
        sim.add_node("n1");
        sim.add_volume("logs", 1, &[brick("n1", "logs")]);
        sim.set_option("logs", "performance.quick-read", "on");
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = EgmiConfig::default();
        config.predefined_nodes = vec!["n1".to_string()];
        config.target_volumes = vec!["logs".to_string()];
        config.volumes_performance_off = vec!["logs".to_string()];
        config.performance_off_options = vec!["performance.quick-read".to_string()];
        let aggregator = StatusAggregator::new(
            &config,
            Arc::new(RuntimeSettings::new(dir.path())),
            Arc::new(MessageLog::default()),
        );

        let mut registry = ProblemRegistry::new();
        let status = aggregator
            .build_system_status("n1", &statuses(&sim, &nodes).await, &mut registry)
            .unwrap();
        assert_eq!(
            status.volume(&Volume::new("logs")).unwrap().status,
            "logs WRONG OPTION performance.quick-read/on"
        );
        assert!(registry.contains("WRONG_OPTION-logs-performance.quick-read-off"));
    }

    #[tokio::test]
    async fn test_partition_and_inconsistency() {
        let nodes = ["a", "b", "c", "d"];
        let (sim, _dir, aggregator) = setup(&nodes, &[]);
        sim.connect_all(&["a", "b", "c"]);
        for n in ["a", "b", "c"] {
            sim.unlink(n, "d");
            sim.unlink("d", n);
        }
        sim.unlink("c", "b");
        let mut registry = ProblemRegistry::new();
        let status = aggregator
            .build_system_status("a", &statuses(&sim, &nodes).await, &mut registry)
            .unwrap();

        assert_eq!(status.node_state(&Node::new("d")), Some(NodeState::Partitioned));
        assert!(registry.contains("NODE_PARTITIONED-d"));
        assert_eq!(status.node_state(&Node::new("c")), Some(NodeState::Inconsistent));
        assert!(registry.contains("NODE_INCONSISTENT-c-b"));
    }

    #[tokio::test]
    async fn test_corrupted_node_is_sticky() {
        let nodes = ["n1", "n2"];
        let (sim, _dir, aggregator) = setup(&nodes, &[]);
        sim.set_volume_error("n2", true);
        let mut registry = ProblemRegistry::new();
        let status = aggregator
            .build_system_status("n1", &statuses(&sim, &nodes).await, &mut registry)
            .unwrap();

        let entry = status.node(&Node::new("n2")).unwrap();
        assert_eq!(entry.status, NodeState::Corrupted);
        assert_eq!(entry.volumes.as_deref(), Some("?"));
        assert!(registry.contains("NODE_CORRUPTED-n2"));
        assert!(!registry.contains("NODE_PARTITIONED-n2"));
    }

    #[tokio::test]
    async fn test_runtime_sets_are_persisted() {
        let nodes = ["n1", "n2"];
        let (sim, dir, aggregator) = setup(&["n1"], &[]);
        sim.add_node("n2");
        sim.connect_all(&nodes);
        sim.add_volume("spark", 1, &[brick("n2", "spark")]);
        let reports = statuses(&sim, &["n1"]).await;

        let found = aggregator.runtime_nodes(&reports).unwrap();
        assert_eq!(found, [Node::new("n1"), Node::new("n2")].into());
        let found = aggregator.runtime_volumes(&reports).unwrap();
        assert_eq!(found, [Volume::new("spark")].into());

        let settings = RuntimeSettings::new(dir.path());
        assert_eq!(settings.list(DISCOVERED_NODES).unwrap().len(), 2);
        assert!(settings.list(DISCOVERED_VOLUMES).unwrap().contains("spark"));
    }

    #[tokio::test]
    async fn test_down_node_without_bricks_is_evicted() {
        let nodes = ["n1", "n2"];
        let (sim, _dir, aggregator) = setup(&nodes, &[]);
        sim.set_node_up("n2", false);
        let mut registry = ProblemRegistry::new();
        aggregator
            .build_system_status("n1", &statuses(&sim, &nodes).await, &mut registry)
            .unwrap();
        assert_eq!(registry.ids(), vec!["NODE_DOWN-REMOVAL-n2".to_string()]);
    }
}
