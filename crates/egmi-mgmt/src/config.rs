use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::MgmtError;
use crate::layout::BrickPolicy;
use crate::types::{Node, Volume};

/// Grace periods before a problem is acted upon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProblemTimeouts {
    /// Node down with bricks before they are relocated.
    pub node_down_secs: u64,
    /// Node down without bricks before it is evicted.
    pub node_down_removal_secs: u64,
    /// Brick offline before it is force-started.
    pub brick_offline_secs: u64,
    /// Volume listing failing on a reachable node before the node is reset.
    pub node_corrupted_secs: u64,
    /// Unmanaged volume missing before it is forgotten.
    pub no_volume_secs: u64,
}

impl Default for ProblemTimeouts {
    fn default() -> Self {
        Self {
            node_down_secs: 600,
            node_down_removal_secs: 3600,
            brick_offline_secs: 60,
            node_corrupted_secs: 300,
            no_volume_secs: 3600,
        }
    }
}

/// Backend used for leader election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorKind {
    /// No coordination service: this process is the leader.
    Standalone,
    /// In-process coordinator.
    InMemory,
    /// ZooKeeper ensemble at `zookeeper_urls`.
    Zookeeper,
}

/// Leader election settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Forces the role when set.
    pub master: Option<bool>,
    /// Coordination backend.
    pub coordinator: CoordinatorKind,
    /// Delay before a failed election is retried.
    pub retry_backoff_secs: u64,
    /// Register this process as a data node.
    pub data_node: bool,
    /// ZooKeeper connect string, `host:port` pairs joined by `,`.
    pub zookeeper_urls: String,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            master: None,
            coordinator: CoordinatorKind::Standalone,
            retry_backoff_secs: 10,
            data_node: true,
            zookeeper_urls: "localhost:2181".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EgmiConfig {
    pub hostname: String,
    pub bind_addr: SocketAddr,
    pub config_storage_path: PathBuf,
    pub status_update_period_secs: u64,
    pub target_number_of_bricks: BrickPolicy,
    pub default_number_replica: usize,
    pub target_volumes: Vec<String>,
    pub predefined_nodes: Vec<String>,
    pub volumes_performance_off: Vec<String>,
    pub performance_off_options: Vec<String>,
    pub volume_path: String,
    pub remote_port: u16,
    pub remote_context_root: String,
    pub remote_connect_timeout_ms: u64,
    pub remote_read_timeout_ms: u64,
    pub problem_timeouts: ProblemTimeouts,
    pub election: ElectionConfig,
    pub master_redirect_url_pattern: Option<String>,
    pub message_log_capacity: usize,
}

impl Default for EgmiConfig {
    fn default() -> Self {
        Self {
            hostname: String::from("localhost"),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 28901)),
            config_storage_path: PathBuf::from("/var/lib/egmi"),
            status_update_period_secs: 30,
            target_number_of_bricks: BrickPolicy::LogDispatch,
            default_number_replica: 3,
            target_volumes: Vec::new(),
            predefined_nodes: Vec::new(),
            volumes_performance_off: Vec::new(),
            performance_off_options: Vec::new(),
            volume_path: String::from("/var/lib/gluster/volume_bricks"),
            remote_port: 18999,
            remote_context_root: String::new(),
            remote_connect_timeout_ms: 5_000,
            remote_read_timeout_ms: 30_000,
            problem_timeouts: ProblemTimeouts::default(),
            election: ElectionConfig::default(),
            master_redirect_url_pattern: None,
            message_log_capacity: 1000,
        }
    }
}

fn non_blank(items: &[String]) -> impl Iterator<Item = &str> {
    items.iter().map(|s| s.trim()).filter(|s| !s.is_empty())
}

impl EgmiConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: EgmiConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the control plane cannot run with.
    pub fn validate(&self) -> Result<(), MgmtError> {
        if self.status_update_period_secs == 0 {
            return Err(MgmtError::Config("status_update_period_secs must be > 0".into()));
        }
        if self.default_number_replica == 0 {
            return Err(MgmtError::Config("default_number_replica must be > 0".into()));
        }
        if self.config_storage_path.as_os_str().is_empty() {
            return Err(MgmtError::Config("config_storage_path is required".into()));
        }
        if self.volume_path.trim().is_empty() {
            return Err(MgmtError::Config("volume_path is required".into()));
        }
        if self.hostname.trim().is_empty() {
            return Err(MgmtError::Config("hostname is required".into()));
        }
        let election = &self.election;
        if election.coordinator == CoordinatorKind::Zookeeper && election.zookeeper_urls.trim().is_empty() {
            return Err(MgmtError::Config("election.zookeeper_urls is required".into()));
        }
        Ok(())
    }

    pub fn status_update_period(&self) -> Duration {
        Duration::from_secs(self.status_update_period_secs)
    }

    pub fn configured_nodes(&self) -> BTreeSet<Node> {
        non_blank(&self.predefined_nodes).map(Node::new).collect()
    }

    pub fn configured_volumes(&self) -> BTreeSet<Volume> {
        non_blank(&self.target_volumes).map(Volume::new).collect()
    }

    pub fn volumes_performance_off(&self) -> BTreeSet<Volume> {
        non_blank(&self.volumes_performance_off).map(Volume::new).collect()
    }

    pub fn performance_off_options(&self) -> BTreeSet<String> {
        non_blank(&self.performance_off_options).map(String::from).collect()
    }

    /// Master URL advertised to peers, from the redirect pattern.
    pub fn master_url(&self, master_hostname: &str) -> String {
        match &self.master_redirect_url_pattern {
            Some(pattern) => pattern
                .replace("{MASTER_NODE}", master_hostname)
                .replace("{MASTER_NODE_NAME}", &master_hostname.replace('.', "-")),
            None => format!("http://{}:{}/", master_hostname, self.bind_addr.port()),
        }
    }
}
