//! ZooKeeper coordination backend.
//!
//! Maps [`CoordinationSession`] onto a ZooKeeper client session. Nodes are
//! created world-writable, sequential suffixes follow the server's
//! ten-digit format and watches are one-shot data watches.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use zookeeper_client as zk;

use crate::election::{CoordinationSession, Coordinator, CreateMode, WatchEvent};
use crate::error::CoordinationError;

/// Opens sessions against a ZooKeeper ensemble.
pub struct ZookeeperCoordinator {
    connect_string: String,
    sessions: AtomicU64,
}

impl ZookeeperCoordinator {
    /// `connect_string` is the usual `host:port[,host:port...]` list.
    pub fn new(connect_string: impl Into<String>) -> Self {
        Self {
            connect_string: connect_string.into(),
            sessions: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Coordinator for ZookeeperCoordinator {
    async fn connect(&self) -> Result<Arc<dyn CoordinationSession>, CoordinationError> {
        let client = zk::Client::connect(&self.connect_string)
            .await
            .map_err(|e| map_error(e, &self.connect_string, false))?;
        let id = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        info!(session = id, servers = %self.connect_string, "zookeeper session opened");
        Ok(Arc::new(ZookeeperSession {
            id,
            client: Mutex::new(Some(client)),
        }))
    }
}

struct ZookeeperSession {
    id: u64,
    client: Mutex<Option<zk::Client>>,
}

impl ZookeeperSession {
    fn client(&self) -> Result<zk::Client, CoordinationError> {
        self.client.lock().clone().ok_or(CoordinationError::SessionLost)
    }
}

#[async_trait]
impl CoordinationSession for ZookeeperSession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String, CoordinationError> {
        let client = self.client()?;
        let options = create_mode(mode).with_acls(zk::Acls::anyone_all());
        let (_, sequence) = client
            .create(path, data, &options)
            .await
            .map_err(|e| map_error(e, path, true))?;
        Ok(match mode {
            CreateMode::EphemeralSequential => format!("{}{}", path, sequence),
            CreateMode::Persistent | CreateMode::Ephemeral => path.to_string(),
        })
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordinationError> {
        let stat = self
            .client()?
            .check_stat(path)
            .await
            .map_err(|e| map_error(e, path, false))?;
        Ok(stat.is_some())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        self.client()?
            .list_children(path)
            .await
            .map_err(|e| map_error(e, path, false))
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>, CoordinationError> {
        let (data, _) = self
            .client()?
            .get_data(path)
            .await
            .map_err(|e| map_error(e, path, false))?;
        Ok(data)
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError> {
        self.client()?
            .set_data(path, data, None)
            .await
            .map_err(|e| map_error(e, path, false))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        self.client()?
            .delete(path, None)
            .await
            .map_err(|e| map_error(e, path, false))
    }

    async fn watch(&self, path: &str) -> Result<oneshot::Receiver<WatchEvent>, CoordinationError> {
        let (_, _, watcher) = self
            .client()?
            .get_and_watch_data(path)
            .await
            .map_err(|e| map_error(e, path, false))?;

        let (tx, rx) = oneshot::channel();
        let path = path.to_string();
        tokio::spawn(async move {
            let event = watcher.changed().await;
            debug!(path = %path, event = ?event.event_type, "zookeeper watch fired");
            let _ = tx.send(watch_event(&path, &event.event_type));
        });
        Ok(rx)
    }

    async fn close(&self) {
        if self.client.lock().take().is_some() {
            debug!(session = self.id, "zookeeper session closed");
        }
    }
}

fn create_mode(mode: CreateMode) -> zk::CreateMode {
    match mode {
        CreateMode::Persistent => zk::CreateMode::Persistent,
        CreateMode::Ephemeral => zk::CreateMode::Ephemeral,
        CreateMode::EphemeralSequential => zk::CreateMode::EphemeralSequential,
    }
}

fn watch_event(path: &str, event_type: &zk::EventType) -> WatchEvent {
    match event_type {
        zk::EventType::NodeDeleted => WatchEvent::Deleted(path.to_string()),
        zk::EventType::NodeDataChanged => WatchEvent::DataChanged(path.to_string()),
        _ => WatchEvent::SessionClosed,
    }
}

/// A missing node on create means a missing parent.
fn map_error(error: zk::Error, path: &str, creating: bool) -> CoordinationError {
    match error {
        zk::Error::NoNode if creating => CoordinationError::NoParent(path.to_string()),
        zk::Error::NoNode => CoordinationError::NoNode(path.to_string()),
        zk::Error::NodeExists => CoordinationError::NodeExists(path.to_string()),
        zk::Error::SessionExpired | zk::Error::ConnectionLoss | zk::Error::ClientClosed => {
            CoordinationError::SessionLost
        }
        other => {
            warn!(path, "zookeeper request failed: {}", other);
            CoordinationError::Backend(other.to_string())
        }
    }
}
