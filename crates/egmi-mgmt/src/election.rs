//! Leader election.
//!
//! A single cluster member reconciles at a time. Candidates register an
//! ephemeral-sequential node under the election root; the lowest sequence
//! wins and publishes its id under the master id node. Every other candidate
//! watches its immediate predecessor and re-attempts when it goes away.
//!
//! The coordination service is abstracted behind [`Coordinator`] and
//! [`CoordinationSession`]; [`InMemoryCoordinator`] implements it within a
//! single process.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ElectionConfig;
use crate::error::CoordinationError;
use crate::types::Node;

pub const ROOT: &str = "/egmi";
pub const ELECTION_ROOT: &str = "/egmi/egmi_election";
pub const MASTER_ID: &str = "/egmi/master_id";
pub const DATA_NODES_ROOT: &str = "/egmi/data_nodes";
pub const CANDIDATE_PREFIX: &str = "p_";

/// How often a candidate re-reads the registered data nodes.
pub const DATA_NODES_REFRESH: Duration = Duration::from_secs(10);

/// Master hostname reported when it is not known.
pub const UNKNOWN_MASTER: &str = "[UNKNOWN]";

/// Lifetime of a coordination node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Deleted when the creating session ends.
    Ephemeral,
    /// Ephemeral, with a monotonically increasing suffix appended to the name.
    EphemeralSequential,
}

/// One-shot notification delivered to a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Deleted(String),
    DataChanged(String),
    /// The session holding the watch ended.
    SessionClosed,
}

/// A live session with the coordination service.
#[async_trait]
pub trait CoordinationSession: Send + Sync {
    fn id(&self) -> u64;

    /// Creates `path` and returns the actual path, suffixed for sequential
    /// nodes.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String, CoordinationError>;

    async fn exists(&self, path: &str) -> Result<bool, CoordinationError>;

    /// Child names of `path`, unordered.
    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError>;

    async fn get_data(&self, path: &str) -> Result<Vec<u8>, CoordinationError>;

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError>;

    async fn delete(&self, path: &str) -> Result<(), CoordinationError>;

    /// Watches an existing node for deletion or data change. Fires once.
    async fn watch(&self, path: &str) -> Result<oneshot::Receiver<WatchEvent>, CoordinationError>;

    /// Ends the session, dropping its ephemeral nodes.
    async fn close(&self);
}

/// Opens sessions with the coordination service.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn CoordinationSession>, CoordinationError>;
}

#[derive(Debug)]
struct CoordNode {
    data: Vec<u8>,
    owner: Option<u64>,
}

struct Watch {
    path: String,
    session: u64,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Default)]
struct CoordState {
    nodes: BTreeMap<String, CoordNode>,
    sequences: BTreeMap<String, u64>,
    live: BTreeMap<u64, bool>,
    next_session: u64,
    watches: Vec<Watch>,
}

impl CoordState {
    fn check(&self, session: u64) -> Result<(), CoordinationError> {
        match self.live.get(&session) {
            Some(true) => Ok(()),
            _ => Err(CoordinationError::SessionLost),
        }
    }

    fn fire(&mut self, path: &str, event: WatchEvent) {
        let (hit, kept): (Vec<Watch>, Vec<Watch>) =
            self.watches.drain(..).partition(|w| w.path == path);
        self.watches = kept;
        for w in hit {
            let _ = w.tx.send(event.clone());
        }
    }

    fn remove(&mut self, path: &str) {
        if self.nodes.remove(path).is_some() {
            self.fire(path, WatchEvent::Deleted(path.to_string()));
        }
    }

    fn expire(&mut self, session: u64) {
        if let Some(live) = self.live.get_mut(&session) {
            *live = false;
        }
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == Some(session))
            .map(|(p, _)| p.clone())
            .collect();
        for path in owned {
            self.remove(&path);
        }
        let (mine, others): (Vec<Watch>, Vec<Watch>) =
            self.watches.drain(..).partition(|w| w.session == session);
        self.watches = others;
        for w in mine {
            let _ = w.tx.send(WatchEvent::SessionClosed);
        }
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// Coordination service living inside the process.
#[derive(Clone, Default)]
pub struct InMemoryCoordinator {
    state: Arc<Mutex<CoordState>>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ends `session` as if it had timed out.
    pub fn expire_session(&self, session: u64) {
        self.state.lock().expire(session);
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn connect(&self) -> Result<Arc<dyn CoordinationSession>, CoordinationError> {
        let mut state = self.state.lock();
        state.next_session += 1;
        let id = state.next_session;
        state.live.insert(id, true);
        debug!(session = id, "coordination session opened");
        Ok(Arc::new(InMemorySession {
            id,
            state: self.state.clone(),
        }))
    }
}

/// Session on an [`InMemoryCoordinator`].
pub struct InMemorySession {
    id: u64,
    state: Arc<Mutex<CoordState>>,
}

#[async_trait]
impl CoordinationSession for InMemorySession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String, CoordinationError> {
        let mut state = self.state.lock();
        state.check(self.id)?;

        let parent = parent_of(path);
        if parent != "/" && !state.nodes.contains_key(parent) {
            return Err(CoordinationError::NoParent(path.to_string()));
        }

        let actual = match mode {
            CreateMode::EphemeralSequential => {
                let seq = state.sequences.entry(parent.to_string()).or_insert(0);
                let actual = format!("{}{:010}", path, seq);
                *seq += 1;
                actual
            }
            _ => path.to_string(),
        };
        if state.nodes.contains_key(&actual) {
            return Err(CoordinationError::NodeExists(actual));
        }

        let owner = match mode {
            CreateMode::Persistent => None,
            _ => Some(self.id),
        };
        state.nodes.insert(
            actual.clone(),
            CoordNode {
                data: data.to_vec(),
                owner,
            },
        );
        Ok(actual)
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordinationError> {
        let state = self.state.lock();
        state.check(self.id)?;
        Ok(state.nodes.contains_key(path))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        let state = self.state.lock();
        state.check(self.id)?;
        if !state.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        Ok(state
            .nodes
            .keys()
            .filter(|p| parent_of(p) == path)
            .filter_map(|p| p.rsplit('/').next().map(String::from))
            .collect())
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>, CoordinationError> {
        let state = self.state.lock();
        state.check(self.id)?;
        state
            .nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError> {
        let mut state = self.state.lock();
        state.check(self.id)?;
        match state.nodes.get_mut(path) {
            Some(node) => node.data = data.to_vec(),
            None => return Err(CoordinationError::NoNode(path.to_string())),
        }
        state.fire(path, WatchEvent::DataChanged(path.to_string()));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        let mut state = self.state.lock();
        state.check(self.id)?;
        if !state.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        state.remove(path);
        Ok(())
    }

    async fn watch(&self, path: &str) -> Result<oneshot::Receiver<WatchEvent>, CoordinationError> {
        let mut state = self.state.lock();
        state.check(self.id)?;
        if !state.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        state.watches.push(Watch {
            path: path.to_string(),
            session: self.id,
            tx,
        });
        Ok(rx)
    }

    async fn close(&self) {
        self.state.lock().expire(self.id);
    }
}

/// Receives election outcomes.
pub trait ElectionListener: Send + Sync {
    /// This process became leader.
    fn leadership_gained(&self);

    /// The published master id changed.
    fn master_changed(&self, master: Option<String>);

    /// Fresh listing of the registered data nodes.
    fn data_nodes_changed(&self, nodes: Vec<String>);
}

/// Who is master, as seen by this process.
#[derive(Debug, Default)]
pub struct LeadershipState {
    master: AtomicBool,
    master_hostname: RwLock<Option<String>>,
    data_nodes: RwLock<BTreeSet<Node>>,
}

impl LeadershipState {
    pub fn is_master(&self) -> bool {
        self.master.load(Ordering::SeqCst)
    }

    pub fn set_master(&self, master: bool) {
        let was = self.master.swap(master, Ordering::SeqCst);
        if was != master {
            info!(master, "leadership changed");
        }
    }

    pub fn master_hostname(&self) -> Option<String> {
        self.master_hostname.read().clone()
    }

    pub fn set_master_hostname(&self, hostname: Option<String>) {
        *self.master_hostname.write() = hostname;
    }

    /// Nodes registered with the coordination service. Empty without one.
    pub fn data_nodes(&self) -> BTreeSet<Node> {
        self.data_nodes.read().clone()
    }

    pub fn set_data_nodes<I, S>(&self, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let nodes: BTreeSet<Node> = nodes.into_iter().map(Node::new).collect();
        let mut current = self.data_nodes.write();
        if *current != nodes {
            debug!(count = nodes.len(), "data nodes changed");
            *current = nodes;
        }
    }

    /// Master hostname, or [`UNKNOWN_MASTER`].
    pub fn master_label(&self) -> String {
        self.master_hostname().unwrap_or_else(|| UNKNOWN_MASTER.to_string())
    }
}

impl ElectionListener for LeadershipState {
    fn leadership_gained(&self) {
        self.set_master(true);
    }

    fn master_changed(&self, master: Option<String>) {
        debug!(?master, "master id changed");
        self.set_master_hostname(master);
    }

    fn data_nodes_changed(&self, nodes: Vec<String>) {
        self.set_data_nodes(nodes);
    }
}

fn sequence_of(candidate: &str) -> u64 {
    candidate
        .strip_prefix(CANDIDATE_PREFIX)
        .and_then(|s| s.parse().ok())
        .unwrap_or(u64::MAX)
}

async fn ensure_node(session: &dyn CoordinationSession, path: &str) -> Result<(), CoordinationError> {
    match session.create(path, &[], CreateMode::Persistent).await {
        Ok(_) | Err(CoordinationError::NodeExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// One candidacy on one coordination session.
pub struct LeaderElector {
    session: Arc<dyn CoordinationSession>,
    host_id: String,
    candidate: String,
}

impl LeaderElector {
    /// Creates the roots if needed, registers this process as data node and
    /// as candidate.
    pub async fn start(
        session: Arc<dyn CoordinationSession>,
        host_id: &str,
        data_node: bool,
    ) -> Result<Self, CoordinationError> {
        for root in [ROOT, ELECTION_ROOT, MASTER_ID, DATA_NODES_ROOT] {
            ensure_node(session.as_ref(), root).await?;
        }
        if data_node {
            let path = format!("{}/{}", DATA_NODES_ROOT, host_id);
            match session.create(&path, host_id.as_bytes(), CreateMode::Ephemeral).await {
                Ok(_) | Err(CoordinationError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let candidate = session
            .create(
                &format!("{}/{}", ELECTION_ROOT, CANDIDATE_PREFIX),
                host_id.as_bytes(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        info!(candidate = %candidate, "registered election candidate");

        Ok(Self {
            session,
            host_id: host_id.to_string(),
            candidate,
        })
    }

    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    /// Published master id.
    pub async fn current_master(&self) -> Result<Option<String>, CoordinationError> {
        let data = self.session.get_data(MASTER_ID).await?;
        let id = String::from_utf8_lossy(&data).trim().to_string();
        Ok(if id.is_empty() { None } else { Some(id) })
    }

    /// Data nodes currently registered.
    pub async fn data_nodes(&self) -> Result<Vec<String>, CoordinationError> {
        let mut nodes = self.session.children(DATA_NODES_ROOT).await?;
        nodes.sort();
        Ok(nodes)
    }

    /// Runs the candidacy until `cancel` fires or the session ends.
    ///
    /// Session loss is returned as an error; the caller retries from a new
    /// session.
    pub async fn run(
        &self,
        listener: &dyn ElectionListener,
        cancel: &CancellationToken,
    ) -> Result<(), CoordinationError> {
        listener.master_changed(self.current_master().await?);
        let mut master_watch = self.session.watch(MASTER_ID).await?;
        let mut refresh = tokio::time::interval(DATA_NODES_REFRESH);

        loop {
            let predecessor = match self.attempt().await? {
                Some(p) => p,
                None => {
                    info!(host = %self.host_id, "leadership gained");
                    listener.leadership_gained();
                    self.session.set_data(MASTER_ID, self.host_id.as_bytes()).await?;
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            _ = refresh.tick() => listener.data_nodes_changed(self.data_nodes().await?),
                            ev = &mut master_watch => {
                                self.on_master_event(ev, listener).await?;
                                master_watch = self.session.watch(MASTER_ID).await?;
                            }
                        }
                    }
                }
            };

            let path = format!("{}/{}", ELECTION_ROOT, predecessor);
            let mut pred_watch = match self.session.watch(&path).await {
                Ok(rx) => rx,
                // gone between listing and watching
                Err(CoordinationError::NoNode(_)) => continue,
                Err(e) => return Err(e),
            };
            debug!(watching = %path, "waiting for predecessor");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = refresh.tick() => listener.data_nodes_changed(self.data_nodes().await?),
                    ev = &mut pred_watch => match ev {
                        Ok(WatchEvent::Deleted(_)) | Ok(WatchEvent::DataChanged(_)) => break,
                        _ => return Err(CoordinationError::SessionLost),
                    },
                    ev = &mut master_watch => {
                        self.on_master_event(ev, listener).await?;
                        master_watch = self.session.watch(MASTER_ID).await?;
                    }
                }
            }
        }
    }

    /// `None` when this candidate has the lowest sequence, otherwise the
    /// name of the candidate just before it.
    async fn attempt(&self) -> Result<Option<String>, CoordinationError> {
        let mut candidates: Vec<String> = self
            .session
            .children(ELECTION_ROOT)
            .await?
            .into_iter()
            .filter(|c| c.starts_with(CANDIDATE_PREFIX))
            .collect();
        candidates.sort_by_key(|c| sequence_of(c));

        let own = self.candidate.rsplit('/').next().unwrap_or_default();
        let position = candidates
            .iter()
            .position(|c| c == own)
            .ok_or_else(|| CoordinationError::NoNode(self.candidate.clone()))?;
        Ok(match position {
            0 => None,
            p => Some(candidates[p - 1].clone()),
        })
    }

    async fn on_master_event(
        &self,
        event: Result<WatchEvent, oneshot::error::RecvError>,
        listener: &dyn ElectionListener,
    ) -> Result<(), CoordinationError> {
        match event {
            Ok(WatchEvent::DataChanged(_)) => {
                listener.master_changed(self.current_master().await?);
                Ok(())
            }
            Ok(WatchEvent::Deleted(path)) => Err(CoordinationError::NoNode(path)),
            _ => Err(CoordinationError::SessionLost),
        }
    }
}

/// Drives the election for the lifetime of the process.
pub struct ElectionService {
    config: ElectionConfig,
    hostname: String,
    state: Arc<LeadershipState>,
    coordinator: Option<Arc<dyn Coordinator>>,
}

impl ElectionService {
    pub fn new(
        config: ElectionConfig,
        hostname: impl Into<String>,
        state: Arc<LeadershipState>,
        coordinator: Option<Arc<dyn Coordinator>>,
    ) -> Self {
        Self {
            config,
            hostname: hostname.into(),
            state,
            coordinator,
        }
    }

    /// Runs until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        if let Some(forced) = self.config.master {
            info!(master = forced, "election disabled, role forced by configuration");
            self.state.set_master(forced);
            self.state
                .set_master_hostname(if forced { Some(self.hostname.clone()) } else { None });
            cancel.cancelled().await;
            return;
        }

        let Some(coordinator) = self.coordinator.clone() else {
            info!("no coordinator configured, running standalone master");
            self.state.set_master(true);
            self.state.set_master_hostname(Some(self.hostname.clone()));
            cancel.cancelled().await;
            return;
        };

        let backoff = Duration::from_secs(self.config.retry_backoff_secs);
        while !cancel.is_cancelled() {
            match self.run_once(coordinator.as_ref(), &cancel).await {
                Ok(()) => break,
                Err(e) => {
                    warn!("election session ended: {}", e);
                    self.state.set_master(false);
                    let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff + Duration::from_millis(jitter)) => {}
                    }
                }
            }
        }
        self.state.set_master(false);
    }

    async fn run_once(&self, coordinator: &dyn Coordinator, cancel: &CancellationToken) -> Result<(), CoordinationError> {
        let session = coordinator.connect().await?;
        let result = match LeaderElector::start(session.clone(), &self.hostname, self.config.data_node).await {
            Ok(elector) => elector.run(self.state.as_ref(), cancel).await,
            Err(e) => Err(e),
        };
        self.state.set_master(false);
        session.close().await;
        result
    }
}
