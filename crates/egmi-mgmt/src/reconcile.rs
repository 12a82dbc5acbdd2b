//! Reconciliation loop.
//!
//! Every cycle collects the status of all known nodes, builds the
//! [`SystemStatus`], registers and re-validates problems and then attempts
//! to solve them. Only the elected master reconciles. Cycles never overlap:
//! the whole sequence runs under the cluster-mutation lock which also guards
//! user actions.

use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::aggregator::StatusAggregator;
use crate::config::EgmiConfig;
use crate::election::LeadershipState;
use crate::error::{MgmtError, MgmtResult};
use crate::layout::RuntimeLayout;
use crate::messages::MessageLog;
use crate::problems::{CommandContext, ProblemRegistry, ResolutionOutcome};
use crate::remote::{collect_all, RemoteManager};
use crate::settings::RuntimeSettings;
use crate::system_status::SystemStatus;
use crate::types::Node;

/// Last published outcome of a cycle.
#[derive(Debug, Clone)]
pub enum StatusSnapshot {
    /// No cycle has completed yet.
    Initializing,
    /// The last cycle succeeded.
    Ready(Arc<SystemStatus>),
    /// The last cycle failed with this error.
    Failed(String),
}

/// What one cycle produced.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub status: Arc<SystemStatus>,
    pub outcome: ResolutionOutcome,
}

/// Delay before the next cycle. Shorter after a partition was healed so
/// the cluster converges faster.
pub fn next_delay(period: Duration, outcome: &ResolutionOutcome) -> Duration {
    if outcome.zero_priority_solved {
        period / 3
    } else {
        period
    }
}

/// The management service: owns the problem registry and the published
/// status.
pub struct ManagementService {
    pub(crate) config: Arc<EgmiConfig>,
    pub(crate) remote: Arc<dyn RemoteManager>,
    pub(crate) settings: Arc<RuntimeSettings>,
    pub(crate) messages: Arc<MessageLog>,
    pub(crate) leadership: Arc<LeadershipState>,
    pub(crate) context: CommandContext,
    pub(crate) aggregator: StatusAggregator,
    /// Cluster-mutation lock. Holds the tracked problems.
    pub(crate) cluster: tokio::sync::Mutex<ProblemRegistry>,
    snapshot: RwLock<StatusSnapshot>,
}

impl ManagementService {
    pub fn new(config: EgmiConfig, remote: Arc<dyn RemoteManager>, leadership: Arc<LeadershipState>) -> Self {
        let settings = Arc::new(RuntimeSettings::new(&config.config_storage_path));
        let messages = Arc::new(MessageLog::new(config.message_log_capacity));
        let context = CommandContext::new(
            &config,
            remote.clone(),
            settings.clone(),
            messages.clone(),
            leadership.clone(),
        );
        let aggregator =
            StatusAggregator::new(&config, settings.clone(), messages.clone()).with_data_nodes(leadership.clone());

        Self {
            config: Arc::new(config),
            remote,
            settings,
            messages,
            leadership,
            context,
            aggregator,
            cluster: tokio::sync::Mutex::new(ProblemRegistry::new()),
            snapshot: RwLock::new(StatusSnapshot::Initializing),
        }
    }

    /// Overrides the delay between peer pool polls after a probe.
    pub fn with_peer_poll_interval(mut self, interval: Duration) -> Self {
        self.context.peer_poll_interval = interval;
        self
    }

    pub fn config(&self) -> &EgmiConfig {
        &self.config
    }

    pub fn messages(&self) -> &Arc<MessageLog> {
        &self.messages
    }

    pub fn settings(&self) -> &Arc<RuntimeSettings> {
        &self.settings
    }

    pub fn leadership(&self) -> &Arc<LeadershipState> {
        &self.leadership
    }

    pub fn is_master(&self) -> bool {
        self.leadership.is_master()
    }

    pub fn master_hostname(&self) -> String {
        self.leadership.master_label()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot.read().clone()
    }

    /// Last computed status.
    pub fn get_system_status(&self) -> MgmtResult<Arc<SystemStatus>> {
        match &*self.snapshot.read() {
            StatusSnapshot::Initializing => Err(MgmtError::Initializing),
            StatusSnapshot::Ready(status) => Ok(status.clone()),
            StatusSnapshot::Failed(e) => Err(MgmtError::LastCycleFailed(e.clone())),
        }
    }

    /// Target layout of managed volumes for the current node set.
    pub fn target_layout(&self) -> RuntimeLayout {
        let known = self.aggregator.known_nodes().map(|n| n.len()).unwrap_or(0);
        self.aggregator.target_layout(known)
    }

    pub fn target_bricks(&self) -> usize {
        self.target_layout().bricks
    }

    pub fn target_replicas(&self) -> usize {
        self.target_layout().replicas
    }

    /// Problems currently tracked, ids only.
    pub async fn tracked_problems(&self) -> Vec<String> {
        self.cluster.lock().await.ids()
    }

    /// Runs one full cycle. Returns `None` when this process is not master.
    ///
    /// A failure is published in place of the status and returned.
    pub async fn run_cycle(&self) -> MgmtResult<Option<CycleReport>> {
        if !self.is_master() {
            info!("not updating status since this node is not master");
            return Ok(None);
        }

        let mut registry = self.cluster.lock().await;
        debug!("cluster lock acquired, updating system status");

        match self.cycle(&mut registry).await {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                error!("status update failed: {}", e);
                self.messages.error(format!("Status update failed: {}", e));
                *self.snapshot.write() = StatusSnapshot::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn cycle(&self, registry: &mut ProblemRegistry) -> MgmtResult<CycleReport> {
        debug!("collecting node statuses");
        let known = self.aggregator.known_nodes()?;
        let mut statuses = collect_all(self.remote.as_ref(), &known).await;

        let discovered: BTreeSet<Node> = statuses
            .iter()
            .filter_map(|(node, status)| status.all_peers(node).ok())
            .flatten()
            .filter(|peer| !peer.is_localhost() && !known.contains(peer))
            .collect();
        if !discovered.is_empty() {
            debug!(count = discovered.len(), "collecting newly discovered peers");
            statuses.extend(collect_all(self.remote.as_ref(), &discovered).await);
        }

        debug!("detecting problems");
        let status = self
            .aggregator
            .build_system_status(&self.config.hostname, &statuses, registry)?;

        debug!("recognizing tracked problems");
        registry.recognize(&status);
        self.messages
            .info(format!("Status fetching completed. {}", registry.summary()));

        let status = Arc::new(status);
        *self.snapshot.write() = StatusSnapshot::Ready(status.clone());

        debug!(problems = registry.len(), "resolving problems");
        let mut ctx = self
            .context
            .with_nodes(status.node_list().into_iter().collect());
        ctx.configured_nodes = self.aggregator.managed_nodes();
        let outcome = registry.resolution_iteration(&ctx).await;

        Ok(CycleReport { status, outcome })
    }

    /// Self-rescheduling loop: the next cycle is planned only once the
    /// current one has completed.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.status_update_period();
        info!(?period, "reconciliation loop started");

        loop {
            let delay = match self.run_cycle().await {
                Ok(Some(report)) => next_delay(period, &report.outcome),
                _ => period,
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("reconciliation loop stopped");
    }
}
