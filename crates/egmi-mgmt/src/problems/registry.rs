use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CommandContext, Problem};
use crate::error::Resolution;
use crate::system_status::SystemStatus;

/// A problem with the time it was first detected.
#[derive(Debug, Clone)]
pub struct ProblemRecord {
    pub problem: Problem,
    pub detected_at: DateTime<Utc>,
}

/// What a resolution pass achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionOutcome {
    /// A priority 0 problem was solved; the next cycle should come sooner.
    pub zero_priority_solved: bool,
    /// Ids of solved problems, in resolution order.
    pub solved: Vec<String>,
    /// Reason of a stop signal, if one aborted the pass.
    pub stopped: Option<String>,
    /// Leadership was lost during the pass and the registry was cleared.
    pub leadership_lost: bool,
}

/// Problems currently tracked, keyed by id.
#[derive(Debug, Default)]
pub struct ProblemRegistry {
    problems: BTreeMap<String, ProblemRecord>,
}

impl ProblemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `problem` unless one with the same id is tracked already.
    /// Returns whether it was new.
    pub fn add(&mut self, problem: Problem) -> bool {
        self.add_at(problem, Utc::now())
    }

    pub fn add_at(&mut self, problem: Problem, detected_at: DateTime<Utc>) -> bool {
        let id = problem.id();
        if self.problems.contains_key(&id) {
            return false;
        }
        debug!(problem = %id, "problem registered");
        self.problems.insert(id, ProblemRecord { problem, detected_at });
        true
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.problems.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.problems.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.problems.clear();
    }

    /// Drops every problem `status` no longer shows.
    pub fn recognize(&mut self, status: &SystemStatus) {
        self.problems.retain(|id, record| {
            let still = record.problem.recognize(status);
            if !still {
                debug!(problem = %id, "problem no longer recognized");
            }
            still
        });
    }

    /// Counts per label, e.g. `1 Brick Offline, 2 Vol. Node Down`.
    pub fn summary(&self) -> String {
        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for record in self.problems.values() {
            *counts.entry(record.problem.label()).or_default() += 1;
        }
        counts
            .into_iter()
            .map(|(label, count)| format!("{} {}", count, label))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Tracked records, most urgent first; ties keep id order.
    pub fn resolution_order(&self) -> Vec<ProblemRecord> {
        let mut records: Vec<ProblemRecord> = self.problems.values().cloned().collect();
        records.sort_by_key(|r| r.problem.priority());
        records
    }

    /// Attempts every tracked problem once, most urgent first.
    ///
    /// Solved problems are dropped. A skip keeps the problem for the next
    /// cycle. A stop aborts the pass since the cluster changed under it.
    pub async fn resolution_iteration(&mut self, ctx: &CommandContext) -> ResolutionOutcome {
        let mut outcome = ResolutionOutcome::default();

        for record in self.resolution_order() {
            if !ctx.is_leader() {
                warn!("leadership lost, dropping {} tracked problems", self.problems.len());
                self.clear();
                outcome.leadership_lost = true;
                return outcome;
            }

            let id = record.problem.id();
            let age = (Utc::now() - record.detected_at)
                .to_std()
                .unwrap_or(Duration::ZERO);

            match record.problem.solve(ctx, age).await {
                Ok(true) => {
                    info!(problem = %id, "problem solved");
                    if record.problem.priority() == 0 {
                        outcome.zero_priority_solved = true;
                    }
                    self.problems.remove(&id);
                    outcome.solved.push(id);
                }
                Ok(false) => {}
                Err(Resolution::Skip(reason)) => {
                    info!(problem = %id, "skipped: {}", reason);
                }
                Err(Resolution::Stop(reason)) => {
                    ctx.error(format!("!! Resolution of {} stopped: {}", id, reason));
                    outcome.stopped = Some(reason);
                    return outcome;
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problems::tests::{brick, context};
    use crate::problems::{
        MissingBrick, NoVolume, NodeDown, NodeInconsistent, NodePartitioned, VolumeNotStarted, WrongOption,
    };
    use crate::remote::Operation;
    use crate::remote_sim::SimulatedCluster;
    use crate::system_status::{NodeEntry, NodeState};
    use crate::types::{Node, Volume};
    use std::sync::Arc;

    #[test]
    fn test_add_is_deduplicated() {
        let mut registry = ProblemRegistry::new();
        for _ in 0..3 {
            registry.add(NoVolume::new(Volume::new("logs")).into());
        }
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("NO_VOLUME-logs"));
    }

    #[test]
    fn test_first_detection_time_is_kept() {
        let mut registry = ProblemRegistry::new();
        let early = Utc::now() - chrono::Duration::hours(1);
        assert!(registry.add_at(NoVolume::new(Volume::new("logs")).into(), early));
        assert!(!registry.add(NoVolume::new(Volume::new("logs")).into()));
        assert_eq!(registry.resolution_order()[0].detected_at, early);
    }

    #[test]
    fn test_recognize_drops_gone_problems() {
        let mut registry = ProblemRegistry::new();
        registry.add(NodePartitioned::new(Node::new("n1")).into());
        // n2 is absent from the node table, so it is still recognized
        registry.add(NodeDown::new(Volume::new("logs"), Node::new("n2")).into());

        let status = SystemStatus {
            hostname: "n1".to_string(),
            nodes: vec![
                NodeEntry {
                    host: Node::new("n1"),
                    status: NodeState::Ok,
                    volumes: Some(String::new()),
                    nbr_bricks: Some(0),
                },
            ],
            volumes: Vec::new(),
        };
        registry.recognize(&status);
        assert_eq!(registry.ids(), vec!["NODE_DOWN-logs-n2".to_string()]);
    }

    #[test]
    fn test_order_and_summary() {
        let mut registry = ProblemRegistry::new();
        registry.add(WrongOption::new(Volume::new("logs"), "k", None, "v").into());
        registry.add(MissingBrick::new(Volume::new("logs"), 3, 1).into());
        registry.add(NodePartitioned::new(Node::new("n1")).into());
        registry.add(VolumeNotStarted::new(Volume::new("data")).into());
        registry.add(VolumeNotStarted::new(Volume::new("logs")).into());

        let order: Vec<u8> = registry
            .resolution_order()
            .iter()
            .map(|r| r.problem.priority())
            .collect();
        assert_eq!(order, vec![0, 4, 4, 7, 8]);
        assert_eq!(
            registry.summary(),
            "1 Missing Brick, 1 Node Partitioned, 2 Volume Down, 1 Wrong Option"
        );
    }

    #[tokio::test]
    async fn test_iteration_solves_and_drops() {
        let sim = Arc::new(SimulatedCluster::new());
        sim.add_node("n1");
        sim.add_volume("logs", 1, &[brick("n1", "logs")]);
        sim.set_volume_status("logs", crate::node_status::VOL_NOT_STARTED);
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(&sim, dir.path(), &["n1"]);

        let mut registry = ProblemRegistry::new();
        registry.add(VolumeNotStarted::new(Volume::new("logs")).into());
        let outcome = registry.resolution_iteration(&ctx).await;
        assert_eq!(outcome.solved, vec!["VOLUME_DOWN-logs".to_string()]);
        assert!(!outcome.zero_priority_solved);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_iteration_solves_in_priority_order() {
        let sim = Arc::new(SimulatedCluster::new());
        for n in ["a", "b", "c"] {
            sim.add_node(n);
        }
        sim.connect_all(&["a", "b", "c"]);
        sim.unlink("c", "b");
        sim.add_volume("logs", 1, &[brick("a", "logs")]);
        sim.set_volume_status("logs", crate::node_status::VOL_NOT_STARTED);
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(&sim, dir.path(), &["a", "b", "c"]);

        // registered lowest urgency first
        let mut registry = ProblemRegistry::new();
        registry.add(WrongOption::new(Volume::new("logs"), "performance.quick-read", None, "off").into());
        registry.add(VolumeNotStarted::new(Volume::new("logs")).into());
        registry.add(NodeInconsistent::new(Node::new("c"), Node::new("b")).into());

        let outcome = registry.resolution_iteration(&ctx).await;
        assert_eq!(
            outcome.solved,
            vec![
                "NODE_INCONSISTENT-c-b".to_string(),
                "VOLUME_DOWN-logs".to_string(),
                "WRONG_OPTION-logs-performance.quick-read-off".to_string(),
            ]
        );
        let ops: Vec<&str> = sim
            .executed()
            .iter()
            .map(|(_, op)| match op {
                Operation::PeerDetach { .. } => "peer detach",
                Operation::PeerProbe { .. } => "peer probe",
                Operation::VolumeStart { .. } => "volume start",
                Operation::VolumeSet { .. } => "volume set",
                _ => "other",
            })
            .collect();
        assert_eq!(ops, vec!["peer detach", "peer probe", "volume start", "volume set"]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stop_aborts_pass() {
        let sim = Arc::new(SimulatedCluster::new());
        sim.add_node("n1");
        sim.add_volume("logs", 1, &[brick("n1", "logs")]);
        sim.add_volume("data", 1, &[brick("n1", "data")]);
        sim.set_volume_status("logs", crate::node_status::VOL_NOT_STARTED);
        sim.set_volume_status("data", crate::node_status::VOL_NOT_STARTED);
        sim.fail_operation("volume start");
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(&sim, dir.path(), &["n1"]);

        let mut registry = ProblemRegistry::new();
        registry.add(VolumeNotStarted::new(Volume::new("logs")).into());
        registry.add(VolumeNotStarted::new(Volume::new("data")).into());
        let outcome = registry.resolution_iteration(&ctx).await;
        assert!(outcome.stopped.is_some());
        assert_eq!(registry.len(), 2);
        assert_eq!(sim.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_leadership_loss_clears() {
        let sim = Arc::new(SimulatedCluster::new());
        sim.add_node("n1");
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(&sim, dir.path(), &["n1"]);
        ctx.leadership.set_master(false);

        let mut registry = ProblemRegistry::new();
        registry.add(NodePartitioned::new(Node::new("n1")).into());
        let outcome = registry.resolution_iteration(&ctx).await;
        assert!(outcome.leadership_lost);
        assert!(registry.is_empty());
        assert!(sim.executed().is_empty());
    }
}
