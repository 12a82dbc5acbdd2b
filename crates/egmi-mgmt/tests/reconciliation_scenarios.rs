//! End-to-end reconciliation scenarios against a simulated cluster.
//!
//! Each scenario breaks the cluster in one way and runs full management
//! cycles until the cluster converges back to a healthy state.

use egmi_mgmt::config::ProblemTimeouts;
use egmi_mgmt::settings::{DISCOVERED_NODES, STATIC_NODES};
use egmi_mgmt::{
    BrickId, EgmiConfig, LeadershipState, ManagementService, Node, NodeState, Operation, SimulatedCluster, Volume,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::assert_ok;

const MAX_CYCLES: usize = 4;

fn cluster(nodes: &[&str]) -> Arc<SimulatedCluster> {
    let sim = Arc::new(SimulatedCluster::new());
    for n in nodes {
        sim.add_node(n);
    }
    sim
}

const NO_GRACE: ProblemTimeouts = ProblemTimeouts {
    node_down_secs: 0,
    node_down_removal_secs: 0,
    brick_offline_secs: 0,
    node_corrupted_secs: 0,
    no_volume_secs: 0,
};

fn service(sim: &Arc<SimulatedCluster>, dir: &Path, nodes: &[&str], volumes: &[&str]) -> ManagementService {
    service_with(sim, dir, nodes, volumes, NO_GRACE)
}

fn service_with(
    sim: &Arc<SimulatedCluster>,
    dir: &Path,
    nodes: &[&str],
    volumes: &[&str],
    timeouts: ProblemTimeouts,
) -> ManagementService {
    let mut config = EgmiConfig::default();
    config.hostname = nodes[0].to_string();
    config.config_storage_path = dir.to_path_buf();
    config.predefined_nodes = nodes.iter().map(|n| n.to_string()).collect();
    config.target_volumes = volumes.iter().map(|v| v.to_string()).collect();
    config.problem_timeouts = timeouts;
    let leadership = Arc::new(LeadershipState::default());
    leadership.set_master(true);
    ManagementService::new(config, sim.clone(), leadership).with_peer_poll_interval(Duration::from_millis(1))
}

fn brick(node: &str, volume: &str) -> BrickId {
    BrickId::new(Node::new(node), format!("/var/lib/gluster/volume_bricks/{}", volume))
}

fn brick_nodes(sim: &SimulatedCluster, volume: &str) -> BTreeSet<String> {
    sim.volume_bricks(volume)
        .unwrap_or_default()
        .iter()
        .map(|b| b.node.to_string())
        .collect()
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Runs cycles until `done` holds or the cycle budget is spent.
async fn converge(service: &ManagementService, done: impl Fn() -> bool) {
    for _ in 0..MAX_CYCLES {
        assert_ok!(service.run_cycle().await);
        if done() {
            return;
        }
    }
    panic!("cluster did not converge in {} cycles", MAX_CYCLES);
}

#[tokio::test]
async fn test_fresh_cluster_gets_managed_volume() {
    let nodes = ["n1", "n2", "n3", "n4", "n5"];
    let sim = cluster(&nodes);
    sim.connect_all(&nodes);
    let dir = TempDir::new().unwrap();
    let service = service(&sim, dir.path(), &nodes, &["logs", "spark"]);

    converge(&service, || {
        sim.volume_status("logs").as_deref() == Some("OK") && sim.volume_status("spark").as_deref() == Some("OK")
    })
    .await;

    // 5 nodes: 4 bricks as 2 shards of 2 replicas
    assert_eq!(sim.volume_bricks("logs").unwrap().len(), 4);
    assert_eq!(sim.volume_replicas("logs"), Some(2));
    // the second volume lands on the node left idle by the first
    assert!(brick_nodes(&sim, "spark").contains("n5"));

    let report = service.run_cycle().await.unwrap().unwrap();
    assert_eq!(report.status.volume(&Volume::new("logs")).unwrap().status, "OK");
    assert_eq!(report.status.volume(&Volume::new("spark")).unwrap().status, "OK");
    assert_eq!(report.status.healthy_nodes().len(), 5);
}

#[tokio::test]
async fn test_missing_replica_is_added() {
    let nodes = ["n1", "n2", "n3"];
    let sim = cluster(&nodes);
    sim.connect_all(&nodes);
    sim.add_volume("logs", 2, &[brick("n1", "logs"), brick("n2", "logs")]);
    let dir = TempDir::new().unwrap();
    let service = service(&sim, dir.path(), &nodes, &["logs"]);

    let report = service.run_cycle().await.unwrap().unwrap();
    assert_eq!(
        report.status.volume(&Volume::new("logs")).unwrap().status,
        "MISSING 1 BRICKS"
    );
    assert_eq!(sim.volume_replicas("logs"), Some(3));
    assert_eq!(brick_nodes(&sim, "logs"), set(&["n1", "n2", "n3"]));

    let report = service.run_cycle().await.unwrap().unwrap();
    assert_eq!(report.status.volume(&Volume::new("logs")).unwrap().status, "OK");
    assert!(service.tracked_problems().await.is_empty());
}

#[tokio::test]
async fn test_brick_of_down_node_moves_to_free_node() {
    let nodes = ["n1", "n2", "n3", "n4"];
    let sim = cluster(&nodes);
    sim.connect_all(&nodes);
    sim.add_volume("logs", 3, &[brick("n1", "logs"), brick("n2", "logs"), brick("n3", "logs")]);
    let dir = TempDir::new().unwrap();
    let service = service(&sim, dir.path(), &nodes, &["logs"]);
    sim.set_node_up("n3", false);

    converge(&service, || brick_nodes(&sim, "logs") == set(&["n1", "n2", "n4"])).await;
    assert!(sim.executed().iter().any(|(_, op)| matches!(
        op,
        Operation::VolumeReplaceBrick { from, to, .. } if from.node.address() == "n3" && to.node.address() == "n4"
    )));

    let report = service.run_cycle().await.unwrap().unwrap();
    assert_eq!(report.status.volume(&Volume::new("logs")).unwrap().status, "OK");
    assert_eq!(
        report.status.node_state(&Node::new("n3")),
        Some(NodeState::Ko)
    );
}

#[tokio::test]
async fn test_minority_partition_joins_majority() {
    let nodes = ["a", "b", "c", "d", "e"];
    let sim = cluster(&nodes);
    sim.connect_all(&["a", "b", "c"]);
    sim.connect_all(&["d", "e"]);
    let dir = TempDir::new().unwrap();
    let service = service(&sim, dir.path(), &nodes, &[]);

    let report = service.run_cycle().await.unwrap().unwrap();
    for n in ["a", "b", "c"] {
        assert_eq!(report.status.node_state(&Node::new(n)), Some(NodeState::Ok));
    }
    for n in ["d", "e"] {
        assert_eq!(
            report.status.node_state(&Node::new(n)),
            Some(NodeState::Partitioned)
        );
    }
    assert!(report.outcome.zero_priority_solved);

    converge(&service, || {
        let pool = sim.peers("a");
        pool.contains(&Node::new("d")) && pool.contains(&Node::new("e"))
    })
    .await;

    let report = service.run_cycle().await.unwrap().unwrap();
    assert_eq!(report.status.healthy_nodes().len(), 5);
}

#[tokio::test]
async fn test_one_sided_link_is_repaired() {
    let nodes = ["a", "b", "c"];
    let sim = cluster(&nodes);
    sim.connect_all(&nodes);
    sim.unlink("c", "b");
    let dir = TempDir::new().unwrap();
    let service = service(&sim, dir.path(), &nodes, &[]);

    let report = service.run_cycle().await.unwrap().unwrap();
    assert_eq!(
        report.status.node_state(&Node::new("c")),
        Some(NodeState::Inconsistent)
    );
    assert_eq!(report.outcome.solved, vec!["NODE_INCONSISTENT-c-b".to_string()]);
    assert!(sim.peers("c").contains(&Node::new("b")));

    let report = service.run_cycle().await.unwrap().unwrap();
    assert_eq!(report.status.healthy_nodes().len(), 3);
    assert!(service.tracked_problems().await.is_empty());
}

#[tokio::test]
async fn test_slave_leaves_cluster_untouched() {
    let nodes = ["n1", "n2"];
    let sim = cluster(&nodes);
    sim.connect_all(&nodes);
    let dir = TempDir::new().unwrap();
    let service = service(&sim, dir.path(), &nodes, &["logs"]);
    service.leadership().set_master(false);

    for _ in 0..MAX_CYCLES {
        assert!(service.run_cycle().await.unwrap().is_none());
    }
    assert!(sim.executed().is_empty());
    assert!(sim.volume_bricks("logs").is_none());
}

#[tokio::test]
async fn test_down_node_owning_bricks_stays_in_pool() {
    let nodes = ["n1", "n2"];
    let sim = cluster(&nodes);
    sim.connect_all(&nodes);
    // distributed only: the brick on n2 cannot be relocated
    sim.add_volume("logs", 1, &[brick("n1", "logs"), brick("n2", "logs")]);
    let dir = TempDir::new().unwrap();
    let service = service(&sim, dir.path(), &nodes, &[]);
    sim.set_node_up("n2", false);

    for _ in 0..2 {
        let report = service.run_cycle().await.unwrap().unwrap();
        assert!(report.status.volume(&Volume::new("logs")).unwrap().status.contains("n2 DOWN"));
    }
    assert!(!sim
        .executed()
        .iter()
        .any(|(_, op)| matches!(op, Operation::PeerDetach { .. })));
    assert!(sim.peers("n1").contains(&Node::new("n2")));
    assert_eq!(brick_nodes(&sim, "logs"), set(&["n1", "n2"]));

    let tracked = service.tracked_problems().await;
    assert!(tracked.contains(&"NODE_DOWN-logs-n2".to_string()));
    assert!(!tracked.contains(&"NODE_DOWN-REMOVAL-n2".to_string()));
}

#[tokio::test]
async fn test_transient_volume_listing_failure_is_not_reset() {
    let nodes = ["n1", "n2"];
    let sim = cluster(&nodes);
    sim.connect_all(&nodes);
    sim.set_volume_error("n2", true);
    let dir = TempDir::new().unwrap();
    let timeouts = ProblemTimeouts {
        node_corrupted_secs: 3600,
        ..NO_GRACE
    };
    let service = service_with(&sim, dir.path(), &nodes, &[], timeouts);

    let report = service.run_cycle().await.unwrap().unwrap();
    assert_eq!(
        report.status.node_state(&Node::new("n2")),
        Some(NodeState::Corrupted)
    );
    assert!(sim.executed().is_empty());
    assert_eq!(service.tracked_problems().await, vec!["NODE_CORRUPTED-n2".to_string()]);

    sim.set_volume_error("n2", false);
    let report = service.run_cycle().await.unwrap().unwrap();
    assert_eq!(report.status.node_state(&Node::new("n2")), Some(NodeState::Ok));
    assert!(sim.executed().is_empty());
    assert!(service.tracked_problems().await.is_empty());
    assert!(sim.peers("n2").contains(&Node::new("n1")));
}

#[tokio::test]
async fn test_added_node_is_forgotten_once_gone() {
    let nodes = ["n1", "n2"];
    let sim = cluster(&["n1", "n2", "n3"]);
    sim.connect_all(&nodes);
    let dir = TempDir::new().unwrap();
    let service = service(&sim, dir.path(), &nodes, &[]);
    assert_ok!(service.run_cycle().await);

    assert_ok!(service.add_node("n3").await);
    let report = service.run_cycle().await.unwrap().unwrap();
    assert_eq!(report.status.node_state(&Node::new("n3")), Some(NodeState::Ok));
    assert!(service.settings().list(DISCOVERED_NODES).unwrap().contains("n3"));

    sim.set_node_up("n3", false);
    converge(&service, || {
        service
            .get_system_status()
            .map_or(false, |s| s.node(&Node::new("n3")).is_none())
    })
    .await;
    assert!(!sim.peers("n1").contains(&Node::new("n3")));
    assert!(!service.settings().list(DISCOVERED_NODES).unwrap().contains("n3"));
    assert!(service.settings().list(STATIC_NODES).unwrap().is_empty());

    // stays gone
    let report = service.run_cycle().await.unwrap().unwrap();
    assert!(report.status.node(&Node::new("n3")).is_none());
    assert!(service.tracked_problems().await.is_empty());
}
