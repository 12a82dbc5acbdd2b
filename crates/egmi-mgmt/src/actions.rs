//! User-triggered actions.
//!
//! Actions compete with the reconciliation loop for the cluster-mutation
//! lock and are reserved to the master.

use std::collections::BTreeSet;
use tracing::{error, info, warn};

use crate::error::{MgmtError, MgmtResult};
use crate::partition::active_nodes;
use crate::problems::{create_volume, force_delete_volume, CommandContext};
use crate::reconcile::ManagementService;
use crate::remote::Operation;
use crate::settings::DISCOVERED_VOLUMES;
use crate::types::{Node, Volume};

fn parse_name(name: &str, what: &str) -> MgmtResult<String> {
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(MgmtError::InvalidRequest(format!("invalid {} name '{}'", what, name)));
    }
    Ok(name.to_string())
}

impl ManagementService {
    fn ensure_master(&self) -> MgmtResult<()> {
        if self.is_master() {
            Ok(())
        } else {
            Err(MgmtError::NotMaster(self.master_hostname()))
        }
    }

    fn action_context(&self) -> CommandContext {
        let mut nodes: BTreeSet<Node> = self.aggregator.managed_nodes();
        if let Ok(status) = self.get_system_status() {
            nodes.extend(status.node_list());
        }
        let mut ctx = self.context.with_nodes(nodes);
        ctx.configured_nodes = self.aggregator.managed_nodes();
        ctx
    }

    /// First node of the last status other than `except`.
    fn last_status_node(&self, except: Option<&Node>) -> MgmtResult<Node> {
        self.get_system_status()?
            .node_list()
            .into_iter()
            .find(|n| Some(n) != except)
            .ok_or(MgmtError::NoActiveNode)
    }

    /// Probes `node` into the pool from a node of the last status. Peers
    /// reporting it make it part of the runtime nodes on the next cycle.
    pub async fn add_node(&self, node: &str) -> MgmtResult<()> {
        let node = Node::new(parse_name(node, "node")?);
        let _lock = self.cluster.lock().await;
        self.ensure_master()?;

        info!(%node, "adding node");
        self.messages.info(format!("Adding node {}", node));
        let ctx = self.action_context();
        let peer = self.last_status_node(Some(&node))?;

        ctx.execute_simple_operation(&Operation::PeerProbe { host: node.clone() }, &peer)
            .await?;
        Ok(())
    }

    /// Creates and starts `volume` over the least loaded nodes.
    pub async fn add_volume(&self, volume: &str) -> MgmtResult<()> {
        let volume = Volume::new(parse_name(volume, "volume")?);
        let _lock = self.cluster.lock().await;
        self.ensure_master()?;

        info!(%volume, "adding volume");
        self.messages.info(format!("Adding Volume {}", volume));
        let ctx = self.action_context();
        if !create_volume(&ctx, &volume).await? {
            return Err(MgmtError::Volume(volume, "no node available to host it".into()));
        }
        Ok(())
    }

    pub async fn start_volume(&self, volume: &str) -> MgmtResult<()> {
        let volume = Volume::new(parse_name(volume, "volume")?);
        let _lock = self.cluster.lock().await;
        self.ensure_master()?;

        self.messages.info(format!("Starting Volume {}", volume));
        let ctx = self.action_context();
        let node = self.last_status_node(None)?;
        ctx.execute_simple_operation(&Operation::VolumeStart { volume, force: false }, &node)
            .await?;
        Ok(())
    }

    pub async fn stop_volume(&self, volume: &str) -> MgmtResult<()> {
        let volume = Volume::new(parse_name(volume, "volume")?);
        let _lock = self.cluster.lock().await;
        self.ensure_master()?;

        self.messages.info(format!("Stopping Volume {}", volume));
        let ctx = self.action_context();
        let node = self.last_status_node(None)?;
        ctx.execute_simple_operation(&Operation::VolumeStop { volume, force: false }, &node)
            .await?;
        Ok(())
    }

    /// Force-stops `volume`, wipes its bricks, deletes it and forgets it.
    pub async fn delete_volume(&self, volume: &str) -> MgmtResult<()> {
        let volume = Volume::new(parse_name(volume, "volume")?);
        let _lock = self.cluster.lock().await;
        self.ensure_master()?;

        info!(%volume, "deleting volume");
        self.messages.info(format!("Deleting Volume {}", volume));
        let ctx = self.action_context();
        let statuses = ctx.fetch_statuses().await;
        let node = active_nodes(&statuses)
            .into_iter()
            .next()
            .ok_or(MgmtError::NoActiveNode)?;
        let brick_nodes = statuses
            .get(&node)
            .ok_or(MgmtError::NoActiveNode)?
            .volume_nodes(&node, &volume)?;

        self.messages.info(format!("  - Stopping Volume {}", volume));
        if let Err(e) = ctx
            .execute_simple_operation(
                &Operation::VolumeStop {
                    volume: volume.clone(),
                    force: true,
                },
                &node,
            )
            .await
        {
            warn!(%volume, "stop before delete failed, ignored: {}", e);
        }

        self.messages
            .info(format!("  - Force-removing bricks and deleting {}", volume));
        force_delete_volume(&ctx, &volume, &node, &brick_nodes, false)
            .await
            .map_err(|e| {
                error!(%volume, "delete failed: {}", e);
                e
            })?;

        self.settings.remove_from_list(DISCOVERED_VOLUMES, volume.name())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EgmiConfig;
    use crate::election::LeadershipState;
    use crate::remote_sim::SimulatedCluster;
    use crate::settings::STATIC_NODES;
    use crate::types::BrickId;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn brick(node: &str, volume: &str) -> BrickId {
        BrickId::new(Node::new(node), format!("/var/lib/gluster/volume_bricks/{}", volume))
    }

    fn service(sim: &Arc<SimulatedCluster>, dir: &Path, nodes: &[&str]) -> ManagementService {
        let mut config = EgmiConfig::default();
        config.config_storage_path = dir.to_path_buf();
        config.predefined_nodes = nodes.iter().map(|n| n.to_string()).collect();
        let leadership = Arc::new(LeadershipState::default());
        leadership.set_master(true);
        ManagementService::new(config, sim.clone(), leadership).with_peer_poll_interval(Duration::from_millis(1))
    }

    fn cluster(nodes: &[&str]) -> Arc<SimulatedCluster> {
        let sim = Arc::new(SimulatedCluster::new());
        for n in nodes {
            sim.add_node(n);
        }
        sim.connect_all(nodes);
        sim
    }

    #[tokio::test]
    async fn test_actions_need_master() {
        let sim = cluster(&["n1"]);
        let dir = tempfile::TempDir::new().unwrap();
        let service = service(&sim, dir.path(), &["n1"]);
        service.leadership().set_master(false);
        service.leadership().set_master_hostname(Some("n9".to_string()));

        let err = service.add_volume("logs").await.unwrap_err();
        assert_eq!(err.to_string(), "Not master. Master is n9");
        assert!(sim.executed().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_names_are_rejected() {
        let sim = cluster(&["n1"]);
        let dir = tempfile::TempDir::new().unwrap();
        let service = service(&sim, dir.path(), &["n1"]);
        assert!(matches!(service.add_node(" ").await, Err(MgmtError::InvalidRequest(_))));
        assert!(matches!(
            service.delete_volume("a b").await,
            Err(MgmtError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_add_node_probes_from_known_peer() {
        let sim = cluster(&["n1", "n2"]);
        sim.add_node("n3");
        let dir = tempfile::TempDir::new().unwrap();
        let service = service(&sim, dir.path(), &["n1", "n2"]);
        service.run_cycle().await.unwrap();

        service.add_node("n3").await.unwrap();
        assert_eq!(
            sim.executed(),
            vec![(Node::new("n1"), Operation::PeerProbe { host: Node::new("n3") })]
        );
        assert!(sim.peers("n1").contains(&Node::new("n3")));
        assert!(service.settings().list(STATIC_NODES).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_node_before_first_status() {
        let sim = cluster(&["n1"]);
        let dir = tempfile::TempDir::new().unwrap();
        let service = service(&sim, dir.path(), &["n1"]);
        assert!(matches!(service.add_node("n2").await, Err(MgmtError::Initializing)));
    }

    #[tokio::test]
    async fn test_add_volume() {
        let sim = cluster(&["n1", "n2"]);
        let dir = tempfile::TempDir::new().unwrap();
        let service = service(&sim, dir.path(), &["n1", "n2"]);

        service.add_volume("spark").await.unwrap();
        assert_eq!(sim.volume_bricks("spark").unwrap().len(), 2);
        assert_eq!(sim.volume_replicas("spark"), Some(2));
        assert_eq!(sim.volume_status("spark").as_deref(), Some("OK"));
    }

    #[tokio::test]
    async fn test_stop_and_start_volume() {
        let sim = cluster(&["n1"]);
        sim.add_volume("logs", 1, &[brick("n1", "logs")]);
        let dir = tempfile::TempDir::new().unwrap();
        let service = service(&sim, dir.path(), &["n1"]);
        service.run_cycle().await.unwrap();

        service.stop_volume("logs").await.unwrap();
        assert_eq!(
            sim.volume_status("logs").as_deref(),
            Some(crate::node_status::VOL_NOT_STARTED)
        );
        service.start_volume("logs").await.unwrap();
        assert_eq!(sim.volume_status("logs").as_deref(), Some("OK"));
    }

    #[tokio::test]
    async fn test_delete_volume() {
        let sim = cluster(&["n1", "n2"]);
        sim.add_volume("logs", 2, &[brick("n1", "logs"), brick("n2", "logs")]);
        let dir = tempfile::TempDir::new().unwrap();
        let service = service(&sim, dir.path(), &["n1", "n2"]);
        service.run_cycle().await.unwrap();
        assert!(service.settings().list(DISCOVERED_VOLUMES).unwrap().contains("logs"));

        service.delete_volume("logs").await.unwrap();
        assert!(sim.volume_bricks("logs").is_none());
        let ops: Vec<String> = sim.executed().iter().map(|(n, op)| format!("{}@{}", op, n)).collect();
        assert_eq!(
            ops,
            vec![
                "volume stop logs force@n1".to_string(),
                "force-remove-brick logs@n1".to_string(),
                "force-remove-brick logs@n2".to_string(),
                "volume delete logs@n1".to_string(),
            ]
        );
        assert!(!service.settings().list(DISCOVERED_VOLUMES).unwrap().contains("logs"));
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_volume_known() {
        let sim = cluster(&["n1"]);
        sim.add_volume("logs", 1, &[brick("n1", "logs")]);
        sim.fail_operation("volume delete");
        let dir = tempfile::TempDir::new().unwrap();
        let service = service(&sim, dir.path(), &["n1"]);
        service.run_cycle().await.unwrap();

        assert!(service.delete_volume("logs").await.is_err());
        assert!(service.settings().list(DISCOVERED_VOLUMES).unwrap().contains("logs"));
        let (lines, _) = service.messages().lines_since(0);
        assert!(lines.iter().any(|l| l.contains("not recoverable")));
    }
}
