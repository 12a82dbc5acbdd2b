use super::CommandContext;
use crate::error::SolveResult;
use crate::partition::active_connected_nodes;
use crate::remote::Operation;
use crate::system_status::SystemStatus;
use crate::types::Volume;

/// A volume option differing from its managed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrongOption {
    pub volume: Volume,
    pub key: String,
    pub wrong: Option<String>,
    pub expected: String,
}

impl WrongOption {
    pub fn new(volume: Volume, key: impl Into<String>, wrong: Option<String>, expected: impl Into<String>) -> Self {
        Self {
            volume,
            key: key.into(),
            wrong,
            expected: expected.into(),
        }
    }

    pub fn id(&self) -> String {
        format!("WRONG_OPTION-{}-{}-{}", self.volume, self.key, self.expected)
    }

    pub fn recognize(&self, status: &SystemStatus) -> bool {
        let Some(volume) = status.volume(&self.volume) else {
            return false;
        };
        match volume.options.get(&self.key) {
            Some(value) if !value.trim().is_empty() => value != &self.expected,
            _ => true,
        }
    }

    pub async fn solve(&self, ctx: &CommandContext) -> SolveResult {
        ctx.info(format!("- Solving {}", self.id()));

        let statuses = ctx.fetch_statuses().await;
        let active = active_connected_nodes(&statuses);
        let Some(node) = active.iter().next() else {
            return Ok(false);
        };

        ctx.info(format!(
            "  + Setting {} to {} on {} (was {})",
            self.key,
            self.expected,
            self.volume,
            self.wrong.as_deref().unwrap_or("unset")
        ));
        ctx.execute_simple_operation(
            &Operation::VolumeSet {
                volume: self.volume.clone(),
                key: self.key.clone(),
                value: self.expected.clone(),
            },
            node,
        )
        .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problems::tests::{brick, context};
    use crate::remote_sim::SimulatedCluster;
    use crate::system_status::VolumeEntry;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn entry(options: &[(&str, &str)]) -> VolumeEntry {
        VolumeEntry {
            volume: Volume::new("logs"),
            status: "OK".to_string(),
            volume_type: None,
            owner: None,
            nb_shards: None,
            nb_replicas: None,
            nb_bricks: None,
            bricks: Vec::new(),
            options: options
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_recognize() {
        let p = WrongOption::new(Volume::new("logs"), "performance.quick-read", None, "off");
        assert_eq!(p.id(), "WRONG_OPTION-logs-performance.quick-read-off");

        let mut status = SystemStatus::default();
        assert!(!p.recognize(&status));
        status.volumes.push(entry(&[]));
        assert!(p.recognize(&status));
        status.volumes[0] = entry(&[("performance.quick-read", " ")]);
        assert!(p.recognize(&status));
        status.volumes[0] = entry(&[("performance.quick-read", "on")]);
        assert!(p.recognize(&status));
        status.volumes[0] = entry(&[("performance.quick-read", "off")]);
        assert!(!p.recognize(&status));
    }

    #[tokio::test]
    async fn test_sets_expected_value() {
        let sim = Arc::new(SimulatedCluster::new());
        for n in ["n1", "n2"] {
            sim.add_node(n);
        }
        sim.connect_all(&["n1", "n2"]);
        sim.add_volume("logs", 2, &[brick("n1", "logs"), brick("n2", "logs")]);
        sim.set_option("logs", "performance.quick-read", "on");
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(&sim, dir.path(), &["n1", "n2"]);

        let p = WrongOption::new(
            Volume::new("logs"),
            "performance.quick-read",
            Some("on".to_string()),
            "off",
        );
        assert_eq!(p.solve(&ctx).await, Ok(true));
        assert_eq!(sim.option("logs", "performance.quick-read").as_deref(), Some("off"));
    }
}
