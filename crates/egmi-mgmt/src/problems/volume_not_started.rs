use super::CommandContext;
use crate::error::SolveResult;
use crate::node_status::VOL_NOT_STARTED;
use crate::remote::Operation;
use crate::system_status::SystemStatus;
use crate::types::Volume;

/// A volume that exists but is stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeNotStarted {
    pub volume: Volume,
}

impl VolumeNotStarted {
    pub fn new(volume: Volume) -> Self {
        Self { volume }
    }

    pub fn id(&self) -> String {
        format!("VOLUME_DOWN-{}", self.volume)
    }

    pub fn recognize(&self, status: &SystemStatus) -> bool {
        status
            .volume(&self.volume)
            .map_or(false, |v| v.status.contains("NOT STARTED"))
    }

    pub async fn solve(&self, ctx: &CommandContext) -> SolveResult {
        ctx.info(format!("- Solving {}", self.id()));

        let statuses = ctx.fetch_statuses().await;
        for (node, status) in &statuses {
            let Ok(Some(info)) = status.volume_information(node, &self.volume) else {
                continue;
            };
            if info.status.as_deref() == Some(VOL_NOT_STARTED) {
                ctx.info(format!("  + Starting {} on {}", self.volume, node));
                ctx.execute_simple_operation(
                    &Operation::VolumeStart {
                        volume: self.volume.clone(),
                        force: false,
                    },
                    node,
                )
                .await?;
                break;
            }
        }
        Ok(true)
    }
}
