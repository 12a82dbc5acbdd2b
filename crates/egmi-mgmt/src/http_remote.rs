//! [`RemoteManager`] over the HTTP interface of the node agents.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::RemoteError;
use crate::node_status::NodeStatus;
use crate::remote::{Operation, OperationResult, RemoteManager};
use crate::types::Node;

/// Talks to the agent listening on every node at a fixed port.
pub struct HttpRemoteManager {
    client: reqwest::Client,
    port: u16,
    context_root: String,
}

impl HttpRemoteManager {
    /// Creates a client with the given connect and read timeouts.
    pub fn new(port: u16, connect_timeout: Duration, read_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(connect_timeout + read_timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            port,
            context_root: String::new(),
        }
    }

    /// Prefixes every agent path with `root`.
    pub fn with_context_root(mut self, root: &str) -> Self {
        let root = root.trim_matches('/');
        self.context_root = if root.is_empty() {
            String::new()
        } else {
            format!("/{}", root)
        };
        self
    }

    fn base_url(&self, node: &Node) -> String {
        format!("http://{}:{}{}", node, self.port, self.context_root)
    }

    /// URL of the agent's status endpoint on `node`.
    pub fn status_url(&self, node: &Node) -> String {
        format!("{}/status", self.base_url(node))
    }

    /// URL running `operation` on `node`.
    pub fn command_url(&self, operation: &Operation, node: &Node) -> String {
        let (command, subcommand, options) = operation.command();
        let options: Vec<String> = options
            .iter()
            .filter(|o| !o.trim().is_empty())
            .map(|o| urlencoding::encode(o).into_owned())
            .collect();
        format!(
            "{}/command?command={}&subcommand={}&options={}",
            self.base_url(node),
            command,
            urlencoding::encode(&subcommand),
            options.join("%20")
        )
    }

    fn map_error(node: &Node, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout { node: node.clone() }
        } else if e.is_decode() {
            RemoteError::Decode {
                node: node.clone(),
                msg: e.to_string(),
            }
        } else {
            RemoteError::Http {
                node: node.clone(),
                msg: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl RemoteManager for HttpRemoteManager {
    async fn fetch_node_status(&self, node: &Node) -> Result<NodeStatus, RemoteError> {
        let url = self.status_url(node);
        debug!("fetching {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::map_error(node, e))?;

        if !response.status().is_success() {
            return Err(RemoteError::Status {
                node: node.clone(),
                status: response.status().as_u16(),
            });
        }

        response
            .json::<NodeStatus>()
            .await
            .map_err(|e| RemoteError::Decode {
                node: node.clone(),
                msg: e.to_string(),
            })
    }

    async fn execute(&self, operation: &Operation, node: &Node) -> Result<OperationResult, RemoteError> {
        let url = self.command_url(operation, node);
        debug!("executing {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::map_error(node, e))?;

        let http_ok = response.status().is_success();
        let body = response.text().await.map_err(|e| Self::map_error(node, e))?;
        let result = OperationResult::from_reply(http_ok, &body);
        if !result.success {
            error!("{} on {} failed: {}", operation, node, result.message);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BrickId, Volume};

    fn manager() -> HttpRemoteManager {
        HttpRemoteManager::new(18999, Duration::from_millis(500), Duration::from_secs(5))
    }

    #[test]
    fn test_status_url() {
        assert_eq!(
            manager().status_url(&Node::new("192.168.10.11")),
            "http://192.168.10.11:18999/status"
        );
    }

    #[test]
    fn test_context_root() {
        let m = manager().with_context_root("/egmi/");
        assert_eq!(m.status_url(&Node::new("n1")), "http://n1:18999/egmi/status");
        let m = manager().with_context_root("");
        assert_eq!(m.status_url(&Node::new("n1")), "http://n1:18999/status");
    }

    #[test]
    fn test_command_url_escapes_options() {
        let op = Operation::VolumeAddBrick {
            volume: Volume::new("logs"),
            replicas: 2,
            bricks: vec![BrickId::new(Node::new("n2"), "/bricks/logs")],
        };
        let url = manager().command_url(&op, &Node::new("n1"));
        assert_eq!(
            url,
            "http://n1:18999/command?command=volume&subcommand=add-brick&options=logs%20replica%202%20n2%3A%2Fbricks%2Flogs%20force"
        );
    }

    #[test]
    fn test_command_url_empty_subcommand() {
        let op = Operation::ForceResetHost {
            host: Node::new("n3"),
        };
        let url = manager().command_url(&op, &Node::new("n3"));
        assert_eq!(
            url,
            "http://n3:18999/command?command=force-remove-peer&subcommand=&options=n3"
        );
    }

    #[tokio::test]
    async fn test_unreachable_node_is_an_error() {
        let m = HttpRemoteManager::new(1, Duration::from_millis(200), Duration::from_millis(200));
        let res = m.fetch_node_status(&Node::new("127.0.0.1")).await;
        assert!(res.is_err());
    }
}
