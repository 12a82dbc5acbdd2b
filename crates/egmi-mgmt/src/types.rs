//! Identifiers of the entities making up a storage cluster.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Address of a cluster member (hostname or IP).
///
/// Hostnames compare case-insensitively, so the address is normalized to
/// lower case on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Node(String);

impl Node {
    /// Creates a node from an address.
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_lowercase())
    }

    /// Returns the normalized address.
    pub fn address(&self) -> &str {
        &self.0
    }

    /// Returns true for the loopback alias some peer listings report for self.
    pub fn is_localhost(&self) -> bool {
        self.0 == "localhost"
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Node {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Node {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<Node> for String {
    fn from(n: Node) -> Self {
        n.0
    }
}

/// Name of a logical storage volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Volume(String);

impl Volume {
    /// Creates a volume identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the volume name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Volume {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A brick instance: a directory on one node contributing to a volume.
///
/// Rendered and parsed as `node:path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BrickId {
    /// Node hosting the brick.
    pub node: Node,
    /// Path of the brick directory on that node.
    pub path: String,
}

impl BrickId {
    /// Creates a brick identifier.
    pub fn new(node: Node, path: impl Into<String>) -> Self {
        Self {
            node,
            path: path.into(),
        }
    }
}

impl fmt::Display for BrickId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.path)
    }
}

/// Error parsing a [`BrickId`] from its `node:path` form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid brick id: {0}")]
pub struct InvalidBrickId(pub String);

impl FromStr for BrickId {
    type Err = InvalidBrickId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((node, path)) if !node.trim().is_empty() && !path.is_empty() => {
                Ok(Self::new(Node::new(node), path))
            }
            _ => Err(InvalidBrickId(s.to_string())),
        }
    }
}

impl TryFrom<String> for BrickId {
    type Error = InvalidBrickId;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BrickId> for String {
    fn from(b: BrickId) -> Self {
        b.to_string()
    }
}
