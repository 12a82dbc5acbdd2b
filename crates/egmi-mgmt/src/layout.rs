//! Target topology computation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Policy deciding how many bricks a managed volume should have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BrickPolicy {
    /// 1 brick for 1 node, 2 for 2, then `round(2 + ln(nodes))`.
    LogDispatch,
    /// One brick per node.
    AllNodes,
    /// A fixed count, capped by the node count.
    Fixed(usize),
}

impl Default for BrickPolicy {
    fn default() -> Self {
        BrickPolicy::LogDispatch
    }
}

impl FromStr for BrickPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "LOG_DISPATCH" => Ok(BrickPolicy::LogDispatch),
            "ALL" | "ALL_NODES" => Ok(BrickPolicy::AllNodes),
            other => other
                .parse::<usize>()
                .map(BrickPolicy::Fixed)
                .map_err(|_| format!("invalid brick policy: {}", other)),
        }
    }
}

impl TryFrom<String> for BrickPolicy {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BrickPolicy> for String {
    fn from(p: BrickPolicy) -> Self {
        p.to_string()
    }
}

impl fmt::Display for BrickPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrickPolicy::LogDispatch => f.write_str("LOG_DISPATCH"),
            BrickPolicy::AllNodes => f.write_str("ALL_NODES"),
            BrickPolicy::Fixed(n) => write!(f, "{}", n),
        }
    }
}

impl BrickPolicy {
    /// Brick count before it is rounded down to a multiple of the replica count.
    pub fn theoretical_bricks(self, node_count: usize) -> usize {
        match self {
            BrickPolicy::LogDispatch => match node_count {
                0 => 0,
                1 => 1,
                2 => 2,
                n => (2.0 + (n as f64).ln()).round() as usize,
            },
            BrickPolicy::AllNodes => node_count,
            BrickPolicy::Fixed(n) => n.min(node_count),
        }
    }
}

/// Target shape of a managed volume for a given node count.
///
/// `bricks % replicas == 0` always holds; both are 0 when there is no node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeLayout {
    /// Target brick count.
    pub bricks: usize,
    /// Target replica count per shard.
    pub replicas: usize,
    /// Target shard count.
    pub shards: usize,
}

impl RuntimeLayout {
    /// Computes the layout for `node_count` nodes.
    pub fn compute(node_count: usize, policy: BrickPolicy, default_replicas: usize) -> Self {
        let theoretical = policy.theoretical_bricks(node_count);
        let replicas = target_replicas(theoretical, default_replicas);
        if replicas == 0 {
            return Self {
                bricks: 0,
                replicas: 0,
                shards: 0,
            };
        }
        let mut bricks = theoretical;
        while bricks % replicas != 0 {
            bricks -= 1;
        }
        Self {
            bricks,
            replicas,
            shards: bricks / replicas,
        }
    }
}

/// Replica count for `bricks` bricks: the default, lowered until it equals the
/// brick count or no longer exceeds half of it.
fn target_replicas(bricks: usize, default_replicas: usize) -> usize {
    match bricks {
        0 => 0,
        1 => 1,
        _ => {
            let mut replicas = default_replicas.max(1);
            while bricks != replicas && bricks / 2 < replicas {
                replicas -= 1;
            }
            replicas
        }
    }
}
