//! EGMI: self-healing control plane for Gluster storage clusters.
//!
//! The elected master polls every node, merges what they report into a
//! cluster-wide status, tracks the problems it shows and remediates them.

pub mod actions;
pub mod aggregator;
pub mod allocation;
pub mod api;
pub mod cli;
pub mod config;
pub mod election;
pub mod error;
pub mod http_remote;
pub mod layout;
pub mod messages;
pub mod node_status;
pub mod partition;
pub mod problems;
pub mod reconcile;
pub mod remote;
pub mod remote_sim;
pub mod settings;
pub mod system_status;
pub mod types;
pub mod zookeeper;

pub use aggregator::StatusAggregator;
pub use config::EgmiConfig;
pub use election::{ElectionService, LeadershipState};
pub use error::{MgmtError, MgmtResult, Resolution, SolveResult};
pub use http_remote::HttpRemoteManager;
pub use layout::{BrickPolicy, RuntimeLayout};
pub use problems::{Problem, ProblemRegistry};
pub use reconcile::{ManagementService, StatusSnapshot};
pub use remote::{Operation, RemoteManager};
pub use remote_sim::SimulatedCluster;
pub use system_status::{NodeState, SystemStatus};
pub use types::{BrickId, Node, Volume};
