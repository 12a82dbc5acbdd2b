//! Error types for the management subsystem.

use thiserror::Error;

use crate::types::{Node, Volume};

/// Result type alias for management operations.
pub type MgmtResult<T> = Result<T, MgmtError>;

/// Outcome of a single problem resolution attempt.
///
/// `Ok(true)` means solved, `Ok(false)` means nothing could or needed to be
/// done this cycle.
pub type SolveResult = Result<bool, Resolution>;

/// Failure talking to the agent running on a node.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Connection refused, reset or any other transport failure.
    #[error("HTTP error talking to {node}: {msg}")]
    Http {
        /// Target node.
        node: Node,
        /// Transport error description.
        msg: String,
    },

    /// The connect or read timeout elapsed.
    #[error("Timeout talking to {node}")]
    Timeout {
        /// Target node.
        node: Node,
    },

    /// The agent answered with a non-success HTTP status.
    #[error("Unexpected HTTP status {status} from {node}")]
    Status {
        /// Target node.
        node: Node,
        /// HTTP status code.
        status: u16,
    },

    /// The reply could not be decoded.
    #[error("Malformed reply from {node}: {msg}")]
    Decode {
        /// Target node.
        node: Node,
        /// Decoder error description.
        msg: String,
    },

    /// The node is not part of the cluster known to the remote manager.
    #[error("Node {node} unreachable")]
    Unreachable {
        /// Target node.
        node: Node,
    },
}

/// A node answered but one of its sub-queries failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeStatusError {
    /// Listing the peer pool failed on the node.
    #[error("Peer listing failed on {0}")]
    PeerListing(Node),

    /// Listing volume information failed on the node.
    #[error("Volume listing failed on {0}")]
    VolumeListing(Node),

    /// Listing brick status failed on the node.
    #[error("Brick listing failed on {0}")]
    BrickListing(Node),
}

/// Failure reading or writing the durable runtime settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The settings document is not valid JSON.
    #[error("Malformed settings document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure of the coordination service backing leader election.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    /// The session expired or was closed.
    #[error("Coordination session lost")]
    SessionLost,

    /// The path does not exist.
    #[error("No node at {0}")]
    NoNode(String),

    /// The path already exists.
    #[error("Node already exists at {0}")]
    NodeExists(String),

    /// The parent of the path does not exist.
    #[error("Parent of {0} does not exist")]
    NoParent(String),

    /// Any other failure reported by the coordination service.
    #[error("Coordination service error: {0}")]
    Backend(String),
}

/// Control signal raised while solving a problem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Resolution {
    /// This problem cannot progress this cycle; keep it and try again later.
    #[error("Skipped: {0}")]
    Skip(String),

    /// Cluster state was partially changed; abort the rest of the pass.
    #[error("Stopped: {0}")]
    Stop(String),
}

impl From<RemoteError> for Resolution {
    fn from(e: RemoteError) -> Self {
        Resolution::Stop(e.to_string())
    }
}

impl From<NodeStatusError> for Resolution {
    fn from(e: NodeStatusError) -> Self {
        Resolution::Stop(e.to_string())
    }
}

impl From<SettingsError> for Resolution {
    fn from(e: SettingsError) -> Self {
        Resolution::Stop(e.to_string())
    }
}

/// Top-level error of the management service.
#[derive(Debug, Error)]
pub enum MgmtError {
    /// No reconciliation cycle has completed yet.
    #[error("System status is initializing")]
    Initializing,

    /// The last reconciliation cycle failed.
    #[error("Last status update failed: {0}")]
    LastCycleFailed(String),

    /// Remote call failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Node sub-query failure.
    #[error(transparent)]
    NodeStatus(#[from] NodeStatusError),

    /// Runtime settings failure.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// Coordination service failure.
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    /// A mutating operation was rejected by the node agent.
    #[error("{operation} failed on {node}: {message}")]
    OperationFailed {
        /// Operation label.
        operation: String,
        /// Node the operation ran on.
        node: Node,
        /// Agent reply.
        message: String,
    },

    /// The volume could not be created or found.
    #[error("Volume {0} cannot be handled: {1}")]
    Volume(Volume, String),

    /// The operation is reserved to the elected master.
    #[error("Not master. Master is {0}")]
    NotMaster(String),

    /// A user request is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No node is currently able to run the operation.
    #[error("No active node available")]
    NoActiveNode,

    /// A resolution signal escaped the resolution pass.
    #[error(transparent)]
    Resolution(#[from] Resolution),

    /// Invalid configuration. Fatal at start-up.
    #[error("Configuration error: {0}")]
    Config(String),
}
