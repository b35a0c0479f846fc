//! Error types for the node lifecycle manager.

use std::time::Duration;

use thiserror::Error;

use crate::node::{BackendId, NodeName};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// A failure attributed to one node or backend during a batch operation.
#[derive(Debug, Error)]
#[error("{target}: {message}")]
pub struct ItemFailure {
    /// Node or backend the failure belongs to.
    pub target: String,
    pub message: String,
}

impl ItemFailure {
    pub fn new(target: impl Into<String>, error: &anyhow::Error) -> Self {
        Self {
            target: target.into(),
            message: format!("{error:#}"),
        }
    }
}

/// Errors returned by the node lifecycle manager.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A spec names a backend the manager was not started with.
    #[error("backend not provided: {0}")]
    BackendNotProvided(BackendId),

    /// A symbolic peer does not name a known node.
    #[error("peer not found: node {node} references unknown peer {peer}")]
    PeerNotFound { node: NodeName, peer: NodeName },

    /// The manager configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An operation referenced a node that was never set up.
    #[error("node not found: {0}")]
    NodeNotFound(NodeName),

    /// A backend was handed state it did not create.
    #[error("state mismatch in backend {backend}: expected {expected}")]
    StateMismatch {
        backend: BackendId,
        expected: &'static str,
    },

    /// A backend failed to start.
    #[error("backend {backend} failed to start: {source:#}")]
    BackendStart {
        backend: BackendId,
        #[source]
        source: anyhow::Error,
    },

    /// A backend operation on a node failed.
    #[error("{op} failed on node {node}: {source:#}")]
    Backend {
        node: NodeName,
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A command in a node did not finish in time.
    #[error("command on node {node} timed out after {timeout:?}")]
    CommandTimeout { node: NodeName, timeout: Duration },

    /// The control point did not answer within the caller's timeout.
    #[error("{op} timed out after {timeout:?} waiting for the node manager")]
    CallTimeout { op: &'static str, timeout: Duration },

    /// The control point is no longer running.
    #[error("node manager stopped")]
    ManagerStopped,

    /// Some nodes failed to export their logs.
    #[error("dumping logs failed for {} node(s): {}", .failures.len(), join(.failures))]
    DumpLogs { failures: Vec<ItemFailure> },

    /// Some nodes or backends failed to tear down.
    #[error("teardown failed for {} item(s): {}", .failures.len(), join(.failures))]
    Teardown { failures: Vec<ItemFailure> },

    /// The log scan found error lines.
    #[error("errors found in logs of: {}", .nodes.join(", "))]
    LogErrors { nodes: Vec<String> },
}

impl HarnessError {
    pub(crate) fn backend(node: &NodeName, op: &'static str, source: anyhow::Error) -> Self {
        HarnessError::Backend {
            node: node.clone(),
            op,
            source,
        }
    }

    /// Returns true for errors caused by the caller's configuration or specs.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            HarnessError::BackendNotProvided(_)
                | HarnessError::PeerNotFound { .. }
                | HarnessError::InvalidConfig(_)
        )
    }

    /// Returns true for errors that indicate misuse of the manager API.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            HarnessError::NodeNotFound(_) | HarnessError::StateMismatch { .. }
        )
    }
}

fn join(failures: &[ItemFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(HarnessError::BackendNotProvided(BackendId::new("docker")).is_config_error());
        assert!(HarnessError::PeerNotFound {
            node: NodeName::new("b"),
            peer: NodeName::new("a"),
        }
        .is_config_error());
        assert!(HarnessError::NodeNotFound(NodeName::new("x")).is_contract_violation());
        assert!(!HarnessError::ManagerStopped.is_config_error());
    }

    #[test]
    fn test_aggregate_message() {
        let err = HarnessError::Teardown {
            failures: vec![
                ItemFailure::new("node1", &anyhow::anyhow!("container gone")),
                ItemFailure::new("backend mock", &anyhow::anyhow!("socket closed")),
            ],
        };
        assert_eq!(
            err.to_string(),
            "teardown failed for 2 item(s): node1: container gone; backend mock: socket closed"
        );
    }
}
