//! Backend driver interface.
//!
//! A backend materializes nodes in some execution environment (a container
//! runtime, a VM host, or the in-memory [`MockBackend`]). The manager never
//! looks inside a backend's state types: it stores them as given and hands
//! them back on the next call.
//!
//! Drivers implement [`Backend`] with concrete associated types. The manager
//! holds them through the object-safe [`DynBackend`] adapter so drivers with
//! different state types can live in one registry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::config::ManagerConfig;
use crate::node::{Address, BackendId, CmdOutput, NodeSpec, PublicKey};

mod erased;
mod mock;

pub(crate) use erased::{DynBackend, Opaque, StateMismatch};
pub use mock::{MockBackend, MockInventory, MockNode, MockPhase};

/// Returned (through `anyhow`) by drivers when a command exceeds its timeout.
#[derive(Debug, thiserror::Error)]
#[error("command timed out after {0:?}")]
pub struct CommandTimedOut(pub Duration);

/// Node lifecycle driver for one execution environment.
///
/// Operations that change a node take `&mut Self::Node`: the driver has
/// exclusive access for the duration of the call and whatever it leaves in
/// place is the node's new state.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Driver-wide state, created at manager start.
    type State: Send + Sync + 'static;

    /// A node spec after driver-specific preparation.
    type Prepared: Send + Sync + 'static;

    /// Per-node state.
    type Node: Send + Sync + 'static;

    /// Type tag that node specs use to select this backend.
    fn id(&self) -> BackendId;

    async fn start(&self, config: &ManagerConfig) -> Result<Self::State>;

    async fn stop(&self, state: Self::State) -> Result<()>;

    async fn prepare_spec(&self, spec: NodeSpec, state: &Self::State) -> Result<Self::Prepared>;

    /// Peer address the node will have once set up.
    fn peer_from_spec(&self, spec: &Self::Prepared, state: &Self::State) -> Result<Address>;

    fn get_peer_address(&self, node: &Self::Node) -> Result<Address>;

    /// Materialize a node without starting it. `peers` are already resolved.
    async fn setup_node(
        &self,
        spec: Self::Prepared,
        peers: Vec<Address>,
        state: &mut Self::State,
    ) -> Result<Self::Node>;

    async fn start_node(&self, node: &mut Self::Node) -> Result<()>;

    /// Graceful stop. `soft_timeout` is a hint the driver may honor.
    async fn stop_node(&self, node: &mut Self::Node, soft_timeout: Duration) -> Result<()>;

    async fn kill_node(&self, node: &mut Self::Node) -> Result<()>;

    /// Release every resource held by the node.
    async fn delete_node(&self, node: Self::Node) -> Result<()>;

    async fn get_service_address(&self, service: &str, node: &Self::Node) -> Result<Address>;

    async fn get_node_pubkey(&self, node: &Self::Node) -> Result<PublicKey>;

    /// Directory holding the node's log files.
    fn get_log_path(&self, node: &Self::Node) -> PathBuf;

    /// Export the node's logs somewhere they outlive the node.
    async fn node_logs(&self, node: &Self::Node) -> Result<()>;

    /// Run `cmd` in the node's working directory, failing with
    /// [`CommandTimedOut`] if it does not finish within `timeout`.
    async fn run_cmd_in_node_dir(
        &self,
        node: &mut Self::Node,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<CmdOutput>;

    async fn extract_archive(&self, node: &mut Self::Node, path: &Path, archive: Bytes)
        -> Result<()>;

    async fn connect_node(&self, network: &str, node: &mut Self::Node) -> Result<()>;

    async fn disconnect_node(&self, network: &str, node: &mut Self::Node) -> Result<()>;
}
