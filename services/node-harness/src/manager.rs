//! Public handle to the node lifecycle manager.
//!
//! [`NodeManager`] is a cheap, cloneable handle. Each method sends one
//! request to the manager actor and waits for the reply, bounded by the
//! handle's call timeout.
//!
//! Call [`NodeManager::cleanup`] or [`NodeManager::shutdown`] before the end
//! of a test. Dropping the last handle only signals the actor to stop; its
//! teardown of leftover nodes runs on the tokio runtime and is cancelled if
//! the runtime shuts down first, as it does when a `#[tokio::test]` returns.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::actors::{
    spawn, ActorError, ActorHandle, ActorRef, CleanupReport, ManagerMessage, ManagerStatus,
    NodeManagerActor, Teardown,
};
use crate::backend::{Backend, DynBackend, Opaque};
use crate::config::ManagerConfig;
use crate::error::{HarnessError, ItemFailure, Result};
use crate::node::{Address, CmdOutput, NodeName, NodeSpec, PublicKey};

/// Slack added on top of a command's own timeout when waiting for its reply.
const CMD_REPLY_MARGIN: Duration = Duration::from_secs(5);

/// Builder collecting the backends a manager starts with.
pub struct NodeManagerBuilder {
    config: ManagerConfig,
    backends: Vec<Box<dyn DynBackend>>,
}

impl NodeManagerBuilder {
    /// Register a backend driver.
    pub fn backend<B: Backend>(mut self, backend: B) -> Self {
        self.backends.push(Box::new(backend));
        self
    }

    /// Start every backend and spawn the manager actor.
    ///
    /// If any backend fails to start, the ones already started are stopped
    /// again and the error is returned.
    pub async fn start(self) -> Result<NodeManager> {
        self.config.validate()?;

        let mut seen = HashSet::new();
        if let Some(dup) = self
            .backends
            .iter()
            .map(|b| b.id())
            .find(|id| !seen.insert(id.clone()))
        {
            return Err(HarnessError::InvalidConfig(format!(
                "backend {dup} registered twice"
            )));
        }

        let mut started: Vec<(Box<dyn DynBackend>, Opaque)> =
            Vec::with_capacity(self.backends.len());
        for driver in self.backends {
            let id = driver.id();
            match driver.start(&self.config).await {
                Ok(state) => {
                    info!(backend = %id, "Backend started");
                    started.push((driver, state));
                }
                Err(source) => {
                    for (driver, state) in started {
                        if let Err(e) = driver.stop(state).await {
                            warn!(
                                backend = %driver.id(),
                                error = %e,
                                "Failed to stop backend after start failure"
                            );
                        }
                    }
                    return Err(HarnessError::BackendStart { backend: id, source });
                }
            }
        }

        let call_timeout = self.config.call_timeout;
        let mailbox_size = self.config.mailbox_size;
        info!(
            test_id = %self.config.test_id,
            backends = started.len(),
            "Starting node manager"
        );

        let actor = NodeManagerActor::new(self.config, started);
        let (handle, actor_ref) = spawn(actor, mailbox_size);

        Ok(NodeManager {
            handle,
            actor: Arc::new(actor_ref),
            call_timeout,
        })
    }
}

/// Handle to a running node lifecycle manager.
#[derive(Clone)]
pub struct NodeManager {
    handle: ActorHandle<ManagerMessage>,
    actor: Arc<ActorRef>,
    call_timeout: Duration,
}

fn call_error(op: &'static str, err: ActorError) -> HarnessError {
    match err {
        ActorError::Timeout(timeout) => HarnessError::CallTimeout { op, timeout },
        _ => HarnessError::ManagerStopped,
    }
}

impl NodeManager {
    pub fn builder(config: ManagerConfig) -> NodeManagerBuilder {
        NodeManagerBuilder {
            config,
            backends: Vec::new(),
        }
    }

    /// A handle to the same manager that waits up to `timeout` per call.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            call_timeout: timeout,
            ..self.clone()
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Whether the manager actor is still running.
    pub fn is_running(&self) -> bool {
        self.actor.is_running()
    }

    async fn request<R>(
        &self,
        op: &'static str,
        timeout: Duration,
        make: impl FnOnce(oneshot::Sender<R>) -> ManagerMessage,
    ) -> Result<R> {
        self.handle
            .call(make, timeout)
            .await
            .map_err(|e| call_error(op, e))
    }

    async fn call<T>(
        &self,
        op: &'static str,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> ManagerMessage,
    ) -> Result<T> {
        self.request(op, self.call_timeout, make).await?
    }

    /// Prepare and materialize nodes without starting them.
    pub async fn setup_nodes(&self, specs: Vec<NodeSpec>) -> Result<()> {
        self.call("setup_nodes", |reply| ManagerMessage::SetupNodes { specs, reply })
            .await
    }

    pub async fn start_node(&self, name: impl Into<NodeName>) -> Result<()> {
        let name = name.into();
        self.call("start_node", |reply| ManagerMessage::StartNode { name, reply })
            .await
    }

    /// Stop a node gracefully. `soft_timeout` is a hint to the backend.
    pub async fn stop_node(&self, name: impl Into<NodeName>, soft_timeout: Duration) -> Result<()> {
        let name = name.into();
        self.call("stop_node", |reply| ManagerMessage::StopNode {
            name,
            soft_timeout,
            reply,
        })
        .await
    }

    pub async fn kill_node(&self, name: impl Into<NodeName>) -> Result<()> {
        let name = name.into();
        self.call("kill_node", |reply| ManagerMessage::KillNode { name, reply })
            .await
    }

    pub async fn get_service_address(
        &self,
        name: impl Into<NodeName>,
        service: impl Into<String>,
    ) -> Result<Address> {
        let name = name.into();
        let service = service.into();
        self.call("get_service_address", |reply| {
            ManagerMessage::GetServiceAddress {
                name,
                service,
                reply,
            }
        })
        .await
    }

    pub async fn get_node_pubkey(&self, name: impl Into<NodeName>) -> Result<PublicKey> {
        let name = name.into();
        self.call("get_node_pubkey", |reply| ManagerMessage::GetNodePubkey { name, reply })
            .await
    }

    /// Run a command in the node's working directory.
    ///
    /// The wait for the reply is at least `timeout` plus a margin, so the
    /// command's own timeout is what normally fires.
    pub async fn run_cmd_in_node_dir(
        &self,
        name: impl Into<NodeName>,
        cmd: Vec<String>,
        timeout: Duration,
    ) -> Result<CmdOutput> {
        let name = name.into();
        let wait = self.call_timeout.max(timeout + CMD_REPLY_MARGIN);
        self.request("run_cmd_in_node_dir", wait, |reply| ManagerMessage::RunCmd {
            name,
            cmd,
            timeout,
            reply,
        })
        .await?
    }

    /// Unpack `archive` at `path` inside the node.
    pub async fn extract_archive(
        &self,
        name: impl Into<NodeName>,
        path: impl Into<PathBuf>,
        archive: Bytes,
    ) -> Result<()> {
        let name = name.into();
        let path = path.into();
        self.call("extract_archive", |reply| ManagerMessage::ExtractArchive {
            name,
            path,
            archive,
            reply,
        })
        .await
    }

    pub async fn connect_node(
        &self,
        name: impl Into<NodeName>,
        network: impl Into<String>,
    ) -> Result<()> {
        let name = name.into();
        let network = network.into();
        self.call("connect_node", |reply| ManagerMessage::ConnectNode {
            name,
            network,
            reply,
        })
        .await
    }

    pub async fn disconnect_node(
        &self,
        name: impl Into<NodeName>,
        network: impl Into<String>,
    ) -> Result<()> {
        let name = name.into();
        let network = network.into();
        self.call("disconnect_node", |reply| ManagerMessage::DisconnectNode {
            name,
            network,
            reply,
        })
        .await
    }

    /// Ask every node's backend to export its logs. Every node is attempted;
    /// failures are collected into [`HarnessError::DumpLogs`].
    pub async fn dump_logs(&self) -> Result<()> {
        self.call("dump_logs", |reply| ManagerMessage::DumpLogs { reply })
            .await
    }

    /// Scan node logs, then tear down every node and backend.
    ///
    /// Teardown always runs to the end and both registries are empty
    /// afterwards. Use [`CleanupReport::into_result`] to fail a test on
    /// findings.
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        self.request("cleanup", self.call_timeout, |reply| ManagerMessage::Cleanup { reply })
            .await
    }

    /// Registered backends and nodes.
    pub async fn status(&self) -> Result<ManagerStatus> {
        self.request("status", self.call_timeout, |reply| ManagerMessage::Status { reply })
            .await
    }

    /// Tear everything down and stop the manager actor.
    pub async fn shutdown(&self) -> Result<Teardown> {
        let teardown = self
            .request("shutdown", self.call_timeout, |reply| ManagerMessage::Shutdown { reply })
            .await?;
        if !teardown.failures.is_empty() {
            warn!(
                failures = %teardown
                    .failures
                    .iter()
                    .map(ItemFailure::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
                "Node manager shut down with teardown failures"
            );
        }
        Ok(teardown)
    }
}
