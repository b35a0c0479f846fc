//! Node manager actor - the single control point over nodes and backends.
//!
//! Every lifecycle operation is a message. The actor handles them one at a
//! time, so each operation's registry update is visible before the next one
//! starts and concurrent callers never race on a node.
//!
//! ## Dispatch
//!
//! ```text
//! name -> (backend id, node state) -> backend.op(&mut node state) -> registry
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::framework::{panic_message, Actor, ActorContext, ActorError};
use crate::backend::{CommandTimedOut, DynBackend, Opaque, StateMismatch};
use crate::config::ManagerConfig;
use crate::error::{HarnessError, ItemFailure, Result};
use crate::logscan::LogScan;
use crate::node::{Address, BackendId, CmdOutput, NodeName, NodeSpec, Peer, PublicKey};
use crate::peers::AddressBook;

/// Reply channel for a fallible request.
pub type Reply<T> = oneshot::Sender<Result<T>>;

// =============================================================================
// Messages
// =============================================================================

/// Requests handled by the node manager actor.
#[derive(Debug)]
pub enum ManagerMessage {
    SetupNodes {
        specs: Vec<NodeSpec>,
        reply: Reply<()>,
    },
    StartNode {
        name: NodeName,
        reply: Reply<()>,
    },
    StopNode {
        name: NodeName,
        soft_timeout: Duration,
        reply: Reply<()>,
    },
    KillNode {
        name: NodeName,
        reply: Reply<()>,
    },
    GetServiceAddress {
        name: NodeName,
        service: String,
        reply: Reply<Address>,
    },
    GetNodePubkey {
        name: NodeName,
        reply: Reply<PublicKey>,
    },
    RunCmd {
        name: NodeName,
        cmd: Vec<String>,
        timeout: Duration,
        reply: Reply<CmdOutput>,
    },
    ExtractArchive {
        name: NodeName,
        path: PathBuf,
        archive: Bytes,
        reply: Reply<()>,
    },
    ConnectNode {
        name: NodeName,
        network: String,
        reply: Reply<()>,
    },
    DisconnectNode {
        name: NodeName,
        network: String,
        reply: Reply<()>,
    },
    DumpLogs {
        reply: Reply<()>,
    },
    Cleanup {
        reply: oneshot::Sender<CleanupReport>,
    },
    Status {
        reply: oneshot::Sender<ManagerStatus>,
    },
    /// Tear everything down and stop the actor.
    Shutdown {
        reply: oneshot::Sender<Teardown>,
    },
}

/// Snapshot of the registries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStatus {
    pub backends: Vec<BackendId>,
    pub nodes: Vec<NodeName>,
}

/// What a mass teardown did.
#[derive(Debug, Default)]
pub struct Teardown {
    /// Nodes left running because `keep_nodes` was set.
    pub kept_nodes: Vec<NodeName>,

    /// Every node or backend that failed to stop or delete.
    pub failures: Vec<ItemFailure>,
}

/// Result of `cleanup`.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Findings of the log scan that ran before teardown.
    pub log_scan: LogScan,

    pub teardown: Teardown,
}

impl CleanupReport {
    /// True when the scan was clean and teardown had no failures.
    pub fn is_clean(&self) -> bool {
        self.log_scan.is_clean() && self.teardown.failures.is_empty()
    }

    /// Turn findings into an error. Log errors take precedence.
    pub fn into_result(self) -> Result<()> {
        if !self.log_scan.is_clean() {
            return Err(HarnessError::LogErrors {
                nodes: self.log_scan.nodes(),
            });
        }
        if !self.teardown.failures.is_empty() {
            return Err(HarnessError::Teardown {
                failures: self.teardown.failures,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Registry
// =============================================================================

struct BackendEntry {
    driver: Box<dyn DynBackend>,
    state: Opaque,
}

/// A node the manager set up.
struct ManagedNode {
    backend: BackendId,
    state: Opaque,
}

/// A spec that passed preparation, waiting for peer resolution.
struct PreparedNode {
    name: NodeName,
    backend: BackendId,
    peers: Vec<Peer>,
    prepared: Opaque,
}

fn panicked(payload: Box<dyn Any + Send>) -> anyhow::Error {
    anyhow!("backend panicked: {}", panic_message(payload.as_ref()))
}

/// Await a driver call, turning a panic into an error.
async fn guarded<T>(call: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    AssertUnwindSafe(call)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(panicked(payload)))
}

fn guarded_sync<T>(call: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    std::panic::catch_unwind(AssertUnwindSafe(call))
        .unwrap_or_else(|payload| Err(panicked(payload)))
}

fn dispatch_error(
    err: anyhow::Error,
    node: &NodeName,
    backend: &BackendId,
    op: &'static str,
) -> HarnessError {
    if let Some(mismatch) = err.downcast_ref::<StateMismatch>() {
        error!(
            node = %node,
            backend = %backend,
            op,
            expected = mismatch.expected,
            "Backend state mismatch"
        );
        return HarnessError::StateMismatch {
            backend: backend.clone(),
            expected: mismatch.expected,
        };
    }
    HarnessError::backend(node, op, err)
}

// =============================================================================
// Node Manager Actor
// =============================================================================

/// Actor owning the backend and node registries.
pub struct NodeManagerActor {
    config: ManagerConfig,
    backends: BTreeMap<BackendId, BackendEntry>,
    nodes: BTreeMap<NodeName, ManagedNode>,
}

impl NodeManagerActor {
    /// Create the actor over backends that have already been started.
    pub(crate) fn new(config: ManagerConfig, started: Vec<(Box<dyn DynBackend>, Opaque)>) -> Self {
        let backends = started
            .into_iter()
            .map(|(driver, state)| (driver.id(), BackendEntry { driver, state }))
            .collect();

        Self {
            config,
            backends,
            nodes: BTreeMap::new(),
        }
    }

    fn status(&self) -> ManagerStatus {
        ManagerStatus {
            backends: self.backends.keys().cloned().collect(),
            nodes: self.nodes.keys().cloned().collect(),
        }
    }

    /// Look up a node and the driver that owns it.
    fn lookup(&mut self, name: &NodeName) -> Result<(&dyn DynBackend, &BackendId, &mut Opaque)> {
        let Some(node) = self.nodes.get_mut(name) else {
            error!(node = %name, "Operation on a node that was never set up");
            return Err(HarnessError::NodeNotFound(name.clone()));
        };
        let entry = self
            .backends
            .get(&node.backend)
            .ok_or_else(|| HarnessError::BackendNotProvided(node.backend.clone()))?;
        Ok((&*entry.driver, &node.backend, &mut node.state))
    }

    // -------------------------------------------------------------------------
    // Setup
    // -------------------------------------------------------------------------

    async fn setup_nodes(&mut self, specs: Vec<NodeSpec>) -> Result<()> {
        if let Some(spec) = specs.iter().find(|s| !self.backends.contains_key(&s.backend)) {
            error!(node = %spec.name, backend = %spec.backend, "Backend not provided");
            return Err(HarnessError::BackendNotProvided(spec.backend.clone()));
        }

        info!(count = specs.len(), registered = self.nodes.len(), "Setting up nodes");

        let mut prepared = Vec::with_capacity(specs.len());
        for spec in specs {
            let entry = &self.backends[&spec.backend];
            let name = spec.name.clone();
            let backend = spec.backend.clone();
            let peers = spec.peers.clone();

            let opaque = guarded(entry.driver.prepare_spec(spec, &entry.state))
                .await
                .map_err(|e| dispatch_error(e, &name, &backend, "prepare_spec"))?;

            prepared.push(PreparedNode {
                name,
                backend,
                peers,
                prepared: opaque,
            });
        }

        let mut book = AddressBook::new();
        for node in &prepared {
            let entry = &self.backends[&node.backend];
            let address =
                guarded_sync(|| entry.driver.peer_from_spec(&node.prepared, &entry.state))
                .map_err(|e| dispatch_error(e, &node.name, &node.backend, "peer_from_spec"))?;
            book.add_pending(node.name.clone(), address);
        }
        for (name, node) in &self.nodes {
            let entry = &self.backends[&node.backend];
            let address = guarded_sync(|| entry.driver.get_peer_address(&node.state))
                .map_err(|e| dispatch_error(e, name, &node.backend, "get_peer_address"))?;
            book.add_registered(name.clone(), address);
        }

        // Resolve everything before touching the registry.
        let resolved = prepared
            .iter()
            .map(|node| book.resolve(&node.name, &node.peers))
            .collect::<Result<Vec<_>>>()?;

        for (node, peers) in prepared.into_iter().zip(resolved) {
            let Some(entry) = self.backends.get_mut(&node.backend) else {
                return Err(HarnessError::BackendNotProvided(node.backend.clone()));
            };

            debug!(node = %node.name, backend = %node.backend, peers = ?peers, "Setting up node");

            let setup = entry.driver.setup_node(node.prepared, peers, &mut entry.state);
            let state = guarded(setup)
                .await
                .map_err(|e| dispatch_error(e, &node.name, &node.backend, "setup_node"))?;

            let replaced = self.nodes.insert(
                node.name.clone(),
                ManagedNode {
                    backend: node.backend.clone(),
                    state,
                },
            );
            if replaced.is_some() {
                warn!(node = %node.name, "Replaced registered node without tearing it down");
            }
            info!(node = %node.name, backend = %node.backend, "Node set up");
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Per-node operations
    // -------------------------------------------------------------------------

    async fn start_node(&mut self, name: &NodeName) -> Result<()> {
        let (driver, backend, state) = self.lookup(name)?;
        guarded(driver.start_node(state))
            .await
            .map_err(|e| dispatch_error(e, name, backend, "start_node"))?;
        info!(node = %name, "Node started");
        Ok(())
    }

    async fn stop_node(&mut self, name: &NodeName, soft_timeout: Duration) -> Result<()> {
        let (driver, backend, state) = self.lookup(name)?;
        guarded(driver.stop_node(state, soft_timeout))
            .await
            .map_err(|e| dispatch_error(e, name, backend, "stop_node"))?;
        info!(node = %name, soft_timeout_ms = soft_timeout.as_millis() as u64, "Node stopped");
        Ok(())
    }

    async fn kill_node(&mut self, name: &NodeName) -> Result<()> {
        let (driver, backend, state) = self.lookup(name)?;
        guarded(driver.kill_node(state))
            .await
            .map_err(|e| dispatch_error(e, name, backend, "kill_node"))?;
        info!(node = %name, "Node killed");
        Ok(())
    }

    async fn get_service_address(&mut self, name: &NodeName, service: &str) -> Result<Address> {
        let (driver, backend, state) = self.lookup(name)?;
        guarded(driver.get_service_address(service, state))
            .await
            .map_err(|e| dispatch_error(e, name, backend, "get_service_address"))
    }

    async fn get_node_pubkey(&mut self, name: &NodeName) -> Result<PublicKey> {
        let (driver, backend, state) = self.lookup(name)?;
        guarded(driver.get_node_pubkey(state))
            .await
            .map_err(|e| dispatch_error(e, name, backend, "get_node_pubkey"))
    }

    async fn run_cmd(
        &mut self,
        name: &NodeName,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<CmdOutput> {
        let (driver, backend, state) = self.lookup(name)?;
        debug!(
            node = %name,
            cmd = ?cmd,
            timeout_ms = timeout.as_millis() as u64,
            "Running command"
        );

        guarded(driver.run_cmd_in_node_dir(state, cmd, timeout))
            .await
            .map_err(|e| {
                if e.downcast_ref::<CommandTimedOut>().is_some() {
                    warn!(node = %name, cmd = ?cmd, "Command timed out");
                    HarnessError::CommandTimeout {
                        node: name.clone(),
                        timeout,
                    }
                } else {
                    dispatch_error(e, name, backend, "run_cmd_in_node_dir")
                }
            })
    }

    async fn extract_archive(
        &mut self,
        name: &NodeName,
        path: &Path,
        archive: Bytes,
    ) -> Result<()> {
        let (driver, backend, state) = self.lookup(name)?;
        debug!(node = %name, path = %path.display(), bytes = archive.len(), "Extracting archive");
        guarded(driver.extract_archive(state, path, archive))
            .await
            .map_err(|e| dispatch_error(e, name, backend, "extract_archive"))
    }

    async fn connect_node(&mut self, name: &NodeName, network: &str) -> Result<()> {
        let (driver, backend, state) = self.lookup(name)?;
        guarded(driver.connect_node(network, state))
            .await
            .map_err(|e| dispatch_error(e, name, backend, "connect_node"))?;
        info!(node = %name, network, "Node connected");
        Ok(())
    }

    async fn disconnect_node(&mut self, name: &NodeName, network: &str) -> Result<()> {
        let (driver, backend, state) = self.lookup(name)?;
        guarded(driver.disconnect_node(network, state))
            .await
            .map_err(|e| dispatch_error(e, name, backend, "disconnect_node"))?;
        info!(node = %name, network, "Node disconnected");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Batch operations
    // -------------------------------------------------------------------------

    async fn dump_logs(&mut self) -> Result<()> {
        let mut failures = Vec::new();

        for (name, node) in &self.nodes {
            let Some(entry) = self.backends.get(&node.backend) else {
                continue;
            };
            if let Err(e) = guarded(entry.driver.node_logs(&node.state)).await {
                warn!(node = %name, error = %e, "Failed to dump node logs");
                failures.push(ItemFailure::new(name.as_str(), &e));
            }
        }

        if failures.is_empty() {
            debug!(nodes = self.nodes.len(), "Dumped node logs");
            Ok(())
        } else {
            Err(HarnessError::DumpLogs { failures })
        }
    }

    async fn scan_logs(&self) -> LogScan {
        let policy = &self.config.log_scan;
        let mut findings = Vec::with_capacity(self.nodes.len());

        for (name, node) in &self.nodes {
            let Some(entry) = self.backends.get(&node.backend) else {
                continue;
            };
            let log_dir = match guarded_sync(|| entry.driver.get_log_path(&node.state)) {
                Ok(dir) => dir,
                Err(e) => {
                    findings.push((name.clone(), vec![format!("no log path: {e:#}")]));
                    continue;
                }
            };

            let lines = policy.scan_dir(&log_dir).await;
            if !lines.is_empty() {
                self.config
                    .log_sink
                    .log(&format!("Errors in logs of node {name}:\n{}", lines.join("\n")));
                warn!(node = %name, count = lines.len(), "Errors found in node log");
            }
            findings.push((name.clone(), lines));
        }

        LogScan::from_findings(findings)
    }

    /// Stop and delete every node, then stop every backend. Never stops early.
    async fn teardown(&mut self) -> Teardown {
        let mut report = Teardown::default();
        let nodes = std::mem::take(&mut self.nodes);

        if self.config.keep_nodes && !nodes.is_empty() {
            warn!(count = nodes.len(), "keep_nodes is set, leaving nodes running");
        }

        for (name, node) in nodes {
            if self.config.keep_nodes {
                report.kept_nodes.push(name);
                continue;
            }

            let Some(entry) = self.backends.get(&node.backend) else {
                report.failures.push(ItemFailure {
                    target: name.to_string(),
                    message: format!("backend {} not provided", node.backend),
                });
                continue;
            };

            let mut state = node.state;
            if let Err(e) = guarded(entry.driver.stop_node(&mut state, Duration::ZERO)).await {
                warn!(node = %name, error = %e, "Failed to stop node during teardown");
                report.failures.push(ItemFailure::new(name.as_str(), &e));
            }
            if let Err(e) = guarded(entry.driver.delete_node(state)).await {
                warn!(node = %name, error = %e, "Failed to delete node during teardown");
                report.failures.push(ItemFailure::new(name.as_str(), &e));
            }
        }

        for (id, entry) in std::mem::take(&mut self.backends) {
            if let Err(e) = guarded(entry.driver.stop(entry.state)).await {
                warn!(backend = %id, error = %e, "Failed to stop backend");
                report
                    .failures
                    .push(ItemFailure::new(format!("backend {id}"), &e));
            }
        }

        for failure in &report.failures {
            self.config
                .log_sink
                .log(&format!("Teardown failed for {failure}"));
        }

        report
    }

    async fn cleanup(&mut self) -> CleanupReport {
        info!(
            nodes = self.nodes.len(),
            backends = self.backends.len(),
            keep_nodes = self.config.keep_nodes,
            "Cleaning up"
        );

        let log_scan = self.scan_logs().await;
        let teardown = self.teardown().await;

        info!(
            log_errors = !log_scan.is_clean(),
            teardown_failures = teardown.failures.len(),
            "Cleanup complete"
        );

        CleanupReport { log_scan, teardown }
    }
}

fn reply<T>(tx: oneshot::Sender<T>, value: T) {
    // The caller may have timed out and gone away.
    let _ = tx.send(value);
}

#[async_trait]
impl Actor for NodeManagerActor {
    type Message = ManagerMessage;

    fn name(&self) -> &str {
        "node_manager"
    }

    async fn handle(
        &mut self,
        msg: ManagerMessage,
        _ctx: &mut ActorContext,
    ) -> std::result::Result<bool, ActorError> {
        match msg {
            ManagerMessage::SetupNodes { specs, reply: tx } => {
                reply(tx, self.setup_nodes(specs).await);
            }
            ManagerMessage::StartNode { name, reply: tx } => {
                reply(tx, self.start_node(&name).await);
            }
            ManagerMessage::StopNode {
                name,
                soft_timeout,
                reply: tx,
            } => {
                reply(tx, self.stop_node(&name, soft_timeout).await);
            }
            ManagerMessage::KillNode { name, reply: tx } => {
                reply(tx, self.kill_node(&name).await);
            }
            ManagerMessage::GetServiceAddress {
                name,
                service,
                reply: tx,
            } => {
                reply(tx, self.get_service_address(&name, &service).await);
            }
            ManagerMessage::GetNodePubkey { name, reply: tx } => {
                reply(tx, self.get_node_pubkey(&name).await);
            }
            ManagerMessage::RunCmd {
                name,
                cmd,
                timeout,
                reply: tx,
            } => {
                reply(tx, self.run_cmd(&name, &cmd, timeout).await);
            }
            ManagerMessage::ExtractArchive {
                name,
                path,
                archive,
                reply: tx,
            } => {
                reply(tx, self.extract_archive(&name, &path, archive).await);
            }
            ManagerMessage::ConnectNode {
                name,
                network,
                reply: tx,
            } => {
                reply(tx, self.connect_node(&name, &network).await);
            }
            ManagerMessage::DisconnectNode {
                name,
                network,
                reply: tx,
            } => {
                reply(tx, self.disconnect_node(&name, &network).await);
            }
            ManagerMessage::DumpLogs { reply: tx } => {
                reply(tx, self.dump_logs().await);
            }
            ManagerMessage::Cleanup { reply: tx } => {
                reply(tx, self.cleanup().await);
            }
            ManagerMessage::Status { reply: tx } => {
                reply(tx, self.status());
            }
            ManagerMessage::Shutdown { reply: tx } => {
                reply(tx, self.teardown().await);
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        if self.nodes.is_empty() && self.backends.is_empty() {
            return;
        }

        info!(
            nodes = self.nodes.len(),
            backends = self.backends.len(),
            "Node manager stopping, tearing down"
        );
        let teardown = self.teardown().await;
        if !teardown.failures.is_empty() {
            warn!(failures = teardown.failures.len(), "Teardown on stop had failures");
        }
    }
}
