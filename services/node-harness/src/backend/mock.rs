//! In-memory backend for tests and dry runs.
//!
//! Nodes are tracked as phases in memory and never run anything. The only
//! filesystem side effects are a per-node log directory under
//! `<temp_dir>/<test_id>/<backend id>/` and exported logs under
//! `<data_dir>/logs/<test_id>/`.
//!
//! Clones share one inventory, so a test can keep a clone of the backend it
//! handed to the manager and inspect what the manager asked for.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{Backend, CommandTimedOut};
use crate::config::ManagerConfig;
use crate::node::{Address, BackendId, CmdOutput, NodeName, NodeSpec, PublicKey};

/// Port every mock node listens on for peer connections.
pub const MOCK_SYNC_PORT: u16 = 3015;

/// Services a mock node exposes, with their ports.
const MOCK_SERVICES: &[(&str, u16)] = &[
    ("sync", MOCK_SYNC_PORT),
    ("ext_http", 3013),
    ("int_http", 3113),
    ("ws", 3014),
];

/// Phase of a mock node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockPhase {
    Created,
    Running,
    Stopped,
    Killed,
}

/// Shared record of what the mock backend has been asked to do.
#[derive(Debug, Clone, Default)]
pub struct MockInventory {
    /// Whether `start` has been called without a matching `stop`.
    pub backend_running: bool,

    /// Resources that exist, by resource ID. Replaced nodes stay here until
    /// they are deleted.
    pub live: BTreeMap<u64, NodeName>,

    /// Resolved peers passed to `setup_node`, by node.
    pub peers: BTreeMap<NodeName, Vec<Address>>,

    /// Networks each node is attached to.
    pub networks: BTreeMap<NodeName, BTreeSet<String>>,

    /// Operation log, one `op:node` entry per call.
    pub calls: Vec<String>,
}

impl MockInventory {
    /// Number of live resources for a node name.
    pub fn live_count(&self, name: &str) -> usize {
        self.live.values().filter(|n| n.as_str() == name).count()
    }
}

#[derive(Debug, Default)]
struct Shared {
    inventory: Mutex<MockInventory>,
    fail_ops: Mutex<HashSet<&'static str>>,
    panic_ops: Mutex<HashSet<&'static str>>,
    resource_counter: AtomicU64,
}

/// Mock backend.
#[derive(Debug, Clone)]
pub struct MockBackend {
    id: BackendId,
    shared: Arc<Shared>,
}

/// Backend-wide state of the mock.
#[derive(Debug)]
pub struct MockState {
    test_id: String,
    log_root: PathBuf,
    export_dir: PathBuf,
}

/// A prepared mock node.
#[derive(Debug)]
pub struct MockPrepared {
    spec: NodeSpec,
    pubkey: PublicKey,
}

/// Per-node state of the mock.
#[derive(Debug)]
pub struct MockNode {
    pub name: NodeName,
    pub resource_id: u64,
    pub phase: MockPhase,
    pub peers: Vec<Address>,
    pub networks: BTreeSet<String>,
    pub extracted: BTreeMap<PathBuf, usize>,
    pubkey: PublicKey,
    log_dir: PathBuf,
    export_dir: PathBuf,
}

impl MockBackend {
    /// Create a mock backend registered under `"mock"`.
    pub fn new() -> Self {
        Self::with_id("mock")
    }

    /// Create a mock backend registered under a custom ID.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: BackendId::new(id),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Make every future call of `op` fail.
    pub fn fail_on(&self, op: &'static str) {
        lock(&self.shared.fail_ops).insert(op);
    }

    /// Make every future call of `op` panic, as a buggy driver would.
    pub fn panic_on(&self, op: &'static str) {
        lock(&self.shared.panic_ops).insert(op);
    }

    /// Snapshot of the shared inventory.
    pub fn inventory(&self) -> MockInventory {
        lock(&self.shared.inventory).clone()
    }

    fn record(&self, op: &str, node: &NodeName) -> Result<()> {
        lock(&self.shared.inventory)
            .calls
            .push(format!("{op}:{node}"));
        if lock(&self.shared.fail_ops).contains(op) {
            bail!("mock {op} configured to fail");
        }
        let panics = lock(&self.shared.panic_ops).contains(op);
        if panics {
            panic!("mock {op} configured to panic");
        }
        Ok(())
    }

    fn next_resource_id(&self) -> u64 {
        self.shared.resource_counter.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Derive a stable identity key from the test and node names.
fn derive_pubkey(test_id: &str, name: &NodeName) -> PublicKey {
    let mut hasher = Sha256::new();
    hasher.update(test_id.as_bytes());
    hasher.update(b"/");
    hasher.update(name.as_str().as_bytes());
    PublicKey::from_bytes(hasher.finalize().to_vec())
}

fn peer_address(name: &NodeName, pubkey: &PublicKey) -> Address {
    Address::new(format!("mock://{}@{}:{}", pubkey.to_hex(), name, MOCK_SYNC_PORT))
}

/// Parse a `sleep` operand in seconds. Rejects values a `Duration` cannot hold.
fn parse_sleep(arg: &str) -> std::result::Result<Duration, String> {
    arg.parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| format!("sleep: invalid time interval '{arg}'\n"))
}

fn require_phase(node: &MockNode, phase: MockPhase, op: &str) -> Result<()> {
    if node.phase != phase {
        bail!("{op}: node {} is {:?}, not {:?}", node.name, node.phase, phase);
    }
    Ok(())
}

#[async_trait]
impl Backend for MockBackend {
    type State = MockState;
    type Prepared = MockPrepared;
    type Node = MockNode;

    fn id(&self) -> BackendId {
        self.id.clone()
    }

    async fn start(&self, config: &ManagerConfig) -> Result<MockState> {
        if lock(&self.shared.fail_ops).contains("start") {
            bail!("mock start configured to fail");
        }

        let log_root = config
            .temp_dir
            .join(&config.test_id)
            .join(self.id.as_str());
        let export_dir = config.data_dir.join("logs").join(&config.test_id);

        info!(backend = %self.id, log_root = %log_root.display(), "[MOCK] Backend started");
        lock(&self.shared.inventory).backend_running = true;

        Ok(MockState {
            test_id: config.test_id.clone(),
            log_root,
            export_dir,
        })
    }

    async fn stop(&self, state: MockState) -> Result<()> {
        if lock(&self.shared.fail_ops).contains("stop") {
            bail!("mock stop configured to fail");
        }

        info!(backend = %self.id, test_id = %state.test_id, "[MOCK] Backend stopped");
        lock(&self.shared.inventory).backend_running = false;
        Ok(())
    }

    async fn prepare_spec(&self, spec: NodeSpec, state: &MockState) -> Result<MockPrepared> {
        self.record("prepare_spec", &spec.name)?;
        let pubkey = derive_pubkey(&state.test_id, &spec.name);
        Ok(MockPrepared { spec, pubkey })
    }

    fn peer_from_spec(&self, spec: &MockPrepared, _state: &MockState) -> Result<Address> {
        Ok(peer_address(&spec.spec.name, &spec.pubkey))
    }

    fn get_peer_address(&self, node: &MockNode) -> Result<Address> {
        Ok(peer_address(&node.name, &node.pubkey))
    }

    async fn setup_node(
        &self,
        spec: MockPrepared,
        peers: Vec<Address>,
        state: &mut MockState,
    ) -> Result<MockNode> {
        let name = spec.spec.name.clone();
        self.record("setup_node", &name)?;

        let log_dir = state.log_root.join(name.as_str());
        tokio::fs::create_dir_all(&log_dir)
            .await
            .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;

        let resource_id = self.next_resource_id();
        {
            let mut inventory = lock(&self.shared.inventory);
            inventory.live.insert(resource_id, name.clone());
            inventory.peers.insert(name.clone(), peers.clone());
            inventory.networks.insert(name.clone(), BTreeSet::new());
        }

        debug!(node = %name, resource_id, peers = peers.len(), "[MOCK] Node created");

        Ok(MockNode {
            name,
            resource_id,
            phase: MockPhase::Created,
            peers,
            networks: BTreeSet::new(),
            extracted: BTreeMap::new(),
            pubkey: spec.pubkey,
            log_dir,
            export_dir: state.export_dir.clone(),
        })
    }

    async fn start_node(&self, node: &mut MockNode) -> Result<()> {
        self.record("start_node", &node.name)?;
        if node.phase == MockPhase::Running {
            bail!("node {} is already running", node.name);
        }
        node.phase = MockPhase::Running;
        info!(node = %node.name, "[MOCK] Node started");
        Ok(())
    }

    async fn stop_node(&self, node: &mut MockNode, soft_timeout: Duration) -> Result<()> {
        self.record("stop_node", &node.name)?;
        if node.phase == MockPhase::Running {
            node.phase = MockPhase::Stopped;
        }
        info!(
            node = %node.name,
            soft_timeout_ms = soft_timeout.as_millis() as u64,
            "[MOCK] Node stopped"
        );
        Ok(())
    }

    async fn kill_node(&self, node: &mut MockNode) -> Result<()> {
        self.record("kill_node", &node.name)?;
        node.phase = MockPhase::Killed;
        info!(node = %node.name, "[MOCK] Node killed");
        Ok(())
    }

    async fn delete_node(&self, node: MockNode) -> Result<()> {
        self.record("delete_node", &node.name)?;
        let mut inventory = lock(&self.shared.inventory);
        inventory.live.remove(&node.resource_id);
        if inventory.live_count(node.name.as_str()) == 0 {
            inventory.networks.remove(&node.name);
        }
        debug!(node = %node.name, resource_id = node.resource_id, "[MOCK] Node deleted");
        Ok(())
    }

    async fn get_service_address(&self, service: &str, node: &MockNode) -> Result<Address> {
        require_phase(node, MockPhase::Running, "get_service_address")?;
        let (_, port) = MOCK_SERVICES
            .iter()
            .find(|(name, _)| *name == service)
            .ok_or_else(|| anyhow!("unknown service {service:?}"))?;

        if service == "sync" {
            Ok(peer_address(&node.name, &node.pubkey))
        } else {
            Ok(Address::new(format!("http://{}:{}/", node.name, port)))
        }
    }

    async fn get_node_pubkey(&self, node: &MockNode) -> Result<PublicKey> {
        Ok(node.pubkey.clone())
    }

    fn get_log_path(&self, node: &MockNode) -> PathBuf {
        node.log_dir.clone()
    }

    async fn node_logs(&self, node: &MockNode) -> Result<()> {
        self.record("node_logs", &node.name)?;

        tokio::fs::create_dir_all(&node.export_dir)
            .await
            .with_context(|| format!("failed to create {}", node.export_dir.display()))?;

        let source = node.log_dir.join(crate::logscan::DEFAULT_LOG_FILE);
        let target = node.export_dir.join(format!("{}.log", node.name));
        match tokio::fs::copy(&source, &target).await {
            Ok(bytes) => {
                debug!(
                    node = %node.name,
                    bytes,
                    target = %target.display(),
                    "[MOCK] Logs exported"
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(node = %node.name, "[MOCK] No log file to export");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("failed to export {}", source.display())),
        }
    }

    async fn run_cmd_in_node_dir(
        &self,
        node: &mut MockNode,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<CmdOutput> {
        self.record("run_cmd_in_node_dir", &node.name)?;
        require_phase(node, MockPhase::Running, "run_cmd_in_node_dir")?;

        let program = cmd.first().ok_or_else(|| anyhow!("empty command"))?;
        let args = &cmd[1..];

        let run = async {
            match program.as_str() {
                "echo" => CmdOutput {
                    exit_code: 0,
                    output: format!("{}\n", args.join(" ")),
                },
                "sleep" => match args.first().map(|arg| parse_sleep(arg)) {
                    Some(Ok(duration)) => {
                        tokio::time::sleep(duration).await;
                        CmdOutput {
                            exit_code: 0,
                            output: String::new(),
                        }
                    }
                    Some(Err(output)) => CmdOutput {
                        exit_code: 1,
                        output,
                    },
                    None => CmdOutput {
                        exit_code: 1,
                        output: "sleep: missing operand\n".to_string(),
                    },
                },
                "false" => CmdOutput {
                    exit_code: 1,
                    output: String::new(),
                },
                other => CmdOutput {
                    exit_code: 127,
                    output: format!("{other}: command not found\n"),
                },
            }
        };

        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| anyhow::Error::new(CommandTimedOut(timeout)))
    }

    async fn extract_archive(
        &self,
        node: &mut MockNode,
        path: &Path,
        archive: Bytes,
    ) -> Result<()> {
        self.record("extract_archive", &node.name)?;
        if archive.is_empty() {
            bail!("empty archive for {}", path.display());
        }
        node.extracted.insert(path.to_path_buf(), archive.len());
        Ok(())
    }

    async fn connect_node(&self, network: &str, node: &mut MockNode) -> Result<()> {
        self.record("connect_node", &node.name)?;
        if !node.networks.insert(network.to_string()) {
            bail!("node {} is already connected to {network}", node.name);
        }
        lock(&self.shared.inventory)
            .networks
            .insert(node.name.clone(), node.networks.clone());
        Ok(())
    }

    async fn disconnect_node(&self, network: &str, node: &mut MockNode) -> Result<()> {
        self.record("disconnect_node", &node.name)?;
        if !node.networks.remove(network) {
            bail!("node {} is not connected to {network}", node.name);
        }
        lock(&self.shared.inventory)
            .networks
            .insert(node.name.clone(), node.networks.clone());
        Ok(())
    }
}
