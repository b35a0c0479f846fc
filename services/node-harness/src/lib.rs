//! Node lifecycle manager for blockchain integration tests.
//!
//! A test describes the nodes it needs as [`NodeSpec`]s. The manager hands
//! each spec to the backend that owns it (containers, local processes, ...),
//! resolves peers that name other nodes, and keeps a registry of everything
//! it created so that cleanup can tear it all down at the end of the test.
//!
//! ## Architecture
//!
//! ```text
//! NodeManager (cloneable handle)
//! └── NodeManagerActor         (single control point)
//!     ├── backend registry     (BackendId -> driver + state)
//!     └── node registry        (NodeName  -> backend + node state)
//! ```
//!
//! ## Modules
//!
//! - `actors`: Actor framework and the node manager actor
//! - `backend`: Backend capability contract and the in-memory mock backend
//! - `logscan`: Error scan over node logs at cleanup
//! - `scenario`: TOML scenario files used by the CLI

pub mod actors;
pub mod backend;
pub mod config;
pub mod error;
pub mod logscan;
pub mod manager;
pub mod node;
pub mod peers;
pub mod scenario;

// Re-export commonly used types
pub use actors::{CleanupReport, ManagerStatus, Teardown};
pub use backend::{Backend, MockBackend};
pub use config::{LogSink, ManagerConfig};
pub use error::{HarnessError, Result};
pub use logscan::{LogScan, LogScanPolicy};
pub use manager::{NodeManager, NodeManagerBuilder};
pub use node::{Address, BackendId, CmdOutput, NodeName, NodeSpec, Peer, PublicKey, Source};
