//! Scenario files for the `node-harness` binary.
//!
//! A scenario is a TOML document listing the nodes to set up and the
//! services to query once they are running:
//!
//! ```toml
//! test_id = "sync_two_nodes"
//! services = ["sync", "ext_http"]
//!
//! [[nodes]]
//! name = "node1"
//! backend = "mock"
//! source = { image = "aeternity/aeternity:latest" }
//!
//! [[nodes]]
//! name = "node2"
//! backend = "mock"
//! peers = ["node1"]
//! source = { image = "aeternity/aeternity:latest" }
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::node::NodeSpec;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Overrides the configured test ID when set.
    #[serde(default)]
    pub test_id: Option<String>,

    /// Services whose addresses `run` prints for every node.
    #[serde(default)]
    pub services: Vec<String>,

    pub nodes: Vec<NodeSpec>,
}

impl Scenario {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let scenario: Scenario = toml::from_str(contents).context("invalid scenario TOML")?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario: {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("failed to load scenario: {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("scenario defines no nodes");
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(&node.name) {
                bail!("node {} is defined twice", node.name);
            }
        }
        Ok(())
    }

    /// Distinct backend IDs used by the scenario's nodes, in first-use order.
    pub fn backends(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.nodes
            .iter()
            .map(|n| n.backend.as_str())
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Peer, Source};

    const TWO_NODES: &str = r#"
test_id = "sync_two_nodes"
services = ["sync", "ext_http"]

[[nodes]]
name = "node1"
backend = "mock"
source = { image = "aeternity/aeternity:latest" }

[[nodes]]
name = "node2"
backend = "mock"
peers = ["node1", { address = "aenode://pk@10.0.0.9:3015" }]
source = { host = "/opt/aeternity" }
"#;

    #[test]
    fn test_parse_scenario() {
        let scenario = Scenario::from_toml_str(TWO_NODES).unwrap();

        assert_eq!(scenario.test_id.as_deref(), Some("sync_two_nodes"));
        assert_eq!(scenario.services, vec!["sync", "ext_http"]);
        assert_eq!(scenario.nodes.len(), 2);
        assert_eq!(scenario.nodes[1].peers[0], Peer::node("node1"));
        assert_eq!(
            scenario.nodes[1].source,
            Source::Host("/opt/aeternity".into())
        );
        assert_eq!(scenario.backends(), vec!["mock"]);
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let contents = r#"
[[nodes]]
name = "node1"
backend = "mock"
source = { image = "a" }

[[nodes]]
name = "node1"
backend = "mock"
source = { image = "b" }
"#;
        let err = Scenario::from_toml_str(contents).unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[test]
    fn test_empty_scenario_rejected() {
        assert!(Scenario::from_toml_str("nodes = []").is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let contents = r#"
nodez = []
"#;
        assert!(Scenario::from_toml_str(contents).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Scenario::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read scenario"));
    }
}
