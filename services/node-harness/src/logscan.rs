//! Error scan over node log files, run before cleanup tears nodes down.
//!
//! The scan is advisory: it reports what it found and never stops cleanup.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::node::NodeName;

/// Log file name expected inside each node's log directory.
pub const DEFAULT_LOG_FILE: &str = "node.log";

/// Marker that flags a log line as an error.
pub const DEFAULT_ERROR_MARKER: &str = "[error]";

/// Which files to read and which lines count as errors.
#[derive(Debug, Clone)]
pub struct LogScanPolicy {
    /// File name inside the backend-reported log directory.
    pub file_name: String,

    /// Substring marking an error line.
    pub error_marker: String,

    /// Error lines matching every substring of any rule are ignored.
    pub benign: Vec<Vec<String>>,
}

impl Default for LogScanPolicy {
    fn default() -> Self {
        Self {
            file_name: DEFAULT_LOG_FILE.to_string(),
            error_marker: DEFAULT_ERROR_MARKER.to_string(),
            // The sync watchdog logs its workers' exits at error level.
            benign: vec![vec!["watchdog".to_string(), "exited".to_string()]],
        }
    }
}

impl LogScanPolicy {
    /// Error lines of `contents` that no benign rule covers.
    pub fn error_lines(&self, contents: &str) -> Vec<String> {
        contents
            .lines()
            .filter(|line| line.contains(&self.error_marker))
            .filter(|line| !self.is_benign(line))
            .map(str::to_string)
            .collect()
    }

    fn is_benign(&self, line: &str) -> bool {
        self.benign
            .iter()
            .any(|rule| !rule.is_empty() && rule.iter().all(|part| line.contains(part.as_str())))
    }

    /// Scan the log file in `log_dir`. A missing file scans clean.
    pub async fn scan_dir(&self, log_dir: &Path) -> Vec<String> {
        let path = log_dir.join(&self.file_name);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => self.error_lines(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No log file to scan");
                Vec::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read log file");
                vec![format!("unable to read {}: {e}", path.display())]
            }
        }
    }
}

/// Outcome of a log scan across all nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogScan {
    #[default]
    Clean,
    /// Unfiltered error lines by node.
    Errors(BTreeMap<NodeName, Vec<String>>),
}

impl LogScan {
    pub fn is_clean(&self) -> bool {
        matches!(self, LogScan::Clean)
    }

    /// Build a scan result from per-node findings, dropping nodes without any.
    pub fn from_findings(findings: impl IntoIterator<Item = (NodeName, Vec<String>)>) -> Self {
        let errors: BTreeMap<_, _> = findings
            .into_iter()
            .filter(|(_, lines)| !lines.is_empty())
            .collect();

        if errors.is_empty() {
            LogScan::Clean
        } else {
            LogScan::Errors(errors)
        }
    }

    /// Names of nodes with findings.
    pub fn nodes(&self) -> Vec<String> {
        match self {
            LogScan::Clean => Vec::new(),
            LogScan::Errors(errors) => errors.keys().map(ToString::to_string).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_LOG: &str = "\
2024-01-01 12:00:00.000 [info] <0.1.0> started
2024-01-01 12:00:01.000 [error] <0.2.0> chain sync failed: timeout
2024-01-01 12:00:02.000 [error] <0.3.0> watchdog: worker sync_task exited with reason shutdown
2024-01-01 12:00:03.000 [warning] <0.4.0> slow peer
";

    #[test]
    fn test_error_lines_filters_benign() {
        let policy = LogScanPolicy::default();
        let lines = policy.error_lines(SAMPLE_LOG);

        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("chain sync failed"));
    }

    #[test]
    fn test_empty_rule_ignores_nothing() {
        let policy = LogScanPolicy {
            benign: vec![vec![]],
            ..LogScanPolicy::default()
        };
        assert_eq!(policy.error_lines(SAMPLE_LOG).len(), 2);
    }

    #[tokio::test]
    async fn test_scan_dir_missing_file_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let policy = LogScanPolicy::default();
        assert!(policy.scan_dir(dir.path()).await.is_empty());
    }

    #[tokio::test]
    async fn test_scan_dir_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_LOG_FILE), SAMPLE_LOG).unwrap();

        let lines = LogScanPolicy::default().scan_dir(dir.path()).await;
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn test_from_findings() {
        assert!(LogScan::from_findings(vec![("node1".into(), vec![])]).is_clean());

        let scan = LogScan::from_findings(vec![
            ("node1".into(), vec![]),
            ("node2".into(), vec!["[error] boom".to_string()]),
        ]);
        assert!(!scan.is_clean());
        assert_eq!(scan.nodes(), vec!["node2".to_string()]);
    }
}
