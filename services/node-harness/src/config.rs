//! Configuration for the node lifecycle manager.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{HarnessError, Result};
use crate::logscan::LogScanPolicy;

/// Test ID used when the caller does not provide one.
pub const DEFAULT_TEST_ID: &str = "default";

/// Default time a caller waits for the manager to answer.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default mailbox capacity of the manager actor.
pub const DEFAULT_MAILBOX_SIZE: usize = 64;

/// Sink for diagnostic text meant for the test's own output.
#[derive(Clone)]
pub struct LogSink(Arc<dyn Fn(&str) + Send + Sync>);

impl LogSink {
    pub fn new(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// A sink that drops everything.
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    pub fn log(&self, text: &str) {
        (self.0)(text)
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::discard()
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LogSink")
    }
}

/// Node lifecycle manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory backends use for persistent test data.
    pub data_dir: PathBuf,

    /// Directory backends use for scratch files.
    pub temp_dir: PathBuf,

    /// Identifier of the running test, used by backends to label resources.
    pub test_id: String,

    /// Where diagnostic text (log scan findings, teardown failures) goes.
    pub log_sink: LogSink,

    /// Leave nodes running at cleanup for post-mortem debugging.
    pub keep_nodes: bool,

    /// How cleanup scans node logs for errors.
    pub log_scan: LogScanPolicy,

    /// How long callers wait for the manager to answer.
    pub call_timeout: Duration,

    /// Mailbox capacity of the manager actor.
    pub mailbox_size: usize,
}

impl ManagerConfig {
    /// Create a configuration with the required directories and defaults.
    pub fn new(data_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            temp_dir: temp_dir.into(),
            test_id: DEFAULT_TEST_ID.to_string(),
            log_sink: LogSink::discard(),
            keep_nodes: false,
            log_scan: LogScanPolicy::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            mailbox_size: DEFAULT_MAILBOX_SIZE,
        }
    }

    pub fn with_test_id(mut self, test_id: impl Into<String>) -> Self {
        self.test_id = test_id.into();
        self
    }

    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn with_keep_nodes(mut self, keep: bool) -> Self {
        self.keep_nodes = keep;
        self
    }

    pub fn with_log_scan(mut self, policy: LogScanPolicy) -> Self {
        self.log_scan = policy;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// `HARNESS_DATA_DIR` and `HARNESS_TEMP_DIR` are required.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Apply whichever `HARNESS_*` variables are set on top of this
    /// configuration. Unset variables keep the current values.
    pub fn with_env(self) -> Result<Self> {
        self.overlay(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = lookup("HARNESS_DATA_DIR")
            .ok_or_else(|| HarnessError::InvalidConfig("HARNESS_DATA_DIR is not set".into()))?;
        let temp_dir = lookup("HARNESS_TEMP_DIR")
            .ok_or_else(|| HarnessError::InvalidConfig("HARNESS_TEMP_DIR is not set".into()))?;

        Self::new(data_dir, temp_dir).overlay(lookup)
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = lookup("HARNESS_DATA_DIR") {
            self.data_dir = dir.into();
        }
        if let Some(dir) = lookup("HARNESS_TEMP_DIR") {
            self.temp_dir = dir.into();
        }
        if let Some(test_id) = lookup("HARNESS_TEST_ID") {
            self.test_id = test_id;
        }

        if let Some(secs) = lookup("HARNESS_CALL_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                HarnessError::InvalidConfig(format!("HARNESS_CALL_TIMEOUT_SECS: {secs:?}"))
            })?;
            self.call_timeout = Duration::from_secs(secs);
        }

        if let Some(keep) = lookup("HARNESS_KEEP_NODES") {
            self.keep_nodes = is_affirmative(&keep);
        }

        self.validate()?;
        Ok(self)
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(HarnessError::InvalidConfig("data_dir is empty".into()));
        }
        if self.temp_dir.as_os_str().is_empty() {
            return Err(HarnessError::InvalidConfig("temp_dir is empty".into()));
        }
        if self.mailbox_size == 0 {
            return Err(HarnessError::InvalidConfig("mailbox_size must be > 0".into()));
        }
        Ok(())
    }
}

/// Whether an environment value turns a toggle on.
pub fn is_affirmative(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use rstest::rstest;

    use super::*;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::new("/tmp/data", "/tmp/tmp");
        assert_eq!(config.test_id, DEFAULT_TEST_ID);
        assert_eq!(config.call_timeout, Duration::from_secs(60));
        assert!(!config.keep_nodes);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env_requires_dirs() {
        let err = ManagerConfig::from_lookup(lookup_from(&[("HARNESS_DATA_DIR", "/d")]))
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_from_env_reads_all_fields() {
        let config = ManagerConfig::from_lookup(lookup_from(&[
            ("HARNESS_DATA_DIR", "/d"),
            ("HARNESS_TEMP_DIR", "/t"),
            ("HARNESS_TEST_ID", "sync_test"),
            ("HARNESS_CALL_TIMEOUT_SECS", "5"),
            ("HARNESS_KEEP_NODES", "true"),
        ]))
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/d"));
        assert_eq!(config.temp_dir, PathBuf::from("/t"));
        assert_eq!(config.test_id, "sync_test");
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert!(config.keep_nodes);
    }

    #[test]
    fn test_from_env_bad_timeout() {
        let result = ManagerConfig::from_lookup(lookup_from(&[
            ("HARNESS_DATA_DIR", "/d"),
            ("HARNESS_TEMP_DIR", "/t"),
            ("HARNESS_CALL_TIMEOUT_SECS", "soon"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_overlay_keeps_unset_fields() {
        let base = ManagerConfig::new("/d", "/t")
            .with_test_id("base")
            .with_call_timeout(Duration::from_secs(7));

        let config = base
            .overlay(lookup_from(&[("HARNESS_CALL_TIMEOUT_SECS", "3")]))
            .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/d"));
        assert_eq!(config.test_id, "base");
        assert_eq!(config.call_timeout, Duration::from_secs(3));
        assert!(!config.keep_nodes);
    }

    #[rstest]
    #[case("0", false)]
    #[case("false", false)]
    #[case("no", false)]
    #[case("yes", true)]
    fn test_overlay_keep_nodes(#[case] value: &str, #[case] expected: bool) {
        let config = ManagerConfig::new("/d", "/t")
            .with_keep_nodes(true)
            .overlay(lookup_from(&[("HARNESS_KEEP_NODES", value)]))
            .unwrap();
        assert_eq!(config.keep_nodes, expected);
    }

    #[test]
    fn test_overlay_rejects_empty_dir() {
        let err = ManagerConfig::new("/d", "/t")
            .overlay(lookup_from(&[("HARNESS_TEMP_DIR", "")]))
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[rstest]
    #[case("1", true)]
    #[case("true", true)]
    #[case(" YES ", true)]
    #[case("on", true)]
    #[case("0", false)]
    #[case("false", false)]
    #[case("", false)]
    fn test_is_affirmative(#[case] value: &str, #[case] expected: bool) {
        assert_eq!(is_affirmative(value), expected);
    }

    #[test]
    fn test_log_sink_collects() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let lines = Arc::clone(&lines);
            LogSink::new(move |text| lines.lock().unwrap().push(text.to_string()))
        };

        sink.log("hello");
        LogSink::default().log("dropped");

        assert_eq!(*lines.lock().unwrap(), vec!["hello".to_string()]);
    }
}
