//! Command line interface of the `node-harness` binary.
//!
//! Both commands run a scenario against the in-memory mock backend, which
//! makes them a dry run of peer resolution and the node lifecycle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use node_harness::backend::MockBackend;
use node_harness::scenario::Scenario;
use node_harness::{CleanupReport, LogScan, LogSink, ManagerConfig, NodeManager, Teardown};

/// Node lifecycle harness - dry-run test network scenarios.
#[derive(Debug, Parser)]
#[command(name = "node-harness")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[command(flatten)]
    harness: HarnessArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Flags layered over the `HARNESS_*` environment configuration.
#[derive(Debug, Args)]
struct HarnessArgs {
    /// Directory for persistent test data [env: HARNESS_DATA_DIR].
    /// Defaults to <tmp>/node-harness/data.
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Directory for scratch files [env: HARNESS_TEMP_DIR].
    /// Defaults to <tmp>/node-harness/tmp.
    #[arg(long, global = true, value_name = "DIR")]
    temp_dir: Option<PathBuf>,

    /// Test ID [env: HARNESS_TEST_ID]. The scenario's own `test_id` wins.
    #[arg(long, global = true)]
    test_id: Option<String>,

    /// Leave nodes running at cleanup [env: HARNESS_KEEP_NODES].
    #[arg(long, global = true)]
    keep_nodes: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Set up the scenario's nodes, print their resolved peers, and clean up.
    Check(ScenarioArgs),

    /// Set up and start the scenario's nodes, query services, and clean up.
    Run(ScenarioArgs),
}

#[derive(Debug, Args)]
struct ScenarioArgs {
    /// Scenario file (TOML).
    #[arg(value_name = "SCENARIO")]
    scenario: PathBuf,
}

impl HarnessArgs {
    /// Defaults, then the environment, then flags, then the scenario.
    fn manager_config(&self, scenario: &Scenario) -> Result<ManagerConfig> {
        let base = std::env::temp_dir().join("node-harness");
        let config = ManagerConfig::new(base.join("data"), base.join("tmp"))
            .with_env()
            .context("invalid HARNESS_* environment")?;
        Ok(self.apply(config, scenario))
    }

    fn apply(&self, mut config: ManagerConfig, scenario: &Scenario) -> ManagerConfig {
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(dir) = &self.temp_dir {
            config.temp_dir = dir.clone();
        }
        if self.keep_nodes {
            config.keep_nodes = true;
        }
        if let Some(test_id) = scenario.test_id.as_ref().or(self.test_id.as_ref()) {
            config.test_id = test_id.clone();
        }
        config.with_log_sink(LogSink::new(|text| eprintln!("{text}")))
    }
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match &self.command {
            Commands::Check(args) => check(&self.harness, &args.scenario).await,
            Commands::Run(args) => run(&self.harness, &args.scenario).await,
        }
    }
}

async fn start_manager(
    harness: &HarnessArgs,
    scenario: &Scenario,
) -> Result<(NodeManager, MockBackend)> {
    let config = harness.manager_config(scenario)?;
    info!(
        test_id = %config.test_id,
        data_dir = %config.data_dir.display(),
        temp_dir = %config.temp_dir.display(),
        "Configuration loaded"
    );

    let mock = MockBackend::new();
    let manager = NodeManager::builder(config)
        .backend(mock.clone())
        .start()
        .await
        .context("failed to start node manager")?;
    Ok((manager, mock))
}

/// Set up the scenario's nodes. On failure the manager is shut down and its
/// teardown printed before the error is returned.
async fn setup(manager: &NodeManager, scenario: &Scenario) -> Result<()> {
    if let Err(e) = manager.setup_nodes(scenario.nodes.clone()).await {
        match manager.shutdown().await {
            Ok(teardown) => print_teardown(&teardown),
            Err(shutdown) => {
                warn!(error = %shutdown, "Shutdown after failed setup did not complete")
            }
        }
        return Err(e).context("setup failed");
    }
    Ok(())
}

fn print_peers(scenario: &Scenario, mock: &MockBackend) {
    let inventory = mock.inventory();
    for spec in &scenario.nodes {
        println!("{}", spec.name);
        match inventory.peers.get(&spec.name) {
            Some(peers) if !peers.is_empty() => {
                for peer in peers {
                    println!("  peer {peer}");
                }
            }
            _ => println!("  (no peers)"),
        }
    }
}

fn print_report(report: &CleanupReport) {
    match &report.log_scan {
        LogScan::Clean => println!("log scan: clean"),
        LogScan::Errors(errors) => {
            println!("log scan: errors in {} node(s)", errors.len());
            for (node, lines) in errors {
                for line in lines {
                    println!("  {node}: {line}");
                }
            }
        }
    }
    print_teardown(&report.teardown);
}

fn teardown_lines(teardown: &Teardown) -> Vec<String> {
    let kept = teardown.kept_nodes.iter().map(|node| format!("kept: {node}"));
    let failed = teardown
        .failures
        .iter()
        .map(|failure| format!("teardown failed: {failure}"));
    kept.chain(failed).collect()
}

fn print_teardown(teardown: &Teardown) {
    for line in teardown_lines(teardown) {
        println!("{line}");
    }
}

async fn check(harness: &HarnessArgs, path: &Path) -> Result<()> {
    let scenario = Scenario::load(path)?;
    let (manager, mock) = start_manager(harness, &scenario).await?;

    setup(&manager, &scenario).await?;
    print_peers(&scenario, &mock);

    let report = manager.cleanup().await?;
    print_report(&report);
    report.into_result()?;
    Ok(())
}

async fn run(harness: &HarnessArgs, path: &Path) -> Result<()> {
    let scenario = Scenario::load(path)?;
    let (manager, mock) = start_manager(harness, &scenario).await?;

    setup(&manager, &scenario).await?;
    print_peers(&scenario, &mock);

    let outcome = start_and_query(&manager, &scenario).await;

    if let Err(e) = manager.dump_logs().await {
        eprintln!("{e}");
    }

    let report = manager.cleanup().await?;
    print_report(&report);

    outcome?;
    report.into_result()?;
    Ok(())
}

async fn start_and_query(manager: &NodeManager, scenario: &Scenario) -> Result<()> {
    for spec in &scenario.nodes {
        manager.start_node(spec.name.clone()).await?;
    }

    for spec in &scenario.nodes {
        let pubkey = manager.get_node_pubkey(spec.name.clone()).await?;
        println!("{} pubkey {pubkey}", spec.name);

        for service in &scenario.services {
            let address = manager
                .get_service_address(spec.name.clone(), service.as_str())
                .await?;
            println!("{} {service} {address}", spec.name);
        }

        let output = manager
            .run_cmd_in_node_dir(
                spec.name.clone(),
                vec!["echo".into(), "ready".into()],
                Duration::from_secs(5),
            )
            .await?;
        if !output.success() {
            anyhow::bail!("{} is not ready: {}", spec.name, output.output.trim());
        }
    }
    Ok(())
}
