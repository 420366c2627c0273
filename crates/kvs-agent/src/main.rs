//! KV Scheduler - operator CLI
//!
//! The `kvsd` command drives the scheduler against an in-memory demo
//! dataplane of interfaces and bridge domains.
//!
//! ## Commands
//!
//! - `apply`: Full resync against a desired-state JSON file
//! - `scenario`: Walk through the bridge-domain ordering scenario

mod dataplane;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kvscheduler::{
    AnyValue, DescriptorRegistry, DumpView, KeyValuePair, RecordedTxn, Scheduler,
    SchedulerConfig, Txn, TxnOperation, TxnOptions, ValueStatus,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

use dataplane::{register_demo, Dataplane, Interface};

#[derive(Parser)]
#[command(name = "kvsd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dependency-ordered reconciliation of dataplane configuration", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Scheduler configuration file (JSON)
    #[arg(short, long, global = true, env = "KVS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the dataplane with a desired-state file
    Apply {
        /// JSON object mapping keys to values
        file: PathBuf,

        /// What to print after the transaction record
        #[arg(short, long, value_enum, default_value_t = Show::Status)]
        show: Show,

        /// Restrict the view to keys under this prefix
        #[arg(short, long, default_value = "")]
        prefix: String,
    },

    /// Run the bridge-domain scenario: a domain waits for its interface
    Scenario,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Show {
    /// Value statuses
    Status,
    /// Values as recorded by the scheduler
    Cached,
    /// Values as read back from the dataplane
    Live,
    /// Values as requested, applied or not
    Desired,
    /// Every recorded transaction
    History,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    kvscheduler::init_tracing(cli.json, level, env!("CARGO_CRATE_NAME"));

    let config = SchedulerConfig::load(cli.config.as_deref())
        .context("Failed to load scheduler configuration")?;

    match cli.command {
        Commands::Apply { file, show, prefix } => cmd_apply(config, &file, show, &prefix).await,
        Commands::Scenario => cmd_scenario(config).await,
    }
}

/// Scheduler wired to a fresh demo dataplane with a preexisting `local0`.
async fn demo_scheduler(config: SchedulerConfig) -> Result<(Scheduler, Dataplane)> {
    let dataplane = Dataplane::new();
    dataplane.add_builtin_interface("local0", Interface::default());

    let mut registry = DescriptorRegistry::new();
    register_demo(&mut registry, &dataplane).context("Failed to register descriptors")?;
    let scheduler = Scheduler::start(registry, config)
        .await
        .context("Failed to start scheduler")?;
    Ok((scheduler, dataplane))
}

/// Parse a desired-state file: a JSON object of key -> value.
fn load_desired(path: &Path) -> Result<Vec<KeyValuePair>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read desired state from {:?}", path))?;
    let doc: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)
        .with_context(|| format!("{:?} is not a JSON object of key/value pairs", path))?;
    Ok(doc
        .into_iter()
        .map(|(key, value)| KeyValuePair::new(key, AnyValue::from_json(value)))
        .collect())
}

/// Keep the record of a transaction that committed with per-key failures.
fn committed(result: kvscheduler::Result<Arc<RecordedTxn>>) -> Result<Arc<RecordedTxn>> {
    match result {
        Ok(record) => Ok(record),
        Err(err) => match err.record() {
            Some(record) => {
                warn!(seq_num = record.seq_num, error = %err, "transaction finished with errors");
                Ok(record.clone())
            }
            None => Err(err.into()),
        },
    }
}

async fn run_apply(scheduler: &Scheduler, path: &Path) -> Result<Arc<RecordedTxn>> {
    let desired = load_desired(path)?;
    info!(values = desired.len(), file = ?path, "applying desired state");
    committed(
        scheduler
            .resync_full(
                desired,
                TxnOptions::default().with_description(format!("apply {}", path.display())),
            )
            .await,
    )
}

/// Full resync against a desired-state file
async fn cmd_apply(config: SchedulerConfig, path: &Path, show: Show, prefix: &str) -> Result<()> {
    let (scheduler, _dataplane) = demo_scheduler(config).await?;
    let record = run_apply(&scheduler, path).await?;
    print!("{}", record);

    match show {
        Show::Status => print_statuses(&scheduler.status_prefix(prefix)),
        Show::Cached | Show::Live | Show::Desired => {
            let view = match show {
                Show::Live => DumpView::Live,
                Show::Desired => DumpView::Desired,
                _ => DumpView::Cached,
            };
            let dumped = scheduler
                .dump(prefix, view)
                .await
                .context("Failed to dump values")?;
            if dumped.is_empty() {
                println!("No values under '{}'", prefix);
            }
            for kv in dumped {
                match kv.metadata {
                    Some(meta) => {
                        println!("{} [{}] {} meta={}", kv.key, kv.origin, kv.value, meta)
                    }
                    None => println!("{} [{}] {}", kv.key, kv.origin, kv.value),
                }
            }
        }
        Show::History => {
            for record in scheduler.history_all().await? {
                print!("{}", record);
            }
        }
    }

    let errors = record.errors();
    if !errors.is_empty() {
        bail!(
            "transaction #{} finished with {} failed key(s)",
            record.seq_num,
            errors.len()
        );
    }
    Ok(())
}

fn print_statuses(statuses: &[ValueStatus]) {
    if statuses.is_empty() {
        println!("No values tracked");
    }
    // Derived values are printed under their parent.
    let derived: std::collections::HashSet<&str> = statuses
        .iter()
        .flat_map(|s| s.derived.iter().map(|d| d.key.as_str()))
        .collect();
    for status in statuses.iter().filter(|s| !derived.contains(s.key.as_str())) {
        print_status(status, 0);
    }
}

fn print_status(status: &ValueStatus, depth: usize) {
    let indent = "  ".repeat(depth);
    let mut line = format!(
        "{}{:<32} {:<12} {}",
        indent, status.key, status.state, status.origin
    );
    if let Some(err) = &status.error {
        line.push_str(&format!(" error: {}", err));
    }
    if !status.blocked_by.is_empty() {
        line.push_str(&format!(" blocked by: {}", status.blocked_by.join(", ")));
    }
    if let Some(retry) = &status.retry {
        line.push_str(&format!(" retry attempt {}", retry.attempt));
    }
    println!("{}", line);
    for child in &status.derived {
        print_status(child, depth + 1);
    }
}

/// Both scenario transactions, in order.
async fn run_scenario(scheduler: &Scheduler) -> Result<(Arc<RecordedTxn>, Arc<RecordedTxn>)> {
    let first = committed(
        scheduler
            .apply(
                Txn::new().put_json("bd/bd1", serde_json::json!({ "members": ["if1"] })),
                TxnOptions::default().with_description("bridge domain before its interface"),
            )
            .await,
    )?;
    let second = committed(
        scheduler
            .apply(
                Txn::new().put_json(
                    "iface/if1",
                    serde_json::json!({ "mtu": 1500, "addresses": ["192.168.1.1/24"] }),
                ),
                TxnOptions::default().with_description("interface arrives"),
            )
            .await,
    )?;
    Ok((first, second))
}

/// Bridge-domain ordering scenario
async fn cmd_scenario(config: SchedulerConfig) -> Result<()> {
    let (scheduler, dataplane) = demo_scheduler(config).await?;
    scheduler
        .resync_downstream(TxnOptions::default().with_description("discover dataplane"))
        .await
        .context("Initial resync failed")?;

    let (_, second) = run_scenario(&scheduler).await?;

    for record in scheduler.history_all().await? {
        print!("{}", record);
    }
    println!();
    print_statuses(&scheduler.status_prefix(""));

    let iface = second.position_of("iface/if1", TxnOperation::Create);
    let bd = second.position_of("bd/bd1", TxnOperation::Create);
    match (iface, bd) {
        (Some(i), Some(b)) if i < b => println!("\niface/if1 created before bd/bd1"),
        _ => bail!("bd/bd1 was not created after iface/if1"),
    }

    println!("\nDataplane:");
    for name in dataplane.interface_names() {
        if let Some(iface) = dataplane.interface(&name) {
            println!("  interface {:<8} mtu={} up={}", name, iface.mtu, iface.enabled);
        }
    }
    if let (Some(bd), Some(ports)) = (
        dataplane.bridge_domain("bd1"),
        dataplane.bridge_domain_ports("bd1"),
    ) {
        println!(
            "  bridge-domain bd1 members={:?} ports={:?}",
            bd.members, ports
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvscheduler::{SchedulerError, ValueOrigin, ValueState};

    async fn scheduler() -> (Scheduler, Dataplane) {
        demo_scheduler(SchedulerConfig::default()).await.unwrap()
    }

    fn state(scheduler: &Scheduler, key: &str) -> ValueState {
        scheduler.status(key).unwrap().state
    }

    #[tokio::test]
    async fn scenario_creates_interface_before_bridge_domain() {
        let (scheduler, dataplane) = scheduler().await;
        let (first, second) = run_scenario(&scheduler).await.unwrap();

        assert_eq!(first.performed().count(), 0);
        let pending = scheduler.status("bd/bd1").unwrap();
        assert_eq!(pending.last_update, first.seq_num);

        let iface = second
            .position_of("iface/if1", TxnOperation::Create)
            .unwrap();
        let bd = second.position_of("bd/bd1", TxnOperation::Create).unwrap();
        assert!(iface < bd);

        assert_eq!(state(&scheduler, "iface/if1"), ValueState::Configured);
        assert_eq!(state(&scheduler, "bd/bd1"), ValueState::Configured);
        assert_eq!(
            state(&scheduler, "iface/if1/address/192.168.1.1/24"),
            ValueState::Configured
        );
        let if1 = dataplane.interface("if1").unwrap();
        assert_eq!(dataplane.bridge_domain_ports("bd1").unwrap().len(), 1);
        assert_eq!(if1.addresses, vec!["192.168.1.1/24".to_string()]);
    }

    #[tokio::test]
    async fn bridge_domain_waits_for_missing_member() {
        let (scheduler, dataplane) = scheduler().await;
        scheduler
            .apply(
                Txn::new().put_json("bd/bd1", serde_json::json!({ "members": ["if1"] })),
                TxnOptions::default(),
            )
            .await
            .unwrap();
        let status = scheduler.status("bd/bd1").unwrap();
        assert_eq!(status.state, ValueState::Pending);
        assert_eq!(status.blocked_by, vec!["iface/if1".to_string()]);
        assert!(dataplane.bridge_domain("bd1").is_none());
    }

    #[tokio::test]
    async fn apply_reconciles_and_keeps_builtin_interfaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("desired.json");
        std::fs::write(
            &path,
            r#"{
                "iface/if1": {"mtu": 9000},
                "iface/if2": {},
                "bd/bd1": {"members": ["if1", "if2"], "learning": true}
            }"#,
        )
        .unwrap();

        let (scheduler, dataplane) = scheduler().await;
        let record = run_apply(&scheduler, &path).await.unwrap();
        assert!(record.errors().is_empty());
        assert_eq!(record.performed().count(), 3);
        assert_eq!(
            dataplane.interface_names(),
            vec!["if1".to_string(), "if2".to_string(), "local0".to_string()]
        );

        let local = scheduler.status("iface/local0").unwrap();
        assert_eq!(local.state, ValueState::Obtained);
        assert_eq!(local.origin, ValueOrigin::FromSb);

        // Applying the same file again has nothing to do.
        let again = run_apply(&scheduler, &path).await.unwrap();
        assert_eq!(again.performed().count(), 0);
    }

    #[tokio::test]
    async fn invalid_values_are_reported_not_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("desired.json");
        std::fs::write(&path, r#"{"iface/if1": {"mtu": 100}, "iface/if2": {}}"#).unwrap();

        let (scheduler, dataplane) = scheduler().await;
        let record = run_apply(&scheduler, &path).await.unwrap();
        let errors = record.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].key, "iface/if1");
        assert_eq!(state(&scheduler, "iface/if1"), ValueState::Invalid);
        assert!(dataplane.interface("if1").is_none());
        assert!(dataplane.interface("if2").is_some());
    }

    #[test]
    fn desired_file_must_be_an_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("desired.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(load_desired(&path).is_err());
        assert!(load_desired(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn cli_parses_apply_flags() {
        let cli = Cli::try_parse_from([
            "kvsd", "--json", "apply", "desired.json", "--show", "live", "--prefix", "bd/",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Apply { file, show, prefix } => {
                assert_eq!(file, PathBuf::from("desired.json"));
                assert_eq!(show, Show::Live);
                assert_eq!(prefix, "bd/");
            }
            Commands::Scenario => panic!("expected apply"),
        }
    }

    #[test]
    fn errors_without_a_record_are_propagated() {
        let err = SchedulerError::Closed;
        assert!(committed(Err(err)).is_err());
    }
}
