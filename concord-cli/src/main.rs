//! `concord`: audit verification, state diffing and the sync server.
//!
//! ```text
//! concord verify audit.jsonl          # chain + replay, exit 1 on a break
//! concord diff local.json ref.json    # structural diff, exit 1 if diverged
//! concord locate a.jsonl b.jsonl      # first event where two trails part
//! concord serve --bind 0.0.0.0:9090   # WebSocket sync server
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use serde_json::{json, Value};

use concord_collab::audit::{replay, verify_chain, AuditLog};
use concord_collab::config::ConcordConfig;
use concord_collab::conflict::{ConflictSink, ConflictStore};
use concord_collab::divergence::{deep_diff, locate_first_divergence, LocateOutcome};
use concord_collab::server::SyncServer;
use concord_core::ids::make_session_id;

#[derive(Parser)]
#[command(name = "concord", about = "Replicated JSON documents: sync, audit and divergence tools", version)]
struct Cli {
    /// Enable debug logging (RUST_LOG still wins)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON config file; missing sections use defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify an audit log's hash chain and replay it
    Verify {
        /// JSONL audit log
        log: PathBuf,
    },

    /// Diff two JSON states
    Diff {
        local: PathBuf,
        reference: PathBuf,
    },

    /// Find the first event at which two audit logs diverge
    Locate { left: PathBuf, right: PathBuf },

    /// Run the WebSocket sync server
    Serve {
        /// Listen address, overrides the config
        #[arg(short, long)]
        bind: Option<String>,

        /// Append the server's audit trail to this JSONL file
        #[arg(long)]
        audit_log: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let config = match &cli.config {
        Some(path) => ConcordConfig::from_json_file(path)?,
        None => ConcordConfig::default(),
    };

    let ok = match cli.command {
        Commands::Verify { log } => {
            let (summary, ok) = verify(&log, &config)?;
            print_json(&summary)?;
            ok
        }
        Commands::Diff { local, reference } => {
            let report = deep_diff(&read_json(&local)?, &read_json(&reference)?, &config.diff);
            print_json(&serde_json::to_value(&report)?)?;
            report.ok
        }
        Commands::Locate { left, right } => {
            let (summary, ok) = locate(&left, &right, &config)?;
            print_json(&summary)?;
            ok
        }
        Commands::Serve { bind, audit_log } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            if audit_log.is_some() {
                config.audit_log = audit_log;
            }
            serve(config).await?;
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_events(path: &Path) -> anyhow::Result<Vec<concord_collab::AuditEvent>> {
    AuditLog::load_jsonl(path).with_context(|| format!("cannot load audit log {}", path.display()))
}

/// Verify the chain, then replay the prefix that verified.
fn verify(path: &Path, config: &ConcordConfig) -> anyhow::Result<(Value, bool)> {
    let events = load_events(path)?;
    let chain = verify_chain(&events);
    let result = replay(&events[..chain.verified], &config.replay);
    let ok = chain.ok;
    if !ok {
        log::error!(
            "chain broken at index {:?} ({:?})",
            chain.first_bad_index,
            chain.fault
        );
    }
    let summary = json!({
        "path": path.display().to_string(),
        "events": events.len(),
        "chain": chain,
        "replay": {
            "applied": result.applied,
            "ignored": result.ignored,
            "rejected": result.rejected,
            "markers": result.markers,
            "stateHash": result.state_hash,
        },
    });
    Ok((summary, ok))
}

fn locate(left: &Path, right: &Path, config: &ConcordConfig) -> anyhow::Result<(Value, bool)> {
    let report = locate_first_divergence(&load_events(left)?, &load_events(right)?, &config.replay);
    let ok = report.outcome == LocateOutcome::Identical;
    Ok((serde_json::to_value(&report)?, ok))
}

async fn serve(config: ConcordConfig) -> anyhow::Result<()> {
    let audit = match &config.audit_log {
        Some(path) => {
            let log = AuditLog::open_jsonl(
                path,
                config.audit.clone(),
                make_session_id("srv"),
                config.server.server_id.clone(),
            )
            .with_context(|| format!("cannot open audit log {}", path.display()))?;
            Some(Arc::new(Mutex::new(log)))
        }
        None => None,
    };
    let conflicts = Arc::new(Mutex::new(ConflictStore::new(config.conflicts.clone())));

    let server = SyncServer::with_sinks(
        config.server.clone(),
        audit.clone(),
        Some(conflicts.clone() as Arc<dyn ConflictSink>),
    );
    let listener = server.bind().await?;
    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("cannot listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("shutting down, server stats: {:?}", server.stats());
    info!("replica stats: {:?}", server.service().stats());
    if let Ok(store) = conflicts.lock() {
        info!("conflicts: {:?}", store.counts());
    }
    if let Some(audit) = audit {
        let mut log = audit.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        log.close()?;
    }
    Ok(())
}
