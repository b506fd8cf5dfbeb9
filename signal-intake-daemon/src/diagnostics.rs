//! Diagnostics and Debug Logging
//!
//! Command line, logging setup, diagnostic subcommands and intake metrics
//! for troubleshooting the intake daemon.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use signal_intake::{classify, ConnectionState, IntakeSignal, RawEvent};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Intake daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "signal-intake-daemon")]
#[command(about = "Message intake daemon for a secure messaging client", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Show timestamps in logs
    #[arg(long, default_value = "true")]
    pub timestamps: bool,

    /// JSON-lines event stream to replay ("-" reads stdin)
    #[arg(short, long, value_name = "FILE", default_value = "-")]
    pub events: String,

    /// Treat this start as the first run after registration
    #[arg(long)]
    pub first_run: bool,

    /// Use an alternative configuration file
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Diagnostic subcommand
    #[command(subcommand)]
    pub command: Option<DiagnosticCommand>,
}

/// Diagnostic commands for troubleshooting
#[derive(Subcommand, Debug)]
pub enum DiagnosticCommand {
    /// Show daemon version and build information
    Version {
        /// Show detailed build information
        #[arg(long)]
        verbose: bool,
    },

    /// Show current configuration
    DumpConfig,

    /// Classify every event in a JSON-lines file without dispatching it
    Classify {
        /// Event file
        file: PathBuf,
    },
}

/// Initialize logging based on CLI configuration
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    // Logs go to stderr so the inbox summary on stdout stays clean
    let subscriber = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );

    Ok(())
}

/// Per-kind tally of a classified event file
#[derive(Debug, Default, PartialEq)]
pub struct ClassifyReport {
    pub kinds: BTreeMap<String, usize>,
    pub unclassifiable: usize,
    pub malformed: usize,
}

impl ClassifyReport {
    /// Classify one JSON line and count the outcome
    pub fn record_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match RawEvent::from_line(line) {
            Ok(raw) => match classify(&raw) {
                Ok(event) => *self.kinds.entry(event.kind().to_string()).or_default() += 1,
                Err(_) => self.unclassifiable += 1,
            },
            Err(_) => self.malformed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.kinds.values().sum::<usize>() + self.unclassifiable + self.malformed
    }

    pub fn display(&self) {
        println!("\n=== Event Classification ===");
        for (kind, count) in &self.kinds {
            println!("  {:<10} {}", kind, count);
        }
        println!("  {:<10} {}", "unknown", self.unclassifiable);
        println!("  {:<10} {}", "malformed", self.malformed);
        println!("Total: {}", self.total());
    }
}

/// Classify every line of an event file
pub async fn classify_file(path: &Path) -> Result<ClassifyReport> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read event file {}", path.display()))?;

    let mut report = ClassifyReport::default();
    for line in contents.lines() {
        report.record_line(line);
    }
    Ok(report)
}

/// Intake metrics collected from the signal bus
#[derive(Debug, Default)]
pub struct Metrics {
    start_time: Option<Instant>,
    new_messages: u64,
    notifications: u64,
    syncs_completed: u64,
    syncs_timed_out: u64,
    reconnects: u64,
    state_changes: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    /// Account for one outbound signal
    pub fn record(&mut self, signal: &IntakeSignal) {
        match signal {
            IntakeSignal::NewMessage { .. } => self.new_messages += 1,
            IntakeSignal::NotifyUser { .. } => self.notifications += 1,
            IntakeSignal::ContactSyncComplete { synced: true } => self.syncs_completed += 1,
            IntakeSignal::ContactSyncComplete { synced: false } => self.syncs_timed_out += 1,
            IntakeSignal::ConnectionState(state) => {
                self.state_changes += 1;
                if *state == ConnectionState::Reconnecting {
                    self.reconnects += 1;
                }
            }
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time
            .map(|start| start.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn new_messages(&self) -> u64 {
        self.new_messages
    }

    pub fn notifications(&self) -> u64 {
        self.notifications
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn display(&self) {
        let uptime = self.uptime_seconds();
        println!("\n=== Intake Metrics ===");
        println!(
            "Uptime: {}h {}m {}s",
            uptime / 3600,
            (uptime % 3600) / 60,
            uptime % 60
        );
        println!("Messages: {} new, {} notified", self.new_messages, self.notifications);
        println!(
            "Contact sync: {} completed, {} timed out",
            self.syncs_completed, self.syncs_timed_out
        );
        println!(
            "Connection: {} state changes, {} reconnects",
            self.state_changes, self.reconnects
        );
    }
}

/// Build information for diagnostics
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: Option<&'static str>,
}

impl BuildInfo {
    pub fn get() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_hash: option_env!("GIT_HASH"),
        }
    }

    pub fn display(&self, verbose: bool) {
        println!("Signal Intake Daemon v{}", self.version);

        if verbose {
            if let Some(hash) = self.git_hash {
                println!("Git commit: {}", hash);
            }
            println!("Platform: {}", std::env::consts::OS);
            println!("Architecture: {}", std::env::consts::ARCH);
        }
    }
}
