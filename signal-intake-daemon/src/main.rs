mod config;
mod diagnostics;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use diagnostics::{BuildInfo, Cli, DiagnosticCommand, Metrics};
use signal_intake::{
    ConnectionState, ConnectionSupervisor, IntakeError, JsonSettingsStore, MemoryStore,
    ReceiverFactory, Registration, ReplayFactory, SettingsStore, WatchNetworkMonitor,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Intake daemon state
struct Daemon {
    supervisor: ConnectionSupervisor,
    settings: Arc<dyn SettingsStore>,
    faults: mpsc::UnboundedReceiver<IntakeError>,
    metrics: Arc<RwLock<Metrics>>,
    metrics_task: JoinHandle<()>,
}

impl Daemon {
    /// Create the daemon around a replay transport
    async fn new(config: &Config, events: &str) -> Result<Self> {
        config
            .ensure_directories()
            .context("Failed to create daemon directories")?;

        let settings_path = config.settings_path();
        let settings: Arc<dyn SettingsStore> = Arc::new(
            JsonSettingsStore::open(&settings_path)
                .await
                .with_context(|| format!("Failed to open settings at {}", settings_path.display()))?,
        );

        let factory: Arc<dyn ReceiverFactory> = if events == "-" {
            Arc::new(ReplayFactory::stdin())
        } else {
            Arc::new(
                ReplayFactory::from_path(events)
                    .await
                    .with_context(|| format!("Failed to open event stream {}", events))?,
            )
        };

        let (supervisor, faults) = ConnectionSupervisor::spawn(
            config.intake_config(),
            settings.clone(),
            Arc::new(MemoryStore::new()),
            factory,
            Arc::new(WatchNetworkMonitor::new(true)),
        );

        let metrics = Arc::new(RwLock::new(Metrics::new()));
        let metrics_task = tokio::spawn(collect_metrics(
            supervisor.signals().subscribe(),
            metrics.clone(),
        ));

        Ok(Self {
            supervisor,
            settings,
            faults,
            metrics,
            metrics_task,
        })
    }

    /// Start the connection and wait for the stream to end, Ctrl+C or a fatal fault
    async fn run(&mut self, first_run: bool) -> Result<()> {
        let registered = Registration::new(self.settings.clone())
            .is_done()
            .await
            .context("Failed to read registration state")?;
        if !registered {
            warn!("Account is not registered, no connection will be opened");
            return Ok(());
        }

        self.supervisor
            .start(first_run)
            .await
            .context("Failed to start connection")?;
        // a short stream may already have ended here
        let mut state = self.supervisor.watch_state();

        info!("Intake running, press Ctrl+C to stop");

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for shutdown signal")?;
                info!("Received shutdown signal");
            }
            fault = self.faults.recv() => {
                if let Some(fault) = fault {
                    error!("Fatal intake error: {}", fault);
                    return Err(fault).context("Intake stopped on a fatal error");
                }
            }
            _ = state.wait_for(|state| *state == ConnectionState::Stopped) => {
                info!("Event stream ended");
            }
        }

        Ok(())
    }

    async fn shutdown(self) {
        info!("Shutting down daemon...");
        self.supervisor.shutdown().await;
        self.metrics_task.abort();

        let inbox = self.supervisor.reconciler().inbox().await;
        let unread = self.supervisor.reconciler().total_unread().await;

        println!("\n=== Inbox ({} conversations, {} unread) ===", inbox.len(), unread);
        for conversation in &inbox {
            println!(
                "  {:<24} unread={:<4} {}",
                conversation.title(),
                conversation.unread_count,
                conversation.last_message.as_deref().unwrap_or("")
            );
        }

        let receipts = self.supervisor.receipts();
        println!(
            "Receipts: {} delivered, {} read",
            receipts.deliveries().await.len(),
            receipts.reads().await.len()
        );

        self.metrics.read().await.display();
        info!("Daemon shutdown complete");
    }
}

/// Fold bus signals into the metrics until the bus closes
async fn collect_metrics(
    mut signals: broadcast::Receiver<signal_intake::IntakeSignal>,
    metrics: Arc<RwLock<Metrics>>,
) {
    loop {
        match signals.recv().await {
            Ok(signal) => metrics.write().await.record(&signal),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Metrics collector skipped {} signals", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")
}

/// Handle diagnostic commands
async fn handle_diagnostic_command(cli: &Cli, command: &DiagnosticCommand) -> Result<()> {
    match command {
        DiagnosticCommand::Version { verbose } => {
            BuildInfo::get().display(*verbose);
            Ok(())
        }
        DiagnosticCommand::DumpConfig => {
            let config = load_config(cli)?;

            println!("\n=== Daemon Configuration ===");
            println!("\n[Service]");
            println!("Server: {}", config.service.server_url);
            println!("Ports: {:?}", config.service.server_ports);
            println!("Attachments: {}", config.service.attachment_server_url);

            println!("\n[Intake]");
            println!("Retry delay: {} seconds", config.intake.retry_delay_secs);
            match config.intake.max_retry_attempts {
                Some(max) => println!("Max retry attempts: {}", max),
                None => println!("Max retry attempts: unlimited"),
            }
            println!("Sync timeout: {} seconds", config.intake.sync_timeout_secs);
            println!("Signal buffer: {}", config.intake.signal_buffer);

            println!("\n[Paths]");
            println!("Config: {:?}", config.config_path());
            println!("Settings: {:?}", config.settings_path());
            Ok(())
        }
        DiagnosticCommand::Classify { file } => {
            diagnostics::classify_file(file).await?.display();
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(command) = &cli.command {
        return handle_diagnostic_command(&cli, command).await;
    }

    diagnostics::init_logging(&cli).context("Failed to initialize logging")?;

    info!("Starting signal intake daemon...");

    let config = load_config(&cli)?;
    info!("Configuration loaded from {}", config.config_path().display());
    info!("Service endpoint: {}", config.service.server_url);

    let mut daemon = Daemon::new(&config, &cli.events)
        .await
        .context("Failed to create daemon")?;

    let result = daemon.run(cli.first_run).await;

    daemon.shutdown().await;

    result
}
