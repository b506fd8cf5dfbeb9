//! Connection Supervisor
//!
//! Owns the receive connection. All lifecycle changes go through one handle:
//!
//! - `start` closes any open connection before opening a new one, under the
//!   supervisor lock, so at most one connection exists at a time
//! - a "failed to connect" error while online schedules one fixed-delay retry
//! - the same error while offline closes the connection and waits for the
//!   next offline-to-online edge, then starts once
//! - an unmodeled error stops the connection and is sent to the fault receiver
//!
//! Events from a connection are pumped sequentially, in arrival order, through
//! an [`IntakeDispatcher`]. Connection tasks report back to a control loop
//! with the generation they were started with; reports from a superseded
//! connection are ignored.

use super::events::{ConnectionState, SupervisorCommand};
use super::transport::{NetworkMonitor, ReceiveConnection, ReceiverFactory, NO_CONNECTION_STATUS};
use crate::account::{AccountManager, Credentials, Registration};
use crate::config::IntakeConfig;
use crate::conversation::ConversationReconciler;
use crate::dispatch::{DispatchOutcome, IntakeDispatcher};
use crate::event::{RawEvent, EVENT_ERROR};
use crate::receipts::ReceiptTracker;
use crate::recovery::RetryPolicy;
use crate::signals::{IntakeSignal, SignalBus};
use crate::storage::{RecordStore, SettingsStore};
use crate::sync::SyncOrchestrator;
use crate::{IntakeError, Result};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Open receive connection and the task pumping its events
struct ActiveConnection {
    control: Arc<dyn ReceiveConnection>,
    pump: JoinHandle<()>,
    generation: u64,
}

impl ActiveConnection {
    async fn close(self) {
        debug!("Closing receive connection (generation {})", self.generation);
        self.control.close().await;
        self.pump.abort();
    }
}

/// The single pending retry path
enum PendingRetry {
    Timer(JoinHandle<()>),
    Online(JoinHandle<()>),
}

impl PendingRetry {
    fn abort(self) {
        match self {
            PendingRetry::Timer(task) | PendingRetry::Online(task) => task.abort(),
        }
    }
}

struct Inner {
    active: Option<ActiveConnection>,
    /// Bumped on every start
    generation: u64,
    pending_retry: Option<PendingRetry>,
    retry: RetryPolicy,
    /// First-run sync still owed to the next connection that opens
    pending_first_run: bool,
    shut_down: bool,
}

struct Shared {
    config: IntakeConfig,
    settings: Arc<dyn SettingsStore>,
    factory: Arc<dyn ReceiverFactory>,
    network: Arc<dyn NetworkMonitor>,
    reconciler: Arc<ConversationReconciler>,
    receipts: Arc<ReceiptTracker>,
    sync: SyncOrchestrator,
    signals: SignalBus,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
    commands: mpsc::UnboundedSender<SupervisorCommand>,
    faults: mpsc::UnboundedSender<IntakeError>,
}

/// Lifecycle handle for the receive connection
#[derive(Clone)]
pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
}

impl ConnectionSupervisor {
    /// Create the supervisor and its control loop
    ///
    /// Returns the handle and the receiver for fatal errors. Requires a
    /// running Tokio runtime.
    pub fn spawn(
        config: IntakeConfig,
        settings: Arc<dyn SettingsStore>,
        records: Arc<dyn RecordStore>,
        factory: Arc<dyn ReceiverFactory>,
        network: Arc<dyn NetworkMonitor>,
    ) -> (Self, mpsc::UnboundedReceiver<IntakeError>) {
        let signals = SignalBus::new(config.signal_buffer);
        let reconciler = Arc::new(ConversationReconciler::new(records, signals.clone()));
        let sync = SyncOrchestrator::new(settings.clone(), signals.clone(), config.sync_timeout);
        let (state, _) = watch::channel(ConnectionState::Stopped);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                active: None,
                generation: 0,
                pending_retry: None,
                retry: RetryPolicy::from_config(&config),
                pending_first_run: false,
                shut_down: false,
            }),
            config,
            settings,
            factory,
            network,
            reconciler,
            receipts: Arc::new(ReceiptTracker::new()),
            sync,
            signals,
            state,
            commands: command_tx,
            faults: fault_tx,
        });

        tokio::spawn(control_loop(Arc::downgrade(&shared), command_rx));

        (Self { shared }, fault_rx)
    }

    pub fn signals(&self) -> &SignalBus {
        &self.shared.signals
    }

    pub fn reconciler(&self) -> &Arc<ConversationReconciler> {
        &self.shared.reconciler
    }

    pub fn receipts(&self) -> &Arc<ReceiptTracker> {
        &self.shared.receipts
    }

    pub fn config(&self) -> &IntakeConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Ready-state of the open connection, or -1 when there is none
    pub async fn socket_status(&self) -> i32 {
        let inner = self.shared.inner.lock().await;
        inner
            .active
            .as_ref()
            .map(|active| active.control.status())
            .unwrap_or(NO_CONNECTION_STATUS)
    }

    /// Handle for the registration flow
    pub async fn account_manager(&self) -> Result<AccountManager> {
        AccountManager::new(
            self.shared.config.endpoint.clone(),
            self.shared.settings.clone(),
            self.clone(),
        )
        .await
    }

    /// Open a receive connection, replacing any open one
    ///
    /// Returns immediately when registration is incomplete. With `first_run`
    /// set, a linked device also requests a contact/group sync.
    pub async fn start(&self, first_run: bool) -> Result<()> {
        self.start_generation(first_run, None).await
    }

    /// Start, but only while `expected` is still the current generation
    ///
    /// The check runs under the same lock as the start, so a retry cannot
    /// replace a connection opened by a newer start.
    async fn start_generation(&self, first_run: bool, expected: Option<u64>) -> Result<()> {
        let registration = Registration::new(self.shared.settings.clone());
        if !registration.is_done().await? {
            debug!("Registration incomplete, not starting");
            return Ok(());
        }

        let credentials = Credentials::load(self.shared.settings.as_ref()).await?;
        let account = credentials.account();

        let mut inner = self.shared.inner.lock().await;
        if inner.shut_down {
            return Err(IntakeError::Cancelled("supervisor shut down".to_string()));
        }
        if let Some(expected) = expected {
            if inner.generation != expected {
                debug!("Ignoring retry scheduled for generation {}", expected);
                return Ok(());
            }
        }

        // a first run survives failed opens until a connection is up
        let first_run = first_run || inner.pending_first_run;
        inner.pending_first_run = SyncOrchestrator::should_sync(first_run, &account);

        // a fresh start supersedes any pending retry path
        if let Some(pending) = inner.pending_retry.take() {
            pending.abort();
        }
        if let Some(active) = inner.active.take() {
            active.close().await;
        }

        inner.generation += 1;
        let generation = inner.generation;
        self.set_state(ConnectionState::Starting);
        info!(
            "Starting receive connection for {}.{} (generation {})",
            account.number, account.device_id, generation
        );

        let opened = match self
            .shared
            .factory
            .open(&self.shared.config.endpoint, &credentials)
            .await
        {
            Ok(opened) => opened,
            Err(e) if e.is_no_connection() => {
                warn!("Failed to connect: {}", e);
                self.on_connect_failed(&mut inner, generation).await;
                return Ok(());
            }
            Err(e) => {
                error!("Failed to open receive connection: {}", e);
                self.abandon_first_run(&mut inner);
                self.set_state(ConnectionState::Stopped);
                return Err(e);
            }
        };
        inner.pending_first_run = false;

        let dispatcher = IntakeDispatcher::new(
            account.number.clone(),
            self.shared.reconciler.clone(),
            self.shared.receipts.clone(),
        );
        let pump = tokio::spawn(pump_events(
            generation,
            opened.events,
            dispatcher,
            self.shared.commands.clone(),
        ));

        let control = opened.control;
        inner.active = Some(ActiveConnection {
            control: control.clone(),
            pump,
            generation,
        });
        self.set_state(ConnectionState::Connected);
        drop(inner);

        // the sync task reports through signals; its handle is not needed
        if self.shared.sync.begin(first_run, &account, control).await?.is_some() {
            debug!("Contact sync started");
        }

        Ok(())
    }

    /// Stop accepting events, close the connection and let queued saves complete
    pub async fn shutdown(&self) {
        {
            let mut inner = self.shared.inner.lock().await;
            inner.shut_down = true;
            if let Some(pending) = inner.pending_retry.take() {
                pending.abort();
            }
            if let Some(active) = inner.active.take() {
                active.close().await;
            }
            self.abandon_first_run(&mut inner);
            self.set_state(ConnectionState::Stopped);
        }

        self.shared.reconciler.save_queue().shutdown().await;
        info!("Connection supervisor shut down");
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.shared.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!("Connection state: {}", state);
            self.shared.signals.emit(IntakeSignal::ConnectionState(state));
        }
    }

    async fn handle_command(&self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::Restart { generation } => {
                if let Err(e) = self.start_generation(false, Some(generation)).await {
                    error!("Retry failed: {}", e);
                }
            }
            SupervisorCommand::ConnectFailed { generation } => {
                let mut inner = self.shared.inner.lock().await;
                if inner.generation == generation {
                    self.on_connect_failed(&mut inner, generation).await;
                }
            }
            SupervisorCommand::Healthy { generation } => {
                let mut inner = self.shared.inner.lock().await;
                if inner.generation == generation {
                    inner.retry.reset();
                }
            }
            SupervisorCommand::StreamClosed { generation } => {
                let mut inner = self.shared.inner.lock().await;
                if inner.generation != generation {
                    return;
                }
                if let Some(active) = inner.active.take() {
                    active.close().await;
                }
                if inner.pending_retry.is_none() {
                    info!("Receive connection ended");
                    self.set_state(ConnectionState::Stopped);
                }
            }
            SupervisorCommand::Fatal { generation, error } => {
                error!("Unhandled error on receive connection: {}", error);
                {
                    let mut inner = self.shared.inner.lock().await;
                    if inner.generation == generation {
                        if let Some(active) = inner.active.take() {
                            active.close().await;
                        }
                        if let Some(pending) = inner.pending_retry.take() {
                            pending.abort();
                        }
                        self.abandon_first_run(&mut inner);
                        self.set_state(ConnectionState::Stopped);
                    }
                }
                if self.shared.faults.send(error).is_err() {
                    warn!("No fault receiver, dropping fatal error");
                }
            }
        }
    }

    /// A first-run sync that can no longer be requested ends as a timeout
    fn abandon_first_run(&self, inner: &mut Inner) {
        if std::mem::take(&mut inner.pending_first_run) {
            info!("sync timed out");
            self.shared
                .signals
                .emit(IntakeSignal::ContactSyncComplete { synced: false });
        }
    }

    /// Schedule the single retry path for a "failed to connect" error
    async fn on_connect_failed(&self, inner: &mut Inner, generation: u64) {
        if inner.pending_retry.is_some() {
            debug!("Retry already pending");
            return;
        }

        let mut online_rx = self.shared.network.subscribe();
        let online = *online_rx.borrow_and_update();
        let commands = self.shared.commands.clone();

        if online {
            let Some(delay) = inner.retry.next_delay() else {
                error!("Giving up on receive connection ({})", inner.retry.status());
                if let Some(active) = inner.active.take() {
                    active.close().await;
                }
                self.abandon_first_run(inner);
                self.set_state(ConnectionState::Stopped);
                return;
            };

            info!("retrying in {:?} ({})", delay, inner.retry.status());
            let timer = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = commands.send(SupervisorCommand::Restart { generation });
            });
            inner.pending_retry = Some(PendingRetry::Timer(timer));
        } else {
            info!("offline");
            if let Some(active) = inner.active.take() {
                active.close().await;
            }

            let listener = tokio::spawn(async move {
                loop {
                    if online_rx.changed().await.is_err() {
                        return;
                    }
                    if *online_rx.borrow_and_update() {
                        break;
                    }
                }
                debug!("Device back online");
                let _ = commands.send(SupervisorCommand::Restart { generation });
            });
            inner.pending_retry = Some(PendingRetry::Online(listener));
        }

        self.set_state(ConnectionState::Reconnecting);
    }
}

async fn control_loop(shared: Weak<Shared>, mut commands: mpsc::UnboundedReceiver<SupervisorCommand>) {
    while let Some(command) = commands.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        ConnectionSupervisor { shared }.handle_command(command).await;
    }
    debug!("Supervisor control loop stopped");
}

/// Dispatch events from one connection, one at a time in arrival order
async fn pump_events(
    generation: u64,
    mut events: mpsc::Receiver<RawEvent>,
    dispatcher: IntakeDispatcher,
    commands: mpsc::UnboundedSender<SupervisorCommand>,
) {
    let mut healthy = false;

    while let Some(raw) = events.recv().await {
        match dispatcher.dispatch_raw(&raw).await {
            Ok(DispatchOutcome::Handled) => {
                if !healthy && !raw.is_type(EVENT_ERROR) {
                    healthy = true;
                    let _ = commands.send(SupervisorCommand::Healthy { generation });
                }
            }
            Ok(DispatchOutcome::Dropped) => {}
            Ok(DispatchOutcome::ConnectionLost) => {
                let _ = commands.send(SupervisorCommand::ConnectFailed { generation });
            }
            Err(e) if e.is_fatal() => {
                let _ = commands.send(SupervisorCommand::Fatal { generation, error: e });
                return;
            }
            Err(e) => {
                warn!("Failed to process {} event: {}", raw.event_type, e);
            }
        }
    }

    let _ = commands.send(SupervisorCommand::StreamClosed { generation });
}
