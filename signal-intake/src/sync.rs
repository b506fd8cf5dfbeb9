//! Sync Orchestrator
//!
//! After the first successful registration of a linked (non-primary) device,
//! asks the primary device for its contacts and groups. The request runs on
//! its own task with a timeout so the receive loop is never delayed. Exactly
//! one outcome is produced per attempt:
//!
//! - success: `synced_at` is persisted, then `ContactSyncComplete` is emitted
//! - timeout (or a failed request): `ContactSyncComplete` is emitted, nothing persisted

use crate::account::LocalAccount;
use crate::connection::ReceiveConnection;
use crate::signals::{IntakeSignal, SignalBus};
use crate::storage::{keys, SettingsStore};
use crate::{current_timestamp, Result, LEGACY_USER_AGENT};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of one sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Success,
    Timeout,
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    settings: Arc<dyn SettingsStore>,
    signals: SignalBus,
    timeout: Duration,
}

impl SyncOrchestrator {
    pub fn new(settings: Arc<dyn SettingsStore>, signals: SignalBus, timeout: Duration) -> Self {
        Self {
            settings,
            signals,
            timeout,
        }
    }

    /// Only a first run on a linked device syncs
    pub fn should_sync(first_run: bool, account: &LocalAccount) -> bool {
        first_run && !account.is_primary()
    }

    /// Default the appearance for legacy clients; returns true if it was set
    pub async fn apply_theme_default(&self) -> Result<bool> {
        if self.settings.get(keys::THEME_SETTING).await?.is_some() {
            return Ok(false);
        }
        let agent = self.settings.get_string(keys::USER_AGENT).await?;
        if agent.as_deref() != Some(LEGACY_USER_AGENT) {
            return Ok(false);
        }

        self.settings
            .put(keys::THEME_SETTING, Value::String("ios".to_string()))
            .await?;
        debug!("Applied default theme for {}", LEGACY_USER_AGENT);
        Ok(true)
    }

    /// Start a sync attempt if this run calls for one
    pub async fn begin(
        &self,
        first_run: bool,
        account: &LocalAccount,
        connection: Arc<dyn ReceiveConnection>,
    ) -> Result<Option<JoinHandle<SyncOutcome>>> {
        if !Self::should_sync(first_run, account) {
            return Ok(None);
        }

        if let Err(e) = self.apply_theme_default().await {
            warn!("Failed to apply default theme: {}", e);
        }

        info!("Requesting contact and group sync from primary device");
        let orchestrator = self.clone();
        Ok(Some(tokio::spawn(async move { orchestrator.run(connection).await })))
    }

    /// Run one sync attempt to completion
    pub async fn run(&self, connection: Arc<dyn ReceiveConnection>) -> SyncOutcome {
        let outcome = match tokio::time::timeout(self.timeout, connection.request_sync()).await {
            Ok(Ok(())) => SyncOutcome::Success,
            Ok(Err(e)) => {
                warn!("Sync request failed: {}", e);
                SyncOutcome::Timeout
            }
            Err(_) => SyncOutcome::Timeout,
        };

        match outcome {
            SyncOutcome::Success => {
                info!("sync successful");
                if let Err(e) = self
                    .settings
                    .put(keys::SYNCED_AT, Value::from(current_timestamp()))
                    .await
                {
                    warn!("Failed to persist sync time: {}", e);
                }
            }
            SyncOutcome::Timeout => info!("sync timed out"),
        }

        self.signals.emit(IntakeSignal::ContactSyncComplete {
            synced: outcome == SyncOutcome::Success,
        });
        outcome
    }
}
