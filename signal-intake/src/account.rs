//! Account, Credentials and Registration
//!
//! Credentials are read-only inputs sourced from the settings store. The
//! registration flags live there too; [`AccountManager`] is the handle given
//! to the registration flow, which calls
//! [`complete_registration`](AccountManager::complete_registration) once the
//! device has been provisioned.

use crate::config::ServiceEndpoint;
use crate::connection::ConnectionSupervisor;
use crate::storage::{keys, SettingsStore};
use crate::{IntakeError, Result, PRIMARY_DEVICE_ID};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Credentials for the receive connection
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// `<number>.<device>` as stored under `number_id`
    pub username: String,
    pub password: String,
    pub signaling_key: String,
}

impl Credentials {
    /// Load credentials from settings
    pub async fn load(settings: &dyn SettingsStore) -> Result<Self> {
        Ok(Self {
            username: required(settings, keys::NUMBER_ID).await?,
            password: required(settings, keys::PASSWORD).await?,
            signaling_key: required(settings, keys::SIGNALING_KEY).await?,
        })
    }

    pub fn account(&self) -> LocalAccount {
        LocalAccount::parse(&self.username)
    }
}

// Keep secrets out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("signaling_key", &"<redacted>")
            .finish()
    }
}

async fn required(settings: &dyn SettingsStore, key: &str) -> Result<String> {
    settings
        .get_string(key)
        .await?
        .filter(|v| !v.is_empty())
        .ok_or_else(|| IntakeError::MissingCredential(key.to_string()))
}

/// Local account number and device id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAccount {
    pub number: String,
    pub device_id: u32,
}

impl LocalAccount {
    /// Parse `<number>.<device>`; a missing or invalid suffix means the primary device
    pub fn parse(number_id: &str) -> Self {
        match number_id.rsplit_once('.') {
            Some((number, device)) => match device.parse::<u32>() {
                Ok(device_id) => Self {
                    number: number.to_string(),
                    device_id,
                },
                Err(_) => Self {
                    number: number_id.to_string(),
                    device_id: PRIMARY_DEVICE_ID,
                },
            },
            None => Self {
                number: number_id.to_string(),
                device_id: PRIMARY_DEVICE_ID,
            },
        }
    }

    pub fn is_primary(&self) -> bool {
        self.device_id == PRIMARY_DEVICE_ID
    }
}

/// Registration flags backed by settings
#[derive(Clone)]
pub struct Registration {
    settings: Arc<dyn SettingsStore>,
}

impl Registration {
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self { settings }
    }

    pub async fn is_done(&self) -> Result<bool> {
        self.settings.get_flag(keys::REGISTRATION_DONE).await
    }

    /// Whether this device has ever completed registration
    pub async fn ever_done(&self) -> Result<bool> {
        Ok(self.settings.get_flag(keys::REGISTRATION_DONE_EVER).await?
            || self.is_done().await?)
    }

    pub async fn mark_done(&self) -> Result<()> {
        self.settings
            .put(keys::REGISTRATION_DONE_EVER, Value::Bool(true))
            .await?;
        self.settings
            .put(keys::REGISTRATION_DONE, Value::Bool(true))
            .await
    }

    /// Clear the current registration, keeping the "ever done" marker
    pub async fn remove(&self) -> Result<()> {
        self.settings.remove(keys::REGISTRATION_DONE).await
    }
}

/// Handle for the registration flow
pub struct AccountManager {
    endpoint: ServiceEndpoint,
    username: Option<String>,
    password: Option<String>,
    settings: Arc<dyn SettingsStore>,
    supervisor: ConnectionSupervisor,
}

impl AccountManager {
    /// Snapshot the current credentials; either may be absent before provisioning
    pub async fn new(
        endpoint: ServiceEndpoint,
        settings: Arc<dyn SettingsStore>,
        supervisor: ConnectionSupervisor,
    ) -> Result<Self> {
        let username = settings.get_string(keys::NUMBER_ID).await?;
        let password = settings.get_string(keys::PASSWORD).await?;
        Ok(Self {
            endpoint,
            username,
            password,
            settings,
            supervisor,
        })
    }

    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    /// Finish registration and start receiving with first-run semantics
    ///
    /// Safety-number approval defaults to off on a device that never
    /// registered before. Registration is marked done before the connection
    /// starts, because `start` is a no-op for unregistered devices.
    pub async fn complete_registration(&self) -> Result<()> {
        let registration = Registration::new(self.settings.clone());

        if !registration.ever_done().await? {
            self.settings
                .put(keys::SAFETY_NUMBERS_APPROVAL, Value::Bool(false))
                .await?;
        }
        registration.mark_done().await?;

        info!("Registration complete, starting receive connection");
        self.supervisor.start(true).await
    }
}
