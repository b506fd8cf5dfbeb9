//! Persistence Collaborators
//!
//! Storage itself lives outside this crate. The core talks to it through two
//! narrow traits:
//!
//! - [`SettingsStore`]: key-value settings and credentials
//! - [`RecordStore`]: conversation and message records
//!
//! Record saves go through a [`SaveQueue`], an ordered background writer, so
//! event processing never waits on a save. Callers that need the writes on
//! disk (tests, shutdown) use [`SaveQueue::flush`] or [`SaveQueue::shutdown`].

use crate::conversation::Conversation;
use crate::message::Message;
use crate::{IntakeError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Settings keys read or written by the core
pub mod keys {
    pub const NUMBER_ID: &str = "number_id";
    pub const PASSWORD: &str = "password";
    pub const SIGNALING_KEY: &str = "signaling_key";
    pub const REGISTRATION_DONE: &str = "chromiumRegistrationDone";
    pub const REGISTRATION_DONE_EVER: &str = "chromiumRegistrationDoneEver";
    pub const SAFETY_NUMBERS_APPROVAL: &str = "safety-numbers-approval";
    pub const THEME_SETTING: &str = "theme-setting";
    pub const USER_AGENT: &str = "userAgent";
    pub const SYNCED_AT: &str = "synced_at";
}

/// Key-value settings storage
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn put(&self, key: &str, value: Value) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Read a string setting
    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .get(key)
            .await?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Read a boolean setting, `false` when absent
    async fn get_flag(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.and_then(|v| v.as_bool()).unwrap_or(false))
    }
}

/// Conversation and message record storage
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()>;

    async fn save_message(&self, message: &Message) -> Result<()>;
}

/// In-memory store implementing both collaborator traits
#[derive(Default)]
pub struct MemoryStore {
    settings: RwLock<HashMap<String, Value>>,
    conversations: RwLock<HashMap<String, Conversation>>,
    messages: RwLock<Vec<Message>>,
    conversation_saves: RwLock<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.messages.read().await.clone()
    }

    pub async fn conversation(&self, id: &str) -> Option<Conversation> {
        self.conversations.read().await.get(id).cloned()
    }

    /// Number of conversation saves performed so far
    pub async fn conversation_save_count(&self) -> usize {
        *self.conversation_saves.read().await
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.settings.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.settings.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.settings.write().await.remove(key);
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        Ok(self.conversations.read().await.get(id).cloned())
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), conversation.clone());
        *self.conversation_saves.write().await += 1;
        Ok(())
    }

    async fn save_message(&self, message: &Message) -> Result<()> {
        self.messages.write().await.push(message.clone());
        Ok(())
    }
}

/// File-backed settings stored as a single JSON object
pub struct JsonSettingsStore {
    path: PathBuf,
    values: RwLock<Map<String, Value>>,
}

impl JsonSettingsStore {
    /// Open the settings file, starting empty if it does not exist
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let values = if path.exists() {
            let json = fs::read_to_string(&path).await?;
            match serde_json::from_str::<Value>(&json)? {
                Value::Object(map) => map,
                _ => {
                    return Err(IntakeError::storage(format!(
                        "settings file {} is not a JSON object",
                        path.display()
                    )))
                }
            }
        } else {
            debug!("No settings file at {}, starting fresh", path.display());
            Map::new()
        };

        info!("Loaded {} settings from {}", values.len(), path.display());

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, values: &Map<String, Value>) -> Result<()> {
        let json = serde_json::to_string_pretty(values)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, json).await?;

        debug!("Persisted {} settings to {}", values.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for JsonSettingsStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        let mut values = self.values.write().await;
        values.insert(key.to_string(), value);
        self.persist(&values).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.write().await;
        if values.remove(key).is_some() {
            self.persist(&values).await?;
        }
        Ok(())
    }
}

enum SaveCommand {
    Conversation(Conversation),
    Message(Message),
    Flush(oneshot::Sender<()>),
}

/// Ordered background writer for record saves
#[derive(Clone)]
pub struct SaveQueue {
    tx: mpsc::UnboundedSender<SaveCommand>,
    writer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SaveQueue {
    /// Spawn the writer task; requires a running Tokio runtime
    pub fn spawn(store: Arc<dyn RecordStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SaveCommand>();

        let writer = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    SaveCommand::Conversation(conversation) => {
                        if let Err(e) = store.save_conversation(&conversation).await {
                            warn!("Failed to save conversation {}: {}", conversation.id, e);
                        }
                    }
                    SaveCommand::Message(message) => {
                        if let Err(e) = store.save_message(&message).await {
                            warn!("Failed to save message {}: {}", message.id, e);
                        }
                    }
                    SaveCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Save queue writer stopped");
        });

        Self {
            tx,
            writer: Arc::new(Mutex::new(Some(writer))),
        }
    }

    pub fn save_conversation(&self, conversation: Conversation) {
        if self.tx.send(SaveCommand::Conversation(conversation)).is_err() {
            warn!("Save queue closed, dropping conversation save");
        }
    }

    pub fn save_message(&self, message: Message) {
        if self.tx.send(SaveCommand::Message(message)).is_err() {
            warn!("Save queue closed, dropping message save");
        }
    }

    /// Wait until every save queued before this call has been written
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(SaveCommand::Flush(done_tx))
            .map_err(|_| IntakeError::Cancelled("save queue closed".to_string()))?;
        done_rx
            .await
            .map_err(|_| IntakeError::Cancelled("save queue closed".to_string()))
    }

    /// Let in-flight saves complete, then stop the writer
    pub async fn shutdown(&self) {
        if self.flush().await.is_err() {
            debug!("Save queue already stopped");
        }
        if let Some(writer) = self.writer.lock().await.take() {
            writer.abort();
        }
    }
}
