//! Conversation Reconciler
//!
//! Owns the in-memory representation of every conversation touched since
//! start-up and folds messages, contact/group sync records and per-message
//! failures into it.
//!
//! ## Ordering
//!
//! Events reach the reconciler one at a time, but saves are queued on a
//! [`SaveQueue`] and complete later. Every mutation is therefore a
//! read-modify-write against the cached conversation, never against the
//! result of a pending save. Unknown ids are loaded from the
//! [`RecordStore`] once, then served from the cache.
//!
//! ## Timestamp rule
//!
//! A conversation's `timestamp` follows the maximum `sent_at` seen: the first
//! value is taken unconditionally, afterwards only a strictly greater value
//! replaces it.

use crate::event::{ContactDetails, GroupDetails};
use crate::message::{Message, MessageError};
use crate::signals::{IntakeSignal, SignalBus};
use crate::storage::{RecordStore, SaveQueue};
use crate::{current_timestamp, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Conversation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Private,
    Group,
}

/// Aggregate state of all communication with one contact or group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Contact number or group id
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub color: Option<String>,
    /// Group members (empty for private conversations)
    pub members: Vec<String>,
    /// Last local activity (ms)
    pub active_at: Option<i64>,
    /// Soft-removal flag for groups this account left
    pub left: bool,
    pub unread_count: u32,
    /// Ordering key, max `sent_at` of reconciled messages
    pub timestamp: Option<i64>,
    /// Preview of the latest reconciled message
    pub last_message: Option<String>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, kind: ConversationKind) -> Self {
        Self {
            id: id.into(),
            kind,
            name: None,
            avatar: None,
            color: None,
            members: Vec::new(),
            active_at: None,
            left: false,
            unread_count: 0,
            timestamp: None,
            last_message: None,
        }
    }

    pub fn is_group(&self) -> bool {
        self.kind == ConversationKind::Group
    }

    /// Advance the ordering key; returns true if it changed
    pub fn advance_timestamp(&mut self, sent_at: i64) -> bool {
        match self.timestamp {
            Some(current) if sent_at <= current => false,
            _ => {
                self.timestamp = Some(sent_at);
                true
            }
        }
    }

    /// Display title, falling back to the id
    pub fn title(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Folds events into conversation state
pub struct ConversationReconciler {
    store: Arc<dyn RecordStore>,
    saves: SaveQueue,
    signals: SignalBus,
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl ConversationReconciler {
    /// Create a reconciler; spawns the save queue writer
    pub fn new(store: Arc<dyn RecordStore>, signals: SignalBus) -> Self {
        let saves = SaveQueue::spawn(store.clone());
        Self {
            store,
            saves,
            signals,
            conversations: RwLock::new(HashMap::new()),
        }
    }

    pub fn save_queue(&self) -> &SaveQueue {
        &self.saves
    }

    pub fn signals(&self) -> &SignalBus {
        &self.signals
    }

    /// Apply a contact sync record
    pub async fn on_contact(&self, details: &ContactDetails) -> Result<Conversation> {
        let mut conversations = self.conversations.write().await;
        let conversation = self
            .find_or_create(&mut conversations, &details.number, ConversationKind::Private)
            .await?;

        conversation.name = details.name.clone();
        conversation.avatar = details.avatar.clone();
        conversation.color = details.color.clone();
        conversation.active_at = Some(current_timestamp());

        debug!("Contact sync for {}", details.number);
        let snapshot = conversation.clone();
        self.saves.save_conversation(snapshot.clone());
        Ok(snapshot)
    }

    /// Apply a group sync record
    pub async fn on_group(&self, details: &GroupDetails) -> Result<Conversation> {
        let mut conversations = self.conversations.write().await;
        let conversation = self
            .find_or_create(&mut conversations, &details.id, ConversationKind::Group)
            .await?;

        conversation.members = details.members.clone();
        conversation.name = details.name.clone();
        conversation.avatar = details.avatar.clone();
        if details.active {
            conversation.active_at = Some(current_timestamp());
            conversation.left = false;
        } else {
            conversation.left = true;
        }

        debug!(
            "Group sync for {} ({} members, active: {})",
            details.id,
            details.members.len(),
            details.active
        );
        let snapshot = conversation.clone();
        self.saves.save_conversation(snapshot.clone());
        Ok(snapshot)
    }

    /// Fold a materialized message into its conversation and notify observers
    pub async fn on_message(&self, message: Message) -> Result<Conversation> {
        let snapshot = self.reconcile(&message).await?;
        self.notify(&snapshot, &message);
        self.saves.save_message(message);
        Ok(snapshot)
    }

    /// Record a per-message failure against its conversation
    pub async fn on_error(&self, mut message: Message, error: MessageError) -> Result<Conversation> {
        info!(
            "Recording {} for message from {} at {}",
            error.name, message.source, message.sent_at
        );
        message.attach_error(error);
        // unread arrival is what bumps the count
        message.unread = 1;

        let snapshot = self.reconcile(&message).await?;
        self.notify(&snapshot, &message);
        self.saves.save_message(message);
        Ok(snapshot)
    }

    fn notify(&self, conversation: &Conversation, message: &Message) {
        self.signals.emit(IntakeSignal::NewMessage {
            conversation_id: conversation.id.clone(),
            message_id: message.id.clone(),
        });
        if message.is_incoming() && message.is_unread() {
            self.signals.emit(IntakeSignal::NotifyUser {
                conversation_id: conversation.id.clone(),
                message_id: message.id.clone(),
            });
        }
    }

    /// Current cached state of a conversation
    pub async fn conversation(&self, id: &str) -> Option<Conversation> {
        self.conversations.read().await.get(id).cloned()
    }

    /// Cached conversations ordered by `timestamp`, newest first
    pub async fn inbox(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self.conversations.read().await.values().cloned().collect();
        list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub async fn total_unread(&self) -> u32 {
        self.conversations
            .read()
            .await
            .values()
            .map(|c| c.unread_count)
            .sum()
    }

    async fn reconcile(&self, message: &Message) -> Result<Conversation> {
        let kind = if message.group_id.is_some() {
            ConversationKind::Group
        } else {
            ConversationKind::Private
        };

        let mut conversations = self.conversations.write().await;
        let conversation = self
            .find_or_create(&mut conversations, &message.conversation_id, kind)
            .await?;

        if message.is_unread() {
            conversation.unread_count += 1;
        }
        conversation.active_at = Some(current_timestamp());
        conversation.advance_timestamp(message.sent_at);
        if let Some(preview) = message.preview() {
            conversation.last_message = Some(preview);
        }

        let snapshot = conversation.clone();
        self.saves.save_conversation(snapshot.clone());
        Ok(snapshot)
    }

    async fn find_or_create<'a>(
        &self,
        conversations: &'a mut HashMap<String, Conversation>,
        id: &str,
        kind: ConversationKind,
    ) -> Result<&'a mut Conversation> {
        if !conversations.contains_key(id) {
            let conversation = match self.store.load_conversation(id).await? {
                Some(existing) => existing,
                None => {
                    debug!("Creating {:?} conversation {}", kind, id);
                    Conversation::new(id, kind)
                }
            };
            conversations.insert(id.to_string(), conversation);
        }

        conversations
            .get_mut(id)
            .ok_or_else(|| crate::IntakeError::invalid_state(format!("conversation {} vanished", id)))
    }
}
