//! Shared mocks for integration tests

#![allow(dead_code)]

use serde_json::{json, Value};
use signal_intake::connection::transport::status;
use signal_intake::storage::keys;
use signal_intake::{
    Credentials, IntakeError, MemoryStore, OpenedConnection, RawEvent, ReceiveConnection,
    ReceiverFactory, Result, ServiceEndpoint, SettingsStore,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Settings for a registered account
pub async fn registered_settings(number_id: &str) -> Arc<MemoryStore> {
    let settings = unregistered_settings(number_id).await;
    settings
        .put(keys::REGISTRATION_DONE, Value::Bool(true))
        .await
        .unwrap();
    settings
        .put(keys::REGISTRATION_DONE_EVER, Value::Bool(true))
        .await
        .unwrap();
    settings
}

/// Settings holding credentials but no registration flags
pub async fn unregistered_settings(number_id: &str) -> Arc<MemoryStore> {
    let settings = Arc::new(MemoryStore::new());
    settings.put(keys::NUMBER_ID, json!(number_id)).await.unwrap();
    settings.put(keys::PASSWORD, json!("password")).await.unwrap();
    settings
        .put(keys::SIGNALING_KEY, json!("signaling-key"))
        .await
        .unwrap();
    settings
}

pub fn no_connection_error() -> RawEvent {
    RawEvent::new(
        "error",
        json!({ "error": { "name": "HTTPError", "code": -1, "message": "Failed to connect" } }),
    )
}

/// Poll `check` until it holds, panicking after two seconds
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    open_now: AtomicUsize,
    max_open: AtomicUsize,
}

/// Scripted transport: the n-th open delivers the n-th script
///
/// Connections stay open after their script until closed, so the stream only
/// ends on `close`.
pub struct MockFactory {
    scripts: Mutex<Vec<Vec<RawEvent>>>,
    counters: Arc<Counters>,
    senders: Mutex<Vec<mpsc::Sender<RawEvent>>>,
    fail_opens: AtomicUsize,
    open_delay: Duration,
    sync_delay: Option<Duration>,
}

impl MockFactory {
    pub fn new(scripts: Vec<Vec<RawEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            counters: Arc::new(Counters::default()),
            senders: Mutex::new(Vec::new()),
            fail_opens: AtomicUsize::new(0),
            open_delay: Duration::ZERO,
            sync_delay: None,
        }
    }

    /// The first `count` opens fail with "failed to connect"
    pub fn failing_opens(self, count: usize) -> Self {
        self.fail_opens.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Sync requests resolve after `delay`; without one they never resolve
    pub fn with_sync_delay(mut self, delay: Duration) -> Self {
        self.sync_delay = Some(delay);
        self
    }

    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn open_now(&self) -> usize {
        self.counters.open_now.load(Ordering::SeqCst)
    }

    pub fn max_open(&self) -> usize {
        self.counters.max_open.load(Ordering::SeqCst)
    }

    /// Deliver an event on the most recently opened connection
    pub async fn push(&self, event: RawEvent) {
        let sender = self.senders.lock().await.last().cloned();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }
}

#[async_trait::async_trait]
impl ReceiverFactory for MockFactory {
    async fn open(&self, _endpoint: &ServiceEndpoint, _credentials: &Credentials) -> Result<OpenedConnection> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        let index = self.counters.opens.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(IntakeError::Transport {
                name: "HTTPError".to_string(),
                code: Some(-1),
                message: "Failed to connect".to_string(),
            });
        }

        let now = self.counters.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_open.fetch_max(now, Ordering::SeqCst);

        let script = self
            .scripts
            .lock()
            .await
            .get(index)
            .cloned()
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(64);
        for event in script {
            tx.send(event).await.unwrap();
        }
        self.senders.lock().await.push(tx.clone());

        Ok(OpenedConnection {
            events: rx,
            control: Arc::new(MockConnection {
                counters: self.counters.clone(),
                sender: Mutex::new(Some(tx)),
                closed: AtomicBool::new(false),
                state: AtomicI32::new(status::OPEN),
                sync_delay: self.sync_delay,
            }),
        })
    }
}

struct MockConnection {
    counters: Arc<Counters>,
    sender: Mutex<Option<mpsc::Sender<RawEvent>>>,
    closed: AtomicBool,
    state: AtomicI32,
    sync_delay: Option<Duration>,
}

#[async_trait::async_trait]
impl ReceiveConnection for MockConnection {
    fn status(&self) -> i32 {
        self.state.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.open_now.fetch_sub(1, Ordering::SeqCst);
        }
        self.sender.lock().await.take();
        self.state.store(status::CLOSED, Ordering::SeqCst);
    }

    async fn request_sync(&self) -> Result<()> {
        match self.sync_delay {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => std::future::pending::<Result<()>>().await,
        }
    }
}
