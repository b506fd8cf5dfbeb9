//! JSON-Lines Replay Transport
//!
//! Feeds raw events from a line-oriented source, one JSON object per line:
//!
//! ```text
//! {"type":"contact","body":{"number":"+15550001","name":"Ann"}}
//! {"type":"message","body":{"source":"+15550001","timestamp":1000,"message":{"body":"hi"}}}
//! ```
//!
//! Every connection opened from the same [`ReplayFactory`] continues reading
//! where the previous one stopped, the way a server redelivers whatever was
//! not yet received. Blank and malformed lines are skipped. A sync request
//! resolves once the connection has read the source to its end.

use super::transport::{status, OpenedConnection, ReceiveConnection, ReceiverFactory};
use crate::account::Credentials;
use crate::config::ServiceEndpoint;
use crate::event::RawEvent;
use crate::{IntakeError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Channel capacity between the reader task and the supervisor
const REPLAY_BUFFER: usize = 64;

type LineSource = Lines<Box<dyn AsyncBufRead + Send + Unpin>>;

/// Opens replay connections over a shared line source
pub struct ReplayFactory {
    lines: Arc<Mutex<LineSource>>,
}

impl ReplayFactory {
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncBufRead + Send + Unpin> = Box::new(reader);
        Self {
            lines: Arc::new(Mutex::new(reader.lines())),
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref()).await?;
        info!("Replaying events from {}", path.as_ref().display());
        Ok(Self::from_reader(BufReader::new(file)))
    }

    pub fn stdin() -> Self {
        info!("Replaying events from stdin");
        Self::from_reader(BufReader::new(tokio::io::stdin()))
    }
}

#[async_trait]
impl ReceiverFactory for ReplayFactory {
    async fn open(&self, endpoint: &ServiceEndpoint, credentials: &Credentials) -> Result<OpenedConnection> {
        debug!(
            "Opening replay connection for {} (endpoint {})",
            credentials.username, endpoint.server_url
        );

        let (tx, rx) = mpsc::channel(REPLAY_BUFFER);
        let (done_tx, done_rx) = watch::channel(false);
        let state = Arc::new(AtomicI32::new(status::OPEN));

        let reader = tokio::spawn(read_lines(self.lines.clone(), tx, done_tx, state.clone()));

        Ok(OpenedConnection {
            events: rx,
            control: Arc::new(ReplayConnection {
                state,
                done: done_rx,
                reader: Mutex::new(Some(reader)),
            }),
        })
    }
}

async fn read_lines(
    lines: Arc<Mutex<LineSource>>,
    events: mpsc::Sender<RawEvent>,
    done: watch::Sender<bool>,
    state: Arc<AtomicI32>,
) {
    let mut line_no = 0usize;

    loop {
        let next = lines.lock().await.next_line().await;
        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Replay read failed: {}", e);
                break;
            }
        };
        line_no += 1;

        if line.trim().is_empty() {
            continue;
        }
        match RawEvent::from_line(&line) {
            Ok(event) => {
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("Skipping malformed replay line {}: {}", line_no, e),
        }
    }

    debug!("Replay source exhausted after {} lines", line_no);
    state.store(status::CLOSED, Ordering::SeqCst);
    let _ = done.send(true);
}

/// Control handle for one replay connection
pub struct ReplayConnection {
    state: Arc<AtomicI32>,
    done: watch::Receiver<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl ReceiveConnection for ReplayConnection {
    fn status(&self) -> i32 {
        self.state.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.state.store(status::CLOSING, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.state.store(status::CLOSED, Ordering::SeqCst);
    }

    async fn request_sync(&self) -> Result<()> {
        let mut done = self.done.clone();
        loop {
            if *done.borrow_and_update() {
                return Ok(());
            }
            if done.changed().await.is_err() {
                return Err(IntakeError::Cancelled(
                    "replay connection closed before sync finished".to_string(),
                ));
            }
        }
    }
}
