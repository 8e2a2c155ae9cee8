//! Event Stream — ordered single-producer/single-consumer channel of
//! canonical messages, closed by exactly one terminal message.
//!
//! ```text
//! orchestrator ──► EventSender ──(bounded mpsc)──► EventStream ──► SSE / collect()
//!                      ▲
//!                  ChunkSink (lent to the final step's agent)
//! ```
//!
//! The sender is deliberately not `Clone`: one producer per stream. Once a
//! `Done` or `Error` has been sent, further writes return
//! [`StreamError::Closed`] and are dropped.

use std::collections::{HashSet, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::message::{CanonicalMessage, ErrorPayload, MessageKind, MessagePayload};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("Stream closed: a terminal message was already sent")]
    Closed,

    #[error("Stream consumer disconnected")]
    Disconnected,

    #[error("Message kind '{0}' is reserved for the stream owner")]
    ReservedKind(MessageKind),
}

/// Status stage telling consumers to drop the text streamed so far.
pub const RETRACTED_STAGE: &str = "output_retracted";

/// Create a bounded event stream.
pub fn channel(capacity: usize) -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSender {
            tx,
            terminated: AtomicBool::new(false),
            seen_ids: Mutex::new(SeenIds::default()),
        },
        EventStream {
            rx,
            finished: false,
        },
    )
}

// ─── Producer ─────────────────────────────────────────────────────────────

pub struct EventSender {
    tx: mpsc::Sender<CanonicalMessage>,
    terminated: AtomicBool,
    seen_ids: Mutex<SeenIds>,
}

/// Most recent message ids, bounded to [`SEEN_ID_WINDOW`] so a long-lived
/// stream does not grow without limit. Uniqueness holds within the window.
#[derive(Default)]
struct SeenIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

const SEEN_ID_WINDOW: usize = 4096;

impl SeenIds {
    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > SEEN_ID_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

impl EventSender {
    /// Send one message. A terminal message closes the stream for writing.
    pub async fn send(&self, mut msg: CanonicalMessage) -> Result<(), StreamError> {
        let closed = if msg.is_terminal() {
            self.terminated.swap(true, Ordering::SeqCst)
        } else {
            self.terminated.load(Ordering::SeqCst)
        };
        if closed {
            tracing::warn!(
                "[EventStream] Dropping {} message {} sent after the terminal sentinel",
                msg.kind(),
                msg.id
            );
            return Err(StreamError::Closed);
        }

        self.ensure_unique_id(&mut msg);

        self.tx
            .send(msg)
            .await
            .map_err(|_| StreamError::Disconnected)
    }

    /// Terminate the stream successfully.
    pub async fn finish(&self, finish_reason: &str) -> Result<(), StreamError> {
        self.send(CanonicalMessage::done(finish_reason)).await
    }

    /// Terminate the stream with an error.
    pub async fn fail(&self, message: impl Into<String>, code: impl Into<String>) -> Result<(), StreamError> {
        self.send(CanonicalMessage::error(message, code)).await
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// True once the consumer has dropped its end.
    pub fn is_disconnected(&self) -> bool {
        self.tx.is_closed()
    }

    fn ensure_unique_id(&self, msg: &mut CanonicalMessage) {
        let Ok(mut seen) = self.seen_ids.lock() else {
            return;
        };
        while !seen.insert(&msg.id) {
            tracing::debug!("[EventStream] Reassigning duplicate message id {}", msg.id);
            msg.id = uuid::Uuid::new_v4().to_string();
        }
    }
}

// ─── Chunk sink ───────────────────────────────────────────────────────────

/// The view of an [`EventSender`] lent to a streaming agent. Agents may emit
/// content but never terminate the stream; termination belongs to the
/// orchestrator.
pub struct ChunkSink<'a> {
    sender: &'a EventSender,
    chunks: AtomicUsize,
    assembled: Mutex<String>,
}

impl<'a> ChunkSink<'a> {
    pub fn new(sender: &'a EventSender) -> Self {
        Self {
            sender,
            chunks: AtomicUsize::new(0),
            assembled: Mutex::new(String::new()),
        }
    }

    /// Emit an incremental piece of assistant text.
    pub async fn text(&self, chunk: impl Into<String>) -> Result<(), StreamError> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        if let Ok(mut assembled) = self.assembled.lock() {
            assembled.push_str(&chunk);
        }
        self.chunks.fetch_add(1, Ordering::SeqCst);
        self.sender.send(CanonicalMessage::chunk(chunk)).await
    }

    /// Emit an incremental piece of reasoning.
    pub async fn thinking(&self, chunk: impl Into<String>) -> Result<(), StreamError> {
        self.sender
            .send(CanonicalMessage::thinking(chunk, true))
            .await
    }

    /// Emit an arbitrary non-terminal message (tool calls, images, status...).
    pub async fn emit(&self, msg: CanonicalMessage) -> Result<(), StreamError> {
        if msg.is_terminal() {
            return Err(StreamError::ReservedKind(msg.kind()));
        }
        if let MessagePayload::Text(p) = &msg.payload {
            if let Ok(mut assembled) = self.assembled.lock() {
                assembled.push_str(&p.content);
            }
            self.chunks.fetch_add(1, Ordering::SeqCst);
        }
        self.sender.send(msg).await
    }

    /// Number of text messages emitted so far.
    pub fn chunk_count(&self) -> usize {
        self.chunks.load(Ordering::SeqCst)
    }

    /// All text emitted so far, concatenated in order.
    pub fn assembled_text(&self) -> String {
        self.assembled
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn is_disconnected(&self) -> bool {
        self.sender.is_disconnected()
    }

    /// Withdraw the text emitted so far. Consumers receive a
    /// [`RETRACTED_STAGE`] status and discard what they assembled; the sink
    /// starts counting afresh. No-op when nothing was emitted.
    pub async fn retract(&self, reason: &str) -> Result<(), StreamError> {
        if self.chunks.swap(0, Ordering::SeqCst) == 0 {
            return Ok(());
        }
        if let Ok(mut assembled) = self.assembled.lock() {
            assembled.clear();
        }
        self.sender
            .send(CanonicalMessage::status(
                RETRACTED_STAGE,
                Some(reason.to_string()),
                None,
            ))
            .await
    }
}

// ─── Consumer ─────────────────────────────────────────────────────────────

pub struct EventStream {
    rx: mpsc::Receiver<CanonicalMessage>,
    finished: bool,
}

impl EventStream {
    /// Next message, or `None` after the terminal message has been yielded.
    pub async fn next(&mut self) -> Option<CanonicalMessage> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Drain the stream into a summary.
    pub async fn collect(mut self) -> StreamSummary {
        let mut summary = StreamSummary::default();
        while let Some(msg) = self.next().await {
            match &msg.payload {
                MessagePayload::Text(p) => summary.text.push_str(&p.content),
                MessagePayload::Status(p) if p.stage == RETRACTED_STAGE => summary.text.clear(),
                _ => {}
            }
            if msg.is_terminal() {
                summary.terminal = Some(msg.clone());
            }
            summary.messages.push(msg);
        }
        summary
    }
}

impl Stream for EventStream {
    type Item = CanonicalMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(msg)) => {
                if msg.is_terminal() {
                    self.finished = true;
                    self.rx.close();
                }
                Poll::Ready(Some(msg))
            }
            Poll::Ready(None) => {
                // Producer went away without a sentinel (panicked or aborted task).
                self.finished = true;
                tracing::warn!("[EventStream] Producer dropped without a terminal message");
                Poll::Ready(Some(CanonicalMessage::error(
                    "stream ended without a terminal message",
                    "stream_interrupted",
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A fully drained stream.
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    pub messages: Vec<CanonicalMessage>,
    /// Text content in delivery order (chunks and whole text messages),
    /// minus anything later retracted.
    pub text: String,
    pub terminal: Option<CanonicalMessage>,
}

impl StreamSummary {
    pub fn is_success(&self) -> bool {
        matches!(self.terminal.as_ref().map(|m| m.kind()), Some(MessageKind::Done))
    }

    pub fn error(&self) -> Option<&ErrorPayload> {
        match self.terminal.as_ref().map(|m| &m.payload) {
            Some(MessagePayload::Error(e)) => Some(e),
            _ => None,
        }
    }
}
