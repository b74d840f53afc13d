//! Streaming chat responses
//!
//! A [`ChatStream`] is the consumer end of a bounded channel fed by a
//! spawned producer task. Dropping the stream aborts the producer, which in
//! turn drops the upstream HTTP response. Every stream ends with exactly one
//! terminal chunk: [`StreamChunk::Done`] or [`StreamChunk::Error`].

use crate::error::AiErrorKind;
use crate::llm::pricing::calculate_cost;
use crate::llm::retry::ProviderFailure;
use crate::models::{ModelAccess, ToolCall};
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

const STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StreamMetrics {
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    pub backend: ModelAccess,
    pub model_id: String,
}

impl StreamMetrics {
    pub fn new(backend: ModelAccess, model_id: impl Into<String>, tokens_in: u32, tokens_out: u32) -> Self {
        Self {
            tokens_in,
            tokens_out,
            cost: calculate_cost(backend, tokens_in, tokens_out),
            backend,
            model_id: model_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    TextDelta { text: String },
    ToolCall { call: ToolCall },
    /// Terminal. `message` is already user-safe.
    Error { kind: AiErrorKind, message: String },
    /// Terminal.
    Done { metrics: StreamMetrics },
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        StreamChunk::TextDelta { text: text.into() }
    }

    pub fn error(kind: AiErrorKind) -> Self {
        StreamChunk::Error {
            kind,
            message: kind.user_message().to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamChunk::Error { .. } | StreamChunk::Done { .. })
    }
}

/// Lazy, cancellable sequence of chunks.
pub struct ChatStream {
    receiver: mpsc::Receiver<StreamChunk>,
    producer: JoinHandle<()>,
}

impl ChatStream {
    /// Pull the next chunk; `None` once the terminal chunk was delivered.
    pub async fn recv(&mut self) -> Option<StreamChunk> {
        self.receiver.recv().await
    }
}

impl Stream for ChatStream {
    type Item = StreamChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

/// Producer half handed to the task behind a [`ChatStream`].
pub struct StreamSink {
    sender: mpsc::Sender<StreamChunk>,
    terminated: Arc<AtomicBool>,
}

impl StreamSink {
    /// Deliver a chunk. Returns `false` when the consumer is gone or the
    /// stream already terminated; producers should stop at that point.
    pub async fn send(&mut self, chunk: StreamChunk) -> bool {
        if self.terminated.load(Ordering::SeqCst) {
            return false;
        }
        if chunk.is_terminal() {
            self.terminated.store(true, Ordering::SeqCst);
        }
        self.sender.send(chunk).await.is_ok()
    }

    pub async fn fail(&mut self, kind: AiErrorKind) -> bool {
        self.send(StreamChunk::error(kind)).await
    }

    /// Resolves once the consumer dropped its end.
    pub async fn closed(&self) {
        self.sender.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Spawn `producer` behind a new [`ChatStream`].
///
/// A producer that returns without a terminal chunk gets an `Unknown`
/// error appended so consumers always see the stream end.
pub fn spawn_stream<F, Fut>(producer: F) -> ChatStream
where
    F: FnOnce(StreamSink) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (sender, receiver) = mpsc::channel(STREAM_BUFFER);
    let terminated = Arc::new(AtomicBool::new(false));

    let sink = StreamSink {
        sender: sender.clone(),
        terminated: terminated.clone(),
    };

    let producer = tokio::spawn(async move {
        producer(sink).await;

        if !terminated.load(Ordering::SeqCst) && !sender.is_closed() {
            warn!("stream producer finished without a terminal chunk");
            let _ = sender.send(StreamChunk::error(AiErrorKind::Unknown)).await;
        }
    });

    ChatStream { receiver, producer }
}

/// Token counts reported by a provider during a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamUsage {
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// Translates one provider's SSE events into chunks.
pub(crate) trait SseDecoder: Send + 'static {
    /// Handle one event. Returns `Ok(true)` when the provider signalled the
    /// end of the response.
    fn on_event(
        &mut self,
        event: &str,
        data: &str,
        out: &mut Vec<StreamChunk>,
    ) -> Result<bool, ProviderFailure>;

    /// Flush buffered state (e.g. accumulated tool calls) and report usage.
    fn finish(&mut self, out: &mut Vec<StreamChunk>) -> StreamUsage;
}

/// Pump an SSE response through `decoder` into a [`ChatStream`].
///
/// A gap longer than `idle_timeout` between events ends the stream with a
/// `Timeout` error.
pub(crate) fn spawn_sse_stream<D: SseDecoder>(
    response: reqwest::Response,
    backend: ModelAccess,
    model_id: String,
    idle_timeout: Duration,
    mut decoder: D,
) -> ChatStream {
    spawn_stream(move |mut sink| async move {
        let mut events = response.bytes_stream().eventsource();
        let mut pending = Vec::new();
        let mut emitted_text = false;

        loop {
            let next = tokio::select! {
                _ = sink.closed() => {
                    debug!(backend = %backend, "consumer dropped stream, cancelling upstream");
                    return;
                }
                next = tokio::time::timeout(idle_timeout, events.next()) => next,
            };

            let event = match next {
                Err(_) => {
                    error!(
                        backend = %backend,
                        idle_ms = idle_timeout.as_millis() as u64,
                        "stream stalled, giving up"
                    );
                    sink.fail(AiErrorKind::Timeout).await;
                    return;
                }
                Ok(next) => next,
            };

            let event = match event {
                None => break,
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    error!(backend = %backend, error = %e, "stream transport failed");
                    sink.fail(AiErrorKind::ProviderError).await;
                    return;
                }
            };

            let finished = match decoder.on_event(&event.event, &event.data, &mut pending) {
                Ok(finished) => finished,
                Err(failure) => {
                    error!(backend = %backend, failure = %failure, "stream reported an error");
                    sink.fail(failure.classify()).await;
                    return;
                }
            };

            for chunk in pending.drain(..) {
                emitted_text |= matches!(chunk, StreamChunk::TextDelta { .. });
                if !sink.send(chunk).await {
                    return;
                }
            }

            if finished {
                break;
            }
        }

        let usage = decoder.finish(&mut pending);
        for chunk in pending.drain(..) {
            if !sink.send(chunk).await {
                return;
            }
        }

        if emitted_text && usage == StreamUsage::default() {
            warn!(backend = %backend, "stream ended without usage data, reporting zero tokens");
        }

        sink.send(StreamChunk::Done {
            metrics: StreamMetrics::new(backend, model_id, usage.tokens_in, usage.tokens_out),
        })
        .await;
    })
}
