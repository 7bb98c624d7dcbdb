//! SSE stream engine.
//!
//! A producer task scans the upstream stream line-by-line into a
//! bounded channel; the consumer owns the client writer and is the
//! only place events are emitted. Two modes exist: verbatim
//! passthrough for `/v1/chat/completions` and the typed event
//! sequence for `/v1/responses`.

pub mod accumulator;
pub mod events;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures_core::Stream;
use futures_util::StreamExt as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ApiError;
use crate::providers::{parse_stream_delta, SseLineStream, Usage};
use crate::responses::{response_object, ResponsesService};
use crate::store::{Conversation, NewItem, Response, ResponseStatus};

use accumulator::{CompletedCall, FunctionCallAccumulator, TextBuffer, ToolCallAccumulator};
use events::{EventSequencer, TypedEvent};

/// Absolute deadline for one streaming session.
pub const STREAM_DEADLINE: Duration = Duration::from_secs(120);
/// Deadline for non-streaming upstream calls.
pub const NON_STREAM_DEADLINE: Duration = Duration::from_secs(60);
/// Producer → consumer channel capacity (bounded backpressure).
const CHANNEL_CAPACITY: usize = 100;

/// One message from the upstream scanner.
#[derive(Debug)]
pub struct StreamMessage {
    pub line: Option<String>,
    pub err: Option<String>,
}

/// Gauge of live streaming sessions. Shutdown cancels the shared
/// token, then waits on [`InFlight::drained`] before the serve task
/// is aborted.
#[derive(Clone, Default)]
pub struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; the count drops when the guard does.
    pub fn guard(&self) -> InFlightGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self.0.clone())
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Resolve once no sessions remain.
    pub async fn drained(&self) {
        while self.count() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

pub struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Spawn the producer: read upstream lines into a bounded channel.
/// On error it sends a single error message and exits; cancellation
/// stops the read loop and drops the upstream request.
fn spawn_producer(
    mut upstream: SseLineStream,
    cancel: CancellationToken,
) -> mpsc::Receiver<StreamMessage> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = upstream.next() => next,
            };
            match next {
                Some(Ok(line)) => {
                    if tx
                        .send(StreamMessage {
                            line: Some(line),
                            err: None,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Err(e)) => {
                    let _ = tx
                        .send(StreamMessage {
                            line: None,
                            err: Some(e.to_string()),
                        })
                        .await;
                    break;
                }
                None => break,
            }
        }
    });
    rx
}

// ---------------------------------------------------------------------------
// Passthrough mode
// ---------------------------------------------------------------------------

/// Forward upstream SSE lines to the client verbatim, restoring SSE
/// framing (`data:` payloads get a blank separator line). Ends after
/// `data: [DONE]`, on upstream error, at the session deadline, or
/// when `shutdown` fires.
pub fn passthrough(
    upstream: SseLineStream,
    shutdown: CancellationToken,
    in_flight: InFlightGuard,
) -> impl Stream<Item = Result<String, std::convert::Infallible>> + Send + 'static {
    stream! {
        let _in_flight = in_flight;
        // Child of the shutdown token: gateway shutdown stops the
        // producer, and so does the client going away (drop guard).
        let cancel = shutdown.child_token();
        let _guard = cancel.clone().drop_guard();
        let mut rx = spawn_producer(upstream, cancel);
        let deadline = tokio::time::Instant::now() + STREAM_DEADLINE;

        loop {
            let msg = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("passthrough session hit its deadline");
                    break;
                }
                msg = rx.recv() => msg,
            };
            let Some(msg) = msg else { break };
            if let Some(err) = msg.err {
                warn!(error = %err, "upstream stream failed");
                break;
            }
            let Some(line) = msg.line else { continue };
            let done = line == "data: [DONE]";
            if line.starts_with("data:") {
                yield Ok(format!("{line}\n\n"));
            } else {
                yield Ok(format!("{line}\n"));
            }
            if done {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Typed-event mode
// ---------------------------------------------------------------------------

/// Everything the typed-event consumer needs around one response.
pub struct ResponseStreamSession {
    pub service: Arc<ResponsesService>,
    pub response: Response,
    pub conversation: Option<Conversation>,
    /// Gateway-wide shutdown token; the session's cancel token is a
    /// child of it.
    pub shutdown: CancellationToken,
    pub in_flight: InFlightGuard,
}

/// What the consumer emits: typed events, then a closing `[DONE]`.
#[derive(Debug)]
pub enum EngineEvent {
    Typed(TypedEvent),
    Done,
}

/// Marks the response `cancelled` if the stream is dropped before a
/// terminal state was recorded (client disconnect), and always stops
/// the producer.
struct SessionGuard {
    service: Arc<ResponsesService>,
    response_id: i64,
    cancel: CancellationToken,
    finished: bool,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        if !self.finished {
            let service = self.service.clone();
            let id = self.response_id;
            tokio::spawn(async move {
                if let Err(e) = service.update_status(id, ResponseStatus::Cancelled).await {
                    warn!(response_id = id, error = %e, "failed to record cancellation");
                }
            });
        }
    }
}

enum SessionOutcome {
    Finished,
    UpstreamError(String),
    TimedOut,
}

/// The full typed event sequence for one `/v1/responses` stream.
///
/// Emits `response.created` through `response.completed` (or
/// `response.error`), persisting items and the terminal response
/// state along the way. User input items must already be recorded by
/// the caller; the assistant items are appended here after clean
/// termination.
pub fn typed_events(
    upstream: SseLineStream,
    session: ResponseStreamSession,
) -> impl Stream<Item = EngineEvent> + Send + 'static {
    stream! {
        let ResponseStreamSession { service, response, conversation, shutdown, in_flight } = session;
        let _in_flight = in_flight;
        let conversation_public = conversation.as_ref().map(|c| c.public_id.clone());

        // Shutdown stops the producer; the session then finalises as
        // if the upstream had ended, so draining completes cleanly.
        let cancel = shutdown.child_token();
        let mut guard = SessionGuard {
            service: service.clone(),
            response_id: response.id,
            cancel: cancel.clone(),
            finished: false,
        };

        let running = match service.update_status(response.id, ResponseStatus::Running).await {
            Ok(r) => r,
            Err(e) => {
                warn!(response_id = response.id, error = %e, "failed to mark response running");
                response.clone()
            }
        };
        let running_obj = response_object(&running, conversation_public.as_deref());

        let mut seq = EventSequencer::new();
        yield EngineEvent::Typed(seq.created(running_obj.clone()));
        yield EngineEvent::Typed(seq.in_progress(running_obj));

        let item_id = crate::utils::public_id("msg");
        yield EngineEvent::Typed(seq.output_item_added(&item_id));
        yield EngineEvent::Typed(seq.content_part_added(&item_id));

        let mut rx = spawn_producer(upstream, cancel);
        let deadline = tokio::time::Instant::now() + STREAM_DEADLINE;

        let mut text = TextBuffer::new();
        let mut function_call = FunctionCallAccumulator::new();
        let mut tool_calls = ToolCallAccumulator::new();
        let mut emitted_calls: Vec<CompletedCall> = Vec::new();
        let mut usage: Option<Usage> = None;

        let outcome = loop {
            let msg = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break SessionOutcome::TimedOut,
                msg = rx.recv() => msg,
            };
            // Producer gone without [DONE]: treat as end of stream.
            let Some(msg) = msg else { break SessionOutcome::Finished };
            if let Some(err) = msg.err {
                break SessionOutcome::UpstreamError(err);
            }
            let Some(line) = msg.line else { continue };
            if line == "data: [DONE]" {
                break SessionOutcome::Finished;
            }
            let Some(payload) = line.strip_prefix("data: ") else { continue };
            let Ok(json) = serde_json::from_str::<serde_json::Value>(payload) else {
                continue;
            };

            let delta = parse_stream_delta(&json);
            if let Some(u) = delta.usage {
                usage = Some(u);
            }
            if let Some(content) = &delta.content {
                if let Some(chunk) = text.push(content) {
                    yield EngineEvent::Typed(seq.output_text_delta(&item_id, &chunk));
                }
            } else if let Some(reasoning) = &delta.reasoning_content {
                // Reasoning-only chunks feed the same buffer.
                if let Some(chunk) = text.push(reasoning) {
                    yield EngineEvent::Typed(seq.output_text_delta(&item_id, &chunk));
                }
            }
            if let Some(fc) = &delta.function_call {
                if let Some(call) =
                    function_call.add_chunk(fc.name.as_deref(), fc.arguments.as_deref())
                {
                    yield EngineEvent::Typed(seq.output_function_calls_delta(
                        &item_id,
                        &call.name,
                        &call.arguments,
                    ));
                    emitted_calls.push(call);
                }
            }
            for tc in &delta.tool_calls {
                if let Some(call) = tool_calls.add_chunk(tc) {
                    yield EngineEvent::Typed(seq.output_function_calls_delta(
                        &item_id,
                        &call.name,
                        &call.arguments,
                    ));
                    emitted_calls.push(call);
                }
            }
        };

        match outcome {
            SessionOutcome::Finished => {
                if let Some(chunk) = text.flush() {
                    yield EngineEvent::Typed(seq.output_text_delta(&item_id, &chunk));
                }
                let full_text = text.full_text().to_string();

                if let Some(conv) = &conversation {
                    let mut items = Vec::new();
                    if !full_text.is_empty() {
                        items.push(NewItem::message(
                            conv.id,
                            Some(response.id),
                            crate::store::ItemRole::Assistant,
                            vec![crate::store::ContentPart::Text { text: full_text.clone() }],
                        ));
                    }
                    for call in &emitted_calls {
                        items.push(NewItem::function_call(
                            conv.id,
                            Some(response.id),
                            call.name.clone(),
                            call.raw_arguments.clone(),
                        ));
                    }
                    if !items.is_empty() {
                        if let Err(e) = service.create_items_for_response(&response, items).await {
                            warn!(response_id = response.id, error = %e, "failed to persist stream items");
                        }
                    }
                }

                let output = output_parts(&full_text, &emitted_calls);
                if let Err(e) = service.update_output(response.id, &output).await {
                    warn!(response_id = response.id, error = %e, "failed to store output");
                }
                if let Err(e) = service.update_usage(response.id, usage.as_ref()).await {
                    warn!(response_id = response.id, error = %e, "failed to store usage");
                }
                let terminal = match service
                    .update_status(response.id, ResponseStatus::Completed)
                    .await
                {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(response_id = response.id, error = %e, "failed to complete response");
                        running
                    }
                };
                guard.finished = true;

                yield EngineEvent::Typed(seq.output_text_done(&item_id, &full_text));
                yield EngineEvent::Typed(seq.content_part_done(&item_id, &full_text));
                yield EngineEvent::Typed(seq.output_item_done(&item_id, &full_text));
                yield EngineEvent::Typed(
                    seq.completed(response_object(&terminal, conversation_public.as_deref())),
                );
                yield EngineEvent::Done;
            }
            SessionOutcome::UpstreamError(err) => {
                let api = ApiError::UpstreamFailed(err);
                if let Err(e) = service.update_error(response.id, &api).await {
                    warn!(response_id = response.id, error = %e, "failed to record upstream error");
                }
                guard.finished = true;
                yield EngineEvent::Typed(seq.error(api.code(), &api.to_string()));
            }
            SessionOutcome::TimedOut => {
                let api = ApiError::UpstreamTimeout(STREAM_DEADLINE.as_secs());
                if let Err(e) = service.update_error(response.id, &api).await {
                    warn!(response_id = response.id, error = %e, "failed to record timeout");
                }
                guard.finished = true;
                yield EngineEvent::Typed(seq.error(api.code(), &api.to_string()));
            }
        }
    }
}

/// The `output` array stored on the response record and returned on
/// the wire: one assistant message part, plus any completed calls.
pub fn output_parts(full_text: &str, calls: &[CompletedCall]) -> serde_json::Value {
    let mut parts = Vec::new();
    if !full_text.is_empty() || calls.is_empty() {
        parts.push(serde_json::json!({
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "output_text", "text": full_text }],
        }));
    }
    for call in calls {
        parts.push(serde_json::json!({
            "type": "function_call",
            "name": call.name,
            "arguments": call.arguments,
        }));
    }
    serde_json::Value::Array(parts)
}
