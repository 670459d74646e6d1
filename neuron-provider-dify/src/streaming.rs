//! SSE streaming support for the Dify chat-messages API.
//!
//! Dify streams one JSON object per `data: ` line:
//! ```text
//! data: {"event":"agent_message","message_id":"m1","answer":"Hel"}
//! data: {"event":"agent_message","message_id":"m1","answer":"lo"}
//! data: {"event":"message_end","message_id":"m1","metadata":{"usage":{"prompt_tokens":12,"completion_tokens":2}}}
//! ```
//!
//! The translator runs as a spawned task that pushes [`ChatChunk`]s into an
//! unbounded channel. A malformed line is logged and skipped; only transport
//! and status failures end the stream early.
//!
//! Reference: <https://docs.dify.ai/guides/application-publishing/developing-with-apis>

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use neuron_types::{ChatChunk, ChatStream, CompletionUsage, LlmError};
use reqwest::{RequestBuilder, StatusCode};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::error::{map_http_status, map_reqwest_error};
use crate::types::{DifyEvent, EventUsage};

/// Marker every event line starts with.
const DATA_PREFIX: &str = "data: ";

type ChunkSender = mpsc::UnboundedSender<Result<ChatChunk, LlmError>>;
type ChunkReceiver = mpsc::UnboundedReceiver<Result<ChatChunk, LlmError>>;

/// Wrap a prepared (not yet sent) request into a [`ChatStream`].
///
/// The request is sent when the stream is first polled. Polling outside a
/// tokio runtime yields a single [`LlmError::Connection`] and ends the stream.
pub(crate) fn stream_chat(request: RequestBuilder) -> ChatStream {
    ChatStream::new(DifyStream {
        pending: Some(request),
        receiver: None,
    })
}

/// Consumer side of one chat stream.
///
/// Holds the request until first poll, then the receiving half of the
/// translator's channel. Dropping it closes the channel, which stops the
/// translator and releases the connection.
struct DifyStream {
    pending: Option<RequestBuilder>,
    receiver: Option<ChunkReceiver>,
}

impl Stream for DifyStream {
    type Item = Result<ChatChunk, LlmError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(request) = self.pending.take() {
            let Ok(runtime) = Handle::try_current() else {
                tracing::warn!("dify stream polled outside a tokio runtime");
                return Poll::Ready(Some(Err(LlmError::connection(
                    "dify stream must be polled from within a tokio runtime",
                    true,
                ))));
            };
            let (tx, rx) = mpsc::unbounded_channel();
            runtime.spawn(run_translator(request, tx));
            self.receiver = Some(rx);
        }
        match self.receiver.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

async fn run_translator(request: RequestBuilder, tx: ChunkSender) {
    let mut translator = Translator::new();
    if let Err(err) = translator.run(request, &tx).await {
        let err = translator.settle_error(err);
        tracing::debug!(
            error = %err,
            retryable = err.is_retryable(),
            state = ?translator.state(),
            "dify stream failed"
        );
        translator.advance(StreamState::Failed);
        // The consumer may already be gone; nothing left to report to.
        let _ = tx.send(Err(err));
    }
}

/// Lifecycle of one translated stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    NotStarted,
    AwaitingResponse,
    Streaming,
    Completed,
    Failed,
}

impl StreamState {
    pub(crate) fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (NotStarted, AwaitingResponse)
                | (AwaitingResponse, Streaming)
                | (AwaitingResponse, Failed)
                | (Streaming, Completed)
                | (Streaming, Failed)
        )
    }

    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, StreamState::Completed | StreamState::Failed)
    }
}

/// A line that could not be turned into an event. Always recoverable.
#[derive(Debug, thiserror::Error)]
pub(crate) enum LineError {
    #[error("line is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid JSON in event payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Token counters for one stream. Last `message_end` wins.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UsageAccumulator {
    input_tokens: u64,
    output_tokens: u64,
}

impl UsageAccumulator {
    pub(crate) fn record(&mut self, usage: EventUsage) {
        self.input_tokens = usage.prompt_tokens;
        self.output_tokens = usage.completion_tokens;
    }

    pub(crate) fn summary(&self) -> CompletionUsage {
        CompletionUsage::new(self.input_tokens, self.output_tokens)
    }
}

/// Reassembles newline-delimited lines from arbitrarily split byte chunks.
///
/// Works on bytes so a multi-byte UTF-8 character split across network chunks
/// is decoded only once its line is complete.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Append bytes and return every line completed by them (terminator included).
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let scan_from = self.buf.len();
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        for (i, byte) in self.buf.iter().enumerate().skip(scan_from) {
            if *byte == b'\n' {
                lines.push(self.buf[start..=i].to_vec());
                start = i + 1;
            }
        }
        self.buf.drain(..start);
        lines
    }

    /// Take whatever is left once the body has ended.
    pub(crate) fn finish(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

/// Decode one raw line into an event.
///
/// `Ok(None)` for blank lines and lines without the `data: ` marker.
pub(crate) fn decode_line(line: &[u8]) -> Result<Option<DifyEvent>, LineError> {
    let line = std::str::from_utf8(line)?.trim();
    let Some(data) = line.strip_prefix(DATA_PREFIX) else {
        if !line.is_empty() {
            tracing::trace!(line, "ignoring non-data stream line");
        }
        return Ok(None);
    };
    Ok(Some(DifyEvent::from_json(data)?))
}

/// Per-stream translation state.
pub(crate) struct Translator {
    state: StreamState,
    usage: UsageAccumulator,
    /// Most recent non-empty message id seen on a recognized event.
    request_id: String,
    /// Cleared for good once a chunk has been handed to the consumer.
    retryable: bool,
}

impl Translator {
    pub(crate) fn new() -> Self {
        Self {
            state: StreamState::NotStarted,
            usage: UsageAccumulator::default(),
            request_id: String::new(),
            retryable: true,
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        self.state
    }

    /// Clear the retryable flag on `err` if content already reached the consumer.
    pub(crate) fn settle_error(&self, err: LlmError) -> LlmError {
        if self.retryable {
            err
        } else {
            err.non_retryable()
        }
    }

    pub(crate) fn advance(&mut self, next: StreamState) {
        if self.state.is_terminal() {
            tracing::trace!(state = ?self.state, to = ?next, "dify stream already finished");
            return;
        }
        if self.state.can_transition_to(next) {
            tracing::trace!(from = ?self.state, to = ?next, "dify stream state");
            self.state = next;
        } else {
            tracing::warn!(from = ?self.state, to = ?next, "ignoring invalid stream state transition");
        }
    }

    async fn run(&mut self, request: RequestBuilder, tx: &ChunkSender) -> Result<(), LlmError> {
        self.advance(StreamState::AwaitingResponse);

        let response = tokio::select! {
            res = request.send() => res.map_err(map_reqwest_error)?,
            () = tx.closed() => {
                tracing::debug!("dify stream dropped before response");
                self.advance(StreamState::Failed);
                return Ok(());
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            let body = response
                .text()
                .await
                .map_err(map_reqwest_error)?;
            tracing::warn!(%status, body = %body, "dify returned non-success status");
            return Err(map_http_status(status, &body));
        }

        self.advance(StreamState::Streaming);
        self.translate_body(response.bytes_stream(), tx).await
    }

    /// Drive the body to completion, forwarding chunks and the final usage.
    pub(crate) async fn translate_body(
        &mut self,
        body: impl Stream<Item = Result<Bytes, reqwest::Error>>,
        tx: &ChunkSender,
    ) -> Result<(), LlmError> {
        let mut body = std::pin::pin!(body);
        let mut lines = LineBuffer::default();

        loop {
            let next = tokio::select! {
                next = body.next() => next,
                () = tx.closed() => {
                    tracing::debug!("dify stream dropped by consumer; releasing connection");
                    self.advance(StreamState::Failed);
                    return Ok(());
                }
            };

            match next {
                Some(Ok(bytes)) => {
                    for line in lines.push(&bytes) {
                        self.forward_line(&line, tx);
                    }
                }
                Some(Err(e)) => return Err(map_reqwest_error(e)),
                None => break,
            }
        }

        if let Some(rest) = lines.finish() {
            self.forward_line(&rest, tx);
        }

        let usage = self.usage.summary();
        tracing::debug!(
            request_id = %self.request_id,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "dify stream complete"
        );
        let _ = tx.send(Ok(ChatChunk::usage_only(self.request_id.clone(), usage)));
        self.advance(StreamState::Completed);
        Ok(())
    }

    fn forward_line(&mut self, line: &[u8], tx: &ChunkSender) {
        match self.process_line(line) {
            Ok(Some(chunk)) => {
                if tx.send(Ok(chunk)).is_ok() {
                    self.retryable = false;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "skipping malformed dify stream line"),
        }
    }

    /// Decode and classify one line.
    pub(crate) fn process_line(&mut self, line: &[u8]) -> Result<Option<ChatChunk>, LineError> {
        Ok(decode_line(line)?.and_then(|event| self.apply(event)))
    }

    /// Fold one event into the stream state, returning the chunk it produces.
    pub(crate) fn apply(&mut self, event: DifyEvent) -> Option<ChatChunk> {
        match event {
            DifyEvent::MessageEnd { message_id, usage } => {
                self.remember_id(message_id.as_deref());
                if let Some(usage) = usage {
                    self.usage.record(usage);
                }
                None
            }
            DifyEvent::AgentMessage { message_id, answer } => {
                self.remember_id(message_id.as_deref());
                if answer.is_empty() {
                    return None;
                }
                Some(ChatChunk::content(message_id.unwrap_or_default(), answer))
            }
            DifyEvent::Error {
                status,
                code,
                message,
            } => {
                tracing::warn!(?status, ?code, ?message, "dify reported an in-stream error");
                None
            }
            DifyEvent::Other(kind) => {
                tracing::trace!(event = ?kind, "ignoring dify event");
                None
            }
        }
    }

    fn remember_id(&mut self, message_id: Option<&str>) {
        if let Some(id) = message_id.filter(|id| !id.is_empty()) {
            self.request_id = id.to_string();
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use neuron_types::Role;

    fn make_translator() -> Translator {
        Translator::new()
    }

    /// Helper: run a sequence of body chunks through the translator and
    /// collect everything it sends.
    async fn translate(chunks: &[&'static [u8]]) -> Vec<Result<ChatChunk, LlmError>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let body = futures::stream::iter(
            chunks
                .iter()
                .map(|c| Ok::<_, reqwest::Error>(Bytes::from_static(c))),
        );
        let mut translator = make_translator();
        translator.advance(StreamState::AwaitingResponse);
        translator.advance(StreamState::Streaming);
        translator.translate_body(body, &tx).await.unwrap();
        assert_eq!(translator.state(), StreamState::Completed);
        drop(tx);

        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item);
        }
        out
    }

    #[test]
    fn agent_message_produces_assistant_chunk() {
        let mut t = make_translator();
        let chunk = t
            .process_line(br#"data: {"event":"agent_message","answer":"Hi","message_id":"m1"}"#)
            .unwrap()
            .expect("chunk");
        assert_eq!(chunk.request_id, "m1");
        let delta = chunk.delta.expect("delta");
        assert_eq!(delta.role, Role::Assistant);
        assert_eq!(delta.content, "Hi");
        assert!(chunk.usage.is_none());
    }

    #[test]
    fn empty_answer_is_heartbeat() {
        let mut t = make_translator();
        assert!(t
            .process_line(br#"data: {"event":"agent_message","answer":"","message_id":"m1"}"#)
            .unwrap()
            .is_none());
        assert!(t
            .process_line(br#"data: {"event":"agent_message","message_id":"m1"}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn message_end_overwrites_usage() {
        let mut t = make_translator();
        t.process_line(br#"data: {"event":"message_end","metadata":{"usage":{"prompt_tokens":10,"completion_tokens":5}}}"#)
            .unwrap();
        t.process_line(br#"data: {"event":"message_end","metadata":{"usage":{"prompt_tokens":20,"completion_tokens":8}}}"#)
            .unwrap();
        assert_eq!(t.usage.summary(), CompletionUsage::new(20, 8));
        assert_eq!(t.usage.summary().total_tokens, 28);
    }

    #[test]
    fn message_end_without_usage_keeps_counters() {
        let mut t = make_translator();
        t.process_line(br#"data: {"event":"message_end","metadata":{"usage":{"prompt_tokens":3,"completion_tokens":4}}}"#)
            .unwrap();
        let produced = t.process_line(br#"data: {"event":"message_end"}"#).unwrap();
        assert!(produced.is_none());
        assert_eq!(t.usage.summary(), CompletionUsage::new(3, 4));
    }

    #[test]
    fn lines_without_prefix_are_skipped() {
        let mut t = make_translator();
        assert!(t.process_line(b"").unwrap().is_none());
        assert!(t.process_line(b"   \r\n").unwrap().is_none());
        assert!(t.process_line(b"event: ping").unwrap().is_none());
        assert!(t.process_line(br#"{"event":"agent_message","answer":"x"}"#).unwrap().is_none());
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        let mut t = make_translator();
        let chunk = t
            .process_line(b"  data: {\"event\":\"agent_message\",\"answer\":\"ok\",\"message_id\":\"m2\"}  \r\n")
            .unwrap();
        assert_eq!(chunk.unwrap().text(), Some("ok"));
    }

    #[test]
    fn invalid_json_is_recoverable_error() {
        let mut t = make_translator();
        assert!(matches!(t.process_line(b"data: {broken"), Err(LineError::Json(_))));
        assert!(matches!(t.process_line(b"data: \xff\xfe"), Err(LineError::Utf8(_))));
    }

    #[test]
    fn unknown_events_produce_nothing() {
        let mut t = make_translator();
        for line in [
            br#"data: {"event":"agent_thought","thought":"..."}"#.as_slice(),
            br#"data: {"event":"message_file","id":"f1"}"#.as_slice(),
            br#"data: {"event":"ping"}"#.as_slice(),
            br#"data: {"event":"error","status":500,"code":"internal","message":"oops"}"#.as_slice(),
        ] {
            assert!(t.process_line(line).unwrap().is_none());
        }
    }

    #[test]
    fn request_id_tracks_last_seen_message_id() {
        let mut t = make_translator();
        t.process_line(br#"data: {"event":"agent_message","answer":"a","message_id":"m1"}"#)
            .unwrap();
        t.process_line(br#"data: {"event":"agent_message","answer":"b","message_id":""}"#)
            .unwrap();
        assert_eq!(t.request_id, "m1");
        t.process_line(br#"data: {"event":"message_end","message_id":"m2"}"#)
            .unwrap();
        assert_eq!(t.request_id, "m2");
    }

    #[test]
    fn line_buffer_joins_split_lines() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"data: {\"eve").is_empty());
        let lines = buf.push(b"nt\":\"ping\"}\ndata: x\nda");
        assert_eq!(lines, vec![b"data: {\"event\":\"ping\"}\n".to_vec(), b"data: x\n".to_vec()]);
        assert_eq!(buf.finish(), Some(b"da".to_vec()));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn line_buffer_keeps_split_utf8_intact() {
        let text = "data: {\"event\":\"agent_message\",\"answer\":\"héllo\"}\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut buf = LineBuffer::default();
        assert!(buf.push(&text[..split]).is_empty());
        let lines = buf.push(&text[split..]);
        let mut t = make_translator();
        assert_eq!(t.process_line(&lines[0]).unwrap().unwrap().text(), Some("héllo"));
    }

    #[test]
    fn state_transitions() {
        use StreamState::*;
        assert!(NotStarted.can_transition_to(AwaitingResponse));
        assert!(AwaitingResponse.can_transition_to(Streaming));
        assert!(AwaitingResponse.can_transition_to(Failed));
        assert!(Streaming.can_transition_to(Completed));
        assert!(Streaming.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Streaming));
        assert!(!Failed.can_transition_to(AwaitingResponse));
        assert!(!NotStarted.can_transition_to(Streaming));
        assert!(Completed.is_terminal() && Failed.is_terminal());
        assert!(!Streaming.is_terminal());
    }

    #[test]
    fn terminal_state_is_not_reentered() {
        let mut t = make_translator();
        t.advance(StreamState::AwaitingResponse);
        t.advance(StreamState::Failed);
        t.advance(StreamState::Streaming);
        assert_eq!(t.state(), StreamState::Failed);
    }

    #[tokio::test]
    async fn body_emits_chunks_then_final_usage() {
        let out = translate(&[
            b"data: {\"event\":\"agent_message\",\"answer\":\"Hel\",\"message_id\":\"m1\"}\n\n",
            b"data: {\"event\":\"agent_message\",\"answer\":\"lo\",\"message_id\":\"m1\"}\n\n",
            b"data: {\"event\":\"message_end\",\"message_id\":\"m1\",\"metadata\":{\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":2}}}\n\n",
        ])
        .await;

        let chunks: Vec<ChatChunk> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text(), Some("Hel"));
        assert_eq!(chunks[1].text(), Some("lo"));
        let last = &chunks[2];
        assert!(last.delta.is_none());
        assert_eq!(last.request_id, "m1");
        assert_eq!(last.usage, Some(CompletionUsage::new(12, 2)));
    }

    #[tokio::test]
    async fn malformed_lines_do_not_stop_stream() {
        let out = translate(&[
            b"data: {\"event\":\"agent_message\",\"answer\":\"a\",\"message_id\":\"m1\"}\n",
            b"data: {not json}\n",
            b"garbage line\n",
            b"data: \xff\n",
            b"data: {\"event\":\"agent_message\",\"answer\":\"b\",\"message_id\":\"m1\"}\n",
        ])
        .await;

        let texts: Vec<String> = out
            .iter()
            .filter_map(|r| r.as_ref().ok().and_then(|c| c.text().map(String::from)))
            .collect();
        assert_eq!(texts, vec!["a", "b"]);
        assert!(out.iter().all(|r| r.is_ok()));
        assert_eq!(out.last().unwrap().as_ref().unwrap().usage, Some(CompletionUsage::default()));
    }

    #[tokio::test]
    async fn unterminated_last_line_is_processed() {
        let out = translate(&[
            b"data: {\"event\":\"agent_message\",\"answer\":\"tail\",\"message_id\":\"m9\"}",
        ])
        .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap().text(), Some("tail"));
        assert_eq!(out[1].as_ref().unwrap().request_id, "m9");
    }

    #[tokio::test]
    async fn empty_body_yields_only_zero_usage() {
        let out = translate(&[]).await;
        assert_eq!(out.len(), 1);
        let chunk = out[0].as_ref().unwrap();
        assert_eq!(chunk.request_id, "");
        assert_eq!(chunk.usage, Some(CompletionUsage::new(0, 0)));
    }

    #[tokio::test]
    async fn delivered_chunk_clears_retryable() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut t = make_translator();
        t.forward_line(br#"data: {"event":"agent_message","answer":"","message_id":"m1"}"#, &tx);
        assert!(t.retryable);
        t.forward_line(br#"data: {"event":"agent_message","answer":"x","message_id":"m1"}"#, &tx);
        assert!(!t.retryable);
    }

    #[tokio::test]
    async fn oversized_usage_counters_still_emit_final_chunk() {
        let out = translate(&[
            b"data: {\"event\":\"agent_message\",\"message_id\":\"m1\",\"answer\":\"a\"}\n",
            b"data: {\"event\":\"message_end\",\"message_id\":\"m1\",\"metadata\":{\"usage\":{\"prompt_tokens\":18446744073709551615,\"completion_tokens\":1}}}\n",
        ])
        .await;

        assert_eq!(out.len(), 2);
        let usage = out[1].as_ref().unwrap().usage.expect("final usage");
        assert_eq!(usage.prompt_tokens, u64::MAX);
        assert_eq!(usage.completion_tokens, 1);
        assert_eq!(usage.total_tokens, u64::MAX);
    }

    #[test]
    fn polling_without_runtime_yields_error_then_ends() {
        let request = reqwest::Client::new().post("http://127.0.0.1:9/v1/chat-messages");
        let out: Vec<_> = futures::executor::block_on(stream_chat(request).collect());

        assert_eq!(out.len(), 1);
        match &out[0] {
            Err(err @ LlmError::Connection { message, .. }) => {
                assert!(message.contains("tokio runtime"), "message: {message}");
                assert!(err.is_retryable());
            }
            other => panic!("expected Connection error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_failure_is_reported_as_non_retryable() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut t = make_translator();
        t.advance(StreamState::AwaitingResponse);
        t.advance(StreamState::Streaming);
        t.forward_line(br#"data: {"event":"agent_message","answer":"x"}"#, &tx);
        assert!(!t.retryable);

        let reported = t.settle_error(map_http_status(StatusCode::BAD_GATEWAY, "late"));
        assert!(!reported.is_retryable());
        assert_eq!(reported.status(), Some(502));
        assert!(rx.recv().await.unwrap().is_ok());

        let fresh = make_translator();
        assert!(fresh.settle_error(map_http_status(StatusCode::BAD_GATEWAY, "")).is_retryable());
    }
}
