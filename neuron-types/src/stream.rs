//! Streaming handle for incremental chat responses.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};

use crate::error::LlmError;
use crate::types::{ChatChunk, CompletionUsage};

/// Handle to a streaming chat response.
///
/// Yields chunks in order and ends after the final usage chunk, or after a
/// single `Err` item. Dropping the handle abandons the stream; providers
/// release the underlying connection when that happens.
pub struct ChatStream {
    /// The stream of chunks. Consume with `StreamExt::next()`.
    pub receiver: Pin<Box<dyn Stream<Item = Result<ChatChunk, LlmError>> + Send>>,
}

impl ChatStream {
    /// Wrap any chunk stream.
    pub fn new(stream: impl Stream<Item = Result<ChatChunk, LlmError>> + Send + 'static) -> Self {
        Self {
            receiver: Box::pin(stream),
        }
    }

    /// Drain the stream, concatenating all text deltas.
    ///
    /// Returns the text and the final usage (if the stream reported one).
    /// Stops at the first error.
    pub async fn collect_text(mut self) -> Result<(String, Option<CompletionUsage>), LlmError> {
        let mut text = String::new();
        let mut usage = None;
        while let Some(chunk) = self.receiver.next().await {
            let chunk = chunk?;
            if let Some(delta) = chunk.delta {
                text.push_str(&delta.content);
            }
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
        }
        Ok((text, usage))
    }
}

impl Stream for ChatStream {
    type Item = Result<ChatChunk, LlmError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStream").finish_non_exhaustive()
    }
}
