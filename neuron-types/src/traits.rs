//! The [`Llm`] trait implemented by every chat provider.

use crate::error::LlmError;
use crate::stream::ChatStream;
use crate::types::{ChatContext, ChatOptions};

/// Streaming chat model.
///
/// `chat` validates its input synchronously and returns a [`ChatStream`]
/// without performing network I/O; the request is issued when the stream is
/// first polled. Retry policy belongs to the caller, guided by
/// [`LlmError::is_retryable`].
///
/// # Example
///
/// ```ignore
/// struct Echo;
///
/// impl Llm for Echo {
///     fn name(&self) -> &str { "echo" }
///     fn chat(&self, ctx: &ChatContext, _opts: ChatOptions) -> Result<ChatStream, LlmError> {
///         let text = ctx.last_user_message().map(|m| m.content.clone()).unwrap_or_default();
///         Ok(ChatStream::new(futures::stream::iter([Ok(ChatChunk::content("e1", text))])))
///     }
///     fn close(&self) {}
/// }
/// ```
pub trait Llm: Send + Sync {
    /// Short provider name, for logs.
    fn name(&self) -> &str;

    /// Start a streaming chat completion for `context`.
    ///
    /// Providers may defer network work until the returned stream is polled,
    /// and may require polling from within a tokio runtime.
    fn chat(&self, context: &ChatContext, options: ChatOptions) -> Result<ChatStream, LlmError>;

    /// Release pooled connection resources. Idempotent.
    fn close(&self);
}
