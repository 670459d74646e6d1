//! Chat context, options and the incremental chunk protocol.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The role of a message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A system message.
    System,
    /// A human user.
    User,
    /// An AI assistant.
    Assistant,
}

impl Role {
    /// Wire name of the role (`"system"`, `"user"`, `"assistant"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message author.
    pub role: Role,
    /// The textual content of the message.
    pub content: String,
}

impl ChatMessage {
    /// Create a system message.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    /// Create a user message.
    ///
    /// # Example
    ///
    /// ```
    /// use neuron_types::{ChatMessage, Role};
    /// let msg = ChatMessage::user("What is Rust?");
    /// assert_eq!(msg.role, Role::User);
    /// ```
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

/// Ordered conversation history handed to a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatContext {
    /// Messages, oldest first.
    pub messages: Vec<ChatMessage>,
}

impl ChatContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message.
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Builder-style append.
    #[must_use]
    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// The most recent message whose role is [`Role::User`], if any.
    #[must_use]
    pub fn last_user_message(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }
}

impl From<Vec<ChatMessage>> for ChatContext {
    fn from(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }
}

/// Per-call options for [`Llm::chat`](crate::Llm::chat).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    /// Sampling temperature override. Takes precedence over the provider default.
    pub temperature: Option<f64>,
    /// Transport-level timeout for the whole request, applied by the HTTP client.
    pub timeout: Option<Duration>,
}

impl ChatOptions {
    /// Override the sampling temperature.
    #[must_use]
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set a transport timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Incremental content carried by a [`ChatChunk`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceDelta {
    /// Author role of the fragment.
    pub role: Role,
    /// Text fragment.
    pub content: String,
}

/// Token usage statistics for a completed stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionUsage {
    /// Tokens in the input/prompt.
    pub prompt_tokens: u64,
    /// Tokens in the output/completion.
    pub completion_tokens: u64,
    /// `prompt_tokens + completion_tokens`.
    pub total_tokens: u64,
}

impl CompletionUsage {
    /// Build a usage summary, computing the total.
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// One increment of a streamed model response.
///
/// A chunk carries either a content delta or a usage summary. The usage-only
/// chunk is sent exactly once, as the last item of a successful stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatChunk {
    /// Identifier of the message this chunk belongs to.
    pub request_id: String,
    /// Content fragment, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<ChoiceDelta>,
    /// Final usage, if this is the terminal chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<CompletionUsage>,
}

impl ChatChunk {
    /// A chunk carrying an assistant text fragment.
    #[must_use]
    pub fn content(request_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            delta: Some(ChoiceDelta {
                role: Role::Assistant,
                content: text.into(),
            }),
            usage: None,
        }
    }

    /// A chunk carrying only a usage summary.
    #[must_use]
    pub fn usage_only(request_id: impl Into<String>, usage: CompletionUsage) -> Self {
        Self {
            request_id: request_id.into(),
            delta: None,
            usage: Some(usage),
        }
    }

    /// The text fragment, if this chunk has one.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.delta.as_ref().map(|d| d.content.as_str())
    }
}
