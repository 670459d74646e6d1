//! Dify API client struct and builder.

use std::sync::{Mutex, MutexGuard, PoisonError};

use neuron_types::{ChatContext, ChatOptions, ChatStream, Llm, LlmError};

use crate::mapping::{resolve_temperature, to_api_request};
use crate::streaming::stream_chat;

/// Default Dify API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.dify.ai";

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "DIFY_API_KEY";

/// Environment variable holding the base URL override.
pub const API_BASE_ENV: &str = "DIFY_API_BASE";

/// Immutable per-instance request options.
#[derive(Clone, PartialEq)]
pub struct DifyOptions {
    /// Dify app API key (`DIFY_API_KEY`).
    pub api_key: String,
    /// API base URL (`DIFY_API_BASE`, override for testing or self-hosted Dify).
    pub base_url: String,
    /// Default sampling temperature. Omitted from requests when `None`.
    pub temperature: Option<f64>,
    /// Conversation to continue. `None` starts a new conversation per request.
    pub conversation_id: Option<String>,
}

impl std::fmt::Debug for DifyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DifyOptions")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("conversation_id", &self.conversation_id)
            .finish()
    }
}

/// Client for the Dify chat-messages API.
///
/// Implements [`Llm`] for use anywhere a chat model is accepted. Only
/// streaming response mode is supported.
///
/// The HTTP session is created on the first [`chat`](Llm::chat) call and
/// reused afterwards; [`close`](Llm::close) releases it.
///
/// # Example
///
/// ```no_run
/// use neuron_provider_dify::Dify;
///
/// let client = Dify::new("app-...")
///     .base_url("https://dify.internal.example.com")
///     .temperature(0.3);
/// ```
pub struct Dify {
    pub(crate) options: DifyOptions,
    /// Lazily created, shared HTTP session.
    session: Mutex<Option<reqwest::Client>>,
}

impl Dify {
    /// Create a new client with the given API key and sensible defaults.
    ///
    /// Default base URL: `https://api.dify.ai`.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_options(DifyOptions {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.into(),
            temperature: None,
            conversation_id: None,
        })
    }

    /// Create a client from fully resolved options.
    #[must_use]
    pub fn with_options(options: DifyOptions) -> Self {
        Self {
            options,
            session: Mutex::new(None),
        }
    }

    /// Start a builder that falls back to the environment for missing values.
    #[must_use]
    pub fn builder() -> DifyBuilder {
        DifyBuilder::default()
    }

    /// Create a client from `DIFY_API_KEY` and `DIFY_API_BASE`.
    ///
    /// Fails with [`LlmError::Configuration`] if `DIFY_API_KEY` is unset or empty.
    pub fn from_env() -> Result<Self, LlmError> {
        Self::builder().build()
    }

    /// Override the API base URL.
    ///
    /// Useful for testing with a local mock server or a self-hosted Dify.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.options.base_url = url.into();
        self
    }

    /// Set the default sampling temperature.
    #[must_use]
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.options.temperature = Some(temperature);
        self
    }

    /// Continue an existing Dify conversation.
    #[must_use]
    pub fn conversation_id(mut self, id: impl Into<String>) -> Self {
        self.options.conversation_id = Some(id.into());
        self
    }

    /// The resolved options.
    #[must_use]
    pub fn options(&self) -> &DifyOptions {
        &self.options
    }

    /// Whether an HTTP session is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lock_session().is_some()
    }

    /// Build the chat-messages endpoint URL.
    pub(crate) fn chat_messages_url(&self) -> String {
        format!(
            "{}/v1/chat-messages",
            self.options.base_url.trim_end_matches('/')
        )
    }

    /// Return the cached session, creating it on first use.
    fn session(&self) -> reqwest::Client {
        self.lock_session()
            .get_or_insert_with(|| {
                tracing::debug!(base_url = %self.options.base_url, "opening dify http session");
                reqwest::Client::new()
            })
            .clone()
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<reqwest::Client>> {
        // The slot holds no invariants a panicking holder could break.
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Llm for Dify {
    fn name(&self) -> &str {
        "dify"
    }

    /// Start a streaming chat against `/v1/chat-messages`.
    ///
    /// Validates the context and prepares the request; the POST is sent when
    /// the returned stream is first polled.
    fn chat(&self, context: &ChatContext, options: ChatOptions) -> Result<ChatStream, LlmError> {
        let temperature = resolve_temperature(options.temperature, self.options.temperature);
        let body = to_api_request(context, self.options.conversation_id.as_deref(), temperature)?;
        let url = self.chat_messages_url();

        tracing::debug!(
            url = %url,
            conversation_id = %body.conversation_id,
            temperature = ?body.temperature,
            "preparing dify streaming request"
        );

        let mut request = self
            .session()
            .post(&url)
            .bearer_auth(&self.options.api_key)
            .header("content-type", "application/json")
            .json(&body);
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        Ok(stream_chat(request))
    }

    /// Drop the cached session. Streams already in flight keep their own
    /// handle to the connection pool and finish normally.
    fn close(&self) {
        if self.lock_session().take().is_some() {
            tracing::debug!("closed dify http session");
        }
    }
}

impl std::fmt::Debug for Dify {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dify")
            .field("options", &self.options)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Builder for [`Dify`] that resolves missing values from the environment.
#[derive(Debug, Default, Clone)]
pub struct DifyBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    temperature: Option<f64>,
    conversation_id: Option<String>,
}

impl DifyBuilder {
    /// Explicit API key. Takes precedence over `DIFY_API_KEY`.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Explicit base URL. Takes precedence over `DIFY_API_BASE`.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Default sampling temperature.
    #[must_use]
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Conversation to continue.
    #[must_use]
    pub fn conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    /// Resolve the options and build the client. Performs no I/O.
    pub fn build(self) -> Result<Dify, LlmError> {
        self.build_with(|name| std::env::var(name).ok())
    }

    /// Resolve with a custom variable lookup.
    pub(crate) fn build_with(self, lookup: impl Fn(&str) -> Option<String>) -> Result<Dify, LlmError> {
        let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());

        let api_key = non_empty(self.api_key)
            .or_else(|| non_empty(lookup(API_KEY_ENV)))
            .ok_or_else(|| {
                LlmError::Configuration(format!(
                    "Dify API key is required (pass one explicitly or set {API_KEY_ENV})"
                ))
            })?;
        let base_url = non_empty(self.base_url)
            .or_else(|| non_empty(lookup(API_BASE_ENV)))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Ok(Dify::with_options(DifyOptions {
            api_key,
            base_url,
            temperature: self.temperature,
            conversation_id: self.conversation_id,
        }))
    }
}
