//! Internal error helpers for mapping HTTP/reqwest errors to [`LlmError`].

use neuron_types::LlmError;

/// Map a non-success HTTP status (from the Dify API) to an [`LlmError`].
///
/// Built as retryable; the stream clears the flag once content was delivered.
///
/// Reference: <https://docs.dify.ai/guides/application-publishing/developing-with-apis>
pub(crate) fn map_http_status(status: reqwest::StatusCode, body: &str) -> LlmError {
    LlmError::Status {
        status: status.as_u16(),
        body: body.to_string(),
        retryable: true,
    }
}

/// Map a [`reqwest::Error`] to a retryable [`LlmError::Connection`].
pub(crate) fn map_reqwest_error(err: reqwest::Error) -> LlmError {
    let message = if err.is_timeout() {
        format!("request timed out: {err}")
    } else if err.is_connect() {
        format!("failed to connect: {err}")
    } else if err.is_body() || err.is_decode() {
        format!("stream read error: {err}")
    } else {
        format!("request failed: {err}")
    };
    LlmError::Connection {
        message,
        retryable: true,
        source: Some(Box::new(err)),
    }
}
