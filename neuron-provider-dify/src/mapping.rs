//! Mapping from [`ChatContext`] to the Dify request body.

use std::collections::HashMap;

use neuron_types::{ChatContext, LlmError};

use crate::types::{ChatMessagesRequest, DEFAULT_USER, RESPONSE_MODE_STREAMING};

/// Build the `/v1/chat-messages` body for one `chat()` call.
///
/// Only the most recent user message is sent; Dify keeps the rest of the
/// conversation server-side under `conversation_id`.
pub(crate) fn to_api_request(
    context: &ChatContext,
    conversation_id: Option<&str>,
    temperature: Option<f64>,
) -> Result<ChatMessagesRequest, LlmError> {
    let last_user = context
        .last_user_message()
        .ok_or_else(|| LlmError::Configuration("no user message found in chat context".into()))?;

    Ok(ChatMessagesRequest {
        inputs: HashMap::new(),
        query: last_user.content.clone(),
        response_mode: RESPONSE_MODE_STREAMING,
        conversation_id: conversation_id.unwrap_or_default().to_string(),
        user: DEFAULT_USER,
        temperature,
    })
}

/// Pick the effective temperature: per-call override, then instance default.
pub(crate) fn resolve_temperature(override_: Option<f64>, default: Option<f64>) -> Option<f64> {
    override_.or(default)
}
