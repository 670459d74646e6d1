//! Streaming example: real-time token output from a Dify app.
//!
//! Set DIFY_API_KEY (and optionally DIFY_API_BASE) in your environment and run:
//!   cargo run --example streaming -p neuron-provider-dify -- "Tell me a joke"

use std::io::Write;

use futures::StreamExt;
use neuron_provider_dify::{Dify, Llm};
use neuron_types::{ChatContext, ChatMessage, ChatOptions};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let query = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Write a haiku about Rust programming.".to_string());

    let provider = Dify::from_env()?;
    let ctx = ChatContext::new()
        .with_message(ChatMessage::system("You are a helpful assistant."))
        .with_message(ChatMessage::user(query));

    let mut stream = provider.chat(&ctx, ChatOptions::default())?;

    print!("Streaming: ");
    std::io::stdout().flush()?;

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                if let Some(text) = chunk.text() {
                    print!("{text}");
                    std::io::stdout().flush()?;
                }
                if let Some(usage) = chunk.usage {
                    println!();
                    println!(
                        "Token usage: {} prompt, {} completion, {} total (message {})",
                        usage.prompt_tokens,
                        usage.completion_tokens,
                        usage.total_tokens,
                        chunk.request_id
                    );
                }
            }
            Err(err) => {
                eprintln!("\nStream error: {err} (retryable: {})", err.is_retryable());
                break;
            }
        }
    }

    provider.close();
    Ok(())
}
