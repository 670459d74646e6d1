#![doc = include_str!("../README.md")]

pub mod client;
pub(crate) mod error;
pub(crate) mod mapping;
pub(crate) mod streaming;
pub(crate) mod types;

pub use client::{Dify, DifyBuilder, DifyOptions};

// Re-export neuron-types for convenience
pub use neuron_types::{ChatChunk, ChatStream, Llm, LlmError};
