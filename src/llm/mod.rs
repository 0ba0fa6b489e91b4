//! LLM Provider Clients and Abstractions
//!
//! The decision service and the report synthesizer talk to a model through
//! [`LLMClient`]. Enable providers via Cargo features:
//! - `openai` - any OpenAI-compatible chat completions API (`async-openai`)
//! - `ollama` - a local Ollama server (`ollama-rs`)
//!
//! # Example
//!
//! ```ignore
//! use argus::llm::{LLMClientFactory, Provider};
//!
//! let factory = LLMClientFactory::new(provider);
//! let client = factory.create_default()?;
//! let response = client.generate("What is 2+2?").await?;
//! ```

/// Core LLM client trait and provider factory.
pub mod client;
/// Ollama `/api/chat` client.
#[cfg(feature = "ollama")]
pub mod ollama;
/// OpenAI-compatible chat completions client.
#[cfg(feature = "openai")]
pub mod openai;

pub use client::{LLMClient, LLMClientFactory, ModelParams, Provider};
