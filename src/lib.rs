//! # Argus - research orchestration engine
//!
//! Argus answers open-ended research questions by decomposing them into
//! tasks, searching every relevant external source with retries and query
//! reformulation, branching tasks into competing hypotheses, and stopping
//! adaptively when new work stops adding information.
//!
//! Every judgment the core cannot make locally (which sources fit a query,
//! which results are relevant, whether coverage is sufficient) goes to a
//! [`DecisionService`], normally backed by an LLM.
//!
//! ## Quick Start (Library Usage)
//!
//! ```rust,ignore
//! use argus::{
//!     ArgusConfig, LlmDecisionService, LlmReportSynthesizer, MemoryTraceSink,
//!     ResearchCoordinator, SourceRegistry,
//! };
//! use std::sync::Arc;
//!
//! let config = Arc::new(ArgusConfig::load("argus.toml")?);
//! let llm: Arc<dyn argus::LLMClient> = Arc::from(config.llm.to_provider()?.create_client()?);
//!
//! let coordinator = ResearchCoordinator::new(
//!     config,
//!     Arc::new(SourceRegistry::with_default_sources()),
//!     Arc::new(LlmDecisionService::new(llm.clone())),
//!     Arc::new(LlmReportSynthesizer::new(llm)),
//!     Arc::new(MemoryTraceSink::new()),
//! );
//! let report = coordinator.research("Who supplies GaN power transistors in the EU?").await?;
//! println!("{}", report.report_text);
//! ```
//!
//! ## Adding a Source
//!
//! ```rust,ignore
//! let mut registry = SourceRegistry::with_default_sources();
//! registry.register(Arc::new(MyPatentSearch::new()));
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `web-search` | DuckDuckGo web search source (default) |
//!
//! ## Modules
//!
//! - [`research`] - The orchestration core
//! - [`decision`] - Decision service contract and LLM implementation
//! - [`sources`] - Source integration contract and registry
//! - [`llm`] - LLM client implementations
//! - [`types`] - Common types and error handling
//! - [`utils`] - Configuration

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

/// Command-line parsing and terminal output.
pub mod cli;
/// The decision service: every model-backed judgment the core makes.
pub mod decision;
/// LLM provider clients and abstractions.
pub mod llm;
/// Task orchestration, hypotheses, saturation and reporting.
pub mod research;
/// External data source integrations.
pub mod sources;
/// Core types and error handling.
pub mod types;
/// Configuration utilities (TOML).
pub mod utils;

// Re-export commonly used types
pub use decision::{DecisionService, LlmDecisionService};
pub use llm::{LLMClient, LLMClientFactory, Provider};
pub use research::{
    JsonlTraceSink, LlmReportSynthesizer, MemoryTraceSink, ReportSynthesizer,
    ResearchCoordinator, ResearchReport, RunFailure, TraceSink,
};
pub use sources::{SourceIntegration, SourceRegistry};
pub use types::{AppError, Result};
pub use utils::toml_config::{ArgusConfig, ConfigError};
