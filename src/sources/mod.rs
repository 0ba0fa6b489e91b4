//! External Data Source Integrations
//!
//! Every source the research core can search implements
//! [`SourceIntegration`](crate::sources::registry::SourceIntegration):
//!
//! - `is_relevant(query)` - cheap local relevance check
//! - `generate_query(query)` - structured parameters, or `None` to skip
//! - `execute_search(params, credentials, limit)` - a [`SearchOutcome`] that
//!   carries either results or a [`SourceFailure`], never a panic
//!
//! Selection and dispatch are table-driven through [`SourceRegistry`]:
//!
//! ```ignore
//! let mut registry = SourceRegistry::with_default_sources();
//! registry.register(Arc::new(MyJobBoard::new()));
//! ```

/// Source trait, outcome types and registry.
pub mod registry;
/// Web search via DuckDuckGo.
#[cfg(feature = "web-search")]
pub mod web;

pub use registry::{
    Credentials, QueryParams, SearchOutcome, SourceFailure, SourceIntegration, SourceRegistry,
};
