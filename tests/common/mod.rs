#![allow(dead_code)]

pub mod mocks;

use argus::research::{ResearchCoordinator, TraceSink};
use argus::sources::{SourceIntegration, SourceRegistry};
use argus::{ArgusConfig, DecisionService};
use mocks::{CountingSynthesizer, ScriptedSource};
use std::sync::Arc;

/// Defaults with one task at a time, so runs are deterministic.
pub fn sequential_config() -> ArgusConfig {
    let mut config = ArgusConfig::default();
    config.research.max_concurrent_tasks = 1;
    config.research.reprioritize_after_batch = false;
    config.trace.enabled = false;
    config
}

pub fn registry(sources: Vec<Arc<dyn SourceIntegration>>) -> Arc<SourceRegistry> {
    let mut registry = SourceRegistry::new();
    for source in sources {
        registry.register(source);
    }
    Arc::new(registry)
}

pub fn coordinator(
    config: ArgusConfig,
    sources: Vec<Arc<ScriptedSource>>,
    decision: Arc<dyn DecisionService>,
    sink: Arc<dyn TraceSink>,
) -> ResearchCoordinator {
    ResearchCoordinator::new(
        Arc::new(config),
        registry(
            sources
                .into_iter()
                .map(|s| s as Arc<dyn SourceIntegration>)
                .collect(),
        ),
        decision,
        Arc::new(CountingSynthesizer),
        sink,
    )
}
