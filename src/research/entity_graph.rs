//! Undirected co-occurrence map between entity names.

use crate::research::dedup::normalize;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityGraph {
    adjacency: BTreeMap<String, BTreeSet<String>>,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that every entity in `entities` co-occurred with every other.
    pub fn record_cooccurrence<'a, I>(&mut self, entities: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        let names: BTreeSet<String> = entities
            .into_iter()
            .map(|e| normalize(e))
            .filter(|e| !e.is_empty())
            .collect();

        for name in &names {
            let neighbours = self.adjacency.entry(name.clone()).or_default();
            for other in &names {
                if other != name {
                    neighbours.insert(other.clone());
                }
            }
        }
    }

    pub fn neighbours(&self, entity: &str) -> Option<&BTreeSet<String>> {
        self.adjacency.get(&normalize(entity))
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.adjacency.contains_key(&normalize(entity))
    }

    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(BTreeSet::len).sum::<usize>() / 2
    }

    pub fn entities(&self) -> impl Iterator<Item = &String> {
        self.adjacency.keys()
    }

    pub fn adjacency(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.adjacency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cooccurrence_is_undirected() {
        let mut graph = EntityGraph::new();
        graph.record_cooccurrence(&names(&["Acme", "Globex", "Initech"]));

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.edge_count(), 3);
        assert!(graph.neighbours("acme").unwrap().contains("globex"));
        assert!(graph.neighbours("GLOBEX").unwrap().contains("acme"));
        assert!(!graph.neighbours("acme").unwrap().contains("acme"));
    }

    #[test]
    fn test_names_are_lowercased_and_merged() {
        let mut graph = EntityGraph::new();
        graph.record_cooccurrence(&names(&["Acme", "Globex"]));
        graph.record_cooccurrence(&names(&["ACME ", "Umbrella", ""]));

        assert_eq!(graph.len(), 3);
        let acme = graph.neighbours("acme").unwrap();
        assert_eq!(acme.len(), 2);
        assert!(graph.contains(" Umbrella"));
    }

    #[test]
    fn test_single_entity_has_no_edges() {
        let mut graph = EntityGraph::new();
        graph.record_cooccurrence(&names(&["Solo"]));
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.edge_count(), 0);
    }
}
