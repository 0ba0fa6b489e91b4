//! Result deduplication by identity key with multi-hypothesis attribution.
//!
//! The identity of a result is `(normalized url, normalized title)`. Records
//! whose url and title are both blank have no identity and are never merged.

use crate::research::task::{DeltaMetrics, ResultRecord, Task};
use std::collections::{BTreeSet, HashMap};

pub type IdentityKey = (String, String);

/// Lower-cased and trimmed.
pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

pub fn identity_key(record: &ResultRecord) -> Option<IdentityKey> {
    let url = normalize(&record.url);
    let title = normalize(&record.title);
    if url.is_empty() && title.is_empty() {
        None
    } else {
        Some((url, title))
    }
}

/// Fold `incoming`'s attribution (and entities) into `existing`.
pub fn merge_attribution(existing: &mut ResultRecord, incoming: &ResultRecord) {
    let mut ids: Vec<String> = existing.attributions().into_iter().map(String::from).collect();
    for id in incoming.attributions() {
        if !ids.iter().any(|known| known == id) {
            ids.push(id.to_string());
        }
    }
    if existing.hypothesis_id.is_none() {
        existing.hypothesis_id = ids.first().cloned();
    }
    if ids.len() > 1 {
        existing.hypothesis_ids = ids;
    }

    for entity in &incoming.entities {
        if !existing.entities.iter().any(|e| e.eq_ignore_ascii_case(entity)) {
            existing.entities.push(entity.clone());
        }
    }
    if existing.date.is_none() {
        existing.date = incoming.date.clone();
    }
}

/// Collapse duplicates, keeping first-occurrence order. Idempotent.
pub fn dedupe_results<I>(records: I) -> Vec<ResultRecord>
where
    I: IntoIterator<Item = ResultRecord>,
{
    let mut out: Vec<ResultRecord> = Vec::new();
    let mut index: HashMap<IdentityKey, usize> = HashMap::new();

    for record in records {
        match identity_key(&record) {
            Some(key) => {
                if let Some(&pos) = index.get(&key) {
                    merge_attribution(&mut out[pos], &record);
                } else {
                    index.insert(key, out.len());
                    out.push(record);
                }
            }
            None => out.push(record),
        }
    }

    out
}

/// Merge a hypothesis batch into the task's pool and report what was new.
///
/// Duplicates are merged in place into the record already held by the task, so
/// the pool never shrinks and order of first appearance is kept.
pub fn absorb_batch(
    task: &mut Task,
    batch: Vec<ResultRecord>,
    batch_entities: &BTreeSet<String>,
) -> DeltaMetrics {
    let mut index: HashMap<IdentityKey, usize> = HashMap::new();
    for (pos, record) in task.accumulated_results().iter().enumerate() {
        if let Some(key) = identity_key(record) {
            index.entry(key).or_insert(pos);
        }
    }

    let mut metrics = DeltaMetrics::default();
    let mut fresh: Vec<ResultRecord> = Vec::new();
    let base_len = task.accumulated_results().len();

    for record in batch {
        let Some(key) = identity_key(&record) else {
            metrics.results_new += 1;
            fresh.push(record);
            continue;
        };

        match index.get(&key) {
            Some(&pos) if pos < base_len => {
                merge_attribution(&mut task.results_mut()[pos], &record);
                metrics.results_duplicate += 1;
            }
            Some(&pos) => {
                merge_attribution(&mut fresh[pos - base_len], &record);
                metrics.results_duplicate += 1;
            }
            None => {
                index.insert(key, base_len + fresh.len());
                metrics.results_new += 1;
                fresh.push(record);
            }
        }
    }
    task.append_results(fresh);

    for entity in batch_entities {
        let entity = normalize(entity);
        if entity.is_empty() {
            continue;
        }
        if task.entities.insert(entity) {
            metrics.entities_new += 1;
        } else {
            metrics.entities_duplicate += 1;
        }
    }

    metrics.total_results = task.accumulated_results().len();
    metrics.total_entities = task.entities.len();
    metrics
}

/// Entities mentioned by a batch: those attached by the integration plus any
/// expected entity that appears in a title or snippet.
pub fn batch_entities(batch: &[ResultRecord], expected: &[String]) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    for record in batch {
        for entity in &record.entities {
            let entity = normalize(entity);
            if !entity.is_empty() {
                found.insert(entity);
            }
        }
        let haystack = format!("{} {}", record.title, record.snippet).to_lowercase();
        for candidate in expected {
            let candidate = normalize(candidate);
            if !candidate.is_empty() && haystack.contains(&candidate) {
                found.insert(candidate);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn record(title: &str, url: &str, hypothesis: Option<&str>) -> ResultRecord {
        let mut r = ResultRecord::new(title, url, "", "web");
        r.hypothesis_id = hypothesis.map(String::from);
        r
    }

    #[rstest]
    #[case("  https://X/1 ", "Title", "https://x/1", "title")]
    #[case("HTTPS://EXAMPLE.COM", "  A  B ", "https://example.com", "a  b")]
    #[case("", "Only Title", "", "only title")]
    fn test_identity_key_normalizes(
        #[case] url: &str,
        #[case] title: &str,
        #[case] want_url: &str,
        #[case] want_title: &str,
    ) {
        let key = identity_key(&record(title, url, None)).unwrap();
        assert_eq!(key, (want_url.to_string(), want_title.to_string()));
    }

    #[test]
    fn test_empty_key_never_merges() {
        let out = dedupe_results(vec![record("  ", "", None), record("", " ", None)]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_case_insensitive_title_merges_attribution() {
        let out = dedupe_results(vec![
            record("Senior Rust Engineer", "https://x/1", Some("3.1")),
            record("senior rust engineer", "https://x/1", Some("3.2")),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].hypothesis_ids, vec!["3.1", "3.2"]);
        assert_eq!(out[0].hypothesis_id.as_deref(), Some("3.1"));
    }

    #[test]
    fn test_dedupe_is_idempotent() {
        let input = vec![
            record("a", "https://x/a", Some("1.1")),
            record("A", "https://x/a", Some("1.2")),
            record("b", "https://x/b", None),
            record("", "", None),
            record("b", "https://x/b", Some("1.3")),
        ];
        let once = dedupe_results(input);
        let twice = dedupe_results(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once.len(), 3);
    }

    #[test]
    fn test_absorb_batch_counts_new_and_duplicates() {
        let mut task = Task::new(1, "q", "r");
        let first = absorb_batch(
            &mut task,
            vec![record("a", "https://x/a", Some("1.1")), record("b", "https://x/b", Some("1.1"))],
            &BTreeSet::from(["Acme".to_string()]),
        );
        assert_eq!(first.results_new, 2);
        assert_eq!(first.results_duplicate, 0);
        assert_eq!(first.entities_new, 1);

        let second = absorb_batch(
            &mut task,
            vec![
                record("A", "https://x/a", Some("1.2")),
                record("c", "https://x/c", Some("1.2")),
                record("c", "https://x/c", Some("1.2")),
            ],
            &BTreeSet::from(["acme".to_string(), "Globex".to_string()]),
        );
        assert_eq!(second.results_new, 1);
        assert_eq!(second.results_duplicate, 2);
        assert_eq!(second.entities_new, 1);
        assert_eq!(second.entities_duplicate, 1);
        assert_eq!(second.total_results, 3);
        assert_eq!(second.total_entities, 2);

        let merged = &task.accumulated_results()[0];
        assert_eq!(merged.hypothesis_ids, vec!["1.1", "1.2"]);
    }

    #[test]
    fn test_batch_entities_matches_expected_mentions() {
        let batch = vec![
            ResultRecord::new("Acme hires Rust devs", "https://x/1", "Berlin office", "jobs")
                .with_entities(vec!["Acme GmbH".to_string()]),
        ];
        let found = batch_entities(&batch, &["berlin".to_string(), "Munich".to_string()]);
        assert!(found.contains("acme gmbh"));
        assert!(found.contains("berlin"));
        assert!(!found.contains("munich"));
    }
}
