//! Weighted field embedder: turns a [`FieldRecord`] into per-field vectors.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};

use crate::embedder::TextEmbedder;
use crate::fields::FieldRecord;
use crate::vector;

/// Mapping from field name to one embedding vector.
pub type FieldEmbeddings = BTreeMap<String, Vec<f32>>;

/// Token embedded in place of a blank field under [`BlankPolicy::Sentinel`].
pub const BLANK_SENTINEL: &str = "unknown";

/// What to do with a field whose value list is empty after trimming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlankPolicy {
    /// Omit the field from the output map. Used for live queries.
    Skip,
    /// Embed [`BLANK_SENTINEL`] instead. Used by the offline corpus builder so
    /// every entry carries the full weighted field set.
    Sentinel,
}

/// Read-only string-to-embedding map consulted before calling the provider.
///
/// Purely an optimization for the small closed vocabularies (ecosystems,
/// funding types, topics) that dominate queries; results are identical whether
/// or not a lookup hits.
#[derive(Debug, Default)]
pub struct TagCache {
    entries: HashMap<String, Vec<f32>>,
}

impl TagCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a prebuilt map.
    pub fn from_entries(entries: HashMap<String, Vec<f32>>) -> Self {
        Self { entries }
    }

    /// Loads a JSON object mapping strings to vectors.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
        let entries: HashMap<String, Vec<f32>> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("invalid tag cache at {:?}", path))?;
        Ok(Self { entries })
    }

    /// Looks up a precomputed embedding by exact string key.
    pub fn get(&self, key: &str) -> Option<&Vec<f32>> {
        self.entries.get(key)
    }

    /// Number of cached strings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Embeds every field of `record` into one vector per field.
///
/// List values are embedded per element and averaged component-wise; scalar
/// values are a single-element average. A provider failure aborts the whole
/// call rather than yielding a partial map.
pub fn embed_fields(
    record: &FieldRecord,
    embedder: &dyn TextEmbedder,
    cache: Option<&TagCache>,
    blank: BlankPolicy,
) -> Result<FieldEmbeddings> {
    let mut memo = HashMap::new();
    embed_fields_memoized(record, embedder, cache, blank, &mut memo)
}

/// Like [`embed_fields`], but consults and fills `memo` with every
/// value-to-vector pair it resolves (cache hits included).
///
/// Batch jobs pass one memo across many records to avoid re-embedding the
/// same tag strings, and can dump the final map as a tag cache.
pub fn embed_fields_memoized(
    record: &FieldRecord,
    embedder: &dyn TextEmbedder,
    cache: Option<&TagCache>,
    blank: BlankPolicy,
    memo: &mut HashMap<String, Vec<f32>>,
) -> Result<FieldEmbeddings> {
    let mut field_values: Vec<(&str, Vec<String>)> = Vec::new();
    for (name, value) in record.iter() {
        let mut values = value.trimmed_values();
        if values.is_empty() {
            match blank {
                BlankPolicy::Skip => {
                    crate::debug_log!("skipping blank field {name}");
                    continue;
                }
                BlankPolicy::Sentinel => values.push(BLANK_SENTINEL.to_string()),
            }
        }
        field_values.push((name, values));
    }

    // Resolve distinct strings first so the provider sees batched calls and
    // repeated values (the same topic on several fields) embed once.
    let mut pending: Vec<String> = Vec::new();
    let mut queued: HashSet<String> = HashSet::new();
    for (_, values) in &field_values {
        for value in values {
            if memo.contains_key(value) || queued.contains(value) {
                continue;
            }
            if let Some(hit) = cache.and_then(|cache| cache.get(value)) {
                crate::debug_log!("tag cache hit for {value:?}");
                memo.insert(value.clone(), hit.clone());
                continue;
            }
            queued.insert(value.clone());
            pending.push(value.clone());
        }
    }

    for chunk in pending.chunks(embedder.batch_size().max(1)) {
        let inputs: Vec<&str> = chunk.iter().map(String::as_str).collect();
        let vectors = embedder.embed_batch(&inputs)?;
        anyhow::ensure!(
            vectors.len() == inputs.len(),
            "embedding batch returned {} vectors for {} inputs",
            vectors.len(),
            inputs.len()
        );
        for (value, vector) in chunk.iter().zip(vectors.into_iter()) {
            memo.insert(value.clone(), vector);
        }
    }

    let mut embeddings = FieldEmbeddings::new();
    for (name, values) in field_values {
        let vectors = values
            .iter()
            .map(|value| {
                memo.get(value)
                    .cloned()
                    .with_context(|| format!("no embedding resolved for {value:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        embeddings.insert(name.to_string(), vector::average_vectors(&vectors)?);
    }
    Ok(embeddings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldValue;
    use std::cell::RefCell;

    /// Deterministic embedder: a fixed vector per known token, plus a call log.
    struct StubEmbedder {
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl StubEmbedder {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
            }
        }

        fn vector_for(text: &str) -> Vec<f32> {
            match text {
                "Ethereum" => vec![1.0, 0.0, 0.0, 0.0],
                "Solana" => vec![0.0, 1.0, 0.0, 0.0],
                "DeFi" => vec![0.0, 0.0, 1.0, 0.0],
                BLANK_SENTINEL => vec![0.5, 0.5, 0.5, 0.5],
                other => {
                    let seed = other.bytes().map(f32::from).sum::<f32>().max(1.0);
                    vec![seed, seed / 2.0, 0.25, 1.0]
                }
            }
        }

        fn total_embedded(&self) -> usize {
            self.calls.borrow().iter().map(Vec::len).sum()
        }
    }

    impl TextEmbedder for StubEmbedder {
        fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
            self.calls
                .borrow_mut()
                .push(inputs.iter().map(|s| s.to_string()).collect());
            Ok(inputs.iter().map(|text| Self::vector_for(text)).collect())
        }

        fn batch_size(&self) -> usize {
            2
        }
    }

    struct FailingEmbedder;

    impl TextEmbedder for FailingEmbedder {
        fn embed_batch(&self, _inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
            anyhow::bail!("provider unavailable")
        }
    }

    #[test]
    fn list_field_embeds_to_average_of_values() {
        let mut record = FieldRecord::new();
        record.insert(
            "ecosystem",
            FieldValue::List(vec!["Ethereum".to_string(), "Solana".to_string()]),
        );
        let embedder = StubEmbedder::new();
        let embeddings = embed_fields(&record, &embedder, None, BlankPolicy::Skip).unwrap();
        let expected = vector::average_vectors(&[
            StubEmbedder::vector_for("Ethereum"),
            StubEmbedder::vector_for("Solana"),
        ])
        .unwrap();
        assert_eq!(embeddings["ecosystem"], expected);
    }

    #[test]
    fn scalar_field_embeds_directly() {
        let mut record = FieldRecord::new();
        record.insert("fundingTopics", FieldValue::Scalar(" DeFi ".to_string()));
        let embedder = StubEmbedder::new();
        let embeddings = embed_fields(&record, &embedder, None, BlankPolicy::Skip).unwrap();
        // Trimmed before lookup, so the stub's known token matches.
        assert_eq!(embeddings["fundingTopics"], StubEmbedder::vector_for("DeFi"));
    }

    #[test]
    fn cache_hits_skip_the_provider_and_match_fresh_results() {
        let mut record = FieldRecord::new();
        record.insert("ecosystem", FieldValue::Scalar("Ethereum".to_string()));

        let embedder = StubEmbedder::new();
        let fresh = embed_fields(&record, &embedder, None, BlankPolicy::Skip).unwrap();
        assert_eq!(embedder.total_embedded(), 1);

        let mut entries = HashMap::new();
        entries.insert("Ethereum".to_string(), StubEmbedder::vector_for("Ethereum"));
        let cache = TagCache::from_entries(entries);
        let cached_embedder = StubEmbedder::new();
        let cached =
            embed_fields(&record, &cached_embedder, Some(&cache), BlankPolicy::Skip).unwrap();
        assert_eq!(cached_embedder.total_embedded(), 0);
        assert_eq!(fresh, cached);
    }

    #[test]
    fn repeated_values_embed_once() {
        let mut record = FieldRecord::new();
        record.insert(
            "fundingTopics",
            FieldValue::List(vec!["DeFi".to_string(), "DeFi".to_string()]),
        );
        record.insert("description", FieldValue::Scalar("DeFi".to_string()));
        let embedder = StubEmbedder::new();
        embed_fields(&record, &embedder, None, BlankPolicy::Skip).unwrap();
        assert_eq!(embedder.total_embedded(), 1);
    }

    #[test]
    fn blank_field_is_skipped_for_live_queries() {
        let mut record = FieldRecord::new();
        record.insert("description", FieldValue::Scalar("   ".to_string()));
        record.insert("ecosystem", FieldValue::Scalar("Ethereum".to_string()));
        let embedder = StubEmbedder::new();
        let embeddings = embed_fields(&record, &embedder, None, BlankPolicy::Skip).unwrap();
        assert!(!embeddings.contains_key("description"));
        assert!(embeddings.contains_key("ecosystem"));
    }

    #[test]
    fn blank_field_embeds_sentinel_for_corpus_builds() {
        let mut record = FieldRecord::new();
        record.insert("description", FieldValue::List(Vec::new()));
        let embedder = StubEmbedder::new();
        let embeddings = embed_fields(&record, &embedder, None, BlankPolicy::Sentinel).unwrap();
        assert_eq!(
            embeddings["description"],
            StubEmbedder::vector_for(BLANK_SENTINEL)
        );
    }

    #[test]
    fn provider_failure_fails_the_whole_call() {
        let mut record = FieldRecord::new();
        record.insert("ecosystem", FieldValue::Scalar("Ethereum".to_string()));
        let result = embed_fields(&record, &FailingEmbedder, None, BlankPolicy::Skip);
        assert!(result.is_err());
    }

    #[test]
    fn memo_carries_embeddings_across_records() {
        let embedder = StubEmbedder::new();
        let mut memo = HashMap::new();
        for _ in 0..3 {
            let mut record = FieldRecord::new();
            record.insert("ecosystem", FieldValue::Scalar("Ethereum".to_string()));
            embed_fields_memoized(&record, &embedder, None, BlankPolicy::Skip, &mut memo).unwrap();
        }
        assert_eq!(embedder.total_embedded(), 1);
        assert!(memo.contains_key("Ethereum"));
    }
}
