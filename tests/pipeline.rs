//! End-to-end pipeline: build corpus entries, persist as JSONL, reload, rank.

use std::collections::HashMap;
use std::io::Write;

use anyhow::Result;
use grantmatch::corpus::{self, build_entry_memoized};
use grantmatch::{
    embed_fields, find_top_matches, BlankPolicy, FieldRecord, FieldValue, GrantCorpus, TagCache,
    TextEmbedder,
};
use pretty_assertions::assert_eq;
use serde_json::json;

/// Deterministic embedder with fixed vectors for the vocabulary under test.
///
/// "Ethereum" and "Solana" are moderately close; "DeFi" and "Gaming" less so.
struct FixtureEmbedder;

impl FixtureEmbedder {
    fn vector_for(text: &str) -> Vec<f32> {
        match text {
            "DeFi" => vec![1.0, 0.0, 0.0, 0.0],
            "Gaming" => vec![0.6, 0.8, 0.0, 0.0],
            "Ethereum" => vec![0.0, 0.0, 1.0, 0.0],
            "Solana" => vec![0.0, 0.0, 0.8, 0.6],
            "unknown" => vec![0.5, 0.5, 0.5, 0.5],
            other => {
                let seed = (other.bytes().map(u32::from).sum::<u32>() % 97) as f32 + 1.0;
                vec![seed, seed / 3.0, 1.0, 0.25]
            }
        }
    }
}

impl TextEmbedder for FixtureEmbedder {
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(inputs.iter().map(|text| Self::vector_for(text)).collect())
    }
}

fn build_test_corpus() -> GrantCorpus {
    let grants = [
        json!({
            "grantProgramName": "G1",
            "fundingTopics": "DeFi",
            "ecosystem": "Ethereum",
            "website": "https://g1.example"
        }),
        json!({
            "grantProgramName": "G2",
            "fundingTopics": "DeFi",
            "ecosystem": "Solana"
        }),
        json!({
            "grantProgramName": "G3",
            "fundingTopics": "Gaming",
            "ecosystem": "Ethereum"
        }),
    ];

    let mut memo = HashMap::new();
    let mut entries = Vec::new();
    for (id, grant) in grants.iter().enumerate() {
        let (entry, skipped) =
            build_entry_memoized(id as u64, grant, &FixtureEmbedder, None, &mut memo)
                .expect("build entry");
        assert!(skipped.is_empty());
        entries.push(entry);
    }

    // Round-trip through the on-disk format the serving side consumes.
    let mut buffer = Vec::new();
    corpus::write_entries(&mut buffer, &entries).expect("write corpus");
    let mut file = tempfile::NamedTempFile::new().expect("temp corpus");
    file.write_all(&buffer).expect("persist corpus");
    GrantCorpus::load(file.path()).expect("load corpus")
}

#[test]
fn defi_on_ethereum_ranks_the_double_match_first() {
    let corpus = build_test_corpus();
    assert_eq!(corpus.len(), 3);

    let mut query = FieldRecord::new();
    query.insert("fundingTopics", FieldValue::Scalar("DeFi".to_string()));
    query.insert("ecosystem", FieldValue::Scalar("Ethereum".to_string()));
    let embeddings =
        embed_fields(&query, &FixtureEmbedder, None, BlankPolicy::Skip).expect("embed query");

    let matches = find_top_matches(&embeddings, &corpus, 5).expect("match");
    assert_eq!(matches.len(), 3);

    let names: Vec<&str> = matches.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names[0], "G1");
    // The topic carries weight 10 against the ecosystem's 9, so the
    // topic-only match (G2) stays ahead of the ecosystem-only match (G3).
    assert_eq!(names, vec!["G1", "G2", "G3"]);
    assert!(matches[0].similarity > matches[1].similarity);
    assert!(matches[1].similarity > matches[2].similarity);
    assert!((matches[0].similarity - 1.0).abs() < 1e-5);

    // The original record rides along unmodified.
    assert_eq!(
        matches[0].original.get("website").and_then(|v| v.as_str()),
        Some("https://g1.example")
    );
}

#[test]
fn list_valued_query_fields_average_their_elements() {
    let mut query = FieldRecord::new();
    query.insert(
        "ecosystem",
        FieldValue::List(vec!["Ethereum".to_string(), "Solana".to_string()]),
    );
    let embeddings =
        embed_fields(&query, &FixtureEmbedder, None, BlankPolicy::Skip).expect("embed query");

    let ethereum = FixtureEmbedder::vector_for("Ethereum");
    let solana = FixtureEmbedder::vector_for("Solana");
    let expected: Vec<f32> = ethereum
        .iter()
        .zip(solana.iter())
        .map(|(a, b)| (a + b) / 2.0)
        .collect();
    assert_eq!(embeddings["ecosystem"], expected);
}

#[test]
fn tag_cache_does_not_change_match_results() {
    let corpus = build_test_corpus();

    let mut query = FieldRecord::new();
    query.insert("fundingTopics", FieldValue::Scalar("DeFi".to_string()));

    let fresh = embed_fields(&query, &FixtureEmbedder, None, BlankPolicy::Skip).expect("embed");

    let mut entries = HashMap::new();
    entries.insert("DeFi".to_string(), FixtureEmbedder::vector_for("DeFi"));
    let cache = TagCache::from_entries(entries);
    let cached =
        embed_fields(&query, &FixtureEmbedder, Some(&cache), BlankPolicy::Skip).expect("embed");
    assert_eq!(fresh, cached);

    let fresh_matches = find_top_matches(&fresh, &corpus, 5).expect("match");
    let cached_matches = find_top_matches(&cached, &corpus, 5).expect("match");
    let fresh_scores: Vec<(u64, f32)> = fresh_matches
        .iter()
        .map(|m| (m.id, m.similarity))
        .collect();
    let cached_scores: Vec<(u64, f32)> = cached_matches
        .iter()
        .map(|m| (m.id, m.similarity))
        .collect();
    assert_eq!(fresh_scores, cached_scores);
}

#[test]
fn corpus_entries_carry_sentinel_embeddings_for_missing_fields() {
    let corpus = build_test_corpus();
    let sentinel = FixtureEmbedder::vector_for("unknown");
    for entry in corpus.entries() {
        // The raw grants carry neither fundingType nor description; the
        // builder embeds the sentinel token so every entry spans the full
        // weighted field set.
        assert_eq!(entry.embeddings["fundingType"], sentinel);
        assert_eq!(entry.embeddings["description"], sentinel);
    }
}
