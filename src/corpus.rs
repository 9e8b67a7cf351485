//! Corpus entries and their JSONL persistence.
//!
//! The corpus is built offline (one entry per grant, each carrying per-field
//! embeddings plus the untouched source record) and loaded once per process
//! for serving. Entries are stored one JSON object per line so the builder
//! can stream them out as workers finish.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::embedder::TextEmbedder;
use crate::fields::FieldRecord;
use crate::profile::{self, BlankPolicy, FieldEmbeddings, TagCache};

/// Key under which grant records carry their display name.
const NAME_FIELD: &str = "grantProgramName";

/// One grant with precomputed per-field embeddings and its raw record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusEntry {
    /// Stable identifier assigned at build time.
    pub id: u64,
    /// Display name of the grant program.
    pub name: String,
    /// Field name to embedding vector.
    pub embeddings: FieldEmbeddings,
    /// Original grant record, carried through unmodified.
    pub original: Value,
}

/// Immutable in-memory set of corpus entries, loaded once per process.
#[derive(Debug, Default)]
pub struct GrantCorpus {
    entries: Vec<CorpusEntry>,
}

impl GrantCorpus {
    /// Wraps prebuilt entries.
    pub fn from_entries(entries: Vec<CorpusEntry>) -> Self {
        Self { entries }
    }

    /// Reads a persisted corpus.
    ///
    /// A missing file or any unparseable line is a hard error; matches must
    /// never be served against a partially loaded corpus.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open corpus {:?}", path))?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line =
                line.with_context(|| format!("failed to read corpus line {}", line_no + 1))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: CorpusEntry = serde_json::from_str(&line)
                .with_context(|| format!("invalid corpus entry at line {}", line_no + 1))?;
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    /// Entries in build order.
    pub fn entries(&self) -> &[CorpusEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the corpus holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Serializes entries as JSONL. Returns the number of lines written.
pub fn write_entries<W: Write>(writer: &mut W, entries: &[CorpusEntry]) -> Result<usize> {
    let mut written = 0usize;
    for entry in entries {
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        written += 1;
    }
    Ok(written)
}

/// Builds one corpus entry from a raw grant record.
///
/// Embeds the weighted field set under the sentinel blank policy. Returns the
/// entry plus the names of fields skipped for having a non-string shape.
pub fn build_entry(
    id: u64,
    record: &Value,
    embedder: &dyn TextEmbedder,
    cache: Option<&TagCache>,
) -> Result<(CorpusEntry, Vec<String>)> {
    let mut memo = HashMap::new();
    build_entry_memoized(id, record, embedder, cache, &mut memo)
}

/// Like [`build_entry`], but shares a value-embedding memo across records.
pub fn build_entry_memoized(
    id: u64,
    record: &Value,
    embedder: &dyn TextEmbedder,
    cache: Option<&TagCache>,
    memo: &mut HashMap<String, Vec<f32>>,
) -> Result<(CorpusEntry, Vec<String>)> {
    let map = record
        .as_object()
        .with_context(|| format!("grant record {} is not a JSON object", id))?;
    let (fields, skipped) = FieldRecord::from_weighted_json(map);
    let embeddings =
        profile::embed_fields_memoized(&fields, embedder, cache, BlankPolicy::Sentinel, memo)
            .with_context(|| format!("failed to embed grant record {}", id))?;
    let name = map
        .get(NAME_FIELD)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("grant #{}", id));
    let entry = CorpusEntry {
        id,
        name,
        embeddings,
        original: record.clone(),
    };
    Ok((entry, skipped))
}
