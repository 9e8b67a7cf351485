use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use grantmatch::corpus::{self, CorpusEntry};
use grantmatch::{OpenAiConfig, OpenAiEmbedder, TagCache};
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(
    name = "grantmatch-embedder",
    about = "Build the grant corpus: per-field embeddings for every raw grant record"
)]
struct BuildCli {
    /// Raw grants file: a JSON array or JSONL of grant records
    #[arg(long, env = "GRANTMATCH_BUILD_INPUT", default_value = "grants.json")]
    input: PathBuf,

    /// Output JSONL corpus consumed by the matcher
    #[arg(
        long,
        env = "GRANTMATCH_BUILD_OUTPUT",
        default_value = "grant_embeddings.jsonl"
    )]
    output: PathBuf,

    /// Optional precomputed tag cache (JSON object of string -> vector)
    #[arg(long, env = "GRANTMATCH_TAG_CACHE")]
    tag_cache: Option<PathBuf>,

    /// Write every value embedding used during the build to this tag cache file
    #[arg(long, env = "GRANTMATCH_TAG_CACHE_OUT")]
    tag_cache_out: Option<PathBuf>,

    /// API key for embedding calls
    #[arg(long, env = "OPENAI_API_KEY")]
    openai_api_key: String,

    /// Embedding model identifier (e.g. text-embedding-3-small)
    #[arg(
        long,
        env = "GRANTMATCH_OPENAI_MODEL",
        default_value = "text-embedding-3-small"
    )]
    openai_model: String,

    /// Optional dimension override when supported by the model
    #[arg(long, env = "GRANTMATCH_OPENAI_DIMENSIONS")]
    openai_dimensions: Option<usize>,

    /// Base URL for the OpenAI-compatible API
    #[arg(
        long,
        env = "GRANTMATCH_OPENAI_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    openai_base_url: String,

    /// Max number of strings to send per embedding request
    #[arg(long, env = "GRANTMATCH_OPENAI_BATCH", default_value_t = 32)]
    batch_size: usize,

    /// Max seconds to wait for each embedding request
    #[arg(long, env = "GRANTMATCH_OPENAI_TIMEOUT_SECS", default_value_t = 30)]
    openai_timeout_secs: u64,

    /// Number of retries for rate limits or transient errors
    #[arg(long, env = "GRANTMATCH_OPENAI_MAX_RETRIES", default_value_t = 5)]
    max_retries: usize,

    /// Number of concurrent embedding workers
    #[arg(
        long = "openai-threads",
        env = "GRANTMATCH_OPENAI_THREADS",
        default_value_t = 1,
        alias = "worker-threads"
    )]
    worker_threads: usize,
}

fn main() -> Result<()> {
    let cli = BuildCli::parse();
    let tag_cache = match &cli.tag_cache {
        Some(path) => {
            let cache = TagCache::load(path).context("failed to read tag cache")?;
            eprintln!("loaded {} cached tag embeddings", cache.len());
            Some(Arc::new(cache))
        }
        None => None,
    };
    let embedder = OpenAiEmbedder::new(OpenAiConfig {
        api_key: cli.openai_api_key,
        base_url: cli.openai_base_url,
        model: cli.openai_model,
        dimensions: cli.openai_dimensions,
        timeout: Duration::from_secs(cli.openai_timeout_secs.max(1)),
        max_retries: cli.max_retries.max(1),
        batch_size: cli.batch_size.max(1),
    })?;

    let grants = load_grants(&cli.input)?;
    anyhow::ensure!(!grants.is_empty(), "no grant records found in {:?}", cli.input);

    let output =
        File::create(&cli.output).with_context(|| format!("failed to create {:?}", cli.output))?;
    let mut writer = BufWriter::new(output);

    let memo = build_corpus(
        grants,
        &mut writer,
        embedder,
        tag_cache,
        cli.worker_threads.max(1),
    )?;
    writer.flush()?;

    if let Some(path) = &cli.tag_cache_out {
        write_tag_cache(path, &memo)?;
        eprintln!("wrote {} value embeddings to {:?}", memo.len(), path);
    }
    Ok(())
}

struct BuildTask {
    id: u64,
    record: Value,
}

struct BuiltRecord {
    entry: CorpusEntry,
    skipped: Vec<String>,
}

type BuildResult = Result<BuiltRecord>;
type ValueMemo = HashMap<String, Vec<f32>>;

fn build_corpus<W: Write>(
    grants: Vec<Value>,
    writer: &mut W,
    embedder: OpenAiEmbedder,
    tag_cache: Option<Arc<TagCache>>,
    worker_threads: usize,
) -> Result<ValueMemo> {
    let total = grants.len();
    eprintln!(
        "embedding {} grant record(s) across {} worker(s)...",
        total, worker_threads
    );
    let (task_tx, task_rx) = bounded::<BuildTask>(worker_threads * 2);
    let (result_tx, result_rx) = bounded::<BuildResult>(worker_threads * 2);
    let (memo_tx, memo_rx) = bounded::<ValueMemo>(worker_threads);

    for worker_id in 0..worker_threads {
        let worker_embedder = embedder.clone();
        let worker_cache = tag_cache.clone();
        let worker_rx = task_rx.clone();
        let worker_tx = result_tx.clone();
        let worker_memo_tx = memo_tx.clone();
        thread::spawn(move || {
            worker_loop(
                worker_id,
                worker_rx,
                worker_tx,
                worker_memo_tx,
                worker_embedder,
                worker_cache,
            )
        });
    }
    drop(task_rx);
    drop(result_tx);
    drop(memo_tx);

    let mut pending: BTreeMap<u64, BuiltRecord> = BTreeMap::new();
    let mut next_write_id = 0u64;
    let mut written = 0usize;
    let mut inflight = 0usize;
    for (id, record) in grants.into_iter().enumerate() {
        let task = BuildTask {
            id: id as u64,
            record,
        };
        inflight += 1;
        task_tx
            .send(task)
            .map_err(|_| anyhow!("embedding worker channel closed"))?;
        drain_ready_results(
            &result_rx,
            &mut pending,
            &mut next_write_id,
            writer,
            &mut written,
            &mut inflight,
            total,
        )?;
    }
    drop(task_tx);

    while inflight > 0 {
        let result = result_rx
            .recv()
            .map_err(|_| anyhow!("embedding worker channel closed unexpectedly"))?;
        inflight -= 1;
        process_result(
            result?,
            &mut pending,
            &mut next_write_id,
            writer,
            &mut written,
            total,
        )?;
    }

    eprintln!("corpus build complete: {} entries written.", written);

    let mut merged: ValueMemo = HashMap::new();
    for memo in memo_rx.iter() {
        merged.extend(memo);
    }
    Ok(merged)
}

fn drain_ready_results<W: Write>(
    result_rx: &Receiver<BuildResult>,
    pending: &mut BTreeMap<u64, BuiltRecord>,
    next_write_id: &mut u64,
    writer: &mut W,
    written: &mut usize,
    inflight: &mut usize,
    total: usize,
) -> Result<()> {
    loop {
        let result = match result_rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                anyhow::bail!("embedding worker channel closed unexpectedly")
            }
        };
        *inflight = inflight.saturating_sub(1);
        process_result(result?, pending, next_write_id, writer, written, total)?;
    }
    Ok(())
}

fn process_result<W: Write>(
    built: BuiltRecord,
    pending: &mut BTreeMap<u64, BuiltRecord>,
    next_write_id: &mut u64,
    writer: &mut W,
    written: &mut usize,
    total: usize,
) -> Result<()> {
    if !built.skipped.is_empty() {
        eprintln!(
            "grant {}: skipped non-embeddable field(s): {}",
            built.entry.id,
            built.skipped.join(", ")
        );
    }
    pending.insert(built.entry.id, built);
    while let Some(ready) = pending.remove(next_write_id) {
        corpus::write_entries(writer, std::slice::from_ref(&ready.entry))?;
        *written += 1;
        *next_write_id += 1;
        if *written % 25 == 0 || *written == total {
            eprintln!("embedded {}/{} grants...", written, total);
        }
    }
    Ok(())
}

fn worker_loop(
    worker_id: usize,
    receiver: Receiver<BuildTask>,
    sender: Sender<BuildResult>,
    memo_tx: Sender<ValueMemo>,
    embedder: OpenAiEmbedder,
    tag_cache: Option<Arc<TagCache>>,
) {
    let mut memo = ValueMemo::new();
    for task in receiver.iter() {
        let result = corpus::build_entry_memoized(
            task.id,
            &task.record,
            &embedder,
            tag_cache.as_deref(),
            &mut memo,
        )
        .map(|(entry, skipped)| BuiltRecord { entry, skipped })
        .map_err(|err| anyhow!("worker {} failed grant {}: {}", worker_id, task.id, err));
        if sender.send(result).is_err() {
            break;
        }
    }
    let _ = memo_tx.send(memo);
}

fn load_grants(path: &PathBuf) -> Result<Vec<Value>> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    if raw.trim_start().starts_with('[') {
        let grants: Vec<Value> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid grants array in {:?}", path))?;
        return Ok(grants);
    }
    let mut grants = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: Value = serde_json::from_str(line)
            .with_context(|| format!("invalid grant record at line {}", line_no + 1))?;
        grants.push(record);
    }
    Ok(grants)
}

fn write_tag_cache(path: &PathBuf, memo: &ValueMemo) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
    serde_json::to_writer_pretty(BufWriter::new(file), memo)
        .context("failed to write tag cache")?;
    Ok(())
}
