use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use grantmatch::{
    embed_fields, find_top_matches, BlankPolicy, FieldRecord, FieldValue, GrantCorpus,
    MatchResult, OpenAiConfig, OpenAiEmbedder, TagCache,
};

#[derive(Parser, Debug)]
#[command(
    name = "grantmatch-cli",
    about = "Rank the grant corpus against a project description given as flags"
)]
struct MatchCli {
    /// Corpus JSONL produced by grantmatch-embedder
    #[arg(
        long,
        env = "GRANTMATCH_CORPUS",
        default_value = "grant_embeddings.jsonl"
    )]
    corpus: PathBuf,

    /// Optional precomputed tag cache (JSON object of string -> vector)
    #[arg(long, env = "GRANTMATCH_TAG_CACHE")]
    tag_cache: Option<PathBuf>,

    /// Target ecosystem (repeat for several)
    #[arg(long)]
    ecosystem: Vec<String>,

    /// Funding topic / project category (repeat for several)
    #[arg(long = "funding-topic")]
    funding_topics: Vec<String>,

    /// Funding type sought (repeat for several)
    #[arg(long = "funding-type")]
    funding_types: Vec<String>,

    /// Free-text project description
    #[arg(long)]
    description: Option<String>,

    /// How much funding the project needs
    #[arg(long)]
    funding_amount: Option<String>,

    /// Number of matches to show
    #[arg(long, default_value_t = grantmatch::DEFAULT_TOP_K)]
    top_k: usize,

    /// Similarity below this counts as a weak match
    #[arg(long, default_value_t = 0.6)]
    min_similarity: f32,

    /// API key for query embeddings
    #[arg(long, env = "OPENAI_API_KEY")]
    openai_api_key: String,

    /// Embedding model identifier
    #[arg(
        long,
        env = "GRANTMATCH_OPENAI_MODEL",
        default_value = "text-embedding-3-small"
    )]
    openai_model: String,

    /// Optional embedding dimension override
    #[arg(long, env = "GRANTMATCH_OPENAI_DIMENSIONS")]
    openai_dimensions: Option<usize>,

    /// Base URL for OpenAI-compatible endpoints
    #[arg(
        long,
        env = "GRANTMATCH_OPENAI_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    openai_base_url: String,

    /// Max inputs per embedding request
    #[arg(long, env = "GRANTMATCH_OPENAI_BATCH", default_value_t = 32)]
    batch_size: usize,

    /// Seconds before embedding requests time out
    #[arg(long, env = "GRANTMATCH_OPENAI_TIMEOUT_SECS", default_value_t = 30)]
    openai_timeout_secs: u64,

    /// Retry attempts for transient embedding errors
    #[arg(long, env = "GRANTMATCH_OPENAI_MAX_RETRIES", default_value_t = 5)]
    max_retries: usize,
}

fn main() -> Result<()> {
    let cli = MatchCli::parse();
    let record = build_record(&cli);
    anyhow::ensure!(
        !record.is_empty(),
        "provide at least one field (--ecosystem, --funding-topic, --funding-type, --description, --funding-amount)"
    );

    let corpus = GrantCorpus::load(&cli.corpus)
        .with_context(|| format!("failed to load corpus {:?}", cli.corpus))?;
    let tag_cache = match &cli.tag_cache {
        Some(path) => Some(TagCache::load(path).context("failed to read tag cache")?),
        None => None,
    };
    let embedder = OpenAiEmbedder::new(OpenAiConfig {
        api_key: cli.openai_api_key.clone(),
        base_url: cli.openai_base_url.clone(),
        model: cli.openai_model.clone(),
        dimensions: cli.openai_dimensions,
        timeout: Duration::from_secs(cli.openai_timeout_secs.max(1)),
        max_retries: cli.max_retries.max(1),
        batch_size: cli.batch_size.max(1),
    })?;

    let embeddings = embed_fields(&record, &embedder, tag_cache.as_ref(), BlankPolicy::Skip)?;
    let matches = find_top_matches(&embeddings, &corpus, cli.top_k.max(1))?;

    render_matches(&matches, cli.min_similarity);
    Ok(())
}

fn build_record(cli: &MatchCli) -> FieldRecord {
    let mut record = FieldRecord::new();
    if !cli.ecosystem.is_empty() {
        record.insert("ecosystem", FieldValue::List(cli.ecosystem.clone()));
    }
    if !cli.funding_topics.is_empty() {
        record.insert("fundingTopics", FieldValue::List(cli.funding_topics.clone()));
    }
    if !cli.funding_types.is_empty() {
        record.insert("fundingType", FieldValue::List(cli.funding_types.clone()));
    }
    if let Some(description) = &cli.description {
        record.insert("description", FieldValue::Scalar(description.clone()));
    }
    if let Some(amount) = &cli.funding_amount {
        record.insert("totalFundingAvailable", FieldValue::Scalar(amount.clone()));
    }
    record
}

fn render_matches(matches: &[MatchResult], min_similarity: f32) {
    if matches.is_empty() {
        println!("corpus returned no entries to rank.");
        return;
    }
    let mut strong = 0usize;
    for (rank, result) in matches.iter().enumerate() {
        let weak = result.similarity < min_similarity;
        if !weak {
            strong += 1;
        }
        let marker = if weak { "  (weak)" } else { "" };
        println!(
            "{}. {:.3}  {}{}{}",
            rank + 1,
            result.similarity,
            result.name,
            website_suffix(result),
            marker
        );
    }
    if strong == 0 {
        println!(
            "\nno grants scored above the {:.2} similarity threshold; \
             consider adding more project detail.",
            min_similarity
        );
    }
}

fn website_suffix(result: &MatchResult) -> String {
    result
        .original
        .get("website")
        .and_then(|value| value.as_str())
        .map(|website| format!("  {}", website))
        .unwrap_or_default()
}
