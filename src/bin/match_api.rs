use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use grantmatch::{
    embed_fields, find_top_matches, BlankPolicy, FieldRecord, GrantCorpus, MatchResult,
    OpenAiConfig, OpenAiEmbedder, TagCache, TextEmbedder,
};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Parser, Debug)]
#[command(
    name = "grantmatch-api",
    about = "HTTP API that ranks the grant corpus against a user's project fields"
)]
struct ApiCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "GRANTMATCH_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Corpus JSONL produced by grantmatch-embedder.
    #[arg(
        long,
        env = "GRANTMATCH_CORPUS",
        default_value = "grant_embeddings.jsonl"
    )]
    corpus: PathBuf,

    /// Optional precomputed tag cache (JSON object of string -> vector).
    #[arg(long, env = "GRANTMATCH_TAG_CACHE")]
    tag_cache: Option<PathBuf>,

    /// Default top-k when the client does not override it.
    #[arg(long, default_value_t = grantmatch::DEFAULT_TOP_K)]
    default_top_k: usize,

    /// Maximum top-k allowed per request.
    #[arg(long, default_value_t = 20)]
    max_top_k: usize,

    /// Max cached value embeddings kept in-memory (0 disables caching).
    #[arg(long, default_value_t = 1024)]
    embedding_cache_size: usize,

    /// API key for query embeddings.
    #[arg(long, env = "OPENAI_API_KEY")]
    openai_api_key: String,

    /// Embedding model identifier.
    #[arg(
        long,
        env = "GRANTMATCH_OPENAI_MODEL",
        default_value = "text-embedding-3-small"
    )]
    openai_model: String,

    /// Optional embedding dimension override.
    #[arg(long, env = "GRANTMATCH_OPENAI_DIMENSIONS")]
    openai_dimensions: Option<usize>,

    /// Base URL for OpenAI-compatible endpoints.
    #[arg(
        long,
        env = "GRANTMATCH_OPENAI_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    openai_base_url: String,

    /// Max inputs per embedding request.
    #[arg(long, env = "GRANTMATCH_OPENAI_BATCH", default_value_t = 32)]
    batch_size: usize,

    /// Seconds before embedding requests time out.
    #[arg(long, env = "GRANTMATCH_OPENAI_TIMEOUT_SECS", default_value_t = 30)]
    openai_timeout_secs: u64,

    /// Retry attempts for transient embedding errors.
    #[arg(long, env = "GRANTMATCH_OPENAI_MAX_RETRIES", default_value_t = 5)]
    max_retries: usize,
}

#[derive(Clone)]
struct AppState {
    corpus: Arc<GrantCorpus>,
    embedder: Arc<CachingEmbedder>,
    tag_cache: Option<Arc<TagCache>>,
    default_top_k: usize,
    max_top_k: usize,
}

#[derive(Debug, Deserialize)]
struct MatchRequest {
    /// Field name -> string or array of strings.
    fields: Map<String, Value>,
    #[serde(default)]
    top_k: Option<usize>,
    /// Caller-side cutoff; matches below it are dropped from the response.
    #[serde(default)]
    min_similarity: Option<f32>,
}

#[derive(Debug, Serialize)]
struct MatchResponse {
    matches: Vec<MatchResult>,
    meta: ResponseMeta,
}

#[derive(Debug, Serialize)]
struct ResponseMeta {
    top_k: usize,
    latency_ms: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    skipped_fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_similarity: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ApiCli::parse();
    let corpus = GrantCorpus::load(&cli.corpus)
        .with_context(|| format!("failed to load corpus {:?}", cli.corpus))?;
    anyhow::ensure!(
        !corpus.is_empty(),
        "corpus {:?} contains no entries",
        cli.corpus
    );
    eprintln!("loaded {} corpus entries from {:?}", corpus.len(), cli.corpus);

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

    let state = AppState {
        corpus: Arc::new(corpus),
        embedder: Arc::new(CachingEmbedder::new(embedder, cli.embedding_cache_size)),
        tag_cache,
        default_top_k: cli.default_top_k.max(1),
        max_top_k: cli.max_top_k.max(1),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/match", post(match_handler))
        .with_state(state);

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    println!("grantmatch-api listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn match_handler(
    State(state): State<AppState>,
    Json(request): Json<MatchRequest>,
) -> Result<Json<MatchResponse>, (StatusCode, Json<ErrorBody>)> {
    let (record, skipped) = FieldRecord::from_json_map(&request.fields);
    for field in &skipped {
        eprintln!("match request: skipping non-embeddable field {field:?}");
    }
    if record.is_empty() {
        return Err(bad_request("request contains no embeddable fields"));
    }
    let top_k = request
        .top_k
        .unwrap_or(state.default_top_k)
        .clamp(1, state.max_top_k);
    let start = Instant::now();

    let corpus = Arc::clone(&state.corpus);
    let embedder = Arc::clone(&state.embedder);
    let tag_cache = state.tag_cache.clone();
    let mut matches = tokio::task::spawn_blocking(move || {
        let embeddings = embed_fields(
            &record,
            embedder.as_ref(),
            tag_cache.as_deref(),
            BlankPolicy::Skip,
        )?;
        find_top_matches(&embeddings, &corpus, top_k)
    })
    .await
    .map_err(|err| internal_error(anyhow::anyhow!("match task join error: {err}")))?
    .map_err(internal_error)?;

    if let Some(cutoff) = request.min_similarity {
        matches.retain(|result| result.similarity >= cutoff);
    }

    let response = MatchResponse {
        matches,
        meta: ResponseMeta {
            top_k,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            skipped_fields: skipped,
            min_similarity: request.min_similarity,
        },
    };
    Ok(Json(response))
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

fn internal_error(err: anyhow::Error) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            message: err.to_string(),
        }),
    )
}

/// Wraps the provider client with an LRU cache keyed by exact value string.
///
/// Queries reuse a small closed vocabulary (ecosystems, topics, funding
/// types), so repeated requests mostly avoid the provider entirely.
struct CachingEmbedder {
    inner: OpenAiEmbedder,
    cache: Option<Mutex<LruCache<String, Vec<f32>>>>,
}

impl CachingEmbedder {
    fn new(inner: OpenAiEmbedder, cache_size: usize) -> Self {
        let cache = NonZeroUsize::new(cache_size).map(|capacity| Mutex::new(LruCache::new(capacity)));
        Self { inner, cache }
    }
}

impl TextEmbedder for CachingEmbedder {
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        let cache = match &self.cache {
            Some(cache) => cache,
            None => return self.inner.embed_batch(inputs),
        };
        let mut resolved: Vec<Option<Vec<f32>>> = vec![None; inputs.len()];
        let mut missing: Vec<usize> = Vec::new();
        {
            let mut guard = cache.lock().unwrap_or_else(PoisonError::into_inner);
            for (idx, input) in inputs.iter().enumerate() {
                match guard.get(*input) {
                    Some(hit) => resolved[idx] = Some(hit.clone()),
                    None => missing.push(idx),
                }
            }
        }
        if !missing.is_empty() {
            let fresh_inputs: Vec<&str> = missing.iter().map(|&idx| inputs[idx]).collect();
            let fresh = self.inner.embed_batch(&fresh_inputs)?;
            anyhow::ensure!(
                fresh.len() == fresh_inputs.len(),
                "provider returned {} embeddings for {} inputs",
                fresh.len(),
                fresh_inputs.len()
            );
            let mut guard = cache.lock().unwrap_or_else(PoisonError::into_inner);
            for (&idx, vector) in missing.iter().zip(fresh.into_iter()) {
                guard.put(inputs[idx].to_string(), vector.clone());
                resolved[idx] = Some(vector);
            }
        }
        resolved
            .into_iter()
            .map(|slot| slot.context("embedding cache resolution failed"))
            .collect()
    }

    fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }
}
