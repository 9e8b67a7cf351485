#![warn(missing_docs)]
//! Core library for the grantmatch engine: weighted per-field embeddings
//! compared against a precomputed grant corpus.

pub mod corpus;
pub mod embedder;
pub mod fields;
pub mod matcher;
pub mod profile;
pub mod vector;

pub use corpus::{CorpusEntry, GrantCorpus};
pub use embedder::{OpenAiConfig, OpenAiEmbedder, TextEmbedder};
pub use fields::{field_weight, weighted_field_names, FieldRecord, FieldValue};
pub use matcher::{find_top_matches, flexible_similarity, MatchResult, DEFAULT_TOP_K};
pub use profile::{embed_fields, BlankPolicy, FieldEmbeddings, TagCache, BLANK_SENTINEL};

#[cfg(feature = "debug_logs")]
#[macro_export]
// This allows use of the `eprintln!` macro via the `debug_log!` macro.
macro_rules! debug_log {
        ($($arg:tt)*) => {
            eprintln!($($arg)*);
        };
    }
#[cfg(not(feature = "debug_logs"))]
#[macro_export]
// This effectively disables the `eprintln!` macro, effectively removing it from the code during
// compilation.
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}
