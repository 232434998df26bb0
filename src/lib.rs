//! # Sedge
//!
//! A segmented, disk-resident inverted-index full-text search engine.
//!
//! Documents are tokenized into per-term doclists that accumulate in a
//! pending buffer and flush into immutable b-tree segments. Background
//! merges (full, optimize and bounded incremental) keep the segment count
//! in check, and a MATCH query language with phrase, NEAR, prefix and
//! boolean operators evaluates directly against the compressed postings.
//!
//! ## Features
//!
//! - Delta-compressed doclists with per-column position lists
//! - Prefix-compressed segment b-trees with inline single-leaf roots
//! - Incremental merge into appendable segments with resumption hints
//! - Pluggable tokenizers and storage backend
//! - Posting-checksum integrity verification

pub mod config;
pub mod doclist;
pub mod error;
pub mod eval;
pub mod expr;
pub mod index;
pub mod pending;
pub mod segment;
pub mod store;
pub mod tokenizer;
pub mod varint;

pub use config::IndexConfig;
pub use doclist::DocidOrder;
pub use error::{Result, SedgeError};
pub use eval::QueryCursor;
pub use index::TextIndex;
pub use store::{ContentRow, IndexStore, MemoryStore};
pub use tokenizer::{SimpleTokenizer, Tokenizer, TokenizerRegistry};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
