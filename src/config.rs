//! Index configuration.

use serde::{Deserialize, Serialize};

use crate::doclist::DocidOrder;

/// Number of relative levels reserved per (language id, index number) pair
/// when composing absolute levels.
pub const LEVEL_MAX: i64 = 1024;

/// Number of same-level segments that triggers an automatic full merge.
pub const MERGE_COUNT: usize = 16;

/// Maximum b-tree height of an appendable segment; the incremental-merge
/// writer reserves one block layer per level up front.
pub const MAX_APPENDABLE_HEIGHT: i64 = 16;

/// Configuration for a [`TextIndex`](crate::index::TextIndex).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Names of the indexed columns, in column order.
    pub columns: Vec<String>,

    /// Configured prefix-index lengths in bytes; each gets its own segment
    /// space alongside the main terms index.
    pub prefixes: Vec<usize>,

    /// Registered name of the tokenizer to instantiate.
    pub tokenizer: String,

    /// Index-wide docid iteration order.
    pub order: DocidOrder,

    /// Target b-tree node size in bytes (page size minus bookkeeping).
    pub node_size: usize,

    /// Pending-terms byte estimate that forces a mid-transaction flush.
    pub pending_threshold: usize,

    /// Page size used to estimate deferred-token doclist cost in overflow
    /// pages.
    pub page_size: usize,

    /// Maximum parse depth for MATCH expressions.
    pub max_expr_depth: usize,
}

impl IndexConfig {
    /// Create a configuration for the given columns with default tuning.
    pub fn new<S: Into<String>>(columns: Vec<S>) -> Self {
        IndexConfig {
            columns: columns.into_iter().map(Into::into).collect(),
            prefixes: Vec::new(),
            tokenizer: "simple".to_string(),
            order: DocidOrder::Asc,
            node_size: 4096 - 35,
            pending_threshold: 1024 * 1024,
            page_size: 4096,
            max_expr_depth: 64,
        }
    }

    /// Add prefix-index lengths.
    pub fn with_prefixes(mut self, prefixes: Vec<usize>) -> Self {
        self.prefixes = prefixes;
        self
    }

    /// Set the docid iteration order.
    pub fn with_order(mut self, order: DocidOrder) -> Self {
        self.order = order;
        self
    }

    /// Number of indexes: the main terms index plus one per prefix length.
    pub fn index_count(&self) -> usize {
        self.prefixes.len() + 1
    }

    /// The index number serving exact terms of length `len`, if a dedicated
    /// prefix index exists (index 0 is the main index).
    pub fn prefix_index_for(&self, len: usize) -> Option<usize> {
        self.prefixes.iter().position(|&n| n == len).map(|i| i + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IndexConfig::new(vec!["body"]);
        assert_eq!(config.index_count(), 1);
        assert_eq!(config.node_size, 4061);
        assert_eq!(config.pending_threshold, 1024 * 1024);
    }

    #[test]
    fn test_prefix_index_lookup() {
        let config = IndexConfig::new(vec!["body"]).with_prefixes(vec![2, 4]);
        assert_eq!(config.index_count(), 3);
        assert_eq!(config.prefix_index_for(2), Some(1));
        assert_eq!(config.prefix_index_for(4), Some(2));
        assert_eq!(config.prefix_index_for(3), None);
    }
}
