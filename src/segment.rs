//! On-disk segment b-trees.
//!
//! A segment is one immutable (or append-only) b-tree mapping terms to
//! doclists, identified by `(absolute level, idx)`. Leaf nodes hold
//! prefix-compressed `(term, doclist)` records; interior nodes hold
//! separator terms and implicit child block ids. Segments are created by a
//! pending-terms flush or by a merge, and destroyed or truncated when a
//! later merge consumes them.

pub mod cursor;
pub mod merge;
pub mod reader;
pub mod writer;

use crate::config::{IndexConfig, LEVEL_MAX};
use crate::error::{Result, SedgeError};
use crate::varint::decode_u64;

/// Compose an absolute level from language id, index number and relative
/// level. The absolute level orders segdir rows so that one `(langid,
/// index)` pair owns a contiguous run of `LEVEL_MAX` levels.
pub fn absolute_level(config: &IndexConfig, langid: i64, index: usize, level: i64) -> i64 {
    debug_assert!(level < LEVEL_MAX);
    (langid * config.index_count() as i64 + index as i64) * LEVEL_MAX + level
}

/// Decompose an absolute level into `(langid, index, relative level)`.
pub fn split_level(config: &IndexConfig, absolute: i64) -> (i64, usize, i64) {
    let relative = absolute % LEVEL_MAX;
    let slot = absolute / LEVEL_MAX;
    let index = (slot % config.index_count() as i64) as usize;
    let langid = slot / config.index_count() as i64;
    (langid, index, relative)
}

/// Lowest absolute level for `(langid, index)`.
pub fn base_level(config: &IndexConfig, langid: i64, index: usize) -> i64 {
    absolute_level(config, langid, index, 0)
}

/// Parse a node's height header. Height 0 is a leaf.
pub fn node_height(node: &[u8]) -> Result<(u64, usize)> {
    if node.is_empty() {
        return Err(SedgeError::corrupt("empty b-tree node"));
    }
    decode_u64(node)
}

/// Length of the shared byte prefix of two terms.
pub fn shared_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// The shortest separator that sorts after `prev` and not after `next`:
/// the shared prefix of the two, extended by one byte of `next`.
///
/// Interior-node seeks send terms equal to a separator into the right
/// subtree, so the separator may equal `next` when `next` is one byte
/// longer than the shared prefix.
pub fn separator(prev: &[u8], next: &[u8]) -> Vec<u8> {
    let n = shared_prefix(prev, next);
    next[..(n + 1).min(next.len())].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IndexConfig {
        IndexConfig::new(vec!["a", "b"]).with_prefixes(vec![3])
    }

    #[test]
    fn test_absolute_level_round_trip() {
        let config = config();
        for (langid, index, level) in [(0i64, 0usize, 0i64), (0, 1, 5), (2, 0, 3), (7, 1, 1023)] {
            let absolute = absolute_level(&config, langid, index, level);
            assert_eq!(split_level(&config, absolute), (langid, index, level));
        }
    }

    #[test]
    fn test_absolute_level_groups_by_index() {
        let config = config();
        // All levels of (0, main) sort below all levels of (0, prefix 3).
        let top_main = absolute_level(&config, 0, 0, LEVEL_MAX - 1);
        let base_prefix = absolute_level(&config, 0, 1, 0);
        assert!(top_main < base_prefix);
    }

    #[test]
    fn test_separator() {
        assert_eq!(separator(b"apple", b"apricot"), b"apr".to_vec());
        assert_eq!(separator(b"", b"fox"), b"f".to_vec());
        // next one byte longer than the shared prefix: separator == next,
        // legal because equal terms seek right.
        assert_eq!(separator(b"fox", b"foxe"), b"foxe".to_vec());
    }

    #[test]
    fn test_separator_orders() {
        let prev = b"quick".as_slice();
        let next = b"quiet".as_slice();
        let sep = separator(prev, next);
        assert!(sep.as_slice() > prev);
        assert!(sep.as_slice() <= next);
    }
}
