//! Shadow-table interface to the host storage engine.
//!
//! The engine persists everything through five named shadow tables owned by
//! the host: `content` (raw row text), `segments` (b-tree node blobs keyed
//! by block id), `segdir` (one row per segment), `docsize` (per-document
//! token counts) and `stat` (global totals, merge hint, automerge setting).
//! [`IndexStore`] models that contract as typed operations; [`MemoryStore`]
//! stands in for the host engine in tests.
//!
//! Concurrency follows the host's single-writer model: at most one writer
//! transaction touches the index at a time, enforced by the surrounding
//! engine. The store is the only blocking seam in the crate.

use std::collections::BTreeMap;
use std::fmt::Debug;

use parking_lot::RwLock;

use crate::error::{Result, SedgeError};

/// Stat-table row id holding global totals (doc count, per-column sums).
pub const STAT_GLOBALS: i64 = 0;

/// Stat-table row id holding the incremental-merge resumption hint.
pub const STAT_INCRMERGE_HINT: i64 = 1;

/// Stat-table row id holding the automerge setting.
pub const STAT_AUTOMERGE: i64 = 2;

/// One row of the `segdir` shadow table: the identity and block layout of a
/// single segment.
///
/// `leaf_bytes` carries the leaf-data byte size the original system folds
/// into the `end_block` column as `"<blockid> <negSizeHint>"` text; it feeds
/// the promotion heuristics and is 0 when unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegdirEntry {
    /// Absolute level: language id, index number and relative level packed
    /// into one integer.
    pub level: i64,
    /// Position of the segment within its level; higher idx is newer.
    pub idx: i32,
    /// First leaf block id, or 0 when the whole segment is inline in `root`.
    pub start_block: i64,
    /// Last leaf block id, or 0 for an inline segment.
    pub leaves_end_block: i64,
    /// Last block id reserved for this segment (interior nodes live in
    /// `(leaves_end_block, end_block]`).
    pub end_block: i64,
    /// Leaf-data byte size hint.
    pub leaf_bytes: i64,
    /// Root node blob (leaf or interior, whichever the writer ended with).
    pub root: Vec<u8>,
}

/// One row of the `content` shadow table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRow {
    pub docid: i64,
    pub langid: i64,
    pub columns: Vec<String>,
}

/// Typed operations over the five shadow tables.
///
/// Implementations translate these calls into reads and writes against the
/// host's row storage. All mutation happens inside the host's transaction;
/// a locked table surfaces as [`SedgeError::Busy`].
pub trait IndexStore: Send + Sync + Debug {
    // -- content ----------------------------------------------------------

    /// Insert or replace a content row.
    fn content_put(&self, row: &ContentRow) -> Result<()>;

    /// Fetch a content row by docid.
    fn content_get(&self, docid: i64) -> Result<Option<ContentRow>>;

    /// Delete a content row.
    fn content_delete(&self, docid: i64) -> Result<()>;

    /// All docids in the content table, in ascending rowid order.
    fn content_docids(&self) -> Result<Vec<i64>>;

    // -- segments (block store) -------------------------------------------

    /// Write a node blob at `block_id`, replacing any existing row.
    fn block_put(&self, block_id: i64, data: &[u8]) -> Result<()>;

    /// Write a NULL blob at `block_id` (the appendable-segment sentinel).
    fn block_put_null(&self, block_id: i64) -> Result<()>;

    /// Read the whole blob at `block_id`. A missing row or a NULL blob is a
    /// corruption error: segdir pointed at a block that is not there.
    fn block_get(&self, block_id: i64) -> Result<Vec<u8>>;

    /// Size in bytes of the blob at `block_id`.
    fn block_size(&self, block_id: i64) -> Result<usize>;

    /// Read `out.len()` bytes starting at `offset` within the blob at
    /// `block_id`. Supports chunked loading of large nodes.
    fn block_read(&self, block_id: i64, offset: usize, out: &mut [u8]) -> Result<()>;

    /// True if a row exists at `block_id` and its blob is NULL.
    fn block_is_null(&self, block_id: i64) -> Result<bool>;

    /// Delete every block row with id in `[first, last]`.
    fn block_delete_range(&self, first: i64, last: i64) -> Result<()>;

    // -- segdir ------------------------------------------------------------

    /// Insert or replace the segdir row keyed by `(level, idx)`.
    fn segdir_put(&self, entry: &SegdirEntry) -> Result<()>;

    /// Fetch one segdir row.
    fn segdir_get(&self, level: i64, idx: i32) -> Result<Option<SegdirEntry>>;

    /// All segdir rows at `level`, ordered by idx ascending.
    fn segdir_level(&self, level: i64) -> Result<Vec<SegdirEntry>>;

    /// All segdir rows with level in `[min_level, max_level]`, ordered by
    /// level then idx ascending.
    fn segdir_range(&self, min_level: i64, max_level: i64) -> Result<Vec<SegdirEntry>>;

    /// Delete one segdir row.
    fn segdir_delete(&self, level: i64, idx: i32) -> Result<()>;

    /// Largest idx in use at `level`.
    fn segdir_max_idx(&self, level: i64) -> Result<Option<i32>>;

    /// Largest `end_block` over all segdir rows; 0 when the index is empty.
    /// New segments allocate blocks above this.
    fn segdir_max_block(&self) -> Result<i64>;

    /// Every segdir row, ordered by level then idx.
    fn segdir_all(&self) -> Result<Vec<SegdirEntry>>;

    // -- docsize -----------------------------------------------------------

    /// Write the varint-array blob of per-column token counts for a docid.
    fn docsize_put(&self, docid: i64, blob: &[u8]) -> Result<()>;

    /// Read a docsize blob.
    fn docsize_get(&self, docid: i64) -> Result<Option<Vec<u8>>>;

    /// Delete a docsize row.
    fn docsize_delete(&self, docid: i64) -> Result<()>;

    // -- stat --------------------------------------------------------------

    /// Write a stat blob.
    fn stat_put(&self, id: i64, blob: &[u8]) -> Result<()>;

    /// Read a stat blob.
    fn stat_get(&self, id: i64) -> Result<Option<Vec<u8>>>;

    /// Delete a stat row.
    fn stat_delete(&self, id: i64) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryTables {
    content: BTreeMap<i64, ContentRow>,
    blocks: BTreeMap<i64, Option<Vec<u8>>>,
    segdir: BTreeMap<(i64, i32), SegdirEntry>,
    docsize: BTreeMap<i64, Vec<u8>>,
    stat: BTreeMap<i64, Vec<u8>>,
}

/// In-memory [`IndexStore`] standing in for the host engine.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<MemoryTables>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Number of live block rows, including NULL sentinels. Test helper.
    pub fn block_count(&self) -> usize {
        self.tables.read().blocks.len()
    }

    /// Overwrite one byte of a stored block. Test helper for corruption
    /// scenarios.
    pub fn corrupt_block(&self, block_id: i64, offset: usize, value: u8) -> Result<()> {
        let mut tables = self.tables.write();
        match tables.blocks.get_mut(&block_id) {
            Some(Some(data)) if offset < data.len() => {
                data[offset] = value;
                Ok(())
            }
            _ => Err(SedgeError::storage("no such block byte")),
        }
    }
}

impl IndexStore for MemoryStore {
    fn content_put(&self, row: &ContentRow) -> Result<()> {
        self.tables.write().content.insert(row.docid, row.clone());
        Ok(())
    }

    fn content_get(&self, docid: i64) -> Result<Option<ContentRow>> {
        Ok(self.tables.read().content.get(&docid).cloned())
    }

    fn content_delete(&self, docid: i64) -> Result<()> {
        self.tables.write().content.remove(&docid);
        Ok(())
    }

    fn content_docids(&self) -> Result<Vec<i64>> {
        Ok(self.tables.read().content.keys().copied().collect())
    }

    fn block_put(&self, block_id: i64, data: &[u8]) -> Result<()> {
        self.tables
            .write()
            .blocks
            .insert(block_id, Some(data.to_vec()));
        Ok(())
    }

    fn block_put_null(&self, block_id: i64) -> Result<()> {
        self.tables.write().blocks.insert(block_id, None);
        Ok(())
    }

    fn block_get(&self, block_id: i64) -> Result<Vec<u8>> {
        match self.tables.read().blocks.get(&block_id) {
            Some(Some(data)) => Ok(data.clone()),
            _ => Err(SedgeError::corrupt(format!("missing block {block_id}"))),
        }
    }

    fn block_size(&self, block_id: i64) -> Result<usize> {
        match self.tables.read().blocks.get(&block_id) {
            Some(Some(data)) => Ok(data.len()),
            _ => Err(SedgeError::corrupt(format!("missing block {block_id}"))),
        }
    }

    fn block_read(&self, block_id: i64, offset: usize, out: &mut [u8]) -> Result<()> {
        let tables = self.tables.read();
        match tables.blocks.get(&block_id) {
            Some(Some(data)) if offset + out.len() <= data.len() => {
                out.copy_from_slice(&data[offset..offset + out.len()]);
                Ok(())
            }
            Some(Some(_)) => Err(SedgeError::corrupt("block read past end")),
            _ => Err(SedgeError::corrupt(format!("missing block {block_id}"))),
        }
    }

    fn block_is_null(&self, block_id: i64) -> Result<bool> {
        Ok(matches!(
            self.tables.read().blocks.get(&block_id),
            Some(None)
        ))
    }

    fn block_delete_range(&self, first: i64, last: i64) -> Result<()> {
        if first > last {
            return Ok(());
        }
        let mut tables = self.tables.write();
        let doomed: Vec<i64> = tables
            .blocks
            .range(first..=last)
            .map(|(&id, _)| id)
            .collect();
        for id in doomed {
            tables.blocks.remove(&id);
        }
        Ok(())
    }

    fn segdir_put(&self, entry: &SegdirEntry) -> Result<()> {
        self.tables
            .write()
            .segdir
            .insert((entry.level, entry.idx), entry.clone());
        Ok(())
    }

    fn segdir_get(&self, level: i64, idx: i32) -> Result<Option<SegdirEntry>> {
        Ok(self.tables.read().segdir.get(&(level, idx)).cloned())
    }

    fn segdir_level(&self, level: i64) -> Result<Vec<SegdirEntry>> {
        Ok(self
            .tables
            .read()
            .segdir
            .range((level, i32::MIN)..=(level, i32::MAX))
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    fn segdir_range(&self, min_level: i64, max_level: i64) -> Result<Vec<SegdirEntry>> {
        Ok(self
            .tables
            .read()
            .segdir
            .range((min_level, i32::MIN)..=(max_level, i32::MAX))
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    fn segdir_delete(&self, level: i64, idx: i32) -> Result<()> {
        self.tables.write().segdir.remove(&(level, idx));
        Ok(())
    }

    fn segdir_max_idx(&self, level: i64) -> Result<Option<i32>> {
        Ok(self
            .tables
            .read()
            .segdir
            .range((level, i32::MIN)..=(level, i32::MAX))
            .map(|(&(_, idx), _)| idx)
            .max())
    }

    fn segdir_max_block(&self) -> Result<i64> {
        Ok(self
            .tables
            .read()
            .segdir
            .values()
            .map(|entry| entry.end_block)
            .max()
            .unwrap_or(0))
    }

    fn segdir_all(&self) -> Result<Vec<SegdirEntry>> {
        Ok(self.tables.read().segdir.values().cloned().collect())
    }

    fn docsize_put(&self, docid: i64, blob: &[u8]) -> Result<()> {
        self.tables.write().docsize.insert(docid, blob.to_vec());
        Ok(())
    }

    fn docsize_get(&self, docid: i64) -> Result<Option<Vec<u8>>> {
        Ok(self.tables.read().docsize.get(&docid).cloned())
    }

    fn docsize_delete(&self, docid: i64) -> Result<()> {
        self.tables.write().docsize.remove(&docid);
        Ok(())
    }

    fn stat_put(&self, id: i64, blob: &[u8]) -> Result<()> {
        self.tables.write().stat.insert(id, blob.to_vec());
        Ok(())
    }

    fn stat_get(&self, id: i64) -> Result<Option<Vec<u8>>> {
        Ok(self.tables.read().stat.get(&id).cloned())
    }

    fn stat_delete(&self, id: i64) -> Result<()> {
        self.tables.write().stat.remove(&id);
        Ok(())
    }
}
