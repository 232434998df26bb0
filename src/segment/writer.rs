//! Segment b-tree writer.
//!
//! Builds one immutable segment bottom-up: leaf nodes are written to the
//! block store as they fill, interior nodes are buffered in memory and
//! written after the last leaf so that the leaf range stays contiguous.
//! Terms must arrive in strictly increasing order; a violation is reported
//! as corruption, never silently reordered.

use crate::error::{Result, SedgeError};
use crate::segment::separator;
use crate::store::{IndexStore, SegdirEntry};
use crate::varint::{put_u64, varint_len};

/// Bytes reserved for an interior node's height and leftmost-child header
/// when budgeting its body against the node size.
const INTERIOR_HEADER_RESERVE: usize = 12;

/// Builder for one leaf node. The buffer always starts with the height
/// varint (0) so it can be stored as-is.
#[derive(Debug)]
struct LeafBuilder {
    buf: Vec<u8>,
    last_term: Vec<u8>,
    n_terms: usize,
}

impl LeafBuilder {
    fn new() -> Self {
        LeafBuilder {
            buf: vec![0],
            last_term: Vec::new(),
            n_terms: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.n_terms == 0
    }

    /// Encoded size of the record `term` would append.
    fn entry_size(&self, term: &[u8], doclist_len: usize) -> usize {
        let tail = varint_len(doclist_len as u64) + doclist_len;
        if self.n_terms == 0 {
            varint_len(term.len() as u64) + term.len() + tail
        } else {
            let prefix = crate::segment::shared_prefix(&self.last_term, term);
            let suffix = term.len() - prefix;
            varint_len(prefix as u64) + varint_len(suffix as u64) + suffix + tail
        }
    }

    fn add(&mut self, term: &[u8], doclist: &[u8]) {
        if self.n_terms == 0 {
            put_u64(&mut self.buf, term.len() as u64);
            self.buf.extend_from_slice(term);
        } else {
            let prefix = crate::segment::shared_prefix(&self.last_term, term);
            put_u64(&mut self.buf, prefix as u64);
            put_u64(&mut self.buf, (term.len() - prefix) as u64);
            self.buf.extend_from_slice(&term[prefix..]);
        }
        put_u64(&mut self.buf, doclist.len() as u64);
        self.buf.extend_from_slice(doclist);
        self.last_term.clear();
        self.last_term.extend_from_slice(term);
        self.n_terms += 1;
    }
}

/// A completed interior node awaiting its block id.
#[derive(Debug)]
struct InteriorNode {
    /// Index of the node's leftmost child within the child level.
    first_child: usize,
    /// Separator records, without the height/leftmost header.
    body: Vec<u8>,
}

/// Builder for the interior nodes of one tree height.
#[derive(Debug)]
struct InteriorBuilder {
    flushed: Vec<InteriorNode>,
    body: Vec<u8>,
    last_term: Vec<u8>,
    first_child: usize,
    n_separators: usize,
}

impl InteriorBuilder {
    fn new(first_child: usize) -> Self {
        InteriorBuilder {
            flushed: Vec::new(),
            body: Vec::new(),
            last_term: Vec::new(),
            first_child,
            n_separators: 0,
        }
    }

    fn entry_size(&self, term: &[u8]) -> usize {
        if self.n_separators == 0 {
            varint_len(term.len() as u64) + term.len()
        } else {
            let prefix = crate::segment::shared_prefix(&self.last_term, term);
            let suffix = term.len() - prefix;
            varint_len(prefix as u64) + varint_len(suffix as u64) + suffix
        }
    }

    fn add(&mut self, term: &[u8]) {
        if self.n_separators == 0 {
            put_u64(&mut self.body, term.len() as u64);
            self.body.extend_from_slice(term);
        } else {
            let prefix = crate::segment::shared_prefix(&self.last_term, term);
            put_u64(&mut self.body, prefix as u64);
            put_u64(&mut self.body, (term.len() - prefix) as u64);
            self.body.extend_from_slice(&term[prefix..]);
        }
        self.last_term.clear();
        self.last_term.extend_from_slice(term);
        self.n_separators += 1;
    }
}

fn interior_header(height: usize, leftmost_child: i64) -> Vec<u8> {
    let mut header = Vec::with_capacity(INTERIOR_HEADER_RESERVE);
    put_u64(&mut header, height as u64);
    put_u64(&mut header, leftmost_child as u64);
    header
}

/// Writes one segment b-tree in term order.
#[derive(Debug)]
pub struct SegmentWriter<'a> {
    store: &'a dyn IndexStore,
    node_size: usize,
    first_block: i64,
    leaf: LeafBuilder,
    leaf_count: i64,
    interiors: Vec<InteriorBuilder>,
    leaf_bytes: i64,
    last_term: Vec<u8>,
}

impl<'a> SegmentWriter<'a> {
    /// Create a writer whose first leaf will land just past the highest
    /// block currently referenced by segdir.
    pub fn new(store: &'a dyn IndexStore, node_size: usize) -> Result<Self> {
        let first_block = store.segdir_max_block()? + 1;
        Ok(SegmentWriter {
            store,
            node_size,
            first_block,
            leaf: LeafBuilder::new(),
            leaf_count: 0,
            interiors: Vec::new(),
            leaf_bytes: 0,
            last_term: Vec::new(),
        })
    }

    /// True if no term has been added.
    pub fn is_empty(&self) -> bool {
        self.leaf.is_empty() && self.leaf_count == 0
    }

    /// Append one `(term, doclist)` record. Terms must strictly increase.
    pub fn add(&mut self, term: &[u8], doclist: &[u8]) -> Result<()> {
        if !self.is_empty() && term <= self.last_term.as_slice() {
            return Err(SedgeError::corrupt("segment writer terms out of order"));
        }

        if !self.leaf.is_empty()
            && self.leaf.buf.len() + self.leaf.entry_size(term, doclist.len()) > self.node_size
        {
            self.flush_leaf(term)?;
        }
        self.leaf.add(term, doclist);
        self.last_term.clear();
        self.last_term.extend_from_slice(term);
        Ok(())
    }

    /// Write the current leaf and push the shortest separator between its
    /// last term and `next_term` into the interior tree.
    fn flush_leaf(&mut self, next_term: &[u8]) -> Result<()> {
        let block_id = self.first_block + self.leaf_count;
        self.store.block_put(block_id, &self.leaf.buf)?;
        self.leaf_bytes += self.leaf.buf.len() as i64;
        self.leaf_count += 1;

        let sep = separator(&self.leaf.last_term, next_term);
        let new_child = self.leaf_count as usize;
        self.leaf = LeafBuilder::new();
        self.push_separator(1, sep, new_child)
    }

    /// Insert a separator at `height`, splitting interior nodes upward as
    /// they fill. `new_child` is the child-level index of the node the
    /// separator introduces.
    fn push_separator(&mut self, height: usize, sep: Vec<u8>, mut new_child: usize) -> Result<()> {
        let mut height = height;
        loop {
            if self.interiors.len() < height {
                self.interiors.push(InteriorBuilder::new(new_child - 1));
            }
            let node_size = self.node_size;
            let builder = &mut self.interiors[height - 1];

            let fits = builder.n_separators == 0
                || builder.body.len() + builder.entry_size(&sep) + INTERIOR_HEADER_RESERVE
                    <= node_size;
            if fits {
                builder.add(&sep);
                return Ok(());
            }

            // Close the current node; the separator that caused the split
            // becomes the parent's separator and is not stored here.
            let node = InteriorNode {
                first_child: builder.first_child,
                body: std::mem::take(&mut builder.body),
            };
            builder.flushed.push(node);
            builder.last_term.clear();
            builder.n_separators = 0;
            builder.first_child = new_child;

            new_child = builder.flushed.len();
            height += 1;
        }
    }

    /// Finish the segment and return its segdir row (level and idx filled
    /// in by the caller's allocation). Returns `None` when nothing was
    /// added. The row is not persisted here; an aborted merge simply drops
    /// the writer and leaves any flushed blocks unreferenced.
    pub fn finish(mut self, level: i64, idx: i32) -> Result<Option<SegdirEntry>> {
        if self.is_empty() {
            return Ok(None);
        }

        if self.interiors.is_empty() {
            // The whole segment fits in a single leaf: store it inline in
            // the segdir row with an empty block range.
            self.leaf_bytes += self.leaf.buf.len() as i64;
            return Ok(Some(SegdirEntry {
                level,
                idx,
                start_block: 0,
                leaves_end_block: 0,
                end_block: 0,
                leaf_bytes: self.leaf_bytes,
                root: self.leaf.buf,
            }));
        }

        // Final leaf needs no separator: nothing follows it.
        let block_id = self.first_block + self.leaf_count;
        self.store.block_put(block_id, &self.leaf.buf)?;
        self.leaf_bytes += self.leaf.buf.len() as i64;
        self.leaf_count += 1;

        let leaves_end_block = self.first_block + self.leaf_count - 1;
        let mut child_base = self.first_block;
        let mut next_block = leaves_end_block + 1;
        let mut root = Vec::new();

        let top = self.interiors.len();
        for (h, builder) in self.interiors.iter().enumerate() {
            let height = h + 1;
            if height == top {
                // The top builder never split, so its current node spans
                // every child and becomes the root.
                debug_assert!(builder.flushed.is_empty());
                root = interior_header(height, child_base + builder.first_child as i64);
                root.extend_from_slice(&builder.body);
            } else {
                let base_this = next_block;
                for node in &builder.flushed {
                    let mut bytes =
                        interior_header(height, child_base + node.first_child as i64);
                    bytes.extend_from_slice(&node.body);
                    self.store.block_put(next_block, &bytes)?;
                    next_block += 1;
                }
                let mut bytes =
                    interior_header(height, child_base + builder.first_child as i64);
                bytes.extend_from_slice(&builder.body);
                self.store.block_put(next_block, &bytes)?;
                next_block += 1;
                child_base = base_this;
            }
        }

        Ok(Some(SegdirEntry {
            level,
            idx,
            start_block: self.first_block,
            leaves_end_block,
            end_block: next_block - 1,
            leaf_bytes: self.leaf_bytes,
            root,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_single_leaf_stays_inline() {
        let store = MemoryStore::new();
        let mut writer = SegmentWriter::new(&store, 512).unwrap();
        writer.add(b"fox", &[2, 0]).unwrap();
        writer.add(b"quick", &[4, 0]).unwrap();

        let entry = writer.finish(0, 0).unwrap().unwrap();
        assert_eq!(entry.start_block, 0);
        assert_eq!(entry.end_block, 0);
        assert!(!entry.root.is_empty());
        assert_eq!(entry.root[0], 0); // leaf height
        assert_eq!(store.block_count(), 0);
    }

    #[test]
    fn test_empty_writer_yields_no_segment() {
        let store = MemoryStore::new();
        let writer = SegmentWriter::new(&store, 512).unwrap();
        assert!(writer.finish(0, 0).unwrap().is_none());
    }

    #[test]
    fn test_out_of_order_terms_rejected() {
        let store = MemoryStore::new();
        let mut writer = SegmentWriter::new(&store, 512).unwrap();
        writer.add(b"quick", &[2, 0]).unwrap();
        assert!(writer.add(b"quick", &[2, 0]).is_err());
        assert!(writer.add(b"fox", &[2, 0]).is_err());
    }

    #[test]
    fn test_multi_leaf_layout() {
        let store = MemoryStore::new();
        // Tiny nodes force leaf flushes and an interior root.
        let mut writer = SegmentWriter::new(&store, 48).unwrap();
        for i in 0..40 {
            let term = format!("term{i:04}");
            writer.add(term.as_bytes(), &[2, 0]).unwrap();
        }

        let entry = writer.finish(0, 0).unwrap().unwrap();
        assert!(entry.start_block >= 1);
        assert!(entry.leaves_end_block > entry.start_block);
        assert!(entry.end_block >= entry.leaves_end_block);
        assert!(entry.leaf_bytes > 0);

        // Root is an interior node.
        let (height, _) = crate::segment::node_height(&entry.root).unwrap();
        assert!(height >= 1);

        // Every leaf block exists and is a leaf.
        for id in entry.start_block..=entry.leaves_end_block {
            let block = store.block_get(id).unwrap();
            assert_eq!(block[0], 0);
        }
    }

    #[test]
    fn test_blocks_allocated_past_existing_segments() {
        let store = MemoryStore::new();
        store
            .segdir_put(&SegdirEntry {
                level: 0,
                idx: 0,
                start_block: 1,
                leaves_end_block: 9,
                end_block: 10,
                leaf_bytes: 0,
                root: vec![0],
            })
            .unwrap();

        let mut writer = SegmentWriter::new(&store, 48).unwrap();
        for i in 0..20 {
            let term = format!("word{i:04}");
            writer.add(term.as_bytes(), &[2, 0]).unwrap();
        }
        let entry = writer.finish(0, 1).unwrap().unwrap();
        assert!(entry.start_block >= 11);
    }
}
