//! Segment b-tree reader.
//!
//! Navigates interior nodes to a leaf range and streams leaf entries in
//! term order. Leaf nodes are loaded incrementally in chunks so that one
//! oversized node never forces a single large read; the buffer refills as
//! the scan cursor approaches the unpopulated tail.

use std::fmt;
use std::sync::Arc;

use crate::error::{Result, SedgeError};
use crate::segment::cursor::TermCursor;
use crate::store::{IndexStore, SegdirEntry};
use crate::varint::decode_u64;

/// Chunk size for incremental node loads.
const NODE_CHUNK: usize = 4096;

/// A node buffer that may be populated incrementally from the block store.
struct NodeBuf {
    data: Vec<u8>,
    total: usize,
    /// Block id to refill from; `None` once fully resident.
    source: Option<i64>,
}

impl NodeBuf {
    fn resident(data: Vec<u8>) -> Self {
        let total = data.len();
        NodeBuf {
            data,
            total,
            source: None,
        }
    }

    fn open(store: &dyn IndexStore, block_id: i64) -> Result<Self> {
        let total = store.block_size(block_id)?;
        let mut buf = NodeBuf {
            data: Vec::new(),
            total,
            source: Some(block_id),
        };
        buf.ensure(store, NODE_CHUNK.min(total))?;
        Ok(buf)
    }

    /// Make at least `upto` bytes resident.
    fn ensure(&mut self, store: &dyn IndexStore, upto: usize) -> Result<()> {
        if upto > self.total {
            return Err(SedgeError::corrupt("node record overruns block"));
        }
        let Some(block_id) = self.source else {
            return Ok(());
        };
        while self.data.len() < upto {
            let start = self.data.len();
            let end = (start + NODE_CHUNK).max(upto).min(self.total);
            let mut chunk = vec![0u8; end - start];
            store.block_read(block_id, start, &mut chunk)?;
            self.data.extend_from_slice(&chunk);
        }
        if self.data.len() >= self.total {
            self.source = None;
        }
        Ok(())
    }

    /// Decode a varint at `pos`, refilling as needed.
    fn varint(&mut self, store: &dyn IndexStore, pos: &mut usize) -> Result<u64> {
        loop {
            match decode_u64(&self.data[(*pos).min(self.data.len())..]) {
                Ok((value, n)) => {
                    *pos += n;
                    return Ok(value);
                }
                Err(_) if self.data.len() < self.total => {
                    let want = (self.data.len() + NODE_CHUNK).min(self.total);
                    self.ensure(store, want)?;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Term filter applied while streaming.
#[derive(Debug, Clone)]
enum Filter {
    /// Stream every entry.
    All,
    /// Stop after the single exact term.
    Exact(Vec<u8>),
    /// Stream terms sharing the prefix, stop past them.
    Prefix(Vec<u8>),
}

/// Streams the `(term, doclist)` entries of one on-disk segment.
pub struct SegmentReader {
    store: Arc<dyn IndexStore>,
    entry: SegdirEntry,
    age: u64,

    node: Option<NodeBuf>,
    pos: usize,
    /// Current leaf block, 0 while scanning an inline root.
    current_block: i64,
    /// Last leaf block of the active range.
    last_leaf: i64,
    entries_in_node: usize,
    term: Vec<u8>,
    doclist_start: usize,
    doclist_len: usize,
    filter: Filter,
    eof: bool,
}

impl fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentReader")
            .field("level", &self.entry.level)
            .field("idx", &self.entry.idx)
            .field("age", &self.age)
            .field("eof", &self.eof)
            .finish()
    }
}

impl SegmentReader {
    /// Create a reader over one segdir row. `age` orders readers within a
    /// multi-segment cursor: lower is newer.
    pub fn new(store: Arc<dyn IndexStore>, entry: SegdirEntry, age: u64) -> Self {
        SegmentReader {
            store,
            entry,
            age,
            node: None,
            pos: 0,
            current_block: 0,
            last_leaf: 0,
            entries_in_node: 0,
            term: Vec::new(),
            doclist_start: 0,
            doclist_len: 0,
            filter: Filter::All,
            eof: false,
        }
    }

    /// Position at the first entry of the whole segment. Returns false for
    /// an empty segment.
    pub fn scan_all(&mut self) -> Result<bool> {
        self.filter = Filter::All;
        self.open_leaf_range(self.first_leaf_block(), self.entry.leaves_end_block)?;
        self.next()
    }

    /// Position at the first entry matching `term` (exactly, or by prefix).
    /// Returns false when nothing matches.
    pub fn seek(&mut self, term: &[u8], is_prefix: bool) -> Result<bool> {
        self.filter = if is_prefix {
            Filter::Prefix(term.to_vec())
        } else {
            Filter::Exact(term.to_vec())
        };

        if self.entry.start_block == 0 {
            // Whole segment inline in the root leaf.
            self.open_leaf_range(0, 0)?;
        } else {
            let (height, _) = crate::segment::node_height(&self.entry.root)?;
            if height == 0 {
                // Single-leaf segment with a block-resident leaf.
                self.open_leaf_range(self.entry.start_block, self.entry.start_block)?;
            } else {
                let first = self.descend(term, false)?;
                let last = if is_prefix { self.descend(term, true)? } else { first };
                self.open_leaf_range(first, last)?;
            }
        }
        self.next()
    }

    fn first_leaf_block(&self) -> i64 {
        if self.entry.start_block == 0 {
            0
        } else {
            self.entry.start_block
        }
    }

    /// Walk interior nodes to the leaf that may contain `term`. With
    /// `upper` set, pick the rightmost leaf that could still hold a term
    /// carrying `term` as a prefix.
    fn descend(&self, term: &[u8], upper: bool) -> Result<i64> {
        let mut node = self.entry.root.clone();
        loop {
            let mut pos = 0;
            let mut reader = crate::varint::ByteReader::new(&node);
            let height = reader.varint()?;
            if height == 0 {
                return Err(SedgeError::corrupt("leaf reached during interior descent"));
            }
            let leftmost = reader.varint()? as i64;
            pos += reader.offset();

            // Scan separators: child index = number of separators the term
            // belongs to the right of.
            let mut child = 0i64;
            let mut prev: Vec<u8> = Vec::new();
            let mut first = true;
            let mut cursor = crate::varint::ByteReader::new(&node[pos..]);
            while !cursor.is_empty() {
                let sep = if first {
                    first = false;
                    let len = cursor.varint()? as usize;
                    cursor.bytes(len)?.to_vec()
                } else {
                    let prefix = cursor.varint()? as usize;
                    let suffix = cursor.varint()? as usize;
                    if prefix > prev.len() {
                        return Err(SedgeError::corrupt("separator prefix overruns prior term"));
                    }
                    let mut sep = prev[..prefix].to_vec();
                    sep.extend_from_slice(cursor.bytes(suffix)?);
                    sep
                };

                let go_right = if upper {
                    sep.as_slice() <= term || sep.starts_with(term)
                } else {
                    // A term equal to a separator belongs to the right
                    // subtree.
                    sep.as_slice() <= term
                };
                if go_right {
                    child += 1;
                    prev = sep;
                } else {
                    break;
                }
            }

            let child_block = leftmost + child;
            if height == 1 {
                return Ok(child_block);
            }
            node = self.store.block_get(child_block)?;
        }
    }

    fn open_leaf_range(&mut self, first: i64, last: i64) -> Result<()> {
        self.current_block = first;
        self.last_leaf = last;
        self.eof = false;
        self.term.clear();
        self.entries_in_node = 0;
        self.load_current_leaf()
    }

    fn load_current_leaf(&mut self) -> Result<()> {
        let mut node = if self.current_block == 0 {
            NodeBuf::resident(self.entry.root.clone())
        } else {
            NodeBuf::open(self.store.as_ref(), self.current_block)?
        };
        let mut pos = 0;
        let height = node.varint(self.store.as_ref(), &mut pos)?;
        if height != 0 {
            return Err(SedgeError::corrupt("expected leaf node"));
        }
        self.pos = pos;
        self.entries_in_node = 0;
        self.node = Some(node);
        Ok(())
    }

    /// Advance to the next raw entry, crossing leaves by block adjacency.
    fn next_entry(&mut self) -> Result<bool> {
        loop {
            let store = self.store.clone();
            let node = self
                .node
                .as_mut()
                .ok_or_else(|| SedgeError::corrupt("reader not positioned"))?;

            if self.pos >= node.total {
                if self.current_block == 0 || self.current_block >= self.last_leaf {
                    return Ok(false);
                }
                self.current_block += 1;
                self.load_current_leaf()?;
                self.term.clear();
                continue;
            }

            let (prefix, suffix) = if self.entries_in_node == 0 {
                let len = node.varint(store.as_ref(), &mut self.pos)? as usize;
                (0, len)
            } else {
                let prefix = node.varint(store.as_ref(), &mut self.pos)? as usize;
                let suffix = node.varint(store.as_ref(), &mut self.pos)? as usize;
                (prefix, suffix)
            };
            if prefix > self.term.len() {
                return Err(SedgeError::corrupt("term prefix overruns prior term"));
            }

            node.ensure(store.as_ref(), self.pos + suffix)?;
            self.term.truncate(prefix);
            self.term
                .extend_from_slice(&node.data[self.pos..self.pos + suffix]);
            self.pos += suffix;

            let doclist_len = node.varint(store.as_ref(), &mut self.pos)? as usize;
            node.ensure(store.as_ref(), self.pos + doclist_len)?;
            self.doclist_start = self.pos;
            self.doclist_len = doclist_len;
            self.pos += doclist_len;
            self.entries_in_node += 1;
            return Ok(true);
        }
    }

    /// The doclist of the current entry.
    pub fn doclist_bytes(&self) -> &[u8] {
        match &self.node {
            Some(node) => &node.data[self.doclist_start..self.doclist_start + self.doclist_len],
            None => &[],
        }
    }

    /// The absolute level of the underlying segment.
    pub fn level(&self) -> i64 {
        self.entry.level
    }
}

impl TermCursor for SegmentReader {
    fn next(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        loop {
            if !self.next_entry()? {
                self.eof = true;
                return Ok(false);
            }
            match &self.filter {
                Filter::All => return Ok(true),
                Filter::Exact(target) => {
                    if self.term.as_slice() < target.as_slice() {
                        continue; // skip leading entries on the seek leaf
                    }
                    if self.term.as_slice() == target.as_slice() {
                        return Ok(true);
                    }
                    self.eof = true;
                    return Ok(false);
                }
                Filter::Prefix(target) => {
                    if self.term.as_slice() < target.as_slice() {
                        continue;
                    }
                    if self.term.starts_with(target) {
                        return Ok(true);
                    }
                    self.eof = true;
                    return Ok(false);
                }
            }
        }
    }

    fn term(&self) -> &[u8] {
        &self.term
    }

    fn doclist(&self) -> &[u8] {
        self.doclist_bytes()
    }

    fn age(&self) -> u64 {
        self.age
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doclist::{DocidOrder, DoclistWriter, PoslistWriter};
    use crate::segment::writer::SegmentWriter;
    use crate::store::MemoryStore;

    fn doclist_for(docid: i64, positions: &[u64]) -> Vec<u8> {
        let mut poslist = PoslistWriter::new();
        for &p in positions {
            poslist.add(0, p).unwrap();
        }
        let mut writer = DoclistWriter::new(DocidOrder::Asc);
        writer.push(docid, &poslist.into_bytes()).unwrap();
        writer.into_bytes()
    }

    fn build_segment(store: &MemoryStore, node_size: usize, terms: &[&str]) -> SegdirEntry {
        let mut writer = SegmentWriter::new(store, node_size).unwrap();
        for (i, term) in terms.iter().enumerate() {
            writer
                .add(term.as_bytes(), &doclist_for(i as i64 + 1, &[0]))
                .unwrap();
        }
        writer.finish(0, 0).unwrap().unwrap()
    }

    #[test]
    fn test_scan_inline_segment() {
        let store = MemoryStore::new();
        let entry = build_segment(&store, 1024, &["fox", "lazy", "quick"]);
        assert_eq!(entry.start_block, 0);

        let mut reader = SegmentReader::new(Arc::new(store), entry, 0);
        let mut terms = Vec::new();
        let mut more = reader.scan_all().unwrap();
        while more {
            terms.push(String::from_utf8(reader.term().to_vec()).unwrap());
            more = reader.next().unwrap();
        }
        assert_eq!(terms, vec!["fox", "lazy", "quick"]);
    }

    #[test]
    fn test_scan_multi_leaf_segment() {
        let store = MemoryStore::new();
        let terms: Vec<String> = (0..200).map(|i| format!("term{i:05}")).collect();
        let refs: Vec<&str> = terms.iter().map(|s| s.as_str()).collect();
        let entry = build_segment(&store, 64, &refs);
        assert!(entry.start_block > 0);

        let mut reader = SegmentReader::new(Arc::new(store), entry, 0);
        let mut seen = Vec::new();
        let mut more = reader.scan_all().unwrap();
        while more {
            seen.push(String::from_utf8(reader.term().to_vec()).unwrap());
            more = reader.next().unwrap();
        }
        assert_eq!(seen, terms);
    }

    #[test]
    fn test_exact_seek() {
        let store = MemoryStore::new();
        let terms: Vec<String> = (0..200).map(|i| format!("term{i:05}")).collect();
        let refs: Vec<&str> = terms.iter().map(|s| s.as_str()).collect();
        let entry = build_segment(&store, 64, &refs);
        let store = Arc::new(store);

        let mut reader = SegmentReader::new(store.clone(), entry.clone(), 0);
        assert!(reader.seek(b"term00123", false).unwrap());
        assert_eq!(reader.term(), b"term00123");
        // Exact cursors expose a single entry.
        assert!(!reader.next().unwrap());

        let mut reader = SegmentReader::new(store, entry, 0);
        assert!(!reader.seek(b"zebra", false).unwrap());
    }

    #[test]
    fn test_prefix_seek_spans_leaves() {
        let store = MemoryStore::new();
        let terms: Vec<String> = (0..300).map(|i| format!("w{i:05}")).collect();
        let refs: Vec<&str> = terms.iter().map(|s| s.as_str()).collect();
        let entry = build_segment(&store, 64, &refs);

        let mut reader = SegmentReader::new(Arc::new(store), entry, 0);
        let mut seen = Vec::new();
        let mut more = reader.seek(b"w0012", true).unwrap();
        while more {
            seen.push(String::from_utf8(reader.term().to_vec()).unwrap());
            more = reader.next().unwrap();
        }
        let expected: Vec<String> = (120..130).map(|i| format!("w{i:05}")).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_incremental_load_of_large_doclist() {
        let store = MemoryStore::new();
        // One term with a doclist far larger than the load chunk.
        let mut poslist = PoslistWriter::new();
        for p in 0..20_000u64 {
            poslist.add(0, p * 3).unwrap();
        }
        let mut doclist = DoclistWriter::new(DocidOrder::Asc);
        doclist.push(1, &poslist.into_bytes()).unwrap();
        let big = doclist.into_bytes();
        assert!(big.len() > NODE_CHUNK);

        let mut writer = SegmentWriter::new(&store, 512).unwrap();
        writer.add(b"aardvark", &doclist_for(1, &[0])).unwrap();
        writer.add(b"common", &big).unwrap();
        writer.add(b"zebra", &doclist_for(2, &[0])).unwrap();
        let entry = writer.finish(0, 0).unwrap().unwrap();

        let mut reader = SegmentReader::new(Arc::new(store), entry, 0);
        assert!(reader.seek(b"common", false).unwrap());
        assert_eq!(reader.doclist().len(), big.len());
        assert_eq!(reader.doclist(), big.as_slice());
    }

    #[test]
    fn test_corrupt_height_detected() {
        let store = MemoryStore::new();
        let entry = SegdirEntry {
            level: 0,
            idx: 0,
            start_block: 0,
            leaves_end_block: 0,
            end_block: 0,
            leaf_bytes: 0,
            root: vec![3, 1, 1], // claims height 3 with garbage
        };
        let mut reader = SegmentReader::new(Arc::new(store), entry, 0);
        assert!(reader.scan_all().is_err());
    }
}
