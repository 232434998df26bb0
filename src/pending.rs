//! In-memory pending-terms buffer.
//!
//! Tokens produced while indexing documents accumulate here, one
//! incrementally encoded doclist per term per index, until a flush writes
//! them out as new level-0 segments. Deletes are buffered as tombstone
//! entries (a docid with an empty position list) that shadow older segment
//! data until a merge discards both.
//!
//! The buffer holds documents for a single language id at a time, and
//! docids must arrive in strict index order; the index layer flushes
//! before any write that would violate either rule.

use std::cmp::Ordering;

use ahash::AHashMap;

use crate::config::IndexConfig;
use crate::doclist::{DocidOrder, POS_COLUMN, POS_END};
use crate::error::{Result, SedgeError};
use crate::segment::cursor::TermCursor;
use crate::varint::put_u64;

/// One term's doclist under construction.
///
/// The buffer never carries the final position-list terminator; it is
/// appended when a later document begins or when the list is snapshotted.
#[derive(Debug)]
struct PendingList {
    buf: Vec<u8>,
    last_docid: i64,
    column: u64,
    position: u64,
    first_in_column: bool,
}

impl PendingList {
    fn new() -> Self {
        PendingList {
            buf: Vec::new(),
            last_docid: 0,
            column: 0,
            position: 0,
            first_in_column: true,
        }
    }

    fn begin_doc(&mut self, docid: i64, order: DocidOrder) -> Result<()> {
        if self.buf.is_empty() {
            put_u64(&mut self.buf, docid as u64);
        } else {
            if order.cmp(self.last_docid, docid) != Ordering::Less {
                return Err(SedgeError::corrupt("pending docids out of order"));
            }
            self.buf.push(POS_END as u8);
            match order {
                DocidOrder::Asc => put_u64(
                    &mut self.buf,
                    (docid as u64).wrapping_sub(self.last_docid as u64),
                ),
                DocidOrder::Desc => put_u64(
                    &mut self.buf,
                    (self.last_docid as u64).wrapping_sub(docid as u64),
                ),
            };
        }
        self.last_docid = docid;
        self.column = 0;
        self.position = 0;
        self.first_in_column = true;
        Ok(())
    }

    fn add_position(&mut self, column: u64, position: u64) -> Result<()> {
        if column != self.column {
            if column < self.column {
                return Err(SedgeError::corrupt("pending columns out of order"));
            }
            put_u64(&mut self.buf, POS_COLUMN);
            put_u64(&mut self.buf, column);
            self.column = column;
            self.position = 0;
            self.first_in_column = true;
        }
        if !self.first_in_column && position <= self.position {
            return Err(SedgeError::corrupt("pending positions out of order"));
        }
        put_u64(&mut self.buf, position - self.position + 2);
        self.position = position;
        self.first_in_column = false;
        Ok(())
    }

    /// The finished doclist: the working buffer plus the terminator of the
    /// open document.
    fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.buf.len() + 1);
        out.extend_from_slice(&self.buf);
        out.push(POS_END as u8);
        out
    }
}

/// Buffered postings for every index of one [`IndexConfig`].
#[derive(Debug)]
pub struct PendingTerms {
    order: DocidOrder,
    prefixes: Vec<usize>,
    /// One term table per index: slot 0 is the main index, slot `i + 1`
    /// serves `prefixes[i]`.
    tables: Vec<AHashMap<Vec<u8>, PendingList>>,
    langid: i64,
    last_docid: Option<i64>,
    bytes: usize,
}

impl PendingTerms {
    pub fn new(config: &IndexConfig) -> Self {
        PendingTerms {
            order: config.order,
            prefixes: config.prefixes.clone(),
            tables: (0..config.index_count()).map(|_| AHashMap::new()).collect(),
            langid: 0,
            last_docid: None,
            bytes: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(|t| t.is_empty())
    }

    /// Rough heap footprint of the buffered postings.
    pub fn byte_estimate(&self) -> usize {
        self.bytes
    }

    pub fn langid(&self) -> i64 {
        self.langid
    }

    /// True if buffering `(docid, langid)` next would break the
    /// single-language or docid-order invariant, so the caller must flush
    /// first.
    pub fn must_flush_before(&self, docid: i64, langid: i64) -> bool {
        if self.is_empty() {
            return false;
        }
        if langid != self.langid {
            return true;
        }
        match self.last_docid {
            Some(last) => self.order.cmp(last, docid) != Ordering::Less,
            None => false,
        }
    }

    /// Start buffering a document. The caller has already flushed if
    /// [`must_flush_before`](Self::must_flush_before) said so.
    pub fn begin_document(&mut self, docid: i64, langid: i64) -> Result<()> {
        if self.must_flush_before(docid, langid) {
            return Err(SedgeError::corrupt("pending buffer not flushed"));
        }
        self.langid = langid;
        self.last_docid = Some(docid);
        Ok(())
    }

    /// Buffer one token occurrence for the current document. The token is
    /// added to the main index and to every prefix index whose length it
    /// covers.
    pub fn add_token(
        &mut self,
        docid: i64,
        column: u64,
        position: u64,
        token: &[u8],
    ) -> Result<()> {
        self.add_to_index(0, docid, token, Some((column, position)))?;
        for i in 0..self.prefixes.len() {
            let n = self.prefixes[i];
            if token.len() >= n {
                self.add_to_index(i + 1, docid, &token[..n], Some((column, position)))?;
            }
        }
        Ok(())
    }

    /// Buffer a tombstone for one token of a deleted document.
    pub fn add_tombstone(&mut self, docid: i64, token: &[u8]) -> Result<()> {
        self.add_to_index(0, docid, token, None)?;
        for i in 0..self.prefixes.len() {
            let n = self.prefixes[i];
            if token.len() >= n {
                self.add_to_index(i + 1, docid, &token[..n], None)?;
            }
        }
        Ok(())
    }

    fn add_to_index(
        &mut self,
        index: usize,
        docid: i64,
        term: &[u8],
        occurrence: Option<(u64, u64)>,
    ) -> Result<()> {
        let order = self.order;
        if !self.tables[index].contains_key(term) {
            self.bytes += term.len() + 8;
        }
        let list = self.tables[index]
            .entry(term.to_vec())
            .or_insert_with(PendingList::new);

        let before = list.buf.len();
        if list.buf.is_empty() || list.last_docid != docid {
            list.begin_doc(docid, order)?;
        }
        if let Some((column, position)) = occurrence {
            list.add_position(column, position)?;
        }
        let after = list.buf.len();
        self.bytes += after - before;
        Ok(())
    }

    /// Snapshot one index's buffered terms as a positioned cursor, or
    /// `None` when that index holds nothing.
    pub fn cursor(&self, index: usize) -> Option<PendingCursor> {
        let table = &self.tables[index];
        if table.is_empty() {
            return None;
        }
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = table
            .iter()
            .map(|(term, list)| (term.clone(), list.snapshot()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Some(PendingCursor { entries, at: 0 })
    }

    /// Discard everything, after a flush or rollback.
    pub fn clear(&mut self) {
        for table in &mut self.tables {
            table.clear();
        }
        self.last_docid = None;
        self.bytes = 0;
    }
}

/// Term cursor over a sorted snapshot of one pending table.
///
/// Pending data is always the newest source in a merge, so its age is 0.
#[derive(Debug)]
pub struct PendingCursor {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    at: usize,
}

impl TermCursor for PendingCursor {
    fn next(&mut self) -> Result<bool> {
        self.at += 1;
        Ok(self.at < self.entries.len())
    }

    fn term(&self) -> &[u8] {
        &self.entries[self.at].0
    }

    fn doclist(&self) -> &[u8] {
        &self.entries[self.at].1
    }

    fn age(&self) -> u64 {
        0
    }
}

impl PendingCursor {
    /// Restrict the snapshot to terms matching `term` exactly or by
    /// prefix. Returns `None` when nothing survives.
    pub fn filtered(mut self, term: &[u8], is_prefix: bool) -> Option<PendingCursor> {
        self.entries.retain(|(t, _)| {
            if is_prefix {
                t.starts_with(term)
            } else {
                t.as_slice() == term
            }
        });
        if self.entries.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}
