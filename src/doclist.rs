//! Doclist and position-list codec.
//!
//! A doclist encodes, for a single term, a docid-ordered sequence of
//! `(docid delta, position list)` pairs. A position list holds, per column
//! that contains the term, an optional column marker followed by position
//! deltas; it is terminated by a 0x00 byte. The values 0 and 1 are reserved
//! (terminator and next-column marker), so every position is stored as
//! `delta + 2`.
//!
//! The format is never stored decompressed: merge and query evaluation both
//! stream it through the readers in this module.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SedgeError};
use crate::varint::{ByteReader, put_u64};

/// Position-list terminator byte value.
pub const POS_END: u64 = 0;

/// Next-column marker value inside a position list.
pub const POS_COLUMN: u64 = 1;

/// Index-wide docid iteration order.
///
/// Every doclist in an index is delta-encoded in this order, and every
/// merge and evaluator comparison respects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DocidOrder {
    /// Docids ascend within each doclist.
    #[default]
    Asc,
    /// Docids descend within each doclist.
    Desc,
}

impl DocidOrder {
    /// Compare two docids in iteration order: `Less` means `a` is visited
    /// before `b`.
    pub fn cmp(&self, a: i64, b: i64) -> Ordering {
        match self {
            DocidOrder::Asc => a.cmp(&b),
            DocidOrder::Desc => b.cmp(&a),
        }
    }

    /// The docid delta between consecutive entries, always non-negative.
    fn delta(&self, prev: i64, next: i64) -> u64 {
        match self {
            DocidOrder::Asc => (next as u64).wrapping_sub(prev as u64),
            DocidOrder::Desc => (prev as u64).wrapping_sub(next as u64),
        }
    }

    /// Apply a stored delta to the previous docid.
    pub fn apply_delta(&self, prev: i64, delta: u64) -> i64 {
        match self {
            DocidOrder::Asc => (prev as u64).wrapping_add(delta) as i64,
            DocidOrder::Desc => (prev as u64).wrapping_sub(delta) as i64,
        }
    }
}

/// Scan past a position list without decoding it.
///
/// Returns the offset of the terminator byte: the first 0x00 at a varint
/// boundary. This is the hot inner loop of merging and evaluation.
pub fn skip_position_list(buf: &[u8], from: usize) -> Result<usize> {
    let mut continuation = false;
    for (i, &b) in buf.iter().enumerate().skip(from) {
        if b == 0 && !continuation {
            return Ok(i);
        }
        continuation = (b & 0x80) != 0;
    }
    Err(SedgeError::corrupt("unterminated position list"))
}

/// Scan past the current column's positions without decoding them.
///
/// Returns the offset of the next varint-boundary byte that is either the
/// terminator (0x00) or a column marker (0x01).
pub fn skip_column_list(buf: &[u8], from: usize) -> Result<usize> {
    let mut continuation = false;
    for (i, &b) in buf.iter().enumerate().skip(from) {
        if b <= 1 && !continuation {
            return Ok(i);
        }
        continuation = (b & 0x80) != 0;
    }
    Err(SedgeError::corrupt("unterminated column list"))
}

/// One doclist entry: a docid and its position list (terminator stripped).
///
/// An empty position list is a delete tombstone: the newest entry for a
/// docid wins during merges, so a tombstone shadows older data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DocEntry<'a> {
    pub docid: i64,
    pub poslist: &'a [u8],
}

impl DocEntry<'_> {
    /// True if this entry deletes the docid rather than matching it.
    pub fn is_tombstone(&self) -> bool {
        self.poslist.is_empty()
    }
}

/// Streaming reader over an encoded doclist.
#[derive(Debug, Clone)]
pub struct DoclistReader<'a> {
    buf: &'a [u8],
    pos: usize,
    order: DocidOrder,
    prev: Option<i64>,
}

impl<'a> DoclistReader<'a> {
    /// Create a reader over `buf` in the given docid order.
    pub fn new(buf: &'a [u8], order: DocidOrder) -> Self {
        DoclistReader {
            buf,
            pos: 0,
            order,
            prev: None,
        }
    }

    /// Decode the next entry, or `None` at end of buffer.
    pub fn next(&mut self) -> Result<Option<DocEntry<'a>>> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }

        let mut reader = ByteReader::new(&self.buf[self.pos..]);
        let raw = reader.varint()?;
        self.pos += reader.offset();

        let docid = match self.prev {
            None => raw as i64,
            Some(prev) => {
                let docid = self.order.apply_delta(prev, raw);
                if raw == 0 || self.order.cmp(prev, docid) != Ordering::Less {
                    return Err(SedgeError::corrupt("non-increasing docid in doclist"));
                }
                docid
            }
        };
        self.prev = Some(docid);

        let end = skip_position_list(self.buf, self.pos)?;
        let poslist = &self.buf[self.pos..end];
        self.pos = end + 1; // consume the terminator

        Ok(Some(DocEntry { docid, poslist }))
    }
}

/// Incremental doclist builder.
///
/// Entries must be pushed in strict docid order for the writer's
/// [`DocidOrder`].
#[derive(Debug)]
pub struct DoclistWriter {
    buf: Vec<u8>,
    order: DocidOrder,
    prev: Option<i64>,
}

impl DoclistWriter {
    /// Create an empty writer.
    pub fn new(order: DocidOrder) -> Self {
        DoclistWriter {
            buf: Vec::new(),
            order,
            prev: None,
        }
    }

    /// Append one `(docid, position list)` entry. Pass an empty position
    /// list to write a delete tombstone.
    pub fn push(&mut self, docid: i64, poslist: &[u8]) -> Result<()> {
        match self.prev {
            None => {
                put_u64(&mut self.buf, docid as u64);
            }
            Some(prev) => {
                if self.order.cmp(prev, docid) != Ordering::Less {
                    return Err(SedgeError::corrupt("doclist entries out of order"));
                }
                put_u64(&mut self.buf, self.order.delta(prev, docid));
            }
        }
        self.prev = Some(docid);
        self.buf.extend_from_slice(poslist);
        self.buf.push(POS_END as u8);
        Ok(())
    }

    /// True if nothing has been pushed.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Encoded size so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Consume the writer, returning the encoded doclist.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Streaming reader over a position list slice (terminator stripped),
/// yielding `(column, position)` pairs in column-then-position order.
#[derive(Debug, Clone)]
pub struct PositionReader<'a> {
    reader: ByteReader<'a>,
    column: u64,
    prev: u64,
}

impl<'a> PositionReader<'a> {
    /// Create a reader over a stripped position list.
    pub fn new(poslist: &'a [u8]) -> Self {
        PositionReader {
            reader: ByteReader::new(poslist),
            column: 0,
            prev: 0,
        }
    }

    /// Decode the next `(column, position)` pair.
    pub fn next(&mut self) -> Result<Option<(u64, u64)>> {
        loop {
            if self.reader.is_empty() {
                return Ok(None);
            }
            let value = self.reader.varint()?;
            if value == POS_COLUMN {
                let column = self.reader.varint()?;
                if column <= self.column {
                    return Err(SedgeError::corrupt("non-increasing column number"));
                }
                self.column = column;
                self.prev = 0;
                continue;
            }
            if value < 2 {
                return Err(SedgeError::corrupt("reserved value in position list"));
            }
            // Values are stored as delta + 2; the first position in a column
            // decodes against an accumulator of 0.
            let position = self.prev + (value - 2);
            self.prev = position;
            return Ok(Some((self.column, position)));
        }
    }
}

/// Incremental position-list encoder.
///
/// Pairs must be added in strictly increasing `(column, position)` order.
#[derive(Debug, Default)]
pub struct PoslistWriter {
    buf: Vec<u8>,
    column: u64,
    prev: u64,
    first_in_column: bool,
}

impl PoslistWriter {
    /// Create an empty encoder.
    pub fn new() -> Self {
        PoslistWriter {
            first_in_column: true,
            ..PoslistWriter::default()
        }
    }

    /// Append one `(column, position)` pair.
    pub fn add(&mut self, column: u64, position: u64) -> Result<()> {
        if column != self.column {
            if column < self.column {
                return Err(SedgeError::corrupt("position list columns out of order"));
            }
            put_u64(&mut self.buf, POS_COLUMN);
            put_u64(&mut self.buf, column);
            self.column = column;
            self.prev = 0;
            self.first_in_column = true;
        }
        if !self.first_in_column && position <= self.prev {
            return Err(SedgeError::corrupt("position list positions out of order"));
        }
        put_u64(&mut self.buf, position - self.prev + 2);
        self.prev = position;
        self.first_in_column = false;
        Ok(())
    }

    /// True if no pair has been added.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the encoder, returning the stripped position list.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Union of two position lists: the `(column, position)`-sorted union of
/// both inputs, duplicates collapsed.
pub fn poslist_union(a: &[u8], b: &[u8]) -> Result<Vec<u8>> {
    let mut ra = PositionReader::new(a);
    let mut rb = PositionReader::new(b);
    let mut out = PoslistWriter::new();

    let mut na = ra.next()?;
    let mut nb = rb.next()?;
    loop {
        match (na, nb) {
            (None, None) => break,
            (Some((c, p)), None) => {
                out.add(c, p)?;
                na = ra.next()?;
            }
            (None, Some((c, p))) => {
                out.add(c, p)?;
                nb = rb.next()?;
            }
            (Some(pa), Some(pb)) => match pa.cmp(&pb) {
                Ordering::Less => {
                    out.add(pa.0, pa.1)?;
                    na = ra.next()?;
                }
                Ordering::Greater => {
                    out.add(pb.0, pb.1)?;
                    nb = rb.next()?;
                }
                Ordering::Equal => {
                    out.add(pa.0, pa.1)?;
                    na = ra.next()?;
                    nb = rb.next()?;
                }
            },
        }
    }

    Ok(out.into_bytes())
}

/// Phrase-adjacency merge of two position lists.
///
/// Emits the positions `p` from `right` for which `left` contains
/// `p - distance` in the same column: the output carries the tail token's
/// positions, the convention used throughout the evaluator.
pub fn poslist_phrase_merge(left: &[u8], right: &[u8], distance: u64) -> Result<Vec<u8>> {
    let mut rl = PositionReader::new(left);
    let mut rr = PositionReader::new(right);
    let mut out = PoslistWriter::new();

    let mut nl = rl.next()?;
    let mut nr = rr.next()?;
    while let (Some((lc, lp)), Some((rc, rp))) = (nl, nr) {
        // Compare (column, left position + distance) against (column, right
        // position) and advance the smaller side.
        let key_l = (lc, lp + distance);
        let key_r = (rc, rp);
        match key_l.cmp(&key_r) {
            Ordering::Less => nl = rl.next()?,
            Ordering::Greater => nr = rr.next()?,
            Ordering::Equal => {
                out.add(rc, rp)?;
                nl = rl.next()?;
                nr = rr.next()?;
            }
        }
    }

    Ok(out.into_bytes())
}

/// Keep only the positions of `a` whose phrase span lies within `near` of
/// some position of `b` in the same column.
///
/// Positions are tail-token positions: a phrase of `span` tokens ending at
/// position `p` occupies `[p - span + 1, p]`. Two spans are near when the
/// number of tokens strictly between them is at most `near`. The check is
/// distance-symmetric; overlapping spans are always near.
pub fn poslist_near_keep(
    a: &[u8],
    a_span: u64,
    b: &[u8],
    b_span: u64,
    near: u64,
) -> Result<Vec<u8>> {
    // Decode b once per call; NEAR lists are short in practice.
    let mut b_positions: Vec<(u64, u64)> = Vec::new();
    let mut rb = PositionReader::new(b);
    while let Some(pair) = rb.next()? {
        b_positions.push(pair);
    }

    let mut out = PoslistWriter::new();
    let mut ra = PositionReader::new(a);
    while let Some((col, pa)) = ra.next()? {
        let a_start = pa.saturating_sub(a_span - 1);
        let keep = b_positions.iter().any(|&(bc, pb)| {
            if bc != col {
                return false;
            }
            let b_start = pb.saturating_sub(b_span - 1);
            if b_start > pa {
                b_start - pa - 1 <= near
            } else if a_start > pb {
                a_start - pb - 1 <= near
            } else {
                true
            }
        });
        if keep {
            out.add(col, pa)?;
        }
    }

    Ok(out.into_bytes())
}

/// OR-merge two whole doclists: the docid-ordered union of both, with
/// position lists unioned on equal docids. Used to accumulate the doclists
/// of distinct terms matching one prefix.
pub fn doclist_or_merge(a: &[u8], b: &[u8], order: DocidOrder) -> Result<Vec<u8>> {
    let mut ra = DoclistReader::new(a, order);
    let mut rb = DoclistReader::new(b, order);
    let mut out = DoclistWriter::new(order);

    let mut na = ra.next()?;
    let mut nb = rb.next()?;
    loop {
        match (na, nb) {
            (None, None) => break,
            (Some(ea), None) => {
                out.push(ea.docid, ea.poslist)?;
                na = ra.next()?;
            }
            (None, Some(eb)) => {
                out.push(eb.docid, eb.poslist)?;
                nb = rb.next()?;
            }
            (Some(ea), Some(eb)) => match order.cmp(ea.docid, eb.docid) {
                Ordering::Less => {
                    out.push(ea.docid, ea.poslist)?;
                    na = ra.next()?;
                }
                Ordering::Greater => {
                    out.push(eb.docid, eb.poslist)?;
                    nb = rb.next()?;
                }
                Ordering::Equal => {
                    let merged = poslist_union(ea.poslist, eb.poslist)?;
                    out.push(ea.docid, &merged)?;
                    na = ra.next()?;
                    nb = rb.next()?;
                }
            },
        }
    }

    Ok(out.into_bytes())
}
