//! Multi-segment term iteration.
//!
//! A [`MultiSegmentCursor`] merges any number of positioned term cursors
//! (segment readers, the pending-terms snapshot) into a single stream of
//! distinct terms in term order. For each term it merges the doclists of
//! every source holding the term, with the newest source winning docid
//! ties, so deletes and updates shadow older segment data.

use std::cmp::Ordering;
use std::fmt;

use crate::doclist::{DocidOrder, DoclistReader, DoclistWriter, skip_position_list};
use crate::error::{Result, SedgeError};
use crate::varint::ByteReader;

/// A positioned cursor over `(term, doclist)` entries in term order.
///
/// Implementations are positioned on a valid entry at construction time;
/// `next` advances and returns false at end of stream.
pub trait TermCursor: fmt::Debug {
    fn next(&mut self) -> Result<bool>;
    fn term(&self) -> &[u8];
    fn doclist(&self) -> &[u8];
    /// Recency rank among the cursors feeding one merge: lower is newer.
    fn age(&self) -> u64;
}

/// Streaming decoder over an owned doclist copy, used by the lazy
/// docid-at-a-time path where borrows from the source cursors cannot be
/// held across calls.
#[derive(Debug)]
struct DocStream {
    buf: Vec<u8>,
    pos: usize,
    prev: Option<i64>,
    current: Option<(i64, std::ops::Range<usize>)>,
}

impl DocStream {
    fn new(buf: Vec<u8>, order: DocidOrder) -> Result<Self> {
        let mut stream = DocStream {
            buf,
            pos: 0,
            prev: None,
            current: None,
        };
        stream.advance(order)?;
        Ok(stream)
    }

    fn advance(&mut self, order: DocidOrder) -> Result<()> {
        if self.pos >= self.buf.len() {
            self.current = None;
            return Ok(());
        }
        let mut reader = ByteReader::new(&self.buf[self.pos..]);
        let raw = reader.varint()?;
        self.pos += reader.offset();

        let docid = match self.prev {
            None => raw as i64,
            Some(prev) => {
                let docid = order.apply_delta(prev, raw);
                if raw == 0 || order.cmp(prev, docid) != Ordering::Less {
                    return Err(SedgeError::corrupt("non-increasing docid in doclist"));
                }
                docid
            }
        };
        self.prev = Some(docid);

        let end = skip_position_list(&self.buf, self.pos)?;
        self.current = Some((docid, self.pos..end));
        self.pos = end + 1;
        Ok(())
    }
}

/// Merged term cursor over every live source of one index.
pub struct MultiSegmentCursor {
    readers: Vec<Box<dyn TermCursor>>,
    order: DocidOrder,
    /// Drop docids whose winning entry is a tombstone. Set on the query
    /// path and when merging into the oldest segment; clear otherwise so
    /// tombstones keep shadowing segments outside the merge.
    ignore_empty: bool,
    started: bool,
    term: Vec<u8>,
    /// Number of front readers positioned on the current term.
    matched: usize,
    doclist: Vec<u8>,
    streams: Option<Vec<DocStream>>,
}

impl fmt::Debug for MultiSegmentCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiSegmentCursor")
            .field("readers", &self.readers.len())
            .field("matched", &self.matched)
            .field("started", &self.started)
            .finish()
    }
}

impl MultiSegmentCursor {
    pub fn new(order: DocidOrder, ignore_empty: bool) -> Self {
        MultiSegmentCursor {
            readers: Vec::new(),
            order,
            ignore_empty,
            started: false,
            term: Vec::new(),
            matched: 0,
            doclist: Vec::new(),
            streams: None,
        }
    }

    /// Add a source cursor. It must already be positioned on an entry.
    pub fn add(&mut self, reader: Box<dyn TermCursor>) {
        debug_assert!(!self.started);
        self.readers.push(reader);
    }

    /// True if no source was added (nothing matched any seek).
    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Advance to the next distinct term without touching its doclists.
    /// Callers follow up with either [`step`](Self::step)-style
    /// materialization via [`doclist`](Self::doclist) only after calling
    /// [`step`](Self::step), or lazy [`next_docid`](Self::next_docid).
    pub fn advance_term(&mut self) -> Result<bool> {
        if self.started {
            // Consume the readers that supplied the previous term.
            let mut i = 0;
            while i < self.matched {
                if self.readers[i].next()? {
                    i += 1;
                } else {
                    self.readers.remove(i);
                    self.matched -= 1;
                }
            }
        }
        self.started = true;
        self.streams = None;
        self.doclist.clear();

        if self.readers.is_empty() {
            return Ok(false);
        }
        self.readers
            .sort_by(|a, b| a.term().cmp(b.term()).then(a.age().cmp(&b.age())));

        self.term = self.readers[0].term().to_vec();
        self.matched = self
            .readers
            .iter()
            .take_while(|r| r.term() == self.term)
            .count();
        Ok(true)
    }

    /// Advance to the next term and materialize its merged doclist.
    /// Skips terms whose merged doclist comes out empty when
    /// `ignore_empty` is set.
    pub fn step(&mut self) -> Result<bool> {
        loop {
            if !self.advance_term()? {
                return Ok(false);
            }
            self.doclist = self.materialize()?;
            if self.doclist.is_empty() && self.ignore_empty {
                continue;
            }
            return Ok(true);
        }
    }

    fn materialize(&self) -> Result<Vec<u8>> {
        let mut streams: Vec<DoclistReader> = self.readers[..self.matched]
            .iter()
            .map(|r| DoclistReader::new(r.doclist(), self.order))
            .collect();
        let mut current = Vec::with_capacity(streams.len());
        for stream in &mut streams {
            current.push(stream.next()?);
        }

        let mut out = DoclistWriter::new(self.order);
        loop {
            let mut best: Option<(usize, i64)> = None;
            for (i, entry) in current.iter().enumerate() {
                if let Some(entry) = entry {
                    match best {
                        // Sources are sorted newest first, so on a docid
                        // tie the earliest stream wins.
                        Some((_, docid)) if self.order.cmp(docid, entry.docid).is_le() => {}
                        _ => best = Some((i, entry.docid)),
                    }
                }
            }
            let Some((winner, docid)) = best else {
                break;
            };

            let poslist = current[winner]
                .as_ref()
                .map(|e| e.poslist)
                .unwrap_or_default();
            if !(self.ignore_empty && poslist.is_empty()) {
                out.push(docid, poslist)?;
            }
            for (i, entry) in current.iter_mut().enumerate() {
                if entry.is_some_and(|e| e.docid == docid) {
                    *entry = streams[i].next()?;
                }
            }
        }
        Ok(out.into_bytes())
    }

    /// Decode the next `(docid, position list)` of the current term without
    /// materializing the whole merged doclist. Tombstoned docids are
    /// skipped when `ignore_empty` is set.
    pub fn next_docid(&mut self) -> Result<Option<(i64, Vec<u8>)>> {
        if self.streams.is_none() {
            let mut streams = Vec::with_capacity(self.matched);
            for reader in &self.readers[..self.matched] {
                streams.push(DocStream::new(reader.doclist().to_vec(), self.order)?);
            }
            self.streams = Some(streams);
        }
        let order = self.order;
        let Some(streams) = self.streams.as_mut() else {
            return Ok(None);
        };

        loop {
            let mut best: Option<(usize, i64)> = None;
            for (i, stream) in streams.iter().enumerate() {
                if let Some((docid, _)) = &stream.current {
                    match best {
                        Some((_, b)) if order.cmp(b, *docid).is_le() => {}
                        _ => best = Some((i, *docid)),
                    }
                }
            }
            let Some((winner, docid)) = best else {
                return Ok(None);
            };

            let poslist = match &streams[winner].current {
                Some((_, range)) => streams[winner].buf[range.clone()].to_vec(),
                None => Vec::new(),
            };
            for stream in streams.iter_mut() {
                if stream.current.as_ref().is_some_and(|(d, _)| *d == docid) {
                    stream.advance(order)?;
                }
            }
            if self.ignore_empty && poslist.is_empty() {
                continue;
            }
            return Ok(Some((docid, poslist)));
        }
    }

    /// The current term. Valid after a successful `advance_term` or `step`.
    pub fn term(&self) -> &[u8] {
        &self.term
    }

    /// The merged doclist of the current term. Valid after `step`.
    pub fn doclist(&self) -> &[u8] {
        &self.doclist
    }

    /// Consume the cursor, returning the still-live source cursors.
    /// Exhausted sources have already been dropped. The incremental merge
    /// uses this to truncate partially consumed input segments at each
    /// reader's first unconsumed term.
    pub fn take_readers(self) -> Vec<Box<dyn TermCursor>> {
        self.readers
    }

    /// Total encoded bytes of the current term's source doclists, before
    /// merging. Used to estimate token cost for deferral decisions.
    pub fn doclist_size_estimate(&self) -> usize {
        self.readers[..self.matched]
            .iter()
            .map(|r| r.doclist().len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doclist::PoslistWriter;

    /// In-memory term cursor for exercising the merge logic directly.
    #[derive(Debug)]
    struct VecCursor {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        at: usize,
        age: u64,
    }

    impl VecCursor {
        fn new(entries: Vec<(&str, Vec<u8>)>, age: u64) -> Box<Self> {
            Box::new(VecCursor {
                entries: entries
                    .into_iter()
                    .map(|(t, d)| (t.as_bytes().to_vec(), d))
                    .collect(),
                at: 0,
                age,
            })
        }
    }

    impl TermCursor for VecCursor {
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
            self.age
        }
    }

    fn doclist(entries: &[(i64, &[u64])]) -> Vec<u8> {
        let mut w = DoclistWriter::new(DocidOrder::Asc);
        for &(docid, positions) in entries {
            let mut p = PoslistWriter::new();
            for &pos in positions {
                p.add(0, pos).unwrap();
            }
            w.push(docid, &p.into_bytes()).unwrap();
        }
        w.into_bytes()
    }

    fn docids(doclist: &[u8]) -> Vec<i64> {
        let mut out = Vec::new();
        let mut r = DoclistReader::new(doclist, DocidOrder::Asc);
        while let Some(e) = r.next().unwrap() {
            out.push(e.docid);
        }
        out
    }

    #[test]
    fn test_terms_merge_in_order() {
        let mut cursor = MultiSegmentCursor::new(DocidOrder::Asc, false);
        cursor.add(VecCursor::new(
            vec![("apple", doclist(&[(1, &[0])])), ("pear", doclist(&[(2, &[0])]))],
            1,
        ));
        cursor.add(VecCursor::new(vec![("mango", doclist(&[(3, &[0])]))], 0));

        let mut terms = Vec::new();
        while cursor.step().unwrap() {
            terms.push(String::from_utf8(cursor.term().to_vec()).unwrap());
        }
        assert_eq!(terms, vec!["apple", "mango", "pear"]);
    }

    #[test]
    fn test_newest_wins_docid_ties() {
        // Both sources hold "fox" for docid 5; the newer source (age 0)
        // carries position 9 and must win.
        let old = VecCursor::new(vec![("fox", doclist(&[(5, &[1]), (7, &[2])]))], 1);
        let new = VecCursor::new(vec![("fox", doclist(&[(5, &[9])]))], 0);

        let mut cursor = MultiSegmentCursor::new(DocidOrder::Asc, false);
        cursor.add(old);
        cursor.add(new);

        assert!(cursor.step().unwrap());
        let mut r = DoclistReader::new(cursor.doclist(), DocidOrder::Asc);
        let first = r.next().unwrap().unwrap();
        assert_eq!(first.docid, 5);
        let mut winning = PoslistWriter::new();
        winning.add(0, 9).unwrap();
        assert_eq!(first.poslist, winning.into_bytes().as_slice());
        assert_eq!(r.next().unwrap().unwrap().docid, 7);
    }

    #[test]
    fn test_tombstone_shadows_and_ignore_empty_drops() {
        let old = VecCursor::new(vec![("fox", doclist(&[(5, &[1]), (7, &[2])]))], 1);
        let new = VecCursor::new(vec![("fox", doclist(&[(5, &[]), (9, &[0])]))], 0);

        // Without ignore_empty the tombstone survives the merge.
        let mut keep = MultiSegmentCursor::new(DocidOrder::Asc, false);
        keep.add(VecCursor::new(
            vec![("fox", doclist(&[(5, &[1]), (7, &[2])]))],
            1,
        ));
        keep.add(VecCursor::new(
            vec![("fox", doclist(&[(5, &[]), (9, &[0])]))],
            0,
        ));
        assert!(keep.step().unwrap());
        assert_eq!(docids(keep.doclist()), vec![5, 7, 9]);

        // With ignore_empty docid 5 disappears entirely.
        let mut drop = MultiSegmentCursor::new(DocidOrder::Asc, true);
        drop.add(old);
        drop.add(new);
        assert!(drop.step().unwrap());
        assert_eq!(docids(drop.doclist()), vec![7, 9]);
    }

    #[test]
    fn test_fully_deleted_term_skipped() {
        let old = VecCursor::new(vec![("fox", doclist(&[(5, &[1])])), ("pig", doclist(&[(1, &[0])]))], 1);
        let new = VecCursor::new(vec![("fox", doclist(&[(5, &[])]))], 0);

        let mut cursor = MultiSegmentCursor::new(DocidOrder::Asc, true);
        cursor.add(old);
        cursor.add(new);

        assert!(cursor.step().unwrap());
        assert_eq!(cursor.term(), b"pig");
        assert!(!cursor.step().unwrap());
    }

    #[test]
    fn test_lazy_next_docid_matches_materialized() {
        let a = doclist(&[(1, &[0]), (4, &[2]), (9, &[1])]);
        let b = doclist(&[(2, &[3]), (4, &[])]);

        let mut cursor = MultiSegmentCursor::new(DocidOrder::Asc, true);
        cursor.add(VecCursor::new(vec![("t", a)], 1));
        cursor.add(VecCursor::new(vec![("t", b)], 0));

        assert!(cursor.advance_term().unwrap());
        let mut seen = Vec::new();
        while let Some((docid, _)) = cursor.next_docid().unwrap() {
            seen.push(docid);
        }
        assert_eq!(seen, vec![1, 2, 9]);
    }

    #[test]
    fn test_descending_order_merge() {
        let mut w = DoclistWriter::new(DocidOrder::Desc);
        w.push(9, &[2]).unwrap();
        w.push(3, &[2]).unwrap();
        let a = w.into_bytes();
        let mut w = DoclistWriter::new(DocidOrder::Desc);
        w.push(7, &[2]).unwrap();
        let b = w.into_bytes();

        let mut cursor = MultiSegmentCursor::new(DocidOrder::Desc, false);
        cursor.add(VecCursor::new(vec![("t", a)], 0));
        cursor.add(VecCursor::new(vec![("t", b)], 1));

        assert!(cursor.step().unwrap());
        let mut r = DoclistReader::new(cursor.doclist(), DocidOrder::Desc);
        let mut seen = Vec::new();
        while let Some(e) = r.next().unwrap() {
            seen.push(e.docid);
        }
        assert_eq!(seen, vec![9, 7, 3]);
    }
}
