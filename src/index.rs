//! The full-text index facade.
//!
//! A [`TextIndex`] owns the pending-terms buffer and coordinates every
//! write path: document inserts and deletes buffer postings until a flush
//! writes level-0 segments, segdir allocation cascades full merges, and
//! the admin commands expose optimize, rebuild, bounded incremental
//! merging and the posting-checksum integrity check.
//!
//! Concurrency follows the host's single-writer model. The pending buffer
//! sits behind a mutex so reads can snapshot it; everything else is
//! persisted through the [`IndexStore`] within the host's transaction.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use parking_lot::Mutex;

use crate::config::IndexConfig;
use crate::error::{Result, SedgeError};
use crate::eval::QueryCursor;
use crate::expr;
use crate::pending::PendingTerms;
use crate::segment::absolute_level;
use crate::segment::cursor::TermCursor;
use crate::segment::merge::MergeEngine;
use crate::segment::writer::SegmentWriter;
use crate::store::{IndexStore, STAT_AUTOMERGE, STAT_GLOBALS, SegdirEntry};
use crate::tokenizer::{Tokenizer, TokenizerRegistry};
use crate::varint::{ByteReader, put_u64};

/// A full-text index over one logical table.
#[derive(Debug)]
pub struct TextIndex {
    store: Arc<dyn IndexStore>,
    config: IndexConfig,
    tokenizer: Arc<dyn Tokenizer>,
    pending: Mutex<PendingTerms>,
    interrupt: Arc<AtomicBool>,
}

impl TextIndex {
    /// Open an index over `store`, instantiating the configured tokenizer
    /// from `registry`.
    pub fn new(
        store: Arc<dyn IndexStore>,
        config: IndexConfig,
        registry: &TokenizerRegistry,
    ) -> Result<TextIndex> {
        let tokenizer = registry.create(&config.tokenizer)?;
        let pending = Mutex::new(PendingTerms::new(&config));
        Ok(TextIndex {
            store,
            config,
            tokenizer,
            pending,
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// The flag a host can set to abort a running query between rows.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    /// Index one document. Replaces any existing row with the same docid.
    pub fn insert(&self, docid: i64, langid: i64, columns: &[&str]) -> Result<()> {
        if columns.len() != self.config.columns.len() {
            return Err(SedgeError::query(format!(
                "expected {} columns, got {}",
                self.config.columns.len(),
                columns.len()
            )));
        }
        if self.store.content_get(docid)?.is_some() {
            self.delete(docid)?;
        }

        let mut pending = self.pending.lock();
        if pending.must_flush_before(docid, langid) {
            self.flush_locked(&mut pending)?;
        }
        pending.begin_document(docid, langid)?;

        let mut counts = vec![0u64; columns.len()];
        for (column, text) in columns.iter().enumerate() {
            for token in self.tokenizer.tokenize(text, langid)? {
                pending.add_token(docid, column as u64, token.position, token.text.as_bytes())?;
                counts[column] += 1;
            }
        }

        self.store.content_put(&crate::store::ContentRow {
            docid,
            langid,
            columns: columns.iter().map(|s| s.to_string()).collect(),
        })?;
        self.store.docsize_put(docid, &encode_counts(&counts))?;

        let ncol = self.config.columns.len();
        let mut globals = self.read_globals()?;
        globals[0] += 1;
        for (column, &n) in counts.iter().enumerate() {
            globals[column + 1] += n;
            globals[column + 1 + ncol] += columns[column].len() as u64;
        }
        self.write_globals(&globals)?;

        if pending.byte_estimate() > self.config.pending_threshold {
            self.flush_locked(&mut pending)?;
        }
        Ok(())
    }

    /// Remove one document. Unknown docids are a no-op.
    pub fn delete(&self, docid: i64) -> Result<()> {
        let Some(row) = self.store.content_get(docid)? else {
            return Ok(());
        };

        let mut pending = self.pending.lock();
        if pending.must_flush_before(docid, row.langid) {
            self.flush_locked(&mut pending)?;
        }
        pending.begin_document(docid, row.langid)?;
        for text in &row.columns {
            for token in self.tokenizer.tokenize(text, row.langid)? {
                pending.add_tombstone(docid, token.text.as_bytes())?;
            }
        }

        let ncol = self.config.columns.len();
        let mut globals = self.read_globals()?;
        globals[0] = globals[0].saturating_sub(1);
        if let Some(blob) = self.store.docsize_get(docid)? {
            for (column, n) in decode_counts(&blob)?.iter().enumerate().take(ncol) {
                globals[column + 1] = globals[column + 1].saturating_sub(*n);
            }
        }
        for (column, text) in row.columns.iter().enumerate().take(ncol) {
            globals[column + 1 + ncol] =
                globals[column + 1 + ncol].saturating_sub(text.len() as u64);
        }
        self.write_globals(&globals)?;

        self.store.docsize_delete(docid)?;
        self.store.content_delete(docid)?;

        if pending.byte_estimate() > self.config.pending_threshold {
            self.flush_locked(&mut pending)?;
        }
        Ok(())
    }

    /// Replace one document: delete then insert under the same docid.
    pub fn replace(&self, docid: i64, langid: i64, columns: &[&str]) -> Result<()> {
        self.delete(docid)?;
        self.insert(docid, langid, columns)
    }

    /// Flush the pending buffer to level-0 segments.
    pub fn sync(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        self.flush_locked(&mut pending)
    }

    /// Write one level-0 segment per index holding pending data, then run
    /// automerge maintenance if enabled.
    fn flush_locked(&self, pending: &mut PendingTerms) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let langid = pending.langid();
        let engine = MergeEngine::new(self.store.clone(), &self.config);

        let mut leaves_flushed: i64 = 0;
        for index in 0..self.config.index_count() {
            let Some(mut cursor) = pending.cursor(index) else {
                continue;
            };
            let level = absolute_level(&self.config, langid, index, 0);
            // May cascade a full merge of level 0 first.
            let idx = engine.allocate_segdir_idx(level)?;

            let mut writer = SegmentWriter::new(self.store.as_ref(), self.config.node_size)?;
            loop {
                writer.add(cursor.term(), cursor.doclist())?;
                if !cursor.next()? {
                    break;
                }
            }
            if let Some(entry) = writer.finish(level, idx)? {
                leaves_flushed += segment_leaf_count(&entry);
                self.store.segdir_put(&entry)?;
            }
        }
        pending.clear();

        let automerge = self.automerge()?;
        if automerge >= 2 {
            engine.incr_merge((leaves_flushed as usize) * 2, automerge)?;
        }
        Ok(())
    }

    /// Evaluate a MATCH expression, including still-buffered pending data.
    pub fn query(&self, match_expr: &str, langid: i64) -> Result<QueryCursor> {
        let expr = expr::parse(
            match_expr,
            self.tokenizer.as_ref(),
            langid,
            self.config.max_expr_depth,
        )?;
        let pending = self.pending.lock();
        QueryCursor::new(
            self.store.clone(),
            &self.config,
            self.tokenizer.clone(),
            &pending,
            expr,
            langid,
            self.interrupt.clone(),
        )
    }

    /// Per-column token counts of one document, from the docsize table.
    pub fn docsize(&self, docid: i64) -> Result<Option<Vec<u64>>> {
        match self.store.docsize_get(docid)? {
            Some(blob) => Ok(Some(decode_counts(&blob)?)),
            None => Ok(None),
        }
    }

    /// Global totals: document count, then per-column token sums, then
    /// per-column byte sums.
    pub fn totals(&self) -> Result<Vec<u64>> {
        self.read_globals()
    }

    /// Run one admin command, mirroring the special INSERT syntax of the
    /// original interface: `optimize`, `rebuild`, `integrity-check`,
    /// `merge=<blocks>,<segments>` and `automerge=<n>`.
    pub fn run_command(&self, command: &str) -> Result<()> {
        match command {
            "optimize" => self.optimize(),
            "rebuild" => self.rebuild(),
            "integrity-check" => self.integrity_check(),
            _ => {
                if let Some(rest) = command.strip_prefix("merge=") {
                    let (blocks, segments) = rest
                        .split_once(',')
                        .ok_or_else(|| SedgeError::query("merge expects <blocks>,<segments>"))?;
                    let blocks: usize = blocks
                        .trim()
                        .parse()
                        .map_err(|_| SedgeError::query("malformed merge block count"))?;
                    let segments: usize = segments
                        .trim()
                        .parse()
                        .map_err(|_| SedgeError::query("malformed merge segment count"))?;
                    self.sync()?;
                    let engine = MergeEngine::new(self.store.clone(), &self.config);
                    engine.incr_merge(blocks, segments)?;
                    Ok(())
                } else if let Some(rest) = command.strip_prefix("automerge=") {
                    let n: usize = rest
                        .trim()
                        .parse()
                        .map_err(|_| SedgeError::query("malformed automerge value"))?;
                    // The historical interface treats 1 as "enable with the
                    // default fan-in".
                    let n = if n == 1 { 8 } else { n };
                    let mut blob = Vec::new();
                    put_u64(&mut blob, n as u64);
                    self.store.stat_put(STAT_AUTOMERGE, &blob)
                } else {
                    Err(SedgeError::query(format!("unknown command: {command}")))
                }
            }
        }
    }

    /// The persisted automerge setting; 0 disables automatic incremental
    /// merging.
    pub fn automerge(&self) -> Result<usize> {
        match self.store.stat_get(STAT_AUTOMERGE)? {
            Some(blob) => {
                let mut reader = ByteReader::new(&blob);
                Ok(reader.varint()? as usize)
            }
            None => Ok(0),
        }
    }

    /// Fold every index down to a single segment at its highest occupied
    /// level.
    fn optimize(&self) -> Result<()> {
        self.sync()?;
        let engine = MergeEngine::new(self.store.clone(), &self.config);
        let slots = {
            let pending = self.pending.lock();
            self.live_index_slots(&pending)?
        };
        for (langid, index) in slots {
            engine.optimize(langid, index)?;
        }
        Ok(())
    }

    /// Discard every segment and rebuild the inverted index from the
    /// content table.
    fn rebuild(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        pending.clear();

        for entry in self.store.segdir_all()? {
            if entry.end_block > 0 {
                self.store
                    .block_delete_range(entry.start_block, entry.end_block)?;
            }
            self.store.segdir_delete(entry.level, entry.idx)?;
        }
        self.store.stat_delete(STAT_GLOBALS)?;
        self.store
            .stat_delete(crate::store::STAT_INCRMERGE_HINT)?;

        let ncol = self.config.columns.len();
        let mut globals = vec![0u64; 1 + 2 * ncol];
        for docid in self.store.content_docids()? {
            let Some(row) = self.store.content_get(docid)? else {
                continue;
            };
            if pending.must_flush_before(docid, row.langid) {
                self.flush_locked(&mut pending)?;
            }
            pending.begin_document(docid, row.langid)?;

            let mut counts = vec![0u64; row.columns.len()];
            for (column, text) in row.columns.iter().enumerate() {
                for token in self.tokenizer.tokenize(text, row.langid)? {
                    pending.add_token(
                        docid,
                        column as u64,
                        token.position,
                        token.text.as_bytes(),
                    )?;
                    counts[column] += 1;
                }
            }
            self.store.docsize_put(docid, &encode_counts(&counts))?;

            globals[0] += 1;
            for (column, &n) in counts.iter().enumerate().take(ncol) {
                globals[column + 1] += n;
            }
            for (column, text) in row.columns.iter().enumerate().take(ncol) {
                globals[column + 1 + ncol] += text.len() as u64;
            }
            if pending.byte_estimate() > self.config.pending_threshold {
                self.flush_locked(&mut pending)?;
            }
        }
        self.write_globals(&globals)?;
        self.flush_locked(&mut pending)
    }

    /// Verify the inverted index against the content table.
    ///
    /// Both sides reduce to an XOR of per-posting checksums, so the
    /// comparison is independent of iteration order. A mismatch reports
    /// corruption.
    fn integrity_check(&self) -> Result<()> {
        let pending = self.pending.lock();

        let mut index_sum: u32 = 0;
        for (langid, index) in self.live_index_slots(&pending)? {
            let base = crate::segment::base_level(&self.config, langid, index);
            let rows = self
                .store
                .segdir_range(base, base + crate::config::LEVEL_MAX - 1)?;
            let mut by_age = rows;
            by_age.sort_by(|a, b| a.level.cmp(&b.level).then(b.idx.cmp(&a.idx)));

            let mut cursor =
                crate::segment::cursor::MultiSegmentCursor::new(self.config.order, true);
            if pending.langid() == langid {
                if let Some(snapshot) = pending.cursor(index) {
                    cursor.add(Box::new(snapshot));
                }
            }
            for (age, entry) in by_age.iter().enumerate() {
                let mut reader = crate::segment::reader::SegmentReader::new(
                    self.store.clone(),
                    entry.clone(),
                    age as u64 + 1,
                );
                if reader.scan_all()? {
                    cursor.add(Box::new(reader));
                }
            }

            while cursor.step()? {
                let term = cursor.term().to_vec();
                let mut docs =
                    crate::doclist::DoclistReader::new(cursor.doclist(), self.config.order);
                while let Some(entry) = docs.next()? {
                    let mut positions = crate::doclist::PositionReader::new(entry.poslist);
                    while let Some((column, position)) = positions.next()? {
                        index_sum ^=
                            posting_checksum(langid, index, &term, entry.docid, column, position);
                    }
                }
            }
        }

        let mut content_sum: u32 = 0;
        for docid in self.store.content_docids()? {
            let Some(row) = self.store.content_get(docid)? else {
                continue;
            };
            for (column, text) in row.columns.iter().enumerate() {
                for token in self.tokenizer.tokenize(text, row.langid)? {
                    let term = token.text.as_bytes();
                    content_sum ^= posting_checksum(
                        row.langid,
                        0,
                        term,
                        docid,
                        column as u64,
                        token.position,
                    );
                    for (i, &n) in self.config.prefixes.iter().enumerate() {
                        if term.len() >= n {
                            content_sum ^= posting_checksum(
                                row.langid,
                                i + 1,
                                &term[..n],
                                docid,
                                column as u64,
                                token.position,
                            );
                        }
                    }
                }
            }
        }

        if index_sum != content_sum {
            return Err(SedgeError::corrupt(
                "inverted index does not match table content",
            ));
        }
        Ok(())
    }

    /// Every `(langid, index)` pair with live data: segdir rows plus the
    /// pending buffer.
    fn live_index_slots(&self, pending: &PendingTerms) -> Result<Vec<(i64, usize)>> {
        let mut slots: Vec<(i64, usize)> = Vec::new();
        for entry in self.store.segdir_all()? {
            let (langid, index, _) = crate::segment::split_level(&self.config, entry.level);
            if !slots.contains(&(langid, index)) {
                slots.push((langid, index));
            }
        }
        if !pending.is_empty() {
            for index in 0..self.config.index_count() {
                let slot = (pending.langid(), index);
                if pending.cursor(index).is_some() && !slots.contains(&slot) {
                    slots.push(slot);
                }
            }
        }
        slots.sort_unstable();
        Ok(slots)
    }

    fn read_globals(&self) -> Result<Vec<u64>> {
        let want = 1 + 2 * self.config.columns.len();
        match self.store.stat_get(STAT_GLOBALS)? {
            Some(blob) => {
                let mut out = decode_counts(&blob)?;
                out.resize(want, 0);
                Ok(out)
            }
            None => Ok(vec![0; want]),
        }
    }

    fn write_globals(&self, globals: &[u64]) -> Result<()> {
        self.store.stat_put(STAT_GLOBALS, &encode_counts(globals))
    }
}

fn segment_leaf_count(entry: &SegdirEntry) -> i64 {
    if entry.start_block > 0 {
        entry.leaves_end_block - entry.start_block + 1
    } else {
        1
    }
}

fn encode_counts(counts: &[u64]) -> Vec<u8> {
    let mut blob = Vec::new();
    for &n in counts {
        put_u64(&mut blob, n);
    }
    blob
}

fn decode_counts(blob: &[u8]) -> Result<Vec<u64>> {
    let mut reader = ByteReader::new(blob);
    let mut out = Vec::new();
    while !reader.is_empty() {
        out.push(reader.varint()?);
    }
    Ok(out)
}

fn posting_checksum(
    langid: i64,
    index: usize,
    term: &[u8],
    docid: i64,
    column: u64,
    position: u64,
) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&langid.to_le_bytes());
    hasher.update(&(index as u64).to_le_bytes());
    hasher.update(&(term.len() as u64).to_le_bytes());
    hasher.update(term);
    hasher.update(&docid.to_le_bytes());
    hasher.update(&column.to_le_bytes());
    hasher.update(&position.to_le_bytes());
    hasher.finalize()
}
