//! Segment merging.
//!
//! Three maintenance paths share this module. A full merge folds every
//! segment of one absolute level into a single segment one level up and
//! runs automatically when a level fills. Optimize folds an entire index
//! into one segment. The incremental merge does a bounded amount of the
//! same work per call, writing into an appendable segment whose block
//! range is reserved up front, truncating partially consumed inputs in
//! place and persisting a resumption hint so later calls continue where
//! it stopped.

use std::sync::Arc;

use ahash::AHashMap;

use crate::config::{IndexConfig, LEVEL_MAX, MAX_APPENDABLE_HEIGHT, MERGE_COUNT};
use crate::error::{Result, SedgeError};
use crate::segment::cursor::{MultiSegmentCursor, TermCursor};
use crate::segment::reader::SegmentReader;
use crate::segment::writer::SegmentWriter;
use crate::segment::{node_height, separator, shared_prefix};
use crate::store::{IndexStore, STAT_INCRMERGE_HINT, SegdirEntry};
use crate::varint::{ByteReader, put_u64, varint_len};

/// Bytes reserved for an interior node header, matching the segment
/// writer's budget.
const INTERIOR_HEADER_RESERVE: usize = 12;

/// Counters reported by one incremental-merge invocation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    /// Leaf blocks written across all levels touched.
    pub leaves_written: usize,
    /// Input segments fully consumed and deleted.
    pub segments_merged: usize,
    /// Levels whose merge ran to completion.
    pub levels_completed: usize,
}

/// Merge maintenance over one index's segdir.
pub struct MergeEngine<'a> {
    store: Arc<dyn IndexStore>,
    config: &'a IndexConfig,
}

impl<'a> MergeEngine<'a> {
    pub fn new(store: Arc<dyn IndexStore>, config: &'a IndexConfig) -> Self {
        MergeEngine { store, config }
    }

    /// Absolute-level bounds of the `(langid, index)` slot containing
    /// `abs_level`.
    fn index_range(&self, abs_level: i64) -> (i64, i64) {
        let base = abs_level - abs_level.rem_euclid(LEVEL_MAX);
        (base, base + LEVEL_MAX - 1)
    }

    /// True when no segment older than `abs_level` exists in its index, so
    /// a merge writing one level up may drop tombstones.
    fn is_oldest(&self, abs_level: i64) -> Result<bool> {
        let (_, top) = self.index_range(abs_level);
        Ok(self.store.segdir_range(abs_level + 1, top)?.is_empty())
    }

    fn next_idx(&self, abs_level: i64) -> Result<i32> {
        Ok(self.store.segdir_max_idx(abs_level)?.map_or(0, |i| i + 1))
    }

    /// Pick the idx for a new segment at `abs_level`, merging the level
    /// into the next one first when it is full.
    pub fn allocate_segdir_idx(&self, abs_level: i64) -> Result<i32> {
        if self.store.segdir_level(abs_level)?.len() >= MERGE_COUNT {
            self.merge_level(abs_level)?;
            Ok(0)
        } else {
            self.next_idx(abs_level)
        }
    }

    fn delete_segment(&self, entry: &SegdirEntry) -> Result<()> {
        if entry.end_block > 0 {
            self.store
                .block_delete_range(entry.start_block, entry.end_block)?;
        }
        self.store.segdir_delete(entry.level, entry.idx)
    }

    /// Renumber the segments of one level to consecutive idx values,
    /// preserving age order.
    fn repack_level(&self, abs_level: i64) -> Result<()> {
        let rows = self.store.segdir_level(abs_level)?;
        for (i, row) in rows.iter().enumerate() {
            let new_idx = i as i32;
            if row.idx != new_idx {
                self.store.segdir_delete(row.level, row.idx)?;
                let mut moved = row.clone();
                moved.idx = new_idx;
                self.store.segdir_put(&moved)?;
            }
        }
        Ok(())
    }

    /// Merge every segment at `abs_level` into one new segment at the next
    /// level up. Inputs are deleted afterwards.
    pub fn merge_level(&self, abs_level: i64) -> Result<()> {
        if abs_level.rem_euclid(LEVEL_MAX) + 1 >= LEVEL_MAX {
            return Err(SedgeError::corrupt("segment level limit reached"));
        }
        let inputs = self.store.segdir_level(abs_level)?;
        if inputs.is_empty() {
            return Ok(());
        }

        let out_level = abs_level + 1;
        // Allocating the output idx may cascade a merge of the level above
        // first.
        let idx = self.allocate_segdir_idx(out_level)?;
        let ignore_empty = self.is_oldest(abs_level)?;

        let mut cursor = MultiSegmentCursor::new(self.config.order, ignore_empty);
        for (age, entry) in inputs.iter().rev().enumerate() {
            let mut reader = SegmentReader::new(self.store.clone(), entry.clone(), age as u64);
            if reader.scan_all()? {
                cursor.add(Box::new(reader));
            }
        }

        let mut writer = SegmentWriter::new(self.store.as_ref(), self.config.node_size)?;
        while cursor.step()? {
            writer.add(cursor.term(), cursor.doclist())?;
        }
        let merged = writer.finish(out_level, idx)?;

        for entry in &inputs {
            self.delete_segment(entry)?;
        }
        if let Some(entry) = merged {
            self.store.segdir_put(&entry)?;
        }
        Ok(())
    }

    /// Merge every segment of `(langid, index)` into a single segment at
    /// the highest occupied level. Returns false when there was nothing to
    /// merge.
    pub fn optimize(&self, langid: i64, index: usize) -> Result<bool> {
        let base = crate::segment::base_level(self.config, langid, index);
        let inputs = self.store.segdir_range(base, base + LEVEL_MAX - 1)?;
        if inputs.len() <= 1 {
            return Ok(false);
        }
        let out_level = inputs.iter().map(|e| e.level).max().unwrap_or(base);

        // Newest data first: lowest level, then highest idx within it.
        let mut by_age = inputs.clone();
        by_age.sort_by(|a, b| a.level.cmp(&b.level).then(b.idx.cmp(&a.idx)));

        let mut cursor = MultiSegmentCursor::new(self.config.order, true);
        for (age, entry) in by_age.iter().enumerate() {
            let mut reader = SegmentReader::new(self.store.clone(), entry.clone(), age as u64);
            if reader.scan_all()? {
                cursor.add(Box::new(reader));
            }
        }

        let mut writer = SegmentWriter::new(self.store.as_ref(), self.config.node_size)?;
        while cursor.step()? {
            writer.add(cursor.term(), cursor.doclist())?;
        }
        let merged = writer.finish(out_level, 0)?;

        for entry in &inputs {
            self.delete_segment(entry)?;
        }
        if let Some(entry) = merged {
            self.store.segdir_put(&entry)?;
        }
        Ok(true)
    }

    /// Do up to `n_leaf` leaf blocks of incremental merge work, preferring
    /// the level recorded in the resumption hint and otherwise the lowest
    /// level holding at least `n_min` segments.
    pub fn incr_merge(&self, n_leaf: usize, n_min: usize) -> Result<MergeStats> {
        let mut stats = MergeStats::default();
        let mut budget = n_leaf.max(1);
        let mut hint = self.read_hint()?;

        while budget > 0 {
            let resumed;
            let (level, n_in) = loop {
                match hint.last().copied() {
                    Some((level, n_in)) => {
                        // A single remaining input is still resumable: it
                        // drains into the appendable output.
                        if self.store.segdir_level(level)?.len() >= n_in && n_in >= 1 {
                            resumed = true;
                            break (level, n_in);
                        }
                        hint.pop(); // stale
                    }
                    None => match self.pick_level(n_min.max(2))? {
                        Some(choice) => {
                            resumed = false;
                            break choice;
                        }
                        None => {
                            self.write_hint(&hint)?;
                            return Ok(stats);
                        }
                    },
                }
            };
            if !resumed {
                hint.push((level, n_in));
            }

            let outcome = self.incr_merge_level(level, n_in, budget)?;
            stats.leaves_written += outcome.leaves;
            budget = budget.saturating_sub(outcome.leaves.max(1));
            match outcome.remaining_inputs {
                None => {
                    hint.pop();
                    stats.segments_merged += n_in;
                    stats.levels_completed += 1;
                }
                Some(remaining) => {
                    hint.pop();
                    if remaining >= 1 {
                        hint.push((level, remaining));
                    }
                }
            }
        }

        self.write_hint(&hint)?;
        Ok(stats)
    }

    /// The lowest absolute level with at least `threshold` segments, with
    /// its segment count. Levels at the relative cap are skipped.
    fn pick_level(&self, threshold: usize) -> Result<Option<(i64, usize)>> {
        let mut counts: AHashMap<i64, usize> = AHashMap::new();
        for entry in self.store.segdir_all()? {
            *counts.entry(entry.level).or_insert(0) += 1;
        }
        Ok(counts
            .into_iter()
            .filter(|&(level, n)| n >= threshold && level.rem_euclid(LEVEL_MAX) + 1 < LEVEL_MAX)
            .min_by_key(|&(level, _)| level))
    }

    fn incr_merge_level(&self, abs_level: i64, n_in: usize, budget: usize) -> Result<IncrOutcome> {
        let all = self.store.segdir_level(abs_level)?;
        if all.len() < n_in || n_in == 0 {
            return Ok(IncrOutcome {
                leaves: 0,
                remaining_inputs: None,
            });
        }
        let inputs = &all[..n_in];
        let out_level = abs_level + 1;

        // An existing appendable output is marked by a NULL sentinel at its
        // end block. The newest one is the only resumption candidate; an
        // older one left behind by a rejected resume is plain data now.
        let mut candidate: Option<SegdirEntry> = None;
        for row in self.store.segdir_level(out_level)? {
            if row.start_block > 0 && self.store.block_is_null(row.end_block)? {
                candidate = Some(row);
            }
        }
        let candidate_key = candidate.as_ref().map(|e| (e.level, e.idx));

        let mut readers: Vec<SegmentReader> = Vec::new();
        for (pos, entry) in inputs.iter().enumerate() {
            let age = (n_in - 1 - pos) as u64;
            let mut reader = SegmentReader::new(self.store.clone(), entry.clone(), age);
            if reader.scan_all()? {
                readers.push(reader);
            }
        }
        let first_term: Option<Vec<u8>> = readers.iter().map(|r| r.term().to_vec()).min();

        let mut loaded = match &candidate {
            Some(entry) => Some(IncrMergeWriter::load(
                self.store.as_ref(),
                self.config.node_size,
                entry,
            )?),
            None => None,
        };
        // Resumption is only legal when the first merged term lands past
        // everything the candidate already holds; otherwise the candidate
        // stays as it is and a fresh output segment is used.
        let resumable = match (&loaded, &first_term) {
            (Some(w), Some(term)) => w.can_append(term),
            _ => false,
        };
        if !resumable {
            loaded = None;
        }

        // Tombstones may be dropped only when nothing older than the inputs
        // exists outside this merge. A candidate that is not being resumed
        // stays live at the output level and must still be shadowed.
        let (_, top) = self.index_range(abs_level);
        let ignore_empty = self
            .store
            .segdir_range(out_level, top)?
            .iter()
            .all(|e| resumable && Some((e.level, e.idx)) == candidate_key);

        let mut cursor = MultiSegmentCursor::new(self.config.order, ignore_empty);
        for reader in readers {
            cursor.add(Box::new(reader));
        }

        let input_leaves: i64 = inputs
            .iter()
            .map(|e| {
                if e.start_block > 0 {
                    e.leaves_end_block - e.start_block + 1
                } else {
                    1
                }
            })
            .sum();

        let mut writer: Option<IncrMergeWriter> = None;
        let mut exhausted = false;
        loop {
            if writer
                .as_ref()
                .is_some_and(|w| w.leaves_this_session() >= budget)
            {
                break;
            }
            if !cursor.step()? {
                exhausted = true;
                break;
            }
            if writer.is_none() {
                writer = Some(match loaded.take() {
                    Some(resumed) => resumed,
                    None => IncrMergeWriter::new(
                        self.store.as_ref(),
                        self.config.node_size,
                        out_level,
                        self.next_idx(out_level)?,
                        input_leaves,
                    )?,
                });
            }
            if let Some(w) = writer.as_mut() {
                w.add(cursor.term(), cursor.doclist())?;
            }
        }

        // A budget stop that lands exactly on the last term is a completed
        // merge.
        if !exhausted && !cursor.advance_term()? {
            exhausted = true;
        }

        if exhausted {
            let mut leaves = 0;
            if let Some(w) = writer {
                leaves = w.leaves_this_session();
                let out_key = (w.level(), w.idx());
                let entry = self.maybe_promote(w.finalize()?)?;
                if (entry.level, entry.idx) != out_key {
                    self.store.segdir_delete(out_key.0, out_key.1)?;
                }
                self.store.segdir_put(&entry)?;
            }
            for entry in inputs {
                self.delete_segment(entry)?;
            }
            self.repack_level(abs_level)?;
            return Ok(IncrOutcome {
                leaves,
                remaining_inputs: None,
            });
        }

        // Budget exhausted mid-stream: persist the appendable output and
        // bring the inputs in line with what was consumed.
        let mut resume_terms: AHashMap<u64, Vec<u8>> = AHashMap::new();
        for reader in cursor.take_readers() {
            resume_terms.insert(reader.age(), reader.term().to_vec());
        }
        for (pos, entry) in inputs.iter().enumerate() {
            let age = (n_in - 1 - pos) as u64;
            match resume_terms.get(&age) {
                Some(term) => self.truncate_segment(entry, term)?,
                None => self.delete_segment(entry)?,
            }
        }
        self.repack_level(abs_level)?;

        let mut leaves = 0;
        if let Some(w) = writer {
            leaves = w.leaves_this_session();
            let entry = w.release()?;
            self.store.segdir_put(&entry)?;
        }
        Ok(IncrOutcome {
            leaves,
            remaining_inputs: Some(resume_terms.len()),
        })
    }

    /// Move a finished output segment up to the highest occupied level of
    /// its index when its leaf size exceeds that of every segment above it.
    fn maybe_promote(&self, mut entry: SegdirEntry) -> Result<SegdirEntry> {
        let (_, top) = self.index_range(entry.level);
        let above = self.store.segdir_range(entry.level + 1, top)?;
        if above.is_empty() {
            return Ok(entry);
        }
        if above.iter().all(|e| e.leaf_bytes < entry.leaf_bytes) {
            let target = above.iter().map(|e| e.level).max().unwrap_or(entry.level);
            entry.level = target;
            entry.idx = self.next_idx(target)?;
        }
        Ok(entry)
    }

    /// Drop every key strictly below `term` from a partially consumed
    /// input segment: the interior path down to `term`'s leaf is rewritten
    /// in place, the leaf itself is rebuilt, `start_block` advances and the
    /// orphaned leading leaf blocks are deleted.
    fn truncate_segment(&self, entry: &SegdirEntry, term: &[u8]) -> Result<()> {
        let mut entry = entry.clone();

        if entry.start_block == 0 {
            let kept = truncate_leaf(&entry.root, term)?;
            entry.root = kept;
            return self.store.segdir_put(&entry);
        }

        let mut node = entry.root.clone();
        let mut node_block: Option<i64> = None;
        let mut new_root: Option<Vec<u8>> = None;
        let new_start;
        loop {
            let (height, _) = node_height(&node)?;
            if height == 0 {
                let block = node_block.unwrap_or(entry.start_block);
                let kept = truncate_leaf(&node, term)?;
                self.store.block_put(block, &kept)?;
                if new_root.is_none() {
                    new_root = Some(kept);
                }
                new_start = block;
                break;
            }

            let (h, leftmost, seps) = decode_interior(&node)?;
            let drop = seps
                .iter()
                .take_while(|s| s.as_slice() <= term)
                .count();
            let new_leftmost = leftmost + drop as i64;

            if new_root.is_none() && drop == seps.len() {
                // Single surviving child: collapse it into the root slot
                // and keep descending.
                node = self.store.block_get(new_leftmost)?;
                node_block = Some(new_leftmost);
                continue;
            }

            let rebuilt = encode_interior(h, new_leftmost, &seps[drop..]);
            match node_block {
                None => new_root = Some(rebuilt),
                Some(block) => {
                    self.store.block_put(block, &rebuilt)?;
                    if new_root.is_none() {
                        new_root = Some(rebuilt);
                    }
                }
            }
            node = self.store.block_get(new_leftmost)?;
            node_block = Some(new_leftmost);
        }

        if new_start > entry.start_block {
            self.store
                .block_delete_range(entry.start_block, new_start - 1)?;
        }
        entry.start_block = new_start;
        if let Some(root) = new_root {
            entry.root = root;
        }
        self.store.segdir_put(&entry)
    }

    /// Resumption hint: a stack of `(absolute level, input count)` varint
    /// pairs at stat id 1; the top of the stack is the level to resume.
    fn read_hint(&self) -> Result<Vec<(i64, usize)>> {
        let Some(blob) = self.store.stat_get(STAT_INCRMERGE_HINT)? else {
            return Ok(Vec::new());
        };
        let mut reader = ByteReader::new(&blob);
        let mut hint = Vec::new();
        while !reader.is_empty() {
            let level = reader.varint()? as i64;
            let n_in = reader.varint()? as usize;
            hint.push((level, n_in));
        }
        Ok(hint)
    }

    fn write_hint(&self, hint: &[(i64, usize)]) -> Result<()> {
        if hint.is_empty() {
            return self.store.stat_delete(STAT_INCRMERGE_HINT);
        }
        let mut blob = Vec::new();
        for &(level, n_in) in hint {
            put_u64(&mut blob, level as u64);
            put_u64(&mut blob, n_in as u64);
        }
        self.store.stat_put(STAT_INCRMERGE_HINT, &blob)
    }
}

struct IncrOutcome {
    leaves: usize,
    /// `None` when the level's merge ran to completion.
    remaining_inputs: Option<usize>,
}

/// One partially built node of an appendable segment. Unlike the plain
/// segment writer, child references are real block ids: every layer's
/// blocks are consecutive within its reserved range, so `leftmost + i`
/// still resolves child `i`.
#[derive(Debug)]
struct NodeWriter {
    height: usize,
    /// Block slot the current node will occupy.
    slot: i64,
    /// Node body without the height/leftmost header.
    body: Vec<u8>,
    last_term: Vec<u8>,
    n_entries: usize,
    /// Leftmost child block id (interior layers only).
    leftmost: i64,
}

impl NodeWriter {
    fn new(height: usize, slot: i64, leftmost: i64) -> Self {
        NodeWriter {
            height,
            slot,
            body: Vec::new(),
            last_term: Vec::new(),
            n_entries: 0,
            leftmost,
        }
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + INTERIOR_HEADER_RESERVE);
        put_u64(&mut out, self.height as u64);
        if self.height > 0 {
            put_u64(&mut out, self.leftmost as u64);
        }
        out.extend_from_slice(&self.body);
        out
    }

    fn leaf_entry_size(&self, term: &[u8], doclist_len: usize) -> usize {
        let tail = varint_len(doclist_len as u64) + doclist_len;
        if self.n_entries == 0 {
            varint_len(term.len() as u64) + term.len() + tail
        } else {
            let prefix = shared_prefix(&self.last_term, term);
            let suffix = term.len() - prefix;
            varint_len(prefix as u64) + varint_len(suffix as u64) + suffix + tail
        }
    }

    fn add_leaf_entry(&mut self, term: &[u8], doclist: &[u8]) {
        if self.n_entries == 0 {
            put_u64(&mut self.body, term.len() as u64);
            self.body.extend_from_slice(term);
        } else {
            let prefix = shared_prefix(&self.last_term, term);
            put_u64(&mut self.body, prefix as u64);
            put_u64(&mut self.body, (term.len() - prefix) as u64);
            self.body.extend_from_slice(&term[prefix..]);
        }
        put_u64(&mut self.body, doclist.len() as u64);
        self.body.extend_from_slice(doclist);
        self.set_last_term(term);
        self.n_entries += 1;
    }

    fn separator_size(&self, term: &[u8]) -> usize {
        if self.n_entries == 0 {
            varint_len(term.len() as u64) + term.len()
        } else {
            let prefix = shared_prefix(&self.last_term, term);
            let suffix = term.len() - prefix;
            varint_len(prefix as u64) + varint_len(suffix as u64) + suffix
        }
    }

    fn add_separator(&mut self, term: &[u8]) {
        if self.n_entries == 0 {
            put_u64(&mut self.body, term.len() as u64);
            self.body.extend_from_slice(term);
        } else {
            let prefix = shared_prefix(&self.last_term, term);
            put_u64(&mut self.body, prefix as u64);
            put_u64(&mut self.body, (term.len() - prefix) as u64);
            self.body.extend_from_slice(&term[prefix..]);
        }
        self.set_last_term(term);
        self.n_entries += 1;
    }

    fn set_last_term(&mut self, term: &[u8]) {
        self.last_term.clear();
        self.last_term.extend_from_slice(term);
    }

    fn reset(&mut self, leftmost: i64) {
        self.slot += 1;
        self.body.clear();
        self.last_term.clear();
        self.n_entries = 0;
        self.leftmost = leftmost;
    }
}

/// Writer for an appendable output segment.
///
/// The block range is reserved at creation: `MAX_APPENDABLE_HEIGHT` layers
/// of `2 × Σ input leaf blocks` slots each, with a NULL sentinel blob at
/// the final block marking the segment as appendable. A later session
/// reloads the partial rightmost spine from disk and keeps appending.
pub(crate) struct IncrMergeWriter<'s> {
    store: &'s dyn IndexStore,
    node_size: usize,
    level: i64,
    idx: i32,
    start_block: i64,
    /// Reserved slots per layer.
    layer_size: i64,
    /// Sentinel block id, also the segdir row's end block.
    end_block: i64,
    layers: Vec<NodeWriter>,
    last_term: Vec<u8>,
    /// Bytes of completed leaves, excluding the open partial leaf.
    leaf_bytes: i64,
    leaves_session: usize,
    any_term: bool,
}

impl<'s> IncrMergeWriter<'s> {
    fn new(
        store: &'s dyn IndexStore,
        node_size: usize,
        level: i64,
        idx: i32,
        input_leaves: i64,
    ) -> Result<Self> {
        let layer_size = (input_leaves * 2).max(1);
        let start_block = store.segdir_max_block()? + 1;
        let end_block = start_block + MAX_APPENDABLE_HEIGHT * layer_size - 1;
        store.block_put_null(end_block)?;
        Ok(IncrMergeWriter {
            store,
            node_size,
            level,
            idx,
            start_block,
            layer_size,
            end_block,
            layers: vec![NodeWriter::new(0, start_block, 0)],
            last_term: Vec::new(),
            leaf_bytes: 0,
            leaves_session: 0,
            any_term: false,
        })
    }

    /// Reload the partial rightmost spine of an existing appendable
    /// segment. Each layer's open node was written to its slot by the
    /// previous session's release; block-id arithmetic locates them from
    /// the root down.
    fn load(store: &'s dyn IndexStore, node_size: usize, entry: &SegdirEntry) -> Result<Self> {
        let reserved = entry.end_block - entry.start_block + 1;
        if reserved < MAX_APPENDABLE_HEIGHT || reserved % MAX_APPENDABLE_HEIGHT != 0 {
            return Err(SedgeError::corrupt("malformed appendable segment range"));
        }
        let layer_size = reserved / MAX_APPENDABLE_HEIGHT;

        let (root_height, _) = node_height(&entry.root)?;
        let mut spine: Vec<NodeWriter> = Vec::new();

        let mut node = entry.root.clone();
        let mut height = root_height as usize;
        // The top layer has no completed nodes, so its open node sits at
        // the start of its reserved range.
        let mut slot = entry.start_block + height as i64 * layer_size;
        loop {
            if height == 0 {
                let (last_term, n_entries) = leaf_tail(&node)?;
                if slot != entry.leaves_end_block {
                    return Err(SedgeError::corrupt("appendable leaf spine mismatch"));
                }
                let mut writer = NodeWriter::new(0, slot, 0);
                writer.body = node[1..].to_vec();
                writer.last_term = last_term;
                writer.n_entries = n_entries;
                spine.push(writer);
                break;
            }
            let (h, leftmost, seps) = decode_interior(&node)?;
            if h != height as u64 {
                return Err(SedgeError::corrupt("appendable spine height mismatch"));
            }
            let header_len = varint_len(h) + varint_len(leftmost as u64);
            let mut writer = NodeWriter::new(height, slot, leftmost);
            writer.body = node[header_len..].to_vec();
            writer.n_entries = seps.len();
            if let Some(last) = seps.last() {
                writer.last_term = last.clone();
            }
            // The in-progress child is the one past the recorded
            // separators.
            let child = leftmost + seps.len() as i64;
            spine.push(writer);
            height -= 1;
            slot = child;
            node = store.block_get(child)?;
        }

        spine.reverse();
        let last_term = spine[0].last_term.clone();
        let partial_leaf_len = spine[0].body.len() as i64 + 1;
        let layers = spine;

        Ok(IncrMergeWriter {
            store,
            node_size,
            level: entry.level,
            idx: entry.idx,
            start_block: entry.start_block,
            layer_size,
            end_block: entry.end_block,
            layers,
            last_term,
            leaf_bytes: entry.leaf_bytes - partial_leaf_len,
            leaves_session: 0,
            any_term: true,
        })
    }

    fn level(&self) -> i64 {
        self.level
    }

    fn idx(&self) -> i32 {
        self.idx
    }

    fn leaves_this_session(&self) -> usize {
        self.leaves_session
    }

    /// A reloaded segment accepts only terms past everything it already
    /// holds.
    fn can_append(&self, term: &[u8]) -> bool {
        !self.any_term || term > self.last_term.as_slice()
    }

    fn add(&mut self, term: &[u8], doclist: &[u8]) -> Result<()> {
        if self.any_term && term <= self.last_term.as_slice() {
            return Err(SedgeError::corrupt("appendable segment terms out of order"));
        }

        let leaf = &self.layers[0];
        if leaf.n_entries > 0
            && 1 + leaf.body.len() + leaf.leaf_entry_size(term, doclist.len()) > self.node_size
        {
            self.flush_node(0, term)?;
        }
        self.layers[0].add_leaf_entry(term, doclist);
        self.last_term.clear();
        self.last_term.extend_from_slice(term);
        self.any_term = true;
        Ok(())
    }

    /// Write the open node of `layer` to its slot and push the separator
    /// toward `next_term` into the parent layer, cascading on overflow.
    fn flush_node(&mut self, layer: usize, next_term: &[u8]) -> Result<()> {
        let bytes = self.layers[layer].serialize();
        let slot = self.layers[layer].slot;
        self.check_slot(layer, slot)?;
        self.store.block_put(slot, &bytes)?;
        if layer == 0 {
            self.leaf_bytes += bytes.len() as i64;
            self.leaves_session += 1;
        }

        let sep = separator(&self.layers[layer].last_term, next_term);
        self.layers[layer].reset(0);
        let mut new_child = slot + 1;

        let mut parent = layer + 1;
        loop {
            if parent as i64 >= MAX_APPENDABLE_HEIGHT {
                return Err(SedgeError::corrupt("appendable segment too tall"));
            }
            if self.layers.len() <= parent {
                let slot = self.start_block + parent as i64 * self.layer_size;
                self.layers
                    .push(NodeWriter::new(parent, slot, new_child - 1));
            }
            let node_size = self.node_size;
            let node = &mut self.layers[parent];

            let fits = node.n_entries == 0
                || INTERIOR_HEADER_RESERVE + node.body.len() + node.separator_size(&sep)
                    <= node_size;
            if fits {
                node.add_separator(&sep);
                return Ok(());
            }

            // Close this node; the splitting separator is promoted to the
            // next layer up, not stored here.
            let bytes = node.serialize();
            let slot = node.slot;
            node.reset(new_child);
            self.check_slot(parent, slot)?;
            self.store.block_put(slot, &bytes)?;

            new_child = slot + 1;
            parent += 1;
        }
    }

    fn check_slot(&self, layer: usize, slot: i64) -> Result<()> {
        let base = self.start_block + layer as i64 * self.layer_size;
        if slot < base || slot >= base + self.layer_size {
            return Err(SedgeError::corrupt("appendable segment layer overflow"));
        }
        Ok(())
    }

    /// End the session with the segment still appendable: every layer's
    /// open node goes to its slot, the top node doubles as the root.
    fn release(self) -> Result<SegdirEntry> {
        let mut leaf_bytes = self.leaf_bytes;
        for node in &self.layers {
            let bytes = node.serialize();
            self.check_slot(node.height, node.slot)?;
            self.store.block_put(node.slot, &bytes)?;
            if node.height == 0 {
                leaf_bytes += bytes.len() as i64;
            }
        }
        let root = self.layers[self.layers.len() - 1].serialize();
        Ok(SegdirEntry {
            level: self.level,
            idx: self.idx,
            start_block: self.start_block,
            leaves_end_block: self.layers[0].slot,
            end_block: self.end_block,
            leaf_bytes,
            root,
        })
    }

    /// The merge consumed all input: close the segment out as a normal
    /// one. The sentinel is deleted so the segment stops being appendable.
    fn finalize(self) -> Result<SegdirEntry> {
        self.store.block_delete_range(self.end_block, self.end_block)?;

        if self.layers.len() == 1 {
            // Everything fit in the open leaf: inline it like a small
            // flush.
            let root = self.layers[0].serialize();
            let leaf_bytes = self.leaf_bytes + root.len() as i64;
            return Ok(SegdirEntry {
                level: self.level,
                idx: self.idx,
                start_block: 0,
                leaves_end_block: 0,
                end_block: 0,
                leaf_bytes,
                root,
            });
        }

        let top = self.layers.len() - 1;
        let mut leaf_bytes = self.leaf_bytes;
        for node in &self.layers[..top] {
            let bytes = node.serialize();
            self.check_slot(node.height, node.slot)?;
            self.store.block_put(node.slot, &bytes)?;
            if node.height == 0 {
                leaf_bytes += bytes.len() as i64;
            }
        }
        let root = self.layers[top].serialize();
        Ok(SegdirEntry {
            level: self.level,
            idx: self.idx,
            start_block: self.start_block,
            leaves_end_block: self.layers[0].slot,
            end_block: self.layers[top - 1].slot,
            leaf_bytes,
            root,
        })
    }
}

/// Decode a leaf node and re-encode only the entries at or past `term`.
fn truncate_leaf(node: &[u8], term: &[u8]) -> Result<Vec<u8>> {
    let entries = decode_leaf(node)?;
    let mut out = NodeWriter::new(0, 0, 0);
    for (entry_term, doclist) in &entries {
        if entry_term.as_slice() >= term {
            out.add_leaf_entry(entry_term, doclist);
        }
    }
    Ok(out.serialize())
}

/// Decode every `(term, doclist)` record of a leaf node.
fn decode_leaf(node: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut reader = ByteReader::new(node);
    if reader.varint()? != 0 {
        return Err(SedgeError::corrupt("expected leaf node"));
    }
    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut term: Vec<u8> = Vec::new();
    while !reader.is_empty() {
        let (prefix, suffix) = if entries.is_empty() {
            (0, reader.varint()? as usize)
        } else {
            (reader.varint()? as usize, reader.varint()? as usize)
        };
        if prefix > term.len() {
            return Err(SedgeError::corrupt("term prefix overruns prior term"));
        }
        term.truncate(prefix);
        term.extend_from_slice(reader.bytes(suffix)?);
        let doclist_len = reader.varint()? as usize;
        let doclist = reader.bytes(doclist_len)?.to_vec();
        entries.push((term.clone(), doclist));
    }
    Ok(entries)
}

/// Last term and entry count of a leaf node.
fn leaf_tail(node: &[u8]) -> Result<(Vec<u8>, usize)> {
    let entries = decode_leaf(node)?;
    let n = entries.len();
    let last = entries.into_iter().next_back().map(|e| e.0).unwrap_or_default();
    Ok((last, n))
}

/// Decode an interior node into its height, leftmost child block id and
/// separator terms.
fn decode_interior(node: &[u8]) -> Result<(u64, i64, Vec<Vec<u8>>)> {
    let mut reader = ByteReader::new(node);
    let height = reader.varint()?;
    if height == 0 {
        return Err(SedgeError::corrupt("expected interior node"));
    }
    let leftmost = reader.varint()? as i64;
    let mut seps: Vec<Vec<u8>> = Vec::new();
    while !reader.is_empty() {
        let sep = if seps.is_empty() {
            let len = reader.varint()? as usize;
            reader.bytes(len)?.to_vec()
        } else {
            let prefix = reader.varint()? as usize;
            let suffix = reader.varint()? as usize;
            let prev = &seps[seps.len() - 1];
            if prefix > prev.len() {
                return Err(SedgeError::corrupt("separator prefix overruns prior term"));
            }
            let mut sep = prev[..prefix].to_vec();
            sep.extend_from_slice(reader.bytes(suffix)?);
            sep
        };
        seps.push(sep);
    }
    Ok((height, leftmost, seps))
}

fn encode_interior(height: u64, leftmost: i64, seps: &[Vec<u8>]) -> Vec<u8> {
    let mut node = NodeWriter::new(height as usize, 0, leftmost);
    for sep in seps {
        node.add_separator(sep);
    }
    node.serialize()
}
