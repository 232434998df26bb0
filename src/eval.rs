//! Query evaluation.
//!
//! A [`QueryCursor`] walks an expression arena over one index, yielding
//! matching docids in index order. The tree itself is immutable; all
//! mutable per-query state lives in a parallel [`NodeState`] array.
//!
//! Phrases run in one of two modes. The materialized mode collects each
//! token's merged doclist up front, phrase-merges them token by token and
//! then streams rows from the result. The incremental mode, used for
//! short ascending-order phrases whose prefix tokens have a dedicated
//! prefix index, advances lazy per-token docid streams to a common docid
//! and adjacency-tests one row at a time.
//!
//! Tokens whose doclists look expensive relative to the cheapest token
//! are deferred: they drop out of the segment fan-in, provisionally match
//! every row, and are validated after row selection by re-tokenizing the
//! stored text.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use ahash::AHashMap;

use crate::config::{IndexConfig, LEVEL_MAX};
use crate::doclist::{
    DocidOrder, PositionReader, PoslistWriter, doclist_or_merge, poslist_near_keep,
    poslist_phrase_merge, skip_position_list,
};
use crate::error::{Result, SedgeError};
use crate::expr::{Expr, ExprNode, NodeId, PhraseToken};
use crate::pending::PendingTerms;
use crate::segment::cursor::MultiSegmentCursor;
use crate::segment::reader::SegmentReader;
use crate::store::IndexStore;
use crate::tokenizer::Tokenizer;
use crate::varint::ByteReader;

/// A deferred token is validated only at this cost multiple of the
/// cheapest token in the query.
const DEFER_COST_FACTOR: usize = 16;

/// Phrases longer than this always materialize.
const INCREMENTAL_TOKEN_LIMIT: usize = 4;

/// Where a phrase's rows come from.
enum PhraseSource {
    /// Fully merged doclist, streamed in place.
    Doclist(Vec<u8>),
    /// Every token deferred: provisionally matches every document.
    All,
    /// Lazy per-token docid streams, one cursor per token.
    Incremental(Vec<MultiSegmentCursor>),
}

/// Mutable evaluation state for one expression node.
struct NodeState {
    eof: bool,
    started: bool,
    docid: i64,
    /// Current row's position list (phrase nodes).
    poslist: Vec<u8>,
    source: Option<PhraseSource>,
    /// Stream offset into a materialized doclist.
    read_pos: usize,
    prev: Option<i64>,
    /// Index into the all-docids list for fully deferred phrases.
    all_at: usize,
    /// Token count of the phrase, for NEAR span arithmetic.
    span: u64,
    /// Pending current entries of an incremental phrase, one per token.
    incr_current: Vec<Option<(i64, Vec<u8>)>>,
}

impl NodeState {
    fn new() -> Self {
        NodeState {
            eof: false,
            started: false,
            docid: 0,
            poslist: Vec::new(),
            source: None,
            read_pos: 0,
            prev: None,
            all_at: 0,
            span: 0,
            incr_current: Vec::new(),
        }
    }
}

/// Streaming cursor over the rows matching one parsed expression.
pub struct QueryCursor {
    store: Arc<dyn IndexStore>,
    config: IndexConfig,
    tokenizer: Arc<dyn Tokenizer>,
    langid: i64,
    expr: Expr,
    states: Vec<NodeState>,
    /// `(phrase, token index)` of every deferred token.
    deferred: Vec<(NodeId, usize)>,
    /// Phrases needing full row-text recomputation (any token deferred).
    affected_phrases: Vec<NodeId>,
    /// Docids of every content row, in index order; loaded only when some
    /// phrase is fully deferred.
    all_docids: Vec<i64>,
    interrupt: Arc<AtomicBool>,
    docid: i64,
    eof: bool,
}

impl QueryCursor {
    pub fn new(
        store: Arc<dyn IndexStore>,
        config: &IndexConfig,
        tokenizer: Arc<dyn Tokenizer>,
        pending: &PendingTerms,
        expr: Expr,
        langid: i64,
        interrupt: Arc<AtomicBool>,
    ) -> Result<QueryCursor> {
        let mut cursor = QueryCursor {
            store,
            config: config.clone(),
            tokenizer,
            langid,
            states: (0..expr.len()).map(|_| NodeState::new()).collect(),
            expr,
            deferred: Vec::new(),
            affected_phrases: Vec::new(),
            all_docids: Vec::new(),
            interrupt,
            docid: 0,
            eof: false,
        };
        cursor.prepare(pending)?;
        Ok(cursor)
    }

    /// Decide deferrals and set up every phrase's row source.
    fn prepare(&mut self, pending: &PendingTerms) -> Result<()> {
        let phrases = self.expr.phrases();
        let excluded = self.not_excluded_phrases();

        // Cost pass: pages of doclist data behind each token.
        let mut costs: Vec<(NodeId, usize, usize)> = Vec::new(); // (phrase, token, pages)
        for &phrase in &phrases {
            let ExprNode::Phrase { tokens } = self.expr.node(phrase) else {
                continue;
            };
            for (i, token) in tokens.iter().enumerate() {
                let pages = self.estimate_token_pages(pending, token)?;
                costs.push((phrase, i, pages));
            }
        }
        let min_pages = costs.iter().map(|&(_, _, p)| p).min().unwrap_or(0);

        // Deferral is off for OR queries (a deferred token provisionally
        // matches everything, which is only sound when every phrase is
        // conjunctive) and for tokens under a NOT exclusion.
        let mut deferred_set: AHashMap<(NodeId, usize), bool> = AHashMap::new();
        if !self.expr.contains_or() && costs.len() > 1 {
            let mut kept = 0usize;
            for &(phrase, i, pages) in &costs {
                let defer = !excluded.contains(&phrase)
                    && pages > min_pages.saturating_mul(DEFER_COST_FACTOR)
                    && pages > 1;
                if !defer {
                    kept += 1;
                }
                deferred_set.insert((phrase, i), defer);
            }
            // At least one token always stays index-driven.
            if kept == 0 {
                if let Some(&(phrase, i, _)) = costs.iter().min_by_key(|&&(_, _, p)| p) {
                    deferred_set.insert((phrase, i), false);
                }
            }
        }

        for &phrase in &phrases {
            let ExprNode::Phrase { tokens } = self.expr.node(phrase).clone() else {
                continue;
            };
            self.states[phrase].span = tokens.len() as u64;

            let live: Vec<(usize, &PhraseToken)> = tokens
                .iter()
                .enumerate()
                .filter(|(i, _)| !deferred_set.get(&(phrase, *i)).copied().unwrap_or(false))
                .collect();
            for i in 0..tokens.len() {
                if deferred_set.get(&(phrase, i)).copied().unwrap_or(false) {
                    self.deferred.push((phrase, i));
                    if !self.affected_phrases.contains(&phrase) {
                        self.affected_phrases.push(phrase);
                    }
                }
            }

            let source = if live.is_empty() {
                PhraseSource::All
            } else if self.incremental_eligible(&tokens, &live) {
                let mut streams = Vec::with_capacity(live.len());
                for &(_, token) in &live {
                    let mut cursor = self.token_cursor(pending, token)?;
                    if !cursor.advance_term()? {
                        // A token with no rows: the phrase matches nothing.
                        self.states[phrase].eof = true;
                    }
                    streams.push(cursor);
                }
                self.states[phrase].incr_current = vec![None; streams.len()];
                PhraseSource::Incremental(streams)
            } else {
                PhraseSource::Doclist(self.materialize_phrase(pending, &live)?)
            };
            self.states[phrase].source = Some(source);
        }

        if self
            .states
            .iter()
            .any(|s| matches!(s.source, Some(PhraseSource::All)))
        {
            self.all_docids = self.store.content_docids()?;
            if self.config.order == DocidOrder::Desc {
                self.all_docids.reverse();
            }
        }
        Ok(())
    }

    /// Phrase ids appearing under the exclude side of any NOT.
    fn not_excluded_phrases(&self) -> Vec<NodeId> {
        fn collect(expr: &Expr, id: NodeId, excluding: bool, out: &mut Vec<NodeId>) {
            match expr.node(id) {
                ExprNode::Phrase { .. } => {
                    if excluding {
                        out.push(id);
                    }
                }
                ExprNode::Near { left, right, .. }
                | ExprNode::And { left, right }
                | ExprNode::Or { left, right } => {
                    collect(expr, *left, excluding, out);
                    collect(expr, *right, excluding, out);
                }
                ExprNode::Not { include, exclude } => {
                    collect(expr, *include, excluding, out);
                    collect(expr, *exclude, true, out);
                }
            }
        }
        let mut out = Vec::new();
        collect(&self.expr, self.expr.root(), false, &mut out);
        out
    }

    fn incremental_eligible(&self, tokens: &[PhraseToken], live: &[(usize, &PhraseToken)]) -> bool {
        live.len() == tokens.len()
            && tokens.len() <= INCREMENTAL_TOKEN_LIMIT
            && self.config.order == DocidOrder::Asc
            && tokens.iter().all(|t| !t.first)
            && tokens
                .iter()
                .all(|t| !t.prefix || self.config.prefix_index_for(t.text.len()).is_some())
    }

    /// Open a positioned multi-segment cursor over one token's postings.
    fn token_cursor(&self, pending: &PendingTerms, token: &PhraseToken) -> Result<MultiSegmentCursor> {
        // An exact token reads the main index. A prefix token reads its
        // dedicated prefix index exactly when one covers its length, and
        // falls back to a range scan of the main index otherwise.
        let (index, scan_prefix) = if !token.prefix {
            (0, false)
        } else {
            match self.config.prefix_index_for(token.text.len()) {
                Some(ix) => (ix, false),
                None => (0, true),
            }
        };

        let base = crate::segment::base_level(&self.config, self.langid, index);
        let rows = self.store.segdir_range(base, base + LEVEL_MAX - 1)?;
        let mut by_age = rows;
        by_age.sort_by(|a, b| a.level.cmp(&b.level).then(b.idx.cmp(&a.idx)));

        let mut cursor = MultiSegmentCursor::new(self.config.order, true);
        if let Some(snapshot) = pending.cursor(index) {
            if pending.langid() == self.langid {
                if let Some(filtered) = snapshot.filtered(&token.text, scan_prefix) {
                    cursor.add(Box::new(filtered));
                }
            }
        }
        for (age, entry) in by_age.iter().enumerate() {
            let mut reader = SegmentReader::new(self.store.clone(), entry.clone(), age as u64 + 1);
            if reader.seek(&token.text, scan_prefix)? {
                cursor.add(Box::new(reader));
            }
        }
        Ok(cursor)
    }

    fn estimate_token_pages(&self, pending: &PendingTerms, token: &PhraseToken) -> Result<usize> {
        let mut cursor = self.token_cursor(pending, token)?;
        if !cursor.advance_term()? {
            return Ok(0);
        }
        Ok(cursor.doclist_size_estimate() / self.config.page_size + 1)
    }

    /// Collect one token's full doclist: the OR-union of every distinct
    /// matching term's merged doclist.
    fn token_doclist(&self, pending: &PendingTerms, token: &PhraseToken) -> Result<Vec<u8>> {
        let mut cursor = self.token_cursor(pending, token)?;
        let mut acc: Vec<u8> = Vec::new();
        while cursor.step()? {
            if acc.is_empty() {
                acc = cursor.doclist().to_vec();
            } else {
                acc = doclist_or_merge(&acc, cursor.doclist(), self.config.order)?;
            }
        }
        if token.first {
            acc = filter_first_positions(&acc, self.config.order)?;
        }
        Ok(acc)
    }

    /// Phrase-merge the live tokens of one phrase into its doclist, using
    /// the token-index gap as the merge distance so deferred holes line
    /// up.
    fn materialize_phrase(
        &self,
        pending: &PendingTerms,
        live: &[(usize, &PhraseToken)],
    ) -> Result<Vec<u8>> {
        let mut acc = self.token_doclist(pending, live[0].1)?;
        let mut acc_index = live[0].0;
        for &(i, token) in &live[1..] {
            let next = self.token_doclist(pending, token)?;
            acc = doclist_phrase_merge(&acc, &next, (i - acc_index) as u64, self.config.order)?;
            acc_index = i;
        }
        Ok(acc)
    }

    /// Advance to the next matching row. Returns false at end of results.
    pub fn next(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        loop {
            if self.interrupt.load(AtomicOrdering::Relaxed) {
                return Err(SedgeError::Interrupted);
            }
            self.advance(self.expr.root())?;
            if self.states[self.expr.root()].eof {
                self.eof = true;
                return Ok(false);
            }
            let docid = self.states[self.expr.root()].docid;
            if !self.deferred.is_empty() && !self.validate_deferred(docid)? {
                continue;
            }
            self.docid = docid;
            return Ok(true);
        }
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    /// The current row. Valid after `next` returned true.
    pub fn docid(&self) -> i64 {
        self.docid
    }

    /// Sorted positions of every matched phrase in `column` for the
    /// current row, for highlighting.
    pub fn positions(&self, column: u64) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        for phrase in self.expr.phrases() {
            let state = &self.states[phrase];
            if state.eof || state.docid != self.docid {
                continue;
            }
            let mut reader = PositionReader::new(&state.poslist);
            while let Some((col, pos)) = reader.next()? {
                if col == column {
                    out.push(pos);
                }
            }
        }
        out.sort_unstable();
        out.dedup();
        Ok(out)
    }

    /// The current row's position list for one phrase, as stored.
    pub fn phrase_poslist(&self, phrase: NodeId) -> &[u8] {
        let state = &self.states[phrase];
        if state.eof || state.docid != self.docid {
            &[]
        } else {
            &state.poslist
        }
    }

    /// Advance the subtree at `id` to its next matching docid.
    fn advance(&mut self, id: NodeId) -> Result<()> {
        match *self.expr.node(id) {
            ExprNode::Phrase { .. } => self.phrase_next(id),
            ExprNode::And { left, right } => {
                self.pair_start_or_step(id, left, right)?;
                self.align_pair(id, left, right, false)
            }
            ExprNode::Near { left, right, .. } => {
                self.pair_start_or_step(id, left, right)?;
                self.align_pair(id, left, right, true)
            }
            ExprNode::Or { left, right } => {
                let state_docid = self.states[id].docid;
                if !self.states[id].started {
                    self.states[id].started = true;
                    self.advance(left)?;
                    self.advance(right)?;
                } else {
                    // Step every child sitting on the yielded row.
                    for child in [left, right] {
                        if !self.states[child].eof && self.states[child].docid == state_docid {
                            self.advance(child)?;
                        }
                    }
                }
                self.or_settle(id, left, right)
            }
            ExprNode::Not { include, exclude } => {
                self.states[id].started = true;
                self.advance(include)?;
                self.not_settle(id, include, exclude)
            }
        }
    }

    /// Advance the subtree at `id` to the first docid at or past `target`.
    fn advance_to(&mut self, id: NodeId, target: i64) -> Result<()> {
        if self.states[id].eof {
            return Ok(());
        }
        if self.states[id].started
            && self.config.order.cmp(self.states[id].docid, target).is_ge()
        {
            return Ok(());
        }
        match *self.expr.node(id) {
            ExprNode::Phrase { .. } => {
                loop {
                    self.phrase_next(id)?;
                    let state = &self.states[id];
                    if state.eof || self.config.order.cmp(state.docid, target).is_ge() {
                        return Ok(());
                    }
                }
            }
            ExprNode::And { left, right } => {
                self.advance_to(left, target)?;
                self.advance_to(right, target)?;
                self.states[id].started = true;
                self.align_pair(id, left, right, false)
            }
            ExprNode::Near { left, right, .. } => {
                self.advance_to(left, target)?;
                self.advance_to(right, target)?;
                self.states[id].started = true;
                self.align_pair(id, left, right, true)
            }
            ExprNode::Or { left, right } => {
                self.advance_to(left, target)?;
                self.advance_to(right, target)?;
                self.states[id].started = true;
                self.or_settle(id, left, right)
            }
            ExprNode::Not { include, exclude } => {
                self.advance_to(include, target)?;
                self.states[id].started = true;
                self.not_settle(id, include, exclude)
            }
        }
    }

    fn pair_start_or_step(&mut self, id: NodeId, left: NodeId, right: NodeId) -> Result<()> {
        if !self.states[id].started {
            self.states[id].started = true;
            self.advance(left)?;
            self.advance(right)?;
        } else {
            self.advance(left)?;
        }
        Ok(())
    }

    /// Drive both children to a common docid; `near` additionally runs the
    /// position test and keeps searching on failure.
    fn align_pair(&mut self, id: NodeId, left: NodeId, right: NodeId, near: bool) -> Result<()> {
        loop {
            if self.states[left].eof || self.states[right].eof {
                self.states[id].eof = true;
                return Ok(());
            }
            let (l, r) = (self.states[left].docid, self.states[right].docid);
            match self.config.order.cmp(l, r) {
                std::cmp::Ordering::Less => self.advance_to(left, r)?,
                std::cmp::Ordering::Greater => self.advance_to(right, l)?,
                std::cmp::Ordering::Equal => {
                    // A chain carrying a deferred token has no positions to
                    // test yet; its test re-runs once the row text rebuilds
                    // them.
                    if !near || self.chain_has_deferred(id) || self.near_test(id)? {
                        self.states[id].docid = l;
                        return Ok(());
                    }
                    self.advance(left)?;
                }
            }
        }
    }

    fn or_settle(&mut self, id: NodeId, left: NodeId, right: NodeId) -> Result<()> {
        let l = &self.states[left];
        let r = &self.states[right];
        let docid = match (l.eof, r.eof) {
            (true, true) => {
                self.states[id].eof = true;
                return Ok(());
            }
            (false, true) => l.docid,
            (true, false) => r.docid,
            (false, false) => match self.config.order.cmp(l.docid, r.docid) {
                std::cmp::Ordering::Greater => r.docid,
                _ => l.docid,
            },
        };
        self.states[id].docid = docid;
        Ok(())
    }

    fn not_settle(&mut self, id: NodeId, include: NodeId, exclude: NodeId) -> Result<()> {
        loop {
            if self.states[include].eof {
                self.states[id].eof = true;
                return Ok(());
            }
            let docid = self.states[include].docid;
            self.advance_to(exclude, docid)?;
            if !self.states[exclude].eof && self.states[exclude].docid == docid {
                self.advance(include)?;
                continue;
            }
            self.states[id].docid = docid;
            return Ok(());
        }
    }

    /// True when any phrase of the NEAR chain at `id` carries a deferred
    /// token.
    fn chain_has_deferred(&self, id: NodeId) -> bool {
        if self.affected_phrases.is_empty() {
            return false;
        }
        let (phrases, _) = self.near_chain(id);
        phrases.iter().any(|p| self.affected_phrases.contains(p))
    }

    /// The phrases of a left-deep NEAR chain, leftmost first, with the
    /// distance joining each adjacent pair.
    fn near_chain(&self, id: NodeId) -> (Vec<NodeId>, Vec<u32>) {
        let mut phrases = Vec::new();
        let mut distances = Vec::new();
        fn walk(expr: &Expr, id: NodeId, phrases: &mut Vec<NodeId>, distances: &mut Vec<u32>) {
            match *expr.node(id) {
                ExprNode::Near {
                    left,
                    right,
                    distance,
                } => {
                    walk(expr, left, phrases, distances);
                    distances.push(distance);
                    phrases.push(right);
                }
                _ => phrases.push(id),
            }
        }
        walk(&self.expr, id, &mut phrases, &mut distances);
        (phrases, distances)
    }

    /// Position test for a NEAR subtree at the current docid: every
    /// phrase's positions are trimmed against its neighbors in both
    /// directions. On failure all chain poslists are zeroed so snippet
    /// consumers never highlight an unmatched clause.
    fn near_test(&mut self, id: NodeId) -> Result<bool> {
        let (phrases, distances) = self.near_chain(id);
        let mut ok = true;

        for i in 1..phrases.len() {
            let trimmed = poslist_near_keep(
                &self.states[phrases[i]].poslist,
                self.states[phrases[i]].span,
                &self.states[phrases[i - 1]].poslist,
                self.states[phrases[i - 1]].span,
                distances[i - 1] as u64,
            )?;
            if trimmed.is_empty() {
                ok = false;
                break;
            }
            self.states[phrases[i]].poslist = trimmed;
        }
        if ok {
            for i in (0..phrases.len() - 1).rev() {
                let trimmed = poslist_near_keep(
                    &self.states[phrases[i]].poslist,
                    self.states[phrases[i]].span,
                    &self.states[phrases[i + 1]].poslist,
                    self.states[phrases[i + 1]].span,
                    distances[i] as u64,
                )?;
                if trimmed.is_empty() {
                    ok = false;
                    break;
                }
                self.states[phrases[i]].poslist = trimmed;
            }
        }

        if !ok {
            for &phrase in &phrases {
                self.states[phrase].poslist.clear();
            }
        }
        Ok(ok)
    }

    /// Advance one phrase to its next row.
    fn phrase_next(&mut self, id: NodeId) -> Result<()> {
        let state = &mut self.states[id];
        if state.eof {
            return Ok(());
        }
        state.started = true;
        match state.source {
            Some(PhraseSource::Doclist(ref doclist)) => {
                if state.read_pos >= doclist.len() {
                    state.eof = true;
                    return Ok(());
                }
                let mut reader = ByteReader::new(&doclist[state.read_pos..]);
                let raw = reader.varint()?;
                state.read_pos += reader.offset();
                let docid = match state.prev {
                    None => raw as i64,
                    Some(prev) => self.config.order.apply_delta(prev, raw),
                };
                state.prev = Some(docid);
                let end = skip_position_list(doclist, state.read_pos)?;
                state.poslist = doclist[state.read_pos..end].to_vec();
                state.read_pos = end + 1;
                state.docid = docid;
                Ok(())
            }
            Some(PhraseSource::All) => {
                if state.all_at >= self.all_docids.len() {
                    state.eof = true;
                    return Ok(());
                }
                state.docid = self.all_docids[state.all_at];
                state.all_at += 1;
                state.poslist.clear();
                Ok(())
            }
            Some(PhraseSource::Incremental(_)) => self.incremental_phrase_next(id),
            None => {
                state.eof = true;
                Ok(())
            }
        }
    }

    fn incremental_phrase_next(&mut self, id: NodeId) -> Result<()> {
        loop {
            let state = &mut self.states[id];
            let Some(PhraseSource::Incremental(ref mut streams)) = state.source else {
                state.eof = true;
                return Ok(());
            };

            // Pull a fresh entry wherever the last row consumed one.
            for (i, stream) in streams.iter_mut().enumerate() {
                if state.incr_current[i].is_none() {
                    state.incr_current[i] = stream.next_docid()?;
                    if state.incr_current[i].is_none() {
                        state.eof = true;
                        return Ok(());
                    }
                }
            }

            // Drive every stream to the largest current docid.
            let target = state
                .incr_current
                .iter()
                .filter_map(|e| e.as_ref().map(|(d, _)| *d))
                .max()
                .unwrap_or(0);
            let mut aligned = true;
            for (i, stream) in streams.iter_mut().enumerate() {
                while let Some((docid, _)) = &state.incr_current[i] {
                    if *docid >= target {
                        break;
                    }
                    state.incr_current[i] = stream.next_docid()?;
                }
                match &state.incr_current[i] {
                    None => {
                        state.eof = true;
                        return Ok(());
                    }
                    Some((docid, _)) if *docid != target => aligned = false,
                    _ => {}
                }
            }
            if !aligned {
                continue;
            }

            // Adjacency test for this row.
            let mut acc = match &state.incr_current[0] {
                Some((_, poslist)) => poslist.clone(),
                None => Vec::new(),
            };
            for entry in &state.incr_current[1..] {
                let Some((_, poslist)) = entry else { break };
                acc = poslist_phrase_merge(&acc, poslist, 1)?;
                if acc.is_empty() {
                    break;
                }
            }

            for entry in state.incr_current.iter_mut() {
                *entry = None;
            }
            if acc.is_empty() {
                continue;
            }
            state.docid = target;
            state.poslist = acc;
            return Ok(());
        }
    }

    /// Recheck a candidate row against its deferred tokens by
    /// re-tokenizing the stored text. Affected phrases get their position
    /// lists rebuilt from the row itself.
    fn validate_deferred(&mut self, docid: i64) -> Result<bool> {
        let Some(row) = self.store.content_get(docid)? else {
            return Ok(false);
        };

        let affected = self.affected_phrases.clone();
        for &phrase in &affected {
            let ExprNode::Phrase { tokens } = self.expr.node(phrase).clone() else {
                continue;
            };
            // Skip phrases that are not part of this row's match (only
            // possible without OR when under NOT, which never defers).
            let mut token_lists: Vec<PoslistWriter> =
                (0..tokens.len()).map(|_| PoslistWriter::new()).collect();
            for (column, text) in row.columns.iter().enumerate() {
                for word in self.tokenizer.tokenize(text, self.langid)? {
                    for (i, token) in tokens.iter().enumerate() {
                        let matched = if token.prefix {
                            word.text.as_bytes().starts_with(&token.text)
                        } else {
                            word.text.as_bytes() == token.text.as_slice()
                        };
                        if matched && (!token.first || word.position == 0) {
                            token_lists[i].add(column as u64, word.position)?;
                        }
                    }
                }
            }

            let lists: Vec<Vec<u8>> = token_lists.into_iter().map(|w| w.into_bytes()).collect();
            let mut acc = lists[0].clone();
            for list in &lists[1..] {
                if acc.is_empty() {
                    break;
                }
                acc = poslist_phrase_merge(&acc, list, 1)?;
            }
            if acc.is_empty() {
                return Ok(false);
            }
            self.states[phrase].docid = docid;
            self.states[phrase].eof = false;
            self.states[phrase].poslist = acc;
        }

        // Re-run NEAR tests whose chains now carry rebuilt positions.
        for id in self.top_level_nears() {
            let (phrases, _) = self.near_chain(id);
            if phrases.iter().any(|p| self.affected_phrases.contains(p)) && !self.near_test(id)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// NEAR nodes not nested inside another NEAR.
    fn top_level_nears(&self) -> Vec<NodeId> {
        let mut inner: Vec<NodeId> = Vec::new();
        for id in 0..self.expr.len() {
            if let ExprNode::Near { left, right, .. } = self.expr.node(id) {
                for child in [*left, *right] {
                    if matches!(self.expr.node(child), ExprNode::Near { .. }) {
                        inner.push(child);
                    }
                }
            }
        }
        (0..self.expr.len())
            .filter(|id| {
                matches!(self.expr.node(*id), ExprNode::Near { .. }) && !inner.contains(id)
            })
            .collect()
    }
}

/// Phrase-merge two whole doclists: rows present in both, keeping each
/// row only when `right` holds a position exactly `distance` past one of
/// `left`. The output carries the tail token's positions.
fn doclist_phrase_merge(
    left: &[u8],
    right: &[u8],
    distance: u64,
    order: DocidOrder,
) -> Result<Vec<u8>> {
    let mut rl = crate::doclist::DoclistReader::new(left, order);
    let mut rr = crate::doclist::DoclistReader::new(right, order);
    let mut out = crate::doclist::DoclistWriter::new(order);

    let mut nl = rl.next()?;
    let mut nr = rr.next()?;
    while let (Some(el), Some(er)) = (nl, nr) {
        match order.cmp(el.docid, er.docid) {
            std::cmp::Ordering::Less => nl = rl.next()?,
            std::cmp::Ordering::Greater => nr = rr.next()?,
            std::cmp::Ordering::Equal => {
                let merged = poslist_phrase_merge(el.poslist, er.poslist, distance)?;
                if !merged.is_empty() {
                    out.push(el.docid, &merged)?;
                }
                nl = rl.next()?;
                nr = rr.next()?;
            }
        }
    }
    Ok(out.into_bytes())
}

/// Keep only column-initial positions in every entry of a doclist,
/// dropping rows with none. Applies the `^` anchor.
fn filter_first_positions(doclist: &[u8], order: DocidOrder) -> Result<Vec<u8>> {
    let mut reader = crate::doclist::DoclistReader::new(doclist, order);
    let mut out = crate::doclist::DoclistWriter::new(order);
    while let Some(entry) = reader.next()? {
        let mut positions = PositionReader::new(entry.poslist);
        let mut kept = PoslistWriter::new();
        while let Some((col, pos)) = positions.next()? {
            if pos == 0 {
                kept.add(col, 0)?;
            }
        }
        if !kept.is_empty() {
            out.push(entry.docid, &kept.into_bytes())?;
        }
    }
    Ok(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse;
    use crate::store::{ContentRow, MemoryStore};
    use crate::tokenizer::SimpleTokenizer;

    /// Index a handful of rows entirely through the pending buffer; the
    /// evaluator must see them without any segment flush.
    fn setup(rows: &[(i64, &str)]) -> (Arc<MemoryStore>, IndexConfig, PendingTerms) {
        let config = IndexConfig::new(vec!["body"]);
        let store = Arc::new(MemoryStore::new());
        let mut pending = PendingTerms::new(&config);
        let tokenizer = SimpleTokenizer::new();
        for &(docid, text) in rows {
            store
                .content_put(&ContentRow {
                    docid,
                    langid: 0,
                    columns: vec![text.to_string()],
                })
                .unwrap();
            pending.begin_document(docid, 0).unwrap();
            for token in tokenizer.tokenize(text, 0).unwrap() {
                pending
                    .add_token(docid, 0, token.position, token.text.as_bytes())
                    .unwrap();
            }
        }
        (store, config, pending)
    }

    fn run_query(
        store: &Arc<MemoryStore>,
        config: &IndexConfig,
        pending: &PendingTerms,
        query: &str,
    ) -> Vec<i64> {
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(SimpleTokenizer::new());
        let expr = parse(query, tokenizer.as_ref(), 0, config.max_expr_depth).unwrap();
        let dyn_store: Arc<dyn IndexStore> = store.clone();
        let mut cursor = QueryCursor::new(
            dyn_store,
            config,
            tokenizer,
            pending,
            expr,
            0,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        let mut out = Vec::new();
        while cursor.next().unwrap() {
            out.push(cursor.docid());
        }
        out
    }

    #[test]
    fn test_single_term_query() {
        let (store, config, pending) = setup(&[
            (1, "the quick brown fox"),
            (2, "a lazy dog"),
            (3, "fox and hound"),
        ]);
        assert_eq!(run_query(&store, &config, &pending, "fox"), vec![1, 3]);
        assert_eq!(run_query(&store, &config, &pending, "dog"), vec![2]);
        assert!(run_query(&store, &config, &pending, "wolf").is_empty());
    }

    #[test]
    fn test_and_or_not() {
        let (store, config, pending) = setup(&[
            (1, "quick fox"),
            (2, "quick dog"),
            (3, "lazy fox"),
            (4, "lazy dog"),
        ]);
        assert_eq!(run_query(&store, &config, &pending, "quick fox"), vec![1]);
        assert_eq!(
            run_query(&store, &config, &pending, "quick OR fox"),
            vec![1, 2, 3]
        );
        assert_eq!(
            run_query(&store, &config, &pending, "quick NOT fox"),
            vec![2]
        );
    }

    #[test]
    fn test_phrase_query() {
        let (store, config, pending) = setup(&[
            (1, "the quick brown fox"),
            (2, "brown the quick fox"),
            (3, "quick brown everywhere"),
        ]);
        assert_eq!(
            run_query(&store, &config, &pending, "\"quick brown\""),
            vec![1, 3]
        );
        assert_eq!(
            run_query(&store, &config, &pending, "\"quick brown fox\""),
            vec![1]
        );
    }

    #[test]
    fn test_first_token_anchor() {
        let (store, config, pending) =
            setup(&[(1, "fox on the run"), (2, "the fox ran")]);
        assert_eq!(run_query(&store, &config, &pending, "^fox"), vec![1]);
    }

    #[test]
    fn test_prefix_query_scans_main_index() {
        let (store, config, pending) = setup(&[
            (1, "forest trail"),
            (2, "fortress walls"),
            (3, "desert dunes"),
        ]);
        assert_eq!(run_query(&store, &config, &pending, "for*"), vec![1, 2]);
    }

    #[test]
    fn test_near_query() {
        let (store, config, pending) = setup(&[
            (1, "one fox x x dog"),
            (2, "two fox x x x x x dog"),
        ]);
        assert_eq!(
            run_query(&store, &config, &pending, "fox NEAR/3 dog"),
            vec![1]
        );
        assert_eq!(
            run_query(&store, &config, &pending, "fox NEAR/10 dog"),
            vec![1, 2]
        );
    }

    #[test]
    fn test_near_positions_zeroed_on_failure() {
        let (store, config, pending) = setup(&[(1, "fox far far far far dog cat")]);

        // "fox NEAR/1 dog" fails, "cat" alone would match; under an AND the
        // row is rejected outright.
        assert!(run_query(&store, &config, &pending, "cat fox NEAR/1 dog").is_empty());
    }

    #[test]
    fn test_positions_reported() {
        let (store, config, pending) = setup(&[(1, "fox dog fox")]);
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(SimpleTokenizer::new());
        let expr = parse("fox", tokenizer.as_ref(), 0, config.max_expr_depth).unwrap();
        let dyn_store: Arc<dyn IndexStore> = store.clone();
        let mut cursor = QueryCursor::new(
            dyn_store,
            &config,
            tokenizer,
            &pending,
            expr,
            0,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.positions(0).unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_interrupt_flag() {
        let (store, config, pending) = setup(&[(1, "fox")]);
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(SimpleTokenizer::new());
        let expr = parse("fox", tokenizer.as_ref(), 0, config.max_expr_depth).unwrap();
        let interrupt = Arc::new(AtomicBool::new(false));
        let dyn_store: Arc<dyn IndexStore> = store.clone();
        let mut cursor = QueryCursor::new(
            dyn_store,
            &config,
            tokenizer,
            &pending,
            expr,
            0,
            interrupt.clone(),
        )
        .unwrap();
        interrupt.store(true, AtomicOrdering::SeqCst);
        assert!(matches!(cursor.next(), Err(SedgeError::Interrupted)));
    }

    #[test]
    fn test_deferred_token_validation() {
        // "the" appears in every row with fat position lists; with a tiny
        // page size it crosses the deferral threshold while "ocelot" stays
        // cheap.
        let filler = "the ".repeat(200);
        let common_rows: Vec<String> = (1..=8)
            .map(|i| {
                if i == 3 {
                    format!("{filler} ocelot the end")
                } else {
                    format!("{filler} filler text")
                }
            })
            .collect();
        let rows: Vec<(i64, &str)> = common_rows
            .iter()
            .enumerate()
            .map(|(i, s)| (i as i64 + 1, s.as_str()))
            .collect();

        let (store, mut config, pending) = setup(&rows);
        config.page_size = 64;

        let tokenizer: Arc<dyn Tokenizer> = Arc::new(SimpleTokenizer::new());
        let expr = parse("\"ocelot the\"", tokenizer.as_ref(), 0, 12).unwrap();
        let dyn_store: Arc<dyn IndexStore> = store.clone();
        let mut cursor = QueryCursor::new(
            dyn_store,
            &config,
            tokenizer,
            &pending,
            expr,
            0,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        assert!(!cursor.deferred.is_empty(), "expected a deferred token");
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.docid(), 3);
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn test_near_with_deferred_token() {
        // Same shape as above, but the deferred token sits under a NEAR:
        // the position test has to wait until the row text rebuilds the
        // deferred phrase's positions.
        let filler = "the ".repeat(200);
        let common_rows: Vec<String> = (1..=8)
            .map(|i| {
                if i == 3 {
                    format!("{filler} ocelot the end")
                } else {
                    format!("{filler} filler text")
                }
            })
            .collect();
        let rows: Vec<(i64, &str)> = common_rows
            .iter()
            .enumerate()
            .map(|(i, s)| (i as i64 + 1, s.as_str()))
            .collect();

        let (store, mut config, pending) = setup(&rows);
        config.page_size = 64;

        let tokenizer: Arc<dyn Tokenizer> = Arc::new(SimpleTokenizer::new());
        let expr = parse("ocelot NEAR/2 the", tokenizer.as_ref(), 0, 12).unwrap();
        let dyn_store: Arc<dyn IndexStore> = store.clone();
        let mut cursor = QueryCursor::new(
            dyn_store,
            &config,
            tokenizer,
            &pending,
            expr,
            0,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        assert!(!cursor.deferred.is_empty(), "expected a deferred token");
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.docid(), 3);
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn test_near_with_deferred_token_rejects_distant_rows() {
        // The re-run NEAR test must still reject rows where the deferred
        // token's rebuilt positions are out of range.
        let filler = "the ".repeat(200);
        let far = format!("ocelot x x x x x {filler}");
        let mut rows: Vec<(i64, &str)> = Vec::new();
        let filler_rows: Vec<String> =
            (0..6).map(|_| format!("{filler} filler text")).collect();
        for (i, s) in filler_rows.iter().enumerate() {
            rows.push((i as i64 + 1, s.as_str()));
        }
        rows.push((7, far.as_str()));

        let (store, mut config, pending) = setup(&rows);
        config.page_size = 64;
        assert!(run_query(&store, &config, &pending, "ocelot NEAR/2 the").is_empty());
    }
}
