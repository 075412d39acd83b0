use crate::analysis::dict::Dict;
use crate::core::error::{Error, Result};
use crate::core::types::{DocId, Hitpos, hit_field, hit_is_field_end, hit_order_key, hit_pos};
use crate::index::doclist::{DocEntry, HitIter};
use crate::index::reader::SearchIndex;
use crate::query::ast::{QKeyword, QNode, QOp};

/// One matched hit handed to the ranker: query atom position plus the
/// packed in-field position.
pub type MatchedHit = (u32, Hitpos);

/// Per-keyword collection statistics, reported back to clients and
/// feeding the BM25 idf.
#[derive(Debug, Clone)]
pub struct TermStat {
    pub word: String,
    pub docs: u64,
    pub hits: u64,
}

/// One term's posting cursor with the node's field constraints applied.
pub struct TermNode<'a> {
    index: &'a SearchIndex,
    iter: crate::index::doclist::DocListIter<'a>,
    qpos: u32,
    field_start: bool,
    field_end: bool,
    field_mask: u32,
    max_field_pos: u32,
    cur: Option<DocEntry>,
}

impl<'a> TermNode<'a> {
    fn new(index: &'a SearchIndex, keyword: &QKeyword, field_mask: u32, max_field_pos: u32,
           dict: &mut dyn Dict, stats: &mut Vec<TermStat>) -> Self {
        let word_id = dict.word_id(keyword.word.as_bytes());
        let (iter, info) = index.doclist(word_id);
        stats.push(TermStat {
            word: keyword.word.clone(),
            docs: info.doc_count as u64,
            hits: info.hit_count,
        });
        TermNode {
            index,
            iter,
            qpos: keyword.atom_pos,
            field_start: keyword.field_start,
            field_end: keyword.field_end,
            field_mask,
            max_field_pos,
            cur: None,
        }
    }

    fn needs_hit_check(&self) -> bool {
        self.max_field_pos > 0 || self.field_start || self.field_end
    }

    fn hit_ok(&self, hit: Hitpos) -> bool {
        if self.field_mask & (1 << hit_field(hit)) == 0 {
            return false;
        }
        if self.max_field_pos > 0 && hit_pos(hit) > self.max_field_pos {
            return false;
        }
        if self.field_start && hit_pos(hit) != 1 {
            return false;
        }
        if self.field_end && !hit_is_field_end(hit) {
            return false;
        }
        true
    }

    /// Matched hits of the current document, constraint-filtered.
    fn matched_hits(&self) -> Vec<Hitpos> {
        let Some(entry) = &self.cur else { return Vec::new() };
        let mut out = Vec::new();
        let mut hits = HitIter::new(self.index.hitlists_bytes(), entry.hit_offset);
        while let Some(hit) = hits.next() {
            if self.hit_ok(hit) {
                out.push(hit);
            }
        }
        out
    }

    fn seek(&mut self, min_doc: DocId) -> Option<DocId> {
        if let Some(entry) = &self.cur {
            if entry.doc_id >= min_doc {
                return Some(entry.doc_id);
            }
        }
        loop {
            let Some(entry) = self.iter.next() else {
                self.cur = None;
                return None;
            };
            if entry.doc_id < min_doc {
                continue;
            }
            // the doclist field mask is an exact check unless a hit
            // level constraint is present
            if entry.field_mask & self.field_mask == 0 {
                continue;
            }
            let doc_id = entry.doc_id;
            self.cur = Some(entry);
            if self.needs_hit_check() && self.matched_hits().is_empty() {
                continue;
            }
            return Some(doc_id);
        }
    }

    fn current(&self) -> Option<DocId> {
        self.cur.as_ref().map(|e| e.doc_id)
    }

    fn inline_row(&self) -> &[u32] {
        self.cur.as_ref().map(|e| e.inline_row.as_slice()).unwrap_or(&[])
    }
}

/// Posting-iterator tree walked in docid order; the execution mirror
/// of the parsed query tree.
pub enum ExtNode<'a> {
    Term(TermNode<'a>),
    And(Vec<ExtNode<'a>>),
    Or(Vec<ExtNode<'a>>),
    AndNot { accept: Box<ExtNode<'a>>, reject: Box<ExtNode<'a>>, reject_doc: Option<DocId> },
    /// Phrase (window == 0) or proximity (window > 0) group.
    Prox { terms: Vec<TermNode<'a>>, window: i32 },
    Quorum { terms: Vec<TermNode<'a>>, need: u32 },
    Before(Vec<ExtNode<'a>>),
}

impl<'a> ExtNode<'a> {
    /// Builds the execution tree, registering keyword stats as it goes.
    pub fn build(
        node: &QNode,
        index: &'a SearchIndex,
        dict: &mut dyn Dict,
        stats: &mut Vec<TermStat>,
    ) -> Result<ExtNode<'a>> {
        match node {
            QNode::Plain {
                words,
                field_mask,
                max_field_pos,
                max_distance,
                is_phrase,
                is_quorum,
                quorum_n,
            } => {
                let terms: Vec<TermNode<'a>> = words
                    .iter()
                    .map(|w| TermNode::new(index, w, *field_mask, *max_field_pos, dict, stats))
                    .collect();
                if *is_quorum {
                    let need = (*quorum_n).min(terms.len() as u32).max(1);
                    if need as usize == terms.len() {
                        return Ok(ExtNode::And(terms.into_iter().map(ExtNode::Term).collect()));
                    }
                    return Ok(ExtNode::Quorum { terms, need });
                }
                if *is_phrase && terms.len() > 1 {
                    return Ok(ExtNode::Prox { terms, window: (*max_distance).max(0) });
                }
                if terms.len() == 1 {
                    return Ok(ExtNode::Term(terms.into_iter().next().unwrap()));
                }
                Ok(ExtNode::And(terms.into_iter().map(ExtNode::Term).collect()))
            }
            QNode::Op { op, children, .. } => {
                let mut built = Vec::with_capacity(children.len());
                for child in children {
                    built.push(ExtNode::build(child, index, dict, stats)?);
                }
                match op {
                    QOp::And => Ok(ExtNode::And(built)),
                    QOp::Or => Ok(ExtNode::Or(built)),
                    QOp::Before => Ok(ExtNode::Before(built)),
                    QOp::AndNot => {
                        let mut it = built.into_iter();
                        let accept = it.next()
                            .ok_or_else(|| Error::internal("ANDNOT without children"))?;
                        let reject = it.next()
                            .ok_or_else(|| Error::internal("ANDNOT without right side"))?;
                        Ok(ExtNode::AndNot {
                            accept: Box::new(accept),
                            reject: Box::new(reject),
                            reject_doc: None,
                        })
                    }
                    QOp::Not => Err(Error::query(
                        "query is non-computable (stray NOT operator)".to_string())),
                }
            }
        }
    }

    /// Positions every cursor at the first matching doc with id
    /// `>= min_doc` and returns it.
    pub fn seek(&mut self, min_doc: DocId) -> Option<DocId> {
        match self {
            ExtNode::Term(term) => term.seek(min_doc),
            ExtNode::And(children) => {
                let mut target = min_doc;
                'align: loop {
                    let mut max_doc = 0;
                    for child in children.iter_mut() {
                        let doc = child.seek(target)?;
                        max_doc = max_doc.max(doc);
                    }
                    for child in children.iter_mut() {
                        if child.seek(target)? != max_doc {
                            target = max_doc;
                            continue 'align;
                        }
                    }
                    return Some(max_doc);
                }
            }
            ExtNode::Or(children) => {
                let mut best: Option<DocId> = None;
                for child in children.iter_mut() {
                    if let Some(doc) = child.seek(min_doc) {
                        best = Some(best.map_or(doc, |b: DocId| b.min(doc)));
                    }
                }
                best
            }
            ExtNode::AndNot { accept, reject, reject_doc } => {
                let mut doc = accept.seek(min_doc)?;
                loop {
                    if reject_doc.is_none() || reject_doc.unwrap() < doc {
                        *reject_doc = reject.seek(doc);
                    }
                    match reject_doc {
                        Some(r) if *r == doc => {
                            doc = accept.seek(doc + 1)?;
                        }
                        _ => return Some(doc),
                    }
                }
            }
            ExtNode::Prox { terms, window } => {
                let window = *window;
                let mut target = min_doc;
                loop {
                    let doc = seek_all(terms, target)?;
                    if prox_match(terms, window).is_some() {
                        return Some(doc);
                    }
                    target = doc + 1;
                }
            }
            ExtNode::Quorum { terms, need } => {
                let need = *need as usize;
                loop {
                    // smallest current doc among live cursors
                    let mut best: Option<DocId> = None;
                    for term in terms.iter_mut() {
                        let floor = term.current().unwrap_or(0).max(min_doc);
                        if let Some(doc) = term.seek(floor) {
                            best = Some(best.map_or(doc, |b: DocId| b.min(doc)));
                        }
                    }
                    let doc = best?;
                    let have = terms
                        .iter()
                        .filter(|t| t.current() == Some(doc))
                        .count();
                    if have >= need {
                        return Some(doc);
                    }
                    // advance the cursors parked on this doc
                    for term in terms.iter_mut() {
                        if term.current() == Some(doc) {
                            term.seek(doc + 1);
                        }
                    }
                }
            }
            ExtNode::Before(children) => {
                let mut target = min_doc;
                loop {
                    let doc = seek_all_nodes(children, target)?;
                    if before_match(children, doc) {
                        return Some(doc);
                    }
                    target = doc + 1;
                }
            }
        }
    }

    pub fn current(&self) -> Option<DocId> {
        match self {
            ExtNode::Term(term) => term.current(),
            ExtNode::And(children) | ExtNode::Before(children) => {
                children.first().and_then(|c| c.current())
            }
            ExtNode::Or(children) => children
                .iter()
                .filter_map(|c| c.current())
                .min(),
            ExtNode::AndNot { accept, .. } => accept.current(),
            ExtNode::Prox { terms, .. } | ExtNode::Quorum { terms, .. } => {
                terms.iter().filter_map(|t| t.current()).min()
            }
        }
    }

    /// Collects `(qpos, hit)` pairs of the current doc for ranking.
    pub fn collect_hits(&self, doc: DocId, out: &mut Vec<MatchedHit>) {
        match self {
            ExtNode::Term(term) => {
                if term.current() == Some(doc) {
                    for hit in term.matched_hits() {
                        out.push((term.qpos, hit));
                    }
                }
            }
            ExtNode::And(children) | ExtNode::Before(children) => {
                for child in children {
                    child.collect_hits(doc, out);
                }
            }
            ExtNode::Or(children) => {
                for child in children {
                    if child.current() == Some(doc) {
                        child.collect_hits(doc, out);
                    }
                }
            }
            ExtNode::AndNot { accept, .. } => accept.collect_hits(doc, out),
            ExtNode::Prox { terms, .. } | ExtNode::Quorum { terms, .. } => {
                for term in terms {
                    if term.current() == Some(doc) {
                        for hit in term.matched_hits() {
                            out.push((term.qpos, hit));
                        }
                    }
                }
            }
        }
    }

    /// Attribute row attached to doclist entries (inline docinfo).
    pub fn inline_row(&self) -> &[u32] {
        match self {
            ExtNode::Term(term) => term.inline_row(),
            ExtNode::And(children) | ExtNode::Or(children) | ExtNode::Before(children) => {
                for child in children {
                    let row = child.inline_row();
                    if !row.is_empty() {
                        return row;
                    }
                }
                &[]
            }
            ExtNode::AndNot { accept, .. } => accept.inline_row(),
            ExtNode::Prox { terms, .. } | ExtNode::Quorum { terms, .. } => {
                for term in terms {
                    let row = term.inline_row();
                    if !row.is_empty() {
                        return row;
                    }
                }
                &[]
            }
        }
    }
}

fn seek_all(terms: &mut [TermNode<'_>], min_doc: DocId) -> Option<DocId> {
    let mut target = min_doc;
    'align: loop {
        let mut max_doc = 0;
        for term in terms.iter_mut() {
            max_doc = max_doc.max(term.seek(target)?);
        }
        for term in terms.iter_mut() {
            if term.seek(target)? != max_doc {
                target = max_doc;
                continue 'align;
            }
        }
        return Some(max_doc);
    }
}

fn seek_all_nodes(children: &mut [ExtNode<'_>], min_doc: DocId) -> Option<DocId> {
    let mut target = min_doc;
    'align: loop {
        let mut max_doc = 0;
        for child in children.iter_mut() {
            max_doc = max_doc.max(child.seek(target)?);
        }
        for child in children.iter_mut() {
            if child.seek(target)? != max_doc {
                target = max_doc;
                continue 'align;
            }
        }
        return Some(max_doc);
    }
}

/// Phrase/proximity evaluation over the aligned terms' hits. Returns
/// the matching field when the group matches the current doc.
///
/// A phrase (window 0) needs every term at its exact relative atom
/// position inside one field; proximity N allows the group to spread
/// over a window of `N + terms - 1` positions.
fn prox_match(terms: &[TermNode<'_>], window: i32) -> Option<u32> {
    let per_term: Vec<Vec<Hitpos>> = terms.iter().map(|t| t.matched_hits()).collect();
    if per_term.iter().any(|h| h.is_empty()) {
        return None;
    }
    let base_qpos = terms[0].qpos;

    if window == 0 {
        // exact phrase: h_i == h_0 + (qpos_i - qpos_0), same field
        let keys: Vec<Vec<u32>> = per_term
            .iter()
            .map(|hits| hits.iter().map(|&h| hit_order_key(h)).collect())
            .collect();
        'first: for &h0 in &per_term[0] {
            let anchor = hit_order_key(h0);
            for (i, term) in terms.iter().enumerate().skip(1) {
                let want = anchor + (term.qpos - base_qpos);
                if keys[i].binary_search(&want).is_err() {
                    continue 'first;
                }
            }
            return Some(hit_field(h0));
        }
        return None;
    }

    // proximity: all terms within (window + terms - 1) positions, one field
    let span = window as u32 + terms.len() as u32 - 1;
    let mut events: Vec<(u32, u32, usize)> = Vec::new(); // (field, pos, term)
    for (i, hits) in per_term.iter().enumerate() {
        for &h in hits {
            events.push((hit_field(h), hit_pos(h), i));
        }
    }
    events.sort_unstable();

    let nterms = terms.len();
    let mut have = vec![0u32; nterms];
    let mut distinct = 0;
    let mut lo = 0;
    for hi in 0..events.len() {
        if have[events[hi].2] == 0 {
            distinct += 1;
        }
        have[events[hi].2] += 1;
        // shrink: same field, span bound
        while events[lo].0 != events[hi].0
            || events[hi].1 - events[lo].1 + 1 > span
        {
            have[events[lo].2] -= 1;
            if have[events[lo].2] == 0 {
                distinct -= 1;
            }
            lo += 1;
        }
        if distinct == nterms {
            return Some(events[hi].0);
        }
    }
    None
}

/// `A << B << ..`: every child matches the doc, with hit positions in
/// strictly increasing packed order across children.
fn before_match(children: &mut [ExtNode<'_>], doc: DocId) -> bool {
    let mut floor = 0u32;
    for child in children.iter_mut() {
        let mut hits = Vec::new();
        child.collect_hits(doc, &mut hits);
        let next = hits
            .iter()
            .map(|&(_, h)| hit_order_key(h))
            .filter(|&k| k > floor)
            .min();
        match next {
            Some(k) => floor = k,
            None => return false,
        }
    }
    true
}

/// The all-documents iterator for fullscan queries (empty query text).
pub struct FullScan {
    doc_ids: Vec<DocId>,
    pos: usize,
}

impl FullScan {
    pub fn new(index: &SearchIndex) -> Self {
        FullScan { doc_ids: index.doc_ids(), pos: 0 }
    }

    pub fn seek(&mut self, min_doc: DocId) -> Option<DocId> {
        while self.pos < self.doc_ids.len() {
            if self.doc_ids[self.pos] >= min_doc {
                return Some(self.doc_ids[self.pos]);
            }
            self.pos += 1;
        }
        None
    }
}

/// Either a query-driven iterator or a fullscan.
pub enum DocStream<'a> {
    Ext(ExtNode<'a>),
    Scan(FullScan),
}

impl<'a> DocStream<'a> {
    pub fn seek(&mut self, min_doc: DocId) -> Option<DocId> {
        match self {
            DocStream::Ext(node) => node.seek(min_doc),
            DocStream::Scan(scan) => scan.seek(min_doc),
        }
    }

    pub fn collect_hits(&self, doc: DocId, out: &mut Vec<MatchedHit>) {
        if let DocStream::Ext(node) = self {
            node.collect_hits(doc, out);
        }
    }

    pub fn inline_row(&self) -> &[u32] {
        match self {
            DocStream::Ext(node) => node.inline_row(),
            DocStream::Scan(_) => &[],
        }
    }
}
