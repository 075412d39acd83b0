pub mod filter;
pub mod matcher;
pub mod ranker;

use std::sync::Arc;
use std::time::Instant;

use crate::analysis::dict::{Dict, StandardDict};
use crate::analysis::tokenizer::{StandardTokenizer, Tokenizer};
use crate::core::error::{Error, Result};
use crate::core::types::{DocId, MAX_FIELDS};
use crate::expr::parser::parse_expr;
use crate::expr::{EvalCtx, ExprNode, ExprType};
use crate::index::reader::SearchIndex;
use crate::index::segment::DocinfoMode;
use crate::query::ast::{QKeyword, QNode};
use crate::query::parser::QueryParser;
use crate::schema::attr::{AttrLocator, AttrType, PackedRow};
use crate::schema::row::Match;
use crate::schema::schema::{AttrDef, Schema};
use crate::search::filter::{BoundFilter, FilterSpec, KillFilter};
use crate::search::matcher::{DocStream, ExtNode, FullScan, TermStat};
use crate::search::ranker::{ranker_fn, Bm25Calc, RankContext, RankMode};
use crate::sort::compare::CompareSpec;
use crate::sort::groupby::{GroupBySorter, GroupSpec};
use crate::sort::topn::TopNSorter;
use crate::sort::Sorter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    All,
    Any,
    Phrase,
    Boolean,
    Extended,
    Fullscan,
}

impl MatchMode {
    pub fn from_wire(v: u32) -> Result<MatchMode> {
        Ok(match v {
            0 => MatchMode::All,
            1 => MatchMode::Any,
            2 => MatchMode::Phrase,
            3 => MatchMode::Boolean,
            4 | 6 => MatchMode::Extended,
            5 => MatchMode::Fullscan,
            other => return Err(Error::query(format!("unknown match mode {}", other))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    Relevance,
    AttrDesc,
    AttrAsc,
    TimeSegments,
    Extended,
    Expr,
}

impl SortMode {
    pub fn from_wire(v: u32) -> Result<SortMode> {
        Ok(match v {
            0 => SortMode::Relevance,
            1 => SortMode::AttrDesc,
            2 => SortMode::AttrAsc,
            3 => SortMode::TimeSegments,
            4 => SortMode::Extended,
            5 => SortMode::Expr,
            other => return Err(Error::query(format!("unknown sort mode {}", other))),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GeoAnchor {
    pub lat_attr: String,
    pub lon_attr: String,
    pub lat: f32,
    pub lon: f32,
}

/// One decoded search request, protocol-independent.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub offset: usize,
    pub limit: usize,
    pub mode: MatchMode,
    pub ranker: RankMode,
    pub sort_mode: SortMode,
    pub sort_by: String,
    pub query: String,
    pub weights: Vec<u32>,
    pub indexes: String,
    pub min_id: DocId,
    pub max_id: DocId,
    pub filters: Vec<FilterSpec>,
    pub group: Option<GroupSpec>,
    pub max_matches: usize,
    pub cutoff: usize,
    pub retry_count: u32,
    pub retry_delay_ms: u32,
    pub geo: Option<GeoAnchor>,
    pub index_weights: Vec<(String, u32)>,
    pub max_query_ms: u32,
    pub field_weights: Vec<(String, u32)>,
    pub comment: String,
    /// Per-query attribute overrides: `(attr, docid -> raw value)`.
    pub overrides: Vec<(String, std::collections::HashMap<DocId, u64>)>,
    pub select: String,
}

impl Default for SearchQuery {
    fn default() -> Self {
        SearchQuery {
            offset: 0,
            limit: 20,
            mode: MatchMode::Extended,
            ranker: RankMode::ProximityBm25,
            sort_mode: SortMode::Relevance,
            sort_by: String::new(),
            query: String::new(),
            weights: Vec::new(),
            indexes: "*".to_string(),
            min_id: 0,
            max_id: DocId::MAX,
            filters: Vec::new(),
            group: None,
            max_matches: 1000,
            cutoff: 0,
            retry_count: 0,
            retry_delay_ms: 0,
            geo: None,
            index_weights: Vec::new(),
            max_query_ms: 0,
            field_weights: Vec::new(),
            comment: String::new(),
            overrides: Vec::new(),
            select: "*".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WordStat {
    pub word: String,
    pub docs: u64,
    pub hits: u64,
}

/// One result set, ready for protocol encoding.
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub error: Option<String>,
    pub warning: Option<String>,
    pub matches: Vec<Match>,
    pub schema: Schema,
    pub total: u64,
    pub total_found: u64,
    pub time_ms: u64,
    pub words: Vec<WordStat>,
}

impl SearchResult {
    pub fn from_error(e: Error) -> Self {
        SearchResult { error: Some(e.context), ..Default::default() }
    }

    pub fn add_warning(&mut self, text: impl Into<String>) {
        let text = text.into();
        match &mut self.warning {
            Some(w) => {
                w.push_str("; ");
                w.push_str(&text);
            }
            None => self.warning = Some(text),
        }
    }
}

/// Computed row extension: the expression lands in an appended
/// virtual attribute before the match reaches filters and the sorter.
pub struct VirtualAttr {
    pub name: String,
    pub expr: ExprNode,
}

/// Appends virtual attributes as whole-word locators after the base row.
pub fn extend_schema(base: &Schema, virtuals: &[VirtualAttr]) -> Schema {
    let mut out = base.clone();
    let mut bit = (base.row_size * 32) as u32;
    for v in virtuals {
        let (kind, width) = match v.expr.ty() {
            ExprType::Float => (AttrType::Float32, 32),
            ExprType::Int64 => (AttrType::Int64, 64),
            ExprType::Int32 => (AttrType::Int32, 32),
        };
        out.attrs.push(AttrDef {
            name: v.name.clone(),
            kind,
            locator: AttrLocator { bit_offset: bit, bit_width: width },
        });
        bit += width;
    }
    out.row_size = (bit as usize).div_ceil(32);
    out
}

fn split_select(select: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut cur = String::new();
    for c in select.chars() {
        match c {
            '(' => {
                depth += 1;
                cur.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                cur.push(c);
            }
            ',' if depth == 0 => {
                out.push(cur.trim().to_string());
                cur.clear();
            }
            _ => cur.push(c),
        }
    }
    if !cur.trim().is_empty() {
        out.push(cur.trim().to_string());
    }
    out
}

/// Builds the virtual attribute list for one query: the geo anchor
/// distance, aliased select expressions, and the expression sort key.
fn build_virtuals(query: &SearchQuery, schema: &Schema) -> Result<Vec<VirtualAttr>> {
    let mut virtuals: Vec<VirtualAttr> = Vec::new();

    if let Some(geo) = &query.geo {
        let lat = schema.attr(&geo.lat_attr).ok_or_else(|| {
            Error::query(format!("no such latitude attribute '{}'", geo.lat_attr))
        })?;
        let lon = schema.attr(&geo.lon_attr).ok_or_else(|| {
            Error::query(format!("no such longitude attribute '{}'", geo.lon_attr))
        })?;
        virtuals.push(VirtualAttr {
            name: "@geodist".to_string(),
            expr: ExprNode::GeoDist(Box::new([
                ExprNode::Attr { loc: lat.locator, kind: lat.kind },
                ExprNode::Attr { loc: lon.locator, kind: lon.kind },
                ExprNode::ConstFloat(geo.lat),
                ExprNode::ConstFloat(geo.lon),
            ])),
        });
    }

    for item in split_select(&query.select) {
        if item == "*" {
            continue;
        }
        let lowered = item.to_ascii_lowercase();
        let (expr_text, alias) = match lowered.find(" as ") {
            Some(at) => (&item[..at], item[at + 4..].trim().to_string()),
            None => (item.as_str(), String::new()),
        };
        let expr_text = expr_text.trim();
        // bare attribute references pass through the row untouched
        if alias.is_empty() && schema.attr(expr_text).is_some() {
            continue;
        }
        let alias = if alias.is_empty() { expr_text.to_lowercase() } else { alias.to_lowercase() };
        if schema.attr(&alias).is_some() {
            return Err(Error::query(format!(
                "select alias '{}' shadows an attribute", alias)));
        }
        let expr = parse_expr(expr_text, schema)?;
        virtuals.push(VirtualAttr { name: alias, expr });
    }

    if query.sort_mode == SortMode::Expr {
        let expr = parse_expr(&query.sort_by, schema)?;
        virtuals.push(VirtualAttr { name: "@expr".to_string(), expr });
    }
    Ok(virtuals)
}

fn compare_spec(query: &SearchQuery, ext_schema: &Schema) -> Result<CompareSpec> {
    match query.sort_mode {
        SortMode::Relevance => Ok(CompareSpec::relevance()),
        SortMode::AttrDesc => {
            CompareSpec::parse(&format!("{} desc", query.sort_by), ext_schema)
        }
        SortMode::AttrAsc => CompareSpec::parse(&format!("{} asc", query.sort_by), ext_schema),
        SortMode::Extended => CompareSpec::parse(&query.sort_by, ext_schema),
        SortMode::Expr => {
            let attr = ext_schema
                .attr("@expr")
                .ok_or_else(|| Error::internal("sort expression attribute missing"))?;
            Ok(CompareSpec::by_attr(attr.locator, attr.kind == AttrType::Float32, false))
        }
        SortMode::TimeSegments => Err(Error::query(
            "time-segments sorting is not supported".to_string())),
    }
}

/// Builds the sorter for one query over the extended schema.
pub fn build_sorter(query: &SearchQuery, ext_schema: &Schema) -> Result<Box<dyn Sorter>> {
    let spec = compare_spec(query, ext_schema)?;
    match &query.group {
        Some(group) => Ok(Box::new(GroupBySorter::new(
            group,
            spec,
            query.max_matches,
            ext_schema,
        )?)),
        None => Ok(Box::new(TopNSorter::new(
            spec,
            query.max_matches,
            ext_schema.clone(),
        ))),
    }
}

fn field_weight_table(query: &SearchQuery, schema: &Schema) -> [i32; MAX_FIELDS] {
    let mut weights = [1i32; MAX_FIELDS];
    // legacy positional weights first, then named ones
    for (i, &w) in query.weights.iter().enumerate().take(MAX_FIELDS) {
        weights[i] = w.max(1) as i32;
    }
    for (name, w) in &query.field_weights {
        if let Some(i) = schema.field_index(name) {
            weights[i] = (*w).max(1) as i32;
        }
    }
    weights
}

/// Builds a query tree for the legacy non-boolean match modes.
fn legacy_tree(query: &str, mode: MatchMode, index: &SearchIndex) -> Result<Option<QNode>> {
    let mut tokenizer = StandardTokenizer::new(index.header.settings.min_word_len);
    let mut dict = StandardDict::new(index.header.settings.dict.clone())?;
    tokenizer.set_buffer(query.as_bytes());

    let mut words = Vec::new();
    let mut pos = 0u32;
    while let Some(token) = tokenizer.next() {
        pos += 1;
        let text = String::from_utf8_lossy(token).into_owned();
        if dict.word_id(text.as_bytes()) == 0 {
            continue;
        }
        words.push(QKeyword::new(text, pos));
    }
    if words.is_empty() {
        return Ok(None);
    }
    Ok(Some(match mode {
        MatchMode::Any => {
            QNode::op(crate::query::ast::QOp::Or, words.into_iter().map(QNode::keyword).collect())
        }
        MatchMode::Phrase => QNode::phrase(words, 0),
        _ => {
            if words.len() == 1 {
                QNode::keyword(words.into_iter().next().unwrap())
            } else {
                QNode::op(crate::query::ast::QOp::And, words.into_iter().map(QNode::keyword).collect())
            }
        }
    }))
}

struct IndexSearchOutcome {
    words: Vec<WordStat>,
    found: u64,
    warning: Option<String>,
}

/// Walks one index, pushing accepted matches into the shared sorter.
#[allow(clippy::too_many_arguments)]
fn search_one_index(
    index: &SearchIndex,
    query: &SearchQuery,
    tag: i32,
    index_weight: i32,
    kill: &KillFilter,
    virtuals: &[VirtualAttr],
    ext_schema: &Schema,
    sorter: &mut dyn Sorter,
) -> Result<IndexSearchOutcome> {
    let started = Instant::now();
    let mut warning = None;

    // query tree
    let tree: Option<QNode> = if query.query.trim().is_empty()
        || query.mode == MatchMode::Fullscan
    {
        None
    } else {
        match query.mode {
            MatchMode::Extended | MatchMode::Boolean => {
                let mut tokenizer =
                    StandardTokenizer::new(index.header.settings.min_word_len).query_mode();
                let mut dict = StandardDict::new(index.header.settings.dict.clone())?;
                let parsed = QueryParser::new(index.schema()).parse(
                    &query.query,
                    &mut tokenizer,
                    &mut dict,
                )?;
                if !parsed.warnings.is_empty() {
                    warning = Some(parsed.warnings.join("; "));
                }
                parsed.root
            }
            _ => legacy_tree(&query.query, query.mode, index)?,
        }
    };

    // a query that swept down to nothing (all stopwords) matches
    // nothing; only an explicitly empty query is a fullscan
    let fullscan = query.query.trim().is_empty() || query.mode == MatchMode::Fullscan;
    if tree.is_none() && !fullscan {
        return Ok(IndexSearchOutcome { words: Vec::new(), found: 0, warning });
    }

    let mut stats: Vec<TermStat> = Vec::new();
    let mut stream = match &tree {
        Some(node) => {
            let mut dict = StandardDict::new(index.header.settings.dict.clone())?;
            DocStream::Ext(ExtNode::build(node, index, &mut dict, &mut stats)?)
        }
        None => {
            if index.header.docinfo != DocinfoMode::Extern {
                return Err(Error::query(
                    "fullscan requires extern docinfo".to_string()));
            }
            DocStream::Scan(FullScan::new(index))
        }
    };

    // qpos -> stat index for per-term tf counting
    let qpos_of: Vec<u32> = {
        let mut v = Vec::with_capacity(stats.len());
        if let Some(node) = &tree {
            let mut words = Vec::new();
            node.collect_words(&mut words);
            for w in &words {
                v.push(w.atom_pos);
            }
        }
        v
    };

    let filters: Result<Vec<BoundFilter>> = query
        .filters
        .iter()
        .map(|spec| BoundFilter::bind(spec, ext_schema))
        .collect();
    let filters = filters?;

    let overrides: Result<Vec<(AttrLocator, &std::collections::HashMap<DocId, u64>)>> = query
        .overrides
        .iter()
        .map(|(name, values)| {
            index
                .schema()
                .attr(name)
                .map(|a| (a.locator, values))
                .ok_or_else(|| Error::query(format!("no such override attribute '{}'", name)))
        })
        .collect();
    let overrides = overrides?;

    let term_docs: Vec<u64> = stats.iter().map(|s| s.docs).collect();
    let bm25 = Bm25Calc::new(&term_docs, index.header.total_documents);
    let weigh = ranker_fn(query.ranker);
    let field_weights = field_weight_table(query, index.schema());
    let eval_ctx = EvalCtx {
        mva_pool: index.mva_pool(),
        now: chrono::Utc::now().timestamp(),
    };

    let base_row = index.schema().row_size;
    let mut found = 0u64;
    let mut doc = 0u64;
    let mut since_deadline_check = 0u32;

    loop {
        let Some(next) = stream.seek(doc + 1) else { break };
        doc = next;

        since_deadline_check += 1;
        if query.max_query_ms > 0 && since_deadline_check >= 256 {
            since_deadline_check = 0;
            if started.elapsed().as_millis() as u32 > query.max_query_ms {
                warning = Some("query time exceeded max_query_ms".to_string());
                break;
            }
        }

        if doc < query.min_id || doc > query.max_id {
            continue;
        }
        if !kill.is_empty() && kill.killed(doc) {
            continue;
        }

        let mut m = Match::new(doc, ext_schema.row_size);
        m.tag = tag;
        match index.header.docinfo {
            DocinfoMode::Extern => {
                let Some(row) = index.row_of(doc) else { continue };
                m.row[..base_row].copy_from_slice(&row);
            }
            DocinfoMode::Inline => {
                let inline = stream.inline_row();
                if inline.len() == base_row {
                    m.row[..base_row].copy_from_slice(inline);
                }
            }
            DocinfoMode::None => {}
        }
        for (loc, values) in &overrides {
            if let Some(&v) = values.get(&doc) {
                PackedRow::set(&mut m.row, *loc, v);
            }
        }

        // ranking
        let mut hits = Vec::new();
        if query.ranker.needs_hits() || !stats.is_empty() {
            stream.collect_hits(doc, &mut hits);
            hits.sort_unstable_by_key(|&(_, h)| h);
        }
        let mut tfs = vec![0u32; stats.len()];
        for &(qpos, _) in &hits {
            for (i, &q) in qpos_of.iter().enumerate() {
                if q == qpos {
                    tfs[i] += 1;
                }
            }
        }
        let bm25_part = bm25.weight(&tfs);
        let ctx = RankContext { hits: &hits, field_weights: &field_weights, bm25: bm25_part };
        m.weight = weigh(&ctx).saturating_mul(index_weight.max(1));

        // virtual attributes before filters so both can see them
        for (v, attr) in virtuals.iter().zip(
            ext_schema.attrs[ext_schema.attrs.len() - virtuals.len()..].iter(),
        ) {
            match v.expr.ty() {
                ExprType::Float => {
                    let value = v.expr.eval_float(&m, &eval_ctx);
                    PackedRow::set_float(&mut m.row, attr.locator, value);
                }
                _ => {
                    let value = v.expr.eval_int(&m, &eval_ctx);
                    PackedRow::set(&mut m.row, attr.locator, value as u64);
                }
            }
        }

        if !filters.iter().all(|f| f.matches(&m, index.mva_pool())) {
            continue;
        }

        found += 1;
        sorter.push(&m);
        if query.cutoff > 0 && found >= query.cutoff as u64 {
            break;
        }
    }

    Ok(IndexSearchOutcome {
        words: stats
            .into_iter()
            .map(|s| WordStat { word: s.word, docs: s.docs, hits: s.hits })
            .collect(),
        found,
        warning,
    })
}

/// Searches an ordered list of local indexes into one sorter; each
/// index's matches are suppressed by the killlists of the indexes that
/// follow it (the trailing shards win).
pub fn search_locals(
    locals: &[(String, Arc<SearchIndex>)],
    query: &SearchQuery,
) -> SearchResult {
    let started = Instant::now();
    if locals.is_empty() {
        return SearchResult::from_error(Error::query("no indexes to search".to_string()));
    }

    // all participating indexes must agree on attributes
    let base_schema = locals[0].1.schema().clone();
    for (name, index) in &locals[1..] {
        if index.schema().attrs != base_schema.attrs {
            return SearchResult::from_error(Error::query(format!(
                "index '{}': attribute schema mismatch in multi-index query", name)));
        }
    }

    let mut result = SearchResult::default();
    let outcome: Result<()> = (|| {
        let virtuals = build_virtuals(query, &base_schema)?;
        let ext_schema = extend_schema(&base_schema, &virtuals);
        let mut sorter = build_sorter(query, &ext_schema)?;

        for (i, (name, index)) in locals.iter().enumerate() {
            let mut kill = KillFilter::new();
            for (_, later) in &locals[i + 1..] {
                kill.add_list(later.killlist());
            }
            let index_weight = query
                .index_weights
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, w)| *w as i32)
                .unwrap_or(1);

            let outcome = search_one_index(
                index, query, i as i32, index_weight, &kill, &virtuals, &ext_schema,
                sorter.as_mut(),
            )
            .map_err(|e| Error::new(e.kind, format!("index '{}': {}", name, e.context)))?;

            result.total_found += outcome.found;
            if let Some(w) = outcome.warning {
                result.add_warning(w);
            }
            merge_word_stats(&mut result, &outcome.words);
        }

        result.schema = sorter.schema().clone();
        let mut matches = Vec::new();
        sorter.flatten(&mut matches, -1);
        result.total = matches.len() as u64;
        result.matches = matches;
        Ok(())
    })();

    if let Err(e) = outcome {
        return SearchResult::from_error(e);
    }
    result.time_ms = started.elapsed().as_millis() as u64;
    result
}

/// Word stats sum only when the keyword lists agree position by
/// position; otherwise the local values are kept and a warning is
/// recorded.
pub fn merge_word_stats(result: &mut SearchResult, words: &[WordStat]) {
    if result.words.is_empty() {
        result.words = words.to_vec();
        return;
    }
    if words.is_empty() {
        return;
    }
    let same = result.words.len() == words.len()
        && result.words.iter().zip(words).all(|(a, b)| a.word == b.word);
    if !same {
        result.add_warning("query words mismatch across indexes, stats not merged");
        return;
    }
    for (mine, other) in result.words.iter_mut().zip(words) {
        mine.docs += other.docs;
        mine.hits += other.hits;
    }
}

impl SearchIndex {
    /// Primary query entry point over one opened index: runs every
    /// query in the batch and returns one result set per query.
    pub fn multi_query(self: Arc<Self>, queries: &[SearchQuery]) -> Vec<SearchResult> {
        let locals = [("index".to_string(), self)];
        queries.iter().map(|q| search_locals(&locals, q)).collect()
    }
}
