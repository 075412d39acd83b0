pub mod hits;
pub mod merge;
pub mod writer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::analysis::dict::{Dict, DictSettings, MultiWordforms, StandardDict};
use crate::analysis::tokenizer::{StandardTokenizer, Tokenizer};
use crate::core::config::MIN_MEM_LIMIT;
use crate::core::error::{Error, Result};
use crate::core::types::{DocId, WordId};
use crate::index::lock::FileLock;
use crate::index::reader::SearchIndex;
use crate::index::segment::{
    DocinfoMode, IndexHeader, IndexSettings, SegmentPaths, CHECKPOINT_EVERY,
};
use crate::indexer::hits::{Hit, HitArena, RunReader};
use crate::indexer::merge::MergeStream;
use crate::indexer::writer::{DocInfo, SegmentEmitter};
use crate::schema::attr::{AttrType, PackedRow};
use crate::schema::schema::Schema;
use crate::source::{AttrSourceValue, DocumentSource};

/// Build phases, fired on the progress callback in this exact order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPhase {
    CollectDocs,
    SortHits,
    CollectMva,
    SortMva,
    Merge,
}

pub type ProgressFn<'a> = &'a dyn Fn(IndexPhase);

#[derive(Debug, Default, Clone)]
pub struct BuildStats {
    pub documents: u64,
    pub bytes: u64,
    pub runs: usize,
}

pub struct IndexBuilder {
    pub paths: SegmentPaths,
    pub docinfo: DocinfoMode,
    pub settings: IndexSettings,
    pub mem_limit: usize,
    /// Rotation shadow build: skip the lock check, write `.new.*`.
    pub rotate: bool,
}

impl IndexBuilder {
    pub fn new(paths: SegmentPaths, docinfo: DocinfoMode, settings: IndexSettings) -> Self {
        IndexBuilder {
            paths,
            docinfo,
            settings,
            mem_limit: MIN_MEM_LIMIT,
            rotate: false,
        }
    }

    pub fn dict(&self) -> Result<Box<dyn Dict>> {
        Ok(Box::new(StandardDict::new(self.settings.dict.clone())?))
    }

    pub fn tokenizer(&self) -> Box<dyn Tokenizer> {
        Box::new(StandardTokenizer::new(self.settings.min_word_len))
    }

    /// Builds one index from the given sources. Any source failure
    /// aborts this build only; partial files are unlinked.
    pub fn build(
        &self,
        sources: Vec<Box<dyn DocumentSource>>,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<BuildStats> {
        if !self.rotate && FileLock::is_held(&self.paths.lock()) {
            return Err(Error::io(format!(
                "index files are locked by a running server ({})",
                self.paths.lock().display())));
        }

        let result = self.build_inner(sources, progress);
        if result.is_err() {
            SegmentEmitter::unlink_partial(&self.paths);
        }
        result
    }

    fn build_inner(
        &self,
        mut sources: Vec<Box<dyn DocumentSource>>,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<BuildStats> {
        let fire = |phase: IndexPhase| {
            if let Some(f) = progress {
                f(phase);
            }
        };
        if sources.is_empty() {
            return Err(Error::config("no sources given".to_string()));
        }

        let mut schema = sources[0].schema().clone();
        schema.finalize()?;
        for source in &sources[1..] {
            let mut other = source.schema().clone();
            other.finalize()?;
            if other != schema {
                return Err(Error::config(
                    "all sources of one index must share a schema".to_string()));
            }
        }

        fire(IndexPhase::CollectDocs);

        let mem_limit = self.mem_limit.max(MIN_MEM_LIMIT);
        let mut arena = HitArena::with_mem_limit(mem_limit);
        let mut runs: Vec<PathBuf> = Vec::new();
        let mut rows: Vec<DocInfo> = Vec::new();
        let mut mva_pool: Vec<u32> = vec![0];
        let mut ordinals: HashMap<usize, Vec<(String, DocId)>> = HashMap::new();
        let mut kill_list: Vec<DocId> = Vec::new();
        let mut total_bytes = 0u64;

        let build_result: Result<()> = (|| {
            for source in sources.iter_mut() {
                source.connect()?;
                source.iterate_hits_start(self.tokenizer(), self.dict()?)?;

                while let Some(doc) = source.iterate_hits_next()? {
                    let mut row = vec![0u32; schema.row_size];
                    for (i, attr) in schema.attrs.iter().enumerate() {
                        let value = doc.attrs.get(i).cloned().unwrap_or(AttrSourceValue::Int(0));
                        match (attr.kind, value) {
                            (AttrType::Float32, AttrSourceValue::Float(f)) => {
                                PackedRow::set_float(&mut row, attr.locator, f);
                            }
                            (AttrType::Mva, AttrSourceValue::Mva(values)) => {
                                let offset = if values.is_empty() {
                                    0
                                } else {
                                    let offset = mva_pool.len() as u32;
                                    mva_pool.push(values.len() as u32);
                                    mva_pool.extend_from_slice(&values);
                                    offset
                                };
                                PackedRow::set(&mut row, attr.locator, offset as u64);
                            }
                            (AttrType::Ordinal, AttrSourceValue::Str(s)) => {
                                ordinals.entry(i).or_default().push((s, doc.doc_id));
                            }
                            (_, AttrSourceValue::Int(v)) => {
                                PackedRow::set(&mut row, attr.locator, v);
                            }
                            (kind, value) => {
                                return Err(Error::parse(format!(
                                    "doc {}: attribute '{}' expects {:?}, got {:?}",
                                    doc.doc_id, attr.name, kind, value)));
                            }
                        }
                    }
                    rows.push(DocInfo { doc_id: doc.doc_id, row, doc_len: doc.token_count });
                    total_bytes += doc.hits.len() as u64 * 8;

                    for &(word_id, hitpos) in &doc.hits {
                        arena.push(Hit { word_id, doc_id: doc.doc_id, hitpos });
                        if arena.is_full() {
                            let run = self.paths.file(&format!("run{}", runs.len()));
                            arena.spill(&run)?;
                            runs.push(run);
                        }
                    }
                }
                kill_list.extend(source.kill_list()?);
            }
            Ok(())
        })();
        if let Err(e) = build_result {
            for run in &runs {
                let _ = std::fs::remove_file(run);
            }
            return Err(e);
        }

        fire(IndexPhase::SortHits);
        if !arena.is_empty() {
            let run = self.paths.file(&format!("run{}", runs.len()));
            arena.spill(&run)?;
            runs.push(run);
        }

        rows.sort_by_key(|r| r.doc_id);
        if let Some(dup) = rows.windows(2).find(|w| w[0].doc_id == w[1].doc_id) {
            for run in &runs {
                let _ = std::fs::remove_file(run);
            }
            return Err(Error::parse(format!("duplicate document id {}", dup[0].doc_id)));
        }

        fire(IndexPhase::CollectMva);
        fire(IndexPhase::SortMva);
        // ordinal strings become their dense rank, assigned in sort order
        for (attr_idx, mut entries) in ordinals {
            let locator = schema.attrs[attr_idx].locator;
            entries.sort();
            let mut rank = 0u64;
            let mut last: Option<&str> = None;
            let patches: Vec<(DocId, u64)> = entries
                .iter()
                .map(|(s, doc_id)| {
                    if last != Some(s.as_str()) {
                        rank += 1;
                        last = Some(s.as_str());
                    }
                    (*doc_id, rank)
                })
                .collect();
            for (doc_id, rank) in patches {
                if let Ok(i) = rows.binary_search_by_key(&doc_id, |r| r.doc_id) {
                    PackedRow::set(&mut rows[i].row, locator, rank);
                }
            }
        }

        kill_list.sort_unstable();
        kill_list.dedup();

        fire(IndexPhase::Merge);
        let stats = BuildStats {
            documents: rows.len() as u64,
            bytes: total_bytes,
            runs: runs.len(),
        };
        let total_tokens: u64 = rows.iter().map(|r| r.doc_len as u64).sum();
        let min_doc_id = rows.first().map(|r| r.doc_id).unwrap_or(0);

        let header = IndexHeader {
            docinfo: self.docinfo,
            schema,
            min_doc_id,
            total_documents: stats.documents,
            total_bytes,
            total_tokens,
            dict_size: 0, // filled by the emitter
            settings: self.settings.clone(),
        };

        let merge_result: Result<()> = (|| {
            let readers: Result<Vec<RunReader>> = runs.iter().map(RunReader::open).collect();
            let mut stream = MergeStream::new(readers?)?;
            let mut emitter = SegmentEmitter::create(self.paths.clone(), self.docinfo, rows)?;
            while let Some(doc) = stream.next()? {
                emitter.push(doc.word_id, doc.doc_id, &doc.hits)?;
            }
            emitter.finish(header, &mva_pool, &kill_list)?;
            Ok(())
        })();

        for run in &runs {
            let _ = std::fs::remove_file(run);
        }
        merge_result?;
        Ok(stats)
    }
}

/// Dictionary shim for stopword-build mode: records token frequencies
/// and filters everything, so no hits reach the arena.
pub struct StopwordBuilderDict {
    pub freqs: Arc<Mutex<HashMap<String, u64>>>,
    settings: DictSettings,
    forms: MultiWordforms,
}

impl StopwordBuilderDict {
    pub fn new(freqs: Arc<Mutex<HashMap<String, u64>>>) -> Self {
        StopwordBuilderDict {
            freqs,
            settings: DictSettings::default(),
            forms: MultiWordforms::default(),
        }
    }
}

impl Dict for StopwordBuilderDict {
    fn word_id(&mut self, w: &[u8]) -> WordId {
        if let Ok(word) = std::str::from_utf8(w) {
            *self.freqs.lock().unwrap().entry(word.to_string()).or_insert(0) += 1;
        }
        0
    }

    fn multiword_forms(&self) -> &MultiWordforms {
        &self.forms
    }

    fn settings(&self) -> &DictSettings {
        &self.settings
    }
}

/// Counts word frequencies across all sources and returns the top N,
/// most frequent first (`--buildstops`).
pub fn build_stopwords(
    mut sources: Vec<Box<dyn DocumentSource>>,
    min_word_len: usize,
    top_n: usize,
) -> Result<Vec<(String, u64)>> {
    let freqs = Arc::new(Mutex::new(HashMap::new()));
    for source in sources.iter_mut() {
        source.connect()?;
        source.iterate_hits_start(
            Box::new(StandardTokenizer::new(min_word_len)),
            Box::new(StopwordBuilderDict::new(freqs.clone())),
        )?;
        while source.iterate_hits_next()?.is_some() {}
    }
    let mut out: Vec<(String, u64)> = freqs.lock().unwrap().drain().collect();
    out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    out.truncate(top_n);
    Ok(out)
}

/// Options for the two-index merge (`--merge dst src`).
#[derive(Debug, Default, Clone)]
pub struct MergeOptions {
    /// Keep only destination docs whose attr falls in [min, max].
    pub dst_range: Option<(String, u64, u64)>,
    /// Union both killlists instead of keeping the source's.
    pub merge_killlists: bool,
}

/// Merges `src` into `dst`, writing the result at `out`. Source rows
/// win on docid collisions; the source killlist suppresses destination
/// documents.
pub fn merge_indexes(
    dst: &SearchIndex,
    src: &SearchIndex,
    out: SegmentPaths,
    options: &MergeOptions,
) -> Result<BuildStats> {
    if dst.schema() != src.schema() {
        return Err(Error::config("cannot merge indexes with different schemas".to_string()));
    }
    if dst.header.docinfo != DocinfoMode::Extern || src.header.docinfo != DocinfoMode::Extern {
        return Err(Error::config("index merge needs extern docinfo".to_string()));
    }
    let schema: Schema = dst.schema().clone();

    let range_loc = match &options.dst_range {
        Some((name, _, _)) => Some(
            schema
                .attr(name)
                .ok_or_else(|| Error::config(format!("unknown merge range attribute '{}'", name)))?
                .locator,
        ),
        None => None,
    };

    // collect surviving rows; src wins collisions, src killlist kills dst
    let src_kill: std::collections::HashSet<DocId> = src.killlist().iter().copied().collect();
    let mut keep: HashMap<DocId, (Vec<u32>, bool)> = HashMap::new();
    for (doc_id, row) in all_rows(dst) {
        if src_kill.contains(&doc_id) {
            continue;
        }
        if let (Some(loc), Some((_, min, max))) = (range_loc, options.dst_range.as_ref()) {
            let v = PackedRow::get(&row, loc);
            if v < *min || v > *max {
                continue;
            }
        }
        keep.insert(doc_id, (row, false));
    }
    for (doc_id, row) in all_rows(src) {
        keep.insert(doc_id, (row, true));
    }

    // rebuild rows and reroute MVA cells into a fresh pool
    let mva_attrs: Vec<_> = schema.attrs.iter().filter(|a| a.kind == AttrType::Mva).collect();
    let mut mva_pool: Vec<u32> = vec![0];
    let mut rows: Vec<DocInfo> = Vec::with_capacity(keep.len());
    for (doc_id, (mut row, from_src)) in keep {
        for attr in &mva_attrs {
            let pool = if from_src { src.mva_pool() } else { dst.mva_pool() };
            let values = crate::schema::row::mva_values(pool, PackedRow::get(&row, attr.locator));
            let offset = if values.is_empty() {
                0
            } else {
                let offset = mva_pool.len() as u32;
                mva_pool.push(values.len() as u32);
                mva_pool.extend_from_slice(values);
                offset
            };
            PackedRow::set(&mut row, attr.locator, offset as u64);
        }
        rows.push(DocInfo { doc_id, row, doc_len: 0 });
    }
    rows.sort_by_key(|r| r.doc_id);

    let src_alive: std::collections::HashSet<DocId> =
        all_rows(src).iter().map(|(d, _)| *d).collect();
    let dst_alive: std::collections::HashSet<DocId> = rows
        .iter()
        .map(|r| r.doc_id)
        .filter(|d| !src_alive.contains(d))
        .collect();

    let mut kill_list: Vec<DocId> = src.killlist().to_vec();
    if options.merge_killlists {
        kill_list.extend_from_slice(dst.killlist());
    }
    kill_list.sort_unstable();
    kill_list.dedup();

    let header = IndexHeader {
        docinfo: DocinfoMode::Extern,
        schema,
        min_doc_id: rows.first().map(|r| r.doc_id).unwrap_or(0),
        total_documents: rows.len() as u64,
        total_bytes: dst.header.total_bytes + src.header.total_bytes,
        total_tokens: dst.header.total_tokens + src.header.total_tokens,
        dict_size: 0,
        settings: IndexSettings {
            checkpoint_every: CHECKPOINT_EVERY,
            ..dst.header.settings.clone()
        },
    };
    let stats = BuildStats {
        documents: rows.len() as u64,
        bytes: header.total_bytes,
        runs: 0,
    };

    let mut emitter = SegmentEmitter::create(out, DocinfoMode::Extern, rows)?;
    let mut dst_words = dst.words();
    let mut src_words = src.words();
    let mut dw = dst_words.next();
    let mut sw = src_words.next();
    loop {
        // walk both dictionaries in word order; docs from src shadow dst
        let (word_id, from_dst, from_src) = match (&dw, &sw) {
            (Some((d, _)), Some((s, _))) if d == s => (*d, true, true),
            (Some((d, _)), Some((s, _))) if d < s => (*d, true, false),
            (Some(_), Some(_)) => (sw.as_ref().unwrap().0, false, true),
            (Some((d, _)), None) => (*d, true, false),
            (None, Some((s, _))) => (*s, false, true),
            (None, None) => break,
        };

        let mut postings: Vec<(DocId, Vec<u32>)> = Vec::new();
        if from_dst {
            let info = dw.take().unwrap().1;
            let mut iter = crate::index::doclist::DocListIter::new(
                dst.doclists_bytes(), info, DocinfoMode::Extern, 0);
            while let Some(entry) = iter.next() {
                if dst_alive.contains(&entry.doc_id) {
                    let hits = crate::index::doclist::HitIter::new(
                        dst.hitlists_bytes(), entry.hit_offset).collect_all();
                    postings.push((entry.doc_id, hits));
                }
            }
            dw = dst_words.next();
        }
        if from_src {
            let info = sw.take().unwrap().1;
            let mut iter = crate::index::doclist::DocListIter::new(
                src.doclists_bytes(), info, DocinfoMode::Extern, 0);
            while let Some(entry) = iter.next() {
                if src_alive.contains(&entry.doc_id) {
                    let hits = crate::index::doclist::HitIter::new(
                        src.hitlists_bytes(), entry.hit_offset).collect_all();
                    match postings.binary_search_by_key(&entry.doc_id, |(d, _)| *d) {
                        Ok(i) => postings[i] = (entry.doc_id, hits),
                        Err(i) => postings.insert(i, (entry.doc_id, hits)),
                    }
                }
            }
            sw = src_words.next();
        }

        for (doc_id, hits) in postings {
            emitter.push(word_id, doc_id, &hits)?;
        }
    }
    emitter.finish(header, &mva_pool, &kill_list)?;
    Ok(stats)
}

fn all_rows(index: &SearchIndex) -> Vec<(DocId, Vec<u32>)> {
    let mut out = Vec::new();
    for doc_id in index.doc_ids() {
        if let Some(row) = index.row_of(doc_id) {
            out.push((doc_id, row));
        }
    }
    out
}
