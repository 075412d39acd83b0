use std::sync::Arc;
use log::info;

use crate::analysis::dict::{Dict, StandardDict};
use crate::analysis::tokenizer::{StandardTokenizer, Tokenizer};
use crate::core::error::{Error, Result};
use crate::core::types::DocId;
use crate::distributed::{merge_results, query_agents, Agent, AgentState, DistributedIndex};
use crate::index::reader::SearchIndex;
use crate::schema::attr::AttrType;
use crate::search::{search_locals, SearchQuery, SearchResult};
use crate::server::failures::FailuresLog;
use crate::server::proto::{NetReader, NetWriter};
use crate::server::ServerCtx;

/// MVA pool provider per result tag: live local indexes first, then
/// pools decoded from agent replies.
pub enum MvaSource {
    Index(Arc<SearchIndex>),
    Owned(Vec<u32>),
}

impl MvaSource {
    pub fn pool(&self) -> &[u32] {
        match self {
            MvaSource::Index(index) => index.mva_pool(),
            MvaSource::Owned(pool) => pool,
        }
    }
}

/// Executes one search query end to end: local shards, distributed
/// fan-out, merge. Returns the result plus the tag-indexed MVA pools
/// the encoder needs.
pub async fn execute_query(
    ctx: &Arc<ServerCtx>,
    query: &SearchQuery,
) -> (SearchResult, Vec<MvaSource>) {
    let started = std::time::Instant::now();
    let resolved = match ctx.resolve_indexes(&query.indexes) {
        Ok(r) => r,
        Err(e) => return (SearchResult::from_error(e), Vec::new()),
    };
    let (locals, agent_specs, dist) = resolved;

    let mut mva_sources: Vec<MvaSource> = locals
        .iter()
        .map(|(_, index)| MvaSource::Index(Arc::clone(index)))
        .collect();

    // local shards run on the blocking pool; the scorer is synchronous
    let local_result = if locals.is_empty() {
        None
    } else {
        let locals = locals.clone();
        let query = query.clone();
        match tokio::task::spawn_blocking(move || search_locals(&locals, &query)).await {
            Ok(result) => Some(result),
            Err(e) => Some(SearchResult::from_error(Error::internal(format!(
                "local search task failed: {}", e)))),
        }
    };

    let mut result = if agent_specs.is_empty() {
        match local_result {
            Some(result) => result,
            None => SearchResult::from_error(Error::query("no indexes to search".to_string())),
        }
    } else {
        let dist = dist.unwrap_or_else(|| {
            Arc::new(DistributedIndex {
                locals: Vec::new(),
                agents: Vec::new(),
                connect_timeout_ms: 1000,
                query_timeout_ms: 3000,
            })
        });
        let mut agents: Vec<Agent> = agent_specs.into_iter().map(Agent::new).collect();
        agents = query_agents(
            agents,
            Arc::new(query.clone()),
            &dist,
            Arc::clone(&ctx.stats),
        )
        .await;

        let mut failures = FailuresLog::new();
        let mut sets: Vec<SearchResult> = Vec::new();
        match local_result {
            Some(result) if result.error.is_some() => {
                failures.add("local", result.error.unwrap_or_default());
            }
            Some(result) => sets.push(result),
            None => {}
        }
        for agent in &mut agents {
            if agent.spec.blackhole {
                continue;
            }
            match (&agent.failure, agent.state) {
                (Some(failure), _) => {
                    failures.add(agent.spec.indexes.clone(), failure.clone());
                }
                (None, AgentState::Done) => {
                    for (mut set, pool) in agent.results.drain(..) {
                        // mva_sources is indexed by tag, so the next
                        // slot is this set's tag
                        let tag = mva_sources.len() as i32;
                        for m in &mut set.matches {
                            m.tag = tag;
                        }
                        mva_sources.push(MvaSource::Owned(pool));
                        sets.push(set);
                    }
                }
                _ => {
                    failures.add(agent.spec.indexes.clone(), "agent did not reply".to_string());
                }
            }
        }
        merge_results(query, sets, &mut failures)
    };

    result.time_ms = started.elapsed().as_millis() as u64;
    ctx.stats.count_query(started.elapsed().as_micros() as u64);
    ctx.log_query(query, &result);
    (result, mva_sources)
}

/// Pages a result in place: `offset`/`limit` select the returned
/// window, totals stay at their full values.
pub fn apply_paging(result: &mut SearchResult, offset: usize, limit: usize) {
    let start = offset.min(result.matches.len());
    let end = (offset + limit.max(1)).min(result.matches.len());
    result.matches = result.matches[start..end].to_vec();
}

/// COMMAND_SEARCH: decode, execute each query, encode all result sets.
pub async fn handle_search(ctx: &Arc<ServerCtx>, body: &[u8]) -> Result<NetWriter> {
    let queries = crate::server::proto::decode_search_request(body, 32)?;
    let mut w = NetWriter::new();
    for query in &queries {
        let (mut result, mva_sources) = execute_query(ctx, query).await;
        apply_paging(&mut result, query.offset, query.limit);
        let pools: Vec<&[u32]> = mva_sources.iter().map(|s| s.pool()).collect();
        crate::server::proto::encode_result(&mut w, &result, &pools);
    }
    Ok(w)
}

/// COMMAND_UPDATE: in-place numeric attribute updates on one local
/// index. Body: index, attr names, then per-doc values.
pub async fn handle_update(ctx: &Arc<ServerCtx>, body: &[u8]) -> Result<NetWriter> {
    let mut r = NetReader::new(body);
    let index_name = r.read_string()?;
    let nattrs = r.read_u32()? as usize;
    let mut names = Vec::with_capacity(nattrs);
    for _ in 0..nattrs {
        names.push(r.read_string()?);
    }
    let ndocs = r.read_u32()? as usize;

    let index = ctx
        .local(&index_name)
        .ok_or_else(|| Error::query(format!("unknown local index '{}'", index_name)))?;

    let mut locators = Vec::with_capacity(names.len());
    for name in &names {
        let attr = index
            .schema()
            .attr(name)
            .ok_or_else(|| Error::query(format!("no such attribute '{}'", name)))?;
        if matches!(attr.kind, AttrType::Mva | AttrType::Ordinal) {
            return Err(Error::query(format!(
                "attribute '{}' cannot be updated in place", name)));
        }
        locators.push(attr.locator);
    }

    let mut updated = 0u32;
    for _ in 0..ndocs {
        let doc_id: DocId = r.read_u64()?;
        let mut updates = Vec::with_capacity(locators.len());
        for &loc in &locators {
            updates.push((loc, r.read_u32()? as u64));
        }
        if index.update_attrs(doc_id, &updates)? {
            updated += 1;
        }
    }
    info!("index '{}': updated {} documents", index_name, updated);

    let mut w = NetWriter::new();
    w.put_u32(updated);
    Ok(w)
}

/// COMMAND_KEYWORDS: tokenize a query against an index's analysis
/// chain, optionally with per-keyword stats.
pub async fn handle_keywords(ctx: &Arc<ServerCtx>, body: &[u8]) -> Result<NetWriter> {
    let mut r = NetReader::new(body);
    let text = r.read_string()?;
    let index_name = r.read_string()?;
    let want_stats = r.read_u32()? != 0;

    let index = ctx
        .local(&index_name)
        .ok_or_else(|| Error::query(format!("unknown local index '{}'", index_name)))?;

    let mut tokenizer = StandardTokenizer::new(index.header.settings.min_word_len);
    let mut dict = StandardDict::new(index.header.settings.dict.clone())?;
    tokenizer.set_buffer(text.as_bytes());

    let mut out: Vec<(String, u64)> = Vec::new();
    while let Some(token) = tokenizer.next() {
        let tokenized = String::from_utf8_lossy(token).into_owned();
        let word_id = dict.word_id(tokenized.as_bytes());
        out.push((tokenized, word_id));
    }

    let mut w = NetWriter::new();
    w.put_u32(out.len() as u32);
    for (tokenized, word_id) in out {
        w.put_string(&tokenized);
        w.put_string(&tokenized);
        if want_stats {
            let info = index.doclist_info(word_id);
            w.put_u32(info.map(|i| i.doc_count).unwrap_or(0));
            w.put_u32(info.map(|i| i.hit_count as u32).unwrap_or(0));
        }
    }
    Ok(w)
}

/// COMMAND_STATUS: the daemon counters as string pairs.
pub async fn handle_status(ctx: &Arc<ServerCtx>) -> Result<NetWriter> {
    let rows = ctx.stats.render();
    let mut w = NetWriter::new();
    w.put_u32(rows.len() as u32);
    w.put_u32(2);
    for (key, value) in rows {
        w.put_string(&key);
        w.put_string(&value);
    }
    Ok(w)
}
