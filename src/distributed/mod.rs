use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::core::error::{Error, Result};
use crate::core::stats::Stats;
use crate::core::types::DocId;
use crate::schema::attr::AttrType;
use crate::schema::row::Match;
use crate::schema::schema::Schema;
use crate::search::{merge_word_stats, SearchQuery, SearchResult};
use crate::server::failures::FailuresLog;
use crate::server::proto::{
    decode_result, encode_query, NetReader, NetWriter, CLIENT_VERSION, COMMAND_SEARCH,
    SEARCHD_PROTO, SEARCHD_PROTO_SWAPPED, STATUS_OK, STATUS_RETRY, STATUS_WARNING,
    VER_COMMAND_SEARCH,
};

/// Remote peer of a distributed index: `host:port:idx1,idx2`.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSpec {
    pub addr: String,
    pub indexes: String,
    pub blackhole: bool,
}

impl AgentSpec {
    pub fn parse(spec: &str, blackhole: bool) -> Result<AgentSpec> {
        let mut parts = spec.splitn(3, ':');
        let host = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::config(format!("bad agent spec '{}'", spec)))?;
        let port = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| Error::config(format!("bad agent port in '{}'", spec)))?;
        let indexes = parts
            .next()
            .filter(|i| !i.is_empty())
            .ok_or_else(|| Error::config(format!("missing index list in agent '{}'", spec)))?;
        Ok(AgentSpec {
            addr: format!("{}:{}", host, port),
            indexes: indexes.to_string(),
            blackhole,
        })
    }
}

/// A distributed index: local shards plus remote agents.
#[derive(Debug, Clone)]
pub struct DistributedIndex {
    pub locals: Vec<String>,
    pub agents: Vec<AgentSpec>,
    pub connect_timeout_ms: u64,
    pub query_timeout_ms: u64,
}

/// Agent connection lifecycle. `Retry` feeds the next wave; `Done`
/// means a parsed reply (or a blackhole send) is in hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Unused,
    Connect,
    Hello,
    Query,
    Reply,
    Retry,
    Done,
}

pub struct Agent {
    pub spec: AgentSpec,
    pub state: AgentState,
    pub results: Vec<(SearchResult, Vec<u32>)>,
    pub failure: Option<String>,
}

impl Agent {
    pub fn new(spec: AgentSpec) -> Self {
        Agent {
            spec,
            state: AgentState::Unused,
            results: Vec::new(),
            failure: None,
        }
    }

    /// One connect/hello/query/reply pass; sets `Retry` on transient
    /// failures and `Done` on success.
    async fn run_once(
        &mut self,
        query: &SearchQuery,
        connect_timeout: Duration,
        query_timeout: Duration,
    ) {
        match self.attempt(query, connect_timeout, query_timeout).await {
            Ok(()) => {
                self.state = AgentState::Done;
                self.failure = None;
            }
            Err(e) if e.is_transient() => {
                self.state = AgentState::Retry;
                self.failure = Some(e.context);
            }
            Err(e) => {
                self.state = AgentState::Done;
                self.failure = Some(e.context);
            }
        }
    }

    async fn attempt(
        &mut self,
        query: &SearchQuery,
        connect_timeout: Duration,
        query_timeout: Duration,
    ) -> Result<()> {
        self.state = AgentState::Connect;
        let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&self.spec.addr))
            .await
            .map_err(|_| Error::transient(format!("connect() to {} timed out", self.spec.addr)))?
            .map_err(|e| Error::transient(format!("connect() to {} failed: {}", self.spec.addr, e)))?;

        self.state = AgentState::Hello;
        let hello = tokio::time::timeout(connect_timeout, stream.read_u32())
            .await
            .map_err(|_| Error::transient(format!("hello read from {} timed out", self.spec.addr)))?
            .map_err(|e| Error::transient(format!("hello read from {} failed: {}", self.spec.addr, e)))?;
        if hello != SEARCHD_PROTO && hello != SEARCHD_PROTO_SWAPPED {
            return Err(Error::protocol(format!(
                "agent {}: bad protocol version {}", self.spec.addr, hello)));
        }
        stream.write_u32(CLIENT_VERSION).await?;

        self.state = AgentState::Query;
        let mut body = NetWriter::new();
        body.put_u32(1);
        let remote_query = SearchQuery {
            indexes: self.spec.indexes.clone(),
            // retries are driven by this side's waves
            retry_count: 0,
            retry_delay_ms: 0,
            ..query.clone()
        };
        encode_query(&mut body, &remote_query);
        let body = body.into_bytes();

        let mut frame = NetWriter::new();
        frame.put_u16(COMMAND_SEARCH);
        frame.put_u16(VER_COMMAND_SEARCH);
        frame.put_u32(body.len() as u32);
        stream.write_all(&frame.into_bytes()).await?;
        stream.write_all(&body).await?;

        if self.spec.blackhole {
            // fire and forget: the reply is discarded
            return Ok(());
        }

        self.state = AgentState::Reply;
        let mut header = [0u8; 8];
        tokio::time::timeout(query_timeout, stream.read_exact(&mut header))
            .await
            .map_err(|_| Error::transient(format!("reply from {} timed out", self.spec.addr)))?
            .map_err(|e| Error::transient(format!("reply from {} failed: {}", self.spec.addr, e)))?;
        let status = u16::from_be_bytes([header[0], header[1]]);
        let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if length > 64 * 1024 * 1024 {
            return Err(Error::protocol(format!(
                "agent {}: oversized reply ({} bytes)", self.spec.addr, length)));
        }
        let mut payload = vec![0u8; length];
        tokio::time::timeout(query_timeout, stream.read_exact(&mut payload))
            .await
            .map_err(|_| Error::transient(format!("reply from {} timed out", self.spec.addr)))?
            .map_err(|e| Error::transient(format!("reply from {} failed: {}", self.spec.addr, e)))?;

        let mut r = NetReader::new(&payload);
        match status {
            STATUS_OK | STATUS_WARNING => {}
            STATUS_RETRY => {
                let message = r.read_string().unwrap_or_default();
                return Err(Error::transient(format!("agent {}: {}", self.spec.addr, message)));
            }
            _ => {
                let message = r.read_string().unwrap_or_default();
                return Err(Error::query(format!("agent {}: {}", self.spec.addr, message)));
            }
        }
        let decoded = decode_result(&mut r)?;
        if let Some(e) = &decoded.result.error {
            return Err(Error::query(format!("agent {}: {}", self.spec.addr, e)));
        }
        self.results = vec![(decoded.result, decoded.mva_pool)];
        Ok(())
    }
}

pub const MAX_RETRY_COUNT: u32 = 8;
pub const MAX_RETRY_DELAY_MS: u32 = 1000;

/// Queries every agent concurrently, rerunning `Retry` agents in
/// waves separated by the retry delay.
pub async fn query_agents(
    mut agents: Vec<Agent>,
    query: Arc<SearchQuery>,
    dist: &DistributedIndex,
    stats: Arc<Stats>,
) -> Vec<Agent> {
    let connect_timeout = Duration::from_millis(dist.connect_timeout_ms.max(1));
    let query_timeout = Duration::from_millis(dist.query_timeout_ms.max(1));
    let retry_count = query.retry_count.min(MAX_RETRY_COUNT);
    let retry_delay = query.retry_delay_ms.min(MAX_RETRY_DELAY_MS);

    for wave in 0..=retry_count {
        let pending: Vec<usize> = agents
            .iter()
            .enumerate()
            .filter(|(_, a)| matches!(a.state, AgentState::Unused | AgentState::Retry))
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            break;
        }
        if wave > 0 {
            stats
                .agent_retry
                .fetch_add(pending.len() as u64, std::sync::atomic::Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(retry_delay as u64)).await;
        }
        stats
            .agent_connect
            .fetch_add(pending.len() as u64, std::sync::atomic::Ordering::Relaxed);

        let mut tasks = tokio::task::JoinSet::new();
        for idx in pending {
            let spec = agents[idx].spec.clone();
            let mut agent = std::mem::replace(&mut agents[idx], Agent::new(spec));
            let query = Arc::clone(&query);
            tasks.spawn(async move {
                agent.run_once(&query, connect_timeout, query_timeout).await;
                (idx, agent)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Ok((idx, agent)) = joined {
                agents[idx] = agent;
            }
        }
    }
    agents
}

/// Merges tagged result sets (local shards first, then agents) into
/// one response: schema minimized to the common subset, rows remapped,
/// duplicates dropped first-by-tag (or weight-summed when per-index
/// weights are in play), and everything re-sorted into a fresh queue.
pub fn merge_results(
    query: &SearchQuery,
    sets: Vec<SearchResult>,
    failures: &mut FailuresLog,
) -> SearchResult {
    let mut merged = SearchResult::default();
    let ok_sets: Vec<&SearchResult> = sets.iter().filter(|s| s.error.is_none()).collect();
    if ok_sets.is_empty() {
        merged.error = Some(
            failures
                .render()
                .unwrap_or_else(|| "all shards failed".to_string()),
        );
        return merged;
    }

    // schema minimized to the attrs present everywhere, in first-set order
    let mut common = Schema::new();
    for field in &ok_sets[0].schema.fields {
        let _ = common.add_field(&field.name);
    }
    for attr in &ok_sets[0].schema.attrs {
        let everywhere = ok_sets.iter().all(|s| {
            s.schema
                .attr(&attr.name)
                .map(|a| a.kind == attr.kind)
                .unwrap_or(false)
        });
        if everywhere {
            let _ = common.add_attr(&attr.name, attr.kind, attr.locator.bit_width);
        }
    }
    if common.finalize().is_err() {
        merged.error = Some("cannot merge shard schemas".to_string());
        return merged;
    }

    // remap rows and dedupe by docid
    let weighted = !query.index_weights.is_empty();
    let mut by_doc: HashMap<DocId, usize> = HashMap::new();
    let mut rows: Vec<Match> = Vec::new();
    for set in &ok_sets {
        for m in &set.matches {
            let mut remapped = Match::new(m.doc_id, common.row_size);
            remapped.weight = m.weight;
            remapped.tag = m.tag;
            for attr in &common.attrs {
                let src = set.schema.attr(&attr.name).unwrap();
                remapped.set_attr(attr.locator, m.get_attr(src.locator));
            }
            match by_doc.get(&m.doc_id) {
                Some(&at) if weighted => {
                    // per-index weights: duplicates sum their weights
                    rows[at].weight = rows[at].weight.saturating_add(m.weight);
                }
                Some(_) => {} // first-by-tag wins
                None => {
                    by_doc.insert(m.doc_id, rows.len());
                    rows.push(remapped);
                }
            }
        }
        merged.total_found += set.total_found;
        if let Some(w) = &set.warning {
            merged.add_warning(w.clone());
        }
        merge_word_stats(&mut merged, &set.words);
    }

    // group-by buckets from different shards merge on the group key
    if query.group.is_some() {
        rows = merge_group_rows(rows, &common);
    }

    // fresh queue over the merged rows
    if let Ok(sorter_schema) = sorter_spec(query, &common) {
        rows.sort_by(|a, b| sorter_schema.cmp_keys(a, b));
    }
    rows.truncate(query.max_matches.max(1));
    merged.total = rows.len() as u64;
    merged.matches = rows;
    merged.schema = common;

    if let Some(report) = failures.render() {
        merged.add_warning(report);
    }
    merged
}

fn sorter_spec(
    query: &SearchQuery,
    schema: &Schema,
) -> Result<crate::sort::compare::CompareSpec> {
    use crate::search::SortMode;
    use crate::sort::compare::CompareSpec;
    match query.sort_mode {
        SortMode::Relevance => Ok(CompareSpec::relevance()),
        SortMode::AttrDesc => CompareSpec::parse(&format!("{} desc", query.sort_by), schema),
        SortMode::AttrAsc => CompareSpec::parse(&format!("{} asc", query.sort_by), schema),
        SortMode::Extended => CompareSpec::parse(&query.sort_by, schema),
        SortMode::Expr => {
            let attr = schema
                .attr("@expr")
                .ok_or_else(|| Error::internal("missing @expr in merged schema"))?;
            Ok(CompareSpec::by_attr(attr.locator, attr.kind == AttrType::Float32, false))
        }
        SortMode::TimeSegments => Err(Error::query("time-segments sorting is not supported".to_string())),
    }
}

fn merge_group_rows(rows: Vec<Match>, schema: &Schema) -> Vec<Match> {
    let Some(groupby) = schema.attr("@groupby") else { return rows };
    let Some(count) = schema.attr("@count") else { return rows };
    let groupby = groupby.locator;
    let count_loc = count.locator;
    let distinct_loc = schema.attr("@distinct").map(|a| a.locator);

    let mut buckets: HashMap<u64, Match> = HashMap::new();
    let mut order: Vec<u64> = Vec::new();
    for m in rows {
        let key = m.get_attr(groupby);
        match buckets.get_mut(&key) {
            Some(kept) => {
                let total = kept.get_attr(count_loc) + m.get_attr(count_loc);
                kept.set_attr(count_loc, total);
                if let Some(loc) = distinct_loc {
                    let total = kept.get_attr(loc) + m.get_attr(loc);
                    kept.set_attr(loc, total);
                }
            }
            None => {
                order.push(key);
                buckets.insert(key, m);
            }
        }
    }
    order.into_iter().filter_map(|k| buckets.remove(&k)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_spec_parses_host_port_indexes() {
        let spec = AgentSpec::parse("example.com:9312:shard1,shard2", false).unwrap();
        assert_eq!(spec.addr, "example.com:9312");
        assert_eq!(spec.indexes, "shard1,shard2");
        assert!(AgentSpec::parse("nocolon", false).is_err());
        assert!(AgentSpec::parse("host:notaport:idx", false).is_err());
    }

    fn result_with(doc_ids: &[u64], tag: i32, schema: &Schema) -> SearchResult {
        SearchResult {
            matches: doc_ids
                .iter()
                .map(|&d| {
                    let mut m = Match::new(d, schema.row_size);
                    m.weight = 1;
                    m.tag = tag;
                    m
                })
                .collect(),
            schema: schema.clone(),
            total: doc_ids.len() as u64,
            total_found: doc_ids.len() as u64,
            ..Default::default()
        }
    }

    fn int_schema() -> Schema {
        let mut schema = Schema::new();
        schema.add_attr("views", AttrType::Int32, 0).unwrap();
        schema.finalize().unwrap();
        schema
    }

    #[test]
    fn duplicate_docs_keep_first_by_tag() {
        let schema = int_schema();
        let local = result_with(&[1, 2, 3], 0, &schema);
        let remote = result_with(&[2, 3, 4], 1, &schema);

        let query = SearchQuery::default();
        let mut failures = FailuresLog::new();
        let merged = merge_results(&query, vec![local, remote], &mut failures);
        assert!(merged.error.is_none());
        let docs: Vec<u64> = merged.matches.iter().map(|m| m.doc_id).collect();
        assert_eq!(docs, [1, 2, 3, 4]);
        assert_eq!(merged.matches[1].tag, 0);
    }

    #[test]
    fn merging_identical_remote_is_idempotent() {
        let schema = int_schema();
        let local = result_with(&[5, 6], 0, &schema);
        let remote = result_with(&[5, 6], 1, &schema);

        let query = SearchQuery::default();
        let mut failures = FailuresLog::new();
        let merged = merge_results(&query, vec![local.clone(), remote], &mut failures);
        let docs: Vec<u64> = merged.matches.iter().map(|m| m.doc_id).collect();
        assert_eq!(docs, [5, 6]);
        assert!(merged.matches.iter().all(|m| m.tag == 0));
    }

    #[test]
    fn index_weights_sum_duplicate_weights() {
        let schema = int_schema();
        let local = result_with(&[7], 0, &schema);
        let remote = result_with(&[7], 1, &schema);

        let query = SearchQuery {
            index_weights: vec![("shard".to_string(), 2)],
            ..Default::default()
        };
        let mut failures = FailuresLog::new();
        let merged = merge_results(&query, vec![local, remote], &mut failures);
        assert_eq!(merged.matches.len(), 1);
        assert_eq!(merged.matches[0].weight, 2);
    }

    #[test]
    fn mismatched_word_stats_warn_but_keep_results() {
        let schema = int_schema();
        let mut local = result_with(&[1], 0, &schema);
        local.words.push(crate::search::WordStat { word: "a".to_string(), docs: 1, hits: 1 });
        let mut remote = result_with(&[2], 1, &schema);
        remote.words.push(crate::search::WordStat { word: "b".to_string(), docs: 1, hits: 1 });

        let query = SearchQuery::default();
        let mut failures = FailuresLog::new();
        let merged = merge_results(&query, vec![local, remote], &mut failures);
        assert_eq!(merged.matches.len(), 2);
        assert!(merged.warning.as_deref().unwrap_or("").contains("mismatch"));
        assert_eq!(merged.words[0].word, "a");
    }
}
