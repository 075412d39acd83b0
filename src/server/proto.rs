use bytes::{BufMut, BytesMut};

use crate::core::error::{Error, Result};
use crate::core::types::DocId;
use crate::schema::attr::AttrType;
use crate::schema::row::mva_values;
use crate::schema::schema::Schema;
use crate::search::filter::{FilterOp, FilterSpec};
use crate::search::ranker::RankMode;
use crate::search::{
    GeoAnchor, MatchMode, SearchQuery, SearchResult, SortMode, WordStat,
};
use crate::sort::groupby::{GroupFunc, GroupSpec};

/// Server hello; ancient clients sent it back in host order, so both
/// spellings are accepted.
pub const SEARCHD_PROTO: u32 = 1;
pub const SEARCHD_PROTO_SWAPPED: u32 = 0x0100_0000;
pub const CLIENT_VERSION: u32 = 1;

pub const COMMAND_SEARCH: u16 = 0;
pub const COMMAND_EXCERPT: u16 = 1;
pub const COMMAND_UPDATE: u16 = 2;
pub const COMMAND_KEYWORDS: u16 = 3;
pub const COMMAND_PERSIST: u16 = 4;
pub const COMMAND_STATUS: u16 = 5;
pub const COMMAND_QUERY: u16 = 6;

pub const VER_COMMAND_SEARCH: u16 = 0x116;
pub const VER_COMMAND_UPDATE: u16 = 0x102;
pub const VER_COMMAND_KEYWORDS: u16 = 0x100;
pub const VER_COMMAND_STATUS: u16 = 0x100;
pub const VER_COMMAND_QUERY: u16 = 0x100;

pub const STATUS_OK: u16 = 0;
pub const STATUS_ERROR: u16 = 1;
pub const STATUS_RETRY: u16 = 2;
pub const STATUS_WARNING: u16 = 3;

// attribute type codes on the wire
const ATTR_INTEGER: u32 = 1;
const ATTR_TIMESTAMP: u32 = 2;
const ATTR_ORDINAL: u32 = 3;
const ATTR_BOOL: u32 = 4;
const ATTR_FLOAT: u32 = 5;
const ATTR_BIGINT: u32 = 6;
const ATTR_MVA_FLAG: u32 = 0x4000_0000;

const FILTER_VALUES: u32 = 0;
const FILTER_RANGE: u32 = 1;
const FILTER_FLOATRANGE: u32 = 2;

/// Big-endian cursor over a received frame body.
pub struct NetReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> NetReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        NetReader { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::protocol("truncated request body".to_string()));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    /// 4-byte big-endian length, then UTF-8 bytes.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        if len > 8 * 1024 * 1024 {
            return Err(Error::protocol(format!("oversized string ({} bytes)", len)));
        }
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Big-endian frame body builder.
pub struct NetWriter {
    pub buf: BytesMut,
}

impl NetWriter {
    pub fn new() -> Self {
        NetWriter { buf: BytesMut::with_capacity(256) }
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.put_u32(v.to_bits());
    }

    pub fn put_string(&mut self, s: &str) {
        self.buf.put_u32(s.len() as u32);
        self.buf.put_slice(s.as_bytes());
    }

    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }
}

impl Default for NetWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes the multi-query Search body into per-query requests.
pub fn decode_search_request(body: &[u8], max_queries: usize) -> Result<Vec<SearchQuery>> {
    let mut r = NetReader::new(body);
    let n_queries = r.read_u32()? as usize;
    if n_queries == 0 || n_queries > max_queries {
        return Err(Error::protocol(format!("bad multi-query count {}", n_queries)));
    }
    let mut queries = Vec::with_capacity(n_queries);
    for _ in 0..n_queries {
        queries.push(decode_one_query(&mut r)?);
    }
    Ok(queries)
}

fn decode_one_query(r: &mut NetReader) -> Result<SearchQuery> {
    let mut q = SearchQuery {
        offset: r.read_u32()? as usize,
        limit: r.read_u32()? as usize,
        ..Default::default()
    };
    q.mode = MatchMode::from_wire(r.read_u32()?)?;
    q.ranker = RankMode::from_wire(r.read_u32()?)?;
    q.sort_mode = SortMode::from_wire(r.read_u32()?)?;
    q.sort_by = r.read_string()?;
    q.query = r.read_string()?;

    let nweights = r.read_u32()? as usize;
    if nweights > crate::core::types::MAX_FIELDS {
        return Err(Error::protocol(format!("too many weights ({})", nweights)));
    }
    for _ in 0..nweights {
        q.weights.push(r.read_u32()?);
    }

    q.indexes = r.read_string()?;
    let id64 = r.read_u32()?;
    if id64 != 0 {
        q.min_id = r.read_u64()?;
        q.max_id = r.read_u64()?;
    } else {
        q.min_id = r.read_u32()? as u64;
        q.max_id = r.read_u32()? as u64;
    }
    if q.max_id == 0 {
        q.max_id = DocId::MAX;
    }

    let nfilters = r.read_u32()? as usize;
    for _ in 0..nfilters {
        let attr = r.read_string()?;
        let kind = r.read_u32()?;
        let op = match kind {
            FILTER_VALUES => {
                let count = r.read_u32()? as usize;
                let mut values = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    values.push(r.read_u64()? as i64);
                }
                FilterOp::Values(values)
            }
            FILTER_RANGE => FilterOp::Range {
                min: r.read_u64()? as i64,
                max: r.read_u64()? as i64,
            },
            FILTER_FLOATRANGE => FilterOp::FloatRange {
                min: r.read_f32()?,
                max: r.read_f32()?,
            },
            other => {
                return Err(Error::protocol(format!("unknown filter type {}", other)));
            }
        };
        let exclude = r.read_u32()? != 0;
        q.filters.push(FilterSpec { attr, op, exclude });
    }

    let group_func = r.read_u32()?;
    let group_by = r.read_string()?;
    q.max_matches = r.read_u32()? as usize;
    let group_sort = r.read_string()?;
    q.cutoff = r.read_u32()? as usize;
    q.retry_count = r.read_u32()?;
    q.retry_delay_ms = r.read_u32()?;
    let group_distinct = r.read_string()?;
    if !group_by.is_empty() {
        q.group = Some(GroupSpec {
            func: GroupFunc::from_wire(group_func)?,
            attr: group_by,
            group_sort: if group_sort.is_empty() { "@group desc".to_string() } else { group_sort },
            distinct: if group_distinct.is_empty() { None } else { Some(group_distinct) },
        });
    }

    if r.read_u32()? != 0 {
        q.geo = Some(GeoAnchor {
            lat_attr: r.read_string()?,
            lon_attr: r.read_string()?,
            lat: r.read_f32()?,
            lon: r.read_f32()?,
        });
    }

    let n_index_weights = r.read_u32()? as usize;
    for _ in 0..n_index_weights {
        let name = r.read_string()?;
        let weight = r.read_u32()?;
        q.index_weights.push((name, weight));
    }

    q.max_query_ms = r.read_u32()?;

    let n_field_weights = r.read_u32()? as usize;
    for _ in 0..n_field_weights {
        let name = r.read_string()?;
        let weight = r.read_u32()?;
        q.field_weights.push((name, weight));
    }

    q.comment = r.read_string()?;

    let n_overrides = r.read_u32()? as usize;
    for _ in 0..n_overrides {
        let attr = r.read_string()?;
        let _type_code = r.read_u32()?;
        let count = r.read_u32()? as usize;
        let mut values = std::collections::HashMap::with_capacity(count.min(1024));
        for _ in 0..count {
            let doc_id = r.read_u64()?;
            let value = r.read_u64()?;
            values.insert(doc_id, value);
        }
        q.overrides.push((attr, values));
    }

    q.select = r.read_string()?;
    if q.select.trim().is_empty() {
        q.select = "*".to_string();
    }
    Ok(q)
}

/// Mirror of `decode_one_query`, used by the distributed agent path.
pub fn encode_query(w: &mut NetWriter, q: &SearchQuery) {
    w.put_u32(q.offset as u32);
    w.put_u32(q.limit as u32);
    w.put_u32(match q.mode {
        MatchMode::All => 0,
        MatchMode::Any => 1,
        MatchMode::Phrase => 2,
        MatchMode::Boolean => 3,
        MatchMode::Extended => 4,
        MatchMode::Fullscan => 5,
    });
    w.put_u32(match q.ranker {
        RankMode::ProximityBm25 => 0,
        RankMode::Bm25 => 1,
        RankMode::None => 2,
        RankMode::Wordcount => 3,
        RankMode::Proximity => 4,
        RankMode::MatchAny => 5,
        RankMode::FieldMask => 6,
    });
    w.put_u32(match q.sort_mode {
        SortMode::Relevance => 0,
        SortMode::AttrDesc => 1,
        SortMode::AttrAsc => 2,
        SortMode::TimeSegments => 3,
        SortMode::Extended => 4,
        SortMode::Expr => 5,
    });
    w.put_string(&q.sort_by);
    w.put_string(&q.query);
    w.put_u32(q.weights.len() as u32);
    for &weight in &q.weights {
        w.put_u32(weight);
    }
    w.put_string(&q.indexes);
    w.put_u32(1); // 64-bit ids
    w.put_u64(q.min_id);
    w.put_u64(q.max_id);

    w.put_u32(q.filters.len() as u32);
    for f in &q.filters {
        w.put_string(&f.attr);
        match &f.op {
            FilterOp::Values(values) => {
                w.put_u32(FILTER_VALUES);
                w.put_u32(values.len() as u32);
                for &v in values {
                    w.put_u64(v as u64);
                }
            }
            FilterOp::Range { min, max } => {
                w.put_u32(FILTER_RANGE);
                w.put_u64(*min as u64);
                w.put_u64(*max as u64);
            }
            FilterOp::FloatRange { min, max } => {
                w.put_u32(FILTER_FLOATRANGE);
                w.put_f32(*min);
                w.put_f32(*max);
            }
        }
        w.put_u32(f.exclude as u32);
    }

    match &q.group {
        Some(group) => {
            w.put_u32(match group.func {
                GroupFunc::Day => 0,
                GroupFunc::Week => 1,
                GroupFunc::Month => 2,
                GroupFunc::Year => 3,
                GroupFunc::Attr => 4,
            });
            w.put_string(&group.attr);
            w.put_u32(q.max_matches as u32);
            w.put_string(&group.group_sort);
            w.put_u32(q.cutoff as u32);
            w.put_u32(q.retry_count);
            w.put_u32(q.retry_delay_ms);
            w.put_string(group.distinct.as_deref().unwrap_or(""));
        }
        None => {
            w.put_u32(4); // GroupFunc::Attr, unused
            w.put_string("");
            w.put_u32(q.max_matches as u32);
            w.put_string("");
            w.put_u32(q.cutoff as u32);
            w.put_u32(q.retry_count);
            w.put_u32(q.retry_delay_ms);
            w.put_string("");
        }
    }

    match &q.geo {
        Some(geo) => {
            w.put_u32(1);
            w.put_string(&geo.lat_attr);
            w.put_string(&geo.lon_attr);
            w.put_f32(geo.lat);
            w.put_f32(geo.lon);
        }
        None => w.put_u32(0),
    }

    w.put_u32(q.index_weights.len() as u32);
    for (name, weight) in &q.index_weights {
        w.put_string(name);
        w.put_u32(*weight);
    }
    w.put_u32(q.max_query_ms);
    w.put_u32(q.field_weights.len() as u32);
    for (name, weight) in &q.field_weights {
        w.put_string(name);
        w.put_u32(*weight);
    }
    w.put_string(&q.comment);
    w.put_u32(q.overrides.len() as u32);
    for (attr, values) in &q.overrides {
        w.put_string(attr);
        w.put_u32(ATTR_INTEGER);
        w.put_u32(values.len() as u32);
        for (&doc_id, &value) in values {
            w.put_u64(doc_id);
            w.put_u64(value);
        }
    }
    w.put_string(&q.select);
}

fn wire_attr_type(kind: AttrType) -> u32 {
    match kind {
        AttrType::Int32 => ATTR_INTEGER,
        AttrType::Int64 => ATTR_BIGINT,
        AttrType::Bool => ATTR_BOOL,
        AttrType::Timestamp => ATTR_TIMESTAMP,
        AttrType::Float32 => ATTR_FLOAT,
        AttrType::Ordinal => ATTR_ORDINAL,
        AttrType::Mva => ATTR_INTEGER | ATTR_MVA_FLAG,
    }
}

fn attr_type_from_wire(code: u32) -> Result<AttrType> {
    if code & ATTR_MVA_FLAG != 0 {
        return Ok(AttrType::Mva);
    }
    Ok(match code {
        ATTR_INTEGER => AttrType::Int32,
        ATTR_TIMESTAMP => AttrType::Timestamp,
        ATTR_ORDINAL => AttrType::Ordinal,
        ATTR_BOOL => AttrType::Bool,
        ATTR_FLOAT => AttrType::Float32,
        ATTR_BIGINT => AttrType::Int64,
        other => return Err(Error::protocol(format!("unknown attribute type code {}", other))),
    })
}

/// Encodes one result set; `mva_pools[tag]` resolves MVA offsets of
/// matches originating from that shard.
pub fn encode_result(w: &mut NetWriter, result: &SearchResult, mva_pools: &[&[u32]]) {
    if let Some(error) = &result.error {
        w.put_u32(STATUS_ERROR as u32);
        w.put_string(error);
        return;
    }
    match &result.warning {
        Some(warning) => {
            w.put_u32(STATUS_WARNING as u32);
            w.put_string(warning);
        }
        None => w.put_u32(STATUS_OK as u32),
    }

    w.put_u32(result.schema.fields.len() as u32);
    for field in &result.schema.fields {
        w.put_string(&field.name);
    }
    w.put_u32(result.schema.attrs.len() as u32);
    for attr in &result.schema.attrs {
        w.put_string(&attr.name);
        w.put_u32(wire_attr_type(attr.kind));
    }

    // paging is applied by the caller before encoding
    let page = &result.matches[..];
    w.put_u32(page.len() as u32);
    w.put_u32(1); // 64-bit ids

    let empty: &[u32] = &[];
    for m in page {
        w.put_u64(m.doc_id);
        w.put_u32(m.weight as u32);
        for attr in &result.schema.attrs {
            match attr.kind {
                AttrType::Float32 => w.put_f32(m.get_attr_float(attr.locator)),
                AttrType::Int64 => w.put_u64(m.get_attr(attr.locator)),
                AttrType::Mva => {
                    let pool = mva_pools
                        .get(m.tag.max(0) as usize)
                        .copied()
                        .unwrap_or(empty);
                    let values = mva_values(pool, m.get_attr(attr.locator));
                    w.put_u32(values.len() as u32);
                    for &v in values {
                        w.put_u32(v);
                    }
                }
                _ => w.put_u32(m.get_attr(attr.locator) as u32),
            }
        }
    }

    w.put_u32(result.total as u32);
    w.put_u32(result.total_found as u32);
    w.put_u32(result.time_ms as u32);
    w.put_u32(result.words.len() as u32);
    for word in &result.words {
        w.put_string(&word.word);
        w.put_u32(word.docs as u32);
        w.put_u32(word.hits as u32);
    }
}

/// Decodes one result set from an agent reply. MVA cells are
/// materialized into a per-result pool so the merge step can re-route
/// them by tag.
pub struct DecodedResult {
    pub result: SearchResult,
    pub mva_pool: Vec<u32>,
}

pub fn decode_result(r: &mut NetReader) -> Result<DecodedResult> {
    let status = r.read_u32()? as u16;
    let mut result = SearchResult::default();
    match status {
        STATUS_OK => {}
        STATUS_WARNING => result.warning = Some(r.read_string()?),
        STATUS_ERROR | STATUS_RETRY => {
            result.error = Some(r.read_string()?);
            return Ok(DecodedResult { result, mva_pool: vec![0] });
        }
        other => {
            return Err(Error::protocol(format!("bad result status {}", other)));
        }
    }

    let mut schema = Schema::new();
    let nfields = r.read_u32()? as usize;
    for _ in 0..nfields {
        let name = r.read_string()?;
        schema.add_field(&name)?;
    }
    let nattrs = r.read_u32()? as usize;
    let mut kinds = Vec::with_capacity(nattrs);
    for _ in 0..nattrs {
        let name = r.read_string()?;
        let kind = attr_type_from_wire(r.read_u32()?)?;
        kinds.push(kind);
        schema.add_attr(&name, kind, 0)?;
    }
    schema.finalize()?;

    let count = r.read_u32()? as usize;
    let id64 = r.read_u32()? != 0;
    let mut mva_pool: Vec<u32> = vec![0];
    for _ in 0..count {
        let doc_id = if id64 { r.read_u64()? } else { r.read_u32()? as u64 };
        let mut m = crate::schema::row::Match::new(doc_id, schema.row_size);
        m.weight = r.read_u32()? as i32;
        for (attr, kind) in schema.attrs.iter().zip(&kinds) {
            match kind {
                AttrType::Float32 => {
                    let v = r.read_f32()?;
                    m.set_attr(attr.locator, v.to_bits() as u64);
                }
                AttrType::Int64 => {
                    let v = r.read_u64()?;
                    m.set_attr(attr.locator, v);
                }
                AttrType::Mva => {
                    let n = r.read_u32()? as usize;
                    let offset = if n == 0 { 0 } else { mva_pool.len() as u32 };
                    if n > 0 {
                        mva_pool.push(n as u32);
                        for _ in 0..n {
                            mva_pool.push(r.read_u32()?);
                        }
                    }
                    m.set_attr(attr.locator, offset as u64);
                }
                _ => {
                    let v = r.read_u32()?;
                    m.set_attr(attr.locator, v as u64);
                }
            }
        }
        result.matches.push(m);
    }

    result.schema = schema;
    result.total = r.read_u32()? as u64;
    result.total_found = r.read_u32()? as u64;
    result.time_ms = r.read_u32()? as u64;
    let nwords = r.read_u32()? as usize;
    for _ in 0..nwords {
        let word = r.read_string()?;
        let docs = r.read_u32()? as u64;
        let hits = r.read_u32()? as u64;
        result.words.push(WordStat { word, docs, hits });
    }
    Ok(DecodedResult { result, mva_pool })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_round_trip() {
        let mut q = SearchQuery {
            query: "hello @title world".to_string(),
            indexes: "test1,test2".to_string(),
            offset: 5,
            limit: 15,
            ..Default::default()
        };
        q.filters.push(FilterSpec {
            attr: "views".to_string(),
            op: FilterOp::Range { min: 1, max: 10 },
            exclude: false,
        });
        q.group = Some(GroupSpec {
            func: GroupFunc::Attr,
            attr: "category".to_string(),
            group_sort: "@count desc".to_string(),
            distinct: None,
        });

        let mut w = NetWriter::new();
        w.put_u32(1);
        encode_query(&mut w, &q);
        let body = w.into_bytes();

        let queries = decode_search_request(&body, 32).unwrap();
        assert_eq!(queries.len(), 1);
        let decoded = &queries[0];
        assert_eq!(decoded.query, q.query);
        assert_eq!(decoded.offset, 5);
        assert_eq!(decoded.filters, q.filters);
        assert_eq!(decoded.group.as_ref().unwrap().attr, "category");
    }

    #[test]
    fn result_round_trip_with_mva() {
        let mut schema = Schema::new();
        schema.add_field("title").unwrap();
        schema.add_attr("views", AttrType::Int32, 0).unwrap();
        schema.add_attr("tags", AttrType::Mva, 0).unwrap();
        schema.finalize().unwrap();

        let pool = [0u32, 2, 5, 6];
        let mut m = crate::schema::row::Match::new(42, schema.row_size);
        m.weight = 1001;
        m.set_attr(schema.attr("views").unwrap().locator, 9);
        m.set_attr(schema.attr("tags").unwrap().locator, 1);

        let result = SearchResult {
            matches: vec![m],
            schema,
            total: 1,
            total_found: 1,
            words: vec![WordStat { word: "hello".to_string(), docs: 1, hits: 2 }],
            ..Default::default()
        };

        let mut w = NetWriter::new();
        encode_result(&mut w, &result, &[&pool]);
        let body = w.into_bytes();

        let decoded = decode_result(&mut NetReader::new(&body)).unwrap();
        assert!(decoded.result.error.is_none());
        assert_eq!(decoded.result.matches.len(), 1);
        let dm = &decoded.result.matches[0];
        assert_eq!(dm.doc_id, 42);
        assert_eq!(dm.weight, 1001);
        let views = decoded.result.schema.attr("views").unwrap().locator;
        assert_eq!(dm.get_attr(views), 9);
        let tags = decoded.result.schema.attr("tags").unwrap().locator;
        assert_eq!(
            mva_values(&decoded.mva_pool, dm.get_attr(tags)),
            &[5, 6]
        );
        assert_eq!(decoded.result.words[0].word, "hello");
    }

    #[test]
    fn truncated_body_is_a_protocol_error() {
        let mut w = NetWriter::new();
        w.put_u32(1);
        w.put_u32(0);
        let body = w.into_bytes();
        assert!(decode_search_request(&body, 32).is_err());
    }
}
