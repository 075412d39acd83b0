use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::core::error::{Error, Result};
use crate::schema::attr::AttrType;
use crate::schema::row::mva_values;
use crate::search::filter::{FilterOp, FilterSpec};
use crate::search::{MatchMode, SearchQuery, SearchResult, SortMode};
use crate::server::handlers::{self, MvaSource};
use crate::server::proto::NetWriter;
use crate::server::ServerCtx;
use crate::sort::groupby::{GroupFunc, GroupSpec};

const CAP_PROTOCOL_41: u32 = 0x0200;
const CAP_CONNECT_WITH_DB: u32 = 0x0008;

const COM_QUIT: u8 = 0x01;
const COM_INIT_DB: u8 = 0x02;
const COM_QUERY: u8 = 0x03;
const COM_PING: u8 = 0x0e;

const TYPE_DECIMAL: u8 = 0x00;
const TYPE_STRING: u8 = 0xfe;

/// Per-connection SphinxQL state feeding SHOW WARNINGS / SHOW META.
#[derive(Default)]
struct SqlState {
    last_warning: Option<String>,
    last_meta: Vec<(String, String)>,
}

/// Classic MySQL packet: 3-byte little-endian length plus sequence id.
async fn write_packet(stream: &mut TcpStream, seq: &mut u8, payload: &[u8]) -> Result<()> {
    let len = payload.len();
    let header = [len as u8, (len >> 8) as u8, (len >> 16) as u8, *seq];
    *seq = seq.wrapping_add(1);
    stream.write_all(&header).await?;
    stream.write_all(payload).await?;
    Ok(())
}

async fn read_packet(stream: &mut TcpStream, seq: &mut u8) -> Result<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let len = header[0] as usize | (header[1] as usize) << 8 | (header[2] as usize) << 16;
    *seq = header[3].wrapping_add(1);
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

fn put_lenenc_int(out: &mut Vec<u8>, v: u64) {
    if v < 251 {
        out.push(v as u8);
    } else if v < 65_536 {
        out.push(0xfc);
        out.extend_from_slice(&(v as u16).to_le_bytes());
    } else if v < 16_777_216 {
        out.push(0xfd);
        out.extend_from_slice(&(v as u32).to_le_bytes()[..3]);
    } else {
        out.push(0xfe);
        out.extend_from_slice(&v.to_le_bytes());
    }
}

fn put_lenenc_str(out: &mut Vec<u8>, s: &str) {
    put_lenenc_int(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

fn ok_packet() -> Vec<u8> {
    let mut p = vec![0x00];
    put_lenenc_int(&mut p, 0); // affected rows
    put_lenenc_int(&mut p, 0); // last insert id
    p.extend_from_slice(&2u16.to_le_bytes()); // autocommit
    p.extend_from_slice(&0u16.to_le_bytes()); // warnings
    p
}

fn eof_packet(warnings: u16) -> Vec<u8> {
    let mut p = vec![0xfe];
    p.extend_from_slice(&warnings.to_le_bytes());
    p.extend_from_slice(&2u16.to_le_bytes());
    p
}

fn error_packet(message: &str) -> Vec<u8> {
    let mut p = vec![0xff];
    p.extend_from_slice(&1064u16.to_le_bytes());
    p.push(b'#');
    p.extend_from_slice(b"42000");
    p.extend_from_slice(message.as_bytes());
    p
}

fn column_packet(name: &str, numeric: bool) -> Vec<u8> {
    let mut p = Vec::with_capacity(64);
    put_lenenc_str(&mut p, "def");
    put_lenenc_str(&mut p, "");
    put_lenenc_str(&mut p, "");
    put_lenenc_str(&mut p, "");
    put_lenenc_str(&mut p, name);
    put_lenenc_str(&mut p, "");
    p.push(0x0c); // fixed fields length
    p.extend_from_slice(&0x21u16.to_le_bytes()); // utf8 charset
    p.extend_from_slice(&255u32.to_le_bytes()); // column length
    p.push(if numeric { TYPE_DECIMAL } else { TYPE_STRING });
    p.extend_from_slice(&0u16.to_le_bytes()); // flags
    p.push(0); // decimals
    p.extend_from_slice(&0u16.to_le_bytes()); // filler
    p
}

/// Full MySQL41 session: handshake, accept any auth, then COM_QUERY
/// statements until COM_QUIT.
pub async fn serve_mysql(ctx: &Arc<ServerCtx>, stream: &mut TcpStream) -> Result<()> {
    let mut seq = 0u8;

    // server greeting, protocol version 10
    let mut hello = Vec::with_capacity(80);
    hello.push(10);
    hello.extend_from_slice(b"sift-0.1.0\0");
    hello.extend_from_slice(&1u32.to_le_bytes()); // thread id
    hello.extend_from_slice(b"12345678\0"); // scramble part 1
    let caps = CAP_PROTOCOL_41 | CAP_CONNECT_WITH_DB;
    hello.extend_from_slice(&(caps as u16).to_le_bytes());
    hello.push(0x21); // utf8
    hello.extend_from_slice(&2u16.to_le_bytes()); // status
    hello.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
    hello.push(0); // auth plugin data length
    hello.extend_from_slice(&[0u8; 10]); // reserved
    hello.extend_from_slice(b"123456789012\0"); // scramble part 2
    write_packet(stream, &mut seq, &hello).await?;

    // any credentials are accepted
    let _auth = read_packet(stream, &mut seq).await?;
    write_packet(stream, &mut seq, &ok_packet()).await?;

    let mut state = SqlState::default();
    loop {
        let mut seq = 0u8;
        let packet = match read_packet(stream, &mut seq).await {
            Ok(p) => p,
            Err(_) => return Ok(()), // disconnect
        };
        if packet.is_empty() {
            continue;
        }
        match packet[0] {
            COM_QUIT => return Ok(()),
            COM_INIT_DB | COM_PING => {
                write_packet(stream, &mut seq, &ok_packet()).await?;
            }
            COM_QUERY => {
                let statement = String::from_utf8_lossy(&packet[1..]).into_owned();
                let reply = run_statement(ctx, &statement, &mut state).await;
                for packet in reply {
                    write_packet(stream, &mut seq, &packet).await?;
                }
            }
            other => {
                write_packet(
                    stream,
                    &mut seq,
                    &error_packet(&format!("unknown command 0x{:02x}", other)),
                )
                .await?;
            }
        }
    }
}

/// COMMAND_QUERY wrapper on the Sphinx protocol: the body is one
/// SphinxQL statement, the reply body is the raw MySQL packet stream.
pub async fn handle_wrapped_query(ctx: &Arc<ServerCtx>, body: &[u8]) -> Result<NetWriter> {
    let mut r = crate::server::proto::NetReader::new(body);
    let statement = r.read_string()?;
    let mut state = SqlState::default();
    let packets = run_statement(ctx, &statement, &mut state).await;

    let mut w = NetWriter::new();
    let mut seq = 0u8;
    for packet in packets {
        let len = packet.len();
        w.buf.extend_from_slice(&[len as u8, (len >> 8) as u8, (len >> 16) as u8, seq]);
        w.buf.extend_from_slice(&packet);
        seq = seq.wrapping_add(1);
    }
    Ok(w)
}

async fn run_statement(
    ctx: &Arc<ServerCtx>,
    statement: &str,
    state: &mut SqlState,
) -> Vec<Vec<u8>> {
    let trimmed = statement.trim().trim_end_matches(';').trim();
    let lowered = trimmed.to_lowercase();

    if lowered.starts_with("select") {
        match parse_select(trimmed) {
            Ok(query) => {
                let (mut result, mva_sources) = handlers::execute_query(ctx, &query).await;
                if let Some(error) = &result.error {
                    state.last_warning = Some(error.clone());
                    return vec![error_packet(error)];
                }
                handlers::apply_paging(&mut result, query.offset, query.limit);
                state.last_warning = result.warning.clone();
                state.last_meta = build_meta(&result);
                encode_result_set(&result, &mva_sources)
            }
            Err(e) => {
                state.last_warning = Some(e.context.clone());
                vec![error_packet(&e.context)]
            }
        }
    } else if lowered == "show warnings" {
        let rows: Vec<Vec<String>> = match &state.last_warning {
            Some(w) => vec![vec!["warning".to_string(), "1000".to_string(), w.clone()]],
            None => Vec::new(),
        };
        table_reply(&["Level", "Code", "Message"], &[false, true, false], &rows)
    } else if lowered == "show status" {
        let rows: Vec<Vec<String>> = ctx
            .stats
            .render()
            .into_iter()
            .map(|(k, v)| vec![k, v])
            .collect();
        table_reply(&["Counter", "Value"], &[false, false], &rows)
    } else if lowered == "show meta" {
        let rows: Vec<Vec<String>> = state
            .last_meta
            .iter()
            .map(|(k, v)| vec![k.clone(), v.clone()])
            .collect();
        table_reply(&["Variable_name", "Value"], &[false, false], &rows)
    } else if lowered.starts_with("set ") {
        vec![ok_packet()]
    } else {
        vec![error_packet(&format!("unknown statement near '{}'", trimmed))]
    }
}

fn build_meta(result: &SearchResult) -> Vec<(String, String)> {
    let mut meta = vec![
        ("total".to_string(), result.total.to_string()),
        ("total_found".to_string(), result.total_found.to_string()),
        (
            "time".to_string(),
            format!("{}.{:03}", result.time_ms / 1000, result.time_ms % 1000),
        ),
    ];
    for (i, word) in result.words.iter().enumerate() {
        meta.push((format!("keyword[{}]", i), word.word.clone()));
        meta.push((format!("docs[{}]", i), word.docs.to_string()));
        meta.push((format!("hits[{}]", i), word.hits.to_string()));
    }
    meta
}

fn table_reply(names: &[&str], numeric: &[bool], rows: &[Vec<String>]) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    let mut count = Vec::new();
    put_lenenc_int(&mut count, names.len() as u64);
    packets.push(count);
    for (name, &num) in names.iter().zip(numeric) {
        packets.push(column_packet(name, num));
    }
    packets.push(eof_packet(0));
    for row in rows {
        let mut p = Vec::new();
        for value in row {
            put_lenenc_str(&mut p, value);
        }
        packets.push(p);
    }
    packets.push(eof_packet(0));
    packets
}

/// Result set: `id`, `weight`, then every attribute. Numeric columns
/// report DECIMAL, everything else STRING; MVAs render as
/// comma-separated values.
fn encode_result_set(result: &SearchResult, mva_sources: &[MvaSource]) -> Vec<Vec<u8>> {
    let mut names: Vec<&str> = vec!["id", "weight"];
    let mut numeric = vec![true, true];
    for attr in &result.schema.attrs {
        names.push(&attr.name);
        numeric.push(!matches!(attr.kind, AttrType::Mva | AttrType::Ordinal));
    }

    let mut rows: Vec<Vec<String>> = Vec::with_capacity(result.matches.len());
    for m in &result.matches {
        let mut row = vec![m.doc_id.to_string(), m.weight.to_string()];
        for attr in &result.schema.attrs {
            let text = match attr.kind {
                AttrType::Float32 => format!("{}", m.get_attr_float(attr.locator)),
                AttrType::Mva => {
                    let pool = mva_sources
                        .get(m.tag.max(0) as usize)
                        .map(|s| s.pool())
                        .unwrap_or(&[]);
                    let values = mva_values(pool, m.get_attr(attr.locator));
                    values
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(",")
                }
                _ => m.get_attr(attr.locator).to_string(),
            };
            row.push(text);
        }
        rows.push(row);
    }
    table_reply(&names, &numeric, &rows)
}

// ---------------------------------------------------------------------
// SphinxQL SELECT parsing
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum SqlTok {
    Ident(String),
    Number(i64),
    Float(f32),
    Str(String),
    Symbol(char),
    Neq,
}

fn sql_lex(text: &str) -> Result<Vec<SqlTok>> {
    let mut out = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            s.push('\'');
                            i += 2;
                        }
                        Some('\\') if chars.get(i + 1).is_some() => {
                            s.push(chars[i + 1]);
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err(Error::query("unterminated string".to_string())),
                    }
                }
                out.push(SqlTok::Str(s));
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                out.push(SqlTok::Neq);
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'>') => {
                out.push(SqlTok::Neq);
                i += 2;
            }
            '(' | ')' | ',' | '=' | '<' | '>' | '*' | '+' | '-' | '/' | '.' => {
                out.push(SqlTok::Symbol(c));
                i += 1;
            }
            '0'..='9' => {
                let start = i;
                let mut is_float = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    if chars[i] == '.' {
                        is_float = true;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    out.push(SqlTok::Float(text.parse().map_err(|_| {
                        Error::query(format!("bad number '{}'", text))
                    })?));
                } else {
                    out.push(SqlTok::Number(text.parse().map_err(|_| {
                        Error::query(format!("bad number '{}'", text))
                    })?));
                }
            }
            c if c.is_alphanumeric() || c == '_' || c == '@' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_')
                {
                    i += 1;
                }
                out.push(SqlTok::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(Error::query(format!("unexpected character '{}'", other)));
            }
        }
    }
    Ok(out)
}

struct SqlParser {
    tokens: Vec<SqlTok>,
    pos: usize,
}

impl SqlParser {
    fn peek(&self) -> Option<&SqlTok> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<SqlTok> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn keyword(&mut self, word: &str) -> bool {
        match self.peek() {
            Some(SqlTok::Ident(id)) if id.eq_ignore_ascii_case(word) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.bump() {
            Some(SqlTok::Ident(id)) => Ok(id.to_lowercase()),
            _ => Err(Error::query("expected identifier".to_string())),
        }
    }

    fn expect_number(&mut self) -> Result<i64> {
        match self.bump() {
            Some(SqlTok::Number(n)) => Ok(n),
            Some(SqlTok::Symbol('-')) => match self.bump() {
                Some(SqlTok::Number(n)) => Ok(-n),
                _ => Err(Error::query("expected number".to_string())),
            },
            _ => Err(Error::query("expected number".to_string())),
        }
    }

    fn expect_symbol(&mut self, c: char) -> Result<()> {
        match self.bump() {
            Some(SqlTok::Symbol(s)) if s == c => Ok(()),
            _ => Err(Error::query(format!("expected '{}'", c))),
        }
    }
}

/// `SELECT select_list FROM index [WHERE ..] [GROUP BY ..]
/// [ORDER BY ..] [LIMIT [off,] count] [OPTION k=v, ..]`.
fn parse_select(statement: &str) -> Result<SearchQuery> {
    // ascii lowering keeps byte offsets valid for slicing the original
    let lowered = statement.to_ascii_lowercase();
    let from_at = find_toplevel_from(&lowered)
        .ok_or_else(|| Error::query("missing FROM clause".to_string()))?;
    let select_list = statement[6..from_at].trim().to_string();
    let rest = &statement[from_at + 6..];

    let mut p = SqlParser { tokens: sql_lex(rest)?, pos: 0 };
    let mut query = SearchQuery {
        select: if select_list.is_empty() { "*".to_string() } else { select_list },
        ..Default::default()
    };

    // index list
    let mut indexes = vec![p.expect_ident()?];
    while matches!(p.peek(), Some(SqlTok::Symbol(','))) {
        p.pos += 1;
        indexes.push(p.expect_ident()?);
    }
    query.indexes = indexes.join(",");

    if p.keyword("where") {
        loop {
            parse_condition(&mut p, &mut query)?;
            if !p.keyword("and") {
                break;
            }
        }
    }

    if p.keyword("group") {
        if !p.keyword("by") {
            return Err(Error::query("expected BY after GROUP".to_string()));
        }
        let attr = p.expect_ident()?;
        query.group = Some(GroupSpec {
            func: GroupFunc::Attr,
            attr,
            group_sort: "@group desc".to_string(),
            distinct: None,
        });
    }

    if p.keyword("order") {
        if !p.keyword("by") {
            return Err(Error::query("expected BY after ORDER".to_string()));
        }
        let mut clauses = Vec::new();
        loop {
            let ident = p.expect_ident()?;
            let dir = if p.keyword("asc") {
                "asc"
            } else if p.keyword("desc") {
                "desc"
            } else {
                "asc"
            };
            clauses.push(format!("{} {}", ident, dir));
            if !matches!(p.peek(), Some(SqlTok::Symbol(','))) {
                break;
            }
            p.pos += 1;
        }
        query.sort_mode = SortMode::Extended;
        query.sort_by = clauses.join(", ");
    }

    if p.keyword("limit") {
        let first = p.expect_number()? as usize;
        if matches!(p.peek(), Some(SqlTok::Symbol(','))) {
            p.pos += 1;
            query.offset = first;
            query.limit = p.expect_number()? as usize;
        } else {
            query.limit = first;
        }
    }

    if p.keyword("option") {
        loop {
            let name = p.expect_ident()?;
            p.expect_symbol('=')?;
            let value = p.expect_number()?;
            match name.as_str() {
                "max_matches" => query.max_matches = value as usize,
                "cutoff" => query.cutoff = value as usize,
                "retry_count" => query.retry_count = value as u32,
                "retry_delay" => query.retry_delay_ms = value as u32,
                "max_query_time" => query.max_query_ms = value as u32,
                other => {
                    return Err(Error::query(format!("unknown option '{}'", other)));
                }
            }
            if !matches!(p.peek(), Some(SqlTok::Symbol(','))) {
                break;
            }
            p.pos += 1;
        }
    }

    if p.peek().is_some() {
        return Err(Error::query("unexpected trailing input in SELECT".to_string()));
    }
    Ok(query)
}

fn find_toplevel_from(lowered: &str) -> Option<usize> {
    let bytes = lowered.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut i = 0;
    while i + 6 <= bytes.len() {
        match bytes[i] {
            b'\'' => in_string = !in_string,
            b'(' if !in_string => depth += 1,
            b')' if !in_string => depth = depth.saturating_sub(1),
            _ => {}
        }
        if !in_string && depth == 0 && bytes[i..].starts_with(b" from ") {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn parse_condition(p: &mut SqlParser, query: &mut SearchQuery) -> Result<()> {
    let ident = p.expect_ident()?;

    if ident.eq_ignore_ascii_case("match") {
        p.expect_symbol('(')?;
        let text = match p.bump() {
            Some(SqlTok::Str(s)) => s,
            _ => return Err(Error::query("MATCH() needs a quoted query".to_string())),
        };
        p.expect_symbol(')')?;
        query.query = text;
        query.mode = MatchMode::Extended;
        return Ok(());
    }

    // attribute predicate
    match p.bump() {
        Some(SqlTok::Symbol('=')) => {
            let value = p.expect_number()?;
            push_filter(query, ident, FilterOp::Values(vec![value]), false);
        }
        Some(SqlTok::Neq) => {
            let value = p.expect_number()?;
            push_filter(query, ident, FilterOp::Values(vec![value]), true);
        }
        Some(SqlTok::Symbol('>')) => {
            let eq = matches!(p.peek(), Some(SqlTok::Symbol('=')));
            if eq {
                p.pos += 1;
            }
            let value = p.expect_number()?;
            let min = if eq { value } else { value + 1 };
            push_filter(query, ident, FilterOp::Range { min, max: i64::MAX }, false);
        }
        Some(SqlTok::Symbol('<')) => {
            let eq = matches!(p.peek(), Some(SqlTok::Symbol('=')));
            if eq {
                p.pos += 1;
            }
            let value = p.expect_number()?;
            let max = if eq { value } else { value - 1 };
            push_filter(query, ident, FilterOp::Range { min: i64::MIN, max }, false);
        }
        Some(SqlTok::Ident(kw)) if kw.eq_ignore_ascii_case("between") => {
            let min = p.expect_number()?;
            if !p.keyword("and") {
                return Err(Error::query("expected AND in BETWEEN".to_string()));
            }
            let max = p.expect_number()?;
            push_filter(query, ident, FilterOp::Range { min, max }, false);
        }
        Some(SqlTok::Ident(kw)) if kw.eq_ignore_ascii_case("in") => {
            p.expect_symbol('(')?;
            let mut values = Vec::new();
            loop {
                values.push(p.expect_number()?);
                match p.bump() {
                    Some(SqlTok::Symbol(',')) => continue,
                    Some(SqlTok::Symbol(')')) => break,
                    _ => return Err(Error::query("expected ',' or ')' in IN".to_string())),
                }
            }
            push_filter(query, ident, FilterOp::Values(values), false);
        }
        Some(SqlTok::Ident(kw)) if kw.eq_ignore_ascii_case("not") => {
            if !p.keyword("in") {
                return Err(Error::query("expected IN after NOT".to_string()));
            }
            p.expect_symbol('(')?;
            let mut values = Vec::new();
            loop {
                values.push(p.expect_number()?);
                match p.bump() {
                    Some(SqlTok::Symbol(',')) => continue,
                    Some(SqlTok::Symbol(')')) => break,
                    _ => return Err(Error::query("expected ',' or ')' in IN".to_string())),
                }
            }
            push_filter(query, ident, FilterOp::Values(values), true);
        }
        _ => {
            return Err(Error::query(format!("bad predicate on '{}'", ident)));
        }
    }
    Ok(())
}

fn push_filter(query: &mut SearchQuery, attr: String, op: FilterOp, exclude: bool) {
    query.filters.push(FilterSpec { attr, op, exclude });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_with_match_filters_and_paging() {
        let q = parse_select(
            "SELECT * FROM test1 WHERE MATCH('hello world') AND views > 10 \
             AND category IN (1,2,3) ORDER BY views DESC LIMIT 5, 25 \
             OPTION max_matches=500",
        )
        .unwrap();
        assert_eq!(q.indexes, "test1");
        assert_eq!(q.query, "hello world");
        assert_eq!(q.offset, 5);
        assert_eq!(q.limit, 25);
        assert_eq!(q.max_matches, 500);
        assert_eq!(q.sort_mode, SortMode::Extended);
        assert_eq!(q.sort_by, "views desc");
        assert_eq!(q.filters.len(), 2);
        assert_eq!(
            q.filters[0].op,
            FilterOp::Range { min: 11, max: i64::MAX }
        );
        assert_eq!(q.filters[1].op, FilterOp::Values(vec![1, 2, 3]));
    }

    #[test]
    fn select_group_by() {
        let q = parse_select("SELECT * FROM test1 GROUP BY category").unwrap();
        let group = q.group.unwrap();
        assert_eq!(group.attr, "category");
        assert_eq!(group.group_sort, "@group desc");
    }

    #[test]
    fn bad_statements_are_rejected(){
        assert!(parse_select("SELECT * WHERE MATCH('x')").is_err());
        assert!(parse_select("SELECT * FROM t1 WHERE views !!").is_err());
    }

    #[test]
    fn select_list_survives_verbatim() {
        let q = parse_select("SELECT id, views*2 AS doubled FROM test1").unwrap();
        assert_eq!(q.select, "id, views*2 AS doubled");
    }

    #[test]
    fn lenenc_boundaries() {
        let mut out = Vec::new();
        put_lenenc_int(&mut out, 250);
        assert_eq!(out, [250]);
        out.clear();
        put_lenenc_int(&mut out, 251);
        assert_eq!(out, [0xfc, 251, 0]);
        out.clear();
        put_lenenc_int(&mut out, 70_000);
        assert_eq!(out, [0xfd, 0x70, 0x11, 0x01]);
    }
}
