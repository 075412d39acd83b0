use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use sift::core::config::{Config, IndexConfig, SearchdConfig};
use sift::index::segment::{DocinfoMode, IndexSettings, SegmentPaths, CHECKPOINT_EVERY};
use sift::indexer::IndexBuilder;
use sift::schema::schema::Schema;
use sift::search::{SearchQuery, MatchMode};
use sift::server::proto::{
    decode_result, encode_query, NetReader, NetWriter, CLIENT_VERSION, COMMAND_SEARCH,
    SEARCHD_PROTO, STATUS_OK, VER_COMMAND_SEARCH,
};
use sift::server::{handlers, ServerCtx};
use sift::source::VecSource;

fn one_field_schema() -> Schema {
    let mut schema = Schema::new();
    schema.add_field("content").unwrap();
    schema.finalize().unwrap();
    schema
}

fn build_index(prefix: &std::path::Path, docs: &[(u64, &str)]) {
    let settings = IndexSettings {
        min_word_len: 1,
        dict: Default::default(),
        checkpoint_every: CHECKPOINT_EVERY,
    };
    let builder = IndexBuilder::new(SegmentPaths::new(prefix), DocinfoMode::Extern, settings);
    let docs = docs
        .iter()
        .map(|&(id, text)| (id, vec![text.to_string()], vec![]))
        .collect();
    builder
        .build(vec![Box::new(VecSource::new(one_field_schema(), docs))], None)
        .unwrap();
}

fn index_config(path: &std::path::Path) -> IndexConfig {
    // deserialization fills the defaults the tests do not care about
    let mut config: IndexConfig = serde_json::from_str(&format!(
        r#"{{ "path": {:?}, "sources": [] }}"#,
        path.to_string_lossy()
    ))
    .unwrap();
    config.sources = Vec::new();
    config
}

fn base_port() -> u16 {
    19000 + (std::process::id() % 500) as u16
}

fn server_config(dir: &std::path::Path, port: u16, indexes: HashMap<String, IndexConfig>) -> Config {
    let searchd: SearchdConfig = serde_json::from_str(&format!(
        r#"{{
            "listen": ["127.0.0.1:{}"],
            "log": {:?},
            "pid_file": {:?}
        }}"#,
        port,
        dir.join("searchd.log").to_string_lossy(),
        dir.join("searchd.pid").to_string_lossy(),
    ))
    .unwrap();
    Config {
        sources: HashMap::new(),
        indexes,
        indexer: Default::default(),
        searchd,
    }
}

async fn sphinx_search(addr: &str, query: &SearchQuery) -> sift::search::SearchResult {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let hello = stream.read_u32().await.unwrap();
    assert_eq!(hello, SEARCHD_PROTO);
    stream.write_u32(CLIENT_VERSION).await.unwrap();

    let mut body = NetWriter::new();
    body.put_u32(1);
    encode_query(&mut body, query);
    let body = body.into_bytes();

    let mut frame = NetWriter::new();
    frame.put_u16(COMMAND_SEARCH);
    frame.put_u16(VER_COMMAND_SEARCH);
    frame.put_u32(body.len() as u32);
    stream.write_all(&frame.into_bytes()).await.unwrap();
    stream.write_all(&body).await.unwrap();

    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await.unwrap();
    let status = u16::from_be_bytes([header[0], header[1]]);
    assert_eq!(status, STATUS_OK);
    let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await.unwrap();

    decode_result(&mut NetReader::new(&payload)).unwrap().result
}

#[tokio::test(flavor = "multi_thread")]
async fn sphinx_protocol_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    build_index(&dir.path().join("test1"), &[(1, "hello world"), (2, "hello again")]);

    let port = base_port();
    let mut indexes = HashMap::new();
    indexes.insert("test1".to_string(), index_config(&dir.path().join("test1")));
    let config = server_config(dir.path(), port, indexes);

    let ctx = ServerCtx::new(config).unwrap();
    let server_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        let _ = sift::server::run(server_ctx).await;
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let query = SearchQuery {
        query: "hello".to_string(),
        indexes: "test1".to_string(),
        mode: MatchMode::Extended,
        ..Default::default()
    };
    let result = sphinx_search(&format!("127.0.0.1:{}", port), &query).await;
    assert!(result.error.is_none());
    let docs: Vec<u64> = result.matches.iter().map(|m| m.doc_id).collect();
    assert_eq!(docs, [1, 2]);
    assert_eq!(result.total_found, 2);
    assert_eq!(result.words.len(), 1);
    assert_eq!(result.words[0].word, "hello");
    assert_eq!(result.words[0].docs, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn distributed_fan_out_merges_local_and_remote() {
    let dir = tempfile::tempdir().unwrap();
    build_index(&dir.path().join("shard1"), &[(1, "word"), (3, "word")]);
    build_index(&dir.path().join("shard2"), &[(2, "word"), (4, "word")]);

    // remote daemon serving shard2
    let remote_port = base_port() + 1;
    let mut remote_indexes = HashMap::new();
    remote_indexes.insert("shard2".to_string(), index_config(&dir.path().join("shard2")));
    let remote_config = server_config(dir.path(), remote_port, remote_indexes);
    let remote_ctx = ServerCtx::new(remote_config).unwrap();
    let spawn_ctx = Arc::clone(&remote_ctx);
    tokio::spawn(async move {
        let _ = sift::server::run(spawn_ctx).await;
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    // head daemon: shard1 local, shard2 behind an agent
    let mut head_indexes = HashMap::new();
    head_indexes.insert("shard1".to_string(), index_config(&dir.path().join("shard1")));
    let mut dist: IndexConfig = serde_json::from_str(&format!(
        r#"{{
            "type": "distributed",
            "local": ["shard1"],
            "agents": ["127.0.0.1:{}:shard2"]
        }}"#,
        remote_port
    ))
    .unwrap();
    dist.path = String::new();
    head_indexes.insert("dist".to_string(), dist);
    let head_config = server_config(dir.path(), base_port() + 2, head_indexes);
    let head_ctx = ServerCtx::new(head_config).unwrap();

    let query = SearchQuery {
        query: "word".to_string(),
        indexes: "dist".to_string(),
        ..Default::default()
    };
    let (result, _pools) = handlers::execute_query(&head_ctx, &query).await;
    assert!(result.error.is_none(), "distributed query failed: {:?}", result.error);
    let mut docs: Vec<u64> = result.matches.iter().map(|m| m.doc_id).collect();
    docs.sort_unstable();
    assert_eq!(docs, [1, 2, 3, 4]);
    assert_eq!(result.total_found, 4);

    // agent down: partial results come back with a warning; the head
    // context must drop first so the shard1 lock frees up
    drop(_pools);
    drop(remote_ctx);
    drop(head_ctx);
    let query = SearchQuery {
        query: "word".to_string(),
        indexes: "dist".to_string(),
        retry_count: 1,
        retry_delay_ms: 10,
        ..Default::default()
    };
    let mut broken_indexes = HashMap::new();
    broken_indexes.insert("shard1".to_string(), index_config(&dir.path().join("shard1")));
    let mut broken: IndexConfig = serde_json::from_str(
        r#"{ "type": "distributed", "local": ["shard1"], "agents": ["127.0.0.1:1:shard2"] }"#,
    )
    .unwrap();
    broken.path = String::new();
    broken_indexes.insert("dist".to_string(), broken);
    let broken_config = server_config(dir.path(), base_port() + 3, broken_indexes);
    let broken_ctx = ServerCtx::new(broken_config).unwrap();

    let (result, _pools) = handlers::execute_query(&broken_ctx, &query).await;
    assert!(result.error.is_none());
    let docs: Vec<u64> = result.matches.iter().map(|m| m.doc_id).collect();
    assert_eq!(docs, [1, 3]);
    assert!(result.warning.is_some());
}
