use std::collections::HashMap;
use std::fs;
use std::path::Path;
use serde::{Serialize, Deserialize};

use crate::core::error::{Error, Result};

/// Minimum indexing memory budget; smaller configured values are clamped.
pub const MIN_MEM_LIMIT: usize = 32 * 1024 * 1024;

/// Top-level configuration file schema.
///
/// Loaded from a JSON file; every daemon and indexer run shares one file
/// so index definitions stay consistent between the two tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,
    #[serde(default)]
    pub indexes: HashMap<String, IndexConfig>,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub searchd: SearchdConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source adapter type; "tsv" is built in, everything else is plugged.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub path: String,
    /// Full-text field names, in field-id order.
    pub fields: Vec<String>,
    /// Attribute declarations, in row order.
    #[serde(default)]
    pub attrs: Vec<AttrConfig>,
    /// Docids to suppress in earlier indexes of a multi-index query.
    #[serde(default)]
    pub kill_list: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttrConfig {
    pub name: String,
    /// One of: uint, bigint, bool, timestamp, float, ordinal, mva.
    #[serde(rename = "type")]
    pub kind: String,
    /// Bit width override for uint attributes (1..=32).
    #[serde(default)]
    pub bits: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// "plain" (default) or "distributed".
    #[serde(default = "default_index_type", rename = "type")]
    pub kind: String,
    /// Segment path prefix; the seven index files share it.
    #[serde(default)]
    pub path: String,
    /// Source names, indexed in order.
    #[serde(default)]
    pub sources: Vec<String>,
    /// "extern" (default), "inline" or "none".
    #[serde(default = "default_docinfo")]
    pub docinfo: String,
    #[serde(default = "default_min_word_len")]
    pub min_word_len: usize,
    #[serde(default)]
    pub stopwords: Option<String>,
    #[serde(default)]
    pub wordforms: Option<String>,
    /// "stem_en" enables English stemming; absent means none.
    #[serde(default)]
    pub morphology: Option<String>,

    // distributed-only settings
    #[serde(default)]
    pub local: Vec<String>,
    /// "host:port:idx1,idx2" specs.
    #[serde(default)]
    pub agents: Vec<String>,
    /// Agents that receive queries but whose replies are discarded.
    #[serde(default)]
    pub blackhole_agents: Vec<String>,
    #[serde(default = "default_connect_timeout")]
    pub agent_connect_timeout_ms: u64,
    #[serde(default = "default_query_timeout")]
    pub agent_query_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default = "default_mem_limit")]
    pub mem_limit: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        IndexerConfig { mem_limit: default_mem_limit() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchdConfig {
    /// Listener specs: "host:port" or "host:port:mysql41".
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    #[serde(default = "default_log")]
    pub log: String,
    #[serde(default)]
    pub query_log: Option<String>,
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_max_children")]
    pub max_children: usize,
    #[serde(default = "default_max_matches")]
    pub max_matches: usize,
    #[serde(default = "default_seamless_rotate")]
    pub seamless_rotate: bool,
    #[serde(default = "default_attr_flush_period")]
    pub attr_flush_period_secs: u64,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

impl Default for SearchdConfig {
    fn default() -> Self {
        // serde defaults and Default must agree
        serde_json::from_str("{}").expect("empty searchd config")
    }
}

fn default_index_type() -> String { "plain".to_string() }
fn default_docinfo() -> String { "extern".to_string() }
fn default_min_word_len() -> usize { 1 }
fn default_connect_timeout() -> u64 { 1000 }
fn default_query_timeout() -> u64 { 3000 }
fn default_mem_limit() -> usize { MIN_MEM_LIMIT }
fn default_listen() -> Vec<String> { vec!["127.0.0.1:9312".to_string()] }
fn default_log() -> String { "searchd.log".to_string() }
fn default_pid_file() -> String { "searchd.pid".to_string() }
fn default_read_timeout() -> u64 { 5 }
fn default_max_children() -> usize { num_cpus::get() * 8 }
fn default_max_matches() -> usize { 1000 }
fn default_seamless_rotate() -> bool { true }
fn default_attr_flush_period() -> u64 { 0 }
fn default_max_packet_size() -> usize { 8 * 1024 * 1024 }

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, index) in &self.indexes {
            match index.kind.as_str() {
                "plain" => {
                    if index.path.is_empty() {
                        return Err(Error::config(format!("index '{}': path is mandatory", name)));
                    }
                    if index.sources.is_empty() {
                        return Err(Error::config(format!("index '{}': at least one source is mandatory", name)));
                    }
                    for src in &index.sources {
                        if !self.sources.contains_key(src) {
                            return Err(Error::config(format!("index '{}': unknown source '{}'", name, src)));
                        }
                    }
                }
                "distributed" => {
                    if index.local.is_empty() && index.agents.is_empty() {
                        return Err(Error::config(format!(
                            "index '{}': distributed index needs local indexes or agents", name)));
                    }
                }
                other => {
                    return Err(Error::config(format!("index '{}': unknown type '{}'", name, other)));
                }
            }
            match index.docinfo.as_str() {
                "extern" | "inline" | "none" => {}
                other => {
                    return Err(Error::config(format!("index '{}': unknown docinfo '{}'", name, other)));
                }
            }
        }
        Ok(())
    }

    /// Effective indexing memory budget with the floor applied.
    pub fn mem_limit(&self) -> usize {
        self.indexer.mem_limit.max(MIN_MEM_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.searchd.seamless_rotate);
        assert_eq!(config.searchd.max_matches, 1000);
        assert_eq!(config.mem_limit(), MIN_MEM_LIMIT);
    }

    #[test]
    fn unknown_source_is_rejected() {
        let text = r#"{
            "indexes": { "test1": { "path": "/tmp/test1", "sources": ["nope"] } }
        }"#;
        let config: Config = serde_json::from_str(text).unwrap();
        assert!(config.validate().is_err());
    }
}
