pub mod client;
pub mod failures;
pub mod flush;
pub mod handlers;
pub mod mysql;
pub mod proto;
pub mod rotation;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;

use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::stats::Stats;
use crate::distributed::{AgentSpec, DistributedIndex};
use crate::index::reader::SearchIndex;
use crate::index::segment::SegmentPaths;
use crate::search::{SearchQuery, SearchResult};

/// Wire protocol spoken on a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Sphinx,
    Mysql41,
}

#[derive(Debug, Clone)]
pub struct ListenSpec {
    pub addr: String,
    pub protocol: Protocol,
}

/// `listen=` forms: "port", "host:port", "host:port:mysql41".
pub fn parse_listen(spec: &str) -> Result<ListenSpec> {
    let parts: Vec<&str> = spec.split(':').collect();
    match parts.as_slice() {
        [port] if port.parse::<u16>().is_ok() => Ok(ListenSpec {
            addr: format!("0.0.0.0:{}", port),
            protocol: Protocol::Sphinx,
        }),
        [host, port] if port.parse::<u16>().is_ok() => Ok(ListenSpec {
            addr: format!("{}:{}", host, port),
            protocol: Protocol::Sphinx,
        }),
        [host, port, proto] if port.parse::<u16>().is_ok() => {
            let protocol = match *proto {
                "sphinx" => Protocol::Sphinx,
                "mysql41" => Protocol::Mysql41,
                other => {
                    return Err(Error::config(format!("unknown listen protocol '{}'", other)));
                }
            };
            Ok(ListenSpec { addr: format!("{}:{}", host, port), protocol })
        }
        _ => Err(Error::config(format!("bad listen spec '{}'", spec))),
    }
}

/// A served index: a swappable local segment or a distributed plan.
pub enum IndexSlot {
    Local(RwLock<Arc<SearchIndex>>),
    Distributed(Arc<DistributedIndex>),
}

/// Shared daemon state; the index map is mutated only by the rotation
/// path, everyone else reads `Arc` snapshots.
pub struct ServerCtx {
    pub config: Config,
    pub indexes: RwLock<HashMap<String, IndexSlot>>,
    pub stats: Arc<Stats>,
    pub active_clients: AtomicUsize,
    pub query_log: Mutex<Option<File>>,
    pub log_file: Mutex<Option<File>>,
}

impl ServerCtx {
    /// Opens every configured index (prealloc, preread, lock) and the
    /// log files. Failures are fatal per index, not for the daemon.
    pub fn new(config: Config) -> Result<Arc<ServerCtx>> {
        let mut indexes = HashMap::new();
        for (name, index_config) in &config.indexes {
            match index_config.kind.as_str() {
                "distributed" => {
                    let mut agents = Vec::new();
                    for spec in &index_config.agents {
                        agents.push(AgentSpec::parse(spec, false)?);
                    }
                    for spec in &index_config.blackhole_agents {
                        agents.push(AgentSpec::parse(spec, true)?);
                    }
                    indexes.insert(
                        name.clone(),
                        IndexSlot::Distributed(Arc::new(DistributedIndex {
                            locals: index_config.local.clone(),
                            agents,
                            connect_timeout_ms: index_config.agent_connect_timeout_ms,
                            query_timeout_ms: index_config.agent_query_timeout_ms,
                        })),
                    );
                }
                _ => {
                    let paths = SegmentPaths::new(&index_config.path);
                    match SearchIndex::open(paths, true) {
                        Ok(index) => {
                            index.preread();
                            indexes.insert(
                                name.clone(),
                                IndexSlot::Local(RwLock::new(Arc::new(index))),
                            );
                            info!("index '{}': loaded", name);
                        }
                        Err(e) => {
                            // other indexes keep serving
                            error!("index '{}': {}", name, e);
                        }
                    }
                }
            }
        }

        let query_log = match &config.searchd.query_log {
            Some(path) => Some(open_log(path)?),
            None => None,
        };

        Ok(Arc::new(ServerCtx {
            config,
            indexes: RwLock::new(indexes),
            stats: Arc::new(Stats::new()),
            active_clients: AtomicUsize::new(0),
            query_log: Mutex::new(query_log),
            log_file: Mutex::new(None),
        }))
    }

    pub fn local(&self, name: &str) -> Option<Arc<SearchIndex>> {
        match self.indexes.read().get(name) {
            Some(IndexSlot::Local(slot)) => Some(Arc::clone(&slot.read())),
            _ => None,
        }
    }

    pub fn local_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .indexes
            .read()
            .iter()
            .filter(|(_, slot)| matches!(slot, IndexSlot::Local(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Resolves a query's index list into local shards plus agents.
    /// `*` covers every local index, a distributed name expands into
    /// its members.
    pub fn resolve_indexes(
        &self,
        list: &str,
    ) -> Result<(Vec<(String, Arc<SearchIndex>)>, Vec<AgentSpec>, Option<Arc<DistributedIndex>>)>
    {
        let mut locals = Vec::new();
        let mut agents = Vec::new();
        let mut dist_params = None;

        let names: Vec<String> = if list.trim() == "*" {
            self.local_names()
        } else {
            list.split([',', ' '])
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect()
        };
        if names.is_empty() {
            return Err(Error::query("no indexes specified".to_string()));
        }

        let map = self.indexes.read();
        for name in names {
            match map.get(&name) {
                Some(IndexSlot::Local(slot)) => {
                    locals.push((name, Arc::clone(&slot.read())));
                }
                Some(IndexSlot::Distributed(dist)) => {
                    for local_name in &dist.locals {
                        match map.get(local_name) {
                            Some(IndexSlot::Local(slot)) => {
                                locals.push((local_name.clone(), Arc::clone(&slot.read())));
                            }
                            _ => {
                                return Err(Error::query(format!(
                                    "distributed index '{}': unknown local index '{}'",
                                    name, local_name)));
                            }
                        }
                    }
                    agents.extend(dist.agents.iter().cloned());
                    dist_params = Some(Arc::clone(dist));
                }
                None => {
                    return Err(Error::query(format!("unknown index '{}'", name)));
                }
            }
        }
        Ok((locals, agents, dist_params))
    }

    /// One line per query, Sphinx-style.
    pub fn log_query(&self, query: &SearchQuery, result: &SearchResult) {
        let mut guard = self.query_log.lock();
        if let Some(file) = guard.as_mut() {
            let line = format!(
                "[{}] {}.{:03} sec [{:?}/{}] [{}] {}\n",
                chrono::Utc::now().format("%a %b %e %T%.3f %Y"),
                result.time_ms / 1000,
                result.time_ms % 1000,
                query.mode,
                result.total_found,
                query.indexes,
                query.query,
            );
            let _ = file.write_all(line.as_bytes());
        }
    }

    /// SIGUSR1 hook: reopen both logs for logrotate.
    pub fn reopen_logs(&self) {
        if let Some(path) = &self.config.searchd.query_log {
            match open_log(path) {
                Ok(file) => *self.query_log.lock() = Some(file),
                Err(e) => warn!("failed to reopen query log: {}", e),
            }
        }
        match open_log(&self.config.searchd.log) {
            Ok(file) => *self.log_file.lock() = Some(file),
            Err(e) => warn!("failed to reopen log: {}", e),
        }
    }
}

fn open_log(path: &str) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::config(format!("failed to open log {}: {}", path, e)))
}

/// Binds every listener, installs the signal handlers, and serves
/// until SIGTERM.
pub async fn run(ctx: Arc<ServerCtx>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut listeners = Vec::new();
    for spec in &ctx.config.searchd.listen {
        let listen = parse_listen(spec)?;
        let listener = TcpListener::bind(&listen.addr)
            .await
            .map_err(|e| Error::config(format!("bind() on {} failed: {}", listen.addr, e)))?;
        info!("listening on {} ({:?})", listen.addr, listen.protocol);
        listeners.push((listener, listen.protocol));
    }

    for (listener, protocol) in listeners {
        let ctx = Arc::clone(&ctx);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { continue };
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            client::serve_connection(ctx, stream, peer, protocol).await;
                        });
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    if ctx.config.searchd.attr_flush_period_secs > 0 {
        tokio::spawn(flush::run_flusher(
            Arc::clone(&ctx),
            shutdown_rx.clone(),
        ));
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hup = signal(SignalKind::hangup())
            .map_err(|e| Error::internal(format!("signal setup failed: {}", e)))?;
        let mut term = signal(SignalKind::terminate())
            .map_err(|e| Error::internal(format!("signal setup failed: {}", e)))?;
        let mut usr1 = signal(SignalKind::user_defined1())
            .map_err(|e| Error::internal(format!("signal setup failed: {}", e)))?;
        let mut int = signal(SignalKind::interrupt())
            .map_err(|e| Error::internal(format!("signal setup failed: {}", e)))?;

        loop {
            tokio::select! {
                _ = hup.recv() => {
                    info!("rotating indices: caught SIGHUP");
                    tokio::spawn(rotation::rotate_all(Arc::clone(&ctx)));
                }
                _ = usr1.recv() => {
                    info!("caught SIGUSR1, reopening logs");
                    ctx.reopen_logs();
                }
                _ = term.recv() => {
                    info!("caught SIGTERM, shutting down");
                    break;
                }
                _ = int.recv() => {
                    info!("caught SIGINT, shutting down");
                    break;
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("caught interrupt, shutting down");
    }

    let _ = shutdown_tx.send(true);
    // persist any dirty attributes on the way out
    for name in ctx.local_names() {
        if let Some(index) = ctx.local(&name) {
            if let Err(e) = index.save_attributes() {
                error!("index '{}': final attribute flush failed: {}", name, e);
            }
        }
    }
    Ok(())
}
