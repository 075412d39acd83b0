use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub const COMMAND_COUNT: usize = 7;

/// Process-wide daemon statistics.
///
/// One instance lives for the daemon lifetime; every connection task
/// bumps the counters through shared atomics. Rendered by the Status
/// command and `SHOW STATUS`.
pub struct Stats {
    pub started: Instant,
    pub connections: AtomicU64,
    pub maxed_out: AtomicU64,
    pub command_counts: [AtomicU64; COMMAND_COUNT],
    pub queries: AtomicU64,
    pub query_time_us: AtomicU64,
    pub agent_connect: AtomicU64,
    pub agent_retry: AtomicU64,
    pub rotations: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Stats {
            started: Instant::now(),
            connections: AtomicU64::new(0),
            maxed_out: AtomicU64::new(0),
            command_counts: Default::default(),
            queries: AtomicU64::new(0),
            query_time_us: AtomicU64::new(0),
            agent_connect: AtomicU64::new(0),
            agent_retry: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
        }
    }

    pub fn count_command(&self, command: u16) {
        if let Some(counter) = self.command_counts.get(command as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count_query(&self, elapsed_us: u64) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.query_time_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Renders the counters as (name, value) rows for Status replies.
    pub fn render(&self) -> Vec<(String, String)> {
        let command_names = ["search", "excerpt", "update", "keywords", "persist", "status", "query"];
        let mut rows = vec![
            ("uptime".to_string(), self.uptime_secs().to_string()),
            ("connections".to_string(), self.connections.load(Ordering::Relaxed).to_string()),
            ("maxed_out".to_string(), self.maxed_out.load(Ordering::Relaxed).to_string()),
        ];
        for (i, name) in command_names.iter().enumerate() {
            rows.push((
                format!("command_{}", name),
                self.command_counts[i].load(Ordering::Relaxed).to_string(),
            ));
        }
        let queries = self.queries.load(Ordering::Relaxed);
        let total_us = self.query_time_us.load(Ordering::Relaxed);
        rows.push(("queries".to_string(), queries.to_string()));
        rows.push(("query_time".to_string(), format!("{}.{:03}", total_us / 1_000_000, (total_us / 1000) % 1000)));
        if queries > 0 {
            let avg = total_us / queries;
            rows.push(("avg_query_time".to_string(), format!("{}.{:03}", avg / 1_000_000, (avg / 1000) % 1000)));
        }
        rows.push(("agent_connect".to_string(), self.agent_connect.load(Ordering::Relaxed).to_string()));
        rows.push(("agent_retry".to_string(), self.agent_retry.load(Ordering::Relaxed).to_string()));
        rows.push(("rotations".to_string(), self.rotations.load(Ordering::Relaxed).to_string()));
        rows
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
