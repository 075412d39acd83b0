/// Per-query failure accumulator. Identical messages from different
/// indexes collapse into one line listing every index they came from.
#[derive(Debug, Default)]
pub struct FailuresLog {
    entries: Vec<(String, String)>,
}

impl FailuresLog {
    pub fn new() -> Self {
        FailuresLog { entries: Vec::new() }
    }

    pub fn add(&mut self, index: impl Into<String>, message: impl Into<String>) {
        self.entries.push((index.into(), message.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builds the failure report, collapsing identical texts.
    pub fn render(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        for (index, message) in &self.entries {
            match groups.iter_mut().find(|(m, _)| m == message) {
                Some((_, indexes)) => {
                    if !indexes.contains(index) {
                        indexes.push(index.clone());
                    }
                }
                None => groups.push((message.clone(), vec![index.clone()])),
            }
        }
        let parts: Vec<String> = groups
            .into_iter()
            .map(|(message, indexes)| format!("index {}: {}", indexes.join(","), message))
            .collect();
        Some(parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_messages_collapse_across_indexes() {
        let mut log = FailuresLog::new();
        log.add("shard1", "connection refused");
        log.add("shard2", "connection refused");
        log.add("shard3", "query time exceeded");
        assert_eq!(
            log.render().unwrap(),
            "index shard1,shard2: connection refused; index shard3: query time exceeded"
        );
    }

    #[test]
    fn empty_log_renders_nothing() {
        assert!(FailuresLog::new().render().is_none());
    }
}
