use crate::schema::row::Match;
use crate::schema::schema::Schema;
use crate::sort::compare::CompareSpec;
use crate::sort::Sorter;

/// Bounded top-N queue. Entries accumulate up to twice the limit, then
/// the worst half is pruned in one sort pass; the amortized cost beats
/// a per-push heap for the row sizes involved.
pub struct TopNSorter {
    spec: CompareSpec,
    limit: usize,
    entries: Vec<Match>,
    schema: Schema,
}

impl TopNSorter {
    pub fn new(spec: CompareSpec, limit: usize, schema: Schema) -> Self {
        let limit = limit.max(1);
        TopNSorter {
            spec,
            limit,
            entries: Vec::with_capacity(limit * 2),
            schema,
        }
    }

    fn prune(&mut self) {
        let spec = self.spec.clone();
        // stable on purpose: equal keys keep push order, so a
        // multi-index query lists earlier shards first
        self.entries.sort_by(|a, b| spec.cmp_keys(a, b));
        self.entries.truncate(self.limit);
    }
}

impl Sorter for TopNSorter {
    fn push(&mut self, m: &Match) -> bool {
        self.entries.push(m.clone());
        if self.entries.len() >= self.limit * 2 {
            self.prune();
        }
        true
    }

    fn len(&self) -> usize {
        self.entries.len().min(self.limit)
    }

    fn flatten(&mut self, out: &mut Vec<Match>, tag: i32) {
        self.prune();
        for mut m in self.entries.drain(..) {
            if tag >= 0 {
                m.tag = tag;
            }
            out.push(m);
        }
    }

    fn is_groupby(&self) -> bool {
        false
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(doc_id: u64, weight: i32) -> Match {
        Match { doc_id, weight, row: Vec::new(), tag: -1 }
    }

    #[test]
    fn keeps_top_n_by_weight() {
        let mut q = TopNSorter::new(CompareSpec::relevance(), 3, Schema::new());
        for i in 0..10 {
            q.push(&m(i + 1, i as i32));
        }
        let mut out = Vec::new();
        q.flatten(&mut out, -1);
        let weights: Vec<i32> = out.iter().map(|m| m.weight).collect();
        assert_eq!(weights, [9, 8, 7]);
    }

    #[test]
    fn ties_preserve_push_order_across_shards() {
        let mut q = TopNSorter::new(CompareSpec::relevance(), 4, Schema::new());
        // shard 0 pushes docs 1, 3; shard 1 pushes docs 2, 4
        for (doc, tag) in [(1, 0), (3, 0), (2, 1), (4, 1)] {
            let mut e = m(doc, 10);
            e.tag = tag;
            q.push(&e);
        }
        let mut out = Vec::new();
        q.flatten(&mut out, -1);
        let docs: Vec<u64> = out.iter().map(|m| m.doc_id).collect();
        assert_eq!(docs, [1, 3, 2, 4]);
    }
}
