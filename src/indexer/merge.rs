use crate::core::error::Result;
use crate::core::types::{DocId, WordId};
use crate::indexer::hits::{RunDoc, RunReader};

/// Loser-tree k-way merge over sorted run files.
///
/// `tree[node]` holds the loser of the match played at that node;
/// `tree[0]` holds the overall winner. Exhausted readers compare as
/// infinity and drain out of the tournament.
pub struct MergeStream {
    readers: Vec<RunReader>,
    /// Player heads; indices past `readers.len()` are permanent byes.
    heads: Vec<Option<RunDoc>>,
    tree: Vec<usize>,
    pending: Option<RunDoc>,
}

impl MergeStream {
    pub fn new(mut readers: Vec<RunReader>) -> Result<Self> {
        let k = readers.len().max(1).next_power_of_two();
        let mut heads = Vec::with_capacity(k);
        for reader in readers.iter_mut() {
            heads.push(reader.next_doc()?);
        }
        heads.resize_with(k, || None);

        // bottom-up build: tree[node] stores the loser of that match,
        // tree[0] the overall winner
        let mut winner_at = vec![0usize; 2 * k];
        for i in 0..k {
            winner_at[k + i] = i;
        }
        let mut tree = vec![0usize; k];
        for node in (1..k).rev() {
            let a = winner_at[2 * node];
            let b = winner_at[2 * node + 1];
            let (w, l) = if key(&heads, a) <= key(&heads, b) { (a, b) } else { (b, a) };
            winner_at[node] = w;
            tree[node] = l;
        }
        tree[0] = winner_at[1.min(k - 1)];

        Ok(MergeStream { readers, heads, tree, pending: None })
    }

    fn replay(&mut self, player: usize) {
        let k = self.tree.len();
        let mut winner = player;
        let mut node = (k + player) / 2;
        while node > 0 {
            if key(&self.heads, self.tree[node]) < key(&self.heads, winner) {
                std::mem::swap(&mut self.tree[node], &mut winner);
            }
            node /= 2;
        }
        self.tree[0] = winner;
    }

    fn pop(&mut self) -> Result<Option<RunDoc>> {
        let winner = self.tree[0];
        let Some(doc) = self.heads[winner].take() else {
            return Ok(None);
        };
        if winner < self.readers.len() {
            self.heads[winner] = self.readers[winner].next_doc()?;
        }
        self.replay(winner);
        Ok(Some(doc))
    }

    /// Next `(word, doc)` posting; a document whose hits were split
    /// across runs comes back as one coalesced entry.
    pub fn next(&mut self) -> Result<Option<RunDoc>> {
        let mut current = match self.pending.take() {
            Some(doc) => doc,
            None => match self.pop()? {
                Some(doc) => doc,
                None => return Ok(None),
            },
        };
        while let Some(next) = self.pop()? {
            if next.word_id == current.word_id && next.doc_id == current.doc_id {
                current.hits = merge_hits(&current.hits, &next.hits);
            } else {
                self.pending = Some(next);
                break;
            }
        }
        Ok(Some(current))
    }
}

fn key(heads: &[Option<RunDoc>], player: usize) -> (WordId, DocId, usize) {
    match &heads[player] {
        Some(doc) => (doc.word_id, doc.doc_id, player),
        None => (WordId::MAX, DocId::MAX, player),
    }
}

fn merge_hits(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] <= b[j] {
            out.push(a[i]);
            i += 1;
        } else {
            out.push(b[j]);
            j += 1;
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::hits::{Hit, HitArena, HIT_BYTES};
    use tempfile::tempdir;

    fn spill(dir: &std::path::Path, name: &str, hits: &[(u64, u64, u32)]) -> RunReader {
        let mut arena = HitArena::with_mem_limit(1024 * HIT_BYTES);
        for &(w, d, p) in hits {
            arena.push(Hit { word_id: w, doc_id: d, hitpos: p });
        }
        let path = dir.join(name);
        arena.spill(&path).unwrap();
        RunReader::open(&path).unwrap()
    }

    #[test]
    fn three_runs_merge_in_global_order() {
        let dir = tempdir().unwrap();
        let r1 = spill(dir.path(), "r1", &[(10, 1, 1), (30, 2, 1)]);
        let r2 = spill(dir.path(), "r2", &[(10, 3, 2), (20, 1, 1)]);
        let r3 = spill(dir.path(), "r3", &[(30, 1, 4)]);

        let mut merge = MergeStream::new(vec![r1, r2, r3]).unwrap();
        let mut seen = Vec::new();
        while let Some(doc) = merge.next().unwrap() {
            seen.push((doc.word_id, doc.doc_id));
        }
        assert_eq!(seen, [(10, 1), (10, 3), (20, 1), (30, 1), (30, 2)]);
    }

    #[test]
    fn split_documents_are_coalesced() {
        let dir = tempdir().unwrap();
        let r1 = spill(dir.path(), "r1", &[(10, 1, 1), (10, 1, 3)]);
        let r2 = spill(dir.path(), "r2", &[(10, 1, 7)]);

        let mut merge = MergeStream::new(vec![r1, r2]).unwrap();
        let doc = merge.next().unwrap().unwrap();
        assert_eq!(doc.hits, vec![1, 3, 7]);
        assert!(merge.next().unwrap().is_none());
    }

    #[test]
    fn single_run_passes_through() {
        let dir = tempdir().unwrap();
        let r1 = spill(dir.path(), "r1", &[(5, 1, 1), (5, 2, 1)]);
        let mut merge = MergeStream::new(vec![r1]).unwrap();
        assert_eq!(merge.next().unwrap().unwrap().doc_id, 1);
        assert_eq!(merge.next().unwrap().unwrap().doc_id, 2);
        assert!(merge.next().unwrap().is_none());
    }
}
