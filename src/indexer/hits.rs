use std::path::{Path, PathBuf};
use rayon::prelude::*;

use crate::core::error::Result;
use crate::core::types::{DocId, Hitpos, WordId};
use crate::io::bin::{BinReader, BinWriter};

/// One indexing hit; the unit of the external sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub word_id: WordId,
    pub doc_id: DocId,
    pub hitpos: Hitpos,
}

/// Accounting size of one arena slot, padding included.
pub const HIT_BYTES: usize = std::mem::size_of::<Hit>();

/// Fixed-budget accumulation arena. When full, the owner sorts it and
/// spills a delta-encoded run file.
pub struct HitArena {
    hits: Vec<Hit>,
    capacity: usize,
}

impl HitArena {
    pub fn with_mem_limit(mem_limit: usize) -> Self {
        let capacity = (mem_limit / HIT_BYTES).max(1024);
        HitArena { hits: Vec::with_capacity(capacity), capacity }
    }

    pub fn push(&mut self, hit: Hit) {
        self.hits.push(hit);
    }

    pub fn is_full(&self) -> bool {
        self.hits.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Sorts by `(wordid, docid, hitpos)` and writes one run file.
    pub fn spill(&mut self, path: &Path) -> Result<()> {
        self.hits
            .par_sort_unstable_by_key(|h| (h.word_id, h.doc_id, h.hitpos));

        let mut writer = RunWriter::create(path)?;
        for hit in &self.hits {
            writer.push(*hit)?;
        }
        writer.finish()?;
        self.hits.clear();
        Ok(())
    }
}

/// Run file encoding, grouped by word then document:
/// `word_delta ndocs { docid_delta nhits hit_delta.. }*`.
struct RunWriter {
    out: BinWriter,
    last_word: WordId,
    // per-group state buffered until the group is complete
    group_word: WordId,
    docs: Vec<(DocId, Vec<Hitpos>)>,
}

impl RunWriter {
    fn create(path: &Path) -> Result<Self> {
        Ok(RunWriter {
            out: BinWriter::create(path)?,
            last_word: 0,
            group_word: 0,
            docs: Vec::new(),
        })
    }

    fn push(&mut self, hit: Hit) -> Result<()> {
        if hit.word_id != self.group_word {
            self.flush_group()?;
            self.group_word = hit.word_id;
        }
        match self.docs.last_mut() {
            Some((doc_id, hits)) if *doc_id == hit.doc_id => hits.push(hit.hitpos),
            _ => self.docs.push((hit.doc_id, vec![hit.hitpos])),
        }
        Ok(())
    }

    fn flush_group(&mut self) -> Result<()> {
        if self.docs.is_empty() {
            return Ok(());
        }
        self.out.write_varint_u64(self.group_word - self.last_word)?;
        self.last_word = self.group_word;
        self.out.write_varint_u32(self.docs.len() as u32)?;
        let mut last_doc = 0;
        for (doc_id, hits) in std::mem::take(&mut self.docs) {
            self.out.write_varint_u64(doc_id - last_doc)?;
            last_doc = doc_id;
            self.out.write_varint_u32(hits.len() as u32)?;
            let mut last_hit = 0;
            for hit in hits {
                self.out.write_varint_u32(hit - last_hit)?;
                last_hit = hit;
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.flush_group()?;
        self.out.finish()?;
        Ok(())
    }
}

/// One document's postings for one word, as read back from a run.
#[derive(Debug, Clone)]
pub struct RunDoc {
    pub word_id: WordId,
    pub doc_id: DocId,
    pub hits: Vec<Hitpos>,
}

/// Streaming reader over a run file, yielding `RunDoc`s in
/// `(wordid, docid)` order.
pub struct RunReader {
    input: BinReader,
    path: PathBuf,
    bytes: u64,
    word_id: WordId,
    docs_left: u32,
    last_doc: DocId,
}

impl RunReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bytes = std::fs::metadata(&path)?.len();
        Ok(RunReader {
            input: BinReader::open(&path)?,
            path,
            bytes,
            word_id: 0,
            docs_left: 0,
            last_doc: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_doc(&mut self) -> Result<Option<RunDoc>> {
        if self.docs_left == 0 {
            if self.input.consumed >= self.bytes {
                return Ok(None);
            }
            self.word_id += self.input.read_varint_u64()?;
            self.docs_left = self.input.read_varint_u32()?;
            self.last_doc = 0;
        }
        self.docs_left -= 1;
        self.last_doc += self.input.read_varint_u64()?;
        let nhits = self.input.read_varint_u32()? as usize;
        let mut hits = Vec::with_capacity(nhits);
        let mut last_hit = 0;
        for _ in 0..nhits {
            last_hit += self.input.read_varint_u32()?;
            hits.push(last_hit);
        }
        Ok(Some(RunDoc { word_id: self.word_id, doc_id: self.last_doc, hits }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn spill_and_read_back_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run0.tmp");

        let mut arena = HitArena::with_mem_limit(1024 * HIT_BYTES);
        // deliberately unsorted
        arena.push(Hit { word_id: 20, doc_id: 2, hitpos: 1 });
        arena.push(Hit { word_id: 10, doc_id: 5, hitpos: 3 });
        arena.push(Hit { word_id: 10, doc_id: 5, hitpos: 1 });
        arena.push(Hit { word_id: 10, doc_id: 1, hitpos: 2 });
        arena.spill(&path).unwrap();
        assert!(arena.is_empty());

        let mut reader = RunReader::open(&path).unwrap();
        let d = reader.next_doc().unwrap().unwrap();
        assert_eq!((d.word_id, d.doc_id, d.hits.clone()), (10, 1, vec![2]));
        let d = reader.next_doc().unwrap().unwrap();
        assert_eq!((d.word_id, d.doc_id, d.hits.clone()), (10, 5, vec![1, 3]));
        let d = reader.next_doc().unwrap().unwrap();
        assert_eq!((d.word_id, d.doc_id, d.hits.clone()), (20, 2, vec![1]));
        assert!(reader.next_doc().unwrap().is_none());
    }
}
