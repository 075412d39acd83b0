use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::RwLock;

use crate::core::error::{Error, Result};
use crate::core::types::{DocId, WordId};
use crate::index::doclist::{DocListIter, DoclistInfo};
use crate::index::lock::FileLock;
use crate::index::segment::{DocinfoMode, IndexHeader, SegmentPaths};
use crate::io::bin::SliceReader;
use crate::schema::attr::AttrLocator;
use crate::schema::schema::Schema;

/// Read-only map that tolerates empty files (mmap rejects length 0).
enum MapView {
    Mapped(Mmap),
    Empty,
}

impl MapView {
    fn bytes(&self) -> &[u8] {
        match self {
            MapView::Mapped(map) => &map[..],
            MapView::Empty => &[],
        }
    }
}

fn map_file(path: &Path) -> Result<MapView> {
    let file = fs::File::open(path)
        .map_err(|e| Error::io(format!("failed to open {}: {}", path.display(), e)))?;
    let len = file.metadata()?.len() as usize;
    if len == 0 {
        return Ok(MapView::Empty);
    }
    let map = unsafe { MmapOptions::new().len(len).map(&file)? };
    Ok(MapView::Mapped(map))
}

/// One opened segment: all seven files mapped, dictionary and killlist
/// preread into memory. Immutable except the attribute file, whose
/// numeric cells may be rewritten in place.
pub struct SearchIndex {
    pub paths: SegmentPaths,
    pub header: IndexHeader,
    spa: Option<RwLock<MmapMut>>,
    spd: MapView,
    spp: MapView,
    spm: MapView,
    spi_blob: Vec<u8>,
    checkpoints: Vec<(WordId, u64)>,
    killlist: Vec<DocId>,
    /// Bumped on every in-place attribute update.
    pub update_tag: AtomicU64,
    /// Last update tag persisted by `save_attributes`.
    pub flush_tag: AtomicU64,
    _lock: Option<FileLock>,
}

impl SearchIndex {
    /// Opens and validates a segment; `with_lock` takes the exclusive
    /// `.spl` lock for the index lifetime (the daemon path).
    pub fn open(paths: SegmentPaths, with_lock: bool) -> Result<Self> {
        let lock = if with_lock {
            Some(FileLock::acquire(&paths.lock())?)
        } else {
            None
        };

        let header_bytes = fs::read(paths.header()).map_err(|e| {
            Error::io(format!("failed to read {}: {}", paths.header().display(), e))
        })?;
        let header = IndexHeader::decode(&header_bytes)?;

        // dictionary is preread: checkpoint table, then word blocks
        let spi_bytes = fs::read(paths.dict())?;
        let mut r = SliceReader::new(&spi_bytes);
        let ncheckpoints = r.read_u32()? as usize;
        let mut checkpoints = Vec::with_capacity(ncheckpoints);
        for _ in 0..ncheckpoints {
            let word_id = r.read_u64()?;
            let offset = r.read_u64()?;
            checkpoints.push((word_id, offset));
        }
        let spi_blob = spi_bytes[r.pos..].to_vec();

        let spd = map_file(&paths.doclists())?;
        let spp = map_file(&paths.hitlists())?;
        let spm = map_file(&paths.mva())?;
        if spm.bytes().len() % 4 != 0 {
            return Err(Error::io(format!("{}: odd mva pool size", paths.mva().display())));
        }

        let spk_bytes = fs::read(paths.killlist())?;
        if spk_bytes.len() % 8 != 0 {
            return Err(Error::io(format!("{}: odd killlist size", paths.killlist().display())));
        }
        let mut killlist = Vec::with_capacity(spk_bytes.len() / 8);
        let mut r = SliceReader::new(&spk_bytes);
        while !r.is_empty() {
            killlist.push(r.read_u64()?);
        }

        let spa = if header.docinfo == DocinfoMode::Extern && header.total_documents > 0 {
            let file = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(paths.attrs())
                .map_err(|e| Error::io(format!("failed to open {}: {}", paths.attrs().display(), e)))?;
            let len = file.metadata()?.len() as usize;
            let stride_bytes = (2 + header.schema.row_size) * 4;
            if len != header.total_documents as usize * stride_bytes {
                return Err(Error::io(format!(
                    "{}: size {} does not match {} documents",
                    paths.attrs().display(), len, header.total_documents)));
            }
            let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
            Some(RwLock::new(map))
        } else {
            None
        };

        Ok(SearchIndex {
            paths,
            header,
            spa,
            spd,
            spp,
            spm,
            spi_blob,
            checkpoints,
            killlist,
            update_tag: AtomicU64::new(0),
            flush_tag: AtomicU64::new(0),
            _lock: lock,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.header.schema
    }

    /// Row stride in u32 words: docid (2) plus the attribute row.
    fn stride(&self) -> usize {
        2 + self.header.schema.row_size
    }

    pub fn killlist(&self) -> &[DocId] {
        &self.killlist
    }

    pub fn doclists_bytes(&self) -> &[u8] {
        self.spd.bytes()
    }

    pub fn hitlists_bytes(&self) -> &[u8] {
        self.spp.bytes()
    }

    /// The MVA side pool as u32 values; entry 0 is the reserved empty run.
    pub fn mva_pool(&self) -> &[u32] {
        let bytes = self.spm.bytes();
        // page-aligned map, length validated at open
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const u32, bytes.len() / 4) }
    }

    /// Looks a word up through the checkpoint table, then scans its block.
    pub fn doclist_info(&self, word_id: WordId) -> Option<DoclistInfo> {
        if self.checkpoints.is_empty() || word_id == 0 {
            return None;
        }
        let block = self
            .checkpoints
            .partition_point(|&(first_word, _)| first_word <= word_id)
            .checked_sub(1)?;
        let start = self.checkpoints[block].1 as usize;
        let end = self
            .checkpoints
            .get(block + 1)
            .map(|&(_, offset)| offset as usize)
            .unwrap_or(self.spi_blob.len());

        let mut r = SliceReader::at(&self.spi_blob, start);
        let mut cur_word = 0u64;
        let mut cur_doclist = 0u64;
        while r.pos < end {
            cur_word += r.read_varint_u64().ok()?;
            let doc_count = r.read_varint_u64().ok()? as u32;
            let hit_count = r.read_varint_u64().ok()?;
            cur_doclist += r.read_varint_u64().ok()?;
            if cur_word == word_id {
                return Some(DoclistInfo { doc_count, hit_count, offset: cur_doclist });
            }
            if cur_word > word_id {
                return None;
            }
        }
        None
    }

    pub fn doclist(&self, word_id: WordId) -> (DocListIter<'_>, DoclistInfo) {
        match self.doclist_info(word_id) {
            Some(info) => (
                DocListIter::new(
                    self.spd.bytes(),
                    info,
                    self.header.docinfo,
                    self.header.schema.row_size,
                ),
                info,
            ),
            None => (
                DocListIter::empty(self.spd.bytes()),
                DoclistInfo { doc_count: 0, hit_count: 0, offset: 0 },
            ),
        }
    }

    /// Iterates every dictionary word in id order (index merging).
    pub fn words(&self) -> WordIter<'_> {
        WordIter {
            reader: SliceReader::new(&self.spi_blob),
            checkpoints: &self.checkpoints,
            next_checkpoint: 0,
            cur_word: 0,
            cur_doclist: 0,
        }
    }

    fn row_index(&self, spa: &[u8], doc_id: DocId) -> Option<usize> {
        let stride_bytes = self.stride() * 4;
        let ndocs = spa.len() / stride_bytes;
        let read_doc = |i: usize| -> DocId {
            let at = i * stride_bytes;
            u64::from_le_bytes(spa[at..at + 8].try_into().unwrap())
        };
        let (mut lo, mut hi) = (0usize, ndocs);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if read_doc(mid) < doc_id {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < ndocs && read_doc(lo) == doc_id { Some(lo) } else { None }
    }

    /// Copies the attribute row for a docid (extern docinfo only).
    pub fn row_of(&self, doc_id: DocId) -> Option<Vec<u32>> {
        let spa = self.spa.as_ref()?.read();
        let i = self.row_index(&spa, doc_id)?;
        let stride_bytes = self.stride() * 4;
        let at = i * stride_bytes + 8;
        let row: Vec<u32> = (0..self.header.schema.row_size)
            .map(|w| u32::from_le_bytes(spa[at + w * 4..at + w * 4 + 4].try_into().unwrap()))
            .collect();
        Some(row)
    }

    /// Every docid present in the attribute file, ascending.
    pub fn doc_ids(&self) -> Vec<DocId> {
        let Some(spa) = self.spa.as_ref() else {
            return Vec::new();
        };
        let spa = spa.read();
        let stride_bytes = self.stride() * 4;
        (0..spa.len() / stride_bytes)
            .map(|i| {
                let at = i * stride_bytes;
                u64::from_le_bytes(spa[at..at + 8].try_into().unwrap())
            })
            .collect()
    }

    /// In-place numeric attribute update; returns true when the docid
    /// exists. Bumps `update_tag` so the flusher knows the file is dirty.
    pub fn update_attrs(&self, doc_id: DocId, updates: &[(AttrLocator, u64)]) -> Result<bool> {
        let Some(spa) = self.spa.as_ref() else {
            return Err(Error::query("index has no extern attribute storage".to_string()));
        };
        let mut spa = spa.write();
        let Some(i) = self.row_index(&spa, doc_id) else {
            return Ok(false);
        };
        let stride = self.stride();
        let at = i * stride * 4 + 8;
        // work on an aligned copy of the row, then write it back
        let mut row: Vec<u32> = (0..self.header.schema.row_size)
            .map(|w| u32::from_le_bytes(spa[at + w * 4..at + w * 4 + 4].try_into().unwrap()))
            .collect();
        for &(loc, value) in updates {
            crate::schema::attr::PackedRow::set(&mut row, loc, value);
        }
        for (w, &word) in row.iter().enumerate() {
            spa[at + w * 4..at + w * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        self.update_tag.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    /// Persists dirty attribute rows; returns true when a flush happened.
    pub fn save_attributes(&self) -> Result<bool> {
        let update_tag = self.update_tag.load(Ordering::SeqCst);
        if update_tag <= self.flush_tag.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if let Some(spa) = self.spa.as_ref() {
            spa.read().flush()?;
        }
        self.flush_tag.store(update_tag, Ordering::SeqCst);
        Ok(true)
    }

    /// Touches every mapped page so the first query after a rotation
    /// does not stall on major faults.
    pub fn preread(&self) -> u64 {
        let mut sum = 0u64;
        for bytes in [self.spd.bytes(), self.spp.bytes(), self.spm.bytes()] {
            for chunk in bytes.chunks(4096) {
                sum = sum.wrapping_add(chunk[0] as u64);
            }
        }
        if let Some(spa) = self.spa.as_ref() {
            let spa = spa.read();
            for chunk in spa.chunks(4096) {
                sum = sum.wrapping_add(chunk[0] as u64);
            }
        }
        sum
    }
}

/// Full dictionary walk.
pub struct WordIter<'a> {
    reader: SliceReader<'a>,
    checkpoints: &'a [(WordId, u64)],
    next_checkpoint: usize,
    cur_word: WordId,
    cur_doclist: u64,
}

impl<'a> WordIter<'a> {
    pub fn next(&mut self) -> Option<(WordId, DoclistInfo)> {
        if self.reader.is_empty() {
            return None;
        }
        // deltas reset at every checkpoint block boundary
        if let Some(&(_, offset)) = self.checkpoints.get(self.next_checkpoint) {
            if self.reader.pos == offset as usize {
                self.cur_word = 0;
                self.cur_doclist = 0;
                self.next_checkpoint += 1;
            }
        }
        self.cur_word += self.reader.read_varint_u64().ok()?;
        let doc_count = self.reader.read_varint_u64().ok()? as u32;
        let hit_count = self.reader.read_varint_u64().ok()?;
        self.cur_doclist += self.reader.read_varint_u64().ok()?;
        Some((
            self.cur_word,
            DoclistInfo { doc_count, hit_count, offset: self.cur_doclist },
        ))
    }
}
