use crate::core::error::{Error, Result};
use crate::core::types::{DocId, Hitpos, WordId};
use crate::index::segment::{
    DocinfoMode, IndexHeader, SegmentPaths, CHECKPOINT_EVERY,
};
use crate::io::bin::BinWriter;
use crate::io::varint::Varint;

/// Packed attribute row of one document, staged for the final write.
#[derive(Debug, Clone)]
pub struct DocInfo {
    pub doc_id: DocId,
    pub row: Vec<u32>,
    /// Token positions in the document; summed into the header's
    /// collection totals.
    pub doc_len: u32,
}

/// Streams merged postings into the dictionary, doclist and hitlist
/// files, then finishes the segment with attributes, MVA pool,
/// killlist and header.
pub struct SegmentEmitter {
    paths: SegmentPaths,
    docinfo: DocinfoMode,
    spd: BinWriter,
    spp: BinWriter,

    // dictionary blocks are small; staged in memory so the checkpoint
    // table can precede them in the file
    spi_blob: Vec<u8>,
    checkpoints: Vec<(WordId, u64)>,
    words_in_block: u32,
    last_block_word: WordId,
    last_block_doclist: u64,

    // current word state
    cur_word: Option<WordId>,
    cur_word_docs: u32,
    cur_word_hits: u64,
    cur_word_doclist: u64,
    last_doc: DocId,
    last_hit_offset: u64,

    // for inline docinfo we need the row at doclist-write time
    rows: Vec<DocInfo>,

    pub dict_size: u64,
}

impl SegmentEmitter {
    /// `rows` must be sorted ascending by docid.
    pub fn create(paths: SegmentPaths, docinfo: DocinfoMode, rows: Vec<DocInfo>) -> Result<Self> {
        debug_assert!(rows.windows(2).all(|w| w[0].doc_id < w[1].doc_id));
        Ok(SegmentEmitter {
            spd: BinWriter::create(paths.doclists())?,
            spp: BinWriter::create(paths.hitlists())?,
            paths,
            docinfo,
            spi_blob: Vec::new(),
            checkpoints: Vec::new(),
            words_in_block: 0,
            last_block_word: 0,
            last_block_doclist: 0,
            cur_word: None,
            cur_word_docs: 0,
            cur_word_hits: 0,
            cur_word_doclist: 0,
            last_doc: 0,
            last_hit_offset: 0,
            rows,
            dict_size: 0,
        })
    }

    /// Feeds one `(word, doc)` posting; calls must arrive in strictly
    /// increasing `(word, doc)` order.
    pub fn push(&mut self, word_id: WordId, doc_id: DocId, hits: &[Hitpos]) -> Result<()> {
        if self.cur_word != Some(word_id) {
            self.finish_word()?;
            self.cur_word = Some(word_id);
            self.cur_word_doclist = self.spd.tell();
            self.last_doc = 0;
            // first doc of a word carries absolute offsets so a reader
            // can start decoding at the doclist boundary
            self.last_hit_offset = 0;
        }
        self.cur_word_docs += 1;
        self.cur_word_hits += hits.len() as u64;

        let hit_offset = self.spp.tell();
        let mut last_hit = 0u32;
        for &hit in hits {
            self.spp.write_varint_u32(hit - last_hit)?;
            last_hit = hit;
        }
        self.spp.write_varint_u32(0)?; // hitlist terminator

        let mut field_mask = 0u32;
        for &hit in hits {
            field_mask |= 1 << crate::core::types::hit_field(hit);
        }

        self.spd.write_varint_u64(doc_id - self.last_doc)?;
        self.last_doc = doc_id;
        self.spd.write_varint_u32(hits.len() as u32)?;
        self.spd.write_varint_u64(hit_offset - self.last_hit_offset)?;
        self.last_hit_offset = hit_offset;
        self.spd.write_varint_u32(field_mask)?;

        if self.docinfo == DocinfoMode::Inline {
            let row = self
                .rows
                .binary_search_by_key(&doc_id, |r| r.doc_id)
                .map(|i| &self.rows[i])
                .map_err(|_| Error::internal(format!("no attribute row for doc {}", doc_id)))?;
            for &word in &row.row {
                self.spd.write_u32(word)?;
            }
        }
        Ok(())
    }

    fn finish_word(&mut self) -> Result<()> {
        let Some(word_id) = self.cur_word else {
            return Ok(());
        };
        self.spd.write_varint_u64(0)?; // doclist terminator

        if self.words_in_block == 0 {
            self.checkpoints.push((word_id, self.spi_blob.len() as u64));
            self.last_block_word = 0;
            self.last_block_doclist = 0;
        }
        Varint::encode_u64(&mut self.spi_blob, word_id - self.last_block_word);
        self.last_block_word = word_id;
        Varint::encode_u64(&mut self.spi_blob, self.cur_word_docs as u64);
        Varint::encode_u64(&mut self.spi_blob, self.cur_word_hits);
        Varint::encode_u64(
            &mut self.spi_blob,
            self.cur_word_doclist - self.last_block_doclist,
        );
        self.last_block_doclist = self.cur_word_doclist;

        self.words_in_block = (self.words_in_block + 1) % CHECKPOINT_EVERY;
        self.dict_size += 1;
        self.cur_word = None;
        self.cur_word_docs = 0;
        self.cur_word_hits = 0;
        Ok(())
    }

    /// Writes the remaining files and the header; consumes the emitter.
    pub fn finish(
        mut self,
        mut header: IndexHeader,
        mva_pool: &[u32],
        kill_list: &[DocId],
    ) -> Result<()> {
        self.finish_word()?;
        self.spd.finish()?;
        self.spp.finish()?;

        // dictionary: checkpoint table first, then the word blocks
        let mut spi = BinWriter::create(self.paths.dict())?;
        spi.write_u32(self.checkpoints.len() as u32)?;
        for &(word_id, offset) in &self.checkpoints {
            spi.write_u64(word_id)?;
            spi.write_u64(offset)?;
        }
        spi.write_bytes(&self.spi_blob)?;
        spi.finish()?;

        // attributes: docid-sorted rows (extern mode only; inline rows
        // live in the doclists, none mode leaves the file empty)
        let mut spa = BinWriter::create(self.paths.attrs())?;
        if self.docinfo == DocinfoMode::Extern {
            for info in &self.rows {
                spa.write_u64(info.doc_id)?;
                for &word in &info.row {
                    spa.write_u32(word)?;
                }
            }
        }
        spa.finish()?;

        let mut spm = BinWriter::create(self.paths.mva())?;
        for &value in mva_pool {
            spm.write_u32(value)?;
        }
        spm.finish()?;

        let mut spk = BinWriter::create(self.paths.killlist())?;
        for &doc_id in kill_list {
            spk.write_u64(doc_id)?;
        }
        spk.finish()?;

        header.dict_size = self.dict_size;
        let bytes = header.encode()?;
        let mut sph = BinWriter::create(self.paths.header())?;
        sph.write_bytes(&bytes)?;
        sph.finish()?;
        Ok(())
    }

    /// Removes any partially written files after a failed build.
    pub fn unlink_partial(paths: &SegmentPaths) {
        for ext in crate::index::segment::DATA_EXTS {
            let _ = std::fs::remove_file(paths.file(ext));
        }
    }
}
