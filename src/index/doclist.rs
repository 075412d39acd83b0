use crate::core::error::Result;
use crate::core::types::{DocId, Hitpos};
use crate::index::segment::DocinfoMode;
use crate::io::bin::SliceReader;

/// Dictionary entry for one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoclistInfo {
    pub doc_count: u32,
    pub hit_count: u64,
    /// Byte offset of the doclist inside the `.spd` file.
    pub offset: u64,
}

/// One doclist record.
#[derive(Debug, Clone)]
pub struct DocEntry {
    pub doc_id: DocId,
    pub hit_count: u32,
    /// Byte offset of this document's hits inside `.spp`.
    pub hit_offset: u64,
    pub field_mask: u32,
    /// Attribute row carried inline (inline docinfo mode).
    pub inline_row: Vec<u32>,
}

/// Streaming cursor over one word's doclist. Malformed data ends the
/// stream early rather than panicking; corruption is caught by the
/// header checksum and file-size validation at open time.
pub struct DocListIter<'a> {
    reader: SliceReader<'a>,
    last_doc: DocId,
    last_hit_offset: u64,
    inline_words: usize,
    done: bool,
}

impl<'a> DocListIter<'a> {
    pub fn new(spd: &'a [u8], info: DoclistInfo, docinfo: DocinfoMode, row_size: usize) -> Self {
        DocListIter {
            reader: SliceReader::at(spd, info.offset as usize),
            last_doc: 0,
            last_hit_offset: 0,
            inline_words: if docinfo == DocinfoMode::Inline { row_size } else { 0 },
            done: info.offset as usize >= spd.len(),
        }
    }

    /// An iterator that yields nothing; stands in for absent words.
    pub fn empty(spd: &'a [u8]) -> Self {
        DocListIter {
            reader: SliceReader::new(spd),
            last_doc: 0,
            last_hit_offset: 0,
            inline_words: 0,
            done: true,
        }
    }

    pub fn next(&mut self) -> Option<DocEntry> {
        if self.done {
            return None;
        }
        match self.try_next() {
            Ok(entry) => entry,
            Err(_) => {
                self.done = true;
                None
            }
        }
    }

    fn try_next(&mut self) -> Result<Option<DocEntry>> {
        let delta = self.reader.read_varint_u64()?;
        if delta == 0 {
            self.done = true;
            return Ok(None);
        }
        self.last_doc += delta;
        let hit_count = self.reader.read_varint_u32()?;
        self.last_hit_offset += self.reader.read_varint_u64()?;
        let field_mask = self.reader.read_varint_u32()?;
        let mut inline_row = Vec::with_capacity(self.inline_words);
        for _ in 0..self.inline_words {
            inline_row.push(self.reader.read_u32()?);
        }
        Ok(Some(DocEntry {
            doc_id: self.last_doc,
            hit_count,
            hit_offset: self.last_hit_offset,
            field_mask,
            inline_row,
        }))
    }
}

/// Streaming cursor over one document's hitlist.
pub struct HitIter<'a> {
    reader: SliceReader<'a>,
    last: Hitpos,
    done: bool,
}

impl<'a> HitIter<'a> {
    pub fn new(spp: &'a [u8], hit_offset: u64) -> Self {
        HitIter {
            reader: SliceReader::at(spp, (hit_offset as usize).min(spp.len())),
            last: 0,
            done: hit_offset as usize >= spp.len(),
        }
    }

    pub fn next(&mut self) -> Option<Hitpos> {
        if self.done {
            return None;
        }
        match self.reader.read_varint_u32() {
            Ok(0) | Err(_) => {
                self.done = true;
                None
            }
            Ok(delta) => {
                self.last += delta;
                Some(self.last)
            }
        }
    }

    pub fn collect_all(mut self) -> Vec<Hitpos> {
        let mut out = Vec::new();
        while let Some(hit) = self.next() {
            out.push(hit);
        }
        out
    }
}
