use std::path::PathBuf;
use serde::{Serialize, Deserialize};

use crate::analysis::dict::DictSettings;
use crate::core::error::{Error, Result};
use crate::core::types::DocId;
use crate::io::bin::SliceReader;
use crate::schema::attr::{AttrLocator, AttrType};
use crate::schema::schema::{AttrDef, FieldDef, Schema};

pub const INDEX_MAGIC: u32 = 0x5348_5058; // "SPHX"
pub const FORMAT_VERSION: u32 = 1;

/// Words per dictionary checkpoint block.
pub const CHECKPOINT_EVERY: u32 = 1024;

/// Seven data files per segment, sharing a path prefix.
pub const EXT_HEADER: &str = "sph";
pub const EXT_ATTRS: &str = "spa";
pub const EXT_DICT: &str = "spi";
pub const EXT_DOCLISTS: &str = "spd";
pub const EXT_HITLISTS: &str = "spp";
pub const EXT_MVA: &str = "spm";
pub const EXT_KILLLIST: &str = "spk";
pub const EXT_LOCK: &str = "spl";

pub const DATA_EXTS: [&str; 7] = [
    EXT_HEADER, EXT_ATTRS, EXT_DICT, EXT_DOCLISTS, EXT_HITLISTS, EXT_MVA, EXT_KILLLIST,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocinfoMode {
    None,
    Inline,
    Extern,
}

impl DocinfoMode {
    pub fn from_config(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(DocinfoMode::None),
            "inline" => Ok(DocinfoMode::Inline),
            "extern" => Ok(DocinfoMode::Extern),
            other => Err(Error::config(format!("unknown docinfo mode '{}'", other))),
        }
    }

    fn to_u32(self) -> u32 {
        match self {
            DocinfoMode::None => 0,
            DocinfoMode::Inline => 1,
            DocinfoMode::Extern => 2,
        }
    }

    fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(DocinfoMode::None),
            1 => Ok(DocinfoMode::Inline),
            2 => Ok(DocinfoMode::Extern),
            other => Err(Error::io(format!("bad docinfo mode {}", other))),
        }
    }
}

/// Tokenizer/dict settings blob kept in the header so the daemon can
/// rebuild the exact indexing-time analysis chain for queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexSettings {
    pub min_word_len: usize,
    pub dict: DictSettings,
    pub checkpoint_every: u32,
}

/// Parsed `.sph` contents.
#[derive(Debug, Clone)]
pub struct IndexHeader {
    pub docinfo: DocinfoMode,
    pub schema: Schema,
    pub min_doc_id: DocId,
    pub total_documents: u64,
    pub total_bytes: u64,
    /// Token positions across all documents.
    pub total_tokens: u64,
    /// Distinct words in the dictionary.
    pub dict_size: u64,
    pub settings: IndexSettings,
}

/// Path set of one segment. Rotation variants (`.new`, `.old`) insert
/// their marker between the prefix and the extension.
#[derive(Debug, Clone)]
pub struct SegmentPaths {
    pub prefix: PathBuf,
    pub variant: &'static str,
}

impl SegmentPaths {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        SegmentPaths { prefix: prefix.into(), variant: "" }
    }

    pub fn new_variant(prefix: impl Into<PathBuf>) -> Self {
        SegmentPaths { prefix: prefix.into(), variant: ".new" }
    }

    pub fn old_variant(prefix: impl Into<PathBuf>) -> Self {
        SegmentPaths { prefix: prefix.into(), variant: ".old" }
    }

    pub fn tmp_variant(prefix: impl Into<PathBuf>) -> Self {
        SegmentPaths { prefix: prefix.into(), variant: ".tmp" }
    }

    pub fn file(&self, ext: &str) -> PathBuf {
        let mut name = self
            .prefix
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(self.variant);
        name.push('.');
        name.push_str(ext);
        self.prefix.with_file_name(name)
    }

    pub fn header(&self) -> PathBuf { self.file(EXT_HEADER) }
    pub fn attrs(&self) -> PathBuf { self.file(EXT_ATTRS) }
    pub fn dict(&self) -> PathBuf { self.file(EXT_DICT) }
    pub fn doclists(&self) -> PathBuf { self.file(EXT_DOCLISTS) }
    pub fn hitlists(&self) -> PathBuf { self.file(EXT_HITLISTS) }
    pub fn mva(&self) -> PathBuf { self.file(EXT_MVA) }
    pub fn killlist(&self) -> PathBuf { self.file(EXT_KILLLIST) }
    pub fn lock(&self) -> PathBuf { self.file(EXT_LOCK) }

    pub fn exists(&self) -> bool {
        self.header().exists()
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn attr_type_code(kind: AttrType) -> u32 {
    match kind {
        AttrType::Int32 => 1,
        AttrType::Int64 => 2,
        AttrType::Bool => 3,
        AttrType::Timestamp => 4,
        AttrType::Float32 => 5,
        AttrType::Ordinal => 6,
        AttrType::Mva => 7,
    }
}

fn attr_type_from_code(code: u32) -> Result<AttrType> {
    Ok(match code {
        1 => AttrType::Int32,
        2 => AttrType::Int64,
        3 => AttrType::Bool,
        4 => AttrType::Timestamp,
        5 => AttrType::Float32,
        6 => AttrType::Ordinal,
        7 => AttrType::Mva,
        other => return Err(Error::io(format!("bad attribute type code {}", other))),
    })
}

impl IndexHeader {
    /// Serializes the header; the trailing u32 is a CRC32 of everything
    /// before it.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(512);
        put_u32(&mut out, INDEX_MAGIC);
        put_u32(&mut out, FORMAT_VERSION);
        put_u32(&mut out, self.docinfo.to_u32());

        put_u32(&mut out, self.schema.fields.len() as u32);
        for field in &self.schema.fields {
            put_string(&mut out, &field.name);
        }
        put_u32(&mut out, self.schema.attrs.len() as u32);
        for attr in &self.schema.attrs {
            put_string(&mut out, &attr.name);
            put_u32(&mut out, attr_type_code(attr.kind));
            put_u32(&mut out, attr.locator.bit_offset);
            put_u32(&mut out, attr.locator.bit_width);
        }
        put_u32(&mut out, self.schema.row_size as u32);

        put_u64(&mut out, self.min_doc_id);
        put_u64(&mut out, self.total_documents);
        put_u64(&mut out, self.total_bytes);
        put_u64(&mut out, self.total_tokens);
        put_u64(&mut out, self.dict_size);

        let blob = bincode::serialize(&self.settings)?;
        put_u32(&mut out, blob.len() as u32);
        out.extend_from_slice(&blob);

        let crc = crc32fast::hash(&out);
        put_u32(&mut out, crc);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<IndexHeader> {
        if data.len() < 4 {
            return Err(Error::io("index header truncated".to_string()));
        }
        let (payload, crc_bytes) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if crc32fast::hash(payload) != stored {
            return Err(Error::io("index header checksum mismatch".to_string()));
        }

        let mut r = SliceReader::new(payload);
        let magic = r.read_u32()?;
        if magic != INDEX_MAGIC {
            return Err(Error::io(format!("bad index magic 0x{:08x}", magic)));
        }
        let version = r.read_u32()?;
        if version != FORMAT_VERSION {
            return Err(Error::io(format!(
                "unsupported index format version {} (expected {})", version, FORMAT_VERSION)));
        }
        let docinfo = DocinfoMode::from_u32(r.read_u32()?)?;

        let nfields = r.read_u32()? as usize;
        let mut fields = Vec::with_capacity(nfields);
        for _ in 0..nfields {
            fields.push(FieldDef { name: r.read_string()? });
        }
        let nattrs = r.read_u32()? as usize;
        let mut attrs = Vec::with_capacity(nattrs);
        for _ in 0..nattrs {
            let name = r.read_string()?;
            let kind = attr_type_from_code(r.read_u32()?)?;
            let bit_offset = r.read_u32()?;
            let bit_width = r.read_u32()?;
            attrs.push(AttrDef { name, kind, locator: AttrLocator { bit_offset, bit_width } });
        }
        let row_size = r.read_u32()? as usize;
        let schema = Schema { fields, attrs, row_size };

        let min_doc_id = r.read_u64()?;
        let total_documents = r.read_u64()?;
        let total_bytes = r.read_u64()?;
        let total_tokens = r.read_u64()?;
        let dict_size = r.read_u64()?;

        let blob_len = r.read_u32()? as usize;
        if r.remaining() < blob_len {
            return Err(Error::io("index header truncated".to_string()));
        }
        let settings: IndexSettings =
            bincode::deserialize(&r.data[r.pos..r.pos + blob_len])?;

        Ok(IndexHeader {
            docinfo,
            schema,
            min_doc_id,
            total_documents,
            total_bytes,
            total_tokens,
            dict_size,
            settings,
        })
    }
}

/// Renames all present segment files from one variant to another,
/// returning the list of renames performed (for rollback).
pub fn rename_segment(
    from: &SegmentPaths,
    to: &SegmentPaths,
) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut done = Vec::new();
    for ext in DATA_EXTS {
        let src = from.file(ext);
        if !src.exists() {
            continue;
        }
        let dst = to.file(ext);
        if let Err(e) = std::fs::rename(&src, &dst) {
            // roll back what we already moved
            for (moved_dst, moved_src) in done.iter().rev() {
                let _ = std::fs::rename(moved_dst, moved_src);
            }
            return Err(Error::io(format!(
                "rename {} -> {} failed: {}", src.display(), dst.display(), e)));
        }
        done.push((dst, src));
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> IndexHeader {
        let mut schema = Schema::new();
        schema.add_field("title").unwrap();
        schema.add_field("body").unwrap();
        schema.add_attr("views", AttrType::Int32, 0).unwrap();
        schema.add_attr("tags", AttrType::Mva, 0).unwrap();
        schema.finalize().unwrap();
        IndexHeader {
            docinfo: DocinfoMode::Extern,
            schema,
            min_doc_id: 1,
            total_documents: 3,
            total_bytes: 120,
            total_tokens: 17,
            dict_size: 9,
            settings: IndexSettings {
                min_word_len: 1,
                dict: DictSettings::default(),
                checkpoint_every: CHECKPOINT_EVERY,
            },
        }
    }

    #[test]
    fn header_round_trip() {
        let header = sample_header();
        let bytes = header.encode().unwrap();
        let decoded = IndexHeader::decode(&bytes).unwrap();
        assert_eq!(decoded.schema, header.schema);
        assert_eq!(decoded.total_documents, 3);
        assert_eq!(decoded.docinfo, DocinfoMode::Extern);
        assert_eq!(decoded.settings, header.settings);
    }

    #[test]
    fn corrupted_header_is_rejected() {
        let mut bytes = sample_header().encode().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        let err = IndexHeader::decode(&bytes).unwrap_err();
        assert!(err.context.contains("checksum"));
    }

    #[test]
    fn paths_carry_variant_between_prefix_and_extension() {
        let paths = SegmentPaths::new_variant("/var/idx/test1");
        assert_eq!(paths.header(), PathBuf::from("/var/idx/test1.new.sph"));
        let plain = SegmentPaths::new("/var/idx/test1");
        assert_eq!(plain.doclists(), PathBuf::from("/var/idx/test1.spd"));
    }
}
