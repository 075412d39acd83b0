use std::fs;
use std::path::PathBuf;

use crate::analysis::dict::Dict;
use crate::analysis::tokenizer::Tokenizer;
use crate::core::error::{Error, Result};
use crate::core::types::{
    DocId, Hitpos, WordId, HIT_POS_MASK, hit_pack, hit_pos, hit_set_field_end,
};
use crate::schema::attr::AttrType;
use crate::schema::schema::Schema;

/// Attribute value as produced by a source, before row packing.
/// Strings feed ordinal attributes and are ranked by the indexer.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrSourceValue {
    Int(u64),
    Float(f32),
    Str(String),
    Mva(Vec<u32>),
}

/// Hits plus attributes for one document.
#[derive(Debug, Clone)]
pub struct DocHits {
    pub doc_id: DocId,
    pub attrs: Vec<AttrSourceValue>,
    /// `(wordid, packed position)`, in field/position order.
    pub hits: Vec<(WordId, Hitpos)>,
    /// Total token positions across fields, stopwords included.
    pub token_count: u32,
}

/// Pluggable document source driven by the indexer: `connect`, then
/// `iterate_hits_start`, then `iterate_hits_next` per document until
/// None. SQL/XML adapters live outside the core; `VecSource` (tests)
/// and `TsvSource` (CLI) are built in.
pub trait DocumentSource: Send {
    fn connect(&mut self) -> Result<()>;
    fn schema(&self) -> &Schema;
    fn iterate_hits_start(
        &mut self,
        tokenizer: Box<dyn Tokenizer>,
        dict: Box<dyn Dict>,
    ) -> Result<()>;
    fn iterate_hits_next(&mut self) -> Result<Option<DocHits>>;
    /// Docids this source wants suppressed in earlier indexes.
    fn kill_list(&mut self) -> Result<Vec<DocId>>;
}

/// Tokenizes one document's fields into packed hits.
///
/// Stopwords consume a position but emit no hit; the hits at each
/// field's final position carry the field-end flag.
pub fn build_doc_hits(
    doc_id: DocId,
    fields: &[String],
    attrs: &[AttrSourceValue],
    tokenizer: &mut dyn Tokenizer,
    dict: &mut dyn Dict,
) -> DocHits {
    let mut hits = Vec::new();
    let mut token_count = 0u32;

    for (field_idx, text) in fields.iter().enumerate() {
        tokenizer.set_buffer(text.as_bytes());

        // collect (token, position) first so multi-token wordforms can
        // look ahead
        let mut tokens: Vec<(String, u32)> = Vec::new();
        let mut pos = 0u32;
        while let Some(token) = tokenizer.next() {
            let token = String::from_utf8_lossy(token).into_owned();
            pos += 1 + tokenizer.overshort_count();
            if pos > HIT_POS_MASK {
                break;
            }
            tokens.push((token, pos));
        }
        pos += tokenizer.overshort_count();
        token_count += pos;

        let tokens = apply_multiforms(tokens, dict);

        let field_last_pos = tokens.last().map(|(_, p)| *p).unwrap_or(0);
        let start = hits.len();
        for (token, pos) in &tokens {
            let word_id = dict.word_id(token.as_bytes());
            if word_id == 0 {
                continue;
            }
            hits.push((word_id, hit_pack(field_idx as u32, *pos)));
        }
        for hit in &mut hits[start..] {
            if hit_pos(hit.1) == field_last_pos {
                hit.1 = hit_set_field_end(hit.1);
            }
        }
    }

    DocHits { doc_id, attrs: attrs.to_vec(), hits, token_count }
}

fn apply_multiforms(tokens: Vec<(String, u32)>, dict: &dyn Dict) -> Vec<(String, u32)> {
    let forms = dict.multiword_forms();
    if forms.forms.is_empty() {
        return tokens;
    }
    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0;
    'outer: while i < tokens.len() {
        let max = forms.max_tokens.min(tokens.len() - i);
        for window in (2..=max).rev() {
            let key: Vec<String> = tokens[i..i + window].iter().map(|(t, _)| t.clone()).collect();
            if let Some(dst) = forms.forms.get(&key) {
                out.push((dst.clone(), tokens[i].1));
                i += window;
                continue 'outer;
            }
        }
        out.push(tokens[i].clone());
        i += 1;
    }
    out
}

/// In-memory source; the test seam.
pub struct VecSource {
    schema: Schema,
    docs: Vec<(DocId, Vec<String>, Vec<AttrSourceValue>)>,
    kill: Vec<DocId>,
    cursor: usize,
    tokenizer: Option<Box<dyn Tokenizer>>,
    dict: Option<Box<dyn Dict>>,
}

impl VecSource {
    pub fn new(schema: Schema, docs: Vec<(DocId, Vec<String>, Vec<AttrSourceValue>)>) -> Self {
        VecSource { schema, docs, kill: Vec::new(), cursor: 0, tokenizer: None, dict: None }
    }

    pub fn with_kill_list(mut self, kill: Vec<DocId>) -> Self {
        self.kill = kill;
        self
    }
}

impl DocumentSource for VecSource {
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn iterate_hits_start(
        &mut self,
        tokenizer: Box<dyn Tokenizer>,
        dict: Box<dyn Dict>,
    ) -> Result<()> {
        self.cursor = 0;
        self.tokenizer = Some(tokenizer);
        self.dict = Some(dict);
        Ok(())
    }

    fn iterate_hits_next(&mut self) -> Result<Option<DocHits>> {
        let Some((doc_id, fields, attrs)) = self.docs.get(self.cursor).cloned() else {
            return Ok(None);
        };
        self.cursor += 1;
        if doc_id == 0 {
            return Err(Error::parse("document id 0 is reserved".to_string()));
        }
        let tokenizer = self.tokenizer.as_deref_mut()
            .ok_or_else(|| Error::internal("iterate_hits_start not called"))?;
        let dict = self.dict.as_deref_mut()
            .ok_or_else(|| Error::internal("iterate_hits_start not called"))?;
        Ok(Some(build_doc_hits(doc_id, &fields, &attrs, tokenizer, dict)))
    }

    fn kill_list(&mut self) -> Result<Vec<DocId>> {
        let mut kill = self.kill.clone();
        kill.sort_unstable();
        kill.dedup();
        Ok(kill)
    }
}

/// Tab-separated file source: `docid \t attr.. \t field..` per line,
/// attributes first in declared order, MVA values comma-separated.
pub struct TsvSource {
    schema: Schema,
    path: PathBuf,
    kill: Vec<DocId>,
    lines: Vec<String>,
    cursor: usize,
    tokenizer: Option<Box<dyn Tokenizer>>,
    dict: Option<Box<dyn Dict>>,
}

impl TsvSource {
    pub fn new(schema: Schema, path: impl Into<PathBuf>, kill: Vec<DocId>) -> Self {
        TsvSource {
            schema,
            path: path.into(),
            kill,
            lines: Vec::new(),
            cursor: 0,
            tokenizer: None,
            dict: None,
        }
    }

    fn parse_line(&self, line: &str) -> Result<(DocId, Vec<String>, Vec<AttrSourceValue>)> {
        let mut columns = line.split('\t');
        let doc_id: DocId = columns
            .next()
            .and_then(|c| c.trim().parse().ok())
            .ok_or_else(|| Error::parse(format!("bad docid in line '{}'", line)))?;

        let mut attrs = Vec::with_capacity(self.schema.attrs.len());
        for attr in &self.schema.attrs {
            let raw = columns.next().ok_or_else(|| {
                Error::parse(format!("doc {}: missing attribute '{}'", doc_id, attr.name))
            })?;
            let value = match attr.kind {
                AttrType::Float32 => AttrSourceValue::Float(raw.trim().parse().map_err(|_| {
                    Error::parse(format!("doc {}: bad float '{}'", doc_id, raw))
                })?),
                AttrType::Ordinal => AttrSourceValue::Str(raw.to_string()),
                AttrType::Mva => {
                    let mut values = Vec::new();
                    for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
                        values.push(part.trim().parse().map_err(|_| {
                            Error::parse(format!("doc {}: bad mva value '{}'", doc_id, part))
                        })?);
                    }
                    AttrSourceValue::Mva(values)
                }
                _ => AttrSourceValue::Int(raw.trim().parse().map_err(|_| {
                    Error::parse(format!("doc {}: bad integer '{}'", doc_id, raw))
                })?),
            };
            attrs.push(value);
        }

        let mut fields: Vec<String> = columns.map(|c| c.to_string()).collect();
        fields.resize(self.schema.fields.len(), String::new());
        Ok((doc_id, fields, attrs))
    }
}

impl DocumentSource for TsvSource {
    fn connect(&mut self) -> Result<()> {
        let text = fs::read_to_string(&self.path).map_err(|e| {
            Error::io(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        self.lines = text.lines().filter(|l| !l.trim().is_empty()).map(String::from).collect();
        Ok(())
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn iterate_hits_start(
        &mut self,
        tokenizer: Box<dyn Tokenizer>,
        dict: Box<dyn Dict>,
    ) -> Result<()> {
        self.cursor = 0;
        self.tokenizer = Some(tokenizer);
        self.dict = Some(dict);
        Ok(())
    }

    fn iterate_hits_next(&mut self) -> Result<Option<DocHits>> {
        let Some(line) = self.lines.get(self.cursor).cloned() else {
            return Ok(None);
        };
        self.cursor += 1;
        let (doc_id, fields, attrs) = self.parse_line(&line)?;
        let tokenizer = self.tokenizer.as_deref_mut()
            .ok_or_else(|| Error::internal("iterate_hits_start not called"))?;
        let dict = self.dict.as_deref_mut()
            .ok_or_else(|| Error::internal("iterate_hits_start not called"))?;
        Ok(Some(build_doc_hits(doc_id, &fields, &attrs, tokenizer, dict)))
    }

    fn kill_list(&mut self) -> Result<Vec<DocId>> {
        let mut kill = self.kill.clone();
        kill.sort_unstable();
        kill.dedup();
        Ok(kill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::dict::{DictSettings, StandardDict};
    use crate::analysis::tokenizer::StandardTokenizer;
    use crate::core::types::{hit_field, hit_is_field_end};

    fn two_field_schema() -> Schema {
        let mut schema = Schema::new();
        schema.add_field("title").unwrap();
        schema.add_field("body").unwrap();
        schema.finalize().unwrap();
        schema
    }

    #[test]
    fn hits_carry_field_and_position() {
        let mut tokenizer = StandardTokenizer::new(1);
        let mut dict = StandardDict::new(DictSettings::default()).unwrap();
        let fields = vec!["hello world".to_string(), "again".to_string()];
        let doc = build_doc_hits(7, &fields, &[], &mut tokenizer, &mut dict);

        assert_eq!(doc.doc_id, 7);
        assert_eq!(doc.hits.len(), 3);
        assert_eq!(hit_field(doc.hits[0].1), 0);
        assert!(!hit_is_field_end(doc.hits[0].1));
        assert!(hit_is_field_end(doc.hits[1].1));
        assert_eq!(hit_field(doc.hits[2].1), 1);
        assert!(hit_is_field_end(doc.hits[2].1));
        assert_eq!(doc.token_count, 3);
    }

    #[test]
    fn stopwords_hold_positions_open() {
        let mut tokenizer = StandardTokenizer::new(1);
        let mut dict = StandardDict::new(DictSettings::default()).unwrap();
        dict.add_stopwords(&["the"]);
        let fields = vec!["the quick fox".to_string()];
        let doc = build_doc_hits(1, &fields, &[], &mut tokenizer, &mut dict);

        // "quick" keeps position 2, "fox" position 3
        assert_eq!(doc.hits.len(), 2);
        assert_eq!(crate::core::types::hit_pos(doc.hits[0].1), 2);
        assert_eq!(crate::core::types::hit_pos(doc.hits[1].1), 3);
    }

    #[test]
    fn vec_source_streams_documents() {
        let schema = two_field_schema();
        let mut source = VecSource::new(schema, vec![
            (1, vec!["quick".to_string(), String::new()], vec![]),
            (2, vec!["dog".to_string(), String::new()], vec![]),
        ]);
        source.connect().unwrap();
        source
            .iterate_hits_start(
                Box::new(StandardTokenizer::new(1)),
                Box::new(StandardDict::new(DictSettings::default()).unwrap()),
            )
            .unwrap();
        assert_eq!(source.iterate_hits_next().unwrap().unwrap().doc_id, 1);
        assert_eq!(source.iterate_hits_next().unwrap().unwrap().doc_id, 2);
        assert!(source.iterate_hits_next().unwrap().is_none());
    }
}
