use std::cmp::Ordering;

use crate::core::error::{Error, Result};
use crate::schema::attr::{AttrLocator, AttrType};
use crate::schema::row::Match;
use crate::schema::schema::Schema;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SortKeyKind {
    Weight,
    Id,
    Attr { loc: AttrLocator, float: bool },
    Random,
}

#[derive(Debug, Clone, Copy)]
pub struct CompareKey {
    pub kind: SortKeyKind,
    pub asc: bool,
}

/// Compiled comparator over matches. Ties always break by docid
/// ascending, then by tag ascending (earlier-listed shard wins).
#[derive(Debug, Clone, Default)]
pub struct CompareSpec {
    pub keys: Vec<CompareKey>,
}

impl CompareSpec {
    pub fn relevance() -> Self {
        CompareSpec {
            keys: vec![CompareKey { kind: SortKeyKind::Weight, asc: false }],
        }
    }

    pub fn by_attr(loc: AttrLocator, float: bool, asc: bool) -> Self {
        CompareSpec {
            keys: vec![CompareKey { kind: SortKeyKind::Attr { loc, float }, asc }],
        }
    }

    /// Compiles an extended sort clause: a comma-separated list of
    /// `attr ASC|DESC` with the magic names `@id`, `@weight`,
    /// `@relevance`, `@rank`, `@random`, `@group`, `@count`.
    pub fn parse(clause: &str, schema: &Schema) -> Result<CompareSpec> {
        let mut keys = Vec::new();
        for item in clause.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let mut parts = item.split_whitespace();
            let name = parts.next().unwrap().to_lowercase();
            let asc = match parts.next().map(|d| d.to_lowercase()) {
                None => true,
                Some(d) if d == "asc" => true,
                Some(d) if d == "desc" => false,
                Some(d) => {
                    return Err(Error::query(format!("invalid sort order '{}'", d)));
                }
            };
            if parts.next().is_some() {
                return Err(Error::query(format!("invalid sort clause '{}'", item)));
            }
            let kind = match name.as_str() {
                "@id" => SortKeyKind::Id,
                "@weight" | "@relevance" | "@rank" => SortKeyKind::Weight,
                "@random" => SortKeyKind::Random,
                "@group" => attr_key("@groupby", schema)?,
                _ => attr_key(&name, schema)?,
            };
            keys.push(CompareKey { kind, asc });
        }
        if keys.is_empty() {
            return Err(Error::query("empty sort clause".to_string()));
        }
        Ok(CompareSpec { keys })
    }

    /// Key-only comparison; equal keys report `Equal` so a stable sort
    /// can preserve push order (shard order, docid-ascending within a
    /// shard).
    pub fn cmp_keys(&self, a: &Match, b: &Match) -> Ordering {
        for key in &self.keys {
            let ord = match key.kind {
                SortKeyKind::Weight => a.weight.cmp(&b.weight),
                SortKeyKind::Id => a.doc_id.cmp(&b.doc_id),
                SortKeyKind::Random => splitmix(a.doc_id).cmp(&splitmix(b.doc_id)),
                SortKeyKind::Attr { loc, float } => {
                    if float {
                        a.get_attr_float(loc)
                            .partial_cmp(&b.get_attr_float(loc))
                            .unwrap_or(Ordering::Equal)
                    } else {
                        a.get_attr(loc).cmp(&b.get_attr(loc))
                    }
                }
            };
            let ord = if key.asc { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Total ordering used where determinism is mandatory regardless
    /// of push order: ties break by docid ascending, then by tag.
    pub fn cmp(&self, a: &Match, b: &Match) -> Ordering {
        self.cmp_keys(a, b)
            .then(a.doc_id.cmp(&b.doc_id))
            .then(a.tag.cmp(&b.tag))
    }
}

fn attr_key(name: &str, schema: &Schema) -> Result<SortKeyKind> {
    let attr = schema
        .attr(name)
        .ok_or_else(|| Error::query(format!("no such sort attribute '{}'", name)))?;
    if attr.kind == AttrType::Mva {
        return Err(Error::query(format!("cannot sort by MVA attribute '{}'", name)));
    }
    Ok(SortKeyKind::Attr {
        loc: attr.locator,
        float: attr.kind == AttrType::Float32,
    })
}

fn splitmix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        let mut schema = Schema::new();
        schema.add_attr("views", AttrType::Int32, 0).unwrap();
        schema.add_attr("price", AttrType::Float32, 0).unwrap();
        schema.finalize().unwrap();
        schema
    }

    fn m(doc_id: u64, weight: i32, views: u64) -> Match {
        let schema = schema();
        let mut m = Match::new(doc_id, schema.row_size);
        m.weight = weight;
        m.set_attr(schema.attr("views").unwrap().locator, views);
        m
    }

    #[test]
    fn relevance_sorts_weight_desc_then_docid_asc() {
        let spec = CompareSpec::relevance();
        assert_eq!(spec.cmp(&m(1, 10, 0), &m(2, 5, 0)), Ordering::Less);
        assert_eq!(spec.cmp(&m(2, 10, 0), &m(1, 10, 0)), Ordering::Greater);
    }

    #[test]
    fn extended_clause_parses_multiple_keys() {
        let schema = schema();
        let spec = CompareSpec::parse("views DESC, @id ASC", &schema).unwrap();
        assert_eq!(spec.keys.len(), 2);
        assert_eq!(spec.cmp(&m(1, 0, 9), &m(2, 0, 3)), Ordering::Less);
        assert_eq!(spec.cmp(&m(1, 0, 3), &m(2, 0, 3)), Ordering::Less);
    }

    #[test]
    fn unknown_attribute_is_a_query_error() {
        assert!(CompareSpec::parse("nosuch ASC", &schema()).is_err());
    }
}
