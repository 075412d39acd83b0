use roaring::RoaringTreemap;

use crate::core::error::{Error, Result};
use crate::core::types::DocId;
use crate::schema::attr::{AttrLocator, AttrType};
use crate::schema::row::{mva_values, Match};
use crate::schema::schema::Schema;

/// Filter payload as decoded from the wire / SphinxQL.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Values(Vec<i64>),
    Range { min: i64, max: i64 },
    FloatRange { min: f32, max: f32 },
}

/// Attribute filter spec; resolved against a concrete schema before use.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSpec {
    pub attr: String,
    pub op: FilterOp,
    pub exclude: bool,
}

/// A spec bound to row locators; applied before the sorter sees a match.
pub struct BoundFilter {
    locator: AttrLocator,
    kind: AttrType,
    op: FilterOp,
    exclude: bool,
    on_id: bool,
}

impl BoundFilter {
    pub fn bind(spec: &FilterSpec, schema: &Schema) -> Result<BoundFilter> {
        let mut op = spec.op.clone();
        if let FilterOp::Values(values) = &mut op {
            values.sort_unstable();
        }
        if spec.attr == "@id" || spec.attr == "id" {
            return Ok(BoundFilter {
                locator: AttrLocator::none(),
                kind: AttrType::Int64,
                op,
                exclude: spec.exclude,
                on_id: true,
            });
        }
        let attr = schema
            .attr(&spec.attr)
            .ok_or_else(|| Error::query(format!("no such filter attribute '{}'", spec.attr)))?;
        if let FilterOp::Range { min, max } = &spec.op {
            if min > max {
                return Err(Error::query(format!(
                    "invalid filter range on '{}' (min > max)", spec.attr)));
            }
        }
        Ok(BoundFilter {
            locator: attr.locator,
            kind: attr.kind,
            op,
            exclude: spec.exclude,
            on_id: false,
        })
    }

    pub fn matches(&self, m: &Match, mva_pool: &[u32]) -> bool {
        let ok = if self.on_id {
            self.check_int(m.doc_id as i64)
        } else if self.kind == AttrType::Mva {
            // MVA set filter: match when any stored value matches
            let values = mva_values(mva_pool, m.get_attr(self.locator));
            values.iter().any(|&v| self.check_int(v as i64))
        } else if self.kind == AttrType::Float32 {
            self.check_float(m.get_attr_float(self.locator))
        } else {
            self.check_int(m.get_attr(self.locator) as i64)
        };
        ok != self.exclude
    }

    fn check_int(&self, v: i64) -> bool {
        match &self.op {
            FilterOp::Values(values) => values.binary_search(&v).is_ok(),
            FilterOp::Range { min, max } => v >= *min && v <= *max,
            FilterOp::FloatRange { min, max } => {
                let f = v as f32;
                f >= *min && f <= *max
            }
        }
    }

    fn check_float(&self, f: f32) -> bool {
        match &self.op {
            FilterOp::Values(values) => values.iter().any(|&v| v as f32 == f),
            FilterOp::Range { min, max } => f >= *min as f32 && f <= *max as f32,
            FilterOp::FloatRange { min, max } => f >= *min && f <= *max,
        }
    }
}

/// Killlist union from the trailing shards of a multi-index query:
/// a doc suppressed here never reaches the sorter.
#[derive(Default)]
pub struct KillFilter {
    set: RoaringTreemap,
}

impl KillFilter {
    pub fn new() -> Self {
        KillFilter { set: RoaringTreemap::new() }
    }

    pub fn add_list(&mut self, docs: &[DocId]) {
        for &doc in docs {
            self.set.insert(doc);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn killed(&self, doc: DocId) -> bool {
        self.set.contains(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::schema::Schema;

    fn schema() -> Schema {
        let mut schema = Schema::new();
        schema.add_attr("views", AttrType::Int32, 0).unwrap();
        schema.add_attr("price", AttrType::Float32, 0).unwrap();
        schema.add_attr("tags", AttrType::Mva, 0).unwrap();
        schema.finalize().unwrap();
        schema
    }

    fn sample(views: u64, price: f32, mva_offset: u64) -> Match {
        let schema = schema();
        let mut m = Match::new(10, schema.row_size);
        m.set_attr(schema.attr("views").unwrap().locator, views);
        m.set_attr(schema.attr("price").unwrap().locator, price.to_bits() as u64);
        m.set_attr(schema.attr("tags").unwrap().locator, mva_offset);
        m
    }

    #[test]
    fn value_set_and_exclusion() {
        let schema = schema();
        let spec = FilterSpec {
            attr: "views".to_string(),
            op: FilterOp::Values(vec![3, 7, 9]),
            exclude: false,
        };
        let f = BoundFilter::bind(&spec, &schema).unwrap();
        assert!(f.matches(&sample(7, 0.0, 0), &[]));
        assert!(!f.matches(&sample(8, 0.0, 0), &[]));

        let spec = FilterSpec { exclude: true, ..spec };
        let f = BoundFilter::bind(&spec, &schema).unwrap();
        assert!(!f.matches(&sample(7, 0.0, 0), &[]));
        assert!(f.matches(&sample(8, 0.0, 0), &[]));
    }

    #[test]
    fn closed_ranges() {
        let schema = schema();
        let f = BoundFilter::bind(
            &FilterSpec {
                attr: "views".to_string(),
                op: FilterOp::Range { min: 5, max: 10 },
                exclude: false,
            },
            &schema,
        )
        .unwrap();
        assert!(f.matches(&sample(5, 0.0, 0), &[]));
        assert!(f.matches(&sample(10, 0.0, 0), &[]));
        assert!(!f.matches(&sample(11, 0.0, 0), &[]));

        let f = BoundFilter::bind(
            &FilterSpec {
                attr: "price".to_string(),
                op: FilterOp::FloatRange { min: 1.0, max: 2.0 },
                exclude: false,
            },
            &schema,
        )
        .unwrap();
        assert!(f.matches(&sample(0, 1.5, 0), &[]));
        assert!(!f.matches(&sample(0, 2.5, 0), &[]));
    }

    #[test]
    fn mva_matches_any_value() {
        let schema = schema();
        let pool = [0u32, 2, 30, 40];
        let f = BoundFilter::bind(
            &FilterSpec {
                attr: "tags".to_string(),
                op: FilterOp::Values(vec![40, 99]),
                exclude: false,
            },
            &schema,
        )
        .unwrap();
        assert!(f.matches(&sample(0, 0.0, 1), &pool));
        assert!(!f.matches(&sample(0, 0.0, 0), &pool));
    }

    #[test]
    fn bad_range_is_rejected() {
        let schema = schema();
        let spec = FilterSpec {
            attr: "views".to_string(),
            op: FilterOp::Range { min: 10, max: 5 },
            exclude: false,
        };
        assert!(BoundFilter::bind(&spec, &schema).is_err());
    }

    #[test]
    fn kill_filter_suppresses() {
        let mut kill = KillFilter::new();
        kill.add_list(&[2, 4]);
        assert!(kill.killed(2));
        assert!(!kill.killed(3));
    }
}
