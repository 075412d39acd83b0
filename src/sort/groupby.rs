use std::collections::{BTreeSet, HashMap};
use chrono::{Datelike, TimeZone, Utc};

use crate::core::error::{Error, Result};
use crate::schema::attr::{AttrLocator, AttrType, PackedRow};
use crate::schema::row::Match;
use crate::schema::schema::{AttrDef, Schema};
use crate::sort::compare::CompareSpec;
use crate::sort::Sorter;

/// Group key function over the group-by attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupFunc {
    Day,
    Week,
    Month,
    Year,
    Attr,
}

impl GroupFunc {
    pub fn from_wire(v: u32) -> Result<GroupFunc> {
        Ok(match v {
            0 => GroupFunc::Day,
            1 => GroupFunc::Week,
            2 => GroupFunc::Month,
            3 => GroupFunc::Year,
            4 => GroupFunc::Attr,
            other => return Err(Error::query(format!("unknown group function {}", other))),
        })
    }
}

/// Group-by request: bucket key, per-bucket ordering clause, optional
/// distinct-count attribute.
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub func: GroupFunc,
    pub attr: String,
    pub group_sort: String,
    pub distinct: Option<String>,
}

struct GroupEntry {
    best: Match,
    key: u64,
    count: u64,
    distinct: BTreeSet<u64>,
}

/// Bucketing queue: one representative per bucket chosen by the
/// per-bucket comparator, buckets ordered by the group-sort clause at
/// flatten time, with `@groupby` / `@count` / `@distinct` appended as
/// virtual attributes.
pub struct GroupBySorter {
    func: GroupFunc,
    key_loc: AttrLocator,
    distinct_loc: Option<AttrLocator>,
    /// chooses the representative match inside a bucket
    inner_spec: CompareSpec,
    /// orders buckets in the final result
    result_spec: CompareSpec,
    limit: usize,
    groups: HashMap<u64, GroupEntry>,
    out_schema: Schema,
    groupby_loc: AttrLocator,
    count_loc: AttrLocator,
    distinct_out_loc: Option<AttrLocator>,
}

impl GroupBySorter {
    pub fn new(
        spec: &GroupSpec,
        inner_spec: CompareSpec,
        limit: usize,
        base_schema: &Schema,
    ) -> Result<GroupBySorter> {
        let key_attr = base_schema
            .attr(&spec.attr)
            .ok_or_else(|| Error::query(format!("no such group-by attribute '{}'", spec.attr)))?;
        if spec.func != GroupFunc::Attr && key_attr.kind != AttrType::Timestamp {
            return Err(Error::query(format!(
                "time grouping needs a timestamp attribute, '{}' is not one", spec.attr)));
        }
        let distinct_loc = match &spec.distinct {
            Some(name) => Some(
                base_schema
                    .attr(name)
                    .ok_or_else(|| {
                        Error::query(format!("no such distinct attribute '{}'", name))
                    })?
                    .locator,
            ),
            None => None,
        };

        // outgoing schema appends the aggregate virtual attributes
        let mut out_schema = base_schema.clone();
        let mut bit = (base_schema.row_size * 32) as u32;
        let groupby_loc = AttrLocator { bit_offset: bit, bit_width: 64 };
        out_schema.attrs.push(AttrDef {
            name: "@groupby".to_string(),
            kind: AttrType::Int64,
            locator: groupby_loc,
        });
        bit += 64;
        let count_loc = AttrLocator { bit_offset: bit, bit_width: 32 };
        out_schema.attrs.push(AttrDef {
            name: "@count".to_string(),
            kind: AttrType::Int32,
            locator: count_loc,
        });
        bit += 32;
        let distinct_out_loc = if spec.distinct.is_some() {
            let loc = AttrLocator { bit_offset: bit, bit_width: 32 };
            out_schema.attrs.push(AttrDef {
                name: "@distinct".to_string(),
                kind: AttrType::Int32,
                locator: loc,
            });
            bit += 32;
            Some(loc)
        } else {
            None
        };
        out_schema.row_size = (bit as usize).div_ceil(32);

        let result_spec = CompareSpec::parse(&spec.group_sort, &out_schema)?;

        Ok(GroupBySorter {
            func: spec.func,
            key_loc: key_attr.locator,
            distinct_loc,
            inner_spec,
            result_spec,
            limit: limit.max(1),
            groups: HashMap::new(),
            out_schema,
            groupby_loc,
            count_loc,
            distinct_out_loc,
        })
    }

    fn group_key(&self, m: &Match) -> u64 {
        let value = PackedRow::get(&m.row, self.key_loc);
        match self.func {
            GroupFunc::Attr => value,
            _ => {
                let Some(dt) = Utc.timestamp_opt(value as i64, 0).single() else {
                    return 0;
                };
                match self.func {
                    GroupFunc::Day => {
                        dt.year() as u64 * 10_000 + dt.month() as u64 * 100 + dt.day() as u64
                    }
                    GroupFunc::Month => dt.year() as u64 * 100 + dt.month() as u64,
                    GroupFunc::Year => dt.year() as u64,
                    _ => {
                        let week = dt.iso_week();
                        week.year() as u64 * 100 + week.week() as u64
                    }
                }
            }
        }
    }
}

impl Sorter for GroupBySorter {
    fn push(&mut self, m: &Match) -> bool {
        let key = self.group_key(m);
        let distinct_value = self.distinct_loc.map(|loc| PackedRow::get(&m.row, loc));
        match self.groups.get_mut(&key) {
            Some(entry) => {
                entry.count += 1;
                if let Some(v) = distinct_value {
                    entry.distinct.insert(v);
                }
                if self.inner_spec.cmp(m, &entry.best) == std::cmp::Ordering::Less {
                    entry.best = m.clone();
                }
                false
            }
            None => {
                let mut distinct = BTreeSet::new();
                if let Some(v) = distinct_value {
                    distinct.insert(v);
                }
                self.groups.insert(key, GroupEntry { best: m.clone(), key, count: 1, distinct });
                true
            }
        }
    }

    fn len(&self) -> usize {
        self.groups.len().min(self.limit)
    }

    fn flatten(&mut self, out: &mut Vec<Match>, tag: i32) {
        let mut rows: Vec<Match> = Vec::with_capacity(self.groups.len());
        for entry in self.groups.values() {
            let mut m = entry.best.clone();
            m.row.resize(self.out_schema.row_size, 0);
            PackedRow::set(&mut m.row, self.groupby_loc, entry.key);
            PackedRow::set(&mut m.row, self.count_loc, entry.count);
            if let Some(loc) = self.distinct_out_loc {
                PackedRow::set(&mut m.row, loc, entry.distinct.len() as u64);
            }
            if tag >= 0 {
                m.tag = tag;
            }
            rows.push(m);
        }
        let spec = self.result_spec.clone();
        rows.sort_unstable_by(|a, b| spec.cmp(a, b));
        rows.truncate(self.limit);
        out.extend(rows);
        self.groups.clear();
    }

    fn is_groupby(&self) -> bool {
        true
    }

    fn schema(&self) -> &Schema {
        &self.out_schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        let mut schema = Schema::new();
        schema.add_attr("category", AttrType::Int32, 0).unwrap();
        schema.add_attr("author", AttrType::Int32, 0).unwrap();
        schema.add_attr("posted", AttrType::Timestamp, 0).unwrap();
        schema.finalize().unwrap();
        schema
    }

    fn m(doc_id: u64, weight: i32, category: u64, author: u64, posted: u64) -> Match {
        let schema = schema();
        let mut m = Match::new(doc_id, schema.row_size);
        m.weight = weight;
        m.set_attr(schema.attr("category").unwrap().locator, category);
        m.set_attr(schema.attr("author").unwrap().locator, author);
        m.set_attr(schema.attr("posted").unwrap().locator, posted);
        m
    }

    fn spec(distinct: Option<&str>) -> GroupSpec {
        GroupSpec {
            func: GroupFunc::Attr,
            attr: "category".to_string(),
            group_sort: "@count desc".to_string(),
            distinct: distinct.map(String::from),
        }
    }

    #[test]
    fn buckets_keep_best_match_and_count() {
        let schema = schema();
        let mut q =
            GroupBySorter::new(&spec(None), CompareSpec::relevance(), 10, &schema).unwrap();
        q.push(&m(1, 5, 7, 1, 0));
        q.push(&m(2, 9, 7, 1, 0));
        q.push(&m(3, 2, 8, 1, 0));

        let mut out = Vec::new();
        q.flatten(&mut out, 0);
        assert_eq!(out.len(), 2);
        // category 7 has two docs, best weight 9
        let gb = out[0].get_attr(q.schema().attr("@groupby").unwrap().locator);
        assert_eq!(gb, 7);
        assert_eq!(out[0].weight, 9);
        assert_eq!(out[0].get_attr(q.schema().attr("@count").unwrap().locator), 2);
    }

    #[test]
    fn distinct_counts_unique_values_per_bucket() {
        let schema = schema();
        let mut q =
            GroupBySorter::new(&spec(Some("author")), CompareSpec::relevance(), 10, &schema)
                .unwrap();
        q.push(&m(1, 1, 7, 10, 0));
        q.push(&m(2, 1, 7, 10, 0));
        q.push(&m(3, 1, 7, 11, 0));

        let mut out = Vec::new();
        q.flatten(&mut out, 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_attr(q.schema().attr("@distinct").unwrap().locator), 2);
    }

    #[test]
    fn day_grouping_buckets_by_calendar_day() {
        let schema = schema();
        let gspec = GroupSpec {
            func: GroupFunc::Day,
            attr: "posted".to_string(),
            group_sort: "@group desc".to_string(),
            distinct: None,
        };
        let mut q = GroupBySorter::new(&gspec, CompareSpec::relevance(), 10, &schema).unwrap();
        // 2009-06-15 and 2009-06-16 (same day twice)
        q.push(&m(1, 1, 0, 0, 1_245_024_000));
        q.push(&m(2, 1, 0, 0, 1_245_110_400));
        q.push(&m(3, 1, 0, 0, 1_245_110_500));

        let mut out = Vec::new();
        q.flatten(&mut out, 0);
        assert_eq!(out.len(), 2);
        let gb_loc = q.schema().attr("@groupby").unwrap().locator;
        assert_eq!(out[0].get_attr(gb_loc), 20090616);
        assert_eq!(out[1].get_attr(gb_loc), 20090615);
    }
}
