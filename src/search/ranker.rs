use crate::core::error::{Error, Result};
use crate::core::types::{MAX_FIELDS, hit_field, hit_pos};
use crate::search::matcher::MatchedHit;

/// BM25 constants.
pub const BM25_K1: f32 = 1.2;
pub const BM25_B: f32 = 0.75;
/// Proximity rankers pack the BM25 part into the low three decimal
/// digits of the weight.
pub const BM25_SCALE: i32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankMode {
    ProximityBm25,
    Bm25,
    None,
    Wordcount,
    Proximity,
    MatchAny,
    FieldMask,
}

impl RankMode {
    pub fn from_wire(v: u32) -> Result<RankMode> {
        Ok(match v {
            0 => RankMode::ProximityBm25,
            1 => RankMode::Bm25,
            2 => RankMode::None,
            3 => RankMode::Wordcount,
            4 => RankMode::Proximity,
            5 => RankMode::MatchAny,
            6 => RankMode::FieldMask,
            other => return Err(Error::query(format!("unknown ranking mode {}", other))),
        })
    }

    pub fn needs_hits(self) -> bool {
        !matches!(self, RankMode::None | RankMode::Bm25)
    }
}

/// Per-document ranking input. `hits` must be sorted by packed
/// position; `bm25` is the scaled integer part in `0..BM25_SCALE`.
pub struct RankContext<'a> {
    pub hits: &'a [MatchedHit],
    pub field_weights: &'a [i32; MAX_FIELDS],
    pub bm25: i32,
}

/// Deterministic weight function; monomorphic per ranking mode so the
/// per-document loop stays free of dynamic dispatch.
pub trait Ranker {
    fn weight(ctx: &RankContext) -> i32;
}

pub struct ProximityBm25Ranker;
pub struct Bm25Ranker;
pub struct NoneRanker;
pub struct WordcountRanker;
pub struct ProximityRanker;
pub struct MatchAnyRanker;
pub struct FieldMaskRanker;

/// Longest run of hits with consecutive atom positions and consecutive
/// in-field positions, per field, summed with field weights.
fn weighted_lcs(ctx: &RankContext) -> i32 {
    let mut sum = 0i32;
    let mut best = [0u32; MAX_FIELDS];
    let mut run = 0u32;
    let mut prev: Option<(u32, u32, u32)> = None; // field, pos, qpos
    for &(qpos, hit) in ctx.hits {
        let field = hit_field(hit);
        let pos = hit_pos(hit);
        run = match prev {
            Some((pf, pp, pq)) if pf == field && pos == pp + 1 && qpos == pq + 1 => run + 1,
            _ => 1,
        };
        prev = Some((field, pos, qpos));
        let f = field as usize;
        best[f] = best[f].max(run);
    }
    for (f, &lcs) in best.iter().enumerate() {
        sum += lcs as i32 * ctx.field_weights[f];
    }
    sum
}

impl Ranker for ProximityBm25Ranker {
    fn weight(ctx: &RankContext) -> i32 {
        weighted_lcs(ctx) * BM25_SCALE + ctx.bm25
    }
}

impl Ranker for Bm25Ranker {
    fn weight(ctx: &RankContext) -> i32 {
        ctx.bm25
    }
}

impl Ranker for NoneRanker {
    fn weight(_ctx: &RankContext) -> i32 {
        1
    }
}

impl Ranker for WordcountRanker {
    fn weight(ctx: &RankContext) -> i32 {
        let mut sum = 0i32;
        for &(_, hit) in ctx.hits {
            sum += ctx.field_weights[hit_field(hit) as usize];
        }
        sum
    }
}

impl Ranker for ProximityRanker {
    fn weight(ctx: &RankContext) -> i32 {
        weighted_lcs(ctx)
    }
}

impl Ranker for MatchAnyRanker {
    fn weight(ctx: &RankContext) -> i32 {
        // distinct matched keywords per field, field-weighted
        let mut seen = std::collections::HashSet::new();
        let mut counts = [0i32; MAX_FIELDS];
        for &(qpos, hit) in ctx.hits {
            let field = hit_field(hit);
            if seen.insert((field, qpos)) {
                counts[field as usize] += 1;
            }
        }
        counts
            .iter()
            .enumerate()
            .map(|(f, &c)| c * ctx.field_weights[f])
            .sum()
    }
}

impl Ranker for FieldMaskRanker {
    fn weight(ctx: &RankContext) -> i32 {
        let mut mask = 0u32;
        for &(_, hit) in ctx.hits {
            mask |= 1 << hit_field(hit);
        }
        mask as i32
    }
}

/// Dispatches once per query; the ranker choice is resolved to a
/// monomorphic function before the document loop runs.
pub fn ranker_fn(mode: RankMode) -> fn(&RankContext) -> i32 {
    match mode {
        RankMode::ProximityBm25 => ProximityBm25Ranker::weight,
        RankMode::Bm25 => Bm25Ranker::weight,
        RankMode::None => NoneRanker::weight,
        RankMode::Wordcount => WordcountRanker::weight,
        RankMode::Proximity => ProximityRanker::weight,
        RankMode::MatchAny => MatchAnyRanker::weight,
        RankMode::FieldMask => FieldMaskRanker::weight,
    }
}

/// Scaled integer BM25 over the matched terms: the per-term idf and tf
/// parts are normalized so the sum stays inside `0..BM25_SCALE`.
///
/// The index stores no per-document token counts, so the length part
/// of the `b` term runs at the collection average (dl/avgdl == 1);
/// equal term frequencies weigh equally regardless of document size,
/// and ties fall through to the queue's docid ordering.
pub struct Bm25Calc {
    /// Per query term: normalized idf in [0, 1].
    pub idfs: Vec<f32>,
}

impl Bm25Calc {
    pub fn new(term_docs: &[u64], total_docs: u64) -> Self {
        let n = total_docs.max(1) as f32;
        let idfs = term_docs
            .iter()
            .map(|&df| {
                let df = df as f32;
                let raw = ((n - df + 0.5) / (df + 0.5)).ln().max(0.0);
                raw / (n + 1.0).ln()
            })
            .collect();
        Bm25Calc { idfs }
    }

    /// `tfs[i]` is term i's hit count in the doc.
    pub fn weight(&self, tfs: &[u32]) -> i32 {
        if self.idfs.is_empty() {
            return 0;
        }
        // k1 * (1 - b + b*dl/avgdl), with dl/avgdl pinned at 1
        let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * 1.0);
        let mut sum = 0.0f32;
        for (i, &idf) in self.idfs.iter().enumerate() {
            let tf = tfs.get(i).copied().unwrap_or(0) as f32;
            if tf > 0.0 {
                sum += idf * (tf * (BM25_K1 + 1.0)) / (tf + norm) / (BM25_K1 + 1.0);
            }
        }
        let scaled = (sum / self.idfs.len() as f32) * (BM25_SCALE - 1) as f32;
        scaled as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::hit_pack;

    fn weights() -> [i32; MAX_FIELDS] {
        [1; MAX_FIELDS]
    }

    #[test]
    fn lcs_rewards_adjacent_query_words() {
        let w = weights();
        // "a b" matching adjacently in field 0
        let hits = vec![(1, hit_pack(0, 4)), (2, hit_pack(0, 5))];
        let ctx = RankContext { hits: &hits, field_weights: &w, bm25: 0 };
        assert_eq!(ProximityRanker::weight(&ctx), 2);

        // same words, not adjacent
        let hits = vec![(1, hit_pack(0, 4)), (2, hit_pack(0, 9))];
        let ctx = RankContext { hits: &hits, field_weights: &w, bm25: 0 };
        assert_eq!(ProximityRanker::weight(&ctx), 1);
    }

    #[test]
    fn proximity_bm25_packs_both_parts() {
        let w = weights();
        let hits = vec![(1, hit_pack(0, 1)), (2, hit_pack(0, 2))];
        let ctx = RankContext { hits: &hits, field_weights: &w, bm25: 750 };
        assert_eq!(ProximityBm25Ranker::weight(&ctx), 2 * BM25_SCALE + 750);
    }

    #[test]
    fn field_mask_ranker_reports_matched_fields() {
        let w = weights();
        let hits = vec![(1, hit_pack(0, 1)), (1, hit_pack(2, 3))];
        let ctx = RankContext { hits: &hits, field_weights: &w, bm25: 0 };
        assert_eq!(FieldMaskRanker::weight(&ctx), 0b101);
    }

    #[test]
    fn bm25_is_deterministic_and_bounded() {
        let calc = Bm25Calc::new(&[2, 1], 3);
        let a = calc.weight(&[1, 1]);
        let b = calc.weight(&[1, 1]);
        assert_eq!(a, b);
        assert!(a >= 0 && a < BM25_SCALE);

        // rarer terms weigh more
        let rare = calc.weight(&[0, 1]);
        let common = calc.weight(&[1, 0]);
        assert!(rare > common);
    }
}
