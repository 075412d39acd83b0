pub mod compare;
pub mod groupby;
pub mod topn;

use crate::schema::row::Match;
use crate::schema::schema::Schema;

/// Common queue interface consumed by the scorer: matches stream in,
/// the final ordered page comes out of `flatten`.
pub trait Sorter: Send {
    /// Returns true when the match opened a new slot (vs replacing or
    /// aggregating into an existing one).
    fn push(&mut self, m: &Match) -> bool;
    fn len(&self) -> usize;
    /// Drains the queue in final order; `tag >= 0` overrides the tag
    /// of every produced match.
    fn flatten(&mut self, out: &mut Vec<Match>, tag: i32);
    fn is_groupby(&self) -> bool;
    /// Outgoing schema, including any virtual aggregate attributes.
    fn schema(&self) -> &Schema;
}
