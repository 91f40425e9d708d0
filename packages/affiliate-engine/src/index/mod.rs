//! The master index: sole owner and mutator of canonical programs.

mod master;
mod merge;
mod query;

pub use master::{IndexExport, IndexStats, MasterIndex};
pub use merge::{merge_record, precedence, MergePlan, Precedence, TieBreak};
pub use query::{
    decode_cursor, encode_cursor, network_of, ProgramPage, ProgramQuery, SortOrder,
    DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};

use crate::types::CanonicalProgram;

/// Read-only view of the index used by trigger predicates.
pub trait IndexReader: Send + Sync {
    fn count(&self, query: &ProgramQuery) -> usize;

    /// Every match in query order, ignoring paging.
    fn search(&self, query: &ProgramQuery) -> Vec<CanonicalProgram>;

    fn stats(&self) -> IndexStats;
}
