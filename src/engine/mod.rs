//! Incremental aggregation: track diffs in, aggregate mutations and change
//! notifications out.

pub mod differ;
pub mod grouping;
pub mod library;
