pub mod aggregates;
pub mod db;
mod encoding;
pub mod error;
pub(crate) mod schema;
pub mod tracks;
