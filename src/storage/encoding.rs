//! JSON encoding of list/object columns.
//!
//! Decoding validates the whole value: a column that does not parse is a
//! data-integrity failure and is reported as such instead of defaulting.

use serde::{Serialize, de::DeserializeOwned};

use crate::storage::error::StorageError;

pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::Internal(e.into()))
}

pub(crate) fn decode<T: DeserializeOwned>(
    table: &'static str,
    column: &'static str,
    raw: &str,
) -> Result<T, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::MalformedColumn {
        table,
        column,
        reason: e.to_string(),
    })
}
