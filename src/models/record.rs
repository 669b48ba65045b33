//! A database row as an ordered column → value map.

use serde_json::{Map, Value};

/// Column name → value, in select-list order. Timestamps are RFC 3339 strings.
pub type Record = Map<String, Value>;

/// Build a record from `(column, value)` pairs, keeping their order.
#[cfg(test)]
pub fn record<I, K>(pairs: I) -> Record
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
