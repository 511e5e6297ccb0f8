//! JSON text codecs for collection-valued columns.
//!
//! SQLite has no native list or map type, so participant sets, unread
//! counters and read receipts are stored as JSON strings.  This is purely
//! a persistence-layer encoding; nothing outside the row mappers sees it.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use parley_shared::UserId;

pub(crate) fn encode_id_set(set: &BTreeSet<UserId>) -> String {
    serde_json::to_string(set).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn decode_id_set(raw: &str) -> serde_json::Result<BTreeSet<UserId>> {
    serde_json::from_str(raw)
}

pub(crate) fn encode_count_map(map: &BTreeMap<UserId, u32>) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string())
}

pub(crate) fn decode_count_map(raw: &str) -> serde_json::Result<BTreeMap<UserId, u32>> {
    serde_json::from_str(raw)
}

pub(crate) fn encode_time_map(map: &BTreeMap<UserId, DateTime<Utc>>) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string())
}

pub(crate) fn decode_time_map(raw: &str) -> serde_json::Result<BTreeMap<UserId, DateTime<Utc>>> {
    serde_json::from_str(raw)
}

/// Wrap a serde error so it surfaces as a rusqlite conversion failure with
/// the offending column index attached.
pub(crate) fn column_decode_error(idx: usize, err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_set_round_trip() {
        let set: BTreeSet<UserId> = [UserId::new("a"), UserId::new("b")].into_iter().collect();
        let decoded = decode_id_set(&encode_id_set(&set)).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn count_map_round_trip() {
        let mut map = BTreeMap::new();
        map.insert(UserId::new("a"), 3u32);
        map.insert(UserId::new("b"), 0u32);
        let decoded = decode_count_map(&encode_count_map(&map)).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn time_map_round_trip() {
        let mut map = BTreeMap::new();
        map.insert(UserId::new("a"), Utc::now());
        let decoded = decode_time_map(&encode_time_map(&map)).unwrap();
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn empty_defaults_decode() {
        assert!(decode_id_set("[]").unwrap().is_empty());
        assert!(decode_count_map("{}").unwrap().is_empty());
    }
}
