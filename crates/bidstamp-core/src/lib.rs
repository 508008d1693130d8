use std::fmt::{Display, Formatter};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use ulid::Ulid;

/// Number of buckets a transaction id is mapped into.
pub const BUCKET_COUNT: u8 = 10;

/// Payload field that carries the transaction id of a time-sync submission.
pub const TRANSACTION_ID_FIELD: &str = "txID";

pub const SELECTION_RULESET_VERSION: &str = "crc32-chacha8-shuffle.v1";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("timestamp error: {0}")]
    Timestamp(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DocumentId(pub Ulid);

impl DocumentId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DocumentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Bids,
    TimeSynchronization,
}

impl Collection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bids => "bids",
            Self::TimeSynchronization => "time_synchronization",
        }
    }
}

/// Opaque client-supplied identifier correlating a bid with its time-sync records.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn bucket(&self) -> u8 {
        map_transaction_id(&self.0)
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Schema-less client payload. Fields are only interpreted where a caller asks for them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct Payload(pub Value);

impl Payload {
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// The `txID` field, when the payload is an object and the field is a string.
    #[must_use]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.0.get(TRANSACTION_ID_FIELD).and_then(Value::as_str).map(TransactionId::new)
    }

    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BidRecord {
    pub data: Payload,
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeSyncRecord {
    pub data: Payload,
    #[serde(rename = "clientIP")]
    pub client_ip: String,
    pub timestamp: String,
}

impl TimeSyncRecord {
    #[must_use]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.data.transaction_id()
    }
}

/// A record as persisted, with the store-assigned identifier serialized as `_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredDocument<T> {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    #[serde(flatten)]
    pub record: T,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimestampSelection {
    pub transaction_id: TransactionId,
    pub bucket: u8,
    pub candidates: usize,
    pub timestamp: String,
    pub ruleset_version: String,
}

/// Map a transaction id onto `1..=BUCKET_COUNT` with CRC-32 (IEEE) over its UTF-8 bytes.
///
/// Stored selections depend on this exact formula; it must not change.
#[must_use]
pub fn map_transaction_id(txid: &str) -> u8 {
    let remainder = crc32fast::hash(txid.as_bytes()) % u32::from(BUCKET_COUNT);
    // remainder < BUCKET_COUNT, so the conversion cannot fail
    u8::try_from(remainder).map_or(BUCKET_COUNT, |value| value + 1)
}

/// Deterministically choose one timestamp for `txid` out of `candidates`.
///
/// Candidates are brought into lexicographic order first, so the choice depends only on the
/// set of recorded timestamps and the transaction id, never on storage order.
#[must_use]
pub fn select_timestamp(
    txid: &TransactionId,
    candidates: &[String],
) -> Option<TimestampSelection> {
    if candidates.is_empty() {
        return None;
    }

    let bucket = txid.bucket();
    let mut ordered = candidates.to_vec();
    ordered.sort_unstable();

    let mut rng = ChaCha8Rng::seed_from_u64(u64::from(bucket));
    ordered.shuffle(&mut rng);

    let timestamp = ordered.into_iter().next()?;
    Some(TimestampSelection {
        transaction_id: txid.clone(),
        bucket,
        candidates: candidates.len(),
        timestamp,
        ruleset_version: SELECTION_RULESET_VERSION.to_string(),
    })
}

/// Render a wall-clock instant as `YYYY-MM-DD HH:MM:SS` in UTC, dropping sub-second precision.
///
/// # Errors
/// Returns an error when the instant cannot be formatted.
pub fn format_timestamp(at: OffsetDateTime) -> Result<String, LedgerError> {
    at.to_offset(time::UtcOffset::UTC)
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .map_err(|err| LedgerError::Timestamp(err.to_string()))
}

/// Parse a timestamp previously produced by [`format_timestamp`].
///
/// # Errors
/// Returns an error when the value is not `YYYY-MM-DD HH:MM:SS`.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    PrimitiveDateTime::parse(value, format)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| LedgerError::Timestamp(format!("invalid timestamp {value:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fixture_candidates() -> Vec<String> {
        vec![
            "2023-11-14 22:13:20".to_string(),
            "2023-11-14 22:13:21".to_string(),
            "2023-11-14 22:13:25".to_string(),
            "2023-11-14 22:14:02".to_string(),
        ]
    }

    fn seeded_permutation(values: &[String], seed: u64) -> Vec<String> {
        fn splitmix64(mut value: u64) -> u64 {
            value = value.wrapping_add(0x9E37_79B9_7F4A_7C15);
            let mut z = value;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            z ^ (z >> 31)
        }

        let mut keyed = values
            .iter()
            .enumerate()
            .map(|(index, value)| (splitmix64(seed ^ index as u64), value.clone()))
            .collect::<Vec<_>>();
        keyed.sort_by(|lhs, rhs| lhs.0.cmp(&rhs.0));
        keyed.into_iter().map(|(_, value)| value).collect()
    }

    // Test IDs: TMAP-001
    #[test]
    fn crc32_matches_ieee_check_value() {
        assert_eq!(crc32fast::hash(b""), 0);
        assert_eq!(crc32fast::hash(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32fast::hash(b"tx123"), 0x13F2_83A1);
    }

    // Test IDs: TMAP-002
    #[test]
    fn map_transaction_id_reproduces_pinned_vectors() {
        assert_eq!(map_transaction_id(""), 1);
        assert_eq!(map_transaction_id("tx123"), 4);
        assert_eq!(map_transaction_id("abc"), 9);
        assert_eq!(map_transaction_id("a"), 8);
        assert_eq!(map_transaction_id("123456789"), 3);
        assert_eq!(map_transaction_id("txid-\u{e9}"), 7);
    }

    #[test]
    fn transaction_id_bucket_delegates_to_mapper() {
        let txid = TransactionId::new("tx123");
        assert_eq!(txid.bucket(), map_transaction_id("tx123"));
        assert_eq!(txid.to_string(), "tx123");
    }

    #[test]
    fn payload_transaction_id_requires_string_field() {
        let with_id = Payload::new(serde_json::json!({"txID": "abc", "org": "Org1MSP"}));
        assert_eq!(with_id.transaction_id(), Some(TransactionId::new("abc")));

        let numeric = Payload::new(serde_json::json!({"txID": 42}));
        assert_eq!(numeric.transaction_id(), None);

        let missing = Payload::new(serde_json::json!({"amount": 5}));
        assert_eq!(missing.transaction_id(), None);

        let scalar = Payload::new(serde_json::json!("abc"));
        assert_eq!(scalar.transaction_id(), None);
    }

    #[test]
    fn time_sync_record_serializes_client_ip_and_document_id() -> Result<(), serde_json::Error> {
        let stored = StoredDocument {
            id: DocumentId::new(),
            record: TimeSyncRecord {
                data: Payload::new(serde_json::json!({"txID": "abc"})),
                client_ip: "10.0.0.7".to_string(),
                timestamp: "2023-11-14 22:13:20".to_string(),
            },
        };

        let value = serde_json::to_value(&stored)?;
        assert_eq!(value.get("clientIP").and_then(Value::as_str), Some("10.0.0.7"));
        assert_eq!(value.get("timestamp").and_then(Value::as_str), Some("2023-11-14 22:13:20"));
        assert_eq!(
            value.get("data").and_then(|data| data.get("txID")).and_then(Value::as_str),
            Some("abc")
        );
        assert_eq!(value.get("_id").and_then(Value::as_str), Some(stored.id.to_string().as_str()));

        let decoded: StoredDocument<TimeSyncRecord> = serde_json::from_value(value)?;
        assert_eq!(decoded, stored);
        Ok(())
    }

    #[test]
    fn format_timestamp_truncates_to_seconds_in_utc() -> Result<(), LedgerError> {
        let at = OffsetDateTime::from_unix_timestamp_nanos(1_700_000_000_987_000_000)
            .map_err(|err| LedgerError::Timestamp(err.to_string()))?;
        assert_eq!(format_timestamp(at)?, "2023-11-14 22:13:20");

        let shifted = at.to_offset(
            time::UtcOffset::from_hms(2, 0, 0)
                .map_err(|err| LedgerError::Timestamp(err.to_string()))?,
        );
        assert_eq!(format_timestamp(shifted)?, "2023-11-14 22:13:20");
        Ok(())
    }

    #[test]
    fn parse_timestamp_accepts_formatted_values_only() -> Result<(), LedgerError> {
        let parsed = parse_timestamp("2023-11-14 22:13:20")?;
        assert_eq!(parsed.unix_timestamp(), 1_700_000_000);
        assert!(parse_timestamp("2023-11-14T22:13:20Z").is_err());
        assert!(parse_timestamp("").is_err());
        Ok(())
    }

    // Test IDs: TSEL-001
    #[test]
    fn select_timestamp_returns_none_without_candidates() {
        assert_eq!(select_timestamp(&TransactionId::new("abc"), &[]), None);
    }

    // Test IDs: TSEL-002
    #[test]
    fn select_timestamp_with_single_candidate_returns_it() {
        let txid = TransactionId::new("abc");
        let selection = select_timestamp(&txid, &["2023-11-14 22:13:20".to_string()]);
        let Some(selection) = selection else {
            panic!("expected a selection for a single candidate");
        };
        assert_eq!(selection.timestamp, "2023-11-14 22:13:20");
        assert_eq!(selection.bucket, 9);
        assert_eq!(selection.candidates, 1);
        assert_eq!(selection.ruleset_version, SELECTION_RULESET_VERSION);
    }

    // Test IDs: TSEL-003
    #[test]
    fn select_timestamp_is_stable_across_repeated_calls() {
        let txid = TransactionId::new("tx123");
        let candidates = fixture_candidates();
        let first = select_timestamp(&txid, &candidates);
        for _ in 0..16 {
            assert_eq!(select_timestamp(&txid, &candidates), first);
        }
    }

    // Test IDs: TSEL-006
    #[test]
    fn select_timestamp_picks_pinned_candidate_per_transaction() {
        let candidates = fixture_candidates();
        for (txid, expected) in [
            ("tx123", "2023-11-14 22:13:25"),
            ("abc", "2023-11-14 22:14:02"),
            ("", "2023-11-14 22:14:02"),
        ] {
            let selection = select_timestamp(&TransactionId::new(txid), &candidates);
            assert_eq!(
                selection.map(|value| value.timestamp),
                Some(expected.to_string()),
                "txid {txid:?}"
            );
        }
    }

    // Test IDs: TSEL-004
    #[test]
    fn select_timestamp_keeps_duplicates_in_candidate_count() {
        let txid = TransactionId::new("abc");
        let candidates = vec!["2023-11-14 22:13:20".to_string(), "2023-11-14 22:13:20".to_string()];
        let selection = select_timestamp(&txid, &candidates);
        assert_eq!(selection.as_ref().map(|value| value.candidates), Some(2));
        assert_eq!(
            selection.map(|value| value.timestamp),
            Some("2023-11-14 22:13:20".to_string())
        );
    }

    // Test IDs: TMAP-003
    proptest! {
        #[test]
        fn property_mapped_value_is_in_range_and_deterministic(txid in any::<String>()) {
            let first = map_transaction_id(&txid);
            prop_assert!((1..=BUCKET_COUNT).contains(&first));
            prop_assert_eq!(first, map_transaction_id(&txid));
        }
    }

    // Test IDs: TSEL-005
    proptest! {
        #[test]
        fn property_selection_ignores_storage_order(
            txid in "[a-zA-Z0-9]{1,24}",
            seed_a in any::<u64>(),
            seed_b in any::<u64>(),
        ) {
            let txid = TransactionId::new(txid);
            let base = fixture_candidates();
            let order_a = seeded_permutation(&base, seed_a);
            let order_b = seeded_permutation(&base, seed_b);

            let selection_a = select_timestamp(&txid, &order_a);
            let selection_b = select_timestamp(&txid, &order_b);
            prop_assert!(selection_a.is_some());
            prop_assert_eq!(&selection_a, &selection_b);

            let chosen = selection_a.map(|value| value.timestamp).unwrap_or_default();
            prop_assert!(base.contains(&chosen));
        }
    }
}
