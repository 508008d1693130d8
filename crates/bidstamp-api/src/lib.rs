use std::fmt::{Debug, Formatter};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use bidstamp_core::{
    format_timestamp, map_transaction_id, select_timestamp, BidRecord, Payload, StoredDocument,
    TimeSyncRecord, TimestampSelection, TransactionId,
};
use bidstamp_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod time_source;

pub use time_source::{
    decode_transmit_time, encode_request, FixedTimeSource, SntpTimeSource, SystemTimeSource,
    TimeSource,
};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
    #[error("time source error: {0:#}")]
    TimeSource(anyhow::Error),
    #[error("no timestamps recorded for transaction {0}")]
    NoTimestamps(TransactionId),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketResult {
    pub transaction_id: TransactionId,
    pub bucket: u8,
}

/// Process-wide handle over the document store and the time source.
///
/// Construct once with [`BidStampApi::open`], clone freely into request handlers, and release
/// with [`BidStampApi::shutdown`].
#[derive(Clone)]
pub struct BidStampApi {
    store: Arc<Mutex<SqliteStore>>,
    time_source: Arc<dyn TimeSource>,
}

impl Debug for BidStampApi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BidStampApi")
            .field("time_source", &self.time_source.describe())
            .finish_non_exhaustive()
    }
}

impl BidStampApi {
    /// Open (and migrate) the database at `db_path`.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn open(db_path: &Path, time_source: Arc<dyn TimeSource>) -> Result<Self, ApiError> {
        let store = SqliteStore::open(db_path).map_err(ApiError::Storage)?;
        Self::with_store(store, time_source)
    }

    /// Wrap an already opened store, applying pending migrations.
    ///
    /// # Errors
    /// Returns an error when migrations fail.
    pub fn with_store(
        mut store: SqliteStore,
        time_source: Arc<dyn TimeSource>,
    ) -> Result<Self, ApiError> {
        store.migrate().map_err(ApiError::Storage)?;
        Ok(Self { store: Arc::new(Mutex::new(store)), time_source })
    }

    fn with_store_locked<T>(
        &self,
        f: impl FnOnce(&mut SqliteStore) -> anyhow::Result<T>,
    ) -> Result<T, ApiError> {
        let mut store =
            self.store.lock().map_err(|_| ApiError::Storage(anyhow!("store lock poisoned")))?;
        f(&mut store).map_err(ApiError::Storage)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be queried.
    pub fn schema_status(&self) -> Result<SchemaStatus, ApiError> {
        self.with_store_locked(|store| store.schema_status())
    }

    /// Run the store integrity check.
    ///
    /// # Errors
    /// Returns an error when the check cannot be executed.
    pub fn integrity_check(&self) -> Result<IntegrityReport, ApiError> {
        self.with_store_locked(|store| store.integrity_check())
    }

    /// Record one bid submitted from `owner`.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn submit_bid(
        &self,
        payload: Value,
        owner: &str,
    ) -> Result<StoredDocument<BidRecord>, ApiError> {
        let record = BidRecord { data: Payload::new(payload), owner: owner.to_string() };
        let stored = self.with_store_locked(|store| store.insert_bid(&record))?;
        tracing::info!(collection = "bids", document_id = %stored.id, owner, "stored bid");
        Ok(stored)
    }

    /// Stamp a time-sync submission from `client_ip` with the time source's current time and
    /// record it.
    ///
    /// # Errors
    /// Returns an error when the time source fails (nothing is stored) or persistence fails.
    pub fn submit_time_sync(
        &self,
        payload: Value,
        client_ip: &str,
    ) -> Result<StoredDocument<TimeSyncRecord>, ApiError> {
        let now = self.time_source.now().map_err(|err| {
            tracing::warn!(
                source = %self.time_source.describe(),
                error = %format!("{err:#}"),
                "time source unavailable"
            );
            ApiError::TimeSource(err)
        })?;
        let timestamp =
            format_timestamp(now).map_err(|err| ApiError::TimeSource(anyhow::Error::new(err)))?;

        let record = TimeSyncRecord {
            data: Payload::new(payload),
            client_ip: client_ip.to_string(),
            timestamp,
        };
        let stored = self.with_store_locked(|store| store.insert_time_sync(&record))?;
        tracing::info!(
            collection = "time_synchronization",
            document_id = %stored.id,
            transaction_id = ?stored.record.transaction_id().map(|txid| txid.to_string()),
            client_ip,
            timestamp = %stored.record.timestamp,
            "stored time-sync record"
        );
        Ok(stored)
    }

    /// Every timestamp recorded for `txid`, in storage order.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn query_timestamps(&self, txid: &TransactionId) -> Result<Vec<String>, ApiError> {
        self.with_store_locked(|store| store.timestamps_for_transaction(txid))
    }

    /// The one timestamp deterministically chosen for `txid`.
    ///
    /// # Errors
    /// Returns [`ApiError::NoTimestamps`] when nothing was recorded for `txid`, or a storage
    /// error when the lookup fails.
    pub fn select_timestamp(&self, txid: &TransactionId) -> Result<TimestampSelection, ApiError> {
        let candidates = self.query_timestamps(txid)?;
        select_timestamp(txid, &candidates).ok_or_else(|| ApiError::NoTimestamps(txid.clone()))
    }

    /// All bid documents in storage order.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn list_bids(&self) -> Result<Vec<StoredDocument<BidRecord>>, ApiError> {
        self.with_store_locked(|store| store.list_bids())
    }

    /// Release the store. Connections still shared by other clones are left to drop.
    ///
    /// # Errors
    /// Returns an error when `SQLite` fails to close the connection.
    pub fn shutdown(self) -> Result<(), ApiError> {
        match Arc::try_unwrap(self.store) {
            Ok(mutex) => {
                let store = mutex
                    .into_inner()
                    .map_err(|_| ApiError::Storage(anyhow!("store lock poisoned")))?;
                store.close().map_err(ApiError::Storage)
            }
            Err(_) => {
                tracing::warn!("store still shared at shutdown; connection closes on last drop");
                Ok(())
            }
        }
    }
}

#[must_use]
pub fn bucket_for(txid: &TransactionId) -> BucketResult {
    BucketResult { transaction_id: txid.clone(), bucket: map_transaction_id(txid.as_str()) }
}
