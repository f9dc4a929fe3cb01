pub mod models;

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use self::models::DeviceRecord;
pub use self::models::{IngestOutcome, IngestSummary, Reading, Timestamp};

type SharedRecord = Arc<RwLock<DeviceRecord>>;

/// In-memory aggregates per device: accepted readings, cumulative count and
/// latest reading.
///
/// Wrapped in `Arc` so it can be cheaply cloned and handed to the router as
/// state. Locking is two-level: the outer map lock is only held to find or
/// create a device's record, and each record has its own lock, so ingestion
/// for one device never waits on another.
#[derive(Clone, Default)]
pub struct AggregationStore {
    devices: Arc<RwLock<HashMap<String, SharedRecord>>>,
}

impl AggregationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a single reading. The duplicate check and every aggregate update
    /// happen under the device's write lock.
    pub async fn ingest(&self, device_id: &str, reading: Reading) -> IngestOutcome {
        let record = self.record_or_insert(device_id).await;
        let timestamp = reading.timestamp.clone();
        let outcome = record.write().await.apply(reading);
        log_refusal(device_id, &timestamp, outcome);
        outcome
    }

    /// Apply readings in arrival order under one acquisition of the device
    /// lock. A timestamp repeated within the batch is accepted only once.
    pub async fn ingest_batch<I>(&self, device_id: &str, readings: I) -> IngestSummary
    where
        I: IntoIterator<Item = Reading>,
    {
        let mut readings = readings.into_iter().peekable();
        let mut summary = IngestSummary::default();
        if readings.peek().is_none() {
            return summary;
        }

        let record = self.record_or_insert(device_id).await;
        let mut record = record.write().await;
        for reading in readings {
            let timestamp = reading.timestamp.clone();
            let outcome = record.apply(reading);
            log_refusal(device_id, &timestamp, outcome);
            summary.record(outcome);
        }
        summary
    }

    /// Timestamp of the newest accepted reading, or `None` for an unknown device.
    pub async fn latest_timestamp(&self, device_id: &str) -> Option<Timestamp> {
        let record = self.record(device_id).await?;
        let latest = record.read().await.latest().map(|r| r.timestamp.clone());
        latest
    }

    /// Sum of counts over all accepted readings, or `None` for an unknown device.
    pub async fn cumulative_count(&self, device_id: &str) -> Option<u64> {
        let record = self.record(device_id).await?;
        let record = record.read().await;
        (!record.is_empty()).then(|| record.cumulative_count())
    }

    /// Number of accepted readings, or `None` for an unknown device.
    pub async fn reading_count(&self, device_id: &str) -> Option<usize> {
        let record = self.record(device_id).await?;
        let record = record.read().await;
        (!record.is_empty()).then(|| record.len())
    }

    pub async fn has_device(&self, device_id: &str) -> bool {
        match self.record(device_id).await {
            Some(record) => !record.read().await.is_empty(),
            None => false,
        }
    }

    async fn record(&self, device_id: &str) -> Option<SharedRecord> {
        self.devices.read().await.get(device_id).cloned()
    }

    async fn record_or_insert(&self, device_id: &str) -> SharedRecord {
        if let Some(record) = self.record(device_id).await {
            return record;
        }
        self.devices
            .write()
            .await
            .entry(device_id.to_owned())
            .or_default()
            .clone()
    }
}

fn log_refusal(device_id: &str, timestamp: &Timestamp, outcome: IngestOutcome) {
    match outcome {
        IngestOutcome::Accepted => {}
        IngestOutcome::Duplicate => {
            debug!(device_id = %device_id, timestamp = %timestamp, "Skipping duplicate reading");
        }
        IngestOutcome::CountOverflow => {
            warn!(device_id = %device_id, timestamp = %timestamp, "Refusing reading: cumulative count would overflow");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: &str = "36d5658a-6908-479e-887e-a949ec199272";

    fn reading(timestamp: &str, count: u64) -> Reading {
        Reading::new(ts(timestamp), count)
    }

    fn ts(s: &str) -> Timestamp {
        Timestamp::parse(s).unwrap()
    }

    #[tokio::test]
    async fn empty_store_knows_no_devices() {
        let store = AggregationStore::new();
        assert!(!store.has_device("unknown").await);
        assert!(store.latest_timestamp("unknown").await.is_none());
        assert!(store.cumulative_count("unknown").await.is_none());
        assert!(store.reading_count("unknown").await.is_none());
    }

    #[tokio::test]
    async fn batch_accumulates_count_and_tracks_latest() {
        let store = AggregationStore::new();
        let summary = store
            .ingest_batch(
                DEVICE,
                [
                    reading("2021-09-29T16:08:15+01:00", 2),
                    reading("2021-09-29T16:09:15+01:00", 15),
                ],
            )
            .await;

        assert_eq!(summary, IngestSummary { accepted: 2, duplicates: 0, overflowed: 0 });
        assert_eq!(store.cumulative_count(DEVICE).await, Some(17));
        assert_eq!(
            store.latest_timestamp(DEVICE).await,
            Some(ts("2021-09-29T16:09:15+01:00"))
        );
        assert!(store.has_device(DEVICE).await);
    }

    #[tokio::test]
    async fn duplicate_within_batch_is_rejected() {
        let store = AggregationStore::new();
        let summary = store
            .ingest_batch(
                DEVICE,
                [
                    reading("2021-09-29T16:08:15+01:00", 2),
                    reading("2021-09-29T16:08:15+01:00", 2),
                ],
            )
            .await;

        assert_eq!(summary, IngestSummary { accepted: 1, duplicates: 1, overflowed: 0 });
        assert_eq!(store.cumulative_count(DEVICE).await, Some(2));
        assert_eq!(store.reading_count(DEVICE).await, Some(1));
    }

    #[tokio::test]
    async fn repeated_ingest_is_idempotent() {
        let store = AggregationStore::new();
        let r = reading("2021-09-29T16:08:15+01:00", 7);

        assert_eq!(store.ingest(DEVICE, r.clone()).await, IngestOutcome::Accepted);
        assert_eq!(store.ingest(DEVICE, r).await, IngestOutcome::Duplicate);
        assert_eq!(store.reading_count(DEVICE).await, Some(1));
        assert_eq!(store.cumulative_count(DEVICE).await, Some(7));
    }

    #[tokio::test]
    async fn later_batch_adds_to_existing_aggregates() {
        let store = AggregationStore::new();
        store
            .ingest_batch(
                DEVICE,
                [
                    reading("2021-09-29T16:08:15+01:00", 2),
                    reading("2021-09-29T16:09:15+01:00", 15),
                ],
            )
            .await;
        store
            .ingest_batch(DEVICE, [reading("2021-09-29T16:20:14+01:00", 5)])
            .await;

        assert_eq!(store.cumulative_count(DEVICE).await, Some(22));
        assert_eq!(store.reading_count(DEVICE).await, Some(3));
        assert_eq!(
            store.latest_timestamp(DEVICE).await,
            Some(ts("2021-09-29T16:20:14+01:00"))
        );
    }

    #[tokio::test]
    async fn latest_is_maximum_not_last_arrival() {
        let store = AggregationStore::new();
        let summary = store
            .ingest_batch(
                DEVICE,
                [
                    reading("2021-09-29T16:09:15+01:00", 1),
                    reading("2021-09-29T16:08:15+01:00", 1),
                ],
            )
            .await;

        assert_eq!(summary.accepted, 2);
        assert_eq!(
            store.latest_timestamp(DEVICE).await,
            Some(ts("2021-09-29T16:09:15+01:00"))
        );
    }

    #[tokio::test]
    async fn latest_timestamp_is_returned_as_submitted() {
        let store = AggregationStore::new();
        store
            .ingest_batch(
                DEVICE,
                [
                    reading("2021-09-29T15:08:15Z", 1),
                    reading("2021-09-29T16:09:15.000+01:00", 1),
                ],
            )
            .await;

        let latest = store.latest_timestamp(DEVICE).await.unwrap();
        assert_eq!(latest.as_str(), "2021-09-29T16:09:15.000+01:00");
    }

    #[tokio::test]
    async fn overflowing_reading_is_counted_separately() {
        let store = AggregationStore::new();
        let summary = store
            .ingest_batch(
                DEVICE,
                [
                    reading("2021-09-29T16:08:15Z", u64::MAX),
                    reading("2021-09-29T16:09:15Z", 1),
                ],
            )
            .await;

        assert_eq!(summary, IngestSummary { accepted: 1, duplicates: 0, overflowed: 1 });
        assert_eq!(store.cumulative_count(DEVICE).await, Some(u64::MAX));
        assert_eq!(store.reading_count(DEVICE).await, Some(1));
    }

    #[tokio::test]
    async fn empty_batch_does_not_register_device() {
        let store = AggregationStore::new();
        let summary = store.ingest_batch(DEVICE, Vec::new()).await;

        assert_eq!(summary, IngestSummary::default());
        assert!(!store.has_device(DEVICE).await);
    }

    #[tokio::test]
    async fn devices_are_separate_entries() {
        let store = AggregationStore::new();
        store.ingest("dev1", reading("2021-09-29T16:08:15Z", 3)).await;
        store.ingest("dev2", reading("2021-09-29T16:08:15Z", 4)).await;

        assert_eq!(store.cumulative_count("dev1").await, Some(3));
        assert_eq!(store.cumulative_count("dev2").await, Some(4));
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let store = AggregationStore::new();
        let clone = store.clone();

        store.ingest("dev1", reading("2021-09-29T16:08:15Z", 3)).await;

        assert_eq!(clone.cumulative_count("dev1").await, Some(3));
    }

    #[tokio::test]
    async fn separate_stores_are_isolated() {
        let a = AggregationStore::new();
        let b = AggregationStore::new();

        a.ingest("dev1", reading("2021-09-29T16:08:15Z", 3)).await;

        assert!(a.has_device("dev1").await);
        assert!(!b.has_device("dev1").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_distinct_timestamps_are_all_counted() {
        let store = AggregationStore::new();
        let base = ts("2021-09-29T00:00:00Z").instant();

        let handles: Vec<_> = (0..64u64)
            .map(|i| {
                let store = store.clone();
                let timestamp = Timestamp::from(base + chrono::Duration::seconds(i as i64));
                tokio::spawn(async move { store.ingest(DEVICE, Reading::new(timestamp, i)).await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), IngestOutcome::Accepted);
        }

        assert_eq!(store.reading_count(DEVICE).await, Some(64));
        assert_eq!(store.cumulative_count(DEVICE).await, Some((0..64u64).sum::<u64>()));
        assert_eq!(
            store.latest_timestamp(DEVICE).await,
            Some(Timestamp::from(base + chrono::Duration::seconds(63)))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_same_timestamp_is_accepted_once() {
        let store = AggregationStore::new();
        let r = reading("2021-09-29T16:08:15+01:00", 5);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let store = store.clone();
                let r = r.clone();
                tokio::spawn(async move { store.ingest(DEVICE, r).await })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() == IngestOutcome::Accepted {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 1);
        assert_eq!(store.reading_count(DEVICE).await, Some(1));
        assert_eq!(store.cumulative_count(DEVICE).await, Some(5));
    }
}
