use std::{
    cmp::Ordering,
    collections::HashSet,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use chrono::{DateTime, FixedOffset, ParseResult};

/// ISO-8601 forms tried after RFC 3339, e.g. the colon-less `+0100` offset.
const ISO_8601_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

/// A reading timestamp: the parsed instant plus the exact text it was
/// submitted as.
///
/// Equality, ordering and hashing use the instant only, so
/// `16:08:15+01:00` and `15:08:15Z` are the same timestamp. `Display` and
/// [`Timestamp::as_str`] give back the submitted text unchanged.
#[derive(Debug, Clone)]
pub struct Timestamp {
    instant: DateTime<FixedOffset>,
    raw: Arc<str>,
}

impl Timestamp {
    /// Accepts RFC 3339, then the ISO-8601 variants in `ISO_8601_FORMATS`.
    pub fn parse(raw: &str) -> ParseResult<Self> {
        let instant = DateTime::parse_from_rfc3339(raw).or_else(|err| {
            ISO_8601_FORMATS
                .iter()
                .find_map(|format| DateTime::parse_from_str(raw, format).ok())
                .ok_or(err)
        })?;
        Ok(Self {
            instant,
            raw: Arc::from(raw),
        })
    }

    pub fn instant(&self) -> DateTime<FixedOffset> {
        self.instant
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl From<DateTime<FixedOffset>> for Timestamp {
    fn from(instant: DateTime<FixedOffset>) -> Self {
        Self {
            instant,
            raw: Arc::from(instant.to_rfc3339()),
        }
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.instant == other.instant
    }
}

impl Eq for Timestamp {}

impl Hash for Timestamp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instant.hash(state);
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.instant.cmp(&other.instant)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One `(timestamp, count)` observation from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    pub timestamp: Timestamp,
    pub count: u64,
}

impl Reading {
    pub fn new(timestamp: Timestamp, count: u64) -> Self {
        Self { timestamp, count }
    }
}

/// Result of applying a single reading to a device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// A reading with the same timestamp was already stored; nothing changed.
    Duplicate,
    /// Adding the count would overflow the cumulative total; nothing changed.
    CountOverflow,
}

/// Tally of a batch ingestion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub accepted: usize,
    pub duplicates: usize,
    pub overflowed: usize,
}

impl IngestSummary {
    pub(crate) fn record(&mut self, outcome: IngestOutcome) {
        match outcome {
            IngestOutcome::Accepted => self.accepted += 1,
            IngestOutcome::Duplicate => self.duplicates += 1,
            IngestOutcome::CountOverflow => self.overflowed += 1,
        }
    }
}

/// Aggregates for one device.
///
/// `seen`, `cumulative_count` and `latest` are maintained incrementally by
/// [`DeviceRecord::apply`] and always agree with `readings`.
#[derive(Debug, Default)]
pub(crate) struct DeviceRecord {
    /// Accepted readings in arrival order.
    readings: Vec<Reading>,
    /// Timestamps of `readings`, for constant-time duplicate checks.
    seen: HashSet<Timestamp>,
    /// Exact sum of `readings[..].count`. A reading that would overflow it
    /// is refused with [`IngestOutcome::CountOverflow`].
    cumulative_count: u64,
    latest: Option<Reading>,
}

impl DeviceRecord {
    /// Dedup key is the timestamp alone: a later reading with the same
    /// timestamp and a different count is still a duplicate.
    pub(crate) fn apply(&mut self, reading: Reading) -> IngestOutcome {
        if self.seen.contains(&reading.timestamp) {
            return IngestOutcome::Duplicate;
        }
        let Some(total) = self.cumulative_count.checked_add(reading.count) else {
            return IngestOutcome::CountOverflow;
        };

        self.seen.insert(reading.timestamp.clone());
        self.cumulative_count = total;
        if self
            .latest
            .as_ref()
            .is_none_or(|latest| reading.timestamp > latest.timestamp)
        {
            self.latest = Some(reading.clone());
        }
        self.readings.push(reading);

        IngestOutcome::Accepted
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.readings.len()
    }

    pub(crate) fn cumulative_count(&self) -> u64 {
        self.cumulative_count
    }

    pub(crate) fn latest(&self) -> Option<&Reading> {
        self.latest.as_ref()
    }
}
