use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::errors::ApiError;
use crate::store::{Reading, Timestamp};

/// Request body for `POST /api/v1/devices`.
///
/// Every field is optional at the serde level so that missing values surface
/// as a 400 from [`IngestReadingsRequest::validate`] rather than a 422.
#[derive(Debug, Deserialize, ToSchema)]
pub struct IngestReadingsRequest {
    /// Device identifier.
    pub id: Option<String>,
    pub readings: Option<Vec<ReadingDto>>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReadingDto {
    /// ISO-8601 instant, e.g. `2021-09-29T16:08:15+01:00` or
    /// `2021-09-29T16:08:15+0100`.
    pub timestamp: Option<String>,
    pub count: Option<u64>,
}

impl IngestReadingsRequest {
    /// Checks that `id` is non-empty, `readings` is non-empty, and every
    /// reading carries a parseable timestamp and a count.
    pub fn validate(self) -> Result<(String, Vec<Reading>), ApiError> {
        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or(ApiError::InvalidRequest)?;
        let readings = self
            .readings
            .filter(|r| !r.is_empty())
            .ok_or(ApiError::InvalidRequest)?;

        let readings = readings
            .into_iter()
            .map(ReadingDto::into_reading)
            .collect::<Result<Vec<_>, _>>()?;

        Ok((id, readings))
    }
}

impl ReadingDto {
    fn into_reading(self) -> Result<Reading, ApiError> {
        let (Some(timestamp), Some(count)) = (self.timestamp, self.count) else {
            return Err(ApiError::InvalidRequest);
        };
        let timestamp = Timestamp::parse(&timestamp).map_err(|_| ApiError::InvalidRequest)?;
        Ok(Reading::new(timestamp, count))
    }
}

/// Response for `GET /api/v1/devices/{id}/latest`.
#[derive(Debug, Serialize, ToSchema)]
pub struct LatestTimestampResponse {
    /// The newest reading's timestamp, exactly as it was submitted.
    pub latest_timestamp: String,
}

/// Response for `GET /api/v1/devices/{id}/cumulative`.
#[derive(Debug, Serialize, ToSchema)]
pub struct CumulativeCountResponse {
    pub cumulative_count: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}
