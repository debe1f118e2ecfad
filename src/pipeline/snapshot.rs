//! Snapshot parsing and validation
//!
//! A snapshot is one collector payload for a single park at a single
//! observation time. Raw JSON is deserialized leniently into `RawSnapshot`
//! and then validated into a `Snapshot`; nothing reaches the store unless
//! validation passes.
//!
//! Logical input shape:
//! ```text
//! { timestamp, destination, destinationId?, park,
//!   data: { id, timezone?, liveData: [ { id, name, entityType, status?,
//!           lastUpdated?, queue?: { STANDBY?: { waitTime } }, forecast? } ] } }
//! ```

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::Deserialize;
use serde_json::Value;

/// Entity type that denotes the park itself rather than an attraction
pub const PARK_ENTITY_TYPE: &str = "PARK";

/// Status key used when a live entry carries no status
pub const UNKNOWN_STATUS: &str = "UNKNOWN";

/// Timezone recorded for a destination when the feed omits one
pub const DEFAULT_TIMEZONE: &str = "America/New_York";

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Payload is not valid JSON at all
    Json(String),
    /// A required field is absent, null or empty
    MissingField(&'static str),
    /// `data.liveData` is present but not an array
    LiveDataNotArray,
    /// A timestamp did not parse as ISO-8601 / RFC 3339
    InvalidTimestamp { field: String, value: String },
    /// A live entry is structurally malformed
    MalformedEntry { index: usize, reason: String },
    /// A standby wait is negative, fractional or not a number
    InvalidWaitTime { entity_id: String, value: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Json(e) => write!(f, "Invalid snapshot JSON: {}", e),
            ValidationError::MissingField(field) => {
                write!(f, "Invalid snapshot: missing required field '{}'", field)
            }
            ValidationError::LiveDataNotArray => {
                write!(f, "Invalid snapshot: 'data.liveData' must be an array")
            }
            ValidationError::InvalidTimestamp { field, value } => {
                write!(f, "Invalid timestamp in '{}': {}", field, value)
            }
            ValidationError::MalformedEntry { index, reason } => {
                write!(f, "Malformed liveData entry #{}: {}", index, reason)
            }
            ValidationError::InvalidWaitTime { entity_id, value } => {
                write!(f, "Invalid standby wait for {}: {}", entity_id, value)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        ValidationError::Json(err.to_string())
    }
}

/// Standby queue wait in minutes, or the explicit "not reported" state
///
/// Stored as `-1` in the `wait.stand_by` column; a reported wait of zero
/// stays distinct from a missing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandbyWait {
    Minutes(u32),
    NotReported,
}

impl StandbyWait {
    pub const SENTINEL: i64 = -1;

    pub fn as_db_value(self) -> i64 {
        match self {
            StandbyWait::Minutes(m) => i64::from(m),
            StandbyWait::NotReported => Self::SENTINEL,
        }
    }

    pub fn from_db_value(value: i64) -> Option<Self> {
        match value {
            Self::SENTINEL => Some(StandbyWait::NotReported),
            v if v >= 0 => u32::try_from(v).ok().map(StandbyWait::Minutes),
            _ => None,
        }
    }
}

impl ToSql for StandbyWait {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_db_value()))
    }
}

impl FromSql for StandbyWait {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = i64::column_result(value)?;
        StandbyWait::from_db_value(raw).ok_or(FromSqlError::OutOfRange(raw))
    }
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    timestamp: Option<String>,
    destination: Option<String>,
    #[serde(rename = "destinationId")]
    destination_id: Option<String>,
    park: Option<String>,
    data: Option<RawParkData>,
}

#[derive(Debug, Deserialize)]
struct RawParkData {
    id: Option<String>,
    timezone: Option<String>,
    #[serde(rename = "liveData")]
    live_data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawLiveEntry {
    id: String,
    name: String,
    #[serde(rename = "entityType")]
    entity_type: String,
    status: Option<String>,
    #[serde(rename = "lastUpdated")]
    last_updated: Option<String>,
    queue: Option<RawQueue>,
    forecast: Option<Value>,
    location: Option<RawLocation>,
}

#[derive(Debug, Deserialize)]
struct RawQueue {
    #[serde(rename = "STANDBY")]
    standby: Option<RawStandby>,
}

#[derive(Debug, Deserialize)]
struct RawStandby {
    #[serde(rename = "waitTime")]
    wait_time: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawLocation {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

/// One validated live-entity entry
#[derive(Debug, Clone, PartialEq)]
pub struct LiveEntry {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub status: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub standby: StandbyWait,
    /// Non-empty forecast sequence, kept verbatim
    pub forecast: Option<Value>,
    pub latitude: f64,
    pub longitude: f64,
    /// The entry exactly as received, stored as sample metadata
    pub raw: Value,
}

impl LiveEntry {
    /// True when the entry describes the park itself, not an attraction
    pub fn is_park(&self) -> bool {
        self.entity_type == PARK_ENTITY_TYPE
    }

    pub fn status_key(&self) -> &str {
        self.status.as_deref().unwrap_or(UNKNOWN_STATUS)
    }
}

/// A validated telemetry snapshot, ready for ingestion
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub observed_at: DateTime<Utc>,
    pub destination: String,
    /// Natural key for the destination (explicit id or the name)
    pub destination_oid: String,
    pub park_name: String,
    pub park_oid: String,
    pub timezone: Option<String>,
    pub entries: Vec<LiveEntry>,
}

impl Snapshot {
    /// Parse and validate a snapshot from collector JSON
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Validate an already-parsed JSON document
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let raw: RawSnapshot = serde_json::from_value(value)?;

        let destination = required(raw.destination, "destination")?;
        let park_name = required(raw.park, "park")?;
        let data = raw.data.ok_or(ValidationError::MissingField("data"))?;
        let park_oid = required(data.id, "data.id")?;

        let live_data = match data.live_data {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => return Err(ValidationError::MissingField("data.liveData")),
            Some(_) => return Err(ValidationError::LiveDataNotArray),
        };

        let timestamp = required(raw.timestamp, "timestamp")?;
        let observed_at = parse_timestamp("timestamp", &timestamp)?;

        let entries = live_data
            .into_iter()
            .enumerate()
            .map(|(index, item)| parse_entry(index, item))
            .collect::<Result<Vec<_>, _>>()?;

        let destination_oid = raw
            .destination_id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| destination.clone());

        Ok(Self {
            observed_at,
            destination,
            destination_oid,
            park_name,
            park_oid,
            timezone: data.timezone.filter(|tz| !tz.trim().is_empty()),
            entries,
        })
    }

    pub fn timezone_or_default(&self) -> &str {
        self.timezone.as_deref().unwrap_or(DEFAULT_TIMEZONE)
    }

    /// Entries that become wait samples (park self-entries excluded)
    pub fn attraction_entries(&self) -> impl Iterator<Item = &LiveEntry> {
        self.entries.iter().filter(|entry| !entry.is_park())
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    match value {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(ValidationError::MissingField(field)),
    }
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ValidationError::InvalidTimestamp {
            field: field.to_string(),
            value: value.to_string(),
        })
}

fn parse_entry(index: usize, item: Value) -> Result<LiveEntry, ValidationError> {
    let parsed: RawLiveEntry = serde_json::from_value(item.clone()).map_err(|e| {
        ValidationError::MalformedEntry {
            index,
            reason: e.to_string(),
        }
    })?;

    if parsed.id.trim().is_empty() {
        return Err(ValidationError::MalformedEntry {
            index,
            reason: "empty 'id'".to_string(),
        });
    }
    if parsed.entity_type.trim().is_empty() {
        return Err(ValidationError::MalformedEntry {
            index,
            reason: "empty 'entityType'".to_string(),
        });
    }

    let last_updated = parsed
        .last_updated
        .as_deref()
        .map(|ts| parse_timestamp(&format!("liveData[{}].lastUpdated", index), ts))
        .transpose()?;

    let wait_time = parsed
        .queue
        .and_then(|q| q.standby)
        .and_then(|s| s.wait_time);
    let standby = parse_standby(&parsed.id, wait_time)?;

    let forecast = match parsed.forecast {
        Some(Value::Array(points)) if !points.is_empty() => Some(Value::Array(points)),
        _ => None,
    };

    let (latitude, longitude) = parsed
        .location
        .map(|loc| (loc.latitude.unwrap_or(0.0), loc.longitude.unwrap_or(0.0)))
        .unwrap_or((0.0, 0.0));

    Ok(LiveEntry {
        id: parsed.id,
        name: parsed.name,
        entity_type: parsed.entity_type,
        status: parsed.status.filter(|s| !s.trim().is_empty()),
        last_updated,
        standby,
        forecast,
        latitude,
        longitude,
        raw: item,
    })
}

fn parse_standby(entity_id: &str, wait_time: Option<Value>) -> Result<StandbyWait, ValidationError> {
    let invalid = |value: &Value| ValidationError::InvalidWaitTime {
        entity_id: entity_id.to_string(),
        value: value.to_string(),
    };

    match wait_time {
        None | Some(Value::Null) => Ok(StandbyWait::NotReported),
        Some(Value::Number(n)) => {
            if let Some(minutes) = n.as_u64() {
                return u32::try_from(minutes)
                    .map(StandbyWait::Minutes)
                    .map_err(|_| invalid(&Value::Number(n.clone())));
            }
            match n.as_f64() {
                Some(f) if f >= 0.0 && f.fract() == 0.0 && f <= f64::from(u32::MAX) => {
                    Ok(StandbyWait::Minutes(f as u32))
                }
                _ => Err(invalid(&Value::Number(n))),
            }
        }
        Some(other) => Err(invalid(&other)),
    }
}
