use chrono::{DateTime, Datelike, NaiveDateTime, Timelike};
use csv::ReaderBuilder;
use serde::Deserialize;
use std::cmp::Ordering;
use std::io::Read;
use std::path::Path;

use crate::error::Result;

// column names of the fleet telemetry export; lowercase aliases accept hand-written files
#[derive(Debug, Deserialize)]
struct RawTelemetry {
    #[serde(rename = "Vehicle_ID", alias = "vehicle_id", default)]
    vehicle_id: Option<String>,
    #[serde(rename = "Timestamp", alias = "timestamp", default)]
    timestamp: Option<String>,
    #[serde(rename = "Speed (Km/h)", alias = "speed", default, deserialize_with = "csv::invalid_option")]
    speed: Option<f64>,
    #[serde(rename = "Acceleration (m/s²)", alias = "acceleration", default, deserialize_with = "csv::invalid_option")]
    acceleration: Option<f64>,
    #[serde(rename = "Braking (m/s²)", alias = "braking", default, deserialize_with = "csv::invalid_option")]
    braking: Option<f64>,
    #[serde(rename = "Terrain", alias = "terrain", default)]
    terrain: Option<String>,
    #[serde(rename = "Weather", alias = "weather", default)]
    weather: Option<String>,
    #[serde(rename = "SoC (%)", alias = "soc", default, deserialize_with = "csv::invalid_option")]
    soc: Option<f64>,
    // optional, older exports don't have it
    #[serde(rename = "Distance (Km)", alias = "distance", default, deserialize_with = "csv::invalid_option")]
    distance: Option<f64>,
}

/// One validated telemetry sample. Treated as immutable input by everything downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub vehicle_id: String,
    pub timestamp: NaiveDateTime,
    pub speed: f64,
    pub acceleration: f64,
    pub braking: f64,
    pub terrain: String,
    pub weather: String,
    pub soc: f64,
    /// Distance driven since the previous sample, when the export carries it.
    pub distance_km: Option<f64>,
    pub hour: u32,
    pub minute: u32,
    /// Monday = 0.
    pub day_of_week: u32,
    /// Position of the row in the source, used as the tie-break for equal timestamps.
    pub source_index: usize,
}

/// Row accounting for a single load. Dropped rows never abort the load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub rows_read: usize,
    pub accepted: usize,
    pub dropped_missing: usize,
    pub dropped_timestamp: usize,
    pub dropped_invalid: usize,
}

impl LoadReport {
    pub fn dropped(&self) -> usize {
        self.dropped_missing + self.dropped_timestamp + self.dropped_invalid
    }
}

const TIMESTAMP_FORMATS: [&str; 5] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Parse a telemetry timestamp. RFC 3339 values with an offset are normalized to UTC.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Reads raw telemetry rows into validated records ordered by (vehicle, time).
///
/// Rows with a missing field, an unparseable timestamp or a physically
/// impossible value are dropped and counted; the rest of the batch is kept.
/// Records sharing a vehicle and timestamp keep their source order (stable sort).
pub struct TelemetryLoader {
    pub records: Vec<TelemetryRecord>,
    pub report: LoadReport,
}

impl TelemetryLoader {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        Ok(Self::collect(reader))
    }

    pub fn from_reader<R: Read>(rdr: R) -> Self {
        let reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(rdr);
        Self::collect(reader)
    }

    fn collect<R: Read>(mut reader: csv::Reader<R>) -> Self {
        let mut report = LoadReport::default();
        let mut records = Vec::new();

        for (source_index, res) in reader.deserialize::<RawTelemetry>().enumerate() {
            report.rows_read += 1;
            let raw = match res {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::debug!(row = source_index, %err, "unreadable telemetry row");
                    report.dropped_invalid += 1;
                    continue;
                }
            };
            match validate(raw, source_index) {
                Ok(record) => records.push(record),
                Err(Rejection::Missing) => report.dropped_missing += 1,
                Err(Rejection::Timestamp) => report.dropped_timestamp += 1,
                Err(Rejection::Invalid) => report.dropped_invalid += 1,
            }
        }

        records.sort_by(by_vehicle_then_time);
        report.accepted = records.len();

        if report.dropped() > 0 {
            tracing::warn!(
                dropped = report.dropped(),
                missing = report.dropped_missing,
                timestamp = report.dropped_timestamp,
                invalid = report.dropped_invalid,
                "dropped telemetry rows"
            );
        }
        tracing::info!(accepted = report.accepted, rows = report.rows_read, "telemetry loaded");

        TelemetryLoader { records, report }
    }
}

fn by_vehicle_then_time(a: &TelemetryRecord, b: &TelemetryRecord) -> Ordering {
    a.vehicle_id
        .cmp(&b.vehicle_id)
        .then_with(|| a.timestamp.cmp(&b.timestamp))
}

/// Records in (vehicle, time) order. Stable, so a slice that is already
/// ordered comes back unchanged.
pub fn ordered(records: &[TelemetryRecord]) -> Vec<&TelemetryRecord> {
    let mut out: Vec<&TelemetryRecord> = records.iter().collect();
    out.sort_by(|a, b| by_vehicle_then_time(a, b));
    out
}

enum Rejection {
    Missing,
    Timestamp,
    Invalid,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn validate(raw: RawTelemetry, source_index: usize) -> std::result::Result<TelemetryRecord, Rejection> {
    let (
        Some(vehicle_id),
        Some(timestamp),
        Some(speed),
        Some(acceleration),
        Some(braking),
        Some(terrain),
        Some(weather),
        Some(soc),
    ) = (
        non_empty(raw.vehicle_id),
        non_empty(raw.timestamp),
        raw.speed,
        raw.acceleration,
        raw.braking,
        non_empty(raw.terrain),
        non_empty(raw.weather),
        raw.soc,
    )
    else {
        return Err(Rejection::Missing);
    };

    let timestamp = parse_timestamp(&timestamp).ok_or(Rejection::Timestamp)?;

    let finite = [speed, acceleration, braking, soc].iter().all(|v| v.is_finite());
    if !finite || speed < 0.0 || acceleration < 0.0 || braking < 0.0 || !(0.0..=100.0).contains(&soc) {
        return Err(Rejection::Invalid);
    }
    if raw.distance.is_some_and(|d| !d.is_finite() || d < 0.0) {
        return Err(Rejection::Invalid);
    }

    Ok(TelemetryRecord {
        vehicle_id,
        hour: timestamp.hour(),
        minute: timestamp.minute(),
        day_of_week: timestamp.weekday().num_days_from_monday(),
        timestamp,
        speed,
        acceleration,
        braking,
        terrain,
        weather,
        soc,
        distance_km: raw.distance,
        source_index,
    })
}
