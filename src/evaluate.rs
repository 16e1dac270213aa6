use chrono::NaiveDateTime;
use csv::Writer;
use ndarray::Array1;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

use crate::artifact::PredictionArtifact;
use crate::config::ServeConfig;
use crate::data::{self, LoadReport, TelemetryLoader, TelemetryRecord};
use crate::error::Result;
use crate::features::build_feature_rows;
use crate::model::{mean_absolute_error, root_mean_squared_error};
use crate::serve::derive_result;

pub const LOW_BATTERY_SOC: f64 = 20.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationRow {
    #[serde(rename = "Vehicle_ID")]
    pub vehicle_id: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: NaiveDateTime,
    #[serde(rename = "Actual SoC (%)")]
    pub actual_soc: f64,
    #[serde(rename = "Predicted SoC (%)")]
    pub predicted_soc: f64,
    #[serde(rename = "Predicted Range (Km)")]
    pub predicted_range_km: f64,
    #[serde(rename = "SoC Drop (%)")]
    pub soc_drop: f64,
    #[serde(rename = "Driving Efficiency (%)")]
    pub efficiency_score: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationSummary {
    pub rows: usize,
    pub mae: f64,
    pub rmse: f64,
    /// Telemetry records, first ones included, whose observed SoC is below [`LOW_BATTERY_SOC`].
    pub low_battery_rows: usize,
    pub vehicles: Vec<TripSummary>,
    pub load: LoadSummary,
}

/// Per-vehicle trip view: SoC at both ends, distance and low-battery alerts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TripSummary {
    pub vehicle_id: String,
    pub initial_soc: f64,
    pub final_soc: f64,
    /// Sum of the `Distance (Km)` column; 0 when the export has none.
    pub distance_km: f64,
    pub low_battery_alerts: usize,
}

pub fn trip_summaries(records: &[TelemetryRecord]) -> Vec<TripSummary> {
    let mut trips: Vec<TripSummary> = Vec::new();
    for rec in data::ordered(records) {
        let low = usize::from(rec.soc < LOW_BATTERY_SOC);
        let distance = rec.distance_km.unwrap_or(0.0);
        match trips.last_mut() {
            Some(trip) if trip.vehicle_id == rec.vehicle_id => {
                trip.final_soc = rec.soc;
                trip.distance_km += distance;
                trip.low_battery_alerts += low;
            }
            _ => trips.push(TripSummary {
                vehicle_id: rec.vehicle_id.clone(),
                initial_soc: rec.soc,
                final_soc: rec.soc,
                distance_km: distance,
                low_battery_alerts: low,
            }),
        }
    }
    trips
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub rows_read: usize,
    pub dropped: usize,
}

impl From<&LoadReport> for LoadSummary {
    fn from(report: &LoadReport) -> Self {
        LoadSummary {
            rows_read: report.rows_read,
            dropped: report.dropped(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub rows: Vec<EvaluationRow>,
    pub summary: EvaluationSummary,
}

pub fn evaluate_csv(artifact: &PredictionArtifact, path: &Path, config: &ServeConfig) -> Result<Evaluation> {
    let loader = TelemetryLoader::from_path(path)?;
    evaluate_records(artifact, &loader.records, &loader.report, config)
}

/// Predict every lag row of `records` and compare with the observed SoC.
pub fn evaluate_records(
    artifact: &PredictionArtifact,
    records: &[TelemetryRecord],
    report: &LoadReport,
    config: &ServeConfig,
) -> Result<Evaluation> {
    let feature_rows = build_feature_rows(records);
    let mut rows = Vec::with_capacity(feature_rows.len());
    for fr in &feature_rows {
        let input = fr.input();
        let predicted_soc = artifact.predict(&input, config.output_policy)?;
        let derived = derive_result(predicted_soc, &input, config);
        rows.push(EvaluationRow {
            vehicle_id: fr.vehicle_id.clone(),
            timestamp: fr.timestamp,
            actual_soc: fr.soc,
            predicted_soc,
            predicted_range_km: derived.predicted_range_km,
            soc_drop: derived.soc_drop,
            efficiency_score: derived.efficiency_score,
        });
    }

    let actual: Array1<f64> = rows.iter().map(|r| r.actual_soc).collect();
    let predicted: Array1<f64> = rows.iter().map(|r| r.predicted_soc).collect();
    let vehicles = trip_summaries(records);
    let summary = EvaluationSummary {
        rows: rows.len(),
        mae: mean_absolute_error(&predicted, &actual),
        rmse: root_mean_squared_error(&predicted, &actual),
        low_battery_rows: vehicles.iter().map(|v| v.low_battery_alerts).sum(),
        vehicles,
        load: LoadSummary::from(report),
    };
    for trip in summary.vehicles.iter().filter(|t| t.low_battery_alerts > 0) {
        tracing::warn!(vehicle = %trip.vehicle_id, alerts = trip.low_battery_alerts, "low battery (SoC < 20%)");
    }
    tracing::info!(
        rows = summary.rows,
        mae = summary.mae,
        rmse = summary.rmse,
        low_battery = summary.low_battery_rows,
        "evaluation finished"
    );

    Ok(Evaluation { rows, summary })
}

pub fn write_rows<W: Write>(rows: &[EvaluationRow], out: W) -> Result<()> {
    let mut writer = Writer::from_writer(out);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::parse_timestamp;

    fn rec(vehicle: &str, minute: u32, soc: f64, distance_km: Option<f64>) -> TelemetryRecord {
        TelemetryRecord {
            vehicle_id: vehicle.into(),
            timestamp: parse_timestamp(&format!("2024-01-01 10:{minute:02}:00")).unwrap(),
            speed: 50.0,
            acceleration: 1.0,
            braking: 1.0,
            terrain: "Flat".into(),
            weather: "Normal".into(),
            soc,
            distance_km,
            hour: 10,
            minute,
            day_of_week: 0,
            source_index: 0,
        }
    }

    #[test]
    fn trip_summary_counts_first_records_too() {
        // EV2 starts below 20%, and that first record has no lag row
        let records = vec![
            rec("EV2", 0, 15.0, Some(2.0)),
            rec("EV1", 1, 60.0, Some(1.5)),
            rec("EV1", 0, 62.0, None),
            rec("EV2", 1, 14.0, Some(2.5)),
            rec("EV1", 2, 58.0, Some(1.0)),
        ];
        let trips = trip_summaries(&records);
        assert_eq!(trips.len(), 2);

        assert_eq!(trips[0].vehicle_id, "EV1");
        assert_eq!((trips[0].initial_soc, trips[0].final_soc), (62.0, 58.0));
        assert_eq!(trips[0].distance_km, 2.5);
        assert_eq!(trips[0].low_battery_alerts, 0);

        assert_eq!(trips[1].vehicle_id, "EV2");
        assert_eq!((trips[1].initial_soc, trips[1].final_soc), (15.0, 14.0));
        assert_eq!(trips[1].distance_km, 4.5);
        assert_eq!(trips[1].low_battery_alerts, 2);
    }

    #[test]
    fn writes_download_columns() {
        let rows = vec![EvaluationRow {
            vehicle_id: "EV1".into(),
            timestamp: parse_timestamp("2024-01-01 10:00:00").unwrap(),
            actual_soc: 79.5,
            predicted_soc: 80.0,
            predicted_range_km: 266.5,
            soc_drop: 5.0,
            efficiency_score: 90,
        }];
        let mut buf = Vec::new();
        write_rows(&rows, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "Vehicle_ID,Timestamp,Actual SoC (%),Predicted SoC (%),Predicted Range (Km),SoC Drop (%),Driving Efficiency (%)"
        );
        assert!(lines.next().unwrap().starts_with("EV1,2024-01-01T10:00:00,79.5,80.0,"));
    }
}
