// lag features plus the feature schema that training and inference both check against

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::data::{self, TelemetryRecord};
use crate::error::{Result, SocError};

/// A current record paired with the lag values of the same vehicle's previous record.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub vehicle_id: String,
    pub timestamp: NaiveDateTime,
    pub prev_timestamp: NaiveDateTime,
    pub speed: f64,
    pub acceleration: f64,
    pub braking: f64,
    pub terrain: String,
    pub weather: String,
    pub prev_soc: f64,
    pub prev_speed: f64,
    pub prev_acceleration: f64,
    /// Training label: the SoC observed on the current record.
    pub soc: f64,
}

impl FeatureRow {
    pub fn input(&self) -> FeatureInput {
        FeatureInput {
            speed: self.speed,
            acceleration: self.acceleration,
            braking: self.braking,
            terrain: self.terrain.clone(),
            weather: self.weather.clone(),
            prev_soc: self.prev_soc,
        }
    }
}

/// Build one row per record that has a predecessor for the same vehicle.
///
/// Records are taken in (vehicle, time) order whatever order the slice is in;
/// each vehicle's first record yields nothing.
pub fn build_feature_rows(records: &[TelemetryRecord]) -> Vec<FeatureRow> {
    data::ordered(records)
        .windows(2)
        .filter(|pair| pair[0].vehicle_id == pair[1].vehicle_id)
        .map(|pair| {
            let (prev, cur) = (pair[0], pair[1]);
            FeatureRow {
                vehicle_id: cur.vehicle_id.clone(),
                timestamp: cur.timestamp,
                prev_timestamp: prev.timestamp,
                speed: cur.speed,
                acceleration: cur.acceleration,
                braking: cur.braking,
                terrain: cur.terrain.clone(),
                weather: cur.weather.clone(),
                prev_soc: prev.soc,
                prev_speed: prev.speed,
                prev_acceleration: prev.acceleration,
                soc: cur.soc,
            }
        })
        .collect()
}

/// The model's input record. Field names are the wire names of the inference boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureInput {
    pub speed: f64,
    pub acceleration: f64,
    pub braking: f64,
    pub terrain: String,
    pub weather: String,
    pub prev_soc: f64,
}

impl FeatureInput {
    pub fn numeric(&self, name: &str) -> Option<f64> {
        match name {
            "speed" => Some(self.speed),
            "acceleration" => Some(self.acceleration),
            "braking" => Some(self.braking),
            "prev_soc" => Some(self.prev_soc),
            _ => None,
        }
    }

    pub fn categorical(&self, name: &str) -> Option<&str> {
        match name {
            "terrain" => Some(&self.terrain),
            "weather" => Some(&self.weather),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumericField {
    pub name: String,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoricalField {
    pub name: String,
    /// Declared domain. Values outside it are still accepted and encode to zeros.
    pub domain: Vec<String>,
}

/// Named, typed input contract. Part of the artifact's versioned identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub numeric: Vec<NumericField>,
    pub categorical: Vec<CategoricalField>,
}

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl FeatureSchema {
    /// Schema of the reduced SoC model: four numeric inputs and two categorical ones.
    pub fn current() -> Self {
        let numeric = [
            ("speed", "km/h"),
            ("prev_soc", "%"),
            ("braking", "m/s²"),
            ("acceleration", "m/s²"),
        ]
        .iter()
        .map(|(name, unit)| NumericField {
            name: name.to_string(),
            unit: unit.to_string(),
        })
        .collect();

        FeatureSchema {
            version: FEATURE_SCHEMA_VERSION,
            numeric,
            categorical: vec![
                CategoricalField {
                    name: "terrain".into(),
                    domain: owned(&["Flat", "Hilly"]),
                },
                CategoricalField {
                    name: "weather".into(),
                    domain: owned(&["Normal", "Hot", "Cold", "Rainy"]),
                },
            ],
        }
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.numeric
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.categorical.iter().map(|f| f.name.as_str()))
            .collect()
    }

    /// Check a loosely-typed record against the schema and convert it.
    ///
    /// Extra, missing or renamed keys produce [`SocError::SchemaMismatch`];
    /// a key holding the wrong JSON type produces [`SocError::InvalidFeature`].
    pub fn parse_record(&self, record: &Map<String, Value>) -> Result<FeatureInput> {
        let names = self.field_names();
        let mut missing: Vec<String> = names
            .iter()
            .filter(|n| !record.contains_key(**n))
            .map(|n| n.to_string())
            .collect();
        let mut unexpected: Vec<String> = record
            .keys()
            .filter(|k| !names.contains(&k.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            missing.sort();
            unexpected.sort();
            return Err(SocError::SchemaMismatch { missing, unexpected });
        }

        let num = |field: &str| -> Result<f64> {
            record
                .get(field)
                .and_then(Value::as_f64)
                .filter(|v| v.is_finite())
                .ok_or_else(|| SocError::InvalidFeature {
                    field: field.to_string(),
                    reason: "expected a finite number".into(),
                })
        };
        let label = |field: &str| -> Result<String> {
            record
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| SocError::InvalidFeature {
                    field: field.to_string(),
                    reason: "expected a string label".into(),
                })
        };

        Ok(FeatureInput {
            speed: num("speed")?,
            acceleration: num("acceleration")?,
            braking: num("braking")?,
            terrain: label("terrain")?,
            weather: label("weather")?,
            prev_soc: num("prev_soc")?,
        })
    }

    /// Confirm every declared field is one [`FeatureInput`] can supply.
    pub fn check_supported(&self) -> Result<()> {
        let blank = FeatureInput {
            speed: 0.0,
            acceleration: 0.0,
            braking: 0.0,
            terrain: String::new(),
            weather: String::new(),
            prev_soc: 0.0,
        };
        let unsupported: Vec<String> = self
            .numeric
            .iter()
            .filter(|f| blank.numeric(&f.name).is_none())
            .map(|f| f.name.clone())
            .chain(
                self.categorical
                    .iter()
                    .filter(|f| blank.categorical(&f.name).is_none())
                    .map(|f| f.name.clone()),
            )
            .collect();
        if unsupported.is_empty() {
            Ok(())
        } else {
            Err(SocError::SchemaMismatch {
                missing: Vec::new(),
                unexpected: unsupported,
            })
        }
    }
}
