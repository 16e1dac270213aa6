use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifact::PredictionArtifact;
use crate::config::ServeConfig;
use crate::error::{Result, SocError};
use crate::features::FeatureInput;
use crate::range::{self, DrivingConditions, EnergyBreakdown};

/// Request body of the inference boundary; same fields as the model input.
pub type PredictionRequest = FeatureInput;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub predicted_soc: f64,
    pub predicted_range_km: f64,
    /// `prev_soc - predicted_soc`.
    pub soc_drop: f64,
    pub efficiency_score: u8,
    pub consumption_rate_kwh_per_km: f64,
    pub energy: EnergyBreakdown,
    pub tips: Vec<String>,
}

/// Predict SoC and derive range, drop and efficiency for one request.
pub fn predict_and_derive(
    artifact: &PredictionArtifact,
    request: &PredictionRequest,
    config: &ServeConfig,
) -> Result<PredictionResult> {
    let predicted_soc = artifact.predict(request, config.output_policy)?;
    Ok(derive_result(predicted_soc, request, config))
}

/// Same as [`predict_and_derive`] for an untyped JSON body, checked against the artifact schema.
pub fn predict_and_derive_json(
    artifact: &PredictionArtifact,
    body: &Value,
    config: &ServeConfig,
) -> Result<PredictionResult> {
    let record = body.as_object().ok_or_else(|| SocError::InvalidFeature {
        field: "<body>".into(),
        reason: "expected a JSON object".into(),
    })?;
    let request = artifact.schema.parse_record(record)?;
    predict_and_derive(artifact, &request, config)
}

pub fn derive_result(predicted_soc: f64, request: &PredictionRequest, config: &ServeConfig) -> PredictionResult {
    let conditions = DrivingConditions::from_input(request);
    let estimate = range::derive(
        config.weather_penalty,
        predicted_soc,
        config.battery_capacity_kwh,
        &conditions,
    );
    PredictionResult {
        predicted_soc,
        predicted_range_km: estimate.range_km,
        soc_drop: request.prev_soc - predicted_soc,
        efficiency_score: estimate.efficiency_score,
        consumption_rate_kwh_per_km: estimate.rate_kwh_per_km,
        energy: estimate.energy,
        tips: conditions.advice().into_iter().map(str::to_string).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::{Terrain, Weather};

    #[test]
    fn derived_fields_follow_heuristics() {
        let request = PredictionRequest {
            speed: 110.0,
            acceleration: 4.0,
            braking: 4.0,
            terrain: "Hilly".into(),
            weather: "Hot".into(),
            prev_soc: 85.0,
        };
        let result = derive_result(80.0, &request, &ServeConfig::default());
        assert_eq!(result.soc_drop, 5.0);
        assert_eq!(result.efficiency_score, 55);
        assert_eq!(result.consumption_rate_kwh_per_km, 0.18 * 1.2 * 1.1);
        assert_eq!(result.predicted_range_km, range::range_km(80.0, 40.0, 0.18 * 1.2 * 1.1));
        assert_eq!(result.tips.len(), 5);

        let calm = PredictionRequest {
            speed: 60.0,
            acceleration: 1.0,
            braking: 1.0,
            terrain: "Flat".into(),
            weather: "Normal".into(),
            prev_soc: 85.0,
        };
        let result = derive_result(80.0, &calm, &ServeConfig::default());
        assert_eq!(result.tips, vec![range::GOOD_CONDITIONS.to_string()]);
    }

    #[test]
    fn unknown_labels_map_to_unrecognized() {
        let request = PredictionRequest {
            speed: 60.0,
            acceleration: 1.0,
            braking: 1.0,
            terrain: "flat".into(),
            weather: "Clear".into(),
            prev_soc: 70.0,
        };
        let c = DrivingConditions::from_input(&request);
        assert_eq!(c.terrain, Terrain::Unrecognized);
        assert_eq!(c.weather, Weather::Unrecognized);
    }
}
