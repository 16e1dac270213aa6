// rule-based range and efficiency numbers. Independent of the model, and the only
// place these rules live; dashboards, evaluation and the CLI all call into here.

use serde::{Deserialize, Serialize};

use crate::features::FeatureInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terrain {
    Flat,
    Hilly,
    /// Any label outside the declared domain; carries no adjustment.
    Unrecognized,
}

impl Terrain {
    pub fn from_label(label: &str) -> Self {
        match label {
            "Flat" => Terrain::Flat,
            "Hilly" => Terrain::Hilly,
            _ => Terrain::Unrecognized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Weather {
    Normal,
    Hot,
    Cold,
    Rainy,
    /// Any label outside the declared domain; carries no adjustment.
    Unrecognized,
}

impl Weather {
    pub fn from_label(label: &str) -> Self {
        match label {
            "Normal" => Weather::Normal,
            "Hot" => Weather::Hot,
            "Cold" => Weather::Cold,
            "Rainy" => Weather::Rainy,
            _ => Weather::Unrecognized,
        }
    }
}

/// Which weather conditions raise the consumption rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherPenalty {
    /// Hot, Cold and Rainy.
    #[default]
    AllAdverse,
    /// Hot only; reproduces the older prediction endpoint.
    HotOnly,
}

impl WeatherPenalty {
    pub fn applies(self, weather: Weather) -> bool {
        match self {
            WeatherPenalty::AllAdverse => is_adverse(weather),
            WeatherPenalty::HotOnly => weather == Weather::Hot,
        }
    }
}

fn is_adverse(weather: Weather) -> bool {
    matches!(weather, Weather::Hot | Weather::Cold | Weather::Rainy)
}

pub const SPEED_LOW_KMH: f64 = 50.0;
pub const SPEED_HIGH_KMH: f64 = 80.0;

/// Energy use in kWh/km under the default weather policy.
pub fn consumption_rate(speed: f64, terrain: Terrain, weather: Weather) -> f64 {
    consumption_rate_with(WeatherPenalty::AllAdverse, speed, terrain, weather)
}

pub fn consumption_rate_with(policy: WeatherPenalty, speed: f64, terrain: Terrain, weather: Weather) -> f64 {
    let mut rate = if speed <= SPEED_LOW_KMH {
        0.12
    } else if speed > SPEED_HIGH_KMH {
        0.18
    } else {
        0.15
    };
    if terrain == Terrain::Hilly {
        rate *= 1.2;
    }
    if policy.applies(weather) {
        rate *= 1.1;
    }
    rate
}

/// Remaining distance for `predicted_soc` percent of `battery_capacity_kwh` at `rate` kWh/km.
pub fn range_km(predicted_soc: f64, battery_capacity_kwh: f64, rate: f64) -> f64 {
    (predicted_soc / 100.0 * battery_capacity_kwh) / rate
}

/// Driving-style score in `[0, 100]`, starting from 100 and subtracting fixed penalties.
pub fn efficiency_score(speed: f64, acceleration: f64, braking: f64, terrain: Terrain, weather: Weather) -> u8 {
    let mut score: i32 = 100;
    if speed > 100.0 {
        score -= 15;
    } else if speed > 80.0 {
        score -= 10;
    }
    if speed < 30.0 {
        score -= 5;
    }
    if acceleration > 3.0 {
        score -= 10;
    }
    if braking > 3.0 {
        score -= 10;
    }
    if terrain == Terrain::Hilly {
        score -= 5;
    }
    if is_adverse(weather) {
        score -= 5;
    }
    score.clamp(0, 100) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyBreakdown {
    pub remaining_kwh: f64,
    pub used_kwh: f64,
}

pub fn energy_breakdown(predicted_soc: f64, battery_capacity_kwh: f64) -> EnergyBreakdown {
    let remaining_kwh = predicted_soc / 100.0 * battery_capacity_kwh;
    EnergyBreakdown {
        remaining_kwh,
        used_kwh: battery_capacity_kwh - remaining_kwh,
    }
}

/// Consumption rate at each of `speeds`, for plotting speed against energy use.
pub fn consumption_curve(
    policy: WeatherPenalty,
    terrain: Terrain,
    weather: Weather,
    speeds: impl IntoIterator<Item = f64>,
) -> Vec<(f64, f64)> {
    speeds
        .into_iter()
        .map(|s| (s, consumption_rate_with(policy, s, terrain, weather)))
        .collect()
}

/// 20 to 120 km/h in 10 km/h steps.
pub fn reference_speeds() -> impl Iterator<Item = f64> {
    (20..=120).step_by(10).map(f64::from)
}

/// Shown instead of tips when nothing in the situation costs range.
pub const GOOD_CONDITIONS: &str = "Great conditions for optimal range!";

pub fn driving_tips(speed: f64, acceleration: f64, braking: f64, terrain: Terrain, weather: Weather) -> Vec<&'static str> {
    let mut tips = Vec::new();
    if speed > 100.0 {
        tips.push("Reduce your speed for better efficiency.");
    }
    if acceleration > 3.0 {
        tips.push("Avoid harsh acceleration.");
    }
    if braking > 3.0 {
        tips.push("Use smooth braking to conserve energy.");
    }
    if terrain == Terrain::Hilly {
        tips.push("Avoid hilly roads when possible.");
    }
    if is_adverse(weather) {
        tips.push("Adjust AC/heater wisely.");
    }
    tips
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeEstimate {
    pub rate_kwh_per_km: f64,
    pub range_km: f64,
    pub efficiency_score: u8,
    pub energy: EnergyBreakdown,
}

/// The driving situation the heuristics are evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrivingConditions {
    pub speed: f64,
    pub acceleration: f64,
    pub braking: f64,
    pub terrain: Terrain,
    pub weather: Weather,
}

impl DrivingConditions {
    pub fn from_input(input: &FeatureInput) -> Self {
        DrivingConditions {
            speed: input.speed,
            acceleration: input.acceleration,
            braking: input.braking,
            terrain: Terrain::from_label(&input.terrain),
            weather: Weather::from_label(&input.weather),
        }
    }

    pub fn tips(&self) -> Vec<&'static str> {
        driving_tips(self.speed, self.acceleration, self.braking, self.terrain, self.weather)
    }

    /// Tips, or [`GOOD_CONDITIONS`] alone when there are none.
    pub fn advice(&self) -> Vec<&'static str> {
        let tips = self.tips();
        if tips.is_empty() {
            vec![GOOD_CONDITIONS]
        } else {
            tips
        }
    }
}

/// All derived metrics for one driving situation.
pub fn derive(
    policy: WeatherPenalty,
    predicted_soc: f64,
    battery_capacity_kwh: f64,
    conditions: &DrivingConditions,
) -> RangeEstimate {
    let c = conditions;
    let rate = consumption_rate_with(policy, c.speed, c.terrain, c.weather);
    RangeEstimate {
        rate_kwh_per_km: rate,
        range_km: range_km(predicted_soc, battery_capacity_kwh, rate),
        efficiency_score: efficiency_score(c.speed, c.acceleration, c.braking, c.terrain, c.weather),
        energy: energy_breakdown(predicted_soc, battery_capacity_kwh),
    }
}
