#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use soc_range::artifact::PredictionArtifact;
use soc_range::forest::MaxFeatures;
use soc_range::train::train_from_csv;
use soc_range::{CancelToken, FeatureInput, HyperparameterGrid, TrainingConfig};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

pub const HEADER: &str = "Vehicle_ID,Timestamp,Speed (Km/h),Acceleration (m/s²),Braking (m/s²),Terrain,Weather,SoC (%),Distance (Km)";

pub fn synthetic_fleet(seed: u64) -> NamedTempFile {
    let mut rng = StdRng::seed_from_u64(seed);
    let terrains = ["Flat", "Hilly"];
    let weathers = ["Normal", "Hot", "Cold", "Rainy"];
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{HEADER}").unwrap();

    for vehicle in 0..6 {
        let mut soc: f64 = rng.gen_range(70.0..100.0);
        for step in 0..35 {
            let speed: f64 = rng.gen_range(10.0..130.0);
            let acceleration: f64 = rng.gen_range(0.0..5.0);
            let braking: f64 = rng.gen_range(0.0..5.0);
            let terrain = terrains[rng.gen_range(0..2)];
            let weather = weathers[rng.gen_range(0..4)];
            let hilly = if terrain == "Hilly" { 0.4 } else { 0.0 };
            soc = (soc - 0.2 - speed * 0.01 - hilly).max(0.0);
            // rows are written out of order to exercise sorting
            let minute = (step * 8) % 35;
            writeln!(
                file,
                "EV{vehicle},2024-03-0{} 08:{:02}:00,{speed:.2},{acceleration:.2},{braking:.2},{terrain},{weather},{soc:.3},0.5",
                1 + vehicle % 3,
                minute
            )
            .unwrap();
        }
    }
    // one malformed row that must be dropped, not fatal
    writeln!(file, "EV0,yesterday,50,1,1,Flat,Normal,50,0.5").unwrap();
    file.flush().unwrap();
    file
}

pub fn small_config() -> TrainingConfig {
    TrainingConfig {
        folds: 3,
        seed: 42,
        test_fraction: 0.2,
        artifact_name: "fleet-test".into(),
        grid: HyperparameterGrid {
            n_estimators: vec![8],
            max_depth: vec![Some(4), None],
            min_samples_split: vec![2],
            min_samples_leaf: vec![2],
            max_features: vec![MaxFeatures::All, MaxFeatures::Sqrt],
        },
    }
}

pub fn sample_input() -> FeatureInput {
    FeatureInput {
        speed: 72.0,
        acceleration: 1.5,
        braking: 0.8,
        terrain: "Hilly".into(),
        weather: "Cold".into(),
        prev_soc: 64.0,
    }
}

pub fn train(csv: &Path) -> PredictionArtifact {
    train_from_csv(csv, &small_config(), CancelToken::new()).unwrap().artifact
}
