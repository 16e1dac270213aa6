mod common;

use common::{sample_input, small_config, synthetic_fleet, train};
use soc_range::artifact;
use soc_range::evaluate::evaluate_csv;
use soc_range::serve::{predict_and_derive, predict_and_derive_json};
use soc_range::train::train_from_csv;
use soc_range::{CancelToken, ServeConfig, SocError};
use tempfile::tempdir;

#[test]
fn train_save_load_serve() {
    let csv = synthetic_fleet(7);
    let outcome = train_from_csv(csv.path(), &small_config(), CancelToken::new()).unwrap();
    assert_eq!(outcome.load_report.dropped_timestamp, 1);
    assert_eq!(outcome.feature_rows, 6 * 34);
    assert_eq!(outcome.scores.len(), 4);
    assert_eq!(outcome.ranking()[0].params, outcome.artifact.metadata.params);
    let holdout = outcome.artifact.metadata.holdout.clone().unwrap();
    assert_eq!(holdout.rows, (204.0f64 * 0.2).ceil() as usize);
    assert!(holdout.mae.is_finite());
    assert!(holdout.baseline_mae.is_some_and(f64::is_finite));

    let dir = tempdir().unwrap();
    let path = dir.path().join("artifact.json");
    outcome.artifact.save(&path).unwrap();

    let shared = artifact::shared(&path).unwrap();
    let again = artifact::shared(&path).unwrap();
    assert!(std::sync::Arc::ptr_eq(&shared, &again));

    let config = ServeConfig::default();
    let first = predict_and_derive(&shared, &sample_input(), &config).unwrap();
    let second = predict_and_derive(&shared, &sample_input(), &config).unwrap();
    assert_eq!(first.predicted_soc.to_bits(), second.predicted_soc.to_bits());
    assert_eq!(first, second);
    assert!((0.0..=100.0).contains(&first.predicted_soc));
    assert_eq!(first.soc_drop, 64.0 - first.predicted_soc);

    let body = serde_json::json!({
        "speed": 72.0, "acceleration": 1.5, "braking": 0.8,
        "terrain": "Hilly", "weather": "Cold", "prev_soc": 64.0
    });
    let from_json = predict_and_derive_json(&shared, &body, &config).unwrap();
    assert_eq!(from_json, first);

    let missing = serde_json::json!({ "speed": 72.0 });
    assert!(matches!(
        predict_and_derive_json(&shared, &missing, &config),
        Err(SocError::SchemaMismatch { .. })
    ));

    let evaluation = evaluate_csv(&shared, csv.path(), &config).unwrap();
    assert_eq!(evaluation.summary.rows, 6 * 34);
    assert!(evaluation.summary.mae.is_finite());
    assert_eq!(evaluation.summary.vehicles.len(), 6);
    for trip in &evaluation.summary.vehicles {
        assert_eq!(trip.distance_km, 35.0 * 0.5);
        assert!(trip.final_soc < trip.initial_soc);
    }
}

#[test]
fn retraining_is_reproducible() {
    let csv = synthetic_fleet(11);
    let a = train(csv.path());
    let b = train(csv.path());

    assert_eq!(a.metadata.params, b.metadata.params);
    assert_eq!(a.metadata.cv_mae.to_bits(), b.metadata.cv_mae.to_bits());
    assert_eq!(a.metadata.fingerprint, b.metadata.fingerprint);
    let pa = a.predict_raw(&sample_input()).unwrap();
    let pb = b.predict_raw(&sample_input()).unwrap();
    assert_eq!(pa.to_bits(), pb.to_bits());
}

#[test]
fn unseen_category_does_not_fail_inference() {
    let csv = synthetic_fleet(3);
    let artifact = train(csv.path());
    let mut input = sample_input();
    input.weather = "Snow".into();
    input.terrain = "Mountain".into();
    let a = artifact.predict_raw(&input).unwrap();
    let b = artifact.predict_raw(&input).unwrap();
    assert!(a.is_finite());
    assert_eq!(a.to_bits(), b.to_bits());
}
