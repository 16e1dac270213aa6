//! State-of-charge estimation for electric vehicles, with a rule-based
//! range and driving-efficiency layer on top of the prediction.
//!
//! Training: [`data::TelemetryLoader`] → [`features::build_feature_rows`] →
//! [`model::ModelSelector`] → [`artifact::PredictionArtifact`].
//! Serving: [`artifact::shared`] → [`serve::predict_and_derive`].

pub mod artifact;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod features;
pub mod forest;
pub mod model;
pub mod preprocess;
pub mod range;
pub mod serve;
pub mod train;

pub use artifact::{PredictionArtifact, ARTIFACT_FORMAT_VERSION};
pub use config::{OutputPolicy, ServeConfig, Settings, TrainingConfig};
pub use error::{Result, SocError};
pub use features::{FeatureInput, FeatureRow, FeatureSchema};
pub use model::{CancelToken, FittedPipeline, HyperparameterGrid, ModelSelector};
pub use range::{consumption_rate, efficiency_score, range_km, Terrain, Weather, WeatherPenalty};
pub use serve::{predict_and_derive, PredictionRequest, PredictionResult};
