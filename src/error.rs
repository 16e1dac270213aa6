use thiserror::Error;

pub type Result<T> = std::result::Result<T, SocError>;

/// Errors surfaced by the estimation pipeline.
///
/// Row-level ingestion problems are not represented here: those rows are
/// dropped and counted in [`crate::data::LoadReport`].
#[derive(Debug, Error)]
pub enum SocError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("degenerate training data: {0}")]
    DegenerateData(String),

    #[error("feature schema mismatch: missing {missing:?}, unexpected {unexpected:?}")]
    SchemaMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("invalid value for feature `{field}`: {reason}")]
    InvalidFeature { field: String, reason: String },

    #[error("unsupported artifact format version {found} (expected {expected})")]
    ArtifactVersion { found: u32, expected: u32 },

    #[error("artifact fingerprint mismatch: stored {stored}, computed {computed}")]
    Integrity { stored: String, computed: String },

    #[error("predicted SoC {0:.3} is outside [0, 100]")]
    OutOfRange(f64),

    #[error("model fitting failed: {0}")]
    Fit(String),

    #[error("training cancelled")]
    Cancelled,
}

impl From<toml::de::Error> for SocError {
    fn from(err: toml::de::Error) -> Self {
        SocError::Config(err.to_string())
    }
}
