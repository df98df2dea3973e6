use thiserror::Error;

use crate::constants::JulianDate;

#[derive(Error, Debug)]
pub enum MopError {
    #[error("Fit did not converge: {0}")]
    FitDivergence(String),

    #[error("Insufficient photometry: {available} usable point(s), {required} required")]
    InsufficientData { available: usize, required: usize },

    #[error("Unknown observatory: {0}")]
    UnknownObservatory(String),

    #[error("Invalid time range: {0}")]
    InvalidTimeRange(String),

    #[error("Claim lost on target {0}")]
    StoreConflict(String),

    #[error("Scheduler rejected request for {target}: {reason}")]
    SubmissionRejected { target: String, reason: String },

    #[error("Target not found: {0}")]
    TargetNotFound(String),

    #[error("Duplicate datum for {target} from {source_name} at JD {timestamp}")]
    DuplicateDatum {
        target: String,
        source_name: String,
        timestamp: JulianDate,
    },

    #[error("Missing or invalid extra field '{field}' on {target}")]
    MissingExtra { target: String, field: &'static str },

    #[error("Invalid fit parameter: {0}")]
    InvalidFitParameter(String),

    #[error("Invalid TAP policy: {0}")]
    InvalidPolicy(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Error while parsing {0}")]
    ParsingError(String),

    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP ureq error: {0}")]
    UreqHttpError(#[from] ureq::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Time error: {0}")]
    TimeError(#[from] hifitime::HifitimeError),
}

impl MopError {
    /// Whether the error is confined to a single target and the batch may carry on.
    pub fn is_per_target(&self) -> bool {
        use MopError::*;
        matches!(
            self,
            FitDivergence(_)
                | InsufficientData { .. }
                | StoreConflict(_)
                | SubmissionRejected { .. }
                | TargetNotFound(_)
                | DuplicateDatum { .. }
                | MissingExtra { .. }
                | UnknownObservatory(_)
                | InvalidTimeRange(_)
        )
    }

    /// Whether a remote service answered with an error status.
    ///
    /// The service was reachable, so the refusal concerns the request, not the connection.
    pub fn is_http_status(&self) -> bool {
        matches!(self, MopError::UreqHttpError(ureq::Error::StatusCode(_)))
    }
}

impl PartialEq for MopError {
    fn eq(&self, other: &Self) -> bool {
        use MopError::*;
        match (self, other) {
            (FitDivergence(a), FitDivergence(b)) => a == b,
            (
                InsufficientData {
                    available: a1,
                    required: r1,
                },
                InsufficientData {
                    available: a2,
                    required: r2,
                },
            ) => a1 == a2 && r1 == r2,
            (UnknownObservatory(a), UnknownObservatory(b)) => a == b,
            (InvalidTimeRange(a), InvalidTimeRange(b)) => a == b,
            (StoreConflict(a), StoreConflict(b)) => a == b,
            (
                SubmissionRejected {
                    target: t1,
                    reason: r1,
                },
                SubmissionRejected {
                    target: t2,
                    reason: r2,
                },
            ) => t1 == t2 && r1 == r2,
            (TargetNotFound(a), TargetNotFound(b)) => a == b,
            (
                DuplicateDatum {
                    target: t1,
                    source_name: s1,
                    timestamp: d1,
                },
                DuplicateDatum {
                    target: t2,
                    source_name: s2,
                    timestamp: d2,
                },
            ) => t1 == t2 && s1 == s2 && d1 == d2,
            (
                MissingExtra {
                    target: t1,
                    field: f1,
                },
                MissingExtra {
                    target: t2,
                    field: f2,
                },
            ) => t1 == t2 && f1 == f2,
            (InvalidFitParameter(a), InvalidFitParameter(b)) => a == b,
            (InvalidPolicy(a), InvalidPolicy(b)) => a == b,
            (InvalidConfig(a), InvalidConfig(b)) => a == b,
            (ParsingError(a), ParsingError(b)) => a == b,

            // Wrapped foreign errors are not comparable: same variant is enough
            (IoError(_), IoError(_)) => true,
            (UreqHttpError(_), UreqHttpError(_)) => true,
            (JsonError(_), JsonError(_)) => true,
            (TomlError(_), TomlError(_)) => true,
            (SqliteError(_), SqliteError(_)) => true,
            (TimeError(_), TimeError(_)) => true,

            _ => false,
        }
    }
}
