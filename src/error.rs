use std::path::PathBuf;

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

/// Why a single converter run did not succeed.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("could not start converter {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("converter exited with {code}\n\n{stderr}")]
    Conversion { code: String, stderr: String },

    #[error("converter output was not understood: {detail}")]
    Protocol { detail: String },

    #[error("converter reported success but {path:?} does not exist")]
    MissingOutput { path: PathBuf },

    #[error("converter was killed after {secs}s")]
    TimedOut { secs: u64 },

    #[error("job {job_id} has already been run")]
    AlreadyStarted { job_id: String },

    #[error("lost contact with converter: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0:?} is not a valid artifact name")]
    InvalidName(String),

    #[error("artifact {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Upload(String),

    #[error("{0}")]
    NotFound(String),

    #[error("job {job_id} failed: {source}")]
    Job {
        job_id: String,
        #[source]
        source: JobError,
    },

    #[error("could not assemble results: {0}")]
    Aggregation(String),

    #[error("storage failure: {0}")]
    Storage(#[from] std::io::Error),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidName(name) | StoreError::NotFound(name) => {
                ServiceError::NotFound(format!("{name} not found"))
            }
            StoreError::Io(err) => ServiceError::Storage(err),
        }
    }
}

#[derive(Serialize, Debug, PartialEq)]
pub enum ErrorType {
    InvalidUpload,
    NotFound,
    ConversionFailed,
    Internal,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorType,
    pub description: String,
}

impl ServiceError {
    fn error_type(&self) -> ErrorType {
        match self {
            ServiceError::Upload(_) => ErrorType::InvalidUpload,
            ServiceError::NotFound(_) => ErrorType::NotFound,
            ServiceError::Job { .. } => ErrorType::ConversionFailed,
            ServiceError::Aggregation(_) | ServiceError::Storage(_) => ErrorType::Internal,
        }
    }

    /// Client-facing text. Converter stderr and io details stay in the log.
    fn public_description(&self) -> String {
        match self {
            ServiceError::Upload(message) | ServiceError::NotFound(message) => message.clone(),
            ServiceError::Job { source, .. } => match source {
                JobError::Spawn { .. } => "Converter could not be started".to_owned(),
                JobError::Conversion { .. } => "Error processing files".to_owned(),
                JobError::Protocol { .. } | JobError::MissingOutput { .. } => {
                    "Converter returned an unexpected result".to_owned()
                }
                JobError::TimedOut { .. } => "Conversion took too long".to_owned(),
                JobError::AlreadyStarted { .. } | JobError::Io(_) => "Error processing files".to_owned(),
            },
            ServiceError::Aggregation(_) | ServiceError::Storage(_) => {
                "Internal error".to_owned()
            }
        }
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Upload(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.error_type(),
            description: self.public_description(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_status_codes() {
        assert_eq!(
            ServiceError::Upload("No files uploaded".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::from(StoreError::NotFound("ghost.pdf".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::from(StoreError::InvalidName("../etc/passwd".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        let job = ServiceError::Job {
            job_id: "j".into(),
            source: JobError::Protocol { detail: "bad json".into() },
        };
        assert_eq!(job.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn stderr_never_reaches_the_client() {
        let err = ServiceError::Job {
            job_id: "j".into(),
            source: JobError::Conversion {
                code: "exit status: 1".into(),
                stderr: "Traceback: secret/path.py".into(),
            },
        };
        assert!(err.to_string().contains("secret/path.py"));
        assert!(!err.public_description().contains("secret"));
    }
}
