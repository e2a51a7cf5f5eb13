use std::{io, path::PathBuf, time::Duration};

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failure of a single external tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with status {exit_code:?}: {stderr}")]
    Failed {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {}s", .after.as_secs())]
    TimedOut { program: String, after: Duration },

    #[error("{program} was cancelled")]
    Cancelled { program: String },

    #[error("IO error while running tool: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unsupported source: {0}")]
    Unsupported(String),

    #[error("extraction failed: {reason}")]
    Extraction { reason: String },

    #[error("no playable stream found")]
    NoPlayableStream,

    #[error("fetch timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("fetch cancelled")]
    Cancelled,

    #[error("IO error during fetch: {0}")]
    Io(#[from] io::Error),
}

impl FetchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unsupported(_) => "UNSUPPORTED_SOURCE",
            Self::Timeout(_) => "FETCH_TIMEOUT",
            Self::Cancelled => "CANCELLED",
            _ => "FETCH_FAILED",
        }
    }
}

impl From<ToolError> for FetchError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::TimedOut { after, .. } => Self::Timeout(after),
            ToolError::Cancelled { .. } => Self::Cancelled,
            ToolError::Failed { stderr, .. } if stderr.contains("Unsupported URL") => {
                Self::Unsupported(last_line(&stderr))
            }
            ToolError::Failed {
                stderr, exit_code, ..
            } => Self::Extraction {
                reason: if stderr.trim().is_empty() {
                    format!("extractor exited with status {exit_code:?}")
                } else {
                    last_line(&stderr)
                },
            },
            other => Self::Extraction {
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum CutError {
    #[error("transcoder exited with status {exit_code:?}: {stderr}")]
    Transcoder {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("cut timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("cut cancelled")]
    Cancelled,

    #[error("start offset {start_secs}s is past the end of the {source_secs:.1}s source")]
    SourceExhausted { start_secs: u64, source_secs: f64 },

    #[error("failed to probe source: {0}")]
    Probe(String),

    #[error("IO error during cut: {0}")]
    Io(#[from] io::Error),
}

impl From<ToolError> for CutError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::TimedOut { after, .. } => Self::Timeout(after),
            ToolError::Cancelled { .. } => Self::Cancelled,
            ToolError::Failed {
                exit_code, stderr, ..
            } => Self::Transcoder {
                exit_code,
                stderr: stderr.trim().to_string(),
            },
            ToolError::Spawn { program, source } => Self::Transcoder {
                exit_code: None,
                stderr: format!("failed to spawn {program}: {source}"),
            },
            ToolError::Io(err) => Self::Io(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace under {root}: {source}")]
    Create {
        root: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove workspace {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors surfaced to API callers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    ResourceExhausted(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "INVALID_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Internal(err) => format!("{err:#}"),
            other => other.to_string(),
        };
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message
            }
        }));

        let mut response = (status, body).into_response();
        if matches!(self, Self::ResourceExhausted(_)) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("5"));
        }
        response
    }
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string()
}
