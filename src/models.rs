use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Fetching,
    Cutting,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobErrorPayload {
    pub code: String,
    pub message: String,
}

impl JobErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Outcome for one requested duration. Exactly one of `download_token` and
/// `failure_reason` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClipResult {
    pub duration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_duration: Option<f64>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl ClipResult {
    pub fn registered(duration: u64, token: String, actual_duration: f64) -> Self {
        Self {
            duration,
            download_url: Some(format!("/artifacts/{token}")),
            download_token: Some(token),
            actual_duration: Some(actual_duration),
            truncated: actual_duration + TRUNCATION_TOLERANCE_SECS < duration as f64,
            failure_reason: None,
        }
    }

    pub fn failed(duration: u64, reason: impl Into<String>) -> Self {
        Self {
            duration,
            download_token: None,
            download_url: None,
            actual_duration: None,
            truncated: false,
            failure_reason: Some(reason.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.download_token.is_some()
    }
}

/// Produced clips shorter than requested by more than this are flagged.
pub const TRUNCATION_TOLERANCE_SECS: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub source_url: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub clips: Vec<ClipResult>,
    pub error: Option<JobErrorPayload>,
}

impl JobRecord {
    pub fn new(job_id: String, source_url: String) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            source_url,
            state: JobState::Pending,
            created_at: now,
            updated_at: now,
            clips: Vec::new(),
            error: None,
        }
    }

    pub fn to_response(&self) -> JobResponse {
        JobResponse {
            job_id: self.job_id.clone(),
            source_url: self.source_url.clone(),
            state: self.state,
            clips: self.clips.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub job_id: String,
    pub source_url: String,
    pub state: JobState,
    pub clips: Vec<ClipResult>,
    pub error: Option<JobErrorPayload>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAcceptedResponse {
    pub job_id: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn clip_result_serializes_either_token_or_failure() {
        let ok = ClipResult::registered(60, "abc".into(), 60.0);
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["downloadToken"], json!("abc"));
        assert_eq!(value["downloadUrl"], json!("/artifacts/abc"));
        assert!(value.get("failureReason").is_none());
        assert_eq!(value["truncated"], json!(false));

        let failed = ClipResult::failed(120, "transcoder exited");
        let value = serde_json::to_value(&failed).unwrap();
        assert!(value.get("downloadToken").is_none());
        assert_eq!(value["failureReason"], json!("transcoder exited"));
    }

    #[test]
    fn shorter_clip_is_flagged_truncated() {
        assert!(ClipResult::registered(300, "t".into(), 95.2).truncated);
        assert!(!ClipResult::registered(60, "t".into(), 59.8).truncated);
    }

    #[test]
    fn job_state_is_lowercase_on_the_wire() {
        assert_eq!(serde_json::to_value(JobState::Cutting).unwrap(), json!("cutting"));
        assert!(JobState::Done.is_terminal());
        assert!(!JobState::Fetching.is_terminal());
    }
}
