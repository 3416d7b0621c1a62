//! Observer wire messages.

use gridflow_core::types::JobId;
use serde::Deserialize;
use serde_json::{json, Value};

/// Event name for replies about a failed `join` / `leave`.
pub const JOB_ERROR_EVENT: &str = "job-error";

/// A message from an observer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientMessage {
    Join {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
    Leave {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
}

/// `job-error` reply addressed to one observer.
pub fn job_error(job_id: Option<JobId>, code: &str, message: &str) -> Value {
    json!({
        "event": JOB_ERROR_EVENT,
        "data": {
            "jobId": job_id,
            "code": code,
            "error": message,
        },
    })
}
