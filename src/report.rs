//! Aggregate job report.
//!
//! The report is what the orchestrator prints to stdout at the end of a
//! run and what post-steps receive through a `report` volume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Final status of one subtask attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubTaskStatus {
    /// Command exited zero.
    Success,
    /// Command exited nonzero.
    Failure,
    /// The subtask could not be executed (backend error, artifact copy
    /// failure).
    Error,
}

impl SubTaskStatus {
    pub fn to_result_status(self) -> ResultStatus {
        match self {
            SubTaskStatus::Success => ResultStatus::Success,
            SubTaskStatus::Failure | SubTaskStatus::Error => ResultStatus::Failure,
        }
    }
}

/// Top-level job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failure,
}

/// Per-subtask report line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDetail {
    pub status: ResultStatus,
    pub name: String,
    pub elapsed_time_sec: i64,
}

/// Aggregate report for one job invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub status: ResultStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed_time_sec: i64,
    pub total_num: usize,
    pub success_num: usize,
    pub failure_num: usize,
    pub details: Vec<ReportDetail>,
    /// User-supplied extension parameters copied from the job's log spec.
    pub ext: BTreeMap<String, String>,
}

impl Report {
    pub fn new(started_at: DateTime<Utc>, elapsed: Duration) -> Self {
        Self {
            status: ResultStatus::Success,
            started_at,
            elapsed_time_sec: elapsed.as_secs() as i64,
            total_num: 0,
            success_num: 0,
            failure_num: 0,
            details: Vec::new(),
            ext: BTreeMap::new(),
        }
    }

    /// Pretty-printed JSON, the format emitted on stdout and written to
    /// `report` volumes.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
