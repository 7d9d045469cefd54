//! Frames exchanged over the progress stream.
//!
//! Every frame is a JSON object `{"type": "<name>", "data": {...}}`.

use serde::Deserialize;
use serde::Serialize;

use crate::http::JobStatus;

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the room scoped to one analysis job.
    JoinAnalysis { analysis_id: String },
    LeaveAnalysis { analysis_id: String },
    /// `timestamp` is milliseconds since the Unix epoch, echoed back in `pong`.
    Ping { timestamp: i64 },
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    ProgressUpdate(ProgressUpdate),
    Pong { timestamp: i64 },
    Connected(ConnectedInfo),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Rooms already scope updates to one job, but newer backends also tag
    /// the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_id: Option<String>,
    pub overall_progress: f64,
    pub current_stage: usize,
    #[serde(default)]
    pub stage_progress: f64,
    pub status: JobStatus,
    /// Seconds since the job started.
    #[serde(default)]
    pub elapsed_time: f64,
    /// Seconds, when the backend can estimate it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_remaining: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
