use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::status::JobStatus;

/// A job's parameter mapping, and the shape of its result mapping.
pub type Params = Map<String, Value>;

/// One entry in the job registry.
///
/// The `id` is a pure function of `params` (SHA-256 of the canonical
/// serialization) and never changes. `result` is populated exactly when
/// the job completed; `error` exactly when it failed or was cancelled;
/// `completed_at` exactly when the status is terminal.
#[derive(Clone, Debug)]
pub struct JobInfo {
    pub id: String,
    pub task_type: String,
    pub params: Params,
    pub status: JobStatus,
    pub result: Option<Params>,
    pub error: Option<String>,
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
