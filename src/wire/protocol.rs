use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::job::{JobInfo, Params};
use crate::types::status::JobStatus;

/// A message sent by the client to the server.
///
/// Every frame is a JSON object carrying a `type` discriminator. Frames
/// that fail to parse produce an `error` reply, never a disconnect.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Creates a job, or joins an existing one with the same parameters,
    /// and subscribes this connection to its lifecycle. A `request_id`
    /// found inside `params` is hoisted out before identity derivation so
    /// correlation tokens never perturb deduplication.
    ///
    /// On the wire: `{"type":"create_job","task_type":…,"params":{…}}`
    CreateJob {
        task_type: String,
        #[serde(default)]
        params: Params,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Subscribes to a job, then requests its current status snapshot.
    /// Subscribing first means no transition can slip between the snapshot
    /// and the stream of updates.
    ///
    /// On the wire: `{"type":"get_status","job_id":…}`
    GetStatus {
        job_id: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Requests cooperative cancellation of a job. On success the reply is
    /// the terminal `job_status` broadcast; on failure an `error` reply
    /// says whether the id was unknown or already terminal.
    ///
    /// On the wire: `{"type":"cancel_job","job_id":…}`
    CancelJob {
        job_id: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Lists every job owned by this connection's client identity and
    /// re-subscribes the connection to those still in flight, so a
    /// reconnecting client catches up with one message.
    ///
    /// On the wire: `{"type":"get_client_jobs"}`
    GetClientJobs {
        #[serde(default)]
        request_id: Option<String>,
    },
}

impl ClientMessage {
    /// Parses one inbound frame. The error value is the human-readable
    /// message to echo back in an `error` reply.
    pub fn parse(text: &str) -> Result<Self, String> {
        let value: Value =
            serde_json::from_str(text).map_err(|_| "Invalid JSON".to_owned())?;

        let msg_type = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| "Missing message type".to_owned())?;

        match msg_type.as_str() {
            "create_job" | "get_status" | "cancel_job" | "get_client_jobs" => {
                serde_json::from_value(value)
                    .map_err(|e| format!("Malformed {msg_type} message: {e}"))
            },
            other => Err(format!("Unknown message type: {other}")),
        }
    }
}

/// A message sent by the server to a client.
///
/// Any message produced as a reply to, or consequence of, a subscription
/// that carried a correlation token is delivered with that token echoed as
/// `request_id`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A lifecycle snapshot or transition. `result` rides along on
    /// `completed`; `error` on `failed` and `cancelled`. The status string
    /// is usually one of the five registry states, but handlers may emit
    /// custom intermediate statuses which are forwarded verbatim.
    ///
    /// On the wire: `{"type":"job_status","job_id":…,"status":…}`
    JobStatus {
        job_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Params>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// A progress tick forwarded from the worker while a job runs.
    ///
    /// On the wire: `{"type":"job_progress","job_id":…,"progress":{…}}`
    JobProgress {
        job_id: String,
        progress: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// The jobs owned by the requesting client identity.
    ///
    /// On the wire: `{"type":"client_jobs","jobs":[…]}`
    ClientJobs {
        jobs: Vec<JobSummary>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// A protocol-level failure: malformed frame, unknown tag or id, or a
    /// request the current state cannot satisfy. Never fatal.
    ///
    /// On the wire: `{"type":"error","message":…}`
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Builds the `job_status` message describing a registry entry.
    pub fn status_of(job: &JobInfo, request_id: Option<String>) -> Self {
        ServerMessage::JobStatus {
            job_id: job.id.clone(),
            status: job.status.as_str().to_owned(),
            result: if job.status == JobStatus::Completed {
                job.result.clone()
            } else {
                None
            },
            error: job.error.clone(),
            request_id,
        }
    }

    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }

    /// Returns a copy with the correlation token replaced. Broadcasts share
    /// one message; per-subscriber copies are minted here so one
    /// subscriber's token never leaks into another's frame.
    pub fn with_request_id(&self, request_id: Option<&str>) -> Self {
        let mut copy = self.clone();

        let slot = match &mut copy {
            ServerMessage::JobStatus { request_id, .. }
            | ServerMessage::JobProgress { request_id, .. }
            | ServerMessage::ClientJobs { request_id, .. }
            | ServerMessage::Error { request_id, .. } => request_id,
        };
        *slot = request_id.map(str::to_owned);

        copy
    }
}

/// One entry in a `client_jobs` listing.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub task_type: String,
    pub status: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Params>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&JobInfo> for JobSummary {
    fn from(job: &JobInfo) -> Self {
        JobSummary {
            job_id: job.id.clone(),
            task_type: job.task_type.clone(),
            status: job.status.as_str().to_owned(),
            created_at: job.created_at,
            result: if job.status == JobStatus::Completed {
                job.result.clone()
            } else {
                None
            },
            error: job.error.clone(),
        }
    }
}
