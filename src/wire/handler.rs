//! Inbound message dispatch: joins the job registry and the subscription
//! manager to the client protocol.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::registry::Registry;
use crate::subs::{ConnId, SubscriptionManager};
use crate::types::job::Params;
use crate::wire::protocol::{ClientMessage, JobSummary, ServerMessage};

/// Everything a connection needs to service requests. Constructed once at
/// startup and cloned into each connection task.
#[derive(Clone)]
pub struct Dispatcher {
    pub registry: Arc<Registry>,
    pub subs: Arc<SubscriptionManager>,
}

impl Dispatcher {
    /// Handles one inbound text frame. Protocol failures become `error`
    /// replies; nothing here tears the connection down.
    pub async fn dispatch(&self, conn: ConnId, text: &str) {
        debug!(conn, "received frame");

        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(reason) => {
                self.subs.send(conn, &ServerMessage::error(reason, None));
                return;
            },
        };

        match message {
            ClientMessage::CreateJob {
                task_type,
                params,
                request_id,
            } => {
                self.create_job(conn, task_type, params, non_empty(request_id))
                    .await
            },
            ClientMessage::GetStatus {
                job_id,
                request_id,
            } => self.get_status(conn, job_id, non_empty(request_id)),
            ClientMessage::CancelJob {
                job_id,
                request_id,
            } => self.cancel_job(conn, job_id, non_empty(request_id)),
            ClientMessage::GetClientJobs { request_id } => {
                self.get_client_jobs(conn, non_empty(request_id))
            },
        }
    }

    async fn create_job(
        &self,
        conn: ConnId,
        task_type: String,
        mut params: Params,
        request_id: Option<String>,
    ) {
        // Correlation tokens ride alongside parameters on some clients;
        // hoist them out so they never perturb job identity.
        let request_id = request_id.or_else(|| {
            non_empty(
                params
                    .get("request_id")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            )
        });
        params.remove("request_id");

        if task_type.is_empty() {
            self.subs
                .send(conn, &ServerMessage::error("Missing task_type", request_id));
            return;
        }
        if !self.registry.is_registered(&task_type) {
            self.subs.send(
                conn,
                &ServerMessage::error(
                    format!("Unknown task_type: {task_type}"),
                    request_id,
                ),
            );
            return;
        }

        let client_id = self.subs.client_id(conn);
        let Some(job) = self
            .registry
            .create_job(&task_type, params, client_id.as_deref())
            .await
        else {
            self.subs.send(
                conn,
                &ServerMessage::error("Failed to create job", request_id),
            );
            return;
        };

        self.subs.subscribe(&job.id, conn, request_id.clone());
        self.subs.send(conn, &ServerMessage::status_of(&job, request_id));
    }

    fn get_status(&self, conn: ConnId, job_id: String, request_id: Option<String>) {
        // Subscribe before taking the snapshot so no transition can slip
        // through the gap.
        self.subs.subscribe(&job_id, conn, request_id.clone());

        match self.registry.get_job(&job_id) {
            Some(job) => {
                self.subs.send(conn, &ServerMessage::status_of(&job, request_id));
            },
            None => {
                self.subs.send(
                    conn,
                    &ServerMessage::error(
                        format!("Job not found: {job_id}"),
                        request_id,
                    ),
                );
            },
        }
    }

    fn cancel_job(&self, conn: ConnId, job_id: String, request_id: Option<String>) {
        if self.registry.cancel_job(&job_id) {
            // The terminal broadcast reaches this connection through its
            // existing subscription; no direct reply.
            return;
        }

        let message = match self.registry.get_job(&job_id) {
            Some(job) => format!(
                "Job {job_id} cannot be cancelled (current status: {})",
                job.status.as_str()
            ),
            None => format!("Job not found: {job_id}"),
        };
        self.subs.send(conn, &ServerMessage::error(message, request_id));
    }

    fn get_client_jobs(&self, conn: ConnId, request_id: Option<String>) {
        let Some(client_id) = self.subs.client_id(conn) else {
            self.subs.send(
                conn,
                &ServerMessage::error(
                    "No client_id associated with this connection",
                    request_id,
                ),
            );
            return;
        };

        let jobs = self.registry.get_client_jobs(&client_id);

        // Reconnection catch-up: anything still in flight is re-subscribed
        // so its remaining transitions land on this connection.
        for job in &jobs {
            if !job.status.is_terminal() {
                self.subs.subscribe(&job.id, conn, None);
            }
        }

        let jobs = jobs.iter().map(JobSummary::from).collect();
        self.subs
            .send(conn, &ServerMessage::ClientJobs { jobs, request_id });
    }
}

/// An empty correlation token means no token: it is neither echoed on
/// replies nor injected into broadcasts.
fn non_empty(request_id: Option<String>) -> Option<String> {
    request_id.filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CachePolicy, JobContext, JobHandler};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::sync::Notify;
    use tokio::time::{sleep, timeout};

    use crate::subs::OutboundFrame;

    /// Completes with a fixed result, parking on the gate first if one is
    /// set.
    struct StubJob {
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl JobHandler for StubJob {
        async fn execute(&self, _ctx: JobContext) -> anyhow::Result<Params> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(json!({"filename": "out.png"}).as_object().cloned().unwrap())
        }

        fn cache_policy(&self) -> Option<CachePolicy> {
            None
        }
    }

    fn stack() -> Dispatcher {
        let registry = crate::registry::Registry::new(4);
        let (subs, queue) = SubscriptionManager::new();
        tokio::spawn(Arc::clone(&subs).run(queue));

        let sink = Arc::clone(&subs);
        registry.set_broadcast_callback(move |job_id, message| {
            sink.broadcast_threadsafe(job_id, message);
        });

        registry.register("t", Arc::new(StubJob { gate: None }) as Arc<dyn JobHandler>);
        Dispatcher { registry, subs }
    }

    fn connect(
        d: &Dispatcher,
        client_id: Option<&str>,
    ) -> (ConnId, UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = d.subs.connect(tx, client_id.map(str::to_owned));
        (conn, rx)
    }

    async fn next_json(rx: &mut UnboundedReceiver<OutboundFrame>) -> Value {
        let frame = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed");
        match frame {
            OutboundFrame::Message(text) => serde_json::from_str(&text).unwrap(),
            OutboundFrame::Close => panic!("unexpected close"),
        }
    }

    #[tokio::test]
    async fn test_create_job_lifecycle_with_correlation() {
        let d = stack();
        let (conn, mut rx) = connect(&d, Some("c1"));

        d.dispatch(
            conn,
            r#"{"type":"create_job","task_type":"t","params":{"x":1},"request_id":"r1"}"#,
        )
        .await;

        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "job_status");
        assert_eq!(reply["status"], "pending");
        assert_eq!(reply["request_id"], "r1");
        assert_eq!(
            reply["job_id"],
            "5041bf1f713df204784353e82f6a4a535931cb64f1f4b4a5aeaffcb720918b22"
        );

        let processing = next_json(&mut rx).await;
        assert_eq!(processing["status"], "processing");
        assert_eq!(processing["request_id"], "r1");

        let completed = next_json(&mut rx).await;
        assert_eq!(completed["status"], "completed");
        assert_eq!(completed["request_id"], "r1");
        assert_eq!(completed["result"]["filename"], "out.png");
    }

    #[tokio::test]
    async fn test_empty_request_id_means_no_token() {
        let d = stack();
        let (conn, mut rx) = connect(&d, Some("c1"));

        d.dispatch(
            conn,
            r#"{"type":"create_job","task_type":"t","params":{"x":3},"request_id":""}"#,
        )
        .await;

        // Neither the reply nor any broadcast for this job carries the
        // empty token.
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["status"], "pending");
        assert_eq!(reply.get("request_id"), None);

        let processing = next_json(&mut rx).await;
        assert_eq!(processing["status"], "processing");
        assert_eq!(processing.get("request_id"), None);

        let completed = next_json(&mut rx).await;
        assert_eq!(completed["status"], "completed");
        assert_eq!(completed.get("request_id"), None);
    }

    #[tokio::test]
    async fn test_request_id_inside_params_does_not_perturb_identity() {
        let d = stack();
        let (conn, mut rx) = connect(&d, Some("c1"));

        d.dispatch(
            conn,
            r#"{"type":"create_job","task_type":"t","params":{"x":1,"request_id":"r7"}}"#,
        )
        .await;

        let reply = next_json(&mut rx).await;
        // Same id as for bare `{"x":1}`: the token was hoisted out, and it
        // is still echoed back.
        assert_eq!(
            reply["job_id"],
            "5041bf1f713df204784353e82f6a4a535931cb64f1f4b4a5aeaffcb720918b22"
        );
        assert_eq!(reply["request_id"], "r7");
    }

    #[tokio::test]
    async fn test_dedup_across_two_clients() {
        let d = stack();
        let gate = Arc::new(Notify::new());
        d.registry.register(
            "slow",
            Arc::new(StubJob {
                gate: Some(Arc::clone(&gate)),
            }) as Arc<dyn JobHandler>,
        );

        let (c1, mut rx1) = connect(&d, Some("k1"));
        let (c2, mut rx2) = connect(&d, Some("k2"));

        d.dispatch(
            c1,
            r#"{"type":"create_job","task_type":"slow","params":{"x":9},"request_id":"r1"}"#,
        )
        .await;
        let r1 = next_json(&mut rx1).await;

        d.dispatch(
            c2,
            r#"{"type":"create_job","task_type":"slow","params":{"x":9},"request_id":"r2"}"#,
        )
        .await;
        let r2 = next_json(&mut rx2).await;

        assert_eq!(r1["job_id"], r2["job_id"]);
        assert_eq!(r1["status"], "pending");
        assert_eq!(r2["request_id"], "r2");

        // One execution; each subscriber sees the terminal broadcast once,
        // tagged with its own token. (Whether the second subscriber also
        // saw `processing` depends on when it joined.)
        gate.notify_one();
        let done1 = loop {
            let frame = next_json(&mut rx1).await;
            if frame["status"] == "completed" {
                break frame;
            }
            assert_eq!(frame["status"], "processing");
        };
        let done2 = loop {
            let frame = next_json(&mut rx2).await;
            if frame["status"] == "completed" {
                break frame;
            }
            assert_eq!(frame["status"], "processing");
        };
        assert_eq!(done1["request_id"], "r1");
        assert_eq!(done2["request_id"], "r2");
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_completed_job_replayed_without_processing() {
        let d = stack();
        let (c1, mut rx1) = connect(&d, Some("k1"));

        d.dispatch(
            c1,
            r#"{"type":"create_job","task_type":"t","params":{"x":5}}"#,
        )
        .await;
        // pending, processing, completed
        for _ in 0..3 {
            next_json(&mut rx1).await;
        }

        let (c2, mut rx2) = connect(&d, Some("k2"));
        d.dispatch(
            c2,
            r#"{"type":"create_job","task_type":"t","params":{"x":5}}"#,
        )
        .await;

        let reply = next_json(&mut rx2).await;
        assert_eq!(reply["status"], "completed");
        assert_eq!(reply["result"]["filename"], "out.png");
        // No further frames: in particular no processing broadcast.
        sleep(Duration::from_millis(30)).await;
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_task_type() {
        let d = stack();
        let (conn, mut rx) = connect(&d, None);

        d.dispatch(
            conn,
            r#"{"type":"create_job","task_type":"nope","request_id":"r1"}"#,
        )
        .await;

        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["message"], "Unknown task_type: nope");
        assert_eq!(reply["request_id"], "r1");
    }

    #[tokio::test]
    async fn test_get_status_unknown_job() {
        let d = stack();
        let (conn, mut rx) = connect(&d, None);

        d.dispatch(
            conn,
            r#"{"type":"get_status","job_id":"missing","request_id":"r3"}"#,
        )
        .await;

        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["message"], "Job not found: missing");
        assert_eq!(reply["request_id"], "r3");
    }

    #[tokio::test]
    async fn test_cancel_job_errors() {
        let d = stack();
        let (conn, mut rx) = connect(&d, Some("k1"));

        d.dispatch(conn, r#"{"type":"cancel_job","job_id":"missing"}"#)
            .await;
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["message"], "Job not found: missing");

        d.dispatch(
            conn,
            r#"{"type":"create_job","task_type":"t","params":{"x":6}}"#,
        )
        .await;
        let created = next_json(&mut rx).await;
        let job_id = created["job_id"].as_str().unwrap().to_owned();
        for _ in 0..2 {
            next_json(&mut rx).await;
        }

        d.dispatch(
            conn,
            &format!(r#"{{"type":"cancel_job","job_id":"{job_id}"}}"#),
        )
        .await;
        let reply = next_json(&mut rx).await;
        assert_eq!(
            reply["message"],
            format!("Job {job_id} cannot be cancelled (current status: completed)")
        );
    }

    #[tokio::test]
    async fn test_cancel_running_broadcasts_through_subscription() {
        let d = stack();
        let gate = Arc::new(Notify::new());
        d.registry.register(
            "slow",
            Arc::new(StubJob {
                gate: Some(gate),
            }) as Arc<dyn JobHandler>,
        );
        let (conn, mut rx) = connect(&d, Some("k1"));

        d.dispatch(
            conn,
            r#"{"type":"create_job","task_type":"slow","params":{"x":7}}"#,
        )
        .await;
        let created = next_json(&mut rx).await;
        let job_id = created["job_id"].as_str().unwrap().to_owned();
        let processing = next_json(&mut rx).await;
        assert_eq!(processing["status"], "processing");

        // The gate is never released: cancellation is what ends this job.
        d.dispatch(
            conn,
            &format!(r#"{{"type":"cancel_job","job_id":"{job_id}"}}"#),
        )
        .await;

        // No direct reply; the next frame is the terminal broadcast.
        // (The executor only observes the flag once the handler yields,
        // which for the parked stub never happens — so cancel it while
        // pending is covered in registry tests; here the flagged job is
        // still processing, and no frame should have arrived yet.)
        sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
        assert!(d.registry.is_cancelled(&job_id));
    }

    #[tokio::test]
    async fn test_get_client_jobs_requires_identity() {
        let d = stack();
        let (conn, mut rx) = connect(&d, None);

        d.dispatch(conn, r#"{"type":"get_client_jobs","request_id":"r4"}"#)
            .await;

        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(
            reply["message"],
            "No client_id associated with this connection"
        );
        assert_eq!(reply["request_id"], "r4");
    }

    #[tokio::test]
    async fn test_reconnect_resume() {
        let d = stack();
        let gate = Arc::new(Notify::new());
        d.registry.register(
            "slow",
            Arc::new(StubJob {
                gate: Some(Arc::clone(&gate)),
            }) as Arc<dyn JobHandler>,
        );

        let (c1, mut rx1) = connect(&d, Some("k1"));
        d.dispatch(
            c1,
            r#"{"type":"create_job","task_type":"slow","params":{"x":8}}"#,
        )
        .await;
        let created = next_json(&mut rx1).await;
        let job_id = created["job_id"].as_str().unwrap().to_owned();

        // Drop the transport before the job finishes.
        d.subs.disconnect(c1);
        drop(rx1);

        let (c2, mut rx2) = connect(&d, Some("k1"));
        d.dispatch(c2, r#"{"type":"get_client_jobs"}"#).await;

        let listing = next_json(&mut rx2).await;
        assert_eq!(listing["type"], "client_jobs");
        assert_eq!(listing["jobs"][0]["job_id"], job_id.as_str());
        assert_eq!(listing["jobs"][0]["task_type"], "slow");

        // The catch-up re-subscription routes the terminal broadcast to
        // the new connection.
        gate.notify_one();
        loop {
            let frame = next_json(&mut rx2).await;
            if frame["status"] == "completed" {
                assert_eq!(frame["job_id"], job_id.as_str());
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_malformed_frames_keep_connection_usable() {
        let d = stack();
        let (conn, mut rx) = connect(&d, Some("k1"));

        d.dispatch(conn, "{oops").await;
        assert_eq!(next_json(&mut rx).await["message"], "Invalid JSON");

        d.dispatch(conn, r#"{"type":"warp"}"#).await;
        assert_eq!(
            next_json(&mut rx).await["message"],
            "Unknown message type: warp"
        );

        d.dispatch(
            conn,
            r#"{"type":"create_job","task_type":"t","params":{"x":2}}"#,
        )
        .await;
        assert_eq!(next_json(&mut rx).await["status"], "pending");
    }
}
