//! Subscription manager: binds live transport connections to persistent
//! client identities and fans job events out to subscribers.
//!
//! Subscriptions are keyed by client identity, not by connection, which is
//! what lets them survive a reconnect. Only an explicit unsubscribe (or
//! process exit) removes one; a disconnect merely unmaps the transport.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::wire::protocol::ServerMessage;

/// Identifier for one live transport connection.
pub type ConnId = u64;

/// One instruction for a connection's writer task.
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundFrame {
    /// A serialized protocol message to write to the socket.
    Message(String),
    /// Close the socket gracefully: the connection was supplanted by a
    /// newer one presenting the same client id.
    Close,
}

pub type OutboundTx = mpsc::UnboundedSender<OutboundFrame>;

/// Pending broadcasts posted from worker threads, drained on the scheduler.
pub type BroadcastQueue = mpsc::UnboundedReceiver<(String, ServerMessage)>;

struct ConnEntry {
    tx: OutboundTx,
    client_id: Option<String>,
    /// Synthetic identities are minted for anonymous connections on their
    /// first subscribe; their subscriptions die with the connection.
    synthetic: bool,
}

#[derive(Default)]
struct Inner {
    next_conn_id: ConnId,
    conns: HashMap<ConnId, ConnEntry>,
    client_conns: HashMap<String, ConnId>,
    /// job_id → (client_id → correlation token).
    job_subs: HashMap<String, HashMap<String, Option<String>>>,
    /// client_id → job_ids, the inverse index of `job_subs`.
    client_subs: HashMap<String, HashSet<String>>,
}

pub struct SubscriptionManager {
    inner: Mutex<Inner>,
    queue: mpsc::UnboundedSender<(String, ServerMessage)>,
}

impl SubscriptionManager {
    /// Builds the manager plus the queue end that [`run`](Self::run) must
    /// drain on the scheduler.
    pub fn new() -> (Arc<Self>, BroadcastQueue) {
        let (queue, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            queue,
        });
        (manager, rx)
    }

    /// Drains broadcasts posted through [`broadcast_threadsafe`]
    /// (Self::broadcast_threadsafe). Spawn this once at startup.
    pub async fn run(self: Arc<Self>, mut queue: BroadcastQueue) {
        while let Some((job_id, message)) = queue.recv().await {
            self.broadcast(&job_id, message);
        }
    }

    /// Accepts a transport. Presenting a client id that is already bound
    /// to a live connection supplants it: the old transport is asked to
    /// close, and its subscriptions transfer untouched because they were
    /// never tied to the transport in the first place.
    pub fn connect(&self, tx: OutboundTx, client_id: Option<String>) -> ConnId {
        let mut inner = self.inner.lock();
        let conn = inner.next_conn_id;
        inner.next_conn_id += 1;

        match client_id {
            Some(client_id) => {
                if let Some(old) = inner.client_conns.insert(client_id.clone(), conn) {
                    if let Some(entry) = inner.conns.remove(&old) {
                        debug!(%client_id, "supplanting previous connection");
                        let _ = entry.tx.send(OutboundFrame::Close);
                    }
                }
                inner.client_subs.entry(client_id.clone()).or_default();
                inner.conns.insert(
                    conn,
                    ConnEntry {
                        tx,
                        client_id: Some(client_id.clone()),
                        synthetic: false,
                    },
                );
                debug!(conn, %client_id, "client connected");
            },
            None => {
                inner.conns.insert(
                    conn,
                    ConnEntry {
                        tx,
                        client_id: None,
                        synthetic: false,
                    },
                );
                debug!(conn, "anonymous client connected");
            },
        }

        conn
    }

    /// Unmaps a transport. Subscriptions made under a real client identity
    /// stay in place for a future reconnect; synthetic identities take
    /// their subscriptions with them.
    pub fn disconnect(&self, conn: ConnId) {
        let mut inner = self.inner.lock();
        inner.remove_conn(conn);
    }

    /// The real client identity bound to a connection, if any. Synthetic
    /// identities are an addressing detail and are not reported.
    pub fn client_id(&self, conn: ConnId) -> Option<String> {
        let inner = self.inner.lock();
        let entry = inner.conns.get(&conn)?;
        if entry.synthetic {
            return None;
        }
        entry.client_id.clone()
    }

    /// Subscribes a connection's client identity to a job. Re-subscribing
    /// overwrites the correlation token: the latest one wins.
    pub fn subscribe(&self, job_id: &str, conn: ConnId, request_id: Option<String>) {
        let mut inner = self.inner.lock();
        let Some(client_id) = inner.identity_for(conn) else {
            return;
        };

        inner
            .job_subs
            .entry(job_id.to_owned())
            .or_default()
            .insert(client_id.clone(), request_id);
        inner
            .client_subs
            .entry(client_id)
            .or_default()
            .insert(job_id.to_owned());
    }

    pub fn unsubscribe(&self, job_id: &str, conn: ConnId) {
        let mut inner = self.inner.lock();
        let Some(client_id) =
            inner.conns.get(&conn).and_then(|e| e.client_id.clone())
        else {
            return;
        };

        if let Some(subs) = inner.job_subs.get_mut(job_id) {
            subs.remove(&client_id);
            if subs.is_empty() {
                inner.job_subs.remove(job_id);
            }
        }
        if let Some(jobs) = inner.client_subs.get_mut(&client_id) {
            jobs.remove(job_id);
        }
    }

    /// Serializes and queues a message for one connection. A dead writer
    /// evicts the connection; its subscriptions stay.
    pub fn send(&self, conn: ConnId, message: &ServerMessage) {
        let frame = match serde_json::to_string(message) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "failed to serialize outbound message");
                return;
            },
        };

        let mut inner = self.inner.lock();
        let Some(entry) = inner.conns.get(&conn) else {
            return;
        };
        if entry.tx.send(OutboundFrame::Message(frame)).is_err() {
            inner.remove_conn(conn);
        }
    }

    /// Delivers a message to every subscriber of `job_id` that currently
    /// has a live connection. Subscribers without one are skipped, not
    /// buffered. Subscriptions that carried a correlation token get a
    /// per-subscriber copy with the token injected.
    pub fn broadcast(&self, job_id: &str, message: ServerMessage) {
        let shared = match serde_json::to_string(&message) {
            Ok(shared) => shared,
            Err(error) => {
                warn!(%error, "failed to serialize broadcast");
                return;
            },
        };

        let mut inner = self.inner.lock();
        let Some(subs) = inner.job_subs.get(job_id) else {
            return;
        };

        let mut dead = Vec::new();
        for (client_id, request_id) in subs {
            let Some(&conn) = inner.client_conns.get(client_id) else {
                debug!(%client_id, job_id, "subscriber offline, skipping");
                continue;
            };
            let Some(entry) = inner.conns.get(&conn) else {
                continue;
            };

            let frame = match request_id {
                Some(request_id) if !request_id.is_empty() => {
                    let tagged = message.with_request_id(Some(request_id.as_str()));
                    match serde_json::to_string(&tagged) {
                        Ok(frame) => frame,
                        Err(_) => continue,
                    }
                },
                _ => shared.clone(),
            };

            if entry.tx.send(OutboundFrame::Message(frame)).is_err() {
                dead.push(conn);
            }
        }

        for conn in dead {
            inner.remove_conn(conn);
        }
    }

    /// Posts a broadcast from any thread; the drain task delivers it on
    /// the scheduler, preserving per-job production order.
    pub fn broadcast_threadsafe(&self, job_id: &str, message: ServerMessage) {
        let _ = self.queue.send((job_id.to_owned(), message));
    }

    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.inner
            .lock()
            .job_subs
            .get(job_id)
            .map_or(0, HashMap::len)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().conns.len()
    }
}

impl Inner {
    /// The identity a subscription for this connection is keyed under,
    /// minting a synthetic one for anonymous connections.
    fn identity_for(&mut self, conn: ConnId) -> Option<String> {
        let entry = self.conns.get_mut(&conn)?;
        if let Some(client_id) = &entry.client_id {
            return Some(client_id.clone());
        }

        let client_id = format!("conn-{conn}");
        entry.client_id = Some(client_id.clone());
        entry.synthetic = true;
        self.client_conns.insert(client_id.clone(), conn);
        Some(client_id)
    }

    fn remove_conn(&mut self, conn: ConnId) {
        let Some(entry) = self.conns.remove(&conn) else {
            return;
        };
        let Some(client_id) = entry.client_id else {
            return;
        };

        if self.client_conns.get(&client_id) == Some(&conn) {
            self.client_conns.remove(&client_id);
        }

        if entry.synthetic {
            // No reconnect is possible for a synthetic identity.
            if let Some(jobs) = self.client_subs.remove(&client_id) {
                for job_id in jobs {
                    if let Some(subs) = self.job_subs.get_mut(&job_id) {
                        subs.remove(&client_id);
                        if subs.is_empty() {
                            self.job_subs.remove(&job_id);
                        }
                    }
                }
            }
            debug!(conn, "anonymous client disconnected");
        } else {
            debug!(conn, %client_id, "client disconnected, subscriptions preserved");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn manager() -> Arc<SubscriptionManager> {
        SubscriptionManager::new().0
    }

    fn connect(
        mgr: &SubscriptionManager,
        client_id: Option<&str>,
    ) -> (ConnId, UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = mgr.connect(tx, client_id.map(str::to_owned));
        (conn, rx)
    }

    fn status_message(job_id: &str) -> ServerMessage {
        ServerMessage::JobStatus {
            job_id: job_id.to_owned(),
            status: "processing".to_owned(),
            result: None,
            error: None,
            request_id: None,
        }
    }

    fn recv_json(rx: &mut UnboundedReceiver<OutboundFrame>) -> Value {
        match rx.try_recv().expect("expected a frame") {
            OutboundFrame::Message(text) => serde_json::from_str(&text).unwrap(),
            OutboundFrame::Close => panic!("expected a message, got close"),
        }
    }

    #[tokio::test]
    async fn test_supplant_closes_old_connection() {
        let mgr = manager();
        let (c1, mut rx1) = connect(&mgr, Some("k2"));
        mgr.subscribe("job-a", c1, None);

        let (_c2, mut rx2) = connect(&mgr, Some("k2"));

        assert!(matches!(rx1.try_recv(), Ok(OutboundFrame::Close)));
        assert_eq!(mgr.connection_count(), 1);

        // All future broadcasts for k2's subscriptions reach the new
        // connection only.
        mgr.broadcast("job-a", status_message("job-a"));
        assert_eq!(recv_json(&mut rx2)["job_id"], "job-a");
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscriptions_survive_reconnect() {
        let mgr = manager();
        let (c1, _rx1) = connect(&mgr, Some("k1"));
        mgr.subscribe("job-a", c1, Some("r1".to_owned()));

        mgr.disconnect(c1);
        assert_eq!(mgr.subscriber_count("job-a"), 1);

        // While offline, broadcasts are skipped, not buffered.
        mgr.broadcast("job-a", status_message("job-a"));

        let (_c2, mut rx2) = connect(&mgr, Some("k1"));
        mgr.broadcast("job-a", status_message("job-a"));

        let frame = recv_json(&mut rx2);
        assert_eq!(frame["job_id"], "job-a");
        assert_eq!(frame["request_id"], "r1");
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_request_id_injected_per_subscriber() {
        let mgr = manager();
        let (c1, mut rx1) = connect(&mgr, Some("k1"));
        let (c2, mut rx2) = connect(&mgr, Some("k2"));
        mgr.subscribe("job-a", c1, Some("r1".to_owned()));
        mgr.subscribe("job-a", c2, None);

        mgr.broadcast("job-a", status_message("job-a"));

        let tagged = recv_json(&mut rx1);
        assert_eq!(tagged["request_id"], "r1");
        let untagged = recv_json(&mut rx2);
        assert_eq!(untagged.get("request_id"), None);
    }

    #[tokio::test]
    async fn test_empty_token_is_not_injected() {
        let mgr = manager();
        let (c1, mut rx1) = connect(&mgr, Some("k1"));
        mgr.subscribe("job-a", c1, Some(String::new()));

        mgr.broadcast("job-a", status_message("job-a"));

        let frame = recv_json(&mut rx1);
        assert_eq!(frame["job_id"], "job-a");
        assert_eq!(frame.get("request_id"), None);
    }

    #[tokio::test]
    async fn test_latest_correlation_token_wins() {
        let mgr = manager();
        let (c1, mut rx1) = connect(&mgr, Some("k1"));
        mgr.subscribe("job-a", c1, Some("r1".to_owned()));
        mgr.subscribe("job-a", c1, Some("r2".to_owned()));

        assert_eq!(mgr.subscriber_count("job-a"), 1);

        mgr.broadcast("job-a", status_message("job-a"));
        assert_eq!(recv_json(&mut rx1)["request_id"], "r2");
    }

    #[tokio::test]
    async fn test_anonymous_subscriptions_die_with_connection() {
        let mgr = manager();
        let (c1, mut rx1) = connect(&mgr, None);
        assert_eq!(mgr.client_id(c1), None);

        mgr.subscribe("job-a", c1, None);
        assert_eq!(mgr.subscriber_count("job-a"), 1);
        // The synthetic identity still routes broadcasts while connected.
        mgr.broadcast("job-a", status_message("job-a"));
        assert_eq!(recv_json(&mut rx1)["job_id"], "job-a");
        // But it is never reported as a real client id.
        assert_eq!(mgr.client_id(c1), None);

        mgr.disconnect(c1);
        assert_eq!(mgr.subscriber_count("job-a"), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_entry() {
        let mgr = manager();
        let (c1, _rx1) = connect(&mgr, Some("k1"));
        mgr.subscribe("job-a", c1, None);
        mgr.unsubscribe("job-a", c1);

        assert_eq!(mgr.subscriber_count("job-a"), 0);
    }

    #[tokio::test]
    async fn test_send_failure_evicts_connection_not_subscription() {
        let mgr = manager();
        let (c1, rx1) = connect(&mgr, Some("k1"));
        mgr.subscribe("job-a", c1, None);

        drop(rx1);
        mgr.send(c1, &status_message("job-a"));

        assert_eq!(mgr.connection_count(), 0);
        assert_eq!(mgr.subscriber_count("job-a"), 1);
    }

    #[tokio::test]
    async fn test_broadcast_failure_evicts_connection() {
        let mgr = manager();
        let (c1, rx1) = connect(&mgr, Some("k1"));
        let (c2, mut rx2) = connect(&mgr, Some("k2"));
        mgr.subscribe("job-a", c1, None);
        mgr.subscribe("job-a", c2, None);

        drop(rx1);
        mgr.broadcast("job-a", status_message("job-a"));

        // The healthy subscriber still got its copy.
        assert_eq!(recv_json(&mut rx2)["job_id"], "job-a");
        assert_eq!(mgr.connection_count(), 1);
        assert_eq!(mgr.subscriber_count("job-a"), 2);
    }

    #[tokio::test]
    async fn test_threadsafe_broadcast_drained_in_order() {
        let (mgr, queue) = SubscriptionManager::new();
        tokio::spawn(Arc::clone(&mgr).run(queue));

        let (c1, mut rx1) = connect(&mgr, Some("k1"));
        mgr.subscribe("job-a", c1, None);

        let poster = {
            let mgr = Arc::clone(&mgr);
            std::thread::spawn(move || {
                for n in 0..3 {
                    mgr.broadcast_threadsafe(
                        "job-a",
                        ServerMessage::JobProgress {
                            job_id: "job-a".to_owned(),
                            progress: serde_json::json!({"current_step": n}),
                            request_id: None,
                        },
                    );
                }
            })
        };
        poster.join().unwrap();

        for n in 0..3 {
            let frame = loop {
                match rx1.try_recv() {
                    Ok(OutboundFrame::Message(text)) => {
                        break serde_json::from_str::<Value>(&text).unwrap()
                    },
                    Ok(OutboundFrame::Close) => panic!("unexpected close"),
                    Err(_) => tokio::task::yield_now().await,
                }
            };
            assert_eq!(frame["progress"]["current_step"], n);
        }
    }
}
