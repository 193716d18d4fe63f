//! Job registry and execution engine.
//!
//! Owns the job table, deduplicates work by content-addressed id, runs
//! handlers under a global concurrency bound, and fans lifecycle events out
//! through the installed broadcast sink.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::cache;
use crate::types::job::{JobInfo, Params};
use crate::types::status::JobStatus;
use crate::wire::protocol::ServerMessage;

/// Error string recorded on entries that ended via cancellation.
const CANCELLED: &str = "job cancelled by user";

/// Where and how a handler's results are cached on disk.
#[derive(Clone, Debug)]
pub struct CachePolicy {
    pub dir: PathBuf,
    pub suffix: String,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cache"),
            suffix: ".cache".to_owned(),
        }
    }
}

/// The capability set a job type registers under its tag.
///
/// `job_id` must be a pure function of the parameters: identical parameters
/// produce identical ids, which is what the registry deduplicates on.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Derives the job id for a parameter map. The default hashes the
    /// canonical serialization with SHA-256.
    fn job_id(&self, params: &Params) -> String {
        canonical_job_id(params)
    }

    /// Runs the job. Blocking work should be offloaded with
    /// `spawn_blocking`; the context stays usable from the worker thread.
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<Params>;

    /// Cache policy for this job type, or `None` to disable caching.
    fn cache_policy(&self) -> Option<CachePolicy> {
        Some(CachePolicy::default())
    }

    fn serialize_result(&self, result: &Params) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(result)?)
    }

    fn deserialize_result(&self, data: &[u8]) -> anyhow::Result<Params> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Hashes the canonical parameter serialization: object keys in code-point
/// order, no insignificant whitespace. `serde_json` maps iterate in key
/// order, so serializing the map directly yields the canonical form.
pub fn canonical_job_id(params: &Params) -> String {
    let canonical = serde_json::to_string(params).unwrap_or_default();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

/// Event-sink and cancellation surface handed to an executing handler.
///
/// Cheap to clone; every method is synchronous and safe to call from a
/// blocking worker thread.
#[derive(Clone)]
pub struct JobContext {
    job_id: String,
    params: Params,
    registry: Arc<Registry>,
}

impl JobContext {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Emits a `job_progress` event to every subscriber of this job.
    pub fn progress(&self, payload: Value) {
        self.registry.broadcast(
            &self.job_id,
            ServerMessage::JobProgress {
                job_id: self.job_id.clone(),
                progress: payload,
                request_id: None,
            },
        );
    }

    /// Publishes a handler-chosen intermediate status string. Forwarded to
    /// subscribers verbatim; the typed status in the registry is left
    /// untouched, and nothing is sent once the job is terminal.
    pub fn update_status(&self, status: &str, extra: Option<Params>) {
        self.registry.update_job_status(&self.job_id, status, extra);
    }

    /// True once `cancel_job` has flagged this job.
    pub fn is_cancelled(&self) -> bool {
        self.registry.is_cancelled(&self.job_id)
    }
}

type BroadcastFn = Box<dyn Fn(&str, ServerMessage) + Send + Sync>;

/// The job registry: type table, dedup, lifecycle state, and the bounded
/// executor. One instance per process, constructed at startup and shared
/// behind an `Arc` — there are no hidden globals.
pub struct Registry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    state: Mutex<State>,
    /// Swapped wholesale by `set_max_concurrency`. Jobs keep the permit of
    /// whichever semaphore was current when they were scheduled.
    semaphore: Mutex<Arc<Semaphore>>,
    broadcast: RwLock<Option<BroadcastFn>>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, JobInfo>,
    client_jobs: HashMap<String, HashSet<String>>,
    cancelled: HashSet<String>,
    /// Attempt counter per id. A scheduled execution only runs if its
    /// token still matches, so a retry can never race a stale task into a
    /// double execution.
    attempts: HashMap<String, u64>,
}

impl Registry {
    pub fn new(max_concurrency: usize) -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            state: Mutex::new(State::default()),
            semaphore: Mutex::new(Arc::new(Semaphore::new(max_concurrency))),
            broadcast: RwLock::new(None),
        })
    }

    /// Binds a tag to a handler. Re-registering a tag overwrites it.
    pub fn register(
        &self,
        task_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) {
        self.handlers.write().insert(task_type.into(), handler);
    }

    pub fn is_registered(&self, task_type: &str) -> bool {
        self.handlers.read().contains_key(task_type)
    }

    /// Installs the sink lifecycle events leave through. Invoked
    /// synchronously from whichever context produced the event, including
    /// worker threads, so it must neither block nor panic.
    pub fn set_broadcast_callback(
        &self,
        f: impl Fn(&str, ServerMessage) + Send + Sync + 'static,
    ) {
        *self.broadcast.write() = Some(Box::new(f));
    }

    /// Adjusts the concurrency bound. Applies to jobs scheduled after this
    /// call; jobs already queued or running keep their old permits.
    pub fn set_max_concurrency(&self, n: usize) {
        *self.semaphore.lock() = Arc::new(Semaphore::new(n));
    }

    pub fn get_job(&self, id: &str) -> Option<JobInfo> {
        self.state.lock().jobs.get(id).cloned()
    }

    pub fn is_cancelled(&self, id: &str) -> bool {
        self.state.lock().cancelled.contains(id)
    }

    pub fn get_client_jobs(&self, client_id: &str) -> Vec<JobInfo> {
        let st = self.state.lock();
        let Some(ids) = st.client_jobs.get(client_id) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| st.jobs.get(id).cloned()).collect()
    }

    /// Creates or joins a job, returning its current registry entry, or
    /// `None` when the tag is unregistered.
    ///
    /// An existing pending, processing, or completed entry is returned
    /// unchanged — in particular no second execution is scheduled. Failed
    /// and cancelled entries are replaced by a fresh attempt. A cold id
    /// with a cache blob on disk becomes a completed entry without ever
    /// executing.
    pub async fn create_job(
        self: &Arc<Self>,
        task_type: &str,
        params: Params,
        client_id: Option<&str>,
    ) -> Option<JobInfo> {
        let handler = self.handlers.read().get(task_type).cloned()?;
        let id = handler.job_id(&params);

        if let Some(job) = self.reusable_entry(&id) {
            debug!(job_id = %id, status = job.status.as_str(), "joining existing job");
            return Some(job);
        }

        // The cache probe is file I/O, so it happens outside the state
        // lock; the inserts below re-check for entries that appeared
        // meanwhile.
        if let Some(policy) = handler.cache_policy() {
            let path = cache::cache_path(&policy.dir, &id, &policy.suffix);
            if let Some(data) = cache::read(&path).await {
                match handler.deserialize_result(&data) {
                    Ok(result) => {
                        debug!(job_id = %id, "restored completed job from cache");
                        return Some(self.insert_completed(
                            &id, task_type, params, result, client_id,
                        ));
                    },
                    Err(error) => {
                        warn!(job_id = %id, %error, "ignoring unreadable cache blob");
                    },
                }
            }
        }

        let (job, token) = self.insert_pending(&id, task_type, params, client_id);
        if let Some(token) = token {
            self.schedule(handler, job.clone(), token);
        }
        Some(job)
    }

    /// Flags a job for cancellation. Returns true iff the job existed and
    /// was still pending or processing.
    ///
    /// A pending job is finalised right here and the executor skips it
    /// when its permit arrives; a processing job is finalised by the
    /// executor once the handler yields.
    pub fn cancel_job(&self, id: &str) -> bool {
        let finalised = {
            let mut st = self.state.lock();
            let Some(job) = st.jobs.get_mut(id) else {
                return false;
            };
            match job.status {
                JobStatus::Pending => {
                    job.status = JobStatus::Cancelled;
                    job.error = Some(CANCELLED.to_owned());
                    job.completed_at = Some(Utc::now());
                    let finalised = job.clone();
                    st.cancelled.insert(id.to_owned());
                    Some(finalised)
                },
                JobStatus::Processing => {
                    st.cancelled.insert(id.to_owned());
                    None
                },
                _ => return false,
            }
        };

        if let Some(job) = finalised {
            debug!(job_id = %id, "cancelled while pending");
            self.broadcast(id, ServerMessage::status_of(&job, None));
        }
        true
    }

    /// Returns the existing entry when its state forbids a new attempt.
    fn reusable_entry(&self, id: &str) -> Option<JobInfo> {
        self.state
            .lock()
            .jobs
            .get(id)
            .filter(|job| !retryable(job.status))
            .cloned()
    }

    fn insert_completed(
        &self,
        id: &str,
        task_type: &str,
        params: Params,
        result: Params,
        client_id: Option<&str>,
    ) -> JobInfo {
        let mut st = self.state.lock();
        if let Some(job) = st.jobs.get(id).filter(|job| !retryable(job.status)) {
            return job.clone();
        }

        let now = Utc::now();
        let job = JobInfo {
            id: id.to_owned(),
            task_type: task_type.to_owned(),
            params,
            status: JobStatus::Completed,
            result: Some(result),
            error: None,
            client_id: client_id.map(str::to_owned),
            created_at: now,
            completed_at: Some(now),
        };
        st.track_owner(client_id, id);
        st.jobs.insert(id.to_owned(), job.clone());
        job
    }

    /// Inserts a fresh pending entry, returning its attempt token, or the
    /// raced-in existing entry with no token.
    fn insert_pending(
        &self,
        id: &str,
        task_type: &str,
        params: Params,
        client_id: Option<&str>,
    ) -> (JobInfo, Option<u64>) {
        let mut st = self.state.lock();
        if let Some(job) = st.jobs.get(id).filter(|job| !retryable(job.status)) {
            return (job.clone(), None);
        }

        let job = JobInfo {
            id: id.to_owned(),
            task_type: task_type.to_owned(),
            params,
            status: JobStatus::Pending,
            result: None,
            error: None,
            client_id: client_id.map(str::to_owned),
            created_at: Utc::now(),
            completed_at: None,
        };
        st.jobs.insert(id.to_owned(), job.clone());
        st.track_owner(client_id, id);
        // A fresh attempt starts clean even if a cancel flag from a
        // previous attempt was never consumed.
        st.cancelled.remove(id);
        let token = st.attempts.entry(id.to_owned()).or_insert(0);
        *token += 1;
        (job, Some(*token))
    }

    fn schedule(self: &Arc<Self>, handler: Arc<dyn JobHandler>, job: JobInfo, token: u64) {
        let semaphore = self.semaphore.lock().clone();
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            registry.run_job(handler, job, token, semaphore).await;
        });
    }

    async fn run_job(
        self: Arc<Self>,
        handler: Arc<dyn JobHandler>,
        job: JobInfo,
        token: u64,
        semaphore: Arc<Semaphore>,
    ) {
        let Ok(_permit) = semaphore.acquire_owned().await else {
            return;
        };

        let Some(processing) = self.claim(&job.id, token) else {
            return;
        };
        self.broadcast(&job.id, ServerMessage::status_of(&processing, None));

        let ctx = JobContext {
            job_id: job.id.clone(),
            params: job.params.clone(),
            registry: Arc::clone(&self),
        };
        let outcome = handler.execute(ctx).await;

        // The terminal transition and the cancel-flag consumption happen
        // under one lock: a cancel that landed before this write wins.
        let finished = {
            let mut st = self.state.lock();
            let was_cancelled = st.cancelled.remove(&job.id);
            let Some(entry) = st.jobs.get_mut(&job.id) else {
                return;
            };
            match &outcome {
                Ok(result) if !was_cancelled => {
                    entry.status = JobStatus::Completed;
                    entry.result = Some(result.clone());
                },
                Ok(_) => {
                    entry.status = JobStatus::Cancelled;
                    entry.error = Some(CANCELLED.to_owned());
                },
                Err(error) => {
                    entry.status = if was_cancelled {
                        JobStatus::Cancelled
                    } else {
                        JobStatus::Failed
                    };
                    entry.error = Some(format!("{error:#}"));
                },
            }
            entry.completed_at = Some(Utc::now());
            entry.clone()
        };

        match finished.status {
            JobStatus::Completed => {
                debug!(job_id = %finished.id, "job completed");
                self.write_cache(&handler, &finished).await;
            },
            JobStatus::Failed => {
                warn!(
                    job_id = %finished.id,
                    error = finished.error.as_deref().unwrap_or(""),
                    "job failed",
                );
            },
            _ => debug!(job_id = %finished.id, "job cancelled"),
        }

        self.broadcast(&finished.id, ServerMessage::status_of(&finished, None));
    }

    /// Marks a pending job as processing. Returns `None` when this attempt
    /// was superseded by a retry, or when the job was cancelled while
    /// queued — in the latter case the cancel flag is consumed so a later
    /// retry starts clean.
    fn claim(&self, id: &str, token: u64) -> Option<JobInfo> {
        let mut st = self.state.lock();
        if st.attempts.get(id) != Some(&token) {
            return None;
        }

        let pending = st
            .jobs
            .get(id)
            .is_some_and(|job| job.status == JobStatus::Pending);
        if !pending {
            st.cancelled.remove(id);
            return None;
        }

        let job = st.jobs.get_mut(id)?;
        job.status = JobStatus::Processing;
        Some(job.clone())
    }

    async fn write_cache(&self, handler: &Arc<dyn JobHandler>, job: &JobInfo) {
        let (Some(policy), Some(result)) = (handler.cache_policy(), job.result.as_ref())
        else {
            return;
        };

        let path = cache::cache_path(&policy.dir, &job.id, &policy.suffix);
        match handler.serialize_result(result) {
            Ok(blob) => {
                if let Err(error) = cache::write(&path, &blob).await {
                    warn!(job_id = %job.id, %error, "failed to write cache blob");
                }
            },
            Err(error) => {
                warn!(job_id = %job.id, %error, "failed to serialize result for cache");
            },
        }
    }

    /// Forwards a handler-chosen intermediate status string. Entries that
    /// already reached a terminal state are left alone: the terminal
    /// broadcast is always the last word on a job.
    fn update_job_status(&self, id: &str, status: &str, extra: Option<Params>) {
        {
            let st = self.state.lock();
            match st.jobs.get(id) {
                Some(job) if !job.status.is_terminal() => {},
                _ => return,
            }
        }
        self.broadcast(
            id,
            ServerMessage::JobStatus {
                job_id: id.to_owned(),
                status: status.to_owned(),
                result: extra,
                error: None,
                request_id: None,
            },
        );
    }

    fn broadcast(&self, job_id: &str, message: ServerMessage) {
        let sink = self.broadcast.read();
        if let Some(callback) = sink.as_ref() {
            callback(job_id, message);
        }
    }
}

impl State {
    fn track_owner(&mut self, client_id: Option<&str>, job_id: &str) {
        if let Some(client_id) = client_id {
            self.client_jobs
                .entry(client_id.to_owned())
                .or_default()
                .insert(job_id.to_owned());
        }
    }
}

fn retryable(status: JobStatus) -> bool {
    matches!(status, JobStatus::Failed | JobStatus::Cancelled)
}
