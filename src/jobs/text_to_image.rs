//! The `text_to_image` job type: renders a prompt through the inference
//! backend and stores the artifact in the output directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::task;

use super::GpuLock;
use crate::registry::{CachePolicy, JobContext, JobHandler};
use crate::types::job::Params;

/// Parameters for one render, with the defaults clients rely on.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderRequest {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f64,
    pub seed: u64,
    pub model_type: String,
}

impl RenderRequest {
    pub fn from_params(params: &Params) -> anyhow::Result<Self> {
        let prompt = params
            .get("prompt")
            .and_then(Value::as_str)
            .filter(|prompt| !prompt.is_empty())
            .context("missing 'prompt' in parameters")?;

        Ok(Self {
            prompt: prompt.to_owned(),
            width: u32_param(params, "width", 1024),
            height: u32_param(params, "height", 1024),
            steps: u32_param(params, "steps", 9),
            guidance_scale: params
                .get("guidance_scale")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            seed: params.get("seed").and_then(Value::as_u64).unwrap_or(42),
            model_type: params
                .get("model_type")
                .and_then(Value::as_str)
                .unwrap_or("uint4")
                .to_owned(),
        })
    }
}

fn u32_param(params: &Params, key: &str, default: u32) -> u32 {
    params
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .unwrap_or(default)
}

/// A per-step report from the backend's denoising loop.
#[derive(Clone, Copy, Debug)]
pub struct RenderProgress {
    pub current_step: u32,
    pub total_steps: u32,
    pub elapsed: Duration,
}

impl RenderProgress {
    /// The `job_progress` payload clients render as a progress bar.
    pub fn payload(&self) -> Value {
        let percentage =
            (self.current_step * 100 / self.total_steps.max(1)).min(100);
        let speed = self.elapsed.as_secs_f64() / f64::from(self.current_step.max(1));
        let remaining =
            speed * f64::from(self.total_steps.saturating_sub(self.current_step));

        json!({
            "type": "progress",
            "percentage": percentage,
            "current_step": self.current_step,
            "total_steps": self.total_steps,
            "elapsed": format_mmss(self.elapsed.as_secs()),
            "remaining": format_mmss(remaining as u64),
            "speed": format!("{speed:.2}s/it"),
        })
    }
}

fn format_mmss(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

/// The inference worker, as this job sees it: an opaque blocking call that
/// reports per-step progress, honours a cancellation probe, and returns
/// the encoded image bytes or fails.
pub trait RenderBackend: Send + Sync {
    fn render(
        &self,
        request: &RenderRequest,
        progress: &mut dyn FnMut(RenderProgress),
        cancelled: &dyn Fn() -> bool,
    ) -> anyhow::Result<Vec<u8>>;
}

pub struct TextToImageJob {
    backend: Arc<dyn RenderBackend>,
    gpu_lock: GpuLock,
    output_dir: PathBuf,
    cache_dir: PathBuf,
}

impl TextToImageJob {
    pub const TASK_TYPE: &'static str = "text_to_image";

    pub fn new(
        backend: Arc<dyn RenderBackend>,
        gpu_lock: GpuLock,
        output_dir: PathBuf,
        cache_dir: PathBuf,
    ) -> Self {
        Self {
            backend,
            gpu_lock,
            output_dir,
            cache_dir,
        }
    }
}

#[async_trait]
impl JobHandler for TextToImageJob {
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<Params> {
        let request = RenderRequest::from_params(ctx.params())?;

        // GPU critical section: rendering and the artifact write. Held
        // across the offload so no other GPU job can interleave; jobs on
        // other resources keep running under the executor semaphore.
        let guard = self.gpu_lock.lock().await;

        ctx.progress(json!({"stage": "generating", "percent": 0}));

        let image = {
            let backend = Arc::clone(&self.backend);
            let request = request.clone();
            let ctx = ctx.clone();
            task::spawn_blocking(move || {
                let mut on_progress =
                    |report: RenderProgress| ctx.progress(report.payload());
                let cancelled = || ctx.is_cancelled();
                backend.render(&request, &mut on_progress, &cancelled)
            })
            .await
            .context("render worker panicked")??
        };

        let filename = artifact_name(&request.prompt, ctx.job_id());
        let path = self.output_dir.join(&filename);
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("creating {}", self.output_dir.display()))?;
        tokio::fs::write(&path, &image)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        drop(guard);

        let mut result = Params::new();
        result.insert("filename".to_owned(), Value::String(filename));
        result.insert(
            "path".to_owned(),
            Value::String(path.display().to_string()),
        );
        Ok(result)
    }

    fn cache_policy(&self) -> Option<CachePolicy> {
        Some(CachePolicy {
            dir: self.cache_dir.clone(),
            suffix: ".cache".to_owned(),
        })
    }
}

/// `<yyyymmdd>-<prompt-slug>-<id-prefix>.png`
fn artifact_name(prompt: &str, job_id: &str) -> String {
    let date = Utc::now().format("%Y%m%d");
    let slug = slugify(prompt, 32);
    let prefix = &job_id[..job_id.len().min(8)];
    format!("{date}-{slug}-{prefix}.png")
}

fn slugify(text: &str, max_len: usize) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for c in text.chars() {
        if !c.is_ascii_alphanumeric() {
            pending_dash = true;
            continue;
        }
        let needed = 1 + usize::from(pending_dash && !slug.is_empty());
        if slug.len() + needed > max_len {
            break;
        }
        if pending_dash && !slug.is_empty() {
            slug.push('-');
        }
        pending_dash = false;
        slug.push(c.to_ascii_lowercase());
    }

    if slug.is_empty() {
        slug.push_str("image");
    }
    slug
}
