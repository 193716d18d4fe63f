use std::thread;
use std::time::{Duration, Instant};

use anyhow::bail;

use renderq::jobs::text_to_image::{RenderBackend, RenderProgress, RenderRequest};

/// Stand-in for the diffusion model: walks the configured number of
/// inference steps at a fixed cadence and emits a deterministic byte
/// pattern sized for the request. Replace with a real backend to serve an
/// actual model.
pub struct SyntheticBackend {
    pub step_duration: Duration,
}

impl RenderBackend for SyntheticBackend {
    fn render(
        &self,
        request: &RenderRequest,
        progress: &mut dyn FnMut(RenderProgress),
        cancelled: &dyn Fn() -> bool,
    ) -> anyhow::Result<Vec<u8>> {
        let started = Instant::now();

        for step in 1..=request.steps {
            if cancelled() {
                bail!("render interrupted: job cancelled");
            }
            thread::sleep(self.step_duration);
            progress(RenderProgress {
                current_step: step,
                total_steps: request.steps,
                elapsed: started.elapsed(),
            });
        }

        // xorshift over the seed, three bytes per pixel
        let mut state = request.seed | 1;
        let len = request.width as usize * request.height as usize * 3;
        let mut data = Vec::with_capacity(len + 8);
        while data.len() < len {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            data.extend_from_slice(&state.to_le_bytes());
        }
        data.truncate(len);
        Ok(data)
    }
}
