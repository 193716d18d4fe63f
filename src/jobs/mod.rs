use std::sync::Arc;

pub mod text_to_image;

/// Cooperative lock serialising access to the GPU across job types. The
/// executor semaphore still lets I/O-bound jobs overlap with whichever job
/// holds this. Constructed at startup and handed to each GPU-bound handler.
pub type GpuLock = Arc<tokio::sync::Mutex<()>>;
