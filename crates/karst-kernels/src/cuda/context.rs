//! CUDA device context management.
//!
//! Lazily initialized, cached `CudaDevice` handles per GPU index through
//! `cudarc`'s safe driver API.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use cudarc::driver::CudaDevice;
use parking_lot::Mutex;

static DEVICES: OnceLock<Mutex<HashMap<usize, Arc<CudaDevice>>>> = OnceLock::new();

fn devices() -> &'static Mutex<HashMap<usize, Arc<CudaDevice>>> {
    DEVICES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Get or create the CUDA device handle for `ordinal`.
pub fn get_device(ordinal: usize) -> Result<Arc<CudaDevice>, CudaError> {
    let mut map = devices().lock();
    if let Some(dev) = map.get(&ordinal) {
        return Ok(Arc::clone(dev));
    }
    let dev = CudaDevice::new(ordinal)
        .map_err(|e| CudaError::DeviceInit(format!("device {ordinal}: {e}")))?;
    map.insert(ordinal, Arc::clone(&dev));
    tracing::debug!("initialized CUDA device {}", ordinal);
    Ok(dev)
}

/// Whether any CUDA device can be opened.
pub fn is_available() -> bool {
    CudaDevice::new(0).is_ok()
}

/// Number of openable CUDA devices (probed, capped at 16).
pub fn device_count() -> usize {
    (0..16).take_while(|&i| CudaDevice::new(i).is_ok()).count()
}

/// CUDA backend errors.
#[derive(Debug, thiserror::Error)]
pub enum CudaError {
    #[error("CUDA device init failed: {0}")]
    DeviceInit(String),

    #[error("NVRTC compilation failed for program '{program}': {msg}")]
    Compile { program: String, msg: String },

    #[error("failed to load module '{module}': {msg}")]
    ModuleLoad { module: String, msg: String },

    #[error("kernel '{func}' not found in module '{module}'")]
    FuncNotFound { module: String, func: String },

    #[error("CUDA kernel launch failed: {0}")]
    Launch(String),

    #[error("CUDA memory error: {0}")]
    Memory(String),
}
