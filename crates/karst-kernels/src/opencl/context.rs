//! OpenCL context management.
//!
//! Flattens all devices across all platforms into one ordinal space and
//! caches a context + queue set per ordinal.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use ocl::enums::{DeviceInfo, DeviceInfoResult};
use ocl::{Context, Device, DeviceType, Platform, Queue};
use parking_lot::Mutex;

static CONTEXTS: OnceLock<Mutex<HashMap<usize, Arc<ClContext>>>> = OnceLock::new();

fn contexts() -> &'static Mutex<HashMap<usize, Arc<ClContext>>> {
    CONTEXTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// One OpenCL device with its context and command queues.
#[derive(Debug)]
pub struct ClContext {
    platform: Platform,
    device: Device,
    context: Context,
    queues: Vec<Queue>,
}

impl ClContext {
    fn open(platform: Platform, device: Device) -> Result<Self, ClError> {
        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()
            .map_err(|e| ClError::DeviceInit(e.to_string()))?;
        let queue =
            Queue::new(&context, device, None).map_err(|e| ClError::DeviceInit(e.to_string()))?;
        Ok(Self {
            platform,
            device,
            context,
            queues: vec![queue],
        })
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Command queue `id` (queue 0 always exists).
    pub fn queue(&self, id: usize) -> &Queue {
        &self.queues[id.min(self.queues.len() - 1)]
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    /// Block until every queue has drained.
    pub fn finish(&self) -> Result<(), ClError> {
        for q in &self.queues {
            q.finish().map_err(|e| ClError::Queue(e.to_string()))?;
        }
        Ok(())
    }

    /// Whether the device reports itself as CPU-class. BLAS-like ops on
    /// such devices go through map/unmap plus host math instead of
    /// device kernels.
    pub fn is_cpu_class(&self) -> bool {
        matches!(
            self.device.info(DeviceInfo::Type),
            Ok(DeviceInfoResult::Type(t)) if t.contains(DeviceType::CPU)
        )
    }

    /// Maximum workgroup size the device supports.
    pub fn max_workgroup_size(&self) -> usize {
        match self.device.info(DeviceInfo::MaxWorkGroupSize) {
            Ok(DeviceInfoResult::MaxWorkGroupSize(n)) => n,
            _ => 256,
        }
    }

    pub fn device_name(&self) -> String {
        self.device.name().unwrap_or_else(|_| "unknown".to_string())
    }

    pub fn vendor(&self) -> String {
        self.device
            .vendor()
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

/// Enumerate (platform, device) pairs across every platform.
fn enumerate() -> Vec<(Platform, Device)> {
    let mut out = Vec::new();
    for platform in Platform::list() {
        if let Ok(devices) = Device::list_all(platform) {
            for device in devices {
                out.push((platform, device));
            }
        }
    }
    out
}

/// Number of visible OpenCL devices.
pub fn device_count() -> usize {
    enumerate().len()
}

/// Get or open the context for flat device `ordinal`.
pub fn get_context(ordinal: usize) -> Result<Arc<ClContext>, ClError> {
    let mut map = contexts().lock();
    if let Some(ctx) = map.get(&ordinal) {
        return Ok(Arc::clone(ctx));
    }
    let all = enumerate();
    let (platform, device) = all
        .get(ordinal)
        .copied()
        .ok_or_else(|| ClError::DeviceInit(format!("no OpenCL device at ordinal {ordinal}")))?;
    let ctx = Arc::new(ClContext::open(platform, device)?);
    tracing::debug!(
        "initialized OpenCL device {} ({})",
        ordinal,
        ctx.device_name()
    );
    map.insert(ordinal, Arc::clone(&ctx));
    Ok(ctx)
}

/// OpenCL backend errors.
#[derive(Debug, thiserror::Error)]
pub enum ClError {
    #[error("OpenCL device init failed: {0}")]
    DeviceInit(String),

    #[error("OpenCL program build failed for '{program}': {msg}")]
    Build { program: String, msg: String },

    #[error("kernel '{0}' could not be created")]
    KernelCreate(String),

    #[error("kernel argument {idx}: {msg}")]
    KernelArg { idx: u32, msg: String },

    #[error("OpenCL enqueue failed: {0}")]
    Enqueue(String),

    #[error("OpenCL queue error: {0}")]
    Queue(String),

    #[error("OpenCL memory error: {0}")]
    Memory(String),
}
