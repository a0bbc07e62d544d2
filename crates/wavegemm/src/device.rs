use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::HarnessError;

/// Features every harness run depends on: wave operations for the SIMD
/// kernel family and timestamp queries for GPU-side timing.
pub(crate) const REQUIRED_FEATURES: wgpu::Features =
    wgpu::Features::SUBGROUP.union(wgpu::Features::TIMESTAMP_QUERY);

/// Which adapter the harness should run on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AdapterSelection {
    /// The highest-scoring compatible adapter. Discrete GPUs beat integrated
    /// GPUs, which beat virtual and CPU adapters.
    #[default]
    HighestScore,
    /// Discrete GPU with the given index in the list of all compatible
    /// discrete GPUs found on the system.
    DiscreteGpu(usize),
    /// Integrated GPU with the given index in the list of all compatible
    /// integrated GPUs found on the system.
    IntegratedGpu(usize),
}

/// Shared flag latched by the wgpu device-lost callback.
///
/// The fence checks it before and after every wait so that a removed device
/// surfaces as [`HarnessError::DeviceLost`] instead of a hang or a read of
/// stale memory.
#[derive(Debug, Default)]
pub(crate) struct LostFlag {
    lost: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl LostFlag {
    pub(crate) fn mark(&self, reason: String) {
        let mut slot = self.reason.lock().expect("lost-flag lock poisoned");
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.lost.store(true, Ordering::Release);
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub(crate) fn error(&self) -> HarnessError {
        let reason = self
            .reason
            .lock()
            .expect("lost-flag lock poisoned")
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        HarnessError::DeviceLost { reason }
    }

    pub(crate) fn check(&self) -> Result<(), HarnessError> {
        if self.is_lost() { Err(self.error()) } else { Ok(()) }
    }
}

/// Owns the logical device and the compute queue for the lifetime of the
/// harness, along with the queue's timestamp tick period needed to convert
/// raw timestamp deltas into durations.
#[derive(Debug)]
pub struct DeviceContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    features: wgpu::Features,
    limits: wgpu::Limits,
    timestamp_period: f32,
    lost: Arc<LostFlag>,
}

fn type_score(device_type: wgpu::DeviceType) -> u32 {
    match device_type {
        wgpu::DeviceType::DiscreteGpu => 3,
        wgpu::DeviceType::IntegratedGpu => 2,
        wgpu::DeviceType::VirtualGpu => 1,
        wgpu::DeviceType::Cpu | wgpu::DeviceType::Other => 0,
    }
}

fn pick(
    adapters: Vec<wgpu::Adapter>,
    selection: &AdapterSelection,
) -> Option<wgpu::Adapter> {
    match selection {
        AdapterSelection::HighestScore => adapters
            .into_iter()
            .max_by_key(|adapter| type_score(adapter.get_info().device_type)),
        AdapterSelection::DiscreteGpu(index) => adapters
            .into_iter()
            .filter(|a| a.get_info().device_type == wgpu::DeviceType::DiscreteGpu)
            .nth(*index),
        AdapterSelection::IntegratedGpu(index) => adapters
            .into_iter()
            .filter(|a| a.get_info().device_type == wgpu::DeviceType::IntegratedGpu)
            .nth(*index),
    }
}

impl DeviceContext {
    /// Enumerates adapters, selects one exposing the required features, and
    /// creates the logical device and compute queue.
    pub fn new(selection: &AdapterSelection) -> Result<Self, HarnessError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let compatible: Vec<_> = instance
            .enumerate_adapters(wgpu::Backends::all())
            .into_iter()
            .filter(|adapter| adapter.features().contains(REQUIRED_FEATURES))
            .collect();
        let adapter = pick(compatible, selection).ok_or(HarnessError::NoCompatibleAdapter)?;

        let info = adapter.get_info();
        let limits = adapter.limits();
        log::info!(
            "adapter: {} ({:?}, {:?}), subgroup lanes {}..={}",
            info.name,
            info.device_type,
            info.backend,
            limits.min_subgroup_size,
            limits.max_subgroup_size,
        );

        let (device, queue) = futures_lite::future::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("wavegemm device"),
                required_features: REQUIRED_FEATURES,
                required_limits: limits.clone(),
                memory_hints: wgpu::MemoryHints::MemoryUsage,
                trace: wgpu::Trace::Off,
            },
        ))
        .map_err(|err| HarnessError::DeviceCreation { reason: err.to_string() })?;

        let lost = Arc::new(LostFlag::default());
        let hook = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            hook.mark(format!("{reason:?}: {message}"));
        });
        device.on_uncaptured_error(Box::new(|err| {
            log::error!("uncaptured wgpu error: {err}");
        }));

        Ok(Self {
            features: adapter.features(),
            limits,
            timestamp_period: queue.get_timestamp_period(),
            device,
            queue,
            lost,
        })
    }

    pub(crate) fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub(crate) fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Feature set detected on the selected adapter, used by kernel
    /// selection.
    pub fn features(&self) -> wgpu::Features {
        self.features
    }

    /// Limits of the selected adapter. Kernel selection checks the subgroup
    /// lane bounds, buffer allocation checks the size caps.
    pub fn limits(&self) -> &wgpu::Limits {
        &self.limits
    }

    /// Nanoseconds per timestamp tick on the compute queue.
    pub fn timestamp_period(&self) -> f32 {
        self.timestamp_period
    }

    pub(crate) fn lost(&self) -> Arc<LostFlag> {
        self.lost.clone()
    }

    /// Whether the device-lost callback has fired.
    pub fn is_lost(&self) -> bool {
        self.lost.is_lost()
    }
}
