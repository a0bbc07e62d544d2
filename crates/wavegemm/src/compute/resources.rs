use std::borrow::Cow;
use std::cell::Cell;

use wgpu::util::DeviceExt;

use crate::config::{Elem, GemmConfig};
use crate::device::DeviceContext;
use crate::error::HarnessError;
use crate::kernel::SPLIT_K_SLICES;

/// Kernel parameters, laid out to match the `GemmParams` uniform block in
/// every shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct GemmParams {
    pub m: u32,
    pub n: u32,
    pub k: u32,
    pub tile_k: u32,
}

impl GemmParams {
    pub(crate) fn from_config(config: &GemmConfig) -> Self {
        Self { m: config.m, n: config.n, k: config.k, tile_k: config.tile_k }
    }
}

fn align_copy(bytes: u64) -> u64 {
    bytes.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
}

/// Byte sizes of the matrix buffers, exact and as allocated.
///
/// Logical sizes are byte-exact products of the dimensions at the configured
/// element width. Allocations round up to the copy alignment so 16-bit
/// matrices with an odd element count stay copyable; the padding is never
/// part of any matrix view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferSizes {
    pub lhs: u64,
    pub rhs: u64,
    pub result: u64,
    /// One result-shaped f32 plane per K slice. Partials accumulate at f32
    /// width regardless of the input element width.
    pub intermediate: u64,
}

impl BufferSizes {
    pub(crate) fn for_config(config: &GemmConfig) -> Self {
        let width = config.elem.size() as u64;
        let (m, n, k) = (config.m as u64, config.n as u64, config.k as u64);
        Self {
            lhs: m * k * width,
            rhs: k * n * width,
            result: m * n * width,
            intermediate: m * n * 4 * SPLIT_K_SLICES as u64,
        }
    }
}

/// A GPU buffer annotated with the fence value of its last recorded use.
///
/// Teardown asserts that every annotation is at or below the last signaled
/// fence value before the buffer is dropped.
#[derive(Debug, new)]
pub(crate) struct TrackedBuffer {
    buffer: wgpu::Buffer,
    /// Payload size; the allocation may be padded past it.
    logical_size: u64,
    #[new(default)]
    last_use: Cell<u64>,
}

impl TrackedBuffer {
    pub(crate) fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub(crate) fn logical_size(&self) -> u64 {
        self.logical_size
    }

    pub(crate) fn mark_used(&self, fence_value: u64) {
        self.last_use.set(self.last_use.get().max(fence_value));
    }

    pub(crate) fn last_use(&self) -> u64 {
        self.last_use.get()
    }
}

/// Pads an upload payload out to the copy alignment when needed.
fn pad_upload(bytes: &[u8]) -> Cow<'_, [u8]> {
    let padded = align_copy(bytes.len() as u64) as usize;
    if padded == bytes.len() {
        Cow::Borrowed(bytes)
    } else {
        let mut owned = bytes.to_vec();
        owned.resize(padded, 0);
        Cow::Owned(owned)
    }
}

/// The buffers of one run: two inputs, the result, the split-K intermediate
/// when a variant needs it, and the write-once parameter uniform.
#[derive(Debug)]
pub(crate) struct GemmBuffers {
    pub lhs: TrackedBuffer,
    pub rhs: TrackedBuffer,
    pub result: TrackedBuffer,
    pub intermediate: Option<TrackedBuffer>,
    params: wgpu::Buffer,
    sizes: BufferSizes,
    m: u32,
    n: u32,
}

fn create_storage(
    device: &wgpu::Device,
    label: &str,
    logical_size: u64,
    usage: wgpu::BufferUsages,
) -> TrackedBuffer {
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: align_copy(logical_size),
        usage,
        mapped_at_creation: false,
    });
    TrackedBuffer::new(buffer, logical_size)
}

/// Rejects a buffer request the device cannot serve. Oversized buffers
/// raise a validation error rather than OOM, so the cap is checked up front
/// where it maps cleanly onto [`HarnessError::Allocation`].
fn check_size_limits(
    label: &str,
    size: u64,
    limits: &wgpu::Limits,
) -> Result<(), HarnessError> {
    let cap = limits.max_buffer_size.min(limits.max_storage_buffer_binding_size as u64);
    if size > cap {
        return Err(HarnessError::Allocation {
            reason: format!("{label} buffer needs {size} bytes, device caps buffers at {cap}"),
        });
    }
    Ok(())
}

/// Runs `alloc` under error scopes so a failed allocation surfaces as
/// [`HarnessError::Allocation`] instead of an uncaptured error. Both filters
/// are needed: exhaustion reports as out-of-memory, anything the size
/// pre-check missed reports as validation.
fn with_alloc_scope<T>(
    ctx: &DeviceContext,
    alloc: impl FnOnce(&wgpu::Device) -> T,
) -> Result<T, HarnessError> {
    let device = ctx.device();
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    let out = alloc(device);
    let oom = futures_lite::future::block_on(device.pop_error_scope());
    let validation = futures_lite::future::block_on(device.pop_error_scope());
    if let Some(err) = oom.or(validation) {
        return Err(HarnessError::Allocation { reason: err.to_string() });
    }
    Ok(out)
}

impl GemmBuffers {
    pub(crate) fn new(ctx: &DeviceContext, config: &GemmConfig) -> Result<Self, HarnessError> {
        let sizes = BufferSizes::for_config(config);
        let params_data = GemmParams::from_config(config);

        check_size_limits("lhs", sizes.lhs, ctx.limits())?;
        check_size_limits("rhs", sizes.rhs, ctx.limits())?;
        check_size_limits("result", sizes.result, ctx.limits())?;

        let (lhs, rhs, result, params) = with_alloc_scope(ctx, |device| {
            let lhs = create_storage(
                device,
                "wavegemm lhs",
                sizes.lhs,
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            );
            let rhs = create_storage(
                device,
                "wavegemm rhs",
                sizes.rhs,
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            );
            let result = create_storage(
                device,
                "wavegemm result",
                sizes.result,
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            );
            // Written once through the creation mapping, immutable afterwards.
            let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("wavegemm params"),
                contents: bytemuck::bytes_of(&params_data),
                usage: wgpu::BufferUsages::UNIFORM,
            });
            (lhs, rhs, result, params)
        })?;

        log::debug!(
            "allocated buffers: lhs {}B, rhs {}B, result {}B",
            sizes.lhs,
            sizes.rhs,
            sizes.result,
        );

        Ok(Self { lhs, rhs, result, intermediate: None, params, sizes, m: config.m, n: config.n })
    }

    /// Result dimensions (M, N), fixed for the buffers' lifetime.
    pub(crate) fn dims(&self) -> (u32, u32) {
        (self.m, self.n)
    }

    /// Allocates the split-K partials buffer on first use. Variants without a
    /// reduce pass never pay for it.
    pub(crate) fn ensure_intermediate(&mut self, ctx: &DeviceContext) -> Result<(), HarnessError> {
        if self.intermediate.is_some() {
            return Ok(());
        }
        let size = self.sizes.intermediate;
        check_size_limits("partials", size, ctx.limits())?;
        let buffer = with_alloc_scope(ctx, |device| {
            create_storage(device, "wavegemm partials", size, wgpu::BufferUsages::STORAGE)
        })?;
        log::debug!("allocated split-K partials: {size}B");
        self.intermediate = Some(buffer);
        Ok(())
    }

    /// Uploads the host-generated input matrices. Lengths must equal the
    /// logical input sizes; padding to the copy alignment happens here.
    pub(crate) fn upload(&self, ctx: &DeviceContext, lhs: &[u8], rhs: &[u8]) {
        debug_assert_eq!(lhs.len() as u64, self.lhs.logical_size());
        debug_assert_eq!(rhs.len() as u64, self.rhs.logical_size());
        let queue = ctx.queue();
        queue.write_buffer(self.lhs.buffer(), 0, &pad_upload(lhs));
        queue.write_buffer(self.rhs.buffer(), 0, &pad_upload(rhs));
    }

    /// Builds the bind group backing the shared binding layout.
    pub(crate) fn bind_group(
        &self,
        ctx: &DeviceContext,
        layout: &wgpu::BindGroupLayout,
        needs_intermediate: bool,
    ) -> Result<wgpu::BindGroup, HarnessError> {
        let mut entries = vec![
            wgpu::BindGroupEntry { binding: 0, resource: self.lhs.buffer().as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: self.rhs.buffer().as_entire_binding() },
            wgpu::BindGroupEntry { binding: 2, resource: self.result.buffer().as_entire_binding() },
            wgpu::BindGroupEntry { binding: 3, resource: self.params.as_entire_binding() },
        ];
        if needs_intermediate {
            let intermediate =
                self.intermediate.as_ref().ok_or_else(|| HarnessError::InvalidConfig {
                    reason: "split-K kernel bound before its partials buffer was allocated"
                        .to_string(),
                })?;
            entries.push(wgpu::BindGroupEntry {
                binding: 4,
                resource: intermediate.buffer().as_entire_binding(),
            });
        }
        Ok(ctx.device().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("wavegemm bind group"),
            layout,
            entries: &entries,
        }))
    }

    /// Annotates every buffer a dispatch can touch with the covering fence
    /// value.
    pub(crate) fn mark_used(&self, fence_value: u64) {
        self.lhs.mark_used(fence_value);
        self.rhs.mark_used(fence_value);
        self.result.mark_used(fence_value);
        if let Some(intermediate) = &self.intermediate {
            intermediate.mark_used(fence_value);
        }
    }

    /// Whether every last-use annotation is covered by the given signaled
    /// fence value, i.e. the GPU can no longer be reading these buffers.
    pub(crate) fn quiescent(&self, completed: u64) -> bool {
        let newest = self
            .lhs
            .last_use()
            .max(self.rhs.last_use())
            .max(self.result.last_use())
            .max(self.intermediate.as_ref().map_or(0, TrackedBuffer::last_use));
        newest <= completed
    }
}
