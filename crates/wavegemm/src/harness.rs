use std::sync::Arc;
use std::time::Duration;

use crate::compute::resources::GemmBuffers;
use crate::compute::stream::WaveStream;
use crate::config::GemmConfig;
use crate::device::DeviceContext;
use crate::error::HarnessError;
use crate::kernel::{KernelPipeline, KernelVariant, PipelineCache};
use crate::reference;

/// The benchmark harness: one device, one set of matrix buffers, and one
/// dispatch stream measuring a selected kernel variant.
///
/// Construction does all the fallible setup: adapter and device selection,
/// kernel lookup and pipeline build, buffer allocation, and the one-time
/// input upload. After that the per-frame surface is
/// [`run_frame`](Harness::run_frame) / [`wait`](Harness::wait) /
/// [`frame_time`](Harness::frame_time), plus [`read_result`](Harness::read_result)
/// for verification runs. All methods are single-threaded; the only blocking
/// point is the fence wait.
#[derive(Debug)]
pub struct Harness {
    config: GemmConfig,
    ctx: DeviceContext,
    buffers: GemmBuffers,
    pipelines: PipelineCache,
    stream: WaveStream,
    variant: KernelVariant,
}

impl Harness {
    /// Builds the harness for one run configuration.
    pub fn new(config: GemmConfig) -> Result<Self, HarnessError> {
        config.validate()?;
        let ctx = DeviceContext::new(&config.adapter)?;

        let mut pipelines = PipelineCache::default();
        let (variant, pipeline) = Self::build_variant(&ctx, &mut pipelines, &config, &config.kernel)?;

        let mut buffers = GemmBuffers::new(&ctx, &config)?;
        if pipeline.spec.needs_intermediate() {
            buffers.ensure_intermediate(&ctx)?;
        }
        let (lhs_len, rhs_len) = input_lens(&config);
        let lhs = reference::fill_bytes(config.pattern, config.elem, lhs_len);
        let rhs = reference::fill_bytes(config.pattern, config.elem, rhs_len);
        buffers.upload(&ctx, &lhs, &rhs);

        let stream = WaveStream::new(&ctx, pipeline, &buffers)?;
        log::info!(
            "harness ready: {}x{}x{} tile_k={} kernel={}",
            config.m,
            config.n,
            config.k,
            config.tile_k,
            variant.label(),
        );
        Ok(Self { config, ctx, buffers, pipelines, stream, variant })
    }

    fn build_variant(
        ctx: &DeviceContext,
        pipelines: &mut PipelineCache,
        config: &GemmConfig,
        name: &str,
    ) -> Result<(KernelVariant, Arc<KernelPipeline>), HarnessError> {
        let variant = KernelVariant::select(name, ctx.features(), ctx.limits().min_subgroup_size);
        match variant {
            KernelVariant::None | KernelVariant::Unsupported => {
                Err(HarnessError::UnsupportedKernel { name: name.to_string() })
            }
            _ => {
                let pipeline = pipelines.get_or_build(variant, ctx)?;
                pipeline.spec.validate(config)?;
                Ok((variant, pipeline))
            }
        }
    }

    /// Submits one measurement frame of `iterations` back-to-back dispatches
    /// and returns its fence value without blocking.
    pub fn run_frame(&mut self, iterations: u32) -> Result<u64, HarnessError> {
        self.stream.run_frame(&self.ctx, &self.buffers, iterations)
    }

    /// Blocks until all submitted work has completed. Idempotent.
    pub fn wait(&mut self) -> Result<(), HarnessError> {
        self.stream.wait(&self.ctx)
    }

    /// GPU-side elapsed time of the last measurement frame, covering all of
    /// its dispatches. Waits if the frame is still in flight.
    pub fn frame_time(&mut self) -> Result<Duration, HarnessError> {
        self.stream.frame_time(&self.ctx)
    }

    /// Copies the result matrix back to the host as f32 values.
    pub fn read_result(&mut self) -> Result<Vec<f32>, HarnessError> {
        let bytes = self.stream.read_buffer(&self.ctx, &self.buffers.result)?;
        Ok(bytemuck::cast_slice(&bytes).to_vec())
    }

    /// Re-targets the harness at another kernel variant, reusing the device
    /// and buffers. Pipelines are cached, so switching back is free.
    pub fn switch_kernel(&mut self, name: &str) -> Result<(), HarnessError> {
        let (variant, pipeline) =
            Self::build_variant(&self.ctx, &mut self.pipelines, &self.config, name)?;
        if pipeline.spec.needs_intermediate() {
            self.buffers.ensure_intermediate(&self.ctx)?;
        }
        self.stream.switch_pipeline(&self.ctx, pipeline, &self.buffers)?;
        self.variant = variant;
        log::info!("switched kernel to {}", variant.label());
        Ok(())
    }

    /// The currently selected variant.
    pub fn variant(&self) -> KernelVariant {
        self.variant
    }

    /// The run configuration the harness was built with.
    pub fn config(&self) -> &GemmConfig {
        &self.config
    }

    /// Whether the device has been lost. Once true, every further call
    /// returns [`HarnessError::DeviceLost`].
    pub fn is_lost(&self) -> bool {
        self.ctx.is_lost()
    }

    /// Controlled shutdown: drains the fence, then checks that no buffer's
    /// last recorded use is ahead of the last signaled value before anything
    /// is released.
    pub fn shutdown(mut self) -> Result<(), HarnessError> {
        self.stream.drain(&self.ctx)?;
        debug_assert!(
            self.buffers.quiescent(self.stream.completed()) && self.stream.timer_quiescent(),
            "buffer released while its last-use fence value was unsignaled"
        );
        Ok(())
    }
}

/// Element counts of the two input matrices. Widened before multiplying so
/// dimensions whose product exceeds `u32::MAX` do not wrap.
fn input_lens(config: &GemmConfig) -> (usize, usize) {
    let (m, n, k) = (config.m as usize, config.n as usize, config.k as usize);
    (m * k, k * n)
}

impl Drop for Harness {
    /// Best-effort drain so buffers are not dropped under in-flight GPU
    /// work. A lost device skips the wait; its objects are already gone.
    fn drop(&mut self) {
        if !self.ctx.is_lost() {
            if let Err(err) = self.stream.drain(&self.ctx) {
                log::warn!("drain during teardown failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::resources::BufferSizes;
    use pretty_assertions::assert_eq;

    #[test]
    fn input_lens_survive_products_past_u32() {
        let config = GemmConfig { m: 65_536, n: 3, k: 65_536, ..Default::default() };
        let (lhs, rhs) = input_lens(&config);
        // M * K = 2^32, one past what a u32 product can hold.
        assert_eq!(lhs, 1usize << 32);
        assert_eq!(rhs, 65_536 * 3);
        // The host payload length must agree with the buffer sizing math.
        let sizes = BufferSizes::for_config(&config);
        assert_eq!(lhs as u64 * config.elem.size() as u64, sizes.lhs);
        assert_eq!(rhs as u64 * config.elem.size() as u64, sizes.rhs);
    }
}
