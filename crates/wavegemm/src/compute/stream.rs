use std::sync::Arc;
use std::time::Duration;

use crate::compute::fence::Fence;
use crate::compute::map_read_blocking;
use crate::compute::resources::{GemmBuffers, TrackedBuffer};
use crate::compute::timings::FrameTimer;
use crate::device::DeviceContext;
use crate::error::HarnessError;
use crate::kernel::KernelPipeline;

/// Lifecycle of the measurement frame currently owned by the stream.
///
/// `DeviceLost` is terminal; every other state cycles back to `Idle` through
/// `ResultsReady`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameState {
    Idle,
    Recording,
    Submitted,
    Waiting,
    Signaled,
    ResultsReady,
    DeviceLost,
}

impl FrameState {
    /// Whether a submission may still be executing on the GPU.
    pub(crate) fn in_flight(self) -> bool {
        matches!(self, FrameState::Recording | FrameState::Submitted | FrameState::Waiting)
    }

    /// Whether the frame's GPU writes are fence-covered and readable.
    pub(crate) fn results_valid(self) -> bool {
        matches!(self, FrameState::Signaled | FrameState::ResultsReady)
    }
}

/// Records, submits, and fences measurement frames on the compute queue.
///
/// One frame is one submission: a single compute pass bracketed by the
/// timestamp pair, containing the configured number of back-to-back matmul
/// dispatches. Submission is non-blocking; [`WaveStream::wait`] is the only
/// blocking point.
#[derive(Debug)]
pub(crate) struct WaveStream {
    pipeline: Arc<KernelPipeline>,
    bind_group: wgpu::BindGroup,
    timer: FrameTimer,
    fence: Fence,
    state: FrameState,
    last_elapsed: Option<Duration>,
}

impl WaveStream {
    pub(crate) fn new(
        ctx: &DeviceContext,
        pipeline: Arc<KernelPipeline>,
        buffers: &GemmBuffers,
    ) -> Result<Self, HarnessError> {
        let bind_group =
            buffers.bind_group(ctx, &pipeline.layout, pipeline.spec.needs_intermediate())?;
        Ok(Self {
            pipeline,
            bind_group,
            timer: FrameTimer::new(ctx),
            fence: Fence::new(ctx.lost()),
            state: FrameState::Idle,
            last_elapsed: None,
        })
    }

    /// Swaps in another built pipeline, draining in-flight work first so the
    /// old bind group is not dropped under the GPU.
    pub(crate) fn switch_pipeline(
        &mut self,
        ctx: &DeviceContext,
        pipeline: Arc<KernelPipeline>,
        buffers: &GemmBuffers,
    ) -> Result<(), HarnessError> {
        self.wait(ctx)?;
        self.bind_group =
            buffers.bind_group(ctx, &pipeline.layout, pipeline.spec.needs_intermediate())?;
        self.pipeline = pipeline;
        self.state = FrameState::Idle;
        self.last_elapsed = None;
        Ok(())
    }

    /// Records and submits one measurement frame. Returns the fence value
    /// covering it without waiting for the GPU.
    pub(crate) fn run_frame(
        &mut self,
        ctx: &DeviceContext,
        buffers: &GemmBuffers,
        iterations: u32,
    ) -> Result<u64, HarnessError> {
        if self.state == FrameState::DeviceLost {
            return Err(ctx.lost().error());
        }
        // The single timer pair serves one frame at a time.
        if self.state.in_flight() {
            self.wait(ctx)?;
        }
        self.state = FrameState::Recording;

        let spec = self.pipeline.spec;
        let (m, n) = buffers.dims();
        let grid = spec.grid(m, n);

        let mut encoder = ctx.device().create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("wavegemm frame"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(spec.name),
                timestamp_writes: Some(self.timer.timestamp_writes()),
            });
            pass.set_bind_group(0, &self.bind_group, &[]);
            for _ in 0..iterations {
                pass.set_pipeline(&self.pipeline.main);
                let (x, y, z) = grid.main;
                pass.dispatch_workgroups(x, y, z);
                // Split-K consumes the partials written by the dispatch
                // right above it; same-pass ordering makes them visible.
                if let (Some(reduce), Some(groups)) =
                    (self.pipeline.reduce.as_ref(), grid.reduce)
                {
                    pass.set_pipeline(reduce);
                    pass.dispatch_workgroups(groups, 1, 1);
                }
            }
        }
        self.timer.resolve(&mut encoder);

        let index = ctx.queue().submit([encoder.finish()]);
        let value = self.fence.signal(index);
        buffers.mark_used(value);
        self.timer.mark_used(value);
        self.state = FrameState::Submitted;
        log::trace!("frame submitted under fence value {value}, {iterations} dispatches");
        Ok(value)
    }

    /// Blocks until the newest submission's fence value signals. Idempotent;
    /// calling with nothing in flight returns immediately.
    pub(crate) fn wait(&mut self, ctx: &DeviceContext) -> Result<(), HarnessError> {
        match self.state {
            FrameState::DeviceLost => return Err(ctx.lost().error()),
            FrameState::Idle | FrameState::Signaled | FrameState::ResultsReady => return Ok(()),
            _ => {}
        }
        self.state = FrameState::Waiting;
        match self.fence.wait(ctx.device()) {
            Ok(_) => {
                self.state = FrameState::Signaled;
                Ok(())
            }
            Err(err) => {
                self.state = FrameState::DeviceLost;
                Err(err)
            }
        }
    }

    /// The frame's GPU-side elapsed time. Waits first if the frame is still
    /// in flight; repeated calls return the same cached reading.
    pub(crate) fn frame_time(&mut self, ctx: &DeviceContext) -> Result<Duration, HarnessError> {
        self.wait(ctx)?;
        if self.state == FrameState::ResultsReady {
            if let Some(elapsed) = self.last_elapsed {
                return Ok(elapsed);
            }
        }
        if self.state != FrameState::Signaled {
            return Err(HarnessError::InvalidConfig {
                reason: "no measurement frame has been submitted".to_string(),
            });
        }
        let elapsed = self.timer.read_elapsed(ctx)?;
        self.last_elapsed = Some(elapsed);
        self.state = FrameState::ResultsReady;
        Ok(elapsed)
    }

    /// Copies a fence-covered buffer back to the host, truncated to its
    /// logical size.
    pub(crate) fn read_buffer(
        &mut self,
        ctx: &DeviceContext,
        source: &TrackedBuffer,
    ) -> Result<Vec<u8>, HarnessError> {
        self.wait(ctx)?;
        let padded = source.logical_size().next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let staging = ctx.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("wavegemm staging readback"),
            size: padded,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = ctx.device().create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("wavegemm readback copy"),
        });
        encoder.copy_buffer_to_buffer(source.buffer(), 0, &staging, 0, padded);
        let index = ctx.queue().submit([encoder.finish()]);
        let value = self.fence.signal(index);
        source.mark_used(value);
        if let Err(err) = self.fence.wait(ctx.device()) {
            self.state = FrameState::DeviceLost;
            return Err(err);
        }
        let mut bytes = map_read_blocking(ctx.device(), &staging, &ctx.lost())?;
        bytes.truncate(source.logical_size() as usize);
        Ok(bytes)
    }

    /// Drains all outstanding work. Used by shutdown before any GPU resource
    /// is released.
    pub(crate) fn drain(&mut self, ctx: &DeviceContext) -> Result<(), HarnessError> {
        self.wait(ctx)
    }

    /// Last signaled fence value, for the teardown quiescence check.
    pub(crate) fn completed(&self) -> u64 {
        self.fence.completed()
    }

    /// Whether the timer's readback buffer is behind the signaled fence,
    /// checked at teardown alongside the matrix buffers.
    pub(crate) fn timer_quiescent(&self) -> bool {
        self.timer.last_use() <= self.fence.completed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unfenced_states_count_as_in_flight() {
        assert!(FrameState::Recording.in_flight());
        assert!(FrameState::Submitted.in_flight());
        assert!(FrameState::Waiting.in_flight());
        assert!(!FrameState::Idle.in_flight());
        assert!(!FrameState::Signaled.in_flight());
        assert!(!FrameState::ResultsReady.in_flight());
        assert!(!FrameState::DeviceLost.in_flight());
    }

    #[test]
    fn results_are_valid_only_behind_the_fence() {
        assert!(FrameState::Signaled.results_valid());
        assert!(FrameState::ResultsReady.results_valid());
        assert!(!FrameState::Submitted.results_valid());
        assert!(!FrameState::Waiting.results_valid());
        assert!(!FrameState::DeviceLost.results_valid());
    }
}
