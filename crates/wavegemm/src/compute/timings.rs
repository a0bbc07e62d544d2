use std::time::Duration;

use crate::compute::map_read_blocking;
use crate::compute::resources::TrackedBuffer;
use crate::device::DeviceContext;
use crate::error::HarnessError;

/// Queries per frame: one timestamp at pass begin, one at pass end.
const QUERY_COUNT: u32 = 2;

/// Converts a begin/end timestamp pair into a wall-clock duration.
///
/// `period` is the queue's nanoseconds-per-tick factor. A pair observed out
/// of order (possible across a driver counter reset) clamps to zero rather
/// than producing a negative or huge duration.
pub(crate) fn ticks_to_duration(begin: u64, end: u64, period: f32) -> Duration {
    let ticks = end.saturating_sub(begin);
    Duration::from_secs_f64(ticks as f64 * period as f64 * 1e-9)
}

/// Timestamp instrumentation for one measurement frame.
///
/// The query pair brackets the whole compute pass, so one frame's reading
/// covers all of its back-to-back dispatches. Results travel query set ->
/// resolve buffer -> mappable readback buffer; the readback is fence-tracked
/// like any other GPU-written buffer.
#[derive(Debug)]
pub(crate) struct FrameTimer {
    query_set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    readback: TrackedBuffer,
    period: f32,
}

impl FrameTimer {
    pub(crate) fn new(ctx: &DeviceContext) -> Self {
        let device = ctx.device();
        let size = QUERY_COUNT as u64 * wgpu::QUERY_SIZE as u64;
        let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("wavegemm frame timestamps"),
            ty: wgpu::QueryType::Timestamp,
            count: QUERY_COUNT,
        });
        let resolve = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("wavegemm timestamp resolve"),
            size,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("wavegemm timestamp readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            query_set,
            resolve,
            readback: TrackedBuffer::new(readback, size),
            period: ctx.timestamp_period(),
        }
    }

    /// Attachment for the frame's compute pass descriptor.
    pub(crate) fn timestamp_writes(&self) -> wgpu::ComputePassTimestampWrites<'_> {
        wgpu::ComputePassTimestampWrites {
            query_set: &self.query_set,
            beginning_of_pass_write_index: Some(0),
            end_of_pass_write_index: Some(1),
        }
    }

    /// Records the query resolve and the copy into the readback buffer.
    /// Recorded after the pass, inside the same submission.
    pub(crate) fn resolve(&self, encoder: &mut wgpu::CommandEncoder) {
        let size = self.readback.logical_size();
        encoder.resolve_query_set(&self.query_set, 0..QUERY_COUNT, &self.resolve, 0);
        encoder.copy_buffer_to_buffer(&self.resolve, 0, self.readback.buffer(), 0, size);
    }

    pub(crate) fn mark_used(&self, fence_value: u64) {
        self.readback.mark_used(fence_value);
    }

    pub(crate) fn last_use(&self) -> u64 {
        self.readback.last_use()
    }

    /// Reads the frame's timestamp pair. Only valid once the fence covering
    /// the frame's submission has signaled.
    pub(crate) fn read_elapsed(&self, ctx: &DeviceContext) -> Result<Duration, HarnessError> {
        let bytes = map_read_blocking(ctx.device(), self.readback.buffer(), &ctx.lost())?;
        let ticks: &[u64] = bytemuck::cast_slice(&bytes);
        Ok(ticks_to_duration(ticks[0], ticks[1], self.period))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_scales_with_the_tick_period() {
        // 1000 ticks at 1 ns/tick.
        assert_eq!(ticks_to_duration(0, 1000, 1.0), Duration::from_micros(1));
        // Same delta at a coarser 52 ns/tick.
        assert_eq!(ticks_to_duration(500, 1500, 52.0), Duration::from_nanos(52_000));
    }

    #[test]
    fn elapsed_is_never_negative() {
        assert_eq!(ticks_to_duration(100, 100, 1.0), Duration::ZERO);
        // A counter reset between the two samples clamps instead of wrapping.
        assert_eq!(ticks_to_duration(u64::MAX, 3, 1.0), Duration::ZERO);
    }
}
