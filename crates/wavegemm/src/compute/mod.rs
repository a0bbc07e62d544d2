pub(crate) mod fence;
pub(crate) mod resources;
pub(crate) mod stream;
pub(crate) mod timings;

use crate::device::LostFlag;
use crate::error::HarnessError;

/// Maps a `MAP_READ` buffer, copies its contents out, and unmaps it.
///
/// Callers must have already waited on the fence covering the last GPU write
/// to the buffer. The map itself still round-trips through the device so a
/// loss discovered here is surfaced instead of handing back stale bytes.
pub(crate) fn map_read_blocking(
    device: &wgpu::Device,
    buffer: &wgpu::Buffer,
    lost: &LostFlag,
) -> Result<Vec<u8>, HarnessError> {
    let slice = buffer.slice(..);
    let (sender, receiver) = async_channel::bounded(1);
    slice.map_async(wgpu::MapMode::Read, move |result| {
        // The channel has capacity for the single callback invocation.
        let _ = sender.try_send(result);
    });

    if let Err(err) = device.poll(wgpu::PollType::Wait) {
        log::warn!("poll while mapping readback buffer failed: {err}");
        lost.mark(err.to_string());
    }
    lost.check()?;

    let mapped = futures_lite::future::block_on(receiver.recv())
        .map_err(|_| HarnessError::DeviceLost {
            reason: "map callback dropped without firing".to_string(),
        })?;
    mapped.map_err(|err| HarnessError::DeviceLost { reason: err.to_string() })?;

    let data = slice.get_mapped_range().to_vec();
    buffer.unmap();
    Ok(data)
}
