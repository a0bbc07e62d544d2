use std::sync::Arc;

use crate::device::LostFlag;
use crate::error::HarnessError;

/// The monotonic fence counter, separated from the device so the ordering
/// rules can be checked without one.
///
/// Values start at 1; 0 means "nothing submitted yet" and is always
/// considered signaled.
#[derive(Debug)]
pub(crate) struct FenceClock {
    next: u64,
    completed: u64,
}

impl FenceClock {
    pub(crate) fn new() -> Self {
        Self { next: 1, completed: 0 }
    }

    /// Claims the value for a new submission.
    pub(crate) fn advance(&mut self) -> u64 {
        let value = self.next;
        self.next += 1;
        value
    }

    /// The newest value claimed so far, which a full wait must reach.
    pub(crate) fn target(&self) -> u64 {
        self.next - 1
    }

    pub(crate) fn mark_signaled(&mut self, value: u64) {
        self.completed = self.completed.max(value);
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed
    }

    pub(crate) fn is_signaled(&self, value: u64) -> bool {
        value <= self.completed
    }
}

/// CPU-side view of the GPU timeline.
///
/// Each submission claims the next clock value and remembers the queue's
/// submission index for it; waiting blocks until the device has drained up to
/// that index, then marks the value signaled. A wait that cannot complete is
/// a device-removal condition and latches the shared lost flag.
#[derive(Debug)]
pub(crate) struct Fence {
    clock: FenceClock,
    last_index: Option<wgpu::SubmissionIndex>,
    lost: Arc<LostFlag>,
}

impl Fence {
    pub(crate) fn new(lost: Arc<LostFlag>) -> Self {
        Self { clock: FenceClock::new(), last_index: None, lost }
    }

    /// Records a submission, returning the fence value that now covers it.
    pub(crate) fn signal(&mut self, index: wgpu::SubmissionIndex) -> u64 {
        self.last_index = Some(index);
        self.clock.advance()
    }

    /// Blocks until every recorded submission has completed. Idempotent: once
    /// the target value has signaled, further calls return without touching
    /// the device.
    pub(crate) fn wait(&mut self, device: &wgpu::Device) -> Result<u64, HarnessError> {
        self.lost.check()?;
        let target = self.clock.target();
        if self.clock.is_signaled(target) {
            return Ok(target);
        }
        // Cannot be None here: an unsignaled target implies a recorded
        // submission.
        if let Some(index) = self.last_index.clone() {
            if let Err(err) = device.poll(wgpu::PollType::WaitForSubmissionIndex(index)) {
                log::warn!("fence wait for value {target} failed: {err}");
                self.lost.mark(err.to_string());
            }
        }
        self.lost.check()?;
        self.clock.mark_signaled(target);
        Ok(target)
    }

    pub(crate) fn completed(&self) -> u64 {
        self.clock.completed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn values_are_monotonic_from_one() {
        let mut clock = FenceClock::new();
        assert_eq!(clock.target(), 0);
        assert_eq!(clock.advance(), 1);
        assert_eq!(clock.advance(), 2);
        assert_eq!(clock.advance(), 3);
        assert_eq!(clock.target(), 3);
    }

    #[test]
    fn nothing_submitted_is_already_signaled() {
        let clock = FenceClock::new();
        assert!(clock.is_signaled(clock.target()));
    }

    #[test]
    fn signaling_is_idempotent_and_never_regresses() {
        let mut clock = FenceClock::new();
        let first = clock.advance();
        let second = clock.advance();
        clock.mark_signaled(second);
        assert!(clock.is_signaled(first));
        assert!(clock.is_signaled(second));
        // An out-of-order or repeated signal must not move the counter back.
        clock.mark_signaled(first);
        assert_eq!(clock.completed(), second);
    }

    #[test]
    fn a_latched_lost_flag_refuses_before_any_device_work() {
        let lost = Arc::new(LostFlag::default());
        lost.mark("simulated removal".to_string());
        let fence = Fence::new(lost);
        // wait() and every readback run this check before touching the
        // device; once latched, nothing further reaches the GPU.
        assert!(matches!(fence.lost.check(), Err(HarnessError::DeviceLost { .. })));
    }

    #[test]
    fn wait_without_submission_is_a_no_op() {
        let mut clock = FenceClock::new();
        // Models the fast path of Fence::wait before anything was submitted.
        assert!(clock.is_signaled(clock.target()));
        clock.mark_signaled(clock.target());
        assert_eq!(clock.completed(), 0);
    }
}
