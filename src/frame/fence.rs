// Fence synchronizer
//
// One monotonic counter per queue timeline. `signal` hands out strictly
// increasing values, `wait` blocks the render thread until the GPU has
// written a value, `flush` does both and leaves no outstanding work.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::backend::GpuBackend;
use crate::error::FatalError;

/// Owns a fence and the last value scheduled on it.
pub struct FenceSynchronizer<B: GpuBackend> {
    fence: B::Fence,
    last_signaled: u64,
}

impl<B: GpuBackend> FenceSynchronizer<B> {
    pub fn new(backend: &mut B) -> Result<Self> {
        let fence = backend.create_fence().context("Failed to create fence")?;
        Ok(Self {
            fence,
            last_signaled: 0,
        })
    }

    /// Schedule the next value behind all work submitted so far and return it.
    pub fn signal(&mut self, backend: &mut B) -> Result<u64> {
        let value = self.last_signaled + 1;
        backend
            .signal_fence(&self.fence, value)
            .with_context(|| format!("Failed to signal fence value {}", value))?;
        self.last_signaled = value;
        log::trace!("Signaled fence value {}", value);
        Ok(value)
    }

    /// Block until the GPU reaches `value`, or until `timeout` elapses.
    ///
    /// Returns `Ok(false)` only when a bounded wait times out. Values that are
    /// already complete (including 0) return without touching the wait
    /// primitive.
    pub fn wait(&self, backend: &B, value: u64, timeout: Option<Duration>) -> Result<bool> {
        if self.completed(backend)? >= value {
            return Ok(true);
        }
        log::trace!("Waiting for fence value {}", value);
        backend
            .wait_fence(&self.fence, value, timeout)
            .with_context(|| format!("Failed to wait for fence value {}", value))
    }

    /// Unbounded wait. A `false` from the backend here means the wait
    /// primitive misbehaved, which is fatal.
    pub fn wait_forever(&self, backend: &B, value: u64) -> Result<()> {
        if self.wait(backend, value, None)? {
            Ok(())
        } else {
            Err(FatalError::WaitTimeout { value }.into())
        }
    }

    /// Signal and wait: on return the GPU has finished everything submitted.
    pub fn flush(&mut self, backend: &mut B) -> Result<u64> {
        let value = self.signal(backend)?;
        self.wait_forever(backend, value)?;
        log::debug!("Flushed GPU up to fence value {}", value);
        Ok(value)
    }

    pub fn completed(&self, backend: &B) -> Result<u64> {
        backend
            .completed_value(&self.fence)
            .context("Failed to query fence value")
    }

    pub fn last_signaled(&self) -> u64 {
        self.last_signaled
    }

    /// Release the fence and its wait handle. Flush first if work may be
    /// outstanding.
    pub fn destroy(self, backend: &mut B) {
        backend.destroy_fence(self.fence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{Completion, FakeGpu, GpuEvent};
    use crate::backend::Extent;
    use std::thread;

    fn fake(mode: Completion) -> (FakeGpu, crate::backend::fake::FakeGpuHandle) {
        FakeGpu::new(Extent::clamped(64, 64), 3, mode)
    }

    #[test]
    fn signaled_values_start_at_one_and_strictly_increase() {
        let (mut gpu, _) = fake(Completion::Immediate);
        let mut fences = FenceSynchronizer::new(&mut gpu).unwrap();

        let values: Vec<u64> = (0..10).map(|_| fences.signal(&mut gpu).unwrap()).collect();

        assert_eq!(values[0], 1);
        assert!(values.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(fences.last_signaled(), 10);
    }

    #[test]
    fn waiting_on_a_completed_value_does_not_block() {
        let (mut gpu, handle) = fake(Completion::Immediate);
        let mut fences = FenceSynchronizer::new(&mut gpu).unwrap();
        let value = fences.signal(&mut gpu).unwrap();

        fences.wait_forever(&gpu, value).unwrap();
        fences.wait_forever(&gpu, 0).unwrap();

        assert_eq!(handle.count(|e| matches!(e, GpuEvent::FenceWaited { .. })), 0);
    }

    #[test]
    fn bounded_wait_times_out_on_an_incomplete_value() {
        let (mut gpu, _) = fake(Completion::Manual);
        let mut fences = FenceSynchronizer::new(&mut gpu).unwrap();
        let value = fences.signal(&mut gpu).unwrap();

        let reached = fences
            .wait(&gpu, value, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(!reached);
    }

    #[test]
    fn wait_returns_once_the_gpu_catches_up() {
        let (mut gpu, handle) = fake(Completion::Manual);
        let mut fences = FenceSynchronizer::new(&mut gpu).unwrap();
        let value = fences.signal(&mut gpu).unwrap();

        let trigger = handle.clone();
        let gpu_thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            trigger.complete_up_to(0, value);
        });

        fences.wait_forever(&gpu, value).unwrap();
        gpu_thread.join().unwrap();
        assert_eq!(handle.completed(0), value);
    }

    #[test]
    fn flush_leaves_nothing_outstanding() {
        let (mut gpu, handle) = fake(Completion::OnWait);
        let mut fences = FenceSynchronizer::new(&mut gpu).unwrap();
        fences.signal(&mut gpu).unwrap();
        fences.signal(&mut gpu).unwrap();

        let value = fences.flush(&mut gpu).unwrap();

        assert_eq!(value, 3);
        assert_eq!(fences.completed(&gpu).unwrap(), 3);
        assert_eq!(handle.completed(0), 3);
    }
}
