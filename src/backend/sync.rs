// Synchronization primitives
//
// Timeline semaphores back the fence counter. Binary semaphores order image
// acquisition before rendering and rendering before presentation.

use anyhow::{bail, Result};
use ash::vk;
use std::time::Duration;

use crate::error::FatalError;

/// Timeline semaphore used as a monotonic fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineFence {
    pub semaphore: vk::Semaphore,
}

impl TimelineFence {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        let semaphore = unsafe { device.create_semaphore(&create_info, None) }
            .map_err(FatalError::api("vkCreateSemaphore"))?;
        Ok(Self { semaphore })
    }

    pub fn value(&self, device: &ash::Device) -> Result<u64> {
        let value = unsafe { device.get_semaphore_counter_value(self.semaphore) }
            .map_err(FatalError::api("vkGetSemaphoreCounterValue"))?;
        Ok(value)
    }

    /// Block until the semaphore reaches `value`. `false` on timeout.
    pub fn wait(&self, device: &ash::Device, value: u64, timeout: Option<Duration>) -> Result<bool> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        let timeout_ns = timeout.map_or(u64::MAX, |t| t.as_nanos().min(u64::MAX as u128) as u64);

        match unsafe { device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(FatalError::api("vkWaitSemaphores")(e).into()),
        }
    }

    pub fn destroy(self, device: &ash::Device) {
        unsafe { device.destroy_semaphore(self.semaphore, None) };
    }
}

/// A timeline point: once `fence` reaches `value`, the work it covers is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FencePoint {
    pub fence: vk::Semaphore,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcquireState {
    /// Free, or its last consumer is covered by `release`
    Idle,
    /// Handed to vkAcquireNextImageKHR, not yet waited on by a submission
    Acquired { image: usize },
    /// Waited on by a submission that no fence point covers yet
    Consumed,
}

struct AcquireSemaphore {
    semaphore: vk::Semaphore,
    state: AcquireState,
    release: Option<FencePoint>,
}

/// Binary semaphores for image acquisition.
///
/// Which image an acquire returns is only known after the call, so the
/// semaphore cannot be chosen per image. A ring one longer than the image
/// count is used instead, and each entry remembers the fence point after
/// which the submission that waited on it has finished.
pub struct AcquireRing {
    entries: Vec<AcquireSemaphore>,
    next: usize,
}

impl AcquireRing {
    pub fn new(device: &ash::Device, image_count: usize) -> Result<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        let entries = (0..image_count + 1)
            .map(|_| {
                let semaphore = unsafe { device.create_semaphore(&create_info, None) }
                    .map_err(FatalError::api("vkCreateSemaphore"))?;
                Ok(AcquireSemaphore {
                    semaphore,
                    state: AcquireState::Idle,
                    release: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries, next: 0 })
    }

    /// Semaphore for the next acquire. Returns the entry index and the fence
    /// point to wait for before the semaphore may be signaled again.
    pub fn next(&mut self) -> Result<(usize, vk::Semaphore, Option<FencePoint>)> {
        if self.entries.is_empty() {
            bail!("acquire semaphores were destroyed");
        }
        let slot = self.next;
        self.next = (slot + 1) % self.entries.len();
        let entry = &mut self.entries[slot];
        match entry.state {
            AcquireState::Idle => {}
            AcquireState::Acquired { image } => {
                bail!("acquire semaphore {} still holds image {}", slot, image)
            }
            AcquireState::Consumed => {
                bail!("acquire semaphore {} reused before its frame was fenced", slot)
            }
        }
        Ok((slot, entry.semaphore, entry.release.take()))
    }

    pub fn mark_acquired(&mut self, slot: usize, image: usize) {
        self.entries[slot].state = AcquireState::Acquired { image };
    }

    /// The acquire in `slot` failed and signals nothing.
    pub fn mark_unused(&mut self, slot: usize) {
        self.entries[slot].state = AcquireState::Idle;
    }

    /// Hand the semaphore for `image` to a submission.
    pub fn consume(&mut self, image: usize) -> Result<vk::Semaphore> {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.state == AcquireState::Acquired { image })
        else {
            bail!("image {} was submitted without being acquired", image);
        };
        entry.state = AcquireState::Consumed;
        Ok(entry.semaphore)
    }

    /// Every consumed semaphore is released once `point` is reached.
    pub fn fence_consumed(&mut self, point: FencePoint) {
        for entry in &mut self.entries {
            if entry.state == AcquireState::Consumed {
                entry.state = AcquireState::Idle;
                entry.release = Some(point);
            }
        }
    }

    /// Semaphores acquired but never waited on; they are (or will be)
    /// signaled and must be waited on before the ring is destroyed.
    pub fn pending(&self) -> Vec<vk::Semaphore> {
        self.entries
            .iter()
            .filter(|e| matches!(e.state, AcquireState::Acquired { .. }))
            .map(|e| e.semaphore)
            .collect()
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for entry in self.entries.drain(..) {
            unsafe { device.destroy_semaphore(entry.semaphore, None) };
        }
        self.next = 0;
    }
}

/// One binary semaphore per image, signaled by rendering and waited on by
/// presentation.
pub fn create_render_finished(device: &ash::Device, image_count: usize) -> Result<Vec<vk::Semaphore>> {
    let create_info = vk::SemaphoreCreateInfo::builder();
    (0..image_count)
        .map(|_| {
            let semaphore = unsafe { device.create_semaphore(&create_info, None) }
                .map_err(FatalError::api("vkCreateSemaphore"))?;
            Ok(semaphore)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn ring(len: usize) -> AcquireRing {
        AcquireRing {
            entries: (0..len)
                .map(|i| AcquireSemaphore {
                    semaphore: vk::Semaphore::from_raw(i as u64 + 1),
                    state: AcquireState::Idle,
                    release: None,
                })
                .collect(),
            next: 0,
        }
    }

    fn point(value: u64) -> FencePoint {
        FencePoint {
            fence: vk::Semaphore::from_raw(99),
            value,
        }
    }

    #[test]
    fn consumed_semaphores_wait_for_the_following_fence_point() {
        let mut ring = ring(4);
        let (slot, semaphore, release) = ring.next().unwrap();
        assert_eq!(release, None);
        ring.mark_acquired(slot, 2);

        assert_eq!(ring.consume(2).unwrap(), semaphore);
        ring.fence_consumed(point(5));

        for _ in 0..3 {
            let (slot, _, _) = ring.next().unwrap();
            ring.mark_unused(slot);
        }
        let (again, _, release) = ring.next().unwrap();
        assert_eq!(again, slot);
        assert_eq!(release, Some(point(5)));
    }

    #[test]
    fn submitting_an_unacquired_image_is_an_error() {
        let mut ring = ring(4);
        let (slot, _, _) = ring.next().unwrap();
        ring.mark_acquired(slot, 0);
        assert!(ring.consume(1).is_err());
    }

    #[test]
    fn unfenced_reuse_is_refused() {
        let mut ring = ring(2);
        let (slot, _, _) = ring.next().unwrap();
        ring.mark_acquired(slot, 0);
        ring.consume(0).unwrap();
        let (other, _, _) = ring.next().unwrap();
        ring.mark_unused(other);

        assert!(ring.next().is_err());
    }

    #[test]
    fn acquired_but_unsubmitted_semaphores_are_pending() {
        let mut ring = ring(4);
        let (slot, semaphore, _) = ring.next().unwrap();
        ring.mark_acquired(slot, 1);
        assert_eq!(ring.pending(), vec![semaphore]);

        ring.consume(1).unwrap();
        assert!(ring.pending().is_empty());
    }
}
