// Frame slot pool
//
// One recorder per frame in flight, each tagged with the fence value of the
// last submission that used it. `acquire` is the only place the CPU waits for
// the GPU during normal frames.

use anyhow::{bail, Context, Result};

use super::RenderContext;
use crate::backend::GpuBackend;

struct FrameSlot<B: GpuBackend> {
    recorder: B::Recorder,
    fence_value: u64,
}

pub struct FrameSlotPool<B: GpuBackend> {
    slots: Vec<FrameSlot<B>>,
}

impl<B: GpuBackend> FrameSlotPool<B> {
    pub fn new(backend: &mut B, count: usize) -> Result<Self> {
        let slots = (0..count)
            .map(|i| {
                let recorder = backend
                    .create_recorder()
                    .with_context(|| format!("Failed to create recorder for frame slot {}", i))?;
                Ok(FrameSlot {
                    recorder,
                    fence_value: 0,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!("Created {} frame slots", count);
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Wait until the GPU is done with slot `index`, then hand back its
    /// recorder reset and open. A never-used slot (value 0) does not wait.
    pub fn acquire(
        &mut self,
        ctx: &mut RenderContext<B>,
        index: usize,
    ) -> Result<&mut B::Recorder> {
        let count = self.slots.len();
        let Some(slot) = self.slots.get_mut(index) else {
            bail!("frame slot {} out of range (pool has {})", index, count);
        };

        ctx.fences
            .wait_forever(&ctx.backend, slot.fence_value)
            .with_context(|| format!("Failed waiting for frame slot {}", index))?;

        ctx.backend
            .reset_recorder(&mut slot.recorder)
            .with_context(|| format!("Failed to reset recorder of frame slot {}", index))?;

        Ok(&mut slot.recorder)
    }

    /// Remember which fence value covers the submission that just used `index`.
    pub fn record_completion(&mut self, index: usize, value: u64) {
        if let Some(slot) = self.slots.get_mut(index) {
            debug_assert!(value >= slot.fence_value, "fence values went backwards");
            slot.fence_value = value;
        }
    }

    pub fn fence_value(&self, index: usize) -> Option<u64> {
        self.slots.get(index).map(|slot| slot.fence_value)
    }

    /// Force every slot to the highest recorded value.
    ///
    /// Used when image indices are about to be reinterpreted (surface
    /// rebuild): afterwards no slot can look complete while a later
    /// submission is still pending.
    pub fn synchronize_to_latest(&mut self) {
        let latest = self
            .slots
            .iter()
            .map(|slot| slot.fence_value)
            .max()
            .unwrap_or(0);
        for slot in &mut self.slots {
            slot.fence_value = latest;
        }
    }

    pub fn destroy(self, backend: &mut B) {
        for slot in self.slots {
            backend.destroy_recorder(slot.recorder);
        }
    }
}
