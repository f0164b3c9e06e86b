// Frame engine
//
// Fence synchronizer, frame slot pool, upload pipeline and presentation
// surface manager. Each component is generic over the GPU backend and gets
// the shared `RenderContext` passed in explicitly.

pub mod fence;
pub mod slots;
pub mod surface;
pub mod upload;

use anyhow::Result;

use crate::backend::GpuBackend;

pub use fence::FenceSynchronizer;
pub use slots::FrameSlotPool;
pub use surface::PresentationSurface;
pub use upload::{create_uploaded_buffer, StagingBuffer, UploadBatch, UploadedBuffer};

/// The backend plus the frame fence, shared by every component.
///
/// A single thread drives all of it, so there is no locking: whoever holds
/// `&mut RenderContext` is the only writer of the queue and the fence.
pub struct RenderContext<B: GpuBackend> {
    pub backend: B,
    pub fences: FenceSynchronizer<B>,
}

impl<B: GpuBackend> RenderContext<B> {
    pub fn new(mut backend: B) -> Result<Self> {
        let fences = FenceSynchronizer::new(&mut backend)?;
        Ok(Self { backend, fences })
    }

    pub fn signal(&mut self) -> Result<u64> {
        self.fences.signal(&mut self.backend)
    }

    pub fn flush(&mut self) -> Result<u64> {
        self.fences.flush(&mut self.backend)
    }

    /// Drain the GPU and release the fence. Hands the backend back so the
    /// caller decides when the device goes away.
    pub fn shutdown(mut self) -> Result<B> {
        self.fences.flush(&mut self.backend)?;
        let Self {
            mut backend,
            fences,
        } = self;
        fences.destroy(&mut backend);
        Ok(backend)
    }
}
