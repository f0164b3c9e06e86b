// Upload pipeline
//
// Static data reaches GPU-only buffers through a CPU-writable staging copy.
// Uploads are recording-time operations: they append a copy to the open
// recorder and are only complete once the enclosing submission has been
// waited on. Staging buffers can only be released through a fence wait.

use anyhow::{bail, Context, Result};

use super::FenceSynchronizer;
use crate::backend::{BufferUsage, GpuBackend};

/// Transient upload source. Must stay alive until the copy reading it has
/// completed on the GPU.
#[must_use = "staging buffers must be released after the upload's fence wait"]
pub struct StagingBuffer<B: GpuBackend> {
    /// `None` once released
    buffer: Option<B::Buffer>,
    size: u64,
}

impl<B: GpuBackend> StagingBuffer<B> {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Wait for `value` (the fence covering the copy), then free the buffer.
    pub fn release_after(
        mut self,
        fences: &FenceSynchronizer<B>,
        backend: &mut B,
        value: u64,
    ) -> Result<()> {
        fences
            .wait_forever(backend, value)
            .context("Failed waiting for upload to finish")?;
        self.free(backend);
        Ok(())
    }

    /// Only valid once the fence covering the copy has been waited on.
    fn free(&mut self, backend: &mut B) {
        if let Some(buffer) = self.buffer.take() {
            backend.destroy_buffer(buffer);
        }
    }
}

impl<B: GpuBackend> Drop for StagingBuffer<B> {
    fn drop(&mut self) {
        if self.buffer.is_some() {
            log::error!(
                "Staging buffer of {} bytes dropped without a fence wait, leaking it",
                self.size
            );
        }
    }
}

/// A destination buffer and, when data was supplied, the staging buffer its
/// contents are being copied from.
pub struct UploadedBuffer<B: GpuBackend> {
    pub destination: B::Buffer,
    pub staging: Option<StagingBuffer<B>>,
}

/// Allocate a GPU-only buffer of `element_count * element_size` bytes and,
/// if `data` is given, record a copy of it into the buffer.
///
/// Nothing is submitted or waited on here.
pub fn create_uploaded_buffer<B: GpuBackend>(
    backend: &mut B,
    recorder: &mut B::Recorder,
    data: Option<&[u8]>,
    element_count: usize,
    element_size: usize,
    usage: BufferUsage,
) -> Result<UploadedBuffer<B>> {
    let Some(size) = element_count.checked_mul(element_size) else {
        bail!("{} elements of {} bytes overflow", element_count, element_size);
    };
    if size == 0 {
        bail!("cannot upload an empty {:?} buffer", usage);
    }
    if let Some(data) = data {
        if data.len() != size {
            bail!(
                "upload data is {} bytes, expected {} x {} = {}",
                data.len(),
                element_count,
                element_size,
                size
            );
        }
    }
    let size = size as u64;

    let destination = backend
        .create_device_buffer(size, usage)
        .with_context(|| format!("Failed to allocate {:?} buffer of {} bytes", usage, size))?;

    let staging = match data {
        Some(data) => {
            let buffer = match backend.create_staging_buffer(data) {
                Ok(buffer) => buffer,
                Err(e) => {
                    // No copy was recorded yet, so the GPU never saw it
                    backend.destroy_buffer(destination);
                    return Err(e.context(format!(
                        "Failed to allocate staging buffer of {} bytes",
                        size
                    )));
                }
            };
            backend.record_buffer_copy(recorder, &buffer, &destination, size);
            Some(StagingBuffer {
                buffer: Some(buffer),
                size,
            })
        }
        None => None,
    };

    log::debug!("Recorded {:?} upload of {} bytes", usage, size);
    Ok(UploadedBuffer {
        destination,
        staging,
    })
}

/// Staging buffers of one submission, released together after its fence.
///
/// Destinations of an upload that was abandoned part way can be handed back
/// with `retire`; they are freed along with the staging buffers.
pub struct UploadBatch<B: GpuBackend> {
    staging: Vec<StagingBuffer<B>>,
    retired: Vec<B::Buffer>,
}

impl<B: GpuBackend> Default for UploadBatch<B> {
    fn default() -> Self {
        Self {
            staging: Vec::new(),
            retired: Vec::new(),
        }
    }
}

impl<B: GpuBackend> UploadBatch<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an upload and keep its staging buffer; returns the destination.
    pub fn upload(
        &mut self,
        backend: &mut B,
        recorder: &mut B::Recorder,
        data: &[u8],
        element_count: usize,
        element_size: usize,
        usage: BufferUsage,
    ) -> Result<B::Buffer> {
        let uploaded = create_uploaded_buffer(
            backend,
            recorder,
            Some(data),
            element_count,
            element_size,
            usage,
        )?;
        self.staging.extend(uploaded.staging);
        Ok(uploaded.destination)
    }

    /// Free `destination` together with the staging buffers.
    pub fn retire(&mut self, destination: B::Buffer) {
        self.retired.push(destination);
    }

    pub fn staged_bytes(&self) -> u64 {
        self.staging.iter().map(StagingBuffer::size).sum()
    }

    /// Wait for the submission carrying the copies, then free every staging
    /// buffer.
    pub fn release_after(
        mut self,
        fences: &FenceSynchronizer<B>,
        backend: &mut B,
        value: u64,
    ) -> Result<()> {
        fences
            .wait_forever(backend, value)
            .context("Failed waiting for uploads to finish")?;
        self.free(backend);
        Ok(())
    }

    /// Give up on a batch whose submission may or may not have gone out:
    /// drain `fences`, then free everything the batch holds.
    pub fn discard(mut self, fences: &mut FenceSynchronizer<B>, backend: &mut B) -> Result<()> {
        fences
            .flush(backend)
            .context("Failed to drain abandoned uploads")?;
        log::warn!(
            "Discarding upload batch: {} staging, {} destination buffers",
            self.staging.len(),
            self.retired.len()
        );
        self.free(backend);
        Ok(())
    }

    fn free(&mut self, backend: &mut B) {
        let count = self.staging.len();
        for mut staging in self.staging.drain(..) {
            staging.free(backend);
        }
        for buffer in self.retired.drain(..) {
            backend.destroy_buffer(buffer);
        }
        log::debug!("Released {} staging buffers", count);
    }
}

impl<B: GpuBackend> Drop for UploadBatch<B> {
    fn drop(&mut self) {
        if !self.retired.is_empty() {
            log::error!(
                "{} retired upload destinations dropped without a fence wait, leaking them",
                self.retired.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{Completion, FakeGpu, GpuEvent};
    use crate::backend::Extent;

    #[test]
    fn upload_records_a_copy_into_a_same_sized_destination() {
        let (mut gpu, handle) = FakeGpu::new(Extent::clamped(8, 8), 3, Completion::Immediate);
        let mut fences = FenceSynchronizer::new(&mut gpu).unwrap();
        let mut recorder = gpu.create_recorder().unwrap();
        gpu.reset_recorder(&mut recorder).unwrap();
        let data = [0u8; 48];

        let uploaded =
            create_uploaded_buffer(&mut gpu, &mut recorder, Some(&data), 8, 6, BufferUsage::Index)
                .unwrap();

        let staging = uploaded.staging.unwrap();
        let staging_id = staging.buffer.as_ref().unwrap().id;
        assert_eq!(uploaded.destination.size, 48);
        assert_eq!(staging.size(), 48);
        assert!(handle.events().contains(&GpuEvent::BufferCopied {
            src: staging_id,
            dst: uploaded.destination.id,
            size: 48,
        }));
        // recording only: nothing submitted, signaled or waited on
        assert_eq!(
            handle.count(|e| matches!(
                e,
                GpuEvent::Submitted { .. }
                    | GpuEvent::FenceSignaled { .. }
                    | GpuEvent::FenceWaited { .. }
            )),
            0
        );

        gpu.submit(&mut recorder, None).unwrap();
        let value = fences.signal(&mut gpu).unwrap();
        staging.release_after(&fences, &mut gpu, value).unwrap();
        assert!(handle.events().contains(&GpuEvent::BufferDestroyed(staging_id)));
        gpu.destroy_buffer(uploaded.destination);
    }

    #[test]
    fn failed_staging_allocation_frees_the_destination() {
        let (gpu, handle) = FakeGpu::new(Extent::clamped(8, 8), 3, Completion::Immediate);
        let mut gpu = gpu.with_failing_buffer(2);
        let mut recorder = gpu.create_recorder().unwrap();

        let result = create_uploaded_buffer(
            &mut gpu,
            &mut recorder,
            Some(&[1u8; 16]),
            4,
            4,
            BufferUsage::Vertex,
        );

        assert!(result.is_err());
        let created = handle.count(|e| matches!(e, GpuEvent::BufferCreated { .. }));
        let destroyed = handle.count(|e| matches!(e, GpuEvent::BufferDestroyed(_)));
        assert_eq!((created, destroyed), (1, 1));
        assert_eq!(handle.count(|e| matches!(e, GpuEvent::BufferCopied { .. })), 0);
    }

    #[test]
    fn discarded_batch_drains_then_frees_staging_and_retired_buffers() {
        let (mut gpu, handle) = FakeGpu::new(Extent::clamped(8, 8), 3, Completion::OnWait);
        let mut fences = FenceSynchronizer::new(&mut gpu).unwrap();
        let mut recorder = gpu.create_recorder().unwrap();
        gpu.reset_recorder(&mut recorder).unwrap();

        let mut batch = UploadBatch::new();
        let vertices = batch
            .upload(&mut gpu, &mut recorder, &[1u8; 24], 2, 12, BufferUsage::Vertex)
            .unwrap();
        batch.retire(vertices);
        batch.discard(&mut fences, &mut gpu).unwrap();

        let events = handle.events();
        let waited = events
            .iter()
            .position(|e| matches!(e, GpuEvent::FenceWaited { .. }))
            .unwrap();
        let first_release = events
            .iter()
            .position(|e| matches!(e, GpuEvent::BufferDestroyed(_)))
            .unwrap();
        assert!(waited < first_release);
        assert_eq!(handle.count(|e| matches!(e, GpuEvent::BufferCreated { .. })), 2);
        assert_eq!(handle.count(|e| matches!(e, GpuEvent::BufferDestroyed(_))), 2);
    }

    #[test]
    fn no_data_means_no_staging_and_no_copy() {
        let (mut gpu, handle) = FakeGpu::new(Extent::clamped(8, 8), 3, Completion::Immediate);
        let mut recorder = gpu.create_recorder().unwrap();

        let uploaded =
            create_uploaded_buffer(&mut gpu, &mut recorder, None, 4, 4, BufferUsage::Vertex)
                .unwrap();

        assert!(uploaded.staging.is_none());
        assert_eq!(handle.count(|e| matches!(e, GpuEvent::BufferCopied { .. })), 0);
        assert_eq!(
            handle.count(|e| matches!(e, GpuEvent::BufferCreated { staging: true, .. })),
            0
        );
    }

    #[test]
    fn mismatched_data_length_is_rejected() {
        let (mut gpu, _) = FakeGpu::new(Extent::clamped(8, 8), 3, Completion::Immediate);
        let mut recorder = gpu.create_recorder().unwrap();
        let data = [0u8; 10];

        let result =
            create_uploaded_buffer(&mut gpu, &mut recorder, Some(&data), 4, 4, BufferUsage::Vertex);
        assert!(result.is_err());
    }

    #[test]
    fn staging_is_released_only_after_the_fence_wait() {
        let (mut gpu, handle) = FakeGpu::new(Extent::clamped(8, 8), 3, Completion::OnWait);
        let mut fences = FenceSynchronizer::new(&mut gpu).unwrap();
        let mut recorder = gpu.create_recorder().unwrap();
        gpu.reset_recorder(&mut recorder).unwrap();

        let mut batch = UploadBatch::new();
        let vertices = batch
            .upload(&mut gpu, &mut recorder, &[1u8; 24], 2, 12, BufferUsage::Vertex)
            .unwrap();
        let indices = batch
            .upload(&mut gpu, &mut recorder, &[2u8; 12], 6, 2, BufferUsage::Index)
            .unwrap();
        assert_eq!(batch.staged_bytes(), 36);

        gpu.submit(&mut recorder, None).unwrap();
        let value = fences.signal(&mut gpu).unwrap();
        batch.release_after(&fences, &mut gpu, value).unwrap();

        let events = handle.events();
        let waited = events
            .iter()
            .position(|e| *e == GpuEvent::FenceWaited { fence: 0, value })
            .unwrap();
        let first_release = events
            .iter()
            .position(|e| matches!(e, GpuEvent::BufferDestroyed(_)))
            .unwrap();
        assert!(waited < first_release);
        assert_eq!(handle.count(|e| matches!(e, GpuEvent::BufferDestroyed(_))), 2);

        gpu.destroy_buffer(vertices);
        gpu.destroy_buffer(indices);
    }
}
