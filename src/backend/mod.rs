// Backend module - GPU abstraction layer
//
// The frame engine talks to the GPU only through `GpuBackend`. The Vulkan
// implementation is a thin wrapper around ash; tests drive the engine with a
// scripted fake that logs every call.

pub mod buffer;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

#[cfg(test)]
pub mod fake;

use anyhow::Result;
use std::time::Duration;

pub use device::VulkanDevice;
pub use shader::ShaderSet;
pub use swapchain::Swapchain;
pub use vulkan::VulkanBackend;

/// Width and height of a presentation surface or depth buffer, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    /// Clamp each dimension to at least one pixel.
    pub fn clamped(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

/// How a presented image is synchronized with the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentMode {
    /// 0 presents immediately, 1 waits for the next vertical blank
    pub sync_interval: u32,
    /// Allow tearing when not synchronized (variable refresh displays)
    pub allow_tearing: bool,
}

impl PresentMode {
    /// Mode for the given vsync setting; tearing only ever applies without vsync.
    pub fn new(vsync: bool, tearing_supported: bool) -> Self {
        Self {
            sync_interval: u32::from(vsync),
            allow_tearing: tearing_supported && !vsync,
        }
    }
}

/// What the buffer will be bound as once uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Index,
}

/// Result of asking the presentation layer for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Image(usize),
    /// The chain no longer matches the surface and must be rebuilt
    Stale,
}

/// Result of a present call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presented {
    Done,
    /// Presented (or dropped), but the chain should be rebuilt
    Stale,
}

/// Values written by the clear at the start of the pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearValues {
    pub color: [f32; 4],
    pub depth: f32,
}

/// Everything one indexed draw needs besides the pass itself.
pub struct DrawIndexed<'a, B: GpuBackend + ?Sized> {
    pub pipeline: &'a B::Pipeline,
    pub vertex_buffer: &'a B::Buffer,
    pub index_buffer: &'a B::Buffer,
    pub index_count: u32,
    /// Vertex-stage constants (the model-view-projection matrix)
    pub constants: &'a [u8],
}

/// GPU operations used by the frame engine.
///
/// All calls come from the single render thread. Recording calls only append
/// to the recorder; nothing reaches the GPU until `submit`.
pub trait GpuBackend {
    /// Monotonic completion counter written by the queue
    type Fence;
    /// Recording buffer with its own backing memory
    type Recorder;
    type Buffer;
    /// Reference to a presentation image (the chain owns the memory)
    type Image;
    type RenderTarget;
    type DepthBuffer;
    type Pipeline;

    // ─────────────────────────────────────────────────────────────────────
    // Fences
    // ─────────────────────────────────────────────────────────────────────

    fn create_fence(&mut self) -> Result<Self::Fence>;

    /// Have the queue write `value` once everything submitted so far is done.
    fn signal_fence(&mut self, fence: &Self::Fence, value: u64) -> Result<()>;

    fn completed_value(&self, fence: &Self::Fence) -> Result<u64>;

    /// Block until the fence reaches `value`. `None` waits forever.
    /// Returns `false` if the timeout elapsed first.
    fn wait_fence(&self, fence: &Self::Fence, value: u64, timeout: Option<Duration>)
        -> Result<bool>;

    fn destroy_fence(&mut self, fence: Self::Fence);

    // ─────────────────────────────────────────────────────────────────────
    // Recording
    // ─────────────────────────────────────────────────────────────────────

    fn create_recorder(&mut self) -> Result<Self::Recorder>;

    /// Discard previous contents and open the recorder for new commands.
    /// The caller guarantees the GPU is done with the old contents.
    fn reset_recorder(&mut self, recorder: &mut Self::Recorder) -> Result<()>;

    /// Close the recorder and submit it to the queue. With `present_image`,
    /// the work is ordered after that image was acquired and before it is
    /// presented.
    fn submit(&mut self, recorder: &mut Self::Recorder, present_image: Option<usize>)
        -> Result<()>;

    fn destroy_recorder(&mut self, recorder: Self::Recorder);

    // ─────────────────────────────────────────────────────────────────────
    // Buffers
    // ─────────────────────────────────────────────────────────────────────

    /// GPU-only buffer; never written by the CPU.
    fn create_device_buffer(&mut self, size: u64, usage: BufferUsage) -> Result<Self::Buffer>;

    /// CPU-writable buffer holding a copy of `contents`.
    fn create_staging_buffer(&mut self, contents: &[u8]) -> Result<Self::Buffer>;

    fn record_buffer_copy(
        &mut self,
        recorder: &mut Self::Recorder,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        size: u64,
    );

    fn destroy_buffer(&mut self, buffer: Self::Buffer);

    // ─────────────────────────────────────────────────────────────────────
    // Presentation
    // ─────────────────────────────────────────────────────────────────────

    fn surface_extent(&self) -> Extent;

    /// Whether unsynchronized presents may tear
    fn supports_tearing(&self) -> bool;

    fn surface_images(&mut self) -> Result<Vec<Self::Image>>;

    fn release_image(&mut self, image: Self::Image);

    /// Which image the next frame renders into. May not be the one after the
    /// last presented image.
    fn acquire_next_image(&mut self) -> Result<Acquired>;

    fn present(&mut self, image_index: usize, mode: PresentMode) -> Result<Presented>;

    /// Resize the chain in place, keeping image count and format. All image
    /// references must have been released and the queue drained.
    fn resize_surface(&mut self, extent: Extent, mode: PresentMode) -> Result<()>;

    fn create_render_target(&mut self, image: &Self::Image) -> Result<Self::RenderTarget>;

    fn destroy_render_target(&mut self, target: Self::RenderTarget);

    fn create_depth_buffer(&mut self, extent: Extent) -> Result<Self::DepthBuffer>;

    fn destroy_depth_buffer(&mut self, depth: Self::DepthBuffer);

    // ─────────────────────────────────────────────────────────────────────
    // Pipeline and draw recording
    // ─────────────────────────────────────────────────────────────────────

    fn create_pipeline(&mut self, shaders: &ShaderSet) -> Result<Self::Pipeline>;

    fn destroy_pipeline(&mut self, pipeline: Self::Pipeline);

    fn transition_to_render_target(
        &mut self,
        recorder: &mut Self::Recorder,
        image: &Self::Image,
        depth: &Self::DepthBuffer,
    );

    /// Begin rendering into the target, clearing color and depth.
    fn begin_pass(
        &mut self,
        recorder: &mut Self::Recorder,
        target: &Self::RenderTarget,
        depth: &Self::DepthBuffer,
        extent: Extent,
        clear: ClearValues,
    );

    fn draw_indexed(&mut self, recorder: &mut Self::Recorder, draw: &DrawIndexed<'_, Self>);

    fn end_pass(&mut self, recorder: &mut Self::Recorder);

    fn transition_to_present(&mut self, recorder: &mut Self::Recorder, image: &Self::Image);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_extent_clamps_to_one_pixel() {
        assert_eq!(Extent::clamped(0, 0), Extent { width: 1, height: 1 });
        assert_eq!(Extent::clamped(0, 720), Extent { width: 1, height: 720 });
    }

    #[test]
    fn vsync_never_tears() {
        let mode = PresentMode::new(true, true);
        assert_eq!(mode.sync_interval, 1);
        assert!(!mode.allow_tearing);
    }

    #[test]
    fn tearing_requires_support() {
        assert!(PresentMode::new(false, true).allow_tearing);
        assert!(!PresentMode::new(false, false).allow_tearing);
        assert_eq!(PresentMode::new(false, false).sync_interval, 0);
    }
}
