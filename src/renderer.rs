// =============================================================================
// RENDERER - One tick per frame request
// =============================================================================
//
// FRAME FLOW:
// 1. Update: advance the animation
// 2. Acquire the slot of the active image (the only place the CPU may block)
// 3. Record transition, clear, draw, transition
// 4. Submit
// 5. Present, which hands back the next active image
// 6. Signal the fence and tag the slot we just used with the value
//
// Startup uploads run on their own one-shot fence and are drained before the
// first frame, so the frame fence is untouched until tick 1 signals value 1.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::backend::{
    BufferUsage, ClearValues, DrawIndexed, Extent, GpuBackend, PresentMode, ShaderSet,
};
use crate::config::Config;
use crate::display::{FullscreenChange, WindowPlacement};
use crate::frame::{FenceSynchronizer, FrameSlotPool, PresentationSurface, RenderContext, UploadBatch};
use crate::scene::{Animation, SceneDescription, Vertex};

/// Startup parameters handed over by the window layer.
#[derive(Debug, Clone, PartialEq)]
pub struct RendererSettings {
    /// Expected chain length; the backend's actual image count wins
    pub frames_in_flight: usize,
    pub extent: Extent,
    pub vsync: bool,
    pub allow_tearing: bool,
    pub fullscreen: bool,
    pub clear_color: [f32; 4],
}

impl RendererSettings {
    pub fn from_config(config: &Config, width: u32, height: u32) -> Self {
        Self {
            frames_in_flight: config.frames_in_flight(),
            extent: Extent::clamped(width, height),
            vsync: config.graphics.vsync,
            allow_tearing: config.graphics.allow_tearing,
            fullscreen: config.window.fullscreen,
            clear_color: config.graphics.clear_color,
        }
    }
}

/// Where the current tick is. Only observable from outside when a tick
/// failed part way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    Idle,
    Recording,
    Submitted,
    Presented,
}

/// GPU objects prepared once at startup and read by every frame.
struct SceneResources<B: GpuBackend> {
    vertex_buffer: B::Buffer,
    index_buffer: B::Buffer,
    index_count: u32,
    pipeline: B::Pipeline,
}

pub struct Renderer<B: GpuBackend> {
    ctx: RenderContext<B>,
    slots: FrameSlotPool<B>,
    surface: PresentationSurface<B>,
    scene: SceneResources<B>,
    animation: Animation,
    clear_color: [f32; 4],
    vsync: bool,
    allow_tearing: bool,
    phase: TickPhase,
}

impl<B: GpuBackend> Renderer<B> {
    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    pub fn initialize(
        backend: B,
        settings: RendererSettings,
        scene: &SceneDescription<'_>,
        shaders: &ShaderSet,
    ) -> Result<Self> {
        log::info!("Initializing renderer...");
        let mut ctx = RenderContext::new(backend)?;
        let mode = PresentMode::new(
            settings.vsync,
            settings.allow_tearing && ctx.backend.supports_tearing(),
        );

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Presentation chain, render targets, depth buffer
        // ─────────────────────────────────────────────────────────────────────
        let surface = PresentationSurface::new(&mut ctx, settings.extent, mode, settings.fullscreen)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: One frame slot per image
        // ─────────────────────────────────────────────────────────────────────
        if surface.image_count() != settings.frames_in_flight {
            log::warn!(
                "Requested {} frames in flight, chain has {} images",
                settings.frames_in_flight,
                surface.image_count()
            );
        }
        let mut slots = FrameSlotPool::new(&mut ctx.backend, surface.image_count())?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Geometry upload on a dedicated fence
        // ─────────────────────────────────────────────────────────────────────
        let (vertex_buffer, index_buffer) =
            upload_geometry(&mut ctx, &mut slots, surface.current_index(), scene)
                .context("Failed to upload scene geometry")?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Pipeline
        // ─────────────────────────────────────────────────────────────────────
        let pipeline = ctx
            .backend
            .create_pipeline(shaders)
            .context("Failed to create graphics pipeline")?;

        log::info!(
            "Renderer initialized: {} frame slots, {} indices",
            slots.len(),
            scene.indices.len()
        );
        Ok(Self {
            ctx,
            slots,
            surface,
            scene: SceneResources {
                vertex_buffer,
                index_buffer,
                index_count: scene.indices.len() as u32,
                pipeline,
            },
            animation: Animation::new(),
            clear_color: settings.clear_color,
            vsync: settings.vsync,
            allow_tearing: settings.allow_tearing,
            phase: TickPhase::Idle,
        })
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Update the animation by `delta` and render one frame.
    pub fn tick(&mut self, delta: Duration) -> Result<()> {
        self.animation.update(delta);
        let mvp = self
            .animation
            .model_view_projection(self.surface.extent().aspect_ratio());

        // Idle -> Recording
        let index = self.surface.current_index();
        self.phase = TickPhase::Recording;
        let recorder = self.slots.acquire(&mut self.ctx, index)?;

        let backend = &mut self.ctx.backend;
        let depth = self.surface.depth_buffer()?;
        backend.transition_to_render_target(recorder, self.surface.current_image(), depth);
        backend.begin_pass(
            recorder,
            self.surface.current_render_target(),
            depth,
            self.surface.extent(),
            ClearValues {
                color: self.clear_color,
                depth: 1.0,
            },
        );
        backend.draw_indexed(
            recorder,
            &DrawIndexed {
                pipeline: &self.scene.pipeline,
                vertex_buffer: &self.scene.vertex_buffer,
                index_buffer: &self.scene.index_buffer,
                index_count: self.scene.index_count,
                constants: bytemuck::bytes_of(&mvp),
            },
        );
        backend.end_pass(recorder);
        backend.transition_to_present(recorder, self.surface.current_image());

        // Recording -> Submitted
        backend
            .submit(recorder, Some(index))
            .with_context(|| format!("Failed to submit frame for image {}", index))?;
        self.phase = TickPhase::Submitted;

        // Submitted -> Presented
        let mode = self.present_mode();
        let next = self.surface.present(&mut self.ctx, &mut self.slots, mode)?;
        self.phase = TickPhase::Presented;

        let value = self.ctx.signal()?;
        self.slots.record_completion(index, value);
        log::trace!("Frame on image {} tagged {}, next image {}", index, value, next);

        // Presented -> Idle
        self.phase = TickPhase::Idle;
        Ok(())
    }

    /// Returns `false` when the size (after clamping to 1x1) is unchanged.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<bool> {
        self.surface.resize(&mut self.ctx, &mut self.slots, width, height)
    }

    pub fn set_fullscreen(&mut self, enable: bool, current: WindowPlacement) -> FullscreenChange {
        self.surface.set_fullscreen(enable, current)
    }

    pub fn is_fullscreen(&self) -> bool {
        self.surface.is_fullscreen()
    }

    /// Flip vsync; the next present switches modes. Returns the new setting.
    pub fn toggle_vsync(&mut self) -> bool {
        self.vsync = !self.vsync;
        log::info!("VSync {}", if self.vsync { "on" } else { "off" });
        self.vsync
    }

    pub fn present_mode(&self) -> PresentMode {
        PresentMode::new(
            self.vsync,
            self.allow_tearing && self.ctx.backend.supports_tearing(),
        )
    }

    pub fn phase(&self) -> TickPhase {
        self.phase
    }

    pub fn extent(&self) -> Extent {
        self.surface.extent()
    }

    pub fn current_image_index(&self) -> usize {
        self.surface.current_index()
    }

    pub fn slot_fence_value(&self, index: usize) -> Option<u64> {
        self.slots.fence_value(index)
    }

    // =========================================================================
    // CLEANUP
    // =========================================================================

    /// Drain the GPU, release every resource and the fence, and return the
    /// backend.
    pub fn shutdown(self) -> Result<B> {
        log::info!("Shutting down renderer...");
        let Self {
            mut ctx,
            slots,
            surface,
            scene,
            ..
        } = self;

        ctx.flush().context("Failed to drain GPU on shutdown")?;

        let backend = &mut ctx.backend;
        backend.destroy_pipeline(scene.pipeline);
        backend.destroy_buffer(scene.vertex_buffer);
        backend.destroy_buffer(scene.index_buffer);
        slots.destroy(backend);
        surface.destroy(backend);

        let backend = ctx.shutdown()?;
        log::info!("Renderer shut down");
        Ok(backend)
    }
}

/// Record the vertex and index copies into the active slot's recorder, submit
/// them, wait on a one-shot fence and release the staging buffers.
///
/// On failure the upload fence is drained and every buffer created so far is
/// freed before the error is returned.
fn upload_geometry<B: GpuBackend>(
    ctx: &mut RenderContext<B>,
    slots: &mut FrameSlotPool<B>,
    index: usize,
    scene: &SceneDescription<'_>,
) -> Result<(B::Buffer, B::Buffer)> {
    let mut upload_fence = FenceSynchronizer::new(&mut ctx.backend)?;
    let recorder = slots.acquire(ctx, index)?;
    let backend = &mut ctx.backend;
    let mut batch = UploadBatch::new();

    let (vertices, indices) = match record_geometry(backend, recorder, &mut batch, scene) {
        Ok(geometry) => geometry,
        Err(e) => return Err(abandon_upload(batch, upload_fence, backend, e)),
    };
    log::info!("Uploading {} bytes of geometry", batch.staged_bytes());

    let submitted = backend
        .submit(recorder, None)
        .context("Failed to submit geometry upload")
        .and_then(|()| upload_fence.signal(backend));
    let value = match submitted {
        Ok(value) => value,
        Err(e) => {
            batch.retire(vertices);
            batch.retire(indices);
            return Err(abandon_upload(batch, upload_fence, backend, e));
        }
    };

    batch.release_after(&upload_fence, backend, value)?;
    upload_fence.destroy(backend);
    Ok((vertices, indices))
}

fn record_geometry<B: GpuBackend>(
    backend: &mut B,
    recorder: &mut B::Recorder,
    batch: &mut UploadBatch<B>,
    scene: &SceneDescription<'_>,
) -> Result<(B::Buffer, B::Buffer)> {
    let vertices = batch.upload(
        backend,
        recorder,
        bytemuck::cast_slice(scene.vertices),
        scene.vertices.len(),
        std::mem::size_of::<Vertex>(),
        BufferUsage::Vertex,
    )?;
    let indices = batch.upload(
        backend,
        recorder,
        bytemuck::cast_slice(scene.indices),
        scene.indices.len(),
        std::mem::size_of::<u16>(),
        BufferUsage::Index,
    );
    match indices {
        Ok(indices) => Ok((vertices, indices)),
        Err(e) => {
            batch.retire(vertices);
            Err(e)
        }
    }
}

/// Drain, free the batch and the fence, and hand back `error`.
fn abandon_upload<B: GpuBackend>(
    batch: UploadBatch<B>,
    mut upload_fence: FenceSynchronizer<B>,
    backend: &mut B,
    error: anyhow::Error,
) -> anyhow::Error {
    if let Err(e) = batch.discard(&mut upload_fence, backend) {
        log::error!("Failed to clean up geometry upload: {:#}", e);
    }
    upload_fence.destroy(backend);
    error
}
