// Presentation surface manager
//
// Owns the presentation image references, one render target per image and
// the depth buffer. Resizing is a full barrier: nothing about the images
// changes until the fence synchronizer has drained the queue.

use anyhow::{bail, Context, Result};

use super::{FrameSlotPool, RenderContext};
use crate::backend::{Acquired, Extent, GpuBackend, PresentMode, Presented};
use crate::display::{FullscreenChange, FullscreenState, WindowPlacement};
use crate::error::FatalError;

pub struct PresentationSurface<B: GpuBackend> {
    images: Vec<B::Image>,
    render_targets: Vec<B::RenderTarget>,
    depth: Option<B::DepthBuffer>,
    /// Last size asked for, already clamped; drives the same-size check
    requested: Extent,
    /// Size the backend actually gave us
    extent: Extent,
    current_index: usize,
    mode: PresentMode,
    fullscreen: FullscreenState,
}

impl<B: GpuBackend> PresentationSurface<B> {
    /// Take over the chain the backend created for the window: reference its
    /// images, build render targets and a depth buffer, pick the first image.
    pub fn new(
        ctx: &mut RenderContext<B>,
        requested: Extent,
        mode: PresentMode,
        fullscreen: bool,
    ) -> Result<Self> {
        let backend = &mut ctx.backend;
        let extent = backend.surface_extent();

        let images = backend
            .surface_images()
            .context("Failed to query presentation images")?;
        if images.is_empty() {
            return Err(FatalError::Surface("presentation chain has no images".into()).into());
        }
        let render_targets = create_render_targets(backend, &images)?;
        let depth = backend
            .create_depth_buffer(extent)
            .context("Failed to create depth buffer")?;

        let mut surface = Self {
            images,
            render_targets,
            depth: Some(depth),
            requested,
            extent,
            current_index: 0,
            mode,
            fullscreen: FullscreenState::new(fullscreen),
        };
        surface.current_index = surface.acquire(ctx)?.context("New chain reported stale")?;

        log::info!(
            "Presentation surface ready: {} images, {}x{}",
            surface.images.len(),
            extent.width,
            extent.height
        );
        Ok(surface)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn mode(&self) -> PresentMode {
        self.mode
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen.is_fullscreen()
    }

    pub fn current_image(&self) -> &B::Image {
        &self.images[self.current_index]
    }

    pub fn current_render_target(&self) -> &B::RenderTarget {
        &self.render_targets[self.current_index]
    }

    pub fn depth_buffer(&self) -> Result<&B::DepthBuffer> {
        self.depth.as_ref().context("Depth buffer missing")
    }

    /// Present the current image with `mode` and return the next active index.
    ///
    /// The next index comes from the presentation layer and need not be the
    /// current one plus one. A stale chain, or a mode different from the one
    /// the chain was built with, goes through `rebuild` first.
    pub fn present(
        &mut self,
        ctx: &mut RenderContext<B>,
        slots: &mut FrameSlotPool<B>,
        mode: PresentMode,
    ) -> Result<usize> {
        let presented = ctx
            .backend
            .present(self.current_index, mode)
            .context("Present failed")?;

        if mode != self.mode {
            log::info!(
                "Present mode changed (sync interval {}, tearing {})",
                mode.sync_interval,
                mode.allow_tearing
            );
            self.mode = mode;
            self.rebuild(ctx, slots)?;
        } else if presented == Presented::Stale {
            log::info!("Presentation chain is stale, rebuilding");
            self.rebuild(ctx, slots)?;
        } else {
            match self.acquire(ctx)? {
                Some(index) => self.current_index = index,
                None => {
                    log::info!("Acquire reported a stale chain, rebuilding");
                    self.rebuild(ctx, slots)?;
                }
            }
        }
        Ok(self.current_index)
    }

    /// Resize to `width` x `height`, each clamped to at least 1.
    ///
    /// Returns `false` without touching anything when the clamped size equals
    /// the last requested one.
    pub fn resize(
        &mut self,
        ctx: &mut RenderContext<B>,
        slots: &mut FrameSlotPool<B>,
        width: u32,
        height: u32,
    ) -> Result<bool> {
        let extent = Extent::clamped(width, height);
        if extent == self.requested {
            return Ok(false);
        }
        log::info!("Resizing surface to {}x{}", extent.width, extent.height);
        self.requested = extent;
        self.rebuild(ctx, slots)?;
        Ok(true)
    }

    /// Rebuild the chain at the requested size and current mode.
    pub fn rebuild(
        &mut self,
        ctx: &mut RenderContext<B>,
        slots: &mut FrameSlotPool<B>,
    ) -> Result<()> {
        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Drain. Nothing below may run while the GPU still reads or
        // writes any of the images.
        // ─────────────────────────────────────────────────────────────────────
        ctx.flush().context("Failed to drain GPU before rebuild")?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Drop every image reference
        // ─────────────────────────────────────────────────────────────────────
        let image_count = self.images.len();
        for target in self.render_targets.drain(..) {
            ctx.backend.destroy_render_target(target);
        }
        for image in self.images.drain(..) {
            ctx.backend.release_image(image);
        }

        // Indices are about to be reinterpreted
        slots.synchronize_to_latest();

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Resize in place (same image count and format)
        // ─────────────────────────────────────────────────────────────────────
        ctx.backend
            .resize_surface(self.requested, self.mode)
            .context("Failed to resize presentation chain")?;
        self.images = ctx
            .backend
            .surface_images()
            .context("Failed to query presentation images")?;
        if self.images.len() != image_count {
            return Err(FatalError::Surface(format!(
                "image count changed from {} to {} on resize",
                image_count,
                self.images.len()
            ))
            .into());
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: The active image may differ from before
        // ─────────────────────────────────────────────────────────────────────
        self.current_index = self
            .acquire(ctx)?
            .context("Presentation chain still stale after rebuild")?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: Render targets
        // ─────────────────────────────────────────────────────────────────────
        self.render_targets = create_render_targets(&mut ctx.backend, &self.images)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 6: Size-dependent buffers
        // ─────────────────────────────────────────────────────────────────────
        self.extent = ctx.backend.surface_extent();
        if let Some(depth) = self.depth.take() {
            ctx.backend.destroy_depth_buffer(depth);
        }
        self.depth = Some(
            ctx.backend
                .create_depth_buffer(self.extent)
                .context("Failed to recreate depth buffer")?,
        );

        log::info!(
            "Rebuilt presentation chain: {}x{}, active image {}",
            self.extent.width,
            self.extent.height,
            self.current_index
        );
        Ok(())
    }

    /// Record the fullscreen request. GPU resources are untouched; the window
    /// layer applies the change and the geometry change comes back as a resize.
    pub fn set_fullscreen(&mut self, enable: bool, current: WindowPlacement) -> FullscreenChange {
        let change = self.fullscreen.set(enable, current);
        match change {
            FullscreenChange::Unchanged => {}
            FullscreenChange::Entered => log::info!("Entering fullscreen"),
            FullscreenChange::Left { .. } => log::info!("Leaving fullscreen"),
        }
        change
    }

    /// Release everything. The queue must already be drained.
    pub fn destroy(mut self, backend: &mut B) {
        for target in self.render_targets.drain(..) {
            backend.destroy_render_target(target);
        }
        for image in self.images.drain(..) {
            backend.release_image(image);
        }
        if let Some(depth) = self.depth.take() {
            backend.destroy_depth_buffer(depth);
        }
    }

    /// `None` when the chain is stale.
    fn acquire(&self, ctx: &mut RenderContext<B>) -> Result<Option<usize>> {
        match ctx
            .backend
            .acquire_next_image()
            .context("Failed to acquire next image")?
        {
            Acquired::Image(index) if index < self.images.len() => Ok(Some(index)),
            Acquired::Image(index) => bail!(
                "acquired image {} but the chain has {}",
                index,
                self.images.len()
            ),
            Acquired::Stale => Ok(None),
        }
    }
}

fn create_render_targets<B: GpuBackend>(
    backend: &mut B,
    images: &[B::Image],
) -> Result<Vec<B::RenderTarget>> {
    images
        .iter()
        .enumerate()
        .map(|(i, image)| {
            backend
                .create_render_target(image)
                .with_context(|| format!("Failed to create render target {}", i))
        })
        .collect()
}
