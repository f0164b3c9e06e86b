// =============================================================================
// VULKAN BACKEND - GpuBackend on top of ash
// =============================================================================
//
// SYNCHRONIZATION MODEL:
// ┌──────────────────────────────────────────────────────────────────────────┐
// │  acquire ──(ring semaphore)──> frame submit ──(render_finished[i])──>   │
// │  present ──> empty submit signaling the timeline fence                   │
// └──────────────────────────────────────────────────────────────────────────┘
//
// The frame fence is a timeline semaphore. Signals go out as empty submits so
// the value covers everything queued before it, including the frame that
// waited on an acquire semaphore; that is when the semaphore may be reused.

use anyhow::{Context, Result};
use ash::vk;
use std::time::Duration;

use super::buffer::{self, AllocatedBuffer, DepthImage};
use super::pipeline::{self, GraphicsPipeline, PUSH_CONSTANT_SIZE};
use super::swapchain::{self, ChainStatus, Swapchain};
use super::sync::{self, AcquireRing, FencePoint, TimelineFence};
use super::{
    Acquired, BufferUsage, ClearValues, DrawIndexed, Extent, GpuBackend, PresentMode, Presented,
    ShaderSet, VulkanDevice,
};
use crate::error::FatalError;

/// Command pool with the single primary buffer recorded from it
pub struct Recorder {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

/// One image of the presentation chain
#[derive(Debug, Clone, Copy)]
pub struct SurfaceImage {
    pub index: usize,
    pub image: vk::Image,
}

pub struct VulkanBackend {
    swapchain: Swapchain,
    acquire_ring: AcquireRing,
    render_finished: Vec<vk::Semaphore>,
    /// Last acquire was suboptimal; report the next present as stale
    stale: bool,
    tearing: bool,
    // Dropped last
    device: VulkanDevice,
}

impl VulkanBackend {
    /// Build the presentation chain for the device's surface.
    pub fn new(
        device: VulkanDevice,
        extent: Extent,
        image_count: usize,
        vsync: bool,
        allow_tearing: bool,
    ) -> Result<Self> {
        let tearing = swapchain::supports_tearing(&device)?;
        let mode = PresentMode::new(vsync, allow_tearing && tearing);

        let swapchain = Swapchain::new(
            &device,
            extent,
            image_count as u32,
            mode,
            vk::SwapchainKHR::null(),
        )?;
        let acquire_ring = AcquireRing::new(&device.device, swapchain.images.len())?;
        let render_finished = sync::create_render_finished(&device.device, swapchain.images.len())?;

        Ok(Self {
            swapchain,
            acquire_ring,
            render_finished,
            stale: false,
            tearing,
            device,
        })
    }

    fn destroy_semaphores(&mut self) {
        self.acquire_ring.destroy(&self.device.device);
        for semaphore in self.render_finished.drain(..) {
            unsafe { self.device.device.destroy_semaphore(semaphore, None) };
        }
    }

    /// Acquire semaphores that were signaled but never waited on must be
    /// consumed before they can be destroyed.
    fn drain_pending_acquires(&mut self) -> Result<()> {
        let pending = self.acquire_ring.pending();
        if !pending.is_empty() {
            let stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; pending.len()];
            let submit_info = vk::SubmitInfo::builder()
                .wait_semaphores(&pending)
                .wait_dst_stage_mask(&stages)
                .build();
            unsafe {
                self.device.device.queue_submit(
                    self.device.graphics_queue,
                    &[submit_info],
                    vk::Fence::null(),
                )
            }
            .map_err(FatalError::api("vkQueueSubmit"))?;
        }
        self.device.wait_idle()
    }

    fn image_barrier(
        image: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> vk::ImageMemoryBarrier {
        vk::ImageMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build()
    }
}

impl GpuBackend for VulkanBackend {
    type Fence = TimelineFence;
    type Recorder = Recorder;
    type Buffer = AllocatedBuffer;
    type Image = SurfaceImage;
    type RenderTarget = vk::ImageView;
    type DepthBuffer = DepthImage;
    type Pipeline = GraphicsPipeline;

    // =========================================================================
    // FENCES
    // =========================================================================

    fn create_fence(&mut self) -> Result<TimelineFence> {
        TimelineFence::new(&self.device.device)
    }

    fn signal_fence(&mut self, fence: &TimelineFence, value: u64) -> Result<()> {
        let signal_semaphores = [fence.semaphore];
        let signal_values = [value];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::builder()
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info)
            .build();

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info],
                vk::Fence::null(),
            )
        }
        .map_err(FatalError::api("vkQueueSubmit"))?;

        self.acquire_ring.fence_consumed(FencePoint {
            fence: fence.semaphore,
            value,
        });
        Ok(())
    }

    fn completed_value(&self, fence: &TimelineFence) -> Result<u64> {
        fence.value(&self.device.device)
    }

    fn wait_fence(&self, fence: &TimelineFence, value: u64, timeout: Option<Duration>) -> Result<bool> {
        fence.wait(&self.device.device, value, timeout)
    }

    fn destroy_fence(&mut self, fence: TimelineFence) {
        fence.destroy(&self.device.device);
    }

    // =========================================================================
    // RECORDING
    // =========================================================================

    fn create_recorder(&mut self) -> Result<Recorder> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.device.graphics_queue_family)
            // TRANSIENT: contents are rerecorded every frame
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let pool = unsafe { self.device.device.create_command_pool(&pool_info, None) }
            .map_err(FatalError::api("vkCreateCommandPool"))?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        match unsafe { self.device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => Ok(Recorder {
                pool,
                buffer: buffers[0],
            }),
            Err(e) => {
                unsafe { self.device.device.destroy_command_pool(pool, None) };
                Err(FatalError::api("vkAllocateCommandBuffers")(e).into())
            }
        }
    }

    fn reset_recorder(&mut self, recorder: &mut Recorder) -> Result<()> {
        let device = &self.device.device;
        unsafe { device.reset_command_pool(recorder.pool, vk::CommandPoolResetFlags::empty()) }
            .map_err(FatalError::api("vkResetCommandPool"))?;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(recorder.buffer, &begin_info) }
            .map_err(FatalError::api("vkBeginCommandBuffer"))?;
        Ok(())
    }

    fn submit(&mut self, recorder: &mut Recorder, present_image: Option<usize>) -> Result<()> {
        unsafe { self.device.device.end_command_buffer(recorder.buffer) }
            .map_err(FatalError::api("vkEndCommandBuffer"))?;

        let command_buffers = [recorder.buffer];
        let mut wait_semaphores = Vec::with_capacity(1);
        let mut signal_semaphores = Vec::with_capacity(1);
        if let Some(image) = present_image {
            wait_semaphores.push(self.acquire_ring.consume(image)?);
            signal_semaphores.push(
                *self
                    .render_finished
                    .get(image)
                    .with_context(|| format!("No render-finished semaphore for image {}", image))?,
            );
        }
        // Color writes wait for the image; everything before may run early
        let wait_stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; wait_semaphores.len()];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info],
                vk::Fence::null(),
            )
        }
        .map_err(FatalError::api("vkQueueSubmit"))?;
        Ok(())
    }

    fn destroy_recorder(&mut self, recorder: Recorder) {
        // Frees the command buffer with it
        unsafe { self.device.device.destroy_command_pool(recorder.pool, None) };
    }

    // =========================================================================
    // BUFFERS
    // =========================================================================

    fn create_device_buffer(&mut self, size: u64, usage: BufferUsage) -> Result<AllocatedBuffer> {
        buffer::create_device_buffer(&self.device, size, usage)
    }

    fn create_staging_buffer(&mut self, contents: &[u8]) -> Result<AllocatedBuffer> {
        buffer::create_staging_buffer(&self.device, contents)
    }

    fn record_buffer_copy(
        &mut self,
        recorder: &mut Recorder,
        src: &AllocatedBuffer,
        dst: &AllocatedBuffer,
        size: u64,
    ) {
        let device = &self.device.device;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };

        // Geometry is read by vertex input in later submissions
        let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::INDEX_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(dst.buffer)
            .offset(0)
            .size(size)
            .build();

        unsafe {
            device.cmd_copy_buffer(recorder.buffer, src.buffer, dst.buffer, &[region]);
            device.cmd_pipeline_barrier(
                recorder.buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::VERTEX_INPUT,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
    }

    fn destroy_buffer(&mut self, buffer: AllocatedBuffer) {
        buffer::destroy_buffer(&self.device, buffer);
    }

    // =========================================================================
    // PRESENTATION
    // =========================================================================

    fn surface_extent(&self) -> Extent {
        self.swapchain.extent()
    }

    fn supports_tearing(&self) -> bool {
        self.tearing
    }

    fn surface_images(&mut self) -> Result<Vec<SurfaceImage>> {
        Ok(self
            .swapchain
            .images
            .iter()
            .enumerate()
            .map(|(index, &image)| SurfaceImage { index, image })
            .collect())
    }

    fn release_image(&mut self, _image: SurfaceImage) {
        // The chain owns the memory
    }

    fn acquire_next_image(&mut self) -> Result<Acquired> {
        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Pick a semaphore whose last waiter has finished
        // ─────────────────────────────────────────────────────────────────────
        let (slot, semaphore, release) = self.acquire_ring.next()?;
        // The release point belongs to the frame n+1 acquires back. With images
        // handed out in order, the slot wait at the start of the tick already
        // covered this value, so this returns at once; it can only block
        // when the chain hands images out of order.
        if let Some(point) = release {
            let fence = TimelineFence {
                semaphore: point.fence,
            };
            if !fence.wait(&self.device.device, point.value, None)? {
                return Err(FatalError::WaitTimeout { value: point.value }.into());
            }
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Ask the chain which image is next
        // ─────────────────────────────────────────────────────────────────────
        let (index, status) = match self.swapchain.acquire_next_image(semaphore) {
            Ok(acquired) => acquired,
            Err(e) => {
                self.acquire_ring.mark_unused(slot);
                return Err(e);
            }
        };

        match status {
            ChainStatus::OutOfDate => {
                self.acquire_ring.mark_unused(slot);
                Ok(Acquired::Stale)
            }
            ChainStatus::Suboptimal => {
                // Still signals the semaphore; rebuild after the next present
                self.stale = true;
                self.acquire_ring.mark_acquired(slot, index as usize);
                Ok(Acquired::Image(index as usize))
            }
            ChainStatus::Optimal => {
                self.acquire_ring.mark_acquired(slot, index as usize);
                Ok(Acquired::Image(index as usize))
            }
        }
    }

    fn present(&mut self, image_index: usize, mode: PresentMode) -> Result<Presented> {
        let wait_semaphore = *self
            .render_finished
            .get(image_index)
            .with_context(|| format!("No render-finished semaphore for image {}", image_index))?;

        let status = self
            .swapchain
            .present(self.device.graphics_queue, image_index as u32, wait_semaphore)?;
        log::trace!(
            "Presented image {} ({:?}, sync interval {})",
            image_index,
            status,
            mode.sync_interval
        );

        // A suboptimal acquire still counts against this present
        let stale = std::mem::take(&mut self.stale) || status != ChainStatus::Optimal;
        Ok(if stale { Presented::Stale } else { Presented::Done })
    }

    fn resize_surface(&mut self, extent: Extent, mode: PresentMode) -> Result<()> {
        self.drain_pending_acquires()?;

        let image_count = self.swapchain.images.len();
        let chain = Swapchain::new(
            &self.device,
            extent,
            image_count as u32,
            mode,
            self.swapchain.swapchain,
        )?;
        let mut old = std::mem::replace(&mut self.swapchain, chain);
        old.destroy();

        // Semaphores may have been left signaled by dropped presents
        self.destroy_semaphores();
        self.acquire_ring = AcquireRing::new(&self.device.device, self.swapchain.images.len())?;
        self.render_finished =
            sync::create_render_finished(&self.device.device, self.swapchain.images.len())?;
        self.stale = false;
        Ok(())
    }

    fn create_render_target(&mut self, image: &SurfaceImage) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.swapchain.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { self.device.device.create_image_view(&create_info, None) }
            .map_err(FatalError::api("vkCreateImageView"))?;
        Ok(view)
    }

    fn destroy_render_target(&mut self, target: vk::ImageView) {
        unsafe { self.device.device.destroy_image_view(target, None) };
    }

    fn create_depth_buffer(&mut self, extent: Extent) -> Result<DepthImage> {
        buffer::create_depth_buffer(&self.device, extent)
    }

    fn destroy_depth_buffer(&mut self, depth: DepthImage) {
        buffer::destroy_depth_buffer(&self.device, depth);
    }

    // =========================================================================
    // PIPELINE AND DRAW RECORDING
    // =========================================================================

    fn create_pipeline(&mut self, shaders: &ShaderSet) -> Result<GraphicsPipeline> {
        pipeline::create_graphics_pipeline(&self.device.device, self.swapchain.format, shaders)
    }

    fn destroy_pipeline(&mut self, pipeline: GraphicsPipeline) {
        pipeline.destroy(&self.device.device);
    }

    fn transition_to_render_target(
        &mut self,
        recorder: &mut Recorder,
        image: &SurfaceImage,
        depth: &DepthImage,
    ) {
        // Previous contents are cleared anyway, so both start from UNDEFINED
        let color = Self::image_barrier(
            image.image,
            vk::ImageAspectFlags::COLOR,
            vk::AccessFlags::empty(),
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        let depth = Self::image_barrier(
            depth.image,
            vk::ImageAspectFlags::DEPTH,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        );

        unsafe {
            self.device.device.cmd_pipeline_barrier(
                recorder.buffer,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[color, depth],
            );
        }
    }

    fn begin_pass(
        &mut self,
        recorder: &mut Recorder,
        target: &vk::ImageView,
        depth: &DepthImage,
        extent: Extent,
        clear: ClearValues,
    ) {
        let device = &self.device.device;
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: extent.width,
                height: extent.height,
            },
        };

        let color_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(*target)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear.color,
                },
            })
            .build();

        let depth_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(depth.view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: clear.depth,
                    stencil: 0,
                },
            });

        let color_attachments = [color_attachment];
        let rendering_info = vk::RenderingInfo::builder()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&depth_attachment);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            device.cmd_begin_rendering(recorder.buffer, &rendering_info);
            device.cmd_set_viewport(recorder.buffer, 0, &[viewport]);
            device.cmd_set_scissor(recorder.buffer, 0, &[render_area]);
        }
    }

    fn draw_indexed(&mut self, recorder: &mut Recorder, draw: &DrawIndexed<'_, Self>) {
        let device = &self.device.device;
        let cmd = recorder.buffer;
        let size = draw.constants.len().min(PUSH_CONSTANT_SIZE as usize);

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, draw.pipeline.pipeline);
            device.cmd_bind_vertex_buffers(cmd, 0, &[draw.vertex_buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, draw.index_buffer.buffer, 0, vk::IndexType::UINT16);
            device.cmd_push_constants(
                cmd,
                draw.pipeline.layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                &draw.constants[..size],
            );
            device.cmd_draw_indexed(cmd, draw.index_count, 1, 0, 0, 0);
        }
    }

    fn end_pass(&mut self, recorder: &mut Recorder) {
        unsafe { self.device.device.cmd_end_rendering(recorder.buffer) };
    }

    fn transition_to_present(&mut self, recorder: &mut Recorder, image: &SurfaceImage) {
        let barrier = Self::image_barrier(
            image.image,
            vk::ImageAspectFlags::COLOR,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::AccessFlags::empty(),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );

        unsafe {
            self.device.device.cmd_pipeline_barrier(
                recorder.buffer,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        log::info!("Destroying presentation chain...");
        if let Err(e) = self.drain_pending_acquires() {
            log::error!("Failed to drain queue before teardown: {:#}", e);
        }
        self.destroy_semaphores();
        self.swapchain.destroy();
        // `device` drops after this and tears down the rest
    }
}
