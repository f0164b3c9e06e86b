// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Views onto the images belong to whoever renders into them. The image count is fixed at creation and kept across resizes; the present
// mode is baked in, so changing it means recreating the chain.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;

use super::{Extent, PresentMode, VulkanDevice};
use crate::error::FatalError;

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Outcome of an acquire or present on the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    Optimal,
    /// Still usable, but no longer matches the surface exactly
    Suboptimal,
    OutOfDate,
}

impl Swapchain {
    /// Create a chain of `image_count` images. Pass the previous chain as
    /// `old` when resizing; it must be destroyed by the caller afterwards.
    pub fn new(
        device: &VulkanDevice,
        requested: Extent,
        image_count: u32,
        mode: PresentMode,
        old: vk::SwapchainKHR,
    ) -> Result<Self> {
        let surface = device.surface;
        let surface_loader = &device.surface_loader;

        // Query surface capabilities
        let surface_caps = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(device.physical_device, surface)
        }
        .map_err(FatalError::api("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?;

        // Query supported formats
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(device.physical_device, surface)
        }
        .map_err(FatalError::api("vkGetPhysicalDeviceSurfaceFormatsKHR"))?;

        // Query supported present modes
        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(device.physical_device, surface)
        }
        .map_err(FatalError::api("vkGetPhysicalDeviceSurfacePresentModesKHR"))?;

        // Choose surface format (prefer SRGB)
        let surface_format = formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .context("No suitable surface format")?;

        let present_mode = choose_present_mode(&present_modes, mode);
        log::info!("Present mode: {:?}", present_mode);

        // Choose extent
        let extent = if surface_caps.current_extent.width != u32::MAX {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: requested.width.clamp(
                    surface_caps.min_image_extent.width,
                    surface_caps.max_image_extent.width,
                ),
                height: requested.height.clamp(
                    surface_caps.min_image_extent.height,
                    surface_caps.max_image_extent.height,
                ),
            }
        };
        // A minimized surface reports 0x0; never build zero-sized images
        let extent = vk::Extent2D {
            width: extent.width.max(1),
            height: extent.height.max(1),
        };

        let image_count = clamp_image_count(image_count, &surface_caps);

        let swapchain_loader = khr::Swapchain::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(FatalError::api("vkCreateSwapchainKHR"))?;

        let images = unsafe { swapchain_loader.get_swapchain_images(swapchain) }
            .map_err(FatalError::api("vkGetSwapchainImagesKHR"))?;

        log::info!(
            "Created swapchain with {} images ({}x{})",
            images.len(),
            extent.width,
            extent.height
        );

        Ok(Self {
            swapchain,
            swapchain_loader,
            images,
            format: surface_format.format,
            extent,
        })
    }

    /// Acquire the next image, signaling `semaphore` when it is ready.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<(u32, ChainStatus)> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, false)) => Ok((index, ChainStatus::Optimal)),
            Ok((index, true)) => Ok((index, ChainStatus::Suboptimal)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok((0, ChainStatus::OutOfDate)),
            Err(e) => Err(FatalError::api("vkAcquireNextImageKHR")(e).into()),
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<ChainStatus> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(ChainStatus::Optimal),
            Ok(true) => Ok(ChainStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(ChainStatus::OutOfDate),
            Err(e) => Err(FatalError::api("vkQueuePresentKHR")(e).into()),
        }
    }

    pub fn extent(&self) -> Extent {
        Extent::clamped(self.extent.width, self.extent.height)
    }

    /// Destroy the chain. The GPU must be done with the images.
    pub fn destroy(&mut self) {
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(self.swapchain, None) };
            self.swapchain = vk::SwapchainKHR::null();
        }
        self.images.clear();
    }
}

/// Map a present mode onto what the surface offers.
///
/// - interval 1: FIFO (always available)
/// - interval 0 with tearing: IMMEDIATE
/// - interval 0 without tearing: MAILBOX, else FIFO
pub fn choose_present_mode(available: &[vk::PresentModeKHR], mode: PresentMode) -> vk::PresentModeKHR {
    let wanted = if mode.sync_interval > 0 {
        vk::PresentModeKHR::FIFO
    } else if mode.allow_tearing {
        vk::PresentModeKHR::IMMEDIATE
    } else {
        vk::PresentModeKHR::MAILBOX
    };
    if available.contains(&wanted) {
        wanted
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Whether unsynchronized presents can tear on this surface.
pub fn supports_tearing(device: &VulkanDevice) -> Result<bool> {
    let present_modes = unsafe {
        device
            .surface_loader
            .get_physical_device_surface_present_modes(device.physical_device, device.surface)
    }
    .map_err(FatalError::api("vkGetPhysicalDeviceSurfacePresentModesKHR"))?;
    Ok(present_modes.contains(&vk::PresentModeKHR::IMMEDIATE))
}

fn clamp_image_count(requested: u32, caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = requested.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [vk::PresentModeKHR; 3] = [
        vk::PresentModeKHR::FIFO,
        vk::PresentModeKHR::MAILBOX,
        vk::PresentModeKHR::IMMEDIATE,
    ];

    #[test]
    fn vsync_maps_to_fifo() {
        assert_eq!(
            choose_present_mode(&ALL, PresentMode::new(true, true)),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn tearing_maps_to_immediate() {
        assert_eq!(
            choose_present_mode(&ALL, PresentMode::new(false, true)),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn no_tearing_prefers_mailbox_then_fifo() {
        let mode = PresentMode::new(false, false);
        assert_eq!(choose_present_mode(&ALL, mode), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], mode),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn image_count_respects_surface_limits() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(clamp_image_count(3, &caps), 3);
        assert_eq!(clamp_image_count(8, &caps), 3);
        assert_eq!(clamp_image_count(1, &caps), 2);

        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(clamp_image_count(5, &unbounded), 5);
    }
}
