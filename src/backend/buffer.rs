// Buffer utilities for vertex, index and staging buffers
//
// Memory comes from gpu-allocator. Device buffers live in GPU-only memory and
// are filled by a recorded copy; staging buffers are CPU-visible and written
// once at creation.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::pipeline::DEPTH_FORMAT;
use super::{BufferUsage, Extent, VulkanDevice};
use crate::error::FatalError;

/// A buffer together with the memory bound to it
pub struct AllocatedBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Allocation,
    pub size: vk::DeviceSize,
}

/// Depth image, its memory and the view used as the depth attachment
pub struct DepthImage {
    pub image: vk::Image,
    pub allocation: Allocation,
    pub view: vk::ImageView,
    pub extent: Extent,
}

fn usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    match usage {
        BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
        BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER,
    }
}

/// Helper to create a buffer with the given usage in the given memory location
fn create_buffer(
    device: &VulkanDevice,
    name: &str,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
) -> Result<AllocatedBuffer> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
        .map_err(FatalError::api("vkCreateBuffer"))?;

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
        name,
        requirements,
        location,
        linear: true,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(FatalError::from(e).into());
        }
    };

    let bound = unsafe {
        device
            .device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
    };
    if let Err(e) = bound {
        free_allocation(device, allocation);
        unsafe { device.device.destroy_buffer(buffer, None) };
        return Err(FatalError::api("vkBindBufferMemory")(e).into());
    }

    Ok(AllocatedBuffer {
        buffer,
        allocation,
        size,
    })
}

/// GPU-only buffer filled by a transfer
pub fn create_device_buffer(
    device: &VulkanDevice,
    size: vk::DeviceSize,
    usage: BufferUsage,
) -> Result<AllocatedBuffer> {
    create_buffer(
        device,
        "geometry",
        size,
        vk::BufferUsageFlags::TRANSFER_DST | usage_flags(usage),
        MemoryLocation::GpuOnly,
    )
}

/// Host-visible buffer holding a copy of `contents`
pub fn create_staging_buffer(device: &VulkanDevice, contents: &[u8]) -> Result<AllocatedBuffer> {
    let mut staging = create_buffer(
        device,
        "staging",
        contents.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
    )?;

    let mapped = staging
        .allocation
        .mapped_slice_mut()
        .context("Staging memory is not host visible")?;
    mapped[..contents.len()].copy_from_slice(contents);

    Ok(staging)
}

pub fn destroy_buffer(device: &VulkanDevice, buffer: AllocatedBuffer) {
    unsafe { device.device.destroy_buffer(buffer.buffer, None) };
    free_allocation(device, buffer.allocation);
}

fn free_allocation(device: &VulkanDevice, allocation: Allocation) {
    if let Err(e) = device.allocator.lock().free(allocation) {
        log::error!("Failed to free GPU allocation: {}", e);
    }
}

/// Create a depth buffer image, memory, and view
pub fn create_depth_buffer(device: &VulkanDevice, extent: Extent) -> Result<DepthImage> {
    // Create depth image
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(DEPTH_FORMAT)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let image = unsafe { device.device.create_image(&image_info, None) }
        .map_err(FatalError::api("vkCreateImage"))?;

    let requirements = unsafe { device.device.get_image_memory_requirements(image) };

    let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
        name: "depth",
        requirements,
        location: MemoryLocation::GpuOnly,
        linear: false,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.device.destroy_image(image, None) };
            return Err(FatalError::from(e).into());
        }
    };

    let bound = unsafe {
        device
            .device
            .bind_image_memory(image, allocation.memory(), allocation.offset())
    };
    if let Err(e) = bound {
        free_allocation(device, allocation);
        unsafe { device.device.destroy_image(image, None) };
        return Err(FatalError::api("vkBindImageMemory")(e).into());
    }

    // Create image view
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(DEPTH_FORMAT)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::DEPTH,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    let view = match unsafe { device.device.create_image_view(&view_info, None) } {
        Ok(view) => view,
        Err(e) => {
            free_allocation(device, allocation);
            unsafe { device.device.destroy_image(image, None) };
            return Err(FatalError::api("vkCreateImageView")(e).into());
        }
    };

    Ok(DepthImage {
        image,
        allocation,
        view,
        extent,
    })
}

pub fn destroy_depth_buffer(device: &VulkanDevice, depth: DepthImage) {
    unsafe {
        device.device.destroy_image_view(depth.view, None);
        device.device.destroy_image(depth.image, None);
    }
    free_allocation(device, depth.allocation);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_usage_maps_to_binding_flags() {
        assert_eq!(usage_flags(BufferUsage::Vertex), vk::BufferUsageFlags::VERTEX_BUFFER);
        assert_eq!(usage_flags(BufferUsage::Index), vk::BufferUsageFlags::INDEX_BUFFER);
    }
}
