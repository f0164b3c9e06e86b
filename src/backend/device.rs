// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers and the window's surface extension
// - Surface creation from raw window handles
// - Physical device selection (discrete GPU, or a software implementation on request)
// - Logical device with timeline semaphores and dynamic rendering
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::extensions::{ext, khr};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;

use crate::error::FatalError;

/// Adapter requirements coming from the command line / config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterPreference {
    /// Only accept CPU (software rasterizer) implementations
    pub software: bool,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    /// Dropped by hand before the device goes away
    pub allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    pub surface: vk::SurfaceKHR,
    pub surface_loader: khr::Surface,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanDevice {
    /// Create the instance, a surface for the window and a device that can
    /// present to it.
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        adapter: AdapterPreference,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Self> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, app_name, enable_validation, display)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Surface for the window
        let surface_loader = khr::Surface::new(&entry, &instance);
        let surface = create_surface(&entry, &instance, display, window)?;

        // Step 5: Pick physical device (GPU)
        let (physical_device, graphics_queue_family) =
            Self::pick_physical_device(&instance, &surface_loader, surface, adapter)?;

        // Step 6: Create logical device
        let (device, graphics_queue) =
            Self::create_logical_device(&instance, physical_device, graphics_queue_family)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {} ({:?})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            properties.device_type
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        // Step 7: Create memory allocator
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(FatalError::from)?;

        Ok(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            _entry: entry,
            surface,
            surface_loader,
            graphics_queue,
            graphics_queue_family,
            debug_utils,
        })
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("Frame Pacer")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions: Vec<*const c_char> = vec![
            khr::Surface::name().as_ptr(),
            surface_extension(display)?.as_ptr(),
        ];
        if enable_validation {
            extensions.push(ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(FatalError::api("vkCreateInstance"))?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .map_err(FatalError::api("vkCreateDebugUtilsMessengerEXT"))?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        adapter: AdapterPreference,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(FatalError::api("vkEnumeratePhysicalDevices"))?;

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };

            let Some(score) = adapter_score(props.device_type, props.api_version, adapter) else {
                continue;
            };

            // Graphics queue that can also present to our window
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };
            let graphics_family = queue_families
                .iter()
                .enumerate()
                .filter(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|(i, _)| i as u32)
                .find(|&family| {
                    unsafe {
                        surface_loader.get_physical_device_surface_support(device, family, surface)
                    }
                    .unwrap_or(false)
                });

            if let Some(graphics_family) = graphics_family {
                if score > best_score {
                    best_score = score;
                    best_device = Some((device, graphics_family));
                }
            }
        }

        best_device.ok_or_else(|| FatalError::NoSuitableAdapter.into())
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = [khr::Swapchain::name().as_ptr()];

        // Timeline semaphores are the frame fence; dynamic rendering replaces
        // render passes and framebuffers
        let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::builder().timeline_semaphore(true);
        let mut vulkan_13 = vk::PhysicalDeviceVulkan13Features::builder().dynamic_rendering(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .push_next(&mut vulkan_12)
            .push_next(&mut vulkan_13);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .map_err(FatalError::api("vkCreateDevice"))?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.map_err(FatalError::api("vkDeviceWaitIdle"))?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            // Allocations hold the device, so the allocator goes first
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Higher is better; `None` rejects the adapter.
fn adapter_score(
    device_type: vk::PhysicalDeviceType,
    api_version: u32,
    preference: AdapterPreference,
) -> Option<u32> {
    if api_version < vk::API_VERSION_1_3 {
        return None;
    }
    let is_software = device_type == vk::PhysicalDeviceType::CPU;
    if preference.software != is_software {
        return None;
    }
    Some(match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        _ => 1,
    })
}

/// Instance extension needed to create a surface for this display.
fn surface_extension(display: RawDisplayHandle) -> Result<&'static CStr> {
    match display {
        RawDisplayHandle::Windows(_) => Ok(khr::Win32Surface::name()),
        RawDisplayHandle::Xlib(_) => Ok(khr::XlibSurface::name()),
        RawDisplayHandle::Xcb(_) => Ok(khr::XcbSurface::name()),
        RawDisplayHandle::Wayland(_) => Ok(khr::WaylandSurface::name()),
        other => Err(FatalError::Surface(format!("unsupported display {:?}", other)).into()),
    }
}

fn create_surface(
    entry: &Entry,
    instance: &ash::Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    let surface = unsafe {
        match (display, window) {
            (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
                let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as vk::HINSTANCE;
                let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                    .hinstance(hinstance)
                    .hwnd(handle.hwnd.get() as vk::HWND);
                khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)
            }
            (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
                let dpy = display
                    .display
                    .context("Xlib display handle is null")?
                    .as_ptr();
                let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                    .dpy(dpy.cast())
                    .window(handle.window);
                khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)
            }
            (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
                let connection = display
                    .connection
                    .context("XCB connection handle is null")?
                    .as_ptr();
                let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                    .connection(connection.cast())
                    .window(handle.window.get());
                khr::XcbSurface::new(entry, instance).create_xcb_surface(&create_info, None)
            }
            (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
                let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                    .display(display.display.as_ptr().cast())
                    .surface(handle.surface.as_ptr().cast());
                khr::WaylandSurface::new(entry, instance)
                    .create_wayland_surface(&create_info, None)
            }
            (display, window) => {
                return Err(FatalError::Surface(format!(
                    "unsupported window handle {:?} on {:?}",
                    window, display
                ))
                .into())
            }
        }
    }
    .map_err(FatalError::api("vkCreateSurfaceKHR"))?;

    Ok(surface)
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    const HARDWARE: AdapterPreference = AdapterPreference { software: false };
    const SOFTWARE: AdapterPreference = AdapterPreference { software: true };

    #[test]
    fn discrete_beats_integrated() {
        let discrete = adapter_score(
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vk::API_VERSION_1_3,
            HARDWARE,
        );
        let integrated = adapter_score(
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::API_VERSION_1_3,
            HARDWARE,
        );
        assert!(discrete > integrated);
    }

    #[test]
    fn software_flag_selects_only_cpu_implementations() {
        assert!(adapter_score(vk::PhysicalDeviceType::CPU, vk::API_VERSION_1_3, SOFTWARE).is_some());
        assert!(adapter_score(
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vk::API_VERSION_1_3,
            SOFTWARE
        )
        .is_none());
        assert!(adapter_score(vk::PhysicalDeviceType::CPU, vk::API_VERSION_1_3, HARDWARE).is_none());
    }

    #[test]
    fn pre_1_3_drivers_are_rejected() {
        assert!(adapter_score(
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vk::API_VERSION_1_2,
            HARDWARE
        )
        .is_none());
    }
}
