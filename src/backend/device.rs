// Device context - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Surface creation (via ash-window)
// - Physical device selection (compute + present capable, prefer discrete GPU)
// - Logical device + queue creation (compute and present families may differ)
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;

/// Lowest Vulkan version the engine accepts. There is no fallback tier:
/// a device below this is skipped outright.
const MIN_API_VERSION: u32 = vk::API_VERSION_1_3;

/// A hardware queue plus the command state that belongs to it.
///
/// Each queue exclusively owns its command pool and the command buffers
/// allocated from it; the frame recorder only ever re-records the compute
/// queue's single primary buffer.
pub struct Queue {
    pub handle: vk::Queue,
    pub family: u32,
    pub command_pool: vk::CommandPool,
    pub command_buffers: Vec<vk::CommandBuffer>,
}

impl Queue {
    fn new(device: &ash::Device, family: u32, handle: vk::Queue) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .context("Failed to create command pool")?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffers = unsafe {
            device
                .allocate_command_buffers(&alloc_info)
                .context("Failed to allocate command buffers")?
        };

        Ok(Self {
            handle,
            family,
            command_pool,
            command_buffers,
        })
    }

    fn destroy(&self, device: &ash::Device) {
        unsafe {
            // Frees the command buffers with it
            device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Everything device-level the rest of the engine builds on.
///
/// Created once at startup and destroyed last, after every dependent
/// object. Field teardown is ordered manually in `Drop`: the allocator
/// must release its memory blocks while the device is still alive.
pub struct DeviceContext {
    pub allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::extensions::khr::Surface,

    pub compute_queue: Queue,
    pub present_queue: Queue,

    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub properties: vk::PhysicalDeviceProperties,
}

impl DeviceContext {
    /// Build the full device context against a window.
    ///
    /// Fails fatally if no device offers both a compute-capable and a
    /// present-capable queue family, or if surface/allocator creation
    /// fails - there is no degraded mode.
    pub fn initialize(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<Self> {
        log::info!("Creating device context: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = Self::create_instance(&entry, display_handle, app_name, enable_validation)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
                .context("Failed to create window surface")?
        };
        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);

        let (physical_device, compute_family, present_family) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        let device =
            Self::create_logical_device(&instance, physical_device, compute_family, present_family)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {} (compute family {}, present family {})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            compute_family,
            present_family,
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let compute_queue = Queue::new(&device, compute_family, unsafe {
            device.get_device_queue(compute_family, 0)
        })?;
        let present_queue = Queue::new(&device, present_family, unsafe {
            device.get_device_queue(present_family, 0)
        })?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        Ok(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            _entry: entry,
            surface,
            surface_loader,
            compute_queue,
            present_queue,
            debug_utils,
            properties,
        })
    }

    fn create_instance(
        entry: &Entry,
        display_handle: RawDisplayHandle,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("vk-raytracer")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(MIN_API_VERSION);

        // Surface extensions for the current platform, plus debug utils
        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("No surface extensions for this display")?
            .to_vec();
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
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
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

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

        let messenger =
            unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    /// Pick the GPU, its compute queue family and its present queue family.
    ///
    /// A dedicated compute family (COMPUTE without GRAPHICS) is preferred;
    /// the present family reuses the compute family when it can present,
    /// which keeps the per-frame ownership transfer a no-op.
    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, u32, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let mut best: Option<(vk::PhysicalDevice, u32, u32)> = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            if props.api_version < MIN_API_VERSION {
                continue;
            }

            let families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            let compute_family = families
                .iter()
                .enumerate()
                .find(|(_, f)| {
                    f.queue_flags.contains(vk::QueueFlags::COMPUTE)
                        && !f.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                })
                .or_else(|| {
                    families
                        .iter()
                        .enumerate()
                        .find(|(_, f)| f.queue_flags.contains(vk::QueueFlags::COMPUTE))
                })
                .map(|(i, _)| i as u32);

            let Some(compute_family) = compute_family else {
                continue;
            };

            let supports_present = |family: u32| unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, family, surface)
                    .unwrap_or(false)
            };

            let present_family = if supports_present(compute_family) {
                Some(compute_family)
            } else {
                (0..families.len() as u32).find(|&f| supports_present(f))
            };

            let Some(present_family) = present_family else {
                continue;
            };

            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best = Some((device, compute_family, present_family));
            }
        }

        best.ok_or_else(|| {
            anyhow::anyhow!("No GPU with both a compute and a present queue family")
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        compute_family: u32,
        present_family: u32,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];

        // One create-info per distinct family
        let mut families = vec![compute_family];
        if present_family != compute_family {
            families.push(present_family);
        }
        let queue_infos: Vec<_> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = vec![ash::extensions::khr::Swapchain::name().as_ptr()];

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    /// Wait for all submitted GPU work to drain.
    ///
    /// Required before destroying any resource a command buffer may still
    /// reference (swapchain recreation, pipeline reload, cleanup).
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying device context...");

        let _ = self.wait_idle();

        unsafe {
            // Allocator first: it frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);

            self.compute_queue.destroy(&self.device);
            self.present_queue.destroy(&self.device);

            self.device.destroy_device(None);

            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
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
