// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface, device and queue. Built once per window and passed by
//! reference into every resource operation.
use std::ffi::{c_char, c_void, CStr};

use anyhow::{anyhow, Context, Result};
use ash::ext::debug_utils;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, error, info, trace, warn};

use crate::error::RenderError;

const APP_NAME: &CStr = c"whirl";
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct GpuContext {
    _entry: Entry,
    pub instance: Instance,
    debug: Option<DebugMessenger>,
    pub surface_loader: surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub phys: vk::PhysicalDevice,
    pub mem_props: vk::PhysicalDeviceMemoryProperties,
    pub queue_family: u32,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub swapchain_loader: swapchain::Device,
    pub cmd_pool: vk::CommandPool,
}

struct DebugMessenger {
    loader: debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

// STRICT ORDER:
// 1) instance (WSI extensions, validation in debug builds)
// 2) surface from THIS instance
// 3) physical device + queue family that can present to the surface
// 4) device, queue, swapchain loader, command pool
impl GpuContext {
    pub unsafe fn new(window: &dyn HasWindowHandle, display: &dyn HasDisplayHandle) -> Result<Self> {
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("display handle: {e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow!("window handle: {e}"))?
            .as_raw();
        let exts = ash_window::enumerate_required_extensions(dh)
            .context("enumerate_required_extensions")?
            .to_vec();

        Self::with_surface(exts, |entry, instance| {
            ash_window::create_surface(entry, instance, dh, wh, None)
                .context("ash_window::create_surface")
        })
    }

    /// Context over a `VK_EXT_headless_surface` surface, for exercising the
    /// presentation lifecycle without a window.
    #[cfg(test)]
    pub(crate) unsafe fn headless() -> Result<Self> {
        use ash::ext::headless_surface;

        let exts = vec![surface::NAME.as_ptr(), headless_surface::NAME.as_ptr()];
        Self::with_surface(exts, |entry, instance| {
            headless_surface::Instance::new(entry, instance)
                .create_headless_surface(&vk::HeadlessSurfaceCreateInfoEXT::default(), None)
                .context("create_headless_surface")
        })
    }

    unsafe fn with_surface(
        exts: Vec<*const c_char>,
        make_surface: impl FnOnce(&Entry, &Instance) -> Result<vk::SurfaceKHR>,
    ) -> Result<Self> {
        let entry = Entry::linked();
        let validation = cfg!(debug_assertions) && validation_available(&entry);
        let instance = create_instance(&entry, exts, validation).context("create_instance")?;

        let debug = if validation {
            Some(create_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = make_surface(&entry, &instance)?;

        let (phys, queue_family) = pick_device_and_queue(&instance, &surface_loader, surface)?;
        let mem_props = instance.get_physical_device_memory_properties(phys);

        let priorities = [1.0_f32];
        let qinfo = vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index: queue_family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        };
        let device_exts = [swapchain::NAME.as_ptr()];
        let dinfo = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            queue_create_info_count: 1,
            p_queue_create_infos: &qinfo,
            enabled_extension_count: device_exts.len() as u32,
            pp_enabled_extension_names: device_exts.as_ptr(),
            ..Default::default()
        };
        let device = instance
            .create_device(phys, &dinfo, None)
            .context("create_device")?;
        let queue = device.get_device_queue(queue_family, 0);
        let swapchain_loader = swapchain::Device::new(&instance, &device);

        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: queue_family,
            ..Default::default()
        };
        let cmd_pool = device
            .create_command_pool(&pool_info, None)
            .context("create_command_pool")?;

        Ok(Self {
            _entry: entry,
            instance,
            debug,
            surface_loader,
            surface,
            phys,
            mem_props,
            queue_family,
            device,
            queue,
            swapchain_loader,
            cmd_pool,
        })
    }

    pub unsafe fn surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        self.surface_loader
            .get_physical_device_surface_capabilities(self.phys, self.surface)
            .context("get_physical_device_surface_capabilities")
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.cmd_pool, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some(dbg) = self.debug.take() {
                dbg.loader.destroy_debug_utils_messenger(dbg.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        debug!("vulkan context destroyed");
    }
}

unsafe fn validation_available(entry: &Entry) -> bool {
    let layers = entry.enumerate_instance_layer_properties().unwrap_or_default();
    let has_layer = layers
        .iter()
        .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == VALIDATION_LAYER);
    let exts = entry
        .enumerate_instance_extension_properties(None)
        .unwrap_or_default();
    let has_debug_utils = exts
        .iter()
        .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == debug_utils::NAME);
    if !has_layer {
        info!("validation layer not installed, running without it");
    }
    has_layer && has_debug_utils
}

unsafe fn create_instance(
    entry: &Entry,
    mut exts: Vec<*const c_char>,
    validation: bool,
) -> Result<Instance> {
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: APP_NAME.as_ptr(),
        application_version: 0,
        p_engine_name: APP_NAME.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_0,
        ..Default::default()
    };

    let mut layers: Vec<*const c_char> = Vec::new();
    if validation {
        exts.push(debug_utils::NAME.as_ptr());
        layers.push(VALIDATION_LAYER.as_ptr());
    }

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: exts.len() as u32,
        pp_enabled_extension_names: exts.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };

    Ok(entry.create_instance(&create_info, None)?)
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!(target: "vulkan", "{msg}");
    } else {
        trace!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

unsafe fn create_debug_messenger(entry: &Entry, instance: &Instance) -> Result<DebugMessenger> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = loader
        .create_debug_utils_messenger(&ci, None)
        .context("create_debug_utils_messenger")?;
    Ok(DebugMessenger { loader, messenger })
}

/// First device with a graphics queue that can present to `surface` and
/// supports swapchains; discrete GPUs win over the rest.
unsafe fn pick_device_and_queue(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32)> {
    let mut fallback = None;
    for phys in instance
        .enumerate_physical_devices()
        .context("enumerate_physical_devices")?
    {
        let has_swapchain = instance
            .enumerate_device_extension_properties(phys)
            .unwrap_or_default()
            .iter()
            .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == swapchain::NAME);
        if !has_swapchain {
            continue;
        }

        let qprops = instance.get_physical_device_queue_family_properties(phys);
        let Some(family) = qprops.iter().enumerate().find_map(|(i, q)| {
            let present = surface_loader
                .get_physical_device_surface_support(phys, i as u32, surface)
                .unwrap_or(false);
            (q.queue_flags.contains(vk::QueueFlags::GRAPHICS) && present).then_some(i as u32)
        }) else {
            continue;
        };

        let props = instance.get_physical_device_properties(phys);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            info!(device = %name, queue_family = family, "selected discrete GPU");
            return Ok((phys, family));
        }
        if fallback.is_none() {
            debug!(device = %name, "candidate device");
            fallback = Some((phys, family));
        }
    }

    match fallback {
        Some(found) => {
            info!(queue_family = found.1, "selected non-discrete GPU");
            Ok(found)
        }
        None => Err(RenderError::NoSuitableDevice.into()),
    }
}
