//! One-time Vulkan bootstrap: instance, optional validation messenger,
//! presentation surface, physical device selection, logical device and
//! queues. Everything else in the crate holds an `Arc<DeviceContext>`, so
//! the device outlives every object created from it.

use ash::vk;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use tracing::{debug, info, warn};

use crate::config::RendererConfig;
use crate::error::{RendererError, Result};

const VALIDATION_LAYER: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// The window-system side of bootstrap. Implementors know which instance
/// extensions their platform needs and how to turn their native window into
/// a `VkSurfaceKHR`.
pub trait SurfaceProvider {
    fn required_instance_extensions(&self) -> Vec<&'static CStr>;

    fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<vk::SurfaceKHR>;

    /// Size of the drawable area in physical pixels. This is what the
    /// swapchain extent follows, not the logical window size.
    fn framebuffer_size(&self) -> (u32, u32);
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader hands us a valid callback data pointer for the
    // duration of this call.
    let callback_data = unsafe { *p_callback_data };
    let message = if callback_data.p_message.is_null() {
        std::borrow::Cow::from("")
    } else {
        unsafe { CStr::from_ptr(callback_data.p_message) }.to_string_lossy()
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(target: "vulkan", ?message_type, "{}", message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "vulkan", ?message_type, "{}", message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::info!(target: "vulkan", ?message_type, "{}", message)
        }
        _ => tracing::trace!(target: "vulkan", ?message_type, "{}", message),
    }
    vk::FALSE
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        let mut families: Vec<u32> = self.graphics.into_iter().chain(self.present).collect();
        families.dedup();
        families
    }
}

/// Picks graphics and present families. A single family that can do both
/// wins over two separate ones.
pub fn find_queue_families(
    families: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();
    for (index, family) in families.iter().enumerate() {
        let index = index as u32;
        let graphics = family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let present = supports_present(index);
        if graphics && present {
            return QueueFamilyIndices {
                graphics: Some(index),
                present: Some(index),
            };
        }
        if graphics && indices.graphics.is_none() {
            indices.graphics = Some(index);
        }
        if present && indices.present.is_none() {
            indices.present = Some(index);
        }
    }
    indices
}

/// What bootstrap learned about one physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub name: String,
    pub queue_families: QueueFamilyIndices,
    pub missing_extensions: Vec<String>,
    pub swapchain_adequate: bool,
}

impl DeviceCandidate {
    pub fn is_suitable(&self) -> bool {
        self.queue_families.is_complete()
            && self.missing_extensions.is_empty()
            && self.swapchain_adequate
    }
}

/// First suitable device in enumeration order.
pub fn pick_first_suitable(candidates: &[DeviceCandidate]) -> Option<usize> {
    candidates.iter().position(DeviceCandidate::is_suitable)
}

/// Highest sample count usable for both colour and depth attachments.
pub fn max_usable_sample_count(limits: &vk::PhysicalDeviceLimits) -> vk::SampleCountFlags {
    let counts =
        limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts;
    [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ]
    .into_iter()
    .find(|&flag| counts.contains(flag))
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

/// Clamps a requested sample count to the device maximum.
pub fn clamp_sample_count(requested: u32, max: vk::SampleCountFlags) -> vk::SampleCountFlags {
    let requested = vk::SampleCountFlags::from_raw(requested.max(1));
    if requested.as_raw() > max.as_raw() {
        max
    } else {
        requested
    }
}

fn required_device_extensions() -> [&'static CStr; 1] {
    [ash::extensions::khr::Swapchain::name()]
}

fn c_name(raw: &[c_char]) -> &CStr {
    // SAFETY: Vulkan guarantees extension/layer/device names are
    // nul-terminated within their fixed-size arrays.
    unsafe { CStr::from_ptr(raw.as_ptr()) }
}

pub struct DeviceContext {
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    surface_loader: ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device_name: String,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_families: QueueFamilyIndices,
    max_samples: vk::SampleCountFlags,
    device: ash::Device,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
}

impl DeviceContext {
    /// Creates the instance, surface and logical device.
    ///
    /// Fails with [`RendererError::NoSuitableDevice`] when no physical device
    /// offers graphics and presentation queues plus swapchain support for
    /// the provider's surface.
    pub fn bootstrap(config: &RendererConfig, provider: &dyn SurfaceProvider) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };

        let app_name = CString::new(config.application_name.as_str())
            .map_err(|_| RendererError::Config("application name contains NUL".into()))?;
        let engine_name = CString::new("NovaDE Paint Renderer")
            .map_err(|_| RendererError::Config("engine name contains NUL".into()))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let available_extensions = entry.enumerate_instance_extension_properties(None)?;
        let has_extension = |name: &CStr| {
            available_extensions
                .iter()
                .any(|ext| c_name(&ext.extension_name) == name)
        };

        let mut extensions: Vec<*const c_char> = provider
            .required_instance_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();
        let mut flags = vk::InstanceCreateFlags::empty();
        if has_extension(vk::KhrPortabilityEnumerationFn::name()) {
            extensions.push(vk::KhrPortabilityEnumerationFn::name().as_ptr());
            flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        let validation = config.enable_validation && {
            let layers = entry.enumerate_instance_layer_properties()?;
            let found = layers
                .iter()
                .any(|layer| c_name(&layer.layer_name) == VALIDATION_LAYER);
            if !found {
                warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed.");
            }
            found && has_extension(ash::extensions::ext::DebugUtils::name())
        };
        let mut layers: Vec<*const c_char> = Vec::new();
        if validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
            layers.push(VALIDATION_LAYER.as_ptr());
        }

        let mut messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let mut instance_info = vk::InstanceCreateInfo::builder()
            .flags(flags)
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);
        if validation {
            instance_info = instance_info.push_next(&mut messenger_info);
        }

        let instance = unsafe { entry.create_instance(&instance_info, None)? };
        info!(validation, "Vulkan instance created.");

        // From here on, partially built state is torn down by `Partial`.
        let mut partial = Partial::new(instance);

        if validation {
            let loader = ash::extensions::ext::DebugUtils::new(&entry, &partial.instance);
            let messenger =
                unsafe { loader.create_debug_utils_messenger(&messenger_info, None)? };
            partial.debug_utils = Some((loader, messenger));
            debug!("Debug messenger installed.");
        }

        let surface_loader = ash::extensions::khr::Surface::new(&entry, &partial.instance);
        let surface = provider.create_surface(&entry, &partial.instance)?;
        partial.surface = Some((surface_loader.clone(), surface));

        let (physical_device, candidate) =
            Self::select_physical_device(&partial.instance, &surface_loader, surface)?;
        let queue_families = candidate.queue_families;

        let properties = unsafe { partial.instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { partial.instance.get_physical_device_memory_properties(physical_device) };
        let max_samples = max_usable_sample_count(&properties.limits);

        let (graphics_family, present_family) = match (queue_families.graphics, queue_families.present) {
            (Some(graphics), Some(present)) => (graphics, present),
            _ => return Err(RendererError::NoSuitableDevice),
        };
        let device =
            Self::create_logical_device(&partial.instance, physical_device, &queue_families)?;
        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };
        info!(
            device = %candidate.name,
            graphics_family,
            present_family,
            "Logical device created."
        );

        let (instance, debug_utils, surface_pair) = partial.into_parts();
        let (surface_loader, surface) = surface_pair.ok_or_else(|| {
            RendererError::Surface("surface was not created".to_string())
        })?;

        Ok(Self {
            entry,
            instance,
            debug_utils,
            surface_loader,
            surface,
            physical_device,
            device_name: candidate.name,
            memory_properties,
            queue_families,
            max_samples,
            device,
            graphics_queue,
            present_queue,
        })
    }

    fn select_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, DeviceCandidate)> {
        let physical_devices = unsafe { instance.enumerate_physical_devices()? };
        info!("Found {} physical devices.", physical_devices.len());

        let mut candidates = Vec::with_capacity(physical_devices.len());
        for &pdevice in &physical_devices {
            let properties = unsafe { instance.get_physical_device_properties(pdevice) };
            let name = c_name(&properties.device_name).to_string_lossy().into_owned();

            let families =
                unsafe { instance.get_physical_device_queue_family_properties(pdevice) };
            let queue_families = find_queue_families(&families, |index| unsafe {
                surface_loader
                    .get_physical_device_surface_support(pdevice, index, surface)
                    .unwrap_or(false)
            });

            let available = unsafe { instance.enumerate_device_extension_properties(pdevice)? };
            let missing_extensions: Vec<String> = required_device_extensions()
                .iter()
                .filter(|required| {
                    !available
                        .iter()
                        .any(|ext| c_name(&ext.extension_name) == **required)
                })
                .map(|name| name.to_string_lossy().into_owned())
                .collect();

            let swapchain_adequate = missing_extensions.is_empty() && unsafe {
                let formats = surface_loader
                    .get_physical_device_surface_formats(pdevice, surface)
                    .unwrap_or_default();
                let modes = surface_loader
                    .get_physical_device_surface_present_modes(pdevice, surface)
                    .unwrap_or_default();
                !formats.is_empty() && !modes.is_empty()
            };

            let candidate = DeviceCandidate {
                name,
                queue_families,
                missing_extensions,
                swapchain_adequate,
            };
            debug!(?candidate, suitable = candidate.is_suitable(), "Evaluated device.");
            candidates.push(candidate);
        }

        let index = pick_first_suitable(&candidates).ok_or(RendererError::NoSuitableDevice)?;
        Ok((physical_devices[index], candidates.swap_remove(index)))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilyIndices,
    ) -> Result<ash::Device> {
        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let available = unsafe { instance.enumerate_device_extension_properties(physical_device)? };
        let mut extensions: Vec<*const c_char> = required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();
        if available
            .iter()
            .any(|ext| c_name(&ext.extension_name) == vk::KhrPortabilitySubsetFn::name())
        {
            extensions.push(vk::KhrPortabilitySubsetFn::name().as_ptr());
        }

        let features = vk::PhysicalDeviceFeatures::builder();
        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_features(&features)
            .enabled_extension_names(&extensions);

        Ok(unsafe { instance.create_device(physical_device, &device_info, None)? })
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn surface_loader(&self) -> &ash::extensions::khr::Surface {
        &self.surface_loader
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.queue_families
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn max_samples(&self) -> vk::SampleCountFlags {
        self.max_samples
    }

    /// Blocks until the device has finished all submitted work.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        info!("Vulkan device context destroyed.");
    }
}

/// Instance-level objects created before the device exists. Dropping it
/// releases them, so an early `?` during bootstrap does not leak.
struct Partial {
    instance: ash::Instance,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    surface: Option<(ash::extensions::khr::Surface, vk::SurfaceKHR)>,
    armed: bool,
}

impl Partial {
    fn new(instance: ash::Instance) -> Self {
        Self {
            instance,
            debug_utils: None,
            surface: None,
            armed: true,
        }
    }

    #[allow(clippy::type_complexity)]
    fn into_parts(
        mut self,
    ) -> (
        ash::Instance,
        Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
        Option<(ash::extensions::khr::Surface, vk::SurfaceKHR)>,
    ) {
        self.armed = false;
        (self.instance.clone(), self.debug_utils.take(), self.surface.take())
    }
}

impl Drop for Partial {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        unsafe {
            if let Some((loader, surface)) = self.surface.take() {
                loader.destroy_surface(surface, None);
            }
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
