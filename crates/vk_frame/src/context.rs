//! Device context
//!
//! [`DeviceContext`] owns the loader entry, instance, optional surface and
//! logical device, and is handed by reference to every component constructor.
//! Components keep a clone (an `Arc` bump), so the device outlives every
//! resource created from it and nothing lives in process-wide state.

use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device, Entry, Instance};

use crate::config::ContextConfig;
use crate::error::{VulkanError, VulkanResult};
use crate::queue::family::{FamilyPreferences, QueueFamilies, QueueRole};

const VALIDATION_LAYER: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// Shared handle to the instance, physical device and logical device
#[derive(Clone)]
pub struct DeviceContext {
    inner: Arc<ContextInner>,
}

// Fields drop in declaration order: device, surface, instance.
struct ContextInner {
    device: DeviceOwner,
    surface: Option<SurfaceOwner>,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_family_properties: Vec<vk::QueueFamilyProperties>,
    families: QueueFamilies,
    instance: InstanceOwner,
}

struct InstanceOwner {
    entry: Entry,
    instance: Instance,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl Drop for InstanceOwner {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        log::debug!("Vulkan instance destroyed");
    }
}

struct SurfaceOwner {
    loader: Surface,
    surface: vk::SurfaceKHR,
}

impl Drop for SurfaceOwner {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.surface, None);
        }
    }
}

struct DeviceOwner {
    device: Device,
    swapchain_enabled: bool,
}

impl Drop for DeviceOwner {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("device_wait_idle failed during teardown: {:?}", e);
            }
            self.device.destroy_device(None);
        }
        log::debug!("Logical device destroyed");
    }
}

impl DeviceContext {
    /// Create a context without a presentation surface.
    ///
    /// The present role aliases the graphics family.
    pub fn headless(config: &ContextConfig) -> VulkanResult<Self> {
        Self::create(config, &[], None)
    }

    /// Create a context that presents to a surface made by the window layer.
    ///
    /// `instance_extensions` are the extensions the window layer needs
    /// (e.g. `VK_KHR_surface` plus the platform surface extension) and
    /// `create_surface` builds the surface from the fresh entry and instance.
    /// The context takes ownership of the surface.
    pub fn with_surface<F>(
        config: &ContextConfig,
        instance_extensions: &[&CStr],
        mut create_surface: F,
    ) -> VulkanResult<Self>
    where
        F: FnMut(&Entry, &Instance) -> VulkanResult<vk::SurfaceKHR>,
    {
        let factory: &mut dyn FnMut(&Entry, &Instance) -> VulkanResult<vk::SurfaceKHR> = &mut create_surface;
        Self::create(config, instance_extensions, Some(factory))
    }

    fn create(
        config: &ContextConfig,
        instance_extensions: &[&CStr],
        create_surface: Option<&mut dyn FnMut(&Entry, &Instance) -> VulkanResult<vk::SurfaceKHR>>,
    ) -> VulkanResult<Self> {
        config
            .validate()
            .map_err(|reason| VulkanError::InvalidOperation { reason })?;

        let instance = create_instance(config, instance_extensions)?;

        let surface = match create_surface {
            Some(factory) => {
                let handle = factory(&instance.entry, &instance.instance)?;
                Some(SurfaceOwner {
                    loader: Surface::new(&instance.entry, &instance.instance),
                    surface: handle,
                })
            }
            None => None,
        };

        let prefs = FamilyPreferences {
            dedicated_compute: config.prefer_dedicated_compute,
            dedicated_transfer: config.prefer_dedicated_transfer,
        };
        let selection = select_physical_device(&instance.instance, surface.as_ref(), config.device_index, prefs)?;

        let properties = unsafe { instance.instance.get_physical_device_properties(selection.device) };
        let memory_properties = unsafe {
            instance
                .instance
                .get_physical_device_memory_properties(selection.device)
        };

        log::info!(
            "Selected GPU: {} ({:?})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            properties.device_type
        );
        for family in selection.families.distinct() {
            let roles = selection.families.roles_of(family);
            log::info!("Queue family {} serves {:?}", family, roles);
        }
        if selection.families.distinct().len() == 1 {
            log::info!("All queue roles alias family {}", selection.families.index_of(QueueRole::Graphics));
        }

        let device = create_logical_device(
            &instance.instance,
            selection.device,
            &selection.families,
            surface.is_some(),
        )?;

        Ok(Self {
            inner: Arc::new(ContextInner {
                device,
                surface,
                physical_device: selection.device,
                properties,
                memory_properties,
                queue_family_properties: selection.queue_family_properties,
                families: selection.families,
                instance,
            }),
        })
    }

    /// Get the logical device
    pub fn device(&self) -> &Device {
        &self.inner.device.device
    }

    /// Get a reference to the Vulkan instance
    pub fn instance(&self) -> &Instance {
        &self.inner.instance.instance
    }

    /// Get a reference to the Vulkan entry
    pub fn entry(&self) -> &Entry {
        &self.inner.instance.entry
    }

    /// Get the selected physical device
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.inner.physical_device
    }

    /// Device properties and limits
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.inner.properties
    }

    /// Memory heaps and types of the physical device
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.inner.memory_properties
    }

    /// Resolved family index per queue role
    pub fn queue_families(&self) -> QueueFamilies {
        self.inner.families
    }

    /// Raw family properties of the physical device
    pub fn queue_family_properties(&self) -> &[vk::QueueFamilyProperties] {
        &self.inner.queue_family_properties
    }

    /// Nanoseconds per timestamp tick
    pub fn timestamp_period(&self) -> f32 {
        self.inner.properties.limits.timestamp_period
    }

    /// Surface handle, when created with one
    pub fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.inner.surface.as_ref().map(|s| s.surface)
    }

    /// Surface extension loader, when created with a surface
    pub fn surface_loader(&self) -> Option<&Surface> {
        self.inner.surface.as_ref().map(|s| &s.loader)
    }

    /// Whether `VK_KHR_swapchain` was enabled on the device
    pub fn swapchain_enabled(&self) -> bool {
        self.inner.device.swapchain_enabled
    }

    /// Sharing mode and family list for new resources.
    ///
    /// Concurrent across all role families when there is more than one, so
    /// resources need no queue-family ownership transfers.
    pub fn sharing(&self) -> (vk::SharingMode, Vec<u32>) {
        let families = self.inner.families.distinct();
        if families.len() > 1 {
            (vk::SharingMode::CONCURRENT, families)
        } else {
            (vk::SharingMode::EXCLUSIVE, Vec::new())
        }
    }

    /// Block until the whole device is idle
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.device().device_wait_idle().map_err(VulkanError::Api) }
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("physical_device", &self.inner.physical_device)
            .field("families", &self.inner.families)
            .field("surface", &self.surface())
            .finish_non_exhaustive()
    }
}

fn create_instance(config: &ContextConfig, extra_extensions: &[&CStr]) -> VulkanResult<InstanceOwner> {
    let entry = unsafe { Entry::load() }
        .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {:?}", e)))?;

    let app_name = CString::new(config.application_name.as_str())
        .map_err(|e| VulkanError::InitializationFailed(format!("Invalid application name: {}", e)))?;
    let engine_name = CString::new("vk_frame")
        .map_err(|e| VulkanError::InitializationFailed(format!("Invalid engine name: {}", e)))?;
    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_0);

    let mut validation = config.validation_enabled();
    if validation {
        let layers = entry
            .enumerate_instance_layer_properties()
            .map_err(VulkanError::Api)?;
        let available = layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);
        if !available {
            log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
            validation = false;
        }
    }

    let mut extensions: Vec<*const c_char> = extra_extensions.iter().map(|ext| ext.as_ptr()).collect();
    let mut layers: Vec<*const c_char> = Vec::new();
    if validation {
        extensions.push(DebugUtils::name().as_ptr());
        layers.push(VALIDATION_LAYER.as_ptr());
    }

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);

    let instance = unsafe { entry.create_instance(&create_info, None).map_err(VulkanError::Api)? };

    let mut owner = InstanceOwner {
        entry,
        instance,
        debug: None,
    };

    if validation {
        let debug_utils = DebugUtils::new(&owner.entry, &owner.instance);
        let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));
        let messenger = unsafe {
            debug_utils
                .create_debug_utils_messenger(&messenger_info, None)
                .map_err(VulkanError::Api)?
        };
        owner.debug = Some((debug_utils, messenger));
    }

    Ok(owner)
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

struct DeviceSelection {
    device: vk::PhysicalDevice,
    families: QueueFamilies,
    queue_family_properties: Vec<vk::QueueFamilyProperties>,
}

fn select_physical_device(
    instance: &Instance,
    surface: Option<&SurfaceOwner>,
    forced_index: Option<usize>,
    prefs: FamilyPreferences,
) -> VulkanResult<DeviceSelection> {
    let devices = unsafe { instance.enumerate_physical_devices().map_err(VulkanError::Api)? };

    let evaluate = |device: vk::PhysicalDevice| -> VulkanResult<DeviceSelection> {
        let queue_family_properties = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let families = match surface {
            Some(owner) => QueueFamilies::resolve(
                &queue_family_properties,
                |index| unsafe {
                    owner
                        .loader
                        .get_physical_device_surface_support(device, index, owner.surface)
                        .map_err(VulkanError::Api)
                },
                false,
                prefs,
            )?,
            None => QueueFamilies::resolve(&queue_family_properties, |_| Ok(false), true, prefs)?,
        };
        if surface.is_some() && !supports_swapchain(instance, device)? {
            return Err(VulkanError::InitializationFailed(
                "Required device extensions not supported".to_string(),
            ));
        }
        Ok(DeviceSelection {
            device,
            families,
            queue_family_properties,
        })
    };

    if let Some(index) = forced_index {
        let device = *devices.get(index).ok_or_else(|| {
            VulkanError::InitializationFailed(format!(
                "Device index {} out of range ({} devices)",
                index,
                devices.len()
            ))
        })?;
        return evaluate(device);
    }

    let is_discrete = |device: vk::PhysicalDevice| {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    };
    let ordered = devices
        .iter()
        .copied()
        .filter(|device| is_discrete(*device))
        .chain(devices.iter().copied().filter(|device| !is_discrete(*device)));

    for device in ordered {
        match evaluate(device) {
            Ok(selection) => return Ok(selection),
            Err(e) => log::debug!("Skipping physical device {:?}: {}", device, e),
        }
    }

    Err(VulkanError::InitializationFailed("No suitable GPU found".to_string()))
}

fn supports_swapchain(instance: &Instance, device: vk::PhysicalDevice) -> VulkanResult<bool> {
    let extensions = unsafe {
        instance
            .enumerate_device_extension_properties(device)
            .map_err(VulkanError::Api)?
    };
    Ok(extensions
        .iter()
        .any(|available| unsafe { CStr::from_ptr(available.extension_name.as_ptr()) } == SwapchainLoader::name()))
}

fn create_logical_device(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    families: &QueueFamilies,
    enable_swapchain: bool,
) -> VulkanResult<DeviceOwner> {
    let priorities = [1.0_f32];
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .distinct()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(family)
                .queue_priorities(&priorities)
                .build()
        })
        .collect();

    let extensions: Vec<*const c_char> = if enable_swapchain {
        vec![SwapchainLoader::name().as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions);

    let device = unsafe {
        instance
            .create_device(physical_device, &create_info, None)
            .map_err(VulkanError::Api)?
    };
    log::debug!("Logical device created with {} queue families", queue_infos.len());

    Ok(DeviceOwner {
        device,
        swapchain_enabled: enable_swapchain,
    })
}
