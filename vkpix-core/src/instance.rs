/*! Process-wide Vulkan instance and adapter registry.
 *
 *  `create_gpu_instance` / `get_gpu_instance` / `destroy_gpu_instance` form
 *  the idempotent singleton the public API talks about; underneath they are
 *  a thin lazy accessor over an explicit [`GpuInstance`] value, which owns
 *  the `ash` entry/instance, one immutable [`GpuInfo`] per physical device,
 *  and the lazily-created logical [`Device`]s.
 *
 *  `VKPIX_VALIDATION=1` enables the Khronos validation layer and routes its
 *  messages through `log`. `VKPIX_DEVICE=<n>` overrides default adapter
 *  selection.
 */

use std::ffi::{c_void, CStr, CString};
use std::sync::Arc;

use ash::extensions::{ext, khr};
use ash::vk;
use parking_lot::Mutex;
use vpt::{Error, Result};

use crate::device::Device;

const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// Physical device category, in selection-priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpuType {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
}

/// Support bits for the curated device extension list.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtensionSupport {
    pub khr_8bit_storage: bool,
    pub khr_16bit_storage: bool,
    pub khr_bind_memory2: bool,
    pub khr_buffer_device_address: bool,
    pub khr_cooperative_matrix: bool,
    pub khr_dedicated_allocation: bool,
    pub khr_descriptor_update_template: bool,
    pub khr_external_memory: bool,
    pub khr_get_memory_requirements2: bool,
    pub khr_maintenance1: bool,
    pub khr_maintenance2: bool,
    pub khr_maintenance3: bool,
    pub khr_portability_subset: bool,
    pub khr_push_descriptor: bool,
    pub khr_sampler_ycbcr_conversion: bool,
    pub khr_shader_float16_int8: bool,
    pub khr_storage_buffer_storage_class: bool,
    pub khr_swapchain: bool,
    pub ext_memory_budget: bool,
    pub nv_cooperative_matrix: bool,
}

impl ExtensionSupport {
    fn probe(names: &[String]) -> Self {
        let has = |n: &str| names.iter().any(|e| e == n);
        Self {
            khr_8bit_storage: has("VK_KHR_8bit_storage"),
            khr_16bit_storage: has("VK_KHR_16bit_storage"),
            khr_bind_memory2: has("VK_KHR_bind_memory2"),
            khr_buffer_device_address: has("VK_KHR_buffer_device_address"),
            khr_cooperative_matrix: has("VK_KHR_cooperative_matrix"),
            khr_dedicated_allocation: has("VK_KHR_dedicated_allocation"),
            khr_descriptor_update_template: has("VK_KHR_descriptor_update_template"),
            khr_external_memory: has("VK_KHR_external_memory"),
            khr_get_memory_requirements2: has("VK_KHR_get_memory_requirements2"),
            khr_maintenance1: has("VK_KHR_maintenance1"),
            khr_maintenance2: has("VK_KHR_maintenance2"),
            khr_maintenance3: has("VK_KHR_maintenance3"),
            khr_portability_subset: has("VK_KHR_portability_subset"),
            khr_push_descriptor: has("VK_KHR_push_descriptor"),
            khr_sampler_ycbcr_conversion: has("VK_KHR_sampler_ycbcr_conversion"),
            khr_shader_float16_int8: has("VK_KHR_shader_float16_int8"),
            khr_storage_buffer_storage_class: has("VK_KHR_storage_buffer_storage_class"),
            khr_swapchain: has("VK_KHR_swapchain"),
            ext_memory_budget: has("VK_EXT_memory_budget"),
            nv_cooperative_matrix: has("VK_NV_cooperative_matrix"),
        }
    }

    /// Names to pass to `vkCreateDevice`, in probe order.
    pub(crate) fn enabled_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        let mut push = |cond: bool, name: &'static str| {
            if cond {
                names.push(name);
            }
        };
        push(self.khr_8bit_storage, "VK_KHR_8bit_storage");
        push(self.khr_16bit_storage, "VK_KHR_16bit_storage");
        push(self.khr_bind_memory2, "VK_KHR_bind_memory2");
        push(self.khr_cooperative_matrix, "VK_KHR_cooperative_matrix");
        push(self.khr_dedicated_allocation, "VK_KHR_dedicated_allocation");
        push(
            self.khr_descriptor_update_template,
            "VK_KHR_descriptor_update_template",
        );
        push(self.khr_external_memory, "VK_KHR_external_memory");
        push(
            self.khr_get_memory_requirements2,
            "VK_KHR_get_memory_requirements2",
        );
        push(self.khr_maintenance1, "VK_KHR_maintenance1");
        push(self.khr_maintenance2, "VK_KHR_maintenance2");
        push(self.khr_maintenance3, "VK_KHR_maintenance3");
        // a portability implementation must have the subset extension enabled
        push(self.khr_portability_subset, "VK_KHR_portability_subset");
        push(self.khr_push_descriptor, "VK_KHR_push_descriptor");
        push(
            self.khr_sampler_ycbcr_conversion,
            "VK_KHR_sampler_ycbcr_conversion",
        );
        push(self.khr_shader_float16_int8, "VK_KHR_shader_float16_int8");
        push(
            self.khr_storage_buffer_storage_class,
            "VK_KHR_storage_buffer_storage_class",
        );
        push(self.ext_memory_budget, "VK_EXT_memory_budget");
        push(self.nv_cooperative_matrix, "VK_NV_cooperative_matrix");
        names
    }
}

/// Immutable description of one physical device, filled during
/// `create_gpu_instance` and shareable without synchronization afterwards.
#[derive(Clone, Debug)]
pub struct GpuInfo {
    pub physical_device_index: usize,
    pub api_version: u32,
    pub driver_version: u32,
    pub vendor_id: u32,
    pub device_id: u32,
    pub device_name: String,
    pub pipeline_cache_uuid: [u8; vk::UUID_SIZE],
    pub device_type: GpuType,

    // hardware limits
    pub max_shared_memory_size: u32,
    pub max_workgroup_count: [u32; 3],
    pub max_workgroup_invocations: u32,
    pub max_workgroup_size: [u32; 3],
    pub memory_map_alignment: usize,
    pub buffer_offset_alignment: usize,
    pub non_coherent_atom_size: usize,
    pub buffer_image_granularity: usize,
    pub max_image_dimension_1d: u32,
    pub max_image_dimension_2d: u32,
    pub max_image_dimension_3d: u32,
    pub timestamp_period: f32,

    // queue families
    pub compute_queue_family_index: u32,
    pub graphics_queue_family_index: u32,
    pub transfer_queue_family_index: u32,
    pub compute_queue_count: u32,
    pub graphics_queue_count: u32,
    pub transfer_queue_count: u32,
    pub unified_compute_transfer_queue: bool,

    // subgroup
    pub subgroup_size: u32,
    pub support_subgroup_basic: bool,
    pub support_subgroup_vote: bool,
    pub support_subgroup_ballot: bool,
    pub support_subgroup_shuffle: bool,

    // fp16 / int8
    pub support_fp16_packed: bool,
    pub support_fp16_storage: bool,
    pub support_fp16_uniform: bool,
    pub support_fp16_arithmetic: bool,
    pub support_int8_packed: bool,
    pub support_int8_storage: bool,
    pub support_int8_uniform: bool,
    pub support_int8_arithmetic: bool,

    pub support_ycbcr_conversion: bool,
    pub support_cooperative_matrix: bool,

    // known driver misbehavior
    pub bug_storage_buffer_no_l1: bool,
    pub bug_buffer_image_load_zero: bool,
    pub bug_corrupted_online_pipeline_cache: bool,
    pub bug_implicit_fp16_arithmetic: bool,

    pub extensions: ExtensionSupport,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

struct DeviceSlot {
    device: Option<Arc<Device>>,
    poisoned: bool,
}

/// Owns the `VkInstance` and everything enumerated from it.
pub struct GpuInstance {
    // declared before the raw handles so logical devices drop first
    devices: Mutex<Vec<DeviceSlot>>,
    infos: Vec<GpuInfo>,
    physical_devices: Vec<vk::PhysicalDevice>,
    default_index: usize,
    debug_utils: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    gpdp2: Option<khr::GetPhysicalDeviceProperties2>,
    raw: ash::Instance,
    entry: ash::Entry,
}

unsafe extern "system" fn debug_utils_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() {
        std::borrow::Cow::Borrowed("<null>")
    } else {
        CStr::from_ptr((*callback_data).p_message).to_string_lossy()
    };
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("validation: {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("validation: {message}");
    } else {
        log::debug!("validation: {message}");
    }
    vk::FALSE
}

fn validation_requested() -> bool {
    std::env::var("VKPIX_VALIDATION").map_or(false, |v| v == "1" || v == "true")
}

impl GpuInstance {
    fn create() -> Result<Arc<Self>> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            log::error!("failed to load the Vulkan loader: {e}");
            Error::NoDevice
        })?;

        let instance_extensions: Vec<String> = entry
            .enumerate_instance_extension_properties(None)
            .unwrap_or_default()
            .iter()
            .map(|p| {
                unsafe { CStr::from_ptr(p.extension_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        let has_instance_ext = |name: &str| instance_extensions.iter().any(|e| e == name);

        let validation = validation_requested() && {
            let layers = entry.enumerate_instance_layer_properties().unwrap_or_default();
            layers.iter().any(|l| {
                unsafe { CStr::from_ptr(l.layer_name.as_ptr()) }.to_string_lossy()
                    == VALIDATION_LAYER
            })
        };

        let mut enabled_extensions: Vec<CString> = Vec::new();
        if has_instance_ext("VK_KHR_get_physical_device_properties2") {
            enabled_extensions
                .push(CString::new("VK_KHR_get_physical_device_properties2").unwrap());
        }
        if has_instance_ext("VK_KHR_external_memory_capabilities") {
            enabled_extensions
                .push(CString::new("VK_KHR_external_memory_capabilities").unwrap());
        }
        if validation && has_instance_ext("VK_EXT_debug_utils") {
            enabled_extensions.push(CString::new("VK_EXT_debug_utils").unwrap());
        }
        let extension_ptrs: Vec<*const i8> =
            enabled_extensions.iter().map(|e| e.as_ptr()).collect();

        let layer_names = if validation {
            vec![CString::new(VALIDATION_LAYER).unwrap()]
        } else {
            Vec::new()
        };
        let layer_ptrs: Vec<*const i8> = layer_names.iter().map(|l| l.as_ptr()).collect();

        let app_name = CStr::from_bytes_with_nul(b"vkpix\0").unwrap();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(app_name)
            .engine_name(app_name)
            .api_version(vk::API_VERSION_1_0);
        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&extension_ptrs);

        let raw = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
            log::error!("vkCreateInstance failed: {e:?}");
            Error::NoDevice
        })?;

        let debug_utils = if validation && has_instance_ext("VK_EXT_debug_utils") {
            let loader = ext::DebugUtils::new(&entry, &raw);
            let info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
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
                .pfn_user_callback(Some(debug_utils_callback));
            match unsafe { loader.create_debug_utils_messenger(&info, None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    log::warn!("debug utils messenger creation failed: {e:?}");
                    None
                }
            }
        } else {
            None
        };

        let gpdp2 = if has_instance_ext("VK_KHR_get_physical_device_properties2") {
            Some(khr::GetPhysicalDeviceProperties2::new(&entry, &raw))
        } else {
            None
        };

        let physical_devices = unsafe { raw.enumerate_physical_devices() }.unwrap_or_default();
        if physical_devices.is_empty() {
            log::warn!("no Vulkan physical devices");
            unsafe {
                if let Some((loader, messenger)) = &debug_utils {
                    loader.destroy_debug_utils_messenger(*messenger, None);
                }
                raw.destroy_instance(None);
            }
            return Err(Error::NoDevice);
        }

        let infos: Vec<GpuInfo> = physical_devices
            .iter()
            .enumerate()
            .map(|(i, &pd)| probe_gpu(&raw, gpdp2.as_ref(), pd, i))
            .collect();

        for info in &infos {
            log::debug!(
                "[{}] {} ({:?}), queues c/g/t = {}/{}/{}, fp16 p/s/a = {}/{}/{}",
                info.physical_device_index,
                info.device_name,
                info.device_type,
                info.compute_queue_count,
                info.graphics_queue_count,
                info.transfer_queue_count,
                info.support_fp16_packed,
                info.support_fp16_storage,
                info.support_fp16_arithmetic,
            );
        }

        let default_index = pick_default_index(&infos);
        let slots = infos
            .iter()
            .map(|_| DeviceSlot {
                device: None,
                poisoned: false,
            })
            .collect();

        Ok(Arc::new(Self {
            devices: Mutex::new(slots),
            infos,
            physical_devices,
            default_index,
            debug_utils,
            gpdp2,
            raw,
            entry,
        }))
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.raw
    }

    pub fn ash_entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub(crate) fn gpdp2(&self) -> Option<&khr::GetPhysicalDeviceProperties2> {
        self.gpdp2.as_ref()
    }

    pub fn gpu_count(&self) -> usize {
        self.infos.len()
    }

    pub fn default_gpu_index(&self) -> usize {
        self.default_index
    }

    pub fn info(&self, index: usize) -> Option<&GpuInfo> {
        self.infos.get(index)
    }

    pub fn physical_device(&self, index: usize) -> Option<vk::PhysicalDevice> {
        self.physical_devices.get(index).copied()
    }

    /// The logical device for `index`, created on first use.
    pub fn device(&self, index: usize) -> Result<Arc<Device>> {
        if index >= self.infos.len() {
            return Err(Error::NoDevice);
        }
        let mut slots = self.devices.lock();
        let slot = &mut slots[index];
        if slot.poisoned {
            return Err(Error::DeviceLost);
        }
        if let Some(device) = &slot.device {
            return Ok(device.clone());
        }
        let device = Device::new(self, index)?;
        slot.device = Some(device.clone());
        Ok(device)
    }

    /// Marks an adapter's registry entry unusable after device loss.
    pub fn poison_device(&self, index: usize) {
        let mut slots = self.devices.lock();
        if let Some(slot) = slots.get_mut(index) {
            log::error!("device {index} lost; poisoning registry entry");
            slot.poisoned = true;
            slot.device = None;
        }
    }
}

impl Drop for GpuInstance {
    fn drop(&mut self) {
        {
            let mut slots = self.devices.lock();
            for slot in slots.iter_mut() {
                if let Some(device) = slot.device.take() {
                    device.wait_idle();
                }
            }
        }
        unsafe {
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.raw.destroy_instance(None);
        }
    }
}

fn pick_default_index(infos: &[GpuInfo]) -> usize {
    if let Ok(v) = std::env::var("VKPIX_DEVICE") {
        if let Ok(i) = v.parse::<usize>() {
            if i < infos.len() {
                return i;
            }
            log::warn!("VKPIX_DEVICE={i} out of range, ignoring");
        }
    }
    infos
        .iter()
        .position(|i| i.device_type == GpuType::Discrete)
        .or_else(|| {
            infos
                .iter()
                .position(|i| i.device_type == GpuType::Integrated)
        })
        .unwrap_or(0)
}

fn probe_gpu(
    instance: &ash::Instance,
    gpdp2: Option<&khr::GetPhysicalDeviceProperties2>,
    pd: vk::PhysicalDevice,
    index: usize,
) -> GpuInfo {
    let properties = unsafe { instance.get_physical_device_properties(pd) };
    let limits = &properties.limits;
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(pd) };
    let queue_families = unsafe { instance.get_physical_device_queue_family_properties(pd) };

    let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    let device_type = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => GpuType::Discrete,
        vk::PhysicalDeviceType::INTEGRATED_GPU => GpuType::Integrated,
        vk::PhysicalDeviceType::VIRTUAL_GPU => GpuType::Virtual,
        vk::PhysicalDeviceType::CPU => GpuType::Cpu,
        _ => GpuType::Other,
    };

    let (compute_family, compute_count) = find_queue_family(
        &queue_families,
        vk::QueueFlags::COMPUTE,
        vk::QueueFlags::GRAPHICS,
    );
    let (graphics_family, graphics_count) = find_queue_family(
        &queue_families,
        vk::QueueFlags::GRAPHICS,
        vk::QueueFlags::empty(),
    );
    let (transfer_family, transfer_count) = find_queue_family(
        &queue_families,
        vk::QueueFlags::TRANSFER,
        vk::QueueFlags::COMPUTE | vk::QueueFlags::GRAPHICS,
    );
    // fall back to the compute family when there is no dedicated copy queue
    let (transfer_family, transfer_count) = if transfer_count == 0 {
        (compute_family, compute_count)
    } else {
        (transfer_family, transfer_count)
    };

    let extension_names: Vec<String> =
        unsafe { instance.enumerate_device_extension_properties(pd) }
            .unwrap_or_default()
            .iter()
            .map(|p| {
                unsafe { CStr::from_ptr(p.extension_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
    let extensions = ExtensionSupport::probe(&extension_names);

    // feature chain, reachable only through the properties2 instance extension
    let mut support_fp16_storage = false;
    let mut support_fp16_uniform = false;
    let mut support_fp16_arithmetic = false;
    let mut support_int8_storage = false;
    let mut support_int8_uniform = false;
    let mut support_int8_arithmetic = false;
    let mut support_ycbcr_conversion = false;
    let mut subgroup_size = 1u32;
    let mut subgroup_ops = vk::SubgroupFeatureFlags::empty();

    if let Some(gpdp2) = gpdp2 {
        let mut storage_16bit = vk::PhysicalDevice16BitStorageFeatures::default();
        let mut storage_8bit = vk::PhysicalDevice8BitStorageFeatures::default();
        let mut float16_int8 = vk::PhysicalDeviceShaderFloat16Int8Features::default();
        let mut ycbcr = vk::PhysicalDeviceSamplerYcbcrConversionFeatures::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder();
        if extensions.khr_16bit_storage {
            features2 = features2.push_next(&mut storage_16bit);
        }
        if extensions.khr_8bit_storage {
            features2 = features2.push_next(&mut storage_8bit);
        }
        if extensions.khr_shader_float16_int8 {
            features2 = features2.push_next(&mut float16_int8);
        }
        if extensions.khr_sampler_ycbcr_conversion {
            features2 = features2.push_next(&mut ycbcr);
        }
        let mut features2 = features2.build();
        unsafe { gpdp2.get_physical_device_features2(pd, &mut features2) };

        support_fp16_storage = storage_16bit.storage_buffer16_bit_access != vk::FALSE;
        support_fp16_uniform =
            storage_16bit.uniform_and_storage_buffer16_bit_access != vk::FALSE;
        support_fp16_arithmetic = float16_int8.shader_float16 != vk::FALSE;
        support_int8_storage = storage_8bit.storage_buffer8_bit_access != vk::FALSE;
        support_int8_uniform = storage_8bit.uniform_and_storage_buffer8_bit_access != vk::FALSE;
        support_int8_arithmetic = float16_int8.shader_int8 != vk::FALSE;
        support_ycbcr_conversion = ycbcr.sampler_ycbcr_conversion != vk::FALSE;

        let mut subgroup = vk::PhysicalDeviceSubgroupProperties::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::builder()
            .push_next(&mut subgroup)
            .build();
        unsafe { gpdp2.get_physical_device_properties2(pd, &mut properties2) };
        subgroup_size = subgroup.subgroup_size.max(1);
        subgroup_ops = subgroup.supported_operations;
    }

    // shader-level fp16 pack/unpack has no feature bit; gate it with the
    // same extension the arithmetic path needs
    let support_fp16_packed = extensions.khr_shader_float16_int8 || support_fp16_storage;
    let support_int8_packed = support_int8_storage;

    // vendor quirks carried over from shipping drivers
    let vendor_id = properties.vendor_id;
    let driver_version = properties.driver_version;
    let bug_storage_buffer_no_l1 = vendor_id == 0x5143; // qcom: storage buffers skip L1
    let bug_buffer_image_load_zero = vendor_id == 0x13b5 && properties.device_id == 0x0; // old mali blobs
    let bug_corrupted_online_pipeline_cache =
        vendor_id == 0x13b5 && driver_version < vk::make_api_version(0, 1, 2, 0);
    let bug_implicit_fp16_arithmetic = vendor_id == 0x5143 && !support_fp16_arithmetic;

    GpuInfo {
        physical_device_index: index,
        api_version: properties.api_version,
        driver_version,
        vendor_id,
        device_id: properties.device_id,
        device_name,
        pipeline_cache_uuid: properties.pipeline_cache_uuid,
        device_type,
        max_shared_memory_size: limits.max_compute_shared_memory_size,
        max_workgroup_count: limits.max_compute_work_group_count,
        max_workgroup_invocations: limits.max_compute_work_group_invocations,
        max_workgroup_size: limits.max_compute_work_group_size,
        memory_map_alignment: limits.min_memory_map_alignment,
        buffer_offset_alignment: limits.min_storage_buffer_offset_alignment as usize,
        non_coherent_atom_size: limits.non_coherent_atom_size as usize,
        buffer_image_granularity: limits.buffer_image_granularity as usize,
        max_image_dimension_1d: limits.max_image_dimension1_d,
        max_image_dimension_2d: limits.max_image_dimension2_d,
        max_image_dimension_3d: limits.max_image_dimension3_d,
        timestamp_period: limits.timestamp_period,
        compute_queue_family_index: compute_family,
        graphics_queue_family_index: graphics_family,
        transfer_queue_family_index: transfer_family,
        compute_queue_count: compute_count,
        graphics_queue_count: graphics_count,
        transfer_queue_count: transfer_count,
        unified_compute_transfer_queue: compute_family == transfer_family,
        subgroup_size,
        support_subgroup_basic: subgroup_ops.contains(vk::SubgroupFeatureFlags::BASIC),
        support_subgroup_vote: subgroup_ops.contains(vk::SubgroupFeatureFlags::VOTE),
        support_subgroup_ballot: subgroup_ops.contains(vk::SubgroupFeatureFlags::BALLOT),
        support_subgroup_shuffle: subgroup_ops.contains(vk::SubgroupFeatureFlags::SHUFFLE),
        support_fp16_packed,
        support_fp16_storage,
        support_fp16_uniform,
        support_fp16_arithmetic,
        support_int8_packed,
        support_int8_storage,
        support_int8_uniform,
        support_int8_arithmetic,
        support_ycbcr_conversion,
        support_cooperative_matrix: extensions.khr_cooperative_matrix
            || extensions.nv_cooperative_matrix,
        bug_storage_buffer_no_l1,
        bug_buffer_image_load_zero,
        bug_corrupted_online_pipeline_cache,
        bug_implicit_fp16_arithmetic,
        extensions,
        memory_properties,
    }
}

/// First family supporting `wanted` while avoiding `avoid` when possible,
/// with its queue count. Falls back to any family with `wanted`.
fn find_queue_family(
    families: &[vk::QueueFamilyProperties],
    wanted: vk::QueueFlags,
    avoid: vk::QueueFlags,
) -> (u32, u32) {
    families
        .iter()
        .enumerate()
        .filter(|(_, f)| f.queue_flags.contains(wanted) && !f.queue_flags.intersects(avoid))
        .chain(
            families
                .iter()
                .enumerate()
                .filter(|(_, f)| f.queue_flags.contains(wanted)),
        )
        .next()
        .map(|(i, f)| (i as u32, f.queue_count))
        .unwrap_or((u32::MAX, 0))
}

static INSTANCE: Mutex<Option<Arc<GpuInstance>>> = Mutex::new(None);

/// Creates (or returns) the process-wide instance. Idempotent.
pub fn create_gpu_instance() -> Result<Arc<GpuInstance>> {
    let mut guard = INSTANCE.lock();
    if let Some(instance) = &*guard {
        return Ok(instance.clone());
    }
    let instance = GpuInstance::create()?;
    *guard = Some(instance.clone());
    Ok(instance)
}

/// The live instance, if `create_gpu_instance` has run.
pub fn get_gpu_instance() -> Option<Arc<GpuInstance>> {
    INSTANCE.lock().clone()
}

/// Waits all device queues idle, tears down per-device state, then the
/// instance. Safe to call at process exit, or with no instance at all.
pub fn destroy_gpu_instance() {
    let taken = INSTANCE.lock().take();
    drop(taken);
}

pub fn get_gpu_count() -> usize {
    get_gpu_instance().map_or(0, |i| i.gpu_count())
}

pub fn get_default_gpu_index() -> usize {
    get_gpu_instance().map_or(0, |i| i.default_gpu_index())
}

pub fn get_gpu_info(index: usize) -> Option<GpuInfo> {
    get_gpu_instance().and_then(|i| i.info(index).cloned())
}

/// The logical device for `index`, creating both the instance and the device
/// on demand.
pub fn get_gpu_device(index: usize) -> Result<Arc<Device>> {
    let instance = create_gpu_instance()?;
    instance.device(index)
}

/// A plausible discrete-GPU description for driver-free unit tests.
#[cfg(test)]
pub(crate) fn test_gpu_info() -> GpuInfo {
    GpuInfo {
        physical_device_index: 0,
        api_version: vk::API_VERSION_1_1,
        driver_version: 1,
        vendor_id: 0x10DE,
        device_id: 0x2204,
        device_name: "test gpu".to_string(),
        pipeline_cache_uuid: [0; vk::UUID_SIZE],
        device_type: GpuType::Discrete,
        max_shared_memory_size: 48 * 1024,
        max_workgroup_count: [65535; 3],
        max_workgroup_invocations: 1024,
        max_workgroup_size: [1024, 1024, 64],
        memory_map_alignment: 64,
        buffer_offset_alignment: 16,
        non_coherent_atom_size: 64,
        buffer_image_granularity: 1024,
        max_image_dimension_1d: 16384,
        max_image_dimension_2d: 16384,
        max_image_dimension_3d: 2048,
        timestamp_period: 1.0,
        compute_queue_family_index: 0,
        graphics_queue_family_index: 0,
        transfer_queue_family_index: 1,
        compute_queue_count: 4,
        graphics_queue_count: 1,
        transfer_queue_count: 2,
        unified_compute_transfer_queue: false,
        subgroup_size: 32,
        support_subgroup_basic: true,
        support_subgroup_vote: true,
        support_subgroup_ballot: true,
        support_subgroup_shuffle: true,
        support_fp16_packed: true,
        support_fp16_storage: true,
        support_fp16_uniform: true,
        support_fp16_arithmetic: true,
        support_int8_packed: true,
        support_int8_storage: true,
        support_int8_uniform: true,
        support_int8_arithmetic: true,
        support_ycbcr_conversion: false,
        support_cooperative_matrix: false,
        bug_storage_buffer_no_l1: false,
        bug_buffer_image_load_zero: false,
        bug_corrupted_online_pipeline_cache: false,
        bug_implicit_fp16_arithmetic: false,
        extensions: ExtensionSupport::default(),
        memory_properties: vk::PhysicalDeviceMemoryProperties::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn families(specs: &[(vk::QueueFlags, u32)]) -> Vec<vk::QueueFamilyProperties> {
        specs
            .iter()
            .map(|&(flags, count)| vk::QueueFamilyProperties {
                queue_flags: flags,
                queue_count: count,
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn queue_family_prefers_dedicated_compute() {
        let fams = families(&[
            (vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
            (vk::QueueFlags::COMPUTE, 4),
        ]);
        let (family, count) = find_queue_family(
            &fams,
            vk::QueueFlags::COMPUTE,
            vk::QueueFlags::GRAPHICS,
        );
        assert_eq!((family, count), (1, 4));
    }

    #[test]
    fn queue_family_falls_back_to_shared() {
        let fams = families(&[(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 2)]);
        let (family, count) = find_queue_family(
            &fams,
            vk::QueueFlags::COMPUTE,
            vk::QueueFlags::GRAPHICS,
        );
        assert_eq!((family, count), (0, 2));
    }

    #[test]
    fn extension_probe_round_trip() {
        let names = vec![
            "VK_KHR_16bit_storage".to_string(),
            "VK_KHR_push_descriptor".to_string(),
            "VK_KHR_descriptor_update_template".to_string(),
        ];
        let support = ExtensionSupport::probe(&names);
        assert!(support.khr_16bit_storage);
        assert!(support.khr_push_descriptor);
        assert!(support.khr_descriptor_update_template);
        assert!(!support.khr_8bit_storage);
        let enabled = support.enabled_names();
        assert!(enabled.contains(&"VK_KHR_16bit_storage"));
        assert!(!enabled.contains(&"VK_KHR_8bit_storage"));
    }
}
