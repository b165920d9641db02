/*! Logical device wrapper.
 *
 *  [`DeviceShared`] owns the raw `ash::Device`, the negotiated extension
 *  function tables, the queue pool and the immutable sampler; allocators
 *  and the pipeline cache hold it by `Arc`. [`Device`] is the registry-facing
 *  layer on top: per-device allocator pools, the pipeline cache, and the
 *  dummy resources that keep unused shader bindings valid.
 */

use std::ffi::CString;
use std::mem;
use std::ptr;
use std::sync::Arc;

use ash::vk;
use parking_lot::{Condvar, Mutex};
use vpt::{AllocKind, Error, Result};

use crate::alloc::{BlobAllocator, DeviceAllocator, StagingAllocator, WeightAllocator};
use crate::cache::PipelineCache;
use crate::instance::{GpuInfo, GpuInstance};
use crate::mat::Mat;
use crate::option::Options;
use crate::reflect::BindingType;
use crate::shader;

fn driver_err(result: vk::Result) -> Error {
    match result {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            Error::Alloc {
                bytes: 0,
                kind: AllocKind::Dedicated,
            }
        }
        vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
        other => Error::Submit {
            status: other.as_raw(),
        },
    }
}

/// Extension entry points resolved with `vkGetDeviceProcAddr`, present only
/// when the extension was negotiated.
pub(crate) struct DeviceExtensionFunctions {
    pub descriptor_update_template: Option<vk::KhrDescriptorUpdateTemplateFn>,
    pub push_descriptor: Option<vk::KhrPushDescriptorFn>,
    pub get_memory_requirements2: Option<vk::KhrGetMemoryRequirements2Fn>,
    pub bind_memory2: Option<vk::KhrBindMemory2Fn>,
}

struct QueuePool {
    family_index: u32,
    queues: Mutex<Vec<vk::Queue>>,
    condvar: Condvar,
}

pub struct DeviceShared {
    raw: ash::Device,
    physical_device: vk::PhysicalDevice,
    info: GpuInfo,
    gpdp2: Option<ash::extensions::khr::GetPhysicalDeviceProperties2>,
    fns: DeviceExtensionFunctions,
    queue_pools: Vec<QueuePool>,
    texelfetch_sampler: vk::Sampler,
    uses_push_descriptor: bool,
}

unsafe impl Send for DeviceShared {}
unsafe impl Sync for DeviceShared {}

impl DeviceShared {
    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }

    pub fn info(&self) -> &GpuInfo {
        &self.info
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub(crate) fn fns(&self) -> &DeviceExtensionFunctions {
        &self.fns
    }

    pub(crate) fn uses_push_descriptor(&self) -> bool {
        self.uses_push_descriptor
    }

    pub fn immutable_texelfetch_sampler(&self) -> vk::Sampler {
        self.texelfetch_sampler
    }

    /// First memory type in `type_bits` satisfying `required`, preferring
    /// `preferred` and avoiding `preferred_not` when possible.
    pub fn find_memory_index(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
        preferred_not: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        let types =
            &self.info.memory_properties.memory_types[..self.info.memory_properties.memory_type_count as usize];
        let candidates = || {
            types
                .iter()
                .enumerate()
                .filter(|(i, t)| type_bits & (1 << i) != 0 && t.property_flags.contains(required))
        };
        candidates()
            .find(|(_, t)| {
                t.property_flags.contains(preferred)
                    && !t.property_flags.intersects(preferred_not)
            })
            .or_else(|| candidates().find(|(_, t)| t.property_flags.contains(preferred)))
            .or_else(|| candidates().next())
            .map(|(i, _)| i as u32)
    }

    pub fn is_mappable(&self, memory_type_index: u32) -> bool {
        self.memory_flags(memory_type_index)
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_coherent(&self, memory_type_index: u32) -> bool {
        self.memory_flags(memory_type_index)
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    fn memory_flags(&self, index: u32) -> vk::MemoryPropertyFlags {
        self.info
            .memory_properties
            .memory_types
            .get(index as usize)
            .map(|t| t.property_flags)
            .unwrap_or_else(vk::MemoryPropertyFlags::empty)
    }

    /// Takes a queue from `family`, blocking while the family is exhausted.
    pub fn acquire_queue(&self, family_index: u32) -> Option<vk::Queue> {
        let pool = self
            .queue_pools
            .iter()
            .find(|p| p.family_index == family_index)?;
        let mut queues = pool.queues.lock();
        while queues.is_empty() {
            pool.condvar.wait(&mut queues);
        }
        queues.pop()
    }

    pub fn reclaim_queue(&self, family_index: u32, queue: vk::Queue) {
        if let Some(pool) = self
            .queue_pools
            .iter()
            .find(|p| p.family_index == family_index)
        {
            pool.queues.lock().push(queue);
            pool.condvar.notify_one();
        }
    }

    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.raw.device_wait_idle();
        }
    }

    // ----------------------------------------------- pipeline construction

    pub(crate) fn create_shader_module(&self, spirv: &[u32]) -> Result<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::builder().code(spirv);
        unsafe { self.raw.create_shader_module(&info, None) }.map_err(driver_err)
    }

    pub(crate) unsafe fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.raw.destroy_shader_module(module, None);
    }

    pub(crate) fn create_descriptorset_layout(
        &self,
        binding_types: &[BindingType],
    ) -> Result<vk::DescriptorSetLayout> {
        let samplers = [self.texelfetch_sampler];
        let mut bindings = Vec::with_capacity(binding_types.len());
        for (i, ty) in binding_types.iter().enumerate() {
            let descriptor_type = match ty {
                BindingType::StorageBuffer | BindingType::None => {
                    vk::DescriptorType::STORAGE_BUFFER
                }
                BindingType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
                BindingType::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            };
            let mut binding = vk::DescriptorSetLayoutBinding::builder()
                .binding(i as u32)
                .descriptor_type(descriptor_type)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE);
            if *ty == BindingType::CombinedImageSampler {
                binding = binding.immutable_samplers(&samplers);
            }
            bindings.push(binding.build());
        }
        let mut info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        if self.uses_push_descriptor {
            info = info.flags(vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR);
        }
        unsafe { self.raw.create_descriptor_set_layout(&info, None) }.map_err(driver_err)
    }

    pub(crate) unsafe fn destroy_descriptorset_layout(&self, layout: vk::DescriptorSetLayout) {
        self.raw.destroy_descriptor_set_layout(layout, None);
    }

    pub(crate) fn create_pipeline_layout(
        &self,
        push_constant_count: u32,
        descriptorset_layout: vk::DescriptorSetLayout,
    ) -> Result<vk::PipelineLayout> {
        let set_layouts = [descriptorset_layout];
        let ranges = [vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(push_constant_count * 4)
            .build()];
        let mut info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        if push_constant_count > 0 {
            info = info.push_constant_ranges(&ranges);
        }
        unsafe { self.raw.create_pipeline_layout(&info, None) }.map_err(driver_err)
    }

    pub(crate) unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.raw.destroy_pipeline_layout(layout, None);
    }

    pub(crate) fn create_compute_pipeline(
        &self,
        shader_module: vk::ShaderModule,
        pipeline_layout: vk::PipelineLayout,
        specialization_bits: &[u32],
        local_size: (u32, u32, u32),
    ) -> Result<vk::Pipeline> {
        // user constants at ids 0..n, workgroup size on the reserved ids
        let mut data: Vec<u32> = specialization_bits.to_vec();
        let mut entries: Vec<vk::SpecializationMapEntry> = (0..specialization_bits.len())
            .map(|i| vk::SpecializationMapEntry {
                constant_id: i as u32,
                offset: (i * 4) as u32,
                size: 4,
            })
            .collect();
        for (slot, value) in crate::reflect::LOCAL_SIZE_SPEC_IDS
            .iter()
            .zip([local_size.0, local_size.1, local_size.2])
        {
            entries.push(vk::SpecializationMapEntry {
                constant_id: *slot,
                offset: (data.len() * 4) as u32,
                size: 4,
            });
            data.push(value);
        }

        let spec_data: &[u8] = bytemuck::cast_slice(&data);
        let spec_info = vk::SpecializationInfo::builder()
            .map_entries(&entries)
            .data(spec_data);
        let entry_point = std::ffi::CStr::from_bytes_with_nul(b"main\0").unwrap();
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(entry_point)
            .specialization_info(&spec_info);
        let info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage.build())
            .layout(pipeline_layout);

        let pipelines = unsafe {
            self.raw
                .create_compute_pipelines(vk::PipelineCache::null(), &[info.build()], None)
        }
        .map_err(|(_, e)| driver_err(e))?;
        Ok(pipelines[0])
    }

    pub(crate) unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.raw.destroy_pipeline(pipeline, None);
    }

    pub(crate) fn create_descriptor_update_template(
        &self,
        binding_types: &[BindingType],
        descriptorset_layout: vk::DescriptorSetLayout,
        pipeline_layout: vk::PipelineLayout,
    ) -> Result<Option<vk::DescriptorUpdateTemplateKHR>> {
        let Some(fns) = &self.fns.descriptor_update_template else {
            return Ok(None);
        };

        // one tightly packed descriptor info per binding; the recorder lays
        // the structs out in the same order at update time
        let stride = mem::size_of::<vk::DescriptorImageInfo>()
            .max(mem::size_of::<vk::DescriptorBufferInfo>());
        let entries: Vec<vk::DescriptorUpdateTemplateEntryKHR> = binding_types
            .iter()
            .enumerate()
            .map(|(i, ty)| {
                let descriptor_type = match ty {
                    BindingType::StorageBuffer | BindingType::None => {
                        vk::DescriptorType::STORAGE_BUFFER
                    }
                    BindingType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
                    BindingType::CombinedImageSampler => {
                        vk::DescriptorType::COMBINED_IMAGE_SAMPLER
                    }
                };
                vk::DescriptorUpdateTemplateEntryKHR {
                    dst_binding: i as u32,
                    dst_array_element: 0,
                    descriptor_count: 1,
                    descriptor_type,
                    offset: i * stride,
                    stride,
                }
            })
            .collect();

        let info = vk::DescriptorUpdateTemplateCreateInfoKHR::builder()
            .descriptor_update_entries(&entries)
            .template_type(vk::DescriptorUpdateTemplateTypeKHR::DESCRIPTOR_SET)
            .descriptor_set_layout(descriptorset_layout)
            .pipeline_bind_point(vk::PipelineBindPoint::COMPUTE)
            .pipeline_layout(pipeline_layout);

        let mut template = vk::DescriptorUpdateTemplateKHR::null();
        let result = unsafe {
            (fns.create_descriptor_update_template_khr)(
                self.raw.handle(),
                &info.build(),
                ptr::null(),
                &mut template,
            )
        };
        if result != vk::Result::SUCCESS {
            return Err(driver_err(result));
        }
        Ok(Some(template))
    }

    pub(crate) unsafe fn destroy_pipeline_entry(
        &self,
        shader_module: vk::ShaderModule,
        descriptorset_layout: vk::DescriptorSetLayout,
        pipeline_layout: vk::PipelineLayout,
        pipeline: vk::Pipeline,
        descriptor_update_template: Option<vk::DescriptorUpdateTemplateKHR>,
    ) {
        if let (Some(template), Some(fns)) =
            (descriptor_update_template, &self.fns.descriptor_update_template)
        {
            (fns.destroy_descriptor_update_template_khr)(self.raw.handle(), template, ptr::null());
        }
        self.destroy_pipeline(pipeline);
        self.destroy_pipeline_layout(pipeline_layout);
        self.destroy_descriptorset_layout(descriptorset_layout);
        self.destroy_shader_module(shader_module);
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            let _ = self.raw.device_wait_idle();
            self.raw.destroy_sampler(self.texelfetch_sampler, None);
            self.raw.destroy_device(None);
        }
    }
}

/// Registry-facing device: allocator pools, pipeline cache, dummy bindings.
pub struct Device {
    // dummies and pools drop before `shared`
    dummy_buffer: Mat,
    dummy_image: Option<Mat>,
    blob_allocators: Mutex<Vec<Arc<dyn DeviceAllocator>>>,
    staging_allocators: Mutex<Vec<Arc<dyn DeviceAllocator>>>,
    weight_allocator: Arc<WeightAllocator>,
    weight_staging_allocator: Arc<StagingAllocator>,
    pipeline_cache: Arc<PipelineCache>,
    device_index: usize,
    shared: Arc<DeviceShared>,
}

impl Device {
    pub(crate) fn new(instance: &GpuInstance, index: usize) -> Result<Arc<Self>> {
        let info = instance.info(index).ok_or(Error::NoDevice)?.clone();
        let physical_device = instance.physical_device(index).ok_or(Error::NoDevice)?;
        let raw_instance = instance.ash_instance();

        // one create-info per distinct family we pull queues from
        let mut queue_infos = Vec::new();
        let compute_priorities = vec![1.0f32; info.compute_queue_count.max(1) as usize];
        queue_infos.push(
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(info.compute_queue_family_index)
                .queue_priorities(&compute_priorities)
                .build(),
        );
        let transfer_priorities = vec![1.0f32; info.transfer_queue_count.max(1) as usize];
        if !info.unified_compute_transfer_queue
            && info.transfer_queue_family_index != info.compute_queue_family_index
        {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(info.transfer_queue_family_index)
                    .queue_priorities(&transfer_priorities)
                    .build(),
            );
        }

        let extension_names: Vec<CString> = info
            .extensions
            .enabled_names()
            .iter()
            .map(|n| CString::new(*n).unwrap())
            .collect();
        let extension_ptrs: Vec<*const i8> = extension_names.iter().map(|e| e.as_ptr()).collect();

        // negotiated feature chain; only what the adapter reported
        let mut storage_16bit = vk::PhysicalDevice16BitStorageFeatures::builder()
            .storage_buffer16_bit_access(info.support_fp16_storage)
            .uniform_and_storage_buffer16_bit_access(info.support_fp16_uniform)
            .build();
        let mut storage_8bit = vk::PhysicalDevice8BitStorageFeatures::builder()
            .storage_buffer8_bit_access(info.support_int8_storage)
            .uniform_and_storage_buffer8_bit_access(info.support_int8_uniform)
            .build();
        let mut float16_int8 = vk::PhysicalDeviceShaderFloat16Int8Features::builder()
            .shader_float16(info.support_fp16_arithmetic)
            .shader_int8(info.support_int8_arithmetic)
            .build();
        let mut ycbcr = vk::PhysicalDeviceSamplerYcbcrConversionFeatures::builder()
            .sampler_ycbcr_conversion(info.support_ycbcr_conversion)
            .build();

        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs);
        if info.extensions.khr_16bit_storage {
            create_info = create_info.push_next(&mut storage_16bit);
        }
        if info.extensions.khr_8bit_storage {
            create_info = create_info.push_next(&mut storage_8bit);
        }
        if info.extensions.khr_shader_float16_int8 {
            create_info = create_info.push_next(&mut float16_int8);
        }
        if info.extensions.khr_sampler_ycbcr_conversion {
            create_info = create_info.push_next(&mut ycbcr);
        }

        let raw = unsafe { raw_instance.create_device(physical_device, &create_info, None) }
            .map_err(|e| {
                log::error!("vkCreateDevice failed on adapter {index}: {e:?}");
                driver_err(e)
            })?;

        let load = |name: &std::ffi::CStr| unsafe {
            mem::transmute(raw_instance.get_device_proc_addr(raw.handle(), name.as_ptr()))
        };
        let fns = DeviceExtensionFunctions {
            descriptor_update_template: info
                .extensions
                .khr_descriptor_update_template
                .then(|| vk::KhrDescriptorUpdateTemplateFn::load(load)),
            push_descriptor: info
                .extensions
                .khr_push_descriptor
                .then(|| vk::KhrPushDescriptorFn::load(load)),
            get_memory_requirements2: info
                .extensions
                .khr_get_memory_requirements2
                .then(|| vk::KhrGetMemoryRequirements2Fn::load(load)),
            bind_memory2: info
                .extensions
                .khr_bind_memory2
                .then(|| vk::KhrBindMemory2Fn::load(load)),
        };

        let mut queue_pools = Vec::new();
        {
            let queues = (0..info.compute_queue_count.max(1))
                .map(|i| unsafe { raw.get_device_queue(info.compute_queue_family_index, i) })
                .collect();
            queue_pools.push(QueuePool {
                family_index: info.compute_queue_family_index,
                queues: Mutex::new(queues),
                condvar: Condvar::new(),
            });
        }
        if !info.unified_compute_transfer_queue
            && info.transfer_queue_family_index != info.compute_queue_family_index
        {
            let queues = (0..info.transfer_queue_count.max(1))
                .map(|i| unsafe { raw.get_device_queue(info.transfer_queue_family_index, i) })
                .collect();
            queue_pools.push(QueuePool {
                family_index: info.transfer_queue_family_index,
                queues: Mutex::new(queues),
                condvar: Condvar::new(),
            });
        }

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .unnormalized_coordinates(false);
        let texelfetch_sampler =
            unsafe { raw.create_sampler(&sampler_info, None) }.map_err(driver_err)?;

        let uses_push_descriptor = info.extensions.khr_push_descriptor;
        let shared = Arc::new(DeviceShared {
            raw,
            physical_device,
            info,
            gpdp2: instance.gpdp2().cloned(),
            fns,
            queue_pools,
            texelfetch_sampler,
            uses_push_descriptor,
        });

        let weight_allocator = WeightAllocator::new(shared.clone());
        let weight_staging_allocator = StagingAllocator::new(shared.clone());
        let pipeline_cache = PipelineCache::new(shared.clone());

        // dummy resources so optional bindings always have something valid
        let mut dummy_buffer = Mat::new();
        let weight_dyn: Arc<dyn DeviceAllocator> = weight_allocator.clone();
        dummy_buffer.create_device_1d(32, 4, 1, &weight_dyn)?;
        let mut dummy_image = Mat::new();
        let dummy_image = match dummy_image.create_like_image(&Mat::new_3d(1, 1, 1, Default::default()), &weight_dyn)
        {
            Ok(()) => Some(dummy_image),
            Err(e) => {
                log::warn!("dummy image allocation failed: {e}; image bindings disabled");
                None
            }
        };

        Ok(Arc::new(Self {
            dummy_buffer,
            dummy_image,
            blob_allocators: Mutex::new(Vec::new()),
            staging_allocators: Mutex::new(Vec::new()),
            weight_allocator,
            weight_staging_allocator,
            pipeline_cache,
            device_index: index,
            shared,
        }))
    }

    pub fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    pub fn info(&self) -> &GpuInfo {
        self.shared.info()
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }

    pub fn pipeline_cache(&self) -> &Arc<PipelineCache> {
        &self.pipeline_cache
    }

    pub fn wait_idle(&self) {
        self.shared.wait_idle();
    }

    /// Compiles a shader body against this device's feature set.
    pub fn compile_spirv(&self, body: &str, opt: &Options) -> Result<Vec<u32>> {
        shader::compile_spirv_module(body, opt, self.info())
    }

    // ------------------------------------------------------ allocator pool

    pub fn acquire_blob_allocator(&self) -> Arc<dyn DeviceAllocator> {
        if let Some(a) = self.blob_allocators.lock().pop() {
            return a;
        }
        BlobAllocator::new(self.shared.clone())
    }

    pub fn reclaim_blob_allocator(&self, allocator: Arc<dyn DeviceAllocator>) {
        self.blob_allocators.lock().push(allocator);
    }

    pub fn acquire_staging_allocator(&self) -> Arc<dyn DeviceAllocator> {
        if let Some(a) = self.staging_allocators.lock().pop() {
            return a;
        }
        StagingAllocator::new(self.shared.clone())
    }

    pub fn reclaim_staging_allocator(&self, allocator: Arc<dyn DeviceAllocator>) {
        self.staging_allocators.lock().push(allocator);
    }

    pub fn weight_allocator(&self) -> Arc<dyn DeviceAllocator> {
        self.weight_allocator.clone()
    }

    pub fn weight_staging_allocator(&self) -> Arc<dyn DeviceAllocator> {
        self.weight_staging_allocator.clone()
    }

    // ------------------------------------------------------------- dummies

    pub fn dummy_buffer(&self) -> Mat {
        self.dummy_buffer.clone()
    }

    pub fn dummy_image(&self) -> Option<Mat> {
        self.dummy_image.clone()
    }

    // -------------------------------------------------------------- queues

    pub fn acquire_queue(&self, family_index: u32) -> Option<vk::Queue> {
        self.shared.acquire_queue(family_index)
    }

    pub fn reclaim_queue(&self, family_index: u32, queue: vk::Queue) {
        self.shared.reclaim_queue(family_index, queue);
    }

    // ------------------------------------------------------------- queries

    /// Whether a tensor of this shape can live in a storage image.
    pub fn shape_support_image_storage(&self, m: &Mat) -> bool {
        let info = self.info();
        let lane = if m.elempack > 0 {
            m.elemsize / m.elempack as usize
        } else {
            0
        };
        if lane != 2 && lane != 4 {
            return false;
        }
        if m.elempack != 1 && m.elempack != 4 && m.elempack != 8 {
            return false;
        }
        let texel_w = if m.elempack == 8 { m.w as u32 * 2 } else { m.w as u32 };
        texel_w <= info.max_image_dimension_3d
            && m.h as u32 <= info.max_image_dimension_3d
            && m.c as u32 <= info.max_image_dimension_3d
    }

    /// Device-local heap budget in MiB, through `VK_EXT_memory_budget` when
    /// present, else the raw heap sizes.
    pub fn get_heap_budget(&self) -> u32 {
        self.heap_query(true)
    }

    /// Current device-local heap usage in MiB; zero without the extension.
    pub fn get_heap_usage(&self) -> u32 {
        if !self.info().extensions.ext_memory_budget {
            return 0;
        }
        self.heap_query(false)
    }

    fn heap_query(&self, budget: bool) -> u32 {
        let info = self.info();
        let device_local_total_mb = |sizes: &[u64]| -> u32 {
            let heaps =
                &info.memory_properties.memory_heaps[..info.memory_properties.memory_heap_count as usize];
            heaps
                .iter()
                .enumerate()
                .filter(|(_, h)| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
                .map(|(i, h)| {
                    let bytes = sizes.get(i).copied().unwrap_or(h.size);
                    (bytes / (1024 * 1024)) as u32
                })
                .sum()
        };

        if info.extensions.ext_memory_budget {
            if let Some(gpdp2) = &self.shared.gpdp2 {
                let mut budget_props = vk::PhysicalDeviceMemoryBudgetPropertiesEXT::default();
                let mut props2 = vk::PhysicalDeviceMemoryProperties2::builder()
                    .push_next(&mut budget_props)
                    .build();
                unsafe {
                    gpdp2.get_physical_device_memory_properties2(
                        self.shared.physical_device,
                        &mut props2,
                    )
                };
                let sizes = if budget {
                    budget_props.heap_budget
                } else {
                    budget_props.heap_usage
                };
                return device_local_total_mb(&sizes);
            }
        }
        if budget {
            device_local_total_mb(&[])
        } else {
            0
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.device_index)
            .field("name", &self.info().device_name)
            .finish()
    }
}
