/*! Deduplicating pipeline cache.
 *
 *  One entry per `(SPIR-V digest, specialization constants, workgroup)` key,
 *  each entry carrying the shader module, descriptor-set layout, pipeline
 *  layout, pipeline, optional descriptor-update template and the reflected
 *  [`ShaderInfo`].
 *
 *  Lookup takes the cache lock briefly; construction happens outside it
 *  under a per-key slot lock, so two threads racing on the same key compile
 *  once and share, while different keys build concurrently.
 */

use std::hash::Hasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ash::vk;
use fnv::FnvHasher;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use vpt::Result;

use crate::device::DeviceShared;
use crate::reflect::{resolve_shader_info, ShaderInfo};
use crate::{shader_values_bits, ShaderValue};

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct PipelineKey {
    digest: u64,
    specializations: Vec<u32>,
    local_size: (u32, u32, u32),
}

/// Everything a dispatch needs, built once and shared read-only.
pub struct PipelineEntry {
    pub shader_module: vk::ShaderModule,
    pub descriptorset_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub descriptor_update_template: Option<vk::DescriptorUpdateTemplateKHR>,
    pub shader_info: ShaderInfo,
    pub local_size: (u32, u32, u32),
    device: Arc<DeviceShared>,
}

unsafe impl Send for PipelineEntry {}
unsafe impl Sync for PipelineEntry {}

impl Drop for PipelineEntry {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline_entry(
                self.shader_module,
                self.descriptorset_layout,
                self.pipeline_layout,
                self.pipeline,
                self.descriptor_update_template,
            );
        }
    }
}

type Slot = Arc<Mutex<Option<Arc<PipelineEntry>>>>;

pub struct PipelineCache {
    device: Arc<DeviceShared>,
    entries: Mutex<FxHashMap<PipelineKey, Slot>>,
    compile_count: AtomicUsize,
}

fn fnv_digest(spirv: &[u32]) -> u64 {
    let mut hasher = FnvHasher::default();
    for &word in spirv {
        hasher.write_u32(word);
    }
    hasher.finish()
}

impl PipelineCache {
    pub fn new(device: Arc<DeviceShared>) -> Arc<Self> {
        Arc::new(Self {
            device,
            entries: Mutex::new(FxHashMap::default()),
            compile_count: AtomicUsize::new(0),
        })
    }

    /// Number of pipelines actually built; cache hits do not move this.
    pub fn compile_count(&self) -> usize {
        self.compile_count.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Looks up (or builds) the pipeline for `spirv` specialized with
    /// `specializations` at workgroup size `local_size`.
    pub fn get_pipeline(
        &self,
        spirv: &[u32],
        specializations: &[ShaderValue],
        local_size: (u32, u32, u32),
    ) -> Result<Arc<PipelineEntry>> {
        let key = PipelineKey {
            digest: fnv_digest(spirv),
            specializations: shader_values_bits(specializations),
            local_size,
        };

        let slot: Slot = {
            let mut entries = self.entries.lock();
            entries.entry(key.clone()).or_default().clone()
        };

        // per-key construction lock: the first thread in builds, the rest
        // wait here and take the shared entry
        let mut guard = slot.lock();
        if let Some(entry) = guard.as_ref() {
            return Ok(entry.clone());
        }

        log::debug!(
            "pipeline cache miss: digest {:016x}, local size {:?}",
            key.digest,
            local_size
        );
        let entry = self.build_entry(spirv, &key.specializations, local_size)?;
        self.compile_count.fetch_add(1, Ordering::Relaxed);
        *guard = Some(entry.clone());
        Ok(entry)
    }

    fn build_entry(
        &self,
        spirv: &[u32],
        specialization_bits: &[u32],
        local_size: (u32, u32, u32),
    ) -> Result<Arc<PipelineEntry>> {
        let shader_info = resolve_shader_info(spirv)?;

        let device = &self.device;
        let shader_module = device.create_shader_module(spirv)?;

        let binding_types = &shader_info.binding_types[..shader_info.binding_count as usize];
        let descriptorset_layout = match device.create_descriptorset_layout(binding_types) {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.destroy_shader_module(shader_module) };
                return Err(e);
            }
        };

        let pipeline_layout = match device
            .create_pipeline_layout(shader_info.push_constant_count, descriptorset_layout)
        {
            Ok(layout) => layout,
            Err(e) => {
                unsafe {
                    device.destroy_descriptorset_layout(descriptorset_layout);
                    device.destroy_shader_module(shader_module);
                }
                return Err(e);
            }
        };

        let pipeline = match device.create_compute_pipeline(
            shader_module,
            pipeline_layout,
            specialization_bits,
            local_size,
        ) {
            Ok(p) => p,
            Err(e) => {
                unsafe {
                    device.destroy_pipeline_layout(pipeline_layout);
                    device.destroy_descriptorset_layout(descriptorset_layout);
                    device.destroy_shader_module(shader_module);
                }
                return Err(e);
            }
        };

        let descriptor_update_template = if device.uses_push_descriptor() {
            None
        } else {
            device
                .create_descriptor_update_template(
                    binding_types,
                    descriptorset_layout,
                    pipeline_layout,
                )
                .unwrap_or(None)
        };

        Ok(Arc::new(PipelineEntry {
            shader_module,
            descriptorset_layout,
            pipeline_layout,
            pipeline,
            descriptor_update_template,
            shader_info,
            local_size,
            device: device.clone(),
        }))
    }

    /// Drops every cached entry. Entries still referenced by live pipelines
    /// survive until their holders drop.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_distinguishes_words() {
        let a = fnv_digest(&[1, 2, 3]);
        let b = fnv_digest(&[1, 2, 4]);
        let c = fnv_digest(&[1, 2, 3]);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn key_equality() {
        let k1 = PipelineKey {
            digest: 7,
            specializations: vec![1, 2],
            local_size: (4, 4, 4),
        };
        let k2 = PipelineKey {
            digest: 7,
            specializations: vec![1, 2],
            local_size: (4, 4, 4),
        };
        let k3 = PipelineKey {
            digest: 7,
            specializations: vec![1, 2],
            local_size: (8, 8, 1),
        };
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }
}
