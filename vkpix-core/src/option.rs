/*! Per-call runtime knobs, consumed by shader codegen, pipeline lookup and
 *  the command recorder. All hooks default to "use the device's own".
 */

use std::sync::Arc;

use crate::alloc::DeviceAllocator;
use crate::cache::PipelineCache;
use crate::mat::HostAllocator;

#[derive(Clone, Default)]
pub struct Options {
    /// Host-side scratch allocator hook.
    pub blob_allocator: Option<Arc<dyn HostAllocator>>,
    /// Host-side workspace allocator hook.
    pub workspace_allocator: Option<Arc<dyn HostAllocator>>,

    /// Device blob allocator; `None` uses the device default.
    pub blob_device_allocator: Option<Arc<dyn DeviceAllocator>>,
    /// Device workspace allocator; `None` uses the device default.
    pub workspace_device_allocator: Option<Arc<dyn DeviceAllocator>>,
    /// Host-visible staging allocator; `None` uses the device default.
    pub staging_device_allocator: Option<Arc<dyn DeviceAllocator>>,

    /// Pipeline cache override; `None` uses the device's.
    pub pipeline_cache: Option<Arc<PipelineCache>>,

    pub use_bf16_storage: bool,

    pub use_fp16_packed: bool,
    pub use_fp16_storage: bool,
    pub use_fp16_arithmetic: bool,
    pub use_fp16_uniform: bool,
    pub use_int8_packed: bool,
    pub use_int8_storage: bool,
    pub use_int8_arithmetic: bool,
    pub use_int8_uniform: bool,

    /// SIMD-friendly packed element layout (elempack 4). On by default.
    pub use_packing_layout: bool,
    /// Allow 8-wide elempack in shaders.
    pub use_shader_pack8: bool,

    pub use_subgroup_basic: bool,
    pub use_subgroup_vote: bool,
    pub use_subgroup_ballot: bool,
    pub use_subgroup_shuffle: bool,

    /// Prefer image-backed over buffer-backed device tensors.
    pub use_image_storage: bool,
    pub use_tensor_storage: bool,

    pub use_local_pool_allocator: bool,
    /// Shared-memory optimization macros in generated shaders.
    pub use_shader_local_memory: bool,
    pub use_cooperative_matrix: bool,
}

impl Options {
    pub fn new() -> Self {
        Self {
            use_packing_layout: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opt = Options::new();
        assert!(opt.use_packing_layout);
        assert!(!opt.use_fp16_storage);
        assert!(opt.blob_device_allocator.is_none());
        assert!(opt.pipeline_cache.is_none());
    }
}
