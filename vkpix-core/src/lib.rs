/*!
# vkpix core compute runtime.

Everything beneath the one-shot image operators lives here:

- [`instance`]: process-wide Vulkan instance, adapter enumeration, feature
  negotiation, and the lazily-built per-adapter [`device::Device`] registry.
- [`alloc`]: the allocator family (block-pool blob, bump-pool weight,
  per-size staging cache) and the refcounted GPU memory handles.
- [`mat`] / [`math`]: the N-dimensional image tensor shared by CPU and GPU
  paths, with element-wise and small-matrix host kernels.
- [`shader`] / [`reflect`]: online GLSL compute compilation with
  device-derived macro prelude, and SPIR-V binding introspection.
- [`pipeline`] / [`cache`]: compiled-pipeline objects, deduplicated per
  `(SPIR-V digest, specializations, workgroup)` key.
- [`command`]: the per-thread compute recorder with automatic read/write
  hazard barriers, submit-with-fence, and deferred downloads.
- [`packing`]: the intrinsic elempack/type conversion kernels the recorder
  uses for cross-layout clones.

## Locking

The registry, allocators, queue pools, and pipeline cache are internally
synchronized with `parking_lot` primitives; a [`command::ComputeRecorder`] is
owned by one thread and never shared.
*/

#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications
)]
#![allow(clippy::too_many_arguments)]

pub mod alloc;
pub mod cache;
pub mod command;
pub mod device;
pub mod instance;
pub mod mat;
pub mod math;
pub mod option;
pub mod packing;
pub mod pipeline;
pub mod platform;
pub mod reflect;
pub mod shader;
mod shaders;

pub use vpt as types;

pub use alloc::{BlobAllocator, DeviceAllocator, DeviceBuffer, DeviceImage, StagingAllocator, WeightAllocator};
pub use cache::{PipelineCache, PipelineEntry};
pub use command::{ComputeRecorder, TransferRecorder};
pub use device::Device;
pub use instance::{
    create_gpu_instance, destroy_gpu_instance, get_default_gpu_index, get_gpu_count,
    get_gpu_device, get_gpu_info, get_gpu_instance, GpuInfo, GpuType,
};
pub use mat::Mat;
pub use math::{
    cast_bfloat16_to_float32, cast_float16_to_float32, cast_float32_to_bfloat16,
    cast_float32_to_float16, cast_int8_to_float16, cast_int8_to_float32, MinMax,
};
pub use option::Options;
pub use packing::convert_packing;
pub use pipeline::Pipeline;
pub use reflect::{resolve_shader_info, BindingType, ShaderInfo, BINDING_MAX};
pub use shader::compile_spirv_module;
pub use vpt::{Error, Result};

/// A 32-bit scalar handed to a shader, either as a specialization constant at
/// pipeline build or as a push constant at dispatch.
///
/// The shader sees the raw bit pattern; the variant only records how the host
/// produced it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ShaderValue {
    I32(i32),
    F32(f32),
    U32(u32),
}

impl ShaderValue {
    /// The bit pattern written into specialization or push-constant storage.
    #[inline]
    pub fn bits(self) -> u32 {
        match self {
            Self::I32(v) => v as u32,
            Self::F32(v) => v.to_bits(),
            Self::U32(v) => v,
        }
    }
}

impl From<i32> for ShaderValue {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<f32> for ShaderValue {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

pub(crate) fn shader_values_bits(values: &[ShaderValue]) -> Vec<u32> {
    values.iter().map(|v| v.bits()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_value_bits() {
        assert_eq!(ShaderValue::I32(-1).bits(), u32::MAX);
        assert_eq!(ShaderValue::F32(1.0).bits(), 0x3F80_0000);
        assert_eq!(ShaderValue::U32(7).bits(), 7);
    }
}
