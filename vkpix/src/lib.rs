/*! GPU-accelerated image processing over a Vulkan compute runtime.
 *
 *  The interesting machinery lives in [`vkpix-core`]: device registry,
 *  allocators, pipeline cache, command recorder, packing kernels. This crate
 *  re-exports that surface and adds the one-shot filter operators, each a
 *  thin wrapper owning one cached pipeline and one recorder.
 *
 *  ```no_run
 *  use vkpix::{filters::Brightness, DataType, Mat};
 *
 *  let mut src = Mat::new_3d(640, 480, 3, DataType::Float32);
 *  src.fill(0.25f32);
 *  let mut dst = Mat::new();
 *  let mut filter = Brightness::new(None).unwrap();
 *  filter.filter(&src, &mut dst, 0.1).unwrap();
 *  ```
 *
 *  [`vkpix-core`]: vpc
 */

pub mod filters;

pub use vpc::{
    cast_bfloat16_to_float32, cast_float16_to_float32, cast_float32_to_bfloat16,
    cast_float32_to_float16, cast_int8_to_float16, cast_int8_to_float32, compile_spirv_module,
    convert_packing, create_gpu_instance, destroy_gpu_instance, get_default_gpu_index,
    get_gpu_count, get_gpu_device, get_gpu_info, get_gpu_instance, resolve_shader_info,
    BindingType, ComputeRecorder, Device, DeviceAllocator, GpuInfo, GpuType, Mat, MinMax,
    Options, Pipeline, PipelineCache, ShaderInfo, ShaderValue, TransferRecorder,
};
pub use vpt::{
    ChannelOrder, ColorFormat, ColorRange, ColorSpace, DataType, Error, MatFlags, NormType,
    Rational, Result, StorageKind,
};

/// Core runtime crate, for callers that need the full surface.
pub use vpc as core;
