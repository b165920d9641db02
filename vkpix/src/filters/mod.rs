//! One-shot filter operators.
//!
//! Every operator follows the same shape: construct against a device index,
//! acquire blob + staging allocators and one recorder, compile the embedded
//! filter source once through the pipeline cache, and expose a single
//! `filter` call that records upload, dispatch and download, submits, and
//! returns the measured kernel seconds (0.0 without the `benchmark`
//! feature).

mod brightness;
mod contrast;
mod exposure;
mod filter2d;
mod gamma;
mod invert;

pub use brightness::Brightness;
pub use contrast::Contrast;
pub use exposure::Exposure;
pub use filter2d::Filter2D;
pub use gamma::Gamma;
pub use invert::ColorInvert;

use std::sync::Arc;

use vpc::{ComputeRecorder, Device, DeviceAllocator, Mat, Options, Pipeline, ShaderValue};
use vpt::{DataType, Result, StorageKind};

/// State every operator carries; constructed once, reused per call.
pub(crate) struct OperatorBase {
    pub device: Arc<Device>,
    pub pipeline: Pipeline,
    pub cmd: ComputeRecorder,
    pub opt: Options,
    blob_allocator: Arc<dyn DeviceAllocator>,
    staging_allocator: Arc<dyn DeviceAllocator>,
}

impl OperatorBase {
    pub fn new(gpu: Option<usize>, name: &str, shader_body: &str) -> Result<Self> {
        vpc::create_gpu_instance()?;
        let index = gpu.unwrap_or_else(vpc::get_default_gpu_index);
        let device = vpc::get_gpu_device(index)?;

        let blob_allocator = device.acquire_blob_allocator();
        let staging_allocator = device.acquire_staging_allocator();
        let mut opt = Options::new();
        opt.blob_device_allocator = Some(blob_allocator.clone());
        opt.staging_device_allocator = Some(staging_allocator.clone());

        let cmd = ComputeRecorder::new(&device, name)?;

        let spirv = device.compile_spirv(shader_body, &opt)?;
        let mut pipeline = Pipeline::new(&device);
        pipeline.set_optimal_local_size_xyz(16, 16, 1);
        pipeline.create(&spirv, &[], &opt)?;
        log::debug!("{name}: pipeline ready on {}", device.info().device_name);

        Ok(Self {
            device,
            pipeline,
            cmd,
            opt,
            blob_allocator,
            staging_allocator,
        })
    }

    /// The shared record flow of a point filter: upload (converting to fp32
    /// if needed), dispatch with `[w, h, c, cstep] ++ params` push
    /// constants, download, submit, reset.
    pub fn run_point_filter(
        &mut self,
        src: &Mat,
        dst: &mut Mat,
        params: &[ShaderValue],
    ) -> Result<f64> {
        let src = if src.data_type == DataType::Float32 {
            src.clone()
        } else {
            src.convert(DataType::Float32, 1.0)
        };

        let mut src_gpu = Mat::new();
        if src.device() == StorageKind::Cpu {
            self.cmd.record_clone(&src, &mut src_gpu, &self.opt);
        } else {
            src_gpu = src.clone();
        }

        let mut dst_gpu = Mat::new();
        let blob = self
            .opt
            .blob_device_allocator
            .clone()
            .expect("operator blob allocator");
        dst_gpu.create_like_device(&src, &blob)?;

        #[cfg(feature = "benchmark")]
        self.cmd.benchmark_start();

        let mut constants = vec![
            ShaderValue::I32(src.w),
            ShaderValue::I32(src.h),
            ShaderValue::I32(src.c),
            ShaderValue::I32(src.cstep as i32),
        ];
        constants.extend_from_slice(params);
        let dispatch = (
            src.w.max(1) as u32,
            src.h.max(1) as u32,
            src.c.max(1) as u32,
        );
        self.cmd
            .record_pipeline(&self.pipeline, &[&src_gpu, &dst_gpu], &[], &constants, dispatch);

        #[cfg(feature = "benchmark")]
        self.cmd.benchmark_end();

        if dst.device() == StorageKind::Cpu || dst.empty() {
            self.cmd.record_clone(&dst_gpu, dst, &self.opt);
        } else {
            *dst = dst_gpu.clone();
        }

        let elapsed = self.submit()?;
        dst.copy_attribute(&src);
        Ok(elapsed)
    }

    /// Runs the recorded work and returns the benchmark seconds.
    pub fn submit(&mut self) -> Result<f64> {
        self.cmd.submit_and_wait(u64::MAX)?;
        #[cfg(feature = "benchmark")]
        let elapsed = {
            let t = self.cmd.benchmark();
            if t.is_nan() {
                0.0
            } else {
                t
            }
        };
        #[cfg(not(feature = "benchmark"))]
        let elapsed = 0.0;
        self.cmd.reset()?;
        Ok(elapsed)
    }
}

impl Drop for OperatorBase {
    fn drop(&mut self) {
        self.device
            .reclaim_blob_allocator(self.blob_allocator.clone());
        self.device
            .reclaim_staging_allocator(self.staging_allocator.clone());
    }
}

/// Declarations shared by the simple point-filter shaders.
pub(crate) const POINT_FILTER_HEAD: &str = "
layout (binding = 0) readonly buffer bottom_blob { sfp bottom_blob_data[]; };
layout (binding = 1) writeonly buffer top_blob { sfp top_blob_data[]; };
";
