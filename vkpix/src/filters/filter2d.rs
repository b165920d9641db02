use vpc::{Mat, ShaderValue, TransferRecorder};
use vpt::{DataType, Error, Result};

use super::{OperatorBase, POINT_FILTER_HEAD};

fn filter_src() -> String {
    format!(
        "{POINT_FILTER_HEAD}
layout (binding = 2) readonly buffer kernel_blob {{ float kernel_data[]; }};
layout (push_constant) uniform parameter
{{
    int w;
    int h;
    int c;
    int cstep;
    int ksize;
}} p;
void main()
{{
    int gx = int(gl_GlobalInvocationID.x);
    int gy = int(gl_GlobalInvocationID.y);
    int gz = int(gl_GlobalInvocationID.z);
    if (gx >= p.w || gy >= p.h || gz >= p.c)
        return;
    int anchor = p.ksize / 2;
    float acc = 0.0f;
    for (int ky = 0; ky < p.ksize; ky++)
    {{
        int sy = clamp(gy + ky - anchor, 0, p.h - 1);
        for (int kx = 0; kx < p.ksize; kx++)
        {{
            int sx = clamp(gx + kx - anchor, 0, p.w - 1);
            float v = float(buffer_ld1(bottom_blob_data, gz * p.cstep + sy * p.w + sx));
            acc += v * kernel_data[ky * p.ksize + kx];
        }}
    }}
    buffer_st1(top_blob_data, gz * p.cstep + gy * p.w + gx, afp(acc));
}}
"
    )
}

/// Spatial convolution with a square kernel, edges clamped.
///
/// The kernel is uploaded once into weight storage at construction and
/// reused across calls.
pub struct Filter2D {
    base: OperatorBase,
    kernel_gpu: Mat,
    ksize: i32,
}

impl Filter2D {
    /// `kernel` must be a square 2-D fp32 tensor with odd side length.
    pub fn new(gpu: Option<usize>, kernel: &Mat) -> Result<Self> {
        if kernel.dims != 2
            || kernel.w != kernel.h
            || kernel.w % 2 == 0
            || kernel.data_type != DataType::Float32
        {
            return Err(Error::ShapeMismatch {
                expected: "odd square fp32 kernel".to_string(),
                actual: format!("{}x{} {:?}", kernel.w, kernel.h, kernel.data_type),
            });
        }
        let base = OperatorBase::new(gpu, "Filter2D", &filter_src())?;

        // long-lived kernel weights travel through the transfer path
        let mut kernel_gpu = Mat::new();
        let mut transfer = TransferRecorder::new(&base.device)?;
        transfer.record_upload(kernel, &mut kernel_gpu, &base.opt, true);
        transfer.submit_and_wait(u64::MAX)?;

        Ok(Self {
            base,
            kernel_gpu,
            ksize: kernel.w,
        })
    }

    pub fn filter(&mut self, src: &Mat, dst: &mut Mat) -> Result<f64> {
        let src = if src.data_type == DataType::Float32 {
            src.clone()
        } else {
            src.convert(DataType::Float32, 1.0)
        };

        let mut src_gpu = Mat::new();
        self.base.cmd.record_clone(&src, &mut src_gpu, &self.base.opt);

        let mut dst_gpu = Mat::new();
        let blob = self
            .base
            .opt
            .blob_device_allocator
            .clone()
            .expect("operator blob allocator");
        dst_gpu.create_like_device(&src, &blob)?;

        #[cfg(feature = "benchmark")]
        self.base.cmd.benchmark_start();

        let constants = [
            ShaderValue::I32(src.w),
            ShaderValue::I32(src.h),
            ShaderValue::I32(src.c),
            ShaderValue::I32(src.cstep as i32),
            ShaderValue::I32(self.ksize),
        ];
        let dispatch = (
            src.w.max(1) as u32,
            src.h.max(1) as u32,
            src.c.max(1) as u32,
        );
        self.base.cmd.record_pipeline(
            &self.base.pipeline,
            &[&src_gpu, &dst_gpu, &self.kernel_gpu],
            &[],
            &constants,
            dispatch,
        );

        #[cfg(feature = "benchmark")]
        self.base.cmd.benchmark_end();

        self.base.cmd.record_clone(&dst_gpu, dst, &self.base.opt);
        let elapsed = self.base.submit()?;
        dst.copy_attribute(&src);
        Ok(elapsed)
    }
}
