use vpc::{Mat, ShaderValue};
use vpt::Result;

use super::{OperatorBase, POINT_FILTER_HEAD};

fn filter_src() -> String {
    format!(
        "{POINT_FILTER_HEAD}
layout (push_constant) uniform parameter
{{
    int w;
    int h;
    int c;
    int cstep;
    float brightness;
}} p;
void main()
{{
    int gx = int(gl_GlobalInvocationID.x);
    int gy = int(gl_GlobalInvocationID.y);
    int gz = int(gl_GlobalInvocationID.z);
    if (gx >= p.w || gy >= p.h || gz >= p.c)
        return;
    int gi = gz * p.cstep + gy * p.w + gx;
    afp v = buffer_ld1(bottom_blob_data, gi);
    v = clamp(v + afp(p.brightness), afp(0.0f), afp(1.0f));
    buffer_st1(top_blob_data, gi, v);
}}
"
    )
}

/// Additive brightness over normalized fp32 pixels, clamped to `[0, 1]`.
pub struct Brightness {
    base: OperatorBase,
}

impl Brightness {
    pub fn new(gpu: Option<usize>) -> Result<Self> {
        Ok(Self {
            base: OperatorBase::new(gpu, "Brightness", &filter_src())?,
        })
    }

    /// Applies `brightness` to `src` and fills `dst` with the result (host
    /// storage when `dst` is empty). Returns the measured kernel seconds,
    /// 0.0 when benchmarking is off.
    pub fn filter(&mut self, src: &Mat, dst: &mut Mat, brightness: f32) -> Result<f64> {
        self.base
            .run_point_filter(src, dst, &[ShaderValue::F32(brightness)])
    }
}
