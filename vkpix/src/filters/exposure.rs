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
    float exposure;
}} p;
void main()
{{
    int gx = int(gl_GlobalInvocationID.x);
    int gy = int(gl_GlobalInvocationID.y);
    int gz = int(gl_GlobalInvocationID.z);
    if (gx >= p.w || gy >= p.h || gz >= p.c)
        return;
    int gi = gz * p.cstep + gy * p.w + gx;
    float v = float(buffer_ld1(bottom_blob_data, gi));
    v = clamp(v * exp2(p.exposure), 0.0f, 1.0f);
    buffer_st1(top_blob_data, gi, afp(v));
}}
"
    )
}

/// Photographic exposure in stops: `out = in * 2^exposure`, clamped.
pub struct Exposure {
    base: OperatorBase,
}

impl Exposure {
    pub fn new(gpu: Option<usize>) -> Result<Self> {
        Ok(Self {
            base: OperatorBase::new(gpu, "Exposure", &filter_src())?,
        })
    }

    pub fn filter(&mut self, src: &Mat, dst: &mut Mat, exposure: f32) -> Result<f64> {
        self.base
            .run_point_filter(src, dst, &[ShaderValue::F32(exposure)])
    }
}
