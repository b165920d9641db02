use vpc::Mat;
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
    buffer_st1(top_blob_data, gi, afp(1.0f) - v);
}}
"
    )
}

/// Per-channel negation of normalized fp32 pixels.
pub struct ColorInvert {
    base: OperatorBase,
}

impl ColorInvert {
    pub fn new(gpu: Option<usize>) -> Result<Self> {
        Ok(Self {
            base: OperatorBase::new(gpu, "ColorInvert", &filter_src())?,
        })
    }

    pub fn filter(&mut self, src: &Mat, dst: &mut Mat) -> Result<f64> {
        self.base.run_point_filter(src, dst, &[])
    }
}
