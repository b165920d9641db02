/*! A compiled compute pipeline bound to one device.
 *
 *  `Pipeline` is a handle over a shared [`PipelineEntry`] obtained from the
 *  per-device [`crate::cache::PipelineCache`]; building the same SPIR-V with
 *  the same specializations and workgroup size returns the same entry.
 *  Pipelines are not clonable; share the handle by reference.
 */

use std::sync::Arc;

use ash::vk;
use vpt::Result;

use crate::cache::PipelineEntry;
use crate::device::Device;
use crate::option::Options;
use crate::reflect::ShaderInfo;
use crate::ShaderValue;

pub struct Pipeline {
    device: Arc<Device>,
    entry: Option<Arc<PipelineEntry>>,
    local_size: (u32, u32, u32),
}

impl Pipeline {
    pub fn new(device: &Arc<Device>) -> Self {
        Self {
            device: device.clone(),
            entry: None,
            local_size: (16, 16, 1),
        }
    }

    pub fn set_local_size_xyz(&mut self, w: u32, h: u32, c: u32) {
        self.local_size = (w.max(1), h.max(1), c.max(1));
    }

    /// Picks a workgroup size near `(w, h, c)` that the device can run.
    pub fn set_optimal_local_size_xyz(&mut self, w: u32, h: u32, c: u32) {
        let info = self.device.info();
        let size = optimal_local_size(
            info.max_workgroup_size,
            info.max_workgroup_invocations,
            w,
            h,
            c,
        );
        self.local_size = size;
    }

    /// Compiles (or fetches) the pipeline for `spirv` with the current
    /// workgroup size.
    pub fn create(
        &mut self,
        spirv: &[u32],
        specializations: &[ShaderValue],
        opt: &Options,
    ) -> Result<()> {
        let cache = opt
            .pipeline_cache
            .clone()
            .unwrap_or_else(|| self.device.pipeline_cache().clone());
        let entry = cache.get_pipeline(spirv, specializations, self.local_size)?;
        self.entry = Some(entry);
        Ok(())
    }

    pub fn is_created(&self) -> bool {
        self.entry.is_some()
    }

    pub fn entry(&self) -> Option<&Arc<PipelineEntry>> {
        self.entry.as_ref()
    }

    pub fn shader_info(&self) -> Option<&ShaderInfo> {
        self.entry.as_ref().map(|e| &e.shader_info)
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.entry.as_ref().map_or(vk::Pipeline::null(), |e| e.pipeline)
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.entry
            .as_ref()
            .map_or(vk::PipelineLayout::null(), |e| e.pipeline_layout)
    }

    pub fn local_size_x(&self) -> u32 {
        self.local_size.0
    }

    pub fn local_size_y(&self) -> u32 {
        self.local_size.1
    }

    pub fn local_size_z(&self) -> u32 {
        self.local_size.2
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

/// Clamps a requested workgroup size to the device limits: each axis first,
/// then total invocations by halving x and y alternately, z preserved.
pub(crate) fn optimal_local_size(
    max_size: [u32; 3],
    max_invocations: u32,
    w: u32,
    h: u32,
    c: u32,
) -> (u32, u32, u32) {
    // fall back to the common and safe 4x4x4
    let (mut w, mut h, c) = if w == 0 && h == 0 && c == 0 {
        (4, 4, 4)
    } else {
        (w.max(1), h.max(1), c.max(1))
    };

    w = w.min(max_size[0]);
    h = h.min(max_size[1]);
    let c = c.min(max_size[2]).min(max_invocations).max(1);

    let mut halve_w = true;
    while w * h * c > max_invocations {
        if halve_w && w > 1 {
            w = (w / 2).max(1);
        } else if h > 1 {
            h = (h / 2).max(1);
        } else if w > 1 {
            w = (w / 2).max(1);
        } else {
            break;
        }
        halve_w = !halve_w;
    }
    (w, h, c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_preserves_z_and_alternates_xy() {
        // 64 max invocations, z kept at 4: (16,16,4) -> (4,4,4)
        let size = optimal_local_size([128, 128, 64], 64, 16, 16, 4);
        assert_eq!(size, (4, 4, 4));
    }

    #[test]
    fn clamp_per_axis_limits() {
        let size = optimal_local_size([8, 8, 2], 1024, 64, 64, 64);
        assert_eq!(size, (8, 8, 2));
    }

    #[test]
    fn within_limits_untouched() {
        let size = optimal_local_size([1024, 1024, 64], 1024, 8, 8, 1);
        assert_eq!(size, (8, 8, 1));
    }

    #[test]
    fn zero_request_defaults() {
        let size = optimal_local_size([1024, 1024, 64], 1024, 0, 0, 0);
        assert_eq!(size, (4, 4, 4));
    }

    #[test]
    fn degenerate_one_invocation() {
        let size = optimal_local_size([1024, 1024, 64], 1, 16, 16, 1);
        assert_eq!(size, (1, 1, 1));
    }

    #[test]
    fn tall_z_clamped_by_invocations() {
        let size = optimal_local_size([256, 256, 256], 64, 1, 1, 256);
        assert_eq!(size, (1, 1, 64));
    }
}
