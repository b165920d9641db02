/*! Online GLSL -> SPIR-V compilation.
 *
 *  Shader bodies in this crate (and in operator crates) are written against
 *  a macro vocabulary instead of concrete types: `sfp`/`sfpvec4`/`sfpvec8`
 *  name the storage element type, `afp`/`afpvec4`/`afpvec8` the arithmetic
 *  type, `buffer_ld*`/`buffer_st*` and `image3d_*` the load/store helpers,
 *  and `psc(x)` reads a shape constant that falls back to the push-constant
 *  block when the specialized value is zero.
 *
 *  [`shader_prelude`] derives that vocabulary from the [`Options`] knobs
 *  reconciled against what the device actually supports, so the same body
 *  compiles for fp32, fp16-storage and fp16-arithmetic devices, with buffer
 *  or image storage. The prelude also pins the workgroup size to
 *  specialization ids 233/234/235, which the pipeline cache fills in.
 */

use std::cell::RefCell;
use std::fmt::Write as _;

use vpt::{Error, Result};

use crate::instance::GpuInfo;
use crate::option::Options;

/// Feature switches the prelude derives from options x device support.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShaderFeatures {
    pub fp16_packed: bool,
    pub fp16_storage: bool,
    pub fp16_arithmetic: bool,
    pub int8_storage: bool,
    pub int8_arithmetic: bool,
    pub image_shader: bool,
    pub subgroup_basic: bool,
    pub subgroup_vote: bool,
    pub subgroup_ballot: bool,
    pub subgroup_shuffle: bool,
    pub local_memory: bool,
}

impl ShaderFeatures {
    pub fn reconcile(opt: &Options, info: &GpuInfo) -> Self {
        Self {
            fp16_packed: opt.use_fp16_packed && info.support_fp16_packed,
            fp16_storage: opt.use_fp16_storage && info.support_fp16_storage,
            fp16_arithmetic: opt.use_fp16_arithmetic
                && info.support_fp16_arithmetic
                && !info.bug_implicit_fp16_arithmetic,
            int8_storage: opt.use_int8_storage && info.support_int8_storage,
            int8_arithmetic: opt.use_int8_arithmetic && info.support_int8_arithmetic,
            image_shader: opt.use_image_storage && !info.bug_buffer_image_load_zero,
            subgroup_basic: opt.use_subgroup_basic && info.support_subgroup_basic,
            subgroup_vote: opt.use_subgroup_vote && info.support_subgroup_vote,
            subgroup_ballot: opt.use_subgroup_ballot && info.support_subgroup_ballot,
            subgroup_shuffle: opt.use_subgroup_shuffle && info.support_subgroup_shuffle,
            local_memory: opt.use_shader_local_memory,
        }
    }
}

/// Builds the `#version` + extension + macro block prepended to every
/// compute shader body.
pub fn shader_prelude(features: ShaderFeatures) -> String {
    let mut s = String::with_capacity(4096);
    s.push_str("#version 450\n");

    if features.fp16_storage {
        s.push_str("#extension GL_EXT_shader_16bit_storage: require\n");
    }
    if features.fp16_arithmetic {
        s.push_str("#extension GL_EXT_shader_explicit_arithmetic_types_float16: require\n");
    }
    if features.int8_storage {
        s.push_str("#extension GL_EXT_shader_8bit_storage: require\n");
    }
    if features.int8_arithmetic {
        s.push_str("#extension GL_EXT_shader_explicit_arithmetic_types_int8: require\n");
    }
    if features.subgroup_basic {
        s.push_str("#extension GL_KHR_shader_subgroup_basic: require\n");
    }
    if features.subgroup_vote {
        s.push_str("#extension GL_KHR_shader_subgroup_vote: require\n");
    }
    if features.subgroup_ballot {
        s.push_str("#extension GL_KHR_shader_subgroup_ballot: require\n");
    }
    if features.subgroup_shuffle {
        s.push_str("#extension GL_KHR_shader_subgroup_shuffle: require\n");
    }

    let flag = |v: bool| if v { 1 } else { 0 };
    let _ = writeln!(s, "#define ImVulkan_fp16_packed {}", flag(features.fp16_packed));
    let _ = writeln!(s, "#define ImVulkan_fp16_storage {}", flag(features.fp16_storage));
    let _ = writeln!(
        s,
        "#define ImVulkan_fp16_arithmetic {}",
        flag(features.fp16_arithmetic)
    );
    let _ = writeln!(s, "#define ImVulkan_int8_storage {}", flag(features.int8_storage));
    let _ = writeln!(
        s,
        "#define ImVulkan_int8_arithmetic {}",
        flag(features.int8_arithmetic)
    );
    let _ = writeln!(s, "#define ImVulkan_image_shader {}", flag(features.image_shader));
    let _ = writeln!(s, "#define ImVulkan_subgroup_basic {}", flag(features.subgroup_basic));
    let _ = writeln!(s, "#define ImVulkan_subgroup_vote {}", flag(features.subgroup_vote));
    let _ = writeln!(
        s,
        "#define ImVulkan_subgroup_ballot {}",
        flag(features.subgroup_ballot)
    );
    let _ = writeln!(
        s,
        "#define ImVulkan_subgroup_shuffle {}",
        flag(features.subgroup_shuffle)
    );
    let _ = writeln!(s, "#define ImVulkan_local_memory {}", flag(features.local_memory));

    // storage and arithmetic element types
    match (features.fp16_storage, features.fp16_arithmetic) {
        (true, true) => {
            s.push_str(concat!(
                "#define sfp float16_t\n",
                "#define sfpvec4 f16vec4\n",
                "#define afp float16_t\n",
                "#define afpvec4 f16vec4\n",
                "#define buffer_ld1(buf,i) buf[i]\n",
                "#define buffer_st1(buf,i,v) {buf[i]=v;}\n",
                "#define buffer_ld4(buf,i) buf[i]\n",
                "#define buffer_st4(buf,i,v) {buf[i]=v;}\n",
            ));
        }
        (true, false) => {
            s.push_str(concat!(
                "#define sfp float16_t\n",
                "#define sfpvec4 f16vec4\n",
                "#define afp float\n",
                "#define afpvec4 vec4\n",
                "#define buffer_ld1(buf,i) float(buf[i])\n",
                "#define buffer_st1(buf,i,v) {buf[i]=float16_t(v);}\n",
                "#define buffer_ld4(buf,i) vec4(buf[i])\n",
                "#define buffer_st4(buf,i,v) {buf[i]=f16vec4(v);}\n",
            ));
        }
        (false, true) => {
            s.push_str(concat!(
                "#define sfp float\n",
                "#define sfpvec4 vec4\n",
                "#define afp float16_t\n",
                "#define afpvec4 f16vec4\n",
                "#define buffer_ld1(buf,i) float16_t(buf[i])\n",
                "#define buffer_st1(buf,i,v) {buf[i]=float(v);}\n",
                "#define buffer_ld4(buf,i) f16vec4(buf[i])\n",
                "#define buffer_st4(buf,i,v) {buf[i]=vec4(v);}\n",
            ));
        }
        (false, false) => {
            s.push_str(concat!(
                "#define sfp float\n",
                "#define sfpvec4 vec4\n",
                "#define afp float\n",
                "#define afpvec4 vec4\n",
                "#define buffer_ld1(buf,i) buf[i]\n",
                "#define buffer_st1(buf,i,v) {buf[i]=v;}\n",
                "#define buffer_ld4(buf,i) buf[i]\n",
                "#define buffer_st4(buf,i,v) {buf[i]=v;}\n",
            ));
        }
    }

    // 8-lane elements: fp16 storage uses a two-f16vec4 struct the shader
    // body declares; arithmetic stays fp32 either way
    s.push_str("#define afpvec8 mat2x4\n");
    if features.fp16_storage {
        s.push_str(concat!(
            "#define sfpvec8_struct struct sfpvec8 { f16vec4 abcd; f16vec4 efgh; };\n",
            "#define buffer_ld8(buf,i) mat2x4(vec4(buf[i].abcd),vec4(buf[i].efgh))\n",
            "#define buffer_st8(buf,i,v) {buf[i].abcd=f16vec4(v[0]);buf[i].efgh=f16vec4(v[1]);}\n",
        ));
    } else {
        s.push_str(concat!(
            "#define sfpvec8_struct\n",
            "#define sfpvec8 mat2x4\n",
            "#define buffer_ld8(buf,i) buf[i]\n",
            "#define buffer_st8(buf,i,v) {buf[i]=v;}\n",
        ));
    }

    // image access helpers
    if features.fp16_storage {
        s.push_str("#define imfmtc1 r16f\n#define imfmtc4 rgba16f\n#define unfp mediump\n");
    } else {
        s.push_str("#define imfmtc1 r32f\n#define imfmtc4 rgba32f\n#define unfp highp\n");
    }
    s.push_str(concat!(
        "#define image3d_ld1(tex,p) afp(texelFetch(tex,p,0).r)\n",
        "#define image3d_st1(img,p,v) {imageStore(img,p,vec4(float(v),0,0,0));}\n",
        "#define image3d_cp1(img,p,tex,sp) {imageStore(img,p,texelFetch(tex,sp,0));}\n",
        "#define image3d_ld4(tex,p) afpvec4(texelFetch(tex,p,0))\n",
        "#define image3d_st4(img,p,v) {imageStore(img,p,vec4(v));}\n",
        "#define image3d_cp4(img,p,tex,sp) {imageStore(img,p,texelFetch(tex,sp,0));}\n",
        "#define image3d_ld8(tex,p) mat2x4(texelFetch(tex,ivec3(2*(p).x,(p).y,(p).z),0),texelFetch(tex,ivec3(2*(p).x+1,(p).y,(p).z),0))\n",
        "#define image3d_st8(img,p,v) {imageStore(img,ivec3(2*(p).x,(p).y,(p).z),vec4(v[0]));imageStore(img,ivec3(2*(p).x+1,(p).y,(p).z),vec4(v[1]));}\n",
        "#define image3d_cp8(img,p,tex,sp) {imageStore(img,ivec3(2*(p).x,(p).y,(p).z),texelFetch(tex,ivec3(2*(sp).x,(sp).y,(sp).z),0));imageStore(img,ivec3(2*(p).x+1,(p).y,(p).z),texelFetch(tex,ivec3(2*(sp).x+1,(sp).y,(sp).z),0));}\n",
    ));

    // shape constants specialize to the true extent, or fall back to the
    // push-constant block when left at zero
    s.push_str("#define psc(x) (x == 0 ? p.x : x)\n");

    // workgroup size comes from the pipeline, not the source
    s.push_str(
        "layout(local_size_x_id = 233, local_size_y_id = 234, local_size_z_id = 235) in;\n",
    );

    s
}

thread_local! {
    static COMPILER: RefCell<Option<shaderc::Compiler>> = const { RefCell::new(None) };
}

/// Compiles a compute shader body (prelude applied here) to SPIR-V words.
pub fn compile_spirv_module(body: &str, opt: &Options, info: &GpuInfo) -> Result<Vec<u32>> {
    compile_spirv_module_named(body, opt, info, "vkpix_shader")
}

pub fn compile_spirv_module_named(
    body: &str,
    opt: &Options,
    info: &GpuInfo,
    name: &str,
) -> Result<Vec<u32>> {
    let features = ShaderFeatures::reconcile(opt, info);
    let source = format!("{}{}", shader_prelude(features), body);

    COMPILER.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = shaderc::Compiler::new();
        }
        let compiler = slot.as_ref().ok_or_else(|| Error::ShaderCompile {
            log: "shaderc initialization failed".to_string(),
        })?;

        let mut options = shaderc::CompileOptions::new().ok_or_else(|| Error::ShaderCompile {
            log: "shaderc options initialization failed".to_string(),
        })?;
        options.set_target_env(
            shaderc::TargetEnv::Vulkan,
            shaderc::EnvVersion::Vulkan1_0 as u32,
        );
        options.set_optimization_level(shaderc::OptimizationLevel::Performance);

        let artifact = compiler
            .compile_into_spirv(&source, shaderc::ShaderKind::Compute, name, "main", Some(&options))
            .map_err(|e| Error::ShaderCompile { log: e.to_string() })?;
        if artifact.get_num_warnings() > 0 {
            log::debug!("{name}: {}", artifact.get_warning_messages());
        }
        Ok(artifact.as_binary().to_vec())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(fp16_storage: bool, fp16_arithmetic: bool) -> ShaderFeatures {
        ShaderFeatures {
            fp16_storage,
            fp16_arithmetic,
            ..Default::default()
        }
    }

    #[test]
    fn fp32_prelude() {
        let p = shader_prelude(features(false, false));
        assert!(p.starts_with("#version 450\n"));
        assert!(p.contains("#define sfp float\n"));
        assert!(p.contains("#define afp float\n"));
        assert!(p.contains("#define ImVulkan_fp16_storage 0"));
        assert!(p.contains("#define imfmtc4 rgba32f"));
        assert!(p.contains("local_size_x_id = 233"));
        assert!(p.contains("#define psc(x) (x == 0 ? p.x : x)"));
        assert!(!p.contains("GL_EXT_shader_16bit_storage"));
    }

    #[test]
    fn fp16_storage_prelude() {
        let p = shader_prelude(features(true, false));
        assert!(p.contains("#extension GL_EXT_shader_16bit_storage: require"));
        assert!(p.contains("#define sfp float16_t"));
        assert!(p.contains("#define afp float\n"));
        assert!(p.contains("buffer_ld1(buf,i) float(buf[i])"));
        assert!(p.contains("#define imfmtc4 rgba16f"));
        assert!(p.contains("f16vec4 abcd"));
    }

    #[test]
    fn fp16_arithmetic_prelude() {
        let p = shader_prelude(features(true, true));
        assert!(p.contains("GL_EXT_shader_explicit_arithmetic_types_float16"));
        assert!(p.contains("#define afp float16_t"));
        assert!(p.contains("#define buffer_ld1(buf,i) buf[i]"));
    }

    #[test]
    fn reconcile_respects_device_limits() {
        let opt = Options {
            use_fp16_storage: true,
            use_fp16_arithmetic: true,
            ..Options::new()
        };
        let mut info = crate::instance::test_gpu_info();
        info.support_fp16_storage = false;
        info.support_fp16_arithmetic = true;
        let f = ShaderFeatures::reconcile(&opt, &info);
        assert!(!f.fp16_storage);
        assert!(f.fp16_arithmetic);
    }
}
