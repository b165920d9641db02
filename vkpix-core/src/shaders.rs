/*! Intrinsic packing/cast compute kernels.
 *
 *  One generated GLSL body per `(elempack_in, elempack_out, cast)` combo.
 *  Every body serves both storage classes: bindings 0/1 are the source and
 *  destination buffers, bindings 2/3 the image pair compiled in under
 *  `ImVulkan_image_shader`, selected at dispatch through the
 *  `storage_type_from`/`storage_type_to` specialization constants, exactly
 *  like the shape constants that follow them.
 *
 *  The packed axis follows the tensor rank: x for 1-D, rows for 2-D,
 *  channels for 3-D. Widening kernels iterate the destination and gather
 *  (element reads clamped to the source extent); narrowing kernels iterate
 *  the source and scatter whole destination elements, so no two invocations
 *  touch the same output.
 */

use std::fmt::Write as _;

/// Element type conversion fused into the packing pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CastVariant {
    /// Storage type unchanged (`sfp` on both sides).
    Same,
    Fp32ToFp16,
    Fp16ToFp32,
}

fn vec_type(storage_half: bool, pack: i32) -> &'static str {
    match (storage_half, pack) {
        (true, 1) => "sfp",
        (true, 4) => "sfpvec4",
        (true, 8) => "sfpvec8",
        (false, 1) => "float",
        (false, 4) => "vec4",
        (false, 8) => "mat2x4",
        _ => unreachable!(),
    }
}

fn afp_type(pack: i32) -> &'static str {
    match pack {
        1 => "afp",
        4 => "afpvec4",
        _ => "afpvec8",
    }
}

/// `v[k]` for the afp-family value `v` of the given width.
fn lane(pack: i32, v: &str, k: i32) -> String {
    match pack {
        1 => v.to_string(),
        4 => format!("{v}[{k}]"),
        _ => format!("{v}[{}][{}]", k / 4, k % 4),
    }
}

fn buffer_load(cast: CastVariant, pack: i32, buf: &str, idx: &str) -> String {
    match cast {
        // source is sfp-typed (possibly half)
        CastVariant::Same | CastVariant::Fp16ToFp32 => {
            format!("buffer_ld{pack}({buf}, {idx})")
        }
        // source is literal fp32
        CastVariant::Fp32ToFp16 => match pack {
            1 => format!("afp({buf}[{idx}])"),
            4 => format!("afpvec4({buf}[{idx}])"),
            _ => format!("{buf}[{idx}]"),
        },
    }
}

fn buffer_store(cast: CastVariant, pack: i32, buf: &str, idx: &str, v: &str) -> String {
    match cast {
        CastVariant::Same | CastVariant::Fp32ToFp16 => {
            format!("buffer_st{pack}({buf}, {idx}, {v});")
        }
        CastVariant::Fp16ToFp32 => match pack {
            1 => format!("{buf}[{idx}] = float({v});"),
            4 => format!("{buf}[{idx}] = vec4({v});"),
            _ => format!("{buf}[{idx}] = {v};"),
        },
    }
}

fn image_store(cast: CastVariant, pack: i32, img: &str, pos: &str, v: &str) -> String {
    match cast {
        CastVariant::Same | CastVariant::Fp32ToFp16 => {
            format!("image3d_st{pack}({img}, {pos}, {v});")
        }
        CastVariant::Fp16ToFp32 => match pack {
            1 => format!("imageStore({img}, {pos}, vec4(float({v}),0.0,0.0,0.0));"),
            4 => format!("imageStore({img}, {pos}, vec4({v}));"),
            _ => format!(
                "imageStore({img}, ivec3(2*({pos}).x,({pos}).y,({pos}).z), vec4({v}[0])); \
                 imageStore({img}, ivec3(2*({pos}).x+1,({pos}).y,({pos}).z), vec4({v}[1]));"
            ),
        },
    }
}

/// Per-rank addressing: where the packed axis lives and how elements map to
/// linear buffer indices and image texels.
struct Rank {
    dims: i32,
    /// packed-axis coordinate of this invocation
    axis: &'static str,
    /// source-side element bound along the packed axis
    src_bound: &'static str,
    /// destination-side element bound along the packed axis
    dst_bound: &'static str,
}

const RANKS: [Rank; 3] = [
    Rank {
        dims: 1,
        axis: "gx",
        src_bound: "psc(w)",
        dst_bound: "psc(outw)",
    },
    Rank {
        dims: 2,
        axis: "gy",
        src_bound: "psc(h)",
        dst_bound: "psc(outh)",
    },
    Rank {
        dims: 3,
        axis: "gz",
        src_bound: "psc(c)",
        dst_bound: "psc(outc)",
    },
];

impl Rank {
    /// Linear element index on the source side, with `e` on the packed axis.
    fn src_index(&self, e: &str) -> String {
        match self.dims {
            1 => e.to_string(),
            2 => format!("({e}) * psc(w) + gx"),
            _ => format!("({e}) * psc(cstep) + gy * psc(w) + gx"),
        }
    }

    fn dst_index(&self, e: &str) -> String {
        match self.dims {
            1 => e.to_string(),
            2 => format!("({e}) * psc(outw) + gx"),
            _ => format!("({e}) * psc(outcstep) + gy * psc(outw) + gx"),
        }
    }

    fn src_pos(&self, e: &str) -> String {
        match self.dims {
            1 => format!("ivec3({e}, 0, 0)"),
            2 => format!("ivec3(gx, {e}, 0)"),
            _ => format!("ivec3(gx, gy, {e})"),
        }
    }

    fn dst_pos(&self, e: &str) -> String {
        self.src_pos(e)
    }
}

/// Generates the GLSL body for one packing kernel.
///
/// `pack_from`/`pack_to` in {1, 4, 8}. The compiled module expects the
/// standard prelude plus the shape specialization layout used across this
/// crate: ids 0/1 for the storage classes, 2..=11 for in/out shape.
pub(crate) fn packing_shader_body(pack_from: i32, pack_to: i32, cast: CastVariant) -> String {
    debug_assert!(matches!(pack_from, 1 | 4 | 8));
    debug_assert!(matches!(pack_to, 1 | 4 | 8));

    let src_half = !matches!(cast, CastVariant::Fp32ToFp16);
    let dst_half = !matches!(cast, CastVariant::Fp16ToFp32);
    let src_ty = vec_type(src_half, pack_from);
    let dst_ty = vec_type(dst_half, pack_to);

    let mut s = String::with_capacity(8 * 1024);

    s.push_str("layout (constant_id = 0) const int storage_type_from = 0;\n");
    s.push_str("layout (constant_id = 1) const int storage_type_to = 0;\n");
    s.push_str("#define shape_constant_id_offset 2\n");
    for (i, name) in [
        "dims", "w", "h", "c", "cstep", "outdims", "outw", "outh", "outc", "outcstep",
    ]
    .iter()
    .enumerate()
    {
        let _ = writeln!(
            s,
            "layout (constant_id = shape_constant_id_offset + {i}) const int {name} = 0;"
        );
    }

    if (src_half && pack_from == 8) || (dst_half && pack_to == 8) {
        s.push_str("sfpvec8_struct\n");
    }

    let _ = writeln!(
        s,
        "layout (binding = 0) readonly buffer bottom_blob {{ {src_ty} bottom_blob_data[]; }};"
    );
    let _ = writeln!(
        s,
        "layout (binding = 1) writeonly buffer top_blob {{ {dst_ty} top_blob_data[]; }};"
    );
    s.push_str("#if ImVulkan_image_shader\n");
    let src_prec = if src_half { "unfp" } else { "highp" };
    let _ = writeln!(s, "layout (binding = 2) uniform {src_prec} sampler3D bottom_blob_3d;");
    let dst_fmt = if dst_half {
        if pack_to == 1 { "imfmtc1" } else { "imfmtc4" }
    } else if pack_to == 1 {
        "r32f"
    } else {
        "rgba32f"
    };
    let dst_prec = if dst_half { "unfp" } else { "highp" };
    let _ = writeln!(
        s,
        "layout (binding = 3, {dst_fmt}) writeonly uniform {dst_prec} image3D top_blob_3d;"
    );
    s.push_str("#endif\n");

    s.push_str(concat!(
        "layout (push_constant) uniform parameter\n",
        "{\n",
        "    int dims;\n    int w;\n    int h;\n    int c;\n    int cstep;\n",
        "    int outdims;\n    int outw;\n    int outh;\n    int outc;\n    int outcstep;\n",
        "} p;\n",
    ));

    s.push_str("void main()\n{\n");
    s.push_str(concat!(
        "    int gx = int(gl_GlobalInvocationID.x);\n",
        "    int gy = int(gl_GlobalInvocationID.y);\n",
        "    int gz = int(gl_GlobalInvocationID.z);\n",
    ));

    let widening = pack_to >= pack_from;
    if widening {
        // iterate the destination, gather from the source
        s.push_str("    if (gx >= psc(outw) || gy >= psc(outh) || gz >= psc(outc))\n        return;\n");
    } else {
        // iterate the source, scatter whole destination elements
        s.push_str("    if (gx >= psc(w) || gy >= psc(h) || gz >= psc(c))\n        return;\n");
    }

    for rank in RANKS.iter() {
        let header = match rank.dims {
            1 => "if (psc(dims) == 1)",
            2 => "else if (psc(dims) == 2)",
            _ => "else",
        };
        let _ = writeln!(s, "    {header}\n    {{");
        if widening {
            emit_gather(&mut s, rank, pack_from, pack_to, cast);
        } else {
            emit_scatter(&mut s, rank, pack_from, pack_to, cast);
        }
        s.push_str("    }\n");
    }

    s.push_str("}\n");
    s
}

/// Destination-driven path: one output element per invocation, source
/// element reads clamped to the extent (padding lanes repeat the tail).
fn emit_gather(s: &mut String, rank: &Rank, pack_from: i32, pack_to: i32, cast: CastVariant) {
    let axis = rank.axis;
    let ratio = pack_to / pack_from;
    let _ = writeln!(s, "        {} v;", afp_type(pack_to));

    for pass in ["buffer", "image"] {
        let (open, close) = if pass == "image" {
            ("#if ImVulkan_image_shader\n", "#endif\n")
        } else {
            ("", "")
        };
        s.push_str(open);
        let storage = if pass == "image" { 1 } else { 0 };
        let _ = writeln!(s, "        if (storage_type_from == {storage})\n        {{");
        for j in 0..ratio {
            let e = format!("min({axis} * {ratio} + {j}, {} - 1)", rank.src_bound);
            let load = if pass == "image" {
                format!("image3d_ld{pack_from}(bottom_blob_3d, {})", rank.src_pos(&e))
            } else {
                buffer_load(cast, pack_from, "bottom_blob_data", &rank.src_index(&e))
            };
            if pack_from == 1 {
                let _ = writeln!(s, "            {} = {load};", lane(pack_to, "v", j));
            } else {
                let _ = writeln!(s, "            {} v{j} = {load};", afp_type(pack_from));
                for k in 0..pack_from {
                    let _ = writeln!(
                        s,
                        "            {} = {};",
                        lane(pack_to, "v", j * pack_from + k),
                        lane(pack_from, &format!("v{j}"), k)
                    );
                }
            }
        }
        s.push_str("        }\n");
        s.push_str(close);
    }

    for pass in ["buffer", "image"] {
        let (open, close) = if pass == "image" {
            ("#if ImVulkan_image_shader\n", "#endif\n")
        } else {
            ("", "")
        };
        s.push_str(open);
        let storage = if pass == "image" { 1 } else { 0 };
        let _ = writeln!(s, "        if (storage_type_to == {storage})\n        {{");
        let store = if pass == "image" {
            image_store(cast, pack_to, "top_blob_3d", &rank.dst_pos(axis), "v")
        } else {
            buffer_store(cast, pack_to, "top_blob_data", &rank.dst_index(axis), "v")
        };
        let _ = writeln!(s, "            {store}");
        s.push_str("        }\n");
        s.push_str(close);
    }
}

/// Source-driven path: each invocation reads one wide element and writes
/// `pack_from / pack_to` complete destination elements.
fn emit_scatter(s: &mut String, rank: &Rank, pack_from: i32, pack_to: i32, cast: CastVariant) {
    let axis = rank.axis;
    let ratio = pack_from / pack_to;
    let _ = writeln!(s, "        {} v;", afp_type(pack_from));

    for pass in ["buffer", "image"] {
        let (open, close) = if pass == "image" {
            ("#if ImVulkan_image_shader\n", "#endif\n")
        } else {
            ("", "")
        };
        s.push_str(open);
        let storage = if pass == "image" { 1 } else { 0 };
        let _ = writeln!(s, "        if (storage_type_from == {storage})\n        {{");
        let load = if pass == "image" {
            format!("image3d_ld{pack_from}(bottom_blob_3d, {})", rank.src_pos(axis))
        } else {
            buffer_load(cast, pack_from, "bottom_blob_data", &rank.src_index(axis))
        };
        let _ = writeln!(s, "            v = {load};");
        s.push_str("        }\n");
        s.push_str(close);
    }

    for pass in ["buffer", "image"] {
        let (open, close) = if pass == "image" {
            ("#if ImVulkan_image_shader\n", "#endif\n")
        } else {
            ("", "")
        };
        s.push_str(open);
        let storage = if pass == "image" { 1 } else { 0 };
        let _ = writeln!(s, "        if (storage_type_to == {storage})\n        {{");
        for j in 0..ratio {
            let e = format!("{axis} * {ratio} + {j}");
            let guard = format!("{e} < {}", rank.dst_bound);
            let value = if pack_to == 1 {
                lane(pack_from, "v", j)
            } else {
                let parts: Vec<String> = (0..pack_to)
                    .map(|k| lane(pack_from, "v", j * pack_to + k))
                    .collect();
                format!("{}({})", afp_type(pack_to), parts.join(", "))
            };
            let store = if pass == "image" {
                image_store(cast, pack_to, "top_blob_3d", &rank.dst_pos(&e), &value)
            } else {
                buffer_store(cast, pack_to, "top_blob_data", &rank.dst_index(&e), &value)
            };
            let _ = writeln!(s, "            if ({guard}) {{ {store} }}");
        }
        s.push_str("        }\n");
        s.push_str(close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening_kernels_iterate_output() {
        let body = packing_shader_body(1, 4, CastVariant::Same);
        assert!(body.contains("gx >= psc(outw)"));
        assert!(body.contains("buffer_ld1(bottom_blob_data"));
        assert!(body.contains("buffer_st4(top_blob_data"));
        assert!(body.contains("storage_type_from == 1"));
        assert!(body.contains("sampler3D bottom_blob_3d"));
    }

    #[test]
    fn narrowing_kernels_iterate_input() {
        let body = packing_shader_body(8, 4, CastVariant::Same);
        assert!(body.contains("gx >= psc(w)"));
        assert!(body.contains("buffer_ld8(bottom_blob_data"));
        // two complete pack4 elements per pack8 read
        assert!(body.contains("gz * 2 + 0"));
        assert!(body.contains("gz * 2 + 1"));
    }

    #[test]
    fn cast_variants_change_declarations() {
        let to_half = packing_shader_body(4, 4, CastVariant::Fp32ToFp16);
        assert!(to_half.contains("buffer bottom_blob { vec4 bottom_blob_data[]; }"));
        assert!(to_half.contains("buffer top_blob { sfpvec4 top_blob_data[]; }"));

        let to_float = packing_shader_body(4, 4, CastVariant::Fp16ToFp32);
        assert!(to_float.contains("buffer bottom_blob { sfpvec4 bottom_blob_data[]; }"));
        assert!(to_float.contains("buffer top_blob { vec4 top_blob_data[]; }"));
        assert!(to_float.contains("top_blob_data[gx] = vec4(v);")
            || to_float.contains("= vec4(v);"));
    }

    #[test]
    fn pack8_declares_storage_struct() {
        let body = packing_shader_body(1, 8, CastVariant::Same);
        assert!(body.contains("sfpvec8_struct"));
        let no_struct = packing_shader_body(1, 8, CastVariant::Fp16ToFp32);
        assert!(!no_struct.contains("sfpvec8_struct"));
    }

    #[test]
    fn all_combinations_generate() {
        for from in [1, 4, 8] {
            for to in [1, 4, 8] {
                for cast in [
                    CastVariant::Same,
                    CastVariant::Fp32ToFp16,
                    CastVariant::Fp16ToFp32,
                ] {
                    let body = packing_shader_body(from, to, cast);
                    assert!(body.contains("void main()"), "{from}->{to} {cast:?}");
                    assert!(body.contains("push_constant"));
                }
            }
        }
    }
}
