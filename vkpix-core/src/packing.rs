/*! Elempack/type conversion engine.
 *
 *  A [`Packing`] instance owns up to three cached pipelines (source elempack
 *  1, 4 and 8 into one output elempack) for one cast and storage-class pair,
 *  and records the right dispatch for a tensor. The pipelines specialize
 *  only the storage classes; shapes travel in push constants, so every
 *  conversion with the same layout shares one pipeline via the cache.
 *
 *  Identity conversions alias the source. With `use_padding` off, a
 *  conversion that would pad the packed axis degrades to an alias as well.
 */

use std::sync::Arc;

use vpt::{DataType, Error, Result, StorageKind};

use crate::command::ComputeRecorder;
use crate::device::Device;
use crate::mat::Mat;
use crate::option::Options;
use crate::pipeline::Pipeline;
use crate::shaders::{packing_shader_body, CastVariant};
use crate::ShaderValue;

/// Element-type interpretation on one side of a conversion, mirroring the
/// storage decisions the option flags make.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CastType {
    /// Follow the option flags.
    Auto,
    Fp32,
    Fp16Packed,
    Fp16Storage,
}

impl CastType {
    fn resolve(self, opt: &Options) -> CastType {
        match self {
            CastType::Auto => {
                if opt.use_fp16_storage {
                    CastType::Fp16Storage
                } else if opt.use_fp16_packed {
                    CastType::Fp16Packed
                } else {
                    CastType::Fp32
                }
            }
            other => other,
        }
    }

    fn is_half(self) -> bool {
        matches!(self, CastType::Fp16Packed | CastType::Fp16Storage)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackStorage {
    Buffer = 0,
    Image = 1,
}

pub struct Packing {
    out_elempack: i32,
    pub use_padding: bool,
    cast_type_from: CastType,
    cast_type_to: CastType,
    storage_type_from: PackStorage,
    storage_type_to: PackStorage,
    /// One pipeline per source elempack (1, 4, 8).
    pipelines: [Option<Pipeline>; 3],
}

fn pack_slot(elempack: i32) -> Option<usize> {
    match elempack {
        1 => Some(0),
        4 => Some(1),
        8 => Some(2),
        _ => None,
    }
}

impl Packing {
    pub fn new(
        device: &Arc<Device>,
        out_elempack: i32,
        cast_type_from: CastType,
        cast_type_to: CastType,
        storage_type_from: PackStorage,
        storage_type_to: PackStorage,
        opt: &Options,
    ) -> Result<Self> {
        let from = cast_type_from.resolve(opt);
        let to = cast_type_to.resolve(opt);
        let variant = match (from.is_half(), to.is_half()) {
            (a, b) if a == b => CastVariant::Same,
            (false, true) => CastVariant::Fp32ToFp16,
            (true, false) => CastVariant::Fp16ToFp32,
            _ => unreachable!(),
        };

        let specializations = {
            let mut v = vec![
                ShaderValue::I32(storage_type_from as i32),
                ShaderValue::I32(storage_type_to as i32),
            ];
            v.extend(std::iter::repeat(ShaderValue::I32(0)).take(10));
            v
        };

        let mut pipelines = [None, None, None];
        for (slot, src_pack) in [1, 4, 8].into_iter().enumerate() {
            let body = packing_shader_body(src_pack, out_elempack, variant);
            let spirv = device.compile_spirv(&body, opt)?;
            let mut pipeline = Pipeline::new(device);
            pipeline.set_optimal_local_size_xyz(0, 0, 0);
            pipeline.create(&spirv, &specializations, opt)?;
            pipelines[slot] = Some(pipeline);
        }

        Ok(Self {
            out_elempack,
            use_padding: true,
            cast_type_from: from,
            cast_type_to: to,
            storage_type_from,
            storage_type_to,
            pipelines,
        })
    }

    /// Output bytes per element for the configured cast target.
    fn out_elemsize(&self) -> usize {
        match self.cast_type_to {
            CastType::Fp16Storage => self.out_elempack as usize * 2,
            CastType::Fp16Packed => {
                if self.out_elempack == 1 {
                    4
                } else {
                    self.out_elempack as usize * 2
                }
            }
            _ => self.out_elempack as usize * 4,
        }
    }

    fn out_data_type(&self) -> DataType {
        if self.cast_type_to.is_half() {
            DataType::Float16
        } else {
            DataType::Float32
        }
    }

    /// Records the conversion of `src` into `dst`, allocating `dst` from the
    /// blob allocator carried by `opt`/`cmd`.
    pub fn record(
        &self,
        src: &Mat,
        dst: &mut Mat,
        cmd: &mut ComputeRecorder,
        opt: &Options,
    ) -> Result<()> {
        let elempack = src.elempack;

        if elempack == self.out_elempack
            && self.cast_type_from == self.cast_type_to
            && storage_of(src) == Some(self.storage_type_to)
        {
            *dst = src.clone();
            return Ok(());
        }

        let packed_axis_len = match src.dims {
            1 => src.w,
            2 => src.h,
            _ => src.c,
        };
        if !self.use_padding && (packed_axis_len * elempack) % self.out_elempack != 0 {
            // identity when padding is not allowed
            *dst = src.clone();
            return Ok(());
        }

        let out_elemsize = self.out_elemsize();
        let out_pack = self.out_elempack;
        let ceil_div = |n: i32| (n * elempack + out_pack - 1) / out_pack;

        let blob_allocator = cmd.blob_allocator(opt);
        match self.storage_type_to {
            PackStorage::Buffer => match src.dims {
                1 => dst.create_device_1d(ceil_div(src.w), out_elemsize, out_pack, &blob_allocator)?,
                2 => dst.create_device_2d(
                    src.w,
                    ceil_div(src.h),
                    out_elemsize,
                    out_pack,
                    &blob_allocator,
                )?,
                _ => dst.create_device_3d(
                    src.w,
                    src.h,
                    ceil_div(src.c),
                    out_elemsize,
                    out_pack,
                    &blob_allocator,
                )?,
            },
            PackStorage::Image => {
                let mut shape = Mat::new();
                shape.dims = src.dims;
                shape.w = src.w;
                shape.h = src.h;
                shape.c = src.c;
                match src.dims {
                    1 => shape.w = ceil_div(src.w),
                    2 => shape.h = ceil_div(src.h),
                    _ => shape.c = ceil_div(src.c),
                }
                shape.elemsize = out_elemsize;
                shape.elempack = out_pack;
                shape.cstep = shape.w.max(0) as usize * shape.h.max(0) as usize;
                shape.data_type = self.out_data_type();
                dst.create_like_image(&shape, &blob_allocator)?;
            }
        }
        if dst.empty() {
            return Err(Error::Alloc {
                bytes: 0,
                kind: vpt::AllocKind::Blob,
            });
        }
        dst.data_type = self.out_data_type();
        dst.color_space = src.color_space;
        dst.color_format = src.color_format;
        dst.color_range = src.color_range;
        dst.depth = dst.data_type.depth();

        let constants = [
            ShaderValue::I32(src.dims),
            ShaderValue::I32(src.w),
            ShaderValue::I32(src.h),
            ShaderValue::I32(src.c),
            ShaderValue::I32(src.cstep as i32),
            ShaderValue::I32(dst.dims),
            ShaderValue::I32(dst.w),
            ShaderValue::I32(dst.h),
            ShaderValue::I32(dst.c),
            ShaderValue::I32(dst.cstep as i32),
        ];

        let Some(pipeline) = pack_slot(elempack).and_then(|s| self.pipelines[s].as_ref()) else {
            return Err(Error::ShapeMismatch {
                expected: "elempack 1, 4 or 8".to_string(),
                actual: format!("elempack {elempack}"),
            });
        };

        // widening kernels walk the output, narrowing kernels the input
        let dispatcher = if self.out_elempack >= elempack { &*dst } else { src };
        let dispatch = (
            dispatcher.w.max(1) as u32,
            dispatcher.h.max(1) as u32,
            dispatcher.c.max(1) as u32,
        );

        // binding slots are positional: 0/1 the buffer pair, 2/3 the image
        // pair when compiled in; empty placeholders become dummy bindings
        let empty = Mat::new();
        let dst_ref: &Mat = dst;
        let (buffer_bindings, image_bindings): (Vec<&Mat>, Vec<&Mat>) =
            match (self.storage_type_from, self.storage_type_to) {
                (PackStorage::Buffer, PackStorage::Buffer) => (vec![src, dst_ref], vec![]),
                (PackStorage::Image, PackStorage::Image) => (vec![], vec![src, dst_ref]),
                (PackStorage::Buffer, PackStorage::Image) => {
                    (vec![src, &empty], vec![&empty, dst_ref])
                }
                (PackStorage::Image, PackStorage::Buffer) => {
                    (vec![&empty, dst_ref], vec![src, &empty])
                }
            };

        cmd.record_pipeline(pipeline, &buffer_bindings, &image_bindings, &constants, dispatch);
        Ok(())
    }
}

fn storage_of(m: &Mat) -> Option<PackStorage> {
    match m.device() {
        StorageKind::VkBuffer => Some(PackStorage::Buffer),
        StorageKind::VkImage => Some(PackStorage::Image),
        StorageKind::Cpu => None,
    }
}

/// Repacks `src` into `dst_elempack`, preserving the element type, on
/// whatever storage classes the source and `dst_storage` prescribe.
pub fn convert_packing(
    device: &Arc<Device>,
    src: &Mat,
    dst: &mut Mat,
    dst_elempack: i32,
    dst_storage: StorageKind,
    cmd: &mut ComputeRecorder,
    opt: &Options,
) -> Result<()> {
    let from = if src.elembits() == 16 {
        if opt.use_fp16_storage {
            CastType::Fp16Storage
        } else {
            CastType::Fp16Packed
        }
    } else {
        CastType::Fp32
    };
    let storage_from = storage_of(src).ok_or_else(|| Error::ShapeMismatch {
        expected: "device tensor".to_string(),
        actual: "host tensor".to_string(),
    })?;
    let storage_to = match dst_storage {
        StorageKind::VkImage => PackStorage::Image,
        _ => PackStorage::Buffer,
    };

    let uop = Packing::new(device, dst_elempack, from, from, storage_from, storage_to, opt)?;
    uop.record(src, dst, cmd, opt)
}
