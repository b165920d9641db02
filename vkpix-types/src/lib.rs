/*! Common plain-data types shared by every layer of the vkpix runtime.
 *
 *  Nothing in this crate touches the GPU driver; it is the vocabulary that
 *  `vkpix-core` and the operator crates agree on: element types, color
 *  metadata, tensor flags, and the error taxonomy.
 */

#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications
)]

mod error;
pub mod half;

pub use error::{AllocKind, Error};

/// Convenience alias used across the runtime.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Rounds `sz` up to the next multiple of `n`. `n` must be a power of two.
#[inline]
pub fn align_size(sz: usize, n: usize) -> usize {
    (sz + n - 1) & !(n - 1)
}

/// Alignment of host tensor allocations, in bytes.
///
/// Large enough for any SIMD load the element-wise kernels may issue.
pub const MALLOC_ALIGN: usize = 64;

/// Scalar element type of a tensor.
///
/// `elemsize` in a tensor is `DataType::size_of() * elempack`.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    Int8 = 0,
    Int16,
    Int32,
    Int64,
    Float16,
    #[default]
    Float32,
    Float64,
    /// Big-endian 16-bit integer, as produced by some capture hardware.
    Int16Be,
}

impl DataType {
    /// Bytes per scalar lane.
    pub const fn size_of(self) -> usize {
        match self {
            Self::Int8 => 1,
            Self::Int16 | Self::Int16Be | Self::Float16 => 2,
            Self::Int32 | Self::Float32 => 4,
            Self::Int64 | Self::Float64 => 8,
        }
    }

    /// Significant bits per scalar lane.
    pub const fn depth(self) -> i32 {
        (self.size_of() * 8) as i32
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float16 | Self::Float32 | Self::Float64)
    }

    /// The element type implied by a bare element size, for untyped `create`
    /// calls. 1 byte = int8, 2 = int16, everything else = float32.
    pub const fn from_elemsize(elemsize: usize) -> Self {
        match elemsize {
            1 => Self::Int8,
            2 => Self::Int16,
            _ => Self::Float32,
        }
    }
}

/// Where the bytes of a tensor live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum StorageKind {
    #[default]
    Cpu,
    /// Device-local `VkBuffer` range.
    VkBuffer,
    /// Device-local `VkImage` with a 3-D view.
    VkImage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ColorRange {
    #[default]
    Full,
    Narrow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ColorSpace {
    #[default]
    Srgb,
    Bt601,
    Bt709,
    Bt2020,
    Hsv,
    Hls,
    Cmy,
    Lab,
}

#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ColorFormat {
    #[default]
    Gray = 0,
    Bgr,
    Abgr,
    Bgra,
    Rgb,
    Argb,
    Rgba,
    Yuv420,
    Yuv422,
    Yuv440,
    Yuv444,
    Yuva,
    Nv12,
    P010le,
    Lab,
    Hsv,
    Hsl,
}

impl ColorFormat {
    pub const fn is_rgb(self) -> bool {
        matches!(
            self,
            Self::Bgr | Self::Rgb | Self::Abgr | Self::Argb | Self::Bgra | Self::Rgba
        )
    }

    pub const fn is_yuv(self) -> bool {
        matches!(
            self,
            Self::Yuv420
                | Self::Yuv422
                | Self::Yuv440
                | Self::Yuv444
                | Self::Yuva
                | Self::Nv12
                | Self::P010le
        )
    }

    pub const fn has_alpha(self) -> bool {
        matches!(
            self,
            Self::Abgr | Self::Argb | Self::Bgra | Self::Rgba | Self::Yuva
        )
    }

    /// Interleaved channel count implied by the format.
    pub const fn channel_count(self) -> i32 {
        match self {
            Self::Gray => 1,
            Self::Bgr | Self::Rgb | Self::Lab | Self::Hsv | Self::Hsl => 3,
            _ => 4,
        }
    }

    /// The default format for an untyped `create` with `c` channels.
    pub const fn from_channels(c: i32) -> Self {
        match c {
            1 => Self::Gray,
            3 => Self::Bgr,
            _ => Self::Abgr,
        }
    }
}

/// Channel interleave order of a 3-D tensor.
///
/// `Ncwh` is the planar default; `Nwhc` is the packed-pixel layout used when
/// `elempack == elemsize * c`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ChannelOrder {
    #[default]
    Ncwh,
    Nwhc,
    Nchw,
    Nhwc,
}

/// Frame rate as an exact ratio.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

bitflags::bitflags! {
    /// Out-of-band frame metadata carried on a tensor.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct MatFlags: u32 {
        const VIDEO_FRAME        = 1 << 0;
        const VIDEO_INTERLACED   = 1 << 1;
        const VIDEO_FRAME_I      = 1 << 2;
        const VIDEO_FRAME_P      = 1 << 3;
        const VIDEO_FRAME_B      = 1 << 4;
        const VIDEO_HDR_PQ       = 1 << 5;
        const VIDEO_HDR_HLG      = 1 << 6;
        const VIDEO_FRAME_UV     = 1 << 7;
        const AUDIO_FRAME        = 1 << 8;
        const IMAGE_FRAME        = 1 << 16;
        const CUSTOM_NORMAL      = 1 << 24;
        const CUSTOM_PREROLL     = 1 << 25;
        const CUSTOM_EOS         = 1 << 26;
        const CUSTOM_INVALID     = 1 << 27;
        const CUSTOM_UNSUPPORTED = 1 << 28;
        const CUSTOM_UPDATED     = 1 << 29;
    }
}

/// Norm selector for [`normalize`]/`norm` style reductions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormType {
    Inf,
    L1,
    L2,
    MinMax,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_size_rounds_up() {
        assert_eq!(align_size(0, 16), 0);
        assert_eq!(align_size(1, 16), 16);
        assert_eq!(align_size(16, 16), 16);
        assert_eq!(align_size(17, 16), 32);
        assert_eq!(align_size(100, 4), 100);
    }

    #[test]
    fn data_type_sizes() {
        assert_eq!(DataType::Int8.size_of(), 1);
        assert_eq!(DataType::Float16.size_of(), 2);
        assert_eq!(DataType::Int16Be.size_of(), 2);
        assert_eq!(DataType::Float32.size_of(), 4);
        assert_eq!(DataType::Int64.size_of(), 8);
        assert_eq!(DataType::Float32.depth(), 32);
    }

    #[test]
    fn color_format_channels() {
        assert_eq!(ColorFormat::Gray.channel_count(), 1);
        assert_eq!(ColorFormat::Rgb.channel_count(), 3);
        assert_eq!(ColorFormat::Rgba.channel_count(), 4);
        assert!(ColorFormat::Rgba.has_alpha());
        assert!(!ColorFormat::Bgr.has_alpha());
        assert!(ColorFormat::Nv12.is_yuv());
    }
}
