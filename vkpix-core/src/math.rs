/*! Host-side element-wise and small-matrix kernels for [`Mat`].
 *
 *  Everything here runs on CPU storage; the loops are written over dense
 *  scalar slices so the compiler can vectorize them. Integer division by
 *  zero saturates to the type maximum; float division follows IEEE.
 */

use nanorand::{Rng, WyRand};
use vpt::half::{f16_to_f32, f32_to_f16};
use vpt::{DataType, Error, NormType, Result, StorageKind};

use crate::mat::Mat;

/// Scalar lane with the conversions the kernels need.
pub(crate) trait Element: bytemuck::Pod + Copy + PartialOrd {
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
    fn add(self, o: Self) -> Self;
    fn sub(self, o: Self) -> Self;
    fn mul(self, o: Self) -> Self;
    fn div(self, o: Self) -> Self;
}

macro_rules! int_element {
    ($t:ty) => {
        impl Element for $t {
            #[inline]
            fn from_f64(v: f64) -> Self {
                v as $t // saturating float-to-int cast
            }
            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }
            #[inline]
            fn add(self, o: Self) -> Self {
                self.wrapping_add(o)
            }
            #[inline]
            fn sub(self, o: Self) -> Self {
                self.wrapping_sub(o)
            }
            #[inline]
            fn mul(self, o: Self) -> Self {
                self.wrapping_mul(o)
            }
            #[inline]
            fn div(self, o: Self) -> Self {
                if o == 0 {
                    <$t>::MAX
                } else {
                    self.wrapping_div(o)
                }
            }
        }
    };
}

macro_rules! float_element {
    ($t:ty) => {
        impl Element for $t {
            #[inline]
            fn from_f64(v: f64) -> Self {
                v as $t
            }
            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }
            #[inline]
            fn add(self, o: Self) -> Self {
                self + o
            }
            #[inline]
            fn sub(self, o: Self) -> Self {
                self - o
            }
            #[inline]
            fn mul(self, o: Self) -> Self {
                self * o
            }
            #[inline]
            fn div(self, o: Self) -> Self {
                self / o
            }
        }
    };
}

int_element!(i8);
int_element!(i16);
int_element!(i32);
int_element!(i64);
float_element!(f32);
float_element!(f64);

/// `u16` lanes are IEEE binary16 bit patterns; arithmetic goes through fp32.
impl Element for u16 {
    #[inline]
    fn from_f64(v: f64) -> Self {
        f32_to_f16(v as f32)
    }
    #[inline]
    fn to_f64(self) -> f64 {
        f16_to_f32(self) as f64
    }
    #[inline]
    fn add(self, o: Self) -> Self {
        f32_to_f16(f16_to_f32(self) + f16_to_f32(o))
    }
    #[inline]
    fn sub(self, o: Self) -> Self {
        f32_to_f16(f16_to_f32(self) - f16_to_f32(o))
    }
    #[inline]
    fn mul(self, o: Self) -> Self {
        f32_to_f16(f16_to_f32(self) * f16_to_f32(o))
    }
    #[inline]
    fn div(self, o: Self) -> Self {
        f32_to_f16(f16_to_f32(self) / f16_to_f32(o))
    }
}

/// Runs `$body` with `$t` bound to the concrete lane type of `$dt`.
/// `Float16` binds `u16`, whose [`Element`] impl carries half semantics.
macro_rules! dispatch {
    ($dt:expr, $t:ident, $body:block) => {
        match $dt {
            DataType::Int8 => {
                type $t = i8;
                $body
            }
            DataType::Int16 | DataType::Int16Be => {
                type $t = i16;
                $body
            }
            DataType::Int32 => {
                type $t = i32;
                $body
            }
            DataType::Int64 => {
                type $t = i64;
                $body
            }
            DataType::Float32 => {
                type $t = f32;
                $body
            }
            DataType::Float64 => {
                type $t = f64;
                $body
            }
            DataType::Float16 => {
                type $t = u16;
                $body
            }
        }
    };
}

fn shape_err(a: &Mat, b: &Mat) -> Error {
    Error::ShapeMismatch {
        expected: format!("{}x{}x{} {:?}", a.w, a.h, a.c, a.data_type),
        actual: format!("{}x{}x{} {:?}", b.w, b.h, b.c, b.data_type),
    }
}

fn same_shape(a: &Mat, b: &Mat) -> bool {
    a.dims == b.dims
        && a.w == b.w
        && a.h == b.h
        && a.c == b.c
        && a.elempack == b.elempack
        && a.data_type == b.data_type
}

/// Results of a [`Mat::minmax`] scan.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MinMax {
    pub min: f64,
    pub max: f64,
    pub imin: usize,
    pub imax: usize,
}

impl Mat {
    /// Logical scalar count, excluding channel-stride padding.
    fn lane_count(&self) -> usize {
        self.w.max(0) as usize
            * self.h.max(0) as usize
            * self.c.max(1) as usize
            * self.elempack.max(1) as usize
    }

    /// The payload as fp32, channel padding excluded.
    fn lanes_f32(&self) -> Vec<f32> {
        debug_assert_eq!(self.device(), StorageKind::Cpu);
        let mut out = Vec::with_capacity(self.lane_count());
        if self.dims < 3 {
            dispatch!(self.data_type, T, {
                out.extend(self.as_slice::<T>().iter().map(|v| v.to_f64() as f32));
            });
        } else {
            for cc in 0..self.c {
                let chan = self.channel(cc);
                dispatch!(self.data_type, T, {
                    out.extend(chan.as_slice::<T>().iter().map(|v| v.to_f64() as f32));
                });
            }
        }
        out
    }

    fn store_lanes_f32(&mut self, lanes: &[f32]) {
        if self.dims < 3 {
            dispatch!(self.data_type, T, {
                for (dst, &v) in self.as_mut_slice::<T>().iter_mut().zip(lanes) {
                    *dst = T::from_f64(v as f64);
                }
            });
        } else {
            let per_chan = self.w.max(0) as usize
                * self.h.max(0) as usize
                * self.elempack.max(1) as usize;
            for cc in 0..self.c {
                let mut chan = self.channel(cc);
                let chunk = &lanes[cc as usize * per_chan..(cc as usize + 1) * per_chan];
                dispatch!(chan.data_type, T, {
                    for (dst, &v) in chan.as_mut_slice::<T>().iter_mut().zip(chunk) {
                        *dst = T::from_f64(v as f64);
                    }
                });
            }
        }
    }

    // ---------------------------------------------------- scalar broadcasts

    pub fn add_scalar(&mut self, v: f64) {
        self.apply_scalar(v, ElementOp::Add)
    }

    pub fn sub_scalar(&mut self, v: f64) {
        self.apply_scalar(v, ElementOp::Sub)
    }

    pub fn mul_scalar(&mut self, v: f64) {
        self.apply_scalar(v, ElementOp::Mul)
    }

    pub fn div_scalar(&mut self, v: f64) {
        self.apply_scalar(v, ElementOp::Div)
    }

    fn apply_scalar(&mut self, v: f64, op: ElementOp) {
        dispatch!(self.data_type, T, {
            let s = T::from_f64(v);
            let slice = self.as_mut_slice::<T>();
            match op {
                ElementOp::Add => {
                    for e in slice.iter_mut() {
                        *e = e.add(s);
                    }
                }
                ElementOp::Sub => {
                    for e in slice.iter_mut() {
                        *e = e.sub(s);
                    }
                }
                ElementOp::Mul => {
                    for e in slice.iter_mut() {
                        *e = e.mul(s);
                    }
                }
                ElementOp::Div => {
                    for e in slice.iter_mut() {
                        *e = e.div(s);
                    }
                }
            }
        });
    }

    // ----------------------------------------------------- elementwise mats

    pub fn add_mat(&self, other: &Mat) -> Result<Mat> {
        self.zip_mat(other, ElementOp::Add)
    }

    pub fn sub_mat(&self, other: &Mat) -> Result<Mat> {
        self.zip_mat(other, ElementOp::Sub)
    }

    pub fn mul_mat(&self, other: &Mat) -> Result<Mat> {
        self.zip_mat(other, ElementOp::Mul)
    }

    pub fn div_mat(&self, other: &Mat) -> Result<Mat> {
        self.zip_mat(other, ElementOp::Div)
    }

    fn zip_mat(&self, other: &Mat, op: ElementOp) -> Result<Mat> {
        if !same_shape(self, other) {
            return Err(shape_err(self, other));
        }
        let mut out = Mat::new();
        out.create_like(self);
        dispatch!(self.data_type, T, {
            let a = self.as_slice::<T>();
            let b = other.as_slice::<T>();
            let dst = out.as_mut_slice::<T>();
            match op {
                ElementOp::Add => {
                    for i in 0..dst.len() {
                        dst[i] = a[i].add(b[i]);
                    }
                }
                ElementOp::Sub => {
                    for i in 0..dst.len() {
                        dst[i] = a[i].sub(b[i]);
                    }
                }
                ElementOp::Mul => {
                    for i in 0..dst.len() {
                        dst[i] = a[i].mul(b[i]);
                    }
                }
                ElementOp::Div => {
                    for i in 0..dst.len() {
                        dst[i] = a[i].div(b[i]);
                    }
                }
            }
        });
        Ok(out)
    }

    pub fn absdiff(&self, other: &Mat) -> Result<Mat> {
        let diff = self.sub_mat(other)?;
        let mut out = diff;
        dispatch!(out.data_type, T, {
            for v in out.as_mut_slice::<T>() {
                let f = v.to_f64();
                *v = T::from_f64(f.abs());
            }
        });
        Ok(out)
    }

    pub fn sqr(&self) -> Result<Mat> {
        self.mul_mat(self)
    }

    pub fn clip(&mut self, v_min: f64, v_max: f64) {
        dispatch!(self.data_type, T, {
            for v in self.as_mut_slice::<T>() {
                let f = v.to_f64();
                *v = T::from_f64(f.clamp(v_min, v_max));
            }
        });
    }

    pub fn sum(&self) -> f64 {
        self.lanes_f32().iter().map(|&v| v as f64).sum()
    }

    pub fn mean(&self) -> f64 {
        let n = self.lane_count();
        if n == 0 {
            0.0
        } else {
            self.sum() / n as f64
        }
    }

    // --------------------------------------------------------- 2-D algebra

    /// `self[m,k] * other[k,n] -> [m,n]`, accumulating in the element type
    /// (fp16 accumulates through fp32).
    pub fn matmul(&self, other: &Mat) -> Result<Mat> {
        if self.dims != 2 || other.dims != 2 || self.w != other.h
            || self.data_type != other.data_type
        {
            return Err(shape_err(self, other));
        }
        let (m, k, n) = (self.h as usize, self.w as usize, other.w as usize);
        let mut out = Mat::new_2d(other.w, self.h, self.data_type);

        match self.data_type {
            DataType::Float32 => {
                let a = self.as_slice::<f32>();
                let b = other.as_slice::<f32>();
                let dst = out.as_mut_slice::<f32>();
                for i in 0..m {
                    for j in 0..n {
                        let mut acc = 0.0f32;
                        for l in 0..k {
                            acc += a[i * k + l] * b[l * n + j];
                        }
                        dst[i * n + j] = acc;
                    }
                }
            }
            DataType::Float64 => {
                let a = self.as_slice::<f64>();
                let b = other.as_slice::<f64>();
                let dst = out.as_mut_slice::<f64>();
                for i in 0..m {
                    for j in 0..n {
                        let mut acc = 0.0f64;
                        for l in 0..k {
                            acc += a[i * k + l] * b[l * n + j];
                        }
                        dst[i * n + j] = acc;
                    }
                }
            }
            DataType::Float16 => {
                let a = self.as_slice::<u16>();
                let b = other.as_slice::<u16>();
                let dst = out.as_mut_slice::<u16>();
                for i in 0..m {
                    for j in 0..n {
                        let mut acc = 0.0f32;
                        for l in 0..k {
                            acc += f16_to_f32(a[i * k + l]) * f16_to_f32(b[l * n + j]);
                        }
                        dst[i * n + j] = f32_to_f16(acc);
                    }
                }
            }
            _ => {
                dispatch!(self.data_type, T, {
                    let a = self.as_slice::<T>();
                    let b = other.as_slice::<T>();
                    let dst = out.as_mut_slice::<T>();
                    for i in 0..m {
                        for j in 0..n {
                            let mut acc = 0.0f64;
                            for l in 0..k {
                                acc += a[i * k + l].to_f64() * b[l * n + j].to_f64();
                            }
                            dst[i * n + j] = T::from_f64(acc);
                        }
                    }
                });
            }
        }
        Ok(out)
    }

    /// Transpose. 1-D tensors become a column.
    pub fn t(&self) -> Mat {
        if self.dims == 1 {
            let mut out = Mat::new_2d(1, self.w, self.data_type);
            out.copy_attribute(self);
            let bytes = self.byte_size();
            out.as_mut_slice::<u8>()[..bytes].copy_from_slice(&self.as_slice::<u8>()[..bytes]);
            return out;
        }
        debug_assert_eq!(self.dims, 2);
        let mut out = Mat::new_2d(self.h, self.w, self.data_type);
        out.copy_attribute(self);
        let (w, h) = (self.w as usize, self.h as usize);
        dispatch!(self.data_type, T, {
            let src = self.as_slice::<T>();
            let dst = out.as_mut_slice::<T>();
            for y in 0..h {
                for x in 0..w {
                    dst[x * h + y] = src[y * w + x];
                }
            }
        });
        out
    }

    /// Identity matrix times `scale`.
    pub fn eye(n: i32, dtype: DataType, scale: f64) -> Mat {
        let mut out = Mat::new_2d(n, n, dtype);
        dispatch!(dtype, T, {
            let dst = out.as_mut_slice::<T>();
            for i in 0..n as usize {
                dst[i * n as usize + i] = T::from_f64(scale);
            }
        });
        out
    }

    /// Square matrix with this 1-D tensor on the diagonal.
    pub fn diag(&self) -> Mat {
        debug_assert_eq!(self.dims, 1);
        let n = self.w;
        let mut out = Mat::new_2d(n, n, self.data_type);
        dispatch!(self.data_type, T, {
            let src = self.as_slice::<T>();
            let dst = out.as_mut_slice::<T>();
            for i in 0..n as usize {
                dst[i * n as usize + i] = src[i];
            }
        });
        out
    }

    /// LU-based determinant of a square 2-D tensor.
    pub fn determinant(&self) -> f32 {
        debug_assert!(self.dims == 2 && self.w == self.h);
        let n = self.w as usize;
        let mut lu: Vec<f64> = self.lanes_f32().iter().map(|&v| v as f64).collect();
        let mut det = 1.0f64;
        for col in 0..n {
            // partial pivot
            let mut pivot = col;
            for row in col + 1..n {
                if lu[row * n + col].abs() > lu[pivot * n + col].abs() {
                    pivot = row;
                }
            }
            if lu[pivot * n + col].abs() < f32::EPSILON as f64 {
                return 0.0;
            }
            if pivot != col {
                for j in 0..n {
                    lu.swap(col * n + j, pivot * n + j);
                }
                det = -det;
            }
            det *= lu[col * n + col];
            for row in col + 1..n {
                let factor = lu[row * n + col] / lu[col * n + col];
                for j in col..n {
                    lu[row * n + j] -= factor * lu[col * n + j];
                }
            }
        }
        det as f32
    }

    /// Gauss-Jordan inverse of a square 2-D tensor. A pivot below
    /// `f32::EPSILON` means singular, and the result is all zeros.
    pub fn inv(&self) -> Mat {
        debug_assert!(self.dims == 2 && self.w == self.h);
        let n = self.w as usize;
        let mut a: Vec<f64> = self.lanes_f32().iter().map(|&v| v as f64).collect();
        let mut inv = vec![0.0f64; n * n];
        for i in 0..n {
            inv[i * n + i] = 1.0;
        }

        for col in 0..n {
            let mut pivot = col;
            for row in col + 1..n {
                if a[row * n + col].abs() > a[pivot * n + col].abs() {
                    pivot = row;
                }
            }
            if a[pivot * n + col].abs() < f32::EPSILON as f64 {
                let mut out = Mat::new_2d(self.w, self.h, self.data_type);
                out.copy_attribute(self);
                return out; // zeros
            }
            if pivot != col {
                for j in 0..n {
                    a.swap(col * n + j, pivot * n + j);
                    inv.swap(col * n + j, pivot * n + j);
                }
            }
            let diag = a[col * n + col];
            for j in 0..n {
                a[col * n + j] /= diag;
                inv[col * n + j] /= diag;
            }
            for row in 0..n {
                if row == col {
                    continue;
                }
                let factor = a[row * n + col];
                if factor == 0.0 {
                    continue;
                }
                for j in 0..n {
                    a[row * n + j] -= factor * a[col * n + j];
                    inv[row * n + j] -= factor * inv[col * n + j];
                }
            }
        }

        let mut out = Mat::new_2d(self.w, self.h, self.data_type);
        out.copy_attribute(self);
        let lanes: Vec<f32> = inv.iter().map(|&v| v as f32).collect();
        out.store_lanes_f32(&lanes);
        out
    }

    /// Fills with normally distributed values (Box-Muller over WyRand).
    /// A negative seed draws one from the system.
    pub fn randn(&mut self, mean: f64, stddev: f64, seed: i64) {
        let mut rng = if seed < 0 {
            WyRand::new()
        } else {
            WyRand::new_seed(seed as u64)
        };
        let n = self.lane_count();
        let mut lanes = Vec::with_capacity(n);
        while lanes.len() < n {
            let r1: f64 = (rng.generate::<u32>() as f64 + 1.0) / (u32::MAX as f64 + 1.0);
            let r2: f64 = rng.generate::<u32>() as f64 / u32::MAX as f64;
            let radius = (-2.0 * r1.ln()).sqrt();
            let theta = 2.0 * std::f64::consts::PI * r2;
            lanes.push((stddev * radius * theta.cos() + mean) as f32);
            if lanes.len() < n {
                lanes.push((stddev * radius * theta.sin() + mean) as f32);
            }
        }
        self.store_lanes_f32(&lanes);
    }

    // ---------------------------------------------------------- reductions

    pub fn minmax(&self) -> MinMax {
        let mut result = MinMax {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            imin: 0,
            imax: 0,
        };
        let lanes = self.lanes_f32();
        for (i, &v) in lanes.iter().enumerate() {
            let v = v as f64;
            if v < result.min {
                result.min = v;
                result.imin = i;
            }
            if v > result.max {
                result.max = v;
                result.imax = i;
            }
        }
        result
    }

    pub fn norm(&self, norm_type: NormType) -> f32 {
        let lanes = self.lanes_f32();
        match norm_type {
            NormType::L1 => lanes.iter().map(|v| v.abs() as f64).sum::<f64>() as f32,
            NormType::L2 => (lanes.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>()).sqrt()
                as f32,
            NormType::Inf | NormType::MinMax => lanes
                .iter()
                .fold(0.0f32, |acc, v| acc.max(v.abs())),
        }
    }

    /// `MinMax` maps the value range onto `[vmin, vmax]`; the norm variants
    /// rescale so the chosen norm equals `vmin`.
    pub fn normalize(&mut self, vmin: f64, vmax: f64, norm_type: NormType) {
        let lanes = self.lanes_f32();
        let out: Vec<f32> = match norm_type {
            NormType::MinMax => {
                let mm = self.minmax();
                let span = mm.max - mm.min;
                let scale = if span.abs() < f64::EPSILON {
                    0.0
                } else {
                    (vmax - vmin) / span
                };
                lanes
                    .iter()
                    .map(|&v| ((v as f64 - mm.min) * scale + vmin) as f32)
                    .collect()
            }
            _ => {
                let norm = self.norm(norm_type) as f64;
                let scale = if norm.abs() < f64::EPSILON {
                    0.0
                } else {
                    vmin / norm
                };
                lanes.iter().map(|&v| (v as f64 * scale) as f32).collect()
            }
        };
        self.store_lanes_f32(&out);
    }

    /// Element-wise `v * scale` cast into `dtype` with saturation; fp16 in
    /// either direction goes through the IEEE half routines.
    ///
    /// Channel strides differ between element widths, so 3-D tensors
    /// convert channel by channel.
    pub fn convert(&self, dtype: DataType, scale: f32) -> Mat {
        let mut out = match self.dims {
            1 => Mat::new_1d(self.w, dtype),
            2 => Mat::new_2d(self.w, self.h, dtype),
            _ => Mat::new_3d(self.w, self.h, self.c, dtype),
        };
        out.copy_attribute(self);
        out.data_type = dtype;
        out.depth = dtype.depth();

        if self.dims < 3 {
            let scaled: Vec<f32> = self.lanes_f32().iter().map(|&v| v * scale).collect();
            out.store_lanes_f32(&scaled);
        } else {
            for cc in 0..self.c {
                let src_chan = self.channel(cc);
                let mut dst_chan = out.channel(cc);
                let scaled: Vec<f32> =
                    src_chan.lanes_f32().iter().map(|&v| v * scale).collect();
                dst_chan.store_lanes_f32(&scaled);
            }
        }
        out
    }
}

impl Mat {
    /// Negation, elementwise.
    pub fn neg(&self) -> Mat {
        let mut out = self.deep_clone();
        out.mul_scalar(-1.0);
        out
    }

    /// Stacks `other` below `self` (2-D tensors of equal width).
    pub fn vconcat(&self, other: &Mat) -> Result<Mat> {
        if self.dims != 2 || other.dims != 2 || self.w != other.w
            || self.data_type != other.data_type
        {
            return Err(shape_err(self, other));
        }
        let mut out = Mat::new_2d(self.w, self.h + other.h, self.data_type);
        out.copy_attribute(self);
        let top = self.byte_size();
        let bottom = other.byte_size();
        let dst = out.as_mut_slice::<u8>();
        dst[..top].copy_from_slice(&self.as_slice::<u8>()[..top]);
        dst[top..top + bottom].copy_from_slice(&other.as_slice::<u8>()[..bottom]);
        Ok(out)
    }

    /// Joins `other` to the right of `self` (2-D tensors of equal height).
    pub fn hconcat(&self, other: &Mat) -> Result<Mat> {
        if self.dims != 2 || other.dims != 2 || self.h != other.h
            || self.data_type != other.data_type
        {
            return Err(shape_err(self, other));
        }
        let mut out = Mat::new_2d(self.w + other.w, self.h, self.data_type);
        out.copy_attribute(self);
        let es = self.elemsize;
        let (lw, rw, ow) = (self.w as usize * es, other.w as usize * es, (self.w + other.w) as usize * es);
        let dst = out.as_mut_slice::<u8>();
        let left = self.as_slice::<u8>();
        let right = other.as_slice::<u8>();
        for y in 0..self.h as usize {
            dst[y * ow..y * ow + lw].copy_from_slice(&left[y * lw..(y + 1) * lw]);
            dst[y * ow + lw..(y + 1) * ow].copy_from_slice(&right[y * rw..(y + 1) * rw]);
        }
        Ok(out)
    }

    /// Copies the rectangle `[x1, x2) x [y1, y2)` out of every channel.
    pub fn crop(&self, x1: i32, y1: i32, x2: i32, y2: i32) -> Result<Mat> {
        if x1 < 0 || y1 < 0 || x2 > self.w || y2 > self.h || x1 >= x2 || y1 >= y2 {
            return Err(Error::ShapeMismatch {
                expected: format!("rect inside {}x{}", self.w, self.h),
                actual: format!("[{x1},{y1})..[{x2},{y2})"),
            });
        }
        let (cw, ch) = (x2 - x1, y2 - y1);
        let mut out = match self.dims {
            2 => Mat::new_2d(cw, ch, self.data_type),
            _ => Mat::new_3d(cw, ch, self.c, self.data_type),
        };
        out.copy_attribute(self);
        let es = self.elemsize;
        for cc in 0..self.c.max(1) {
            let src_chan = cc as usize * self.cstep * es;
            let dst_chan = cc as usize * out.cstep * es;
            for y in 0..ch as usize {
                let src_off =
                    src_chan + ((y1 as usize + y) * self.w as usize + x1 as usize) * es;
                let dst_off = dst_chan + y * cw as usize * es;
                let row = cw as usize * es;
                let src = self.as_slice::<u8>();
                let dst = out.as_mut_slice::<u8>();
                dst[dst_off..dst_off + row].copy_from_slice(&src[src_off..src_off + row]);
            }
        }
        Ok(out)
    }
}

/// Host-side storage casts, mirroring the device packing kernels.
pub fn cast_float32_to_float16(src: &Mat) -> Mat {
    src.convert(DataType::Float16, 1.0)
}

pub fn cast_float16_to_float32(src: &Mat) -> Mat {
    src.convert(DataType::Float32, 1.0)
}

pub fn cast_int8_to_float32(src: &Mat, scale: f32) -> Mat {
    src.convert(DataType::Float32, scale)
}

pub fn cast_int8_to_float16(src: &Mat, scale: f32) -> Mat {
    src.convert(DataType::Float16, scale)
}

/// bfloat16 rides in `Int16` lanes; only the bit pattern changes here.
pub fn cast_float32_to_bfloat16(src: &Mat) -> Mat {
    use vpt::half::f32_to_bf16;
    let mut out = match src.dims {
        1 => Mat::new_1d(src.w, DataType::Int16),
        2 => Mat::new_2d(src.w, src.h, DataType::Int16),
        _ => Mat::new_3d(src.w, src.h, src.c, DataType::Int16),
    };
    out.copy_attribute(src);
    out.data_type = DataType::Int16;
    out.depth = 16;
    for cc in 0..src.c.max(1) {
        let src_chan = if src.dims < 3 { src.clone() } else { src.channel(cc) };
        let mut dst_chan = if src.dims < 3 { out.clone() } else { out.channel(cc) };
        let lanes: Vec<u16> = src_chan
            .as_slice::<f32>()
            .iter()
            .map(|&v| f32_to_bf16(v))
            .collect();
        dst_chan.as_mut_slice::<u16>()[..lanes.len()].copy_from_slice(&lanes);
    }
    out
}

pub fn cast_bfloat16_to_float32(src: &Mat) -> Mat {
    use vpt::half::bf16_to_f32;
    let mut out = match src.dims {
        1 => Mat::new_1d(src.w, DataType::Float32),
        2 => Mat::new_2d(src.w, src.h, DataType::Float32),
        _ => Mat::new_3d(src.w, src.h, src.c, DataType::Float32),
    };
    out.copy_attribute(src);
    out.data_type = DataType::Float32;
    out.depth = 32;
    for cc in 0..src.c.max(1) {
        let src_chan = if src.dims < 3 { src.clone() } else { src.channel(cc) };
        let mut dst_chan = if src.dims < 3 { out.clone() } else { out.channel(cc) };
        let lanes: Vec<f32> = src_chan
            .as_slice::<u16>()
            .iter()
            .map(|&v| bf16_to_f32(v))
            .collect();
        dst_chan.as_mut_slice::<f32>()[..lanes.len()].copy_from_slice(&lanes);
    }
    out
}

#[derive(Clone, Copy)]
enum ElementOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mat_from(values: &[f32], w: i32, h: i32) -> Mat {
        let mut m = Mat::new_2d(w, h, DataType::Float32);
        m.as_mut_slice::<f32>().copy_from_slice(values);
        m
    }

    #[test]
    fn scalar_broadcasts() {
        let mut m = Mat::new_1d(4, DataType::Float32);
        m.fill(2.0f32);
        m.add_scalar(1.0);
        m.mul_scalar(3.0);
        m.sub_scalar(4.0);
        m.div_scalar(5.0);
        assert_eq!(m.as_slice::<f32>(), &[1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn int_div_by_zero_saturates() {
        let mut m = Mat::new_1d(3, DataType::Int8);
        m.as_mut_slice::<i8>().copy_from_slice(&[10, -5, 0]);
        m.div_scalar(0.0);
        assert_eq!(m.as_slice::<i8>(), &[i8::MAX, i8::MAX, i8::MAX]);

        let a = Mat::new_1d(2, DataType::Int32);
        let mut b = Mat::new_1d(2, DataType::Int32);
        b.as_mut_slice::<i32>().copy_from_slice(&[2, 0]);
        let mut a = a;
        a.as_mut_slice::<i32>().copy_from_slice(&[6, 6]);
        let q = a.div_mat(&b).unwrap();
        assert_eq!(q.as_slice::<i32>(), &[3, i32::MAX]);
    }

    #[test]
    fn float_div_follows_ieee() {
        let mut a = Mat::new_1d(2, DataType::Float32);
        a.as_mut_slice::<f32>().copy_from_slice(&[1.0, -1.0]);
        let mut b = Mat::new_1d(2, DataType::Float32);
        b.as_mut_slice::<f32>().copy_from_slice(&[0.0, 0.0]);
        let q = a.div_mat(&b).unwrap();
        assert_eq!(q.as_slice::<f32>()[0], f32::INFINITY);
        assert_eq!(q.as_slice::<f32>()[1], f32::NEG_INFINITY);
    }

    #[test]
    fn elementwise_shape_check() {
        let a = Mat::new_1d(4, DataType::Float32);
        let b = Mat::new_1d(5, DataType::Float32);
        assert!(a.add_mat(&b).is_err());
    }

    #[test]
    fn matmul_known_product() {
        // [1 2; 3 4] * [5 6; 7 8] = [19 22; 43 50]
        let a = mat_from(&[1.0, 2.0, 3.0, 4.0], 2, 2);
        let b = mat_from(&[5.0, 6.0, 7.0, 8.0], 2, 2);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.as_slice::<f32>(), &[19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn matmul_rectangular() {
        // [1 2 3] (1x3) * [[1],[2],[3]] (3x1) = [14]
        let a = mat_from(&[1.0, 2.0, 3.0], 3, 1);
        let b = mat_from(&[1.0, 2.0, 3.0], 1, 3);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.w, 1);
        assert_eq!(c.h, 1);
        assert_eq!(c.as_slice::<f32>(), &[14.0]);
    }

    #[test]
    fn transpose_involution() {
        let a = mat_from(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3, 2);
        let t = a.t();
        assert_eq!(t.w, 2);
        assert_eq!(t.h, 3);
        assert_eq!(t.as_slice::<f32>(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let tt = t.t();
        assert_eq!(tt.as_slice::<f32>(), a.as_slice::<f32>());
    }

    #[test]
    fn determinant_and_inverse() {
        let a = mat_from(&[4.0, 7.0, 2.0, 6.0], 2, 2);
        assert!((a.determinant() - 10.0).abs() < 1e-5);

        let inv = a.inv();
        let prod = a.matmul(&inv).unwrap();
        let eye = Mat::eye(2, DataType::Float32, 1.0);
        for (p, e) in prod.as_slice::<f32>().iter().zip(eye.as_slice::<f32>()) {
            assert!((p - e).abs() < 1e-4, "{p} vs {e}");
        }
    }

    #[test]
    fn singular_inverse_is_zero() {
        let a = mat_from(&[1.0, 2.0, 2.0, 4.0], 2, 2);
        assert_eq!(a.determinant(), 0.0);
        let inv = a.inv();
        assert!(inv.as_slice::<f32>().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn eye_and_diag() {
        let eye = Mat::eye(3, DataType::Float32, 2.0);
        assert_eq!(eye.at::<f32>(0, 0, 0), 2.0);
        assert_eq!(eye.at::<f32>(1, 0, 0), 0.0);

        let mut v = Mat::new_1d(3, DataType::Float32);
        v.as_mut_slice::<f32>().copy_from_slice(&[1.0, 2.0, 3.0]);
        let d = v.diag();
        assert_eq!(d.at::<f32>(1, 1, 0), 2.0);
        assert_eq!(d.at::<f32>(2, 1, 0), 0.0);
    }

    #[test]
    fn randn_statistics() {
        let mut m = Mat::new_2d(100, 100, DataType::Float32);
        m.randn(5.0, 2.0, 42);
        let mean = m.mean();
        assert!((mean - 5.0).abs() < 0.1, "mean {mean}");
        let var = m
            .as_slice::<f32>()
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / 10_000.0;
        assert!((var.sqrt() - 2.0).abs() < 0.1, "stddev {}", var.sqrt());
        // deterministic for a fixed seed
        let mut m2 = Mat::new_2d(100, 100, DataType::Float32);
        m2.randn(5.0, 2.0, 42);
        assert_eq!(m.as_slice::<f32>(), m2.as_slice::<f32>());
    }

    #[test]
    fn minmax_and_normalize() {
        let mut m = mat_from(&[2.0, 4.0, 6.0, 8.0], 4, 1);
        let mm = m.minmax();
        assert_eq!((mm.min, mm.max), (2.0, 8.0));
        assert_eq!((mm.imin, mm.imax), (0, 3));

        m.normalize(0.0, 1.0, NormType::MinMax);
        let s = m.as_slice::<f32>();
        assert!((s[0] - 0.0).abs() < 1e-6);
        assert!((s[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn norms() {
        let m = mat_from(&[3.0, -4.0], 2, 1);
        assert_eq!(m.norm(NormType::L1), 7.0);
        assert_eq!(m.norm(NormType::L2), 5.0);
        assert_eq!(m.norm(NormType::Inf), 4.0);
    }

    #[test]
    fn convert_saturates_and_scales() {
        let mut m = Mat::new_1d(3, DataType::Float32);
        m.as_mut_slice::<f32>().copy_from_slice(&[0.5, 2.0, -3.0]);
        let b = m.convert(DataType::Int8, 100.0);
        assert_eq!(b.as_slice::<i8>(), &[50, 127, -128]);
    }

    #[test]
    fn convert_fp16_round_trip() {
        let mut m = Mat::new_1d(4, DataType::Float32);
        m.as_mut_slice::<f32>()
            .copy_from_slice(&[0.5, -1.25, 100.0, 0.0]);
        let h = m.convert(DataType::Float16, 1.0);
        assert_eq!(h.data_type, DataType::Float16);
        assert_eq!(h.elemsize, 2);
        let back = h.convert(DataType::Float32, 1.0);
        assert_eq!(back.as_slice::<f32>(), m.as_slice::<f32>());
    }

    #[test]
    fn reductions_ignore_channel_padding() {
        // 3x3 fp32 channels pad cstep from 9 to 12; padding must not leak
        // into minmax/sum/mean
        let mut m = Mat::new_3d(3, 3, 2, DataType::Float32);
        m.fill(2.0f32);
        let mm = m.minmax();
        assert_eq!((mm.min, mm.max), (2.0, 2.0));
        assert_eq!(m.sum(), 36.0);
        assert_eq!(m.mean(), 2.0);
    }

    #[test]
    fn convert_respects_channel_strides() {
        // fp32 cstep 12 vs fp16 cstep 16 for a 3x3 channel
        let mut m = Mat::new_3d(3, 3, 2, DataType::Float32);
        for cc in 0..2 {
            for y in 0..3 {
                for x in 0..3 {
                    m.set_at::<f32>(x, y, cc, (cc * 9 + y * 3 + x) as f32);
                }
            }
        }
        let h = m.convert(DataType::Float16, 1.0);
        assert_eq!(h.cstep, 16);
        let back = h.convert(DataType::Float32, 1.0);
        assert_eq!(back.at::<f32>(0, 0, 1), 9.0);
        assert_eq!(back.at::<f32>(2, 2, 1), 17.0);
        assert_eq!(back.at::<f32>(1, 2, 0), 7.0);
    }

    #[test]
    fn concat_and_crop() {
        let a = mat_from(&[1.0, 2.0, 3.0, 4.0], 2, 2);
        let b = mat_from(&[5.0, 6.0], 2, 1);
        let v = a.vconcat(&b).unwrap();
        assert_eq!(v.h, 3);
        assert_eq!(v.as_slice::<f32>(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let c = mat_from(&[7.0, 8.0], 1, 2);
        let hcat = a.hconcat(&c).unwrap();
        assert_eq!(hcat.w, 3);
        assert_eq!(hcat.as_slice::<f32>(), &[1.0, 2.0, 7.0, 3.0, 4.0, 8.0]);

        assert!(a.vconcat(&c).is_err());

        let big = mat_from(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], 3, 3);
        let cropped = big.crop(1, 1, 3, 3).unwrap();
        assert_eq!(cropped.w, 2);
        assert_eq!(cropped.as_slice::<f32>(), &[4.0, 5.0, 7.0, 8.0]);
        assert!(big.crop(2, 2, 2, 3).is_err());
        assert!(big.crop(0, 0, 4, 1).is_err());
    }

    #[test]
    fn neg_and_casts() {
        let a = mat_from(&[1.0, -2.0], 2, 1);
        assert_eq!(a.neg().as_slice::<f32>(), &[-1.0, 2.0]);

        let h = cast_float32_to_float16(&a);
        assert_eq!(h.data_type, DataType::Float16);
        let back = cast_float16_to_float32(&h);
        assert_eq!(back.as_slice::<f32>(), a.as_slice::<f32>());

        let bf = cast_float32_to_bfloat16(&a);
        assert_eq!(bf.data_type, DataType::Int16);
        let back = cast_bfloat16_to_float32(&bf);
        assert_eq!(back.as_slice::<f32>(), &[1.0, -2.0]);

        let mut bytes = Mat::new_1d(2, DataType::Int8);
        bytes.as_mut_slice::<i8>().copy_from_slice(&[127, -128]);
        let f = cast_int8_to_float32(&bytes, 1.0 / 127.0);
        assert!((f.as_slice::<f32>()[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn clip_and_absdiff() {
        let mut m = mat_from(&[-5.0, 0.0, 5.0, 10.0], 4, 1);
        m.clip(0.0, 6.0);
        assert_eq!(m.as_slice::<f32>(), &[0.0, 0.0, 5.0, 6.0]);

        let a = mat_from(&[1.0, 5.0], 2, 1);
        let b = mat_from(&[4.0, 2.0], 2, 1);
        let d = a.absdiff(&b).unwrap();
        assert_eq!(d.as_slice::<f32>(), &[3.0, 3.0]);
    }
}
