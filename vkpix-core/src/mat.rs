/*! The N-dimensional image tensor shared by every CPU and GPU path.
 *
 *  One container, three storage classes behind a tagged variant: host
 *  memory, a device buffer range, or a device image. Shape, element layout
 *  and color metadata ride along as plain fields; storage is refcounted, and
 *  the last holder's drop routes the free through the owning allocator.
 *
 *  `Clone` is shallow (shares storage, like handing out another reference);
 *  [`Mat::deep_clone`] copies bytes. Element access helpers are host-only;
 *  on device storage they return empty views, matching the rule that direct
 *  indexing of GPU tensors is a programming error.
 */

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

use vpt::{
    align_size, AllocKind, ChannelOrder, ColorFormat, ColorRange, ColorSpace, DataType, Error,
    MatFlags, Rational, Result, StorageKind, MALLOC_ALIGN,
};

use crate::alloc::{DeviceAllocator, DeviceBuffer, DeviceImage};

/// Host allocation hook; the default uses the global allocator with
/// [`MALLOC_ALIGN`] alignment and zero fill.
pub trait HostAllocator: Send + Sync {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>>;
    /// # Safety
    /// `ptr` must come from `alloc(size)` on the same allocator.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);
}

enum HostBacking {
    Owned,
    Custom(Arc<dyn HostAllocator>),
    /// View into a host-mapped device buffer; the handle keeps the mapping
    /// alive.
    MappedBuffer(#[allow(dead_code)] Arc<DeviceBuffer>),
}

/// A refcounted host allocation (or borrowed mapping).
pub struct HostBlock {
    ptr: NonNull<u8>,
    size: usize,
    backing: HostBacking,
}

unsafe impl Send for HostBlock {}
unsafe impl Sync for HostBlock {}

impl HostBlock {
    fn alloc(size: usize, allocator: Option<&Arc<dyn HostAllocator>>) -> Result<Arc<Self>> {
        if let Some(allocator) = allocator {
            let ptr = allocator.alloc(size).ok_or(Error::Alloc {
                bytes: size,
                kind: AllocKind::Host,
            })?;
            return Ok(Arc::new(Self {
                ptr,
                size,
                backing: HostBacking::Custom(allocator.clone()),
            }));
        }
        let layout = Layout::from_size_align(size.max(1), MALLOC_ALIGN).map_err(|_| {
            Error::Alloc {
                bytes: size,
                kind: AllocKind::Host,
            }
        })?;
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(Error::Alloc {
            bytes: size,
            kind: AllocKind::Host,
        })?;
        Ok(Arc::new(Self {
            ptr,
            size,
            backing: HostBacking::Owned,
        }))
    }

    fn from_mapped(buffer: Arc<DeviceBuffer>) -> Option<Arc<Self>> {
        let ptr = buffer.mapped_ptr()?;
        let size = buffer.capacity();
        Some(Arc::new(Self {
            ptr,
            size,
            backing: HostBacking::MappedBuffer(buffer),
        }))
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for HostBlock {
    fn drop(&mut self) {
        match &self.backing {
            HostBacking::Owned => unsafe {
                let layout = Layout::from_size_align_unchecked(self.size.max(1), MALLOC_ALIGN);
                std::alloc::dealloc(self.ptr.as_ptr(), layout);
            },
            HostBacking::Custom(allocator) => unsafe {
                allocator.free(self.ptr, self.size);
            },
            HostBacking::MappedBuffer(_) => {}
        }
    }
}

/// Where a tensor's bytes live.
#[derive(Clone, Default)]
pub enum Storage {
    #[default]
    None,
    Host(Arc<HostBlock>),
    Buffer(Arc<DeviceBuffer>),
    Image(Arc<DeviceImage>),
}

impl Storage {
    pub fn kind(&self) -> StorageKind {
        match self {
            Self::None | Self::Host(_) => StorageKind::Cpu,
            Self::Buffer(_) => StorageKind::VkBuffer,
            Self::Image(_) => StorageKind::VkImage,
        }
    }
}

#[derive(Clone)]
pub struct Mat {
    pub dims: i32,
    pub w: i32,
    pub h: i32,
    pub c: i32,
    /// Payload extent, when the padded extent differs.
    pub dw: i32,
    pub dh: i32,
    /// Stride between channels, in elements.
    pub cstep: usize,
    /// Bytes per element (`data_type size * elempack`).
    pub elemsize: usize,
    /// Scalar lanes per element: 1, 4 or 8.
    pub elempack: i32,

    pub data_type: DataType,
    pub color_space: ColorSpace,
    pub color_format: ColorFormat,
    pub color_range: ColorRange,
    pub ord: ChannelOrder,
    /// Significant bits per scalar.
    pub depth: i32,

    pub time_stamp: f64,
    pub duration: f64,
    pub index_count: i64,
    pub rate: Rational,
    pub flags: MatFlags,

    storage: Storage,
    byte_offset: usize,
}

impl Default for Mat {
    fn default() -> Self {
        Self {
            dims: 0,
            w: 0,
            h: 0,
            c: 0,
            dw: 0,
            dh: 0,
            cstep: 0,
            elemsize: 0,
            elempack: 1,
            data_type: DataType::Float32,
            color_space: ColorSpace::Srgb,
            color_format: ColorFormat::Gray,
            color_range: ColorRange::Full,
            ord: ChannelOrder::Ncwh,
            depth: 32,
            time_stamp: f64::NAN,
            duration: f64::NAN,
            index_count: -1,
            rate: Rational::default(),
            flags: MatFlags::empty(),
            storage: Storage::None,
            byte_offset: 0,
        }
    }
}

impl Mat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host 1-D tensor of `w` elements of `dtype`.
    pub fn new_1d(w: i32, dtype: DataType) -> Self {
        let mut m = Self::new();
        m.create_type_1d(w, dtype);
        m
    }

    pub fn new_2d(w: i32, h: i32, dtype: DataType) -> Self {
        let mut m = Self::new();
        m.create_type_2d(w, h, dtype);
        m
    }

    pub fn new_3d(w: i32, h: i32, c: i32, dtype: DataType) -> Self {
        let mut m = Self::new();
        m.create_type_3d(w, h, c, dtype);
        m
    }

    pub fn empty(&self) -> bool {
        matches!(self.storage, Storage::None) || self.total() == 0
    }

    /// Element count, including channel padding.
    pub fn total(&self) -> usize {
        self.cstep * self.c.max(0) as usize
    }

    /// Total payload bytes.
    pub fn byte_size(&self) -> usize {
        self.total() * self.elemsize
    }

    pub fn elembits(&self) -> i32 {
        if self.elempack > 0 {
            (self.elemsize * 8) as i32 / self.elempack
        } else {
            0
        }
    }

    pub fn device(&self) -> StorageKind {
        self.storage.kind()
    }

    pub fn device_index(&self) -> i32 {
        match &self.storage {
            Storage::Buffer(b) => b.allocator().device_index(),
            Storage::Image(i) => i.allocator().device_index(),
            _ => -1,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn buffer(&self) -> Option<&Arc<DeviceBuffer>> {
        match &self.storage {
            Storage::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn image(&self) -> Option<&Arc<DeviceImage>> {
        match &self.storage {
            Storage::Image(i) => Some(i),
            _ => None,
        }
    }

    pub(crate) fn buffer_allocator(&self) -> Option<&Arc<dyn DeviceAllocator>> {
        match &self.storage {
            Storage::Buffer(b) => Some(b.allocator()),
            Storage::Image(i) => Some(i.allocator()),
            _ => None,
        }
    }

    pub fn release(&mut self) {
        *self = Self {
            elempack: 1,
            ..Self::default()
        };
    }

    fn reset_metadata(&mut self, elemsize: usize, elempack: i32, dtype: DataType) {
        self.elemsize = elemsize;
        self.elempack = elempack;
        self.data_type = dtype;
        self.color_space = ColorSpace::Srgb;
        self.color_range = ColorRange::Full;
        self.flags = MatFlags::empty();
        self.rate = Rational::default();
        self.ord = ChannelOrder::Ncwh;
        self.depth = dtype.depth();
        self.time_stamp = f64::NAN;
        self.duration = f64::NAN;
        self.index_count = -1;
        self.byte_offset = 0;
    }

    fn shape_matches_1d(&self, w: i32, elemsize: usize, elempack: i32) -> bool {
        self.dims == 1 && self.w == w && self.elemsize == elemsize && self.elempack == elempack
    }

    fn shape_matches_2d(&self, w: i32, h: i32, elemsize: usize, elempack: i32) -> bool {
        self.dims == 2
            && self.w == w
            && self.h == h
            && self.elemsize == elemsize
            && self.elempack == elempack
    }

    fn shape_matches_3d(&self, w: i32, h: i32, c: i32, elemsize: usize, elempack: i32) -> bool {
        self.dims == 3
            && self.w == w
            && self.h == h
            && self.c == c
            && self.elemsize == elemsize
            && self.elempack == elempack
    }

    // ---------------------------------------------------------------- host

    pub fn create_1d(&mut self, w: i32, elemsize: usize) {
        self.create_1d_packed(w, elemsize, 1)
    }

    pub fn create_1d_packed(&mut self, w: i32, elemsize: usize, elempack: i32) {
        if self.shape_matches_1d(w, elemsize, elempack) && matches!(self.storage, Storage::Host(_))
        {
            return;
        }
        self.release();
        self.reset_metadata(elemsize, elempack, DataType::from_elemsize(elemsize));
        self.dims = 1;
        self.w = w;
        self.dw = w;
        self.h = 1;
        self.dh = 1;
        self.c = 1;
        self.cstep = w.max(0) as usize;
        self.color_format = ColorFormat::Gray;
        self.allocate_host(None);
    }

    pub fn create_2d(&mut self, w: i32, h: i32, elemsize: usize) {
        self.create_2d_packed(w, h, elemsize, 1)
    }

    pub fn create_2d_packed(&mut self, w: i32, h: i32, elemsize: usize, elempack: i32) {
        if self.shape_matches_2d(w, h, elemsize, elempack)
            && matches!(self.storage, Storage::Host(_))
        {
            return;
        }
        self.release();
        self.reset_metadata(elemsize, elempack, DataType::from_elemsize(elemsize));
        self.dims = 2;
        self.w = w;
        self.dw = w;
        self.h = h;
        self.dh = h;
        self.c = 1;
        self.cstep = (w.max(0) as usize) * h.max(0) as usize;
        self.color_format = ColorFormat::Gray;
        self.allocate_host(None);
    }

    pub fn create_3d(&mut self, w: i32, h: i32, c: i32, elemsize: usize) {
        self.create_3d_packed(w, h, c, elemsize, 1)
    }

    pub fn create_3d_packed(&mut self, w: i32, h: i32, c: i32, elemsize: usize, elempack: i32) {
        if self.shape_matches_3d(w, h, c, elemsize, elempack)
            && matches!(self.storage, Storage::Host(_))
        {
            return;
        }
        self.release();
        self.reset_metadata(elemsize, elempack, DataType::from_elemsize(elemsize));
        self.dims = if c == 1 { 2 } else { 3 };
        self.w = w;
        self.dw = w;
        self.h = h;
        self.dh = h;
        self.c = c;
        self.cstep = cstep_3d(w, h, elemsize);
        self.color_format = ColorFormat::from_channels(c);
        if elempack as usize == elemsize * c as usize {
            self.ord = ChannelOrder::Nwhc;
        }
        self.allocate_host(None);
    }

    pub fn create_type_1d(&mut self, w: i32, dtype: DataType) {
        self.create_1d(w, dtype.size_of());
        self.data_type = dtype;
        self.depth = dtype.depth();
    }

    pub fn create_type_2d(&mut self, w: i32, h: i32, dtype: DataType) {
        self.create_2d(w, h, dtype.size_of());
        self.data_type = dtype;
        self.depth = dtype.depth();
    }

    pub fn create_type_3d(&mut self, w: i32, h: i32, c: i32, dtype: DataType) {
        self.create_3d(w, h, c, dtype.size_of());
        self.data_type = dtype;
        self.depth = dtype.depth();
    }

    pub fn create_like(&mut self, m: &Mat) {
        match m.dims {
            1 => self.create_1d_packed(m.w, m.elemsize, m.elempack),
            2 => self.create_2d_packed(m.w, m.h, m.elemsize, m.elempack),
            _ => self.create_3d_packed(m.w, m.h, m.c, m.elemsize, m.elempack),
        }
        self.copy_attribute(m);
    }

    fn allocate_host(&mut self, allocator: Option<&Arc<dyn HostAllocator>>) {
        if self.total() == 0 {
            return;
        }
        let size = align_size(self.byte_size(), 4);
        match HostBlock::alloc(size, allocator) {
            Ok(block) => self.storage = Storage::Host(block),
            Err(e) => {
                log::error!("host tensor allocation failed: {e}");
                self.storage = Storage::None;
            }
        }
    }

    // -------------------------------------------------------------- device

    pub fn create_device_1d(
        &mut self,
        w: i32,
        elemsize: usize,
        elempack: i32,
        allocator: &Arc<dyn DeviceAllocator>,
    ) -> Result<()> {
        if self.shape_matches_1d(w, elemsize, elempack) && self.same_buffer_allocator(allocator) {
            return Ok(());
        }
        self.release();
        self.reset_metadata(elemsize, elempack, DataType::from_elemsize(elemsize));
        self.dims = 1;
        self.w = w;
        self.dw = w;
        self.h = 1;
        self.dh = 1;
        self.c = 1;
        self.cstep = w.max(0) as usize;
        self.color_format = ColorFormat::Gray;
        self.allocate_device_buffer(allocator)
    }

    pub fn create_device_2d(
        &mut self,
        w: i32,
        h: i32,
        elemsize: usize,
        elempack: i32,
        allocator: &Arc<dyn DeviceAllocator>,
    ) -> Result<()> {
        if self.shape_matches_2d(w, h, elemsize, elempack) && self.same_buffer_allocator(allocator)
        {
            return Ok(());
        }
        self.release();
        self.reset_metadata(elemsize, elempack, DataType::from_elemsize(elemsize));
        self.dims = 2;
        self.w = w;
        self.dw = w;
        self.h = h;
        self.dh = h;
        self.c = 1;
        self.cstep = (w.max(0) as usize) * h.max(0) as usize;
        self.color_format = ColorFormat::Gray;
        self.allocate_device_buffer(allocator)
    }

    pub fn create_device_3d(
        &mut self,
        w: i32,
        h: i32,
        c: i32,
        elemsize: usize,
        elempack: i32,
        allocator: &Arc<dyn DeviceAllocator>,
    ) -> Result<()> {
        if self.shape_matches_3d(w, h, c, elemsize, elempack)
            && self.same_buffer_allocator(allocator)
        {
            return Ok(());
        }
        self.release();
        self.reset_metadata(elemsize, elempack, DataType::from_elemsize(elemsize));
        self.dims = if c == 1 { 2 } else { 3 };
        self.w = w;
        self.dw = w;
        self.h = h;
        self.dh = h;
        self.c = c;
        self.cstep = cstep_3d(w, h, elemsize);
        self.color_format = ColorFormat::from_channels(c);
        self.allocate_device_buffer(allocator)
    }

    pub fn create_type_device_3d(
        &mut self,
        w: i32,
        h: i32,
        c: i32,
        dtype: DataType,
        allocator: &Arc<dyn DeviceAllocator>,
    ) -> Result<()> {
        self.create_device_3d(w, h, c, dtype.size_of(), 1, allocator)?;
        self.data_type = dtype;
        self.depth = dtype.depth();
        Ok(())
    }

    pub fn create_like_device(
        &mut self,
        m: &Mat,
        allocator: &Arc<dyn DeviceAllocator>,
    ) -> Result<()> {
        match m.dims {
            1 => self.create_device_1d(m.w, m.elemsize, m.elempack, allocator)?,
            2 => self.create_device_2d(m.w, m.h, m.elemsize, m.elempack, allocator)?,
            _ => self.create_device_3d(m.w, m.h, m.c, m.elemsize, m.elempack, allocator)?,
        }
        self.copy_attribute(m);
        Ok(())
    }

    /// Image-backed variant of [`create_like_device`].
    pub fn create_like_image(
        &mut self,
        m: &Mat,
        allocator: &Arc<dyn DeviceAllocator>,
    ) -> Result<()> {
        if self.shape_matches_3d(m.w, m.h, m.c, m.elemsize, m.elempack)
            && matches!(self.storage, Storage::Image(_))
            && self.same_buffer_allocator(allocator)
        {
            self.copy_attribute(m);
            return Ok(());
        }
        self.release();
        self.reset_metadata(m.elemsize, m.elempack, m.data_type);
        self.dims = m.dims;
        self.w = m.w;
        self.dw = m.dw;
        self.h = m.h;
        self.dh = m.dh;
        self.c = m.c;
        self.cstep = (m.w.max(0) as usize) * m.h.max(0) as usize;
        self.color_format = m.color_format;
        let image = allocator
            .clone()
            .alloc_image(self.w.max(1), self.h.max(1), self.c.max(1), self.elemsize, self.elempack)?;
        self.storage = Storage::Image(image);
        self.copy_attribute(m);
        Ok(())
    }

    fn allocate_device_buffer(&mut self, allocator: &Arc<dyn DeviceAllocator>) -> Result<()> {
        if self.total() == 0 {
            return Ok(());
        }
        let size = align_size(self.byte_size(), 4);
        let buffer = allocator.clone().alloc_buffer(size)?;
        self.storage = Storage::Buffer(buffer);
        Ok(())
    }

    fn same_buffer_allocator(&self, allocator: &Arc<dyn DeviceAllocator>) -> bool {
        self.buffer_allocator()
            .map_or(false, |a| Arc::ptr_eq(a, allocator))
    }

    // --------------------------------------------------------------- views

    /// Carries frame metadata (not shape or storage) from `m`.
    pub fn copy_attribute(&mut self, m: &Mat) {
        self.data_type = m.data_type;
        self.color_space = m.color_space;
        self.color_format = m.color_format;
        self.color_range = m.color_range;
        self.flags = m.flags;
        self.rate = m.rate;
        self.ord = m.ord;
        self.depth = m.depth;
        self.time_stamp = m.time_stamp;
        self.duration = m.duration;
        self.index_count = m.index_count;
    }

    pub(crate) fn host_base_ptr(&self) -> Option<NonNull<u8>> {
        match &self.storage {
            Storage::Host(block) => {
                NonNull::new(unsafe { block.as_ptr().as_ptr().add(self.byte_offset) })
            }
            _ => None,
        }
    }

    /// The whole payload viewed as scalars of `T`. Empty on device storage.
    pub fn as_slice<T: bytemuck::Pod>(&self) -> &[T] {
        match self.host_base_ptr() {
            Some(ptr) => {
                let len = self.byte_size() / std::mem::size_of::<T>();
                unsafe { std::slice::from_raw_parts(ptr.as_ptr().cast::<T>(), len) }
            }
            None => &[],
        }
    }

    /// Mutable scalar view of the payload. Empty on device storage.
    ///
    /// Writes through overlapping shallow clones are visible to each other;
    /// ordering between threads is the caller's business, the same contract
    /// the raw-pointer original had.
    pub fn as_mut_slice<T: bytemuck::Pod>(&mut self) -> &mut [T] {
        match self.host_base_ptr() {
            Some(ptr) => {
                let len = self.byte_size() / std::mem::size_of::<T>();
                unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr().cast::<T>(), len) }
            }
            None => &mut [],
        }
    }

    /// Shared view of channel `c` (3-D tensors).
    pub fn channel(&self, c: i32) -> Mat {
        debug_assert!(self.dims >= 2 && c >= 0 && c < self.c);
        let mut m = self.clone();
        m.dims = 2;
        m.c = 1;
        m.cstep = (self.w.max(0) as usize) * self.h.max(0) as usize;
        m.byte_offset = self.byte_offset + c as usize * self.cstep * self.elemsize;
        m.color_format = ColorFormat::Gray;
        m
    }

    /// Row `y` of a 2-D tensor (or of channel 0), as scalars of `T`.
    pub fn row<T: bytemuck::Pod>(&self, y: i32) -> &[T] {
        let lane = std::mem::size_of::<T>();
        let row_len = self.w.max(0) as usize * self.elemsize / lane;
        let start = y.max(0) as usize * self.w.max(0) as usize * self.elemsize / lane;
        &self.as_slice::<T>()[start..start + row_len]
    }

    /// Scalar at `(x, y)` of channel `cc`, honoring the packed layout.
    pub fn at<T: bytemuck::Pod>(&self, x: i32, y: i32, cc: i32) -> T {
        let lane = std::mem::size_of::<T>();
        debug_assert_eq!(lane * self.elempack as usize, self.elemsize);
        let idx = if self.elempack == 1 {
            cc as usize * self.cstep + (y as usize * self.w as usize + x as usize)
        } else {
            // interleaved layout: lane cc of element (x, y)
            (y as usize * self.w as usize + x as usize) * self.elempack as usize + cc as usize
        };
        self.as_slice::<T>()[idx]
    }

    pub fn set_at<T: bytemuck::Pod>(&mut self, x: i32, y: i32, cc: i32, v: T) {
        let idx = if self.elempack == 1 {
            cc as usize * self.cstep + (y as usize * self.w as usize + x as usize)
        } else {
            (y as usize * self.w as usize + x as usize) * self.elempack as usize + cc as usize
        };
        self.as_mut_slice::<T>()[idx] = v;
    }

    pub fn fill<T: bytemuck::Pod>(&mut self, v: T) {
        for e in self.as_mut_slice::<T>() {
            *e = v;
        }
    }

    // ------------------------------------------------------------- mapping

    /// Host view of a device-buffer tensor, when the owning allocator maps
    /// its memory. Empty otherwise.
    pub fn mapped(&self) -> Mat {
        let Storage::Buffer(buffer) = &self.storage else {
            return Mat::new();
        };
        if !buffer.allocator().mappable() {
            return Mat::new();
        }
        let Some(block) = HostBlock::from_mapped(buffer.clone()) else {
            return Mat::new();
        };
        let mut m = self.clone();
        m.storage = Storage::Host(block);
        m.byte_offset = 0;
        m
    }

    /// Raw host pointer into a mapped device buffer, or `None`.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        match &self.storage {
            Storage::Buffer(buffer) if buffer.allocator().mappable() => buffer.mapped_ptr(),
            _ => None,
        }
    }

    // -------------------------------------------------------------- copies

    /// Deep copy of a host tensor.
    pub fn deep_clone(&self) -> Mat {
        let mut m = Mat::new();
        m.clone_from_mat(self);
        m
    }

    /// Deep copy into `self`, reallocating as needed. Host storage only.
    pub fn clone_from_mat(&mut self, src: &Mat) {
        debug_assert_eq!(src.device(), StorageKind::Cpu);
        self.create_like(src);
        if self.total() > 0 {
            let bytes = src.byte_size();
            let dst = self.as_mut_slice::<u8>();
            dst[..bytes].copy_from_slice(&src.as_slice::<u8>()[..bytes]);
        }
    }

    /// Reshape preserving total element count; shares storage when the
    /// element layout is already dense, otherwise repacks through a copy.
    pub fn reshape_1d(&mut self, w: i32) -> Result<Mat> {
        self.reshape(w, 1, 1, 1)
    }

    pub fn reshape_2d(&mut self, w: i32, h: i32) -> Result<Mat> {
        self.reshape(w, h, 1, 2)
    }

    pub fn reshape_3d(&mut self, w: i32, h: i32, c: i32) -> Result<Mat> {
        self.reshape(w, h, c, 3)
    }

    fn reshape(&mut self, w: i32, h: i32, c: i32, dims: i32) -> Result<Mat> {
        let want = w.max(0) as usize * h.max(0) as usize * c.max(0) as usize;
        let have = self.w.max(0) as usize * self.h.max(0) as usize * self.c.max(0) as usize;
        if want != have {
            return Err(Error::ShapeMismatch {
                expected: format!("{have} elements"),
                actual: format!("{}x{}x{} = {want}", w, h, c),
            });
        }

        let dense = self.cstep == self.w.max(0) as usize * self.h.max(0) as usize;
        let new_cstep = if dims == 3 {
            cstep_3d(w, h, self.elemsize)
        } else {
            w.max(0) as usize * h.max(0) as usize
        };
        let needs_padding = dims == 3 && new_cstep != w.max(0) as usize * h.max(0) as usize;

        if dense && !needs_padding {
            let mut m = self.clone();
            m.dims = dims;
            m.w = w;
            m.dw = w;
            m.h = h;
            m.dh = h;
            m.c = c;
            m.cstep = new_cstep;
            return Ok(m);
        }

        // flatten then redistribute with channel padding
        let mut flat = Mat::new();
        flat.create_1d_packed((have) as i32, self.elemsize, self.elempack);
        flat.copy_attribute(self);
        {
            let es = self.elemsize;
            let chan_bytes = self.w.max(0) as usize * self.h.max(0) as usize * es;
            let fslice = flat.as_mut_slice::<u8>();
            for cc in 0..self.c.max(1) {
                let src_off = cc as usize * self.cstep * es;
                let dst_off = cc as usize * chan_bytes;
                let src = self.as_slice::<u8>();
                fslice[dst_off..dst_off + chan_bytes]
                    .copy_from_slice(&src[src_off..src_off + chan_bytes]);
            }
        }

        let mut m = Mat::new();
        m.create_3d_packed(w, h, c, self.elemsize, self.elempack);
        m.copy_attribute(self);
        m.dims = dims;
        {
            let es = self.elemsize;
            let chan_bytes = w.max(0) as usize * h.max(0) as usize * es;
            let cstep = m.cstep;
            let mslice = m.as_mut_slice::<u8>();
            let src = flat.as_slice::<u8>();
            for cc in 0..c.max(1) {
                let src_off = cc as usize * chan_bytes;
                let dst_off = cc as usize * cstep * es;
                mslice[dst_off..dst_off + chan_bytes]
                    .copy_from_slice(&src[src_off..src_off + chan_bytes]);
            }
        }
        Ok(m)
    }
}

impl std::fmt::Debug for Mat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mat")
            .field("dims", &self.dims)
            .field("w", &self.w)
            .field("h", &self.h)
            .field("c", &self.c)
            .field("cstep", &self.cstep)
            .field("elemsize", &self.elemsize)
            .field("elempack", &self.elempack)
            .field("data_type", &self.data_type)
            .field("device", &self.device())
            .finish()
    }
}

/// Channel stride for a 3-D tensor: `w*h` rounded so the byte stride is a
/// multiple of 16.
pub(crate) fn cstep_3d(w: i32, h: i32, elemsize: usize) -> usize {
    if elemsize == 0 {
        return 0;
    }
    align_size(w.max(0) as usize * h.max(0) as usize * elemsize, 16) / elemsize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cstep_invariants() {
        // cstep * elemsize is 16-byte aligned and covers w*h, for a spread
        // of shapes and element widths
        for &(w, h, es) in &[
            (4, 4, 4usize),
            (5, 3, 4),
            (7, 7, 2),
            (1, 1, 1),
            (13, 9, 8),
            (640, 480, 4),
            (3, 3, 1),
        ] {
            let cstep = cstep_3d(w, h, es);
            assert_eq!(cstep * es % 16, 0, "w={w} h={h} es={es}");
            assert!(cstep >= (w * h) as usize);
        }
    }

    #[test]
    fn create_3d_layout() {
        let m = Mat::new_3d(5, 3, 2, DataType::Float32);
        assert_eq!(m.dims, 3);
        assert_eq!(m.cstep, 16); // 15 floats rounded to 16-byte stride
        assert_eq!(m.total(), 32);
        assert_eq!(m.device(), StorageKind::Cpu);
        assert!(!m.empty());
        // freshly created host memory is zeroed
        assert!(m.as_slice::<f32>().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn create_collapses_single_channel() {
        let m = Mat::new_3d(4, 4, 1, DataType::Float32);
        assert_eq!(m.dims, 2);
        assert_eq!(m.cstep, 16);
    }

    #[test]
    fn create_is_idempotent() {
        let mut m = Mat::new_3d(4, 4, 3, DataType::Float32);
        m.set_at::<f32>(1, 1, 0, 7.0);
        let ptr_before = m.host_base_ptr().unwrap();
        m.create_3d(4, 4, 3, 4);
        assert_eq!(m.host_base_ptr().unwrap(), ptr_before);
        assert_eq!(m.at::<f32>(1, 1, 0), 7.0);
        // a different shape reallocates
        m.create_3d(5, 4, 3, 4);
        assert_ne!(m.w, 4);
        assert_eq!(m.at::<f32>(1, 1, 0), 0.0);
    }

    #[test]
    fn shallow_clone_shares_deep_clone_copies() {
        let mut m = Mat::new_2d(4, 4, DataType::Float32);
        m.fill(3.0f32);
        let shallow = m.clone();
        let deep = m.deep_clone();
        m.set_at::<f32>(0, 0, 0, 9.0);
        assert_eq!(shallow.at::<f32>(0, 0, 0), 9.0);
        assert_eq!(deep.at::<f32>(0, 0, 0), 3.0);
    }

    #[test]
    fn channel_views() {
        let mut m = Mat::new_3d(2, 2, 3, DataType::Float32);
        for cc in 0..3 {
            for y in 0..2 {
                for x in 0..2 {
                    m.set_at::<f32>(x, y, cc, (cc * 100 + y * 10 + x) as f32);
                }
            }
        }
        let c1 = m.channel(1);
        assert_eq!(c1.dims, 2);
        assert_eq!(c1.as_slice::<f32>()[0], 100.0);
        assert_eq!(c1.at::<f32>(1, 1, 0), 111.0);
    }

    #[test]
    fn reshape_shares_when_dense() {
        let mut m = Mat::new_2d(8, 2, DataType::Float32);
        m.fill(5.0f32);
        let r = m.reshape_1d(16).unwrap();
        assert_eq!(r.dims, 1);
        assert_eq!(r.w, 16);
        assert_eq!(r.host_base_ptr(), m.host_base_ptr());
    }

    #[test]
    fn reshape_repacks_padded_channels() {
        // 3x3 fp32 channels have cstep 12 != 9, so 2-D -> 3-D must repack
        let mut m = Mat::new_2d(9, 2, DataType::Float32);
        for i in 0..18 {
            m.as_mut_slice::<f32>()[i] = i as f32;
        }
        let r = m.reshape_3d(3, 3, 2).unwrap();
        assert_eq!(r.cstep, 12);
        assert_eq!(r.at::<f32>(0, 0, 0), 0.0);
        assert_eq!(r.at::<f32>(2, 2, 0), 8.0);
        assert_eq!(r.at::<f32>(0, 0, 1), 9.0);
        assert_eq!(r.at::<f32>(2, 2, 1), 17.0);
    }

    #[test]
    fn reshape_total_mismatch_errors() {
        let mut m = Mat::new_1d(10, DataType::Float32);
        assert!(matches!(
            m.reshape_2d(3, 4),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn release_resets() {
        let mut m = Mat::new_1d(10, DataType::Float32);
        m.release();
        assert!(m.empty());
        assert_eq!(m.total(), 0);
    }
}
