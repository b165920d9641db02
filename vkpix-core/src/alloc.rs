/*! GPU memory allocators and the refcounted handles they hand out.
 *
 *  Three families, one trait:
 *
 *  - [`BlobAllocator`]: short-lived per-op scratch. Carves buffer ranges out
 *    of 16 MiB device-local blocks with a first-fit free list that coalesces
 *    on release.
 *  - [`WeightAllocator`]: long-lived tensors. Bump-allocates inside 8 MiB
 *    blocks; individual frees are a no-op, everything is returned at
 *    [`DeviceAllocator::clear`].
 *  - [`StagingAllocator`]: host-visible copy windows, recycled through a
 *    capacity-ordered cache with a compare ratio.
 *
 *  Handles ([`DeviceBuffer`], [`DeviceImage`]) are shared as `Arc`s; the last
 *  drop routes the free back through the owning allocator. The `state` field
 *  on each handle is the live access/stage(/layout) the command recorder
 *  consults when it synthesizes hazard barriers.
 */

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use vpt::{align_size, AllocKind, Error, Result};

use crate::device::DeviceShared;

/// Last recorded use of a buffer range, consulted for barrier synthesis.
#[derive(Clone, Copy, Debug)]
pub struct BufferState {
    pub access: vk::AccessFlags,
    pub stage: vk::PipelineStageFlags,
}

impl Default for BufferState {
    fn default() -> Self {
        Self {
            access: vk::AccessFlags::empty(),
            stage: vk::PipelineStageFlags::TOP_OF_PIPE,
        }
    }
}

/// Last recorded use of an image, including its current layout.
#[derive(Clone, Copy, Debug)]
pub struct ImageState {
    pub access: vk::AccessFlags,
    pub stage: vk::PipelineStageFlags,
    pub layout: vk::ImageLayout,
}

impl Default for ImageState {
    fn default() -> Self {
        Self {
            access: vk::AccessFlags::empty(),
            stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

/// A buffer range owned by an allocator.
///
/// `buffer` is the pool block's `VkBuffer` (or a dedicated buffer for the
/// staging family); `offset`/`capacity` delimit the range this handle may
/// touch.
pub struct DeviceBuffer {
    buffer: vk::Buffer,
    offset: usize,
    capacity: usize,
    memory: vk::DeviceMemory,
    mapped_base: Option<NonNull<u8>>,
    pub(crate) state: Mutex<BufferState>,
    allocator: Arc<dyn DeviceAllocator>,
    pub(crate) block_index: usize,
}

unsafe impl Send for DeviceBuffer {}
unsafe impl Sync for DeviceBuffer {}

impl DeviceBuffer {
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Host pointer to the start of this range, when the owning allocator
    /// maps its memory.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped_base
            .map(|base| unsafe { NonNull::new_unchecked(base.as_ptr().add(self.offset)) })
    }

    pub fn allocator(&self) -> &Arc<dyn DeviceAllocator> {
        &self.allocator
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        let allocator = self.allocator.clone();
        allocator.free_buffer(self);
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("buffer", &self.buffer)
            .field("offset", &self.offset)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// A 3-D storage image plus its view. Always backed by its own memory
/// allocation; the dedicated-allocation extension is used when the driver
/// prefers it.
pub struct DeviceImage {
    image: vk::Image,
    view: vk::ImageView,
    width: i32,
    height: i32,
    depth: i32,
    format: vk::Format,
    memory: vk::DeviceMemory,
    bind_capacity: usize,
    pub(crate) state: Mutex<ImageState>,
    pub(crate) command_refcount: AtomicUsize,
    allocator: Arc<dyn DeviceAllocator>,
}

unsafe impl Send for DeviceImage {}
unsafe impl Sync for DeviceImage {}

impl DeviceImage {
    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn depth(&self) -> i32 {
        self.depth
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub(crate) fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn bind_capacity(&self) -> usize {
        self.bind_capacity
    }

    pub fn allocator(&self) -> &Arc<dyn DeviceAllocator> {
        &self.allocator
    }
}

impl Drop for DeviceImage {
    fn drop(&mut self) {
        let allocator = self.allocator.clone();
        allocator.free_image(self);
    }
}

impl std::fmt::Debug for DeviceImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceImage")
            .field("image", &self.image)
            .field("extent", &(self.width, self.height, self.depth))
            .field("format", &self.format)
            .finish()
    }
}

/// The storage image format for a given scalar width and packing.
///
/// elempack 8 keeps rgba texels and doubles the image width; the load/store
/// shader helpers read two texels per logical element.
pub(crate) fn image_format(elemsize: usize, elempack: i32) -> vk::Format {
    let lane = elemsize / elempack.max(1) as usize;
    match (lane, elempack) {
        (2, 1) => vk::Format::R16_SFLOAT,
        (2, 4) | (2, 8) => vk::Format::R16G16B16A16_SFLOAT,
        (4, 4) | (4, 8) => vk::Format::R32G32B32A32_SFLOAT,
        _ => vk::Format::R32_SFLOAT,
    }
}

/// One interface over the blob/weight/staging families.
///
/// `alloc_*` take an `Arc<Self>` receiver so the returned handle can route
/// its final drop back through the allocator that produced it.
pub trait DeviceAllocator: Send + Sync {
    fn alloc_buffer(self: Arc<Self>, size: usize) -> Result<Arc<DeviceBuffer>>;

    fn alloc_image(
        self: Arc<Self>,
        w: i32,
        h: i32,
        c: i32,
        elemsize: usize,
        elempack: i32,
    ) -> Result<Arc<DeviceImage>>;

    fn free_buffer(&self, buffer: &DeviceBuffer);

    fn free_image(&self, image: &DeviceImage);

    /// Flush a host-written range of non-coherent memory.
    fn flush(&self, buffer: &DeviceBuffer) -> Result<()>;

    /// Invalidate a device-written range of non-coherent memory before a
    /// host read.
    fn invalidate(&self, buffer: &DeviceBuffer) -> Result<()>;

    fn mappable(&self) -> bool;

    fn coherent(&self) -> bool;

    fn device_index(&self) -> i32;

    /// Release every cached block immediately.
    fn clear(&self);
}

/// State shared by all allocator implementations on one device.
struct AllocatorBase {
    device: Arc<DeviceShared>,
    buffer_memory_type_index: u32,
    image_memory_type_index: u32,
    mappable: bool,
    coherent: bool,
    kind: AllocKind,
}

impl AllocatorBase {
    fn device_local(device: Arc<DeviceShared>, kind: AllocKind) -> Self {
        // Integrated GPUs expose device-local host-visible memory; prefer it
        // there so `Mat::mapped` works without a staging hop. Discrete GPUs
        // get plain device-local.
        let integrated = device.info().device_type == crate::instance::GpuType::Integrated;
        let (preferred, preferred_not) = if integrated {
            (
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::MemoryPropertyFlags::empty(),
            )
        } else {
            (
                vk::MemoryPropertyFlags::empty(),
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            )
        };
        let index = device
            .find_memory_index(
                !0,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                preferred,
                preferred_not,
            )
            .unwrap_or(0);
        let mappable = device.is_mappable(index);
        let coherent = device.is_coherent(index);
        Self {
            device,
            buffer_memory_type_index: index,
            image_memory_type_index: index,
            mappable,
            coherent,
            kind,
        }
    }

    fn host_visible(device: Arc<DeviceShared>, kind: AllocKind) -> Self {
        let index = device
            .find_memory_index(
                !0,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
                vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .or_else(|| {
                device.find_memory_index(
                    !0,
                    vk::MemoryPropertyFlags::HOST_VISIBLE,
                    vk::MemoryPropertyFlags::empty(),
                    vk::MemoryPropertyFlags::empty(),
                )
            })
            .unwrap_or(0);
        let coherent = device.is_coherent(index);
        Self {
            device,
            buffer_memory_type_index: index,
            image_memory_type_index: index,
            mappable: true,
            coherent,
            kind,
        }
    }

    fn buffer_alignment(&self) -> usize {
        self.device.info().buffer_offset_alignment.max(16)
    }

    fn alloc_err(&self, bytes: usize) -> Error {
        Error::Alloc {
            bytes,
            kind: self.kind,
        }
    }

    unsafe fn create_buffer(&self, size: usize) -> Result<(vk::Buffer, vk::MemoryRequirements)> {
        let info = vk::BufferCreateInfo::builder()
            .size(size as u64)
            .usage(
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = self
            .device
            .raw()
            .create_buffer(&info, None)
            .map_err(|_| self.alloc_err(size))?;
        let requirements = self.device.raw().get_buffer_memory_requirements(buffer);
        Ok((buffer, requirements))
    }

    unsafe fn allocate_memory(
        &self,
        size: usize,
        memory_type_bits: u32,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory> {
        let index = if memory_type_bits & (1 << memory_type_index) != 0 {
            memory_type_index
        } else {
            // driver excluded our preselected type for this resource
            self.device
                .find_memory_index(
                    memory_type_bits,
                    vk::MemoryPropertyFlags::empty(),
                    vk::MemoryPropertyFlags::empty(),
                    vk::MemoryPropertyFlags::empty(),
                )
                .ok_or_else(|| self.alloc_err(size))?
        };
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size as u64)
            .memory_type_index(index);
        self.device
            .raw()
            .allocate_memory(&info, None)
            .map_err(|_| self.alloc_err(size))
    }

    unsafe fn map_if_host_visible(
        &self,
        memory: vk::DeviceMemory,
        size: usize,
    ) -> Option<NonNull<u8>> {
        if !self.mappable {
            return None;
        }
        self.device
            .raw()
            .map_memory(memory, 0, size as u64, vk::MemoryMapFlags::empty())
            .ok()
            .and_then(|ptr| NonNull::new(ptr.cast::<u8>()))
    }

    unsafe fn create_image(
        &self,
        width: u32,
        height: u32,
        depth: u32,
        format: vk::Format,
        tiling: vk::ImageTiling,
    ) -> Result<vk::Image> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_3D)
            .format(format)
            .extent(vk::Extent3D {
                width,
                height,
                depth,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(tiling)
            .usage(
                vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        self.device
            .raw()
            .create_image(&info, None)
            .map_err(|_| self.alloc_err(0))
    }

    unsafe fn create_imageview(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_3D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        self.device
            .raw()
            .create_image_view(&info, None)
            .map_err(|_| self.alloc_err(0))
    }

    /// Allocates and binds backing memory for one image, dedicating the
    /// allocation when the driver reports a preference for it.
    unsafe fn back_image(
        &self,
        image: vk::Image,
        tiling: vk::ImageTiling,
    ) -> Result<(vk::DeviceMemory, usize)> {
        let raw = self.device.raw();
        let mut prefers_dedicated = false;
        let mut requirements = raw.get_image_memory_requirements(image);

        if let Some(fns) = &self.device.fns().get_memory_requirements2 {
            let info = vk::ImageMemoryRequirementsInfo2::builder().image(image);
            let mut dedicated = vk::MemoryDedicatedRequirements::default();
            let mut requirements2 = vk::MemoryRequirements2::builder()
                .push_next(&mut dedicated)
                .build();
            (fns.get_image_memory_requirements2_khr)(raw.handle(), &info.build(), &mut requirements2);
            requirements = requirements2.memory_requirements;
            prefers_dedicated = dedicated.prefers_dedicated_allocation != vk::FALSE
                || dedicated.requires_dedicated_allocation != vk::FALSE;
        }

        let size = requirements.size as usize;
        let index = if requirements.memory_type_bits & (1 << self.image_memory_type_index) != 0 {
            self.image_memory_type_index
        } else {
            let required = if tiling == vk::ImageTiling::LINEAR {
                vk::MemoryPropertyFlags::HOST_VISIBLE
            } else {
                vk::MemoryPropertyFlags::empty()
            };
            self.device
                .find_memory_index(
                    requirements.memory_type_bits,
                    required,
                    vk::MemoryPropertyFlags::empty(),
                    vk::MemoryPropertyFlags::empty(),
                )
                .ok_or_else(|| self.alloc_err(size))?
        };

        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder().image(image);
        let mut info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(index);
        if prefers_dedicated && self.device.info().extensions.khr_dedicated_allocation {
            info = info.push_next(&mut dedicated_info);
        }
        let memory = raw
            .allocate_memory(&info, None)
            .map_err(|_| self.alloc_err(size))?;
        if let Err(e) = raw.bind_image_memory(image, memory, 0) {
            log::error!("bind_image_memory failed: {e:?}");
            raw.free_memory(memory, None);
            return Err(self.alloc_err(size));
        }
        Ok((memory, size))
    }

    unsafe fn destroy_image(&self, image: &DeviceImage) {
        let raw = self.device.raw();
        raw.destroy_image_view(image.view(), None);
        raw.destroy_image(image.image(), None);
        raw.free_memory(image.memory(), None);
    }

    fn flush_range(&self, buffer: &DeviceBuffer) -> Result<()> {
        if self.coherent {
            return Ok(());
        }
        let (offset, size) = self.nc_range(buffer);
        let range = vk::MappedMemoryRange::builder()
            .memory(buffer.memory())
            .offset(offset)
            .size(size);
        unsafe {
            self.device
                .raw()
                .flush_mapped_memory_ranges(&[range.build()])
                .map_err(|_| self.alloc_err(buffer.capacity()))
        }
    }

    fn invalidate_range(&self, buffer: &DeviceBuffer) -> Result<()> {
        if self.coherent {
            return Ok(());
        }
        let (offset, size) = self.nc_range(buffer);
        let range = vk::MappedMemoryRange::builder()
            .memory(buffer.memory())
            .offset(offset)
            .size(size);
        unsafe {
            self.device
                .raw()
                .invalidate_mapped_memory_ranges(&[range.build()])
                .map_err(|_| self.alloc_err(buffer.capacity()))
        }
    }

    /// Range aligned to the non-coherent atom size, as Vulkan requires.
    fn nc_range(&self, buffer: &DeviceBuffer) -> (u64, u64) {
        let atom = self.device.info().non_coherent_atom_size.max(1);
        let start = buffer.offset() / atom * atom;
        let end = align_size(buffer.offset() + buffer.capacity(), atom);
        (start as u64, (end - start) as u64)
    }
}

/// One device-local block of a pool allocator.
struct PoolBlock {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped_base: Option<NonNull<u8>>,
    size: usize,
    /// Sorted `(offset, size)` free ranges.
    free: Vec<(usize, usize)>,
}

unsafe impl Send for PoolBlock {}

impl PoolBlock {
    fn first_fit(&mut self, size: usize) -> Option<usize> {
        let pos = self.free.iter().position(|&(_, s)| s >= size)?;
        let (offset, range_size) = self.free[pos];
        if range_size == size {
            self.free.remove(pos);
        } else {
            self.free[pos] = (offset + size, range_size - size);
        }
        Some(offset)
    }

    fn release(&mut self, offset: usize, size: usize) {
        let pos = self
            .free
            .iter()
            .position(|&(o, _)| o > offset)
            .unwrap_or(self.free.len());
        self.free.insert(pos, (offset, size));
        // coalesce with the next range, then the previous one
        if pos + 1 < self.free.len() && self.free[pos].0 + self.free[pos].1 == self.free[pos + 1].0
        {
            self.free[pos].1 += self.free[pos + 1].1;
            self.free.remove(pos + 1);
        }
        if pos > 0 && self.free[pos - 1].0 + self.free[pos - 1].1 == self.free[pos].0 {
            self.free[pos - 1].1 += self.free[pos].1;
            self.free.remove(pos);
        }
    }

    fn free_bytes(&self) -> usize {
        self.free.iter().map(|&(_, s)| s).sum()
    }
}

/// Block-pool allocator for short-lived per-op scratch buffers.
pub struct BlobAllocator {
    base: AllocatorBase,
    preferred_block_size: usize,
    blocks: Mutex<Vec<PoolBlock>>,
}

impl BlobAllocator {
    pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024 * 1024;

    pub fn new(device: Arc<DeviceShared>) -> Arc<Self> {
        Self::with_block_size(device, Self::DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(device: Arc<DeviceShared>, preferred_block_size: usize) -> Arc<Self> {
        Arc::new(Self {
            base: AllocatorBase::device_local(device, AllocKind::Blob),
            preferred_block_size,
            blocks: Mutex::new(Vec::new()),
        })
    }

    /// Total bytes currently sitting on free lists, across all blocks.
    pub fn free_bytes(&self) -> usize {
        self.blocks.lock().iter().map(PoolBlock::free_bytes).sum()
    }
}

impl DeviceAllocator for BlobAllocator {
    fn alloc_buffer(self: Arc<Self>, size: usize) -> Result<Arc<DeviceBuffer>> {
        let aligned = align_size(size.max(1), self.base.buffer_alignment());

        let mut blocks = self.blocks.lock();
        for (block_index, block) in blocks.iter_mut().enumerate() {
            if let Some(offset) = block.first_fit(aligned) {
                return Ok(Arc::new(DeviceBuffer {
                    buffer: block.buffer,
                    offset,
                    capacity: aligned,
                    memory: block.memory,
                    mapped_base: block.mapped_base,
                    state: Mutex::new(BufferState::default()),
                    allocator: self.clone(),
                    block_index,
                }));
            }
        }

        // no block has a large enough hole; grow the pool
        let block_size = self.preferred_block_size.max(aligned);
        log::debug!(
            "blob allocator: new {block_size} byte block for a {aligned} byte request"
        );
        let block = unsafe {
            let (buffer, requirements) = self.base.create_buffer(block_size)?;
            let memory = match self.base.allocate_memory(
                requirements.size as usize,
                requirements.memory_type_bits,
                self.base.buffer_memory_type_index,
            ) {
                Ok(m) => m,
                Err(e) => {
                    self.base.device.raw().destroy_buffer(buffer, None);
                    return Err(e);
                }
            };
            if let Err(e) = self.base.device.raw().bind_buffer_memory(buffer, memory, 0) {
                log::error!("bind_buffer_memory failed: {e:?}");
                self.base.device.raw().destroy_buffer(buffer, None);
                self.base.device.raw().free_memory(memory, None);
                return Err(self.base.alloc_err(block_size));
            }
            let mapped_base = self.base.map_if_host_visible(memory, block_size);
            PoolBlock {
                buffer,
                memory,
                mapped_base,
                size: block_size,
                free: vec![(aligned, block_size - aligned)],
            }
        };
        let handle = Arc::new(DeviceBuffer {
            buffer: block.buffer,
            offset: 0,
            capacity: aligned,
            memory: block.memory,
            mapped_base: block.mapped_base,
            state: Mutex::new(BufferState::default()),
            allocator: self.clone(),
            block_index: blocks.len(),
        });
        blocks.push(block);
        Ok(handle)
    }

    fn alloc_image(
        self: Arc<Self>,
        w: i32,
        h: i32,
        c: i32,
        elemsize: usize,
        elempack: i32,
    ) -> Result<Arc<DeviceImage>> {
        alloc_dedicated_image(
            &self.base,
            self.clone(),
            w,
            h,
            c,
            elemsize,
            elempack,
            vk::ImageTiling::OPTIMAL,
        )
    }

    fn free_buffer(&self, buffer: &DeviceBuffer) {
        let mut blocks = self.blocks.lock();
        if let Some(block) = blocks.get_mut(buffer.block_index) {
            block.release(buffer.offset(), buffer.capacity());
        }
    }

    fn free_image(&self, image: &DeviceImage) {
        unsafe { self.base.destroy_image(image) }
    }

    fn flush(&self, buffer: &DeviceBuffer) -> Result<()> {
        self.base.flush_range(buffer)
    }

    fn invalidate(&self, buffer: &DeviceBuffer) -> Result<()> {
        self.base.invalidate_range(buffer)
    }

    fn mappable(&self) -> bool {
        self.base.mappable
    }

    fn coherent(&self) -> bool {
        self.base.coherent
    }

    fn device_index(&self) -> i32 {
        self.base.device.info().physical_device_index as i32
    }

    fn clear(&self) {
        let mut blocks = self.blocks.lock();
        let raw = self.base.device.raw();
        for block in blocks.drain(..) {
            if block.free_bytes() != block.size {
                log::warn!("blob allocator cleared with live suballocations");
            }
            unsafe {
                if block.mapped_base.is_some() {
                    raw.unmap_memory(block.memory);
                }
                raw.destroy_buffer(block.buffer, None);
                raw.free_memory(block.memory, None);
            }
        }
    }
}

impl Drop for BlobAllocator {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Bump-pool allocator for tensors that live until device teardown.
pub struct WeightAllocator {
    base: AllocatorBase,
    preferred_block_size: usize,
    blocks: Mutex<Vec<WeightBlock>>,
}

struct WeightBlock {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped_base: Option<NonNull<u8>>,
    size: usize,
    cursor: usize,
}

unsafe impl Send for WeightBlock {}

impl WeightAllocator {
    pub const DEFAULT_BLOCK_SIZE: usize = 8 * 1024 * 1024;

    pub fn new(device: Arc<DeviceShared>) -> Arc<Self> {
        Arc::new(Self {
            base: AllocatorBase::device_local(device, AllocKind::Weight),
            preferred_block_size: Self::DEFAULT_BLOCK_SIZE,
            blocks: Mutex::new(Vec::new()),
        })
    }
}

impl DeviceAllocator for WeightAllocator {
    fn alloc_buffer(self: Arc<Self>, size: usize) -> Result<Arc<DeviceBuffer>> {
        let aligned = align_size(size.max(1), self.base.buffer_alignment());

        let mut blocks = self.blocks.lock();
        for (block_index, block) in blocks.iter_mut().enumerate() {
            if block.size - block.cursor >= aligned {
                let offset = block.cursor;
                block.cursor += aligned;
                return Ok(Arc::new(DeviceBuffer {
                    buffer: block.buffer,
                    offset,
                    capacity: aligned,
                    memory: block.memory,
                    mapped_base: block.mapped_base,
                    state: Mutex::new(BufferState::default()),
                    allocator: self.clone(),
                    block_index,
                }));
            }
        }

        let block_size = self.preferred_block_size.max(aligned);
        log::debug!("weight allocator: new {block_size} byte block");
        let block = unsafe {
            let (buffer, requirements) = self.base.create_buffer(block_size)?;
            let memory = match self.base.allocate_memory(
                requirements.size as usize,
                requirements.memory_type_bits,
                self.base.buffer_memory_type_index,
            ) {
                Ok(m) => m,
                Err(e) => {
                    self.base.device.raw().destroy_buffer(buffer, None);
                    return Err(e);
                }
            };
            if let Err(e) = self.base.device.raw().bind_buffer_memory(buffer, memory, 0) {
                log::error!("bind_buffer_memory failed: {e:?}");
                self.base.device.raw().destroy_buffer(buffer, None);
                self.base.device.raw().free_memory(memory, None);
                return Err(self.base.alloc_err(block_size));
            }
            let mapped_base = self.base.map_if_host_visible(memory, block_size);
            WeightBlock {
                buffer,
                memory,
                mapped_base,
                size: block_size,
                cursor: aligned,
            }
        };
        let handle = Arc::new(DeviceBuffer {
            buffer: block.buffer,
            offset: 0,
            capacity: aligned,
            memory: block.memory,
            mapped_base: block.mapped_base,
            state: Mutex::new(BufferState::default()),
            allocator: self.clone(),
            block_index: blocks.len(),
        });
        blocks.push(block);
        Ok(handle)
    }

    fn alloc_image(
        self: Arc<Self>,
        w: i32,
        h: i32,
        c: i32,
        elemsize: usize,
        elempack: i32,
    ) -> Result<Arc<DeviceImage>> {
        alloc_dedicated_image(
            &self.base,
            self.clone(),
            w,
            h,
            c,
            elemsize,
            elempack,
            vk::ImageTiling::OPTIMAL,
        )
    }

    fn free_buffer(&self, _buffer: &DeviceBuffer) {
        // weights live until clear()
    }

    fn free_image(&self, image: &DeviceImage) {
        unsafe { self.base.destroy_image(image) }
    }

    fn flush(&self, buffer: &DeviceBuffer) -> Result<()> {
        self.base.flush_range(buffer)
    }

    fn invalidate(&self, buffer: &DeviceBuffer) -> Result<()> {
        self.base.invalidate_range(buffer)
    }

    fn mappable(&self) -> bool {
        self.base.mappable
    }

    fn coherent(&self) -> bool {
        self.base.coherent
    }

    fn device_index(&self) -> i32 {
        self.base.device.info().physical_device_index as i32
    }

    fn clear(&self) {
        let mut blocks = self.blocks.lock();
        let raw = self.base.device.raw();
        for block in blocks.drain(..) {
            unsafe {
                if block.mapped_base.is_some() {
                    raw.unmap_memory(block.memory);
                }
                raw.destroy_buffer(block.buffer, None);
                raw.free_memory(block.memory, None);
            }
        }
    }
}

impl Drop for WeightAllocator {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Host-visible staging allocator with a per-size reuse cache.
pub struct StagingAllocator {
    base: AllocatorBase,
    size_compare_ratio: Mutex<f32>,
    /// Cached buffers sorted by ascending capacity.
    cache: Mutex<Vec<CachedStaging>>,
    driver_allocations: AtomicUsize,
}

struct CachedStaging {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapped_base: Option<NonNull<u8>>,
    capacity: usize,
}

unsafe impl Send for CachedStaging {}

/// Index of the smallest cached capacity that can serve `size` under the
/// compare ratio: reuse `b` iff `b.capacity * ratio <= size <= b.capacity`.
fn staging_reuse_index(capacities: &[usize], size: usize, ratio: f32) -> Option<usize> {
    capacities
        .iter()
        .position(|&c| (c as f32 * ratio) as usize <= size && size <= c)
}

impl StagingAllocator {
    pub const DEFAULT_SIZE_COMPARE_RATIO: f32 = 0.75;

    pub fn new(device: Arc<DeviceShared>) -> Arc<Self> {
        Arc::new(Self {
            base: AllocatorBase::host_visible(device, AllocKind::Staging),
            size_compare_ratio: Mutex::new(Self::DEFAULT_SIZE_COMPARE_RATIO),
            cache: Mutex::new(Vec::new()),
            driver_allocations: AtomicUsize::new(0),
        })
    }

    /// Ratio in `0..=1`; a cached buffer is reused when
    /// `capacity * ratio <= requested <= capacity`.
    pub fn set_size_compare_ratio(&self, ratio: f32) {
        *self.size_compare_ratio.lock() = ratio.clamp(0.0, 1.0);
    }

    /// How many times the driver was asked for fresh memory. Cache hits do
    /// not move this counter.
    pub fn driver_allocation_count(&self) -> usize {
        self.driver_allocations.load(Ordering::Relaxed)
    }
}

impl DeviceAllocator for StagingAllocator {
    fn alloc_buffer(self: Arc<Self>, size: usize) -> Result<Arc<DeviceBuffer>> {
        let ratio = *self.size_compare_ratio.lock();
        {
            let mut cache = self.cache.lock();
            let capacities: Vec<usize> = cache.iter().map(|c| c.capacity).collect();
            if let Some(pos) = staging_reuse_index(&capacities, size, ratio) {
                let cached = cache.remove(pos);
                return Ok(Arc::new(DeviceBuffer {
                    buffer: cached.buffer,
                    offset: 0,
                    capacity: cached.capacity,
                    memory: cached.memory,
                    mapped_base: cached.mapped_base,
                    state: Mutex::new(BufferState::default()),
                    allocator: self.clone(),
                    block_index: usize::MAX,
                }));
            }
        }

        let aligned = align_size(size.max(1), self.base.buffer_alignment());
        let (buffer, memory, mapped_base) = unsafe {
            let (buffer, requirements) = self.base.create_buffer(aligned)?;
            let memory = match self.base.allocate_memory(
                requirements.size as usize,
                requirements.memory_type_bits,
                self.base.buffer_memory_type_index,
            ) {
                Ok(m) => m,
                Err(e) => {
                    self.base.device.raw().destroy_buffer(buffer, None);
                    return Err(e);
                }
            };
            if let Err(e) = self.base.device.raw().bind_buffer_memory(buffer, memory, 0) {
                log::error!("bind_buffer_memory failed: {e:?}");
                self.base.device.raw().destroy_buffer(buffer, None);
                self.base.device.raw().free_memory(memory, None);
                return Err(self.base.alloc_err(aligned));
            }
            let mapped_base = self.base.map_if_host_visible(memory, aligned);
            (buffer, memory, mapped_base)
        };
        self.driver_allocations.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(DeviceBuffer {
            buffer,
            offset: 0,
            capacity: aligned,
            memory,
            mapped_base,
            state: Mutex::new(BufferState::default()),
            allocator: self.clone(),
            block_index: usize::MAX,
        }))
    }

    fn alloc_image(
        self: Arc<Self>,
        w: i32,
        h: i32,
        c: i32,
        elemsize: usize,
        elempack: i32,
    ) -> Result<Arc<DeviceImage>> {
        // host-visible linear image; rarely useful, but the family exposes
        // the same four operations
        alloc_dedicated_image(
            &self.base,
            self.clone(),
            w,
            h,
            c,
            elemsize,
            elempack,
            vk::ImageTiling::LINEAR,
        )
    }

    fn free_buffer(&self, buffer: &DeviceBuffer) {
        let mut cache = self.cache.lock();
        let pos = cache
            .iter()
            .position(|c| c.capacity > buffer.capacity())
            .unwrap_or(cache.len());
        cache.insert(
            pos,
            CachedStaging {
                buffer: buffer.buffer(),
                memory: buffer.memory(),
                mapped_base: buffer.mapped_base,
                capacity: buffer.capacity(),
            },
        );
    }

    fn free_image(&self, image: &DeviceImage) {
        unsafe { self.base.destroy_image(image) }
    }

    fn flush(&self, buffer: &DeviceBuffer) -> Result<()> {
        self.base.flush_range(buffer)
    }

    fn invalidate(&self, buffer: &DeviceBuffer) -> Result<()> {
        self.base.invalidate_range(buffer)
    }

    fn mappable(&self) -> bool {
        true
    }

    fn coherent(&self) -> bool {
        self.base.coherent
    }

    fn device_index(&self) -> i32 {
        self.base.device.info().physical_device_index as i32
    }

    fn clear(&self) {
        let mut cache = self.cache.lock();
        let raw = self.base.device.raw();
        for cached in cache.drain(..) {
            unsafe {
                if cached.mapped_base.is_some() {
                    raw.unmap_memory(cached.memory);
                }
                raw.destroy_buffer(cached.buffer, None);
                raw.free_memory(cached.memory, None);
            }
        }
    }
}

impl Drop for StagingAllocator {
    fn drop(&mut self) {
        self.clear();
    }
}

fn alloc_dedicated_image(
    base: &AllocatorBase,
    allocator: Arc<dyn DeviceAllocator>,
    w: i32,
    h: i32,
    c: i32,
    elemsize: usize,
    elempack: i32,
    tiling: vk::ImageTiling,
) -> Result<Arc<DeviceImage>> {
    let format = image_format(elemsize, elempack);
    // elempack 8 stores two rgba texels per logical element
    let texel_w = if elempack == 8 { w as u32 * 2 } else { w as u32 };
    let limits_ok = {
        let info = base.device.info();
        texel_w.max(1) <= info.max_image_dimension_3d
            && (h as u32).max(1) <= info.max_image_dimension_3d
            && (c as u32).max(1) <= info.max_image_dimension_3d
    };
    if !limits_ok {
        return Err(base.alloc_err(0));
    }

    unsafe {
        let image = base.create_image(
            texel_w.max(1),
            (h as u32).max(1),
            (c as u32).max(1),
            format,
            tiling,
        )?;
        let (memory, size) = match base.back_image(image, tiling) {
            Ok(v) => v,
            Err(e) => {
                base.device.raw().destroy_image(image, None);
                return Err(e);
            }
        };
        let view = match base.create_imageview(image, format) {
            Ok(v) => v,
            Err(e) => {
                base.device.raw().destroy_image(image, None);
                base.device.raw().free_memory(memory, None);
                return Err(e);
            }
        };
        Ok(Arc::new(DeviceImage {
            image,
            view,
            width: w,
            height: h,
            depth: c,
            format,
            memory,
            bind_capacity: size,
            state: Mutex::new(ImageState::default()),
            command_refcount: AtomicUsize::new(0),
            allocator,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_block_first_fit_and_coalesce() {
        let mut block = PoolBlock {
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            mapped_base: None,
            size: 1024,
            free: vec![(0, 1024)],
        };
        let a = block.first_fit(256).unwrap();
        let b = block.first_fit(256).unwrap();
        let c = block.first_fit(512).unwrap();
        assert_eq!((a, b, c), (0, 256, 512));
        assert!(block.first_fit(1).is_none());

        block.release(b, 256);
        block.release(c, 512);
        assert_eq!(block.free, vec![(256, 768)]);
        block.release(a, 256);
        assert_eq!(block.free, vec![(0, 1024)]);
        assert_eq!(block.free_bytes(), 1024);
    }

    #[test]
    fn pool_block_release_order_independent() {
        let mut block = PoolBlock {
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            mapped_base: None,
            size: 300,
            free: vec![(0, 300)],
        };
        let a = block.first_fit(100).unwrap();
        let b = block.first_fit(100).unwrap();
        let c = block.first_fit(100).unwrap();
        block.release(a, 100);
        block.release(c, 100);
        block.release(b, 100);
        assert_eq!(block.free, vec![(0, 300)]);
    }

    #[test]
    fn staging_reuse_ratio() {
        // mirrors the documented 0.75 contract: 1000-byte cached buffer
        // serves an 800-byte request but not a 500-byte one
        assert_eq!(staging_reuse_index(&[1000], 800, 0.75), Some(0));
        assert_eq!(staging_reuse_index(&[1000], 750, 0.75), Some(0));
        assert_eq!(staging_reuse_index(&[1000], 500, 0.75), None);
        assert_eq!(staging_reuse_index(&[1000], 1001, 0.75), None);
        // smallest adequate wins
        assert_eq!(staging_reuse_index(&[512, 1000, 4096], 900, 0.75), Some(1));
        assert_eq!(staging_reuse_index(&[], 16, 0.75), None);
    }

    #[test]
    fn image_format_selection() {
        assert_eq!(image_format(4, 1), vk::Format::R32_SFLOAT);
        assert_eq!(image_format(16, 4), vk::Format::R32G32B32A32_SFLOAT);
        assert_eq!(image_format(2, 1), vk::Format::R16_SFLOAT);
        assert_eq!(image_format(8, 4), vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(image_format(16, 8), vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(image_format(32, 8), vk::Format::R32G32B32A32_SFLOAT);
    }
}
