/*! Command recording with automatic hazard barriers.
 *
 *  A [`ComputeRecorder`] owns one primary command buffer, one fence and the
 *  transient state of a recording session. `record_*` methods never fail
 *  individually; the first error turns sticky and is surfaced by
 *  [`ComputeRecorder::submit_and_wait`]. Within one recorder, recorded ops
 *  execute on the GPU in record order, separated by barriers synthesized
 *  from each handle's last access/stage(/layout):
 *
 *  - previous write, next read or write: memory barrier (RAW/WAW)
 *  - previous read, next write: execution barrier (WAR)
 *  - image layout change: transition fused into the barrier
 *  - read after read: no barrier, the states union
 *
 *  Downloads copy into host-visible staging and are completed by a host
 *  memcpy after the fence signals. `reset` returns the recorder to the
 *  recording state and releases transient staging back to its cache.
 */

use std::mem;
use std::ptr;
use std::sync::Arc;

use arrayvec::ArrayVec;
use ash::vk;
use smallvec::SmallVec;
use vpt::{DataType, Error, Result, StorageKind};

use crate::alloc::{DeviceAllocator, DeviceBuffer, DeviceImage};
use crate::device::Device;
use crate::instance;
use crate::mat::Mat;
use crate::option::Options;
use crate::packing::{CastType, PackStorage, Packing};
use crate::pipeline::Pipeline;
use crate::reflect::BindingType;
use crate::ShaderValue;

const WRITE_MASK: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::SHADER_WRITE.as_raw()
        | vk::AccessFlags::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags::HOST_WRITE.as_raw()
        | vk::AccessFlags::MEMORY_WRITE.as_raw(),
);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecorderState {
    Recording,
    Submitted,
    Done,
    Failed,
}

struct DownloadPost {
    staging: Mat,
    dst: Mat,
}

pub struct ComputeRecorder {
    device: Arc<Device>,
    name: String,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    state: RecorderState,
    sticky: Option<Error>,
    downloads: Vec<DownloadPost>,
    /// Tensors that must outlive the submission (staging, converted temps).
    keep_alive: Vec<Mat>,
    descriptor_pools: Vec<vk::DescriptorPool>,
    barriers_issued: usize,
    blob_allocator: Option<Arc<dyn DeviceAllocator>>,
    staging_allocator: Option<Arc<dyn DeviceAllocator>>,
    #[cfg(feature = "benchmark")]
    query_pool: vk::QueryPool,
    #[cfg(feature = "benchmark")]
    query_count: u32,
}

impl ComputeRecorder {
    pub fn new(device: &Arc<Device>, name: &str) -> Result<Self> {
        let shared = device.shared();
        let family = device.info().compute_queue_family_index;
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
            .queue_family_index(family);
        let pool = unsafe { shared.raw().create_command_pool(&pool_info, None) }
            .map_err(|e| Error::Submit { status: e.as_raw() })?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = match unsafe { shared.raw().allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { shared.raw().destroy_command_pool(pool, None) };
                return Err(Error::Submit { status: e.as_raw() });
            }
        };

        let fence = match unsafe {
            shared
                .raw()
                .create_fence(&vk::FenceCreateInfo::builder(), None)
        } {
            Ok(f) => f,
            Err(e) => {
                unsafe { shared.raw().destroy_command_pool(pool, None) };
                return Err(Error::Submit { status: e.as_raw() });
            }
        };

        let mut recorder = Self {
            device: device.clone(),
            name: name.to_string(),
            pool,
            cmd,
            fence,
            state: RecorderState::Recording,
            sticky: None,
            downloads: Vec::new(),
            keep_alive: Vec::new(),
            descriptor_pools: Vec::new(),
            barriers_issued: 0,
            blob_allocator: None,
            staging_allocator: None,
            #[cfg(feature = "benchmark")]
            query_pool: vk::QueryPool::null(),
            #[cfg(feature = "benchmark")]
            query_count: 0,
        };
        recorder.begin()?;
        Ok(recorder)
    }

    fn begin(&mut self) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .shared()
                .raw()
                .begin_command_buffer(self.cmd, &info)
        }
        .map_err(|e| Error::Submit { status: e.as_raw() })?;
        self.state = RecorderState::Recording;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Barriers emitted since the last reset.
    pub fn barrier_count(&self) -> usize {
        self.barriers_issued
    }

    pub(crate) fn blob_allocator(&mut self, opt: &Options) -> Arc<dyn DeviceAllocator> {
        if let Some(a) = &opt.blob_device_allocator {
            return a.clone();
        }
        if self.blob_allocator.is_none() {
            self.blob_allocator = Some(self.device.acquire_blob_allocator());
        }
        self.blob_allocator.as_ref().unwrap().clone()
    }

    fn staging_allocator(&mut self, opt: &Options) -> Arc<dyn DeviceAllocator> {
        if let Some(a) = &opt.staging_device_allocator {
            return a.clone();
        }
        if self.staging_allocator.is_none() {
            self.staging_allocator = Some(self.device.acquire_staging_allocator());
        }
        self.staging_allocator.as_ref().unwrap().clone()
    }

    fn record(&mut self, f: impl FnOnce(&mut Self) -> Result<()>) {
        if self.sticky.is_some() || self.state != RecorderState::Recording {
            return;
        }
        if let Err(e) = f(self) {
            log::warn!("{}: recording failed: {e}", self.name);
            self.sticky = Some(e);
        }
    }

    // ------------------------------------------------------------ barriers

    fn buffer_barrier(
        &mut self,
        buffer: &Arc<DeviceBuffer>,
        dst_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let mut st = buffer.state.lock();
        let prev_writes = st.access.intersects(WRITE_MASK);
        let war = !st.access.is_empty() && dst_access.intersects(WRITE_MASK);
        if prev_writes || war {
            let barrier = vk::BufferMemoryBarrier::builder()
                .src_access_mask(st.access)
                .dst_access_mask(dst_access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(buffer.buffer())
                .offset(buffer.offset() as u64)
                .size(buffer.capacity() as u64);
            unsafe {
                self.device.shared().raw().cmd_pipeline_barrier(
                    self.cmd,
                    st.stage,
                    dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[barrier.build()],
                    &[],
                );
            }
            self.barriers_issued += 1;
            st.access = dst_access;
            st.stage = dst_stage;
        } else if st.access.is_empty() || dst_access.intersects(WRITE_MASK) {
            st.access = dst_access;
            st.stage = dst_stage;
        } else {
            // read after read: remember both consumers
            st.access |= dst_access;
            st.stage |= dst_stage;
        }
    }

    fn image_barrier(
        &mut self,
        image: &Arc<DeviceImage>,
        dst_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
        dst_layout: vk::ImageLayout,
    ) {
        let mut st = image.state.lock();
        let prev_writes = st.access.intersects(WRITE_MASK);
        let war = !st.access.is_empty() && dst_access.intersects(WRITE_MASK);
        let transition = st.layout != dst_layout;
        if prev_writes || war || transition {
            let barrier = vk::ImageMemoryBarrier::builder()
                .src_access_mask(st.access)
                .dst_access_mask(dst_access)
                .old_layout(st.layout)
                .new_layout(dst_layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image.image())
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            unsafe {
                self.device.shared().raw().cmd_pipeline_barrier(
                    self.cmd,
                    st.stage,
                    dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier.build()],
                );
            }
            self.barriers_issued += 1;
            st.access = dst_access;
            st.stage = dst_stage;
            st.layout = dst_layout;
        } else if st.access.is_empty() || dst_access.intersects(WRITE_MASK) {
            st.access = dst_access;
            st.stage = dst_stage;
        } else {
            st.access |= dst_access;
            st.stage |= dst_stage;
        }
    }

    // ------------------------------------------------------------- uploads

    /// Copies a host tensor into device-buffer storage, creating `dst` from
    /// the blob allocator when empty. Layout conversions route through the
    /// packing kernels.
    pub fn record_upload(&mut self, src: &Mat, dst: &mut Mat, opt: &Options) {
        let src = src.clone();
        let mut out = mem::take(dst);
        let result = self.record_inner_upload(&src, &mut out, opt, StorageKind::VkBuffer);
        *dst = out;
        if let Err(e) = result {
            log::warn!("{}: record_upload failed: {e}", self.name);
            self.sticky.get_or_insert(e);
        }
    }

    /// Host tensor into device-image storage.
    pub fn record_upload_image(&mut self, src: &Mat, dst: &mut Mat, opt: &Options) {
        let src = src.clone();
        let mut out = mem::take(dst);
        let result = self.record_inner_upload(&src, &mut out, opt, StorageKind::VkImage);
        *dst = out;
        if let Err(e) = result {
            log::warn!("{}: record_upload_image failed: {e}", self.name);
            self.sticky.get_or_insert(e);
        }
    }

    fn record_inner_upload(
        &mut self,
        src: &Mat,
        dst: &mut Mat,
        opt: &Options,
        target: StorageKind,
    ) -> Result<()> {
        debug_assert_eq!(src.device(), StorageKind::Cpu);
        if src.empty() {
            return Err(Error::ShapeMismatch {
                expected: "non-empty source".to_string(),
                actual: "empty tensor".to_string(),
            });
        }

        // stage through a host-visible buffer of identical layout
        let staging_allocator = self.staging_allocator(opt);
        let mut staging = Mat::new();
        staging.create_like_device(src, &staging_allocator)?;
        let staging_buffer = staging.buffer().expect("staging is buffer backed").clone();
        let mapped = staging_buffer.mapped_ptr().ok_or(Error::Alloc {
            bytes: staging.byte_size(),
            kind: vpt::AllocKind::Staging,
        })?;
        unsafe {
            ptr::copy_nonoverlapping(
                src.as_slice::<u8>().as_ptr(),
                mapped.as_ptr(),
                src.byte_size(),
            );
        }
        if !staging_allocator.coherent() {
            staging_allocator.flush(&staging_buffer)?;
        }
        {
            let mut st = staging_buffer.state.lock();
            st.access = vk::AccessFlags::HOST_WRITE;
            st.stage = vk::PipelineStageFlags::HOST;
        }

        let same_layout = |d: &Mat| {
            d.elempack == src.elempack
                && d.elemsize == src.elemsize
                && d.data_type == src.data_type
        };

        match target {
            StorageKind::VkBuffer => {
                if dst.empty() {
                    let blob = self.blob_allocator(opt);
                    dst.create_like_device(src, &blob)?;
                }
                if same_layout(dst) {
                    self.copy_buffer_mats(&staging, dst)?;
                } else {
                    self.packing_clone(&staging, dst, opt, PackStorage::Buffer)?;
                }
            }
            StorageKind::VkImage => {
                self.packing_clone(&staging, dst, opt, PackStorage::Image)?;
            }
            StorageKind::Cpu => unreachable!(),
        }

        self.keep_alive.push(staging);
        Ok(())
    }

    // ----------------------------------------------------------- downloads

    /// Copies device storage back into a host tensor after submit. The
    /// memcpy into `dst` happens once the fence signals.
    pub fn record_download(&mut self, src: &Mat, dst: &mut Mat, opt: &Options) {
        let src = src.clone();
        let mut out = mem::take(dst);
        let result = self.record_inner_download(&src, &mut out, opt);
        *dst = out;
        if let Err(e) = result {
            log::warn!("{}: record_download failed: {e}", self.name);
            self.sticky.get_or_insert(e);
        }
    }

    fn record_inner_download(&mut self, src: &Mat, dst: &mut Mat, opt: &Options) -> Result<()> {
        debug_assert_ne!(src.device(), StorageKind::Cpu);
        if src.empty() {
            return Err(Error::ShapeMismatch {
                expected: "non-empty source".to_string(),
                actual: "empty tensor".to_string(),
            });
        }

        // convert on-device first when the host layout differs
        let flat: Mat;
        let src = if src.device() == StorageKind::VkImage
            || (!dst.empty()
                && (dst.elempack != src.elempack || dst.data_type != src.data_type))
        {
            let mut tmp = Mat::new();
            let elempack = if dst.empty() { src.elempack } else { dst.elempack };
            let cast_to = cast_of(if dst.empty() { src } else { dst });
            let uop = Packing::new(
                &self.device,
                elempack,
                cast_of(src),
                cast_to,
                pack_storage_of(src),
                PackStorage::Buffer,
                opt,
            )?;
            uop.record(src, &mut tmp, self, opt)?;
            flat = tmp;
            self.keep_alive.push(flat.clone());
            &flat
        } else {
            src
        };

        let staging_allocator = self.staging_allocator(opt);
        let mut staging = Mat::new();
        staging.create_like_device(src, &staging_allocator)?;

        self.copy_buffer_mats(src, &mut staging)?;

        if dst.empty() {
            dst.create_like(src);
            if dst.empty() && dst.total() > 0 {
                return Err(Error::Alloc {
                    bytes: src.byte_size(),
                    kind: vpt::AllocKind::Host,
                });
            }
        }

        self.downloads.push(DownloadPost {
            staging,
            dst: dst.clone(),
        });
        Ok(())
    }

    // -------------------------------------------------------------- clones

    /// Clone across any two storage classes. With an empty `dst`, host
    /// sources go to device buffers and device sources come back to host.
    pub fn record_clone(&mut self, src: &Mat, dst: &mut Mat, opt: &Options) {
        let target = if dst.empty() {
            match src.device() {
                StorageKind::Cpu => StorageKind::VkBuffer,
                _ => StorageKind::Cpu,
            }
        } else {
            dst.device()
        };

        match (src.device(), target) {
            (StorageKind::Cpu, StorageKind::Cpu) => {
                dst.clone_from_mat(src);
            }
            (StorageKind::Cpu, StorageKind::VkBuffer) => self.record_upload(src, dst, opt),
            (StorageKind::Cpu, StorageKind::VkImage) => self.record_upload_image(src, dst, opt),
            (_, StorageKind::Cpu) => self.record_download(src, dst, opt),
            (StorageKind::VkBuffer, StorageKind::VkBuffer) => {
                let src = src.clone();
                let mut out = mem::take(dst);
                let result = self.clone_device_buffer(&src, &mut out, opt);
                *dst = out;
                if let Err(e) = result {
                    self.sticky.get_or_insert(e);
                }
            }
            (StorageKind::VkImage, StorageKind::VkImage) => {
                let src = src.clone();
                let mut out = mem::take(dst);
                let result = self.clone_device_image(&src, &mut out, opt);
                *dst = out;
                if let Err(e) = result {
                    self.sticky.get_or_insert(e);
                }
            }
            (StorageKind::VkBuffer, StorageKind::VkImage) => {
                self.record_buffer_to_image(src, dst, opt)
            }
            (StorageKind::VkImage, StorageKind::VkBuffer) => {
                self.record_image_to_buffer(src, dst, opt)
            }
        }
    }

    pub fn record_buffer_to_image(&mut self, src: &Mat, dst: &mut Mat, opt: &Options) {
        let src = src.clone();
        let mut out = mem::take(dst);
        let result = self.packing_clone(&src, &mut out, opt, PackStorage::Image);
        *dst = out;
        if let Err(e) = result {
            self.sticky.get_or_insert(e);
        }
    }

    pub fn record_image_to_buffer(&mut self, src: &Mat, dst: &mut Mat, opt: &Options) {
        let src = src.clone();
        let mut out = mem::take(dst);
        let result = self.packing_clone(&src, &mut out, opt, PackStorage::Buffer);
        *dst = out;
        if let Err(e) = result {
            self.sticky.get_or_insert(e);
        }
    }

    fn clone_device_buffer(&mut self, src: &Mat, dst: &mut Mat, opt: &Options) -> Result<()> {
        if dst.empty() {
            let blob = self.blob_allocator(opt);
            dst.create_like_device(src, &blob)?;
        }
        if dst.elempack == src.elempack && dst.data_type == src.data_type {
            self.copy_buffer_mats(src, dst)
        } else {
            self.packing_clone(src, dst, opt, PackStorage::Buffer)
        }
    }

    fn clone_device_image(&mut self, src: &Mat, dst: &mut Mat, opt: &Options) -> Result<()> {
        if !dst.empty() && (dst.elempack != src.elempack || dst.data_type != src.data_type) {
            return self.packing_clone(src, dst, opt, PackStorage::Image);
        }
        if dst.empty() {
            let blob = self.blob_allocator(opt);
            dst.create_like_image(src, &blob)?;
        }

        let src_image = src.image().expect("image storage").clone();
        let dst_image = dst.image().expect("image storage").clone();
        self.image_barrier(
            &src_image,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        self.image_barrier(
            &dst_image,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        let texel_w = if src.elempack == 8 { src.w * 2 } else { src.w };
        let region = vk::ImageCopy {
            src_subresource: color_layer(),
            src_offset: vk::Offset3D::default(),
            dst_subresource: color_layer(),
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: texel_w.max(1) as u32,
                height: src.h.max(1) as u32,
                depth: src.c.max(1) as u32,
            },
        };
        unsafe {
            self.device.shared().raw().cmd_copy_image(
                self.cmd,
                src_image.image(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_image.image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
        Ok(())
    }

    /// Conversion through the packing kernels, preserving elempack and type
    /// unless `dst` already prescribes different ones.
    fn packing_clone(
        &mut self,
        src: &Mat,
        dst: &mut Mat,
        opt: &Options,
        to: PackStorage,
    ) -> Result<()> {
        let elempack = if dst.empty() { src.elempack } else { dst.elempack };
        let cast_to = cast_of(if dst.empty() { src } else { dst });
        let uop = Packing::new(
            &self.device,
            elempack,
            cast_of(src),
            cast_to,
            pack_storage_of(src),
            to,
            opt,
        )?;
        uop.record(src, dst, self, opt)
    }

    fn copy_buffer_mats(&mut self, src: &Mat, dst: &mut Mat) -> Result<()> {
        let src_buffer = src.buffer().expect("buffer storage").clone();
        let dst_buffer = dst.buffer().expect("buffer storage").clone();

        self.buffer_barrier(
            &src_buffer,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        );
        self.buffer_barrier(
            &dst_buffer,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        );

        let region = vk::BufferCopy {
            src_offset: src_buffer.offset() as u64,
            dst_offset: dst_buffer.offset() as u64,
            size: src.byte_size().min(dst.byte_size()) as u64,
        };
        unsafe {
            self.device.shared().raw().cmd_copy_buffer(
                self.cmd,
                src_buffer.buffer(),
                dst_buffer.buffer(),
                &[region],
            );
        }
        Ok(())
    }

    // ----------------------------------------------------------- dispatch

    /// Binds `pipeline`, resolves bindings in slot order (buffers from
    /// `buffer_bindings`, images from `image_bindings`, dummies for the
    /// rest), writes push constants and dispatches group counts covering
    /// `dispatch = (w, h, c)`.
    pub fn record_pipeline(
        &mut self,
        pipeline: &Pipeline,
        buffer_bindings: &[&Mat],
        image_bindings: &[&Mat],
        constants: &[ShaderValue],
        dispatch: (u32, u32, u32),
    ) {
        // clone the binding tensors so the closure owns its inputs
        let buffers: Vec<Mat> = buffer_bindings.iter().map(|m| (*m).clone()).collect();
        let images: Vec<Mat> = image_bindings.iter().map(|m| (*m).clone()).collect();
        let constants: Vec<ShaderValue> = constants.to_vec();
        self.record(move |this| {
            this.record_pipeline_inner(pipeline, &buffers, &images, &constants, dispatch)
        });
    }

    fn record_pipeline_inner(
        &mut self,
        pipeline: &Pipeline,
        buffer_bindings: &[Mat],
        image_bindings: &[Mat],
        constants: &[ShaderValue],
        dispatch: (u32, u32, u32),
    ) -> Result<()> {
        let entry = pipeline
            .entry()
            .ok_or(Error::UnsupportedFeature {
                feature: "dispatch of an unbuilt pipeline",
            })?
            .clone();
        let info = &entry.shader_info;

        if constants.len() != info.push_constant_count as usize {
            log::warn!(
                "{}: push constant count mismatch: shader wants {}, got {}",
                self.name,
                info.push_constant_count,
                constants.len()
            );
        }

        let shared = self.device.shared().clone();
        let raw = shared.raw();

        // resolve every binding slot, emitting hazard barriers as we go;
        // binding indices are bounded by BINDING_MAX so the arrays never
        // spill
        let mut buffer_infos: ArrayVec<vk::DescriptorBufferInfo, { crate::reflect::BINDING_MAX }> =
            ArrayVec::new();
        let mut image_infos: ArrayVec<vk::DescriptorImageInfo, { crate::reflect::BINDING_MAX }> =
            ArrayVec::new();
        let mut slots: ArrayVec<(BindingType, usize), { crate::reflect::BINDING_MAX }> =
            ArrayVec::new();

        let dummy_buffer_mat = self.device.dummy_buffer();
        let dummy_image_mat = self.device.dummy_image();
        let mut next_buffer = 0usize;
        let mut next_image = 0usize;

        for slot in 0..info.binding_count as usize {
            match info.binding_types[slot] {
                BindingType::StorageBuffer | BindingType::None => {
                    let mat = buffer_bindings.get(next_buffer);
                    next_buffer += 1;
                    let buffer = match mat.and_then(|m| m.buffer()) {
                        Some(b) => {
                            let b = b.clone();
                            self.buffer_barrier(
                                &b,
                                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                                vk::PipelineStageFlags::COMPUTE_SHADER,
                            );
                            b
                        }
                        None => dummy_buffer_mat
                            .buffer()
                            .expect("dummy buffer storage")
                            .clone(),
                    };
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: buffer.buffer(),
                        offset: buffer.offset() as u64,
                        range: buffer.capacity() as u64,
                    });
                    slots.push((BindingType::StorageBuffer, buffer_infos.len() - 1));
                }
                BindingType::StorageImage => {
                    let mat = image_bindings.get(next_image);
                    next_image += 1;
                    // dummies transition like real bindings; they may still
                    // be in the undefined layout
                    let image = match mat.and_then(|m| m.image()) {
                        Some(i) => i.clone(),
                        None => dummy_image_mat
                            .as_ref()
                            .and_then(|m| m.image())
                            .ok_or(Error::UnsupportedFeature {
                                feature: "storage image bindings",
                            })?
                            .clone(),
                    };
                    self.image_barrier(
                        &image,
                        vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                        vk::PipelineStageFlags::COMPUTE_SHADER,
                        vk::ImageLayout::GENERAL,
                    );
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: image.view(),
                        image_layout: vk::ImageLayout::GENERAL,
                    });
                    slots.push((BindingType::StorageImage, image_infos.len() - 1));
                }
                BindingType::CombinedImageSampler => {
                    let mat = image_bindings.get(next_image);
                    next_image += 1;
                    let image = match mat.and_then(|m| m.image()) {
                        Some(i) => i.clone(),
                        None => dummy_image_mat
                            .as_ref()
                            .and_then(|m| m.image())
                            .ok_or(Error::UnsupportedFeature {
                                feature: "sampled image bindings",
                            })?
                            .clone(),
                    };
                    self.image_barrier(
                        &image,
                        vk::AccessFlags::SHADER_READ,
                        vk::PipelineStageFlags::COMPUTE_SHADER,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    );
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: shared.immutable_texelfetch_sampler(),
                        image_view: image.view(),
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    });
                    slots.push((BindingType::CombinedImageSampler, image_infos.len() - 1));
                }
            }
        }

        // descriptor writes: push-descriptor path, else pool + template
        let writes: Vec<vk::WriteDescriptorSet> = slots
            .iter()
            .enumerate()
            .map(|(slot, (ty, index))| {
                let mut write = vk::WriteDescriptorSet::builder()
                    .dst_binding(slot as u32)
                    .descriptor_type(match ty {
                        BindingType::StorageBuffer | BindingType::None => {
                            vk::DescriptorType::STORAGE_BUFFER
                        }
                        BindingType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
                        BindingType::CombinedImageSampler => {
                            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
                        }
                    });
                write = match ty {
                    BindingType::StorageBuffer | BindingType::None => {
                        write.buffer_info(&buffer_infos[*index..*index + 1])
                    }
                    _ => write.image_info(&image_infos[*index..*index + 1]),
                };
                write.build()
            })
            .collect();

        unsafe {
            raw.cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::COMPUTE, entry.pipeline);
        }

        if shared.uses_push_descriptor() {
            let fns = shared.fns().push_descriptor.as_ref().expect("push descriptor fns");
            unsafe {
                (fns.cmd_push_descriptor_set_khr)(
                    self.cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    entry.pipeline_layout,
                    0,
                    writes.len() as u32,
                    writes.as_ptr(),
                );
            }
        } else if info.binding_count > 0 {
            let set = self.allocate_descriptor_set(&entry)?;
            if let Some(template) = entry.descriptor_update_template {
                // template entries are stride-packed in slot order
                let stride = mem::size_of::<vk::DescriptorImageInfo>()
                    .max(mem::size_of::<vk::DescriptorBufferInfo>());
                let mut data = vec![0u8; stride * slots.len()];
                for (slot, (ty, index)) in slots.iter().enumerate() {
                    unsafe {
                        let dst = data.as_mut_ptr().add(slot * stride);
                        match ty {
                            BindingType::StorageBuffer | BindingType::None => {
                                ptr::copy_nonoverlapping(
                                    (&buffer_infos[*index]) as *const vk::DescriptorBufferInfo
                                        as *const u8,
                                    dst,
                                    mem::size_of::<vk::DescriptorBufferInfo>(),
                                );
                            }
                            _ => {
                                ptr::copy_nonoverlapping(
                                    (&image_infos[*index]) as *const vk::DescriptorImageInfo
                                        as *const u8,
                                    dst,
                                    mem::size_of::<vk::DescriptorImageInfo>(),
                                );
                            }
                        }
                    }
                }
                let fns = shared
                    .fns()
                    .descriptor_update_template
                    .as_ref()
                    .expect("descriptor update template fns");
                unsafe {
                    (fns.update_descriptor_set_with_template_khr)(
                        raw.handle(),
                        set,
                        template,
                        data.as_ptr().cast(),
                    );
                }
            } else {
                let mut writes = writes.clone();
                for write in &mut writes {
                    write.dst_set = set;
                }
                unsafe { raw.update_descriptor_sets(&writes, &[]) };
            }
            unsafe {
                raw.cmd_bind_descriptor_sets(
                    self.cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    entry.pipeline_layout,
                    0,
                    &[set],
                    &[],
                );
            }
        }

        if !constants.is_empty() {
            let words = crate::shader_values_bits(constants);
            unsafe {
                raw.cmd_push_constants(
                    self.cmd,
                    entry.pipeline_layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    bytemuck::cast_slice(&words),
                );
            }
        }

        let (lx, ly, lz) = entry.local_size;
        let groups = (
            dispatch.0.div_ceil(lx.max(1)),
            dispatch.1.div_ceil(ly.max(1)),
            dispatch.2.div_ceil(lz.max(1)),
        );
        unsafe {
            raw.cmd_dispatch(self.cmd, groups.0.max(1), groups.1.max(1), groups.2.max(1));
        }
        Ok(())
    }

    fn allocate_descriptor_set(
        &mut self,
        entry: &crate::cache::PipelineEntry,
    ) -> Result<vk::DescriptorSet> {
        let info = &entry.shader_info;
        let mut sizes: SmallVec<[vk::DescriptorPoolSize; 3]> = SmallVec::new();
        let mut push_size = |ty: vk::DescriptorType, count: u32| {
            if count > 0 {
                sizes.push(vk::DescriptorPoolSize {
                    ty,
                    descriptor_count: count,
                });
            }
        };
        let count_of = |want: BindingType| {
            info.binding_types[..info.binding_count as usize]
                .iter()
                .filter(|t| **t == want || (want == BindingType::StorageBuffer && **t == BindingType::None))
                .count() as u32
        };
        push_size(
            vk::DescriptorType::STORAGE_BUFFER,
            count_of(BindingType::StorageBuffer),
        );
        push_size(
            vk::DescriptorType::STORAGE_IMAGE,
            count_of(BindingType::StorageImage),
        );
        push_size(
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count_of(BindingType::CombinedImageSampler),
        );

        let shared = self.device.shared().clone();
        let raw = shared.raw();
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(1)
            .pool_sizes(&sizes);
        let pool = unsafe { raw.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| Error::Submit { status: e.as_raw() })?;
        self.descriptor_pools.push(pool);

        let layouts = [entry.descriptorset_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { raw.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| Error::Submit { status: e.as_raw() })?;
        Ok(sets[0])
    }

    // ------------------------------------------------------------- submit

    /// Ends recording, submits to an acquired compute queue, waits up to
    /// `timeout_ns`, then completes deferred downloads.
    pub fn submit_and_wait(&mut self, timeout_ns: u64) -> Result<()> {
        if let Some(e) = self.sticky.take() {
            self.state = RecorderState::Failed;
            return Err(e);
        }
        if self.state != RecorderState::Recording {
            return Err(Error::Submit { status: -1 });
        }

        let shared = self.device.shared().clone();
        let raw = shared.raw();
        unsafe { raw.end_command_buffer(self.cmd) }.map_err(|e| {
            self.state = RecorderState::Failed;
            Error::Submit { status: e.as_raw() }
        })?;

        let family = self.device.info().compute_queue_family_index;
        let queue = shared.acquire_queue(family).ok_or(Error::NoDevice)?;

        let command_buffers = [self.cmd];
        let submit = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        let submit_result = {
            profiling::scope!("vkQueueSubmit");
            unsafe { raw.queue_submit(queue, &[submit.build()], self.fence) }
        };
        if let Err(e) = submit_result {
            shared.reclaim_queue(family, queue);
            self.state = RecorderState::Failed;
            if e == vk::Result::ERROR_DEVICE_LOST {
                if let Some(instance) = instance::get_gpu_instance() {
                    instance.poison_device(self.device.device_index());
                }
                return Err(Error::DeviceLost);
            }
            return Err(Error::Submit { status: e.as_raw() });
        }
        self.state = RecorderState::Submitted;

        let wait_result = {
            profiling::scope!("vkWaitForFences");
            unsafe { raw.wait_for_fences(&[self.fence], true, timeout_ns) }
        };
        shared.reclaim_queue(family, queue);
        match wait_result {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => {
                log::warn!("{}: fence wait timed out", self.name);
                self.state = RecorderState::Failed;
                return Err(Error::Timeout);
            }
            Err(e) => {
                self.state = RecorderState::Failed;
                if e == vk::Result::ERROR_DEVICE_LOST {
                    if let Some(instance) = instance::get_gpu_instance() {
                        instance.poison_device(self.device.device_index());
                    }
                    return Err(Error::DeviceLost);
                }
                return Err(Error::Submit { status: e.as_raw() });
            }
        }

        // deferred host copies
        for post in self.downloads.drain(..) {
            let Some(buffer) = post.staging.buffer() else {
                continue;
            };
            if !buffer.allocator().coherent() {
                buffer.allocator().invalidate(buffer)?;
            }
            let Some(mapped) = buffer.mapped_ptr() else {
                continue;
            };
            let mut dst = post.dst;
            let bytes = dst.byte_size().min(post.staging.byte_size());
            unsafe {
                ptr::copy_nonoverlapping(
                    mapped.as_ptr(),
                    dst.as_mut_slice::<u8>().as_mut_ptr(),
                    bytes,
                );
            }
        }

        self.state = RecorderState::Done;
        Ok(())
    }

    /// Returns to the recording state: frees transient descriptor pools,
    /// releases staging tensors back to their allocator caches, resets the
    /// fence and command buffer. Required after a timeout before reuse.
    pub fn reset(&mut self) -> Result<()> {
        let shared = self.device.shared().clone();
        let raw = shared.raw();

        // a timed-out submission may still be executing; let it drain
        if self.state == RecorderState::Failed {
            unsafe {
                let _ = raw.wait_for_fences(&[self.fence], true, u64::MAX);
            }
        }

        self.downloads.clear();
        self.keep_alive.clear();
        for pool in self.descriptor_pools.drain(..) {
            unsafe { raw.destroy_descriptor_pool(pool, None) };
        }
        self.barriers_issued = 0;
        self.sticky = None;

        unsafe {
            raw.reset_fences(&[self.fence])
                .map_err(|e| Error::Submit { status: e.as_raw() })?;
            raw.reset_command_buffer(self.cmd, vk::CommandBufferResetFlags::empty())
                .map_err(|e| Error::Submit { status: e.as_raw() })?;
        }
        self.begin()
    }
}

#[cfg(feature = "benchmark")]
impl ComputeRecorder {
    /// Creates (or replaces) the timestamp query pool.
    pub fn create_query_pool(&mut self, query_count: u32) -> Result<()> {
        let shared = self.device.shared().clone();
        let raw = shared.raw();
        if self.query_pool != vk::QueryPool::null() {
            unsafe { raw.destroy_query_pool(self.query_pool, None) };
        }
        let info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(query_count);
        self.query_pool = unsafe { raw.create_query_pool(&info, None) }
            .map_err(|e| Error::Submit { status: e.as_raw() })?;
        self.query_count = query_count;
        unsafe {
            raw.cmd_reset_query_pool(self.cmd, self.query_pool, 0, query_count);
        }
        Ok(())
    }

    pub fn record_write_timestamp(&mut self, query: u32) {
        if self.query_pool == vk::QueryPool::null() || query >= self.query_count {
            return;
        }
        unsafe {
            self.device.shared().raw().cmd_write_timestamp(
                self.cmd,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.query_pool,
                query,
            );
        }
    }

    pub fn benchmark_start(&mut self) {
        if self.query_pool == vk::QueryPool::null() {
            let _ = self.create_query_pool(2);
        }
        self.record_write_timestamp(0);
    }

    pub fn benchmark_end(&mut self) {
        self.record_write_timestamp(1);
    }

    /// Elapsed seconds between the bracketing timestamps; NaN on error.
    pub fn benchmark(&self) -> f64 {
        match self.get_query_pool_results(0, 2) {
            Ok(results) if results.len() == 2 => {
                let period = self.device.info().timestamp_period as f64;
                (results[1].wrapping_sub(results[0])) as f64 * period * 1e-9
            }
            _ => f64::NAN,
        }
    }

    pub fn get_query_pool_results(&self, first: u32, count: u32) -> Result<Vec<u64>> {
        if self.query_pool == vk::QueryPool::null() {
            return Err(Error::UnsupportedFeature {
                feature: "timestamp query pool",
            });
        }
        let mut results = vec![0u64; count as usize];
        unsafe {
            self.device
                .shared()
                .raw()
                .get_query_pool_results(
                    self.query_pool,
                    first,
                    count,
                    &mut results,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                )
                .map_err(|e| Error::Submit { status: e.as_raw() })?;
        }
        Ok(results)
    }
}

impl Drop for ComputeRecorder {
    fn drop(&mut self) {
        let shared = self.device.shared().clone();
        let raw = shared.raw();
        unsafe {
            if self.state == RecorderState::Submitted || self.state == RecorderState::Failed {
                let _ = raw.wait_for_fences(&[self.fence], true, u64::MAX);
            }
            for pool in self.descriptor_pools.drain(..) {
                raw.destroy_descriptor_pool(pool, None);
            }
            #[cfg(feature = "benchmark")]
            if self.query_pool != vk::QueryPool::null() {
                raw.destroy_query_pool(self.query_pool, None);
            }
            raw.destroy_fence(self.fence, None);
            raw.destroy_command_pool(self.pool, None);
        }
        if let Some(a) = self.blob_allocator.take() {
            self.device.reclaim_blob_allocator(a);
        }
        if let Some(a) = self.staging_allocator.take() {
            self.device.reclaim_staging_allocator(a);
        }
    }
}

fn color_layer() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn cast_of(m: &Mat) -> CastType {
    if m.data_type == DataType::Float16 {
        CastType::Fp16Storage
    } else {
        CastType::Fp32
    }
}

fn pack_storage_of(m: &Mat) -> PackStorage {
    match m.device() {
        StorageKind::VkImage => PackStorage::Image,
        _ => PackStorage::Buffer,
    }
}

/// Upload-only recorder for long-lived weight tensors: one staging copy,
/// one transfer submission, no hazard tracking beyond the copy barrier.
pub struct TransferRecorder {
    inner: ComputeRecorder,
}

impl TransferRecorder {
    pub fn new(device: &Arc<Device>) -> Result<Self> {
        Ok(Self {
            inner: ComputeRecorder::new(device, "transfer")?,
        })
    }

    /// Records `src` into weight storage. With `flatten`, `dst` becomes a
    /// 1-D tensor of the same total element count.
    pub fn record_upload(&mut self, src: &Mat, dst: &mut Mat, opt: &Options, flatten: bool) {
        let weight = self.inner.device.weight_allocator();
        let mut shaped = src.clone();
        if flatten && src.dims != 1 {
            let total = (src.w.max(0) * src.h.max(0) * src.c.max(0)) as i32;
            match shaped.reshape_1d(total) {
                Ok(flat) => shaped = flat,
                Err(e) => {
                    self.inner.sticky.get_or_insert(e);
                    return;
                }
            }
        }
        if dst.empty() {
            if let Err(e) = dst.create_like_device(&shaped, &weight) {
                self.inner.sticky.get_or_insert(e);
                return;
            }
        }

        let staging_allocator = self.inner.device.weight_staging_allocator();
        let opt = Options {
            staging_device_allocator: Some(staging_allocator),
            blob_device_allocator: Some(weight),
            ..opt.clone()
        };
        self.inner.record_upload(&shaped, dst, &opt);
    }

    pub fn submit_and_wait(&mut self, timeout_ns: u64) -> Result<()> {
        self.inner.submit_and_wait(timeout_ns)
    }
}
