//! End-to-end scenarios against a real Vulkan device.
//!
//! Every test degrades to a skip (with a note on stderr) when no ICD or no
//! adapter is present, so the suite stays green on headless CI boxes.

use std::sync::Arc;

use vkpix::core::{BlobAllocator, DeviceAllocator, StagingAllocator};
use vkpix::{
    ComputeRecorder, DataType, Device, Error, Mat, Options, Pipeline, StorageKind,
};

fn gpu() -> Option<Arc<Device>> {
    match vkpix::create_gpu_instance() {
        Ok(instance) if instance.gpu_count() > 0 => {
            vkpix::get_gpu_device(vkpix::get_default_gpu_index()).ok()
        }
        _ => {
            eprintln!("skipping: no Vulkan device available");
            None
        }
    }
}

/// Fills a 4x4x3 fp32 tensor with `M[y, x, c] = y*16 + x*4 + c`.
fn indexed_mat() -> Mat {
    let mut m = Mat::new_3d(4, 4, 3, DataType::Float32);
    for c in 0..3 {
        for y in 0..4 {
            for x in 0..4 {
                m.set_at::<f32>(x, y, c, (y * 16 + x * 4 + c) as f32);
            }
        }
    }
    m
}

#[test]
fn upload_download_round_trip() {
    let Some(device) = gpu() else { return };
    let src = indexed_mat();

    let mut cmd = ComputeRecorder::new(&device, "round_trip").unwrap();
    let opt = Options::new();

    let mut gpu_mat = Mat::new();
    cmd.record_clone(&src, &mut gpu_mat, &opt);
    assert_eq!(gpu_mat.device(), StorageKind::VkBuffer);

    let mut back = Mat::new();
    cmd.record_clone(&gpu_mat, &mut back, &opt);

    cmd.submit_and_wait(u64::MAX).unwrap();

    assert_eq!(back.device(), StorageKind::Cpu);
    assert_eq!(back.as_slice::<u8>(), src.as_slice::<u8>());
}

#[test]
fn packing_round_trip_emits_hazard_barrier() {
    let Some(device) = gpu() else { return };

    let mut src = Mat::new_1d(64, DataType::Float32);
    for i in 0..64 {
        src.as_mut_slice::<f32>()[i] = i as f32;
    }

    let mut cmd = ComputeRecorder::new(&device, "packing").unwrap();
    let opt = Options::new();

    let mut gpu_mat = Mat::new();
    cmd.record_clone(&src, &mut gpu_mat, &opt);

    let barriers_before = cmd.barrier_count();

    // pack1 -> pack4, then pack4 -> pack1: the second dispatch reads what
    // the first wrote, which must be fenced by a compute->compute barrier
    let mut packed = Mat::new();
    vkpix::convert_packing(&device, &gpu_mat, &mut packed, 4, StorageKind::VkBuffer, &mut cmd, &opt)
        .unwrap();
    assert_eq!(packed.elempack, 4);
    assert_eq!(packed.w, 16);

    let mut unpacked = Mat::new();
    vkpix::convert_packing(
        &device,
        &packed,
        &mut unpacked,
        1,
        StorageKind::VkBuffer,
        &mut cmd,
        &opt,
    )
    .unwrap();

    assert!(
        cmd.barrier_count() > barriers_before,
        "no barrier between dependent dispatches"
    );

    let mut back = Mat::new();
    cmd.record_clone(&unpacked, &mut back, &opt);
    cmd.submit_and_wait(u64::MAX).unwrap();

    assert_eq!(back.as_slice::<f32>(), src.as_slice::<f32>());
}

#[test]
fn pipeline_cache_compiles_once_across_threads() {
    let Some(device) = gpu() else { return };

    let body = "
layout (binding = 0) buffer blob { float blob_data[]; };
layout (push_constant) uniform parameter { int n; } p;
void main()
{
    int gx = int(gl_GlobalInvocationID.x);
    if (gx >= p.n)
        return;
    blob_data[gx] = blob_data[gx] * 2.0;
}
";
    let opt = Options::new();
    let spirv = device.compile_spirv(body, &opt).unwrap();

    let cache = device.pipeline_cache().clone();
    let before = cache.compile_count();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let spirv = spirv.clone();
        handles.push(std::thread::spawn(move || {
            cache.get_pipeline(&spirv, &[], (4, 4, 4)).unwrap()
        }));
    }
    let entries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(cache.compile_count(), before + 1, "shader compiled more than once");
    for entry in &entries[1..] {
        assert!(Arc::ptr_eq(&entries[0], entry));
    }
}

#[test]
fn staging_allocator_reuses_cached_buffers() {
    let Some(device) = gpu() else { return };

    let staging = StagingAllocator::new(device.shared().clone());
    staging.set_size_compare_ratio(0.75);

    let first = staging.clone().alloc_buffer(1000).unwrap();
    assert_eq!(staging.driver_allocation_count(), 1);
    drop(first); // back to the cache

    let second = staging.clone().alloc_buffer(800).unwrap();
    assert_eq!(
        staging.driver_allocation_count(),
        1,
        "800-byte request should reuse the cached 1000-byte buffer"
    );
    drop(second);

    // far smaller request misses
    let third = staging.clone().alloc_buffer(100).unwrap();
    assert_eq!(staging.driver_allocation_count(), 2);
    drop(third);
}

#[test]
fn blob_allocator_free_accounting() {
    let Some(device) = gpu() else { return };

    let blob = BlobAllocator::new(device.shared().clone());
    let buf = blob.clone().alloc_buffer(100_000).unwrap();
    let capacity = buf.capacity();
    let free_before = blob.free_bytes();
    drop(buf);
    assert_eq!(blob.free_bytes(), free_before + capacity);
}

#[test]
fn timeout_leaves_recorder_reusable() {
    let Some(device) = gpu() else { return };

    // a dispatch heavy enough that no device clears it inside the deadline
    let body = "
layout (binding = 0) buffer blob { float blob_data[]; };
layout (push_constant) uniform parameter { int n; } p;
void main()
{
    int gx = int(gl_GlobalInvocationID.x);
    float v = blob_data[gx % p.n];
    for (int i = 0; i < 2000; i++)
        v = sin(v) + 1.0;
    blob_data[gx % p.n] = v;
}
";
    let opt = Options::new();
    let spirv = device.compile_spirv(body, &opt).unwrap();
    let mut pipeline = Pipeline::new(&device);
    pipeline.set_optimal_local_size_xyz(64, 1, 1);
    pipeline.create(&spirv, &[], &opt).unwrap();

    let mut cmd = ComputeRecorder::new(&device, "timeout").unwrap();
    let mut work = Mat::new_1d(4096, DataType::Float32);
    work.fill(0.5f32);
    let mut gpu_mat = Mat::new();
    cmd.record_clone(&work, &mut gpu_mat, &opt);
    cmd.record_pipeline(
        &pipeline,
        &[&gpu_mat],
        &[],
        &[vkpix::ShaderValue::I32(4096)],
        (1 << 20, 16, 1),
    );

    match cmd.submit_and_wait(1_000_000) {
        Err(Error::Timeout) => {}
        other => {
            eprintln!("skipping timeout assertions: device finished early ({other:?})");
            let _ = cmd.reset();
            return;
        }
    }

    // reset blocks until the abandoned work drains, then the recorder
    // records and submits again
    cmd.reset().unwrap();
    let src = indexed_mat();
    let mut up = Mat::new();
    cmd.record_clone(&src, &mut up, &opt);
    let mut back = Mat::new();
    cmd.record_clone(&up, &mut back, &opt);
    cmd.submit_and_wait(u64::MAX).unwrap();
    assert_eq!(back.as_slice::<u8>(), src.as_slice::<u8>());
}

#[test]
fn image_storage_round_trip() {
    let Some(device) = gpu() else { return };
    if device.dummy_image().is_none() {
        eprintln!("skipping: no storage image support");
        return;
    }

    let src = indexed_mat();
    let mut cmd = ComputeRecorder::new(&device, "image_round_trip").unwrap();
    let opt = Options {
        use_image_storage: true,
        ..Options::new()
    };

    // host -> buffer -> image -> buffer -> host
    let mut buf = Mat::new();
    cmd.record_clone(&src, &mut buf, &opt);
    let mut img = Mat::new();
    cmd.record_buffer_to_image(&buf, &mut img, &opt);
    assert_eq!(img.device(), StorageKind::VkImage);
    let mut buf2 = Mat::new();
    cmd.record_image_to_buffer(&img, &mut buf2, &opt);
    let mut back = Mat::new();
    cmd.record_clone(&buf2, &mut back, &opt);

    cmd.submit_and_wait(u64::MAX).unwrap();
    assert_eq!(back.as_slice::<f32>(), src.as_slice::<f32>());
}

#[test]
fn filter2d_identity_and_box() {
    if gpu().is_none() {
        return;
    }

    // identity kernel reproduces the input
    let mut identity = Mat::new_2d(3, 3, DataType::Float32);
    identity.set_at::<f32>(1, 1, 0, 1.0);
    let mut op = match vkpix::filters::Filter2D::new(None, &identity) {
        Ok(op) => op,
        Err(e) => {
            eprintln!("skipping: {e}");
            return;
        }
    };
    let src = indexed_mat();
    let mut dst = Mat::new();
    op.filter(&src, &mut dst).unwrap();
    for c in 0..3 {
        for y in 0..4 {
            for x in 0..4 {
                assert!(
                    (dst.at::<f32>(x, y, c) - src.at::<f32>(x, y, c)).abs() < 1e-4,
                    "({x},{y},{c})"
                );
            }
        }
    }

    // box blur of a constant field is the same constant
    let mut box_kernel = Mat::new_2d(3, 3, DataType::Float32);
    box_kernel.fill(1.0f32 / 9.0);
    let mut blur = vkpix::filters::Filter2D::new(None, &box_kernel).unwrap();
    let mut flat = Mat::new_3d(8, 8, 1, DataType::Float32);
    flat.fill(0.5f32);
    let mut blurred = Mat::new();
    blur.filter(&flat, &mut blurred).unwrap();
    assert!((blurred.at::<f32>(4, 4, 0) - 0.5).abs() < 1e-5);

    // rejects even kernels
    let even = Mat::new_2d(2, 2, DataType::Float32);
    assert!(vkpix::filters::Filter2D::new(None, &even).is_err());
}

#[test]
fn brightness_operator_end_to_end() {
    if gpu().is_none() {
        return;
    }

    let mut src = Mat::new_3d(8, 8, 3, DataType::Float32);
    src.fill(0.25f32);
    let mut dst = Mat::new();
    let mut op = match vkpix::filters::Brightness::new(None) {
        Ok(op) => op,
        Err(e) => {
            eprintln!("skipping: {e}");
            return;
        }
    };
    op.filter(&src, &mut dst, 0.5).unwrap();

    assert_eq!(dst.w, 8);
    assert_eq!(dst.c, 3);
    for &v in dst.as_slice::<f32>().iter().take(8 * 8) {
        assert!((v - 0.75).abs() < 1e-6, "{v}");
    }

    // clamped at 1.0
    let mut clamped = Mat::new();
    op.filter(&src, &mut clamped, 2.0).unwrap();
    assert!((clamped.at::<f32>(3, 3, 1) - 1.0).abs() < 1e-6);
}

#[test]
fn invert_operator_end_to_end() {
    if gpu().is_none() {
        return;
    }

    let mut src = Mat::new_3d(4, 4, 3, DataType::Float32);
    src.fill(0.2f32);
    let mut dst = Mat::new();
    let mut op = match vkpix::filters::ColorInvert::new(None) {
        Ok(op) => op,
        Err(e) => {
            eprintln!("skipping: {e}");
            return;
        }
    };
    op.filter(&src, &mut dst).unwrap();
    for &v in dst.as_slice::<f32>().iter().take(16) {
        assert!((v - 0.8).abs() < 1e-6, "{v}");
    }
}
