use std::sync::Arc;
use zenith_rhi_pool::{
    Buffer, BufferDescriptor, BufferInitRequest, BufferMapRequest, BufferPool, BufferPoolDescriptorBuilder,
    BufferView, BufferViewDescriptor, Device, DeviceDescriptor, DeviceObject, HeapMemoryLevel, RhiError,
};

fn host_pool(device: &Arc<Device>, budget: u64) -> Arc<BufferPool> {
    let pool = BufferPool::new("Host");
    let descriptor = BufferPoolDescriptorBuilder::default()
        .heap_memory_level(HeapMemoryLevel::Host)
        .budget_in_bytes(budget)
        .build()
        .unwrap();
    pool.init(device, &descriptor).unwrap();
    pool
}

fn create_buffer(pool: &BufferPool, name: &str, byte_count: u64) -> Arc<Buffer> {
    let buffer = Buffer::new(name);
    pool.init_buffer(&BufferInitRequest::new(&buffer, BufferDescriptor::new(byte_count)))
        .unwrap();
    buffer
}

fn device() -> Arc<Device> {
    zenith_core::log::initialize_for_tests();
    Device::new(0, &DeviceDescriptor::default()).unwrap()
}

#[test]
fn registration_is_mirrored_on_both_sides() {
    let device = device();
    let pool = host_pool(&device, 0);
    let buffer = create_buffer(&pool, "a", 64);

    assert!(pool.resource_pool().is_registered(buffer.as_ref()));
    assert_eq!(buffer.base().pool_id(), Some(pool.resource_pool().id()));

    buffer.shutdown().unwrap();
    assert!(!pool.resource_pool().is_registered(buffer.as_ref()));
    assert_eq!(buffer.base().pool_id(), None);
    assert!(!buffer.is_initialized());
}

#[test]
fn version_grows_with_every_pool_change() {
    let device = device();
    let pool = host_pool(&device, 0);
    let buffer = Buffer::new("versioned");
    assert!(buffer.base().is_first_version());

    pool.init_buffer(&BufferInitRequest::new(&buffer, BufferDescriptor::new(32)))
        .unwrap();
    assert_eq!(buffer.version(), 1);
    buffer.shutdown().unwrap();
    assert_eq!(buffer.version(), 2);
    pool.init_buffer(&BufferInitRequest::new(&buffer, BufferDescriptor::new(32)))
        .unwrap();
    assert_eq!(buffer.version(), 3);
    assert!(!buffer.base().is_first_version());
}

#[test]
fn budget_is_enforced_at_the_boundary() {
    let device = device();
    let pool = host_pool(&device, 1024);
    let _a = create_buffer(&pool, "a", 512);
    let _b = create_buffer(&pool, "b", 512);

    let c = Buffer::new("c");
    assert_eq!(
        pool.init_buffer(&BufferInitRequest::new(&c, BufferDescriptor::new(16))),
        Err(RhiError::OutOfMemory)
    );
    assert!(!c.is_initialized());
    assert_eq!(pool.resource_pool().resource_count(), 2);
    assert_eq!(
        pool.resource_pool().heap_memory_usage(HeapMemoryLevel::Host).used_resident_in_bytes,
        1024
    );
}

#[test]
fn mapped_bytes_survive_unmap() {
    let device = device();
    let pool = host_pool(&device, 0);
    let buffer = create_buffer(&pool, "mapped", 64);

    let mapped = pool.map_buffer(&BufferMapRequest::new(&buffer, 0, 64)).unwrap();
    mapped.data.write(8, &[1, 2, 3, 4]).unwrap();
    pool.unmap_buffer(&buffer).unwrap();

    let mapped = pool.map_buffer(&BufferMapRequest::new(&buffer, 8, 4)).unwrap();
    assert_eq!(mapped.data.to_vec(), vec![1, 2, 3, 4]);
    pool.unmap_buffer(&buffer).unwrap();
    assert_eq!(pool.unmap_buffer(&buffer), Err(RhiError::InvalidOperation));
}

#[test]
fn shutdown_releases_every_resource_once() {
    let device = device();
    let pool = host_pool(&device, 0);
    let buffers: Vec<_> = (0..3).map(|i| create_buffer(&pool, &format!("b{i}"), 128)).collect();

    pool.shutdown().unwrap();
    assert_eq!(pool.resource_pool().resource_count(), 0);
    for buffer in &buffers {
        assert!(!buffer.is_initialized());
        assert!(buffer.memory_view().is_none());
        assert_eq!(buffer.version(), 2);
    }
    assert!(!pool.is_initialized());

    pool.shutdown().unwrap();
    for buffer in &buffers {
        assert_eq!(buffer.version(), 2);
    }
}

#[test]
fn frame_processing_blocks_releases() {
    let device = device();
    let pool = host_pool(&device, 0);
    let buffer = create_buffer(&pool, "in-flight", 64);

    device.begin_frame().unwrap();
    device.compile_frame().unwrap();
    assert_eq!(buffer.shutdown(), Err(RhiError::InvalidOperation));
    assert_eq!(pool.shutdown(), Err(RhiError::InvalidOperation));
    assert!(pool.resource_pool().is_registered(buffer.as_ref()));
    assert!(pool.is_initialized());

    device.end_frame().unwrap();
    buffer.shutdown().unwrap();
    pool.shutdown().unwrap();
}

#[test]
fn orphan_moves_backing_and_invalidates_views_once() {
    let device = device();
    let pool = host_pool(&device, 0);
    let buffer = create_buffer(&pool, "streamed", 256);
    let view = BufferView::new(&buffer, BufferViewDescriptor::whole()).unwrap();
    let before = buffer.gpu_address().unwrap();

    pool.orphan_buffer(&buffer).unwrap();
    assert_eq!(view.invalidation_count(), 1);
    assert_ne!(buffer.gpu_address().unwrap(), before);
    assert_eq!(device.pending_release_count(), 1);
    assert_eq!(
        pool.resource_pool().heap_memory_usage(HeapMemoryLevel::Host).used_resident_in_bytes,
        256
    );
}
