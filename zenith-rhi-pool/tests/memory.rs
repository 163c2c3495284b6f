use zenith_rhi_pool::memory::{AllocationRecordError, AllocationRecords, AllocationTrackingMode};
use zenith_rhi_pool::multi_device::{MultiDeviceBuffer, MultiDeviceBufferInitRequest, MultiDeviceBufferPool};
use zenith_rhi_pool::{
    BufferDescriptor, BufferPoolDescriptorBuilder, DeviceDescriptorBuilder, HeapMemoryLevel, MemoryReportDetail,
    RhiConfigBuilder, RhiContext,
};

#[test]
fn duplicate_record_is_reported() {
    zenith_core::log::initialize_for_tests();
    let records = AllocationRecords::new("test", AllocationTrackingMode::Basic);
    records.register_allocation(0x1000, 64, 64, 16).unwrap();
    assert_eq!(
        records.register_allocation(0x1000, 32, 32, 16),
        Err(AllocationRecordError::DuplicateAddress(0x1000))
    );
    assert_eq!(records.len(), 1);
    assert_eq!(records.requested_bytes(), 64);

    records.unregister_allocation(0x1000).unwrap();
    records.register_allocation(0x1000, 32, 32, 16).unwrap();
    assert_eq!(
        records.unregister_allocation(0x2000).unwrap_err(),
        AllocationRecordError::MissingRecord(0x2000)
    );
}

#[test]
fn tracked_heaps_follow_buffer_lifetime() {
    zenith_core::log::initialize_for_tests();
    let device = DeviceDescriptorBuilder::default()
        .allocation_tracking(Some(AllocationTrackingMode::Basic))
        .build()
        .unwrap();
    let context = RhiContext::new(&RhiConfigBuilder::default().device_count(2u32).device(device).build().unwrap())
        .unwrap();
    let pool = MultiDeviceBufferPool::new("Tracked");
    let descriptor = BufferPoolDescriptorBuilder::default()
        .heap_memory_level(HeapMemoryLevel::Host)
        .build()
        .unwrap();
    pool.init(&context, context.all_devices_mask(), &descriptor).unwrap();

    let buffer = MultiDeviceBuffer::new("tracked");
    pool.init_buffer(&MultiDeviceBufferInitRequest::new(&buffer, BufferDescriptor::new(100)))
        .unwrap();
    for (_, device_pool) in pool.device_pools() {
        let heap = device_pool.heap().unwrap();
        assert_eq!(heap.records().unwrap().len(), 1);
    }

    buffer.shutdown().unwrap();
    context.wait_for_idle().unwrap();
    for (_, device_pool) in pool.device_pools() {
        assert!(device_pool.heap().unwrap().records().unwrap().is_empty());
    }
}

#[test]
fn report_lists_every_device_pool() {
    zenith_core::log::initialize_for_tests();
    let context = RhiContext::new(&RhiConfigBuilder::default().device_count(2u32).build().unwrap()).unwrap();
    let pool = MultiDeviceBufferPool::new("Reported");
    let descriptor = BufferPoolDescriptorBuilder::default()
        .heap_memory_level(HeapMemoryLevel::Host)
        .build()
        .unwrap();
    pool.init(&context, context.all_devices_mask(), &descriptor).unwrap();
    let buffer = MultiDeviceBuffer::new("reported");
    pool.init_buffer(&MultiDeviceBufferInitRequest::new(&buffer, BufferDescriptor::new(256)))
        .unwrap();

    let reports = context.memory_statistics(MemoryReportDetail::Detail);
    assert_eq!(reports.len(), 2);
    for report in &reports {
        let name = format!("Reported [{}]", report.device_index);
        let statistics = report.pool(&name).unwrap();
        assert_eq!(statistics.memory_usage.heap(HeapMemoryLevel::Host).used_resident_in_bytes, 256);
        assert_eq!(statistics.resources.len(), 1);
        assert_eq!(statistics.resources[0].size_in_bytes, 256);
    }
}
