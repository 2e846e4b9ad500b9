//! 诊断快照与日志输出。
//!
//! # 教案级导览
//! - **Why**：上游记账错误（重复释放、解除不存在的附着边）不会让流水线崩溃，只会以错误返回并留下日志；
//!   现场排查依赖这些日志与 `dump` 快照，因此它们的内容本身就是契约；
//! - **How**：`#[traced_test]` 捕获测试线程上的 `tracing` 输出，`logs_contain` 断言关键消息；
//!   快照通过返回值断言，不解析日志文本；
//! - **What**：所有被断言的日志都在测试线程上产生。

use spark_media_buffer::{
    AllocationSource, BufferError, BufferManager, BufferRequest, DumpFlags, ManagerConfig,
    MetaDataMemory, OwnerId, PoolSpec, TypeDescriptor,
};
use tracing_test::traced_test;

const STAGE: OwnerId = OwnerId(9);
const PARSER: OwnerId = OwnerId(10);

fn manager() -> BufferManager {
    BufferManager::new(ManagerConfig::default()).expect("配置")
}

#[test]
#[traced_test]
fn double_release_is_reported() {
    let manager = manager();
    let tag = manager
        .create_type(TypeDescriptor::buffer_data("frame", AllocationSource::NoAllocation))
        .expect("注册");
    let pool = manager.create_pool(tag, PoolSpec::fixed(1)).expect("建池");
    let buffer = pool.get_buffer(BufferRequest::new(STAGE)).expect("获取");
    buffer.decrement_reference_count(STAGE).expect("释放");

    assert_eq!(
        buffer.decrement_reference_count(STAGE),
        Err(BufferError::NotReferenced {
            type_name: "frame".into(),
            index: 0,
        })
    );
    assert!(logs_contain("operation on a buffer that is not referenced"));
    assert_eq!(pool.usage().referenced_buffers, 0);
}

#[test]
#[traced_test]
fn missing_attachment_is_reported() {
    let manager = manager();
    let tag = manager
        .create_type(TypeDescriptor::buffer_data("node", AllocationSource::NoAllocation))
        .expect("注册");
    let pool = manager.create_pool(tag, PoolSpec::fixed(2)).expect("建池");
    let holder = pool.get_buffer(BufferRequest::new(STAGE)).expect("获取");
    let stranger = pool.get_buffer(BufferRequest::new(STAGE)).expect("获取");

    assert!(matches!(
        holder.detach_buffer(&stranger),
        Err(BufferError::AttachedBufferNotFound { .. })
    ));
    assert!(logs_contain("attached buffer not found"));

    holder.decrement_reference_count(STAGE).expect("释放");
    stranger.decrement_reference_count(STAGE).expect("释放");
}

#[test]
#[traced_test]
fn owner_overflow_only_warns() {
    let manager = BufferManager::new(ManagerConfig {
        max_owner_identifiers: 1,
        ..ManagerConfig::default()
    })
    .expect("配置");
    let tag = manager
        .create_type(TypeDescriptor::buffer_data("frame", AllocationSource::NoAllocation))
        .expect("注册");
    let pool = manager.create_pool(tag, PoolSpec::fixed(1)).expect("建池");
    let buffer = pool.get_buffer(BufferRequest::new(STAGE)).expect("获取");

    buffer.increment_reference_count(PARSER).expect("槽位满时仍计数");
    assert!(logs_contain("more references than owner slots"));
    assert_eq!(buffer.reference_count().expect("计数"), 2);
    assert_eq!(buffer.owner_list().expect("持有者"), vec![STAGE]);

    buffer.transfer_ownership(OwnerId(99), PARSER).expect("未知持有者只告警");
    assert!(logs_contain("current owner not found"));

    buffer.decrement_reference_count(PARSER).expect("释放");
    buffer.decrement_reference_count(STAGE).expect("释放");
}

#[test]
#[traced_test]
fn non_blocking_shortfall_is_logged_at_debug() {
    let manager = manager();
    let tag = manager
        .create_type(TypeDescriptor::buffer_data("frame", AllocationSource::NoAllocation))
        .expect("注册");
    let pool = manager.create_pool(tag, PoolSpec::fixed(1)).expect("建池");
    let held = pool.get_buffer(BufferRequest::new(STAGE)).expect("获取");
    let err = pool
        .get_buffer(BufferRequest::new(STAGE).non_blocking(true))
        .expect_err("池已耗尽");
    assert!(err.is_backpressure());
    assert!(logs_contain("no free buffer for non-blocking request"));
    held.decrement_reference_count(STAGE).expect("释放");
}

#[test]
#[traced_test]
fn dump_reports_pool_and_buffers() {
    let manager = manager();
    let frame_tag = manager
        .create_type(
            TypeDescriptor::buffer_data("frame", AllocationSource::OsMemory)
                .allocate_on_pool_creation(true),
        )
        .expect("注册");
    let geometry = manager
        .create_type(TypeDescriptor::metadata("geometry", AllocationSource::OsMemory))
        .expect("注册");
    let pts = manager
        .create_type(TypeDescriptor::metadata("pts", AllocationSource::OsMemory))
        .expect("注册");
    let pool = manager
        .create_pool(frame_tag, PoolSpec::fixed(2).buffer_size(256))
        .expect("建池");
    pool.attach_metadata(geometry, Some(32), MetaDataMemory::Allocate)
        .expect("池级元数据");

    let first = pool.get_buffer(BufferRequest::new(STAGE)).expect("获取");
    let second = pool.get_buffer(BufferRequest::new(PARSER)).expect("获取");
    first.set_used_data_size(100).expect("已用量");
    first
        .attach_metadata(pts, Some(8), MetaDataMemory::Allocate)
        .expect("私有元数据");
    first.attach_buffer(&second).expect("附着");

    let report = pool.dump(DumpFlags::ALL);
    assert_eq!(report.type_name, "frame");
    assert_eq!(report.tag, frame_tag);
    assert_eq!(report.metadata, vec![geometry]);
    assert_eq!(report.usage.referenced_buffers, 2);
    assert_eq!(report.usage.memory_allocated, 512);
    assert_eq!(report.usage.memory_in_use, 100);
    assert_eq!(report.buffers.len(), 2);

    let head = report
        .buffers
        .iter()
        .find(|buffer| buffer.index == first.index())
        .expect("第一个缓冲在快照中");
    assert_eq!(head.reference_count, 1);
    assert_eq!(head.owners, vec![STAGE]);
    assert_eq!(head.data_size, 256);
    assert_eq!(head.used_size, 100);
    assert!(head.cached_address.is_some());
    assert_eq!(head.metadata, vec![geometry, pts]);
    assert_eq!(head.attached, vec![(frame_tag, second.index())]);

    let tail = first.dump();
    assert_eq!(&tail, head);
    assert!(logs_contain("pool report"));
    assert!(logs_contain("buffer report"));

    let summaries = manager.dump(DumpFlags::POOL);
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].buffers.is_empty());

    second.decrement_reference_count(PARSER).expect("释放");
    first.decrement_reference_count(STAGE).expect("释放");
    let usage = pool.usage();
    assert_eq!(usage.referenced_buffers, 0);
    assert_eq!(usage.memory_in_use, 0);
    assert_eq!(usage.memory_allocated, 512, "建池时分配的内存随池存续");
}

#[test]
#[traced_test]
fn detaching_pool_metadata_from_a_live_buffer_warns() {
    let manager = manager();
    let frame_tag = manager
        .create_type(TypeDescriptor::buffer_data("frame", AllocationSource::NoAllocation))
        .expect("注册");
    let timing = manager
        .create_type(TypeDescriptor::metadata("timing", AllocationSource::OsMemory))
        .expect("注册");
    let pool = manager.create_pool(frame_tag, PoolSpec::fixed(2)).expect("建池");
    pool.attach_metadata(timing, Some(16), MetaDataMemory::Allocate)
        .expect("池级元数据");
    let buffer = pool.get_buffer(BufferRequest::new(STAGE)).expect("获取");
    assert_eq!(buffer.obtain_metadata_reference(timing).expect("可见").size, 16);

    pool.detach_metadata(timing).expect("卸下");
    assert!(logs_contain("detaching pool meta data from a buffer in use"));
    assert!(matches!(
        buffer.obtain_metadata_reference(timing),
        Err(BufferError::MetaDataTypeNotFound { .. })
    ));
    buffer.decrement_reference_count(STAGE).expect("释放");
}
