//! 附着边与引用计数级联。
//!
//! # 教案级导览
//! - **Why**：解码后的帧附着着它的编码数据，只要帧还活着编码数据就不能回收；
//!   帧回收时附着的缓冲必须恰好被释放一次，链式附着要逐级级联；
//! - **How**：在两个池之间建立附着边，逐步释放外部引用并观察各池的被引用数量；
//! - **What**：附着使目标计数加一，解除或回收使其减一；附着边容量来自 `ManagerConfig`。

use spark_media_buffer::{
    AllocationSource, BufferError, BufferManager, BufferPool, BufferRequest, ManagerConfig,
    OwnerId, PoolSpec, TypeDescriptor,
};

const STAGE: OwnerId = OwnerId(5);

fn pool(manager: &BufferManager, name: &str, count: u32) -> BufferPool {
    let tag = manager
        .create_type(TypeDescriptor::buffer_data(name, AllocationSource::NoAllocation))
        .expect("注册");
    manager.create_pool(tag, PoolSpec::fixed(count)).expect("建池")
}

#[test]
fn releasing_the_holder_releases_the_attached_buffer() {
    let manager = BufferManager::new(ManagerConfig::default()).expect("配置");
    let frames = pool(&manager, "frame", 2);
    let coded = pool(&manager, "coded", 2);

    let frame = frames.get_buffer(BufferRequest::new(STAGE)).expect("获取帧");
    let data = coded.get_buffer(BufferRequest::new(STAGE)).expect("获取编码数据");
    frame.attach_buffer(&data).expect("附着");
    assert_eq!(data.reference_count().expect("计数"), 2);
    assert!(
        data.owner_list()
            .expect("持有者")
            .contains(&OwnerId::ATTACHED_TO_OTHER_BUFFER)
    );
    assert_eq!(
        frame.obtain_attached_buffer(coded.type_tag()).expect("查找"),
        Some(data.clone())
    );
    assert_eq!(frame.obtain_attached_buffer(frames.type_tag()).expect("查找"), None);

    data.decrement_reference_count(STAGE).expect("上游放手");
    assert_eq!(coded.usage().referenced_buffers, 1, "附着边仍持有编码数据");

    frame.decrement_reference_count(STAGE).expect("回收帧");
    assert_eq!(frames.usage().referenced_buffers, 0);
    assert_eq!(coded.usage().referenced_buffers, 0, "帧回收时级联释放");
}

#[test]
fn chains_of_attachments_cascade() {
    let manager = BufferManager::new(ManagerConfig::default()).expect("配置");
    let pool = pool(&manager, "node", 3);
    let a = pool.get_buffer(BufferRequest::new(STAGE)).expect("获取");
    let b = pool.get_buffer(BufferRequest::new(STAGE)).expect("获取");
    let c = pool.get_buffer(BufferRequest::new(STAGE)).expect("获取");
    a.attach_buffer(&b).expect("a -> b");
    b.attach_buffer(&c).expect("b -> c");
    b.decrement_reference_count(STAGE).expect("放手 b");
    c.decrement_reference_count(STAGE).expect("放手 c");
    assert_eq!(pool.usage().referenced_buffers, 3);

    a.decrement_reference_count(STAGE).expect("放手 a");
    assert_eq!(pool.usage().referenced_buffers, 0);
    assert!(matches!(
        c.reference_count(),
        Err(BufferError::NotReferenced { .. })
    ));
}

#[test]
fn duplicate_edges_each_hold_a_reference() {
    let manager = BufferManager::new(ManagerConfig::default()).expect("配置");
    let pool = pool(&manager, "node", 2);
    let holder = pool.get_buffer(BufferRequest::new(STAGE)).expect("获取");
    let target = pool.get_buffer(BufferRequest::new(STAGE)).expect("获取");
    holder.attach_buffer(&target).expect("第一次附着");
    holder.attach_buffer(&target).expect("重复附着");
    assert_eq!(target.reference_count().expect("计数"), 3);

    holder.detach_buffer(&target).expect("解除一条边");
    assert_eq!(target.reference_count().expect("计数"), 2);
    holder.detach_buffer(&target).expect("解除第二条边");
    assert_eq!(
        holder.detach_buffer(&target),
        Err(BufferError::AttachedBufferNotFound {
            type_name: "node".into()
        })
    );
    assert_eq!(target.reference_count().expect("计数"), 1);

    holder.decrement_reference_count(STAGE).expect("释放");
    target.decrement_reference_count(STAGE).expect("释放");
}

#[test]
fn attachment_capacity_is_bounded() {
    let manager = BufferManager::new(ManagerConfig {
        max_attached_buffers: 2,
        ..ManagerConfig::default()
    })
    .expect("配置");
    let pool = pool(&manager, "node", 4);
    let holder = pool.get_buffer(BufferRequest::new(STAGE)).expect("获取");
    let targets: Vec<_> = (0..3)
        .map(|_| pool.get_buffer(BufferRequest::new(STAGE)).expect("获取"))
        .collect();
    holder.attach_buffer(&targets[0]).expect("附着");
    holder.attach_buffer(&targets[1]).expect("附着");
    assert_eq!(
        holder.attach_buffer(&targets[2]),
        Err(BufferError::TooManyAttachments {
            type_name: "node".into(),
            capacity: 2,
        })
    );
    assert_eq!(
        targets[2].reference_count().expect("计数"),
        1,
        "失败的附着不应留下引用"
    );

    holder.decrement_reference_count(STAGE).expect("释放");
    for target in &targets {
        assert_eq!(target.reference_count().expect("计数"), 1);
        target.decrement_reference_count(STAGE).expect("释放");
    }
    assert_eq!(pool.usage().referenced_buffers, 0);
}

#[test]
fn attaching_a_released_buffer_fails() {
    let manager = BufferManager::new(ManagerConfig::default()).expect("配置");
    let pool = pool(&manager, "node", 2);
    let holder = pool.get_buffer(BufferRequest::new(STAGE)).expect("获取");
    let gone = pool.get_buffer(BufferRequest::new(STAGE)).expect("获取");
    gone.decrement_reference_count(STAGE).expect("释放");
    assert!(matches!(
        holder.attach_buffer(&gone),
        Err(BufferError::NotReferenced { .. })
    ));
    holder.decrement_reference_count(STAGE).expect("释放");
}
