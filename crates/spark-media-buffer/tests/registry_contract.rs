//! 类型注册表与管理器配置的契约测试。
//!
//! # 教案级导览
//! - **Why**：类型标签是全进程共享的注册表下标，注册容量、描述符校验与类别检查一旦出错，
//!   后续所有池与元数据都会指向错误的描述符；
//! - **How**：以小容量配置构造管理器，覆盖注册溢出、按名查找、非法描述符与类别不符等路径；
//! - **What**：注册第 `max_types + 1` 个类型时且仅在此时返回 `TooManyDataTypes`。

use spark_media_buffer::{
    AllocationSource, BufferError, BufferManager, ConfigError, ErrorCategory, ManagerConfig,
    PoolSpec, TypeCategory, TypeDescriptor,
};

fn manager_with_capacity(max_types: usize) -> BufferManager {
    BufferManager::new(ManagerConfig {
        max_types,
        ..ManagerConfig::default()
    })
    .expect("合法配置")
}

#[test]
fn registry_overflow_fails_only_on_the_last_call() {
    let manager = manager_with_capacity(4);
    for index in 0..4 {
        manager
            .create_type(TypeDescriptor::buffer_data(
                format!("stream-{index}"),
                AllocationSource::OsMemory,
            ))
            .expect("容量内注册应成功");
    }
    let err = manager
        .create_type(TypeDescriptor::metadata("overflow", AllocationSource::OsMemory))
        .expect_err("第五个类型应被拒绝");
    assert_eq!(err, BufferError::TooManyDataTypes { max: 4 });
    assert_eq!(err.category(), ErrorCategory::ResourceExhaustion);
}

#[test]
fn find_type_by_name_returns_the_registered_tag() {
    let manager = manager_with_capacity(8);
    let es = manager
        .create_type(TypeDescriptor::buffer_data("coded-frame", AllocationSource::OsMemory))
        .expect("注册");
    let pts = manager
        .create_type(TypeDescriptor::metadata("pts", AllocationSource::OsMemory))
        .expect("注册");
    assert_eq!(manager.find_type_by_name("coded-frame").expect("命中"), es);
    assert_eq!(manager.find_type_by_name("pts").expect("命中"), pts);
    assert_eq!(pts.category(), TypeCategory::MetaData);
    assert!(matches!(
        manager.find_type_by_name("missing"),
        Err(BufferError::TypeNameNotFound { .. })
    ));
    let descriptor = manager.descriptor(es).expect("读取描述符");
    assert_eq!(descriptor.name(), "coded-frame");
}

#[test]
fn malformed_descriptors_are_rejected() {
    let manager = manager_with_capacity(8);
    let cases = [
        TypeDescriptor::metadata("per-buffer", AllocationSource::IndividualSuppliedBlocks),
        TypeDescriptor::metadata("eager", AllocationSource::OsMemory).allocate_on_pool_creation(true),
        TypeDescriptor::buffer_data("zero", AllocationSource::OsMemory).with_fixed_size(0),
        TypeDescriptor::buffer_data("odd", AllocationSource::OsMemory).with_alignment(3),
        TypeDescriptor::buffer_data("no-unit", AllocationSource::SuppliedBlock),
    ];
    for descriptor in cases {
        let name = descriptor.name().to_owned();
        let err = manager.create_type(descriptor).expect_err("非法描述符应被拒绝");
        assert!(
            matches!(err, BufferError::InvalidDescriptor { .. }),
            "{name} 返回了意外错误: {err}"
        );
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }
    assert!(matches!(
        manager.find_type_by_name("odd"),
        Err(BufferError::TypeNameNotFound { .. })
    ));
}

#[test]
fn pools_are_only_created_for_buffer_data_types() {
    let manager = manager_with_capacity(8);
    let meta = manager
        .create_type(TypeDescriptor::metadata("timing", AllocationSource::OsMemory))
        .expect("注册");
    let err = manager
        .create_pool(meta, PoolSpec::fixed(2))
        .expect_err("元数据类型不能建池");
    assert!(matches!(err, BufferError::TypeCategoryMismatch { .. }));
    assert_eq!(manager.pool_count(), 0);
}

#[test]
fn pool_parameters_must_match_the_allocation_source() {
    let manager = manager_with_capacity(8);
    let device = manager
        .create_type(TypeDescriptor::buffer_data("decode", AllocationSource::NamedDeviceMemory))
        .expect("注册");
    let supplied = manager
        .create_type(
            TypeDescriptor::buffer_data("es", AllocationSource::SuppliedBlock).with_allocation_unit(256),
        )
        .expect("注册");
    let eager = manager
        .create_type(
            TypeDescriptor::buffer_data("frames", AllocationSource::OsMemory)
                .allocate_on_pool_creation(true),
        )
        .expect("注册");

    assert!(matches!(
        manager.create_pool(device, PoolSpec::dynamic()),
        Err(BufferError::ParametersIncompatibleWithAllocationSource { .. })
    ));
    assert!(matches!(
        manager.create_pool(supplied, PoolSpec::dynamic()),
        Err(BufferError::ParametersIncompatibleWithAllocationSource { .. })
    ));
    assert!(matches!(
        manager.create_pool(eager, PoolSpec::dynamic().buffer_size(64)),
        Err(BufferError::InvalidPoolConfiguration { .. })
    ));
    assert!(matches!(
        manager.create_pool(eager, PoolSpec::fixed(2)),
        Err(BufferError::SizeNotSpecified { .. })
    ));
    assert!(matches!(
        manager.create_pool(eager, PoolSpec::fixed(0).buffer_size(64)),
        Err(BufferError::InvalidPoolConfiguration { .. })
    ));
    assert_eq!(manager.pool_count(), 0);
}

#[test]
fn fixed_size_types_reject_other_sizes() {
    let manager = manager_with_capacity(8);
    let tag = manager
        .create_type(
            TypeDescriptor::buffer_data("pcm", AllocationSource::OsMemory)
                .allocate_on_pool_creation(true)
                .with_fixed_size(1024),
        )
        .expect("注册");
    let err = manager
        .create_pool(tag, PoolSpec::fixed(2).buffer_size(512))
        .expect_err("尺寸与固定尺寸不符");
    assert_eq!(
        err,
        BufferError::FixedSizeMismatch {
            type_name: "pcm".into(),
            expected: 1024,
            requested: 512,
        }
    );
    let pool = manager
        .create_pool(tag, PoolSpec::fixed(2))
        .expect("省略尺寸时使用固定尺寸");
    assert_eq!(pool.usage().memory_allocated, 2048);
}

#[test]
fn manager_configuration_comes_from_toml() {
    let config = ManagerConfig::from_toml_str(
        r#"
        [buffer_manager]
        max_types = 2
        max_attached_buffers = 2
        "#,
    )
    .expect("合法配置");
    let manager = BufferManager::new(config).expect("构造管理器");
    assert_eq!(manager.config().max_attached_buffers, 2);
    manager
        .create_type(TypeDescriptor::buffer_data("a", AllocationSource::OsMemory))
        .expect("注册");
    manager
        .create_type(TypeDescriptor::buffer_data("b", AllocationSource::OsMemory))
        .expect("注册");
    assert!(matches!(
        manager.create_type(TypeDescriptor::buffer_data("c", AllocationSource::OsMemory)),
        Err(BufferError::TooManyDataTypes { max: 2 })
    ));

    let err = BufferManager::new(ManagerConfig {
        max_owner_identifiers: 0,
        ..ManagerConfig::default()
    })
    .expect_err("零容量配置非法");
    assert!(matches!(
        err,
        ConfigError::Zero {
            field: "max_owner_identifiers"
        }
    ));
}
