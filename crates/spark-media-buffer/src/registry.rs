use core::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use spark_media_alloc::{HeapPartitionAllocator, PartitionAllocator};
use tracing::{debug, error, warn};

use crate::{
    buffer::Buffer,
    config::{ConfigError, ManagerConfig},
    error::BufferError,
    observability::{DumpFlags, PoolReport},
    pool::{BufferPool, PoolContext, PoolShared, PoolSpec},
    types::{OwnerId, TypeCategory, TypeDescriptor, TypeTag},
};

/// 进程内的类型注册表；条目只增不减，标签即下标。
///
/// 读多写少：池与缓冲在每次挂接元数据时查询描述符，注册只发生在启动阶段，
/// 因此使用 `spin::RwLock`，读路径不进入内核。
pub(crate) struct TypeCatalog {
    max_types: usize,
    entries: spin::RwLock<Vec<Arc<TypeDescriptor>>>,
}

impl TypeCatalog {
    fn new(max_types: usize) -> Self {
        Self {
            max_types,
            entries: spin::RwLock::new(Vec::new()),
        }
    }

    fn register(&self, descriptor: TypeDescriptor) -> Result<TypeTag, BufferError> {
        let descriptor = descriptor.validated()?;
        let mut entries = self.entries.write();
        if entries.len() >= self.max_types {
            return Err(BufferError::TooManyDataTypes {
                max: self.max_types,
            });
        }
        let tag = TypeTag::new(descriptor.category(), entries.len());
        entries.push(Arc::new(descriptor));
        Ok(tag)
    }

    fn find_by_name(&self, name: &str) -> Result<TypeTag, BufferError> {
        self.entries
            .read()
            .iter()
            .enumerate()
            .find(|(_, descriptor)| descriptor.name() == name)
            .map(|(index, descriptor)| TypeTag::new(descriptor.category(), index))
            .ok_or_else(|| BufferError::TypeNameNotFound {
                name: name.to_owned(),
            })
    }

    /// 按标签取描述符，并校验类别。
    pub(crate) fn descriptor(
        &self,
        tag: TypeTag,
        expected: TypeCategory,
    ) -> Result<Arc<TypeDescriptor>, BufferError> {
        let descriptor = self
            .entries
            .read()
            .get(tag.index())
            .cloned()
            .ok_or(BufferError::UnknownType { tag })?;
        if descriptor.category() != tag.category() {
            return Err(BufferError::UnknownType { tag });
        }
        if tag.category() != expected {
            return Err(BufferError::TypeCategoryMismatch { tag, expected });
        }
        Ok(descriptor)
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

struct ManagerShared {
    config: ManagerConfig,
    catalog: Arc<TypeCatalog>,
    partitions: Arc<dyn PartitionAllocator>,
    /// 注册表锁：保护池列表，锁顺序中位于池锁之前。
    pools: Mutex<Vec<Arc<PoolShared>>>,
}

/// `BufferManager` 是缓冲管理核心的入口：类型注册表与池登记表。
///
/// # 设计初衷（Why）
/// - 播放器启动时注册所有缓冲与元数据类型，随后各流水线阶段以类型标签创建自己的池；
/// - 销毁池需要跨池操作（从所有池的缓冲上剥离指向被销毁池缓冲的附着边），
///   只有登记了全部池的管理器能完成。
///
/// # 核心机制（How）
/// - 类型注册表放在 `spin::RwLock` 中并与各池共享，池列表由 `parking_lot::Mutex` 保护；
/// - 设备分区通过 [`PartitionAllocator`] 注入，默认使用主机堆模拟的 [`HeapPartitionAllocator`]。
///
/// # 契约说明（What）
/// - 句柄可克隆，克隆体共享同一注册表；
/// - 注册表容量、持有者槽位、附着边容量与等待节奏来自 [`ManagerConfig`]。
#[derive(Clone)]
pub struct BufferManager {
    shared: Arc<ManagerShared>,
}

impl fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("config", &self.shared.config)
            .field("types", &self.shared.catalog.len())
            .field("pools", &self.shared.pools.lock().len())
            .finish()
    }
}

impl BufferManager {
    /// 以主机堆分区分配器创建管理器。
    pub fn new(config: ManagerConfig) -> Result<Self, ConfigError> {
        Self::with_partition_allocator(config, Arc::new(HeapPartitionAllocator::new()))
    }

    pub fn with_partition_allocator(
        config: ManagerConfig,
        partitions: Arc<dyn PartitionAllocator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        debug!(
            max_types = config.max_types,
            max_owner_identifiers = config.max_owner_identifiers,
            max_attached_buffers = config.max_attached_buffers,
            "buffer manager created"
        );
        Ok(Self {
            shared: Arc::new(ManagerShared {
                catalog: Arc::new(TypeCatalog::new(config.max_types)),
                config,
                partitions,
                pools: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// 注册类型并返回其标签。
    pub fn create_type(&self, descriptor: TypeDescriptor) -> Result<TypeTag, BufferError> {
        let name = descriptor.name().to_owned();
        match self.shared.catalog.register(descriptor) {
            Ok(tag) => {
                debug!(type_name = %name, %tag, "type registered");
                Ok(tag)
            }
            Err(err) => {
                error!(type_name = %name, %err, "type registration failed");
                Err(err)
            }
        }
    }

    /// 按名称查找类型；同名类型返回最先注册的一个。
    pub fn find_type_by_name(&self, name: &str) -> Result<TypeTag, BufferError> {
        self.shared.catalog.find_by_name(name)
    }

    /// 读取已注册的描述符。
    pub fn descriptor(&self, tag: TypeTag) -> Result<Arc<TypeDescriptor>, BufferError> {
        self.shared.catalog.descriptor(tag, tag.category())
    }

    /// 为缓冲数据类型建池。
    pub fn create_pool(&self, tag: TypeTag, spec: PoolSpec) -> Result<BufferPool, BufferError> {
        let descriptor = self
            .shared
            .catalog
            .descriptor(tag, TypeCategory::BufferData)
            .inspect_err(|err| error!(%tag, %err, "cannot create pool for this type"))?;
        let shared = PoolShared::create(
            PoolContext {
                tag,
                descriptor,
                catalog: Arc::clone(&self.shared.catalog),
                partitions: Arc::clone(&self.shared.partitions),
                config: &self.shared.config,
            },
            spec,
        )
        .inspect_err(|err| error!(%tag, %err, "pool creation failed"))?;
        let shared = Arc::new(shared);
        self.shared.pools.lock().push(Arc::clone(&shared));
        Ok(BufferPool::from_shared(shared))
    }

    /// 销毁池。
    ///
    /// # 核心机制（How）
    /// 1. 标记池关闭、唤醒阻塞的获取、卸下池级元数据；
    /// 2. 在注册表锁内，对池中每个仍被引用的缓冲，从所有池上剥离指向它的附着边并逐条释放引用；
    /// 3. 若仍有缓冲被引用，输出池快照并返回 [`BufferError::PoolStillReferenced`]，池保持登记；
    /// 4. 否则从注册表移除并释放全部内存。
    pub fn destroy_pool(&self, pool: &BufferPool) -> Result<(), BufferError> {
        let target = &pool.shared;
        let registered = self
            .shared
            .pools
            .lock()
            .iter()
            .any(|entry| Arc::ptr_eq(entry, target));
        if !registered {
            warn!(type_name = target.type_name(), "pool is not registered with this manager");
            return Err(BufferError::PoolDestroyed {
                type_name: target.type_name().to_owned(),
            });
        }

        let live = target.begin_teardown();
        {
            let pools = self.shared.pools.lock();
            for buffer in &live {
                detach_everywhere(&pools, buffer);
            }
        }
        target.finish_teardown()?;
        self.shared
            .pools
            .lock()
            .retain(|entry| !Arc::ptr_eq(entry, target));
        Ok(())
    }

    /// 从所有池的缓冲上剥离指向 `buffer` 的附着边，并为每条边释放一个引用，返回剥离数量。
    pub fn force_detach_buffer(&self, buffer: &Buffer) -> usize {
        let pools = self.shared.pools.lock();
        detach_everywhere(&pools, buffer)
    }

    pub fn pool_count(&self) -> usize {
        self.shared.pools.lock().len()
    }

    /// 所有池的快照，按建池顺序。
    pub fn dump(&self, flags: DumpFlags) -> Vec<PoolReport> {
        let pools: Vec<Arc<PoolShared>> = self.shared.pools.lock().clone();
        pools.iter().map(|pool| pool.dump(flags)).collect()
    }
}

fn detach_everywhere(pools: &[Arc<PoolShared>], buffer: &Buffer) -> usize {
    let stripped: usize = pools.iter().map(|pool| pool.detach_buffer(buffer)).sum();
    for _ in 0..stripped {
        if let Err(err) = buffer.decrement_reference_count(OwnerId::ATTACHED_TO_OTHER_BUFFER) {
            error!(%err, "failed to release a force-detached buffer");
            break;
        }
    }
    if stripped > 0 {
        debug!(index = buffer.index(), stripped, "buffer force-detached");
    }
    stripped
}
