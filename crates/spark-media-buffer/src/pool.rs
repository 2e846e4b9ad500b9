use core::fmt;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use spark_media_alloc::{
    AddressKind, AddressViews, MemoryAccess, MemoryRegion, PartitionAllocator, SimpleAllocator,
    SubAllocation,
};
use tracing::{debug, error, trace, warn};

use crate::{
    arena::{ArenaShortfall, RegionArena},
    block::{Backing, Block, MetaDataMemory, allocate_metadata},
    buffer::{Buffer, BufferSlot, MetaDataEntry},
    config::{ManagerConfig, WaitPolicy},
    error::{BufferError, MemoryPurpose, ShortfallCause},
    observability::{BufferReport, DumpFlags, PoolReport, emit_pool_report},
    registry::TypeCatalog,
    types::{AllocationSource, OwnerId, TypeCategory, TypeDescriptor, TypeTag},
};

/// 建池参数。
///
/// # 契约说明（What）
/// - [`PoolSpec::fixed`] 建立固定数量的池，缓冲槽位在建池时创建并反复复用；
///   [`PoolSpec::dynamic`] 建立按需扩张的池，回收的缓冲直接销毁；
/// - `region` 仅用于 `SuppliedBlock`，`individual_blocks` 仅用于 `IndividualSuppliedBlocks`（每个缓冲一组地址），
///   `partition` 仅用于 `NamedDeviceMemory`；其余组合在建池时被拒绝。
#[derive(Debug, Default)]
pub struct PoolSpec {
    buffer_count: Option<u32>,
    buffer_size: Option<usize>,
    region: Option<MemoryRegion>,
    blocks: Vec<AddressViews>,
    partition: Option<String>,
    allow_cross_64mb_boundary: bool,
    memory_access: MemoryAccess,
}

impl PoolSpec {
    /// 固定 `count` 个缓冲的池。
    pub fn fixed(count: u32) -> Self {
        Self {
            buffer_count: Some(count),
            ..Self::default()
        }
    }

    /// 缓冲数量不限的池。
    pub fn dynamic() -> Self {
        Self::default()
    }

    /// 建池时分配内存所用的单个缓冲尺寸。
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// 交给池子分配或切片的整块区域。
    ///
    /// # 参数与契约
    /// - 仅 `SuppliedBlock` 类型接受；区域在池销毁前由池独占；
    /// - 建池时分配的池按缓冲数量均分区域，除非另行指定 `buffer_size`。
    pub fn region(mut self, region: MemoryRegion) -> Self {
        self.region = Some(region);
        self
    }

    /// 每个缓冲一组调用方地址，按序号依次绑定。
    ///
    /// # 参数与契约
    /// - 仅 `IndividualSuppliedBlocks` 类型接受，`blocks.len()` 必须等于缓冲数量；
    /// - 地址由调用方持有，池不会释放它们。
    pub fn individual_blocks(mut self, blocks: Vec<AddressViews>) -> Self {
        self.blocks = blocks;
        self
    }

    /// `NamedDeviceMemory` 类型打开内存时使用的分区名，不得为空。
    pub fn partition(mut self, name: impl Into<String>) -> Self {
        self.partition = Some(name.into());
        self
    }

    /// 是否允许子分配跨越 64 MiB 边界（默认不允许）。
    pub fn allow_cross_64mb_boundary(mut self, allow: bool) -> Self {
        self.allow_cross_64mb_boundary = allow;
        self
    }

    /// 设备分区的初始访问方式，可在建池后由 [`BufferPool::set_memory_access`] 修改。
    pub fn memory_access(mut self, access: MemoryAccess) -> Self {
        self.memory_access = access;
        self
    }
}

/// 一次 `get_buffer` 请求。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BufferRequest {
    pub owner: OwnerId,
    pub size: Option<usize>,
    pub non_blocking: bool,
    /// `size` 只是下限，取当前最大的空闲块（仅子分配池）。
    pub lower_bound: bool,
    pub timeout: Option<Duration>,
}

impl BufferRequest {
    /// 以 `owner` 身份发起的阻塞请求，尺寸取描述符的固定尺寸。
    pub fn new(owner: OwnerId) -> Self {
        Self {
            owner,
            size: None,
            non_blocking: false,
            lower_bound: false,
            timeout: None,
        }
    }

    /// 请求的数据尺寸。
    ///
    /// # 参数与契约
    /// - 描述符有固定尺寸时必须与之相等，否则返回 `FixedSizeMismatch`；
    /// - 尺寸先按对齐、再按分配单元向上取整，取整溢出返回 `SizeOutOfRange`；
    /// - 主机堆或分区无法提供时返回 `InsufficientMemory`，不会 panic。
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// 为 `true` 时没有空闲缓冲或空间立即失败，不进入等待。
    pub fn non_blocking(mut self, non_blocking: bool) -> Self {
        self.non_blocking = non_blocking;
        self
    }

    /// 把 `size` 视为下限，取当前最大的空闲块；尺寸为 0 时至少请求一个分配单元。
    ///
    /// 仅子分配池接受，其余池返回 `ParametersIncompatibleWithAllocationSource`。
    pub fn lower_bound(mut self, lower_bound: bool) -> Self {
        self.lower_bound = lower_bound;
        self
    }

    /// 阻塞等待的上限，到期返回 `NoFreeBufferAvailable(TimedOut)`；未设置时一直等待。
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 池用量快照。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PoolUsage {
    pub buffers_in_pool: usize,
    pub referenced_buffers: usize,
    /// 池持有的区域总量，只有区域类来源可报告。
    pub memory_in_pool: Option<usize>,
    pub memory_allocated: usize,
    pub memory_in_use: usize,
    /// 最大的可分配块，只有区域类来源可报告。
    pub largest_free_block: Option<usize>,
    pub failed_acquisitions: u64,
}

#[derive(Default)]
pub(crate) struct PoolMetrics {
    memory_allocated: AtomicUsize,
    memory_in_use: AtomicUsize,
    failed_acquisitions: AtomicU64,
}

impl PoolMetrics {
    pub(crate) fn add_allocated(&self, bytes: usize) {
        self.memory_allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn sub_allocated(&self, bytes: usize) {
        saturating_sub(&self.memory_allocated, bytes);
    }

    pub(crate) fn adjust_in_use(&self, old: usize, new: usize) {
        if new >= old {
            self.memory_in_use.fetch_add(new - old, Ordering::Relaxed);
        } else {
            saturating_sub(&self.memory_in_use, old - new);
        }
    }

    fn record_failure(&self) {
        self.failed_acquisitions.fetch_add(1, Ordering::Relaxed);
    }
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}

/// 缓冲数据内存的获取策略，由描述符与建池参数在建池时一次确定。
pub(crate) enum AllocationStrategy {
    /// 调用方通过 `register_data_reference` 提供数据。
    NoAllocation,
    /// 建池时已为每个槽位绑定内存。
    Preallocated,
    OsMemory,
    NamedDevice { partition: String },
    SuppliedBlock { arena: Arc<RegionArena> },
}

impl AllocationStrategy {
    /// 每次获取都分配、每次回收都归还的策略。
    fn per_acquisition(&self) -> bool {
        matches!(
            self,
            AllocationStrategy::OsMemory
                | AllocationStrategy::NamedDevice { .. }
                | AllocationStrategy::SuppliedBlock { .. }
        )
    }

    /// 回收时需要从槽位取走的数据块。
    fn releases_data(&self) -> bool {
        self.per_acquisition() || matches!(self, AllocationStrategy::NoAllocation)
    }
}

/// 池级元数据：一整块内存，按缓冲序号切片挂到每个槽位。
struct PoolMetaData {
    tag: TypeTag,
    block: Block,
}

pub(crate) struct PoolState {
    buffers: BTreeMap<u32, Arc<BufferSlot>>,
    free: VecDeque<u32>,
    referenced: usize,
    /// 已从空闲队列取出、正在池锁外分配内存、尚未发布的槽位数。
    reserved: usize,
    next_index: u32,
    metadata: Vec<PoolMetaData>,
    /// 建池时分配的整块数据内存，槽位持有其切片。
    creation_block: Option<Block>,
    closing: bool,
}

/// 池与其缓冲共享的状态。
///
/// # 设计初衷（Why）
/// - 缓冲句柄需要回到所属池完成回收，池句柄与缓冲句柄都持有 `Arc<PoolShared>`；
/// - 固定数量的池把槽位放在 FIFO 空闲队列中复用，阻塞获取在池条件变量上分段等待，
///   每段结束时检查中止代数、销毁标记与截止时间。
///
/// # 核心机制（How）
/// - 锁顺序：注册表 → 池（`state`）→ 缓冲（槽位）→ 区域；缓冲锁内不获取池锁；
/// - 数据内存在池锁外分配与释放：`get_buffer` 先占槽位（计入 `reserved`），解锁后分配，
///   再加锁发布；发布时若池已进入销毁，槽位与内存原路归还并返回 `PoolDestroyed`；
///   回收时先在缓冲锁内取走附着边与内存，解锁后递减与丢弃，最后加锁归还槽位；
/// - `abort_epoch` 单调递增，获取方在入口记录代数，代数变化即视为被中止。
pub(crate) struct PoolShared {
    pub(crate) tag: TypeTag,
    pub(crate) descriptor: Arc<TypeDescriptor>,
    pub(crate) catalog: Arc<TypeCatalog>,
    pub(crate) partitions: Arc<dyn PartitionAllocator>,
    pub(crate) metrics: PoolMetrics,
    max_owners: usize,
    max_attachments: usize,
    wait: WaitPolicy,
    fixed_count: Option<u32>,
    /// 建池时分配的单个缓冲尺寸。
    item_size: usize,
    memory_in_pool: Option<usize>,
    strategy: AllocationStrategy,
    access: Mutex<MemoryAccess>,
    abort_epoch: AtomicU64,
    state: Mutex<PoolState>,
    released: Condvar,
}

/// 建池所需的注册表上下文。
pub(crate) struct PoolContext<'a> {
    pub(crate) tag: TypeTag,
    pub(crate) descriptor: Arc<TypeDescriptor>,
    pub(crate) catalog: Arc<TypeCatalog>,
    pub(crate) partitions: Arc<dyn PartitionAllocator>,
    pub(crate) config: &'a ManagerConfig,
}

impl PoolShared {
    pub(crate) fn type_name(&self) -> &str {
        self.descriptor.name()
    }

    pub(crate) fn memory_access(&self) -> MemoryAccess {
        *self.access.lock()
    }

    fn incompatible(&self, reason: &'static str) -> BufferError {
        BufferError::incompatible(self.type_name(), self.descriptor.source(), reason)
    }

    fn invalid(descriptor: &TypeDescriptor, reason: &'static str) -> BufferError {
        BufferError::InvalidPoolConfiguration {
            type_name: descriptor.name().to_owned(),
            reason,
        }
    }

    /// 校验建池参数，准备内存并创建槽位。
    pub(crate) fn create(context: PoolContext<'_>, spec: PoolSpec) -> Result<Self, BufferError> {
        let PoolContext {
            tag,
            descriptor,
            catalog,
            partitions,
            config,
        } = context;
        let PoolSpec {
            buffer_count,
            buffer_size,
            region,
            blocks,
            partition,
            allow_cross_64mb_boundary,
            memory_access,
        } = spec;
        let name = descriptor.name();
        let source = descriptor.source();
        let incompatible = |reason| BufferError::incompatible(name, source, reason);

        if buffer_count == Some(0) {
            return Err(Self::invalid(&descriptor, "fixed pools need at least one buffer"));
        }
        if descriptor.allocates_on_pool_creation() && buffer_count.is_none() {
            return Err(Self::invalid(
                &descriptor,
                "allocating on pool creation needs a fixed buffer count",
            ));
        }
        match source {
            AllocationSource::NoAllocation | AllocationSource::OsMemory => {
                if region.is_some() || !blocks.is_empty() {
                    return Err(incompatible("supplied memory is not used by this source"));
                }
            }
            AllocationSource::NamedDeviceMemory => {
                if partition.as_deref().is_none_or(str::is_empty) {
                    return Err(incompatible("no partition name specified"));
                }
                if region.is_some() || !blocks.is_empty() {
                    return Err(incompatible("supplied memory is not used by this source"));
                }
            }
            AllocationSource::SuppliedBlock => {
                if region.is_none() {
                    return Err(incompatible("no memory region supplied"));
                }
                if !blocks.is_empty() {
                    return Err(incompatible("individual blocks are not used by this source"));
                }
            }
            AllocationSource::IndividualSuppliedBlocks => {
                if buffer_count.is_some_and(|count| blocks.len() != count as usize) {
                    return Err(incompatible("one block per buffer must be supplied"));
                }
            }
        }

        let metrics = PoolMetrics::default();
        let wait = config.wait_policy();
        let mut item_size = 0;
        let mut memory_in_pool = None;
        let mut creation_block = None;
        let strategy = if descriptor.allocates_on_pool_creation() {
            let count = buffer_count.unwrap_or(1) as usize;
            let item = match (source, &region) {
                (AllocationSource::SuppliedBlock, Some(region)) if buffer_size.is_none() => {
                    descriptor.align(descriptor.fixed_size().unwrap_or(region.size() / count))?
                }
                _ => descriptor.resolve_size(buffer_size)?,
            };
            if item == 0 {
                return Err(BufferError::SizeNotSpecified {
                    type_name: name.to_owned(),
                });
            }
            let total = item.checked_mul(count).ok_or(BufferError::SizeOutOfRange {
                requested: item,
                limit: usize::MAX / count,
            })?;
            let block = match source {
                AllocationSource::OsMemory => Block::heap(total, MemoryPurpose::Buffer)?,
                AllocationSource::NamedDeviceMemory => Block::partition(
                    &partitions,
                    partition.as_deref().unwrap_or_default(),
                    total,
                    memory_access,
                    MemoryPurpose::Buffer,
                )?,
                AllocationSource::SuppliedBlock => {
                    let Some(region) = region else {
                        return Err(incompatible("no memory region supplied"));
                    };
                    if region.size() < total {
                        return Err(incompatible("supplied region is smaller than the pool"));
                    }
                    memory_in_pool = Some(region.size());
                    Block {
                        size: region.size(),
                        views: region.views(),
                        attached_to_pool: true,
                        backing: Backing::Region(region),
                    }
                }
                AllocationSource::IndividualSuppliedBlocks => {
                    memory_in_pool = Some(total);
                    Block::unowned(total, AddressViews::EMPTY, true)
                }
                AllocationSource::NoAllocation => {
                    return Err(incompatible("no memory to allocate on pool creation"));
                }
            };
            metrics.add_allocated(total);
            item_size = item;
            creation_block = Some(block);
            AllocationStrategy::Preallocated
        } else {
            match source {
                AllocationSource::NoAllocation => AllocationStrategy::NoAllocation,
                AllocationSource::OsMemory => AllocationStrategy::OsMemory,
                AllocationSource::NamedDeviceMemory => AllocationStrategy::NamedDevice {
                    partition: partition.unwrap_or_default(),
                },
                AllocationSource::SuppliedBlock => {
                    let Some(region) = region else {
                        return Err(incompatible("no memory region supplied"));
                    };
                    let views = region.views();
                    let base = views
                        .get(AddressKind::Physical)
                        .or_else(|| views.get(AddressKind::Cached))
                        .unwrap_or(0);
                    memory_in_pool = Some(region.size());
                    let allocator = SimpleAllocator::new(region.size(), base, allow_cross_64mb_boundary);
                    AllocationStrategy::SuppliedBlock {
                        arena: Arc::new(RegionArena::new(region, Box::new(allocator), wait)),
                    }
                }
                AllocationSource::IndividualSuppliedBlocks => {
                    return Err(incompatible("individual blocks must be bound on pool creation"));
                }
            }
        };

        let mut buffers = BTreeMap::new();
        let mut free = VecDeque::new();
        if let Some(count) = buffer_count {
            for index in 0..count {
                let data = match &creation_block {
                    Some(_) if source == AllocationSource::IndividualSuppliedBlocks => {
                        Block::unowned(item_size, blocks[index as usize], true)
                    }
                    Some(block) => block.slice(index as usize, item_size),
                    None => Block::empty(),
                };
                let slot = BufferSlot::new(
                    index,
                    config.max_owner_identifiers,
                    config.max_attached_buffers,
                    data,
                );
                buffers.insert(index, Arc::new(slot));
                free.push_back(index);
            }
        }

        debug!(
            type_name = name,
            %tag,
            count = ?buffer_count,
            item_size,
            memory_in_pool = ?memory_in_pool,
            "buffer pool created"
        );
        Ok(Self {
            tag,
            descriptor: Arc::clone(&descriptor),
            catalog,
            partitions,
            metrics,
            max_owners: config.max_owner_identifiers,
            max_attachments: config.max_attached_buffers,
            wait,
            fixed_count: buffer_count,
            item_size,
            memory_in_pool,
            strategy,
            access: Mutex::new(memory_access),
            abort_epoch: AtomicU64::new(0),
            state: Mutex::new(PoolState {
                buffers,
                free,
                referenced: 0,
                reserved: 0,
                next_index: buffer_count.unwrap_or(0),
                metadata: Vec::new(),
                creation_block,
                closing: false,
            }),
            released: Condvar::new(),
        })
    }

    /// 校验请求并解析出本次要分配的数据尺寸。
    fn resolve_request(&self, request: &BufferRequest) -> Result<usize, BufferError> {
        let is_sub_allocated = matches!(self.strategy, AllocationStrategy::SuppliedBlock { .. });
        if request.lower_bound && !is_sub_allocated {
            return Err(self.incompatible("lower-bound sizing needs a sub-allocated pool"));
        }
        if !self.strategy.per_acquisition() {
            return Ok(0);
        }
        self.descriptor.resolve_size(request.size)
    }

    pub(crate) fn get_buffer(self: &Arc<Self>, request: &BufferRequest) -> Result<Buffer, BufferError> {
        let size = match self.resolve_request(request) {
            Ok(size) => size,
            Err(err) => {
                error!(type_name = self.type_name(), %err, "invalid buffer request");
                return Err(err);
            }
        };
        let deadline = request.timeout.map(|timeout| Instant::now() + timeout);
        self.acquire(
            request.owner,
            size,
            request.lower_bound,
            request.non_blocking,
            deadline,
        )
    }

    /// 获取一个不带数据的缓冲，用于拆分。
    pub(crate) fn acquire_empty(self: &Arc<Self>, owner: OwnerId, non_blocking: bool) -> Result<Buffer, BufferError> {
        self.acquire(owner, 0, false, non_blocking, None)
    }

    fn acquire(
        self: &Arc<Self>,
        owner: OwnerId,
        size: usize,
        lower_bound: bool,
        non_blocking: bool,
        deadline: Option<Instant>,
    ) -> Result<Buffer, BufferError> {
        let entry_epoch = self.abort_epoch.load(Ordering::SeqCst);
        let slot = {
            let mut state = self.state.lock();
            if state.closing {
                return Err(BufferError::PoolDestroyed {
                    type_name: self.type_name().to_owned(),
                });
            }
            let slot = match self.fixed_count {
                Some(_) => self.wait_for_free_slot(&mut state, entry_epoch, non_blocking, deadline)?,
                None => {
                    let index = state.next_index;
                    state.next_index = state.next_index.wrapping_add(1);
                    let slot = Arc::new(BufferSlot::new(
                        index,
                        self.max_owners,
                        self.max_attachments,
                        Block::empty(),
                    ));
                    state.buffers.insert(index, Arc::clone(&slot));
                    slot
                }
            };
            state.reserved += 1;
            slot
        };

        let data = match self.allocate_data(size, lower_bound, non_blocking, deadline, entry_epoch) {
            Ok(data) => data,
            Err(err) => {
                self.metrics.record_failure();
                self.return_unused_slot(&slot);
                match &err {
                    BufferError::NoFreeBufferAvailable { cause, .. } => {
                        debug!(type_name = self.type_name(), %cause, "buffer memory not available")
                    }
                    _ => warn!(type_name = self.type_name(), size, %err, "buffer memory allocation failed"),
                }
                return Err(err);
            }
        };

        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(1);
        if state.closing {
            self.give_back_slot(&mut state, &slot);
            drop(state);
            drop(data);
            self.metrics.record_failure();
            debug!(
                type_name = self.type_name(),
                index = slot.index,
                "pool closed while buffer memory was being allocated"
            );
            return Err(BufferError::PoolDestroyed {
                type_name: self.type_name().to_owned(),
            });
        }
        if let Some(block) = &data {
            if self.strategy.per_acquisition() {
                self.metrics.add_allocated(block.size);
            }
        }
        let generation = {
            let mut slot_state = slot.state.lock();
            slot_state.activate(owner, data);
            slot_state.generation
        };
        state.referenced += 1;
        drop(state);
        trace!(
            type_name = self.type_name(),
            index = slot.index,
            owner = owner.0,
            "buffer acquired"
        );
        Ok(Buffer::new(Arc::clone(self), slot, generation))
    }

    fn wait_for_free_slot(
        &self,
        state: &mut MutexGuard<'_, PoolState>,
        entry_epoch: u64,
        non_blocking: bool,
        deadline: Option<Instant>,
    ) -> Result<Arc<BufferSlot>, BufferError> {
        let started = Instant::now();
        let mut next_warning = started + self.wait.long_wait_warning;
        loop {
            if let Some(index) = state.free.pop_front() {
                match state.buffers.get(&index) {
                    Some(slot) => return Ok(Arc::clone(slot)),
                    None => {
                        error!(type_name = self.type_name(), index, "free list names an unknown buffer");
                        continue;
                    }
                }
            }
            let now = Instant::now();
            let cause = if non_blocking {
                Some(ShortfallCause::NonBlocking)
            } else if state.closing || self.abort_epoch.load(Ordering::SeqCst) != entry_epoch {
                Some(ShortfallCause::Aborted)
            } else if deadline.is_some_and(|deadline| now >= deadline) {
                Some(ShortfallCause::TimedOut)
            } else {
                None
            };
            if let Some(cause) = cause {
                self.metrics.record_failure();
                match cause {
                    ShortfallCause::NonBlocking => {
                        debug!(type_name = self.type_name(), "no free buffer for non-blocking request")
                    }
                    _ => warn!(type_name = self.type_name(), %cause, "no free buffer available"),
                }
                return Err(BufferError::NoFreeBufferAvailable {
                    type_name: self.type_name().to_owned(),
                    cause,
                });
            }
            if now >= next_warning {
                warn!(
                    type_name = self.type_name(),
                    waited_ms = now.duration_since(started).as_millis() as u64,
                    "still waiting for a free buffer"
                );
                emit_pool_report(&self.report_locked(&**state, DumpFlags::ALL));
                next_warning = now + self.wait.long_wait_warning;
            }
            let wake = deadline.map_or(now + self.wait.slice, |deadline| {
                deadline.min(now + self.wait.slice)
            });
            self.released.wait_until(state, wake);
        }
    }

    /// 在池锁外分配本次获取的数据块；`None` 表示沿用槽位已有的数据块。
    fn allocate_data(
        &self,
        size: usize,
        lower_bound: bool,
        non_blocking: bool,
        deadline: Option<Instant>,
        entry_epoch: u64,
    ) -> Result<Option<Block>, BufferError> {
        if size == 0 && !lower_bound && self.strategy.per_acquisition() {
            return Ok(Some(Block::empty()));
        }
        match &self.strategy {
            AllocationStrategy::NoAllocation | AllocationStrategy::Preallocated => Ok(None),
            AllocationStrategy::OsMemory => Block::heap(size, MemoryPurpose::Buffer).map(Some),
            AllocationStrategy::NamedDevice { partition } => Block::partition(
                &self.partitions,
                partition,
                size,
                self.memory_access(),
                MemoryPurpose::Buffer,
            )
            .map(Some),
            AllocationStrategy::SuppliedBlock { arena } => {
                let mut unit_size = self.descriptor.round_to_unit(size)?;
                if lower_bound {
                    // 下限为 0 表示“取最大空闲块”，至少请求一个分配单元。
                    unit_size = unit_size.max(self.descriptor.allocation_unit().max(1));
                }
                let request = SubAllocation {
                    size: unit_size,
                    alignment: self.descriptor.alignment(),
                    lower_bound,
                };
                let aborted = || self.abort_epoch.load(Ordering::SeqCst) != entry_epoch;
                match arena.allocate(request, non_blocking, deadline, &aborted) {
                    Ok(extent) => Ok(Some(Block::sub_allocated(Arc::clone(arena), extent))),
                    Err(ArenaShortfall::Exhausted(source)) => Err(BufferError::InsufficientMemory {
                        purpose: MemoryPurpose::Buffer,
                        source,
                    }),
                    Err(ArenaShortfall::Aborted) => Err(self.shortfall(ShortfallCause::Aborted)),
                    Err(ArenaShortfall::TimedOut) => Err(self.shortfall(ShortfallCause::TimedOut)),
                }
            }
        }
    }

    fn shortfall(&self, cause: ShortfallCause) -> BufferError {
        BufferError::NoFreeBufferAvailable {
            type_name: self.type_name().to_owned(),
            cause,
        }
    }

    /// 分配失败时把占用的槽位还回去。
    fn return_unused_slot(&self, slot: &Arc<BufferSlot>) {
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(1);
        self.give_back_slot(&mut state, slot);
    }

    /// 把未发布的槽位放回空闲队列（固定数量池）或移出池（动态池）。
    fn give_back_slot(&self, state: &mut PoolState, slot: &Arc<BufferSlot>) {
        match self.fixed_count {
            Some(_) => {
                state.free.push_front(slot.index);
                self.released.notify_all();
            }
            None => {
                state.buffers.remove(&slot.index);
            }
        }
    }

    /// 引用计数归零后的回收；调用方不得持有任何锁。
    pub(crate) fn release(&self, slot: &Arc<BufferSlot>) {
        let edges = slot.state.lock().take_attachments();
        for edge in edges {
            if let Err(err) = edge.decrement_reference_count(OwnerId::ATTACHED_TO_OTHER_BUFFER) {
                error!(type_name = self.type_name(), index = slot.index, %err, "failed to release attached buffer");
            }
        }

        let (metadata, data, used) = {
            let mut slot_state = slot.state.lock();
            let metadata = slot_state.take_instance_metadata();
            let data = self
                .strategy
                .releases_data()
                .then(|| core::mem::replace(&mut slot_state.data, Block::empty()));
            let used = core::mem::take(&mut slot_state.data_size);
            (metadata, data, used)
        };
        self.metrics.adjust_in_use(used, 0);
        if let Some(data) = &data {
            if self.strategy.per_acquisition() {
                self.metrics.sub_allocated(data.size);
            }
        }
        drop(metadata);
        drop(data);

        let mut state = self.state.lock();
        state.referenced = state.referenced.saturating_sub(1);
        match self.fixed_count {
            Some(_) => {
                state.free.push_back(slot.index);
                self.released.notify_all();
            }
            None => {
                if state.buffers.remove(&slot.index).is_none() {
                    error!(type_name = self.type_name(), index = slot.index, "released buffer not found in pool");
                }
            }
        }
        drop(state);
        trace!(type_name = self.type_name(), index = slot.index, "buffer released");
    }

    pub(crate) fn attach_metadata(
        &self,
        tag: TypeTag,
        size: Option<usize>,
        memory: MetaDataMemory,
    ) -> Result<(), BufferError> {
        let descriptor = self.catalog.descriptor(tag, TypeCategory::MetaData)?;
        let Some(count) = self.fixed_count else {
            error!(type_name = self.type_name(), %tag, "pool-wide meta data on a pool without a buffer count");
            return Err(BufferError::InvalidPoolConfiguration {
                type_name: self.type_name().to_owned(),
                reason: "pool-wide meta data needs a fixed buffer count",
            });
        };
        if descriptor.source() == AllocationSource::NoAllocation {
            return Err(BufferError::incompatible(
                descriptor.name(),
                descriptor.source(),
                "pool-wide meta data must be allocated by the pool",
            ));
        }
        let item = descriptor.resolve_size(size)?;
        let total = item
            .checked_mul(count as usize)
            .ok_or(BufferError::SizeOutOfRange {
                requested: item,
                limit: usize::MAX / count as usize,
            })?;
        if self.state.lock().metadata.iter().any(|entry| entry.tag == tag) {
            debug!(type_name = self.type_name(), %tag, "meta data already attached to pool");
            return Ok(());
        }

        let block = allocate_metadata(
            &descriptor,
            total,
            memory,
            &self.partitions,
            self.memory_access(),
        )?;
        let mut state = self.state.lock();
        if state.metadata.iter().any(|entry| entry.tag == tag) {
            drop(state);
            drop(block);
            return Ok(());
        }
        for slot in state.buffers.values() {
            slot.state.lock().metadata.push(MetaDataEntry {
                tag,
                block: block.slice(slot.index as usize, item),
            });
        }
        state.metadata.push(PoolMetaData { tag, block });
        drop(state);
        debug!(
            type_name = self.type_name(),
            meta_data = descriptor.name(),
            item,
            "meta data attached to pool"
        );
        Ok(())
    }

    pub(crate) fn detach_metadata(&self, tag: TypeTag) -> Result<(), BufferError> {
        let entry = {
            let mut state = self.state.lock();
            let Some(position) = state.metadata.iter().position(|entry| entry.tag == tag) else {
                drop(state);
                error!(type_name = self.type_name(), %tag, "meta data not attached to pool");
                return Err(BufferError::MetaDataTypeNotFound { tag });
            };
            let entry = state.metadata.remove(position);
            for slot in state.buffers.values() {
                let mut slot_state = slot.state.lock();
                if slot_state.reference_count != 0 {
                    warn!(
                        type_name = self.type_name(),
                        index = slot.index,
                        %tag,
                        "detaching pool meta data from a buffer in use"
                    );
                }
                match slot_state
                    .metadata
                    .iter()
                    .position(|m| m.tag == tag && m.block.attached_to_pool)
                {
                    Some(position) => {
                        slot_state.metadata.remove(position);
                    }
                    None => error!(
                        type_name = self.type_name(),
                        index = slot.index,
                        %tag,
                        "pool meta data missing from buffer"
                    ),
                }
            }
            entry
        };
        drop(entry);
        Ok(())
    }

    pub(crate) fn usage(&self) -> PoolUsage {
        let state = self.state.lock();
        self.usage_locked(&state)
    }

    fn usage_locked(&self, state: &PoolState) -> PoolUsage {
        let buffers_in_pool = self
            .fixed_count
            .map_or(state.buffers.len(), |count| count as usize);
        let largest_free_block = match (&self.strategy, self.descriptor.source()) {
            (AllocationStrategy::SuppliedBlock { arena }, _) => Some(arena.largest_free_block()),
            (_, AllocationSource::SuppliedBlock) => self.memory_in_pool,
            (_, AllocationSource::IndividualSuppliedBlocks) => Some(if buffers_in_pool != state.referenced {
                self.item_size
            } else {
                0
            }),
            _ => None,
        };
        PoolUsage {
            buffers_in_pool,
            referenced_buffers: state.referenced,
            memory_in_pool: self.memory_in_pool,
            memory_allocated: self.metrics.memory_allocated.load(Ordering::Relaxed),
            memory_in_use: self.metrics.memory_in_use.load(Ordering::Relaxed),
            largest_free_block,
            failed_acquisitions: self.metrics.failed_acquisitions.load(Ordering::Relaxed),
        }
    }

    /// 从本池所有缓冲上剥离指向 `target` 的附着边，返回剥离的边数；不改变 `target` 的引用计数。
    pub(crate) fn detach_buffer(&self, target: &Buffer) -> usize {
        let stripped: Vec<Buffer> = {
            let state = self.state.lock();
            state
                .buffers
                .values()
                .flat_map(|slot| {
                    let mut slot_state = slot.state.lock();
                    if slot_state.reference_count > 0 {
                        slot_state.strip_edges_to(target)
                    } else {
                        Vec::new()
                    }
                })
                .collect()
        };
        stripped.len()
    }

    pub(crate) fn abort_blocking_get_buffer(&self) {
        self.abort_epoch.fetch_add(1, Ordering::SeqCst);
        {
            let _state = self.state.lock();
            self.released.notify_all();
        }
        if let AllocationStrategy::SuppliedBlock { arena } = &self.strategy {
            arena.wake_waiters();
        }
        debug!(type_name = self.type_name(), "blocking get buffer aborted");
    }

    /// 为每个在用缓冲增加一个引用并返回句柄。
    pub(crate) fn get_all_used_buffers(self: &Arc<Self>, owner: OwnerId) -> Vec<Buffer> {
        let state = self.state.lock();
        state
            .buffers
            .values()
            .filter_map(|slot| {
                let mut slot_state = slot.state.lock();
                if slot_state.reference_count == 0 {
                    return None;
                }
                slot_state.reference_count += 1;
                if !slot_state.record_owner(owner) {
                    warn!(type_name = self.type_name(), index = slot.index, "owner slots full");
                }
                Some(Buffer::new(Arc::clone(self), Arc::clone(slot), slot_state.generation))
            })
            .collect()
    }

    pub(crate) fn set_memory_access(&self, access: MemoryAccess) {
        *self.access.lock() = access;
    }

    pub(crate) fn dump(&self, flags: DumpFlags) -> PoolReport {
        let report = {
            let state = self.state.lock();
            self.report_locked(&state, flags)
        };
        emit_pool_report(&report);
        report
    }

    fn report_locked(&self, state: &PoolState, flags: DumpFlags) -> PoolReport {
        let buffers = if flags.contains(DumpFlags::BUFFERS) {
            state
                .buffers
                .values()
                .map(|slot| BufferReport::capture(slot.index, &slot.state.lock()))
                .collect()
        } else {
            Vec::new()
        };
        PoolReport {
            type_name: self.type_name().to_owned(),
            tag: self.tag,
            usage: self.usage_locked(state),
            metadata: state.metadata.iter().map(|entry| entry.tag).collect(),
            buffers,
        }
    }

    /// 销毁第一阶段：拒绝新的获取，唤醒等待者，卸下池级元数据，返回仍被引用的缓冲。
    pub(crate) fn begin_teardown(self: &Arc<Self>) -> Vec<Buffer> {
        self.state.lock().closing = true;
        self.abort_blocking_get_buffer();
        let tags: Vec<TypeTag> = self.state.lock().metadata.iter().map(|entry| entry.tag).collect();
        for tag in tags {
            if let Err(err) = self.detach_metadata(tag) {
                error!(type_name = self.type_name(), %tag, %err, "failed to detach pool meta data");
            }
        }
        let state = self.state.lock();
        state
            .buffers
            .values()
            .filter_map(|slot| {
                let slot_state = slot.state.lock();
                (slot_state.reference_count > 0)
                    .then(|| Buffer::new(Arc::clone(self), Arc::clone(slot), slot_state.generation))
            })
            .collect()
    }

    /// 销毁第二阶段：仍有引用或正在分配的获取时保留池并报告，否则释放全部槽位与内存。
    pub(crate) fn finish_teardown(&self) -> Result<(), BufferError> {
        let (slots, creation_block) = {
            let mut state = self.state.lock();
            // 正在分配的获取同样持有槽位，计入引用。
            if state.referenced + state.reserved != 0 {
                let referenced = state.referenced + state.reserved;
                let in_flight = state.reserved;
                emit_pool_report(&self.report_locked(&state, DumpFlags::ALL));
                drop(state);
                error!(
                    type_name = self.type_name(),
                    referenced,
                    in_flight,
                    "pool destroyed while buffers are still referenced"
                );
                return Err(BufferError::PoolStillReferenced {
                    type_name: self.type_name().to_owned(),
                    referenced,
                });
            }
            state.free.clear();
            (
                core::mem::take(&mut state.buffers),
                state.creation_block.take(),
            )
        };
        drop(slots);
        drop(creation_block);
        debug!(type_name = self.type_name(), "buffer pool destroyed");
        Ok(())
    }
}

/// `BufferPool` 是某一缓冲数据类型的池句柄。
///
/// # 设计初衷（Why）
/// - 流水线阶段持有池句柄按需获取缓冲；池可以预先分配全部内存（固定数量、建池时分配），
///   也可以每次获取时从主机堆、设备分区或调用方区域中分配；
/// - 固定数量的池在缓冲耗尽时阻塞等待，是流水线的背压来源。
///
/// # 契约说明（What）
/// - 句柄可克隆、跨线程共享；池由 [`crate::BufferManager::destroy_pool`] 销毁，销毁后获取返回
///   [`BufferError::PoolDestroyed`]；
/// - 池级元数据只能挂在固定数量的池上，每个缓冲看到整块中属于自己的切片。
#[derive(Clone)]
pub struct BufferPool {
    pub(crate) shared: Arc<PoolShared>,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("type_name", &self.shared.type_name())
            .field("tag", &self.shared.tag)
            .field("fixed_count", &self.shared.fixed_count)
            .finish()
    }
}

impl PartialEq for BufferPool {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for BufferPool {}

impl BufferPool {
    pub(crate) fn from_shared(shared: Arc<PoolShared>) -> Self {
        Self { shared }
    }

    /// 池中缓冲的数据类型。
    pub fn type_tag(&self) -> TypeTag {
        self.shared.tag
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.shared.descriptor
    }

    /// 获取一个缓冲，引用计数为 1，持有者为 `request.owner`。
    ///
    /// # 契约说明（What）
    /// - 固定数量的池没有空闲缓冲时：`non_blocking` 立即返回 `NoFreeBufferAvailable(NonBlocking)`，
    ///   否则等待释放，直到超时（`TimedOut`）或被 [`BufferPool::abort_blocking_get_buffer`] 中止（`Aborted`）；
    /// - 子分配池在区域空间不足时同样等待；非阻塞请求得到 `InsufficientMemory`；
    /// - 等待的线程按 FIFO 顺序取得被释放的槽位并不保证，任何一个等待者都可能先得到它。
    pub fn get_buffer(&self, request: BufferRequest) -> Result<Buffer, BufferError> {
        self.shared.get_buffer(&request)
    }

    /// 为池中每个缓冲挂接一段元数据，整块内存一次分配。
    pub fn attach_metadata(
        &self,
        tag: TypeTag,
        size: Option<usize>,
        memory: MetaDataMemory,
    ) -> Result<(), BufferError> {
        self.shared.attach_metadata(tag, size, memory)
    }

    /// 卸下池级元数据并释放整块内存。
    ///
    /// # 参数与契约
    /// - 未挂接该类型时返回 `MetaDataTypeNotFound`；
    /// - 仍被引用的缓冲同样失去该元数据，每个这样的缓冲记录一条告警。
    pub fn detach_metadata(&self, tag: TypeTag) -> Result<(), BufferError> {
        self.shared.detach_metadata(tag)
    }

    /// 当前用量快照。
    ///
    /// 各字段分别读取，并发获取与释放期间彼此之间可能相差一次操作。
    pub fn usage(&self) -> PoolUsage {
        self.shared.usage()
    }

    /// 从本池所有缓冲上剥离指向 `target` 的附着边，返回剥离数量。
    ///
    /// 剥离不释放 `target` 的引用，调用方需按返回值逐个递减（见 [`crate::BufferManager::force_detach_buffer`]）。
    pub fn detach_buffer(&self, target: &Buffer) -> usize {
        self.shared.detach_buffer(target)
    }

    /// 唤醒并终止所有正在阻塞的获取，之后发起的获取不受影响。
    pub fn abort_blocking_get_buffer(&self) {
        self.shared.abort_blocking_get_buffer();
    }

    /// 以 `owner` 身份为每个在用缓冲增加一个引用并返回句柄。
    pub fn get_all_used_buffers(&self, owner: OwnerId) -> Vec<Buffer> {
        self.shared.get_all_used_buffers(owner)
    }

    /// 之后打开的设备分区使用的访问方式。
    pub fn set_memory_access(&self, access: MemoryAccess) {
        self.shared.set_memory_access(access);
    }

    /// 生成池快照并同时写入日志；`flags` 控制是否包含每个缓冲。
    pub fn dump(&self, flags: DumpFlags) -> PoolReport {
        self.shared.dump(flags)
    }
}
