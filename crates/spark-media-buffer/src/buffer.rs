use core::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use spark_media_alloc::{AddressKind, AddressViews, ExtendDirection};
use tracing::{debug, error, trace, warn};

use crate::{
    block::{Backing, Block, MetaDataMemory, allocate_metadata},
    error::{BufferError, MemoryPurpose},
    observability::BufferReport,
    pool::{BufferPool, PoolShared},
    types::{AllocationSource, OwnerId, TypeCategory, TypeTag},
};

/// 一个元数据块及其类型。
pub(crate) struct MetaDataEntry {
    pub(crate) tag: TypeTag,
    pub(crate) block: Block,
}

/// 缓冲槽位的可变状态，由缓冲锁保护。
pub(crate) struct SlotState {
    /// 每次回收递增，旧句柄据此失效。
    pub(crate) generation: u64,
    pub(crate) reference_count: u32,
    pub(crate) owners: Vec<OwnerId>,
    pub(crate) attachments: Vec<Option<Buffer>>,
    pub(crate) data: Block,
    pub(crate) data_size: usize,
    pub(crate) metadata: Vec<MetaDataEntry>,
}

impl SlotState {
    /// 获取成功后的初始化：引用计数 1，主持有者占据首个槽位，附着边清空。
    pub(crate) fn activate(&mut self, owner: OwnerId, data: Option<Block>) {
        if let Some(data) = data {
            self.data = data;
        }
        self.data_size = 0;
        self.reference_count = 1;
        self.owners.fill(OwnerId::UNSPECIFIED);
        if let Some(first) = self.owners.first_mut() {
            *first = owner;
        }
        self.attachments.fill(None);
    }

    /// 记录新持有者；槽位已满返回 `false`。
    pub(crate) fn record_owner(&mut self, owner: OwnerId) -> bool {
        if owner.is_unspecified() {
            return true;
        }
        match self.owners.iter_mut().find(|slot| slot.is_unspecified()) {
            Some(slot) => {
                *slot = owner;
                true
            }
            None => false,
        }
    }

    fn forget_owner(&mut self, owner: OwnerId) {
        if owner.is_unspecified() {
            return;
        }
        if let Some(slot) = self.owners.iter_mut().find(|slot| **slot == owner) {
            *slot = OwnerId::UNSPECIFIED;
        }
    }

    pub(crate) fn take_attachments(&mut self) -> Vec<Buffer> {
        self.attachments.iter_mut().filter_map(Option::take).collect()
    }

    /// 取走所有附着到 `target` 的边，不改变 `target` 的引用计数。
    pub(crate) fn strip_edges_to(&mut self, target: &Buffer) -> Vec<Buffer> {
        self.attachments
            .iter_mut()
            .filter(|edge| edge.as_ref() == Some(target))
            .filter_map(Option::take)
            .collect()
    }

    /// 取走缓冲私有的元数据，池级元数据视图保留。
    pub(crate) fn take_instance_metadata(&mut self) -> Vec<MetaDataEntry> {
        let (pool_owned, instance): (Vec<_>, Vec<_>) = self
            .metadata
            .drain(..)
            .partition(|entry| entry.block.attached_to_pool);
        self.metadata = pool_owned;
        instance
    }

    fn instance_metadata(&self, tag: TypeTag) -> Option<usize> {
        self.metadata
            .iter()
            .position(|entry| entry.tag == tag && !entry.block.attached_to_pool)
    }
}

/// 池中的一个缓冲槽位；槽位在固定数量的池中被反复复用。
pub(crate) struct BufferSlot {
    pub(crate) index: u32,
    pub(crate) state: Mutex<SlotState>,
}

impl BufferSlot {
    pub(crate) fn new(index: u32, max_owners: usize, max_attachments: usize, data: Block) -> Self {
        Self {
            index,
            state: Mutex::new(SlotState {
                generation: 0,
                reference_count: 0,
                owners: vec![OwnerId::UNSPECIFIED; max_owners],
                attachments: vec![None; max_attachments],
                data,
                data_size: 0,
                metadata: Vec::new(),
            }),
        }
    }
}

/// `ObtainDataReference` 的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DataReference {
    /// 数据块容量。
    pub size: usize,
    /// 已使用的字节数。
    pub used_size: usize,
    /// 请求视图下的起始地址。
    pub address: usize,
}

/// 元数据块的位置。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MetaDataReference {
    /// CPU 经缓存访问的地址。
    pub address: usize,
    pub size: usize,
}

/// `Buffer` 是池中一个缓冲的句柄：槽位加代数（generation）。
///
/// # 设计初衷（Why）
/// - 媒体流水线以显式引用计数在阶段间传递缓冲，计数归零时池回收槽位；
///   句柄本身不持有引用，克隆句柄不会改变计数，`increment/decrement_reference_count` 才会；
/// - 槽位回收时代数递增，任何旧句柄上的操作（包括第二次递减）都会被识别为 `NotReferenced`，
///   不会作用到槽位的下一任持有者身上。
///
/// # 核心机制（How）
/// - 每个缓冲一把锁（`SlotState`），保护持有者、附着边、数据块与元数据；
/// - 锁顺序为“池 → 缓冲 → 区域”；缓冲锁内从不获取池锁，附着边总是先取出再在锁外递减。
///
/// # 契约说明（What）
/// - 除查询 `index`/`type_tag` 与 `dump` 外，所有操作要求缓冲仍被引用；
/// - 句柄可跨线程传递（`Send + Sync`）。
#[derive(Clone)]
pub struct Buffer {
    pub(crate) pool: Arc<PoolShared>,
    pub(crate) slot: Arc<BufferSlot>,
    pub(crate) generation: u64,
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot) && self.generation == other.generation
    }
}

impl Eq for Buffer {}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("type_name", &self.pool.type_name())
            .field("index", &self.slot.index)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Buffer {
    pub(crate) fn new(pool: Arc<PoolShared>, slot: Arc<BufferSlot>, generation: u64) -> Self {
        Self {
            pool,
            slot,
            generation,
        }
    }

    fn type_name(&self) -> &str {
        self.pool.type_name()
    }

    fn not_referenced(&self) -> BufferError {
        BufferError::NotReferenced {
            type_name: self.type_name().to_owned(),
            index: self.slot.index,
        }
    }

    /// 锁住槽位并确认句柄仍有效。
    fn lock_live(&self) -> Result<MutexGuard<'_, SlotState>, BufferError> {
        let state = self.slot.state.lock();
        if state.generation != self.generation || state.reference_count == 0 {
            drop(state);
            error!(
                type_name = self.type_name(),
                index = self.slot.index,
                "operation on a buffer that is not referenced"
            );
            return Err(self.not_referenced());
        }
        Ok(state)
    }

    /// 缓冲在池中的稳定序号。
    pub fn index(&self) -> u32 {
        self.slot.index
    }

    /// 缓冲数据类型的标签。
    pub fn type_tag(&self) -> TypeTag {
        self.pool.tag
    }

    /// 所属池。
    pub fn pool(&self) -> BufferPool {
        BufferPool::from_shared(Arc::clone(&self.pool))
    }

    /// 当前引用计数。
    pub fn reference_count(&self) -> Result<u32, BufferError> {
        Ok(self.lock_live()?.reference_count)
    }

    /// 已记录的持有者标识（诊断用，可能少于引用计数）。
    pub fn owner_list(&self) -> Result<Vec<OwnerId>, BufferError> {
        let state = self.lock_live()?;
        Ok(state
            .owners
            .iter()
            .copied()
            .filter(|owner| !owner.is_unspecified())
            .collect())
    }

    /// 增加一个引用并记录持有者；持有者槽位已满时只告警。
    pub fn increment_reference_count(&self, owner: OwnerId) -> Result<(), BufferError> {
        let mut state = self.lock_live()?;
        state.reference_count += 1;
        if !state.record_owner(owner) {
            warn!(
                type_name = self.type_name(),
                index = self.slot.index,
                owner = owner.0,
                "more references than owner slots, new owner not recorded"
            );
        }
        trace!(
            type_name = self.type_name(),
            index = self.slot.index,
            owner = owner.0,
            references = state.reference_count,
            "reference added"
        );
        Ok(())
    }

    /// 释放一个引用；计数归零时由池回收缓冲。
    pub fn decrement_reference_count(&self, owner: OwnerId) -> Result<(), BufferError> {
        let released = {
            let mut state = self.lock_live()?;
            state.reference_count -= 1;
            state.forget_owner(owner);
            trace!(
                type_name = self.type_name(),
                index = self.slot.index,
                owner = owner.0,
                references = state.reference_count,
                "reference dropped"
            );
            if state.reference_count == 0 {
                state.generation += 1;
                true
            } else {
                false
            }
        };
        if released {
            self.pool.release(&self.slot);
        }
        Ok(())
    }

    /// 改写一个持有者槽位，引用计数不变。
    ///
    /// `new_owner` 为 [`OwnerId::UNSPECIFIED`] 时把 `old_owner` 写入首个槽位。
    pub fn transfer_ownership(&self, old_owner: OwnerId, new_owner: OwnerId) -> Result<(), BufferError> {
        let mut state = self.lock_live()?;
        if new_owner.is_unspecified() {
            if let Some(first) = state.owners.first_mut() {
                *first = old_owner;
            }
            return Ok(());
        }
        match state.owners.iter_mut().find(|slot| **slot == old_owner) {
            Some(slot) => *slot = new_owner,
            None => warn!(
                type_name = self.type_name(),
                index = self.slot.index,
                owner = old_owner.0,
                "current owner not found, ownership not transferred"
            ),
        }
        Ok(())
    }

    /// 附着另一个缓冲：目标引用计数加一，直到解除附着或本缓冲被回收。
    pub fn attach_buffer(&self, other: &Buffer) -> Result<(), BufferError> {
        other.increment_reference_count(OwnerId::ATTACHED_TO_OTHER_BUFFER)?;
        let outcome = match self.lock_live() {
            Ok(mut state) => {
                if state.attachments.iter().any(|edge| edge.as_ref() == Some(other)) {
                    debug!(
                        type_name = self.type_name(),
                        index = self.slot.index,
                        "buffer already attached, attaching again"
                    );
                }
                match state.attachments.iter_mut().find(|edge| edge.is_none()) {
                    Some(free) => {
                        *free = Some(other.clone());
                        Ok(())
                    }
                    None => Err(BufferError::TooManyAttachments {
                        type_name: self.type_name().to_owned(),
                        capacity: state.attachments.len(),
                    }),
                }
            }
            Err(err) => Err(err),
        };
        if let Err(err) = &outcome {
            error!(type_name = self.type_name(), index = self.slot.index, %err, "attach buffer failed");
            if let Err(undo) = other.decrement_reference_count(OwnerId::ATTACHED_TO_OTHER_BUFFER) {
                error!(%undo, "failed to undo the attachment reference");
            }
        }
        outcome
    }

    /// 解除附着边并释放目标的一个引用。
    pub fn detach_buffer(&self, other: &Buffer) -> Result<(), BufferError> {
        let edge = {
            let mut state = self.lock_live()?;
            state
                .attachments
                .iter_mut()
                .find(|edge| edge.as_ref() == Some(other))
                .and_then(Option::take)
        };
        match edge {
            Some(edge) => edge.decrement_reference_count(OwnerId::ATTACHED_TO_OTHER_BUFFER),
            None => {
                error!(type_name = self.type_name(), index = self.slot.index, "attached buffer not found");
                Err(BufferError::AttachedBufferNotFound {
                    type_name: self.type_name().to_owned(),
                })
            }
        }
    }

    /// 按类型查找附着的缓冲，不增加其引用计数。
    pub fn obtain_attached_buffer(&self, tag: TypeTag) -> Result<Option<Buffer>, BufferError> {
        let state = self.lock_live()?;
        Ok(state
            .attachments
            .iter()
            .flatten()
            .find(|edge| edge.type_tag() == tag)
            .cloned())
    }

    /// 为本缓冲挂接一个私有元数据块。
    ///
    /// 同类型已挂接且尺寸相同时直接成功，尺寸不同返回 [`BufferError::MetaDataSizeMismatch`]。
    pub fn attach_metadata(
        &self,
        tag: TypeTag,
        size: Option<usize>,
        memory: MetaDataMemory,
    ) -> Result<(), BufferError> {
        let descriptor = self.pool.catalog.descriptor(tag, TypeCategory::MetaData)?;
        let size = descriptor.resolve_size(size)?;
        {
            let state = self.lock_live()?;
            self.check_duplicate(&state, tag, size)?;
        }
        let block = allocate_metadata(
            &descriptor,
            size,
            memory,
            &self.pool.partitions,
            self.pool.memory_access(),
        )?;
        let mut state = self.lock_live()?;
        if state.instance_metadata(tag).is_some() {
            let outcome = self.check_duplicate(&state, tag, size);
            drop(state);
            drop(block);
            return outcome;
        }
        state.metadata.push(MetaDataEntry { tag, block });
        debug!(
            type_name = self.type_name(),
            index = self.slot.index,
            meta_data = descriptor.name(),
            size,
            "meta data attached to buffer"
        );
        Ok(())
    }

    /// 已挂接同类型元数据时返回最终结果；未挂接返回 `Ok(())` 以便继续分配。
    fn check_duplicate(&self, state: &SlotState, tag: TypeTag, size: usize) -> Result<(), BufferError> {
        let Some(position) = state.instance_metadata(tag) else {
            return Ok(());
        };
        let attached = state.metadata[position].block.size;
        if attached == size {
            debug!(type_name = self.type_name(), %tag, "meta data already attached");
            Ok(())
        } else {
            error!(type_name = self.type_name(), %tag, attached, size, "meta data attached with a different size");
            Err(BufferError::MetaDataSizeMismatch {
                tag,
                attached,
                requested: size,
            })
        }
    }

    /// 移除私有元数据块并释放其内存；池级元数据不受影响。
    pub fn detach_metadata(&self, tag: TypeTag) -> Result<(), BufferError> {
        let entry = {
            let mut state = self.lock_live()?;
            state
                .instance_metadata(tag)
                .map(|position| state.metadata.remove(position))
        };
        match entry {
            Some(entry) => {
                drop(entry);
                Ok(())
            }
            None => {
                error!(type_name = self.type_name(), %tag, "no meta data of this type on the buffer");
                Err(BufferError::MetaDataTypeNotFound { tag })
            }
        }
    }

    /// 查找元数据块（私有或池级）。
    pub fn obtain_metadata_reference(&self, tag: TypeTag) -> Result<MetaDataReference, BufferError> {
        let state = self.lock_live()?;
        let found = state
            .metadata
            .iter()
            .find(|entry| entry.tag == tag)
            .and_then(|entry| {
                entry
                    .block
                    .address(AddressKind::Cached)
                    .map(|address| MetaDataReference {
                        address,
                        size: entry.block.size,
                    })
            });
        drop(state);
        found.ok_or_else(|| {
            error!(type_name = self.type_name(), %tag, "no meta data of this type on the buffer");
            BufferError::MetaDataTypeNotFound { tag }
        })
    }

    /// 为 `NoAllocation` 类型的缓冲登记外部数据地址，已用尺寸清零。
    pub fn register_data_reference(&self, size: usize, views: AddressViews) -> Result<(), BufferError> {
        if self.pool.descriptor.source() != AllocationSource::NoAllocation {
            error!(
                type_name = self.type_name(),
                index = self.slot.index,
                "data reference registered on a buffer whose memory is allocated by the pool"
            );
            return Err(BufferError::not_supported(self.type_name(), "register data reference"));
        }
        let mut state = self.lock_live()?;
        self.pool.metrics.adjust_in_use(state.data_size, 0);
        state.data = Block::unowned(size, views, false);
        state.data_size = 0;
        Ok(())
    }

    /// 只登记一种地址视图的便捷形式。
    pub fn register_data_reference_view(
        &self,
        size: usize,
        address: usize,
        kind: AddressKind,
    ) -> Result<(), BufferError> {
        self.register_data_reference(size, AddressViews::single(kind, address))
    }

    /// 读取数据块在指定视图下的地址与尺寸。
    ///
    /// 没有挂接数据返回 [`BufferError::NoDataAttached`]（部分调用点视为正常）；数据存在但缺少该视图返回
    /// [`BufferError::AddressViewUnavailable`]。
    pub fn obtain_data_reference(&self, kind: AddressKind) -> Result<DataReference, BufferError> {
        let state = self.lock_live()?;
        if state.data.size == 0 {
            return Err(BufferError::NoDataAttached);
        }
        let Some(address) = state.data.address(kind) else {
            drop(state);
            error!(type_name = self.type_name(), index = self.slot.index, ?kind, "address view unavailable");
            return Err(BufferError::AddressViewUnavailable { kind });
        };
        Ok(DataReference {
            size: state.data.size,
            used_size: state.data_size,
            address,
        })
    }

    /// 设置已用数据量，不得超过数据块容量。
    pub fn set_used_data_size(&self, size: usize) -> Result<(), BufferError> {
        let mut state = self.lock_live()?;
        if size > state.data.size {
            let limit = state.data.size;
            drop(state);
            error!(type_name = self.type_name(), index = self.slot.index, size, limit, "used size exceeds the buffer");
            return Err(BufferError::SizeOutOfRange {
                requested: size,
                limit,
            });
        }
        self.pool.metrics.adjust_in_use(state.data_size, size);
        state.data_size = size;
        Ok(())
    }

    fn require_sub_allocated(&self, operation: &'static str) -> Result<(), BufferError> {
        let descriptor = &self.pool.descriptor;
        if descriptor.source() != AllocationSource::SuppliedBlock || descriptor.allocates_on_pool_creation() {
            error!(type_name = self.type_name(), operation, "operation not supported by this descriptor");
            return Err(BufferError::not_supported(self.type_name(), operation));
        }
        Ok(())
    }

    /// 把数据块收缩到 `new_size`（按分配单元向上取整），尾部归还给区域。返回收缩后的容量。
    pub fn shrink(&self, new_size: usize) -> Result<usize, BufferError> {
        self.require_sub_allocated("shrink")?;
        let (freed, size) = {
            let mut state = self.lock_live()?;
            let limit = if new_size < state.data_size {
                Some(state.data_size)
            } else if new_size > state.data.size {
                Some(state.data.size)
            } else {
                None
            };
            if let Some(limit) = limit {
                drop(state);
                error!(type_name = self.type_name(), new_size, limit, "invalid shrink size");
                return Err(BufferError::SizeOutOfRange {
                    requested: new_size,
                    limit,
                });
            }
            let before = state.data.size;
            let rounded = self.pool.descriptor.round_to_unit(new_size)?;
            state.data.truncate(rounded);
            (before - state.data.size, state.data.size)
        };
        self.pool.metrics.sub_allocated(freed);
        trace!(type_name = self.type_name(), index = self.slot.index, freed, size, "buffer shrunk");
        Ok(size)
    }

    /// 原地扩展到相邻空闲块的全部长度；失败时缓冲保持不变。返回扩展后的容量。
    pub fn extend(&self, direction: ExtendDirection) -> Result<usize, BufferError> {
        self.require_sub_allocated("extend")?;
        let (grown, size) = {
            let mut state = self.lock_live()?;
            let Some((arena, extent)) = state.data.extent() else {
                return Err(BufferError::NoDataAttached);
            };
            let extended = arena
                .extend(extent, direction)
                .map_err(|source| BufferError::InsufficientMemory {
                    purpose: MemoryPurpose::General,
                    source,
                })?;
            state.data.relocate(extended);
            (extended.size - extent.size, extended.size)
        };
        self.pool.metrics.add_allocated(grown);
        trace!(type_name = self.type_name(), index = self.slot.index, grown, size, "buffer extended");
        Ok(size)
    }

    /// 在 `split_offset` 处把缓冲拆成两个，返回持有后半段的新缓冲（引用计数 1，持有者 `second_owner`）。
    ///
    /// 只支持子分配与 `NoAllocation` 类型；`duplicate_metadata` 为 `true` 时复制私有元数据。
    pub fn partition(
        &self,
        split_offset: usize,
        duplicate_metadata: bool,
        second_owner: OwnerId,
        non_blocking: bool,
    ) -> Result<Buffer, BufferError> {
        let descriptor = &self.pool.descriptor;
        let partitionable = !descriptor.allocates_on_pool_creation()
            && matches!(
                descriptor.source(),
                AllocationSource::SuppliedBlock | AllocationSource::NoAllocation
            );
        if !partitionable {
            error!(type_name = self.type_name(), "partitioning not supported for this allocation source");
            return Err(BufferError::not_supported(self.type_name(), "partition"));
        }
        {
            let state = self.lock_live()?;
            if split_offset > state.data.size {
                return Err(BufferError::SizeOutOfRange {
                    requested: split_offset,
                    limit: state.data.size,
                });
            }
        }

        let second = self.pool.acquire_empty(second_owner, non_blocking)?;
        let prepared = self.split_into_parts(split_offset, duplicate_metadata);
        let (tail, tail_used, duplicates) = match prepared {
            Ok(parts) => parts,
            Err(err) => {
                if let Err(undo) = second.decrement_reference_count(second_owner) {
                    error!(%undo, "failed to release the second partition");
                }
                return Err(err);
            }
        };
        {
            let mut state = second.slot.state.lock();
            state.data = tail;
            state.data_size = tail_used;
            state.metadata.extend(duplicates);
        }
        trace!(
            type_name = self.type_name(),
            index = self.slot.index,
            second = second.slot.index,
            split_offset,
            "buffer partitioned"
        );
        Ok(second)
    }

    fn split_into_parts(
        &self,
        split_offset: usize,
        duplicate_metadata: bool,
    ) -> Result<(Block, usize, Vec<MetaDataEntry>), BufferError> {
        let mut state = self.lock_live()?;
        if split_offset > state.data.size {
            return Err(BufferError::SizeOutOfRange {
                requested: split_offset,
                limit: state.data.size,
            });
        }
        let duplicates = if duplicate_metadata {
            state
                .metadata
                .iter()
                .filter(|entry| !entry.block.attached_to_pool)
                .map(|entry| self.duplicate_metadata(entry))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            Vec::new()
        };
        let tail = state.data.split_off(split_offset);
        let tail_used = state.data_size.saturating_sub(split_offset);
        state.data_size = state.data_size.min(split_offset);
        Ok((tail, tail_used, duplicates))
    }

    fn duplicate_metadata(&self, entry: &MetaDataEntry) -> Result<MetaDataEntry, BufferError> {
        let block = match &entry.block.backing {
            Backing::Heap(_) => {
                let mut copy = Block::heap(entry.block.size, MemoryPurpose::MetaData)?;
                if let (Some(target), Some(source)) = (copy.heap_bytes_mut(), entry.block.heap_bytes()) {
                    target.copy_from_slice(source);
                }
                copy
            }
            Backing::Unowned => Block::unowned(entry.block.size, entry.block.views, false),
            _ => {
                error!(type_name = self.type_name(), tag = %entry.tag, "unable to duplicate meta data block");
                return Err(BufferError::not_supported(self.type_name(), "duplicate meta data"));
            }
        };
        Ok(MetaDataEntry { tag: entry.tag, block })
    }

    /// 缓冲状态快照，同时输出到 `debug!`。
    pub fn dump(&self) -> BufferReport {
        let report = BufferReport::capture(self.slot.index, &self.slot.state.lock());
        crate::observability::emit_buffer_report(self.type_name(), &report);
        report
    }
}
