use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use spark_media_alloc::{
    AddressKind, AddressViews, AllocatorError, Extent, MemoryAccess, MemoryRegion,
    PartitionAllocator, PartitionHandle,
};
use tracing::trace;

use crate::{
    arena::RegionArena,
    error::{BufferError, MemoryPurpose},
    types::{AllocationSource, TypeDescriptor},
};

/// 块内存的归属，`Drop` 时把内存交还给来源。
pub(crate) enum Backing {
    /// 不归块所有：外部注册的地址、建池时分配的整块中的切片或空块。
    Unowned,
    Heap(BytesMut),
    Partition {
        allocator: Arc<dyn PartitionAllocator>,
        handle: Option<PartitionHandle>,
    },
    /// 调用方交给元数据块独占的区域。
    Region(MemoryRegion),
    SubAllocated {
        arena: Arc<RegionArena>,
        extent: Extent,
    },
}

impl Drop for Backing {
    fn drop(&mut self) {
        match self {
            Backing::Partition { allocator, handle } => {
                if let Some(handle) = handle.take() {
                    allocator.close(handle);
                }
            }
            Backing::SubAllocated { arena, extent } => arena.free(*extent),
            _ => {}
        }
    }
}

/// `Block` 是缓冲数据与元数据共用的内存描述：尺寸、地址视图与释放凭据。
///
/// - `attached_to_pool` 为 `true` 的块由池统一释放，缓冲回收时保留；
/// - 块被丢弃即释放内存，因此调用方必须在不持有池锁时丢弃可能归还内存的块。
pub(crate) struct Block {
    pub(crate) size: usize,
    pub(crate) views: AddressViews,
    pub(crate) attached_to_pool: bool,
    pub(crate) backing: Backing,
}

impl Block {
    pub(crate) fn empty() -> Self {
        Self::unowned(0, AddressViews::EMPTY, false)
    }

    pub(crate) fn unowned(size: usize, views: AddressViews, attached_to_pool: bool) -> Self {
        Self {
            size,
            views,
            attached_to_pool,
            backing: Backing::Unowned,
        }
    }

    /// 池内共享块中第 `index` 个长度为 `item_size` 的切片。
    pub(crate) fn slice(&self, index: usize, item_size: usize) -> Block {
        Block::unowned(item_size, self.views.offset(index * item_size), true)
    }

    /// 从主机堆分配 `size` 字节并清零。
    ///
    /// 堆无法满足时返回 `InsufficientMemory`，不会因尺寸过大而 panic。
    pub(crate) fn heap(size: usize, purpose: MemoryPurpose) -> Result<Self, BufferError> {
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(size)
            .map_err(|_| BufferError::InsufficientMemory {
                purpose,
                source: AllocatorError::HostMemoryExhausted { requested: size },
            })?;
        storage.resize(size, 0);
        let mut storage = BytesMut::from(Bytes::from(storage));
        let base = storage.as_mut_ptr() as usize;
        Ok(Self {
            size,
            views: AddressViews::cached(base),
            attached_to_pool: false,
            backing: Backing::Heap(storage),
        })
    }

    pub(crate) fn partition(
        allocator: &Arc<dyn PartitionAllocator>,
        partition: &str,
        size: usize,
        access: MemoryAccess,
        purpose: MemoryPurpose,
    ) -> Result<Self, BufferError> {
        let handle = allocator
            .open(partition, size, access)
            .map_err(|source| BufferError::InsufficientMemory { purpose, source })?;
        Ok(Self {
            size,
            views: handle.views(),
            attached_to_pool: false,
            backing: Backing::Partition {
                allocator: Arc::clone(allocator),
                handle: Some(handle),
            },
        })
    }

    pub(crate) fn sub_allocated(arena: Arc<RegionArena>, extent: Extent) -> Self {
        Self {
            size: extent.size,
            views: arena.views_at(extent.offset),
            attached_to_pool: false,
            backing: Backing::SubAllocated { arena, extent },
        }
    }

    pub(crate) fn address(&self, kind: AddressKind) -> Option<usize> {
        self.views.get(kind)
    }

    /// 子分配块在区域中的区间。
    pub(crate) fn extent(&self) -> Option<(Arc<RegionArena>, Extent)> {
        match &self.backing {
            Backing::SubAllocated { arena, extent } => Some((Arc::clone(arena), *extent)),
            _ => None,
        }
    }

    /// 把块截短到 `new_size`，子分配块的尾部归还给区域。
    pub(crate) fn truncate(&mut self, new_size: usize) {
        if new_size >= self.size {
            return;
        }
        if let Backing::SubAllocated { arena, extent } = &mut self.backing {
            arena.free(Extent::new(extent.offset + new_size, extent.size - new_size));
            extent.size = new_size;
        }
        self.size = new_size;
    }

    /// 以区域中的新区间替换子分配块的位置与尺寸。
    pub(crate) fn relocate(&mut self, new_extent: Extent) {
        if let Backing::SubAllocated { arena, extent } = &mut self.backing {
            self.views = arena.views_at(new_extent.offset);
            self.size = new_extent.size;
            *extent = new_extent;
        }
    }

    /// 在 `at` 处把块一分为二，返回后半段；前半段保留在 `self`。
    pub(crate) fn split_off(&mut self, at: usize) -> Block {
        let tail_size = self.size - at;
        let tail_views = self.views.offset(at);
        let backing = match &mut self.backing {
            Backing::SubAllocated { arena, extent } => {
                let tail = Extent::new(extent.offset + at, extent.size - at);
                extent.size = at;
                Backing::SubAllocated {
                    arena: Arc::clone(arena),
                    extent: tail,
                }
            }
            _ => Backing::Unowned,
        };
        self.size = at;
        Block {
            size: tail_size,
            views: tail_views,
            attached_to_pool: self.attached_to_pool,
            backing,
        }
    }

    /// 堆块内容的只读视图，其余来源返回 `None`。
    pub(crate) fn heap_bytes(&self) -> Option<&[u8]> {
        match &self.backing {
            Backing::Heap(bytes) => Some(&bytes[..]),
            _ => None,
        }
    }

    pub(crate) fn heap_bytes_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.backing {
            Backing::Heap(bytes) => Some(&mut bytes[..]),
            _ => None,
        }
    }

    /// 元数据块分配后清零。
    fn zero_fill(&mut self) {
        match &mut self.backing {
            Backing::Heap(bytes) => bytes.fill(0),
            Backing::Partition { .. } | Backing::Region(_) => {
                if let Some(address) = self.views.get(AddressKind::Cached) {
                    // SAFETY: `PartitionAllocator` 与 `MemoryRegion::from_raw` 的契约保证 cached 视图
                    // 在块存活期间至少可写 `size` 字节；区域尺寸已在构造时校验不小于块尺寸。
                    unsafe { core::ptr::write_bytes(address as *mut u8, 0, self.size) };
                }
            }
            _ => {}
        }
    }
}

/// 元数据块的内存从哪里来，需与元数据类型的分配来源匹配。
#[derive(Debug, Default)]
pub enum MetaDataMemory {
    /// `OsMemory`：由池从主机堆分配。
    #[default]
    Allocate,
    /// `NamedDeviceMemory`：从具名分区打开。
    Partition(String),
    /// `SuppliedBlock`：使用调用方提供的区域。
    Supplied(MemoryRegion),
    /// `NoAllocation`：调用方持有的外部地址。
    External(usize),
}

/// 为元数据分配一个块并清零。
pub(crate) fn allocate_metadata(
    descriptor: &TypeDescriptor,
    size: usize,
    memory: MetaDataMemory,
    partitions: &Arc<dyn PartitionAllocator>,
    access: MemoryAccess,
) -> Result<Block, BufferError> {
    let name = descriptor.name();
    let source = descriptor.source();
    let mut block = match (source, memory) {
        (AllocationSource::OsMemory, MetaDataMemory::Allocate) => {
            Block::heap(size, MemoryPurpose::MetaData)?
        }
        (AllocationSource::NamedDeviceMemory, MetaDataMemory::Partition(partition))
            if !partition.is_empty() =>
        {
            Block::partition(partitions, &partition, size, access, MemoryPurpose::MetaData)?
        }
        (AllocationSource::SuppliedBlock, MetaDataMemory::Supplied(region)) => {
            if region.size() < size {
                return Err(BufferError::incompatible(
                    name,
                    source,
                    "supplied region is smaller than the meta data",
                ));
            }
            Block {
                size,
                views: AddressViews::single(
                    AddressKind::Cached,
                    region.views().get(AddressKind::Cached).unwrap_or_default(),
                ),
                attached_to_pool: false,
                backing: Backing::Region(region),
            }
        }
        (AllocationSource::NoAllocation, MetaDataMemory::External(address)) => {
            return Ok(Block::unowned(size, AddressViews::cached(address), false));
        }
        _ => {
            return Err(BufferError::incompatible(
                name,
                source,
                "meta data memory does not match the allocation source",
            ));
        }
    };
    if block.address(AddressKind::Cached).is_none() {
        return Err(BufferError::incompatible(
            name,
            source,
            "meta data memory has no CPU address",
        ));
    }
    block.zero_fill();
    trace!(type_name = name, size, "meta data block allocated");
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_media_alloc::{HeapPartitionAllocator, SimpleAllocator};

    fn partitions() -> Arc<dyn PartitionAllocator> {
        Arc::new(HeapPartitionAllocator::new().with_partition("meta", 4096))
    }

    #[test]
    fn split_off_divides_sub_allocated_extent() {
        let arena = Arc::new(RegionArena::for_tests(
            MemoryRegion::heap(4096),
            Box::new(SimpleAllocator::new(4096, 0, true)),
        ));
        let extent = arena
            .try_allocate(spark_media_alloc::SubAllocation::exact(1024))
            .expect("分配 1 KiB");
        let mut head = Block::sub_allocated(Arc::clone(&arena), extent);
        let tail = head.split_off(256);
        assert_eq!(head.size, 256);
        assert_eq!(tail.size, 768);
        assert_eq!(
            tail.address(AddressKind::Cached),
            head.address(AddressKind::Cached).map(|a| a + 256)
        );
        drop(head);
        drop(tail);
        assert_eq!(arena.largest_free_block(), 4096);
    }

    #[test]
    fn oversized_heap_block_is_reported_not_panicked() {
        let err = Block::heap(isize::MAX as usize + 1, MemoryPurpose::Buffer)
            .err()
            .expect("超出地址空间的请求应失败");
        assert_eq!(
            err,
            BufferError::InsufficientMemory {
                purpose: MemoryPurpose::Buffer,
                source: AllocatorError::HostMemoryExhausted {
                    requested: isize::MAX as usize + 1,
                },
            }
        );
        let block = Block::heap(64, MemoryPurpose::MetaData).expect("小块分配");
        assert_eq!(block.heap_bytes().map(<[u8]>::len), Some(64));
        assert!(block.heap_bytes().is_some_and(|bytes| bytes.iter().all(|b| *b == 0)));
    }

    #[test]
    fn metadata_memory_must_match_source() {
        let descriptor = TypeDescriptor::metadata("timing", AllocationSource::NamedDeviceMemory);
        let err = allocate_metadata(
            &descriptor,
            64,
            MetaDataMemory::Allocate,
            &partitions(),
            MemoryAccess::Default,
        )
        .err()
        .expect("来源不匹配应失败");
        assert!(matches!(
            err,
            BufferError::ParametersIncompatibleWithAllocationSource { .. }
        ));
    }

    #[test]
    fn partition_metadata_is_zeroed_and_closed_on_drop() {
        let partitions: Arc<dyn PartitionAllocator> =
            Arc::new(HeapPartitionAllocator::new().with_partition("meta", 4096));
        let descriptor = TypeDescriptor::metadata("timing", AllocationSource::NamedDeviceMemory);
        let block = allocate_metadata(
            &descriptor,
            128,
            MetaDataMemory::Partition("meta".into()),
            &partitions,
            MemoryAccess::Cached,
        )
        .expect("打开分区内存");
        assert_eq!(block.size, 128);
        assert!(block.address(AddressKind::Cached).is_some());
        drop(block);
    }
}
