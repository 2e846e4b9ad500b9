use std::collections::HashMap;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{AddressViews, AllocatorError};

/// 打开设备分区内存时请求的访问方式。
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum MemoryAccess {
    /// 由分区自身决定。
    #[default]
    Default,
    /// CPU 经缓存访问。
    Cached,
    /// CPU 绕过缓存访问，需要额外提供 uncached 视图。
    Uncached,
    /// 仅供硬件访问，CPU 不会读写内容。
    HardwareOnly,
}

/// 从具名分区打开的一段内存。
///
/// 句柄只能通过 [`PartitionAllocator::open`] 获得，并且必须交还给同一分配器的
/// [`PartitionAllocator::close`]。
#[derive(Debug, Eq, PartialEq)]
pub struct PartitionHandle {
    id: u64,
    size: usize,
    views: AddressViews,
}

impl PartitionHandle {
    /// 供 `PartitionAllocator` 实现者构造句柄。
    pub fn new(id: u64, size: usize, views: AddressViews) -> Self {
        Self { id, size, views }
    }

    /// 实现者分配的唯一标识。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 实际打开的字节数。
    pub fn size(&self) -> usize {
        self.size
    }

    /// 内存起始处的地址视图。
    pub fn views(&self) -> AddressViews {
        self.views
    }
}

/// `PartitionAllocator` 抽象“按分区名打开/关闭一段设备内存”的平台能力。
///
/// # 设计初衷（Why）
/// - 嵌入式平台上的解码器内存来自预留的具名分区（例如 BPA2 分区），缓冲池的
///   `AllocateIndividualBlocks` 策略按分区名逐块申请；
/// - 主机环境没有这类分区，使用 [`HeapPartitionAllocator`] 以堆内存模拟，保证同一套缓冲池代码可测。
///
/// # 契约说明（What）
/// - `open` 返回的句柄在 `close` 之前一直有效；
/// - 分区不存在返回 [`AllocatorError::UnknownPartition`]，容量不足返回
///   [`AllocatorError::PartitionExhausted`]。
///
/// # Safety
/// 实现者保证：句柄中若提供 cached 视图，则从该地址起 `size` 字节在 `close` 之前可读写且不与其他
/// Rust 引用别名。缓冲池会在该地址上执行清零写入。
pub unsafe trait PartitionAllocator: Send + Sync + 'static {
    /// 从 `partition` 打开 `size` 字节。
    fn open(
        &self,
        partition: &str,
        size: usize,
        access: MemoryAccess,
    ) -> Result<PartitionHandle, AllocatorError>;

    /// 关闭先前打开的内存。
    fn close(&self, handle: PartitionHandle);
}

#[derive(Debug)]
struct HeapPartition {
    capacity: usize,
    used: usize,
}

#[derive(Debug, Default)]
struct HeapPartitionState {
    partitions: HashMap<String, HeapPartition>,
    open: HashMap<u64, (String, BytesMut)>,
    next_id: u64,
}

/// 以主机堆内存模拟具名分区的参考实现。
///
/// 每个分区只有容量上限，没有真实的物理地址；physical 视图与 cached 视图相同。
#[derive(Debug, Default)]
pub struct HeapPartitionAllocator {
    state: Mutex<HeapPartitionState>,
}

impl HeapPartitionAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 声明一个容量为 `capacity` 字节的分区。
    pub fn with_partition(self, name: impl Into<String>, capacity: usize) -> Self {
        self.state
            .lock()
            .partitions
            .insert(name.into(), HeapPartition { capacity, used: 0 });
        self
    }

    /// 分区当前已打开的字节数；分区不存在时返回 `None`。
    pub fn used(&self, partition: &str) -> Option<usize> {
        self.state.lock().partitions.get(partition).map(|p| p.used)
    }

    /// 尚未关闭的句柄数量。
    pub fn open_handles(&self) -> usize {
        self.state.lock().open.len()
    }
}

// SAFETY: cached 视图指向 `open` 表中持有的 `BytesMut`，该存储在 `close` 移除之前不会被释放或移动，
// 且分配器自身从不为其创建引用。
unsafe impl PartitionAllocator for HeapPartitionAllocator {
    fn open(
        &self,
        partition: &str,
        size: usize,
        access: MemoryAccess,
    ) -> Result<PartitionHandle, AllocatorError> {
        let mut state = self.state.lock();
        let Some(entry) = state.partitions.get_mut(partition) else {
            return Err(AllocatorError::UnknownPartition {
                name: partition.to_owned(),
            });
        };
        let available = entry.capacity - entry.used;
        if size > available {
            return Err(AllocatorError::PartitionExhausted {
                name: partition.to_owned(),
                requested: size,
                available,
            });
        }
        entry.used += size;

        let mut storage = BytesMut::zeroed(size);
        let base = storage.as_mut_ptr() as usize;
        let uncached = matches!(access, MemoryAccess::Uncached).then_some(base);
        let views = AddressViews::new(Some(base), uncached, Some(base));

        let id = state.next_id;
        state.next_id += 1;
        state.open.insert(id, (partition.to_owned(), storage));
        debug!(partition, size, id, ?access, "partition memory opened");
        Ok(PartitionHandle::new(id, size, views))
    }

    fn close(&self, handle: PartitionHandle) {
        let mut state = self.state.lock();
        let Some((name, storage)) = state.open.remove(&handle.id) else {
            warn!(id = handle.id, "closing a partition handle that is not open");
            return;
        };
        if let Some(entry) = state.partitions.get_mut(&name) {
            entry.used -= storage.len();
        }
        debug!(partition = %name, size = handle.size, id = handle.id, "partition memory closed");
    }
}
