use core::fmt;

use bytes::BytesMut;

/// 一块内存的三种地址视图之一。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AddressKind {
    /// CPU 经缓存访问的虚拟地址。
    Cached,
    /// CPU 绕过缓存访问的虚拟地址。
    Uncached,
    /// 设备 DMA 使用的物理地址。
    Physical,
}

impl AddressKind {
    /// 三种视图的固定遍历顺序。
    pub const ALL: [AddressKind; 3] = [AddressKind::Cached, AddressKind::Uncached, AddressKind::Physical];
}

/// `AddressViews` 记录同一块内存最多三种地址视图。
///
/// # 设计动机（Why）
/// - 媒体流水线中 CPU 与解码硬件分别以虚拟地址、物理地址访问同一块内存，
///   缓冲本身只需要记录这些地址，而不需要解引用它们；
/// - 地址以 `usize` 表达，既能覆盖真实指针，也能覆盖外部注册、从不在本进程解引用的设备地址。
///
/// # 契约说明（What）
/// - 未提供的视图为 `None`；
/// - [`offset`](Self::offset) 对每个已提供的视图做同样的平移，用于子分配与缓冲拆分。
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct AddressViews {
    cached: Option<usize>,
    uncached: Option<usize>,
    physical: Option<usize>,
}

impl AddressViews {
    /// 不含任何视图。
    pub const EMPTY: AddressViews = AddressViews {
        cached: None,
        uncached: None,
        physical: None,
    };

    /// 以三个可选视图构造。
    pub const fn new(cached: Option<usize>, uncached: Option<usize>, physical: Option<usize>) -> Self {
        Self {
            cached,
            uncached,
            physical,
        }
    }

    /// 仅包含 cached 视图，常用于主机堆内存。
    pub const fn cached(address: usize) -> Self {
        Self::new(Some(address), None, None)
    }

    /// 仅设置一种视图。
    pub fn single(kind: AddressKind, address: usize) -> Self {
        let mut views = Self::EMPTY;
        views.set(kind, Some(address));
        views
    }

    /// 读取指定视图。
    pub fn get(&self, kind: AddressKind) -> Option<usize> {
        match kind {
            AddressKind::Cached => self.cached,
            AddressKind::Uncached => self.uncached,
            AddressKind::Physical => self.physical,
        }
    }

    /// 覆盖指定视图。
    pub fn set(&mut self, kind: AddressKind, address: Option<usize>) {
        match kind {
            AddressKind::Cached => self.cached = address,
            AddressKind::Uncached => self.uncached = address,
            AddressKind::Physical => self.physical = address,
        }
    }

    /// 是否一个视图都没有。
    pub fn is_empty(&self) -> bool {
        self.cached.is_none() && self.uncached.is_none() && self.physical.is_none()
    }

    /// 将每个已提供的视图平移 `delta` 字节。
    pub fn offset(&self, delta: usize) -> Self {
        Self {
            cached: self.cached.map(|a| a + delta),
            uncached: self.uncached.map(|a| a + delta),
            physical: self.physical.map(|a| a + delta),
        }
    }
}

impl fmt::Debug for AddressViews {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct Hex(Option<usize>);
        impl fmt::Debug for Hex {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    Some(a) => write!(f, "{a:#x}"),
                    None => f.write_str("-"),
                }
            }
        }
        f.debug_struct("AddressViews")
            .field("cached", &Hex(self.cached))
            .field("uncached", &Hex(self.uncached))
            .field("physical", &Hex(self.physical))
            .finish()
    }
}

/// `MemoryRegion` 表示调用方交给缓冲池的一整块连续内存。
///
/// # 设计初衷（Why）
/// - `AllocateFromSuppliedBlock` 策略需要在一块外部区域上做子分配，并且元数据块会被清零，
///   因此区域的 cached 视图必须在池的整个生命周期内可写；
/// - 通过安全构造函数 [`MemoryRegion::heap`] 持有主机堆内存，通过 `unsafe` 的
///   [`MemoryRegion::from_raw`] 接入外部映射的设备内存，把“地址有效性”这一不变量收敛在构造点。
///
/// # 契约说明（What）
/// - `size` 为区域总字节数；`views` 为区域起始处的地址视图；
/// - 区域被 `Drop` 时若持有堆内存则一并释放，外部区域由调用方负责回收。
pub struct MemoryRegion {
    views: AddressViews,
    size: usize,
    _storage: Option<BytesMut>,
}

impl MemoryRegion {
    /// 分配一块清零的主机堆内存作为区域，cached 与 physical 视图指向同一地址。
    pub fn heap(size: usize) -> Self {
        let mut storage = BytesMut::zeroed(size);
        let base = storage.as_mut_ptr() as usize;
        Self {
            views: AddressViews::new(Some(base), None, Some(base)),
            size,
            _storage: Some(storage),
        }
    }

    /// 以外部提供的地址视图构造区域。
    ///
    /// # Safety
    /// 若 `views` 提供了 cached 视图，则从该地址起的 `size` 字节在区域存活期间必须可读写，
    /// 且不与其他 Rust 引用别名；uncached / physical 视图不会被本 crate 解引用。
    pub unsafe fn from_raw(views: AddressViews, size: usize) -> Self {
        Self {
            views,
            size,
            _storage: None,
        }
    }

    /// 区域起始处的地址视图。
    pub fn views(&self) -> AddressViews {
        self.views
    }

    /// 区域总字节数。
    pub fn size(&self) -> usize {
        self.size
    }

    /// 区域内 `offset` 处的地址视图。
    pub fn views_at(&self, offset: usize) -> AddressViews {
        self.views.offset(offset)
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("views", &self.views)
            .field("size", &self.size)
            .field("owned", &self._storage.is_some())
            .finish()
    }
}
