use crate::AllocatorError;

/// 区域内一段已分配的连续区间，以相对区域起点的偏移量表示。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Extent {
    pub offset: usize,
    pub size: usize,
}

impl Extent {
    pub const fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    /// 区间末尾（不含）。
    pub const fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// 一次子分配请求。
///
/// - `size`：期望字节数，调用方已按分配单元取整；
/// - `alignment`：起始偏移的对齐要求，必须为 2 的幂；
/// - `lower_bound`：为 `true` 时 `size` 只是下限，分配器返回当前最大的空闲块（至少 `size` 字节）。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubAllocation {
    pub size: usize,
    pub alignment: usize,
    pub lower_bound: bool,
}

impl SubAllocation {
    /// 精确尺寸、无额外对齐的请求。
    pub const fn exact(size: usize) -> Self {
        Self {
            size,
            alignment: 1,
            lower_bound: false,
        }
    }

    /// 以 `size` 为下限、尽量取最大空闲块的请求。
    pub const fn at_least(size: usize) -> Self {
        Self {
            size,
            alignment: 1,
            lower_bound: true,
        }
    }

    pub const fn aligned(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }
}

/// `ExtendToLargest` 的扩展方向。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExtendDirection {
    /// 吞并紧邻区间末尾之后的空闲块。
    Upwards,
    /// 吞并紧邻区间起点之前的空闲块，区间起点随之前移。
    Downwards,
}

/// `SubAllocator` 描述“在一块外部连续区域上做子分配”的能力。
///
/// # 设计初衷（Why）
/// - 缓冲池的 `AllocateFromSuppliedBlock` 策略只依赖这组操作，具体算法（最佳适配、伙伴系统等）可以替换；
/// - trait 本身保持非阻塞：空间不足时立即返回 [`AllocatorError::OutOfSpace`]，
///   等待与唤醒由持有分配器的缓冲池负责，这样分配器实现无需了解池的取消与超时语义。
///
/// # 契约说明（What）
/// - 所有方法以 `&mut self` 调用，调用方负责互斥；
/// - `free` 必须接收先前 `allocate`/`extend_to_largest` 返回的区间或其尾部子区间（用于缓冲收缩）；
/// - `extend_to_largest` 失败时区间保持不变。
pub trait SubAllocator: Send + 'static {
    /// 分配一段区间。
    fn allocate(&mut self, request: SubAllocation) -> Result<Extent, AllocatorError>;

    /// 归还一段区间。
    fn free(&mut self, extent: Extent) -> Result<(), AllocatorError>;

    /// 将 `extent` 朝 `direction` 方向扩展到相邻空闲块的全部长度。
    fn extend_to_largest(
        &mut self,
        extent: Extent,
        direction: ExtendDirection,
    ) -> Result<Extent, AllocatorError>;

    /// 当前最大空闲块的字节数。
    fn largest_free_block(&self) -> usize;

    /// 区域总字节数。
    fn capacity(&self) -> usize;
}
