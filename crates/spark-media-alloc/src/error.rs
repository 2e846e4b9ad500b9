use thiserror::Error;

/// 下游分配器的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：缓冲池需要区分“暂时没有空间”（可等待、可重试）与“请求本身非法”（配置错误），
///   因此分配器不能只返回 `Option`；
/// - **契约 (What)**：`OutOfSpace` 是唯一允许调用方阻塞等待后重试的变体，其余变体均应立即上抛；
/// - **风险 (Trade-offs)**：错误仅携带尺寸与名称等轻量上下文，避免在热路径上分配字符串。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AllocatorError {
    /// 区域内没有满足请求的连续空闲块。
    #[error("no free block of {requested} bytes (largest free block is {largest_free} bytes)")]
    OutOfSpace { requested: usize, largest_free: usize },

    /// 请求尺寸为零或超过区域容量。
    #[error("invalid allocation size {size} for a region of {capacity} bytes")]
    InvalidSize { size: usize, capacity: usize },

    /// 对齐参数不是 2 的幂。
    #[error("alignment {alignment} is not a power of two")]
    InvalidAlignment { alignment: usize },

    /// 扩展方向上不存在相邻空闲块。
    #[error("extent at offset {offset} cannot grow: no adjacent free space")]
    NoAdjacentSpace { offset: usize },

    /// 释放或扩展的区间不属于当前分配记录。
    #[error("extent [{offset}, +{size}) is not owned by this allocator")]
    UnknownExtent { offset: usize, size: usize },

    /// 具名设备分区不存在。
    #[error("device partition `{name}` is not known to the allocator")]
    UnknownPartition { name: String },

    /// 主机堆无法提供请求的字节数。
    #[error("host memory cannot satisfy {requested} bytes")]
    HostMemoryExhausted { requested: usize },

    /// 具名设备分区剩余容量不足。
    #[error("device partition `{name}` cannot satisfy {requested} bytes ({available} available)")]
    PartitionExhausted {
        name: String,
        requested: usize,
        available: usize,
    },
}

impl AllocatorError {
    /// 是否属于“稍后可能满足”的空间不足类错误。
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            AllocatorError::OutOfSpace { .. } | AllocatorError::PartitionExhausted { .. }
        )
    }
}
