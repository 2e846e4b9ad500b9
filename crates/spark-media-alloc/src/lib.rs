//! `spark-media-alloc` 描述媒体缓冲管理核心所依赖的两类下游分配能力。
//!
//! # 模块定位（Why）
//! - 缓冲池只关心“从一块连续区域切分内存”与“从具名设备分区打开内存”两种能力，
//!   不应绑定某个具体的物理内存分配器实现；
//! - 将这两种能力收敛为 trait，缓冲管理器即可在嵌入式平台上接入 BPA2 等真实分配器，
//!   在主机环境与测试中使用本 crate 提供的参考实现。
//!
//! # 设计概要（How）
//! - `region` 模块定义三种地址视图（cached / uncached / physical）以及外部提供的连续区域 `MemoryRegion`；
//! - `sub_allocator` 模块定义 `SubAllocator` 契约，`simple` 模块提供基于空闲链表的最佳适配实现；
//! - `partition` 模块定义 `PartitionAllocator` 契约，并提供以主机堆内存模拟具名分区的 `HeapPartitionAllocator`。
//!
//! # 契约说明（What）
//! - 所有分配器均以“区域内偏移量”描述子分配结果，地址换算由调用方结合 `AddressViews` 完成；
//! - 分配失败统一返回 [`AllocatorError`]，调用方据此区分空间不足与参数错误。

mod error;
mod partition;
mod region;
mod simple;
mod sub_allocator;

pub use error::AllocatorError;
pub use partition::{HeapPartitionAllocator, MemoryAccess, PartitionAllocator, PartitionHandle};
pub use region::{AddressKind, AddressViews, MemoryRegion};
pub use simple::SimpleAllocator;
pub use sub_allocator::{ExtendDirection, Extent, SubAllocation, SubAllocator};

/// 物理地址 64 MiB 边界，部分解码硬件的 DMA 描述符无法跨越该边界。
pub const DMA_BOUNDARY_64MB: usize = 64 * 1024 * 1024;
