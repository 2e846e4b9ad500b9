//! `spark-media-buffer` 是媒体流水线的缓冲管理核心。
//!
//! # 模块定位（Why）
//! - 流水线各阶段（collator、frame-parser、codec、manifestor）之间以引用计数缓冲传递数据，
//!   缓冲可以携带元数据块、附着其他缓冲，并在最后一个引用释放时回到所属池；
//! - 固定数量的池在耗尽时阻塞获取方，形成流水线的背压；子分配池在调用方提供的区域内按需切分内存。
//!
//! # 设计概要（How）
//! - `types`：类型描述符、类型标签与持有者标识；`registry`：类型注册表与池登记表（[`BufferManager`]）；
//! - `pool`：[`BufferPool`] 的获取、回收、池级元数据与用量统计；`buffer`：[`Buffer`] 句柄上的全部操作；
//! - `block`、`arena`：数据与元数据内存块、区域子分配的阻塞封装，下游分配器来自 `spark-media-alloc`；
//! - `config`：TOML 配置；`error`：错误域；`observability`：快照与日志输出。
//!
//! # 契约说明（What）
//! - 锁顺序为“注册表 → 池 → 缓冲 → 区域”，任何路径都不会逆序加锁；
//! - 内存的分配与归还不在池锁内进行；
//! - 所有公开句柄满足 `Send + Sync`。

mod arena;
mod block;
mod buffer;
mod config;
mod error;
mod observability;
mod pool;
mod registry;
mod types;

pub use block::MetaDataMemory;
pub use buffer::{Buffer, DataReference, MetaDataReference};
pub use config::{ConfigError, ManagerConfig};
pub use error::{BufferError, ErrorCategory, MemoryPurpose, ShortfallCause};
#[cfg(feature = "subscriber")]
pub use observability::{ObservabilityError, install_default_subscriber};
pub use observability::{BufferReport, DumpFlags, PoolReport};
pub use pool::{BufferPool, BufferRequest, PoolSpec, PoolUsage};
pub use registry::BufferManager;
pub use types::{AllocationSource, OwnerId, TypeCategory, TypeDescriptor, TypeTag};

pub use spark_media_alloc::{
    AddressKind, AddressViews, AllocatorError, ExtendDirection, HeapPartitionAllocator, MemoryAccess,
    MemoryRegion, PartitionAllocator, PartitionHandle,
};
