//! # observability 模块说明
//!
//! ## 角色定位（Why）
//! - `dump` 系列操作既要返回结构化快照供测试与宿主断言，也要把同样的内容写入 `tracing`，
//!   现场排查时只需打开 `debug` 级别；
//! - 长时间等待的告警路径复用同一套快照输出，保证日志格式一致。
//!
//! ## 设计要求（What）
//! - 快照类型（[`PoolReport`]、[`BufferReport`]）只包含值，不持有锁或句柄；
//! - 启用 `subscriber` 特性时提供 [`install_default_subscriber`]，进程内只安装一次。

use core::ops::BitOr;

use spark_media_alloc::AddressKind;
use tracing::debug;

use crate::{
    buffer::SlotState,
    pool::PoolUsage,
    types::{OwnerId, TypeTag},
};

/// `dump` 输出范围。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DumpFlags(u8);

impl DumpFlags {
    /// 池级统计与池元数据。
    pub const POOL: DumpFlags = DumpFlags(0b01);
    /// 每个缓冲的状态。
    pub const BUFFERS: DumpFlags = DumpFlags(0b10);
    pub const ALL: DumpFlags = DumpFlags(0b11);

    pub fn contains(self, other: DumpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DumpFlags {
    type Output = DumpFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        DumpFlags(self.0 | rhs.0)
    }
}

/// 单个缓冲的快照。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BufferReport {
    pub index: u32,
    pub generation: u64,
    pub reference_count: u32,
    pub owners: Vec<OwnerId>,
    /// 数据块容量。
    pub data_size: usize,
    pub used_size: usize,
    pub cached_address: Option<usize>,
    /// 已挂接的元数据类型（含池级元数据）。
    pub metadata: Vec<TypeTag>,
    /// 附着缓冲的类型与序号。
    pub attached: Vec<(TypeTag, u32)>,
}

impl BufferReport {
    pub(crate) fn capture(index: u32, state: &SlotState) -> Self {
        Self {
            index,
            generation: state.generation,
            reference_count: state.reference_count,
            owners: state
                .owners
                .iter()
                .copied()
                .filter(|owner| !owner.is_unspecified())
                .collect(),
            data_size: state.data.size,
            used_size: state.data_size,
            cached_address: state.data.address(AddressKind::Cached),
            metadata: state.metadata.iter().map(|entry| entry.tag).collect(),
            attached: state
                .attachments
                .iter()
                .flatten()
                .map(|edge| (edge.type_tag(), edge.index()))
                .collect(),
        }
    }
}

/// 池的快照。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolReport {
    pub type_name: String,
    pub tag: TypeTag,
    pub usage: PoolUsage,
    /// 池级元数据类型。
    pub metadata: Vec<TypeTag>,
    /// 仅在 [`DumpFlags::BUFFERS`] 时填充。
    pub buffers: Vec<BufferReport>,
}

pub(crate) fn emit_pool_report(report: &PoolReport) {
    let usage = &report.usage;
    debug!(
        type_name = %report.type_name,
        tag = %report.tag,
        buffers = usage.buffers_in_pool,
        referenced = usage.referenced_buffers,
        memory_in_pool = ?usage.memory_in_pool,
        memory_allocated = usage.memory_allocated,
        memory_in_use = usage.memory_in_use,
        largest_free_block = ?usage.largest_free_block,
        failed_acquisitions = usage.failed_acquisitions,
        metadata = ?report.metadata,
        "pool report"
    );
    for buffer in &report.buffers {
        emit_buffer_report(&report.type_name, buffer);
    }
}

pub(crate) fn emit_buffer_report(type_name: &str, report: &BufferReport) {
    debug!(
        type_name,
        index = report.index,
        references = report.reference_count,
        owners = ?report.owners,
        size = report.data_size,
        used = report.used_size,
        metadata = ?report.metadata,
        attached = ?report.attached,
        "buffer report"
    );
}

#[cfg(feature = "subscriber")]
pub use subscriber::{ObservabilityError, install_default_subscriber};

#[cfg(feature = "subscriber")]
mod subscriber {
    use std::sync::OnceLock;

    use thiserror::Error;
    use tracing_subscriber::EnvFilter;

    /// 安装全局订阅器失败。
    #[derive(Clone, Debug, Error, Eq, PartialEq)]
    #[error("failed to install tracing subscriber: {0}")]
    pub struct ObservabilityError(String);

    static INSTALLED: OnceLock<Result<(), ObservabilityError>> = OnceLock::new();

    /// 安装输出到标准错误的 `fmt` 订阅器，过滤规则取自 `RUST_LOG`，缺省为 `info`。
    ///
    /// 重复调用返回首次安装的结果。
    pub fn install_default_subscriber() -> Result<(), ObservabilityError> {
        INSTALLED
            .get_or_init(|| {
                let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .try_init()
                    .map_err(|err| ObservabilityError(err.to_string()))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_flags_compose() {
        assert!(DumpFlags::ALL.contains(DumpFlags::POOL));
        assert!(DumpFlags::ALL.contains(DumpFlags::BUFFERS));
        assert!(!DumpFlags::POOL.contains(DumpFlags::BUFFERS));
        assert_eq!(DumpFlags::POOL | DumpFlags::BUFFERS, DumpFlags::ALL);
    }

    #[cfg(feature = "subscriber")]
    #[test]
    fn installer_returns_the_first_outcome() {
        let first = install_default_subscriber();
        assert_eq!(install_default_subscriber(), first);
    }
}
