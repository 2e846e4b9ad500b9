//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义缓冲管理核心对外暴露的错误语义，流水线各阶段据此区分“背压”与“致命错误”；
//! - 每个变体都携带类型名、尺寸等上下文，便于在日志中直接定位出错的池或缓冲。
//!
//! ## 设计要求（What）
//! - 所有错误类型实现 `thiserror::Error`，下游分配器错误通过 `#[source]` 保留原因链；
//! - [`BufferError::category`] 把变体归入配置、资源耗尽、一致性、等待结果与无数据五类。

use core::fmt;

use spark_media_alloc::{AddressKind, AllocatorError};
use thiserror::Error;

use crate::types::{AllocationSource, TypeCategory, TypeTag};

/// 错误分类，对应流水线的处理策略。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorCategory {
    /// 描述符或参数非法，同步拒绝且不可重试。
    Configuration,
    /// 注册表已满、内存不足等，调用方自行决定重试或失败。
    ResourceExhaustion,
    /// 上游记账错误（操作零引用缓冲、元数据缺失等），必须记录并修复。
    Consistency,
    /// 阻塞等待的预期终止路径：非阻塞拒绝、超时、被中止。
    WaitOutcome,
    /// 缓冲没有挂接数据，部分调用点视为正常情况。
    NoData,
}

/// `NoFreeBufferAvailable` 的具体成因。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ShortfallCause {
    /// 调用方要求非阻塞。
    NonBlocking,
    /// 等待超过调用方给定的超时。
    TimedOut,
    /// 等待被 `abort_blocking_get_buffer` 或池销毁唤醒。
    Aborted,
}

impl fmt::Display for ShortfallCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShortfallCause::NonBlocking => "non-blocking request",
            ShortfallCause::TimedOut => "timed out",
            ShortfallCause::Aborted => "aborted",
        })
    }
}

/// 内存不足发生时正在分配的对象。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MemoryPurpose {
    Buffer,
    MetaData,
    General,
}

impl fmt::Display for MemoryPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemoryPurpose::Buffer => "buffer",
            MemoryPurpose::MetaData => "meta data",
            MemoryPurpose::General => "general",
        })
    }
}

/// 缓冲管理核心的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：流水线阶段把 `NoFreeBufferAvailable` 当作背压暂停注入，把配置与一致性错误当作致命错误终止流，
///   因此错误必须可分类，且等待结果与资源耗尽可以区分；
/// - **契约 (What)**：变体均为 `Send + Sync + 'static`；`InsufficientMemory` 通过 `source()` 暴露下游分配器错误；
/// - **风险 (Trade-offs)**：类型名以 `String` 携带，失败路径多一次分配，换取日志与断言的可读性。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BufferError {
    /// 类型注册表已达到容量上限。
    #[error("type registry is full ({max} types)")]
    TooManyDataTypes { max: usize },

    /// 按名称查找类型未命中。
    #[error("no type named `{name}` is registered")]
    TypeNameNotFound { name: String },

    /// 类型标签的索引越界或未注册。
    #[error("type tag {tag} is not registered")]
    UnknownType { tag: TypeTag },

    /// 类型标签的类别与期望不符。
    #[error("type tag {tag} is not a {expected:?} type")]
    TypeCategoryMismatch { tag: TypeTag, expected: TypeCategory },

    /// 类型描述符自相矛盾。
    #[error("descriptor `{name}` is invalid: {reason}")]
    InvalidDescriptor { name: String, reason: &'static str },

    /// 参数与描述符的分配来源不兼容。
    #[error("parameters incompatible with allocation source {allocation_source:?} of `{type_name}`: {reason}")]
    ParametersIncompatibleWithAllocationSource {
        type_name: String,
        allocation_source: AllocationSource,
        reason: &'static str,
    },

    /// 既没有请求尺寸也没有固定尺寸。
    #[error("size not specified for `{type_name}`")]
    SizeNotSpecified { type_name: String },

    /// 请求尺寸与固定尺寸不符。
    #[error("size {requested} does not match fixed size {expected} of `{type_name}`")]
    FixedSizeMismatch {
        type_name: String,
        expected: usize,
        requested: usize,
    },

    /// 池参数非法（缓冲数量为零、未知数量却要求按池分配等）。
    #[error("invalid pool configuration for `{type_name}`: {reason}")]
    InvalidPoolConfiguration { type_name: String, reason: &'static str },

    /// 下游分配器无法提供内存。
    #[error("insufficient memory for {purpose}")]
    InsufficientMemory {
        purpose: MemoryPurpose,
        #[source]
        source: AllocatorError,
    },

    /// 没有可用缓冲（非阻塞、超时或被中止）。
    #[error("no free buffer of type `{type_name}` available ({cause})")]
    NoFreeBufferAvailable { type_name: String, cause: ShortfallCause },

    /// 在引用计数为零（或已被回收）的缓冲上执行操作。
    #[error("buffer {index} of `{type_name}` is not referenced")]
    NotReferenced { type_name: String, index: u32 },

    /// 缓冲或池上没有该类型的元数据。
    #[error("meta data type {tag} is not attached")]
    MetaDataTypeNotFound { tag: TypeTag },

    /// 重复挂接同类型元数据但尺寸不同。
    #[error("meta data type {tag} already attached with {attached} bytes, {requested} requested")]
    MetaDataSizeMismatch {
        tag: TypeTag,
        attached: usize,
        requested: usize,
    },

    /// 附着边数组已满。
    #[error("buffer of `{type_name}` already holds {capacity} attached buffers")]
    TooManyAttachments { type_name: String, capacity: usize },

    /// 要解除的附着边不存在。
    #[error("buffer of `{type_name}` has no such attached buffer")]
    AttachedBufferNotFound { type_name: String },

    /// 缓冲未挂接数据。
    #[error("no data attached to the buffer")]
    NoDataAttached,

    /// 数据存在，但不提供请求的地址视图。
    #[error("{kind:?} address view is unavailable for this buffer")]
    AddressViewUnavailable { kind: AddressKind },

    /// 描述符不支持该操作。
    #[error("operation `{operation}` is not supported by `{type_name}`")]
    OperationNotSupportedByDescriptor {
        type_name: String,
        operation: &'static str,
    },

    /// 尺寸超出缓冲块容量或低于已用数据量。
    #[error("size {requested} is out of range (limit {limit})")]
    SizeOutOfRange { requested: usize, limit: usize },

    /// 销毁池时仍有缓冲被引用，池被保留。
    #[error("pool of `{type_name}` is still referenced by {referenced} buffers")]
    PoolStillReferenced { type_name: String, referenced: usize },

    /// 池已销毁。
    #[error("pool of `{type_name}` has been destroyed")]
    PoolDestroyed { type_name: String },
}

impl BufferError {
    /// 将变体归入错误分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            BufferError::InvalidDescriptor { .. }
            | BufferError::ParametersIncompatibleWithAllocationSource { .. }
            | BufferError::SizeNotSpecified { .. }
            | BufferError::FixedSizeMismatch { .. }
            | BufferError::InvalidPoolConfiguration { .. }
            | BufferError::TypeCategoryMismatch { .. }
            | BufferError::OperationNotSupportedByDescriptor { .. }
            | BufferError::SizeOutOfRange { .. } => ErrorCategory::Configuration,
            BufferError::TooManyDataTypes { .. } | BufferError::InsufficientMemory { .. } => {
                ErrorCategory::ResourceExhaustion
            }
            BufferError::NoFreeBufferAvailable { .. } => ErrorCategory::WaitOutcome,
            BufferError::NoDataAttached => ErrorCategory::NoData,
            BufferError::TypeNameNotFound { .. }
            | BufferError::UnknownType { .. }
            | BufferError::NotReferenced { .. }
            | BufferError::MetaDataTypeNotFound { .. }
            | BufferError::MetaDataSizeMismatch { .. }
            | BufferError::TooManyAttachments { .. }
            | BufferError::AttachedBufferNotFound { .. }
            | BufferError::AddressViewUnavailable { .. }
            | BufferError::PoolStillReferenced { .. }
            | BufferError::PoolDestroyed { .. } => ErrorCategory::Consistency,
        }
    }

    /// 流水线是否应把该错误当作背压（暂停注入而非终止流）。
    pub fn is_backpressure(&self) -> bool {
        matches!(self, BufferError::NoFreeBufferAvailable { .. })
    }

    pub(crate) fn incompatible(
        type_name: &str,
        allocation_source: AllocationSource,
        reason: &'static str,
    ) -> Self {
        BufferError::ParametersIncompatibleWithAllocationSource {
            type_name: type_name.to_owned(),
            allocation_source,
            reason,
        }
    }

    pub(crate) fn not_supported(type_name: &str, operation: &'static str) -> Self {
        BufferError::OperationNotSupportedByDescriptor {
            type_name: type_name.to_owned(),
            operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn shortfall_is_backpressure_not_exhaustion() {
        let err = BufferError::NoFreeBufferAvailable {
            type_name: "frame".into(),
            cause: ShortfallCause::TimedOut,
        };
        assert!(err.is_backpressure());
        assert_eq!(err.category(), ErrorCategory::WaitOutcome);
        assert_eq!(
            err.to_string(),
            "no free buffer of type `frame` available (timed out)"
        );
    }

    #[test]
    fn insufficient_memory_keeps_allocator_source() {
        let err = BufferError::InsufficientMemory {
            purpose: MemoryPurpose::Buffer,
            source: AllocatorError::OutOfSpace {
                requested: 512,
                largest_free: 256,
            },
        };
        assert_eq!(err.category(), ErrorCategory::ResourceExhaustion);
        let source = err.source().expect("应保留下游错误");
        assert!(source.to_string().contains("512"));
    }
}
