use core::fmt;

use crate::error::BufferError;

/// 类型的类别：缓冲数据或元数据。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TypeCategory {
    BufferData,
    MetaData,
}

/// 缓冲或元数据块的内存来源。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AllocationSource {
    /// 池不分配内存，调用方通过 `register_data_reference` 提供外部地址。
    NoAllocation,
    /// 每次获取时从主机堆分配，释放时归还。
    OsMemory,
    /// 每次获取时从具名设备分区打开，释放时关闭。
    NamedDeviceMemory,
    /// 在调用方提供的一整块区域上子分配。
    SuppliedBlock,
    /// 调用方在建池时逐个提供每个缓冲的地址。
    IndividualSuppliedBlocks,
}

/// `TypeTag` 是注册表分配的 32 位类型标签：类别位与注册表索引按位或。
///
/// # 契约说明（What）
/// - 元数据类型置位 `0x8000`，低 15 位为注册表槽位索引；
/// - 标签在进程生命周期内稳定，可直接作为注册表下标使用。
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TypeTag(u32);

impl TypeTag {
    const METADATA_BIT: u32 = 0x8000;
    const INDEX_MASK: u32 = 0x7fff;
    /// 索引可表达的最大类型数。
    pub const MAX_INDEX: usize = Self::INDEX_MASK as usize + 1;

    pub(crate) fn new(category: TypeCategory, index: usize) -> Self {
        let base = match category {
            TypeCategory::BufferData => 0,
            TypeCategory::MetaData => Self::METADATA_BIT,
        };
        Self(base | (index as u32 & Self::INDEX_MASK))
    }

    /// 从原始编码恢复标签；是否已注册由注册表校验。
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// 32 位原始编码。
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn category(self) -> TypeCategory {
        if self.0 & Self::METADATA_BIT != 0 {
            TypeCategory::MetaData
        } else {
            TypeCategory::BufferData
        }
    }

    /// 注册表槽位索引。
    pub fn index(self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({:#06x})", self.0)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// `TypeDescriptor` 描述一类缓冲或元数据块的静态属性。
///
/// # 设计初衷（Why）
/// - 流水线各阶段（collator、frame-parser、codec、manifestor）以类型为单位申请缓冲，
///   分配来源、对齐与尺寸规则随类型固定，不随单次获取变化；
/// - 描述符注册后不可变，池与缓冲只持有 `Arc<TypeDescriptor>`，读取无需加锁。
///
/// # 契约说明（What）
/// - `allocation_unit` 仅对 `SuppliedBlock` 有意义，子分配尺寸向上取整到该单位；
/// - `alignment` 为 0 时视为 1，且必须是 2 的幂；
/// - `fixed_size` 为 `Some(n)` 时所有分配都必须是 `n` 字节，`n` 不得为 0。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TypeDescriptor {
    name: String,
    category: TypeCategory,
    source: AllocationSource,
    allocation_unit: usize,
    alignment: usize,
    allocate_on_pool_creation: bool,
    fixed_size: Option<usize>,
}

impl TypeDescriptor {
    /// 缓冲数据类型。
    pub fn buffer_data(name: impl Into<String>, source: AllocationSource) -> Self {
        Self::new(name, TypeCategory::BufferData, source)
    }

    /// 元数据类型。
    pub fn metadata(name: impl Into<String>, source: AllocationSource) -> Self {
        Self::new(name, TypeCategory::MetaData, source)
    }

    fn new(name: impl Into<String>, category: TypeCategory, source: AllocationSource) -> Self {
        Self {
            name: name.into(),
            category,
            source,
            allocation_unit: 0,
            alignment: 1,
            allocate_on_pool_creation: false,
            fixed_size: None,
        }
    }

    /// 子分配尺寸的取整单位，`SuppliedBlock` 且非建池时分配的类型必须非 0。
    pub fn with_allocation_unit(mut self, unit: usize) -> Self {
        self.allocation_unit = unit;
        self
    }

    /// 数据尺寸与子分配起点的对齐，须为 2 的幂；0 在注册时规范化为 1。
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// 建池时为全部缓冲一次分配内存；只适用于固定数量的缓冲数据池。
    pub fn allocate_on_pool_creation(mut self, enabled: bool) -> Self {
        self.allocate_on_pool_creation = enabled;
        self
    }

    /// 所有分配都使用 `size` 字节，请求中的尺寸必须与之相等。
    pub fn with_fixed_size(mut self, size: usize) -> Self {
        self.fixed_size = Some(size);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> TypeCategory {
        self.category
    }

    pub fn source(&self) -> AllocationSource {
        self.source
    }

    /// 子分配取整单位，0 表示不取整。
    pub fn allocation_unit(&self) -> usize {
        self.allocation_unit
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn allocates_on_pool_creation(&self) -> bool {
        self.allocate_on_pool_creation
    }

    /// 固定尺寸；`None` 表示每次请求自带尺寸。
    pub fn fixed_size(&self) -> Option<usize> {
        self.fixed_size
    }

    /// 注册前的自洽性检查，并把 0 对齐规范化为 1。
    pub(crate) fn validated(mut self) -> Result<Self, BufferError> {
        let invalid = |name: &str, reason| BufferError::InvalidDescriptor {
            name: name.to_owned(),
            reason,
        };
        if self.alignment == 0 {
            self.alignment = 1;
        }
        if !self.alignment.is_power_of_two() {
            return Err(invalid(&self.name, "alignment must be a power of two"));
        }
        if self.fixed_size == Some(0) {
            return Err(invalid(&self.name, "fixed-size types must specify a non-zero size"));
        }
        match self.category {
            TypeCategory::MetaData => {
                if self.source == AllocationSource::IndividualSuppliedBlocks {
                    return Err(invalid(
                        &self.name,
                        "meta data types cannot use individually supplied blocks",
                    ));
                }
                if self.allocate_on_pool_creation {
                    return Err(invalid(
                        &self.name,
                        "meta data types cannot allocate on pool creation",
                    ));
                }
            }
            TypeCategory::BufferData => {
                if self.allocate_on_pool_creation && self.source == AllocationSource::NoAllocation {
                    return Err(invalid(
                        &self.name,
                        "NoAllocation types have no memory to allocate on pool creation",
                    ));
                }
                if self.source == AllocationSource::IndividualSuppliedBlocks
                    && !self.allocate_on_pool_creation
                {
                    return Err(invalid(
                        &self.name,
                        "individually supplied blocks are bound to buffers on pool creation",
                    ));
                }
                if self.source == AllocationSource::SuppliedBlock
                    && !self.allocate_on_pool_creation
                    && self.allocation_unit == 0
                {
                    return Err(invalid(
                        &self.name,
                        "sub-allocated types need a non-zero allocation unit",
                    ));
                }
            }
        }
        Ok(self)
    }

    /// 结合固定尺寸解析请求尺寸并按对齐取整；取整溢出返回 `SizeOutOfRange`。
    pub(crate) fn resolve_size(&self, requested: Option<usize>) -> Result<usize, BufferError> {
        let size = match (requested, self.fixed_size) {
            (Some(requested), Some(expected)) if requested != expected => {
                return Err(BufferError::FixedSizeMismatch {
                    type_name: self.name.clone(),
                    expected,
                    requested,
                });
            }
            (Some(size), _) | (None, Some(size)) => size,
            (None, None) => {
                return Err(BufferError::SizeNotSpecified {
                    type_name: self.name.clone(),
                });
            }
        };
        self.align(size)
    }

    /// 按对齐向上取整。
    ///
    /// 取整结果超出 `usize` 时返回 `SizeOutOfRange`，`limit` 为可表达的最大对齐尺寸。
    pub(crate) fn align(&self, size: usize) -> Result<usize, BufferError> {
        let mask = self.alignment.max(1) - 1;
        size
            .checked_add(mask)
            .map(|padded| padded & !mask)
            .ok_or(BufferError::SizeOutOfRange {
                requested: size,
                limit: usize::MAX & !mask,
            })
    }

    /// 按分配单元向上取整；单元为 0 时原样返回。
    pub(crate) fn round_to_unit(&self, size: usize) -> Result<usize, BufferError> {
        match self.allocation_unit {
            0 => Ok(size),
            unit => size
                .div_ceil(unit)
                .checked_mul(unit)
                .ok_or(BufferError::SizeOutOfRange {
                    requested: size,
                    limit: usize::MAX / unit * unit,
                }),
        }
    }
}

/// 缓冲持有者标识，仅用于诊断，不参与引用计数。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct OwnerId(pub u32);

impl OwnerId {
    /// 未指定持有者，占位槽位的值。
    pub const UNSPECIFIED: OwnerId = OwnerId(0xffff_ffff);
    /// 通过附着边持有的引用。
    pub const ATTACHED_TO_OTHER_BUFFER: OwnerId = OwnerId(0xffff_fffe);

    /// 是否为占位用的 [`OwnerId::UNSPECIFIED`]。
    pub fn is_unspecified(self) -> bool {
        self == Self::UNSPECIFIED
    }
}
