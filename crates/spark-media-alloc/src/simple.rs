use std::collections::BTreeMap;

use tracing::trace;

use crate::{AllocatorError, DMA_BOUNDARY_64MB, ExtendDirection, Extent, SubAllocation, SubAllocator};

/// `SimpleAllocator` 是基于有序空闲链表（Free List）的最佳适配子分配器。
///
/// # 模块角色（Why）
/// - 为 `AllocateFromSuppliedBlock` 缓冲池提供默认的子分配实现：流水线中的编码帧缓冲尺寸差异很大，
///   最佳适配可以把大块空闲区留给后续的大帧；
/// - 部分解码硬件的 DMA 无法跨越 64 MiB 物理边界，分配器在构造时可声明该约束，放置时自动绕开边界。
///
/// # 核心机制（How）
/// - 空闲块以 `BTreeMap<offset, size>` 保存，按偏移有序，释放时与左右邻居合并；
/// - 精确分配在所有可放置的空闲块中选取最小者；下限分配（`lower_bound`）选取可放置长度最大的块并整块取走；
/// - 对齐与 64 MiB 边界均相对 `base_address`（通常是区域的物理地址）计算。
///
/// # 契约说明（What）
/// - 区间偏移均相对区域起点；
/// - 释放的区间若与空闲块重叠，视为重复释放并返回 [`AllocatorError::UnknownExtent`]。
#[derive(Debug)]
pub struct SimpleAllocator {
    capacity: usize,
    base_address: usize,
    allow_cross_64mb: bool,
    free: BTreeMap<usize, usize>,
}

impl SimpleAllocator {
    /// 创建覆盖 `capacity` 字节、起始物理地址为 `base_address` 的分配器。
    pub fn new(capacity: usize, base_address: usize, allow_cross_64mb: bool) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            capacity,
            base_address,
            allow_cross_64mb,
            free,
        }
    }

    /// 当前空闲字节总数。
    pub fn free_bytes(&self) -> usize {
        self.free.values().sum()
    }

    /// 空闲块数量，反映碎片程度。
    pub fn free_block_count(&self) -> usize {
        self.free.len()
    }

    fn align_up(&self, offset: usize, alignment: usize) -> usize {
        let absolute = self.base_address + offset;
        ((absolute + alignment - 1) & !(alignment - 1)) - self.base_address
    }

    /// `offset` 所在 64 MiB 段的末尾（相对偏移）。
    fn segment_end(&self, offset: usize) -> usize {
        let absolute = self.base_address + offset;
        (absolute / DMA_BOUNDARY_64MB + 1) * DMA_BOUNDARY_64MB - self.base_address
    }

    /// `offset` 所在 64 MiB 段的起点（相对偏移，不小于 0）。
    fn segment_start(&self, offset: usize) -> usize {
        let absolute = self.base_address + offset;
        (absolute / DMA_BOUNDARY_64MB * DMA_BOUNDARY_64MB).saturating_sub(self.base_address)
    }

    /// 计算空闲块 `[offset, offset + size)` 中满足请求的起点与最大可取长度。
    fn fit(&self, offset: usize, size: usize, wanted: usize, alignment: usize) -> Option<(usize, usize)> {
        let end = offset + size;
        let mut start = self.align_up(offset, alignment);
        if start >= end {
            return None;
        }
        if self.allow_cross_64mb {
            return (end - start >= wanted).then_some((start, end - start));
        }
        if self.segment_end(start).min(end) - start < wanted {
            start = self.align_up(self.segment_end(start), alignment);
            if start >= end {
                return None;
            }
        }
        let limit = self.segment_end(start).min(end);
        (limit - start >= wanted).then_some((start, limit - start))
    }

    /// 从空闲块 `block_offset` 中切出 `[start, start + len)`，余下部分放回空闲表。
    fn carve(&mut self, block_offset: usize, start: usize, len: usize) {
        let Some(block_size) = self.free.remove(&block_offset) else {
            return;
        };
        if start > block_offset {
            self.free.insert(block_offset, start - block_offset);
        }
        let block_end = block_offset + block_size;
        if start + len < block_end {
            self.free.insert(start + len, block_end - start - len);
        }
    }

    fn overlaps_free(&self, extent: Extent) -> bool {
        let before = self
            .free
            .range(..=extent.offset)
            .next_back()
            .is_some_and(|(o, s)| o + s > extent.offset);
        let after = self
            .free
            .range(extent.offset..)
            .next()
            .is_some_and(|(o, _)| *o < extent.end());
        before || after
    }
}

impl SubAllocator for SimpleAllocator {
    fn allocate(&mut self, request: SubAllocation) -> Result<Extent, AllocatorError> {
        if request.size == 0 || request.size > self.capacity {
            return Err(AllocatorError::InvalidSize {
                size: request.size,
                capacity: self.capacity,
            });
        }
        let alignment = request.alignment.max(1);
        if !alignment.is_power_of_two() {
            return Err(AllocatorError::InvalidAlignment { alignment });
        }

        // (块偏移, 块尺寸, 放置起点, 可取长度)
        let candidates = self.free.iter().filter_map(|(&offset, &size)| {
            self.fit(offset, size, request.size, alignment)
                .map(|(start, available)| (offset, size, start, available))
        });
        let chosen = if request.lower_bound {
            candidates.max_by_key(|&(offset, _, _, available)| (available, usize::MAX - offset))
        } else {
            candidates.min_by_key(|&(offset, size, _, _)| (size, offset))
        };

        let Some((block_offset, _, start, available)) = chosen else {
            return Err(AllocatorError::OutOfSpace {
                requested: request.size,
                largest_free: self.largest_free_block(),
            });
        };
        let len = if request.lower_bound {
            available
        } else {
            request.size
        };
        self.carve(block_offset, start, len);
        trace!(offset = start, size = len, lower_bound = request.lower_bound, "sub-allocation granted");
        Ok(Extent::new(start, len))
    }

    fn free(&mut self, extent: Extent) -> Result<(), AllocatorError> {
        if extent.size == 0 {
            return Ok(());
        }
        if extent.end() > self.capacity || self.overlaps_free(extent) {
            return Err(AllocatorError::UnknownExtent {
                offset: extent.offset,
                size: extent.size,
            });
        }

        let mut offset = extent.offset;
        let mut size = extent.size;
        if let Some((&prev_offset, &prev_size)) = self.free.range(..offset).next_back() {
            if prev_offset + prev_size == offset {
                self.free.remove(&prev_offset);
                offset = prev_offset;
                size += prev_size;
            }
        }
        if let Some(next_size) = self.free.remove(&(offset + size)) {
            size += next_size;
        }
        self.free.insert(offset, size);
        trace!(offset = extent.offset, size = extent.size, "sub-allocation freed");
        Ok(())
    }

    fn extend_to_largest(
        &mut self,
        extent: Extent,
        direction: ExtendDirection,
    ) -> Result<Extent, AllocatorError> {
        let no_space = AllocatorError::NoAdjacentSpace {
            offset: extent.offset,
        };
        match direction {
            ExtendDirection::Upwards => {
                let Some(&next_size) = self.free.get(&extent.end()) else {
                    return Err(no_space);
                };
                let mut grow = next_size;
                if !self.allow_cross_64mb {
                    let limit = self.segment_end(extent.offset);
                    grow = grow.min(limit.saturating_sub(extent.end()));
                }
                if grow == 0 {
                    return Err(no_space);
                }
                self.carve(extent.end(), extent.end(), grow);
                Ok(Extent::new(extent.offset, extent.size + grow))
            }
            ExtendDirection::Downwards => {
                let Some((&prev_offset, &prev_size)) = self.free.range(..extent.offset).next_back()
                else {
                    return Err(no_space);
                };
                if prev_offset + prev_size != extent.offset {
                    return Err(no_space);
                }
                let mut new_start = prev_offset;
                if !self.allow_cross_64mb {
                    new_start = new_start.max(self.segment_start(extent.end() - 1));
                }
                if new_start >= extent.offset {
                    return Err(no_space);
                }
                self.carve(prev_offset, new_start, extent.offset - new_start);
                Ok(Extent::new(new_start, extent.end() - new_start))
            }
        }
    }

    fn largest_free_block(&self) -> usize {
        self.free.values().copied().max().unwrap_or(0)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
