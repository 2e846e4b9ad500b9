use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use spark_media_alloc::{
    AddressViews, AllocatorError, ExtendDirection, Extent, MemoryRegion, SubAllocation,
    SubAllocator,
};
use tracing::{error, trace, warn};

use crate::config::WaitPolicy;

/// 区域子分配未能立即满足时的结局。
#[derive(Debug)]
pub(crate) enum ArenaShortfall {
    /// 空间不足（非阻塞请求）或请求本身非法。
    Exhausted(AllocatorError),
    Aborted,
    TimedOut,
}

/// `RegionArena` 把一块调用方提供的区域与其子分配器绑定，并提供阻塞式分配。
///
/// # 设计初衷（Why）
/// - `SubAllocator` 只做非阻塞的区间计算；区域空间不足时，获取缓冲的线程需要等待其他缓冲释放，
///   这段等待必须发生在池锁之外，否则释放方拿不到池锁，双方互相等待；
/// - 区域本身（可能是池持有的主机堆内存）与分配器生命周期一致，由 `Arc<RegionArena>` 共享给所有子分配块。
///
/// # 核心机制（How）
/// - 分配器置于 `parking_lot::Mutex` 中；`free` 归还区间后 `notify_all`，等待方按 `WaitPolicy::slice`
///   分段等待并在每段结束时重新检查中止与截止时间；
/// - 该锁是叶子锁：持有期间不获取任何其他锁。
pub(crate) struct RegionArena {
    region: MemoryRegion,
    allocator: Mutex<Box<dyn SubAllocator>>,
    freed: Condvar,
    wait: WaitPolicy,
}

impl RegionArena {
    pub(crate) fn new(region: MemoryRegion, allocator: Box<dyn SubAllocator>, wait: WaitPolicy) -> Self {
        Self {
            region,
            allocator: Mutex::new(allocator),
            freed: Condvar::new(),
            wait,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(region: MemoryRegion, allocator: Box<dyn SubAllocator>) -> Self {
        Self::new(region, allocator, WaitPolicy::default())
    }

    pub(crate) fn views_at(&self, offset: usize) -> AddressViews {
        self.region.views_at(offset)
    }

    pub(crate) fn largest_free_block(&self) -> usize {
        self.allocator.lock().largest_free_block()
    }

    /// 非阻塞分配。
    #[cfg(test)]
    pub(crate) fn try_allocate(&self, request: SubAllocation) -> Result<Extent, AllocatorError> {
        self.allocator.lock().allocate(request)
    }

    /// 分配一段区间；空间不足且允许阻塞时等待其他区间被释放。
    pub(crate) fn allocate(
        &self,
        request: SubAllocation,
        non_blocking: bool,
        deadline: Option<Instant>,
        aborted: &dyn Fn() -> bool,
    ) -> Result<Extent, ArenaShortfall> {
        let mut allocator = self.allocator.lock();
        let mut next_warning = Instant::now() + self.wait.long_wait_warning;
        loop {
            let err = match allocator.allocate(request) {
                Ok(extent) => return Ok(extent),
                Err(err) => err,
            };
            if non_blocking || !err.is_exhaustion() {
                return Err(ArenaShortfall::Exhausted(err));
            }
            if aborted() {
                return Err(ArenaShortfall::Aborted);
            }
            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                return Err(ArenaShortfall::TimedOut);
            }
            if now >= next_warning {
                warn!(
                    requested = request.size,
                    largest_free = allocator.largest_free_block(),
                    "still waiting for region memory"
                );
                next_warning = now + self.wait.long_wait_warning;
            }
            let wake = deadline.map_or(now + self.wait.slice, |deadline| deadline.min(now + self.wait.slice));
            trace!(requested = request.size, "waiting for region memory");
            self.freed.wait_until(&mut allocator, wake);
        }
    }

    /// 归还区间并唤醒所有等待者。
    pub(crate) fn free(&self, extent: Extent) {
        if extent.size == 0 {
            return;
        }
        let mut allocator = self.allocator.lock();
        if let Err(err) = allocator.free(extent) {
            error!(offset = extent.offset, size = extent.size, %err, "region free rejected");
            return;
        }
        drop(allocator);
        self.freed.notify_all();
    }

    /// 原地扩展区间，失败时区间不变。
    pub(crate) fn extend(&self, extent: Extent, direction: ExtendDirection) -> Result<Extent, AllocatorError> {
        self.allocator.lock().extend_to_largest(extent, direction)
    }

    /// 唤醒所有等待者，使其重新检查中止条件。
    pub(crate) fn wake_waiters(&self) {
        let _guard = self.allocator.lock();
        self.freed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::Duration,
    };

    use spark_media_alloc::SimpleAllocator;

    use super::*;

    fn arena(size: usize) -> Arc<RegionArena> {
        Arc::new(RegionArena::new(
            MemoryRegion::heap(size),
            Box::new(SimpleAllocator::new(size, 0, true)),
            WaitPolicy {
                slice: Duration::from_millis(5),
                long_wait_warning: Duration::from_secs(30),
            },
        ))
    }

    #[test]
    fn blocked_allocation_resumes_after_free() {
        let arena = arena(1024);
        let held = arena.try_allocate(SubAllocation::exact(1024)).expect("占满区域");
        let waiter = {
            let arena = Arc::clone(&arena);
            thread::spawn(move || arena.allocate(SubAllocation::exact(512), false, None, &|| false))
        };
        thread::sleep(Duration::from_millis(20));
        arena.free(held);
        let extent = waiter.join().expect("等待线程不应 panic").expect("释放后应分配成功");
        assert_eq!(extent.size, 512);
    }

    #[test]
    fn deadline_and_abort_end_the_wait() {
        let arena = arena(256);
        let _held = arena.try_allocate(SubAllocation::exact(256)).expect("占满区域");
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(matches!(
            arena.allocate(SubAllocation::exact(64), false, Some(deadline), &|| false),
            Err(ArenaShortfall::TimedOut)
        ));

        let flag = Arc::new(AtomicBool::new(false));
        let waiter = {
            let arena = Arc::clone(&arena);
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                arena.allocate(SubAllocation::exact(64), false, None, &|| flag.load(Ordering::SeqCst))
            })
        };
        thread::sleep(Duration::from_millis(10));
        flag.store(true, Ordering::SeqCst);
        arena.wake_waiters();
        assert!(matches!(
            waiter.join().expect("等待线程不应 panic"),
            Err(ArenaShortfall::Aborted)
        ));
    }

    #[test]
    fn non_blocking_request_fails_immediately() {
        let arena = arena(256);
        let _held = arena.try_allocate(SubAllocation::exact(200)).expect("分配");
        assert!(matches!(
            arena.allocate(SubAllocation::exact(128), true, None, &|| false),
            Err(ArenaShortfall::Exhausted(AllocatorError::OutOfSpace { .. }))
        ));
    }
}
