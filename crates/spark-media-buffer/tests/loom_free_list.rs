//! 固定数量池“空闲队列 + 中止纪元 + 条件变量”协议的 Loom 模型。
//!
//! # 教案级导览
//! - **核心目标 (Why)**：阻塞获取在池锁内检查空闲队列与中止纪元后进入等待；释放与中止分别在池锁内
//!   `notify_all`。若检查与等待之间存在窗口，释放或中止的唤醒会丢失，等待者永久阻塞；
//! - **整体位置 (Why)**：仅在 `--features loom-model` 且 `--cfg loom`（或 `spark_loom`）下编译，
//!   与 `blocking_concurrency.rs` 的真实线程测试互补：那里验证超时与 API 行为，这里穷举交错验证“不丢唤醒”；
//! - **设计手法 (How)**：`ShadowPool` 以 Loom 的 `Mutex`/`Condvar`/`AtomicU64` 复刻 `PoolShared` 的
//!   `acquire`、`release` 与 `abort_blocking_get_buffer` 三段临界区，等待不带超时，
//!   任何丢失的唤醒都会被 Loom 报告为死锁；
//! - **契约 (What)**：等待者要么取得被释放的槽位，要么在中止发生于其进入之后时返回 `Aborted`；
//!   无论哪种结局，`referenced` 与空闲队列长度之和恒等于槽位总数。
//!
//! # 设计考量 (Trade-offs)
//! - 影子模型不依赖生产类型，生产代码不必为 Loom 引入条件编译；代价是两者需人工保持同步；
//! - 只建模单个槽位与单个等待者，状态空间保持在 Loom 可穷举的范围内。
#![cfg(all(feature = "loom-model", any(loom, spark_loom)))]

use std::collections::VecDeque;

use loom::{
    model,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};

#[derive(Debug, Eq, PartialEq)]
enum Outcome {
    Acquired(u32),
    Aborted,
}

struct ShadowState {
    free: VecDeque<u32>,
    referenced: usize,
}

struct ShadowPool {
    state: Mutex<ShadowState>,
    released: Condvar,
    abort_epoch: AtomicU64,
}

impl ShadowPool {
    /// 槽位 0 已被持有的单槽池。
    fn held() -> Self {
        Self {
            state: Mutex::new(ShadowState {
                free: VecDeque::new(),
                referenced: 1,
            }),
            released: Condvar::new(),
            abort_epoch: AtomicU64::new(0),
        }
    }

    fn acquire(&self) -> Outcome {
        let entry_epoch = self.abort_epoch.load(Ordering::SeqCst);
        let mut state = self.state.lock().expect("池锁未中毒");
        loop {
            if let Some(index) = state.free.pop_front() {
                state.referenced += 1;
                return Outcome::Acquired(index);
            }
            if self.abort_epoch.load(Ordering::SeqCst) != entry_epoch {
                return Outcome::Aborted;
            }
            state = self.released.wait(state).expect("池锁未中毒");
        }
    }

    fn release(&self, index: u32) {
        let mut state = self.state.lock().expect("池锁未中毒");
        state.referenced -= 1;
        state.free.push_back(index);
        self.released.notify_all();
    }

    fn abort(&self) {
        self.abort_epoch.fetch_add(1, Ordering::SeqCst);
        let _state = self.state.lock().expect("池锁未中毒");
        self.released.notify_all();
    }

    fn slots_accounted(&self) -> usize {
        let state = self.state.lock().expect("池锁未中毒");
        state.referenced + state.free.len()
    }
}

#[test]
fn release_always_reaches_a_waiter() {
    model(|| {
        let pool = Arc::new(ShadowPool::held());
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire())
        };
        pool.release(0);
        assert_eq!(waiter.join().expect("等待线程不应 panic"), Outcome::Acquired(0));
        assert_eq!(pool.slots_accounted(), 1);
    });
}

#[test]
fn abort_and_release_race_without_losing_the_slot() {
    model(|| {
        let pool = Arc::new(ShadowPool::held());
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire())
        };
        let aborter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.abort())
        };
        pool.release(0);
        aborter.join().expect("中止线程不应 panic");

        let outcome = waiter.join().expect("等待线程不应 panic");
        let state = pool.state.lock().expect("池锁未中毒");
        match outcome {
            Outcome::Acquired(0) => {
                assert_eq!(state.referenced, 1);
                assert!(state.free.is_empty());
            }
            Outcome::Aborted => {
                assert_eq!(state.referenced, 0);
                assert_eq!(state.free.len(), 1, "被中止的等待者不得吞掉槽位");
            }
            other => panic!("意外结果: {other:?}"),
        }
    });
}
