//! 主动连接管理（ACM）：判定函数与共享监视器。
//!
//! # 教案定位（Why）
//! - 空闲连接占用对端资源，无响应的对端会让调用无限挂起；ACM 在一个共享定时器上
//!   周期性检查每条连接，决定发送心跳还是关闭；
//! - 判定逻辑是纯函数 [`evaluate`]，不触碰锁与 IO，便于单测覆盖所有策略组合；
//! - 每个通信器只有一个 [`AcmMonitor`] 任务，连接以弱引用登记，关闭后自动淘汰。
//!
//! # 判定规则（What）
//! - 心跳：策略为 `Always`；或策略非 `Off` 且空闲达到 `timeout / 4`，
//!   并且（策略不是 `OnDispatch` 或有分发进行中）；
//! - 关闭：空闲达到 `timeout` 且关闭策略非 `Off` 时，
//!   `OnIdleForceful`，或 `OnInvocation*` 且存在未决调用 → 强制关闭；
//!   否则若策略不是 `OnInvocation`，且没有未决调用、分发与批量请求 → 优雅关闭。
//!
//! # 风险与考量（Trade-offs）
//! - 检查周期取所有已登记连接超时的最小值的一半，超时时长差异很大时小超时连接会带动整体频率；
//! - 监视器任务只持有弱引用，通信器被丢弃后任务在下一个周期自行退出。

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{AcmClose, AcmConfig, AcmHeartbeat};

use super::{Connection, WeakConnection};

/// 判定所需的连接快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcmSnapshot {
    /// 距最近一次收发的时长。
    pub idle: Duration,
    /// 是否存在等待回复的调用。
    pub has_pending: bool,
    /// 是否有分发进行中。
    pub dispatching: bool,
    /// 批量队列是否非空。
    pub batched: bool,
}

/// 关闭动作。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcmCloseAction {
    /// 发送关闭通知，等待分发结束。
    Graceful,
    /// 立即拆除传输。
    Forceful,
}

/// 单次检查的结论。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcmDecision {
    /// 是否发送心跳。
    pub heartbeat: bool,
    /// 是否关闭以及如何关闭。
    pub close: Option<AcmCloseAction>,
}

/// 根据配置与快照作出判定。
pub fn evaluate(config: &AcmConfig, snapshot: &AcmSnapshot) -> AcmDecision {
    let mut decision = AcmDecision::default();
    if config.timeout.is_zero() {
        return decision;
    }
    let heartbeat_due = config.heartbeat == AcmHeartbeat::Always
        || (config.heartbeat != AcmHeartbeat::Off && snapshot.idle >= config.timeout / 4);
    decision.heartbeat =
        heartbeat_due && (config.heartbeat != AcmHeartbeat::OnDispatch || snapshot.dispatching);

    if config.close != AcmClose::Off && snapshot.idle >= config.timeout {
        let forceful = config.close == AcmClose::OnIdleForceful
            || (config.close != AcmClose::OnIdle && snapshot.has_pending);
        if forceful {
            decision.close = Some(AcmCloseAction::Forceful);
        } else if config.close != AcmClose::OnInvocation
            && !snapshot.has_pending
            && !snapshot.dispatching
            && !snapshot.batched
        {
            decision.close = Some(AcmCloseAction::Graceful);
        }
    }
    decision
}

/// 通信器级共享 ACM 监视器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 同一通信器的所有连接共享一个定时器，定时回调不得阻塞：
///   回调只读取时间戳并派发异步的心跳与关闭任务。
///
/// ## 逻辑 (How)
/// - `add` 登记连接的弱引用并唤醒任务；首次登记时才在当前运行时中启动任务；
/// - 任务每轮先淘汰已关闭或已释放的连接，再按最小超时的一半安排下一次检查；
///   新登记的连接只会提前、不会推迟已安排的检查；没有需要监视的连接时在 `Notify` 上等待；
/// - `destroy` 终止任务并清空登记表。
#[derive(Clone, Debug, Default)]
pub struct AcmMonitor {
    inner: Arc<MonitorInner>,
}

#[derive(Debug, Default)]
struct MonitorInner {
    connections: Mutex<Vec<WeakConnection>>,
    wakeup: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AcmMonitor {
    /// 创建监视器；后台任务在首次登记连接时启动。
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记连接。
    pub fn add(&self, connection: &Connection) {
        self.inner.connections.lock().push(connection.downgrade());
        let mut task = self.inner.task.lock();
        if task.is_none() {
            let wakeup = Arc::clone(&self.inner.wakeup);
            *task = Some(tokio::spawn(run(Arc::downgrade(&self.inner), wakeup)));
        }
        drop(task);
        self.inner.wakeup.notify_one();
    }

    /// 连接的 ACM 配置变化后唤醒任务重新计算周期。
    pub fn reschedule(&self) {
        self.inner.wakeup.notify_one();
    }

    /// 当前仍在监视的连接数。
    pub fn len(&self) -> usize {
        self.inner
            .connections
            .lock()
            .iter()
            .filter(|weak| weak.upgrade().is_some_and(|conn| !conn.state().is_closed()))
            .count()
    }

    /// 是否没有任何连接需要监视。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 停止后台任务。
    pub fn destroy(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        self.inner.connections.lock().clear();
    }

    fn snapshot(inner: &MonitorInner) -> (Vec<Connection>, Option<Duration>) {
        let mut live = Vec::new();
        let mut period: Option<Duration> = None;
        inner.connections.lock().retain(|weak| {
            let Some(conn) = weak.upgrade() else {
                return false;
            };
            if conn.state().is_closed() {
                return false;
            }
            let acm = conn.acm();
            if acm.is_enabled() {
                let half = (acm.timeout / 2).max(Duration::from_millis(1));
                period = Some(period.map_or(half, |p| p.min(half)));
                live.push(conn);
            }
            true
        });
        (live, period)
    }
}

async fn run(weak: Weak<MonitorInner>, wakeup: Arc<Notify>) {
    let mut deadline: Option<Instant> = None;
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let (live, period) = AcmMonitor::snapshot(&inner);
        drop(inner);
        let now = Instant::now();
        if deadline.is_some_and(|at| at <= now) {
            for conn in &live {
                conn.monitor(now);
            }
            deadline = None;
        }
        let Some(period) = period else {
            deadline = None;
            wakeup.notified().await;
            continue;
        };
        let at = deadline.map_or(now + period, |at| at.min(now + period));
        deadline = Some(at);
        tokio::select! {
            _ = wakeup.notified() => {}
            _ = tokio::time::sleep_until(at) => {}
        }
    }
}
