//! 可取消的异步操作：Future 与取消句柄成对返回。
//!
//! # 教案定位（Why）
//! - 调用、批量冲刷、心跳都可能长时间挂起；调用方需要一个与 Future 分离的句柄，
//!   以便在其他任务中放弃等待；
//! - 取消只作用于本地：放弃等待回复并不会撤销服务端已开始的分发。
//!
//! # 使用契约（What）
//! - [`CancelHandle::cancel`] 首次调用返回 `true`，之后返回 `false`；
//! - [`Cancellable`] 实现 `IntoFuture`，被取消时以 [`RpcError::InvocationCanceled`] 结束；
//! - 丢弃 `Cancellable` 等价于取消：内部 Future 的析构负责清理挂起表项。

use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::error::{RpcError, RpcResult};

/// 取消句柄，可克隆，所有副本共享同一取消位。
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    /// 创建处于“未取消”状态的句柄。
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否已取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 标记取消并唤醒等待者；首次触发返回 `true`。
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// 等待取消发生。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// 与取消句柄绑定的异步操作。
pub struct Cancellable<T> {
    future: BoxFuture<'static, RpcResult<T>>,
    handle: CancelHandle,
}

impl<T> Cancellable<T> {
    /// 以新句柄包装 Future。
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = RpcResult<T>> + Send + 'static,
    {
        Self {
            future: Box::pin(future),
            handle: CancelHandle::new(),
        }
    }

    /// 取消句柄；可在 `await` 之前克隆并交给其他任务。
    pub fn handle(&self) -> CancelHandle {
        self.handle.clone()
    }
}

impl<T> fmt::Debug for Cancellable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellable")
            .field("cancelled", &self.handle.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> IntoFuture for Cancellable<T> {
    type Output = RpcResult<T>;
    type IntoFuture = BoxFuture<'static, RpcResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        let Cancellable { future, handle } = self;
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = handle.cancelled() => Err(RpcError::InvocationCanceled),
                result = future => result,
            }
        })
    }
}

/// 在可选超时内执行 Future，超时返回 [`RpcError::InvocationTimeout`]。
pub(crate) async fn run_with_timeout<F, T>(timeout: Option<Duration>, future: F) -> RpcResult<T>
where
    F: Future<Output = RpcResult<T>>,
{
    tokio::pin!(future);
    match timeout {
        Some(limit) => {
            let sleep = tokio::time::sleep(limit);
            tokio::pin!(sleep);
            tokio::select! {
                biased;
                result = &mut future => result,
                _ = &mut sleep => Err(RpcError::InvocationTimeout),
            }
        }
        None => future.await,
    }
}
