//! 连接：一条对端会话的生命周期状态机。
//!
//! # 教案定位（Why）
//! - 一条连接按请求编号多路复用调用与回复，并把入站请求派发给对象适配器；
//! - 所有终止路径最终汇聚到同一个 `finish`：只保存第一个关闭原因，关闭回调恰好触发一次。
//!
//! # 状态（What）
//! ```text
//! Validating ──握手成功──▶ Active ──close / ACM 空闲 / 收到关闭通知──▶ Closing ──▶ Closed
//!      └────────────────────握手失败 / 传输失败 / 强制关闭───────────────────────────▲
//! ```
//! - `Closing`：不再接受新的出站请求，已发出的请求可按配置继续等待回复；
//! - `Closed`：终态，之后所有使用都返回 [`RpcError::ConnectionClosed`] 并携带保存的原因。
//!
//! # 并发模型（How）
//! - 出站帧经一把 FIFO 异步锁串行写出，调用方只在取锁与写出期间挂起，不会在等待回复时持锁；
//! - 每条连接一个读任务，按帧类型分流：回复按编号唤醒调用方，请求派发到独立任务执行；
//! - 用户回调（关闭、心跳）与定位器钩子只在释放状态锁与写锁之后调用。
//!
//! # 风险与考量（Trade-offs）
//! - 收发任意帧（含心跳）都会刷新活跃时间，因此 `Always` 心跳会让空闲关闭永远不触发；
//! - 关闭通知发出后若对端迟迟不断开，`close_timeout` 到期后强制拆除传输。

mod acm;
mod batch;

pub use acm::{AcmCloseAction, AcmDecision, AcmMonitor, AcmSnapshot, evaluate};

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use spark_rpc_transport::{
    Endpoint, OperationKind, TransceiverInfo, Transceiver, TransportError, timeout_error,
};
use spark_rpc_wire::{ENCODING_1_0, InputStream, OutputStream};
use tokio::sync::{Mutex as AsyncMutex, Notify, oneshot, watch};
use tokio::time::Instant;

use crate::adapter::ObjectAdapter;
use crate::config::{
    AcmClose, AcmConfig, AcmHeartbeat, CompressBatch, GracefulInFlight, RpcConfig,
};
use crate::error::{CloseReason, RpcError, RpcResult};
use crate::invocation::Cancellable;
use crate::protocol::{
    CompressionStatus, Frame, MessageType, Reply, ReplyBody, Request, finish_message,
    header_only, read_batch, read_frame, start_message,
};

use batch::BatchQueue;

const VALIDATE: OperationKind = OperationKind {
    code: "spark.rpc.connection.validate_timeout",
    message: "connection validate",
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 连接状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// 握手进行中。
    Validating,
    /// 可收发请求。
    Active,
    /// 关闭进行中。
    Closing,
    /// 已关闭。
    Closed,
}

impl ConnectionState {
    /// 是否为终态。
    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }
}

/// 手动关闭方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseMode {
    /// 立即拆除传输，不通知对端。
    Forcefully,
    /// 发送关闭通知；本端分发全部结束后才发出，调用方不等待自己的未决调用。
    Gracefully,
    /// 先等待本端全部未决调用完成，再走优雅关闭。
    GracefullyWithWait,
}

/// 关闭回调。
pub type CloseCallback = Arc<dyn Fn(&Connection, &CloseReason) + Send + Sync>;
/// 心跳回调。
pub type HeartbeatCallback = Arc<dyn Fn(&Connection) + Send + Sync>;

/// 单条连接的运行参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// ACM 配置。
    pub acm: AcmConfig,
    /// 单帧上限。
    pub message_size_max: usize,
    /// 批量自动冲刷阈值。
    pub batch_auto_flush_size: usize,
    /// 批量压缩策略。
    pub compress_batch: CompressBatch,
    /// 优雅关闭等待上限。
    pub close_timeout: Duration,
    /// 优雅关闭时未决调用的处理方式。
    pub graceful_in_flight: GracefulInFlight,
}

impl ConnectionSettings {
    /// 出站连接参数。
    pub fn client(config: &RpcConfig) -> Self {
        Self::with_acm(config, config.client_acm)
    }

    /// 入站连接参数。
    pub fn server(config: &RpcConfig) -> Self {
        Self::with_acm(config, config.server_acm)
    }

    fn with_acm(config: &RpcConfig, acm: AcmConfig) -> Self {
        Self {
            acm,
            message_size_max: config.message_size_max,
            batch_auto_flush_size: config.batch_auto_flush_size,
            compress_batch: config.compress_batch,
            close_timeout: config.close_timeout,
            graceful_in_flight: config.graceful_in_flight,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::client(&RpcConfig::default())
    }
}

/// 一条对端会话。
///
/// 句柄可廉价克隆，所有克隆共享同一状态；比较相等即比较是否为同一条连接。
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

#[derive(Clone, Debug)]
pub(crate) struct WeakConnection(Weak<ConnectionInner>);

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|inner| Connection { inner })
    }
}

struct ConnectionInner {
    id: u64,
    transceiver: Arc<dyn Transceiver>,
    endpoint: Endpoint,
    info: TransceiverInfo,
    settings: ConnectionSettings,
    shared: Mutex<Shared>,
    send_lock: AsyncMutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    drained: Notify,
    adapter: RwLock<Option<ObjectAdapter>>,
    monitor: Mutex<Option<AcmMonitor>>,
}

struct Shared {
    phase: ConnectionState,
    reason: Option<CloseReason>,
    next_request_id: i32,
    pending: HashMap<i32, oneshot::Sender<RpcResult<ReplyBody>>>,
    dispatch_count: usize,
    closing_started: bool,
    close_sent: bool,
    acm: AcmConfig,
    last_activity: Instant,
    batch: BatchQueue,
    close_callback: Option<CloseCallback>,
    heartbeat_callback: Option<HeartbeatCallback>,
}

impl Connection {
    /// 在已建立的传输会话上完成握手并启动读任务。
    ///
    /// # 教案级注释
    ///
    /// ## 契约（What）
    /// - 入站会话（`transceiver.info().incoming`）先发送校验连接消息；
    ///   出站会话等待对端的校验连接消息，二者都受端点超时约束；
    /// - `adapter`：入站请求的派发目标；为 `None` 时所有请求得到“对象不存在”回复；
    /// - 成功返回的连接处于 `Active`；握手失败时传输已关闭，错误原样返回。
    pub async fn establish(
        transceiver: Arc<dyn Transceiver>,
        endpoint: Endpoint,
        settings: ConnectionSettings,
        adapter: Option<ObjectAdapter>,
    ) -> RpcResult<Connection> {
        let info = transceiver.info();
        let (state_tx, _) = watch::channel(ConnectionState::Validating);
        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                transceiver,
                endpoint,
                info,
                shared: Mutex::new(Shared {
                    phase: ConnectionState::Validating,
                    reason: None,
                    next_request_id: 1,
                    pending: HashMap::new(),
                    dispatch_count: 0,
                    closing_started: false,
                    close_sent: false,
                    acm: settings.acm,
                    last_activity: Instant::now(),
                    batch: BatchQueue::default(),
                    close_callback: None,
                    heartbeat_callback: None,
                }),
                settings,
                send_lock: AsyncMutex::new(()),
                state_tx,
                drained: Notify::new(),
                adapter: RwLock::new(adapter),
                monitor: Mutex::new(None),
            }),
        };

        let handshake = connection.validate();
        let result = match connection.inner.endpoint.timeout() {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .unwrap_or_else(|_| Err(RpcError::Transport(timeout_error(VALIDATE)))),
            None => handshake.await,
        };
        if let Err(err) = result {
            connection.finish(reason_for(&err));
            return Err(err);
        }

        {
            let mut shared = connection.inner.shared.lock();
            shared.phase = ConnectionState::Active;
            shared.last_activity = Instant::now();
        }
        connection
            .inner
            .state_tx
            .send_replace(ConnectionState::Active);
        tracing::debug!(
            target: "spark_rpc::connection",
            id = connection.inner.id,
            info = %connection.inner.info,
            "连接已建立"
        );
        tokio::spawn(connection.clone().read_loop());
        Ok(connection)
    }

    async fn validate(&self) -> RpcResult<()> {
        if self.inner.info.incoming {
            return self
                .send_frame(header_only(MessageType::ValidateConnection)?)
                .await;
        }
        let frame = read_frame(
            self.inner.transceiver.as_ref(),
            self.inner.settings.message_size_max,
        )
        .await?;
        match frame {
            Some(frame) if frame.kind == MessageType::ValidateConnection => {
                if frame.body.is_empty() {
                    Ok(())
                } else {
                    Err(RpcError::Protocol("校验连接消息不应携带消息体".into()))
                }
            }
            Some(frame) => Err(RpcError::Protocol(format!(
                "握手阶段期望校验连接消息，收到 {:?}",
                frame.kind
            ))),
            None => Err(RpcError::Transport(TransportError::closed(
                "握手阶段对端断开",
            ))),
        }
    }

    /// 进程内唯一编号。
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// 建立连接所用的端点。
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// 传输会话描述。
    pub fn info(&self) -> &TransceiverInfo {
        &self.inner.info
    }

    /// 是否由对端发起。
    pub fn is_incoming(&self) -> bool {
        self.inner.info.incoming
    }

    /// 当前状态。
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().phase
    }

    /// 保存的关闭原因；连接仍在使用时为 `None`。
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.shared.lock().reason.clone()
    }

    /// 等待连接进入 `Closed`，返回关闭原因。
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.inner.state_tx.subscribe();
        // 发送端随连接存活，等待不会因通道关闭而失败。
        let _ = rx.wait_for(|state| state.is_closed()).await;
        self.close_reason()
            .unwrap_or(CloseReason::ApplicationClosed { graceful: false })
    }

    /// 当前未决调用数。
    pub fn pending_count(&self) -> usize {
        self.inner.shared.lock().pending.len()
    }

    /// 当前进行中的分发任务数。
    pub fn dispatch_count(&self) -> usize {
        self.inner.shared.lock().dispatch_count
    }

    /// 批量队列中的请求数。
    pub fn batch_request_count(&self) -> usize {
        self.inner.shared.lock().batch.count()
    }

    /// 当前 ACM 配置。
    pub fn acm(&self) -> AcmConfig {
        self.inner.shared.lock().acm
    }

    /// 覆盖 ACM 配置的部分字段。
    pub fn set_acm(
        &self,
        timeout: Option<Duration>,
        close: Option<AcmClose>,
        heartbeat: Option<AcmHeartbeat>,
    ) {
        {
            let mut shared = self.inner.shared.lock();
            if let Some(timeout) = timeout {
                shared.acm.timeout = timeout;
            }
            if let Some(close) = close {
                shared.acm.close = close;
            }
            if let Some(heartbeat) = heartbeat {
                shared.acm.heartbeat = heartbeat;
            }
        }
        if let Some(monitor) = self.inner.monitor.lock().clone() {
            monitor.reschedule();
        }
    }

    /// 入站请求的派发目标。
    pub fn adapter(&self) -> Option<ObjectAdapter> {
        self.inner.adapter.read().clone()
    }

    /// 设置入站请求的派发目标，用于双向连接。
    pub fn set_adapter(&self, adapter: Option<ObjectAdapter>) {
        *self.inner.adapter.write() = adapter;
    }

    /// 设置关闭回调；连接已关闭时立即以保存的原因调用。
    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: Fn(&Connection, &CloseReason) + Send + Sync + 'static,
    {
        let callback: CloseCallback = Arc::new(callback);
        let fire_now = {
            let mut shared = self.inner.shared.lock();
            if shared.phase.is_closed() {
                shared.reason.clone()
            } else {
                shared.close_callback = Some(Arc::clone(&callback));
                None
            }
        };
        if let Some(reason) = fire_now {
            callback(self, &reason);
        }
    }

    /// 设置心跳回调，每收到一次对端心跳调用一次。
    pub fn set_heartbeat_callback<F>(&self, callback: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.inner.shared.lock().heartbeat_callback = Some(Arc::new(callback));
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.inner))
    }

    pub(crate) fn attach_monitor(&self, monitor: &AcmMonitor) {
        *self.inner.monitor.lock() = Some(monitor.clone());
        monitor.add(self);
    }

    /// 发送一次双向调用并等待回复。
    pub async fn invoke(&self, request: Request, compress: bool) -> RpcResult<ReplyBody> {
        self.send_request(request, compress).await?.wait().await
    }

    /// 发送一次双向调用，返回可取消的等待。
    ///
    /// 取消只放弃本地等待并移除挂起表项，服务端的分发不受影响。
    pub fn invoke_cancellable(&self, request: Request, compress: bool) -> Cancellable<ReplyBody> {
        let connection = self.clone();
        Cancellable::new(async move { connection.invoke(request, compress).await })
    }

    pub(crate) async fn send_request(
        &self,
        mut request: Request,
        compress: bool,
    ) -> RpcResult<PendingReply> {
        let (tx, rx) = oneshot::channel();
        let request_id = {
            let mut shared = self.inner.shared.lock();
            self.check_accepting(&shared)?;
            let mut id = shared.next_request_id;
            while shared.pending.contains_key(&id) {
                id = next_id(id);
            }
            shared.next_request_id = next_id(id);
            shared.pending.insert(id, tx);
            id
        };
        let pending = PendingReply {
            connection: self.clone(),
            request_id,
            rx,
        };
        request.request_id = request_id;
        let mut out = start_message(MessageType::Request);
        request.write(&mut out, true);
        let frame = self.check_size(finish_message(out, compress)?)?;
        self.send_frame(frame).await?;
        tracing::trace!(
            target: "spark_rpc::connection",
            id = self.inner.id,
            request_id,
            operation = %request.operation,
            "请求已发送"
        );
        Ok(pending)
    }

    /// 发送单向请求，写出后即返回。
    pub async fn invoke_oneway(&self, mut request: Request, compress: bool) -> RpcResult<()> {
        self.check_accepting(&self.inner.shared.lock())?;
        request.request_id = 0;
        let mut out = start_message(MessageType::Request);
        request.write(&mut out, true);
        let frame = self.check_size(finish_message(out, compress)?)?;
        self.send_frame(frame).await
    }

    /// 将请求加入批量队列；队列将超过自动冲刷阈值时先冲刷已有请求。
    pub async fn queue_batch_request(&self, request: &Request, compress: bool) -> RpcResult<()> {
        let mut out = OutputStream::with_encoding(ENCODING_1_0);
        request.write(&mut out, false);
        let encoded = out.into_bytes();
        let flush = {
            let mut shared = self.inner.shared.lock();
            self.check_accepting(&shared)?;
            let flush = if shared
                .batch
                .would_overflow(encoded.len(), self.inner.settings.batch_auto_flush_size)
            {
                shared.batch.take(self.inner.settings.compress_batch)?
            } else {
                None
            };
            shared.batch.push(&encoded, compress);
            flush
        };
        if let Some((count, frame)) = flush {
            tracing::trace!(target: "spark_rpc::connection", id = self.inner.id, count, "批量队列自动冲刷");
            self.send_frame(self.check_size(frame)?).await?;
        }
        Ok(())
    }

    /// 冲刷批量队列，作为一帧 `BatchRequest` 写出。
    pub async fn flush_batch_requests(&self) -> RpcResult<()> {
        let flush = {
            let mut shared = self.inner.shared.lock();
            if shared.phase.is_closed() {
                return Err(self.closed_error_locked(&shared));
            }
            shared.batch.take(self.inner.settings.compress_batch)?
        };
        if let Some((count, frame)) = flush {
            self.send_frame(self.check_size(frame)?).await?;
            tracing::trace!(target: "spark_rpc::connection", id = self.inner.id, count, "批量请求已冲刷");
        }
        Ok(())
    }

    /// 可取消的批量冲刷。
    pub fn flush_batch_requests_cancellable(&self) -> Cancellable<()> {
        let connection = self.clone();
        Cancellable::new(async move { connection.flush_batch_requests().await })
    }

    /// 立即发送一次心跳。
    pub async fn heartbeat(&self) -> RpcResult<()> {
        self.check_accepting(&self.inner.shared.lock())?;
        self.send_frame(header_only(MessageType::ValidateConnection)?)
            .await
    }

    /// 可取消的心跳。
    pub fn heartbeat_cancellable(&self) -> Cancellable<()> {
        let connection = self.clone();
        Cancellable::new(async move { connection.heartbeat().await })
    }

    /// 关闭连接。
    ///
    /// # 教案级注释
    ///
    /// ## 契约（What）
    /// - `Forcefully`：立即进入 `Closed`，原因为应用强制关闭；
    /// - `Gracefully`：进入 `Closing` 并立即返回；按 `graceful_in_flight` 决定未决调用立即失败还是继续等待；
    ///   后台任务冲刷批量队列、等待本端分发结束后发送关闭通知，再等待对端断开；
    /// - `GracefullyWithWait`：进入 `Closing`，阻塞到本端全部未决调用完成，再走优雅关闭；
    /// - 重复关闭是安全的：只有第一次进入 `Closing` 会启动关闭流程。
    pub async fn close(&self, mode: CloseMode) {
        match mode {
            CloseMode::Forcefully => self.finish(CloseReason::ApplicationClosed { graceful: false }),
            CloseMode::Gracefully => {
                self.close_gracefully(CloseReason::ApplicationClosed { graceful: true });
            }
            CloseMode::GracefullyWithWait => {
                let started =
                    self.begin_closing(CloseReason::ApplicationClosed { graceful: true }, false);
                self.wait_until(|shared| shared.pending.is_empty() || shared.phase.is_closed())
                    .await;
                if started {
                    tokio::spawn(self.clone().initiate_shutdown());
                }
            }
        }
    }

    /// 以指定原因发起优雅关闭，不等待；适配器停用与通信器销毁走这条路径。
    pub(crate) fn close_gracefully(&self, reason: CloseReason) {
        let fail_pending = self.inner.settings.graceful_in_flight == GracefulInFlight::Fail;
        if self.begin_closing(reason, fail_pending) {
            tokio::spawn(self.clone().initiate_shutdown());
        }
    }

    fn check_accepting(&self, shared: &Shared) -> RpcResult<()> {
        match shared.phase {
            ConnectionState::Active => Ok(()),
            _ => Err(self.closed_error_locked(shared)),
        }
    }

    fn closed_error_locked(&self, shared: &Shared) -> RpcError {
        RpcError::ConnectionClosed(
            shared
                .reason
                .clone()
                .unwrap_or(CloseReason::ApplicationClosed { graceful: true }),
        )
    }

    fn closed_error(&self) -> RpcError {
        self.closed_error_locked(&self.inner.shared.lock())
    }

    fn check_size(&self, frame: Bytes) -> RpcResult<Bytes> {
        let max = self.inner.settings.message_size_max;
        if frame.len() > max {
            return Err(RpcError::MessageTooLarge {
                size: frame.len(),
                max,
            });
        }
        Ok(frame)
    }

    fn touch(&self) {
        self.inner.shared.lock().last_activity = Instant::now();
    }

    async fn send_frame(&self, frame: Bytes) -> RpcResult<()> {
        let mut state_rx = self.inner.state_tx.subscribe();
        let result = {
            let _guard = self.inner.send_lock.lock().await;
            if self.state().is_closed() {
                return Err(self.closed_error());
            }
            tokio::select! {
                biased;
                _ = state_rx.wait_for(|state| state.is_closed()) => return Err(self.closed_error()),
                result = self.inner.transceiver.write(&frame) => result,
            }
        };
        // 写锁已释放：`finish` 会调用关闭回调。
        match result {
            Ok(_) => {
                self.touch();
                Ok(())
            }
            Err(cause) => {
                self.finish(CloseReason::TransportAborted { cause });
                Err(self.closed_error())
            }
        }
    }

    async fn wait_until<F>(&self, condition: F)
    where
        F: Fn(&Shared) -> bool,
    {
        loop {
            let notified = self.inner.drained.notified();
            if condition(&self.inner.shared.lock()) {
                return;
            }
            notified.await;
        }
    }

    fn begin_closing(&self, reason: CloseReason, fail_pending: bool) -> bool {
        let (failed, reason) = {
            let mut shared = self.inner.shared.lock();
            if shared.phase.is_closed() || shared.closing_started {
                return false;
            }
            shared.closing_started = true;
            shared.phase = ConnectionState::Closing;
            let reason = shared.reason.get_or_insert(reason).clone();
            let failed = if fail_pending {
                std::mem::take(&mut shared.pending)
            } else {
                HashMap::new()
            };
            (failed, reason)
        };
        self.inner.state_tx.send_replace(ConnectionState::Closing);
        tracing::debug!(target: "spark_rpc::connection", id = self.inner.id, %reason, "连接开始关闭");
        fail_all(failed, &reason);
        self.inner.drained.notify_waiters();
        true
    }

    async fn initiate_shutdown(self) {
        if let Err(err) = self.flush_batch_requests().await {
            tracing::debug!(target: "spark_rpc::connection", id = self.inner.id, error = %err, "关闭前冲刷批量请求失败");
            self.finish(reason_for(&err));
            return;
        }
        self.wait_until(|shared| shared.dispatch_count == 0 || shared.phase.is_closed())
            .await;
        if self.state().is_closed() {
            return;
        }
        self.inner.shared.lock().close_sent = true;
        let sent = match header_only(MessageType::CloseConnection) {
            Ok(frame) => self.send_frame(frame).await,
            Err(err) => Err(err),
        };
        if let Err(err) = sent {
            tracing::debug!(target: "spark_rpc::connection", id = self.inner.id, error = %err, "关闭通知发送失败");
            self.finish(reason_for(&err));
            return;
        }
        let timeout = self.inner.settings.close_timeout;
        if tokio::time::timeout(timeout, self.closed()).await.is_err() {
            tracing::warn!(
                target: "spark_rpc::connection",
                id = self.inner.id,
                timeout_ms = timeout.as_millis() as u64,
                "对端未在关闭超时内断开，强制关闭"
            );
            self.finish(CloseReason::ApplicationClosed { graceful: true });
        }
    }

    /// 终止连接，幂等；未决调用以保存的原因失败。
    pub(crate) fn finish(&self, reason: CloseReason) {
        let (pending, callback, reason) = {
            let mut shared = self.inner.shared.lock();
            if shared.phase.is_closed() {
                return;
            }
            let reason = shared.reason.get_or_insert(reason).clone();
            shared.phase = ConnectionState::Closed;
            shared.batch.clear();
            (
                std::mem::take(&mut shared.pending),
                shared.close_callback.take(),
                reason,
            )
        };
        self.inner.state_tx.send_replace(ConnectionState::Closed);
        fail_all(pending, &reason);
        self.inner.drained.notify_waiters();
        *self.inner.adapter.write() = None;

        let transceiver = Arc::clone(&self.inner.transceiver);
        let id = self.inner.id;
        tokio::spawn(async move {
            if let Err(err) = transceiver.close().await {
                tracing::debug!(target: "spark_rpc::connection", id, error = %err, "关闭传输失败");
            }
        });
        tracing::debug!(target: "spark_rpc::connection", id, %reason, "连接已关闭");
        if let Some(callback) = callback {
            callback(self, &reason);
        }
    }

    async fn read_loop(self) {
        let mut state_rx = self.inner.state_tx.subscribe();
        let transceiver = Arc::clone(&self.inner.transceiver);
        let max = self.inner.settings.message_size_max;
        loop {
            let frame = tokio::select! {
                biased;
                _ = state_rx.wait_for(|state| state.is_closed()) => return,
                frame = read_frame(transceiver.as_ref(), max) => frame,
            };
            let outcome = match frame {
                Ok(Some(frame)) => {
                    self.touch();
                    self.handle_frame(frame, &mut state_rx).await
                }
                Ok(None) => {
                    self.finish(CloseReason::TransportAborted {
                        cause: TransportError::closed("对端未发送关闭通知即断开"),
                    });
                    return;
                }
                Err(err) => Err(err),
            };
            if let Err(err) = outcome {
                tracing::debug!(target: "spark_rpc::connection", id = self.inner.id, error = %err, "读取失败，拆除连接");
                self.finish(reason_for(&err));
                return;
            }
        }
    }

    async fn handle_frame(
        &self,
        frame: Frame,
        state_rx: &mut watch::Receiver<ConnectionState>,
    ) -> RpcResult<()> {
        match frame.kind {
            MessageType::Reply => {
                let reply = Reply::read(&mut InputStream::new(&frame.body))?;
                self.deliver_reply(reply);
            }
            MessageType::Request => {
                let request = Request::read(&mut InputStream::new(&frame.body), true)?;
                self.dispatch(vec![request], frame.compression, state_rx)
                    .await;
            }
            MessageType::BatchRequest => {
                let requests = read_batch(&frame.body)?;
                self.dispatch(requests, frame.compression, state_rx).await;
            }
            MessageType::ValidateConnection => {
                if !frame.body.is_empty() {
                    return Err(RpcError::Protocol("心跳消息不应携带消息体".into()));
                }
                let callback = self.inner.shared.lock().heartbeat_callback.clone();
                if let Some(callback) = callback {
                    callback(self);
                }
            }
            MessageType::CloseConnection => {
                tokio::spawn(self.clone().on_peer_close());
            }
        }
        Ok(())
    }

    fn deliver_reply(&self, reply: Reply) {
        let (sender, drained) = {
            let mut shared = self.inner.shared.lock();
            let sender = shared.pending.remove(&reply.request_id);
            (sender, shared.pending.is_empty())
        };
        if drained {
            self.inner.drained.notify_waiters();
        }
        match sender {
            // 接收端已丢弃表示调用方放弃等待。
            Some(tx) => {
                let _ = tx.send(Ok(reply.body));
            }
            None => tracing::trace!(
                target: "spark_rpc::connection",
                id = self.inner.id,
                request_id = reply.request_id,
                "回复对应的调用已不在等待"
            ),
        }
    }

    async fn dispatch(
        &self,
        requests: Vec<Request>,
        compression: CompressionStatus,
        state_rx: &mut watch::Receiver<ConnectionState>,
    ) {
        let adapter = self.adapter();
        if let Some(adapter) = &adapter {
            // 适配器 Holding 时停止读取后续请求。
            tokio::select! {
                biased;
                _ = state_rx.wait_for(|state| state.is_closed()) => return,
                _ = adapter.wait_ready() => {}
            }
        }
        {
            let mut shared = self.inner.shared.lock();
            if shared.phase != ConnectionState::Active {
                tracing::trace!(
                    target: "spark_rpc::connection",
                    id = self.inner.id,
                    count = requests.len(),
                    "连接正在关闭，忽略入站请求"
                );
                return;
            }
            shared.dispatch_count += 1;
        }
        let guard = DispatchGuard(self.clone());
        tokio::spawn(async move {
            let connection = guard.0.clone();
            let compress = compression != CompressionStatus::None;
            for request in requests {
                let request_id = request.request_id;
                let body = match &adapter {
                    Some(adapter) => AssertUnwindSafe(adapter.dispatch(request, Some(connection.clone())))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            ReplyBody::Unknown(format!("分发任务 panic：{}", panic_message(&*panic)))
                        }),
                    None => ReplyBody::ObjectNotExist {
                        identity: request.identity,
                        facet: request.facet,
                        operation: request.operation,
                    },
                };
                if request_id != 0 {
                    connection.send_reply(request_id, body, compress).await;
                }
            }
            drop(guard);
        });
    }

    async fn send_reply(&self, request_id: i32, body: ReplyBody, compress: bool) {
        let encode = |body: ReplyBody| {
            let mut out = start_message(MessageType::Reply);
            Reply { request_id, body }.write(&mut out);
            finish_message(out, compress)
        };
        let max = self.inner.settings.message_size_max;
        let frame = match encode(body) {
            Ok(frame) if frame.len() > max => encode(ReplyBody::UnknownLocal(format!(
                "回复大小 {} 超过上限 {max}",
                frame.len()
            ))),
            other => other,
        };
        let result = match frame {
            Ok(frame) => self.send_frame(frame).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            tracing::debug!(target: "spark_rpc::connection", id = self.inner.id, request_id, error = %err, "回复发送失败");
        }
    }

    fn dispatch_finished(&self) {
        let idle = {
            let mut shared = self.inner.shared.lock();
            shared.dispatch_count = shared.dispatch_count.saturating_sub(1);
            shared.dispatch_count == 0
        };
        if idle {
            self.inner.drained.notify_waiters();
        }
    }

    async fn on_peer_close(self) {
        let (pending, reason) = {
            let mut shared = self.inner.shared.lock();
            if shared.phase.is_closed() {
                return;
            }
            shared.closing_started = true;
            shared.phase = ConnectionState::Closing;
            let reason = shared.reason.get_or_insert(CloseReason::PeerClosed).clone();
            (std::mem::take(&mut shared.pending), reason)
        };
        self.inner.state_tx.send_replace(ConnectionState::Closing);
        tracing::debug!(target: "spark_rpc::connection", id = self.inner.id, "收到对端关闭通知");
        fail_all(pending, &reason);
        self.inner.drained.notify_waiters();
        self.wait_until(|shared| shared.dispatch_count == 0 || shared.phase.is_closed())
            .await;
        self.finish(CloseReason::PeerClosed);
    }

    /// ACM 周期检查；只读取快照，心跳与关闭以异步任务执行。
    pub(crate) fn monitor(&self, now: Instant) {
        let (acm, snapshot) = {
            let shared = self.inner.shared.lock();
            if shared.phase != ConnectionState::Active {
                return;
            }
            (
                shared.acm,
                AcmSnapshot {
                    idle: now.saturating_duration_since(shared.last_activity),
                    has_pending: !shared.pending.is_empty(),
                    dispatching: shared.dispatch_count > 0,
                    batched: !shared.batch.is_empty(),
                },
            )
        };
        let decision = evaluate(&acm, &snapshot);
        if decision.heartbeat {
            let connection = self.clone();
            tokio::spawn(async move {
                if let Err(err) = connection.heartbeat().await {
                    tracing::debug!(target: "spark_rpc::acm", id = connection.inner.id, error = %err, "心跳发送失败");
                }
            });
        }
        match decision.close {
            Some(AcmCloseAction::Forceful) => {
                let reason = if snapshot.has_pending {
                    CloseReason::PeerUnresponsive
                } else {
                    CloseReason::IdleTimeout
                };
                tracing::debug!(target: "spark_rpc::acm", id = self.inner.id, %reason, "ACM 强制关闭连接");
                self.finish(reason);
            }
            Some(AcmCloseAction::Graceful) => {
                tracing::debug!(target: "spark_rpc::acm", id = self.inner.id, "ACM 空闲关闭连接");
                if self.begin_closing(CloseReason::IdleTimeout, true) {
                    tokio::spawn(self.clone().initiate_shutdown());
                }
            }
            None => {}
        }
    }

    fn remove_pending(&self, request_id: i32) {
        let drained = {
            let mut shared = self.inner.shared.lock();
            shared.pending.remove(&request_id).is_some() && shared.pending.is_empty()
        };
        if drained {
            self.inner.drained.notify_waiters();
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("info", &self.inner.info)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Debug for ConnectionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInner")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// 等待中的双向调用；丢弃时移除挂起表项。
pub(crate) struct PendingReply {
    connection: Connection,
    request_id: i32,
    rx: oneshot::Receiver<RpcResult<ReplyBody>>,
}

impl PendingReply {
    pub(crate) async fn wait(mut self) -> RpcResult<ReplyBody> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(self.connection.closed_error()),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.connection.remove_pending(self.request_id);
    }
}

struct DispatchGuard(Connection);

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.0.dispatch_finished();
    }
}

fn next_id(id: i32) -> i32 {
    if id == i32::MAX { 1 } else { id + 1 }
}

fn fail_all(pending: HashMap<i32, oneshot::Sender<RpcResult<ReplyBody>>>, reason: &CloseReason) {
    for (_, tx) in pending {
        let _ = tx.send(Err(RpcError::ConnectionClosed(reason.clone())));
    }
}

fn reason_for(err: &RpcError) -> CloseReason {
    match err {
        RpcError::Transport(cause) => CloseReason::TransportAborted {
            cause: cause.clone(),
        },
        RpcError::ConnectionClosed(reason) => reason.clone(),
        other => CloseReason::ProtocolViolation {
            message: other.to_string(),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "未知 panic".to_owned())
}
