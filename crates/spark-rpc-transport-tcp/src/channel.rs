use crate::{
    error::{self, CONFIGURE},
    util::{resolve, run_with_timeout, tcp_fields},
};
use async_trait::async_trait;
use socket2::SockRef;
use spark_rpc_transport::{Endpoint, TransceiverInfo, Transceiver, TransportError, map_io_error};
use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream as TokioTcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex as AsyncMutex,
};

/// TCP 套接字级配置项，实现对内核行为的显式控制。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将“关闭时等待多久后以 RST 释放资源”与“是否关闭 Nagle 算法”两项策略显式配置化，
///   避免调用方直接操作 `socket2`；
/// - RPC 帧通常较小且对时延敏感，默认开启 `TCP_NODELAY`。
///
/// ## 契约（What）
/// - `with_linger`：`Some(dur)` 表示 `close`/`drop` 后 `dur` 内未发完即发送 RST；`None` 沿用内核默认；
/// - `with_nodelay`：是否设置 `TCP_NODELAY`；
/// - **前置条件**：调用 `apply` 前 `TokioTcpStream` 必须已成功创建；
/// - **后置条件**：`apply` 返回 `Ok(())` 时套接字选项已落地。
///
/// ## 设计取舍与注意事项（Trade-offs）
/// - `SO_LINGER` 在 Linux 上取整到秒，测试需选择合适的超时；
/// - 过小的 linger 可能丢弃发送缓冲区中的数据并触发对端 `ECONNRESET`。
#[derive(Clone, Debug)]
pub struct TcpSocketConfig {
    linger: Option<Duration>,
    nodelay: bool,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSocketConfig {
    /// 创建默认配置：`linger = None`，`nodelay = true`。
    pub const fn new() -> Self {
        Self {
            linger: None,
            nodelay: true,
        }
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    /// 设置 `TCP_NODELAY`。
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// 读取当前配置的超时时长。
    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    /// 读取 `TCP_NODELAY` 配置。
    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    fn apply(&self, stream: &TokioTcpStream) -> io::Result<()> {
        let sock = SockRef::from(stream);
        sock.set_linger(self.linger)?;
        stream.set_nodelay(self.nodelay)
    }
}

/// 一条 TCP 会话，读写半部分别加锁以支持全双工。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 连接层的读任务长期阻塞在 `read` 上，写方必须能同时发送请求与心跳；
///   因此不再以一把互斥锁包裹整个 `TcpStream`，而是拆成读/写两半。
///
/// ## 逻辑 (How)
/// - 构造时先通过 `socket2` 写入 [`TcpSocketConfig`]，再调用 `into_split`；
/// - `close` 对写半部执行 `shutdown` 发送 FIN，并标记会话关闭；之后的读写立即失败。
///
/// ## 契约 (What)
/// - `read`：一次读取，返回 0 表示对端 FIN；
/// - `write`：写满缓冲区后返回；
/// - `close`：幂等。
#[derive(Debug)]
pub struct TcpTransceiver {
    reader: AsyncMutex<OwnedReadHalf>,
    writer: AsyncMutex<OwnedWriteHalf>,
    closed: AtomicBool,
    config: TcpSocketConfig,
    info: TransceiverInfo,
}

impl TcpTransceiver {
    pub(crate) fn from_stream(
        stream: TokioTcpStream,
        config: TcpSocketConfig,
        incoming: bool,
    ) -> Result<Self, TransportError> {
        config
            .apply(&stream)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let local = stream
            .local_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let peer = stream
            .peer_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            closed: AtomicBool::new(false),
            config,
            info: TransceiverInfo {
                protocol: "tcp",
                local: local.to_string(),
                remote: peer.to_string(),
                incoming,
            },
        })
    }

    /// 按端点建立连接，端点超时同时约束解析与建连。
    ///
    /// # 教案级注释
    ///
    /// ## 契约（What）
    /// - `endpoint`：必须是 `tcp` 端点，空主机表示本机回环；
    /// - `config`：应用到新连接的 [`TcpSocketConfig`]；
    /// - **后置条件**：成功返回的会话已应用配置并可立即读写。
    ///
    /// ## 实现逻辑（How）
    /// - 通过 `run_with_timeout` 把建连过程与端点超时绑定；
    /// - 失败时错误码覆盖“解析失败”“连接失败”“配置失败”三类。
    pub async fn connect(
        endpoint: &Endpoint,
        config: TcpSocketConfig,
    ) -> Result<Self, TransportError> {
        let ip = tcp_fields(endpoint)?;
        let addr = resolve(ip, false).await?;
        let stream = run_with_timeout(
            error::CONNECT,
            endpoint.timeout(),
            TokioTcpStream::connect(addr),
        )
        .await?;
        tracing::debug!(target: "spark_rpc::transport", %addr, "tcp 连接已建立");
        Self::from_stream(stream, config, false)
    }

    /// 返回构造时使用的套接字配置。
    pub fn config(&self) -> &TcpSocketConfig {
        &self.config
    }

    /// 查询底层套接字当前的 `SO_LINGER` 设置。
    pub async fn linger(&self) -> Result<Option<Duration>, TransportError> {
        let guard = self.writer.lock().await;
        let stream: &TokioTcpStream = (*guard).as_ref();
        SockRef::from(stream)
            .linger()
            .map_err(|err| map_io_error(CONFIGURE, err))
    }

    fn ensure_open(&self, message: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed(format!("{message}: 会话已关闭")));
        }
        Ok(())
    }
}

#[async_trait]
impl Transceiver for TcpTransceiver {
    fn info(&self) -> TransceiverInfo {
        self.info.clone()
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.ensure_open(error::READ.message)?;
        let mut guard = self.reader.lock().await;
        guard
            .read(buf)
            .await
            .map_err(|err| map_io_error(error::READ, err))
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        self.ensure_open(error::WRITE.message)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let mut guard = self.writer.lock().await;
        guard
            .write_all(buf)
            .await
            .map(|_| buf.len())
            .map_err(|err| map_io_error(error::WRITE, err))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut guard = self.writer.lock().await;
        match AsyncWriteExt::shutdown(&mut *guard).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(map_io_error(error::SHUTDOWN, err)),
        }
    }
}
