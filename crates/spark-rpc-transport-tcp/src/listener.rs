use crate::{
    TcpSocketConfig, TcpTransceiver,
    error::{self, BIND},
    util::{resolve, tcp_fields},
};
use async_trait::async_trait;
use spark_rpc_transport::{Acceptor, Endpoint, Transceiver, TransportError, map_io_error};
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{net::TcpListener as TokioTcpListener, sync::Notify};

/// 对 Tokio `TcpListener` 的语义封装。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 在不暴露 Tokio 具体类型的前提下，提供“监听 → 接受会话”的最小能力，
///   并以 [`Acceptor`] 契约交给对象适配器使用。
///
/// ## 逻辑 (How)
/// - `bind`：解析端点主机并调用 Tokio 绑定，端口 0 时记录系统实际分配的端口；
/// - `accept`：与关闭通知竞争，成功后将 `TcpStream` 包装为 [`TcpTransceiver`]；
/// - `endpoint`：返回替换了实际端口的端点，供适配器生成代理。
///
/// ## 契约 (What)
/// - **前置条件**：调用方必须在 Tokio 运行时中使用该监听器；
/// - **后置条件**：`close` 之后的 `accept` 立即返回关闭错误，正在等待的 `accept` 被唤醒。
///
/// ## 注意事项 (Trade-offs)
/// - 当前实现未支持 `SO_REUSEPORT` 等高级套接字选项，后续可在绑定前扩展；
/// - 监听套接字在对象被丢弃时才真正释放。
#[derive(Debug)]
pub struct TcpListener {
    inner: TokioTcpListener,
    local_addr: SocketAddr,
    endpoint: Endpoint,
    default_config: TcpSocketConfig,
    closed: AtomicBool,
    shutdown: Notify,
}

impl TcpListener {
    /// 在端点上监听。
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, TransportError> {
        Self::bind_with_config(endpoint, TcpSocketConfig::default()).await
    }

    /// 在端点上监听并设置新会话的默认套接字配置。
    ///
    /// # 教案级注释
    ///
    /// ## 契约（What）
    /// - `endpoint`：`tcp` 端点，空主机表示所有接口；
    /// - `default_config`：后续 `accept` 应用的 [`TcpSocketConfig`]；
    /// - **后置条件**：[`TcpListener::default_socket_config`] 返回的配置即为传入值。
    ///
    /// ## 逻辑（How）
    /// - 解析主机后调用 Tokio `bind`；
    /// - 读取实际绑定地址，替换端点端口后缓存。
    pub async fn bind_with_config(
        endpoint: &Endpoint,
        default_config: TcpSocketConfig,
    ) -> Result<Self, TransportError> {
        let addr = resolve(tcp_fields(endpoint)?, true).await?;
        let listener = TokioTcpListener::bind(addr)
            .await
            .map_err(|err| map_io_error(BIND, err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| map_io_error(BIND, err))?;
        tracing::debug!(target: "spark_rpc::transport", %local_addr, "tcp 监听已启动");
        Ok(Self {
            inner: listener,
            local_addr,
            endpoint: endpoint.clone().with_port(local_addr.port()),
            default_config,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// 返回监听器实际绑定的地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 读取监听器为后续 `accept` 预设的默认套接字配置。
    pub fn default_socket_config(&self) -> &TcpSocketConfig {
        &self.default_config
    }

    /// 接受一条入站会话，应用默认套接字配置。
    pub async fn accept_session(&self) -> Result<TcpTransceiver, TransportError> {
        self.accept_with_config(self.default_config.clone()).await
    }

    /// 接受一条入站会话，并指定套接字配置。
    pub async fn accept_with_config(
        &self,
        config: TcpSocketConfig,
    ) -> Result<TcpTransceiver, TransportError> {
        let closed =
            || TransportError::closed(format!("tcp accept: {} 已停止监听", self.local_addr));
        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);
        if self.closed.load(Ordering::Acquire) {
            return Err(closed());
        }
        tokio::select! {
            biased;
            _ = &mut shutdown => Err(closed()),
            accepted = self.inner.accept() => {
                let (stream, remote) = accepted.map_err(|err| map_io_error(error::ACCEPT, err))?;
                tracing::trace!(target: "spark_rpc::transport", %remote, "tcp 会话已接受");
                TcpTransceiver::from_stream(stream, config, true)
            }
        }
    }
}

#[async_trait]
impl Acceptor for TcpListener {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn accept(&self) -> Result<Arc<dyn Transceiver>, TransportError> {
        let session = self.accept_session().await?;
        Ok(Arc::new(session))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
        Ok(())
    }
}

/// `TcpListener` 的建造器，实现介质选项的下沉配置。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - `new`：以监听端点创建 Builder，默认配置等同于 [`TcpSocketConfig::default`]；
/// - `with_default_socket_config`：显式替换默认配置；
/// - `with_linger`：常见的快捷设置；
/// - `build`：调用 [`TcpListener::bind_with_config`]。
///
/// ## 风险提示（Trade-offs）
/// - Builder 被消费后无法复用，若需不同配置请分别构建。
#[derive(Clone, Debug)]
pub struct TcpListenerBuilder {
    endpoint: Endpoint,
    default_config: TcpSocketConfig,
}

impl TcpListenerBuilder {
    /// 基于监听端点创建 Builder。
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            default_config: TcpSocketConfig::default(),
        }
    }

    /// 覆盖默认的套接字配置。
    pub fn with_default_socket_config(mut self, config: TcpSocketConfig) -> Self {
        self.default_config = config;
        self
    }

    /// 便捷设置 `SO_LINGER`。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.default_config = self.default_config.clone().with_linger(linger);
        self
    }

    /// 绑定监听器。
    pub async fn build(self) -> Result<TcpListener, TransportError> {
        TcpListener::bind_with_config(&self.endpoint, self.default_config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 验证 `TcpListenerBuilder` 能够将自定义的 `linger` 配置写入监听器默认配置。
    #[tokio::test(flavor = "multi_thread")]
    async fn builder_applies_default_config() {
        let linger = Some(Duration::from_secs(2));
        let listener = TcpListenerBuilder::new(Endpoint::tcp("127.0.0.1", 0))
            .with_linger(linger)
            .build()
            .await
            .expect("build listener");

        assert_eq!(listener.default_socket_config().linger(), linger);
        assert_ne!(listener.local_addr().port(), 0);
        assert_eq!(
            listener.endpoint().info().ip().map(|ip| ip.port),
            Some(listener.local_addr().port())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_wakes_pending_accept() {
        let listener = Arc::new(
            TcpListener::bind(&Endpoint::tcp("127.0.0.1", 0))
                .await
                .expect("bind"),
        );
        let waiter = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept_session().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        Acceptor::close(listener.as_ref()).await.expect("close");
        let result = waiter.await.expect("join");
        assert_eq!(
            result.err().map(|err| err.kind()),
            Some(spark_rpc_transport::TransportErrorKind::Closed)
        );
    }
}
