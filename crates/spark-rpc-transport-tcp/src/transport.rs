use crate::{TcpListener, TcpSocketConfig, TcpTransceiver};
use async_trait::async_trait;
use spark_rpc_transport::{Acceptor, Endpoint, Transceiver, TransportError, TransportFactory};
use std::sync::Arc;

/// `tcp` 协议的传输工厂。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 运行时只通过 [`TransportFactory`] 按协议名取用传输实现；本类型把
///   [`TcpTransceiver::connect`] 与 [`TcpListener::bind_with_config`] 接到该契约上。
///
/// ## 契约（What）
/// - `connect`：遵守端点超时，新会话应用工厂持有的 [`TcpSocketConfig`]；
/// - `listen`：返回的接受器把同一配置作为默认套接字配置。
#[derive(Clone, Debug, Default)]
pub struct TcpTransport {
    config: TcpSocketConfig,
}

impl TcpTransport {
    /// 使用默认套接字配置。
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定新会话的套接字配置。
    pub fn with_socket_config(config: TcpSocketConfig) -> Self {
        Self { config }
    }

    /// 当前套接字配置。
    pub fn socket_config(&self) -> &TcpSocketConfig {
        &self.config
    }
}

#[async_trait]
impl TransportFactory for TcpTransport {
    fn protocol(&self) -> &'static str {
        "tcp"
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transceiver>, TransportError> {
        let session = TcpTransceiver::connect(endpoint, self.config.clone()).await?;
        Ok(Arc::new(session))
    }

    async fn listen(&self, endpoint: &Endpoint) -> Result<Box<dyn Acceptor>, TransportError> {
        let listener = TcpListener::bind_with_config(endpoint, self.config.clone()).await?;
        Ok(Box::new(listener))
    }
}
