//! 传输能力契约：建连、接受、读、写、关闭。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 连接层只通过这三个 trait 触达具体介质，TCP、内存或未来的安全传输可以互换；
//! - 所有方法以 `&self` 暴露，读任务与写锁持有者可以并发使用同一个传输对象。
//!
//! ## 契约（What）
//! - [`Transceiver::read`] 返回 0 表示对端已关闭写方向；
//! - [`Transceiver::write`] 写满整个缓冲区后才返回；
//! - [`Transceiver::close`] 关闭本端写方向并拒绝后续读写，可重复调用；
//! - 实现必须允许一次 `read` 与一次 `write` 同时进行。
//!
//! ## 注意事项（Trade-offs）
//! - 借助 `async_trait` 装箱 Future，每次调用多一次堆分配，换取对象安全；
//! - 超时由调用方决定，传输实现只在建连阶段读取端点超时。

use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::{endpoint::Endpoint, error::TransportError};

/// 传输会话的描述信息，用于日志与连接信息查询。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransceiverInfo {
    /// 协议名。
    pub protocol: &'static str,
    /// 本端地址的文本表示。
    pub local: String,
    /// 对端地址的文本表示。
    pub remote: String,
    /// 是否为接受端创建的会话。
    pub incoming: bool,
}

impl fmt::Display for TransceiverInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} local={} remote={}",
            self.protocol, self.local, self.remote
        )
    }
}

/// 一条已建立的字节流会话。
#[async_trait]
pub trait Transceiver: Send + Sync + 'static {
    /// 会话描述。
    fn info(&self) -> TransceiverInfo;

    /// 读取数据到缓冲区，返回读到的字节数；0 表示对端关闭。
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// 将整个缓冲区写出，返回写出的字节数。
    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError>;

    /// 关闭会话。
    async fn close(&self) -> Result<(), TransportError>;
}

/// 监听中的接受器。
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    /// 实际发布的端点（端口 0 已替换为系统分配值）。
    fn endpoint(&self) -> Endpoint;

    /// 等待下一条入站会话。
    async fn accept(&self) -> Result<Arc<dyn Transceiver>, TransportError>;

    /// 停止监听；之后的 `accept` 返回关闭错误。
    async fn close(&self) -> Result<(), TransportError>;
}

/// 按协议名注册的传输工厂。
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    /// 协议名，与 [`Endpoint::protocol`] 对应。
    fn protocol(&self) -> &'static str;

    /// 主动建连；实现需遵守端点上的超时。
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transceiver>, TransportError>;

    /// 在端点上开始监听。
    async fn listen(&self, endpoint: &Endpoint) -> Result<Box<dyn Acceptor>, TransportError>;
}
