#![deny(unsafe_code)]
#![doc = r#"
# spark-rpc-transport-tcp

## 设计动机（Why）
- **定位**：该 crate 提供 spark-rpc 在 Tokio 运行时上的 TCP 传输实现，
  封装监听、建连、读写与关闭等底层细节。
- **架构角色**：实现 `spark-rpc-transport` 的 [`TransportFactory`](spark_rpc_transport::TransportFactory)
  契约，由通信器以协议名 `tcp` 注册。

## 核心契约（What）
- **输入条件**：调用方必须在 Tokio 运行时中使用本实现；
- **输出保障**：所有失败映射为 [`TransportError`](spark_rpc_transport::TransportError)，
  附带稳定错误码（`spark.rpc.transport.tcp.*`）与错误分类；
- **超时**：建连受端点 `-t` 超时约束，读写超时由连接层的 ACM 负责。

## 实现策略（How）
- **执行框架**：完全依赖 Tokio 的 `TcpListener` 与 `TcpStream`，并通过
  `tokio::select!` 将超时、关闭通知与 IO Future 组合；
- **全双工**：会话拆分为读/写两半分别加锁，读任务与发送方互不阻塞；
- **套接字选项**：`SO_LINGER` 与 `TCP_NODELAY` 经 `socket2` 在建连/接受后立即落地。

## 风险与考量（Trade-offs）
- **名称解析**：主机名通过 `tokio::net::lookup_host` 解析，只使用第一个地址；
- **扩展计划**：安全传输可以在本 crate 之上叠加，端点模型已预留 `underlying` 字段。
"#]

mod channel;
mod error;
mod listener;
mod transport;
mod util;

pub use channel::{TcpSocketConfig, TcpTransceiver};
pub use listener::{TcpListener, TcpListenerBuilder};
pub use transport::TcpTransport;
