#![deny(unsafe_code)]
#![doc = r#"
# spark-rpc-transport

## 设计动机（Why）
- **定位**：定义 spark-rpc 连接层消费的传输能力（建连、接受、读、写、关闭），
  让状态机与具体介质解耦。
- **架构角色**：位于线格式与运行时之间，不依赖编解码 crate；具体实现
  （如 `spark-rpc-transport-tcp`）只需依赖本 crate。

## 核心契约（What）
- [`Transceiver`]/[`Acceptor`]/[`TransportFactory`] 三个对象安全 trait；
- [`Endpoint`] 与 [`EndpointInfo`]：标签化的端点描述与字符串格式；
- [`TransportRegistry`]：按协议名选择实现；
- [`MemoryNetwork`]：进程内内存传输，供测试与同进程回环使用。

## 实现策略（How）
- trait 通过 `async_trait` 暴露异步方法，运行时以 `Arc<dyn Transceiver>` 共享会话；
- 错误统一为 [`TransportError`]，携带稳定错误码、分类与原始 IO 错误。

## 风险与考量（Trade-offs）
- 数据报传输（UDP）只保留端点模型，当前没有随附实现；
- 超时策略由调用方掌握，传输实现只负责建连阶段的端点超时。
"#]

mod endpoint;
mod error;
mod memory;
mod registry;
mod transceiver;

pub use endpoint::{
    BT_ENDPOINT_TYPE, BTS_ENDPOINT_TYPE, DEFAULT_ENDPOINT_TIMEOUT, Endpoint, EndpointInfo,
    IpEndpoint, MEMORY_ENDPOINT_TYPE, SSL_ENDPOINT_TYPE, TCP_ENDPOINT_TYPE, UDP_ENDPOINT_TYPE,
    UdpEndpoint,
};
pub use error::{OperationKind, TransportError, TransportErrorKind, map_io_error, timeout_error};
pub use memory::{DEFAULT_MEMORY_BUFFER, MemoryNetwork, MemoryTransceiver};
pub use registry::TransportRegistry;
pub use transceiver::{Acceptor, TransceiverInfo, TransportFactory, Transceiver};
