#![deny(unsafe_code)]
#![doc = r#"
# spark-rpc

## 设计动机（Why）
- **定位**：面向对象 RPC 运行时。客户端持有位置无关的代理，服务端在对象适配器中
  注册服务对象，二者之间是带 ACM 的长连接与紧凑的二进制协议帧。
- **架构角色**：建立在 `spark-rpc-wire`（线格式与切片引擎）与
  `spark-rpc-transport`（传输能力）之上，默认装配 `spark-rpc-transport-tcp`。

## 核心契约（What）
- [`Communicator`]：根对象，拥有配置、类型上下文、传输注册表、连接池、适配器与间接解析缓存；
- [`Connection`]：`Validating → Active → Closing → Closed` 状态机，处理请求编号分配、
  未决调用表、批量队列、心跳与三种关闭模式；
- [`AcmMonitor`]：通信器级共享定时任务，按 [`AcmConfig`] 执行空闲关闭与心跳；
- [`ObjectAdapter`]：ASM、默认服务对象与服务对象定位器三张注册表，按固定顺序解析分发；
- [`RouterInfo`]/[`LocatorInfo`]：间接代理的端点缓存；
- [`Proxy`]：引用 + 通信器，按固定、路由、直接、间接顺序解析连接并发起调用。

## 实现策略（How）
- 每条连接一个读任务，分发以任务形式执行，出站帧由 FIFO 异步锁串行化；
- 回调与定位器钩子只在释放运行时锁之后调用；
- 取消只作用于本地等待（[`CancelHandle`]），不会传播到服务端。

## 风险与考量（Trade-offs）
- 只随附 TCP 与进程内内存传输；UDP、安全与蓝牙端点只保留端点模型；
- 压缩使用 deflate，帧小于 100 字节时从不压缩；
- 优雅关闭时未决调用的处理方式由 [`GracefulInFlight`] 配置。
"#]

mod adapter;
mod communicator;
mod config;
mod connection;
mod error;
mod identity;
mod indirection;
mod invocation;
pub mod protocol;
mod proxy;
mod reference;

pub use adapter::{
    AdapterState, Cookie, Current, DispatchError, FnServant, ObjectAdapter, Servant,
    ServantLocator,
};
pub use communicator::{Communicator, CommunicatorBuilder};
pub use config::{
    AcmClose, AcmConfig, AcmHeartbeat, CompressBatch, GracefulInFlight, RpcConfig,
};
pub use connection::{
    AcmCloseAction, AcmDecision, AcmMonitor, AcmSnapshot, CloseCallback, CloseMode, Connection,
    ConnectionSettings, ConnectionState, HeartbeatCallback, evaluate,
};
pub use error::{CloseReason, ErrorCategory, RpcError, RpcResult};
pub use identity::Identity;
pub use indirection::{
    Locator, LocatorInfo, LocatorManager, RemoteLocator, RemoteRouter, Router, RouterInfo,
    RouterManager,
};
pub use invocation::{CancelHandle, Cancellable};
pub use protocol::{Context, OperationMode};
pub use proxy::Proxy;
pub use reference::{InvocationMode, Reference, Target};

pub use spark_rpc_transport as transport;
pub use spark_rpc_wire as wire;
