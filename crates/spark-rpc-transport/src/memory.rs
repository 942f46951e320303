//! 进程内内存传输：以 `tokio::io::duplex` 模拟字节流会话。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 连接状态机、ACM 与分发路径的集成测试不应依赖真实套接字；
//! - 同一进程内的客户端与服务端也可以直接通过命名监听互通。
//!
//! ## 逻辑（How）
//! - [`MemoryNetwork`] 维护“监听名 → 待接受队列”的映射；
//! - `connect` 创建一对 duplex 流，把服务端一半投递到监听队列，客户端一半直接返回；
//! - 每个会话的读写半部分别上锁，读与写可以同时进行。
//!
//! ## 注意事项（Trade-offs）
//! - duplex 的缓冲区有上限，写方在缓冲区满时挂起，等价于 TCP 的发送窗口背压；
//! - 接受器被丢弃时自动注销监听名。

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf},
    sync::{Mutex as AsyncMutex, mpsc},
};

use crate::{
    endpoint::{Endpoint, EndpointInfo},
    error::{OperationKind, TransportError, TransportErrorKind, map_io_error},
    transceiver::{Acceptor, TransceiverInfo, TransportFactory, Transceiver},
};

const CONNECT: OperationKind = OperationKind {
    code: "spark.rpc.transport.memory.connect_failed",
    message: "memory connect",
};
const LISTEN: OperationKind = OperationKind {
    code: "spark.rpc.transport.memory.listen_failed",
    message: "memory listen",
};
const READ: OperationKind = OperationKind {
    code: "spark.rpc.transport.memory.read_failed",
    message: "memory read",
};
const WRITE: OperationKind = OperationKind {
    code: "spark.rpc.transport.memory.write_failed",
    message: "memory write",
};
const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.rpc.transport.memory.shutdown_failed",
    message: "memory shutdown",
};

/// 默认 duplex 缓冲区大小。
pub const DEFAULT_MEMORY_BUFFER: usize = 64 * 1024;
const ACCEPT_BACKLOG: usize = 64;

type PendingStream = (DuplexStream, String);

#[derive(Debug)]
struct MemoryNetworkInner {
    listeners: DashMap<String, (u64, mpsc::Sender<PendingStream>)>,
    buffer_size: usize,
    next_id: AtomicU64,
}

/// 进程内命名网络，同时实现 [`TransportFactory`]。
#[derive(Clone, Debug)]
pub struct MemoryNetwork {
    inner: Arc<MemoryNetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// 使用默认缓冲区创建网络。
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_MEMORY_BUFFER)
    }

    /// 指定每个方向的 duplex 缓冲区大小。
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(MemoryNetworkInner {
                listeners: DashMap::new(),
                buffer_size: buffer_size.max(1),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// 名称当前是否有监听者。
    pub fn is_listening(&self, name: &str) -> bool {
        self.inner.listeners.contains_key(name)
    }

    fn name_of(endpoint: &Endpoint, kind: OperationKind) -> Result<&str, TransportError> {
        match endpoint.info() {
            EndpointInfo::Memory { name } => Ok(name),
            _ => Err(TransportError::new(
                kind.code,
                TransportErrorKind::InvalidEndpoint,
                format!("{}: `{endpoint}` 不是内存端点", kind.message),
            )),
        }
    }
}

#[async_trait]
impl TransportFactory for MemoryNetwork {
    fn protocol(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transceiver>, TransportError> {
        let name = Self::name_of(endpoint, CONNECT)?;
        let refused = || {
            TransportError::new(
                CONNECT.code,
                TransportErrorKind::Refused,
                format!("memory connect: 没有名为 `{name}` 的监听者"),
            )
        };
        let sender = self
            .inner
            .listeners
            .get(name)
            .map(|entry| entry.value().1.clone())
            .ok_or_else(refused)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let client_label = format!("memory-client-{id}");
        let (client, server) = tokio::io::duplex(self.inner.buffer_size);
        sender
            .send((server, client_label.clone()))
            .await
            .map_err(|_| refused())?;
        tracing::trace!(target: "spark_rpc::transport", %name, client = %client_label, "内存会话已建立");
        Ok(Arc::new(MemoryTransceiver::new(
            client,
            client_label,
            name.to_owned(),
            false,
        )))
    }

    async fn listen(&self, endpoint: &Endpoint) -> Result<Box<dyn Acceptor>, TransportError> {
        let name = Self::name_of(endpoint, LISTEN)?.to_owned();
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        match self.inner.listeners.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(TransportError::new(
                    LISTEN.code,
                    TransportErrorKind::AddrInUse,
                    format!("memory listen: 名称 `{name}` 已被占用"),
                ));
            }
            Entry::Vacant(entry) => {
                entry.insert((id, tx));
            }
        }
        Ok(Box::new(MemoryAcceptor {
            name,
            id,
            endpoint: endpoint.clone(),
            incoming: AsyncMutex::new(rx),
            network: Arc::clone(&self.inner),
        }))
    }
}

/// 内存监听器。
#[derive(Debug)]
struct MemoryAcceptor {
    name: String,
    id: u64,
    endpoint: Endpoint,
    incoming: AsyncMutex<mpsc::Receiver<PendingStream>>,
    network: Arc<MemoryNetworkInner>,
}

impl MemoryAcceptor {
    fn unregister(&self) {
        self.network
            .listeners
            .remove_if(&self.name, |_, (id, _)| *id == self.id);
    }
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn accept(&self) -> Result<Arc<dyn Transceiver>, TransportError> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some((stream, remote)) => Ok(Arc::new(MemoryTransceiver::new(
                stream,
                self.name.clone(),
                remote,
                true,
            ))),
            None => Err(TransportError::closed(format!(
                "memory accept: 监听 `{}` 已关闭",
                self.name
            ))),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.unregister();
        self.incoming.lock().await.close();
        Ok(())
    }
}

impl Drop for MemoryAcceptor {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// 基于 duplex 流的会话。
#[derive(Debug)]
pub struct MemoryTransceiver {
    reader: AsyncMutex<ReadHalf<DuplexStream>>,
    writer: AsyncMutex<WriteHalf<DuplexStream>>,
    closed: AtomicBool,
    info: TransceiverInfo,
}

impl MemoryTransceiver {
    fn new(stream: DuplexStream, local: String, remote: String, incoming: bool) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            closed: AtomicBool::new(false),
            info: TransceiverInfo {
                protocol: "memory",
                local,
                remote,
                incoming,
            },
        }
    }

    /// 直接构造一对互联会话，便于单元测试绕过监听流程。
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(DEFAULT_MEMORY_BUFFER);
        (
            Self::new(a, "pair-a".into(), "pair-b".into(), false),
            Self::new(b, "pair-b".into(), "pair-a".into(), true),
        )
    }

    fn ensure_open(&self, kind: OperationKind) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed(format!("{}: 会话已关闭", kind.message)));
        }
        Ok(())
    }
}

#[async_trait]
impl Transceiver for MemoryTransceiver {
    fn info(&self) -> TransceiverInfo {
        self.info.clone()
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.ensure_open(READ)?;
        let mut reader = self.reader.lock().await;
        reader.read(buf).await.map_err(|err| map_io_error(READ, err))
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        self.ensure_open(WRITE)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_all(buf)
            .await
            .map(|_| buf.len())
            .map_err(|err| map_io_error(WRITE, err))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
            Err(err) => Err(map_io_error(SHUTDOWN, err)),
        }
    }
}
