//! 传输工厂注册表：按协议名选择传输实现。

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};

use crate::{
    endpoint::Endpoint,
    error::{TransportError, TransportErrorKind},
    transceiver::{Acceptor, TransportFactory, Transceiver},
};

const DUPLICATE_CODE: &str = "spark.rpc.transport.duplicate_factory";
const UNSUPPORTED_CODE: &str = "spark.rpc.transport.unsupported";

/// 协议名到传输工厂的映射，由通信器持有。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 端点在构造时已确定协议名，连接与监听只需据此查表，不必了解实现类型；
/// - 注册表是显式对象而非进程级静态表，不同通信器可以装配不同的传输集合。
///
/// ## 契约（What）
/// - `register`：同名协议重复注册返回错误，不会覆盖已有实现；
/// - `connect`/`listen`：协议未注册时返回 [`TransportErrorKind::Unsupported`]。
#[derive(Default, Clone)]
pub struct TransportRegistry {
    factories: Arc<DashMap<&'static str, Arc<dyn TransportFactory>>>,
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut protocols: Vec<_> = self.factories.iter().map(|entry| *entry.key()).collect();
        protocols.sort_unstable();
        f.debug_struct("TransportRegistry")
            .field("protocols", &protocols)
            .finish()
    }
}

impl TransportRegistry {
    /// 创建空注册表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册传输工厂。
    pub fn register(&self, factory: Arc<dyn TransportFactory>) -> Result<(), TransportError> {
        match self.factories.entry(factory.protocol()) {
            Entry::Occupied(entry) => Err(TransportError::new(
                DUPLICATE_CODE,
                TransportErrorKind::Unsupported,
                format!("协议 `{}` 已注册传输实现", entry.key()),
            )),
            Entry::Vacant(entry) => {
                tracing::debug!(
                    target: "spark_rpc::transport",
                    protocol = factory.protocol(),
                    "传输实现已注册"
                );
                entry.insert(factory);
                Ok(())
            }
        }
    }

    /// 注销传输工厂，返回被移除的实现。
    pub fn unregister(&self, protocol: &str) -> Option<Arc<dyn TransportFactory>> {
        self.factories.remove(protocol).map(|(_, factory)| factory)
    }

    /// 查找协议对应的工厂。
    pub fn get(&self, protocol: &str) -> Option<Arc<dyn TransportFactory>> {
        self.factories
            .get(protocol)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// 协议是否已注册。
    pub fn supports(&self, endpoint: &Endpoint) -> bool {
        self.factories.contains_key(endpoint.protocol())
    }

    fn require(&self, endpoint: &Endpoint) -> Result<Arc<dyn TransportFactory>, TransportError> {
        self.get(endpoint.protocol()).ok_or_else(|| {
            TransportError::new(
                UNSUPPORTED_CODE,
                TransportErrorKind::Unsupported,
                format!("没有注册能处理 `{endpoint}` 的传输实现"),
            )
        })
    }

    /// 以端点协议选择工厂并建连。
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transceiver>, TransportError> {
        let factory = self.require(endpoint)?;
        factory.connect(endpoint).await
    }

    /// 以端点协议选择工厂并监听。
    pub async fn listen(&self, endpoint: &Endpoint) -> Result<Box<dyn Acceptor>, TransportError> {
        let factory = self.require(endpoint)?;
        factory.listen(endpoint).await
    }
}
