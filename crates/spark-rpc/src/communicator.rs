//! 通信器：运行时的根对象。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 配置、类型上下文、传输注册表、ACM 监视器、出站连接池、对象适配器以及
//!   路由器/定位器缓存都归通信器所有，不存在进程级全局表；
//! - 同一端点的出站连接被复用；并发建连由端点粒度的异步锁串行化。
//!
//! ## 契约（What）
//! - [`CommunicatorBuilder::build`] 校验配置并默认注册 TCP 传输；
//! - [`Communicator::destroy`] 幂等：销毁所有适配器，优雅关闭出站连接并等待其结束，
//!   之后任何建连或创建适配器的请求返回 [`RpcError::CommunicatorDestroyed`]；
//! - 默认路由器与默认定位器作用于此后由通信器创建的代理。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use parking_lot::Mutex;
use spark_rpc_transport::{Endpoint, MemoryNetwork, TransportFactory, TransportRegistry};
use spark_rpc_transport_tcp::TcpTransport;
use spark_rpc_wire::{FactoryRegistry, TypeRegistry, WireContext};
use tokio::sync::Mutex as AsyncMutex;

use crate::adapter::ObjectAdapter;
use crate::config::RpcConfig;
use crate::connection::{AcmMonitor, Connection, ConnectionSettings, ConnectionState};
use crate::error::{CloseReason, RpcError, RpcResult};
use crate::indirection::{LocatorInfo, LocatorManager, RouterInfo, RouterManager};
use crate::indirection::{remote_locator, remote_router};
use crate::proxy::Proxy;
use crate::reference::Reference;

type ConnectionSlot = Arc<AsyncMutex<Option<Connection>>>;

/// 通信器构建器。
pub struct CommunicatorBuilder {
    config: RpcConfig,
    types: TypeRegistry,
    factories: FactoryRegistry,
    transports: Vec<Arc<dyn TransportFactory>>,
    tcp: bool,
}

impl Default for CommunicatorBuilder {
    fn default() -> Self {
        Self {
            config: RpcConfig::default(),
            types: TypeRegistry::new(),
            factories: FactoryRegistry::new(),
            transports: Vec::new(),
            tcp: true,
        }
    }
}

impl CommunicatorBuilder {
    /// 使用默认配置。
    pub fn new() -> Self {
        Self::default()
    }

    /// 替换配置。
    pub fn with_config(mut self, config: RpcConfig) -> Self {
        self.config = config;
        self
    }

    /// 类型描述符表。
    pub fn with_types(mut self, types: TypeRegistry) -> Self {
        self.types = types;
        self
    }

    /// 实例工厂表。
    pub fn with_factories(mut self, factories: FactoryRegistry) -> Self {
        self.factories = factories;
        self
    }

    /// 追加传输实现。
    pub fn with_transport(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transports.push(factory);
        self
    }

    /// 注册进程内内存网络。
    pub fn with_memory_network(self, network: MemoryNetwork) -> Self {
        self.with_transport(Arc::new(network))
    }

    /// 不注册默认的 TCP 传输。
    pub fn without_tcp(mut self) -> Self {
        self.tcp = false;
        self
    }

    /// 校验配置并构建通信器。
    pub fn build(self) -> RpcResult<Communicator> {
        self.config.validate()?;
        let registry = TransportRegistry::new();
        if self.tcp {
            registry.register(Arc::new(TcpTransport::new()))?;
        }
        for factory in self.transports {
            registry.register(factory)?;
        }
        let wire = WireContext::new(self.types, self.factories)
            .with_class_graph_depth_max(self.config.class_graph_depth_max)
            .with_slice_values(self.config.slice_values)
            .shared();
        tracing::debug!(target: "spark_rpc::communicator", transports = ?registry, "通信器已创建");
        Ok(Communicator {
            inner: Arc::new(CommunicatorInner {
                config: self.config,
                wire,
                transports: registry,
                monitor: AcmMonitor::new(),
                connections: DashMap::new(),
                adapters: Mutex::new(HashMap::new()),
                routers: RouterManager::new(),
                locators: LocatorManager::new(),
                default_router: ArcSwapOption::empty(),
                default_locator: ArcSwapOption::empty(),
                destroyed: AtomicBool::new(false),
            }),
        })
    }
}

struct CommunicatorInner {
    config: RpcConfig,
    wire: Arc<WireContext>,
    transports: TransportRegistry,
    monitor: AcmMonitor,
    connections: DashMap<Endpoint, ConnectionSlot>,
    adapters: Mutex<HashMap<String, ObjectAdapter>>,
    routers: RouterManager,
    locators: LocatorManager,
    default_router: ArcSwapOption<Reference>,
    default_locator: ArcSwapOption<Reference>,
    destroyed: AtomicBool,
}

/// 通信器句柄；克隆共享同一通信器。
#[derive(Clone)]
pub struct Communicator {
    inner: Arc<CommunicatorInner>,
}

/// 不阻止通信器释放的弱句柄。
#[derive(Clone, Debug)]
pub(crate) struct WeakCommunicator(Weak<CommunicatorInner>);

impl WeakCommunicator {
    pub(crate) fn upgrade(&self) -> Option<Communicator> {
        self.0.upgrade().map(|inner| Communicator { inner })
    }
}

impl Communicator {
    /// 以默认配置构建，等价于 `CommunicatorBuilder::new().build()`。
    pub fn new() -> RpcResult<Self> {
        CommunicatorBuilder::new().build()
    }

    /// 构建器。
    pub fn builder() -> CommunicatorBuilder {
        CommunicatorBuilder::new()
    }

    /// 运行配置。
    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    /// 解码类实例使用的类型上下文。
    pub fn wire_context(&self) -> Arc<WireContext> {
        Arc::clone(&self.inner.wire)
    }

    /// 传输注册表。
    pub fn transports(&self) -> &TransportRegistry {
        &self.inner.transports
    }

    /// 共享的 ACM 监视器。
    pub fn monitor(&self) -> AcmMonitor {
        self.inner.monitor.clone()
    }

    pub(crate) fn downgrade(&self) -> WeakCommunicator {
        WeakCommunicator(Arc::downgrade(&self.inner))
    }

    /// 是否已销毁。
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    fn check_alive(&self) -> RpcResult<()> {
        if self.is_destroyed() {
            return Err(RpcError::CommunicatorDestroyed);
        }
        Ok(())
    }

    // ---- 代理 ----

    /// 解析字符串形式的代理。
    pub fn string_to_proxy(&self, text: &str) -> RpcResult<Proxy> {
        let reference = Reference::parse_with(text, self.inner.config.default_encoding)?;
        Ok(self.create_proxy(reference))
    }

    /// 以引用创建代理，附带默认路由器与默认定位器。
    pub fn create_proxy(&self, reference: Reference) -> Proxy {
        let router = self
            .inner
            .default_router
            .load_full()
            .map(|router| self.router_info(&router));
        let locator = self
            .inner
            .default_locator
            .load_full()
            .map(|locator| self.locator_info(&locator));
        Proxy::new(self.clone(), reference, router, locator)
    }

    /// 设置默认路由器；`None` 取消。
    pub fn set_default_router(&self, router: Option<&Proxy>) {
        self.inner
            .default_router
            .store(router.map(|proxy| Arc::new(proxy.reference().clone())));
    }

    /// 默认路由器引用。
    pub fn default_router(&self) -> Option<Reference> {
        self.inner.default_router.load_full().map(|r| (*r).clone())
    }

    /// 设置默认定位器；`None` 取消。
    pub fn set_default_locator(&self, locator: Option<&Proxy>) {
        self.inner
            .default_locator
            .store(locator.map(|proxy| Arc::new(proxy.reference().clone())));
    }

    /// 默认定位器引用。
    pub fn default_locator(&self) -> Option<Reference> {
        self.inner.default_locator.load_full().map(|r| (*r).clone())
    }

    /// 取得路由器引用对应的缓存信息。
    pub fn router_info(&self, router: &Reference) -> RouterInfo {
        self.inner
            .routers
            .get_or_insert_with(&router.identity, || remote_router(router, self.downgrade()))
    }

    /// 取得定位器引用对应的缓存信息。
    pub fn locator_info(&self, locator: &Reference) -> LocatorInfo {
        let ttl = self.inner.config.locator_cache_timeout;
        self.inner.locators.get_or_insert_with(&locator.identity, || {
            LocatorInfo::new(remote_locator(locator, self.downgrade()), ttl)
        })
    }

    // ---- 适配器 ----

    /// 在给定端点上创建对象适配器；名称为空时生成 UUID 名称。
    pub async fn create_object_adapter(
        &self,
        name: &str,
        endpoints: &[Endpoint],
    ) -> RpcResult<ObjectAdapter> {
        self.register_adapter(name, endpoints, None).await
    }

    /// 创建经路由器接收请求的对象适配器。
    pub async fn create_object_adapter_with_router(
        &self,
        name: &str,
        router: &Proxy,
    ) -> RpcResult<ObjectAdapter> {
        let info = self.router_info(router.reference());
        self.register_adapter(name, &[], Some(info)).await
    }

    async fn register_adapter(
        &self,
        name: &str,
        endpoints: &[Endpoint],
        router: Option<RouterInfo>,
    ) -> RpcResult<ObjectAdapter> {
        self.check_alive()?;
        let name = if name.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            name.to_owned()
        };
        if self.inner.adapters.lock().contains_key(&name) {
            return Err(RpcError::already_registered("object adapter", name));
        }
        let adapter = ObjectAdapter::create(self, &name, endpoints, router).await?;
        let conflict = {
            let mut adapters = self.inner.adapters.lock();
            if adapters.contains_key(&name) || self.is_destroyed() {
                true
            } else {
                adapters.insert(name.clone(), adapter.clone());
                false
            }
        };
        if conflict {
            adapter.deactivate().await;
            return Err(if self.is_destroyed() {
                RpcError::CommunicatorDestroyed
            } else {
                RpcError::already_registered("object adapter", name)
            });
        }
        Ok(adapter)
    }

    /// 按名称查找适配器。
    pub fn find_object_adapter(&self, name: &str) -> Option<ObjectAdapter> {
        self.inner.adapters.lock().get(name).cloned()
    }

    pub(crate) fn remove_adapter(&self, name: &str) {
        self.inner.adapters.lock().remove(name);
    }

    // ---- 连接 ----

    /// 依次尝试端点，返回第一条可用连接；同一端点上的活动连接被复用。
    pub(crate) async fn get_connection(&self, endpoints: &[Endpoint]) -> RpcResult<Connection> {
        self.check_alive()?;
        let mut last_error = None;
        for endpoint in endpoints {
            match self.connect_endpoint(endpoint).await {
                Ok(connection) => return Ok(connection),
                Err(err) => {
                    tracing::debug!(
                        target: "spark_rpc::communicator",
                        endpoint = %endpoint,
                        error = %err,
                        "端点建连失败，尝试下一个"
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| RpcError::NoEndpoint("端点列表为空".into())))
    }

    async fn connect_endpoint(&self, endpoint: &Endpoint) -> RpcResult<Connection> {
        let slot = Arc::clone(&self.inner.connections.entry(endpoint.clone()).or_default());
        let mut slot = slot.lock().await;
        if let Some(connection) = slot.as_ref()
            && connection.state() == ConnectionState::Active
        {
            return Ok(connection.clone());
        }
        self.check_alive()?;
        let transceiver = self.inner.transports.connect(endpoint).await?;
        let connection = Connection::establish(
            transceiver,
            endpoint.clone(),
            ConnectionSettings::client(&self.inner.config),
            None,
        )
        .await?;
        connection.attach_monitor(&self.inner.monitor);
        *slot = Some(connection.clone());
        Ok(connection)
    }

    /// 当前活动的出站连接。
    pub fn connections(&self) -> Vec<Connection> {
        let slots: Vec<ConnectionSlot> = self
            .inner
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        slots
            .iter()
            .filter_map(|slot| slot.try_lock().ok().and_then(|slot| slot.clone()))
            .filter(|connection| connection.state() == ConnectionState::Active)
            .collect()
    }

    /// 冲刷所有出站连接的批量队列；单条连接失败只记录日志。
    pub async fn flush_batch_requests(&self) {
        for connection in self.connections() {
            if let Err(err) = connection.flush_batch_requests().await {
                tracing::debug!(
                    target: "spark_rpc::communicator",
                    connection = connection.id(),
                    error = %err,
                    "冲刷批量队列失败"
                );
            }
        }
    }

    /// 销毁通信器；幂等。
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let adapters: Vec<ObjectAdapter> = self.inner.adapters.lock().drain().map(|(_, a)| a).collect();
        for adapter in &adapters {
            adapter.destroy().await;
        }

        let slots: Vec<ConnectionSlot> = self
            .inner
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.inner.connections.clear();
        let mut closing = Vec::new();
        for slot in slots {
            if let Some(connection) = slot.lock().await.take() {
                connection.close_gracefully(CloseReason::CommunicatorDestroyed);
                closing.push(connection);
            }
        }
        for connection in closing {
            connection.closed().await;
        }

        self.inner.monitor.destroy();
        self.inner.routers.destroy();
        self.inner.locators.destroy();
        self.inner.default_router.store(None);
        self.inner.default_locator.store(None);
        tracing::debug!(target: "spark_rpc::communicator", "通信器已销毁");
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("transports", &self.inner.transports)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}
