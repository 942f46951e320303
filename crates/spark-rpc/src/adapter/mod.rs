//! 对象适配器：监听端点、持有服务对象注册表并把入站请求分发给服务对象。
//!
//! # 教案定位（Why）
//! - 适配器是服务端的入口：接受器产生入站连接，连接把请求交给适配器，
//!   适配器按固定顺序解析服务对象并执行；
//! - 生命周期 `NotActivated → Active ⇄ Holding → Deactivating → Deactivated → Destroyed`
//!   决定请求是否被读取、是否被接受以及等待者何时解除阻塞。
//!
//! # 使用契约（What）
//! - `hold` 后连接停止读取新请求，已经开始的分发不受影响；`activate` 恢复；
//! - `deactivate` 单向：关闭接受器，优雅关闭入站连接，进行中的分发全部结束后进入
//!   `Deactivated` 并唤醒 [`ObjectAdapter::wait_for_deactivate`]；
//! - `destroy` 隐含停用，随后清空注册表并调用定位器的 `deactivate`；重复调用无副作用；
//! - 定位器路径上，`locate` 成功后 `finished` 恰好调用一次，分发 Future 被丢弃时同样如此。
//!
//! # 实现要点（How）
//! - 状态与进行中分发计数放在同一个 `watch` 通道里，准入检查与计数递增是一次原子修改，
//!   停用与准入之间不存在竞态；
//! - 接受循环只持有适配器的弱引用，适配器释放后循环自然退出。

mod manager;
mod servant;

pub use servant::{
    Cookie, Current, DispatchError, FnServant, Servant, ServantLocator,
};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use spark_rpc_transport::{Acceptor, Endpoint, TransportErrorKind, Transceiver};
use spark_rpc_wire::{FormatType, InputStream, OutputStream, WireContext};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::communicator::{Communicator, WeakCommunicator};
use crate::connection::{AcmMonitor, Connection, ConnectionSettings};
use crate::error::{CloseReason, RpcError, RpcResult};
use crate::identity::Identity;
use crate::indirection::RouterInfo;
use crate::protocol::{ReplyBody, Request};
use crate::proxy::Proxy;
use crate::reference::Reference;

use manager::{Resolved, ServantManager};
use servant::LocatorGuard;

/// 接受失败（非关闭）后重试前的等待。
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// 适配器生命周期状态，按推进顺序排列。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AdapterState {
    /// 已创建，尚未激活；请求在连接上排队。
    NotActivated,
    /// 正常分发。
    Active,
    /// 暂停读取新请求。
    Holding,
    /// 已停用，等待进行中的分发结束。
    Deactivating,
    /// 停用完成。
    Deactivated,
    /// 注册表已释放。
    Destroyed,
}

#[derive(Clone, Copy, Debug)]
struct Status {
    state: AdapterState,
    in_flight: usize,
}

#[derive(Default)]
struct Lifecycle {
    acceptors: Vec<Arc<dyn Acceptor>>,
    accept_tasks: Vec<JoinHandle<()>>,
    incoming: Vec<Connection>,
    router_connection: Option<Connection>,
}

struct AdapterInner {
    name: String,
    communicator: WeakCommunicator,
    wire: Arc<WireContext>,
    settings: ConnectionSettings,
    default_format: FormatType,
    monitor: AcmMonitor,
    servants: ServantManager,
    status: watch::Sender<Status>,
    lifecycle: Mutex<Lifecycle>,
    published: RwLock<Vec<Endpoint>>,
    adapter_id: RwLock<String>,
    router: Option<RouterInfo>,
}

/// 对象适配器句柄；克隆共享同一适配器。
#[derive(Clone)]
pub struct ObjectAdapter {
    inner: Arc<AdapterInner>,
}

impl ObjectAdapter {
    /// 在给定端点上监听并创建适配器；有路由器时改为发布路由器的服务端端点，
    /// 并通过路由器客户端连接接收回调请求。
    pub(crate) async fn create(
        communicator: &Communicator,
        name: &str,
        endpoints: &[Endpoint],
        router: Option<RouterInfo>,
    ) -> RpcResult<ObjectAdapter> {
        let config = communicator.config();
        let (status, _) = watch::channel(Status {
            state: AdapterState::NotActivated,
            in_flight: 0,
        });
        let adapter = ObjectAdapter {
            inner: Arc::new(AdapterInner {
                name: name.to_owned(),
                communicator: communicator.downgrade(),
                wire: communicator.wire_context(),
                settings: ConnectionSettings::server(config),
                default_format: config.default_format,
                monitor: communicator.monitor(),
                servants: ServantManager::default(),
                status,
                lifecycle: Mutex::new(Lifecycle::default()),
                published: RwLock::new(Vec::new()),
                adapter_id: RwLock::new(String::new()),
                router,
            }),
        };

        let mut published = Vec::new();
        if let Some(router) = &adapter.inner.router {
            published = router.server_endpoints().await?;
            let connection = communicator
                .get_connection(&router.client_endpoints().await?)
                .await?;
            connection.set_adapter(Some(adapter.clone()));
            router.set_adapter(Some(adapter.clone()));
            adapter.inner.lifecycle.lock().router_connection = Some(connection);
        }

        let mut acceptors: Vec<Arc<dyn Acceptor>> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            match communicator.transports().listen(endpoint).await {
                Ok(acceptor) => acceptors.push(Arc::from(acceptor)),
                Err(err) => {
                    for acceptor in &acceptors {
                        let _ = acceptor.close().await;
                    }
                    adapter.deactivate().await;
                    return Err(err.into());
                }
            }
        }
        if adapter.inner.router.is_none() {
            published = acceptors.iter().map(|acceptor| acceptor.endpoint()).collect();
        }

        *adapter.inner.published.write() = published;
        adapter.inner.lifecycle.lock().acceptors = acceptors;
        tracing::debug!(
            target: "spark_rpc::adapter",
            adapter = name,
            endpoints = ?adapter.published_endpoints(),
            "对象适配器已创建"
        );
        Ok(adapter)
    }

    /// 适配器名称。
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 当前状态。
    pub fn state(&self) -> AdapterState {
        self.inner.status.borrow().state
    }

    /// 正在执行的分发数。
    pub fn in_flight(&self) -> usize {
        self.inner.status.borrow().in_flight
    }

    /// 发布到代理中的端点。
    pub fn published_endpoints(&self) -> Vec<Endpoint> {
        self.inner.published.read().clone()
    }

    /// 替换发布端点，之后创建的直接代理使用新端点。
    pub fn set_published_endpoints(&self, endpoints: Vec<Endpoint>) {
        *self.inner.published.write() = endpoints;
    }

    /// 适配器标识；为空时 [`ObjectAdapter::create_proxy`] 创建直接代理。
    pub fn adapter_id(&self) -> String {
        self.inner.adapter_id.read().clone()
    }

    /// 设置适配器标识。
    pub fn set_adapter_id(&self, adapter_id: impl Into<String>) {
        *self.inner.adapter_id.write() = adapter_id.into();
    }

    /// 关联的路由器。
    pub fn router(&self) -> Option<&RouterInfo> {
        self.inner.router.as_ref()
    }

    /// 当前存活的入站连接。
    pub fn connections(&self) -> Vec<Connection> {
        let mut lifecycle = self.inner.lifecycle.lock();
        lifecycle
            .incoming
            .retain(|connection| !connection.state().is_closed());
        lifecycle.incoming.clone()
    }

    // ---- 生命周期 ----

    /// 激活：首次激活时启动接受循环；`Holding` 时恢复分发。
    pub fn activate(&self) -> RpcResult<()> {
        let mut first = false;
        let mut refused = false;
        self.inner.status.send_if_modified(|status| match status.state {
            AdapterState::NotActivated => {
                first = true;
                status.state = AdapterState::Active;
                true
            }
            AdapterState::Holding => {
                status.state = AdapterState::Active;
                true
            }
            AdapterState::Active => false,
            _ => {
                refused = true;
                false
            }
        });
        if refused {
            return Err(RpcError::AdapterDeactivated(self.inner.name.clone()));
        }
        if first {
            let mut lifecycle = self.inner.lifecycle.lock();
            let tasks: Vec<_> = lifecycle
                .acceptors
                .iter()
                .map(|acceptor| {
                    tokio::spawn(accept_loop(
                        Arc::downgrade(&self.inner),
                        Arc::clone(acceptor),
                    ))
                })
                .collect();
            lifecycle.accept_tasks.extend(tasks);
            tracing::info!(target: "spark_rpc::adapter", adapter = %self.inner.name, "对象适配器已激活");
        }
        Ok(())
    }

    /// 暂停：连接停止读取新请求，已开始的分发继续执行。
    pub fn hold(&self) -> RpcResult<()> {
        let mut refused = false;
        self.inner.status.send_if_modified(|status| match status.state {
            AdapterState::NotActivated | AdapterState::Holding => false,
            AdapterState::Active => {
                status.state = AdapterState::Holding;
                true
            }
            _ => {
                refused = true;
                false
            }
        });
        if refused {
            return Err(RpcError::AdapterDeactivated(self.inner.name.clone()));
        }
        Ok(())
    }

    /// 等待进行中的分发全部结束。
    pub async fn wait_for_hold(&self) {
        let mut rx = self.inner.status.subscribe();
        let _ = rx.wait_for(|status| status.in_flight == 0).await;
    }

    /// 停用；只有第一次调用生效。
    pub async fn deactivate(&self) {
        let started = self.inner.status.send_if_modified(|status| {
            if status.state < AdapterState::Deactivating {
                status.state = AdapterState::Deactivating;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }
        let lifecycle = std::mem::take(&mut *self.inner.lifecycle.lock());
        for task in &lifecycle.accept_tasks {
            task.abort();
        }
        for acceptor in &lifecycle.acceptors {
            if let Err(err) = acceptor.close().await {
                tracing::debug!(target: "spark_rpc::adapter", adapter = %self.inner.name, error = %err, "关闭接受器失败");
            }
        }
        for connection in &lifecycle.incoming {
            connection.close_gracefully(CloseReason::AdapterDeactivated);
        }
        if let Some(connection) = &lifecycle.router_connection {
            connection.set_adapter(None);
        }
        if let Some(router) = &self.inner.router {
            router.set_adapter(None);
        }
        self.inner.status.send_if_modified(settle_deactivation);
        tracing::info!(
            target: "spark_rpc::adapter",
            adapter = %self.inner.name,
            in_flight = self.in_flight(),
            "对象适配器已停用"
        );
    }

    /// 等待停用完成：所有进行中的分发结束。
    pub async fn wait_for_deactivate(&self) {
        let mut rx = self.inner.status.subscribe();
        let _ = rx
            .wait_for(|status| status.state >= AdapterState::Deactivated)
            .await;
    }

    /// 是否已停用完成。
    pub fn is_deactivated(&self) -> bool {
        self.state() >= AdapterState::Deactivated
    }

    /// 停用、等待分发结束、释放注册表并从通信器注销；幂等。
    pub async fn destroy(&self) {
        self.deactivate().await;
        self.wait_for_deactivate().await;
        let destroyed = self.inner.status.send_if_modified(|status| {
            if status.state == AdapterState::Deactivated {
                status.state = AdapterState::Destroyed;
                true
            } else {
                false
            }
        });
        if !destroyed {
            return;
        }
        for (category, locator) in self.inner.servants.destroy() {
            locator.deactivate(&category);
        }
        if let Some(communicator) = self.inner.communicator.upgrade() {
            communicator.remove_adapter(&self.inner.name);
        }
        tracing::debug!(target: "spark_rpc::adapter", adapter = %self.inner.name, "对象适配器已销毁");
    }

    /// 等待适配器允许读取请求；`NotActivated` 与 `Holding` 时挂起。
    pub(crate) async fn wait_ready(&self) {
        let mut rx = self.inner.status.subscribe();
        let _ = rx
            .wait_for(|status| {
                !matches!(
                    status.state,
                    AdapterState::NotActivated | AdapterState::Holding
                )
            })
            .await;
    }

    fn track_incoming(&self, connection: Connection) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if self.state() >= AdapterState::Deactivating {
            drop(lifecycle);
            connection.close_gracefully(CloseReason::AdapterDeactivated);
            return;
        }
        lifecycle
            .incoming
            .retain(|connection| !connection.state().is_closed());
        lifecycle.incoming.push(connection);
    }

    async fn accept_connection(self, transceiver: Arc<dyn Transceiver>, endpoint: Endpoint) {
        let settings = self.inner.settings.clone();
        match Connection::establish(transceiver, endpoint, settings, Some(self.clone())).await {
            Ok(connection) => {
                connection.attach_monitor(&self.inner.monitor);
                self.track_incoming(connection);
            }
            Err(err) => {
                tracing::debug!(
                    target: "spark_rpc::adapter",
                    adapter = %self.inner.name,
                    error = %err,
                    "入站连接握手失败"
                );
            }
        }
    }

    // ---- 分发 ----

    fn enter(&self) -> Option<InFlightGuard> {
        let mut admitted = false;
        self.inner.status.send_if_modified(|status| {
            if status.state < AdapterState::Deactivating {
                status.in_flight += 1;
                admitted = true;
            }
            admitted
        });
        admitted.then(|| InFlightGuard(Arc::clone(&self.inner)))
    }

    /// 分发一条请求并给出回复体。
    pub(crate) async fn dispatch(
        &self,
        request: Request,
        connection: Option<Connection>,
    ) -> ReplyBody {
        let encoding = request.encoding();
        let current = Current {
            adapter: self.clone(),
            connection,
            identity: request.identity,
            facet: request.facet,
            operation: request.operation,
            mode: request.mode,
            context: request.context,
            request_id: request.request_id,
            encoding,
        };
        let Some(_guard) = self.enter() else {
            return DispatchError::ObjectNotExist.into_reply(&current);
        };
        match self.resolve_and_dispatch(&current, request.params).await {
            Ok(result) => ReplyBody::Ok(result),
            Err(err) => {
                tracing::trace!(
                    target: "spark_rpc::adapter",
                    identity = %current.identity,
                    operation = %current.operation,
                    error = %err,
                    "分发失败"
                );
                err.into_reply(&current)
            }
        }
    }

    async fn resolve_and_dispatch(
        &self,
        current: &Current,
        params: Bytes,
    ) -> Result<Bytes, DispatchError> {
        match self.inner.servants.resolve(&current.identity, &current.facet) {
            Resolved::Servant(servant) => dispatch_to(servant.as_ref(), current, params).await,
            Resolved::Locator(locator) => {
                let Some((servant, cookie)) = locator.locate(current).await? else {
                    return Err(if self.inner.servants.has_servant(&current.identity) {
                        DispatchError::FacetNotExist
                    } else {
                        DispatchError::ObjectNotExist
                    });
                };
                let guard =
                    LocatorGuard::new(locator, current.clone(), Arc::clone(&servant), cookie);
                let result = dispatch_to(servant.as_ref(), current, params).await;
                guard.finish()?;
                result
            }
            Resolved::FacetNotExist => Err(DispatchError::FacetNotExist),
            Resolved::ObjectNotExist => Err(DispatchError::ObjectNotExist),
        }
    }

    pub(crate) fn wire_context(&self) -> Arc<WireContext> {
        Arc::clone(&self.inner.wire)
    }

    pub(crate) fn default_format(&self) -> FormatType {
        self.inner.default_format
    }

    // ---- 注册表 ----

    fn check_not_destroyed(&self) -> RpcResult<()> {
        if self.state() == AdapterState::Destroyed {
            return Err(RpcError::AdapterDeactivated(self.inner.name.clone()));
        }
        Ok(())
    }

    /// 以空切面注册服务对象并返回其代理。
    pub fn add(&self, servant: Arc<dyn Servant>, identity: Identity) -> RpcResult<Proxy> {
        self.add_facet(servant, identity, "")
    }

    /// 注册切面并返回其代理。
    pub fn add_facet(
        &self,
        servant: Arc<dyn Servant>,
        identity: Identity,
        facet: &str,
    ) -> RpcResult<Proxy> {
        self.check_not_destroyed()?;
        self.inner
            .servants
            .add_facet(servant, identity.clone(), facet)?;
        Ok(self.create_proxy(identity)?.with_facet(facet))
    }

    /// 以随机 UUID 身份注册。
    pub fn add_with_uuid(&self, servant: Arc<dyn Servant>) -> RpcResult<Proxy> {
        self.add(servant, Identity::uuid())
    }

    /// 注销空切面。
    pub fn remove(&self, identity: &Identity) -> RpcResult<Arc<dyn Servant>> {
        self.remove_facet(identity, "")
    }

    /// 注销切面。
    pub fn remove_facet(&self, identity: &Identity, facet: &str) -> RpcResult<Arc<dyn Servant>> {
        self.check_not_destroyed()?;
        self.inner.servants.remove_facet(identity, facet)
    }

    /// 注销身份下的全部切面。
    pub fn remove_all_facets(
        &self,
        identity: &Identity,
    ) -> RpcResult<HashMap<String, Arc<dyn Servant>>> {
        self.check_not_destroyed()?;
        self.inner.servants.remove_all_facets(identity)
    }

    /// 查找空切面。
    pub fn find(&self, identity: &Identity) -> Option<Arc<dyn Servant>> {
        self.find_facet(identity, "")
    }

    /// 查找切面。
    pub fn find_facet(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        self.inner.servants.find_facet(identity, facet)
    }

    /// 身份下的全部切面。
    pub fn find_all_facets(&self, identity: &Identity) -> HashMap<String, Arc<dyn Servant>> {
        self.inner.servants.find_all_facets(identity)
    }

    /// 身份是否注册了任意切面。
    pub fn has_servant(&self, identity: &Identity) -> bool {
        self.inner.servants.has_servant(identity)
    }

    /// 注册类别的默认服务对象；空类别为兜底。
    pub fn add_default_servant(&self, servant: Arc<dyn Servant>, category: &str) -> RpcResult<()> {
        self.check_not_destroyed()?;
        self.inner.servants.add_default_servant(servant, category)
    }

    /// 注销默认服务对象。
    pub fn remove_default_servant(&self, category: &str) -> RpcResult<Arc<dyn Servant>> {
        self.check_not_destroyed()?;
        self.inner.servants.remove_default_servant(category)
    }

    /// 查找默认服务对象。
    pub fn find_default_servant(&self, category: &str) -> Option<Arc<dyn Servant>> {
        self.inner.servants.find_default_servant(category)
    }

    /// 注册类别的定位器；空类别为通配。
    pub fn add_servant_locator(
        &self,
        locator: Arc<dyn ServantLocator>,
        category: &str,
    ) -> RpcResult<()> {
        self.check_not_destroyed()?;
        self.inner.servants.add_servant_locator(locator, category)
    }

    /// 注销定位器；不调用其 `deactivate`。
    pub fn remove_servant_locator(&self, category: &str) -> RpcResult<Arc<dyn ServantLocator>> {
        self.check_not_destroyed()?;
        self.inner.servants.remove_servant_locator(category)
    }

    /// 查找定位器。
    pub fn find_servant_locator(&self, category: &str) -> Option<Arc<dyn ServantLocator>> {
        self.inner.servants.find_servant_locator(category)
    }

    // ---- 代理工厂 ----

    /// 设置了适配器标识时创建间接代理，否则创建直接代理。
    pub fn create_proxy(&self, identity: Identity) -> RpcResult<Proxy> {
        if self.inner.adapter_id.read().is_empty() {
            self.create_direct_proxy(identity)
        } else {
            self.create_indirect_proxy(identity)
        }
    }

    /// 携带发布端点的直接代理。
    pub fn create_direct_proxy(&self, identity: Identity) -> RpcResult<Proxy> {
        self.new_proxy(Reference::direct(identity, self.published_endpoints()))
    }

    /// 携带适配器标识的间接代理；标识为空时为知名对象代理。
    pub fn create_indirect_proxy(&self, identity: Identity) -> RpcResult<Proxy> {
        let adapter_id = self.adapter_id();
        self.new_proxy(Reference::indirect(identity, adapter_id))
    }

    fn new_proxy(&self, reference: Reference) -> RpcResult<Proxy> {
        if reference.identity.name.is_empty() {
            return Err(RpcError::IllegalIdentity(reference.identity.to_string()));
        }
        let communicator = self
            .inner
            .communicator
            .upgrade()
            .ok_or(RpcError::CommunicatorDestroyed)?;
        Ok(communicator.create_proxy(reference))
    }
}

impl PartialEq for ObjectAdapter {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ObjectAdapter {}

impl fmt::Debug for ObjectAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectAdapter")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn settle_deactivation(status: &mut Status) -> bool {
    if status.state == AdapterState::Deactivating && status.in_flight == 0 {
        status.state = AdapterState::Deactivated;
        true
    } else {
        false
    }
}

struct InFlightGuard(Arc<AdapterInner>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.status.send_modify(|status| {
            status.in_flight -= 1;
            settle_deactivation(status);
        });
    }
}

/// 内建操作在此应答，其余交给服务对象。
async fn dispatch_to(
    servant: &dyn Servant,
    current: &Current,
    params: Bytes,
) -> Result<Bytes, DispatchError> {
    match current.operation.as_str() {
        "ice_ping" => Ok(current.empty_result()),
        "ice_isA" => {
            let type_id = current.read_params(&params, |input: &mut InputStream<'_>| {
                input.read_string()
            })?;
            let found = servant.type_ids().iter().any(|id| *id == type_id);
            current.write_result(|out: &mut OutputStream| {
                out.write_bool(found);
                Ok(())
            })
        }
        "ice_ids" => {
            let mut ids = servant.type_ids();
            ids.sort();
            current.write_result(|out| {
                out.write_string_seq(&ids);
                Ok(())
            })
        }
        "ice_id" => {
            let ids = servant.type_ids();
            let most_derived = ids.first().map(String::as_str).unwrap_or_default();
            current.write_result(|out| {
                out.write_string(most_derived);
                Ok(())
            })
        }
        _ => servant.dispatch(current, params).await,
    }
}

async fn accept_loop(weak: Weak<AdapterInner>, acceptor: Arc<dyn Acceptor>) {
    let endpoint = acceptor.endpoint();
    loop {
        let transceiver = match acceptor.accept().await {
            Ok(transceiver) => transceiver,
            Err(err) if err.kind() == TransportErrorKind::Closed => break,
            Err(err) => {
                tracing::warn!(
                    target: "spark_rpc::adapter",
                    endpoint = %endpoint,
                    error = %err,
                    "接受连接失败"
                );
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let adapter = ObjectAdapter { inner };
        tokio::spawn(adapter.accept_connection(transceiver, endpoint.clone()));
    }
}
