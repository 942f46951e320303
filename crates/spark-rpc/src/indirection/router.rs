//! 路由器信息缓存。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 经路由器转发的调用需要路由器的客户端端点；以路由器作为中转的适配器需要其服务端端点；
//!   两者都只在首次使用时远程查询一次；
//! - 路由器维护一张“允许回调的身份”路由表，客户端记录已登记的身份以避免重复登记；
//! - 路由器可以在登记其他身份时单方面淘汰旧身份，淘汰通知可能早于同一身份的登记完成。
//!
//! ## 契约（What）
//! - `add_and_evict` 处理一次登记完成：若该身份已在“最近淘汰”多重集中，则消耗一次计数且不登记；
//!   否则登记。随后处理本次返回的淘汰列表：已登记的身份移除，未登记的身份进入多重集；
//! - 因此“淘汰在逻辑上先于登记”时，身份最终一定处于未登记状态。
//!
//! ## 注意事项（Trade-offs）
//! - 多重集条目只会被后续同一身份的登记消耗，远端淘汰从未登记过的身份会留下条目；
//!   这些条目在 `clear_cache` 时清空。

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::Mutex;
use spark_rpc_transport::Endpoint;
use tokio::sync::OnceCell;

use crate::adapter::ObjectAdapter;
use crate::error::{RpcError, RpcResult};
use crate::identity::Identity;
use crate::reference::Reference;

/// 路由器的远程能力。
#[async_trait]
pub trait Router: Send + Sync + 'static {
    /// 路由器自身的身份，作为缓存键。
    fn identity(&self) -> Identity;

    /// 客户端代理与“是否维护路由表”；远端未提供代理时实现应返回路由器自身引用。
    async fn get_client_proxy(&self) -> RpcResult<(Reference, Option<bool>)>;

    /// 服务端代理，供以路由器为中转的适配器发布。
    async fn get_server_proxy(&self) -> RpcResult<Option<Reference>>;

    /// 登记代理，返回被淘汰的代理。
    async fn add_proxies(&self, proxies: Vec<Reference>) -> RpcResult<Vec<Reference>>;
}

#[derive(Clone, Debug)]
struct ClientInfo {
    endpoints: Vec<Endpoint>,
    has_routing_table: bool,
}

#[derive(Debug, Default)]
struct RoutingTable {
    identities: HashSet<Identity>,
    evicted: HashMap<Identity, usize>,
}

struct RouterInfoInner {
    router: Arc<dyn Router>,
    client: OnceCell<ClientInfo>,
    server: OnceCell<Vec<Endpoint>>,
    table: Mutex<RoutingTable>,
    adapter: Mutex<Option<ObjectAdapter>>,
}

/// 单个路由器的缓存信息，可廉价克隆。
#[derive(Clone)]
pub struct RouterInfo {
    inner: Arc<RouterInfoInner>,
}

impl RouterInfo {
    /// 包装路由器能力。
    pub fn new(router: Arc<dyn Router>) -> Self {
        Self {
            inner: Arc::new(RouterInfoInner {
                router,
                client: OnceCell::new(),
                server: OnceCell::new(),
                table: Mutex::new(RoutingTable::default()),
                adapter: Mutex::new(None),
            }),
        }
    }

    /// 路由器身份。
    pub fn identity(&self) -> Identity {
        self.inner.router.identity()
    }

    async fn client_info(&self) -> RpcResult<&ClientInfo> {
        self.inner
            .client
            .get_or_try_init(|| async {
                let (proxy, has_routing_table) = self.inner.router.get_client_proxy().await?;
                let endpoints = proxy.endpoints().to_vec();
                if endpoints.is_empty() {
                    return Err(RpcError::NoEndpoint(format!(
                        "路由器 `{}` 的客户端代理没有直接端点",
                        self.identity()
                    )));
                }
                tracing::debug!(
                    target: "spark_rpc::router",
                    router = %self.identity(),
                    endpoints = endpoints.len(),
                    "已缓存路由器客户端端点"
                );
                Ok(ClientInfo {
                    endpoints,
                    has_routing_table: has_routing_table.unwrap_or(true),
                })
            })
            .await
    }

    /// 客户端端点；首次调用时远程查询。
    pub async fn client_endpoints(&self) -> RpcResult<Vec<Endpoint>> {
        Ok(self.client_info().await?.endpoints.clone())
    }

    /// 服务端端点；首次调用时远程查询。
    pub async fn server_endpoints(&self) -> RpcResult<Vec<Endpoint>> {
        self.inner
            .server
            .get_or_try_init(|| async {
                let proxy = self.inner.router.get_server_proxy().await?.ok_or_else(|| {
                    RpcError::NoEndpoint(format!("路由器 `{}` 没有服务端代理", self.identity()))
                })?;
                Ok(proxy.endpoints().to_vec())
            })
            .await
            .cloned()
    }

    /// 身份当前是否已登记。
    pub fn is_registered(&self, identity: &Identity) -> bool {
        self.inner.table.lock().identities.contains(identity)
    }

    /// 确保代理的身份已在路由器登记。
    pub async fn add_proxy(&self, reference: &Reference) -> RpcResult<()> {
        if !self.client_info().await?.has_routing_table {
            return Ok(());
        }
        if self.is_registered(&reference.identity) {
            return Ok(());
        }
        let evicted = self
            .inner
            .router
            .add_proxies(vec![reference.clone()])
            .await?;
        let evicted: Vec<Identity> = evicted.into_iter().map(|proxy| proxy.identity).collect();
        self.add_and_evict(&reference.identity, &evicted);
        Ok(())
    }

    /// 处理一次登记完成及其返回的淘汰列表。
    pub fn add_and_evict(&self, added: &Identity, evicted: &[Identity]) {
        let mut table = self.inner.table.lock();
        match table.evicted.get_mut(added) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    table.evicted.remove(added);
                }
            }
            None => {
                table.identities.insert(added.clone());
            }
        }
        for identity in evicted {
            Self::evict_locked(&mut table, identity);
        }
    }

    /// 处理与任何登记无关的淘汰通知。
    pub fn evict(&self, identities: &[Identity]) {
        let mut table = self.inner.table.lock();
        for identity in identities {
            Self::evict_locked(&mut table, identity);
        }
    }

    fn evict_locked(table: &mut RoutingTable, identity: &Identity) {
        if !table.identities.remove(identity) {
            *table.evicted.entry(identity.clone()).or_insert(0) += 1;
        }
    }

    /// 以路由器为中转的适配器。
    pub fn adapter(&self) -> Option<ObjectAdapter> {
        self.inner.adapter.lock().clone()
    }

    pub(crate) fn set_adapter(&self, adapter: Option<ObjectAdapter>) {
        *self.inner.adapter.lock() = adapter;
    }

    /// 清空路由表；端点缓存保持不变。
    pub fn clear_cache(&self) {
        let mut table = self.inner.table.lock();
        table.identities.clear();
        table.evicted.clear();
    }
}

impl fmt::Debug for RouterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterInfo")
            .field("identity", &self.identity())
            .field("table", &*self.inner.table.lock())
            .finish_non_exhaustive()
    }
}

/// 按路由器身份缓存 [`RouterInfo`]，并以单条目提示加速“进程只用一个路由器”的常见情况。
#[derive(Default)]
pub struct RouterManager {
    table: Mutex<HashMap<Identity, RouterInfo>>,
    hint: ArcSwapOption<(Identity, RouterInfo)>,
}

impl RouterManager {
    /// 创建空缓存。
    pub fn new() -> Self {
        Self::default()
    }

    /// 取得或创建路由器信息。
    pub fn get_or_insert_with<F>(&self, identity: &Identity, make: F) -> RouterInfo
    where
        F: FnOnce() -> Arc<dyn Router>,
    {
        if let Some(hint) = self.hint.load_full()
            && hint.0 == *identity
        {
            return hint.1.clone();
        }
        let info = self
            .table
            .lock()
            .entry(identity.clone())
            .or_insert_with(|| RouterInfo::new(make()))
            .clone();
        self.hint
            .store(Some(Arc::new((identity.clone(), info.clone()))));
        info
    }

    /// 移除路由器信息。
    pub fn erase(&self, identity: &Identity) -> Option<RouterInfo> {
        let removed = self.table.lock().remove(identity);
        if self
            .hint
            .load_full()
            .is_some_and(|hint| hint.0 == *identity)
        {
            self.hint.store(None);
        }
        removed
    }

    /// 已缓存的路由器数量。
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// 是否没有缓存任何路由器。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空缓存。
    pub fn destroy(&self) {
        self.hint.store(None);
        self.table.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct FakeRouter {
        calls: AtomicUsize,
        gate: Notify,
        block_first: bool,
        evict_on_second: Option<Reference>,
    }

    impl FakeRouter {
        fn new(block_first: bool, evict_on_second: Option<Reference>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Notify::new(),
                block_first,
                evict_on_second,
            })
        }
    }

    #[async_trait]
    impl Router for FakeRouter {
        fn identity(&self) -> Identity {
            Identity::new("router", "Glacier2")
        }

        async fn get_client_proxy(&self) -> RpcResult<(Reference, Option<bool>)> {
            Ok((
                Reference::direct(self.identity(), vec![Endpoint::memory("router")]),
                None,
            ))
        }

        async fn get_server_proxy(&self) -> RpcResult<Option<Reference>> {
            Ok(None)
        }

        async fn add_proxies(&self, _: Vec<Reference>) -> RpcResult<Vec<Reference>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 && self.block_first {
                self.gate.notified().await;
            }
            if call == 1 {
                return Ok(self.evict_on_second.clone().into_iter().collect());
            }
            Ok(Vec::new())
        }
    }

    fn proxy(name: &str) -> Reference {
        Reference::well_known(Identity::new(name, ""))
    }

    #[tokio::test]
    async fn endpoints_are_fetched_once_and_registration_is_cached() {
        let fake = FakeRouter::new(false, None);
        let info = RouterInfo::new(fake.clone());
        assert_eq!(
            info.client_endpoints().await.expect("客户端端点"),
            vec![Endpoint::memory("router")]
        );
        info.add_proxy(&proxy("a")).await.expect("登记");
        info.add_proxy(&proxy("a")).await.expect("重复登记");
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
        assert!(info.is_registered(&Identity::new("a", "")));
        assert!(info.server_endpoints().await.is_err());
    }

    #[tokio::test]
    async fn eviction_racing_ahead_of_registration_wins() {
        let fake = FakeRouter::new(true, Some(proxy("a")));
        let info = RouterInfo::new(fake.clone());
        info.client_endpoints().await.expect("客户端端点");

        let adding_a = {
            let info = info.clone();
            tokio::spawn(async move { info.add_proxy(&proxy("a")).await })
        };
        while fake.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        // 第二次登记（b）的返回值淘汰了 a，而 a 的登记尚未完成。
        info.add_proxy(&proxy("b")).await.expect("登记 b");
        fake.gate.notify_one();
        adding_a.await.expect("任务结束").expect("登记 a");

        assert!(!info.is_registered(&Identity::new("a", "")));
        assert!(info.is_registered(&Identity::new("b", "")));
    }

    #[test]
    fn eviction_after_registration_removes_identity() {
        let info = RouterInfo::new(FakeRouter::new(false, None));
        let a = Identity::new("a", "");
        info.add_and_evict(&a, &[]);
        assert!(info.is_registered(&a));
        info.evict(&[a.clone()]);
        assert!(!info.is_registered(&a));
        info.add_and_evict(&a, &[]);
        assert!(info.is_registered(&a));
    }

    #[test]
    fn manager_memoizes_per_identity() {
        let manager = RouterManager::new();
        let id = Identity::new("router", "Glacier2");
        let first = manager.get_or_insert_with(&id, || FakeRouter::new(false, None));
        let second = manager.get_or_insert_with(&id, || unreachable!("命中缓存"));
        assert!(Arc::ptr_eq(&first.inner, &second.inner));
        assert_eq!(manager.len(), 1);
        assert!(manager.erase(&id).is_some());
        assert!(manager.is_empty());
    }
}
