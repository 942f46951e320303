//! 定位器信息缓存：把适配器标识与知名对象身份解析为端点。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 间接代理每次调用都需要端点；远程查询定位器代价高，解析结果按 TTL 缓存；
//! - 同一键上的并发查询合并为一次远程调用，后到者共享结果。
//!
//! ## 契约（What）
//! - `ttl = None` 表示缓存永不过期，`Some(ZERO)` 表示不缓存；
//! - [`LocatorInfo::endpoints`] 返回端点与“是否来自缓存”，调用方在缓存端点建连失败时
//!   调用 [`LocatorInfo::clear_cache`] 后重试一次；
//! - 知名对象解析到间接引用时，继续按其适配器标识解析。
//!
//! ## 注意事项（Trade-offs）
//! - 合并查询的结果在完成后立刻从进行中表移除，失败不会被缓存。

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use spark_rpc_transport::Endpoint;
use tokio::time::Instant;

use crate::error::{RpcError, RpcResult};
use crate::identity::Identity;
use crate::reference::{Reference, Target};

/// 定位器的远程能力。
#[async_trait]
pub trait Locator: Send + Sync + 'static {
    /// 定位器自身的身份，作为缓存键。
    fn identity(&self) -> Identity;

    /// 按适配器标识查找；未注册时返回 `None`。
    async fn find_adapter_by_id(&self, adapter_id: &str) -> RpcResult<Option<Reference>>;

    /// 按身份查找知名对象；未注册时返回 `None`。
    async fn find_object_by_id(&self, identity: &Identity) -> RpcResult<Option<Reference>>;
}

type Lookup = Shared<BoxFuture<'static, RpcResult<Option<Reference>>>>;

struct Entry<T> {
    value: T,
    stored_at: Instant,
}

struct Cache<K, T> {
    entries: HashMap<K, Entry<T>>,
    requests: HashMap<K, Lookup>,
}

impl<K, T> Default for Cache<K, T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            requests: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, T: Clone> Cache<K, T> {
    fn fresh(&self, key: &K, ttl: Option<Duration>) -> Option<T> {
        let entry = self.entries.get(key)?;
        match ttl {
            None => Some(entry.value.clone()),
            Some(ttl) if entry.stored_at.elapsed() < ttl => Some(entry.value.clone()),
            Some(_) => None,
        }
    }
}

struct LocatorInfoInner {
    locator: Arc<dyn Locator>,
    ttl: Option<Duration>,
    adapters: Mutex<Cache<String, Vec<Endpoint>>>,
    objects: Mutex<Cache<Identity, Reference>>,
}

/// 单个定位器的缓存信息，可廉价克隆。
#[derive(Clone)]
pub struct LocatorInfo {
    inner: Arc<LocatorInfoInner>,
}

impl LocatorInfo {
    /// 包装定位器能力。
    pub fn new(locator: Arc<dyn Locator>, ttl: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(LocatorInfoInner {
                locator,
                ttl,
                adapters: Mutex::new(Cache::default()),
                objects: Mutex::new(Cache::default()),
            }),
        }
    }

    /// 定位器身份。
    pub fn identity(&self) -> Identity {
        self.inner.locator.identity()
    }

    fn caching(&self) -> bool {
        self.inner.ttl != Some(Duration::ZERO)
    }

    /// 解析间接引用的端点，返回端点与“是否来自缓存”。
    pub async fn endpoints(&self, reference: &Reference) -> RpcResult<(Vec<Endpoint>, bool)> {
        match &reference.target {
            Target::Indirect(adapter_id) if !adapter_id.is_empty() => {
                self.adapter_endpoints(adapter_id).await
            }
            Target::Indirect(_) => self.object_endpoints(&reference.identity).await,
            Target::Direct(endpoints) => Ok((endpoints.clone(), false)),
            Target::Fixed(_) => Err(RpcError::InvalidProxy(
                "固定代理不经定位器解析".into(),
            )),
        }
    }

    async fn adapter_endpoints(&self, adapter_id: &str) -> RpcResult<(Vec<Endpoint>, bool)> {
        let key = adapter_id.to_owned();
        let lookup = {
            let mut cache = self.inner.adapters.lock();
            if let Some(endpoints) = cache.fresh(&key, self.inner.ttl) {
                return Ok((endpoints, true));
            }
            cache
                .requests
                .entry(key.clone())
                .or_insert_with(|| {
                    let locator = Arc::clone(&self.inner.locator);
                    let id = key.clone();
                    async move { locator.find_adapter_by_id(&id).await }
                        .boxed()
                        .shared()
                })
                .clone()
        };
        let result = lookup.await;
        let mut cache = self.inner.adapters.lock();
        cache.requests.remove(&key);
        let endpoints = result?
            .map(|proxy| proxy.endpoints().to_vec())
            .filter(|endpoints| !endpoints.is_empty())
            .ok_or_else(|| RpcError::not_registered("object adapter", adapter_id))?;
        if self.caching() {
            cache.entries.insert(
                key,
                Entry {
                    value: endpoints.clone(),
                    stored_at: Instant::now(),
                },
            );
        }
        tracing::debug!(
            target: "spark_rpc::locator",
            adapter_id,
            endpoints = endpoints.len(),
            "已解析适配器端点"
        );
        Ok((endpoints, false))
    }

    async fn object_endpoints(&self, identity: &Identity) -> RpcResult<(Vec<Endpoint>, bool)> {
        let (reference, cached) = self.object_reference(identity).await?;
        match &reference.target {
            Target::Direct(endpoints) if !endpoints.is_empty() => Ok((endpoints.clone(), cached)),
            Target::Indirect(adapter_id) if !adapter_id.is_empty() => {
                let (endpoints, adapter_cached) = self.adapter_endpoints(adapter_id).await?;
                Ok((endpoints, cached || adapter_cached))
            }
            _ => Err(RpcError::not_registered("object", identity.to_string())),
        }
    }

    async fn object_reference(&self, identity: &Identity) -> RpcResult<(Reference, bool)> {
        let lookup = {
            let mut cache = self.inner.objects.lock();
            if let Some(reference) = cache.fresh(identity, self.inner.ttl) {
                return Ok((reference, true));
            }
            cache
                .requests
                .entry(identity.clone())
                .or_insert_with(|| {
                    let locator = Arc::clone(&self.inner.locator);
                    let id = identity.clone();
                    async move { locator.find_object_by_id(&id).await }
                        .boxed()
                        .shared()
                })
                .clone()
        };
        let result = lookup.await;
        let mut cache = self.inner.objects.lock();
        cache.requests.remove(identity);
        let reference =
            result?.ok_or_else(|| RpcError::not_registered("object", identity.to_string()))?;
        if self.caching() {
            cache.entries.insert(
                identity.clone(),
                Entry {
                    value: reference.clone(),
                    stored_at: Instant::now(),
                },
            );
        }
        Ok((reference, false))
    }

    /// 清除与引用相关的缓存条目。
    pub fn clear_cache(&self, reference: &Reference) {
        match &reference.target {
            Target::Indirect(adapter_id) if !adapter_id.is_empty() => {
                self.inner.adapters.lock().entries.remove(adapter_id);
            }
            Target::Indirect(_) => {
                let removed = self
                    .inner
                    .objects
                    .lock()
                    .entries
                    .remove(&reference.identity);
                if let Some(Entry { value, .. }) = removed
                    && let Some(adapter_id) = value.adapter_id()
                {
                    self.inner.adapters.lock().entries.remove(adapter_id);
                }
            }
            _ => {}
        }
        tracing::debug!(
            target: "spark_rpc::locator",
            reference = %reference,
            "已清除定位器缓存"
        );
    }
}

impl fmt::Debug for LocatorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocatorInfo")
            .field("identity", &self.identity())
            .field("ttl", &self.inner.ttl)
            .finish_non_exhaustive()
    }
}

/// 按定位器身份缓存 [`LocatorInfo`]。
#[derive(Default)]
pub struct LocatorManager {
    table: Mutex<HashMap<Identity, LocatorInfo>>,
    hint: ArcSwapOption<(Identity, LocatorInfo)>,
}

impl LocatorManager {
    /// 创建空缓存。
    pub fn new() -> Self {
        Self::default()
    }

    /// 取得或创建定位器信息。
    pub fn get_or_insert_with<F>(&self, identity: &Identity, make: F) -> LocatorInfo
    where
        F: FnOnce() -> LocatorInfo,
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
            .or_insert_with(make)
            .clone();
        self.hint
            .store(Some(Arc::new((identity.clone(), info.clone()))));
        info
    }

    /// 清空缓存。
    pub fn destroy(&self) {
        self.hint.store(None);
        self.table.lock().clear();
    }
}
