//! 以远程调用实现的路由器与定位器能力。
//!
//! 两者都按操作名直接编码参数，不依赖生成代码；代理在调用时才从弱引用的通信器构造，
//! 通信器的缓存表持有这些对象时不会形成引用环。

use std::sync::Arc;

use async_trait::async_trait;
use spark_rpc_wire::{InputStream, OptionalFormat, OutputStream};

use crate::communicator::WeakCommunicator;
use crate::error::{RpcError, RpcResult};
use crate::identity::Identity;
use crate::protocol::OperationMode;
use crate::proxy::Proxy;
use crate::reference::Reference;

use super::{Locator, Router};

fn plain_proxy(communicator: &WeakCommunicator, reference: &Reference) -> RpcResult<Proxy> {
    let communicator = communicator
        .upgrade()
        .ok_or(RpcError::CommunicatorDestroyed)?;
    Ok(Proxy::new(communicator, reference.clone(), None, None))
}

fn read_proxy_seq(input: &mut InputStream<'_>) -> RpcResult<Vec<Reference>> {
    let count = input.read_and_check_seq_size(2)?;
    let mut proxies = Vec::with_capacity(count);
    for _ in 0..count {
        if let Some(reference) = Reference::read(input)? {
            proxies.push(reference);
        }
    }
    Ok(proxies)
}

/// 远程路由器。
pub struct RemoteRouter {
    reference: Reference,
    communicator: WeakCommunicator,
}

impl RemoteRouter {
    pub(crate) fn new(reference: Reference, communicator: WeakCommunicator) -> Self {
        Self {
            reference,
            communicator,
        }
    }

    fn proxy(&self) -> RpcResult<Proxy> {
        plain_proxy(&self.communicator, &self.reference)
    }
}

#[async_trait]
impl Router for RemoteRouter {
    fn identity(&self) -> Identity {
        self.reference.identity.clone()
    }

    async fn get_client_proxy(&self) -> RpcResult<(Reference, Option<bool>)> {
        let proxy = self.proxy()?;
        let result = proxy
            .invoke("getClientProxy", OperationMode::Idempotent, proxy.empty_params())
            .await?;
        let (client, has_routing_table) = proxy.decode_result(&result, |input| {
            let client = Reference::read(input)?;
            let has_routing_table = if input.read_optional(1, OptionalFormat::F1)? {
                Some(input.read_bool()?)
            } else {
                None
            };
            Ok::<_, RpcError>((client, has_routing_table))
        })?;
        // 路由器不返回客户端代理时，直接使用路由器自身的端点。
        Ok((client.unwrap_or_else(|| self.reference.clone()), has_routing_table))
    }

    async fn get_server_proxy(&self) -> RpcResult<Option<Reference>> {
        let proxy = self.proxy()?;
        let result = proxy
            .invoke("getServerProxy", OperationMode::Idempotent, proxy.empty_params())
            .await?;
        proxy.decode_result(&result, |input| Reference::read(input))
    }

    async fn add_proxies(&self, proxies: Vec<Reference>) -> RpcResult<Vec<Reference>> {
        let proxy = self.proxy()?;
        let params = proxy.encode_params(|out: &mut OutputStream| {
            out.write_size(proxies.len());
            proxies.iter().try_for_each(|reference| reference.write(out))
        })?;
        let result = proxy
            .invoke("addProxies", OperationMode::Idempotent, params)
            .await?;
        proxy.decode_result(&result, read_proxy_seq)
    }
}

/// 远程定位器。
pub struct RemoteLocator {
    reference: Reference,
    communicator: WeakCommunicator,
}

impl RemoteLocator {
    pub(crate) fn new(reference: Reference, communicator: WeakCommunicator) -> Self {
        Self {
            reference,
            communicator,
        }
    }

    fn proxy(&self) -> RpcResult<Proxy> {
        plain_proxy(&self.communicator, &self.reference)
    }

    async fn find(&self, operation: &str, params: bytes::Bytes) -> RpcResult<Option<Reference>> {
        let proxy = self.proxy()?;
        match proxy
            .invoke(operation, OperationMode::Idempotent, params)
            .await
        {
            Ok(result) => proxy.decode_result(&result, |input| Reference::read(input)),
            // 定位器以用户异常表示“未找到”。
            Err(RpcError::UserException(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Locator for RemoteLocator {
    fn identity(&self) -> Identity {
        self.reference.identity.clone()
    }

    async fn find_adapter_by_id(&self, adapter_id: &str) -> RpcResult<Option<Reference>> {
        let params = self.proxy()?.encode_params(|out| {
            out.write_string(adapter_id);
            Ok::<_, RpcError>(())
        })?;
        self.find("findAdapterById", params).await
    }

    async fn find_object_by_id(&self, identity: &Identity) -> RpcResult<Option<Reference>> {
        let params = self.proxy()?.encode_params(|out| {
            identity.write(out);
            Ok::<_, RpcError>(())
        })?;
        self.find("findObjectById", params).await
    }
}

/// 包装为路由器能力对象。
pub(crate) fn remote_router(reference: &Reference, communicator: WeakCommunicator) -> Arc<dyn Router> {
    Arc::new(RemoteRouter::new(reference.clone(), communicator))
}

/// 包装为定位器能力对象。
pub(crate) fn remote_locator(
    reference: &Reference,
    communicator: WeakCommunicator,
) -> Arc<dyn Locator> {
    Arc::new(RemoteLocator::new(reference.clone(), communicator))
}
