//! 代理：引用与通信器的组合，负责解析连接并发起调用。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 引用只是值；调用还需要知道经哪个路由器、用哪个定位器、复用哪条连接，
//!   这些由通信器提供，代理把二者绑在一起；
//! - 代理不可变，`with_*` 返回新代理，克隆只复制几个 `Arc`。
//!
//! ## 连接解析顺序（How）
//! 1. 固定代理直接使用其连接；
//! 2. 配置了路由器时连接路由器的客户端端点，并把本代理登记到路由表；
//! 3. 直接代理按安全、数据报与已注册传输过滤端点；
//! 4. 间接代理经定位器解析；端点来自缓存且建连失败时清除缓存重试一次。
//!
//! ## 调用模式（What）
//! - 双向调用等待回复并把非成功状态映射为 [`RpcError`]；
//! - 单向与数据报调用写出后即返回空负载；批量调用只入队，需要显式冲刷；
//! - 调用超时取代理覆盖值，否则取通信器配置。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use spark_rpc_transport::Endpoint;
use spark_rpc_wire::{EncodingVersion, InputStream, OutputStream};

use crate::communicator::Communicator;
use crate::connection::Connection;
use crate::error::{RpcError, RpcResult};
use crate::identity::Identity;
use crate::indirection::{LocatorInfo, RouterInfo};
use crate::invocation::{Cancellable, run_with_timeout};
use crate::protocol::{Context, OperationMode, Request};
use crate::reference::{InvocationMode, Reference, Target};

/// 远程对象的调用句柄。
#[derive(Clone)]
pub struct Proxy {
    reference: Arc<Reference>,
    communicator: Communicator,
    router: Option<RouterInfo>,
    locator: Option<LocatorInfo>,
}

impl Proxy {
    pub(crate) fn new(
        communicator: Communicator,
        reference: Reference,
        router: Option<RouterInfo>,
        locator: Option<LocatorInfo>,
    ) -> Self {
        Self {
            reference: Arc::new(reference),
            communicator,
            router,
            locator,
        }
    }

    fn derive(&self, reference: Reference) -> Self {
        Self {
            reference: Arc::new(reference),
            communicator: self.communicator.clone(),
            router: self.router.clone(),
            locator: self.locator.clone(),
        }
    }

    /// 底层引用。
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// 目标身份。
    pub fn identity(&self) -> &Identity {
        &self.reference.identity
    }

    /// 目标切面。
    pub fn facet(&self) -> &str {
        &self.reference.facet
    }

    /// 调用模式。
    pub fn mode(&self) -> InvocationMode {
        self.reference.mode
    }

    /// 所属通信器。
    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    /// 使用的路由器。
    pub fn router(&self) -> Option<&RouterInfo> {
        self.router.as_ref()
    }

    /// 使用的定位器。
    pub fn locator(&self) -> Option<&LocatorInfo> {
        self.locator.as_ref()
    }

    // ---- 派生 ----

    /// 替换身份。
    pub fn with_identity(&self, identity: Identity) -> Self {
        let mut reference = (*self.reference).clone();
        reference.identity = identity;
        self.derive(reference)
    }

    /// 替换切面。
    pub fn with_facet(&self, facet: impl Into<String>) -> Self {
        self.derive((*self.reference).clone().with_facet(facet))
    }

    /// 替换调用模式。
    pub fn with_mode(&self, mode: InvocationMode) -> Self {
        self.derive((*self.reference).clone().with_mode(mode))
    }

    /// 双向代理。
    pub fn twoway(&self) -> Self {
        self.with_mode(InvocationMode::Twoway)
    }

    /// 单向代理。
    pub fn oneway(&self) -> Self {
        self.with_mode(InvocationMode::Oneway)
    }

    /// 批量单向代理。
    pub fn batch_oneway(&self) -> Self {
        self.with_mode(InvocationMode::BatchOneway)
    }

    /// 替换参数编码版本。
    pub fn with_encoding(&self, encoding: EncodingVersion) -> Self {
        self.derive((*self.reference).clone().with_encoding(encoding))
    }

    /// 是否只使用安全端点。
    pub fn with_secure(&self, secure: bool) -> Self {
        let mut reference = (*self.reference).clone();
        reference.secure = secure;
        self.derive(reference)
    }

    /// 压缩覆盖；`None` 沿用端点设置。
    pub fn with_compress(&self, compress: Option<bool>) -> Self {
        let mut reference = (*self.reference).clone();
        reference.compress = compress;
        self.derive(reference)
    }

    /// 替换随调用发送的上下文。
    pub fn with_context(&self, context: Context) -> Self {
        let mut reference = (*self.reference).clone();
        reference.context = context;
        self.derive(reference)
    }

    /// 调用超时覆盖。
    pub fn with_invocation_timeout(&self, timeout: Option<Duration>) -> Self {
        let mut reference = (*self.reference).clone();
        reference.invocation_timeout = timeout;
        self.derive(reference)
    }

    /// 改为直接代理。
    pub fn with_endpoints(&self, endpoints: Vec<Endpoint>) -> Self {
        self.derive((*self.reference).clone().with_target(Target::Direct(endpoints)))
    }

    /// 改为经适配器标识间接寻址；空标识为知名对象。
    pub fn with_adapter_id(&self, adapter_id: impl Into<String>) -> Self {
        self.derive(
            (*self.reference)
                .clone()
                .with_target(Target::Indirect(adapter_id.into())),
        )
    }

    /// 固定到连接；之后的调用不再解析端点，也不经路由器。
    pub fn with_fixed_connection(&self, connection: Connection) -> Self {
        let mut proxy = self.derive(
            (*self.reference)
                .clone()
                .with_target(Target::Fixed(connection)),
        );
        proxy.router = None;
        proxy
    }

    /// 替换路由器；`None` 取消路由。
    pub fn with_router(&self, router: Option<&Proxy>) -> Self {
        let mut proxy = self.clone();
        proxy.router = router.map(|router| self.communicator.router_info(router.reference()));
        proxy
    }

    /// 替换定位器；`None` 取消定位器。
    pub fn with_locator(&self, locator: Option<&Proxy>) -> Self {
        let mut proxy = self.clone();
        proxy.locator =
            locator.map(|locator| self.communicator.locator_info(locator.reference()));
        proxy
    }

    // ---- 连接解析 ----

    /// 解析并返回承载调用的连接，必要时建连。
    pub async fn connection(&self) -> RpcResult<Connection> {
        if let Some(connection) = self.reference.fixed_connection() {
            if let Some(reason) = connection.close_reason() {
                return Err(RpcError::ConnectionClosed(reason));
            }
            return Ok(connection.clone());
        }
        if let Some(router) = &self.router {
            let endpoints = self.filter(router.client_endpoints().await?)?;
            let connection = self.communicator.get_connection(&endpoints).await?;
            router.add_proxy(&self.reference).await?;
            return Ok(connection);
        }
        match &self.reference.target {
            Target::Direct(endpoints) => {
                let endpoints = self.filter(endpoints.clone())?;
                self.communicator.get_connection(&endpoints).await
            }
            Target::Indirect(_) => self.locate_connection().await,
            Target::Fixed(_) => Err(RpcError::InvalidProxy(self.to_string())),
        }
    }

    async fn locate_connection(&self) -> RpcResult<Connection> {
        let locator = self.locator.as_ref().ok_or_else(|| {
            RpcError::NoEndpoint(format!("间接代理 `{self}` 未配置定位器"))
        })?;
        let (endpoints, cached) = locator.endpoints(&self.reference).await?;
        let result = match self.filter(endpoints) {
            Ok(endpoints) => self.communicator.get_connection(&endpoints).await,
            Err(err) => Err(err),
        };
        match result {
            Err(err) if cached => {
                tracing::debug!(
                    target: "spark_rpc::proxy",
                    proxy = %self,
                    error = %err,
                    "缓存端点不可用，清除定位器缓存后重试"
                );
                locator.clear_cache(&self.reference);
                let (endpoints, _) = locator.endpoints(&self.reference).await?;
                let endpoints = self.filter(endpoints)?;
                self.communicator.get_connection(&endpoints).await
            }
            other => other,
        }
    }

    fn filter(&self, endpoints: Vec<Endpoint>) -> RpcResult<Vec<Endpoint>> {
        let datagram = self.reference.mode.is_datagram();
        let transports = self.communicator.transports();
        let usable: Vec<Endpoint> = endpoints
            .into_iter()
            .filter(|endpoint| endpoint.info().is_datagram() == datagram)
            .filter(|endpoint| !self.reference.secure || endpoint.info().is_secure())
            .filter(|endpoint| transports.supports(endpoint))
            .collect();
        if usable.is_empty() {
            return Err(RpcError::NoEndpoint(self.to_string()));
        }
        Ok(usable)
    }

    // ---- 调用 ----

    /// 以代理上下文调用操作，返回结果封装；单向与批量调用返回空负载。
    pub async fn invoke(
        &self,
        operation: &str,
        mode: OperationMode,
        params: Bytes,
    ) -> RpcResult<Bytes> {
        self.invoke_with_context(operation, mode, params, None).await
    }

    /// 以显式上下文调用；`Some` 时取代代理上下文。
    pub async fn invoke_with_context(
        &self,
        operation: &str,
        mode: OperationMode,
        params: Bytes,
        context: Option<&Context>,
    ) -> RpcResult<Bytes> {
        let request = Request {
            request_id: 0,
            identity: self.reference.identity.clone(),
            facet: self.reference.facet.clone(),
            operation: operation.to_owned(),
            mode,
            context: context.unwrap_or(&self.reference.context).clone(),
            params,
        };
        let timeout = self
            .reference
            .invocation_timeout
            .or(self.communicator.config().invocation_timeout);
        run_with_timeout(timeout, self.send(request)).await
    }

    /// 可取消的调用；取消只放弃本地等待。
    pub fn invoke_cancellable(
        &self,
        operation: &str,
        mode: OperationMode,
        params: Bytes,
    ) -> Cancellable<Bytes> {
        let proxy = self.clone();
        let operation = operation.to_owned();
        Cancellable::new(async move { proxy.invoke(&operation, mode, params).await })
    }

    async fn send(&self, request: Request) -> RpcResult<Bytes> {
        let connection = self.connection().await?;
        let compress = self
            .reference
            .compress
            .unwrap_or_else(|| connection.endpoint().compress());
        tracing::trace!(
            target: "spark_rpc::proxy",
            proxy = %self,
            operation = %request.operation,
            connection = connection.id(),
            "发起调用"
        );
        match self.reference.mode {
            InvocationMode::Twoway => connection.invoke(request, compress).await?.into_result(),
            InvocationMode::Oneway | InvocationMode::Datagram => {
                connection.invoke_oneway(request, compress).await?;
                Ok(Bytes::new())
            }
            InvocationMode::BatchOneway | InvocationMode::BatchDatagram => {
                connection.queue_batch_request(&request, compress).await?;
                Ok(Bytes::new())
            }
        }
    }

    /// 冲刷本代理所用连接上的批量队列。
    pub async fn flush_batch_requests(&self) -> RpcResult<()> {
        self.connection().await?.flush_batch_requests().await
    }

    fn require_twoway(&self, operation: &str) -> RpcResult<()> {
        if self.reference.mode.is_twoway() {
            Ok(())
        } else {
            Err(RpcError::FeatureNotSupported(format!(
                "`{operation}` 需要双向代理"
            )))
        }
    }

    /// 探测对象是否存在。
    pub async fn ping(&self) -> RpcResult<()> {
        self.invoke("ice_ping", OperationMode::Nonmutating, self.empty_params())
            .await
            .map(drop)
    }

    /// 对象是否支持给定类型。
    pub async fn is_a(&self, type_id: &str) -> RpcResult<bool> {
        self.require_twoway("ice_isA")?;
        let params = self.encode_params(|out| {
            out.write_string(type_id);
            Ok::<_, RpcError>(())
        })?;
        let result = self
            .invoke("ice_isA", OperationMode::Nonmutating, params)
            .await?;
        self.decode_result(&result, |input| input.read_bool())
    }

    /// 对象支持的全部类型标识，按字典序。
    pub async fn ids(&self) -> RpcResult<Vec<String>> {
        self.require_twoway("ice_ids")?;
        let result = self
            .invoke("ice_ids", OperationMode::Nonmutating, self.empty_params())
            .await?;
        self.decode_result(&result, |input| input.read_string_seq())
    }

    /// 对象的最派生类型标识。
    pub async fn id(&self) -> RpcResult<String> {
        self.require_twoway("ice_id")?;
        let result = self
            .invoke("ice_id", OperationMode::Nonmutating, self.empty_params())
            .await?;
        self.decode_result(&result, |input| input.read_string())
    }

    // ---- 编解码辅助 ----

    /// 以代理的编码版本与通信器默认格式编码参数封装。
    pub fn encode_params<F, E>(&self, write: F) -> RpcResult<Bytes>
    where
        F: FnOnce(&mut OutputStream) -> Result<(), E>,
        E: Into<RpcError>,
    {
        let mut out = OutputStream::with_encoding(self.reference.encoding);
        out.set_format(self.communicator.config().default_format);
        out.start_encapsulation();
        write(&mut out).map_err(Into::into)?;
        out.end_encapsulation()?;
        Ok(out.into_bytes())
    }

    /// 空参数封装。
    pub fn empty_params(&self) -> Bytes {
        let mut out = OutputStream::new();
        out.write_empty_encapsulation(self.reference.encoding);
        out.into_bytes()
    }

    /// 解码结果封装；类实例使用通信器的类型上下文。
    pub fn decode_result<T, F, E>(&self, result: &[u8], read: F) -> RpcResult<T>
    where
        F: FnOnce(&mut InputStream<'_>) -> Result<T, E>,
        E: Into<RpcError>,
    {
        let mut input = InputStream::new(result).with_context(self.communicator.wire_context());
        input.start_encapsulation()?;
        let value = read(&mut input).map_err(Into::into)?;
        input.end_encapsulation()?;
        Ok(value)
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.reference, f)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("reference", &self.reference)
            .field("router", &self.router.as_ref().map(RouterInfo::identity))
            .field("locator", &self.locator.as_ref().map(LocatorInfo::identity))
            .finish_non_exhaustive()
    }
}
