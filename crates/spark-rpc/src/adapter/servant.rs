//! 服务对象、分发上下文与服务对象定位器。

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use spark_rpc_wire::{
    EncodingVersion, FormatType, InputStream, Instance, InstanceGraph, OutputStream,
    ROOT_TYPE_ID, WireContext, WireError, WireResult,
};
use thiserror::Error;

use crate::connection::Connection;
use crate::error::RpcError;
use crate::identity::Identity;
use crate::protocol::{Context, OperationMode, ReplyBody};

use super::ObjectAdapter;

/// 一次分发的上下文。
#[derive(Clone)]
pub struct Current {
    /// 接收请求的适配器。
    pub adapter: ObjectAdapter,
    /// 请求到达的连接；进程内直接分发时为 `None`。
    pub connection: Option<Connection>,
    /// 目标身份。
    pub identity: Identity,
    /// 目标切面。
    pub facet: String,
    /// 操作名。
    pub operation: String,
    /// 调用模式。
    pub mode: OperationMode,
    /// 请求上下文。
    pub context: Context,
    /// 请求编号；单向与批量请求为 0。
    pub request_id: i32,
    /// 参数封装的编码版本，回复沿用同一版本。
    pub encoding: EncodingVersion,
}

impl Current {
    /// 调用方是否不等待回复。
    pub fn is_oneway(&self) -> bool {
        self.request_id == 0
    }

    /// 解码参数封装。
    pub fn read_params<T, F>(&self, params: &[u8], read: F) -> Result<T, DispatchError>
    where
        F: FnOnce(&mut InputStream<'_>) -> WireResult<T>,
    {
        let mut input = InputStream::new(params).with_context(self.wire_context());
        input.start_encapsulation()?;
        let value = read(&mut input)?;
        input.end_encapsulation()?;
        Ok(value)
    }

    /// 以请求的编码版本编码返回值封装。
    pub fn write_result<F>(&self, write: F) -> Result<Bytes, DispatchError>
    where
        F: FnOnce(&mut OutputStream) -> WireResult<()>,
    {
        let mut out = OutputStream::with_encoding(self.encoding);
        out.set_format(self.adapter.default_format());
        out.start_encapsulation();
        write(&mut out)?;
        out.end_encapsulation()?;
        Ok(out.into_bytes())
    }

    /// 无返回值操作的回复封装。
    pub fn empty_result(&self) -> Bytes {
        let mut out = OutputStream::new();
        out.write_empty_encapsulation(self.encoding);
        out.into_bytes()
    }

    /// 把用户异常编码为分发错误；用户异常总以分片格式发送。
    pub fn user_exception(&self, graph: &InstanceGraph, exception: &Instance) -> DispatchError {
        let mut out = OutputStream::with_encoding(self.encoding);
        out.start_encapsulation_with(self.encoding, FormatType::Sliced);
        let encoded = out
            .write_exception(graph, exception)
            .and_then(|()| out.end_encapsulation());
        match encoded {
            Ok(()) => DispatchError::UserException(out.into_bytes()),
            Err(err) => DispatchError::from(err),
        }
    }

    fn wire_context(&self) -> Arc<WireContext> {
        self.adapter.wire_context()
    }
}

impl fmt::Debug for Current {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Current")
            .field("adapter", &self.adapter.name())
            .field("identity", &self.identity)
            .field("facet", &self.facet)
            .field("operation", &self.operation)
            .field("mode", &self.mode)
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

/// 分发失败；除用户异常外都映射为对应的回复状态。
#[derive(Clone, Debug, Error)]
pub enum DispatchError {
    /// 用户异常，负载为异常封装。
    #[error("用户异常（{} 字节）", .0.len())]
    UserException(Bytes),
    /// 对象不存在。
    #[error("对象不存在")]
    ObjectNotExist,
    /// 切面不存在。
    #[error("切面不存在")]
    FacetNotExist,
    /// 操作不存在。
    #[error("操作不存在")]
    OperationNotExist,
    /// 服务端本地失败。
    #[error("未知本地异常：{0}")]
    UnknownLocal(String),
    /// 未声明的用户异常。
    #[error("未知用户异常：{0}")]
    UnknownUser(String),
    /// 其他失败。
    #[error("未知异常：{0}")]
    Unknown(String),
}

impl DispatchError {
    pub(crate) fn into_reply(self, current: &Current) -> ReplyBody {
        let target = || (current.identity.clone(), current.facet.clone(), current.operation.clone());
        match self {
            DispatchError::UserException(encaps) => ReplyBody::UserException(encaps),
            DispatchError::ObjectNotExist => {
                let (identity, facet, operation) = target();
                ReplyBody::ObjectNotExist { identity, facet, operation }
            }
            DispatchError::FacetNotExist => {
                let (identity, facet, operation) = target();
                ReplyBody::FacetNotExist { identity, facet, operation }
            }
            DispatchError::OperationNotExist => {
                let (identity, facet, operation) = target();
                ReplyBody::OperationNotExist { identity, facet, operation }
            }
            DispatchError::UnknownLocal(text) => ReplyBody::UnknownLocal(text),
            DispatchError::UnknownUser(text) => ReplyBody::UnknownUser(text),
            DispatchError::Unknown(text) => ReplyBody::Unknown(text),
        }
    }
}

impl From<WireError> for DispatchError {
    fn from(err: WireError) -> Self {
        DispatchError::UnknownLocal(format!("[{}] {err}", err.code()))
    }
}

impl From<RpcError> for DispatchError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::UserException(encaps) => DispatchError::UserException(encaps),
            RpcError::ObjectNotExist { .. } => DispatchError::ObjectNotExist,
            RpcError::FacetNotExist { .. } => DispatchError::FacetNotExist,
            RpcError::OperationNotExist { .. } => DispatchError::OperationNotExist,
            RpcError::UnknownUser(text) => DispatchError::UnknownUser(text),
            other => DispatchError::UnknownLocal(format!("[{}] {other}", other.code())),
        }
    }
}

/// 服务对象：实现一个或多个身份上的操作。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - `params` 为完整的参数封装（含 6 字节头部），返回值同样是完整封装；
///   借助 [`Current::read_params`] 与 [`Current::write_result`] 编解码；
/// - `type_ids` 第一个元素为最派生类型，内建操作 `ice_isA`/`ice_ids`/`ice_id` 依据它应答，
///   `ice_ping` 总是成功；这些操作不会进入 `dispatch`。
#[async_trait]
pub trait Servant: Send + Sync + 'static {
    /// 执行一次操作。
    async fn dispatch(&self, current: &Current, params: Bytes) -> Result<Bytes, DispatchError>;

    /// 支持的类型标识。
    fn type_ids(&self) -> Vec<String> {
        vec![ROOT_TYPE_ID.to_owned()]
    }
}

/// 以闭包实现的服务对象。
pub struct FnServant<F> {
    handler: F,
    type_ids: Vec<String>,
}

impl<F, Fut> FnServant<F>
where
    F: Fn(Current, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, DispatchError>> + Send + 'static,
{
    /// 包装闭包，类型标识为根类型。
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            type_ids: vec![ROOT_TYPE_ID.to_owned()],
        }
    }

    /// 声明支持的类型标识，最派生类型在前。
    pub fn with_type_ids<I, S>(mut self, type_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.type_ids = type_ids.into_iter().map(Into::into).collect();
        if !self.type_ids.iter().any(|id| id == ROOT_TYPE_ID) {
            self.type_ids.push(ROOT_TYPE_ID.to_owned());
        }
        self
    }
}

#[async_trait]
impl<F, Fut> Servant for FnServant<F>
where
    F: Fn(Current, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, DispatchError>> + Send + 'static,
{
    async fn dispatch(&self, current: &Current, params: Bytes) -> Result<Bytes, DispatchError> {
        (self.handler)(current.clone(), params).await
    }

    fn type_ids(&self) -> Vec<String> {
        self.type_ids.clone()
    }
}

/// 定位器在 `locate` 时分配、在 `finished` 时取回的不透明数据。
pub type Cookie = Option<Arc<dyn Any + Send + Sync>>;

/// 服务对象定位器：按需提供服务对象。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - `locate` 返回 `None` 表示找不到，适配器回复“对象不存在”；
/// - `locate` 成功返回服务对象后，`finished` 恰好调用一次，无论分发成功、失败、
///   panic 还是分发任务被丢弃；`finished` 返回的错误替换分发结果；
/// - `finished` 与 `deactivate` 为同步方法，调用时不持有任何运行时锁。
#[async_trait]
pub trait ServantLocator: Send + Sync + 'static {
    /// 为当前请求定位服务对象。
    async fn locate(
        &self,
        current: &Current,
    ) -> Result<Option<(Arc<dyn Servant>, Cookie)>, DispatchError>;

    /// 分发结束后释放 `locate` 分配的资源。
    fn finished(
        &self,
        current: &Current,
        servant: &Arc<dyn Servant>,
        cookie: Cookie,
    ) -> Result<(), DispatchError>;

    /// 适配器销毁时调用。
    fn deactivate(&self, category: &str);
}

/// 保证 `finished` 恰好调用一次的守卫。
pub(crate) struct LocatorGuard {
    locator: Arc<dyn ServantLocator>,
    current: Current,
    servant: Arc<dyn Servant>,
    cookie: Cookie,
    done: bool,
}

impl LocatorGuard {
    pub(crate) fn new(
        locator: Arc<dyn ServantLocator>,
        current: Current,
        servant: Arc<dyn Servant>,
        cookie: Cookie,
    ) -> Self {
        Self {
            locator,
            current,
            servant,
            cookie,
            done: false,
        }
    }

    pub(crate) fn finish(mut self) -> Result<(), DispatchError> {
        self.run()
    }

    fn run(&mut self) -> Result<(), DispatchError> {
        if std::mem::replace(&mut self.done, true) {
            return Ok(());
        }
        self.locator
            .finished(&self.current, &self.servant, self.cookie.take())
    }
}

impl Drop for LocatorGuard {
    fn drop(&mut self) {
        if let Err(err) = self.run() {
            tracing::debug!(
                target: "spark_rpc::adapter",
                identity = %self.current.identity,
                operation = %self.current.operation,
                error = %err,
                "分发中断后定位器 finished 失败"
            );
        }
    }
}
