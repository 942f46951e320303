//! 运行时错误分类与关闭原因。
//!
//! # 教案定位（Why）
//! - 调用方需要知道失败属于哪一类：编码损坏、类型未注册、类型不匹配、连接故障、
//!   分发未命中、注册表冲突还是用户异常，才能决定重试、降级或上报；
//! - 连接一旦关闭，之后所有使用都必须看到同一个关闭原因，因此关闭原因是可克隆的值。
//!
//! # 使用契约（What）
//! - [`RpcError::category`] 给出粗粒度分类，[`RpcError::code`] 给出稳定错误码；
//! - [`CloseReason`] 保存在连接上，并通过 [`RpcError::ConnectionClosed`] 反复暴露；
//! - 传输层原始错误在 [`CloseReason::TransportAborted`] 中保留。

use std::fmt;

use spark_rpc_transport::TransportError;
use spark_rpc_wire::{WireError, WireErrorKind};
use thiserror::Error;

use crate::identity::Identity;

/// 运行时结果别名。
pub type RpcResult<T> = Result<T, RpcError>;

/// 错误的粗粒度分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// 字节流不符合协议（截断、越界长度、非法格式码、切片失衡、未知编码版本）。
    MalformedEncoding,
    /// 没有任何工厂能实例化收到的多态类型。
    TypeNotRegistered,
    /// 解出的实例与调用点期望的静态类型不兼容。
    TypeMismatch,
    /// 连接被对端、应用或传输层终止。
    ConnectionFault,
    /// 分发未命中对象、切面或操作。
    DispatchNotFound,
    /// 注册表不变量被破坏（重复添加、删除不存在的条目）。
    RegistryConflict,
    /// 服务端返回的用户级失败。
    UserFailure,
    /// 仅影响本端的其他失败（配置、超时、取消、无可用端点等）。
    Local,
}

/// 连接的终止原因。
#[derive(Clone, Debug)]
pub enum CloseReason {
    /// 对端发送了关闭通知。
    PeerClosed,
    /// 本端应用主动关闭。
    ApplicationClosed {
        /// 是否走优雅关闭流程。
        graceful: bool,
    },
    /// ACM 判定连接空闲并优雅关闭。
    IdleTimeout,
    /// ACM 判定对端无响应并强制关闭。
    PeerUnresponsive,
    /// 协议帧损坏，连接不可继续使用。
    ProtocolViolation {
        /// 损坏描述。
        message: String,
    },
    /// 传输层失败或对端未经关闭通知就断开。
    TransportAborted {
        /// 原始传输错误。
        cause: TransportError,
    },
    /// 所属对象适配器已停用。
    AdapterDeactivated,
    /// 所属通信器已销毁。
    CommunicatorDestroyed,
}

impl CloseReason {
    /// 是否由本端发起。
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            CloseReason::ApplicationClosed { .. }
                | CloseReason::IdleTimeout
                | CloseReason::AdapterDeactivated
                | CloseReason::CommunicatorDestroyed
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("对端已关闭连接"),
            CloseReason::ApplicationClosed { graceful: true } => f.write_str("应用优雅关闭连接"),
            CloseReason::ApplicationClosed { graceful: false } => f.write_str("应用强制关闭连接"),
            CloseReason::IdleTimeout => f.write_str("连接空闲超时"),
            CloseReason::PeerUnresponsive => f.write_str("对端无响应"),
            CloseReason::ProtocolViolation { message } => write!(f, "协议错误：{message}"),
            CloseReason::TransportAborted { cause } => write!(f, "传输中断：{cause}"),
            CloseReason::AdapterDeactivated => f.write_str("对象适配器已停用"),
            CloseReason::CommunicatorDestroyed => f.write_str("通信器已销毁"),
        }
    }
}

/// 运行时错误。
#[derive(Clone, Debug, Error)]
pub enum RpcError {
    /// 编解码失败。
    #[error(transparent)]
    Wire(#[from] WireError),
    /// 建连或监听阶段的传输失败。
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// 协议帧头或消息体不合法。
    #[error("协议错误：{0}")]
    Protocol(String),
    /// 消息超过 `message_size_max`。
    #[error("消息大小 {size} 超过上限 {max}")]
    MessageTooLarge {
        /// 消息字节数。
        size: usize,
        /// 配置的上限。
        max: usize,
    },
    /// 连接已关闭或正在关闭。
    #[error("连接不可用：{0}")]
    ConnectionClosed(CloseReason),
    /// 目标对象不存在。
    #[error("对象 `{identity}` 不存在（facet=`{facet}`，operation=`{operation}`）")]
    ObjectNotExist {
        /// 目标身份。
        identity: Identity,
        /// 目标切面。
        facet: String,
        /// 操作名。
        operation: String,
    },
    /// 对象存在但切面不存在。
    #[error("对象 `{identity}` 没有切面 `{facet}`（operation=`{operation}`）")]
    FacetNotExist {
        /// 目标身份。
        identity: Identity,
        /// 目标切面。
        facet: String,
        /// 操作名。
        operation: String,
    },
    /// 对象不支持该操作。
    #[error("对象 `{identity}` 不支持操作 `{operation}`")]
    OperationNotExist {
        /// 目标身份。
        identity: Identity,
        /// 目标切面。
        facet: String,
        /// 操作名。
        operation: String,
    },
    /// 服务端抛出用户异常，负载为包含异常的封装。
    #[error("服务端返回用户异常（{} 字节）", .0.len())]
    UserException(bytes::Bytes),
    /// 服务端发生本地异常。
    #[error("服务端未知本地异常：{0}")]
    UnknownLocal(String),
    /// 服务端抛出未声明的用户异常。
    #[error("服务端未知用户异常：{0}")]
    UnknownUser(String),
    /// 服务端发生未知失败。
    #[error("服务端未知异常：{0}")]
    Unknown(String),
    /// 注册表中已存在同名条目。
    #[error("{kind} `{id}` 已注册")]
    AlreadyRegistered {
        /// 条目种类。
        kind: &'static str,
        /// 条目标识。
        id: String,
    },
    /// 注册表中不存在该条目。
    #[error("{kind} `{id}` 未注册")]
    NotRegistered {
        /// 条目种类。
        kind: &'static str,
        /// 条目标识。
        id: String,
    },
    /// 身份非法（例如名称为空）。
    #[error("非法身份 `{0}`")]
    IllegalIdentity(String),
    /// 代理字符串或参数非法。
    #[error("非法代理：{0}")]
    InvalidProxy(String),
    /// 找不到可用的端点。
    #[error("没有可用端点：{0}")]
    NoEndpoint(String),
    /// 对象适配器已停用。
    #[error("对象适配器 `{0}` 已停用")]
    AdapterDeactivated(String),
    /// 通信器已销毁。
    #[error("通信器已销毁")]
    CommunicatorDestroyed,
    /// 调用超时。
    #[error("调用超时")]
    InvocationTimeout,
    /// 调用被本地取消。
    #[error("调用已取消")]
    InvocationCanceled,
    /// 当前配置或端点不支持该功能。
    #[error("不支持的功能：{0}")]
    FeatureNotSupported(String),
    /// 配置非法。
    #[error("配置错误：{0}")]
    Config(String),
}

impl RpcError {
    /// 粗粒度分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            RpcError::Wire(err) => match err.kind() {
                WireErrorKind::MalformedEncoding => ErrorCategory::MalformedEncoding,
                WireErrorKind::TypeNotRegistered => ErrorCategory::TypeNotRegistered,
                WireErrorKind::TypeMismatch => ErrorCategory::TypeMismatch,
            },
            RpcError::Protocol(_) | RpcError::MessageTooLarge { .. } => {
                ErrorCategory::MalformedEncoding
            }
            RpcError::Transport(_) | RpcError::ConnectionClosed(_) => {
                ErrorCategory::ConnectionFault
            }
            RpcError::ObjectNotExist { .. }
            | RpcError::FacetNotExist { .. }
            | RpcError::OperationNotExist { .. } => ErrorCategory::DispatchNotFound,
            RpcError::UserException(_)
            | RpcError::UnknownLocal(_)
            | RpcError::UnknownUser(_)
            | RpcError::Unknown(_) => ErrorCategory::UserFailure,
            RpcError::AlreadyRegistered { .. } | RpcError::NotRegistered { .. } => {
                ErrorCategory::RegistryConflict
            }
            RpcError::IllegalIdentity(_)
            | RpcError::InvalidProxy(_)
            | RpcError::NoEndpoint(_)
            | RpcError::AdapterDeactivated(_)
            | RpcError::CommunicatorDestroyed
            | RpcError::InvocationTimeout
            | RpcError::InvocationCanceled
            | RpcError::FeatureNotSupported(_)
            | RpcError::Config(_) => ErrorCategory::Local,
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::Wire(err) => err.code(),
            RpcError::Transport(err) => err.code(),
            RpcError::Protocol(_) => "spark.rpc.protocol.malformed",
            RpcError::MessageTooLarge { .. } => "spark.rpc.protocol.message_too_large",
            RpcError::ConnectionClosed(reason) => match reason {
                CloseReason::PeerClosed => "spark.rpc.connection.peer_closed",
                CloseReason::ApplicationClosed { .. } => "spark.rpc.connection.application_closed",
                CloseReason::IdleTimeout => "spark.rpc.connection.idle_timeout",
                CloseReason::PeerUnresponsive => "spark.rpc.connection.peer_unresponsive",
                CloseReason::ProtocolViolation { .. } => "spark.rpc.connection.protocol_violation",
                CloseReason::TransportAborted { .. } => "spark.rpc.connection.transport_aborted",
                CloseReason::AdapterDeactivated => "spark.rpc.connection.adapter_deactivated",
                CloseReason::CommunicatorDestroyed => {
                    "spark.rpc.connection.communicator_destroyed"
                }
            },
            RpcError::ObjectNotExist { .. } => "spark.rpc.dispatch.object_not_exist",
            RpcError::FacetNotExist { .. } => "spark.rpc.dispatch.facet_not_exist",
            RpcError::OperationNotExist { .. } => "spark.rpc.dispatch.operation_not_exist",
            RpcError::UserException(_) => "spark.rpc.dispatch.user_exception",
            RpcError::UnknownLocal(_) => "spark.rpc.dispatch.unknown_local",
            RpcError::UnknownUser(_) => "spark.rpc.dispatch.unknown_user",
            RpcError::Unknown(_) => "spark.rpc.dispatch.unknown",
            RpcError::AlreadyRegistered { .. } => "spark.rpc.registry.already_registered",
            RpcError::NotRegistered { .. } => "spark.rpc.registry.not_registered",
            RpcError::IllegalIdentity(_) => "spark.rpc.identity.illegal",
            RpcError::InvalidProxy(_) => "spark.rpc.proxy.invalid",
            RpcError::NoEndpoint(_) => "spark.rpc.proxy.no_endpoint",
            RpcError::AdapterDeactivated(_) => "spark.rpc.adapter.deactivated",
            RpcError::CommunicatorDestroyed => "spark.rpc.communicator.destroyed",
            RpcError::InvocationTimeout => "spark.rpc.invocation.timeout",
            RpcError::InvocationCanceled => "spark.rpc.invocation.canceled",
            RpcError::FeatureNotSupported(_) => "spark.rpc.feature_not_supported",
            RpcError::Config(_) => "spark.rpc.config.invalid",
        }
    }

    /// 连接关闭原因（若为连接故障）。
    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            RpcError::ConnectionClosed(reason) => Some(reason),
            _ => None,
        }
    }

    /// 构造“已注册”冲突。
    pub(crate) fn already_registered(kind: &'static str, id: impl Into<String>) -> Self {
        RpcError::AlreadyRegistered {
            kind,
            id: id.into(),
        }
    }

    /// 构造“未注册”冲突。
    pub(crate) fn not_registered(kind: &'static str, id: impl Into<String>) -> Self {
        RpcError::NotRegistered {
            kind,
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_the_taxonomy() {
        let wire = RpcError::from(WireError::Truncated {
            needed: 4,
            remaining: 0,
        });
        assert_eq!(wire.category(), ErrorCategory::MalformedEncoding);
        assert_eq!(wire.code(), "spark.rpc.wire.truncated");

        let closed = RpcError::ConnectionClosed(CloseReason::PeerClosed);
        assert_eq!(closed.category(), ErrorCategory::ConnectionFault);
        assert!(matches!(closed.close_reason(), Some(CloseReason::PeerClosed)));

        let conflict = RpcError::already_registered("servant", "a/b");
        assert_eq!(conflict.category(), ErrorCategory::RegistryConflict);
        assert_eq!(conflict.to_string(), "servant `a/b` 已注册");

        let missing = RpcError::FacetNotExist {
            identity: Identity::new("x", ""),
            facet: "admin".into(),
            operation: "op".into(),
        };
        assert_eq!(missing.category(), ErrorCategory::DispatchNotFound);
    }

    #[test]
    fn close_reasons_know_their_origin() {
        assert!(CloseReason::ApplicationClosed { graceful: true }.is_local());
        assert!(!CloseReason::PeerClosed.is_local());
        assert_eq!(CloseReason::IdleTimeout.to_string(), "连接空闲超时");
    }
}
