//! 传输层错误定义与 IO 错误映射工具。
//!
//! # 教案定位（Why）
//! - 连接层需要区分“对端拒绝”“连接被重置”“本端超时”等情形，以便生成正确的关闭原因；
//! - 各传输实现共享同一套错误结构，连接层无需感知具体介质。
//!
//! # 使用契约（What）
//! - [`TransportError::code`] 为稳定的点分错误码，具体实现通过 [`OperationKind`] 声明自己的前缀；
//! - [`TransportError::kind`] 提供粗粒度分类；
//! - 原始 `io::Error` 以 `Arc` 形式保留，错误本身可以被克隆并在多个等待者之间共享。

use std::{fmt, io, sync::Arc};
use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub struct OperationKind {
    /// 稳定错误码。
    pub code: &'static str,
    /// 错误文案前缀。
    pub message: &'static str,
}

const TIMEOUT_CODE: &str = "spark.rpc.transport.timeout";
const CLOSED_CODE: &str = "spark.rpc.transport.closed";

/// 传输错误的粗粒度分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// 对端拒绝连接或监听名不存在。
    Refused,
    /// 连接在使用中被对端重置或中止。
    Reset,
    /// 本端已关闭该传输对象。
    Closed,
    /// 操作超过配置的超时时间。
    Timeout,
    /// 监听地址已被占用。
    AddrInUse,
    /// 端点字符串或端点参数非法。
    InvalidEndpoint,
    /// 没有注册能够处理该端点的传输实现。
    Unsupported,
    /// 其他 IO 失败。
    Io,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransportErrorKind::Refused => "refused",
            TransportErrorKind::Reset => "reset",
            TransportErrorKind::Closed => "closed",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::AddrInUse => "addr_in_use",
            TransportErrorKind::InvalidEndpoint => "invalid_endpoint",
            TransportErrorKind::Unsupported => "unsupported",
            TransportErrorKind::Io => "io",
        };
        f.write_str(text)
    }
}

/// 传输操作失败。
#[derive(Clone, Debug, Error)]
#[error("[{code}] {message}")]
pub struct TransportError {
    code: &'static str,
    message: String,
    kind: TransportErrorKind,
    #[source]
    source: Option<Arc<io::Error>>,
}

impl TransportError {
    /// 以错误码、分类与文案构造错误。
    pub fn new(code: &'static str, kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            kind,
            source: None,
        }
    }

    /// 构造“本端已关闭”错误。
    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(CLOSED_CODE, TransportErrorKind::Closed, message)
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 错误文案。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 粗粒度分类。
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// 原始 IO 错误（若有）。
    pub fn io_source(&self) -> Option<&io::Error> {
        self.source.as_deref()
    }
}

/// 将 IO 错误映射为传输错误，并附带错误分类。
pub fn map_io_error(kind: OperationKind, error: io::Error) -> TransportError {
    TransportError {
        code: kind.code,
        message: format!("{}: {}", kind.message, error),
        kind: categorize_io_error(&error),
        source: Some(Arc::new(error)),
    }
}

/// 构造超时错误。
pub fn timeout_error(kind: OperationKind) -> TransportError {
    TransportError::new(
        TIMEOUT_CODE,
        TransportErrorKind::Timeout,
        format!("{} timed out", kind.message),
    )
}

fn categorize_io_error(error: &io::Error) -> TransportErrorKind {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => TransportErrorKind::Timeout,
        ErrorKind::ConnectionRefused | ErrorKind::NotFound => TransportErrorKind::Refused,
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::WriteZero => TransportErrorKind::Reset,
        ErrorKind::NotConnected => TransportErrorKind::Closed,
        ErrorKind::AddrInUse => TransportErrorKind::AddrInUse,
        ErrorKind::AddrNotAvailable | ErrorKind::InvalidInput => {
            TransportErrorKind::InvalidEndpoint
        }
        ErrorKind::Unsupported => TransportErrorKind::Unsupported,
        _ => TransportErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const READ: OperationKind = OperationKind {
        code: "spark.rpc.transport.test.read_failed",
        message: "test read",
    };

    #[test]
    fn io_errors_keep_cause_and_category() {
        let err = map_io_error(READ, io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(err.code(), "spark.rpc.transport.test.read_failed");
        assert_eq!(err.kind(), TransportErrorKind::Reset);
        assert_eq!(
            err.io_source().map(io::Error::kind),
            Some(io::ErrorKind::ConnectionReset)
        );
        let cloned = err.clone();
        assert_eq!(cloned.to_string(), err.to_string());
    }

    #[test]
    fn timeout_uses_shared_code() {
        let err = timeout_error(READ);
        assert_eq!(err.kind(), TransportErrorKind::Timeout);
        assert_eq!(err.code(), "spark.rpc.transport.timeout");
        assert!(err.message().contains("test read"));
    }
}
