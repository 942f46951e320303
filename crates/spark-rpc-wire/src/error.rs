//! 线格式编解码错误定义。
//!
//! # 教案定位（Why）
//! - 解码失败必须精确到“哪个字段、为什么”，连接层据此决定是否拆除连接，调用方据此决定是否重试。
//! - 错误与编解码逻辑分离，`input`/`output`/`slicing` 三个模块共享同一组变体。
//!
//! # 使用契约（What）
//! - 每个变体通过 [`WireError::kind`] 归入三类之一：格式损坏、类型未注册、类型不匹配；
//! - [`WireError::code`] 提供稳定的点分错误码，便于日志检索与告警聚合；
//! - 所有变体实现 `Clone`/`PartialEq`，测试可直接断言具体分支。

use crate::{optional::OptionalFormat, version::EncodingVersion};
use thiserror::Error;

/// 解码/编码结果别名。
pub type WireResult<T> = Result<T, WireError>;

/// 线格式错误的粗粒度分类。
///
/// 连接层只关心分类：`MalformedEncoding` 会使当前连接失效，另外两类仅影响当前消息。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WireErrorKind {
    /// 字节流本身不符合协议。
    MalformedEncoding,
    /// 字节流合法，但本端找不到能够实例化的类型。
    TypeNotRegistered,
    /// 解出的实例与调用点期望的静态类型不兼容。
    TypeMismatch,
}

/// 编解码过程中可能出现的错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// 剩余字节不足以完成当前读取。
    #[error("缓冲区截断：需要 {needed} 字节，仅剩 {remaining} 字节")]
    Truncated {
        /// 当前读取需要的字节数。
        needed: usize,
        /// 缓冲区剩余字节数。
        remaining: usize,
    },
    /// 可选成员的 tag 为负数。
    #[error("非法的可选成员 tag：{0}")]
    InvalidTag(i32),
    /// 长度字段为负数。
    #[error("非法的长度字段：{0}")]
    NegativeSize(i32),
    /// 序列声明的元素个数超过剩余字节能够容纳的上限。
    #[error("序列长度 {count} 超出剩余 {remaining} 字节可容纳的范围")]
    SequenceTooLarge {
        /// 声明的元素个数。
        count: usize,
        /// 缓冲区剩余字节数。
        remaining: usize,
    },
    /// 字符串内容不是合法的 UTF-8。
    #[error("字符串不是合法的 UTF-8")]
    InvalidUtf8,
    /// 枚举值超出声明的取值范围。
    #[error("枚举值 {value} 超出上限 {max}")]
    EnumOutOfRange {
        /// 实际读到（或待写出）的枚举值。
        value: i32,
        /// 声明的最大枚举值。
        max: i32,
    },
    /// 可选成员头部的格式码与期望不一致。
    #[error("可选成员 tag={tag} 格式不匹配：期望 {expected:?}，实际 {found:?}")]
    OptionalFormatMismatch {
        /// 成员标签。
        tag: i32,
        /// 调用点期望的格式。
        expected: OptionalFormat,
        /// 头部携带的格式。
        found: OptionalFormat,
    },
    /// 封装头部声明的长度非法。
    #[error("封装长度 {0} 非法")]
    InvalidEncapsulation(i32),
    /// 封装解码结束时读位置与声明长度不一致。
    #[error("封装长度与解码位置不一致：声明结束于 {declared_end}，实际位于 {position}")]
    EncapsulationSizeMismatch {
        /// 头部声明的结束偏移。
        declared_end: usize,
        /// 当前读位置。
        position: usize,
    },
    /// 封装声明了本端不支持的编码版本。
    #[error("不支持的编码版本 {0}")]
    UnsupportedEncoding(EncodingVersion),
    /// 调用顺序错误，例如在没有封装时结束封装。
    #[error("编解码调用顺序错误：{0}")]
    InvalidState(&'static str),
    /// 实例引用编号非法或指向尚未出现的实例。
    #[error("非法的实例引用编号 {0}")]
    InvalidInstanceReference(i32),
    /// 外层实例解码完成时仍存在未兑现的补丁。
    #[error("存在未解析的实例引用：{0} 个编号从未出现对应实例")]
    UnresolvedReferences(usize),
    /// 切片结构损坏（间接表、标志位、切片长度等）。
    #[error("切片结构损坏：{0}")]
    InvalidSlice(&'static str),
    /// 类图嵌套深度超过上限。
    #[error("类图深度超过上限 {0}")]
    ClassGraphDepthExceeded(usize),
    /// 切片链上没有任何类型可以实例化。
    #[error("类型 `{type_id}` 无可用工厂：{reason}")]
    NoFactory {
        /// 最近一次尝试的类型标识。
        type_id: String,
        /// 失败原因（紧凑格式禁止切片 / 切片链耗尽等）。
        reason: &'static str,
    },
    /// 用户异常的所有切片都无法识别。
    #[error("未知的用户异常 `{type_id}`")]
    UnknownUserException {
        /// 最派生的异常类型标识。
        type_id: String,
    },
    /// 找不到类型描述符。
    #[error("缺少类型描述符 `{0}`")]
    MissingDescriptor(String),
    /// 数据与声明的成员类型不一致，或实例与静态类型不兼容。
    #[error("类型不匹配：期望 `{expected}`，实际 `{found}`")]
    TypeMismatch {
        /// 调用点期望的类型。
        expected: String,
        /// 实际的数据或实例类型。
        found: String,
    },
}

impl WireError {
    /// 将错误归入三类之一。
    pub fn kind(&self) -> WireErrorKind {
        match self {
            WireError::NoFactory { .. }
            | WireError::UnknownUserException { .. }
            | WireError::MissingDescriptor(_) => WireErrorKind::TypeNotRegistered,
            WireError::TypeMismatch { .. } => WireErrorKind::TypeMismatch,
            _ => WireErrorKind::MalformedEncoding,
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            WireError::Truncated { .. } => "spark.rpc.wire.truncated",
            WireError::NegativeSize(_) | WireError::SequenceTooLarge { .. } => {
                "spark.rpc.wire.invalid_size"
            }
            WireError::InvalidUtf8 => "spark.rpc.wire.invalid_utf8",
            WireError::EnumOutOfRange { .. } => "spark.rpc.wire.enum_out_of_range",
            WireError::OptionalFormatMismatch { .. } => "spark.rpc.wire.optional_format",
            WireError::InvalidTag(_) => "spark.rpc.wire.invalid_tag",
            WireError::InvalidEncapsulation(_) | WireError::EncapsulationSizeMismatch { .. } => {
                "spark.rpc.wire.encapsulation"
            }
            WireError::UnsupportedEncoding(_) => "spark.rpc.wire.unsupported_encoding",
            WireError::InvalidState(_) => "spark.rpc.wire.invalid_state",
            WireError::InvalidInstanceReference(_) | WireError::UnresolvedReferences(_) => {
                "spark.rpc.wire.instance_reference"
            }
            WireError::InvalidSlice(_) => "spark.rpc.wire.invalid_slice",
            WireError::ClassGraphDepthExceeded(_) => "spark.rpc.wire.class_graph_depth",
            WireError::NoFactory { .. } => "spark.rpc.wire.no_factory",
            WireError::UnknownUserException { .. } => "spark.rpc.wire.unknown_user_exception",
            WireError::MissingDescriptor(_) => "spark.rpc.wire.missing_descriptor",
            WireError::TypeMismatch { .. } => "spark.rpc.wire.type_mismatch",
        }
    }

    /// 是否属于格式损坏类错误。
    pub fn is_malformed(&self) -> bool {
        self.kind() == WireErrorKind::MalformedEncoding
    }
}
