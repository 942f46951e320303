//! 协议与编码版本。

use std::fmt;
use std::str::FromStr;

/// 数据编码版本（封装头部中的 `major.minor`）。
///
/// - `1.0`：不支持可选成员，类实例不在本实现范围内；
/// - `1.1`：支持可选成员、紧凑/切片两种类格式。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EncodingVersion {
    /// 主版本号。
    pub major: u8,
    /// 次版本号。
    pub minor: u8,
}

/// 编码 1.0。
pub const ENCODING_1_0: EncodingVersion = EncodingVersion { major: 1, minor: 0 };
/// 编码 1.1。
pub const ENCODING_1_1: EncodingVersion = EncodingVersion { major: 1, minor: 1 };

impl EncodingVersion {
    /// 构造版本号。
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// 本实现能否解码该版本。
    pub fn is_supported(self) -> bool {
        self == ENCODING_1_0 || self == ENCODING_1_1
    }

    /// 该版本是否支持可选成员。
    pub fn supports_optionals(self) -> bool {
        self != ENCODING_1_0
    }
}

impl Default for EncodingVersion {
    fn default() -> Self {
        ENCODING_1_1
    }
}

impl fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// 版本字符串解析失败。
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("非法的版本字符串 `{0}`")]
pub struct ParseVersionError(pub String);

impl FromStr for EncodingVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| ParseVersionError(s.to_owned()))?;
        let major = major
            .trim()
            .parse::<u8>()
            .map_err(|_| ParseVersionError(s.to_owned()))?;
        let minor = minor
            .trim()
            .parse::<u8>()
            .map_err(|_| ParseVersionError(s.to_owned()))?;
        Ok(Self { major, minor })
    }
}

/// 消息协议版本（消息头中的 `major.minor`）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    /// 主版本号。
    pub major: u8,
    /// 次版本号。
    pub minor: u8,
}

/// 协议 1.0，当前唯一的消息协议版本。
pub const PROTOCOL_1_0: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// 类与异常的切片格式。
///
/// - `Compact`：只在最派生切片写类型标识，接收端无法跳过未知切片；
/// - `Sliced`：每个切片都带类型标识与长度，接收端可以跳过并保留未知切片。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FormatType {
    /// 紧凑格式。
    #[default]
    Compact,
    /// 切片格式。
    Sliced,
}

impl FromStr for FormatType {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(FormatType::Compact),
            "sliced" => Ok(FormatType::Sliced),
            _ => Err(ParseVersionError(s.to_owned())),
        }
    }
}
