//! 运行时配置。
//!
//! # 教案定位（Why）
//! - ACM、消息上限、批量策略、编码默认值等参数既要能从 TOML 文件加载，也要能在代码中逐项覆盖；
//! - TOML 中的 `[client.acm]` 与 `[server.acm]` 允许只写部分字段，缺省字段沿用各自一侧的默认值，
//!   因此解析分两步：先反序列化为全可选的 `*Repr`，再与默认值合并并校验。
//!
//! # 使用契约（What）
//! - [`RpcConfig::from_toml_str`] 解析并校验，未知字段视为错误；
//! - [`RpcConfig::default`] 与 `with_*` 构造器用于代码内配置；
//! - 校验失败返回 [`RpcError::Config`]。
//!
//! # 示例
//! ```toml
//! message_size_max = 1048576
//! compress_batch = "based_on_proxy"
//! graceful_in_flight = "complete"
//!
//! [client.acm]
//! timeout_secs = 30
//! close = "on_idle"
//! heartbeat = "always"
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use spark_rpc_wire::{
    DEFAULT_CLASS_GRAPH_DEPTH_MAX, ENCODING_1_1, EncodingVersion, FormatType,
};

use crate::error::{RpcError, RpcResult};
use crate::protocol::HEADER_SIZE;

/// ACM 关闭策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcmClose {
    /// 从不因空闲关闭。
    Off,
    /// 空闲且无未决调用时优雅关闭。
    OnIdle,
    /// 存在未决调用且对端长期无响应时强制关闭。
    #[default]
    OnInvocation,
    /// 同时具备 `OnIdle` 与 `OnInvocation` 的行为。
    OnInvocationAndIdle,
    /// 空闲超时即强制关闭，不论是否有未决调用。
    OnIdleForceful,
}

/// ACM 心跳策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcmHeartbeat {
    /// 不发送心跳。
    Off,
    /// 仅在有分发进行中时发送心跳。
    #[default]
    OnDispatch,
    /// 连接空闲时发送心跳。
    OnIdle,
    /// 每个周期都发送心跳。
    Always,
}

/// 单条连接的 ACM 配置。
///
/// `timeout` 为零表示关闭 ACM：既不心跳也不自动关闭。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcmConfig {
    /// 空闲超时。
    pub timeout: Duration,
    /// 关闭策略。
    pub close: AcmClose,
    /// 心跳策略。
    pub heartbeat: AcmHeartbeat,
}

impl AcmConfig {
    /// 默认超时。
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// 构造配置。
    pub const fn new(timeout: Duration, close: AcmClose, heartbeat: AcmHeartbeat) -> Self {
        Self {
            timeout,
            close,
            heartbeat,
        }
    }

    /// 客户端默认值：空闲或对端无响应时关闭，分发期间心跳。
    pub const fn client_default() -> Self {
        Self::new(
            Self::DEFAULT_TIMEOUT,
            AcmClose::OnInvocationAndIdle,
            AcmHeartbeat::OnDispatch,
        )
    }

    /// 服务端默认值：只在对端无响应时关闭，分发期间心跳。
    pub const fn server_default() -> Self {
        Self::new(
            Self::DEFAULT_TIMEOUT,
            AcmClose::OnInvocation,
            AcmHeartbeat::OnDispatch,
        )
    }

    /// 完全关闭 ACM。
    pub const fn disabled() -> Self {
        Self::new(Duration::ZERO, AcmClose::Off, AcmHeartbeat::Off)
    }

    /// 是否需要被监视器跟踪。
    pub fn is_enabled(&self) -> bool {
        !self.timeout.is_zero()
            && (self.close != AcmClose::Off || self.heartbeat != AcmHeartbeat::Off)
    }
}

/// 批量请求的压缩策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressBatch {
    /// 总是尝试压缩。
    Yes,
    /// 从不压缩。
    No,
    /// 队列中任一请求来自要求压缩的代理时压缩。
    #[default]
    BasedOnProxy,
}

/// 优雅关闭时本端仍在等待回复的调用如何处理。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GracefulInFlight {
    /// 立即以连接关闭错误失败。
    #[default]
    Fail,
    /// 允许在对端关闭前继续等待回复。
    Complete,
}

/// 运行时配置。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcConfig {
    /// 出站连接的 ACM 配置。
    pub client_acm: AcmConfig,
    /// 入站连接的 ACM 配置。
    pub server_acm: AcmConfig,
    /// 单帧最大字节数（含头部）。
    pub message_size_max: usize,
    /// 批量队列自动冲刷阈值；0 表示不自动冲刷。
    pub batch_auto_flush_size: usize,
    /// 批量压缩策略。
    pub compress_batch: CompressBatch,
    /// 类图最大嵌套深度。
    pub class_graph_depth_max: usize,
    /// 新代理的默认编码版本。
    pub default_encoding: EncodingVersion,
    /// 类与异常的默认切片格式。
    pub default_format: FormatType,
    /// 优雅关闭等待对端完成的上限，超时后强制关闭。
    pub close_timeout: Duration,
    /// 调用超时；`None` 表示无限等待。
    pub invocation_timeout: Option<Duration>,
    /// 定位器缓存有效期；`None` 表示永不过期，零表示不缓存。
    pub locator_cache_timeout: Option<Duration>,
    /// 优雅关闭时未决调用的处理方式。
    pub graceful_in_flight: GracefulInFlight,
    /// 是否保留未知切片以便原样转发。
    pub slice_values: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            client_acm: AcmConfig::client_default(),
            server_acm: AcmConfig::server_default(),
            message_size_max: 1024 * 1024,
            batch_auto_flush_size: 1024 * 1024,
            compress_batch: CompressBatch::default(),
            class_graph_depth_max: DEFAULT_CLASS_GRAPH_DEPTH_MAX,
            default_encoding: ENCODING_1_1,
            default_format: FormatType::Compact,
            close_timeout: Duration::from_secs(10),
            invocation_timeout: None,
            locator_cache_timeout: None,
            graceful_in_flight: GracefulInFlight::default(),
            slice_values: true,
        }
    }
}

impl RpcConfig {
    /// 从 TOML 文本解析配置。
    ///
    /// # 教案级注释
    ///
    /// ## 契约（What）
    /// - 缺省字段取 [`RpcConfig::default`] 的值；`[client.acm]`/`[server.acm]` 的缺省字段取各自一侧的默认值；
    /// - 未知字段、非法枚举值、非法版本字符串均返回 [`RpcError::Config`]；
    /// - 成功返回的配置已通过 [`RpcConfig::validate`]。
    pub fn from_toml_str(text: &str) -> RpcResult<Self> {
        let repr: RpcConfigRepr =
            toml::from_str(text).map_err(|err| RpcError::Config(err.to_string()))?;
        let config = repr.into_config();
        config.validate()?;
        Ok(config)
    }

    /// 校验跨字段约束。
    pub fn validate(&self) -> RpcResult<()> {
        if self.message_size_max < HEADER_SIZE {
            return Err(RpcError::Config(format!(
                "message_size_max 至少为 {HEADER_SIZE} 字节"
            )));
        }
        if !self.default_encoding.is_supported() {
            return Err(RpcError::Config(format!(
                "不支持的 default_encoding {}",
                self.default_encoding
            )));
        }
        if self.class_graph_depth_max == 0 {
            return Err(RpcError::Config("class_graph_depth_max 必须大于 0".into()));
        }
        Ok(())
    }

    /// 覆盖客户端 ACM。
    pub fn with_client_acm(mut self, acm: AcmConfig) -> Self {
        self.client_acm = acm;
        self
    }

    /// 覆盖服务端 ACM。
    pub fn with_server_acm(mut self, acm: AcmConfig) -> Self {
        self.server_acm = acm;
        self
    }

    /// 覆盖单帧上限。
    pub fn with_message_size_max(mut self, size: usize) -> Self {
        self.message_size_max = size;
        self
    }

    /// 覆盖批量自动冲刷阈值。
    pub fn with_batch_auto_flush_size(mut self, size: usize) -> Self {
        self.batch_auto_flush_size = size;
        self
    }

    /// 覆盖批量压缩策略。
    pub fn with_compress_batch(mut self, policy: CompressBatch) -> Self {
        self.compress_batch = policy;
        self
    }

    /// 覆盖类图深度上限。
    pub fn with_class_graph_depth_max(mut self, depth: usize) -> Self {
        self.class_graph_depth_max = depth;
        self
    }

    /// 覆盖默认编码版本。
    pub fn with_default_encoding(mut self, encoding: EncodingVersion) -> Self {
        self.default_encoding = encoding;
        self
    }

    /// 覆盖默认切片格式。
    pub fn with_default_format(mut self, format: FormatType) -> Self {
        self.default_format = format;
        self
    }

    /// 覆盖优雅关闭超时。
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// 覆盖调用超时。
    pub fn with_invocation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    /// 覆盖定位器缓存有效期。
    pub fn with_locator_cache_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.locator_cache_timeout = timeout;
        self
    }

    /// 覆盖优雅关闭时未决调用的处理方式。
    pub fn with_graceful_in_flight(mut self, policy: GracefulInFlight) -> Self {
        self.graceful_in_flight = policy;
        self
    }

    /// 覆盖未知切片保留开关。
    pub fn with_slice_values(mut self, enabled: bool) -> Self {
        self.slice_values = enabled;
        self
    }
}

fn parse_field<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    raw.map(|text| text.parse::<T>().map_err(serde::de::Error::custom))
        .transpose()
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AcmRepr {
    timeout_secs: Option<u64>,
    close: Option<AcmClose>,
    heartbeat: Option<AcmHeartbeat>,
}

impl AcmRepr {
    fn merge(self, base: AcmConfig) -> AcmConfig {
        AcmConfig {
            timeout: self.timeout_secs.map_or(base.timeout, Duration::from_secs),
            close: self.close.unwrap_or(base.close),
            heartbeat: self.heartbeat.unwrap_or(base.heartbeat),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SideRepr {
    #[serde(default)]
    acm: AcmRepr,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RpcConfigRepr {
    #[serde(default)]
    client: SideRepr,
    #[serde(default)]
    server: SideRepr,
    message_size_max: Option<usize>,
    batch_auto_flush_size: Option<usize>,
    compress_batch: Option<CompressBatch>,
    class_graph_depth_max: Option<usize>,
    #[serde(default, deserialize_with = "parse_field")]
    default_encoding: Option<EncodingVersion>,
    #[serde(default, deserialize_with = "parse_field")]
    default_format: Option<FormatType>,
    close_timeout_ms: Option<u64>,
    invocation_timeout_ms: Option<u64>,
    locator_cache_timeout_secs: Option<i64>,
    graceful_in_flight: Option<GracefulInFlight>,
    slice_values: Option<bool>,
}

impl RpcConfigRepr {
    fn into_config(self) -> RpcConfig {
        let base = RpcConfig::default();
        RpcConfig {
            client_acm: self.client.acm.merge(base.client_acm),
            server_acm: self.server.acm.merge(base.server_acm),
            message_size_max: self.message_size_max.unwrap_or(base.message_size_max),
            batch_auto_flush_size: self
                .batch_auto_flush_size
                .unwrap_or(base.batch_auto_flush_size),
            compress_batch: self.compress_batch.unwrap_or(base.compress_batch),
            class_graph_depth_max: self
                .class_graph_depth_max
                .unwrap_or(base.class_graph_depth_max),
            default_encoding: self.default_encoding.unwrap_or(base.default_encoding),
            default_format: self.default_format.unwrap_or(base.default_format),
            close_timeout: self
                .close_timeout_ms
                .map_or(base.close_timeout, Duration::from_millis),
            invocation_timeout: self.invocation_timeout_ms.map(Duration::from_millis),
            // 负数表示永不过期。
            locator_cache_timeout: match self.locator_cache_timeout_secs {
                Some(secs) if secs >= 0 => Some(Duration::from_secs(secs.unsigned_abs())),
                _ => base.locator_cache_timeout,
            },
            graceful_in_flight: self.graceful_in_flight.unwrap_or(base.graceful_in_flight),
            slice_values: self.slice_values.unwrap_or(base.slice_values),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_rpc_wire::ENCODING_1_0;

    #[test]
    fn empty_document_yields_defaults() {
        let config = RpcConfig::from_toml_str("").expect("空配置合法");
        assert_eq!(config, RpcConfig::default());
        assert_eq!(config.client_acm.close, AcmClose::OnInvocationAndIdle);
        assert_eq!(config.server_acm.close, AcmClose::OnInvocation);
    }

    #[test]
    fn partial_acm_sections_keep_side_defaults() {
        let config = RpcConfig::from_toml_str(
            r#"
            default_encoding = "1.0"
            default_format = "sliced"
            locator_cache_timeout_secs = 0
            graceful_in_flight = "complete"

            [client.acm]
            timeout_secs = 5
            heartbeat = "always"

            [server.acm]
            close = "on_idle_forceful"
            "#,
        )
        .expect("合法配置");
        assert_eq!(
            config.client_acm,
            AcmConfig::new(
                Duration::from_secs(5),
                AcmClose::OnInvocationAndIdle,
                AcmHeartbeat::Always
            )
        );
        assert_eq!(config.server_acm.timeout, AcmConfig::DEFAULT_TIMEOUT);
        assert_eq!(config.server_acm.close, AcmClose::OnIdleForceful);
        assert_eq!(config.default_encoding, ENCODING_1_0);
        assert_eq!(config.default_format, FormatType::Sliced);
        assert_eq!(config.locator_cache_timeout, Some(Duration::ZERO));
        assert_eq!(config.graceful_in_flight, GracefulInFlight::Complete);
    }

    #[test]
    fn invalid_documents_are_rejected() {
        let unknown = RpcConfig::from_toml_str("bogus = 1").expect_err("未知字段");
        assert_eq!(unknown.code(), "spark.rpc.config.invalid");
        assert!(RpcConfig::from_toml_str("default_encoding = \"x\"").is_err());
        assert!(RpcConfig::from_toml_str("default_encoding = \"3.0\"").is_err());
        assert!(RpcConfig::from_toml_str("message_size_max = 4").is_err());
        assert!(RpcConfig::from_toml_str("[client.acm]\nclose = \"sometimes\"").is_err());
    }

    #[test]
    fn acm_enablement_requires_timeout_and_policy() {
        assert!(AcmConfig::client_default().is_enabled());
        assert!(!AcmConfig::disabled().is_enabled());
        let no_timeout = AcmConfig::new(Duration::ZERO, AcmClose::OnIdle, AcmHeartbeat::Always);
        assert!(!no_timeout.is_enabled());
    }
}
