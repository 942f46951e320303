//! 端点模型：传输描述符的标签化表示与字符串格式。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 端点是代理与监听器共同使用的“地址 + 传输参数”描述，需要在配置、日志与线格式之间来回转换；
//! - 分层传输（例如基于流传输的安全传输）以 `underlying` 字段显式嵌套，而不是通过继承链表达。
//!
//! ## 契约（What）
//! - [`EndpointInfo`] 的每个变体只携带自身字段；[`Endpoint`] 追加超时与压缩标志；
//! - 字符串格式形如 `tcp -h host -p port -t 60000 -z`，解析与格式化互为逆运算；
//! - 端点一经构造不可变，`with_*` 方法返回新值。
//!
//! ## 注意事项（Trade-offs）
//! - `opaque` 端点的负载以十六进制文本表示，便于在配置文件中手工编辑；
//! - 主机名包含 `:` 或空白时会加引号输出，解析器同样识别双引号。

use std::{fmt, str::FromStr, time::Duration};

use crate::error::{TransportError, TransportErrorKind};

/// TCP 端点类型码。
pub const TCP_ENDPOINT_TYPE: i16 = 1;
/// 基于 TCP 的安全传输端点类型码。
pub const SSL_ENDPOINT_TYPE: i16 = 2;
/// UDP 端点类型码。
pub const UDP_ENDPOINT_TYPE: i16 = 3;
/// 蓝牙端点类型码。
pub const BT_ENDPOINT_TYPE: i16 = 6;
/// 基于蓝牙的安全传输端点类型码。
pub const BTS_ENDPOINT_TYPE: i16 = 7;
/// 进程内内存传输端点类型码。
pub const MEMORY_ENDPOINT_TYPE: i16 = 100;

/// 未显式指定 `-t` 时使用的超时。
pub const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_millis(60_000);

const INVALID_ENDPOINT_CODE: &str = "spark.rpc.transport.invalid_endpoint";

/// 基于 IP 的端点字段。
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct IpEndpoint {
    /// 主机名或地址；空串表示“所有接口”（监听）或本机（连接）。
    pub host: String,
    /// 端口；监听端点为 0 时由系统分配。
    pub port: u16,
    /// 可选的本地源地址。
    pub source_address: Option<String>,
}

impl IpEndpoint {
    /// 以主机与端口构造。
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            source_address: None,
        }
    }
}

/// UDP 端点字段。
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct UdpEndpoint {
    /// IP 部分。
    pub ip: IpEndpoint,
    /// 组播出口网卡。
    pub mcast_interface: Option<String>,
    /// 组播 TTL。
    pub mcast_ttl: Option<i32>,
}

/// 传输描述符。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EndpointInfo {
    /// TCP 流传输。
    Tcp(IpEndpoint),
    /// UDP 数据报传输。
    Udp(UdpEndpoint),
    /// 蓝牙 RFCOMM 传输。
    Bluetooth {
        /// 设备地址。
        addr: String,
        /// 服务 UUID。
        uuid: String,
    },
    /// 进程内内存传输，以名称寻址。
    Memory {
        /// 监听名。
        name: String,
    },
    /// 叠加在 `underlying` 之上的安全传输。
    Secure {
        /// 被加密的底层传输。
        underlying: Box<EndpointInfo>,
    },
    /// 本端无法解析的端点，原样保留以便转发。
    Opaque {
        /// 原始类型码。
        type_id: i16,
        /// 负载所用的编码版本 `(major, minor)`。
        encoding: (u8, u8),
        /// 原始负载。
        bytes: Vec<u8>,
    },
}

impl EndpointInfo {
    /// 线格式类型码。
    pub fn type_id(&self) -> i16 {
        match self {
            EndpointInfo::Tcp(_) => TCP_ENDPOINT_TYPE,
            EndpointInfo::Udp(_) => UDP_ENDPOINT_TYPE,
            EndpointInfo::Bluetooth { .. } => BT_ENDPOINT_TYPE,
            EndpointInfo::Memory { .. } => MEMORY_ENDPOINT_TYPE,
            EndpointInfo::Secure { underlying } => match underlying.as_ref() {
                EndpointInfo::Bluetooth { .. } => BTS_ENDPOINT_TYPE,
                _ => SSL_ENDPOINT_TYPE,
            },
            EndpointInfo::Opaque { type_id, .. } => *type_id,
        }
    }

    /// 协议名，同时作为传输注册表的键。
    pub fn protocol(&self) -> &'static str {
        match self {
            EndpointInfo::Tcp(_) => "tcp",
            EndpointInfo::Udp(_) => "udp",
            EndpointInfo::Bluetooth { .. } => "bt",
            EndpointInfo::Memory { .. } => "memory",
            EndpointInfo::Secure { underlying } => match underlying.as_ref() {
                EndpointInfo::Bluetooth { .. } => "bts",
                _ => "ssl",
            },
            EndpointInfo::Opaque { .. } => "opaque",
        }
    }

    /// 是否为安全传输。
    pub fn is_secure(&self) -> bool {
        matches!(self, EndpointInfo::Secure { .. })
    }

    /// 是否为数据报传输。
    pub fn is_datagram(&self) -> bool {
        match self {
            EndpointInfo::Udp(_) => true,
            EndpointInfo::Secure { underlying } => underlying.is_datagram(),
            _ => false,
        }
    }

    /// 分层传输的下一层。
    pub fn underlying(&self) -> Option<&EndpointInfo> {
        match self {
            EndpointInfo::Secure { underlying } => Some(underlying),
            _ => None,
        }
    }

    /// 沿 `underlying` 链查找 IP 字段。
    pub fn ip(&self) -> Option<&IpEndpoint> {
        match self {
            EndpointInfo::Tcp(ip) => Some(ip),
            EndpointInfo::Udp(udp) => Some(&udp.ip),
            EndpointInfo::Secure { underlying } => underlying.ip(),
            _ => None,
        }
    }

    fn ip_mut(&mut self) -> Option<&mut IpEndpoint> {
        match self {
            EndpointInfo::Tcp(ip) => Some(ip),
            EndpointInfo::Udp(udp) => Some(&mut udp.ip),
            EndpointInfo::Secure { underlying } => underlying.ip_mut(),
            _ => None,
        }
    }
}

/// 端点：传输描述符加超时与压缩标志。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    info: EndpointInfo,
    timeout: Option<Duration>,
    compress: bool,
}

impl Endpoint {
    /// 以默认超时、不压缩构造端点。
    pub fn new(info: EndpointInfo) -> Self {
        Self {
            info,
            timeout: Some(DEFAULT_ENDPOINT_TIMEOUT),
            compress: false,
        }
    }

    /// TCP 端点快捷构造。
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(EndpointInfo::Tcp(IpEndpoint::new(host, port)))
    }

    /// 内存端点快捷构造。
    pub fn memory(name: impl Into<String>) -> Self {
        Self::new(EndpointInfo::Memory { name: name.into() })
    }

    /// 传输描述符。
    pub fn info(&self) -> &EndpointInfo {
        &self.info
    }

    /// 协议名。
    pub fn protocol(&self) -> &'static str {
        self.info.protocol()
    }

    /// 线格式类型码。
    pub fn type_id(&self) -> i16 {
        self.info.type_id()
    }

    /// 建连与读写超时；`None` 表示不限时。
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// 是否请求压缩。
    pub fn compress(&self) -> bool {
        self.compress
    }

    /// 返回替换超时后的新端点。
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// 返回替换压缩标志后的新端点。
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// 返回替换端口后的新端点；非 IP 端点原样返回。
    ///
    /// 监听器在端口为 0 时用它发布系统实际分配的端口。
    pub fn with_port(mut self, port: u16) -> Self {
        if let Some(ip) = self.info.ip_mut() {
            ip.port = port;
        }
        self
    }
}

fn invalid(message: impl Into<String>) -> TransportError {
    TransportError::new(
        INVALID_ENDPOINT_CODE,
        TransportErrorKind::InvalidEndpoint,
        message,
    )
}

/// 按空白切分并识别双引号。
fn tokenize(input: &str) -> Result<Vec<String>, TransportError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if in_quotes {
        return Err(invalid(format!("端点 `{input}` 的引号不匹配")));
    }
    if has_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// 解析过程中收集的选项。
#[derive(Default)]
struct Options {
    host: Option<String>,
    port: Option<u16>,
    timeout: Option<Option<Duration>>,
    compress: bool,
    source_address: Option<String>,
    interface: Option<String>,
    ttl: Option<i32>,
    addr: Option<String>,
    uuid: Option<String>,
    name: Option<String>,
    opaque_type: Option<i16>,
    encoding: Option<(u8, u8)>,
    value: Option<String>,
}

fn parse_timeout(raw: &str) -> Result<Option<Duration>, TransportError> {
    if raw == "infinite" {
        return Ok(None);
    }
    let ms: i64 = raw
        .parse()
        .map_err(|_| invalid(format!("非法的超时取值 `{raw}`")))?;
    match ms {
        -1 => Ok(None),
        ms if ms > 0 => Ok(Some(Duration::from_millis(ms as u64))),
        _ => Err(invalid(format!("超时必须为正数或 -1，实际为 `{raw}`"))),
    }
}

fn parse_encoding(raw: &str) -> Result<(u8, u8), TransportError> {
    let (major, minor) = raw
        .split_once('.')
        .ok_or_else(|| invalid(format!("非法的编码版本 `{raw}`")))?;
    let major = major
        .parse()
        .map_err(|_| invalid(format!("非法的编码版本 `{raw}`")))?;
    let minor = minor
        .parse()
        .map_err(|_| invalid(format!("非法的编码版本 `{raw}`")))?;
    Ok((major, minor))
}

impl Options {
    fn parse(protocol: &str, args: &[String]) -> Result<Self, TransportError> {
        let allowed: &[&str] = match protocol {
            "tcp" | "ssl" => &["-h", "-p", "-t", "-z", "--sourceAddress"],
            "udp" => &["-h", "-p", "-z", "--sourceAddress", "--interface", "--ttl"],
            "bt" | "bts" => &["-a", "-u", "-t", "-z"],
            "memory" => &["-n", "-t", "-z"],
            "opaque" => &["-t", "-e", "-v"],
            other => return Err(invalid(format!("未知的端点协议 `{other}`"))),
        };
        let mut options = Options::default();
        let mut iter = args.iter();
        while let Some(option) = iter.next() {
            if !allowed.contains(&option.as_str()) {
                return Err(invalid(format!("`{protocol}` 端点不支持选项 `{option}`")));
            }
            if option == "-z" {
                options.compress = true;
                continue;
            }
            let value = iter
                .next()
                .ok_or_else(|| invalid(format!("选项 `{option}` 缺少参数")))?;
            match (protocol, option.as_str()) {
                (_, "-h") => options.host = Some(value.clone()),
                (_, "-p") => {
                    options.port = Some(
                        value
                            .parse()
                            .map_err(|_| invalid(format!("非法的端口 `{value}`")))?,
                    );
                }
                ("opaque", "-t") => {
                    options.opaque_type = Some(
                        value
                            .parse()
                            .map_err(|_| invalid(format!("非法的类型码 `{value}`")))?,
                    );
                }
                (_, "-t") => options.timeout = Some(parse_timeout(value)?),
                (_, "--sourceAddress") => options.source_address = Some(value.clone()),
                (_, "--interface") => options.interface = Some(value.clone()),
                (_, "--ttl") => {
                    options.ttl = Some(
                        value
                            .parse()
                            .map_err(|_| invalid(format!("非法的 TTL `{value}`")))?,
                    );
                }
                (_, "-a") => options.addr = Some(value.clone()),
                (_, "-u") => options.uuid = Some(value.clone()),
                (_, "-n") => options.name = Some(value.clone()),
                (_, "-e") => options.encoding = Some(parse_encoding(value)?),
                (_, "-v") => options.value = Some(value.clone()),
                _ => return Err(invalid(format!("未知选项 `{option}`"))),
            }
        }
        Ok(options)
    }

    fn ip(&mut self) -> IpEndpoint {
        IpEndpoint {
            host: self.host.take().unwrap_or_default(),
            port: self.port.unwrap_or(0),
            source_address: self.source_address.take(),
        }
    }

    fn bluetooth(&mut self) -> Result<EndpointInfo, TransportError> {
        let addr = self
            .addr
            .take()
            .ok_or_else(|| invalid("蓝牙端点缺少 `-a` 设备地址"))?;
        let uuid = self
            .uuid
            .take()
            .ok_or_else(|| invalid("蓝牙端点缺少 `-u` 服务 UUID"))?;
        Ok(EndpointInfo::Bluetooth { addr, uuid })
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(s)?;
        let (protocol, args) = tokens
            .split_first()
            .ok_or_else(|| invalid("端点字符串为空"))?;
        let mut options = Options::parse(protocol, args)?;
        let info = match protocol.as_str() {
            "tcp" => EndpointInfo::Tcp(options.ip()),
            "ssl" => EndpointInfo::Secure {
                underlying: Box::new(EndpointInfo::Tcp(options.ip())),
            },
            "udp" => EndpointInfo::Udp(UdpEndpoint {
                ip: options.ip(),
                mcast_interface: options.interface.take(),
                mcast_ttl: options.ttl,
            }),
            "bt" => options.bluetooth()?,
            "bts" => EndpointInfo::Secure {
                underlying: Box::new(options.bluetooth()?),
            },
            "memory" => EndpointInfo::Memory {
                name: options
                    .name
                    .take()
                    .ok_or_else(|| invalid("内存端点缺少 `-n` 名称"))?,
            },
            _ => {
                let type_id = options
                    .opaque_type
                    .ok_or_else(|| invalid("opaque 端点缺少 `-t` 类型码"))?;
                let value = options
                    .value
                    .take()
                    .ok_or_else(|| invalid("opaque 端点缺少 `-v` 负载"))?;
                let bytes = hex::decode(&value)
                    .map_err(|err| invalid(format!("opaque 负载不是合法十六进制：{err}")))?;
                EndpointInfo::Opaque {
                    type_id,
                    encoding: options.encoding.unwrap_or((1, 1)),
                    bytes,
                }
            }
        };
        Ok(Endpoint {
            info,
            timeout: options.timeout.unwrap_or(Some(DEFAULT_ENDPOINT_TIMEOUT)),
            compress: options.compress,
        })
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, flag: &str, value: &str) -> fmt::Result {
    if value.contains(':') || value.chars().any(char::is_whitespace) {
        write!(f, " {flag} \"{value}\"")
    } else {
        write!(f, " {flag} {value}")
    }
}

fn write_ip(f: &mut fmt::Formatter<'_>, ip: &IpEndpoint) -> fmt::Result {
    if !ip.host.is_empty() {
        write_quoted(f, "-h", &ip.host)?;
    }
    write!(f, " -p {}", ip.port)?;
    if let Some(source) = &ip.source_address {
        write_quoted(f, "--sourceAddress", source)?;
    }
    Ok(())
}

fn write_info(f: &mut fmt::Formatter<'_>, info: &EndpointInfo) -> fmt::Result {
    match info {
        EndpointInfo::Tcp(ip) => write_ip(f, ip),
        EndpointInfo::Udp(udp) => {
            write_ip(f, &udp.ip)?;
            if let Some(interface) = &udp.mcast_interface {
                write_quoted(f, "--interface", interface)?;
            }
            if let Some(ttl) = udp.mcast_ttl {
                write!(f, " --ttl {ttl}")?;
            }
            Ok(())
        }
        EndpointInfo::Bluetooth { addr, uuid } => {
            write_quoted(f, "-a", addr)?;
            write_quoted(f, "-u", uuid)
        }
        EndpointInfo::Memory { name } => write_quoted(f, "-n", name),
        EndpointInfo::Secure { underlying } => write_info(f, underlying),
        EndpointInfo::Opaque {
            type_id,
            encoding,
            bytes,
        } => write!(
            f,
            " -t {type_id} -e {}.{} -v {}",
            encoding.0,
            encoding.1,
            hex::encode(bytes)
        ),
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.protocol())?;
        write_info(f, &self.info)?;
        if matches!(self.info, EndpointInfo::Opaque { .. }) {
            return Ok(());
        }
        if !self.info.is_datagram() {
            match self.timeout {
                Some(timeout) => write!(f, " -t {}", timeout.as_millis())?,
                None => f.write_str(" -t infinite")?,
            }
        }
        if self.compress {
            f.write_str(" -z")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_endpoint_parses_all_options() {
        let endpoint: Endpoint = "tcp -h 127.0.0.1 -p 10000 -t 5000 -z"
            .parse()
            .expect("合法端点");
        assert_eq!(
            endpoint.info(),
            &EndpointInfo::Tcp(IpEndpoint::new("127.0.0.1", 10000))
        );
        assert_eq!(endpoint.timeout(), Some(Duration::from_millis(5000)));
        assert!(endpoint.compress());
        assert_eq!(endpoint.type_id(), TCP_ENDPOINT_TYPE);
        assert_eq!(
            endpoint.to_string(),
            "tcp -h 127.0.0.1 -p 10000 -t 5000 -z"
        );
    }

    #[test]
    fn secure_endpoint_nests_underlying_transport() {
        let endpoint: Endpoint = "ssl -h \"::1\" -p 4064 -t infinite".parse().expect("合法端点");
        assert!(endpoint.info().is_secure());
        assert_eq!(endpoint.type_id(), SSL_ENDPOINT_TYPE);
        let underlying = endpoint.info().underlying().expect("存在底层传输");
        assert_eq!(underlying.protocol(), "tcp");
        assert_eq!(endpoint.info().ip().map(|ip| ip.host.as_str()), Some("::1"));
        assert_eq!(endpoint.timeout(), None);
        assert_eq!(endpoint.to_string(), "ssl -h \"::1\" -p 4064 -t infinite");

        let bts: Endpoint = "bts -a 01:23:45:67:89:AB -u 1a2b".parse().expect("合法端点");
        assert_eq!(bts.type_id(), BTS_ENDPOINT_TYPE);
        assert_eq!(bts.protocol(), "bts");
    }

    #[test]
    fn display_and_parse_are_inverse() {
        for text in [
            "tcp -p 0 -t 60000",
            "udp -h 239.255.0.1 -p 10000 --interface eth0 --ttl 4",
            "bt -a \"01:23:45:67:89:AB\" -u 5d8b -t 1000",
            "memory -n hello -t 60000 -z",
            "opaque -t 99 -e 1.1 -v 0a0b0c",
        ] {
            let endpoint: Endpoint = text.parse().expect("合法端点");
            assert_eq!(endpoint.to_string(), text);
            let again: Endpoint = endpoint.to_string().parse().expect("再次解析");
            assert_eq!(again, endpoint);
        }
    }

    #[test]
    fn malformed_endpoints_are_rejected() {
        for text in [
            "",
            "quic -h x",
            "tcp -p",
            "tcp -p 70000",
            "tcp -x 1",
            "tcp -t 0",
            "memory",
            "opaque -t 9 -v zz",
            "tcp -h \"unterminated",
        ] {
            let err = text.parse::<Endpoint>().expect_err(text);
            assert_eq!(err.kind(), TransportErrorKind::InvalidEndpoint, "{text}");
        }
    }

    #[test]
    fn with_port_rewrites_nested_ip() {
        let endpoint: Endpoint = "ssl -h localhost -p 0".parse().expect("合法端点");
        let bound = endpoint.with_port(4443);
        assert_eq!(bound.info().ip().map(|ip| ip.port), Some(4443));
        let memory = Endpoint::memory("m").with_port(9);
        assert_eq!(memory, Endpoint::memory("m"));
    }
}
