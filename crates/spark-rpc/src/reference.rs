//! 代理引用：身份、切面、调用模式与寻址方式的不可变描述。
//!
//! # 教案定位（Why）
//! - 代理与连接无关，只描述“调用谁、怎样调用、去哪里找”；引用在代理之间共享，
//!   所有 `with_*` 方法都返回新值；
//! - 引用需要在字符串（配置、日志）与线格式（参数中的代理）之间往返。
//!
//! # 格式（What）
//! - 字符串：`identity [-f facet] [-t|-o|-O|-d|-D] [-s] [-e 1.1] [:endpoint]*`
//!   或 `identity ... @ adapter-id`；只有身份时是“知名对象”；
//! - 线格式：身份（名称为空表示空代理）、切面序列、模式字节、安全标志，1.1 编码下追加协议与编码版本，
//!   然后是端点个数；端点个数为 0 时跟随适配器标识；
//! - 每个端点为 `i16` 类型码加一个 1.0 封装，未知类型码以不透明端点原样保留。

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use spark_rpc_transport::{
    BT_ENDPOINT_TYPE, BTS_ENDPOINT_TYPE, Endpoint, EndpointInfo, IpEndpoint,
    MEMORY_ENDPOINT_TYPE, SSL_ENDPOINT_TYPE, TCP_ENDPOINT_TYPE, UDP_ENDPOINT_TYPE, UdpEndpoint,
};
use spark_rpc_wire::{
    ENCODING_1_0, ENCODING_1_1, EncodingVersion, FormatType, InputStream, OutputStream,
    PROTOCOL_1_0, WireError,
};

use crate::connection::Connection;
use crate::error::{RpcError, RpcResult};
use crate::identity::Identity;
use crate::protocol::{Context, read_facet, write_facet};

/// 调用模式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InvocationMode {
    /// 双向调用。
    #[default]
    Twoway = 0,
    /// 单向调用。
    Oneway = 1,
    /// 批量单向调用。
    BatchOneway = 2,
    /// 数据报调用。
    Datagram = 3,
    /// 批量数据报调用。
    BatchDatagram = 4,
}

impl InvocationMode {
    /// 是否等待回复。
    pub fn is_twoway(self) -> bool {
        self == InvocationMode::Twoway
    }

    /// 是否进入批量队列。
    pub fn is_batch(self) -> bool {
        matches!(self, InvocationMode::BatchOneway | InvocationMode::BatchDatagram)
    }

    /// 是否要求数据报传输。
    pub fn is_datagram(self) -> bool {
        matches!(self, InvocationMode::Datagram | InvocationMode::BatchDatagram)
    }

    fn flag(self) -> &'static str {
        match self {
            InvocationMode::Twoway => "-t",
            InvocationMode::Oneway => "-o",
            InvocationMode::BatchOneway => "-O",
            InvocationMode::Datagram => "-d",
            InvocationMode::BatchDatagram => "-D",
        }
    }

    fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(InvocationMode::Twoway),
            1 => Ok(InvocationMode::Oneway),
            2 => Ok(InvocationMode::BatchOneway),
            3 => Ok(InvocationMode::Datagram),
            4 => Ok(InvocationMode::BatchDatagram),
            other => Err(WireError::EnumOutOfRange {
                value: i32::from(other),
                max: 4,
            }),
        }
    }
}

/// 寻址方式。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// 直接端点列表。
    Direct(Vec<Endpoint>),
    /// 经定位器解析的适配器标识；空串表示按身份解析的知名对象。
    Indirect(String),
    /// 绑定到一条已有连接。
    Fixed(Connection),
}

/// 代理引用。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    /// 目标身份。
    pub identity: Identity,
    /// 目标切面。
    pub facet: String,
    /// 调用模式。
    pub mode: InvocationMode,
    /// 是否只使用安全端点。
    pub secure: bool,
    /// 参数编码版本。
    pub encoding: EncodingVersion,
    /// 压缩覆盖；`None` 表示沿用端点设置。
    pub compress: Option<bool>,
    /// 寻址方式。
    pub target: Target,
    /// 随每次调用发送的上下文。
    pub context: Context,
    /// 调用超时覆盖；`None` 表示沿用通信器配置。
    pub invocation_timeout: Option<Duration>,
}

impl Reference {
    fn base(identity: Identity, target: Target) -> Self {
        Self {
            identity,
            facet: String::new(),
            mode: InvocationMode::Twoway,
            secure: false,
            encoding: ENCODING_1_1,
            compress: None,
            target,
            context: Context::new(),
            invocation_timeout: None,
        }
    }

    /// 直接代理。
    pub fn direct(identity: Identity, endpoints: Vec<Endpoint>) -> Self {
        Self::base(identity, Target::Direct(endpoints))
    }

    /// 经适配器标识间接寻址的代理。
    pub fn indirect(identity: Identity, adapter_id: impl Into<String>) -> Self {
        Self::base(identity, Target::Indirect(adapter_id.into()))
    }

    /// 知名对象代理。
    pub fn well_known(identity: Identity) -> Self {
        Self::indirect(identity, "")
    }

    /// 固定到连接的代理。
    pub fn fixed(identity: Identity, connection: Connection) -> Self {
        Self::base(identity, Target::Fixed(connection))
    }

    /// 直接端点；其他寻址方式返回空切片。
    pub fn endpoints(&self) -> &[Endpoint] {
        match &self.target {
            Target::Direct(endpoints) => endpoints,
            _ => &[],
        }
    }

    /// 适配器标识；非间接或知名对象返回 `None`。
    pub fn adapter_id(&self) -> Option<&str> {
        match &self.target {
            Target::Indirect(id) if !id.is_empty() => Some(id),
            _ => None,
        }
    }

    /// 是否为知名对象代理。
    pub fn is_well_known(&self) -> bool {
        matches!(&self.target, Target::Indirect(id) if id.is_empty())
    }

    /// 是否需要定位器解析。
    pub fn is_indirect(&self) -> bool {
        matches!(self.target, Target::Indirect(_))
    }

    /// 固定连接。
    pub fn fixed_connection(&self) -> Option<&Connection> {
        match &self.target {
            Target::Fixed(connection) => Some(connection),
            _ => None,
        }
    }

    /// 以指定默认编码解析字符串形式。
    pub fn parse_with(input: &str, default_encoding: EncodingVersion) -> RpcResult<Self> {
        let invalid = |message: String| RpcError::InvalidProxy(format!("`{input}`：{message}"));
        let (head, rest) = split_top_level(input, &[':', '@']);
        let tokens = tokenize(head).map_err(invalid)?;
        let (identity, options) = tokens
            .split_first()
            .ok_or_else(|| invalid("缺少身份".into()))?;
        let identity: Identity = identity.parse()?;
        let mut reference = Self::well_known(identity);
        reference.encoding = default_encoding;

        let mut iter = options.iter();
        while let Some(option) = iter.next() {
            match option.as_str() {
                "-f" => {
                    reference.facet = iter
                        .next()
                        .ok_or_else(|| invalid("`-f` 缺少切面".into()))?
                        .clone();
                }
                "-t" => reference.mode = InvocationMode::Twoway,
                "-o" => reference.mode = InvocationMode::Oneway,
                "-O" => reference.mode = InvocationMode::BatchOneway,
                "-d" => reference.mode = InvocationMode::Datagram,
                "-D" => reference.mode = InvocationMode::BatchDatagram,
                "-s" => reference.secure = true,
                "-e" => {
                    let raw = iter.next().ok_or_else(|| invalid("`-e` 缺少版本".into()))?;
                    reference.encoding = raw
                        .parse()
                        .map_err(|err| invalid(format!("编码版本非法：{err}")))?;
                }
                "-p" => {
                    let raw = iter.next().ok_or_else(|| invalid("`-p` 缺少版本".into()))?;
                    if raw != "1.0" {
                        return Err(invalid(format!("不支持的协议版本 `{raw}`")));
                    }
                }
                other => return Err(invalid(format!("未知选项 `{other}`"))),
            }
        }

        match rest {
            Some((':', endpoints)) => {
                let mut parsed = Vec::new();
                let mut remaining = Some(endpoints);
                while let Some(text) = remaining {
                    let (current, next) = split_top_level(text, &[':']);
                    if !current.trim().is_empty() {
                        parsed.push(current.trim().parse::<Endpoint>()?);
                    }
                    remaining = next.map(|(_, tail)| tail);
                }
                if parsed.is_empty() {
                    return Err(invalid("`:` 之后没有端点".into()));
                }
                reference.target = Target::Direct(parsed);
            }
            Some((_, adapter)) => {
                let tokens = tokenize(adapter).map_err(invalid)?;
                match tokens.as_slice() {
                    [adapter] if !adapter.is_empty() => {
                        reference.target = Target::Indirect(adapter.clone());
                    }
                    _ => return Err(invalid("`@` 之后需要恰好一个适配器标识".into())),
                }
            }
            None => {}
        }
        Ok(reference)
    }

    /// 编码为线格式。固定代理无法跨进程传递。
    pub fn write(&self, out: &mut OutputStream) -> RpcResult<()> {
        let adapter_id = match &self.target {
            Target::Fixed(_) => {
                return Err(RpcError::FeatureNotSupported(
                    "固定代理不能编码为线格式".into(),
                ));
            }
            Target::Direct(_) => "",
            Target::Indirect(id) => id.as_str(),
        };
        self.identity.write(out);
        write_facet(out, &self.facet);
        out.write_u8(self.mode as u8);
        out.write_bool(self.secure);
        if out.encoding() != ENCODING_1_0 {
            out.write_u8(PROTOCOL_1_0.major);
            out.write_u8(PROTOCOL_1_0.minor);
            out.write_u8(self.encoding.major);
            out.write_u8(self.encoding.minor);
        }
        let endpoints = self.endpoints();
        out.write_size(endpoints.len());
        for endpoint in endpoints {
            write_endpoint(out, endpoint)?;
        }
        if endpoints.is_empty() {
            out.write_string(adapter_id);
        }
        Ok(())
    }

    /// 编码空代理。
    pub fn write_null(out: &mut OutputStream) {
        Identity::default().write(out);
    }

    /// 从线格式解码；空代理返回 `None`。
    pub fn read(input: &mut InputStream<'_>) -> RpcResult<Option<Self>> {
        let identity = Identity::read(input)?;
        if identity.name.is_empty() {
            return Ok(None);
        }
        let facet = read_facet(input)?;
        let mode = InvocationMode::from_u8(input.read_u8()?)?;
        let secure = input.read_bool()?;
        let mut encoding = ENCODING_1_0;
        if input.encoding() != ENCODING_1_0 {
            let (major, minor) = (input.read_u8()?, input.read_u8()?);
            if major != PROTOCOL_1_0.major {
                return Err(RpcError::Protocol(format!(
                    "代理使用不支持的协议版本 {major}.{minor}"
                )));
            }
            encoding = EncodingVersion::new(input.read_u8()?, input.read_u8()?);
        }
        let count = input.read_and_check_seq_size(8)?;
        let target = if count == 0 {
            Target::Indirect(input.read_string()?)
        } else {
            let mut endpoints = Vec::with_capacity(count);
            for _ in 0..count {
                endpoints.push(read_endpoint(input)?);
            }
            Target::Direct(endpoints)
        };
        Ok(Some(Self {
            facet,
            mode,
            secure,
            encoding,
            target,
            ..Self::base(identity, Target::Indirect(String::new()))
        }))
    }

    /// 替换切面。
    pub fn with_facet(mut self, facet: impl Into<String>) -> Self {
        self.facet = facet.into();
        self
    }

    /// 替换调用模式。
    pub fn with_mode(mut self, mode: InvocationMode) -> Self {
        self.mode = mode;
        self
    }

    /// 替换编码版本。
    pub fn with_encoding(mut self, encoding: EncodingVersion) -> Self {
        self.encoding = encoding;
        self
    }

    /// 替换寻址方式。
    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }
}

impl FromStr for Reference {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with(s, ENCODING_1_1)
    }
}

fn needs_quotes(text: &str) -> bool {
    text.is_empty()
        || text
            .chars()
            .any(|c| c.is_whitespace() || c == ':' || c == '@' || c == '"')
}

fn write_token(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    if needs_quotes(text) {
        write!(f, "\"{text}\"")
    } else {
        f.write_str(text)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_token(f, &self.identity.to_string())?;
        if !self.facet.is_empty() {
            f.write_str(" -f ")?;
            write_token(f, &self.facet)?;
        }
        write!(f, " {}", self.mode.flag())?;
        if self.secure {
            f.write_str(" -s")?;
        }
        write!(f, " -e {}", self.encoding)?;
        match &self.target {
            Target::Direct(endpoints) => {
                for endpoint in endpoints {
                    write!(f, ":{endpoint}")?;
                }
                Ok(())
            }
            Target::Indirect(adapter) if !adapter.is_empty() => {
                f.write_str(" @ ")?;
                write_token(f, adapter)
            }
            _ => Ok(()),
        }
    }
}

/// 在引号之外查找第一个分隔符，返回前半部分与（分隔符, 后半部分）。
fn split_top_level<'a>(input: &'a str, separators: &[char]) -> (&'a str, Option<(char, &'a str)>) {
    let mut in_quotes = false;
    for (index, ch) in input.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            c if !in_quotes && separators.contains(&c) => {
                return (&input[..index], Some((c, &input[index + c.len_utf8()..])));
            }
            _ => {}
        }
    }
    (input, None)
}

fn tokenize(input: &str) -> Result<Vec<String>, String> {
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
        return Err("引号不匹配".into());
    }
    if has_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn timeout_to_wire(timeout: Option<Duration>) -> i32 {
    timeout.map_or(-1, |t| i32::try_from(t.as_millis()).unwrap_or(i32::MAX))
}

fn timeout_from_wire(raw: i32) -> Option<Duration> {
    u64::try_from(raw)
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

fn write_endpoint_body(out: &mut OutputStream, endpoint: &Endpoint, info: &EndpointInfo) {
    match info {
        EndpointInfo::Tcp(ip) => {
            out.write_string(&ip.host);
            out.write_i32(i32::from(ip.port));
            out.write_i32(timeout_to_wire(endpoint.timeout()));
            out.write_bool(endpoint.compress());
        }
        EndpointInfo::Udp(udp) => {
            out.write_string(&udp.ip.host);
            out.write_i32(i32::from(udp.ip.port));
            out.write_bool(endpoint.compress());
        }
        EndpointInfo::Bluetooth { addr, uuid } => {
            out.write_string(addr);
            out.write_string(uuid);
            out.write_i32(timeout_to_wire(endpoint.timeout()));
            out.write_bool(endpoint.compress());
        }
        EndpointInfo::Memory { name } => {
            out.write_string(name);
            out.write_i32(timeout_to_wire(endpoint.timeout()));
            out.write_bool(endpoint.compress());
        }
        EndpointInfo::Secure { underlying } => write_endpoint_body(out, endpoint, underlying),
        EndpointInfo::Opaque { .. } => {}
    }
}

fn write_endpoint(out: &mut OutputStream, endpoint: &Endpoint) -> RpcResult<()> {
    out.write_i16(endpoint.type_id());
    if let EndpointInfo::Opaque {
        encoding, bytes, ..
    } = endpoint.info()
    {
        let size = i32::try_from(bytes.len() + 6)
            .map_err(|_| RpcError::InvalidProxy("不透明端点负载过大".into()))?;
        out.write_i32(size);
        out.write_u8(encoding.0);
        out.write_u8(encoding.1);
        out.write_raw(bytes);
        return Ok(());
    }
    out.start_encapsulation_with(ENCODING_1_0, FormatType::Compact);
    write_endpoint_body(out, endpoint, endpoint.info());
    out.end_encapsulation()?;
    Ok(())
}

fn read_port(input: &mut InputStream<'_>) -> RpcResult<u16> {
    let raw = input.read_i32()?;
    u16::try_from(raw).map_err(|_| RpcError::Protocol(format!("端点端口 {raw} 越界")))
}

fn read_endpoint(input: &mut InputStream<'_>) -> RpcResult<Endpoint> {
    let type_id = input.read_i16()?;
    let encaps = input.read_encapsulation_bytes()?;
    let known = matches!(
        type_id,
        TCP_ENDPOINT_TYPE
            | SSL_ENDPOINT_TYPE
            | UDP_ENDPOINT_TYPE
            | BT_ENDPOINT_TYPE
            | BTS_ENDPOINT_TYPE
            | MEMORY_ENDPOINT_TYPE
    );
    if !known {
        return Ok(Endpoint::new(EndpointInfo::Opaque {
            type_id,
            encoding: (encaps[4], encaps[5]),
            bytes: encaps[6..].to_vec(),
        }));
    }

    let mut body = InputStream::new(encaps);
    body.start_encapsulation()?;
    let endpoint = match type_id {
        TCP_ENDPOINT_TYPE | SSL_ENDPOINT_TYPE => {
            let host = body.read_string()?;
            let port = read_port(&mut body)?;
            let timeout = timeout_from_wire(body.read_i32()?);
            let compress = body.read_bool()?;
            let tcp = EndpointInfo::Tcp(IpEndpoint::new(host, port));
            let info = if type_id == SSL_ENDPOINT_TYPE {
                EndpointInfo::Secure {
                    underlying: Box::new(tcp),
                }
            } else {
                tcp
            };
            Endpoint::new(info)
                .with_timeout(timeout)
                .with_compress(compress)
        }
        UDP_ENDPOINT_TYPE => {
            let host = body.read_string()?;
            let port = read_port(&mut body)?;
            let compress = body.read_bool()?;
            Endpoint::new(EndpointInfo::Udp(UdpEndpoint {
                ip: IpEndpoint::new(host, port),
                ..UdpEndpoint::default()
            }))
            .with_timeout(None)
            .with_compress(compress)
        }
        BT_ENDPOINT_TYPE | BTS_ENDPOINT_TYPE => {
            let addr = body.read_string()?;
            let uuid = body.read_string()?;
            let timeout = timeout_from_wire(body.read_i32()?);
            let compress = body.read_bool()?;
            let bt = EndpointInfo::Bluetooth { addr, uuid };
            let info = if type_id == BTS_ENDPOINT_TYPE {
                EndpointInfo::Secure {
                    underlying: Box::new(bt),
                }
            } else {
                bt
            };
            Endpoint::new(info)
                .with_timeout(timeout)
                .with_compress(compress)
        }
        _ => {
            let name = body.read_string()?;
            let timeout = timeout_from_wire(body.read_i32()?);
            let compress = body.read_bool()?;
            Endpoint::memory(name)
                .with_timeout(timeout)
                .with_compress(compress)
        }
    };
    body.end_encapsulation()?;
    Ok(endpoint)
}
