//! 消息协议：帧头、压缩、请求与回复体。
//!
//! # 教案定位（Why）
//! - 连接层只关心“读一帧、写一帧”，帧头校验、压缩与消息体编解码集中在本模块，
//!   便于单独测试并与连接状态机解耦。
//!
//! # 帧格式（What）
//! ```text
//! +------+--------+--------+------+-------+-----------+
//! | IceP | 1 | 0  | 1 | 0  | type | compr | size: i32 |
//! +------+--------+--------+------+-------+-----------+
//!   4B     协议版本  编码版本   1B     1B       4B (LE，含头部)
//! ```
//! - `type`：0 请求、1 批量请求、2 回复、3 校验连接（兼作心跳）、4 关闭连接；
//! - `compr`：0 不压缩、1 支持压缩（请求方希望回复被压缩）、2 消息体已压缩；
//! - 已压缩的消息体先写未压缩总长（i32），后跟 deflate 数据流；不足 100 字节的帧不压缩。

use std::collections::BTreeMap;
use std::io::{Read, Write};

use bytes::Bytes;
use flate2::{Compression, read::DeflateDecoder, write::DeflateEncoder};
use spark_rpc_transport::{TransportError, TransportErrorKind, Transceiver};
use spark_rpc_wire::{
    ENCODING_1_0, EncodingVersion, InputStream, OutputStream, PROTOCOL_1_0, WireError, WireResult,
};

use crate::error::{RpcError, RpcResult};
use crate::identity::Identity;

/// 帧魔数。
pub const MAGIC: [u8; 4] = *b"IceP";
/// 帧头长度。
pub const HEADER_SIZE: usize = 14;
/// 小于该长度的帧不压缩。
pub const COMPRESSION_MIN_SIZE: usize = 100;

const SIZE_OFFSET: usize = 10;
const COMPRESSION_OFFSET: usize = 9;

/// 请求上下文。
pub type Context = BTreeMap<String, String>;

/// 消息类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// 请求。
    Request = 0,
    /// 批量请求。
    BatchRequest = 1,
    /// 回复。
    Reply = 2,
    /// 校验连接；连接建立后兼作心跳。
    ValidateConnection = 3,
    /// 关闭连接。
    CloseConnection = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = RpcError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageType::Request,
            1 => MessageType::BatchRequest,
            2 => MessageType::Reply,
            3 => MessageType::ValidateConnection,
            4 => MessageType::CloseConnection,
            other => return Err(RpcError::Protocol(format!("未知消息类型 {other}"))),
        })
    }
}

/// 帧头中的压缩状态。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionStatus {
    /// 不压缩。
    #[default]
    None = 0,
    /// 发送方支持压缩，希望回复被压缩。
    Supported = 1,
    /// 消息体已压缩。
    Compressed = 2,
}

impl TryFrom<u8> for CompressionStatus {
    type Error = RpcError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => CompressionStatus::None,
            1 => CompressionStatus::Supported,
            2 => CompressionStatus::Compressed,
            other => return Err(RpcError::Protocol(format!("未知压缩状态 {other}"))),
        })
    }
}

/// 调用模式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationMode {
    /// 普通操作。
    #[default]
    Normal = 0,
    /// 不修改状态的操作。
    Nonmutating = 1,
    /// 幂等操作。
    Idempotent = 2,
}

impl OperationMode {
    fn read(input: &mut InputStream<'_>) -> WireResult<Self> {
        match input.read_u8()? {
            0 => Ok(OperationMode::Normal),
            1 => Ok(OperationMode::Nonmutating),
            2 => Ok(OperationMode::Idempotent),
            other => Err(WireError::EnumOutOfRange {
                value: i32::from(other),
                max: 2,
            }),
        }
    }
}

/// 读到的一帧，消息体已解压。
#[derive(Clone, Debug)]
pub struct Frame {
    /// 消息类型。
    pub kind: MessageType,
    /// 帧头中的压缩状态。
    pub compression: CompressionStatus,
    /// 帧头之后的消息体。
    pub body: Bytes,
}

/// 开始一条消息：写入帧头，总长稍后回填。
pub fn start_message(kind: MessageType) -> OutputStream {
    let mut out = OutputStream::with_encoding(ENCODING_1_0);
    out.write_raw(&MAGIC);
    out.write_u8(PROTOCOL_1_0.major);
    out.write_u8(PROTOCOL_1_0.minor);
    out.write_u8(ENCODING_1_0.major);
    out.write_u8(ENCODING_1_0.minor);
    out.write_u8(kind as u8);
    out.write_u8(CompressionStatus::None as u8);
    out.write_i32(0);
    out
}

/// 结束消息：回填总长，按需压缩。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - `compress = false`：压缩状态为 0；
/// - `compress = true`：帧长不足 [`COMPRESSION_MIN_SIZE`] 或压缩后不更小时，压缩状态为 1（表示支持压缩）；
///   否则消息体被替换为“未压缩总长 + deflate 数据”，压缩状态为 2。
pub fn finish_message(mut out: OutputStream, compress: bool) -> RpcResult<Bytes> {
    let total = out.len();
    out.rewrite_i32(frame_size(total)?, SIZE_OFFSET)?;
    let mut bytes = out.into_bytes().to_vec();
    if !compress {
        return Ok(Bytes::from(bytes));
    }
    bytes[COMPRESSION_OFFSET] = CompressionStatus::Supported as u8;
    if total < COMPRESSION_MIN_SIZE {
        return Ok(Bytes::from(bytes));
    }
    let deflated = deflate(&bytes[HEADER_SIZE..])?;
    if HEADER_SIZE + 4 + deflated.len() >= total {
        return Ok(Bytes::from(bytes));
    }
    let mut compressed = Vec::with_capacity(HEADER_SIZE + 4 + deflated.len());
    compressed.extend_from_slice(&bytes[..HEADER_SIZE]);
    compressed.extend_from_slice(&frame_size(total)?.to_le_bytes());
    compressed.extend_from_slice(&deflated);
    let size = frame_size(compressed.len())?;
    compressed[COMPRESSION_OFFSET] = CompressionStatus::Compressed as u8;
    compressed[SIZE_OFFSET..HEADER_SIZE].copy_from_slice(&size.to_le_bytes());
    Ok(Bytes::from(compressed))
}

/// 只有帧头的消息（校验连接、关闭连接）。
pub fn header_only(kind: MessageType) -> RpcResult<Bytes> {
    finish_message(start_message(kind), false)
}

fn frame_size(len: usize) -> RpcResult<i32> {
    i32::try_from(len).map_err(|_| RpcError::MessageTooLarge {
        size: len,
        max: i32::MAX as usize,
    })
}

fn deflate(body: &[u8]) -> RpcResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    encoder
        .write_all(body)
        .and_then(|_| encoder.finish())
        .map_err(|err| RpcError::Protocol(format!("压缩失败：{err}")))
}

fn inflate(body: &[u8], expected: usize) -> RpcResult<Vec<u8>> {
    let mut out = Vec::with_capacity(expected);
    DeflateDecoder::new(body)
        .take(expected as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|err| RpcError::Protocol(format!("解压失败：{err}")))?;
    if out.len() != expected {
        return Err(RpcError::Protocol(format!(
            "解压后长度 {} 与声明的 {expected} 不一致",
            out.len()
        )));
    }
    Ok(out)
}

/// 校验帧头，返回 `(类型, 压缩状态, 总长)`。
pub fn parse_header(header: &[u8; HEADER_SIZE], max: usize) -> RpcResult<(MessageType, CompressionStatus, usize)> {
    if header[..4] != MAGIC {
        return Err(RpcError::Protocol(format!(
            "非法魔数 {:02x?}",
            &header[..4]
        )));
    }
    if header[4] != PROTOCOL_1_0.major {
        return Err(RpcError::Protocol(format!(
            "不支持的协议版本 {}.{}",
            header[4], header[5]
        )));
    }
    if header[6] != ENCODING_1_0.major {
        return Err(RpcError::Protocol(format!(
            "不支持的协议编码版本 {}.{}",
            header[6], header[7]
        )));
    }
    let kind = MessageType::try_from(header[8])?;
    let compression = CompressionStatus::try_from(header[COMPRESSION_OFFSET])?;
    let mut size = [0u8; 4];
    size.copy_from_slice(&header[SIZE_OFFSET..HEADER_SIZE]);
    let size = i32::from_le_bytes(size);
    if size < HEADER_SIZE as i32 {
        return Err(RpcError::Protocol(format!("帧长 {size} 小于帧头长度")));
    }
    let size = size as usize;
    if size > max {
        return Err(RpcError::MessageTooLarge { size, max });
    }
    Ok((kind, compression, size))
}

/// 将整帧字节解析为 [`Frame`]。
pub fn decode_frame(bytes: &[u8], max: usize) -> RpcResult<Frame> {
    let header: &[u8; HEADER_SIZE] = bytes
        .get(..HEADER_SIZE)
        .and_then(|head| head.try_into().ok())
        .ok_or_else(|| RpcError::Protocol("帧长度不足帧头".into()))?;
    let (kind, compression, size) = parse_header(header, max)?;
    if size != bytes.len() {
        return Err(RpcError::Protocol(format!(
            "帧长 {} 与声明的 {size} 不一致",
            bytes.len()
        )));
    }
    finish_frame(kind, compression, &bytes[HEADER_SIZE..], max)
}

fn finish_frame(
    kind: MessageType,
    compression: CompressionStatus,
    body: &[u8],
    max: usize,
) -> RpcResult<Frame> {
    let body = if compression == CompressionStatus::Compressed {
        let mut input = InputStream::new(body);
        let total = input.read_i32()?;
        if total < HEADER_SIZE as i32 {
            return Err(RpcError::Protocol(format!("未压缩长度 {total} 非法")));
        }
        let total = total as usize;
        if total > max {
            return Err(RpcError::MessageTooLarge { size: total, max });
        }
        Bytes::from(inflate(&body[4..], total - HEADER_SIZE)?)
    } else {
        Bytes::copy_from_slice(body)
    };
    Ok(Frame {
        kind,
        compression,
        body,
    })
}

/// 从会话读取一帧。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 在读到任何帧头字节之前遇到 EOF：返回 `Ok(None)`，表示对端干净地断开；
/// - 帧中途遇到 EOF：返回传输错误（`Reset`）；
/// - 帧头非法、超过 `max`、解压失败：返回协议错误，调用方应拆除连接。
pub async fn read_frame(transceiver: &dyn Transceiver, max: usize) -> RpcResult<Option<Frame>> {
    let mut header = [0u8; HEADER_SIZE];
    if !read_full(transceiver, &mut header, true).await? {
        return Ok(None);
    }
    let (kind, compression, size) = parse_header(&header, max)?;
    let mut body = vec![0u8; size - HEADER_SIZE];
    read_full(transceiver, &mut body, false).await?;
    finish_frame(kind, compression, &body, max).map(Some)
}

async fn read_full(
    transceiver: &dyn Transceiver,
    buf: &mut [u8],
    eof_allowed: bool,
) -> RpcResult<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = transceiver.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 && eof_allowed {
                return Ok(false);
            }
            return Err(RpcError::Transport(TransportError::new(
                "spark.rpc.protocol.truncated_frame",
                TransportErrorKind::Reset,
                format!("帧读取中途断开：已读 {filled}/{} 字节", buf.len()),
            )));
        }
        filled += n;
    }
    Ok(true)
}

/// 一条请求。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    /// 请求编号；0 表示单向。
    pub request_id: i32,
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
    /// 参数封装（含封装头部）。
    pub params: Bytes,
}

/// 写入切面：空切面写空序列，否则写单元素序列。
pub fn write_facet(out: &mut OutputStream, facet: &str) {
    if facet.is_empty() {
        out.write_size(0);
    } else {
        out.write_size(1);
        out.write_string(facet);
    }
}

/// 读取切面序列，最多一个元素。
pub fn read_facet(input: &mut InputStream<'_>) -> RpcResult<String> {
    let path = input.read_string_seq()?;
    if path.len() > 1 {
        return Err(RpcError::Protocol(format!("切面路径过长：{} 段", path.len())));
    }
    Ok(path.into_iter().next().unwrap_or_default())
}

/// 写入上下文字典。
pub fn write_context(out: &mut OutputStream, context: &Context) {
    out.write_size(context.len());
    for (key, value) in context {
        out.write_string(key);
        out.write_string(value);
    }
}

/// 读取上下文字典。
pub fn read_context(input: &mut InputStream<'_>) -> WireResult<Context> {
    let count = input.read_and_check_seq_size(2)?;
    let mut context = Context::new();
    for _ in 0..count {
        let key = input.read_string()?;
        let value = input.read_string()?;
        context.insert(key, value);
    }
    Ok(context)
}

impl Request {
    /// 写入请求体；批量请求中的请求不带编号。
    pub fn write(&self, out: &mut OutputStream, with_id: bool) {
        if with_id {
            out.write_i32(self.request_id);
        }
        self.identity.write(out);
        write_facet(out, &self.facet);
        out.write_string(&self.operation);
        out.write_u8(self.mode as u8);
        write_context(out, &self.context);
        out.write_encapsulation_bytes(&self.params);
    }

    /// 读取请求体。
    pub fn read(input: &mut InputStream<'_>, with_id: bool) -> RpcResult<Self> {
        let request_id = if with_id { input.read_i32()? } else { 0 };
        let identity = Identity::read(input)?;
        let facet = read_facet(input)?;
        let operation = input.read_string()?;
        let mode = OperationMode::read(input)?;
        let context = read_context(input)?;
        let params = Bytes::copy_from_slice(input.read_encapsulation_bytes()?);
        Ok(Self {
            request_id,
            identity,
            facet,
            operation,
            mode,
            context,
            params,
        })
    }

    /// 参数封装的编码版本。
    pub fn encoding(&self) -> EncodingVersion {
        self.params
            .get(4..6)
            .map_or(ENCODING_1_0, |v| EncodingVersion::new(v[0], v[1]))
    }
}

/// 解析批量请求体：`i32` 个数后跟不带编号的请求。
pub fn read_batch(body: &[u8]) -> RpcResult<Vec<Request>> {
    let mut input = InputStream::new(body);
    let count = input.read_i32()?;
    if count < 0 {
        return Err(WireError::NegativeSize(count).into());
    }
    let mut requests = Vec::new();
    for _ in 0..count {
        requests.push(Request::read(&mut input, false)?);
    }
    if input.remaining() != 0 {
        return Err(RpcError::Protocol(format!(
            "批量请求末尾多出 {} 字节",
            input.remaining()
        )));
    }
    Ok(requests)
}

/// 回复状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyStatus {
    /// 成功。
    Ok = 0,
    /// 用户异常。
    UserException = 1,
    /// 对象不存在。
    ObjectNotExist = 2,
    /// 切面不存在。
    FacetNotExist = 3,
    /// 操作不存在。
    OperationNotExist = 4,
    /// 未知本地异常。
    UnknownLocalException = 5,
    /// 未知用户异常。
    UnknownUserException = 6,
    /// 未知异常。
    UnknownException = 7,
}

/// 回复内容。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyBody {
    /// 成功，负载为返回值封装。
    Ok(Bytes),
    /// 用户异常，负载为异常封装。
    UserException(Bytes),
    /// 对象不存在。
    ObjectNotExist {
        /// 目标身份。
        identity: Identity,
        /// 目标切面。
        facet: String,
        /// 操作名。
        operation: String,
    },
    /// 切面不存在。
    FacetNotExist {
        /// 目标身份。
        identity: Identity,
        /// 目标切面。
        facet: String,
        /// 操作名。
        operation: String,
    },
    /// 操作不存在。
    OperationNotExist {
        /// 目标身份。
        identity: Identity,
        /// 目标切面。
        facet: String,
        /// 操作名。
        operation: String,
    },
    /// 未知本地异常。
    UnknownLocal(String),
    /// 未知用户异常。
    UnknownUser(String),
    /// 未知异常。
    Unknown(String),
}

impl ReplyBody {
    /// 状态字节。
    pub fn status(&self) -> ReplyStatus {
        match self {
            ReplyBody::Ok(_) => ReplyStatus::Ok,
            ReplyBody::UserException(_) => ReplyStatus::UserException,
            ReplyBody::ObjectNotExist { .. } => ReplyStatus::ObjectNotExist,
            ReplyBody::FacetNotExist { .. } => ReplyStatus::FacetNotExist,
            ReplyBody::OperationNotExist { .. } => ReplyStatus::OperationNotExist,
            ReplyBody::UnknownLocal(_) => ReplyStatus::UnknownLocalException,
            ReplyBody::UnknownUser(_) => ReplyStatus::UnknownUserException,
            ReplyBody::Unknown(_) => ReplyStatus::UnknownException,
        }
    }

    /// 转换为调用结果。
    pub fn into_result(self) -> RpcResult<Bytes> {
        match self {
            ReplyBody::Ok(encaps) => Ok(encaps),
            ReplyBody::UserException(encaps) => Err(RpcError::UserException(encaps)),
            ReplyBody::ObjectNotExist {
                identity,
                facet,
                operation,
            } => Err(RpcError::ObjectNotExist {
                identity,
                facet,
                operation,
            }),
            ReplyBody::FacetNotExist {
                identity,
                facet,
                operation,
            } => Err(RpcError::FacetNotExist {
                identity,
                facet,
                operation,
            }),
            ReplyBody::OperationNotExist {
                identity,
                facet,
                operation,
            } => Err(RpcError::OperationNotExist {
                identity,
                facet,
                operation,
            }),
            ReplyBody::UnknownLocal(text) => Err(RpcError::UnknownLocal(text)),
            ReplyBody::UnknownUser(text) => Err(RpcError::UnknownUser(text)),
            ReplyBody::Unknown(text) => Err(RpcError::Unknown(text)),
        }
    }
}

/// 一条回复。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    /// 对应的请求编号。
    pub request_id: i32,
    /// 回复内容。
    pub body: ReplyBody,
}

impl Reply {
    /// 写入回复体。
    pub fn write(&self, out: &mut OutputStream) {
        out.write_i32(self.request_id);
        out.write_u8(self.body.status() as u8);
        match &self.body {
            ReplyBody::Ok(encaps) | ReplyBody::UserException(encaps) => {
                out.write_encapsulation_bytes(encaps);
            }
            ReplyBody::ObjectNotExist {
                identity,
                facet,
                operation,
            }
            | ReplyBody::FacetNotExist {
                identity,
                facet,
                operation,
            }
            | ReplyBody::OperationNotExist {
                identity,
                facet,
                operation,
            } => {
                identity.write(out);
                write_facet(out, facet);
                out.write_string(operation);
            }
            ReplyBody::UnknownLocal(text)
            | ReplyBody::UnknownUser(text)
            | ReplyBody::Unknown(text) => out.write_string(text),
        }
    }

    /// 读取回复体。
    pub fn read(input: &mut InputStream<'_>) -> RpcResult<Self> {
        let request_id = input.read_i32()?;
        let status = input.read_u8()?;
        let body = match status {
            0 => ReplyBody::Ok(Bytes::copy_from_slice(input.read_encapsulation_bytes()?)),
            1 => ReplyBody::UserException(Bytes::copy_from_slice(
                input.read_encapsulation_bytes()?,
            )),
            2..=4 => {
                let identity = Identity::read(input)?;
                let facet = read_facet(input)?;
                let operation = input.read_string()?;
                match status {
                    2 => ReplyBody::ObjectNotExist {
                        identity,
                        facet,
                        operation,
                    },
                    3 => ReplyBody::FacetNotExist {
                        identity,
                        facet,
                        operation,
                    },
                    _ => ReplyBody::OperationNotExist {
                        identity,
                        facet,
                        operation,
                    },
                }
            }
            5 => ReplyBody::UnknownLocal(input.read_string()?),
            6 => ReplyBody::UnknownUser(input.read_string()?),
            7 => ReplyBody::Unknown(input.read_string()?),
            other => return Err(RpcError::Protocol(format!("未知回复状态 {other}"))),
        };
        Ok(Self { request_id, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_rpc_transport::MemoryTransceiver;
    use spark_rpc_wire::ENCODING_1_1;

    fn sample_request(payload: usize) -> Request {
        let mut params = OutputStream::with_encoding(ENCODING_1_1);
        params.start_encapsulation();
        params.write_byte_seq(&vec![7u8; payload]);
        params.end_encapsulation().expect("封装结束");
        Request {
            request_id: 42,
            identity: Identity::new("hello", "demo"),
            facet: "admin".into(),
            operation: "sayHello".into(),
            mode: OperationMode::Idempotent,
            context: Context::from([("k".to_owned(), "v".to_owned())]),
            params: params.into_bytes(),
        }
    }

    #[test]
    fn header_layout_is_fixed() {
        let bytes = header_only(MessageType::ValidateConnection).expect("帧");
        assert_eq!(
            &bytes[..],
            &[b'I', b'c', b'e', b'P', 1, 0, 1, 0, 3, 0, 14, 0, 0, 0]
        );
        let frame = decode_frame(&bytes, 1024).expect("解析帧");
        assert_eq!(frame.kind, MessageType::ValidateConnection);
        assert!(frame.body.is_empty());
    }

    #[test]
    fn request_survives_compression() {
        let request = sample_request(4096);
        let mut out = start_message(MessageType::Request);
        request.write(&mut out, true);
        let plain_len = out.len();
        let bytes = finish_message(out, true).expect("压缩帧");
        assert_eq!(bytes[COMPRESSION_OFFSET], CompressionStatus::Compressed as u8);
        assert!(bytes.len() < plain_len);

        let frame = decode_frame(&bytes, 1 << 20).expect("解压帧");
        assert_eq!(frame.compression, CompressionStatus::Compressed);
        let decoded = Request::read(&mut InputStream::new(&frame.body), true).expect("解码请求");
        assert_eq!(decoded, request);
        assert_eq!(decoded.encoding(), ENCODING_1_1);
    }

    #[test]
    fn small_frames_only_advertise_compression() {
        let request = sample_request(4);
        let mut out = start_message(MessageType::Request);
        request.write(&mut out, true);
        let bytes = finish_message(out, true).expect("帧");
        assert_eq!(bytes[COMPRESSION_OFFSET], CompressionStatus::Supported as u8);
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let mut bytes = header_only(MessageType::CloseConnection)
            .expect("帧")
            .to_vec();
        bytes[0] = b'X';
        assert!(matches!(decode_frame(&bytes, 1024), Err(RpcError::Protocol(_))));

        let mut out = start_message(MessageType::Request);
        sample_request(64).write(&mut out, true);
        let bytes = finish_message(out, false).expect("帧");
        let err = decode_frame(&bytes, 32).expect_err("超过上限");
        assert!(matches!(err, RpcError::MessageTooLarge { max: 32, .. }));
    }

    #[test]
    fn reply_statuses_map_to_errors() {
        let reply = Reply {
            request_id: 9,
            body: ReplyBody::FacetNotExist {
                identity: Identity::new("a", ""),
                facet: "f".into(),
                operation: "op".into(),
            },
        };
        let mut out = OutputStream::new();
        reply.write(&mut out);
        let bytes = out.into_bytes();
        let decoded = Reply::read(&mut InputStream::new(&bytes)).expect("解码回复");
        assert_eq!(decoded, reply);
        let err = decoded.body.into_result().expect_err("切面不存在");
        assert_eq!(err.code(), "spark.rpc.dispatch.facet_not_exist");
    }

    #[test]
    fn batch_body_carries_requests_without_ids() {
        let mut out = OutputStream::new();
        out.write_i32(2);
        let first = sample_request(3);
        first.write(&mut out, false);
        first.write(&mut out, false);
        let bytes = out.into_bytes();
        let requests = read_batch(&bytes).expect("解码批量");
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].request_id, 0);
        assert_eq!(requests[1].operation, "sayHello");
    }

    #[tokio::test]
    async fn read_frame_distinguishes_clean_and_torn_eof() {
        let (client, server) = MemoryTransceiver::pair();
        let bytes = header_only(MessageType::CloseConnection).expect("帧");
        client.write(&bytes).await.expect("写帧");
        client.write(&bytes[..5]).await.expect("写半帧");
        client.close().await.expect("关闭");

        let frame = read_frame(&server, 1024).await.expect("读帧").expect("完整帧");
        assert_eq!(frame.kind, MessageType::CloseConnection);
        let err = read_frame(&server, 1024).await.expect_err("半帧");
        assert!(matches!(err, RpcError::Transport(_)));

        let (client, server) = MemoryTransceiver::pair();
        client.close().await.expect("关闭");
        assert!(read_frame(&server, 1024).await.expect("干净 EOF").is_none());
    }
}
