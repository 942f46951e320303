//! 编码输出流。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 所有写操作汇聚到一个 `BytesMut`，协议层可以在同一缓冲里拼出消息头、请求头与参数封装，
//!   最后一次性冻结为 `Bytes` 交给传输层，避免多段拷贝。
//!
//! ## 契约（What）
//! - 整数与浮点一律小端序；size 小于 255 用 1 字节，否则 `0xFF` 后跟 4 字节；
//! - 封装以 4 字节总长（含自身 6 字节头）+ 版本开头，`end_encapsulation` 回填长度；
//! - 编码状态按封装分帧：每个封装拥有独立的实例编号与类型标识表。
//!
//! ## 风险与注意事项（Trade-offs）
//! - 超过 `i32::MAX` 的长度无法在线上表示，会被截断到 `i32::MAX`；连接层的消息上限远小于该值。

use crate::{
    error::{WireError, WireResult},
    optional::{INLINE_TAG_LIMIT, OptionalFormat},
    slicing::encode::EncodeState,
    version::{ENCODING_1_1, EncodingVersion, FormatType},
};
use bytes::{BufMut, Bytes, BytesMut};

/// 一层编码帧：顶层或一个封装。
#[derive(Debug)]
pub(crate) struct WriteFrame {
    pub(crate) start: usize,
    pub(crate) encoding: EncodingVersion,
    pub(crate) format: FormatType,
    pub(crate) values: Option<Box<EncodeState>>,
}

/// 编码输出流。
#[derive(Debug)]
pub struct OutputStream {
    pub(crate) buf: BytesMut,
    pub(crate) frames: Vec<WriteFrame>,
}

impl Default for OutputStream {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputStream {
    /// 以编码 1.1、紧凑格式创建输出流。
    pub fn new() -> Self {
        Self::with_encoding(ENCODING_1_1)
    }

    /// 指定顶层编码版本。
    pub fn with_encoding(encoding: EncodingVersion) -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            frames: vec![WriteFrame {
                start: 0,
                encoding,
                format: FormatType::Compact,
                values: None,
            }],
        }
    }

    /// 设置当前帧的类格式。
    pub fn set_format(&mut self, format: FormatType) {
        self.frame_mut().format = format;
    }

    /// 当前帧的编码版本。
    pub fn encoding(&self) -> EncodingVersion {
        self.frame().encoding
    }

    /// 当前帧的类格式。
    pub fn format(&self) -> FormatType {
        self.frame().format
    }

    /// 已写入的字节数。
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// 是否尚未写入任何字节。
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// 查看已写入的字节。
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// 冻结为不可变字节。
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub(crate) fn frame(&self) -> &WriteFrame {
        // frames[0] 是顶层帧，构造后始终存在。
        &self.frames[self.frames.len() - 1]
    }

    pub(crate) fn frame_mut(&mut self) -> &mut WriteFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// 写入布尔值。
    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    /// 写入字节。
    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// 写入 16 位整数。
    pub fn write_i16(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    /// 写入 32 位整数。
    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    /// 写入 64 位整数。
    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    /// 写入单精度浮点。
    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    /// 写入双精度浮点。
    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    /// 写入 size。
    pub fn write_size(&mut self, size: usize) {
        let size = i32::try_from(size).unwrap_or(i32::MAX);
        if size > 254 {
            self.buf.put_u8(255);
            self.buf.put_i32_le(size);
        } else {
            self.buf.put_u8(size as u8);
        }
    }

    /// 写入字符串。
    pub fn write_string(&mut self, v: &str) {
        self.write_size(v.len());
        self.buf.put_slice(v.as_bytes());
    }

    /// 写入字符串序列。
    pub fn write_string_seq<S: AsRef<str>>(&mut self, items: &[S]) {
        self.write_size(items.len());
        for item in items {
            self.write_string(item.as_ref());
        }
    }

    /// 写入字节序列（size + 原始字节）。
    pub fn write_byte_seq(&mut self, bytes: &[u8]) {
        self.write_size(bytes.len());
        self.buf.put_slice(bytes);
    }

    /// 原样写入字节，不带长度前缀。
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// 写入枚举值：1.0 按 `max` 选择 1/2/4 字节，1.1 使用 size。
    pub fn write_enum(&mut self, value: i32, max: i32) -> WireResult<()> {
        if value < 0 || value > max {
            return Err(WireError::EnumOutOfRange { value, max });
        }
        if self.encoding() == crate::version::ENCODING_1_0 {
            if max < 127 {
                self.write_u8(value as u8);
            } else if max < 32767 {
                self.write_i16(value as i16);
            } else {
                self.write_i32(value);
            }
        } else {
            self.write_size(value as usize);
        }
        Ok(())
    }

    /// 在指定位置回填 32 位整数。
    pub fn rewrite_i32(&mut self, value: i32, pos: usize) -> WireResult<()> {
        let slot = self
            .buf
            .get_mut(pos..pos + 4)
            .ok_or(WireError::InvalidState("回填位置越界"))?;
        slot.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// 写入 4 字节长度占位，返回占位位置。
    pub fn start_size(&mut self) -> usize {
        let pos = self.buf.len();
        self.buf.put_i32_le(0);
        pos
    }

    /// 以占位之后写入的字节数回填长度。
    pub fn end_size(&mut self, pos: usize) -> WireResult<()> {
        let len = self.buf.len().saturating_sub(pos + 4);
        self.rewrite_i32(i32::try_from(len).unwrap_or(i32::MAX), pos)
    }

    /// 以当前帧的编码与格式开始一个封装。
    pub fn start_encapsulation(&mut self) {
        let (encoding, format) = (self.encoding(), self.format());
        self.start_encapsulation_with(encoding, format);
    }

    /// 以指定编码与格式开始一个封装。
    pub fn start_encapsulation_with(&mut self, encoding: EncodingVersion, format: FormatType) {
        let start = self.buf.len();
        self.buf.put_i32_le(0);
        self.buf.put_u8(encoding.major);
        self.buf.put_u8(encoding.minor);
        self.frames.push(WriteFrame {
            start,
            encoding,
            format,
            values: None,
        });
    }

    /// 结束封装并回填总长。
    pub fn end_encapsulation(&mut self) -> WireResult<()> {
        if self.frames.len() < 2 {
            return Err(WireError::InvalidState("没有打开的封装"));
        }
        let frame = self
            .frames
            .pop()
            .ok_or(WireError::InvalidState("没有打开的封装"))?;
        let size = self.buf.len() - frame.start;
        self.rewrite_i32(i32::try_from(size).unwrap_or(i32::MAX), frame.start)
    }

    /// 写入空封装（只有头部）。
    pub fn write_empty_encapsulation(&mut self, encoding: EncodingVersion) {
        self.buf.put_i32_le(6);
        self.buf.put_u8(encoding.major);
        self.buf.put_u8(encoding.minor);
    }

    /// 原样写入一个已编码完成的封装。
    pub fn write_encapsulation_bytes(&mut self, encaps: &[u8]) {
        self.buf.put_slice(encaps);
    }

    /// 写入可选成员头部；编码 1.0 下返回 `Ok(false)` 且不写任何字节，负数 tag 返回错误。
    pub fn write_optional(&mut self, tag: i32, format: OptionalFormat) -> WireResult<bool> {
        if tag < 0 {
            return Err(WireError::InvalidTag(tag));
        }
        if !self.encoding().supports_optionals() {
            return Ok(false);
        }
        self.mark_slice_has_optionals();
        let mut header = format as u8;
        if tag < INLINE_TAG_LIMIT {
            header |= (tag as u8) << 3;
            self.buf.put_u8(header);
        } else {
            header |= (INLINE_TAG_LIMIT as u8) << 3;
            self.buf.put_u8(header);
            self.write_size(tag as usize);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::ENCODING_1_0;

    #[test]
    fn size_switches_to_extended_form() {
        let mut out = OutputStream::new();
        out.write_size(254);
        out.write_size(255);
        assert_eq!(out.as_slice(), &[254, 255, 255, 0, 0, 0]);
    }

    #[test]
    fn encapsulation_size_includes_header() {
        let mut out = OutputStream::new();
        out.start_encapsulation();
        out.write_i32(7);
        out.end_encapsulation().expect("封装已打开");
        assert_eq!(out.as_slice(), &[10, 0, 0, 0, 1, 1, 7, 0, 0, 0]);
        assert!(out.end_encapsulation().is_err());
    }

    #[test]
    fn enum_width_depends_on_encoding() {
        let mut legacy = OutputStream::with_encoding(ENCODING_1_0);
        legacy.write_enum(3, 200).expect("合法枚举");
        assert_eq!(legacy.as_slice(), &[3, 0]);
        let mut modern = OutputStream::new();
        modern.write_enum(3, 200).expect("合法枚举");
        assert_eq!(modern.as_slice(), &[3]);
        assert!(modern.write_enum(201, 200).is_err());
    }

    #[test]
    fn optionals_suppressed_under_legacy_encoding() {
        let mut legacy = OutputStream::with_encoding(ENCODING_1_0);
        assert_eq!(legacy.write_optional(1, OptionalFormat::F4), Ok(false));
        assert!(legacy.is_empty());
        let mut modern = OutputStream::new();
        assert_eq!(modern.write_optional(40, OptionalFormat::VSize), Ok(true));
        assert_eq!(modern.as_slice(), &[(30 << 3) | 5, 40]);
    }

    #[test]
    fn negative_tag_is_rejected_without_writing() {
        let mut out = OutputStream::new();
        let err = out
            .write_optional(-1, OptionalFormat::F1)
            .expect_err("负数 tag 无法编码");
        assert_eq!(err, WireError::InvalidTag(-1));
        assert_eq!(err.code(), "spark.rpc.wire.invalid_tag");
        assert!(out.is_empty());
    }
}
