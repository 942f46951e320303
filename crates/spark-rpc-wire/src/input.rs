//! 解码输入流。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 以借用切片为输入做零拷贝读取，字符串与字节序列直接从原缓冲切出；
//! - 任何越界都以 [`WireError::Truncated`] 返回而不是 panic，保证恶意字节流只影响当前消息。
//!
//! ## 契约（What）
//! - 读位置只前进不回退，唯一例外是可选成员探测时“吐回”头部；
//! - 封装按帧压栈，帧的结束偏移同时作为顶层可选成员的结束标志；
//! - 类实例解码结果累积在流自带的 [`InstanceGraph`] 中，调用 [`InputStream::into_graph`] 取出。
//!
//! ## 风险与注意事项（Trade-offs）
//! - 序列长度按“剩余字节 / 元素最小尺寸”做上限校验，可拒绝绝大多数伪造的超长序列，
//!   但无法防御元素本身可变长的放大攻击，连接层仍需限制整条消息的大小。

use crate::{
    context::WireContext,
    data::InstanceGraph,
    error::{WireError, WireResult},
    optional::{OPTIONAL_END_MARKER, OptionalFormat},
    slicing::decode::DecodeState,
    version::{ENCODING_1_0, ENCODING_1_1, EncodingVersion},
};
use std::sync::Arc;

/// 一层解码帧：顶层或一个封装。
#[derive(Debug)]
pub(crate) struct ReadFrame {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) encoding: EncodingVersion,
    pub(crate) values: Option<Box<DecodeState>>,
}

/// 解码输入流。
#[derive(Debug)]
pub struct InputStream<'a> {
    pub(crate) buf: &'a [u8],
    pub(crate) pos: usize,
    pub(crate) frames: Vec<ReadFrame>,
    pub(crate) context: Option<Arc<WireContext>>,
    pub(crate) graph: InstanceGraph,
}

impl<'a> InputStream<'a> {
    /// 以编码 1.1 读取 `buf`。
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_encoding(buf, ENCODING_1_1)
    }

    /// 指定顶层编码版本。
    pub fn with_encoding(buf: &'a [u8], encoding: EncodingVersion) -> Self {
        Self {
            buf,
            pos: 0,
            frames: vec![ReadFrame {
                start: 0,
                end: buf.len(),
                encoding,
                values: None,
            }],
            context: None,
            graph: InstanceGraph::new(),
        }
    }

    /// 附加类型上下文，解码类与异常时必需。
    pub fn with_context(mut self, context: Arc<WireContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// 当前读位置。
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// 剩余未读字节数。
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// 当前帧的编码版本。
    pub fn encoding(&self) -> EncodingVersion {
        self.frame().encoding
    }

    /// 已解出的实例图。
    pub fn graph(&self) -> &InstanceGraph {
        &self.graph
    }

    /// 取出实例图。
    pub fn into_graph(self) -> InstanceGraph {
        self.graph
    }

    pub(crate) fn frame(&self) -> &ReadFrame {
        // frames[0] 是顶层帧，构造后始终存在。
        &self.frames[self.frames.len() - 1]
    }

    pub(crate) fn frame_mut(&mut self) -> &mut ReadFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// 读取 `n` 个原始字节。
    pub fn read_raw(&mut self, n: usize) -> WireResult<&'a [u8]> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(WireError::Truncated {
                needed: n,
                remaining,
            });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..start + n])
    }

    /// 跳过 `n` 个字节。
    pub fn skip(&mut self, n: usize) -> WireResult<()> {
        self.read_raw(n).map(|_| ())
    }

    fn read_array<const N: usize>(&mut self) -> WireResult<[u8; N]> {
        let raw = self.read_raw(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(raw);
        Ok(out)
    }

    /// 读取布尔值，任何非零字节都视为 `true`。
    pub fn read_bool(&mut self) -> WireResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// 读取字节。
    pub fn read_u8(&mut self) -> WireResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// 读取 16 位整数。
    pub fn read_i16(&mut self) -> WireResult<i16> {
        self.read_array().map(i16::from_le_bytes)
    }

    /// 读取 32 位整数。
    pub fn read_i32(&mut self) -> WireResult<i32> {
        self.read_array().map(i32::from_le_bytes)
    }

    /// 读取 64 位整数。
    pub fn read_i64(&mut self) -> WireResult<i64> {
        self.read_array().map(i64::from_le_bytes)
    }

    /// 读取单精度浮点。
    pub fn read_f32(&mut self) -> WireResult<f32> {
        self.read_array().map(f32::from_le_bytes)
    }

    /// 读取双精度浮点。
    pub fn read_f64(&mut self) -> WireResult<f64> {
        self.read_array().map(f64::from_le_bytes)
    }

    /// 读取 size。
    pub fn read_size(&mut self) -> WireResult<usize> {
        let first = self.read_u8()?;
        if first == 255 {
            let size = self.read_i32()?;
            usize::try_from(size).map_err(|_| WireError::NegativeSize(size))
        } else {
            Ok(usize::from(first))
        }
    }

    /// 读取序列长度并按元素最小尺寸校验剩余字节。
    pub fn read_and_check_seq_size(&mut self, min_size: usize) -> WireResult<usize> {
        let count = self.read_size()?;
        let remaining = self.remaining();
        if count.saturating_mul(min_size.max(1)) > remaining {
            return Err(WireError::SequenceTooLarge { count, remaining });
        }
        Ok(count)
    }

    /// 读取字符串。
    pub fn read_string(&mut self) -> WireResult<String> {
        let len = self.read_size()?;
        let raw = self.read_raw(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8)
    }

    /// 读取字符串序列。
    pub fn read_string_seq(&mut self) -> WireResult<Vec<String>> {
        let count = self.read_and_check_seq_size(1)?;
        (0..count).map(|_| self.read_string()).collect()
    }

    /// 读取字节序列，直接借用原缓冲。
    pub fn read_byte_seq(&mut self) -> WireResult<&'a [u8]> {
        let len = self.read_size()?;
        self.read_raw(len)
    }

    /// 读取枚举值。
    pub fn read_enum(&mut self, max: i32) -> WireResult<i32> {
        let value = if self.encoding() == ENCODING_1_0 {
            if max < 127 {
                i32::from(self.read_u8()?)
            } else if max < 32767 {
                i32::from(self.read_i16()?)
            } else {
                self.read_i32()?
            }
        } else {
            i32::try_from(self.read_size()?).unwrap_or(i32::MAX)
        };
        if value < 0 || value > max {
            return Err(WireError::EnumOutOfRange { value, max });
        }
        Ok(value)
    }

    /// 开始解码封装，返回其编码版本。
    pub fn start_encapsulation(&mut self) -> WireResult<EncodingVersion> {
        let start = self.pos;
        let size = self.read_i32()?;
        if size < 6 {
            return Err(WireError::InvalidEncapsulation(size));
        }
        let size = size as usize;
        if size - 4 > self.remaining() {
            return Err(WireError::Truncated {
                needed: size - 4,
                remaining: self.remaining(),
            });
        }
        let encoding = EncodingVersion::new(self.read_u8()?, self.read_u8()?);
        if !encoding.is_supported() {
            return Err(WireError::UnsupportedEncoding(encoding));
        }
        self.frames.push(ReadFrame {
            start,
            end: start + size,
            encoding,
            values: None,
        });
        Ok(encoding)
    }

    /// 结束封装：1.1 下先跳过剩余可选成员，随后要求读位置恰好位于封装末尾。
    pub fn end_encapsulation(&mut self) -> WireResult<()> {
        if self.frames.len() < 2 {
            return Err(WireError::InvalidState("没有打开的封装"));
        }
        if self.encoding().supports_optionals() {
            self.skip_optionals()?;
        }
        let end = self.frame().end;
        if self.pos != end {
            return Err(WireError::EncapsulationSizeMismatch {
                declared_end: end,
                position: self.pos,
            });
        }
        self.frames.pop();
        Ok(())
    }

    /// 跳过整个封装，返回其编码版本。
    pub fn skip_encapsulation(&mut self) -> WireResult<EncodingVersion> {
        let size = self.read_i32()?;
        if size < 6 {
            return Err(WireError::InvalidEncapsulation(size));
        }
        let encoding = EncodingVersion::new(self.read_u8()?, self.read_u8()?);
        self.skip(size as usize - 6)?;
        Ok(encoding)
    }

    /// 读出完整封装（含头部）的原始字节。
    pub fn read_encapsulation_bytes(&mut self) -> WireResult<&'a [u8]> {
        let start = self.pos;
        self.skip_encapsulation()?;
        Ok(&self.buf[start..self.pos])
    }

    /// 探测可选成员 `tag` 是否存在。
    ///
    /// 较小的 tag 被跳过；较大的 tag、结束标记或帧末尾表示缺席，并把读位置恢复到探测前。
    pub fn read_optional(&mut self, tag: i32, expected: OptionalFormat) -> WireResult<bool> {
        if !self.encoding().supports_optionals() || !self.slice_allows_optionals() {
            return Ok(false);
        }
        loop {
            if self.pos >= self.frame().end {
                return Ok(false);
            }
            let header_start = self.pos;
            let header = self.read_u8()?;
            if header == OPTIONAL_END_MARKER {
                self.pos = header_start;
                return Ok(false);
            }
            let format = OptionalFormat::from_bits(header);
            let mut found = i32::from(header >> 3);
            if found == 30 {
                found = i32::try_from(self.read_size()?).unwrap_or(i32::MAX);
            }
            if found > tag {
                self.pos = header_start;
                return Ok(false);
            }
            if found < tag {
                self.skip_optional(format)?;
                continue;
            }
            if format != expected {
                return Err(WireError::OptionalFormatMismatch {
                    tag,
                    expected,
                    found: format,
                });
            }
            return Ok(true);
        }
    }

    /// 按格式码跳过一个可选成员的负载。
    pub fn skip_optional(&mut self, format: OptionalFormat) -> WireResult<()> {
        match format {
            OptionalFormat::Size => {
                self.read_size()?;
            }
            OptionalFormat::VSize => {
                let len = self.read_size()?;
                self.skip(len)?;
            }
            OptionalFormat::FSize => {
                let len = self.read_i32()?;
                let len = usize::try_from(len).map_err(|_| WireError::NegativeSize(len))?;
                self.skip(len)?;
            }
            OptionalFormat::Class => self.skip_instance_ref()?,
            fixed => self.skip(fixed.fixed_len().unwrap_or(0))?,
        }
        Ok(())
    }

    /// 跳过剩余的全部可选成员，直到结束标记或帧末尾。
    pub fn skip_optionals(&mut self) -> WireResult<()> {
        loop {
            if self.pos >= self.frame().end {
                return Ok(());
            }
            let header = self.read_u8()?;
            if header == OPTIONAL_END_MARKER {
                return Ok(());
            }
            if header >> 3 == 30 {
                self.read_size()?;
            }
            self.skip_optional(OptionalFormat::from_bits(header))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OutputStream;

    #[test]
    fn truncated_reads_fail_without_panicking() {
        let mut input = InputStream::new(&[1, 2]);
        assert_eq!(
            input.read_i32(),
            Err(WireError::Truncated {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn oversized_sequence_is_rejected() {
        let mut input = InputStream::new(&[200, 0, 0]);
        assert!(matches!(
            input.read_and_check_seq_size(4),
            Err(WireError::SequenceTooLarge { count: 200, .. })
        ));
    }

    #[test]
    fn negative_extended_size_is_rejected() {
        let mut input = InputStream::new(&[255, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(input.read_size(), Err(WireError::NegativeSize(-1)));
    }

    #[test]
    fn higher_tag_rewinds_and_reports_absent() {
        let mut out = OutputStream::new();
        out.write_optional(7, OptionalFormat::F1).expect("写出可选头部");
        out.write_u8(9);
        let bytes = out.into_bytes();
        let mut input = InputStream::new(&bytes);
        assert_eq!(input.read_optional(3, OptionalFormat::F4), Ok(false));
        assert_eq!(input.pos(), 0);
        assert_eq!(input.read_optional(7, OptionalFormat::F1), Ok(true));
        assert_eq!(input.read_u8(), Ok(9));
    }

    #[test]
    fn non_canonical_extended_tag_rewinds_whole_header() {
        // 扩展形式写出的 tag 31，其后紧跟一个非规范的扩展 tag 5（本应内联）。
        let bytes = [(30 << 3) | 5, 31, 0, (30 << 3), 5, 1];
        let mut input = InputStream::new(&bytes);
        assert_eq!(input.read_optional(31, OptionalFormat::VSize), Ok(true));
        assert_eq!(input.read_size(), Ok(0));
        let before = input.pos();
        assert_eq!(input.read_optional(3, OptionalFormat::F1), Ok(false));
        assert_eq!(input.pos(), before);
    }

    #[test]
    fn mismatched_format_is_malformed() {
        let mut out = OutputStream::new();
        out.write_optional(2, OptionalFormat::F8).expect("写出可选头部");
        out.write_i64(1);
        let bytes = out.into_bytes();
        let mut input = InputStream::new(&bytes);
        let err = input
            .read_optional(2, OptionalFormat::F4)
            .expect_err("格式不一致");
        assert!(err.is_malformed());
    }

    #[test]
    fn encapsulation_trailing_bytes_detected() {
        let mut input = InputStream::new(&[8, 0, 0, 0, 1, 0, 1, 2]);
        assert_eq!(input.start_encapsulation(), Ok(ENCODING_1_0));
        input.read_u8().expect("有 1 字节");
        assert!(matches!(
            input.end_encapsulation(),
            Err(WireError::EncapsulationSizeMismatch { .. })
        ));
    }
}
