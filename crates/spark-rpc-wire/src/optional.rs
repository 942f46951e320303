//! 可选成员（tagged optional）的格式码与头部布局。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 可选成员允许接口在不破坏旧客户端的前提下追加字段：旧端看到不认识的 tag 只需按格式码跳过。
//! - 因此格式码必须独立于类型本身就能算出“负载有多长”，这正是本模块八种格式的含义。
//!
//! ## 契约（What）
//! - 头部一个字节：`(tag << 3) | format`；`tag >= 30` 时头部写入 30，随后以 size 编码真实 tag；
//! - 成员列表（切片内）以 [`OPTIONAL_END_MARKER`] 结尾，顶层参数则以封装末尾作为结束。
//!
//! ## 注意事项（Trade-offs）
//! - `Class` 格式的负载是一段实例引用，跳过它需要实例解码状态，因此由
//!   [`InputStream`](crate::InputStream) 统一处理而不是在这里计算长度。

/// 切片内可选成员列表的结束标记。
pub const OPTIONAL_END_MARKER: u8 = 0xFF;

/// 头部内联 tag 的上限，超过后改用扩展 tag。
pub(crate) const INLINE_TAG_LIMIT: i32 = 30;

/// 可选成员的负载格式。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OptionalFormat {
    /// 固定 1 字节。
    F1 = 0,
    /// 固定 2 字节。
    F2 = 1,
    /// 固定 4 字节。
    F4 = 2,
    /// 固定 8 字节。
    F8 = 3,
    /// 负载本身是一个 size。
    Size = 4,
    /// 负载前有一个 size 表示字节数。
    VSize = 5,
    /// 负载前有一个固定 4 字节长度。
    FSize = 6,
    /// 负载是一个类实例引用。
    Class = 7,
}

impl OptionalFormat {
    /// 从头部低 3 位还原格式码。
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => OptionalFormat::F1,
            1 => OptionalFormat::F2,
            2 => OptionalFormat::F4,
            3 => OptionalFormat::F8,
            4 => OptionalFormat::Size,
            5 => OptionalFormat::VSize,
            6 => OptionalFormat::FSize,
            _ => OptionalFormat::Class,
        }
    }

    /// 固定长度格式的负载字节数。
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            OptionalFormat::F1 => Some(1),
            OptionalFormat::F2 => Some(2),
            OptionalFormat::F4 => Some(4),
            OptionalFormat::F8 => Some(8),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bits_decode_low_three_bits() {
        assert_eq!(OptionalFormat::from_bits(0x2A), OptionalFormat::F4);
        assert_eq!(OptionalFormat::F8.fixed_len(), Some(8));
    }
}
