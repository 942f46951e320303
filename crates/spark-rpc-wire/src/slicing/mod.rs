//! 多态类型切片引擎（编码 1.1 的类与用户异常）。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 类实例按继承层次拆成若干“切片”，最派生切片在前。接收端只认识基类时，可以跳过
//!   不认识的派生切片并原样保存，转发时再写回，实现前向兼容。
//! - 实例之间可以互相引用甚至成环；解码采用“竞技场 + 延迟补丁”：首次提及即分配编号，
//!   引用方登记补丁，被引用实例到达结束标记时统一兑现。
//!
//! ## 契约（What）
//! - 切片标志位见本模块常量；实例引用 `0` 为空、`1` 为内联实例、`n ≥ 2` 为回指编号；
//! - 切片格式下切片内的引用是间接表下标（从 1 开始），间接表写在切片主体之后；
//! - 每个补丁恰好兑现一次，且一定发生在目标实例的结束标记之后；
//! - 编码 1.0 不支持类与异常，调用会返回 [`WireError::UnsupportedEncoding`](crate::WireError)。
//!
//! ## 实现（How）
//! - [`encode`] 为 [`OutputStream`](crate::OutputStream) 扩展实例/异常/成员写入；
//! - [`decode`] 为 [`InputStream`](crate::InputStream) 扩展对应读取，并维护补丁表与延迟写回。
//!
//! ## 风险与注意事项（Trade-offs）
//! - 结构体成员中的实例引用按“容器内路径”回写，路径在解码期间构造，嵌套极深的容器会
//!   产生额外分配；实际接口中此类成员很少。

pub(crate) mod decode;
pub(crate) mod encode;

/// 类型标识以字符串写出。
pub const FLAG_HAS_TYPE_ID_STRING: u8 = 1 << 0;
/// 类型标识以已出现过的索引写出。
pub const FLAG_HAS_TYPE_ID_INDEX: u8 = 1 << 1;
/// 类型标识以紧凑编号写出。
pub const FLAG_HAS_TYPE_ID_COMPACT: u8 = FLAG_HAS_TYPE_ID_STRING | FLAG_HAS_TYPE_ID_INDEX;
/// 切片携带可选成员，以结束标记收尾。
pub const FLAG_HAS_OPTIONAL_MEMBERS: u8 = 1 << 2;
/// 切片之后跟随间接表。
pub const FLAG_HAS_INDIRECTION_TABLE: u8 = 1 << 3;
/// 切片带 4 字节长度。
pub const FLAG_HAS_SLICE_SIZE: u8 = 1 << 4;
/// 最后（最基）的切片。
pub const FLAG_IS_LAST_SLICE: u8 = 1 << 5;

/// 当前正在处理的切片属于类实例还是异常。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SliceType {
    Value,
    Exception,
}
