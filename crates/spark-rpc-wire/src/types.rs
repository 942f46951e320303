//! 类型描述符：以数据形式描述类、异常与结构体的成员布局。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 切片引擎不依赖代码生成器：类型布局作为运行期数据注册进 [`TypeRegistry`]，
//!   编解码按描述符逐成员驱动。
//! - 每个成员的 [`MemberType`] 同时决定其线格式与可选格式码，避免两处信息漂移。
//!
//! ## 契约（What）
//! - [`TypeDescriptor`] 只描述“本切片”的成员；基类成员由 `base` 链上的描述符负责；
//! - 可选成员在构建时即按 tag 升序排列，编码与解码都按此顺序遍历；
//! - [`TypeRegistry::chain`] 返回从最派生到最基的描述符序列，链断裂视为缺失描述符。
//!
//! ## 风险与注意事项（Trade-offs）
//! - 注册表在构造期填充、运行期只读；若需热更新请整体替换注册表而不是原地修改。

use crate::{
    data::Data,
    error::{WireError, WireResult},
    optional::OptionalFormat,
};
use std::{collections::HashMap, sync::Arc};

/// 所有类隐式继承的根类型标识。
pub const ROOT_TYPE_ID: &str = "::Ice::Object";

/// 切片链的最大长度，防止描述符之间形成继承环。
const MAX_CHAIN_LEN: usize = 64;

/// 成员的静态类型。
#[derive(Clone, Debug, PartialEq)]
pub enum MemberType {
    /// 布尔值，1 字节。
    Bool,
    /// 无符号字节。
    Byte,
    /// 16 位整数。
    Short,
    /// 32 位整数。
    Int,
    /// 64 位整数。
    Long,
    /// 单精度浮点。
    Float,
    /// 双精度浮点。
    Double,
    /// UTF-8 字符串。
    String,
    /// 枚举，`max` 为最大枚举值。
    Enum {
        /// 最大枚举值，决定 1.0 编码下的字节宽度。
        max: i32,
    },
    /// 序列。
    Sequence(Box<MemberType>),
    /// 字典。
    Dictionary(Box<MemberType>, Box<MemberType>),
    /// 结构体。
    Struct(Arc<StructDescriptor>),
    /// 类实例引用；`Some(type_id)` 表示静态类型约束。
    Class(Option<String>),
}

impl MemberType {
    /// 该类型编码后的最小字节数。
    pub fn min_wire_size(&self) -> usize {
        match self {
            MemberType::Bool | MemberType::Byte => 1,
            MemberType::Short => 2,
            MemberType::Int | MemberType::Float => 4,
            MemberType::Long | MemberType::Double => 8,
            MemberType::String
            | MemberType::Enum { .. }
            | MemberType::Sequence(_)
            | MemberType::Dictionary(..)
            | MemberType::Class(_) => 1,
            MemberType::Struct(desc) => desc.fields.iter().map(|(_, ty)| ty.min_wire_size()).sum(),
        }
    }

    /// 编码长度是否与取值无关。
    pub fn is_fixed_size(&self) -> bool {
        match self {
            MemberType::Bool
            | MemberType::Byte
            | MemberType::Short
            | MemberType::Int
            | MemberType::Long
            | MemberType::Float
            | MemberType::Double => true,
            MemberType::Struct(desc) => desc.fields.iter().all(|(_, ty)| ty.is_fixed_size()),
            _ => false,
        }
    }

    /// 作为可选成员时使用的格式码。
    pub fn optional_format(&self) -> OptionalFormat {
        match self {
            MemberType::Bool | MemberType::Byte => OptionalFormat::F1,
            MemberType::Short => OptionalFormat::F2,
            MemberType::Int | MemberType::Float => OptionalFormat::F4,
            MemberType::Long | MemberType::Double => OptionalFormat::F8,
            MemberType::String => OptionalFormat::VSize,
            MemberType::Enum { .. } => OptionalFormat::Size,
            MemberType::Sequence(elem) if elem.is_fixed_size() => OptionalFormat::VSize,
            MemberType::Dictionary(k, v) if k.is_fixed_size() && v.is_fixed_size() => {
                OptionalFormat::VSize
            }
            MemberType::Struct(_) if self.is_fixed_size() => OptionalFormat::VSize,
            MemberType::Class(_) => OptionalFormat::Class,
            _ => OptionalFormat::FSize,
        }
    }

    /// 是否（直接或嵌套地）包含类实例引用。
    pub fn contains_class(&self) -> bool {
        match self {
            MemberType::Class(_) => true,
            MemberType::Sequence(elem) => elem.contains_class(),
            MemberType::Dictionary(k, v) => k.contains_class() || v.contains_class(),
            MemberType::Struct(desc) => desc.fields.iter().any(|(_, ty)| ty.contains_class()),
            _ => false,
        }
    }

    /// 该类型的默认值。
    pub fn default_data(&self) -> Data {
        match self {
            MemberType::Bool => Data::Bool(false),
            MemberType::Byte => Data::Byte(0),
            MemberType::Short => Data::Short(0),
            MemberType::Int => Data::Int(0),
            MemberType::Long => Data::Long(0),
            MemberType::Float => Data::Float(0.0),
            MemberType::Double => Data::Double(0.0),
            MemberType::String => Data::String(String::new()),
            MemberType::Enum { .. } => Data::Enum(0),
            MemberType::Sequence(_) => Data::Sequence(Vec::new()),
            MemberType::Dictionary(..) => Data::Dictionary(Vec::new()),
            MemberType::Struct(desc) => Data::Struct(
                desc.fields
                    .iter()
                    .map(|(_, ty)| ty.default_data())
                    .collect(),
            ),
            MemberType::Class(_) => Data::Instance(None),
        }
    }

    /// 用于诊断信息的类型名。
    pub fn name(&self) -> String {
        match self {
            MemberType::Bool => "bool".into(),
            MemberType::Byte => "byte".into(),
            MemberType::Short => "short".into(),
            MemberType::Int => "int".into(),
            MemberType::Long => "long".into(),
            MemberType::Float => "float".into(),
            MemberType::Double => "double".into(),
            MemberType::String => "string".into(),
            MemberType::Enum { max } => format!("enum<{max}>"),
            MemberType::Sequence(elem) => format!("sequence<{}>", elem.name()),
            MemberType::Dictionary(k, v) => format!("dictionary<{}, {}>", k.name(), v.name()),
            MemberType::Struct(desc) => desc.type_id.clone(),
            MemberType::Class(Some(id)) => id.clone(),
            MemberType::Class(None) => ROOT_TYPE_ID.into(),
        }
    }
}

/// 结构体布局：按声明顺序排列的字段。
#[derive(Clone, Debug, PartialEq)]
pub struct StructDescriptor {
    /// 结构体类型标识。
    pub type_id: String,
    /// `(字段名, 字段类型)` 列表。
    pub fields: Vec<(String, MemberType)>,
}

impl StructDescriptor {
    /// 构造结构体描述符。
    pub fn new(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            fields: Vec::new(),
        }
    }

    /// 追加一个字段。
    pub fn field(mut self, name: impl Into<String>, ty: MemberType) -> Self {
        self.fields.push((name.into(), ty));
        self
    }
}

/// 单个成员的描述。
#[derive(Clone, Debug, PartialEq)]
pub struct MemberDescriptor {
    /// 成员名。
    pub name: String,
    /// 成员类型。
    pub ty: MemberType,
    /// 可选成员的 tag；必选成员为 `None`。
    pub tag: Option<i32>,
}

impl MemberDescriptor {
    /// 成员的可选格式码。
    pub fn format(&self) -> OptionalFormat {
        self.ty.optional_format()
    }
}

/// 描述符的种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// 类。
    Class,
    /// 用户异常。
    Exception,
}

/// 类或异常中“一个切片”的布局。
#[derive(Clone, Debug, PartialEq)]
pub struct TypeDescriptor {
    type_id: String,
    compact_id: Option<i32>,
    base: Option<String>,
    kind: TypeKind,
    members: Vec<MemberDescriptor>,
    optional_members: Vec<MemberDescriptor>,
}

impl TypeDescriptor {
    /// 创建类描述符。
    pub fn class(type_id: impl Into<String>) -> Self {
        Self::with_kind(type_id, TypeKind::Class)
    }

    /// 创建异常描述符。
    pub fn exception(type_id: impl Into<String>) -> Self {
        Self::with_kind(type_id, TypeKind::Exception)
    }

    fn with_kind(type_id: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            type_id: type_id.into(),
            compact_id: None,
            base: None,
            kind,
            members: Vec::new(),
            optional_members: Vec::new(),
        }
    }

    /// 设置紧凑类型编号。
    pub fn with_compact_id(mut self, compact_id: i32) -> Self {
        self.compact_id = Some(compact_id);
        self
    }

    /// 设置基类型。
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    /// 追加必选成员。
    pub fn member(mut self, name: impl Into<String>, ty: MemberType) -> Self {
        self.members.push(MemberDescriptor {
            name: name.into(),
            ty,
            tag: None,
        });
        self
    }

    /// 追加可选成员，插入后保持 tag 升序。
    pub fn optional(mut self, tag: i32, name: impl Into<String>, ty: MemberType) -> Self {
        let member = MemberDescriptor {
            name: name.into(),
            ty,
            tag: Some(tag),
        };
        let pos = self
            .optional_members
            .partition_point(|m| m.tag.unwrap_or_default() < tag);
        self.optional_members.insert(pos, member);
        self
    }

    /// 类型标识。
    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    /// 紧凑类型编号。
    pub fn compact_id(&self) -> Option<i32> {
        self.compact_id
    }

    /// 基类型标识。
    pub fn base(&self) -> Option<&str> {
        self.base.as_deref()
    }

    /// 描述符种类。
    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    /// 必选成员（声明顺序）。
    pub fn members(&self) -> &[MemberDescriptor] {
        &self.members
    }

    /// 可选成员（tag 升序）。
    pub fn optional_members(&self) -> &[MemberDescriptor] {
        &self.optional_members
    }
}

/// 类型描述符注册表。
#[derive(Clone, Debug, Default)]
pub struct TypeRegistry {
    by_id: HashMap<String, Arc<TypeDescriptor>>,
    by_compact: HashMap<i32, String>,
}

impl TypeRegistry {
    /// 创建空注册表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册描述符，返回被替换的旧描述符。
    pub fn register(&mut self, descriptor: TypeDescriptor) -> Option<Arc<TypeDescriptor>> {
        if let Some(compact) = descriptor.compact_id {
            self.by_compact.insert(compact, descriptor.type_id.clone());
        }
        self.by_id
            .insert(descriptor.type_id.clone(), Arc::new(descriptor))
    }

    /// 按类型标识查找。
    pub fn get(&self, type_id: &str) -> Option<&Arc<TypeDescriptor>> {
        self.by_id.get(type_id)
    }

    /// 将紧凑编号翻译为类型标识。
    pub fn resolve_compact_id(&self, compact_id: i32) -> Option<&str> {
        self.by_compact.get(&compact_id).map(String::as_str)
    }

    /// 返回从 `type_id` 到最基类型的描述符链（最派生在前）。
    pub fn chain(&self, type_id: &str) -> WireResult<Vec<Arc<TypeDescriptor>>> {
        let mut chain = Vec::new();
        let mut next = Some(type_id);
        while let Some(id) = next {
            if id == ROOT_TYPE_ID {
                break;
            }
            if chain.len() >= MAX_CHAIN_LEN {
                return Err(WireError::InvalidSlice("类型继承链过长或存在环"));
            }
            let descriptor = self
                .by_id
                .get(id)
                .ok_or_else(|| WireError::MissingDescriptor(id.to_owned()))?;
            chain.push(Arc::clone(descriptor));
            next = descriptor.base.as_deref();
        }
        Ok(chain)
    }

    /// `derived` 是否等于 `base` 或继承自 `base`。
    pub fn is_a(&self, derived: &str, base: &str) -> bool {
        if base == ROOT_TYPE_ID || derived == base {
            return true;
        }
        let mut next = self.by_id.get(derived).and_then(|d| d.base.as_deref());
        let mut hops = 0;
        while let Some(id) = next {
            if id == base {
                return true;
            }
            hops += 1;
            if hops > MAX_CHAIN_LEN {
                return false;
            }
            next = self.by_id.get(id).and_then(|d| d.base.as_deref());
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TypeRegistry {
        let mut types = TypeRegistry::new();
        types.register(
            TypeDescriptor::class("::Demo::Base")
                .member("id", MemberType::Int)
                .optional(9, "late", MemberType::String)
                .optional(2, "early", MemberType::Long),
        );
        types.register(
            TypeDescriptor::class("::Demo::Derived")
                .with_base("::Demo::Base")
                .with_compact_id(7),
        );
        types
    }

    #[test]
    fn optional_members_sorted_by_tag() {
        let types = registry();
        let base = types.get("::Demo::Base").expect("已注册");
        let tags: Vec<_> = base
            .optional_members()
            .iter()
            .filter_map(|m| m.tag)
            .collect();
        assert_eq!(tags, vec![2, 9]);
    }

    #[test]
    fn chain_walks_to_root() {
        let types = registry();
        let chain = types.chain("::Demo::Derived").expect("链完整");
        let ids: Vec<_> = chain.iter().map(|d| d.type_id()).collect();
        assert_eq!(ids, vec!["::Demo::Derived", "::Demo::Base"]);
        assert!(types.is_a("::Demo::Derived", "::Demo::Base"));
        assert!(!types.is_a("::Demo::Base", "::Demo::Derived"));
        assert_eq!(types.resolve_compact_id(7), Some("::Demo::Derived"));
        assert!(matches!(
            types.chain("::Demo::Missing"),
            Err(WireError::MissingDescriptor(_))
        ));
    }

    #[test]
    fn optional_formats_follow_member_type() {
        assert_eq!(MemberType::Int.optional_format(), OptionalFormat::F4);
        assert_eq!(MemberType::String.optional_format(), OptionalFormat::VSize);
        assert_eq!(
            MemberType::Sequence(Box::new(MemberType::Int)).optional_format(),
            OptionalFormat::VSize
        );
        assert_eq!(
            MemberType::Sequence(Box::new(MemberType::String)).optional_format(),
            OptionalFormat::FSize
        );
        assert_eq!(
            MemberType::Enum { max: 3 }.optional_format(),
            OptionalFormat::Size
        );
    }
}
