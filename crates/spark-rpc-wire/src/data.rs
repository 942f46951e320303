//! 动态数据模型：成员值、类/异常实例与实例图。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 类实例之间可以互相引用甚至成环，若用指针表示会在“构造完成前回填”时与所有权冲突；
//!   因此实例统一存放在 [`InstanceGraph`] 这个竞技场里，成员只保存 [`InstanceId`]。
//! - 成员值 [`Data`] 是按 [`MemberType`](crate::MemberType) 驱动的动态表示，宿主绑定层可在其上
//!   构建强类型视图。
//!
//! ## 契约（What）
//! - `Instance.slices` 与描述符链一一对应，最派生切片在前；
//! - 解码时无法识别的切片以原始字节保存在 [`SlicedData`] 中，重新编码时原样写回；
//! - `InstanceId` 只在所属的 `InstanceGraph` 内有意义。

use crate::{
    error::{WireError, WireResult},
    types::{MemberType, TypeDescriptor, TypeKind, TypeRegistry},
};
use std::sync::Arc;

/// 实例在图中的编号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub(crate) usize);

impl InstanceId {
    /// 编号的数值形式。
    pub fn index(self) -> usize {
        self.0
    }
}

/// 成员值。
#[derive(Clone, Debug, PartialEq)]
pub enum Data {
    /// 布尔值。
    Bool(bool),
    /// 字节。
    Byte(u8),
    /// 16 位整数。
    Short(i16),
    /// 32 位整数。
    Int(i32),
    /// 64 位整数。
    Long(i64),
    /// 单精度浮点。
    Float(f32),
    /// 双精度浮点。
    Double(f64),
    /// 字符串。
    String(String),
    /// 枚举值。
    Enum(i32),
    /// 序列。
    Sequence(Vec<Data>),
    /// 字典，保持线上的条目顺序。
    Dictionary(Vec<(Data, Data)>),
    /// 结构体字段（声明顺序）。
    Struct(Vec<Data>),
    /// 类实例引用，`None` 表示空引用。
    Instance(Option<InstanceId>),
}

impl Data {
    /// 用于诊断信息的值种类名。
    pub fn kind_name(&self) -> &'static str {
        match self {
            Data::Bool(_) => "bool",
            Data::Byte(_) => "byte",
            Data::Short(_) => "short",
            Data::Int(_) => "int",
            Data::Long(_) => "long",
            Data::Float(_) => "float",
            Data::Double(_) => "double",
            Data::String(_) => "string",
            Data::Enum(_) => "enum",
            Data::Sequence(_) => "sequence",
            Data::Dictionary(_) => "dictionary",
            Data::Struct(_) => "struct",
            Data::Instance(_) => "instance",
        }
    }

    /// 值的形状是否符合 `ty`（递归检查容器）。
    pub fn conforms_to(&self, ty: &MemberType) -> bool {
        match (self, ty) {
            (Data::Bool(_), MemberType::Bool)
            | (Data::Byte(_), MemberType::Byte)
            | (Data::Short(_), MemberType::Short)
            | (Data::Int(_), MemberType::Int)
            | (Data::Long(_), MemberType::Long)
            | (Data::Float(_), MemberType::Float)
            | (Data::Double(_), MemberType::Double)
            | (Data::String(_), MemberType::String)
            | (Data::Instance(_), MemberType::Class(_)) => true,
            (Data::Enum(v), MemberType::Enum { max }) => *v >= 0 && v <= max,
            (Data::Sequence(items), MemberType::Sequence(elem)) => {
                items.iter().all(|item| item.conforms_to(elem))
            }
            (Data::Dictionary(entries), MemberType::Dictionary(k, v)) => entries
                .iter()
                .all(|(key, value)| key.conforms_to(k) && value.conforms_to(v)),
            (Data::Struct(fields), MemberType::Struct(desc)) => {
                fields.len() == desc.fields.len()
                    && fields
                        .iter()
                        .zip(desc.fields.iter())
                        .all(|(field, (_, ty))| field.conforms_to(ty))
            }
            _ => false,
        }
    }

    /// 沿容器内部路径定位子值：序列/结构体按下标，字典按条目下标定位到“值”。
    pub(crate) fn at_path_mut(&mut self, path: &[usize]) -> Option<&mut Data> {
        let Some((&head, rest)) = path.split_first() else {
            return Some(self);
        };
        let child = match self {
            Data::Sequence(items) | Data::Struct(items) => items.get_mut(head)?,
            Data::Dictionary(entries) => &mut entries.get_mut(head)?.1,
            _ => return None,
        };
        child.at_path_mut(rest)
    }
}

/// 一个已知切片的成员值。
#[derive(Clone, Debug, PartialEq)]
pub struct SliceFields {
    descriptor: Arc<TypeDescriptor>,
    pub(crate) members: Vec<Data>,
    pub(crate) optional: Vec<Option<Data>>,
}

impl SliceFields {
    fn from_descriptor(descriptor: Arc<TypeDescriptor>) -> Self {
        let members = descriptor
            .members()
            .iter()
            .map(|m| m.ty.default_data())
            .collect();
        let optional = vec![None; descriptor.optional_members().len()];
        Self {
            descriptor,
            members,
            optional,
        }
    }

    /// 本切片的描述符。
    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    /// 必选成员值（声明顺序）。
    pub fn members(&self) -> &[Data] {
        &self.members
    }

    /// 可选成员值（tag 升序），缺席为 `None`。
    pub fn optional_members(&self) -> &[Option<Data>] {
        &self.optional
    }
}

/// 解码时保留下来的一个未知切片。
#[derive(Clone, Debug, PartialEq)]
pub struct SliceInfo {
    /// 切片的类型标识（紧凑格式下可能为空）。
    pub type_id: String,
    /// 切片的紧凑编号。
    pub compact_id: Option<i32>,
    /// 切片成员的原始字节，不含头部、长度与可选结束标记。
    pub bytes: Vec<u8>,
    /// 切片间接表中引用的实例。
    pub instances: Vec<Option<InstanceId>>,
    /// 原始切片是否携带可选成员。
    pub has_optional_members: bool,
    /// 原始切片是否为最后一个切片。
    pub is_last_slice: bool,
}

/// 一个实例的全部未知切片（最派生在前）。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SlicedData {
    /// 保留的切片。
    pub slices: Vec<SliceInfo>,
}

/// 类或异常实例。
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    type_id: String,
    kind: TypeKind,
    pub(crate) slices: Vec<SliceFields>,
    pub(crate) sliced_data: Option<SlicedData>,
}

impl Instance {
    /// 按描述符链创建所有成员为默认值的实例。
    pub fn new(types: &TypeRegistry, type_id: &str) -> WireResult<Self> {
        let chain = types.chain(type_id)?;
        let kind = chain
            .first()
            .map(|d| d.kind())
            .ok_or_else(|| WireError::MissingDescriptor(type_id.to_owned()))?;
        Ok(Self {
            type_id: type_id.to_owned(),
            kind,
            slices: chain.into_iter().map(SliceFields::from_descriptor).collect(),
            sliced_data: None,
        })
    }

    /// 创建没有任何已知切片的实例，所有内容都依赖 [`SlicedData`] 保存。
    pub fn opaque(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            kind: TypeKind::Class,
            slices: Vec::new(),
            sliced_data: None,
        }
    }

    /// 最派生的已知类型标识。
    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    /// 实例种类。
    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    /// 已知切片（最派生在前）。
    pub fn slices(&self) -> &[SliceFields] {
        &self.slices
    }

    /// 保留的未知切片。
    pub fn sliced_data(&self) -> Option<&SlicedData> {
        self.sliced_data.as_ref()
    }

    /// 替换保留的未知切片。
    pub fn set_sliced_data(&mut self, data: Option<SlicedData>) {
        self.sliced_data = data;
    }

    /// 读取成员：必选成员直接返回；可选成员缺席时返回 `None`。
    pub fn get(&self, name: &str) -> Option<&Data> {
        for slice in &self.slices {
            if let Some(pos) = slice.descriptor.members().iter().position(|m| m.name == name) {
                return slice.members.get(pos);
            }
            if let Some(pos) = slice
                .descriptor
                .optional_members()
                .iter()
                .position(|m| m.name == name)
            {
                return slice.optional.get(pos).and_then(Option::as_ref);
            }
        }
        None
    }

    /// 写入成员（可选成员被置为“存在”）。
    pub fn set(&mut self, name: &str, value: Data) -> WireResult<()> {
        self.assign(name, Some(value))
    }

    /// 将可选成员置为缺席；对必选成员调用会返回类型不匹配。
    pub fn clear(&mut self, name: &str) -> WireResult<()> {
        self.assign(name, None)
    }

    fn assign(&mut self, name: &str, value: Option<Data>) -> WireResult<()> {
        for slice in &mut self.slices {
            if let Some(pos) = slice.descriptor.members().iter().position(|m| m.name == name) {
                let ty = &slice.descriptor.members()[pos].ty;
                let value = value.ok_or_else(|| WireError::TypeMismatch {
                    expected: ty.name(),
                    found: "absent".into(),
                })?;
                check_conforms(&value, ty)?;
                slice.members[pos] = value;
                return Ok(());
            }
            if let Some(pos) = slice
                .descriptor
                .optional_members()
                .iter()
                .position(|m| m.name == name)
            {
                if let Some(value) = &value {
                    check_conforms(value, &slice.descriptor.optional_members()[pos].ty)?;
                }
                slice.optional[pos] = value;
                return Ok(());
            }
        }
        Err(WireError::MissingDescriptor(format!(
            "{}::{name}",
            self.type_id
        )))
    }
}

fn check_conforms(value: &Data, ty: &MemberType) -> WireResult<()> {
    if value.conforms_to(ty) {
        Ok(())
    } else {
        Err(WireError::TypeMismatch {
            expected: ty.name(),
            found: value.kind_name().into(),
        })
    }
}

/// 实例竞技场。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceGraph {
    slots: Vec<Option<Instance>>,
}

impl InstanceGraph {
    /// 创建空图。
    pub fn new() -> Self {
        Self::default()
    }

    /// 放入实例并返回编号。
    pub fn insert(&mut self, instance: Instance) -> InstanceId {
        self.slots.push(Some(instance));
        InstanceId(self.slots.len() - 1)
    }

    /// 读取实例；占位中的编号返回 `None`。
    pub fn get(&self, id: InstanceId) -> Option<&Instance> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    /// 可变地读取实例。
    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut Instance> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    /// 图中的槽位数（含占位）。
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// 图是否为空。
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 遍历所有已填充的实例。
    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, &Instance)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|inst| (InstanceId(idx), inst)))
    }

    /// 首次提及实例时分配占位。
    pub(crate) fn reserve(&mut self) -> InstanceId {
        self.slots.push(None);
        InstanceId(self.slots.len() - 1)
    }

    /// 用工厂产出的实例填充占位。
    pub(crate) fn fill(&mut self, id: InstanceId, instance: Instance) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            *slot = Some(instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeDescriptor;

    #[test]
    fn set_rejects_shape_mismatch() {
        let mut types = TypeRegistry::new();
        types.register(
            TypeDescriptor::class("::Demo::Point")
                .member("x", MemberType::Int)
                .optional(1, "label", MemberType::String),
        );
        let mut point = Instance::new(&types, "::Demo::Point").expect("描述符存在");
        point.set("x", Data::Int(3)).expect("类型一致");
        assert_eq!(point.get("x"), Some(&Data::Int(3)));
        assert!(point.get("label").is_none());
        assert!(matches!(
            point.set("x", Data::String("3".into())),
            Err(WireError::TypeMismatch { .. })
        ));
        point
            .set("label", Data::String("origin".into()))
            .expect("可选成员可写");
        point.clear("label").expect("可选成员可清空");
        assert!(point.clear("x").is_err());
    }

    #[test]
    fn path_navigation_reaches_nested_values() {
        let mut data = Data::Sequence(vec![
            Data::Struct(vec![Data::Int(1), Data::Instance(None)]),
            Data::Dictionary(vec![(Data::Int(0), Data::Instance(None))]),
        ]);
        *data.at_path_mut(&[0, 1]).expect("路径存在") = Data::Instance(Some(InstanceId(4)));
        *data.at_path_mut(&[1, 0]).expect("字典值路径存在") = Data::Instance(Some(InstanceId(5)));
        assert!(data.at_path_mut(&[3]).is_none());
        assert_eq!(
            data,
            Data::Sequence(vec![
                Data::Struct(vec![Data::Int(1), Data::Instance(Some(InstanceId(4)))]),
                Data::Dictionary(vec![(Data::Int(0), Data::Instance(Some(InstanceId(5))))]),
            ])
        );
    }
}
