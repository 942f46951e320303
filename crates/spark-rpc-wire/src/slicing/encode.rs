//! 实例、异常与成员值的编码。

use super::{
    FLAG_HAS_INDIRECTION_TABLE, FLAG_HAS_OPTIONAL_MEMBERS, FLAG_HAS_SLICE_SIZE,
    FLAG_HAS_TYPE_ID_COMPACT, FLAG_HAS_TYPE_ID_INDEX, FLAG_HAS_TYPE_ID_STRING,
    FLAG_IS_LAST_SLICE, SliceType,
};
use crate::{
    data::{Data, Instance, InstanceGraph, InstanceId, SliceFields, SlicedData},
    error::{WireError, WireResult},
    optional::{OPTIONAL_END_MARKER, OptionalFormat},
    output::OutputStream,
    types::{MemberType, TypeKind},
    version::{ENCODING_1_0, FormatType},
};
use std::collections::HashMap;

/// 每个封装独立的实例编码状态。
#[derive(Debug)]
pub(crate) struct EncodeState {
    value_id_index: i32,
    marshaled: HashMap<InstanceId, i32>,
    type_ids: HashMap<String, i32>,
    type_id_index: i32,
    stack: Vec<InstanceFrame>,
}

impl EncodeState {
    fn new() -> Self {
        Self {
            value_id_index: 1,
            marshaled: HashMap::new(),
            type_ids: HashMap::new(),
            type_id_index: 0,
            stack: Vec::new(),
        }
    }

    /// 已登记返回其索引；首次出现则登记并返回 `None`，调用方需写出字符串。
    fn register_type_id(&mut self, type_id: &str) -> Option<i32> {
        if let Some(idx) = self.type_ids.get(type_id) {
            return Some(*idx);
        }
        self.type_id_index += 1;
        self.type_ids.insert(type_id.to_owned(), self.type_id_index);
        None
    }
}

/// 正在写出的一个实例或异常。
#[derive(Debug)]
struct InstanceFrame {
    slice_type: SliceType,
    first_slice: bool,
    flags: u8,
    flags_pos: usize,
    write_slice: usize,
    indirection_table: Vec<InstanceId>,
    indirection_map: HashMap<InstanceId, usize>,
}

impl InstanceFrame {
    fn new(slice_type: SliceType) -> Self {
        Self {
            slice_type,
            first_slice: true,
            flags: 0,
            flags_pos: 0,
            write_slice: 0,
            indirection_table: Vec::new(),
            indirection_map: HashMap::new(),
        }
    }
}

impl OutputStream {
    fn values_mut(&mut self) -> &mut EncodeState {
        self.frame_mut()
            .values
            .get_or_insert_with(|| Box::new(EncodeState::new()))
    }

    fn current_instance(&mut self) -> WireResult<&mut InstanceFrame> {
        self.values_mut()
            .stack
            .last_mut()
            .ok_or(WireError::InvalidState("当前没有正在写出的切片"))
    }

    fn require_class_encoding(&self) -> WireResult<()> {
        if self.encoding() == ENCODING_1_0 {
            return Err(WireError::UnsupportedEncoding(ENCODING_1_0));
        }
        Ok(())
    }

    pub(crate) fn mark_slice_has_optionals(&mut self) {
        if let Some(state) = self.frame_mut().values.as_mut()
            && let Some(frame) = state.stack.last_mut()
        {
            frame.flags |= FLAG_HAS_OPTIONAL_MEMBERS;
        }
    }

    /// 写出实例引用：空引用、切片内的间接表下标、已写过实例的编号或内联实例。
    pub fn write_value(&mut self, graph: &InstanceGraph, id: Option<InstanceId>) -> WireResult<()> {
        self.require_class_encoding()?;
        let Some(id) = id else {
            self.write_size(0);
            return Ok(());
        };
        let sliced = self.format() == FormatType::Sliced;
        if sliced && let Some(frame) = self.values_mut().stack.last_mut() {
            let idx = match frame.indirection_map.get(&id) {
                Some(idx) => *idx,
                None => {
                    frame.indirection_table.push(id);
                    let idx = frame.indirection_table.len();
                    frame.indirection_map.insert(id, idx);
                    idx
                }
            };
            self.write_size(idx);
            return Ok(());
        }
        self.write_instance(graph, id)
    }

    fn write_instance(&mut self, graph: &InstanceGraph, id: InstanceId) -> WireResult<()> {
        if let Some(idx) = self.values_mut().marshaled.get(&id).copied() {
            self.write_size(idx as usize);
            return Ok(());
        }
        let state = self.values_mut();
        state.value_id_index += 1;
        let idx = state.value_id_index;
        state.marshaled.insert(id, idx);
        let instance = graph
            .get(id)
            .ok_or(WireError::InvalidInstanceReference(idx))?;
        self.write_size(1);
        self.encode_instance(graph, instance)
    }

    fn encode_instance(&mut self, graph: &InstanceGraph, instance: &Instance) -> WireResult<()> {
        let sliced = self.format() == FormatType::Sliced;
        let preserved = instance.sliced_data().filter(|_| sliced);
        if instance.slices().is_empty() && preserved.is_none() {
            return Err(WireError::InvalidState(
                "没有已知切片的实例只能以切片格式写出",
            ));
        }
        self.values_mut()
            .stack
            .push(InstanceFrame::new(SliceType::Value));
        if let Some(preserved) = preserved {
            self.write_sliced_data(graph, preserved)?;
        }
        self.write_known_slices(graph, instance.slices())?;
        self.values_mut().stack.pop();
        Ok(())
    }

    fn write_known_slices(&mut self, graph: &InstanceGraph, slices: &[SliceFields]) -> WireResult<()> {
        let count = slices.len();
        for (idx, fields) in slices.iter().enumerate() {
            let descriptor = fields.descriptor();
            self.start_slice(
                descriptor.type_id(),
                descriptor.compact_id(),
                idx + 1 == count,
            )?;
            self.write_slice_members(graph, fields)?;
            self.end_slice(graph)?;
        }
        Ok(())
    }

    fn write_sliced_data(&mut self, graph: &InstanceGraph, sliced: &SlicedData) -> WireResult<()> {
        for info in &sliced.slices {
            self.start_slice(&info.type_id, info.compact_id, info.is_last_slice)?;
            self.write_raw(&info.bytes);
            let frame = self.current_instance()?;
            if info.has_optional_members {
                frame.flags |= FLAG_HAS_OPTIONAL_MEMBERS;
            }
            for instance in &info.instances {
                let id = instance.ok_or(WireError::InvalidInstanceReference(0))?;
                frame.indirection_table.push(id);
                let idx = frame.indirection_table.len();
                frame.indirection_map.insert(id, idx);
            }
            self.end_slice(graph)?;
        }
        Ok(())
    }

    fn start_slice(&mut self, type_id: &str, compact_id: Option<i32>, last: bool) -> WireResult<()> {
        let sliced = self.format() == FormatType::Sliced;
        let (slice_type, first_slice) = {
            let frame = self.current_instance()?;
            (frame.slice_type, frame.first_slice)
        };
        let flags_pos = self.len();
        self.write_u8(0);

        let mut flags = 0u8;
        if sliced {
            flags |= FLAG_HAS_SLICE_SIZE;
        }
        if last {
            flags |= FLAG_IS_LAST_SLICE;
        }
        match slice_type {
            SliceType::Value if sliced || first_slice => {
                if let Some(compact) = compact_id {
                    flags |= FLAG_HAS_TYPE_ID_COMPACT;
                    self.write_size(compact.max(0) as usize);
                } else if let Some(idx) = self.values_mut().register_type_id(type_id) {
                    flags |= FLAG_HAS_TYPE_ID_INDEX;
                    self.write_size(idx as usize);
                } else {
                    flags |= FLAG_HAS_TYPE_ID_STRING;
                    self.write_string(type_id);
                }
            }
            SliceType::Value => {}
            SliceType::Exception => self.write_string(type_id),
        }
        if flags & FLAG_HAS_SLICE_SIZE != 0 {
            self.write_i32(0);
        }
        let write_slice = self.len();
        let frame = self.current_instance()?;
        frame.flags = flags;
        frame.flags_pos = flags_pos;
        frame.write_slice = write_slice;
        frame.first_slice = false;
        Ok(())
    }

    fn end_slice(&mut self, graph: &InstanceGraph) -> WireResult<()> {
        let (mut flags, flags_pos, write_slice, table) = {
            let frame = self.current_instance()?;
            frame.indirection_map.clear();
            (
                frame.flags,
                frame.flags_pos,
                frame.write_slice,
                std::mem::take(&mut frame.indirection_table),
            )
        };
        if flags & FLAG_HAS_OPTIONAL_MEMBERS != 0 {
            self.write_u8(OPTIONAL_END_MARKER);
        }
        if flags & FLAG_HAS_SLICE_SIZE != 0 {
            let size = self.len() - write_slice + 4;
            self.rewrite_i32(i32::try_from(size).unwrap_or(i32::MAX), write_slice - 4)?;
        }
        if !table.is_empty() {
            flags |= FLAG_HAS_INDIRECTION_TABLE;
            self.write_size(table.len());
            for id in table {
                self.write_instance(graph, id)?;
            }
        }
        self.buf[flags_pos] = flags;
        Ok(())
    }

    fn write_slice_members(&mut self, graph: &InstanceGraph, fields: &SliceFields) -> WireResult<()> {
        let descriptor = fields.descriptor();
        for (member, value) in descriptor.members().iter().zip(fields.members()) {
            self.write_data(graph, &member.ty, value)?;
        }
        for (member, value) in descriptor
            .optional_members()
            .iter()
            .zip(fields.optional_members())
        {
            if let Some(value) = value {
                self.write_optional_data(graph, member.tag.unwrap_or_default(), &member.ty, value)?;
            }
        }
        Ok(())
    }

    /// 写出用户异常（所有切片均带字符串类型标识）。
    pub fn write_exception(&mut self, graph: &InstanceGraph, exception: &Instance) -> WireResult<()> {
        self.require_class_encoding()?;
        if exception.kind() != TypeKind::Exception {
            return Err(WireError::TypeMismatch {
                expected: "exception".into(),
                found: exception.type_id().to_owned(),
            });
        }
        self.values_mut()
            .stack
            .push(InstanceFrame::new(SliceType::Exception));
        if self.format() == FormatType::Sliced
            && let Some(preserved) = exception.sliced_data()
        {
            self.write_sliced_data(graph, preserved)?;
        }
        self.write_known_slices(graph, exception.slices())?;
        self.values_mut().stack.pop();
        Ok(())
    }

    /// 按成员类型写出一个值。
    pub fn write_data(&mut self, graph: &InstanceGraph, ty: &MemberType, data: &Data) -> WireResult<()> {
        match (ty, data) {
            (MemberType::Bool, Data::Bool(v)) => self.write_bool(*v),
            (MemberType::Byte, Data::Byte(v)) => self.write_u8(*v),
            (MemberType::Short, Data::Short(v)) => self.write_i16(*v),
            (MemberType::Int, Data::Int(v)) => self.write_i32(*v),
            (MemberType::Long, Data::Long(v)) => self.write_i64(*v),
            (MemberType::Float, Data::Float(v)) => self.write_f32(*v),
            (MemberType::Double, Data::Double(v)) => self.write_f64(*v),
            (MemberType::String, Data::String(v)) => self.write_string(v),
            (MemberType::Enum { max }, Data::Enum(v)) => self.write_enum(*v, *max)?,
            (MemberType::Sequence(elem), Data::Sequence(items)) => {
                self.write_size(items.len());
                for item in items {
                    self.write_data(graph, elem, item)?;
                }
            }
            (MemberType::Dictionary(key_ty, value_ty), Data::Dictionary(entries)) => {
                self.write_size(entries.len());
                for (key, value) in entries {
                    self.write_data(graph, key_ty, key)?;
                    self.write_data(graph, value_ty, value)?;
                }
            }
            (MemberType::Struct(desc), Data::Struct(fields))
                if fields.len() == desc.fields.len() =>
            {
                for ((_, field_ty), field) in desc.fields.iter().zip(fields) {
                    self.write_data(graph, field_ty, field)?;
                }
            }
            (MemberType::Class(_), Data::Instance(id)) => self.write_value(graph, *id)?,
            _ => {
                return Err(WireError::TypeMismatch {
                    expected: ty.name(),
                    found: data.kind_name().into(),
                });
            }
        }
        Ok(())
    }

    /// 写出一个可选成员（头部 + 按格式码包装的负载）；编码 1.0 下静默跳过。
    pub fn write_optional_data(
        &mut self,
        graph: &InstanceGraph,
        tag: i32,
        ty: &MemberType,
        data: &Data,
    ) -> WireResult<()> {
        let format = ty.optional_format();
        if !self.write_optional(tag, format)? {
            return Ok(());
        }
        match format {
            OptionalFormat::VSize => {
                if let Some(size) = vsize_prefix(ty, data) {
                    self.write_size(size);
                }
                self.write_data(graph, ty, data)
            }
            OptionalFormat::FSize => {
                let pos = self.start_size();
                self.write_data(graph, ty, data)?;
                self.end_size(pos)
            }
            _ => self.write_data(graph, ty, data),
        }
    }
}

/// `VSize` 负载前需要额外写出的字节数；字符串与单字节元素序列自身的长度已足够。
pub(crate) fn vsize_prefix(ty: &MemberType, data: &Data) -> Option<usize> {
    let packed = |count: usize, elem: usize| {
        if count == 0 {
            1
        } else {
            count * elem + if count > 254 { 5 } else { 1 }
        }
    };
    match (ty, data) {
        (MemberType::Sequence(elem), Data::Sequence(items)) if elem.min_wire_size() > 1 => {
            Some(packed(items.len(), elem.min_wire_size()))
        }
        (MemberType::Dictionary(k, v), Data::Dictionary(entries)) => {
            Some(packed(entries.len(), k.min_wire_size() + v.min_wire_size()))
        }
        (MemberType::Struct(_), _) => Some(ty.min_wire_size()),
        _ => None,
    }
}

/// 判断 `VSize` 负载在解码时是否带有额外长度前缀。
pub(crate) fn vsize_has_prefix(ty: &MemberType) -> bool {
    match ty {
        MemberType::Sequence(elem) => elem.min_wire_size() > 1,
        MemberType::Dictionary(..) | MemberType::Struct(_) => true,
        _ => false,
    }
}
