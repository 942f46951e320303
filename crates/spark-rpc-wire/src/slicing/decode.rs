//! 实例、异常与成员值的解码。
//!
//! 首次提及的实例立即在竞技场中占位；引用未完成实例的成员登记补丁，目标实例到达结束标记时
//! 补丁被“点火”，真正的写回推迟到最外层实例结束时统一完成。

use super::{
    FLAG_HAS_INDIRECTION_TABLE, FLAG_HAS_OPTIONAL_MEMBERS, FLAG_HAS_SLICE_SIZE,
    FLAG_HAS_TYPE_ID_COMPACT, FLAG_HAS_TYPE_ID_INDEX, FLAG_HAS_TYPE_ID_STRING,
    FLAG_IS_LAST_SLICE, SliceType, encode::vsize_has_prefix,
};
use crate::{
    context::WireContext,
    data::{Data, Instance, InstanceId, SliceInfo, SlicedData},
    error::{WireError, WireResult},
    input::InputStream,
    optional::OptionalFormat,
    types::{MemberType, TypeDescriptor, TypeKind},
    version::ENCODING_1_0,
};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

/// 补丁写回的目标实例。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Owner {
    Instance(InstanceId),
    Exception,
}

/// 补丁写回的目标槽位。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Slot {
    Member { slice: usize, index: usize },
    Optional { slice: usize, index: usize },
    Preserved { slice: usize, index: usize },
}

/// 一个待写回的实例引用位置。
#[derive(Clone, Debug)]
pub(crate) struct PatchSite {
    owner: Owner,
    slot: Slot,
    /// 成员值内部的容器路径。
    inner: Vec<usize>,
    /// 成员声明的静态类型。
    expected: Option<String>,
}

impl PatchSite {
    fn new(owner: Owner, slot: Slot) -> Self {
        Self {
            owner,
            slot,
            inner: Vec::new(),
            expected: None,
        }
    }
}

pub(crate) type PatchHook = Box<dyn FnOnce(Option<InstanceId>) + Send>;

/// 目标实例完成时要执行的动作。
pub(crate) enum Patch {
    Site(PatchSite),
    Hook(PatchHook),
    Discard,
}

impl fmt::Debug for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Patch::Site(site) => f.debug_tuple("Site").field(site).finish(),
            Patch::Hook(_) => f.write_str("Hook"),
            Patch::Discard => f.write_str("Discard"),
        }
    }
}

#[cfg(test)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PatchEvent {
    Completed(InstanceId),
    Patched(InstanceId),
}

/// 成员值中实例引用的去向。
#[derive(Clone, Debug)]
enum Dest {
    /// 顶层读取：引用必须在返回前解析完毕。
    Top,
    Site(PatchSite),
    Discard,
}

impl Dest {
    fn child(&self, index: usize, ty: &MemberType) -> Dest {
        match self {
            Dest::Top => Dest::Top,
            Dest::Site(site) if ty.contains_class() => {
                let mut site = site.clone();
                site.inner.push(index);
                Dest::Site(site)
            }
            _ => Dest::Discard,
        }
    }

    fn detached(&self) -> Dest {
        match self {
            Dest::Top => Dest::Top,
            _ => Dest::Discard,
        }
    }
}

/// 被跳过并保留的切片，`table` 为其间接表中的线上编号。
#[derive(Debug)]
struct SkippedSlice {
    info: SliceInfo,
    table: Vec<i32>,
}

/// 正在解码的一个实例或异常。
#[derive(Debug)]
struct InstanceFrame {
    slice_type: SliceType,
    owner: Owner,
    flags: u8,
    type_id: String,
    compact_id: Option<i32>,
    slice_size: usize,
    indirect_patches: Vec<(usize, Patch)>,
    skipped: Vec<SkippedSlice>,
}

impl InstanceFrame {
    fn new(slice_type: SliceType, owner: Owner) -> Self {
        Self {
            slice_type,
            owner,
            flags: 0,
            type_id: String::new(),
            compact_id: None,
            slice_size: 0,
            indirect_patches: Vec::new(),
            skipped: Vec::new(),
        }
    }

    fn label(&self) -> String {
        match (self.type_id.is_empty(), self.compact_id) {
            (true, Some(compact)) => format!("#{compact}"),
            _ => self.type_id.clone(),
        }
    }
}

/// 每个封装独立的实例解码状态。
#[derive(Debug)]
pub(crate) struct DecodeState {
    value_id_index: i32,
    ids: HashMap<i32, InstanceId>,
    completed: HashSet<i32>,
    patch_map: HashMap<i32, Vec<Patch>>,
    type_ids: Vec<String>,
    stack: Vec<InstanceFrame>,
    deferred: Vec<(PatchSite, InstanceId)>,
    exception: Option<Instance>,
    #[cfg(test)]
    pub(crate) events: Vec<PatchEvent>,
}

impl DecodeState {
    fn new() -> Self {
        Self {
            value_id_index: 1,
            ids: HashMap::new(),
            completed: HashSet::new(),
            patch_map: HashMap::new(),
            type_ids: Vec::new(),
            stack: Vec::new(),
            deferred: Vec::new(),
            exception: None,
            #[cfg(test)]
            events: Vec::new(),
        }
    }

    fn fire(&mut self, patch: Patch, id: InstanceId) {
        match patch {
            Patch::Site(site) => self.deferred.push((site, id)),
            Patch::Hook(hook) => hook(Some(id)),
            Patch::Discard => return,
        }
        #[cfg(test)]
        self.events.push(PatchEvent::Patched(id));
    }
}

impl InputStream<'_> {
    fn values_mut(&mut self) -> &mut DecodeState {
        self.frame_mut()
            .values
            .get_or_insert_with(|| Box::new(DecodeState::new()))
    }

    fn current(&mut self) -> WireResult<&mut InstanceFrame> {
        self.values_mut()
            .stack
            .last_mut()
            .ok_or(WireError::InvalidState("当前没有正在解码的切片"))
    }

    fn require_context(&self) -> WireResult<Arc<WireContext>> {
        self.context
            .clone()
            .ok_or(WireError::InvalidState("解码类实例需要类型上下文"))
    }

    fn require_class_encoding(&self) -> WireResult<()> {
        if self.encoding() == ENCODING_1_0 {
            return Err(WireError::UnsupportedEncoding(ENCODING_1_0));
        }
        Ok(())
    }

    /// 当前切片是否声明了可选成员；不在切片内时总是允许。
    pub(crate) fn slice_allows_optionals(&self) -> bool {
        self.frame()
            .values
            .as_ref()
            .and_then(|state| state.stack.last())
            .is_none_or(|frame| frame.flags & FLAG_HAS_OPTIONAL_MEMBERS != 0)
    }

    /// 跳过一个实例引用（可选类成员）。
    pub(crate) fn skip_instance_ref(&mut self) -> WireResult<()> {
        self.read_reference(Patch::Discard)
    }

    /// 读取顶层实例引用，返回时实例已完全解码。
    ///
    /// 只能在实例之外调用；实例内部的成员由描述符驱动读取。
    pub fn read_value(&mut self) -> WireResult<Option<InstanceId>> {
        self.require_class_encoding()?;
        let index = self.read_ref_index()?;
        if index == 0 {
            return Ok(None);
        }
        let wire = self.read_instance(index, None)?;
        let state = self.values_mut();
        match state.ids.get(&wire) {
            Some(id) if state.completed.contains(&wire) => Ok(Some(*id)),
            _ => Err(WireError::InvalidInstanceReference(wire)),
        }
    }

    /// 读取实例引用，并在目标实例完成时调用 `hook`；空引用立即以 `None` 调用。
    pub fn read_value_with<F>(&mut self, hook: F) -> WireResult<()>
    where
        F: FnOnce(Option<InstanceId>) + Send + 'static,
    {
        self.require_class_encoding()?;
        self.read_reference(Patch::Hook(Box::new(hook)))
    }

    /// 读取顶层实例引用并检查其类型是否兼容 `expected`。
    pub fn read_value_of(&mut self, expected: &str) -> WireResult<Option<InstanceId>> {
        let id = self.read_value()?;
        if let Some(id) = id {
            self.check_type(id, expected)?;
        }
        Ok(id)
    }

    fn check_type(&self, id: InstanceId, expected: &str) -> WireResult<()> {
        let ctx = self.require_context()?;
        let found = self
            .graph
            .get(id)
            .map(Instance::type_id)
            .ok_or(WireError::InvalidState("实例尚未完成"))?;
        if ctx.types().is_a(found, expected) {
            Ok(())
        } else {
            Err(WireError::TypeMismatch {
                expected: expected.to_owned(),
                found: found.to_owned(),
            })
        }
    }

    /// 读取用户异常。
    ///
    /// 逐个切片查找已注册的异常描述符，不认识的切片被跳过；全部不认识时返回
    /// [`WireError::UnknownUserException`]。
    pub fn read_exception(&mut self) -> WireResult<Instance> {
        self.require_class_encoding()?;
        let ctx = self.require_context()?;
        self.values_mut()
            .stack
            .push(InstanceFrame::new(SliceType::Exception, Owner::Exception));
        self.start_slice()?;
        let most_derived = self.current()?.type_id.clone();
        let exception = loop {
            let type_id = self.current()?.type_id.clone();
            if let Some(desc) = ctx.types().get(&type_id)
                && desc.kind() == TypeKind::Exception
            {
                break Instance::new(ctx.types(), &type_id)?;
            }
            self.skip_slice()?;
            if self.current()?.flags & FLAG_IS_LAST_SLICE != 0 {
                self.values_mut().stack.pop();
                return Err(WireError::UnknownUserException {
                    type_id: most_derived,
                });
            }
            self.start_slice()?;
        };
        let known = descriptors_of(&exception);
        self.values_mut().exception = Some(exception);
        self.read_known_slices(Owner::Exception, &known)?;
        self.values_mut().stack.pop();
        if self.values_mut().stack.is_empty() {
            self.finish_graph(&ctx)?;
        }
        self.values_mut()
            .exception
            .take()
            .ok_or(WireError::InvalidState("异常实例丢失"))
    }

    /// 按成员类型读取一个顶层值。
    pub fn read_data(&mut self, ty: &MemberType) -> WireResult<Data> {
        self.read_member(ty, Dest::Top)
    }

    /// 读取一个顶层可选值；缺席时返回 `None`。
    pub fn read_optional_data(&mut self, tag: i32, ty: &MemberType) -> WireResult<Option<Data>> {
        if !self.read_optional(tag, ty.optional_format())? {
            return Ok(None);
        }
        self.read_optional_payload(ty, Dest::Top).map(Some)
    }

    fn read_ref_index(&mut self) -> WireResult<i32> {
        let index = self.read_size()?;
        i32::try_from(index).map_err(|_| WireError::InvalidInstanceReference(i32::MAX))
    }

    fn read_reference(&mut self, patch: Patch) -> WireResult<()> {
        let index = self.read_ref_index()?;
        if index == 0 {
            if let Patch::Hook(hook) = patch {
                hook(None);
            }
            return Ok(());
        }
        if let Some(frame) = self.values_mut().stack.last_mut()
            && frame.flags & FLAG_HAS_INDIRECTION_TABLE != 0
        {
            frame.indirect_patches.push(((index - 1) as usize, patch));
            return Ok(());
        }
        self.read_instance(index, Some(patch)).map(|_| ())
    }

    fn read_instance(&mut self, index: i32, patch: Option<Patch>) -> WireResult<i32> {
        if index < 1 {
            return Err(WireError::InvalidInstanceReference(index));
        }
        let wire = if index > 1 {
            index
        } else {
            self.decode_instance()?
        };
        if let Some(patch) = patch {
            self.add_patch(wire, patch);
        }
        Ok(wire)
    }

    fn add_patch(&mut self, wire: i32, patch: Patch) {
        let state = self.values_mut();
        match state.ids.get(&wire).copied() {
            Some(id) if state.completed.contains(&wire) => state.fire(patch, id),
            _ => state.patch_map.entry(wire).or_default().push(patch),
        }
    }

    fn decode_instance(&mut self) -> WireResult<i32> {
        self.require_class_encoding()?;
        let ctx = self.require_context()?;
        let depth_max = ctx.class_graph_depth_max();
        if self.values_mut().stack.len() >= depth_max {
            return Err(WireError::ClassGraphDepthExceeded(depth_max));
        }
        let id = self.graph.reserve();
        let state = self.values_mut();
        state.value_id_index += 1;
        let wire = state.value_id_index;
        state.ids.insert(wire, id);
        state
            .stack
            .push(InstanceFrame::new(SliceType::Value, Owner::Instance(id)));

        self.start_slice()?;
        let most_derived = self.current()?.label();
        let instance = loop {
            let (type_id, compact_id, label) = {
                let frame = self.current()?;
                (frame.type_id.clone(), frame.compact_id, frame.label())
            };
            let resolved = match compact_id {
                Some(compact) => ctx.types().resolve_compact_id(compact).map(str::to_owned),
                None => Some(type_id).filter(|id| !id.is_empty()),
            };
            if let Some(type_id) = resolved
                && let Some(instance) = ctx.factories().resolve(&type_id, ctx.types())
            {
                break instance;
            }
            if !ctx.slice_values() {
                return Err(WireError::NoFactory {
                    type_id: label,
                    reason: "未启用切片",
                });
            }
            self.skip_slice()?;
            if self.current()?.flags & FLAG_IS_LAST_SLICE != 0 {
                return Err(WireError::NoFactory {
                    type_id: most_derived,
                    reason: "切片链中没有可实例化的类型",
                });
            }
            self.start_slice()?;
        };

        let known = descriptors_of(&instance);
        self.graph.fill(id, instance);
        self.read_known_slices(Owner::Instance(id), &known)?;
        self.end_value(id)?;

        let state = self.values_mut();
        state.stack.pop();
        state.completed.insert(wire);
        #[cfg(test)]
        state.events.push(PatchEvent::Completed(id));
        if let Some(patches) = state.patch_map.remove(&wire) {
            for patch in patches {
                state.fire(patch, id);
            }
        }
        if state.stack.is_empty() {
            self.finish_graph(&ctx)?;
        }
        Ok(wire)
    }

    /// 依次读取已知切片（首个切片头已读），然后跳过剩余的线上切片。
    fn read_known_slices(&mut self, owner: Owner, known: &[Arc<TypeDescriptor>]) -> WireResult<()> {
        let mut header_ready = true;
        let mut reached_last = false;
        for (slice, descriptor) in known.iter().enumerate() {
            if !header_ready {
                if reached_last {
                    return Err(WireError::InvalidSlice("线上切片少于类型链"));
                }
                self.start_slice()?;
            }
            header_ready = false;
            reached_last = self.current()?.flags & FLAG_IS_LAST_SLICE != 0;
            self.read_slice_members(owner, slice, descriptor)?;
            self.end_slice()?;
        }
        while header_ready || !reached_last {
            if !header_ready {
                self.start_slice()?;
            }
            header_ready = false;
            reached_last = self.current()?.flags & FLAG_IS_LAST_SLICE != 0;
            self.skip_slice()?;
        }
        Ok(())
    }

    /// 把保留的切片挂到实例上，并为其间接表登记补丁。
    fn end_value(&mut self, id: InstanceId) -> WireResult<()> {
        let skipped = std::mem::take(&mut self.current()?.skipped);
        if skipped.is_empty() {
            return Ok(());
        }
        let mut sliced = SlicedData::default();
        let mut patches = Vec::new();
        for (slice, skipped) in skipped.into_iter().enumerate() {
            for (index, wire) in skipped.table.into_iter().enumerate() {
                let site = PatchSite::new(Owner::Instance(id), Slot::Preserved { slice, index });
                patches.push((wire, Patch::Site(site)));
            }
            sliced.slices.push(skipped.info);
        }
        if let Some(instance) = self.graph.get_mut(id) {
            instance.sliced_data = Some(sliced);
        }
        for (wire, patch) in patches {
            self.add_patch(wire, patch);
        }
        Ok(())
    }

    fn finish_graph(&mut self, ctx: &WireContext) -> WireResult<()> {
        let Self { frames, graph, .. } = self;
        let state = frames
            .last_mut()
            .and_then(|frame| frame.values.as_deref_mut())
            .ok_or(WireError::InvalidState("缺少解码状态"))?;
        if !state.patch_map.is_empty() {
            return Err(WireError::UnresolvedReferences(state.patch_map.len()));
        }
        for (site, target) in std::mem::take(&mut state.deferred) {
            if let Some(expected) = &site.expected {
                let found = graph
                    .get(target)
                    .map(Instance::type_id)
                    .ok_or(WireError::InvalidState("补丁目标尚未完成"))?;
                if !ctx.types().is_a(found, expected) {
                    return Err(WireError::TypeMismatch {
                        expected: expected.clone(),
                        found: found.to_owned(),
                    });
                }
            }
            let owner = match site.owner {
                Owner::Instance(id) => graph.get_mut(id),
                Owner::Exception => state.exception.as_mut(),
            }
            .ok_or(WireError::InvalidState("补丁宿主不存在"))?;
            let root = match site.slot {
                Slot::Member { slice, index } => owner
                    .slices
                    .get_mut(slice)
                    .and_then(|fields| fields.members.get_mut(index)),
                Slot::Optional { slice, index } => owner
                    .slices
                    .get_mut(slice)
                    .and_then(|fields| fields.optional.get_mut(index))
                    .and_then(Option::as_mut),
                Slot::Preserved { slice, index } => {
                    let cell = owner
                        .sliced_data
                        .as_mut()
                        .and_then(|sliced| sliced.slices.get_mut(slice))
                        .and_then(|info| info.instances.get_mut(index))
                        .ok_or(WireError::InvalidState("保留切片槽位不存在"))?;
                    *cell = Some(target);
                    continue;
                }
            };
            let cell = root
                .and_then(|data| data.at_path_mut(&site.inner))
                .ok_or(WireError::InvalidState("补丁路径不存在"))?;
            *cell = Data::Instance(Some(target));
        }
        Ok(())
    }

    fn start_slice(&mut self) -> WireResult<()> {
        let slice_type = self.current()?.slice_type;
        let flags = self.read_u8()?;
        let (type_id, compact_id) = match slice_type {
            SliceType::Exception => (self.read_string()?, None),
            SliceType::Value if flags & FLAG_HAS_TYPE_ID_COMPACT == FLAG_HAS_TYPE_ID_COMPACT => {
                let compact = self.read_ref_index()?;
                (String::new(), Some(compact))
            }
            SliceType::Value if flags & FLAG_HAS_TYPE_ID_INDEX != 0 => {
                let index = self.read_size()?;
                let type_id = index
                    .checked_sub(1)
                    .and_then(|idx| self.values_mut().type_ids.get(idx).cloned())
                    .ok_or(WireError::InvalidSlice("类型标识索引越界"))?;
                (type_id, None)
            }
            SliceType::Value if flags & FLAG_HAS_TYPE_ID_STRING != 0 => {
                let type_id = self.read_string()?;
                self.values_mut().type_ids.push(type_id.clone());
                (type_id, None)
            }
            SliceType::Value => (String::new(), None),
        };
        let slice_size = if flags & FLAG_HAS_SLICE_SIZE != 0 {
            let size = self.read_i32()?;
            if size < 4 {
                return Err(WireError::InvalidSlice("切片长度小于 4"));
            }
            size as usize
        } else {
            0
        };
        let frame = self.current()?;
        frame.flags = flags;
        frame.type_id = type_id;
        frame.compact_id = compact_id;
        frame.slice_size = slice_size;
        frame.indirect_patches.clear();
        Ok(())
    }

    fn end_slice(&mut self) -> WireResult<()> {
        let flags = self.current()?.flags;
        if flags & FLAG_HAS_OPTIONAL_MEMBERS != 0 {
            self.skip_optionals()?;
        }
        let patches = std::mem::take(&mut self.current()?.indirect_patches);
        if flags & FLAG_HAS_INDIRECTION_TABLE == 0 {
            if !patches.is_empty() {
                return Err(WireError::InvalidSlice("切片引用了不存在的间接表"));
            }
            return Ok(());
        }
        let table = self.read_indirection_table()?;
        if table.is_empty() {
            return Err(WireError::InvalidSlice("间接表为空"));
        }
        if patches.is_empty() && flags & FLAG_HAS_OPTIONAL_MEMBERS == 0 {
            return Err(WireError::InvalidSlice("间接表未被任何成员引用"));
        }
        for (index, patch) in patches {
            let wire = *table
                .get(index)
                .ok_or(WireError::InvalidSlice("间接表下标越界"))?;
            self.add_patch(wire, patch);
        }
        Ok(())
    }

    fn read_indirection_table(&mut self) -> WireResult<Vec<i32>> {
        let count = self.read_and_check_seq_size(1)?;
        let mut table = Vec::with_capacity(count);
        for _ in 0..count {
            let index = self.read_ref_index()?;
            if index == 0 {
                return Err(WireError::InvalidInstanceReference(0));
            }
            table.push(self.read_instance(index, None)?);
        }
        Ok(table)
    }

    /// 跳过当前切片；类切片的字节与间接表被保留下来。
    fn skip_slice(&mut self) -> WireResult<()> {
        let (flags, slice_type, slice_size, label) = {
            let frame = self.current()?;
            (frame.flags, frame.slice_type, frame.slice_size, frame.label())
        };
        if flags & FLAG_HAS_SLICE_SIZE == 0 {
            return Err(match slice_type {
                SliceType::Value => WireError::NoFactory {
                    type_id: label,
                    reason: "紧凑格式无法跳过未知切片",
                },
                SliceType::Exception => WireError::UnknownUserException { type_id: label },
            });
        }
        let start = self.pos;
        self.skip(slice_size - 4)?;
        let has_optional_members = flags & FLAG_HAS_OPTIONAL_MEMBERS != 0;
        let end = if has_optional_members {
            self.pos
                .checked_sub(1)
                .filter(|end| *end >= start)
                .ok_or(WireError::InvalidSlice("可选成员切片缺少结束标记"))?
        } else {
            self.pos
        };
        let bytes = self.buf[start..end].to_vec();
        tracing::trace!(type_id = %label, len = bytes.len(), "跳过未知切片");
        let table = if flags & FLAG_HAS_INDIRECTION_TABLE != 0 {
            self.read_indirection_table()?
        } else {
            Vec::new()
        };
        if slice_type == SliceType::Value {
            let frame = self.current()?;
            let info = SliceInfo {
                type_id: frame.type_id.clone(),
                compact_id: frame.compact_id,
                bytes,
                instances: vec![None; table.len()],
                has_optional_members,
                is_last_slice: flags & FLAG_IS_LAST_SLICE != 0,
            };
            frame.skipped.push(SkippedSlice { info, table });
        }
        Ok(())
    }

    fn read_slice_members(
        &mut self,
        owner: Owner,
        slice: usize,
        descriptor: &TypeDescriptor,
    ) -> WireResult<()> {
        for (index, member) in descriptor.members().iter().enumerate() {
            let slot = Slot::Member { slice, index };
            let data = self.read_member(&member.ty, Dest::Site(PatchSite::new(owner, slot)))?;
            self.store(owner, slot, data)?;
        }
        for (index, member) in descriptor.optional_members().iter().enumerate() {
            if !self.read_optional(member.tag.unwrap_or_default(), member.format())? {
                continue;
            }
            let slot = Slot::Optional { slice, index };
            let data =
                self.read_optional_payload(&member.ty, Dest::Site(PatchSite::new(owner, slot)))?;
            self.store(owner, slot, data)?;
        }
        Ok(())
    }

    fn store(&mut self, owner: Owner, slot: Slot, data: Data) -> WireResult<()> {
        let instance = match owner {
            Owner::Instance(id) => self.graph.get_mut(id),
            Owner::Exception => self.values_mut().exception.as_mut(),
        }
        .ok_or(WireError::InvalidState("成员宿主不存在"))?;
        let stored = match slot {
            Slot::Member { slice, index } => instance
                .slices
                .get_mut(slice)
                .and_then(|fields| fields.members.get_mut(index))
                .map(|cell| *cell = data),
            Slot::Optional { slice, index } => instance
                .slices
                .get_mut(slice)
                .and_then(|fields| fields.optional.get_mut(index))
                .map(|cell| *cell = Some(data)),
            Slot::Preserved { .. } => None,
        };
        stored.ok_or(WireError::InvalidState("成员槽位不存在"))
    }

    fn read_optional_payload(&mut self, ty: &MemberType, dest: Dest) -> WireResult<Data> {
        match ty.optional_format() {
            OptionalFormat::VSize if vsize_has_prefix(ty) => {
                self.read_size()?;
            }
            OptionalFormat::FSize => {
                self.read_i32()?;
            }
            _ => {}
        }
        self.read_member(ty, dest)
    }

    fn read_member(&mut self, ty: &MemberType, dest: Dest) -> WireResult<Data> {
        let data = match ty {
            MemberType::Bool => Data::Bool(self.read_bool()?),
            MemberType::Byte => Data::Byte(self.read_u8()?),
            MemberType::Short => Data::Short(self.read_i16()?),
            MemberType::Int => Data::Int(self.read_i32()?),
            MemberType::Long => Data::Long(self.read_i64()?),
            MemberType::Float => Data::Float(self.read_f32()?),
            MemberType::Double => Data::Double(self.read_f64()?),
            MemberType::String => Data::String(self.read_string()?),
            MemberType::Enum { max } => Data::Enum(self.read_enum(*max)?),
            MemberType::Sequence(elem) => {
                let count = self.read_and_check_seq_size(elem.min_wire_size())?;
                let mut items = Vec::with_capacity(count);
                for index in 0..count {
                    items.push(self.read_member(elem, dest.child(index, elem))?);
                }
                Data::Sequence(items)
            }
            MemberType::Dictionary(key_ty, value_ty) => {
                let min = key_ty.min_wire_size() + value_ty.min_wire_size();
                let count = self.read_and_check_seq_size(min)?;
                let mut entries = Vec::with_capacity(count);
                for index in 0..count {
                    let key = self.read_member(key_ty, dest.detached())?;
                    let value = self.read_member(value_ty, dest.child(index, value_ty))?;
                    entries.push((key, value));
                }
                Data::Dictionary(entries)
            }
            MemberType::Struct(desc) => {
                let mut fields = Vec::with_capacity(desc.fields.len());
                for (index, (_, field_ty)) in desc.fields.iter().enumerate() {
                    fields.push(self.read_member(field_ty, dest.child(index, field_ty))?);
                }
                Data::Struct(fields)
            }
            MemberType::Class(expected) => match dest {
                Dest::Top => match expected {
                    Some(expected) => Data::Instance(self.read_value_of(expected)?),
                    None => Data::Instance(self.read_value()?),
                },
                Dest::Site(mut site) => {
                    site.expected = expected.clone();
                    self.read_reference(Patch::Site(site))?;
                    Data::Instance(None)
                }
                Dest::Discard => {
                    self.read_reference(Patch::Discard)?;
                    Data::Instance(None)
                }
            },
        };
        Ok(data)
    }
}

fn descriptors_of(instance: &Instance) -> Vec<Arc<TypeDescriptor>> {
    instance
        .slices()
        .iter()
        .map(|fields| Arc::clone(fields.descriptor()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        FactoryRegistry, InstanceGraph, OutputStream, TypeRegistry, WireContext,
        types::TypeDescriptor,
    };

    fn node_context() -> Arc<WireContext> {
        let mut types = TypeRegistry::new();
        types.register(
            TypeDescriptor::class("::Demo::Node")
                .member("name", MemberType::String)
                .member("next", MemberType::Class(Some("::Demo::Node".into()))),
        );
        WireContext::new(types, FactoryRegistry::new()).shared()
    }

    fn cyclic_bytes(ctx: &WireContext) -> Vec<u8> {
        let mut graph = InstanceGraph::new();
        let a = graph.insert(Instance::new(ctx.types(), "::Demo::Node").expect("描述符存在"));
        let b = graph.insert(Instance::new(ctx.types(), "::Demo::Node").expect("描述符存在"));
        for (id, name, next) in [(a, "a", b), (b, "b", a)] {
            let node = graph.get_mut(id).expect("实例存在");
            node.set("name", Data::String(name.into())).expect("成员存在");
            node.set("next", Data::Instance(Some(next))).expect("成员存在");
        }
        let mut out = OutputStream::new();
        out.write_value(&graph, Some(a)).expect("可编码");
        out.into_bytes().to_vec()
    }

    #[test]
    fn patches_fire_only_after_target_completes() {
        let ctx = node_context();
        let bytes = cyclic_bytes(&ctx);
        let mut input = InputStream::new(&bytes).with_context(Arc::clone(&ctx));
        let root = input.read_value().expect("可解码").expect("非空");

        let events = &input.frames[0].values.as_ref().expect("存在解码状态").events;
        for (pos, event) in events.iter().enumerate() {
            if let PatchEvent::Patched(id) = event {
                assert!(
                    events[..pos].contains(&PatchEvent::Completed(*id)),
                    "补丁早于目标完成：{events:?}"
                );
            }
        }
        let patched = events
            .iter()
            .filter(|e| matches!(e, PatchEvent::Patched(_)))
            .count();
        assert_eq!(patched, 2);

        let graph = input.into_graph();
        let a = graph.get(root).expect("根实例");
        let Some(Data::Instance(Some(b_id))) = a.get("next") else {
            panic!("a.next 应指向 b");
        };
        let b = graph.get(*b_id).expect("b 实例");
        assert_eq!(b.get("name"), Some(&Data::String("b".into())));
        assert_eq!(b.get("next"), Some(&Data::Instance(Some(root))));
    }

    #[test]
    fn dangling_back_reference_is_unresolved() {
        let ctx = node_context();
        // 内联实例的 next 指向从未出现的编号 5。
        let mut out = OutputStream::new();
        out.write_size(1);
        out.write_u8(FLAG_HAS_TYPE_ID_STRING | FLAG_IS_LAST_SLICE);
        out.write_string("::Demo::Node");
        out.write_string("x");
        out.write_size(5);
        let bytes = out.into_bytes();
        let mut input = InputStream::new(&bytes).with_context(ctx);
        assert_eq!(input.read_value(), Err(WireError::UnresolvedReferences(1)));
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut types = TypeRegistry::new();
        types.register(
            TypeDescriptor::class("::Demo::Node")
                .member("name", MemberType::String)
                .member("next", MemberType::Class(None)),
        );
        let ctx = WireContext::new(types, FactoryRegistry::new())
            .with_class_graph_depth_max(2)
            .shared();
        let mut graph = InstanceGraph::new();
        let mut next = None;
        for _ in 0..3 {
            let mut node = Instance::new(ctx.types(), "::Demo::Node").expect("描述符存在");
            node.set("next", Data::Instance(next)).expect("成员存在");
            next = Some(graph.insert(node));
        }
        let mut out = OutputStream::new();
        out.write_value(&graph, next).expect("可编码");
        let bytes = out.into_bytes();
        let mut input = InputStream::new(&bytes).with_context(ctx);
        assert_eq!(
            input.read_value(),
            Err(WireError::ClassGraphDepthExceeded(2))
        );
    }

    #[test]
    fn null_reference_invokes_hook_immediately() {
        let mut input = InputStream::new(&[0]);
        let (tx, rx) = std::sync::mpsc::channel();
        input
            .read_value_with(move |id| tx.send(id).expect("接收端存在"))
            .expect("空引用");
        assert_eq!(rx.try_recv(), Ok(None));
    }
}
