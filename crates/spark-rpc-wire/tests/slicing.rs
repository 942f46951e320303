//! `slicing` 集成测试：类实例图、未知切片保留与用户异常。
//!
//! # 测试总览（Why）
//! - 只认识基类的接收端必须保留派生切片，并在转发时逐字节还原；
//! - 环形引用在紧凑与切片两种格式下都必须终止并完整回填；
//! - 紧凑格式遇到未知类型立即失败，切片格式则退回到已知基类。

use std::sync::Arc;

use spark_rpc_wire::{
    Data, ENCODING_1_0, ENCODING_1_1, FactoryRegistry, FormatType, InputStream, Instance,
    InstanceGraph, InstanceId, MemberType, OutputStream, TypeDescriptor, TypeRegistry,
    WireContext, WireError,
};

fn base_descriptor() -> TypeDescriptor {
    TypeDescriptor::class("::Demo::Shape")
        .member("id", MemberType::Int)
        .optional(3, "note", MemberType::String)
}

fn derived_descriptor() -> TypeDescriptor {
    TypeDescriptor::class("::Demo::Circle")
        .with_base("::Demo::Shape")
        .member("radius", MemberType::Double)
        .member("anchor", MemberType::Class(Some("::Demo::Shape".into())))
        .optional(1, "color", MemberType::Enum { max: 3 })
}

fn sender_types() -> TypeRegistry {
    let mut types = TypeRegistry::new();
    types.register(base_descriptor());
    types.register(derived_descriptor());
    types
}

fn receiver_types() -> TypeRegistry {
    let mut types = TypeRegistry::new();
    types.register(base_descriptor());
    types
}

fn context(types: TypeRegistry) -> Arc<WireContext> {
    WireContext::new(types, FactoryRegistry::new()).shared()
}

/// 构造一个 Circle，其 anchor 指向另一个 Shape。
fn circle_graph(types: &TypeRegistry) -> (InstanceGraph, InstanceId) {
    let mut graph = InstanceGraph::new();
    let mut anchor = Instance::new(types, "::Demo::Shape").expect("描述符存在");
    anchor.set("id", Data::Int(7)).expect("成员存在");
    let anchor = graph.insert(anchor);

    let mut circle = Instance::new(types, "::Demo::Circle").expect("描述符存在");
    circle.set("id", Data::Int(1)).expect("成员存在");
    circle.set("note", Data::String("unit".into())).expect("成员存在");
    circle.set("radius", Data::Double(2.5)).expect("成员存在");
    circle.set("anchor", Data::Instance(Some(anchor))).expect("成员存在");
    circle.set("color", Data::Enum(2)).expect("成员存在");
    let circle = graph.insert(circle);
    (graph, circle)
}

fn encode_value(graph: &InstanceGraph, root: InstanceId, format: FormatType) -> Vec<u8> {
    let mut out = OutputStream::new();
    out.start_encapsulation_with(ENCODING_1_1, format);
    out.write_value(graph, Some(root)).expect("可编码");
    out.end_encapsulation().expect("封装已打开");
    out.into_bytes().to_vec()
}

fn decode_value(bytes: &[u8], ctx: Arc<WireContext>) -> Result<(InstanceGraph, InstanceId), WireError> {
    let mut input = InputStream::new(bytes).with_context(ctx);
    input.start_encapsulation()?;
    let root = input.read_value()?.ok_or(WireError::InvalidState("空引用"))?;
    input.end_encapsulation()?;
    Ok((input.into_graph(), root))
}

#[test]
fn unknown_derived_slice_is_preserved_byte_for_byte() {
    let sender = sender_types();
    let (graph, circle) = circle_graph(&sender);
    let original = encode_value(&graph, circle, FormatType::Sliced);

    let (decoded, root) = decode_value(&original, context(receiver_types())).expect("可退回基类");
    let shape = decoded.get(root).expect("根实例");
    assert_eq!(shape.type_id(), "::Demo::Shape");
    assert_eq!(shape.get("id"), Some(&Data::Int(1)));
    assert_eq!(shape.get("note"), Some(&Data::String("unit".into())));

    let sliced = shape.sliced_data().expect("保留了派生切片");
    assert_eq!(sliced.slices.len(), 1);
    let preserved = &sliced.slices[0];
    assert_eq!(preserved.type_id, "::Demo::Circle");
    assert!(preserved.has_optional_members);
    assert!(!preserved.is_last_slice);
    let anchor = preserved.instances[0].expect("间接表实例已回填");
    assert_eq!(decoded.get(anchor).and_then(|a| a.get("id")), Some(&Data::Int(7)));

    let forwarded = encode_value(&decoded, root, FormatType::Sliced);
    assert_eq!(forwarded, original);

    // 转发后的字节对原始发送端依然完整可读。
    let (full, root) = decode_value(&forwarded, context(sender)).expect("发送端可解码");
    let circle = full.get(root).expect("根实例");
    assert_eq!(circle.type_id(), "::Demo::Circle");
    assert_eq!(circle.get("radius"), Some(&Data::Double(2.5)));
    assert_eq!(circle.get("color"), Some(&Data::Enum(2)));
}

#[test]
fn compact_format_fails_on_unknown_type_immediately() {
    let sender = sender_types();
    let (graph, circle) = circle_graph(&sender);
    let bytes = encode_value(&graph, circle, FormatType::Compact);

    let err = decode_value(&bytes, context(receiver_types())).expect_err("紧凑格式不能切片");
    assert!(matches!(
        &err,
        WireError::NoFactory { type_id, .. } if type_id == "::Demo::Circle"
    ));

    let (decoded, root) = decode_value(&bytes, context(sender)).expect("双方类型一致");
    assert_eq!(decoded.get(root).map(Instance::type_id), Some("::Demo::Circle"));
}

#[test]
fn slicing_can_be_disabled() {
    let sender = sender_types();
    let (graph, circle) = circle_graph(&sender);
    let bytes = encode_value(&graph, circle, FormatType::Sliced);
    let ctx = WireContext::new(receiver_types(), FactoryRegistry::new())
        .with_slice_values(false)
        .shared();
    assert!(matches!(
        decode_value(&bytes, ctx),
        Err(WireError::NoFactory { .. })
    ));
}

fn ring_types() -> TypeRegistry {
    let mut types = TypeRegistry::new();
    types.register(
        TypeDescriptor::class("::Demo::Ring")
            .with_compact_id(12)
            .member("label", MemberType::String)
            .member(
                "peers",
                MemberType::Sequence(Box::new(MemberType::Class(Some("::Demo::Ring".into())))),
            )
            .optional(2, "next", MemberType::Class(Some("::Demo::Ring".into()))),
    );
    types
}

fn ring_graph(types: &TypeRegistry) -> (InstanceGraph, InstanceId, InstanceId) {
    let mut graph = InstanceGraph::new();
    let a = graph.insert(Instance::new(types, "::Demo::Ring").expect("描述符存在"));
    let b = graph.insert(Instance::new(types, "::Demo::Ring").expect("描述符存在"));
    for (id, label, other) in [(a, "a", b), (b, "b", a)] {
        let ring = graph.get_mut(id).expect("实例存在");
        ring.set("label", Data::String(label.into())).expect("成员存在");
        ring.set("peers", Data::Sequence(vec![Data::Instance(Some(other)), Data::Instance(None)]))
            .expect("成员存在");
        ring.set("next", Data::Instance(Some(other))).expect("成员存在");
    }
    (graph, a, b)
}

fn assert_ring(graph: &InstanceGraph, root: InstanceId) {
    let a = graph.get(root).expect("根实例");
    assert_eq!(a.get("label"), Some(&Data::String("a".into())));
    let Some(Data::Instance(Some(b_id))) = a.get("next") else {
        panic!("a.next 未回填");
    };
    let b = graph.get(*b_id).expect("b 已解码");
    assert_eq!(b.get("label"), Some(&Data::String("b".into())));
    assert_eq!(b.get("next"), Some(&Data::Instance(Some(root))));
    assert_eq!(
        b.get("peers"),
        Some(&Data::Sequence(vec![Data::Instance(Some(root)), Data::Instance(None)]))
    );
    assert_eq!(
        a.get("peers"),
        Some(&Data::Sequence(vec![Data::Instance(Some(*b_id)), Data::Instance(None)]))
    );
}

#[test]
fn cyclic_graph_decodes_in_both_formats() {
    let types = ring_types();
    let (graph, a, _) = ring_graph(&types);
    for format in [FormatType::Compact, FormatType::Sliced] {
        let bytes = encode_value(&graph, a, format);
        let (decoded, root) = decode_value(&bytes, context(ring_types()))
            .unwrap_or_else(|err| panic!("{format:?} 格式解码失败：{err}"));
        assert_ring(&decoded, root);
    }
}

#[test]
fn hook_fires_after_target_completes() {
    let types = ring_types();
    let (graph, a, _) = ring_graph(&types);
    let mut out = OutputStream::new();
    out.write_value(&graph, Some(a)).expect("可编码");
    let bytes = out.into_bytes();

    let (tx, rx) = std::sync::mpsc::channel();
    let mut input = InputStream::new(&bytes).with_context(context(ring_types()));
    input
        .read_value_with(move |id| tx.send(id).expect("接收端存在"))
        .expect("可解码");
    let id = rx.try_recv().expect("钩子已调用").expect("非空");
    assert!(input.graph().get(id).is_some());
}

#[test]
fn static_type_mismatch_is_reported() {
    let mut types = ring_types();
    types.register(TypeDescriptor::class("::Demo::Other").member("x", MemberType::Int));
    let mut graph = InstanceGraph::new();
    let other = graph.insert(Instance::new(&types, "::Demo::Other").expect("描述符存在"));
    let mut ring = Instance::new(&types, "::Demo::Ring").expect("描述符存在");
    ring.set("peers", Data::Sequence(vec![Data::Instance(Some(other))]))
        .expect("形状一致");
    let ring = graph.insert(ring);

    let mut out = OutputStream::new();
    out.write_value(&graph, Some(ring)).expect("可编码");
    let bytes = out.into_bytes();
    let mut input = InputStream::new(&bytes).with_context(context(types));
    assert!(matches!(
        input.read_value(),
        Err(WireError::TypeMismatch { expected, found })
            if expected == "::Demo::Ring" && found == "::Demo::Other"
    ));
}

#[test]
fn classes_require_encoding_1_1() {
    let types = ring_types();
    let (graph, a, _) = ring_graph(&types);
    let mut out = OutputStream::with_encoding(ENCODING_1_0);
    assert!(matches!(
        out.write_value(&graph, Some(a)),
        Err(WireError::UnsupportedEncoding(_))
    ));
}

fn exception_types() -> TypeRegistry {
    let mut types = TypeRegistry::new();
    types.register(TypeDescriptor::exception("::Demo::Failure").member("reason", MemberType::String));
    types.register(
        TypeDescriptor::exception("::Demo::QuotaFailure")
            .with_base("::Demo::Failure")
            .member("limit", MemberType::Long),
    );
    types
}

fn encode_quota_failure(types: &TypeRegistry, format: FormatType) -> Vec<u8> {
    let graph = InstanceGraph::new();
    let mut failure = Instance::new(types, "::Demo::QuotaFailure").expect("描述符存在");
    failure.set("reason", Data::String("over quota".into())).expect("成员存在");
    failure.set("limit", Data::Long(10)).expect("成员存在");
    let mut out = OutputStream::new();
    out.start_encapsulation_with(ENCODING_1_1, format);
    out.write_exception(&graph, &failure).expect("可编码");
    out.end_encapsulation().expect("封装已打开");
    out.into_bytes().to_vec()
}

#[test]
fn exception_slices_fall_back_to_known_base() {
    let bytes = encode_quota_failure(&exception_types(), FormatType::Sliced);

    let mut only_base = TypeRegistry::new();
    only_base.register(TypeDescriptor::exception("::Demo::Failure").member("reason", MemberType::String));
    let mut input = InputStream::new(&bytes).with_context(context(only_base));
    input.start_encapsulation().expect("头部完整");
    let failure = input.read_exception().expect("退回基类异常");
    input.end_encapsulation().expect("长度一致");
    assert_eq!(failure.type_id(), "::Demo::Failure");
    assert_eq!(failure.get("reason"), Some(&Data::String("over quota".into())));

    let mut input = InputStream::new(&bytes).with_context(context(TypeRegistry::new()));
    input.start_encapsulation().expect("头部完整");
    assert_eq!(
        input.read_exception(),
        Err(WireError::UnknownUserException {
            type_id: "::Demo::QuotaFailure".into()
        })
    );
}

#[test]
fn exception_roundtrip_with_full_descriptors() {
    let bytes = encode_quota_failure(&exception_types(), FormatType::Compact);
    let mut input = InputStream::new(&bytes).with_context(context(exception_types()));
    input.start_encapsulation().expect("头部完整");
    let failure = input.read_exception().expect("可解码");
    assert_eq!(failure.type_id(), "::Demo::QuotaFailure");
    assert_eq!(failure.get("limit"), Some(&Data::Long(10)));
}

#[test]
fn default_factory_receives_unknown_type_ids() {
    let sender = sender_types();
    let (graph, circle) = circle_graph(&sender);
    let bytes = encode_value(&graph, circle, FormatType::Sliced);

    let mut factories = FactoryRegistry::new();
    factories
        .add(
            "",
            Arc::new(|id: &str, _: &TypeRegistry| {
                (id == "::Demo::Circle").then(|| Instance::opaque(id))
            }),
        )
        .expect("默认工厂");
    let ctx = WireContext::new(receiver_types(), factories).shared();
    let (decoded, root) = decode_value(&bytes, ctx).expect("默认工厂兜底");
    let opaque = decoded.get(root).expect("根实例");
    assert_eq!(opaque.type_id(), "::Demo::Circle");
    assert_eq!(opaque.sliced_data().map(|s| s.slices.len()), Some(2));
    assert_eq!(encode_value(&decoded, root, FormatType::Sliced), bytes);
}
