#![deny(unsafe_code)]

//! `spark-rpc-wire` 提供 spark-rpc 的线格式编解码与多态类型切片引擎。
//!
//! # 模块定位（Why）
//! - 连接层、协议帧与分发层都需要同一套字节布局规则；将其收敛到独立 crate，
//!   使得编解码可以脱离异步运行时单独测试与基准。
//! - 类型布局以 [`TypeDescriptor`] 数据形式注册，不依赖代码生成器。
//!
//! # 设计概要（How）
//! - [`OutputStream`]/[`InputStream`] 负责基础类型、size、封装与可选成员；
//! - `slicing` 模块为两者扩展类实例、异常与成员值的编解码；
//! - [`WireContext`] 组合 [`TypeRegistry`] 与 [`FactoryRegistry`]，由运行时上下文持有并共享。
//!
//! # 契约说明（What）
//! - 所有失败以 [`WireError`] 返回，任何输入都不会导致 panic；
//! - 类与异常需要编码 1.1，在 1.0 封装内调用会返回 [`WireError::UnsupportedEncoding`]。

mod context;
mod data;
mod error;
mod factory;
mod input;
mod optional;
mod output;
mod slicing;
mod types;
mod version;

pub use context::{DEFAULT_CLASS_GRAPH_DEPTH_MAX, WireContext};
pub use data::{Data, Instance, InstanceGraph, InstanceId, SliceFields, SliceInfo, SlicedData};
pub use error::{WireError, WireErrorKind, WireResult};
pub use factory::{DuplicateFactory, FactoryRegistry, InstanceFactory};
pub use input::InputStream;
pub use optional::{OPTIONAL_END_MARKER, OptionalFormat};
pub use output::OutputStream;
pub use slicing::{
    FLAG_HAS_INDIRECTION_TABLE, FLAG_HAS_OPTIONAL_MEMBERS, FLAG_HAS_SLICE_SIZE,
    FLAG_HAS_TYPE_ID_COMPACT, FLAG_HAS_TYPE_ID_INDEX, FLAG_HAS_TYPE_ID_STRING, FLAG_IS_LAST_SLICE,
};
pub use types::{
    MemberDescriptor, MemberType, ROOT_TYPE_ID, StructDescriptor, TypeDescriptor, TypeKind,
    TypeRegistry,
};
pub use version::{
    ENCODING_1_0, ENCODING_1_1, EncodingVersion, FormatType, PROTOCOL_1_0, ParseVersionError,
    ProtocolVersion,
};
