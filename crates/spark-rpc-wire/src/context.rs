//! 解码所需的类型上下文。

use crate::{factory::FactoryRegistry, types::TypeRegistry};
use std::sync::Arc;

/// 默认的类图嵌套深度上限。
pub const DEFAULT_CLASS_GRAPH_DEPTH_MAX: usize = 100;

/// 类型描述符、实例工厂与解码限制的组合。
///
/// 由运行时上下文持有并以 `Arc` 共享给每条消息的 [`InputStream`](crate::InputStream)，
/// 不存在进程级全局表。
#[derive(Clone, Debug)]
pub struct WireContext {
    types: TypeRegistry,
    factories: FactoryRegistry,
    class_graph_depth_max: usize,
    slice_values: bool,
}

impl Default for WireContext {
    fn default() -> Self {
        Self::new(TypeRegistry::new(), FactoryRegistry::new())
    }
}

impl WireContext {
    /// 组合注册表。
    pub fn new(types: TypeRegistry, factories: FactoryRegistry) -> Self {
        Self {
            types,
            factories,
            class_graph_depth_max: DEFAULT_CLASS_GRAPH_DEPTH_MAX,
            slice_values: true,
        }
    }

    /// 设置类图深度上限。
    pub fn with_class_graph_depth_max(mut self, depth: usize) -> Self {
        self.class_graph_depth_max = depth.max(1);
        self
    }

    /// 是否允许跳过未知切片；关闭后未知类型一律报错。
    pub fn with_slice_values(mut self, enabled: bool) -> Self {
        self.slice_values = enabled;
        self
    }

    /// 包装为共享指针。
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// 类型描述符表。
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// 实例工厂表。
    pub fn factories(&self) -> &FactoryRegistry {
        &self.factories
    }

    /// 类图深度上限。
    pub fn class_graph_depth_max(&self) -> usize {
        self.class_graph_depth_max
    }

    /// 是否允许切片。
    pub fn slice_values(&self) -> bool {
        self.slice_values
    }
}
