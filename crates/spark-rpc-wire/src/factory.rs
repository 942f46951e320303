//! 实例工厂与解析链。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 解码到一个类切片时，需要先“造出”对应实例再逐成员填充；宿主可以为特定类型注册工厂，
//!   从而产出带有自定义默认值或附加状态的实例。
//!
//! ## 契约（What）
//! - 解析顺序：类型专属工厂 → 默认工厂（空类型标识）→ 描述符表兜底；
//! - 同一类型标识重复注册返回 [`DuplicateFactory`]；
//! - 兜底只对 [`TypeKind::Class`] 描述符生效，异常不经过工厂。
//!
//! ## 风险与注意事项（Trade-offs）
//! - 工厂在解码路径上同步调用，禁止在其中执行阻塞操作。

use crate::{
    data::Instance,
    types::{TypeKind, TypeRegistry},
};
use std::{collections::HashMap, fmt, sync::Arc};

/// 根据类型标识产出实例。
pub trait InstanceFactory: Send + Sync + 'static {
    /// 返回 `None` 表示本工厂不认识该类型。
    fn create(&self, type_id: &str, types: &TypeRegistry) -> Option<Instance>;
}

impl<F> InstanceFactory for F
where
    F: Fn(&str, &TypeRegistry) -> Option<Instance> + Send + Sync + 'static,
{
    fn create(&self, type_id: &str, types: &TypeRegistry) -> Option<Instance> {
        self(type_id, types)
    }
}

/// 同一类型标识重复注册工厂。
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("类型 `{0}` 的实例工厂已注册")]
pub struct DuplicateFactory(pub String);

/// 实例工厂注册表。
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, Arc<dyn InstanceFactory>>,
}

impl fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("type_ids", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FactoryRegistry {
    /// 创建空注册表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工厂；`type_id` 为空字符串时注册的是默认工厂。
    pub fn add(
        &mut self,
        type_id: impl Into<String>,
        factory: Arc<dyn InstanceFactory>,
    ) -> Result<(), DuplicateFactory> {
        let type_id = type_id.into();
        if self.factories.contains_key(&type_id) {
            return Err(DuplicateFactory(type_id));
        }
        self.factories.insert(type_id, factory);
        Ok(())
    }

    /// 查找已注册的工厂。
    pub fn find(&self, type_id: &str) -> Option<&Arc<dyn InstanceFactory>> {
        self.factories.get(type_id)
    }

    /// 按解析链产出实例。
    pub fn resolve(&self, type_id: &str, types: &TypeRegistry) -> Option<Instance> {
        if let Some(instance) = self
            .factories
            .get(type_id)
            .and_then(|f| f.create(type_id, types))
        {
            return Some(instance);
        }
        if let Some(instance) = self
            .factories
            .get("")
            .and_then(|f| f.create(type_id, types))
        {
            return Some(instance);
        }
        match types.get(type_id) {
            Some(desc) if desc.kind() == TypeKind::Class => Instance::new(types, type_id).ok(),
            _ => None,
        }
    }
}
