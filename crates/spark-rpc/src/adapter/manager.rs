//! 适配器的三张注册表：活动服务对象表（ASM）、默认服务对象、服务对象定位器。
//!
//! # 教案定位（Why）
//! - 三张表共用一把读写锁，注册与注销互斥，分发只在解析时短暂持读锁并复制出 `Arc`；
//!   解析完成后的分发不受并发注销影响；
//! - 重复注册与注销不存在的条目都是注册表冲突错误，不会被静默忽略。
//!
//! # 解析顺序（What）
//! 1. ASM 中 (身份, 切面) 精确匹配；
//! 2. 身份类别对应的默认服务对象，然后是空类别的默认服务对象；
//! 3. 身份类别对应的定位器；该类别未注册定位器时使用空类别定位器；
//! 4. 都不匹配时，身份在 ASM 中有任意切面则为“切面不存在”，否则为“对象不存在”。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{RpcError, RpcResult};
use crate::identity::Identity;

use super::servant::{Servant, ServantLocator};

/// 解析结果。
pub(crate) enum Resolved {
    Servant(Arc<dyn Servant>),
    Locator(Arc<dyn ServantLocator>),
    FacetNotExist,
    ObjectNotExist,
}

#[derive(Default)]
struct Registries {
    servants: HashMap<Identity, HashMap<String, Arc<dyn Servant>>>,
    defaults: HashMap<String, Arc<dyn Servant>>,
    locators: HashMap<String, Arc<dyn ServantLocator>>,
}

#[derive(Default)]
pub(crate) struct ServantManager {
    registries: RwLock<Registries>,
}

fn facet_key(identity: &Identity, facet: &str) -> String {
    if facet.is_empty() {
        identity.to_string()
    } else {
        format!("{identity} -f {facet}")
    }
}

fn check_identity(identity: &Identity) -> RpcResult<()> {
    if identity.name.is_empty() {
        return Err(RpcError::IllegalIdentity(identity.to_string()));
    }
    Ok(())
}

impl ServantManager {
    pub(crate) fn add_facet(
        &self,
        servant: Arc<dyn Servant>,
        identity: Identity,
        facet: &str,
    ) -> RpcResult<()> {
        check_identity(&identity)?;
        let mut registries = self.registries.write();
        let facets = registries.servants.entry(identity.clone()).or_default();
        if facets.contains_key(facet) {
            return Err(RpcError::already_registered(
                "servant",
                facet_key(&identity, facet),
            ));
        }
        facets.insert(facet.to_owned(), servant);
        Ok(())
    }

    pub(crate) fn remove_facet(
        &self,
        identity: &Identity,
        facet: &str,
    ) -> RpcResult<Arc<dyn Servant>> {
        let mut registries = self.registries.write();
        let removed = registries.servants.get_mut(identity).and_then(|facets| {
            let removed = facets.remove(facet);
            removed.map(|servant| (servant, facets.is_empty()))
        });
        match removed {
            Some((servant, now_empty)) => {
                if now_empty {
                    registries.servants.remove(identity);
                }
                Ok(servant)
            }
            None => Err(RpcError::not_registered(
                "servant",
                facet_key(identity, facet),
            )),
        }
    }

    pub(crate) fn remove_all_facets(
        &self,
        identity: &Identity,
    ) -> RpcResult<HashMap<String, Arc<dyn Servant>>> {
        self.registries
            .write()
            .servants
            .remove(identity)
            .ok_or_else(|| RpcError::not_registered("servant", identity.to_string()))
    }

    pub(crate) fn find_facet(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        self.registries
            .read()
            .servants
            .get(identity)
            .and_then(|facets| facets.get(facet))
            .cloned()
    }

    pub(crate) fn find_all_facets(&self, identity: &Identity) -> HashMap<String, Arc<dyn Servant>> {
        self.registries
            .read()
            .servants
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn has_servant(&self, identity: &Identity) -> bool {
        self.registries.read().servants.contains_key(identity)
    }

    pub(crate) fn add_default_servant(
        &self,
        servant: Arc<dyn Servant>,
        category: &str,
    ) -> RpcResult<()> {
        let mut registries = self.registries.write();
        if registries.defaults.contains_key(category) {
            return Err(RpcError::already_registered("default servant", category));
        }
        registries.defaults.insert(category.to_owned(), servant);
        Ok(())
    }

    pub(crate) fn remove_default_servant(&self, category: &str) -> RpcResult<Arc<dyn Servant>> {
        self.registries
            .write()
            .defaults
            .remove(category)
            .ok_or_else(|| RpcError::not_registered("default servant", category))
    }

    pub(crate) fn find_default_servant(&self, category: &str) -> Option<Arc<dyn Servant>> {
        self.registries.read().defaults.get(category).cloned()
    }

    pub(crate) fn add_servant_locator(
        &self,
        locator: Arc<dyn ServantLocator>,
        category: &str,
    ) -> RpcResult<()> {
        let mut registries = self.registries.write();
        if registries.locators.contains_key(category) {
            return Err(RpcError::already_registered("servant locator", category));
        }
        registries.locators.insert(category.to_owned(), locator);
        Ok(())
    }

    pub(crate) fn remove_servant_locator(
        &self,
        category: &str,
    ) -> RpcResult<Arc<dyn ServantLocator>> {
        self.registries
            .write()
            .locators
            .remove(category)
            .ok_or_else(|| RpcError::not_registered("servant locator", category))
    }

    pub(crate) fn find_servant_locator(&self, category: &str) -> Option<Arc<dyn ServantLocator>> {
        self.registries.read().locators.get(category).cloned()
    }

    /// 按固定顺序解析；返回前释放读锁。
    pub(crate) fn resolve(&self, identity: &Identity, facet: &str) -> Resolved {
        let registries = self.registries.read();
        let facets = registries.servants.get(identity);
        if let Some(servant) = facets.and_then(|facets| facets.get(facet)) {
            return Resolved::Servant(Arc::clone(servant));
        }
        let default = registries
            .defaults
            .get(&identity.category)
            .or_else(|| registries.defaults.get(""));
        if let Some(servant) = default {
            return Resolved::Servant(Arc::clone(servant));
        }
        let locator = registries
            .locators
            .get(&identity.category)
            .or_else(|| registries.locators.get(""));
        if let Some(locator) = locator {
            return Resolved::Locator(Arc::clone(locator));
        }
        if facets.is_some() {
            Resolved::FacetNotExist
        } else {
            Resolved::ObjectNotExist
        }
    }

    /// 清空全部注册表，返回需要在锁外调用 `deactivate` 的定位器。
    pub(crate) fn destroy(&self) -> Vec<(String, Arc<dyn ServantLocator>)> {
        let mut registries = self.registries.write();
        registries.servants.clear();
        registries.defaults.clear();
        registries.locators.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::servant::{Cookie, Current, DispatchError};
    use async_trait::async_trait;
    use bytes::Bytes;

    struct Named(&'static str);

    #[async_trait]
    impl Servant for Named {
        async fn dispatch(&self, _: &Current, _: Bytes) -> Result<Bytes, DispatchError> {
            Ok(Bytes::from_static(self.0.as_bytes()))
        }

        fn type_ids(&self) -> Vec<String> {
            vec![self.0.to_owned()]
        }
    }

    struct NoopLocator;

    #[async_trait]
    impl ServantLocator for NoopLocator {
        async fn locate(
            &self,
            _: &Current,
        ) -> Result<Option<(Arc<dyn Servant>, Cookie)>, DispatchError> {
            Ok(None)
        }

        fn finished(&self, _: &Current, _: &Arc<dyn Servant>, _: Cookie) -> Result<(), DispatchError> {
            Ok(())
        }

        fn deactivate(&self, _: &str) {}
    }

    fn resolved_name(resolved: Resolved) -> String {
        match resolved {
            Resolved::Servant(servant) => servant.type_ids().remove(0),
            Resolved::Locator(_) => "locator".into(),
            Resolved::FacetNotExist => "facet-not-exist".into(),
            Resolved::ObjectNotExist => "object-not-exist".into(),
        }
    }

    #[test]
    fn exact_servant_wins_over_default_and_locator() {
        let manager = ServantManager::default();
        let id = Identity::new("x", "cat");
        manager
            .add_facet(Arc::new(Named("exact")), id.clone(), "")
            .expect("注册精确服务对象");
        manager
            .add_default_servant(Arc::new(Named("default")), "cat")
            .expect("注册默认服务对象");
        manager
            .add_servant_locator(Arc::new(NoopLocator), "cat")
            .expect("注册定位器");

        assert_eq!(resolved_name(manager.resolve(&id, "")), "exact");
        assert_eq!(
            resolved_name(manager.resolve(&Identity::new("y", "cat"), "")),
            "default"
        );
        manager.remove_default_servant("cat").expect("注销默认服务对象");
        assert_eq!(
            resolved_name(manager.resolve(&Identity::new("y", "cat"), "")),
            "locator"
        );
    }

    #[test]
    fn catch_all_default_precedes_category_locator() {
        let manager = ServantManager::default();
        manager
            .add_servant_locator(Arc::new(NoopLocator), "cat")
            .expect("注册定位器");
        manager
            .add_default_servant(Arc::new(Named("catch-all")), "")
            .expect("注册兜底默认服务对象");
        assert_eq!(
            resolved_name(manager.resolve(&Identity::new("y", "cat"), "")),
            "catch-all"
        );
    }

    #[test]
    fn unresolved_names_facet_or_object() {
        let manager = ServantManager::default();
        let id = Identity::new("x", "");
        manager
            .add_facet(Arc::new(Named("main")), id.clone(), "")
            .expect("注册");
        assert_eq!(resolved_name(manager.resolve(&id, "admin")), "facet-not-exist");
        assert_eq!(
            resolved_name(manager.resolve(&Identity::new("nobody", ""), "")),
            "object-not-exist"
        );
    }

    #[test]
    fn duplicate_add_and_absent_remove_are_conflicts() {
        let manager = ServantManager::default();
        let id = Identity::new("x", "");
        manager
            .add_facet(Arc::new(Named("a")), id.clone(), "")
            .expect("首次注册");
        let err = manager
            .add_facet(Arc::new(Named("b")), id.clone(), "")
            .expect_err("重复注册");
        assert_eq!(err.code(), "spark.rpc.registry.already_registered");

        let err = manager.remove_facet(&id, "other").err().expect("注销不存在的切面");
        assert_eq!(err.code(), "spark.rpc.registry.not_registered");

        manager.remove_facet(&id, "").expect("注销");
        assert!(!manager.has_servant(&id));
        assert!(manager.remove_all_facets(&id).is_err());
        assert!(manager.remove_servant_locator("none").is_err());
    }

    #[test]
    fn empty_name_is_rejected() {
        let manager = ServantManager::default();
        let err = manager
            .add_facet(Arc::new(Named("a")), Identity::default(), "")
            .expect_err("空名称");
        assert!(matches!(err, RpcError::IllegalIdentity(_)));
    }

    #[test]
    fn destroy_returns_locators_and_clears() {
        let manager = ServantManager::default();
        manager
            .add_servant_locator(Arc::new(NoopLocator), "a")
            .expect("注册");
        manager
            .add_facet(Arc::new(Named("s")), Identity::new("x", ""), "")
            .expect("注册");
        let locators = manager.destroy();
        assert_eq!(locators.len(), 1);
        assert_eq!(locators[0].0, "a");
        assert!(!manager.has_servant(&Identity::new("x", "")));
        assert!(manager.find_servant_locator("a").is_none());
    }
}
