//! 间接解析缓存：路由器与定位器信息。
//!
//! - [`RouterInfo`]/[`RouterManager`]：路由器端点与路由表登记，带“最近淘汰”多重集；
//! - [`LocatorInfo`]/[`LocatorManager`]：适配器标识与知名对象到端点的 TTL 缓存；
//! - [`RemoteRouter`]/[`RemoteLocator`]：经代理调用远端服务实现上述能力。

mod locator;
mod remote;
mod router;

pub use locator::{Locator, LocatorInfo, LocatorManager};
pub use remote::{RemoteLocator, RemoteRouter};
pub use router::{Router, RouterInfo, RouterManager};

pub(crate) use remote::{remote_locator, remote_router};
