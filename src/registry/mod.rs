//! 配置注册表
//!
//! - **客户端** (`client`): 以 `client_id` 为键的不可变客户端快照
//! - **资源** (`resource`): 身份资源、API 资源以及 scope 解析
//! - **种子** (`seed`): 配置存储接口与幂等的种子数据写入
//!
//! 两个注册表都持有 `RwLock<Arc<Snapshot>>`：读取只克隆 `Arc`，重新加载时整体替换。

pub mod client;
pub mod resource;
pub mod seed;

pub use client::{ClientRegistry, ClientSnapshot};
pub use resource::{
    ApiResource, IdentityResource, OPENID, ResourceRegistry, ResourceSnapshot, Resources,
    ScopePolicy,
};
pub use seed::{
    ConfigurationStore, InMemoryConfigurationStore, SeedData, SeedPlan, StoreEmptiness,
    demo_seed_data, plan_seed, seed_if_empty,
};
