//! 持久化 grant
//!
//! - **模型** (`model`): 授权码、刷新令牌、引用令牌、授权同意记录
//! - **存储** (`store`): 原子兑换的存储 trait、内存实现和超时包装
//! - **清理** (`cleanup`): 定期删除过期 grant 的后台任务
//!
//! 句柄是 32 字节随机数据的 base64url 编码，存储只保存其 SHA-256。

pub mod cleanup;
pub mod model;
pub mod store;

pub use cleanup::{CleanupHandle, CleanupScheduler};
pub use model::{GrantKind, NewGrant, PersistedGrant, RedeemCondition, RedeemMode};
pub use store::{GrantStore, InMemoryGrantStore, TimedGrantStore};
