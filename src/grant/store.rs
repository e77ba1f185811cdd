//! Grant 存储
//!
//! [`GrantStore`] 是系统中唯一可变的共享状态。所有修改（创建、兑换、撤销、清理）
//! 都以“条件满足才更新”的原子操作表达，而不是先读后写：并发兑换同一个一次性句柄时
//! 恰好一个成功；清理与兑换竞争时，兑换要么在删除前完成，要么得到 `Expired` / `NotFound`。
//! 替换授权同意（[`GrantStore::replace`]）同样在一次调用内完成删除和写入。
//!
//! ## 示例
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use oidcrs::grant::{GrantKind, GrantStore, InMemoryGrantStore, NewGrant, RedeemCondition};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = InMemoryGrantStore::new();
//! let now = Utc::now();
//!
//! let handle = store
//!     .create(NewGrant::new(GrantKind::AuthorizationCode, "web", now, Duration::minutes(5)))
//!     .await
//!     .unwrap();
//!
//! let condition = RedeemCondition::consume(GrantKind::AuthorizationCode, "web", now);
//! assert!(store.redeem(&handle, &condition).await.is_ok());
//! assert!(store.redeem(&handle, &condition).await.is_err());
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, GrantError, Result, StorageError};
use crate::grant::model::{
    GrantKind, NewGrant, PersistedGrant, RedeemCondition, RedeemMode, expires_after,
};
use crate::random::{generate_handle, sha256_hex};

/// 生成句柄时的最大重试次数
const MAX_HANDLE_ATTEMPTS: usize = 4;

/// Grant 存储 trait
#[async_trait]
pub trait GrantStore: Send + Sync {
    /// 保存 grant，返回新生成的句柄
    async fn create(&self, grant: NewGrant) -> Result<String>;

    /// 只读查询（不检查过期）
    async fn get(&self, handle: &str) -> Result<Option<PersistedGrant>>;

    /// 原子兑换
    ///
    /// 失败时返回 `Error::InvalidGrant`，且不修改任何状态（过期记录除外，会被删除）
    async fn redeem(&self, handle: &str, condition: &RedeemCondition) -> Result<PersistedGrant>;

    /// 撤销单个句柄
    async fn revoke(&self, handle: &str) -> Result<bool>;

    /// 撤销某用户在某客户端下的所有 grant，`kind` 为 `None` 时不区分类型
    async fn revoke_all(
        &self,
        subject_id: &str,
        client_id: &str,
        kind: Option<GrantKind>,
    ) -> Result<usize>;

    /// 原子替换：删除同一用户、客户端、类型下的所有 grant，再保存 `grant`
    ///
    /// 返回新句柄和被删除的数量。并发替换之后只剩一条记录，读者也不会看到两者都不存在的中间状态。
    async fn replace(&self, grant: NewGrant) -> Result<(String, usize)>;

    /// 撤销一条刷新令牌链上的所有 grant
    async fn revoke_family(&self, family_id: &str) -> Result<usize>;

    /// 查找某用户在某客户端下的指定类型 grant
    async fn find(
        &self,
        subject_id: &str,
        client_id: &str,
        kind: GrantKind,
    ) -> Result<Vec<PersistedGrant>>;

    /// 删除所有在 `now` 之前过期的 grant
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// grant 总数
    async fn count(&self) -> Result<usize>;
}

// ============================================================================
// 内存实现
// ============================================================================

/// 内存 grant 存储
///
/// 所有操作都在同一把锁下一次完成，锁内没有 `.await`。
#[derive(Debug, Default)]
pub struct InMemoryGrantStore {
    grants: Mutex<HashMap<String, PersistedGrant>>,
}

impl InMemoryGrantStore {
    /// 创建新的内存存储
    pub fn new() -> Self {
        Self::default()
    }

    /// 生成一个未被占用的句柄，返回 `(handle, key)`
    fn fresh_handle_locked(grants: &HashMap<String, PersistedGrant>) -> Result<(String, String)> {
        for _ in 0..MAX_HANDLE_ATTEMPTS {
            let handle = generate_handle()?;
            let key = sha256_hex(&handle);
            if !grants.contains_key(&key) {
                return Ok((handle, key));
            }
        }

        Err(Error::Storage(StorageError::AlreadyExists(
            "could not generate a unique grant handle".to_string(),
        )))
    }

    /// 兑换检查与标记
    fn redeem_locked(
        grants: &mut HashMap<String, PersistedGrant>,
        key: &str,
        condition: &RedeemCondition,
    ) -> std::result::Result<PersistedGrant, GrantError> {
        let grant = grants.get_mut(key).ok_or(GrantError::NotFound)?;

        if grant.kind != condition.kind {
            return Err(GrantError::KindMismatch);
        }
        if grant.client_id != condition.client_id {
            return Err(GrantError::ClientMismatch);
        }
        if grant.is_expired(condition.now) {
            grants.remove(key);
            return Err(GrantError::Expired);
        }
        if grant.is_consumed() {
            return Err(GrantError::AlreadyConsumed);
        }

        match condition.mode {
            RedeemMode::Consume => {
                grant.consumed_at = Some(condition.now);
            }
            RedeemMode::Reuse { sliding, absolute } => {
                if let Some(sliding) = sliding {
                    let absolute_expiry = expires_after(grant.created_at, absolute);
                    grant.expires_at =
                        expires_after(condition.now, sliding).min(absolute_expiry);
                }
            }
        }

        Ok(grant.clone())
    }
}

#[async_trait]
impl GrantStore for InMemoryGrantStore {
    async fn create(&self, grant: NewGrant) -> Result<String> {
        let mut grants = self.grants.lock();
        let (handle, key) = Self::fresh_handle_locked(&grants)?;
        grants.insert(key.clone(), grant.into_persisted(key));
        Ok(handle)
    }

    async fn get(&self, handle: &str) -> Result<Option<PersistedGrant>> {
        let key = sha256_hex(handle);
        Ok(self.grants.lock().get(&key).cloned())
    }

    async fn redeem(&self, handle: &str, condition: &RedeemCondition) -> Result<PersistedGrant> {
        let key = sha256_hex(handle);
        let mut grants = self.grants.lock();
        Self::redeem_locked(&mut grants, &key, condition).map_err(Error::InvalidGrant)
    }

    async fn revoke(&self, handle: &str) -> Result<bool> {
        let key = sha256_hex(handle);
        Ok(self.grants.lock().remove(&key).is_some())
    }

    async fn revoke_all(
        &self,
        subject_id: &str,
        client_id: &str,
        kind: Option<GrantKind>,
    ) -> Result<usize> {
        let mut grants = self.grants.lock();
        let before = grants.len();
        grants.retain(|_, g| {
            !(g.subject_id.as_deref() == Some(subject_id)
                && g.client_id == client_id
                && kind.is_none_or(|k| g.kind == k))
        });
        Ok(before - grants.len())
    }

    async fn replace(&self, grant: NewGrant) -> Result<(String, usize)> {
        let mut grants = self.grants.lock();
        let (handle, key) = Self::fresh_handle_locked(&grants)?;

        let before = grants.len();
        grants.retain(|_, g| {
            !(g.kind == grant.kind
                && g.client_id == grant.client_id
                && g.subject_id == grant.subject_id)
        });
        let replaced = before - grants.len();

        grants.insert(key.clone(), grant.into_persisted(key));
        Ok((handle, replaced))
    }

    async fn revoke_family(&self, family_id: &str) -> Result<usize> {
        let mut grants = self.grants.lock();
        let before = grants.len();
        grants.retain(|_, g| g.family_id.as_deref() != Some(family_id));
        Ok(before - grants.len())
    }

    async fn find(
        &self,
        subject_id: &str,
        client_id: &str,
        kind: GrantKind,
    ) -> Result<Vec<PersistedGrant>> {
        let grants = self.grants.lock();
        let mut found: Vec<PersistedGrant> = grants
            .values()
            .filter(|g| {
                g.kind == kind
                    && g.client_id == client_id
                    && g.subject_id.as_deref() == Some(subject_id)
            })
            .cloned()
            .collect();
        found.sort_by_key(|g| g.created_at);
        Ok(found)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut grants = self.grants.lock();
        let before = grants.len();
        grants.retain(|_, g| !g.is_expired(now));
        Ok(before - grants.len())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.grants.lock().len())
    }
}

// ============================================================================
// 超时包装
// ============================================================================

/// 为每个存储操作加上超时的包装器
///
/// 超时返回 `Error::Timeout`。内部存储的操作必须在单次调用内原子完成，
/// 这样被超时取消的调用不会留下部分修改。
#[derive(Clone)]
pub struct TimedGrantStore {
    inner: Arc<dyn GrantStore>,
    timeout: Duration,
}

impl std::fmt::Debug for TimedGrantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedGrantStore")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TimedGrantStore {
    /// 包装一个存储
    pub fn new(inner: Arc<dyn GrantStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// 超时时间
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        tokio::time::timeout(self.timeout, operation)
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
    }
}

#[async_trait]
impl GrantStore for TimedGrantStore {
    async fn create(&self, grant: NewGrant) -> Result<String> {
        self.bounded(self.inner.create(grant)).await
    }

    async fn get(&self, handle: &str) -> Result<Option<PersistedGrant>> {
        self.bounded(self.inner.get(handle)).await
    }

    async fn redeem(&self, handle: &str, condition: &RedeemCondition) -> Result<PersistedGrant> {
        self.bounded(self.inner.redeem(handle, condition)).await
    }

    async fn revoke(&self, handle: &str) -> Result<bool> {
        self.bounded(self.inner.revoke(handle)).await
    }

    async fn revoke_all(
        &self,
        subject_id: &str,
        client_id: &str,
        kind: Option<GrantKind>,
    ) -> Result<usize> {
        self.bounded(self.inner.revoke_all(subject_id, client_id, kind))
            .await
    }

    async fn replace(&self, grant: NewGrant) -> Result<(String, usize)> {
        self.bounded(self.inner.replace(grant)).await
    }

    async fn revoke_family(&self, family_id: &str) -> Result<usize> {
        self.bounded(self.inner.revoke_family(family_id)).await
    }

    async fn find(
        &self,
        subject_id: &str,
        client_id: &str,
        kind: GrantKind,
    ) -> Result<Vec<PersistedGrant>> {
        self.bounded(self.inner.find(subject_id, client_id, kind))
            .await
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.bounded(self.inner.sweep_expired(now)).await
    }

    async fn count(&self) -> Result<usize> {
        self.bounded(self.inner.count()).await
    }
}
