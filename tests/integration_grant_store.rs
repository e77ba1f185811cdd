//! 集成测试：Grant 存储
//!
//! 测试并发兑换、清理与兑换的竞争、滑动过期以及存储超时。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oidcrs::grant::{
    GrantKind, GrantStore, InMemoryGrantStore, NewGrant, PersistedGrant, RedeemCondition,
    TimedGrantStore,
};
use oidcrs::{Error, GrantError, Result};
use std::sync::Arc;

fn code_grant(created_at: DateTime<Utc>, lifetime: Duration) -> NewGrant {
    NewGrant::new(GrantKind::AuthorizationCode, "native.code", created_at, lifetime)
        .with_subject(Some("alice".to_string()))
        .with_scopes(vec!["openid".to_string(), "api".to_string()])
}

/// 测试并发兑换同一个授权码：恰好一个成功
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_redeem_has_single_winner() {
    let store = Arc::new(InMemoryGrantStore::new());
    let now = Utc::now();
    let handle = store
        .create(code_grant(now, Duration::minutes(5)))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            let condition =
                RedeemCondition::consume(GrantKind::AuthorizationCode, "native.code", Utc::now());
            store.redeem(&handle, &condition).await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(grant) => {
                winners += 1;
                assert!(grant.is_consumed());
            }
            Err(Error::InvalidGrant(GrantError::AlreadyConsumed)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners, 1);
}

/// 测试清理与兑换竞争：过期的授权码永远不会被兑换成功
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweep_and_redeem_race() {
    let store = Arc::new(InMemoryGrantStore::new());
    let created = Utc::now() - Duration::minutes(10);

    for _ in 0..20 {
        let handle = store
            .create(code_grant(created, Duration::minutes(5)))
            .await
            .unwrap();

        let sweeper = {
            let store = store.clone();
            tokio::spawn(async move { store.sweep_expired(Utc::now()).await })
        };
        let redeemer = {
            let store = store.clone();
            tokio::spawn(async move {
                let condition = RedeemCondition::consume(
                    GrantKind::AuthorizationCode,
                    "native.code",
                    Utc::now(),
                );
                store.redeem(&handle, &condition).await
            })
        };

        sweeper.await.unwrap().unwrap();
        match redeemer.await.unwrap() {
            Err(Error::InvalidGrant(GrantError::Expired | GrantError::NotFound)) => {}
            other => panic!("expired code must not redeem: {other:?}"),
        }
    }

    assert_eq!(store.count().await.unwrap(), 0);
}

/// 测试清理只删除过期记录
#[tokio::test]
async fn test_sweep_keeps_live_grants() {
    let store = InMemoryGrantStore::new();
    let now = Utc::now();

    let live = store
        .create(code_grant(now, Duration::minutes(5)))
        .await
        .unwrap();
    store
        .create(code_grant(now - Duration::hours(1), Duration::minutes(5)))
        .await
        .unwrap();

    assert_eq!(store.sweep_expired(now).await.unwrap(), 1);
    assert!(store.get(&live).await.unwrap().is_some());
}

/// 测试失败的兑换不修改状态
#[tokio::test]
async fn test_failed_redeem_leaves_grant_untouched() {
    let store = InMemoryGrantStore::new();
    let now = Utc::now();
    let handle = store
        .create(code_grant(now, Duration::minutes(5)))
        .await
        .unwrap();

    let wrong_client = RedeemCondition::consume(GrantKind::AuthorizationCode, "server.code", now);
    assert!(matches!(
        store.redeem(&handle, &wrong_client).await,
        Err(Error::InvalidGrant(GrantError::ClientMismatch))
    ));

    let wrong_kind = RedeemCondition::consume(GrantKind::RefreshToken, "native.code", now);
    assert!(matches!(
        store.redeem(&handle, &wrong_kind).await,
        Err(Error::InvalidGrant(GrantError::KindMismatch))
    ));

    let grant = store.get(&handle).await.unwrap().unwrap();
    assert!(!grant.is_consumed());
}

/// 测试滑动过期：顺延但不超过绝对有效期
#[tokio::test]
async fn test_reuse_sliding_expiration() {
    let store = InMemoryGrantStore::new();
    let now = Utc::now();
    let absolute = Duration::days(30);
    let sliding = Duration::days(15);

    let fresh = store
        .create(
            NewGrant::new(GrantKind::RefreshToken, "server.code", now - Duration::days(1), absolute)
                .with_subject(Some("alice".to_string())),
        )
        .await
        .unwrap();
    let condition = RedeemCondition::reuse(
        GrantKind::RefreshToken,
        "server.code",
        Some(sliding),
        absolute,
        now,
    );
    let redeemed = store.redeem(&fresh, &condition).await.unwrap();
    assert_eq!(redeemed.expires_at, now + sliding);
    assert!(!redeemed.is_consumed());

    let old_created = now - Duration::days(25);
    let old = store
        .create(
            NewGrant::new(GrantKind::RefreshToken, "server.code", old_created, absolute)
                .with_subject(Some("alice".to_string())),
        )
        .await
        .unwrap();
    let redeemed = store.redeem(&old, &condition).await.unwrap();
    assert_eq!(redeemed.expires_at, old_created + absolute);

    // 可以重复兑换
    assert!(store.redeem(&old, &condition).await.is_ok());
}

/// 测试按用户和客户端撤销
#[tokio::test]
async fn test_revoke_all_by_kind() {
    let store = InMemoryGrantStore::new();
    let now = Utc::now();
    let refresh = |client: &str| {
        NewGrant::new(GrantKind::RefreshToken, client, now, Duration::days(1))
            .with_subject(Some("alice".to_string()))
    };

    store.create(refresh("server.code")).await.unwrap();
    store.create(refresh("server.code")).await.unwrap();
    store.create(refresh("native.code")).await.unwrap();
    store
        .create(
            NewGrant::new(GrantKind::UserConsent, "server.code", now, Duration::days(1))
                .with_subject(Some("alice".to_string())),
        )
        .await
        .unwrap();

    let revoked = store
        .revoke_all("alice", "server.code", Some(GrantKind::RefreshToken))
        .await
        .unwrap();
    assert_eq!(revoked, 2);
    assert_eq!(store.count().await.unwrap(), 2);
    assert_eq!(
        store
            .find("alice", "server.code", GrantKind::UserConsent)
            .await
            .unwrap()
            .len(),
        1
    );
}

/// 测试并发替换授权同意：最后只剩一条记录，读者总能看到一条
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_replace_keeps_single_consent() {
    let store = Arc::new(InMemoryGrantStore::new());
    let now = Utc::now();
    let consent = move || {
        NewGrant::new(GrantKind::UserConsent, "server.code", now, Duration::days(1))
            .with_subject(Some("alice".to_string()))
            .with_scopes(vec!["openid".to_string()])
    };
    store.create(consent()).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..50 {
                store.replace(consent()).await.unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    let reader = {
        let store = store.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                let found = store
                    .find("alice", "server.code", GrantKind::UserConsent)
                    .await
                    .unwrap();
                assert_eq!(found.len(), 1);
                tokio::task::yield_now().await;
            }
        })
    };

    for task in tasks {
        task.await.unwrap();
    }
    reader.await.unwrap();
    assert_eq!(store.count().await.unwrap(), 1);
}

// ============================================================================
// 超时
// ============================================================================

/// 每个操作都很慢的存储
struct SlowStore {
    inner: InMemoryGrantStore,
    delay: std::time::Duration,
}

#[async_trait]
impl GrantStore for SlowStore {
    async fn create(&self, grant: NewGrant) -> Result<String> {
        tokio::time::sleep(self.delay).await;
        self.inner.create(grant).await
    }

    async fn get(&self, handle: &str) -> Result<Option<PersistedGrant>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(handle).await
    }

    async fn redeem(&self, handle: &str, condition: &RedeemCondition) -> Result<PersistedGrant> {
        tokio::time::sleep(self.delay).await;
        self.inner.redeem(handle, condition).await
    }

    async fn revoke(&self, handle: &str) -> Result<bool> {
        self.inner.revoke(handle).await
    }

    async fn revoke_all(
        &self,
        subject_id: &str,
        client_id: &str,
        kind: Option<GrantKind>,
    ) -> Result<usize> {
        self.inner.revoke_all(subject_id, client_id, kind).await
    }

    async fn replace(&self, grant: NewGrant) -> Result<(String, usize)> {
        tokio::time::sleep(self.delay).await;
        self.inner.replace(grant).await
    }

    async fn revoke_family(&self, family_id: &str) -> Result<usize> {
        self.inner.revoke_family(family_id).await
    }

    async fn find(
        &self,
        subject_id: &str,
        client_id: &str,
        kind: GrantKind,
    ) -> Result<Vec<PersistedGrant>> {
        self.inner.find(subject_id, client_id, kind).await
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        tokio::time::sleep(self.delay).await;
        self.inner.sweep_expired(now).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
}

/// 测试存储超时返回 Timeout，且可重试
#[tokio::test]
async fn test_timed_store_reports_timeout() {
    let slow = Arc::new(SlowStore {
        inner: InMemoryGrantStore::new(),
        delay: std::time::Duration::from_millis(200),
    });
    let timed = TimedGrantStore::new(slow, std::time::Duration::from_millis(10));

    let err = timed
        .create(code_grant(Utc::now(), Duration::minutes(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(err.is_retryable());
}
