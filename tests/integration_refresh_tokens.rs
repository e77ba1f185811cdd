//! 集成测试：刷新令牌
//!
//! 测试一次性刷新令牌的轮换与重放检测、可复用刷新令牌的滑动过期以及 scope 收窄。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oidcrs::grant::{
    GrantKind, GrantStore, InMemoryGrantStore, NewGrant, PersistedGrant, RedeemCondition,
};
use oidcrs::oauth::{Client, GrantType, Secret, TokenExpiration, TokenUsage};
use oidcrs::registry::demo_seed_data;
use oidcrs::{
    AuthorizeRequest, Error, GrantError, IdentityServer, Result, RevocationRequest,
    ServerOptions, Subject, TokenRequest,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const REDIRECT_URI: &str = "https://notused";

fn refresh_client(client_id: &str, usage: TokenUsage, expiration: TokenExpiration) -> Client {
    Client::builder(client_id)
        .grant_type(GrantType::AuthorizationCode)
        .secret(Secret::sha256("secret"))
        .redirect_uri(REDIRECT_URI)
        .scopes(["openid", "profile", "api"])
        .allow_offline_access(true)
        .refresh_token_usage(usage)
        .refresh_token_expiration(expiration)
        .sliding_refresh_token_lifetime(600)
        .absolute_refresh_token_lifetime(3600)
        .build()
        .unwrap()
}

fn server() -> IdentityServer {
    server_with_store(Arc::new(InMemoryGrantStore::new()))
}

fn server_with_store(store: Arc<dyn GrantStore>) -> IdentityServer {
    let mut seed = demo_seed_data().unwrap();
    seed.clients.push(refresh_client(
        "rotating",
        TokenUsage::OneTimeOnly,
        TokenExpiration::Absolute,
    ));
    seed.clients.push(refresh_client(
        "sliding",
        TokenUsage::ReUse,
        TokenExpiration::Sliding,
    ));
    IdentityServer::builder(ServerOptions::new("https://id.test"))
        .seed(seed)
        .grant_store(store)
        .build()
        .unwrap()
}

/// 走一遍授权码流程，返回刷新令牌
async fn initial_refresh_token(server: &IdentityServer, client_id: &str, scope: &str) -> String {
    let request = AuthorizeRequest::new("code", client_id, REDIRECT_URI).with_scope(scope);
    let code = server
        .authorize(&request, &Subject::new("alice", Utc::now()))
        .await
        .unwrap()
        .code
        .unwrap();

    server
        .token(&TokenRequest::authorization_code(client_id, &code, REDIRECT_URI).with_secret("secret"))
        .await
        .unwrap()
        .refresh_token
        .unwrap()
}

fn refresh(client_id: &str, token: &str) -> TokenRequest {
    TokenRequest::refresh_token(client_id, token).with_secret("secret")
}

/// 测试没有 offline_access 时不签发刷新令牌
#[tokio::test]
async fn test_refresh_token_requires_offline_access() {
    let server = server();
    let request = AuthorizeRequest::new("code", "rotating", REDIRECT_URI).with_scope("openid api");
    let code = server
        .authorize(&request, &Subject::new("alice", Utc::now()))
        .await
        .unwrap()
        .code
        .unwrap();
    let tokens = server
        .token(&TokenRequest::authorization_code("rotating", &code, REDIRECT_URI).with_secret("secret"))
        .await
        .unwrap();
    assert!(tokens.refresh_token.is_none());
}

/// 测试一次性刷新令牌：每次使用都轮换，旧令牌重放时撤销整条链
#[tokio::test]
async fn test_rotation_and_replay_detection() {
    let server = server();
    let first = initial_refresh_token(&server, "rotating", "openid api offline_access").await;

    let second = server
        .token(&refresh("rotating", &first))
        .await
        .unwrap()
        .refresh_token
        .unwrap();
    let third = server
        .token(&refresh("rotating", &second))
        .await
        .unwrap()
        .refresh_token
        .unwrap();
    assert_ne!(first, second);
    assert_ne!(second, third);

    // 重放第一个令牌
    assert!(matches!(
        server.token(&refresh("rotating", &first)).await,
        Err(Error::InvalidGrant(GrantError::ReplayDetected))
    ));

    // 链上最新的令牌也失效了
    assert!(matches!(
        server.token(&refresh("rotating", &third)).await,
        Err(Error::InvalidGrant(GrantError::NotFound))
    ));
}

/// 测试轮换后的刷新令牌保留原始创建时间
#[tokio::test]
async fn test_rotation_keeps_absolute_lifetime() {
    let server = server();
    let first = initial_refresh_token(&server, "rotating", "openid api offline_access").await;
    let grants = &server.context().grants;
    let original = grants.get(&first).await.unwrap().unwrap();

    let second = server
        .token(&refresh("rotating", &first))
        .await
        .unwrap()
        .refresh_token
        .unwrap();
    let rotated = grants.get(&second).await.unwrap().unwrap();

    assert_eq!(rotated.created_at, original.created_at);
    assert_eq!(rotated.expires_at, original.expires_at);
}

/// 测试可复用刷新令牌的滑动过期
#[tokio::test]
async fn test_reuse_with_sliding_expiration() {
    let server = server();
    let handle = initial_refresh_token(&server, "sliding", "openid api offline_access").await;
    let grants = &server.context().grants;

    let before = grants.get(&handle).await.unwrap().unwrap();
    assert!(before.expires_at <= before.created_at + Duration::seconds(600));

    let started = Utc::now();
    let tokens = server.token(&refresh("sliding", &handle)).await.unwrap();
    assert_eq!(tokens.refresh_token.as_deref(), Some(handle.as_str()));

    let after = grants.get(&handle).await.unwrap().unwrap();
    assert!(after.expires_at >= started + Duration::seconds(599));
    assert!(after.expires_at <= after.created_at + Duration::seconds(3600));
    assert!(!after.is_consumed());

    // 同一个令牌可以再次使用
    assert!(server.token(&refresh("sliding", &handle)).await.is_ok());
}

/// 测试刷新时收窄 scope
#[tokio::test]
async fn test_refresh_scope_narrowing() {
    let server = server();
    let first = initial_refresh_token(&server, "rotating", "openid profile api offline_access").await;

    let narrowed = server
        .token(&refresh("rotating", &first).with_scope("api offline_access"))
        .await
        .unwrap();
    assert_eq!(narrowed.scope, "api offline_access");
    assert!(narrowed.id_token.is_none());

    let next = narrowed.refresh_token.unwrap();
    let widened = server
        .token(&refresh("rotating", &next).with_scope("api profile"))
        .await;
    assert!(matches!(widened, Err(Error::InvalidScope(_))));

    // 去掉 offline_access 后不再签发刷新令牌
    let last = server
        .token(&refresh("rotating", &next).with_scope("api"))
        .await
        .unwrap();
    assert!(last.refresh_token.is_none());
}

/// 测试刷新令牌属于其他客户端
#[tokio::test]
async fn test_refresh_token_client_mismatch() {
    let server = server();
    let token = initial_refresh_token(&server, "rotating", "openid api offline_access").await;

    assert!(matches!(
        server.token(&refresh("sliding", &token)).await,
        Err(Error::InvalidGrant(GrantError::ClientMismatch))
    ));
    // 失败的尝试不影响原令牌
    assert!(server.token(&refresh("rotating", &token)).await.is_ok());
}

/// 测试撤销刷新令牌
#[tokio::test]
async fn test_revoke_refresh_token() {
    let server = server();
    let token = initial_refresh_token(&server, "sliding", "openid api offline_access").await;

    let revocation = RevocationRequest::new("sliding", &token).with_secret("secret");
    assert!(server.revoke(&revocation).await.unwrap());

    assert!(matches!(
        server.token(&refresh("sliding", &token)).await,
        Err(Error::InvalidGrant(GrantError::NotFound))
    ));
}

/// 测试并发使用同一个一次性刷新令牌：恰好一个成功，整条链被撤销，其他会话不受影响
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refresh_revokes_chain() {
    let server = server();

    for _ in 0..10 {
        let token = initial_refresh_token(&server, "rotating", "openid api offline_access").await;
        let other_session =
            initial_refresh_token(&server, "rotating", "openid api offline_access").await;

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let server = server.clone();
                let token = token.clone();
                tokio::spawn(async move { server.token(&refresh("rotating", &token)).await })
            })
            .collect();

        let mut winners = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(response) => winners.push(response),
                Err(Error::InvalidGrant(GrantError::ReplayDetected)) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners.len(), 1);

        // 胜出方拿到的新刷新令牌与原令牌同属一条链，也已被撤销
        let rotated = winners.remove(0).refresh_token.unwrap();
        assert!(matches!(
            server.token(&refresh("rotating", &rotated)).await,
            Err(Error::InvalidGrant(GrantError::NotFound))
        ));
        assert!(server.token(&refresh("rotating", &other_session)).await.is_ok());
    }
}

// ============================================================================
// 存储故障
// ============================================================================

/// 可以让创建刷新令牌失败的存储
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryGrantStore,
    fail_refresh: AtomicBool,
}

#[async_trait]
impl GrantStore for FlakyStore {
    async fn create(&self, grant: NewGrant) -> Result<String> {
        if grant.kind == GrantKind::RefreshToken && self.fail_refresh.load(Ordering::SeqCst) {
            return Err(Error::Timeout(std::time::Duration::from_secs(5)));
        }
        self.inner.create(grant).await
    }

    async fn get(&self, handle: &str) -> Result<Option<PersistedGrant>> {
        self.inner.get(handle).await
    }

    async fn redeem(&self, handle: &str, condition: &RedeemCondition) -> Result<PersistedGrant> {
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
        self.inner.sweep_expired(now).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
}

/// 测试签发失败时授权码不被消耗，存储恢复后可以重试
#[tokio::test]
async fn test_failed_issuance_leaves_code_redeemable() {
    let store = Arc::new(FlakyStore::default());
    let server = server_with_store(store.clone());

    let request = AuthorizeRequest::new("code", "rotating", REDIRECT_URI)
        .with_scope("openid api offline_access");
    let code = server
        .authorize(&request, &Subject::new("alice", Utc::now()))
        .await
        .unwrap()
        .code
        .unwrap();
    let token_request =
        TokenRequest::authorization_code("rotating", &code, REDIRECT_URI).with_secret("secret");

    store.fail_refresh.store(true, Ordering::SeqCst);
    let err = server.token(&token_request).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(err.is_retryable());

    let grant = server.context().grants.get(&code).await.unwrap().unwrap();
    assert!(!grant.is_consumed());
    assert_eq!(store.count().await.unwrap(), 1);

    store.fail_refresh.store(false, Ordering::SeqCst);
    let tokens = server.token(&token_request).await.unwrap();
    assert!(tokens.refresh_token.is_some());
}

/// 测试轮换失败时旧刷新令牌仍然有效
#[tokio::test]
async fn test_failed_rotation_keeps_refresh_token() {
    let store = Arc::new(FlakyStore::default());
    let server = server_with_store(store.clone());
    let token = initial_refresh_token(&server, "rotating", "openid api offline_access").await;

    store.fail_refresh.store(true, Ordering::SeqCst);
    assert!(matches!(
        server.token(&refresh("rotating", &token)).await,
        Err(Error::Timeout(_))
    ));
    let grant = server.context().grants.get(&token).await.unwrap().unwrap();
    assert!(!grant.is_consumed());

    store.fail_refresh.store(false, Ordering::SeqCst);
    let rotated = server
        .token(&refresh("rotating", &token))
        .await
        .unwrap()
        .refresh_token
        .unwrap();
    assert_ne!(rotated, token);
}
