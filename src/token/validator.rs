//! 令牌验证与内省
//!
//! JWT 访问令牌是自验证的：只检查签名、签发者和过期时间，不需要查询注册表。
//! 引用令牌则必须在 grant 存储中查找，撤销后立即失效。
//! 在本地验证令牌的资源服务器应使用 [`TokenValidator::validate_access_token_for_audience`]，
//! 它额外要求令牌受众包含该资源。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result, TokenError};
use crate::grant::model::GrantKind;
use crate::grant::store::GrantStore;
use crate::oauth::introspection::IntrospectionResponse;
use crate::registry::resource::ApiResource;
use crate::token::issuer::{AccessTokenClaims, IdentityTokenClaims};
use crate::token::jwt::{JwtValidator, JwtValidatorConfig};
use crate::token::signing::KeyRing;

/// 访问令牌的两种表示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTokenFormat {
    /// 自包含 JWT
    Jwt,
    /// 引用句柄
    Reference,
}

impl AccessTokenFormat {
    /// 根据形状判断：JWT 由三段组成，句柄是单段 base64url
    pub fn detect(token: &str) -> Self {
        if token.split('.').count() == 3 {
            AccessTokenFormat::Jwt
        } else {
            AccessTokenFormat::Reference
        }
    }
}

/// 令牌验证器
#[derive(Clone)]
pub struct TokenValidator {
    issuer: String,
    jwt: JwtValidator,
    grants: Arc<dyn GrantStore>,
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl TokenValidator {
    /// 创建验证器
    pub fn new(issuer: impl Into<String>, keys: Arc<KeyRing>, grants: Arc<dyn GrantStore>) -> Self {
        let issuer = issuer.into();
        let jwt = JwtValidator::with_config(keys, JwtValidatorConfig::new().with_issuer(&issuer));
        Self {
            issuer,
            jwt,
            grants,
        }
    }

    /// 验证访问令牌（JWT 或引用令牌）
    pub async fn validate_access_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessTokenClaims> {
        match AccessTokenFormat::detect(token) {
            AccessTokenFormat::Jwt => self.jwt.validate(token),
            AccessTokenFormat::Reference => self.validate_reference_token(token, now).await,
        }
    }

    /// 验证访问令牌，并要求受众包含 `audience`
    pub async fn validate_access_token_for_audience(
        &self,
        token: &str,
        audience: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessTokenClaims> {
        let claims = self.validate_access_token(token, now).await?;
        if !claims.has_audience(audience) {
            return Err(Error::Token(TokenError::InvalidClaim(format!(
                "token was not issued for audience '{}'",
                audience
            ))));
        }
        Ok(claims)
    }

    async fn validate_reference_token(
        &self,
        handle: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessTokenClaims> {
        let grant = self
            .grants
            .get(handle)
            .await?
            .filter(|g| g.kind == GrantKind::ReferenceToken)
            .ok_or(Error::Token(TokenError::NotActive))?;

        if grant.is_expired(now) {
            return Err(Error::Token(TokenError::Expired));
        }
        grant.payload()
    }

    /// 验证身份令牌，受众必须是指定客户端
    pub fn validate_identity_token(&self, token: &str, client_id: &str) -> Result<IdentityTokenClaims> {
        let config = self.jwt.config().clone().with_audience(client_id);
        self.jwt.validate_with(token, &config)
    }

    /// 为已认证的 API 资源内省访问令牌
    ///
    /// 任何验证失败、或令牌受众不包含该 API 时返回 `active: false`。
    /// 只有存储错误会作为 `Err` 返回。
    pub async fn introspect(
        &self,
        token: &str,
        api: &ApiResource,
        now: DateTime<Utc>,
    ) -> Result<IntrospectionResponse> {
        let claims = match self
            .validate_access_token_for_audience(token, &api.name, now)
            .await
        {
            Ok(claims) => claims,
            Err(Error::Token(e)) => {
                debug!(api = %api.name, reason = %e, "introspected token is not active");
                return Ok(IntrospectionResponse::inactive());
            }
            Err(e) => return Err(e),
        };

        let scopes: Vec<&str> = claims
            .scope
            .iter()
            .filter(|s| api.scopes.contains(s))
            .map(String::as_str)
            .collect();

        let mut response = IntrospectionResponse::active()
            .scopes(&scopes)
            .client_id(&claims.client_id)
            .exp(claims.exp)
            .iat(claims.iat)
            .nbf(claims.nbf)
            .sub(claims.sub.clone())
            .aud(claims.aud.clone())
            .iss(&claims.iss)
            .jti(&claims.jti);
        for (name, value) in &claims.extra {
            response = response.claim(name, value);
        }
        Ok(response.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grant::store::InMemoryGrantStore;
    use crate::oauth::client::{AccessTokenType, Client, GrantType, Secret};
    use crate::pipeline::request::Subject;
    use crate::registry::resource::{IdentityResource, ResourceRegistry, ScopePolicy};
    use crate::token::issuer::{IssueRequest, TokenFlow, TokenIssuer};
    use crate::token::signing::SigningKey;

    const ISSUER: &str = "https://id.test";

    struct Fixture {
        issuer: TokenIssuer,
        validator: TokenValidator,
        store: Arc<InMemoryGrantStore>,
        registry: ResourceRegistry,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryGrantStore::new());
        let keys = Arc::new(KeyRing::new(SigningKey::generate("k1").unwrap()));
        let registry = ResourceRegistry::new(
            vec![IdentityResource::openid()],
            vec![
                ApiResource::new("api", "API"),
                ApiResource::new("other", "Other API"),
            ],
            ScopePolicy::Strict,
        )
        .unwrap();
        Fixture {
            issuer: TokenIssuer::new(ISSUER, keys.clone(), store.clone()),
            validator: TokenValidator::new(ISSUER, keys, store.clone()),
            store,
            registry,
        }
    }

    fn client(token_type: AccessTokenType) -> Arc<Client> {
        Arc::new(
            Client::builder("svc")
                .secret(Secret::sha256("secret"))
                .grant_type(GrantType::ClientCredentials)
                .scope("api")
                .access_token_type(token_type)
                .build()
                .unwrap(),
        )
    }

    async fn issue(f: &Fixture, token_type: AccessTokenType) -> String {
        let resources = f.registry.resolve_scopes(&["api".to_string()]).unwrap();
        f.issuer
            .issue(IssueRequest::new(
                client(token_type),
                TokenFlow::ClientCredentials,
                resources,
                Utc::now(),
            ))
            .await
            .unwrap()
            .access_token
            .unwrap()
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(AccessTokenFormat::detect("a.b.c"), AccessTokenFormat::Jwt);
        assert_eq!(
            AccessTokenFormat::detect("AbCdEf-_0123"),
            AccessTokenFormat::Reference
        );
    }

    #[tokio::test]
    async fn test_jwt_access_token() {
        let f = fixture();
        let token = issue(&f, AccessTokenType::Jwt).await;
        let claims = f.validator.validate_access_token(&token, Utc::now()).await.unwrap();
        assert_eq!(claims.client_id, "svc");
        assert!(claims.sub.is_none());
    }

    #[tokio::test]
    async fn test_access_token_audience() {
        let f = fixture();
        for token_type in [AccessTokenType::Jwt, AccessTokenType::Reference] {
            let token = issue(&f, token_type).await;
            let claims = f
                .validator
                .validate_access_token_for_audience(&token, "api", Utc::now())
                .await
                .unwrap();
            assert!(claims.has_audience("api"));

            assert!(matches!(
                f.validator
                    .validate_access_token_for_audience(&token, "other", Utc::now())
                    .await,
                Err(Error::Token(TokenError::InvalidClaim(_)))
            ));
        }
    }

    #[tokio::test]
    async fn test_reference_token_revocation() {
        let f = fixture();
        let token = issue(&f, AccessTokenType::Reference).await;

        let claims = f.validator.validate_access_token(&token, Utc::now()).await.unwrap();
        assert!(claims.has_scope("api"));

        assert!(f.store.revoke(&token).await.unwrap());
        assert!(matches!(
            f.validator.validate_access_token(&token, Utc::now()).await,
            Err(Error::Token(TokenError::NotActive))
        ));
    }

    #[tokio::test]
    async fn test_reference_token_expiry() {
        let f = fixture();
        let token = issue(&f, AccessTokenType::Reference).await;
        let later = Utc::now() + chrono::Duration::hours(2);
        assert!(matches!(
            f.validator.validate_access_token(&token, later).await,
            Err(Error::Token(TokenError::Expired))
        ));
    }

    #[tokio::test]
    async fn test_introspection_audience() {
        let f = fixture();
        let token = issue(&f, AccessTokenType::Jwt).await;

        let api = f.registry.find_api_resource("api").unwrap();
        let response = f.validator.introspect(&token, &api, Utc::now()).await.unwrap();
        assert!(response.active);
        assert!(response.has_scope("api"));
        assert_eq!(response.client_id.as_deref(), Some("svc"));

        let other = f.registry.find_api_resource("other").unwrap();
        let response = f.validator.introspect(&token, &other, Utc::now()).await.unwrap();
        assert!(!response.active);

        let response = f.validator.introspect("garbage", &api, Utc::now()).await.unwrap();
        assert!(!response.active);
    }

    #[tokio::test]
    async fn test_identity_token_audience() {
        let f = fixture();
        let web = Arc::new(
            Client::builder("web")
                .grant_type(GrantType::Implicit)
                .redirect_uri("https://web.test/cb")
                .scope("openid")
                .allow_access_tokens_via_browser(true)
                .build()
                .unwrap(),
        );
        let resources = f.registry.resolve_scopes(&["openid".to_string()]).unwrap();
        let issued = f
            .issuer
            .issue(
                IssueRequest::new(web, TokenFlow::Implicit, resources, Utc::now())
                    .with_subject(Subject::new("alice", Utc::now()))
                    .with_nonce(Some("n".into())),
            )
            .await
            .unwrap();
        let id_token = issued.identity_token.unwrap();

        let claims = f.validator.validate_identity_token(&id_token, "web").unwrap();
        assert_eq!(claims.sub, "alice");
        assert!(matches!(
            f.validator.validate_identity_token(&id_token, "mobile"),
            Err(Error::Token(TokenError::InvalidClaim(_)))
        ));
    }
}
