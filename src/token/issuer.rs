//! 令牌签发
//!
//! [`TokenIssuer`] 根据已经通过校验的请求上下文（客户端、用户、解析后的资源、流程）
//! 生成访问令牌、身份令牌和刷新令牌。它本身不做协议校验，也不重试存储操作：
//! 任何一步失败都会直接返回错误，并撤销本次已经写入的 grant。
//!
//! Token 端点先签发、后兑换：签发结果中记录了本次写入的 grant，兑换失败时用
//! [`TokenIssuer::discard`] 撤销它们。
//!
//! 签发顺序固定：
//!
//! 1. 取当前签名密钥（没有则 `SigningKeyUnavailable`，此时不写入任何 grant）
//! 2. 访问令牌（JWT，或写入 `ReferenceToken` grant 的引用句柄）
//! 3. 身份令牌
//! 4. 刷新令牌（写入 `RefreshToken` grant）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::grant::model::{GrantKind, NewGrant, expires_after};
use crate::grant::store::GrantStore;
use crate::oauth::client::{AccessTokenType, Client};
use crate::oauth::token::TokenResponse;
use crate::pipeline::request::Subject;
use crate::random::generate_random_hex;
use crate::registry::resource::Resources;
use crate::token::jwt::{left_half_hash, one_or_many, sign};
use crate::token::signing::KeyRing;

/// 签发令牌的流程
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenFlow {
    /// 授权码
    AuthorizationCode,
    /// 混合模式
    Hybrid,
    /// 隐式授权
    Implicit,
    /// 客户端凭证
    ClientCredentials,
    /// 刷新令牌（只可能来自交互式流程）
    RefreshToken,
}

impl TokenFlow {
    /// 是否有用户参与
    pub fn is_interactive(&self) -> bool {
        !matches!(self, TokenFlow::ClientCredentials)
    }

    /// 是否可以签发刷新令牌
    pub fn supports_refresh(&self) -> bool {
        matches!(
            self,
            TokenFlow::AuthorizationCode | TokenFlow::Hybrid | TokenFlow::RefreshToken
        )
    }

    /// 名称
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenFlow::AuthorizationCode => "authorization_code",
            TokenFlow::Hybrid => "hybrid",
            TokenFlow::Implicit => "implicit",
            TokenFlow::ClientCredentials => "client_credentials",
            TokenFlow::RefreshToken => "refresh_token",
        }
    }
}

impl std::fmt::Display for TokenFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Claims
// ============================================================================

/// 访问令牌 claims
///
/// JWT 访问令牌直接编码这些字段；引用令牌把它们保存在 grant 负载中。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// 签发者
    pub iss: String,
    /// 受众（API 资源名称）
    #[serde(with = "one_or_many")]
    pub aud: Vec<String>,
    /// 客户端 ID
    pub client_id: String,
    /// 用户
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// 授予的 scope
    pub scope: Vec<String>,
    /// 签发时间
    pub iat: i64,
    /// 生效时间
    pub nbf: i64,
    /// 过期时间
    pub exp: i64,
    /// 令牌 ID
    pub jti: String,
    /// 用户认证时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<i64>,
    /// 身份提供者
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idp: Option<String>,
    /// API 资源要求的用户 claim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl AccessTokenClaims {
    /// 是否包含某个 scope
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.iter().any(|s| s == scope)
    }

    /// 是否面向某个受众
    pub fn has_audience(&self, audience: &str) -> bool {
        self.aud.iter().any(|a| a == audience)
    }
}

/// 身份令牌 claims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityTokenClaims {
    /// 签发者
    pub iss: String,
    /// 受众（客户端 ID）
    pub aud: String,
    /// 用户
    pub sub: String,
    /// 签发时间
    pub iat: i64,
    /// 生效时间
    pub nbf: i64,
    /// 过期时间
    pub exp: i64,
    /// 客户端传入的 nonce
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// 用户认证时间
    pub auth_time: i64,
    /// 身份提供者
    pub idp: String,
    /// 访问令牌哈希
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_hash: Option<String>,
    /// 授权码哈希
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c_hash: Option<String>,
    /// 用户 claim（限于授予的身份资源）
    #[serde(flatten)]
    pub claims: BTreeMap<String, serde_json::Value>,
}

/// 刷新令牌 grant 的负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshTokenPayload {
    /// 用户
    pub subject: Subject,
}

/// 默认访问令牌受众（没有 API 资源时）
pub fn resources_audience(issuer: &str) -> String {
    format!("{}/resources", issuer.trim_end_matches('/'))
}

// ============================================================================
// 请求与结果
// ============================================================================

/// 签发请求
#[derive(Debug, Clone)]
pub struct IssueRequest {
    /// 客户端
    pub client: Arc<Client>,
    /// 用户（客户端凭证没有用户）
    pub subject: Option<Subject>,
    /// 授予的资源
    pub resources: Resources,
    /// 流程
    pub flow: TokenFlow,
    /// 是否签发访问令牌
    pub access_token: bool,
    /// 是否签发身份令牌（仍然要求 `openid`）
    pub identity_token: bool,
    /// 是否允许签发刷新令牌
    pub refresh_token: bool,
    /// nonce
    pub nonce: Option<String>,
    /// 同一响应中的授权码（用于 `c_hash`）
    pub code: Option<String>,
    /// 沿用的刷新令牌句柄（ReUse）
    pub reuse_refresh_handle: Option<String>,
    /// 刷新令牌轮换时沿用的最初创建时间
    pub refresh_created_at: Option<DateTime<Utc>>,
    /// 刷新令牌轮换时沿用的链标识
    pub refresh_family: Option<String>,
    /// 当前时间
    pub now: DateTime<Utc>,
}

impl IssueRequest {
    /// 创建请求：默认签发访问令牌，条件满足时签发身份令牌和刷新令牌
    pub fn new(client: Arc<Client>, flow: TokenFlow, resources: Resources, now: DateTime<Utc>) -> Self {
        Self {
            client,
            subject: None,
            resources,
            flow,
            access_token: true,
            identity_token: true,
            refresh_token: true,
            nonce: None,
            code: None,
            reuse_refresh_handle: None,
            refresh_created_at: None,
            refresh_family: None,
            now,
        }
    }

    /// 设置用户
    pub fn with_subject(mut self, subject: Subject) -> Self {
        self.subject = Some(subject);
        self
    }

    /// 设置 nonce
    pub fn with_nonce(mut self, nonce: Option<String>) -> Self {
        self.nonce = nonce;
        self
    }

    /// 设置同一响应中的授权码
    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    /// 选择要签发的令牌
    pub fn with_tokens(mut self, access_token: bool, identity_token: bool) -> Self {
        self.access_token = access_token;
        self.identity_token = identity_token;
        self
    }

    /// 不签发刷新令牌（前端通道）
    pub fn without_refresh_token(mut self) -> Self {
        self.refresh_token = false;
        self
    }

    /// 沿用已有刷新令牌句柄
    pub fn reuse_refresh_token(mut self, handle: impl Into<String>) -> Self {
        self.reuse_refresh_handle = Some(handle.into());
        self
    }

    /// 轮换刷新令牌时保留最初的创建时间，绝对有效期从它开始计算
    pub fn with_refresh_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.refresh_created_at = Some(created_at);
        self
    }

    /// 轮换刷新令牌时沿用原来的链
    pub fn with_refresh_family(mut self, family_id: Option<String>) -> Self {
        self.refresh_family = family_id;
        self
    }

    fn wants_identity_token(&self) -> bool {
        self.identity_token
            && self.flow.is_interactive()
            && self.subject.is_some()
            && self.resources.has_openid()
    }

    fn wants_refresh_token(&self) -> bool {
        self.refresh_token
            && self.flow.supports_refresh()
            && self.subject.is_some()
            && self.client.allow_offline_access
            && self.resources.offline_access
    }
}

/// 签发结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedTokens {
    /// 访问令牌
    pub access_token: Option<String>,
    /// 访问令牌有效期（秒）
    pub access_token_lifetime: u64,
    /// 身份令牌
    pub identity_token: Option<String>,
    /// 刷新令牌
    pub refresh_token: Option<String>,
    /// 授予的 scope（空格分隔）
    pub scope: String,
    /// 本次写入存储的句柄（引用令牌、新刷新令牌）
    pub created_handles: Vec<String>,
}

impl IssuedTokens {
    /// 转换为 token 端点响应
    pub fn into_response(self) -> Result<TokenResponse> {
        let access_token = self
            .access_token
            .ok_or_else(|| Error::internal("token endpoint response without access token"))?;

        let mut response =
            TokenResponse::new(access_token, self.access_token_lifetime).with_scope(self.scope);
        if let Some(id_token) = self.identity_token {
            response = response.with_id_token(id_token);
        }
        if let Some(refresh_token) = self.refresh_token {
            response = response.with_refresh_token(refresh_token);
        }
        Ok(response)
    }
}

// ============================================================================
// 签发器
// ============================================================================

/// 令牌签发器
#[derive(Clone)]
pub struct TokenIssuer {
    issuer: String,
    keys: Arc<KeyRing>,
    grants: Arc<dyn GrantStore>,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    /// 创建签发器
    pub fn new(issuer: impl Into<String>, keys: Arc<KeyRing>, grants: Arc<dyn GrantStore>) -> Self {
        Self {
            issuer: issuer.into(),
            keys,
            grants,
        }
    }

    /// 签发者标识
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// 密钥环
    pub fn keys(&self) -> &Arc<KeyRing> {
        &self.keys
    }

    /// 签发令牌
    pub async fn issue(&self, request: IssueRequest) -> Result<IssuedTokens> {
        let key = self.keys.current()?;
        let client = &request.client;

        let mut created = Vec::new();
        let access_token = if request.access_token {
            let claims = self.access_token_claims(&request)?;
            match client.access_token_type {
                AccessTokenType::Jwt => Some(sign(&key, &claims)?),
                AccessTokenType::Reference => {
                    let grant = NewGrant::new(
                        GrantKind::ReferenceToken,
                        &client.client_id,
                        request.now,
                        client.access_token_ttl(),
                    )
                    .with_subject(claims.sub.clone())
                    .with_scopes(claims.scope.clone())
                    .with_payload(&claims)?;
                    let handle = self.grants.create(grant).await?;
                    created.push(handle.clone());
                    Some(handle)
                }
            }
        } else {
            None
        };

        let (identity_token, refresh_token) =
            match self.finish(&request, &key, access_token.as_deref()).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    self.revoke_created(&created, &client.client_id).await;
                    return Err(e);
                }
            };
        if let Some(handle) = &refresh_token {
            if request.reuse_refresh_handle.as_ref() != Some(handle) {
                created.push(handle.clone());
            }
        }

        debug!(client_id = %client.client_id, flow = %request.flow, "tokens issued");
        Ok(IssuedTokens {
            access_token,
            access_token_lifetime: client.access_token_lifetime,
            identity_token,
            refresh_token,
            scope: request.resources.scope_string(),
            created_handles: created,
        })
    }

    /// 撤销一次签发写入的 grant，用于签发之后的兑换失败
    ///
    /// 撤销失败只记录日志：这些句柄从未交给客户端，最终会被清理任务删除。
    pub async fn discard(&self, issued: &IssuedTokens, client_id: &str) {
        self.revoke_created(&issued.created_handles, client_id).await;
    }

    async fn revoke_created(&self, handles: &[String], client_id: &str) {
        for handle in handles {
            if let Err(e) = self.grants.revoke(handle).await {
                warn!(error = %e, client_id = %client_id, "failed to roll back issued grant");
            }
        }
    }

    async fn finish(
        &self,
        request: &IssueRequest,
        key: &crate::token::signing::SigningKey,
        access_token: Option<&str>,
    ) -> Result<(Option<String>, Option<String>)> {
        let identity_token = if request.wants_identity_token() {
            let claims = self.identity_token_claims(request, access_token)?;
            Some(sign(key, &claims)?)
        } else {
            None
        };

        let refresh_token = if request.wants_refresh_token() {
            Some(self.refresh_token(request).await?)
        } else {
            None
        };

        Ok((identity_token, refresh_token))
    }

    fn access_token_claims(&self, request: &IssueRequest) -> Result<AccessTokenClaims> {
        let client = &request.client;
        let now = request.now;

        let mut aud: Vec<String> = request
            .resources
            .audiences()
            .into_iter()
            .map(str::to_string)
            .collect();
        if aud.is_empty() {
            aud.push(resources_audience(&self.issuer));
        }

        let mut extra = BTreeMap::new();
        if let Some(subject) = &request.subject {
            let wanted = request.resources.api_claim_types();
            for (name, value) in &subject.claims {
                if wanted.contains(name.as_str()) {
                    extra.insert(name.clone(), value.clone());
                }
            }
        }

        Ok(AccessTokenClaims {
            iss: self.issuer.clone(),
            aud,
            client_id: client.client_id.clone(),
            sub: request.subject.as_ref().map(|s| s.subject_id.clone()),
            scope: request.resources.scopes.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires_after(now, client.access_token_ttl()).timestamp(),
            jti: generate_random_hex(16)?,
            auth_time: request.subject.as_ref().map(|s| s.auth_time.timestamp()),
            idp: request.subject.as_ref().map(|s| s.idp.clone()),
            extra,
        })
    }

    fn identity_token_claims(
        &self,
        request: &IssueRequest,
        access_token: Option<&str>,
    ) -> Result<IdentityTokenClaims> {
        let subject = request
            .subject
            .as_ref()
            .ok_or_else(|| Error::internal("identity token requires a subject"))?;
        let client = &request.client;
        let now = request.now;

        let mut claims = BTreeMap::new();
        if access_token.is_none() || client.always_include_user_claims_in_id_token {
            let wanted = request.resources.identity_claim_types();
            for (name, value) in &subject.claims {
                if name != "sub" && wanted.contains(name.as_str()) {
                    claims.insert(name.clone(), value.clone());
                }
            }
        }

        Ok(IdentityTokenClaims {
            iss: self.issuer.clone(),
            aud: client.client_id.clone(),
            sub: subject.subject_id.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires_after(now, client.identity_token_ttl()).timestamp(),
            nonce: request.nonce.clone(),
            auth_time: subject.auth_time.timestamp(),
            idp: subject.idp.clone(),
            at_hash: access_token.map(left_half_hash),
            c_hash: request.code.as_deref().map(left_half_hash),
            claims,
        })
    }

    async fn refresh_token(&self, request: &IssueRequest) -> Result<String> {
        if let Some(handle) = &request.reuse_refresh_handle {
            return Ok(handle.clone());
        }

        let client = &request.client;
        let subject = request
            .subject
            .as_ref()
            .ok_or_else(|| Error::internal("refresh token requires a subject"))?;
        let created_at = request.refresh_created_at.unwrap_or(request.now);
        let absolute = expires_after(created_at, client.absolute_refresh_token_ttl());
        let expires_at = match client.sliding_refresh_token_ttl() {
            Some(sliding) => expires_after(request.now, sliding).min(absolute),
            None => absolute,
        };

        let family_id = match &request.refresh_family {
            Some(family_id) => family_id.clone(),
            None => generate_random_hex(16)?,
        };
        let grant = NewGrant::new(
            GrantKind::RefreshToken,
            &client.client_id,
            created_at,
            client.absolute_refresh_token_ttl(),
        )
        .with_expires_at(expires_at)
        .with_subject(Some(subject.subject_id.clone()))
        .with_scopes(request.resources.scopes.clone())
        .with_family(family_id)
        .with_payload(&RefreshTokenPayload {
            subject: subject.clone(),
        })?;

        self.grants.create(grant).await
    }
}
