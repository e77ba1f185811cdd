//! Token 端点、撤销端点 (RFC 7009) 与内省端点 (RFC 7662)
//!
//! 授权码和刷新令牌都先通过只读的 `get` 做完整的预校验（类型、客户端、过期、
//! redirect_uri、PKCE、scope），然后签发令牌，最后才调用原子的 `redeem`。
//! `redeem` 是最后一次存储修改：签发失败（签名密钥缺失、存储超时）时授权码或刷新令牌
//! 保持原样，客户端可以重试；`redeem` 失败时撤销本次签发写入的 grant。
//! 并发兑换由 `redeem` 保证只有一个成功。
//!
//! 一次性刷新令牌被重复使用时，撤销它所在的整条刷新令牌链（同一个 `family_id`）。
//! 两个请求并发使用同一个刷新令牌也按重放处理：胜出的请求在兑换之前已经写入了新的
//! 刷新令牌，所以失败的一方总会把它一起撤销，胜出方只保留已签发的访问令牌。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::error::{Error, GrantError, Result};
use crate::grant::model::{GrantKind, PersistedGrant, RedeemCondition};
use crate::oauth::client::{Client, GrantType, OFFLINE_ACCESS, TokenUsage};
use crate::oauth::introspection::{IntrospectionRequest, IntrospectionResponse};
use crate::oauth::token::TokenResponse;
use crate::pipeline::EndpointContext;
use crate::pipeline::authorize::AuthorizationCodePayload;
use crate::pipeline::request::{RevocationRequest, TokenRequest};
use crate::registry::resource::Resources;
use crate::token::issuer::{IssueRequest, RefreshTokenPayload, TokenFlow};

/// Token 端点
#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    ctx: EndpointContext,
}

impl TokenEndpoint {
    /// 创建端点
    pub fn new(ctx: EndpointContext) -> Self {
        Self { ctx }
    }

    /// 处理 token 请求
    #[instrument(
        skip(self, request),
        fields(grant_type = %request.grant_type, client_id = ?request.client_id)
    )]
    pub async fn handle(&self, request: &TokenRequest) -> Result<TokenResponse> {
        let result = self.dispatch(request, Utc::now()).await;
        if let Err(e) = &result {
            debug!(error = %e, "token request rejected");
        }
        result
    }

    async fn dispatch(&self, request: &TokenRequest, now: DateTime<Utc>) -> Result<TokenResponse> {
        let client = self.authenticate_client(
            request.client_id.as_deref(),
            request.client_secret.as_deref(),
            now,
        )?;
        match request.grant_type.as_str() {
            "authorization_code" => self.authorization_code(&client, request, now).await,
            "client_credentials" => self.client_credentials(&client, request, now).await,
            "refresh_token" => self.refresh_token(&client, request, now).await,
            other => Err(Error::UnsupportedGrantType(other.to_string())),
        }
    }

    /// 客户端认证
    ///
    /// 要求密钥的客户端必须提供有效密钥；不要求密钥的客户端如果提供了密钥，也必须有效。
    pub fn authenticate_client(
        &self,
        client_id: Option<&str>,
        client_secret: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Arc<Client>> {
        let client_id =
            client_id.ok_or_else(|| Error::InvalidClient("client_id is required".to_string()))?;
        let client = self.ctx.clients.lookup(client_id)?;

        match client_secret {
            Some(secret) if client.require_client_secret || !client.secrets.is_empty() => {
                if !client.verify_secret(secret, now) {
                    return Err(Error::InvalidClient(format!(
                        "invalid secret for client '{}'",
                        client.client_id
                    )));
                }
            }
            None if client.require_client_secret => {
                return Err(Error::InvalidClient(format!(
                    "client '{}' must authenticate with a secret",
                    client.client_id
                )));
            }
            _ => {}
        }
        Ok(client)
    }

    // ========================================================================
    // authorization_code
    // ========================================================================

    async fn authorization_code(
        &self,
        client: &Arc<Client>,
        request: &TokenRequest,
        now: DateTime<Utc>,
    ) -> Result<TokenResponse> {
        if !client.allows_grant_type(GrantType::AuthorizationCode)
            && !client.allows_grant_type(GrantType::Hybrid)
        {
            return Err(Error::UnauthorizedClient(format!(
                "client '{}' may not redeem authorization codes",
                client.client_id
            )));
        }
        let code = request
            .code
            .as_deref()
            .ok_or_else(|| Error::invalid_request("missing parameter 'code'"))?;
        let redirect_uri = request
            .redirect_uri
            .as_deref()
            .ok_or_else(|| Error::invalid_request("missing parameter 'redirect_uri'"))?;

        let grant = self
            .prevalidate(code, GrantKind::AuthorizationCode, client, now)
            .await?;
        if grant.is_consumed() {
            return Err(GrantError::AlreadyConsumed.into());
        }
        let payload: AuthorizationCodePayload = grant.payload()?;

        if payload.redirect_uri != redirect_uri {
            return Err(Error::InvalidRedirectUri(redirect_uri.to_string()));
        }

        let verified = match (&payload.code_challenge, request.code_verifier.as_deref()) {
            (Some(challenge), Some(verifier)) => challenge.verify(verifier),
            (Some(_), None) | (None, Some(_)) => false,
            (None, None) => !client.require_pkce,
        };
        if !verified {
            return Err(Error::PkceMismatch);
        }

        let resources = self.ctx.resources.resolve_scopes(&grant.scopes)?;
        let issue = IssueRequest::new(client.clone(), payload.flow, resources, now)
            .with_subject(payload.subject)
            .with_nonce(payload.nonce);
        let issued = self.ctx.issuer.issue(issue).await?;

        let condition =
            RedeemCondition::consume(GrantKind::AuthorizationCode, &client.client_id, now);
        if let Err(e) = self.ctx.grants.redeem(code, &condition).await {
            self.ctx.issuer.discard(&issued, &client.client_id).await;
            return Err(e);
        }
        debug!(client_id = %client.client_id, "authorization code redeemed");

        issued.into_response()
    }

    // ========================================================================
    // client_credentials
    // ========================================================================

    async fn client_credentials(
        &self,
        client: &Arc<Client>,
        request: &TokenRequest,
        now: DateTime<Utc>,
    ) -> Result<TokenResponse> {
        if !client.allows_grant_type(GrantType::ClientCredentials) {
            return Err(Error::UnauthorizedClient(format!(
                "client '{}' may not use client credentials",
                client.client_id
            )));
        }

        let resources = self.client_credentials_scopes(client, &request.scopes)?;
        let issue = IssueRequest::new(client.clone(), TokenFlow::ClientCredentials, resources, now);
        self.ctx.issuer.issue(issue).await?.into_response()
    }

    /// 客户端凭证的 scope 策略：只允许 API scope；未请求时授予客户端允许的全部 API scope
    fn client_credentials_scopes(&self, client: &Client, requested: &[String]) -> Result<Resources> {
        let snapshot = self.ctx.resources.snapshot();

        let scopes: Vec<String> = if requested.is_empty() {
            client
                .allowed_scopes
                .iter()
                .filter(|s| snapshot.api_for_scope(s).is_some())
                .cloned()
                .collect()
        } else {
            for scope in requested {
                if scope == OFFLINE_ACCESS || snapshot.is_identity_scope(scope) {
                    return Err(Error::invalid_scope(format!(
                        "scope '{}' cannot be requested with client credentials",
                        scope
                    )));
                }
                if !client.allows_scope(scope) {
                    return Err(Error::invalid_scope(format!(
                        "scope '{}' is not allowed for client '{}'",
                        scope, client.client_id
                    )));
                }
            }
            requested.to_vec()
        };

        let resources = self.ctx.resources.resolve_scopes(&scopes)?;
        if resources.scopes.is_empty() {
            return Err(Error::invalid_scope("no valid scope requested"));
        }
        Ok(resources)
    }

    // ========================================================================
    // refresh_token
    // ========================================================================

    async fn refresh_token(
        &self,
        client: &Arc<Client>,
        request: &TokenRequest,
        now: DateTime<Utc>,
    ) -> Result<TokenResponse> {
        if !client.allow_offline_access {
            return Err(Error::UnauthorizedClient(format!(
                "client '{}' may not use refresh tokens",
                client.client_id
            )));
        }
        let handle = request
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::invalid_request("missing parameter 'refresh_token'"))?;

        let grant = self
            .prevalidate(handle, GrantKind::RefreshToken, client, now)
            .await?;
        if grant.is_consumed() {
            return Err(self.replay_detected(&grant).await);
        }
        let payload: RefreshTokenPayload = grant.payload()?;

        let scopes = if request.scopes.is_empty() {
            grant.scopes.clone()
        } else {
            if let Some(scope) = request.scopes.iter().find(|s| !grant.scopes.contains(s)) {
                return Err(Error::invalid_scope(format!(
                    "scope '{}' was not part of the original grant",
                    scope
                )));
            }
            request.scopes.clone()
        };
        let resources = self.ctx.resources.resolve_scopes(&scopes)?;

        let mut issue = IssueRequest::new(client.clone(), TokenFlow::RefreshToken, resources, now)
            .with_subject(payload.subject)
            .with_refresh_created_at(grant.created_at)
            .with_refresh_family(grant.family_id.clone());
        if client.refresh_token_usage == TokenUsage::ReUse {
            issue = issue.reuse_refresh_token(handle);
        }
        let issued = self.ctx.issuer.issue(issue).await?;

        let condition = match client.refresh_token_usage {
            TokenUsage::OneTimeOnly => {
                RedeemCondition::consume(GrantKind::RefreshToken, &client.client_id, now)
            }
            TokenUsage::ReUse => RedeemCondition::reuse(
                GrantKind::RefreshToken,
                &client.client_id,
                client.sliding_refresh_token_ttl(),
                client.absolute_refresh_token_ttl(),
                now,
            ),
        };
        match self.ctx.grants.redeem(handle, &condition).await {
            Ok(_) => issued.into_response(),
            Err(e) => {
                self.ctx.issuer.discard(&issued, &client.client_id).await;
                match e {
                    Error::InvalidGrant(GrantError::AlreadyConsumed) => {
                        Err(self.replay_detected(&grant).await)
                    }
                    e => Err(e),
                }
            }
        }
    }

    /// 已轮换的刷新令牌被再次使用：撤销它所在的整条刷新令牌链
    async fn replay_detected(&self, grant: &PersistedGrant) -> Error {
        let Some(family_id) = grant.family_id.as_deref() else {
            return GrantError::AlreadyConsumed.into();
        };
        match self.ctx.grants.revoke_family(family_id).await {
            Ok(revoked) => {
                warn!(client_id = %grant.client_id, revoked, "refresh token replay detected");
                GrantError::ReplayDetected.into()
            }
            Err(e) => e,
        }
    }

    /// 只读预校验：存在、类型、客户端、未过期
    async fn prevalidate(
        &self,
        handle: &str,
        kind: GrantKind,
        client: &Client,
        now: DateTime<Utc>,
    ) -> Result<PersistedGrant> {
        let grant = self
            .ctx
            .grants
            .get(handle)
            .await?
            .ok_or(GrantError::NotFound)?;

        if grant.kind != kind {
            return Err(GrantError::KindMismatch.into());
        }
        if grant.client_id != client.client_id {
            return Err(GrantError::ClientMismatch.into());
        }
        if grant.is_expired(now) {
            return Err(GrantError::Expired.into());
        }
        Ok(grant)
    }

    // ========================================================================
    // 撤销与内省
    // ========================================================================

    /// 撤销刷新令牌或引用令牌
    ///
    /// 返回是否真的删除了记录。未知令牌、JWT 以及属于其他客户端的令牌都返回
    /// `Ok(false)`，调用方按 RFC 7009 一律回应成功。
    #[instrument(skip(self, request), fields(client_id = ?request.client_id))]
    pub async fn revoke(&self, request: &RevocationRequest) -> Result<bool> {
        let client = self.authenticate_client(
            request.client_id.as_deref(),
            request.client_secret.as_deref(),
            Utc::now(),
        )?;

        let Some(grant) = self.ctx.grants.get(&request.token).await? else {
            debug!("revocation for unknown token ignored");
            return Ok(false);
        };
        if !matches!(grant.kind, GrantKind::RefreshToken | GrantKind::ReferenceToken) {
            return Ok(false);
        }
        if grant.client_id != client.client_id {
            warn!(owner = %grant.client_id, "client tried to revoke a token it does not own");
            return Ok(false);
        }

        let revoked = self.ctx.grants.revoke(&request.token).await?;
        debug!(kind = %grant.kind, revoked, "token revoked");
        Ok(revoked)
    }

    /// API 资源内省访问令牌
    #[instrument(skip(self, api_secret, request), fields(api = %api_name))]
    pub async fn introspect(
        &self,
        api_name: &str,
        api_secret: &str,
        request: &IntrospectionRequest,
    ) -> Result<IntrospectionResponse> {
        let now = Utc::now();
        let api = self
            .ctx
            .resources
            .find_api_resource(api_name)
            .ok_or_else(|| Error::InvalidClient(format!("unknown api resource '{}'", api_name)))?;
        if !api.verify_secret(api_secret, now) {
            return Err(Error::InvalidClient(format!(
                "invalid secret for api resource '{}'",
                api_name
            )));
        }

        self.ctx.validator.introspect(&request.token, &api, now).await
    }
}
