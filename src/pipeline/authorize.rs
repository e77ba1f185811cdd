//! 授权端点
//!
//! 校验顺序固定，任何一步失败都直接返回错误，且不会写入 grant：
//!
//! 1. response_type → 流程
//! 2. 客户端
//! 3. 客户端是否允许该授权类型
//! 4. redirect_uri 精确匹配
//! 5. response_mode
//! 6. scope（客户端允许范围 + 资源解析）
//! 7. `id_token` 需要 `openid`，前端通道身份令牌需要 nonce，`token` 需要浏览器令牌许可
//! 8. PKCE
//! 9. 用户授权同意

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::grant::model::{GrantKind, NewGrant};
use crate::oauth::client::{Client, GrantType};
use crate::oauth::pkce::{PkceCodeChallenge, PkceMethod};
use crate::pipeline::EndpointContext;
use crate::pipeline::FlowState;
use crate::pipeline::request::{AuthorizeRequest, ResponseMode, ResponseType, Subject};
use crate::registry::resource::Resources;
use crate::token::issuer::{IssueRequest, TokenFlow};

/// 用户授权同意的默认有效期
pub fn default_consent_lifetime() -> Duration {
    Duration::days(365)
}

/// 授权码 grant 的负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationCodePayload {
    /// 用户
    pub subject: Subject,
    /// 授权请求中的 redirect_uri
    pub redirect_uri: String,
    /// nonce
    #[serde(default)]
    pub nonce: Option<String>,
    /// PKCE challenge
    #[serde(default)]
    pub code_challenge: Option<PkceCodeChallenge>,
    /// 授权码所属的流程
    pub flow: TokenFlow,
}

/// 授权响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeResponse {
    /// 重定向目标
    pub redirect_uri: String,
    /// 响应模式
    pub response_mode: ResponseMode,
    /// 到达的状态
    pub flow_state: FlowState,
    /// 授权码
    pub code: Option<String>,
    /// 访问令牌
    pub access_token: Option<String>,
    /// 访问令牌有效期（秒）
    pub expires_in: Option<u64>,
    /// 身份令牌
    pub id_token: Option<String>,
    /// 授予的 scope
    pub scope: String,
    /// 原样返回的 state
    pub state: Option<String>,
}

impl AuthorizeResponse {
    /// 响应参数（按固定顺序）
    pub fn parameters(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(code) = &self.code {
            params.push(("code", code.clone()));
        }
        if let Some(id_token) = &self.id_token {
            params.push(("id_token", id_token.clone()));
        }
        if let Some(access_token) = &self.access_token {
            params.push(("access_token", access_token.clone()));
            params.push(("token_type", "Bearer".to_string()));
        }
        if let Some(expires_in) = self.expires_in {
            params.push(("expires_in", expires_in.to_string()));
        }
        params.push(("scope", self.scope.clone()));
        if let Some(state) = &self.state {
            params.push(("state", state.clone()));
        }
        params
    }

    /// 构造带有响应参数的重定向 URL
    pub fn redirect_url(&self) -> Result<String> {
        let mut url = Url::parse(&self.redirect_uri)
            .map_err(|e| Error::InvalidRedirectUri(format!("{}: {}", self.redirect_uri, e)))?;
        let params = self.parameters();

        match self.response_mode {
            ResponseMode::Query => {
                url.query_pairs_mut().extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
            }
            ResponseMode::Fragment => {
                let fragment = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())))
                    .finish();
                url.set_fragment(Some(&fragment));
            }
        }
        Ok(url.into())
    }
}

/// 授权端点
#[derive(Debug, Clone)]
pub struct AuthorizeEndpoint {
    ctx: EndpointContext,
}

impl AuthorizeEndpoint {
    /// 创建端点
    pub fn new(ctx: EndpointContext) -> Self {
        Self { ctx }
    }

    /// 处理已认证用户的授权请求
    #[instrument(
        skip(self, request, subject),
        fields(client_id = %request.client_id, response_type = %request.response_type)
    )]
    pub async fn authorize(
        &self,
        request: &AuthorizeRequest,
        subject: &Subject,
    ) -> Result<AuthorizeResponse> {
        let result = self.process(request, subject, Utc::now()).await;
        if let Err(e) = &result {
            debug!(error = %e, "authorization request rejected");
        }
        result
    }

    async fn process(
        &self,
        request: &AuthorizeRequest,
        subject: &Subject,
        now: DateTime<Utc>,
    ) -> Result<AuthorizeResponse> {
        let response_type = ResponseType::parse(&request.response_type)?;
        let client = self.ctx.clients.lookup(&request.client_id)?;

        let grant_type = response_type.grant_type();
        if !client.allows_grant_type(grant_type) {
            return Err(Error::UnauthorizedClient(format!(
                "client '{}' may not use the {} flow",
                client.client_id, grant_type
            )));
        }

        if !client.allows_redirect_uri(&request.redirect_uri) {
            return Err(Error::InvalidRedirectUri(request.redirect_uri.clone()));
        }

        let response_mode = match request.response_mode.as_deref() {
            None => response_type.default_response_mode(),
            Some(mode) => {
                let mode: ResponseMode = mode.parse()?;
                if mode == ResponseMode::Query && response_type.has_front_channel_tokens() {
                    return Err(Error::invalid_request(
                        "tokens cannot be returned in the query string",
                    ));
                }
                mode
            }
        };

        let resources = self.resolve_scopes(&client, &request.scopes)?;

        if response_type.id_token && !resources.has_openid() {
            return Err(Error::invalid_scope(
                "the id_token response type requires the openid scope",
            ));
        }
        if response_type.id_token && request.nonce.is_none() {
            return Err(Error::invalid_request(
                "nonce is required when an identity token is returned from the authorization endpoint",
            ));
        }
        if response_type.token && !client.allow_access_tokens_via_browser {
            return Err(Error::UnauthorizedClient(format!(
                "client '{}' may not receive access tokens via the browser",
                client.client_id
            )));
        }

        let code_challenge = if response_type.code {
            self.code_challenge(&client, request)?
        } else {
            None
        };

        if client.require_consent {
            self.ensure_consent(&client, subject, &resources, now).await?;
        }

        let flow = match grant_type {
            GrantType::Hybrid => TokenFlow::Hybrid,
            GrantType::Implicit => TokenFlow::Implicit,
            _ => TokenFlow::AuthorizationCode,
        };

        let code = if response_type.code {
            let payload = AuthorizationCodePayload {
                subject: subject.clone(),
                redirect_uri: request.redirect_uri.clone(),
                nonce: request.nonce.clone(),
                code_challenge,
                flow,
            };
            let grant = NewGrant::new(
                GrantKind::AuthorizationCode,
                &client.client_id,
                now,
                client.authorization_code_ttl(),
            )
            .with_subject(Some(subject.subject_id.clone()))
            .with_scopes(resources.scopes.clone())
            .with_payload(&payload)?;
            Some(self.ctx.grants.create(grant).await?)
        } else {
            None
        };

        let mut response = AuthorizeResponse {
            redirect_uri: request.redirect_uri.clone(),
            response_mode,
            flow_state: if code.is_some() {
                FlowState::CodeIssued
            } else {
                FlowState::TokensIssued
            },
            code: code.clone(),
            access_token: None,
            expires_in: None,
            id_token: None,
            scope: resources.scope_string(),
            state: request.state.clone(),
        };

        if response_type.has_front_channel_tokens() {
            let issue = IssueRequest::new(client.clone(), flow, resources, now)
                .with_subject(subject.clone())
                .with_nonce(request.nonce.clone())
                .with_code(code.clone())
                .with_tokens(response_type.token, response_type.id_token)
                .without_refresh_token();

            match self.ctx.issuer.issue(issue).await {
                Ok(issued) => {
                    if issued.access_token.is_some() {
                        response.expires_in = Some(issued.access_token_lifetime);
                    }
                    response.access_token = issued.access_token;
                    response.id_token = issued.identity_token;
                }
                Err(e) => {
                    if let Some(code) = &code {
                        if let Err(revoke_error) = self.ctx.grants.revoke(code).await {
                            warn!(error = %revoke_error, "failed to roll back authorization code");
                        }
                    }
                    return Err(e);
                }
            }
        }

        debug!(flow = %flow, state = ?response.flow_state, "authorization request accepted");
        Ok(response)
    }

    fn resolve_scopes(&self, client: &Client, scopes: &[String]) -> Result<Resources> {
        if scopes.is_empty() {
            return Err(Error::invalid_request("missing parameter 'scope'"));
        }
        if let Some(scope) = client.first_disallowed_scope(scopes) {
            return Err(Error::invalid_scope(format!(
                "scope '{}' is not allowed for client '{}'",
                scope, client.client_id
            )));
        }
        let resources = self.ctx.resources.resolve_scopes(scopes)?;
        if resources.scopes.is_empty() {
            return Err(Error::invalid_scope("no valid scope requested"));
        }
        Ok(resources)
    }

    fn code_challenge(
        &self,
        client: &Client,
        request: &AuthorizeRequest,
    ) -> Result<Option<PkceCodeChallenge>> {
        let Some(challenge) = request.code_challenge.as_deref() else {
            if client.require_pkce {
                return Err(Error::PkceRequired);
            }
            return Ok(None);
        };

        let method = PkceMethod::parse_param(request.code_challenge_method.as_deref())?;
        if method == PkceMethod::Plain && !client.allow_plain_text_pkce {
            return Err(Error::invalid_request(format!(
                "client '{}' does not allow the plain code_challenge_method",
                client.client_id
            )));
        }
        PkceCodeChallenge::new(challenge, method).map(Some)
    }

    async fn ensure_consent(
        &self,
        client: &Client,
        subject: &Subject,
        resources: &Resources,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let consents = self
            .ctx
            .grants
            .find(&subject.subject_id, &client.client_id, GrantKind::UserConsent)
            .await?;

        let covered = consents.iter().any(|consent| {
            !consent.is_expired(now)
                && resources
                    .scopes
                    .iter()
                    .all(|scope| consent.scopes.contains(scope))
        });

        if covered {
            Ok(())
        } else {
            Err(Error::ConsentRequired(client.client_id.clone()))
        }
    }

    /// 记录用户对某客户端的授权同意，替换之前的记录
    #[instrument(skip(self, subject_id, client_id, scopes), fields(client_id = %client_id))]
    pub async fn record_consent(
        &self,
        subject_id: &str,
        client_id: &str,
        scopes: &[String],
        lifetime: Option<Duration>,
    ) -> Result<()> {
        let client = self.ctx.clients.lookup(client_id)?;
        if let Some(scope) = client.first_disallowed_scope(scopes) {
            return Err(Error::invalid_scope(format!(
                "scope '{}' is not allowed for client '{}'",
                scope, client.client_id
            )));
        }

        let now = Utc::now();
        let grant = NewGrant::new(
            GrantKind::UserConsent,
            client_id,
            now,
            lifetime.unwrap_or_else(default_consent_lifetime),
        )
        .with_subject(Some(subject_id.to_string()))
        .with_scopes(scopes.to_vec());

        let (_, replaced) = self.ctx.grants.replace(grant).await?;

        debug!(replaced, "user consent recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grant::store::GrantStore;
    use crate::oauth::pkce::PkceChallenge;
    use crate::pipeline::tests::{context, subject};
    use std::collections::HashMap;

    fn fragment_params(url: &str) -> HashMap<String, String> {
        let url = Url::parse(url).unwrap();
        crate::pipeline::request::parse_form(url.fragment().unwrap_or_default())
    }

    #[tokio::test]
    async fn test_code_flow_with_pkce() {
        let (ctx, store) = context();
        let endpoint = AuthorizeEndpoint::new(ctx);
        let pkce = PkceChallenge::new(PkceMethod::S256).unwrap();

        let request = AuthorizeRequest::new("code", "native.code", "https://notused")
            .with_scope("openid profile api")
            .with_state("xyz")
            .with_code_challenge(pkce.challenge(), "S256");

        let response = endpoint.authorize(&request, &subject()).await.unwrap();
        assert_eq!(response.flow_state, FlowState::CodeIssued);
        assert_eq!(response.response_mode, ResponseMode::Query);
        assert!(response.access_token.is_none());

        let code = response.code.clone().unwrap();
        let grant = store.get(&code).await.unwrap().unwrap();
        assert_eq!(grant.kind, GrantKind::AuthorizationCode);
        assert_eq!(grant.scopes, vec!["openid", "profile", "api"]);

        let url = Url::parse(&response.redirect_url().unwrap()).unwrap();
        let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query["code"], code);
        assert_eq!(query["state"], "xyz");
    }

    #[tokio::test]
    async fn test_pkce_required() {
        let (ctx, store) = context();
        let endpoint = AuthorizeEndpoint::new(ctx);
        let request =
            AuthorizeRequest::new("code", "native.code", "https://notused").with_scope("openid");

        assert!(matches!(
            endpoint.authorize(&request, &subject()).await,
            Err(Error::PkceRequired)
        ));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_plain_pkce_not_allowed() {
        let (ctx, _) = context();
        let endpoint = AuthorizeEndpoint::new(ctx);
        let request = AuthorizeRequest::new("code", "native.code", "https://notused")
            .with_scope("openid")
            .with_code_challenge("a".repeat(43), "plain");

        assert!(matches!(
            endpoint.authorize(&request, &subject()).await,
            Err(Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_validation_order_failures() {
        let (ctx, store) = context();
        let endpoint = AuthorizeEndpoint::new(ctx);
        let s = subject();

        let unsupported = AuthorizeRequest::new("device", "native.code", "https://notused");
        assert!(matches!(
            endpoint.authorize(&unsupported, &s).await,
            Err(Error::UnsupportedResponseType(_))
        ));

        let unknown = AuthorizeRequest::new("code", "nobody", "https://notused");
        assert!(matches!(
            endpoint.authorize(&unknown, &s).await,
            Err(Error::UnknownClient(_))
        ));

        let wrong_flow =
            AuthorizeRequest::new("id_token", "native.code", "https://notused").with_scope("openid");
        assert!(matches!(
            endpoint.authorize(&wrong_flow, &s).await,
            Err(Error::UnauthorizedClient(_))
        ));

        let wrong_redirect = AuthorizeRequest::new("code", "native.code", "https://evil.test");
        assert!(matches!(
            endpoint.authorize(&wrong_redirect, &s).await,
            Err(Error::InvalidRedirectUri(_))
        ));

        let wrong_scope =
            AuthorizeRequest::new("code", "native.code", "https://notused").with_scope("openid admin");
        assert!(matches!(
            endpoint.authorize(&wrong_scope, &s).await,
            Err(Error::InvalidScope(_))
        ));

        let no_offline = AuthorizeRequest::new("id_token token", "implicit", "https://notused")
            .with_scope("openid offline_access")
            .with_nonce("n");
        assert!(matches!(
            endpoint.authorize(&no_offline, &s).await,
            Err(Error::InvalidScope(_))
        ));

        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_implicit_tokens_in_fragment() {
        let (ctx, store) = context();
        let endpoint = AuthorizeEndpoint::new(ctx);
        let request = AuthorizeRequest::new("id_token token", "implicit", "https://notused")
            .with_scope("openid profile api")
            .with_nonce("n-1")
            .with_state("s");

        let response = endpoint.authorize(&request, &subject()).await.unwrap();
        assert_eq!(response.flow_state, FlowState::TokensIssued);
        assert_eq!(response.response_mode, ResponseMode::Fragment);
        assert!(response.code.is_none());
        assert_eq!(response.expires_in, Some(3600));
        assert_eq!(store.count().await.unwrap(), 0);

        let params = fragment_params(&response.redirect_url().unwrap());
        assert!(params.contains_key("id_token"));
        assert!(params.contains_key("access_token"));
        assert_eq!(params["token_type"], "Bearer");
        assert_eq!(params["state"], "s");
    }

    #[tokio::test]
    async fn test_implicit_requires_nonce_and_openid() {
        let (ctx, _) = context();
        let endpoint = AuthorizeEndpoint::new(ctx);
        let s = subject();

        let no_nonce =
            AuthorizeRequest::new("id_token", "implicit", "https://notused").with_scope("openid");
        assert!(matches!(
            endpoint.authorize(&no_nonce, &s).await,
            Err(Error::InvalidRequest(_))
        ));

        let no_openid = AuthorizeRequest::new("id_token", "implicit", "https://notused")
            .with_scope("profile")
            .with_nonce("n");
        assert!(matches!(
            endpoint.authorize(&no_openid, &s).await,
            Err(Error::InvalidScope(_))
        ));

        let query_mode = AuthorizeRequest::new("id_token", "implicit", "https://notused")
            .with_scope("openid")
            .with_nonce("n")
            .with_response_mode("query");
        assert!(matches!(
            endpoint.authorize(&query_mode, &s).await,
            Err(Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_hybrid_issues_code_and_identity_token() {
        let (ctx, store) = context();
        let endpoint = AuthorizeEndpoint::new(ctx);
        let request = AuthorizeRequest::new("code id_token", "server.hybrid", "https://notused")
            .with_scope("openid api offline_access")
            .with_nonce("n");

        let response = endpoint.authorize(&request, &subject()).await.unwrap();
        assert_eq!(response.flow_state, FlowState::CodeIssued);
        assert!(response.code.is_some());
        assert!(response.id_token.is_some());
        assert!(response.access_token.is_none());
        // 前端通道不签发刷新令牌
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_consent() {
        let (ctx, _) = context();
        let endpoint = AuthorizeEndpoint::new(ctx);
        let s = subject();
        let request = AuthorizeRequest::new("code", "consent.code", "https://notused")
            .with_scope("openid profile");

        assert!(matches!(
            endpoint.authorize(&request, &s).await,
            Err(Error::ConsentRequired(_))
        ));

        endpoint
            .record_consent(&s.subject_id, "consent.code", &["openid".to_string()], None)
            .await
            .unwrap();
        assert!(matches!(
            endpoint.authorize(&request, &s).await,
            Err(Error::ConsentRequired(_))
        ));

        let scopes = vec!["openid".to_string(), "profile".to_string()];
        endpoint
            .record_consent(&s.subject_id, "consent.code", &scopes, None)
            .await
            .unwrap();
        assert!(endpoint.authorize(&request, &s).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consent_updates() {
        let (ctx, store) = context();
        let endpoint = AuthorizeEndpoint::new(ctx);
        let scopes = vec!["openid".to_string(), "profile".to_string()];
        endpoint
            .record_consent("alice", "consent.code", &scopes, None)
            .await
            .unwrap();

        let mut writers = Vec::new();
        for _ in 0..4 {
            let endpoint = endpoint.clone();
            let scopes = scopes.clone();
            writers.push(tokio::spawn(async move {
                for _ in 0..50 {
                    endpoint
                        .record_consent("alice", "consent.code", &scopes, None)
                        .await
                        .unwrap();
                }
            }));
        }

        // 替换过程中授权请求始终能看到同意记录
        let request = AuthorizeRequest::new("code", "consent.code", "https://notused")
            .with_scope("openid profile");
        for _ in 0..100 {
            assert!(endpoint.authorize(&request, &subject()).await.is_ok());
            tokio::task::yield_now().await;
        }

        for writer in writers {
            writer.await.unwrap();
        }
        let consents = store
            .find("alice", "consent.code", GrantKind::UserConsent)
            .await
            .unwrap();
        assert_eq!(consents.len(), 1);
    }
}
