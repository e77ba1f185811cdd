//! 身份服务门面
//!
//! `IdentityServer` 根据 [`ServerOptions`] 把注册表、grant 存储、密钥环、端点和
//! 后台清理组装在一起。宿主负责 HTTP 与用户认证，只需调用这里的方法。
//!
//! ```rust
//! use oidcrs::config::ServerOptions;
//! use oidcrs::pipeline::TokenRequest;
//! use oidcrs::registry::demo_seed_data;
//! use oidcrs::server::IdentityServer;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let server = IdentityServer::builder(ServerOptions::new("https://id.example.com"))
//!     .seed(demo_seed_data().unwrap())
//!     .build()
//!     .unwrap();
//!
//! let request = TokenRequest::client_credentials("client").with_secret("secret");
//! let response = server.token(&request).await.unwrap();
//! assert_eq!(response.scope, "api");
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::ServerOptions;
use crate::error::Result;
use crate::grant::cleanup::{CleanupHandle, CleanupScheduler};
use crate::grant::store::{GrantStore, InMemoryGrantStore, TimedGrantStore};
use crate::oauth::client::{Client, GrantType};
use crate::oauth::introspection::{IntrospectionRequest, IntrospectionResponse};
use crate::oauth::token::TokenResponse;
use crate::pipeline::authorize::{AuthorizeEndpoint, AuthorizeResponse};
use crate::pipeline::request::{AuthorizeRequest, RevocationRequest, Subject, TokenRequest};
use crate::pipeline::token::TokenEndpoint;
use crate::pipeline::EndpointContext;
use crate::registry::client::ClientRegistry;
use crate::registry::resource::{ApiResource, IdentityResource, ResourceRegistry};
use crate::registry::seed::{ConfigurationStore, SeedData};
use crate::token::jwt::SIGNING_ALGORITHM;
use crate::token::signing::{Jwks, KeyRing, SigningKey};

/// 发现文档（OpenID Connect Discovery 1.0 的子集）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    /// 签发者标识
    pub issuer: String,
    /// 公开验证密钥
    pub jwks_uri: String,
    /// 授权端点
    pub authorization_endpoint: String,
    /// Token 端点
    pub token_endpoint: String,
    /// 撤销端点 (RFC 7009)
    pub revocation_endpoint: String,
    /// 内省端点 (RFC 7662)
    pub introspection_endpoint: String,
    /// 身份资源和 API 资源的全部 scope，包括 `offline_access`
    pub scopes_supported: Vec<String>,
    /// 支持的 response_type 组合
    pub response_types_supported: Vec<String>,
    /// 授权响应的返回方式
    pub response_modes_supported: Vec<String>,
    /// 支持的 `grant_type` 取值
    ///
    /// 混合模式不是独立的 `grant_type`：它由 `authorization_code` 和 `implicit` 组成。
    pub grant_types_supported: Vec<String>,
    /// 用户标识类型
    pub subject_types_supported: Vec<String>,
    /// 身份令牌签名算法
    pub id_token_signing_alg_values_supported: Vec<String>,
    /// PKCE 方法
    pub code_challenge_methods_supported: Vec<String>,
    /// Token 端点的客户端认证方式
    pub token_endpoint_auth_methods_supported: Vec<String>,
}

/// 身份服务构建器
pub struct IdentityServerBuilder {
    options: ServerOptions,
    seed: SeedData,
    grants: Option<Arc<dyn GrantStore>>,
    signing_key: Option<SigningKey>,
}

impl IdentityServerBuilder {
    /// 设置客户端
    pub fn clients(mut self, clients: Vec<Client>) -> Self {
        self.seed.clients = clients;
        self
    }

    /// 设置身份资源
    pub fn identity_resources(mut self, resources: Vec<IdentityResource>) -> Self {
        self.seed.identity_resources = resources;
        self
    }

    /// 设置 API 资源
    pub fn api_resources(mut self, resources: Vec<ApiResource>) -> Self {
        self.seed.api_resources = resources;
        self
    }

    /// 一次性设置全部配置
    pub fn seed(mut self, seed: SeedData) -> Self {
        self.seed = seed;
        self
    }

    /// 使用自定义 grant 存储，默认使用内存存储
    pub fn grant_store(mut self, store: Arc<dyn GrantStore>) -> Self {
        self.grants = Some(store);
        self
    }

    /// 使用指定签名密钥，默认生成一个临时开发密钥
    pub fn signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// 构建服务
    pub fn build(self) -> Result<IdentityServer> {
        self.options.validate()?;

        let clients = Arc::new(ClientRegistry::new(self.seed.clients)?);
        let resources = Arc::new(ResourceRegistry::new(
            self.seed.identity_resources,
            self.seed.api_resources,
            self.options.scope_policy,
        )?);

        let inner = self
            .grants
            .unwrap_or_else(|| Arc::new(InMemoryGrantStore::new()));
        let grants: Arc<dyn GrantStore> =
            Arc::new(TimedGrantStore::new(inner, self.options.store_timeout));

        let key = match self.signing_key {
            Some(key) => key,
            None => SigningKey::generate(self.options.key_id.clone())?,
        };
        let keys = Arc::new(KeyRing::new(key));

        let ctx = EndpointContext::new(
            self.options.issuer.clone(),
            clients,
            resources,
            grants,
            keys.clone(),
        );

        info!(
            issuer = %self.options.issuer,
            clients = ctx.clients.snapshot().len(),
            apis = ctx.resources.snapshot().api_len(),
            "identity server configured"
        );

        Ok(IdentityServer {
            authorize: AuthorizeEndpoint::new(ctx.clone()),
            token: TokenEndpoint::new(ctx.clone()),
            options: self.options,
            keys,
            ctx,
        })
    }
}

/// 身份服务
#[derive(Debug, Clone)]
pub struct IdentityServer {
    options: ServerOptions,
    ctx: EndpointContext,
    keys: Arc<KeyRing>,
    authorize: AuthorizeEndpoint,
    token: TokenEndpoint,
}

impl IdentityServer {
    /// 创建构建器
    pub fn builder(options: ServerOptions) -> IdentityServerBuilder {
        IdentityServerBuilder {
            options,
            seed: SeedData::default(),
            grants: None,
            signing_key: None,
        }
    }

    /// 从持久化配置加载客户端和资源
    pub async fn from_configuration_store(
        options: ServerOptions,
        store: &dyn ConfigurationStore,
    ) -> Result<IdentityServerBuilder> {
        let seed = SeedData {
            clients: store.list_clients().await?,
            identity_resources: store.list_identity_resources().await?,
            api_resources: store.list_api_resources().await?,
        };
        Ok(Self::builder(options).seed(seed))
    }

    /// 配置
    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// 端点共享的上下文
    pub fn context(&self) -> &EndpointContext {
        &self.ctx
    }

    /// 授权端点
    pub async fn authorize(
        &self,
        request: &AuthorizeRequest,
        subject: &Subject,
    ) -> Result<AuthorizeResponse> {
        self.authorize.authorize(request, subject).await
    }

    /// 记录用户授权同意
    pub async fn record_consent(
        &self,
        subject_id: &str,
        client_id: &str,
        scopes: &[String],
    ) -> Result<()> {
        self.authorize
            .record_consent(subject_id, client_id, scopes, None)
            .await
    }

    /// Token 端点
    pub async fn token(&self, request: &TokenRequest) -> Result<TokenResponse> {
        self.token.handle(request).await
    }

    /// 撤销端点
    pub async fn revoke(&self, request: &RevocationRequest) -> Result<bool> {
        self.token.revoke(request).await
    }

    /// 内省端点
    pub async fn introspect(
        &self,
        api_name: &str,
        api_secret: &str,
        request: &IntrospectionRequest,
    ) -> Result<IntrospectionResponse> {
        self.token.introspect(api_name, api_secret, request).await
    }

    /// 按配置启动后台清理，未启用时返回 `None`
    pub fn start_cleanup(&self) -> Option<CleanupHandle> {
        if !self.options.enable_token_cleanup {
            return None;
        }
        let scheduler =
            CleanupScheduler::new(self.ctx.grants.clone(), self.options.token_cleanup_interval)
                .with_timeout(self.options.store_timeout);
        Some(scheduler.spawn())
    }

    /// 公开验证密钥
    pub fn jwks(&self) -> Jwks {
        self.keys.jwks()
    }

    /// 轮换签名密钥，旧密钥继续用于验证
    pub fn rotate_signing_key(&self, next: SigningKey) {
        self.keys.rotate(next);
    }

    /// 撤下一个密钥
    pub fn retire_signing_key(&self, kid: &str) -> bool {
        self.keys.retire(kid)
    }

    /// 整体替换客户端
    pub fn reload_clients(&self, clients: Vec<Client>) -> Result<()> {
        self.ctx.clients.reload(clients)
    }

    /// 整体替换资源
    pub fn reload_resources(
        &self,
        identity: Vec<IdentityResource>,
        apis: Vec<ApiResource>,
    ) -> Result<()> {
        self.ctx.resources.reload(identity, apis)
    }

    /// 发现文档
    pub fn discovery(&self) -> DiscoveryDocument {
        let base = self.options.issuer.trim_end_matches('/');
        let endpoint = |path: &str| format!("{}/connect/{}", base, path);
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();

        DiscoveryDocument {
            issuer: self.options.issuer.clone(),
            jwks_uri: format!("{}/.well-known/openid-configuration/jwks", base),
            authorization_endpoint: endpoint("authorize"),
            token_endpoint: endpoint("token"),
            revocation_endpoint: endpoint("revocation"),
            introspection_endpoint: endpoint("introspect"),
            scopes_supported: self.ctx.resources.snapshot().scope_names(),
            response_types_supported: strings(&[
                "code",
                "token",
                "id_token",
                "id_token token",
                "code id_token",
                "code token",
                "code id_token token",
            ]),
            response_modes_supported: strings(&["query", "fragment"]),
            grant_types_supported: strings(&[
                "authorization_code",
                "client_credentials",
                "refresh_token",
                GrantType::Implicit.as_str(),
            ]),
            subject_types_supported: strings(&["public"]),
            id_token_signing_alg_values_supported: vec![format!("{:?}", SIGNING_ALGORITHM)],
            code_challenge_methods_supported: strings(&["plain", "S256"]),
            token_endpoint_auth_methods_supported: strings(&["client_secret_post"]),
        }
    }
}
