//! 协议验证管道
//!
//! 把原始请求变成经过校验的签发决定：
//!
//! - **请求** (`request`): 授权请求、token 请求、撤销请求的解析
//! - **授权端点** (`authorize`): code / implicit / hybrid 流程，授权码与前端通道令牌
//! - **Token 端点** (`token`): authorization_code、client_credentials、refresh_token，撤销与内省
//!
//! 每个交互式授权的状态只会向前推进：
//! `Requested → CodeIssued → Redeemed → TokensIssued`。

pub mod authorize;
pub mod request;
pub mod token;

use std::fmt;
use std::sync::Arc;

use crate::grant::store::GrantStore;
use crate::registry::client::ClientRegistry;
use crate::registry::resource::ResourceRegistry;
use crate::token::issuer::TokenIssuer;
use crate::token::signing::KeyRing;
use crate::token::validator::TokenValidator;

pub use authorize::{AuthorizationCodePayload, AuthorizeEndpoint, AuthorizeResponse};
pub use request::{
    AuthorizeRequest, ResponseMode, ResponseType, RevocationRequest, Subject, TokenRequest,
};
pub use token::TokenEndpoint;

/// 授权流程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlowState {
    /// 请求已通过校验
    Requested,
    /// 已签发授权码
    CodeIssued,
    /// 授权码已兑换
    Redeemed,
    /// 令牌已签发
    TokensIssued,
}

/// 端点共享的依赖
#[derive(Clone)]
pub struct EndpointContext {
    /// 客户端注册表
    pub clients: Arc<ClientRegistry>,
    /// 资源注册表
    pub resources: Arc<ResourceRegistry>,
    /// grant 存储
    pub grants: Arc<dyn GrantStore>,
    /// 令牌签发器
    pub issuer: TokenIssuer,
    /// 令牌验证器
    pub validator: TokenValidator,
}

impl EndpointContext {
    /// 创建上下文，签发器和验证器共享同一个密钥环和存储
    pub fn new(
        issuer_uri: impl Into<String>,
        clients: Arc<ClientRegistry>,
        resources: Arc<ResourceRegistry>,
        grants: Arc<dyn GrantStore>,
        keys: Arc<KeyRing>,
    ) -> Self {
        let issuer_uri = issuer_uri.into();
        Self {
            issuer: TokenIssuer::new(issuer_uri.clone(), keys.clone(), grants.clone()),
            validator: TokenValidator::new(issuer_uri, keys, grants.clone()),
            clients,
            resources,
            grants,
        }
    }
}

impl fmt::Debug for EndpointContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointContext")
            .field("issuer", &self.issuer.issuer())
            .field("clients", &self.clients.snapshot().len())
            .field("apis", &self.resources.snapshot().api_len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::grant::store::InMemoryGrantStore;
    use crate::oauth::client::{Client, GrantType, Secret, TokenUsage};
    use crate::registry::resource::ScopePolicy;
    use crate::registry::seed::{demo_api_resources, demo_clients, demo_identity_resources};
    use crate::token::signing::SigningKey;
    use serde_json::json;

    /// 演示客户端加上两个测试专用客户端
    pub(crate) fn context() -> (EndpointContext, Arc<InMemoryGrantStore>) {
        let mut clients = demo_clients().unwrap();
        clients.push(
            Client::builder("consent.code")
                .grant_type(GrantType::AuthorizationCode)
                .secret(Secret::sha256("secret"))
                .redirect_uri("https://notused")
                .scopes(["openid", "profile"])
                .require_consent(true)
                .build()
                .unwrap(),
        );
        clients.push(
            Client::builder("rotating.code")
                .grant_type(GrantType::AuthorizationCode)
                .secret(Secret::sha256("secret"))
                .redirect_uri("https://notused")
                .scopes(["openid", "api"])
                .allow_offline_access(true)
                .refresh_token_usage(TokenUsage::OneTimeOnly)
                .build()
                .unwrap(),
        );

        let store = Arc::new(InMemoryGrantStore::new());
        let ctx = EndpointContext::new(
            "https://id.test",
            Arc::new(ClientRegistry::new(clients).unwrap()),
            Arc::new(
                ResourceRegistry::new(
                    demo_identity_resources(),
                    demo_api_resources(),
                    ScopePolicy::Strict,
                )
                .unwrap(),
            ),
            store.clone(),
            Arc::new(KeyRing::new(SigningKey::generate("test").unwrap())),
        );
        (ctx, store)
    }

    pub(crate) fn subject() -> Subject {
        Subject::new("alice", chrono::Utc::now())
            .with_claim("name", json!("Alice Smith"))
            .with_claim("email", json!("alice@example.com"))
    }

    #[test]
    fn test_flow_state_only_moves_forward() {
        assert!(FlowState::Requested < FlowState::CodeIssued);
        assert!(FlowState::CodeIssued < FlowState::Redeemed);
        assert!(FlowState::Redeemed < FlowState::TokensIssued);
    }

    #[test]
    fn test_context_debug_hides_secrets() {
        let (ctx, _) = context();
        let debug = format!("{:?}", ctx);
        assert!(debug.contains("https://id.test"));
        assert!(!debug.contains("secret"));
    }
}
