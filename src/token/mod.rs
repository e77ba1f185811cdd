//! Token 模块
//!
//! 签名密钥、令牌签发与验证。
//!
//! ## 子模块
//!
//! - **signing**: ES256 签名密钥、密钥环与 JWKS
//! - **jwt**: JWT 编码与验证
//! - **issuer**: 访问令牌 / 身份令牌 / 刷新令牌签发
//! - **validator**: 访问令牌验证与内省
//!
//! ## 示例
//!
//! ```rust
//! use chrono::Utc;
//! use oidcrs::grant::InMemoryGrantStore;
//! use oidcrs::oauth::{Client, GrantType, Secret};
//! use oidcrs::registry::{ApiResource, ResourceRegistry, ScopePolicy};
//! use oidcrs::token::{IssueRequest, KeyRing, SigningKey, TokenFlow, TokenIssuer, TokenValidator};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let keys = Arc::new(KeyRing::new(SigningKey::generate("dev").unwrap()));
//! let grants = Arc::new(InMemoryGrantStore::new());
//! let issuer = TokenIssuer::new("https://id.example.com", keys.clone(), grants.clone());
//! let validator = TokenValidator::new("https://id.example.com", keys, grants);
//!
//! let resources = ResourceRegistry::new(vec![], vec![ApiResource::new("api", "API")], ScopePolicy::Strict)
//!     .unwrap()
//!     .resolve_scopes(&["api".to_string()])
//!     .unwrap();
//! let client = Client::builder("svc")
//!     .secret(Secret::sha256("secret"))
//!     .grant_type(GrantType::ClientCredentials)
//!     .scope("api")
//!     .build()
//!     .unwrap();
//!
//! let issued = issuer
//!     .issue(IssueRequest::new(Arc::new(client), TokenFlow::ClientCredentials, resources, Utc::now()))
//!     .await
//!     .unwrap();
//!
//! let claims = validator
//!     .validate_access_token(issued.access_token.as_deref().unwrap(), Utc::now())
//!     .await
//!     .unwrap();
//! assert_eq!(claims.scope, vec!["api".to_string()]);
//! # }
//! ```

pub mod issuer;
pub mod jwt;
pub mod signing;
pub mod validator;

pub use issuer::{
    AccessTokenClaims, IdentityTokenClaims, IssueRequest, IssuedTokens, RefreshTokenPayload,
    TokenFlow, TokenIssuer,
};
pub use jwt::{JwtValidator, JwtValidatorConfig};
pub use signing::{Jwk, Jwks, KeyRing, SigningKey, VerificationKey};
pub use validator::{AccessTokenFormat, TokenValidator};
