//! OAuth 2.0 协议模型
//!
//! 提供客户端注册模型与协议层的数据结构：
//!
//! - **客户端** (`client`): 客户端定义、授权类型、令牌策略、经过校验的构建器
//! - **PKCE** (`pkce`): Proof Key for Code Exchange 支持
//! - **Token** (`token`): token 端点响应与错误响应
//! - **Token 内省** (`introspection`): RFC 7662 Token Introspection
//!
//! ## 示例
//!
//! ### 客户端
//!
//! ```rust
//! use oidcrs::oauth::{Client, GrantType, Secret};
//!
//! let client = Client::builder("server.code")
//!     .grant_type(GrantType::AuthorizationCode)
//!     .secret(Secret::sha256("secret"))
//!     .redirect_uri("https://app.example.com/signin-oidc")
//!     .scopes(["openid", "profile", "api"])
//!     .require_pkce(true)
//!     .build()
//!     .unwrap();
//!
//! assert!(client.allows_scope("api"));
//! assert!(!client.allows_scope("offline_access"));
//! ```
//!
//! ### 错误响应
//!
//! ```rust
//! use oidcrs::Error;
//!
//! let response = Error::UnsupportedGrantType("password".into()).to_response();
//! let json = serde_json::to_value(&response).unwrap();
//! assert_eq!(json["error"], "unsupported_grant_type");
//! ```

pub mod client;
pub mod introspection;
pub mod pkce;
pub mod token;

// ============================================================================
// Client 模块导出
// ============================================================================

pub use client::{
    AccessTokenType, Client, ClientBuilder, GrantType, OFFLINE_ACCESS, Secret, TokenExpiration,
    TokenUsage,
};

// ============================================================================
// PKCE 模块导出
// ============================================================================

pub use pkce::{PkceChallenge, PkceCodeChallenge, PkceMethod};

// ============================================================================
// Token 模块导出
// ============================================================================

pub use token::{ErrorResponse, OAuthErrorCode, TokenResponse, TokenType};

// ============================================================================
// Introspection 模块导出
// ============================================================================

pub use introspection::{
    IntrospectionRequest, IntrospectionResponse, IntrospectionResponseBuilder, TokenTypeHint,
};
