//! # oidcrs
//!
//! OAuth 2.0 / OpenID Connect 令牌签发与验证引擎。
//!
//! 本库不包含 HTTP 层和用户认证界面：宿主负责接收请求、认证用户，然后把解析后的
//! 请求和已认证的用户交给这里处理。
//!
//! ## 功能特性
//!
//! - **客户端注册表**: 不可变快照，整体替换
//! - **资源注册表**: 身份资源、API 资源与 scope 解析
//! - **Grant 存储**: 授权码、刷新令牌、引用令牌、授权同意，原子兑换
//! - **令牌签发**: ES256 JWT 访问令牌 / 身份令牌，引用令牌，刷新令牌轮换
//! - **验证管道**: authorization_code、implicit、hybrid、client_credentials、refresh_token，
//!   PKCE，撤销与内省
//! - **后台清理**: 定期删除过期 grant
//!
//! ## 客户端凭证示例
//!
//! ```rust
//! use oidcrs::{IdentityServer, ServerOptions, TokenRequest};
//! use oidcrs::registry::demo_seed_data;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let server = IdentityServer::builder(ServerOptions::new("https://id.example.com"))
//!     .seed(demo_seed_data().unwrap())
//!     .build()
//!     .unwrap();
//!
//! let response = server
//!     .token(&TokenRequest::client_credentials("client").with_secret("secret"))
//!     .await
//!     .unwrap();
//! assert_eq!(response.token_type.to_string(), "Bearer");
//! # }
//! ```
//!
//! ## 授权码 + PKCE 示例
//!
//! ```rust
//! use chrono::Utc;
//! use oidcrs::{AuthorizeRequest, IdentityServer, ServerOptions, Subject, TokenRequest};
//! use oidcrs::oauth::{PkceChallenge, PkceMethod};
//! use oidcrs::registry::demo_seed_data;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let server = IdentityServer::builder(ServerOptions::new("https://id.example.com"))
//!     .seed(demo_seed_data().unwrap())
//!     .build()
//!     .unwrap();
//!
//! // 用户已由宿主完成认证
//! let alice = Subject::new("alice", Utc::now());
//! let pkce = PkceChallenge::new(PkceMethod::S256).unwrap();
//!
//! let authorize = AuthorizeRequest::new("code", "native.code", "https://notused")
//!     .with_scope("openid profile api")
//!     .with_code_challenge(pkce.challenge(), "S256");
//! let code = server.authorize(&authorize, &alice).await.unwrap().code.unwrap();
//!
//! let token = TokenRequest::authorization_code("native.code", &code, "https://notused")
//!     .with_code_verifier(pkce.verifier());
//! let response = server.token(&token).await.unwrap();
//! assert!(response.id_token.is_some());
//! # }
//! ```

pub mod config;
pub mod error;
pub mod grant;
pub mod oauth;
pub mod pipeline;
pub mod random;
pub mod registry;
pub mod server;
pub mod token;

pub use config::ServerOptions;
pub use error::{Error, GrantError, Result, TokenError};

// ============================================================================
// 管道相关导出
// ============================================================================

pub use pipeline::{
    AuthorizeEndpoint, AuthorizeRequest, AuthorizeResponse, EndpointContext, FlowState,
    RevocationRequest, Subject, TokenEndpoint, TokenRequest,
};

// ============================================================================
// 服务相关导出
// ============================================================================

pub use server::{DiscoveryDocument, IdentityServer, IdentityServerBuilder};

// ============================================================================
// 随机数与句柄
// ============================================================================

pub use random::{constant_time_compare_str, generate_handle, sha256_hex};
