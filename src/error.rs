//! 统一错误类型模块
//!
//! 提供 oidcrs 中所有操作的错误类型定义。
//!
//! 协议相关的错误（`UnknownClient`、`InvalidScope`、`PkceMismatch` 等）都是本地的、
//! 结构化的拒绝：它们会映射为 RFC 6749 / OpenID Connect 定义的错误代码，
//! 并且在返回之前不会留下任何 grant 状态的修改。

use std::time::Duration;

use thiserror::Error;

use crate::oauth::token::{ErrorResponse, OAuthErrorCode};

/// oidcrs 的统一结果类型
pub type Result<T> = std::result::Result<T, Error>;

/// oidcrs 的错误类型
#[derive(Debug, Error)]
pub enum Error {
    /// 客户端未注册（或已禁用）
    #[error("unknown client: {0}")]
    UnknownClient(String),

    /// 客户端认证失败
    #[error("client authentication failed: {0}")]
    InvalidClient(String),

    /// 请求的 scope 无效或超出允许范围
    #[error("invalid scope: {0}")]
    InvalidScope(String),

    /// 客户端不允许使用该授权类型
    #[error("unauthorized client: {0}")]
    UnauthorizedClient(String),

    /// redirect_uri 未注册或不匹配
    #[error("invalid redirect_uri: {0}")]
    InvalidRedirectUri(String),

    /// 客户端要求 PKCE 但请求未携带 code_challenge
    #[error("code_challenge is required for this client")]
    PkceRequired,

    /// code_verifier 与 code_challenge 不匹配
    #[error("code_verifier does not match the code_challenge")]
    PkceMismatch,

    /// 授权码 / 刷新令牌 / 引用令牌无效
    #[error("invalid grant: {0}")]
    InvalidGrant(#[from] GrantError),

    /// 请求格式错误或缺少参数
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// 不支持的 grant_type
    #[error("unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    /// 不支持的 response_type
    #[error("unsupported response type: {0}")]
    UnsupportedResponseType(String),

    /// 需要用户授权同意
    #[error("user consent is required for client {0}")]
    ConsentRequired(String),

    /// 存储操作超时
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// 没有可用的签名密钥
    #[error("no signing key available")]
    SigningKeyUnavailable,

    /// Token 相关错误
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    /// 配置错误
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 存储错误
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// 加密错误
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// 内部错误
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 创建一个内部错误
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// 创建一个请求格式错误
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Error::InvalidRequest(msg.into())
    }

    /// 创建一个 scope 错误
    pub fn invalid_scope(msg: impl Into<String>) -> Self {
        Error::InvalidScope(msg.into())
    }

    /// 映射为协议错误代码
    pub fn oauth_code(&self) -> OAuthErrorCode {
        match self {
            Error::UnknownClient(_) | Error::InvalidClient(_) => OAuthErrorCode::InvalidClient,
            Error::InvalidScope(_) => OAuthErrorCode::InvalidScope,
            Error::UnauthorizedClient(_) => OAuthErrorCode::UnauthorizedClient,
            Error::InvalidRedirectUri(_) | Error::InvalidRequest(_) | Error::PkceRequired => {
                OAuthErrorCode::InvalidRequest
            }
            Error::PkceMismatch | Error::InvalidGrant(_) => OAuthErrorCode::InvalidGrant,
            Error::UnsupportedGrantType(_) => OAuthErrorCode::UnsupportedGrantType,
            Error::UnsupportedResponseType(_) => OAuthErrorCode::UnsupportedResponseType,
            Error::ConsentRequired(_) => OAuthErrorCode::ConsentRequired,
            Error::Timeout(_) => OAuthErrorCode::TemporarilyUnavailable,
            Error::Token(_) => OAuthErrorCode::InvalidToken,
            Error::SigningKeyUnavailable
            | Error::Config(_)
            | Error::Storage(_)
            | Error::Crypto(_)
            | Error::Internal(_) => OAuthErrorCode::ServerError,
        }
    }

    /// 转换为可直接序列化的错误响应
    ///
    /// 服务端内部错误不会把细节暴露给调用方。
    pub fn to_response(&self) -> ErrorResponse {
        let code = self.oauth_code();
        match code {
            OAuthErrorCode::ServerError => ErrorResponse::new(code),
            _ => ErrorResponse::new(code).with_description(self.to_string()),
        }
    }

    /// 调用方是否可以按自己的策略重试
    ///
    /// 签发路径内部从不自动重试，以避免重复签发。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Storage(StorageError::ConnectionFailed(_))
        )
    }
}

/// Grant 兑换失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GrantError {
    /// 句柄不存在（或已被清理）
    #[error("grant not found")]
    NotFound,
    /// 已过期
    #[error("grant has expired")]
    Expired,
    /// 一次性 grant 已被使用
    #[error("grant has already been consumed")]
    AlreadyConsumed,
    /// 句柄属于其他客户端
    #[error("grant was issued to another client")]
    ClientMismatch,
    /// 句柄类型与请求不符
    #[error("grant kind does not match the request")]
    KindMismatch,
    /// 检测到已轮换的刷新令牌被重放
    #[error("refresh token replay detected, related grants revoked")]
    ReplayDetected,
}

/// Token 相关错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Token 已过期
    #[error("token has expired")]
    Expired,
    /// Token 格式无效
    #[error("invalid token format: {0}")]
    InvalidFormat(String),
    /// Token 签名无效
    #[error("invalid token signature")]
    InvalidSignature,
    /// 找不到与 kid 对应的验证密钥
    #[error("no trusted verification key for kid '{0}'")]
    UnknownKey(String),
    /// Token 编码失败
    #[error("token encoding failed: {0}")]
    EncodingFailed(String),
    /// Token 解码失败
    #[error("token decoding failed: {0}")]
    DecodingFailed(String),
    /// 缺少必需的 claim
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// 无效的 claim 值
    #[error("invalid claim value: {0}")]
    InvalidClaim(String),
    /// 引用令牌不存在或已被撤销
    #[error("token is not active")]
    NotActive,
}

/// 配置相关错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// 缺少必需的配置
    #[error("missing required configuration: {0}")]
    MissingRequired(String),
    /// 无效的配置值
    #[error("invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
    /// 重复的标识
    #[error("duplicate {kind}: {name}")]
    Duplicate { kind: &'static str, name: String },
}

impl ConfigError {
    /// 创建一个无效配置值错误
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// 存储相关错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// 连接失败
    #[error("storage connection failed: {0}")]
    ConnectionFailed(String),
    /// 记录未找到
    #[error("not found: {0}")]
    NotFound(String),
    /// 记录已存在
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// 操作失败
    #[error("storage operation failed: {0}")]
    OperationFailed(String),
}

/// 加密相关错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// 随机数生成失败
    #[error("random number generation failed: {0}")]
    RngFailed(String),
    /// 密钥无效
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidGrant(GrantError::AlreadyConsumed);
        assert_eq!(
            err.to_string(),
            "invalid grant: grant has already been consumed"
        );
    }

    #[test]
    fn test_error_from_grant_error() {
        let err: Error = GrantError::Expired.into();
        assert!(matches!(err, Error::InvalidGrant(GrantError::Expired)));
    }

    #[test]
    fn test_oauth_code_mapping() {
        assert_eq!(
            Error::UnknownClient("x".into()).oauth_code(),
            OAuthErrorCode::InvalidClient
        );
        assert_eq!(Error::PkceMismatch.oauth_code(), OAuthErrorCode::InvalidGrant);
        assert_eq!(Error::PkceRequired.oauth_code(), OAuthErrorCode::InvalidRequest);
        assert_eq!(
            Error::Timeout(Duration::from_secs(1)).oauth_code(),
            OAuthErrorCode::TemporarilyUnavailable
        );
    }

    #[test]
    fn test_server_error_hides_details() {
        let response = Error::internal("database password is hunter2").to_response();
        assert_eq!(response.error, OAuthErrorCode::ServerError);
        assert!(response.error_description.is_none());
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout(Duration::from_millis(10)).is_retryable());
        assert!(!Error::PkceMismatch.is_retryable());
        assert!(!Error::SigningKeyUnavailable.is_retryable());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("issuer", "must not be empty");
        assert_eq!(
            err.to_string(),
            "invalid configuration value for 'issuer': must not be empty"
        );
    }
}
