//! OAuth Token 响应与错误结构
//!
//! token 端点的成功响应（RFC 6749 Section 5.1，附加 OpenID Connect 的 `id_token`）
//! 和错误响应（RFC 6749 Section 5.2）。

use serde::{Deserialize, Serialize};

/// OAuth Token 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TokenType {
    /// Bearer Token
    #[default]
    Bearer,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenType::Bearer => write!(f, "Bearer"),
        }
    }
}

/// OAuth 2.0 / OpenID Connect Token 响应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// 访问令牌（JWT 或引用句柄）
    pub access_token: String,

    /// Token 类型（"Bearer"）
    pub token_type: TokenType,

    /// 访问令牌剩余有效期（秒）
    pub expires_in: u64,

    /// 身份令牌
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    /// 刷新令牌
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// 实际授予的 scope（空格分隔）
    pub scope: String,
}

impl TokenResponse {
    /// 创建新的 Token 响应
    pub fn new(access_token: impl Into<String>, expires_in: u64) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: TokenType::Bearer,
            expires_in,
            id_token: None,
            refresh_token: None,
            scope: String::new(),
        }
    }

    /// 设置身份令牌
    pub fn with_id_token(mut self, id_token: impl Into<String>) -> Self {
        self.id_token = Some(id_token.into());
        self
    }

    /// 设置刷新令牌
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// 设置授权范围
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// 授予的 scope 列表
    pub fn scopes(&self) -> Vec<&str> {
        self.scope.split_whitespace().collect()
    }
}

/// OAuth 错误代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthErrorCode {
    /// 请求缺少必需参数、包含无效参数值或格式错误
    InvalidRequest,
    /// 客户端认证失败
    InvalidClient,
    /// 授权码或刷新令牌无效、已过期、已撤销
    InvalidGrant,
    /// 客户端没有使用此方法请求授权的权限
    UnauthorizedClient,
    /// 不支持此授权类型
    UnsupportedGrantType,
    /// 请求的范围无效、未知或格式错误
    InvalidScope,
    /// 服务器遇到意外情况
    ServerError,
    /// 暂时无法处理请求
    TemporarilyUnavailable,
    /// 访问被拒绝
    AccessDenied,
    /// 不支持的响应类型
    UnsupportedResponseType,
    /// 需要用户同意（OpenID Connect）
    ConsentRequired,
    /// 访问令牌无效（RFC 6750）
    InvalidToken,
}

impl OAuthErrorCode {
    /// 协议中的错误代码字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthErrorCode::InvalidRequest => "invalid_request",
            OAuthErrorCode::InvalidClient => "invalid_client",
            OAuthErrorCode::InvalidGrant => "invalid_grant",
            OAuthErrorCode::UnauthorizedClient => "unauthorized_client",
            OAuthErrorCode::UnsupportedGrantType => "unsupported_grant_type",
            OAuthErrorCode::InvalidScope => "invalid_scope",
            OAuthErrorCode::ServerError => "server_error",
            OAuthErrorCode::TemporarilyUnavailable => "temporarily_unavailable",
            OAuthErrorCode::AccessDenied => "access_denied",
            OAuthErrorCode::UnsupportedResponseType => "unsupported_response_type",
            OAuthErrorCode::ConsentRequired => "consent_required",
            OAuthErrorCode::InvalidToken => "invalid_token",
        }
    }
}

impl std::fmt::Display for OAuthErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OAuth 错误响应
///
/// 由 [`crate::Error::to_response`] 生成
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// 错误代码
    pub error: OAuthErrorCode,

    /// 错误描述
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl ErrorResponse {
    /// 创建新的错误响应
    pub fn new(error: OAuthErrorCode) -> Self {
        Self {
            error,
            error_description: None,
        }
    }

    /// 设置错误描述
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.error_description = Some(description.into());
        self
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(desc) = &self.error_description {
            write!(f, ": {}", desc)?;
        }
        Ok(())
    }
}
