//! OAuth 2.0 Token 内省 (RFC 7662) 与撤销 (RFC 7009) 的请求/响应结构
//!
//! API 资源用自己的名称和密钥认证后，向服务器查询访问令牌的状态。
//! 撤销请求共用 [`TokenTypeHint`]。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Token 内省请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntrospectionRequest {
    /// 要内省的令牌（必需）
    pub token: String,

    /// 令牌类型提示
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type_hint: Option<TokenTypeHint>,
}

impl IntrospectionRequest {
    /// 为给定令牌创建新的内省请求
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            token_type_hint: None,
        }
    }

    /// 设置令牌类型提示
    pub fn with_type_hint(mut self, hint: TokenTypeHint) -> Self {
        self.token_type_hint = Some(hint);
        self
    }
}

/// 令牌类型提示
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenTypeHint {
    /// 访问令牌
    AccessToken,
    /// 刷新令牌
    RefreshToken,
}

impl std::str::FromStr for TokenTypeHint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "access_token" => Ok(TokenTypeHint::AccessToken),
            "refresh_token" => Ok(TokenTypeHint::RefreshToken),
            other => Err(Error::invalid_request(format!(
                "unsupported token_type_hint: {}",
                other
            ))),
        }
    }
}

/// Token 内省响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrospectionResponse {
    /// 令牌是否活跃，响应中唯一必需的字段
    pub active: bool,

    /// 以空格分隔的 scope 列表
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// 客户端标识符
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// 令牌类型（"Bearer"）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    /// 过期时间戳
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    /// 签发时间戳
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// 生效时间戳
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,

    /// 令牌主题
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// 令牌受众
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aud: Vec<String>,

    /// 令牌签发者
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// 令牌唯一标识
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,

    /// 额外声明（`auth_time`、`idp` 等）
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl IntrospectionResponse {
    /// 创建表示令牌无效的响应
    pub fn inactive() -> Self {
        Self {
            active: false,
            scope: None,
            client_id: None,
            token_type: None,
            exp: None,
            iat: None,
            nbf: None,
            sub: None,
            aud: Vec::new(),
            iss: None,
            jti: None,
            extra: HashMap::new(),
        }
    }

    /// 创建表示令牌有效的响应
    pub fn active() -> IntrospectionResponseBuilder {
        IntrospectionResponseBuilder::new()
    }

    /// 获取过期时间
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|ts| DateTime::from_timestamp(ts, 0))
    }

    /// 获取 scope 列表
    pub fn scopes(&self) -> Vec<&str> {
        self.scope
            .as_ref()
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// 检查令牌是否具有指定的 scope
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes().contains(&scope)
    }
}

impl Default for IntrospectionResponse {
    fn default() -> Self {
        Self::inactive()
    }
}

/// 活跃令牌内省响应的构建器
#[derive(Debug, Default)]
pub struct IntrospectionResponseBuilder {
    scope: Option<String>,
    client_id: Option<String>,
    exp: Option<i64>,
    iat: Option<i64>,
    nbf: Option<i64>,
    sub: Option<String>,
    aud: Vec<String>,
    iss: Option<String>,
    jti: Option<String>,
    extra: HashMap<String, serde_json::Value>,
}

impl IntrospectionResponseBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self::default()
    }

    /// 从列表设置 scope
    pub fn scopes<S: AsRef<str>>(mut self, scopes: &[S]) -> Self {
        let joined: Vec<&str> = scopes.iter().map(|s| s.as_ref()).collect();
        self.scope = Some(joined.join(" "));
        self
    }

    /// 设置客户端 ID
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// 设置过期时间戳
    pub fn exp(mut self, exp: i64) -> Self {
        self.exp = Some(exp);
        self
    }

    /// 设置签发时间戳
    pub fn iat(mut self, iat: i64) -> Self {
        self.iat = Some(iat);
        self
    }

    /// 设置生效时间戳
    pub fn nbf(mut self, nbf: i64) -> Self {
        self.nbf = Some(nbf);
        self
    }

    /// 设置主题
    pub fn sub(mut self, sub: Option<String>) -> Self {
        self.sub = sub;
        self
    }

    /// 设置受众
    pub fn aud(mut self, aud: Vec<String>) -> Self {
        self.aud = aud;
        self
    }

    /// 设置签发者
    pub fn iss(mut self, iss: impl Into<String>) -> Self {
        self.iss = Some(iss.into());
        self
    }

    /// 设置 JWT ID
    pub fn jti(mut self, jti: impl Into<String>) -> Self {
        self.jti = Some(jti.into());
        self
    }

    /// 添加自定义声明
    pub fn claim(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.extra.insert(key.into(), v);
        }
        self
    }

    /// 构建内省响应
    pub fn build(self) -> IntrospectionResponse {
        IntrospectionResponse {
            active: true,
            scope: self.scope,
            client_id: self.client_id,
            token_type: Some("Bearer".to_string()),
            exp: self.exp,
            iat: self.iat,
            nbf: self.nbf,
            sub: self.sub,
            aud: self.aud,
            iss: self.iss,
            jti: self.jti,
            extra: self.extra,
        }
    }
}
