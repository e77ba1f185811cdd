//! 端点请求模型
//!
//! 这里只做参数提取：缺少必需参数时返回 `InvalidRequest`，其余协议校验
//! 都在各端点按固定顺序进行。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::oauth::client::GrantType;
use crate::oauth::introspection::TokenTypeHint;

/// 默认身份提供者
pub const LOCAL_IDP: &str = "local";

/// 已认证的终端用户
///
/// 认证界面不在本库范围内，宿主程序在完成登录后构造它并传给授权端点。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    /// 用户标识
    pub subject_id: String,
    /// 认证时间
    pub auth_time: DateTime<Utc>,
    /// 身份提供者
    pub idp: String,
    /// 用户 claim
    #[serde(default)]
    pub claims: BTreeMap<String, serde_json::Value>,
}

impl Subject {
    /// 创建用户
    pub fn new(subject_id: impl Into<String>, auth_time: DateTime<Utc>) -> Self {
        Self {
            subject_id: subject_id.into(),
            auth_time,
            idp: LOCAL_IDP.to_string(),
            claims: BTreeMap::new(),
        }
    }

    /// 设置身份提供者
    pub fn with_idp(mut self, idp: impl Into<String>) -> Self {
        self.idp = idp.into();
        self
    }

    /// 添加 claim，无法序列化的值会被忽略
    pub fn with_claim<V: Serialize>(mut self, name: impl Into<String>, value: V) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.claims.insert(name.into(), value);
        }
        self
    }
}

/// 把空格分隔的 scope 参数拆成列表
pub fn parse_scope(value: Option<&str>) -> Vec<String> {
    value
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn required(params: &HashMap<String, String>, name: &str) -> Result<String> {
    match params.get(name).map(|v| v.trim()) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(Error::invalid_request(format!("missing parameter '{}'", name))),
    }
}

fn optional(params: &HashMap<String, String>, name: &str) -> Option<String> {
    params
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// 解析 `application/x-www-form-urlencoded` 字符串，重复参数取第一个
pub fn parse_form(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(input.trim_start_matches('?').as_bytes()) {
        params
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    params
}

// ============================================================================
// 授权端点
// ============================================================================

/// 解析后的 response_type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseType {
    /// 返回授权码
    pub code: bool,
    /// 返回身份令牌
    pub id_token: bool,
    /// 返回访问令牌
    pub token: bool,
}

impl ResponseType {
    /// 解析 response_type（值的顺序无关）
    pub fn parse(value: &str) -> Result<Self> {
        let mut response_type = ResponseType {
            code: false,
            id_token: false,
            token: false,
        };
        let mut count = 0;
        for part in value.split_whitespace() {
            let slot = match part {
                "code" => &mut response_type.code,
                "id_token" => &mut response_type.id_token,
                "token" => &mut response_type.token,
                _ => return Err(Error::UnsupportedResponseType(value.to_string())),
            };
            if *slot {
                return Err(Error::UnsupportedResponseType(value.to_string()));
            }
            *slot = true;
            count += 1;
        }
        if count == 0 {
            return Err(Error::UnsupportedResponseType(value.to_string()));
        }
        Ok(response_type)
    }

    /// 对应的授权类型
    pub fn grant_type(&self) -> GrantType {
        match (self.code, self.id_token || self.token) {
            (true, false) => GrantType::AuthorizationCode,
            (true, true) => GrantType::Hybrid,
            (false, _) => GrantType::Implicit,
        }
    }

    /// 是否在前端通道返回令牌
    pub fn has_front_channel_tokens(&self) -> bool {
        self.id_token || self.token
    }

    /// 默认的响应模式：纯授权码用 query，其余用 fragment
    pub fn default_response_mode(&self) -> ResponseMode {
        if self.has_front_channel_tokens() {
            ResponseMode::Fragment
        } else {
            ResponseMode::Query
        }
    }
}

impl std::fmt::Display for ResponseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<&str> = [
            (self.code, "code"),
            (self.id_token, "id_token"),
            (self.token, "token"),
        ]
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, name)| *name)
        .collect();
        f.write_str(&parts.join(" "))
    }
}

/// 授权响应的返回方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// 追加到重定向 URI 的 query
    Query,
    /// 放在重定向 URI 的 fragment
    Fragment,
}

impl FromStr for ResponseMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "query" => Ok(ResponseMode::Query),
            "fragment" => Ok(ResponseMode::Fragment),
            _ => Err(Error::invalid_request(format!(
                "unsupported response_mode '{}'",
                s
            ))),
        }
    }
}

/// 授权请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeRequest {
    /// response_type 原始值
    pub response_type: String,
    /// 客户端 ID
    pub client_id: String,
    /// 重定向 URI
    pub redirect_uri: String,
    /// 请求的 scope
    pub scopes: Vec<String>,
    /// 客户端状态
    pub state: Option<String>,
    /// nonce
    pub nonce: Option<String>,
    /// PKCE challenge
    pub code_challenge: Option<String>,
    /// PKCE 方法
    pub code_challenge_method: Option<String>,
    /// 响应模式
    pub response_mode: Option<String>,
}

impl AuthorizeRequest {
    /// 创建授权请求
    pub fn new(
        response_type: impl Into<String>,
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            response_type: response_type.into(),
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            scopes: Vec::new(),
            state: None,
            nonce: None,
            code_challenge: None,
            code_challenge_method: None,
            response_mode: None,
        }
    }

    /// 从 query 参数解析
    pub fn from_query(params: &HashMap<String, String>) -> Result<Self> {
        Ok(Self {
            response_type: required(params, "response_type")?,
            client_id: required(params, "client_id")?,
            redirect_uri: required(params, "redirect_uri")?,
            scopes: parse_scope(params.get("scope").map(String::as_str)),
            state: optional(params, "state"),
            nonce: optional(params, "nonce"),
            code_challenge: optional(params, "code_challenge"),
            code_challenge_method: optional(params, "code_challenge_method"),
            response_mode: optional(params, "response_mode"),
        })
    }

    /// 从 query 字符串解析
    pub fn from_query_string(query: &str) -> Result<Self> {
        Self::from_query(&parse_form(query))
    }

    /// 设置 scope（空格分隔）
    pub fn with_scope(mut self, scope: &str) -> Self {
        self.scopes = parse_scope(Some(scope));
        self
    }

    /// 设置 state
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// 设置 nonce
    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    /// 设置 PKCE challenge
    pub fn with_code_challenge(
        mut self,
        challenge: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        self.code_challenge = Some(challenge.into());
        self.code_challenge_method = Some(method.into());
        self
    }

    /// 设置响应模式
    pub fn with_response_mode(mut self, mode: impl Into<String>) -> Self {
        self.response_mode = Some(mode.into());
        self
    }
}

// ============================================================================
// Token 端点
// ============================================================================

/// Token 请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    /// 授权类型
    pub grant_type: String,
    /// 客户端 ID
    pub client_id: Option<String>,
    /// 客户端密钥
    pub client_secret: Option<String>,
    /// 授权码
    pub code: Option<String>,
    /// 重定向 URI
    pub redirect_uri: Option<String>,
    /// PKCE verifier
    pub code_verifier: Option<String>,
    /// 刷新令牌
    pub refresh_token: Option<String>,
    /// 请求的 scope
    pub scopes: Vec<String>,
}

impl TokenRequest {
    /// 创建请求
    pub fn new(grant_type: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            grant_type: grant_type.into(),
            client_id: Some(client_id.into()),
            client_secret: None,
            code: None,
            redirect_uri: None,
            code_verifier: None,
            refresh_token: None,
            scopes: Vec::new(),
        }
    }

    /// 授权码请求
    pub fn authorization_code(
        client_id: impl Into<String>,
        code: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        let mut request = Self::new("authorization_code", client_id);
        request.code = Some(code.into());
        request.redirect_uri = Some(redirect_uri.into());
        request
    }

    /// 客户端凭证请求
    pub fn client_credentials(client_id: impl Into<String>) -> Self {
        Self::new("client_credentials", client_id)
    }

    /// 刷新令牌请求
    pub fn refresh_token(client_id: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        let mut request = Self::new("refresh_token", client_id);
        request.refresh_token = Some(refresh_token.into());
        request
    }

    /// 从表单参数解析
    pub fn from_form(params: &HashMap<String, String>) -> Result<Self> {
        Ok(Self {
            grant_type: required(params, "grant_type")?,
            client_id: optional(params, "client_id"),
            client_secret: optional(params, "client_secret"),
            code: optional(params, "code"),
            redirect_uri: optional(params, "redirect_uri"),
            code_verifier: optional(params, "code_verifier"),
            refresh_token: optional(params, "refresh_token"),
            scopes: parse_scope(params.get("scope").map(String::as_str)),
        })
    }

    /// 设置客户端密钥
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// 设置 PKCE verifier
    pub fn with_code_verifier(mut self, verifier: impl Into<String>) -> Self {
        self.code_verifier = Some(verifier.into());
        self
    }

    /// 设置 scope（空格分隔）
    pub fn with_scope(mut self, scope: &str) -> Self {
        self.scopes = parse_scope(Some(scope));
        self
    }
}

/// 撤销请求 (RFC 7009)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationRequest {
    /// 要撤销的令牌
    pub token: String,
    /// 类型提示
    pub token_type_hint: Option<TokenTypeHint>,
    /// 客户端 ID
    pub client_id: Option<String>,
    /// 客户端密钥
    pub client_secret: Option<String>,
}

impl RevocationRequest {
    /// 创建请求
    pub fn new(client_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            token_type_hint: None,
            client_id: Some(client_id.into()),
            client_secret: None,
        }
    }

    /// 从表单参数解析；无法识别的类型提示会被忽略
    pub fn from_form(params: &HashMap<String, String>) -> Result<Self> {
        Ok(Self {
            token: required(params, "token")?,
            token_type_hint: optional(params, "token_type_hint")
                .and_then(|hint| TokenTypeHint::from_str(&hint).ok()),
            client_id: optional(params, "client_id"),
            client_secret: optional(params, "client_secret"),
        })
    }

    /// 设置客户端密钥
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_type_flows() {
        let cases = [
            ("code", GrantType::AuthorizationCode),
            ("code id_token", GrantType::Hybrid),
            ("token code", GrantType::Hybrid),
            ("code id_token token", GrantType::Hybrid),
            ("id_token", GrantType::Implicit),
            ("id_token token", GrantType::Implicit),
            ("token", GrantType::Implicit),
        ];
        for (value, expected) in cases {
            assert_eq!(ResponseType::parse(value).unwrap().grant_type(), expected, "{}", value);
        }
    }

    #[test]
    fn test_response_type_rejects_unknown() {
        for value in ["", "code code", "code device", "none"] {
            assert!(matches!(
                ResponseType::parse(value),
                Err(Error::UnsupportedResponseType(_))
            ));
        }
    }

    #[test]
    fn test_response_mode_defaults() {
        assert_eq!(
            ResponseType::parse("code").unwrap().default_response_mode(),
            ResponseMode::Query
        );
        assert_eq!(
            ResponseType::parse("code id_token").unwrap().default_response_mode(),
            ResponseMode::Fragment
        );
        assert_eq!(
            ResponseType::parse("token id_token").unwrap().to_string(),
            "id_token token"
        );
    }

    #[test]
    fn test_authorize_from_query_string() {
        let request = AuthorizeRequest::from_query_string(
            "?response_type=code&client_id=native.code&redirect_uri=https%3A%2F%2Fnotused\
             &scope=openid%20profile%20api&state=xyz&code_challenge=abc&code_challenge_method=S256",
        )
        .unwrap();

        assert_eq!(request.client_id, "native.code");
        assert_eq!(request.redirect_uri, "https://notused");
        assert_eq!(request.scopes, vec!["openid", "profile", "api"]);
        assert_eq!(request.state.as_deref(), Some("xyz"));
        assert_eq!(request.code_challenge_method.as_deref(), Some("S256"));
        assert!(request.nonce.is_none());
    }

    #[test]
    fn test_missing_parameter() {
        let params = parse_form("response_type=code&client_id=web");
        assert!(matches!(
            AuthorizeRequest::from_query(&params),
            Err(Error::InvalidRequest(msg)) if msg.contains("redirect_uri")
        ));

        let params = parse_form("client_id=web");
        assert!(matches!(
            TokenRequest::from_form(&params),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_token_request_from_form() {
        let params = parse_form(
            "grant_type=authorization_code&code=abc&redirect_uri=https%3A%2F%2Fnotused\
             &client_id=native.code&code_verifier=v",
        );
        let request = TokenRequest::from_form(&params).unwrap();
        assert_eq!(request.grant_type, "authorization_code");
        assert_eq!(request.code.as_deref(), Some("abc"));
        assert!(request.client_secret.is_none());
        assert!(request.scopes.is_empty());
    }

    #[test]
    fn test_revocation_request_hint() {
        let params = parse_form("token=abc&token_type_hint=refresh_token&client_id=web");
        let request = RevocationRequest::from_form(&params).unwrap();
        assert_eq!(request.token_type_hint, Some(TokenTypeHint::RefreshToken));

        let params = parse_form("token=abc&token_type_hint=bogus");
        let request = RevocationRequest::from_form(&params).unwrap();
        assert!(request.token_type_hint.is_none());
    }

    #[test]
    fn test_subject_claims() {
        let subject = Subject::new("alice", Utc::now())
            .with_claim("email", "alice@example.com")
            .with_claim("email_verified", true);
        assert_eq!(subject.idp, LOCAL_IDP);
        assert_eq!(subject.claims["email_verified"], true);
    }
}
