//! OAuth 客户端定义模块
//!
//! 客户端是不可变的数据记录，只能通过 [`ClientBuilder`] 构建。
//! 无效的组合（例如要求 PKCE 却没有重定向 URI）在构建时就会被拒绝，
//! 而不是在请求处理时才暴露出来。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{ConfigError, Error, Result};
use crate::random::{constant_time_compare_str, sha256_hex};

/// `offline_access` scope，请求刷新令牌时使用
pub const OFFLINE_ACCESS: &str = "offline_access";

/// 客户端允许的授权类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    /// 授权码模式
    AuthorizationCode,
    /// 混合模式（授权码 + 前端通道 token）
    Hybrid,
    /// 客户端凭证模式
    ClientCredentials,
    /// 隐式授权
    Implicit,
}

impl GrantType {
    /// 是否需要用户交互（有重定向）
    pub fn is_interactive(&self) -> bool {
        !matches!(self, GrantType::ClientCredentials)
    }

    /// 是否会在 token 端点使用客户端密钥
    pub fn uses_token_endpoint(&self) -> bool {
        !matches!(self, GrantType::Implicit)
    }

    /// 是否签发授权码
    pub fn issues_code(&self) -> bool {
        matches!(self, GrantType::AuthorizationCode | GrantType::Hybrid)
    }

    /// 对应的参数字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::Hybrid => "hybrid",
            GrantType::ClientCredentials => "client_credentials",
            GrantType::Implicit => "implicit",
        }
    }
}

impl std::fmt::Display for GrantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GrantType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "authorization_code" => Ok(GrantType::AuthorizationCode),
            "hybrid" => Ok(GrantType::Hybrid),
            "client_credentials" => Ok(GrantType::ClientCredentials),
            "implicit" => Ok(GrantType::Implicit),
            _ => Err(Error::UnsupportedGrantType(s.to_string())),
        }
    }
}

/// 访问令牌的表示形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessTokenType {
    /// 自包含的签名 JWT
    #[default]
    Jwt,
    /// 引用令牌：不透明句柄，验证时需要查询存储
    Reference,
}

/// 刷新令牌的使用策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenUsage {
    /// 可重复使用，句柄保持不变
    ReUse,
    /// 一次性使用，每次刷新都轮换
    #[default]
    OneTimeOnly,
}

/// 刷新令牌的过期策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenExpiration {
    /// 每次使用后顺延（不超过绝对有效期）
    Sliding,
    /// 固定的绝对有效期
    #[default]
    Absolute,
}

/// 客户端密钥
///
/// 只保存 SHA-256 哈希，明文不落盘
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    /// 密钥哈希（十六进制）
    pub value: String,

    /// 描述
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// 过期时间
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

impl Secret {
    /// 由明文创建（存储其 SHA-256 哈希）
    pub fn sha256(plain: &str) -> Self {
        Self {
            value: sha256_hex(plain),
            description: None,
            expiration: None,
        }
    }

    /// 设置描述
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// 设置过期时间
    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// 检查是否已过期
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|exp| exp <= now)
    }

    /// 常量时间比较明文与哈希
    pub fn matches(&self, plain: &str) -> bool {
        constant_time_compare_str(&sha256_hex(plain), &self.value)
    }
}

/// 已注册的 OAuth 客户端
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// 客户端 ID（在注册表中唯一）
    pub client_id: String,

    /// 显示名称
    pub client_name: Option<String>,

    /// 客户端密钥（哈希）
    pub secrets: Vec<Secret>,

    /// 是否要求客户端在 token 端点认证
    pub require_client_secret: bool,

    /// 允许的授权类型
    pub allowed_grant_types: BTreeSet<GrantType>,

    /// 允许的重定向 URI（精确匹配）
    pub redirect_uris: Vec<String>,

    /// 允许的登出后重定向 URI
    pub post_logout_redirect_uris: Vec<String>,

    /// 前端通道登出 URI
    pub front_channel_logout_uri: Option<String>,

    /// 允许的 scope
    pub allowed_scopes: BTreeSet<String>,

    /// 是否要求 PKCE
    pub require_pkce: bool,

    /// 是否允许 `plain` 方式的 PKCE
    pub allow_plain_text_pkce: bool,

    /// 是否允许离线访问（刷新令牌）
    pub allow_offline_access: bool,

    /// 是否允许通过浏览器返回访问令牌
    pub allow_access_tokens_via_browser: bool,

    /// 是否需要用户授权同意
    pub require_consent: bool,

    /// 即使同时签发了访问令牌，也在 id_token 中包含用户 claims
    pub always_include_user_claims_in_id_token: bool,

    /// 访问令牌有效期（秒）
    pub access_token_lifetime: u64,

    /// 身份令牌有效期（秒）
    pub identity_token_lifetime: u64,

    /// 授权码有效期（秒）
    pub authorization_code_lifetime: u64,

    /// 刷新令牌绝对有效期（秒）
    pub absolute_refresh_token_lifetime: u64,

    /// 刷新令牌滑动有效期（秒）
    pub sliding_refresh_token_lifetime: u64,

    /// 刷新令牌使用策略
    pub refresh_token_usage: TokenUsage,

    /// 刷新令牌过期策略
    pub refresh_token_expiration: TokenExpiration,

    /// 访问令牌类型
    pub access_token_type: AccessTokenType,

    /// 是否启用
    pub enabled: bool,
}

impl Client {
    /// 创建构建器
    pub fn builder(client_id: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(client_id)
    }

    /// 检查是否允许指定的授权类型
    pub fn allows_grant_type(&self, grant_type: GrantType) -> bool {
        self.allowed_grant_types.contains(&grant_type)
    }

    /// 检查是否允许指定的重定向 URI（精确匹配）
    pub fn allows_redirect_uri(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|allowed| allowed == uri)
    }

    /// 检查是否允许指定的 scope
    ///
    /// `offline_access` 只在允许离线访问时有效
    pub fn allows_scope(&self, scope: &str) -> bool {
        if scope == OFFLINE_ACCESS {
            return self.allow_offline_access;
        }
        self.allowed_scopes.contains(scope)
    }

    /// 返回第一个不被允许的 scope
    pub fn first_disallowed_scope<'a>(&self, scopes: &'a [String]) -> Option<&'a str> {
        scopes
            .iter()
            .find(|s| !self.allows_scope(s))
            .map(String::as_str)
    }

    /// 是否使用交互式授权类型
    pub fn is_interactive(&self) -> bool {
        self.allowed_grant_types.iter().any(GrantType::is_interactive)
    }

    /// 是否有未过期的密钥
    pub fn has_active_secret(&self, now: DateTime<Utc>) -> bool {
        self.secrets.iter().any(|s| !s.is_expired(now))
    }

    /// 验证客户端密钥（忽略已过期的密钥）
    pub fn verify_secret(&self, plain: &str, now: DateTime<Utc>) -> bool {
        self.secrets
            .iter()
            .filter(|s| !s.is_expired(now))
            .any(|s| s.matches(plain))
    }

    /// 访问令牌有效期
    pub fn access_token_ttl(&self) -> Duration {
        seconds(self.access_token_lifetime)
    }

    /// 身份令牌有效期
    pub fn identity_token_ttl(&self) -> Duration {
        seconds(self.identity_token_lifetime)
    }

    /// 授权码有效期
    pub fn authorization_code_ttl(&self) -> Duration {
        seconds(self.authorization_code_lifetime)
    }

    /// 刷新令牌绝对有效期
    pub fn absolute_refresh_token_ttl(&self) -> Duration {
        seconds(self.absolute_refresh_token_lifetime)
    }

    /// 刷新令牌滑动有效期（仅 Sliding 策略）
    pub fn sliding_refresh_token_ttl(&self) -> Option<Duration> {
        match self.refresh_token_expiration {
            TokenExpiration::Sliding => Some(seconds(self.sliding_refresh_token_lifetime)),
            TokenExpiration::Absolute => None,
        }
    }
}

fn seconds(value: u64) -> Duration {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// 客户端构建器
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    client: Client,
    require_client_secret: Option<bool>,
}

impl ClientBuilder {
    /// 创建新的构建器，所有有效期使用默认值
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client: Client {
                client_id: client_id.into(),
                client_name: None,
                secrets: Vec::new(),
                require_client_secret: true,
                allowed_grant_types: BTreeSet::new(),
                redirect_uris: Vec::new(),
                post_logout_redirect_uris: Vec::new(),
                front_channel_logout_uri: None,
                allowed_scopes: BTreeSet::new(),
                require_pkce: false,
                allow_plain_text_pkce: false,
                allow_offline_access: false,
                allow_access_tokens_via_browser: false,
                require_consent: false,
                always_include_user_claims_in_id_token: false,
                access_token_lifetime: 3600,
                identity_token_lifetime: 300,
                authorization_code_lifetime: 300,
                absolute_refresh_token_lifetime: 2_592_000,
                sliding_refresh_token_lifetime: 1_296_000,
                refresh_token_usage: TokenUsage::OneTimeOnly,
                refresh_token_expiration: TokenExpiration::Absolute,
                access_token_type: AccessTokenType::Jwt,
                enabled: true,
            },
            require_client_secret: None,
        }
    }

    /// 设置显示名称
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client.client_name = Some(name.into());
        self
    }

    /// 添加密钥
    pub fn secret(mut self, secret: Secret) -> Self {
        self.client.secrets.push(secret);
        self
    }

    /// 设置是否要求客户端密钥
    ///
    /// 未设置时：只要有授权类型会访问 token 端点就要求密钥
    pub fn require_client_secret(mut self, required: bool) -> Self {
        self.require_client_secret = Some(required);
        self
    }

    /// 添加授权类型
    pub fn grant_type(mut self, grant_type: GrantType) -> Self {
        self.client.allowed_grant_types.insert(grant_type);
        self
    }

    /// 添加多个授权类型
    pub fn grant_types(mut self, grant_types: impl IntoIterator<Item = GrantType>) -> Self {
        self.client.allowed_grant_types.extend(grant_types);
        self
    }

    /// 添加重定向 URI
    pub fn redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.client.redirect_uris.push(uri.into());
        self
    }

    /// 添加登出后重定向 URI
    pub fn post_logout_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.client.post_logout_redirect_uris.push(uri.into());
        self
    }

    /// 设置前端通道登出 URI
    pub fn front_channel_logout_uri(mut self, uri: impl Into<String>) -> Self {
        self.client.front_channel_logout_uri = Some(uri.into());
        self
    }

    /// 添加允许的 scope
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.client.allowed_scopes.insert(scope.into());
        self
    }

    /// 添加多个允许的 scope
    pub fn scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.client
            .allowed_scopes
            .extend(scopes.into_iter().map(Into::into));
        self
    }

    /// 设置是否要求 PKCE
    pub fn require_pkce(mut self, required: bool) -> Self {
        self.client.require_pkce = required;
        self
    }

    /// 设置是否允许 plain PKCE
    pub fn allow_plain_text_pkce(mut self, allowed: bool) -> Self {
        self.client.allow_plain_text_pkce = allowed;
        self
    }

    /// 设置是否允许离线访问
    pub fn allow_offline_access(mut self, allowed: bool) -> Self {
        self.client.allow_offline_access = allowed;
        self
    }

    /// 设置是否允许通过浏览器返回访问令牌
    pub fn allow_access_tokens_via_browser(mut self, allowed: bool) -> Self {
        self.client.allow_access_tokens_via_browser = allowed;
        self
    }

    /// 设置是否需要用户同意
    pub fn require_consent(mut self, required: bool) -> Self {
        self.client.require_consent = required;
        self
    }

    /// 设置是否总在 id_token 中包含用户 claims
    pub fn always_include_user_claims_in_id_token(mut self, include: bool) -> Self {
        self.client.always_include_user_claims_in_id_token = include;
        self
    }

    /// 设置访问令牌有效期（秒）
    pub fn access_token_lifetime(mut self, seconds: u64) -> Self {
        self.client.access_token_lifetime = seconds;
        self
    }

    /// 设置身份令牌有效期（秒）
    pub fn identity_token_lifetime(mut self, seconds: u64) -> Self {
        self.client.identity_token_lifetime = seconds;
        self
    }

    /// 设置授权码有效期（秒）
    pub fn authorization_code_lifetime(mut self, seconds: u64) -> Self {
        self.client.authorization_code_lifetime = seconds;
        self
    }

    /// 设置刷新令牌绝对有效期（秒）
    pub fn absolute_refresh_token_lifetime(mut self, seconds: u64) -> Self {
        self.client.absolute_refresh_token_lifetime = seconds;
        self
    }

    /// 设置刷新令牌滑动有效期（秒）
    pub fn sliding_refresh_token_lifetime(mut self, seconds: u64) -> Self {
        self.client.sliding_refresh_token_lifetime = seconds;
        self
    }

    /// 设置刷新令牌使用策略
    pub fn refresh_token_usage(mut self, usage: TokenUsage) -> Self {
        self.client.refresh_token_usage = usage;
        self
    }

    /// 设置刷新令牌过期策略
    pub fn refresh_token_expiration(mut self, expiration: TokenExpiration) -> Self {
        self.client.refresh_token_expiration = expiration;
        self
    }

    /// 设置访问令牌类型
    pub fn access_token_type(mut self, token_type: AccessTokenType) -> Self {
        self.client.access_token_type = token_type;
        self
    }

    /// 设置是否启用
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.client.enabled = enabled;
        self
    }

    /// 构建客户端
    ///
    /// 在这里拒绝所有无效组合
    pub fn build(self) -> Result<Client> {
        let mut client = self.client;

        if client.client_id.trim().is_empty() {
            return Err(invalid("client_id", "must not be empty"));
        }

        let grants = client.allowed_grant_types.clone();
        if grants.is_empty() {
            return Err(invalid(
                "allowed_grant_types",
                "at least one grant type is required",
            ));
        }
        if grants.contains(&GrantType::Implicit)
            && (grants.contains(&GrantType::AuthorizationCode)
                || grants.contains(&GrantType::Hybrid))
        {
            return Err(invalid(
                "allowed_grant_types",
                "implicit cannot be combined with authorization_code or hybrid",
            ));
        }
        if grants.contains(&GrantType::AuthorizationCode) && grants.contains(&GrantType::Hybrid) {
            return Err(invalid(
                "allowed_grant_types",
                "authorization_code cannot be combined with hybrid",
            ));
        }

        let uses_token_endpoint = grants.iter().any(GrantType::uses_token_endpoint);
        client.require_client_secret = self.require_client_secret.unwrap_or(uses_token_endpoint);
        if client.require_client_secret && !client.has_active_secret(Utc::now()) {
            return Err(invalid(
                "secrets",
                "a non-expired secret is required when require_client_secret is set",
            ));
        }

        if client.is_interactive() && client.redirect_uris.is_empty() {
            return Err(invalid(
                "redirect_uris",
                "interactive grant types require at least one redirect URI",
            ));
        }
        for uri in client
            .redirect_uris
            .iter()
            .chain(client.post_logout_redirect_uris.iter())
            .chain(client.front_channel_logout_uri.iter())
        {
            validate_absolute_uri(uri)?;
        }

        if client.require_pkce && !grants.iter().any(GrantType::issues_code) {
            return Err(invalid(
                "require_pkce",
                "PKCE requires the authorization_code or hybrid grant type",
            ));
        }

        if client.allow_offline_access && !grants.iter().any(GrantType::issues_code) {
            return Err(invalid(
                "allow_offline_access",
                "refresh tokens require the authorization_code or hybrid grant type",
            ));
        }

        for (key, value) in [
            ("access_token_lifetime", client.access_token_lifetime),
            ("identity_token_lifetime", client.identity_token_lifetime),
            ("authorization_code_lifetime", client.authorization_code_lifetime),
            (
                "absolute_refresh_token_lifetime",
                client.absolute_refresh_token_lifetime,
            ),
            (
                "sliding_refresh_token_lifetime",
                client.sliding_refresh_token_lifetime,
            ),
        ] {
            if value == 0 {
                return Err(invalid(key, "must be greater than zero"));
            }
        }

        if client.allowed_scopes.contains(OFFLINE_ACCESS) {
            return Err(invalid(
                "allowed_scopes",
                "offline_access is controlled by allow_offline_access",
            ));
        }

        Ok(client)
    }
}

fn invalid(key: &str, message: &str) -> Error {
    Error::Config(ConfigError::invalid(key, message))
}

/// 校验 URI 是带 scheme 的绝对 URI
fn validate_absolute_uri(uri: &str) -> Result<()> {
    let parsed = url::Url::parse(uri)
        .map_err(|e| invalid("redirect_uris", &format!("'{}': {}", uri, e)))?;
    if parsed.fragment().is_some() {
        return Err(invalid(
            "redirect_uris",
            &format!("'{}' must not contain a fragment", uri),
        ));
    }
    Ok(())
}
