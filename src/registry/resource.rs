//! 资源注册表
//!
//! 身份资源（claims 集合，如 `profile`、`email`）和 API 资源（受保护的受众）
//! 以不可变快照的形式保存，`reload` 时整体替换。
//!
//! ## 示例
//!
//! ```rust
//! use oidcrs::registry::{ApiResource, IdentityResource, ResourceRegistry, ScopePolicy};
//!
//! let registry = ResourceRegistry::new(
//!     vec![IdentityResource::openid(), IdentityResource::profile()],
//!     vec![ApiResource::new("api", "Demo API")],
//!     ScopePolicy::Strict,
//! )
//! .unwrap();
//!
//! let resources = registry
//!     .resolve_scopes(&["openid".to_string(), "api".to_string()])
//!     .unwrap();
//! assert!(resources.has_openid());
//! assert_eq!(resources.audiences(), vec!["api"]);
//! ```

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::error::{ConfigError, Error, Result};
use crate::oauth::client::{OFFLINE_ACCESS, Secret};

/// `openid` scope
pub const OPENID: &str = "openid";

// ============================================================================
// 资源定义
// ============================================================================

/// 身份资源：一组用户 claim 类型，以一个 scope 名称暴露
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityResource {
    /// 名称（同时是 scope 名称）
    pub name: String,

    /// 显示名称
    pub display_name: Option<String>,

    /// 包含的 claim 类型
    pub user_claims: Vec<String>,

    /// 授权同意页面上不可取消
    pub required: bool,

    /// 在授权同意页面上强调
    pub emphasize: bool,

    /// 是否启用
    pub enabled: bool,
}

impl IdentityResource {
    /// 创建身份资源
    pub fn new<I, S>(name: impl Into<String>, user_claims: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            display_name: None,
            user_claims: user_claims.into_iter().map(Into::into).collect(),
            required: false,
            emphasize: false,
            enabled: true,
        }
    }

    /// 设置显示名称
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// 标准 `openid` 资源
    pub fn openid() -> Self {
        Self {
            required: true,
            ..Self::new(OPENID, ["sub"]).with_display_name("Your user identifier")
        }
    }

    /// 标准 `profile` 资源
    pub fn profile() -> Self {
        Self {
            emphasize: true,
            ..Self::new(
                "profile",
                [
                    "name",
                    "family_name",
                    "given_name",
                    "middle_name",
                    "nickname",
                    "preferred_username",
                    "profile",
                    "picture",
                    "website",
                    "gender",
                    "birthdate",
                    "zoneinfo",
                    "locale",
                    "updated_at",
                ],
            )
            .with_display_name("User profile")
        }
    }

    /// 标准 `email` 资源
    pub fn email() -> Self {
        Self {
            emphasize: true,
            ..Self::new("email", ["email", "email_verified"])
                .with_display_name("Your email address")
        }
    }
}

/// API 资源：一个受众，暴露一个或多个 scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResource {
    /// 名称（作为访问令牌的 `aud`）
    pub name: String,

    /// 显示名称
    pub display_name: Option<String>,

    /// 内省时使用的密钥（哈希）
    pub api_secrets: Vec<Secret>,

    /// 暴露的 scope
    pub scopes: Vec<String>,

    /// 访问令牌中需要包含的用户 claim 类型
    pub user_claims: Vec<String>,

    /// 是否启用
    pub enabled: bool,
}

impl ApiResource {
    /// 创建 API 资源，默认暴露一个与资源同名的 scope
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            scopes: vec![name.clone()],
            name,
            display_name: Some(display_name.into()),
            api_secrets: Vec::new(),
            user_claims: Vec::new(),
            enabled: true,
        }
    }

    /// 添加密钥
    pub fn with_secret(mut self, secret: Secret) -> Self {
        self.api_secrets.push(secret);
        self
    }

    /// 替换暴露的 scope
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// 添加用户 claim 类型
    pub fn with_user_claim(mut self, claim: impl Into<String>) -> Self {
        self.user_claims.push(claim.into());
        self
    }

    /// 验证 API 密钥（忽略已过期的密钥）
    pub fn verify_secret(&self, plain: &str, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.api_secrets
            .iter()
            .filter(|s| !s.is_expired(now))
            .any(|s| s.matches(plain))
    }
}

// ============================================================================
// Scope 解析
// ============================================================================

/// 未知 scope 的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScopePolicy {
    /// 任何未知 scope 都导致 `InvalidScope`
    #[default]
    Strict,
    /// 丢弃未知 scope，并记录在 [`Resources::unknown`] 中
    Lenient,
}

impl std::str::FromStr for ScopePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(ScopePolicy::Strict),
            "lenient" => Ok(ScopePolicy::Lenient),
            other => Err(Error::Config(ConfigError::invalid(
                "scope_policy",
                format!("expected 'strict' or 'lenient', got '{}'", other),
            ))),
        }
    }
}

/// scope 解析结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    /// 匹配到的身份资源
    pub identity_resources: Vec<IdentityResource>,

    /// 匹配到的 API 资源（按名称去重）
    pub api_resources: Vec<ApiResource>,

    /// 是否请求了 `offline_access`
    pub offline_access: bool,

    /// 被接受的 scope，保持请求顺序
    pub scopes: Vec<String>,

    /// 被丢弃的未知 scope（仅 `Lenient` 策略）
    pub unknown: Vec<String>,
}

impl Resources {
    /// 是否包含 `openid`
    pub fn has_openid(&self) -> bool {
        self.identity_resources.iter().any(|r| r.name == OPENID)
    }

    /// 是否包含任何身份资源
    pub fn has_identity_scopes(&self) -> bool {
        !self.identity_resources.is_empty()
    }

    /// 访问令牌受众（API 资源名称）
    pub fn audiences(&self) -> Vec<&str> {
        self.api_resources.iter().map(|r| r.name.as_str()).collect()
    }

    /// 身份资源覆盖的 claim 类型
    pub fn identity_claim_types(&self) -> HashSet<&str> {
        self.identity_resources
            .iter()
            .flat_map(|r| r.user_claims.iter().map(String::as_str))
            .collect()
    }

    /// API 资源要求的 claim 类型
    pub fn api_claim_types(&self) -> HashSet<&str> {
        self.api_resources
            .iter()
            .flat_map(|r| r.user_claims.iter().map(String::as_str))
            .collect()
    }

    /// 以空格连接的 scope 字符串
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }
}

// ============================================================================
// 注册表
// ============================================================================

/// 资源快照
#[derive(Debug, Default)]
pub struct ResourceSnapshot {
    identity: HashMap<String, IdentityResource>,
    apis: HashMap<String, ApiResource>,
    api_scopes: HashMap<String, String>,
}

impl ResourceSnapshot {
    /// 校验唯一性后构建快照，禁用的资源不进入快照
    pub fn build(identity: Vec<IdentityResource>, apis: Vec<ApiResource>) -> Result<Self> {
        let mut snapshot = Self::default();

        for resource in identity {
            if resource.name.is_empty() {
                return Err(Error::Config(ConfigError::MissingRequired(
                    "identity resource name".to_string(),
                )));
            }
            if resource.name == OFFLINE_ACCESS {
                return Err(Error::Config(ConfigError::invalid(
                    "identity resource name",
                    "offline_access is reserved",
                )));
            }
            if snapshot.identity.contains_key(&resource.name) {
                return Err(duplicate("identity resource", &resource.name));
            }
            if resource.enabled {
                snapshot.identity.insert(resource.name.clone(), resource);
            }
        }

        for api in apis {
            if api.name.is_empty() {
                return Err(Error::Config(ConfigError::MissingRequired(
                    "api resource name".to_string(),
                )));
            }
            if snapshot.apis.contains_key(&api.name) {
                return Err(duplicate("api resource", &api.name));
            }
            if !api.enabled {
                continue;
            }
            for scope in &api.scopes {
                if scope == OFFLINE_ACCESS {
                    return Err(Error::Config(ConfigError::invalid(
                        "api scope",
                        "offline_access is reserved",
                    )));
                }
                if snapshot.identity.contains_key(scope) || snapshot.api_scopes.contains_key(scope)
                {
                    return Err(duplicate("scope", scope));
                }
                snapshot.api_scopes.insert(scope.clone(), api.name.clone());
            }
            snapshot.apis.insert(api.name.clone(), api);
        }

        Ok(snapshot)
    }

    /// 查找身份资源
    pub fn identity_resource(&self, name: &str) -> Option<&IdentityResource> {
        self.identity.get(name)
    }

    /// 查找 API 资源
    pub fn api_resource(&self, name: &str) -> Option<&ApiResource> {
        self.apis.get(name)
    }

    /// 暴露指定 scope 的 API 资源
    pub fn api_for_scope(&self, scope: &str) -> Option<&ApiResource> {
        self.api_scopes
            .get(scope)
            .and_then(|name| self.apis.get(name))
    }

    /// 是否为已知 scope（身份、API 或 `offline_access`）
    pub fn is_known_scope(&self, scope: &str) -> bool {
        scope == OFFLINE_ACCESS
            || self.identity.contains_key(scope)
            || self.api_scopes.contains_key(scope)
    }

    /// 是否为身份 scope
    pub fn is_identity_scope(&self, scope: &str) -> bool {
        self.identity.contains_key(scope)
    }

    /// 所有已知 scope，按名称排序
    pub fn scope_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .identity
            .keys()
            .chain(self.api_scopes.keys())
            .cloned()
            .collect();
        names.push(OFFLINE_ACCESS.to_string());
        names.sort();
        names
    }

    /// 身份资源数量
    pub fn identity_len(&self) -> usize {
        self.identity.len()
    }

    /// API 资源数量
    pub fn api_len(&self) -> usize {
        self.apis.len()
    }
}

fn duplicate(kind: &'static str, name: &str) -> Error {
    Error::Config(ConfigError::Duplicate {
        kind,
        name: name.to_string(),
    })
}

/// 资源注册表
#[derive(Debug)]
pub struct ResourceRegistry {
    snapshot: RwLock<Arc<ResourceSnapshot>>,
    policy: ScopePolicy,
}

impl ResourceRegistry {
    /// 创建注册表
    pub fn new(
        identity: Vec<IdentityResource>,
        apis: Vec<ApiResource>,
        policy: ScopePolicy,
    ) -> Result<Self> {
        Ok(Self {
            snapshot: RwLock::new(Arc::new(ResourceSnapshot::build(identity, apis)?)),
            policy,
        })
    }

    /// 当前 scope 策略
    pub fn policy(&self) -> ScopePolicy {
        self.policy
    }

    /// 获取当前快照
    pub fn snapshot(&self) -> Arc<ResourceSnapshot> {
        self.snapshot.read().clone()
    }

    /// 整体替换资源定义
    ///
    /// 校验失败时保留旧快照
    pub fn reload(&self, identity: Vec<IdentityResource>, apis: Vec<ApiResource>) -> Result<()> {
        let next = Arc::new(ResourceSnapshot::build(identity, apis)?);
        *self.snapshot.write() = next;
        Ok(())
    }

    /// 查找 API 资源（用于内省认证）
    pub fn find_api_resource(&self, name: &str) -> Option<ApiResource> {
        self.snapshot().api_resource(name).cloned()
    }

    /// 将请求的 scope 解析为资源
    ///
    /// 重复的 scope 只计一次。`Strict` 策略下任何未知 scope 都返回 `InvalidScope`。
    pub fn resolve_scopes(&self, requested: &[String]) -> Result<Resources> {
        let snapshot = self.snapshot();
        let mut resources = Resources::default();
        let mut seen = HashSet::new();

        for scope in requested {
            if !seen.insert(scope.as_str()) {
                continue;
            }

            if scope == OFFLINE_ACCESS {
                resources.offline_access = true;
            } else if let Some(identity) = snapshot.identity_resource(scope) {
                resources.identity_resources.push(identity.clone());
            } else if let Some(api) = snapshot.api_for_scope(scope) {
                if !resources.api_resources.iter().any(|r| r.name == api.name) {
                    resources.api_resources.push(api.clone());
                }
            } else {
                match self.policy {
                    ScopePolicy::Strict => {
                        return Err(Error::invalid_scope(format!("unknown scope '{}'", scope)));
                    }
                    ScopePolicy::Lenient => {
                        debug!(scope = %scope, "dropping unknown scope");
                        resources.unknown.push(scope.clone());
                        continue;
                    }
                }
            }

            resources.scopes.push(scope.clone());
        }

        Ok(resources)
    }
}
