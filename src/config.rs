//! 服务配置模块
//!
//! `ServerOptions` 汇总了签发者标识、token 清理、存储超时和 scope 解析策略。
//! 配置可以通过代码构建、从 TOML 加载，并由环境变量覆盖。
//!
//! ```rust
//! use oidcrs::config::ServerOptions;
//! use std::time::Duration;
//!
//! let options = ServerOptions::new("https://id.example.com")
//!     .with_token_cleanup_interval(Duration::from_secs(30));
//! assert!(options.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ConfigError, Error, Result};
use crate::registry::resource::ScopePolicy;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "OIDCRS_";

/// 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// 签发者（`iss`），同时作为发现文档的基础 URL
    pub issuer: String,

    /// 是否启用后台过期 grant 清理
    pub enable_token_cleanup: bool,

    /// 清理间隔
    #[serde(with = "duration_secs")]
    pub token_cleanup_interval: Duration,

    /// 单次存储操作的超时时间
    #[serde(with = "duration_millis")]
    pub store_timeout: Duration,

    /// 未知 scope 的处理策略
    pub scope_policy: ScopePolicy,

    /// 开发签名密钥的 kid
    pub key_id: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:5000".to_string(),
            enable_token_cleanup: true,
            token_cleanup_interval: Duration::from_secs(10),
            store_timeout: Duration::from_secs(5),
            scope_policy: ScopePolicy::Strict,
            key_id: "dev".to_string(),
        }
    }
}

impl ServerOptions {
    /// 使用指定签发者创建配置
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            ..Self::default()
        }
    }

    /// 开发环境配置：短清理间隔，宽松 scope 策略
    pub fn development() -> Self {
        Self {
            token_cleanup_interval: Duration::from_secs(10),
            scope_policy: ScopePolicy::Lenient,
            ..Self::default()
        }
    }

    /// 设置签发者
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    /// 设置是否启用 token 清理
    pub fn with_token_cleanup(mut self, enabled: bool) -> Self {
        self.enable_token_cleanup = enabled;
        self
    }

    /// 设置清理间隔
    pub fn with_token_cleanup_interval(mut self, interval: Duration) -> Self {
        self.token_cleanup_interval = interval;
        self
    }

    /// 设置存储超时
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// 设置 scope 策略
    pub fn with_scope_policy(mut self, policy: ScopePolicy) -> Self {
        self.scope_policy = policy;
        self
    }

    /// 设置签名密钥 kid
    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = key_id.into();
        self
    }

    /// 从 TOML 文本加载，缺省字段使用默认值
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let options: Self = toml::from_str(input)
            .map_err(|e| Error::Config(ConfigError::invalid("toml", e.to_string())))?;
        options.validate()?;
        Ok(options)
    }

    /// 用 `OIDCRS_*` 环境变量覆盖当前配置
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    /// 用任意键值来源覆盖当前配置（键不含前缀）
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(issuer) = lookup("ISSUER") {
            self.issuer = issuer;
        }
        if let Some(value) = lookup("ENABLE_TOKEN_CLEANUP") {
            self.enable_token_cleanup = parse_value("ENABLE_TOKEN_CLEANUP", &value)?;
        }
        if let Some(value) = lookup("CLEANUP_INTERVAL_SECS") {
            self.token_cleanup_interval =
                Duration::from_secs(parse_value("CLEANUP_INTERVAL_SECS", &value)?);
        }
        if let Some(value) = lookup("STORE_TIMEOUT_MS") {
            self.store_timeout = Duration::from_millis(parse_value("STORE_TIMEOUT_MS", &value)?);
        }
        if let Some(value) = lookup("SCOPE_POLICY") {
            self.scope_policy = value.parse()?;
        }
        if let Some(key_id) = lookup("KEY_ID") {
            self.key_id = key_id;
        }
        self.validate()?;
        Ok(self)
    }

    /// 验证配置是否有效
    pub fn validate(&self) -> Result<()> {
        if self.issuer.trim().is_empty() {
            return Err(Error::Config(ConfigError::MissingRequired(
                "issuer".to_string(),
            )));
        }
        url::Url::parse(&self.issuer)
            .map_err(|e| Error::Config(ConfigError::invalid("issuer", e.to_string())))?;
        if self.issuer.ends_with('/') {
            return Err(Error::Config(ConfigError::invalid(
                "issuer",
                "must not end with '/'",
            )));
        }
        if self.enable_token_cleanup && self.token_cleanup_interval.is_zero() {
            return Err(Error::Config(ConfigError::invalid(
                "token_cleanup_interval",
                "must be greater than zero",
            )));
        }
        if self.store_timeout.is_zero() {
            return Err(Error::Config(ConfigError::invalid(
                "store_timeout",
                "must be greater than zero",
            )));
        }
        if self.key_id.is_empty() {
            return Err(Error::Config(ConfigError::MissingRequired(
                "key_id".to_string(),
            )));
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| {
        Error::Config(ConfigError::invalid(
            format!("{}{}", ENV_PREFIX, key),
            e.to_string(),
        ))
    })
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
