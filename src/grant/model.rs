//! 持久化 grant 模型

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Grant 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    /// 授权码，一次性
    AuthorizationCode,
    /// 刷新令牌
    RefreshToken,
    /// 引用访问令牌
    ReferenceToken,
    /// 用户授权同意记录
    UserConsent,
}

impl GrantKind {
    /// 名称
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantKind::AuthorizationCode => "authorization_code",
            GrantKind::RefreshToken => "refresh_token",
            GrantKind::ReferenceToken => "reference_token",
            GrantKind::UserConsent => "user_consent",
        }
    }
}

impl std::fmt::Display for GrantKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 已持久化的 grant
///
/// 存储只保存句柄的 SHA-256（`key`），句柄本身只出现在签发响应中。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedGrant {
    /// 句柄哈希
    pub key: String,

    /// 类型
    pub kind: GrantKind,

    /// 用户标识（客户端凭证签发的引用令牌没有用户）
    pub subject_id: Option<String>,

    /// 客户端 ID
    pub client_id: String,

    /// 授予的 scope
    pub scopes: Vec<String>,

    /// 创建时间
    pub created_at: DateTime<Utc>,

    /// 过期时间
    pub expires_at: DateTime<Utc>,

    /// 被兑换的时间（一次性 grant）
    pub consumed_at: Option<DateTime<Utc>>,

    /// 刷新令牌链标识，轮换出的刷新令牌沿用同一个值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,

    /// 类型相关的负载
    pub data: serde_json::Value,
}

impl PersistedGrant {
    /// 是否已过期
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// 是否已被兑换
    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    /// 解析负载
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            Error::internal(format!("corrupt {} payload: {}", self.kind, e))
        })
    }

    /// 剩余有效期（秒），不会为负
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> u64 {
        (self.expires_at - now).num_seconds().max(0) as u64
    }
}

/// 待创建的 grant
#[derive(Debug, Clone, PartialEq)]
pub struct NewGrant {
    /// 类型
    pub kind: GrantKind,
    /// 用户标识
    pub subject_id: Option<String>,
    /// 客户端 ID
    pub client_id: String,
    /// 授予的 scope
    pub scopes: Vec<String>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 过期时间
    pub expires_at: DateTime<Utc>,
    /// 刷新令牌链标识
    pub family_id: Option<String>,
    /// 负载
    pub data: serde_json::Value,
}

impl NewGrant {
    /// 从 `created_at` 开始计算有效期
    pub fn new(
        kind: GrantKind,
        client_id: impl Into<String>,
        created_at: DateTime<Utc>,
        lifetime: Duration,
    ) -> Self {
        Self {
            kind,
            subject_id: None,
            client_id: client_id.into(),
            scopes: Vec::new(),
            created_at,
            expires_at: expires_after(created_at, lifetime),
            family_id: None,
            data: serde_json::Value::Null,
        }
    }

    /// 设置用户
    pub fn with_subject(mut self, subject_id: Option<String>) -> Self {
        self.subject_id = subject_id;
        self
    }

    /// 设置 scope
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// 直接设置过期时间
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// 设置刷新令牌链
    pub fn with_family(mut self, family_id: impl Into<String>) -> Self {
        self.family_id = Some(family_id.into());
        self
    }

    /// 序列化负载
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.data = serde_json::to_value(payload)
            .map_err(|e| Error::internal(format!("cannot serialize {} payload: {}", self.kind, e)))?;
        Ok(self)
    }

    /// 转换为持久化记录
    pub fn into_persisted(self, key: String) -> PersistedGrant {
        PersistedGrant {
            key,
            kind: self.kind,
            subject_id: self.subject_id,
            client_id: self.client_id,
            scopes: self.scopes,
            created_at: self.created_at,
            expires_at: self.expires_at,
            consumed_at: None,
            family_id: self.family_id,
            data: self.data,
        }
    }
}

/// 兑换方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeemMode {
    /// 标记为已兑换，之后的兑换返回 `AlreadyConsumed`
    Consume,
    /// 保留句柄；设置了 `sliding` 时把过期时间顺延为
    /// `min(now + sliding, created_at + absolute)`
    Reuse {
        /// 滑动有效期
        sliding: Option<Duration>,
        /// 绝对有效期
        absolute: Duration,
    },
}

/// 原子兑换的前置条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeemCondition {
    /// 期望的类型
    pub kind: GrantKind,
    /// 期望的客户端
    pub client_id: String,
    /// 兑换方式
    pub mode: RedeemMode,
    /// 当前时间
    pub now: DateTime<Utc>,
}

impl RedeemCondition {
    /// 一次性兑换
    pub fn consume(kind: GrantKind, client_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            client_id: client_id.into(),
            mode: RedeemMode::Consume,
            now,
        }
    }

    /// 可重复兑换
    pub fn reuse(
        kind: GrantKind,
        client_id: impl Into<String>,
        sliding: Option<Duration>,
        absolute: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            client_id: client_id.into(),
            mode: RedeemMode::Reuse { sliding, absolute },
            now,
        }
    }
}

/// `start + lifetime`，溢出时取最大时间
pub fn expires_after(start: DateTime<Utc>, lifetime: Duration) -> DateTime<Utc> {
    start
        .checked_add_signed(lifetime)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_grant_expiry() {
        let now = Utc::now();
        let grant = NewGrant::new(GrantKind::AuthorizationCode, "c", now, Duration::seconds(300));
        assert_eq!(grant.expires_at, now + Duration::seconds(300));
        assert!(grant.subject_id.is_none());
    }

    #[test]
    fn test_expiry_saturates() {
        let now = Utc::now();
        assert_eq!(expires_after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_payload_roundtrip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Payload {
            nonce: String,
        }

        let now = Utc::now();
        let persisted = NewGrant::new(GrantKind::AuthorizationCode, "c", now, Duration::seconds(1))
            .with_payload(&Payload {
                nonce: "n-1".into(),
            })
            .unwrap()
            .into_persisted("key".into());

        let payload: Payload = persisted.payload().unwrap();
        assert_eq!(payload.nonce, "n-1");
        assert!(!persisted.is_consumed());
        assert!(persisted.is_expired(now + Duration::seconds(1)));
    }

    #[test]
    fn test_corrupt_payload() {
        let grant = NewGrant::new(GrantKind::RefreshToken, "c", Utc::now(), Duration::hours(1))
            .into_persisted("key".into());
        let result: Result<Vec<String>> = grant.payload();
        assert!(matches!(result, Err(Error::Internal(_))));
    }
}
