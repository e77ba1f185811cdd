//! JWT 编码与验证
//!
//! 所有 JWT 都使用 ES256 签名，header 中携带 `kid`。验证时按 `kid` 在
//! [`KeyRing`] 的受信任密钥中查找公钥，因此轮换后旧令牌在旧密钥被撤下之前
//! 仍然有效。
//!
//! ## 示例
//!
//! ```rust
//! use oidcrs::token::jwt::{JwtValidator, JwtValidatorConfig, sign};
//! use oidcrs::token::signing::{KeyRing, SigningKey};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Claims {
//!     sub: String,
//!     iss: String,
//!     exp: i64,
//! }
//!
//! let keys = Arc::new(KeyRing::new(SigningKey::generate("dev").unwrap()));
//! let claims = Claims {
//!     sub: "alice".into(),
//!     iss: "https://id.example.com".into(),
//!     exp: chrono::Utc::now().timestamp() + 60,
//! };
//! let token = sign(&keys.current().unwrap(), &claims).unwrap();
//!
//! let validator = JwtValidator::with_config(
//!     keys,
//!     JwtValidatorConfig::new().with_issuer("https://id.example.com"),
//! );
//! let decoded: Claims = validator.validate(&token).unwrap();
//! assert_eq!(decoded.sub, "alice");
//! ```

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, Header, TokenData, Validation, decode, decode_header, encode};
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::{Error, Result, TokenError};
use crate::token::signing::{KeyRing, SigningKey};

/// 唯一使用的签名算法
pub const SIGNING_ALGORITHM: Algorithm = Algorithm::ES256;

/// 使用签名密钥编码 JWT
pub fn sign<T: Serialize>(key: &SigningKey, claims: &T) -> Result<String> {
    let mut header = Header::new(SIGNING_ALGORITHM);
    header.kid = Some(key.kid().to_string());

    encode(&header, claims, key.encoding_key()).map_err(|e| {
        Error::Token(TokenError::EncodingFailed(format!(
            "failed to encode JWT: {}",
            e
        )))
    })
}

/// `at_hash` / `c_hash`：SHA-256 左半部分的 base64url 编码
pub fn left_half_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
}

/// JWT 验证器配置
#[derive(Debug, Clone)]
pub struct JwtValidatorConfig {
    /// 验证过期时间
    pub validate_exp: bool,
    /// 验证生效时间
    pub validate_nbf: bool,
    /// 期望的签发者
    pub issuer: Option<String>,
    /// 期望的接收者
    pub audience: Option<String>,
    /// 允许的时钟偏差（秒）
    pub leeway: u64,
}

impl Default for JwtValidatorConfig {
    fn default() -> Self {
        Self {
            validate_exp: true,
            validate_nbf: true,
            issuer: None,
            audience: None,
            leeway: 0,
        }
    }
}

impl JwtValidatorConfig {
    /// 创建新的验证器配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置期望的签发者
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// 设置期望的接收者
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// 设置时钟偏差容忍度
    pub fn with_leeway(mut self, leeway: u64) -> Self {
        self.leeway = leeway;
        self
    }

    /// 禁用过期时间验证
    pub fn without_exp_validation(mut self) -> Self {
        self.validate_exp = false;
        self
    }
}

/// JWT 验证器
#[derive(Debug, Clone)]
pub struct JwtValidator {
    keys: Arc<KeyRing>,
    config: JwtValidatorConfig,
}

impl JwtValidator {
    /// 使用默认配置创建验证器
    pub fn new(keys: Arc<KeyRing>) -> Self {
        Self::with_config(keys, JwtValidatorConfig::default())
    }

    /// 使用指定配置创建验证器
    pub fn with_config(keys: Arc<KeyRing>, config: JwtValidatorConfig) -> Self {
        Self { keys, config }
    }

    /// 当前配置
    pub fn config(&self) -> &JwtValidatorConfig {
        &self.config
    }

    /// 验证并解码 JWT
    pub fn validate<T: DeserializeOwned>(&self, token: &str) -> Result<T> {
        self.validate_with(token, &self.config)
    }

    /// 使用临时配置验证（例如身份令牌的 audience 是具体客户端）
    pub fn validate_with<T: DeserializeOwned>(
        &self,
        token: &str,
        config: &JwtValidatorConfig,
    ) -> Result<T> {
        let header = decode_header(token).map_err(|e| {
            Error::Token(TokenError::InvalidFormat(format!(
                "invalid token header: {}",
                e
            )))
        })?;
        let kid = header
            .kid
            .ok_or_else(|| Error::Token(TokenError::MissingClaim("kid".to_string())))?;
        let key = self
            .keys
            .verification_key(&kid)
            .ok_or(Error::Token(TokenError::UnknownKey(kid)))?;

        let validation = build_validation(config);
        let token_data: TokenData<T> =
            decode(token, key.decoding_key(), &validation).map_err(map_decode_error)?;

        Ok(token_data.claims)
    }
}

fn map_decode_error(e: jsonwebtoken::errors::Error) -> Error {
    let error = match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
        jsonwebtoken::errors::ErrorKind::InvalidSignature => TokenError::InvalidSignature,
        jsonwebtoken::errors::ErrorKind::InvalidToken => {
            TokenError::InvalidFormat("invalid token structure".to_string())
        }
        jsonwebtoken::errors::ErrorKind::InvalidIssuer => {
            TokenError::InvalidClaim("invalid issuer".to_string())
        }
        jsonwebtoken::errors::ErrorKind::InvalidAudience => {
            TokenError::InvalidClaim("invalid audience".to_string())
        }
        jsonwebtoken::errors::ErrorKind::ImmatureSignature => {
            TokenError::InvalidClaim("token not yet valid".to_string())
        }
        jsonwebtoken::errors::ErrorKind::MissingRequiredClaim(claim) => {
            TokenError::MissingClaim(claim.clone())
        }
        _ => TokenError::DecodingFailed(e.to_string()),
    };
    Error::Token(error)
}

fn build_validation(config: &JwtValidatorConfig) -> Validation {
    let mut validation = Validation::new(SIGNING_ALGORITHM);
    validation.validate_exp = config.validate_exp;
    validation.validate_nbf = config.validate_nbf;
    validation.leeway = config.leeway;

    if let Some(ref iss) = config.issuer {
        validation.set_issuer(&[iss]);
    }

    match config.audience {
        Some(ref aud) => validation.set_audience(&[aud]),
        None => validation.validate_aud = false,
    }

    validation
}

/// `aud` 既可以是单个字符串也可以是数组
pub(crate) mod one_or_many {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    pub fn serialize<S: Serializer>(values: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        match values {
            [single] => single.serialize(serializer),
            _ => values.serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        })
    }
}
