//! 签名密钥与密钥环
//!
//! 令牌使用 ES256 (ECDSA P-256 + SHA-256) 签名。[`KeyRing`] 对外只暴露两件事：
//! “当前签名密钥”和“受信任的验证密钥集合”。轮换是在单个写锁下替换整个快照，
//! 旧密钥在 [`KeyRing::retire`] 之前仍然可以验证已签发的令牌。
//!
//! ```rust
//! use oidcrs::token::signing::{KeyRing, SigningKey};
//!
//! let ring = KeyRing::new(SigningKey::generate("k1").unwrap());
//! ring.rotate(SigningKey::generate("k2").unwrap());
//!
//! assert_eq!(ring.current().unwrap().kid(), "k2");
//! assert!(ring.verification_key("k1").is_some());
//! assert_eq!(ring.jwks().keys.len(), 2);
//! ```

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{DecodingKey, EncodingKey};
use parking_lot::RwLock;
use ring::rand::SystemRandom;
use ring::signature::{ECDSA_P256_SHA256_FIXED_SIGNING, EcdsaKeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::{CryptoError, Error, Result};

/// 未压缩 P-256 公钥长度：0x04 || x(32) || y(32)
const UNCOMPRESSED_POINT_LEN: usize = 65;
const COORDINATE_LEN: usize = 32;

// ============================================================================
// 密钥
// ============================================================================

/// 验证密钥（公钥）
#[derive(Clone)]
pub struct VerificationKey {
    kid: String,
    x: String,
    y: String,
    decoding: DecodingKey,
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

impl VerificationKey {
    /// 由 JWK 坐标创建
    pub fn from_components(kid: impl Into<String>, x: &str, y: &str) -> Result<Self> {
        let decoding = DecodingKey::from_ec_components(x, y)
            .map_err(|e| Error::Crypto(CryptoError::InvalidKey(e.to_string())))?;
        Ok(Self {
            kid: kid.into(),
            x: x.to_string(),
            y: y.to_string(),
            decoding,
        })
    }

    /// 由未压缩的公钥点创建
    fn from_public_point(kid: &str, point: &[u8]) -> Result<Self> {
        if point.len() != UNCOMPRESSED_POINT_LEN || point[0] != 0x04 {
            return Err(Error::Crypto(CryptoError::InvalidKey(
                "expected an uncompressed P-256 public key".to_string(),
            )));
        }
        let x = URL_SAFE_NO_PAD.encode(&point[1..1 + COORDINATE_LEN]);
        let y = URL_SAFE_NO_PAD.encode(&point[1 + COORDINATE_LEN..]);
        Self::from_components(kid, &x, &y)
    }

    /// 密钥 ID
    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }

    /// 导出为 JWK
    pub fn to_jwk(&self) -> Jwk {
        Jwk {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            alg: "ES256".to_string(),
            key_use: "sig".to_string(),
            kid: self.kid.clone(),
            x: self.x.clone(),
            y: self.y.clone(),
        }
    }
}

/// 签名密钥（私钥）
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    encoding: EncodingKey,
    verification: VerificationKey,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// 生成新的开发用密钥
    pub fn generate(kid: impl Into<String>) -> Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|_| Error::Crypto(CryptoError::RngFailed("key generation failed".into())))?;
        Self::from_pkcs8(kid, pkcs8.as_ref())
    }

    /// 从 PKCS#8 DER 加载
    pub fn from_pkcs8(kid: impl Into<String>, der: &[u8]) -> Result<Self> {
        let kid = kid.into();
        let rng = SystemRandom::new();
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, der, &rng)
            .map_err(|e| Error::Crypto(CryptoError::InvalidKey(e.to_string())))?;
        let verification = VerificationKey::from_public_point(&kid, key_pair.public_key().as_ref())?;

        Ok(Self {
            kid,
            encoding: EncodingKey::from_ec_der(der),
            verification,
        })
    }

    /// 密钥 ID
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// 对应的验证密钥
    pub fn verification_key(&self) -> &VerificationKey {
        &self.verification
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }
}

// ============================================================================
// JWKS
// ============================================================================

/// JSON Web Key (RFC 7517)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// 密钥类型
    pub kty: String,
    /// 曲线
    pub crv: String,
    /// 算法
    pub alg: String,
    /// 用途
    #[serde(rename = "use")]
    pub key_use: String,
    /// 密钥 ID
    pub kid: String,
    /// x 坐标
    pub x: String,
    /// y 坐标
    pub y: String,
}

/// JWK 集合
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    /// 密钥
    pub keys: Vec<Jwk>,
}

// ============================================================================
// 密钥环
// ============================================================================

#[derive(Debug, Default)]
struct KeySnapshot {
    current: Option<Arc<SigningKey>>,
    trusted: Vec<Arc<VerificationKey>>,
}

/// 密钥环
#[derive(Debug, Default)]
pub struct KeyRing {
    snapshot: RwLock<Arc<KeySnapshot>>,
}

impl KeyRing {
    /// 以一个签名密钥创建
    pub fn new(current: SigningKey) -> Self {
        let ring = Self::empty();
        ring.rotate(current);
        ring
    }

    /// 创建没有任何密钥的密钥环（签发会返回 `SigningKeyUnavailable`）
    pub fn empty() -> Self {
        Self::default()
    }

    /// 当前签名密钥
    pub fn current(&self) -> Result<Arc<SigningKey>> {
        self.snapshot
            .read()
            .current
            .clone()
            .ok_or(Error::SigningKeyUnavailable)
    }

    /// 根据 kid 查找受信任的验证密钥
    pub fn verification_key(&self, kid: &str) -> Option<Arc<VerificationKey>> {
        self.snapshot
            .read()
            .trusted
            .iter()
            .find(|k| k.kid() == kid)
            .cloned()
    }

    /// 轮换：新密钥成为当前签名密钥，旧密钥保留为验证密钥
    pub fn rotate(&self, next: SigningKey) {
        let mut guard = self.snapshot.write();
        let mut trusted: Vec<Arc<VerificationKey>> = guard
            .trusted
            .iter()
            .filter(|k| k.kid() != next.kid())
            .cloned()
            .collect();
        trusted.push(Arc::new(next.verification_key().clone()));

        info!(kid = %next.kid(), "signing key activated");
        *guard = Arc::new(KeySnapshot {
            current: Some(Arc::new(next)),
            trusted,
        });
    }

    /// 添加额外的受信任验证密钥
    pub fn trust(&self, key: VerificationKey) {
        let mut guard = self.snapshot.write();
        let mut trusted: Vec<Arc<VerificationKey>> = guard
            .trusted
            .iter()
            .filter(|k| k.kid() != key.kid())
            .cloned()
            .collect();
        trusted.push(Arc::new(key));
        *guard = Arc::new(KeySnapshot {
            current: guard.current.clone(),
            trusted,
        });
    }

    /// 撤下一个密钥；如果它是当前签名密钥，签发将不可用直到下一次轮换
    pub fn retire(&self, kid: &str) -> bool {
        let mut guard = self.snapshot.write();
        let before = guard.trusted.len();
        let trusted: Vec<Arc<VerificationKey>> = guard
            .trusted
            .iter()
            .filter(|k| k.kid() != kid)
            .cloned()
            .collect();
        let removed = trusted.len() != before;
        let current = guard.current.clone().filter(|k| k.kid() != kid);
        *guard = Arc::new(KeySnapshot { current, trusted });
        if removed {
            info!(kid = %kid, "signing key retired");
        }
        removed
    }

    /// 公开的验证密钥
    pub fn jwks(&self) -> Jwks {
        Jwks {
            keys: self
                .snapshot
                .read()
                .trusted
                .iter()
                .map(|k| k.to_jwk())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_key() {
        let key = SigningKey::generate("dev").unwrap();
        assert_eq!(key.kid(), "dev");

        let jwk = key.verification_key().to_jwk();
        assert_eq!(jwk.kty, "EC");
        assert_eq!(jwk.crv, "P-256");
        assert_eq!(URL_SAFE_NO_PAD.decode(&jwk.x).unwrap().len(), 32);
        assert_eq!(URL_SAFE_NO_PAD.decode(&jwk.y).unwrap().len(), 32);
    }

    #[test]
    fn test_invalid_pkcs8() {
        assert!(matches!(
            SigningKey::from_pkcs8("bad", b"not a key"),
            Err(Error::Crypto(CryptoError::InvalidKey(_)))
        ));
    }

    #[test]
    fn test_empty_ring() {
        let ring = KeyRing::empty();
        assert!(matches!(ring.current(), Err(Error::SigningKeyUnavailable)));
        assert!(ring.jwks().keys.is_empty());
    }

    #[test]
    fn test_rotate_and_retire() {
        let ring = KeyRing::new(SigningKey::generate("k1").unwrap());
        ring.rotate(SigningKey::generate("k2").unwrap());

        assert_eq!(ring.current().unwrap().kid(), "k2");
        assert!(ring.verification_key("k1").is_some());

        assert!(ring.retire("k1"));
        assert!(ring.verification_key("k1").is_none());
        assert!(!ring.retire("k1"));

        assert!(ring.retire("k2"));
        assert!(matches!(ring.current(), Err(Error::SigningKeyUnavailable)));
    }

    #[test]
    fn test_jwk_serialization() {
        let ring = KeyRing::new(SigningKey::generate("dev").unwrap());
        let json = serde_json::to_value(ring.jwks()).unwrap();
        assert_eq!(json["keys"][0]["use"], "sig");
        assert_eq!(json["keys"][0]["alg"], "ES256");
        assert_eq!(json["keys"][0]["kid"], "dev");
    }
}
