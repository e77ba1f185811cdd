//! PKCE (Proof Key for Code Exchange) 实现
//!
//! 授权端点收到 `code_challenge` 后把它随授权码一起保存（[`PkceCodeChallenge`]），
//! token 端点兑换授权码时用客户端提交的 `code_verifier` 重新计算并比较。
//!
//! ## 示例
//!
//! ```rust
//! use oidcrs::oauth::pkce::{PkceChallenge, PkceCodeChallenge, PkceMethod};
//!
//! // 客户端：生成 verifier 与 challenge
//! let pkce = PkceChallenge::new(PkceMethod::S256).unwrap();
//!
//! // 服务端：授权时保存 challenge，兑换时验证 verifier
//! let stored = PkceCodeChallenge::new(pkce.challenge(), PkceMethod::S256).unwrap();
//! assert!(stored.verify(pkce.verifier()));
//! ```

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::random::{constant_time_compare_str, generate_random_bytes};

const MIN_LEN: usize = 43;
const MAX_LEN: usize = 128;

/// PKCE challenge 方法
///
/// RFC 7636 定义了两种方法：
/// - `Plain`: code_challenge = code_verifier（需要客户端显式允许）
/// - `S256`: code_challenge = BASE64URL(SHA256(code_verifier))
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PkceMethod {
    /// Plain 方法：challenge = verifier
    #[serde(rename = "plain")]
    Plain,

    /// S256 方法：challenge = BASE64URL(SHA256(verifier))
    #[default]
    S256,
}

impl PkceMethod {
    /// 转换为 OAuth 2.0 参数字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            PkceMethod::Plain => "plain",
            PkceMethod::S256 => "S256",
        }
    }

    /// 解析 `code_challenge_method`，缺省时按 RFC 7636 视为 `plain`
    pub fn parse_param(value: Option<&str>) -> Result<Self> {
        match value {
            None => Ok(PkceMethod::Plain),
            Some(s) => s.parse(),
        }
    }
}

impl std::str::FromStr for PkceMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plain" => Ok(PkceMethod::Plain),
            "S256" => Ok(PkceMethod::S256),
            _ => Err(Error::invalid_request(format!(
                "unsupported code_challenge_method: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for PkceMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 客户端侧的 PKCE 对（verifier + challenge）
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    verifier: String,
    challenge: String,
    method: PkceMethod,
}

impl PkceChallenge {
    /// 生成新的 verifier（32 字节随机数据，43 字符）并计算 challenge
    pub fn new(method: PkceMethod) -> Result<Self> {
        let verifier = URL_SAFE_NO_PAD.encode(generate_random_bytes(32)?);
        let challenge = compute_challenge(&verifier, method);
        Ok(Self {
            verifier,
            challenge,
            method,
        })
    }

    /// 从已有的 verifier 创建
    pub fn from_verifier(verifier: String, method: PkceMethod) -> Result<Self> {
        validate_format("code_verifier", &verifier)?;
        let challenge = compute_challenge(&verifier, method);
        Ok(Self {
            verifier,
            challenge,
            method,
        })
    }

    /// 获取 code_verifier
    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    /// 获取 code_challenge
    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    /// 获取 challenge 方法
    pub fn method(&self) -> PkceMethod {
        self.method
    }
}

/// 随授权码保存的 code challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceCodeChallenge {
    /// code_challenge 值
    pub challenge: String,

    /// challenge 方法
    pub method: PkceMethod,
}

impl PkceCodeChallenge {
    /// 校验格式后创建
    pub fn new(challenge: impl Into<String>, method: PkceMethod) -> Result<Self> {
        let challenge = challenge.into();
        validate_format("code_challenge", &challenge)?;
        Ok(Self { challenge, method })
    }

    /// 验证 verifier
    ///
    /// 格式不合法的 verifier 直接视为不匹配
    pub fn verify(&self, verifier: &str) -> bool {
        if validate_format("code_verifier", verifier).is_err() {
            return false;
        }
        let computed = compute_challenge(verifier, self.method);
        constant_time_compare_str(&computed, &self.challenge)
    }
}

fn compute_challenge(verifier: &str, method: PkceMethod) -> String {
    match method {
        PkceMethod::Plain => verifier.to_string(),
        PkceMethod::S256 => URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes())),
    }
}

/// 长度 43-128，字符集 [A-Z] / [a-z] / [0-9] / "-" / "." / "_" / "~"
fn validate_format(name: &str, value: &str) -> Result<()> {
    if value.len() < MIN_LEN || value.len() > MAX_LEN {
        return Err(Error::invalid_request(format!(
            "{} length must be {}-{} characters, got {}",
            name,
            MIN_LEN,
            MAX_LEN,
            value.len()
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
    {
        return Err(Error::invalid_request(format!(
            "{} contains invalid characters",
            name
        )));
    }
    Ok(())
}
