//! 配置持久化与幂等种子数据
//!
//! 种子逻辑分两步：[`plan_seed`] 是纯函数，根据期望状态和存储中各类记录是否为空
//! 计算出需要插入的内容；[`seed_if_empty`] 把这个差异应用到 [`ConfigurationStore`]。
//! 只有整类记录为空时才会插入，重复执行不会产生任何变化。

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use crate::error::Result;
use crate::oauth::client::{
    AccessTokenType, Client, ClientBuilder, GrantType, Secret, TokenUsage,
};
use crate::registry::resource::{ApiResource, IdentityResource};

/// 配置存储 trait
///
/// 客户端、身份资源、API 资源的持久化接口，具体存储技术由实现决定。
#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    /// 列出所有客户端
    async fn list_clients(&self) -> Result<Vec<Client>>;

    /// 列出所有身份资源
    async fn list_identity_resources(&self) -> Result<Vec<IdentityResource>>;

    /// 列出所有 API 资源
    async fn list_api_resources(&self) -> Result<Vec<ApiResource>>;

    /// 插入客户端
    async fn insert_clients(&self, clients: Vec<Client>) -> Result<()>;

    /// 插入身份资源
    async fn insert_identity_resources(&self, resources: Vec<IdentityResource>) -> Result<()>;

    /// 插入 API 资源
    async fn insert_api_resources(&self, resources: Vec<ApiResource>) -> Result<()>;

    /// 各类记录是否为空
    async fn emptiness(&self) -> Result<StoreEmptiness> {
        Ok(StoreEmptiness {
            clients: self.list_clients().await?.is_empty(),
            identity_resources: self.list_identity_resources().await?.is_empty(),
            api_resources: self.list_api_resources().await?.is_empty(),
        })
    }
}

/// 内存配置存储
#[derive(Debug, Default)]
pub struct InMemoryConfigurationStore {
    clients: RwLock<Vec<Client>>,
    identity_resources: RwLock<Vec<IdentityResource>>,
    api_resources: RwLock<Vec<ApiResource>>,
}

impl InMemoryConfigurationStore {
    /// 创建新的内存存储
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigurationStore for InMemoryConfigurationStore {
    async fn list_clients(&self) -> Result<Vec<Client>> {
        Ok(self.clients.read().clone())
    }

    async fn list_identity_resources(&self) -> Result<Vec<IdentityResource>> {
        Ok(self.identity_resources.read().clone())
    }

    async fn list_api_resources(&self) -> Result<Vec<ApiResource>> {
        Ok(self.api_resources.read().clone())
    }

    async fn insert_clients(&self, clients: Vec<Client>) -> Result<()> {
        self.clients.write().extend(clients);
        Ok(())
    }

    async fn insert_identity_resources(&self, resources: Vec<IdentityResource>) -> Result<()> {
        self.identity_resources.write().extend(resources);
        Ok(())
    }

    async fn insert_api_resources(&self, resources: Vec<ApiResource>) -> Result<()> {
        self.api_resources.write().extend(resources);
        Ok(())
    }
}

// ============================================================================
// 种子计划
// ============================================================================

/// 期望的配置状态
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedData {
    /// 客户端
    pub clients: Vec<Client>,
    /// 身份资源
    pub identity_resources: Vec<IdentityResource>,
    /// API 资源
    pub api_resources: Vec<ApiResource>,
}

/// 存储中各类记录是否为空
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreEmptiness {
    /// 客户端为空
    pub clients: bool,
    /// 身份资源为空
    pub identity_resources: bool,
    /// API 资源为空
    pub api_resources: bool,
}

/// 需要插入的记录
pub type SeedPlan = SeedData;

impl SeedData {
    /// 是否没有需要插入的内容
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
            && self.identity_resources.is_empty()
            && self.api_resources.is_empty()
    }
}

/// 计算种子差异：只为空的类别插入期望记录
pub fn plan_seed(desired: &SeedData, current: StoreEmptiness) -> SeedPlan {
    SeedPlan {
        clients: if current.clients {
            desired.clients.clone()
        } else {
            Vec::new()
        },
        identity_resources: if current.identity_resources {
            desired.identity_resources.clone()
        } else {
            Vec::new()
        },
        api_resources: if current.api_resources {
            desired.api_resources.clone()
        } else {
            Vec::new()
        },
    }
}

/// 把种子数据写入空的配置类别，返回实际插入的内容
pub async fn seed_if_empty(store: &dyn ConfigurationStore, desired: &SeedData) -> Result<SeedPlan> {
    let plan = plan_seed(desired, store.emptiness().await?);

    if !plan.clients.is_empty() {
        store.insert_clients(plan.clients.clone()).await?;
    }
    if !plan.identity_resources.is_empty() {
        store
            .insert_identity_resources(plan.identity_resources.clone())
            .await?;
    }
    if !plan.api_resources.is_empty() {
        store.insert_api_resources(plan.api_resources.clone()).await?;
    }

    info!(
        clients = plan.clients.len(),
        identity_resources = plan.identity_resources.len(),
        api_resources = plan.api_resources.len(),
        "configuration seed applied"
    );
    Ok(plan)
}

// ============================================================================
// 演示配置
// ============================================================================

const NOT_USED: &str = "https://notused";
const STANDARD_SCOPES: [&str; 4] = ["openid", "profile", "email", "api"];

/// 演示主机的完整种子数据
pub fn demo_seed_data() -> Result<SeedData> {
    Ok(SeedData {
        clients: demo_clients()?,
        identity_resources: demo_identity_resources(),
        api_resources: demo_api_resources(),
    })
}

/// 演示身份资源：openid、profile、email
pub fn demo_identity_resources() -> Vec<IdentityResource> {
    vec![
        IdentityResource::openid(),
        IdentityResource::profile(),
        IdentityResource::email(),
    ]
}

/// 演示 API 资源：`api`，密钥 "secret"
pub fn demo_api_resources() -> Vec<ApiResource> {
    vec![ApiResource::new("api", "Demo API").with_secret(Secret::sha256("secret"))]
}

/// 演示客户端
pub fn demo_clients() -> Result<Vec<Client>> {
    let interactive = |id: &str, name: &str, grant: GrantType| {
        Client::builder(id)
            .client_name(name)
            .redirect_uri(NOT_USED)
            .post_logout_redirect_uri(NOT_USED)
            .grant_type(grant)
            .scopes(STANDARD_SCOPES)
    };
    let refreshable = |builder: ClientBuilder| {
        builder
            .allow_offline_access(true)
            .refresh_token_usage(TokenUsage::ReUse)
    };

    Ok(vec![
        // native clients
        refreshable(
            interactive(
                "native.hybrid",
                "Native Client (Hybrid with PKCE)",
                GrantType::Hybrid,
            )
            .require_client_secret(false)
            .require_pkce(true),
        )
        .build()?,
        refreshable(
            interactive(
                "server.hybrid",
                "Server-based Client (Hybrid)",
                GrantType::Hybrid,
            )
            .secret(Secret::sha256("secret")),
        )
        .build()?,
        refreshable(
            interactive(
                "native.code",
                "Native Client (Code with PKCE)",
                GrantType::AuthorizationCode,
            )
            .require_client_secret(false)
            .require_pkce(true),
        )
        .build()?,
        refreshable(
            interactive(
                "server.code",
                "Service Client (Code)",
                GrantType::AuthorizationCode,
            )
            .secret(Secret::sha256("secret")),
        )
        .build()?,
        // server to server
        Client::builder("client")
            .secret(Secret::sha256("secret"))
            .grant_type(GrantType::ClientCredentials)
            .scope("api")
            .build()?,
        // implicit
        interactive("implicit", "Implicit Client", GrantType::Implicit)
            .allow_access_tokens_via_browser(true)
            .front_channel_logout_uri("http://localhost:5000/signout-idsrv")
            .build()?,
        interactive(
            "implicit.reference",
            "Implicit Client using reference tokens",
            GrantType::Implicit,
        )
        .allow_access_tokens_via_browser(true)
        .access_token_type(AccessTokenType::Reference)
        .build()?,
        interactive(
            "implicit.shortlived",
            "Implicit Client using short-lived tokens",
            GrantType::Implicit,
        )
        .allow_access_tokens_via_browser(true)
        .access_token_lifetime(70)
        .build()?,
    ])
}
