//! 客户端注册表
//!
//! 请求处理期间只读。读取方克隆当前快照的 `Arc`，`reload` 一次性替换整个快照，
//! 所以任何读取方都不会看到新旧客户端混合的状态。

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ConfigError, Error, Result};
use crate::oauth::client::Client;
use crate::registry::seed::ConfigurationStore;

/// 客户端快照
#[derive(Debug, Default)]
pub struct ClientSnapshot {
    clients: HashMap<String, Arc<Client>>,
}

impl ClientSnapshot {
    /// 校验 `client_id` 唯一后构建快照
    pub fn build(clients: Vec<Client>) -> Result<Self> {
        let mut map = HashMap::with_capacity(clients.len());
        for client in clients {
            if map.contains_key(&client.client_id) {
                return Err(Error::Config(ConfigError::Duplicate {
                    kind: "client",
                    name: client.client_id,
                }));
            }
            map.insert(client.client_id.clone(), Arc::new(client));
        }
        Ok(Self { clients: map })
    }

    /// 查找客户端（包括已禁用的）
    pub fn get(&self, client_id: &str) -> Option<&Arc<Client>> {
        self.clients.get(client_id)
    }

    /// 客户端数量
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// 所有客户端 ID
    pub fn client_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.clients.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// 客户端注册表
#[derive(Debug, Default)]
pub struct ClientRegistry {
    snapshot: RwLock<Arc<ClientSnapshot>>,
}

impl ClientRegistry {
    /// 用一组客户端创建注册表
    pub fn new(clients: Vec<Client>) -> Result<Self> {
        Ok(Self {
            snapshot: RwLock::new(Arc::new(ClientSnapshot::build(clients)?)),
        })
    }

    /// 从持久化配置加载
    pub async fn from_store(store: &dyn ConfigurationStore) -> Result<Self> {
        let clients = store.list_clients().await?;
        info!(count = clients.len(), "loaded clients from configuration store");
        Self::new(clients)
    }

    /// 查找客户端
    ///
    /// 不存在或已禁用时返回 `UnknownClient`
    pub fn lookup(&self, client_id: &str) -> Result<Arc<Client>> {
        let snapshot = self.snapshot();
        match snapshot.get(client_id) {
            Some(client) if client.enabled => Ok(client.clone()),
            Some(_) => {
                debug!(client_id = %client_id, "client is disabled");
                Err(Error::UnknownClient(client_id.to_string()))
            }
            None => Err(Error::UnknownClient(client_id.to_string())),
        }
    }

    /// 获取当前快照
    pub fn snapshot(&self) -> Arc<ClientSnapshot> {
        self.snapshot.read().clone()
    }

    /// 整体替换客户端集合
    ///
    /// 校验失败时保留旧快照
    pub fn reload(&self, clients: Vec<Client>) -> Result<()> {
        let next = Arc::new(ClientSnapshot::build(clients)?);
        let count = next.len();
        *self.snapshot.write() = next;
        info!(count, "client registry reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::client::{GrantType, Secret};

    fn client(id: &str) -> Client {
        Client::builder(id)
            .grant_type(GrantType::ClientCredentials)
            .secret(Secret::sha256("secret"))
            .scope("api")
            .build()
            .unwrap()
    }

    #[test]
    fn test_lookup() {
        let registry = ClientRegistry::new(vec![client("a"), client("b")]).unwrap();

        assert_eq!(registry.lookup("a").unwrap().client_id, "a");
        assert_eq!(registry.lookup("b").unwrap().client_id, "b");
        assert!(matches!(
            registry.lookup("c"),
            Err(Error::UnknownClient(id)) if id == "c"
        ));
    }

    #[test]
    fn test_disabled_client_is_unknown() {
        let disabled = Client::builder("off")
            .grant_type(GrantType::ClientCredentials)
            .secret(Secret::sha256("secret"))
            .enabled(false)
            .build()
            .unwrap();
        let registry = ClientRegistry::new(vec![disabled]).unwrap();
        assert!(matches!(
            registry.lookup("off"),
            Err(Error::UnknownClient(_))
        ));
    }

    #[test]
    fn test_duplicate_client_id() {
        let result = ClientRegistry::new(vec![client("a"), client("a")]);
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::Duplicate { kind: "client", .. }))
        ));
    }

    #[test]
    fn test_reload_is_full_swap() {
        let registry = ClientRegistry::new(vec![client("a")]).unwrap();
        let old = registry.snapshot();

        registry.reload(vec![client("b")]).unwrap();

        // 旧快照保持不变
        assert!(old.get("a").is_some());
        assert!(registry.lookup("a").is_err());
        assert!(registry.lookup("b").is_ok());
        assert_eq!(registry.snapshot().client_ids(), vec!["b"]);
    }
}
