use std::collections::HashMap;

use async_trait::async_trait;

use common::configs::TenantEntry;
use common::error::Error;

/// 租户目录
///
/// 只用于校验和解析租户标识，租户数据本身由外部服务维护
#[async_trait]
pub trait TenantLookup: Send + Sync {
    async fn get_tenant_by_subdomain(&self, subdomain: &str) -> Result<Option<TenantEntry>, Error>;

    async fn get_tenant_by_id(&self, id: &str) -> Result<Option<TenantEntry>, Error>;
}

/// 基于配置的静态租户目录
#[derive(Debug, Default)]
pub struct InMemoryTenantLookup {
    by_id: HashMap<String, TenantEntry>,
    /// 子域名 -> 租户ID
    by_subdomain: HashMap<String, String>,
}

impl InMemoryTenantLookup {
    pub fn from_entries(entries: &[TenantEntry]) -> Self {
        let mut lookup = Self::default();
        for entry in entries {
            lookup
                .by_subdomain
                .insert(entry.subdomain.to_ascii_lowercase(), entry.id.clone());
            lookup.by_id.insert(entry.id.clone(), entry.clone());
        }
        lookup
    }
}

#[async_trait]
impl TenantLookup for InMemoryTenantLookup {
    async fn get_tenant_by_subdomain(&self, subdomain: &str) -> Result<Option<TenantEntry>, Error> {
        Ok(self
            .by_subdomain
            .get(&subdomain.to_ascii_lowercase())
            .and_then(|id| self.by_id.get(id))
            .cloned())
    }

    async fn get_tenant_by_id(&self, id: &str) -> Result<Option<TenantEntry>, Error> {
        Ok(self.by_id.get(id).cloned())
    }
}
