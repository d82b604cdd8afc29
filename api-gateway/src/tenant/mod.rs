/**
 * 租户与客户端平台解析
 *
 * 租户按 X-Tenant-ID 请求头 -> 子域名 -> 查询参数 的顺序解析，命中即停止；
 * 平台按 X-App-Platform 请求头 -> User-Agent 推断。
 * 解析结果写入请求上下文，并以请求头的形式转发给后端。
 */
mod lookup;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Request, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use common::configs::TenantConfig;
use common::error::Error;

use crate::context::{
    client_ip, RequestContext, HEADER_PLATFORM, HEADER_REQUEST_ID, HEADER_TENANT_ID,
};
use crate::gateway::GatewayState;

pub use lookup::{InMemoryTenantLookup, TenantLookup};

/// 客户端平台
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Web,
    Mobile,
    UniApp,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Web => "web",
            Platform::Mobile => "mobile",
            Platform::UniApp => "uniapp",
        }
    }

    /// 根据User-Agent推断平台
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        if ua.contains("uni-app") || ua.contains("uniapp") {
            Platform::UniApp
        } else if ["android", "iphone", "ipad", "mobile"]
            .iter()
            .any(|keyword| ua.contains(keyword))
        {
            Platform::Mobile
        } else {
            Platform::Web
        }
    }

    /// 请求头优先，其次User-Agent
    pub fn detect(headers: &HeaderMap) -> Self {
        if let Some(platform) = headers
            .get(HEADER_PLATFORM)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
        {
            return platform;
        }
        headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(Platform::from_user_agent)
            .unwrap_or_default()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "web" => Ok(Platform::Web),
            "mobile" | "app" => Ok(Platform::Mobile),
            "uniapp" | "uni-app" => Ok(Platform::UniApp),
            other => Err(other.to_string()),
        }
    }
}

/// 租户的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantSource {
    Header,
    Subdomain,
    Query,
}

/// 租户解析器
pub struct TenantResolver {
    config: TenantConfig,
    lookup: Option<Arc<dyn TenantLookup>>,
}

impl TenantResolver {
    pub fn new(config: TenantConfig, lookup: Option<Arc<dyn TenantLookup>>) -> Self {
        Self { config, lookup }
    }

    /// 根据配置创建，开启校验时使用配置中的租户目录
    pub fn from_config(config: &TenantConfig) -> Self {
        let lookup: Option<Arc<dyn TenantLookup>> = config
            .validate
            .then(|| Arc::new(InMemoryTenantLookup::from_entries(&config.tenants)) as Arc<dyn TenantLookup>);
        Self::new(config.clone(), lookup)
    }

    /// 按优先级提取原始的租户标识，不做校验
    pub fn extract(&self, headers: &HeaderMap, uri: &Uri) -> Option<(String, TenantSource)> {
        if let Some(tenant) = headers
            .get(HEADER_TENANT_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return Some((tenant.to_string(), TenantSource::Header));
        }

        if let Some(subdomain) = self.subdomain(headers) {
            return Some((subdomain, TenantSource::Subdomain));
        }

        uri.query().and_then(|query| {
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == self.config.query_param)
                .map(|(_, value)| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(|value| (value, TenantSource::Query))
        })
    }

    /// Host不是主域名且至少三段时，第一段作为子域名
    fn subdomain(&self, headers: &HeaderMap) -> Option<String> {
        let host = headers
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok())?;
        // 去掉端口
        let host = host.rsplit_once(':').map_or(host, |(h, port)| {
            if port.chars().all(|c| c.is_ascii_digit()) {
                h
            } else {
                host
            }
        });
        let host = host.to_ascii_lowercase();

        if host == self.config.main_domain.to_ascii_lowercase() {
            return None;
        }
        if host.parse::<std::net::IpAddr>().is_ok() {
            return None;
        }
        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() < 3 || labels[0].is_empty() || labels[0] == "www" {
            return None;
        }
        Some(labels[0].to_string())
    }

    /// 解析租户ID
    ///
    /// 配置了租户目录时，子域名映射为租户ID，其它来源校验租户是否存在
    pub async fn resolve(&self, headers: &HeaderMap, uri: &Uri) -> Result<Option<String>, Error> {
        let Some((raw, source)) = self.extract(headers, uri) else {
            return Ok(None);
        };

        let Some(lookup) = &self.lookup else {
            return Ok(Some(raw));
        };

        let tenant = match source {
            TenantSource::Subdomain => lookup.get_tenant_by_subdomain(&raw).await?,
            TenantSource::Header | TenantSource::Query => lookup.get_tenant_by_id(&raw).await?,
        };
        match tenant {
            Some(entry) => Ok(Some(entry.id)),
            None => Err(Error::TenantNotFound(raw)),
        }
    }
}

/// 租户与平台解析中间件
///
/// 生成请求上下文，补全请求ID，并把租户、平台写入转发给后端的请求头
pub async fn resolve_context(
    State(state): State<GatewayState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get(HEADER_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut context = RequestContext::new(
        request_id.clone(),
        client_ip(&request, &state.config.gateway.trusted_proxies),
    );
    context.platform = Platform::detect(request.headers());

    match state
        .tenants
        .resolve(request.headers(), request.uri())
        .await
    {
        Ok(tenant) => context.tenant_id = tenant,
        Err(e) => {
            info!(request_id = %request_id, "租户解析失败: {}", e);
            let mut response = e.into_response();
            set_request_id(response.headers_mut(), &request_id);
            return response;
        }
    }

    debug!(
        request_id = %context.request_id,
        tenant = ?context.tenant_id,
        platform = %context.platform,
        "请求上下文已解析"
    );

    let headers = request.headers_mut();
    set_request_id(headers, &request_id);
    headers.insert(HEADER_PLATFORM, HeaderValue::from_static(context.platform.as_str()));
    match context
        .tenant_id
        .as_deref()
        .and_then(|t| HeaderValue::from_str(t).ok())
    {
        Some(value) => {
            headers.insert(HEADER_TENANT_ID, value);
        }
        None => {
            headers.remove(HEADER_TENANT_ID);
        }
    }
    request.extensions_mut().insert(context);

    let mut response = next.run(request).await;
    set_request_id(response.headers_mut(), &request_id);
    response
}

fn set_request_id(headers: &mut HeaderMap, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HEADER_REQUEST_ID, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::configs::TenantEntry;

    fn config() -> TenantConfig {
        TenantConfig {
            main_domain: "example.com".to_string(),
            ..Default::default()
        }
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(*k, HeaderValue::from_static(v));
        }
        headers
    }

    #[test]
    fn test_header_wins_over_subdomain() {
        let resolver = TenantResolver::new(config(), None);
        let h = headers(&[("x-tenant-id", "t-header"), ("host", "acme.example.com")]);
        let uri: Uri = "/api/x?tenant_id=t-query".parse().unwrap();
        assert_eq!(
            resolver.extract(&h, &uri),
            Some(("t-header".to_string(), TenantSource::Header))
        );
    }

    #[test]
    fn test_subdomain_then_query() {
        let resolver = TenantResolver::new(config(), None);
        let uri: Uri = "/api/x?tenant_id=t-query".parse().unwrap();

        let h = headers(&[("host", "acme.example.com:8443")]);
        assert_eq!(
            resolver.extract(&h, &uri),
            Some(("acme".to_string(), TenantSource::Subdomain))
        );

        // 主域名和两段域名都不解析子域名
        let h = headers(&[("host", "example.com")]);
        assert_eq!(
            resolver.extract(&h, &uri),
            Some(("t-query".to_string(), TenantSource::Query))
        );
        let h = headers(&[("host", "127.0.0.1:8080")]);
        assert_eq!(resolver.extract(&h, &uri).unwrap().1, TenantSource::Query);

        let no_query: Uri = "/api/x".parse().unwrap();
        assert_eq!(resolver.extract(&h, &no_query), None);
    }

    #[test]
    fn test_main_domain_with_three_labels() {
        let resolver = TenantResolver::new(
            TenantConfig {
                main_domain: "api.example.com".to_string(),
                ..Default::default()
            },
            None,
        );
        let h = headers(&[("host", "api.example.com")]);
        assert_eq!(resolver.extract(&h, &"/".parse().unwrap()), None);
    }

    #[tokio::test]
    async fn test_resolve_with_lookup() {
        let mut config = config();
        config.validate = true;
        config.tenants = vec![TenantEntry {
            id: "t-1001".to_string(),
            subdomain: "acme".to_string(),
            name: "Acme".to_string(),
        }];
        let resolver = TenantResolver::from_config(&config);
        let uri: Uri = "/".parse().unwrap();

        let h = headers(&[("host", "acme.example.com")]);
        assert_eq!(
            resolver.resolve(&h, &uri).await.unwrap(),
            Some("t-1001".to_string())
        );

        let h = headers(&[("x-tenant-id", "t-404")]);
        assert!(matches!(
            resolver.resolve(&h, &uri).await,
            Err(Error::TenantNotFound(_))
        ));

        assert_eq!(resolver.resolve(&HeaderMap::new(), &uri).await.unwrap(), None);
    }

    #[test]
    fn test_platform_detection() {
        assert_eq!(
            Platform::detect(&headers(&[("x-app-platform", "uniapp"), ("user-agent", "Android")])),
            Platform::UniApp
        );
        assert_eq!(
            Platform::detect(&headers(&[("user-agent", "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)")])),
            Platform::Mobile
        );
        assert_eq!(
            Platform::detect(&headers(&[("user-agent", "Mozilla/5.0 uni-app Android")])),
            Platform::UniApp
        );
        assert_eq!(
            Platform::detect(&headers(&[("user-agent", "Mozilla/5.0 (Windows NT 10.0)")])),
            Platform::Web
        );
        // 无法识别的请求头回退到User-Agent
        assert_eq!(
            Platform::detect(&headers(&[("x-app-platform", "tv"), ("user-agent", "Android")])),
            Platform::Mobile
        );
        assert_eq!(Platform::detect(&HeaderMap::new()), Platform::Web);
    }
}
