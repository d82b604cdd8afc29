/**
 * 动态路由表
 *
 * 每个服务挂载在自己的前缀下，服务的全部路由作为一个整体注册、替换和删除。
 * 写操作持有同一把写锁完成，并发请求只会看到替换前或替换后的完整路由集合；
 * 被删除的路由直接从表中移除，请求在分发时才查表，因此不会命中旧的绑定。
 */
mod matcher;

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::Response;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::info;

use common::configs::{RouteConfig, ServiceConfig, ServiceType};
use common::error::Error;

pub use matcher::{MatchScore, PathPattern};

/// 路由处理函数，由注册时传入的绑定函数生成
pub type RouteHandler =
    Arc<dyn Fn(Request<Body>) -> BoxFuture<'static, Result<Response, Error>> + Send + Sync>;

/// 路径参数，分发前放入请求扩展
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteParams(pub Vec<(String, String)>);

impl RouteParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// 一次路由解析的结果
#[derive(Clone)]
pub struct ResolvedRoute {
    pub service: Arc<ServiceConfig>,
    pub route: Arc<RouteConfig>,
    pub params: RouteParams,
    pub handler: RouteHandler,
}

struct RouteBinding {
    pattern: PathPattern,
    method: String,
    route: Arc<RouteConfig>,
    handler: RouteHandler,
}

struct MountedService {
    config: Arc<ServiceConfig>,
    prefix: String,
    bindings: Vec<RouteBinding>,
}

#[derive(Default)]
struct TableInner {
    services: HashMap<String, Arc<MountedService>>,
    /// 前缀 -> 服务名
    prefixes: HashMap<String, String>,
}

/// 路由表
#[derive(Default)]
pub struct RouteTable {
    inner: RwLock<TableInner>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册服务，替换同名服务的全部路由
    ///
    /// `bind` 为每条路由生成处理函数，在加锁前调用
    pub fn register_service<F>(
        &self,
        config: ServiceConfig,
        bind: F,
    ) -> Result<Option<Arc<ServiceConfig>>, Error>
    where
        F: Fn(&Arc<ServiceConfig>, &Arc<RouteConfig>) -> RouteHandler,
    {
        config.validate()?;
        let config = Arc::new(config);
        let prefix = config.normalized_prefix();

        let mut routes = config.effective_routes();
        // 未声明路由的HTTP服务代理整个前缀
        if routes.is_empty() && config.service_type == ServiceType::Http {
            routes.push(RouteConfig::new("/{*path}", "*"));
        }

        let mut bindings = Vec::with_capacity(routes.len());
        for route in routes {
            let pattern = PathPattern::parse(&route.path)?;
            let route = Arc::new(route);
            bindings.push(RouteBinding {
                pattern,
                method: route.normalized_method(),
                handler: bind(&config, &route),
                route,
            });
        }

        let mounted = Arc::new(MountedService {
            config: config.clone(),
            prefix: prefix.clone(),
            bindings,
        });

        let mut inner = self.inner.write();
        if let Some(owner) = inner.prefixes.get(&prefix) {
            if owner != &config.name {
                return Err(Error::InvalidConfig(format!(
                    "前缀 {} 已被服务 {} 占用",
                    prefix, owner
                )));
            }
        }

        let previous = inner.services.remove(&config.name);
        if let Some(old) = &previous {
            inner.prefixes.remove(&old.prefix);
        }
        inner.prefixes.insert(prefix.clone(), config.name.clone());
        inner.services.insert(config.name.clone(), mounted);
        drop(inner);

        info!(
            service = %config.name,
            prefix = %prefix,
            replaced = previous.is_some(),
            "服务路由已注册"
        );
        Ok(previous.map(|old| old.config.clone()))
    }

    /// 删除服务的全部路由
    pub fn deregister_service(&self, name: &str) -> Option<Arc<ServiceConfig>> {
        let mut inner = self.inner.write();
        let removed = inner.services.remove(name)?;
        inner.prefixes.remove(&removed.prefix);
        drop(inner);

        info!(service = %name, "服务路由已删除");
        Some(removed.config.clone())
    }

    pub fn get_service(&self, name: &str) -> Option<Arc<ServiceConfig>> {
        self.inner
            .read()
            .services
            .get(name)
            .map(|s| s.config.clone())
    }

    /// 全部服务，按名称排序
    pub fn get_services(&self) -> Vec<Arc<ServiceConfig>> {
        let mut services: Vec<_> = self
            .inner
            .read()
            .services
            .values()
            .map(|s| s.config.clone())
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    /// 按最长前缀查找路径所属的服务
    pub fn match_service(&self, path: &str) -> Option<Arc<ServiceConfig>> {
        let inner = self.inner.read();
        Self::longest_prefix(&inner, path).map(|(service, _)| service.config.clone())
    }

    /// 解析请求对应的路由
    pub fn resolve(&self, method: &Method, path: &str) -> Result<ResolvedRoute, Error> {
        let inner = self.inner.read();
        let (service, relative) = Self::longest_prefix(&inner, path)
            .ok_or_else(|| Error::NotFound(format!("没有匹配的服务: {}", path)))?;

        let mut best: Option<(MatchScore, &RouteBinding, Vec<(String, String)>)> = None;
        let mut path_matched = false;
        for binding in &service.bindings {
            let Some((score, params)) = binding.pattern.matches(relative) else {
                continue;
            };
            path_matched = true;
            if binding.method != "*" && binding.method != method.as_str() {
                continue;
            }
            if best.as_ref().map_or(true, |(s, _, _)| score > *s) {
                best = Some((score, binding, params));
            }
        }

        match best {
            Some((_, binding, params)) => Ok(ResolvedRoute {
                service: service.config.clone(),
                route: binding.route.clone(),
                params: RouteParams(params),
                handler: binding.handler.clone(),
            }),
            None if path_matched => Err(Error::NotFound(format!(
                "服务 {} 的路由 {} 不支持方法 {}",
                service.config.name, relative, method
            ))),
            None => Err(Error::NotFound(format!("没有匹配的路由: {}", path))),
        }
    }

    fn longest_prefix<'a>(
        inner: &'a TableInner,
        path: &'a str,
    ) -> Option<(&'a Arc<MountedService>, &'a str)> {
        inner
            .prefixes
            .iter()
            .filter_map(|(prefix, name)| {
                let relative = strip_prefix(path, prefix)?;
                Some((prefix.len(), name, relative))
            })
            .max_by_key(|(len, _, _)| *len)
            .and_then(|(_, name, relative)| {
                inner.services.get(name).map(|service| (service, relative))
            })
    }
}

/// 按路径段边界去掉前缀
pub fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix == "/" {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}
