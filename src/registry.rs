//! 服务注册表
//!
//! 保存服务类型到工厂函数的绑定关系，应用级共享。
//! 实例按生命周期缓存：注册表级单例、容器级（每请求一个）、
//! 以及每次解析都重新创建的瞬态服务。

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use log::debug;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::container::Container;
use crate::errors::{BoxError, ServiceError};

/// 类型擦除后的服务实例
pub(crate) type AnyService = Arc<dyn Any + Send + Sync>;
/// 类型擦除后的工厂函数
pub(crate) type FactoryFn =
    Arc<dyn Fn(&Container) -> Result<AnyService, BoxError> + Send + Sync>;
/// 类型擦除后的健康检查函数
pub(crate) type PingFn =
    Arc<dyn Fn(AnyService) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;
/// 缓存实例被丢弃时运行的清理函数
pub(crate) type TeardownFn = Arc<dyn Fn(AnyService) + Send + Sync>;
/// 注册表关闭时运行的钩子
type RegistryCloseFn = Box<dyn FnOnce() + Send>;

/// 服务生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceLifetime {
    /// 整个注册表生命周期内的单实例
    Singleton,
    /// 每个容器（每个请求）一个实例
    Scoped,
    /// 每次解析都创建新实例
    Transient,
}

/// 注册服务时的可选配置
///
/// 默认生命周期为 [`ServiceLifetime::Scoped`]，不带健康检查和清理钩子。
pub struct ServiceOptions<T> {
    lifetime: ServiceLifetime,
    ping: Option<PingFn>,
    teardown: Option<TeardownFn>,
    on_registry_close: Option<RegistryCloseFn>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + Sync + 'static> ServiceOptions<T> {
    pub fn new() -> Self {
        Self {
            lifetime: ServiceLifetime::Scoped,
            ping: None,
            teardown: None,
            on_registry_close: None,
            _marker: PhantomData,
        }
    }

    /// 设置服务生命周期
    pub fn lifetime(mut self, lifetime: ServiceLifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// 设置健康检查回调，接收已解析的服务实例
    pub fn ping<F, Fut>(mut self, ping: F) -> Self
    where
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.ping = Some(Arc::new(move |service: AnyService| {
            let fut: BoxFuture<'static, Result<(), BoxError>> = match service.downcast::<T>() {
                Ok(typed) => Box::pin(ping(typed)),
                Err(original) => {
                    let err = ServiceError::TypeCastFailed {
                        expected: std::any::type_name::<T>(),
                        actual: (*original).type_id(),
                    };
                    Box::pin(async move { Err(Box::new(err) as BoxError) })
                }
            };
            fut
        }));
        self
    }

    /// 设置清理回调，在缓存实例被丢弃时按创建的逆序运行
    pub fn teardown<F>(mut self, teardown: F) -> Self
    where
        F: Fn(Arc<T>) + Send + Sync + 'static,
    {
        self.teardown = Some(Arc::new(move |service: AnyService| {
            if let Ok(typed) = service.downcast::<T>() {
                teardown(typed);
            }
        }));
        self
    }

    /// 设置注册表关闭时运行的钩子
    pub fn on_registry_close<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_registry_close = Some(Box::new(hook));
        self
    }
}

impl<T: Send + Sync + 'static> Default for ServiceOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个服务的注册信息
#[derive(Clone)]
pub(crate) struct ServiceRegistration {
    pub(crate) type_name: &'static str,
    pub(crate) lifetime: ServiceLifetime,
    pub(crate) factory: FactoryFn,
    pub(crate) ping: Option<PingFn>,
    pub(crate) teardown: Option<TeardownFn>,
    pub(crate) registered_at: DateTime<Utc>,
}

/// 注册信息的只读视图
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    /// 服务类型名称
    pub type_name: &'static str,
    /// 生命周期
    pub lifetime: ServiceLifetime,
    /// 是否带健康检查
    pub has_ping: bool,
    /// 注册时间
    pub registered_at: DateTime<Utc>,
}

/// 内部统计信息（原子计数器）
#[derive(Default)]
struct InnerStats {
    total_resolutions: AtomicUsize,
    cache_hits: AtomicUsize,
    cache_misses: AtomicUsize,
}

/// 注册表解析统计信息
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub total_resolutions: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
}

impl RegistryStats {
    /// 总解析次数
    pub fn total(&self) -> usize {
        self.total_resolutions
    }

    /// 缓存命中率
    pub fn hit_rate(&self) -> f64 {
        let attempts = self.cache_hits + self.cache_misses;
        if attempts == 0 {
            0.0
        } else {
            self.cache_hits as f64 / attempts as f64
        }
    }
}

/// 服务注册表
///
/// 注册是 last-write-wins 的：重复注册同一类型会替换旧绑定，
/// 并使已缓存的单例失效。
pub struct Registry {
    services: DashMap<TypeId, ServiceRegistration>,
    /// 单例实例缓存，OnceCell 保证并发首次解析只创建一次
    singletons: DashMap<TypeId, Arc<OnceCell<AnyService>>>,
    /// 单例创建顺序，关闭时逆序清理
    singleton_order: Mutex<Vec<TypeId>>,
    /// 注册表关闭钩子，按注册顺序存放
    close_hooks: Mutex<Vec<(&'static str, RegistryCloseFn)>>,
    stats: InnerStats,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            singletons: DashMap::new(),
            singleton_order: Mutex::new(Vec::new()),
            close_hooks: Mutex::new(Vec::new()),
            stats: InnerStats::default(),
        }
    }

    /// 注册服务工厂，默认容器级生命周期
    pub fn register_factory<T, F>(&self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&Container) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.register_factory_with(factory, ServiceOptions::new());
    }

    /// 注册服务工厂并附带可选配置
    pub fn register_factory_with<T, F>(&self, factory: F, options: ServiceOptions<T>)
    where
        T: Send + Sync + 'static,
        F: Fn(&Container) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        let mut options = options;
        let erased: FactoryFn =
            Arc::new(move |container| factory(container).map(|service| Arc::new(service) as AnyService));
        if let Some(hook) = options.on_registry_close.take() {
            self.close_hooks
                .lock()
                .push((std::any::type_name::<T>(), hook));
        }
        self.insert(
            TypeId::of::<T>(),
            ServiceRegistration {
                type_name: std::any::type_name::<T>(),
                lifetime: options.lifetime,
                factory: erased,
                ping: options.ping,
                teardown: options.teardown,
                registered_at: Utc::now(),
            },
        );
    }

    /// 注册已构建好的服务实例
    pub fn register_value<T>(&self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.register_value_with(value, ServiceOptions::new());
    }

    /// 注册已构建好的服务实例并附带可选配置
    ///
    /// 预构建的实例等价于单例，配置中的生命周期被忽略。
    pub fn register_value_with<T>(&self, value: T, options: ServiceOptions<T>)
    where
        T: Send + Sync + 'static,
    {
        let mut options = options;
        let instance: AnyService = Arc::new(value);
        if let Some(hook) = options.on_registry_close.take() {
            self.close_hooks
                .lock()
                .push((std::any::type_name::<T>(), hook));
        }
        let factory: FactoryFn = {
            let instance = instance.clone();
            Arc::new(move |_| Ok(instance.clone()))
        };
        self.insert(
            TypeId::of::<T>(),
            ServiceRegistration {
                type_name: std::any::type_name::<T>(),
                lifetime: ServiceLifetime::Singleton,
                factory,
                ping: options.ping,
                teardown: options.teardown,
                registered_at: Utc::now(),
            },
        );
    }

    fn insert(&self, type_id: TypeId, registration: ServiceRegistration) {
        let type_name = registration.type_name;
        if let Some(previous) = self.services.insert(type_id, registration) {
            debug!("replaced service binding for {}", type_name);
            // 旧绑定缓存的单例随之失效
            if let Some((_, cell)) = self.singletons.remove(&type_id) {
                self.singleton_order.lock().retain(|id| *id != type_id);
                if let (Some(instance), Some(teardown)) = (cell.get(), &previous.teardown) {
                    teardown(instance.clone());
                }
            }
        } else {
            debug!("registered service {}", type_name);
        }
    }

    /// 检查服务是否已注册
    pub fn is_registered<T: 'static>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<T>())
    }

    /// 列出所有已注册服务，按类型名排序
    pub fn registered_services(&self) -> Vec<ServiceInfo> {
        let mut infos: Vec<ServiceInfo> = self
            .services
            .iter()
            .map(|entry| {
                let registration = entry.value();
                ServiceInfo {
                    type_name: registration.type_name,
                    lifetime: registration.lifetime,
                    has_ping: registration.ping.is_some(),
                    registered_at: registration.registered_at,
                }
            })
            .collect();
        infos.sort_by_key(|info| info.type_name);
        infos
    }

    pub(crate) fn registration(&self, type_id: TypeId) -> Option<ServiceRegistration> {
        self.services.get(&type_id).map(|entry| entry.value().clone())
    }

    /// 带健康检查的注册项，按注册时间排序
    pub(crate) fn pinged_registrations(&self) -> Vec<(TypeId, ServiceRegistration)> {
        let mut pinged: Vec<(TypeId, ServiceRegistration)> = self
            .services
            .iter()
            .filter(|entry| entry.value().ping.is_some())
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        pinged.sort_by_key(|(_, registration)| registration.registered_at);
        pinged
    }

    pub(crate) fn get_or_init_singleton(
        &self,
        type_id: TypeId,
        registration: &ServiceRegistration,
        container: &Container,
    ) -> Result<AnyService, ServiceError> {
        let cell = self
            .singletons
            .entry(type_id)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let mut initialized = false;
        let service = cell
            .get_or_try_init(|| {
                let created = (registration.factory)(container).map_err(|err| {
                    ServiceError::CreationFailed {
                        type_name: registration.type_name,
                        reason: err.to_string(),
                    }
                })?;
                initialized = true;
                Ok::<AnyService, ServiceError>(created)
            })?
            .clone();

        if initialized {
            self.record_miss();
            self.singleton_order.lock().push(type_id);
            debug!("created singleton instance of {}", registration.type_name);
        } else {
            self.record_hit();
        }
        Ok(service)
    }

    /// 关闭注册表：先按注册的逆序运行关闭钩子，
    /// 再按创建的逆序清理单例实例。可重复调用。
    pub fn close(&self) {
        let hooks: Vec<(&'static str, RegistryCloseFn)> = {
            let mut guard = self.close_hooks.lock();
            guard.drain(..).collect()
        };
        for (type_name, hook) in hooks.into_iter().rev() {
            debug!("running registry close hook for {}", type_name);
            hook();
        }

        let order: Vec<TypeId> = {
            let mut guard = self.singleton_order.lock();
            guard.drain(..).collect()
        };
        for type_id in order.into_iter().rev() {
            if let Some((_, cell)) = self.singletons.remove(&type_id) {
                if let Some(instance) = cell.get() {
                    if let Some(registration) = self.registration(type_id) {
                        if let Some(teardown) = &registration.teardown {
                            debug!("tearing down singleton {}", registration.type_name);
                            teardown(instance.clone());
                        }
                    }
                }
            }
        }
    }

    /// 解析统计信息
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_resolutions: self.stats.total_resolutions.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.stats.cache_misses.load(Ordering::Relaxed),
        }
    }

    /// 缓存命中率
    pub fn cache_hit_rate(&self) -> f64 {
        self.stats().hit_rate()
    }

    pub(crate) fn record_resolution(&self) {
        self.stats.total_resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hit(&self) {
        self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("registered_services", &self.services.len())
            .field("active_singletons", &self.singletons.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct TestService {
        id: usize,
    }

    #[test]
    fn test_register_and_listing() {
        let registry = Registry::new();
        assert!(!registry.is_registered::<TestService>());

        registry.register_factory(|_| Ok(TestService { id: 1 }));

        assert!(registry.is_registered::<TestService>());
        let infos = registry.registered_services();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].lifetime, ServiceLifetime::Scoped);
        assert!(!infos[0].has_ping);
    }

    #[test]
    fn test_value_registration_is_singleton() {
        let registry = Registry::new();
        registry.register_value(TestService { id: 7 });

        let infos = registry.registered_services();
        assert_eq!(infos[0].lifetime, ServiceLifetime::Singleton);
    }

    #[test]
    fn test_replace_binding() {
        let registry = Registry::new();
        registry.register_factory(|_| Ok(TestService { id: 1 }));
        registry.register_value(TestService { id: 2 });

        // 重复注册会替换绑定，注册数量不变
        assert_eq!(registry.registered_services().len(), 1);
        assert_eq!(
            registry.registered_services()[0].lifetime,
            ServiceLifetime::Singleton
        );
    }

    #[test]
    fn test_close_hooks_run_in_reverse_order() {
        let events: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));
        let registry = Registry::new();

        let first = events.clone();
        registry.register_factory_with(
            |_| Ok(TestService { id: 1 }),
            ServiceOptions::new().on_registry_close(move || first.lock().unwrap().push("first")),
        );
        let second = events.clone();
        registry.register_value_with(
            42_u32,
            ServiceOptions::new().on_registry_close(move || second.lock().unwrap().push("second")),
        );

        registry.close();
        assert_eq!(*events.lock().unwrap(), vec!["second", "first"]);

        // 再次关闭不会重复运行钩子
        registry.close();
        assert_eq!(events.lock().unwrap().len(), 2);
    }
}
