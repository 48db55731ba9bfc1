//! 每请求服务容器
//!
//! 容器在单个请求的生命周期内按需实例化并缓存服务，
//! 请求结束（容器被丢弃）时按创建的逆序执行清理。

use log::trace;
use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::{BoxError, ServiceError};
use crate::registry::{
    AnyService, PingFn, Registry, RegistryStats, ServiceLifetime, ServiceOptions, TeardownFn,
};

/// 缓存实例连同其创建时登记的清理回调
///
/// 清理回调在实例化时捕获：之后替换绑定不影响已创建实例的清理。
struct CachedInstance {
    service: AnyService,
    type_name: &'static str,
    teardown: Option<TeardownFn>,
}

/// 容器级实例缓存
#[derive(Default)]
struct ScopedCache {
    instances: HashMap<TypeId, CachedInstance>,
    /// 创建顺序，清理时逆序遍历
    order: Vec<TypeId>,
}

/// 一次解析多个服务的辅助 trait，为 1 到 10 个类型的元组实现
pub trait ResolveMany {
    type Output;

    fn resolve_from(container: &Container) -> Result<Self::Output, ServiceError>;
}

macro_rules! impl_resolve_many {
    ($($ty:ident),+) => {
        impl<$($ty: Send + Sync + 'static),+> ResolveMany for ($($ty,)+) {
            type Output = ($(Arc<$ty>,)+);

            fn resolve_from(container: &Container) -> Result<Self::Output, ServiceError> {
                Ok(($(container.get::<$ty>()?,)+))
            }
        }
    };
}

impl_resolve_many!(T1);
impl_resolve_many!(T1, T2);
impl_resolve_many!(T1, T2, T3);
impl_resolve_many!(T1, T2, T3, T4);
impl_resolve_many!(T1, T2, T3, T4, T5);
impl_resolve_many!(T1, T2, T3, T4, T5, T6);
impl_resolve_many!(T1, T2, T3, T4, T5, T6, T7);
impl_resolve_many!(T1, T2, T3, T4, T5, T6, T7, T8);
impl_resolve_many!(T1, T2, T3, T4, T5, T6, T7, T8, T9);
impl_resolve_many!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10);

/// 单个服务的健康检查句柄
///
/// 由 [`Container::get_pings`] 返回，持有已解析的服务实例。
pub struct ServicePing {
    name: &'static str,
    service: AnyService,
    ping: PingFn,
}

impl ServicePing {
    /// 服务类型名称
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 执行健康检查
    pub async fn ping(&self) -> Result<(), BoxError> {
        (self.ping)(self.service.clone()).await
    }
}

impl fmt::Debug for ServicePing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServicePing").field("name", &self.name).finish()
    }
}

/// 每请求服务容器
///
/// 不可克隆；容器被丢弃时自动调用 [`Container::close`]。
pub struct Container {
    registry: Arc<Registry>,
    cache: Mutex<ScopedCache>,
}

impl Container {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            cache: Mutex::new(ScopedCache::default()),
        }
    }

    /// 容器背后的注册表
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// 解析单个服务
    ///
    /// 容器级缓存命中直接返回；否则按注册的生命周期实例化。
    pub fn get<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ServiceError> {
        let type_name = std::any::type_name::<T>();
        let service = self.get_erased(TypeId::of::<T>(), type_name)?;
        let actual = (*service).type_id();
        service.downcast::<T>().map_err(|_| ServiceError::TypeCastFailed {
            expected: type_name,
            actual,
        })
    }

    /// 一次解析多个服务
    ///
    /// ```ignore
    /// let (db, cache) = container.get_many::<(Database, Cache)>()?;
    /// ```
    pub fn get_many<S: ResolveMany>(&self) -> Result<S::Output, ServiceError> {
        S::resolve_from(self)
    }

    pub(crate) fn get_erased(
        &self,
        type_id: TypeId,
        requested: &'static str,
    ) -> Result<AnyService, ServiceError> {
        self.registry.record_resolution();

        {
            let cache = self.cache.lock();
            if let Some(existing) = cache.instances.get(&type_id) {
                let service = existing.service.clone();
                drop(cache);
                self.registry.record_hit();
                trace!("scoped cache hit for {}", requested);
                return Ok(service);
            }
        }

        let registration = self
            .registry
            .registration(type_id)
            .ok_or(ServiceError::ServiceNotRegistered {
                type_name: requested,
            })?;

        match registration.lifetime {
            ServiceLifetime::Singleton => {
                self.registry
                    .get_or_init_singleton(type_id, &registration, self)
            }
            ServiceLifetime::Scoped => {
                self.registry.record_miss();
                // 工厂在锁外运行，允许其解析自己的依赖
                let created = (registration.factory)(self).map_err(|err| {
                    ServiceError::CreationFailed {
                        type_name: registration.type_name,
                        reason: err.to_string(),
                    }
                })?;
                trace!("created scoped instance of {}", registration.type_name);

                let (resolved, discarded) = {
                    let mut cache = self.cache.lock();
                    match cache.instances.entry(type_id) {
                        // 工厂解析依赖时可能已经填充了该槽位
                        Entry::Occupied(entry) => (entry.get().service.clone(), Some(created)),
                        Entry::Vacant(entry) => {
                            entry.insert(CachedInstance {
                                service: created.clone(),
                                type_name: registration.type_name,
                                teardown: registration.teardown.clone(),
                            });
                            cache.order.push(type_id);
                            (created, None)
                        }
                    }
                };
                if let Some(extra) = discarded {
                    if let Some(teardown) = &registration.teardown {
                        teardown(extra);
                    }
                }
                Ok(resolved)
            }
            ServiceLifetime::Transient => {
                self.registry.record_miss();
                (registration.factory)(self).map_err(|err| ServiceError::CreationFailed {
                    type_name: registration.type_name,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// 替换注册表中的工厂并重置本容器的实例缓存
    pub fn overwrite_factory<T, F>(&self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&Container) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.overwrite_factory_with(factory, ServiceOptions::new());
    }

    /// 替换注册表中的工厂（带可选配置）并重置本容器的实例缓存
    pub fn overwrite_factory_with<T, F>(&self, factory: F, options: ServiceOptions<T>)
    where
        T: Send + Sync + 'static,
        F: Fn(&Container) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.registry.register_factory_with(factory, options);
        self.close();
    }

    /// 用现成实例替换注册并重置本容器的实例缓存
    pub fn overwrite_value<T>(&self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.overwrite_value_with(value, ServiceOptions::new());
    }

    /// 用现成实例替换注册（带可选配置）并重置本容器的实例缓存
    pub fn overwrite_value_with<T>(&self, value: T, options: ServiceOptions<T>)
    where
        T: Send + Sync + 'static,
    {
        self.registry.register_value_with(value, options);
        self.close();
    }

    /// 丢弃容器缓存的全部实例，按创建的逆序运行清理回调
    ///
    /// 容器之后仍然可用，下次解析会重新实例化。
    pub fn close(&self) {
        let (mut instances, order) = {
            let mut cache = self.cache.lock();
            (
                std::mem::take(&mut cache.instances),
                std::mem::take(&mut cache.order),
            )
        };
        for type_id in order.into_iter().rev() {
            if let Some(cached) = instances.remove(&type_id) {
                if let Some(teardown) = &cached.teardown {
                    trace!("tearing down scoped instance of {}", cached.type_name);
                    teardown(cached.service);
                }
            }
        }
    }

    /// 解析所有带健康检查的服务并返回检查句柄
    pub fn get_pings(&self) -> Result<Vec<ServicePing>, ServiceError> {
        let mut pings = Vec::new();
        for (type_id, registration) in self.registry.pinged_registrations() {
            let Some(ping) = registration.ping.clone() else {
                continue;
            };
            let service = self.get_erased(type_id, registration.type_name)?;
            pings.push(ServicePing {
                name: registration.type_name,
                service,
                ping,
            });
        }
        Ok(pings)
    }

    /// 注册表级解析统计
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("registry", &self.registry)
            .field("cached_instances", &self.cache.lock().instances.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct TestService {
        id: usize,
    }

    #[test]
    fn test_scoped_service_created_once_per_container() {
        let registry = Arc::new(Registry::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        registry.register_factory(move |_| {
            let id = counter_clone.fetch_add(1, Ordering::SeqCst);
            Ok(TestService { id })
        });

        let container = Container::new(registry);
        let first = container.get::<TestService>().unwrap();
        let second = container.get::<TestService>().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_service_not_registered() {
        let registry = Arc::new(Registry::new());
        let container = Container::new(registry);

        let result = container.get::<TestService>();
        assert!(matches!(
            result,
            Err(ServiceError::ServiceNotRegistered { .. })
        ));
    }

    #[test]
    fn test_transient_service_created_each_time() {
        let registry = Arc::new(Registry::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        registry.register_factory_with(
            move |_| {
                let id = counter_clone.fetch_add(1, Ordering::SeqCst);
                Ok(TestService { id })
            },
            ServiceOptions::new().lifetime(ServiceLifetime::Transient),
        );

        let container = Container::new(registry);
        let first = container.get::<TestService>().unwrap();
        let second = container.get::<TestService>().unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ping_reaches_service_instance() {
        let registry = Arc::new(Registry::new());
        registry.register_factory_with(
            |_| Ok(TestService { id: 42 }),
            ServiceOptions::new().ping(|service: Arc<TestService>| async move {
                if service.id == 42 {
                    Ok(())
                } else {
                    Err("wrong id".into())
                }
            }),
        );

        let container = Container::new(registry);
        let pings = container.get_pings().unwrap();
        assert_eq!(pings.len(), 1);
        assert!(pings[0].ping().await.is_ok());
    }
}
