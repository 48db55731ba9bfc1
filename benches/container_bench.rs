#![allow(dead_code)]
//! 服务解析路径的性能基准测试

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;

use svckit::{Container, Registry, ServiceLifetime, ServiceOptions};

/// 测试用的简单服务
#[derive(Clone)]
struct SimpleService {
    value: i32,
}

/// 测试用的依赖链服务
struct DependentService {
    base: Arc<SimpleService>,
}

fn bench_scoped_cache_hit(c: &mut Criterion) {
    let registry = Arc::new(Registry::new());
    registry.register_factory(|_| Ok(SimpleService { value: 42 }));

    let container = Container::new(registry);
    let _ = container.get::<SimpleService>().unwrap();

    c.bench_function("scoped_cache_hit", |b| {
        b.iter(|| black_box(container.get::<SimpleService>().unwrap()))
    });
}

fn bench_singleton_resolution(c: &mut Criterion) {
    let registry = Arc::new(Registry::new());
    registry.register_factory_with(
        |_| Ok(SimpleService { value: 42 }),
        ServiceOptions::new().lifetime(ServiceLifetime::Singleton),
    );

    // 预热单例缓存，之后每个容器的首次解析都命中注册表级缓存
    let _ = Container::new(registry.clone()).get::<SimpleService>().unwrap();

    c.bench_function("singleton_resolution_fresh_container", |b| {
        b.iter_batched(
            || Container::new(registry.clone()),
            |container| black_box(container.get::<SimpleService>().unwrap()),
            BatchSize::SmallInput,
        )
    });
}

fn bench_transient_creation(c: &mut Criterion) {
    let registry = Arc::new(Registry::new());
    registry.register_factory_with(
        |_| Ok(SimpleService { value: 42 }),
        ServiceOptions::new().lifetime(ServiceLifetime::Transient),
    );

    let container = Container::new(registry);

    c.bench_function("transient_creation", |b| {
        b.iter(|| black_box(container.get::<SimpleService>().unwrap()))
    });
}

fn bench_dependency_chain(c: &mut Criterion) {
    let registry = Arc::new(Registry::new());
    registry.register_factory(|_| Ok(SimpleService { value: 42 }));
    registry.register_factory(|container| {
        let base = container.get::<SimpleService>()?;
        Ok(DependentService { base })
    });

    c.bench_function("dependency_chain_cold_container", |b| {
        b.iter_batched(
            || Container::new(registry.clone()),
            |container| black_box(container.get::<DependentService>().unwrap()),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_scoped_cache_hit,
    bench_singleton_resolution,
    bench_transient_creation,
    bench_dependency_chain
);
criterion_main!(benches);
