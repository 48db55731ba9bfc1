//! # svckit 演示服务器
//!
//! 演示如何把服务注册表挂接到 warp 请求生命周期：
//! 每个请求获得独立的服务容器，/health 端点执行所有已注册服务的健康检查。
//!
//! ## 运行方式
//!
//! ```bash
//! cargo run --bin svckit-demo -- --listen-addr 127.0.0.1:8080
//! ```

use clap::Parser;
use log::info;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use warp::Filter;

use svckit::web::{handle_rejection, health_route, with_services, ServiceApp, ServiceFailure};
use svckit::{Container, ServiceLifetime, ServiceOptions};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 监听地址
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen_addr: String,
}

/// 应用元信息（注册为固定值）
#[derive(Debug, Clone)]
struct AppInfo {
    name: String,
    version: String,
}

/// 问候服务（每请求创建）
struct Greeter {
    template: String,
}

impl Greeter {
    fn greet(&self, who: &str) -> String {
        self.template.replace("{}", who)
    }
}

/// 请求计数器（注册表级单例）
struct HitCounter {
    hits: AtomicUsize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let app = Arc::new(ServiceApp::new());
    app.ready();

    app.register_value(AppInfo {
        name: "svckit-demo".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })?;
    app.register_factory_with(
        |_| {
            Ok(Greeter {
                template: "Hello, {}!".to_string(),
            })
        },
        ServiceOptions::new().ping(|greeter: Arc<Greeter>| async move {
            if greeter.template.contains("{}") {
                Ok(())
            } else {
                Err("greeting template lost its placeholder".into())
            }
        }),
    )?;
    app.register_factory_with(
        |_| {
            Ok(HitCounter {
                hits: AtomicUsize::new(0),
            })
        },
        ServiceOptions::new().lifetime(ServiceLifetime::Singleton),
    )?;

    // GET /greet/<name>
    let greet = warp::path!("greet" / String)
        .and(warp::get())
        .and(with_services(app.clone()))
        .and_then(|who: String, container: Container| async move {
            let (greeter, counter) = container
                .get_many::<(Greeter, HitCounter)>()
                .map_err(ServiceFailure::new)?;
            let info = container.get::<AppInfo>().map_err(ServiceFailure::new)?;
            let hits = counter.hits.fetch_add(1, Ordering::Relaxed) + 1;
            Ok::<_, warp::Rejection>(warp::reply::json(&serde_json::json!({
                "message": greeter.greet(&who),
                "served_by": format!("{} v{}", info.name, info.version),
                "hits": hits,
            })))
        });

    // GET /services
    let services = {
        let app = app.clone();
        warp::path("services").and(warp::get()).and_then(move || {
            let app = app.clone();
            async move {
                let registry = app.registry().map_err(ServiceFailure::new)?;
                Ok::<_, warp::Rejection>(warp::reply::json(&registry.registered_services()))
            }
        })
    };

    let routes = greet
        .or(services)
        .or(health_route(app.clone()))
        .recover(handle_rejection)
        .with(warp::log("svckit_demo"));

    let addr: std::net::SocketAddr = args.listen_addr.parse()?;
    info!("svckit-demo listening on {}", addr);
    warp::serve(routes).run(addr).await;
    Ok(())
}
