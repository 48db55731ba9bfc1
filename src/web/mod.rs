//! Warp integration for the service registry.
//!
//! `ServiceApp` owns the application-level registry, `with_services` injects a
//! fresh per-request `Container` into the filter chain, and `health_route`
//! exposes the ping protocol as a JSON health endpoint.

use std::convert::Infallible;
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::container::Container;
use crate::errors::{BoxError, ServiceError};
use crate::registry::{Registry, ServiceOptions};

/// Application-level holder for the service registry.
///
/// Create one at startup and call [`ServiceApp::ready`] before serving
/// requests. `ready()` is idempotent, so lifecycle hooks that may run more
/// than once can call it safely.
pub struct ServiceApp {
    registry: RwLock<Option<Arc<Registry>>>,
}

impl ServiceApp {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(None),
        }
    }

    /// Initialize the registry if it has not been set up yet.
    pub fn ready(&self) {
        let mut slot = self.registry.write();
        if slot.is_none() {
            *slot = Some(Arc::new(Registry::new()));
            debug!("service registry initialized");
        }
    }

    /// Get the registry, failing if [`ServiceApp::ready`] has not run.
    pub fn registry(&self) -> Result<Arc<Registry>, ServiceError> {
        self.registry
            .read()
            .clone()
            .ok_or(ServiceError::RegistryNotReady)
    }

    /// Replace the registry wholesale. Meant for tests and for wiring in a
    /// registry that was populated elsewhere.
    pub fn set_registry(&self, registry: Arc<Registry>) {
        *self.registry.write() = Some(registry);
    }

    /// Same as [`Registry::register_factory`], on the app registry.
    pub fn register_factory<T, F>(&self, factory: F) -> Result<(), ServiceError>
    where
        T: Send + Sync + 'static,
        F: Fn(&Container) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.registry()?.register_factory(factory);
        Ok(())
    }

    /// Same as [`Registry::register_factory_with`], on the app registry.
    pub fn register_factory_with<T, F>(
        &self,
        factory: F,
        options: ServiceOptions<T>,
    ) -> Result<(), ServiceError>
    where
        T: Send + Sync + 'static,
        F: Fn(&Container) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.registry()?.register_factory_with(factory, options);
        Ok(())
    }

    /// Same as [`Registry::register_value`], on the app registry.
    pub fn register_value<T>(&self, value: T) -> Result<(), ServiceError>
    where
        T: Send + Sync + 'static,
    {
        self.registry()?.register_value(value);
        Ok(())
    }

    /// Same as [`Registry::register_value_with`], on the app registry.
    pub fn register_value_with<T>(
        &self,
        value: T,
        options: ServiceOptions<T>,
    ) -> Result<(), ServiceError>
    where
        T: Send + Sync + 'static,
    {
        self.registry()?.register_value_with(value, options);
        Ok(())
    }
}

impl Default for ServiceApp {
    fn default() -> Self {
        Self::new()
    }
}

/// Rejection raised when a request arrives before the registry is ready.
#[derive(Debug)]
pub struct RegistryUnavailable;

impl warp::reject::Reject for RegistryUnavailable {}

/// Rejection wrapping a service resolution failure inside a handler.
#[derive(Debug)]
pub struct ServiceFailure {
    pub error: String,
}

impl warp::reject::Reject for ServiceFailure {}

impl ServiceFailure {
    pub fn new(err: ServiceError) -> Rejection {
        warp::reject::custom(ServiceFailure {
            error: err.to_string(),
        })
    }
}

/// Inject a fresh per-request [`Container`] into the filter chain.
///
/// Each matched request gets its own container backed by the app registry;
/// the container is dropped (and its scoped instances cleaned up) when the
/// request handler finishes with it.
pub fn with_services(
    app: Arc<ServiceApp>,
) -> impl Filter<Extract = (Container,), Error = Rejection> + Clone {
    warp::any().and_then(move || {
        let app = app.clone();
        async move {
            match app.registry() {
                Ok(registry) => Ok(Container::new(registry)),
                Err(_) => Err(warp::reject::custom(RegistryUnavailable)),
            }
        }
    })
}

#[derive(Debug, Serialize)]
struct ServiceHealth {
    name: &'static str,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// GET /health
///
/// Resolves every service that registered a ping and executes the checks
/// against a per-request container. Replies 200 when all pass, 503 otherwise.
pub fn health_route(
    app: Arc<ServiceApp>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("health")
        .and(warp::get())
        .and(with_services(app))
        .and_then(health_handler)
}

async fn health_handler(container: Container) -> Result<impl Reply, Infallible> {
    let pings = match container.get_pings() {
        Ok(pings) => pings,
        Err(err) => {
            let body = json!({ "ok": false, "error": err.to_string() });
            return Ok(warp::reply::with_status(
                warp::reply::json(&body),
                StatusCode::SERVICE_UNAVAILABLE,
            ));
        }
    };

    let mut services = Vec::with_capacity(pings.len());
    let mut all_ok = true;
    for ping in &pings {
        match ping.ping().await {
            Ok(()) => services.push(ServiceHealth {
                name: ping.name(),
                ok: true,
                error: None,
            }),
            Err(err) => {
                all_ok = false;
                services.push(ServiceHealth {
                    name: ping.name(),
                    ok: false,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({ "ok": all_ok, "services": services });
    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}

/// Map svckit rejections to JSON error replies; pass everything else through.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Rejection> {
    if err.find::<RegistryUnavailable>().is_some() {
        let body = json!({ "error": "service registry is not ready" });
        Ok(warp::reply::with_status(
            warp::reply::json(&body),
            StatusCode::INTERNAL_SERVER_ERROR,
        ))
    } else if let Some(failure) = err.find::<ServiceFailure>() {
        let body = json!({ "error": failure.error });
        Ok(warp::reply::with_status(
            warp::reply::json(&body),
            StatusCode::INTERNAL_SERVER_ERROR,
        ))
    } else {
        Err(err)
    }
}
