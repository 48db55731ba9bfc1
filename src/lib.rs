pub mod container;
pub mod errors;
pub mod registry;
pub mod web;

// Re-export commonly used items for convenience
pub use container::{Container, ResolveMany, ServicePing};
pub use errors::{BoxError, ServiceError};
pub use registry::{Registry, RegistryStats, ServiceInfo, ServiceLifetime, ServiceOptions};
pub use web::{with_services, ServiceApp};
