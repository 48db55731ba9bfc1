//! 服务注册表与容器的错误类型

use std::any::TypeId;
use thiserror::Error;

/// 工厂函数与健康检查回调使用的通用错误类型
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 服务定位过程中可能出现的所有错误
#[derive(Debug, Error)]
pub enum ServiceError {
    /// 服务未注册
    #[error("Service not registered: {type_name}")]
    ServiceNotRegistered { type_name: &'static str },

    /// 服务创建失败
    #[error("Service creation failed for {type_name}: {reason}")]
    CreationFailed {
        type_name: &'static str,
        reason: String,
    },

    /// 类型转换失败
    #[error("Type cast failed: expected {expected}, got type ID {actual:?}")]
    TypeCastFailed { expected: &'static str, actual: TypeId },

    /// 注册表尚未初始化
    #[error("Service registry has not been initialized")]
    RegistryNotReady,
}
