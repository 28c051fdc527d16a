//! 构建器错误定义

use thiserror::Error;
use vsb_driver::{DriverError, ManagedObjectRef};

use crate::report::Stage;

/// 克隆阶段错误
#[derive(Error, Debug)]
pub enum CloneError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("cannot choose a datastore: {hint} offers {count} datastores, set `datastore` explicitly")]
    AmbiguousDatastore { hint: String, count: usize },

    #[error("clone {vm} spans {count} datastores")]
    SpansDatastores { vm: ManagedObjectRef, count: usize },

    #[error("no datastore available on {0}")]
    NoDatastore(String),
}

/// 配置校验错误
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required options: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("conflicting options: {0}")]
    Conflict(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// 构建错误，按失败来源分类
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("connection failed: {0}")]
    Connection(#[source] DriverError),

    #[error("inventory resolution failed: {0}")]
    Resolution(#[source] DriverError),

    #[error("clone failed: {0}")]
    Clone(#[source] CloneError),

    #[error("configuration failed: {0}")]
    Configuration(#[source] DriverError),

    #[error("{0}")]
    Timeout(#[source] DriverError),

    #[error("property query failed: {0}")]
    Query(#[source] DriverError),

    #[error("build cancelled: {0}")]
    Cancelled(#[source] DriverError),

    #[error("guest provisioning failed: {0:#}")]
    GuestHook(anyhow::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BuildError {
    /// 按所处阶段归类驱动层错误；超时、取消与属性查询错误优先
    pub fn classify(stage: Stage, err: DriverError) -> Self {
        match err {
            err if err.is_timeout() => Self::Timeout(err),
            err if err.is_cancelled() => Self::Cancelled(err),
            err @ DriverError::Query(_) => Self::Query(err),
            err => match stage {
                Stage::Connecting => Self::Connection(err),
                Stage::Resolving => Self::Resolution(err),
                Stage::Cloning => Self::Clone(CloneError::Driver(err)),
                _ => Self::Configuration(err),
            },
        }
    }

    /// 克隆引擎错误中的驱动层部分同样按超时、取消归类
    pub fn from_clone(err: CloneError) -> Self {
        match err {
            CloneError::Driver(err) => Self::classify(Stage::Cloning, err),
            other => Self::Clone(other),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// 失败后的清理结果
#[derive(Debug)]
pub enum Cleanup {
    /// 失败时尚未产生虚拟机
    NotNeeded,

    /// 已删除部分构建的虚拟机
    Destroyed(ManagedObjectRef),

    /// 清理本身失败，虚拟机可能残留
    Failed {
        vm: ManagedObjectRef,
        error: DriverError,
    },
}

impl Cleanup {
    pub fn is_clean(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// 构建失败：出错阶段、原始错误与清理结果
#[derive(Error, Debug)]
#[error("build failed during {stage}: {error}")]
pub struct BuildFailure {
    pub stage: Stage,

    #[source]
    pub error: BuildError,

    pub cleanup: Cleanup,
}
