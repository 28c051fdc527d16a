//! 驱动层错误定义

use std::time::Duration;

use thiserror::Error;

use crate::models::{ManagedObjectRef, ObjectType};

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("cannot connect to {endpoint}")]
    Connection {
        endpoint: String,
        #[source]
        source: ConnectionFailure,
    },

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("task {operation} failed: {message}")]
    Task { operation: String, message: String },

    /// `result` 为远程任务在取消请求之后仍然完成时产生的对象
    #[error("task {operation} did not finish within {after:?}")]
    Timeout {
        operation: String,
        after: Duration,
        result: Option<ManagedObjectRef>,
    },

    #[error("task {operation} was cancelled")]
    Cancelled {
        operation: String,
        result: Option<ManagedObjectRef>,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("an object named '{0}' already exists")]
    DuplicateName(String),

    #[error("managed object {0} no longer exists")]
    ObjectNotFound(ManagedObjectRef),

    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error [{0}]: {1}")]
    Api(u16, String),

    #[error("parse error: {0}")]
    Parse(String),
}

/// 连接失败原因
///
/// 认证、TLS、网络三类失败统一归入 [`DriverError::Connection`]，
/// 这里只保留具体原因，供 `source()` 链展示。
#[derive(Error, Debug)]
pub enum ConnectionFailure {
    #[error("authentication rejected for user '{0}'")]
    AuthenticationRejected(String),

    #[error("TLS verification failed: {0}")]
    Tls(String),

    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// 清单路径解析错误
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("{kind} '{path}' not found")]
    NotFound { kind: ObjectType, path: String },

    #[error("{kind} '{path}' is ambiguous: {count} objects match")]
    Ambiguous {
        kind: ObjectType,
        path: String,
        count: usize,
    },
}

/// 属性查询错误
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("unsupported property '{0}'")]
    UnsupportedProperty(String),

    #[error("cannot read property '{property}': {reason}")]
    Unreadable { property: String, reason: String },
}

impl DriverError {
    pub(crate) fn not_found(kind: ObjectType, path: impl Into<String>) -> Self {
        ResolutionError::NotFound {
            kind,
            path: path.into(),
        }
        .into()
    }

    pub(crate) fn ambiguous(kind: ObjectType, path: impl Into<String>, count: usize) -> Self {
        ResolutionError::Ambiguous {
            kind,
            path: path.into(),
            count,
        }
        .into()
    }

    /// 是否为远程任务超时
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 是否为调用方取消
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// 超时或取消时远程任务仍已产生的对象
    pub fn task_result(&self) -> Option<&ManagedObjectRef> {
        match self {
            Self::Timeout { result, .. } | Self::Cancelled { result, .. } => result.as_ref(),
            _ => None,
        }
    }
}

/// 驱动层结果类型
pub type Result<T> = std::result::Result<T, DriverError>;
