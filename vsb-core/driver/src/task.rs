//! 远程任务
//!
//! 管理端的长耗时操作（克隆、重配置、快照、电源、删除）都返回任务引用，
//! [`Task::wait`] 轮询直到结束，并支持截止时间与取消。

use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::Driver;
use crate::error::{DriverError, Result};
use crate::models::{ManagedObjectRef, TaskState};
use crate::vm::PropertyCache;

/// 等待选项
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// 截止时间
    pub timeout: Duration,

    /// 轮询间隔
    pub poll_interval: Duration,

    /// 调用方取消
    pub cancel: Option<CancellationToken>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1800),
            poll_interval: Duration::from_millis(500),
            cancel: None,
        }
    }
}

impl WaitOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// 同样的轮询节奏，换一个截止时间
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

/// 远程任务句柄
pub struct Task {
    driver: Driver,
    operation: &'static str,

    /// `None` 表示无需执行的已完成任务
    reference: Option<ManagedObjectRef>,

    /// 成功后需要失效的属性缓存
    cache: Option<PropertyCache>,
}

impl Task {
    pub(crate) fn new(driver: Driver, operation: &'static str, reference: ManagedObjectRef) -> Self {
        Self {
            driver,
            operation,
            reference: Some(reference),
            cache: None,
        }
    }

    /// 已处于目标状态时返回的空任务
    pub(crate) fn completed(driver: Driver, operation: &'static str) -> Self {
        Self {
            driver,
            operation,
            reference: None,
            cache: None,
        }
    }

    pub(crate) fn invalidates(mut self, cache: PropertyCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// 方法名，如 `CloneVM_Task`
    pub fn operation(&self) -> &str {
        self.operation
    }

    pub fn reference(&self) -> Option<&ManagedObjectRef> {
        self.reference.as_ref()
    }

    /// 是否为无需等待的空任务
    pub fn is_noop(&self) -> bool {
        self.reference.is_none()
    }

    /// 等待任务结束，返回任务结果对象（如有）
    pub async fn wait(&self, options: &WaitOptions) -> Result<Option<ManagedObjectRef>> {
        let Some(reference) = &self.reference else {
            debug!("{} 无需执行", self.operation);
            return Ok(None);
        };

        let deadline = Instant::now() + options.timeout;
        let backend = self.driver.backend();

        loop {
            if options.is_cancelled() {
                return Err(self.abort(reference, false, options).await);
            }

            let info = tokio::select! {
                info = backend.task_info(reference) => info?,
                _ = sleep_until(deadline) => {
                    return Err(self.abort(reference, true, options).await);
                }
            };
            match info.state {
                TaskState::Success => {
                    info!("{} 完成: {}", self.operation, reference);
                    if let Some(cache) = &self.cache {
                        cache.clear().await;
                    }
                    return Ok(info.result);
                }
                TaskState::Error => {
                    let message = info.error.unwrap_or_else(|| "未知错误".to_string());
                    warn!("{} 失败: {}", self.operation, message);
                    return Err(DriverError::Task {
                        operation: self.operation.to_string(),
                        message,
                    });
                }
                TaskState::Queued | TaskState::Running => {
                    debug!(
                        "{} 进行中 ({}): {:?}%",
                        self.operation, reference, info.progress
                    );
                }
            }

            let cancelled = async {
                match &options.cancel {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancelled => {
                    return Err(self.abort(reference, false, options).await);
                }
                _ = sleep_until(deadline) => {
                    return Err(self.abort(reference, true, options).await);
                }
                _ = sleep(options.poll_interval) => {}
            }
        }
    }

    /// 请求远程取消，返回超时或取消错误
    ///
    /// 取消后再读一次任务状态：不可取消的任务可能已经完成，其结果对象
    /// 随错误返回，由调用方负责处理。
    async fn abort(
        &self,
        reference: &ManagedObjectRef,
        timed_out: bool,
        options: &WaitOptions,
    ) -> DriverError {
        if timed_out {
            warn!("{} 超时 ({:?})，取消远程任务", self.operation, options.timeout);
        } else {
            warn!("{} 被取消，取消远程任务", self.operation);
        }

        let backend = self.driver.backend();
        if let Err(e) = backend.cancel_task(reference).await {
            warn!("取消远程任务 {} 失败: {}", reference, e);
        }

        let result = match backend.task_info(reference).await {
            Ok(info) if info.state == TaskState::Success => {
                warn!(
                    "{} 在取消前已完成，结果: {:?}",
                    self.operation, info.result
                );
                if let Some(cache) = &self.cache {
                    cache.clear().await;
                }
                info.result
            }
            Ok(_) => None,
            Err(e) => {
                warn!("读取任务 {} 状态失败: {}", reference, e);
                None
            }
        };

        if timed_out {
            DriverError::Timeout {
                operation: self.operation.to_string(),
                after: options.timeout,
                result,
            }
        } else {
            DriverError::Cancelled {
                operation: self.operation.to_string(),
                result,
            }
        }
    }
}
