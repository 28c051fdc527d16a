//! 构建流程
//!
//! 固定顺序执行各阶段，任一阶段失败即停止：
//!
//! ```text
//! Connecting -> Resolving -> Cloning -> ConfiguringHardware
//!     -> [AwaitingGuest] -> [Snapshotting] -> [Templatizing] -> Done
//! ```
//!
//! 失败时若已产生虚拟机则关机并删除（只尝试一次），清理结果附在
//! [`BuildFailure`] 上，不会覆盖原始错误。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vsb_driver::{
    Driver, DriverError, ObjectType, SnapshotRequest, VirtualMachine, VmProperty, WaitOptions,
};

use crate::artifact::{teardown, Artifact};
use crate::clone::{clone_vm, verify_single_datastore, ClonePlacement};
use crate::config::BuilderConfig;
use crate::connector::{Connector, HttpConnector};
use crate::error::{BuildError, BuildFailure, Cleanup, CloneError, ConfigError};
use crate::hook::{GuestEndpoint, GuestHook, NoopGuestHook};
use crate::report::{BuildReport, Stage, StepReport};

/// 构建完成后创建的快照名
pub const BUILD_SNAPSHOT: &str = "vsb-build";

/// 构建器
pub struct Builder {
    config: BuilderConfig,
    connector: Arc<dyn Connector>,
    hook: Arc<dyn GuestHook>,
    cancel: CancellationToken,
}

/// 阶段之间传递的状态
#[derive(Default)]
struct BuildContext {
    driver: Option<Driver>,
    source: Option<VirtualMachine>,
    placement: Option<ClonePlacement>,
    vm: Option<VirtualMachine>,
}

impl Builder {
    /// 校验配置并创建构建器
    pub fn new(config: BuilderConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            connector: Arc::new(HttpConnector),
            hook: Arc::new(NoopGuestHook),
            cancel: CancellationToken::new(),
        })
    }

    /// 设置会话来源
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// 设置客户机钩子
    pub fn with_guest_hook(mut self, hook: Arc<dyn GuestHook>) -> Self {
        self.hook = hook;
        self
    }

    /// 使用外部取消令牌
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// 执行构建
    pub async fn run(&self) -> BuildOutcome {
        let start_time = Instant::now();
        let mut report = BuildReport::new(&self.config.vm_name);
        let mut ctx = BuildContext::default();
        let options = self.config.wait_options(Some(self.cancel.clone()));

        info!(
            "开始构建: '{}' (源: '{}', {})",
            self.config.vm_name,
            self.config.template,
            if self.config.linked_clone { "linked" } else { "full" }
        );

        let mut failure: Option<(Stage, BuildError)> = None;

        for (index, stage) in Stage::PIPELINE.into_iter().enumerate() {
            if !self.enabled(stage) {
                debug!("跳过阶段: {}", stage);
                report.add_step(StepReport::skipped(index, stage));
                continue;
            }

            let step_start = Instant::now();
            let result = if self.cancel.is_cancelled() {
                Err(BuildError::Cancelled(DriverError::Cancelled {
                    operation: stage.to_string(),
                    result: None,
                }))
            } else {
                info!("阶段: {}", stage);
                self.execute(stage, &mut ctx, &options).await
            };
            let duration_ms = elapsed_ms(step_start);

            match result {
                Ok(()) => {
                    report.add_step(StepReport::success(index, stage).with_duration(duration_ms));
                }
                Err(e) => {
                    error!("阶段 {} 失败: {}", stage, e);
                    report.add_step(
                        StepReport::failed(index, stage, &e.to_string()).with_duration(duration_ms),
                    );
                    failure = Some((stage, e));
                    break;
                }
            }
        }

        let result = match failure {
            Some((stage, error)) => {
                let cleanup = self.cleanup(&ctx).await;
                Err(BuildFailure {
                    stage,
                    error,
                    cleanup,
                })
            }
            None => match &ctx.vm {
                Some(vm) => Ok(Artifact::new(&self.config.vm_name, vm.reference().clone())),
                None => Err(BuildFailure {
                    stage: Stage::Done,
                    error: BuildError::Configuration(DriverError::InvalidState(
                        "no virtual machine was produced".to_string(),
                    )),
                    cleanup: Cleanup::NotNeeded,
                }),
            },
        };

        if let Some(driver) = &ctx.driver {
            if let Err(e) = self.connector.release(driver).await {
                warn!("释放会话失败: {}", e);
            }
        }

        report.duration_ms = elapsed_ms(start_time);
        match &result {
            Ok(artifact) => {
                report.final_stage = Stage::Done;
                report.artifact = Some(artifact.clone());
                info!("构建完成: {} ({} ms)", artifact, report.duration_ms);
            }
            Err(failure) => {
                report.final_stage = Stage::Failed;
                report.passed = false;
                error!("{}", failure);
            }
        }

        BuildOutcome { result, report }
    }

    fn enabled(&self, stage: Stage) -> bool {
        match stage {
            Stage::AwaitingGuest => self.config.waits_for_guest(),
            Stage::Snapshotting => self.config.create_snapshot,
            Stage::Templatizing => self.config.convert_to_template,
            _ => true,
        }
    }

    async fn execute(
        &self,
        stage: Stage,
        ctx: &mut BuildContext,
        options: &WaitOptions,
    ) -> Result<(), BuildError> {
        let classify = |e| BuildError::classify(stage, e);
        match stage {
            Stage::Connecting => self.connect(ctx).await.map_err(classify),
            Stage::Resolving => self.resolve(ctx).await.map_err(classify),
            Stage::Cloning => self.clone_source(ctx, options).await,
            Stage::ConfiguringHardware => {
                let vm = require(&ctx.vm, "virtual machine").map_err(classify)?;
                let hardware = self.config.hardware_spec();
                async {
                    vm.reconfigure(&hardware).await?.wait(options).await?;
                    Ok::<_, DriverError>(())
                }
                .await
                .map_err(classify)
            }
            Stage::AwaitingGuest => self.await_guest(ctx, options).await,
            Stage::Snapshotting => {
                let vm = require(&ctx.vm, "virtual machine").map_err(classify)?;
                let request = SnapshotRequest::new(BUILD_SNAPSHOT, "created after build");
                async {
                    vm.create_snapshot(&request).await?.wait(options).await?;
                    Ok::<_, DriverError>(())
                }
                .await
                .map_err(classify)
            }
            Stage::Templatizing => {
                let vm = require(&ctx.vm, "virtual machine").map_err(classify)?;
                vm.mark_as_template().await.map_err(classify)
            }
            Stage::Done | Stage::Failed => Ok(()),
        }
    }

    // ============================================
    // 阶段实现
    // ============================================

    async fn connect(&self, ctx: &mut BuildContext) -> vsb_driver::Result<()> {
        let driver = self
            .connector
            .connect(&self.config.to_connect_config())
            .await?;
        info!(
            "已连接 {} ({} {})",
            driver.endpoint(),
            driver.about().name,
            driver.about().version
        );
        ctx.driver = Some(driver);
        Ok(())
    }

    async fn resolve(&self, ctx: &mut BuildContext) -> vsb_driver::Result<()> {
        let driver = require(&ctx.driver, "session")?;
        let inventory = driver.inventory(&self.config.datacenter).await?;

        let source = inventory.find_vm(&self.config.template).await?;
        let host = match self.config.host.as_str() {
            "" => None,
            path => Some(inventory.resolve_host(path).await?),
        };
        let folder = inventory.resolve_folder(&self.config.folder).await?;

        // 未指定主机时资源池取自源虚拟机所在主机的计算资源
        let pool_host = match &host {
            Some(host) => Some(host.clone()),
            None => source
                .info(&[VmProperty::RuntimeHost])
                .await?
                .host
                .map(|reference| driver.host(reference)),
        };
        let pool = inventory
            .resolve_resource_pool(pool_host.as_ref(), &self.config.resource_pool)
            .await?;
        let datastore = match self.config.datastore.as_str() {
            "" => None,
            path => Some(inventory.resolve_datastore(path, host.as_ref()).await?),
        };

        debug!(
            "放置位置: 源 {}, 文件夹 {}, 资源池 {}",
            source.reference(),
            folder.reference(),
            pool.reference()
        );
        ctx.placement = Some(ClonePlacement {
            name: self.config.vm_name.clone(),
            folder,
            pool,
            host,
            datastore,
        });
        ctx.source = Some(source);
        Ok(())
    }

    async fn clone_source(&self, ctx: &mut BuildContext, options: &WaitOptions) -> Result<(), BuildError> {
        let (source, placement) = match (&ctx.source, &ctx.placement) {
            (Some(source), Some(placement)) => (source, placement),
            _ => {
                return Err(BuildError::classify(
                    Stage::Cloning,
                    DriverError::InvalidState("source is not resolved".to_string()),
                ))
            }
        };

        let vm = match clone_vm(source, placement, self.config.linked_clone, options).await {
            Ok(vm) => vm,
            Err(e) => {
                // 不可取消的克隆任务在超时或取消后仍可能产生虚拟机
                if let CloneError::Driver(err) = &e {
                    if let Some(created) = err
                        .task_result()
                        .filter(|r| r.kind == ObjectType::VirtualMachine)
                    {
                        warn!("克隆任务中止后仍产生了 {}，记录以便清理", created);
                        ctx.vm = Some(source.driver().vm(created.clone()));
                    }
                }
                return Err(BuildError::from_clone(e));
            }
        };

        let verified = verify_single_datastore(&vm).await;
        ctx.vm = Some(vm);
        verified.map_err(BuildError::from_clone)
    }

    async fn await_guest(&self, ctx: &BuildContext, options: &WaitOptions) -> Result<(), BuildError> {
        let stage = Stage::AwaitingGuest;
        let vm = require(&ctx.vm, "virtual machine").map_err(|e| BuildError::classify(stage, e))?;

        let ip = async {
            vm.power_on().await?.wait(options).await?;
            vm.wait_for_ip(&options.with_timeout(self.config.ip_wait_timeout()))
                .await
        }
        .await
        .map_err(|e| BuildError::classify(stage, e))?;

        let guest = GuestEndpoint {
            vm: vm.reference().clone(),
            ip,
            username: self.config.ssh_username.clone(),
            password: self.config.ssh_password.clone(),
        };
        info!("客户机就绪: {} ({})", guest.ip, guest.vm);
        self.hook
            .provision(&guest)
            .await
            .map_err(BuildError::GuestHook)?;

        async {
            vm.power_off().await?.wait(options).await?;
            Ok::<_, DriverError>(())
        }
        .await
        .map_err(|e| BuildError::classify(stage, e))
    }

    /// 删除部分构建的虚拟机，不响应取消
    async fn cleanup(&self, ctx: &BuildContext) -> Cleanup {
        let Some(vm) = &ctx.vm else {
            debug!("尚未产生虚拟机，无需清理");
            return Cleanup::NotNeeded;
        };

        warn!("清理部分构建的虚拟机: {}", vm.reference());
        let options = self.config.wait_options(None);
        match teardown(vm, &options).await {
            Ok(()) => {
                info!("已删除: {}", vm.reference());
                Cleanup::Destroyed(vm.reference().clone())
            }
            Err(error) => {
                error!("清理失败，虚拟机 {} 可能残留: {}", vm.reference(), error);
                Cleanup::Failed {
                    vm: vm.reference().clone(),
                    error,
                }
            }
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    millis(start.elapsed())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn require<'a, T>(value: &'a Option<T>, what: &str) -> vsb_driver::Result<&'a T> {
    value
        .as_ref()
        .ok_or_else(|| DriverError::InvalidState(format!("{} is not available", what)))
}

/// 构建结果与报告
#[derive(Debug)]
pub struct BuildOutcome {
    pub result: Result<Artifact, BuildFailure>,
    pub report: BuildReport,
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// 成功时为一个产物，失败时为空
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.result.iter().cloned().collect()
    }

    pub fn failure(&self) -> Option<&BuildFailure> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<Artifact, BuildFailure> {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
