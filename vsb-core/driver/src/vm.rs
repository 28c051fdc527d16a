//! 虚拟机句柄
//!
//! 句柄只持有引用与属性缓存，不拥有远程状态；
//! 任何成功的变更任务都会清空缓存。

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::backend::PropertyMap;
use crate::driver::{decode_properties, Driver};
use crate::error::{DriverError, Result};
use crate::models::{
    CloneSpec, HardwareSpec, ManagedObjectRef, MethodCall, PowerState, SnapshotRequest, VmInfo,
    VmProperty,
};
use crate::task::{Task, WaitOptions};

/// 属性缓存（按属性路径）
#[derive(Clone, Default)]
pub(crate) struct PropertyCache {
    inner: Arc<RwLock<PropertyMap>>,
}

impl PropertyCache {
    /// 所有路径都已缓存时返回子集
    async fn lookup(&self, paths: &[&str]) -> Option<PropertyMap> {
        let cached = self.inner.read().await;
        paths
            .iter()
            .map(|path| cached.get(*path).map(|v| (path.to_string(), v.clone())))
            .collect()
    }

    async fn store(&self, map: &PropertyMap) {
        let mut cached = self.inner.write().await;
        for (key, value) in map {
            cached.insert(key.clone(), value.clone());
        }
    }

    pub(crate) async fn clear(&self) {
        self.inner.write().await.clear();
    }
}

/// 虚拟机句柄
#[derive(Clone)]
pub struct VirtualMachine {
    driver: Driver,
    reference: ManagedObjectRef,
    cache: PropertyCache,
}

impl VirtualMachine {
    pub(crate) fn new(driver: Driver, reference: ManagedObjectRef) -> Self {
        Self {
            driver,
            reference,
            cache: PropertyCache::default(),
        }
    }

    pub fn reference(&self) -> &ManagedObjectRef {
        &self.reference
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    // ============================================
    // 属性查询
    // ============================================

    /// 从管理端读取属性
    pub async fn info(&self, properties: &[VmProperty]) -> Result<VmInfo> {
        let paths: Vec<&str> = properties.iter().map(|p| p.path()).collect();
        let map = self.driver.retrieve(&self.reference, &paths).await?;
        self.cache.store(&map).await;
        decode_properties(map, &paths)
    }

    /// 优先使用缓存，任一属性缺失时整体重新读取
    pub async fn cached_info(&self, properties: &[VmProperty]) -> Result<VmInfo> {
        let paths: Vec<&str> = properties.iter().map(|p| p.path()).collect();
        match self.cache.lookup(&paths).await {
            Some(map) => {
                debug!("属性缓存命中: {} {:?}", self.reference, paths);
                decode_properties(map, &paths)
            }
            None => self.info(properties).await,
        }
    }

    pub async fn name(&self) -> Result<String> {
        self.cached_info(&[VmProperty::Name])
            .await?
            .name
            .ok_or_else(|| DriverError::ObjectNotFound(self.reference.clone()))
    }

    pub async fn power_state(&self) -> Result<PowerState> {
        self.info(&[VmProperty::RuntimePowerState])
            .await?
            .power_state
            .ok_or_else(|| DriverError::ObjectNotFound(self.reference.clone()))
    }

    pub async fn is_template(&self) -> Result<bool> {
        Ok(self
            .info(&[VmProperty::ConfigTemplate])
            .await?
            .is_template()
            .unwrap_or(false))
    }

    /// 当前快照
    pub async fn current_snapshot(&self) -> Result<Option<ManagedObjectRef>> {
        let info = self.info(&[VmProperty::Snapshot]).await?;
        Ok(info.current_snapshot().cloned())
    }

    // ============================================
    // 变更操作
    // ============================================

    /// 应用硬件配置，空配置返回空任务
    pub async fn reconfigure(&self, hardware: &HardwareSpec) -> Result<Task> {
        if hardware.is_empty() {
            return Ok(Task::completed(self.driver.clone(), "ReconfigVM_Task"));
        }

        info!("重配置虚拟机 {}: {:?}", self.reference, hardware);
        let call = MethodCall::ReconfigVmTask {
            spec: hardware.to_config_spec(),
        };
        self.mutate(call).await
    }

    /// 克隆到指定文件夹，任务结果为新虚拟机引用
    pub async fn clone_vm(
        &self,
        folder: &ManagedObjectRef,
        name: &str,
        spec: &CloneSpec,
    ) -> Result<Task> {
        info!(
            "克隆虚拟机 {} -> {} ({:?})",
            self.reference, name, spec.location.disk_move_type
        );
        let call = MethodCall::CloneVmTask {
            folder: folder.clone(),
            name: name.to_string(),
            spec: spec.clone(),
        };
        self.driver.invoke_task(&self.reference, call).await
    }

    pub async fn create_snapshot(&self, request: &SnapshotRequest) -> Result<Task> {
        info!("创建快照 {}: {}", self.reference, request.name);
        self.mutate(MethodCall::CreateSnapshotTask(request.clone()))
            .await
    }

    /// 转换为模板，开机状态下拒绝
    pub async fn mark_as_template(&self) -> Result<()> {
        if self.power_state().await? == PowerState::PoweredOn {
            return Err(DriverError::InvalidState(format!(
                "{} is powered on and cannot be marked as template",
                self.reference
            )));
        }

        self.driver
            .invoke(&self.reference, MethodCall::MarkAsTemplate)
            .await?;
        self.cache.clear().await;

        info!("已转换为模板: {}", self.reference);
        Ok(())
    }

    pub async fn power_on(&self) -> Result<Task> {
        if self.power_state().await? == PowerState::PoweredOn {
            return Ok(Task::completed(self.driver.clone(), "PowerOnVM_Task"));
        }
        self.mutate(MethodCall::PowerOnVmTask).await
    }

    pub async fn power_off(&self) -> Result<Task> {
        if self.power_state().await? == PowerState::PoweredOff {
            return Ok(Task::completed(self.driver.clone(), "PowerOffVM_Task"));
        }
        self.mutate(MethodCall::PowerOffVmTask).await
    }

    /// 从清单和磁盘上删除
    pub async fn destroy(&self) -> Result<Task> {
        warn!("删除虚拟机: {}", self.reference);
        self.mutate(MethodCall::DestroyTask).await
    }

    /// 轮询 `guest.ipAddress` 直到客户机上报地址
    pub async fn wait_for_ip(&self, options: &WaitOptions) -> Result<String> {
        info!("等待客户机 IP: {}", self.reference);
        let deadline = Instant::now() + options.timeout;

        loop {
            if let Some(ip) = self.info(&[VmProperty::GuestIpAddress]).await?.ip_address {
                if !ip.is_empty() {
                    info!("客户机 IP: {} ({})", ip, self.reference);
                    return Ok(ip);
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
                    return Err(DriverError::Cancelled {
                        operation: "WaitForIP".to_string(),
                        result: None,
                    });
                }
                _ = sleep_until(deadline) => {
                    return Err(DriverError::Timeout {
                        operation: "WaitForIP".to_string(),
                        after: options.timeout,
                        result: None,
                    });
                }
                _ = sleep(options.poll_interval) => {}
            }
        }
    }

    async fn mutate(&self, call: MethodCall) -> Result<Task> {
        Ok(self
            .driver
            .invoke_task(&self.reference, call)
            .await?
            .invalidates(self.cache.clone()))
    }
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("reference", &self.reference)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_property_cache_lookup() {
        let cache = PropertyCache::default();
        let mut map = PropertyMap::new();
        map.insert("name".to_string(), serde_json::json!("test-1"));
        map.insert("config.template".to_string(), serde_json::Value::Null);
        cache.store(&map).await;

        let hit = cache.lookup(&["name", "config.template"]).await.unwrap();
        assert_eq!(hit.len(), 2);
        assert!(cache.lookup(&["name", "runtime.powerState"]).await.is_none());

        cache.clear().await;
        assert!(cache.lookup(&["name"]).await.is_none());
    }
}
