//! 内存中的 vCenter 模拟器
//!
//! 实现与 [`HttpBackend`](crate::client::HttpBackend) 相同的 [`Backend`] 接口：
//! 清单对象图、磁盘链、带延迟的远程任务，以及故障注入与并发创建冲突注入。
//! 所有行为测试都以它代替真实的管理端。
//!
//! ```no_run
//! # async fn demo() -> vsb_driver::Result<()> {
//! use std::sync::Arc;
//! use vsb_driver::{simulator::Simulator, ConnectConfig, Driver};
//!
//! let sim = Simulator::standard();
//! let config = ConnectConfig::new(Simulator::ENDPOINT, "root", "jetbrains");
//! let driver = Driver::with_backend(Arc::new(sim.session()), &config).await?;
//! let template = driver.inventory("").await?.find_vm("basic").await?;
//! # Ok(())
//! # }
//! ```

mod state;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{Backend, PropertyMap};
use crate::error::{ConnectionFailure, DriverError, Result};
use crate::models::{ManagedObjectRef, MethodCall, ServiceContent, SnapshotRequest, TaskInfo};

use state::{Fault, SimState};

/// 模拟的 vCenter
#[derive(Clone)]
pub struct Simulator {
    state: Arc<Mutex<SimState>>,
}

impl Simulator {
    /// 模拟器的名义地址
    pub const ENDPOINT: &'static str = "vcenter.vsphere55.test";

    /// 空清单
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(username, password))),
        }
    }

    /// 验收环境拓扑
    ///
    /// - 数据中心 `dc1`
    /// - 主机 `esxi-1`（`datastore1`）、`esxi-2`（`datastore2`）、
    ///   `esxi-4`（`datastore4a`、`datastore4b` 两个数据存储）
    /// - 虚拟机 `basic`：位于 `esxi-1`/`datastore1`，已有一个快照，磁盘链两层
    /// - 虚拟机 `ubuntu-host4`：位于 `esxi-4`/`datastore4a`，无快照
    /// - 网络 `VM Network`
    pub fn standard() -> Self {
        let sim = Self::new("root", "jetbrains");
        {
            let mut state = sim.lock();
            let dc = state.add_datacenter("dc1");
            let esxi1 = state.add_host(&dc, "esxi-1", &["datastore1"]);
            state.add_host(&dc, "esxi-2", &["datastore2"]);
            let esxi4 = state.add_host(&dc, "esxi-4", &["datastore4a", "datastore4b"]);
            state.add_network(&dc, "VM Network");

            if let Some(vm_folder) = state.vm_folder(&dc) {
                let datastore1 = state.datastore(&dc, "datastore1");
                let basic = state.add_vm(&vm_folder, "basic", &esxi1, &datastore1);
                let request = SnapshotRequest::new("base", "initial state");
                if let Ok(snapshot) = state.snapshot_now(&basic, &request) {
                    debug!("模拟器快照: {}", snapshot);
                }

                let datastore4 = state.datastore(&dc, "datastore4a");
                state.add_vm(&vm_folder, "ubuntu-host4", &esxi4, &datastore4);
            }
        }
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 新建一个独立会话
    pub fn session(&self) -> SimSession {
        SimSession {
            simulator: self.clone(),
            token: Mutex::new(None),
        }
    }

    // ============================================
    // 拓扑构建
    // ============================================

    pub fn add_datacenter(&self, name: &str) -> ManagedObjectRef {
        self.lock().add_datacenter(name)
    }

    /// 添加独立主机，数据存储按名称复用
    pub fn add_host(&self, datacenter: &ManagedObjectRef, name: &str, datastores: &[&str]) -> ManagedObjectRef {
        self.lock().add_host(datacenter, name, datastores)
    }

    pub fn add_folder(&self, parent: &ManagedObjectRef, name: &str) -> ManagedObjectRef {
        self.lock().add_folder(parent, name)
    }

    pub fn add_network(&self, datacenter: &ManagedObjectRef, name: &str) -> ManagedObjectRef {
        self.lock().add_network(datacenter, name)
    }

    pub fn datastore(&self, datacenter: &ManagedObjectRef, name: &str) -> ManagedObjectRef {
        self.lock().datastore(datacenter, name)
    }

    /// 数据中心的虚拟机根文件夹
    pub fn vm_folder(&self, datacenter: &ManagedObjectRef) -> Option<ManagedObjectRef> {
        self.lock().vm_folder(datacenter)
    }

    /// 添加关机状态、单层磁盘的虚拟机
    pub fn add_vm(
        &self,
        folder: &ManagedObjectRef,
        name: &str,
        host: &ManagedObjectRef,
        datastore: &ManagedObjectRef,
    ) -> ManagedObjectRef {
        self.lock().add_vm(folder, name, host, datastore)
    }

    /// 标记为模板
    pub fn make_template(&self, vm: &ManagedObjectRef) -> Result<()> {
        self.lock().invoke(vm, &MethodCall::MarkAsTemplate).map(|_| ())
    }

    // ============================================
    // 故障注入
    // ============================================

    /// 下一次调用 `method` 失败；任务方法以失败任务的形式返回
    pub fn fail_next(&self, method: &str, message: &str) {
        self.lock()
            .faults
            .entry(method.to_string())
            .or_default()
            .push_back(Fault::Fail(message.to_string()));
    }

    /// 下一次调用 `method` 返回的任务一直运行，直到被取消
    pub fn hang_next(&self, method: &str) {
        self.lock()
            .faults
            .entry(method.to_string())
            .or_default()
            .push_back(Fault::Hang);
    }

    /// 下一次调用 `method` 返回的任务拒绝远程取消，照常完成
    pub fn uncancelable_next(&self, method: &str) {
        self.lock()
            .faults
            .entry(method.to_string())
            .or_default()
            .push_back(Fault::Uncancelable);
    }

    /// 下一次创建名为 `name` 的文件夹或资源池时，模拟另一个创建者抢先完成
    pub fn race_next_create(&self, name: &str) {
        self.lock().races.insert(name.to_string());
    }

    /// 任务在完成前保持运行的轮询次数
    pub fn set_task_latency(&self, polls: u32) {
        self.lock().task_latency = polls;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// 关闭后开机不再上报客户机 IP
    pub fn set_guest_tools(&self, running: bool) {
        self.lock().guest_tools = running;
    }

    // ============================================
    // 检查
    // ============================================

    pub fn exists(&self, reference: &ManagedObjectRef) -> bool {
        self.lock().objects.contains_key(reference)
    }

    /// 名称匹配的虚拟机
    pub fn vms_named(&self, name: &str) -> Vec<ManagedObjectRef> {
        self.lock()
            .objects
            .iter()
            .filter(|(r, o)| r.kind == crate::models::ObjectType::VirtualMachine && o.name == name)
            .map(|(r, _)| r.clone())
            .collect()
    }

    pub fn vm_count(&self) -> usize {
        self.lock()
            .objects
            .keys()
            .filter(|r| r.kind == crate::models::ObjectType::VirtualMachine)
            .count()
    }

    pub fn active_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// 已调用的方法名，按调用顺序
    pub fn invocations(&self) -> Vec<String> {
        self.lock().invocations.clone()
    }
}

/// 模拟器上的一个会话
pub struct SimSession {
    simulator: Simulator,
    token: Mutex<Option<String>>,
}

impl SimSession {
    fn token(&self) -> MutexGuard<'_, Option<String>> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn authenticated(&self) -> Result<MutexGuard<'_, SimState>> {
        let token = self.token().clone();
        let state = self.simulator.lock();
        match token {
            Some(token) if state.sessions.contains(&token) => Ok(state),
            _ => Err(DriverError::NotAuthenticated("no active session".to_string())),
        }
    }
}

#[async_trait]
impl Backend for SimSession {
    async fn login(&self, username: &str, password: &str) -> Result<()> {
        let token = {
            let mut state = self.simulator.lock();
            if !state.reachable {
                return Err(DriverError::Connection {
                    endpoint: Simulator::ENDPOINT.to_string(),
                    source: ConnectionFailure::Unreachable("connection refused".to_string()),
                });
            }
            if state.username != username || state.password != password {
                return Err(DriverError::Connection {
                    endpoint: Simulator::ENDPOINT.to_string(),
                    source: ConnectionFailure::AuthenticationRejected(username.to_string()),
                });
            }

            let token = Uuid::new_v4().to_string();
            state.sessions.insert(token.clone());
            token
        };

        *self.token() = Some(token);
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        let token = self.token().take();
        if let Some(token) = token {
            self.simulator.lock().sessions.remove(&token);
        }
        Ok(())
    }

    async fn service_content(&self) -> Result<ServiceContent> {
        Ok(self.authenticated()?.service_content())
    }

    async fn retrieve_properties(
        &self,
        obj: &ManagedObjectRef,
        properties: &[&str],
    ) -> Result<PropertyMap> {
        self.authenticated()?.retrieve(obj, properties)
    }

    async fn invoke(
        &self,
        obj: &ManagedObjectRef,
        call: &MethodCall,
    ) -> Result<Option<ManagedObjectRef>> {
        self.authenticated()?.invoke(obj, call)
    }

    async fn task_info(&self, task: &ManagedObjectRef) -> Result<TaskInfo> {
        self.authenticated()?.task_info(task)
    }

    async fn cancel_task(&self, task: &ManagedObjectRef) -> Result<()> {
        self.authenticated()?.cancel_task(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ObjectType;

    #[tokio::test]
    async fn test_login_rejects_bad_credentials() {
        let sim = Simulator::standard();
        let session = sim.session();
        let err = session.login("root", "wrong").await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::Connection {
                source: ConnectionFailure::AuthenticationRejected(_),
                ..
            }
        ));
        assert_eq!(sim.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_requests_require_session() {
        let sim = Simulator::standard();
        let session = sim.session();
        let err = session.service_content().await.unwrap_err();
        assert!(matches!(err, DriverError::NotAuthenticated(_)));

        session.login("root", "jetbrains").await.unwrap();
        assert!(session.service_content().await.is_ok());
        assert_eq!(sim.active_sessions(), 1);

        session.logout().await.unwrap();
        assert_eq!(sim.active_sessions(), 0);
        assert!(session.service_content().await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_property_rejected() {
        let sim = Simulator::standard();
        let session = sim.session();
        session.login("root", "jetbrains").await.unwrap();

        let basic = sim.vms_named("basic").remove(0);
        let err = session
            .retrieve_properties(&basic, &["config.bogus"])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::Query(crate::error::QueryError::UnsupportedProperty(_))
        ));
    }

    #[tokio::test]
    async fn test_task_completes_after_latency() {
        let sim = Simulator::standard();
        sim.set_task_latency(2);
        let session = sim.session();
        session.login("root", "jetbrains").await.unwrap();

        let basic = sim.vms_named("basic").remove(0);
        let task = session
            .invoke(&basic, &MethodCall::PowerOnVmTask)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.kind, ObjectType::Task);

        let mut states = Vec::new();
        for _ in 0..3 {
            states.push(session.task_info(&task).await.unwrap().state);
        }
        assert_eq!(
            states,
            vec![
                crate::models::TaskState::Running,
                crate::models::TaskState::Running,
                crate::models::TaskState::Success
            ]
        );
    }

    #[tokio::test]
    async fn test_standard_topology() {
        let sim = Simulator::standard();
        assert_eq!(sim.vm_count(), 2);
        assert_eq!(sim.vms_named("basic").len(), 1);
        assert_eq!(sim.vms_named("ubuntu-host4").len(), 1);
        assert!(sim.invocations().is_empty());
    }
}
