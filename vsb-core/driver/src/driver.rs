//! vCenter 会话
//!
//! [`Driver`] 持有已认证的管理端会话，可廉价克隆并在并发构建之间共享。
//! 所有克隆共用同一个会话，任一克隆调用 [`Driver::logout`] 都会结束它。
//! 所有清单对象句柄都从这里派生。

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::backend::{Backend, PropertyMap};
use crate::client::HttpBackend;
use crate::config::ConnectConfig;
use crate::error::{ConnectionFailure, DriverError, QueryError, Result};
use crate::inventory::{Datastore, Folder, Host, Inventory, Network, ResourcePool};
use crate::models::{AboutInfo, ManagedObjectRef, MethodCall, ObjectSummary, ObjectType};
use crate::task::Task;
use crate::vm::VirtualMachine;

/// vCenter 会话句柄
#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

struct DriverInner {
    backend: Arc<dyn Backend>,
    endpoint: String,
    root_folder: ManagedObjectRef,
    about: AboutInfo,
}

impl Driver {
    /// 通过 HTTPS 连接管理端
    pub async fn connect(config: &ConnectConfig) -> Result<Self> {
        let backend = HttpBackend::new(config)?;
        Self::with_backend(Arc::new(backend), config).await
    }

    /// 在给定协议实现上建立会话
    pub async fn with_backend(backend: Arc<dyn Backend>, config: &ConnectConfig) -> Result<Self> {
        info!("连接 vCenter: {} (insecure={})", config.endpoint, config.insecure);

        let connection_error = |err: DriverError| match err {
            DriverError::Connection { .. } => err,
            other => DriverError::Connection {
                endpoint: config.endpoint.clone(),
                source: ConnectionFailure::Unreachable(other.to_string()),
            },
        };

        backend
            .login(&config.username, &config.password)
            .await
            .map_err(connection_error)?;

        let content = backend.service_content().await.map_err(connection_error)?;

        info!(
            "已连接 {} {} ({})",
            content.about.name, content.about.version, content.about.api_type
        );

        Ok(Self {
            inner: Arc::new(DriverInner {
                backend,
                endpoint: config.endpoint.clone(),
                root_folder: content.root_folder,
                about: content.about,
            }),
        })
    }

    /// 释放会话
    pub async fn logout(&self) -> Result<()> {
        info!("断开 vCenter: {}", self.inner.endpoint);
        self.inner.backend.logout().await
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn about(&self) -> &AboutInfo {
        &self.inner.about
    }

    pub fn root_folder(&self) -> &ManagedObjectRef {
        &self.inner.root_folder
    }

    /// 打开数据中心清单，空路径表示唯一的数据中心
    pub async fn inventory(&self, datacenter: &str) -> Result<Inventory> {
        Inventory::open(self.clone(), datacenter).await
    }

    // ============================================
    // 对象句柄
    // ============================================

    pub fn vm(&self, reference: ManagedObjectRef) -> VirtualMachine {
        VirtualMachine::new(self.clone(), reference)
    }

    pub fn folder(&self, reference: ManagedObjectRef) -> Folder {
        Folder::new(self.clone(), reference)
    }

    pub fn resource_pool(&self, reference: ManagedObjectRef) -> ResourcePool {
        ResourcePool::new(self.clone(), reference)
    }

    pub fn datastore(&self, reference: ManagedObjectRef) -> Datastore {
        Datastore::new(self.clone(), reference)
    }

    pub fn host(&self, reference: ManagedObjectRef) -> Host {
        Host::new(self.clone(), reference)
    }

    pub fn network(&self, reference: ManagedObjectRef) -> Network {
        Network::new(self.clone(), reference)
    }

    // ============================================
    // 底层调用
    // ============================================

    /// 读取原始属性
    pub(crate) async fn retrieve(
        &self,
        obj: &ManagedObjectRef,
        properties: &[&str],
    ) -> Result<PropertyMap> {
        debug!("读取属性: {} {:?}", obj, properties);
        self.inner.backend.retrieve_properties(obj, properties).await
    }

    /// 读取属性并反序列化为具体类型
    pub(crate) async fn properties<T: DeserializeOwned>(
        &self,
        obj: &ManagedObjectRef,
        properties: &[&str],
    ) -> Result<T> {
        let map = self.retrieve(obj, properties).await?;
        decode_properties(map, properties)
    }

    /// 对象名称
    pub(crate) async fn name_of(&self, obj: &ManagedObjectRef) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct Named {
            name: String,
        }
        let named: Named = self.properties(obj, &["name"]).await?;
        Ok(named.name)
    }

    /// 父对象
    pub(crate) async fn parent_of(&self, obj: &ManagedObjectRef) -> Result<Option<ManagedObjectRef>> {
        #[derive(serde::Deserialize)]
        struct Parented {
            parent: Option<ManagedObjectRef>,
        }
        let parented: Parented = self.properties(obj, &["parent"]).await?;
        Ok(parented.parent)
    }

    /// 列出引用列表属性中的对象及其名称
    pub(crate) async fn list(
        &self,
        obj: &ManagedObjectRef,
        property: &str,
    ) -> Result<Vec<ObjectSummary>> {
        let map = self.retrieve(obj, &[property]).await?;
        let references: Vec<ManagedObjectRef> = match map.get(property) {
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                QueryError::Unreadable {
                    property: property.to_string(),
                    reason: e.to_string(),
                }
            })?,
        };

        let mut summaries = Vec::with_capacity(references.len());
        for reference in references {
            let name = self.name_of(&reference).await?;
            summaries.push(ObjectSummary { reference, name });
        }
        Ok(summaries)
    }

    /// 在容器中按名称查找唯一子对象
    pub(crate) async fn child_named(
        &self,
        container: &ManagedObjectRef,
        property: &str,
        kinds: &[ObjectType],
        name: &str,
        path: &str,
    ) -> Result<Option<ManagedObjectRef>> {
        let mut matches: Vec<ManagedObjectRef> = self
            .list(container, property)
            .await?
            .into_iter()
            .filter(|child| kinds.contains(&child.reference.kind) && child.name == name)
            .map(|child| child.reference)
            .collect();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            count => Err(DriverError::ambiguous(kinds[0], path, count)),
        }
    }

    /// 调用同步方法
    pub(crate) async fn invoke(
        &self,
        obj: &ManagedObjectRef,
        call: MethodCall,
    ) -> Result<Option<ManagedObjectRef>> {
        info!("调用 {} -> {}", call.name(), obj);
        self.inner.backend.invoke(obj, &call).await
    }

    /// 调用 `_Task` 方法并返回任务句柄
    pub(crate) async fn invoke_task(&self, obj: &ManagedObjectRef, call: MethodCall) -> Result<Task> {
        let operation = call.name();
        let reference = self.invoke(obj, call).await?.ok_or_else(|| DriverError::Task {
            operation: operation.to_string(),
            message: "管理端未返回任务引用".to_string(),
        })?;
        Ok(Task::new(self.clone(), operation, reference))
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }
}

/// 将属性映射反序列化为结构体，失败归为不可读属性
pub(crate) fn decode_properties<T: DeserializeOwned>(
    map: PropertyMap,
    properties: &[&str],
) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(map)).map_err(|e| {
        QueryError::Unreadable {
            property: properties.join(","),
            reason: e.to_string(),
        }
        .into()
    })
}
