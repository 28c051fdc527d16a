//! 清单路径解析
//!
//! 把斜杠分隔的路径解析为远程对象引用。路径相对于数据中心下对应的根文件夹
//! （虚拟机、主机、存储、网络），同一层出现多个同名对象时视为歧义错误。
//!
//! 文件夹和资源池的解析会自动创建缺失的层级：创建前先重新查找，
//! 遇到并发创建导致的 `DuplicateName` 时改为重新查找而不是失败。

mod datacenter;
mod datastore;
mod folder;
mod host;
mod network;
mod resource_pool;

use std::fmt;
use std::str::FromStr;

use tracing::{debug, info, warn};

pub use datacenter::Datacenter;
pub use datastore::Datastore;
pub use folder::Folder;
pub use host::Host;
pub use network::Network;
pub use resource_pool::ResourcePool;

use crate::driver::Driver;
use crate::error::{DriverError, Result};
use crate::models::{ManagedObjectRef, MethodCall, ObjectSummary, ObjectType, ResourceConfigSpec};
use crate::vm::VirtualMachine;

/// 清单路径
///
/// 首尾及重复的斜杠都会被忽略，空路径表示根对象或默认对象。
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct InventoryPath {
    segments: Vec<String>,
}

impl InventoryPath {
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// 最后一段
    pub fn leaf(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// 去掉最后一段
    pub fn parent(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    /// 前 `n` 段
    pub fn prefix(&self, n: usize) -> Self {
        Self {
            segments: self.segments.iter().take(n).cloned().collect(),
        }
    }

    pub fn join(&self, name: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Self { segments }
    }
}

impl fmt::Display for InventoryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl FromStr for InventoryPath {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for InventoryPath {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

/// 数据中心清单
#[derive(Clone)]
pub struct Inventory {
    driver: Driver,
    datacenter: Datacenter,
}

impl Inventory {
    pub(crate) async fn open(driver: Driver, path: &str) -> Result<Self> {
        let datacenter = Datacenter::resolve(&driver, path).await?;
        info!("使用数据中心: {}", datacenter.name());
        Ok(Self { driver, datacenter })
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn datacenter(&self) -> &Datacenter {
        &self.datacenter
    }

    /// 虚拟机根文件夹
    pub fn vm_folder(&self) -> Folder {
        self.driver.folder(self.datacenter.vm_folder().clone())
    }

    // ============================================
    // 文件夹
    // ============================================

    /// 解析虚拟机文件夹，缺失的层级会被创建
    pub async fn resolve_folder(&self, path: &str) -> Result<Folder> {
        let path = InventoryPath::parse(path);
        let mut current = self.datacenter.vm_folder().clone();

        for (depth, segment) in path.segments().iter().enumerate() {
            let so_far = path.prefix(depth + 1).to_string();
            let existing = self
                .driver
                .child_named(&current, "childEntity", &[ObjectType::Folder], segment, &so_far)
                .await?;

            current = match existing {
                Some(folder) => folder,
                None => {
                    let call = MethodCall::CreateFolder {
                        name: segment.clone(),
                    };
                    self.create_or_reresolve(&current, call, "childEntity", ObjectType::Folder, segment, &so_far)
                        .await?
                }
            };
        }

        debug!("文件夹 '{}' -> {}", path, current);
        Ok(self.driver.folder(current))
    }

    /// 查找已存在的虚拟机文件夹
    pub async fn find_folder(&self, path: &str) -> Result<Folder> {
        let path = InventoryPath::parse(path);
        let reference = self
            .lookup(self.datacenter.vm_folder(), &path, ObjectType::Folder)
            .await?;
        Ok(self.driver.folder(reference))
    }

    // ============================================
    // 资源池
    // ============================================

    /// 解析资源池，相对于主机所属计算资源的根资源池；缺失的层级会被创建
    ///
    /// 未给出主机时数据中心下必须只有一个计算资源。
    pub async fn resolve_resource_pool(&self, host: Option<&Host>, path: &str) -> Result<ResourcePool> {
        let compute_resource = match host {
            Some(host) => host.compute_resource().await?,
            None => self.default_compute_resource().await?,
        };

        let mut current = self.root_pool_of(&compute_resource).await?;
        let path = InventoryPath::parse(path);

        for (depth, segment) in path.segments().iter().enumerate() {
            let so_far = path.prefix(depth + 1).to_string();
            let existing = self
                .driver
                .child_named(&current, "resourcePool", &[ObjectType::ResourcePool], segment, &so_far)
                .await?;

            current = match existing {
                Some(pool) => pool,
                None => {
                    let call = MethodCall::CreateResourcePool {
                        name: segment.clone(),
                        spec: ResourceConfigSpec::default(),
                    };
                    self.create_or_reresolve(
                        &current,
                        call,
                        "resourcePool",
                        ObjectType::ResourcePool,
                        segment,
                        &so_far,
                    )
                    .await?
                }
            };
        }

        debug!("资源池 '{}' -> {}", path, current);
        Ok(self.driver.resource_pool(current))
    }

    async fn root_pool_of(&self, compute_resource: &ManagedObjectRef) -> Result<ManagedObjectRef> {
        #[derive(serde::Deserialize)]
        struct Pooled {
            #[serde(rename = "resourcePool")]
            resource_pool: Option<ManagedObjectRef>,
        }

        let pooled: Pooled = self
            .driver
            .properties(compute_resource, &["resourcePool"])
            .await?;
        pooled
            .resource_pool
            .ok_or_else(|| DriverError::not_found(ObjectType::ResourcePool, compute_resource.to_string()))
    }

    async fn default_compute_resource(&self) -> Result<ManagedObjectRef> {
        let resources = self
            .collect(self.datacenter.host_folder(), |kind| kind.is_compute_resource())
            .await?;
        match resources.as_slice() {
            [] => Err(DriverError::not_found(ObjectType::ComputeResource, "")),
            [(summary, _)] => Ok(summary.reference.clone()),
            many => Err(DriverError::ambiguous(
                ObjectType::ComputeResource,
                "",
                many.len(),
            )),
        }
    }

    /// 创建子对象，并发创建冲突时重新查找
    async fn create_or_reresolve(
        &self,
        parent: &ManagedObjectRef,
        call: MethodCall,
        property: &str,
        kind: ObjectType,
        name: &str,
        path: &str,
    ) -> Result<ManagedObjectRef> {
        info!("创建 {} '{}'", kind, path);
        match self.driver.invoke(parent, call).await {
            Ok(Some(created)) => Ok(created),
            Ok(None) | Err(DriverError::DuplicateName(_)) => {
                warn!("{} '{}' 已被并发创建，重新查找", kind, path);
                self.driver
                    .child_named(parent, property, &[kind], name, path)
                    .await?
                    .ok_or_else(|| DriverError::not_found(kind, path))
            }
            Err(e) => Err(e),
        }
    }

    // ============================================
    // 存储、主机、网络
    // ============================================

    /// 解析数据存储
    ///
    /// 指定路径时按路径查找；否则使用主机上唯一挂载的数据存储，
    /// 没有主机时要求数据中心内只有一个数据存储。
    pub async fn resolve_datastore(&self, path: &str, host: Option<&Host>) -> Result<Datastore> {
        let path = InventoryPath::parse(path);
        if !path.is_empty() {
            let reference = self
                .lookup(self.datacenter.datastore_folder(), &path, ObjectType::Datastore)
                .await?;
            return Ok(self.driver.datastore(reference));
        }

        let (candidates, hint) = match host {
            Some(host) => (host.datastores().await?, host.name().await?),
            None => {
                let all = self
                    .collect(self.datacenter.datastore_folder(), |kind| {
                        kind == ObjectType::Datastore
                    })
                    .await?;
                (all.into_iter().map(|(s, _)| s.reference).collect(), String::new())
            }
        };

        match candidates.len() {
            0 => Err(DriverError::not_found(ObjectType::Datastore, hint)),
            1 => Ok(self.driver.datastore(candidates[0].clone())),
            count => Err(DriverError::ambiguous(ObjectType::Datastore, hint, count)),
        }
    }

    /// 解析主机
    ///
    /// 接受完整路径（含计算资源名）、独立主机的计算资源路径或全局唯一的主机名；
    /// 空路径表示唯一的主机。
    pub async fn resolve_host(&self, path: &str) -> Result<Host> {
        let path = InventoryPath::parse(path);
        let hosts = self
            .collect(self.datacenter.host_folder(), |kind| kind == ObjectType::HostSystem)
            .await?;

        let mut matches: Vec<ManagedObjectRef> = Vec::new();
        for (summary, location) in hosts {
            let full = location.join(&summary.name);
            let matched = path.is_empty()
                || full == path
                || location == path
                || (path.len() == 1 && path.leaf() == Some(summary.name.as_str()));
            if matched && !matches.contains(&summary.reference) {
                matches.push(summary.reference);
            }
        }

        match matches.len() {
            0 => Err(DriverError::not_found(ObjectType::HostSystem, path.to_string())),
            1 => Ok(self.driver.host(matches.remove(0))),
            count => Err(DriverError::ambiguous(ObjectType::HostSystem, path.to_string(), count)),
        }
    }

    /// 按路径解析网络
    pub async fn resolve_network(&self, path: &str) -> Result<Network> {
        let path = InventoryPath::parse(path);
        let reference = self
            .lookup(self.datacenter.network_folder(), &path, ObjectType::Network)
            .await?;
        Ok(self.driver.network(reference))
    }

    // ============================================
    // 虚拟机
    // ============================================

    /// 按文件夹路径 + 名称查找虚拟机，单段名称时在整个虚拟机文件夹树中查找
    pub async fn find_vm(&self, path: &str) -> Result<VirtualMachine> {
        let path = InventoryPath::parse(path);

        if path.len() > 1 {
            let reference = self
                .lookup(self.datacenter.vm_folder(), &path, ObjectType::VirtualMachine)
                .await?;
            return Ok(self.driver.vm(reference));
        }

        let Some(name) = path.leaf() else {
            return Err(DriverError::not_found(ObjectType::VirtualMachine, ""));
        };

        let mut matches: Vec<ManagedObjectRef> = self
            .collect(self.datacenter.vm_folder(), |kind| kind == ObjectType::VirtualMachine)
            .await?
            .into_iter()
            .filter(|(summary, _)| summary.name == name)
            .map(|(summary, _)| summary.reference)
            .collect();

        match matches.len() {
            0 => Err(DriverError::not_found(ObjectType::VirtualMachine, name)),
            1 => Ok(self.driver.vm(matches.remove(0))),
            count => Err(DriverError::ambiguous(ObjectType::VirtualMachine, name, count)),
        }
    }

    // ============================================
    // 遍历
    // ============================================

    /// 沿文件夹逐段查找，最后一段要求为 `leaf` 类型
    async fn lookup(
        &self,
        root: &ManagedObjectRef,
        path: &InventoryPath,
        leaf: ObjectType,
    ) -> Result<ManagedObjectRef> {
        lookup_path(&self.driver, root, path, leaf).await
    }

    /// 深度优先收集文件夹树下满足条件的对象，连同其所在位置
    ///
    /// 计算资源会展开其下的主机。
    async fn collect(
        &self,
        root: &ManagedObjectRef,
        wanted: impl Fn(ObjectType) -> bool,
    ) -> Result<Vec<(ObjectSummary, InventoryPath)>> {
        let mut found = Vec::new();
        let mut stack = vec![(root.clone(), InventoryPath::default())];

        while let Some((container, location)) = stack.pop() {
            let property = if container.kind.is_compute_resource() {
                "host"
            } else {
                "childEntity"
            };

            for child in self.driver.list(&container, property).await? {
                let kind = child.reference.kind;
                let child_location = location.join(&child.name);

                if kind == ObjectType::Folder || kind.is_compute_resource() {
                    stack.push((child.reference.clone(), child_location));
                }
                if wanted(kind) {
                    found.push((child, location.clone()));
                }
            }
        }

        Ok(found)
    }
}

/// 沿 `childEntity` 逐段查找
pub(crate) async fn lookup_path(
    driver: &Driver,
    root: &ManagedObjectRef,
    path: &InventoryPath,
    leaf: ObjectType,
) -> Result<ManagedObjectRef> {
    if path.is_empty() {
        return if root.kind == leaf {
            Ok(root.clone())
        } else {
            Err(DriverError::not_found(leaf, ""))
        };
    }

    let mut current = root.clone();
    for (depth, segment) in path.segments().iter().enumerate() {
        let so_far = path.prefix(depth + 1).to_string();
        let kind = if depth + 1 == path.len() {
            leaf
        } else {
            ObjectType::Folder
        };

        current = driver
            .child_named(&current, "childEntity", &[kind], segment, &so_far)
            .await?
            .ok_or_else(|| DriverError::not_found(kind, so_far.clone()))?;
    }
    Ok(current)
}
