//! vCenter 对象模型
//!
//! 与管理端交换的数据结构。字段命名遵循 vSphere API 的 camelCase 约定，
//! 通过 serde 重命名映射到 Rust 风格字段。

pub mod property;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use property::{VmInfo, VmProperty};

/// 远程对象引用（类型 + ID），如 `VirtualMachine:vm-42`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagedObjectRef {
    #[serde(rename = "type")]
    pub kind: ObjectType,
    pub value: String,
}

impl ManagedObjectRef {
    pub fn new(kind: ObjectType, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

impl fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// 远程对象类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Folder,
    Datacenter,
    ComputeResource,
    ClusterComputeResource,
    HostSystem,
    ResourcePool,
    Datastore,
    Network,
    VirtualMachine,
    VirtualMachineSnapshot,
    Task,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Folder => "Folder",
            Self::Datacenter => "Datacenter",
            Self::ComputeResource => "ComputeResource",
            Self::ClusterComputeResource => "ClusterComputeResource",
            Self::HostSystem => "HostSystem",
            Self::ResourcePool => "ResourcePool",
            Self::Datastore => "Datastore",
            Self::Network => "Network",
            Self::VirtualMachine => "VirtualMachine",
            Self::VirtualMachineSnapshot => "VirtualMachineSnapshot",
            Self::Task => "Task",
        }
    }

    /// 是否为计算资源（独立主机或集群）
    pub fn is_compute_resource(&self) -> bool {
        matches!(self, Self::ComputeResource | Self::ClusterComputeResource)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 服务根信息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceContent {
    pub root_folder: ManagedObjectRef,
    pub about: AboutInfo,
}

/// 管理端版本信息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AboutInfo {
    pub name: String,
    pub version: String,
    pub api_type: String,
}

/// 清单中的子对象（引用 + 名称）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub reference: ManagedObjectRef,
    pub name: String,
}

// ============================================
// 电源与任务
// ============================================

/// 虚拟机电源状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

/// 远程任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// 远程任务信息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub task: ManagedObjectRef,

    /// 方法名，如 `CloneVM_Task`
    pub description_id: String,

    pub state: TaskState,

    /// 成功时的返回对象（克隆得到的新虚拟机等）
    #[serde(default)]
    pub result: Option<ManagedObjectRef>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub cancelable: bool,

    #[serde(default)]
    pub progress: Option<u8>,
}

// ============================================
// 硬件配置
// ============================================

/// 构建时要应用的硬件配置
///
/// 所有字段都是可选的，未设置的字段保持源虚拟机的值。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareSpec {
    /// CPU 插槽数
    pub cpus: Option<i32>,

    /// CPU 预留 (MHz)
    pub cpu_reservation: Option<i64>,

    /// CPU 上限 (MHz)
    pub cpu_limit: Option<i64>,

    /// 内存大小 (MB)
    pub ram: Option<i64>,

    /// 内存预留 (MB)
    pub ram_reservation: Option<i64>,

    /// 预留全部内存
    #[serde(default)]
    pub ram_reserve_all: bool,
}

impl HardwareSpec {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// 转换为 `ReconfigVM_Task` 使用的配置规格
    pub fn to_config_spec(&self) -> VirtualMachineConfigSpec {
        let cpu_allocation = (self.cpu_reservation.is_some() || self.cpu_limit.is_some()).then(|| {
            ResourceAllocationInfo {
                reservation: self.cpu_reservation,
                limit: self.cpu_limit,
                ..Default::default()
            }
        });

        let memory_allocation = self.ram_reservation.map(|reservation| ResourceAllocationInfo {
            reservation: Some(reservation),
            ..Default::default()
        });

        VirtualMachineConfigSpec {
            num_cpus: self.cpus,
            memory_mb: self.ram,
            cpu_allocation,
            memory_allocation,
            memory_reservation_locked_to_max: self.ram_reserve_all.then_some(true),
        }
    }
}

/// 资源分配（预留 / 上限）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAllocationInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation: Option<i64>,

    /// -1 表示不限制
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expandable_reservation: Option<bool>,
}

/// 虚拟机重配置规格
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineConfigSpec {
    #[serde(rename = "numCPUs", default, skip_serializing_if = "Option::is_none")]
    pub num_cpus: Option<i32>,

    #[serde(rename = "memoryMB", default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_allocation: Option<ResourceAllocationInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_allocation: Option<ResourceAllocationInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_reservation_locked_to_max: Option<bool>,
}

/// 资源池创建规格
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfigSpec {
    pub cpu_allocation: ResourceAllocationInfo,
    pub memory_allocation: ResourceAllocationInfo,
}

impl Default for ResourceConfigSpec {
    /// 可扩展预留、无上限
    fn default() -> Self {
        let allocation = ResourceAllocationInfo {
            reservation: Some(0),
            limit: Some(-1),
            expandable_reservation: Some(true),
        };
        Self {
            cpu_allocation: allocation.clone(),
            memory_allocation: allocation,
        }
    }
}

// ============================================
// 克隆与快照
// ============================================

/// 磁盘迁移策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiskMoveType {
    /// 完整复制全部磁盘（完整克隆）
    MoveAllDiskBackingsAndDisallowSharing,
    /// 仅迁移最末级增量盘，共享父盘（链接克隆）
    MoveChildMostDiskBacking,
}

impl DiskMoveType {
    /// 是否与源虚拟机共享父盘
    pub fn is_linked(&self) -> bool {
        !matches!(self, Self::MoveAllDiskBackingsAndDisallowSharing)
    }
}

/// 放置位置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelocateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<ManagedObjectRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<ManagedObjectRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<ManagedObjectRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_move_type: Option<DiskMoveType>,
}

/// 克隆规格
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneSpec {
    pub location: RelocateSpec,

    /// 链接克隆所依赖的快照
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<ManagedObjectRef>,

    #[serde(default)]
    pub template: bool,

    #[serde(default)]
    pub power_on: bool,
}

/// 快照请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub name: String,
    pub description: String,

    /// 包含内存状态
    #[serde(default)]
    pub memory: bool,

    /// 静默文件系统
    #[serde(default)]
    pub quiesce: bool,
}

impl SnapshotRequest {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            memory: false,
            quiesce: false,
        }
    }
}

// ============================================
// 远程方法调用
// ============================================

/// 对远程对象发起的方法调用
///
/// 以 `_Task` 结尾的方法返回任务引用，其余方法同步返回结果。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args")]
pub enum MethodCall {
    CreateFolder {
        name: String,
    },
    CreateResourcePool {
        name: String,
        spec: ResourceConfigSpec,
    },
    #[serde(rename = "CloneVM_Task")]
    CloneVmTask {
        folder: ManagedObjectRef,
        name: String,
        spec: CloneSpec,
    },
    #[serde(rename = "ReconfigVM_Task")]
    ReconfigVmTask { spec: VirtualMachineConfigSpec },
    #[serde(rename = "CreateSnapshot_Task")]
    CreateSnapshotTask(SnapshotRequest),
    MarkAsTemplate,
    #[serde(rename = "PowerOnVM_Task")]
    PowerOnVmTask,
    #[serde(rename = "PowerOffVM_Task")]
    PowerOffVmTask,
    #[serde(rename = "Destroy_Task")]
    DestroyTask,
}

impl MethodCall {
    /// vSphere 方法名
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateFolder { .. } => "CreateFolder",
            Self::CreateResourcePool { .. } => "CreateResourcePool",
            Self::CloneVmTask { .. } => "CloneVM_Task",
            Self::ReconfigVmTask { .. } => "ReconfigVM_Task",
            Self::CreateSnapshotTask(_) => "CreateSnapshot_Task",
            Self::MarkAsTemplate => "MarkAsTemplate",
            Self::PowerOnVmTask => "PowerOnVM_Task",
            Self::PowerOffVmTask => "PowerOffVM_Task",
            Self::DestroyTask => "Destroy_Task",
        }
    }

    /// 是否返回远程任务
    pub fn is_task(&self) -> bool {
        self.name().ends_with("_Task")
    }
}
