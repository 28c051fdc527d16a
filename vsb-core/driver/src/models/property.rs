//! 虚拟机属性查询
//!
//! 属性名以枚举表示，查询结果反序列化为 [`VmInfo`]，
//! 只有被请求的字段有值。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{ManagedObjectRef, PowerState, ResourceAllocationInfo};
use crate::error::QueryError;

/// 可查询的虚拟机属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmProperty {
    Name,
    Parent,
    RuntimeHost,
    RuntimePowerState,
    ResourcePool,
    Datastore,
    LayoutExDisk,
    Config,
    ConfigTemplate,
    Snapshot,
    GuestIpAddress,
}

impl VmProperty {
    pub const ALL: [VmProperty; 11] = [
        Self::Name,
        Self::Parent,
        Self::RuntimeHost,
        Self::RuntimePowerState,
        Self::ResourcePool,
        Self::Datastore,
        Self::LayoutExDisk,
        Self::Config,
        Self::ConfigTemplate,
        Self::Snapshot,
        Self::GuestIpAddress,
    ];

    /// vSphere 属性路径
    pub fn path(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Parent => "parent",
            Self::RuntimeHost => "runtime.host",
            Self::RuntimePowerState => "runtime.powerState",
            Self::ResourcePool => "resourcePool",
            Self::Datastore => "datastore",
            Self::LayoutExDisk => "layoutEx.disk",
            Self::Config => "config",
            Self::ConfigTemplate => "config.template",
            Self::Snapshot => "snapshot",
            Self::GuestIpAddress => "guest.ipAddress",
        }
    }
}

impl fmt::Display for VmProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl FromStr for VmProperty {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.path() == s)
            .ok_or_else(|| QueryError::UnsupportedProperty(s.to_string()))
    }
}

/// 虚拟机属性查询结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: Option<String>,

    pub parent: Option<ManagedObjectRef>,

    #[serde(rename = "runtime.host")]
    pub host: Option<ManagedObjectRef>,

    #[serde(rename = "runtime.powerState")]
    pub power_state: Option<PowerState>,

    #[serde(rename = "resourcePool")]
    pub resource_pool: Option<ManagedObjectRef>,

    pub datastore: Option<Vec<ManagedObjectRef>>,

    #[serde(rename = "layoutEx.disk")]
    pub disks: Option<Vec<DiskLayout>>,

    pub config: Option<VmConfigInfo>,

    #[serde(rename = "config.template")]
    pub template: Option<bool>,

    pub snapshot: Option<SnapshotInfo>,

    #[serde(rename = "guest.ipAddress")]
    pub ip_address: Option<String>,
}

impl VmInfo {
    /// 是否为模板（`config.template` 或 `config` 任一被查询即可）
    pub fn is_template(&self) -> Option<bool> {
        self.template
            .or_else(|| self.config.as_ref().map(|c| c.template))
    }

    /// 第一块磁盘的链长度
    pub fn disk_chain_len(&self) -> Option<usize> {
        self.disks
            .as_ref()
            .and_then(|disks| disks.first())
            .map(|disk| disk.chain.len())
    }

    /// 当前快照
    pub fn current_snapshot(&self) -> Option<&ManagedObjectRef> {
        self.snapshot
            .as_ref()
            .and_then(|s| s.current_snapshot.as_ref())
    }
}

/// 虚拟机配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmConfigInfo {
    pub name: String,

    #[serde(default)]
    pub template: bool,

    pub hardware: HardwareInfo,

    #[serde(default)]
    pub cpu_allocation: ResourceAllocationInfo,

    #[serde(default)]
    pub memory_allocation: ResourceAllocationInfo,

    #[serde(default)]
    pub memory_reservation_locked_to_max: bool,
}

/// 虚拟硬件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareInfo {
    #[serde(rename = "numCPU")]
    pub num_cpu: i32,

    #[serde(rename = "memoryMB")]
    pub memory_mb: i64,
}

/// 单块虚拟磁盘的布局
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskLayout {
    pub key: i32,

    /// 从基础盘到最新增量盘
    pub chain: Vec<DiskChainLayer>,
}

/// 磁盘链中的一层
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskChainLayer {
    pub file: String,
    pub datastore: ManagedObjectRef,
}

/// 快照信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    #[serde(default)]
    pub current_snapshot: Option<ManagedObjectRef>,

    #[serde(default)]
    pub root_snapshot_list: Vec<SnapshotTree>,
}

/// 快照树节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotTree {
    pub snapshot: ManagedObjectRef,
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub child_snapshot_list: Vec<SnapshotTree>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ObjectType;

    #[test]
    fn test_property_round_trip_names() {
        for property in VmProperty::ALL {
            assert_eq!(property.path().parse::<VmProperty>().unwrap(), property);
        }
    }

    #[test]
    fn test_unsupported_property() {
        let err = "config.bogus".parse::<VmProperty>().unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedProperty(name) if name == "config.bogus"));
    }

    #[test]
    fn test_vm_info_only_requested_fields() {
        let json = serde_json::json!({
            "name": "test-1",
            "runtime.powerState": "poweredOff",
            "layoutEx.disk": [{
                "key": 2000,
                "chain": [
                    {"file": "[datastore1] test-1/test-1.vmdk", "datastore": {"type": "Datastore", "value": "datastore-11"}}
                ]
            }]
        });

        let info: VmInfo = serde_json::from_value(json).unwrap();
        assert_eq!(info.name.as_deref(), Some("test-1"));
        assert_eq!(info.power_state, Some(PowerState::PoweredOff));
        assert_eq!(info.disk_chain_len(), Some(1));
        assert!(info.config.is_none());
        assert!(info.is_template().is_none());
    }

    #[test]
    fn test_vm_info_template_from_config() {
        let info = VmInfo {
            config: Some(VmConfigInfo {
                template: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(info.is_template(), Some(true));
    }

    #[test]
    fn test_current_snapshot() {
        let snapshot = ManagedObjectRef::new(ObjectType::VirtualMachineSnapshot, "snapshot-7");
        let info = VmInfo {
            snapshot: Some(SnapshotInfo {
                current_snapshot: Some(snapshot.clone()),
                root_snapshot_list: vec![],
            }),
            ..Default::default()
        };
        assert_eq!(info.current_snapshot(), Some(&snapshot));
    }
}
