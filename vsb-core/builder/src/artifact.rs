//! 构建产物

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vsb_driver::{Driver, ManagedObjectRef, VirtualMachine, WaitOptions};

/// 构建器标识
pub const BUILDER_ID: &str = "vsb.vsphere-clone";

/// 构建成功后留下的虚拟机
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    name: String,
    id: ManagedObjectRef,
}

impl Artifact {
    pub fn new(name: &str, id: ManagedObjectRef) -> Self {
        Self {
            name: name.to_string(),
            id,
        }
    }

    pub fn id(&self) -> &ManagedObjectRef {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn builder_id(&self) -> &'static str {
        BUILDER_ID
    }

    /// 删除产物对应的虚拟机
    pub async fn destroy(&self, driver: &Driver, options: &WaitOptions) -> vsb_driver::Result<()> {
        info!("删除产物: {}", self);
        teardown(&driver.vm(self.id.clone()), options).await
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// 关机后删除虚拟机
pub(crate) async fn teardown(vm: &VirtualMachine, options: &WaitOptions) -> vsb_driver::Result<()> {
    // 模板没有电源状态可切换
    if !vm.is_template().await? {
        if let Err(e) = vm.power_off().await?.wait(options).await {
            warn!("关机失败，继续删除 {}: {}", vm.reference(), e);
        }
    }
    vm.destroy().await?.wait(options).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsb_driver::ObjectType;

    #[test]
    fn test_artifact_accessors() {
        let artifact = Artifact::new("test-1", ManagedObjectRef::new(ObjectType::VirtualMachine, "vm-7"));
        assert_eq!(artifact.name(), "test-1");
        assert_eq!(artifact.id().value, "vm-7");
        assert_eq!(artifact.builder_id(), BUILDER_ID);
        assert_eq!(artifact.to_string(), "test-1 (VirtualMachine:vm-7)");
    }

    #[test]
    fn test_artifact_json() {
        let artifact = Artifact::new("test-1", ManagedObjectRef::new(ObjectType::VirtualMachine, "vm-7"));
        let json = serde_json::to_string(&artifact).unwrap();
        assert_eq!(
            json,
            r#"{"name":"test-1","id":{"type":"VirtualMachine","value":"vm-7"}}"#
        );
        let back: Artifact = serde_json::from_str(&json).unwrap();
        assert_eq!(back, artifact);
    }
}
