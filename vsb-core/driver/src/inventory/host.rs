use serde::Deserialize;

use crate::driver::Driver;
use crate::error::{DriverError, Result};
use crate::models::{ManagedObjectRef, ObjectType};

/// ESXi 主机
#[derive(Clone)]
pub struct Host {
    driver: Driver,
    reference: ManagedObjectRef,
}

#[derive(Deserialize)]
struct MountedDatastores {
    #[serde(default)]
    datastore: Vec<ManagedObjectRef>,
}

impl Host {
    pub(crate) fn new(driver: Driver, reference: ManagedObjectRef) -> Self {
        Self { driver, reference }
    }

    pub fn reference(&self) -> &ManagedObjectRef {
        &self.reference
    }

    pub async fn name(&self) -> Result<String> {
        self.driver.name_of(&self.reference).await
    }

    /// 主机上挂载的数据存储
    pub async fn datastores(&self) -> Result<Vec<ManagedObjectRef>> {
        let mounted: MountedDatastores = self
            .driver
            .properties(&self.reference, &["datastore"])
            .await?;
        Ok(mounted.datastore)
    }

    /// 所属计算资源（独立主机或集群）
    pub async fn compute_resource(&self) -> Result<ManagedObjectRef> {
        match self.driver.parent_of(&self.reference).await? {
            Some(parent) if parent.kind.is_compute_resource() => Ok(parent),
            _ => Err(DriverError::not_found(
                ObjectType::ComputeResource,
                self.reference.to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Host").field(&self.reference).finish()
    }
}
