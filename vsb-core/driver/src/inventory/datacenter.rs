use serde::Deserialize;

use super::{lookup_path, InventoryPath};
use crate::driver::Driver;
use crate::error::{DriverError, Result};
use crate::models::{ManagedObjectRef, ObjectType};

/// 数据中心及其四个根文件夹
#[derive(Debug, Clone)]
pub struct Datacenter {
    reference: ManagedObjectRef,
    name: String,
    vm_folder: ManagedObjectRef,
    host_folder: ManagedObjectRef,
    datastore_folder: ManagedObjectRef,
    network_folder: ManagedObjectRef,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatacenterProps {
    name: String,
    vm_folder: ManagedObjectRef,
    host_folder: ManagedObjectRef,
    datastore_folder: ManagedObjectRef,
    network_folder: ManagedObjectRef,
}

impl Datacenter {
    /// 按根文件夹下的路径解析，空路径要求只有一个数据中心
    pub(crate) async fn resolve(driver: &Driver, path: &str) -> Result<Self> {
        let path = InventoryPath::parse(path);
        let root = driver.root_folder().clone();

        let reference = if path.is_empty() {
            let mut found = Vec::new();
            let mut stack = vec![root];
            while let Some(folder) = stack.pop() {
                for child in driver.list(&folder, "childEntity").await? {
                    match child.reference.kind {
                        ObjectType::Datacenter => found.push(child.reference),
                        ObjectType::Folder => stack.push(child.reference),
                        _ => {}
                    }
                }
            }
            match found.len() {
                0 => return Err(DriverError::not_found(ObjectType::Datacenter, "")),
                1 => found.remove(0),
                count => return Err(DriverError::ambiguous(ObjectType::Datacenter, "", count)),
            }
        } else {
            lookup_path(driver, &root, &path, ObjectType::Datacenter).await?
        };

        let props: DatacenterProps = driver
            .properties(
                &reference,
                &["name", "vmFolder", "hostFolder", "datastoreFolder", "networkFolder"],
            )
            .await?;

        Ok(Self {
            reference,
            name: props.name,
            vm_folder: props.vm_folder,
            host_folder: props.host_folder,
            datastore_folder: props.datastore_folder,
            network_folder: props.network_folder,
        })
    }

    pub fn reference(&self) -> &ManagedObjectRef {
        &self.reference
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vm_folder(&self) -> &ManagedObjectRef {
        &self.vm_folder
    }

    pub fn host_folder(&self) -> &ManagedObjectRef {
        &self.host_folder
    }

    pub fn datastore_folder(&self) -> &ManagedObjectRef {
        &self.datastore_folder
    }

    pub fn network_folder(&self) -> &ManagedObjectRef {
        &self.network_folder
    }
}
