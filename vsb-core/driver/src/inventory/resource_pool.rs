use crate::driver::Driver;
use crate::error::Result;
use crate::models::{ManagedObjectRef, ObjectSummary, ObjectType};

/// 资源池
#[derive(Clone)]
pub struct ResourcePool {
    driver: Driver,
    reference: ManagedObjectRef,
}

impl ResourcePool {
    pub(crate) fn new(driver: Driver, reference: ManagedObjectRef) -> Self {
        Self { driver, reference }
    }

    pub fn reference(&self) -> &ManagedObjectRef {
        &self.reference
    }

    pub async fn name(&self) -> Result<String> {
        self.driver.name_of(&self.reference).await
    }

    /// 子资源池
    pub async fn children(&self) -> Result<Vec<ObjectSummary>> {
        self.driver.list(&self.reference, "resourcePool").await
    }

    /// 相对于计算资源根资源池的路径，根资源池本身为空字符串
    pub async fn path(&self) -> Result<String> {
        let mut segments = Vec::new();
        let mut current = self.reference.clone();

        while let Some(parent) = self.driver.parent_of(&current).await? {
            if parent.kind != ObjectType::ResourcePool {
                break;
            }
            segments.push(self.driver.name_of(&current).await?);
            current = parent;
        }

        segments.reverse();
        Ok(segments.join("/"))
    }
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ResourcePool").field(&self.reference).finish()
    }
}
