use crate::driver::Driver;
use crate::error::Result;
use crate::models::{ManagedObjectRef, ObjectSummary, ObjectType};

/// 清单文件夹
#[derive(Clone)]
pub struct Folder {
    driver: Driver,
    reference: ManagedObjectRef,
}

impl Folder {
    pub(crate) fn new(driver: Driver, reference: ManagedObjectRef) -> Self {
        Self { driver, reference }
    }

    pub fn reference(&self) -> &ManagedObjectRef {
        &self.reference
    }

    pub async fn name(&self) -> Result<String> {
        self.driver.name_of(&self.reference).await
    }

    /// 直接子对象
    pub async fn children(&self) -> Result<Vec<ObjectSummary>> {
        self.driver.list(&self.reference, "childEntity").await
    }

    /// 相对于所属数据中心根文件夹的路径，根文件夹本身为空字符串
    pub async fn path(&self) -> Result<String> {
        let mut segments = Vec::new();
        let mut current = self.reference.clone();

        loop {
            let parent = self.driver.parent_of(&current).await?;
            match parent {
                Some(parent) if parent.kind == ObjectType::Folder => {
                    segments.push(self.driver.name_of(&current).await?);
                    current = parent;
                }
                _ => break,
            }
        }

        segments.reverse();
        Ok(segments.join("/"))
    }
}

impl std::fmt::Debug for Folder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Folder").field(&self.reference).finish()
    }
}
