use crate::driver::Driver;
use crate::error::Result;
use crate::models::ManagedObjectRef;

/// 数据存储
#[derive(Clone)]
pub struct Datastore {
    driver: Driver,
    reference: ManagedObjectRef,
}

impl Datastore {
    pub(crate) fn new(driver: Driver, reference: ManagedObjectRef) -> Self {
        Self { driver, reference }
    }

    pub fn reference(&self) -> &ManagedObjectRef {
        &self.reference
    }

    pub async fn name(&self) -> Result<String> {
        self.driver.name_of(&self.reference).await
    }
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Datastore").field(&self.reference).finish()
    }
}
