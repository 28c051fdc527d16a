use crate::driver::Driver;
use crate::error::Result;
use crate::models::ManagedObjectRef;

/// 虚拟机网络
#[derive(Clone)]
pub struct Network {
    driver: Driver,
    reference: ManagedObjectRef,
}

impl Network {
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

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Network").field(&self.reference).finish()
    }
}
