//! 会话建立
//!
//! 构建器通过 [`Connector`] 获取会话，生产环境使用 HTTPS 网关，
//! 测试使用内存模拟器。构建结束时由同一个 [`Connector`] 释放会话，
//! 共享会话的实现不会在单个构建结束时注销。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use vsb_driver::simulator::Simulator;
use vsb_driver::{ConnectConfig, Driver};

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConnectConfig) -> vsb_driver::Result<Driver>;

    /// 构建结束后释放会话，默认注销
    async fn release(&self, driver: &Driver) -> vsb_driver::Result<()> {
        driver.logout().await
    }
}

/// HTTPS JSON 网关
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpConnector;

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, config: &ConnectConfig) -> vsb_driver::Result<Driver> {
        Driver::connect(config).await
    }
}

/// 复用调用方已建立的会话
///
/// 多个并发构建可以共用一个 [`Driver`]，会话由调用方自行注销。
#[derive(Clone)]
pub struct SharedConnector {
    driver: Driver,
}

impl SharedConnector {
    pub fn new(driver: Driver) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }
}

#[async_trait]
impl Connector for SharedConnector {
    async fn connect(&self, _config: &ConnectConfig) -> vsb_driver::Result<Driver> {
        Ok(self.driver.clone())
    }

    async fn release(&self, driver: &Driver) -> vsb_driver::Result<()> {
        debug!("共享会话保持登录: {}", driver.endpoint());
        Ok(())
    }
}

#[async_trait]
impl Connector for Simulator {
    async fn connect(&self, config: &ConnectConfig) -> vsb_driver::Result<Driver> {
        Driver::with_backend(Arc::new(self.session()), config).await
    }
}
