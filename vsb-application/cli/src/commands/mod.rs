//! CLI 命令处理模块

pub mod build;
pub mod destroy;
pub mod inspect;

use std::path::Path;

use anyhow::{Context, Result};
use vsb_builder::BuilderConfig;
use vsb_driver::Driver;

/// 加载构建配置
pub fn load_config(file: &Path) -> Result<BuilderConfig> {
    BuilderConfig::load(file).with_context(|| format!("无法加载构建配置: {}", file.display()))
}

/// 按构建配置建立会话
pub async fn connect(config: &BuilderConfig) -> Result<Driver> {
    let driver = Driver::connect(&config.to_connect_config())
        .await
        .with_context(|| format!("无法连接 {}", config.vcenter_server))?;
    Ok(driver)
}
