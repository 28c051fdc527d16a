//! Destroy 命令处理

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use vsb_builder::Artifact;
use vsb_driver::{ManagedObjectRef, ObjectType};

pub async fn handle(file: &Path, vm: &str) -> Result<()> {
    let config = super::load_config(file)?;
    let driver = super::connect(&config).await?;

    let reference = ManagedObjectRef::new(ObjectType::VirtualMachine, vm);
    let name = driver
        .vm(reference.clone())
        .name()
        .await
        .with_context(|| format!("找不到虚拟机: {}", vm))?;
    let artifact = Artifact::new(&name, reference);

    let result = artifact.destroy(&driver, &config.wait_options(None)).await;
    if let Err(e) = driver.logout().await {
        tracing::warn!("注销会话失败: {}", e);
    }
    result.with_context(|| format!("删除 {} 失败", artifact))?;

    println!("{} 已删除: {}", "✓".green().bold(), artifact);
    Ok(())
}
