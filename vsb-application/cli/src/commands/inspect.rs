//! Path 命令处理：只读解析清单路径

use std::path::Path;

use anyhow::Result;
use colored::Colorize;
use vsb_driver::{Inventory, ManagedObjectRef};

use crate::PathQuery;

pub async fn handle(file: &Path, query: &PathQuery) -> Result<()> {
    let config = super::load_config(file)?;
    let driver = super::connect(&config).await?;

    let result = match driver.inventory(&config.datacenter).await {
        Ok(inventory) => resolve(&inventory, query).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = driver.logout().await {
        tracing::warn!("注销会话失败: {}", e);
    }

    let rows = result?;
    if rows.is_empty() {
        println!("{}", "未指定要解析的路径".yellow());
    }
    for (kind, path, reference) in rows {
        println!("{:<10} {:<30} {}", kind, path.cyan(), reference);
    }
    Ok(())
}

async fn resolve(
    inventory: &Inventory,
    query: &PathQuery,
) -> Result<Vec<(&'static str, String, ManagedObjectRef)>> {
    let mut rows = Vec::new();
    println!(
        "数据中心: {} ({})",
        inventory.datacenter().name().cyan(),
        inventory.datacenter().reference()
    );

    if let Some(path) = &query.folder {
        let folder = inventory.find_folder(path).await?;
        rows.push(("folder", path.clone(), folder.reference().clone()));
    }
    if let Some(path) = &query.host {
        let host = inventory.resolve_host(path).await?;
        rows.push(("host", path.clone(), host.reference().clone()));
    }
    if let Some(path) = &query.datastore {
        let datastore = inventory.resolve_datastore(path, None).await?;
        rows.push(("datastore", path.clone(), datastore.reference().clone()));
    }
    if let Some(path) = &query.network {
        let network = inventory.resolve_network(path).await?;
        rows.push(("network", path.clone(), network.reference().clone()));
    }
    if let Some(path) = &query.vm {
        let vm = inventory.find_vm(path).await?;
        rows.push(("vm", path.clone(), vm.reference().clone()));
    }
    Ok(rows)
}
