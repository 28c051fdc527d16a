//! 克隆引擎
//!
//! 完整克隆复制全部磁盘；链接克隆从源虚拟机的当前快照派生，
//! 源虚拟机没有快照时先创建 [`LINKED_CLONE_SNAPSHOT`]。
//! 克隆完成后由调用方先记录新虚拟机，再用 [`verify_single_datastore`]
//! 校验它只占用一个数据存储，校验失败时由调用方负责删除。

use tracing::{debug, info, warn};
use vsb_driver::{
    CloneSpec, Datastore, DiskMoveType, Folder, Host, ManagedObjectRef, RelocateSpec,
    ResourcePool, SnapshotRequest, VirtualMachine, VmProperty, WaitOptions,
};

use crate::error::CloneError;

/// 链接克隆时自动创建的基准快照名
pub const LINKED_CLONE_SNAPSHOT: &str = "vsb-linked-clone-base";

pub type Result<T> = std::result::Result<T, CloneError>;

/// 克隆目标位置
#[derive(Clone)]
pub struct ClonePlacement {
    pub name: String,
    pub folder: Folder,
    pub pool: ResourcePool,
    pub host: Option<Host>,
    /// 未指定时由主机或源虚拟机推断
    pub datastore: Option<Datastore>,
}

/// 克隆虚拟机，返回新虚拟机句柄
pub async fn clone_vm(
    source: &VirtualMachine,
    placement: &ClonePlacement,
    linked: bool,
    options: &WaitOptions,
) -> Result<VirtualMachine> {
    let datastore = select_datastore(source, placement).await?;

    let (disk_move_type, snapshot) = if linked {
        let snapshot = ensure_snapshot(source, options).await?;
        (DiskMoveType::MoveChildMostDiskBacking, Some(snapshot))
    } else {
        (DiskMoveType::MoveAllDiskBackingsAndDisallowSharing, None)
    };

    let spec = CloneSpec {
        location: RelocateSpec {
            pool: Some(placement.pool.reference().clone()),
            host: placement.host.as_ref().map(|h| h.reference().clone()),
            datastore: Some(datastore),
            disk_move_type: Some(disk_move_type),
        },
        snapshot,
        template: false,
        power_on: false,
    };

    info!(
        "克隆 {} -> '{}' ({})",
        source.reference(),
        placement.name,
        if linked { "linked" } else { "full" }
    );
    let task = source
        .clone_vm(placement.folder.reference(), &placement.name, &spec)
        .await?;
    let created = task.wait(options).await?.ok_or_else(|| {
        CloneError::Driver(vsb_driver::DriverError::Task {
            operation: task.operation().to_string(),
            message: "clone task returned no virtual machine".to_string(),
        })
    })?;

    let vm = source.driver().vm(created);
    info!("克隆完成: '{}' -> {}", placement.name, vm.reference());
    Ok(vm)
}

/// 显式指定优先；否则主机挂载的数据存储，没有主机时取源虚拟机所在的数据存储
async fn select_datastore(
    source: &VirtualMachine,
    placement: &ClonePlacement,
) -> Result<ManagedObjectRef> {
    if let Some(datastore) = &placement.datastore {
        return Ok(datastore.reference().clone());
    }

    let (candidates, hint) = match &placement.host {
        Some(host) => (host.datastores().await?, format!("host '{}'", host.name().await?)),
        None => {
            let info = source.info(&[VmProperty::Datastore]).await?;
            (
                info.datastore.unwrap_or_default(),
                format!("source '{}'", source.reference()),
            )
        }
    };

    match candidates.as_slice() {
        [] => Err(CloneError::NoDatastore(hint)),
        [only] => {
            debug!("数据存储推断为 {} ({})", only, hint);
            Ok(only.clone())
        }
        many => Err(CloneError::AmbiguousDatastore {
            hint,
            count: many.len(),
        }),
    }
}

/// 返回当前快照，没有则创建基准快照
async fn ensure_snapshot(source: &VirtualMachine, options: &WaitOptions) -> Result<ManagedObjectRef> {
    if let Some(snapshot) = source.current_snapshot().await? {
        return Ok(snapshot);
    }

    info!("源虚拟机 {} 没有快照，创建 '{}'", source.reference(), LINKED_CLONE_SNAPSHOT);
    let request = SnapshotRequest::new(LINKED_CLONE_SNAPSHOT, "base for linked clones");
    let task = source.create_snapshot(&request).await?;
    match task.wait(options).await? {
        Some(snapshot) => Ok(snapshot),
        None => source.current_snapshot().await?.ok_or_else(|| {
            CloneError::Driver(vsb_driver::DriverError::Task {
                operation: task.operation().to_string(),
                message: "snapshot task returned no snapshot".to_string(),
            })
        }),
    }
}

/// 校验虚拟机只占用一个数据存储
pub async fn verify_single_datastore(vm: &VirtualMachine) -> Result<()> {
    let datastores = vm
        .info(&[VmProperty::Datastore])
        .await?
        .datastore
        .unwrap_or_default();
    if datastores.len() <= 1 {
        return Ok(());
    }

    warn!("克隆 {} 跨 {} 个数据存储", vm.reference(), datastores.len());
    Err(CloneError::SpansDatastores {
        vm: vm.reference().clone(),
        count: datastores.len(),
    })
}
