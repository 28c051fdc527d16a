//! vCenter 驱动
//!
//! 把远程管理端的对象模型（数据中心、文件夹、资源池、数据存储、主机、网络、虚拟机）
//! 封装为可按路径寻址的实体。
//!
//! # 模块
//!
//! - [`driver`]：会话管理，所有对象句柄的入口
//! - [`inventory`]：清单路径解析与自动创建
//! - [`vm`]：虚拟机句柄（属性查询、克隆、重配置、快照、电源）
//! - [`task`]：远程任务等待，支持截止时间与取消
//! - [`client`]：HTTPS JSON 网关实现
//! - [`simulator`]：内存模拟器

pub mod backend;
pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod inventory;
pub mod models;
pub mod simulator;
pub mod task;
pub mod vm;

pub use backend::{Backend, PropertyMap};
pub use client::HttpBackend;
pub use config::ConnectConfig;
pub use driver::Driver;
pub use error::{ConnectionFailure, DriverError, QueryError, ResolutionError, Result};
pub use inventory::{
    Datacenter, Datastore, Folder, Host, Inventory, InventoryPath, Network, ResourcePool,
};
pub use models::{
    CloneSpec, DiskMoveType, HardwareSpec, ManagedObjectRef, ObjectType, PowerState, RelocateSpec,
    SnapshotRequest, VmInfo, VmProperty,
};
pub use task::{Task, WaitOptions};
pub use vm::VirtualMachine;

/// 重新导出取消令牌
pub use tokio_util::sync::CancellationToken;
