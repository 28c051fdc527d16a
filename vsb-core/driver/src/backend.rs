//! 管理端协议接口
//!
//! [`Backend`] 是驱动层与远程管理端之间唯一的接缝：
//! [`HttpBackend`](crate::client::HttpBackend) 走 HTTPS，
//! [`Simulator`](crate::simulator::Simulator) 在内存中模拟同一套对象模型。

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ManagedObjectRef, MethodCall, ServiceContent, TaskInfo};

/// 属性名到 JSON 值的映射
pub type PropertyMap = serde_json::Map<String, serde_json::Value>;

#[async_trait]
pub trait Backend: Send + Sync {
    /// 建立会话
    async fn login(&self, username: &str, password: &str) -> Result<()>;

    /// 释放会话
    async fn logout(&self) -> Result<()>;

    /// 服务根信息
    async fn service_content(&self) -> Result<ServiceContent>;

    /// 读取对象属性，未知属性名返回 `QueryError::UnsupportedProperty`
    async fn retrieve_properties(
        &self,
        obj: &ManagedObjectRef,
        properties: &[&str],
    ) -> Result<PropertyMap>;

    /// 调用对象方法
    ///
    /// `_Task` 方法返回任务引用；同步方法返回创建的对象（如有）。
    async fn invoke(
        &self,
        obj: &ManagedObjectRef,
        call: &MethodCall,
    ) -> Result<Option<ManagedObjectRef>>;

    /// 查询任务状态
    async fn task_info(&self, task: &ManagedObjectRef) -> Result<TaskInfo>;

    /// 请求取消任务
    async fn cancel_task(&self, task: &ManagedObjectRef) -> Result<()>;
}
