//! 客户机钩子
//!
//! 构建在客户机上报 IP 后调用钩子（如通过 SSH 安装软件），
//! 钩子的具体实现由调用方提供。

use std::fmt;

use async_trait::async_trait;
use vsb_driver::ManagedObjectRef;

/// 客户机连接信息
#[derive(Clone)]
pub struct GuestEndpoint {
    pub vm: ManagedObjectRef,
    pub ip: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for GuestEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestEndpoint")
            .field("vm", &self.vm)
            .field("ip", &self.ip)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// 客户机钩子
#[async_trait]
pub trait GuestHook: Send + Sync {
    async fn provision(&self, guest: &GuestEndpoint) -> anyhow::Result<()>;
}

/// 什么都不做
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGuestHook;

#[async_trait]
impl GuestHook for NoopGuestHook {
    async fn provision(&self, guest: &GuestEndpoint) -> anyhow::Result<()> {
        tracing::debug!("跳过客户机配置: {} ({})", guest.vm, guest.ip);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsb_driver::ObjectType;

    #[test]
    fn test_debug_hides_password() {
        let guest = GuestEndpoint {
            vm: ManagedObjectRef::new(ObjectType::VirtualMachine, "vm-1"),
            ip: "10.0.0.2".to_string(),
            username: "root".to_string(),
            password: "secret".to_string(),
        };
        let debug = format!("{:?}", guest);
        assert!(debug.contains("10.0.0.2"));
        assert!(!debug.contains("secret"));
    }
}
