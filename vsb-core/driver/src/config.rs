//! 连接配置

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// vCenter 连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// 管理端地址（主机名或完整 URL）
    pub endpoint: String,

    /// 用户名
    pub username: String,

    /// 密码
    #[serde(skip_serializing)]
    pub password: String,

    /// 跳过 TLS 证书校验
    #[serde(default)]
    pub insecure: bool,

    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// 请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl ConnectConfig {
    pub fn new(endpoint: &str, username: &str, password: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            insecure: false,
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
        }
    }

    /// 设置是否跳过证书校验
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// 将 `vcenter.example.test` 形式的地址补全为 `https://vcenter.example.test/`
    pub fn base_url(&self) -> String {
        let endpoint = self.endpoint.trim().trim_end_matches('/');
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            format!("{}/", endpoint)
        } else {
            format!("https://{}/", endpoint)
        }
    }
}

// 默认值函数
fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    60
}
