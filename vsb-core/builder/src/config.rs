//! 构建配置
//!
//! 选项名与构建模板中的写法完全一致（`CPUs`、`RAM_reserve_all` 等）。
//! 支持的来源:
//! - 单个构建记录 (JSON / TOML)
//! - 构建模板文档 `{"builders": [{...}]}`，取第一个构建器
//! - 环境变量覆盖连接信息 (`VSB_VCENTER_SERVER` / `VSB_USERNAME` / `VSB_PASSWORD`)

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use vsb_driver::{CancellationToken, ConnectConfig, HardwareSpec, WaitOptions};

use crate::error::ConfigError;

/// 构建配置记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// 构建器类型 (模板文档中的 `type`)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub builder_type: Option<String>,

    // ---- 连接 ----
    #[serde(default)]
    pub vcenter_server: String,

    #[serde(default)]
    pub username: String,

    #[serde(default, skip_serializing)]
    pub password: String,

    #[serde(default)]
    pub insecure_connection: bool,

    // ---- 位置 ----
    /// 数据中心路径，空表示唯一的数据中心
    #[serde(default)]
    pub datacenter: String,

    /// 源虚拟机或模板
    #[serde(default)]
    pub template: String,

    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub datastore: String,

    #[serde(default)]
    pub folder: String,

    #[serde(default)]
    pub resource_pool: String,

    #[serde(default)]
    pub linked_clone: bool,

    // ---- 硬件 ----
    #[serde(rename = "CPUs", default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<i32>,

    #[serde(rename = "CPU_reservation", default, skip_serializing_if = "Option::is_none")]
    pub cpu_reservation: Option<i64>,

    #[serde(rename = "CPU_limit", default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<i64>,

    #[serde(rename = "RAM", default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<i64>,

    #[serde(rename = "RAM_reservation", default, skip_serializing_if = "Option::is_none")]
    pub ram_reservation: Option<i64>,

    #[serde(rename = "RAM_reserve_all", default)]
    pub ram_reserve_all: bool,

    // ---- 收尾 ----
    #[serde(default)]
    pub create_snapshot: bool,

    #[serde(default)]
    pub convert_to_template: bool,

    #[serde(default)]
    pub vm_name: String,

    // ---- 客户机 ----
    /// 设置后构建会开机等待客户机 IP 并调用客户机钩子
    #[serde(default)]
    pub ssh_username: String,

    #[serde(default, skip_serializing)]
    pub ssh_password: String,

    // ---- 超时 ----
    /// 单个远程任务的截止时间 (秒)
    #[serde(default = "default_task_timeout")]
    pub task_timeout: u64,

    /// 等待客户机 IP 的截止时间 (秒)
    #[serde(default = "default_ip_wait_timeout")]
    pub ip_wait_timeout: u64,

    /// 任务轮询间隔 (毫秒)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_task_timeout() -> u64 {
    1800
}

fn default_ip_wait_timeout() -> u64 {
    1800
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            builder_type: None,
            vcenter_server: String::new(),
            username: String::new(),
            password: String::new(),
            insecure_connection: false,
            datacenter: String::new(),
            template: String::new(),
            host: String::new(),
            datastore: String::new(),
            folder: String::new(),
            resource_pool: String::new(),
            linked_clone: false,
            cpus: None,
            cpu_reservation: None,
            cpu_limit: None,
            ram: None,
            ram_reservation: None,
            ram_reserve_all: false,
            create_snapshot: false,
            convert_to_template: false,
            vm_name: String::new(),
            ssh_username: String::new(),
            ssh_password: String::new(),
            task_timeout: default_task_timeout(),
            ip_wait_timeout: default_ip_wait_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// 配置文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    /// 按扩展名识别
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|s| s.to_str()) {
            Some("json") => Some(Self::Json),
            Some("toml") => Some(Self::Toml),
            _ => None,
        }
    }
}

// ============================================
// 加载
// ============================================

impl BuilderConfig {
    /// 从文件加载，并应用环境变量覆盖
    pub fn load(path: &Path) -> Result<Self> {
        let format = ConfigFormat::from_path(path)
            .with_context(|| format!("Unsupported config file format: {:?}", path))?;

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config = Self::parse(&content, format)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.apply_env_vars();
        tracing::debug!("Loaded build config from: {:?}", path);
        Ok(config)
    }

    /// 解析构建记录或构建模板文档
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self> {
        let mut value: serde_json::Value = match format {
            ConfigFormat::Json => serde_json::from_str(content).context("Invalid JSON")?,
            ConfigFormat::Toml => toml::from_str(content).context("Invalid TOML")?,
        };

        if let Some(builders) = value.get_mut("builders") {
            let first = builders
                .as_array_mut()
                .and_then(|list| (!list.is_empty()).then(|| list.remove(0)))
                .context("`builders` must be a non-empty list")?;
            value = first;
        }

        serde_json::from_value(value).context("Invalid build record")
    }

    /// 环境变量覆盖连接信息
    fn apply_env_vars(&mut self) {
        if let Ok(server) = env::var("VSB_VCENTER_SERVER") {
            self.vcenter_server = server;
        }
        if let Ok(username) = env::var("VSB_USERNAME") {
            self.username = username;
        }
        if let Ok(password) = env::var("VSB_PASSWORD") {
            self.password = password;
        }
    }

    /// 校验必填项与冲突项
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let required = [
            ("vcenter_server", &self.vcenter_server),
            ("username", &self.username),
            ("password", &self.password),
            ("template", &self.template),
            ("vm_name", &self.vm_name),
        ];
        let missing: Vec<String> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        if self.ram_reservation.is_some() && self.ram_reserve_all {
            return Err(ConfigError::Conflict(
                "RAM_reservation cannot be combined with RAM_reserve_all".to_string(),
            ));
        }
        if !self.ssh_password.is_empty() && self.ssh_username.is_empty() {
            return Err(ConfigError::Conflict(
                "ssh_password requires ssh_username".to_string(),
            ));
        }

        if self.cpus.is_some_and(|cpus| cpus <= 0) {
            return Err(invalid("CPUs", "must be positive"));
        }
        if self.ram.is_some_and(|ram| ram <= 0) {
            return Err(invalid("RAM", "must be positive"));
        }
        if let (Some(reservation), Some(limit)) = (self.cpu_reservation, self.cpu_limit) {
            if limit >= 0 && reservation > limit {
                return Err(invalid("CPU_reservation", "exceeds CPU_limit"));
            }
        }
        if self.task_timeout == 0 {
            return Err(invalid("task_timeout", "must be at least one second"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", "must be positive"));
        }

        Ok(())
    }

    // ============================================
    // 派生配置
    // ============================================

    pub fn to_connect_config(&self) -> ConnectConfig {
        ConnectConfig::new(&self.vcenter_server, &self.username, &self.password)
            .with_insecure(self.insecure_connection)
    }

    pub fn hardware_spec(&self) -> HardwareSpec {
        HardwareSpec {
            cpus: self.cpus,
            cpu_reservation: self.cpu_reservation,
            cpu_limit: self.cpu_limit,
            ram: self.ram,
            ram_reservation: self.ram_reservation,
            ram_reserve_all: self.ram_reserve_all,
        }
    }

    /// 是否需要等待客户机
    pub fn waits_for_guest(&self) -> bool {
        !self.ssh_username.is_empty()
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout)
    }

    pub fn ip_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.ip_wait_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// 远程任务等待选项
    pub fn wait_options(&self, cancel: Option<CancellationToken>) -> WaitOptions {
        let options = WaitOptions::new(self.task_timeout()).with_poll_interval(self.poll_interval());
        match cancel {
            Some(token) => options.with_cancel(token),
            None => options,
        }
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
