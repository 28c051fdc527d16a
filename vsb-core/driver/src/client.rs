//! 管理端 HTTP 客户端
//!
//! 通过 JSON 网关访问 vCenter 对象模型：
//! - `POST   /api/session`                    登录（Basic 认证，返回会话令牌）
//! - `DELETE /api/session`                    登出
//! - `GET    /api/service-content`            服务根信息
//! - `GET    /api/mob/{type}/{id}?props=...`  读取属性
//! - `POST   /api/mob/{type}/{id}/{method}`   调用方法
//! - `GET    /api/tasks/{id}`                 任务状态
//! - `POST   /api/tasks/{id}/cancel`          取消任务

use std::error::Error as _;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::{Backend, PropertyMap};
use crate::config::ConnectConfig;
use crate::error::{ConnectionFailure, DriverError, QueryError, Result};
use crate::models::{ManagedObjectRef, MethodCall, ServiceContent, TaskInfo};

/// 会话令牌请求头
const SESSION_HEADER: &str = "vmware-api-session-id";

/// 网关返回的错误体
#[derive(Debug, Deserialize)]
struct FaultBody {
    fault: String,
    #[serde(default)]
    message: String,
}

/// 方法调用返回体
#[derive(Debug, Deserialize)]
struct InvokeResponse {
    #[serde(default)]
    returnval: Option<ManagedObjectRef>,
}

/// HTTP 管理端
pub struct HttpBackend {
    /// API 基础 URL
    base_url: Url,

    /// HTTP 客户端
    http_client: Client,

    /// 会话令牌
    session: Arc<RwLock<Option<String>>>,

    /// 原始地址，用于错误信息
    endpoint: String,
}

impl HttpBackend {
    /// 创建新的 HTTP 管理端
    pub fn new(config: &ConnectConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url()).map_err(|e| DriverError::Connection {
            endpoint: config.endpoint.clone(),
            source: ConnectionFailure::InvalidEndpoint(e.to_string()),
        })?;

        let http_client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| DriverError::Http(e.to_string()))?;

        Ok(Self {
            base_url,
            http_client,
            session: Arc::new(RwLock::new(None)),
            endpoint: config.endpoint.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| DriverError::Parse(e.to_string()))
    }

    fn object_path(obj: &ManagedObjectRef) -> String {
        format!("api/mob/{}/{}", obj.kind, obj.value)
    }

    /// 发送已认证的 HTTP 请求
    async fn request<T: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&T>,
    ) -> Result<R> {
        let url = self.url(path)?;
        debug!("vCenter API 请求: {} {}", method, url);

        let token = self
            .session
            .read()
            .await
            .clone()
            .ok_or_else(|| DriverError::NotAuthenticated("请先登录".to_string()))?;

        let mut request = self
            .http_client
            .request(method, url)
            .header(SESSION_HEADER, token)
            .query(query);

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "无法读取错误响应".to_string());
            warn!("API 请求失败: {} - {}", status, error_text);
            return Err(fault_error(status, &error_text));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| DriverError::Parse(e.to_string()))
    }

    fn transport_error(&self, err: reqwest::Error) -> DriverError {
        DriverError::Connection {
            endpoint: self.endpoint.clone(),
            source: classify_transport(&err),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn login(&self, username: &str, password: &str) -> Result<()> {
        info!("vCenter 登录: {}@{}", username, self.endpoint);

        let response = self
            .http_client
            .post(self.url("api/session")?)
            .basic_auth(username, Some(password))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(DriverError::Connection {
                    endpoint: self.endpoint.clone(),
                    source: ConnectionFailure::AuthenticationRejected(username.to_string()),
                });
            }
            status => {
                let text = response.text().await.unwrap_or_default();
                return Err(DriverError::Api(status.as_u16(), text));
            }
        }

        let token: String = response
            .json()
            .await
            .map_err(|e| DriverError::Parse(e.to_string()))?;

        *self.session.write().await = Some(token);

        info!("vCenter 登录成功");
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        let token = self.session.write().await.take();
        let Some(token) = token else {
            return Ok(());
        };

        info!("vCenter 登出: {}", self.endpoint);
        self.http_client
            .delete(self.url("api/session")?)
            .header(SESSION_HEADER, token)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        Ok(())
    }

    async fn service_content(&self) -> Result<ServiceContent> {
        self.request(Method::GET, "api/service-content", &[], None::<&()>)
            .await
    }

    async fn retrieve_properties(
        &self,
        obj: &ManagedObjectRef,
        properties: &[&str],
    ) -> Result<PropertyMap> {
        let query = [("props", properties.join(","))];
        self.request(Method::GET, &Self::object_path(obj), &query, None::<&()>)
            .await
    }

    async fn invoke(
        &self,
        obj: &ManagedObjectRef,
        call: &MethodCall,
    ) -> Result<Option<ManagedObjectRef>> {
        let path = format!("{}/{}", Self::object_path(obj), call.name());
        let response: InvokeResponse = self.request(Method::POST, &path, &[], Some(call)).await?;
        Ok(response.returnval)
    }

    async fn task_info(&self, task: &ManagedObjectRef) -> Result<TaskInfo> {
        self.request(
            Method::GET,
            &format!("api/tasks/{}", task.value),
            &[],
            None::<&()>,
        )
        .await
    }

    async fn cancel_task(&self, task: &ManagedObjectRef) -> Result<()> {
        let _: serde_json::Value = self
            .request(
                Method::POST,
                &format!("api/tasks/{}/cancel", task.value),
                &[],
                None::<&()>,
            )
            .await?;
        Ok(())
    }
}

/// 将网关错误体映射为驱动错误
fn fault_error(status: StatusCode, body: &str) -> DriverError {
    let Ok(fault) = serde_json::from_str::<FaultBody>(body) else {
        return DriverError::Api(status.as_u16(), body.to_string());
    };

    match fault.fault.as_str() {
        "DuplicateName" => DriverError::DuplicateName(fault.message),
        "InvalidState" | "InvalidPowerState" => DriverError::InvalidState(fault.message),
        "InvalidProperty" => QueryError::UnsupportedProperty(fault.message).into(),
        "NotAuthenticated" => DriverError::NotAuthenticated(fault.message),
        _ => DriverError::Api(status.as_u16(), format!("{}: {}", fault.fault, fault.message)),
    }
}

/// 区分 TLS 失败与网络不可达
fn classify_transport(err: &reqwest::Error) -> ConnectionFailure {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }

    let lower = chain.to_lowercase();
    if lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") {
        ConnectionFailure::Tls(chain)
    } else {
        ConnectionFailure::Unreachable(chain)
    }
}
