//! High-level client for the impCentral API.
//!
//! [`BuildApiClient`] wires one [`SessionManager`], one [`ConnectionManager`]
//! and one [`LogStreamClient`] over a shared [`Transport`], and provides a
//! typed method per endpoint. Responses are returned as `serde_json::Value`
//! in the service's JSON:API shape; collection methods return every page
//! merged under `data`.

use std::sync::Arc;

use reqwest::Method;
use serde_json::{json, Value};
use tracing::info;

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::error::ClientError;
use crate::logstream::{LogEntry, LogStreamClient};
use crate::request::Action;
use crate::session::{LoginOutcome, SessionManager};
use crate::token::Token;
use crate::transport::{HttpTransport, Transport};

/// Device group flavours accepted by `create_device_group`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceGroupType {
    Development,
    PreProduction,
    Production,
    PreFactoryFixture,
    FactoryFixture,
}

impl DeviceGroupType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development_devicegroup",
            Self::PreProduction => "pre_production_devicegroup",
            Self::Production => "production_devicegroup",
            Self::PreFactoryFixture => "pre_factoryfixture_devicegroup",
            Self::FactoryFixture => "factoryfixture_devicegroup",
        }
    }
}

/// Code and metadata for a new deployment.
#[derive(Debug, Clone)]
pub struct NewDeployment<'a> {
    pub device_group_id: &'a str,
    pub device_group_type: DeviceGroupType,
    pub device_code: &'a str,
    pub agent_code: &'a str,
    pub description: Option<&'a str>,
}

/// Target and trigger of a new webhook.
#[derive(Debug, Clone)]
pub struct NewWebhook<'a> {
    pub device_group_id: &'a str,
    pub device_group_type: DeviceGroupType,
    pub target_url: &'a str,
    /// `blinkup`, `deployment` or `blessing`.
    pub event: &'a str,
    /// `json` or `urlencoded`.
    pub content_type: &'a str,
}

pub struct BuildApiClient {
    config: Config,
    session: Arc<SessionManager>,
    connections: Arc<ConnectionManager>,
    logs: LogStreamClient,
}

impl BuildApiClient {
    /// Build a client on the `reqwest` transport. Must be called from within
    /// a Tokio runtime.
    pub fn new(config: Config) -> Result<Self, ClientError> {
        let transport = Arc::new(HttpTransport::new(&config.api)?);
        Ok(Self::with_transport(config, transport))
    }

    /// Build a client on a caller-supplied transport.
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        let api_root = config.api.api_root();
        let session = Arc::new(SessionManager::new(Arc::clone(&transport), api_root.clone()));
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&transport),
            Arc::clone(&session),
            api_root,
            config.pagination.page_size,
        ));
        let logs = LogStreamClient::start(
            Arc::clone(&connections),
            Arc::clone(&session),
            transport,
            &config.log_stream,
            None,
        );
        Self {
            config,
            session,
            connections,
            logs,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn logs(&self) -> &LogStreamClient {
        &self.logs
    }

    // ── Session ─────────────────────────────────────────────────────

    pub async fn login(
        &self,
        username: &str,
        password: &str,
        two_factor: bool,
    ) -> Result<LoginOutcome, ClientError> {
        self.session.login(username, password, two_factor).await
    }

    pub async fn complete_two_factor(&self, login_token: &str, otp: &str) -> Result<Token, ClientError> {
        self.session.complete_two_factor(login_token, otp).await
    }

    pub async fn login_with_key(&self, login_key: &str) -> Result<Token, ClientError> {
        self.session.login_with_key(login_key).await
    }

    /// Create a login key for the current account. The server re-checks
    /// `password`.
    pub async fn get_login_key(&self, password: &str) -> Result<Value, ClientError> {
        self.session.get_login_key(password).await
    }

    /// End the session, cancel every pending request and stop all logging.
    pub async fn logout(&self) {
        self.session.logout();
        let cancelled = self.connections.kill_all();
        self.logs.stop_all().await;
        info!(cancelled, "session torn down");
    }

    pub fn set_page_size(&self, size: usize) {
        self.connections.set_page_size(size);
    }

    // ── Products ────────────────────────────────────────────────────

    /// `GET products`
    pub async fn list_products(&self) -> Result<Value, ClientError> {
        self.call(Method::GET, "products", None, Action::ListProducts).await
    }

    /// `GET products/{id}`
    pub async fn get_product(&self, id: &str) -> Result<Value, ClientError> {
        self.call(Method::GET, &format!("products/{id}"), None, Action::GetProduct)
            .await
    }

    /// `POST products`
    pub async fn create_product(&self, name: &str, description: Option<&str>) -> Result<Value, ClientError> {
        let mut attributes = json!({ "name": name });
        if let Some(description) = description {
            attributes["description"] = json!(description);
        }
        let body = json!({ "data": { "type": "product", "attributes": attributes } });
        self.call(Method::POST, "products", Some(body), Action::CreateProduct)
            .await
    }

    /// `PATCH products/{id}`
    pub async fn update_product(&self, id: &str, attributes: Value) -> Result<Value, ClientError> {
        let body = json!({ "data": { "type": "product", "id": id, "attributes": attributes } });
        self.call(Method::PATCH, &format!("products/{id}"), Some(body), Action::UpdateProduct)
            .await
    }

    /// `DELETE products/{id}`
    pub async fn delete_product(&self, id: &str) -> Result<Value, ClientError> {
        self.call(Method::DELETE, &format!("products/{id}"), None, Action::DeleteProduct)
            .await
    }

    // ── Device groups ───────────────────────────────────────────────

    /// `GET devicegroups`, optionally filtered by product.
    pub async fn list_device_groups(&self, product_id: Option<&str>) -> Result<Value, ClientError> {
        let path = match product_id {
            Some(id) => format!("devicegroups?filter[product.id]={id}"),
            None => "devicegroups".to_string(),
        };
        self.call(Method::GET, &path, None, Action::ListDeviceGroups)
            .await
    }

    /// `GET devicegroups/{id}`
    pub async fn get_device_group(&self, id: &str) -> Result<Value, ClientError> {
        self.call(Method::GET, &format!("devicegroups/{id}"), None, Action::GetDeviceGroup)
            .await
    }

    /// `POST devicegroups`
    pub async fn create_device_group(
        &self,
        product_id: &str,
        name: &str,
        group_type: DeviceGroupType,
    ) -> Result<Value, ClientError> {
        let body = json!({
            "data": {
                "type": group_type.as_str(),
                "attributes": { "name": name },
                "relationships": { "product": { "type": "product", "id": product_id } }
            }
        });
        self.call(Method::POST, "devicegroups", Some(body), Action::CreateDeviceGroup)
            .await
    }

    /// `PATCH devicegroups/{id}`
    pub async fn update_device_group(
        &self,
        id: &str,
        group_type: DeviceGroupType,
        attributes: Value,
    ) -> Result<Value, ClientError> {
        let body = json!({ "data": { "type": group_type.as_str(), "id": id, "attributes": attributes } });
        self.call(
            Method::PATCH,
            &format!("devicegroups/{id}"),
            Some(body),
            Action::UpdateDeviceGroup,
        )
        .await
    }

    /// `DELETE devicegroups/{id}`
    pub async fn delete_device_group(&self, id: &str) -> Result<Value, ClientError> {
        self.call(
            Method::DELETE,
            &format!("devicegroups/{id}"),
            None,
            Action::DeleteDeviceGroup,
        )
        .await
    }

    /// `POST devicegroups/{id}/restart`
    pub async fn restart_device_group(&self, id: &str) -> Result<Value, ClientError> {
        self.call(
            Method::POST,
            &format!("devicegroups/{id}/restart"),
            None,
            Action::RestartDeviceGroup,
        )
        .await
    }

    /// `POST devicegroups/{id}/conditional_restart`: restart only devices
    /// whose code is older than the group's current deployment.
    pub async fn conditional_restart_device_group(&self, id: &str) -> Result<Value, ClientError> {
        self.call(
            Method::POST,
            &format!("devicegroups/{id}/conditional_restart"),
            None,
            Action::ConditionalRestartDeviceGroup,
        )
        .await
    }

    /// `PUT devicegroups/{id}/relationships/min_supported_deployment`
    pub async fn set_minimum_deployment(&self, group_id: &str, deployment_id: &str) -> Result<Value, ClientError> {
        let body = json!({ "data": { "type": "deployment", "id": deployment_id } });
        self.call(
            Method::PUT,
            &format!("devicegroups/{group_id}/relationships/min_supported_deployment"),
            Some(body),
            Action::SetMinimumDeployment,
        )
        .await
    }

    /// `POST devicegroups/{id}/relationships/devices`
    pub async fn assign_devices(&self, group_id: &str, device_ids: &[&str]) -> Result<Value, ClientError> {
        self.call(
            Method::POST,
            &format!("devicegroups/{group_id}/relationships/devices"),
            Some(device_refs(device_ids)),
            Action::AssignDevices,
        )
        .await
    }

    /// `DELETE devicegroups/{id}/relationships/devices`
    pub async fn unassign_devices(&self, group_id: &str, device_ids: &[&str]) -> Result<Value, ClientError> {
        self.call(
            Method::DELETE,
            &format!("devicegroups/{group_id}/relationships/devices"),
            Some(device_refs(device_ids)),
            Action::UnassignDevices,
        )
        .await
    }

    // ── Devices ─────────────────────────────────────────────────────

    /// `GET devices`, optionally filtered by device group.
    pub async fn list_devices(&self, device_group_id: Option<&str>) -> Result<Value, ClientError> {
        let path = match device_group_id {
            Some(id) => format!("devices?filter[devicegroup.id]={id}"),
            None => "devices".to_string(),
        };
        self.call(Method::GET, &path, None, Action::ListDevices).await
    }

    /// `GET devices/{id}`
    pub async fn get_device(&self, id: &str) -> Result<Value, ClientError> {
        self.call(Method::GET, &format!("devices/{id}"), None, Action::GetDevice)
            .await
    }

    /// `PATCH devices/{id}`
    pub async fn update_device(&self, id: &str, attributes: Value) -> Result<Value, ClientError> {
        let body = json!({ "data": { "type": "device", "id": id, "attributes": attributes } });
        self.call(Method::PATCH, &format!("devices/{id}"), Some(body), Action::UpdateDevice)
            .await
    }

    /// `DELETE devices/{id}`
    pub async fn delete_device(&self, id: &str) -> Result<Value, ClientError> {
        self.call(Method::DELETE, &format!("devices/{id}"), None, Action::DeleteDevice)
            .await
    }

    /// `POST devices/{id}/restart`
    pub async fn restart_device(&self, id: &str) -> Result<Value, ClientError> {
        self.call(
            Method::POST,
            &format!("devices/{id}/restart"),
            None,
            Action::RestartDevice,
        )
        .await
    }

    /// `GET devices/{id}/logs`
    pub async fn get_device_logs(&self, id: &str) -> Result<Value, ClientError> {
        self.call(Method::GET, &format!("devices/{id}/logs"), None, Action::GetDeviceLogs)
            .await
    }

    /// `GET devices/{id}/history`
    pub async fn get_device_history(&self, id: &str) -> Result<Value, ClientError> {
        self.call(
            Method::GET,
            &format!("devices/{id}/history"),
            None,
            Action::GetDeviceHistory,
        )
        .await
    }

    // ── Deployments ─────────────────────────────────────────────────

    /// `GET deployments`, optionally filtered by device group.
    pub async fn list_deployments(&self, device_group_id: Option<&str>) -> Result<Value, ClientError> {
        let path = match device_group_id {
            Some(id) => format!("deployments?filter[devicegroup.id]={id}"),
            None => "deployments".to_string(),
        };
        self.call(Method::GET, &path, None, Action::ListDeployments)
            .await
    }

    /// `GET deployments/{id}`
    pub async fn get_deployment(&self, id: &str) -> Result<Value, ClientError> {
        self.call(Method::GET, &format!("deployments/{id}"), None, Action::GetDeployment)
            .await
    }

    /// `POST deployments`
    pub async fn create_deployment(&self, deployment: &NewDeployment<'_>) -> Result<Value, ClientError> {
        let mut attributes = json!({
            "device_code": deployment.device_code,
            "agent_code": deployment.agent_code,
        });
        if let Some(description) = deployment.description {
            attributes["description"] = json!(description);
        }
        let body = json!({
            "data": {
                "type": "deployment",
                "attributes": attributes,
                "relationships": {
                    "devicegroup": {
                        "type": deployment.device_group_type.as_str(),
                        "id": deployment.device_group_id
                    }
                }
            }
        });
        self.call(Method::POST, "deployments", Some(body), Action::CreateDeployment)
            .await
    }

    /// `PATCH deployments/{id}`
    pub async fn update_deployment(&self, id: &str, attributes: Value) -> Result<Value, ClientError> {
        let body = json!({ "data": { "type": "deployment", "id": id, "attributes": attributes } });
        self.call(
            Method::PATCH,
            &format!("deployments/{id}"),
            Some(body),
            Action::UpdateDeployment,
        )
        .await
    }

    /// `DELETE deployments/{id}`
    pub async fn delete_deployment(&self, id: &str) -> Result<Value, ClientError> {
        self.call(
            Method::DELETE,
            &format!("deployments/{id}"),
            None,
            Action::DeleteDeployment,
        )
        .await
    }

    // ── Webhooks ────────────────────────────────────────────────────

    /// `GET webhooks`, optionally filtered by device group.
    pub async fn list_webhooks(&self, device_group_id: Option<&str>) -> Result<Value, ClientError> {
        let path = match device_group_id {
            Some(id) => format!("webhooks?filter[devicegroup.id]={id}"),
            None => "webhooks".to_string(),
        };
        self.call(Method::GET, &path, None, Action::ListWebhooks).await
    }

    /// `GET webhooks/{id}`
    pub async fn get_webhook(&self, id: &str) -> Result<Value, ClientError> {
        self.call(Method::GET, &format!("webhooks/{id}"), None, Action::GetWebhook)
            .await
    }

    /// `POST webhooks`
    pub async fn create_webhook(&self, webhook: &NewWebhook<'_>) -> Result<Value, ClientError> {
        let body = json!({
            "data": {
                "type": "webhook",
                "attributes": {
                    "target_url": webhook.target_url,
                    "event": webhook.event,
                    "content_type": webhook.content_type
                },
                "relationships": {
                    "devicegroup": {
                        "type": webhook.device_group_type.as_str(),
                        "id": webhook.device_group_id
                    }
                }
            }
        });
        self.call(Method::POST, "webhooks", Some(body), Action::CreateWebhook)
            .await
    }

    /// `PATCH webhooks/{id}`
    pub async fn update_webhook(&self, id: &str, attributes: Value) -> Result<Value, ClientError> {
        let body = json!({ "data": { "type": "webhook", "id": id, "attributes": attributes } });
        self.call(Method::PATCH, &format!("webhooks/{id}"), Some(body), Action::UpdateWebhook)
            .await
    }

    /// `DELETE webhooks/{id}`
    pub async fn delete_webhook(&self, id: &str) -> Result<Value, ClientError> {
        self.call(Method::DELETE, &format!("webhooks/{id}"), None, Action::DeleteWebhook)
            .await
    }

    // ── Account ─────────────────────────────────────────────────────

    /// `GET accounts/me`
    pub async fn get_my_account(&self) -> Result<Value, ClientError> {
        self.call(Method::GET, "accounts/me", None, Action::GetMyAccount)
            .await
    }

    /// `GET accounts/{id}`
    pub async fn get_account(&self, id: &str) -> Result<Value, ClientError> {
        self.call(Method::GET, &format!("accounts/{id}"), None, Action::GetAccount)
            .await
    }

    // ── Logging ─────────────────────────────────────────────────────

    /// Stream `device_id`'s logs to `handler` until `stop_logging`.
    pub async fn start_logging<F>(&self, device_id: &str, handler: F) -> Result<(), ClientError>
    where
        F: Fn(LogEntry) + Send + Sync + 'static,
    {
        self.logs.subscribe(device_id, handler).await
    }

    pub async fn stop_logging(&self, device_id: &str) -> Result<bool, ClientError> {
        self.logs.unsubscribe(device_id).await
    }

    pub fn is_logging(&self, device_id: &str) -> bool {
        self.logs.is_subscribed(device_id)
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        action: Action,
    ) -> Result<Value, ClientError> {
        self.connections.request(method, path, body, action).await
    }
}

fn device_refs(device_ids: &[&str]) -> Value {
    let data: Vec<Value> = device_ids
        .iter()
        .map(|id| json!({ "type": "device", "id": id }))
        .collect();
    json!({ "data": data })
}
