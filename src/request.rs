//! Request bookkeeping types shared by the connection manager.

use std::fmt;

use reqwest::Method;
use serde_json::Value;
use tokio::task::AbortHandle;

use crate::error::ClientError;

/// Result delivered to a continuation.
pub type Outcome = Result<Value, ClientError>;

/// Caller-supplied completion callback. Invoked exactly once, unless the
/// request is cancelled, in which case it receives [`ClientError::Cancelled`].
pub type Continuation = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// Identifies one dispatched logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Logical API operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    ListProducts,
    GetProduct,
    CreateProduct,
    UpdateProduct,
    DeleteProduct,

    ListDeviceGroups,
    GetDeviceGroup,
    CreateDeviceGroup,
    UpdateDeviceGroup,
    DeleteDeviceGroup,
    RestartDeviceGroup,
    ConditionalRestartDeviceGroup,
    SetMinimumDeployment,

    ListDevices,
    GetDevice,
    UpdateDevice,
    DeleteDevice,
    AssignDevices,
    UnassignDevices,
    RestartDevice,
    GetDeviceLogs,
    GetDeviceHistory,

    ListDeployments,
    GetDeployment,
    CreateDeployment,
    UpdateDeployment,
    DeleteDeployment,

    ListWebhooks,
    GetWebhook,
    CreateWebhook,
    UpdateWebhook,
    DeleteWebhook,

    GetMyAccount,
    GetAccount,

    CreateLogStream,
    AddToLogStream,
    RemoveFromLogStream,

    /// Anything not covered above; treated as a single-resource call.
    Other,
}

impl Action {
    /// Operations that return a paged collection.
    pub fn is_collection(self) -> bool {
        matches!(
            self,
            Self::ListProducts
                | Self::ListDeviceGroups
                | Self::ListDevices
                | Self::ListDeployments
                | Self::ListWebhooks
                | Self::GetDeviceLogs
                | Self::GetDeviceHistory
        )
    }
}

/// One in-flight logical operation, owned by the connection manager.
pub struct PendingRequest {
    pub id: RequestId,
    pub action: Action,
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    /// 1 once the request has been re-sent after a 401. A 401 at 1 is final.
    pub retry_count: u8,
    /// Items collected from the pages fetched so far.
    pub accumulated: Vec<Value>,
    pub(crate) continuation: Option<Continuation>,
    pub(crate) task: Option<AbortHandle>,
}

impl PendingRequest {
    pub fn new(
        id: RequestId,
        action: Action,
        method: Method,
        path: impl Into<String>,
        body: Option<Value>,
        continuation: Continuation,
    ) -> Self {
        Self {
            id,
            action,
            method,
            path: path.into(),
            body,
            retry_count: 0,
            accumulated: Vec::new(),
            continuation: Some(continuation),
            task: None,
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("action", &self.action)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("retry_count", &self.retry_count)
            .field("accumulated", &self.accumulated.len())
            .finish_non_exhaustive()
    }
}

/// Link to the next page of a collection response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PaginationCursor {
    pub next_url: Option<String>,
}

impl PaginationCursor {
    /// Read `links.next` from a response body. Relative links are resolved
    /// against `api_root`.
    pub fn from_body(body: &Value, api_root: &str) -> Self {
        let next_url = body["links"]["next"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|next| resolve_link(next, api_root));
        Self { next_url }
    }
}

fn resolve_link(link: &str, api_root: &str) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        return link.to_string();
    }
    match reqwest::Url::parse(api_root).and_then(|root| root.join(link)) {
        Ok(url) => url.to_string(),
        Err(_) => format!("{api_root}{}", link.trim_start_matches('/')),
    }
}
