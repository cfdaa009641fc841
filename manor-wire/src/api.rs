//! HTTP request/response bodies and the header/cookie names shared by the
//! hub, the instance daemons, and their clients.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Cookie carrying the refresh token.
pub const REFRESH_COOKIE: &str = "YRT";

/// Names the target instance of an internal cross-service call.
pub const HEADER_APPLICATION_ID: &str = "x-application-id";

/// Resolved user id added by the hub on the loopback hop.
pub const HEADER_USER_ID: &str = "x-manor-user-id";

/// Access token added by the hub on the loopback hop.
pub const HEADER_ACCESS_TOKEN: &str = "x-manor-access-token";

/// Minimal error body; structured clients rely on the status code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Answer to `GET /api/status` on an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub current_event_id: i64,
}

impl StatusResponse {
    pub fn ok(current_event_id: i64) -> Self {
        Self {
            status: "ok".into(),
            current_event_id,
        }
    }
}

/// Outcome of a publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishStatus {
    /// A new event row was committed.
    Success,
    /// The client id was seen before; `id` names the original event.
    Duplicate,
}

/// Answer to `POST /api/publish?cid=<client_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResponse {
    pub status: PublishStatus,
    pub id: i64,
    #[serde(rename = "clientId")]
    pub client_id: String,
}

/// Body of `POST /api/poll`: the highest event id the client has seen, per
/// instance. The answer carries only the instances that advanced.
pub type PollBody = BTreeMap<String, i64>;

/// Body of `POST /api/login` on the login host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Answer to a successful login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub domain: String,
    pub app_refresh_token: String,
}

/// Answer to `POST /api/refresh`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
}

/// Body of `POST /internal/dologin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoLoginRequest {
    pub username: String,
    pub password: String,
}

/// Answer to `POST /internal/dologin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoLoginResponse {
    pub success: bool,
    #[serde(default)]
    pub user_id: i64,
}

/// Body of `POST /internal/checkAccess`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckAccessRequest {
    pub user_id: i64,
    pub application_id: String,
}

/// Answer to `POST /internal/checkAccess`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckAccessResponse {
    #[serde(rename = "accessGranted")]
    pub access_granted: bool,
}

/// One deployed application instance, as reported by the admin instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub instance_id: String,
    pub app_id: String,
    pub display_name: String,
    pub host_name: String,
    pub db_name: String,
}

/// Answer to `POST /internal/listInstances`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListInstancesResponse {
    pub instances: Vec<InstanceDescriptor>,
}

/// Upload progress for a package, per `GET /debug/application/upload/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadStatusResponse {
    #[serde(rename = "totalChunks")]
    pub total_chunks: u32,
    #[serde(rename = "receivedChunks")]
    pub received_chunks: u32,
    pub progress: f64,
    pub completed: bool,
}

/// A guest-originated call to another instance, relayed through the hub's
/// internal host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossServiceRequest {
    pub application_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub body: String,
}

/// The relayed answer. Failures arrive as a status code plus body, never as
/// a broken channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossServiceResponse {
    pub status: u16,
    #[serde(default)]
    pub body: String,
}

/// An external HTTP request as presented to a guest request handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestHttpRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
}

/// A guest handler's answer, written back through `write_response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestHttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
}

/// Pull the type tag out of a published event payload.
pub fn event_type(payload: &serde_json::Value) -> Option<&str> {
    payload.get("type").and_then(|t| t.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_response_uses_client_facing_names() {
        let resp = PublishResponse {
            status: PublishStatus::Duplicate,
            id: 2,
            client_id: "C1".into(),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "duplicate", "id": 2, "clientId": "C1"})
        );
    }

    #[test]
    fn check_access_response_field_name() {
        let json = serde_json::to_string(&CheckAccessResponse {
            access_granted: false,
        })
        .unwrap();
        assert_eq!(json, "{\"accessGranted\":false}");
    }

    #[test]
    fn upload_status_field_names() {
        let json = serde_json::to_value(&UploadStatusResponse {
            total_chunks: 4,
            received_chunks: 1,
            progress: 0.25,
            completed: false,
        })
        .unwrap();
        assert_eq!(json["totalChunks"], 4);
        assert_eq!(json["receivedChunks"], 1);
    }

    #[test]
    fn poll_body_is_a_plain_map() {
        let body: PollBody = serde_json::from_str("{\"admin\": 1, \"login\": 3}").unwrap();
        assert_eq!(body.get("admin"), Some(&1));
        assert_eq!(body.get("login"), Some(&3));
    }

    #[test]
    fn event_type_extraction() {
        let payload = serde_json::json!({"type": "ADD_USER", "username": "alice"});
        assert_eq!(event_type(&payload), Some("ADD_USER"));
        assert_eq!(event_type(&serde_json::json!({"username": "alice"})), None);
        assert_eq!(event_type(&serde_json::json!(42)), None);
    }

    #[test]
    fn dologin_response_defaults_user_id() {
        let resp: DoLoginResponse = serde_json::from_str("{\"success\": false}").unwrap();
        assert!(!resp.success);
        assert_eq!(resp.user_id, 0);
    }
}
