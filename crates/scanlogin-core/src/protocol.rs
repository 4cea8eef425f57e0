//! Wire types exchanged with the login backend, and the events and snapshots
//! a session publishes to its owner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Header carrying the correlation id on backend responses
pub const CORRELATION_HEADER: &str = "X-Trace-Id";

/// Server-reported login status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "StatusRepr", into = "u8")]
pub enum LoginStatus {
    /// Waiting for the user to scan
    Pending,
    /// Scanned, waiting for confirmation on the phone
    Scanned,
    /// Confirmed; the response carries an authorization code
    Success,
    /// The code expired on the provider side
    Expired,
    /// The user declined or the provider rejected the login
    Failed,
}

impl LoginStatus {
    pub fn code(&self) -> u8 {
        match self {
            LoginStatus::Pending => 0,
            LoginStatus::Scanned => 1,
            LoginStatus::Success => 2,
            LoginStatus::Expired => 3,
            LoginStatus::Failed => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoginStatus::Pending => "pending",
            LoginStatus::Scanned => "scanned",
            LoginStatus::Success => "success",
            LoginStatus::Expired => "expired",
            LoginStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for LoginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for LoginStatus {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        match code {
            0 => Ok(LoginStatus::Pending),
            1 => Ok(LoginStatus::Scanned),
            2 => Ok(LoginStatus::Success),
            3 => Ok(LoginStatus::Expired),
            4 => Ok(LoginStatus::Failed),
            other => Err(format!("Unknown login status code: {}", other)),
        }
    }
}

impl std::str::FromStr for LoginStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(LoginStatus::Pending),
            "scanned" => Ok(LoginStatus::Scanned),
            "success" => Ok(LoginStatus::Success),
            "expired" => Ok(LoginStatus::Expired),
            "failed" => Ok(LoginStatus::Failed),
            _ => Err(format!("Unknown login status: {}", s)),
        }
    }
}

impl From<LoginStatus> for u8 {
    fn from(status: LoginStatus) -> Self {
        status.code()
    }
}

/// Backends encode the status either as its numeric code or by name
#[derive(Deserialize)]
#[serde(untagged)]
enum StatusRepr {
    Code(u8),
    Name(String),
}

impl TryFrom<StatusRepr> for LoginStatus {
    type Error = String;

    fn try_from(repr: StatusRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            StatusRepr::Code(code) => LoginStatus::try_from(code),
            StatusRepr::Name(name) => name.parse(),
        }
    }
}

/// Payload of `GET status/{correlation_id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollStatusResponse {
    pub status: LoginStatus,
    /// Authorization code, present on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human readable reason, usually present on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PollStatusResponse {
    pub fn new(status: LoginStatus) -> Self {
        Self {
            status,
            code: None,
            message: None,
        }
    }

    pub fn success(code: impl Into<String>) -> Self {
        Self {
            status: LoginStatus::Success,
            code: Some(code.into()),
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: LoginStatus::Failed,
            code: None,
            message: Some(message.into()),
        }
    }
}

/// Uniform envelope every backend endpoint responds with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
}

/// Provider-specific rendering parameters returned by the config endpoint
pub type ProviderParams = Map<String, Value>;

/// Profile returned by the code exchange endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unionid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sex: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headimgurl: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub privilege: Vec<String>,
    /// Anything else the backend chose to include
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Controller lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    ScriptLoading,
    CodeMinting,
    Polling,
    Resolved,
    Rejected,
    Destroyed,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Status checks made in the current run
    pub retries: u32,
    /// Currently live correlation id
    pub correlation_id: Option<String>,
    /// Whether a poll run is in flight
    pub polling: bool,
    /// Whether the session has been torn down
    pub destroyed: bool,
}

/// Notifications published by a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthEvent {
    /// A status response arrived
    StatusChanged { status: LoginStatus },
    /// A fresh code was rendered
    CodeRefreshed {
        correlation_id: String,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    /// Something went wrong; polling may still continue
    Error { message: String },
    /// The controller moved to another phase
    PhaseChanged { phase: Phase },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_from_code_and_name() {
        let response: PollStatusResponse = serde_json::from_value(json!({"status": 1})).unwrap();
        assert_eq!(response.status, LoginStatus::Scanned);

        let response: PollStatusResponse =
            serde_json::from_value(json!({"status": "SUCCESS", "code": "abc"})).unwrap();
        assert_eq!(response.status, LoginStatus::Success);
        assert_eq!(response.code.as_deref(), Some("abc"));

        assert!(serde_json::from_value::<PollStatusResponse>(json!({"status": 9})).is_err());
        assert!(serde_json::from_value::<PollStatusResponse>(json!({"status": "gone"})).is_err());
    }

    #[test]
    fn test_status_serializes_as_code() {
        let value = serde_json::to_value(PollStatusResponse::failed("denied")).unwrap();
        assert_eq!(value, json!({"status": 4, "message": "denied"}));
    }

    #[test]
    fn test_envelope_without_data() {
        let envelope: ApiEnvelope<Value> =
            serde_json::from_value(json!({"success": false, "message": "bad appid"})).unwrap();
        assert!(!envelope.success);
        assert!(envelope.data.is_none());
        assert_eq!(envelope.message.as_deref(), Some("bad appid"));
    }

    #[test]
    fn test_typed_envelope() {
        let envelope: ApiEnvelope<PollStatusResponse> =
            serde_json::from_value(json!({"success": true, "data": {"status": 0}})).unwrap();
        assert_eq!(envelope.data, Some(PollStatusResponse::new(LoginStatus::Pending)));

        let envelope: ApiEnvelope<PollStatusResponse> =
            serde_json::from_value(json!({"success": false, "code": 40029})).unwrap();
        assert!(envelope.data.is_none());
        assert!(envelope.message.is_none());
    }

    #[test]
    fn test_user_info_keeps_unknown_fields() {
        let info: UserInfo = serde_json::from_value(json!({
            "openid": "o-123",
            "nickname": "Ada",
            "privilege": [],
            "language": "en"
        }))
        .unwrap();
        assert_eq!(info.openid.as_deref(), Some("o-123"));
        assert_eq!(info.nickname.as_deref(), Some("Ada"));
        assert_eq!(info.extra.get("language"), Some(&json!("en")));
    }

    #[test]
    fn test_event_tagging() {
        let value = serde_json::to_value(AuthEvent::StatusChanged {
            status: LoginStatus::Scanned,
        })
        .unwrap();
        assert_eq!(value, json!({"type": "status_changed", "status": 1}));
    }
}
