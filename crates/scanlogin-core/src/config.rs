//! Configuration types for scanlogin

use crate::backoff::BackoffPolicy;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default backend serving the config/status/code2info endpoints
pub const DEFAULT_BASE_URL: &str = "https://auth.mocknet.cn";

/// Serde helper storing a `Duration` as whole milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Paths of the three backend endpoints, relative to the base URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiRoutes {
    /// Returns provider rendering parameters and a fresh correlation id
    pub config: String,
    /// Exchanges an authorization code for the user's profile
    pub code2info: String,
    /// Long-poll status endpoint, the correlation id is appended as a path segment
    pub status: String,
}

impl Default for ApiRoutes {
    fn default() -> Self {
        Self {
            config: "/auth/wx/config".to_string(),
            code2info: "/auth/wx/code2info".to_string(),
            status: "/auth/wx/status".to_string(),
        }
    }
}

/// Timing and retry limits of the poll loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Status checks allowed per code before giving up
    pub max_retries: u32,
    /// Longest time the backend may hold a single status request
    #[serde(with = "duration_ms")]
    pub max_wait: Duration,
    /// Lifetime the identity provider grants a rendered code
    #[serde(with = "duration_ms")]
    pub provider_code_lifetime: Duration,
    /// Taken off the provider lifetime so codes are replaced before they die
    #[serde(with = "duration_ms")]
    pub safety_margin: Duration,
    /// How long to wait for a correlation id before failing a run
    #[serde(with = "duration_ms")]
    pub correlation_id_timeout: Duration,
    /// Pause after a failed status check
    #[serde(with = "duration_ms")]
    pub error_retry_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_retries: 13,
            max_wait: Duration::from_secs(25),
            provider_code_lifetime: Duration::from_secs(5 * 60),
            safety_margin: Duration::from_secs(10),
            correlation_id_timeout: Duration::from_secs(60),
            error_retry_interval: Duration::from_secs(2),
        }
    }
}

impl PollConfig {
    /// Effective lifetime of a code on our side
    pub fn code_lifetime(&self) -> Duration {
        self.provider_code_lifetime.saturating_sub(self.safety_margin)
    }
}

/// Main configuration for a login session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Where the identity provider widget renders the code
    pub container_id: String,
    /// Backend base URL
    pub base_url: String,
    /// Extra headers sent with every backend request
    pub headers: BTreeMap<String, String>,
    /// Load the provider script and mint the first code at construction
    pub auto_start: bool,
    /// Backend endpoint paths
    pub routes: ApiRoutes,
    /// Poll loop limits
    pub poll: PollConfig,
    /// Interval between status checks
    pub backoff: BackoffPolicy,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            container_id: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            headers: BTreeMap::new(),
            auto_start: true,
            routes: ApiRoutes::default(),
            poll: PollConfig::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl AuthConfig {
    /// Create a configuration rendering into `container_id`, all else default
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            ..Self::default()
        }
    }

    /// Load a JSON configuration file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: AuthConfig = serde_json::from_str(&contents)?;
        tracing::debug!("Loaded auth configuration from {:?}", path.as_ref());
        Ok(config)
    }

    /// Builder pattern: set container id
    pub fn with_container(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = container_id.into();
        self
    }

    /// Builder pattern: set base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Builder pattern: add a request header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Builder pattern: set auto start
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Builder pattern: set endpoint routes
    pub fn with_routes(mut self, routes: ApiRoutes) -> Self {
        self.routes = routes;
        self
    }

    /// Builder pattern: set poll limits
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Builder pattern: set retry ceiling
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.poll.max_retries = max_retries;
        self
    }

    /// Builder pattern: set backoff policy
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Check required fields and timing consistency
    pub fn validate(&self) -> Result<()> {
        if self.container_id.trim().is_empty() {
            return Err(Error::Config("container id is required".to_string()));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "base URL must be http(s): {}",
                self.base_url
            )));
        }
        for (name, route) in [
            ("config", &self.routes.config),
            ("code2info", &self.routes.code2info),
            ("status", &self.routes.status),
        ] {
            if !route.starts_with('/') {
                return Err(Error::Config(format!(
                    "{} route must start with '/': {}",
                    name, route
                )));
            }
        }
        if self.poll.code_lifetime() <= self.poll.max_wait {
            return Err(Error::Config(format!(
                "code lifetime {:?} leaves no room for a {:?} long poll",
                self.poll.code_lifetime(),
                self.poll.max_wait
            )));
        }
        Ok(())
    }

    /// Join a route onto the base URL
    pub fn endpoint(&self, route: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AuthConfig::new("login_container");
        assert!(config.auto_start);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.poll.max_retries, 13);
        assert_eq!(config.poll.code_lifetime(), Duration::from_secs(290));
        assert_eq!(config.routes.status, "/auth/wx/status");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_requires_container() {
        let err = AuthConfig::default().validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_short_lifetime() {
        let poll = PollConfig {
            provider_code_lifetime: Duration::from_secs(30),
            ..PollConfig::default()
        };
        let config = AuthConfig::new("c").with_poll(poll);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_route_and_url() {
        let routes = ApiRoutes {
            status: "status".to_string(),
            ..ApiRoutes::default()
        };
        assert!(AuthConfig::new("c").with_routes(routes).validate().is_err());
        assert!(AuthConfig::new("c")
            .with_base_url("ftp://example.com")
            .validate()
            .is_err());
    }

    #[test]
    fn test_endpoint_join() {
        let config = AuthConfig::new("c").with_base_url("https://auth.example.com/");
        assert_eq!(
            config.endpoint("/auth/wx/config"),
            "https://auth.example.com/auth/wx/config"
        );
    }

    #[test]
    fn test_builder() {
        let config = AuthConfig::new("a")
            .with_container("b")
            .with_header("datasource", "custom")
            .with_auto_start(false)
            .with_max_retries(300);
        assert_eq!(config.container_id, "b");
        assert_eq!(config.headers.get("datasource").map(String::as_str), Some("custom"));
        assert!(!config.auto_start);
        assert_eq!(config.poll.max_retries, 300);
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"container_id":"qr","poll":{{"max_retries":5,"max_wait":10000}},"routes":{{"status":"/v2/status"}}}}"#
        )
        .unwrap();

        let config = AuthConfig::from_file(file.path()).unwrap();
        assert_eq!(config.container_id, "qr");
        assert_eq!(config.poll.max_retries, 5);
        assert_eq!(config.poll.max_wait, Duration::from_secs(10));
        assert_eq!(config.poll.safety_margin, Duration::from_secs(10));
        assert_eq!(config.routes.status, "/v2/status");
        assert_eq!(config.routes.config, "/auth/wx/config");
        assert!(config.auto_start);
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = AuthConfig::from_file(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
