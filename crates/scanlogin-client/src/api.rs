//! Typed calls against the login backend
//!
//! All three endpoints answer with the same `{ success, data, message }`
//! envelope. A non-2xx status is a transport failure; a well-formed envelope
//! with `success: false` is a protocol failure. Both are retryable.

use crate::transport::{ApiRequest, ApiResponse, Transport};
use scanlogin_core::{
    ApiEnvelope, ApiRoutes, Error, PollStatusResponse, ProviderParams, Result, UserInfo,
    CORRELATION_HEADER,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

/// A freshly minted login code
#[derive(Debug, Clone, PartialEq)]
pub struct MintedCode {
    /// Server-side key for the code, used to poll its status
    pub correlation_id: String,
    /// Parameters the provider widget needs to render it
    pub params: ProviderParams,
}

/// Client for the config, status and code2info endpoints
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    routes: ApiRoutes,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, routes: ApiRoutes) -> Self {
        Self { transport, routes }
    }

    /// Request rendering parameters for a new code
    ///
    /// The correlation id for the code travels in the response header, so a
    /// response without it cannot be used.
    pub async fn fetch_provider_config(&self) -> Result<MintedCode> {
        let response = self.transport.send(ApiRequest::get(&self.routes.config)).await?;
        let correlation_id = response.correlation_id.clone();
        let params: ProviderParams = unwrap_envelope(response)?;
        let correlation_id = correlation_id.ok_or_else(|| {
            Error::protocol(format!(
                "config response carried no {} header, the backend must forward it",
                CORRELATION_HEADER
            ))
        })?;
        debug!("Minted code with correlation id {}", correlation_id);
        Ok(MintedCode {
            correlation_id,
            params,
        })
    }

    /// Long-poll the status of the code bound to `correlation_id`
    pub async fn query_status(&self, correlation_id: &str) -> Result<PollStatusResponse> {
        let path = format!(
            "{}/{}",
            self.routes.status.trim_end_matches('/'),
            urlencoding::encode(correlation_id)
        );
        let response = self.transport.send(ApiRequest::get(path)).await?;
        unwrap_envelope(response)
    }

    /// Exchange an authorization code for the user's profile
    pub async fn exchange_code(&self, code: &str) -> Result<UserInfo> {
        let request = ApiRequest::get(&self.routes.code2info).with_query("code", code);
        let response = self.transport.send(request).await?;
        unwrap_envelope(response)
    }
}

fn unwrap_envelope<T: DeserializeOwned>(response: ApiResponse) -> Result<T> {
    if !response.is_success() {
        return Err(Error::transport(format!("HTTP {}", response.status)));
    }
    let envelope: ApiEnvelope<T> = serde_json::from_value(response.body)?;
    if !envelope.success {
        return Err(Error::protocol(
            envelope
                .message
                .unwrap_or_else(|| "API request failed".to_string()),
        ));
    }
    envelope
        .data
        .ok_or_else(|| Error::protocol("response envelope carried no data"))
}
