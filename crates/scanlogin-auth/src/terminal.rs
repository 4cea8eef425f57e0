//! Terminal rendering of the provider's QR-connect page

use crate::widget::{RenderRequest, Widget};
use async_trait::async_trait;
use qrcode::QrCode;
use scanlogin_core::{Error, ProviderParams, Result};
use serde_json::Value;
use std::io::Write;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

const QR_CONNECT_URL: &str = "https://open.weixin.qq.com/connect/qrconnect";

/// Build the QR-connect URL for one code
///
/// Provider parameters are forwarded as the config endpoint returned them,
/// only `state` is encoded here.
pub fn qr_connect_url(params: &ProviderParams, state: &str) -> String {
    let mut url = format!(
        "{}?appid={}&scope={}&redirect_uri={}&state={}&login_type=jssdk&self_redirect=true",
        QR_CONNECT_URL,
        param(params, "appid"),
        param(params, "scope"),
        param(params, "redirect_uri"),
        urlencoding::encode(state),
    );
    for key in ["styletype", "sizetype", "bgcolor", "rst"] {
        url.push_str(&format!("&{}={}", key, param(params, key)));
    }
    for key in ["style", "href"] {
        let value = param(params, key);
        if !value.is_empty() {
            url.push_str(&format!("&{}={}", key, value));
        }
    }
    if param(params, "lang") == "en" {
        url.push_str("&lang=en");
    }
    if params.get("stylelite").and_then(Value::as_i64) == Some(1) {
        url.push_str("&stylelite=1");
    }
    if params.get("fast_login").and_then(Value::as_i64) == Some(0) {
        url.push_str("&fast_login=0");
    }
    url
}

fn param(params: &ProviderParams, key: &str) -> String {
    match params.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Prints each code as a Unicode QR code
pub struct TerminalWidget {
    out: Mutex<Box<dyn Write + Send>>,
}

impl TerminalWidget {
    /// Widget writing to stdout
    pub fn new() -> Self {
        Self::with_writer(std::io::stdout())
    }

    pub fn with_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(writer)),
        }
    }

    fn write_lines(&self, lines: &str) -> std::io::Result<()> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        for line in lines.lines() {
            writeln!(out, "  {}", line)?;
        }
        out.flush()
    }
}

impl Default for TerminalWidget {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Widget for TerminalWidget {
    async fn load_script(&self) -> Result<()> {
        Ok(())
    }

    fn render(&self, request: &RenderRequest) -> Result<()> {
        let url = qr_connect_url(&request.params, &request.correlation_id);
        debug!("Rendering QR code for {}", url);

        let code = QrCode::new(url.as_bytes())
            .map_err(|e| Error::Render(format!("failed to encode QR code: {}", e)))?;

        // Unicode block characters, two columns per module to keep it square
        let image = code
            .render::<char>()
            .quiet_zone(true)
            .module_dimensions(2, 1)
            .build();

        let text = format!(
            "\n{}\nScan with your phone to log in ({}):\n{}\n",
            request.container_id, request.correlation_id, image
        );
        self.write_lines(&text)?;
        Ok(())
    }

    fn clear(&self, container_id: &str) {
        if let Err(e) = self.write_lines(&format!("-- {} --", container_id)) {
            warn!("Failed to clear {}: {}", container_id, e);
        }
    }
}
