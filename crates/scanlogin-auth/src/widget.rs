//! Rendering seam for the provider's login widget

use async_trait::async_trait;
use scanlogin_core::{ProviderParams, Result};

/// Everything a widget needs to draw one code
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    /// Where to draw
    pub container_id: String,
    /// Passed to the provider as the `state` parameter
    pub correlation_id: String,
    /// Provider parameters returned by the config endpoint, forwarded verbatim
    pub params: ProviderParams,
}

/// A provider widget able to display a scannable code
#[async_trait]
pub trait Widget: Send + Sync {
    /// Load whatever the widget needs before it can render
    ///
    /// Called at most once per [`ScriptLoader`](crate::ScriptLoader) unless it fails.
    async fn load_script(&self) -> Result<()>;

    /// Draw the code described by `request` into its container
    fn render(&self, request: &RenderRequest) -> Result<()>;

    /// Remove whatever is drawn in `container_id`
    fn clear(&self, container_id: &str);
}
