//! One-time loading of the provider widget script
//!
//! Every session that shares a [`ScriptLoader`] shares its load: concurrent
//! callers wait on the same attempt, and a finished load is never repeated.
//! A failed load is not remembered, so the next caller tries again.

use crate::widget::Widget;
use scanlogin_core::Result;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Shared handle to the script load state
#[derive(Clone, Default)]
pub struct ScriptLoader {
    loaded: Arc<OnceCell<()>>,
}

impl ScriptLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }

    /// Load the script through `widget` unless it is already loaded
    pub async fn ensure_loaded(&self, widget: &dyn Widget) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }

        self.loaded
            .get_or_try_init(|| async {
                debug!("Loading provider script");
                match widget.load_script().await {
                    Ok(()) => {
                        info!("Provider script loaded");
                        Ok(())
                    }
                    Err(e) => {
                        warn!("Provider script failed to load: {}", e);
                        Err(e)
                    }
                }
            })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::widget::RenderRequest;
    use async_trait::async_trait;
    use scanlogin_core::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingWidget {
        loads: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl Widget for CountingWidget {
        async fn load_script(&self) -> Result<()> {
            let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail_first && attempt == 0 {
                return Err(Error::ScriptLoad("network unreachable".into()));
            }
            Ok(())
        }

        fn render(&self, _request: &RenderRequest) -> Result<()> {
            Ok(())
        }

        fn clear(&self, _container_id: &str) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_loads_share_one_attempt() {
        let widget = CountingWidget::default();
        let loader = ScriptLoader::new();
        let other = loader.clone();

        let (a, b) = tokio::join!(loader.ensure_loaded(&widget), other.ensure_loaded(&widget));
        assert!(a.is_ok() && b.is_ok());
        assert!(loader.is_loaded());
        assert!(other.is_loaded());

        loader.ensure_loaded(&widget).await.unwrap();
        assert_eq!(widget.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_load_is_retried() {
        let widget = CountingWidget {
            fail_first: true,
            ..CountingWidget::default()
        };
        let loader = ScriptLoader::new();

        let err = loader.ensure_loaded(&widget).await.unwrap_err();
        assert!(matches!(err, Error::ScriptLoad(_)));
        assert!(!loader.is_loaded());

        loader.ensure_loaded(&widget).await.unwrap();
        assert!(loader.is_loaded());
        assert_eq!(widget.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_separate_loaders_load_separately() {
        let widget = CountingWidget::default();
        ScriptLoader::new().ensure_loaded(&widget).await.unwrap();
        ScriptLoader::new().ensure_loaded(&widget).await.unwrap();
        assert_eq!(widget.loads.load(Ordering::SeqCst), 2);
    }
}
