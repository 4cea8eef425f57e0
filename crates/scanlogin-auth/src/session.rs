//! QR login session
//!
//! [`QrLogin`] owns one live login code at a time: it mints it through the
//! config endpoint, hands it to the [`Widget`], keeps it fresh before the
//! provider expires it, and drives a [`PollEngine`] until the user confirms.
//!
//! ```text
//! Idle -> ScriptLoading -> CodeMinting -> Polling -> Resolved | Rejected
//!                               ^            |
//!                               +- expiry ---+
//! ```
//!
//! `Destroyed` is reachable from every phase and is final.

use crate::engine::{CodeRenewer, PollEngine, PollStart, StatusSource};
use crate::script::ScriptLoader;
use crate::widget::{RenderRequest, Widget};
use async_trait::async_trait;
use chrono::Utc;
use scanlogin_client::{ApiClient, Transport};
use scanlogin_core::{
    AuthConfig, AuthEvent, Error, Phase, PollStatusResponse, Result, SessionStatus, UserInfo,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

#[async_trait]
impl StatusSource for ApiClient {
    type Output = UserInfo;

    async fn query_status(&self, correlation_id: &str) -> Result<PollStatusResponse> {
        ApiClient::query_status(self, correlation_id).await
    }

    async fn exchange_code(&self, code: &str) -> Result<UserInfo> {
        ApiClient::exchange_code(self, code).await
    }
}

/// What asked for a new code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshTrigger {
    Manual,
    Expiry,
}

/// QR code login session
///
/// Dropping the session destroys it.
pub struct QrLogin {
    inner: Arc<Inner>,
}

struct Inner {
    me: Weak<Inner>,
    config: AuthConfig,
    widget: Arc<dyn Widget>,
    script: ScriptLoader,
    engine: Arc<PollEngine<ApiClient>>,
    events: broadcast::Sender<AuthEvent>,
    phase: Mutex<Phase>,
    mint_lock: tokio::sync::Mutex<()>,
    refreshing: AtomicBool,
    expiry_timer: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl QrLogin {
    /// Create a session
    ///
    /// With `auto_start` the script is loaded and the first code minted in the
    /// background, which needs a running Tokio runtime.
    pub fn new(
        config: AuthConfig,
        transport: Arc<dyn Transport>,
        widget: Arc<dyn Widget>,
        script: ScriptLoader,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = if config.auto_start {
            Some(tokio::runtime::Handle::try_current().map_err(|_| {
                Error::Config("auto_start needs a running Tokio runtime".to_string())
            })?)
        } else {
            None
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let api = ApiClient::new(transport, config.routes.clone());
        let engine = Arc::new(PollEngine::new(
            api,
            config.poll.clone(),
            config.backoff.clone(),
            events.clone(),
        ));

        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            config,
            widget,
            script,
            engine,
            events,
            phase: Mutex::new(Phase::Idle),
            mint_lock: tokio::sync::Mutex::new(()),
            refreshing: AtomicBool::new(false),
            expiry_timer: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        if let Some(runtime) = runtime {
            let weak = Arc::downgrade(&inner);
            runtime.spawn(async move {
                let Some(inner) = weak.upgrade() else { return };
                if let Err(e) = inner.prepare().await {
                    if !e.is_cancellation() {
                        warn!("Background preparation failed: {}", e);
                        inner.emit(AuthEvent::Error {
                            message: e.to_string(),
                        });
                    }
                }
            });
        }

        info!("QR login session created for '{}'", inner.config.container_id);
        Ok(Self { inner })
    }

    /// Load the script and make sure a code is on screen
    pub async fn prepare(&self) -> Result<()> {
        self.inner.prepare().await
    }

    /// Wait for the user to scan and confirm
    ///
    /// Only one login can be outstanding. Dropping the returned future
    /// abandons the attempt.
    pub async fn login(&self) -> Result<UserInfo> {
        self.inner.login().await
    }

    /// Replace the current code with a new one
    ///
    /// A no-op while another refresh is running. Polling resumes if it was
    /// running or a login is still waiting.
    pub async fn refresh_code(&self) -> Result<()> {
        self.inner.refresh(RefreshTrigger::Manual).await
    }

    /// Stop polling without settling the outstanding login
    ///
    /// The login keeps waiting; `refresh_code` resumes it.
    pub fn cancel_login(&self) -> Result<bool> {
        self.inner.ensure_alive()?;
        let stopped = self.inner.engine.stop_polling();
        if stopped {
            self.inner.set_phase(Phase::Idle);
        }
        Ok(stopped)
    }

    /// Tear the session down; returns false if it already was
    pub fn destroy(&self) -> bool {
        self.inner.destroy()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.engine.status()
    }

    pub fn correlation_id(&self) -> Option<String> {
        self.inner.engine.correlation_id()
    }

    pub fn phase(&self) -> Phase {
        *self.inner.lock_phase()
    }
}

impl Drop for QrLogin {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

/// Clears the refreshing flag when a refresh ends, however it ends
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Abandons the login attempt unless defused
struct AttemptGuard<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.engine.abandon();
            if !self.inner.engine.is_destroyed() {
                self.inner.set_phase(Phase::Idle);
            }
        }
    }
}

/// Hands in-run renewals back to the session without keeping it alive
struct SessionRenewer(Weak<Inner>);

#[async_trait]
impl CodeRenewer for SessionRenewer {
    async fn renew_code(&self) -> Result<()> {
        let inner = self.0.upgrade().ok_or(Error::InstanceDestroyed)?;
        inner.mint_code(true).await
    }
}

impl Inner {
    fn ensure_alive(&self) -> Result<()> {
        if self.engine.is_destroyed() {
            Err(Error::InstanceDestroyed)
        } else {
            Ok(())
        }
    }

    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: Phase) {
        {
            let mut current = self.lock_phase();
            if *current == phase || *current == Phase::Destroyed {
                return;
            }
            *current = phase;
        }
        debug!("Session phase: {:?}", phase);
        self.emit(AuthEvent::PhaseChanged { phase });
    }

    fn emit(&self, event: AuthEvent) {
        let _ = self.events.send(event);
    }

    async fn prepare(&self) -> Result<()> {
        self.ensure_alive()?;

        if !self.script.is_loaded() {
            self.set_phase(Phase::ScriptLoading);
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Error::InstanceDestroyed),
                loaded = self.script.ensure_loaded(self.widget.as_ref()) => loaded?,
            }
        }

        self.mint_code(false).await
    }

    async fn login(&self) -> Result<UserInfo> {
        self.ensure_alive()?;
        let receiver = self.engine.arm()?;
        let mut attempt = AttemptGuard {
            inner: self,
            armed: true,
        };

        self.prepare().await?;
        self.start_polling()?;

        let result = receiver.await.unwrap_or(Err(Error::Cancelled));
        attempt.armed = false;

        self.cancel_expiry_timer();
        match &result {
            Ok(user) => {
                info!(
                    "Login confirmed for {}",
                    user.nickname.as_deref().unwrap_or("unknown user")
                );
                self.set_phase(Phase::Resolved);
            }
            Err(e) => {
                warn!("Login did not complete: {}", e);
                self.set_phase(Phase::Rejected);
            }
        }
        result
    }

    fn start_polling(&self) -> Result<PollStart> {
        let renewer = Arc::new(SessionRenewer(self.me.clone()));
        let started = self.engine.start_polling(renewer)?;
        self.set_phase(Phase::Polling);
        Ok(started)
    }

    /// Resume an interrupted run, minting the missing code inside it
    fn resume_renewing(&self) -> Result<PollStart> {
        let renewer = Arc::new(SessionRenewer(self.me.clone()));
        let started = self.engine.start_renewing(renewer)?;
        self.set_phase(Phase::Polling);
        Ok(started)
    }

    /// Mint a code, publish it and render it
    ///
    /// Without `force` an already published code is kept.
    async fn mint_code(&self, force: bool) -> Result<()> {
        let _serialized = self.mint_lock.lock().await;
        self.ensure_alive()?;
        if !force && self.engine.correlation_id().is_some() {
            return Ok(());
        }

        self.set_phase(Phase::CodeMinting);
        self.cancel_expiry_timer();
        self.engine.clear_correlation_id();
        self.widget.clear(&self.config.container_id);

        let minted = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(Error::InstanceDestroyed),
            minted = self.engine.source().fetch_provider_config() => minted?,
        };
        self.ensure_alive()?;

        let request = RenderRequest {
            container_id: self.config.container_id.clone(),
            correlation_id: minted.correlation_id.clone(),
            params: minted.params,
        };
        self.widget.render(&request)?;
        self.engine.set_correlation_id(minted.correlation_id.clone());

        let lifetime = self.config.poll.code_lifetime();
        self.arm_expiry_timer(lifetime);
        let issued_at = Utc::now();
        let expires_at = issued_at + chrono::Duration::milliseconds(lifetime.as_millis() as i64);
        info!(
            "New login code {} valid for {:?}",
            minted.correlation_id, lifetime
        );
        self.emit(AuthEvent::CodeRefreshed {
            correlation_id: minted.correlation_id,
            issued_at,
            expires_at,
        });

        if self.engine.is_polling() || self.engine.has_pending() {
            self.set_phase(Phase::Polling);
        } else {
            self.set_phase(Phase::Idle);
        }
        Ok(())
    }

    fn refresh(
        &self,
        trigger: RefreshTrigger,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_alive()?;
            if self.refreshing.swap(true, Ordering::SeqCst) {
                debug!("Refresh already in progress, skipping {:?} refresh", trigger);
                return Ok(());
            }
            let _refreshing = RefreshGuard(&self.refreshing);

            let was_polling = self.engine.stop_polling();
            info!("Refreshing login code ({:?})", trigger);

            if let Err(e) = self.mint_code(true).await {
                if e.is_cancellation() {
                    return Err(e);
                }
                warn!("Failed to refresh login code: {}", e);
                self.emit(AuthEvent::Error {
                    message: e.to_string(),
                });

                // A hiccup while replacing an expiring code is retried like
                // any other: inside the interrupted run, bounded by its retry
                // ceiling, or by the timer when nothing is polling.
                if trigger == RefreshTrigger::Expiry && e.is_retryable() {
                    if was_polling {
                        self.resume_renewing()?;
                    } else {
                        self.set_phase(Phase::Idle);
                        self.arm_expiry_timer(self.config.poll.error_retry_interval);
                    }
                } else {
                    self.engine.reject(e.clone());
                }
                return Err(e);
            }

            let resume =
                was_polling || (trigger == RefreshTrigger::Manual && self.engine.has_pending());
            if resume {
                self.start_polling()?;
            }
            Ok(())
        })
    }

    /// Schedule an expiry refresh `after` from now, replacing any pending one
    fn arm_expiry_timer(&self, after: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self.lock_timer().replace(token.clone()) {
            previous.cancel();
        }

        let weak = self.me.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(after) => {}
            }
            let Some(inner) = weak.upgrade() else { return };
            debug!("Login code expired on screen");
            if let Err(e) = inner.refresh(RefreshTrigger::Expiry).await {
                warn!("Expiry refresh failed: {}", e);
            }
        });
    }

    fn cancel_expiry_timer(&self) {
        if let Some(token) = self.lock_timer().take() {
            token.cancel();
        }
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.expiry_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn destroy(&self) -> bool {
        if !self.engine.destroy() {
            return false;
        }
        self.shutdown.cancel();
        self.cancel_expiry_timer();
        self.widget.clear(&self.config.container_id);
        self.set_phase(Phase::Destroyed);
        info!("QR login session for '{}' destroyed", self.config.container_id);
        true
    }
}
