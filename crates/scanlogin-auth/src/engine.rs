//! Long-poll engine
//!
//! Drives status checks against a correlation id until the backend reports a
//! terminal status, the retry ceiling is reached, or the run is cancelled:
//!
//! 1. Wait for a correlation id to be published (bounded)
//! 2. Before each check, give up if the retry ceiling is reached, or hand over
//!    to the [`CodeRenewer`] if the next long poll could outlive the code
//! 3. Query, then settle on `Success`/`Failed` or back off and loop
//!
//! Only one run is active at a time. Its outcome goes to the pending result
//! armed by the caller, which is written at most once.

use async_trait::async_trait;
use scanlogin_core::{
    AuthEvent, BackoffPolicy, Error, LoginStatus, PollConfig, PollStatusResponse, Result,
    SessionStatus,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where status checks go
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    /// What a successful login resolves to
    type Output: Send + 'static;

    /// One (possibly long-held) status check
    async fn query_status(&self, correlation_id: &str) -> Result<PollStatusResponse>;

    /// Turn the authorization code from a `Success` status into the final output
    async fn exchange_code(&self, code: &str) -> Result<Self::Output>;
}

/// Replaces a code that is about to expire
///
/// Implementations publish the new correlation id through
/// [`PollEngine::set_correlation_id`] before returning.
#[async_trait]
pub trait CodeRenewer: Send + Sync {
    async fn renew_code(&self) -> Result<()>;
}

/// What `start_polling` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStart {
    /// A new run was spawned
    Started,
    /// A run was already in flight; its outcome reaches the same pending result
    Joined,
}

/// Write-once slot for the outcome of a login attempt
pub struct PendingResult<T> {
    sender: Option<oneshot::Sender<Result<T>>>,
}

impl<T> Default for PendingResult<T> {
    fn default() -> Self {
        Self { sender: None }
    }
}

impl<T> PendingResult<T> {
    /// Register a new waiter
    ///
    /// Fails while another waiter is still listening. A waiter that went away
    /// without receiving anything does not block a new one.
    pub fn arm(&mut self) -> Result<oneshot::Receiver<Result<T>>> {
        if self.is_armed() {
            return Err(Error::AlreadyInProgress);
        }
        let (sender, receiver) = oneshot::channel();
        self.sender = Some(sender);
        Ok(receiver)
    }

    /// Whether a live waiter is registered
    pub fn is_armed(&self) -> bool {
        self.sender
            .as_ref()
            .map_or(false, |sender| !sender.is_closed())
    }

    /// Deliver the outcome; returns false if nobody was waiting
    pub fn settle(&mut self, result: Result<T>) -> bool {
        match self.sender.take() {
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        }
    }

    /// Forget the waiter without delivering anything
    pub fn disarm(&mut self) {
        self.sender = None;
    }
}

struct ActiveRun {
    generation: u64,
    cancel: CancellationToken,
}

struct PollState<T> {
    retries: u32,
    poll_started_at: Instant,
    destroyed: bool,
    active: Option<ActiveRun>,
    pending: PendingResult<T>,
    generations: u64,
}

/// Single-flight long-poll driver
pub struct PollEngine<S: StatusSource> {
    source: S,
    config: PollConfig,
    backoff: BackoffPolicy,
    state: Mutex<PollState<S::Output>>,
    correlation: watch::Sender<Option<String>>,
    events: broadcast::Sender<AuthEvent>,
}

enum Step<T> {
    Continue,
    Exit(Option<Result<T>>),
}

impl<S: StatusSource> PollEngine<S> {
    pub fn new(
        source: S,
        config: PollConfig,
        backoff: BackoffPolicy,
        events: broadcast::Sender<AuthEvent>,
    ) -> Self {
        let (correlation, _) = watch::channel(None);
        Self {
            source,
            config,
            backoff,
            state: Mutex::new(PollState {
                retries: 0,
                poll_started_at: Instant::now(),
                destroyed: false,
                active: None,
                pending: PendingResult::default(),
                generations: 0,
            }),
            correlation,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PollState<S::Output>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    pub fn is_polling(&self) -> bool {
        self.lock().active.is_some()
    }

    /// Whether a login attempt is waiting for an outcome
    pub fn has_pending(&self) -> bool {
        self.lock().pending.is_armed()
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.lock();
        SessionStatus {
            retries: state.retries,
            correlation_id: self.correlation.borrow().clone(),
            polling: state.active.is_some(),
            destroyed: state.destroyed,
        }
    }

    pub fn correlation_id(&self) -> Option<String> {
        self.correlation.borrow().clone()
    }

    /// Publish the id of a freshly minted code; resets the retry count
    pub fn set_correlation_id(&self, correlation_id: String) {
        self.lock().retries = 0;
        self.correlation.send_replace(Some(correlation_id));
    }

    pub fn clear_correlation_id(&self) {
        self.correlation.send_replace(None);
    }

    /// Register the caller waiting for the next outcome
    pub fn arm(&self) -> Result<oneshot::Receiver<Result<S::Output>>> {
        let mut state = self.lock();
        if state.destroyed {
            return Err(Error::InstanceDestroyed);
        }
        state.pending.arm()
    }

    /// Reject the waiting caller, if any
    pub fn reject(&self, error: Error) -> bool {
        self.lock().pending.settle(Err(error))
    }

    /// The waiting caller gave up: stop polling and forget it
    pub fn abandon(&self) {
        self.stop_polling();
        self.lock().pending.disarm();
        debug!("Login attempt abandoned by its caller");
    }

    /// Start a run unless one is already in flight
    pub fn start_polling(self: &Arc<Self>, renewer: Arc<dyn CodeRenewer>) -> Result<PollStart> {
        self.spawn_run(renewer, false)
    }

    /// Start a run whose first step is renewing the code
    ///
    /// Used when a code could not be replaced outside a run: renewal failures
    /// then count against the retry ceiling like any other hiccup.
    pub fn start_renewing(self: &Arc<Self>, renewer: Arc<dyn CodeRenewer>) -> Result<PollStart> {
        self.spawn_run(renewer, true)
    }

    fn spawn_run(
        self: &Arc<Self>,
        renewer: Arc<dyn CodeRenewer>,
        renew_first: bool,
    ) -> Result<PollStart> {
        let mut state = self.lock();
        if state.destroyed {
            return Err(Error::InstanceDestroyed);
        }
        if state.active.is_some() {
            debug!("Poll run already in flight, joining it");
            return Ok(PollStart::Joined);
        }

        state.generations += 1;
        let generation = state.generations;
        let cancel = CancellationToken::new();
        state.active = Some(ActiveRun {
            generation,
            cancel: cancel.clone(),
        });
        state.poll_started_at = Instant::now();
        drop(state);

        tokio::spawn(self.clone().run(generation, cancel, renewer, renew_first));
        Ok(PollStart::Started)
    }

    /// Cancel the active run without settling anything
    pub fn stop_polling(&self) -> bool {
        let run = self.lock().active.take();
        match run {
            Some(run) => {
                info!("Stopping poll run {}", run.generation);
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Tear down for good; rejects the waiting caller with `InstanceDestroyed`
    ///
    /// Returns false if the engine was already destroyed.
    pub fn destroy(&self) -> bool {
        let (run, mut pending) = {
            let mut state = self.lock();
            if state.destroyed {
                return false;
            }
            state.destroyed = true;
            (state.active.take(), std::mem::take(&mut state.pending))
        };

        if let Some(run) = run {
            run.cancel.cancel();
        }
        self.correlation.send_replace(None);
        if pending.settle(Err(Error::InstanceDestroyed)) {
            debug!("Rejected outstanding login on destroy");
        }
        true
    }

    /// Wait until a correlation id is published
    pub async fn wait_for_correlation_id(&self, cancel: &CancellationToken) -> Result<String> {
        if self.is_destroyed() {
            return Err(Error::InstanceDestroyed);
        }

        let timeout = self.config.correlation_id_timeout;
        let mut receiver = self.correlation.subscribe();
        let published = async move {
            let id = receiver.wait_for(|id| id.is_some()).await?.clone();
            Ok::<_, watch::error::RecvError>(id.unwrap_or_default())
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(if self.is_destroyed() {
                Error::InstanceDestroyed
            } else {
                Error::Cancelled
            }),
            waited = tokio::time::timeout(timeout, published) => match waited {
                Ok(Ok(id)) => Ok(id),
                Ok(Err(_)) => Err(Error::InstanceDestroyed),
                Err(_) => Err(Error::CorrelationIdTimeout(timeout)),
            },
        }
    }

    async fn run(
        self: Arc<Self>,
        generation: u64,
        cancel: CancellationToken,
        renewer: Arc<dyn CodeRenewer>,
        renew_first: bool,
    ) {
        let outcome = self
            .poll_loop(&cancel, renewer.as_ref(), renew_first)
            .await;

        let mut state = self.lock();
        let current = state
            .active
            .as_ref()
            .map_or(false, |run| run.generation == generation);
        if current {
            state.active = None;
        }

        let Some(result) = outcome else {
            debug!("Poll run {} ended by cancellation", generation);
            return;
        };
        if !current || cancel.is_cancelled() {
            debug!("Discarding outcome of superseded poll run {}", generation);
            return;
        }

        let mut pending = std::mem::take(&mut state.pending);
        drop(state);

        // The code has been consumed (or is unusable); the next attempt mints a new one.
        self.correlation.send_replace(None);
        if let Err(e) = &result {
            warn!("Poll run {} failed: {}", generation, e);
            self.emit(AuthEvent::Error {
                message: e.to_string(),
            });
        }
        if !pending.settle(result) {
            debug!("Poll run {} finished with nobody waiting", generation);
        }
    }

    async fn poll_loop(
        &self,
        cancel: &CancellationToken,
        renewer: &dyn CodeRenewer,
        renew_first: bool,
    ) -> Option<Result<S::Output>> {
        let mut correlation_id = String::new();
        if !renew_first {
            correlation_id = match self.wait_for_correlation_id(cancel).await {
                Ok(id) => id,
                Err(e) if e.is_cancellation() => return None,
                Err(e) => return Some(Err(e)),
            };
            self.mark_started();
            info!(
                "Polling status of {} (retries so far: {})",
                correlation_id,
                self.retries()
            );
        }

        let mut renew = renew_first;
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let retries = self.retries();
            if retries >= self.config.max_retries {
                return Some(Err(Error::PollExhausted { retries }));
            }

            if renew || self.code_expiring() {
                if correlation_id.is_empty() {
                    info!("Renewing login code before polling");
                } else {
                    info!("Code {} is about to expire, renewing", correlation_id);
                }
                let renewed = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    renewed = renewer.renew_code() => renewed,
                };
                if let Err(e) = renewed {
                    renew = true;
                    match self.absorb_error(e, cancel).await {
                        Step::Continue => continue,
                        Step::Exit(outcome) => return outcome,
                    }
                }

                correlation_id = match self.wait_for_correlation_id(cancel).await {
                    Ok(id) => id,
                    Err(e) if e.is_cancellation() => return None,
                    Err(e) => return Some(Err(e)),
                };
                renew = false;
                self.mark_started();
                info!("Resumed polling with new code {}", correlation_id);
                continue;
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => return None,
                response = self.source.query_status(&correlation_id) => response,
            };

            let step = match response {
                Ok(response) => self.handle_status(response, cancel, &mut renew).await,
                Err(e) => self.absorb_error(e, cancel).await,
            };
            if let Step::Exit(outcome) = step {
                return outcome;
            }
        }
    }

    async fn handle_status(
        &self,
        response: PollStatusResponse,
        cancel: &CancellationToken,
        renew: &mut bool,
    ) -> Step<S::Output> {
        self.emit(AuthEvent::StatusChanged {
            status: response.status,
        });

        match response.status {
            LoginStatus::Success => {
                let Some(code) = response.code.filter(|code| !code.is_empty()) else {
                    return self
                        .absorb_error(Error::protocol("success status carried no code"), cancel)
                        .await;
                };
                info!("Login confirmed, exchanging authorization code");
                let exchanged = tokio::select! {
                    _ = cancel.cancelled() => return Step::Exit(None),
                    exchanged = self.source.exchange_code(&code) => exchanged,
                };
                match exchanged {
                    Ok(output) => Step::Exit(Some(Ok(output))),
                    Err(e) => self.absorb_error(e, cancel).await,
                }
            }
            LoginStatus::Failed => {
                let message = response
                    .message
                    .unwrap_or_else(|| "login failed".to_string());
                Step::Exit(Some(Err(Error::LoginFailed(message))))
            }
            LoginStatus::Expired => {
                debug!("Backend reports the code expired");
                *renew = true;
                Step::Continue
            }
            status @ (LoginStatus::Pending | LoginStatus::Scanned) => {
                let retries = self.bump_retries();
                let interval = self.backoff.interval_for(status, retries);
                debug!("Status {} (retry {}), next check in {:?}", status, retries, interval);
                if self.sleep(interval, cancel).await {
                    Step::Continue
                } else {
                    Step::Exit(None)
                }
            }
        }
    }

    /// Count a failed attempt and pause, or end the run for errors that are not hiccups
    async fn absorb_error(&self, error: Error, cancel: &CancellationToken) -> Step<S::Output> {
        if error.is_cancellation() || cancel.is_cancelled() {
            return Step::Exit(None);
        }
        if !error.is_retryable() {
            return Step::Exit(Some(Err(error)));
        }

        let retries = self.bump_retries();
        warn!("Status check failed (retry {}): {}", retries, error);
        self.emit(AuthEvent::Error {
            message: error.to_string(),
        });

        if self.sleep(self.config.error_retry_interval, cancel).await {
            Step::Continue
        } else {
            Step::Exit(None)
        }
    }

    /// Sleep unless cancelled first; returns false on cancellation
    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn code_expiring(&self) -> bool {
        let started = self.lock().poll_started_at;
        Instant::now() + self.config.max_wait > started + self.config.code_lifetime()
    }

    fn mark_started(&self) {
        self.lock().poll_started_at = Instant::now();
    }

    fn retries(&self) -> u32 {
        self.lock().retries
    }

    fn bump_retries(&self) -> u32 {
        let mut state = self.lock();
        state.retries += 1;
        state.retries
    }

    fn emit(&self, event: AuthEvent) {
        let _ = self.events.send(event);
    }
}
