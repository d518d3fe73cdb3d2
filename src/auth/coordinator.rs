// Reactive refresh coordination
//
// Single-flight token renewal. The first authorization failure (or timer
// fire, or explicit refresh) starts a wave; everything that arrives while
// it is in flight awaits the same shared outcome.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::client::AuthClient;
use super::notifier::SessionSnapshot;
use super::scheduler::RefreshScheduler;
use super::store::CredentialStore;
use super::token::redact;
use super::types::Credential;
use crate::error::AuthError;

/// Outcome shared by every member of a refresh wave
pub type RefreshOutcome = Result<Arc<Credential>, AuthError>;

type RefreshWave = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Coordinates token renewal across concurrent requests and the
/// proactive timer.
///
/// Idle while `in_flight` is empty; RefreshInFlight while it holds the
/// wave every waiter awaits.
pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    client: AuthClient,
    scheduler: RefreshScheduler,
    in_flight: Mutex<Option<RefreshWave>>,
    refresh_calls: AtomicU64,
    me: Weak<Self>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        client: AuthClient,
        scheduler: RefreshScheduler,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            store,
            client,
            scheduler,
            in_flight: Mutex::new(None),
            refresh_calls: AtomicU64::new(0),
            me: me.clone(),
        })
    }

    /// Renew the session, joining the in-flight wave if there is one
    pub async fn refresh(&self) -> RefreshOutcome {
        self.join_wave().await
    }

    /// React to an authorization failure of a request sent with `sent_token`.
    ///
    /// If the session was already renewed since that request went out, the
    /// current credential is returned without starting a new wave.
    pub async fn handle_unauthorized(&self, sent_token: Option<&str>) -> RefreshOutcome {
        if let (Some(sent), Some(current)) = (sent_token, self.store.current()) {
            if current.token != sent && !current.is_expired_at(Utc::now().timestamp(), 0) {
                tracing::debug!(
                    token = %redact(&current.token),
                    "Request failed with a superseded token, replaying with current one"
                );
                return Ok(current);
            }
        }

        self.join_wave().await
    }

    /// Arm the proactive timer for `credential`.
    ///
    /// Nothing is armed unless `credential` is still the store's current
    /// session when the timer slot is taken; paired with callers that clear
    /// the store before disarming, a timer can never outlive its session.
    pub fn schedule(&self, credential: &Credential) -> bool {
        let me = self.me.clone();
        let armed = self.scheduler.arm_if(
            credential,
            || {
                self.store
                    .current()
                    .map_or(false, |current| std::ptr::eq(current.as_ref(), credential))
            },
            move || async move {
                if let Some(coordinator) = me.upgrade() {
                    if let Err(e) = coordinator.refresh().await {
                        tracing::warn!(error = %e, "Proactive refresh failed");
                    }
                }
            },
        );

        if !armed {
            tracing::debug!("Session changed before the refresh timer was armed, skipping");
        }
        armed
    }

    /// Cancel the proactive timer. Clear the store first so a concurrent
    /// `schedule` cannot re-arm behind this call.
    pub fn cancel_schedule(&self) {
        self.scheduler.disarm();
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    /// Whether a refresh wave is currently in flight
    pub fn is_refreshing(&self) -> bool {
        self.lock_in_flight().is_some()
    }

    /// Number of refresh calls issued so far
    pub fn refresh_calls(&self) -> u64 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn join_wave(&self) -> RefreshWave {
        let mut in_flight = self.lock_in_flight();
        if let Some(wave) = in_flight.as_ref() {
            tracing::debug!("Refresh already in flight, joining wave");
            return wave.clone();
        }

        let (current, generation) = self.store.snapshot();
        let me = self.me.clone();

        // Spawned so that a cancelled waiter cannot abort the wave
        let task = tokio::spawn(async move {
            match me.upgrade() {
                Some(coordinator) => coordinator.run_wave(current, generation).await,
                None => Err(AuthError::SessionEnded("session pipeline shut down".to_string())),
            }
        });

        let wave = async move {
            task.await.unwrap_or_else(|e| {
                Err(AuthError::SessionEnded(format!("refresh task failed: {}", e)))
            })
        }
        .boxed()
        .shared();

        *in_flight = Some(wave.clone());
        wave
    }

    async fn run_wave(&self, current: SessionSnapshot, generation: u64) -> RefreshOutcome {
        let outcome = self.refresh_once(current, generation).await;

        match &outcome {
            Ok(credential) => {
                self.schedule(credential);
            }
            Err(e) => {
                // A session installed since the wave started keeps its timer
                if self.store.clear_if_generation(generation) {
                    tracing::warn!(error = %e, "Session refresh failed, ending session");
                    self.scheduler.disarm();
                } else {
                    tracing::warn!(error = %e, "Refresh of a replaced session failed, keeping current one");
                }
            }
        }

        // Back to idle; waiters resolve with `outcome` right after
        *self.lock_in_flight() = None;
        outcome
    }

    async fn refresh_once(&self, current: SessionSnapshot, generation: u64) -> RefreshOutcome {
        let current = current
            .ok_or_else(|| AuthError::SessionEnded("no session to refresh".to_string()))?;

        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let response = self
            .client
            .refresh(&current.token)
            .await
            .map_err(|e| AuthError::SessionEnded(e.message()))?;

        let token = response
            .token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                AuthError::SessionEnded("refresh response did not contain a token".to_string())
            })?;

        // No user payload means the profile carries over
        let profile = response.user.unwrap_or_else(|| current.profile.clone());

        match self.store.set_if_generation(generation, token, profile) {
            Ok(Some(credential)) => Ok(credential),
            Ok(None) => self.store.current().ok_or_else(|| {
                AuthError::SessionEnded("session was closed during refresh".to_string())
            }),
            Err(e) => Err(AuthError::SessionEnded(e.message())),
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<RefreshWave>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
