// Proactive refresh scheduling
// One-shot timer that renews the credential shortly before it expires

use chrono::Utc;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::types::Credential;

/// Default lead time before expiry at which the timer fires
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 60;

struct ArmedTimer {
    fire_at: Instant,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TimerSlot {
    /// Bumped on every arm/disarm; a timer only fires if its generation
    /// is still current when it claims the slot
    generation: u64,
    armed: Option<ArmedTimer>,
}

/// Background refresh timer.
///
/// Holds no credential state: `arm` is handed the credential and the
/// refresh action each time.
pub struct RefreshScheduler {
    margin_secs: i64,
    slot: Arc<Mutex<TimerSlot>>,
}

impl RefreshScheduler {
    pub fn new(margin_secs: i64) -> Self {
        Self {
            margin_secs,
            slot: Arc::new(Mutex::new(TimerSlot::default())),
        }
    }

    /// Schedule `on_fire` to run `margin` before the credential expires.
    ///
    /// Cancels any pending timer. A delay at or below zero (less than the
    /// margin left) fires immediately. The timer never reschedules itself.
    pub fn arm<F, Fut>(&self, credential: &Credential, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.arm_if(credential, || true, on_fire);
    }

    /// Like `arm`, but only if `still_valid` holds. The check runs while the
    /// timer slot is locked, so a `disarm` issued after the condition turned
    /// false is never overtaken. Returns whether a timer was armed.
    pub fn arm_if<P, F, Fut>(&self, credential: &Credential, still_valid: P, on_fire: F) -> bool
    where
        P: FnOnce() -> bool,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = refresh_delay(credential, Utc::now().timestamp(), self.margin_secs);
        let Some(fire_at) = Instant::now().checked_add(delay) else {
            tracing::warn!(
                expires_at = credential.expires_at,
                "Expiry too far in the future to schedule a refresh"
            );
            return false;
        };

        let mut slot = lock(&self.slot);
        if !still_valid() {
            return false;
        }
        slot.generation += 1;
        let generation = slot.generation;

        if let Some(previous) = slot.armed.take() {
            previous.handle.abort();
        }

        let timer_slot = Arc::clone(&self.slot);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(fire_at).await;

            {
                let mut slot = lock(&timer_slot);
                if slot.generation != generation {
                    return;
                }
                // Claimed: a disarm from here on no longer stops this fire
                slot.armed = None;
            }

            tracing::info!("Proactive refresh timer fired");
            on_fire().await;
        });

        tracing::debug!(
            delay_secs = delay.as_secs(),
            expires_at = credential.expires_at,
            "Proactive refresh armed"
        );

        slot.armed = Some(ArmedTimer { fire_at, handle });
        true
    }

    /// Cancel the pending timer, if any
    pub fn disarm(&self) {
        let mut slot = lock(&self.slot);
        slot.generation += 1;
        if let Some(timer) = slot.armed.take() {
            timer.handle.abort();
            tracing::debug!("Proactive refresh disarmed");
        }
    }

    /// Whether a timer is pending
    pub fn is_armed(&self) -> bool {
        lock(&self.slot).armed.is_some()
    }

    /// Time left until the pending timer fires
    pub fn fires_in(&self) -> Option<Duration> {
        lock(&self.slot)
            .armed
            .as_ref()
            .map(|t| t.fire_at.saturating_duration_since(Instant::now()))
    }
}

impl Default for RefreshScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_MARGIN_SECS)
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.slot).armed.take() {
            timer.handle.abort();
        }
    }
}

/// `(expires_at - now) - margin`, clamped at zero
fn refresh_delay(credential: &Credential, now: i64, margin_secs: i64) -> Duration {
    let delay = credential.expires_in(now).saturating_sub(margin_secs);
    if delay <= 0 {
        Duration::ZERO
    } else {
        Duration::from_secs(delay as u64)
    }
}

fn lock(slot: &Mutex<TimerSlot>) -> MutexGuard<'_, TimerSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
