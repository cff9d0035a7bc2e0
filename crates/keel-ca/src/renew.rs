//! Background certificate renewal.
//!
//! One renewal task runs per live [`SecurityConfig`]. Each cycle sleeps
//! until a jittered point inside the certificate's validity window, or
//! until a force-renew signal, then re-issues through whichever signing
//! path is currently configured and publishes exactly one
//! [`CertificateUpdate`] to the single consumer. Failures back off for a
//! bounded interval instead of retrying in a tight loop; cancellation
//! terminates the task silently with the last-known-good config intact.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_core::{CaError, NodeRole, Result};

use crate::config::RenewConfig;
use crate::security::{issue_credentials, NodeCredentials, SecurityConfig};

/// Outcome of one renewal cycle, published to the single consumer.
#[derive(Debug)]
pub struct CertificateUpdate {
    /// Role the renewed (or failed) certificate applies to
    pub role: NodeRole,
    /// Expiry of the fresh certificate, present on success
    pub not_after: Option<DateTime<Utc>>,
    /// What went wrong, present on failure
    pub err: Option<CaError>,
}

impl CertificateUpdate {
    /// True when the cycle produced a fresh certificate.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.err.is_none()
    }
}

/// Control handle for a running renewal task.
#[derive(Clone)]
pub struct RenewalHandle {
    force: mpsc::Sender<()>,
}

impl RenewalHandle {
    /// Request an immediate renewal cycle.
    ///
    /// The signal channel has capacity one: a force requested while one
    /// is already pending is coalesced into it, never queued twice.
    pub fn force(&self) {
        let _ = self.force.try_send(());
    }
}

/// Renewal task states. Cancellation reaches `Stopped` from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RenewState {
    /// Sleeping until the computed wake time or a force signal
    Waiting,
    /// Re-issuing through the configured signing path
    Renewing,
    /// Delivering the cycle's update to the consumer
    Publishing,
    /// Pausing after a failed cycle
    Backoff,
    /// Terminated
    Stopped,
}

/// Events driving the renewal state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RenewEvent {
    /// Timer fired or a force-renew signal arrived
    Wake,
    /// Issuance produced fresh credentials
    Issued,
    /// Issuance failed
    Failed,
    /// A success update was delivered
    Published,
    /// An error update was delivered; the cycle will be retried
    PublishedError,
    /// An error update was delivered and the failure is terminal
    PublishedTerminal,
    /// The backoff pause elapsed
    BackoffElapsed,
    /// Cancellation, or the consumer went away
    Cancel,
}

/// Pure transition table; invalid pairings terminate the task.
pub(crate) const fn transition(state: RenewState, event: RenewEvent) -> RenewState {
    match (state, event) {
        (_, RenewEvent::Cancel) => RenewState::Stopped,
        (RenewState::Waiting, RenewEvent::Wake)
        | (RenewState::Backoff, RenewEvent::BackoffElapsed | RenewEvent::Wake) => {
            RenewState::Renewing
        }
        (RenewState::Renewing, RenewEvent::Issued | RenewEvent::Failed) => RenewState::Publishing,
        (RenewState::Publishing, RenewEvent::Published) => RenewState::Waiting,
        (RenewState::Publishing, RenewEvent::PublishedError) => RenewState::Backoff,
        _ => RenewState::Stopped,
    }
}

/// Start the renewal process for `config`.
///
/// Returns a handle for force-renew requests and the update stream,
/// which delivers exactly one [`CertificateUpdate`] per cycle. Dropping
/// the receiver or cancelling `cancel` terminates the task without
/// touching the last-known-good config.
pub fn renew_security_config(
    config: Arc<SecurityConfig>,
    renew: RenewConfig,
    cancel: CancellationToken,
) -> (RenewalHandle, mpsc::Receiver<CertificateUpdate>) {
    let (update_tx, update_rx) = mpsc::channel(1);
    let (force_tx, force_rx) = mpsc::channel(1);

    tokio::spawn(renew_loop(config, renew, cancel, force_rx, update_tx));

    (RenewalHandle { force: force_tx }, update_rx)
}

async fn renew_loop(
    config: Arc<SecurityConfig>,
    renew: RenewConfig,
    cancel: CancellationToken,
    mut force_rx: mpsc::Receiver<()>,
    update_tx: mpsc::Sender<CertificateUpdate>,
) {
    let mut state = RenewState::Waiting;
    let mut outcome: Option<Result<Arc<NodeCredentials>>> = None;

    loop {
        match state {
            RenewState::Waiting => {
                let creds = config.credentials();
                let delay = wake_delay(
                    creds.not_before,
                    creds.not_after,
                    Utc::now(),
                    &renew,
                    random_fraction(),
                );
                debug!(
                    node_id = %creds.identity.node_id,
                    delay_secs = delay.as_secs(),
                    "scheduled next certificate renewal"
                );

                let event = tokio::select! {
                    () = cancel.cancelled() => RenewEvent::Cancel,
                    () = tokio::time::sleep(delay) => RenewEvent::Wake,
                    Some(()) = force_rx.recv() => {
                        info!(node_id = %creds.identity.node_id, "certificate renewal forced");
                        RenewEvent::Wake
                    }
                };
                state = transition(state, event);
            }

            RenewState::Renewing => {
                // In-flight signing is dropped on cancellation instead of
                // running out its timeout.
                let event = tokio::select! {
                    () = cancel.cancelled() => RenewEvent::Cancel,
                    result = renew_once(&config) => {
                        let event = if result.is_ok() {
                            RenewEvent::Issued
                        } else {
                            RenewEvent::Failed
                        };
                        outcome = Some(result);
                        event
                    }
                };
                state = transition(state, event);
            }

            RenewState::Publishing => {
                let role = config.credentials().identity.role;
                let (update, after) = match outcome.take() {
                    Some(Ok(creds)) => (
                        CertificateUpdate {
                            role,
                            not_after: Some(creds.not_after),
                            err: None,
                        },
                        RenewEvent::Published,
                    ),
                    Some(Err(e)) => {
                        warn!(error = %e, "certificate renewal failed");
                        let after = if e.is_identity_removed() {
                            RenewEvent::PublishedTerminal
                        } else {
                            RenewEvent::PublishedError
                        };
                        (
                            CertificateUpdate {
                                role,
                                not_after: None,
                                err: Some(e),
                            },
                            after,
                        )
                    }
                    None => (
                        CertificateUpdate {
                            role,
                            not_after: None,
                            err: Some(CaError::Internal(
                                "renewal cycle produced no outcome".to_string(),
                            )),
                        },
                        RenewEvent::PublishedError,
                    ),
                };

                let event = tokio::select! {
                    () = cancel.cancelled() => RenewEvent::Cancel,
                    sent = update_tx.send(update) => match sent {
                        Ok(()) => after,
                        // Consumer dropped the stream
                        Err(_) => RenewEvent::Cancel,
                    }
                };
                state = transition(state, event);
            }

            RenewState::Backoff => {
                let event = tokio::select! {
                    () = cancel.cancelled() => RenewEvent::Cancel,
                    () = tokio::time::sleep(renew.error_backoff()) => RenewEvent::BackoffElapsed,
                    Some(()) = force_rx.recv() => RenewEvent::Wake,
                };
                state = transition(state, event);
            }

            RenewState::Stopped => {
                debug!("certificate renewal task stopped");
                return;
            }
        }
    }
}

/// Re-issue credentials for the config's current identity and swap the
/// fresh pair in.
async fn renew_once(config: &SecurityConfig) -> Result<Arc<NodeCredentials>> {
    let identity = config.credentials().identity.clone();
    let root = config.root_ca();
    let external = config.external_ca();

    let fresh = issue_credentials(
        &root,
        config.key_store(),
        config.paths(),
        external.as_deref(),
        &identity,
        None,
    )
    .await?;

    let fresh = Arc::new(fresh);
    config.update_credentials((*fresh).clone());
    info!(
        node_id = %identity.node_id,
        not_after = %fresh.not_after,
        "renewed node certificate"
    );
    Ok(fresh)
}

/// Delay until the next renewal wake.
///
/// The wake point is `fraction` of the way through the jitter window,
/// itself a configured slice of the certificate's total validity
/// measured from `not_before`. Heavily backdated short-lived
/// certificates land in the past and clamp to the minimum delay.
fn wake_delay(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    now: DateTime<Utc>,
    renew: &RenewConfig,
    fraction: f64,
) -> Duration {
    let total_ms = (not_after - not_before).num_milliseconds().max(0) as f64;

    let low = f64::from(renew.jitter_low_pct) / 100.0;
    let high = f64::from(renew.jitter_high_pct) / 100.0;
    let jittered = low + (high - low).max(0.0) * fraction;

    let wake_at = not_before + chrono::Duration::milliseconds((total_ms * jittered) as i64);
    let delay_ms = (wake_at - now).num_milliseconds().max(0) as u64;

    // The floor wins over an inverted configuration; clamp must never panic
    let min = renew.min_delay();
    let max = renew.max_delay().max(min);
    Duration::from_millis(delay_ms).clamp(min, max)
}

/// Uniform value in `[0, 1)` from system randomness.
fn random_fraction() -> f64 {
    let mut bytes = [0u8; 8];
    // A failed fill leaves zeroes, degrading to the window's lower bound
    let _ = SystemRandom::new().fill(&mut bytes);
    (u64::from_be_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}
