//! Rotating API-credential pool with per-window request caps and cooldown.
//!
//! ## Rotation
//!
//! A round-robin cursor walks a fixed set of credentials. Each credential
//! tracks how many requests it served in the current window; reaching the
//! cap places it in cooldown immediately (the triggering request is still
//! served). On a service-observed rate limit the caller calls
//! [`KeyPool::report_failure`], which forces cooldown regardless of the
//! local counter — the service's accounting may diverge from ours.
//!
//! The cursor does not advance on a successful grant, so a credential whose
//! cooldown just cleared is retried before the rotation moves on.
//!
//! ## Blocking
//!
//! When a full cycle finds no eligible credential, `acquire` sleeps on a
//! condvar until the soonest cooldown (or window reset) elapses. The wait
//! holds only the pool's own lock and is woken by [`KeyPool::close`], so a
//! shutting-down process never stays parked here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{ColloquyError, Result};

/// Identifies one credential within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId(usize);

/// Rate limits applied to every credential in a pool.
#[derive(Debug, Clone, Copy)]
pub struct RotationLimits {
    /// Requests a credential may serve per window before cooling down.
    pub max_requests_per_window: u32,
    /// Length of the request-counting window.
    pub window_length: Duration,
    /// How long a credential is excluded after exhausting its budget (or
    /// being reported rate-limited).
    pub cooldown_length: Duration,
}

impl Default for RotationLimits {
    fn default() -> Self {
        Self {
            max_requests_per_window: 50,
            window_length: Duration::from_secs(60),
            cooldown_length: Duration::from_secs(61),
        }
    }
}

/// A credential leased for a single request.
#[derive(Debug, Clone)]
pub struct LeasedKey {
    pub id: KeyId,
    pub secret: Arc<str>,
}

struct Credential {
    secret: Arc<str>,
    requests_in_window: u32,
    window_start: Instant,
    cooldown_until: Option<Instant>,
}

struct PoolState {
    credentials: Vec<Credential>,
    /// Always in [0, credentials.len()).
    cursor: usize,
    closed: bool,
}

/// Fixed-size credential pool shared by everything that talks to the
/// completion service.
///
/// All state transitions are serialized by one mutex; `acquire` and
/// `report_failure` both take it.
pub struct KeyPool {
    state: Mutex<PoolState>,
    wakeup: Condvar,
    limits: RotationLimits,
}

impl KeyPool {
    /// Build a pool from an ordered list of secrets.
    ///
    /// Blank entries are dropped. An empty result is a fatal configuration
    /// error — there is no usable degraded mode for a conversation engine
    /// without credentials.
    pub fn new<I, S>(secrets: I, limits: RotationLimits) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let now = Instant::now();
        let credentials: Vec<Credential> = secrets
            .into_iter()
            .filter_map(|s| {
                let trimmed = s.as_ref().trim();
                (!trimmed.is_empty()).then(|| Credential {
                    secret: Arc::from(trimmed),
                    requests_in_window: 0,
                    window_start: now,
                    cooldown_until: None,
                })
            })
            .collect();

        if credentials.is_empty() {
            return Err(ColloquyError::NoCredentials);
        }

        info!(keys = credentials.len(), "credential pool initialised");

        Ok(Self {
            state: Mutex::new(PoolState {
                credentials,
                cursor: 0,
                closed: false,
            }),
            wakeup: Condvar::new(),
            limits,
        })
    }

    /// Load secrets from numbered environment variables: `{prefix}1`,
    /// `{prefix}2`, … until the first missing index.
    pub fn from_env(prefix: &str, limits: RotationLimits) -> Result<Self> {
        let mut secrets = Vec::new();
        for i in 1.. {
            match std::env::var(format!("{prefix}{i}")) {
                Ok(value) => secrets.push(value),
                Err(_) => break,
            }
        }
        Self::new(secrets, limits)
    }

    /// Number of credentials in the pool.
    pub fn len(&self) -> usize {
        self.state.lock().credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lease a credential that is not in cooldown and under its window cap.
    ///
    /// Blocks while every credential is exhausted, waking when the soonest
    /// cooldown (or window reset) elapses.
    ///
    /// # Errors
    /// `ColloquyError::PoolClosed` once [`close`](Self::close) has run.
    pub fn acquire(&self) -> Result<LeasedKey> {
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return Err(ColloquyError::PoolClosed);
            }

            let now = Instant::now();
            let len = state.credentials.len();
            let limits = self.limits;
            let mut granted = None;

            for _ in 0..len {
                let idx = state.cursor;
                let cred = &mut state.credentials[idx];

                if let Some(until) = cred.cooldown_until {
                    if now >= until {
                        cred.cooldown_until = None;
                        cred.requests_in_window = 0;
                        cred.window_start = now;
                        debug!(key = idx, "cooldown elapsed — credential back in rotation");
                    }
                }

                if cred.cooldown_until.is_none() {
                    if now.duration_since(cred.window_start) >= limits.window_length {
                        cred.requests_in_window = 0;
                        cred.window_start = now;
                    }

                    if cred.requests_in_window < limits.max_requests_per_window {
                        cred.requests_in_window += 1;
                        if cred.requests_in_window >= limits.max_requests_per_window {
                            cred.cooldown_until = Some(now + limits.cooldown_length);
                            debug!(key = idx, "request cap reached — entering cooldown");
                        }
                        granted = Some(LeasedKey {
                            id: KeyId(idx),
                            secret: Arc::clone(&cred.secret),
                        });
                        break;
                    }
                }

                state.cursor = (idx + 1) % len;
            }

            if let Some(lease) = granted {
                return Ok(lease);
            }

            // Full cycle, nothing eligible: park until the earliest
            // credential can serve again. close() wakes us early.
            let deadline = Self::soonest_available(&state.credentials, limits);
            debug!(
                wait_ms = deadline.saturating_duration_since(now).as_millis() as u64,
                "all credentials exhausted — waiting"
            );
            self.wakeup.wait_until(&mut state, deadline);
        }
    }

    /// Force the named credential into cooldown regardless of its counter.
    ///
    /// Called when the completion service itself answered with a rate-limit
    /// signal for this credential.
    pub fn report_failure(&self, id: KeyId) {
        let mut state = self.state.lock();
        let Some(cred) = state.credentials.get_mut(id.0) else {
            return;
        };
        cred.cooldown_until = Some(Instant::now() + self.limits.cooldown_length);
        warn!(
            key = id.0,
            cooldown_secs = self.limits.cooldown_length.as_secs(),
            "credential reported rate-limited — forced into cooldown"
        );
    }

    /// Permanently close the pool and wake every blocked `acquire`.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        info!("key pool closed");
        self.wakeup.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Earliest instant at which any credential becomes usable again:
    /// its cooldown expiry, or its window reset for capped-but-uncooled
    /// credentials.
    fn soonest_available(credentials: &[Credential], limits: RotationLimits) -> Instant {
        credentials
            .iter()
            .map(|c| {
                c.cooldown_until
                    .unwrap_or(c.window_start + limits.window_length)
            })
            .min()
            .unwrap_or_else(Instant::now)
    }
}
