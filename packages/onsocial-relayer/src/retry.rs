//! Retry/backoff decisions for one relayed request.
//!
//! Pure state machine: it never sleeps or touches keys. The relay feeds it
//! each failed attempt and acts on the returned [`Decision`].

use std::time::Duration;
use tokio::time::Instant;

use crate::chain::SubmitError;
use crate::config::Config;
use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Ceiling on attempts that end in a transient failure or timeout.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay before retry `n` (1-based): `base * 2^(n-1)`, capped.
    pub fn delay_for(&self, n: u32) -> Duration {
        let factor = 2u32.saturating_pow(n.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What the relay should do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Re-read the key's nonce and resubmit on the same key, now.
    RefreshNonce,
    /// Wait, then resubmit on the same key. Once an earlier attempt's outcome
    /// is unknown the retry re-signs the same (key, nonce), so the chain can
    /// only include one of them.
    Backoff { delay: Duration },
    /// Stop and surface this error.
    Fail(RelayError),
}

/// Per-request retry bookkeeping.
#[derive(Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    deadline: Instant,
    /// Attempts charged against `max_attempts`.
    charged: u32,
    nonce_corrected: bool,
    /// Set after a timeout or an unconfirmed broadcast; carries that
    /// attempt's tx hash if known.
    unknown_outcome: Option<Option<String>>,
}

impl RetryState {
    pub fn new(policy: RetryPolicy, deadline: Instant) -> Self {
        Self {
            policy,
            deadline,
            charged: 0,
            nonce_corrected: false,
            unknown_outcome: None,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn charged_attempts(&self) -> u32 {
        self.charged
    }

    pub fn outcome_unknown(&self) -> bool {
        self.unknown_outcome.is_some()
    }

    /// Classify one failed attempt. `tx_hash` is the hash of the transaction
    /// the attempt signed, when it got that far.
    pub fn on_failure(
        &mut self,
        error: &SubmitError,
        tx_hash: Option<String>,
        now: Instant,
    ) -> Decision {
        match error {
            SubmitError::ChainRejected { .. } | SubmitError::RelayerFault(_) => {
                Decision::Fail(error.clone().into())
            }
            SubmitError::NonceMismatch(msg) => {
                if let Some(tx_hash) = &self.unknown_outcome {
                    // The timed-out transaction most likely consumed the nonce.
                    return Decision::Fail(RelayError::Timeout {
                        tx_hash: tx_hash.clone(),
                    });
                }
                if self.nonce_corrected {
                    return Decision::Fail(RelayError::NonceMismatch(msg.clone()));
                }
                self.nonce_corrected = true;
                Decision::RefreshNonce
            }
            SubmitError::TransientRpc(msg) => {
                self.charged += 1;
                let last = match &self.unknown_outcome {
                    Some(tx_hash) => RelayError::Timeout {
                        tx_hash: tx_hash.clone(),
                    },
                    None => RelayError::TransientRpc(msg.clone()),
                };
                self.backoff_or(last, now)
            }
            SubmitError::Timeout | SubmitError::Unconfirmed(_) => {
                self.charged += 1;
                let tx_hash = tx_hash.or_else(|| self.unknown_outcome.clone().flatten());
                self.unknown_outcome = Some(tx_hash.clone());
                self.backoff_or(RelayError::Timeout { tx_hash }, now)
            }
        }
    }

    fn backoff_or(&self, last: RelayError, now: Instant) -> Decision {
        if self.charged >= self.policy.max_attempts {
            return Decision::Fail(last);
        }
        let delay = self.policy.delay_for(self.charged);
        if now + delay >= self.deadline {
            return Decision::Fail(last);
        }
        Decision::Backoff { delay }
    }
}
