//! Request orchestration: validate, lease a key, submit, retry, release.

use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::chain::{ChainClient, ChainOutcome, SubmitError};
use crate::config::Config;
use crate::error::RelayError;
use crate::key_pool::{KeyGuard, KeyPool, Release};
use crate::metrics::METRICS;
use crate::request::{self, RelayRequest};
use crate::retry::{Decision, RetryPolicy, RetryState};
use crate::submitter::{SubmissionAttempt, Submitter};

/// Everything that happened to one request.
#[derive(Debug)]
pub struct RelayReport {
    pub attempts: Vec<SubmissionAttempt>,
    pub outcome: Result<ChainOutcome, RelayError>,
}

impl RelayReport {
    fn rejected(error: RelayError) -> Self {
        Self {
            attempts: Vec::new(),
            outcome: Err(error),
        }
    }
}

pub struct Relay {
    pool: Arc<KeyPool>,
    submitter: Submitter,
    policy: RetryPolicy,
    request_deadline: Duration,
    max_action_bytes: usize,
}

impl Relay {
    pub fn new(
        pool: Arc<KeyPool>,
        submitter: Submitter,
        policy: RetryPolicy,
        request_deadline: Duration,
        max_action_bytes: usize,
    ) -> Self {
        Self {
            pool,
            submitter,
            policy,
            request_deadline,
            max_action_bytes,
        }
    }

    pub fn from_config(
        config: &Config,
        pool: Arc<KeyPool>,
        chain: Arc<dyn ChainClient>,
    ) -> Result<Self, crate::Error> {
        Ok(Self::new(
            pool,
            Submitter::from_config(config, chain)?,
            RetryPolicy::from_config(config),
            config.request_deadline(),
            config.max_action_bytes,
        ))
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub fn contract_id(&self) -> &near_primitives::types::AccountId {
        self.submitter.contract_id()
    }

    /// Validate a raw body and forward it. Structural errors never touch the pool.
    pub async fn relay(&self, raw: &Value) -> RelayReport {
        match request::validate(raw, self.max_action_bytes) {
            Ok(request) => self.forward(&request).await,
            Err(e) => RelayReport::rejected(e),
        }
    }

    pub async fn forward(&self, request: &RelayRequest) -> RelayReport {
        let deadline = Instant::now() + self.request_deadline;
        let mut retry = RetryState::new(self.policy, deadline);
        let mut attempts: Vec<SubmissionAttempt> = Vec::new();
        let mut held: Option<KeyGuard> = None;

        info!(
            target_account = %request.target_account,
            auth = request.auth.mode(),
            action = request.action_type(),
            "Relaying request"
        );

        loop {
            let key = match held.take() {
                Some(key) => key,
                None => match self.lease(deadline).await {
                    Ok(key) => key,
                    Err(e) => {
                        return RelayReport {
                            attempts,
                            outcome: Err(e),
                        }
                    }
                },
            };

            let number = attempts.len() as u32 + 1;
            let attempt = self.submitter.submit(request, &key, number).await;

            let err = match &attempt.outcome {
                Ok(outcome) => {
                    info!(
                        attempt = number,
                        key = %attempt.public_key,
                        nonce = attempt.nonce,
                        tx_hash = %outcome.tx_hash,
                        "Request relayed"
                    );
                    let outcome = outcome.clone();
                    key.release(Release::Landed);
                    attempts.push(attempt);
                    return RelayReport {
                        attempts,
                        outcome: Ok(outcome),
                    };
                }
                Err(err) => err.clone(),
            };

            let decision = retry.on_failure(&err, attempt.tx_hash.clone(), Instant::now());
            warn!(
                attempt = number,
                key = %attempt.public_key,
                nonce = attempt.nonce,
                error = %err,
                decision = ?decision,
                "Submission failed"
            );
            attempts.push(attempt);
            if err.outcome_unknown() {
                METRICS.timeouts.fetch_add(1, Ordering::Relaxed);
            }

            match decision {
                Decision::RefreshNonce => {
                    METRICS.nonce_refreshes.fetch_add(1, Ordering::Relaxed);
                    key.refresh_nonce();
                    held = Some(key);
                }
                Decision::Backoff { delay } => {
                    METRICS.retries.fetch_add(1, Ordering::Relaxed);
                    // The lease stays out while sleeping, so a drain waits for
                    // the retry instead of closing the pool underneath it.
                    tokio::time::sleep(delay).await;
                    held = Some(key);
                }
                Decision::Fail(error) => {
                    let release = if err.nonce_consumed() {
                        Release::Landed
                    } else if retry.outcome_unknown()
                        || matches!(err, SubmitError::NonceMismatch(_))
                    {
                        Release::Unknown
                    } else {
                        Release::NotLanded
                    };
                    key.release(release);
                    return RelayReport {
                        attempts,
                        outcome: Err(error),
                    };
                }
            }
        }
    }

    /// Lease a key within what is left of the request deadline.
    async fn lease(&self, deadline: Instant) -> Result<KeyGuard, RelayError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.pool.acquire_within(remaining).await
    }
}
