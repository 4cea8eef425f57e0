//! Adaptive polling interval
//!
//! The interval between two status checks grows with the number of checks
//! already made in the current run. A scanned-but-unconfirmed code always uses
//! the fastest tier since the user is about to confirm.

use crate::config::duration_ms;
use crate::error::{Error, Result};
use crate::protocol::LoginStatus;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One backoff tier: applies while the retry count is below `below`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffTier {
    /// Exclusive retry-count threshold for this tier
    pub below: u32,
    /// Sleep between checks while in this tier
    #[serde(with = "duration_ms")]
    pub interval: Duration,
}

impl BackoffTier {
    pub const fn new(below: u32, interval: Duration) -> Self {
        Self { below, interval }
    }
}

/// Tiered backoff policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBackoffPolicy", into = "RawBackoffPolicy")]
pub struct BackoffPolicy {
    tiers: Vec<BackoffTier>,
    ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            tiers: vec![
                BackoffTier::new(20, Duration::from_secs(1)),
                BackoffTier::new(40, Duration::from_secs(2)),
                BackoffTier::new(60, Duration::from_secs(3)),
            ],
            ceiling: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    /// Build a policy from ordered tiers and the interval used past the last tier.
    ///
    /// Thresholds must be strictly increasing and intervals non-decreasing, with
    /// the ceiling no shorter than the last tier.
    pub fn new(tiers: Vec<BackoffTier>, ceiling: Duration) -> Result<Self> {
        for pair in tiers.windows(2) {
            if pair[1].below <= pair[0].below {
                return Err(Error::Config(format!(
                    "backoff thresholds must increase: {} then {}",
                    pair[0].below, pair[1].below
                )));
            }
            if pair[1].interval < pair[0].interval {
                return Err(Error::Config(format!(
                    "backoff intervals must not decrease: {:?} then {:?}",
                    pair[0].interval, pair[1].interval
                )));
            }
        }
        if let Some(last) = tiers.last() {
            if ceiling < last.interval {
                return Err(Error::Config(format!(
                    "backoff ceiling {:?} is shorter than the last tier {:?}",
                    ceiling, last.interval
                )));
            }
        }
        Ok(Self { tiers, ceiling })
    }

    /// A policy that always waits the same amount of time
    pub fn fixed(interval: Duration) -> Self {
        Self {
            tiers: Vec::new(),
            ceiling: interval,
        }
    }

    /// Interval of the fastest tier
    pub fn fastest(&self) -> Duration {
        self.tiers
            .first()
            .map(|tier| tier.interval)
            .unwrap_or(self.ceiling)
    }

    /// Interval for a retry count, ignoring status
    pub fn interval_for_retries(&self, retries: u32) -> Duration {
        self.tiers
            .iter()
            .find(|tier| retries < tier.below)
            .map(|tier| tier.interval)
            .unwrap_or(self.ceiling)
    }

    /// Interval to sleep after receiving `status` with `retries` checks made so far
    pub fn interval_for(&self, status: LoginStatus, retries: u32) -> Duration {
        if status == LoginStatus::Scanned {
            return self.fastest();
        }
        self.interval_for_retries(retries)
    }
}

#[derive(Serialize, Deserialize)]
struct RawBackoffPolicy {
    tiers: Vec<BackoffTier>,
    #[serde(with = "duration_ms")]
    ceiling: Duration,
}

impl TryFrom<RawBackoffPolicy> for BackoffPolicy {
    type Error = Error;

    fn try_from(raw: RawBackoffPolicy) -> Result<Self> {
        BackoffPolicy::new(raw.tiers, raw.ceiling)
    }
}

impl From<BackoffPolicy> for RawBackoffPolicy {
    fn from(policy: BackoffPolicy) -> Self {
        Self {
            tiers: policy.tiers,
            ceiling: policy.ceiling,
        }
    }
}
