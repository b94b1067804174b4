//! Network and retry policies.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use blobxfer_protocol::{NetworkStatus, NetworkType};

/// Which networks a direction of transfer may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferNetworkPolicy {
    /// Networks chunks may be sent over.
    pub transfer_over: BTreeSet<NetworkType>,
    /// Networks on which transfers paused by a network change resume
    /// automatically.
    pub auto_resume_on: BTreeSet<NetworkType>,
}

impl Default for TransferNetworkPolicy {
    fn default() -> Self {
        let all: BTreeSet<_> = [NetworkType::WifiOrEthernet, NetworkType::Cellular].into();
        Self {
            transfer_over: all.clone(),
            auto_resume_on: all,
        }
    }
}

impl TransferNetworkPolicy {
    /// Transfers and auto-resumes on Wi-Fi or Ethernet only.
    pub fn wifi_only() -> Self {
        let wifi: BTreeSet<_> = [NetworkType::WifiOrEthernet].into();
        Self {
            transfer_over: wifi.clone(),
            auto_resume_on: wifi,
        }
    }

    /// Unknown or disconnected status never allows a transfer.
    pub fn allows_transfer(&self, status: NetworkStatus) -> bool {
        status
            .network_type()
            .is_some_and(|t| self.transfer_over.contains(&t))
    }

    pub fn allows_auto_resume(&self, status: NetworkStatus) -> bool {
        self.allows_transfer(status)
            && status
                .network_type()
                .is_some_and(|t| self.auto_resume_on.contains(&t))
    }
}

/// Retry policy for failed chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Consecutive failures after which a transfer is marked failed.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Backoff cap, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 250,
            max_delay_ms: 15_000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Calculates the delay for a given attempt number (1-based),
    /// with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay_ms as f64 / 1000.0 * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay_ms as f64 / 1000.0);
        let unit = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / 1_000_000_000.0;
        jittered(capped, unit)
    }

    /// Whether a transfer that has failed `attempts` times in a row may try again.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Spreads `secs` over ±25% by `unit`, which must lie in `[0, 1)`.
fn jittered(secs: f64, unit: f64) -> Duration {
    let offset = unit * 2.0 - 1.0;
    Duration::from_secs_f64((secs + secs * 0.25 * offset).max(0.05))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_transfers_on_any_network() {
        let policy = TransferNetworkPolicy::default();
        assert!(policy.allows_transfer(NetworkStatus::WifiOrEthernet));
        assert!(policy.allows_transfer(NetworkStatus::Cellular));
        assert!(!policy.allows_transfer(NetworkStatus::Unknown));
        assert!(!policy.allows_transfer(NetworkStatus::Disconnected));
    }

    #[test]
    fn wifi_only_policy() {
        let policy = TransferNetworkPolicy::wifi_only();
        assert!(policy.allows_transfer(NetworkStatus::WifiOrEthernet));
        assert!(!policy.allows_transfer(NetworkStatus::Cellular));
        assert!(policy.allows_auto_resume(NetworkStatus::WifiOrEthernet));
        assert!(!policy.allows_auto_resume(NetworkStatus::Cellular));
    }

    #[test]
    fn auto_resume_requires_transfer_permission() {
        let policy = TransferNetworkPolicy {
            transfer_over: [NetworkType::WifiOrEthernet].into(),
            auto_resume_on: [NetworkType::WifiOrEthernet, NetworkType::Cellular].into(),
        };
        assert!(!policy.allows_auto_resume(NetworkStatus::Cellular));
    }

    #[test]
    fn retry_delay_backoff() {
        let policy = RetryPolicy::default();
        let expected_base = [0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 15.0, 15.0];
        for (i, &base) in expected_base.iter().enumerate() {
            let secs = policy.delay_for_attempt((i + 1) as u32).as_secs_f64();
            let lo = base * 0.74;
            let hi = base * 1.26;
            assert!(
                secs >= lo && secs <= hi,
                "attempt {}: {secs:.3}s not in [{lo:.3}, {hi:.3}]",
                i + 1
            );
        }
    }

    #[test]
    fn jitter_spans_both_sides_of_the_base() {
        assert_eq!(jittered(1.0, 0.0), Duration::from_millis(750));
        assert_eq!(jittered(1.0, 0.5), Duration::from_secs(1));
        let top = jittered(1.0, 999_999_999.0 / 1_000_000_000.0).as_secs_f64();
        assert!(top > 1.249 && top < 1.25, "{top}");
        assert_eq!(jittered(0.01, 0.0), Duration::from_millis(50));
    }

    #[test]
    fn retry_budget() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        assert!(policy.allows_retry(0));
        assert!(policy.allows_retry(1));
        assert!(!policy.allows_retry(2));
    }

    #[test]
    fn retry_policy_from_partial_json() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"maxAttempts": 9}"#).unwrap();
        assert_eq!(policy.max_attempts, 9);
        assert_eq!(policy.initial_delay_ms, 250);
    }
}
