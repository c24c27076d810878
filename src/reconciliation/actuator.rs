//! Safety Mode Actuator
//!
//! Capability to force a symbol into a trading mode on the peer service that
//! owns order entry. Every call carries a fresh idempotency key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::types::SafetyMode;
use crate::clock::Clock;

/// Result of one mode change request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeChangeOutcome {
    Accepted,
    /// Peer answered and refused
    Rejected(String),
    /// Transport error or timeout
    Failed(String),
}

impl ModeChangeOutcome {
    #[inline]
    pub fn is_accepted(&self) -> bool {
        matches!(self, ModeChangeOutcome::Accepted)
    }
}

#[async_trait]
pub trait SafetyModeActuator: Send + Sync {
    /// Actuator name for logging
    fn name(&self) -> &'static str;

    async fn set_symbol_mode(
        &self,
        symbol: &str,
        mode: SafetyMode,
        reason: &str,
    ) -> ModeChangeOutcome;

    /// Put a symbol back into NORMAL
    async fn restore_symbol_mode(&self, symbol: &str, reason: &str) -> ModeChangeOutcome {
        self.set_symbol_mode(symbol, SafetyMode::Normal, reason).await
    }
}

/// Key sent with every request: `recon-{symbol}-{epoch_ms}-{ulid}`
pub fn idempotency_key(symbol: &str, now: DateTime<Utc>) -> String {
    format!(
        "recon-{}-{}-{}",
        symbol,
        now.timestamp_millis(),
        ulid::Ulid::new()
    )
}

#[derive(Debug, Serialize)]
struct SetSymbolModeRequest<'a> {
    symbol: &'a str,
    mode: SafetyMode,
    reason: &'a str,
    idempotency_key: String,
    requested_by: &'static str,
}

#[derive(Debug, Deserialize)]
struct SetSymbolModeResponse {
    accepted: bool,
    #[serde(default)]
    message: Option<String>,
}

/// JSON over HTTP: `POST {base_url}/v1/symbols/mode`
pub struct HttpSafetyActuator {
    client: reqwest::Client,
    endpoint: String,
    clock: Arc<dyn Clock>,
}

impl HttpSafetyActuator {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout.max(Duration::from_millis(1)))
            .build()?;
        let endpoint = format!("{}/v1/symbols/mode", base_url.trim_end_matches('/'));
        info!(endpoint = %endpoint, timeout_ms = timeout.as_millis() as u64, "Safety actuator ready");
        Ok(Self {
            client,
            endpoint,
            clock,
        })
    }
}

#[async_trait]
impl SafetyModeActuator for HttpSafetyActuator {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn set_symbol_mode(
        &self,
        symbol: &str,
        mode: SafetyMode,
        reason: &str,
    ) -> ModeChangeOutcome {
        let request = SetSymbolModeRequest {
            symbol,
            mode,
            reason,
            idempotency_key: idempotency_key(symbol, self.clock.now()),
            requested_by: "ledger-reconciliation",
        };

        let response = match self.client.post(&self.endpoint).json(&request).send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!(symbol, mode = %mode, reason, error = %e, "Safety mode request failed");
                return ModeChangeOutcome::Failed(e.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            error!(symbol, mode = %mode, status = %status, "Safety mode request returned error status");
            return ModeChangeOutcome::Failed(format!("http status {}", status));
        }

        match response.json::<SetSymbolModeResponse>().await {
            Ok(body) if body.accepted => {
                info!(symbol, mode = %mode, reason, "Safety mode applied");
                ModeChangeOutcome::Accepted
            }
            Ok(body) => {
                let message = body.message.unwrap_or_else(|| "rejected".to_string());
                warn!(symbol, mode = %mode, reason, message = %message, "Safety mode rejected");
                ModeChangeOutcome::Rejected(message)
            }
            Err(e) => {
                error!(symbol, mode = %mode, error = %e, "Safety mode response unreadable");
                ModeChangeOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Used when auto-switching is turned off. Every request is rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledSafetyActuator;

#[async_trait]
impl SafetyModeActuator for DisabledSafetyActuator {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn set_symbol_mode(
        &self,
        _symbol: &str,
        _mode: SafetyMode,
        _reason: &str,
    ) -> ModeChangeOutcome {
        ModeChangeOutcome::Rejected("actuator disabled".to_string())
    }
}

/// Mock actuator for testing
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct MockActuator {
        calls: AtomicUsize,
        /// (symbol, mode, reason) in call order
        requests: Mutex<Vec<(String, SafetyMode, String)>>,
        fail: Mutex<bool>,
    }

    impl MockActuator {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_fail(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn requests(&self) -> Vec<(String, SafetyMode, String)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SafetyModeActuator for MockActuator {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn set_symbol_mode(
            &self,
            symbol: &str,
            mode: SafetyMode,
            reason: &str,
        ) -> ModeChangeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests
                .lock()
                .unwrap()
                .push((symbol.to_string(), mode, reason.to_string()));
            if *self.fail.lock().unwrap() {
                ModeChangeOutcome::Failed("mock failure".to_string())
            } else {
                ModeChangeOutcome::Accepted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_disabled_actuator_rejects() {
        let actuator = DisabledSafetyActuator;
        let outcome = actuator
            .set_symbol_mode("BTC-KRW", SafetyMode::CancelOnly, "test")
            .await;
        assert!(matches!(outcome, ModeChangeOutcome::Rejected(_)));
        assert!(!actuator.restore_symbol_mode("BTC-KRW", "test").await.is_accepted());
    }

    #[tokio::test]
    async fn test_restore_sends_normal() {
        let actuator = mock::MockActuator::new();
        assert!(actuator.restore_symbol_mode("ETH-KRW", "done").await.is_accepted());
        assert_eq!(
            actuator.requests(),
            vec![("ETH-KRW".to_string(), SafetyMode::Normal, "done".to_string())]
        );
    }

    #[test]
    fn test_idempotency_keys_use_given_time() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let a = idempotency_key("BTC-KRW", now);
        let b = idempotency_key("BTC-KRW", now);
        assert!(a.starts_with(&format!("recon-BTC-KRW-{}-", now.timestamp_millis())));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_http_actuator_unreachable_is_failure() {
        let actuator = HttpSafetyActuator::new(
            "http://127.0.0.1:9",
            Duration::from_millis(200),
            Arc::new(ManualClock::default()),
        )
        .unwrap();
        let outcome = actuator
            .set_symbol_mode("BTC-KRW", SafetyMode::HardHalt, "test")
            .await;
        assert!(matches!(outcome, ModeChangeOutcome::Failed(_)));
    }
}
