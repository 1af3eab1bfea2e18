// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

/// Default watchdog period for agent operations.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-operation hang detector.
///
/// `watch` never cancels the wrapped future — it emits a diagnostic (and
/// invokes the optional handler) each time the period elapses without the
/// operation completing, then keeps waiting.  Enabled by `LEDIT_DEBUG_HANG`;
/// the period comes from `LEDIT_HANG_TIMEOUT` (humantime syntax, e.g. "90s",
/// "5m"), default 5 minutes.
#[derive(Clone)]
pub struct Watchdog {
    enabled: bool,
    timeout: Duration,
    on_hang: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl Watchdog {
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        Self {
            enabled,
            timeout,
            on_hang: None,
        }
    }

    pub fn from_env() -> Self {
        let enabled = std::env::var("LEDIT_DEBUG_HANG")
            .map(|v| !v.is_empty() && v != "0")
            .unwrap_or(false);
        let timeout = std::env::var("LEDIT_HANG_TIMEOUT")
            .ok()
            .and_then(|v| humantime::parse_duration(&v).ok())
            .unwrap_or(DEFAULT_TIMEOUT);
        Self::new(enabled, timeout)
    }

    pub fn disabled() -> Self {
        Self::new(false, DEFAULT_TIMEOUT)
    }

    /// Install a handler invoked with the operation name on every expiry.
    pub fn on_hang(mut self, handler: Arc<dyn Fn(&str) + Send + Sync>) -> Self {
        self.on_hang = Some(handler);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `fut` under the watchdog.  The future's output is returned
    /// unchanged; hangs only produce diagnostics.
    pub async fn watch<F, T>(&self, operation: &str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        if !self.enabled {
            return fut.await;
        }
        tokio::pin!(fut);
        let mut expiries = 0u32;
        loop {
            match tokio::time::timeout(self.timeout, &mut fut).await {
                Ok(out) => return out,
                Err(_) => {
                    expiries += 1;
                    warn!(
                        operation,
                        expiries,
                        timeout_secs = self.timeout.as_secs(),
                        "operation exceeded watchdog period; still waiting"
                    );
                    if let Some(handler) = &self.on_hang {
                        handler(operation);
                    }
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
