// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Transient-error classification and retry back-off.

use std::time::Duration;

use pi_config::RetrySettings;

/// Error phrases and status codes that are worth retrying: rate limits,
/// server-side failures, and connection-level interruptions.
pub fn is_transient_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    for code in ["429", "500", "502", "503", "504", "529"] {
        if lower.contains(&format!("error {code}"))
            || lower.contains(&format!("status {code}"))
            || lower.contains(&format!(" {code}:"))
        {
            return true;
        }
    }
    ["rate limit", "overloaded", "connection reset", "connection closed", "timed out", "timeout"]
        .iter()
        .any(|p| lower.contains(p))
}

/// Exponential back-off for the Nth attempt (1-based), capped at
/// `max_delay_ms`.
pub fn backoff_delay(settings: &RetrySettings, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1);
    let delay =
        settings.initial_delay_ms as f64 * settings.backoff_multiplier.powi(exp as i32);
    Duration::from_millis((delay as u64).min(settings.max_delay_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_server_errors_are_transient() {
        assert!(is_transient_error("Anthropic error 429: rate limit exceeded"));
        assert!(is_transient_error("openai error 503: Service Unavailable"));
        assert!(is_transient_error("request failed: connection reset by peer"));
        assert!(is_transient_error("Overloaded"));
        assert!(is_transient_error("operation timed out"));
    }

    #[test]
    fn client_errors_are_not_transient() {
        assert!(!is_transient_error("Anthropic error 400: invalid request"));
        assert!(!is_transient_error("OPENAI_API_KEY not set"));
        assert!(!is_transient_error("unknown model"));
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let s = RetrySettings {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
        };
        assert_eq!(backoff_delay(&s, 1), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(&s, 2), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(&s, 3), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(&s, 4), Duration::from_millis(5_000));
        assert_eq!(backoff_delay(&s, 10), Duration::from_millis(5_000));
    }
}
