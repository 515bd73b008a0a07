/// Preset configurations for common service types
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;
use std::time::Duration;

/// Configuration bundle for a service type
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub timeout: TimeoutConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: Option<RetryConfig>,
}

/// Database queries (PostgreSQL, MySQL)
///
/// - Timeout: 10s (queries should be fast)
/// - Circuit breaker: 10 failures, 30s cooldown
/// - No retry (avoid duplicate writes)
pub fn database_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(10),
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 10,
            success_threshold: 3,
            timeout: Duration::from_secs(30),
            error_rate_threshold: 0.6, // More tolerant
            window_size: 100,
        },
        retry: None, // Don't retry DB writes
    }
}

/// AMQP broker calls (connect, publish, consume)
///
/// - Timeout: 10s (broker round trips should be fast)
/// - Circuit breaker: 5 failures, 30s cooldown
/// - Retry: 5 attempts (idempotent via outbox dedup/consumer ack)
pub fn amqp_config() -> ServiceConfig {
    ServiceConfig {
        timeout: TimeoutConfig {
            duration: Duration::from_secs(10),
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            error_rate_threshold: 0.5,
            window_size: 100,
        },
        retry: Some(RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config() {
        let config = database_config();
        assert_eq!(config.timeout.duration, Duration::from_secs(10));
        assert!(config.retry.is_none()); // No retry for DB
    }

    #[test]
    fn test_amqp_config() {
        let config = amqp_config();
        assert_eq!(config.timeout.duration, Duration::from_secs(10));
        assert!(config.retry.is_some());
    }
}
