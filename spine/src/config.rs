use std::time::Duration;

use envconfig::Envconfig;

use crate::error::PipelineError;
use crate::retry::RetryPolicy;

#[derive(Envconfig, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    // Chunked transform configuration
    #[envconfig(default = "10")]
    pub batch_size: usize,

    #[envconfig(default = "1000")]
    pub flush_timeout_ms: u64,

    // Capacity of the bounded channel behind every stage
    #[envconfig(default = "16")]
    pub downstream_buffer_capacity: usize,

    // Acknowledgment retries. 11 attempts is one try plus ten retries.
    #[envconfig(default = "11")]
    pub ack_max_attempts: u32,

    #[envconfig(default = "1000")]
    pub ack_backoff_ms: u64,

    #[envconfig(default = "2")]
    pub ack_backoff_coefficient: u32,

    pub ack_max_backoff_ms: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_timeout_ms: 1000,
            downstream_buffer_capacity: 16,
            ack_max_attempts: 11,
            ack_backoff_ms: 1000,
            ack_backoff_coefficient: 2,
            ack_max_backoff_ms: None,
        }
    }
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Check the settings a pipeline cannot run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.batch_size < 2 {
            return Err(PipelineError::Config(format!(
                "BATCH_SIZE must be at least 2, got {}",
                self.batch_size
            )));
        }
        if self.flush_timeout_ms == 0 {
            return Err(PipelineError::Config(
                "FLUSH_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }
        if self.downstream_buffer_capacity == 0 {
            return Err(PipelineError::Config(
                "DOWNSTREAM_BUFFER_CAPACITY must be at least 1".to_string(),
            ));
        }
        if self.ack_max_attempts == 0 {
            return Err(PipelineError::Config(
                "ACK_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Get flush timeout as Duration
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Build the retry policy used by the sink
    pub fn ack_policy(&self) -> RetryPolicy {
        let builder = RetryPolicy::build(
            self.ack_backoff_coefficient,
            Duration::from_millis(self.ack_backoff_ms),
        )
        .max_attempts(self.ack_max_attempts);

        match self.ack_max_backoff_ms {
            Some(max) => builder.maximum_interval(Duration::from_millis(max)).provide(),
            None => builder.provide(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn test_defaults_match_environment_defaults() {
        let config = from_vars(&[]);

        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.flush_timeout(), Duration::from_secs(1));
        assert_eq!(config.ack_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_ack_policy_from_environment() {
        let config = from_vars(&[
            ("ACK_MAX_ATTEMPTS", "4"),
            ("ACK_BACKOFF_MS", "50"),
            ("ACK_BACKOFF_COEFFICIENT", "3"),
            ("ACK_MAX_BACKOFF_MS", "200"),
        ]);

        let policy = config.ack_policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.retry_interval(1), Duration::from_millis(50));
        assert_eq!(policy.retry_interval(2), Duration::from_millis(150));
        assert_eq!(policy.retry_interval(3), Duration::from_millis(200));
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        let cases = [
            ("BATCH_SIZE", "1"),
            ("FLUSH_TIMEOUT_MS", "0"),
            ("DOWNSTREAM_BUFFER_CAPACITY", "0"),
            ("ACK_MAX_ATTEMPTS", "0"),
        ];

        for (var, value) in cases {
            let err = from_vars(&[(var, value)]).validate().unwrap_err();
            assert!(
                err.to_string().contains(var),
                "expected {var} in error, got {err}"
            );
        }
    }
}
