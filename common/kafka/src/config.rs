use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "200")]
    pub kafka_retry_backoff_ms: u32, // Backoff between retries of failed broker requests
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    // Also used as the client id
    #[envconfig(default = "spine")]
    pub kafka_consumer_group: String,

    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "60000")]
    pub kafka_session_timeout_ms: u32,
}

impl ConsumerConfig {
    /// Because the consumer config is so application specific, we
    /// can't set good defaults in the derive macro, so we expose a way
    /// for users to set them here before init'ing their main config struct
    pub fn set_defaults(consumer_group: &str, consumer_topic: &str) {
        if std::env::var("KAFKA_CONSUMER_GROUP").is_err() {
            std::env::set_var("KAFKA_CONSUMER_GROUP", consumer_group);
        };
        if std::env::var("KAFKA_CONSUMER_TOPIC").is_err() {
            std::env::set_var("KAFKA_CONSUMER_TOPIC", consumer_topic);
        };
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_consumer_defaults() {
        let env = HashMap::from([("KAFKA_CONSUMER_TOPIC".to_string(), "bots".to_string())]);
        let config = ConsumerConfig::init_from_hashmap(&env).unwrap();

        assert_eq!(config.kafka_consumer_group, "spine");
        assert_eq!(config.kafka_consumer_topic, "bots");
        assert_eq!(config.kafka_consumer_offset_reset, "earliest");
        assert_eq!(config.kafka_session_timeout_ms, 60000);
    }

    #[test]
    fn test_topic_is_required() {
        assert!(ConsumerConfig::init_from_hashmap(&HashMap::new()).is_err());
    }
}
