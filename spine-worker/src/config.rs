use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "false")]
    pub export_prometheus: bool,

    #[envconfig(default = "0.0.0.0:9102")]
    pub metrics_bind_address: String,

    #[envconfig(nested = true)]
    pub pipeline: spine::Config,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        ConsumerConfig::set_defaults("spine-worker", "messages");
        Config::init_from_env()
    }
}
