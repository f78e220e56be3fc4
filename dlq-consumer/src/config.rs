use envconfig::Envconfig;

use dlq_common::config::{DlqRetryConfig, KafkaConfig, PollRetryConfig, TopicList};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    // Also the consumer group id and the consumer named in dead letters
    #[envconfig(default = "consumer-service")]
    pub service_name: String,

    #[envconfig(default = "orders")]
    pub consumer_topics: TopicList,

    #[envconfig(default = "dead-letter-queue")]
    pub dlq_topic: String,

    // Newline delimited JSON file receiving dead letters that could not be published
    pub dlq_spool_path: Option<String>,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub poll_retry: PollRetryConfig,

    #[envconfig(nested = true)]
    pub dlq_retry: DlqRetryConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
