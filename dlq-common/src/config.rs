use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

use crate::retry::{PollRetry, RetryPolicy};

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "100000")]
    pub kafka_producer_queue_messages: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    // Number of enqueued messages whose delivery report has not been drained yet.
    // Publishing waits for room once this is full.
    #[envconfig(default = "10000")]
    pub kafka_delivery_queue_size: usize,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,

    #[envconfig(default = "10000")]
    pub kafka_consumer_session_timeout_ms: u32,

    // Messages buffered per partition claim before the poll loop waits on the handler
    #[envconfig(default = "100")]
    pub kafka_claim_buffer: usize,
}

#[derive(Envconfig, Clone, Debug)]
pub struct PollRetryConfig {
    #[envconfig(default = "backoff")]
    pub poll_retry_mode: PollRetryMode,

    #[envconfig(default = "2")]
    pub poll_retry_backoff_coefficient: u32,

    #[envconfig(default = "500")]
    pub poll_retry_initial_interval: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub poll_retry_maximum_interval: EnvMsDuration,
}

impl PollRetryConfig {
    pub fn strategy(&self) -> PollRetry {
        match self.poll_retry_mode {
            PollRetryMode::Immediate => PollRetry::Immediate,
            PollRetryMode::Backoff => PollRetry::Backoff(RetryPolicy::new(
                self.poll_retry_backoff_coefficient,
                self.poll_retry_initial_interval.0,
                self.poll_retry_maximum_interval.0,
            )),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct DlqRetryConfig {
    #[envconfig(default = "5")]
    pub dlq_send_max_attempts: u32,

    #[envconfig(default = "2")]
    pub dlq_send_backoff_coefficient: u32,

    #[envconfig(default = "100")]
    pub dlq_send_initial_interval: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub dlq_send_maximum_interval: EnvMsDuration,
}

impl DlqRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.dlq_send_backoff_coefficient,
            self.dlq_send_initial_interval.0,
            self.dlq_send_maximum_interval.0,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollRetryMode {
    Immediate,
    Backoff,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsePollRetryModeError(String);

impl std::fmt::Display for ParsePollRetryModeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} is not a valid poll retry mode", self.0)
    }
}

impl FromStr for PollRetryMode {
    type Err = ParsePollRetryModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(PollRetryMode::Immediate),
            "backoff" => Ok(PollRetryMode::Backoff),
            invalid => Err(ParsePollRetryModeError(invalid.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "duration must be a whole number of milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

/// A comma separated, non-empty list of topic names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicList(pub Vec<String>);

#[derive(Debug, PartialEq, Eq)]
pub struct TopicListIsEmptyError;

impl std::fmt::Display for TopicListIsEmptyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "at least one topic is required")
    }
}

impl FromStr for TopicList {
    type Err = TopicListIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let topics: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .map(str::to_owned)
            .collect();

        if topics.is_empty() {
            Err(TopicListIsEmptyError)
        } else {
            Ok(TopicList(topics))
        }
    }
}
