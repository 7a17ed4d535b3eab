use std::num::ParseFloatError;
use thiserror::Error;

/// A field name outside {voltage, current, power, imported, exported}.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown phase field `{0}`")]
pub struct InvalidFieldError(pub String);

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("payload {payload:?} on topic {topic} is not a number: {source}")]
    PayloadParse {
        topic: String,
        payload: String,
        #[source]
        source: ParseFloatError,
    },

    #[error("payload {payload:?} on topic {topic} is not a finite number")]
    NonFinite { topic: String, payload: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("device state update queue is full, dropped {0}")]
    QueueFull(String),

    #[error("device state is gone, dropped {0}")]
    Closed(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no config file found (set BRIDGE_CONFIG or create one of {0:?})")]
    NotFound(Vec<String>),

    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("at least l1 is required in config")]
    MissingFirstPhase,

    #[error("phase l{0} is configured but l{1} is missing")]
    PhaseGap(usize, usize),

    #[error("calibration factor for {0} must be a finite number")]
    InvalidFactor(&'static str),

    #[error("unknown log level `{0}`")]
    InvalidLogLevel(String),
}

#[derive(Error, Debug)]
pub enum MqttError {
    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },

    #[error("connection to broker lost: {0}")]
    ConnectionLost(#[from] rumqttc::ConnectionError),
}
