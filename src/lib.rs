//! Energy Meter MQTT Bridge Library
//!
//! This library bridges per-phase meter readings published on MQTT (one topic
//! per measurement) into an emulated three-phase grid meter. Each topic is
//! resolved once to the phase field it feeds, readings are calibrated and
//! stored, missing current/power is derived, and system totals are republished
//! with energy counters held back until every phase has reported.

pub mod aggregator;
pub mod bridge;
pub mod config;
pub mod device_state;
pub mod error;
pub mod heartbeat;
pub mod mqtt;
pub mod phase;
pub mod resolver;

// Re-export commonly used types for easier access
pub use bridge::{Bridge, Snapshot};
pub use config::{Config, DerivedValues};
pub use device_state::{DeviceState, DeviceStateHandle, LogPublisher, MeterIdentity, Publisher};
pub use error::{ConfigError, IngestError, InvalidFieldError, MqttError, PublishError};
pub use heartbeat::Heartbeat;
pub use mqtt::MqttIngress;
pub use phase::{Field, PhaseLine, TopicBindings};
pub use resolver::{Binding, TopicResolver};
