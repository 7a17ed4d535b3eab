use crate::bridge::Bridge;
use crate::config::MqttConfig;
use crate::device_state::Publisher;
use crate::error::MqttError;
use rand::{distributions::Alphanumeric, Rng};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, trace, warn};

const CLIENT_ID_SUFFIX_LEN: usize = 10;
const REQUEST_CAPACITY: usize = 10;

/// Subscribes to the meter topics and feeds every message into the bridge.
pub struct MqttIngress<P: Publisher> {
    options: MqttOptions,
    topic: String,
    bridge: Arc<Bridge<P>>,
}

/// Configured client id plus a random suffix so restarts never collide with
/// a session the broker still holds.
pub fn client_id(base: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CLIENT_ID_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{base}{suffix}")
}

pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(client_id(&config.client_id), &config.broker, config.port);
    options.set_keep_alive(Duration::from_secs(30));
    if !config.user.is_empty() {
        options.set_credentials(&config.user, &config.password);
    }
    options
}

impl<P: Publisher> MqttIngress<P> {
    pub fn new(config: &MqttConfig, bridge: Arc<Bridge<P>>) -> Self {
        Self {
            options: mqtt_options(config),
            topic: config.topic.clone(),
            bridge,
        }
    }

    /// Runs until the broker connection fails.
    pub async fn run(self) -> Result<(), MqttError> {
        let (broker, port) = self.options.broker_address();
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(%broker, port, "connected to broker");
                    // Resubscribe on every connect; the session is not persistent.
                    client
                        .subscribe(self.topic.as_str(), QoS::AtLeastOnce)
                        .await
                        .map_err(|source| MqttError::Subscribe {
                            topic: self.topic.clone(),
                            source,
                        })?;
                    info!(topic = %self.topic, "subscribed");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handle_publish(&self.bridge, &publish);
                }
                Ok(_) => {}
                Err(e) => {
                    error!(%broker, port, error = %e, "connection to broker lost");
                    return Err(MqttError::ConnectionLost(e));
                }
            }
        }
    }
}

/// Applies one inbound message, logging and dropping anything unusable.
pub fn handle_publish<P: Publisher>(bridge: &Bridge<P>, publish: &Publish) {
    trace!(topic = %publish.topic, payload = ?publish.payload, "received message");
    if let Err(e) = bridge.ingest(&publish.topic, &publish.payload) {
        warn!(error = %e, "dropping message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DerivedValues, FactorConfig};
    use crate::device_state::LogPublisher;
    use crate::phase::{PhaseLine, TopicBindings};

    #[test]
    fn test_client_id_has_random_suffix() {
        let a = client_id("victron-em-bridge");
        let b = client_id("victron-em-bridge");
        assert!(a.starts_with("victron-em-bridge"));
        assert_eq!(a.len(), "victron-em-bridge".len() + CLIENT_ID_SUFFIX_LEN);
        assert!(a["victron-em-bridge".len()..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_mqtt_options_from_config() {
        let config = MqttConfig {
            broker: "10.0.0.2".to_string(),
            port: 1884,
            user: "bridge".to_string(),
            password: "secret".to_string(),
            ..Default::default()
        };
        let options = mqtt_options(&config);
        assert_eq!(options.broker_address(), ("10.0.0.2".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(
            options.credentials(),
            Some(("bridge".to_string(), "secret".to_string()))
        );
        assert!(options.client_id().starts_with("victron-em-bridge"));
    }

    #[test]
    fn test_no_credentials_without_user() {
        let options = mqtt_options(&MqttConfig::default());
        assert_eq!(options.credentials(), None);
    }

    #[test]
    fn test_handle_publish_feeds_bridge() {
        let phases = vec![PhaseLine::new(
            "L1",
            TopicBindings {
                power: "L1/Power".to_string(),
                ..Default::default()
            },
        )];
        let bridge = Bridge::new(
            phases,
            FactorConfig::default(),
            DerivedValues::Sticky,
            LogPublisher,
        );

        handle_publish(
            &bridge,
            &Publish::new("stromzaehler/L1/Power", QoS::AtLeastOnce, "920"),
        );
        handle_publish(
            &bridge,
            &Publish::new("stromzaehler/L1/Power", QoS::AtLeastOnce, "n/a"),
        );

        let line = &bridge.snapshot().phases[0];
        assert_eq!(line.power, 920.0);
        assert_eq!(line.current, 4.0);
    }
}
