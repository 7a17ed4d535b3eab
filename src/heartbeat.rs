use crate::bridge::Bridge;
use crate::device_state::Publisher;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// Periodic liveness log of how many messages the bridge applied.
pub struct Heartbeat<P: Publisher> {
    bridge: Arc<Bridge<P>>,
    period: Duration,
}

impl<P: Publisher + 'static> Heartbeat<P> {
    pub fn new(bridge: Arc<Bridge<P>>, period: Duration) -> Self {
        Self { bridge, period }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.beat();
        }
    }

    /// Logs and resets the processed counter, returning its value.
    pub fn beat(&self) -> u64 {
        let processed = self.bridge.take_processed();
        if processed == 0 {
            warn!(
                period_secs = self.period.as_secs(),
                "no meter updates processed"
            );
        } else {
            info!(updates_processed = processed, "still alive");
        }
        processed
    }
}
