//! The worker-stage wrapper: decode -> process -> ack/dead-letter.
//!
//! A concrete stage only supplies `process_payload`; everything around it
//! (decoding, error diversion, the at-most-once acknowledgment) lives in
//! [`StageRunner`] so every stage fails the same way.

use crate::bus::{BusClient, Delivery};
use crate::error::Result;
use crate::models::Payload;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, warn};

pub trait Stage: Send {
    fn name(&self) -> &str;

    /// Hook run once before the consume loop starts; the importer uses
    /// it to spawn its reconciliation thread.
    fn start(&mut self, _stop: &Arc<AtomicBool>, _bus: &BusClient) {}

    /// Process one decoded message. May publish/forward zero or more
    /// times through `bus`; an `Err` diverts the original message to the
    /// error topic.
    fn process_payload(&mut self, payload: Payload, bus: &BusClient) -> Result<()>;
}

pub struct StageRunner {
    stage: Box<dyn Stage>,
    client: BusClient,
    error_topic: Option<String>,
}

impl StageRunner {
    pub fn new(stage: Box<dyn Stage>, client: BusClient, error_topic: Option<String>) -> Self {
        StageRunner {
            stage,
            client,
            error_topic,
        }
    }

    /// Consume until the stop flag is set (or one message in single-shot
    /// mode). Every received message is acknowledged exactly once,
    /// whatever its processing outcome; failed messages are re-published
    /// raw to the error topic, tagged with the stage name, and never
    /// retried here.
    pub fn run(&mut self, stop: &Arc<AtomicBool>) -> Result<()> {
        let stage = &mut self.stage;
        let error_topic = self.error_topic.as_deref();
        stage.start(stop, &self.client);
        self.client.subscribe(stop, |bus, delivery| {
            Self::on_message(stage.as_mut(), error_topic, bus, delivery)
        })
    }

    fn on_message(
        stage: &mut dyn Stage,
        error_topic: Option<&str>,
        bus: &BusClient,
        delivery: &Delivery,
    ) {
        debug!(stage = stage.name(), "received message");
        let outcome = Payload::decode(&delivery.body)
            .and_then(|payload| stage.process_payload(payload, bus));
        if let Err(e) = outcome {
            warn!(stage = stage.name(), error = %e, "diverting message to the error topic");
            // keep the original bytes; parse only to avoid double-encoding
            let original = serde_json::from_slice::<serde_json::Value>(&delivery.body)
                .unwrap_or_else(|_| {
                    serde_json::Value::String(String::from_utf8_lossy(&delivery.body).into_owned())
                });
            let envelope = serde_json::json!({ stage.name(): original });
            if let Err(publish_err) = bus.publish(&envelope, error_topic) {
                warn!(stage = stage.name(), error = %publish_err, "error-topic publish failed");
            }
        }
    }
}
