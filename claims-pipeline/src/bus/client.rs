//! Stage-side bus client: one subscribe topic, one publish topic, and an
//! optional forwarding channel onto a second, independently configured
//! topology.

use super::{Broker, Delivery};
use crate::config::{ForwardingConfig, StageConfig};
use crate::error::{PipelineError, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// How long one consume call blocks before the loop re-checks its stop
/// flag.
const CONSUME_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub exchange: String,
    pub subscribe: Option<String>,
    pub publish: Option<String>,
    pub forwarding: Option<ForwardParams>,
}

#[derive(Debug, Clone)]
pub struct ForwardParams {
    pub exchange: String,
    pub publish: Option<String>,
}

impl ConnectParams {
    pub fn for_stage(exchange: &str, stage: &StageConfig) -> ConnectParams {
        ConnectParams {
            exchange: exchange.to_string(),
            subscribe: stage.subscribe.clone(),
            publish: stage.publish.clone(),
            forwarding: stage.forwarding.as_ref().map(ForwardParams::from),
        }
    }
}

impl From<&ForwardingConfig> for ForwardParams {
    fn from(f: &ForwardingConfig) -> Self {
        ForwardParams {
            exchange: f.exchange.clone(),
            publish: f.publish.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BusClient {
    params: ConnectParams,
    broker: Option<Arc<dyn Broker>>,
    fwd_broker: Option<Arc<dyn Broker>>,
    single_shot: bool,
}

impl BusClient {
    pub fn new(params: ConnectParams) -> BusClient {
        BusClient {
            params,
            broker: None,
            fwd_broker: None,
            single_shot: false,
        }
    }

    /// Process at most one message per subscribe call, then return.
    /// Test/ops mode.
    pub fn single_shot(mut self) -> BusClient {
        self.single_shot = true;
        self
    }

    /// Attach to the broker(s). The configured subscribe/publish queues
    /// must already exist (declared by the supervisor); forwarding
    /// requires its explicit target exchange.
    pub fn connect(
        &mut self,
        broker: Arc<dyn Broker>,
        fwd_broker: Option<Arc<dyn Broker>>,
    ) -> Result<()> {
        for queue in [&self.params.subscribe, &self.params.publish]
            .into_iter()
            .flatten()
        {
            broker.declare_queue(queue, true, true)?;
        }
        if let Some(fwd) = &self.params.forwarding {
            if fwd.exchange.is_empty() {
                return Err(PipelineError::Config(
                    "an exchange must be specified for forwarding".to_string(),
                ));
            }
            let target = fwd_broker.unwrap_or_else(|| broker.clone());
            if let Some(queue) = &fwd.publish {
                target.declare_queue(queue, true, true)?;
            }
            self.fwd_broker = Some(target);
        }
        self.broker = Some(broker);
        Ok(())
    }

    /// Publish onto the primary topology. Non-string payloads are
    /// serialized to JSON. Deliberately non-fatal: a missing topic or an
    /// unconnected channel logs an error and drops the message, so a
    /// misconfigured stage degrades instead of crashing.
    pub fn publish<T: Serialize>(&self, message: &T, topic: Option<&str>) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        self.publish_raw(&body, topic)
    }

    pub fn publish_raw(&self, body: &[u8], topic: Option<&str>) -> Result<()> {
        let Some(topic) = topic.or(self.params.publish.as_deref()) else {
            error!("no topic/queue configured for publish");
            return Ok(());
        };
        let Some(broker) = &self.broker else {
            error!("publish() called before connect()");
            return Ok(());
        };
        debug!(exchange = %self.params.exchange, topic, "publishing");
        broker.publish(&self.params.exchange, topic, body)
    }

    /// Relay onto the secondary topology. Unlike [`publish`], a missing
    /// forwarding channel fails loudly.
    pub fn forward<T: Serialize>(&self, message: &T, topic: Option<&str>) -> Result<()> {
        let fwd = self.params.forwarding.as_ref().ok_or_else(|| {
            PipelineError::Config("no forwarding topology configured".to_string())
        })?;
        let Some(topic) = topic.or(fwd.publish.as_deref()) else {
            error!("no forwarding topic/queue configured");
            return Ok(());
        };
        let broker = self.fwd_broker.as_ref().ok_or_else(|| {
            PipelineError::Connection("forward() called before connect()".to_string())
        })?;
        debug!(exchange = %fwd.exchange, topic, "forwarding");
        broker.publish(&fwd.exchange, topic, &serde_json::to_vec(message)?)
    }

    /// Consume the subscribe queue with exactly one unacknowledged
    /// message in flight. The handler runs per delivery; acknowledgment
    /// happens here, after the handler returns, exactly once regardless
    /// of what the handler did. Loops until the stop flag is set, or
    /// after one message in single-shot mode.
    pub fn subscribe<F>(&self, stop: &AtomicBool, mut handler: F) -> Result<()>
    where
        F: FnMut(&BusClient, &Delivery),
    {
        let Some(queue) = self.params.subscribe.clone() else {
            debug!("no subscribe queue configured; nothing to consume");
            return Ok(());
        };
        let broker = self.broker.as_ref().ok_or_else(|| {
            PipelineError::Connection("subscribe() called before connect()".to_string())
        })?;
        debug!(queue, "consuming");
        loop {
            if stop.load(Ordering::Relaxed) {
                return Ok(());
            }
            let Some(delivery) = broker.consume(&queue, CONSUME_POLL)? else {
                if self.single_shot {
                    return Ok(());
                }
                continue;
            };
            handler(self, &delivery);
            broker.ack(&delivery)?;
            if self.single_shot {
                return Ok(());
            }
        }
    }
}
