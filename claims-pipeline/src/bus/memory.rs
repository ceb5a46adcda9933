//! In-process broker with topic-exchange routing.
//!
//! Stands in for an external broker in single-process deployments and
//! tests: routing keys are matched exactly against bindings, consumers
//! block on a condvar, and unacknowledged deliveries can be recovered
//! back onto their queue.

use super::{Broker, Delivery};
use crate::error::{PipelineError, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Default)]
struct QueueState {
    #[allow(dead_code)]
    durable: bool,
    messages: VecDeque<(u64, Vec<u8>)>,
    unacked: BTreeMap<u64, Vec<u8>>,
}

#[derive(Default)]
struct ExchangeState {
    /// routing key -> bound queue names
    bindings: HashMap<String, Vec<String>>,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
    next_tag: u64,
}

#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    available: Condvar,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| PipelineError::Connection("broker lock poisoned".to_string()))
    }
}

fn queue_mut<'a>(inner: &'a mut Inner, name: &str) -> Result<&'a mut QueueState> {
    inner
        .queues
        .get_mut(name)
        .ok_or_else(|| PipelineError::Connection(format!("no queue named {:?}", name)))
}

impl Broker for MemoryBroker {
    fn declare_exchange(&self, name: &str, _durable: bool) -> Result<()> {
        let mut inner = self.lock()?;
        inner.exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    fn declare_queue(&self, name: &str, durable: bool, passive: bool) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.queues.contains_key(name) {
            return Ok(());
        }
        if passive {
            return Err(PipelineError::Connection(format!(
                "queue {:?} does not exist (passive declare)",
                name
            )));
        }
        inner.queues.insert(
            name.to_string(),
            QueueState {
                durable,
                ..QueueState::default()
            },
        );
        Ok(())
    }

    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.queues.contains_key(queue) {
            return Err(PipelineError::Connection(format!(
                "cannot bind unknown queue {:?}",
                queue
            )));
        }
        let ex = inner
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| PipelineError::Connection(format!("no exchange named {:?}", exchange)))?;
        let bound = ex.bindings.entry(routing_key.to_string()).or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let mut inner = self.lock()?;
        let targets: Vec<String> = inner
            .exchanges
            .get(exchange)
            .ok_or_else(|| PipelineError::Connection(format!("no exchange named {:?}", exchange)))?
            .bindings
            .get(routing_key)
            .cloned()
            .unwrap_or_default();
        if targets.is_empty() {
            debug!(exchange, routing_key, "dropping unroutable message");
            return Ok(());
        }
        for target in targets {
            let tag = inner.next_tag;
            inner.next_tag += 1;
            queue_mut(&mut inner, &target)?
                .messages
                .push_back((tag, body.to_vec()));
        }
        self.available.notify_all();
        Ok(())
    }

    fn consume(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock()?;
        loop {
            let state = queue_mut(&mut inner, queue)?;
            if let Some((tag, body)) = state.messages.pop_front() {
                state.unacked.insert(tag, body.clone());
                return Ok(Some(Delivery {
                    queue: queue.to_string(),
                    body,
                    tag,
                }));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .available
                .wait_timeout(inner, deadline - now)
                .map_err(|_| PipelineError::Connection("broker lock poisoned".to_string()))?;
            inner = guard;
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut inner = self.lock()?;
        queue_mut(&mut inner, &delivery.queue)?
            .unacked
            .remove(&delivery.tag);
        Ok(())
    }

    fn recover(&self, queue: &str) -> Result<usize> {
        let mut inner = self.lock()?;
        let state = queue_mut(&mut inner, queue)?;
        let unacked = std::mem::take(&mut state.unacked);
        let count = unacked.len();
        // oldest first, ahead of anything newly published
        for (tag, body) in unacked.into_iter().rev() {
            state.messages.push_front((tag, body));
        }
        if count > 0 {
            self.available.notify_all();
        }
        Ok(count)
    }

    fn purge_queue(&self, name: &str) -> Result<usize> {
        let mut inner = self.lock()?;
        let state = queue_mut(&mut inner, name)?;
        let purged = state.messages.len();
        state.messages.clear();
        Ok(purged)
    }

    fn queue_depth(&self, name: &str) -> Result<usize> {
        let mut inner = self.lock()?;
        Ok(queue_mut(&mut inner, name)?.messages.len())
    }
}
