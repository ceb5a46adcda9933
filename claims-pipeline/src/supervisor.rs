//! Worker fleet supervision.
//!
//! The supervisor owns the broker topology (it is the only place queues
//! are actively declared), spawns the configured number of instances per
//! stage on dedicated threads, and polls the fleet: dead instances are
//! reaped, their unacknowledged deliveries recovered, and a replacement
//! spawned; long-lived instances past their TTL are recycled the same
//! way.

use crate::bus::{Broker, BusClient, ConnectParams};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::stage::{Stage, StageRunner};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Builds a fresh stage instance for every (re)spawn.
pub type StageFactory = Arc<dyn Fn() -> Result<Box<dyn Stage>> + Send + Sync>;

/// Actively declare the exchange, every stage queue and the bindings that
/// route by queue name. Forwarding targets are declared on their own
/// broker. Idempotent; workers later attach passively.
pub fn declare_topology(
    config: &Config,
    broker: &Arc<dyn Broker>,
    fwd_broker: Option<&Arc<dyn Broker>>,
) -> Result<()> {
    broker.declare_exchange(&config.exchange, true)?;
    for (name, stage) in &config.stages {
        for queue in [&stage.subscribe, &stage.publish, &stage.error]
            .into_iter()
            .flatten()
        {
            broker.declare_queue(queue, stage.durable, false)?;
            broker.bind_queue(queue, &config.exchange, queue)?;
        }
        if let Some(fwd) = &stage.forwarding {
            let target = fwd_broker.unwrap_or(broker);
            target.declare_exchange(&fwd.exchange, true)?;
            if let Some(queue) = &fwd.publish {
                target.declare_queue(queue, stage.durable, false)?;
                target.bind_queue(queue, &fwd.exchange, queue)?;
            }
        }
        info!(stage = name.as_str(), "topology declared");
    }
    Ok(())
}

/// Drop every message sitting on the pipeline's own queues. Forwarding
/// queues belong to their downstream consumer and are left alone.
pub fn purge_queues(config: &Config, broker: &Arc<dyn Broker>) -> Result<usize> {
    let mut purged = 0;
    for stage in config.stages.values() {
        for queue in [&stage.subscribe, &stage.publish, &stage.error]
            .into_iter()
            .flatten()
        {
            let n = broker.purge_queue(queue)?;
            if n > 0 {
                info!(queue = queue.as_str(), purged = n, "queue purged");
            }
            purged += n;
        }
    }
    Ok(purged)
}

struct Instance {
    stage_name: String,
    handle: JoinHandle<()>,
    started: Instant,
    stop: Arc<AtomicBool>,
}

pub struct Supervisor {
    config: Config,
    broker: Arc<dyn Broker>,
    fwd_broker: Option<Arc<dyn Broker>>,
    factories: BTreeMap<String, StageFactory>,
    instances: Vec<Instance>,
    stop: Arc<AtomicBool>,
    single_shot: bool,
}

impl Supervisor {
    pub fn new(
        config: Config,
        broker: Arc<dyn Broker>,
        fwd_broker: Option<Arc<dyn Broker>>,
    ) -> Supervisor {
        Supervisor {
            config,
            broker,
            fwd_broker,
            factories: BTreeMap::new(),
            instances: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            single_shot: false,
        }
    }

    /// Every instance processes at most one message and exits; the poll
    /// loop then returns instead of respawning. Test/ops mode.
    pub fn single_shot(mut self) -> Supervisor {
        self.single_shot = true;
        self
    }

    pub fn register<F>(&mut self, stage_name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(stage_name.to_string(), Arc::new(factory));
    }

    /// Spawn every registered stage up to its configured concurrency.
    pub fn start_workers(&mut self) -> Result<()> {
        let names: Vec<String> = self.factories.keys().cloned().collect();
        for name in names {
            let concurrency = self.config.stage(&name)?.concurrency.max(1);
            for _ in 0..concurrency {
                let instance = self.spawn_instance(&name)?;
                self.instances.push(instance);
            }
        }
        info!(instances = self.instances.len(), "fleet started");
        Ok(())
    }

    fn spawn_instance(&self, stage_name: &str) -> Result<Instance> {
        let factory = self.factories.get(stage_name).ok_or_else(|| {
            PipelineError::Config(format!("no factory registered for stage {:?}", stage_name))
        })?;
        let stage_config = self.config.stage(stage_name)?;
        let mut client = BusClient::new(ConnectParams::for_stage(&self.config.exchange, stage_config));
        if self.single_shot {
            client = client.single_shot();
        }
        client.connect(self.broker.clone(), self.fwd_broker.clone())?;
        let stage = factory()?;
        let error_topic = stage_config.error.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let name = stage_name.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("stage-{}", stage_name))
            .spawn(move || {
                let mut runner = StageRunner::new(stage, client, error_topic);
                if let Err(e) = runner.run(&thread_stop) {
                    error!(stage = name.as_str(), error = %e, "stage instance terminated");
                }
            })
            .map_err(|e| PipelineError::Connection(format!("spawn failed: {}", e)))?;
        Ok(Instance {
            stage_name: stage_name.to_string(),
            handle,
            started: Instant::now(),
            stop,
        })
    }

    /// Supervise until [`Supervisor::request_stop`] (or, in single-shot
    /// mode, until the fleet drains).
    pub fn poll_loop(&mut self) -> Result<()> {
        let poll = Duration::from_secs(self.config.supervisor.poll_interval_secs.max(1));
        let ttl = Duration::from_secs(self.config.supervisor.ttl_secs);
        loop {
            if self.single_shot {
                self.join_all();
                return Ok(());
            }
            self.sleep_interruptibly(poll);
            if self.stop.load(Ordering::Relaxed) {
                self.shutdown();
                return Ok(());
            }
            self.reap_finished()?;
            if !ttl.is_zero() {
                self.recycle_expired(ttl)?;
            }
        }
    }

    /// Handle callers (signal handlers, tests) use to end the poll loop.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    fn sleep_interruptibly(&self, total: Duration) {
        let step = Duration::from_millis(200);
        let deadline = Instant::now() + total;
        while !self.stop.load(Ordering::Relaxed) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            std::thread::sleep(step.min(remaining));
        }
    }

    /// Join exited instances, requeue whatever they left unacknowledged,
    /// and spawn replacements.
    fn reap_finished(&mut self) -> Result<()> {
        let mut respawn = Vec::new();
        let mut alive = Vec::new();
        for instance in std::mem::take(&mut self.instances) {
            if instance.handle.is_finished() {
                warn!(stage = instance.stage_name.as_str(), "instance died, respawning");
                self.recover_subscription(&instance.stage_name);
                let _ = instance.handle.join();
                respawn.push(instance.stage_name);
            } else {
                alive.push(instance);
            }
        }
        self.instances = alive;
        for stage_name in respawn {
            let instance = self.spawn_instance(&stage_name)?;
            self.instances.push(instance);
        }
        Ok(())
    }

    /// Stop, join and replace instances past their TTL, one at a time so
    /// the fleet never loses more than one instance per stage at once.
    fn recycle_expired(&mut self, ttl: Duration) -> Result<()> {
        let mut expired = Vec::new();
        let mut kept = Vec::new();
        for instance in std::mem::take(&mut self.instances) {
            if instance.started.elapsed() >= ttl {
                expired.push(instance);
            } else {
                kept.push(instance);
            }
        }
        self.instances = kept;
        for instance in expired {
            info!(stage = instance.stage_name.as_str(), "recycling aged instance");
            instance.stop.store(true, Ordering::Relaxed);
            let _ = instance.handle.join();
            self.recover_subscription(&instance.stage_name);
            let replacement = self.spawn_instance(&instance.stage_name)?;
            self.instances.push(replacement);
        }
        Ok(())
    }

    fn recover_subscription(&self, stage_name: &str) {
        let Ok(stage_config) = self.config.stage(stage_name) else {
            return;
        };
        if let Some(queue) = &stage_config.subscribe {
            match self.broker.recover(queue) {
                Ok(0) => {}
                Ok(n) => info!(queue = queue.as_str(), requeued = n, "recovered deliveries"),
                Err(e) => error!(queue = queue.as_str(), error = %e, "recover failed"),
            }
        }
    }

    fn join_all(&mut self) {
        for instance in self.instances.drain(..) {
            let _ = instance.handle.join();
        }
    }

    /// Signal every instance and wait for the threads to exit. Messages
    /// still queued stay on the broker for the next run.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for instance in &self.instances {
            instance.stop.store(true, Ordering::Relaxed);
        }
        self.join_all();
        info!("fleet stopped");
    }
}
