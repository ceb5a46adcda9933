//! Importer stage: external claim batches in, log entries out.
//!
//! Also hosts the reconciliation engine thread; that is why this stage
//! runs with a concurrency of one (the polling checkpoint has a single
//! writer).

use crate::bus::BusClient;
use crate::config::STAGE_IMPORTER;
use crate::error::Result;
use crate::importer::{create_claim, ReconciliationEngine};
use crate::models::{ClaimMessage, ClaimStatus, Payload};
use crate::stage::Stage;
use crate::store::ClaimsLog;
use chrono::Utc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{error, info};

pub struct ImporterStage {
    log: ClaimsLog,
    engine: Option<ReconciliationEngine>,
}

impl ImporterStage {
    pub fn new(log: ClaimsLog, engine: Option<ReconciliationEngine>) -> ImporterStage {
        ImporterStage { log, engine }
    }
}

impl Stage for ImporterStage {
    fn name(&self) -> &str {
        STAGE_IMPORTER
    }

    fn start(&mut self, stop: &Arc<AtomicBool>, _bus: &BusClient) {
        if let Some(engine) = &self.engine {
            match engine.spawn(stop.clone()) {
                Ok(_) => info!("reconciliation thread started"),
                Err(e) => error!(error = %e, "could not start reconciliation"),
            }
        }
    }

    fn process_payload(&mut self, payload: Payload, bus: &BusClient) -> Result<()> {
        let messages = payload.into_many()?;
        let now = Utc::now();
        let mut entries = Vec::with_capacity(messages.len());
        for message in &messages {
            entries.push(create_claim(
                message.identity_id()?,
                message.document_id()?,
                message.status.unwrap_or(ClaimStatus::Claimed),
                message.provenance.as_deref().unwrap_or(STAGE_IMPORTER),
                message.created.unwrap_or(now),
            ));
        }
        let inserted = self.log.insert_batch(entries)?;
        info!(claims = inserted.len(), "imported claim batch");
        for entry in &inserted {
            if entry.status.is_terminal() {
                continue;
            }
            bus.publish(&ClaimMessage::from(entry), None)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Broker, ConnectParams, MemoryBroker};
    use crate::store::Db;

    fn wired() -> (Arc<MemoryBroker>, BusClient, ImporterStage) {
        let broker = Arc::new(MemoryBroker::new());
        broker.declare_exchange("ex", true).unwrap();
        broker.declare_queue("orcid.claims", true, false).unwrap();
        broker.bind_queue("orcid.claims", "ex", "orcid.claims").unwrap();
        let mut client = BusClient::new(ConnectParams {
            exchange: "ex".to_string(),
            subscribe: None,
            publish: Some("orcid.claims".to_string()),
            forwarding: None,
        });
        client.connect(broker.clone(), None).unwrap();
        let stage = ImporterStage::new(ClaimsLog::new(Db::open_in_memory().unwrap()), None);
        (broker, client, stage)
    }

    #[test]
    fn test_batch_is_logged_and_republished_with_ids() {
        let (broker, client, mut stage) = wired();
        let payload = Payload::decode(
            br#"[{"identity_id":"0000-0001","document_id":"docA"},
                 {"identity_id":"0000-0001","document_id":"docB","status":"removed"}]"#,
        )
        .unwrap();
        stage.process_payload(payload, &client).unwrap();

        assert_eq!(stage.log.all().unwrap().len(), 2);
        let mut ids = Vec::new();
        while let Some(d) = broker
            .consume("orcid.claims", std::time::Duration::from_millis(5))
            .unwrap()
        {
            broker.ack(&d).unwrap();
            let msg: ClaimMessage = serde_json::from_slice(&d.body).unwrap();
            ids.push(msg.id.unwrap());
        }
        assert_eq!(ids.len(), 2);
        assert!(ids[0] > 0 && ids[1] > ids[0]);
    }

    #[test]
    fn test_message_without_identity_fails_the_batch() {
        let (_broker, client, mut stage) = wired();
        let payload = Payload::decode(br#"[{"document_id":"docA"}]"#).unwrap();
        assert!(stage.process_payload(payload, &client).is_err());
        assert!(stage.log.all().unwrap().is_empty());
    }
}
