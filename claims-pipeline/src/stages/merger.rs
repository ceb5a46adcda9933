//! Merger stage: place the enriched claim into the document's author
//! arrays.

use crate::bus::BusClient;
use crate::config::STAGE_MERGER;
use crate::error::{PipelineError, Result};
use crate::matcher::{apply_claim, AuthorPositionRecord, PositionClaim};
use crate::models::Payload;
use crate::stage::Stage;
use crate::store::{DocumentStore, RecordsStore};
use serde_json::json;
use tracing::{debug, info};

pub struct MergerStage {
    documents: DocumentStore,
    records: RecordsStore,
    min_ratio: f64,
}

impl MergerStage {
    pub fn new(documents: DocumentStore, records: RecordsStore, min_ratio: f64) -> MergerStage {
        MergerStage {
            documents,
            records,
            min_ratio,
        }
    }
}

impl Stage for MergerStage {
    fn name(&self) -> &str {
        STAGE_MERGER
    }

    fn process_payload(&mut self, payload: Payload, bus: &BusClient) -> Result<()> {
        let message = payload.into_one()?;
        let document_id = message.document_id()?.to_string();
        let identity_id = message.identity_id()?.to_string();

        let authors = self.documents.authors(&document_id)?.ok_or_else(|| {
            PipelineError::malformed(&document_id, "document has no author record")
        })?;
        let mut record = match self.records.claims(&document_id)? {
            Some(existing) => serde_json::from_value(existing)?,
            None => AuthorPositionRecord::default(),
        };
        // the publication database wins on author-list content
        record.authors = authors;

        let claim = PositionClaim {
            identity_id: identity_id.clone(),
            status: message.status,
            verified: message
                .extra
                .get("linked_account_id")
                .map(|v| !v.is_null())
                .unwrap_or(false),
            author: message.string_list("author"),
            registry_name: message.string_list("registry_name"),
            author_norm: message.string_list("author_norm"),
        };

        match apply_claim(&mut record, &claim, self.min_ratio)? {
            Some(position) => {
                debug!(
                    document = document_id.as_str(),
                    identity = identity_id.as_str(),
                    position,
                    "claim merged"
                );
                self.records
                    .record_claims(&document_id, &serde_json::to_value(&record)?)?;
                info!(document = document_id.as_str(), "author record updated");
                bus.publish(
                    &json!({
                        "document_id": document_id,
                        "authors": record.authors,
                        "verified": record.verified,
                        "unverified": record.unverified,
                    }),
                    None,
                )
            }
            None => Err(PipelineError::NoMatch {
                document_id,
                identity_id,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Broker, ConnectParams, MemoryBroker};
    use crate::matcher::PLACEHOLDER;
    use crate::models::ClaimMessage;
    use crate::store::Db;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn wired() -> (Arc<MemoryBroker>, BusClient, MergerStage) {
        let db = Db::open_in_memory().unwrap();
        let documents = DocumentStore::new(db.clone());
        documents
            .put(
                "2015ApJ...1B",
                &[
                    "Accomazzi, Alberto".to_string(),
                    "Stern, Daniel".to_string(),
                    "Zhang, William W.".to_string(),
                ],
                None,
            )
            .unwrap();
        let stage = MergerStage::new(documents, RecordsStore::new(db), 0.6);

        let broker = Arc::new(MemoryBroker::new());
        broker.declare_exchange("ex", true).unwrap();
        broker.declare_queue("orcid.output", true, false).unwrap();
        broker
            .bind_queue("orcid.output", "ex", "orcid.output")
            .unwrap();
        let mut client = BusClient::new(ConnectParams {
            exchange: "ex".to_string(),
            subscribe: None,
            publish: Some("orcid.output".to_string()),
            forwarding: None,
        });
        client.connect(broker.clone(), None).unwrap();
        (broker, client, stage)
    }

    fn claim_payload(verified: bool, status: &str) -> Payload {
        let linked = if verified { json!(7) } else { json!(null) };
        Payload::from_value(json!({
            "document_id": "2015ApJ...1B",
            "identity_id": "0000-0001",
            "status": status,
            "author": ["Stern, D."],
            "linked_account_id": linked,
        }))
    }

    #[test]
    fn test_claim_lands_in_the_right_slot_and_array() {
        let (broker, client, mut stage) = wired();
        stage
            .process_payload(claim_payload(true, "claimed"), &client)
            .unwrap();

        let record: AuthorPositionRecord = serde_json::from_value(
            stage.records.claims("2015ApJ...1B").unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(record.verified, vec![PLACEHOLDER, "0000-0001", PLACEHOLDER]);
        assert!(record.unverified.is_empty());

        let d = broker
            .consume("orcid.output", Duration::from_millis(10))
            .unwrap()
            .unwrap();
        let summary: ClaimMessage = serde_json::from_slice(&d.body).unwrap();
        assert_eq!(summary.document_id, "2015ApJ...1B");
        assert_eq!(summary.string_list("verified")[1], "0000-0001");
    }

    #[test]
    fn test_removal_restores_the_placeholder() {
        let (_broker, client, mut stage) = wired();
        stage
            .process_payload(claim_payload(false, "claimed"), &client)
            .unwrap();
        stage
            .process_payload(claim_payload(false, "removed"), &client)
            .unwrap();
        let record: AuthorPositionRecord = serde_json::from_value(
            stage.records.claims("2015ApJ...1B").unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(
            record.unverified,
            vec![PLACEHOLDER, PLACEHOLDER, PLACEHOLDER]
        );
    }

    #[test]
    fn test_unmatched_claim_is_a_no_match_error() {
        let (_broker, client, mut stage) = wired();
        let payload = Payload::from_value(json!({
            "document_id": "2015ApJ...1B",
            "identity_id": "0000-0002",
            "author": ["Completely Different"],
        }));
        let err = stage.process_payload(payload, &client).unwrap_err();
        assert!(matches!(err, PipelineError::NoMatch { .. }));
        // a failed match leaves no record behind
        assert!(stage.records.claims("2015ApJ...1B").unwrap().is_none());
    }

    #[test]
    fn test_unknown_document_is_malformed() {
        let (_broker, client, mut stage) = wired();
        let payload = Payload::from_value(json!({
            "document_id": "unknown",
            "identity_id": "0000-0001",
            "author": ["Stern, D."],
        }));
        let err = stage.process_payload(payload, &client).unwrap_err();
        assert!(err.is_unit_local());
    }
}
