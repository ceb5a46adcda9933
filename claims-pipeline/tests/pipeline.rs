//! End-to-end pipeline tests against the in-process broker: a claim
//! enters on the fresh-claims topic (or from the registry feed) and a
//! reindex request comes out on the indexer exchange.

use claims_pipeline::bus::{Broker, BusClient, ConnectParams, MemoryBroker};
use claims_pipeline::config::{
    Config, STAGE_ENRICHER, STAGE_IMPORTER, STAGE_MERGER, STAGE_OUTPUT,
};
use claims_pipeline::error::Result;
use claims_pipeline::identity::{IdentityDirectory, ProfileLookup};
use claims_pipeline::importer::ReconciliationEngine;
use claims_pipeline::matcher::{AuthorPositionRecord, PLACEHOLDER};
use claims_pipeline::models::{AccountStatus, IdentityRecord};
use claims_pipeline::registry::{RegistryUpdate, UpdatesSource};
use claims_pipeline::stage::{Stage, StageRunner};
use claims_pipeline::stages::{EnricherStage, ImporterStage, MergerStage, OutputStage};
use claims_pipeline::store::{
    Checkpoint, ClaimsLog, Db, DocumentStore, IdentityStore, RecordsStore,
};
use claims_pipeline::supervisor::{declare_topology, Supervisor};
use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct NoNetwork;

impl ProfileLookup for NoNetwork {
    fn public_profile(&self, _identity_id: &str) -> Result<Option<Value>> {
        Ok(None)
    }
    fn search_documents(&self, _identity_id: &str) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }
}

struct Fixture {
    config: Config,
    broker: Arc<MemoryBroker>,
    db: Db,
    directory: Arc<IdentityDirectory>,
}

impl Fixture {
    /// A declared topology plus a document and a known, platform-linked
    /// identity whose claims should land in the verified array.
    fn new() -> Fixture {
        let mut config = Config::default();
        config.supervisor.poll_interval_secs = 1;
        let broker = Arc::new(MemoryBroker::new());
        {
            let as_broker: Arc<dyn Broker> = broker.clone();
            declare_topology(&config, &as_broker, None).unwrap();
        }

        let db = Db::open_in_memory().unwrap();
        DocumentStore::new(db.clone())
            .put(
                "2015ApJ...800....1A",
                &[
                    "Accomazzi, Alberto".to_string(),
                    "Stern, Daniel".to_string(),
                    "Zhang, William W.".to_string(),
                ],
                None,
            )
            .unwrap();
        let identities = IdentityStore::new(db.clone());
        let mut variants = BTreeMap::new();
        variants.insert("author".to_string(), vec!["Stern, D.".to_string()]);
        let now = Utc::now();
        identities
            .insert(IdentityRecord {
                id: 0,
                identity_id: "0000-0003-2686-9241".to_string(),
                display_name: "Stern, Daniel".to_string(),
                name_variants: variants,
                account_status: AccountStatus::Active,
                linked_account_id: Some(7),
                created: now,
                updated: now,
            })
            .unwrap();
        let directory = Arc::new(IdentityDirectory::new(
            identities,
            Arc::new(NoNetwork),
            16,
            Duration::from_secs(3600),
        ));
        Fixture {
            config,
            broker,
            db,
            directory,
        }
    }

    fn client_for(&self, stage_name: &str) -> BusClient {
        let stage = self.config.stage(stage_name).unwrap();
        let mut client =
            BusClient::new(ConnectParams::for_stage(&self.config.exchange, stage)).single_shot();
        client.connect(self.broker.clone(), None).unwrap();
        client
    }

    /// Run one stage over exactly one message, the way a fleet instance
    /// would.
    fn run_stage(&self, stage_name: &str, stage: Box<dyn Stage>) {
        let error_topic = self.config.stage(stage_name).unwrap().error.clone();
        let mut runner = StageRunner::new(stage, self.client_for(stage_name), error_topic);
        let stop = Arc::new(AtomicBool::new(false));
        runner.run(&stop).unwrap();
    }

    fn run_chain_after_import(&self) {
        self.run_stage(
            STAGE_ENRICHER,
            Box::new(EnricherStage::new(self.directory.clone())),
        );
        self.run_stage(
            STAGE_MERGER,
            Box::new(MergerStage::new(
                DocumentStore::new(self.db.clone()),
                RecordsStore::new(self.db.clone()),
                self.config.min_similarity_ratio,
            )),
        );
        self.run_stage(
            STAGE_OUTPUT,
            Box::new(OutputStage::new(RecordsStore::new(self.db.clone()))),
        );
    }

    fn take(&self, queue: &str) -> Option<Vec<u8>> {
        let delivery = self.broker.consume(queue, Duration::from_millis(10)).unwrap()?;
        self.broker.ack(&delivery).unwrap();
        Some(delivery.body)
    }
}

#[test]
fn test_fresh_claim_travels_the_whole_chain() {
    let fixture = Fixture::new();
    fixture
        .broker
        .publish(
            &fixture.config.exchange,
            "orcid.fresh-claims",
            br#"[{"identity_id":"0000-0003-2686-9241","document_id":"2015ApJ...800....1A"}]"#,
        )
        .unwrap();

    fixture.run_stage(
        STAGE_IMPORTER,
        Box::new(ImporterStage::new(ClaimsLog::new(fixture.db.clone()), None)),
    );
    fixture.run_chain_after_import();

    // the indexer got exactly the finished document
    let body = fixture.take("indexer.updates").unwrap();
    let ids: Vec<String> = serde_json::from_slice(&body).unwrap();
    assert_eq!(ids, vec!["2015ApJ...800....1A"]);

    // the claim landed at Stern's position in the verified array
    let record: AuthorPositionRecord = serde_json::from_value(
        RecordsStore::new(fixture.db.clone())
            .claims("2015ApJ...800....1A")
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(
        record.verified,
        vec![PLACEHOLDER, "0000-0003-2686-9241", PLACEHOLDER]
    );

    // nothing was dead-lettered, everything was acknowledged
    assert_eq!(fixture.broker.queue_depth("orcid.error").unwrap(), 0);
    for queue in ["orcid.fresh-claims", "orcid.claims", "orcid.updates", "orcid.output"] {
        assert_eq!(fixture.broker.recover(queue).unwrap(), 0, "{}", queue);
        assert_eq!(fixture.broker.queue_depth(queue).unwrap(), 0, "{}", queue);
    }
}

#[test]
fn test_supervised_fleet_drains_the_same_chain() {
    let fixture = Fixture::new();
    fixture
        .broker
        .publish(
            &fixture.config.exchange,
            "orcid.fresh-claims",
            br#"[{"identity_id":"0000-0003-2686-9241","document_id":"2015ApJ...800....1A"}]"#,
        )
        .unwrap();

    let mut supervisor = Supervisor::new(
        fixture.config.clone(),
        fixture.broker.clone(),
        None,
    )
    .single_shot();
    {
        let log = ClaimsLog::new(fixture.db.clone());
        supervisor.register(STAGE_IMPORTER, move || {
            Ok(Box::new(ImporterStage::new(log.clone(), None)))
        });
    }
    {
        let directory = fixture.directory.clone();
        supervisor.register(STAGE_ENRICHER, move || {
            Ok(Box::new(EnricherStage::new(directory.clone())))
        });
    }
    {
        let db = fixture.db.clone();
        let min_ratio = fixture.config.min_similarity_ratio;
        supervisor.register(STAGE_MERGER, move || {
            Ok(Box::new(MergerStage::new(
                DocumentStore::new(db.clone()),
                RecordsStore::new(db.clone()),
                min_ratio,
            )))
        });
    }
    {
        let db = fixture.db.clone();
        supervisor.register(STAGE_OUTPUT, move || {
            Ok(Box::new(OutputStage::new(RecordsStore::new(db.clone()))))
        });
    }
    supervisor.start_workers().unwrap();
    supervisor.poll_loop().unwrap();

    let body = fixture.take("indexer.updates").unwrap();
    let ids: Vec<String> = serde_json::from_slice(&body).unwrap();
    assert_eq!(ids, vec!["2015ApJ...800....1A"]);
}

#[test]
fn test_failed_message_is_dead_lettered_and_acknowledged() {
    let fixture = Fixture::new();
    // a claim for a document we have no author list for
    fixture
        .broker
        .publish(
            &fixture.config.exchange,
            "orcid.updates",
            br#"{"identity_id":"0000-0003-2686-9241","document_id":"unknown-doc"}"#,
        )
        .unwrap();

    fixture.run_stage(
        STAGE_MERGER,
        Box::new(MergerStage::new(
            DocumentStore::new(fixture.db.clone()),
            RecordsStore::new(fixture.db.clone()),
            fixture.config.min_similarity_ratio,
        )),
    );

    // consumed exactly once, diverted exactly once
    assert_eq!(fixture.broker.queue_depth("orcid.updates").unwrap(), 0);
    assert_eq!(fixture.broker.recover("orcid.updates").unwrap(), 0);
    let body = fixture.take("orcid.error").unwrap();
    let envelope: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(envelope["merger"]["document_id"], "unknown-doc");
}

#[test]
fn test_blacklisted_claim_stops_at_the_enricher() {
    let fixture = Fixture::new();
    let identities = IdentityStore::new(fixture.db.clone());
    let now = Utc::now();
    identities
        .insert(IdentityRecord {
            id: 0,
            identity_id: "0000-0009".to_string(),
            display_name: "Spam, Account".to_string(),
            name_variants: BTreeMap::new(),
            account_status: AccountStatus::Blacklisted,
            linked_account_id: None,
            created: now,
            updated: now,
        })
        .unwrap();
    fixture
        .broker
        .publish(
            &fixture.config.exchange,
            "orcid.claims",
            br#"{"identity_id":"0000-0009","document_id":"2015ApJ...800....1A"}"#,
        )
        .unwrap();

    fixture.run_stage(
        STAGE_ENRICHER,
        Box::new(EnricherStage::new(fixture.directory.clone())),
    );

    // swallowed: no downstream message, no dead letter
    assert_eq!(fixture.broker.queue_depth("orcid.updates").unwrap(), 0);
    assert_eq!(fixture.broker.queue_depth("orcid.error").unwrap(), 0);
}

struct StubFeed {
    updates: Mutex<Vec<RegistryUpdate>>,
}

impl UpdatesSource for StubFeed {
    fn fetch_updates(&self, since: &DateTime<Utc>) -> Result<Vec<RegistryUpdate>> {
        let updates = self.updates.lock().unwrap();
        Ok(updates.iter().filter(|u| u.updated >= *since).cloned().collect())
    }
}

#[test]
fn test_registry_update_flows_from_feed_to_indexer() {
    let fixture = Fixture::new();
    let profile = json!({
        "orcid-profile": {
            "orcid-history": {"last-modified-date": {"value": 1_438_948_710_000i64}},
            "orcid-activities": {"orcid-works": {"orcid-work": [{
                "work-external-identifiers": {"work-external-identifier": [{
                    "work-external-identifier-type": "bibcode",
                    "work-external-identifier-id": {"value": "2015ApJ...800....1A"},
                }]},
                "last-modified-date": {"value": 1_438_948_710_000i64},
                "source": {"source-name": {"value": "registry-ui"}},
            }]}},
        }
    });
    let feed = Arc::new(StubFeed {
        updates: Mutex::new(vec![RegistryUpdate {
            identity_id: "0000-0003-2686-9241".to_string(),
            profile: Some(profile),
            updated: "2015-11-05T16:37:33.381000Z".parse().unwrap(),
        }]),
    });

    // the engine publishes where the importer stage would
    let mut engine_bus = BusClient::new(ConnectParams::for_stage(
        &fixture.config.exchange,
        fixture.config.stage(STAGE_IMPORTER).unwrap(),
    ));
    engine_bus.connect(fixture.broker.clone(), None).unwrap();
    let engine = ReconciliationEngine::new(
        ClaimsLog::new(fixture.db.clone()),
        Checkpoint::new(fixture.db.clone()),
        feed,
        engine_bus,
        Duration::from_secs(0),
        60,
        STAGE_IMPORTER,
    );
    // one marker plus one fresh claim landed in the log
    assert_eq!(engine.check_registry_updates().unwrap(), 2);
    // drained after one cycle
    assert_eq!(engine.check_registry_updates().unwrap(), 0);

    fixture.run_chain_after_import();

    let body = fixture.take("indexer.updates").unwrap();
    let ids: Vec<String> = serde_json::from_slice(&body).unwrap();
    assert_eq!(ids, vec!["2015ApJ...800....1A"]);
}
