//! Output stage: hand finished documents to the indexing system on its
//! own exchange, then stamp the record as processed.

use crate::bus::BusClient;
use crate::config::STAGE_OUTPUT;
use crate::error::Result;
use crate::models::Payload;
use crate::stage::Stage;
use crate::store::RecordsStore;
use serde_json::json;
use tracing::info;

pub struct OutputStage {
    records: RecordsStore,
}

impl OutputStage {
    pub fn new(records: RecordsStore) -> OutputStage {
        OutputStage { records }
    }
}

impl Stage for OutputStage {
    fn name(&self) -> &str {
        STAGE_OUTPUT
    }

    fn process_payload(&mut self, payload: Payload, bus: &BusClient) -> Result<()> {
        let message = payload.into_one()?;
        let document_id = message.document_id()?;
        // the indexer takes a list of document ids
        bus.forward(&json!([document_id]), None)?;
        self.records.mark_processed(document_id)?;
        info!(document = document_id, "handed off for reindexing");
        Ok(())
    }
}
