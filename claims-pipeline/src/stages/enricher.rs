//! Enricher stage: attach everything we know about the claiming identity
//! to the message, or drop it if the account is short-circuited.

use crate::bus::BusClient;
use crate::config::STAGE_ENRICHER;
use crate::error::Result;
use crate::identity::IdentityDirectory;
use crate::models::Payload;
use crate::stage::Stage;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

pub struct EnricherStage {
    directory: Arc<IdentityDirectory>,
}

impl EnricherStage {
    pub fn new(directory: Arc<IdentityDirectory>) -> EnricherStage {
        EnricherStage { directory }
    }
}

impl Stage for EnricherStage {
    fn name(&self) -> &str {
        STAGE_ENRICHER
    }

    fn process_payload(&mut self, payload: Payload, bus: &BusClient) -> Result<()> {
        let mut message = payload.into_one()?;
        let identity_id = message.identity_id()?.to_string();
        let record = self.directory.retrieve(&identity_id)?;

        if record.account_status.is_short_circuited() {
            // dropped on purpose, not dead-lettered
            info!(
                identity = identity_id.as_str(),
                status = ?record.account_status,
                "dropping claim from short-circuited account"
            );
            return Ok(());
        }

        message
            .extra
            .insert("display_name".to_string(), json!(record.display_name));
        for (kind, names) in &record.name_variants {
            message.extra.insert(kind.clone(), json!(names));
        }
        message
            .extra
            .insert("account_status".to_string(), json!(record.account_status));
        message.extra.insert(
            "linked_account_id".to_string(),
            json!(record.linked_account_id),
        );
        message
            .extra
            .insert("account_updated".to_string(), json!(record.updated));
        message.extra.insert("author_id".to_string(), json!(record.id));
        bus.publish(&message, None)
    }
}
