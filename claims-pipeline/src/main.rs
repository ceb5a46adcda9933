use clap::{Parser, Subcommand};
use claims_pipeline::bus::{Broker, BusClient, ConnectParams, MemoryBroker};
use claims_pipeline::config::{
    Config, STAGE_ENRICHER, STAGE_IMPORTER, STAGE_MERGER, STAGE_OUTPUT,
};
use claims_pipeline::identity::IdentityDirectory;
use claims_pipeline::importer::{import_flat_file, ReconciliationEngine};
use claims_pipeline::models::ClaimStatus;
use claims_pipeline::registry::RegistryClient;
use claims_pipeline::stages::{EnricherStage, ImporterStage, MergerStage, OutputStage};
use claims_pipeline::store::{Checkpoint, ClaimsLog, Db, DocumentStore, IdentityStore, RecordsStore};
use claims_pipeline::supervisor::{declare_topology, purge_queues, Supervisor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "claims-pipeline", about = "Registry claims synchronization pipeline")]
struct Cli {
    /// Path to a TOML configuration file; defaults apply when omitted.
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline: topology, worker fleet, reconciliation.
    Start {
        /// Process at most one message per stage instance, then exit.
        #[arg(long)]
        single_shot: bool,
    },
    /// Drop every message sitting on the pipeline queues.
    PurgeQueues,
    /// Load a tab-delimited claims file into the log.
    ImportClaims {
        file: PathBuf,
        #[arg(long, default_value = "flat-file")]
        provenance: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };

    match cli.command {
        Command::Start { single_shot } => start(config, single_shot),
        Command::PurgeQueues => {
            let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
            declare_topology(&config, &broker, None)?;
            let purged = purge_queues(&config, &broker)?;
            info!(purged, "queues purged");
            Ok(())
        }
        Command::ImportClaims { file, provenance } => {
            let db = Db::open(std::path::Path::new(&config.database_path))?;
            let inserted =
                import_flat_file(&ClaimsLog::new(db), &file, &provenance, ClaimStatus::Claimed)?;
            info!(claims = inserted.len(), "import finished");
            Ok(())
        }
    }
}

fn start(config: Config, single_shot: bool) -> anyhow::Result<()> {
    if !config.broker_url.starts_with("memory://") {
        anyhow::bail!("unsupported broker url {:?}", config.broker_url);
    }
    let db = Db::open(std::path::Path::new(&config.database_path))?;
    let log = ClaimsLog::new(db.clone());
    let checkpoint = Checkpoint::new(db.clone());
    let documents = DocumentStore::new(db.clone());
    let records = RecordsStore::new(db.clone());
    let identities = IdentityStore::new(db);

    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    declare_topology(&config, &broker, None)?;

    let registry = Arc::new(RegistryClient::new(&config.api)?);
    let directory = Arc::new(IdentityDirectory::new(
        identities,
        registry.clone(),
        config.cache.capacity,
        Duration::from_secs(config.cache.ttl_secs),
    ));

    // The engine publishes onto the importer's output topic, exactly as
    // if the claims had arrived as a batch.
    let mut engine_bus = BusClient::new(ConnectParams::for_stage(
        &config.exchange,
        config.stage(STAGE_IMPORTER)?,
    ));
    engine_bus.connect(broker.clone(), None)?;
    let engine = ReconciliationEngine::new(
        log.clone(),
        checkpoint,
        registry,
        engine_bus,
        Duration::from_secs(config.poll_interval_secs),
        config.update_window_secs,
        STAGE_IMPORTER,
    );

    let min_ratio = config.min_similarity_ratio;
    let mut supervisor = Supervisor::new(config, broker, None);
    if single_shot {
        supervisor = supervisor.single_shot();
    }
    {
        let log = log.clone();
        let engine = engine.clone();
        supervisor.register(STAGE_IMPORTER, move || {
            Ok(Box::new(ImporterStage::new(log.clone(), Some(engine.clone()))))
        });
    }
    {
        let directory = directory.clone();
        supervisor.register(STAGE_ENRICHER, move || {
            Ok(Box::new(EnricherStage::new(directory.clone())))
        });
    }
    {
        let documents = documents.clone();
        let records = records.clone();
        supervisor.register(STAGE_MERGER, move || {
            Ok(Box::new(MergerStage::new(
                documents.clone(),
                records.clone(),
                min_ratio,
            )))
        });
    }
    {
        let records = records.clone();
        supervisor.register(STAGE_OUTPUT, move || {
            Ok(Box::new(OutputStage::new(records.clone())))
        });
    }

    supervisor.start_workers()?;
    info!("pipeline running");
    supervisor.poll_loop()?;
    Ok(())
}
