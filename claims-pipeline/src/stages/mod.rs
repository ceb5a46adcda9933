//! The four pipeline stages, in topology order: importer, enricher,
//! merger, output.

mod enricher;
mod importer;
mod merger;
mod output;

pub use enricher::EnricherStage;
pub use importer::ImporterStage;
pub use merger::MergerStage;
pub use output::OutputStage;
