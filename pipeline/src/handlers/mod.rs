//! One [`queue_broker::JobHandler`] per named queue (spec §6), each wrapping
//! [`crate::app::AppContext`] and performing its own idempotency-guarded,
//! transactional unit of work.

mod directory;
mod file_analysis;
mod global_resolution;
mod graph_builder;
mod reconciliation;
mod validation;

pub use directory::{DirectoryAggregationHandler, DirectoryResolutionHandler};
pub use file_analysis::FileAnalysisHandler;
pub use global_resolution::GlobalResolutionHandler;
pub use graph_builder::GraphBuilderHandler;
pub use reconciliation::ReconciliationHandler;
pub use validation::ValidationHandler;
