pub mod engine;
pub mod error;
pub mod pipeline;
pub mod record;
pub mod settings;
pub mod snapshot;
pub mod source;
pub mod translator;

pub use engine::{DiffSyncEngine, SyncReport};
pub use error::{SyncError, SyncOutcome};
pub use pipeline::{IngestionPipeline, PipelineSettings, Progress, RunReport};
pub use record::RawRecord;
pub use settings::{CrawlOverrides, CrawlSettings};
pub use source::{FetchedPage, PageFetcher};
pub use translator::IdentifierTranslator;
