//! Steam catalog sync: crawl the store listing into a normalized Postgres
//! schema with minimal diffs, and serve read-only queries over it.

pub mod api;
pub mod cli;
pub mod database_ops;
pub mod ingest;
pub mod normalization;
pub mod tracing;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use database_ops::{CatalogStore, MemoryStore};
pub use util::db::Db;
pub use ingest::{IngestionPipeline, RunReport};
