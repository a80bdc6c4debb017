pub mod attribute;
pub mod memory;
pub mod search;
pub mod steam;
pub mod store;

pub use attribute::{AttributeKind, AttributeNames};
pub use memory::MemoryStore;
pub use store::{AssociationDelta, CatalogStore, GameUpsert, PricePoint};
