pub mod postgres;
pub mod sqlite;
pub mod trait_def;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;
pub use trait_def::{AllocationRecord, StoreError, StoreResult, UrlStore};

#[cfg(test)]
pub use trait_def::CountingStore;
