//! Graph persistence

mod repository;

pub use repository::SqliteGraphStore;
