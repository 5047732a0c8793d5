//! Infrastructure layer
//!
//! Concrete implementations of the domain's storage seams.

pub mod graph;

pub use graph::SqliteGraphStore;
