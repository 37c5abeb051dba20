//! `DataStore` adapters.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryDataStore;
pub use postgres::PostgresDataStore;
