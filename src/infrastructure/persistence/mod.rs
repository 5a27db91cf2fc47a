//! Persistence implementations

pub mod memory;
#[cfg(feature = "postgres")]
pub mod call_store;
#[cfg(feature = "postgres")]
pub mod database;
#[cfg(feature = "postgres")]
pub mod pg_feed;

pub use memory::MemoryCallStore;
#[cfg(feature = "postgres")]
pub use call_store::PgCallStore;
#[cfg(feature = "postgres")]
pub use database::{create_pool, run_migrations};
#[cfg(feature = "postgres")]
pub use pg_feed::PgChangeFeed;
