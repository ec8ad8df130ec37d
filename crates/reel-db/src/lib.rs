//! reel-db: SQLite persistence of asset status and published locators.
//!
//! Connection pooling, embedded migrations, row models and query functions.
//! The conditional `begin_processing` update is the cross-process
//! exclusion point: two processes sharing a database can never both move
//! the same asset into PROCESSING while the holder's lease is live.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;

pub use pool::{get_conn, init_memory_pool, init_pool, DbPool, PooledConnection};
