//! Tariffa Database Layer
//!
//! This crate provides PostgreSQL access and store implementations for the
//! Tariffa rating engine. It includes:
//!
//! - Connection pool management and migrations with sqlx
//! - Postgres stores for balances, priced lines, catalog and billing cycles
//! - In-memory stores implementing the same traits for tests and local runs

pub mod memory;
pub mod pool;
pub mod repositories;

pub use memory::{MemoryBalanceStore, MemoryCatalog, MemoryCycleStore, MemoryLineStore};
pub use pool::{create_pool, run_migrations};
pub use repositories::*;

// Re-export commonly used types
pub use sqlx::{PgPool, Postgres};
pub use tariffa_core::{AppError, AppResult};
