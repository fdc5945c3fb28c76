//! Repository implementations
//!
//! This module contains concrete implementations of the store traits
//! defined in tariffa-core, using sqlx for PostgreSQL access.

pub mod balance_repo;
pub mod catalog_repo;
pub mod cycle_repo;
pub mod line_repo;

pub use balance_repo::PgBalanceStore;
pub use catalog_repo::PgCatalog;
pub use cycle_repo::PgCycleStore;
pub use line_repo::PgLineStore;
