//! Tariffa Core Library
//!
//! This crate provides the foundational types, traits, and error handling
//! for the Tariffa rating engine. It includes:
//!
//! - Domain models (usage events, rates, plans, balances, billing cycles)
//! - Storage and collaborator traits shared by the store and service crates
//! - Unified error handling
//! - Application configuration

pub mod config;
pub mod error;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use error::{AppError, ErrorKind};

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
