//! Conduit: a job scheduler driving contract-tracked synchronizations.
//!
//! The binary wires [`conduit_scheduler`] and [`conduit_sync`] over one
//! SQLite database:
//! - [`db`]: persistence for every record type
//! - [`config`]: process settings and the JSON configuration file
//! - [`bootstrap`]: registries, scheduler and seeding
//! - [`daemon`]: the tick loop

pub mod bootstrap;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;

pub use bootstrap::{Engine, SeedReport};
pub use config::{ApiConfig, ConfigFile, Settings};
pub use db::Database;
pub use error::AppError;
