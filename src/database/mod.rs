//! # Database Operations
//!
//! Postgres persistence for orchestration instances.
//!
//! - [`connection`] - pool setup from `DatabaseConfig`
//! - [`migrations`] - embedded schema migrations under an advisory lock
//! - [`pg_instance_store`] - `InstanceStore` implementation over sqlx

pub mod connection;
pub mod migrations;
pub mod pg_instance_store;

pub use connection::DatabaseConnection;
pub use migrations::DatabaseMigrations;
pub use pg_instance_store::PgInstanceStore;
