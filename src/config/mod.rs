//! Typed configuration
//!
//! `schema` defines the settings tree, `store` persists it as JSON and
//! serves lock-free snapshots.

pub mod schema;
pub mod store;

pub use schema::*;
pub use store::{ConfigChange, ConfigStore};
