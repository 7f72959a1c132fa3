//! Shared foundation for the Courier push-notification server:
//! typed identities, the message model, configuration, and logging.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;

pub use config::Config;
pub use error::{Error, Result};
