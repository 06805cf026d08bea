//! Server module for MarketFlow
//!
//! - `config`: configuration structures
//! - `loader`: configuration loading from files and environment
//! - `validation`: configuration sanity checks
//! - `init`: engine wiring, HTTP server and shutdown sequence

pub mod config;
mod init;
mod loader;
mod validation;

pub use init::run;
pub use loader::load_config;
pub use validation::validate;
