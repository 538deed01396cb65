//! # subrelay-settings
//!
//! Configuration for the subrelay gateway, read once at startup from the
//! process environment.
//!
//! Settings come from two layers (later layers win):
//! 1. **Compiled defaults**: port `4000`, log level `info`, compact logs
//! 2. **Environment variables**: `SUBGRAPHS`, `RABBITMQ_URL`, `PORT`,
//!    `LOG_LEVEL`, `LOG_FORMAT`, `LOKI_HOST`, `RELAY_HOST`
//!
//! `SUBGRAPHS` and `RABBITMQ_URL` have no default; loading fails without them.
//!
//! # Usage
//!
//! ```no_run
//! let settings = subrelay_settings::load_settings().unwrap();
//! println!("relay port: {}", settings.relay_port());
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from};
pub use types::*;
