//! Agent configuration
//!
//! Configuration is read from a TOML file and then overridden by CLI flags.

mod schema;
mod store;

pub use schema::*;
pub use store::{load_config, parse_config};
