pub mod config;
pub mod tag;
pub mod types;

pub use config::OrchConfig;
pub use tag::{Tag, TagError};
pub use types::*;
