pub mod config;
pub mod error;
pub mod types;

pub use config::DbChatConfig;
pub use error::{DbChatError, Result};
pub use types::*;
