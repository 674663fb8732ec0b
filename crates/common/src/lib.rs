pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use events::StreamEvent;
pub use exchange::ExchangeAdapter;
pub use types::*;
