pub mod binance;
pub mod hub;
pub mod mock;
pub mod symbol;

pub use binance::BinanceAdapter;
pub use hub::{Credential, CredentialSource, ExchangeHub};
pub use mock::MockExchange;
pub use symbol::normalize_symbol;
